use pmdw_core::FactRow;
use pmdw_storage::{FactReload, Warehouse};
use serde::Serialize;
use tracing::{info, warn};

use crate::EtlError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub deleted: u64,
    pub inserted: u64,
}

/// Replaces fact rows for a project set inside one warehouse transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct FactLoader;

impl FactLoader {
    /// Delete the facts of `project_ids`, then insert `rows`, committing both
    /// or neither. On failure the previous facts stay visible.
    pub async fn replace(
        &self,
        warehouse: &dyn Warehouse,
        project_ids: &[i64],
        rows: &[FactRow],
    ) -> Result<LoadReport, EtlError> {
        let mut reload = warehouse
            .begin_fact_reload()
            .await
            .map_err(EtlError::load("opening the fact reload"))?;

        let applied = Self::apply(reload.as_mut(), project_ids, rows).await;
        match applied {
            Ok(report) => {
                reload
                    .commit()
                    .await
                    .map_err(EtlError::load("committing the fact reload"))?;
                info!(deleted = report.deleted, inserted = report.inserted, "fact rows replaced");
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback) = reload.rollback().await {
                    warn!(error = %rollback, "fact reload rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        reload: &mut dyn FactReload,
        project_ids: &[i64],
        rows: &[FactRow],
    ) -> Result<LoadReport, EtlError> {
        let deleted = reload
            .delete_projects(project_ids)
            .await
            .map_err(EtlError::load("deleting stale fact rows"))?;
        let inserted = reload
            .insert_facts(rows)
            .await
            .map_err(EtlError::load("inserting fact rows"))?;
        Ok(LoadReport { deleted, inserted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmdw_core::{DateDimRow, DateKey, DimensionRecord, DimensionSpec};
    use pmdw_storage::memory::{Fault, MemoryWarehouse};

    fn fact(project_id: i64, hours: f64) -> FactRow {
        FactRow {
            project_id,
            client_id: 1,
            team_id: 1,
            start_date_id: DateKey(20240101),
            end_date_id: DateKey(20240101),
            total_hours: hours,
            total_cost: 0.0,
            total_revenue: 0.0,
            total_errors: 0,
        }
    }

    async fn seeded_warehouse() -> MemoryWarehouse {
        let warehouse = MemoryWarehouse::new();
        let day = DateDimRow::for_date(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        warehouse.insert_dates(&[day]).await.unwrap();
        for (table, key) in [("dim_client", "client_id"), ("dim_team", "team_id"), ("dim_project", "project_id")] {
            let spec = DimensionSpec {
                name: table.trim_start_matches("dim_").to_string(),
                source_query: "SELECT 1".into(),
                target_table: table.into(),
                natural_key: key.into(),
                columns: vec![key.into()],
            };
            let rows: Vec<_> = ["1", "2"]
                .iter()
                .map(|k| DimensionRecord {
                    natural_key: k.to_string(),
                    values: vec![Some(k.to_string())],
                })
                .collect();
            warehouse.insert_dimension_rows(&spec, &rows).await.unwrap();
        }
        warehouse
    }

    #[tokio::test]
    async fn replace_swaps_rows_for_the_project_set() {
        let warehouse = seeded_warehouse().await;
        warehouse.seed_fact(fact(1, 5.0));
        warehouse.seed_fact(fact(2, 7.0));

        let report = FactLoader
            .replace(&warehouse, &[1], &[fact(1, 9.0)])
            .await
            .unwrap();
        assert_eq!(report, LoadReport { deleted: 1, inserted: 1 });
        assert_eq!(warehouse.facts(), vec![fact(1, 9.0), fact(2, 7.0)]);
    }

    #[tokio::test]
    async fn failed_insert_keeps_previous_rows() {
        let warehouse = seeded_warehouse().await;
        warehouse.seed_fact(fact(1, 5.0));
        warehouse.inject(Fault::FactInsert);

        let err = FactLoader
            .replace(&warehouse, &[1], &[fact(1, 9.0)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LoadError");
        assert!(err.to_string().contains("inserting fact rows"));
        assert_eq!(warehouse.facts(), vec![fact(1, 5.0)]);
    }

    #[tokio::test]
    async fn dangling_dimension_key_aborts_the_reload() {
        let warehouse = seeded_warehouse().await;
        warehouse.seed_fact(fact(2, 7.0));
        let mut bad = fact(2, 1.0);
        bad.client_id = 42;

        let err = FactLoader
            .replace(&warehouse, &[2], &[bad])
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Load { .. }));
        assert_eq!(warehouse.facts(), vec![fact(2, 7.0)]);
    }
}
