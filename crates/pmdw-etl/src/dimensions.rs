//! Reference dimension loading.
//!
//! The shipped policy is insert-only: a natural key already in the warehouse
//! keeps the attributes it was first loaded with, so later changes to a
//! client, team or project in the source do not reach existing rows.

use std::collections::BTreeSet;

use pmdw_core::{DimensionRecord, DimensionSpec};
use pmdw_storage::{SourceStore, Warehouse};
use serde::Serialize;
use tracing::{debug, info};

use crate::EtlError;

/// Decides which source rows of a dimension get written.
pub trait DimensionSyncPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, source_rows: Vec<DimensionRecord>, existing: &BTreeSet<String>)
        -> Vec<DimensionRecord>;
}

/// Write rows whose natural key is absent; never touch existing rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsertAbsentOnly;

impl DimensionSyncPolicy for InsertAbsentOnly {
    fn name(&self) -> &'static str {
        "insert-absent-only"
    }

    fn select(
        &self,
        source_rows: Vec<DimensionRecord>,
        existing: &BTreeSet<String>,
    ) -> Vec<DimensionRecord> {
        let mut seen = BTreeSet::new();
        source_rows
            .into_iter()
            .filter(|row| !existing.contains(&row.natural_key))
            .filter(|row| seen.insert(row.natural_key.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DimensionSyncReport {
    pub dimension: String,
    pub target_table: String,
    pub source_rows: usize,
    pub inserted: u64,
}

/// Source rows of one dimension, read before anything is written.
#[derive(Debug, Clone)]
pub struct DimensionBatch {
    pub spec: DimensionSpec,
    pub rows: Vec<DimensionRecord>,
}

pub struct DimensionUpserter {
    policy: Box<dyn DimensionSyncPolicy>,
}

impl Default for DimensionUpserter {
    fn default() -> Self {
        Self::new(Box::new(InsertAbsentOnly))
    }
}

impl DimensionUpserter {
    pub fn new(policy: Box<dyn DimensionSyncPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub async fn read(
        &self,
        source: &dyn SourceStore,
        spec: &DimensionSpec,
    ) -> Result<DimensionBatch, EtlError> {
        spec.validate().map_err(EtlError::Configuration)?;
        let rows = source
            .dimension_rows(spec)
            .await
            .map_err(EtlError::dimension(&spec.name))?;
        debug!(dimension = %spec.name, rows = rows.len(), "dimension read");
        Ok(DimensionBatch {
            spec: spec.clone(),
            rows,
        })
    }

    /// Read every dimension; the first failure stops the rest.
    pub async fn read_all(
        &self,
        source: &dyn SourceStore,
        specs: &[DimensionSpec],
    ) -> Result<Vec<DimensionBatch>, EtlError> {
        let mut batches = Vec::with_capacity(specs.len());
        for spec in specs {
            batches.push(self.read(source, spec).await?);
        }
        Ok(batches)
    }

    pub async fn load(
        &self,
        warehouse: &dyn Warehouse,
        batch: DimensionBatch,
    ) -> Result<DimensionSyncReport, EtlError> {
        let DimensionBatch { spec, rows } = batch;
        let source_rows = rows.len();
        let existing = warehouse
            .natural_keys(&spec)
            .await
            .map_err(EtlError::dimension(&spec.name))?;

        let selected = self.policy.select(rows, &existing);
        let inserted = if selected.is_empty() {
            0
        } else {
            warehouse
                .insert_dimension_rows(&spec, &selected)
                .await
                .map_err(EtlError::dimension(&spec.name))?
        };

        debug!(dimension = %spec.name, policy = self.policy.name(), existing = existing.len(), "dimension compared");
        info!(
            dimension = %spec.name,
            table = %spec.target_table,
            source_rows,
            inserted,
            "dimension synced"
        );
        Ok(DimensionSyncReport {
            dimension: spec.name,
            target_table: spec.target_table,
            source_rows,
            inserted,
        })
    }

    /// Load batches in order; the first failure stops the rest.
    pub async fn load_all(
        &self,
        warehouse: &dyn Warehouse,
        batches: Vec<DimensionBatch>,
    ) -> Result<Vec<DimensionSyncReport>, EtlError> {
        let mut reports = Vec::with_capacity(batches.len());
        for batch in batches {
            reports.push(self.load(warehouse, batch).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_dimensions;
    use pmdw_core::{ClientRecord, SourceRelation, TeamRecord};
    use pmdw_storage::memory::{Fault, MemorySource, MemoryWarehouse};

    fn client(id: i64, name: &str) -> ClientRecord {
        ClientRecord {
            client_id: id,
            client_name: Some(name.to_string()),
            industry: None,
            tier: None,
        }
    }

    fn source() -> MemorySource {
        MemorySource {
            clients: vec![client(1, "Acme"), client(2, "Globex")],
            teams: vec![TeamRecord {
                team_id: 10,
                team_name: Some("Platform".into()),
                description: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn default_upserter_uses_insert_absent_only() {
        assert_eq!(DimensionUpserter::default().policy_name(), "insert-absent-only");
    }

    #[test]
    fn policy_skips_existing_and_duplicate_keys() {
        let row = |key: &str, name: &str| DimensionRecord {
            natural_key: key.to_string(),
            values: vec![Some(key.to_string()), Some(name.to_string())],
        };
        let existing: BTreeSet<String> = ["1".to_string()].into_iter().collect();
        let selected = InsertAbsentOnly.select(
            vec![row("1", "Acme v2"), row("2", "Globex"), row("2", "Globex dup")],
            &existing,
        );
        assert_eq!(selected, vec![row("2", "Globex")]);
    }

    #[tokio::test]
    async fn second_sync_changes_nothing() {
        let source = source();
        let warehouse = MemoryWarehouse::new();
        let upserter = DimensionUpserter::default();
        let specs = default_dimensions();

        let batches = upserter.read_all(&source, &specs).await.unwrap();
        let first = upserter.load_all(&warehouse, batches).await.unwrap();
        assert_eq!(first.iter().map(|r| r.inserted).collect::<Vec<_>>(), vec![2, 1, 0]);
        let snapshot = warehouse.dimension("dim_client");

        let batches = upserter.read_all(&source, &specs).await.unwrap();
        let second = upserter.load_all(&warehouse, batches).await.unwrap();
        assert!(second.iter().all(|r| r.inserted == 0));
        assert_eq!(warehouse.dimension("dim_client"), snapshot);
    }

    #[tokio::test]
    async fn source_attribute_changes_do_not_overwrite() {
        let mut source = source();
        let warehouse = MemoryWarehouse::new();
        let upserter = DimensionUpserter::default();
        let spec = &default_dimensions()[0];
        let batch = upserter.read(&source, spec).await.unwrap();
        upserter.load(&warehouse, batch).await.unwrap();

        source.clients[0].client_name = Some("Acme Renamed".into());
        source.clients.push(client(3, "Initech"));
        let batch = upserter.read(&source, spec).await.unwrap();
        let report = upserter.load(&warehouse, batch).await.unwrap();
        assert_eq!(report.inserted, 1);

        let rows = warehouse.dimension("dim_client");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].values[1].as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn empty_source_is_not_an_error() {
        let upserter = DimensionUpserter::default();
        let batch = upserter
            .read(&MemorySource::new(), &default_dimensions()[1])
            .await
            .unwrap();
        let report = upserter.load(&MemoryWarehouse::new(), batch).await.unwrap();
        assert_eq!((report.source_rows, report.inserted), (0, 0));
    }

    #[tokio::test]
    async fn failures_name_the_dimension() {
        let mut source = source();
        source.fail_reads_of(SourceRelation::Team);
        let upserter = DimensionUpserter::default();
        let err = upserter
            .read_all(&source, &default_dimensions())
            .await
            .unwrap_err();
        assert!(matches!(&err, EtlError::Dimension { dimension, .. } if dimension == "team"));

        let warehouse = MemoryWarehouse::new();
        warehouse.inject(Fault::DimensionInsert);
        let batch = upserter
            .read(&self::source(), &default_dimensions()[1])
            .await
            .unwrap();
        let err = upserter.load(&warehouse, batch).await.unwrap_err();
        assert_eq!(err.kind(), "DimensionError");
    }
}
