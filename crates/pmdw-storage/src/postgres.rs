//! Postgres implementations of the source and warehouse stores.

use std::collections::BTreeSet;

use async_trait::async_trait;
use pmdw_core::{
    AuditRecord, DateDimRow, DateKey, DimensionRecord, DimensionSpec, FactRow, FinancialRecord,
    IssueRecord, ModelParam, ProjectRecord, ProjectScope, SourceRelation, TimeLogRecord,
    WarehouseTable,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{FactReload, SourceStore, StoreError, Warehouse};

/// Rows per multi-VALUES insert, well under the 65535 bind limit.
const INSERT_CHUNK: usize = 1_000;

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn decode_all<T>(
    rows: &[PgRow],
    context: &str,
    f: impl Fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(f)
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::query(format!("decoding {context}")))
}

#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn projects(&self, scope: &ProjectScope) -> Result<Vec<ProjectRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT project_id::bigint AS project_id,
                   project_name::text AS project_name,
                   start_date::text   AS start_date,
                   end_date::text     AS end_date,
                   client_id::bigint  AS client_id,
                   team_id::bigint    AS team_id,
                   budget::float8     AS budget,
                   priority::text     AS priority
              FROM project
             WHERE ($1::bigint[] IS NULL OR project_id = ANY($1))
             ORDER BY project_id
            "#,
        )
        .bind(scope.ids())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("reading source projects"))?;

        decode_all(&rows, "source projects", |row| {
            Ok(ProjectRecord {
                project_id: row.try_get("project_id")?,
                project_name: row.try_get("project_name")?,
                start_date: row.try_get("start_date")?,
                end_date: row.try_get("end_date")?,
                client_id: row.try_get("client_id")?,
                team_id: row.try_get("team_id")?,
                budget: row.try_get("budget")?,
                priority: row.try_get("priority")?,
            })
        })
    }

    async fn time_logs(&self, scope: &ProjectScope) -> Result<Vec<TimeLogRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT project_id::bigint  AS project_id,
                   employee_id::bigint AS employee_id,
                   hours::float8       AS hours,
                   cost::float8        AS cost,
                   log_date::date      AS log_date
              FROM time_log
             WHERE ($1::bigint[] IS NULL OR project_id = ANY($1))
             ORDER BY project_id, log_date, employee_id
            "#,
        )
        .bind(scope.ids())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("reading source time_log"))?;

        decode_all(&rows, "source time_log", |row| {
            Ok(TimeLogRecord {
                project_id: row.try_get("project_id")?,
                employee_id: row.try_get("employee_id")?,
                hours: row.try_get("hours")?,
                cost: row.try_get("cost")?,
                log_date: row.try_get("log_date")?,
            })
        })
    }

    async fn financials(&self, scope: &ProjectScope) -> Result<Vec<FinancialRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT project_id::bigint   AS project_id,
                   amount::float8       AS amount,
                   "type"::text         AS kind,
                   date_recorded::date  AS date_recorded
              FROM financials
             WHERE ($1::bigint[] IS NULL OR project_id = ANY($1))
             ORDER BY project_id, date_recorded
            "#,
        )
        .bind(scope.ids())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("reading source financials"))?;

        decode_all(&rows, "source financials", |row| {
            Ok(FinancialRecord {
                project_id: row.try_get("project_id")?,
                amount: row.try_get("amount")?,
                kind: row.try_get("kind")?,
                date_recorded: row.try_get("date_recorded")?,
            })
        })
    }

    async fn issues(&self, scope: &ProjectScope) -> Result<Vec<IssueRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT project_id::bigint  AS project_id,
                   severity::text      AS severity,
                   date_reported::date AS date_reported
              FROM issue
             WHERE ($1::bigint[] IS NULL OR project_id = ANY($1))
             ORDER BY project_id, date_reported
            "#,
        )
        .bind(scope.ids())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("reading source issue"))?;

        decode_all(&rows, "source issue", |row| {
            Ok(IssueRecord {
                project_id: row.try_get("project_id")?,
                severity: row.try_get("severity")?,
                date_reported: row.try_get("date_reported")?,
            })
        })
    }

    async fn dimension_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRecord>, StoreError> {
        let context = format!("reading source rows for dimension `{}`", spec.name);
        spec.validate().map_err(|detail| StoreError::UnexpectedShape {
            context: context.clone(),
            detail,
        })?;
        let key_index = spec.key_index().unwrap_or_default();

        let select_list = spec
            .columns
            .iter()
            .map(|c| format!("src.{q}::text AS {q}", q = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {select_list} FROM ({}) AS src ORDER BY src.{}",
            spec.source_query.trim().trim_end_matches(';'),
            quote_ident(&spec.natural_key)
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::query(context.clone()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..spec.columns.len())
                .map(|idx| row.try_get::<Option<String>, _>(idx))
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::query(context.clone()))?;
            let natural_key = values[key_index].clone().ok_or_else(|| StoreError::UnexpectedShape {
                context: context.clone(),
                detail: format!("null natural key `{}`", spec.natural_key),
            })?;
            out.push(DimensionRecord { natural_key, values });
        }
        Ok(out)
    }

    async fn count_rows(&self, relation: SourceRelation) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", relation.table_name());
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query(format!("counting source {}", relation.table_name())))
    }

    async fn database_name(&self) -> Result<String, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT current_database()")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query("reading source database name"))
    }
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn date_keys_between(
        &self,
        from: DateKey,
        to: DateKey,
    ) -> Result<BTreeSet<DateKey>, StoreError> {
        let keys = sqlx::query_scalar::<_, i32>(
            "SELECT date_id FROM dim_date WHERE date_id BETWEEN $1 AND $2",
        )
        .bind(from.value())
        .bind(to.value())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("reading dim_date keys"))?;
        Ok(keys.into_iter().map(DateKey).collect())
    }

    async fn insert_dates(&self, rows: &[DateDimRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::query("opening dim_date transaction"))?;
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO dim_date (date_id, full_date, year, quarter, month, day, weekday) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.date_id.value())
                    .push_bind(row.full_date)
                    .push_bind(row.year)
                    .push_bind(row.quarter)
                    .push_bind(row.month)
                    .push_bind(row.day)
                    .push_bind(row.weekday.clone());
            });
            qb.push(" ON CONFLICT (date_id) DO NOTHING");
            inserted += qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(StoreError::query("inserting dim_date rows"))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(StoreError::query("committing dim_date rows"))?;
        Ok(inserted)
    }

    async fn natural_keys(&self, spec: &DimensionSpec) -> Result<BTreeSet<String>, StoreError> {
        let sql = format!(
            "SELECT {}::text FROM {}",
            quote_ident(&spec.natural_key),
            quote_ident(&spec.target_table)
        );
        let keys = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::query(format!("reading keys of {}", spec.target_table)))?;
        Ok(keys.into_iter().collect())
    }

    async fn insert_dimension_rows(
        &self,
        spec: &DimensionSpec,
        rows: &[DimensionRecord],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let payload = rows
            .iter()
            .map(|row| {
                let object = spec
                    .columns
                    .iter()
                    .zip(&row.values)
                    .map(|(col, value)| {
                        let value = value.clone().map(JsonValue::String).unwrap_or(JsonValue::Null);
                        (col.clone(), value)
                    })
                    .collect::<serde_json::Map<_, _>>();
                JsonValue::Object(object)
            })
            .collect::<Vec<_>>();

        let table = quote_ident(&spec.target_table);
        let columns = spec
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        // jsonb_populate_recordset casts each text value to the target column type.
        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1) \
             ON CONFLICT ({}) DO NOTHING",
            quote_ident(&spec.natural_key)
        );
        let result = sqlx::query(&sql)
            .bind(JsonValue::Array(payload))
            .execute(&self.pool)
            .await
            .map_err(StoreError::query(format!("inserting into {}", spec.target_table)))?;
        Ok(result.rows_affected())
    }

    async fn begin_fact_reload(&self) -> Result<Box<dyn FactReload>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::query("opening fact reload transaction"))?;
        Ok(Box::new(PgFactReload { tx }))
    }

    async fn fact_rows(&self, scope: &ProjectScope) -> Result<Vec<FactRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, client_id, team_id, start_date_id, end_date_id,
                   total_hours, total_cost, total_revenue, total_errors
              FROM fact_project
             WHERE ($1::bigint[] IS NULL OR project_id = ANY($1))
             ORDER BY project_id
            "#,
        )
        .bind(scope.ids())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("reading fact_project"))?;

        decode_all(&rows, "fact_project", |row| {
            Ok(FactRow {
                project_id: row.try_get("project_id")?,
                client_id: row.try_get("client_id")?,
                team_id: row.try_get("team_id")?,
                start_date_id: DateKey(row.try_get("start_date_id")?),
                end_date_id: DateKey(row.try_get("end_date_id")?),
                total_hours: row.try_get("total_hours")?,
                total_cost: row.try_get("total_cost")?,
                total_revenue: row.try_get("total_revenue")?,
                total_errors: row.try_get("total_errors")?,
            })
        })
    }

    async fn count_rows(&self, table: WarehouseTable) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.table_name());
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query(format!("counting {}", table.table_name())))
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO etl_audit (
                run_id, src_rows_time_log, src_rows_financials, src_rows_issue,
                dst_rows_dim_client, dst_rows_dim_team, dst_rows_dim_project,
                dst_rows_fact_project, duration_seconds, status, notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.run_id)
        .bind(record.src_rows_time_log)
        .bind(record.src_rows_financials)
        .bind(record.src_rows_issue)
        .bind(record.dst_rows_dim_client)
        .bind(record.dst_rows_dim_team)
        .bind(record.dst_rows_dim_project)
        .bind(record.dst_rows_fact_project)
        .bind(record.duration_seconds)
        .bind(record.status.as_str())
        .bind(&record.notes)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("inserting etl_audit row"))?;
        Ok(())
    }

    async fn latest_model_param(
        &self,
        model_name: &str,
        param_name: &str,
    ) -> Result<Option<ModelParam>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT model_name, param_name, param_value, trained_at
              FROM model_params
             WHERE model_name = $1 AND param_name = $2
             ORDER BY trained_at DESC
             LIMIT 1
            "#,
        )
        .bind(model_name)
        .bind(param_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::query("reading model_params"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let param = decode_all(std::slice::from_ref(&row), "model_params", |row| {
            Ok(ModelParam {
                model_name: row.try_get("model_name")?,
                param_name: row.try_get("param_name")?,
                param_value: row.try_get("param_value")?,
                trained_at: row.try_get("trained_at")?,
            })
        })?;
        Ok(param.into_iter().next())
    }

    async fn store_model_param(&self, param: &ModelParam) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::query("opening model_params transaction"))?;
        sqlx::query("DELETE FROM model_params WHERE model_name = $1 AND param_name = $2")
            .bind(&param.model_name)
            .bind(&param.param_name)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::query("clearing model_params"))?;
        sqlx::query(
            "INSERT INTO model_params (model_name, param_name, param_value, trained_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&param.model_name)
        .bind(&param.param_name)
        .bind(param.param_value)
        .bind(param.trained_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("inserting model_params row"))?;
        tx.commit()
            .await
            .map_err(StoreError::query("committing model_params"))?;
        Ok(())
    }

    async fn database_name(&self) -> Result<String, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT current_database()")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query("reading warehouse database name"))
    }
}

/// Fact reload backed by one Postgres transaction; sqlx rolls it back on drop.
pub struct PgFactReload {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl FactReload for PgFactReload {
    async fn delete_projects(&mut self, project_ids: &[i64]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM fact_project WHERE project_id = ANY($1)")
            .bind(project_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::query("deleting fact_project rows"))?;
        debug!(deleted = result.rows_affected(), "fact rows deleted");
        Ok(result.rows_affected())
    }

    async fn insert_facts(&mut self, rows: &[FactRow]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO fact_project (project_id, client_id, team_id, start_date_id, end_date_id, \
                 total_hours, total_cost, total_revenue, total_errors) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.project_id)
                    .push_bind(row.client_id)
                    .push_bind(row.team_id)
                    .push_bind(row.start_date_id.value())
                    .push_bind(row.end_date_id.value())
                    .push_bind(row.total_hours)
                    .push_bind(row.total_cost)
                    .push_bind(row.total_revenue)
                    .push_bind(row.total_errors);
            });
            inserted += qb
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(StoreError::query("inserting fact_project rows"))?
                .rows_affected();
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgFactReload { tx } = *self;
        tx.commit()
            .await
            .map_err(StoreError::query("committing fact reload"))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PgFactReload { tx } = *self;
        tx.rollback()
            .await
            .map_err(StoreError::query("rolling back fact reload"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_ident("dim_client"), "\"dim_client\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
