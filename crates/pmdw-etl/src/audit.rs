use chrono::{DateTime, Utc};
use pmdw_core::{AuditRecord, RunStatus, WarehouseTable};
use pmdw_storage::Warehouse;
use serde::Serialize;
use tracing::{debug, warn};

use crate::EtlError;

/// Row counts reported in the audit row; `None` where the run never got there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub src_time_log: Option<i64>,
    pub src_financials: Option<i64>,
    pub src_issue: Option<i64>,
    pub dst_dim_client: Option<i64>,
    pub dst_dim_team: Option<i64>,
    pub dst_dim_project: Option<i64>,
    pub dst_fact_project: Option<i64>,
}

impl RunCounts {
    /// Read destination table sizes; a table that cannot be counted stays `None`.
    pub async fn capture_destination(&mut self, warehouse: &dyn Warehouse) {
        let count = |table: WarehouseTable| async move {
            match warehouse.count_rows(table).await {
                Ok(n) => Some(n),
                Err(err) => {
                    warn!(table = table.table_name(), error = %err, "could not count warehouse rows");
                    None
                }
            }
        };
        self.dst_dim_client = count(WarehouseTable::DimClient).await;
        self.dst_dim_team = count(WarehouseTable::DimTeam).await;
        self.dst_dim_project = count(WarehouseTable::DimProject).await;
        self.dst_fact_project = count(WarehouseTable::FactProject).await;
    }
}

/// Appends `etl_audit` rows without ever failing the caller.
pub struct AuditRecorder<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> AuditRecorder<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Returns whether the row was written.
    pub async fn record(
        &self,
        run_id: DateTime<Utc>,
        counts: &RunCounts,
        duration_seconds: f64,
        status: RunStatus,
        notes: &str,
    ) -> bool {
        let record = AuditRecord {
            run_id,
            src_rows_time_log: counts.src_time_log,
            src_rows_financials: counts.src_financials,
            src_rows_issue: counts.src_issue,
            dst_rows_dim_client: counts.dst_dim_client,
            dst_rows_dim_team: counts.dst_dim_team,
            dst_rows_dim_project: counts.dst_dim_project,
            dst_rows_fact_project: counts.dst_fact_project,
            duration_seconds,
            status,
            notes: notes.to_string(),
        };
        self.write(record).await
    }

    /// Minimal ERROR row for a run that failed before any counts were known.
    pub async fn record_failure(
        &self,
        run_id: DateTime<Utc>,
        duration_seconds: f64,
        error: &EtlError,
    ) -> bool {
        self.write(AuditRecord::failed(run_id, duration_seconds, error.to_string()))
            .await
    }

    async fn write(&self, mut record: AuditRecord) -> bool {
        record.duration_seconds = record.duration_seconds.max(0.0);
        record.notes = record.notes.trim().to_string();
        if record.status == RunStatus::Error && record.notes.is_empty() {
            record.notes = "run failed without an error message".to_string();
        }

        let (run_id, status) = (record.run_id, record.status);
        match self.warehouse.record_audit(&record).await {
            Ok(()) => {
                debug!(%run_id, %status, "audit row written");
                true
            }
            Err(err) => {
                let err = EtlError::Audit(err);
                warn!(%run_id, %status, error = %err, "audit row not written");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmdw_storage::memory::{Fault, MemoryWarehouse};
    use pmdw_storage::StoreError;

    #[tokio::test]
    async fn failure_row_carries_error_text() {
        let warehouse = MemoryWarehouse::new();
        let run_id = Utc::now();
        let error = EtlError::load("inserting fact rows")(StoreError::Constraint("boom".into()));

        assert!(AuditRecorder::new(&warehouse).record_failure(run_id, 1.5, &error).await);
        let audits = warehouse.audits();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, RunStatus::Error);
        assert!(audits[0].notes.contains("boom"));
        assert_eq!(audits[0].src_rows_time_log, None);
    }

    #[tokio::test]
    async fn error_rows_never_have_empty_notes() {
        let warehouse = MemoryWarehouse::new();
        let recorder = AuditRecorder::new(&warehouse);
        recorder
            .record(Utc::now(), &RunCounts::default(), 0.0, RunStatus::Error, "   ")
            .await;
        assert!(!warehouse.audits()[0].notes.is_empty());
    }

    #[tokio::test]
    async fn unwritable_audit_is_swallowed() {
        let warehouse = MemoryWarehouse::new();
        warehouse.inject(Fault::Audit);
        let written = AuditRecorder::new(&warehouse)
            .record(Utc::now(), &RunCounts::default(), 0.2, RunStatus::Ok, "fine")
            .await;
        assert!(!written);
        assert!(warehouse.audits().is_empty());
    }

    #[tokio::test]
    async fn destination_counts_are_captured() {
        let warehouse = MemoryWarehouse::new();
        let mut counts = RunCounts::default();
        counts.capture_destination(&warehouse).await;
        assert_eq!(counts.dst_dim_client, Some(0));
        assert_eq!(counts.dst_fact_project, Some(0));
        assert_eq!(counts.src_issue, None);
    }
}
