//! In-memory stores used as fake connections in tests.
//!
//! `MemoryWarehouse` enforces the same keys the Postgres schema declares
//! (fact foreign keys, primary keys) and can be told to fail specific steps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use pmdw_core::{
    AuditRecord, ClientRecord, DateDimRow, DateKey, DimensionRecord, DimensionSpec, FactRow,
    FinancialRecord, IssueRecord, ModelParam, ProjectRecord, ProjectScope, SourceRelation,
    TeamRecord, TimeLogRecord, WarehouseTable,
};

use crate::{FactReload, SourceStore, StoreError, Warehouse};

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub clients: Vec<ClientRecord>,
    pub teams: Vec<TeamRecord>,
    pub employee_count: i64,
    pub projects: Vec<ProjectRecord>,
    pub time_logs: Vec<TimeLogRecord>,
    pub financials: Vec<FinancialRecord>,
    pub issues: Vec<IssueRecord>,
    /// Relations whose reads fail with `StoreError::Injected`.
    pub failing_reads: BTreeSet<SourceRelation>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent read of `relation` fails.
    pub fn fail_reads_of(&mut self, relation: SourceRelation) {
        self.failing_reads.insert(relation);
    }

    fn check(&self, relation: SourceRelation) -> Result<(), StoreError> {
        if self.failing_reads.contains(&relation) {
            return Err(StoreError::Injected(format!(
                "injected read failure on {}",
                relation.table_name()
            )));
        }
        Ok(())
    }
}

fn client_column(row: &ClientRecord, column: &str) -> Option<Option<String>> {
    match column {
        "client_id" => Some(Some(row.client_id.to_string())),
        "client_name" => Some(row.client_name.clone()),
        "industry" => Some(row.industry.clone()),
        "tier" => Some(row.tier.clone()),
        _ => None,
    }
}

fn team_column(row: &TeamRecord, column: &str) -> Option<Option<String>> {
    match column {
        "team_id" => Some(Some(row.team_id.to_string())),
        "team_name" => Some(row.team_name.clone()),
        "description" => Some(row.description.clone()),
        _ => None,
    }
}

fn project_column(row: &ProjectRecord, column: &str) -> Option<Option<String>> {
    match column {
        "project_id" => Some(Some(row.project_id.to_string())),
        "project_name" => Some(row.project_name.clone()),
        "start_date" => Some(row.start_date.clone()),
        "end_date" => Some(row.end_date.clone()),
        "client_id" => Some(Some(row.client_id.to_string())),
        "team_id" => Some(Some(row.team_id.to_string())),
        "budget" => Some(row.budget.map(|b| b.to_string())),
        "priority" => Some(row.priority.clone()),
        _ => None,
    }
}

fn project_dimension<T>(
    spec: &DimensionSpec,
    rows: &[(i64, &T)],
    column: impl Fn(&T, &str) -> Option<Option<String>>,
) -> Result<Vec<DimensionRecord>, StoreError> {
    let context = format!("reading source rows for dimension `{}`", spec.name);
    let key_index = spec.key_index().ok_or_else(|| StoreError::UnexpectedShape {
        context: context.clone(),
        detail: format!("natural key `{}` is not a column", spec.natural_key),
    })?;
    let mut rows = rows.to_vec();
    rows.sort_by_key(|(id, _)| *id);

    let mut out = Vec::with_capacity(rows.len());
    for (_, row) in rows {
        let values = spec
            .columns
            .iter()
            .map(|c| {
                column(row, c).ok_or_else(|| StoreError::UnexpectedShape {
                    context: context.clone(),
                    detail: format!("unknown column `{c}`"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let natural_key = values[key_index].clone().ok_or_else(|| StoreError::UnexpectedShape {
            context: context.clone(),
            detail: format!("null natural key `{}`", spec.natural_key),
        })?;
        out.push(DimensionRecord { natural_key, values });
    }
    Ok(out)
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn projects(&self, scope: &ProjectScope) -> Result<Vec<ProjectRecord>, StoreError> {
        self.check(SourceRelation::Project)?;
        let mut rows: Vec<_> = self
            .projects
            .iter()
            .filter(|p| scope.contains(p.project_id))
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.project_id);
        Ok(rows)
    }

    async fn time_logs(&self, scope: &ProjectScope) -> Result<Vec<TimeLogRecord>, StoreError> {
        self.check(SourceRelation::TimeLog)?;
        Ok(self
            .time_logs
            .iter()
            .filter(|t| scope.contains(t.project_id))
            .cloned()
            .collect())
    }

    async fn financials(&self, scope: &ProjectScope) -> Result<Vec<FinancialRecord>, StoreError> {
        self.check(SourceRelation::Financials)?;
        Ok(self
            .financials
            .iter()
            .filter(|f| scope.contains(f.project_id))
            .cloned()
            .collect())
    }

    async fn issues(&self, scope: &ProjectScope) -> Result<Vec<IssueRecord>, StoreError> {
        self.check(SourceRelation::Issue)?;
        Ok(self
            .issues
            .iter()
            .filter(|i| scope.contains(i.project_id))
            .cloned()
            .collect())
    }

    async fn dimension_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRecord>, StoreError> {
        match spec.name.as_str() {
            "client" => {
                self.check(SourceRelation::Client)?;
                let rows: Vec<_> = self.clients.iter().map(|c| (c.client_id, c)).collect();
                project_dimension(spec, &rows, client_column)
            }
            "team" => {
                self.check(SourceRelation::Team)?;
                let rows: Vec<_> = self.teams.iter().map(|t| (t.team_id, t)).collect();
                project_dimension(spec, &rows, team_column)
            }
            "project" => {
                self.check(SourceRelation::Project)?;
                let rows: Vec<_> = self.projects.iter().map(|p| (p.project_id, p)).collect();
                project_dimension(spec, &rows, project_column)
            }
            other => Err(StoreError::UnexpectedShape {
                context: format!("reading source rows for dimension `{other}`"),
                detail: "no in-memory relation backs this dimension".to_string(),
            }),
        }
    }

    async fn count_rows(&self, relation: SourceRelation) -> Result<i64, StoreError> {
        self.check(relation)?;
        let count = match relation {
            SourceRelation::Client => self.clients.len(),
            SourceRelation::Team => self.teams.len(),
            SourceRelation::Employee => return Ok(self.employee_count),
            SourceRelation::Project => self.projects.len(),
            SourceRelation::TimeLog => self.time_logs.len(),
            SourceRelation::Financials => self.financials.len(),
            SourceRelation::Issue => self.issues.len(),
        };
        Ok(count as i64)
    }

    async fn database_name(&self) -> Result<String, StoreError> {
        Ok("memory-source".to_string())
    }
}

/// Warehouse steps that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fault {
    Schema,
    DateInsert,
    DimensionInsert,
    FactDelete,
    FactInsert,
    Audit,
}

#[derive(Debug, Default)]
struct WarehouseState {
    dates: BTreeMap<DateKey, DateDimRow>,
    dimensions: BTreeMap<String, BTreeMap<String, DimensionRecord>>,
    facts: BTreeMap<i64, FactRow>,
    audits: Vec<AuditRecord>,
    model_params: Vec<ModelParam>,
    faults: BTreeSet<Fault>,
}

impl WarehouseState {
    fn fail_if(&self, fault: Fault) -> Result<(), StoreError> {
        if self.faults.contains(&fault) {
            return Err(StoreError::Injected(format!("injected warehouse failure: {fault:?}")));
        }
        Ok(())
    }

    fn has_dimension_key(&self, table: &str, key: i64) -> bool {
        self.dimensions
            .get(table)
            .is_some_and(|rows| rows.contains_key(&key.to_string()))
    }

    fn check_fact_keys(&self, row: &FactRow) -> Result<(), StoreError> {
        let violations = [
            ("dim_project", self.has_dimension_key("dim_project", row.project_id)),
            ("dim_client", self.has_dimension_key("dim_client", row.client_id)),
            ("dim_team", self.has_dimension_key("dim_team", row.team_id)),
            ("dim_date", self.dates.contains_key(&row.start_date_id)),
            ("dim_date", self.dates.contains_key(&row.end_date_id)),
        ];
        if let Some((table, _)) = violations.iter().find(|(_, ok)| !ok) {
            return Err(StoreError::Constraint(format!(
                "fact_project row for project {} references a missing {table} row",
                row.project_id
            )));
        }
        Ok(())
    }
}

/// Shared-state warehouse; clones observe the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WarehouseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.insert(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn dates(&self) -> Vec<DateDimRow> {
        self.lock().dates.values().cloned().collect()
    }

    pub fn dimension(&self, table: &str) -> Vec<DimensionRecord> {
        self.lock()
            .dimensions
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn facts(&self) -> Vec<FactRow> {
        self.lock().facts.values().cloned().collect()
    }

    pub fn audits(&self) -> Vec<AuditRecord> {
        self.lock().audits.clone()
    }

    pub fn model_params(&self) -> Vec<ModelParam> {
        self.lock().model_params.clone()
    }

    /// Place a fact row directly, bypassing key checks.
    pub fn seed_fact(&self, row: FactRow) {
        self.lock().facts.insert(row.project_id, row);
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.lock().fail_if(Fault::Schema)
    }

    async fn date_keys_between(
        &self,
        from: DateKey,
        to: DateKey,
    ) -> Result<BTreeSet<DateKey>, StoreError> {
        if from > to {
            return Ok(BTreeSet::new());
        }
        Ok(self.lock().dates.range(from..=to).map(|(k, _)| *k).collect())
    }

    async fn insert_dates(&self, rows: &[DateDimRow]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        state.fail_if(Fault::DateInsert)?;
        let mut inserted = 0;
        for row in rows {
            if !state.dates.contains_key(&row.date_id) {
                state.dates.insert(row.date_id, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn natural_keys(&self, spec: &DimensionSpec) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .lock()
            .dimensions
            .get(&spec.target_table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_dimension_rows(
        &self,
        spec: &DimensionSpec,
        rows: &[DimensionRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        state.fail_if(Fault::DimensionInsert)?;
        let table = state.dimensions.entry(spec.target_table.clone()).or_default();
        let mut inserted = 0;
        for row in rows {
            if !table.contains_key(&row.natural_key) {
                table.insert(row.natural_key.clone(), row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn begin_fact_reload(&self) -> Result<Box<dyn FactReload>, StoreError> {
        let staged = self.lock().facts.clone();
        Ok(Box::new(MemoryFactReload {
            warehouse: self.clone(),
            staged,
        }))
    }

    async fn fact_rows(&self, scope: &ProjectScope) -> Result<Vec<FactRow>, StoreError> {
        Ok(self
            .lock()
            .facts
            .values()
            .filter(|f| scope.contains(f.project_id))
            .cloned()
            .collect())
    }

    async fn count_rows(&self, table: WarehouseTable) -> Result<i64, StoreError> {
        let state = self.lock();
        let count = match table {
            WarehouseTable::DimDate => state.dates.len(),
            WarehouseTable::FactProject => state.facts.len(),
            WarehouseTable::EtlAudit => state.audits.len(),
            WarehouseTable::ModelParams => state.model_params.len(),
            dim => state
                .dimensions
                .get(dim.table_name())
                .map(BTreeMap::len)
                .unwrap_or_default(),
        };
        Ok(count as i64)
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.fail_if(Fault::Audit)?;
        if state.audits.iter().any(|a| a.run_id == record.run_id) {
            return Err(StoreError::Constraint(format!(
                "duplicate etl_audit run_id {}",
                record.run_id
            )));
        }
        state.audits.push(record.clone());
        Ok(())
    }

    async fn latest_model_param(
        &self,
        model_name: &str,
        param_name: &str,
    ) -> Result<Option<ModelParam>, StoreError> {
        Ok(self
            .lock()
            .model_params
            .iter()
            .filter(|p| p.model_name == model_name && p.param_name == param_name)
            .max_by_key(|p| p.trained_at)
            .cloned())
    }

    async fn store_model_param(&self, param: &ModelParam) -> Result<(), StoreError> {
        let mut state = self.lock();
        state
            .model_params
            .retain(|p| !(p.model_name == param.model_name && p.param_name == param.param_name));
        state.model_params.push(param.clone());
        Ok(())
    }

    async fn database_name(&self) -> Result<String, StoreError> {
        Ok("memory-warehouse".to_string())
    }
}

/// Works on a private copy of the fact table that replaces the shared one on commit.
struct MemoryFactReload {
    warehouse: MemoryWarehouse,
    staged: BTreeMap<i64, FactRow>,
}

#[async_trait]
impl FactReload for MemoryFactReload {
    async fn delete_projects(&mut self, project_ids: &[i64]) -> Result<u64, StoreError> {
        self.warehouse.lock().fail_if(Fault::FactDelete)?;
        let deleted = project_ids
            .iter()
            .filter(|id| self.staged.remove(id).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn insert_facts(&mut self, rows: &[FactRow]) -> Result<u64, StoreError> {
        let state = self.warehouse.lock();
        state.fail_if(Fault::FactInsert)?;
        for row in rows {
            state.check_fact_keys(row)?;
            if self.staged.contains_key(&row.project_id) {
                return Err(StoreError::Constraint(format!(
                    "duplicate fact_project key {}",
                    row.project_id
                )));
            }
            self.staged.insert(row.project_id, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryFactReload { warehouse, staged } = *self;
        warehouse.lock().facts = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(project_id: i64) -> FactRow {
        FactRow {
            project_id,
            client_id: 1,
            team_id: 1,
            start_date_id: DateKey(20240101),
            end_date_id: DateKey(20240101),
            total_hours: 1.0,
            total_cost: 2.0,
            total_revenue: 3.0,
            total_errors: 0,
        }
    }

    #[tokio::test]
    async fn uncommitted_reload_leaves_facts_untouched() {
        let warehouse = MemoryWarehouse::new();
        warehouse.seed_fact(fact(7));

        let mut reload = warehouse.begin_fact_reload().await.unwrap();
        assert_eq!(reload.delete_projects(&[7]).await.unwrap(), 1);
        assert_eq!(warehouse.facts().len(), 1, "readers still see the old row");
        reload.rollback().await.unwrap();

        assert_eq!(warehouse.facts(), vec![fact(7)]);
    }

    #[tokio::test]
    async fn fact_insert_enforces_foreign_keys() {
        let warehouse = MemoryWarehouse::new();
        let mut reload = warehouse.begin_fact_reload().await.unwrap();
        let err = reload.insert_facts(&[fact(1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn injected_faults_fail_the_named_step() {
        let warehouse = MemoryWarehouse::new();
        warehouse.inject(Fault::Audit);
        let record = AuditRecord::failed(chrono::Utc::now(), 0.1, "boom");
        assert!(warehouse.record_audit(&record).await.is_err());

        warehouse.clear_faults();
        warehouse.record_audit(&record).await.unwrap();
        assert_eq!(warehouse.audits().len(), 1);
    }

    #[tokio::test]
    async fn memory_source_projects_dimension_columns() {
        let source = MemorySource {
            clients: vec![
                ClientRecord {
                    client_id: 2,
                    client_name: Some("Beta".into()),
                    industry: None,
                    tier: Some("gold".into()),
                },
                ClientRecord {
                    client_id: 1,
                    client_name: Some("Acme".into()),
                    industry: Some("retail".into()),
                    tier: None,
                },
            ],
            ..Default::default()
        };
        let spec = DimensionSpec {
            name: "client".into(),
            source_query: "SELECT client_id, client_name, tier FROM client".into(),
            target_table: "dim_client".into(),
            natural_key: "client_id".into(),
            columns: vec!["client_id".into(), "client_name".into(), "tier".into()],
        };
        let rows = source.dimension_rows(&spec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].natural_key, "1");
        assert_eq!(
            rows[1].values,
            vec![Some("2".into()), Some("Beta".into()), Some("gold".into())]
        );
    }
}
