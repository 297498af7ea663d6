//! Core domain model for the project-management warehouse loader.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pmdw-core";

/// Integer `YYYYMMDD` key shared by `dim_date` and the fact date columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateKey(pub i32);

impl DateKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32)
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn to_date(self) -> Option<NaiveDate> {
        let year = self.0 / 10_000;
        let month = (self.0 / 100 % 100) as u32;
        let day = (self.0 % 100) as u32;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One calendar day of the date dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateDimRow {
    pub date_id: DateKey,
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: i32,
    pub month: i32,
    pub day: i32,
    pub weekday: String,
}

impl DateDimRow {
    pub fn for_date(date: NaiveDate) -> Self {
        let month = date.month() as i32;
        Self {
            date_id: DateKey::from_date(date),
            full_date: date,
            year: date.year(),
            quarter: (month - 1) / 3 + 1,
            month,
            day: date.day() as i32,
            weekday: date.format("%A").to_string(),
        }
    }
}

/// Lenient parser for the date strings found in source project rows.
///
/// Returns `None` for anything that is not a recognizable calendar date; the
/// caller decides what to substitute.
pub fn parse_source_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.date());
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    // Postgres renders timestamptz::text with a short offset ("+00").
    if let Ok(ts) = DateTime::parse_from_str(&format!("{raw}00"), "%Y-%m-%d %H:%M:%S%.f%z") {
        return Some(ts.date_naive());
    }
    NaiveDate::parse_from_str(raw, "%d/%m/%Y").ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: i64,
    pub client_name: Option<String>,
    pub industry: Option<String>,
    pub tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRecord {
    pub team_id: i64,
    pub team_name: Option<String>,
    pub description: Option<String>,
}

/// Source `project` row. Dates stay raw so unparsable values can be detected
/// and substituted during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: i64,
    pub project_name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub client_id: i64,
    pub team_id: i64,
    pub budget: Option<f64>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLogRecord {
    pub project_id: i64,
    pub employee_id: Option<i64>,
    pub hours: Option<f64>,
    pub cost: Option<f64>,
    pub log_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub project_id: i64,
    pub amount: Option<f64>,
    /// The source `type` column (`revenue`, `expense`, ...).
    pub kind: Option<String>,
    pub date_recorded: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub project_id: i64,
    pub severity: Option<String>,
    pub date_reported: Option<NaiveDate>,
}

/// Source relations the loader reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceRelation {
    Client,
    Team,
    Employee,
    Project,
    TimeLog,
    Financials,
    Issue,
}

impl SourceRelation {
    pub const ALL: [SourceRelation; 7] = [
        SourceRelation::Client,
        SourceRelation::Team,
        SourceRelation::Employee,
        SourceRelation::Project,
        SourceRelation::TimeLog,
        SourceRelation::Financials,
        SourceRelation::Issue,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            SourceRelation::Client => "client",
            SourceRelation::Team => "team",
            SourceRelation::Employee => "employee",
            SourceRelation::Project => "project",
            SourceRelation::TimeLog => "time_log",
            SourceRelation::Financials => "financials",
            SourceRelation::Issue => "issue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarehouseTable {
    DimDate,
    DimClient,
    DimTeam,
    DimProject,
    FactProject,
    EtlAudit,
    ModelParams,
}

impl WarehouseTable {
    pub fn table_name(self) -> &'static str {
        match self {
            WarehouseTable::DimDate => "dim_date",
            WarehouseTable::DimClient => "dim_client",
            WarehouseTable::DimTeam => "dim_team",
            WarehouseTable::DimProject => "dim_project",
            WarehouseTable::FactProject => "fact_project",
            WarehouseTable::EtlAudit => "etl_audit",
            WarehouseTable::ModelParams => "model_params",
        }
    }
}

/// Which projects a run aggregates and reloads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProjectScope {
    #[default]
    All,
    Only(BTreeSet<i64>),
}

impl ProjectScope {
    pub fn only(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::Only(ids.into_iter().collect())
    }

    pub fn contains(&self, project_id: i64) -> bool {
        match self {
            ProjectScope::All => true,
            ProjectScope::Only(ids) => ids.contains(&project_id),
        }
    }

    /// Explicit id list, `None` for a full run.
    pub fn ids(&self) -> Option<Vec<i64>> {
        match self {
            ProjectScope::All => None,
            ProjectScope::Only(ids) => Some(ids.iter().copied().collect()),
        }
    }
}

/// Mapping of one reference entity from a source query to a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    pub source_query: String,
    pub target_table: String,
    pub natural_key: String,
    /// Columns copied from the source query, natural key included.
    pub columns: Vec<String>,
}

impl DimensionSpec {
    pub fn key_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c == &self.natural_key)
    }

    /// Identifiers are interpolated into SQL, so only plain names pass.
    pub fn validate(&self) -> Result<(), String> {
        let identifiers = std::iter::once(&self.target_table)
            .chain(std::iter::once(&self.natural_key))
            .chain(self.columns.iter());
        for ident in identifiers {
            if !is_plain_identifier(ident) {
                return Err(format!(
                    "dimension `{}`: `{ident}` is not a plain SQL identifier",
                    self.name
                ));
            }
        }
        if self.key_index().is_none() {
            return Err(format!(
                "dimension `{}`: natural key `{}` is not among its columns",
                self.name, self.natural_key
            ));
        }
        if self.source_query.trim().is_empty() {
            return Err(format!("dimension `{}`: empty source query", self.name));
        }
        Ok(())
    }
}

pub fn is_plain_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A source row of some dimension; `values` line up with `DimensionSpec::columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRecord {
    pub natural_key: String,
    pub values: Vec<Option<String>>,
}

/// One project's aggregated measures, keyed into the dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub project_id: i64,
    pub client_id: i64,
    pub team_id: i64,
    pub start_date_id: DateKey,
    pub end_date_id: DateKey,
    pub total_hours: f64,
    pub total_cost: f64,
    pub total_revenue: f64,
    pub total_errors: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "OK",
            RunStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `etl_audit` row. Counts stay `None` when the run never got that far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: DateTime<Utc>,
    pub src_rows_time_log: Option<i64>,
    pub src_rows_financials: Option<i64>,
    pub src_rows_issue: Option<i64>,
    pub dst_rows_dim_client: Option<i64>,
    pub dst_rows_dim_team: Option<i64>,
    pub dst_rows_dim_project: Option<i64>,
    pub dst_rows_fact_project: Option<i64>,
    pub duration_seconds: f64,
    pub status: RunStatus,
    pub notes: String,
}

impl AuditRecord {
    pub fn failed(run_id: DateTime<Utc>, duration_seconds: f64, notes: impl Into<String>) -> Self {
        Self {
            run_id,
            src_rows_time_log: None,
            src_rows_financials: None,
            src_rows_issue: None,
            dst_rows_dim_client: None,
            dst_rows_dim_team: None,
            dst_rows_dim_project: None,
            dst_rows_fact_project: None,
            duration_seconds,
            status: RunStatus::Error,
            notes: notes.into(),
        }
    }
}

/// Row of the `model_params` table written by the training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParam {
    pub model_name: String,
    pub param_name: String,
    pub param_value: f64,
    pub trained_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn date_key_is_yyyymmdd() {
        let key = DateKey::from_date(ymd(2024, 3, 1));
        assert_eq!(key.value(), 20240301);
        assert_eq!(key.to_date(), Some(ymd(2024, 3, 1)));
        assert_eq!(DateKey(20241341).to_date(), None);
    }

    #[test]
    fn date_row_carries_quarter_and_weekday() {
        let row = DateDimRow::for_date(ymd(2024, 1, 1));
        assert_eq!(row.quarter, 1);
        assert_eq!(row.weekday, "Monday");

        let row = DateDimRow::for_date(ymd(2024, 12, 31));
        assert_eq!(row.quarter, 4);
        assert_eq!((row.year, row.month, row.day), (2024, 12, 31));

        assert_eq!(DateDimRow::for_date(ymd(2024, 4, 1)).quarter, 2);
        assert_eq!(DateDimRow::for_date(ymd(2024, 9, 30)).quarter, 3);
    }

    #[test]
    fn source_dates_parse_leniently() {
        assert_eq!(parse_source_date("2024-01-01"), Some(ymd(2024, 1, 1)));
        assert_eq!(parse_source_date(" 2024-01-01 10:30:00 "), Some(ymd(2024, 1, 1)));
        assert_eq!(parse_source_date("2024-02-03T00:00:00.000"), Some(ymd(2024, 2, 3)));
        assert_eq!(parse_source_date("2024-02-03 08:00:00+00"), Some(ymd(2024, 2, 3)));
        assert_eq!(parse_source_date("15/06/2023"), Some(ymd(2023, 6, 15)));
        assert_eq!(parse_source_date("not a date"), None);
        assert_eq!(parse_source_date(""), None);
        assert_eq!(parse_source_date("2024-02-30"), None);
    }

    #[test]
    fn scope_membership() {
        assert!(ProjectScope::All.contains(42));
        assert_eq!(ProjectScope::All.ids(), None);

        let scope = ProjectScope::only([3, 1, 3]);
        assert!(scope.contains(1));
        assert!(!scope.contains(2));
        assert_eq!(scope.ids(), Some(vec![1, 3]));
    }

    #[test]
    fn dimension_spec_rejects_unsafe_identifiers() {
        let mut spec = DimensionSpec {
            name: "client".into(),
            source_query: "SELECT client_id, client_name FROM client".into(),
            target_table: "dim_client".into(),
            natural_key: "client_id".into(),
            columns: vec!["client_id".into(), "client_name".into()],
        };
        assert!(spec.validate().is_ok());
        assert_eq!(spec.key_index(), Some(0));

        spec.target_table = "dim_client; DROP TABLE x".into();
        assert!(spec.validate().is_err());

        spec.target_table = "dim_client".into();
        spec.natural_key = "id".into();
        assert!(spec.validate().unwrap_err().contains("natural key"));
    }

    #[test]
    fn run_status_renders_audit_labels() {
        assert_eq!(RunStatus::Ok.as_str(), "OK");
        assert_eq!(RunStatus::Error.to_string(), "ERROR");
    }
}
