//! Extraction and per-project aggregation of fact measures.
//!
//! Everything here runs before the warehouse is written to, so a failure
//! leaves existing facts untouched.

use std::collections::{BTreeMap, BTreeSet};

use pmdw_core::{
    parse_source_date, DateKey, FactRow, FinancialRecord, IssueRecord, ProjectRecord,
    ProjectScope, TimeLogRecord,
};
use pmdw_storage::SourceStore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::AggregationSettings;
use crate::EtlError;

/// Source rows one run aggregates over.
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub projects: Vec<ProjectRecord>,
    pub time_logs: Vec<TimeLogRecord>,
    pub financials: Vec<FinancialRecord>,
    pub issues: Vec<IssueRecord>,
}

impl SourceSnapshot {
    pub async fn extract(source: &dyn SourceStore, scope: &ProjectScope) -> Result<Self, EtlError> {
        let projects = source
            .projects(scope)
            .await
            .map_err(EtlError::aggregation("reading project"))?;
        let time_logs = source
            .time_logs(scope)
            .await
            .map_err(EtlError::aggregation("reading time_log"))?;
        let financials = source
            .financials(scope)
            .await
            .map_err(EtlError::aggregation("reading financials"))?;
        let issues = source
            .issues(scope)
            .await
            .map_err(EtlError::aggregation("reading issue"))?;

        info!(
            projects = projects.len(),
            time_logs = time_logs.len(),
            financials = financials.len(),
            issues = issues.len(),
            "source extracted"
        );
        Ok(Self {
            projects,
            time_logs,
            financials,
            issues,
        })
    }
}

/// Output of one aggregation pass, ordered by project id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedFacts {
    pub rows: Vec<FactRow>,
    /// Project dates that were missing or unparsable and got the default.
    pub substituted_dates: usize,
    /// Project ids seen in measure relations but not in `project`.
    pub orphaned_projects: BTreeSet<i64>,
}

impl AggregatedFacts {
    pub fn project_ids(&self) -> Vec<i64> {
        self.rows.iter().map(|row| row.project_id).collect()
    }

    pub fn referenced_dates(&self) -> BTreeSet<DateKey> {
        self.rows
            .iter()
            .flat_map(|row| [row.start_date_id, row.end_date_id])
            .collect()
    }

    /// SHA-256 over the serialized rows; identical input gives an identical digest.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for row in &self.rows {
            // FactRow holds only numbers, so serialization cannot fail.
            if let Ok(bytes) = serde_json::to_vec(row) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Default)]
struct Measures {
    hours: Vec<f64>,
    cost: Vec<f64>,
    revenue: Vec<f64>,
    errors: i64,
}

/// Sum in a fixed order so repeated runs produce identical floats.
fn stable_sum(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    values.iter().sum()
}

fn round_to(value: f64, decimals: Option<u32>) -> f64 {
    let rounded = match decimals {
        Some(places) => {
            let factor = 10f64.powi(places.min(15) as i32);
            (value * factor).round() / factor
        }
        None => value,
    };
    // Collapse -0.0 so it serializes like 0.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

#[derive(Debug, Clone)]
pub struct FactAggregator {
    settings: AggregationSettings,
}

impl FactAggregator {
    pub fn new(settings: AggregationSettings) -> Self {
        Self { settings }
    }

    fn resolve_date(&self, raw: Option<&str>, substituted: &mut usize, project_id: i64) -> DateKey {
        match raw.and_then(parse_source_date) {
            Some(date) => DateKey::from_date(date),
            None => {
                *substituted += 1;
                debug!(project_id, raw = ?raw, "project date missing or unparsable, using default");
                DateKey::from_date(self.settings.default_date)
            }
        }
    }

    fn is_revenue(&self, record: &FinancialRecord) -> bool {
        record
            .kind
            .as_deref()
            .is_some_and(|kind| kind.trim().eq_ignore_ascii_case(&self.settings.revenue_type))
    }

    pub fn aggregate(&self, snapshot: &SourceSnapshot) -> Result<AggregatedFacts, EtlError> {
        let mut projects: BTreeMap<i64, &ProjectRecord> = BTreeMap::new();
        for project in &snapshot.projects {
            projects.entry(project.project_id).or_insert(project);
        }

        let mut measures: BTreeMap<i64, Measures> = BTreeMap::new();
        for log in &snapshot.time_logs {
            let entry = measures.entry(log.project_id).or_default();
            entry.hours.extend(log.hours);
            entry.cost.extend(log.cost);
        }
        for record in snapshot.financials.iter().filter(|r| self.is_revenue(r)) {
            measures
                .entry(record.project_id)
                .or_default()
                .revenue
                .extend(record.amount);
        }
        for issue in &snapshot.issues {
            measures.entry(issue.project_id).or_default().errors += 1;
        }

        let orphaned_projects: BTreeSet<i64> = measures
            .keys()
            .filter(|id| !projects.contains_key(*id))
            .copied()
            .collect();
        if !orphaned_projects.is_empty() {
            warn!(
                count = orphaned_projects.len(),
                ids = ?orphaned_projects,
                "measure rows reference unknown projects and were skipped"
            );
        }

        let mut substituted_dates = 0;
        let mut rows = Vec::with_capacity(projects.len());
        for (project_id, project) in projects {
            let mut m = measures.remove(&project_id).unwrap_or_default();
            let row = FactRow {
                project_id,
                client_id: project.client_id,
                team_id: project.team_id,
                start_date_id: self.resolve_date(
                    project.start_date.as_deref(),
                    &mut substituted_dates,
                    project_id,
                ),
                end_date_id: self.resolve_date(
                    project.end_date.as_deref(),
                    &mut substituted_dates,
                    project_id,
                ),
                total_hours: round_to(stable_sum(&mut m.hours), self.settings.hours_decimals),
                total_cost: round_to(stable_sum(&mut m.cost), self.settings.money_decimals),
                total_revenue: round_to(stable_sum(&mut m.revenue), self.settings.money_decimals),
                total_errors: m.errors,
            };
            check_measures(&row)?;
            rows.push(row);
        }

        if substituted_dates > 0 {
            warn!(
                substituted_dates,
                default_date = %self.settings.default_date,
                "project dates replaced by the default date"
            );
        }
        Ok(AggregatedFacts {
            rows,
            substituted_dates,
            orphaned_projects,
        })
    }
}

fn check_measures(row: &FactRow) -> Result<(), EtlError> {
    let measures = [
        ("total_hours", row.total_hours),
        ("total_cost", row.total_cost),
        ("total_revenue", row.total_revenue),
    ];
    for (name, value) in measures {
        if !value.is_finite() || value < 0.0 {
            return Err(EtlError::InvalidFact {
                project_id: row.project_id,
                detail: format!("{name} is {value}, expected a finite non-negative number"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmdw_core::SourceRelation;
    use pmdw_storage::memory::MemorySource;

    fn project(id: i64, start: Option<&str>, end: Option<&str>) -> ProjectRecord {
        ProjectRecord {
            project_id: id,
            project_name: Some(format!("P{id}")),
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
            client_id: 1,
            team_id: 1,
            budget: None,
            priority: None,
        }
    }

    fn log(project_id: i64, hours: f64, cost: f64) -> TimeLogRecord {
        TimeLogRecord {
            project_id,
            employee_id: Some(1),
            hours: Some(hours),
            cost: Some(cost),
            log_date: None,
        }
    }

    fn money(project_id: i64, amount: f64, kind: &str) -> FinancialRecord {
        FinancialRecord {
            project_id,
            amount: Some(amount),
            kind: Some(kind.to_string()),
            date_recorded: None,
        }
    }

    fn issue(project_id: i64) -> IssueRecord {
        IssueRecord {
            project_id,
            severity: Some("high".into()),
            date_reported: None,
        }
    }

    #[test]
    fn measures_are_summed_per_project() {
        let snapshot = SourceSnapshot {
            projects: vec![project(1, Some("2024-01-01"), Some("2024-03-01"))],
            time_logs: vec![log(1, 40.0, 2000.0), log(1, 50.0, 2500.0), log(1, 30.0, 1500.0)],
            financials: vec![money(1, 10_000.0, "revenue"), money(1, 700.0, "expense")],
            issues: vec![issue(1), issue(1)],
        };
        let facts = FactAggregator::new(AggregationSettings::default())
            .aggregate(&snapshot)
            .unwrap();
        assert_eq!(
            facts.rows,
            vec![FactRow {
                project_id: 1,
                client_id: 1,
                team_id: 1,
                start_date_id: DateKey(20240101),
                end_date_id: DateKey(20240301),
                total_hours: 120.0,
                total_cost: 6000.0,
                total_revenue: 10_000.0,
                total_errors: 2,
            }]
        );
        assert_eq!(facts.substituted_dates, 0);
    }

    #[test]
    fn project_without_measures_gets_zeros_and_default_dates() {
        let snapshot = SourceSnapshot {
            projects: vec![project(5, None, Some("not a date"))],
            ..Default::default()
        };
        let facts = FactAggregator::new(AggregationSettings::default())
            .aggregate(&snapshot)
            .unwrap();
        let row = &facts.rows[0];
        assert_eq!(
            (row.total_hours, row.total_cost, row.total_revenue, row.total_errors),
            (0.0, 0.0, 0.0, 0)
        );
        assert_eq!(row.start_date_id, DateKey(20230101));
        assert_eq!(row.end_date_id, DateKey(20230101));
        assert_eq!(facts.substituted_dates, 2);
        assert_eq!(facts.referenced_dates().len(), 1);
    }

    #[test]
    fn null_measures_and_revenue_type_case() {
        let snapshot = SourceSnapshot {
            projects: vec![project(1, Some("2024-01-01"), Some("2024-01-02"))],
            time_logs: vec![TimeLogRecord {
                project_id: 1,
                employee_id: None,
                hours: None,
                cost: Some(10.0),
                log_date: None,
            }],
            financials: vec![
                money(1, 5.0, " Revenue "),
                FinancialRecord {
                    project_id: 1,
                    amount: Some(99.0),
                    kind: None,
                    date_recorded: None,
                },
            ],
            issues: vec![],
        };
        let row = &FactAggregator::new(AggregationSettings::default())
            .aggregate(&snapshot)
            .unwrap()
            .rows[0];
        assert_eq!((row.total_hours, row.total_cost, row.total_revenue), (0.0, 10.0, 5.0));
    }

    #[test]
    fn orphaned_measures_are_dropped() {
        let snapshot = SourceSnapshot {
            projects: vec![project(1, Some("2024-01-01"), Some("2024-01-02"))],
            time_logs: vec![log(1, 1.0, 1.0), log(99, 5.0, 5.0)],
            issues: vec![issue(98)],
            ..Default::default()
        };
        let facts = FactAggregator::new(AggregationSettings::default())
            .aggregate(&snapshot)
            .unwrap();
        assert_eq!(facts.project_ids(), vec![1]);
        assert_eq!(facts.orphaned_projects, BTreeSet::from([98, 99]));
    }

    #[test]
    fn negative_totals_fail_loudly() {
        let snapshot = SourceSnapshot {
            projects: vec![project(3, Some("2024-01-01"), Some("2024-01-02"))],
            time_logs: vec![log(3, -4.0, 10.0)],
            ..Default::default()
        };
        let err = FactAggregator::new(AggregationSettings::default())
            .aggregate(&snapshot)
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidFact { project_id: 3, .. }));
        assert_eq!(err.kind(), "AggregationError");
    }

    #[test]
    fn rounding_is_configurable() {
        let snapshot = SourceSnapshot {
            projects: vec![project(1, Some("2024-01-01"), Some("2024-01-02"))],
            time_logs: vec![log(1, 1.234, 10.005), log(1, 0.0, 0.001)],
            ..Default::default()
        };
        let settings = AggregationSettings {
            money_decimals: Some(2),
            hours_decimals: Some(1),
            ..Default::default()
        };
        let row = &FactAggregator::new(settings).aggregate(&snapshot).unwrap().rows[0];
        assert_eq!(row.total_hours, 1.2);
        assert_eq!(row.total_cost, 10.01);
    }

    #[test]
    fn aggregation_is_deterministic_regardless_of_row_order() {
        let mut snapshot = SourceSnapshot {
            projects: vec![
                project(2, Some("2024-01-01"), Some("2024-02-01")),
                project(1, Some("2024-01-01"), Some("2024-02-01")),
            ],
            time_logs: vec![log(1, 0.1, 0.3), log(1, 0.2, 0.7), log(2, 1e16, 1.0), log(2, 1.0, 1.0)],
            ..Default::default()
        };
        let aggregator = FactAggregator::new(AggregationSettings::default());
        let first = aggregator.aggregate(&snapshot).unwrap();
        snapshot.time_logs.reverse();
        snapshot.projects.reverse();
        let second = aggregator.aggregate(&snapshot).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);
        assert_eq!(first.project_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn extraction_failure_is_an_aggregation_error() {
        let mut source = MemorySource::new();
        source.fail_reads_of(SourceRelation::Financials);
        let err = SourceSnapshot::extract(&source, &ProjectScope::All)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AggregationError");
        assert!(err.to_string().contains("reading financials"));
    }

    #[tokio::test]
    async fn extraction_honors_scope() {
        let source = MemorySource {
            projects: vec![
                project(1, Some("2024-01-01"), None),
                project(2, Some("2024-01-01"), None),
            ],
            time_logs: vec![log(1, 1.0, 1.0), log(2, 2.0, 2.0)],
            ..Default::default()
        };
        let snapshot = SourceSnapshot::extract(&source, &ProjectScope::only([2]))
            .await
            .unwrap();
        assert_eq!(snapshot.projects.len(), 1);
        assert_eq!(snapshot.time_logs, vec![log(2, 2.0, 2.0)]);
    }
}
