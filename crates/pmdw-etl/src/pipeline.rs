use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use pmdw_core::{ProjectScope, RunStatus};
use pmdw_storage::{ConnectionProvider, SourceStore, Warehouse};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::aggregate::{FactAggregator, SourceSnapshot};
use crate::audit::{AuditRecorder, RunCounts};
use crate::config::EtlConfig;
use crate::date_dim::DateDimensionBuilder;
use crate::dimensions::{DimensionSyncPolicy, DimensionSyncReport, DimensionUpserter};
use crate::load::{FactLoader, LoadReport};
use crate::{EtlError, RunFailure};

/// Identity and clock of one run.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    /// Also the `etl_audit` key; truncated to the warehouse's microsecond precision.
    pub run_id: DateTime<Utc>,
    pub started: Instant,
    /// Upper fallback bound of the date dimension.
    pub today: NaiveDate,
}

impl RunContext {
    pub fn now() -> Self {
        let now = Utc::now();
        Self::at(now, now.date_naive())
    }

    pub fn at(run_id: DateTime<Utc>, today: NaiveDate) -> Self {
        Self {
            run_id: run_id.trunc_subsecs(6),
            started: Instant::now(),
            today,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: DateTime<Utc>,
    pub scope: ProjectScope,
    pub duration_seconds: f64,
    pub projects_loaded: usize,
    pub dates_inserted: u64,
    pub dimensions: Vec<DimensionSyncReport>,
    pub facts: LoadReport,
    pub substituted_dates: usize,
    pub orphaned_projects: usize,
    pub fingerprint: String,
    pub counts: RunCounts,
    pub audit_recorded: bool,
}

/// What a run accomplished so far; survives a failure for the audit row.
#[derive(Debug, Default)]
struct Progress {
    counts: RunCounts,
    dates_inserted: u64,
    dimensions: Vec<DimensionSyncReport>,
    facts: LoadReport,
    projects_loaded: usize,
    substituted_dates: usize,
    orphaned_projects: usize,
    fingerprint: String,
    reached_warehouse_writes: bool,
}

impl Progress {
    fn notes(&self) -> String {
        let inserted_dims = self
            .dimensions
            .iter()
            .map(|d| format!("{}+{}", d.dimension, d.inserted))
            .collect::<Vec<_>>()
            .join(" ");
        let mut notes = format!(
            "loaded {} projects (deleted {}, inserted {}); dates +{}; dimensions {}; fingerprint sha256:{}",
            self.projects_loaded,
            self.facts.deleted,
            self.facts.inserted,
            self.dates_inserted,
            if inserted_dims.is_empty() { "-".to_string() } else { inserted_dims },
            self.fingerprint
        );
        if self.substituted_dates > 0 {
            notes.push_str(&format!("; {} project dates defaulted", self.substituted_dates));
        }
        if self.orphaned_projects > 0 {
            notes.push_str(&format!("; {} unknown project ids skipped", self.orphaned_projects));
        }
        notes
    }
}

/// One batch run over already-open stores.
pub struct EtlPipeline {
    config: EtlConfig,
    source: Arc<dyn SourceStore>,
    warehouse: Arc<dyn Warehouse>,
    upserter: DimensionUpserter,
}

impl EtlPipeline {
    pub fn new(config: EtlConfig, source: Arc<dyn SourceStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config,
            source,
            warehouse,
            upserter: DimensionUpserter::default(),
        }
    }

    pub fn with_sync_policy(mut self, policy: Box<dyn DimensionSyncPolicy>) -> Self {
        self.upserter = DimensionUpserter::new(policy);
        self
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunFailure> {
        self.run_at(RunContext::now()).await
    }

    /// Run every stage in order and record exactly one audit row.
    pub async fn run_at(&self, ctx: RunContext) -> Result<RunSummary, RunFailure> {
        let span = info_span!(
            "etl_run",
            run_id = %ctx.run_id,
            scope = ?self.config.scope,
            dimension_policy = self.upserter.policy_name()
        );
        async {
            let mut progress = Progress::default();
            let outcome = self.execute(&ctx, &mut progress).await;

            let warehouse = self.warehouse.as_ref();
            if progress.reached_warehouse_writes {
                progress.counts.capture_destination(warehouse).await;
            }
            let recorder = AuditRecorder::new(warehouse);
            let duration_seconds = ctx.elapsed_seconds();

            match outcome {
                Ok(()) => {
                    let audit_recorded = recorder
                        .record(ctx.run_id, &progress.counts, duration_seconds, RunStatus::Ok, &progress.notes())
                        .await;
                    info!(
                        duration_seconds,
                        projects = progress.projects_loaded,
                        audit_recorded,
                        "run completed"
                    );
                    Ok(RunSummary {
                        run_id: ctx.run_id,
                        scope: self.config.scope.clone(),
                        duration_seconds,
                        projects_loaded: progress.projects_loaded,
                        dates_inserted: progress.dates_inserted,
                        dimensions: progress.dimensions,
                        facts: progress.facts,
                        substituted_dates: progress.substituted_dates,
                        orphaned_projects: progress.orphaned_projects,
                        fingerprint: progress.fingerprint,
                        counts: progress.counts,
                        audit_recorded,
                    })
                }
                Err(err) => {
                    error!(kind = err.kind(), error = %err, duration_seconds, "run failed");
                    recorder
                        .record(
                            ctx.run_id,
                            &progress.counts,
                            duration_seconds,
                            RunStatus::Error,
                            &format!("{}: {err}", err.kind()),
                        )
                        .await;
                    Err(RunFailure::new(ctx.run_id, err))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, ctx: &RunContext, progress: &mut Progress) -> Result<(), EtlError> {
        let source = self.source.as_ref();
        let warehouse = self.warehouse.as_ref();
        let config = &self.config;

        warehouse.ensure_schema().await.map_err(EtlError::Warehouse)?;

        // Read and aggregate everything before the first warehouse write.
        let snapshot = SourceSnapshot::extract(source, &config.scope).await?;
        progress.counts.src_time_log = Some(snapshot.time_logs.len() as i64);
        progress.counts.src_financials = Some(snapshot.financials.len() as i64);
        progress.counts.src_issue = Some(snapshot.issues.len() as i64);

        let facts = FactAggregator::new(config.aggregation.clone()).aggregate(&snapshot)?;
        progress.fingerprint = facts.fingerprint();
        progress.substituted_dates = facts.substituted_dates;
        progress.orphaned_projects = facts.orphaned_projects.len();

        // The calendar spans every source project, whatever the scope.
        let dates = DateDimensionBuilder::new(config.date_padding_days, config.aggregation.default_date);
        let range = match config.scope {
            ProjectScope::All => dates.plan(&snapshot.projects, ctx.today),
            ProjectScope::Only(_) => {
                let all_projects = source
                    .projects(&ProjectScope::All)
                    .await
                    .map_err(EtlError::aggregation("reading project for the date range"))?;
                dates.plan(&all_projects, ctx.today)
            }
        };
        let dimension_batches = self.upserter.read_all(source, &config.dimensions).await?;

        progress.reached_warehouse_writes = true;
        progress.dates_inserted += dates.build(warehouse, &range).await?;
        progress.dimensions = self.upserter.load_all(warehouse, dimension_batches).await?;

        progress.dates_inserted += dates.ensure_dates(warehouse, &facts.referenced_dates()).await?;

        let mut covered: BTreeSet<i64> = facts.project_ids().into_iter().collect();
        if let Some(scoped) = config.scope.ids() {
            covered.extend(scoped);
        }
        let covered: Vec<i64> = covered.into_iter().collect();
        progress.facts = FactLoader.replace(warehouse, &covered, &facts.rows).await?;
        progress.projects_loaded = facts.rows.len();
        Ok(())
    }
}

/// Open both stores from `config`, run once, and close the pools.
///
/// A source that cannot be reached still gets an ERROR audit row when the
/// warehouse is up.
pub async fn run_from_config(config: EtlConfig) -> Result<RunSummary, RunFailure> {
    let ctx = RunContext::now();
    config
        .validate()
        .map_err(|err| RunFailure::new(ctx.run_id, err))?;

    let provider = ConnectionProvider::new(config.provider.clone());
    let warehouse = provider
        .warehouse(&config.warehouse)
        .await
        .map_err(|err| RunFailure::new(ctx.run_id, EtlError::from_connect(err)))?;

    let source = match provider.source(&config.source).await {
        Ok(source) => source,
        Err(err) => {
            let err = EtlError::from_connect(err);
            audit_unreachable_source(&warehouse, &ctx, &err).await;
            warehouse.close().await;
            return Err(RunFailure::new(ctx.run_id, err));
        }
    };

    let pipeline = EtlPipeline::new(config, Arc::new(source.clone()), Arc::new(warehouse.clone()));
    let result = pipeline.run_at(ctx).await;
    source.close().await;
    warehouse.close().await;
    result
}

/// ERROR row for a run whose source could not be opened; best effort.
async fn audit_unreachable_source(warehouse: &dyn Warehouse, ctx: &RunContext, err: &EtlError) -> bool {
    if let Err(schema) = warehouse.ensure_schema().await {
        warn!(error = %schema, "warehouse schema unavailable for the failure audit");
    }
    AuditRecorder::new(warehouse)
        .record_failure(ctx.run_id, ctx.elapsed_seconds(), err)
        .await
}

pub async fn run_once_from_env(scope: ProjectScope) -> Result<RunSummary, RunFailure> {
    let config = EtlConfig::from_env()
        .map_err(|err| RunFailure::new(RunContext::now().run_id, err))?;
    run_from_config(config.with_scope(scope)).await
}
