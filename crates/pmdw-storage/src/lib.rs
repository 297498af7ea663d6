//! Connection provider and store seams for the source database and the warehouse.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pmdw_core::{
    AuditRecord, DateDimRow, DateKey, DimensionRecord, DimensionSpec, FactRow, FinancialRecord,
    IssueRecord, ModelParam, ProjectRecord, ProjectScope, SourceRelation, TimeLogRecord,
    WarehouseTable,
};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{info_span, Instrument};

#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod postgres;

pub use postgres::{PgFactReload, PgSourceStore, PgWarehouse};

pub const CRATE_NAME: &str = "pmdw-storage";

const DEFAULT_PORT: u16 = 5432;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Source,
    Warehouse,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Source => "source",
            Target::Warehouse => "warehouse",
        }
    }

    /// Prefix of the environment variables that configure this side.
    pub fn env_prefix(self) -> &'static str {
        match self {
            Target::Source => "SRC",
            Target::Warehouse => "DST",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{target} connection is missing required settings: {}", .missing.join(", "))]
    Configuration {
        target: Target,
        missing: Vec<&'static str>,
    },
    #[error("could not connect to the {target} store: {source}")]
    Connectivity {
        target: Target,
        #[source]
        source: sqlx::Error,
    },
    #[error("{context}: {source}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{context}: unexpected result shape: {detail}")]
    UnexpectedShape { context: String, detail: String },
    #[error("{0}")]
    Constraint(String),
    #[error("{0}")]
    Injected(String),
    #[error("applying warehouse migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub(crate) fn query(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> StoreError {
        let context = context.into();
        move |source| StoreError::Query { context, source }
    }
}

/// Credentials bundle for one side. Every field is optional until validated.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Settings that passed validation; constructed only by `ConnectionSettings::validate`.
#[derive(Clone)]
pub struct ResolvedSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    password: String,
}

impl fmt::Debug for ResolvedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ConnectionSettings {
    /// Read `{SRC|DST}_HOST`, `_PORT`, `_DB`, `_USER`, `_PASS` through `lookup`.
    pub fn from_lookup(target: Target, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let prefix = target.env_prefix();
        let get = |suffix: &str| {
            lookup(&format!("{prefix}_{suffix}")).filter(|v| !v.trim().is_empty())
        };
        Self {
            host: get("HOST"),
            port: get("PORT").and_then(|v| v.trim().parse().ok()),
            database: get("DB"),
            user: get("USER"),
            password: get("PASS"),
        }
    }

    pub fn from_env(target: Target) -> Self {
        Self::from_lookup(target, |key| std::env::var(key).ok())
    }

    pub fn validate(&self, target: Target) -> Result<ResolvedSettings, StoreError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        let mut missing = Vec::new();
        if !present(&self.host) {
            missing.push("host");
        }
        if !present(&self.database) {
            missing.push("database");
        }
        if !present(&self.user) {
            missing.push("user");
        }
        if !present(&self.password) {
            missing.push("password");
        }
        if !missing.is_empty() {
            return Err(StoreError::Configuration { target, missing });
        }

        let (host, embedded_port) = split_host_port(self.host.as_deref().unwrap_or_default());
        Ok(ResolvedSettings {
            host,
            port: self.port.or(embedded_port).unwrap_or(DEFAULT_PORT),
            database: self.database.clone().unwrap_or_default(),
            user: self.user.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        })
    }
}

impl ResolvedSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .application_name("pmdw")
    }
}

/// Accepts `host`, `host:port` and the SQL Server style `host,port`.
fn split_host_port(raw: &str) -> (String, Option<u16>) {
    let raw = raw.trim();
    for sep in [',', ':'] {
        if let Some((host, port)) = raw.rsplit_once(sep) {
            if let Ok(port) = port.trim().parse::<u16>() {
                return (host.trim().to_string(), Some(port));
            }
        }
    }
    (raw.to_string(), None)
}

#[derive(Debug, Clone)]
pub struct ConnectionProviderConfig {
    pub connect_timeout: Duration,
    pub max_connections: u32,
}

impl Default for ConnectionProviderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connections: 4,
        }
    }
}

/// Opens pools for either side, failing fast on incomplete settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectionProvider {
    config: ConnectionProviderConfig,
}

impl ConnectionProvider {
    pub fn new(config: ConnectionProviderConfig) -> Self {
        Self { config }
    }

    /// Open a pool and verify one live session. The caller owns the pool and
    /// closes it when the run ends.
    pub async fn connect(
        &self,
        target: Target,
        settings: &ConnectionSettings,
    ) -> Result<PgPool, StoreError> {
        let resolved = settings.validate(target)?;
        let span = info_span!("connect", %target, host = %resolved.host, database = %resolved.database);

        PgPoolOptions::new()
            .max_connections(self.config.max_connections.max(1))
            .acquire_timeout(self.config.connect_timeout)
            .connect_with(resolved.connect_options())
            .instrument(span)
            .await
            .map_err(|source| StoreError::Connectivity { target, source })
    }

    pub async fn source(&self, settings: &ConnectionSettings) -> Result<PgSourceStore, StoreError> {
        Ok(PgSourceStore::new(self.connect(Target::Source, settings).await?))
    }

    pub async fn warehouse(&self, settings: &ConnectionSettings) -> Result<PgWarehouse, StoreError> {
        Ok(PgWarehouse::new(self.connect(Target::Warehouse, settings).await?))
    }
}

/// Read-only view of the transactional project-management database.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn projects(&self, scope: &ProjectScope) -> Result<Vec<ProjectRecord>, StoreError>;

    async fn time_logs(&self, scope: &ProjectScope) -> Result<Vec<TimeLogRecord>, StoreError>;

    async fn financials(&self, scope: &ProjectScope) -> Result<Vec<FinancialRecord>, StoreError>;

    async fn issues(&self, scope: &ProjectScope) -> Result<Vec<IssueRecord>, StoreError>;

    /// Rows of one reference entity, ordered by natural key.
    async fn dimension_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRecord>, StoreError>;

    async fn count_rows(&self, relation: SourceRelation) -> Result<i64, StoreError>;

    async fn database_name(&self) -> Result<String, StoreError>;
}

/// The dimensional store the pipeline writes to.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn date_keys_between(
        &self,
        from: DateKey,
        to: DateKey,
    ) -> Result<BTreeSet<DateKey>, StoreError>;

    /// Append date rows; keys already present are left untouched.
    async fn insert_dates(&self, rows: &[DateDimRow]) -> Result<u64, StoreError>;

    async fn natural_keys(&self, spec: &DimensionSpec) -> Result<BTreeSet<String>, StoreError>;

    /// Insert rows whose natural key is absent; existing rows are never updated.
    async fn insert_dimension_rows(
        &self,
        spec: &DimensionSpec,
        rows: &[DimensionRecord],
    ) -> Result<u64, StoreError>;

    /// Open the unit of work that replaces fact rows.
    async fn begin_fact_reload(&self) -> Result<Box<dyn FactReload>, StoreError>;

    async fn fact_rows(&self, scope: &ProjectScope) -> Result<Vec<FactRow>, StoreError>;

    async fn count_rows(&self, table: WarehouseTable) -> Result<i64, StoreError>;

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Most recently trained value of a model parameter, if any.
    async fn latest_model_param(
        &self,
        model_name: &str,
        param_name: &str,
    ) -> Result<Option<ModelParam>, StoreError>;

    /// Replace the stored value of a model parameter.
    async fn store_model_param(&self, param: &ModelParam) -> Result<(), StoreError>;

    async fn database_name(&self) -> Result<String, StoreError>;
}

/// Delete+insert over `fact_project` as one all-or-nothing step.
///
/// Dropping an uncommitted reload discards both steps.
#[async_trait]
pub trait FactReload: Send {
    async fn delete_projects(&mut self, project_ids: &[i64]) -> Result<u64, StoreError>;

    async fn insert_facts(&mut self, rows: &[FactRow]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
