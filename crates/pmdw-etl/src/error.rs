use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use pmdw_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connectivity error: {0}")]
    Connectivity(#[source] StoreError),
    #[error("aggregation error while {context}: {source}")]
    Aggregation {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("aggregation error: project {project_id}: {detail}")]
    InvalidFact { project_id: i64, detail: String },
    #[error("dimension `{dimension}` failed to load: {source}")]
    Dimension {
        dimension: String,
        #[source]
        source: StoreError,
    },
    #[error("load error while {context}: {source}")]
    Load {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("audit row could not be written: {0}")]
    Audit(#[source] StoreError),
    #[error("model error: {0}")]
    Model(String),
    #[error("warehouse error: {0}")]
    Warehouse(#[source] StoreError),
}

impl EtlError {
    /// Classify a failure to open a connection.
    pub fn from_connect(err: StoreError) -> Self {
        match err {
            StoreError::Configuration { .. } => EtlError::Configuration(err.to_string()),
            other => EtlError::Connectivity(other),
        }
    }

    pub(crate) fn aggregation(context: impl Into<String>) -> impl FnOnce(StoreError) -> EtlError {
        let context = context.into();
        move |source| EtlError::Aggregation { context, source }
    }

    pub(crate) fn load(context: impl Into<String>) -> impl FnOnce(StoreError) -> EtlError {
        let context = context.into();
        move |source| EtlError::Load { context, source }
    }

    pub(crate) fn dimension(dimension: impl Into<String>) -> impl FnOnce(StoreError) -> EtlError {
        let dimension = dimension.into();
        move |source| EtlError::Dimension { dimension, source }
    }

    /// Short category label used in summaries and audit notes.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::Configuration(_) => "ConfigurationError",
            EtlError::Connectivity(_) => "ConnectivityError",
            EtlError::Aggregation { .. } | EtlError::InvalidFact { .. } => "AggregationError",
            EtlError::Dimension { .. } => "DimensionError",
            EtlError::Load { .. } => "LoadError",
            EtlError::Audit(_) => "AuditError",
            EtlError::Model(_) => "ModelError",
            EtlError::Warehouse(_) => "WarehouseError",
        }
    }
}

/// A run that did not complete, tagged with the audit row it correlates to.
#[derive(Debug, Error)]
pub struct RunFailure {
    pub run_id: DateTime<Utc>,
    #[source]
    pub error: EtlError,
}

impl RunFailure {
    pub fn new(run_id: DateTime<Utc>, error: EtlError) -> Self {
        Self { run_id, error }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} failed ({}): {}",
            self.run_id.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.error.kind(),
            self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmdw_storage::Target;

    #[test]
    fn missing_settings_classify_as_configuration() {
        let err = EtlError::from_connect(StoreError::Configuration {
            target: Target::Source,
            missing: vec!["user"],
        });
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(err.to_string().contains("missing required settings: user"));

        let err = EtlError::from_connect(StoreError::Injected("refused".into()));
        assert_eq!(err.kind(), "ConnectivityError");
    }

    #[test]
    fn run_failure_is_one_line_with_timestamp() {
        let run_id = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let failure = RunFailure::new(
            run_id,
            EtlError::load("inserting fact rows")(StoreError::Constraint("fk violation".into())),
        );
        let line = failure.to_string();
        assert!(!line.contains('\n'));
        assert!(line.starts_with("run 2024-05-01T10:00:00.000000Z failed (LoadError)"));
        assert!(line.ends_with("fk violation"));
    }
}
