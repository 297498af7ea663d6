//! Warehouse loading pipeline: date dimension, reference dimensions, fact
//! rebuild and run auditing, plus the defect model that reads the facts back.
//!
//! A run reads and aggregates the source first, then writes the warehouse in
//! dependency order (dates, dimensions, referenced dates, facts) and finishes
//! with one `etl_audit` row whatever the outcome.

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod date_dim;
pub mod diagnostics;
pub mod dimensions;
mod error;
pub mod load;
pub mod model;
pub mod pipeline;

pub use aggregate::{AggregatedFacts, FactAggregator, SourceSnapshot};
pub use audit::{AuditRecorder, RunCounts};
pub use config::{AggregationSettings, EtlConfig, ModelSettings};
pub use date_dim::{DateDimensionBuilder, DateRange};
pub use dimensions::{DimensionBatch, DimensionSyncPolicy, DimensionSyncReport, DimensionUpserter, InsertAbsentOnly};
pub use error::{EtlError, RunFailure};
pub use load::{FactLoader, LoadReport};
pub use pipeline::{run_from_config, run_once_from_env, EtlPipeline, RunContext, RunSummary};

pub const CRATE_NAME: &str = "pmdw-etl";
