//! Operator checks that run outside a load: connectivity and source sizes.

use pmdw_core::SourceRelation;
use pmdw_storage::{ConnectionProvider, PgSourceStore, PgWarehouse, SourceStore, StoreError, Warehouse};
use serde::Serialize;
use tracing::info;

use crate::config::EtlConfig;
use crate::EtlError;

pub async fn connect_source(config: &EtlConfig) -> Result<PgSourceStore, EtlError> {
    ConnectionProvider::new(config.provider.clone())
        .source(&config.source)
        .await
        .map_err(EtlError::from_connect)
}

pub async fn connect_warehouse(config: &EtlConfig) -> Result<PgWarehouse, EtlError> {
    ConnectionProvider::new(config.provider.clone())
        .warehouse(&config.warehouse)
        .await
        .map_err(EtlError::from_connect)
}

#[derive(Debug)]
pub struct RelationCount {
    pub relation: SourceRelation,
    pub rows: Result<i64, StoreError>,
}

/// `COUNT(*)` per source relation; one failing relation does not hide the others.
pub async fn source_row_counts(source: &dyn SourceStore) -> Vec<RelationCount> {
    let mut counts = Vec::with_capacity(SourceRelation::ALL.len());
    for relation in SourceRelation::ALL {
        let rows = source.count_rows(relation).await;
        counts.push(RelationCount { relation, rows });
    }
    counts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingReport {
    pub source_database: String,
    pub warehouse_database: String,
}

pub async fn ping_stores(
    source: &dyn SourceStore,
    warehouse: &dyn Warehouse,
) -> Result<PingReport, EtlError> {
    let source_database = source
        .database_name()
        .await
        .map_err(EtlError::Connectivity)?;
    let warehouse_database = warehouse
        .database_name()
        .await
        .map_err(EtlError::Connectivity)?;
    info!(%source_database, %warehouse_database, "both stores reachable");
    Ok(PingReport {
        source_database,
        warehouse_database,
    })
}

/// Open both sides, ask each for its database name, close again.
pub async fn ping(config: &EtlConfig) -> Result<PingReport, EtlError> {
    let warehouse = connect_warehouse(config).await?;
    let source = match connect_source(config).await {
        Ok(source) => source,
        Err(err) => {
            warehouse.close().await;
            return Err(err);
        }
    };
    let report = ping_stores(&source, &warehouse).await;
    source.close().await;
    warehouse.close().await;
    report
}
