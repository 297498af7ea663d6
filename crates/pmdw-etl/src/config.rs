use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use pmdw_core::{DimensionSpec, ProjectScope};
use pmdw_storage::{ConnectionProviderConfig, ConnectionSettings, Target};
use serde::Deserialize;

use crate::EtlError;

pub const DEFAULT_PADDING_DAYS: i64 = 30;
pub const DEFAULT_REVENUE_TYPE: &str = "revenue";
pub const DEFAULT_MODEL_NAME: &str = "rayleigh_defect_model";
pub const DEFAULT_PARAM_NAME: &str = "sigma";
pub const DEFAULT_SIGMA: f64 = 0.05;

pub fn default_fallback_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default()
}

/// How raw source rows turn into fact measures.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSettings {
    /// Financial rows with this `type` (case-insensitive) count as revenue.
    pub revenue_type: String,
    /// Substituted for missing or unparsable project dates.
    pub default_date: NaiveDate,
    /// Decimal places kept for cost and revenue; `None` keeps full precision.
    pub money_decimals: Option<u32>,
    pub hours_decimals: Option<u32>,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            revenue_type: DEFAULT_REVENUE_TYPE.to_string(),
            default_date: default_fallback_date(),
            money_decimals: None,
            hours_decimals: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_name: String,
    pub param_name: String,
    /// Used when no trained parameter is stored.
    pub default_sigma: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            param_name: DEFAULT_PARAM_NAME.to_string(),
            default_sigma: DEFAULT_SIGMA,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub source: ConnectionSettings,
    pub warehouse: ConnectionSettings,
    pub provider: ConnectionProviderConfig,
    pub date_padding_days: i64,
    pub aggregation: AggregationSettings,
    pub dimensions: Vec<DimensionSpec>,
    pub model: ModelSettings,
    pub scope: ProjectScope,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            source: ConnectionSettings::default(),
            warehouse: ConnectionSettings::default(),
            provider: ConnectionProviderConfig::default(),
            date_padding_days: DEFAULT_PADDING_DAYS,
            aggregation: AggregationSettings::default(),
            dimensions: default_dimensions(),
            model: ModelSettings::default(),
            scope: ProjectScope::All,
        }
    }
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, EtlError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from a key lookup; unset or blank keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EtlError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = EtlConfig::default();

        let provider = ConnectionProviderConfig {
            connect_timeout: get("PMDW_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.provider.connect_timeout),
            max_connections: get("PMDW_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.provider.max_connections),
        };

        let default_date = match get("PMDW_DEFAULT_DATE") {
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|err| {
                EtlError::Configuration(format!("PMDW_DEFAULT_DATE `{raw}` is not a YYYY-MM-DD date: {err}"))
            })?,
            None => defaults.aggregation.default_date,
        };

        let aggregation = AggregationSettings {
            revenue_type: get("PMDW_REVENUE_TYPE").unwrap_or(defaults.aggregation.revenue_type),
            default_date,
            money_decimals: get("PMDW_MONEY_DECIMALS").and_then(|v| v.parse().ok()),
            hours_decimals: get("PMDW_HOURS_DECIMALS").and_then(|v| v.parse().ok()),
        };

        let dimensions = match get("PMDW_DIMENSIONS_FILE") {
            Some(path) => load_dimension_catalog(Path::new(&path))?,
            None => defaults.dimensions,
        };

        let model = ModelSettings {
            default_sigma: get("PMDW_MODEL_DEFAULT_SIGMA")
                .and_then(|v| v.parse().ok())
                .filter(|sigma: &f64| sigma.is_finite() && *sigma > 0.0)
                .unwrap_or(defaults.model.default_sigma),
            ..defaults.model
        };

        Ok(Self {
            source: ConnectionSettings::from_lookup(Target::Source, &lookup),
            warehouse: ConnectionSettings::from_lookup(Target::Warehouse, &lookup),
            provider,
            date_padding_days: get("PMDW_DATE_PADDING_DAYS")
                .and_then(|v| v.parse().ok())
                .filter(|days: &i64| *days >= 0)
                .unwrap_or(defaults.date_padding_days),
            aggregation,
            dimensions,
            model,
            scope: ProjectScope::All,
        })
    }

    pub fn with_scope(mut self, scope: ProjectScope) -> Self {
        self.scope = scope;
        self
    }

    /// Check both connection bundles before anything is opened.
    pub fn validate(&self) -> Result<(), EtlError> {
        self.source
            .validate(Target::Source)
            .map_err(EtlError::from_connect)?;
        self.warehouse
            .validate(Target::Warehouse)
            .map_err(EtlError::from_connect)?;
        validate_dimensions(&self.dimensions)
    }
}

#[derive(Debug, Deserialize)]
struct DimensionCatalog {
    dimensions: Vec<DimensionSpec>,
}

/// Read a YAML dimension mapping that replaces the built-in one.
pub fn load_dimension_catalog(path: &Path) -> Result<Vec<DimensionSpec>, EtlError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        EtlError::Configuration(format!("reading dimension file {}: {err}", path.display()))
    })?;
    let catalog: DimensionCatalog = serde_yaml::from_str(&raw).map_err(|err| {
        EtlError::Configuration(format!("parsing dimension file {}: {err}", path.display()))
    })?;
    validate_dimensions(&catalog.dimensions)?;
    Ok(catalog.dimensions)
}

fn validate_dimensions(specs: &[DimensionSpec]) -> Result<(), EtlError> {
    let mut tables = std::collections::BTreeSet::new();
    for spec in specs {
        spec.validate().map_err(EtlError::Configuration)?;
        if !tables.insert(spec.target_table.as_str()) {
            return Err(EtlError::Configuration(format!(
                "dimension table `{}` is mapped more than once",
                spec.target_table
            )));
        }
    }
    Ok(())
}

fn dimension(name: &str, target_table: &str, natural_key: &str, columns: &[&str]) -> DimensionSpec {
    DimensionSpec {
        name: name.to_string(),
        source_query: format!("SELECT {} FROM {name}", columns.join(", ")),
        target_table: target_table.to_string(),
        natural_key: natural_key.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
    }
}

/// Built-in mapping of the three reference entities.
pub fn default_dimensions() -> Vec<DimensionSpec> {
    vec![
        dimension("client", "dim_client", "client_id", &["client_id", "client_name", "industry", "tier"]),
        dimension("team", "dim_team", "team_id", &["team_id", "team_name", "description"]),
        dimension(
            "project",
            "dim_project",
            "project_id",
            &["project_id", "project_name", "priority", "budget"],
        ),
    ]
}
