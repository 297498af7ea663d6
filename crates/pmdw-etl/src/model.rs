//! Rayleigh defect-density model over loaded facts.
//!
//! Training stores one scale parameter in `model_params`; prediction reads the
//! newest one and falls back to a configured default when none is stored.

use std::f64::consts::PI;

use chrono::{DateTime, Utc};
use pmdw_core::{FactRow, ModelParam, ProjectScope};
use pmdw_storage::Warehouse;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ModelSettings;
use crate::EtlError;

/// Defects per logged hour for every project with hours recorded.
pub fn defect_densities(facts: &[FactRow]) -> Vec<f64> {
    facts
        .iter()
        .filter(|f| f.total_hours > 0.0)
        .map(|f| f.total_errors as f64 / f.total_hours)
        .collect()
}

/// Maximum-likelihood scale: `sqrt(sum(x^2) / 2n)`. `None` without samples.
pub fn fit_rayleigh_sigma(densities: &[f64]) -> Option<f64> {
    if densities.is_empty() {
        return None;
    }
    let squares: f64 = densities.iter().map(|x| x * x).sum();
    Some((squares / (2.0 * densities.len() as f64)).sqrt())
}

/// Density below which a fraction `p` of projects fall.
pub fn rayleigh_quantile(sigma: f64, p: f64) -> f64 {
    sigma * (-2.0 * (1.0 - p).ln()).sqrt()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefectForecast {
    pub sigma: f64,
    pub hours: f64,
    pub expected_defects: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

pub fn forecast(sigma: f64, hours: f64) -> DefectForecast {
    DefectForecast {
        sigma,
        hours,
        expected_defects: sigma * (PI / 2.0).sqrt() * hours,
        p10: rayleigh_quantile(sigma, 0.10) * hours,
        p50: rayleigh_quantile(sigma, 0.50) * hours,
        p90: rayleigh_quantile(sigma, 0.90) * hours,
    }
}

/// Scale parameter in effect, with the training time when it came from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SigmaEstimate {
    pub sigma: f64,
    pub trained_at: Option<DateTime<Utc>>,
}

impl SigmaEstimate {
    pub fn is_default(&self) -> bool {
        self.trained_at.is_none()
    }
}

/// Newest stored sigma; the configured default when absent or unreadable.
pub async fn current_sigma(warehouse: &dyn Warehouse, settings: &ModelSettings) -> SigmaEstimate {
    let fallback = SigmaEstimate {
        sigma: settings.default_sigma,
        trained_at: None,
    };
    match warehouse
        .latest_model_param(&settings.model_name, &settings.param_name)
        .await
    {
        Ok(Some(param)) if param.param_value.is_finite() && param.param_value > 0.0 => SigmaEstimate {
            sigma: param.param_value,
            trained_at: Some(param.trained_at),
        },
        Ok(Some(param)) => {
            warn!(value = param.param_value, "stored sigma is not positive, using default");
            fallback
        }
        Ok(None) => {
            info!(default = settings.default_sigma, "no trained sigma stored, using default");
            fallback
        }
        Err(err) => {
            warn!(error = %err, "could not read model parameters, using default sigma");
            fallback
        }
    }
}

/// Fit sigma over the current facts and store it.
pub async fn train(
    warehouse: &dyn Warehouse,
    settings: &ModelSettings,
    trained_at: DateTime<Utc>,
) -> Result<ModelParam, EtlError> {
    let facts = warehouse
        .fact_rows(&ProjectScope::All)
        .await
        .map_err(EtlError::Warehouse)?;
    let densities = defect_densities(&facts);
    let sigma = fit_rayleigh_sigma(&densities).ok_or_else(|| {
        EtlError::Model("no projects with logged hours to train on".to_string())
    })?;

    let param = ModelParam {
        model_name: settings.model_name.clone(),
        param_name: settings.param_name.clone(),
        param_value: sigma,
        trained_at,
    };
    warehouse
        .store_model_param(&param)
        .await
        .map_err(EtlError::Warehouse)?;
    info!(sigma, samples = densities.len(), "defect model trained");
    Ok(param)
}
