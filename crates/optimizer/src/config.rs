//! Meta-optimizer configuration.

use crate::sampling::SamplerConfig;
use parafit_ir::Precision;
use serde::{Deserialize, Serialize};

/// Adjustment applied to the parameter map before one extra optimization round.
///
/// Smoothing and perturbation exclude each other within a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoundAdjustment {
    /// Re-optimize from the previous result as is.
    None,
    Smooth,
    #[default]
    Perturb,
}

/// Settings of the full fitting pipeline
/// `grid? -> optimize -> [adjust -> optimize]* -> sample? -> residuals`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetaOptimizerConfig {
    /// Run a coarse grid search before the primary optimizer.
    pub enable_grid_search: bool,
    /// Run the Metropolis-Hastings sampler after the last round.
    pub enable_sampling: bool,
    /// One entry per extra optimization round.
    pub rounds: Vec<RoundAdjustment>,
    /// Patience of the default primary optimizer.
    pub patience: usize,
    pub precision: Precision,
    pub grid_points: usize,
    pub grid_span: f64,
    pub smoothing_radius: usize,
    pub perturbation_scale: f64,
    pub sampler: SamplerConfig,
    /// Keep the sample ensemble in the fit result.
    pub full_output: bool,
    /// Seed for perturbation and sampling; entropy when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for MetaOptimizerConfig {
    fn default() -> Self {
        Self {
            enable_grid_search: false,
            enable_sampling: false,
            rounds: Vec::new(),
            patience: 200,
            precision: Precision::Double,
            grid_points: 5,
            grid_span: 0.5,
            smoothing_radius: 1,
            perturbation_scale: 0.05,
            sampler: SamplerConfig::default(),
            full_output: false,
            seed: None,
        }
    }
}

impl MetaOptimizerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.patience == 0 {
            return Err("patience must be at least 1".into());
        }
        if self.enable_grid_search && self.grid_points < 2 {
            return Err(format!(
                "grid search needs at least 2 points, got {}",
                self.grid_points
            ));
        }
        if !(self.grid_span.is_finite() && self.grid_span > 0.0) {
            return Err(format!("invalid grid span: {}", self.grid_span));
        }
        if !(self.perturbation_scale.is_finite() && self.perturbation_scale >= 0.0) {
            return Err(format!(
                "invalid perturbation scale: {}",
                self.perturbation_scale
            ));
        }
        if self.enable_sampling {
            self.sampler.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(MetaOptimizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = MetaOptimizerConfig {
            rounds: vec![RoundAdjustment::Smooth, RoundAdjustment::None],
            seed: Some(7),
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        assert!(json.contains("\"smooth\""));
        assert_eq!(MetaOptimizerConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            MetaOptimizerConfig::from_json(r#"{"enable_sampling": true, "rounds": ["perturb"]}"#)
                .unwrap();
        assert!(config.enable_sampling);
        assert_eq!(config.rounds, vec![RoundAdjustment::Perturb]);
        assert_eq!(config.patience, 200);
        assert_eq!(config.sampler, SamplerConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        let config = MetaOptimizerConfig {
            patience: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MetaOptimizerConfig {
            enable_sampling: true,
            sampler: SamplerConfig {
                thinning: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
