//! File-based configuration
//!
//! Loaded from TOML; every load path runs `validate()`, so an invalid
//! weight set is rejected before it can reach the dispatcher.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::SwitchboardError;
use crate::scoring::ScoringWeights;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub weights: ScoringWeights,
    /// Escalate when the evaluation signal reaches this value
    pub escalation_threshold: f64,
    /// Commit attempts before a dispatch falls back to queued
    pub max_assign_retries: u32,
    /// Load ratio above which `rebalance` treats a worker as overloaded
    pub rebalance_load_threshold: f64,
    /// Break duration applied when none is given explicitly
    pub default_break_secs: u64,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            escalation_threshold: 0.5,
            max_assign_retries: 3,
            rebalance_load_threshold: 0.8,
            default_break_secs: 15 * 60,
        }
    }
}

impl SwitchboardConfig {
    pub async fn load(path: &Path) -> Result<Self, SwitchboardError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| SwitchboardError::Configuration(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SwitchboardError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SwitchboardError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SwitchboardError> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.escalation_threshold) {
            return Err(SwitchboardError::Configuration(format!(
                "escalation_threshold {} outside [0, 1]",
                self.escalation_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.rebalance_load_threshold) {
            return Err(SwitchboardError::Configuration(format!(
                "rebalance_load_threshold {} outside [0, 1]",
                self.rebalance_load_threshold
            )));
        }
        Ok(())
    }

    pub fn default_break(&self) -> Duration {
        Duration::from_secs(self.default_break_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SwitchboardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.escalation_threshold, 0.5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SwitchboardConfig::from_toml_str("escalation_threshold = 0.7").unwrap();
        assert_eq!(config.escalation_threshold, 0.7);
        assert_eq!(config.max_assign_retries, 3);
        assert!(config.weights.validate().is_ok());
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let toml = r#"
            [weights]
            skill = 0.5
            availability = 0.5
            performance = 0.5
            wellbeing = 0.0
            customer = 0.0
            balance = 0.0
        "#;
        let result = SwitchboardConfig::from_toml_str(toml);
        assert!(matches!(result, Err(SwitchboardError::Configuration(_))));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let result = SwitchboardConfig::from_toml_str("escalation_threshold = 1.5");
        assert!(matches!(result, Err(SwitchboardError::Configuration(_))));
    }

    #[test]
    fn test_full_roundtrip() {
        let config = SwitchboardConfig::default();
        let toml = toml::to_string(&config).unwrap();
        let back = SwitchboardConfig::from_toml_str(&toml).unwrap();
        assert_eq!(back.max_assign_retries, config.max_assign_retries);
        assert_eq!(back.weights, config.weights);
    }
}
