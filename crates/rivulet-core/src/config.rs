//! Engine configuration
//!
//! This module contains the configuration types and loading functionality.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

/// Configuration applied to every process instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node activations within one engine operation
    #[serde(default = "default_max_propagation_steps")]
    pub max_propagation_steps: usize,

    /// Buffer domain events on the instance
    #[serde(default = "default_record_events")]
    pub record_events: bool,
}

fn default_max_propagation_steps() -> usize {
    10_000
}

fn default_record_events() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_propagation_steps: default_max_propagation_steps(),
            record_events: default_record_events(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(steps) = lookup("RIVULET_MAX_PROPAGATION_STEPS") {
            match steps.parse::<usize>() {
                Ok(steps) if steps > 0 => self.max_propagation_steps = steps,
                _ => warn!("Invalid RIVULET_MAX_PROPAGATION_STEPS value: {}", steps),
            }
        }

        if let Some(record) = lookup("RIVULET_RECORD_EVENTS") {
            match record.to_lowercase().as_str() {
                "true" | "1" => self.record_events = true,
                "false" | "0" => self.record_events = false,
                _ => warn!("Invalid RIVULET_RECORD_EVENTS value: {}", record),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overridden(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_propagation_steps, 10_000);
        assert!(config.record_events);

        let parsed: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_environment_overrides() {
        let config = overridden(&[
            ("RIVULET_MAX_PROPAGATION_STEPS", "250"),
            ("RIVULET_RECORD_EVENTS", "FALSE"),
        ]);
        assert_eq!(config.max_propagation_steps, 250);
        assert!(!config.record_events);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = overridden(&[
            ("RIVULET_MAX_PROPAGATION_STEPS", "lots"),
            ("RIVULET_RECORD_EVENTS", "maybe"),
        ]);
        assert_eq!(config, EngineConfig::default());

        let config = overridden(&[("RIVULET_MAX_PROPAGATION_STEPS", "0")]);
        assert_eq!(config.max_propagation_steps, 10_000);
    }
}
