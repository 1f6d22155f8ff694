use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::store::DEFAULT_SNAPSHOT_CAPACITY;

/// Coordinator tuning, loaded from environment variables or built by hand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How deep synchronous follow-up chains may nest before a command is dropped
    pub max_follow_up_depth: usize,
    /// Default bound for [`crate::Coordinator::wait_until_settled_timeout`] callers
    pub settle_timeout: Duration,
    /// Capacity of the snapshot broadcast channel
    pub snapshot_capacity: usize,
    /// Drop catalog mutators produced for commands that do not load the catalog
    pub enforce_catalog_loads: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_follow_up_depth: 32,
            settle_timeout: Duration::from_secs(30),
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            enforce_catalog_loads: true,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            max_follow_up_depth: match lookup("COMMAND_STORE_MAX_FOLLOW_UP_DEPTH") {
                Some(v) => v
                    .parse()
                    .context("COMMAND_STORE_MAX_FOLLOW_UP_DEPTH must be a valid number")?,
                None => defaults.max_follow_up_depth,
            },
            settle_timeout: match lookup("COMMAND_STORE_SETTLE_TIMEOUT_MS") {
                Some(v) => Duration::from_millis(
                    v.parse().context(
                        "COMMAND_STORE_SETTLE_TIMEOUT_MS must be a number of milliseconds",
                    )?,
                ),
                None => defaults.settle_timeout,
            },
            snapshot_capacity: match lookup("COMMAND_STORE_SNAPSHOT_CAPACITY") {
                Some(v) => v
                    .parse()
                    .context("COMMAND_STORE_SNAPSHOT_CAPACITY must be a valid number")?,
                None => defaults.snapshot_capacity,
            },
            enforce_catalog_loads: match lookup("COMMAND_STORE_ENFORCE_CATALOG_LOADS") {
                Some(v) => parse_bool(&v)
                    .context("COMMAND_STORE_ENFORCE_CATALOG_LOADS must be true or false")?,
                None => defaults.enforce_catalog_loads,
            },
        })
    }

    pub fn with_max_follow_up_depth(mut self, depth: usize) -> Self {
        self.max_follow_up_depth = depth;
        self
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity;
        self
    }

    pub fn with_enforce_catalog_loads(mut self, enforce: bool) -> Self {
        self.enforce_catalog_loads = enforce;
        self
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognized boolean {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = CoordinatorConfig::from_vars(lookup(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[test]
    fn test_reads_every_key() {
        let config = CoordinatorConfig::from_vars(lookup(&[
            ("COMMAND_STORE_MAX_FOLLOW_UP_DEPTH", "4"),
            ("COMMAND_STORE_SETTLE_TIMEOUT_MS", "250"),
            ("COMMAND_STORE_SNAPSHOT_CAPACITY", "8"),
            ("COMMAND_STORE_ENFORCE_CATALOG_LOADS", "off"),
        ]))
        .unwrap();

        assert_eq!(config.max_follow_up_depth, 4);
        assert_eq!(config.settle_timeout, Duration::from_millis(250));
        assert_eq!(config.snapshot_capacity, 8);
        assert!(!config.enforce_catalog_loads);
    }

    #[test]
    fn test_bad_value_names_the_key() {
        let err =
            CoordinatorConfig::from_vars(lookup(&[("COMMAND_STORE_MAX_FOLLOW_UP_DEPTH", "deep")]))
                .unwrap_err();
        assert!(err.to_string().contains("COMMAND_STORE_MAX_FOLLOW_UP_DEPTH"));

        let err = CoordinatorConfig::from_vars(lookup(&[(
            "COMMAND_STORE_ENFORCE_CATALOG_LOADS",
            "maybe",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("COMMAND_STORE_ENFORCE_CATALOG_LOADS"));
    }

    #[test]
    fn test_builder_setters() {
        let config = CoordinatorConfig::default()
            .with_max_follow_up_depth(2)
            .with_settle_timeout(Duration::from_secs(1))
            .with_snapshot_capacity(1)
            .with_enforce_catalog_loads(false);
        assert_eq!(config.max_follow_up_depth, 2);
        assert_eq!(config.settle_timeout, Duration::from_secs(1));
        assert_eq!(config.snapshot_capacity, 1);
        assert!(!config.enforce_catalog_loads);
    }
}
