//! Conductor configuration loaded from `jobconductor.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! `JOBCONDUCTOR_STORE` takes precedence over the file for the store path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConductorError, Result};
use crate::routing::RoutingTable;

pub const DEFAULT_CONFIG_FILE: &str = "jobconductor.toml";
pub const STORE_ENV_VAR: &str = "JOBCONDUCTOR_STORE";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConductorConfig {
    /// SQLite database holding backlogs, worker queues and task results.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Pause between conductor iterations when neither pool can take work.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default)]
    pub metal: MetalConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub routing: RoutingTable,
}

/// Local inference pool.
#[derive(Debug, Clone, Deserialize)]
pub struct MetalConfig {
    #[serde(default = "default_metal_queue")]
    pub queue: String,

    /// Maximum messages waiting in the metal queue before spilling over.
    #[serde(default = "default_metal_depth_cap")]
    pub depth_cap: usize,
}

/// Cloud inference pool and its provider budget.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_cloud_queue")]
    pub queue: String,

    #[serde(default = "default_cloud_depth_cap")]
    pub depth_cap: usize,

    /// Sustained submissions per minute. Half the provider's 10 RPM ceiling.
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: f64,

    /// Burst size of the token bucket.
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: f64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("jobconductor.db")
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_metal_queue() -> String {
    "queue_metal".to_string()
}

fn default_metal_depth_cap() -> usize {
    2
}

fn default_cloud_queue() -> String {
    "queue_cloud".to_string()
}

fn default_cloud_depth_cap() -> usize {
    10
}

fn default_rate_limit_rpm() -> f64 {
    5.0
}

fn default_bucket_capacity() -> f64 {
    2.0
}

impl Default for MetalConfig {
    fn default() -> Self {
        Self {
            queue: default_metal_queue(),
            depth_cap: default_metal_depth_cap(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            queue: default_cloud_queue(),
            depth_cap: default_cloud_depth_cap(),
            rate_limit_rpm: default_rate_limit_rpm(),
            bucket_capacity: default_bucket_capacity(),
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            backoff_ms: default_backoff_ms(),
            metal: MetalConfig::default(),
            cloud: CloudConfig::default(),
            routing: RoutingTable::default(),
        }
    }
}

impl CloudConfig {
    /// Token refill rate in tokens per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.rate_limit_rpm / 60.0
    }
}

impl ConductorConfig {
    /// Loads `path`, or `jobconductor.toml` in the current directory when no
    /// path is given. A missing default file yields defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(store) = std::env::var(STORE_ENV_VAR) {
            if !store.is_empty() {
                config.store_path = PathBuf::from(store);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str::<ConductorConfig>(&contents)?)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.metal.depth_cap == 0 || self.cloud.depth_cap == 0 {
            return Err(ConductorError::Config(
                "queue depth caps must be at least 1".into(),
            ));
        }
        if self.cloud.bucket_capacity < 1.0 {
            return Err(ConductorError::Config(
                "cloud.bucket_capacity must be at least 1.0".into(),
            ));
        }
        if !(self.cloud.rate_limit_rpm > 0.0) {
            return Err(ConductorError::Config(
                "cloud.rate_limit_rpm must be positive".into(),
            ));
        }
        if self.metal.queue.trim().is_empty() || self.cloud.queue.trim().is_empty() {
            return Err(ConductorError::Config("queue names must not be empty".into()));
        }
        if self.metal.queue == self.cloud.queue {
            return Err(ConductorError::Config(format!(
                "metal and cloud must use distinct queues (both are `{}`)",
                self.metal.queue
            )));
        }
        self.routing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Destination;

    #[test]
    fn default_config_values() {
        let config = ConductorConfig::default();
        assert_eq!(config.store_path, PathBuf::from("jobconductor.db"));
        assert_eq!(config.backoff_ms, 500);
        assert_eq!(config.metal.queue, "queue_metal");
        assert_eq!(config.metal.depth_cap, 2);
        assert_eq!(config.cloud.queue, "queue_cloud");
        assert_eq!(config.cloud.depth_cap, 10);
        assert_eq!(config.cloud.rate_limit_rpm, 5.0);
        assert_eq!(config.cloud.bucket_capacity, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let config: ConductorConfig = toml::from_str(
            r#"
            backoff_ms = 50

            [cloud]
            rate_limit_rpm = 30

            [routing."tasks.summarize"]
            metal = "tasks.summarize_llama"
            cloud = "tasks.summarize_gemini"
            "#,
        )
        .unwrap();
        assert_eq!(config.backoff_ms, 50);
        assert_eq!(config.cloud.rate_limit_rpm, 30.0);
        assert_eq!(config.cloud.depth_cap, 10);
        assert_eq!(config.metal.depth_cap, 2);
        // An explicit routing table replaces the built-in one.
        assert_eq!(config.routing.len(), 1);
        assert_eq!(
            config
                .routing
                .resolve("tasks.summarize", Destination::Cloud)
                .unwrap(),
            "tasks.summarize_gemini"
        );
    }

    #[test]
    fn refill_rate_is_per_second() {
        let cloud = CloudConfig {
            rate_limit_rpm: 6.0,
            ..CloudConfig::default()
        };
        assert!((cloud.refill_per_sec() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_zero_depth_cap() {
        let mut config = ConductorConfig::default();
        config.metal.depth_cap = 0;
        assert!(matches!(config.validate(), Err(ConductorError::Config(_))));
    }

    #[test]
    fn validate_rejects_shared_queue() {
        let mut config = ConductorConfig::default();
        config.cloud.queue = config.metal.queue.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_sub_token_bucket() {
        let mut config = ConductorConfig::default();
        config.cloud.bucket_capacity = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConductorConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConductorError::Config(_))));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[metal]\ndepth_cap = 4\n").unwrap();
        let config = ConductorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.metal.depth_cap, 4);
        assert_eq!(config.routing, RoutingTable::default());
    }
}
