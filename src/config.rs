//! Layered configuration: defaults, then an optional TOML file, then
//! environment variables (`BEC_*`), matching the teacher's figment-based
//! settings layering.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Metadata, Profile, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level service settings, shared by every binary in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub storage: StorageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            queue: QueueSettings::default(),
            worker: WorkerSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Broker connection parameters. Field names match the env vars named in
/// the CLI surface (`BEC_REDIS_HOST`/`BEC_REDIS_PORT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub redis_host: String,
    pub redis_port: u16,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            redis_host: "127.0.0.1".into(),
            redis_port: 6379,
        }
    }
}

/// Queue manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Bounded history of completed/stopped items kept per queue (spec §4.5: ≤50).
    pub history_depth: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { history_depth: 50 }
    }
}

/// Scan worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Wait-group poll interval in milliseconds (spec §5: 100ms).
    pub wait_poll_interval_ms: u64,
    /// Long-poll cap for broker pubsub waits, in seconds (spec §5: 10s).
    pub pubsub_timeout_secs: u64,
    /// Two interrupts within this window escalate deferred-pause to abort (spec §5: 10s).
    pub interrupt_escalation_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            wait_poll_interval_ms: 100,
            pubsub_timeout_secs: 10,
            interrupt_escalation_secs: 10,
        }
    }
}

/// File-writer sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub base_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
        }
    }
}

impl Provider for Settings {
    fn metadata(&self) -> Metadata {
        Metadata::named("beamline_fabric default settings")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

impl Settings {
    /// Load settings from defaults, optionally overlaid by a TOML file, then
    /// by `BEC_`-prefixed environment variables. `config_path` mirrors the
    /// `--config <path>` CLI flag of spec §6.3.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Settings::default());
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("BEC_").split("_"));
        figment.extract().map_err(ConfigError::Load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_expected_history_depth() {
        let settings = Settings::default();
        assert_eq!(settings.queue.history_depth, 50);
        assert_eq!(settings.worker.wait_poll_interval_ms, 100);
    }

    #[test]
    fn env_override_wins_over_defaults() {
        std::env::set_var("BEC_REDIS_HOST", "beamline-broker");
        let settings = Settings::load(None).expect("load settings");
        assert_eq!(settings.broker.redis_host, "beamline-broker");
        std::env::remove_var("BEC_REDIS_HOST");
    }
}
