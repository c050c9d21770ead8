use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backoff::Backoff;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),

    #[error("secrets passphrase must not be empty")]
    MissingPassphrase,

    #[error("credentials defined twice: {0}")]
    DuplicateCredentials(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Derives the 32-byte key that seals secrets at rest.
    pub passphrase: String,

    /// Every generated instance and runner name starts with this.
    #[serde(default = "default_prefix")]
    pub runner_prefix: String,

    /// Public base URL this controller is reachable at; webhook and
    /// instance callback URLs are derived from it.
    pub external_url: String,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub credentials: Vec<Credentials>,

    #[serde(default)]
    pub openstack: Vec<OpenStackCloud>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub tuning: Tuning,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_prefix() -> String {
    "gha".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OpenStackCloud {
    /// Provider name pools refer to.
    pub name: String,
    /// Profile in clouds.yaml.
    pub cloud: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: default_backend(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

/// Every interval, timeout and concurrency knob of the pool managers.
/// Defaults match the documented control-loop cadence; tests shrink them.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub reconcile_interval_secs: u64,
    pub observer_interval_secs: u64,
    pub sweeper_interval_secs: u64,
    pub tools_refresh_secs: u64,
    pub create_drain_secs: u64,
    pub create_concurrency: usize,
    pub delete_concurrency: usize,
    pub shutdown_grace_secs: u64,
    pub provider_settle_grace_secs: u64,
    pub provider_call_timeout_secs: u64,
    pub forge_call_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub create_retry_budget: u32,
    pub job_record_ttl_secs: u64,
    pub webhook_dedup_window: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            reconcile_interval_secs: 30,
            observer_interval_secs: 20,
            sweeper_interval_secs: 60,
            tools_refresh_secs: 900,
            create_drain_secs: 5,
            create_concurrency: 4,
            delete_concurrency: 4,
            shutdown_grace_secs: 30,
            provider_settle_grace_secs: 60,
            provider_call_timeout_secs: 60,
            forge_call_timeout_secs: 30,
            backoff_base_secs: 10,
            backoff_cap_secs: 300,
            create_retry_budget: 5,
            job_record_ttl_secs: 3600,
            webhook_dedup_window: 1024,
        }
    }
}

impl Tuning {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn observer_interval(&self) -> Duration {
        Duration::from_secs(self.observer_interval_secs)
    }

    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_secs)
    }

    pub fn tools_refresh(&self) -> Duration {
        Duration::from_secs(self.tools_refresh_secs)
    }

    pub fn create_drain(&self) -> Duration {
        Duration::from_secs(self.create_drain_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn provider_settle_grace(&self) -> Duration {
        Duration::from_secs(self.provider_settle_grace_secs)
    }

    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_call_timeout_secs)
    }

    pub fn forge_call_timeout(&self) -> Duration {
        Duration::from_secs(self.forge_call_timeout_secs)
    }

    pub fn job_record_ttl(&self) -> Duration {
        Duration::from_secs(self.job_record_ttl_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
            self.create_retry_budget,
        )
    }
}

impl Config {
    pub fn load(name: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name))
            .build()?;

        let cfg = settings.try_deserialize::<Config>()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.passphrase.is_empty() {
            return Err(ConfigError::MissingPassphrase);
        }
        let mut seen = std::collections::HashSet::new();
        for cred in &self.credentials {
            if !seen.insert(cred.name.as_str()) {
                return Err(ConfigError::DuplicateCredentials(cred.name.clone()));
            }
        }
        Ok(())
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.external_url.trim_end_matches('/'))
    }

    pub fn callback_url(&self) -> String {
        format!(
            "{}/api/v1/callbacks/status",
            self.external_url.trim_end_matches('/')
        )
    }

    pub fn metadata_url(&self) -> String {
        format!(
            "{}/api/v1/metadata",
            self.external_url.trim_end_matches('/')
        )
    }
}
