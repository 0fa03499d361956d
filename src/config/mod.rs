use crate::eip::idempotent::IdempotentMode;
use crate::eip::throttle::{RejectionPolicy, ThrottleMode};
use crate::route::inflight::InFlightScope;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Engine-wide defaults read by component builders and the context.
///
/// Every section falls back to its defaults when missing from a file, so a
/// config file only needs to name what it changes.
///
/// # Examples
/// ```rust
/// use idemio_mediation::config::EngineConfig;
///
/// let config: EngineConfig = serde_json::from_str(r#"{"throttle": {"period_ms": 250}}"#).unwrap();
/// assert_eq!(config.throttle.period_ms, 250);
/// assert_eq!(config.inflight.max_inflight, 1000);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub shutdown: ShutdownConfig,
    pub throttle: ThrottleConfig,
    pub idempotent: IdempotentConfig,
    pub inflight: InFlightConfig,
    pub redelivery: RedeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Grace period granted to in-flight exchanges.
    pub timeout_ms: u64,
    /// Cancel pending work once the grace period is over.
    pub force_on_timeout: bool,
    /// Time cancelled steps get to fail their exchanges themselves. Exchanges
    /// still held afterwards are completed by the context.
    pub settle_ms: u64,
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            force_on_timeout: true,
            settle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub period_ms: u64,
    pub mode: ThrottleMode,
    pub max_pending: usize,
    pub rejection: RejectionPolicy,
}

impl ThrottleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            mode: ThrottleMode::default(),
            max_pending: 1_000,
            rejection: RejectionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdempotentConfig {
    pub eager: bool,
    pub skip_duplicate: bool,
    pub remove_on_failure: bool,
    pub completion_eager: bool,
    pub mode: IdempotentMode,
    /// Capacity of memory repositories. `None` keeps every key.
    pub repository_capacity: Option<usize>,
}

impl Default for IdempotentConfig {
    fn default() -> Self {
        Self {
            eager: true,
            skip_duplicate: true,
            remove_on_failure: true,
            completion_eager: false,
            mode: IdempotentMode::default(),
            repository_capacity: Some(1_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InFlightConfig {
    pub max_inflight: usize,
    pub resume_percent: u8,
    pub scope: InFlightScope,
}

impl Default for InFlightConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1_000,
            resume_percent: 70,
            scope: InFlightScope::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Redeliveries of a failed step. `0` disables redelivery and a negative
    /// value redelivers until the step succeeds.
    pub maximum_redeliveries: i32,
    pub redelivery_delay_ms: u64,
    pub maximum_redelivery_delay_ms: u64,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
}

impl RedeliveryConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn maximum_redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.maximum_redelivery_delay_ms)
    }
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1_000,
            maximum_redelivery_delay_ms: 60_000,
            use_exponential_backoff: false,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Config<C> {
    config: C,
}

impl<C> Config<C>
where
    C: Default + DeserializeOwned,
{
    pub fn new(provider: impl ConfigProvider<C>) -> Result<Self, ConfigProviderError> {
        provider.load().map(|config| Config { config })
    }

    pub fn get(&self) -> &C {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.config
    }

    pub fn into_inner(self) -> C {
        self.config
    }
}

pub trait ConfigProvider<C>
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError>;
}

pub struct DefaultConfigProvider;

impl<C> ConfigProvider<C> for DefaultConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(C::default())
    }
}

pub struct FileConfigProvider {
    pub base_path: String,
    pub config_name: String,
}

impl<C> ConfigProvider<C> for FileConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        let config_path = Path::new(&self.base_path).join(&self.config_name);
        let file = File::open(&config_path).map_err(|e| {
            let msg = format!("Could not open config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            let msg = format!("Could not load config file from reader: {}", e);
            ConfigProviderError::load_error(msg)
        })
    }
}

pub struct ProgrammaticConfigProvider<C> {
    pub config: C,
}

impl<C> ConfigProvider<C> for ProgrammaticConfigProvider<C>
where
    C: Default + DeserializeOwned + Clone,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(self.config.clone())
    }
}

#[derive(Error, Debug)]
pub enum ConfigProviderError {
    #[error("Could not load config file. {message}")]
    Load { message: String },
}

impl ConfigProviderError {
    #[inline]
    pub(crate) fn load_error(msg: impl Into<String>) -> Self {
        Self::Load {
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_provider() {
        let config: Config<EngineConfig> = Config::new(DefaultConfigProvider).unwrap();
        let config = config.get();
        assert_eq!(config.shutdown.timeout(), Duration::from_secs(300));
        assert!(config.shutdown.force_on_timeout);
        assert_eq!(config.throttle.period(), Duration::from_secs(1));
        assert_eq!(config.throttle.rejection, RejectionPolicy::CallerRuns);
        assert!(config.idempotent.eager);
        assert!(config.idempotent.skip_duplicate);
        assert!(config.idempotent.remove_on_failure);
        assert_eq!(config.idempotent.mode, IdempotentMode::Strict);
        assert_eq!(config.inflight.resume_percent, 70);
        assert_eq!(config.redelivery.maximum_redeliveries, 0);
        assert_eq!(config.redelivery.redelivery_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_file_provider_merges_defaults() {
        let dir = std::env::temp_dir().join(format!("idemio-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = File::create(dir.join("engine.json")).unwrap();
        file.write_all(
            br#"{"inflight": {"max_inflight": 10, "scope": "context"}, "idempotent": {"mode": "relaxed"}, "redelivery": {"maximum_redeliveries": 3}}"#,
        )
        .unwrap();

        let provider = FileConfigProvider {
            base_path: dir.to_string_lossy().to_string(),
            config_name: String::from("engine.json"),
        };
        let config: Config<EngineConfig> = Config::new(provider).unwrap();
        assert_eq!(config.get().inflight.max_inflight, 10);
        assert_eq!(config.get().inflight.resume_percent, 70);
        assert_eq!(config.get().inflight.scope, InFlightScope::Context);
        assert_eq!(config.get().idempotent.mode, IdempotentMode::Relaxed);
        assert_eq!(config.get().redelivery.maximum_redeliveries, 3);
        assert_eq!(config.get().redelivery.backoff_multiplier, 2.0);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_file_provider_missing_file() {
        let provider = FileConfigProvider {
            base_path: String::from("/nonexistent"),
            config_name: String::from("engine.json"),
        };
        let result: Result<Config<EngineConfig>, _> = Config::new(provider);
        assert!(matches!(result, Err(ConfigProviderError::Load { .. })));
    }

    #[test]
    fn test_programmatic_provider() {
        let mut engine = EngineConfig::default();
        engine.throttle.mode = ThrottleMode::AsyncDelayed;
        let config = Config::new(ProgrammaticConfigProvider { config: engine }).unwrap();
        assert_eq!(config.get().throttle.mode, ThrottleMode::AsyncDelayed);
    }
}
