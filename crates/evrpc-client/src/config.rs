use std::{fs, path::Path, time::Duration};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator as _;
use strum_macros::{Display, EnumIter, EnumString};

use crate::ipc::{Endpoint, TransportOptions};
use crate::pubsub::{RetryConfig, RetryPolicy, WaitStrategy};

pub const CONFIG_FILE: &str = "evrpc.toml";

/// Path of the configuration file, overrides [`CONFIG_FILE`]
pub const CONFIG_ENV: &str = "EVRPC_CONFIG";

/// Broker endpoint, overrides the `endpoint` key
pub const ENDPOINT_ENV: &str = "EVRPC_ENDPOINT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
enum ConfigSection {
    Endpoint,
    Topics,
    Retry,
    Transport,
}

fn get_valid_sections() -> Vec<String> {
    ConfigSection::iter().map(|s| s.to_string()).collect()
}

/// Client configuration as read from `evrpc.toml`
///
/// ```toml
/// endpoint = "unix:///tmp/evrpc-broker.sock"
/// topics = ["guns", "germs"]
///
/// [retry]
/// strategy = "random_exponential"
/// min_ms = 1000
/// max_ms = 45000
///
/// [transport]
/// request_timeout_ms = 30000
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Fixed,
    Exponential,
    #[default]
    RandomExponential,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    /// `false` turns retry off entirely, the first fault is returned
    pub enabled: bool,
    pub strategy: Strategy,
    /// fixed interval, exponential start, or random-exponential multiplier
    pub min_ms: u64,
    pub max_ms: u64,
    /// growth factor of the `exponential` strategy
    pub multiplier: f64,
    /// unset retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::default(),
            min_ms: 1_000,
            max_ms: 45_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        if !self.enabled {
            return RetryConfig::Disabled;
        }

        let min = Duration::from_millis(self.min_ms);
        let max = Duration::from_millis(self.max_ms);
        let wait = match self.strategy {
            Strategy::Fixed => WaitStrategy::Fixed(min),
            Strategy::Exponential => WaitStrategy::Exponential {
                min,
                max,
                multiplier: self.multiplier,
            },
            Strategy::RandomExponential => WaitStrategy::RandomExponential {
                multiplier: min,
                max,
            },
        };

        let policy = RetryPolicy::new(wait);
        match self.max_attempts {
            Some(attempts) => policy.max_attempts(attempts).into(),
            None => policy.into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub client_name: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let options = TransportOptions::default();
        Self {
            connect_timeout_ms: options.connect_timeout.as_millis() as u64,
            request_timeout_ms: options.request_timeout.as_millis() as u64,
            client_name: options.client_name,
        }
    }
}

impl TransportSettings {
    pub fn to_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            client_name: self.client_name.clone(),
        }
    }
}

impl ClientConfig {
    /// Load `path`, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path_str = path.as_ref().to_string_lossy().to_string();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {config_path_str}"))?;

        let mut config = Self::from_toml_str(&content, &config_path_str)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Find the configuration through `.env` and the environment
    ///
    /// Uses [`CONFIG_ENV`] when set, else `evrpc.toml` in the working
    /// directory when present, else defaults.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(env_file_path) => log::debug!("Loaded {}", env_file_path.display()),
            Err(e) => log::debug!("No .env file loaded: {e}"),
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(path);
        }
        if Path::new(CONFIG_FILE).exists() {
            return Self::load(CONFIG_FILE);
        }

        log::debug!("No configuration file found, using defaults");
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self> {
        let toml_value: toml::Value = toml::from_str(content)
            .with_context(|| format!("Failed to parse TOML content in {origin}"))?;
        Self::validate_sections(&toml_value, origin)?;

        let config: Self = toml::from_str(content)
            .with_context(|| format!("Failed to parse TOML config: {origin}"))?;
        config
            .endpoint()
            .with_context(|| format!("Invalid endpoint in {origin}"))?;
        Ok(config)
    }

    /// Reject top-level keys this client does not understand
    fn validate_sections(toml_value: &toml::Value, origin: &str) -> Result<()> {
        let table = toml_value.as_table().ok_or_else(|| {
            anyhow::anyhow!("Config file {origin} must contain a TOML table at root level")
        })?;

        let invalid_keys: Vec<&String> = table
            .keys()
            .filter(|key| key.parse::<ConfigSection>().is_err())
            .collect();

        if !invalid_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "Unknown keys found in {origin}: {invalid_keys:?}.\nValid keys are: {:?}",
                get_valid_sections()
            ));
        }

        Ok(())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENDPOINT_ENV) {
            log::debug!("Endpoint overridden by {ENDPOINT_ENV}: {endpoint}");
            self.endpoint = Some(endpoint);
        }
    }

    /// Configured endpoint, or [`Endpoint::default`]
    pub fn endpoint(&self) -> Result<Endpoint> {
        match &self.endpoint {
            Some(endpoint) => Ok(endpoint.parse()?),
            None => Ok(Endpoint::default()),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config()
    }

    pub fn transport_options(&self) -> TransportOptions {
        self.transport.to_options()
    }
}
