use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] ConfigError),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// General system settings
    pub system: SystemSettings,

    /// Network selection
    pub network: NetworkConfig,

    /// Redis configuration (the local record store)
    pub redis: RedisConfig,

    /// Blockchain-data / pricing provider configuration
    pub provider: ProviderConfig,

    /// Import pipeline tuning
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Enable debug mode
    pub debug_mode: bool,

    /// Balance refresh clears the table instead of calling the provider.
    /// Offline/testing toggle, off by default.
    pub dummy_balance_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network used when an operation does not specify one
    pub default_network: String,

    /// Networks the provider is queried on
    /// Supported values: ethereum, base, arbitrum, optimism, polygon
    pub enabled_networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider API key
    pub api_key: String,

    /// JSON-RPC base URL template; `{network}` is replaced per network
    pub rpc_base_url: String,

    /// Price REST API base URL
    pub price_base_url: String,

    /// Request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Page size for transfer requests (provider max: 1000)
    pub page_size: u32,

    /// Maximum retry attempts for rate-limited or timed-out requests
    pub max_retries: u32,

    /// Linear backoff step between retries in milliseconds
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Price cache hit tolerance around a target timestamp, in seconds
    pub price_tolerance_secs: i64,

    /// Historical series window before a transfer timestamp, in seconds
    pub price_window_before_secs: i64,

    /// Historical series window after a transfer timestamp, in seconds
    pub price_window_after_secs: i64,

    /// Series resolution requested from the price source
    pub price_resolution: String,

    /// Symbol used to value gas costs
    pub native_symbol: String,

    /// Fiat currency for valuations
    pub currency: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            system: SystemSettings {
                debug_mode: false,
                dummy_balance_mode: false,
            },
            network: NetworkConfig {
                default_network: "ethereum".to_string(),
                enabled_networks: vec!["ethereum".to_string(), "base".to_string()],
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            provider: ProviderConfig {
                api_key: "".to_string(), // Must be set in .env or config file
                rpc_base_url: "https://{network}.g.alchemy.com/v2".to_string(),
                price_base_url: "https://api.g.alchemy.com/prices/v1".to_string(),
                request_timeout_seconds: 30,
                page_size: 1000,
                max_retries: 3,
                retry_backoff_ms: 500,
            },
            import: ImportConfig {
                price_tolerance_secs: 300,       // cache hit within +/- 5 minutes
                price_window_before_secs: 120,   // series from 2 minutes before...
                price_window_after_secs: 1200,   // ...to 20 minutes after
                price_resolution: "5m".to_string(),
                native_symbol: "ETH".to_string(),
                currency: "usd".to_string(),
            },
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "Provider API key is required".to_string(),
            ));
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigurationError::InvalidValue(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.page_size == 0 || self.page_size > 1000 {
            return Err(ConfigurationError::InvalidValue(
                "Page size must be between 1 and 1000".to_string(),
            ));
        }

        Ok(())
    }
}

impl ImportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.price_tolerance_secs <= 0 {
            return Err(ConfigurationError::InvalidValue(
                "Price tolerance must be positive".to_string(),
            ));
        }

        if self.native_symbol.is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "Native symbol is required".to_string(),
            ));
        }

        Ok(())
    }
}

impl SystemConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config_builder = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&SystemConfig::default())?);

        // Add config file if it exists
        if config_path.as_ref().exists() {
            info!(
                "Loading configuration from: {}",
                config_path.as_ref().display()
            );
            config_builder = config_builder.add_source(File::from(config_path.as_ref()));
        } else {
            debug!("Config file not found, using defaults and environment variables");
        }

        // Add environment variables with prefix
        config_builder = config_builder.add_source(
            Environment::with_prefix("LEDGER")
                .try_parsing(true)
                .separator("__")
                .list_separator(","),
        );

        let config = config_builder.build()?;
        let mut system_config: SystemConfig = config.try_deserialize()?;

        // Normalize network names so whatever format the config used reaches
        // the provider in its expected form
        let original_networks = system_config.network.enabled_networks.clone();
        system_config.network.enabled_networks = original_networks
            .iter()
            .map(|network| {
                normalize_network(network).unwrap_or_else(|_| {
                    warn!("Skipping unsupported network in config: '{}'", network.trim());
                    network.trim().to_string()
                })
            })
            .collect();

        if original_networks != system_config.network.enabled_networks {
            info!(
                "Normalized enabled_networks in configuration: {:?} -> {:?}",
                original_networks, system_config.network.enabled_networks
            );
        }

        let original_default = system_config.network.default_network.clone();
        system_config.network.default_network = normalize_network(&original_default)
            .unwrap_or_else(|_| {
                warn!(
                    "Using original default_network as normalization failed: '{}'",
                    original_default
                );
                original_default.clone()
            });

        system_config.validate()?;

        Ok(system_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.provider.validate()?;
        self.import.validate()?;

        if self.network.enabled_networks.is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "At least one network must be enabled".to_string(),
            ));
        }

        if !self
            .network
            .enabled_networks
            .contains(&self.network.default_network)
        {
            return Err(ConfigurationError::InvalidValue(format!(
                "Default network '{}' is not in enabled_networks",
                self.network.default_network
            )));
        }

        Ok(())
    }

    /// Get configuration as a JSON value for diagnostics
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Normalize network names to the provider's expected identifiers.
pub fn normalize_network(input: &str) -> std::result::Result<String, String> {
    match input.trim().to_lowercase().as_str() {
        "ethereum" | "eth" | "mainnet" => Ok("ethereum".to_string()),
        "base" => Ok("base".to_string()),
        "arbitrum" | "arb" => Ok("arbitrum".to_string()),
        "optimism" | "op" => Ok("optimism".to_string()),
        "polygon" | "matic" => Ok("polygon".to_string()),
        _ => Err(format!("Unsupported network: '{}'", input)),
    }
}

/// Configuration manager for loading and managing system configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: SystemConfig,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Result<Self> {
        let config = SystemConfig::load()?;
        info!("Configuration loaded successfully");
        debug!("Configuration: {:#?}", config);

        Ok(Self { config })
    }

    /// Create configuration manager from a specific file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = SystemConfig::load_from_path(path)?;
        Ok(Self { config })
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Reload configuration from file and environment
    pub fn reload(&mut self) -> Result<()> {
        self.config = SystemConfig::load()?;
        info!("Configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.provider.api_key = "test-key".to_string();
        config
    }

    #[test]
    fn test_default_config_requires_api_key() {
        let config = SystemConfig::default();
        assert!(config.validate().is_err());
        assert!(config_with_key().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_page_size() {
        let mut config = config_with_key();
        config.provider.page_size = 0;
        assert!(config.validate().is_err());
        config.provider.page_size = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_default_network() {
        let mut config = config_with_key();
        config.network.default_network = "solana".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalize_network() {
        assert_eq!(normalize_network("ETH").unwrap(), "ethereum");
        assert_eq!(normalize_network(" mainnet ").unwrap(), "ethereum");
        assert_eq!(normalize_network("matic").unwrap(), "polygon");
        assert!(normalize_network("near").is_err());
    }

    #[test]
    fn test_import_defaults_match_cache_contract() {
        let config = SystemConfig::default();
        assert_eq!(config.import.price_tolerance_secs, 300);
        assert_eq!(config.import.price_window_before_secs, 120);
        assert_eq!(config.import.price_window_after_secs, 1200);
        assert_eq!(config.import.price_resolution, "5m");
    }
}
