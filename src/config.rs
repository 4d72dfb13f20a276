//! Configuration management for the escrow engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    pub ledger: LedgerConfig,
    pub custody: CustodyConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Application identifier carried in loan-terms memos
    pub app_id: String,
    /// Loan-terms memo schema version
    pub memo_version: String,
    /// Sentinel memo text on engine-submitted EscrowCancel
    pub cancel_memo: String,
    /// Sentinel memo text on engine-submitted EscrowFinish
    pub finish_memo: String,
    /// Funds cannot be released before creation + this many seconds
    pub minimum_hold_secs: u64,
    pub sweep_interval_secs: u64,
    pub poll_pause_ms: u64,
    pub max_attempts: u32,
    pub destination_tag: Option<u32>,
    pub source_tag: Option<u32>,
    pub max_channels: usize,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FeeConfig {
    /// Fee in drops for the first EscrowCancel attempt
    pub cancel_base_drops: u64,
    /// Fee in drops for the first EscrowFinish attempt (fulfillment surcharge)
    pub finish_base_drops: u64,
    /// Added per consecutive insufficient-fee result
    pub step_drops: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            cancel_base_drops: 10,
            finish_base_drops: 350,
            step_drops: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// WebSocket endpoints, tried in order on reset
    pub ws_urls: Vec<String>,
    pub request_timeout_secs: u64,
    pub book_limit: u32,
    /// Consecutive noNetwork failures before a forced reconnect
    pub max_network_errors: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustodyConfig {
    pub account: String,
    /// Name of the env var holding the Ed25519 family seed
    pub secret_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("ESCROW_ENGINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.ledger.ws_urls.is_empty() {
            anyhow::bail!("At least one ledger WebSocket URL must be configured");
        }
        if self.custody.account.is_empty() {
            anyhow::bail!("Custody account is not configured");
        }
        if self.engine.app_id.is_empty() {
            anyhow::bail!("engine.app_id must not be empty");
        }
        if self.engine.cancel_memo == self.engine.finish_memo {
            anyhow::bail!("Cancel and finish sentinel memos must differ");
        }
        if self.engine.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts must be at least 1");
        }
        if self.engine.minimum_hold_secs == 0 {
            tracing::warn!("minimum_hold_secs is 0 - escrows become finishable immediately");
        }

        Ok(())
    }

    /// Custody seed read from the configured environment variable
    pub fn custody_secret(&self) -> Result<String> {
        env::var(&self.custody.secret_env)
            .with_context(|| format!("Custody secret env {} is not set", self.custody.secret_env))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
