use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use anyhow::Context;

use crate::detector::RetryPolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Per-attempt retry traces (target `LEDGER_TRACE`)
    pub enable_tracing: bool,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

fn default_max_connections() -> u32 {
    50
}

/// Conflict retry settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 5000,
            jitter_ratio: 0.25,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        RetryPolicy::new()
            .with_max_retries(c.max_retries)
            .with_base_delay(Duration::from_millis(c.base_delay_ms))
            .with_max_delay(Duration::from_millis(c.max_delay_ms))
            .with_jitter_ratio(c.jitter_ratio)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SimulatorConfig {
    pub enabled: bool,
    pub lock_delay_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_delay_ms: 50,
        }
    }
}

/// Demo workload run by the binary
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DemoConfig {
    /// Accounts 1..=accounts take part
    pub accounts: i64,
    /// Seed balance for the in-memory store
    pub initial_balance: i64,
    pub callers: usize,
    pub transfers_per_caller: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            accounts: 4,
            initial_balance: 1000,
            callers: 20,
            transfers_per_caller: 5,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}
