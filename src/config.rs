//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Database URL, pool size and per-call deadline
//! - Token signing
//! - Reward policy parameters
//!
//! `DATABASE_URL`, `JWT_SECRET`, `SERVER_HOST` and `SERVER_PORT` override the
//! file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::{DEFAULT_LEADERBOARD_LIMIT, DEFAULT_REFERRAL_BONUS};
use crate::store::pg::DEFAULT_POOL_MAX_SIZE;
use crate::store::DEFAULT_OP_TIMEOUT_SECS;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_hours: u64,
}

/// Reward policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    /// Credited to both the code owner and the redeemer
    pub referral_bonus: i64,
    pub leaderboard_limit: u32,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            referral_bonus: DEFAULT_REFERRAL_BONUS,
            leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_MAX_SIZE
}

fn default_op_timeout() -> u64 {
    DEFAULT_OP_TIMEOUT_SECS
}

fn default_token_ttl() -> u64 {
    24
}

impl Config {
    /// Load from config.toml or use defaults, then apply env overrides
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")?
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(url) = non_empty_env("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(secret) = non_empty_env("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(host) = non_empty_env("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = non_empty_env("SERVER_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.rewards.referral_bonus <= 0 {
            anyhow::bail!("rewards.referral_bonus must be positive");
        }
        if self.database.op_timeout_secs == 0 {
            anyhow::bail!("database.op_timeout_secs must be at least 1");
        }
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        let ttl_hours = self.auth.token_ttl_hours;
        if ttl_hours == 0 || ttl_hours.checked_mul(3600).is_none() {
            anyhow::bail!("auth.token_ttl_hours is out of range");
        }
        if self.rewards.leaderboard_limit == 0 {
            anyhow::bail!("rewards.leaderboard_limit must be at least 1");
        }
        Ok(())
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.database.op_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_hours.saturating_mul(3600))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
