//! Client configuration

use std::path::Path;

use coinage_core::{Currency, MasterPublicKey, RelativeTime};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default sampling rate for auditor reports (1 in N deposits)
pub const DEFAULT_AUDITOR_CHANCE: u32 = 20;

/// Retry budget for network and server failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,

    /// Backoff before the second attempt (milliseconds)
    pub base_delay_ms: u64,

    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 60_000,
        }
    }
}

/// Exchange client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Base URL of the exchange, without trailing slash
    pub base_url: String,

    /// Pinned master key; learned from the first key download when unset
    pub master_public_key: Option<MasterPublicKey>,

    /// Currency all amounts must use
    pub currency: String,

    /// Report 1 in N successful deposits to the auditors (1 reports all)
    pub auditor_chance: u32,

    /// Retry budget for exchange requests
    pub retry: RetryPolicy,

    /// Refresh the key set this long before it expires
    pub keys_refresh_margin: RelativeTime,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            master_public_key: None,
            currency: "KUDOS".to_string(),
            auditor_chance: DEFAULT_AUDITOR_CHANCE,
            retry: RetryPolicy::default(),
            keys_refresh_margin: RelativeTime::from_secs(60),
        }
    }
}

impl ExchangeConfig {
    /// The configured currency, parsed
    pub fn currency(&self) -> Result<Currency> {
        Currency::new(&self.currency).map_err(ProtocolError::caller)
    }

    /// Check the values a client cannot work with
    pub fn validate(&self) -> Result<()> {
        self.currency()?;
        if self.base_url.is_empty() {
            return Err(ProtocolError::CallerError("base_url is empty".to_string()));
        }
        if self.auditor_chance == 0 {
            return Err(ProtocolError::CallerError(
                "auditor_chance must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProtocolError::CallerError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ProtocolError::Config(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ProtocolError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ProtocolError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ProtocolError::Config(e.to_string()))?;
        Ok(())
    }
}
