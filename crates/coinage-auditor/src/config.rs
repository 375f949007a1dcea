//! Auditor configuration

use std::path::{Path, PathBuf};

use coinage_core::{Currency, MasterPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{AuditorError, Result};

/// Configuration of the `deposits` check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Exchange whose confirmations are checked
    pub master_public_key: Option<MasterPublicKey>,

    /// Merchant-reported deposit confirmations (JSON lines)
    pub merchant_ledger: PathBuf,

    /// Exchange deposit ledger (JSON lines)
    pub exchange_ledger: PathBuf,

    /// Where the progress marker is kept
    pub progress_file: PathBuf,

    /// Currency of the exchange
    pub currency: String,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            master_public_key: None,
            merchant_ledger: PathBuf::from("deposit_confirmations.jsonl"),
            exchange_ledger: PathBuf::from("exchange_deposits.jsonl"),
            progress_file: PathBuf::from("deposit_progress.json"),
            currency: "KUDOS".to_string(),
        }
    }
}

impl AuditorConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuditorError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| AuditorError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn master(&self) -> Result<MasterPublicKey> {
        self.master_public_key
            .ok_or_else(|| AuditorError::Config("master_public_key is not set".to_string()))
    }

    pub fn currency(&self) -> Result<Currency> {
        Currency::new(&self.currency).map_err(|e| AuditorError::Config(e.to_string()))
    }
}
