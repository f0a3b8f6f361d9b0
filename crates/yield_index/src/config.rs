//! Engine configuration.
//!
//! Load from: env `YIELD_INDEX_CONFIG_PATH`, or `./config/yield_index.json`, or
//! `./yield_index.json`. Missing files mean defaults; a file that exists but
//! does not parse is an error.

use crate::oracle::OracleConfig;
use crate::orchestrator::{AccrualCalendar, OrchestratorConfig, PeriodError, RollingWindows};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "YIELD_INDEX_CONFIG_PATH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Period(#[from] PeriodError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Accrual period length. Must divide a 365-day year.
    pub period_secs: u64,
    pub rolling_windows: RollingWindows,
    pub receipts_dir: PathBuf,
    pub oracle: OracleConfig,
    /// A run lease left by a crashed process lapses after this long.
    pub run_lease_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/yield_index.db"),
            period_secs: crate::orchestrator::DEFAULT_PERIOD_SECS,
            rolling_windows: RollingWindows::default(),
            receipts_dir: PathBuf::from("./data/receipts"),
            oracle: OracleConfig::default(),
            run_lease_secs: 900,
        }
    }
}

impl EngineConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.calendar()?;
        Ok(config)
    }

    /// Load config: env YIELD_INDEX_CONFIG_PATH, then ./config/yield_index.json, then ./yield_index.json.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let p = Path::new(&path);
            if p.exists() {
                return Self::load_from_path(p);
            }
        }
        for candidate in [
            Path::new("./config/yield_index.json"),
            Path::new("./yield_index.json"),
        ] {
            if candidate.exists() {
                return Self::load_from_path(candidate);
            }
        }
        Ok(Self::default())
    }

    pub fn calendar(&self) -> Result<AccrualCalendar, PeriodError> {
        AccrualCalendar::new(self.period_secs)
    }

    pub fn orchestrator(&self) -> Result<OrchestratorConfig, ConfigError> {
        Ok(OrchestratorConfig {
            calendar: self.calendar()?,
            windows: self.rolling_windows,
            fetch_timeout: Duration::from_secs(self.oracle.timeout_secs),
            lease_ttl: Duration::from_secs(self.run_lease_secs),
        })
    }
}
