use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::audit::secrets::is_placeholder;
use crate::error::{LedgerError, LedgerResult};

/// Shortest retention window the prune path will accept.
pub const MIN_RETENTION_DAYS: i64 = 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub admin_token: Option<String>,
    pub initial_secret: Option<String>,
    pub incremental_interval_secs: u64,
    pub full_scan_interval_secs: u64,
    pub missed_run_grace: u32,
    pub retention_days: i64,
    pub verify_page_size: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-ledger.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            admin_token: None,
            initial_secret: None,
            incremental_interval_secs: 3600,
            full_scan_interval_secs: 7 * 24 * 3600,
            missed_run_grace: 2,
            retention_days: 2555,
            verify_page_size: 500,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from an optional file and `AUDIT_LEDGER_*` environment variables.
    ///
    /// The file path comes from `AUDIT_LEDGER_CONFIG`, falling back to `audit-ledger.toml`
    /// in the working directory. Environment variables override file values.
    pub fn load() -> LedgerResult<Self> {
        let path = env::var("AUDIT_LEDGER_CONFIG").unwrap_or_else(|_| "audit-ledger.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> LedgerResult<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("AUDIT_LEDGER")
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LedgerError::Config(format!("Failed to read configuration: {}", e)))?;

        let config: LedgerConfig = settings
            .try_deserialize()
            .map_err(|e| LedgerError::Config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::Config("database_url must be set".to_string()));
        }

        if self.incremental_interval_secs == 0 || self.full_scan_interval_secs == 0 {
            return Err(LedgerError::Config(
                "verification intervals must be greater than zero".to_string(),
            ));
        }

        if self.missed_run_grace == 0 {
            return Err(LedgerError::Config(
                "missed_run_grace must be at least 1".to_string(),
            ));
        }

        if self.verify_page_size <= 0 {
            return Err(LedgerError::Config(format!(
                "verify_page_size ({}) must be positive",
                self.verify_page_size
            )));
        }

        if self.retention_days < MIN_RETENTION_DAYS {
            return Err(LedgerError::Config(format!(
                "retention_days ({}) is below the minimum of {}",
                self.retention_days, MIN_RETENTION_DAYS
            )));
        }

        if let Some(token) = &self.admin_token {
            if token.trim().is_empty() || is_placeholder(token.as_bytes()) {
                return Err(LedgerError::Config(
                    "admin_token must not be empty or a placeholder".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn incremental_interval(&self) -> Duration {
        Duration::from_secs(self.incremental_interval_secs)
    }

    pub fn full_scan_interval(&self) -> Duration {
        Duration::from_secs(self.full_scan_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.incremental_interval(), Duration::from_secs(3600));
        assert_eq!(config.full_scan_interval(), Duration::from_secs(604_800));
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_rejects_short_retention() {
        let config = LedgerConfig {
            retention_days: 30,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_rejects_placeholder_admin_token() {
        let config = LedgerConfig {
            admin_token: Some("changeme".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let config = LedgerConfig {
            verify_page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "database_url = \"sqlite://from-file.db\"").unwrap();
        writeln!(file, "incremental_interval_secs = 120").unwrap();
        writeln!(file, "verify_page_size = 50").unwrap();

        let config = LedgerConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.incremental_interval_secs, 120);
        assert_eq!(config.verify_page_size, 50);
        assert_eq!(config.server_port, 3000);
    }
}
