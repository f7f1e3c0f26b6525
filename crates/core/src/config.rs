//! Manager configuration
//!
//! Values come from `FILEMOVER_*` environment variables with defaults for
//! anything unset. Unparseable values fall back to the default; values that
//! parse but make no sense are caught by `validate()`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::locator::DEFAULT_LOCATION_TTL;
use crate::quota::{QuotaConfig, DEFAULT_DAY_TRANSFER, DEFAULT_MAX_TRANSFER};
use crate::site_selector::{PriorityTable, SiteSelectionError, DEFAULT_PRIORITY_RULES};
use crate::supervisor::{TransferCommand, DEFAULT_POLL_INTERVAL};
use crate::worker_pool::WorkerPoolConfig;

pub const ENV_PREFIX: &str = "FILEMOVER_";
const PRIORITY_PREFIX: &str = "FILEMOVER_PRIORITY_";

pub const DEFAULT_BASE_DIRECTORY: &str = "/var/www/html";
pub const DEFAULT_MAX_SIZE_GB: f64 = 50.0;
pub const DEFAULT_MAX_MOVERS: usize = 5;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(90);
pub const DEFAULT_TRANSFER_COMMAND: &str =
    "srmcp -debug=true -use_urlcopy_script=true -srm_protocol_version=2 -retry_num=1";
pub const DEFAULT_PROTOCOL: &str = "srmv2";
pub const DEFAULT_ACTIVITY_RETENTION: Duration = Duration::from_secs(60 * 60);
const MAX_ACTIVITY_RETENTION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Invalid priority rules: {0}")]
    PriorityRule(#[from] SiteSelectionError),
}

fn parse_value<T: FromStr>(values: &BTreeMap<String, String>, name: &str) -> Option<T> {
    values.get(name).and_then(|v| v.trim().parse().ok())
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Transfer manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pool root; transferred files land at `<base>/<lfn path>`
    pub base_directory: PathBuf,
    /// Pool quota enforced by the sweeper
    pub max_size_gb: f64,
    /// Number of concurrent transfers
    pub max_movers: usize,
    pub sweep_interval: Duration,
    /// Copy tool and fixed flags; source and destination URL are appended
    pub transfer_command: String,
    /// Protocol asked of the replica catalog
    pub protocol: String,
    /// Site patterns by priority, lowest tried first
    pub priority_rules: Vec<(u32, String)>,
    /// LFNs one user may hold at once
    pub max_transfer: usize,
    /// New requests one user may place per day
    pub day_transfer: u32,
    /// Root of the per-user download views, if any
    pub download_area: Option<PathBuf>,
    pub poll_interval: Duration,
    pub location_ttl: Duration,
    pub join_timeout: Duration,
    pub cancel_grace: Duration,
    /// How long ended activity records are kept
    pub activity_retention: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        Self {
            base_directory: PathBuf::from(DEFAULT_BASE_DIRECTORY),
            max_size_gb: DEFAULT_MAX_SIZE_GB,
            max_movers: DEFAULT_MAX_MOVERS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            transfer_command: DEFAULT_TRANSFER_COMMAND.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            priority_rules: DEFAULT_PRIORITY_RULES
                .iter()
                .map(|(p, pattern)| (*p, pattern.to_string()))
                .collect(),
            max_transfer: DEFAULT_MAX_TRANSFER,
            day_transfer: DEFAULT_DAY_TRANSFER,
            download_area: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            location_ttl: DEFAULT_LOCATION_TTL,
            join_timeout: pool.join_timeout,
            cancel_grace: pool.cancel_grace,
            activity_retention: DEFAULT_ACTIVITY_RETENTION,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from `(name, value)` pairs; names without the
    /// `FILEMOVER_` prefix are ignored.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        let mut priorities: BTreeMap<u32, String> = BTreeMap::new();
        for (key, value) in vars {
            let key = key.as_ref();
            if let Some(level) = key.strip_prefix(PRIORITY_PREFIX) {
                if let Ok(level) = level.parse::<u32>() {
                    priorities.insert(level, value.into());
                }
            } else if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                values.insert(name.to_string(), value.into());
            }
        }

        let secs = |name: &str| parse_value(&values, name).map(Duration::from_secs);
        let defaults = Self::default();

        Self {
            base_directory: values
                .get("BASE_DIRECTORY")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.base_directory),
            max_size_gb: parse_value(&values, "MAX_SIZE_GB").unwrap_or(defaults.max_size_gb),
            max_movers: parse_value(&values, "MAX_MOVERS").unwrap_or(defaults.max_movers),
            sweep_interval: secs("SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
            transfer_command: values
                .get("TRANSFER_COMMAND")
                .cloned()
                .unwrap_or(defaults.transfer_command),
            protocol: values.get("PROTOCOL").cloned().unwrap_or(defaults.protocol),
            priority_rules: if priorities.is_empty() {
                defaults.priority_rules
            } else {
                priorities.into_iter().collect()
            },
            max_transfer: parse_value(&values, "MAX_TRANSFER").unwrap_or(defaults.max_transfer),
            day_transfer: parse_value(&values, "DAY_TRANSFER").unwrap_or(defaults.day_transfer),
            download_area: values
                .get("DOWNLOAD_AREA")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            poll_interval: secs("POLL_INTERVAL_SECS").unwrap_or(defaults.poll_interval),
            location_ttl: secs("LOCATION_TTL_SECS").unwrap_or(defaults.location_ttl),
            join_timeout: secs("JOIN_TIMEOUT_SECS").unwrap_or(defaults.join_timeout),
            cancel_grace: secs("CANCEL_GRACE_SECS").unwrap_or(defaults.cancel_grace),
            activity_retention: secs("ACTIVITY_RETENTION_SECS").unwrap_or(defaults.activity_retention),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_directory.as_os_str().is_empty() {
            return Err(invalid("base_directory", "must not be empty"));
        }
        if !self.max_size_gb.is_finite() || self.max_size_gb <= 0.0 {
            return Err(invalid(
                "max_size_gb",
                format!("{} is not a positive size", self.max_size_gb),
            ));
        }
        if self.max_movers == 0 {
            return Err(invalid("max_movers", "at least one mover is required"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("sweep_interval", "must be longer than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be longer than zero"));
        }
        if self.protocol.trim().is_empty() {
            return Err(invalid("protocol", "must not be empty"));
        }
        if self.max_transfer == 0 {
            return Err(invalid("max_transfer", "users must be allowed at least one file"));
        }
        if self.day_transfer == 0 {
            return Err(invalid("day_transfer", "users must be allowed at least one request a day"));
        }
        if self.activity_retention > MAX_ACTIVITY_RETENTION {
            return Err(invalid("activity_retention", "must not exceed a year"));
        }
        if let Some(area) = &self.download_area {
            if area.as_os_str().is_empty() {
                return Err(invalid("download_area", "must not be empty when set"));
            }
        }
        self.command()?;
        self.priority_table()?;
        Ok(())
    }

    /// Pool quota in bytes
    pub fn quota_bytes(&self) -> u64 {
        (self.max_size_gb * BYTES_PER_GB) as u64
    }

    pub fn command(&self) -> Result<TransferCommand, ConfigError> {
        TransferCommand::parse(&self.transfer_command)
            .map_err(|e| invalid("transfer_command", e.to_string()))
    }

    pub fn priority_table(&self) -> Result<PriorityTable, ConfigError> {
        Ok(PriorityTable::new(
            self.priority_rules.iter().map(|(p, s)| (*p, s.as_str())),
        )?)
    }

    pub fn quota(&self) -> QuotaConfig {
        QuotaConfig {
            max_transfer: self.max_transfer,
            day_transfer: self.day_transfer,
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.max_movers,
            join_timeout: self.join_timeout,
            cancel_grace: self.cancel_grace,
            ..WorkerPoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.quota_bytes(), 50 * 1024 * 1024 * 1024);
        assert_eq!(config.command().unwrap().program(), "srmcp");
        assert_eq!(config.priority_table().unwrap().levels().count(), 3);
        assert_eq!(config.worker_pool().workers, 5);
    }

    #[test]
    fn test_from_vars() {
        let config = ManagerConfig::from_vars([
            ("FILEMOVER_BASE_DIRECTORY", "/data/pool"),
            ("FILEMOVER_MAX_SIZE_GB", "0.5"),
            ("FILEMOVER_MAX_MOVERS", "2"),
            ("FILEMOVER_PRIORITY_1", "T2_"),
            ("FILEMOVER_PRIORITY_0", "T1_CH"),
            ("FILEMOVER_DOWNLOAD_AREA", "/data/users"),
            ("FILEMOVER_POLL_INTERVAL_SECS", "1"),
            ("FILEMOVER_ACTIVITY_RETENTION_SECS", "600"),
            ("HOME", "/root"),
        ]);
        assert_eq!(config.base_directory, PathBuf::from("/data/pool"));
        assert_eq!(config.quota_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.max_movers, 2);
        assert_eq!(
            config.priority_rules,
            vec![(0, "T1_CH".to_string()), (1, "T2_".to_string())]
        );
        assert_eq!(config.download_area, Some(PathBuf::from("/data/users")));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.activity_retention, Duration::from_secs(600));
        assert_eq!(config.protocol, DEFAULT_PROTOCOL);
        config.validate().unwrap();
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = ManagerConfig::from_vars([
            ("FILEMOVER_MAX_MOVERS", "lots"),
            ("FILEMOVER_PRIORITY_x", "T1"),
        ]);
        assert_eq!(config.max_movers, DEFAULT_MAX_MOVERS);
        assert_eq!(config.priority_rules.len(), DEFAULT_PRIORITY_RULES.len());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ManagerConfig::default();
        config.max_movers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "max_movers", .. })
        ));

        let mut config = ManagerConfig::default();
        config.max_size_gb = -1.0;
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.transfer_command = "   ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "transfer_command", .. })
        ));

        let mut config = ManagerConfig::default();
        config.priority_rules = vec![(0, "T1_(".into())];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PriorityRule(SiteSelectionError::InvalidPattern { priority: 0, .. }))
        ));

        let mut config = ManagerConfig::default();
        config.activity_retention = Duration::from_secs(400 * 24 * 60 * 60);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "activity_retention", .. })
        ));

        let mut config = ManagerConfig::default();
        config.priority_rules.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PriorityRule(SiteSelectionError::EmptyTable))
        ));
    }
}
