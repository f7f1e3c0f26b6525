//! Per-user request limits
//!
//! Two limits apply to every user except root:
//! - a burst limit on how many LFNs the user may hold at once
//! - a daily limit on how many new requests the user may place per UTC day

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_MAX_TRANSFER: usize = 3;
pub const DEFAULT_DAY_TRANSFER: u32 = 10;

/// Quota violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("Too many requests in progress; at most {limit} files may be requested at once")]
    TooManyActive { limit: usize },
    #[error("Daily limit of {limit} requests reached")]
    DailyLimit { limit: u32 },
}

/// Per-user limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub max_transfer: usize,
    pub day_transfer: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_transfer: DEFAULT_MAX_TRANSFER,
            day_transfer: DEFAULT_DAY_TRANSFER,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DailyUsage {
    day: NaiveDate,
    placed: u32,
}

/// Per-user request accounting
#[derive(Debug, Default)]
pub struct UserQuota {
    config: QuotaConfig,
    usage: Mutex<HashMap<String, DailyUsage>>,
}

impl UserQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> QuotaConfig {
        self.config
    }

    /// Count one new request for `user`, who currently holds `active` LFNs.
    pub fn admit(&self, user: &str, active: usize) -> Result<(), QuotaError> {
        self.admit_on(user, active, Utc::now().date_naive())
    }

    pub fn admit_on(&self, user: &str, active: usize, today: NaiveDate) -> Result<(), QuotaError> {
        if active >= self.config.max_transfer {
            warn!(user, active, limit = self.config.max_transfer, "Burst limit reached");
            return Err(QuotaError::TooManyActive {
                limit: self.config.max_transfer,
            });
        }

        let mut usage = self.usage.lock().unwrap_or_else(|p| p.into_inner());
        let entry = usage
            .entry(user.to_string())
            .or_insert(DailyUsage { day: today, placed: 0 });
        if entry.day != today {
            *entry = DailyUsage { day: today, placed: 0 };
        }
        if entry.placed >= self.config.day_transfer {
            warn!(user, limit = self.config.day_transfer, "Daily limit reached");
            return Err(QuotaError::DailyLimit {
                limit: self.config.day_transfer,
            });
        }
        entry.placed += 1;
        debug!(user, placed = entry.placed, "Request counted against daily quota");
        Ok(())
    }

    pub fn placed_today(&self, user: &str) -> u32 {
        let today = Utc::now().date_naive();
        self.usage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(user)
            .filter(|u| u.day == today)
            .map_or(0, |u| u.placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_burst_limit() {
        let quota = UserQuota::new(QuotaConfig {
            max_transfer: 2,
            day_transfer: 100,
        });
        assert!(quota.admit_on("alice", 0, day(1)).is_ok());
        assert!(quota.admit_on("alice", 1, day(1)).is_ok());
        assert_eq!(
            quota.admit_on("alice", 2, day(1)),
            Err(QuotaError::TooManyActive { limit: 2 })
        );
    }

    #[test]
    fn test_daily_limit_resets() {
        let quota = UserQuota::new(QuotaConfig {
            max_transfer: 10,
            day_transfer: 2,
        });
        quota.admit_on("bob", 0, day(1)).unwrap();
        quota.admit_on("bob", 0, day(1)).unwrap();
        assert_eq!(
            quota.admit_on("bob", 0, day(1)),
            Err(QuotaError::DailyLimit { limit: 2 })
        );
        // Other users are unaffected.
        quota.admit_on("carol", 0, day(1)).unwrap();
        // Next day starts over.
        quota.admit_on("bob", 0, day(2)).unwrap();
    }

    #[test]
    fn test_rejected_requests_are_not_counted() {
        let quota = UserQuota::new(QuotaConfig {
            max_transfer: 1,
            day_transfer: 1,
        });
        let today = Utc::now().date_naive();
        assert!(quota.admit_on("dave", 1, today).is_err());
        assert_eq!(quota.placed_today("dave"), 0);
        quota.admit("dave", 0).unwrap();
        assert_eq!(quota.placed_today("dave"), 1);
    }
}
