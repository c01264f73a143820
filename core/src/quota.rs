//! Admission control for the sandboxed code-execution resource.
//!
//! Access is gated twice: by subscription tier, then by a rolling daily
//! quota of *successful* runs. There is no scheduled reset job - a record
//! from a previous day is simply treated as absent when read, which resets
//! the quota implicitly at midnight UTC.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{NaiveDate, Utc};

use chatflow_types::{AdmissionError, UserId, UserTier};

/// Default daily limit of successful sandbox runs per user.
pub const DEFAULT_DAILY_LIMIT: u32 = 2;

/// Per-user, per-day counter of successful sandbox runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub successful_runs: u32,
}

/// Persistence interface for quota records.
///
/// The backing store is a collaborator: in-memory here, a database or a
/// distributed counter in a deployment. Implementations must serialize
/// access per user; the calendar day is part of the key, so stale records
/// need no cleanup to be correct.
pub trait QuotaStore: Send + Sync {
    /// Read the record for `(user, date)`, creating a zeroed one if absent.
    fn get_or_create(&self, user: &UserId, date: NaiveDate) -> QuotaRecord;

    /// Increment the successful-run counter for `(user, date)`.
    fn increment(&self, user: &UserId, date: NaiveDate);
}

/// In-memory quota store.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    runs: Mutex<HashMap<(UserId, NaiveDate), u32>>,
}

impl MemoryQuotaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn get_or_create(&self, user: &UserId, date: NaiveDate) -> QuotaRecord {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let count = *runs.entry((user.clone(), date)).or_insert(0);
        QuotaRecord {
            user_id: user.clone(),
            date,
            successful_runs: count,
        }
    }

    fn increment(&self, user: &UserId, date: NaiveDate) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        // Prior-day records for this user are dead weight once a new day
        // starts; drop them while we hold the lock anyway.
        runs.retain(|(u, d), _| u != user || *d == date);
        *runs.entry((user.clone(), date)).or_insert(0) += 1;
    }
}

/// Usage statistics for one user on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// Gates access to the sandbox resource behind tier and daily-quota checks.
///
/// The required call ordering is: tier check, rate-limit check, resource
/// allocation, execution, then [`track_usage`] - and `track_usage` only
/// after the execution is confirmed successful. Failed attempts never
/// consume quota; the checks are re-evaluated on the next attempt rather
/// than reserving a slot up front.
///
/// Date-taking variants exist because callers own the clock; the plain
/// methods use the current UTC day.
///
/// [`track_usage`]: AdmissionController::track_usage
pub struct AdmissionController {
    store: Arc<dyn QuotaStore>,
    required_tier: UserTier,
    daily_limit: u32,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("required_tier", &self.required_tier)
            .field("daily_limit", &self.daily_limit)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    #[must_use]
    pub fn new(store: Arc<dyn QuotaStore>, required_tier: UserTier, daily_limit: u32) -> Self {
        Self {
            store,
            required_tier,
            daily_limit,
        }
    }

    #[must_use]
    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Reject callers below the required tier. Checked before any resource
    /// is allocated.
    pub fn require_authorized_tier(&self, tier: UserTier) -> Result<(), AdmissionError> {
        if tier.meets(self.required_tier) {
            Ok(())
        } else {
            Err(AdmissionError::PremiumRequired {
                required: self.required_tier,
            })
        }
    }

    /// Reject the call if the user has exhausted today's quota.
    pub fn check_rate_limit(&self, user: &UserId) -> Result<(), AdmissionError> {
        self.check_rate_limit_on(user, today())
    }

    /// Rate-limit check against an explicit calendar day.
    pub fn check_rate_limit_on(&self, user: &UserId, date: NaiveDate) -> Result<(), AdmissionError> {
        let record = self.store.get_or_create(user, date);
        if record.successful_runs >= self.daily_limit {
            return Err(AdmissionError::QuotaExceeded {
                used: record.successful_runs,
                limit: self.daily_limit,
            });
        }
        Ok(())
    }

    /// Record one successful run for today.
    ///
    /// Call only after the sandboxed execution is confirmed to have
    /// succeeded - never before, never on failure.
    pub fn track_usage(&self, user: &UserId) {
        self.track_usage_on(user, today());
    }

    /// Record one successful run against an explicit calendar day.
    pub fn track_usage_on(&self, user: &UserId, date: NaiveDate) {
        self.store.increment(user, date);
        let record = self.store.get_or_create(user, date);
        tracing::info!(
            user = %user,
            used = record.successful_runs,
            limit = self.daily_limit,
            "sandbox usage tracked"
        );
    }

    /// Today's usage statistics for `user`.
    #[must_use]
    pub fn usage_stats(&self, user: &UserId) -> UsageStats {
        self.usage_stats_on(user, today())
    }

    /// Usage statistics for an explicit calendar day.
    #[must_use]
    pub fn usage_stats_on(&self, user: &UserId, date: NaiveDate) -> UsageStats {
        let record = self.store.get_or_create(user, date);
        UsageStats {
            used: record.successful_runs,
            limit: self.daily_limit,
            remaining: self.daily_limit.saturating_sub(record.successful_runs),
        }
    }
}

/// Quota days are pinned to UTC regardless of where users or servers sit.
fn today() -> NaiveDate {
    Utc::now().date_naive()
}
