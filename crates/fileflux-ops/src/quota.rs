//! Quota gate consulted before mutating operations.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use fileflux_core::StorageScope;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current usage and limit of one scope, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAndQuota {
    pub usage: i64,
    pub quota: i64,
}

impl UsageAndQuota {
    /// Bytes the scope may still grow by.
    pub fn allowed_growth(&self) -> i64 {
        self.quota.saturating_sub(self.usage).max(0)
    }
}

/// Errors returned by a quota gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("quota lookup failed for {scope}: {reason}")]
    LookupFailed { scope: StorageScope, reason: String },

    #[error("quota service unavailable")]
    Unavailable,
}

/// The external quota service.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Look up usage and quota for `scope`.
    async fn get_usage_and_quota(&self, scope: &StorageScope) -> Result<UsageAndQuota, QuotaError>;

    /// Record a change in `scope`'s usage.
    fn record_usage_delta(&self, scope: &StorageScope, delta: i64);
}

/// An in-process quota ledger.
///
/// Scopes without an explicit limit fall back to the default quota, which is
/// unlimited unless configured otherwise.
#[derive(Debug)]
pub struct MemoryQuota {
    limits: DashMap<StorageScope, i64>,
    usage: DashMap<StorageScope, i64>,
    default_quota: i64,
    failing: AtomicBool,
}

impl Default for MemoryQuota {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl MemoryQuota {
    /// A ledger where every scope is unlimited.
    pub fn unlimited() -> Self {
        Self::with_default_quota(i64::MAX)
    }

    /// A ledger whose scopes default to `quota` bytes.
    pub fn with_default_quota(quota: i64) -> Self {
        Self {
            limits: DashMap::new(),
            usage: DashMap::new(),
            default_quota: quota,
            failing: AtomicBool::new(false),
        }
    }

    /// Set the limit for one scope.
    pub fn set_quota(&self, scope: impl Into<StorageScope>, quota: i64) {
        self.limits.insert(scope.into(), quota);
    }

    /// Bytes currently recorded against `scope`.
    pub fn usage(&self, scope: &StorageScope) -> i64 {
        self.usage.get(scope).map(|v| *v).unwrap_or(0)
    }

    /// Make every subsequent lookup fail (or succeed again).
    pub fn fail_lookups(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

#[async_trait]
impl QuotaGate for MemoryQuota {
    async fn get_usage_and_quota(&self, scope: &StorageScope) -> Result<UsageAndQuota, QuotaError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(QuotaError::Unavailable);
        }
        let quota = self.limits.get(scope).map(|v| *v).unwrap_or(self.default_quota);
        Ok(UsageAndQuota {
            usage: self.usage(scope),
            quota,
        })
    }

    fn record_usage_delta(&self, scope: &StorageScope, delta: i64) {
        *self.usage.entry(scope.clone()).or_insert(0) += delta;
    }
}
