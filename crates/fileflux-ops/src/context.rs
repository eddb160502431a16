//! Per-call operation contexts and the quota budget they carry.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use fileflux_core::{FsError, FsResult, ObserverSet, StorageScope};

/// Bytes an operation may still add, plus the growth it has recorded.
///
/// The allowance comes from a single quota query made when the operation was
/// admitted. Clones share state, so every context created for the same
/// operation draws from the same allowance.
#[derive(Debug, Clone)]
pub struct QuotaBudget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    /// Scope the allowance applies to; growth elsewhere is refused.
    gated: Option<StorageScope>,
    remaining: AtomicI64,
    usage: DashMap<StorageScope, i64>,
}

impl QuotaBudget {
    /// A budget allowing `allowed` bytes of growth in `scope`.
    pub fn new(scope: StorageScope, allowed: i64) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                gated: Some(scope),
                remaining: AtomicI64::new(allowed.max(0)),
                usage: DashMap::new(),
            }),
        }
    }

    /// A budget for operations that were not admitted through the quota
    /// gate. They may shrink storage but never grow it.
    pub fn ungated() -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                gated: None,
                remaining: AtomicI64::new(0),
                usage: DashMap::new(),
            }),
        }
    }

    /// The scope this budget was reserved for.
    pub fn scope(&self) -> Option<&StorageScope> {
        self.inner.gated.as_ref()
    }

    /// Bytes `scope` may still grow by.
    pub fn allowed_growth(&self, scope: &StorageScope) -> i64 {
        if self.inner.gated.as_ref() == Some(scope) {
            self.inner.remaining.load(Ordering::Acquire).max(0)
        } else {
            0
        }
    }

    /// Fail with `NoSpace` unless `delta` bytes fit into the allowance.
    pub fn ensure_growth(&self, scope: &StorageScope, delta: i64) -> FsResult<()> {
        if delta <= 0 || delta <= self.allowed_growth(scope) {
            Ok(())
        } else {
            Err(FsError::NoSpace)
        }
    }

    /// Record a size change (negative for shrinkage) in `scope`.
    pub fn record_growth(&self, scope: &StorageScope, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.inner.usage.entry(scope.clone()).or_insert(0) += delta;
        if self.inner.gated.as_ref() == Some(scope) {
            let _ = self
                .inner
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(delta))
                });
        }
    }

    /// Net growth recorded for `scope` and not yet drained.
    pub fn recorded_growth(&self, scope: &StorageScope) -> i64 {
        self.inner.usage.get(scope).map(|v| *v).unwrap_or(0)
    }

    /// Take every non-zero usage delta recorded so far.
    pub fn drain_usage(&self) -> Vec<(StorageScope, i64)> {
        let scopes: Vec<StorageScope> = self.inner.usage.iter().map(|e| e.key().clone()).collect();
        scopes
            .into_iter()
            .filter_map(|scope| self.inner.usage.remove(&scope))
            .filter(|(_, delta)| *delta != 0)
            .collect()
    }
}

/// State handed to one storage backend call.
///
/// A context is created for each primitive call and moved into it; it is not
/// `Clone`, so a backend cannot hold on to it past the call.
#[derive(Debug)]
pub struct OperationContext {
    budget: QuotaBudget,
    observers: Arc<ObserverSet>,
}

impl OperationContext {
    /// Create a context.
    pub fn new(budget: QuotaBudget, observers: Arc<ObserverSet>) -> Self {
        Self { budget, observers }
    }

    /// Bytes `scope` may still grow by during this operation.
    pub fn allowed_bytes_growth(&self, scope: &StorageScope) -> i64 {
        self.budget.allowed_growth(scope)
    }

    /// Fail with `NoSpace` unless `delta` bytes fit into the budget.
    pub fn ensure_growth(&self, scope: &StorageScope, delta: i64) -> FsResult<()> {
        self.budget.ensure_growth(scope, delta)
    }

    /// Record a size change performed by the backend.
    pub fn record_growth(&self, scope: &StorageScope, delta: i64) {
        self.budget.record_growth(scope, delta);
    }

    /// Observers to notify about changes.
    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }
}

/// Signed size change when a file goes from `old` to `new` bytes.
///
/// Sizes beyond `i64::MAX` cannot be accounted for and are refused with
/// `NoSpace`.
pub fn size_delta(new: u64, old: u64) -> FsResult<i64> {
    let new = i64::try_from(new).map_err(|_| FsError::NoSpace)?;
    let old = i64::try_from(old).map_err(|_| FsError::NoSpace)?;
    new.checked_sub(old).ok_or(FsError::NoSpace)
}

/// Mints a fresh [`OperationContext`] for every primitive call of one
/// operation.
#[derive(Debug, Clone)]
pub struct ContextFactory {
    budget: QuotaBudget,
    observers: Arc<ObserverSet>,
}

impl ContextFactory {
    /// Create a factory sharing `budget` across its contexts.
    pub fn new(budget: QuotaBudget, observers: Arc<ObserverSet>) -> Self {
        Self { budget, observers }
    }

    /// A factory for callers that never grow storage.
    pub fn ungated(observers: Arc<ObserverSet>) -> Self {
        Self::new(QuotaBudget::ungated(), observers)
    }

    /// A new context for one backend call.
    pub fn context(&self) -> OperationContext {
        OperationContext::new(self.budget.clone(), self.observers.clone())
    }

    /// The shared budget.
    pub fn budget(&self) -> &QuotaBudget {
        &self.budget
    }

    /// The shared observers.
    pub fn observers(&self) -> &Arc<ObserverSet> {
        &self.observers
    }
}
