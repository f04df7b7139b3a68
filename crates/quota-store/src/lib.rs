pub mod clock;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use quota_core::error::QuotaError;
use quota_core::types::{OrganizationId, PendingSandboxUsage, QuotaKind, ResourceFamily, SandboxUsage};

pub use memory::InMemoryQuotaStore;
pub use redis_store::RedisQuotaStore;

/// Confirmed usage plus pending reservations for the sandbox family, read
/// under one atomic script to avoid torn reads across the six keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SandboxDualView {
    /// `None` if the family is a cache miss (any confirmed key absent, or stale).
    pub confirmed: Option<SandboxUsage>,
    pub pending: PendingSandboxUsage,
}

/// Typed accessors over the shared store for confirmed/pending counters and
/// the per-family staleness stamp.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// `None` if absent, non-numeric, or negative — all three read as a cache miss.
    async fn get_confirmed(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
    ) -> Result<Option<i64>, QuotaError>;

    async fn get_pending(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
    ) -> Result<Option<i64>, QuotaError>;

    async fn is_stale(&self, org: &OrganizationId, family: ResourceFamily) -> Result<bool, QuotaError>;

    /// Atomically sets every confirmed key of `family` (with TTL) then
    /// resets the family's staleness stamp. `values` must cover exactly
    /// `family.kinds()`.
    async fn set_rehydrated(
        &self,
        org: &OrganizationId,
        family: ResourceFamily,
        values: &[(QuotaKind, i64)],
    ) -> Result<(), QuotaError>;

    /// `INCRBY` + TTL refresh if the confirmed key exists; no-op (does not
    /// resurrect an evicted counter) if it is absent.
    async fn apply_delta(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
        delta: i64,
    ) -> Result<(), QuotaError>;

    /// As `apply_delta`, and — when `delta > 0` — also settles the matching
    /// pending counter down by `min(pending, delta)` in the same atomic
    /// script, so reservations materialize into confirmed usage without a
    /// window where both or neither have been updated.
    async fn apply_delta_with_pending_settlement(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
        delta: i64,
    ) -> Result<(), QuotaError>;

    /// `INCRBY` + TTL refresh for each kind, atomically. Returns the new
    /// values in the same order as `amounts`.
    async fn increment_pending(
        &self,
        org: &OrganizationId,
        amounts: &[(QuotaKind, i64)],
    ) -> Result<Vec<i64>, QuotaError>;

    /// `DECRBY` each selected kind, atomically. Does not refresh TTL.
    async fn decrement_pending(
        &self,
        org: &OrganizationId,
        amounts: &[(QuotaKind, i64)],
    ) -> Result<(), QuotaError>;

    /// The six-key (3 confirmed + 3 pending) linearizable read backing
    /// `getSandboxUsageOverviewWithPending`.
    async fn get_sandbox_dual_view(&self, org: &OrganizationId) -> Result<SandboxDualView, QuotaError>;

    async fn reset_staleness(&self, org: &OrganizationId, family: ResourceFamily) -> Result<(), QuotaError>;

    /// Convenience built on `get_confirmed` + `is_stale`: the whole family
    /// is a miss if stale or if any of its kinds is absent/invalid.
    /// Returns the values in `family.kinds()` order.
    async fn get_confirmed_family(
        &self,
        org: &OrganizationId,
        family: ResourceFamily,
    ) -> Result<Option<Vec<i64>>, QuotaError> {
        if self.is_stale(org, family).await? {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(family.kinds().len());
        for &kind in family.kinds() {
            match self.get_confirmed(org, kind).await? {
                Some(v) => out.push(v),
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    }
}
