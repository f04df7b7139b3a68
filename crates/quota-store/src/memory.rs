//! In-memory `QuotaStore` used by every other crate's test suite, so the
//! cache-hit/rehydrate/staleness/pending arithmetic can be exercised
//! without a live Redis.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use quota_core::error::QuotaError;
use quota_core::keys::{confirmed_usage_key, pending_usage_key, staleness_key};
use quota_core::types::{OrganizationId, PendingSandboxUsage, QuotaKind, ResourceFamily, SandboxUsage};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::{QuotaStore, SandboxDualView};

#[derive(Default)]
struct Inner {
    confirmed: HashMap<String, i64>,
    pending: HashMap<String, i64>,
    staleness: HashMap<String, i64>,
}

pub struct InMemoryQuotaStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    cache_max_age_ms: u64,
}

impl InMemoryQuotaStore {
    pub fn new(cache_max_age_ms: u64) -> Self {
        Self::with_clock(cache_max_age_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(cache_max_age_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            cache_max_age_ms,
        }
    }

    fn valid(v: i64) -> Option<i64> {
        if v >= 0 {
            Some(v)
        } else {
            None
        }
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get_confirmed(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
    ) -> Result<Option<i64>, QuotaError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .confirmed
            .get(&confirmed_usage_key(org, kind))
            .copied()
            .and_then(Self::valid))
    }

    async fn get_pending(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
    ) -> Result<Option<i64>, QuotaError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pending
            .get(&pending_usage_key(org, kind))
            .copied()
            .and_then(Self::valid))
    }

    async fn is_stale(&self, org: &OrganizationId, family: ResourceFamily) -> Result<bool, QuotaError> {
        let inner = self.inner.lock().await;
        match inner.staleness.get(&staleness_key(org, family)) {
            None => Ok(true),
            Some(stamp) => Ok(self.clock.now_ms() - stamp > self.cache_max_age_ms as i64),
        }
    }

    async fn set_rehydrated(
        &self,
        org: &OrganizationId,
        family: ResourceFamily,
        values: &[(QuotaKind, i64)],
    ) -> Result<(), QuotaError> {
        let mut inner = self.inner.lock().await;
        for &(kind, value) in values {
            inner.confirmed.insert(confirmed_usage_key(org, kind), value);
        }
        inner
            .staleness
            .insert(staleness_key(org, family), self.clock.now_ms());
        Ok(())
    }

    async fn apply_delta(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
        delta: i64,
    ) -> Result<(), QuotaError> {
        let mut inner = self.inner.lock().await;
        let key = confirmed_usage_key(org, kind);
        if let Some(v) = inner.confirmed.get_mut(&key) {
            *v += delta;
        }
        Ok(())
    }

    async fn apply_delta_with_pending_settlement(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
        delta: i64,
    ) -> Result<(), QuotaError> {
        let mut inner = self.inner.lock().await;
        let confirmed_key = confirmed_usage_key(org, kind);
        if let Some(v) = inner.confirmed.get_mut(&confirmed_key) {
            *v += delta;
        }
        if delta > 0 {
            let pending_key = pending_usage_key(org, kind);
            if let Some(pending) = inner.pending.get_mut(&pending_key) {
                if *pending > 0 {
                    let dec = (*pending).min(delta);
                    *pending -= dec;
                }
            }
        }
        Ok(())
    }

    async fn increment_pending(
        &self,
        org: &OrganizationId,
        amounts: &[(QuotaKind, i64)],
    ) -> Result<Vec<i64>, QuotaError> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(amounts.len());
        for &(kind, amount) in amounts {
            let key = pending_usage_key(org, kind);
            let v = inner.pending.entry(key).or_insert(0);
            *v += amount;
            out.push(*v);
        }
        Ok(out)
    }

    async fn decrement_pending(
        &self,
        org: &OrganizationId,
        amounts: &[(QuotaKind, i64)],
    ) -> Result<(), QuotaError> {
        let mut inner = self.inner.lock().await;
        for &(kind, amount) in amounts {
            let key = pending_usage_key(org, kind);
            let v = inner.pending.entry(key).or_insert(0);
            *v -= amount;
        }
        Ok(())
    }

    async fn get_sandbox_dual_view(&self, org: &OrganizationId) -> Result<SandboxDualView, QuotaError> {
        let stale = self.is_stale(org, ResourceFamily::Sandbox).await?;
        let inner = self.inner.lock().await;
        let get_c = |k: QuotaKind| {
            inner
                .confirmed
                .get(&confirmed_usage_key(org, k))
                .copied()
                .and_then(Self::valid)
        };
        let get_p = |k: QuotaKind| {
            inner
                .pending
                .get(&pending_usage_key(org, k))
                .copied()
                .and_then(Self::valid)
        };

        let confirmed = if stale {
            None
        } else {
            match (get_c(QuotaKind::Cpu), get_c(QuotaKind::Memory), get_c(QuotaKind::Disk)) {
                (Some(cpu), Some(mem), Some(disk)) => Some(SandboxUsage { cpu, mem, disk }),
                _ => None,
            }
        };

        Ok(SandboxDualView {
            confirmed,
            pending: PendingSandboxUsage {
                cpu: get_p(QuotaKind::Cpu),
                mem: get_p(QuotaKind::Memory),
                disk: get_p(QuotaKind::Disk),
            },
        })
    }

    async fn reset_staleness(&self, org: &OrganizationId, family: ResourceFamily) -> Result<(), QuotaError> {
        let mut inner = self.inner.lock().await;
        inner
            .staleness
            .insert(staleness_key(org, family), self.clock.now_ms());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn org() -> OrganizationId {
        OrganizationId::from("acme")
    }

    #[tokio::test]
    async fn rehydrate_then_get_round_trips() {
        let store = InMemoryQuotaStore::new(60_000);
        store
            .set_rehydrated(
                &org(),
                ResourceFamily::Sandbox,
                &[(QuotaKind::Cpu, 2), (QuotaKind::Memory, 4), (QuotaKind::Disk, 30)],
            )
            .await
            .unwrap();
        assert_eq!(store.get_confirmed(&org(), QuotaKind::Cpu).await.unwrap(), Some(2));
        assert!(!store.is_stale(&org(), ResourceFamily::Sandbox).await.unwrap());
    }

    #[tokio::test]
    async fn apply_delta_is_noop_on_absent_key() {
        let store = InMemoryQuotaStore::new(60_000);
        store.apply_delta(&org(), QuotaKind::Cpu, 5).await.unwrap();
        assert_eq!(store.get_confirmed(&org(), QuotaKind::Cpu).await.unwrap(), None);
    }

    #[tokio::test]
    async fn apply_delta_with_settlement_drains_pending() {
        let store = InMemoryQuotaStore::new(60_000);
        store
            .set_rehydrated(&org(), ResourceFamily::Sandbox, &[(QuotaKind::Cpu, 2)])
            .await
            .unwrap();
        store
            .increment_pending(&org(), &[(QuotaKind::Cpu, 1)])
            .await
            .unwrap();
        store
            .apply_delta_with_pending_settlement(&org(), QuotaKind::Cpu, 1)
            .await
            .unwrap();
        assert_eq!(store.get_confirmed(&org(), QuotaKind::Cpu).await.unwrap(), Some(3));
        assert_eq!(store.get_pending(&org(), QuotaKind::Cpu).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn staleness_forces_miss_after_max_age() {
        let clock = Arc::new(TestClock::new(0));
        let store = InMemoryQuotaStore::with_clock(1_000, clock.clone());
        store
            .set_rehydrated(&org(), ResourceFamily::Sandbox, &[(QuotaKind::Cpu, 2)])
            .await
            .unwrap();
        assert!(!store.is_stale(&org(), ResourceFamily::Sandbox).await.unwrap());
        clock.advance(1_001);
        assert!(store.is_stale(&org(), ResourceFamily::Sandbox).await.unwrap());
    }

    #[tokio::test]
    async fn negative_pending_reads_as_none() {
        let store = InMemoryQuotaStore::new(60_000);
        store
            .decrement_pending(&org(), &[(QuotaKind::Cpu, 5)])
            .await
            .unwrap();
        assert_eq!(store.get_pending(&org(), QuotaKind::Cpu).await.unwrap(), None);
    }
}
