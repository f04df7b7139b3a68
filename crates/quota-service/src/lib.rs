//! The public façade: resolves `getX` calls via cache-hit → lock →
//! re-check → rehydrate, and the pending-reservation operations. Depends
//! only on the `QuotaStore`, `LockProvider`, `DbAdapter`, and
//! `OrganizationRepo` seams — no concrete Redis or Postgres type appears in
//! a public signature, so the whole service is testable against in-memory
//! fakes.

mod org_repo;

pub use org_repo::{DbBackedOrganizationRepo, FakeOrganizationRepo, OrganizationRepo};

use std::sync::Arc;

use quota_core::types::{
    consumes_compute, consumes_disk, OrganizationId, PendingIncrementResult, PendingSandboxUsage,
    QuotaKind, ResourceFamily, SandboxUsage, UsageOverview,
};
use quota_core::QuotaError;
use quota_db::DbAdapter;
use quota_lock::LockProvider;
use quota_store::QuotaStore;
use tracing::debug;

pub struct UsageOverviewService {
    store: Arc<dyn QuotaStore>,
    lock: Arc<dyn LockProvider>,
    db: Arc<dyn DbAdapter>,
    orgs: Arc<dyn OrganizationRepo>,
}

impl UsageOverviewService {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        lock: Arc<dyn LockProvider>,
        db: Arc<dyn DbAdapter>,
        orgs: Arc<dyn OrganizationRepo>,
    ) -> Self {
        Self { store, lock, db, orgs }
    }

    fn lock_key(org: &OrganizationId, family: ResourceFamily) -> String {
        format!("org:{}:fetch-{}-usage-from-db", org.as_str(), family.as_key_segment())
    }

    /// cache-hit → lock → re-check → rehydrate, generic over the family
    /// being resolved. `fetch` does the adapter call; `values` are zipped
    /// against `family.kinds()` when writing through the store.
    async fn resolve_family<F, Fut>(
        &self,
        org: &OrganizationId,
        family: ResourceFamily,
        fetch: F,
    ) -> Result<Vec<i64>, QuotaError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<i64>, QuotaError>>,
    {
        if let Some(values) = self.store.get_confirmed_family(org, family).await? {
            return Ok(values);
        }

        let key = Self::lock_key(org, family);
        let handle = match self.lock.wait_for_lock(&key).await {
            Ok(handle) => handle,
            Err(QuotaError::LockTimeout { .. }) => {
                debug!(org = %org, family = ?family, "lock acquisition timed out, falling back to uncached read");
                return fetch().await;
            }
            Err(err) => return Err(err),
        };

        let result = async {
            if let Some(values) = self.store.get_confirmed_family(org, family).await? {
                debug!(org = %org, family = ?family, "rehydrate race: another writer already refreshed");
                return Ok(values);
            }

            let values = fetch().await?;
            let paired: Vec<(QuotaKind, i64)> =
                family.kinds().iter().copied().zip(values.iter().copied()).collect();
            self.store.set_rehydrated(org, family, &paired).await?;
            Ok(values)
        }
        .await;

        self.lock.unlock(handle).await;
        result
    }

    async fn resolve_sandbox_usage(&self, org: &OrganizationId) -> Result<SandboxUsage, QuotaError> {
        let db = self.db.clone();
        let org_owned = org.clone();
        let values = self
            .resolve_family(org, ResourceFamily::Sandbox, || {
                let db = db.clone();
                let org = org_owned.clone();
                async move {
                    let usage = db.fetch_sandbox_usage(&org).await?;
                    Ok(vec![usage.cpu, usage.mem, usage.disk])
                }
            })
            .await?;
        Ok(SandboxUsage {
            cpu: values[0],
            mem: values[1],
            disk: values[2],
        })
    }

    async fn resolve_snapshot_count(&self, org: &OrganizationId) -> Result<i64, QuotaError> {
        let db = self.db.clone();
        let org_owned = org.clone();
        let values = self
            .resolve_family(org, ResourceFamily::Snapshot, || {
                let db = db.clone();
                let org = org_owned.clone();
                async move { Ok(vec![db.fetch_snapshot_count(&org).await?]) }
            })
            .await?;
        Ok(values[0])
    }

    async fn resolve_volume_count(&self, org: &OrganizationId) -> Result<i64, QuotaError> {
        let db = self.db.clone();
        let org_owned = org.clone();
        let values = self
            .resolve_family(org, ResourceFamily::Volume, || {
                let db = db.clone();
                let org = org_owned.clone();
                async move { Ok(vec![db.fetch_volume_count(&org).await?]) }
            })
            .await?;
        Ok(values[0])
    }

    /// Subtracts `excludeSandboxId`'s current contribution from `usage`,
    /// clamped to zero, per its current state's membership in the
    /// compute/disk consume-sets.
    async fn apply_sandbox_exclusion(
        &self,
        org: &OrganizationId,
        usage: SandboxUsage,
        exclude_sandbox_id: Option<&str>,
    ) -> Result<SandboxUsage, QuotaError> {
        let Some(sandbox_id) = exclude_sandbox_id else {
            return Ok(usage);
        };
        let Some(projection) = self.db.fetch_sandbox_projection(org, sandbox_id).await? else {
            return Ok(usage);
        };

        let cpu_delta = if consumes_compute(projection.state) { projection.cpu } else { 0 };
        let mem_delta = if consumes_compute(projection.state) { projection.mem } else { 0 };
        let disk_delta = if consumes_disk(projection.state) { projection.disk } else { 0 };

        Ok(SandboxUsage {
            cpu: (usage.cpu - cpu_delta).max(0),
            mem: (usage.mem - mem_delta).max(0),
            disk: (usage.disk - disk_delta).max(0),
        })
    }

    pub async fn get_usage_overview(
        &self,
        org_id: &OrganizationId,
        org_arg: Option<&OrganizationId>,
    ) -> Result<UsageOverview, QuotaError> {
        if let Some(supplied) = org_arg {
            if supplied != org_id {
                return Err(QuotaError::BadRequest {
                    expected: org_id.as_str().to_string(),
                    got: supplied.as_str().to_string(),
                });
            }
        }

        let record = self
            .orgs
            .fetch_organization(org_id)
            .await?
            .ok_or_else(|| QuotaError::NotFound(org_id.as_str().to_string()))?;

        let sandbox = self.resolve_sandbox_usage(org_id).await?;
        let snapshot_count = self.resolve_snapshot_count(org_id).await?;
        let volume_count = self.resolve_volume_count(org_id).await?;

        Ok(UsageOverview {
            organization_id: org_id.clone(),
            cpu_limit: record.cpu_limit,
            memory_limit: record.memory_limit,
            disk_limit: record.disk_limit,
            snapshot_count_limit: record.snapshot_count_limit,
            volume_count_limit: record.volume_count_limit,
            current_cpu_usage: sandbox.cpu,
            current_memory_usage: sandbox.mem,
            current_disk_usage: sandbox.disk,
            current_snapshot_count: snapshot_count,
            current_volume_count: volume_count,
        })
    }

    pub async fn get_sandbox_usage_overview(
        &self,
        org_id: &OrganizationId,
        exclude_sandbox_id: Option<&str>,
    ) -> Result<SandboxUsage, QuotaError> {
        let usage = self.resolve_sandbox_usage(org_id).await?;
        self.apply_sandbox_exclusion(org_id, usage, exclude_sandbox_id).await
    }

    pub async fn get_snapshot_usage_overview(&self, org_id: &OrganizationId) -> Result<i64, QuotaError> {
        self.resolve_snapshot_count(org_id).await
    }

    pub async fn get_volume_usage_overview(&self, org_id: &OrganizationId) -> Result<i64, QuotaError> {
        self.resolve_volume_count(org_id).await
    }

    /// Sandbox confirmed usage plus the six-key linearizable dual view's
    /// pending half. Exclusion only ever adjusts the confirmed values.
    pub async fn get_sandbox_usage_overview_with_pending(
        &self,
        org_id: &OrganizationId,
        exclude_sandbox_id: Option<&str>,
    ) -> Result<(SandboxUsage, PendingSandboxUsage), QuotaError> {
        let dual = self.store.get_sandbox_dual_view(org_id).await?;

        let confirmed = match dual.confirmed {
            Some(usage) => usage,
            None => self.resolve_sandbox_usage(org_id).await?,
        };
        let confirmed = self
            .apply_sandbox_exclusion(org_id, confirmed, exclude_sandbox_id)
            .await?;

        Ok((confirmed, dual.pending))
    }

    /// Reserves headroom. A kind already consumed by `exclude_sandbox_id`'s
    /// current state is skipped — it is already counted in confirmed usage.
    pub async fn increment_pending_sandbox_usage(
        &self,
        org_id: &OrganizationId,
        cpu: i64,
        mem: i64,
        disk: i64,
        exclude_sandbox_id: Option<&str>,
    ) -> Result<PendingIncrementResult, QuotaError> {
        let already_consuming = match exclude_sandbox_id {
            Some(sandbox_id) => self
                .db
                .fetch_sandbox_projection(org_id, sandbox_id)
                .await?
                .map(|p| (consumes_compute(p.state), consumes_disk(p.state))),
            None => None,
        };
        let (skip_compute, skip_disk) = already_consuming.unwrap_or((false, false));

        let mut amounts = Vec::with_capacity(3);
        let mut result = PendingIncrementResult::default();
        if !skip_compute {
            amounts.push((QuotaKind::Cpu, cpu));
            result.cpu_incremented = true;
        }
        if !skip_compute {
            amounts.push((QuotaKind::Memory, mem));
            result.memory_incremented = true;
        }
        if !skip_disk {
            amounts.push((QuotaKind::Disk, disk));
            result.disk_incremented = true;
        }

        if !amounts.is_empty() {
            self.store.increment_pending(org_id, &amounts).await?;
        }
        Ok(result)
    }

    /// Releases a reservation. Only the supplied kinds are decremented; a
    /// floor at zero is enforced on read, not on write.
    pub async fn decrement_pending_sandbox_usage(
        &self,
        org_id: &OrganizationId,
        cpu: Option<i64>,
        mem: Option<i64>,
        disk: Option<i64>,
    ) -> Result<(), QuotaError> {
        let mut amounts = Vec::with_capacity(3);
        if let Some(cpu) = cpu {
            amounts.push((QuotaKind::Cpu, cpu));
        }
        if let Some(mem) = mem {
            amounts.push((QuotaKind::Memory, mem));
        }
        if let Some(disk) = disk {
            amounts.push((QuotaKind::Disk, disk));
        }
        if amounts.is_empty() {
            return Ok(());
        }
        self.store.decrement_pending(org_id, &amounts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quota_core::types::{OrganizationRecord, SandboxProjection, SandboxState};
    use quota_db::FakeDbAdapter;
    use quota_lock::{InMemoryLockProvider, LockHandle};
    use quota_store::clock::TestClock;
    use quota_store::InMemoryQuotaStore;

    /// Always times out. Used to exercise the uncached-read fallback.
    struct AlwaysTimesOutLock;

    #[async_trait]
    impl LockProvider for AlwaysTimesOutLock {
        async fn wait_for_lock(&self, key: &str) -> Result<LockHandle, QuotaError> {
            Err(QuotaError::LockTimeout {
                key: key.to_string(),
                waited_ms: 5_000,
            })
        }

        async fn unlock(&self, _handle: LockHandle) {}
    }

    fn org() -> OrganizationId {
        OrganizationId::from("O1")
    }

    fn service_with_clock(
        db: Arc<FakeDbAdapter>,
        clock: Arc<TestClock>,
        cache_max_age_ms: u64,
    ) -> (UsageOverviewService, Arc<InMemoryQuotaStore>) {
        let store = Arc::new(InMemoryQuotaStore::with_clock(cache_max_age_ms, clock));
        let lock = Arc::new(InMemoryLockProvider::new());
        let orgs = Arc::new(FakeOrganizationRepo::new(db.clone()));
        (
            UsageOverviewService::new(store.clone(), lock, db, orgs),
            store,
        )
    }

    fn service(db: Arc<FakeDbAdapter>) -> (UsageOverviewService, Arc<InMemoryQuotaStore>) {
        service_with_clock(db, Arc::new(TestClock::new(0)), 60_000)
    }

    fn seeded_db() -> Arc<FakeDbAdapter> {
        let db = FakeDbAdapter::new().with_organization(OrganizationRecord {
            id: org(),
            cpu_limit: 100,
            memory_limit: 200,
            disk_limit: 1000,
            snapshot_count_limit: 10,
            volume_count_limit: 10,
        });
        db.upsert_sandbox(SandboxProjection {
            id: "S1".into(),
            organization_id: org(),
            state: SandboxState::Running,
            cpu: 2,
            mem: 4,
            disk: 10,
        });
        db.upsert_sandbox(SandboxProjection {
            id: "S2".into(),
            organization_id: org(),
            state: SandboxState::Stopped,
            cpu: 4,
            mem: 8,
            disk: 20,
        });
        Arc::new(db)
    }

    #[tokio::test]
    async fn scenario_1_cold_read() {
        let (service, _store) = service(seeded_db());
        let usage = service.get_sandbox_usage_overview(&org(), None).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 2, mem: 4, disk: 30 });
    }

    #[tokio::test]
    async fn scenario_2_through_6_full_lifecycle() {
        let db = seeded_db();
        let clock = Arc::new(TestClock::new(0));
        let (service, store) = service_with_clock(db.clone(), clock.clone(), 1_000);

        // (1) cold read
        let usage = service.get_sandbox_usage_overview(&org(), None).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 2, mem: 4, disk: 30 });

        // (2) S2 transitions STOPPED -> DESTROYED, disk drops to 10 total.
        db.upsert_sandbox(SandboxProjection {
            id: "S2".into(),
            organization_id: org(),
            state: SandboxState::Destroyed,
            cpu: 4,
            mem: 8,
            disk: 20,
        });
        store.apply_delta(&org(), QuotaKind::Disk, -20).await.unwrap();
        let usage = service.get_sandbox_usage_overview(&org(), None).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 2, mem: 4, disk: 10 });

        // (3) reserve headroom for a prospective sandbox.
        let result = service
            .increment_pending_sandbox_usage(&org(), 1, 2, 5, None)
            .await
            .unwrap();
        assert!(result.cpu_incremented && result.memory_incremented && result.disk_incremented);
        let (confirmed, pending) = service
            .get_sandbox_usage_overview_with_pending(&org(), None)
            .await
            .unwrap();
        assert_eq!(confirmed, SandboxUsage { cpu: 2, mem: 4, disk: 10 });
        assert_eq!(pending, PendingSandboxUsage { cpu: Some(1), mem: Some(2), disk: Some(5) });

        // (4) the reservation materializes as a real sandbox.
        db.upsert_sandbox(SandboxProjection {
            id: "S3".into(),
            organization_id: org(),
            state: SandboxState::Running,
            cpu: 1,
            mem: 2,
            disk: 5,
        });
        store
            .apply_delta_with_pending_settlement(&org(), QuotaKind::Cpu, 1)
            .await
            .unwrap();
        store
            .apply_delta_with_pending_settlement(&org(), QuotaKind::Memory, 2)
            .await
            .unwrap();
        store
            .apply_delta_with_pending_settlement(&org(), QuotaKind::Disk, 5)
            .await
            .unwrap();
        let (confirmed, pending) = service
            .get_sandbox_usage_overview_with_pending(&org(), None)
            .await
            .unwrap();
        assert_eq!(confirmed, SandboxUsage { cpu: 3, mem: 6, disk: 15 });
        assert_eq!(pending, PendingSandboxUsage { cpu: Some(0), mem: Some(0), disk: Some(0) });

        // (5) exclude the just-created sandbox from the view.
        let usage = service
            .get_sandbox_usage_overview(&org(), Some("S3"))
            .await
            .unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 2, mem: 4, disk: 10 });

        // (6) force staleness, then the next read must go back to the adapter.
        clock.advance(1_001);
        let usage = service.get_sandbox_usage_overview(&org(), None).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 3, mem: 6, disk: 15 });
    }

    #[tokio::test]
    async fn mismatched_org_is_bad_request() {
        let (service, _store) = service(seeded_db());
        let err = service
            .get_usage_overview(&org(), Some(&OrganizationId::from("other")))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::BadRequest { .. }));
    }

    #[tokio::test]
    async fn unknown_org_is_not_found() {
        let (service, _store) = service(Arc::new(FakeDbAdapter::new()));
        let err = service.get_usage_overview(&org(), None).await.unwrap_err();
        assert!(matches!(err, QuotaError::NotFound(_)));
    }

    #[tokio::test]
    async fn lock_timeout_falls_back_to_uncached_read() {
        let db = seeded_db();
        let store = Arc::new(InMemoryQuotaStore::new(60_000));
        let lock = Arc::new(AlwaysTimesOutLock);
        let orgs = Arc::new(FakeOrganizationRepo::new(db.clone()));
        let service = UsageOverviewService::new(store.clone(), lock, db, orgs);

        let usage = service.get_sandbox_usage_overview(&org(), None).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 2, mem: 4, disk: 30 });

        // The fallback read must not have cached its result.
        assert!(store
            .get_confirmed_family(&org(), ResourceFamily::Sandbox)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn increment_pending_skips_kind_already_consumed_by_excluded_sandbox() {
        let db = seeded_db();
        db.upsert_sandbox(SandboxProjection {
            id: "S2".into(),
            organization_id: org(),
            state: SandboxState::Stopped,
            cpu: 4,
            mem: 8,
            disk: 20,
        });
        let (service, store) = service(db);

        let result = service
            .increment_pending_sandbox_usage(&org(), 1, 2, 5, Some("S2"))
            .await
            .unwrap();
        // S2 is STOPPED: it consumes disk but not cpu/mem, so only disk is skipped.
        assert!(result.cpu_incremented && result.memory_incremented && !result.disk_incremented);

        let pending = store.get_sandbox_dual_view(&org()).await.unwrap().pending;
        assert_eq!(pending, PendingSandboxUsage { cpu: Some(1), mem: Some(2), disk: None });
    }

    #[tokio::test]
    async fn increment_then_decrement_nets_to_prior_pending() {
        let (service, store) = service(seeded_db());

        service
            .increment_pending_sandbox_usage(&org(), 3, 6, 9, None)
            .await
            .unwrap();
        service
            .decrement_pending_sandbox_usage(&org(), Some(3), Some(6), Some(9))
            .await
            .unwrap();

        let pending = store.get_sandbox_dual_view(&org()).await.unwrap().pending;
        assert_eq!(pending, PendingSandboxUsage { cpu: Some(0), mem: Some(0), disk: Some(0) });
    }
}
