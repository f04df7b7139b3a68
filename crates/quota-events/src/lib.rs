//! Subscribes to sandbox/snapshot/volume lifecycle events and applies their
//! usage deltas through the counter store. Holds no aggregate state of its
//! own — every mutation lands directly in the shared store.

use quota_core::calculate_delta;
use quota_core::types::{
    consumes_compute, consumes_disk, snapshot_counts, volume_counts, OrganizationId, QuotaKind,
    SandboxProjection, SnapshotProjection, VolumeProjection,
};
use quota_lock::LockProvider;
use quota_store::QuotaStore;
use std::sync::Arc;
use tracing::warn;

/// The six lifecycle events the sink handles. `*StateUpdated` variants carry
/// both the old and new projection so the delta can be computed against the
/// state transition rather than just the new state.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    SandboxCreated(SandboxProjection),
    SandboxStateUpdated {
        old: SandboxProjection,
        new: SandboxProjection,
    },
    SnapshotCreated(SnapshotProjection),
    SnapshotStateUpdated {
        old: SnapshotProjection,
        new: SnapshotProjection,
    },
    VolumeCreated(VolumeProjection),
    VolumeStateUpdated {
        old: VolumeProjection,
        new: VolumeProjection,
    },
}

impl LifecycleEvent {
    fn entity_lock_key(&self) -> String {
        match self {
            LifecycleEvent::SandboxCreated(p) => format!("sandbox:{}:quota-usage-update", p.id),
            LifecycleEvent::SandboxStateUpdated { new, .. } => {
                format!("sandbox:{}:quota-usage-update", new.id)
            }
            LifecycleEvent::SnapshotCreated(p) => format!("snapshot:{}:quota-usage-update", p.id),
            LifecycleEvent::SnapshotStateUpdated { new, .. } => {
                format!("snapshot:{}:quota-usage-update", new.id)
            }
            LifecycleEvent::VolumeCreated(p) => format!("volume:{}:quota-usage-update", p.id),
            LifecycleEvent::VolumeStateUpdated { new, .. } => {
                format!("volume:{}:quota-usage-update", new.id)
            }
        }
    }

    fn organization_id(&self) -> &OrganizationId {
        match self {
            LifecycleEvent::SandboxCreated(p) => &p.organization_id,
            LifecycleEvent::SandboxStateUpdated { new, .. } => &new.organization_id,
            LifecycleEvent::SnapshotCreated(p) => &p.organization_id,
            LifecycleEvent::SnapshotStateUpdated { new, .. } => &new.organization_id,
            LifecycleEvent::VolumeCreated(p) => &p.organization_id,
            LifecycleEvent::VolumeStateUpdated { new, .. } => &new.organization_id,
        }
    }
}

pub struct EventSink {
    store: Arc<dyn QuotaStore>,
    lock: Arc<dyn LockProvider>,
}

impl EventSink {
    pub fn new(store: Arc<dyn QuotaStore>, lock: Arc<dyn LockProvider>) -> Self {
        Self { store, lock }
    }

    /// Serializes per-entity on the entity-scoped lock, applies the event's
    /// delta, and swallows any failure at WARN: cache drift from a lost
    /// write is bounded by the staleness deadline's forced rehydrate.
    pub async fn handle(&self, event: LifecycleEvent) {
        let key = event.entity_lock_key();
        let org = event.organization_id().clone();

        let handle = match self.lock.wait_for_lock(&key).await {
            Ok(h) => h,
            Err(e) => {
                warn!(org = %org, key = %key, error = %e, "event sink: could not acquire entity lock");
                return;
            }
        };

        if let Err(e) = self.apply(&org, &event).await {
            warn!(org = %org, key = %key, error = %e, "event sink: delta application failed");
        }

        self.lock.unlock(handle).await;
    }

    async fn apply(
        &self,
        org: &OrganizationId,
        event: &LifecycleEvent,
    ) -> Result<(), quota_core::QuotaError> {
        match event {
            LifecycleEvent::SandboxCreated(p) => {
                self.store
                    .apply_delta_with_pending_settlement(org, QuotaKind::Cpu, p.cpu)
                    .await?;
                self.store
                    .apply_delta_with_pending_settlement(org, QuotaKind::Memory, p.mem)
                    .await?;
                self.store
                    .apply_delta_with_pending_settlement(org, QuotaKind::Disk, p.disk)
                    .await?;
                Ok(())
            }
            LifecycleEvent::SandboxStateUpdated { old, new } => {
                let cpu_delta = calculate_delta(new.cpu, &old.state, &new.state, |s| consumes_compute(*s));
                let mem_delta = calculate_delta(new.mem, &old.state, &new.state, |s| consumes_compute(*s));
                let disk_delta = calculate_delta(new.disk, &old.state, &new.state, |s| consumes_disk(*s));

                if cpu_delta != 0 {
                    self.store.apply_delta(org, QuotaKind::Cpu, cpu_delta).await?;
                }
                if mem_delta != 0 {
                    self.store.apply_delta(org, QuotaKind::Memory, mem_delta).await?;
                }
                if disk_delta != 0 {
                    self.store.apply_delta(org, QuotaKind::Disk, disk_delta).await?;
                }
                Ok(())
            }
            LifecycleEvent::SnapshotCreated(_) => {
                self.store.apply_delta(org, QuotaKind::SnapshotCount, 1).await
            }
            LifecycleEvent::SnapshotStateUpdated { old, new } => {
                let delta = calculate_delta(1, &old.state, &new.state, |s| snapshot_counts(*s));
                if delta != 0 {
                    self.store.apply_delta(org, QuotaKind::SnapshotCount, delta).await?;
                }
                Ok(())
            }
            LifecycleEvent::VolumeCreated(_) => {
                self.store.apply_delta(org, QuotaKind::VolumeCount, 1).await
            }
            LifecycleEvent::VolumeStateUpdated { old, new } => {
                let delta = calculate_delta(1, &old.state, &new.state, |s| volume_counts(*s));
                if delta != 0 {
                    self.store.apply_delta(org, QuotaKind::VolumeCount, delta).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quota_core::types::{OrganizationId, SandboxState, SnapshotState};
    use quota_lock::InMemoryLockProvider;
    use quota_store::InMemoryQuotaStore;

    fn org() -> OrganizationId {
        OrganizationId::from("acme")
    }

    #[tokio::test]
    async fn sandbox_created_settles_pending_and_increments_confirmed() {
        let store = Arc::new(InMemoryQuotaStore::new(60_000));
        let lock = Arc::new(InMemoryLockProvider::new());
        let sink = EventSink::new(store.clone(), lock);

        store
            .set_rehydrated(
                &org(),
                quota_core::types::ResourceFamily::Sandbox,
                &[(QuotaKind::Cpu, 2), (QuotaKind::Memory, 4), (QuotaKind::Disk, 10)],
            )
            .await
            .unwrap();
        store
            .increment_pending(&org(), &[(QuotaKind::Cpu, 1), (QuotaKind::Memory, 2), (QuotaKind::Disk, 5)])
            .await
            .unwrap();

        sink.handle(LifecycleEvent::SandboxCreated(SandboxProjection {
            id: "s3".into(),
            organization_id: org(),
            state: SandboxState::Running,
            cpu: 1,
            mem: 2,
            disk: 5,
        }))
        .await;

        assert_eq!(store.get_confirmed(&org(), QuotaKind::Cpu).await.unwrap(), Some(3));
        assert_eq!(store.get_pending(&org(), QuotaKind::Cpu).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn state_updated_to_non_disk_state_drops_disk_usage() {
        let store = Arc::new(InMemoryQuotaStore::new(60_000));
        let lock = Arc::new(InMemoryLockProvider::new());
        let sink = EventSink::new(store.clone(), lock);

        store
            .set_rehydrated(
                &org(),
                quota_core::types::ResourceFamily::Sandbox,
                &[(QuotaKind::Cpu, 2), (QuotaKind::Memory, 4), (QuotaKind::Disk, 20)],
            )
            .await
            .unwrap();

        let old = SandboxProjection {
            id: "s2".into(),
            organization_id: org(),
            state: SandboxState::Stopped,
            cpu: 4,
            mem: 8,
            disk: 10,
        };
        let new = SandboxProjection {
            state: SandboxState::Destroyed,
            ..old.clone()
        };
        sink.handle(LifecycleEvent::SandboxStateUpdated { old, new }).await;

        assert_eq!(store.get_confirmed(&org(), QuotaKind::Disk).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn same_state_transition_is_a_no_op() {
        let store = Arc::new(InMemoryQuotaStore::new(60_000));
        let lock = Arc::new(InMemoryLockProvider::new());
        let sink = EventSink::new(store.clone(), lock);

        store
            .set_rehydrated(&org(), quota_core::types::ResourceFamily::Snapshot, &[(QuotaKind::SnapshotCount, 5)])
            .await
            .unwrap();

        let snap = SnapshotProjection {
            id: "sn1".into(),
            organization_id: org(),
            state: SnapshotState::Active,
        };
        sink.handle(LifecycleEvent::SnapshotStateUpdated {
            old: snap.clone(),
            new: snap,
        })
        .await;

        assert_eq!(
            store.get_confirmed(&org(), QuotaKind::SnapshotCount).await.unwrap(),
            Some(5)
        );
    }

    #[tokio::test]
    async fn snapshot_created_increments_count() {
        let store = Arc::new(InMemoryQuotaStore::new(60_000));
        let lock = Arc::new(InMemoryLockProvider::new());
        let sink = EventSink::new(store.clone(), lock);
        store
            .set_rehydrated(&org(), quota_core::types::ResourceFamily::Snapshot, &[(QuotaKind::SnapshotCount, 0)])
            .await
            .unwrap();

        sink.handle(LifecycleEvent::SnapshotCreated(SnapshotProjection {
            id: "sn2".into(),
            organization_id: org(),
            state: SnapshotState::Creating,
        }))
        .await;

        assert_eq!(
            store.get_confirmed(&org(), QuotaKind::SnapshotCount).await.unwrap(),
            Some(1)
        );
    }
}
