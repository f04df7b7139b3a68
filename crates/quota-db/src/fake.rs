//! In-memory `DbAdapter` test double, backed by plain vectors of
//! projections. Used by the event-sink and overview-service test suites
//! in place of a live Postgres instance.

use std::sync::Mutex;

use async_trait::async_trait;
use quota_core::error::QuotaError;
use quota_core::types::{
    consumes_compute, consumes_disk, snapshot_counts, volume_counts, OrganizationId,
    OrganizationRecord, SandboxProjection, SandboxUsage, SnapshotProjection, VolumeProjection,
};

use crate::DbAdapter;

#[derive(Default)]
pub struct FakeDbAdapter {
    sandboxes: Mutex<Vec<SandboxProjection>>,
    snapshots: Mutex<Vec<SnapshotProjection>>,
    volumes: Mutex<Vec<VolumeProjection>>,
    organizations: Mutex<Vec<OrganizationRecord>>,
}

impl FakeDbAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organization(self, record: OrganizationRecord) -> Self {
        self.organizations.lock().unwrap().push(record);
        self
    }

    pub fn upsert_sandbox(&self, projection: SandboxProjection) {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        if let Some(existing) = sandboxes.iter_mut().find(|s| s.id == projection.id) {
            *existing = projection;
        } else {
            sandboxes.push(projection);
        }
    }

    pub fn upsert_snapshot(&self, projection: SnapshotProjection) {
        let mut snapshots = self.snapshots.lock().unwrap();
        if let Some(existing) = snapshots.iter_mut().find(|s| s.id == projection.id) {
            *existing = projection;
        } else {
            snapshots.push(projection);
        }
    }

    pub fn upsert_volume(&self, projection: VolumeProjection) {
        let mut volumes = self.volumes.lock().unwrap();
        if let Some(existing) = volumes.iter_mut().find(|v| v.id == projection.id) {
            *existing = projection;
        } else {
            volumes.push(projection);
        }
    }
}

#[async_trait]
impl DbAdapter for FakeDbAdapter {
    async fn fetch_sandbox_usage(&self, org: &OrganizationId) -> Result<SandboxUsage, QuotaError> {
        let sandboxes = self.sandboxes.lock().unwrap();
        let mut usage = SandboxUsage::default();
        for s in sandboxes.iter().filter(|s| &s.organization_id == org) {
            if consumes_compute(s.state) {
                usage.cpu += s.cpu;
                usage.mem += s.mem;
            }
            if consumes_disk(s.state) {
                usage.disk += s.disk;
            }
        }
        Ok(usage)
    }

    async fn fetch_snapshot_count(&self, org: &OrganizationId) -> Result<i64, QuotaError> {
        let snapshots = self.snapshots.lock().unwrap();
        Ok(snapshots
            .iter()
            .filter(|s| &s.organization_id == org && snapshot_counts(s.state))
            .count() as i64)
    }

    async fn fetch_volume_count(&self, org: &OrganizationId) -> Result<i64, QuotaError> {
        let volumes = self.volumes.lock().unwrap();
        Ok(volumes
            .iter()
            .filter(|v| &v.organization_id == org && volume_counts(v.state))
            .count() as i64)
    }

    async fn fetch_organization(
        &self,
        org: &OrganizationId,
    ) -> Result<Option<OrganizationRecord>, QuotaError> {
        Ok(self
            .organizations
            .lock()
            .unwrap()
            .iter()
            .find(|o| &o.id == org)
            .cloned())
    }

    async fn fetch_sandbox_projection(
        &self,
        org: &OrganizationId,
        sandbox_id: &str,
    ) -> Result<Option<SandboxProjection>, QuotaError> {
        Ok(self
            .sandboxes
            .lock()
            .unwrap()
            .iter()
            .find(|s| &s.organization_id == org && s.id == sandbox_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quota_core::types::SandboxState;

    fn org() -> OrganizationId {
        OrganizationId::from("acme")
    }

    #[tokio::test]
    async fn sums_only_compute_states() {
        let db = FakeDbAdapter::new();
        db.upsert_sandbox(SandboxProjection {
            id: "sb-1".into(),
            organization_id: org(),
            state: SandboxState::Running,
            cpu: 2,
            mem: 4,
            disk: 10,
        });
        db.upsert_sandbox(SandboxProjection {
            id: "sb-2".into(),
            organization_id: org(),
            state: SandboxState::Destroyed,
            cpu: 99,
            mem: 99,
            disk: 99,
        });
        let usage = db.fetch_sandbox_usage(&org()).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 2, mem: 4, disk: 10 });
    }

    #[tokio::test]
    async fn stopped_keeps_disk_drops_compute() {
        let db = FakeDbAdapter::new();
        db.upsert_sandbox(SandboxProjection {
            id: "sb-1".into(),
            organization_id: org(),
            state: SandboxState::Stopped,
            cpu: 2,
            mem: 4,
            disk: 30,
        });
        let usage = db.fetch_sandbox_usage(&org()).await.unwrap();
        assert_eq!(usage, SandboxUsage { cpu: 0, mem: 0, disk: 30 });
    }
}
