pub mod fake;
pub mod postgres;

use async_trait::async_trait;
use quota_core::error::QuotaError;
use quota_core::types::{OrganizationId, OrganizationRecord, SandboxProjection, SandboxUsage};

pub use fake::FakeDbAdapter;
pub use postgres::PostgresDbAdapter;

/// The single read path to the source of truth. One method per resource
/// family, plus the organization-limits lookup needed to build an
/// overview.
#[async_trait]
pub trait DbAdapter: Send + Sync {
    async fn fetch_sandbox_usage(&self, org: &OrganizationId) -> Result<SandboxUsage, QuotaError>;
    async fn fetch_snapshot_count(&self, org: &OrganizationId) -> Result<i64, QuotaError>;
    async fn fetch_volume_count(&self, org: &OrganizationId) -> Result<i64, QuotaError>;
    async fn fetch_organization(
        &self,
        org: &OrganizationId,
    ) -> Result<Option<OrganizationRecord>, QuotaError>;

    /// Looks up a single sandbox's current projection, used by the
    /// exclusion path when a caller wants usage as if one sandbox were absent.
    async fn fetch_sandbox_projection(
        &self,
        org: &OrganizationId,
        sandbox_id: &str,
    ) -> Result<Option<SandboxProjection>, QuotaError>;
}
