//! Organization-limits lookup, kept as its own seam so a deployment can
//! source quota limits from a different system than the usage projections
//! (e.g. a billing/config service) without touching the usage-fetch path.

use std::sync::Arc;

use async_trait::async_trait;
use quota_core::error::QuotaError;
use quota_core::types::{OrganizationId, OrganizationRecord};
use quota_db::DbAdapter;

#[async_trait]
pub trait OrganizationRepo: Send + Sync {
    async fn fetch_organization(&self, org: &OrganizationId) -> Result<Option<OrganizationRecord>, QuotaError>;
}

/// Delegates straight through to a `DbAdapter`'s own organization lookup.
/// Used both for `PostgresDbAdapter` in production and `FakeDbAdapter` in
/// tests, via the `FakeOrganizationRepo` alias below.
pub struct DbBackedOrganizationRepo<T: DbAdapter> {
    db: Arc<T>,
}

impl<T: DbAdapter> DbBackedOrganizationRepo<T> {
    pub fn new(db: Arc<T>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl<T: DbAdapter> OrganizationRepo for DbBackedOrganizationRepo<T> {
    async fn fetch_organization(&self, org: &OrganizationId) -> Result<Option<OrganizationRecord>, QuotaError> {
        self.db.fetch_organization(org).await
    }
}

/// Alias used by test suites: same delegation, backed by the in-memory fake.
pub type FakeOrganizationRepo = DbBackedOrganizationRepo<quota_db::FakeDbAdapter>;
