//! The store's key layout — bit-exact, since external collaborators
//! (operators, migration tooling) may read these directly.

use crate::types::{OrganizationId, QuotaKind, ResourceFamily};

pub fn confirmed_usage_key(org: &OrganizationId, kind: QuotaKind) -> String {
    format!("org:{}:quota:{}:usage", org.as_str(), kind.as_key_segment())
}

pub fn pending_usage_key(org: &OrganizationId, kind: QuotaKind) -> String {
    debug_assert!(kind.is_pending_eligible());
    format!("org:{}:pending-{}", org.as_str(), kind.as_key_segment())
}

pub fn staleness_key(org: &OrganizationId, family: ResourceFamily) -> String {
    format!(
        "org:{}:resource:{}:usage:fetched_at",
        org.as_str(),
        family.as_key_segment()
    )
}
