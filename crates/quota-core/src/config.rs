/// Configuration injected into the counter store, staleness tracker, and
/// lock provider. No module holds these as mutable globals; every
/// component takes a `LedgerConfig` (or a field of it) at construction.
#[derive(Clone, Copy, Debug)]
pub struct LedgerConfig {
    /// TTL applied to every confirmed/pending counter key on write.
    pub cache_ttl_seconds: u64,
    /// Maximum age (ms) a staleness stamp may reach before the family is
    /// reported as a cache miss regardless of key presence.
    pub cache_max_age_ms: u64,
    /// TTL of a held lock before it auto-expires (crash recovery bound).
    pub lock_ttl_seconds: u64,
    /// Upper bound on how long `wait_for_lock` will retry before giving up.
    pub lock_wait_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 30,
            cache_max_age_ms: 60 * 60 * 1000,
            lock_ttl_seconds: 10,
            lock_wait_timeout_ms: 5_000,
        }
    }
}
