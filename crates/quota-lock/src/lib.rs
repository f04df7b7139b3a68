//! Named-mutex facility over a shared store, so that locks are effective
//! across process replicas rather than just within one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use quota_core::error::QuotaError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// A held lock. Dropping it without calling `unlock` leaks the lock until
/// its TTL expires — callers are expected to always release explicitly.
/// Releasing twice is a no-op, not an error.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    owner: String,
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Blocks (cooperatively) until the lock is acquired or the provider's
    /// configured wait timeout elapses.
    async fn wait_for_lock(&self, key: &str) -> Result<LockHandle, QuotaError>;

    /// Releases a held lock. Tolerant of double-release: unlocking a lock
    /// already reassigned to a new owner (because the original TTL expired)
    /// is a warned no-op, never an error.
    async fn unlock(&self, handle: LockHandle);
}

/// Redis-backed `LockProvider`. `SET key owner EX ttl NX`, retried with
/// bounded exponential backoff; release is a compare-owner-then-DEL script
/// so a lock reassigned after TTL expiry is never stolen back.
pub struct RedisLockProvider {
    conn: ConnectionManager,
    ttl_seconds: u64,
    wait_timeout_ms: u64,
}

static UNLOCK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
        "#,
    )
});

const BACKOFF_BASE_MS: u64 = 20;
const BACKOFF_MAX_MS: u64 = 500;

impl RedisLockProvider {
    pub fn new(conn: ConnectionManager, ttl_seconds: u64, wait_timeout_ms: u64) -> Self {
        Self {
            conn,
            ttl_seconds,
            wait_timeout_ms,
        }
    }

    fn backoff_for_attempt(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
        let capped = exp.min(BACKOFF_MAX_MS);
        let jitter = rand::random::<u64>() % (capped / 2 + 1);
        Duration::from_millis(capped / 2 + jitter)
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn wait_for_lock(&self, key: &str) -> Result<LockHandle, QuotaError> {
        let owner = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + Duration::from_millis(self.wait_timeout_ms);
        let mut attempt = 0u32;
        let mut conn = self.conn.clone();

        loop {
            let acquired: bool = conn
                .set_options(
                    key,
                    owner.as_str(),
                    redis::SetOptions::default()
                        .with_expiration(redis::SetExpiry::EX(self.ttl_seconds as i64))
                        .conditional_set(redis::ExistenceCheck::NX),
                )
                .await
                .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;

            if acquired {
                return Ok(LockHandle {
                    key: key.to_string(),
                    owner,
                });
            }

            if Instant::now() >= deadline {
                return Err(QuotaError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: self.wait_timeout_ms,
                });
            }

            tokio::time::sleep(Self::backoff_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    async fn unlock(&self, handle: LockHandle) {
        let mut conn = self.conn.clone();
        let result: Result<i64, _> = UNLOCK_SCRIPT
            .key(&handle.key)
            .arg(&handle.owner)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(0) => warn!(key = %handle.key, "unlock: lock already reassigned or expired"),
            Ok(_) => {}
            Err(e) => warn!(key = %handle.key, error = %e, "unlock: store communication error"),
        }
    }
}

/// In-memory `LockProvider` used by the other crates' test suites. Acquires
/// unconditionally fail only on owner mismatch during unlock; there is no
/// real concurrency across processes to model, only the observable
/// acquire/release contract.
#[derive(Default)]
pub struct InMemoryLockProvider {
    held: Mutex<HashMap<String, String>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn wait_for_lock(&self, key: &str) -> Result<LockHandle, QuotaError> {
        let owner = uuid::Uuid::new_v4().to_string();
        loop {
            let mut held = self.held.lock().await;
            if !held.contains_key(key) {
                held.insert(key.to_string(), owner.clone());
                return Ok(LockHandle {
                    key: key.to_string(),
                    owner,
                });
            }
            drop(held);
            tokio::task::yield_now().await;
        }
    }

    async fn unlock(&self, handle: LockHandle) {
        let mut held = self.held.lock().await;
        if held.get(&handle.key) == Some(&handle.owner) {
            held.remove(&handle.key);
        } else {
            warn!(key = %handle.key, "unlock: lock already reassigned or expired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let lock = InMemoryLockProvider::new();
        let h1 = lock.wait_for_lock("org:x:fetch-sandbox-usage-from-db").await.unwrap();
        lock.unlock(h1).await;
        let h2 = lock.wait_for_lock("org:x:fetch-sandbox-usage-from-db").await.unwrap();
        lock.unlock(h2).await;
    }

    #[tokio::test]
    async fn double_unlock_is_tolerated() {
        let lock = InMemoryLockProvider::new();
        let h1 = lock.wait_for_lock("k").await.unwrap();
        let h2 = h1.clone();
        lock.unlock(h1).await;
        // Second release references a lock that's already gone; must not panic.
        lock.unlock(h2).await;
    }

    #[tokio::test]
    async fn concurrent_waiters_serialize() {
        use std::sync::Arc;
        let lock = Arc::new(InMemoryLockProvider::new());
        let h = lock.wait_for_lock("k").await.unwrap();

        let lock2 = Arc::clone(&lock);
        let waiter = tokio::spawn(async move { lock2.wait_for_lock("k").await.unwrap() });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        lock.unlock(h).await;
        let h2 = waiter.await.unwrap();
        lock.unlock(h2).await;
    }
}
