use async_trait::async_trait;
use once_cell::sync::Lazy;
use quota_core::error::QuotaError;
use quota_core::keys::{confirmed_usage_key, pending_usage_key, staleness_key};
use quota_core::types::{OrganizationId, PendingSandboxUsage, QuotaKind, ResourceFamily, SandboxUsage};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::{QuotaStore, SandboxDualView};

/// `INCRBY` the confirmed key and refresh its TTL only if it already
/// exists; otherwise no-op. Applying a delta to an absent key would
/// resurrect a counter that was never rehydrated from the source of truth.
static APPLY_DELTA_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local delta = tonumber(ARGV[1])
        local ttl = tonumber(ARGV[2])
        if redis.call('exists', key) == 1 then
            redis.call('incrby', key, delta)
            redis.call('expire', key, ttl)
        end
        return 1
        "#,
    )
});

/// As above, plus — when `delta > 0` — settles the matching pending
/// counter down by `min(pending, delta)`, never below zero.
static APPLY_DELTA_WITH_SETTLEMENT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local confirmed_key = KEYS[1]
        local pending_key = KEYS[2]
        local delta = tonumber(ARGV[1])
        local ttl = tonumber(ARGV[2])

        if redis.call('exists', confirmed_key) == 1 then
            redis.call('incrby', confirmed_key, delta)
            redis.call('expire', confirmed_key, ttl)
        end

        if delta > 0 then
            local pending_raw = redis.call('get', pending_key)
            if pending_raw then
                local pending = tonumber(pending_raw)
                if pending and pending > 0 then
                    local dec = math.min(pending, delta)
                    redis.call('decrby', pending_key, dec)
                end
            end
        end
        return 1
        "#,
    )
});

pub struct RedisQuotaStore {
    conn: ConnectionManager,
    cache_ttl_seconds: u64,
    cache_max_age_ms: u64,
}

impl RedisQuotaStore {
    pub fn new(conn: ConnectionManager, cache_ttl_seconds: u64, cache_max_age_ms: u64) -> Self {
        Self {
            conn,
            cache_ttl_seconds,
            cache_max_age_ms,
        }
    }

    fn parse_non_negative(raw: Option<String>) -> Option<i64> {
        let raw = raw?;
        match raw.parse::<i64>() {
            Ok(v) if v >= 0 => Some(v),
            _ => None,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn get_confirmed(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
    ) -> Result<Option<i64>, QuotaError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(confirmed_usage_key(org, kind))
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(Self::parse_non_negative(raw))
    }

    async fn get_pending(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
    ) -> Result<Option<i64>, QuotaError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(pending_usage_key(org, kind))
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(Self::parse_non_negative(raw))
    }

    async fn is_stale(&self, org: &OrganizationId, family: ResourceFamily) -> Result<bool, QuotaError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(staleness_key(org, family))
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        let stamp = match raw.and_then(|s| s.parse::<i64>().ok()) {
            Some(s) => s,
            None => return Ok(true),
        };
        Ok(Self::now_ms() - stamp > self.cache_max_age_ms as i64)
    }

    async fn set_rehydrated(
        &self,
        org: &OrganizationId,
        family: ResourceFamily,
        values: &[(QuotaKind, i64)],
    ) -> Result<(), QuotaError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for &(kind, value) in values {
            pipe.set_ex(confirmed_usage_key(org, kind), value, self.cache_ttl_seconds)
                .ignore();
        }
        pipe.set(staleness_key(org, family), Self::now_ms()).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn apply_delta(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
        delta: i64,
    ) -> Result<(), QuotaError> {
        let mut conn = self.conn.clone();
        APPLY_DELTA_SCRIPT
            .key(confirmed_usage_key(org, kind))
            .arg(delta)
            .arg(self.cache_ttl_seconds)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn apply_delta_with_pending_settlement(
        &self,
        org: &OrganizationId,
        kind: QuotaKind,
        delta: i64,
    ) -> Result<(), QuotaError> {
        let mut conn = self.conn.clone();
        APPLY_DELTA_WITH_SETTLEMENT_SCRIPT
            .key(confirmed_usage_key(org, kind))
            .key(pending_usage_key(org, kind))
            .arg(delta)
            .arg(self.cache_ttl_seconds)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn increment_pending(
        &self,
        org: &OrganizationId,
        amounts: &[(QuotaKind, i64)],
    ) -> Result<Vec<i64>, QuotaError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for &(kind, amount) in amounts {
            let key = pending_usage_key(org, kind);
            pipe.incr(key.clone(), amount);
            pipe.expire(key, self.cache_ttl_seconds as i64).ignore();
        }
        let results: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(results)
    }

    async fn decrement_pending(
        &self,
        org: &OrganizationId,
        amounts: &[(QuotaKind, i64)],
    ) -> Result<(), QuotaError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for &(kind, amount) in amounts {
            pipe.decr(pending_usage_key(org, kind), amount).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_sandbox_dual_view(&self, org: &OrganizationId) -> Result<SandboxDualView, QuotaError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.get(confirmed_usage_key(org, QuotaKind::Cpu))
            .get(confirmed_usage_key(org, QuotaKind::Memory))
            .get(confirmed_usage_key(org, QuotaKind::Disk))
            .get(pending_usage_key(org, QuotaKind::Cpu))
            .get(pending_usage_key(org, QuotaKind::Memory))
            .get(pending_usage_key(org, QuotaKind::Disk));

        let raw: (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;

        let stale = self.is_stale(org, ResourceFamily::Sandbox).await?;
        let cpu = Self::parse_non_negative(raw.0);
        let mem = Self::parse_non_negative(raw.1);
        let disk = Self::parse_non_negative(raw.2);

        let confirmed = if stale {
            None
        } else {
            match (cpu, mem, disk) {
                (Some(cpu), Some(mem), Some(disk)) => Some(SandboxUsage { cpu, mem, disk }),
                _ => None,
            }
        };

        Ok(SandboxDualView {
            confirmed,
            pending: PendingSandboxUsage {
                cpu: Self::parse_non_negative(raw.3),
                mem: Self::parse_non_negative(raw.4),
                disk: Self::parse_non_negative(raw.5),
            },
        })
    }

    async fn reset_staleness(&self, org: &OrganizationId, family: ResourceFamily) -> Result<(), QuotaError> {
        let mut conn = self.conn.clone();
        conn.set(staleness_key(org, family), Self::now_ms())
            .await
            .map_err(|e| QuotaError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}
