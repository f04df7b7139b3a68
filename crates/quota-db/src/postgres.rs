//! Postgres-backed `DbAdapter`. Plain aggregate SQL, no ORM — each method
//! is a single query against the source of truth.

use async_trait::async_trait;
use quota_core::error::QuotaError;
use quota_core::types::{
    OrganizationId, OrganizationRecord, SandboxProjection, SandboxState, SandboxUsage,
    SANDBOX_STATES_CONSUMING_COMPUTE, SANDBOX_STATES_CONSUMING_DISK, SNAPSHOT_USAGE_IGNORED_STATES,
    VOLUME_USAGE_IGNORED_STATES,
};
use sqlx::{Row, PgPool};

use crate::DbAdapter;

pub struct PostgresDbAdapter {
    pool: PgPool,
}

impl PostgresDbAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db_err(e: sqlx::Error) -> QuotaError {
        QuotaError::Database(e.to_string())
    }
}

fn as_db_strs<T: Copy>(states: &[T], to_str: impl Fn(T) -> &'static str) -> Vec<String> {
    states.iter().copied().map(to_str).map(str::to_string).collect()
}

#[async_trait]
impl DbAdapter for PostgresDbAdapter {
    async fn fetch_sandbox_usage(&self, org: &OrganizationId) -> Result<SandboxUsage, QuotaError> {
        let compute_states = as_db_strs(SANDBOX_STATES_CONSUMING_COMPUTE, SandboxState::as_db_str);
        let disk_states = as_db_strs(SANDBOX_STATES_CONSUMING_DISK, SandboxState::as_db_str);

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(cpu)  FILTER (WHERE state = ANY($2)), 0) AS cpu,
                COALESCE(SUM(mem)  FILTER (WHERE state = ANY($2)), 0) AS mem,
                COALESCE(SUM(disk) FILTER (WHERE state = ANY($3)), 0) AS disk
            FROM sandboxes
            WHERE organization_id = $1
            "#,
        )
        .bind(org.as_str())
        .bind(&compute_states)
        .bind(&disk_states)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(SandboxUsage {
            cpu: row.try_get("cpu").map_err(Self::db_err)?,
            mem: row.try_get("mem").map_err(Self::db_err)?,
            disk: row.try_get("disk").map_err(Self::db_err)?,
        })
    }

    async fn fetch_snapshot_count(&self, org: &OrganizationId) -> Result<i64, QuotaError> {
        let ignored = as_db_strs(SNAPSHOT_USAGE_IGNORED_STATES, quota_core::types::SnapshotState::as_db_str);
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM snapshots
            WHERE organization_id = $1 AND NOT (state = ANY($2))
            "#,
        )
        .bind(org.as_str())
        .bind(&ignored)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::db_err)?;
        row.try_get("n").map_err(Self::db_err)
    }

    async fn fetch_volume_count(&self, org: &OrganizationId) -> Result<i64, QuotaError> {
        let ignored = as_db_strs(VOLUME_USAGE_IGNORED_STATES, quota_core::types::VolumeState::as_db_str);
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM volumes
            WHERE organization_id = $1 AND NOT (state = ANY($2))
            "#,
        )
        .bind(org.as_str())
        .bind(&ignored)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::db_err)?;
        row.try_get("n").map_err(Self::db_err)
    }

    async fn fetch_organization(
        &self,
        org: &OrganizationId,
    ) -> Result<Option<OrganizationRecord>, QuotaError> {
        let row = sqlx::query(
            r#"
            SELECT id, cpu_limit, memory_limit, disk_limit, snapshot_count_limit, volume_count_limit
            FROM organizations WHERE id = $1
            "#,
        )
        .bind(org.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(OrganizationRecord {
            id: OrganizationId::from(row.try_get::<String, _>("id").map_err(Self::db_err)?),
            cpu_limit: row.try_get("cpu_limit").map_err(Self::db_err)?,
            memory_limit: row.try_get("memory_limit").map_err(Self::db_err)?,
            disk_limit: row.try_get("disk_limit").map_err(Self::db_err)?,
            snapshot_count_limit: row.try_get("snapshot_count_limit").map_err(Self::db_err)?,
            volume_count_limit: row.try_get("volume_count_limit").map_err(Self::db_err)?,
        }))
    }

    async fn fetch_sandbox_projection(
        &self,
        org: &OrganizationId,
        sandbox_id: &str,
    ) -> Result<Option<SandboxProjection>, QuotaError> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, state, cpu, mem, disk
            FROM sandboxes WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(org.as_str())
        .bind(sandbox_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?;

        let Some(row) = row else { return Ok(None) };
        let state_str: String = row.try_get("state").map_err(Self::db_err)?;
        let state = SandboxState::from_db_str(&state_str).ok_or_else(|| {
            QuotaError::Database(format!("unknown sandbox state {state_str:?}"))
        })?;

        Ok(Some(SandboxProjection {
            id: row.try_get("id").map_err(Self::db_err)?,
            organization_id: OrganizationId::from(
                row.try_get::<String, _>("organization_id").map_err(Self::db_err)?,
            ),
            state,
            cpu: row.try_get("cpu").map_err(Self::db_err)?,
            mem: row.try_get("mem").map_err(Self::db_err)?,
            disk: row.try_get("disk").map_err(Self::db_err)?,
        }))
    }
}
