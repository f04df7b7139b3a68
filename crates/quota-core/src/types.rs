use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque tenant identifier. The accounting core never interprets its
/// contents — it is whatever primary key the relational store uses.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OrganizationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrganizationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrganizationId({})", self.0)
    }
}

/// A single quota dimension tracked by the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Cpu,
    Memory,
    Disk,
    SnapshotCount,
    VolumeCount,
}

impl QuotaKind {
    pub const ALL: [QuotaKind; 5] = [
        QuotaKind::Cpu,
        QuotaKind::Memory,
        QuotaKind::Disk,
        QuotaKind::SnapshotCount,
        QuotaKind::VolumeCount,
    ];

    /// The three kinds that admit a pending (reserved-but-unconfirmed) counter.
    pub const PENDING_ELIGIBLE: [QuotaKind; 3] =
        [QuotaKind::Cpu, QuotaKind::Memory, QuotaKind::Disk];

    /// The key-segment spelling — bit-exact with the store's key layout.
    pub fn as_key_segment(self) -> &'static str {
        match self {
            QuotaKind::Cpu => "cpu",
            QuotaKind::Memory => "memory",
            QuotaKind::Disk => "disk",
            QuotaKind::SnapshotCount => "snapshot_count",
            QuotaKind::VolumeCount => "volume_count",
        }
    }

    pub fn family(self) -> ResourceFamily {
        match self {
            QuotaKind::Cpu | QuotaKind::Memory | QuotaKind::Disk => ResourceFamily::Sandbox,
            QuotaKind::SnapshotCount => ResourceFamily::Snapshot,
            QuotaKind::VolumeCount => ResourceFamily::Volume,
        }
    }

    pub fn is_pending_eligible(self) -> bool {
        matches!(self, QuotaKind::Cpu | QuotaKind::Memory | QuotaKind::Disk)
    }
}

/// The three families of accounted resources, each sharing one staleness clock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFamily {
    Sandbox,
    Snapshot,
    Volume,
}

impl ResourceFamily {
    pub fn as_key_segment(self) -> &'static str {
        match self {
            ResourceFamily::Sandbox => "sandbox",
            ResourceFamily::Snapshot => "snapshot",
            ResourceFamily::Volume => "volume",
        }
    }

    /// The confirmed-counter kinds that share this family's staleness clock.
    pub fn kinds(self) -> &'static [QuotaKind] {
        match self {
            ResourceFamily::Sandbox => &[QuotaKind::Cpu, QuotaKind::Memory, QuotaKind::Disk],
            ResourceFamily::Snapshot => &[QuotaKind::SnapshotCount],
            ResourceFamily::Volume => &[QuotaKind::VolumeCount],
        }
    }
}

/// Lifecycle state of a sandbox, as persisted by the source of truth.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Error,
}

/// Lifecycle state of a snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Creating,
    Active,
    Deleting,
    Deleted,
    Failed,
}

/// Lifecycle state of a volume.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Provisioning,
    Attached,
    Detached,
    Deleting,
    Deleted,
    Error,
}

/// Sandbox states whose CPU and memory count toward usage.
pub const SANDBOX_STATES_CONSUMING_COMPUTE: &[SandboxState] = &[SandboxState::Running];

/// Sandbox states whose disk counts toward usage. Superset of compute: a
/// stopped sandbox releases its CPU/memory reservation but keeps its disk.
pub const SANDBOX_STATES_CONSUMING_DISK: &[SandboxState] =
    &[SandboxState::Running, SandboxState::Stopped];

/// Snapshot states that do NOT count toward `snapshot_count`.
pub const SNAPSHOT_USAGE_IGNORED_STATES: &[SnapshotState] = &[
    SnapshotState::Deleting,
    SnapshotState::Deleted,
    SnapshotState::Failed,
];

/// Volume states that do NOT count toward `volume_count`.
pub const VOLUME_USAGE_IGNORED_STATES: &[VolumeState] = &[
    VolumeState::Deleting,
    VolumeState::Deleted,
    VolumeState::Error,
];

impl SandboxState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            SandboxState::Provisioning => "provisioning",
            SandboxState::Running => "running",
            SandboxState::Stopping => "stopping",
            SandboxState::Stopped => "stopped",
            SandboxState::Destroying => "destroying",
            SandboxState::Destroyed => "destroyed",
            SandboxState::Error => "error",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "provisioning" => SandboxState::Provisioning,
            "running" => SandboxState::Running,
            "stopping" => SandboxState::Stopping,
            "stopped" => SandboxState::Stopped,
            "destroying" => SandboxState::Destroying,
            "destroyed" => SandboxState::Destroyed,
            "error" => SandboxState::Error,
            _ => return None,
        })
    }
}

impl SnapshotState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            SnapshotState::Creating => "creating",
            SnapshotState::Active => "active",
            SnapshotState::Deleting => "deleting",
            SnapshotState::Deleted => "deleted",
            SnapshotState::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => SnapshotState::Creating,
            "active" => SnapshotState::Active,
            "deleting" => SnapshotState::Deleting,
            "deleted" => SnapshotState::Deleted,
            "failed" => SnapshotState::Failed,
            _ => return None,
        })
    }
}

impl VolumeState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            VolumeState::Provisioning => "provisioning",
            VolumeState::Attached => "attached",
            VolumeState::Detached => "detached",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "provisioning" => VolumeState::Provisioning,
            "attached" => VolumeState::Attached,
            "detached" => VolumeState::Detached,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            _ => return None,
        })
    }
}

pub fn consumes_compute(state: SandboxState) -> bool {
    SANDBOX_STATES_CONSUMING_COMPUTE.contains(&state)
}

pub fn consumes_disk(state: SandboxState) -> bool {
    SANDBOX_STATES_CONSUMING_DISK.contains(&state)
}

pub fn snapshot_counts(state: SnapshotState) -> bool {
    !SNAPSHOT_USAGE_IGNORED_STATES.contains(&state)
}

pub fn volume_counts(state: VolumeState) -> bool {
    !VOLUME_USAGE_IGNORED_STATES.contains(&state)
}

/// Read-only sandbox projection, as supplied by the database adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxProjection {
    pub id: String,
    pub organization_id: OrganizationId,
    pub state: SandboxState,
    pub cpu: i64,
    pub mem: i64,
    pub disk: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotProjection {
    pub id: String,
    pub organization_id: OrganizationId,
    pub state: SnapshotState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeProjection {
    pub id: String,
    pub organization_id: OrganizationId,
    pub state: VolumeState,
}

/// Organization-level quota limits, read from the relational store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: OrganizationId,
    pub cpu_limit: i64,
    pub memory_limit: i64,
    pub disk_limit: i64,
    pub snapshot_count_limit: i64,
    pub volume_count_limit: i64,
}

/// Confirmed sandbox usage for the three sandbox-family kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxUsage {
    pub cpu: i64,
    pub mem: i64,
    pub disk: i64,
}

/// Pending (reserved, not-yet-confirmed) sandbox usage. `None` means the
/// pending counter is absent from cache, which callers treat as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSandboxUsage {
    pub cpu: Option<i64>,
    pub mem: Option<i64>,
    pub disk: Option<i64>,
}

/// Merged DTO returned by `get_usage_overview`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageOverview {
    pub organization_id: OrganizationId,
    pub cpu_limit: i64,
    pub memory_limit: i64,
    pub disk_limit: i64,
    pub snapshot_count_limit: i64,
    pub volume_count_limit: i64,
    pub current_cpu_usage: i64,
    pub current_memory_usage: i64,
    pub current_disk_usage: i64,
    pub current_snapshot_count: i64,
    pub current_volume_count: i64,
}

/// Which pending kinds `increment_pending_sandbox_usage` actually incremented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIncrementResult {
    pub cpu_incremented: bool,
    pub memory_incremented: bool,
    pub disk_incremented: bool,
}
