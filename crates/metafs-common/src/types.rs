//! Core identifier and layout types shared across MetaFS components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of a metadata server within the filesystem cluster.
pub type MdsId = u64;

/// Inode number, also used to name journal objects in the metadata pool.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNo(pub u64);

impl InodeNo {
    /// The null inode, used for the empty `back` slot of a journal pointer.
    pub const NULL: InodeNo = InodeNo(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for InodeNo {
    fn from(v: u64) -> Self {
        InodeNo(v)
    }
}

/// Base of the per-rank journal inode range.
pub const MDS_INO_LOG_OFFSET: u64 = 0x200;

/// Base of the per-rank backup journal inode range, used as the reformat
/// target slot.
pub const MDS_INO_LOG_BACKUP_OFFSET: u64 = 0x300;

/// The journal object a rank writes by default.
#[must_use]
pub fn default_log_ino(mds: MdsId) -> InodeNo {
    InodeNo(MDS_INO_LOG_OFFSET + mds)
}

/// The alternate journal object a rank rewrites into during reformat.
#[must_use]
pub fn backup_log_ino(mds: MdsId) -> InodeNo {
    InodeNo(MDS_INO_LOG_BACKUP_OFFSET + mds)
}

/// Striping layout of a journal over objects in the metadata pool.
///
/// The layout period is the natural segment alignment: the append path
/// starts a new segment whenever a write crosses a period boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    /// Size of each backing object in bytes
    pub object_size: u64,
    /// Number of objects striped over
    pub stripe_count: u64,
}

impl FileLayout {
    /// Bytes covered by one full stripe of objects
    #[must_use]
    pub fn period(&self) -> u64 {
        self.object_size * self.stripe_count
    }
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            object_size: 4 * 1024 * 1024, // 4 MB
            stripe_count: 1,
        }
    }
}

/// Coarse lifecycle state of the metadata server, as observed by the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdsState {
    Boot,
    Creating,
    Standby,
    StandbyReplay,
    Replay,
    Resolve,
    Reconnect,
    Rejoin,
    Active,
    Stopping,
}

impl MdsState {
    /// True while events are being replayed rather than submitted.
    #[must_use]
    pub fn is_any_replay(self) -> bool {
        matches!(self, Self::Replay | Self::StandbyReplay)
    }

    /// True while disambiguating imports after a cluster-wide restart.
    #[must_use]
    pub fn is_resolve(self) -> bool {
        matches!(self, Self::Resolve)
    }
}

/// Object-store operation priority.
pub type OpPriority = u8;

/// Lowest priority assigned to segment expiry flushes.
pub const PRIO_LOW: OpPriority = 64;

/// Highest priority assigned to segment expiry flushes.
pub const PRIO_HIGH: OpPriority = 196;

/// Interpolate flush priority from the expiry queue occupancy.
///
/// A nearly saturated expiry queue pushes urgency toward the storage layer.
#[must_use]
pub fn expiry_op_priority(expiring: usize, max_expiring: usize) -> OpPriority {
    if max_expiring == 0 {
        return PRIO_LOW;
    }
    let span = u64::from(PRIO_HIGH - PRIO_LOW);
    let boost = span * expiring as u64 / max_expiring as u64;
    PRIO_LOW + boost.min(span) as OpPriority
}
