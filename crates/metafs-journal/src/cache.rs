//! Contracts consumed from the metadata cache and the embedding server.
//!
//! Segments do not hold pointers into cache internals. They carry opaque
//! [`DirtyHandle`] keys into the cache's dirty indices, and the cache keeps
//! its own notion of which segment a dirty object belongs to. Expiry asks
//! the cache to flush whatever a handle still refers to.

use crate::event::LogEvent;
use crate::gather::GatherSub;
use metafs_common::OpPriority;

/// Category of dirty metadata a segment is responsible for flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DirtyKind {
    Dirfrag,
    NewDirfrag,
    Inode,
    Dentry,
    OpenFile,
    ParentInode,
    DirfragTree,
}

/// Opaque key into one of the metadata cache's dirty indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirtyHandle {
    pub kind: DirtyKind,
    pub key: u64,
}

impl DirtyHandle {
    pub fn new(kind: DirtyKind, key: u64) -> Self {
        Self { kind, key }
    }
}

/// The journal's view of the metadata cache.
///
/// All calls happen under the coarse MDS mutex. Flushes started by
/// `start_flush` complete asynchronously; the cache's contract is that a
/// completed flush leaves the handle no longer dirty.
pub trait MetadataCache: Send {
    /// Build a subtree-map event reflecting current authoritative state.
    /// The returned event has kind [`crate::EventKind::SubtreeMap`].
    fn create_subtree_map(&mut self) -> LogEvent;

    /// Advance the stray-directory cursor. Called at each new segment start.
    fn advance_stray(&mut self);

    /// Apply one replayed event's side effects.
    fn replay_event(&mut self, event: &LogEvent);

    /// Whether the handle still refers to dirty state.
    fn is_dirty(&self, handle: DirtyHandle) -> bool;

    /// Start flushing whatever the handle refers to, completing `done`
    /// once the flush is durable.
    fn start_flush(&mut self, handle: DirtyHandle, prio: OpPriority, done: GatherSub);

    /// Cache trim pass, invoked after standby segment removal.
    fn trim(&mut self);
}

/// How the journal escalates unrecoverable stream failures.
pub trait FaultHandler: Send + Sync {
    /// The process has been fenced and must restart from scratch.
    fn respawn(&self);

    /// Orderly shutdown on an unhandled error.
    fn shutdown(&self);
}
