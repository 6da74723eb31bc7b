//! Log segments
//!
//! A segment is one contiguous range of the journal delimited by
//! subtree-map events, and the unit of expiry. The segment with the
//! largest offset is the current segment; only the current segment grows.

use crate::cache::{DirtyHandle, MetadataCache};
use crate::gather::GatherBuilder;
use metafs_common::OpPriority;
use std::collections::BTreeSet;

/// In-memory record of one contiguous range of the log.
///
/// `offset` is the segment's identity and never changes. `end` advances as
/// events are attributed to the segment, and `num_events` counts them. The
/// dirty set keys metadata the cache must flush before this segment can
/// expire.
#[derive(Debug)]
pub struct LogSegment {
    /// Start position, immutable
    pub offset: u64,
    /// Position just past the last event attributed to this segment
    pub end: u64,
    /// Events attributed to this segment
    pub num_events: u64,
    dirty: BTreeSet<DirtyHandle>,
}

impl LogSegment {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            end: offset,
            num_events: 0,
            dirty: BTreeSet::new(),
        }
    }

    /// Attribute a dirty metadata object to this segment.
    pub fn record_dirty(&mut self, handle: DirtyHandle) {
        self.dirty.insert(handle);
    }

    /// Drop all dirty back-references without flushing. Used by standby
    /// trim, where the leader is responsible for the actual flushes.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    #[must_use]
    pub fn num_dirty(&self) -> usize {
        self.dirty.len()
    }

    /// Gather the flushes this segment still depends on.
    ///
    /// Handles the cache no longer considers dirty are dropped; a flush is
    /// started for each remaining one. An empty gather afterwards means the
    /// segment is ready to expire.
    pub fn try_to_expire(
        &mut self,
        cache: &mut dyn MetadataCache,
        gather: &mut GatherBuilder,
        prio: OpPriority,
    ) {
        self.dirty.retain(|handle| cache.is_dirty(*handle));
        for handle in &self.dirty {
            cache.start_flush(*handle, prio, gather.new_sub());
        }
    }
}
