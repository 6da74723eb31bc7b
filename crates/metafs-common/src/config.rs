//! Configuration types for MetaFS
//!
//! This module defines configuration structures used across components.

use crate::types::FileLayout;
use serde::{Deserialize, Serialize};

/// Journal format written by freshly created journals.
pub const JOURNAL_FORMAT_RESILIENT: u32 = 1;

/// Metadata journal configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Segments kept before trim starts expiring the oldest ones
    pub max_segments: usize,
    /// Event count target for trim; `None` leaves it unbounded
    pub max_events: Option<u64>,
    /// Bound on segments whose expiry flushes may be in flight at once
    pub max_expiring: usize,
    /// Minimum acceptable on-disk journal format; older journals are
    /// rewritten on startup
    pub journal_format: u32,
    /// Skip events that fail to decode during replay instead of aborting
    pub skip_corrupt_events: bool,
    /// Journal a throwaway subtree map after every event to catch subtree
    /// replay bugs
    pub debug_subtrees: bool,
    /// Soft wall-clock budget for a single trim pass (milliseconds)
    pub trim_budget_ms: u64,
    /// Striping layout for newly created journals
    pub layout: FileLayout,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_segments: 30,
            max_events: None,
            max_expiring: 20,
            journal_format: JOURNAL_FORMAT_RESILIENT,
            skip_corrupt_events: false,
            debug_subtrees: false,
            trim_budget_ms: 2000,
            layout: FileLayout::default(),
        }
    }
}
