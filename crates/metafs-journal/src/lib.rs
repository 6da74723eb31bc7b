//! MetaFS metadata journal
//!
//! Turns the metadata server's append-only stream of mutation events into
//! a durable, segmented, replayable log in the object store. The crate
//! covers:
//! - the segmented append path with period-aligned rollover and safe
//!   oldest-first trimming
//! - the replay state machine that reconstructs segments and dispatches
//!   event side effects into the metadata cache
//! - startup recovery via the two-slot journal pointer, including the
//!   crash-safe online reformat of old-format journals
//!
//! The underlying byte stream ([`JournalStream`]), the metadata cache
//! ([`MetadataCache`]), and pointer persistence ([`PointerStore`]) are
//! consumed contracts; this crate orchestrates them under a single coarse
//! mutex that background threads release across blocking object-store
//! waits.

pub mod cache;
pub mod counters;
pub mod event;
pub mod gather;
pub mod log;
pub mod pointer;
mod recovery;
mod replay;
pub mod segment;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use cache::{DirtyHandle, DirtyKind, FaultHandler, MetadataCache};
pub use counters::{CountersSnapshot, JournalCounters};
pub use event::{EventKind, LogEvent};
pub use gather::{GatherBuilder, GatherSub};
pub use log::{Journal, PendingEvent};
pub use pointer::{JournalPointer, PointerStore};
pub use segment::LogSegment;
pub use stream::{
    Completion, JournalStream, StreamCallback, StreamError, StreamFactory, WriteErrorHandler,
};
