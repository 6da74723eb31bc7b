//! Consumed contract of the underlying journal byte stream.
//!
//! The stream knows how to append, prefetch, and truncate byte ranges in
//! the object store, and exposes the four monotone positions
//! `expire_pos <= read_pos <= safe_pos <= write_pos`. The journal core never
//! retries stream operations; retries are the stream's job.

use bytes::Bytes;
use metafs_common::{Error, FileLayout, InodeNo, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// One-shot completion callback for asynchronous stream operations.
pub type StreamCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Handler invoked when an asynchronous journal write fails.
pub type WriteErrorHandler = Box<dyn FnMut(StreamError) + Send + 'static>;

/// Errors latched by the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Backing objects are gone (trimmed or deleted)
    NotFound,
    /// The requested range is invalid, typically a stale head
    Invalid,
    /// This client has been fenced by the cluster
    Fenced,
    /// Anything else
    Other(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Invalid => write!(f, "invalid range"),
            Self::Fenced => write!(f, "fenced"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::NotFound => Error::NotFound("journal data object".into()),
            StreamError::Invalid => Error::Invalid("invalid journal range".into()),
            StreamError::Fenced => Error::Fenced,
            StreamError::Other(msg) => Error::Storage(msg),
        }
    }
}

/// The byte-stream abstraction backing a journal object.
///
/// Position getters are consistent when read under the coarse MDS mutex.
/// Completion callbacks may fire on arbitrary threads and must not assume
/// the mutex is held.
pub trait JournalStream: Send {
    /// Initialize a new journal in the object store.
    fn create(&mut self, layout: FileLayout, format: u32);

    /// Asynchronously read the header and bounds. Completes with success
    /// even if the journal is empty.
    fn recover(&mut self, done: StreamCallback);

    /// Reload the persisted head object.
    fn reread_head(&mut self, done: StreamCallback);

    /// Persist the head object (positions and layout).
    fn write_head(&mut self, done: Option<StreamCallback>);

    /// Delete all backing objects.
    fn erase(&mut self, done: StreamCallback);

    fn set_writeable(&mut self);
    fn set_readonly(&mut self);
    fn is_readonly(&self) -> bool;

    fn set_read_pos(&mut self, pos: u64);
    fn set_expire_pos(&mut self, pos: u64);
    fn set_write_pos(&mut self, pos: u64);

    /// Consume bytes and advance `write_pos`.
    fn append_entry(&mut self, bytes: Bytes);

    /// Hint to flush pending bytes; `done` fires once everything written
    /// so far is safe.
    fn flush(&mut self, done: Option<StreamCallback>);

    /// Fires when `safe_pos` reaches the `write_pos` at the time of the call.
    fn wait_for_flush(&mut self, done: StreamCallback);

    fn is_readable(&self) -> bool;

    /// Fires when either a new event is available or an error is latched.
    fn wait_for_readable(&mut self, done: StreamCallback);

    /// Synchronously read the next entry. Must be called only when
    /// `is_readable()`.
    fn try_read_entry(&mut self) -> Option<Bytes>;

    /// The latched error, if any.
    fn error(&self) -> Option<StreamError>;

    fn set_write_error_handler(&mut self, handler: WriteErrorHandler);

    fn write_pos(&self) -> u64;
    fn safe_pos(&self) -> u64;
    fn read_pos(&self) -> u64;
    fn expire_pos(&self) -> u64;

    fn layout(&self) -> FileLayout;

    /// Format version embedded in the head.
    fn stream_format(&self) -> u32;
}

/// Constructor seam for streams on arbitrary journal inodes, used by
/// recovery and reformat.
pub trait StreamFactory: Send + Sync {
    fn open_stream(&self, ino: InodeNo) -> Box<dyn JournalStream>;
}

/// One-shot waiter pairing a [`StreamCallback`] with a blocking `wait`.
///
/// Background threads issue a stream operation while holding the coarse
/// mutex, drop it, then block here until the completion lands.
pub struct Completion {
    state: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// The callback half. Completing it more than once keeps the first
    /// result.
    pub fn callback(&self) -> StreamCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |result| {
            let (slot, cond) = &*state;
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(result);
            }
            cond.notify_all();
        })
    }

    /// Block until the callback fires.
    pub fn wait(self) -> Result<()> {
        let (slot, cond) = &*self.state;
        let mut guard = slot.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            cond.wait(&mut guard);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
