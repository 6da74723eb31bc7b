//! In-memory doubles for the stream, pointer store, metadata cache, and
//! fault handler contracts, shared by the unit tests.
//!
//! The doubles keep the contract semantics of the real collaborators:
//! appended entries become durable only when flushed, `recover` probes the
//! backing object past a stale head, and erase removes the object for every
//! stream that shares it. Completions fire inline; test callbacks must not
//! call back into the journal while it holds its own lock.

use crate::cache::{DirtyHandle, FaultHandler, MetadataCache};
use crate::event::{EventKind, LogEvent};
use crate::gather::GatherSub;
use crate::pointer::{JournalPointer, PointerStore};
use crate::stream::{
    JournalStream, StreamCallback, StreamError, StreamFactory, WriteErrorHandler,
};
use bytes::Bytes;
use metafs_common::{Error, FileLayout, InodeNo, OpPriority, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Per-entry framing overhead the double charges against positions.
const FRAME_OVERHEAD: u64 = 8;

/// Head state persisted per backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemHead {
    pub format: u32,
    pub layout: FileLayout,
    pub write_pos: u64,
    pub expire_pos: u64,
}

impl Default for MemHead {
    fn default() -> Self {
        Self {
            format: 0,
            layout: FileLayout::default(),
            write_pos: 0,
            expire_pos: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MemObject {
    exists: bool,
    entries: BTreeMap<u64, Vec<u8>>,
    head: MemHead,
    fail_next_erase: bool,
}

impl MemObject {
    fn probe_end(&self) -> u64 {
        self.entries
            .iter()
            .next_back()
            .map(|(pos, data)| pos + FRAME_OVERHEAD + data.len() as u64)
            .unwrap_or(0)
    }
}

/// In-memory object store doubling as the stream factory.
#[derive(Clone)]
pub(crate) struct MemObjectStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    objects: HashMap<InodeNo, Arc<Mutex<MemObject>>>,
    ctls: HashMap<InodeNo, MemStreamCtl>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
        }
    }

    fn object(&self, ino: InodeNo) -> Arc<Mutex<MemObject>> {
        Arc::clone(
            self.inner
                .lock()
                .objects
                .entry(ino)
                .or_insert_with(|| Arc::new(Mutex::new(MemObject::default()))),
        )
    }

    /// Control handle of the most recently opened stream on `ino`.
    pub fn ctl(&self, ino: InodeNo) -> Option<MemStreamCtl> {
        self.inner.lock().ctls.get(&ino).cloned()
    }

    pub fn object_exists(&self, ino: InodeNo) -> bool {
        self.inner
            .lock()
            .objects
            .get(&ino)
            .is_some_and(|obj| obj.lock().exists)
    }

    pub fn persisted_head(&self, ino: InodeNo) -> Option<MemHead> {
        let obj = self.inner.lock().objects.get(&ino)?.clone();
        let obj = obj.lock();
        obj.exists.then_some(obj.head)
    }

    pub fn fail_next_erase(&self, ino: InodeNo) {
        self.object(ino).lock().fail_next_erase = true;
    }
}

impl StreamFactory for MemObjectStore {
    fn open_stream(&self, ino: InodeNo) -> Box<dyn JournalStream> {
        let object = self.object(ino);
        let state = Arc::new(Mutex::new(StreamState {
            object,
            write_pos: 0,
            safe_pos: 0,
            read_pos: 0,
            expire_pos: 0,
            safe_limit: None,
            readonly: true,
            format: 0,
            layout: FileLayout::default(),
            error: None,
            flush_waiters: Vec::new(),
            readable_waiters: Vec::new(),
            write_error: None,
        }));
        self.inner.lock().ctls.insert(
            ino,
            MemStreamCtl {
                state: Arc::clone(&state),
            },
        );
        Box::new(MemStream { state })
    }
}

struct StreamState {
    object: Arc<Mutex<MemObject>>,
    write_pos: u64,
    safe_pos: u64,
    read_pos: u64,
    expire_pos: u64,
    safe_limit: Option<u64>,
    readonly: bool,
    format: u32,
    layout: FileLayout,
    error: Option<StreamError>,
    flush_waiters: Vec<(u64, StreamCallback)>,
    readable_waiters: Vec<StreamCallback>,
    write_error: Option<WriteErrorHandler>,
}

impl StreamState {
    fn advance_safe(&mut self) {
        let target = self.safe_limit.unwrap_or(self.write_pos).min(self.write_pos);
        if target > self.safe_pos {
            self.safe_pos = target;
        }
        let safe = self.safe_pos;
        let (ready, pending): (Vec<_>, Vec<_>) = self
            .flush_waiters
            .drain(..)
            .partition(|(target, _)| *target <= safe);
        self.flush_waiters = pending;
        for (_, done) in ready {
            done(Ok(()));
        }
    }

    fn readable(&self) -> bool {
        self.error.is_none()
            && self.read_pos < self.write_pos
            && self.object.lock().entries.contains_key(&self.read_pos)
    }

    fn wake_readers(&mut self) {
        for done in self.readable_waiters.drain(..) {
            done(Ok(()));
        }
    }

    fn append(&mut self, data: Vec<u8>) {
        let pos = self.write_pos;
        self.write_pos += FRAME_OVERHEAD + data.len() as u64;
        {
            let mut obj = self.object.lock();
            obj.exists = true;
            obj.entries.insert(pos, data);
        }
        self.wake_readers();
    }

    fn persist_head(&mut self) {
        let mut obj = self.object.lock();
        obj.exists = true;
        obj.head = MemHead {
            format: self.format,
            layout: self.layout,
            write_pos: self.write_pos,
            expire_pos: self.expire_pos,
        };
    }
}

/// Test-facing double of the journal byte stream.
pub(crate) struct MemStream {
    state: Arc<Mutex<StreamState>>,
}

impl JournalStream for MemStream {
    fn create(&mut self, layout: FileLayout, format: u32) {
        let mut state = self.state.lock();
        state.layout = layout;
        state.format = format;
        state.write_pos = 0;
        state.safe_pos = 0;
        state.read_pos = 0;
        state.expire_pos = 0;
        let mut obj = state.object.lock();
        obj.exists = true;
        obj.entries.clear();
        obj.head = MemHead {
            format,
            layout,
            write_pos: 0,
            expire_pos: 0,
        };
    }

    fn recover(&mut self, done: StreamCallback) {
        {
            let mut state = self.state.lock();
            let (head, probe, exists) = {
                let obj = state.object.lock();
                (obj.head, obj.probe_end(), obj.exists)
            };
            if exists {
                state.format = head.format;
                state.layout = head.layout;
                state.expire_pos = head.expire_pos;
                state.read_pos = head.expire_pos;
                state.write_pos = head.write_pos.max(probe);
                state.safe_pos = state.write_pos;
            }
        }
        done(Ok(()));
    }

    fn reread_head(&mut self, done: StreamCallback) {
        {
            let mut state = self.state.lock();
            let head = state.object.lock().head;
            state.expire_pos = head.expire_pos;
        }
        done(Ok(()));
    }

    fn write_head(&mut self, done: Option<StreamCallback>) {
        self.state.lock().persist_head();
        if let Some(done) = done {
            done(Ok(()));
        }
    }

    fn erase(&mut self, done: StreamCallback) {
        let result = {
            let state = self.state.lock();
            let mut obj = state.object.lock();
            if obj.fail_next_erase {
                obj.fail_next_erase = false;
                Err(Error::storage("injected erase failure"))
            } else if !obj.exists {
                Err(Error::NotFound("journal object".into()))
            } else {
                obj.exists = false;
                obj.entries.clear();
                obj.head = MemHead::default();
                Ok(())
            }
        };
        done(result);
    }

    fn set_writeable(&mut self) {
        self.state.lock().readonly = false;
    }

    fn set_readonly(&mut self) {
        self.state.lock().readonly = true;
    }

    fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    fn set_read_pos(&mut self, pos: u64) {
        self.state.lock().read_pos = pos;
    }

    fn set_expire_pos(&mut self, pos: u64) {
        self.state.lock().expire_pos = pos;
    }

    fn set_write_pos(&mut self, pos: u64) {
        self.state.lock().write_pos = pos;
    }

    fn append_entry(&mut self, bytes: Bytes) {
        self.state.lock().append(bytes.to_vec());
    }

    fn flush(&mut self, done: Option<StreamCallback>) {
        let mut state = self.state.lock();
        let target = state.write_pos;
        state.advance_safe();
        if let Some(done) = done {
            if state.safe_pos >= target {
                done(Ok(()));
            } else {
                state.flush_waiters.push((target, done));
            }
        }
    }

    fn wait_for_flush(&mut self, done: StreamCallback) {
        let mut state = self.state.lock();
        let target = state.write_pos;
        if state.safe_pos >= target {
            done(Ok(()));
        } else {
            state.flush_waiters.push((target, done));
        }
    }

    fn is_readable(&self) -> bool {
        self.state.lock().readable()
    }

    fn wait_for_readable(&mut self, done: StreamCallback) {
        let mut state = self.state.lock();
        if state.readable() || state.error.is_some() {
            done(Ok(()));
        } else {
            state.readable_waiters.push(done);
        }
    }

    fn try_read_entry(&mut self) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.error.is_some() {
            return None;
        }
        let entry = state.object.lock().entries.get(&state.read_pos).cloned();
        match entry {
            Some(data) => {
                state.read_pos += FRAME_OVERHEAD + data.len() as u64;
                Some(Bytes::from(data))
            }
            None => {
                if state.read_pos < state.write_pos {
                    state.error = Some(StreamError::NotFound);
                }
                None
            }
        }
    }

    fn error(&self) -> Option<StreamError> {
        self.state.lock().error.clone()
    }

    fn set_write_error_handler(&mut self, handler: WriteErrorHandler) {
        self.state.lock().write_error = Some(handler);
    }

    fn write_pos(&self) -> u64 {
        self.state.lock().write_pos
    }

    fn safe_pos(&self) -> u64 {
        self.state.lock().safe_pos
    }

    fn read_pos(&self) -> u64 {
        self.state.lock().read_pos
    }

    fn expire_pos(&self) -> u64 {
        self.state.lock().expire_pos
    }

    fn layout(&self) -> FileLayout {
        self.state.lock().layout
    }

    fn stream_format(&self) -> u32 {
        self.state.lock().format
    }
}

/// Test control handle over a [`MemStream`], shared with the stream.
#[derive(Clone)]
pub(crate) struct MemStreamCtl {
    state: Arc<Mutex<StreamState>>,
}

impl MemStreamCtl {
    /// Pin durability: flushes advance `safe_pos` at most to `limit`.
    pub fn set_safe_limit(&self, limit: Option<u64>) {
        self.state.lock().safe_limit = limit;
    }

    /// Advance `safe_pos` as far as the current limit allows, firing any
    /// eligible flush waiters.
    pub fn release_safe(&self) {
        self.state.lock().advance_safe();
    }

    pub fn set_expire_pos(&self, pos: u64) {
        self.state.lock().expire_pos = pos;
    }

    pub fn inject_error(&self, error: StreamError) {
        let mut state = self.state.lock();
        state.error = Some(error);
        state.wake_readers();
    }

    pub fn fire_write_error(&self, error: StreamError) {
        let mut state = self.state.lock();
        if let Some(handler) = state.write_error.as_mut() {
            handler(error);
        }
    }

    /// Append raw bytes as one entry, bypassing the event codec.
    pub fn append_raw(&self, data: Vec<u8>) {
        self.state.lock().append(data);
    }

    /// Append encoded events.
    pub fn append_entries(&self, events: &[LogEvent]) {
        let mut state = self.state.lock();
        for event in events {
            state.append(event.encode_with_header().to_vec());
        }
    }

    /// Persist the head as the stream sees it right now.
    pub fn persist_head(&self) {
        self.state.lock().persist_head();
    }

    /// Move the persisted head's expire position without touching the
    /// stream's in-memory copy, as a leader advancing past us would.
    pub fn set_head_expire_pos(&self, pos: u64) {
        let state = self.state.lock();
        let mut obj = state.object.lock();
        obj.exists = true;
        obj.head.expire_pos = pos;
    }
}

/// Seed a journal object with encoded events, as a prior incarnation of
/// the rank would have left it.
pub(crate) fn seed_journal(
    store: &MemObjectStore,
    ino: InodeNo,
    format: u32,
    events: &[LogEvent],
) {
    seed_journal_with_layout(store, ino, format, FileLayout::default(), events);
}

pub(crate) fn seed_journal_with_layout(
    store: &MemObjectStore,
    ino: InodeNo,
    format: u32,
    layout: FileLayout,
    events: &[LogEvent],
) {
    let mut stream = store.open_stream(ino);
    stream.set_writeable();
    stream.create(layout, format);
    for event in events {
        stream.append_entry(event.encode_with_header());
    }
    stream.write_head(None);
    stream.flush(None);
}

#[derive(Default)]
struct CacheInner {
    subtree_seq: u64,
    advance_stray: u64,
    trim_calls: u64,
    replayed: Vec<LogEvent>,
    dirty: BTreeSet<DirtyHandle>,
    pending: Vec<(DirtyHandle, GatherSub)>,
}

/// Metadata cache double recording every interaction.
pub(crate) struct MemCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    pub fn ctl(&self) -> MemCacheCtl {
        MemCacheCtl {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MetadataCache for MemCache {
    fn create_subtree_map(&mut self) -> LogEvent {
        let mut inner = self.inner.lock();
        inner.subtree_seq += 1;
        let payload = format!("subtree-map-{}", inner.subtree_seq).into_bytes();
        LogEvent::new(EventKind::SubtreeMap, payload)
    }

    fn advance_stray(&mut self) {
        self.inner.lock().advance_stray += 1;
    }

    fn replay_event(&mut self, event: &LogEvent) {
        self.inner.lock().replayed.push(event.clone());
    }

    fn is_dirty(&self, handle: DirtyHandle) -> bool {
        self.inner.lock().dirty.contains(&handle)
    }

    fn start_flush(&mut self, handle: DirtyHandle, _prio: OpPriority, done: GatherSub) {
        self.inner.lock().pending.push((handle, done));
    }

    fn trim(&mut self) {
        self.inner.lock().trim_calls += 1;
    }
}

#[derive(Clone)]
pub(crate) struct MemCacheCtl {
    inner: Arc<Mutex<CacheInner>>,
}

impl MemCacheCtl {
    pub fn mark_dirty(&self, handle: DirtyHandle) {
        self.inner.lock().dirty.insert(handle);
    }

    pub fn pending_flushes(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Complete all pending flushes, clearing their dirtiness first. Must
    /// be called without the journal's lock held: gather finishers
    /// reacquire it.
    pub fn complete_flushes(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            let pending = std::mem::take(&mut inner.pending);
            for (handle, _) in &pending {
                inner.dirty.remove(handle);
            }
            pending
        };
        for (_, sub) in pending {
            sub.complete();
        }
    }

    pub fn replayed_kinds(&self) -> Vec<EventKind> {
        self.inner.lock().replayed.iter().map(|e| e.kind).collect()
    }

    pub fn subtree_maps_created(&self) -> u64 {
        self.inner.lock().subtree_seq
    }

    pub fn advance_stray_calls(&self) -> u64 {
        self.inner.lock().advance_stray
    }

    pub fn trim_calls(&self) -> u64 {
        self.inner.lock().trim_calls
    }
}

#[derive(Default)]
struct PtrInner {
    saved: Option<JournalPointer>,
    fail_next_load: bool,
}

/// Pointer store double.
#[derive(Clone)]
pub(crate) struct MemPointerStore {
    inner: Arc<Mutex<PtrInner>>,
}

impl MemPointerStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PtrInner::default())),
        }
    }

    pub fn set(&self, pointer: JournalPointer) -> Result<()> {
        self.save(&pointer)
    }

    pub fn saved(&self) -> Option<JournalPointer> {
        self.inner.lock().saved
    }

    pub fn fail_next_load(&self) {
        self.inner.lock().fail_next_load = true;
    }
}

impl PointerStore for MemPointerStore {
    fn load(&self) -> Result<Option<JournalPointer>> {
        let mut inner = self.inner.lock();
        if inner.fail_next_load {
            inner.fail_next_load = false;
            return Err(Error::storage("injected pointer load failure"));
        }
        Ok(inner.saved)
    }

    fn save(&self, pointer: &JournalPointer) -> Result<()> {
        // Exercise the wire codec on every save.
        let decoded = JournalPointer::decode(&pointer.encode())?;
        self.inner.lock().saved = Some(decoded);
        Ok(())
    }
}

/// Fault handler double counting escalations.
#[derive(Default)]
pub(crate) struct MemFaults {
    respawns: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl MemFaults {
    pub fn respawns(&self) -> usize {
        self.respawns.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl FaultHandler for MemFaults {
    fn respawn(&self) {
        self.respawns.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wait for a completion delivered over a channel and assert success.
pub(crate) fn recv_ok(rx: &mpsc::Receiver<Result<()>>) {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("completion delivered")
        .expect("completion succeeded");
}
