//! The metadata journal core
//!
//! Owns the segment map, the expiring and expired sets, the counters, and
//! the active stream, and orchestrates append, trim, replay setup, and
//! recovery setup. All shared state lives in [`Core`] under a single coarse
//! mutex; the recovery and replay threads reacquire that mutex around every
//! state-touching step and release it across blocking object-store waits.

use crate::cache::{DirtyHandle, FaultHandler, MetadataCache};
use crate::counters::{CountersSnapshot, JournalCounters};
use crate::event::{EventKind, LogEvent};
use crate::gather::GatherBuilder;
use crate::pointer::PointerStore;
use crate::segment::LogSegment;
use crate::stream::{JournalStream, StreamCallback, StreamError, StreamFactory};
use crate::{recovery, replay};
use metafs_common::{
    default_log_ino, expiry_op_priority, Error, JournalConfig, MdsId, MdsState, OpPriority, Result,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// An event handed out by [`Journal::start_entry`] and consumed by
/// [`Journal::submit_entry`]. Holding one pins the event's start offset.
pub struct PendingEvent {
    event: LogEvent,
    start_off: u64,
}

impl PendingEvent {
    #[must_use]
    pub fn start_off(&self) -> u64 {
        self.start_off
    }

    #[must_use]
    pub fn event(&self) -> &LogEvent {
        &self.event
    }
}

/// The metadata journal.
///
/// Methods may be called from any thread; each acquires the coarse MDS
/// mutex internally. Completion callbacks run without the mutex held.
pub struct Journal {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) lock: Mutex<Core>,
    pub(crate) replay_cond: Condvar,
    pub(crate) counters: JournalCounters,
    pub(crate) config: JournalConfig,
    pub(crate) mds_id: MdsId,
    pub(crate) streams: Arc<dyn StreamFactory>,
    pub(crate) pointers: Arc<dyn PointerStore>,
    pub(crate) faults: Arc<dyn FaultHandler>,
}

/// Journal state guarded by the coarse MDS mutex.
pub(crate) struct Core {
    pub(crate) stream: Option<Box<dyn JournalStream>>,
    pub(crate) cache: Box<dyn MetadataCache>,
    pub(crate) segments: BTreeMap<u64, LogSegment>,
    pub(crate) expiring: BTreeSet<u64>,
    pub(crate) expired: BTreeSet<u64>,
    pub(crate) num_events: u64,
    pub(crate) expiring_events: u64,
    pub(crate) expired_events: u64,
    pub(crate) unflushed: u64,
    pub(crate) capped: bool,
    pub(crate) already_replayed: bool,
    pub(crate) last_stamp: u64,
    pub(crate) mds_state: MdsState,
    pub(crate) replay_waiters: Vec<StreamCallback>,
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Write-error policy: a fenced client respawns, anything else shuts down.
pub(crate) fn install_write_error_handler(sh: &Arc<Shared>, stream: &mut dyn JournalStream) {
    let faults = Arc::clone(&sh.faults);
    stream.set_write_error_handler(Box::new(move |err| match err {
        StreamError::Fenced => {
            error!("we have been fenced (blacklisted), respawning");
            faults.respawn();
        }
        err => {
            error!(error = %err, "unhandled journal write error, shutting down");
            faults.shutdown();
        }
    }));
}

impl Journal {
    pub fn new(
        config: JournalConfig,
        mds_id: MdsId,
        cache: Box<dyn MetadataCache>,
        streams: Arc<dyn StreamFactory>,
        pointers: Arc<dyn PointerStore>,
        faults: Arc<dyn FaultHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                lock: Mutex::new(Core {
                    stream: None,
                    cache,
                    segments: BTreeMap::new(),
                    expiring: BTreeSet::new(),
                    expired: BTreeSet::new(),
                    num_events: 0,
                    expiring_events: 0,
                    expired_events: 0,
                    unflushed: 0,
                    capped: false,
                    already_replayed: false,
                    last_stamp: 0,
                    mds_state: MdsState::Boot,
                    replay_waiters: Vec::new(),
                }),
                replay_cond: Condvar::new(),
                counters: JournalCounters::default(),
                config,
                mds_id,
                streams,
                pointers,
                faults,
            }),
        }
    }

    /// Initialize a new empty journal at this rank's default log inode.
    /// `done` fires once the head object is persisted.
    pub fn create(&self, done: StreamCallback) -> Result<()> {
        let mut core = self.shared.lock.lock();
        if core.stream.is_some() {
            return Err(Error::invalid("journal already open"));
        }
        info!("creating empty journal");
        let mut stream = self
            .shared
            .streams
            .open_stream(default_log_ino(self.shared.mds_id));
        stream.set_writeable();
        stream.create(self.shared.config.layout, self.shared.config.journal_format);
        install_write_error_handler(&self.shared, stream.as_mut());
        stream.write_head(Some(done));

        self.shared.counters.set_expos(stream.expire_pos());
        self.shared.counters.set_wrpos(stream.write_pos());
        core.stream = Some(stream);
        Ok(())
    }

    /// Discover the journal via the pointer object and recover it in a
    /// background thread, reformatting it first if the on-disk format is
    /// older than configured. Either [`Journal::append`] or
    /// [`Journal::replay`] follows once `done` fires with success.
    pub fn open(&self, done: StreamCallback) -> Result<()> {
        {
            let core = self.shared.lock.lock();
            if core.stream.is_some() {
                return Err(Error::invalid("journal already open"));
            }
        }
        info!("open: discovering log bounds");
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("mds-log-recovery".into())
            .spawn(move || recovery::run(shared, done))?;
        Ok(())
    }

    /// Position at the end of the recovered journal and mark it writeable.
    pub fn append(&self) -> Result<()> {
        let mut core = self.shared.lock.lock();
        let stream = core.stream_mut()?;
        info!("append: positioning at end and marking writeable");
        let end = stream.write_pos();
        stream.set_read_pos(end);
        stream.set_expire_pos(end);
        stream.set_writeable();
        self.shared.counters.set_expos(end);
        Ok(())
    }

    /// Stamp an event with its start offset, producing the transient that
    /// [`Journal::submit_entry`] consumes.
    pub fn start_entry(&self, event: LogEvent) -> Result<PendingEvent> {
        let mut core = self.shared.lock.lock();
        let stream = core.stream_mut()?;
        Ok(PendingEvent {
            start_off: stream.write_pos(),
            event,
        })
    }

    /// Encode the event, append it to the stream, attribute it to the
    /// current segment, and possibly start a new segment. `on_safe` fires
    /// once the append is durable.
    pub fn submit_entry(
        &self,
        pending: PendingEvent,
        on_safe: Option<StreamCallback>,
    ) -> Result<()> {
        let mut core = self.shared.lock.lock();
        core.submit_entry(&self.shared, pending, on_safe)
    }

    /// Open a new segment at the current write position and journal its
    /// leading subtree map. One atomic step from the caller's viewpoint.
    pub fn start_new_segment(&self) -> Result<()> {
        let mut core = self.shared.lock.lock();
        core.start_new_segment(&self.shared)
    }

    /// Attribute dirty metadata to the current segment; it must be flushed
    /// before that segment can expire.
    pub fn record_dirty(&self, handle: DirtyHandle) -> Result<()> {
        let mut core = self.shared.lock.lock();
        let Some((_, seg)) = core.segments.iter_mut().next_back() else {
            return Err(Error::invalid("no current segment"));
        };
        seg.record_dirty(handle);
        Ok(())
    }

    /// Hint the stream to flush if anything was submitted since the last
    /// flush.
    pub fn flush(&self) {
        let mut core = self.shared.lock.lock();
        if core.unflushed > 0 {
            if let Some(stream) = core.stream.as_deref_mut() {
                stream.flush(None);
            }
        }
        core.unflushed = 0;
    }

    /// Fire `done` once everything submitted so far is durable.
    pub fn wait_for_safe(&self, done: StreamCallback) -> Result<()> {
        let mut core = self.shared.lock.lock();
        core.stream_mut()?.wait_for_flush(done);
        Ok(())
    }

    /// Refuse further submits. Capping also lifts the current segment's
    /// protection from expiry, so a final trim can drain the whole log.
    pub fn cap(&self) {
        info!("cap");
        self.shared.lock.lock().capped = true;
    }

    #[must_use]
    pub fn is_capped(&self) -> bool {
        self.shared.lock.lock().capped
    }

    /// Expire and trim old segments until the event and segment counts are
    /// within bounds, under a soft wall-clock budget. Makes progress but is
    /// not required to finish.
    pub fn trim(&self, max_events_override: Option<u64>) {
        let mut core = self.shared.lock.lock();
        core.trim(&self.shared, max_events_override);
    }

    /// Stream events back from the journal in a background thread,
    /// rebuilding segments and dispatching replay side effects into the
    /// metadata cache. `done` fires when replay completes or fails;
    /// [`Error::TryAgain`] means rerun the whole startup sequence.
    pub fn replay(&self, done: StreamCallback) -> Result<()> {
        let mut core = self.shared.lock.lock();
        {
            let stream = core.stream_ref()?;
            if !stream.is_readonly() {
                return Err(Error::invalid("replay requires a read-only journal"));
            }
            if stream.read_pos() == stream.write_pos() {
                debug!("replay: journal is empty, done");
                drop(core);
                done(Ok(()));
                return Ok(());
            }
            debug!(
                from = stream.read_pos(),
                to = stream.write_pos(),
                "replay start"
            );
        }
        if core.num_events > 0 && !core.already_replayed {
            return Err(Error::invalid("replay over submitted events"));
        }
        core.already_replayed = true;
        core.replay_waiters.push(done);
        drop(core);

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("mds-log-replay".into())
            .spawn(move || replay::run(shared))?;
        Ok(())
    }

    /// Follower-side catch-up: drop segments the leader has already
    /// expired past, without flushing anything ourselves.
    pub fn standby_trim_segments(&self) {
        let mut core = self.shared.lock.lock();
        core.standby_trim_segments(&self.shared);
    }

    /// Persist the stream head.
    pub fn write_head(&self, done: Option<StreamCallback>) -> Result<()> {
        let mut core = self.shared.lock.lock();
        core.stream_mut()?.write_head(done);
        Ok(())
    }

    pub fn set_mds_state(&self, state: MdsState) {
        self.shared.lock.lock().mds_state = state;
    }

    #[must_use]
    pub fn num_events(&self) -> u64 {
        self.shared.lock.lock().num_events
    }

    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.shared.lock.lock().segments.len()
    }

    /// Segment start offsets in ascending order, for diagnostics.
    #[must_use]
    pub fn segment_offsets(&self) -> Vec<u64> {
        self.shared.lock.lock().segments.keys().copied().collect()
    }

    #[must_use]
    pub fn write_pos(&self) -> u64 {
        self.stream_pos(|s| s.write_pos())
    }

    #[must_use]
    pub fn read_pos(&self) -> u64 {
        self.stream_pos(|s| s.read_pos())
    }

    #[must_use]
    pub fn safe_pos(&self) -> u64 {
        self.stream_pos(|s| s.safe_pos())
    }

    #[must_use]
    pub fn expire_pos(&self) -> u64 {
        self.stream_pos(|s| s.expire_pos())
    }

    fn stream_pos(&self, f: impl FnOnce(&dyn JournalStream) -> u64) -> u64 {
        self.shared.lock.lock().stream.as_deref().map_or(0, f)
    }

    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }
}

impl Core {
    pub(crate) fn stream_mut(&mut self) -> Result<&mut (dyn JournalStream + 'static)> {
        self.stream
            .as_deref_mut()
            .ok_or_else(|| Error::invalid("journal not open"))
    }

    pub(crate) fn stream_ref(&self) -> Result<&dyn JournalStream> {
        self.stream
            .as_deref()
            .ok_or_else(|| Error::invalid("journal not open"))
    }

    fn current_segment_offset(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    fn submit_entry(
        &mut self,
        sh: &Arc<Shared>,
        pending: PendingEvent,
        on_safe: Option<StreamCallback>,
    ) -> Result<()> {
        if self.mds_state.is_any_replay() {
            return Err(Error::invalid("submit_entry while replaying"));
        }
        if self.capped {
            return Err(Error::invalid("journal is capped"));
        }
        let PendingEvent { mut event, start_off } = pending;

        let stream = self
            .stream
            .as_deref_mut()
            .ok_or_else(|| Error::invalid("journal not open"))?;
        let Some((&cur_offset, seg)) = self.segments.iter_mut().next_back() else {
            return Err(Error::invalid("no current segment"));
        };

        // Stamps advance monotonically even across clock steps.
        self.last_stamp = self.last_stamp.max(unix_micros());
        event.stamp_micros = self.last_stamp;

        seg.num_events += 1;
        self.num_events += 1;

        let bytes = event.encode_with_header();
        debug!(
            pos = stream.write_pos(),
            len = bytes.len(),
            kind = ?event.kind,
            start_off,
            "submit_entry"
        );
        stream.append_entry(bytes);
        seg.end = stream.write_pos();

        sh.counters.ev_added();
        sh.counters.set_ev(self.num_events);
        sh.counters.set_wrpos(stream.write_pos());

        self.unflushed += 1;

        if let Some(done) = on_safe {
            stream.wait_for_flush(done);
        }

        // Start a new segment?
        let period = stream.layout().period().max(1);
        let write_pos = stream.write_pos();
        let kind = event.kind;

        if kind == EventKind::SubtreeMap
            || (kind == EventKind::ImportFinish && self.mds_state.is_resolve())
        {
            // A subtree map reflects the state once all sibling
            // import-finish events are replayed with it; a boundary inside
            // that run would make the map inconsistent at replay time, and
            // a map submitted right after another would recurse forever on
            // very large maps.
        } else if write_pos / period != cur_offset / period {
            debug!(
                last_segment = cur_offset,
                write_pos, "submit_entry also starting new segment"
            );
            self.start_new_segment(sh)?;
        } else if sh.config.debug_subtrees && kind != EventKind::SubtreeMapTest {
            // Journal a throwaway map after every event to catch subtree
            // replay bugs. The distinct kind keeps replay from treating it
            // as a segment boundary.
            let mut map = self.cache.create_subtree_map();
            map.kind = EventKind::SubtreeMapTest;
            let pending = PendingEvent {
                start_off: write_pos,
                event: map,
            };
            self.submit_entry(sh, pending, None)?;
        }

        Ok(())
    }

    pub(crate) fn start_new_segment(&mut self, sh: &Arc<Shared>) -> Result<()> {
        self.prepare_new_segment(sh)?;
        self.journal_segment_subtree_map(sh)
    }

    fn prepare_new_segment(&mut self, sh: &Arc<Shared>) -> Result<()> {
        let offset = self.stream_ref()?.write_pos();
        debug!(offset, "prepare_new_segment");
        self.segments.insert(offset, LogSegment::new(offset));
        sh.counters.seg_added();
        sh.counters.set_seg(self.segments.len());

        // Adjust to the next stray directory.
        self.cache.advance_stray();
        Ok(())
    }

    fn journal_segment_subtree_map(&mut self, sh: &Arc<Shared>) -> Result<()> {
        debug!("journal_segment_subtree_map");
        let event = self.cache.create_subtree_map();
        let start_off = self.stream_ref()?.write_pos();
        self.submit_entry(
            sh,
            PendingEvent { event, start_off },
            None,
        )
    }

    fn trim(&mut self, sh: &Arc<Shared>, max_events_override: Option<u64>) {
        let max_segments = sh.config.max_segments;
        let max_events = max_events_override.or(sh.config.max_events);

        debug!(
            segments = self.segments.len(),
            max_segments,
            events = self.num_events,
            expiring_segments = self.expiring.len(),
            expiring_events = self.expiring_events,
            expired_segments = self.expired.len(),
            expired_events = self.expired_events,
            "trim"
        );

        if self.segments.is_empty() || self.stream.is_none() {
            return;
        }

        // Only trim for a couple of seconds at a time.
        let stop = Instant::now() + Duration::from_millis(sh.config.trim_budget_ms);

        let offsets: Vec<u64> = self.segments.keys().copied().collect();
        for offset in offsets {
            let over_events = max_events.is_some_and(|m| {
                self.num_events - self.expiring_events - self.expired_events > m
            });
            let over_segments =
                self.segments.len() - self.expiring.len() - self.expired.len() > max_segments;
            if !over_events && !over_segments {
                break;
            }
            if Instant::now() > stop {
                break;
            }
            if self.expiring.len() >= sh.config.max_expiring {
                break;
            }
            let prio = expiry_op_priority(self.expiring.len(), sh.config.max_expiring);

            let Some(seg) = self.segments.get(&offset) else {
                break;
            };
            let safe_pos = match self.stream.as_deref() {
                Some(s) => s.safe_pos(),
                None => return,
            };
            if seg.end > safe_pos {
                // Subsequent segments end no earlier; nothing more to do
                // this pass.
                debug!(
                    offset,
                    end = seg.end,
                    safe_pos,
                    "trim segment not fully flushed yet"
                );
                break;
            }
            if self.expiring.contains(&offset) {
                debug!(offset, "trim already expiring segment");
            } else if self.expired.contains(&offset) {
                debug!(offset, "trim already expired segment");
            } else {
                self.try_expire(sh, offset, prio);
            }
        }

        self.trim_expired_segments(sh);
    }

    fn try_expire(&mut self, sh: &Arc<Shared>, offset: u64, prio: OpPriority) {
        let mut gather = GatherBuilder::new();
        let num_events;
        {
            let Some(seg) = self.segments.get_mut(&offset) else {
                return;
            };
            num_events = seg.num_events;
            seg.try_to_expire(self.cache.as_mut(), &mut gather, prio);
        }

        if gather.has_subs() {
            debug!(offset, "try_expire expiring segment");
            self.expiring.insert(offset);
            self.expiring_events += num_events;
            let weak = Arc::downgrade(sh);
            gather.activate(Box::new(move || {
                if let Some(sh) = weak.upgrade() {
                    let mut core = sh.lock.lock();
                    core.maybe_expired(&sh, offset, prio);
                }
            }));
        } else {
            debug!(offset, "try_expire expired segment");
            self.mark_expired(sh, offset);
        }

        sh.counters.set_expiring(self.expiring.len(), self.expiring_events);
    }

    /// Gather finisher: the flushes for `offset` completed, so retry the
    /// expiry. The second attempt finds an empty gather unless new state
    /// was dirtied against the segment in the meantime.
    fn maybe_expired(&mut self, sh: &Arc<Shared>, offset: u64, prio: OpPriority) {
        if !self.expiring.remove(&offset) {
            return;
        }
        let n = match self.segments.get(&offset) {
            Some(seg) => seg.num_events,
            None => return,
        };
        debug!(offset, num_events = n, "maybe_expired");
        self.expiring_events -= n;
        self.try_expire(sh, offset, prio);
    }

    fn mark_expired(&mut self, sh: &Arc<Shared>, offset: u64) {
        let current = self.current_segment_offset();
        if let Some(seg) = self.segments.get(&offset) {
            if !self.capped && current == Some(offset) {
                // The current segment must stay available for appends.
                debug!(offset, "not expiring current segment while uncapped");
            } else if self.expired.insert(offset) {
                debug!(offset, num_events = seg.num_events, "expired segment");
                self.expired_events += seg.num_events;
                sh.counters.ev_expired(seg.num_events);
                sh.counters.seg_expired();
            }
        }

        sh.counters.set_ev(self.num_events);
        sh.counters.set_seg(self.segments.len());
        sh.counters.set_expired(self.expired.len(), self.expired_events);
    }

    fn trim_expired_segments(&mut self, sh: &Arc<Shared>) {
        let mut trimmed = false;
        while let Some((&offset, seg)) = self.segments.iter().next() {
            if !self.expired.contains(&offset) {
                debug!(offset, "trim_expired_segments waiting for oldest to expire");
                break;
            }
            let n = seg.num_events;
            debug!(offset, num_events = n, "trim_expired_segments trimming");
            self.expired.remove(&offset);
            self.expired_events -= n;
            self.num_events -= n;
            sh.counters.seg_trimmed();
            sh.counters.ev_trimmed(n);
            self.segments.remove(&offset);
            trimmed = true;
        }

        if trimmed {
            let next_offset = self.segments.keys().next().copied();
            if let Some(stream) = self.stream.as_deref_mut() {
                // Everything before the next remaining segment is now
                // discardable; with the map drained, the whole log is.
                let new_expire = next_offset.unwrap_or_else(|| stream.write_pos());
                if new_expire > stream.expire_pos() {
                    stream.set_expire_pos(new_expire);
                }
                sh.counters.set_expos(stream.expire_pos());
                stream.write_head(None);
            }
            sh.counters.set_seg(self.segments.len());
            sh.counters.set_ev(self.num_events);
            sh.counters.set_expired(self.expired.len(), self.expired_events);
        }
    }

    pub(crate) fn standby_trim_segments(&mut self, sh: &Arc<Shared>) {
        let Some(expire_pos) = self.stream.as_deref().map(|s| s.expire_pos()) else {
            return;
        };
        debug!(expire_pos, "standby_trim_segments");
        let mut removed = false;
        while let Some((&offset, seg)) = self.segments.iter_mut().next() {
            if seg.end > expire_pos {
                break;
            }
            debug!(offset, "removing segment");
            // The leader is responsible for the actual flushes.
            seg.clear_dirty();
            let n = seg.num_events;
            self.num_events -= n;
            self.segments.remove(&offset);
            removed = true;
        }

        if removed {
            debug!("standby trim removed segments, trimming cache");
            self.cache.trim();
            sh.counters.set_seg(self.segments.len());
            sh.counters.set_ev(self.num_events);
        }
    }
}
