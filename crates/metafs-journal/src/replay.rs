//! Replay thread
//!
//! Streams events back from the journal, reconstructing segment boundaries
//! and dispatching each event's side effects into the metadata cache. The
//! loop runs under the coarse MDS mutex and releases it only across the
//! readable wait, the synchronous head re-read, and a per-iteration yield.

use crate::event::{EventKind, LogEvent};
use crate::log::{Core, Shared};
use crate::segment::LogSegment;
use crate::stream::{Completion, StreamError};
use metafs_common::{Error, Result};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(crate) fn run(shared: Arc<Shared>) {
    let mut core = shared.lock.lock();
    debug!("replay thread start");

    let result = replay_loop(&shared, &mut core);

    if result.is_ok() {
        debug!(num_events = core.num_events, "replay complete");
        if let Ok(stream) = core.stream_ref() {
            shared.counters.set_expos(stream.expire_pos());
        }
    }

    debug!("replay thread kicking waiters");
    let waiters = std::mem::take(&mut core.replay_waiters);
    drop(core);
    for waiter in waiters {
        waiter(result.clone());
    }
}

fn replay_loop(shared: &Arc<Shared>, core: &mut MutexGuard<'_, Core>) -> Result<()> {
    loop {
        // Step: wait for the stream to become readable.
        loop {
            let stream = core.stream_mut()?;
            if stream.is_readable()
                || stream.error().is_some()
                || stream.read_pos() >= stream.write_pos()
            {
                break;
            }
            let cond_shared = Arc::clone(shared);
            stream.wait_for_readable(Box::new(move |_| {
                cond_shared.replay_cond.notify_all();
            }));
            shared.replay_cond.wait(core);
        }

        // Step: classify a latched stream error.
        if let Some(err) = core.stream_ref()?.error() {
            return Err(classify_error(shared, core, err)?);
        }

        // Step: done once the journal is fully consumed.
        {
            let stream = core.stream_ref()?;
            if !stream.is_readable() && stream.read_pos() == stream.write_pos() {
                return Ok(());
            }
        }

        // Step: read one event's bytes.
        let (pos, bytes) = {
            let stream = core.stream_mut()?;
            let pos = stream.read_pos();
            match stream.try_read_entry() {
                Some(bytes) => (pos, bytes),
                None => {
                    if stream.error().is_some() {
                        continue;
                    }
                    return Err(Error::storage("journal unreadable with no error latched"));
                }
            }
        };

        match LogEvent::decode(&bytes) {
            Ok(event) => {
                apply_event(shared, core, pos, &event)?;
            }
            Err(_) => {
                if shared.config.skip_corrupt_events {
                    warn!(pos, len = bytes.len(), "skipping corrupt log event");
                } else {
                    error!(pos, len = bytes.len(), "unable to decode log event, aborting");
                    return Err(Error::CorruptEvent {
                        pos,
                        len: bytes.len(),
                    });
                }
            }
        }

        shared.counters.set_rdpos(pos);

        // Drop the lock for a moment so other MDS work (beacons, timers)
        // can go off.
        MutexGuard::unlocked(core, || {});
    }
}

/// Replay-side error policy. Returns the error to hand to waiters; itself
/// fails only if the journal disappears from under us mid-classification.
fn classify_error(
    shared: &Arc<Shared>,
    core: &mut MutexGuard<'_, Core>,
    err: StreamError,
) -> Result<Error> {
    debug!(error = %err, "replay stream error");
    match err {
        StreamError::NotFound => {
            // The journal has been trimmed by somebody else; only a
            // read-only follower can see this.
            Ok(Error::TryAgain("journal trimmed ahead of read position".into()))
        }
        StreamError::Invalid => {
            let stream = core.stream_ref()?;
            if stream.read_pos() < stream.expire_pos() {
                // We are behind a stale head, following somebody else.
                warn!("expire_pos is ahead of read_pos, returning try-again");
                return Ok(Error::TryAgain("expire_pos ahead of read_pos".into()));
            }

            // Re-read the head and catch up. Replay runs in its own
            // thread and the server will shut down or restart on error,
            // so a synchronous re-read is fine as long as the coarse
            // mutex is dropped around it.
            let completion = Completion::new();
            core.stream_mut()?.reread_head(completion.callback());
            let reread = MutexGuard::unlocked(core, || completion.wait());
            if let Err(e) = reread {
                error!(error = %e, "error while re-reading journal head");
                shared.faults.shutdown();
                return Ok(e);
            }

            core.standby_trim_segments(shared);

            let stream = core.stream_ref()?;
            if stream.read_pos() < stream.expire_pos() {
                warn!("expire_pos is ahead of read_pos, returning try-again");
                Ok(Error::TryAgain("expire_pos ahead of read_pos".into()))
            } else {
                Ok(StreamError::Invalid.into())
            }
        }
        err => Ok(err.into()),
    }
}

fn apply_event(
    shared: &Arc<Shared>,
    core: &mut MutexGuard<'_, Core>,
    pos: u64,
    event: &LogEvent,
) -> Result<()> {
    // Segment boundary on replay. SubtreeMapTest is deliberately not one.
    if matches!(event.kind, EventKind::SubtreeMap | EventKind::ResetJournal) {
        core.segments.insert(pos, LogSegment::new(pos));
        shared.counters.set_seg(core.segments.len());
    }

    if core.segments.is_empty() {
        // No subtree map yet; the event cannot be replayed meaningfully.
        debug!(pos, kind = ?event.kind, "waiting for subtree map, skipping event");
        return Ok(());
    }

    let read_pos = core.stream_ref()?.read_pos();
    let inner = &mut **core;
    if let Some((_, seg)) = inner.segments.iter_mut().next_back() {
        seg.num_events += 1;
        seg.end = read_pos;
    }
    inner.num_events += 1;
    debug!(pos, kind = ?event.kind, "replaying event");
    inner.cache.replay_event(event);
    Ok(())
}
