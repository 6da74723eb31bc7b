//! Recovery and reformat thread
//!
//! Resolves the journal pointer to a journal object, cleans up any
//! half-finished reformat, recovers the live journal, and rewrites it into
//! the current on-disk format when it is too old. Stream operations are
//! issued while holding the coarse MDS mutex and waited on with it
//! released, so the rest of the server keeps making progress.

use crate::log::{install_write_error_handler, Shared};
use crate::pointer::JournalPointer;
use crate::stream::{Completion, JournalStream, StreamCallback};
use metafs_common::{backup_log_ino, default_log_ino, Error, InodeNo, Result};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, error, info};

pub(crate) fn run(shared: Arc<Shared>, completion: StreamCallback) {
    debug!("recovery thread start");
    let result = recover(&shared);
    if let Err(e) = &result {
        error!(error = %e, "journal recovery failed");
    }
    completion(result);
}

fn recover(shared: &Arc<Shared>) -> Result<()> {
    // Step: resolve the pointer object. A missing pointer is a fresh rank;
    // anything else unreadable is beyond repair here.
    let mut jp = match shared.pointers.load() {
        Ok(Some(jp)) => jp,
        Ok(None) => {
            let jp = JournalPointer::new(default_log_ino(shared.mds_id));
            info!(front = %jp.front, "journal pointer not found, writing a fresh one");
            shared
                .pointers
                .save(&jp)
                .map_err(|e| Error::Pointer(format!("cannot write fresh journal pointer: {e}")))?;
            jp
        }
        Err(e) => {
            return Err(Error::Pointer(format!("cannot read journal pointer: {e}")));
        }
    };

    // Step: a non-null back slot means a journal rewrite failed part way
    // through. Erase the back journal to clean up.
    if !jp.back.is_null() {
        info!(ino = %jp.back, "erasing leftover back journal");
        let mut back = shared.streams.open_stream(jp.back);

        // Recovering succeeds even when no journal objects are present; an
        // error means something worse, like a corrupt header.
        wait_op(shared, |done| back.recover(done))
            .map_err(|e| Error::storage(format!("back journal {} recovery failed: {e}", jp.back)))?;

        match wait_op(shared, |done| back.erase(done)) {
            Ok(()) => info!(ino = %jp.back, "erased back journal"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(ino = %jp.back, error = %e, "failed to erase back journal, clearing pointer anyway");
            }
        }

        jp.back = InodeNo::NULL;
        shared
            .pointers
            .save(&jp)
            .map_err(|e| Error::Pointer(format!("cannot clear back journal pointer: {e}")))?;
    }

    // Step: recover the front journal's header and bounds.
    let mut front = shared.streams.open_stream(jp.front);
    debug!(ino = %jp.front, "waiting for journal to recover");
    wait_op(shared, |done| front.recover(done)).map_err(|e| {
        error!(ino = %jp.front, error = %e, "error recovering journal");
        e
    })?;
    debug!(ino = %jp.front, "journal recovered");

    // Step: check whether the on-disk format is acceptable.
    if front.stream_format() >= shared.config.journal_format {
        let mut core = shared.lock.lock();
        install_write_error_handler(shared, front.as_mut());
        core.stream = Some(front);
        Ok(())
    } else {
        info!(
            ino = %jp.front,
            format = front.stream_format(),
            "journal has old format, it will now be updated"
        );
        reformat_journal(shared, jp, front)
    }
}

/// Rewrite of the journal to a new object, followed by a pointer swap.
///
/// The new journal is written to the pointer's back slot; the slots swap
/// only once the rewrite is safely flushed. A crash before the swap reruns
/// cleanup from the top of recovery and discards the partial copy; a crash
/// after it leaves only a stale back journal to erase.
fn reformat_journal(
    shared: &Arc<Shared>,
    mut jp: JournalPointer,
    mut old: Box<dyn JournalStream>,
) -> Result<()> {
    // Declare intent before any data is written.
    let primary = default_log_ino(shared.mds_id);
    let secondary = backup_log_ino(shared.mds_id);
    jp.back = if jp.front == primary { secondary } else { primary };
    shared
        .pointers
        .save(&jp)
        .map_err(|e| Error::Pointer(format!("cannot declare reformat target: {e}")))?;

    info!(ino = %jp.back, "writing new journal header");
    let mut new = shared.streams.open_stream(jp.back);
    new.set_writeable();
    new.create(old.layout(), shared.config.journal_format);
    wait_op(shared, |done| new.write_head(Some(done)))?;

    // Read the old journal end to end, appending each event's bytes to the
    // new journal. Same readable-wait discipline as replay: the coarse
    // mutex is held between checking readable and registering the wait.
    let mut transcribed: u64 = 0;
    let mut core = shared.lock.lock();
    loop {
        while !old.is_readable() && old.read_pos() < old.write_pos() && old.error().is_none() {
            let completion = Completion::new();
            old.wait_for_readable(completion.callback());
            let _ = MutexGuard::unlocked(&mut core, || completion.wait());
        }
        if let Some(err) = old.error() {
            error!(error = %err, "error reading old journal, aborting reformat");
            // The partial back journal stays behind as garbage; the next
            // startup erases it via the still-set back pointer.
            return Err(err.into());
        }
        if !old.is_readable() && old.read_pos() == old.write_pos() {
            break;
        }

        match old.try_read_entry() {
            Some(bytes) => {
                transcribed += 1;
                new.append_entry(bytes);
            }
            None => {
                if old.error().is_some() {
                    continue;
                }
                return Err(Error::storage("old journal unreadable with no error latched"));
            }
        }

        // Yield: let other I/O (e.g. beacons) take the lock between events.
        MutexGuard::unlocked(&mut core, || {});
    }
    drop(core);

    info!(events = transcribed, "transcribed events, flushing new journal");
    wait_op(shared, |done| new.flush(Some(done)))?;

    // Commit point: the new journal is safe, flip the slots.
    std::mem::swap(&mut jp.front, &mut jp.back);
    shared
        .pointers
        .save(&jp)
        .map_err(|e| Error::Pointer(format!("cannot commit reformat pointer swap: {e}")))?;

    info!(ino = %jp.back, "new journal flushed, erasing old journal");
    match wait_op(shared, |done| old.erase(done)) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            error!(ino = %jp.back, error = %e, "failed to erase old journal, clearing pointer anyway");
        }
    }

    jp.back = InodeNo::NULL;
    shared
        .pointers
        .save(&jp)
        .map_err(|e| Error::Pointer(format!("cannot clear reformat pointer: {e}")))?;

    info!("journal rewrite complete, continuing with normal startup");
    let mut core = shared.lock.lock();
    new.set_readonly();
    install_write_error_handler(shared, new.as_mut());
    core.stream = Some(new);
    Ok(())
}

/// Issue a stream operation while holding the coarse mutex, then wait for
/// its completion with the mutex released.
fn wait_op(shared: &Arc<Shared>, issue: impl FnOnce(StreamCallback)) -> Result<()> {
    let completion = Completion::new();
    {
        let _core = shared.lock.lock();
        issue(completion.callback());
    }
    completion.wait()
}
