//! Gather combinator for segment expiry
//!
//! A segment may only expire once every flush it depends on has completed.
//! The gather counts outstanding flush completions and runs a single
//! finisher when the last one lands. An empty gather reports
//! `has_subs() == false` so callers can take a synchronous fast path.

use parking_lot::Mutex;
use std::sync::Arc;

type Finisher = Box<dyn FnOnce() + Send + 'static>;

struct GatherState {
    outstanding: usize,
    activated: bool,
    finisher: Option<Finisher>,
}

/// Collects flush completions for one expiry attempt.
pub struct GatherBuilder {
    state: Arc<Mutex<GatherState>>,
    subs: usize,
}

impl GatherBuilder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GatherState {
                outstanding: 0,
                activated: false,
                finisher: None,
            })),
            subs: 0,
        }
    }

    /// Register one more completion the finisher must wait for.
    pub fn new_sub(&mut self) -> GatherSub {
        self.subs += 1;
        self.state.lock().outstanding += 1;
        GatherSub {
            state: Arc::clone(&self.state),
        }
    }

    /// Whether any completions were registered.
    #[must_use]
    pub fn has_subs(&self) -> bool {
        self.subs > 0
    }

    /// Arm the gather. The finisher runs as soon as the last sub completes,
    /// which may be immediately if they all already have.
    pub fn activate(self, finisher: Finisher) {
        let to_run = {
            let mut state = self.state.lock();
            state.activated = true;
            if state.outstanding == 0 {
                state.finisher = None;
                Some(finisher)
            } else {
                state.finisher = Some(finisher);
                None
            }
        };
        if let Some(finisher) = to_run {
            finisher();
        }
    }
}

impl Default for GatherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One outstanding completion of a gather.
pub struct GatherSub {
    state: Arc<Mutex<GatherState>>,
}

impl GatherSub {
    /// Mark this sub complete. The finisher runs here if this was the last
    /// outstanding sub of an activated gather.
    pub fn complete(self) {
        let finisher = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            if state.activated && state.outstanding == 0 {
                state.finisher.take()
            } else {
                None
            }
        };
        if let Some(finisher) = finisher {
            finisher();
        }
    }
}
