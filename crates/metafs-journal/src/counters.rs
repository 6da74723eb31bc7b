//! Journal performance counters
//!
//! Counter and gauge names follow the mds_log perf family: per-event and
//! per-segment add/expire/trim counters, occupancy gauges, and the three
//! stream positions. The journal-latency histogram is owned by the stream
//! and not duplicated here.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide journal counters, updated under the coarse MDS mutex.
#[derive(Debug, Default)]
pub struct JournalCounters {
    evadd: AtomicU64,
    evex: AtomicU64,
    evtrm: AtomicU64,
    ev: AtomicU64,
    evexg: AtomicU64,
    evexd: AtomicU64,

    segadd: AtomicU64,
    segex: AtomicU64,
    segtrm: AtomicU64,
    seg: AtomicU64,
    segexg: AtomicU64,
    segexd: AtomicU64,

    expos: AtomicU64,
    wrpos: AtomicU64,
    rdpos: AtomicU64,
}

impl JournalCounters {
    pub(crate) fn ev_added(&self) {
        self.evadd.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ev_expired(&self, n: u64) {
        self.evex.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn ev_trimmed(&self, n: u64) {
        self.evtrm.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn seg_added(&self) {
        self.segadd.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn seg_expired(&self) {
        self.segex.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn seg_trimmed(&self) {
        self.segtrm.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_ev(&self, n: u64) {
        self.ev.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_seg(&self, n: usize) {
        self.seg.store(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_expiring(&self, segments: usize, events: u64) {
        self.segexg.store(segments as u64, Ordering::Relaxed);
        self.evexg.store(events, Ordering::Relaxed);
    }

    pub(crate) fn set_expired(&self, segments: usize, events: u64) {
        self.segexd.store(segments as u64, Ordering::Relaxed);
        self.evexd.store(events, Ordering::Relaxed);
    }

    pub(crate) fn set_expos(&self, pos: u64) {
        self.expos.store(pos, Ordering::Relaxed);
    }

    pub(crate) fn set_wrpos(&self, pos: u64) {
        self.wrpos.store(pos, Ordering::Relaxed);
    }

    pub(crate) fn set_rdpos(&self, pos: u64) {
        self.rdpos.store(pos, Ordering::Relaxed);
    }

    /// A consistent-enough copy for scraping and tests.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            evadd: self.evadd.load(Ordering::Relaxed),
            evex: self.evex.load(Ordering::Relaxed),
            evtrm: self.evtrm.load(Ordering::Relaxed),
            ev: self.ev.load(Ordering::Relaxed),
            evexg: self.evexg.load(Ordering::Relaxed),
            evexd: self.evexd.load(Ordering::Relaxed),
            segadd: self.segadd.load(Ordering::Relaxed),
            segex: self.segex.load(Ordering::Relaxed),
            segtrm: self.segtrm.load(Ordering::Relaxed),
            seg: self.seg.load(Ordering::Relaxed),
            segexg: self.segexg.load(Ordering::Relaxed),
            segexd: self.segexd.load(Ordering::Relaxed),
            expos: self.expos.load(Ordering::Relaxed),
            wrpos: self.wrpos.load(Ordering::Relaxed),
            rdpos: self.rdpos.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub evadd: u64,
    pub evex: u64,
    pub evtrm: u64,
    pub ev: u64,
    pub evexg: u64,
    pub evexd: u64,
    pub segadd: u64,
    pub segex: u64,
    pub segtrm: u64,
    pub seg: u64,
    pub segexg: u64,
    pub segexd: u64,
    pub expos: u64,
    pub wrpos: u64,
    pub rdpos: u64,
}
