//! A small read-only counters snapshot for diagnostics and logging (spec
//! SPEC_FULL §3 "[SUPPLEMENT] Session metrics snapshot"). No external
//! exporter is wired up — metrics/telemetry export is out of scope (spec
//! §1 Non-goals).

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub intercepts_active: AtomicUsize,
    pub forwards_active: AtomicUsize,
    pub mounts_active: AtomicUsize,
    pub stream_reconnects: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub intercepts_active: usize,
    pub forwards_active: usize,
    pub mounts_active: usize,
    pub stream_reconnects: usize,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            intercepts_active: self.intercepts_active.load(Ordering::Relaxed),
            forwards_active: self.forwards_active.load(Ordering::Relaxed),
            mounts_active: self.mounts_active.load(Ordering::Relaxed),
            stream_reconnects: self.stream_reconnects.load(Ordering::Relaxed),
        }
    }

    pub fn record_reconnect(&self) {
        self.stream_reconnects.fetch_add(1, Ordering::Relaxed);
    }
}
