use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters maintained by the connection task.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_kinds: AtomicU64,
    callback_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub unknown_kinds: u64,
    pub callback_failures: u64,
}

impl SessionStats {
    pub(crate) fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unknown_kind(&self) {
        self.unknown_kinds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_callback_failures(&self, count: usize) {
        self.callback_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_kinds: self.unknown_kinds.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}
