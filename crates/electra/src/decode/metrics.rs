use std::sync::atomic::{AtomicU64, Ordering};

use media_types::StreamType;
use tracing::info;

/// Decode engine counters. All counters use relaxed atomics.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Units accepted by the decoder in normal mode
    pub submitted: AtomicU64,
    /// Units re-submitted during replay
    pub replayed: AtomicU64,
    /// Outputs matched to their input
    pub decoded: AtomicU64,
    /// Outputs handed to the renderer as presentable
    pub rendered: AtomicU64,
    /// Units or outputs dropped without rendering
    pub discarded: AtomicU64,
    /// Placeholder outputs for filler units
    pub dummies: AtomicU64,
    pub drains: AtomicU64,
    pub resets: AtomicU64,
    pub decoder_losses: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub submitted: u64,
    pub replayed: u64,
    pub decoded: u64,
    pub rendered: u64,
    pub discarded: u64,
    pub dummies: u64,
    pub drains: u64,
    pub resets: u64,
    pub decoder_losses: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dummies: self.dummies.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            decoder_losses: self.decoder_losses.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, stream_type: StreamType) {
        let s = self.snapshot();
        info!(
            stream_type = %stream_type,
            submitted = s.submitted,
            decoded = s.decoded,
            rendered = s.rendered,
            discarded = s.discarded,
            dummies = s.dummies,
            replayed = s.replayed,
            drains = s.drains,
            resets = s.resets,
            decoder_losses = s.decoder_losses,
            "Decode engine summary"
        );
    }
}
