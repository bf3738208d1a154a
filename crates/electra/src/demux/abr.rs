use std::time::Duration;

use bitflags::bitflags;
use media_types::{MediaTime, StreamType};

use super::stats::SegmentDownloadStats;

bitflags! {
    /// Actions an ABR policy can request during a download.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AbrFlags: u8 {
        /// Push the units parsed so far without waiting for the segment end
        const EMIT_PARTIAL = 0x01;
        /// Cover the undownloaded remainder with filler units
        const INSERT_FILLER = 0x02;
        /// Stop downloading this segment
        const ABORT = 0x04;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbrDecision {
    pub flags: AbrFlags,
    /// Diagnostic text, recorded in the segment stats on abort
    pub reason: Option<String>,
}

impl AbrDecision {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn emit_partial(reason: impl Into<String>) -> Self {
        Self {
            flags: AbrFlags::EMIT_PARTIAL,
            reason: Some(reason.into()),
        }
    }

    pub fn abort(reason: impl Into<String>, insert_filler: bool) -> Self {
        let mut flags = AbrFlags::ABORT;
        flags.set(AbrFlags::INSERT_FILLER, insert_filler);
        Self {
            flags,
            reason: Some(reason.into()),
        }
    }

    pub fn contains(&self, flags: AbrFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// Snapshot of an in-flight segment download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub stream_type: StreamType,
    pub url: String,
    pub bytes_downloaded: u64,
    pub elapsed: Duration,
    /// Expected media duration of the whole segment
    pub segment_duration: MediaTime,
    /// Media time parsed so far
    pub downloaded_duration: MediaTime,
    /// Media time already pushed to the buffers
    pub delivered_duration: MediaTime,
    /// Playable duration queued for the decoder
    pub buffered_duration: MediaTime,
}

/// Download-time adaptation. Runs on the demultiplexer thread.
pub trait AbrPolicy: Send {
    fn report_download_progress(&mut self, progress: &DownloadProgress) -> AbrDecision;

    fn report_download_end(&mut self, _stats: &SegmentDownloadStats) {}
}

/// Never intervenes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveAbr;

impl AbrPolicy for PassiveAbr {
    fn report_download_progress(&mut self, _progress: &DownloadProgress) -> AbrDecision {
        AbrDecision::proceed()
    }
}

/// Reacts to the consumer's buffer level.
///
/// Below `low_watermark` parsed units are emitted early. A download whose
/// projected remaining time exceeds `abort_factor` times the buffered
/// duration is aborted, with filler when part of it was already delivered.
#[derive(Debug, Clone)]
pub struct BufferLevelAbr {
    pub low_watermark: MediaTime,
    pub abort_factor: f64,
    /// Progress younger than this is too noisy to project from
    pub min_elapsed: Duration,
    completed: u64,
    aborted: u64,
}

impl Default for BufferLevelAbr {
    fn default() -> Self {
        Self {
            low_watermark: MediaTime::from_millis(2_000),
            abort_factor: 1.5,
            min_elapsed: Duration::from_millis(500),
            completed: 0,
            aborted: 0,
        }
    }
}

impl BufferLevelAbr {
    pub fn new(low_watermark: MediaTime, abort_factor: f64) -> Self {
        Self {
            low_watermark,
            abort_factor,
            ..Self::default()
        }
    }

    /// Segments finished and aborted so far.
    pub fn history(&self) -> (u64, u64) {
        (self.completed, self.aborted)
    }

    fn projected_remaining(progress: &DownloadProgress) -> Option<f64> {
        let elapsed = progress.elapsed.as_secs_f64();
        let downloaded = progress.downloaded_duration.as_secs_f64();
        if elapsed <= 0.0 || downloaded <= 0.0 {
            return None;
        }
        let remaining = (progress.segment_duration - progress.downloaded_duration).as_secs_f64();
        Some(remaining.max(0.0) * elapsed / downloaded)
    }
}

impl AbrPolicy for BufferLevelAbr {
    fn report_download_progress(&mut self, progress: &DownloadProgress) -> AbrDecision {
        let buffered = progress.buffered_duration;
        if progress.elapsed >= self.min_elapsed && buffered > MediaTime::ZERO {
            if let Some(projected) = Self::projected_remaining(progress)
                && projected > buffered.as_secs_f64() * self.abort_factor
            {
                let partial = progress.delivered_duration > MediaTime::ZERO;
                return AbrDecision::abort(
                    format!(
                        "projected {projected:.2}s to finish with {:.2}s buffered",
                        buffered.as_secs_f64()
                    ),
                    partial,
                );
            }
        }
        if buffered < self.low_watermark && progress.downloaded_duration > progress.delivered_duration {
            return AbrDecision::emit_partial(format!(
                "buffer at {:.2}s below {:.2}s",
                buffered.as_secs_f64(),
                self.low_watermark.as_secs_f64()
            ));
        }
        AbrDecision::proceed()
    }

    fn report_download_end(&mut self, stats: &SegmentDownloadStats) {
        if stats.was_aborted() {
            self.aborted += 1;
        } else {
            self.completed += 1;
        }
    }
}
