use std::time::Duration;

use media_types::{MediaTime, StreamType};

use crate::error::DemuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Completed,
    /// Rejected by the timestamp-regression guard; nothing was pushed
    Skipped,
    /// Stopped by the ABR policy or by shutdown
    Aborted,
    Failed,
}

/// Per-segment download report.
#[derive(Debug, Clone)]
pub struct SegmentDownloadStats {
    pub url: String,
    pub stream_type: StreamType,
    pub quality_index: u32,
    pub sequence_index: u32,
    pub http_status: Option<u16>,
    pub bytes_downloaded: u64,
    pub download_time: Duration,
    /// Media time parsed from the segment
    pub downloaded_duration: MediaTime,
    /// Media time pushed to the buffers, excluding filler
    pub delivered_duration: MediaTime,
    pub outcome: SegmentOutcome,
    pub inserted_filler: bool,
    pub failure_reason: Option<String>,
    pub error: Option<DemuxError>,
}

impl SegmentDownloadStats {
    pub fn new(url: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            url: url.into(),
            stream_type,
            quality_index: 0,
            sequence_index: 0,
            http_status: None,
            bytes_downloaded: 0,
            download_time: Duration::ZERO,
            downloaded_duration: MediaTime::ZERO,
            delivered_duration: MediaTime::ZERO,
            outcome: SegmentOutcome::Completed,
            inserted_filler: false,
            failure_reason: None,
            error: None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.outcome == SegmentOutcome::Completed
    }

    pub fn was_aborted(&self) -> bool {
        self.outcome == SegmentOutcome::Aborted
    }

    pub fn was_skipped(&self) -> bool {
        self.outcome == SegmentOutcome::Skipped
    }

    pub(crate) fn fail(&mut self, error: DemuxError) {
        self.outcome = SegmentOutcome::Failed;
        if self.failure_reason.is_none() {
            self.failure_reason = Some(error.to_string());
        }
        if let DemuxError::Transport { source, .. } = &error
            && self.http_status.is_none()
        {
            self.http_status = source.http_status();
        }
        self.error = Some(error);
    }
}

/// Notifications from a demultiplexer worker.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    SegmentFinished(SegmentDownloadStats),
    EndOfStream { stream_type: StreamType },
}
