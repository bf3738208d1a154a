use std::fmt;
use std::sync::Arc;

use media_types::{MediaTime, StreamType};
use tracing::warn;

use super::decrypt::SegmentDecrypter;
use super::probe::ContainerFormat;
use crate::unit::TrackIdentity;

/// Inclusive byte range, as in an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    /// Last byte included; `None` reads to the end of the resource
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// A fetchable resource. Also the init-segment cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRequest {
    pub url: String,
    pub range: Option<ByteRange>,
}

impl ResourceRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => write!(f, "{} [{}]", self.url, range),
            None => f.write_str(&self.url),
        }
    }
}

/// One media segment to download and demultiplex.
///
/// Times are segment-local except `period_start`, `anchor_time` and
/// `adjustment`, which place the segment on the global timeline.
#[derive(Clone)]
pub struct SegmentRequest {
    /// Primary stream type; its track must be present in the segment
    pub stream_type: StreamType,
    pub resource: ResourceRequest,
    /// Init segment, for containers that carry their headers out of band
    pub init: Option<ResourceRequest>,
    /// Declared container; the probe result wins when they disagree
    pub format: Option<ContainerFormat>,
    pub quality_index: u32,
    pub sequence_index: u32,
    /// Monotonic id used to order track selections in the buffers
    pub selection_id: u64,
    /// Buffer identity override; derived from stream type and quality if unset
    pub track: Option<TrackIdentity>,

    pub presentation_time_offset: MediaTime,
    pub period_start: MediaTime,
    pub anchor_time: MediaTime,
    pub adjustment: MediaTime,
    /// Segment-local start, used for filler when nothing was parsed
    pub start: MediaTime,
    pub duration: MediaTime,
    pub earliest_pts: MediaTime,
    pub latest_pts: MediaTime,

    /// A 404 means the segment is legitimately absent
    pub may_be_missing: bool,
    /// The final unit ends the playback period
    pub last_in_period: bool,
    pub decrypter: Option<Arc<dyn SegmentDecrypter>>,
}

impl SegmentRequest {
    pub fn new(stream_type: StreamType, url: impl Into<String>) -> Self {
        Self {
            stream_type,
            resource: ResourceRequest::new(url),
            init: None,
            format: None,
            quality_index: 0,
            sequence_index: 0,
            selection_id: 0,
            track: None,
            presentation_time_offset: MediaTime::ZERO,
            period_start: MediaTime::ZERO,
            anchor_time: MediaTime::ZERO,
            adjustment: MediaTime::ZERO,
            start: MediaTime::ZERO,
            duration: MediaTime::ZERO,
            earliest_pts: MediaTime::NEGATIVE_INFINITY,
            latest_pts: MediaTime::POSITIVE_INFINITY,
            may_be_missing: false,
            last_in_period: false,
            decrypter: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.resource.range = Some(range);
        self
    }

    pub fn with_init(mut self, init: ResourceRequest) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_format(mut self, format: ContainerFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_quality(mut self, quality_index: u32) -> Self {
        self.quality_index = quality_index;
        self
    }

    pub fn with_sequence(mut self, sequence_index: u32) -> Self {
        self.sequence_index = sequence_index;
        self
    }

    pub fn with_selection_id(mut self, selection_id: u64) -> Self {
        self.selection_id = selection_id;
        self
    }

    pub fn with_track(mut self, track: TrackIdentity) -> Self {
        self.track = Some(track);
        self
    }

    /// Segment-local start and duration.
    pub fn with_timing(mut self, start: MediaTime, duration: MediaTime) -> Self {
        self.start = start;
        self.duration = duration;
        self
    }

    pub fn with_timeline(
        mut self,
        period_start: MediaTime,
        anchor_time: MediaTime,
        adjustment: MediaTime,
        presentation_time_offset: MediaTime,
    ) -> Self {
        self.period_start = period_start;
        self.anchor_time = anchor_time;
        self.adjustment = adjustment;
        self.presentation_time_offset = presentation_time_offset;
        self
    }

    /// Sets the presentable window. A `latest` before `earliest` is
    /// discarded and the window stays open-ended.
    pub fn with_window(mut self, earliest: MediaTime, latest: MediaTime) -> Self {
        self.earliest_pts = earliest;
        self.latest_pts = latest;
        if latest < earliest {
            warn!(
                url = %self.resource,
                earliest = %earliest,
                latest = %latest,
                "Inverted presentation window, ignoring its end"
            );
            self.latest_pts = MediaTime::POSITIVE_INFINITY;
        }
        self
    }

    /// Window with `latest >= earliest` guaranteed, for requests whose
    /// fields were set directly.
    pub fn presentable_window(&self) -> (MediaTime, MediaTime) {
        if self.latest_pts < self.earliest_pts {
            (self.earliest_pts, MediaTime::POSITIVE_INFINITY)
        } else {
            (self.earliest_pts, self.latest_pts)
        }
    }

    pub fn may_be_missing(mut self, may_be_missing: bool) -> Self {
        self.may_be_missing = may_be_missing;
        self
    }

    pub fn last_in_period(mut self, last: bool) -> Self {
        self.last_in_period = last;
        self
    }

    pub fn with_decrypter(mut self, decrypter: Arc<dyn SegmentDecrypter>) -> Self {
        self.decrypter = Some(decrypter);
        self
    }

    pub fn url(&self) -> &str {
        &self.resource.url
    }

    /// Buffer identity for units of `stream_type` from this segment.
    pub fn identity_for(&self, stream_type: StreamType) -> TrackIdentity {
        match &self.track {
            Some(track) if stream_type == self.stream_type => track.clone(),
            _ => TrackIdentity::new(format!("{}-q{}", stream_type, self.quality_index)),
        }
    }
}

impl fmt::Debug for SegmentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentRequest")
            .field("stream_type", &self.stream_type)
            .field("resource", &self.resource)
            .field("init", &self.init)
            .field("format", &self.format)
            .field("quality_index", &self.quality_index)
            .field("sequence_index", &self.sequence_index)
            .field("start", &self.start)
            .field("duration", &self.duration)
            .field("may_be_missing", &self.may_be_missing)
            .field("encrypted", &self.decrypter.is_some())
            .finish_non_exhaustive()
    }
}

/// Work items for a demultiplexer worker.
#[derive(Debug, Clone)]
pub enum DemuxRequest {
    Segment(Box<SegmentRequest>),
    /// No further segments; marks end of data on every sink
    EndOfStream,
}

impl From<SegmentRequest> for DemuxRequest {
    fn from(request: SegmentRequest) -> Self {
        Self::Segment(Box::new(request))
    }
}
