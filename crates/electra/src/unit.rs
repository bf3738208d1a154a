use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use media_types::{MediaTime, Resolution, StreamType};

/// Correlation key of one multiplexed alternative (quality level / rendition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackIdentity(Arc<str>);

impl TrackIdentity {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Decoder setup for one configuration epoch. Shared immutably by every unit
/// of the epoch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodecConfiguration {
    /// Four-character or container codec name (`avc1`, `mp4a`, `V_VP9`, ...)
    pub codec: String,
    /// Decoder specific setup blob (avcC, esds payload, CodecPrivate)
    pub decoder_specific: Bytes,
    pub resolution: Option<Resolution>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl CodecConfiguration {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            ..Default::default()
        }
    }

    pub fn with_decoder_specific(mut self, blob: Bytes) -> Self {
        self.decoder_specific = blob;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = Some(sample_rate);
        self.channels = Some(channels);
        self
    }
}

/// One compressed sample plus its timing on the global time axis.
#[derive(Debug, Clone)]
pub struct DecodableUnit {
    pub stream_type: StreamType,
    pub pts: MediaTime,
    pub dts: MediaTime,
    pub duration: MediaTime,
    /// Timeline generation; changes whenever timestamps restart
    pub sequence_index: u32,
    /// Presentable window. Units outside it are decoded but not shown.
    pub earliest_pts: MediaTime,
    pub latest_pts: MediaTime,
    pub payload: Bytes,
    pub sync: bool,
    pub first_in_sequence: bool,
    pub last_in_period: bool,
    /// Synthesized zero-payload placeholder
    pub filler: bool,
    /// No other sample references this one
    pub discardable: bool,
    pub codec_config: Option<Arc<CodecConfiguration>>,
    pub source: TrackIdentity,
}

impl DecodableUnit {
    /// A unit at time zero with an unbounded presentable window.
    pub fn new(stream_type: StreamType, source: TrackIdentity) -> Self {
        Self {
            stream_type,
            pts: MediaTime::ZERO,
            dts: MediaTime::ZERO,
            duration: MediaTime::ZERO,
            sequence_index: 0,
            earliest_pts: MediaTime::NEGATIVE_INFINITY,
            latest_pts: MediaTime::POSITIVE_INFINITY,
            payload: Bytes::new(),
            sync: false,
            first_in_sequence: false,
            last_in_period: false,
            filler: false,
            discardable: false,
            codec_config: None,
            source,
        }
    }

    /// A zero-payload placeholder covering `[at, at + duration)`.
    pub fn filler(
        stream_type: StreamType,
        source: TrackIdentity,
        at: MediaTime,
        duration: MediaTime,
    ) -> Self {
        Self {
            filler: true,
            ..Self::new(stream_type, source).with_timing(at, at, duration)
        }
    }

    pub fn with_timing(mut self, pts: MediaTime, dts: MediaTime, duration: MediaTime) -> Self {
        self.pts = pts;
        self.dts = dts;
        self.duration = duration;
        self
    }

    pub fn with_window(mut self, earliest: MediaTime, latest: MediaTime) -> Self {
        debug_assert!(latest >= earliest, "window ends before it starts");
        self.earliest_pts = earliest;
        self.latest_pts = latest;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn end_pts(&self) -> MediaTime {
        self.pts + self.duration
    }

    /// Whether any part of the unit overlaps its presentable window.
    pub fn is_presentable(&self) -> bool {
        if self.pts >= self.latest_pts {
            return false;
        }
        self.pts >= self.earliest_pts || self.end_pts() > self.earliest_pts
    }

    /// Whether the unit changes the active codec configuration relative to `current`.
    pub fn changes_config(&self, current: Option<&Arc<CodecConfiguration>>) -> bool {
        match (self.codec_config.as_ref(), current) {
            (Some(new), Some(old)) => !Arc::ptr_eq(new, old) && **new != **old,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_at(pts_ms: i64, dur_ms: i64) -> DecodableUnit {
        DecodableUnit::new(StreamType::Video, TrackIdentity::new("v")).with_timing(
            MediaTime::from_millis(pts_ms),
            MediaTime::from_millis(pts_ms),
            MediaTime::from_millis(dur_ms),
        )
    }

    #[test]
    fn test_unbounded_window_is_presentable() {
        assert!(unit_at(0, 40).is_presentable());
    }

    #[test]
    fn test_window_overlap() {
        let window = |u: DecodableUnit| {
            u.with_window(MediaTime::from_millis(100), MediaTime::from_millis(200))
        };
        // Ends before the window starts.
        assert!(!window(unit_at(40, 40)).is_presentable());
        // Straddles the start.
        assert!(window(unit_at(80, 40)).is_presentable());
        assert!(window(unit_at(199, 40)).is_presentable());
        // Starts at the end.
        assert!(!window(unit_at(200, 40)).is_presentable());
    }

    #[test]
    fn test_filler_has_no_payload() {
        let f = DecodableUnit::filler(
            StreamType::Audio,
            TrackIdentity::new("a"),
            MediaTime::from_millis(10),
            MediaTime::from_millis(50),
        );
        assert!(f.filler);
        assert!(f.payload.is_empty());
        assert_eq!(f.pts, f.dts);
        assert_eq!(f.end_pts(), MediaTime::from_millis(60));
    }

    #[test]
    fn test_config_change_detection() {
        let avc = Arc::new(CodecConfiguration::new("avc1").with_resolution(1280, 720));
        let same = Arc::new(CodecConfiguration::new("avc1").with_resolution(1280, 720));
        let hd = Arc::new(CodecConfiguration::new("avc1").with_resolution(1920, 1080));

        let mut unit = unit_at(0, 40);
        assert!(!unit.changes_config(Some(&avc)));
        unit.codec_config = Some(same);
        assert!(unit.changes_config(None));
        assert!(!unit.changes_config(Some(&avc)));
        unit.codec_config = Some(hd);
        assert!(unit.changes_config(Some(&avc)));
    }
}
