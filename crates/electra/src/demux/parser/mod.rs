//! Minimal container parsers. They find sample boundaries, timing and codec
//! configuration blobs; codec bitstreams pass through untouched.

mod adts;
mod id3;
mod mkv;
mod mp4;
mod ts;
mod webvtt;

use std::sync::Arc;

use bytes::Bytes;
use media_types::StreamType;

use super::probe::ContainerFormat;
use super::reader::MediaReader;
use crate::error::DemuxError;
use crate::unit::CodecConfiguration;

pub use adts::AdtsHeader;
pub use id3::Id3AdtsParser;
pub use mkv::MatroskaParser;
pub use mp4::Mp4Parser;
pub use ts::TsParser;
pub use webvtt::WebVttParser;

#[cfg(test)]
pub(crate) use adts::build_frame as build_adts_frame;
#[cfg(test)]
pub(crate) use id3::build_timestamp_tag;
#[cfg(test)]
pub(crate) use mp4::fixtures as mp4_fixtures;

/// One elementary stream declared by a container.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: u64,
    pub stream_type: StreamType,
    /// Ticks per second of this track's sample times
    pub timescale: u32,
    pub codec: Arc<CodecConfiguration>,
    /// Bit width of a wrapping timestamp clock, if the container has one
    pub timestamp_bits: Option<u32>,
}

/// One sample, timed in its track's timescale.
#[derive(Debug, Clone)]
pub struct ParsedSample {
    pub track_id: u64,
    pub pts: i64,
    pub dts: i64,
    /// Zero when the container does not say
    pub duration: u64,
    pub sync: bool,
    pub discardable: bool,
    pub payload: Bytes,
    /// In-band configuration replacing the track's from this sample on
    pub codec: Option<Arc<CodecConfiguration>>,
}

/// Capability shared by every container parser.
pub trait SampleParser {
    /// Reads the track list from `init`, or from the segment itself for
    /// self-initializing containers.
    fn parse_header(
        &mut self,
        init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError>;

    /// Restricts [`next_sample`](Self::next_sample) to these track ids.
    fn select_tracks(&mut self, ids: &[u64]);

    /// The next sample in document order, or `None` at the end of the segment.
    fn next_sample(&mut self, reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError>;
}

/// The closed set of supported containers.
#[derive(Debug)]
pub enum ContainerParser {
    Mp4(Mp4Parser),
    Matroska(MatroskaParser),
    Ts(TsParser),
    Id3Adts(Id3AdtsParser),
    WebVtt(WebVttParser),
}

impl ContainerParser {
    pub fn for_format(format: ContainerFormat) -> Self {
        match format {
            ContainerFormat::Mp4 => Self::Mp4(Mp4Parser::new()),
            ContainerFormat::Matroska => Self::Matroska(MatroskaParser::new()),
            ContainerFormat::Ts => Self::Ts(TsParser::new()),
            ContainerFormat::Id3Adts => Self::Id3Adts(Id3AdtsParser::new()),
            ContainerFormat::WebVtt => Self::WebVtt(WebVttParser::new()),
        }
    }

    pub fn format(&self) -> ContainerFormat {
        match self {
            Self::Mp4(_) => ContainerFormat::Mp4,
            Self::Matroska(_) => ContainerFormat::Matroska,
            Self::Ts(_) => ContainerFormat::Ts,
            Self::Id3Adts(_) => ContainerFormat::Id3Adts,
            Self::WebVtt(_) => ContainerFormat::WebVtt,
        }
    }

    fn inner(&mut self) -> &mut dyn SampleParser {
        match self {
            Self::Mp4(p) => p,
            Self::Matroska(p) => p,
            Self::Ts(p) => p,
            Self::Id3Adts(p) => p,
            Self::WebVtt(p) => p,
        }
    }
}

impl SampleParser for ContainerParser {
    fn parse_header(
        &mut self,
        init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError> {
        self.inner().parse_header(init, reader)
    }

    fn select_tracks(&mut self, ids: &[u64]) {
        self.inner().select_tracks(ids);
    }

    fn next_sample(&mut self, reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError> {
        self.inner().next_sample(reader)
    }
}

/// Lowest-id track of `stream_type`.
pub fn lowest_track(tracks: &[TrackInfo], stream_type: StreamType) -> Option<&TrackInfo> {
    tracks
        .iter()
        .filter(|t| t.stream_type == stream_type)
        .min_by_key(|t| t.id)
}
