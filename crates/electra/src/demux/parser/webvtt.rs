use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use media_types::StreamType;
use memchr::memmem;

use super::{ParsedSample, SampleParser, TrackInfo};
use crate::demux::reader::MediaReader;
use crate::error::DemuxError;
use crate::unit::CodecConfiguration;

const TRACK_ID: u64 = 1;
const TIMESCALE: u32 = 1_000;
const TIMESTAMP_MAP: &str = "X-TIMESTAMP-MAP=";

/// Parses `hh:mm:ss.ttt` or `mm:ss.ttt` into milliseconds.
fn parse_cue_time(text: &str) -> Option<i64> {
    let (clock, millis) = text.trim().split_once('.')?;
    if millis.len() != 3 {
        return None;
    }
    let millis: i64 = millis.parse().ok()?;
    let parts: Vec<&str> = clock.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (h.parse::<i64>().ok()?, m.parse::<i64>().ok()?, s.parse::<i64>().ok()?),
        [m, s] => (0, m.parse::<i64>().ok()?, s.parse::<i64>().ok()?),
        _ => return None,
    };
    if minutes > 59 || seconds > 59 {
        return None;
    }
    Some(((hours * 60 + minutes) * 60 + seconds) * 1_000 + millis)
}

/// Offset in milliseconds that `X-TIMESTAMP-MAP` applies to cue times.
fn parse_timestamp_map(value: &str) -> Result<i64, DemuxError> {
    let mut mpegts = None;
    let mut local = None;
    for field in value.split(',') {
        match field.trim().split_once(':') {
            Some(("MPEGTS", ticks)) => mpegts = ticks.parse::<i64>().ok(),
            Some(("LOCAL", time)) => local = parse_cue_time(time),
            _ => {}
        }
    }
    match (mpegts, local) {
        (Some(ticks), Some(local)) => Ok(ticks / 90 - local),
        _ => Err(DemuxError::malformed_header(format!("invalid X-TIMESTAMP-MAP `{value}`"))),
    }
}

/// A WebVTT document, one sample per cue. The payload is the cue block
/// text including its timing line.
#[derive(Debug)]
pub struct WebVttParser {
    cues: VecDeque<ParsedSample>,
    enabled: bool,
}

impl Default for WebVttParser {
    fn default() -> Self {
        Self {
            cues: VecDeque::new(),
            enabled: true,
        }
    }
}

impl WebVttParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_document(&mut self, data: &[u8]) -> Result<(), DemuxError> {
        let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
        let text = std::str::from_utf8(data)
            .map_err(|e| DemuxError::malformed_header(format!("WebVTT is not UTF-8: {e}")))?;
        let text = text.replace("\r\n", "\n").replace('\r', "\n");

        let mut blocks = text.split("\n\n").map(|block| block.trim_matches('\n'));
        let header = blocks.next().unwrap_or_default();
        let signature = header.lines().next().unwrap_or_default();
        if signature != "WEBVTT" && !signature.starts_with("WEBVTT ") && !signature.starts_with("WEBVTT\t") {
            return Err(DemuxError::malformed_header("missing WEBVTT signature"));
        }

        let mut offset = 0;
        for line in header.lines().skip(1) {
            if let Some(value) = line.strip_prefix(TIMESTAMP_MAP) {
                offset = parse_timestamp_map(value)?;
            }
        }

        for block in blocks {
            if block.is_empty() || ["NOTE", "STYLE", "REGION"].iter().any(|kw| block.starts_with(kw)) {
                continue;
            }
            let Some(timing) = block
                .lines()
                .take(2)
                .find(|line| memmem::find(line.as_bytes(), b"-->").is_some())
            else {
                return Err(DemuxError::malformed_sample(format!(
                    "cue block without timing line: `{}`",
                    block.lines().next().unwrap_or_default()
                )));
            };
            let (start, rest) = timing.split_once("-->").unwrap_or((timing, ""));
            let end = rest.split_whitespace().next().unwrap_or_default();
            let (Some(start), Some(end)) = (parse_cue_time(start), parse_cue_time(end)) else {
                return Err(DemuxError::malformed_sample(format!("invalid cue timing `{timing}`")));
            };
            if end < start {
                return Err(DemuxError::malformed_sample(format!("cue ends before it starts: `{timing}`")));
            }

            self.cues.push_back(ParsedSample {
                track_id: TRACK_ID,
                pts: start + offset,
                dts: start + offset,
                duration: (end - start) as u64,
                sync: true,
                discardable: false,
                payload: Bytes::from(block.to_string()),
                codec: None,
            });
        }
        Ok(())
    }
}

impl SampleParser for WebVttParser {
    fn parse_header(
        &mut self,
        _init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError> {
        let data = reader.read_to_end()?;
        self.parse_document(&data)?;
        Ok(vec![TrackInfo {
            id: TRACK_ID,
            stream_type: StreamType::Subtitle,
            timescale: TIMESCALE,
            codec: Arc::new(CodecConfiguration::new("wvtt")),
            timestamp_bits: None,
        }])
    }

    fn select_tracks(&mut self, ids: &[u64]) {
        self.enabled = ids.contains(&TRACK_ID);
    }

    fn next_sample(&mut self, _reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError> {
        if !self.enabled {
            return Ok(None);
        }
        Ok(self.cues.pop_front())
    }
}
