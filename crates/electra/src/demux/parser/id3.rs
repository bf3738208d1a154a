use std::sync::Arc;

use bytes::Bytes;
use media_types::StreamType;

use super::adts::AdtsHeader;
use super::{ParsedSample, SampleParser, TrackInfo};
use crate::demux::probe::id3_tag_len;
use crate::demux::reader::MediaReader;
use crate::demux::timestamp::MPEG_TIMESTAMP_BITS;
use crate::error::DemuxError;

const TIMESTAMP_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp";
const MPEG_TIMESCALE: u32 = 90_000;
const TRACK_ID: u64 = 1;

/// Reads the 33-bit MPEG-2 timestamp from an ID3v2 tag's `PRIV` frame.
pub(crate) fn transport_stream_timestamp(tag: &[u8]) -> Option<u64> {
    let tag_len = id3_tag_len(tag)?.min(tag.len());
    let version = tag[3];
    let mut offset = 10;
    if tag[5] & 0x40 != 0 {
        let size = read_u32(tag, offset)? as usize;
        offset += if version >= 4 { syncsafe(size) } else { size + 4 };
    }

    while offset + 10 <= tag_len {
        let id = &tag[offset..offset + 4];
        if id[0] == 0 {
            break; // padding
        }
        let raw_size = read_u32(tag, offset + 4)? as usize;
        let size = if version >= 4 { syncsafe(raw_size) } else { raw_size };
        let body_start = offset + 10;
        let body_end = body_start.checked_add(size)?.min(tag_len);
        if id == b"PRIV" {
            let body = &tag[body_start..body_end];
            if let Some(nul) = memchr::memchr(0, body)
                && &body[..nul] == TIMESTAMP_OWNER
                && body.len() >= nul + 9
            {
                let raw = u64::from_be_bytes(body[nul + 1..nul + 9].try_into().ok()?);
                return Some(raw & 0x1_FFFF_FFFF);
            }
        }
        offset = body_end;
    }
    None
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn syncsafe(value: usize) -> usize {
    ((value >> 24) & 0x7F) << 21 | ((value >> 16) & 0x7F) << 14 | ((value >> 8) & 0x7F) << 7 | (value & 0x7F)
}

/// Raw AAC audio in ADTS frames, optionally preceded by ID3 tags.
///
/// The timeline is the tag's transport-stream timestamp (0 without one)
/// plus 1024 samples per frame, on a 90 kHz clock.
#[derive(Debug, Default)]
pub struct Id3AdtsParser {
    base: i64,
    samples: u64,
    sample_rate: u32,
    enabled: bool,
}

impl Id3AdtsParser {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    fn read_tag(&mut self, reader: &mut dyn MediaReader) -> Result<(), DemuxError> {
        let head = reader.peek(10)?;
        let Some(tag_len) = id3_tag_len(&head) else {
            return Err(DemuxError::malformed_header("truncated ID3 tag"));
        };
        let tag = reader.read_required(tag_len)?;
        if let Some(timestamp) = transport_stream_timestamp(&tag) {
            self.base = timestamp as i64;
            self.samples = 0;
        }
        Ok(())
    }

    fn ticks_at(&self, samples: u64) -> i64 {
        let rate = u64::from(self.sample_rate.max(1));
        self.base + (u128::from(samples) * u128::from(MPEG_TIMESCALE) / u128::from(rate)) as i64
    }
}

impl SampleParser for Id3AdtsParser {
    fn parse_header(
        &mut self,
        _init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError> {
        while reader.peek(3)?.starts_with(b"ID3") {
            self.read_tag(reader)?;
        }
        let head = reader.peek(AdtsHeader::MIN_LEN)?;
        if head.len() < AdtsHeader::MIN_LEN {
            return Err(DemuxError::malformed_header("no ADTS frame after ID3 tag"));
        }
        let header = AdtsHeader::parse(&head)?;
        self.sample_rate = header.sample_rate;
        Ok(vec![TrackInfo {
            id: TRACK_ID,
            stream_type: StreamType::Audio,
            timescale: MPEG_TIMESCALE,
            codec: Arc::new(header.codec_config()),
            timestamp_bits: Some(MPEG_TIMESTAMP_BITS),
        }])
    }

    fn select_tracks(&mut self, ids: &[u64]) {
        self.enabled = ids.contains(&TRACK_ID);
    }

    fn next_sample(&mut self, reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError> {
        if !self.enabled {
            return Ok(None);
        }
        loop {
            let head = reader.peek(AdtsHeader::MIN_LEN)?;
            if head.is_empty() {
                return Ok(None);
            }
            if head.starts_with(b"ID3") {
                self.read_tag(reader)?;
                continue;
            }
            let header = AdtsHeader::parse(&head)?;
            let frame = reader.read_required(header.frame_length)?;
            self.sample_rate = header.sample_rate;

            let pts = self.ticks_at(self.samples);
            self.samples += header.samples();
            let end = self.ticks_at(self.samples);
            return Ok(Some(ParsedSample {
                track_id: TRACK_ID,
                pts,
                dts: pts,
                duration: (end - pts) as u64,
                sync: true,
                discardable: false,
                payload: frame.slice(header.header_length..),
                codec: None,
            }));
        }
    }
}

/// ID3v2.4 tag holding a single timestamp `PRIV` frame.
#[cfg(test)]
pub(crate) fn build_timestamp_tag(timestamp: u64) -> Vec<u8> {
    let mut body = TIMESTAMP_OWNER.to_vec();
    body.push(0);
    body.extend_from_slice(&timestamp.to_be_bytes());

    let mut frame = b"PRIV".to_vec();
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&body);

    let mut tag = b"ID3\x04\x00\x00".to_vec();
    let size = frame.len();
    tag.extend_from_slice(&[
        ((size >> 21) & 0x7F) as u8,
        ((size >> 14) & 0x7F) as u8,
        ((size >> 7) & 0x7F) as u8,
        (size & 0x7F) as u8,
    ]);
    tag.extend_from_slice(&frame);
    tag
}
