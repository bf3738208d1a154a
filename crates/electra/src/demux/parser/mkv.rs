//! Matroska / WebM cluster reader.
//!
//! `Segment` and `Cluster` are treated as transparent containers so both
//! known and unknown sizes stream through a single flat element loop.

use std::sync::Arc;

use bytes::Bytes;
use media_types::StreamType;
use tracing::{debug, trace};

use super::{ParsedSample, SampleParser, TrackInfo};
use crate::demux::reader::{MediaReader, SliceReader};
use crate::error::DemuxError;
use crate::unit::CodecConfiguration;

const EBML: u32 = 0x1A45_DFA3;
const DOC_TYPE: u32 = 0x4282;
const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TIMECODE_SCALE: u32 = 0x2A_D7B1;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const CODEC_PRIVATE: u32 = 0x63A2;
const DEFAULT_DURATION: u32 = 0x23_E383;
const VIDEO: u32 = 0xE0;
const PIXEL_WIDTH: u32 = 0xB0;
const PIXEL_HEIGHT: u32 = 0xBA;
const AUDIO: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;
const CLUSTER: u32 = 0x1F43_B675;
const TIMECODE: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;
const BLOCK_GROUP: u32 = 0xA0;
const BLOCK: u32 = 0xA1;
const BLOCK_DURATION: u32 = 0x9B;
const REFERENCE_BLOCK: u32 = 0xFB;

const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Element header: id (marker bits kept), body size, header length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElementHeader {
    id: u32,
    /// `None` for the reserved unknown-size value
    size: Option<u64>,
    header_len: usize,
}

fn vint_width(first: u8) -> Option<usize> {
    let width = first.leading_zeros() as usize + 1;
    (width <= 8).then_some(width)
}

/// Parses an element header; `Ok(None)` when `data` is too short to tell.
fn parse_element_header(data: &[u8]) -> Result<Option<ElementHeader>, DemuxError> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    let id_len = vint_width(first)
        .filter(|w| *w <= 4)
        .ok_or_else(|| DemuxError::malformed_sample(format!("invalid element id byte {first:#04x}")))?;
    let Some(id_bytes) = data.get(..id_len) else {
        return Ok(None);
    };
    let id = id_bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

    let Some(&size_first) = data.get(id_len) else {
        return Ok(None);
    };
    let size_len = vint_width(size_first)
        .ok_or_else(|| DemuxError::malformed_sample(format!("invalid size for element {id:#x}")))?;
    let Some(size_bytes) = data.get(id_len..id_len + size_len) else {
        return Ok(None);
    };
    let (value, all_ones) = vint_value(size_bytes);
    Ok(Some(ElementHeader {
        id,
        size: (!all_ones).then_some(value),
        header_len: id_len + size_len,
    }))
}

/// Value of a vint with its length marker removed, and whether all value
/// bits were set.
fn vint_value(bytes: &[u8]) -> (u64, bool) {
    let width = bytes.len();
    let mask = if width >= 8 { 0 } else { 0xFFu8 >> width };
    let mut value = u64::from(bytes[0] & mask);
    for b in &bytes[1..] {
        value = (value << 8) | u64::from(*b);
    }
    let max = (1u64 << (7 * width as u32)) - 1;
    (value, value == max)
}

/// Children of an in-memory master element.
fn elements(data: &[u8]) -> Result<Vec<(u32, &[u8])>, DemuxError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = parse_element_header(&data[offset..])?
            .ok_or_else(|| DemuxError::malformed_sample("truncated element header"))?;
        let start = offset + header.header_len;
        let end = match header.size {
            Some(size) => usize::try_from(size)
                .ok()
                .and_then(|size| start.checked_add(size))
                .filter(|end| *end <= data.len())
                .ok_or_else(|| DemuxError::malformed_sample(format!("element {:#x} overruns its parent", header.id)))?,
            None => data.len(),
        };
        out.push((header.id, &data[start..end]));
        offset = end;
    }
    Ok(out)
}

fn read_uint(data: &[u8]) -> Result<u64, DemuxError> {
    if data.len() > 8 {
        return Err(DemuxError::malformed_sample(format!("{}-byte unsigned integer", data.len())));
    }
    Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn read_float(data: &[u8]) -> Result<f64, DemuxError> {
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f64::from(f32::from_be_bytes([data[0], data[1], data[2], data[3]]))),
        8 => Ok(f64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ])),
        n => Err(DemuxError::malformed_sample(format!("{n}-byte float"))),
    }
}

fn codec_name(codec_id: &str) -> String {
    let name = match codec_id {
        "V_MPEG4/ISO/AVC" => "avc1",
        "V_MPEGH/ISO/HEVC" => "hvc1",
        "V_VP9" => "vp09",
        "V_VP8" => "vp08",
        "V_AV1" => "av01",
        "A_OPUS" => "Opus",
        "A_VORBIS" => "vorbis",
        "S_TEXT/WEBVTT" => "wvtt",
        id if id.starts_with("A_AAC") => "mp4a",
        id if id.starts_with("D_WEBVTT") => "wvtt",
        other => other,
    };
    name.to_string()
}

#[derive(Debug, Clone)]
struct MkvTrack {
    info: TrackInfo,
    /// Frame duration in nanoseconds, when declared
    default_duration: Option<u64>,
}

/// Matroska and WebM parser.
#[derive(Debug)]
pub struct MatroskaParser {
    tracks: Vec<MkvTrack>,
    timecode_scale: u64,
    selected: Option<Vec<u64>>,
    cluster_time: Option<i64>,
}

impl Default for MatroskaParser {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            selected: None,
            cluster_time: None,
        }
    }
}

impl MatroskaParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn timescale(&self) -> u32 {
        (NANOS_PER_SECOND / self.timecode_scale) as u32
    }

    fn peek_element(reader: &mut dyn MediaReader) -> Result<Option<ElementHeader>, DemuxError> {
        let head = reader.peek(12)?;
        if head.is_empty() {
            return Ok(None);
        }
        parse_element_header(&head)?
            .map(Some)
            .ok_or_else(|| DemuxError::malformed_sample("segment ends inside an element header"))
    }

    fn read_body(reader: &mut dyn MediaReader, header: &ElementHeader) -> Result<Bytes, DemuxError> {
        let size = header
            .size
            .ok_or_else(|| DemuxError::unsupported(format!("unknown size on element {:#x}", header.id)))?;
        reader.skip(header.header_len as u64)?;
        let size = usize::try_from(size)
            .map_err(|_| DemuxError::malformed_sample("element larger than the address space"))?;
        reader.read_required(size)
    }

    fn skip_element(reader: &mut dyn MediaReader, header: &ElementHeader) -> Result<(), DemuxError> {
        match header.size {
            Some(size) => reader.skip(header.header_len as u64 + size),
            None => Err(DemuxError::unsupported(format!(
                "unknown size on element {:#x}",
                header.id
            ))),
        }
    }

    fn check_doc_type(body: &[u8]) -> Result<(), DemuxError> {
        for (id, value) in elements(body)? {
            if id == DOC_TYPE {
                let doc_type = String::from_utf8_lossy(value);
                let doc_type = doc_type.trim_end_matches('\0');
                if doc_type != "matroska" && doc_type != "webm" {
                    return Err(DemuxError::unknown_container(format!("EBML document type `{doc_type}`")));
                }
            }
        }
        Ok(())
    }

    fn parse_info(&mut self, body: &[u8]) -> Result<(), DemuxError> {
        for (id, value) in elements(body)? {
            if id == TIMECODE_SCALE {
                let scale = read_uint(value)?;
                if scale == 0 || scale > NANOS_PER_SECOND {
                    return Err(DemuxError::malformed_header(format!("timecode scale {scale}")));
                }
                self.timecode_scale = scale;
            }
        }
        Ok(())
    }

    fn parse_track_entry(&self, body: &[u8]) -> Result<Option<MkvTrack>, DemuxError> {
        let mut number = None;
        let mut track_type = 0;
        let mut codec_id = String::new();
        let mut private = Bytes::new();
        let mut default_duration = None;
        let mut resolution = None;
        let mut audio = None;

        for (id, value) in elements(body)? {
            match id {
                TRACK_NUMBER => number = Some(read_uint(value)?),
                TRACK_TYPE => track_type = read_uint(value)?,
                CODEC_ID => codec_id = String::from_utf8_lossy(value).trim_end_matches('\0').to_string(),
                CODEC_PRIVATE => private = Bytes::copy_from_slice(value),
                DEFAULT_DURATION => default_duration = Some(read_uint(value)?),
                VIDEO => {
                    let (mut width, mut height) = (0, 0);
                    for (id, value) in elements(value)? {
                        match id {
                            PIXEL_WIDTH => width = read_uint(value)? as u32,
                            PIXEL_HEIGHT => height = read_uint(value)? as u32,
                            _ => {}
                        }
                    }
                    resolution = Some((width, height));
                }
                AUDIO => {
                    let (mut rate, mut channels) = (8_000.0, 1);
                    for (id, value) in elements(value)? {
                        match id {
                            SAMPLING_FREQUENCY => rate = read_float(value)?,
                            CHANNELS => channels = read_uint(value)? as u16,
                            _ => {}
                        }
                    }
                    audio = Some((rate.round() as u32, channels));
                }
                _ => {}
            }
        }

        let number = number.ok_or_else(|| DemuxError::malformed_header("track entry without a number"))?;
        let stream_type = match track_type {
            1 => StreamType::Video,
            2 => StreamType::Audio,
            17 => StreamType::Subtitle,
            other => {
                trace!(track = number, track_type = other, "Ignoring track of unhandled type");
                return Ok(None);
            }
        };

        let mut codec = CodecConfiguration::new(codec_name(&codec_id)).with_decoder_specific(private);
        if let Some((width, height)) = resolution {
            codec = codec.with_resolution(width, height);
        }
        if let Some((rate, channels)) = audio {
            codec = codec.with_audio(rate, channels);
        }
        Ok(Some(MkvTrack {
            info: TrackInfo {
                id: number,
                stream_type,
                timescale: self.timescale(),
                codec: Arc::new(codec),
                timestamp_bits: None,
            },
            default_duration,
        }))
    }

    fn parse_tracks(&mut self, body: &[u8]) -> Result<(), DemuxError> {
        let mut tracks = Vec::new();
        for (id, value) in elements(body)? {
            if id == TRACK_ENTRY
                && let Some(track) = self.parse_track_entry(value)?
            {
                tracks.push(track);
            }
        }
        self.tracks = tracks;
        Ok(())
    }

    /// Walks the document header up to the first cluster.
    fn read_document_header(&mut self, reader: &mut dyn MediaReader) -> Result<(), DemuxError> {
        let mut saw_ebml = false;
        while let Some(header) = Self::peek_element(reader)? {
            match header.id {
                EBML => {
                    let body = Self::read_body(reader, &header)?;
                    Self::check_doc_type(&body)?;
                    saw_ebml = true;
                }
                SEGMENT => reader.skip(header.header_len as u64)?,
                INFO => {
                    let body = Self::read_body(reader, &header)?;
                    self.parse_info(&body)?;
                }
                TRACKS => {
                    let body = Self::read_body(reader, &header)?;
                    self.parse_tracks(&body)?;
                }
                CLUSTER => break,
                _ => Self::skip_element(reader, &header)?,
            }
        }
        if !saw_ebml {
            return Err(DemuxError::malformed_header("missing EBML header"));
        }
        Ok(())
    }

    fn track(&self, number: u64) -> Option<&MkvTrack> {
        self.tracks.iter().find(|t| t.info.id == number)
    }

    /// Decodes a (Simple)Block body. Returns `None` for tracks that are not
    /// declared or not selected.
    fn parse_block(
        &self,
        block: Bytes,
        simple: bool,
        duration: Option<u64>,
        referenced: bool,
    ) -> Result<Option<ParsedSample>, DemuxError> {
        let first = *block
            .first()
            .ok_or_else(|| DemuxError::malformed_sample("empty block"))?;
        let width = vint_width(first)
            .filter(|w| *w <= 8)
            .ok_or_else(|| DemuxError::malformed_sample("invalid block track number"))?;
        if block.len() < width + 3 {
            return Err(DemuxError::malformed_sample("truncated block header"));
        }
        let (number, _) = vint_value(&block[..width]);
        let relative = i16::from_be_bytes([block[width], block[width + 1]]);
        let flags = block[width + 2];
        if (flags >> 1) & 0x3 != 0 {
            return Err(DemuxError::unsupported("laced blocks"));
        }

        let Some(track) = self.track(number) else {
            trace!(track = number, "Skipping block of undeclared track");
            return Ok(None);
        };
        if self.selected.as_ref().is_some_and(|ids| !ids.contains(&number)) {
            return Ok(None);
        }
        let cluster_time = self
            .cluster_time
            .ok_or_else(|| DemuxError::malformed_sample("block before cluster timecode"))?;

        let pts = cluster_time + i64::from(relative);
        let duration = duration
            .or_else(|| track.default_duration.map(|ns| ns / self.timecode_scale))
            .unwrap_or(0);
        let (sync, discardable) = if simple {
            (flags & 0x80 != 0, flags & 0x01 != 0)
        } else {
            (!referenced, false)
        };
        Ok(Some(ParsedSample {
            track_id: number,
            pts,
            dts: pts,
            duration,
            sync,
            discardable,
            payload: block.slice(width + 3..),
            codec: None,
        }))
    }

    fn parse_block_group(&self, body: &Bytes) -> Result<Option<ParsedSample>, DemuxError> {
        let mut block = None;
        let mut duration = None;
        let mut referenced = false;
        for (id, value) in elements(body)? {
            match id {
                BLOCK => block = Some(body.slice_ref(value)),
                BLOCK_DURATION => duration = Some(read_uint(value)?),
                REFERENCE_BLOCK => referenced = true,
                _ => {}
            }
        }
        match block {
            Some(block) => self.parse_block(block, false, duration, referenced),
            None => Err(DemuxError::malformed_sample("block group without a block")),
        }
    }
}

impl SampleParser for MatroskaParser {
    fn parse_header(
        &mut self,
        init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError> {
        match init {
            Some(init) => self.read_document_header(&mut SliceReader::new(init.clone()))?,
            None => self.read_document_header(reader)?,
        }
        if self.tracks.is_empty() {
            return Err(DemuxError::malformed_header("document declares no usable tracks"));
        }
        debug!(
            tracks = self.tracks.len(),
            timecode_scale = self.timecode_scale,
            "Parsed Matroska header"
        );
        Ok(self.tracks.iter().map(|t| t.info.clone()).collect())
    }

    fn select_tracks(&mut self, ids: &[u64]) {
        self.selected = Some(ids.to_vec());
    }

    fn next_sample(&mut self, reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError> {
        while let Some(header) = Self::peek_element(reader)? {
            match header.id {
                SEGMENT | CLUSTER => reader.skip(header.header_len as u64)?,
                TIMECODE => {
                    let body = Self::read_body(reader, &header)?;
                    self.cluster_time = Some(read_uint(&body)? as i64);
                }
                SIMPLE_BLOCK => {
                    let body = Self::read_body(reader, &header)?;
                    if let Some(sample) = self.parse_block(body, true, None, false)? {
                        return Ok(Some(sample));
                    }
                }
                BLOCK_GROUP => {
                    let body = Self::read_body(reader, &header)?;
                    if let Some(sample) = self.parse_block_group(&body)? {
                        return Ok(Some(sample));
                    }
                }
                _ => Self::skip_element(reader, &header)?,
            }
        }
        Ok(None)
    }
}

/// EBML writers for building WebM in tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn element(id: u32, body: &[u8]) -> Vec<u8> {
        let id_bytes = id.to_be_bytes();
        let skip = id_bytes.iter().take_while(|b| **b == 0).count();
        let mut out = id_bytes[skip..].to_vec();
        let len = body.len() as u64;
        if len < 0x7F {
            out.push(0x80 | len as u8);
        } else {
            out.push(0x01);
            out.extend_from_slice(&len.to_be_bytes()[1..]);
        }
        out.extend_from_slice(body);
        out
    }

    pub fn unknown_size(id: u32) -> Vec<u8> {
        let mut out = id.to_be_bytes().to_vec();
        out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        out
    }

    pub fn uint(id: u32, value: u64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
        element(id, &bytes[skip..])
    }

    pub fn simple_block(track: u8, relative: i16, keyframe: bool, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0x80 | track];
        body.extend_from_slice(&relative.to_be_bytes());
        body.push(if keyframe { 0x80 } else { 0x00 });
        body.extend_from_slice(payload);
        element(SIMPLE_BLOCK, &body)
    }

    /// EBML header, an unknown-size segment, info and one video and one
    /// audio track.
    pub fn header(doc_type: &str) -> Vec<u8> {
        let mut out = element(EBML, &element(DOC_TYPE, doc_type.as_bytes()));
        out.extend_from_slice(&unknown_size(SEGMENT));
        out.extend_from_slice(&element(INFO, &uint(TIMECODE_SCALE, 1_000_000)));

        let mut video = uint(TRACK_NUMBER, 1);
        video.extend_from_slice(&uint(TRACK_TYPE, 1));
        video.extend_from_slice(&element(CODEC_ID, b"V_VP9"));
        video.extend_from_slice(&uint(DEFAULT_DURATION, 40_000_000));
        let mut dims = uint(PIXEL_WIDTH, 640);
        dims.extend_from_slice(&uint(PIXEL_HEIGHT, 360));
        video.extend_from_slice(&element(VIDEO, &dims));

        let mut audio = uint(TRACK_NUMBER, 2);
        audio.extend_from_slice(&uint(TRACK_TYPE, 2));
        audio.extend_from_slice(&element(CODEC_ID, b"A_OPUS"));
        audio.extend_from_slice(&element(CODEC_PRIVATE, b"OpusHead"));
        let mut params = element(SAMPLING_FREQUENCY, &48_000f32.to_be_bytes());
        params.extend_from_slice(&uint(CHANNELS, 2));
        audio.extend_from_slice(&element(AUDIO, &params));

        let mut tracks = element(TRACK_ENTRY, &video);
        tracks.extend_from_slice(&element(TRACK_ENTRY, &audio));
        out.extend_from_slice(&element(TRACKS, &tracks));
        out
    }

    pub fn cluster(timecode: u64, blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = unknown_size(CLUSTER);
        out.extend_from_slice(&uint(TIMECODE, timecode));
        for block in blocks {
            out.extend_from_slice(block);
        }
        out
    }
}
