//! Fragmented ISOBMFF (`moov` + `moof`/`mdat`) sample extraction.
//!
//! Sample payloads are read straight out of `mdat` in file order, so a
//! segment can be consumed while it is still downloading.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use media_types::StreamType;
use tracing::trace;

use super::{ParsedSample, SampleParser, TrackInfo};
use crate::demux::reader::MediaReader;
use crate::error::DemuxError;
use crate::unit::CodecConfiguration;

const TFHD_BASE_DATA_OFFSET: u32 = 0x00_0001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
const TFHD_DEFAULT_DURATION: u32 = 0x00_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x00_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x00_0020;

const TRUN_DATA_OFFSET: u32 = 0x00_0001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
const TRUN_SAMPLE_DURATION: u32 = 0x00_0100;
const TRUN_SAMPLE_SIZE: u32 = 0x00_0200;
const TRUN_SAMPLE_FLAGS: u32 = 0x00_0400;
const TRUN_SAMPLE_CTO: u32 = 0x00_0800;

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// Upper bound on samples in one `trun`.
const MAX_TRUN_SAMPLES: u32 = 1 << 20;

/// Box header as found in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoxHeader {
    fourcc: [u8; 4],
    header_len: usize,
    /// Total box size; `None` when the box extends to the end of the data
    size: Option<u64>,
}

impl BoxHeader {
    fn parse(data: &[u8]) -> Result<Self, DemuxError> {
        if data.len() < 8 {
            return Err(DemuxError::malformed_sample(format!(
                "{} trailing bytes are too short for a box header",
                data.len()
            )));
        }
        let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let fourcc = [data[4], data[5], data[6], data[7]];
        let (size, header_len) = match size32 {
            0 => (None, 8),
            1 => {
                let ext = data
                    .get(8..16)
                    .ok_or_else(|| DemuxError::malformed_sample("truncated 64-bit box size"))?;
                let size = u64::from_be_bytes([
                    ext[0], ext[1], ext[2], ext[3], ext[4], ext[5], ext[6], ext[7],
                ]);
                (Some(size), 16)
            }
            n => (Some(u64::from(n)), 8),
        };
        if let Some(size) = size
            && size < header_len as u64
        {
            return Err(DemuxError::malformed_sample(format!(
                "box `{}` declares size {size} below its header",
                fourcc_str(&fourcc)
            )));
        }
        Ok(Self {
            fourcc,
            header_len,
            size,
        })
    }
}

fn fourcc_str(fourcc: &[u8; 4]) -> String {
    String::from_utf8_lossy(fourcc).into_owned()
}

/// Child boxes of an in-memory container body.
fn children(data: &[u8]) -> Result<Vec<([u8; 4], &[u8])>, DemuxError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let header = BoxHeader::parse(&data[offset..])?;
        let end = match header.size {
            Some(size) => usize::try_from(size)
                .ok()
                .and_then(|size| offset.checked_add(size))
                .filter(|end| *end <= data.len())
                .ok_or_else(|| {
                    DemuxError::malformed_sample(format!(
                        "box `{}` overruns its parent",
                        fourcc_str(&header.fourcc)
                    ))
                })?,
            None => data.len(),
        };
        out.push((header.fourcc, &data[offset + header.header_len..end]));
        offset = end;
    }
    Ok(out)
}

fn find_child<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> Result<Option<&'a [u8]>, DemuxError> {
    Ok(children(data)?
        .into_iter()
        .find(|(f, _)| f == fourcc)
        .map(|(_, body)| body))
}

fn require_child<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> Result<&'a [u8], DemuxError> {
    find_child(data, fourcc)?.ok_or_else(|| {
        DemuxError::malformed_header(format!("missing `{}` box", fourcc_str(fourcc)))
    })
}

/// Version and 24-bit flags of a full box.
fn full_box_header(cursor: &mut Cursor<&[u8]>) -> Result<(u8, u32), DemuxError> {
    let version = cursor.read_u8()?;
    let flags = cursor.read_u24::<BigEndian>()?;
    Ok((version, flags))
}

// --- Initialization (moov) ---

#[derive(Debug, Clone, Copy, Default)]
struct TrackDefaults {
    duration: u32,
    size: Option<u32>,
    flags: Option<u32>,
}

#[derive(Debug, Clone)]
struct Mp4Track {
    info: TrackInfo,
    defaults: TrackDefaults,
    /// Decode time following the last parsed sample, for fragments without `tfdt`
    next_dts: i64,
}

fn parse_moov(moov: &[u8]) -> Result<Vec<Mp4Track>, DemuxError> {
    let mut tracks = Vec::new();
    for (fourcc, body) in children(moov)? {
        if &fourcc == b"trak"
            && let Some(info) = parse_trak(body)?
        {
            tracks.push(Mp4Track {
                info,
                defaults: TrackDefaults::default(),
                next_dts: 0,
            });
        }
    }

    if let Some(mvex) = find_child(moov, b"mvex")? {
        for (fourcc, trex) in children(mvex)? {
            if &fourcc != b"trex" {
                continue;
            }
            let mut c = Cursor::new(trex);
            full_box_header(&mut c)?;
            let track_id = u64::from(c.read_u32::<BigEndian>()?);
            let _description_index = c.read_u32::<BigEndian>()?;
            let duration = c.read_u32::<BigEndian>()?;
            let size = c.read_u32::<BigEndian>()?;
            let flags = c.read_u32::<BigEndian>()?;
            if let Some(track) = tracks.iter_mut().find(|t| t.info.id == track_id) {
                track.defaults = TrackDefaults {
                    duration,
                    size: (size > 0).then_some(size),
                    flags: Some(flags),
                };
            }
        }
    }
    Ok(tracks)
}

fn parse_trak(trak: &[u8]) -> Result<Option<TrackInfo>, DemuxError> {
    let tkhd = require_child(trak, b"tkhd")?;
    let mut c = Cursor::new(tkhd);
    let (version, _) = full_box_header(&mut c)?;
    c.set_position(if version == 1 { 20 } else { 12 });
    let id = u64::from(c.read_u32::<BigEndian>()?);

    let mdia = require_child(trak, b"mdia")?;
    let mdhd = require_child(mdia, b"mdhd")?;
    let mut c = Cursor::new(mdhd);
    let (version, _) = full_box_header(&mut c)?;
    c.set_position(if version == 1 { 20 } else { 12 });
    let timescale = c.read_u32::<BigEndian>()?;
    if timescale == 0 {
        return Err(DemuxError::malformed_header(format!("track {id} has a zero timescale")));
    }

    let hdlr = require_child(mdia, b"hdlr")?;
    let stream_type = match hdlr.get(8..12) {
        Some(b"vide") => StreamType::Video,
        Some(b"soun") => StreamType::Audio,
        Some(b"subt" | b"text" | b"sbtl") => StreamType::Subtitle,
        other => {
            trace!(track_id = id, handler = ?other, "Ignoring track with unhandled handler type");
            return Ok(None);
        }
    };

    let minf = require_child(mdia, b"minf")?;
    let stbl = require_child(minf, b"stbl")?;
    let stsd = require_child(stbl, b"stsd")?;
    let entries = stsd
        .get(8..)
        .ok_or_else(|| DemuxError::malformed_header("truncated `stsd` box"))?;
    let Some((fourcc, entry)) = children(entries)?.into_iter().next() else {
        return Err(DemuxError::malformed_header(format!("track {id} has no sample entry")));
    };

    Ok(Some(TrackInfo {
        id,
        stream_type,
        timescale,
        codec: Arc::new(parse_sample_entry(stream_type, fourcc, entry)?),
        timestamp_bits: None,
    }))
}

fn parse_sample_entry(
    stream_type: StreamType,
    fourcc: [u8; 4],
    entry: &[u8],
) -> Result<CodecConfiguration, DemuxError> {
    let mut config = CodecConfiguration::new(fourcc_str(&fourcc));
    let truncated = || DemuxError::malformed_header(format!("truncated `{}` sample entry", fourcc_str(&fourcc)));
    match stream_type {
        StreamType::Video => {
            let mut c = Cursor::new(entry);
            c.set_position(24);
            let width = c.read_u16::<BigEndian>()?;
            let height = c.read_u16::<BigEndian>()?;
            config = config.with_resolution(u32::from(width), u32::from(height));
            let boxes = entry.get(78..).ok_or_else(truncated)?;
            if let Some((_, record)) = children(boxes)?
                .into_iter()
                .find(|(f, _)| matches!(f, b"avcC" | b"hvcC" | b"vpcC" | b"av1C"))
            {
                config = config.with_decoder_specific(Bytes::copy_from_slice(record));
            }
        }
        StreamType::Audio => {
            let mut c = Cursor::new(entry);
            c.set_position(16);
            let channels = c.read_u16::<BigEndian>()?;
            c.set_position(24);
            let sample_rate = c.read_u32::<BigEndian>()? >> 16;
            config = config.with_audio(sample_rate, channels);
            let boxes = entry.get(28..).ok_or_else(truncated)?;
            for (child, body) in children(boxes)? {
                match &child {
                    b"esds" => {
                        if let Some(asc) = esds_decoder_specific(body) {
                            config = config.with_decoder_specific(asc);
                        }
                    }
                    b"dOps" => config = config.with_decoder_specific(Bytes::copy_from_slice(body)),
                    _ => {}
                }
            }
        }
        StreamType::Subtitle => {}
    }
    Ok(config)
}

/// Tag and payload length of an MPEG-4 descriptor, plus its header length.
fn descriptor_header(data: &[u8]) -> Option<(u8, usize, usize)> {
    let tag = *data.first()?;
    let mut len = 0usize;
    for i in 1..5 {
        let byte = *data.get(i)?;
        len = (len << 7) | usize::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some((tag, len, i + 1));
        }
    }
    None
}

/// DecoderSpecificInfo inside an `esds` ES_Descriptor.
fn esds_decoder_specific(body: &[u8]) -> Option<Bytes> {
    let mut pos = 4;
    let (tag, _, header) = descriptor_header(body.get(pos..)?)?;
    if tag != 0x03 {
        return None;
    }
    pos += header + 2;
    let flags = *body.get(pos)?;
    pos += 1;
    if flags & 0x80 != 0 {
        pos += 2;
    }
    if flags & 0x40 != 0 {
        pos += 1 + usize::from(*body.get(pos)?);
    }
    if flags & 0x20 != 0 {
        pos += 2;
    }

    let (tag, _, header) = descriptor_header(body.get(pos..)?)?;
    if tag != 0x04 {
        return None;
    }
    pos += header + 13;

    let (tag, len, header) = descriptor_header(body.get(pos..)?)?;
    if tag != 0x05 {
        return None;
    }
    pos += header;
    Some(Bytes::copy_from_slice(body.get(pos..pos + len)?))
}

// --- Fragments (moof) ---

#[derive(Debug, Clone, Copy)]
struct Tfhd {
    track_id: u64,
    base_data_offset: u64,
    default_duration: Option<u32>,
    default_size: Option<u32>,
    default_flags: Option<u32>,
}

impl Tfhd {
    fn parse(body: &[u8], moof_start: u64) -> Result<Self, DemuxError> {
        let mut c = Cursor::new(body);
        let (_, flags) = full_box_header(&mut c)?;
        let track_id = u64::from(c.read_u32::<BigEndian>()?);
        let base_data_offset = if flags & TFHD_BASE_DATA_OFFSET != 0 {
            c.read_u64::<BigEndian>()?
        } else {
            moof_start
        };
        if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            c.read_u32::<BigEndian>()?;
        }
        let mut optional = |flag: u32| -> Result<Option<u32>, DemuxError> {
            Ok(if flags & flag != 0 {
                Some(c.read_u32::<BigEndian>()?)
            } else {
                None
            })
        };
        Ok(Self {
            track_id,
            base_data_offset,
            default_duration: optional(TFHD_DEFAULT_DURATION)?,
            default_size: optional(TFHD_DEFAULT_SIZE)?,
            default_flags: optional(TFHD_DEFAULT_FLAGS)?,
        })
    }
}

fn parse_tfdt(body: &[u8]) -> Result<i64, DemuxError> {
    let mut c = Cursor::new(body);
    let (version, _) = full_box_header(&mut c)?;
    let time = if version == 1 {
        c.read_u64::<BigEndian>()?
    } else {
        u64::from(c.read_u32::<BigEndian>()?)
    };
    i64::try_from(time).map_err(|_| DemuxError::malformed_sample("tfdt decode time overflows"))
}

/// A sample located by a `trun` but not yet read from `mdat`.
#[derive(Debug, Clone, Copy)]
struct PendingSample {
    track_id: u64,
    offset: u64,
    size: u32,
    dts: i64,
    cto: i64,
    duration: u32,
    flags: Option<u32>,
}

impl PendingSample {
    fn into_parsed(self, payload: Bytes) -> ParsedSample {
        let sync = self.flags.is_none_or(|f| f & SAMPLE_IS_NON_SYNC == 0);
        let discardable = self.flags.is_some_and(|f| (f >> 22) & 0x3 == 2);
        ParsedSample {
            track_id: self.track_id,
            pts: self.dts + self.cto,
            dts: self.dts,
            duration: u64::from(self.duration),
            sync,
            discardable,
            payload,
            codec: None,
        }
    }
}

struct TrunContext<'a> {
    tfhd: &'a Tfhd,
    defaults: &'a TrackDefaults,
    dts: i64,
    data_offset: u64,
}

fn parse_trun(body: &[u8], ctx: &mut TrunContext<'_>, out: &mut Vec<PendingSample>) -> Result<(), DemuxError> {
    let mut c = Cursor::new(body);
    let (version, flags) = full_box_header(&mut c)?;
    let count = c.read_u32::<BigEndian>()?;
    if count > MAX_TRUN_SAMPLES {
        return Err(DemuxError::malformed_sample(format!("trun declares {count} samples")));
    }
    if flags & TRUN_DATA_OFFSET != 0 {
        let relative = i64::from(c.read_i32::<BigEndian>()?);
        ctx.data_offset = u64::try_from(ctx.tfhd.base_data_offset as i64 + relative)
            .map_err(|_| DemuxError::malformed_sample("trun data offset points before the segment"))?;
    }
    let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(c.read_u32::<BigEndian>()?)
    } else {
        None
    };

    for index in 0..count {
        let duration = if flags & TRUN_SAMPLE_DURATION != 0 {
            c.read_u32::<BigEndian>()?
        } else {
            ctx.tfhd.default_duration.unwrap_or(ctx.defaults.duration)
        };
        let size = if flags & TRUN_SAMPLE_SIZE != 0 {
            c.read_u32::<BigEndian>()?
        } else {
            ctx.tfhd
                .default_size
                .or(ctx.defaults.size)
                .ok_or_else(|| DemuxError::malformed_sample("sample without size and no default size"))?
        };
        let sample_flags = if flags & TRUN_SAMPLE_FLAGS != 0 {
            Some(c.read_u32::<BigEndian>()?)
        } else if index == 0 && first_flags.is_some() {
            first_flags
        } else {
            ctx.tfhd.default_flags.or(ctx.defaults.flags)
        };
        let cto = if flags & TRUN_SAMPLE_CTO != 0 {
            if version == 0 {
                i64::from(c.read_u32::<BigEndian>()?)
            } else {
                i64::from(c.read_i32::<BigEndian>()?)
            }
        } else {
            0
        };

        out.push(PendingSample {
            track_id: ctx.tfhd.track_id,
            offset: ctx.data_offset,
            size,
            dts: ctx.dts,
            cto,
            duration,
            flags: sample_flags,
        });
        ctx.dts += i64::from(duration);
        ctx.data_offset += u64::from(size);
    }
    Ok(())
}

// --- Parser ---

/// Fragmented MP4 parser. Tracks come from the init segment or from a
/// `moov` at the start of a self-initializing segment.
#[derive(Debug, Default)]
pub struct Mp4Parser {
    tracks: Vec<Mp4Track>,
    selected: Option<Vec<u64>>,
    pending: VecDeque<PendingSample>,
    /// End offset of the `mdat` being read; `u64::MAX` when it runs to the end
    mdat_end: Option<u64>,
}

impl Mp4Parser {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_selected(&self, track_id: u64) -> bool {
        self.selected.as_ref().is_none_or(|ids| ids.contains(&track_id))
    }

    fn next_box(reader: &mut dyn MediaReader) -> Result<Option<BoxHeader>, DemuxError> {
        let head = reader.peek(16)?;
        if head.is_empty() {
            return Ok(None);
        }
        BoxHeader::parse(&head).map(Some)
    }

    fn read_box(reader: &mut dyn MediaReader, header: &BoxHeader) -> Result<Bytes, DemuxError> {
        let data = match header.size {
            Some(size) => {
                let size = usize::try_from(size)
                    .map_err(|_| DemuxError::malformed_sample("box larger than the address space"))?;
                reader.read_required(size)?
            }
            None => reader.read_to_end()?,
        };
        Ok(data.slice(header.header_len.min(data.len())..))
    }

    fn skip_box(reader: &mut dyn MediaReader, header: &BoxHeader) -> Result<(), DemuxError> {
        match header.size {
            Some(size) => reader.skip(size),
            None => reader.read_to_end().map(drop),
        }
    }

    fn set_tracks(&mut self, moov: &[u8]) -> Result<Vec<TrackInfo>, DemuxError> {
        self.tracks = parse_moov(moov).map_err(|e| match e {
            DemuxError::Format { reason, .. } => DemuxError::malformed_header(format!("moov: {reason}")),
            other => other,
        })?;
        if self.tracks.is_empty() {
            return Err(DemuxError::malformed_header("moov declares no usable tracks"));
        }
        Ok(self.tracks.iter().map(|t| t.info.clone()).collect())
    }

    fn parse_moof(&mut self, moof: &[u8], moof_start: u64) -> Result<(), DemuxError> {
        let mut samples = Vec::new();
        for (fourcc, traf) in children(moof)? {
            if &fourcc != b"traf" {
                continue;
            }
            let tfhd = find_child(traf, b"tfhd")?
                .ok_or_else(|| DemuxError::malformed_sample("traf without tfhd"))?;
            let tfhd = Tfhd::parse(tfhd, moof_start)?;
            let Some(track) = self.tracks.iter_mut().find(|t| t.info.id == tfhd.track_id) else {
                trace!(track_id = tfhd.track_id, "Skipping fragment of undeclared track");
                continue;
            };
            let dts = match find_child(traf, b"tfdt")? {
                Some(tfdt) => parse_tfdt(tfdt)?,
                None => track.next_dts,
            };
            let mut ctx = TrunContext {
                tfhd: &tfhd,
                defaults: &track.defaults,
                dts,
                data_offset: tfhd.base_data_offset,
            };
            for (fourcc, trun) in children(traf)? {
                if &fourcc == b"trun" {
                    parse_trun(trun, &mut ctx, &mut samples)?;
                }
            }
            track.next_dts = ctx.dts;
        }
        samples.sort_by_key(|s| s.offset);
        self.pending.extend(samples);
        Ok(())
    }
}

impl SampleParser for Mp4Parser {
    fn parse_header(
        &mut self,
        init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError> {
        if let Some(init) = init {
            let moov = find_child(init, b"moov")?
                .ok_or_else(|| DemuxError::malformed_header("init segment has no moov"))?;
            return self.set_tracks(moov);
        }

        // Self-initializing: moov precedes the first fragment.
        while let Some(header) = Self::next_box(reader)? {
            match &header.fourcc {
                b"moov" => {
                    let moov = Self::read_box(reader, &header)?;
                    return self.set_tracks(&moov);
                }
                b"moof" | b"mdat" => break,
                _ => Self::skip_box(reader, &header)?,
            }
        }
        Err(DemuxError::malformed_header("no moov before the first fragment"))
    }

    fn select_tracks(&mut self, ids: &[u64]) {
        self.selected = Some(ids.to_vec());
    }

    fn next_sample(&mut self, reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError> {
        loop {
            if let Some(end) = self.mdat_end {
                if let Some(sample) = self.pending.front().copied()
                    && sample.offset < end
                {
                    if sample.offset.saturating_add(u64::from(sample.size)) > end {
                        return Err(DemuxError::malformed_sample(format!(
                            "sample at offset {} crosses the end of mdat",
                            sample.offset
                        )));
                    }
                    self.pending.pop_front();
                    let position = reader.position();
                    if sample.offset < position {
                        return Err(DemuxError::malformed_sample(format!(
                            "sample at offset {} overlaps data already read at {position}",
                            sample.offset
                        )));
                    }
                    reader.skip(sample.offset - position)?;
                    if !self.is_selected(sample.track_id) {
                        reader.skip(u64::from(sample.size))?;
                        continue;
                    }
                    let payload = reader.read_required(sample.size as usize)?;
                    return Ok(Some(sample.into_parsed(payload)));
                }

                if end == u64::MAX {
                    reader.read_to_end()?;
                } else {
                    reader.skip(end.saturating_sub(reader.position()))?;
                }
                self.mdat_end = None;
                continue;
            }

            let Some(header) = Self::next_box(reader)? else {
                if !self.pending.is_empty() {
                    return Err(DemuxError::malformed_sample(format!(
                        "{} samples reference data past the end of the segment",
                        self.pending.len()
                    )));
                }
                return Ok(None);
            };
            let start = reader.position();
            match &header.fourcc {
                b"moof" => {
                    let moof = Self::read_box(reader, &header)?;
                    self.parse_moof(&moof, start)?;
                }
                b"mdat" => {
                    reader.skip(header.header_len as u64)?;
                    self.mdat_end = Some(header.size.map_or(u64::MAX, |size| start + size));
                }
                _ => Self::skip_box(reader, &header)?,
            }
        }
    }
}

/// Box writers for building fragmented MP4 in tests.
#[cfg(test)]
pub(crate) mod fixtures {
    pub fn mp4_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    pub fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
        let mut content = vec![version];
        content.extend_from_slice(&flags.to_be_bytes()[1..]);
        content.extend_from_slice(body);
        mp4_box(fourcc, &content)
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FixtureTrack {
        pub id: u32,
        pub handler: &'static [u8; 4],
        pub timescale: u32,
    }

    fn sample_entry(track: &FixtureTrack) -> Vec<u8> {
        let mut entry = vec![0u8; 6];
        entry.extend_from_slice(&1u16.to_be_bytes());
        match track.handler {
            b"vide" => {
                entry.extend_from_slice(&[0u8; 16]);
                entry.extend_from_slice(&1280u16.to_be_bytes());
                entry.extend_from_slice(&720u16.to_be_bytes());
                entry.extend_from_slice(&[0u8; 50]);
                entry.extend_from_slice(&mp4_box(b"avcC", &[0x01, 0x64, 0x00, 0x1F]));
                mp4_box(b"avc1", &entry)
            }
            b"soun" => {
                entry.extend_from_slice(&[0u8; 8]);
                entry.extend_from_slice(&2u16.to_be_bytes());
                entry.extend_from_slice(&16u16.to_be_bytes());
                entry.extend_from_slice(&[0u8; 4]);
                entry.extend_from_slice(&(48_000u32 << 16).to_be_bytes());
                let esds = [
                    0x03, 0x19, 0x00, 0x01, 0x00, // ES_Descriptor
                    0x04, 0x11, 0x40, 0x15, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // DecoderConfig
                    0x05, 0x02, 0x11, 0x90, // AudioSpecificConfig
                    0x06, 0x01, 0x02,
                ];
                entry.extend_from_slice(&full_box(b"esds", 0, 0, &esds));
                mp4_box(b"mp4a", &entry)
            }
            _ => mp4_box(b"wvtt", &entry),
        }
    }

    fn trak(track: &FixtureTrack) -> Vec<u8> {
        let mut tkhd = vec![0u8; 8];
        tkhd.extend_from_slice(&track.id.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 68]);

        let mut mdhd = vec![0u8; 8];
        mdhd.extend_from_slice(&track.timescale.to_be_bytes());
        mdhd.extend_from_slice(&[0u8; 8]);

        let mut hdlr = vec![0u8; 4];
        hdlr.extend_from_slice(track.handler);
        hdlr.extend_from_slice(&[0u8; 13]);

        let mut stsd = 1u32.to_be_bytes().to_vec();
        stsd.extend_from_slice(&sample_entry(track));
        let stbl = mp4_box(b"stbl", &full_box(b"stsd", 0, 0, &stsd));
        let minf = mp4_box(b"minf", &stbl);

        let mut mdia = full_box(b"mdhd", 0, 0, &mdhd);
        mdia.extend_from_slice(&full_box(b"hdlr", 0, 0, &hdlr));
        mdia.extend_from_slice(&minf);

        let mut body = full_box(b"tkhd", 0, 7, &tkhd);
        body.extend_from_slice(&mp4_box(b"mdia", &mdia));
        mp4_box(b"trak", &body)
    }

    pub fn init_segment(tracks: &[FixtureTrack]) -> Vec<u8> {
        let mut moov = Vec::new();
        let mut mvex = Vec::new();
        for track in tracks {
            moov.extend_from_slice(&trak(track));
            let mut trex = track.id.to_be_bytes().to_vec();
            trex.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            mvex.extend_from_slice(&full_box(b"trex", 0, 0, &trex));
        }
        moov.extend_from_slice(&mp4_box(b"mvex", &mvex));

        let mut out = mp4_box(b"ftyp", b"iso6\0\0\0\0");
        out.extend_from_slice(&mp4_box(b"moov", &moov));
        out
    }

    #[derive(Debug, Clone)]
    pub struct FixtureSample {
        pub duration: u32,
        pub payload: Vec<u8>,
        pub sync: bool,
        pub cto: i32,
    }

    impl FixtureSample {
        pub fn new(duration: u32, payload: &[u8], sync: bool) -> Self {
            Self {
                duration,
                payload: payload.to_vec(),
                sync,
                cto: 0,
            }
        }

        pub fn with_cto(mut self, cto: i32) -> Self {
            self.cto = cto;
            self
        }
    }

    #[derive(Debug, Clone)]
    pub struct FixtureRun {
        pub track_id: u32,
        pub base_dts: u64,
        pub samples: Vec<FixtureSample>,
    }

    fn moof(runs: &[FixtureRun], mdat_payload_start: usize) -> Vec<u8> {
        let mut trafs = Vec::new();
        let mut data_offset = mdat_payload_start;
        for run in runs {
            let tfhd = full_box(b"tfhd", 0, 0x02_0000, &run.track_id.to_be_bytes());
            let tfdt = full_box(b"tfdt", 1, 0, &run.base_dts.to_be_bytes());

            let mut trun = (run.samples.len() as u32).to_be_bytes().to_vec();
            trun.extend_from_slice(&(data_offset as i32).to_be_bytes());
            for sample in &run.samples {
                let flags: u32 = if sample.sync { 0x0200_0000 } else { 0x0181_0000 };
                trun.extend_from_slice(&sample.duration.to_be_bytes());
                trun.extend_from_slice(&(sample.payload.len() as u32).to_be_bytes());
                trun.extend_from_slice(&flags.to_be_bytes());
                trun.extend_from_slice(&sample.cto.to_be_bytes());
                data_offset += sample.payload.len();
            }
            let trun = full_box(b"trun", 1, 0x0F01, &trun);

            let mut traf = tfhd;
            traf.extend_from_slice(&tfdt);
            traf.extend_from_slice(&trun);
            trafs.extend_from_slice(&mp4_box(b"traf", &traf));
        }
        let mut body = full_box(b"mfhd", 0, 0, &1u32.to_be_bytes());
        body.extend_from_slice(&trafs);
        mp4_box(b"moof", &body)
    }

    /// One `moof` with a `traf` per run, followed by a single `mdat`.
    pub fn media_segment(runs: &[FixtureRun]) -> Vec<u8> {
        let moof_len = moof(runs, 0).len();
        let mut out = mp4_box(b"styp", b"msdh\0\0\0\0");
        out.extend_from_slice(&moof(runs, moof_len + 8));
        let mdat: Vec<u8> = runs
            .iter()
            .flat_map(|r| r.samples.iter().flat_map(|s| s.payload.iter().copied()))
            .collect();
        out.extend_from_slice(&mp4_box(b"mdat", &mdat));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::demux::reader::SliceReader;

    const VIDEO: FixtureTrack = FixtureTrack {
        id: 1,
        handler: b"vide",
        timescale: 90_000,
    };
    const AUDIO: FixtureTrack = FixtureTrack {
        id: 2,
        handler: b"soun",
        timescale: 48_000,
    };

    fn collect(parser: &mut Mp4Parser, reader: &mut SliceReader) -> Vec<ParsedSample> {
        let mut out = Vec::new();
        while let Some(sample) = parser.next_sample(reader).unwrap() {
            out.push(sample);
        }
        out
    }

    #[test]
    fn test_parses_tracks_from_init() {
        let init = Bytes::from(init_segment(&[VIDEO, AUDIO]));
        let mut parser = Mp4Parser::new();
        let tracks = parser
            .parse_header(Some(&init), &mut SliceReader::new(Bytes::new()))
            .unwrap();
        assert_eq!(tracks.len(), 2);

        assert_eq!(tracks[0].stream_type, StreamType::Video);
        assert_eq!(tracks[0].timescale, 90_000);
        assert_eq!(tracks[0].codec.codec, "avc1");
        assert_eq!(tracks[0].codec.resolution.unwrap().width, 1280);
        assert_eq!(&tracks[0].codec.decoder_specific[..], &[0x01, 0x64, 0x00, 0x1F]);

        assert_eq!(tracks[1].stream_type, StreamType::Audio);
        assert_eq!(tracks[1].codec.sample_rate, Some(48_000));
        assert_eq!(tracks[1].codec.channels, Some(2));
        assert_eq!(&tracks[1].codec.decoder_specific[..], &[0x11, 0x90]);
    }

    #[test]
    fn test_reads_fragment_samples_in_file_order() {
        let init = Bytes::from(init_segment(&[VIDEO, AUDIO]));
        let segment = media_segment(&[
            FixtureRun {
                track_id: 1,
                base_dts: 180_000,
                samples: vec![
                    FixtureSample::new(3_000, b"idr", true).with_cto(3_000),
                    FixtureSample::new(3_000, b"p-frame", false).with_cto(-1_500),
                ],
            },
            FixtureRun {
                track_id: 2,
                base_dts: 96_000,
                samples: vec![FixtureSample::new(1_024, b"aac", true)],
            },
        ]);

        let mut parser = Mp4Parser::new();
        let mut reader = SliceReader::new(Bytes::from(segment));
        parser.parse_header(Some(&init), &mut reader).unwrap();
        let samples = collect(&mut parser, &mut reader);
        assert_eq!(samples.len(), 3);

        assert_eq!(samples[0].track_id, 1);
        assert_eq!((samples[0].dts, samples[0].pts), (180_000, 183_000));
        assert!(samples[0].sync);
        assert_eq!(&samples[0].payload[..], b"idr");

        assert_eq!((samples[1].dts, samples[1].pts), (183_000, 181_500));
        assert!(!samples[1].sync);
        assert!(samples[1].discardable);

        assert_eq!(samples[2].track_id, 2);
        assert_eq!(samples[2].pts, 96_000);
        assert_eq!(samples[2].duration, 1_024);
        assert_eq!(&samples[2].payload[..], b"aac");
    }

    #[test]
    fn test_unselected_tracks_are_skipped() {
        let init = Bytes::from(init_segment(&[VIDEO, AUDIO]));
        let segment = media_segment(&[
            FixtureRun {
                track_id: 1,
                base_dts: 0,
                samples: vec![FixtureSample::new(3_000, b"v", true)],
            },
            FixtureRun {
                track_id: 2,
                base_dts: 0,
                samples: vec![FixtureSample::new(1_024, b"a", true)],
            },
        ]);
        let mut parser = Mp4Parser::new();
        let mut reader = SliceReader::new(Bytes::from(segment));
        parser.parse_header(Some(&init), &mut reader).unwrap();
        parser.select_tracks(&[2]);
        let samples = collect(&mut parser, &mut reader);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].track_id, 2);
    }

    #[test]
    fn test_self_initializing_segment() {
        let mut data = init_segment(&[VIDEO]);
        data.extend_from_slice(&media_segment(&[FixtureRun {
            track_id: 1,
            base_dts: 9_000,
            samples: vec![FixtureSample::new(3_000, b"frame", true)],
        }]));
        // Offsets in the fragment are relative to its moof, so prepending is fine.
        let mut parser = Mp4Parser::new();
        let mut reader = SliceReader::new(Bytes::from(data));
        let tracks = parser.parse_header(None, &mut reader).unwrap();
        assert_eq!(tracks.len(), 1);
        let samples = collect(&mut parser, &mut reader);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].pts, 9_000);
    }

    #[test]
    fn test_fragment_without_moov_is_malformed_header() {
        let data = media_segment(&[FixtureRun {
            track_id: 1,
            base_dts: 0,
            samples: vec![FixtureSample::new(3_000, b"frame", true)],
        }]);
        let mut parser = Mp4Parser::new();
        let err = parser
            .parse_header(None, &mut SliceReader::new(Bytes::from(data)))
            .unwrap_err();
        assert_eq!(err.code(), 2002);
    }

    #[test]
    fn test_truncated_mdat_is_malformed_sample() {
        let init = Bytes::from(init_segment(&[VIDEO]));
        let mut data = media_segment(&[FixtureRun {
            track_id: 1,
            base_dts: 0,
            samples: vec![
                FixtureSample::new(3_000, b"first", true),
                FixtureSample::new(3_000, b"second", false),
            ],
        }]);
        data.truncate(data.len() - 3);

        let mut parser = Mp4Parser::new();
        let mut reader = SliceReader::new(Bytes::from(data));
        parser.parse_header(Some(&init), &mut reader).unwrap();
        assert_eq!(&parser.next_sample(&mut reader).unwrap().unwrap().payload[..], b"first");
        assert_eq!(parser.next_sample(&mut reader).unwrap_err().code(), 2003);
    }

    #[test]
    fn test_box_header_sizes() {
        let header = BoxHeader::parse(&[0, 0, 0, 0, b'm', b'd', b'a', b't']).unwrap();
        assert_eq!(header.size, None);

        let mut large = vec![0, 0, 0, 1];
        large.extend_from_slice(b"mdat");
        large.extend_from_slice(&32u64.to_be_bytes());
        let header = BoxHeader::parse(&large).unwrap();
        assert_eq!((header.size, header.header_len), (Some(32), 16));

        assert!(BoxHeader::parse(&[0, 0, 0, 4, b'f', b'r', b'e', b'e']).is_err());
    }
}
