//! MPEG-2 transport stream demultiplexing for HLS-style segments.
//!
//! Program tables are expected to fit in a single packet, which holds for
//! segmenter output in practice.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use media_types::StreamType;
use memchr::memmem;
use tracing::{debug, trace};

use super::adts::split_frames;
use super::{ParsedSample, SampleParser, TrackInfo};
use crate::demux::reader::{MediaReader, SliceReader};
use crate::demux::timestamp::MPEG_TIMESTAMP_BITS;
use crate::error::DemuxError;
use crate::unit::CodecConfiguration;

const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PID_PAT: u16 = 0x0000;
const MPEG_TIMESCALE: u32 = 90_000;

const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
const STREAM_TYPE_ADTS: u8 = 0x0F;
const STREAM_TYPE_ID3: u8 = 0x15;
const STREAM_TYPE_AVC: u8 = 0x1B;
const STREAM_TYPE_HEVC: u8 = 0x24;

/// Elementary stream payload kinds this parser can split into samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EsKind {
    Avc,
    Hevc,
    Adts,
    MpegAudio,
}

impl EsKind {
    fn from_stream_type(stream_type: u8) -> Option<Self> {
        match stream_type {
            STREAM_TYPE_AVC => Some(Self::Avc),
            STREAM_TYPE_HEVC => Some(Self::Hevc),
            STREAM_TYPE_ADTS => Some(Self::Adts),
            STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => Some(Self::MpegAudio),
            _ => None,
        }
    }

    fn media_type(self) -> StreamType {
        match self {
            Self::Avc | Self::Hevc => StreamType::Video,
            Self::Adts | Self::MpegAudio => StreamType::Audio,
        }
    }

    fn codec(self) -> &'static str {
        match self {
            Self::Avc => "avc1",
            Self::Hevc => "hvc1",
            Self::Adts => "mp4a",
            Self::MpegAudio => "mp3",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TsPacket<'a> {
    pid: u16,
    payload_unit_start: bool,
    random_access: bool,
    payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, DemuxError> {
        if data.len() != PACKET_SIZE || data[0] != SYNC_BYTE {
            return Err(DemuxError::malformed_sample("lost transport stream sync"));
        }
        let pid = (u16::from(data[1] & 0x1F) << 8) | u16::from(data[2]);
        let payload_unit_start = data[1] & 0x40 != 0;
        let adaptation_field_control = (data[3] >> 4) & 0x03;

        let mut offset = 4;
        let mut random_access = false;
        if adaptation_field_control & 0x02 != 0 {
            let len = usize::from(data[4]);
            if len > 0 {
                random_access = data[5] & 0x40 != 0;
            }
            offset += 1 + len;
            if offset > PACKET_SIZE {
                return Err(DemuxError::malformed_sample(format!(
                    "adaptation field of {len} bytes overruns packet on PID {pid:#x}"
                )));
            }
        }
        let payload = if adaptation_field_control & 0x01 != 0 {
            &data[offset..]
        } else {
            &[]
        };
        Ok(Self {
            pid,
            payload_unit_start,
            random_access,
            payload,
        })
    }
}

/// Section body after the pointer field, up to but excluding the CRC.
fn section(payload: &[u8], expected_table: u8) -> Option<&[u8]> {
    let pointer = usize::from(*payload.first()?);
    let table = payload.get(1 + pointer..)?;
    if *table.first()? != expected_table {
        return None;
    }
    let section_length = (usize::from(table.get(1)? & 0x0F) << 8) | usize::from(*table.get(2)?);
    let end = (3 + section_length).checked_sub(4)?;
    table.get(..end.min(table.len()))
}

fn parse_pat(payload: &[u8]) -> Option<u16> {
    let table = section(payload, 0x00)?;
    table.get(8..)?.chunks_exact(4).find_map(|entry| {
        let program = u16::from_be_bytes([entry[0], entry[1]]);
        (program != 0).then(|| (u16::from(entry[2] & 0x1F) << 8) | u16::from(entry[3]))
    })
}

/// Elementary PIDs and stream types from a PMT section.
fn parse_pmt(payload: &[u8]) -> Option<Vec<(u16, u8)>> {
    let table = section(payload, 0x02)?;
    let program_info_len = (usize::from(table.get(10)? & 0x0F) << 8) | usize::from(*table.get(11)?);
    let mut offset = 12 + program_info_len;
    let mut streams = Vec::new();
    while offset + 5 <= table.len() {
        let stream_type = table[offset];
        let pid = (u16::from(table[offset + 1] & 0x1F) << 8) | u16::from(table[offset + 2]);
        let info_len = (usize::from(table[offset + 3] & 0x0F) << 8) | usize::from(table[offset + 4]);
        streams.push((pid, stream_type));
        offset += 5 + info_len;
    }
    Some(streams)
}

/// 33-bit PTS/DTS from its 5-byte PES encoding.
fn parse_timestamp(data: &[u8]) -> Option<i64> {
    if data.len() < 5 {
        return None;
    }
    let ts = ((u64::from(data[0] >> 1) & 0x07) << 30)
        | (u64::from(data[1]) << 22)
        | ((u64::from(data[2] >> 1) & 0x7F) << 15)
        | (u64::from(data[3]) << 7)
        | (u64::from(data[4] >> 1) & 0x7F);
    Some(ts as i64)
}

#[derive(Debug)]
struct PesPayload {
    pts: Option<i64>,
    dts: Option<i64>,
    data: Bytes,
}

fn parse_pes(data: Bytes) -> Result<PesPayload, DemuxError> {
    if data.len() < 9 || data[..3] != [0x00, 0x00, 0x01] {
        return Err(DemuxError::malformed_sample("missing PES start code"));
    }
    let timestamp_flags = data[7] >> 6;
    let header_len = usize::from(data[8]);
    let payload_start = 9 + header_len;
    if payload_start > data.len() {
        return Err(DemuxError::malformed_sample("PES header overruns its packet"));
    }
    let pts = if timestamp_flags & 0x2 != 0 {
        parse_timestamp(&data[9..payload_start])
    } else {
        None
    };
    let dts = if timestamp_flags == 0x3 {
        parse_timestamp(&data[14.min(payload_start)..payload_start])
    } else {
        None
    };
    Ok(PesPayload {
        pts,
        dts,
        data: data.slice(payload_start..),
    })
}

/// Whether an Annex B access unit carries an IDR/IRAP picture.
fn contains_random_access_picture(data: &[u8], kind: EsKind) -> bool {
    memmem::find_iter(data, &[0x00, 0x00, 0x01]).any(|pos| match data.get(pos + 3) {
        Some(&header) => match kind {
            EsKind::Avc => header & 0x1F == 5,
            EsKind::Hevc => matches!((header >> 1) & 0x3F, 16..=21),
            EsKind::Adts | EsKind::MpegAudio => false,
        },
        None => false,
    })
}

#[derive(Debug)]
struct PesAssembly {
    random_access: bool,
    data: BytesMut,
}

#[derive(Debug)]
struct EsStream {
    kind: EsKind,
    assembly: Option<PesAssembly>,
    last_pts: Option<i64>,
    audio_config: Option<Arc<CodecConfiguration>>,
}

/// Transport stream parser. Track ids are PIDs.
#[derive(Debug, Default)]
pub struct TsParser {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, EsStream>,
    selected: Option<Vec<u64>>,
    /// Packets read while looking for the program tables
    backlog: VecDeque<Bytes>,
    ready: VecDeque<ParsedSample>,
    flushed: bool,
}

impl TsParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_selected(&self, pid: u16) -> bool {
        self.selected.as_ref().is_none_or(|ids| ids.contains(&u64::from(pid)))
    }

    /// Handles PAT/PMT packets; returns whether the PMT is now known.
    fn handle_tables(&mut self, packet: &TsPacket<'_>) -> bool {
        if packet.pid == PID_PAT && packet.payload_unit_start {
            if let Some(pmt_pid) = parse_pat(packet.payload)
                && self.pmt_pid.is_none()
            {
                trace!(pmt_pid, "Found program map PID");
                self.pmt_pid = Some(pmt_pid);
            }
        } else if Some(packet.pid) == self.pmt_pid
            && packet.payload_unit_start
            && self.streams.is_empty()
            && let Some(entries) = parse_pmt(packet.payload)
        {
            for (pid, stream_type) in entries {
                match EsKind::from_stream_type(stream_type) {
                    Some(kind) => {
                        self.streams.insert(
                            pid,
                            EsStream {
                                kind,
                                assembly: None,
                                last_pts: None,
                                audio_config: None,
                            },
                        );
                    }
                    None if stream_type == STREAM_TYPE_ID3 => trace!(pid, "Ignoring timed metadata stream"),
                    None => debug!(pid, stream_type, "Ignoring unsupported elementary stream"),
                }
            }
        }
        !self.streams.is_empty()
    }

    fn scan_tables(&mut self, reader: &mut dyn MediaReader, keep: bool) -> Result<bool, DemuxError> {
        while let Some(data) = reader.read_exact(PACKET_SIZE)? {
            let packet = TsPacket::parse(&data)?;
            let found = self.handle_tables(&packet);
            if keep {
                self.backlog.push_back(data);
            }
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_packet(&mut self, data: &[u8]) -> Result<(), DemuxError> {
        let packet = TsPacket::parse(data)?;
        if !self.streams.contains_key(&packet.pid) {
            self.handle_tables(&packet);
            return Ok(());
        }
        if !self.is_selected(packet.pid) {
            return Ok(());
        }
        if packet.payload_unit_start {
            self.finish_pes(packet.pid)?;
            if let Some(stream) = self.streams.get_mut(&packet.pid) {
                stream.assembly = Some(PesAssembly {
                    random_access: packet.random_access,
                    data: BytesMut::from(packet.payload),
                });
            }
        } else if let Some(assembly) = self
            .streams
            .get_mut(&packet.pid)
            .and_then(|s| s.assembly.as_mut())
        {
            assembly.data.extend_from_slice(packet.payload);
        }
        Ok(())
    }

    /// Converts the PES collected on `pid` into ready samples.
    fn finish_pes(&mut self, pid: u16) -> Result<(), DemuxError> {
        let Some(stream) = self.streams.get_mut(&pid) else {
            return Ok(());
        };
        let Some(assembly) = stream.assembly.take() else {
            return Ok(());
        };
        let pes = parse_pes(assembly.data.freeze())?;
        let Some(pts) = pes.pts.or(stream.last_pts) else {
            debug!(pid, "Dropping PES without a timestamp");
            return Ok(());
        };
        stream.last_pts = Some(pts);
        let track_id = u64::from(pid);

        match stream.kind {
            EsKind::Avc | EsKind::Hevc => {
                let sync = assembly.random_access || contains_random_access_picture(&pes.data, stream.kind);
                self.ready.push_back(ParsedSample {
                    track_id,
                    pts,
                    dts: pes.dts.unwrap_or(pts),
                    duration: 0,
                    sync,
                    discardable: false,
                    payload: pes.data,
                    codec: None,
                });
            }
            EsKind::Adts => {
                let mut samples_before = 0u64;
                for (header, payload) in split_frames(&pes.data)? {
                    let rate = u64::from(header.sample_rate);
                    let offset = (samples_before * u64::from(MPEG_TIMESCALE) / rate) as i64;
                    samples_before += header.samples();
                    let end = (samples_before * u64::from(MPEG_TIMESCALE) / rate) as i64;

                    let config = Arc::new(header.codec_config());
                    let changed = stream.audio_config.as_ref() != Some(&config);
                    if changed {
                        stream.audio_config = Some(config.clone());
                    }
                    self.ready.push_back(ParsedSample {
                        track_id,
                        pts: pts + offset,
                        dts: pts + offset,
                        duration: (end - offset) as u64,
                        sync: true,
                        discardable: false,
                        payload,
                        codec: changed.then_some(config),
                    });
                }
            }
            EsKind::MpegAudio => self.ready.push_back(ParsedSample {
                track_id,
                pts,
                dts: pts,
                duration: 0,
                sync: true,
                discardable: false,
                payload: pes.data,
                codec: None,
            }),
        }
        Ok(())
    }
}

impl SampleParser for TsParser {
    fn parse_header(
        &mut self,
        init: Option<&Bytes>,
        reader: &mut dyn MediaReader,
    ) -> Result<Vec<TrackInfo>, DemuxError> {
        let found = match init {
            Some(init) => self.scan_tables(&mut SliceReader::new(init.clone()), false)?,
            None => false,
        };
        if !found && !self.scan_tables(reader, true)? {
            return Err(DemuxError::malformed_header("no program map table in segment"));
        }

        let mut pids: Vec<_> = self.streams.iter().map(|(pid, s)| (*pid, s.kind)).collect();
        pids.sort_unstable_by_key(|(pid, _)| *pid);
        Ok(pids
            .into_iter()
            .map(|(pid, kind)| TrackInfo {
                id: u64::from(pid),
                stream_type: kind.media_type(),
                timescale: MPEG_TIMESCALE,
                codec: Arc::new(CodecConfiguration::new(kind.codec())),
                timestamp_bits: Some(MPEG_TIMESTAMP_BITS),
            })
            .collect())
    }

    fn select_tracks(&mut self, ids: &[u64]) {
        self.selected = Some(ids.to_vec());
    }

    fn next_sample(&mut self, reader: &mut dyn MediaReader) -> Result<Option<ParsedSample>, DemuxError> {
        loop {
            if let Some(sample) = self.ready.pop_front() {
                return Ok(Some(sample));
            }
            if self.flushed {
                return Ok(None);
            }
            let packet = match self.backlog.pop_front() {
                Some(packet) => Some(packet),
                None => reader.read_exact(PACKET_SIZE)?,
            };
            match packet {
                Some(packet) => self.handle_packet(&packet)?,
                None => {
                    let mut pids: Vec<u16> = self.streams.keys().copied().collect();
                    pids.sort_unstable();
                    for pid in pids {
                        self.finish_pes(pid)?;
                    }
                    self.flushed = true;
                }
            }
        }
    }
}

/// Packet, table and PES writers for building transport streams in tests.
#[cfg(test)]
pub(crate) mod fixtures {
    pub fn packet(pid: u16, unit_start: bool, random_access: bool, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 184);
        let mut p = vec![
            0x47,
            (if unit_start { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
        ];
        if payload.len() == 184 && !random_access {
            p.push(0x10);
        } else {
            p.push(0x30);
            let af_len = 183 - payload.len();
            p.push(af_len as u8);
            if af_len > 0 {
                p.push(if random_access { 0x40 } else { 0x00 });
                p.extend(std::iter::repeat_n(0xFF, af_len - 1));
            }
        }
        p.extend_from_slice(payload);
        assert_eq!(p.len(), 188);
        p
    }

    /// Splits a PES across as many packets as needed.
    pub fn pes_packets(pid: u16, pes: &[u8], random_access: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0;
        let mut first = true;
        while first || offset < pes.len() {
            let max = if first && random_access { 182 } else { 184 };
            let end = (offset + max).min(pes.len());
            out.extend(packet(pid, first, first && random_access, &pes[offset..end]));
            offset = end;
            first = false;
        }
        out
    }

    pub fn pat(pmt_pid: u16) -> Vec<u8> {
        let section = [
            0x00, 0x00, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01,
            0xE0 | (pmt_pid >> 8) as u8, pmt_pid as u8, 0, 0, 0, 0,
        ];
        packet(0, true, false, &section)
    }

    pub fn pmt(pmt_pid: u16, streams: &[(u16, u8)]) -> Vec<u8> {
        let section_length = 9 + 5 * streams.len() + 4;
        let mut section = vec![
            0x00,
            0x02,
            0xB0 | (section_length >> 8) as u8,
            section_length as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE1,
            0x00,
            0xF0,
            0x00,
        ];
        for (pid, stream_type) in streams {
            section.extend_from_slice(&[*stream_type, 0xE0 | (pid >> 8) as u8, *pid as u8, 0xF0, 0x00]);
        }
        section.extend_from_slice(&[0, 0, 0, 0]);
        packet(pmt_pid, true, false, &section)
    }

    fn timestamp(prefix: u8, ts: u64) -> [u8; 5] {
        [
            (prefix << 4) | (((ts >> 29) & 0x0E) as u8) | 1,
            (ts >> 22) as u8,
            (((ts >> 14) & 0xFE) as u8) | 1,
            (ts >> 7) as u8,
            (((ts << 1) & 0xFE) as u8) | 1,
        ]
    }

    pub fn pes(stream_id: u8, pts: u64, dts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80];
        match dts {
            Some(dts) => {
                out.extend_from_slice(&[0xC0, 10]);
                out.extend_from_slice(&timestamp(0x3, pts));
                out.extend_from_slice(&timestamp(0x1, dts));
            }
            None => {
                out.extend_from_slice(&[0x80, 5]);
                out.extend_from_slice(&timestamp(0x2, pts));
            }
        }
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::adts::build_frame;
    use super::fixtures::*;
    use super::*;

    const PMT_PID: u16 = 0x1000;
    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x101;

    fn program() -> Vec<u8> {
        let mut data = pat(PMT_PID);
        data.extend(pmt(
            PMT_PID,
            &[
                (VIDEO_PID, STREAM_TYPE_AVC),
                (AUDIO_PID, STREAM_TYPE_ADTS),
                (0x102, STREAM_TYPE_ID3),
            ],
        ));
        data
    }

    fn collect(parser: &mut TsParser, reader: &mut SliceReader) -> Vec<ParsedSample> {
        let mut out = Vec::new();
        while let Some(sample) = parser.next_sample(reader).unwrap() {
            out.push(sample);
        }
        out
    }

    #[test]
    fn test_program_tables_declare_tracks() {
        let mut parser = TsParser::new();
        let mut reader = SliceReader::new(Bytes::from(program()));
        let tracks = parser.parse_header(None, &mut reader).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!((tracks[0].id, tracks[0].stream_type), (0x100, StreamType::Video));
        assert_eq!((tracks[1].id, tracks[1].stream_type), (0x101, StreamType::Audio));
        assert_eq!(tracks[0].timestamp_bits, Some(33));
        assert_eq!(tracks[0].timescale, 90_000);
    }

    #[test]
    fn test_video_access_units_and_sync_detection() {
        let mut data = program();
        let idr = [0x00, 0x00, 0x00, 0x01, 0x65, 0xAA, 0xBB];
        // Large enough to span several packets
        let mut non_idr = vec![0x00, 0x00, 0x01, 0x41];
        non_idr.extend(std::iter::repeat_n(0x5A, 400));
        data.extend(pes_packets(VIDEO_PID, &pes(0xE0, 183_000, Some(180_000), &idr), false));
        data.extend(pes_packets(VIDEO_PID, &pes(0xE0, 186_000, Some(183_000), &non_idr), false));

        let mut parser = TsParser::new();
        let mut reader = SliceReader::new(Bytes::from(data));
        parser.parse_header(None, &mut reader).unwrap();
        let samples = collect(&mut parser, &mut reader);
        assert_eq!(samples.len(), 2);
        assert_eq!((samples[0].pts, samples[0].dts), (183_000, 180_000));
        assert!(samples[0].sync);
        assert_eq!(&samples[0].payload[..], &idr[..]);
        assert!(!samples[1].sync);
        assert_eq!(samples[1].payload.len(), 404);
    }

    #[test]
    fn test_random_access_indicator_marks_sync() {
        let mut data = program();
        data.extend(pes_packets(VIDEO_PID, &pes(0xE0, 0, None, &[0x00, 0x00, 0x01, 0x41]), true));
        let mut parser = TsParser::new();
        let mut reader = SliceReader::new(Bytes::from(data));
        parser.parse_header(None, &mut reader).unwrap();
        assert!(parser.next_sample(&mut reader).unwrap().unwrap().sync);
    }

    #[test]
    fn test_adts_pes_splits_into_frames() {
        let mut data = program();
        let mut frames = build_frame(b"one", 3, 2);
        frames.extend(build_frame(b"two", 3, 2));
        data.extend(pes_packets(AUDIO_PID, &pes(0xC0, 90_000, None, &frames), false));
        data.extend(pes_packets(AUDIO_PID, &pes(0xC0, 93_840, None, &build_frame(b"three", 3, 2)), false));

        let mut parser = TsParser::new();
        let mut reader = SliceReader::new(Bytes::from(data));
        parser.parse_header(None, &mut reader).unwrap();
        parser.select_tracks(&[u64::from(AUDIO_PID)]);
        let samples = collect(&mut parser, &mut reader);
        assert_eq!(samples.len(), 3);
        assert_eq!(
            samples.iter().map(|s| s.pts).collect::<Vec<_>>(),
            vec![90_000, 91_920, 93_840]
        );
        assert_eq!(&samples[1].payload[..], b"two");
        // Configuration only travels with the first frame
        assert_eq!(samples[0].codec.as_ref().unwrap().sample_rate, Some(48_000));
        assert!(samples[1].codec.is_none());
        assert!(samples[2].codec.is_none());
    }

    #[test]
    fn test_missing_pmt_is_malformed_header() {
        let data = pat(PMT_PID);
        let mut parser = TsParser::new();
        let err = parser
            .parse_header(None, &mut SliceReader::new(Bytes::from(data)))
            .unwrap_err();
        assert_eq!(err.code(), 2002);
    }

    #[test]
    fn test_lost_sync_is_malformed_sample() {
        let mut data = program();
        data.extend(std::iter::repeat_n(0u8, 188));
        let mut parser = TsParser::new();
        let mut reader = SliceReader::new(Bytes::from(data));
        parser.parse_header(None, &mut reader).unwrap();
        assert_eq!(parser.next_sample(&mut reader).unwrap_err().code(), 2003);
    }

    #[test]
    fn test_timestamp_decoding() {
        let encoded = [0x21, 0x00, 0x05, 0xBF, 0x21];
        assert_eq!(parse_timestamp(&encoded), Some(90_000));
    }
}
