use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use bytes_util::BitReader;

use crate::error::DemuxError;
use crate::unit::CodecConfiguration;

pub(crate) const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

pub(crate) const SAMPLES_PER_BLOCK: u64 = 1024;

/// Fixed and variable ADTS header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// Audio object type minus one
    pub profile: u8,
    pub sampling_index: u8,
    pub sample_rate: u32,
    pub channels: u8,
    /// Header plus payload
    pub frame_length: usize,
    pub header_length: usize,
    pub raw_blocks: u8,
}

impl AdtsHeader {
    pub const MIN_LEN: usize = 7;

    pub fn parse(data: &[u8]) -> Result<Self, DemuxError> {
        if data.len() < Self::MIN_LEN {
            return Err(DemuxError::malformed_sample("ADTS header truncated"));
        }
        let mut bits = BitReader::new(io::Cursor::new(&data[..Self::MIN_LEN]));
        if bits.read_bits(12)? != 0xFFF {
            return Err(DemuxError::malformed_sample("missing ADTS sync word"));
        }
        bits.skip_bits(3)?; // id, layer
        let protection_absent = bits.read_bit()?;
        let profile = bits.read_bits(2)? as u8;
        let sampling_index = bits.read_bits(4)? as u8;
        bits.skip_bits(1)?;
        let channels = bits.read_bits(3)? as u8;
        bits.skip_bits(4)?;
        let frame_length = bits.read_bits(13)? as usize;
        bits.skip_bits(11)?; // buffer fullness
        let raw_blocks = bits.read_bits(2)? as u8;

        let sample_rate = *SAMPLE_RATES
            .get(sampling_index as usize)
            .ok_or_else(|| DemuxError::unsupported(format!("ADTS sampling index {sampling_index}")))?;
        let header_length = if protection_absent { 7 } else { 9 };
        if frame_length < header_length {
            return Err(DemuxError::malformed_sample(format!(
                "ADTS frame length {frame_length} shorter than its header"
            )));
        }
        Ok(Self {
            profile,
            sampling_index,
            sample_rate,
            channels,
            frame_length,
            header_length,
            raw_blocks,
        })
    }

    /// PCM samples per channel in this frame.
    pub fn samples(&self) -> u64 {
        SAMPLES_PER_BLOCK * (u64::from(self.raw_blocks) + 1)
    }

    /// Two-byte MPEG-4 AudioSpecificConfig equivalent to this header.
    pub fn audio_specific_config(&self) -> Bytes {
        let object_type = u16::from(self.profile) + 1;
        let config = (object_type << 11)
            | (u16::from(self.sampling_index) << 7)
            | (u16::from(self.channels) << 3);
        let mut out = BytesMut::with_capacity(2);
        out.put_u16(config);
        out.freeze()
    }

    pub fn codec_config(&self) -> CodecConfiguration {
        CodecConfiguration::new("mp4a")
            .with_decoder_specific(self.audio_specific_config())
            .with_audio(self.sample_rate, u16::from(self.channels))
    }
}

/// Splits concatenated ADTS frames into headers and raw payloads.
pub(crate) fn split_frames(data: &Bytes) -> Result<Vec<(AdtsHeader, Bytes)>, DemuxError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = AdtsHeader::parse(&data[offset..])?;
        let end = offset + header.frame_length;
        if end > data.len() {
            return Err(DemuxError::malformed_sample(format!(
                "ADTS frame of {} bytes at offset {offset} overruns {} bytes",
                header.frame_length,
                data.len()
            )));
        }
        frames.push((header, data.slice(offset + header.header_length..end)));
        offset = end;
    }
    Ok(frames)
}

/// Builds an AAC-LC ADTS frame around `payload`.
#[cfg(test)]
pub(crate) fn build_frame(payload: &[u8], sampling_index: u8, channels: u8) -> Vec<u8> {
    let len = payload.len() + 7;
    let mut frame = vec![
        0xFF,
        0xF1,
        (1 << 6) | (sampling_index << 2) | (channels >> 2),
        ((channels & 3) << 6) | ((len >> 11) & 3) as u8,
        ((len >> 3) & 0xFF) as u8,
        (((len & 7) << 5) as u8) | 0x1F,
        0xFC,
    ];
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let frame = build_frame(&[1, 2, 3, 4], 4, 2);
        let header = AdtsHeader::parse(&frame).unwrap();
        assert_eq!(header.sample_rate, 44_100);
        assert_eq!(header.channels, 2);
        assert_eq!(header.frame_length, 11);
        assert_eq!(header.header_length, 7);
        assert_eq!(header.samples(), 1024);
        // AAC-LC, 44.1 kHz, stereo
        assert_eq!(&header.audio_specific_config()[..], &[0x12, 0x10]);
    }

    #[test]
    fn test_split_frames() {
        let mut data = build_frame(b"first", 3, 1);
        data.extend_from_slice(&build_frame(b"second", 3, 1));
        let frames = split_frames(&Bytes::from(data)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].1[..], b"first");
        assert_eq!(&frames[1].1[..], b"second");
        assert_eq!(frames[1].0.sample_rate, 48_000);
    }

    #[test]
    fn test_truncated_frame() {
        let mut data = build_frame(b"payload", 3, 2);
        data.truncate(10);
        assert_eq!(split_frames(&Bytes::from(data)).unwrap_err().code(), 2003);
        assert!(AdtsHeader::parse(&[0x47, 0x40, 0, 0, 0, 0, 0]).is_err());
    }
}
