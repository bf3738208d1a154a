use std::fmt;

use serde::{Deserialize, Serialize};

/// Bytes needed to tell the supported containers apart.
pub const PROBE_LEN: usize = 16;

const MP4_BOX_TYPES: [&[u8; 4]; 11] = [
    b"styp", b"moof", b"sidx", b"ftyp", b"moov", b"emsg", b"free", b"skip", b"ssix", b"prft",
    b"udta",
];

/// EBML header and a bare Cluster, the two ways a WebM segment can start
const MATROSKA_MAGIC: [[u8; 4]; 2] = [[0x1A, 0x45, 0xDF, 0xA3], [0x1F, 0x43, 0xB6, 0x75]];

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

const TS_SYNC_BYTE: u8 = 0x47;

/// Container formats the demultiplexer can parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Mp4,
    Matroska,
    Ts,
    /// Raw ADTS audio behind an ID3 tag
    Id3Adts,
    WebVtt,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Matroska => "matroska",
            Self::Ts => "ts",
            Self::Id3Adts => "id3-adts",
            Self::WebVtt => "webvtt",
        }
    }

    /// Identifies the container from the first bytes of a segment.
    ///
    /// Raw ID3 audio is only accepted when the bytes following the tag are
    /// an ADTS sync word, or when `head` ends before the tag does.
    pub fn probe(head: &[u8]) -> Option<Self> {
        if head.len() >= 8 && MP4_BOX_TYPES.iter().any(|t| &head[4..8] == *t) {
            return Some(Self::Mp4);
        }
        if head.len() >= 4 && MATROSKA_MAGIC.iter().any(|m| head[..4] == *m) {
            return Some(Self::Matroska);
        }
        if head.starts_with(b"ID3") {
            return match id3_tag_len(head) {
                Some(tag_len) if head.len() >= tag_len + 2 => {
                    is_adts_sync(&head[tag_len..]).then_some(Self::Id3Adts)
                }
                Some(_) => Some(Self::Id3Adts),
                None => None,
            };
        }
        let text = head.strip_prefix(UTF8_BOM).unwrap_or(head);
        if text.starts_with(b"WEBVTT") {
            return Some(Self::WebVtt);
        }
        if head.first() == Some(&TS_SYNC_BYTE) {
            return Some(Self::Ts);
        }
        None
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total length of an ID3v2 tag (header plus syncsafe body size).
pub(crate) fn id3_tag_len(data: &[u8]) -> Option<usize> {
    if data.len() < 10 || !data.starts_with(b"ID3") {
        return None;
    }
    let size = ((data[6] as usize & 0x7F) << 21)
        | ((data[7] as usize & 0x7F) << 14)
        | ((data[8] as usize & 0x7F) << 7)
        | (data[9] as usize & 0x7F);
    Some(10 + size)
}

pub(crate) fn is_adts_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}
