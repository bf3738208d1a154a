//! Media domain types shared by the Electra crates.

mod time;

pub use time::MediaTime;

use serde::{Deserialize, Serialize};

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The kind of elementary stream a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Video, StreamType::Audio, StreamType::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Video => "video",
            StreamType::Audio => "audio",
            StreamType::Subtitle => "subtitle",
        }
    }

    /// Duration of one synthesized unit when no real sample has been seen yet.
    pub fn default_unit_duration(&self) -> MediaTime {
        match self {
            StreamType::Video => MediaTime::from_ticks(1, 30),
            StreamType::Audio => MediaTime::from_ticks(1, 20),
            StreamType::Subtitle => MediaTime::from_ticks(1, 10),
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" | "v" => Ok(StreamType::Video),
            "audio" | "a" => Ok(StreamType::Audio),
            "subtitle" | "subtitles" | "text" | "s" => Ok(StreamType::Subtitle),
            other => Err(format!("unknown stream type: {other}")),
        }
    }
}
