use std::collections::HashMap;

use media_types::{MediaTime, StreamType};
use serde::{Deserialize, Serialize};

use super::request::SegmentRequest;

/// Width of MPEG-2 system clock timestamps (90 kHz).
pub const MPEG_TIMESTAMP_BITS: u32 = 33;

/// Unwraps a fixed-width timestamp counter into a monotonic timeline.
///
/// Raw values are reduced modulo `2^W` before the accumulated offset is
/// added, so feeding an already corrected value gives the same result.
#[derive(Debug, Clone)]
pub struct RolloverTracker {
    width: u32,
    detect_divisor: u32,
    offset: i64,
    previous: Option<i64>,
}

impl RolloverTracker {
    /// `detect_divisor` sets the regression that counts as a wrap to
    /// `period / detect_divisor`.
    pub fn new(width: u32, detect_divisor: u32) -> Self {
        Self {
            width: width.clamp(1, 62),
            detect_divisor: detect_divisor.max(2),
            offset: 0,
            previous: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn period(&self) -> i64 {
        1i64 << self.width
    }

    /// Offset added to raw values so far.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn correct(&mut self, raw: i64) -> i64 {
        let period = self.period();
        let threshold = period / i64::from(self.detect_divisor);
        let mut value = raw.rem_euclid(period) + self.offset;
        if let Some(previous) = self.previous
            && value + threshold < previous
        {
            self.offset += period;
            value += period;
        }
        self.previous = Some(value);
        value
    }

    /// Corrects a presentation/decode pair.
    ///
    /// Wraps are detected on the decode time, which never decreases in
    /// decode order. The presentation time is then placed on the period
    /// nearest the corrected decode time, so reordered frames on either side
    /// of a wrap are not unwrapped twice.
    pub fn correct_pair(&mut self, pts: i64, dts: i64) -> (i64, i64) {
        let period = self.period();
        let dts = self.correct(dts);
        let mut pts = pts.rem_euclid(period) + self.offset;
        if pts + period / 2 < dts {
            pts += period;
        } else if pts > dts + period / 2 {
            pts -= period;
        }
        (pts, dts)
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.previous = None;
    }
}

/// Which units of a segment the timestamp-regression guard checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionPolicy {
    /// Only the first unit of each selected track
    #[default]
    FirstUnitOnly,
    /// Every unit; a late regression also rejects the whole segment
    AnyUnit,
}

/// Segment-local to absolute time.
///
/// `abs = local - presentation_time_offset + (period_start + anchor_time + adjustment)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMapping {
    presentation_time_offset: MediaTime,
    base: MediaTime,
}

impl TimeMapping {
    pub fn new(
        presentation_time_offset: MediaTime,
        period_start: MediaTime,
        anchor_time: MediaTime,
        adjustment: MediaTime,
    ) -> Self {
        Self {
            presentation_time_offset,
            base: period_start + anchor_time + adjustment,
        }
    }

    pub fn for_request(request: &SegmentRequest) -> Self {
        Self::new(
            request.presentation_time_offset,
            request.period_start,
            request.anchor_time,
            request.adjustment,
        )
    }

    pub fn map(&self, local: MediaTime) -> MediaTime {
        if local.is_infinite() {
            return local;
        }
        local - self.presentation_time_offset + self.base
    }

    pub fn map_ticks(&self, ticks: i64, timescale: u32) -> MediaTime {
        self.map(MediaTime::from_ticks(ticks, timescale))
    }
}

/// Largest accepted presentation time per track, scoped to one sequence index.
#[derive(Debug, Default)]
pub struct RegressionGuard {
    sequence_index: Option<u32>,
    largest: HashMap<StreamType, MediaTime>,
}

impl RegressionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all tracks when the sequence index changes.
    pub fn begin_sequence(&mut self, sequence_index: u32) {
        if self.sequence_index != Some(sequence_index) {
            self.sequence_index = Some(sequence_index);
            self.largest.clear();
        }
    }

    /// `false` when `pts` does not advance past the previous segments.
    pub fn admits(&self, stream_type: StreamType, pts: MediaTime) -> bool {
        self.largest
            .get(&stream_type)
            .is_none_or(|largest| pts > *largest)
    }

    pub fn largest(&self, stream_type: StreamType) -> Option<MediaTime> {
        self.largest.get(&stream_type).copied()
    }

    pub fn record(&mut self, stream_type: StreamType, pts: MediaTime) {
        let entry = self.largest.entry(stream_type).or_insert(pts);
        if pts > *entry {
            *entry = pts;
        }
    }
}
