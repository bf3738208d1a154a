use std::sync::Arc;

use media_types::{MediaTime, StreamType};

use crate::unit::{CodecConfiguration, DecodableUnit, TrackIdentity};

/// Running average of the real unit durations seen on one track.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationAverage {
    total: MediaTime,
    count: i64,
}

impl DurationAverage {
    pub fn record(&mut self, duration: MediaTime) {
        if duration > MediaTime::ZERO && !duration.is_infinite() {
            self.total += duration;
            self.count += 1;
        }
    }

    pub fn average(&self) -> Option<MediaTime> {
        (self.count > 0).then(|| MediaTime::from_hns(self.total.hns() / self.count))
    }
}

/// What every synthesized unit of one gap has in common.
#[derive(Debug, Clone)]
pub struct FillerTemplate {
    pub stream_type: StreamType,
    pub source: TrackIdentity,
    pub codec_config: Option<Arc<CodecConfiguration>>,
    pub sequence_index: u32,
    pub earliest_pts: MediaTime,
    pub latest_pts: MediaTime,
}

impl FillerTemplate {
    pub fn new(stream_type: StreamType, source: TrackIdentity) -> Self {
        Self {
            stream_type,
            source,
            codec_config: None,
            sequence_index: 0,
            earliest_pts: MediaTime::NEGATIVE_INFINITY,
            latest_pts: MediaTime::POSITIVE_INFINITY,
        }
    }

    /// Zero-payload units covering `[from, to)`.
    ///
    /// Units last `unit_duration` (the stream type default if not positive),
    /// the final one clamped to the remaining gap. Filling stops early with a
    /// unit tagged `last_in_period` once a unit would end past `latest_pts`.
    pub fn fill(&self, from: MediaTime, to: MediaTime, unit_duration: MediaTime) -> Vec<DecodableUnit> {
        let step = if unit_duration > MediaTime::ZERO {
            unit_duration
        } else {
            self.stream_type.default_unit_duration()
        };
        if to.is_infinite() || from.is_infinite() {
            return Vec::new();
        }

        let mut units = Vec::new();
        let mut at = from;
        while at < to {
            let duration = step.min(to - at);
            let mut unit = DecodableUnit::filler(self.stream_type, self.source.clone(), at, duration)
                .with_window(self.earliest_pts, self.latest_pts);
            unit.sequence_index = self.sequence_index;
            unit.codec_config = self.codec_config.clone();

            if unit.end_pts() > self.latest_pts {
                unit.last_in_period = true;
                units.push(unit);
                break;
            }
            units.push(unit);
            at += duration;
        }
        units
    }
}
