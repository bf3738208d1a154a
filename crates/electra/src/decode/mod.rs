//! Decode engine: pulls units from a [`TrackBufferManager`](crate::buffer::TrackBufferManager),
//! drives an opaque [`Decoder`] through its state machine and hands decoded
//! output to a [`RendererSink`].

mod arena;
mod engine;
mod metrics;
mod passthrough;

pub use engine::{DecodeEngine, DecodeState, EngineControl, EngineExit, EngineHandle};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use passthrough::{CollectingRenderer, PassthroughDecoder, PassthroughFactory, RenderedFrame};

use bytes::{Bytes, BytesMut};
use media_types::{MediaTime, Resolution, StreamType};

use crate::buffer::BufferStats;
use crate::error::DecodeError;
use crate::unit::{CodecConfiguration, DecodableUnit, TrackIdentity};

/// How a unit is being submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Normal,
    /// Re-submission after decoder state loss. The decoder must not produce
    /// output for replayed units. `last` marks the final unit of the replay set.
    Replay { last: bool },
}

/// One submission to the decoder.
#[derive(Debug, Clone, Copy)]
pub struct DecoderInput<'a> {
    pub unit: &'a DecodableUnit,
    /// Monotonic value echoed back on the matching [`DecodedOutput`]
    pub correlation: u64,
    pub mode: SubmitMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    /// Back-pressure; retry the same unit later
    NoBufferSpace,
    /// The decoder is still finishing a previous end of input; retry later
    EndOfData,
    /// Internal state was lost; the decoder stays usable but needs the units
    /// since the last sync point again
    DecoderLost,
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct DecodedOutput {
    pub correlation: u64,
    pub data: Bytes,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone)]
pub enum OutputStatus {
    Available(DecodedOutput),
    TryAgain,
    EndOfData,
}

/// Answer to a codec configuration change on a non-adaptive decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Drain,
    DrainAndReset,
}

/// A decoder backend.
pub trait Decoder: Send {
    fn submit(&mut self, input: DecoderInput<'_>) -> SubmitStatus;

    /// No more input follows until the decoder has returned
    /// [`OutputStatus::EndOfData`] and been flushed.
    fn send_end_of_input(&mut self) -> SubmitStatus;

    fn request_output(&mut self) -> Result<OutputStatus, DecodeError>;

    /// Drops all queued input and output.
    fn flush(&mut self);

    /// Returns the decoder to its freshly created state. `false` when
    /// unsupported, in which case the engine recreates the decoder.
    fn reset_to_clean_start(&mut self) -> bool;

    fn is_compatible_with(&self, config: &CodecConfiguration) -> Compatibility;

    /// Adaptive decoders take configuration changes in stride.
    fn is_adaptive(&self) -> bool {
        false
    }

    /// Whether the decoder can lose its state and needs replay data.
    fn needs_replay_data(&self) -> bool {
        true
    }

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    /// Writes a decoded frame into a renderer buffer.
    fn convert_output(
        &mut self,
        output: DecodedOutput,
        buffer: &mut OutputBuffer,
    ) -> Result<(), DecodeError> {
        buffer.data.clear();
        buffer.data.extend_from_slice(&output.data);
        Ok(())
    }
}

pub trait DecoderFactory: Send {
    fn create(&mut self, config: &CodecConfiguration) -> Result<Box<dyn Decoder>, DecodeError>;
}

/// Renderer-owned buffer the engine writes decoded output into.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pub id: u64,
    pub data: BytesMut,
}

/// Timing and format of a returned buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleProperties {
    pub stream_type: StreamType,
    pub pts: MediaTime,
    pub duration: MediaTime,
    pub sequence_index: u32,
    pub resolution: Option<Resolution>,
    pub source: TrackIdentity,
    /// The buffer stands in for a filler unit and carries no frame
    pub dummy: bool,
}

impl SampleProperties {
    pub fn for_unit(unit: &DecodableUnit) -> Self {
        Self {
            stream_type: unit.stream_type,
            pts: unit.pts,
            duration: unit.duration,
            sequence_index: unit.sequence_index,
            resolution: unit.codec_config.as_ref().and_then(|c| c.resolution),
            source: unit.source.clone(),
            dummy: unit.filler,
        }
    }
}

pub trait RendererSink: Send {
    fn can_receive_frames(&self, count: usize) -> bool;

    /// `Ok(None)` when no buffer is free right now.
    fn acquire_output_buffer(&mut self) -> Result<Option<OutputBuffer>, DecodeError>;

    fn return_buffer(
        &mut self,
        buffer: OutputBuffer,
        presentable: bool,
        properties: SampleProperties,
    ) -> Result<(), DecodeError>;
}

/// Decoder-side state reported with every output notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReadyStats {
    /// An output was produced, or the decoder is clean at end of data
    pub ready: bool,
    /// The renderer had no room for the next output
    pub output_stalled: bool,
    /// Inputs submitted and not yet returned by the decoder
    pub units_in_decoder: usize,
    pub earliest_pts: Option<MediaTime>,
    pub latest_pts: Option<MediaTime>,
    pub end_of_data: bool,
}

/// Upstream scheduling hooks (playback start / stall decisions).
pub trait DecoderListener: Send + Sync {
    /// Called right before the engine asks for the next input unit.
    fn on_input_needed(&self, stats: &BufferStats);

    /// Called after every output attempt. `ready == false` reports
    /// starvation (for instance while waiting for a sync point) or, with
    /// `output_stalled`, renderer back-pressure.
    fn on_output_ready(&self, stats: &DecodeReadyStats);
}
