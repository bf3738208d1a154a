// Electra: segment demultiplexing, per-track unit buffering and decoder driving
pub mod buffer;
pub mod config;
pub mod decode;
pub mod demux;
pub mod error;
pub mod unit;

// Export common types for ease of use
pub use buffer::{BufferStats, TrackBufferManager, UnitBuffer};
pub use config::{BufferConfig, BufferLimit, DecodeConfig, DemuxConfig, ElectraConfig};
pub use decode::{
    DecodeEngine, DecodeReadyStats, DecodeState, Decoder, DecoderFactory, DecoderListener,
    EngineControl, EngineExit, EngineHandle, RendererSink,
};
pub use demux::{
    ContainerFormat, DemuxEvent, DemuxRequest, DemuxerHandle, RegressionPolicy,
    SegmentDemultiplexer, SegmentRequest, SegmentTransport,
};
pub use error::{DecodeError, DemuxError, FormatErrorKind, TransportError};
pub use media_types::{MediaTime, Resolution, StreamType};
pub use unit::{CodecConfiguration, DecodableUnit, TrackIdentity};
