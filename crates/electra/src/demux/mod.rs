//! Segment demultiplexing: fetch, probe, parse, time mapping and emission
//! into the per-track buffers.

mod abr;
mod decrypt;
mod demuxer;
mod filler;
pub mod parser;
mod probe;
mod reader;
mod request;
mod retry;
mod source;
mod stats;
mod timestamp;

pub use abr::{AbrDecision, AbrFlags, AbrPolicy, BufferLevelAbr, DownloadProgress, PassiveAbr};
pub use decrypt::{Aes128CbcDecrypter, SegmentDecrypter};
pub use demuxer::{DemuxerHandle, InitCache, SegmentDemultiplexer};
pub use filler::{DurationAverage, FillerTemplate};
pub use probe::{ContainerFormat, PROBE_LEN};
pub use reader::{Availability, MediaReader, ReadObserver, ReceiveBuffer, SegmentReader, SliceReader};
pub use request::{ByteRange, DemuxRequest, ResourceRequest, SegmentRequest};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use source::{FetchInfo, FileTransport, MemoryTransport, SegmentTransport, fetch_all};
pub use stats::{DemuxEvent, SegmentDownloadStats, SegmentOutcome};
pub use timestamp::{MPEG_TIMESTAMP_BITS, RegressionGuard, RegressionPolicy, RolloverTracker, TimeMapping};
