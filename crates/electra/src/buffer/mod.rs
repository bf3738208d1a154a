//! Decodable-unit buffering: one bounded FIFO per track plus the
//! multi-track view the decode engine pulls from.

mod track_buffer;
mod unit_buffer;

pub use track_buffer::TrackBufferManager;
pub use unit_buffer::{BufferStats, UnitBuffer};
