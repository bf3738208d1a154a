use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use bytes_util::BytesCursorExt;
use parking_lot::{Condvar, Mutex};

use crate::error::{DemuxError, TransportError};

/// Largest piece consumed at once while skipping unread data.
const SKIP_CHUNK: u64 = 64 * 1024;

// --- Receive buffer ---

#[derive(Debug, Default)]
struct ReceiveState {
    data: BytesMut,
    received: u64,
    end_of_data: bool,
    aborted: bool,
    error: Option<TransportError>,
}

/// What a consumer wait found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready,
    TimedOut,
    /// The producer finished with fewer bytes than requested
    EndOfData { available: usize },
    Failed(TransportError),
    Aborted,
}

/// Byte pipe between a fetch thread and the parsing thread.
///
/// Abort, end of data and transport errors are sticky.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    state: Mutex<ReceiveState>,
    signal: Condvar,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Returns `false` once the consumer aborted, telling
    /// the producer to stop.
    pub fn append(&self, chunk: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.data.extend_from_slice(chunk);
        state.received += chunk.len() as u64;
        drop(state);
        self.signal.notify_all();
        true
    }

    pub fn finish(&self) {
        self.state.lock().end_of_data = true;
        self.signal.notify_all();
    }

    pub fn fail(&self, error: TransportError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        state.end_of_data = true;
        drop(state);
        self.signal.notify_all();
    }

    /// Stops the transfer and wakes every waiter.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.data.clear();
        drop(state);
        self.signal.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().end_of_data
    }

    pub fn bytes_received(&self) -> u64 {
        self.state.lock().received
    }

    /// Blocks until `len` unread bytes are available or `timeout` expires.
    pub fn wait_available(&self, len: usize, timeout: Duration) -> Availability {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Availability::Aborted;
            }
            if state.data.len() >= len {
                return Availability::Ready;
            }
            if let Some(error) = &state.error {
                return Availability::Failed(error.clone());
            }
            if state.end_of_data {
                return Availability::EndOfData {
                    available: state.data.len(),
                };
            }
            if self.signal.wait_until(&mut state, deadline).timed_out() {
                return if state.data.len() >= len {
                    Availability::Ready
                } else {
                    Availability::TimedOut
                };
            }
        }
    }

    /// Removes up to `len` unread bytes.
    pub fn take(&self, len: usize) -> Bytes {
        let mut state = self.state.lock();
        let len = len.min(state.data.len());
        state.data.split_to(len).freeze()
    }

    /// Copies up to `len` unread bytes without consuming them.
    pub fn peek(&self, len: usize) -> Bytes {
        let state = self.state.lock();
        let len = len.min(state.data.len());
        Bytes::copy_from_slice(&state.data[..len])
    }
}

// --- Readers ---

/// Sequential access to segment bytes, as seen by the format parsers.
pub trait MediaReader {
    /// Exactly `len` bytes, or `None` when the data ended cleanly before
    /// the first of them.
    fn read_exact(&mut self, len: usize) -> Result<Option<Bytes>, DemuxError>;

    /// Up to `len` bytes without consuming them; shorter only at end of data.
    fn peek(&mut self, len: usize) -> Result<Bytes, DemuxError>;

    fn skip(&mut self, len: u64) -> Result<(), DemuxError>;

    fn read_to_end(&mut self) -> Result<Bytes, DemuxError>;

    /// Offset of the next unread byte from the start of the segment
    fn position(&self) -> u64;

    /// Like [`read_exact`](Self::read_exact) but end of data is an error.
    fn read_required(&mut self, len: usize) -> Result<Bytes, DemuxError> {
        self.read_exact(len)?.ok_or_else(|| {
            DemuxError::malformed_sample(format!(
                "segment ended at offset {} while {len} more bytes were expected",
                self.position()
            ))
        })
    }
}

/// Hook invoked while a [`SegmentReader`] waits for bytes.
pub trait ReadObserver {
    /// Called after each read timeout. Returning an error ends the read.
    fn on_idle(&mut self, bytes_received: u64) -> Result<(), DemuxError>;
}

impl ReadObserver for () {
    fn on_idle(&mut self, _bytes_received: u64) -> Result<(), DemuxError> {
        Ok(())
    }
}

/// Reads a segment while it is still downloading.
pub struct SegmentReader<'a, O: ReadObserver> {
    buffer: &'a ReceiveBuffer,
    url: &'a str,
    timeout: Duration,
    position: u64,
    observer: &'a mut O,
}

impl<'a, O: ReadObserver> SegmentReader<'a, O> {
    pub fn new(buffer: &'a ReceiveBuffer, url: &'a str, timeout: Duration, observer: &'a mut O) -> Self {
        Self {
            buffer,
            url,
            timeout,
            position: 0,
            observer,
        }
    }

    pub fn observer(&mut self) -> &mut O {
        self.observer
    }

    /// `Some(n)` with the bytes available when data ended before `len`.
    fn wait(&mut self, len: usize) -> Result<Option<usize>, DemuxError> {
        loop {
            match self.buffer.wait_available(len, self.timeout) {
                Availability::Ready => return Ok(None),
                Availability::TimedOut => self.observer.on_idle(self.buffer.bytes_received())?,
                Availability::EndOfData { available } => return Ok(Some(available)),
                Availability::Failed(source) => {
                    return Err(DemuxError::transport(self.url, source));
                }
                Availability::Aborted => return Err(DemuxError::Cancelled),
            }
        }
    }

    fn truncated(&self, expected: u64) -> DemuxError {
        DemuxError::malformed_sample(format!(
            "segment truncated at offset {}, {expected} more bytes expected",
            self.position
        ))
    }
}

impl<O: ReadObserver> MediaReader for SegmentReader<'_, O> {
    fn read_exact(&mut self, len: usize) -> Result<Option<Bytes>, DemuxError> {
        match self.wait(len)? {
            None => {}
            Some(0) => return Ok(None),
            Some(_) => return Err(self.truncated(len as u64)),
        }
        let bytes = self.buffer.take(len);
        self.position += bytes.len() as u64;
        Ok(Some(bytes))
    }

    fn peek(&mut self, len: usize) -> Result<Bytes, DemuxError> {
        self.wait(len)?;
        Ok(self.buffer.peek(len))
    }

    fn skip(&mut self, len: u64) -> Result<(), DemuxError> {
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(SKIP_CHUNK) as usize;
            if let Some(available) = self.wait(want)? {
                self.position += self.buffer.take(available).len() as u64;
                return Err(self.truncated(remaining - available as u64));
            }
            let taken = self.buffer.take(want).len() as u64;
            self.position += taken;
            remaining -= taken;
        }
        Ok(())
    }

    fn read_to_end(&mut self) -> Result<Bytes, DemuxError> {
        // No segment holds usize::MAX bytes, so this waits for end of data.
        let available = self.wait(usize::MAX)?.unwrap_or(usize::MAX);
        let bytes = self.buffer.take(available);
        self.position += bytes.len() as u64;
        Ok(bytes)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Reads from bytes already in memory.
#[derive(Debug, Clone)]
pub struct SliceReader {
    cursor: io::Cursor<Bytes>,
}

impl SliceReader {
    pub fn new(data: Bytes) -> Self {
        Self {
            cursor: io::Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }
}

impl MediaReader for SliceReader {
    fn read_exact(&mut self, len: usize) -> Result<Option<Bytes>, DemuxError> {
        if self.cursor.remaining() == 0 && len > 0 {
            return Ok(None);
        }
        Ok(Some(self.cursor.extract_bytes(len)?))
    }

    fn peek(&mut self, len: usize) -> Result<Bytes, DemuxError> {
        let start = self.cursor.position() as usize;
        let end = start.saturating_add(len).min(self.cursor.get_ref().len());
        Ok(self.cursor.get_ref().slice(start..end))
    }

    fn skip(&mut self, len: u64) -> Result<(), DemuxError> {
        let len = usize::try_from(len)
            .map_err(|_| DemuxError::malformed_sample("skip length exceeds address space"))?;
        Ok(self.cursor.skip_bytes(len)?)
    }

    fn read_to_end(&mut self) -> Result<Bytes, DemuxError> {
        Ok(self.cursor.extract_remaining())
    }

    fn position(&self) -> u64 {
        self.cursor.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(5);

    struct CountingObserver {
        idle_calls: usize,
        fail_after: Option<usize>,
    }

    impl ReadObserver for CountingObserver {
        fn on_idle(&mut self, _bytes_received: u64) -> Result<(), DemuxError> {
            self.idle_calls += 1;
            match self.fail_after {
                Some(limit) if self.idle_calls >= limit => Err(DemuxError::Cancelled),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_reads_across_chunks_from_producer_thread() {
        let buffer = Arc::new(ReceiveBuffer::new());
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for chunk in [&b"abc"[..], b"def", b"gh"] {
                    thread::sleep(Duration::from_millis(2));
                    assert!(buffer.append(chunk));
                }
                buffer.finish();
            })
        };

        let mut observer = ();
        let mut reader = SegmentReader::new(&buffer, "seg", WAIT, &mut observer);
        assert_eq!(reader.peek(2).unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(reader.read_required(4).unwrap(), Bytes::from_static(b"abcd"));
        reader.skip(2).unwrap();
        assert_eq!(reader.position(), 6);
        assert_eq!(reader.read_to_end().unwrap(), Bytes::from_static(b"gh"));
        assert_eq!(reader.read_exact(1).unwrap(), None);
        producer.join().unwrap();
        assert_eq!(buffer.bytes_received(), 8);
    }

    #[test]
    fn test_truncated_read_is_malformed() {
        let buffer = ReceiveBuffer::new();
        buffer.append(b"abc");
        buffer.finish();
        let mut observer = ();
        let mut reader = SegmentReader::new(&buffer, "seg", WAIT, &mut observer);
        let err = reader.read_exact(8).unwrap_err();
        assert_eq!(err.code(), 2003);
    }

    #[test]
    fn test_transport_failure_surfaces_with_url() {
        let buffer = ReceiveBuffer::new();
        buffer.fail(TransportError::not_found("seg"));
        let mut observer = ();
        let mut reader = SegmentReader::new(&buffer, "http://cdn/seg", WAIT, &mut observer);
        match reader.read_exact(4) {
            Err(DemuxError::Transport { url, source }) => {
                assert_eq!(url, "http://cdn/seg");
                assert!(source.is_not_found());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_observer_runs_while_waiting_and_can_stop_the_read() {
        let buffer = ReceiveBuffer::new();
        let mut observer = CountingObserver {
            idle_calls: 0,
            fail_after: Some(3),
        };
        let mut reader = SegmentReader::new(&buffer, "seg", WAIT, &mut observer);
        assert!(matches!(reader.read_exact(1), Err(DemuxError::Cancelled)));
        assert_eq!(observer.idle_calls, 3);
    }

    #[test]
    fn test_abort_wakes_reader_and_stops_producer() {
        let buffer = Arc::new(ReceiveBuffer::new());
        let aborter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                buffer.abort();
            })
        };
        let mut observer = ();
        let mut reader = SegmentReader::new(&buffer, "seg", Duration::from_secs(5), &mut observer);
        assert!(matches!(reader.read_exact(1), Err(DemuxError::Cancelled)));
        aborter.join().unwrap();
        assert!(!buffer.append(b"late"));
    }

    #[test]
    fn test_slice_reader() {
        let mut reader = SliceReader::new(Bytes::from_static(b"0123456789"));
        assert_eq!(reader.peek(3).unwrap(), Bytes::from_static(b"012"));
        assert_eq!(reader.read_required(4).unwrap(), Bytes::from_static(b"0123"));
        reader.skip(2).unwrap();
        assert_eq!(reader.position(), 6);
        assert!(reader.read_exact(10).is_err());
        assert_eq!(reader.read_to_end().unwrap(), Bytes::from_static(b"6789"));
        assert_eq!(reader.read_exact(1).unwrap(), None);
        assert!(reader.skip(1).is_err());
        assert_eq!(reader.peek(4).unwrap(), Bytes::new());
    }
}
