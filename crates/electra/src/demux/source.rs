use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::reader::{Availability, ReceiveBuffer};
use super::request::{ByteRange, ResourceRequest};
use crate::error::TransportError;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Response metadata of a completed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchInfo {
    pub status: u16,
    pub content_length: Option<u64>,
}

/// Delivers resource bytes into a [`ReceiveBuffer`].
///
/// Implementations stream in chunks and stop with
/// [`TransportError::Aborted`] once [`ReceiveBuffer::append`] reports an
/// abort. They never call `finish` or `fail`; the caller does.
pub trait SegmentTransport: Send + Sync {
    fn fetch(&self, request: &ResourceRequest, sink: &ReceiveBuffer) -> Result<FetchInfo, TransportError>;
}

/// Fetches a whole resource on the calling thread.
pub fn fetch_all(transport: &dyn SegmentTransport, request: &ResourceRequest) -> Result<Bytes, TransportError> {
    let sink = ReceiveBuffer::new();
    transport.fetch(request, &sink)?;
    sink.finish();
    match sink.wait_available(usize::MAX, Duration::ZERO) {
        Availability::EndOfData { available } => Ok(sink.take(available)),
        Availability::Failed(err) => Err(err),
        Availability::Aborted => Err(TransportError::Aborted),
        Availability::Ready | Availability::TimedOut => {
            Err(TransportError::network("fetch ended without end of data"))
        }
    }
}

/// Bounds of `range` within a resource of `total` bytes.
fn resolve_range(range: Option<ByteRange>, total: u64, url: &str) -> Result<(u64, u64), TransportError> {
    let Some(range) = range else {
        return Ok((0, total));
    };
    if range.start > total || (range.start == total && total > 0) {
        return Err(TransportError::status(
            416,
            format!("range {range} outside {total} bytes of {url}"),
        ));
    }
    let end = range.end.map_or(total, |end| (end + 1).min(total));
    Ok((range.start, end.max(range.start)))
}

// --- File system ---

/// Serves plain paths and `file://` URLs from the local file system.
#[derive(Debug, Clone)]
pub struct FileTransport {
    root: Option<PathBuf>,
    chunk_size: usize,
}

impl Default for FileTransport {
    fn default() -> Self {
        Self {
            root: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl FileTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves relative paths against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl SegmentTransport for FileTransport {
    fn fetch(&self, request: &ResourceRequest, sink: &ReceiveBuffer) -> Result<FetchInfo, TransportError> {
        let path = self.resolve(&request.url);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransportError::not_found(request.url.clone()));
            }
            Err(e) => return Err(TransportError::network(format!("{}: {e}", path.display()))),
        };
        let io_error = |e: io::Error| TransportError::network(format!("{}: {e}", path.display()));

        let total = file.metadata().map_err(io_error)?.len();
        let (start, end) = resolve_range(request.range, total, &request.url)?;
        file.seek(SeekFrom::Start(start)).map_err(io_error)?;
        debug!(path = %path.display(), start, end, "Reading segment file");

        let mut remaining = end - start;
        let mut chunk = vec![0u8; self.chunk_size];
        while remaining > 0 {
            let want = (remaining as usize).min(chunk.len());
            let read = file.read(&mut chunk[..want]).map_err(io_error)?;
            if read == 0 {
                break;
            }
            if !sink.append(&chunk[..read]) {
                return Err(TransportError::Aborted);
            }
            remaining -= read as u64;
        }
        Ok(FetchInfo {
            status: if request.range.is_some() { 206 } else { 200 },
            content_length: Some(end - start),
        })
    }
}

// --- In memory ---

#[derive(Debug, Default)]
struct MemoryState {
    resources: HashMap<String, Bytes>,
    failures: HashMap<String, Vec<TransportError>>,
    fetches: HashMap<String, usize>,
}

/// Map of URL to bytes.
///
/// Scripted failures are returned, in order, by the next fetches of a URL.
/// An optional per-chunk delay simulates a slow link.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.state.lock().resources.insert(url.into(), data.into());
    }

    pub fn fail_next(&self, url: impl Into<String>, error: TransportError) {
        self.state
            .lock()
            .failures
            .entry(url.into())
            .or_default()
            .push(error);
    }

    /// Number of fetches of `url`, including failed ones.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.state.lock().fetches.get(url).copied().unwrap_or(0)
    }
}

impl SegmentTransport for MemoryTransport {
    fn fetch(&self, request: &ResourceRequest, sink: &ReceiveBuffer) -> Result<FetchInfo, TransportError> {
        let data = {
            let mut state = self.state.lock();
            *state.fetches.entry(request.url.clone()).or_default() += 1;
            if let Some(failures) = state.failures.get_mut(&request.url)
                && !failures.is_empty()
            {
                return Err(failures.remove(0));
            }
            state
                .resources
                .get(&request.url)
                .cloned()
                .ok_or_else(|| TransportError::not_found(request.url.clone()))?
        };

        let (start, end) = resolve_range(request.range, data.len() as u64, &request.url)?;
        let body = data.slice(start as usize..end as usize);
        for chunk in body.chunks(self.chunk_size) {
            if !self.chunk_delay.is_zero() {
                thread::sleep(self.chunk_delay);
            }
            if !sink.append(chunk) {
                return Err(TransportError::Aborted);
            }
        }
        Ok(FetchInfo {
            status: if request.range.is_some() { 206 } else { 200 },
            content_length: Some(body.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_transport_ranges_and_counts() {
        let transport = MemoryTransport::new().with_chunking(3, Duration::ZERO);
        transport.insert("a", Bytes::from_static(b"0123456789"));

        let whole = fetch_all(&transport, &ResourceRequest::new("a")).unwrap();
        assert_eq!(whole, Bytes::from_static(b"0123456789"));

        let ranged = ResourceRequest::new("a").with_range(ByteRange::new(2, Some(5)));
        assert_eq!(fetch_all(&transport, &ranged).unwrap(), Bytes::from_static(b"2345"));

        let open = ResourceRequest::new("a").with_range(ByteRange::new(7, None));
        assert_eq!(fetch_all(&transport, &open).unwrap(), Bytes::from_static(b"789"));
        assert_eq!(transport.fetch_count("a"), 3);
    }

    #[test]
    fn test_memory_transport_missing_and_scripted_failures() {
        let transport = MemoryTransport::new();
        let err = fetch_all(&transport, &ResourceRequest::new("nope")).unwrap_err();
        assert!(err.is_not_found());

        transport.insert("b", Bytes::from_static(b"x"));
        transport.fail_next("b", TransportError::status(503, "busy"));
        let err = fetch_all(&transport, &ResourceRequest::new("b")).unwrap_err();
        assert_eq!(err.http_status(), Some(503));
        assert!(fetch_all(&transport, &ResourceRequest::new("b")).is_ok());
    }

    #[test]
    fn test_range_past_end_is_rejected() {
        let transport = MemoryTransport::new();
        transport.insert("c", Bytes::from_static(b"abc"));
        let request = ResourceRequest::new("c").with_range(ByteRange::new(10, None));
        assert_eq!(fetch_all(&transport, &request).unwrap_err().http_status(), Some(416));
    }

    #[test]
    fn test_aborted_sink_stops_transfer() {
        let transport = MemoryTransport::new().with_chunking(1, Duration::ZERO);
        transport.insert("d", Bytes::from_static(b"abcdef"));
        let sink = ReceiveBuffer::new();
        sink.abort();
        let err = transport.fetch(&ResourceRequest::new("d"), &sink).unwrap_err();
        assert!(matches!(err, TransportError::Aborted));
    }

    #[test]
    fn test_file_transport() {
        let dir = std::env::temp_dir().join(format!("electra-file-transport-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = File::create(dir.join("seg.ts")).unwrap();
        file.write_all(b"hello segment").unwrap();
        drop(file);

        let transport = FileTransport::with_root(&dir).with_chunk_size(4);
        let data = fetch_all(&transport, &ResourceRequest::new("seg.ts")).unwrap();
        assert_eq!(data, Bytes::from_static(b"hello segment"));

        let url = format!("file://{}", dir.join("seg.ts").display());
        let ranged = ResourceRequest::new(url).with_range(ByteRange::new(6, Some(8)));
        assert_eq!(fetch_all(&transport, &ranged).unwrap(), Bytes::from_static(b"seg"));

        let missing = fetch_all(&transport, &ResourceRequest::new("missing.ts")).unwrap_err();
        assert!(missing.is_not_found());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
