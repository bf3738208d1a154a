use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use media_types::{MediaTime, StreamType};
use moka::sync::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::abr::{AbrFlags, AbrPolicy, DownloadProgress, PassiveAbr};
use super::filler::{DurationAverage, FillerTemplate};
use super::parser::{ContainerParser, ParsedSample, SampleParser, TrackInfo, lowest_track};
use super::probe::{ContainerFormat, PROBE_LEN};
use super::reader::{MediaReader, ReadObserver, ReceiveBuffer, SegmentReader};
use super::request::{DemuxRequest, ResourceRequest, SegmentRequest};
use super::retry::{RetryAction, retry_with_backoff};
use super::source::{SegmentTransport, fetch_all};
use super::stats::{DemuxEvent, SegmentDownloadStats, SegmentOutcome};
use super::timestamp::{RegressionGuard, RegressionPolicy, RolloverTracker, TimeMapping};
use crate::buffer::TrackBufferManager;
use crate::config::{BufferLimit, DemuxConfig, ElectraConfig};
use crate::error::{DemuxError, TransportError};
use crate::unit::{CodecConfiguration, DecodableUnit, TrackIdentity};

/// Init segments by URL and byte range. Clones share the same storage, so
/// one cache can serve the demultiplexers of every stream type.
pub type InitCache = Cache<ResourceRequest, Bytes>;

/// Per stream type state that outlives a single segment.
#[derive(Debug, Default)]
struct TrackState {
    rollover: Option<RolloverTracker>,
    durations: DurationAverage,
    codec: Option<Arc<CodecConfiguration>>,
    /// End of the latest unit pushed to the buffer
    next_expected: Option<MediaTime>,
    sequence_started: bool,
}

impl TrackState {
    fn update_codec(&mut self, codec: &Arc<CodecConfiguration>) {
        if self.codec.as_deref() != Some(codec.as_ref()) {
            self.codec = Some(Arc::clone(codec));
        }
    }
}

#[derive(Debug, Clone)]
struct SelectedTrack {
    stream_type: StreamType,
    timescale: u32,
    timestamp_bits: Option<u32>,
    identity: TrackIdentity,
}

/// Everything one segment download needs. Also the read observer, so ABR
/// decisions taken while waiting for bytes can act on the parsed units.
struct SegmentSession<'a> {
    request: &'a SegmentRequest,
    config: &'a DemuxConfig,
    limit: BufferLimit,
    sinks: &'a HashMap<StreamType, Arc<TrackBufferManager>>,
    tracks: &'a mut HashMap<StreamType, TrackState>,
    guard: &'a mut RegressionGuard,
    abr: &'a mut dyn AbrPolicy,
    token: &'a CancellationToken,
    network: &'a ReceiveBuffer,
    mapping: TimeMapping,
    started: Instant,
    last_report: Instant,

    selected: HashMap<u64, SelectedTrack>,
    pending: HashMap<StreamType, VecDeque<DecodableUnit>>,
    /// Stream types whose first unit passed the regression guard
    checked: HashSet<StreamType>,
    /// Stream types with at least one unit pushed in this segment
    emitted: HashSet<StreamType>,
    downloaded: MediaTime,
    delivered: MediaTime,

    emit_partial: bool,
    insert_filler: bool,
    abort_reason: Option<String>,
    skipped: bool,
}

impl SegmentSession<'_> {
    fn read_segment(&mut self, init: Option<&Bytes>, timeout: Duration) -> Result<(), DemuxError> {
        let request = self.request;
        let network = self.network;
        let mut reader = SegmentReader::new(network, request.url(), timeout, &mut *self);
        let Some(decrypter) = &request.decrypter else {
            return Self::demux(&mut reader, init);
        };

        let ciphertext = reader.read_to_end()?;
        drop(reader);
        let plain = decrypter.decrypt(ciphertext)?;
        debug!(
            stream_type = %request.stream_type,
            url = %request.resource,
            bytes = plain.len(),
            "Decrypted segment"
        );
        let clear = ReceiveBuffer::new();
        clear.append(&plain);
        clear.finish();
        let mut reader = SegmentReader::new(&clear, request.url(), timeout, &mut *self);
        Self::demux(&mut reader, init)
    }

    fn demux(reader: &mut SegmentReader<'_, Self>, init: Option<&Bytes>) -> Result<(), DemuxError> {
        let head = reader.peek(PROBE_LEN)?;
        let format = reader.observer().resolve_format(&head)?;
        let mut parser = ContainerParser::for_format(format);
        let tracks = parser.parse_header(init, reader)?;
        let ids = reader.observer().select(&tracks)?;
        parser.select_tracks(&ids);

        while let Some(sample) = parser.next_sample(reader)? {
            let session = reader.observer();
            session.accept(sample);
            if session.skipped {
                break;
            }
            session.report_progress(true)?;
        }
        Ok(())
    }

    fn resolve_format(&self, head: &[u8]) -> Result<ContainerFormat, DemuxError> {
        match (ContainerFormat::probe(head), self.request.format) {
            (Some(probed), Some(declared)) if probed != declared => {
                debug!(
                    stream_type = %self.request.stream_type,
                    url = %self.request.resource,
                    %declared,
                    %probed,
                    "Segment content differs from the declared container"
                );
                Ok(probed)
            }
            (Some(probed), _) => Ok(probed),
            (None, Some(declared)) => Ok(declared),
            (None, None) if head.is_empty() => Err(DemuxError::malformed_sample("empty segment")),
            (None, None) => Err(DemuxError::unknown_container(format!(
                "unrecognized segment signature {:02x?}",
                &head[..head.len().min(8)]
            ))),
        }
    }

    /// Picks the lowest-id track of every stream type that has a sink.
    fn select(&mut self, tracks: &[TrackInfo]) -> Result<Vec<u64>, DemuxError> {
        if lowest_track(tracks, self.request.stream_type).is_none() {
            return Err(DemuxError::MissingTrack {
                stream_type: self.request.stream_type,
            });
        }

        let mut ids = Vec::new();
        for (&stream_type, sink) in self.sinks {
            let Some(track) = lowest_track(tracks, stream_type) else {
                continue;
            };
            let identity = self.request.identity_for(stream_type);
            sink.select_track(self.request.selection_id, identity.clone());
            self.tracks.entry(stream_type).or_default().update_codec(&track.codec);
            debug!(
                stream_type = %stream_type,
                track_id = track.id,
                codec = %track.codec.codec,
                identity = %identity,
                "Selected track"
            );
            self.selected.insert(
                track.id,
                SelectedTrack {
                    stream_type,
                    timescale: track.timescale,
                    timestamp_bits: track.timestamp_bits,
                    identity,
                },
            );
            ids.push(track.id);
        }
        Ok(ids)
    }

    fn stream_types(&self) -> Vec<StreamType> {
        let selected: HashSet<StreamType> = self.selected.values().map(|t| t.stream_type).collect();
        if selected.is_empty() {
            return vec![self.request.stream_type];
        }
        StreamType::ALL
            .into_iter()
            .filter(|st| selected.contains(st))
            .collect()
    }

    fn window(&self) -> (MediaTime, MediaTime) {
        let (earliest, latest) = self.request.presentable_window();
        (self.mapping.map(earliest), self.mapping.map(latest))
    }

    /// Turns a parsed sample into a pending unit on the global timeline.
    fn accept(&mut self, sample: ParsedSample) {
        let Some(track) = self.selected.get(&sample.track_id).cloned() else {
            return;
        };
        let stream_type = track.stream_type;
        let (earliest, latest) = self.window();
        let divisor = self.config.rollover_detect_divisor;
        let state = self.tracks.entry(stream_type).or_default();

        let (pts, dts) = match track.timestamp_bits {
            Some(bits) => {
                let tracker = state
                    .rollover
                    .get_or_insert_with(|| RolloverTracker::new(bits, divisor));
                tracker.correct_pair(sample.pts, sample.dts)
            }
            None => (sample.pts, sample.dts),
        };
        let pts = self.mapping.map_ticks(pts, track.timescale);
        let dts = self.mapping.map_ticks(dts, track.timescale);
        let duration = if sample.duration > 0 {
            let duration = MediaTime::from_ticks(sample.duration as i64, track.timescale);
            state.durations.record(duration);
            duration
        } else {
            state
                .durations
                .average()
                .unwrap_or_else(|| stream_type.default_unit_duration())
        };

        let check = match self.config.regression_policy {
            RegressionPolicy::FirstUnitOnly => !self.checked.contains(&stream_type),
            RegressionPolicy::AnyUnit => true,
        };
        if check && !self.guard.admits(stream_type, pts) {
            warn!(
                stream_type = %stream_type,
                url = %self.request.resource,
                %pts,
                largest = ?self.guard.largest(stream_type),
                "Timestamp regression, skipping segment"
            );
            self.skipped = true;
            return;
        }
        self.checked.insert(stream_type);

        if let Some(codec) = &sample.codec {
            state.update_codec(codec);
        }
        let mut unit = DecodableUnit::new(stream_type, track.identity)
            .with_timing(pts, dts, duration)
            .with_window(earliest, latest)
            .with_payload(sample.payload)
            .with_sync(sample.sync);
        unit.sequence_index = self.request.sequence_index;
        unit.discardable = sample.discardable;
        unit.codec_config = state.codec.clone();

        if stream_type == self.request.stream_type {
            self.downloaded += duration;
        }
        self.pending.entry(stream_type).or_default().push_back(unit);
        if self.emit_partial {
            self.emit_early();
        }
    }

    /// Reports download progress to the ABR policy and applies its decision.
    fn report_progress(&mut self, force: bool) -> Result<(), DemuxError> {
        if self.token.is_cancelled() {
            return Err(DemuxError::Cancelled);
        }
        if !force && self.last_report.elapsed() < self.config.progress_interval() {
            return Ok(());
        }
        self.last_report = Instant::now();

        let progress = DownloadProgress {
            stream_type: self.request.stream_type,
            url: self.request.url().to_string(),
            bytes_downloaded: self.network.bytes_received(),
            elapsed: self.started.elapsed(),
            segment_duration: self.request.duration,
            downloaded_duration: self.downloaded,
            delivered_duration: self.delivered,
            buffered_duration: self
                .sinks
                .get(&self.request.stream_type)
                .map(|sink| sink.stats().playable_duration)
                .unwrap_or_default(),
        };
        let decision = self.abr.report_download_progress(&progress);

        if decision.contains(AbrFlags::INSERT_FILLER) {
            self.insert_filler = true;
        }
        if decision.contains(AbrFlags::ABORT) {
            let reason = decision
                .reason
                .unwrap_or_else(|| "aborted by ABR policy".to_string());
            info!(
                stream_type = %self.request.stream_type,
                url = %self.request.resource,
                reason = %reason,
                "Aborting segment download"
            );
            self.abort_reason = Some(reason);
            self.network.abort();
            return Err(DemuxError::Cancelled);
        }
        if decision.contains(AbrFlags::EMIT_PARTIAL) && !self.emit_partial {
            debug!(
                stream_type = %self.request.stream_type,
                reason = ?decision.reason,
                "Emitting units before the segment completes"
            );
            self.emit_partial = true;
        }
        if self.emit_partial {
            self.emit_early();
        }
        Ok(())
    }

    fn early_emission_allowed(&self) -> bool {
        self.config.regression_policy == RegressionPolicy::FirstUnitOnly
            && self
                .selected
                .values()
                .all(|track| self.checked.contains(&track.stream_type))
    }

    /// Pushes pending units without blocking. The newest unit of each track
    /// stays pending so the segment end can still be marked on it.
    fn emit_early(&mut self) {
        if !self.early_emission_allowed() {
            return;
        }
        let mut pending = std::mem::take(&mut self.pending);
        for queue in pending.values_mut() {
            while queue.len() > 1 {
                let Some(unit) = queue.pop_front() else {
                    break;
                };
                if let Err(unit) = self.try_deliver(unit) {
                    queue.push_front(unit);
                    break;
                }
            }
        }
        self.pending = pending;
    }

    /// Hands the unit back when its buffer is full.
    fn try_deliver(&mut self, mut unit: DecodableUnit) -> Result<(), DecodableUnit> {
        let Some(sink) = self.sinks.get(&unit.stream_type) else {
            return Ok(());
        };
        if unit.is_presentable() && unit.duration > self.limit.max_duration {
            warn!(
                stream_type = %unit.stream_type,
                pts = %unit.pts,
                duration = %unit.duration,
                capacity = %self.limit.max_duration,
                "Unit longer than the buffer capacity, dropping"
            );
            return Ok(());
        }

        let state = self.tracks.entry(unit.stream_type).or_default();
        if !state.sequence_started {
            unit.first_in_sequence = true;
        }
        let (stream_type, pts, end, duration, filler) =
            (unit.stream_type, unit.pts, unit.end_pts(), unit.duration, unit.filler);
        sink.push(unit, &self.limit)?;

        state.sequence_started = true;
        state.next_expected = Some(state.next_expected.map_or(end, |next| next.max(end)));
        if !filler {
            self.guard.record(stream_type, pts);
        }
        if stream_type == self.request.stream_type && !filler {
            self.delivered += duration;
        }
        self.emitted.insert(stream_type);
        Ok(())
    }

    /// Pushes a unit, waiting for buffer space until cancelled.
    fn deliver(&mut self, mut unit: DecodableUnit) -> Result<(), DemuxError> {
        loop {
            match self.try_deliver(unit) {
                Ok(()) => return Ok(()),
                Err(back) => unit = back,
            }
            if self.token.is_cancelled() {
                return Err(DemuxError::Cancelled);
            }
            if let Some(sink) = self.sinks.get(&unit.stream_type) {
                sink.wait_for_space(&unit.source, unit.duration, &self.limit, self.config.emit_wait());
            }
        }
    }

    /// Pushes every pending unit, marking the last primary unit when the
    /// segment ends its period.
    fn flush_pending(&mut self) -> Result<(), DemuxError> {
        if self.request.last_in_period
            && let Some(last) = self
                .pending
                .get_mut(&self.request.stream_type)
                .and_then(|queue| queue.back_mut())
        {
            last.last_in_period = true;
        }
        for stream_type in StreamType::ALL {
            let Some(queue) = self.pending.remove(&stream_type) else {
                continue;
            };
            for unit in queue {
                self.deliver(unit)?;
            }
        }
        Ok(())
    }

    /// Covers `[next expected, to)` of every selected track with filler.
    /// Returns whether any filler was pushed.
    fn fill_remainder(&mut self, to: MediaTime) -> Result<bool, DemuxError> {
        let segment_start = self.mapping.map(self.request.start);
        let (earliest, latest) = self.window();
        let mut inserted = false;
        for stream_type in self.stream_types() {
            let state = self.tracks.entry(stream_type).or_default();
            let from = match state.next_expected {
                Some(next) if self.emitted.contains(&stream_type) => next,
                _ => segment_start,
            };
            let mut template = FillerTemplate::new(stream_type, self.request.identity_for(stream_type));
            template.codec_config = state.codec.clone();
            template.sequence_index = self.request.sequence_index;
            template.earliest_pts = earliest;
            template.latest_pts = latest;
            let units = template.fill(from, to, state.durations.average().unwrap_or_default());
            if units.is_empty() {
                continue;
            }

            warn!(
                stream_type = %stream_type,
                url = %self.request.resource,
                %from,
                %to,
                units = units.len(),
                "Inserting filler"
            );
            for unit in units {
                self.deliver(unit)?;
            }
            inserted = true;
        }
        Ok(inserted)
    }

    /// Settles the segment outcome once reading has stopped.
    fn complete(&mut self, parsed: Result<(), DemuxError>, stats: &mut SegmentDownloadStats) {
        let segment_end = self.mapping.map(self.request.start + self.request.duration);
        let result = match parsed {
            Ok(()) if self.skipped => {
                self.pending.clear();
                stats.outcome = SegmentOutcome::Skipped;
                Ok(())
            }
            Ok(()) => self.flush_pending().and_then(|()| {
                if self.insert_filler {
                    stats.inserted_filler = self.fill_remainder(segment_end)?;
                }
                Ok(())
            }),
            Err(e) => Err(e),
        };
        let Err(error) = result else {
            return;
        };
        self.pending.clear();

        if let Some(reason) = self.abort_reason.clone() {
            stats.outcome = SegmentOutcome::Aborted;
            stats.failure_reason = Some(reason);
            if !self.emitted.is_empty() {
                stats.inserted_filler = self.fill_remainder(segment_end).unwrap_or(false);
            }
        } else if matches!(error, DemuxError::Cancelled) || self.token.is_cancelled() {
            stats.outcome = SegmentOutcome::Aborted;
            stats.failure_reason = Some(error.to_string());
        } else if self.request.may_be_missing && is_not_found(&error) && self.emitted.is_empty() {
            info!(
                stream_type = %self.request.stream_type,
                url = %self.request.resource,
                "Segment is missing, filling its duration"
            );
            stats.http_status = Some(404);
            match self.fill_remainder(segment_end) {
                Ok(inserted) => stats.inserted_filler = inserted,
                Err(e) => {
                    stats.outcome = SegmentOutcome::Aborted;
                    stats.failure_reason = Some(e.to_string());
                }
            }
        } else {
            warn!(
                stream_type = %self.request.stream_type,
                url = %self.request.resource,
                code = error.code(),
                error = %error,
                "Segment failed"
            );
            if !self.emitted.is_empty() {
                stats.inserted_filler = self.fill_remainder(segment_end).unwrap_or(false);
            }
            stats.fail(error);
        }
    }
}

impl ReadObserver for SegmentSession<'_> {
    fn on_idle(&mut self, _bytes_received: u64) -> Result<(), DemuxError> {
        self.report_progress(false)
    }
}

fn is_not_found(error: &DemuxError) -> bool {
    matches!(error, DemuxError::Transport { source, .. } if source.is_not_found())
}

/// Downloads and demultiplexes the segments of one stream type.
///
/// Units of the request's own stream type are required; other stream types
/// found in the segment (muxed audio in a video segment, say) are delivered
/// when a sink for them was registered with [`with_sink`](Self::with_sink).
pub struct SegmentDemultiplexer {
    stream_type: StreamType,
    config: DemuxConfig,
    limit: BufferLimit,
    transport: Arc<dyn SegmentTransport>,
    sinks: HashMap<StreamType, Arc<TrackBufferManager>>,
    abr: Box<dyn AbrPolicy>,
    init_cache: InitCache,
    token: CancellationToken,
    events: Option<Sender<DemuxEvent>>,
    tracks: HashMap<StreamType, TrackState>,
    guard: RegressionGuard,
    sequence_index: Option<u32>,
}

impl SegmentDemultiplexer {
    pub fn new(
        config: &ElectraConfig,
        transport: Arc<dyn SegmentTransport>,
        sink: Arc<TrackBufferManager>,
    ) -> Self {
        let stream_type = sink.stream_type();
        Self {
            stream_type,
            config: config.demux.clone(),
            limit: config.buffer.limit(),
            transport,
            sinks: HashMap::from([(stream_type, sink)]),
            abr: Box::new(PassiveAbr),
            init_cache: Cache::new(config.demux.init_cache_capacity),
            token: CancellationToken::new(),
            events: None,
            tracks: HashMap::new(),
            guard: RegressionGuard::new(),
            sequence_index: None,
        }
    }

    /// Also delivers units of `sink`'s stream type found in this
    /// demultiplexer's segments.
    pub fn with_sink(mut self, sink: Arc<TrackBufferManager>) -> Self {
        self.sinks.insert(sink.stream_type(), sink);
        self
    }

    pub fn with_abr(mut self, abr: impl AbrPolicy + 'static) -> Self {
        self.abr = Box::new(abr);
        self
    }

    pub fn with_events(mut self, events: Sender<DemuxEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_init_cache(mut self, cache: InitCache) -> Self {
        self.init_cache = cache;
        self
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn init_cache(&self) -> InitCache {
        self.init_cache.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn begin_sequence(&mut self, sequence_index: u32) {
        if self.sequence_index == Some(sequence_index) {
            return;
        }
        if let Some(previous) = self.sequence_index {
            debug!(
                stream_type = %self.stream_type,
                from = previous,
                to = sequence_index,
                "Sequence index changed"
            );
        }
        self.sequence_index = Some(sequence_index);
        self.guard.begin_sequence(sequence_index);
        for state in self.tracks.values_mut() {
            state.rollover = None;
            state.sequence_started = false;
        }
    }

    fn load_init(&self, request: &SegmentRequest) -> Result<Option<Bytes>, DemuxError> {
        let Some(init) = &request.init else {
            return Ok(None);
        };
        if let Some(bytes) = self.init_cache.get(init) {
            debug!(stream_type = %self.stream_type, url = %init, "Init segment cache hit");
            return Ok(Some(bytes));
        }

        let policy = self.config.init_retry_policy();
        let bytes = retry_with_backoff(&policy, &self.token, |_attempt| {
            match fetch_all(self.transport.as_ref(), init) {
                Ok(bytes) => RetryAction::Success(bytes),
                Err(e) if e.is_retryable() => RetryAction::Retry(DemuxError::transport(&init.url, e)),
                Err(e) => RetryAction::Fail(DemuxError::transport(&init.url, e)),
            }
        })?;
        debug!(
            stream_type = %self.stream_type,
            url = %init,
            bytes = bytes.len(),
            "Fetched init segment"
        );
        self.init_cache.insert(init.clone(), bytes.clone());
        Ok(Some(bytes))
    }

    /// Downloads, parses and emits one segment. Never fails: the outcome and
    /// any error are in the returned stats, which also go to the ABR policy
    /// and the event channel.
    pub fn process_segment(&mut self, request: &SegmentRequest) -> SegmentDownloadStats {
        let mut stats = SegmentDownloadStats::new(request.url(), request.stream_type);
        stats.quality_index = request.quality_index;
        stats.sequence_index = request.sequence_index;
        debug!(
            stream_type = %request.stream_type,
            url = %request.resource,
            sequence_index = request.sequence_index,
            start = %request.start,
            duration = %request.duration,
            "Processing segment"
        );
        self.begin_sequence(request.sequence_index);

        let init = match self.load_init(request) {
            Ok(init) => init,
            Err(e) => {
                warn!(
                    stream_type = %request.stream_type,
                    url = %request.resource,
                    error = %e,
                    "Init segment unavailable"
                );
                stats.fail(e);
                self.mark_boundaries(request, &[request.stream_type]);
                self.finish(stats.clone());
                return stats;
            }
        };

        let network = ReceiveBuffer::new();
        let transport = Arc::clone(&self.transport);
        let started = Instant::now();
        let read_timeout = self.config.read_timeout();
        let mut session = SegmentSession {
            request,
            config: &self.config,
            limit: self.limit,
            sinks: &self.sinks,
            tracks: &mut self.tracks,
            guard: &mut self.guard,
            abr: self.abr.as_mut(),
            token: &self.token,
            network: &network,
            mapping: TimeMapping::for_request(request),
            started,
            last_report: started,
            selected: HashMap::new(),
            pending: HashMap::new(),
            checked: HashSet::new(),
            emitted: HashSet::new(),
            downloaded: MediaTime::ZERO,
            delivered: MediaTime::ZERO,
            emit_partial: false,
            insert_filler: false,
            abort_reason: None,
            skipped: false,
        };

        let (parsed, fetched) = thread::scope(|scope| {
            let fetch = scope.spawn(|| {
                let result = transport.fetch(&request.resource, &network);
                match &result {
                    Ok(_) => network.finish(),
                    Err(e) => network.fail(e.clone()),
                }
                result
            });
            let parsed = session.read_segment(init.as_ref(), read_timeout);
            if parsed.is_err() || session.skipped {
                network.abort();
            }
            let fetched = fetch
                .join()
                .unwrap_or_else(|_| Err(TransportError::network("fetch thread panicked")));
            (parsed, fetched)
        });

        if let Ok(info) = &fetched {
            stats.http_status = Some(info.status);
        }
        stats.bytes_downloaded = network.bytes_received();
        stats.download_time = started.elapsed();
        session.complete(parsed, &mut stats);
        stats.downloaded_duration = session.downloaded;
        stats.delivered_duration = session.delivered;
        let touched = session.stream_types();
        drop(session);

        self.mark_boundaries(request, &touched);
        self.finish(stats.clone());
        stats
    }

    fn mark_boundaries(&self, request: &SegmentRequest, stream_types: &[StreamType]) {
        for stream_type in stream_types {
            if let Some(sink) = self.sinks.get(stream_type) {
                sink.mark_segment_boundary(&request.identity_for(*stream_type));
            }
        }
    }

    fn finish(&mut self, stats: SegmentDownloadStats) {
        self.abr.report_download_end(&stats);
        match stats.outcome {
            SegmentOutcome::Completed => debug!(
                stream_type = %stats.stream_type,
                url = %stats.url,
                bytes = stats.bytes_downloaded,
                download_ms = stats.download_time.as_millis() as u64,
                delivered = %stats.delivered_duration,
                filler = stats.inserted_filler,
                "Segment completed"
            ),
            SegmentOutcome::Skipped => info!(
                stream_type = %stats.stream_type,
                url = %stats.url,
                "Segment skipped"
            ),
            SegmentOutcome::Aborted => info!(
                stream_type = %stats.stream_type,
                url = %stats.url,
                reason = ?stats.failure_reason,
                filler = stats.inserted_filler,
                "Segment aborted"
            ),
            SegmentOutcome::Failed => warn!(
                stream_type = %stats.stream_type,
                url = %stats.url,
                reason = ?stats.failure_reason,
                "Segment failed"
            ),
        }
        if let Some(events) = &self.events
            && events.send(DemuxEvent::SegmentFinished(stats)).is_err()
        {
            debug!(stream_type = %self.stream_type, "Event receiver dropped");
        }
    }

    /// Marks end of data on every sink.
    pub fn end_of_stream(&mut self) {
        for sink in self.sinks.values() {
            sink.mark_end_of_data();
        }
        info!(stream_type = %self.stream_type, "End of stream");
        if let Some(events) = &self.events
            && events
                .send(DemuxEvent::EndOfStream {
                    stream_type: self.stream_type,
                })
                .is_err()
        {
            debug!(stream_type = %self.stream_type, "Event receiver dropped");
        }
    }

    /// Serves requests until the channel disconnects or the token is cancelled.
    pub fn run(mut self, requests: Receiver<DemuxRequest>) {
        info!(stream_type = %self.stream_type, "Demultiplexer started");
        let mut segments = 0u64;
        while !self.token.is_cancelled() {
            match requests.recv_timeout(self.config.request_poll()) {
                Ok(DemuxRequest::Segment(request)) => {
                    self.process_segment(&request);
                    segments += 1;
                }
                Ok(DemuxRequest::EndOfStream) => self.end_of_stream(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(stream_type = %self.stream_type, segments, "Demultiplexer stopped");
    }

    pub fn spawn(self) -> io::Result<DemuxerHandle> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stream_type = self.stream_type;
        let token = self.token.clone();
        let join = thread::Builder::new()
            .name(format!("electra-demux-{stream_type}"))
            .spawn(move || self.run(receiver))?;
        Ok(DemuxerHandle {
            stream_type,
            sender,
            token,
            join,
        })
    }
}

/// Owner side of a demultiplexer thread started with
/// [`SegmentDemultiplexer::spawn`].
pub struct DemuxerHandle {
    stream_type: StreamType,
    sender: Sender<DemuxRequest>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl DemuxerHandle {
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn request(&self, request: SegmentRequest) -> Result<(), DemuxError> {
        self.send(request.into())
    }

    pub fn end_of_stream(&self) -> Result<(), DemuxError> {
        self.send(DemuxRequest::EndOfStream)
    }

    fn send(&self, request: DemuxRequest) -> Result<(), DemuxError> {
        self.sender
            .send(request)
            .map_err(|_| DemuxError::internal("demultiplexer thread has stopped"))
    }

    /// Stops the thread after the segment in progress, dropping queued requests.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for queued requests to be served and the thread to exit.
    pub fn join(self) -> Result<(), DemuxError> {
        let Self { sender, join, .. } = self;
        drop(sender);
        join.join()
            .map_err(|_| DemuxError::internal("demultiplexer thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::demux::abr::AbrDecision;
    use crate::demux::decrypt::Aes128CbcDecrypter;
    use crate::demux::parser::mp4_fixtures::*;
    use crate::demux::parser::{build_adts_frame, build_timestamp_tag};
    use crate::demux::source::MemoryTransport;
    use crate::demux::timestamp::MPEG_TIMESTAMP_BITS;
    use parking_lot::Mutex;
    use rstest::rstest;

    const VIDEO: FixtureTrack = FixtureTrack {
        id: 1,
        handler: b"vide",
        timescale: 90_000,
    };
    const AUDIO: FixtureTrack = FixtureTrack {
        id: 2,
        handler: b"soun",
        timescale: 48_000,
    };
    /// 100 ms at 90 kHz
    const FRAME: u32 = 9_000;

    fn ms(v: i64) -> MediaTime {
        MediaTime::from_millis(v)
    }

    fn config() -> ElectraConfig {
        let mut config = ElectraConfig::default();
        config.demux.read_timeout_ms = 20;
        config.demux.progress_interval_ms = 60_000;
        config.demux.emit_wait_ms = 5;
        config.demux.init_retry_base_delay_ms = 1;
        config.demux.init_retry_max_delay_ms = 2;
        config
    }

    fn video_run(base_dts: u64, count: usize) -> FixtureRun {
        FixtureRun {
            track_id: 1,
            base_dts,
            samples: (0..count)
                .map(|i| FixtureSample::new(FRAME, &[i as u8; 8], i == 0))
                .collect(),
        }
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        sink: Arc<TrackBufferManager>,
        demuxer: SegmentDemultiplexer,
    }

    fn fixture(config: &ElectraConfig) -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("init.mp4", init_segment(&[VIDEO, AUDIO]));
        let sink = Arc::new(TrackBufferManager::new(StreamType::Video, &config.buffer));
        let demuxer = SegmentDemultiplexer::new(config, transport.clone(), Arc::clone(&sink));
        Fixture {
            transport,
            sink,
            demuxer,
        }
    }

    fn video_request(url: &str, start_ms: i64, duration_ms: i64) -> SegmentRequest {
        SegmentRequest::new(StreamType::Video, url)
            .with_init(ResourceRequest::new("init.mp4"))
            .with_format(ContainerFormat::Mp4)
            .with_timing(ms(start_ms), ms(duration_ms))
    }

    fn drain(sink: &TrackBufferManager) -> Vec<DecodableUnit> {
        std::iter::from_fn(|| sink.pop()).collect()
    }

    fn pts_ms(units: &[DecodableUnit]) -> Vec<i64> {
        units.iter().map(|u| u.pts.as_millis()).collect()
    }

    /// Replays scripted decisions, then proceeds.
    #[derive(Clone, Default)]
    struct ScriptedAbr {
        decisions: Arc<Mutex<VecDeque<AbrDecision>>>,
        finished: Arc<Mutex<Vec<SegmentOutcome>>>,
    }

    impl ScriptedAbr {
        fn new(decisions: Vec<AbrDecision>) -> Self {
            Self {
                decisions: Arc::new(Mutex::new(decisions.into())),
                ..Self::default()
            }
        }
    }

    impl AbrPolicy for ScriptedAbr {
        fn report_download_progress(&mut self, _progress: &DownloadProgress) -> AbrDecision {
            self.decisions.lock().pop_front().unwrap_or_default()
        }

        fn report_download_end(&mut self, stats: &SegmentDownloadStats) {
            self.finished.lock().push(stats.outcome);
        }
    }

    #[test]
    fn test_mp4_segment_is_mapped_and_pushed() {
        let config = config();
        let mut f = fixture(&config);
        f.transport
            .insert("seg1.m4s", media_segment(&[video_run(90_000, 3)]));
        let request = video_request("seg1.m4s", 1_000, 300)
            .with_timeline(ms(10_000), MediaTime::ZERO, MediaTime::ZERO, ms(1_000))
            .last_in_period(true);

        let stats = f.demuxer.process_segment(&request);
        assert!(stats.is_successful(), "{:?}", stats.failure_reason);
        assert_eq!(stats.http_status, Some(200));
        assert_eq!(stats.delivered_duration, ms(300));
        assert_eq!(stats.downloaded_duration, ms(300));

        let units = drain(&f.sink);
        // 1 s local - 1 s offset + 10 s period start
        assert_eq!(pts_ms(&units), vec![10_000, 10_100, 10_200]);
        assert!(units[0].sync && units[0].first_in_sequence);
        assert!(!units[1].sync && !units[1].first_in_sequence);
        assert!(units[2].last_in_period && !units[1].last_in_period);
        assert_eq!(units[0].source.as_str(), "video-q0");
        let codec = units[0].codec_config.as_ref().unwrap();
        assert_eq!(codec.codec, "avc1");
        assert_eq!(f.sink.stats().segment_boundaries, 1);
    }

    #[test]
    fn test_inverted_window_keeps_units_presentable() {
        let config = config();
        let mut f = fixture(&config);
        f.transport
            .insert("seg1.m4s", media_segment(&[video_run(90_000, 3)]));
        let mut request = video_request("seg1.m4s", 1_000, 300);
        request.earliest_pts = ms(1_100);
        request.latest_pts = ms(0);

        let stats = f.demuxer.process_segment(&request);
        assert!(stats.is_successful(), "{:?}", stats.failure_reason);
        let units = drain(&f.sink);
        let presentable: Vec<bool> = units.iter().map(|u| u.is_presentable()).collect();
        assert_eq!(presentable, vec![false, true, true]);
        assert!(units.iter().all(|u| u.latest_pts >= u.earliest_pts));
    }

    #[test]
    fn test_init_segment_is_cached_and_retried() {
        let config = config();
        let mut f = fixture(&config);
        f.transport
            .fail_next("init.mp4", TransportError::status(503, "busy"));
        f.transport.insert("seg1.m4s", media_segment(&[video_run(0, 2)]));
        f.transport
            .insert("seg2.m4s", media_segment(&[video_run(18_000, 2)]));

        assert!(f.demuxer.process_segment(&video_request("seg1.m4s", 0, 200)).is_successful());
        assert!(f.demuxer.process_segment(&video_request("seg2.m4s", 200, 200)).is_successful());
        assert_eq!(f.transport.fetch_count("init.mp4"), 2);
        assert_eq!(pts_ms(&drain(&f.sink)), vec![0, 100, 200, 300]);
    }

    #[test]
    fn test_muxed_audio_goes_to_its_own_sink() {
        let config = config();
        let f = fixture(&config);
        let audio = Arc::new(TrackBufferManager::new(StreamType::Audio, &config.buffer));
        let mut demuxer = f.demuxer.with_sink(Arc::clone(&audio));
        let audio_run = FixtureRun {
            track_id: 2,
            base_dts: 0,
            samples: vec![FixtureSample::new(1_024, &[7; 4], true); 2],
        };
        f.transport
            .insert("av.m4s", media_segment(&[video_run(0, 2), audio_run]));

        let stats = demuxer.process_segment(&video_request("av.m4s", 0, 200));
        assert!(stats.is_successful());
        assert_eq!(drain(&f.sink).len(), 2);
        let audio_units = drain(&audio);
        assert_eq!(audio_units.len(), 2);
        assert_eq!(audio_units[1].pts, MediaTime::from_ticks(1_024, 48_000));
        assert_eq!(audio_units[0].source.as_str(), "audio-q0");
        assert_eq!(audio_units[0].codec_config.as_ref().unwrap().sample_rate, Some(48_000));
    }

    #[test]
    fn test_missing_primary_track_fails() {
        let config = config();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("init.mp4", init_segment(&[AUDIO]));
        transport.insert(
            "seg.m4s",
            media_segment(&[FixtureRun {
                track_id: 2,
                base_dts: 0,
                samples: vec![FixtureSample::new(1_024, &[1], true)],
            }]),
        );
        let sink = Arc::new(TrackBufferManager::new(StreamType::Video, &config.buffer));
        let mut demuxer = SegmentDemultiplexer::new(&config, transport, Arc::clone(&sink));

        let stats = demuxer.process_segment(&video_request("seg.m4s", 0, 100));
        assert_eq!(stats.outcome, SegmentOutcome::Failed);
        assert_eq!(stats.error.as_ref().map(DemuxError::code), Some(2010));
        assert!(drain(&sink).is_empty());
    }

    #[test]
    fn test_regression_skips_segment_within_sequence() {
        let config = config();
        let mut f = fixture(&config);
        f.transport.insert("a.m4s", media_segment(&[video_run(0, 3)]));
        f.transport.insert("stale.m4s", media_segment(&[video_run(9_000, 2)]));

        assert!(f.demuxer.process_segment(&video_request("a.m4s", 0, 300)).is_successful());
        let stats = f.demuxer.process_segment(&video_request("stale.m4s", 100, 200));
        assert!(stats.was_skipped());
        assert!(!stats.inserted_filler);
        assert_eq!(drain(&f.sink).len(), 3);

        // A new sequence index starts a fresh comparison
        let stats = f
            .demuxer
            .process_segment(&video_request("stale.m4s", 100, 200).with_sequence(1));
        assert!(stats.is_successful());
        let units = drain(&f.sink);
        assert_eq!(pts_ms(&units), vec![100, 200]);
        assert!(units[0].first_in_sequence);
    }

    #[rstest]
    #[case(RegressionPolicy::FirstUnitOnly, SegmentOutcome::Completed)]
    #[case(RegressionPolicy::AnyUnit, SegmentOutcome::Skipped)]
    fn test_regression_policy(#[case] policy: RegressionPolicy, #[case] expected: SegmentOutcome) {
        let mut config = config();
        config.demux.regression_policy = policy;
        let mut f = fixture(&config);
        f.transport.insert("a.m4s", media_segment(&[video_run(0, 3)]));
        // The second unit is presented before the last unit of a.m4s
        let late = FixtureRun {
            track_id: 1,
            base_dts: 27_000,
            samples: vec![
                FixtureSample::new(FRAME, &[1], true),
                FixtureSample::new(FRAME, &[2], false).with_cto(-20_000),
            ],
        };
        f.transport.insert("b.m4s", media_segment(&[late]));

        assert!(f.demuxer.process_segment(&video_request("a.m4s", 0, 300)).is_successful());
        let stats = f.demuxer.process_segment(&video_request("b.m4s", 300, 200));
        assert_eq!(stats.outcome, expected);
    }

    #[test]
    fn test_missing_segment_is_filled() {
        let config = config();
        let mut f = fixture(&config);
        f.transport.insert("a.m4s", media_segment(&[video_run(0, 2)]));
        assert!(f.demuxer.process_segment(&video_request("a.m4s", 0, 200)).is_successful());

        let stats = f
            .demuxer
            .process_segment(&video_request("gone.m4s", 200, 250).may_be_missing(true));
        assert!(stats.is_successful());
        assert!(stats.inserted_filler);
        assert_eq!(stats.http_status, Some(404));

        let filler: Vec<DecodableUnit> = drain(&f.sink).into_iter().skip(2).collect();
        assert!(filler.iter().all(|u| u.filler && u.payload.is_empty()));
        let timing: Vec<(i64, i64)> = filler
            .iter()
            .map(|u| (u.pts.as_millis(), u.duration.as_millis()))
            .collect();
        // Average duration so far is 100 ms; the last unit is clamped
        assert_eq!(timing, vec![(200, 100), (300, 100), (400, 50)]);
        assert_eq!(filler[0].codec_config.as_ref().unwrap().codec, "avc1");
    }

    #[test]
    fn test_missing_segment_without_permission_fails() {
        let config = config();
        let mut f = fixture(&config);
        let stats = f.demuxer.process_segment(&video_request("gone.m4s", 0, 200));
        assert_eq!(stats.outcome, SegmentOutcome::Failed);
        assert_eq!(stats.http_status, Some(404));
        assert_eq!(stats.error.as_ref().map(DemuxError::code), Some(1404));
        assert!(drain(&f.sink).is_empty());
    }

    #[test]
    fn test_abort_after_partial_emission_fills_remainder() {
        let config = config();
        let f = fixture(&config);
        let abr = ScriptedAbr::new(vec![
            AbrDecision::emit_partial("buffer low"),
            AbrDecision::proceed(),
            AbrDecision::abort("too slow", false),
        ]);
        let mut demuxer = f.demuxer.with_abr(abr.clone());
        f.transport.insert("slow.m4s", media_segment(&[video_run(0, 4)]));

        let stats = demuxer.process_segment(&video_request("slow.m4s", 0, 400));
        assert!(stats.was_aborted());
        assert_eq!(stats.failure_reason.as_deref(), Some("too slow"));
        assert!(stats.inserted_filler);
        assert_eq!(stats.delivered_duration, ms(200));

        let units = drain(&f.sink);
        assert_eq!(pts_ms(&units), vec![0, 100, 200, 300]);
        assert!(!units[1].filler);
        assert!(units[2].filler && units[3].filler);
        assert_eq!(*abr.finished.lock(), vec![SegmentOutcome::Aborted]);
    }

    #[test]
    fn test_abort_without_emission_discards_units() {
        let mut config = config();
        config.demux.regression_policy = RegressionPolicy::AnyUnit;
        let f = fixture(&config);
        // Early emission never happens under AnyUnit
        let abr = ScriptedAbr::new(vec![
            AbrDecision::emit_partial("buffer low"),
            AbrDecision::emit_partial("buffer low"),
            AbrDecision::abort("too slow", true),
        ]);
        let mut demuxer = f.demuxer.with_abr(abr);
        f.transport.insert("slow.m4s", media_segment(&[video_run(0, 4)]));

        let stats = demuxer.process_segment(&video_request("slow.m4s", 0, 400));
        assert!(stats.was_aborted());
        assert!(!stats.inserted_filler);
        assert!(drain(&f.sink).is_empty());
    }

    #[test]
    fn test_probe_overrides_declared_format_and_unwraps_rollover() {
        let config = config();
        let transport = Arc::new(MemoryTransport::new());
        let sink = Arc::new(TrackBufferManager::new(StreamType::Audio, &config.buffer));
        let mut demuxer = SegmentDemultiplexer::new(&config, transport.clone(), Arc::clone(&sink));

        let period = 1i64 << MPEG_TIMESTAMP_BITS;
        let segment = |timestamp: i64| {
            let mut data = build_timestamp_tag(timestamp as u64);
            for _ in 0..2 {
                data.extend_from_slice(&build_adts_frame(&[0; 16], 3, 2));
            }
            data
        };
        transport.insert("a.aac", segment(period - 1_920));
        transport.insert("b.aac", segment(1_920));

        for url in ["a.aac", "b.aac"] {
            let request = SegmentRequest::new(StreamType::Audio, url).with_format(ContainerFormat::Ts);
            let stats = demuxer.process_segment(&request);
            assert!(stats.is_successful(), "{:?}", stats.failure_reason);
        }

        let pts: Vec<MediaTime> = drain(&sink).iter().map(|u| u.pts).collect();
        let expected: Vec<MediaTime> = [period - 1_920, period, period + 1_920, period + 3_840]
            .into_iter()
            .map(|ticks| MediaTime::from_ticks(ticks, 90_000))
            .collect();
        assert_eq!(pts, expected);
    }

    #[test]
    fn test_encrypted_segment_is_decrypted_before_parsing() {
        use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

        let config = config();
        let mut f = fixture(&config);
        let key = *b"0123456789abcdef";
        let iv = [3u8; 16];
        let plain = media_segment(&[video_run(0, 2)]);
        let ciphertext = cbc::Encryptor::<aes::Aes128>::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&plain);
        f.transport.insert("enc.m4s", ciphertext);

        let request = video_request("enc.m4s", 0, 200)
            .with_decrypter(Arc::new(Aes128CbcDecrypter::new(key, iv)));
        assert!(f.demuxer.process_segment(&request).is_successful());
        assert_eq!(pts_ms(&drain(&f.sink)), vec![0, 100]);

        let request = video_request("enc.m4s", 200, 200)
            .with_sequence(1)
            .with_decrypter(Arc::new(Aes128CbcDecrypter::new(*b"fedcba9876543210", iv)));
        let stats = f.demuxer.process_segment(&request);
        if stats.outcome == SegmentOutcome::Failed {
            assert!(matches!(stats.error, Some(DemuxError::Decryption { .. }) | Some(DemuxError::Format { .. })));
        }
    }

    #[test]
    fn test_units_longer_than_capacity_are_dropped() {
        let mut config = config();
        config.buffer = BufferConfig {
            max_duration_ms: 50,
            ..BufferConfig::default()
        };
        let mut f = fixture(&config);
        f.transport.insert("a.m4s", media_segment(&[video_run(0, 2)]));
        let stats = f.demuxer.process_segment(&video_request("a.m4s", 0, 200));
        assert!(stats.is_successful());
        assert!(drain(&f.sink).is_empty());
    }

    #[test]
    fn test_worker_serves_requests_and_reports_events() {
        let config = config();
        let f = fixture(&config);
        f.transport.insert("a.m4s", media_segment(&[video_run(0, 2)]));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let handle = f.demuxer.with_events(events_tx).spawn().unwrap();

        handle.request(video_request("a.m4s", 0, 200)).unwrap();
        handle.end_of_stream().unwrap();
        handle.join().unwrap();

        let events: Vec<DemuxEvent> = events_rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DemuxEvent::SegmentFinished(stats) if stats.is_successful()));
        assert!(matches!(
            events[1],
            DemuxEvent::EndOfStream {
                stream_type: StreamType::Video
            }
        ));
        assert_eq!(drain(&f.sink).len(), 2);
        assert!(f.sink.is_end_of_data());
    }

    #[test]
    fn test_end_of_stream_without_event_receiver() {
        let config = config();
        let f = fixture(&config);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        drop(events_rx);
        let mut demuxer = f.demuxer.with_events(events_tx);

        demuxer.end_of_stream();
        assert!(f.sink.is_end_of_data());
    }

    #[test]
    fn test_shutdown_stops_idle_worker() {
        let config = config();
        let f = fixture(&config);
        let handle = f.demuxer.spawn().unwrap();
        handle.shutdown();
        handle.join().unwrap();
    }
}
