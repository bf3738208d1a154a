use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use media_types::{MediaTime, StreamType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::arena::{Holders, UnitArena, UnitKey};
use super::metrics::EngineMetrics;
use super::{
    Compatibility, DecodeReadyStats, DecodedOutput, Decoder, DecoderFactory, DecoderInput,
    DecoderListener, OutputStatus, RendererSink, SampleProperties, SubmitMode, SubmitStatus,
};
use crate::buffer::TrackBufferManager;
use crate::config::DecodeConfig;
use crate::error::DecodeError;
use crate::unit::{CodecConfiguration, DecodableUnit, TrackIdentity};

/// Outputs lagging the newest matched output by more than this many
/// correlations are treated as dropped inside the decoder.
const MAX_OUTPUT_LAG: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    NormalDecoding,
    Draining,
    NeedsReset,
    /// Terminal: the surrounding session must rebuild the decoder
    CodecChange,
    ReplayDecoding,
}

/// Why [`DecodeEngine::run`] returned.
#[derive(Debug)]
pub enum EngineExit {
    Terminated,
    /// The codec changed. `pending` is the first unit of the new codec, to
    /// be handed to the replacement engine.
    CodecChange { pending: Option<DecodableUnit> },
}

#[derive(Debug, Default)]
struct ControlState {
    token: CancellationToken,
    suspended: AtomicBool,
    flush_requested: AtomicBool,
}

/// Thread-safe handle for host-level control of a running engine.
#[derive(Debug, Clone, Default)]
pub struct EngineControl {
    inner: Arc<ControlState>,
}

impl EngineControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ControlState {
                token,
                ..ControlState::default()
            }),
        }
    }

    pub fn terminate(&self) {
        self.inner.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Host backgrounding. Observed between decoder calls.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// Discards all decoder state. Decoding restarts at the next sync point.
    pub fn flush(&self) {
        self.inner.flush_requested.store(true, Ordering::Release);
    }

    fn take_flush_request(&self) -> bool {
        self.inner.flush_requested.swap(false, Ordering::AcqRel)
    }
}

/// A decode engine running on its own thread.
pub struct EngineHandle {
    control: EngineControl,
    metrics: Arc<EngineMetrics>,
    join: JoinHandle<Result<EngineExit, DecodeError>>,
}

impl EngineHandle {
    pub fn control(&self) -> &EngineControl {
        &self.control
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<EngineExit, DecodeError> {
        self.join
            .join()
            .unwrap_or_else(|_| Err(DecodeError::decoder("decode thread panicked")))
    }
}

#[derive(Debug, Clone)]
struct LastInput {
    source: TrackIdentity,
    dts: MediaTime,
    sequence_index: u32,
    filler: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputProgress {
    Idle,
    Blocked,
    Delivered,
    EndOfData,
}

/// Per stream-type decode worker.
///
/// Each [`step`](Self::step) fetches at most one input unit, advances the
/// state machine by one action and delivers at most one output. Units are
/// owned by an arena; the replay history is a bounded ring of arena keys
/// cleared at every sync point.
pub struct DecodeEngine {
    stream_type: StreamType,
    config: DecodeConfig,
    buffers: Arc<TrackBufferManager>,
    factory: Box<dyn DecoderFactory>,
    renderer: Box<dyn RendererSink>,
    listener: Option<Arc<dyn DecoderListener>>,
    control: EngineControl,
    metrics: Arc<EngineMetrics>,

    decoder: Option<Box<dyn Decoder>>,
    state: DecodeState,
    after_drain: DecodeState,
    drain_needs_end_of_input: bool,
    end_of_input_sent: bool,
    /// No input has been sent since the last drain
    is_clean: bool,

    arena: UnitArena,
    current: Option<UnitKey>,
    pending: BTreeMap<u64, UnitKey>,
    held_output: Option<(DecodedOutput, UnitKey)>,
    history: VecDeque<UnitKey>,
    history_overflowed: bool,
    replay_queue: VecDeque<UnitKey>,
    next_correlation: u64,

    active_config: Option<Arc<CodecConfiguration>>,
    last_input: Option<LastInput>,
    wait_for_sync: bool,
    missing_sync_logged: bool,
    end_of_data_reported: bool,
    exit_on_end_of_data: bool,
}

impl DecodeEngine {
    pub fn new(
        stream_type: StreamType,
        config: &DecodeConfig,
        buffers: Arc<TrackBufferManager>,
        factory: Box<dyn DecoderFactory>,
        renderer: Box<dyn RendererSink>,
    ) -> Self {
        Self {
            stream_type,
            config: config.clone(),
            buffers,
            factory,
            renderer,
            listener: None,
            control: EngineControl::default(),
            metrics: Arc::new(EngineMetrics::new()),
            decoder: None,
            state: DecodeState::NormalDecoding,
            after_drain: DecodeState::NormalDecoding,
            drain_needs_end_of_input: false,
            end_of_input_sent: false,
            is_clean: true,
            arena: UnitArena::new(),
            current: None,
            pending: BTreeMap::new(),
            held_output: None,
            history: VecDeque::new(),
            history_overflowed: false,
            replay_queue: VecDeque::new(),
            next_correlation: 0,
            active_config: None,
            last_input: None,
            wait_for_sync: true,
            missing_sync_logged: false,
            end_of_data_reported: false,
            exit_on_end_of_data: false,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn DecoderListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Return [`EngineExit::Terminated`] once the input is exhausted and the
    /// decoder fully drained, instead of waiting for more data.
    pub fn exit_on_end_of_data(mut self, exit: bool) -> Self {
        self.exit_on_end_of_data = exit;
        self
    }

    pub fn with_control(mut self, control: EngineControl) -> Self {
        self.control = control;
        self
    }

    /// Starts with `unit` as the first input, for instance the unit handed
    /// back by a previous engine's [`EngineExit::CodecChange`].
    pub fn with_initial_unit(mut self, unit: DecodableUnit) -> Self {
        self.accept_input(unit);
        self
    }

    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Units submitted whose output has not been received yet.
    pub fn pending_inputs(&self) -> usize {
        self.pending.len()
    }

    pub fn replay_history_len(&self) -> usize {
        self.history.len()
    }

    pub fn replay_queue_len(&self) -> usize {
        self.replay_queue.len()
    }

    pub fn spawn(self) -> io::Result<EngineHandle> {
        let control = self.control.clone();
        let metrics = Arc::clone(&self.metrics);
        let join = thread::Builder::new()
            .name(format!("electra-decode-{}", self.stream_type))
            .spawn(move || self.run())?;
        Ok(EngineHandle {
            control,
            metrics,
            join,
        })
    }

    pub fn run(mut self) -> Result<EngineExit, DecodeError> {
        info!(stream_type = %self.stream_type, "Decode engine started");
        let result = loop {
            match self.step() {
                Ok(Some(exit)) => break Ok(exit),
                Ok(None) => {}
                Err(e) => {
                    error!(stream_type = %self.stream_type, error = %e, "Decode engine failed");
                    break Err(e);
                }
            }
        };
        debug!(
            stream_type = %self.stream_type,
            live_units = self.arena.len(),
            "Decode engine stopped"
        );
        self.metrics.log_summary(self.stream_type);
        result
    }

    /// Advances the engine by one iteration.
    pub fn step(&mut self) -> Result<Option<EngineExit>, DecodeError> {
        if self.control.is_terminated() {
            return Ok(Some(EngineExit::Terminated));
        }
        if self.control.is_suspended() {
            self.wait_while_suspended();
            return Ok(None);
        }
        if self.control.take_flush_request() {
            self.flush_decoder_state();
        }

        if self.state == DecodeState::NormalDecoding && self.current.is_none() {
            self.fetch_input();
            if self.exit_on_end_of_data && self.end_of_data_reported {
                return Ok(Some(EngineExit::Terminated));
            }
        }

        match self.state {
            DecodeState::NormalDecoding => {
                self.handle_output()?;
                self.decode_current()?;
            }
            DecodeState::Draining => self.drain_step()?,
            DecodeState::NeedsReset => self.reset_decoder(),
            DecodeState::ReplayDecoding => self.replay_step()?,
            DecodeState::CodecChange => {
                let pending = self.current.take().and_then(|key| {
                    let unit = self.arena.get(key).cloned();
                    self.arena.release(key, Holders::INPUT);
                    unit
                });
                return Ok(Some(EngineExit::CodecChange { pending }));
            }
        }
        Ok(None)
    }

    fn wait_while_suspended(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.suspend();
        }
        debug!(stream_type = %self.stream_type, "Decode engine suspended");
        while self.control.is_suspended() && !self.control.is_terminated() {
            thread::sleep(self.config.suspend_poll());
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.resume();
        }
        debug!(stream_type = %self.stream_type, "Decode engine resumed");
    }

    fn notify_output_ready(&self, ready: bool, output_stalled: bool) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let pts = self
            .pending
            .values()
            .filter_map(|key| self.arena.get(*key))
            .map(|unit| unit.pts);
        let (earliest_pts, latest_pts) = pts.fold((None, None), |(lo, hi), pts| {
            (
                Some(lo.map_or(pts, |lo: MediaTime| lo.min(pts))),
                Some(hi.map_or(pts, |hi: MediaTime| hi.max(pts))),
            )
        });
        listener.on_output_ready(&DecodeReadyStats {
            ready,
            output_stalled,
            units_in_decoder: self.pending.len(),
            earliest_pts,
            latest_pts,
            end_of_data: self.end_of_data_reported,
        });
    }

    // --- Input ---

    fn fetch_input(&mut self) {
        if let Some(listener) = self.listener.as_ref() {
            listener.on_input_needed(&self.buffers.stats());
        }
        if !self.buffers.wait_for_data(self.config.input_wait()) {
            if self.buffers.is_end_of_data() {
                self.on_end_of_data();
            }
            return;
        }
        let Some(unit) = self.buffers.pop() else {
            return;
        };
        self.end_of_data_reported = false;
        self.accept_input(unit);
    }

    fn on_end_of_data(&mut self) {
        if !self.is_clean {
            debug!(stream_type = %self.stream_type, "End of data, draining decoder");
            self.start_draining(DecodeState::NormalDecoding);
        } else if !self.end_of_data_reported {
            self.end_of_data_reported = true;
            self.notify_output_ready(true, false);
        } else {
            thread::sleep(self.config.input_wait());
        }
    }

    fn accept_input(&mut self, unit: DecodableUnit) {
        let threshold = self.config.backward_jump_threshold();
        let discontinuity = self.last_input.as_ref().is_some_and(|last| {
            last.source != unit.source
                || last.sequence_index != unit.sequence_index
                || last.filler != unit.filler
                || last.dts - unit.dts > threshold
        });
        self.last_input = Some(LastInput {
            source: unit.source.clone(),
            dts: unit.dts,
            sequence_index: unit.sequence_index,
            filler: unit.filler,
        });

        let new_config = unit
            .changes_config(self.active_config.as_ref())
            .then(|| unit.codec_config.clone())
            .flatten();
        if unit.sync && !unit.filler {
            self.clear_history();
        }
        self.current = Some(self.arena.insert(unit));

        if let Some(new_config) = new_config {
            let next = self.config_change_state(&new_config);
            self.active_config = Some(new_config);
            if let Some(next) = next {
                self.start_draining(next);
                return;
            }
        }
        if discontinuity {
            debug!(stream_type = %self.stream_type, "Discontinuity, draining decoder");
            self.start_draining(DecodeState::NormalDecoding);
        }
    }

    /// State to enter once the decoder is drained for `new`, or `None` to
    /// continue without draining.
    fn config_change_state(&self, new: &CodecConfiguration) -> Option<DecodeState> {
        let decoder = self.decoder.as_ref()?;
        if let Some(old) = self.active_config.as_ref()
            && old.codec != new.codec
        {
            info!(
                stream_type = %self.stream_type,
                from = %old.codec,
                to = %new.codec,
                "Codec changed"
            );
            return Some(DecodeState::CodecChange);
        }
        if decoder.is_adaptive() {
            return None;
        }
        match decoder.is_compatible_with(new) {
            Compatibility::Compatible => None,
            Compatibility::Drain => Some(DecodeState::NormalDecoding),
            Compatibility::DrainAndReset => Some(DecodeState::NeedsReset),
        }
    }

    // --- Decoding ---

    fn ensure_decoder(&mut self) -> Result<(), DecodeError> {
        if self.decoder.is_some() {
            return Ok(());
        }
        let Some(config) = self.active_config.clone() else {
            return Err(DecodeError::decoder_creation(
                "unknown",
                "no codec configuration available",
            ));
        };
        let decoder = self.factory.create(&config)?;
        info!(stream_type = %self.stream_type, codec = %config.codec, "Created decoder");
        self.decoder = Some(decoder);
        self.is_clean = true;
        Ok(())
    }

    fn drop_current(&mut self, key: UnitKey) {
        self.current = None;
        self.arena.release(key, Holders::INPUT);
        EngineMetrics::incr(&self.metrics.discarded);
    }

    fn decode_current(&mut self) -> Result<(), DecodeError> {
        let Some(key) = self.current else {
            return Ok(());
        };
        let Some(unit) = self.arena.get(key) else {
            self.current = None;
            return Ok(());
        };
        let presentable = unit.is_presentable();
        let (filler, discardable, sync, last_in_period, pts) = (
            unit.filler,
            unit.discardable,
            unit.sync,
            unit.last_in_period,
            unit.pts,
        );

        if filler {
            return self.emit_dummy(key);
        }

        if discardable && !presentable {
            self.drop_current(key);
            if last_in_period {
                self.start_draining(DecodeState::NormalDecoding);
            }
            return Ok(());
        }

        if self.wait_for_sync && !sync {
            if !self.missing_sync_logged {
                self.missing_sync_logged = true;
                warn!(
                    stream_type = %self.stream_type,
                    pts = %pts,
                    "No sync point at start of decoding, dropping units until one arrives"
                );
            }
            self.drop_current(key);
            self.notify_output_ready(false, false);
            if last_in_period {
                self.start_draining(DecodeState::NormalDecoding);
            }
            return Ok(());
        }

        self.ensure_decoder()?;
        let correlation = self.next_correlation;
        let status = match (self.arena.get(key), self.decoder.as_mut()) {
            (Some(unit), Some(decoder)) => decoder.submit(DecoderInput {
                unit,
                correlation,
                mode: SubmitMode::Normal,
            }),
            _ => return Ok(()),
        };

        match status {
            SubmitStatus::Accepted => {
                self.next_correlation += 1;
                self.current = None;
                self.pending.insert(correlation, key);
                self.is_clean = false;
                self.wait_for_sync = false;
                self.missing_sync_logged = false;
                EngineMetrics::incr(&self.metrics.submitted);
                if !discardable {
                    self.retain_for_replay(key);
                }
                if last_in_period {
                    self.start_draining(DecodeState::NormalDecoding);
                }
            }
            SubmitStatus::NoBufferSpace | SubmitStatus::EndOfData => {
                thread::sleep(self.config.backpressure_wait());
            }
            SubmitStatus::DecoderLost => self.enter_replay(),
            SubmitStatus::Fatal(reason) => return Err(DecodeError::decoder(reason)),
        }
        Ok(())
    }

    fn emit_dummy(&mut self, key: UnitKey) -> Result<(), DecodeError> {
        if !self.renderer.can_receive_frames(1) {
            self.notify_output_ready(false, true);
            thread::sleep(self.config.backpressure_wait());
            return Ok(());
        }
        let Some(mut buffer) = self.renderer.acquire_output_buffer()? else {
            self.notify_output_ready(false, true);
            thread::sleep(self.config.backpressure_wait());
            return Ok(());
        };
        let Some(unit) = self.arena.get(key) else {
            self.current = None;
            return Ok(());
        };
        let properties = SampleProperties::for_unit(unit);
        let last_in_period = unit.last_in_period;
        buffer.data.clear();
        self.renderer.return_buffer(buffer, true, properties)?;

        self.current = None;
        self.arena.release(key, Holders::INPUT);
        EngineMetrics::incr(&self.metrics.dummies);
        self.clear_history();
        if last_in_period {
            self.start_draining(DecodeState::NormalDecoding);
        }
        Ok(())
    }

    // --- Output ---

    fn handle_output(&mut self) -> Result<OutputProgress, DecodeError> {
        if let Some((output, key)) = self.held_output.take() {
            return self.deliver(output, key);
        }
        if !self.renderer.can_receive_frames(1) {
            self.notify_output_ready(false, true);
            return Ok(OutputProgress::Blocked);
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(OutputProgress::Idle);
        };
        match decoder.request_output()? {
            OutputStatus::TryAgain => Ok(OutputProgress::Idle),
            OutputStatus::EndOfData => Ok(OutputProgress::EndOfData),
            OutputStatus::Available(output) => {
                let key = self.match_output(output.correlation)?;
                EngineMetrics::incr(&self.metrics.decoded);
                self.deliver(output, key)
            }
        }
    }

    /// Finds the input an output belongs to. Outputs may arrive out of
    /// submission order, so the search is by correlation value.
    fn match_output(&mut self, correlation: u64) -> Result<UnitKey, DecodeError> {
        if self
            .pending
            .first_key_value()
            .is_some_and(|(first, _)| *first == correlation)
        {
            if let Some((_, key)) = self.pending.pop_first() {
                return Ok(key);
            }
        }
        let Some(key) = self.pending.remove(&correlation) else {
            return Err(DecodeError::UnmatchedOutput { correlation });
        };

        let horizon = correlation.saturating_sub(MAX_OUTPUT_LAG);
        let stale: Vec<u64> = self.pending.range(..horizon).map(|(c, _)| *c).collect();
        if !stale.is_empty() {
            debug!(
                stream_type = %self.stream_type,
                count = stale.len(),
                "Pruning inputs the decoder never returned"
            );
            for c in stale {
                if let Some(stale_key) = self.pending.remove(&c) {
                    self.arena.release(stale_key, Holders::INPUT);
                    EngineMetrics::incr(&self.metrics.discarded);
                }
            }
        }
        Ok(key)
    }

    fn deliver(&mut self, output: DecodedOutput, key: UnitKey) -> Result<OutputProgress, DecodeError> {
        let Some(unit) = self.arena.get(key) else {
            return Err(DecodeError::decoder(format!(
                "output {} refers to a released unit",
                output.correlation
            )));
        };
        if !unit.is_presentable() {
            self.arena.release(key, Holders::INPUT);
            EngineMetrics::incr(&self.metrics.discarded);
            return Ok(OutputProgress::Delivered);
        }
        let mut properties = SampleProperties::for_unit(unit);
        if output.resolution.is_some() {
            properties.resolution = output.resolution;
        }

        let Some(mut buffer) = self.renderer.acquire_output_buffer()? else {
            self.held_output = Some((output, key));
            self.notify_output_ready(false, true);
            return Ok(OutputProgress::Blocked);
        };
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(DecodeError::decoder("output received without a decoder"));
        };
        decoder
            .convert_output(output, &mut buffer)
            .map_err(|e| match e {
                DecodeError::OutputConversion { .. } => e,
                other => DecodeError::output_conversion(other.to_string()),
            })?;
        self.renderer.return_buffer(buffer, true, properties)?;

        self.arena.release(key, Holders::INPUT);
        EngineMetrics::incr(&self.metrics.rendered);
        self.notify_output_ready(true, false);
        Ok(OutputProgress::Delivered)
    }

    fn discard_pending(&mut self) {
        let mut dropped = 0u64;
        for (_, key) in std::mem::take(&mut self.pending) {
            self.arena.release(key, Holders::INPUT);
            dropped += 1;
        }
        if let Some((_, key)) = self.held_output.take() {
            self.arena.release(key, Holders::INPUT);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                stream_type = %self.stream_type,
                dropped,
                "Discarded inputs without output"
            );
            EngineMetrics::add(&self.metrics.discarded, dropped);
        }
    }

    // --- Draining ---

    /// Only leaves normal decoding; a drain already in progress keeps its
    /// recorded next state.
    fn start_draining(&mut self, next: DecodeState) {
        if self.state != DecodeState::NormalDecoding {
            return;
        }
        EngineMetrics::incr(&self.metrics.drains);
        self.drain_needs_end_of_input = !self.is_clean;
        self.is_clean = true;
        self.after_drain = next;
        self.state = DecodeState::Draining;
    }

    fn drain_step(&mut self) -> Result<(), DecodeError> {
        if self.drain_needs_end_of_input {
            let Some(decoder) = self.decoder.as_mut() else {
                self.finish_drain();
                return Ok(());
            };
            match decoder.send_end_of_input() {
                SubmitStatus::Accepted => {
                    self.drain_needs_end_of_input = false;
                    self.end_of_input_sent = true;
                }
                SubmitStatus::NoBufferSpace | SubmitStatus::EndOfData => {
                    thread::sleep(self.config.backpressure_wait());
                    return Ok(());
                }
                SubmitStatus::DecoderLost => {
                    EngineMetrics::incr(&self.metrics.decoder_losses);
                    self.drain_needs_end_of_input = false;
                    self.finish_drain();
                    return Ok(());
                }
                SubmitStatus::Fatal(reason) => return Err(DecodeError::decoder(reason)),
            }
        }
        if !self.end_of_input_sent {
            self.finish_drain();
            return Ok(());
        }
        match self.handle_output()? {
            OutputProgress::EndOfData => self.finish_drain(),
            OutputProgress::Idle | OutputProgress::Blocked => {
                thread::sleep(self.config.backpressure_wait());
            }
            OutputProgress::Delivered => {}
        }
        Ok(())
    }

    fn finish_drain(&mut self) {
        self.discard_pending();
        if self.end_of_input_sent {
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.flush();
            }
            self.end_of_input_sent = false;
        }
        debug!(
            stream_type = %self.stream_type,
            next = ?self.after_drain,
            "Drain complete"
        );
        self.state = self.after_drain;
        self.after_drain = DecodeState::NormalDecoding;
    }

    fn reset_decoder(&mut self) {
        EngineMetrics::incr(&self.metrics.resets);
        let reset = self
            .decoder
            .as_mut()
            .is_some_and(|decoder| decoder.reset_to_clean_start());
        if !reset {
            debug!(stream_type = %self.stream_type, "Decoder reset unsupported, recreating");
            self.decoder = None;
        }
        self.is_clean = true;
        self.state = DecodeState::NormalDecoding;
    }

    // --- Replay ---

    fn retain_for_replay(&mut self, key: UnitKey) {
        let needs_replay = self
            .decoder
            .as_ref()
            .is_some_and(|decoder| decoder.needs_replay_data());
        if !needs_replay || self.history_overflowed {
            return;
        }
        if self.history.len() >= self.config.max_replay_units {
            warn!(
                stream_type = %self.stream_type,
                limit = self.config.max_replay_units,
                "Replay history full, decoder loss before the next sync point will restart at a sync point"
            );
            self.clear_history();
            self.history_overflowed = true;
            return;
        }
        self.arena.retain(key, Holders::HISTORY);
        self.history.push_back(key);
    }

    fn clear_history(&mut self) {
        for key in self.history.drain(..) {
            self.arena.release(key, Holders::HISTORY);
        }
        self.replay_queue.clear();
        self.history_overflowed = false;
    }

    fn enter_replay(&mut self) {
        EngineMetrics::incr(&self.metrics.decoder_losses);
        warn!(
            stream_type = %self.stream_type,
            history = self.history.len(),
            "Decoder lost its state"
        );
        self.discard_pending();

        if self.history_overflowed {
            warn!(
                stream_type = %self.stream_type,
                "Replay history incomplete, waiting for the next sync point"
            );
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.flush();
            }
            self.history_overflowed = false;
            self.is_clean = true;
            self.wait_for_sync = true;
            return;
        }

        self.replay_queue = self.history.iter().copied().collect();
        if !self.replay_queue.is_empty() {
            self.state = DecodeState::ReplayDecoding;
        }
    }

    fn replay_step(&mut self) -> Result<(), DecodeError> {
        let Some(&key) = self.replay_queue.front() else {
            self.state = DecodeState::NormalDecoding;
            return Ok(());
        };
        let last = self.replay_queue.len() == 1;
        let correlation = self.next_correlation;
        let status = match (self.arena.get(key), self.decoder.as_mut()) {
            (Some(unit), Some(decoder)) => decoder.submit(DecoderInput {
                unit,
                correlation,
                mode: SubmitMode::Replay { last },
            }),
            _ => {
                self.replay_queue.pop_front();
                return Ok(());
            }
        };

        match status {
            SubmitStatus::Accepted => {
                self.next_correlation += 1;
                self.replay_queue.pop_front();
                self.is_clean = false;
                EngineMetrics::incr(&self.metrics.replayed);
                if last {
                    debug!(
                        stream_type = %self.stream_type,
                        units = self.history.len(),
                        "Replay complete"
                    );
                    self.state = DecodeState::NormalDecoding;
                }
            }
            SubmitStatus::NoBufferSpace | SubmitStatus::EndOfData => {
                thread::sleep(self.config.backpressure_wait());
            }
            SubmitStatus::DecoderLost => {
                EngineMetrics::incr(&self.metrics.decoder_losses);
                warn!(stream_type = %self.stream_type, "Decoder lost during replay, restarting replay");
                self.replay_queue = self.history.iter().copied().collect();
            }
            SubmitStatus::Fatal(reason) => return Err(DecodeError::decoder(reason)),
        }
        Ok(())
    }

    // --- Flush ---

    fn flush_decoder_state(&mut self) {
        debug!(stream_type = %self.stream_type, "Flushing decoder state");
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.discard_pending();
        if let Some(key) = self.current.take() {
            self.arena.release(key, Holders::INPUT);
        }
        self.clear_history();
        self.state = DecodeState::NormalDecoding;
        self.after_drain = DecodeState::NormalDecoding;
        self.drain_needs_end_of_input = false;
        self.end_of_input_sent = false;
        self.is_clean = true;
        self.wait_for_sync = true;
        self.missing_sync_logged = false;
        self.last_input = None;
        self.end_of_data_reported = false;
    }
}
