use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use media_types::{MediaTime, StreamType};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::unit_buffer::{BufferStats, UnitBuffer};
use crate::config::{BufferConfig, BufferLimit};
use crate::unit::{DecodableUnit, TrackIdentity};

#[derive(Debug, Clone)]
struct PendingSwitch {
    sequence_id: u64,
    target: TrackIdentity,
}

#[derive(Debug, Default)]
struct ManagerState {
    buffers: BTreeMap<TrackIdentity, Arc<UnitBuffer>>,
    active: Option<TrackIdentity>,
    pending: Option<PendingSwitch>,
    last_sequence_id: Option<u64>,
    end_of_data: bool,
}

impl ManagerState {
    /// Applies a pending switch once the target has data and the active
    /// buffer has been drained up to the target's first unit.
    fn apply_pending_switch(&mut self, stream_type: StreamType) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        let Some(target) = self.buffers.get(&pending.target) else {
            return;
        };
        let Some(target_front) = target.front_pts() else {
            return;
        };
        let current_front = self
            .active
            .as_ref()
            .and_then(|id| self.buffers.get(id))
            .and_then(|b| b.front_pts());
        let safe = match current_front {
            None => true,
            Some(front) => front >= target_front,
        };
        if !safe {
            return;
        }
        if let Some(pending) = self.pending.take() {
            debug!(
                stream_type = %stream_type,
                from = ?self.active.as_ref().map(|id| id.as_str()),
                to = %pending.target,
                sequence_id = pending.sequence_id,
                at = %target_front,
                "Switched active track"
            );
            self.active = Some(pending.target);
        }
    }

    fn active_buffer(&self) -> Option<Arc<UnitBuffer>> {
        self.active
            .as_ref()
            .and_then(|id| self.buffers.get(id))
            .cloned()
    }

    fn inactive_buffers(&self) -> Vec<Arc<UnitBuffer>> {
        self.buffers
            .iter()
            .filter(|(id, _)| Some(*id) != self.active.as_ref())
            .map(|(_, b)| Arc::clone(b))
            .collect()
    }
}

/// Holds one [`UnitBuffer`] per candidate source track and exposes a single
/// active track to the consumer.
///
/// Track switches requested with [`select_track`](Self::select_track) are
/// deferred until the active buffer has been played up to the first unit of
/// the target, which keeps presentation order intact across quality changes.
/// Units queued in inactive buffers are discarded as the play position moves
/// past them. The manager lock only guards the map and the active pointer and
/// is never held across a blocking wait.
#[derive(Debug)]
pub struct TrackBufferManager {
    stream_type: StreamType,
    state: Mutex<ManagerState>,
    parallel: bool,
    lookahead: usize,
    activity: Mutex<u64>,
    activity_signal: Condvar,
}

impl TrackBufferManager {
    pub fn new(stream_type: StreamType, config: &BufferConfig) -> Self {
        Self {
            stream_type,
            state: Mutex::new(ManagerState::default()),
            parallel: config.parallel_tracks,
            lookahead: config.timestamp_lookahead,
            activity: Mutex::new(0),
            activity_signal: Condvar::new(),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn notify_activity(&self) {
        *self.activity.lock() += 1;
        self.activity_signal.notify_all();
    }

    /// Requests that `target` becomes the active track at the next safe point.
    /// Requests carrying an older `sequence_id` than one already seen are ignored.
    pub fn select_track(&self, sequence_id: u64, target: TrackIdentity) {
        let mut state = self.state.lock();
        if state.last_sequence_id.is_some_and(|last| sequence_id < last) {
            debug!(
                stream_type = %self.stream_type,
                sequence_id,
                "Ignoring stale track selection"
            );
            return;
        }
        state.last_sequence_id = Some(sequence_id);
        match state.active.as_ref() {
            None => {
                state.active = Some(target);
                state.pending = None;
            }
            Some(active) if *active == target => state.pending = None,
            Some(_) => {
                state.pending = Some(PendingSwitch {
                    sequence_id,
                    target,
                })
            }
        }
    }

    pub fn active_identity(&self) -> Option<TrackIdentity> {
        self.state.lock().active.clone()
    }

    pub fn pending_identity(&self) -> Option<TrackIdentity> {
        self.state.lock().pending.as_ref().map(|p| p.target.clone())
    }

    /// The buffer for `identity`, created on first use. The first buffer
    /// created becomes active when no track was selected.
    pub fn buffer(&self, identity: &TrackIdentity) -> Arc<UnitBuffer> {
        let mut state = self.state.lock();
        if let Some(buffer) = state.buffers.get(identity) {
            return Arc::clone(buffer);
        }
        let buffer = Arc::new(UnitBuffer::new(self.lookahead));
        state.buffers.insert(identity.clone(), Arc::clone(&buffer));
        if state.active.is_none() {
            state.active = Some(identity.clone());
        }
        buffer
    }

    /// Routes `unit` to the buffer of its source track.
    pub fn push(&self, unit: DecodableUnit, limit: &BufferLimit) -> Result<(), DecodableUnit> {
        let buffer = self.buffer(&unit.source);
        buffer.push(unit, limit)?;
        self.state.lock().end_of_data = false;
        self.notify_activity();
        Ok(())
    }

    pub fn wait_for_space(
        &self,
        identity: &TrackIdentity,
        duration: MediaTime,
        limit: &BufferLimit,
        timeout: Duration,
    ) -> bool {
        self.buffer(identity)
            .wait_for_space(duration, limit, timeout)
    }

    pub fn mark_segment_boundary(&self, identity: &TrackIdentity) {
        self.buffer(identity).mark_segment_boundary();
    }

    /// Takes the next unit from the active track (or, in parallel mode, the
    /// unit with the smallest decode time across all tracks).
    pub fn pop(&self) -> Option<DecodableUnit> {
        if self.parallel {
            return self.pop_parallel();
        }
        let (active, inactive) = {
            let mut state = self.state.lock();
            state.apply_pending_switch(self.stream_type);
            (state.active_buffer()?, state.inactive_buffers())
        };
        let unit = active.pop()?;
        for buffer in inactive {
            buffer.discard_until(unit.dts, unit.pts);
        }
        Some(unit)
    }

    fn pop_parallel(&self) -> Option<DecodableUnit> {
        let buffers: Vec<Arc<UnitBuffer>> = self.state.lock().buffers.values().cloned().collect();
        buffers
            .iter()
            .filter_map(|b| b.front_dts().map(|dts| (dts, b)))
            .min_by_key(|(dts, _)| *dts)
            .and_then(|(_, b)| b.pop())
    }

    pub fn peek(&self) -> Option<DecodableUnit> {
        if self.parallel {
            let buffers: Vec<Arc<UnitBuffer>> =
                self.state.lock().buffers.values().cloned().collect();
            return buffers
                .iter()
                .filter_map(|b| b.peek())
                .min_by_key(|u| u.dts);
        }
        let active = {
            let mut state = self.state.lock();
            state.apply_pending_switch(self.stream_type);
            state.active_buffer()?
        };
        active.peek()
    }

    fn has_data(&self) -> bool {
        let mut state = self.state.lock();
        if self.parallel {
            return state.buffers.values().any(|b| !b.is_empty());
        }
        state.apply_pending_switch(self.stream_type);
        state.active_buffer().is_some_and(|b| !b.is_empty())
    }

    /// Blocks until the consumer view has a unit, end of data is signalled,
    /// or `timeout` expires.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.activity.lock();
            if self.has_data() {
                return true;
            }
            if self.is_end_of_data_flag_set() {
                return false;
            }
            let mut activity = self.activity.lock();
            if *activity == seen
                && self
                    .activity_signal
                    .wait_until(&mut activity, deadline)
                    .timed_out()
            {
                drop(activity);
                return self.has_data();
            }
        }
    }

    /// Signals that no more units will arrive on any track.
    pub fn mark_end_of_data(&self) {
        let buffers: Vec<Arc<UnitBuffer>> = {
            let mut state = self.state.lock();
            state.end_of_data = true;
            state.buffers.values().cloned().collect()
        };
        for buffer in buffers {
            buffer.mark_end_of_data();
        }
        self.notify_activity();
    }

    pub fn is_end_of_data_flag_set(&self) -> bool {
        let state = self.state.lock();
        if self.parallel {
            return state.end_of_data;
        }
        match state.active_buffer() {
            Some(buffer) => buffer.is_end_of_data_flag_set(),
            None => state.end_of_data,
        }
    }

    /// End of data signalled and nothing left to consume.
    pub fn is_end_of_data(&self) -> bool {
        let state = self.state.lock();
        if self.parallel {
            return state.end_of_data && state.buffers.values().all(|b| b.is_empty());
        }
        match state.active_buffer() {
            Some(buffer) => buffer.is_end_of_data(),
            None => state.end_of_data,
        }
    }

    /// Drops every queued unit and any pending switch.
    pub fn flush(&self) {
        let buffers: Vec<Arc<UnitBuffer>> = {
            let mut state = self.state.lock();
            state.pending = None;
            state.end_of_data = false;
            state.buffers.values().cloned().collect()
        };
        for buffer in buffers {
            buffer.flush();
        }
        self.notify_activity();
    }

    /// Occupancy of the consumer view.
    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        if !self.parallel {
            return state
                .active_buffer()
                .map(|b| b.stats())
                .unwrap_or(BufferStats {
                    end_of_data: state.end_of_data,
                    ..BufferStats::default()
                });
        }
        state
            .buffers
            .values()
            .map(|b| b.stats())
            .fold(BufferStats::default(), |mut acc, s| {
                acc.units += s.units;
                acc.playable_duration = acc.playable_duration.max(s.playable_duration);
                acc.front_dts = min_opt(acc.front_dts, s.front_dts);
                acc.front_pts = min_opt(acc.front_pts, s.front_pts);
                acc.smallest_pts = min_opt(acc.smallest_pts, s.smallest_pts);
                acc.largest_pts = acc.largest_pts.max(s.largest_pts);
                acc.end_of_data = state.end_of_data;
                acc.segment_boundaries = acc.segment_boundaries.max(s.segment_boundaries);
                acc
            })
    }
}

fn min_opt(a: Option<MediaTime>, b: Option<MediaTime>) -> Option<MediaTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unit(track: &str, pts_ms: i64) -> DecodableUnit {
        let t = MediaTime::from_millis(pts_ms);
        DecodableUnit::new(StreamType::Video, TrackIdentity::new(track)).with_timing(
            t,
            t,
            MediaTime::from_millis(100),
        )
    }

    fn manager(parallel: bool) -> TrackBufferManager {
        let config = BufferConfig {
            parallel_tracks: parallel,
            ..BufferConfig::default()
        };
        TrackBufferManager::new(StreamType::Video, &config)
    }

    fn limit() -> BufferLimit {
        BufferConfig::default().limit()
    }

    #[test]
    fn test_first_buffer_becomes_active() {
        let m = manager(false);
        m.push(unit("low", 0), &limit()).unwrap();
        assert_eq!(m.active_identity(), Some(TrackIdentity::new("low")));
        assert_eq!(m.pop().unwrap().pts, MediaTime::ZERO);
        assert!(m.pop().is_none());
    }

    #[test]
    fn test_switch_waits_for_active_to_reach_target() {
        let m = manager(false);
        let cap = limit();
        for pts in [0, 100, 200, 300] {
            m.push(unit("low", pts), &cap).unwrap();
        }
        // The new quality starts at 200ms.
        for pts in [200, 300, 400] {
            m.push(unit("high", pts), &cap).unwrap();
        }
        m.select_track(1, TrackIdentity::new("high"));

        let order: Vec<(String, i64)> = std::iter::from_fn(|| m.pop())
            .map(|u| (u.source.to_string(), u.pts.as_millis()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("low".to_string(), 0),
                ("low".to_string(), 100),
                ("high".to_string(), 200),
                ("high".to_string(), 300),
                ("high".to_string(), 400),
            ]
        );
        assert_eq!(m.active_identity(), Some(TrackIdentity::new("high")));
        assert!(m.pending_identity().is_none());
    }

    #[test]
    fn test_inactive_buffers_are_trimmed_as_play_advances() {
        let m = manager(false);
        let cap = limit();
        for pts in [0, 100, 200] {
            m.push(unit("main", pts), &cap).unwrap();
            m.push(unit("alt", pts), &cap).unwrap();
        }
        m.pop();
        m.pop();
        let alt = m.buffer(&TrackIdentity::new("alt"));
        // Units strictly before the last popped one are gone.
        assert_eq!(alt.front_pts(), Some(MediaTime::from_millis(100)));
    }

    #[test]
    fn test_stale_selection_is_ignored() {
        let m = manager(false);
        m.select_track(5, TrackIdentity::new("a"));
        m.select_track(6, TrackIdentity::new("b"));
        m.select_track(4, TrackIdentity::new("c"));
        assert_eq!(m.pending_identity(), Some(TrackIdentity::new("b")));
    }

    #[test]
    fn test_parallel_mode_pops_smallest_dts() {
        let m = manager(true);
        let cap = limit();
        m.push(unit("a", 200), &cap).unwrap();
        m.push(unit("b", 100), &cap).unwrap();
        m.push(unit("a", 300), &cap).unwrap();
        let order: Vec<i64> = std::iter::from_fn(|| m.pop())
            .map(|u| u.pts.as_millis())
            .collect();
        assert_eq!(order, vec![100, 200, 300]);
    }

    #[test]
    fn test_end_of_data_propagates() {
        let m = manager(false);
        m.push(unit("a", 0), &limit()).unwrap();
        m.mark_end_of_data();
        assert!(m.is_end_of_data_flag_set());
        assert!(!m.is_end_of_data());
        m.pop();
        assert!(m.is_end_of_data());
        assert!(!m.wait_for_data(Duration::from_millis(50)));
    }

    #[test]
    fn test_wait_for_data_wakes_on_push() {
        let m = Arc::new(manager(false));
        let producer = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                m.push(unit("a", 0), &limit()).unwrap();
            })
        };
        assert!(m.wait_for_data(Duration::from_secs(5)));
        producer.join().unwrap();
    }

    #[test]
    fn test_flush_clears_every_track() {
        let m = manager(false);
        m.push(unit("a", 0), &limit()).unwrap();
        m.push(unit("b", 0), &limit()).unwrap();
        m.select_track(1, TrackIdentity::new("b"));
        m.flush();
        assert!(m.peek().is_none());
        assert!(m.pending_identity().is_none());
        assert_eq!(m.stats().units, 0);
    }
}
