use std::collections::VecDeque;
use std::time::{Duration, Instant};

use media_types::MediaTime;
use parking_lot::{Condvar, Mutex};

use crate::config::BufferLimit;
use crate::unit::DecodableUnit;

/// Snapshot of a buffer's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub units: usize,
    pub playable_duration: MediaTime,
    pub front_dts: Option<MediaTime>,
    pub front_pts: Option<MediaTime>,
    pub smallest_pts: Option<MediaTime>,
    pub largest_pts: Option<MediaTime>,
    pub end_of_data: bool,
    pub segment_boundaries: u64,
}

#[derive(Debug, Default)]
struct BufferState {
    units: VecDeque<DecodableUnit>,
    playable_duration: MediaTime,
    front_dts: Option<MediaTime>,
    front_pts: Option<MediaTime>,
    smallest_pts: Option<MediaTime>,
    largest_pts: Option<MediaTime>,
    end_of_data: bool,
    segment_boundaries: u64,
}

impl BufferState {
    fn would_exceed(&self, duration: MediaTime, limit: &BufferLimit) -> bool {
        self.playable_duration + duration > limit.max_duration
    }

    fn take_front(&mut self, lookahead: usize) -> Option<DecodableUnit> {
        let unit = self.units.pop_front()?;
        if unit.is_presentable() {
            self.playable_duration -= unit.duration;
            if self.playable_duration < MediaTime::ZERO {
                self.playable_duration = MediaTime::ZERO;
            }
        }
        self.refresh_caches(lookahead);
        Some(unit)
    }

    /// Recomputes the timestamp caches over the first `lookahead` units only.
    /// Reordering is local to a few units, so the smallest PTS lives near the
    /// front and the largest near the back.
    fn refresh_caches(&mut self, lookahead: usize) {
        let Some(front) = self.units.front() else {
            self.front_dts = None;
            self.front_pts = None;
            self.smallest_pts = None;
            self.largest_pts = None;
            return;
        };
        self.front_dts = Some(front.dts);
        self.front_pts = Some(front.pts);

        let mut smallest = front.pts;
        let mut largest = front.pts;
        for unit in self.units.iter().take(lookahead.max(1)) {
            smallest = smallest.min(unit.pts);
            largest = largest.max(unit.pts);
        }
        if let Some(back) = self.units.back() {
            largest = largest.max(back.pts);
        }
        self.smallest_pts = Some(smallest);
        self.largest_pts = Some(largest);
    }
}

/// Bounded FIFO of units for one track.
///
/// Capacity is a playable duration rather than an item count. Units that do
/// not overlap their presentable window bypass the limit. Safe for one
/// producer and one consumer on different threads.
#[derive(Debug)]
pub struct UnitBuffer {
    state: Mutex<BufferState>,
    data_available: Condvar,
    space_available: Condvar,
    lookahead: usize,
}

impl UnitBuffer {
    pub fn new(lookahead: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
            lookahead,
        }
    }

    /// Appends a unit. A presentable unit that would push the playable
    /// duration past `limit` is handed back unchanged.
    pub fn push(&self, unit: DecodableUnit, limit: &BufferLimit) -> Result<(), DecodableUnit> {
        let mut state = self.state.lock();
        let presentable = unit.is_presentable();
        if presentable && state.would_exceed(unit.duration, limit) {
            return Err(unit);
        }
        if presentable {
            state.playable_duration += unit.duration;
        }
        if state.units.is_empty() {
            state.front_dts = Some(unit.dts);
            state.front_pts = Some(unit.pts);
        }
        state.smallest_pts = Some(state.smallest_pts.map_or(unit.pts, |p| p.min(unit.pts)));
        state.largest_pts = Some(state.largest_pts.map_or(unit.pts, |p| p.max(unit.pts)));
        state.end_of_data = false;
        state.units.push_back(unit);
        drop(state);
        self.data_available.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<DecodableUnit> {
        let mut state = self.state.lock();
        let unit = state.take_front(self.lookahead)?;
        drop(state);
        self.space_available.notify_one();
        Some(unit)
    }

    pub fn peek(&self) -> Option<DecodableUnit> {
        self.state.lock().units.front().cloned()
    }

    /// Whether a resident unit covers `pts`.
    pub fn contains_timestamp(&self, pts: MediaTime) -> bool {
        let state = self.state.lock();
        state
            .units
            .iter()
            .any(|u| u.pts <= pts && (pts < u.end_pts() || u.pts == pts))
    }

    /// Drops leading units that lie entirely before both `dts` and `pts`.
    /// Returns how many were dropped.
    pub fn discard_until(&self, dts: MediaTime, pts: MediaTime) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while let Some(front) = state.units.front() {
            if front.dts >= dts || front.pts >= pts {
                break;
            }
            state.take_front(self.lookahead);
            dropped += 1;
        }
        drop(state);
        if dropped > 0 {
            self.space_available.notify_one();
        }
        dropped
    }

    /// Blocks until the buffer holds a unit or `timeout` expires. Also wakes
    /// early (returning `false`) when end of data is signalled.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.units.is_empty() {
            if state.end_of_data {
                return false;
            }
            if self
                .data_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return !state.units.is_empty();
            }
        }
        true
    }

    /// Blocks until a presentable unit of `duration` would be accepted or
    /// `timeout` expires.
    pub fn wait_for_space(
        &self,
        duration: MediaTime,
        limit: &BufferLimit,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.would_exceed(duration, limit) {
            if self
                .space_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return !state.would_exceed(duration, limit);
            }
        }
        true
    }

    pub fn mark_end_of_data(&self) {
        self.state.lock().end_of_data = true;
        self.data_available.notify_all();
    }

    /// End of data has been signalled and every unit has been consumed.
    pub fn is_end_of_data(&self) -> bool {
        let state = self.state.lock();
        state.end_of_data && state.units.is_empty()
    }

    /// End of data has been signalled; units may still be queued.
    pub fn is_end_of_data_flag_set(&self) -> bool {
        self.state.lock().end_of_data
    }

    pub fn mark_segment_boundary(&self) {
        self.state.lock().segment_boundaries += 1;
    }

    pub fn flush(&self) {
        let mut state = self.state.lock();
        let boundaries = state.segment_boundaries;
        *state = BufferState {
            segment_boundaries: boundaries,
            ..BufferState::default()
        };
        drop(state);
        self.space_available.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn playable_duration(&self) -> MediaTime {
        self.state.lock().playable_duration
    }

    pub fn front_pts(&self) -> Option<MediaTime> {
        self.state.lock().front_pts
    }

    pub fn front_dts(&self) -> Option<MediaTime> {
        self.state.lock().front_dts
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            units: state.units.len(),
            playable_duration: state.playable_duration,
            front_dts: state.front_dts,
            front_pts: state.front_pts,
            smallest_pts: state.smallest_pts,
            largest_pts: state.largest_pts,
            end_of_data: state.end_of_data,
            segment_boundaries: state.segment_boundaries,
        }
    }
}

impl Default for UnitBuffer {
    fn default() -> Self {
        Self::new(8)
    }
}
