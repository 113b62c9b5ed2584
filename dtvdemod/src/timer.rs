//! Named acquisition timers.
//!
//! Timers are keyed by id and reused across tune cycles. A timer is armed
//! with `begin`, and queried with `not_enough` (still running) or
//! `is_enough` (ran out). A disabled timer answers false to both.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

/// Timer identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Lock detection window after a channel is programmed.
    Detect,
    /// Unlocked time after which the channel is programmed again.
    Set,
    Debug1,
    Debug2,
}

/// One timer slot.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    pub id: TimerId,
    pub enabled: bool,
    pub start: Instant,
    pub max: Duration,
}

impl TimerHandle {
    fn new(id: TimerId) -> Self {
        Self {
            id,
            enabled: false,
            start: Instant::now(),
            max: Duration::ZERO,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Settling time granted to the tuner after detection starts.
pub const TUNER_SETTLE: Duration = Duration::from_millis(200);

/// The timer set owned by one device.
#[derive(Debug)]
pub struct Timers {
    handles: HashMap<TimerId, TimerHandle>,
    tuner_settle: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    pub fn new() -> Self {
        Self::with_tuner_settle(TUNER_SETTLE)
    }

    pub fn with_tuner_settle(tuner_settle: Duration) -> Self {
        let handles = [TimerId::Detect, TimerId::Set, TimerId::Debug1, TimerId::Debug2]
            .into_iter()
            .map(|id| (id, TimerHandle::new(id)))
            .collect();
        Self {
            handles,
            tuner_settle,
        }
    }

    fn handle_mut(&mut self, id: TimerId) -> &mut TimerHandle {
        self.handles.entry(id).or_insert_with(|| TimerHandle::new(id))
    }

    pub fn get(&self, id: TimerId) -> Option<&TimerHandle> {
        self.handles.get(&id)
    }

    pub fn set_max(&mut self, id: TimerId, max: Duration) {
        self.handle_mut(id).max = max;
    }

    /// Arm a timer from now.
    pub fn begin(&mut self, id: TimerId) {
        let handle = self.handle_mut(id);
        handle.start = Instant::now();
        handle.enabled = true;
        debug!("[Timers] {:?} begin, max {:?}", id, handle.max);
    }

    pub fn disable(&mut self, id: TimerId) {
        self.handle_mut(id).enabled = false;
    }

    pub fn is_enabled(&self, id: TimerId) -> bool {
        self.handles.get(&id).map(|h| h.enabled).unwrap_or(false)
    }

    /// Armed and still inside its window.
    pub fn not_enough(&self, id: TimerId) -> bool {
        self.handles
            .get(&id)
            .map(|h| h.enabled && h.elapsed() < h.max)
            .unwrap_or(false)
    }

    /// Armed and past its window.
    pub fn is_enough(&self, id: TimerId) -> bool {
        self.handles
            .get(&id)
            .map(|h| h.enabled && h.elapsed() >= h.max)
            .unwrap_or(false)
    }

    /// Detection started less than the tuner settle time ago.
    pub fn tuner_not_enough(&self) -> bool {
        self.handles
            .get(&TimerId::Detect)
            .map(|h| h.enabled && h.elapsed() < self.tuner_settle)
            .unwrap_or(false)
    }

    /// Disable every timer.
    pub fn disable_all(&mut self) {
        for handle in self.handles.values_mut() {
            handle.enabled = false;
        }
    }
}
