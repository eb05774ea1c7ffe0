//! Predictive schedule shared by the sensing and attacking threads
//!
//! The sensing thread publishes predicted victim frame starts; the attacking
//! thread consumes them in order and arms a transmission for each.
//!
//! ```text
//!  sensing ──publish(t_ms)──►  [ t0 | t1 | t2 |    |    ]  ──consume_next()──► attacking
//!                                          ▲ produced   ▲ capacity
//!                                ▲ consumed
//! ```
//!
//! A prediction is only accepted while it still lies in the future of the
//! device clock once the TX/RX offset is applied. The consumer blocks on a
//! condition variable and is released by a new entry, by the end of sensing,
//! or by the schedule running out of slots. The lock is never held across a
//! receive or transmit call.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::hal::DeviceClock;

/// Result of [`SyncBridge::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored at this slot
    Scheduled { index: usize },
    /// The corrected start time had already passed
    Stale,
    /// Every slot has been used
    ScheduleFull,
    /// Sensing has already signalled completion
    AfterCompletion,
}

#[derive(Debug, Default)]
struct Schedule {
    /// Offset-corrected transmit times (s, device time)
    times_s: Vec<f64>,
    consumed: usize,
    attacking: bool,
    sensing_complete: bool,
}

/// Bounded producer/consumer schedule of attack start times.
pub struct SyncBridge {
    capacity: usize,
    tx_rx_offset_us: f64,
    clock: Arc<dyn DeviceClock>,
    state: Mutex<Schedule>,
    ready: Condvar,
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge")
            .field("capacity", &self.capacity)
            .field("tx_rx_offset_us", &self.tx_rx_offset_us)
            .field("published", &self.published())
            .field("consumed", &self.consumed())
            .finish()
    }
}

impl SyncBridge {
    pub fn new(capacity: usize, tx_rx_offset_us: f64, clock: Arc<dyn DeviceClock>) -> Self {
        Self {
            capacity,
            tx_rx_offset_us,
            clock,
            state: Mutex::new(Schedule {
                times_s: Vec::with_capacity(capacity),
                ..Schedule::default()
            }),
            ready: Condvar::new(),
        }
    }

    // A panic on the other thread must not wedge the survivor; the schedule
    // holds only plain numbers, so a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish a predicted frame start (ms, device time).
    pub fn publish(&self, predicted_start_ms: f64) -> PublishOutcome {
        let corrected_s = (predicted_start_ms - self.tx_rx_offset_us * 1e-3) * 1e-3;
        let now_s = self.clock.now_s();

        let mut state = self.lock();
        if state.sensing_complete {
            return PublishOutcome::AfterCompletion;
        }
        if state.times_s.len() >= self.capacity {
            drop(state);
            tracing::warn!(
                capacity = self.capacity,
                predicted_start_ms,
                "attack schedule full, prediction discarded"
            );
            return PublishOutcome::ScheduleFull;
        }
        if corrected_s <= now_s {
            drop(state);
            tracing::warn!(
                predicted_start_ms,
                lag_ms = (now_s - corrected_s) * 1e3,
                "stale prediction discarded"
            );
            return PublishOutcome::Stale;
        }

        let index = state.times_s.len();
        state.times_s.push(corrected_s);
        if !state.attacking {
            state.attacking = true;
            tracing::info!(start_s = corrected_s, "attack started");
        }
        drop(state);

        self.ready.notify_all();
        tracing::debug!(index, start_s = corrected_s, "attack scheduled");
        PublishOutcome::Scheduled { index }
    }

    /// Take the next scheduled transmit time (s, device time).
    ///
    /// Blocks until an entry is available. Returns `None` once sensing is
    /// complete with nothing pending, or when every slot has been consumed.
    pub fn consume_next(&self) -> Option<f64> {
        let mut state = self.lock();
        loop {
            if state.consumed < state.times_s.len() {
                let t = state.times_s[state.consumed];
                state.consumed += 1;
                return Some(t);
            }
            if state.sensing_complete || state.consumed >= self.capacity {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// No more predictions will be published; wakes the consumer.
    pub fn signal_sensing_complete(&self) {
        self.lock().sensing_complete = true;
        self.ready.notify_all();
    }

    /// At least one prediction has been accepted.
    pub fn is_attacking(&self) -> bool {
        self.lock().attacking
    }

    pub fn is_sensing_complete(&self) -> bool {
        self.lock().sensing_complete
    }

    /// Number of accepted predictions
    pub fn published(&self) -> usize {
        self.lock().times_s.len()
    }

    /// Number of predictions handed to the consumer
    pub fn consumed(&self) -> usize {
        self.lock().consumed
    }

    /// Accepted transmit times so far (s)
    pub fn scheduled_times_s(&self) -> Vec<f64> {
        self.lock().times_s.clone()
    }

    /// Empty the schedule for another run.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.times_s.clear();
        state.consumed = 0;
        state.attacking = false;
        state.sensing_complete = false;
    }
}
