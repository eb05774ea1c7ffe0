//! Simulated Radio Pair
//!
//! [`SimReceiver`] and [`SimTransmitter`] implement the core radio traits
//! over a shared [`SimClock`]. The receiver synthesizes the victim's signal
//! plus noise for the exact device times it is asked for; the transmitter
//! records every burst it is handed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chirpsync_core::buffer::{BufferView, BufferViewMut};
use chirpsync_core::hal::{DeviceClock, RadioError, RadioResult, RxReport, SampleReceiver, SampleTransmitter, StreamStart, TxReport};
use chirpsync_core::types::IQSample;

use crate::noise::AwgnSource;
use crate::victim::VictimRadar;
use crate::{SimError, SimResult};

// ============================================================================
// Clock
// ============================================================================

/// How simulated device time relates to wall time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockMode {
    /// Time moves only as the receiver delivers samples
    Virtual,
    /// Time follows wall time since construction, multiplied by `speed`
    Paced { speed: f64 },
}

/// Device clock shared by the simulated receiver and transmitter.
#[derive(Debug)]
pub struct SimClock {
    mode: ClockMode,
    origin: Instant,
    virtual_bits: AtomicU64,
}

impl SimClock {
    pub fn new(mode: ClockMode) -> SimResult<Self> {
        if let ClockMode::Paced { speed } = mode {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(SimError::InvalidClock(format!("speed {}", speed)));
            }
        }
        Ok(Self {
            mode,
            origin: Instant::now(),
            virtual_bits: AtomicU64::new(0.0_f64.to_bits()),
        })
    }

    /// A clock at 0 s that only the receiver moves
    pub fn virtual_time() -> Self {
        Self {
            mode: ClockMode::Virtual,
            origin: Instant::now(),
            virtual_bits: AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Receiver side: the samples up to `t_s` now exist. Virtual time jumps
    /// forward; paced time is waited for.
    pub fn advance_to(&self, t_s: f64) {
        match self.mode {
            ClockMode::Virtual => {
                // Never moves backwards
                let _ = self
                    .virtual_bits
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                        (t_s > f64::from_bits(bits)).then(|| t_s.to_bits())
                    });
            }
            ClockMode::Paced { .. } => self.sleep_until(t_s),
        }
    }

    /// Block until device time reaches `t_s`. No-op on virtual time.
    pub fn sleep_until(&self, t_s: f64) {
        let speed = match self.mode {
            ClockMode::Paced { speed } => speed,
            ClockMode::Virtual => return,
        };
        loop {
            let remaining = t_s - self.now_s();
            if remaining <= 0.0 {
                break;
            }
            std::thread::sleep(Duration::from_secs_f64(remaining / speed));
        }
    }
}

impl DeviceClock for SimClock {
    fn now_s(&self) -> f64 {
        match self.mode {
            ClockMode::Virtual => f64::from_bits(self.virtual_bits.load(Ordering::SeqCst)),
            ClockMode::Paced { speed } => self.origin.elapsed().as_secs_f64() * speed,
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Sensing radio receiving the victim through an AWGN channel.
pub struct SimReceiver {
    victim: VictimRadar,
    noise: Option<AwgnSource>,
    clock: Arc<SimClock>,
    sample_rate: f64,
    /// Device time of sample 0 of the running stream
    stream_start_s: f64,
    /// Samples delivered (or lost) since the stream started
    position: usize,
    streaming: bool,
    overflow_every: Option<usize>,
    calls: usize,
}

impl SimReceiver {
    pub fn new(
        victim: VictimRadar,
        noise: Option<AwgnSource>,
        clock: Arc<SimClock>,
        sample_rate: f64,
    ) -> Self {
        Self {
            victim,
            noise,
            clock,
            sample_rate,
            stream_start_s: 0.0,
            position: 0,
            streaming: false,
            overflow_every: None,
            calls: 0,
        }
    }

    /// Lose one call's worth of samples on every `n`-th receive call.
    pub fn with_overflow_every(mut self, n: usize) -> Self {
        self.overflow_every = (n > 0).then_some(n);
        self
    }

    pub fn victim(&self) -> &VictimRadar {
        &self.victim
    }

    fn restart(&mut self, start_s: f64) {
        self.stream_start_s = start_s;
        self.position = 0;
        self.streaming = true;
    }
}

impl SampleReceiver for SimReceiver {
    fn receive(&mut self, mut dest: BufferViewMut<'_, IQSample>, start: StreamStart) -> RxReport {
        self.calls += 1;
        match start {
            StreamStart::Now => self.restart(self.clock.now_s()),
            StreamStart::At(t) => self.restart(t),
            StreamStart::Continue if !self.streaming => {
                tracing::debug!("continue without a running stream, starting now");
                self.restart(self.clock.now_s());
            }
            StreamStart::Continue => {}
        }

        let n = dest.len();
        let overflow = self
            .overflow_every
            .map_or(false, |every| self.calls % every == 0);
        if overflow {
            self.position += n;
        }

        let first_s = self.stream_start_s + self.position as f64 / self.sample_rate;
        let samples = dest.as_mut_slice();
        self.victim
            .fill(samples, self.stream_start_s, self.position, self.sample_rate);
        if let Some(noise) = &mut self.noise {
            noise.add_to(samples);
        }
        self.position += n;

        self.clock
            .advance_to(self.stream_start_s + self.position as f64 / self.sample_rate);

        RxReport {
            samples_received: n,
            first_sample_time_s: first_s,
            overflow,
            timeout: false,
        }
    }

    fn stop(&mut self) {
        self.streaming = false;
    }
}

// ============================================================================
// Transmitter
// ============================================================================

/// One burst handed to the simulated transmitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmittedBurst {
    /// Scheduled start (s, device time)
    pub start_s: f64,
    pub samples: usize,
    /// The start time had already passed when the burst was handed over
    pub late: bool,
}

/// Shared record of every transmitted burst.
#[derive(Debug, Clone, Default)]
pub struct TransmitLog(Arc<Mutex<Vec<TransmittedBurst>>>);

impl TransmitLog {
    fn lock(&self) -> MutexGuard<'_, Vec<TransmittedBurst>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bursts(&self) -> Vec<TransmittedBurst> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Attacking radio. Bursts go nowhere; they are only logged.
pub struct SimTransmitter {
    clock: Arc<SimClock>,
    sample_rate: f64,
    log: TransmitLog,
}

impl SimTransmitter {
    pub fn new(clock: Arc<SimClock>, sample_rate: f64) -> Self {
        Self {
            clock,
            sample_rate,
            log: TransmitLog::default(),
        }
    }

    pub fn log(&self) -> TransmitLog {
        self.log.clone()
    }
}

impl SampleTransmitter for SimTransmitter {
    fn transmit_schedule(
        &mut self,
        times_s: &[f64],
        burst: BufferView<'_, IQSample>,
    ) -> RadioResult<TxReport> {
        let samples = burst.valid_samples().len();
        if samples == 0 {
            return Err(RadioError::EmptyBurst);
        }
        if let Some(&bad) = times_s.iter().find(|t| !t.is_finite()) {
            return Err(RadioError::InvalidTime(bad));
        }

        let duration_s = samples as f64 / self.sample_rate;
        let mut report = TxReport::default();

        for &start_s in times_s {
            let late = start_s < self.clock.now_s();
            if late {
                tracing::debug!(start_s, now_s = self.clock.now_s(), "late burst");
                report.late_bursts += 1;
            }

            // A real radio returns once the burst has left the antenna
            self.clock.sleep_until(start_s + duration_s);

            self.log.lock().push(TransmittedBurst {
                start_s,
                samples,
                late,
            });
            report.bursts_sent += 1;
            report.samples_sent += samples;
        }

        Ok(report)
    }
}
