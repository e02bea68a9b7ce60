//! Sample clocks: per-cycle `(start, end)` timestamp pairs.
//!
//! A read task calls `wait` at the top of every acquisition cycle and `end`
//! after the hardware read returns. Successive cycles tile time exactly:
//! `end(i) == start(i+1)`, and stamps never regress.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use weir_core::breaker::Breaker;
use weir_core::frame::{ChannelKey, Frame};
use weir_core::series::Series;
use weir_core::telem::{NowFunc, Rate, TimeSpan, TimeStamp};
use weir_core::timer::Timer;

/// Timing options shared by hardware-timed read tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Disables the PID skew corrector on drift-free buses.
    pub enable_skew_correction: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { enable_skew_correction: true }
    }
}

/// Regulates acquisition speed and provides per-cycle timestamps.
pub trait SampleClock: Send {
    /// Makes the clock ready for task startup.
    fn reset(&mut self) {}

    /// Waits for the next acquisition cycle, returning the timestamp of the
    /// cycle's first sample.
    fn wait(&mut self, breaker: &Breaker) -> TimeStamp;

    /// Ends the cycle, returning the timestamp just past its last sample.
    fn end(&mut self) -> TimeStamp;
}

/// Regulates the acquisition rate at the application layer with a software
/// timer. Used when the hardware provides no steady clock.
pub struct SoftwareTimedSampleClock {
    timer: Timer,
}

impl SoftwareTimedSampleClock {
    pub fn new(stream_rate: Rate) -> Self {
        Self { timer: Timer::from_rate(stream_rate) }
    }
}

impl SampleClock for SoftwareTimedSampleClock {
    fn wait(&mut self, breaker: &Breaker) -> TimeStamp {
        let start = TimeStamp::now();
        self.timer.wait(breaker);
        start
    }

    fn end(&mut self) -> TimeStamp {
        TimeStamp::now()
    }
}

/// Configuration for [`HardwareTimedSampleClock`].
pub struct HardwareTimedSampleClockConfig {
    /// Custom time source for tests.
    pub now: NowFunc,
    pub sample_rate: Rate,
    pub stream_rate: Rate,
    /// PID gains of the skew corrector. All zero disables correction.
    pub k_p: f64,
    pub k_i: f64,
    pub k_d: f64,
    /// Clamp on the integral term to prevent windup.
    pub max_integral: f64,
    /// Maximum backwards shift of a cycle's end, expressed as a fraction of
    /// the stream period. Keeps corrected timestamps from regressing past
    /// the previous cycle.
    pub max_back_correction_factor: f64,
}

impl HardwareTimedSampleClockConfig {
    pub fn new(sample_rate: Rate, stream_rate: Rate) -> Self {
        Self {
            now: Box::new(TimeStamp::now),
            sample_rate,
            stream_rate,
            k_p: 0.1,
            k_i: 0.01,
            k_d: 0.0,
            max_integral: 1000.0,
            max_back_correction_factor: 0.1,
        }
    }

    pub fn with_timing(sample_rate: Rate, stream_rate: Rate, timing: TimingConfig) -> Self {
        let mut cfg = Self::new(sample_rate, stream_rate);
        if !timing.enable_skew_correction {
            cfg.k_p = 0.0;
            cfg.k_i = 0.0;
            cfg.k_d = 0.0;
        }
        cfg
    }

    fn max_back_correction(&self) -> TimeSpan {
        self.stream_rate.period().scale(self.max_back_correction_factor)
    }
}

/// Interpolates timestamps against an external, steady hardware clock.
///
/// `wait` returns the precomputed cycle start immediately; the hardware read
/// itself paces the loop. `end` extrapolates `start + stream_period`, then
/// applies a PID correction that bleeds off accumulated skew between the
/// interpolated timeline and the wall clock. The correction is clamped so a
/// cycle's end never moves before its start.
pub struct HardwareTimedSampleClock {
    cfg: HardwareTimedSampleClockConfig,
    prev_system_end: TimeStamp,
    curr_start_sample_time: TimeStamp,
    integral: f64,
    prev_error: f64,
}

impl HardwareTimedSampleClock {
    pub fn new(cfg: HardwareTimedSampleClockConfig) -> Self {
        Self {
            cfg,
            prev_system_end: TimeStamp::ZERO,
            curr_start_sample_time: TimeStamp::ZERO,
            integral: 0.0,
            prev_error: 0.0,
        }
    }
}

impl SampleClock for HardwareTimedSampleClock {
    fn reset(&mut self) {
        self.prev_system_end = TimeStamp::ZERO;
        self.curr_start_sample_time = TimeStamp::ZERO;
        self.integral = 0.0;
        self.prev_error = 0.0;
    }

    fn wait(&mut self, _breaker: &Breaker) -> TimeStamp {
        if self.curr_start_sample_time == TimeStamp::ZERO {
            let now = (self.cfg.now)();
            self.curr_start_sample_time = now;
            self.prev_system_end = now;
        }
        self.curr_start_sample_time
    }

    fn end(&mut self) -> TimeStamp {
        let mut sample_end = self.curr_start_sample_time + self.cfg.stream_rate.period();
        let system_end = (self.cfg.now)();
        // Positive error: the interpolated timeline is ahead of wall time.
        let error = (sample_end - system_end).nanos() as f64;
        let dt = (system_end - self.prev_system_end).nanos() as f64;
        let p_term = self.cfg.k_p * error;
        self.integral += error * dt;
        self.integral = self.integral.clamp(-self.cfg.max_integral, self.cfg.max_integral);
        let i_term = self.cfg.k_i * self.integral;
        let d_term = if dt > 0.0 { self.cfg.k_d * (error - self.prev_error) / dt } else { 0.0 };
        self.prev_error = error;
        let mut correction = TimeSpan((p_term + i_term + d_term) as i64);
        // The invariant that keeps stamps monotonic: never pull the end back
        // past max_back_correction.
        if correction > self.cfg.max_back_correction() {
            correction = self.cfg.max_back_correction();
        }
        sample_end = sample_end - correction;
        self.prev_system_end = system_end;
        self.curr_start_sample_time = sample_end;
        sample_end
    }
}

/// Writes a linearly spaced timestamp series into every index channel slot
/// of the frame.
pub fn generate_index_data(
    frame: &mut Frame,
    index_keys: &BTreeSet<ChannelKey>,
    start: TimeStamp,
    end: TimeStamp,
    n_read: usize,
    inclusive: bool,
) {
    if index_keys.is_empty() {
        return;
    }
    let index_data = Series::linspace(start, end, n_read, inclusive);
    let mut keys = index_keys.iter();
    // Common case is a single index, which can take the series directly.
    if index_keys.len() == 1 {
        if let Some(slot) = frame.get_mut(*keys.next().unwrap_or(&0)) {
            *slot = index_data;
        }
        return;
    }
    for key in keys {
        if let Some(slot) = frame.get_mut(*key) {
            *slot = index_data.clone();
        }
    }
}
