//! Retry circuit with scaled intervals and cooperative cancellation.
//!
//! A breaker is the single suspension primitive in the driver: every retry
//! sleep and every long timer wait goes through it, so stopping a pipeline
//! wakes all of its blocked threads immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::telem::{TimeSpan, SECOND};

/// Sentinel max retry count for the retry-forever mode used by long-running
/// pipelines.
pub const RETRY_FOREVER: u32 = u32::MAX;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name used in retry log lines.
    pub name: String,
    /// Sleep interval on the first trigger; scaled on each successive retry.
    pub base_interval: TimeSpan,
    /// Number of triggers after which `wait` gives up.
    pub max_retries: u32,
    /// Multiplier applied to the interval on every trigger. Values below 1
    /// are not recommended.
    pub scale: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self { name: "breaker".to_string(), base_interval: SECOND, max_retries: 50, scale: 1.2 }
    }
}

impl Config {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// The retry-forever variant of this config.
    pub fn infinite(mut self) -> Self {
        self.max_retries = RETRY_FOREVER;
        self
    }
}

#[derive(Debug)]
struct RetryState {
    interval: TimeSpan,
    retries: u32,
}

/// A shared retry circuit. Clones observe the same cancellation flag and
/// retry state, so a pipeline can hand one to its worker thread and still
/// cancel it from `stop`.
#[derive(Clone)]
pub struct Breaker {
    config: Arc<Config>,
    retry: Arc<Mutex<RetryState>>,
    running: Arc<AtomicBool>,
    gate: Arc<(Mutex<()>, Condvar)>,
}

impl Breaker {
    pub fn new(config: Config) -> Self {
        let retry = RetryState { interval: config.base_interval, retries: 0 };
        Self {
            config: Arc::new(config),
            retry: Arc::new(Mutex::new(retry)),
            running: Arc::new(AtomicBool::new(false)),
            gate: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    /// Arms the breaker. `wait_for` returns immediately until this is called.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Cancels the breaker, waking every thread blocked in `wait_for`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.gate.1.notify_all();
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Triggers the breaker. Returns false once the maximum retry count has
    /// been exceeded or the breaker was cancelled mid-sleep; otherwise sleeps
    /// the scaled interval and returns true.
    pub fn wait(&self, message: &str) -> bool {
        let interval = {
            let mut retry = self.retry.lock();
            if retry.retries >= self.config.max_retries {
                error!(
                    breaker = %self.config.name,
                    max_retries = self.config.max_retries,
                    "exceeded maximum retry count, giving up"
                );
                return false;
            }
            warn!(
                breaker = %self.config.name,
                retry = retry.retries,
                max_retries = self.config.max_retries,
                interval = %retry.interval,
                error = message,
                "triggered, retrying"
            );
            let interval = retry.interval;
            retry.interval = retry.interval.scale(self.config.scale);
            retry.retries += 1;
            interval
        };
        self.wait_for(interval)
    }

    /// Cancellable sleep. Returns true when the full span elapsed, false when
    /// the breaker was stopped first.
    pub fn wait_for(&self, span: TimeSpan) -> bool {
        if !self.running() {
            return false;
        }
        let deadline = Instant::now() + span.duration();
        let mut guard = self.gate.0.lock();
        while self.running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            self.gate.1.wait_for(&mut guard, deadline - now);
        }
        false
    }

    /// Restores the base interval and zero retries. Called after the guarded
    /// operation succeeds.
    pub fn reset(&self) {
        let mut retry = self.retry.lock();
        retry.interval = self.config.base_interval;
        retry.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retry.lock().retries
    }
}
