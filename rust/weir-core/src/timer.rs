//! High-resolution periodic loop timer.
//!
//! Strategy is picked per interval: under 5 ms the timer runs a
//! Welford-calibrated hybrid of chunked sleeps and a busy-wait tail, under
//! 50 ms it trusts the OS sleep, and above that it parks on the breaker so
//! slow loops stay cancellable.

use std::time::Instant;

use crate::breaker::Breaker;
use crate::telem::{Rate, TimeSpan, MICROSECOND};

/// Below this interval the calibrated busy-sleep hybrid is used.
fn high_res_threshold() -> TimeSpan {
    Rate::hz(200.0).period()
}

/// Below this interval a plain OS sleep is used.
fn medium_res_threshold() -> TimeSpan {
    Rate::hz(20.0).period()
}

/// Chunk size for the calibrated sleep loop.
const RESOLUTION: TimeSpan = TimeSpan(100 * MICROSECOND.0);

/// A periodic waiter that tracks the end of the previous cycle.
pub struct Timer {
    interval: TimeSpan,
    last: Option<Instant>,
    // Welford state for the observed duration of a RESOLUTION sleep.
    sleep_estimate: f64,
    sleep_mean: f64,
    sleep_m2: f64,
    sleep_count: u64,
}

impl Timer {
    pub fn from_interval(interval: TimeSpan) -> Self {
        let initial = (RESOLUTION.nanos() * 10) as f64;
        Self {
            interval,
            last: None,
            sleep_estimate: initial,
            sleep_mean: initial,
            sleep_m2: 0.0,
            sleep_count: 1,
        }
    }

    pub fn from_rate(rate: Rate) -> Self {
        Self::from_interval(rate.period())
    }

    pub fn interval(&self) -> TimeSpan {
        self.interval
    }

    fn elapsed(&mut self, now: Instant) -> TimeSpan {
        match self.last {
            Some(last) => TimeSpan((now - last).as_nanos() as i64),
            None => {
                self.last = Some(now);
                TimeSpan::ZERO
            }
        }
    }

    /// Waits until one interval has elapsed since the previous call.
    ///
    /// Returns the time elapsed since the previous cycle and whether the
    /// timer slept at all. When the period has already passed, returns
    /// immediately with `did_sleep = false`.
    pub fn wait(&mut self, breaker: &Breaker) -> (TimeSpan, bool) {
        let now = Instant::now();
        let elapsed = self.elapsed(now);
        if elapsed > self.interval {
            self.last = Some(now);
            return (elapsed, false);
        }
        let remaining = self.interval - elapsed;
        if self.interval < high_res_threshold() {
            self.precise_sleep(remaining);
        } else if self.interval < medium_res_threshold() {
            std::thread::sleep(remaining.duration());
        } else {
            breaker.wait_for(remaining);
        }
        self.last = Some(Instant::now());
        (elapsed, true)
    }

    /// Chunked sleep calibrated with Welford's online algorithm: keep
    /// sleeping fixed chunks while the remaining time exceeds the estimated
    /// sleep overhead (mean + one stddev), then busy-wait the tail.
    fn precise_sleep(&mut self, dur: TimeSpan) {
        let end = Instant::now() + dur.duration();
        let dur_ns = dur.nanos() as f64;
        while dur_ns > self.sleep_estimate {
            let start = Instant::now();
            if start >= end {
                break;
            }
            std::thread::sleep(RESOLUTION.duration());
            let observed = (Instant::now() - start).as_nanos() as f64;
            let delta = observed - self.sleep_mean;
            self.sleep_mean += delta / self.sleep_count as f64;
            self.sleep_m2 += delta * (observed - self.sleep_mean);
            self.sleep_estimate =
                self.sleep_mean + (self.sleep_m2 / self.sleep_count as f64).sqrt();
            self.sleep_count += 1;
        }
        while Instant::now() < end {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{Breaker, Config};
    use crate::telem::MILLISECOND;

    fn test_breaker() -> Breaker {
        let b = Breaker::new(Config::named("timer-test"));
        b.start();
        b
    }

    #[test]
    fn first_wait_sleeps_full_interval() {
        let breaker = test_breaker();
        let mut timer = Timer::from_interval(MILLISECOND * 10);
        let start = Instant::now();
        let (_, slept) = timer.wait(&breaker);
        assert!(slept);
        assert!(start.elapsed().as_millis() >= 9);
    }

    #[test]
    fn overrun_returns_immediately() {
        let breaker = test_breaker();
        let mut timer = Timer::from_interval(MILLISECOND);
        timer.wait(&breaker);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let start = Instant::now();
        let (elapsed, slept) = timer.wait(&breaker);
        assert!(!slept);
        assert!(elapsed >= MILLISECOND * 5);
        assert!(start.elapsed().as_millis() < 5);
    }

    #[test]
    fn calibration_converges() {
        // Mean absolute deviation over the last fifth of cycles must not
        // exceed the first fifth: the Welford estimate only improves.
        let breaker = test_breaker();
        let interval = MILLISECOND * 2;
        let mut timer = Timer::from_rate(Rate::hz(500.0));
        let cycles = 50;
        let mut deviations = Vec::with_capacity(cycles);
        timer.wait(&breaker);
        let mut prev = Instant::now();
        for _ in 0..cycles {
            timer.wait(&breaker);
            let now = Instant::now();
            let actual = (now - prev).as_nanos() as i64;
            deviations.push((actual - interval.nanos()).abs() as f64);
            prev = now;
        }
        let fifth = cycles / 5;
        let early: f64 = deviations[..fifth].iter().sum::<f64>() / fifth as f64;
        let late: f64 = deviations[cycles - fifth..].iter().sum::<f64>() / fifth as f64;
        // Floor guards against a lucky, already-tight early window on an
        // otherwise idle machine.
        assert!(
            late <= early.max(250_000.0),
            "late-window deviation {late} exceeded early-window {early}"
        );
    }

    #[test]
    fn long_interval_wait_is_cancellable() {
        let breaker = test_breaker();
        let mut timer = Timer::from_interval(MILLISECOND * 200);
        let handle = {
            let breaker = breaker.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                timer.wait(&breaker);
                start.elapsed()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        breaker.stop();
        let elapsed = handle.join().unwrap();
        assert!(elapsed.as_millis() < 150);
    }
}
