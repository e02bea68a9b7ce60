//! The control pipeline: cluster streamer → hardware sink, plus a periodic
//! echo of the latest command state back to the cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use weir_cluster::{Client, Streamer, StreamerConfig, WriterConfig};
use weir_core::breaker::{self, Breaker};
use weir_core::errors;
use weir_core::frame::Frame;
use weir_core::telem::Rate;
use weir_core::timer::Timer;

use super::{Latch, Sink, RETRY_ON};

/// Owns the command and state threads of one write task.
pub struct Control {
    client: Arc<dyn Client>,
    streamer_config: StreamerConfig,
    writer_config: WriterConfig,
    sink: Arc<Mutex<dyn Sink>>,
    state_rate: Rate,
    cmd_breaker: Breaker,
    state_breaker: Breaker,
    running: Arc<AtomicBool>,
    streamer: Arc<Mutex<Option<Arc<dyn Streamer>>>>,
    latch: Arc<Latch>,
    threads: Vec<JoinHandle<()>>,
}

impl Control {
    pub fn new(
        client: Arc<dyn Client>,
        streamer_config: StreamerConfig,
        writer_config: WriterConfig,
        sink: Arc<Mutex<dyn Sink>>,
        breaker_config: breaker::Config,
        state_rate: Rate,
    ) -> Self {
        let cmd_breaker = Breaker::new(breaker::Config {
            name: format!("{}.cmd", breaker_config.name),
            ..breaker_config.clone()
        });
        let state_breaker = Breaker::new(breaker::Config {
            name: format!("{}.state", breaker_config.name),
            ..breaker_config
        });
        Self {
            client,
            streamer_config,
            writer_config,
            sink,
            state_rate,
            cmd_breaker,
            state_breaker,
            running: Arc::new(AtomicBool::new(false)),
            streamer: Arc::new(Mutex::new(None)),
            latch: Arc::new(Latch::new(0)),
            threads: Vec::new(),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the command and state threads. A no-op while already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cmd_breaker.reset();
        self.cmd_breaker.start();
        self.state_breaker.reset();
        self.state_breaker.start();
        // Both threads count the latch down on exit so stop observes full
        // teardown.
        self.latch = Arc::new(Latch::new(2));

        {
            let client = self.client.clone();
            let config = self.streamer_config.clone();
            let sink = self.sink.clone();
            let breaker = self.cmd_breaker.clone();
            let running = self.running.clone();
            let slot = self.streamer.clone();
            let latch = self.latch.clone();
            self.threads.push(std::thread::spawn(move || {
                run_commands(client, config, sink, &breaker, &running, &slot);
                latch.count_down();
                debug!("control command thread exited");
            }));
        }
        {
            let client = self.client.clone();
            let config = self.writer_config.clone();
            let sink = self.sink.clone();
            let breaker = self.state_breaker.clone();
            let running = self.running.clone();
            let rate = self.state_rate;
            let latch = self.latch.clone();
            self.threads.push(std::thread::spawn(move || {
                run_state_updates(client, config, sink, rate, &breaker, &running);
                latch.count_down();
                debug!("control state thread exited");
            }));
        }
    }

    /// Stops both threads and waits for full teardown.
    pub fn stop(&mut self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.cmd_breaker.stop();
        self.state_breaker.stop();
        if let Some(streamer) = self.streamer.lock().take() {
            streamer.close_send();
        }
        if was_running {
            self.latch.wait();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        was_running
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_commands(
    client: Arc<dyn Client>,
    config: StreamerConfig,
    sink: Arc<Mutex<dyn Sink>>,
    breaker: &Breaker,
    running: &AtomicBool,
    slot: &Mutex<Option<Arc<dyn Streamer>>>,
) {
    while running.load(Ordering::Acquire) {
        let streamer = match client.open_streamer(config.clone()) {
            Ok(s) => {
                *slot.lock() = Some(s.clone());
                s
            }
            Err(err) if err.matches_any(&RETRY_ON) => {
                if breaker.wait(&err.message()) {
                    continue;
                }
                return;
            }
            Err(err) => {
                warn!(error = %err, "command streamer open failed");
                return;
            }
        };
        breaker.reset();

        let reopen = loop {
            if !running.load(Ordering::Acquire) {
                break false;
            }
            match streamer.read() {
                Ok(frame) => {
                    if let Err(err) = sink.lock().write(&frame) {
                        // The sink wrapper owns fatal classification; the
                        // pipeline keeps pulling commands.
                        warn!(error = %err, "sink rejected command frame");
                    }
                }
                Err(err) if err.matches(errors::EOF) => break false,
                Err(err) if err.matches_any(&RETRY_ON) => {
                    if running.load(Ordering::Acquire) && breaker.wait(&err.message()) {
                        break true;
                    }
                    break false;
                }
                Err(err) => {
                    warn!(error = %err, "command streamer failed");
                    break false;
                }
            }
        };
        if !reopen {
            return;
        }
    }
}

fn run_state_updates(
    client: Arc<dyn Client>,
    config: WriterConfig,
    sink: Arc<Mutex<dyn Sink>>,
    state_rate: Rate,
    breaker: &Breaker,
    running: &AtomicBool,
) {
    let mut frame = Frame::new();
    while running.load(Ordering::Acquire) {
        let mut writer = match client.open_writer(config.clone()) {
            Ok(w) => w,
            Err(err) if err.matches_any(&RETRY_ON) => {
                if breaker.wait(&err.message()) {
                    continue;
                }
                return;
            }
            Err(err) => {
                warn!(error = %err, "state writer open failed");
                return;
            }
        };
        breaker.reset();

        let mut timer = Timer::from_rate(state_rate);
        let mut stream_err = None;
        while running.load(Ordering::Acquire) {
            timer.wait(breaker);
            if !running.load(Ordering::Acquire) {
                break;
            }
            // The sink mutex is the guard between command-thread updates
            // and this echo.
            if let Err(err) = sink.lock().read(breaker, &mut frame) {
                warn!(error = %err, "state echo read failed");
                continue;
            }
            if frame.has_no_samples() {
                continue;
            }
            if let Err(err) = writer.write(&frame) {
                stream_err = Some(err);
                break;
            }
        }

        let err = match writer.close() {
            Err(close_err) => stream_err.or(Some(close_err)),
            Ok(()) => stream_err,
        };
        match err {
            Some(err)
                if err.matches_any(&RETRY_ON)
                    && running.load(Ordering::Acquire)
                    && breaker.wait(&err.message()) =>
            {
                continue;
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use weir_cluster::mock::MockCluster;
    use weir_core::frame::ChannelKey;
    use weir_core::series::{DataType, Series};
    use weir_core::telem::MILLISECOND;

    const CMD_CH: ChannelKey = 20;
    const STATE_CH: ChannelKey = 21;

    struct TestSink {
        received: VecDeque<f64>,
        state: f64,
    }

    impl Sink for TestSink {
        fn write(&mut self, frame: &Frame) -> errors::Result<()> {
            if let Some(series) = frame.get(CMD_CH) {
                for i in 0..series.len() {
                    let v = series.at_f64(i).unwrap_or(0.0);
                    self.received.push_back(v);
                    self.state = v;
                }
            }
            Ok(())
        }

        fn set_authority(&mut self, _: &[ChannelKey], _: &[u8]) -> errors::Result<()> {
            Ok(())
        }

        fn read(&mut self, _breaker: &Breaker, frame: &mut Frame) -> errors::Result<()> {
            if frame.is_empty() {
                frame.push(STATE_CH, Series::with_capacity(DataType::Float64, 1));
            }
            frame.clear_data();
            frame.get_mut(STATE_CH).unwrap().push_f64(self.state)?;
            Ok(())
        }

        fn cmd_streamer_config(&self) -> StreamerConfig {
            StreamerConfig { channels: vec![CMD_CH] }
        }

        fn state_writer_config(&self) -> WriterConfig {
            WriterConfig::new(vec![STATE_CH])
        }
    }

    fn control(cluster: &MockCluster) -> (Control, Arc<Mutex<TestSink>>) {
        let sink = Arc::new(Mutex::new(TestSink { received: VecDeque::new(), state: 0.0 }));
        let breaker_config = breaker::Config {
            name: "ctl-test".to_string(),
            base_interval: MILLISECOND,
            max_retries: 5,
            scale: 1.0,
        };
        let ctl = Control::new(
            Arc::new(cluster.clone()),
            StreamerConfig { channels: vec![CMD_CH] },
            WriterConfig::new(vec![STATE_CH]),
            sink.clone(),
            breaker_config,
            Rate::hz(100.0),
        );
        (ctl, sink)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached within timeout");
    }

    #[test]
    fn commands_reach_the_sink() {
        let cluster = MockCluster::new();
        let (mut ctl, sink) = control(&cluster);
        ctl.start();
        // Give the command thread a moment to subscribe.
        std::thread::sleep(Duration::from_millis(20));
        cluster.push_frame(Frame::single(CMD_CH, Series::from_f64s(vec![0.5])));
        wait_for(|| !sink.lock().received.is_empty());
        ctl.stop();
        assert_eq!(sink.lock().received.pop_front(), Some(0.5));
    }

    #[test]
    fn state_echo_is_idempotent_without_commands() {
        let cluster = MockCluster::new();
        let (mut ctl, _) = control(&cluster);
        ctl.start();
        wait_for(|| cluster.written_to(STATE_CH).len() >= 3);
        ctl.stop();
        let echoes = cluster.written_to(STATE_CH);
        for series in &echoes {
            assert_eq!(series.at_f64(0), Some(0.0));
        }
    }

    #[test]
    fn state_echo_tracks_latest_command() {
        let cluster = MockCluster::new();
        let (mut ctl, sink) = control(&cluster);
        ctl.start();
        std::thread::sleep(Duration::from_millis(20));
        cluster.push_frame(Frame::single(CMD_CH, Series::from_f64s(vec![7.25])));
        wait_for(|| !sink.lock().received.is_empty());
        let before = cluster.written_to(STATE_CH).len();
        wait_for(|| cluster.written_to(STATE_CH).len() > before + 1);
        ctl.stop();
        let last = cluster.written_to(STATE_CH).pop().unwrap();
        assert_eq!(last.at_f64(0), Some(7.25));
    }

    #[test]
    fn stop_tears_down_both_threads() {
        let cluster = MockCluster::new();
        let (mut ctl, _) = control(&cluster);
        ctl.start();
        std::thread::sleep(Duration::from_millis(20));
        let begin = std::time::Instant::now();
        assert!(ctl.stop());
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert!(!ctl.running());
        // Idempotent.
        assert!(!ctl.stop());
    }
}
