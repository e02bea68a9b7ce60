//! The acquisition pipeline: hardware source → cluster writer.
//!
//! Intentionally built to ride through transient hardware and network
//! failures by retrying at scaled intervals; anything non-transient stops
//! the owning task through `stopped_with_err`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;

use weir_cluster::{Client, WriterConfig};
use weir_core::breaker::{self, Breaker};
use weir_core::errors::{self, Error};
use weir_core::frame::Frame;

use super::{StreamSource, RETRY_ON};

/// Owns one thread that reads from a source and writes to the cluster.
pub struct Acquisition {
    client: Arc<dyn Client>,
    writer_config: WriterConfig,
    source: Arc<Mutex<dyn StreamSource>>,
    breaker: Breaker,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

impl Acquisition {
    pub fn new(
        client: Arc<dyn Client>,
        writer_config: WriterConfig,
        source: Arc<Mutex<dyn StreamSource>>,
        breaker_config: breaker::Config,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            writer_config,
            source,
            breaker: Breaker::new(breaker_config),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            name: name.into(),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the pipeline thread. A no-op while already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.breaker.reset();
        self.breaker.start();
        let client = self.client.clone();
        let config = self.writer_config.clone();
        let source = self.source.clone();
        let breaker = self.breaker.clone();
        let running = self.running.clone();
        let name = self.name.clone();
        self.thread = Some(std::thread::spawn(move || {
            run(client, config, source, &breaker, &running);
            running.store(false, Ordering::Release);
            debug!(pipeline = %name, "acquisition pipeline exited");
        }));
    }

    /// Stops the pipeline and joins the thread. Returns whether the
    /// pipeline was running. Joining is skipped when called from the
    /// pipeline thread itself (the fatal-error path).
    pub fn stop(&mut self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.breaker.stop();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == std::thread::current().id() {
                self.thread = Some(handle);
            } else {
                let _ = handle.join();
            }
        }
        was_running
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    client: Arc<dyn Client>,
    config: WriterConfig,
    source: Arc<Mutex<dyn StreamSource>>,
    breaker: &Breaker,
    running: &AtomicBool,
) {
    // Sized on first read; cleared and rewritten every cycle after that.
    let mut frame = Frame::new();
    while running.load(Ordering::Acquire) {
        let mut writer = match client.open_writer(config.clone()) {
            Ok(w) => w,
            Err(err) if err.matches(errors::UNREACHABLE) => {
                if breaker.wait(&err.message()) {
                    continue;
                }
                return;
            }
            Err(err) => {
                source.lock().stopped_with_err(&err);
                return;
            }
        };
        breaker.reset();

        let mut stream_err: Option<Error> = None;
        while running.load(Ordering::Acquire) {
            // Bind before matching: the source lock must not be held while
            // the error arms re-lock to escalate.
            let read_result = {
                let mut guard = source.lock();
                guard.read(breaker, &mut frame)
            };
            match read_result {
                Ok(()) => {}
                Err(err) if err.matches(errors::TEMPORARY_HARDWARE_ERROR) => {
                    // Return through the breaker so retries back off, then
                    // keep reading. The status handler already carries the
                    // warning.
                    if breaker.wait(&err.message()) {
                        continue;
                    }
                    running.store(false, Ordering::Release);
                    break;
                }
                Err(err) => {
                    source.lock().stopped_with_err(&err);
                    running.store(false, Ordering::Release);
                    break;
                }
            }
            breaker.reset();
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
            Some(err) if !err.matches_any(&RETRY_ON) => {
                source.lock().stopped_with_err(&err);
                return;
            }
            _ => return,
        }
    }
}
