//! The two pipelines coupling hardware I/O to the cluster, and the
//! source/sink contracts they consume.

pub mod acquisition;
pub mod control;

pub use acquisition::Acquisition;
pub use control::Control;

use parking_lot::{Condvar, Mutex};

use weir_cluster::{Channel, StreamerConfig, WriterConfig};
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};

/// Errors the pipelines retry instead of escalating.
pub const RETRY_ON: [&str; 2] = [errors::UNREACHABLE, errors::STREAM_CLOSED];

/// Outcome of one hardware read.
///
/// A source may return both a warning and a non-nil error; the status
/// handler forwards the error and drops the warning.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub error: Error,
    pub warning: String,
}

impl ReadResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(error: Error) -> Self {
        Self { error, warning: String::new() }
    }

    pub fn warning(warning: impl Into<String>) -> Self {
        Self { error: Error::nil(), warning: warning.into() }
    }
}

/// A hardware data source consumed by read tasks.
///
/// The frame handed to `read` is reused across calls: implementations size
/// the series once, then clear and rewrite them on every call.
pub trait Source: Send {
    /// Called before the acquisition pipeline starts. A returned error
    /// aborts startup.
    fn start(&mut self) -> errors::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> errors::Result<()> {
        Ok(())
    }

    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> ReadResult;

    fn channels(&self) -> Vec<Channel>;

    fn writer_config(&self) -> WriterConfig;
}

/// A hardware setpoint sink consumed by write tasks.
pub trait Sink: Send {
    fn start(&mut self) -> errors::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> errors::Result<()> {
        Ok(())
    }

    /// Pushes a command frame's setpoints to the hardware.
    fn write(&mut self, frame: &Frame) -> errors::Result<()>;

    fn set_authority(&mut self, keys: &[ChannelKey], authorities: &[u8]) -> errors::Result<()>;

    /// State echo: fills `frame` with the current command state so the
    /// control pipeline can mirror it back to the cluster.
    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> errors::Result<()>;

    fn cmd_streamer_config(&self) -> StreamerConfig;

    fn state_writer_config(&self) -> WriterConfig;
}

/// The stream the acquisition pipeline pulls from: a task-owned wrapper
/// around a hardware [`Source`] that folds in transforms and status
/// reporting.
pub trait StreamSource: Send {
    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> errors::Result<()>;

    /// Invoked when the pipeline halts on a fatal error so the owning task
    /// can latch it and report a stop.
    fn stopped_with_err(&mut self, _err: &Error) {}
}

/// Countdown latch used to observe full pipeline teardown.
pub struct Latch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self { count: Mutex::new(count), cv: Condvar::new() }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }
}
