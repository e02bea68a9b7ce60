//! The task contract: commands, the execution trait, and the context tasks
//! use to report status back to the cluster.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use weir_cluster::{Client, TaskKey, WriterConfig, TASK_STATE_CHANNEL};
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::series::{DataType, Series};

pub const START_CMD_TYPE: &str = "start";
pub const STOP_CMD_TYPE: &str = "stop";
pub const TARE_CMD_TYPE: &str = "tare";
pub const SCAN_CMD_TYPE: &str = "scan";
pub const SET_AUTHORITY_CMD_TYPE: &str = "set_authority";

/// A command executed on a task to change its state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    /// Key of the task to command.
    pub task: TaskKey,
    /// Command type, e.g. `start` or `tare`.
    #[serde(rename = "type")]
    pub cmd_type: String,
    /// Correlation id echoed in status responses.
    #[serde(default)]
    pub key: String,
    /// Command arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Command {
    pub fn new(task: TaskKey, cmd_type: &str, args: serde_json::Value) -> Self {
        Self { task, cmd_type: cmd_type.to_string(), key: String::new(), args }
    }

    /// Parses a command from its wire JSON.
    pub fn parse(raw: &str) -> errors::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::new(errors::VALIDATION, format!("invalid task command: {e}")))
    }
}

/// A long-running, configurable activity on a rack.
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Dispatches a command. Unknown command types are ignored.
    fn exec(&mut self, cmd: &Command);

    /// Stops the task. `will_reconfigure` suppresses the final state update
    /// when the task is being replaced rather than torn down.
    fn stop(&mut self, will_reconfigure: bool);
}

/// Successful output of task configuration.
pub struct ConfigureResult {
    pub task: Box<dyn Task>,
    /// When set, the factory requests an immediate synthesized `start`.
    pub auto_start: bool,
}

impl ConfigureResult {
    pub fn new(task: Box<dyn Task>) -> Self {
        Self { task, auto_start: false }
    }

    pub fn auto_start(task: Box<dyn Task>) -> Self {
        Self { task, auto_start: true }
    }
}

/// Shared services handed to every task: the cluster client and the task
/// state channel.
pub struct Context {
    pub client: Arc<dyn Client>,
    state: Mutex<StateWriter>,
}

struct StateWriter {
    channel: ChannelKey,
    writer: Option<Box<dyn weir_cluster::Writer>>,
}

impl Context {
    pub fn new(client: Arc<dyn Client>) -> Arc<Self> {
        Arc::new(Self { client, state: Mutex::new(StateWriter { channel: 0, writer: None }) })
    }

    /// Emits a task status payload on the task state channel. Failures are
    /// logged and the writer re-opened on the next call; status traffic must
    /// never take a task down.
    pub fn set_status(&self, status: &crate::status::TaskStatus) {
        let payload = match serde_json::to_string(status) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to serialize task status");
                return;
            }
        };
        let mut state = self.state.lock();
        if state.writer.is_none() {
            let channel = match self.client.retrieve_channel(TASK_STATE_CHANNEL) {
                Ok(ch) => ch,
                Err(err) => {
                    error!(error = %err, "failed to retrieve task state channel");
                    return;
                }
            };
            match self.client.open_writer(WriterConfig::new(vec![channel.key])) {
                Ok(w) => {
                    state.channel = channel.key;
                    state.writer = Some(w);
                }
                Err(err) => {
                    error!(error = %err, "failed to open task state writer");
                    return;
                }
            }
        }
        let channel = state.channel;
        let mut series = Series::with_capacity(DataType::Json, 1);
        let _ = series.push_string(payload);
        let frame = Frame::single(channel, series);
        let failed = match state.writer.as_mut() {
            Some(w) => w.write(&frame).is_err(),
            None => true,
        };
        if failed {
            error!("failed to write task status update, will reopen");
            if let Some(mut w) = state.writer.take() {
                let _ = w.close();
            }
        }
    }
}
