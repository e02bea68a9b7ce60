//! The reusable write task template: status handling + a control pipeline
//! over a hardware sink.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{error, warn};

use weir_cluster::{StreamerConfig, Task as ClusterTask, WriterConfig};
use weir_core::breaker;
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::telem::Rate;

use crate::pipeline::{Control, Sink};
use crate::status::StatusHandler;
use crate::task::{
    Command, Context, Task, SET_AUTHORITY_CMD_TYPE, START_CMD_TYPE, STOP_CMD_TYPE,
};

/// Wraps the hardware sink with status classification: temporary errors
/// become warnings, anything else latches on the status handler.
struct InternalSink {
    hardware: Box<dyn Sink>,
    status: Arc<Mutex<StatusHandler>>,
    name: String,
}

impl Sink for InternalSink {
    fn start(&mut self) -> errors::Result<()> {
        self.hardware.start()
    }

    fn stop(&mut self) -> errors::Result<()> {
        self.hardware.stop()
    }

    fn write(&mut self, frame: &Frame) -> errors::Result<()> {
        match self.hardware.write(frame) {
            Ok(()) => {
                self.status.lock().clear_warning();
                Ok(())
            }
            Err(err) if err.matches(errors::TEMPORARY_HARDWARE_ERROR) => {
                warn!(task = %self.name, error = %err, "transient sink error");
                self.status.lock().send_warning(&err.data);
                Err(err)
            }
            Err(err) => {
                error!(task = %self.name, error = %err, "sink write failed");
                let mut status = self.status.lock();
                status.error(err.clone());
                status.send_warning("");
                Err(err)
            }
        }
    }

    fn set_authority(&mut self, keys: &[ChannelKey], authorities: &[u8]) -> errors::Result<()> {
        self.hardware.set_authority(keys, authorities)
    }

    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> errors::Result<()> {
        self.hardware.read(breaker, frame)
    }

    fn cmd_streamer_config(&self) -> StreamerConfig {
        self.hardware.cmd_streamer_config()
    }

    fn state_writer_config(&self) -> WriterConfig {
        self.hardware.state_writer_config()
    }
}

#[derive(Deserialize)]
struct SetAuthorityArgs {
    #[serde(default)]
    keys: Vec<ChannelKey>,
    authorities: Vec<u8>,
}

/// A task that streams setpoint commands from the cluster into hardware and
/// echoes command state back.
pub struct WriteTask {
    name: String,
    status: Arc<Mutex<StatusHandler>>,
    sink: Arc<Mutex<InternalSink>>,
    pipe: Control,
}

impl WriteTask {
    pub fn new(
        ctx: &Arc<Context>,
        task: &ClusterTask,
        breaker_config: breaker::Config,
        sink: Box<dyn Sink>,
        state_rate: Rate,
    ) -> Self {
        let status = Arc::new(Mutex::new(StatusHandler::new(ctx.clone(), task)));
        let streamer_config = sink.cmd_streamer_config();
        let mut writer_config = sink.state_writer_config();
        if writer_config.subject_name.is_empty() {
            writer_config.subject_name = task.name.clone();
        }
        let sink = Arc::new(Mutex::new(InternalSink {
            hardware: sink,
            status: status.clone(),
            name: task.name.clone(),
        }));
        let shared_sink: Arc<Mutex<dyn Sink>> = sink.clone();
        let pipe = Control::new(
            ctx.client.clone(),
            streamer_config,
            writer_config,
            shared_sink,
            breaker_config,
            state_rate,
        );
        Self { name: task.name.clone(), status, sink, pipe }
    }

    pub fn start(&mut self, cmd_key: &str) -> bool {
        self.stop_inner("", false);
        self.status.lock().reset();
        if self.pipe.running() {
            return false;
        }
        let start_result = self.sink.lock().hardware.start();
        let start_ok = match start_result {
            Ok(()) => true,
            Err(err) => !self.status.lock().error(err),
        };
        if start_ok {
            self.pipe.start();
        }
        self.status.lock().send_start(cmd_key);
        start_ok
    }

    fn stop_inner(&mut self, cmd_key: &str, propagate_state: bool) -> bool {
        let stopped = self.pipe.stop();
        if stopped {
            if let Err(err) = self.sink.lock().hardware.stop() {
                self.status.lock().error(err);
            }
        }
        if propagate_state {
            self.status.lock().send_stop(cmd_key);
        }
        stopped
    }

    fn set_authority(&mut self, cmd: &Command) {
        let args: SetAuthorityArgs = match serde_json::from_value(cmd.args.clone()) {
            Ok(a) => a,
            Err(e) => {
                self.status.lock().send_warning(&format!("invalid set_authority args: {e}"));
                return;
            }
        };
        if let Err(err) = self.sink.lock().set_authority(&args.keys, &args.authorities) {
            self.status.lock().send_warning(&err.data);
        }
    }
}

impl Task for WriteTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&mut self, cmd: &Command) {
        match cmd.cmd_type.as_str() {
            START_CMD_TYPE => {
                self.start(&cmd.key);
            }
            STOP_CMD_TYPE => {
                self.stop_inner(&cmd.key, true);
            }
            SET_AUTHORITY_CMD_TYPE => self.set_authority(cmd),
            _ => {}
        }
    }

    fn stop(&mut self, will_reconfigure: bool) {
        self.stop_inner("", !will_reconfigure);
    }
}
