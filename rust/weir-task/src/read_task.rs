//! The reusable read task template: tare + status handling + an acquisition
//! pipeline over a hardware source.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use weir_cluster::Task as ClusterTask;
use weir_core::breaker;
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};
use weir_core::frame::Frame;

use crate::pipeline::{Acquisition, Source, StreamSource};
use crate::status::StatusHandler;
use crate::task::{Command, Context, Task, START_CMD_TYPE, STOP_CMD_TYPE, TARE_CMD_TYPE};
use crate::transform::{Chain, Tare, Transform};

/// Wraps the hardware source so shutdown is graceful when a read fails or
/// the pipeline cannot reach the cluster.
pub(crate) struct InternalSource {
    pub hardware: Box<dyn Source>,
    transforms: Chain,
    status: Arc<Mutex<StatusHandler>>,
    name: String,
}

impl StreamSource for InternalSource {
    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> errors::Result<()> {
        let res = self.hardware.read(breaker, frame);
        // Three cases: a temporary error triggers the breaker and surfaces
        // as a warning; a critical error propagates; a warning alone is
        // communicated and the read proceeds.
        if !res.error.ok() {
            if res.error.matches(errors::TEMPORARY_HARDWARE_ERROR) {
                warn!(task = %self.name, error = %res.error, "transient hardware error");
                self.status.lock().send_warning(&res.error.data);
            } else {
                error!(task = %self.name, error = %res.error, "hardware read failed");
            }
            return Err(res.error);
        }
        if !res.warning.is_empty() {
            warn!(task = %self.name, warning = %res.warning, "hardware warning");
            self.status.lock().send_warning(&res.warning);
        } else {
            self.status.lock().clear_warning();
        }
        self.transforms.transform(frame)
    }

    fn stopped_with_err(&mut self, err: &Error) {
        let _ = self.hardware.stop();
        let mut status = self.status.lock();
        status.error(err.clone());
        status.send_stop("");
    }
}

/// A task that pulls frames from hardware and pipes them to the cluster.
pub struct ReadTask {
    name: String,
    tare: Arc<Tare>,
    status: Arc<Mutex<StatusHandler>>,
    source: Arc<Mutex<InternalSource>>,
    pipe: Acquisition,
}

impl ReadTask {
    /// Builds a read task around a hardware source. `scale` carries the
    /// integration's per-channel scaling, applied after tare.
    pub fn new(
        ctx: &Arc<Context>,
        task: &ClusterTask,
        breaker_config: breaker::Config,
        source: Box<dyn Source>,
        scale: Option<Arc<dyn Transform>>,
    ) -> Self {
        let channels = source.channels();
        let tare = Arc::new(Tare::new(&channels));
        let mut transforms = Chain::new();
        transforms.add(tare.clone());
        if let Some(scale) = scale {
            transforms.add(scale);
        }
        let status = Arc::new(Mutex::new(StatusHandler::new(ctx.clone(), task)));
        let mut writer_config = source.writer_config();
        if writer_config.subject_name.is_empty() {
            writer_config.subject_name = task.name.clone();
        }
        let source = Arc::new(Mutex::new(InternalSource {
            hardware: source,
            transforms,
            status: status.clone(),
            name: task.name.clone(),
        }));
        let stream_source: Arc<Mutex<dyn StreamSource>> = source.clone();
        let pipe = Acquisition::new(
            ctx.client.clone(),
            writer_config,
            stream_source,
            breaker_config,
            task.name.clone(),
        );
        Self { name: task.name.clone(), tare, status, source, pipe }
    }

    /// Starts the task, echoing state against the given command key.
    /// Returns false when the task was already running or startup failed.
    pub fn start(&mut self, cmd_key: &str) -> bool {
        self.stop_inner("", false);
        self.status.lock().reset();
        if self.pipe.running() {
            return false;
        }
        let start_result = self.source.lock().hardware.start();
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
            if let Err(err) = self.source.lock().hardware.stop() {
                self.status.lock().error(err);
            }
        }
        if propagate_state {
            self.status.lock().send_stop(cmd_key);
        }
        stopped
    }
}

impl Task for ReadTask {
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
            TARE_CMD_TYPE => {
                if let Err(err) = self.tare.tare(&cmd.args) {
                    self.status.lock().send_warning(&err.data);
                }
            }
            _ => {}
        }
    }

    fn stop(&mut self, will_reconfigure: bool) {
        self.stop_inner("", !will_reconfigure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReadResult;
    use std::time::Duration;
    use weir_cluster::mock::MockCluster;
    use weir_cluster::{Channel, WriterConfig};
    use weir_core::series::{DataType, Series};
    use weir_core::telem::MILLISECOND;

    const CH: u32 = 30;

    struct FakeSource {
        started: bool,
        fail_start: bool,
        value: f64,
        warn_once: bool,
    }

    impl Source for FakeSource {
        fn start(&mut self) -> errors::Result<()> {
            if self.fail_start {
                return Err(Error::new(errors::CRITICAL_HARDWARE_ERROR, "no device"));
            }
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) -> errors::Result<()> {
            self.started = false;
            Ok(())
        }

        fn read(&mut self, _breaker: &Breaker, frame: &mut Frame) -> ReadResult {
            if frame.is_empty() {
                frame.push(CH, Series::with_capacity(DataType::Float64, 1));
            }
            frame.clear_data();
            let _ = frame.get_mut(CH).unwrap().push_f64(self.value);
            std::thread::sleep(Duration::from_millis(1));
            if self.warn_once {
                self.warn_once = false;
                return ReadResult::warning("signal saturated");
            }
            ReadResult::ok()
        }

        fn channels(&self) -> Vec<Channel> {
            vec![Channel {
                key: CH,
                name: "ai_0".to_string(),
                data_type: DataType::Float64,
                ..Channel::default()
            }]
        }

        fn writer_config(&self) -> WriterConfig {
            WriterConfig::new(vec![CH])
        }
    }

    fn read_task(cluster: &MockCluster, source: FakeSource) -> ReadTask {
        let ctx = Context::new(Arc::new(cluster.clone()));
        let task = ClusterTask {
            key: 100,
            name: "test read".to_string(),
            task_type: "mock_read".to_string(),
            ..ClusterTask::default()
        };
        let breaker_config = breaker::Config {
            name: "read-test".to_string(),
            base_interval: MILLISECOND,
            max_retries: 3,
            scale: 1.0,
        };
        ReadTask::new(&ctx, &task, breaker_config, Box::new(source), None)
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
    fn start_stop_lifecycle_reports_status() {
        let cluster = MockCluster::new();
        let mut task = read_task(
            &cluster,
            FakeSource { started: false, fail_start: false, value: 1.5, warn_once: false },
        );
        task.exec(&Command {
            task: 100,
            cmd_type: START_CMD_TYPE.to_string(),
            key: "c1".to_string(),
            args: serde_json::Value::Null,
        });
        wait_for(|| !cluster.written_to(CH).is_empty());
        task.exec(&Command {
            task: 100,
            cmd_type: STOP_CMD_TYPE.to_string(),
            key: "c2".to_string(),
            args: serde_json::Value::Null,
        });
        let states = cluster.task_states();
        assert!(states.len() >= 2);
        assert_eq!(states[0]["variant"], "success");
        assert_eq!(states[0]["details"]["running"], true);
        assert_eq!(states[0]["details"]["cmd"], "c1");
        let last = states.last().unwrap();
        assert_eq!(last["details"]["running"], false);
        assert_eq!(last["details"]["cmd"], "c2");
    }

    #[test]
    fn failed_hardware_start_latches_error() {
        let cluster = MockCluster::new();
        let mut task = read_task(
            &cluster,
            FakeSource { started: false, fail_start: true, value: 0.0, warn_once: false },
        );
        assert!(!task.start("c1"));
        let states = cluster.task_states();
        assert_eq!(states[0]["variant"], "error");
        assert_eq!(states[0]["details"]["running"], false);
        assert_eq!(states[0]["message"], "no device");
    }

    #[test]
    fn tare_flows_through_pipeline() {
        let cluster = MockCluster::new();
        let mut task = read_task(
            &cluster,
            FakeSource { started: false, fail_start: false, value: 4.0, warn_once: false },
        );
        task.start("");
        wait_for(|| !cluster.written_to(CH).is_empty());
        task.exec(&Command {
            task: 100,
            cmd_type: TARE_CMD_TYPE.to_string(),
            key: String::new(),
            args: serde_json::json!({ "keys": [CH] }),
        });
        let before = cluster.written_to(CH).len();
        wait_for(|| cluster.written_to(CH).len() > before + 1);
        task.stop(false);
        let series = cluster.written_to(CH);
        // Post-tare frames read 0.0: the 4.0 average was subtracted.
        assert_eq!(series.last().unwrap().at_f64(0), Some(0.0));
        assert_eq!(series.first().unwrap().at_f64(0), Some(4.0));
    }

    #[test]
    fn source_warning_forwarded_then_cleared() {
        let cluster = MockCluster::new();
        let mut task = read_task(
            &cluster,
            FakeSource { started: false, fail_start: false, value: 1.0, warn_once: true },
        );
        task.start("");
        wait_for(|| {
            cluster
                .task_states()
                .iter()
                .any(|s| s["variant"] == "warning" && s["message"] == "signal saturated")
        });
        // The next clean read restores success.
        wait_for(|| {
            cluster.task_states().iter().any(|s| s["message"] == "Task running")
        });
        task.stop(false);
    }
}
