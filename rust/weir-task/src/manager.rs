//! The task manager: demultiplexes the cluster event stream onto per-task
//! commands and owns every task's lifecycle on this rack.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use weir_cluster::{
    Client, Rack, Streamer, StreamerConfig, TaskKey, TASK_CMD_CHANNEL, TASK_DELETE_CHANNEL,
    TASK_SET_CHANNEL,
};
use weir_core::breaker::{self, Breaker};
use weir_core::errors::{self, Error};
use weir_core::frame::ChannelKey;
use weir_core::series::Series;

use crate::factory::MultiFactory;
use crate::task::{Command, Context, Task};

/// Channel keys the manager demuxes on.
struct StreamChannels {
    task_set: ChannelKey,
    task_delete: ChannelKey,
    task_cmd: ChannelKey,
}

/// Owns the rack's tasks and the worker thread driving them.
pub struct Manager {
    rack: Rack,
    ctx: Arc<Context>,
    factory: Arc<MultiFactory>,
    breaker: Breaker,
    streamer: Arc<Mutex<Option<Arc<dyn Streamer>>>>,
    worker: Option<JoinHandle<errors::Result<()>>>,
}

impl Manager {
    pub fn new(
        rack: Rack,
        client: Arc<dyn Client>,
        factory: MultiFactory,
        breaker_config: breaker::Config,
    ) -> Self {
        Self {
            rack,
            ctx: Context::new(client),
            factory: Arc::new(factory),
            breaker: Breaker::new(breaker_config),
            streamer: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Retrieves the control channels, opens the event streamer (retrying
    /// while the cluster is unreachable), materializes initial tasks, and
    /// spawns the worker.
    pub fn start(&mut self) -> errors::Result<()> {
        info!(rack = %self.rack.name, "starting task manager");
        self.breaker.reset();
        self.breaker.start();
        let (channels, streamer) = loop {
            match self.open_stream() {
                Ok(opened) => break opened,
                Err(err) if err.matches(errors::UNREACHABLE) && self.breaker.wait(&err.message()) => {
                    continue
                }
                Err(err) => return Err(err),
            }
        };
        self.breaker.reset();
        *self.streamer.lock() = Some(streamer.clone());

        let mut tasks: HashMap<TaskKey, Box<dyn Task>> = HashMap::new();
        for (descriptor, task) in self.factory.configure_initial_tasks(&self.ctx, &self.rack) {
            tasks.insert(descriptor.key, task);
        }

        let ctx = self.ctx.clone();
        let factory = self.factory.clone();
        let breaker = self.breaker.clone();
        let slot = self.streamer.clone();
        self.worker = Some(std::thread::spawn(move || {
            let result = run(ctx, factory, channels, streamer, &breaker, &slot, &mut tasks);
            for (key, mut task) in tasks.drain() {
                debug!(task = key, "stopping task on manager shutdown");
                task.stop(false);
            }
            result
        }));
        Ok(())
    }

    fn open_stream(&self) -> errors::Result<(StreamChannels, Arc<dyn Streamer>)> {
        let client = &self.ctx.client;
        let task_set = client.retrieve_channel(TASK_SET_CHANNEL)?;
        let task_delete = client.retrieve_channel(TASK_DELETE_CHANNEL)?;
        let task_cmd = client.retrieve_channel(TASK_CMD_CHANNEL)?;
        let streamer = client.open_streamer(StreamerConfig {
            channels: vec![task_set.key, task_delete.key, task_cmd.key],
        })?;
        Ok((
            StreamChannels {
                task_set: task_set.key,
                task_delete: task_delete.key,
                task_cmd: task_cmd.key,
            },
            streamer,
        ))
    }

    /// Closes the streamer send side so the worker observes EOF and exits,
    /// then joins it, returning the worker's exit error if any.
    pub fn stop(&mut self) -> errors::Result<()> {
        if let Some(streamer) = self.streamer.lock().take() {
            streamer.close_send();
        }
        self.breaker.stop();
        match self.worker.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(Error::new(errors::UNEXPECTED, "task manager worker panicked"))
            }),
            None => Ok(()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    ctx: Arc<Context>,
    factory: Arc<MultiFactory>,
    channels: StreamChannels,
    mut streamer: Arc<dyn Streamer>,
    breaker: &Breaker,
    slot: &Mutex<Option<Arc<dyn Streamer>>>,
    tasks: &mut HashMap<TaskKey, Box<dyn Task>>,
) -> errors::Result<()> {
    loop {
        match streamer.read() {
            Ok(frame) => {
                for (key, series) in frame.iter() {
                    if key == channels.task_set {
                        process_task_set(&ctx, &factory, series, tasks);
                    } else if key == channels.task_delete {
                        process_task_delete(series, tasks);
                    } else if key == channels.task_cmd {
                        process_task_cmd(series, tasks);
                    }
                }
            }
            // EOF is a clean shutdown signal from stop().
            Err(err) if err.matches(errors::EOF) => return Ok(()),
            Err(err) if err.matches(errors::UNREACHABLE) => {
                let reopened = loop {
                    if !breaker.wait(&err.message()) {
                        return Err(err);
                    }
                    match ctx.client.open_streamer(StreamerConfig {
                        channels: vec![channels.task_set, channels.task_delete, channels.task_cmd],
                    }) {
                        Ok(s) => break s,
                        Err(reopen_err) if reopen_err.matches(errors::UNREACHABLE) => continue,
                        Err(reopen_err) => return Err(reopen_err),
                    }
                };
                breaker.reset();
                *slot.lock() = Some(reopened.clone());
                streamer = reopened;
            }
            Err(err) => return Err(err),
        }
    }
}

fn process_task_set(
    ctx: &Arc<Context>,
    factory: &MultiFactory,
    series: &Series,
    tasks: &mut HashMap<TaskKey, Box<dyn Task>>,
) {
    for key in series.u64s() {
        if let Some(mut existing) = tasks.remove(&key) {
            debug!(task = key, "stopping existing task for reconfigure");
            existing.stop(true);
        }
        let descriptor = match ctx.client.retrieve_task(key) {
            Ok(d) => d,
            Err(err) => {
                warn!(task = key, error = %err, "failed to retrieve task descriptor");
                continue;
            }
        };
        info!(task = key, name = %descriptor.name, "configuring task");
        if let Some(task) = factory.configure_task(ctx, &descriptor) {
            tasks.insert(key, task);
        }
    }
}

fn process_task_delete(series: &Series, tasks: &mut HashMap<TaskKey, Box<dyn Task>>) {
    for key in series.u64s() {
        if let Some(mut task) = tasks.remove(&key) {
            info!(task = key, "deleting task");
            task.stop(false);
        }
    }
}

fn process_task_cmd(series: &Series, tasks: &mut HashMap<TaskKey, Box<dyn Task>>) {
    let Some(raw_commands) = series.strings() else {
        warn!("task command series is not string-typed");
        return;
    };
    for raw in raw_commands {
        let cmd = match Command::parse(raw) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(error = %err, "failed to parse task command");
                continue;
            }
        };
        match tasks.get_mut(&cmd.task) {
            Some(task) => task.exec(&cmd),
            None => warn!(task = cmd.task, "could not find task to execute command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Factory;
    use crate::status::StatusHandler;
    use crate::task::{ConfigureResult, START_CMD_TYPE, STOP_CMD_TYPE};
    use serde_json::json;
    use std::time::Duration;
    use weir_cluster::mock::MockCluster;
    use weir_cluster::Task as ClusterTask;
    use weir_core::frame::Frame;
    use weir_core::series::DataType;
    use weir_core::telem::MILLISECOND;

    /// A task that only tracks running state through the status handler.
    struct BenchTask {
        name: String,
        status: StatusHandler,
        running: bool,
    }

    impl Task for BenchTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn exec(&mut self, cmd: &Command) {
            match cmd.cmd_type.as_str() {
                START_CMD_TYPE => {
                    self.running = true;
                    self.status.send_start(&cmd.key);
                }
                STOP_CMD_TYPE => {
                    self.running = false;
                    self.status.send_stop(&cmd.key);
                }
                _ => {}
            }
        }

        fn stop(&mut self, will_reconfigure: bool) {
            self.running = false;
            if !will_reconfigure {
                self.status.send_stop("");
            }
        }
    }

    struct BenchFactory;

    impl Factory for BenchFactory {
        fn name(&self) -> &'static str {
            "bench"
        }

        fn configure_task(
            &self,
            ctx: &Arc<Context>,
            task: &ClusterTask,
        ) -> Option<Result<ConfigureResult, Error>> {
            if !task.task_type.starts_with("bench_") {
                return None;
            }
            let auto_start = task.config["auto_start"].as_bool().unwrap_or(false);
            let bench = Box::new(BenchTask {
                name: task.name.clone(),
                status: StatusHandler::new(ctx.clone(), task),
                running: false,
            });
            Some(Ok(if auto_start {
                ConfigureResult::auto_start(bench)
            } else {
                ConfigureResult::new(bench)
            }))
        }
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

    fn manager(cluster: &MockCluster) -> (Manager, Rack) {
        let rack = cluster.create_rack("test-rack").unwrap();
        let factory = MultiFactory::new(vec![Arc::new(BenchFactory)]);
        let breaker_config = breaker::Config {
            name: "mgr-test".to_string(),
            base_interval: MILLISECOND,
            max_retries: 5,
            scale: 1.0,
        };
        (
            Manager::new(rack.clone(), Arc::new(cluster.clone()), factory, breaker_config),
            rack,
        )
    }

    fn push_task_set(cluster: &MockCluster, keys: Vec<u64>) {
        let ch = cluster.retrieve_channel(TASK_SET_CHANNEL).unwrap();
        cluster.push_frame(Frame::single(ch.key, Series::from_u64s(keys)));
    }

    fn push_task_cmd(cluster: &MockCluster, cmd: serde_json::Value) {
        let ch = cluster.retrieve_channel(TASK_CMD_CHANNEL).unwrap();
        let mut series = Series::with_capacity(DataType::String, 1);
        series.push_string(cmd.to_string()).unwrap();
        cluster.push_frame(Frame::single(ch.key, series));
    }

    #[test]
    fn set_configures_auto_start_then_cmd_stops() {
        let cluster = MockCluster::new();
        let (mut mgr, rack) = manager(&cluster);
        let task = cluster
            .create_task(&ClusterTask {
                key: weir_cluster::task_key(rack.key, 100),
                name: "bench read".to_string(),
                task_type: "bench_analog_read".to_string(),
                config: json!({ "auto_start": true }),
                ..ClusterTask::default()
            })
            .unwrap();
        mgr.start().unwrap();

        push_task_set(&cluster, vec![task.key]);
        wait_for(|| {
            cluster
                .task_states()
                .iter()
                .any(|s| s["variant"] == "success" && s["details"]["running"] == true)
        });

        push_task_cmd(
            &cluster,
            json!({ "task": task.key, "type": "stop", "key": "k1" }),
        );
        wait_for(|| {
            cluster.task_states().iter().any(|s| {
                s["variant"] == "success"
                    && s["details"]["running"] == false
                    && s["details"]["cmd"] == "k1"
            })
        });
        mgr.stop().unwrap();
    }

    #[test]
    fn delete_stops_and_removes() {
        let cluster = MockCluster::new();
        let (mut mgr, rack) = manager(&cluster);
        let task = cluster
            .create_task(&ClusterTask {
                key: weir_cluster::task_key(rack.key, 5),
                name: "bench".to_string(),
                task_type: "bench_read".to_string(),
                config: json!({ "auto_start": true }),
                ..ClusterTask::default()
            })
            .unwrap();
        mgr.start().unwrap();
        push_task_set(&cluster, vec![task.key]);
        wait_for(|| !cluster.task_states().is_empty());

        let ch = cluster.retrieve_channel(TASK_DELETE_CHANNEL).unwrap();
        cluster.push_frame(Frame::single(ch.key, Series::from_u64s(vec![task.key])));
        wait_for(|| {
            cluster
                .task_states()
                .iter()
                .any(|s| s["details"]["running"] == false)
        });

        // Commands for the deleted task are dropped with a warning.
        push_task_cmd(&cluster, json!({ "task": task.key, "type": "start", "key": "x" }));
        std::thread::sleep(Duration::from_millis(20));
        mgr.stop().unwrap();
        let running_after_delete = cluster
            .task_states()
            .iter()
            .filter(|s| s["details"]["cmd"] == "x")
            .count();
        assert_eq!(running_after_delete, 0);
    }

    #[test]
    fn unknown_task_keys_are_skipped() {
        let cluster = MockCluster::new();
        let (mut mgr, _) = manager(&cluster);
        mgr.start().unwrap();
        // No descriptor exists for key 999; the manager logs and moves on.
        push_task_set(&cluster, vec![999]);
        std::thread::sleep(Duration::from_millis(20));
        mgr.stop().unwrap();
        assert!(cluster.task_states().is_empty());
    }

    #[test]
    fn set_replaces_existing_task() {
        let cluster = MockCluster::new();
        let (mut mgr, rack) = manager(&cluster);
        let task = cluster
            .create_task(&ClusterTask {
                key: weir_cluster::task_key(rack.key, 8),
                name: "bench".to_string(),
                task_type: "bench_read".to_string(),
                config: json!({ "auto_start": false }),
                ..ClusterTask::default()
            })
            .unwrap();
        mgr.start().unwrap();
        push_task_set(&cluster, vec![task.key]);
        wait_for(|| cluster.task_states().len() >= 1);
        push_task_set(&cluster, vec![task.key]);
        wait_for(|| cluster.task_states().len() >= 2);
        mgr.stop().unwrap();
        let configured = cluster
            .task_states()
            .iter()
            .filter(|s| s["message"] == "Task configured successfully")
            .count();
        assert_eq!(configured, 2);
    }

    #[test]
    fn startup_retries_while_unreachable() {
        let cluster = MockCluster::new();
        cluster.fail_next_streamer_opens(vec![
            Error::new(errors::UNREACHABLE, "down"),
            Error::new(errors::UNREACHABLE, "down"),
        ]);
        let (mut mgr, _) = manager(&cluster);
        mgr.start().unwrap();
        mgr.stop().unwrap();
    }
}
