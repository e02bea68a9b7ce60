//! Rack liveness: one 64-bit sample per second on the heartbeat channel,
//! encoded as `(rack_key << 32) | version`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info};

use weir_cluster::{
    Client, Rack, RackKey, Task as ClusterTask, WriterConfig, RACK_HEARTBEAT_CHANNEL,
};
use weir_core::breaker::{self, Breaker};
use weir_core::errors;
use weir_core::frame::Frame;
use weir_core::series::Series;
use weir_core::telem::SECOND;

use crate::task::{Command, ConfigureResult, Context, Task};

pub const HEARTBEAT_TASK_TYPE: &str = "heartbeat";

/// The heartbeat task. Created internally by its factory on rack startup
/// and runs for the life of the task manager.
pub struct Heartbeat {
    name: String,
    client: Arc<dyn Client>,
    rack_key: RackKey,
    breaker: Breaker,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(client: Arc<dyn Client>, rack_key: RackKey, breaker_config: breaker::Config) -> Self {
        Self {
            name: "heartbeat".to_string(),
            client,
            rack_key,
            breaker: Breaker::new(breaker_config),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(rack = self.rack_key, "starting heartbeat");
        self.breaker.reset();
        self.breaker.start();
        let client = self.client.clone();
        let rack_key = self.rack_key;
        let breaker = self.breaker.clone();
        let running = self.running.clone();
        self.thread = Some(std::thread::spawn(move || {
            run(client, rack_key, &breaker, &running);
            debug!(rack = rack_key, "heartbeat stopped");
        }));
    }

    pub fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        self.breaker.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run(client: Arc<dyn Client>, rack_key: RackKey, breaker: &Breaker, running: &AtomicBool) {
    let mut version: u32 = 0;
    while running.load(Ordering::Acquire) {
        let result = run_guarded(&client, rack_key, breaker, running, &mut version);
        match result {
            Err(err) if err.matches(errors::UNREACHABLE) && breaker.wait(&err.message()) => {
                continue;
            }
            _ => return,
        }
    }
}

fn run_guarded(
    client: &Arc<dyn Client>,
    rack_key: RackKey,
    breaker: &Breaker,
    running: &AtomicBool,
    version: &mut u32,
) -> errors::Result<()> {
    let channel = client.retrieve_channel(RACK_HEARTBEAT_CHANNEL)?;
    let mut writer = client.open_writer(WriterConfig::new(vec![channel.key]))?;
    breaker.reset();
    while running.load(Ordering::Acquire) {
        // Upper 32 bits carry the rack key, lower 32 the version counter.
        let beat = ((rack_key as u64) << 32) | *version as u64;
        if let Err(err) = writer.write(&Frame::single(channel.key, Series::from_u64s(vec![beat]))) {
            let _ = writer.close();
            return Err(err);
        }
        *version = version.wrapping_add(1);
        breaker.wait_for(SECOND);
    }
    writer.close()
}

impl Task for Heartbeat {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&mut self, cmd: &Command) {
        match cmd.cmd_type.as_str() {
            crate::task::START_CMD_TYPE => self.start(),
            crate::task::STOP_CMD_TYPE => self.halt(),
            _ => {}
        }
    }

    fn stop(&mut self, _will_reconfigure: bool) {
        self.halt();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Materializes the per-rack heartbeat task.
pub struct HeartbeatFactory {
    breaker_config: breaker::Config,
}

impl HeartbeatFactory {
    pub fn new(breaker_config: breaker::Config) -> Self {
        Self { breaker_config }
    }
}

impl crate::factory::Factory for HeartbeatFactory {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Result<ConfigureResult, errors::Error>> {
        if task.task_type != HEARTBEAT_TASK_TYPE {
            return None;
        }
        let heartbeat = Heartbeat::new(
            ctx.client.clone(),
            weir_cluster::task_rack_key(task.key),
            self.breaker_config.clone(),
        );
        Some(Ok(ConfigureResult::auto_start(Box::new(heartbeat))))
    }

    fn configure_initial_tasks(
        &self,
        ctx: &Arc<Context>,
        rack: &Rack,
    ) -> Vec<(ClusterTask, Box<dyn Task>)> {
        let existing = ctx
            .client
            .retrieve_rack_tasks(rack.key)
            .unwrap_or_default()
            .into_iter()
            .find(|t| t.task_type == HEARTBEAT_TASK_TYPE);
        let descriptor = match existing {
            Some(t) => t,
            None => {
                let template = ClusterTask {
                    key: weir_cluster::task_key(rack.key, 0),
                    name: "heartbeat".to_string(),
                    task_type: HEARTBEAT_TASK_TYPE.to_string(),
                    internal: true,
                    ..ClusterTask::default()
                };
                match ctx.client.create_task(&template) {
                    Ok(t) => t,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to create heartbeat task");
                        return Vec::new();
                    }
                }
            }
        };
        let mut heartbeat =
            Heartbeat::new(ctx.client.clone(), rack.key, self.breaker_config.clone());
        heartbeat.start();
        vec![(descriptor, Box::new(heartbeat) as Box<dyn Task>)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Factory as _;
    use std::time::Duration;
    use weir_cluster::mock::MockCluster;
    use weir_core::telem::MILLISECOND;

    fn fast_breaker() -> breaker::Config {
        breaker::Config {
            name: "hb-test".to_string(),
            base_interval: MILLISECOND,
            max_retries: 3,
            scale: 1.0,
        }
    }

    #[test]
    fn beats_encode_rack_and_version() {
        let cluster = MockCluster::new();
        let rack_key: RackKey = 0x0000_1003;
        let mut hb = Heartbeat::new(Arc::new(cluster.clone()), rack_key, fast_breaker());
        hb.start();
        let channel = cluster.retrieve_channel(RACK_HEARTBEAT_CHANNEL).unwrap();
        for _ in 0..500 {
            if !cluster.written_to(channel.key).is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        hb.halt();
        let beats = cluster.written_to(channel.key);
        assert!(!beats.is_empty());
        let first = beats[0].at_u64(0).unwrap();
        assert_eq!((first >> 32) as u32, rack_key);
        assert_eq!(first as u32, 0);
    }

    #[test]
    fn factory_materializes_internal_task_once() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let rack = cluster.create_rack("r").unwrap();
        let factory = HeartbeatFactory::new(fast_breaker());

        let mut initial = factory.configure_initial_tasks(&ctx, &rack);
        assert_eq!(initial.len(), 1);
        assert!(initial[0].0.internal);
        for (_, task) in &mut initial {
            task.stop(false);
        }

        // A second call reuses the existing descriptor.
        let tasks = cluster.retrieve_rack_tasks(rack.key).unwrap();
        assert_eq!(tasks.len(), 1);
        let mut again = factory.configure_initial_tasks(&ctx, &rack);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].0.key, tasks[0].key);
        for (_, task) in &mut again {
            task.stop(false);
        }
        assert_eq!(cluster.retrieve_rack_tasks(rack.key).unwrap().len(), 1);
    }
}
