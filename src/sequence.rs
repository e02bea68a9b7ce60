//! Sequence tasks: user-authored control graphs executed on an RT thread.
//!
//! The task bridges a reactive graph to the cluster: an I/O thread feeds
//! streamed channel samples into the scheduler's bounded input queue, and
//! the execution thread runs one cycle per timer tick, draining emitted
//! setpoints back out through a cluster writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{error, warn};

use weir_arc::nodes::std_factories;
use weir_arc::{build_scheduler, Graph, Sample, Scheduler};
use weir_cluster::{Rack, Streamer, StreamerConfig, Task as ClusterTask, WriterConfig};
use weir_core::breaker::{self, Breaker};
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::series::Series;
use weir_core::telem::Rate;
use weir_core::timer::Timer;
use weir_task::common;
use weir_task::status::StatusHandler;
use weir_task::task::{
    Command, ConfigureResult, Context, Task, START_CMD_TYPE, STOP_CMD_TYPE,
};

pub const INTEGRATION_NAME: &str = "sequence";
pub const TASK_TYPE: &str = "sequence";

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    /// Scheduler cycle rate in Hz.
    pub rate: f64,
    /// RT policy applied to the execution thread.
    #[serde(default)]
    pub rt: weir_rt::Config,
    /// The control graph.
    pub graph: serde_json::Value,
}

impl SequenceConfig {
    pub fn parse(config: &serde_json::Value) -> errors::Result<Self> {
        let cfg: Self = common::parse_config(config)?;
        if cfg.rate <= 0.0 {
            return Err(Error::new(errors::CONFIGURATION, "rate must be greater than 0"));
        }
        Ok(cfg)
    }
}

/// Channels a graph touches: streamed in by `channel` sources, written out
/// by `channel_write` sinks.
fn graph_channels(graph: &Graph) -> (Vec<ChannelKey>, Vec<ChannelKey>) {
    let mut read = Vec::new();
    let mut write = Vec::new();
    for node in &graph.nodes {
        let key = node.config["channel"].as_u64().map(|k| k as ChannelKey);
        match (node.node_type.as_str(), key) {
            ("channel", Some(k)) => read.push(k),
            ("channel_write", Some(k)) => write.push(k),
            _ => {}
        }
    }
    (read, write)
}

impl std::fmt::Debug for SequenceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub struct SequenceTask {
    name: String,
    ctx: Arc<Context>,
    cfg: SequenceConfig,
    graph: Graph,
    status: Arc<Mutex<StatusHandler>>,
    breaker: Breaker,
    running: Arc<AtomicBool>,
    streamer: Arc<Mutex<Option<Arc<dyn Streamer>>>>,
    threads: Vec<JoinHandle<()>>,
}

impl SequenceTask {
    pub fn configure(
        ctx: &Arc<Context>,
        task: &ClusterTask,
        breaker_config: breaker::Config,
    ) -> errors::Result<Self> {
        let cfg = SequenceConfig::parse(&task.config)?;
        let graph = Graph::parse(&cfg.graph)?;
        // Build once during configuration so graph errors surface as
        // configuration errors instead of at start.
        build_scheduler(&graph, &std_factories())
            .map_err(|err| err.with_data(format!("graph: {}", err.data)))?;
        Ok(Self {
            name: task.name.clone(),
            ctx: ctx.clone(),
            cfg,
            graph,
            status: Arc::new(Mutex::new(StatusHandler::new(ctx.clone(), task))),
            breaker: Breaker::new(breaker_config),
            running: Arc::new(AtomicBool::new(false)),
            streamer: Arc::new(Mutex::new(None)),
            threads: Vec::new(),
        })
    }

    fn start(&mut self, cmd_key: &str) {
        self.stop_inner("", false);
        self.status.lock().reset();
        let mut scheduler = match build_scheduler(&self.graph, &std_factories()) {
            Ok(s) => s,
            Err(err) => {
                let mut status = self.status.lock();
                status.error(err);
                status.send_start(cmd_key);
                return;
            }
        };
        let (read_channels, write_channels) = graph_channels(&self.graph);
        for key in &read_channels {
            scheduler.state_mut().register_channel(*key);
        }
        self.running.store(true, Ordering::Release);
        self.breaker.reset();
        self.breaker.start();

        if !read_channels.is_empty() {
            let input = scheduler.state().input_handle();
            let client = self.ctx.client.clone();
            let running = self.running.clone();
            let breaker = self.breaker.clone();
            let slot = self.streamer.clone();
            self.threads.push(std::thread::spawn(move || {
                run_io(client, read_channels, input, &breaker, &running, &slot);
            }));
        }

        {
            let client = self.ctx.client.clone();
            let running = self.running.clone();
            let breaker = self.breaker.clone();
            let status = self.status.clone();
            let rate = Rate::hz(self.cfg.rate);
            let rt = self.cfg.rt.clone();
            self.threads.push(std::thread::spawn(move || {
                run_cycles(
                    client,
                    scheduler,
                    write_channels,
                    rate,
                    rt,
                    &breaker,
                    &running,
                    &status,
                );
            }));
        }
        self.status.lock().send_start(cmd_key);
    }

    fn stop_inner(&mut self, cmd_key: &str, propagate_state: bool) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.breaker.stop();
        if let Some(streamer) = self.streamer.lock().take() {
            streamer.close_send();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if was_running && propagate_state {
            self.status.lock().send_stop(cmd_key);
        }
    }
}

fn run_io(
    client: Arc<dyn weir_cluster::Client>,
    channels: Vec<ChannelKey>,
    input: Arc<crossbeam_queue::ArrayQueue<Sample>>,
    breaker: &Breaker,
    running: &AtomicBool,
    slot: &Mutex<Option<Arc<dyn Streamer>>>,
) {
    while running.load(Ordering::Acquire) {
        let streamer = match client.open_streamer(StreamerConfig { channels: channels.clone() }) {
            Ok(s) => {
                *slot.lock() = Some(s.clone());
                s
            }
            Err(err) if err.matches(errors::UNREACHABLE) => {
                if breaker.wait(&err.message()) {
                    continue;
                }
                return;
            }
            Err(err) => {
                error!(error = %err, "sequence streamer open failed");
                return;
            }
        };
        breaker.reset();
        loop {
            if !running.load(Ordering::Acquire) {
                return;
            }
            match streamer.read() {
                Ok(frame) => {
                    for (channel, series) in frame.iter() {
                        for i in 0..series.len() {
                            let Some(value) = series.at_f64(i) else { continue };
                            // A full queue drops the oldest data silently;
                            // the graph always sees the latest drained batch.
                            let _ = input.push(Sample { channel, value });
                        }
                    }
                }
                Err(err) if err.matches(errors::EOF) => return,
                Err(err) if err.matches(errors::UNREACHABLE) => {
                    if breaker.wait(&err.message()) {
                        break;
                    }
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "sequence streamer failed");
                    return;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_cycles(
    client: Arc<dyn weir_cluster::Client>,
    mut scheduler: Scheduler,
    write_channels: Vec<ChannelKey>,
    rate: Rate,
    rt: weir_rt::Config,
    breaker: &Breaker,
    running: &AtomicBool,
    status: &Mutex<StatusHandler>,
) {
    if let Err(err) = weir_rt::apply_config(&rt) {
        warn!(error = %err, "sequence rt configuration rejected");
    }
    let mut writer = if write_channels.is_empty() {
        None
    } else {
        match client.open_writer(WriterConfig::new(write_channels)) {
            Ok(w) => Some(w),
            Err(err) => {
                let mut status = status.lock();
                status.error(err);
                status.send_stop("");
                running.store(false, Ordering::Release);
                return;
            }
        }
    };
    let output = scheduler.state().output_handle();
    let mut timer = Timer::from_rate(rate);
    let mut latest: HashMap<ChannelKey, f64> = HashMap::new();
    while running.load(Ordering::Acquire) {
        timer.wait(breaker);
        if !running.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = scheduler.next() {
            error!(error = %err, "sequence cycle failed");
            let mut status = status.lock();
            status.error(err);
            status.send_stop("");
            running.store(false, Ordering::Release);
            break;
        }
        for reported in scheduler.drain_reported_errors() {
            warn!(error = %reported, "sequence node reported an error");
            status.lock().send_warning(&reported.data);
        }
        latest.clear();
        while let Some(sample) = output.pop() {
            latest.insert(sample.channel, sample.value);
        }
        if latest.is_empty() {
            continue;
        }
        if let Some(writer) = writer.as_mut() {
            let mut frame = Frame::with_capacity(latest.len());
            for (channel, value) in &latest {
                frame.push(*channel, Series::from_f64s(vec![*value]));
            }
            if let Err(err) = writer.write(&frame) {
                warn!(error = %err, "sequence setpoint write failed");
            }
        }
    }
    if let Some(mut writer) = writer {
        let _ = writer.close();
    }
}

impl Task for SequenceTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&mut self, cmd: &Command) {
        match cmd.cmd_type.as_str() {
            START_CMD_TYPE => self.start(&cmd.key),
            STOP_CMD_TYPE => self.stop_inner(&cmd.key, true),
            _ => {}
        }
    }

    fn stop(&mut self, will_reconfigure: bool) {
        self.stop_inner("", !will_reconfigure);
    }
}

impl Drop for SequenceTask {
    fn drop(&mut self) {
        self.stop_inner("", false);
    }
}

/// Builds sequence tasks.
pub struct SequenceFactory {
    breaker_config: breaker::Config,
}

impl SequenceFactory {
    pub fn new(breaker_config: breaker::Config) -> Self {
        Self { breaker_config }
    }
}

impl weir_task::factory::Factory for SequenceFactory {
    fn name(&self) -> &'static str {
        INTEGRATION_NAME
    }

    fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Result<ConfigureResult, Error>> {
        if task.task_type != TASK_TYPE {
            return None;
        }
        Some(
            SequenceTask::configure(ctx, task, self.breaker_config.clone())
                .map(|t| ConfigureResult::new(Box::new(t))),
        )
    }

    fn configure_initial_tasks(
        &self,
        _ctx: &Arc<Context>,
        _rack: &Rack,
    ) -> Vec<(ClusterTask, Box<dyn Task>)> {
        Vec::new()
    }
}
