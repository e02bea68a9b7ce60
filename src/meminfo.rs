//! Host memory telemetry: a small built-in integration that reports
//! available memory so rack health is visible next to device data.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;

use weir_cluster::{Channel, Rack, Task as ClusterTask, WriterConfig};
use weir_core::breaker::{self, Breaker};
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::telem::{Rate, TimeStamp};
use weir_core::timer::Timer;
use weir_task::common;
use weir_task::pipeline::{ReadResult, Source};
use weir_task::read_task::ReadTask;
use weir_task::task::{ConfigureResult, Context, Task};

pub const INTEGRATION_NAME: &str = "meminfo";
pub const TASK_TYPE: &str = "meminfo";

/// Available bytes of memory on this host.
#[cfg(target_os = "linux")]
fn available_memory() -> u64 {
    let Ok(raw) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kib: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kib * 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn available_memory() -> u64 {
    0
}

#[derive(Debug, Deserialize)]
struct MeminfoConfig {
    channel: ChannelKey,
    #[serde(default = "default_rate")]
    rate: f64,
}

fn default_rate() -> f64 {
    1.0
}

struct MeminfoSource {
    channels: Vec<Channel>,
    index_keys: BTreeSet<ChannelKey>,
    timer: Timer,
}

impl Source for MeminfoSource {
    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> ReadResult {
        self.timer.wait(breaker);
        common::initialize_frame(frame, &self.channels, &self.index_keys, 1);
        frame.clear_data();
        if let Some(series) = frame.series_at_mut(0) {
            if let Err(err) = series.push_u64(available_memory()) {
                return ReadResult::error(err);
            }
        }
        let now = TimeStamp::now();
        for slot in self.channels.len()..frame.len() {
            if let Some(series) = frame.series_at_mut(slot) {
                let _ = series.push_timestamp(now);
            }
        }
        ReadResult::ok()
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    fn writer_config(&self) -> WriterConfig {
        let mut keys: Vec<ChannelKey> = self.channels.iter().map(|c| c.key).collect();
        keys.extend(self.index_keys.iter().copied());
        WriterConfig::new(keys)
    }
}

/// Builds the host memory read task.
pub struct MeminfoFactory {
    breaker_config: breaker::Config,
}

impl MeminfoFactory {
    pub fn new(breaker_config: breaker::Config) -> Self {
        Self { breaker_config }
    }
}

impl weir_task::factory::Factory for MeminfoFactory {
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
        let build = || -> Result<ConfigureResult, Error> {
            let cfg: MeminfoConfig = common::parse_config(&task.config)?;
            if cfg.rate <= 0.0 {
                return Err(Error::new(errors::CONFIGURATION, "rate must be greater than 0"));
            }
            let (channels, index_keys) =
                common::resolve_channels(ctx.client.as_ref(), &[cfg.channel])?;
            let source = MeminfoSource {
                channels,
                index_keys,
                timer: Timer::from_rate(Rate::hz(cfg.rate)),
            };
            Ok(ConfigureResult::auto_start(Box::new(ReadTask::new(
                ctx,
                task,
                self.breaker_config.clone(),
                Box::new(source),
                None,
            ))))
        };
        Some(build())
    }

    fn configure_initial_tasks(
        &self,
        _ctx: &Arc<Context>,
        _rack: &Rack,
    ) -> Vec<(ClusterTask, Box<dyn Task>)> {
        // The cluster provisions the meminfo task with its channel; nothing
        // to materialize until it does.
        Vec::new()
    }
}
