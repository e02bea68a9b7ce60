//! OPC UA read task shapes: array reads and unary (sample-at-a-time)
//! reads.

use std::collections::BTreeSet;

use serde::Deserialize;

use weir_cluster::{Channel, Client, WriterConfig};
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::telem::{Rate, TimeStamp};
use weir_core::timer::Timer;
use weir_task::clock::generate_index_data;
use weir_task::common::{self, BaseReadTaskConfig};
use weir_task::pipeline::{ReadResult, Source};

use crate::client::{ConnectionConfig, NodeId, UaClient, UaConnector};
use crate::variant::write_array_to_series;

#[derive(Debug, Clone, Deserialize)]
pub struct InputChannelConfig {
    pub channel: ChannelKey,
    pub node_id: NodeId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadTaskConfig {
    #[serde(flatten)]
    pub base: BaseReadTaskConfig,
    /// Key of the device describing the server connection.
    pub device: String,
    /// Elements read per channel per request; 1 selects the unary shape.
    #[serde(default = "default_array_size")]
    pub array_size: usize,
    pub channels: Vec<InputChannelConfig>,
}

fn default_array_size() -> usize {
    1
}

impl ReadTaskConfig {
    pub fn parse(config: &serde_json::Value) -> errors::Result<Self> {
        let cfg: Self = common::parse_config(config)?;
        // Array reads pace themselves off the sample rate alone.
        cfg.base.validate(cfg.array_size <= 1)?;
        if cfg.array_size == 0 {
            return Err(Error::new(errors::CONFIGURATION, "array_size must be at least 1"));
        }
        if !cfg.channels.iter().any(|c| c.enabled) {
            return Err(Error::new(
                errors::CONFIGURATION,
                "task must have at least one enabled channel",
            ));
        }
        Ok(cfg)
    }

    /// The server connection, taken from the device's properties.
    pub fn connection(&self, client: &dyn Client) -> errors::Result<ConnectionConfig> {
        let device = client.retrieve_device(&self.device)?;
        serde_json::from_value(device.properties["connection"].clone()).map_err(|e| {
            Error::new(errors::CONFIGURATION, format!("device connection properties: {e}"))
        })
    }

    fn enabled(&self) -> impl Iterator<Item = &InputChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

struct Resolved {
    channels: Vec<Channel>,
    index_keys: BTreeSet<ChannelKey>,
    nodes: Vec<NodeId>,
    data_saving: bool,
}

impl Resolved {
    fn new(client: &dyn Client, cfg: &ReadTaskConfig) -> errors::Result<Self> {
        let keys: Vec<ChannelKey> = cfg.enabled().map(|c| c.channel).collect();
        let (channels, index_keys) = common::resolve_channels(client, &keys)?;
        let nodes = cfg.enabled().map(|c| c.node_id.clone()).collect();
        Ok(Self { channels, index_keys, nodes, data_saving: cfg.base.data_saving })
    }

    fn writer_config(&self) -> WriterConfig {
        let mut keys: Vec<ChannelKey> = self.channels.iter().map(|c| c.key).collect();
        keys.extend(self.index_keys.iter().copied());
        let mut wc = WriterConfig::new(keys);
        wc.mode = weir_cluster::client::data_saving_writer_mode(self.data_saving);
        wc
    }
}

/// Reads one array per channel per request. Timestamps are interpolated as
/// a linspace from the request time over `array_size` sample periods.
pub struct ArrayReadSource {
    session: Box<dyn UaClient>,
    resolved: Resolved,
    array_size: usize,
    sample_period: weir_core::telem::TimeSpan,
    timer: Timer,
}

impl ArrayReadSource {
    pub fn open(
        client: &dyn Client,
        connector: &dyn UaConnector,
        cfg: ReadTaskConfig,
    ) -> errors::Result<Self> {
        let connection = cfg.connection(client)?;
        let session = connector.connect(&connection)?;
        let resolved = Resolved::new(client, &cfg)?;
        let sample_rate = cfg.base.sample_rate();
        // One request per array: the request rate is the sample rate scaled
        // down by the array length.
        let request_rate = Rate::hz(sample_rate.0 / cfg.array_size as f64);
        Ok(Self {
            session,
            resolved,
            array_size: cfg.array_size,
            sample_period: sample_rate.period(),
            timer: Timer::from_rate(request_rate),
        })
    }
}

impl Source for ArrayReadSource {
    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> ReadResult {
        self.timer.wait(breaker);
        let variants = match self.session.read(&self.resolved.nodes) {
            Ok(v) => v,
            Err(err) => {
                // Transport failures retry through the breaker.
                return ReadResult::error(err.reparent(errors::TEMPORARY_HARDWARE_ERROR));
            }
        };
        common::initialize_frame(
            frame,
            &self.resolved.channels,
            &self.resolved.index_keys,
            self.array_size,
        );
        frame.clear_data();
        let mut warnings: Vec<String> = Vec::new();
        for (i, (variant, channel)) in
            variants.iter().zip(&self.resolved.channels).enumerate()
        {
            let series = match frame.series_at_mut(i) {
                Some(s) => s,
                None => break,
            };
            match write_array_to_series(series, variant, self.array_size, &channel.name) {
                Ok(written) if written > 0 => {}
                Ok(_) => warnings.push(format!("no OPC UA data for channel {}", channel.name)),
                Err(err) => warnings.push(err.data),
            }
        }
        if !warnings.is_empty() {
            // One bad response discards the whole frame.
            frame.clear_data();
            return ReadResult::warning(warnings.join("; "));
        }
        let start = TimeStamp::now();
        let end = start + self.sample_period * self.array_size as i64;
        generate_index_data(frame, &self.resolved.index_keys, start, end, self.array_size, true);
        ReadResult::ok()
    }

    fn channels(&self) -> Vec<Channel> {
        self.resolved.channels.clone()
    }

    fn writer_config(&self) -> WriterConfig {
        self.resolved.writer_config()
    }
}

/// Reads one sample per channel per tick, accumulating `samples_per_chan`
/// before the frame is released.
pub struct UnaryReadSource {
    session: Box<dyn UaClient>,
    resolved: Resolved,
    samples_per_chan: usize,
    timer: Timer,
}

impl UnaryReadSource {
    pub fn open(
        client: &dyn Client,
        connector: &dyn UaConnector,
        cfg: ReadTaskConfig,
    ) -> errors::Result<Self> {
        let connection = cfg.connection(client)?;
        let session = connector.connect(&connection)?;
        let resolved = Resolved::new(client, &cfg)?;
        Ok(Self {
            session,
            resolved,
            samples_per_chan: cfg.base.samples_per_chan(),
            timer: Timer::from_rate(cfg.base.sample_rate()),
        })
    }
}

impl Source for UnaryReadSource {
    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> ReadResult {
        common::initialize_frame(
            frame,
            &self.resolved.channels,
            &self.resolved.index_keys,
            self.samples_per_chan,
        );
        frame.clear_data();
        for _ in 0..self.samples_per_chan {
            let start = TimeStamp::now();
            let variants = match self.session.read(&self.resolved.nodes) {
                Ok(v) => v,
                Err(err) => {
                    return ReadResult::error(err.reparent(errors::TEMPORARY_HARDWARE_ERROR))
                }
            };
            for (i, (variant, channel)) in
                variants.iter().zip(&self.resolved.channels).enumerate()
            {
                let series = match frame.series_at_mut(i) {
                    Some(s) => s,
                    None => break,
                };
                if let Err(err) = write_array_to_series(series, variant, 1, &channel.name) {
                    frame.clear_data();
                    return ReadResult::warning(format!("{}, skipping frame", err.data));
                }
            }
            // Stamp index channels at the midpoint of the request.
            let ts = TimeStamp::midpoint(start, TimeStamp::now());
            let data_len = self.resolved.channels.len();
            for slot in data_len..frame.len() {
                if let Some(series) = frame.series_at_mut(slot) {
                    let _ = series.push_timestamp(ts);
                }
            }
            self.timer.wait(breaker);
            if !breaker.running() {
                break;
            }
        }
        ReadResult::ok()
    }

    fn channels(&self) -> Vec<Channel> {
        self.resolved.channels.clone()
    }

    fn writer_config(&self) -> WriterConfig {
        self.resolved.writer_config()
    }
}
