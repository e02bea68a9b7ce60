//! The EtherCAT write task: setpoint frames into output PDOs.

use serde::Deserialize;

use weir_cluster::{Client, StreamerConfig, WriterConfig};
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_task::common;
use weir_task::pipeline::Sink;

use crate::coe::{decode_value, encode_value};
use crate::image::{read_pdo, write_pdo, PdoOffset};
use crate::master::{Master, PdoMapping};
use crate::Registry;

/// One command/state channel pair bound to an output PDO.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteChannelConfig {
    /// Channel carrying setpoint commands from the cluster.
    pub cmd_channel: ChannelKey,
    /// Channel the applied state is echoed on.
    pub state_channel: ChannelKey,
    pub slave: u16,
    pub index: u16,
    #[serde(default)]
    pub sub_index: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteTaskConfig {
    #[serde(default = "default_state_rate_hz")]
    pub state_rate: f64,
    pub interface: String,
    pub channels: Vec<WriteChannelConfig>,
}

fn default_state_rate_hz() -> f64 {
    1.0
}

impl WriteTaskConfig {
    pub fn parse(config: &serde_json::Value) -> errors::Result<Self> {
        let cfg: Self = common::parse_config(config)?;
        if !cfg.channels.iter().any(|c| c.enabled) {
            return Err(Error::new(
                errors::CONFIGURATION,
                "task must have at least one enabled channel",
            ));
        }
        if cfg.state_rate <= 0.0 {
            return Err(Error::new(errors::CONFIGURATION, "state_rate must be greater than 0"));
        }
        Ok(cfg)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &WriteChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

/// A [`Sink`] applying setpoints through cyclic exchange. The control
/// pipeline's state thread doubles as the cyclic driver: every echo read
/// performs one exchange, so outputs keep refreshing between commands.
pub struct EthercatSink {
    master: Box<dyn Master>,
    cfg: WriteTaskConfig,
    mappings: Vec<PdoMapping>,
    offsets: Vec<PdoOffset>,
    image: Vec<u8>,
}

impl EthercatSink {
    pub fn open(
        _client: &dyn Client,
        registry: &Registry,
        mut master: Box<dyn Master>,
        cfg: WriteTaskConfig,
    ) -> errors::Result<Self> {
        let slaves = master.scan()?;
        let mut mappings = Vec::new();
        for entry_cfg in cfg.enabled() {
            let slave = slaves
                .iter()
                .find(|s| s.position == entry_cfg.slave)
                .ok_or_else(|| {
                    Error::new(
                        errors::CONFIGURATION,
                        format!("no slave at bus position {}", entry_cfg.slave),
                    )
                })?;
            let device = registry
                .lookup_device_pdos(slave.vendor_id, slave.product_code, slave.revision)
                .ok_or_else(|| {
                    Error::new(
                        errors::CONFIGURATION,
                        format!(
                            "device {:#06x}:{:#010x} is not in the ESI registry",
                            slave.vendor_id, slave.product_code
                        ),
                    )
                })?;
            let entry = device
                .outputs
                .iter()
                .find(|p| p.index == entry_cfg.index && p.sub_index == entry_cfg.sub_index)
                .ok_or_else(|| {
                    Error::new(
                        errors::CONFIGURATION,
                        format!(
                            "slave {} has no output PDO {:#06x}:{:02x}",
                            entry_cfg.slave, entry_cfg.index, entry_cfg.sub_index
                        ),
                    )
                })?;
            mappings.push(PdoMapping { slave: entry_cfg.slave, entry: entry.clone() });
        }
        Ok(Self { master, cfg, mappings, offsets: Vec::new(), image: Vec::new() })
    }

    fn exchange(&mut self) -> errors::Result<()> {
        let wkc = self.master.exchange(&mut self.image)?;
        if wkc < self.master.expected_wkc() {
            return Err(Error::new(
                errors::DEVICE_DISCONNECTED,
                format!("working counter {wkc} below expected {}", self.master.expected_wkc()),
            ));
        }
        Ok(())
    }
}

impl Sink for EthercatSink {
    fn start(&mut self) -> errors::Result<()> {
        self.offsets = self.master.activate(&self.mappings)?;
        self.image = vec![0u8; self.master.image_size()];
        Ok(())
    }

    fn stop(&mut self) -> errors::Result<()> {
        self.master.deactivate()
    }

    fn write(&mut self, frame: &Frame) -> errors::Result<()> {
        let configs: Vec<WriteChannelConfig> = self.cfg.enabled().cloned().collect();
        for (i, entry_cfg) in configs.iter().enumerate() {
            let Some(series) = frame.get(entry_cfg.cmd_channel) else { continue };
            let Some(value) = series.at_f64(series.len().saturating_sub(1)) else { continue };
            let mapping = &self.mappings[i];
            let bits = encode_value(value, mapping.entry.data_type, mapping.entry.bit_length);
            write_pdo(&mut self.image, self.offsets[i], mapping.entry.bit_length, bits);
        }
        self.exchange()
    }

    fn set_authority(&mut self, _keys: &[ChannelKey], _authorities: &[u8]) -> errors::Result<()> {
        // Authority is enforced cluster-side on the command channels; the
        // bus itself has a single writer.
        Ok(())
    }

    fn read(&mut self, _breaker: &Breaker, frame: &mut Frame) -> errors::Result<()> {
        self.exchange()?;
        let configs: Vec<(ChannelKey, usize)> = self
            .cfg
            .enabled()
            .enumerate()
            .map(|(i, c)| (c.state_channel, i))
            .collect();
        if frame.is_empty() {
            for (state_channel, _) in &configs {
                frame.push(
                    *state_channel,
                    weir_core::series::Series::with_capacity(
                        weir_core::series::DataType::Float64,
                        1,
                    ),
                );
            }
        }
        frame.clear_data();
        for (state_channel, i) in configs {
            let mapping = &self.mappings[i];
            let bits = read_pdo(&self.image, self.offsets[i], mapping.entry.bit_length);
            let value = decode_value(bits, mapping.entry.data_type, mapping.entry.bit_length);
            if let Some(series) = frame.get_mut(state_channel) {
                series.push_f64(value)?;
            }
        }
        Ok(())
    }

    fn cmd_streamer_config(&self) -> StreamerConfig {
        StreamerConfig { channels: self.cfg.enabled().map(|c| c.cmd_channel).collect() }
    }

    fn state_writer_config(&self) -> WriterConfig {
        WriterConfig::new(self.cfg.enabled().map(|c| c.state_channel).collect())
    }
}
