//! The EtherCAT read task: cyclic process-image exchange into cluster
//! frames.

use std::collections::BTreeSet;

use serde::Deserialize;

use weir_cluster::{Channel, Client, WriterConfig};
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::timer::Timer;
use weir_task::clock::{
    generate_index_data, HardwareTimedSampleClock, HardwareTimedSampleClockConfig, SampleClock,
};
use weir_task::common::{self, BaseReadTaskConfig};
use weir_task::pipeline::{ReadResult, Source};

use crate::coe::decode_value;
use crate::image::{read_pdo, PdoOffset};
use crate::master::{Master, PdoMapping};
use crate::Registry;

/// One channel of an EtherCAT read task: a cluster channel fed by one PDO
/// of one slave.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadChannelConfig {
    pub channel: ChannelKey,
    /// Bus position of the slave.
    pub slave: u16,
    /// Object dictionary index of the PDO entry.
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
pub struct ReadTaskConfig {
    #[serde(flatten)]
    pub base: BaseReadTaskConfig,
    /// Network interface the master runs on.
    pub interface: String,
    pub channels: Vec<ReadChannelConfig>,
}

impl ReadTaskConfig {
    pub fn parse(config: &serde_json::Value) -> errors::Result<Self> {
        let cfg: Self = common::parse_config(config)?;
        cfg.base.validate(false)?;
        if !cfg.channels.iter().any(|c| c.enabled) {
            return Err(Error::new(
                errors::CONFIGURATION,
                "task must have at least one enabled channel",
            ));
        }
        Ok(cfg)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ReadChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

/// Consecutive degraded cycles after which the bus is treated as
/// disconnected rather than merely noisy.
const MAX_DEGRADED_CYCLES: u32 = 10;

/// A [`Source`] performing one cyclic exchange per sample.
pub struct EthercatSource {
    master: Box<dyn Master>,
    cfg: ReadTaskConfig,
    channels: Vec<Channel>,
    index_keys: BTreeSet<ChannelKey>,
    mappings: Vec<PdoMapping>,
    offsets: Vec<PdoOffset>,
    image: Vec<u8>,
    clock: HardwareTimedSampleClock,
    timer: Timer,
    degraded: u32,
}

impl std::fmt::Debug for EthercatSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthercatSource").finish_non_exhaustive()
    }
}

impl EthercatSource {
    /// Resolves channels against the cluster and PDOs against the ESI
    /// registry (by each slave's identity, with bit lengths and data types
    /// coming from the registry entry).
    pub fn open(
        client: &dyn Client,
        registry: &Registry,
        mut master: Box<dyn Master>,
        cfg: ReadTaskConfig,
    ) -> errors::Result<Self> {
        let keys: Vec<ChannelKey> = cfg.enabled().map(|c| c.channel).collect();
        let (channels, index_keys) = common::resolve_channels(client, &keys)?;

        let slaves = master.scan()?;
        let mut mappings = Vec::with_capacity(keys.len());
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
                .inputs
                .iter()
                .find(|p| p.index == entry_cfg.index && p.sub_index == entry_cfg.sub_index)
                .ok_or_else(|| {
                    Error::new(
                        errors::CONFIGURATION,
                        format!(
                            "slave {} has no input PDO {:#06x}:{:02x}",
                            entry_cfg.slave, entry_cfg.index, entry_cfg.sub_index
                        ),
                    )
                })?;
            mappings.push(PdoMapping { slave: entry_cfg.slave, entry: entry.clone() });
        }

        let sample_rate = cfg.base.sample_rate();
        let clock = HardwareTimedSampleClock::new(HardwareTimedSampleClockConfig::with_timing(
            sample_rate,
            sample_rate,
            cfg.base.timing(),
        ));
        let timer = Timer::from_rate(sample_rate);
        Ok(Self {
            master,
            cfg,
            channels,
            index_keys,
            mappings,
            offsets: Vec::new(),
            image: Vec::new(),
            clock,
            timer,
            degraded: 0,
        })
    }
}

impl Source for EthercatSource {
    fn start(&mut self) -> errors::Result<()> {
        self.offsets = self.master.activate(&self.mappings)?;
        self.image = vec![0u8; self.master.image_size()];
        self.clock.reset();
        self.degraded = 0;
        Ok(())
    }

    fn stop(&mut self) -> errors::Result<()> {
        self.master.deactivate()
    }

    fn read(&mut self, breaker: &Breaker, frame: &mut Frame) -> ReadResult {
        // The bus cycle is steady, so timestamps interpolate off the sample
        // clock while the timer paces the exchange.
        let start = self.clock.wait(breaker);
        self.timer.wait(breaker);

        let wkc = match self.master.exchange(&mut self.image) {
            Ok(wkc) => wkc,
            Err(err) => return ReadResult::error(err),
        };
        let mut result = ReadResult::ok();
        if wkc < self.master.expected_wkc() {
            self.degraded += 1;
            if self.degraded >= MAX_DEGRADED_CYCLES {
                return ReadResult::error(Error::new(
                    errors::DEVICE_DISCONNECTED,
                    format!("working counter {wkc} below expected for {} cycles", self.degraded),
                ));
            }
            result.warning = format!(
                "degraded bus cycle: working counter {wkc}, expected {}",
                self.master.expected_wkc()
            );
        } else {
            self.degraded = 0;
        }

        common::initialize_frame(frame, &self.channels, &self.index_keys, 1);
        frame.clear_data();
        for (i, (mapping, offset)) in self.mappings.iter().zip(&self.offsets).enumerate() {
            let bits = read_pdo(&self.image, *offset, mapping.entry.bit_length);
            let value = decode_value(bits, mapping.entry.data_type, mapping.entry.bit_length);
            if let Some(series) = frame.series_at_mut(i) {
                if let Err(err) = series.push_f64(value) {
                    return ReadResult::error(err);
                }
            }
        }
        let end = self.clock.end();
        generate_index_data(frame, &self.index_keys, start, end, 1, false);
        result
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    fn writer_config(&self) -> WriterConfig {
        let mut keys: Vec<ChannelKey> = self.channels.iter().map(|c| c.key).collect();
        keys.extend(self.index_keys.iter().copied());
        let mut cfg = WriterConfig::new(keys);
        cfg.mode = weir_cluster::client::data_saving_writer_mode(self.cfg.base.data_saving);
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{SimulatedMaster, SlaveInfo};
    use crate::RegistryBuilder;
    use serde_json::json;
    use weir_cluster::mock::MockCluster;
    use weir_core::breaker;
    use weir_core::series::DataType;

    fn registry() -> Registry {
        let blob = RegistryBuilder::new()
            .vendor(0x2, "Beckhoff Automation")
            .device(
                0x2,
                0x0C1E3052,
                0x00120000,
                "EL3102",
                vec![
                    crate::esi::PdoEntry {
                        pdo_index: 0x1A00,
                        index: 0x6000,
                        sub_index: 17,
                        bit_length: 16,
                        is_input: true,
                        name: "AI Value 1".to_string(),
                        data_type: DataType::Int16,
                    },
                    crate::esi::PdoEntry {
                        pdo_index: 0x1A01,
                        index: 0x6010,
                        sub_index: 17,
                        bit_length: 16,
                        is_input: true,
                        name: "AI Value 2".to_string(),
                        data_type: DataType::Int16,
                    },
                ],
                vec![],
            )
            .encode();
        Registry::from_blob(blob).unwrap()
    }

    fn slave() -> SlaveInfo {
        SlaveInfo {
            position: 0,
            vendor_id: 0x2,
            product_code: 0x0C1E3052,
            revision: 0x00120000,
            name: "EL3102".to_string(),
        }
    }

    fn test_breaker() -> Breaker {
        let b = Breaker::new(breaker::Config::named("ec-test"));
        b.start();
        b
    }

    fn channels(cluster: &MockCluster) -> (Channel, Channel, Channel) {
        let idx = cluster
            .create_channel(Channel {
                name: "time".to_string(),
                data_type: DataType::Timestamp,
                is_index: true,
                ..Channel::default()
            })
            .unwrap();
        let a = cluster
            .create_channel(Channel {
                name: "ai_0".to_string(),
                data_type: DataType::Float64,
                index: idx.key,
                ..Channel::default()
            })
            .unwrap();
        let b = cluster
            .create_channel(Channel {
                name: "ai_1".to_string(),
                data_type: DataType::Float64,
                index: idx.key,
                ..Channel::default()
            })
            .unwrap();
        (idx, a, b)
    }

    fn config(a: ChannelKey, b: ChannelKey) -> ReadTaskConfig {
        ReadTaskConfig::parse(&json!({
            "sample_rate": 500.0,
            "interface": "eth0",
            "channels": [
                { "channel": a, "slave": 0, "index": 0x6000, "sub_index": 17 },
                { "channel": b, "slave": 0, "index": 0x6010, "sub_index": 17 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn exchange_lands_in_frame_with_index() {
        let cluster = MockCluster::new();
        let (idx, a, b) = channels(&cluster);
        let (master, bus) = SimulatedMaster::new(vec![slave()]);
        let mut source =
            EthercatSource::open(&cluster, &registry(), Box::new(master), config(a.key, b.key))
                .unwrap();
        source.start().unwrap();

        bus.set_input(0, 0x6000, 17, -100.0);
        bus.set_input(0, 0x6010, 17, 250.0);
        let breaker = test_breaker();
        let mut frame = Frame::new();
        let res = source.read(&breaker, &mut frame);
        assert!(res.error.ok(), "{}", res.error);
        assert_eq!(frame.get(a.key).unwrap().at_f64(0), Some(-100.0));
        assert_eq!(frame.get(b.key).unwrap().at_f64(0), Some(250.0));
        assert_eq!(frame.get(idx.key).unwrap().len(), 1);
        source.stop().unwrap();
    }

    #[test]
    fn degraded_cycles_warn_then_disconnect() {
        let cluster = MockCluster::new();
        let (_, a, b) = channels(&cluster);
        let (master, bus) = SimulatedMaster::new(vec![slave()]);
        let mut source =
            EthercatSource::open(&cluster, &registry(), Box::new(master), config(a.key, b.key))
                .unwrap();
        source.start().unwrap();
        let breaker = test_breaker();
        let mut frame = Frame::new();

        bus.degrade_for(MAX_DEGRADED_CYCLES + 2);
        for _ in 0..MAX_DEGRADED_CYCLES - 1 {
            let res = source.read(&breaker, &mut frame);
            assert!(res.error.ok());
            assert!(res.warning.contains("working counter"));
        }
        let res = source.read(&breaker, &mut frame);
        assert!(res.error.matches(errors::TEMPORARY_HARDWARE_ERROR));
    }

    #[test]
    fn unknown_slave_position_is_a_config_error() {
        let cluster = MockCluster::new();
        let (_, a, b) = channels(&cluster);
        let (master, _) = SimulatedMaster::new(vec![slave()]);
        let bad = ReadTaskConfig::parse(&json!({
            "sample_rate": 500.0,
            "interface": "eth0",
            "channels": [
                { "channel": a.key, "slave": 9, "index": 0x6000, "sub_index": 17 },
                { "channel": b.key, "slave": 0, "index": 0x6010, "sub_index": 17 }
            ]
        }))
        .unwrap();
        let err = EthercatSource::open(&cluster, &registry(), Box::new(master), bad).unwrap_err();
        assert!(err.matches(errors::CONFIGURATION));
    }

    #[test]
    fn config_requires_enabled_channels() {
        let err = ReadTaskConfig::parse(&json!({
            "sample_rate": 100.0,
            "interface": "eth0",
            "channels": [
                { "channel": 1, "slave": 0, "index": 0x6000, "enabled": false }
            ]
        }))
        .unwrap_err();
        assert!(err.matches(errors::CONFIGURATION));
    }
}
