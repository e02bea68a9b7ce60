//! The EtherCAT task factory and bus scanner.

use std::sync::Arc;

use serde::Deserialize;

use weir_cluster::{Device, Rack, Task as ClusterTask};
use weir_core::breaker;
use weir_core::errors::{self, Error};
use weir_core::telem::Rate;
use weir_task::read_task::ReadTask;
use weir_task::scan_task::{ScanTask, Scanner};
use weir_task::task::{ConfigureResult, Context, Task};
use weir_task::write_task::WriteTask;

use crate::master::MasterProvider;
use crate::read_task::{EthercatSource, ReadTaskConfig};
use crate::write_task::{EthercatSink, WriteTaskConfig};
use crate::{Registry, INTEGRATION_NAME};

pub const READ_TASK_TYPE: &str = "ethercat_read";
pub const WRITE_TASK_TYPE: &str = "ethercat_write";
pub const SCAN_TASK_TYPE: &str = "ethercat_scan";

/// Period between bus scans.
const SCAN_RATE_HZ: f64 = 0.2;

#[derive(Deserialize)]
struct ScanTaskConfig {
    #[serde(default = "default_interface")]
    interface: String,
}

fn default_interface() -> String {
    "eth0".to_string()
}

/// Enumerates slaves on an interface and posts them as devices.
struct BusScanner {
    provider: Arc<dyn MasterProvider>,
    registry: &'static Registry,
    interface: String,
}

impl Scanner for BusScanner {
    fn scan(&mut self) -> errors::Result<Vec<Device>> {
        let mut master = self.provider.open(&self.interface)?;
        let slaves = master.scan()?;
        Ok(slaves
            .into_iter()
            .map(|slave| {
                let known = self.registry.is_device_known(slave.vendor_id, slave.product_code);
                let make = self
                    .registry
                    .vendor_name(slave.vendor_id)
                    .unwrap_or_else(|| format!("vendor {:#06x}", slave.vendor_id));
                Device {
                    key: format!("{}:{}", self.interface, slave.position),
                    name: slave.name.clone(),
                    rack: 0,
                    location: format!("{} position {}", self.interface, slave.position),
                    make,
                    model: slave.name,
                    properties: serde_json::json!({
                        "vendor_id": slave.vendor_id,
                        "product_code": slave.product_code,
                        "revision": slave.revision,
                        "position": slave.position,
                        "interface": self.interface,
                        "known": known,
                    }),
                    configured: false,
                }
            })
            .collect())
    }
}

/// Builds EtherCAT read, write, and scan tasks.
pub struct EthercatFactory {
    provider: Arc<dyn MasterProvider>,
    registry: &'static Registry,
    breaker_config: breaker::Config,
}

impl EthercatFactory {
    pub fn new(
        provider: Arc<dyn MasterProvider>,
        registry: &'static Registry,
        breaker_config: breaker::Config,
    ) -> Self {
        Self { provider, registry, breaker_config }
    }

    fn configure(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Result<ConfigureResult, Error> {
        match task.task_type.as_str() {
            READ_TASK_TYPE => {
                let cfg = ReadTaskConfig::parse(&task.config)?;
                let master = self.provider.open(&cfg.interface)?;
                let source =
                    EthercatSource::open(ctx.client.as_ref(), self.registry, master, cfg)?;
                Ok(ConfigureResult::new(Box::new(ReadTask::new(
                    ctx,
                    task,
                    self.breaker_config.clone(),
                    Box::new(source),
                    None,
                ))))
            }
            WRITE_TASK_TYPE => {
                let cfg = WriteTaskConfig::parse(&task.config)?;
                let state_rate = Rate::hz(cfg.state_rate);
                let master = self.provider.open(&cfg.interface)?;
                let sink = EthercatSink::open(ctx.client.as_ref(), self.registry, master, cfg)?;
                Ok(ConfigureResult::new(Box::new(WriteTask::new(
                    ctx,
                    task,
                    self.breaker_config.clone(),
                    Box::new(sink),
                    state_rate,
                ))))
            }
            SCAN_TASK_TYPE => {
                let cfg: ScanTaskConfig = weir_task::common::parse_config(&task.config)?;
                let scanner = BusScanner {
                    provider: self.provider.clone(),
                    registry: self.registry,
                    interface: cfg.interface,
                };
                Ok(ConfigureResult::auto_start(Box::new(ScanTask::new(
                    ctx,
                    task,
                    weir_cluster::task_rack_key(task.key),
                    Box::new(scanner),
                    Rate::hz(SCAN_RATE_HZ),
                    self.breaker_config.clone(),
                ))))
            }
            other => Err(Error::new(
                errors::CONFIGURATION,
                format!("unknown ethercat task type {other}"),
            )),
        }
    }
}

impl weir_task::factory::Factory for EthercatFactory {
    fn name(&self) -> &'static str {
        INTEGRATION_NAME
    }

    fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Result<ConfigureResult, Error>> {
        if !task.task_type.starts_with("ethercat_") {
            return None;
        }
        Some(self.configure(ctx, task))
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
            .find(|t| t.task_type == SCAN_TASK_TYPE);
        let descriptor = match existing {
            Some(t) => t,
            None => {
                let template = ClusterTask {
                    key: weir_cluster::task_key(rack.key, 0),
                    name: "ethercat scan".to_string(),
                    task_type: SCAN_TASK_TYPE.to_string(),
                    internal: true,
                    ..ClusterTask::default()
                };
                match ctx.client.create_task(&template) {
                    Ok(t) => t,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to create ethercat scan task");
                        return Vec::new();
                    }
                }
            }
        };
        match self.configure(ctx, &descriptor) {
            Ok(result) => {
                let mut task = result.task;
                task.exec(&weir_task::task::Command::new(
                    descriptor.key,
                    weir_task::task::START_CMD_TYPE,
                    serde_json::Value::Null,
                ));
                vec![(descriptor, task)]
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to configure ethercat scan task");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{SimulatedProvider, SlaveInfo};
    use weir_cluster::mock::MockCluster;
    use weir_cluster::Client;
    use weir_core::telem::MILLISECOND;
    use weir_task::factory::Factory as _;

    fn factory() -> EthercatFactory {
        let provider = Arc::new(SimulatedProvider::new(vec![SlaveInfo {
            position: 0,
            vendor_id: 0x2,
            product_code: 0x0C1E3052,
            revision: 0x00120000,
            name: "EL3102".to_string(),
        }]));
        EthercatFactory::new(
            provider,
            Registry::builtin(),
            breaker::Config {
                name: "ec-factory".to_string(),
                base_interval: MILLISECOND,
                max_retries: 3,
                scale: 1.0,
            },
        )
    }

    #[test]
    fn claims_only_its_prefix() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let factory = factory();
        let other = ClusterTask { task_type: "opcua_read".to_string(), ..ClusterTask::default() };
        assert!(factory.configure_task(&ctx, &other).is_none());
    }

    #[test]
    fn initial_scan_task_posts_devices() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let rack = cluster.create_rack("r").unwrap();
        let factory = factory();
        let mut initial = factory.configure_initial_tasks(&ctx, &rack);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].0.task_type, SCAN_TASK_TYPE);
        // The first scan fires on start.
        for _ in 0..500 {
            if !cluster.retrieve_rack_devices(rack.key).unwrap().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        for (_, task) in &mut initial {
            task.stop(false);
        }
        let devices = cluster.retrieve_rack_devices(rack.key).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].make, "Beckhoff Automation");
        assert_eq!(devices[0].properties["known"], true);
    }

    #[test]
    fn bad_read_config_is_a_configuration_error() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let factory = factory();
        let task = ClusterTask {
            task_type: READ_TASK_TYPE.to_string(),
            config: serde_json::json!({ "sample_rate": 0.0, "interface": "eth0", "channels": [] }),
            ..ClusterTask::default()
        };
        let result = factory.configure_task(&ctx, &task).unwrap();
        assert!(result.is_err());
    }
}
