//! The OPC UA task factory.

use std::sync::Arc;

use weir_cluster::{Rack, Task as ClusterTask};
use weir_core::breaker;
use weir_core::errors::{self, Error};
use weir_core::telem::Rate;
use weir_task::read_task::ReadTask;
use weir_task::scan_task::ScanTask;
use weir_task::task::{ConfigureResult, Context, Task};

use crate::client::UaConnector;
use crate::read_task::{ArrayReadSource, ReadTaskConfig, UnaryReadSource};
use crate::scan::{EndpointScanner, ScanConfig};
use crate::INTEGRATION_NAME;

pub const READ_TASK_TYPE: &str = "opcua_read";
pub const SCAN_TASK_TYPE: &str = "opcua_scan";

const SCAN_RATE_HZ: f64 = 0.2;

/// Builds OPC UA read and scan tasks over an injected connector.
pub struct OpcuaFactory<C: UaConnector + Clone + 'static> {
    connector: C,
    breaker_config: breaker::Config,
}

impl<C: UaConnector + Clone + 'static> OpcuaFactory<C> {
    pub fn new(connector: C, breaker_config: breaker::Config) -> Self {
        Self { connector, breaker_config }
    }

    fn configure(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Result<ConfigureResult, Error> {
        match task.task_type.as_str() {
            READ_TASK_TYPE => {
                let cfg = ReadTaskConfig::parse(&task.config)?;
                let source: Box<dyn weir_task::pipeline::Source> = if cfg.array_size > 1 {
                    Box::new(ArrayReadSource::open(ctx.client.as_ref(), &self.connector, cfg)?)
                } else {
                    Box::new(UnaryReadSource::open(ctx.client.as_ref(), &self.connector, cfg)?)
                };
                Ok(ConfigureResult::new(Box::new(ReadTask::new(
                    ctx,
                    task,
                    self.breaker_config.clone(),
                    source,
                    None,
                ))))
            }
            SCAN_TASK_TYPE => {
                let cfg: ScanConfig = weir_task::common::parse_config(&task.config)?;
                let scanner = EndpointScanner::new(self.connector.clone(), cfg);
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
                format!("unknown opcua task type {other}"),
            )),
        }
    }
}

impl<C: UaConnector + Clone + 'static> weir_task::factory::Factory for OpcuaFactory<C> {
    fn name(&self) -> &'static str {
        INTEGRATION_NAME
    }

    fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Result<ConfigureResult, Error>> {
        if !task.task_type.starts_with("opcua_") {
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
                    name: "opcua scan".to_string(),
                    task_type: SCAN_TASK_TYPE.to_string(),
                    internal: true,
                    ..ClusterTask::default()
                };
                match ctx.client.create_task(&template) {
                    Ok(t) => t,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to create opcua scan task");
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
                tracing::warn!(error = %err, "failed to configure opcua scan task");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockUaServer, NodeId};
    use crate::variant::{Value, Variant};
    use serde_json::json;
    use weir_cluster::mock::MockCluster;
    use weir_cluster::{Channel, Client, Device};
    use weir_core::series::DataType;
    use weir_core::telem::MILLISECOND;
    use weir_task::factory::Factory as _;

    fn breaker_config() -> breaker::Config {
        breaker::Config {
            name: "ua-factory".to_string(),
            base_interval: MILLISECOND,
            max_retries: 3,
            scale: 1.0,
        }
    }

    #[test]
    fn read_task_configures_and_streams() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let data = cluster
            .create_channel(Channel {
                name: "pressure".to_string(),
                data_type: DataType::Float64,
                ..Channel::default()
            })
            .unwrap();
        cluster
            .create_device(&Device {
                key: "ua-1".to_string(),
                properties: json!({ "connection": { "endpoint": "opc.tcp://plc:4840" } }),
                ..Device::default()
            })
            .unwrap();
        let server = MockUaServer::new();
        server.set_value(
            NodeId("ns=2;s=Pressure".to_string()),
            Variant::Array(vec![Value::Double(1.0), Value::Double(2.0)]),
        );
        let factory = OpcuaFactory::new(server, breaker_config());
        let task = ClusterTask {
            key: 400,
            name: "plc read".to_string(),
            task_type: READ_TASK_TYPE.to_string(),
            config: json!({
                "sample_rate": 200.0,
                "device": "ua-1",
                "array_size": 2,
                "channels": [ { "channel": data.key, "node_id": "ns=2;s=Pressure" } ]
            }),
            ..ClusterTask::default()
        };
        let result = factory.configure_task(&ctx, &task).unwrap().unwrap();
        let mut read = result.task;
        read.exec(&weir_task::task::Command::new(
            400,
            weir_task::task::START_CMD_TYPE,
            serde_json::Value::Null,
        ));
        for _ in 0..500 {
            if !cluster.written_to(data.key).is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        read.stop(false);
        let written = cluster.written_to(data.key);
        assert!(!written.is_empty());
        assert_eq!(written[0].at_f64(0), Some(1.0));
        assert_eq!(written[0].at_f64(1), Some(2.0));
    }

    #[test]
    fn unknown_device_fails_configuration() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let factory = OpcuaFactory::new(MockUaServer::new(), breaker_config());
        let task = ClusterTask {
            task_type: READ_TASK_TYPE.to_string(),
            config: json!({
                "sample_rate": 100.0,
                "stream_rate": 10.0,
                "device": "missing",
                "channels": [ { "channel": 1, "node_id": "ns=2;s=A" } ]
            }),
            ..ClusterTask::default()
        };
        let result = factory.configure_task(&ctx, &task).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn does_not_claim_other_integrations() {
        let cluster = MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let factory = OpcuaFactory::new(MockUaServer::new(), breaker_config());
        let task = ClusterTask { task_type: "ethercat_read".to_string(), ..ClusterTask::default() };
        assert!(factory.configure_task(&ctx, &task).is_none());
    }
}
