//! OPC UA endpoint scanning: probes configured endpoints and posts
//! reachable servers as devices.

use serde::Deserialize;

use weir_cluster::Device;
use weir_core::errors;

use crate::client::{ConnectionConfig, UaConnector};

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Probes each configured endpoint with a short-lived session.
pub struct EndpointScanner<C: UaConnector> {
    connector: C,
    config: ScanConfig,
}

impl<C: UaConnector> EndpointScanner<C> {
    pub fn new(connector: C, config: ScanConfig) -> Self {
        Self { connector, config }
    }
}

impl<C: UaConnector + Send> weir_task::scan_task::Scanner for EndpointScanner<C> {
    fn scan(&mut self) -> errors::Result<Vec<Device>> {
        let mut devices = Vec::new();
        for endpoint in &self.config.endpoints {
            let connection = ConnectionConfig { endpoint: endpoint.clone(), ..Default::default() };
            let mut session = match self.connector.connect(&connection) {
                Ok(s) => s,
                // An unreachable endpoint is absent, not fatal; it will be
                // withdrawn if previously posted.
                Err(_) => continue,
            };
            let variables = session.browse().map(|nodes| nodes.len()).unwrap_or(0);
            devices.push(Device {
                key: endpoint.clone(),
                name: endpoint.clone(),
                rack: 0,
                location: endpoint.clone(),
                make: "OPC UA".to_string(),
                model: String::new(),
                properties: serde_json::json!({
                    "connection": { "endpoint": endpoint },
                    "variables": variables,
                }),
                configured: false,
            });
        }
        Ok(devices)
    }
}
