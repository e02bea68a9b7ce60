//! HTTP-reachable instruments: a scan task probing configured endpoints and
//! posting the responders as devices.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use weir_cluster::{Device, Rack, Task as ClusterTask};
use weir_core::breaker;
use weir_core::errors::{self, Error};
use weir_core::telem::Rate;
use weir_task::common;
use weir_task::scan_task::{ScanTask, Scanner};
use weir_task::task::{ConfigureResult, Context, Task};

pub const INTEGRATION_NAME: &str = "http";
pub const SCAN_TASK_TYPE: &str = "http_scan";

const SCAN_RATE_HZ: f64 = 0.1;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Base URLs of instruments to probe, e.g. `http://gauge-7:8080`.
    pub endpoints: Vec<String>,
}

/// Instrument self-description returned from the probe path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct InstrumentInfo {
    name: String,
    make: String,
    model: String,
    serial: String,
}

struct HttpScanner {
    client: reqwest::blocking::Client,
    config: ScanConfig,
}

impl HttpScanner {
    fn new(config: ScanConfig) -> errors::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::new(errors::INTERNAL, format!("http client: {e}")))?;
        Ok(Self { client, config })
    }
}

impl Scanner for HttpScanner {
    fn scan(&mut self) -> errors::Result<Vec<Device>> {
        let mut devices = Vec::new();
        for endpoint in &self.config.endpoints {
            let url = format!("{}/weir/info", endpoint.trim_end_matches('/'));
            let response = match self.client.get(&url).send() {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    debug!(endpoint = %endpoint, status = %r.status(), "instrument probe refused");
                    continue;
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "instrument unreachable");
                    continue;
                }
            };
            let info: InstrumentInfo = response.json().unwrap_or_default();
            let key = if info.serial.is_empty() { endpoint.clone() } else { info.serial.clone() };
            devices.push(Device {
                key,
                name: if info.name.is_empty() { endpoint.clone() } else { info.name },
                rack: 0,
                location: endpoint.clone(),
                make: info.make,
                model: info.model,
                properties: serde_json::json!({ "endpoint": endpoint }),
                configured: false,
            });
        }
        Ok(devices)
    }
}

/// Builds the HTTP instrument scan task.
pub struct HttpFactory {
    breaker_config: breaker::Config,
}

impl HttpFactory {
    pub fn new(breaker_config: breaker::Config) -> Self {
        Self { breaker_config }
    }
}

impl weir_task::factory::Factory for HttpFactory {
    fn name(&self) -> &'static str {
        INTEGRATION_NAME
    }

    fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Result<ConfigureResult, Error>> {
        if task.task_type != SCAN_TASK_TYPE {
            return None;
        }
        let build = || -> Result<ConfigureResult, Error> {
            let cfg: ScanConfig = common::parse_config(&task.config)?;
            let scanner = HttpScanner::new(cfg)?;
            Ok(ConfigureResult::auto_start(Box::new(ScanTask::new(
                ctx,
                task,
                weir_cluster::task_rack_key(task.key),
                Box::new(scanner),
                Rate::hz(SCAN_RATE_HZ),
                self.breaker_config.clone(),
            ))))
        };
        Some(build())
    }

    fn configure_initial_tasks(
        &self,
        ctx: &Arc<Context>,
        rack: &Rack,
    ) -> Vec<(ClusterTask, Box<dyn Task>)> {
        // The endpoint list lives in task configuration, so the initial
        // task starts with nothing to probe until the cluster sets one.
        let existing = ctx
            .client
            .retrieve_rack_tasks(rack.key)
            .unwrap_or_default()
            .into_iter()
            .any(|t| t.task_type == SCAN_TASK_TYPE);
        if existing {
            return Vec::new();
        }
        let template = ClusterTask {
            key: weir_cluster::task_key(rack.key, 0),
            name: "http scan".to_string(),
            task_type: SCAN_TASK_TYPE.to_string(),
            internal: true,
            config: serde_json::json!({ "endpoints": [] }),
            ..ClusterTask::default()
        };
        if let Err(err) = ctx.client.create_task(&template) {
            tracing::warn!(error = %err, "failed to create http scan task");
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use weir_core::telem::MILLISECOND;
    use weir_task::factory::Factory as _;

    fn serve_once(body: &'static str, status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len(),
                );
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn responding_instruments_become_devices() {
        let endpoint = serve_once(
            r#"{"name": "flow gauge", "make": "acme", "model": "fg-2", "serial": "fg-2-0001"}"#,
            "200 OK",
        );
        let mut scanner =
            HttpScanner::new(ScanConfig { endpoints: vec![endpoint.clone()] }).unwrap();
        let devices = scanner.scan().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].key, "fg-2-0001");
        assert_eq!(devices[0].make, "acme");
        assert_eq!(devices[0].properties["endpoint"], endpoint);
    }

    #[test]
    fn unreachable_and_refusing_instruments_are_skipped() {
        let refusing = serve_once("{}", "503 Service Unavailable");
        let mut scanner = HttpScanner::new(ScanConfig {
            endpoints: vec![refusing, "http://127.0.0.1:1".to_string()],
        })
        .unwrap();
        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn factory_claims_only_http_scan() {
        let cluster = weir_cluster::mock::MockCluster::new();
        let ctx = Context::new(Arc::new(cluster.clone()));
        let factory = HttpFactory::new(breaker::Config {
            name: "http-test".to_string(),
            base_interval: MILLISECOND,
            max_retries: 3,
            scale: 1.0,
        });
        let other = ClusterTask { task_type: "meminfo".to_string(), ..ClusterTask::default() };
        assert!(factory.configure_task(&ctx, &other).is_none());
        let scan = ClusterTask {
            task_type: SCAN_TASK_TYPE.to_string(),
            config: serde_json::json!({ "endpoints": [] }),
            ..ClusterTask::default()
        };
        let result = factory.configure_task(&ctx, &scan).unwrap().unwrap();
        assert!(result.auto_start);
        let mut task = result.task;
        task.stop(false);
    }
}
