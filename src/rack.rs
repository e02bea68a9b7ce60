//! Rack bootstrap: claim this host's rack on the cluster, creating it when
//! the driver runs for the first time.

use std::sync::Arc;

use tracing::{info, warn};

use weir_cluster::{Client, Rack};
use weir_core::breaker::Breaker;
use weir_core::errors::{self, Error};

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| {
            warn!("failed to resolve hostname");
            "unknown".to_string()
        })
}

/// Retrieves the rack recorded in configuration, or creates a new rack
/// named after this host. Unreachable clusters retry under the breaker; a
/// stale rack key (deleted cluster-side) falls back to creation.
pub fn retrieve_driver_rack(
    rack_key: u32,
    breaker: &Breaker,
    client: &Arc<dyn Client>,
) -> Result<Rack, Error> {
    let mut key = rack_key;
    loop {
        let result = if key != 0 {
            info!(rack = key, "existing rack key found in configuration");
            client.retrieve_rack(key)
        } else {
            info!("no existing rack key found, creating a new rack");
            client.create_rack(&host_name())
        };
        match result {
            Ok(rack) => {
                info!(rack = rack.key, name = %rack.name, "retrieved rack");
                return Ok(rack);
            }
            Err(err) if err.matches(errors::UNREACHABLE) && breaker.wait(&err.message()) => {
                continue;
            }
            Err(err) if err.matches(errors::NOT_FOUND) && key != 0 => {
                warn!(rack = key, "configured rack no longer exists, creating a new one");
                key = 0;
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_cluster::mock::MockCluster;
    use weir_core::breaker;
    use weir_core::telem::MILLISECOND;

    fn test_breaker() -> Breaker {
        let b = Breaker::new(breaker::Config {
            name: "rack-test".to_string(),
            base_interval: MILLISECOND,
            max_retries: 3,
            scale: 1.0,
        });
        b.start();
        b
    }

    #[test]
    fn creates_rack_when_unconfigured() {
        let cluster = MockCluster::new();
        let client: Arc<dyn Client> = Arc::new(cluster.clone());
        let rack = retrieve_driver_rack(0, &test_breaker(), &client).unwrap();
        assert_ne!(rack.key, 0);
        assert_eq!(cluster.retrieve_rack(rack.key).unwrap().name, rack.name);
    }

    #[test]
    fn reuses_existing_rack() {
        let cluster = MockCluster::new();
        let client: Arc<dyn Client> = Arc::new(cluster.clone());
        let created = cluster.create_rack("bench-rack").unwrap();
        let rack = retrieve_driver_rack(created.key, &test_breaker(), &client).unwrap();
        assert_eq!(rack.key, created.key);
        assert_eq!(rack.name, "bench-rack");
    }

    #[test]
    fn stale_key_falls_back_to_creation() {
        let cluster = MockCluster::new();
        let client: Arc<dyn Client> = Arc::new(cluster.clone());
        let rack = retrieve_driver_rack(0xDEAD, &test_breaker(), &client).unwrap();
        assert_ne!(rack.key, 0xDEAD);
    }
}
