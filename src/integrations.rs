//! Wires enabled integrations into the factory registry.

use std::sync::Arc;

use tracing::info;

use weir_core::breaker;
use weir_ethercat::master::SimulatedProvider;
use weir_ethercat::{EthercatFactory, Registry};
use weir_opcua::{MockUaServer, OpcuaFactory};
use weir_task::factory::Factory;
use weir_task::heartbeat::HeartbeatFactory;

use crate::config::Config;
use crate::http::HttpFactory;
use crate::meminfo::MeminfoFactory;
use crate::sequence::SequenceFactory;

/// Enables in-process simulated hardware backends for cable-less bring-up.
pub const SIMULATED_INTEGRATION: &str = "simulated";

/// Builds the factory list in claim order: the heartbeat first, then the
/// built-in integrations, then hardware integrations with a linked backend.
///
/// The vendor EtherCAT master and OPC UA client stacks are external; their
/// factories register only when the `simulated` integration supplies the
/// in-process backends.
pub fn build_factories(cfg: &Config, breaker_config: &breaker::Config) -> Vec<Arc<dyn Factory>> {
    let mut factories: Vec<Arc<dyn Factory>> =
        vec![Arc::new(HeartbeatFactory::new(breaker_config.clone()))];

    if cfg.integration_enabled(crate::meminfo::INTEGRATION_NAME) {
        factories.push(Arc::new(MeminfoFactory::new(breaker_config.clone())));
    } else {
        info!("meminfo integration disabled");
    }

    if cfg.integration_enabled(crate::sequence::INTEGRATION_NAME) {
        factories.push(Arc::new(SequenceFactory::new(breaker_config.clone())));
    } else {
        info!("sequence integration disabled");
    }

    if cfg.integration_enabled(crate::http::INTEGRATION_NAME) {
        factories.push(Arc::new(HttpFactory::new(breaker_config.clone())));
    } else {
        info!("http integration disabled");
    }

    let simulated = cfg.integrations.iter().any(|i| i == SIMULATED_INTEGRATION);

    if cfg.integration_enabled(weir_opcua::INTEGRATION_NAME) && simulated {
        factories.push(Arc::new(OpcuaFactory::new(
            MockUaServer::new(),
            breaker_config.clone(),
        )));
    } else {
        info!("opcua integration requires an external client backend; not registered");
    }

    if cfg.integration_enabled(weir_ethercat::INTEGRATION_NAME) && simulated {
        factories.push(Arc::new(EthercatFactory::new(
            Arc::new(SimulatedProvider::new(Vec::new())),
            Registry::builtin(),
            breaker_config.clone(),
        )));
    } else {
        info!("ethercat integration requires an external master backend; not registered");
    }

    factories
}
