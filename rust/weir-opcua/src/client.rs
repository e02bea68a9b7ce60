//! The narrow OPC UA client contract, plus an in-process mock server.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use weir_core::errors::{self, Error};
use weir_core::series::DataType;

use crate::variant::Variant;

/// An OPC UA node identifier in its string form, e.g. `ns=2;s=Pressure`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server connection parameters carried in device properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub security_mode: String,
}

/// A browsable variable on the server.
#[derive(Debug, Clone)]
pub struct UaNode {
    pub node_id: NodeId,
    pub name: String,
    pub data_type: Option<DataType>,
}

/// A live session with one server.
pub trait UaClient: Send {
    /// Bulk-reads the value attribute of every node, one variant per node,
    /// in request order.
    fn read(&mut self, nodes: &[NodeId]) -> errors::Result<Vec<Variant>>;

    /// Enumerates the server's variable nodes.
    fn browse(&mut self) -> errors::Result<Vec<UaNode>>;
}

impl std::fmt::Debug for dyn UaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaClient").finish_non_exhaustive()
    }
}

/// Opens sessions from connection configs.
pub trait UaConnector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> errors::Result<Box<dyn UaClient>>;
}

#[derive(Default)]
struct MockServerState {
    values: HashMap<NodeId, Variant>,
    nodes: Vec<UaNode>,
    unreachable: bool,
    read_failures: Vec<Error>,
}

/// An in-process server scripted by tests.
#[derive(Clone, Default)]
pub struct MockUaServer {
    state: Arc<Mutex<MockServerState>>,
}

impl MockUaServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, node: NodeId, value: Variant) {
        let mut state = self.state.lock();
        if !state.values.contains_key(&node) {
            state.nodes.push(UaNode { node_id: node.clone(), name: node.0.clone(), data_type: None });
        }
        state.values.insert(node, value);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn fail_next_reads(&self, errs: Vec<Error>) {
        self.state.lock().read_failures = errs;
    }
}

impl UaConnector for MockUaServer {
    fn connect(&self, _config: &ConnectionConfig) -> errors::Result<Box<dyn UaClient>> {
        if self.state.lock().unreachable {
            return Err(Error::new(errors::UNREACHABLE, "endpoint unreachable"));
        }
        Ok(Box::new(MockSession { state: self.state.clone() }))
    }
}

struct MockSession {
    state: Arc<Mutex<MockServerState>>,
}

impl UaClient for MockSession {
    fn read(&mut self, nodes: &[NodeId]) -> errors::Result<Vec<Variant>> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(Error::new(errors::UNREACHABLE, "session lost"));
        }
        if !state.read_failures.is_empty() {
            return Err(state.read_failures.remove(0));
        }
        Ok(nodes
            .iter()
            .map(|n| state.values.get(n).cloned().unwrap_or(Variant::Null))
            .collect())
    }

    fn browse(&mut self) -> errors::Result<Vec<UaNode>> {
        Ok(self.state.lock().nodes.clone())
    }
}
