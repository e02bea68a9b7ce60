//! Chain-of-responsibility node construction from the graph IR.

use std::sync::Arc;

use weir_core::errors::{self, Error};

use crate::ir::{Graph, NodeSpec};
use crate::node::Node;
use crate::scheduler::Scheduler;
use crate::state::State;

/// Everything a factory needs to build one node.
pub struct NodeFactoryConfig<'a> {
    pub spec: &'a NodeSpec,
    /// The full graph, for input-port lookups.
    pub graph: &'a Graph,
}

/// Builds nodes from IR definitions.
///
/// The contract:
/// - `Ok(node)` — this factory built the node.
/// - `Err` matching `sy.query.not_found` — this factory does not handle the
///   type; the next factory in the chain is consulted.
/// - any other `Err` — a real construction failure; it is annotated with
///   the node's key and type and propagated.
pub trait NodeFactory: Send + Sync {
    fn create(&self, cfg: &NodeFactoryConfig) -> errors::Result<Box<dyn Node>>;
}

/// Error returned by a factory that does not recognize a node type.
pub fn unhandled(node_type: &str) -> Error {
    Error::new(errors::NOT_FOUND, format!("no handler for node type {node_type}"))
}

/// Tries factories in order. More specific factories go first.
#[derive(Default)]
pub struct MultiNodeFactory {
    factories: Vec<Arc<dyn NodeFactory>>,
}

impl MultiNodeFactory {
    pub fn new(factories: Vec<Arc<dyn NodeFactory>>) -> Self {
        Self { factories }
    }

    pub fn add(&mut self, factory: Arc<dyn NodeFactory>) {
        self.factories.push(factory);
    }

    pub fn create(&self, cfg: &NodeFactoryConfig) -> errors::Result<Box<dyn Node>> {
        for factory in &self.factories {
            match factory.create(cfg) {
                Ok(node) => return Ok(node),
                Err(err) if err.matches(errors::NOT_FOUND) => continue,
                Err(err) => {
                    return Err(err.with_data(format!(
                        "{} (while creating node '{}' of type '{}')",
                        err.data, cfg.spec.key, cfg.spec.node_type
                    )));
                }
            }
        }
        Err(Error::new(
            errors::NOT_FOUND,
            format!(
                "no factory registered for node type '{}' (node: {})",
                cfg.spec.node_type, cfg.spec.key
            ),
        ))
    }
}

/// Builds a ready-to-run scheduler from a graph: stratifies, constructs
/// every node through the factory chain, registers ports, and wires edges.
pub fn build_scheduler(graph: &Graph, factory: &MultiNodeFactory) -> errors::Result<Scheduler> {
    let strata = graph.stratify()?;
    let mut scheduler = Scheduler::new(State::default());
    // Stratum order keeps registration deterministic.
    let mut specs: Vec<&NodeSpec> = graph.nodes.iter().collect();
    specs.sort_by_key(|spec| (strata[&spec.key], spec.key.clone()));
    for spec in specs {
        let node = factory.create(&NodeFactoryConfig { spec, graph })?;
        for param in node.outputs() {
            scheduler
                .state_mut()
                .register_port(crate::ir::port_name(&spec.key, &param));
        }
        scheduler.register_node(spec.key.clone(), node, strata[&spec.key])?;
    }
    for edge in &graph.edges {
        scheduler.register_outgoing_edge(
            &edge.source.node,
            &edge.source.param,
            &edge.target.node,
        )?;
    }
    Ok(scheduler)
}
