//! The node-graph intermediate representation and its stratification.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use weir_core::errors::{self, Error};

fn default_param() -> String {
    "out".to_string()
}

/// One endpoint of an edge: a node and one of its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    #[serde(default = "default_param")]
    pub param: String,
}

/// A directed dataflow edge from a source output to a target input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: Endpoint,
    pub target: Endpoint,
}

/// A node declaration: a unique key, a factory-dispatched type, and
/// type-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A complete user-authored control graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Fully-qualified name of a node's output port.
pub fn port_name(node: &str, param: &str) -> String {
    format!("{node}:{param}")
}

impl Graph {
    pub fn parse(config: &serde_json::Value) -> errors::Result<Self> {
        serde_json::from_value(config.clone())
            .map_err(|e| Error::new(errors::VALIDATION, format!("invalid graph: {e}")))
    }

    /// The qualified source port feeding `param` of `node`, if any edge
    /// targets it.
    pub fn input_port(&self, node: &str, param: &str) -> Option<String> {
        self.edges
            .iter()
            .find(|e| e.target.node == node && e.target.param == param)
            .map(|e| port_name(&e.source.node, &e.source.param))
    }

    /// All qualified source ports feeding `node`, in edge order.
    pub fn input_ports(&self, node: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.target.node == node)
            .map(|e| port_name(&e.source.node, &e.source.param))
            .collect()
    }

    /// Computes each node's stratum: sources sit at 0, and every other node
    /// sits one past its deepest predecessor. Fails on cycles and on edges
    /// referencing undeclared nodes.
    pub fn stratify(&self) -> errors::Result<HashMap<String, usize>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            in_degree.insert(node.key.as_str(), 0);
        }
        for edge in &self.edges {
            if !in_degree.contains_key(edge.source.node.as_str()) {
                return Err(Error::new(
                    errors::VALIDATION,
                    format!("edge references unknown node {}", edge.source.node),
                ));
            }
            let Some(count) = in_degree.get_mut(edge.target.node.as_str()) else {
                return Err(Error::new(
                    errors::VALIDATION,
                    format!("edge references unknown node {}", edge.target.node),
                ));
            };
            *count += 1;
        }

        let mut strata: HashMap<String, usize> = HashMap::with_capacity(self.nodes.len());
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        // Deterministic layering regardless of map iteration order.
        ready.sort_unstable();
        for key in &ready {
            strata.insert((*key).to_string(), 0);
        }

        let mut remaining = in_degree;
        let mut processed = 0usize;
        while let Some(current) = ready.pop() {
            processed += 1;
            let current_stratum = strata[current];
            for edge in &self.edges {
                if edge.source.node != current {
                    continue;
                }
                let target = edge.target.node.as_str();
                let entry = strata.entry(target.to_string()).or_insert(0);
                *entry = (*entry).max(current_stratum + 1);
                let count = remaining
                    .get_mut(target)
                    .unwrap_or_else(|| unreachable!("validated above"));
                *count -= 1;
                if *count == 0 {
                    ready.push(target);
                }
            }
        }

        if processed != self.nodes.len() {
            return Err(Error::new(errors::VALIDATION, "graph contains a cycle"));
        }
        Ok(strata)
    }
}
