//! The built-in node library: sources, operators, and channel sinks.

use std::sync::Arc;

use serde::Deserialize;

use weir_core::errors::{self, Error};
use weir_core::frame::ChannelKey;

use crate::factory::{unhandled, MultiNodeFactory, NodeFactory, NodeFactoryConfig};
use crate::ir::port_name;
use crate::node::{Node, NodeContext};
use crate::state::{Sample, State};

fn parse<T: serde::de::DeserializeOwned>(config: &serde_json::Value) -> errors::Result<T> {
    let config = if config.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(config)
        .map_err(|e| Error::new(errors::VALIDATION, format!("invalid node config: {e}")))
}

/// The standard factory chain: sources, then operators, then sinks.
pub fn std_factories() -> MultiNodeFactory {
    MultiNodeFactory::new(vec![
        Arc::new(SourceFactory),
        Arc::new(OperatorFactory),
        Arc::new(SinkFactory),
    ])
}

// ---------------------------------------------------------------------------
// Sources (stratum 0)
// ---------------------------------------------------------------------------

/// Fires every `ticks` cycles, publishing the fire count.
struct IntervalNode {
    port: String,
    ticks: u64,
    cycle: u64,
    fires: u64,
}

impl Node for IntervalNode {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
        let fire = self.cycle % self.ticks == 0;
        self.cycle += 1;
        if fire {
            self.fires += 1;
            state.set_port(&self.port, self.fires as f64)?;
            ctx.mark_changed("out");
        }
        Ok(())
    }
}

/// Publishes a fixed value once, on the first cycle.
struct ConstantNode {
    port: String,
    value: f64,
    published: bool,
}

impl Node for ConstantNode {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
        if self.published {
            return Ok(());
        }
        self.published = true;
        state.set_port(&self.port, self.value)?;
        ctx.mark_changed("out");
        Ok(())
    }
}

/// Publishes a subscribed channel's latest sample whenever the input queue
/// delivered one this cycle.
struct ChannelSourceNode {
    port: String,
    channel: ChannelKey,
}

impl Node for ChannelSourceNode {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
        if !state.channel_updated(self.channel) {
            return Ok(());
        }
        let value = state.channel(self.channel).unwrap_or(0.0);
        state.set_port(&self.port, value)?;
        ctx.mark_changed("out");
        Ok(())
    }
}

#[derive(Deserialize)]
struct IntervalConfig {
    #[serde(default = "default_ticks")]
    ticks: u64,
}

fn default_ticks() -> u64 {
    1
}

#[derive(Deserialize)]
struct ConstantConfig {
    value: f64,
}

#[derive(Deserialize)]
struct ChannelConfig {
    channel: ChannelKey,
}

struct SourceFactory;

impl NodeFactory for SourceFactory {
    fn create(&self, cfg: &NodeFactoryConfig) -> errors::Result<Box<dyn Node>> {
        let port = port_name(&cfg.spec.key, "out");
        match cfg.spec.node_type.as_str() {
            "interval" => {
                let c: IntervalConfig = parse(&cfg.spec.config)?;
                if c.ticks == 0 {
                    return Err(Error::new(errors::VALIDATION, "ticks must be at least 1"));
                }
                Ok(Box::new(IntervalNode { port, ticks: c.ticks, cycle: 0, fires: 0 }))
            }
            "constant" => {
                let c: ConstantConfig = parse(&cfg.spec.config)?;
                Ok(Box::new(ConstantNode { port, value: c.value, published: false }))
            }
            "channel" => {
                let c: ChannelConfig = parse(&cfg.spec.config)?;
                Ok(Box::new(ChannelSourceNode { port, channel: c.channel }))
            }
            other => Err(unhandled(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Operators (stratum >= 1)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    And,
    Or,
}

impl BinaryOp {
    fn from_type(node_type: &str) -> Option<Self> {
        Some(match node_type {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "div" => BinaryOp::Div,
            "gt" => BinaryOp::Gt,
            "lt" => BinaryOp::Lt,
            "ge" => BinaryOp::Ge,
            "le" => BinaryOp::Le,
            "eq" => BinaryOp::Eq,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            _ => return None,
        })
    }

    fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        let bool_out = |v: bool| if v { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Gt => bool_out(lhs > rhs),
            BinaryOp::Lt => bool_out(lhs < rhs),
            BinaryOp::Ge => bool_out(lhs >= rhs),
            BinaryOp::Le => bool_out(lhs <= rhs),
            BinaryOp::Eq => bool_out(lhs == rhs),
            BinaryOp::And => bool_out(lhs != 0.0 && rhs != 0.0),
            BinaryOp::Or => bool_out(lhs != 0.0 || rhs != 0.0),
        }
    }
}

/// A binary operator over the `lhs` and `rhs` inputs. Propagates only when
/// its output value actually changes.
struct BinaryNode {
    op: BinaryOp,
    lhs: String,
    rhs: String,
    port: String,
    prev: Option<f64>,
}

impl Node for BinaryNode {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
        let lhs = state.port(&self.lhs)?;
        let rhs = state.port(&self.rhs)?;
        let value = self.op.apply(lhs, rhs);
        if self.prev != Some(value) {
            self.prev = Some(value);
            state.set_port(&self.port, value)?;
            ctx.mark_changed("out");
        }
        Ok(())
    }
}

/// Logical negation of the `in` input.
struct NotNode {
    input: String,
    port: String,
    prev: Option<f64>,
}

impl Node for NotNode {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
        let value = if state.port(&self.input)? == 0.0 { 1.0 } else { 0.0 };
        if self.prev != Some(value) {
            self.prev = Some(value);
            state.set_port(&self.port, value)?;
            ctx.mark_changed("out");
        }
        Ok(())
    }
}

/// `cond ? lhs : rhs` over the `cond`, `lhs`, and `rhs` inputs.
struct SelectNode {
    cond: String,
    lhs: String,
    rhs: String,
    port: String,
    prev: Option<f64>,
}

impl Node for SelectNode {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
        let value = if state.port(&self.cond)? != 0.0 {
            state.port(&self.lhs)?
        } else {
            state.port(&self.rhs)?
        };
        if self.prev != Some(value) {
            self.prev = Some(value);
            state.set_port(&self.port, value)?;
            ctx.mark_changed("out");
        }
        Ok(())
    }
}

struct OperatorFactory;

fn required_input(cfg: &NodeFactoryConfig, param: &str) -> errors::Result<String> {
    cfg.graph.input_port(&cfg.spec.key, param).ok_or_else(|| {
        Error::new(
            errors::VALIDATION,
            format!("node {} is missing its {param} input", cfg.spec.key),
        )
    })
}

impl NodeFactory for OperatorFactory {
    fn create(&self, cfg: &NodeFactoryConfig) -> errors::Result<Box<dyn Node>> {
        let port = port_name(&cfg.spec.key, "out");
        if let Some(op) = BinaryOp::from_type(&cfg.spec.node_type) {
            return Ok(Box::new(BinaryNode {
                op,
                lhs: required_input(cfg, "lhs")?,
                rhs: required_input(cfg, "rhs")?,
                port,
                prev: None,
            }));
        }
        match cfg.spec.node_type.as_str() {
            "not" => Ok(Box::new(NotNode {
                input: required_input(cfg, "in")?,
                port,
                prev: None,
            })),
            "select" => Ok(Box::new(SelectNode {
                cond: required_input(cfg, "cond")?,
                lhs: required_input(cfg, "lhs")?,
                rhs: required_input(cfg, "rhs")?,
                port,
                prev: None,
            })),
            other => Err(unhandled(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Emits the `in` input to a cluster channel when it changes.
struct ChannelWriteNode {
    input: String,
    channel: ChannelKey,
    prev: Option<f64>,
}

impl Node for ChannelWriteNode {
    fn execute(&mut self, state: &mut State, _ctx: &mut NodeContext) -> errors::Result<()> {
        let value = state.port(&self.input)?;
        if self.prev == Some(value) {
            return Ok(());
        }
        self.prev = Some(value);
        state.emit(Sample { channel: self.channel, value });
        Ok(())
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }
}

struct SinkFactory;

impl NodeFactory for SinkFactory {
    fn create(&self, cfg: &NodeFactoryConfig) -> errors::Result<Box<dyn Node>> {
        match cfg.spec.node_type.as_str() {
            "channel_write" => {
                let c: ChannelConfig = parse(&cfg.spec.config)?;
                Ok(Box::new(ChannelWriteNode {
                    input: required_input(cfg, "in")?,
                    channel: c.channel,
                    prev: None,
                }))
            }
            other => Err(unhandled(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::build_scheduler;
    use crate::ir::Graph;
    use serde_json::json;

    fn build(graph: serde_json::Value) -> crate::scheduler::Scheduler {
        let graph = Graph::parse(&graph).unwrap();
        let mut scheduler = build_scheduler(&graph, &std_factories()).unwrap();
        // Subscribe every channel source ahead of the first cycle.
        for node in &graph.nodes {
            if node.node_type == "channel" {
                let channel = node.config["channel"].as_u64().unwrap() as ChannelKey;
                scheduler.state_mut().register_channel(channel);
            }
        }
        scheduler
    }

    #[test]
    fn threshold_alarm_graph_end_to_end() {
        // pressure > limit, emitted to channel 50 on change only.
        let mut sched = build(json!({
            "nodes": [
                { "key": "pressure", "type": "channel", "config": { "channel": 10 } },
                { "key": "limit", "type": "constant", "config": { "value": 100.0 } },
                { "key": "alarm", "type": "gt" },
                { "key": "alarm_out", "type": "channel_write", "config": { "channel": 50 } }
            ],
            "edges": [
                { "source": { "node": "pressure" }, "target": { "node": "alarm", "param": "lhs" } },
                { "source": { "node": "limit" }, "target": { "node": "alarm", "param": "rhs" } },
                { "source": { "node": "alarm" }, "target": { "node": "alarm_out", "param": "in" } }
            ]
        }));
        let input = sched.state().input_handle();
        let output = sched.state().output_handle();

        // Cycle 1: constant publishes, pressure quiet: alarm computes 0.
        sched.next().unwrap();
        assert_eq!(output.pop(), Some(Sample { channel: 50, value: 0.0 }));

        // Nominal pressure: alarm stays 0, no re-emit.
        input.push(Sample { channel: 10, value: 42.0 }).unwrap();
        sched.next().unwrap();
        assert_eq!(output.pop(), None);

        // Over-limit pressure: alarm fires once.
        input.push(Sample { channel: 10, value: 180.0 }).unwrap();
        sched.next().unwrap();
        assert_eq!(output.pop(), Some(Sample { channel: 50, value: 1.0 }));

        // Still over limit: value unchanged, nothing emitted.
        input.push(Sample { channel: 10, value: 200.0 }).unwrap();
        sched.next().unwrap();
        assert_eq!(output.pop(), None);

        // Back to nominal: alarm clears.
        input.push(Sample { channel: 10, value: 10.0 }).unwrap();
        sched.next().unwrap();
        assert_eq!(output.pop(), Some(Sample { channel: 50, value: 0.0 }));
    }

    #[test]
    fn interval_paces_downstream_work() {
        let mut sched = build(json!({
            "nodes": [
                { "key": "tick", "type": "interval", "config": { "ticks": 3 } },
                { "key": "one", "type": "constant", "config": { "value": 1.0 } },
                { "key": "count", "type": "add" },
                { "key": "out", "type": "channel_write", "config": { "channel": 60 } }
            ],
            "edges": [
                { "source": { "node": "tick" }, "target": { "node": "count", "param": "lhs" } },
                { "source": { "node": "one" }, "target": { "node": "count", "param": "rhs" } },
                { "source": { "node": "count" }, "target": { "node": "out", "param": "in" } }
            ]
        }));
        let output = sched.state().output_handle();
        for _ in 0..7 {
            sched.next().unwrap();
        }
        // Fires on cycles 0, 3, 6: counts 1, 2, 3; emitted as fires + 1.
        let mut emitted = Vec::new();
        while let Some(sample) = output.pop() {
            emitted.push(sample.value);
        }
        assert_eq!(emitted, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn select_routes_on_condition() {
        let mut sched = build(json!({
            "nodes": [
                { "key": "cond", "type": "channel", "config": { "channel": 1 } },
                { "key": "high", "type": "constant", "config": { "value": 10.0 } },
                { "key": "low", "type": "constant", "config": { "value": 2.0 } },
                { "key": "pick", "type": "select" },
                { "key": "out", "type": "channel_write", "config": { "channel": 70 } }
            ],
            "edges": [
                { "source": { "node": "cond" }, "target": { "node": "pick", "param": "cond" } },
                { "source": { "node": "high" }, "target": { "node": "pick", "param": "lhs" } },
                { "source": { "node": "low" }, "target": { "node": "pick", "param": "rhs" } },
                { "source": { "node": "pick" }, "target": { "node": "out", "param": "in" } }
            ]
        }));
        let input = sched.state().input_handle();
        let output = sched.state().output_handle();
        sched.next().unwrap();
        assert_eq!(output.pop(), Some(Sample { channel: 70, value: 2.0 }));
        input.push(Sample { channel: 1, value: 1.0 }).unwrap();
        sched.next().unwrap();
        assert_eq!(output.pop(), Some(Sample { channel: 70, value: 10.0 }));
    }

    #[test]
    fn unknown_type_fails_with_node_context() {
        let graph = Graph::parse(&json!({
            "nodes": [ { "key": "x", "type": "quantum_flux" } ],
            "edges": []
        }))
        .unwrap();
        let err = build_scheduler(&graph, &std_factories()).unwrap_err();
        assert!(err.matches(errors::NOT_FOUND));
        assert!(err.data.contains("quantum_flux"));
    }
}
