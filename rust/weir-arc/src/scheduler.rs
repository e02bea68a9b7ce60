//! The stratified reactive scheduler.

use std::collections::HashMap;

use weir_core::errors::{self, Error};

use crate::node::{Node, NodeContext};
use crate::state::State;

#[derive(Debug)]
struct NodeSlot {
    id: String,
    node: Box<dyn Node>,
    output_params: Vec<String>,
    /// Edges from this node: (output param index, target node index).
    outgoing: Vec<(usize, usize)>,
}

/// Executes a pre-stratified node graph one cycle at a time.
///
/// `next` is single-threaded cooperative and allocation-free: node ids are
/// interned to indices at registration, the changed set is a pre-sized flag
/// vector, and per-node change marks reuse one scratch buffer.
#[derive(Debug)]
pub struct Scheduler {
    state: State,
    nodes: Vec<NodeSlot>,
    ids: HashMap<String, usize>,
    strata: Vec<Vec<usize>>,
    node_stratum: Vec<usize>,
    changed: Vec<bool>,
    mark_scratch: Vec<usize>,
    reported: Vec<weir_core::errors::Error>,
    current_executing: usize,
    started: bool,
}

impl Scheduler {
    pub fn new(state: State) -> Self {
        Self {
            state,
            nodes: Vec::new(),
            ids: HashMap::new(),
            strata: Vec::new(),
            node_stratum: Vec::new(),
            changed: Vec::new(),
            mark_scratch: Vec::new(),
            reported: Vec::new(),
            current_executing: 0,
            started: false,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn num_strata(&self) -> usize {
        self.strata.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn stratum_of(&self, id: &str) -> Option<usize> {
        self.ids.get(id).map(|idx| self.node_stratum[*idx])
    }

    /// Registers a node at a stratum. Load-time only; fails on duplicate
    /// ids.
    pub fn register_node(
        &mut self,
        id: impl Into<String>,
        node: Box<dyn Node>,
        stratum: usize,
    ) -> errors::Result<()> {
        let id = id.into();
        if self.ids.contains_key(&id) {
            return Err(Error::new(
                errors::VALIDATION,
                format!("node {id} is already registered"),
            ));
        }
        let idx = self.nodes.len();
        if stratum >= self.strata.len() {
            self.strata.resize_with(stratum + 1, Vec::new);
        }
        self.strata[stratum].push(idx);
        let output_params = node.outputs();
        let max_outputs = output_params.len();
        self.nodes.push(NodeSlot { id: id.clone(), node, output_params, outgoing: Vec::new() });
        self.ids.insert(id, idx);
        self.node_stratum.push(stratum);
        self.changed.push(false);
        if self.mark_scratch.capacity() < max_outputs {
            self.mark_scratch.reserve(max_outputs - self.mark_scratch.capacity());
        }
        Ok(())
    }

    /// Wires a source output to a downstream node. Load-time only; must
    /// precede the first `next`. The target must sit in a deeper stratum so
    /// change marks land ahead of the sweep.
    pub fn register_outgoing_edge(
        &mut self,
        source: &str,
        source_param: &str,
        target: &str,
    ) -> errors::Result<()> {
        if self.started {
            return Err(Error::new(
                errors::VALIDATION,
                "edges must be registered before the first cycle",
            ));
        }
        let src_idx = *self
            .ids
            .get(source)
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("unknown node {source}")))?;
        let tgt_idx = *self
            .ids
            .get(target)
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("unknown node {target}")))?;
        let param_idx = self.nodes[src_idx]
            .output_params
            .iter()
            .position(|p| p == source_param)
            .ok_or_else(|| {
                Error::new(
                    errors::NOT_FOUND,
                    format!("node {source} has no output {source_param}"),
                )
            })?;
        if self.node_stratum[tgt_idx] <= self.node_stratum[src_idx] {
            return Err(Error::new(
                errors::VALIDATION,
                format!("edge {source} -> {target} does not descend the strata"),
            ));
        }
        self.nodes[src_idx].outgoing.push((param_idx, tgt_idx));
        Ok(())
    }

    /// Runs one cycle: drain inputs, execute stratum 0 unconditionally,
    /// execute deeper strata where changed, clear the changed set.
    ///
    /// A node error aborts the cycle and surfaces with the node id
    /// attached; the changed set is left intact so the next cycle resumes
    /// where this one stopped.
    pub fn next(&mut self) -> errors::Result<()> {
        self.started = true;
        self.state.process_input_queue();

        for stratum in 0..self.strata.len() {
            for position in 0..self.strata[stratum].len() {
                let idx = self.strata[stratum][position];
                if stratum > 0 && !self.changed[idx] {
                    continue;
                }
                self.execute_node(idx)?;
            }
        }

        for flag in &mut self.changed {
            *flag = false;
        }
        self.state.clear_cycle();
        Ok(())
    }

    fn execute_node(&mut self, idx: usize) -> errors::Result<()> {
        self.current_executing = idx;
        self.mark_scratch.clear();
        let slot = &mut self.nodes[idx];
        let mut ctx =
            NodeContext::new(&slot.output_params, &mut self.mark_scratch, &mut self.reported);
        if let Err(err) = slot.node.execute(&mut self.state, &mut ctx) {
            return Err(Error::new(err.kind, format!("node {}: {}", slot.id, err.data)));
        }
        // Every edge descends the strata, so these marks land before the
        // sweep reaches their targets.
        for marked_param in &self.mark_scratch {
            for (param_idx, target) in &self.nodes[idx].outgoing {
                if param_idx == marked_param {
                    self.changed[*target] = true;
                }
            }
        }
        Ok(())
    }

    /// Drains errors nodes reported through `report_error` since the last
    /// call. The host task surfaces them as warnings.
    pub fn drain_reported_errors(&mut self) -> Vec<weir_core::errors::Error> {
        std::mem::take(&mut self.reported)
    }

    /// Ids of nodes currently marked changed. Test and diagnostics surface.
    pub fn changed_nodes(&self) -> Vec<&str> {
        self.changed
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| self.nodes[i].id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records executions and optionally marks an output or fails.
    struct ProbeNode {
        executions: Arc<AtomicUsize>,
        mark: Option<&'static str>,
        fail: bool,
    }

    impl Node for ProbeNode {
        fn execute(&mut self, _state: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
            if self.fail {
                return Err(Error::new(errors::INTERNAL, "probe failure"));
            }
            self.executions.fetch_add(1, Ordering::Relaxed);
            if let Some(param) = self.mark {
                ctx.mark_changed(param);
            }
            Ok(())
        }
    }

    fn probe(mark: Option<&'static str>) -> (Box<ProbeNode>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            Box::new(ProbeNode { executions: count.clone(), mark, fail: false }),
            count,
        )
    }

    #[test]
    fn stratified_cycle_executes_only_marked_downstream() {
        // A (stratum 0) marks out -> B (stratum 1) does not mark -> C
        // (stratum 2) must not run.
        let mut sched = Scheduler::new(State::new(8));
        let (a, a_count) = probe(Some("out"));
        let (b, b_count) = probe(None);
        let (c, c_count) = probe(None);
        sched.register_node("a", a, 0).unwrap();
        sched.register_node("b", b, 1).unwrap();
        sched.register_node("c", c, 2).unwrap();
        sched.register_outgoing_edge("a", "out", "b").unwrap();
        sched.register_outgoing_edge("b", "out", "c").unwrap();

        sched.next().unwrap();
        assert_eq!(a_count.load(Ordering::Relaxed), 1);
        assert_eq!(b_count.load(Ordering::Relaxed), 1);
        assert_eq!(c_count.load(Ordering::Relaxed), 0);
        assert!(sched.changed_nodes().is_empty());
    }

    #[test]
    fn stratum_zero_always_executes() {
        let mut sched = Scheduler::new(State::new(8));
        let (a, a_count) = probe(None);
        let (b, b_count) = probe(None);
        sched.register_node("a", a, 0).unwrap();
        sched.register_node("b", b, 1).unwrap();
        sched.register_outgoing_edge("a", "out", "b").unwrap();
        for _ in 0..3 {
            sched.next().unwrap();
        }
        assert_eq!(a_count.load(Ordering::Relaxed), 3);
        assert_eq!(b_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn only_matching_output_param_propagates() {
        let mut sched = Scheduler::new(State::new(8));
        struct TwoOut {
            hits: Arc<AtomicUsize>,
        }
        impl Node for TwoOut {
            fn execute(&mut self, _s: &mut State, ctx: &mut NodeContext) -> errors::Result<()> {
                self.hits.fetch_add(1, Ordering::Relaxed);
                ctx.mark_changed("aux");
                Ok(())
            }
            fn outputs(&self) -> Vec<String> {
                vec!["out".to_string(), "aux".to_string()]
            }
        }
        let hits = Arc::new(AtomicUsize::new(0));
        sched
            .register_node("src", Box::new(TwoOut { hits }), 0)
            .unwrap();
        let (main_tgt, main_count) = probe(None);
        let (aux_tgt, aux_count) = probe(None);
        sched.register_node("main", main_tgt, 1).unwrap();
        sched.register_node("aux", aux_tgt, 1).unwrap();
        sched.register_outgoing_edge("src", "out", "main").unwrap();
        sched.register_outgoing_edge("src", "aux", "aux").unwrap();
        sched.next().unwrap();
        assert_eq!(main_count.load(Ordering::Relaxed), 0);
        assert_eq!(aux_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut sched = Scheduler::new(State::new(8));
        let (a, _) = probe(None);
        let (b, _) = probe(None);
        sched.register_node("a", a, 0).unwrap();
        let err = sched.register_node("a", b, 0).unwrap_err();
        assert!(err.matches(errors::VALIDATION));
    }

    #[test]
    fn edge_must_descend_strata() {
        let mut sched = Scheduler::new(State::new(8));
        let (a, _) = probe(None);
        let (b, _) = probe(None);
        sched.register_node("a", a, 1).unwrap();
        sched.register_node("b", b, 1).unwrap();
        assert!(sched.register_outgoing_edge("a", "out", "b").is_err());
    }

    #[test]
    fn edges_frozen_after_first_cycle() {
        let mut sched = Scheduler::new(State::new(8));
        let (a, _) = probe(None);
        let (b, _) = probe(None);
        sched.register_node("a", a, 0).unwrap();
        sched.register_node("b", b, 1).unwrap();
        sched.next().unwrap();
        assert!(sched.register_outgoing_edge("a", "out", "b").is_err());
    }

    #[test]
    fn node_error_aborts_cycle_and_preserves_changed() {
        let mut sched = Scheduler::new(State::new(8));
        let (a, _) = probe(Some("out"));
        sched.register_node("a", a, 0).unwrap();
        sched
            .register_node(
                "boom",
                Box::new(ProbeNode {
                    executions: Arc::new(AtomicUsize::new(0)),
                    mark: None,
                    fail: true,
                }),
                1,
            )
            .unwrap();
        let (c, c_count) = probe(None);
        sched.register_node("c", c, 2).unwrap();
        sched.register_outgoing_edge("a", "out", "boom").unwrap();
        sched.register_outgoing_edge("boom", "out", "c").unwrap();

        let err = sched.next().unwrap_err();
        assert!(err.data.contains("node boom"));
        // The changed set survives the abort so the next cycle resumes
        // fairly.
        assert_eq!(sched.changed_nodes(), vec!["boom"]);
        assert_eq!(c_count.load(Ordering::Relaxed), 0);
    }
}
