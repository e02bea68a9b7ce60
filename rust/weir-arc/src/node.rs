//! The node execution contract.

use weir_core::errors::{self, Error};

use crate::state::State;

/// Execution context handed to a node for one cycle.
///
/// Marking an output changed schedules every downstream node wired to that
/// output for execution later in the same cycle.
pub struct NodeContext<'a> {
    output_params: &'a [String],
    marked: &'a mut Vec<usize>,
    reported: &'a mut Vec<Error>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        output_params: &'a [String],
        marked: &'a mut Vec<usize>,
        reported: &'a mut Vec<Error>,
    ) -> Self {
        Self { output_params, marked, reported }
    }

    /// Marks one of this node's output parameters as changed.
    /// Unknown parameter names are ignored.
    pub fn mark_changed(&mut self, output_param: &str) {
        if let Some(idx) = self.output_params.iter().position(|p| p == output_param) {
            if !self.marked.contains(&idx) {
                self.marked.push(idx);
            }
        }
    }

    /// Records a non-fatal error without aborting the cycle. The host task
    /// drains reported errors after each cycle and surfaces them as
    /// warnings. Returning `Err` from `execute` remains the fatal path.
    pub fn report_error(&mut self, err: Error) {
        self.reported.push(err);
    }
}

/// An executable unit in the reactive graph.
///
/// `execute` runs on the scheduler thread and must be RT-safe: no
/// allocation, no blocking.
pub trait Node: Send {
    fn execute(&mut self, state: &mut State, ctx: &mut NodeContext) -> errors::Result<()>;

    /// The node's output parameter names. Defaults to a single `out`.
    fn outputs(&self) -> Vec<String> {
        vec!["out".to_string()]
    }
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}
