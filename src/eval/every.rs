use crate::bindings::TagBindings;
use crate::error::ExecutionError;
use crate::pattern::{CompiledPattern, NodeId};

use super::{EvalContext, NodeState, Step, Stimulus};

/// `every X`: re-arms a fresh `X` whenever a running copy terminates.
///
/// Matches of every copy are passed through; the node itself never terminates.
#[derive(Debug)]
pub(crate) struct EveryState {
    child: NodeId,
    base: TagBindings,
    running: Vec<NodeState>,
}

impl EveryState {
    pub(super) fn start(child: NodeId, base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let first = NodeState::start(child, base.clone(), ctx);
        Self {
            child,
            base,
            running: vec![first],
        }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        for state in &mut self.running {
            state.mark(stimulus, pattern)?;
        }
        Ok(())
    }

    pub(super) fn clear_marks(&mut self) {
        for state in &mut self.running {
            state.clear_marks();
        }
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        let mut matches = Vec::new();
        let mut rearm = 0usize;
        for mut state in std::mem::take(&mut self.running) {
            let step = state.resolve(ctx);
            if step.is_terminal() {
                rearm += 1;
            } else {
                self.running.push(state);
            }
            matches.extend(step.matches);
        }
        for _ in 0..rearm {
            self.running.push(NodeState::start(self.child, self.base.clone(), ctx));
        }
        Step::active(matches)
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        for mut state in self.running.drain(..) {
            state.stop(ctx);
        }
    }
}
