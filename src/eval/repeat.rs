//! Bounded repetition with an optional until clause.
//!
//! Per pass, the until clause is resolved before the running iteration. When it
//! matches, the event is consumed by until alone: the running iteration is
//! discarded uncounted and the repeat finishes, successfully only if enough
//! iterations completed before that event. Otherwise a completed iteration is
//! appended, and the repeat either finishes at its upper bound or re-arms a
//! fresh iteration.
//!
//! Expression bounds are read once, when the repeat is armed. Bounds that are
//! out of range or non-numeric at that point leave the repeat unarmed, and it
//! reports failure on the next pass.
//!
//! Tags bound inside the repeated sub-expression are published as arrays in
//! iteration order. Iterations that did not bind a tag leave no entry, and
//! arrays produced by nested repeats are flattened into the outer one.

use tracing::{trace, warn};

use crate::bindings::TagBindings;
use crate::error::ExecutionError;
use crate::pattern::{CompiledPattern, NodeId, NodeKind, RepeatSpec};

use super::{EvalContext, NodeState, Step, Stimulus};

#[derive(Debug)]
pub(crate) struct RepeatState {
    node: NodeId,
    base: TagBindings,
    min: u32,
    max: Option<u32>,
    count: u32,
    collected: Vec<TagBindings>,
    iteration: Option<Box<NodeState>>,
    until: Option<Box<NodeState>>,
}

impl RepeatState {
    pub(super) fn start(node: NodeId, spec: &RepeatSpec, base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let mut state = Self {
            node,
            base,
            min: 0,
            max: None,
            count: 0,
            collected: Vec::new(),
            iteration: None,
            until: None,
        };
        match spec.bounds.resolve(&state.base) {
            Ok((min, max)) => {
                state.min = min;
                state.max = max;
            }
            Err(err) => {
                warn!(instance = %ctx.owner, error = %err, "repeat bounds rejected when armed");
                return state;
            }
        }
        state.until = spec
            .until
            .map(|until| Box::new(NodeState::start(until, state.base.clone(), ctx)));
        state.iteration = Some(Box::new(NodeState::start(spec.child, state.base.clone(), ctx)));
        state
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        if let Some(until) = self.until.as_mut() {
            until.mark(stimulus, pattern)?;
        }
        if let Some(iteration) = self.iteration.as_mut() {
            iteration.mark(stimulus, pattern)?;
        }
        Ok(())
    }

    pub(super) fn clear_marks(&mut self) {
        if let Some(until) = self.until.as_mut() {
            until.clear_marks();
        }
        if let Some(iteration) = self.iteration.as_mut() {
            iteration.clear_marks();
        }
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        let pattern = ctx.pattern;
        let NodeKind::Repeat(spec) = pattern.kind(self.node) else {
            self.stop(ctx);
            return Step::failed();
        };

        if let Some(until) = self.until.as_mut() {
            let step = until.resolve(ctx);
            if !step.matches.is_empty() {
                if !step.is_terminal() {
                    until.stop(ctx);
                }
                self.until = None;
                self.stop(ctx);
                if self.count < self.min {
                    trace!(count = self.count, min = self.min, "until closed below lower bound");
                    return Step::failed();
                }
                let matches = step.matches.iter().map(|u| self.assemble(spec, u)).collect();
                return Step::complete(matches);
            }
            if step.is_terminal() {
                self.until = None;
                if self.max.is_none() {
                    trace!(count = self.count, "until can no longer close an unbounded repeat");
                    self.stop(ctx);
                    return Step::failed();
                }
            }
        }

        let Some(iteration) = self.iteration.as_mut() else {
            return Step::failed();
        };
        let step = iteration.resolve(ctx);
        let terminal = step.is_terminal();
        let Some(first) = step.matches.into_iter().next() else {
            if terminal {
                self.iteration = None;
                self.stop(ctx);
                return Step::failed();
            }
            return Step::idle();
        };

        if !terminal {
            iteration.stop(ctx);
        }
        self.iteration = None;
        self.collected.push(first);
        self.count += 1;

        if self.max == Some(self.count) {
            self.stop(ctx);
            return Step::complete(vec![self.assemble(spec, &self.base)]);
        }
        self.iteration = Some(Box::new(NodeState::start(spec.child, self.base.clone(), ctx)));
        Step::idle()
    }

    /// Publishes the collected iterations on top of `seed`.
    fn assemble(&self, spec: &RepeatSpec, seed: &TagBindings) -> TagBindings {
        let mut out = seed.clone();
        for tag in &spec.tags {
            let mut events = Vec::new();
            for iteration in &self.collected {
                if let Some(binding) = iteration.get(tag) {
                    binding.extend_into(&mut events);
                }
            }
            if !events.is_empty() {
                out = out.with_array(tag, events);
            }
        }
        out
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        if let Some(mut until) = self.until.take() {
            until.stop(ctx);
        }
        if let Some(mut iteration) = self.iteration.take() {
            iteration.stop(ctx);
        }
    }
}
