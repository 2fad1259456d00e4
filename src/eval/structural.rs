//! Sequence, conjunction, disjunction and negation guards.

use crate::bindings::TagBindings;
use crate::error::ExecutionError;
use crate::pattern::{CompiledPattern, NodeId};

use super::{EvalContext, NodeState, Status, Step, Stimulus};

/// One armed position of a sequence, started by a completion of the previous one.
#[derive(Debug)]
struct Stage {
    index: usize,
    state: NodeState,
}

/// `A -> B -> ...`
///
/// Each completion of stage `i` arms its own copy of stage `i + 1` with the
/// bindings of that completion, so `every A -> B` tracks one `B` per `A`.
#[derive(Debug)]
pub(crate) struct SequenceState {
    children: Vec<NodeId>,
    stages: Vec<Stage>,
    emitted: bool,
}

impl SequenceState {
    pub(super) fn start(children: &[NodeId], base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let stages = children
            .first()
            .map(|first| Stage {
                index: 0,
                state: NodeState::start(*first, base, ctx),
            })
            .into_iter()
            .collect();
        Self {
            children: children.to_vec(),
            stages,
            emitted: false,
        }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        for stage in &mut self.stages {
            stage.state.mark(stimulus, pattern)?;
        }
        Ok(())
    }

    pub(super) fn clear_marks(&mut self) {
        for stage in &mut self.stages {
            stage.state.clear_marks();
        }
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        let last = self.children.len().saturating_sub(1);
        let mut matches = Vec::new();
        let mut launched = Vec::new();

        for mut stage in std::mem::take(&mut self.stages) {
            let step = stage.state.resolve(ctx);
            let terminal = step.is_terminal();
            for bindings in step.matches {
                if stage.index == last {
                    matches.push(bindings);
                } else {
                    let next = stage.index + 1;
                    launched.push(Stage {
                        index: next,
                        state: NodeState::start(self.children[next], bindings, ctx),
                    });
                }
            }
            if !terminal {
                self.stages.push(stage);
            }
        }
        self.stages.extend(launched);

        if !matches.is_empty() {
            self.emitted = true;
        }
        if self.stages.is_empty() {
            Step::ended(matches, self.emitted)
        } else {
            Step::active(matches)
        }
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        for mut stage in self.stages.drain(..) {
            stage.state.stop(ctx);
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: Option<NodeState>,
    guard: bool,
    /// The operand has completed at least once.
    satisfied: bool,
    /// Completions kept for joining with later completions of live operands.
    completions: Vec<TagBindings>,
}

/// `A and B and ...`
///
/// Operands run concurrently. `not` operands are guards: they are resolved
/// first, fail the conjunction when they fire, and are torn down once every
/// other operand has completed.
///
/// A completion is retained only while another operand is still live.
#[derive(Debug)]
pub(crate) struct AndState {
    slots: Vec<Slot>,
    emitted: bool,
}

impl AndState {
    pub(super) fn start(children: &[NodeId], base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let pattern = ctx.pattern;
        let slots = children
            .iter()
            .map(|child| Slot {
                state: Some(NodeState::start(*child, base.clone(), ctx)),
                guard: pattern.is_guard(*child),
                satisfied: false,
                completions: Vec::new(),
            })
            .collect();
        Self { slots, emitted: false }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        for state in self.slots.iter_mut().filter_map(|s| s.state.as_mut()) {
            state.mark(stimulus, pattern)?;
        }
        Ok(())
    }

    pub(super) fn clear_marks(&mut self) {
        for state in self.slots.iter_mut().filter_map(|s| s.state.as_mut()) {
            state.clear_marks();
        }
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        for i in 0..self.slots.len() {
            if !self.slots[i].guard {
                continue;
            }
            let Some(state) = self.slots[i].state.as_mut() else {
                continue;
            };
            let step = state.resolve(ctx);
            if step.status == Status::Failed {
                self.slots[i].state = None;
                self.stop(ctx);
                return Step::failed();
            }
        }

        let mut matches = Vec::new();
        for i in 0..self.slots.len() {
            if self.slots[i].guard {
                continue;
            }
            let Some(state) = self.slots[i].state.as_mut() else {
                continue;
            };
            let step = state.resolve(ctx);
            let terminal = step.is_terminal();
            if terminal {
                self.slots[i].state = None;
            }
            for bindings in step.matches {
                if self.others_satisfied(i) {
                    matches.extend(self.combine(i, &bindings));
                }
                self.slots[i].satisfied = true;
                if self.others_live(i) {
                    self.slots[i].completions.push(bindings);
                }
            }
            if terminal && !self.slots[i].satisfied {
                self.stop(ctx);
                return Step::failed();
            }
        }
        self.release_unjoinable();

        if !matches.is_empty() {
            self.emitted = true;
        }

        let has_operand = self.slots.iter().any(|s| !s.guard);
        let operands_done = self.slots.iter().filter(|s| !s.guard).all(|s| s.state.is_none());
        if has_operand && operands_done {
            self.stop(ctx);
            return Step::ended(matches, self.emitted);
        }
        Step::active(matches)
    }

    fn others_satisfied(&self, index: usize) -> bool {
        self.slots
            .iter()
            .enumerate()
            .filter(|(j, s)| *j != index && !s.guard)
            .all(|(_, s)| s.satisfied)
    }

    fn others_live(&self, index: usize) -> bool {
        self.slots
            .iter()
            .enumerate()
            .any(|(j, s)| j != index && !s.guard && s.state.is_some())
    }

    /// Drops stored completions that no live operand can join with anymore.
    fn release_unjoinable(&mut self) {
        for i in 0..self.slots.len() {
            if !self.slots[i].completions.is_empty() && !self.others_live(i) {
                self.slots[i].completions = Vec::new();
            }
        }
    }

    #[cfg(test)]
    pub(super) fn retained_completions(&self) -> usize {
        self.slots.iter().map(|s| s.completions.len()).sum()
    }

    /// Joins `bindings` with every stored completion of the other operands.
    fn combine(&self, index: usize, bindings: &TagBindings) -> Vec<TagBindings> {
        let mut joined = vec![bindings.clone()];
        for (j, slot) in self.slots.iter().enumerate() {
            if j == index || slot.guard {
                continue;
            }
            joined = joined
                .iter()
                .flat_map(|partial| slot.completions.iter().map(move |c| partial.merged(c)))
                .collect();
        }
        joined
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        for slot in &mut self.slots {
            if let Some(mut state) = slot.state.take() {
                state.stop(ctx);
            }
        }
    }
}

/// `A or B or ...`
///
/// The first operand, in declaration order, that terminates with a match wins
/// and tears down the others.
#[derive(Debug)]
pub(crate) struct OrState {
    children: Vec<Option<NodeState>>,
    emitted: bool,
}

impl OrState {
    pub(super) fn start(children: &[NodeId], base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let children = children
            .iter()
            .map(|child| Some(NodeState::start(*child, base.clone(), ctx)))
            .collect();
        Self {
            children,
            emitted: false,
        }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        for state in self.children.iter_mut().flatten() {
            state.mark(stimulus, pattern)?;
        }
        Ok(())
    }

    pub(super) fn clear_marks(&mut self) {
        for state in self.children.iter_mut().flatten() {
            state.clear_marks();
        }
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        let mut matches = Vec::new();
        for i in 0..self.children.len() {
            let Some(state) = self.children[i].as_mut() else {
                continue;
            };
            let step = state.resolve(ctx);
            let terminal = step.is_terminal();
            let won = terminal && !step.matches.is_empty();
            matches.extend(step.matches);
            if terminal {
                self.children[i] = None;
            }
            if won {
                self.stop(ctx);
                return Step::complete(matches);
            }
        }

        if !matches.is_empty() {
            self.emitted = true;
        }
        if self.children.iter().all(Option::is_none) {
            return Step::ended(matches, self.emitted);
        }
        Step::active(matches)
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        for child in &mut self.children {
            if let Some(mut state) = child.take() {
                state.stop(ctx);
            }
        }
    }
}

/// `not X`: fails as soon as `X` matches, never completes on its own.
#[derive(Debug)]
pub(crate) struct NotState {
    child: Option<Box<NodeState>>,
}

impl NotState {
    pub(super) fn start(child: NodeId, base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        Self {
            child: Some(Box::new(NodeState::start(child, base, ctx))),
        }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        match self.child.as_mut() {
            Some(child) => child.mark(stimulus, pattern),
            None => Ok(()),
        }
    }

    pub(super) fn clear_marks(&mut self) {
        if let Some(child) = self.child.as_mut() {
            child.clear_marks();
        }
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        let Some(child) = self.child.as_mut() else {
            return Step::idle();
        };
        let step = child.resolve(ctx);
        if !step.matches.is_empty() {
            if !step.is_terminal() {
                child.stop(ctx);
            }
            self.child = None;
            return Step::failed();
        }
        if step.is_terminal() {
            // X can no longer occur; the guard holds for good.
            self.child = None;
        }
        Step::idle()
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        if let Some(mut child) = self.child.take() {
            child.stop(ctx);
        }
    }
}
