//! Node runtime states and the propagation pass.
//!
//! Every live position of a pattern instance is one [`NodeState`]. A pass over
//! the tree runs in two phases:
//!
//! 1. `mark`: every armed leaf is tested against the stimulus and records a
//!    hit. Nothing completes yet, so siblings see one consistent snapshot.
//! 2. `resolve`: structural and quantifier nodes consume the recorded hits
//!    bottom-up and report a [`Step`] to their parent.
//!
//! Nodes created during `resolve` were not marked, so the stimulus that armed
//! them is never counted twice. Starting a node never completes it: each leaf
//! waits for a stimulus of its own.
//!
//! A node that reports a terminal status has already released its subtree.
//! A parent that discards a still-active child must call `stop` on it.

mod every;
mod leaf;
mod repeat;
mod structural;

use std::collections::HashSet;

use crate::bindings::TagBindings;
use crate::error::ExecutionError;
use crate::event::EventRef;
use crate::instance::InstanceId;
use crate::pattern::{CompiledPattern, NodeId, NodeKind};
use crate::schedule::{Scheduler, TimerToken};

use every::EveryState;
use leaf::{FilterState, TimerState};
use repeat::RepeatState;
use structural::{AndState, NotState, OrState, SequenceState};

/// What drives one propagation pass.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Stimulus<'a> {
    Event(&'a EventRef),
    Timer(TimerToken),
}

/// Outcome of a node after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Still armed.
    Active,
    /// Terminated after producing at least one match.
    Complete,
    /// Terminated without ever matching.
    Failed,
}

/// Matches produced in one pass plus the node's status afterwards.
#[derive(Debug)]
pub(crate) struct Step {
    pub(crate) matches: Vec<TagBindings>,
    pub(crate) status: Status,
}

impl Step {
    pub(crate) const fn active(matches: Vec<TagBindings>) -> Self {
        Self {
            matches,
            status: Status::Active,
        }
    }

    pub(crate) const fn idle() -> Self {
        Self::active(Vec::new())
    }

    pub(crate) const fn complete(matches: Vec<TagBindings>) -> Self {
        Self {
            matches,
            status: Status::Complete,
        }
    }

    pub(crate) const fn failed() -> Self {
        Self {
            matches: Vec::new(),
            status: Status::Failed,
        }
    }

    /// Terminal step; `Complete` if the node matched in this or any earlier pass.
    pub(crate) const fn ended(matches: Vec<TagBindings>, ever_matched: bool) -> Self {
        Self {
            matches,
            status: if ever_matched { Status::Complete } else { Status::Failed },
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status != Status::Active
    }
}

/// Per-pass access to the instance's shared resources.
pub(crate) struct EvalContext<'a> {
    pub(crate) pattern: &'a CompiledPattern,
    pub(crate) scheduler: &'a dyn Scheduler,
    pub(crate) owner: InstanceId,
    /// Outstanding timer tokens of the instance.
    pub(crate) timers: &'a mut HashSet<TimerToken>,
}

/// Runtime state of one live tree position.
#[derive(Debug)]
pub(crate) enum NodeState {
    Filter(FilterState),
    Timer(TimerState),
    Sequence(SequenceState),
    And(AndState),
    Or(OrState),
    Not(NotState),
    Repeat(RepeatState),
    Every(EveryState),
}

impl NodeState {
    /// Arms node `id` with the bindings accumulated so far.
    pub(crate) fn start(id: NodeId, base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let pattern = ctx.pattern;
        match pattern.kind(id) {
            NodeKind::Filter { .. } => Self::Filter(FilterState::new(id, base)),
            NodeKind::Timer { interval } => Self::Timer(TimerState::start(*interval, base, ctx)),
            NodeKind::Sequence(children) => Self::Sequence(SequenceState::start(children, base, ctx)),
            NodeKind::And(children) => Self::And(AndState::start(children, base, ctx)),
            NodeKind::Or(children) => Self::Or(OrState::start(children, base, ctx)),
            NodeKind::Not(child) => Self::Not(NotState::start(*child, base, ctx)),
            NodeKind::Repeat(spec) => Self::Repeat(RepeatState::start(id, spec, base, ctx)),
            NodeKind::Every(child) => Self::Every(EveryState::start(*child, base, ctx)),
        }
    }

    /// Records leaf hits for `stimulus` without completing anything.
    ///
    /// # Errors
    ///
    /// Returns the first predicate failure. Hits recorded before the failure
    /// stay in place; call [`NodeState::clear_marks`] to discard them.
    pub(crate) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        match self {
            Self::Filter(s) => s.mark(stimulus, pattern),
            Self::Timer(s) => {
                s.mark(stimulus);
                Ok(())
            }
            Self::Sequence(s) => s.mark(stimulus, pattern),
            Self::And(s) => s.mark(stimulus, pattern),
            Self::Or(s) => s.mark(stimulus, pattern),
            Self::Not(s) => s.mark(stimulus, pattern),
            Self::Repeat(s) => s.mark(stimulus, pattern),
            Self::Every(s) => s.mark(stimulus, pattern),
        }
    }

    /// Drops every hit recorded by an aborted marking pass.
    pub(crate) fn clear_marks(&mut self) {
        match self {
            Self::Filter(s) => s.clear_marks(),
            Self::Timer(s) => s.clear_marks(),
            Self::Sequence(s) => s.clear_marks(),
            Self::And(s) => s.clear_marks(),
            Self::Or(s) => s.clear_marks(),
            Self::Not(s) => s.clear_marks(),
            Self::Repeat(s) => s.clear_marks(),
            Self::Every(s) => s.clear_marks(),
        }
    }

    /// Consumes the recorded hits and reports the node's outcome.
    pub(crate) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        match self {
            Self::Filter(s) => s.resolve(),
            Self::Timer(s) => s.resolve(ctx),
            Self::Sequence(s) => s.resolve(ctx),
            Self::And(s) => s.resolve(ctx),
            Self::Or(s) => s.resolve(ctx),
            Self::Not(s) => s.resolve(ctx),
            Self::Repeat(s) => s.resolve(ctx),
            Self::Every(s) => s.resolve(ctx),
        }
    }

    /// Tears down the subtree and cancels its timers. Idempotent.
    pub(crate) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        match self {
            Self::Filter(_) => {}
            Self::Timer(s) => s.stop(ctx),
            Self::Sequence(s) => s.stop(ctx),
            Self::And(s) => s.stop(ctx),
            Self::Or(s) => s.stop(ctx),
            Self::Not(s) => s.stop(ctx),
            Self::Repeat(s) => s.stop(ctx),
            Self::Every(s) => s.stop(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::pattern::PatternNode;
    use crate::schedule::ManualScheduler;

    /// Minimal single-instance driver over a bare node state.
    struct Harness {
        pattern: std::sync::Arc<CompiledPattern>,
        scheduler: ManualScheduler,
        owner: InstanceId,
        timers: HashSet<TimerToken>,
        root: Option<NodeState>,
    }

    impl Harness {
        fn new(node: &PatternNode) -> Self {
            let pattern = node.compile().unwrap();
            let mut h = Self {
                pattern,
                scheduler: ManualScheduler::default(),
                owner: InstanceId::new(),
                timers: HashSet::new(),
                root: None,
            };
            let mut ctx = EvalContext {
                pattern: &h.pattern,
                scheduler: &h.scheduler,
                owner: h.owner,
                timers: &mut h.timers,
            };
            h.root = Some(NodeState::start(h.pattern.root(), TagBindings::new(), &mut ctx));
            h
        }

        fn send(&mut self, event_type: &str, id: &str) -> Step {
            let event = Event::new(event_type).with("id", id).into_ref();
            let root = self.root.as_mut().unwrap();
            root.mark(Stimulus::Event(&event), &self.pattern).unwrap();
            let mut ctx = EvalContext {
                pattern: &self.pattern,
                scheduler: &self.scheduler,
                owner: self.owner,
                timers: &mut self.timers,
            };
            root.resolve(&mut ctx)
        }
    }

    fn ids(bindings: &TagBindings, tag: &str) -> Vec<String> {
        bindings
            .array(tag)
            .unwrap_or_default()
            .iter()
            .map(|e| e.get("id").unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_filter_completes_once() {
        let mut h = Harness::new(&PatternNode::tagged("a", "A"));
        assert_eq!(h.send("B", "B1").status, Status::Active);
        let step = h.send("A", "A1");
        assert_eq!(step.status, Status::Complete);
        assert_eq!(step.matches.len(), 1);
        assert!(step.matches[0].event("a").is_some());
    }

    #[test]
    fn test_sequence_right_not_armed_by_left_event() {
        let mut h = Harness::new(&PatternNode::seq([PatternNode::tagged("x", "A"), PatternNode::tagged("y", "A")]));
        assert_eq!(h.send("A", "A1").status, Status::Active);
        let step = h.send("A", "A2");
        assert_eq!(step.status, Status::Complete);
        let m = &step.matches[0];
        assert_eq!(m.event("x").unwrap().get("id").unwrap().to_string(), "'A1'");
        assert_eq!(m.event("y").unwrap().get("id").unwrap().to_string(), "'A2'");
    }

    #[test]
    fn test_or_first_declared_wins() {
        let mut h = Harness::new(&PatternNode::or([PatternNode::tagged("a", "A"), PatternNode::tagged("b", "A")]));
        let step = h.send("A", "A1");
        assert_eq!(step.status, Status::Complete);
        assert_eq!(step.matches.len(), 1);
        assert!(step.matches[0].contains("a"));
        assert!(!step.matches[0].contains("b"));
    }

    #[test]
    fn test_and_guard_fires_first() {
        let node = PatternNode::and([PatternNode::tagged("a", "A"), PatternNode::not(PatternNode::filter("A"))]);
        let mut h = Harness::new(&node);
        assert_eq!(h.send("A", "A1").status, Status::Failed);
    }

    #[test]
    fn test_and_quits_guards_when_operands_done() {
        let node = PatternNode::and([
            PatternNode::tagged("a", "A"),
            PatternNode::tagged("c", "C"),
            PatternNode::not(PatternNode::filter("B")),
        ]);
        let mut h = Harness::new(&node);
        assert_eq!(h.send("C", "C1").status, Status::Active);
        let step = h.send("A", "A1");
        assert_eq!(step.status, Status::Complete);
        assert!(step.matches[0].contains("a"));
        assert!(step.matches[0].contains("c"));
    }

    #[test]
    fn test_and_drops_completions_nobody_can_join() {
        let node = PatternNode::and([
            PatternNode::every(PatternNode::tagged("a", "A")),
            PatternNode::tagged("b", "B"),
        ]);
        let mut h = Harness::new(&node);
        h.send("A", "A0");
        assert_eq!(h.send("B", "B1").matches.len(), 1);

        for i in 1..=1000 {
            let step = h.send("A", &format!("A{i}"));
            assert_eq!(step.status, Status::Active);
            assert_eq!(step.matches.len(), 1);
        }
        let Some(NodeState::And(state)) = h.root.as_ref() else {
            panic!("expected and");
        };
        // b=B is done; only its own completion is still needed.
        assert_eq!(state.retained_completions(), 1);
    }

    #[test]
    fn test_until_wins_same_event() {
        let node = PatternNode::repeat(crate::pattern::RepeatBounds::at_least(2), PatternNode::tagged("b", "B"))
            .until(PatternNode::tagged("e", "B"));
        let mut h = Harness::new(&node);
        assert_eq!(h.send("B", "B1").status, Status::Failed);
    }

    #[test]
    fn test_plain_until_collects_array() {
        let node = PatternNode::tagged("a", "A").until(PatternNode::filter("D"));
        let mut h = Harness::new(&node);
        h.send("A", "A1");
        h.send("A", "A2");
        let step = h.send("D", "D1");
        assert_eq!(step.status, Status::Complete);
        assert_eq!(ids(&step.matches[0], "a"), vec!["'A1'", "'A2'"]);
    }

    #[test]
    fn test_every_rearms() {
        let mut h = Harness::new(&PatternNode::every(PatternNode::tagged("a", "A")));
        for i in 0..3 {
            let step = h.send("A", &format!("A{i}"));
            assert_eq!(step.status, Status::Active);
            assert_eq!(step.matches.len(), 1);
        }
    }

    #[test]
    fn test_not_never_completes() {
        let mut h = Harness::new(&PatternNode::not(PatternNode::filter("A")));
        assert_eq!(h.send("B", "B1").status, Status::Active);
        assert_eq!(h.send("A", "A1").status, Status::Failed);
    }
}
