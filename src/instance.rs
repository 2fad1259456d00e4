//! Pattern instance coordinator.
//!
//! A `PatternInstance` owns one live evaluation tree of a compiled pattern
//! together with the timer tokens the tree has outstanding. It is
//! single-writer: callers serialize `deliver`, `deliver_timer` and `stop`
//! for one instance, while distinct instances may run on distinct threads.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::bindings::{Binding, TagBindings};
use crate::error::CepResult;
use crate::eval::{EvalContext, NodeState, Stimulus};
use crate::event::EventRef;
use crate::pattern::CompiledPattern;
use crate::schedule::{Scheduler, TimerToken};

/// Unique identifier for a pattern instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Creates a new random instance ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The wrapped UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A completed match of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// The instance that produced the match.
    pub instance_id: InstanceId,
    /// Final tag bindings.
    pub bindings: TagBindings,
    /// Scheduler time at which the match completed.
    pub matched_at: DateTime<Utc>,
}

impl MatchResult {
    /// Looks up a tag.
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&Binding> {
        self.bindings.get(tag)
    }
}

/// One live evaluation of a compiled pattern.
pub struct PatternInstance {
    id: InstanceId,
    pattern: Arc<CompiledPattern>,
    scheduler: Arc<dyn Scheduler>,
    root: Option<NodeState>,
    timers: HashSet<TimerToken>,
    started: bool,
}

impl fmt::Debug for PatternInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternInstance")
            .field("id", &self.id)
            .field("pattern", &self.pattern.expression())
            .field("active", &self.root.is_some())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl PatternInstance {
    /// Creates an unstarted instance with a fresh ID.
    #[must_use]
    pub fn new(pattern: Arc<CompiledPattern>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_id(InstanceId::new(), pattern, scheduler)
    }

    /// Creates an unstarted instance with a caller-chosen ID.
    #[must_use]
    pub fn with_id(id: InstanceId, pattern: Arc<CompiledPattern>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            id,
            pattern,
            scheduler,
            root: None,
            timers: HashSet::new(),
            started: false,
        }
    }

    /// The instance ID.
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    /// The compiled pattern this instance evaluates.
    #[must_use]
    pub fn pattern(&self) -> &Arc<CompiledPattern> {
        &self.pattern
    }

    /// Arms the root node. Only the first call has an effect.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let mut ctx = EvalContext {
            pattern: &self.pattern,
            scheduler: self.scheduler.as_ref(),
            owner: self.id,
            timers: &mut self.timers,
        };
        self.root = Some(NodeState::start(self.pattern.root(), TagBindings::new(), &mut ctx));
        debug!(instance = %self.id, pattern = %self.pattern, "instance started");
    }

    /// Returns true while the root can still produce matches.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.root.is_some()
    }

    /// Number of timer tokens the tree still holds.
    #[must_use]
    pub fn outstanding_timers(&self) -> usize {
        self.timers.len()
    }

    /// Runs one propagation pass for `event`.
    ///
    /// Delivering to an unstarted or terminated instance is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Predicate` if a filter predicate fails. The pass
    /// is abandoned and the tree is left as it was before the event; the caller
    /// decides whether to keep or stop the instance.
    pub fn deliver(&mut self, event: &EventRef) -> CepResult<Vec<MatchResult>> {
        let Some(root) = self.root.as_mut() else {
            return Ok(Vec::new());
        };
        if let Err(err) = root.mark(Stimulus::Event(event), &self.pattern) {
            root.clear_marks();
            return Err(err.into());
        }
        trace!(instance = %self.id, event_type = %event.event_type, "event pass");
        Ok(self.resolve_pass())
    }

    /// Runs one propagation pass for a timer firing.
    ///
    /// Tokens this instance does not hold (cancelled, already fired, or from
    /// another instance) are ignored.
    pub fn deliver_timer(&mut self, token: TimerToken) -> Vec<MatchResult> {
        if !self.timers.contains(&token) {
            trace!(instance = %self.id, token = %token, "stale timer ignored");
            return Vec::new();
        }
        let Some(root) = self.root.as_mut() else {
            return Vec::new();
        };
        if root.mark(Stimulus::Timer(token), &self.pattern).is_err() {
            root.clear_marks();
            return Vec::new();
        }
        trace!(instance = %self.id, token = %token, "timer pass");
        self.resolve_pass()
    }

    fn resolve_pass(&mut self) -> Vec<MatchResult> {
        let Some(root) = self.root.as_mut() else {
            return Vec::new();
        };
        let mut ctx = EvalContext {
            pattern: &self.pattern,
            scheduler: self.scheduler.as_ref(),
            owner: self.id,
            timers: &mut self.timers,
        };
        let step = root.resolve(&mut ctx);
        let terminal = step.is_terminal();

        let matched_at = self.scheduler.now();
        let results = step
            .matches
            .into_iter()
            .map(|bindings| MatchResult {
                instance_id: self.id,
                bindings,
                matched_at,
            })
            .collect();

        if terminal {
            self.root = None;
            self.release_timers();
            debug!(instance = %self.id, status = ?step.status, "instance terminated");
        }
        results
    }

    /// Tears down the tree and cancels every outstanding timer. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut root) = self.root.take() {
            let mut ctx = EvalContext {
                pattern: &self.pattern,
                scheduler: self.scheduler.as_ref(),
                owner: self.id,
                timers: &mut self.timers,
            };
            root.stop(&mut ctx);
            debug!(instance = %self.id, "instance stopped");
        }
        self.release_timers();
    }

    fn release_timers(&mut self) {
        for token in self.timers.drain() {
            self.scheduler.cancel(token);
        }
    }
}

impl Drop for PatternInstance {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::pattern::PatternNode;
    use crate::predicate::PropertyMatches;
    use crate::schedule::ManualScheduler;

    fn instance(node: &PatternNode) -> (PatternInstance, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::default());
        let mut inst = PatternInstance::new(node.compile().unwrap(), scheduler.clone());
        inst.start();
        (inst, scheduler)
    }

    #[test]
    fn test_unstarted_instance_is_inert() {
        let scheduler = Arc::new(ManualScheduler::default());
        let mut inst = PatternInstance::new(PatternNode::filter("A").compile().unwrap(), scheduler);
        assert!(!inst.is_active());
        assert!(inst.deliver(&Event::new("A").into_ref()).unwrap().is_empty());
    }

    #[test]
    fn test_root_completion_terminates() {
        let (mut inst, _) = instance(&PatternNode::tagged("a", "A"));
        let a1 = Event::new("A").into_ref();
        let out = inst.deliver(&a1).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].instance_id, inst.id());
        assert!(Arc::ptr_eq(out[0].bindings.event("a").unwrap(), &a1));
        assert!(!inst.is_active());

        // same event again on a terminated instance
        assert!(inst.deliver(&a1).unwrap().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent_and_cancels_timers() {
        let node = PatternNode::and([
            PatternNode::timer(chrono::Duration::seconds(5)),
            PatternNode::not(PatternNode::filter("B")),
        ]);
        let (mut inst, scheduler) = instance(&node);
        assert_eq!(inst.outstanding_timers(), 1);
        assert_eq!(scheduler.pending(), 1);

        inst.stop();
        inst.stop();
        assert!(!inst.is_active());
        assert_eq!(inst.outstanding_timers(), 0);
        assert_eq!(scheduler.pending(), 0);
        assert!(inst.deliver(&Event::new("B").into_ref()).unwrap().is_empty());
    }

    #[test]
    fn test_stale_timer_ignored() {
        let (mut inst, _) = instance(&PatternNode::timer(chrono::Duration::seconds(1)));
        assert!(inst.deliver_timer(TimerToken::from_raw(999)).is_empty());
        assert!(inst.is_active());
    }

    #[test]
    fn test_predicate_error_leaves_tree_untouched() {
        let node: PatternNode = crate::pattern::FilterSpec::new("A")
            .tag("a")
            .predicate(PropertyMatches::new("name", "^x").unwrap())
            .into();
        let (mut inst, _) = instance(&PatternNode::or([node, PatternNode::tagged("b", "A")]));

        let err = inst.deliver(&Event::new("A").with("name", 3).into_ref()).unwrap_err();
        assert!(err.is_execution());
        assert!(inst.is_active());

        let out = inst.deliver(&Event::new("A").with("name", "y").into_ref()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].bindings.contains("b"));
    }

    #[test]
    fn test_drop_cancels_timers() {
        let scheduler = Arc::new(ManualScheduler::default());
        {
            let mut inst = PatternInstance::new(
                PatternNode::timer(chrono::Duration::seconds(3)).compile().unwrap(),
                scheduler.clone(),
            );
            inst.start();
            assert_eq!(scheduler.pending(), 1);
        }
        assert_eq!(scheduler.pending(), 0);
    }
}
