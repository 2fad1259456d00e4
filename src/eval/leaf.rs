//! Filter and timer leaves.

use chrono::Duration;
use tracing::{debug, trace};

use crate::bindings::TagBindings;
use crate::error::ExecutionError;
use crate::pattern::{CompiledPattern, NodeId, NodeKind};
use crate::schedule::TimerToken;

use super::{EvalContext, Step, Stimulus};

/// An armed filter. Completes on the first accepted event.
#[derive(Debug)]
pub(crate) struct FilterState {
    node: NodeId,
    base: TagBindings,
    hit: Option<TagBindings>,
}

impl FilterState {
    pub(super) const fn new(node: NodeId, base: TagBindings) -> Self {
        Self { node, base, hit: None }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>, pattern: &CompiledPattern) -> Result<(), ExecutionError> {
        let Stimulus::Event(event) = stimulus else {
            return Ok(());
        };
        let NodeKind::Filter {
            event_type,
            tag,
            predicate,
        } = pattern.kind(self.node)
        else {
            return Ok(());
        };
        if event.event_type != *event_type {
            return Ok(());
        }

        if let Some(predicate) = predicate {
            let accepted = predicate
                .evaluate(event, &self.base)
                .map_err(|source| ExecutionError::Predicate {
                    event_type: event_type.clone(),
                    source,
                })?;
            if !accepted {
                return Ok(());
            }
        }

        self.hit = Some(match tag {
            Some(tag) => self.base.with_event(tag, std::sync::Arc::clone(event)),
            None => self.base.clone(),
        });
        Ok(())
    }

    pub(super) fn clear_marks(&mut self) {
        self.hit = None;
    }

    pub(super) fn resolve(&mut self) -> Step {
        match self.hit.take() {
            Some(bindings) => Step::complete(vec![bindings]),
            None => Step::idle(),
        }
    }
}

/// A pending `timer:interval`. Completes when its own token fires.
#[derive(Debug)]
pub(crate) struct TimerState {
    token: Option<TimerToken>,
    base: TagBindings,
    fired: bool,
}

impl TimerState {
    pub(super) fn start(interval: Duration, base: TagBindings, ctx: &mut EvalContext<'_>) -> Self {
        let at = ctx.scheduler.now() + interval;
        let token = ctx.scheduler.schedule_at(at, ctx.owner);
        ctx.timers.insert(token);
        debug!(instance = %ctx.owner, token = %token, at = %at, "timer scheduled");
        Self {
            token: Some(token),
            base,
            fired: false,
        }
    }

    pub(super) fn mark(&mut self, stimulus: Stimulus<'_>) {
        if let Stimulus::Timer(fired) = stimulus {
            if self.token == Some(fired) {
                self.fired = true;
            }
        }
    }

    pub(super) fn clear_marks(&mut self) {
        self.fired = false;
    }

    pub(super) fn resolve(&mut self, ctx: &mut EvalContext<'_>) -> Step {
        if !self.fired {
            return Step::idle();
        }
        if let Some(token) = self.token.take() {
            ctx.timers.remove(&token);
            trace!(instance = %ctx.owner, token = %token, "timer fired");
        }
        Step::complete(vec![self.base.clone()])
    }

    pub(super) fn stop(&mut self, ctx: &mut EvalContext<'_>) {
        if let Some(token) = self.token.take() {
            ctx.scheduler.cancel(token);
            ctx.timers.remove(&token);
            debug!(instance = %ctx.owner, token = %token, "timer cancelled");
        }
    }
}
