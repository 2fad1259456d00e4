//! Shard worker.
//!
//! Each worker owns a disjoint set of pattern instances and is their single
//! writer. Events, timer firings and control messages for those instances all
//! arrive as messages, so node state is only ever touched on the worker thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::error::CepResult;
use crate::event::EventRef;
use crate::instance::{InstanceId, MatchResult, PatternInstance};
use crate::pattern::CompiledPattern;
use crate::schedule::{FiredTimer, Scheduler};

use super::PredicateErrorPolicy;

#[derive(Debug)]
pub(crate) enum ControlMsg {
    Register {
        instance_id: InstanceId,
        pattern: Arc<CompiledPattern>,
        stream_tx: Sender<MatchResult>,
        reply: Sender<CepResult<()>>,
    },
    Stop {
        instance_id: InstanceId,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct EventMsg {
    pub instance_id: InstanceId,
    pub event: EventRef,
}

/// Shared counters, owned by the runtime and updated by workers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub dropped_matches: AtomicU64,
    pub predicate_failures: AtomicU64,
}

/// Everything a worker needs besides its receivers.
pub(crate) struct WorkerContext {
    pub shard: usize,
    pub scheduler: Arc<dyn Scheduler>,
    pub policy: PredicateErrorPolicy,
    pub counters: Arc<Counters>,
}

struct InstanceEntry {
    instance: PatternInstance,
    tx: Sender<MatchResult>,
}

/// Maps an instance to its owning shard.
pub(crate) fn shard_of(instance_id: InstanceId, shards: usize) -> usize {
    (instance_id.as_uuid().as_u128() % shards.max(1) as u128) as usize
}

pub(crate) fn worker_loop(
    ctx: &WorkerContext,
    control_rx: &Receiver<ControlMsg>,
    event_rx: &Receiver<EventMsg>,
    timer_rx: &Receiver<FiredTimer>,
) {
    let mut instances: HashMap<InstanceId, InstanceEntry> = HashMap::new();
    let mut running = true;

    while running {
        select! {
            recv(control_rx) -> msg => {
                match msg {
                    Ok(ControlMsg::Register { instance_id, pattern, stream_tx, reply }) => {
                        let mut instance = PatternInstance::with_id(instance_id, pattern, Arc::clone(&ctx.scheduler));
                        instance.start();
                        instances.insert(instance_id, InstanceEntry { instance, tx: stream_tx });
                        let _ = reply.send(Ok(()));
                    }
                    Ok(ControlMsg::Stop { instance_id }) => {
                        if let Some(mut entry) = instances.remove(&instance_id) {
                            entry.instance.stop();
                        }
                    }
                    Ok(ControlMsg::Shutdown) | Err(_) => running = false,
                }
            }
            recv(event_rx) -> msg => {
                match msg {
                    Ok(EventMsg { instance_id, event }) => deliver_event(ctx, &mut instances, instance_id, &event),
                    Err(_) => running = false,
                }
            }
            recv(timer_rx) -> msg => {
                match msg {
                    Ok(fired) => {
                        if let Some(entry) = instances.get_mut(&fired.owner) {
                            let results = entry.instance.deliver_timer(fired.token);
                            publish(ctx, entry, results);
                            retire_if_done(&mut instances, fired.owner);
                        }
                    }
                    Err(_) => {
                        warn!(shard = ctx.shard, "timer channel closed");
                        running = false;
                    }
                }
            }
        }
    }

    debug!(shard = ctx.shard, instances = instances.len(), "worker exiting");
    for entry in instances.values_mut() {
        entry.instance.stop();
    }
}

fn deliver_event(
    ctx: &WorkerContext,
    instances: &mut HashMap<InstanceId, InstanceEntry>,
    instance_id: InstanceId,
    event: &EventRef,
) {
    let Some(entry) = instances.get_mut(&instance_id) else {
        trace!(shard = ctx.shard, instance = %instance_id, "event for unknown instance ignored");
        return;
    };
    match entry.instance.deliver(event) {
        Ok(results) => publish(ctx, entry, results),
        Err(err) => {
            ctx.counters.predicate_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                shard = ctx.shard,
                instance = %instance_id,
                error = %err,
                policy = ?ctx.policy,
                "predicate failed during event delivery"
            );
            if ctx.policy == PredicateErrorPolicy::Abort {
                entry.instance.stop();
            }
        }
    }
    retire_if_done(instances, instance_id);
}

/// Never blocks the worker: matches for a slow or gone subscriber are dropped.
fn publish(ctx: &WorkerContext, entry: &InstanceEntry, results: Vec<MatchResult>) {
    for result in results {
        match entry.tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                ctx.counters.dropped_matches.fetch_add(1, Ordering::Relaxed);
                warn!(shard = ctx.shard, instance = %entry.instance.id(), "match dropped");
            }
        }
    }
}

/// Removes a terminated instance; dropping its sender disconnects the stream.
fn retire_if_done(instances: &mut HashMap<InstanceId, InstanceEntry>, instance_id: InstanceId) {
    if instances.get(&instance_id).is_some_and(|e| !e.instance.is_active()) {
        instances.remove(&instance_id);
        debug!(instance = %instance_id, "instance retired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_shard_of_is_stable_and_in_range() {
        let id = InstanceId::from_uuid(Uuid::from_u128(7));
        assert_eq!(shard_of(id, 4), 3);
        assert_eq!(shard_of(id, 4), shard_of(id, 4));
        assert_eq!(shard_of(id, 0), 0);
        for _ in 0..32 {
            assert!(shard_of(InstanceId::new(), 3) < 3);
        }
    }
}
