//! Threaded runtime for pattern instances.
//!
//! `PatternInstance` is single-writer and synchronous. This module hosts many
//! of them on a small pool of shard workers: every instance belongs to exactly
//! one shard, and all events, timer firings and control messages for it are
//! serialized through that shard's channels. Event delivery never blocks the
//! caller; a full queue is reported as `ExecutionError::QueueFull`.

/// Shard worker loop and its messages.
pub mod dispatcher;
/// Subscriber stream handle.
pub mod stream;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CepError, CepResult, ExecutionError};
use crate::event::EventRef;
use crate::instance::{InstanceId, MatchResult};
use crate::pattern::CompiledPattern;
use crate::schedule::{FiredTimer, Scheduler, ThreadScheduler};

use dispatcher::{shard_of, worker_loop, ControlMsg, Counters, EventMsg, WorkerContext};
pub use stream::MatchStream;

/// What a worker does with an instance whose predicate failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateErrorPolicy {
    /// Log, count, drop the event for that instance and keep it running.
    #[default]
    Skip,
    /// Log, count and stop the instance.
    Abort,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of shard workers.
    pub worker_threads: usize,
    /// Max queued events per shard before backpressure applies.
    pub event_queue_capacity: usize,
    /// Max queued control messages (register/stop) per shard.
    pub control_queue_capacity: usize,
    /// Per-instance match stream buffer capacity.
    pub match_stream_capacity: usize,
    /// Handling of predicate failures.
    pub on_predicate_error: PredicateErrorPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            event_queue_capacity: 4096,
            control_queue_capacity: 1024,
            match_stream_capacity: 1024,
            on_predicate_error: PredicateErrorPolicy::Skip,
        }
    }
}

/// A registered instance and the stream of its matches.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct InstanceRegistration {
    pub instance_id: InstanceId,
    pub stream: MatchStream,
}

struct Shard {
    control_tx: Sender<ControlMsg>,
    event_tx: Sender<EventMsg>,
    join: Option<JoinHandle<()>>,
}

/// Sharded host for pattern instances.
pub struct PatternRuntime {
    cfg: RuntimeConfig,
    shards: Vec<Shard>,
    scheduler: Arc<ThreadScheduler>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for PatternRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRuntime")
            .field("cfg", &self.cfg)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl PatternRuntime {
    /// Starts the shard workers and the timer thread.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::WorkerSpawn` if a thread cannot be started.
    pub fn new(cfg: RuntimeConfig) -> CepResult<Self> {
        let workers = cfg.worker_threads.max(1);
        let event_queue_capacity = cfg.event_queue_capacity.max(1);
        let control_queue_capacity = cfg.control_queue_capacity.max(1);

        let mut timer_txs = Vec::with_capacity(workers);
        let mut timer_rxs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = unbounded::<FiredTimer>();
            timer_txs.push(tx);
            timer_rxs.push(rx);
        }

        // Firings are routed to the owning shard; the timer thread never
        // touches instance state.
        let scheduler = Arc::new(ThreadScheduler::new(move |fired: FiredTimer| {
            let shard = shard_of(fired.owner, timer_txs.len());
            if let Some(tx) = timer_txs.get(shard) {
                if tx.send(fired).is_err() {
                    debug!(token = %fired.token, "timer fired after shard exit");
                }
            }
        })?);

        let counters = Arc::new(Counters::default());
        let mut runtime = Self {
            cfg,
            shards: Vec::with_capacity(workers),
            scheduler,
            counters,
        };

        for (idx, timer_rx) in timer_rxs.into_iter().enumerate() {
            let (control_tx, control_rx) = bounded::<ControlMsg>(control_queue_capacity);
            let (event_tx, event_rx) = bounded::<EventMsg>(event_queue_capacity);
            let ctx = WorkerContext {
                shard: idx,
                scheduler: Arc::clone(&runtime.scheduler) as Arc<dyn Scheduler>,
                policy: runtime.cfg.on_predicate_error,
                counters: Arc::clone(&runtime.counters),
            };
            let name = format!("kyrocep-worker-{idx}");
            let join = spawn_worker(&name, ctx, control_rx, event_rx, timer_rx)?;
            runtime.shards.push(Shard {
                control_tx,
                event_tx,
                join: Some(join),
            });
        }

        info!(workers, event_queue_capacity, "pattern runtime started");
        Ok(runtime)
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    fn shard(&self, instance_id: InstanceId) -> CepResult<&Shard> {
        self.shards
            .get(shard_of(instance_id, self.shards.len()))
            .ok_or_else(|| CepError::internal("runtime has no workers"))
    }

    /// Creates and starts an instance of `pattern` on its owning worker.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` if the worker has exited.
    pub fn register(&self, pattern: Arc<CompiledPattern>) -> CepResult<InstanceRegistration> {
        let instance_id = InstanceId::new();
        let shard = self.shard(instance_id)?;

        let (stream_tx, stream_rx) = bounded::<MatchResult>(self.cfg.match_stream_capacity.max(1));
        let stream = MatchStream::new(instance_id, stream_rx, shard.control_tx.clone());

        let (reply_tx, reply_rx) = bounded::<CepResult<()>>(1);
        shard
            .control_tx
            .send(ControlMsg::Register {
                instance_id,
                pattern,
                stream_tx,
                reply: reply_tx,
            })
            .map_err(|_| control_disconnected())?;

        // Wait for ack (or error) and return the stream registration.
        reply_rx.recv().map_err(|_| control_disconnected())??;

        debug!(instance = %instance_id, "instance registered");
        Ok(InstanceRegistration { instance_id, stream })
    }

    /// Non-blocking event enqueue for one instance.
    ///
    /// Events for unknown or terminated instances are accepted and ignored.
    ///
    /// # Errors
    ///
    /// `ExecutionError::QueueFull` when the owning worker is saturated.
    pub fn deliver(&self, instance_id: InstanceId, event: EventRef) -> CepResult<()> {
        let shard = self.shard(instance_id)?;
        let path = format!("kyrocep-worker-{}", shard_of(instance_id, self.shards.len()));
        match shard.event_tx.try_send(EventMsg { instance_id, event }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CepError::Execution(ExecutionError::QueueFull {
                path,
                capacity: self.cfg.event_queue_capacity.max(1),
            })),
            Err(TrySendError::Disconnected(_)) => Err(CepError::Execution(ExecutionError::Disconnected { path })),
        }
    }

    /// Stops an instance, cancelling its timers. Later deliveries are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` if the worker has exited.
    pub fn stop(&self, instance_id: InstanceId) -> CepResult<()> {
        self.shard(instance_id)?
            .control_tx
            .send(ControlMsg::Stop { instance_id })
            .map_err(|_| control_disconnected())
    }

    /// Matches dropped because a subscriber was slow or gone.
    #[must_use]
    pub fn dropped_matches(&self) -> u64 {
        self.counters.dropped_matches.load(Ordering::Relaxed)
    }

    /// Predicate failures observed by the workers.
    #[must_use]
    pub fn predicate_failures(&self) -> u64 {
        self.counters.predicate_failures.load(Ordering::Relaxed)
    }

    fn shutdown(&mut self) {
        for shard in &self.shards {
            // Blocks only while the control queue is full.
            let _ = shard.control_tx.send(ControlMsg::Shutdown);
        }
        for shard in &mut self.shards {
            if let Some(handle) = shard.join.take() {
                if handle.join().is_err() {
                    warn!("pattern worker panicked");
                }
            }
        }
        self.scheduler.shutdown();
    }
}

impl Drop for PatternRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    name: &str,
    ctx: WorkerContext,
    control_rx: Receiver<ControlMsg>,
    event_rx: Receiver<EventMsg>,
    timer_rx: Receiver<FiredTimer>,
) -> CepResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || worker_loop(&ctx, &control_rx, &event_rx, &timer_rx))
        .map_err(|e| {
            CepError::Execution(ExecutionError::WorkerSpawn {
                name: name.to_string(),
                message: e.to_string(),
            })
        })
}

fn control_disconnected() -> CepError {
    CepError::Execution(ExecutionError::Disconnected {
        path: "runtime_control".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::pattern::PatternNode;
    use std::time::Duration;

    #[test]
    fn test_config_defaults_and_partial_json() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.worker_threads, 2);
        assert_eq!(cfg.event_queue_capacity, 4096);
        assert_eq!(cfg.on_predicate_error, PredicateErrorPolicy::Skip);

        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{"worker_threads": 4, "on_predicate_error": "abort"}"#).unwrap();
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.match_stream_capacity, 1024);
        assert_eq!(cfg.on_predicate_error, PredicateErrorPolicy::Abort);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let rt = PatternRuntime::new(RuntimeConfig {
            worker_threads: 0,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let reg = rt.register(PatternNode::tagged("a", "A").compile().unwrap()).unwrap();
        rt.deliver(reg.instance_id, Event::new("A").into_ref()).unwrap();
        let m = reg.stream.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(m.bindings.contains("a"));
    }
}
