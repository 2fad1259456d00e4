//! Scheduling contract consumed by timer leaves.
//!
//! The engine only needs `now`, `schedule_at` and `cancel`. Firings are never
//! applied to node state by the scheduler itself: the owner of a token routes
//! it back into [`crate::instance::PatternInstance::deliver_timer`], which
//! ignores tokens that were cancelled or already consumed.
//!
//! Two implementations ship with the crate: [`ManualScheduler`], a virtual
//! clock driven by the caller, and [`ThreadScheduler`], a background thread
//! that invokes a callback at each deadline.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CepResult, ExecutionError};
use crate::instance::InstanceId;

/// Cancelable handle for one scheduled firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Wrap a raw token value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// A due timer handed back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    /// The token returned by `schedule_at`.
    pub token: TimerToken,
    /// Instance that scheduled the timer.
    pub owner: InstanceId,
    /// Scheduled deadline.
    pub at: DateTime<Utc>,
}

/// Time source and timer service.
pub trait Scheduler: Send + Sync {
    /// Current time as seen by the engine.
    fn now(&self) -> DateTime<Utc>;

    /// Schedules a firing at `at` on behalf of `owner`.
    fn schedule_at(&self, at: DateTime<Utc>, owner: InstanceId) -> TimerToken;

    /// Cancels a pending firing. Unknown or already fired tokens are ignored.
    fn cancel(&self, token: TimerToken);
}

#[derive(Debug)]
struct ManualClock {
    now: DateTime<Utc>,
    next_token: u64,
    queue: BTreeMap<(DateTime<Utc>, TimerToken), InstanceId>,
    deadlines: HashMap<TimerToken, DateTime<Utc>>,
}

/// Virtual clock for deterministic tests and replays.
///
/// Time only moves through [`ManualScheduler::set_now`] and
/// [`ManualScheduler::pop_due`].
#[derive(Debug)]
pub struct ManualScheduler {
    clock: Mutex<ManualClock>,
}

impl ManualScheduler {
    /// Creates a clock starting at `now`.
    ///
    /// The default clock starts at the Unix epoch.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            clock: Mutex::new(ManualClock {
                now,
                next_token: 1,
                queue: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the clock without firing anything.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    /// Removes the earliest timer due at or before `until`.
    ///
    /// The clock advances to the firing time. Once no timer is due, call
    /// `set_now(until)` to finish the advance.
    pub fn pop_due(&self, until: DateTime<Utc>) -> Option<FiredTimer> {
        let mut clock = self.lock();
        let (&(at, token), _) = clock.queue.iter().next()?;
        if at > until {
            return None;
        }
        let owner = clock.queue.remove(&(at, token))?;
        clock.deadlines.remove(&token);
        if at > clock.now {
            clock.now = at;
        }
        Some(FiredTimer { token, owner, at })
    }

    /// Number of timers still pending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if `token` is still pending.
    #[must_use]
    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.lock().deadlines.contains_key(&token)
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::starting_at(DateTime::<Utc>::default())
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn schedule_at(&self, at: DateTime<Utc>, owner: InstanceId) -> TimerToken {
        let mut clock = self.lock();
        let token = TimerToken(clock.next_token);
        clock.next_token += 1;
        clock.queue.insert((at, token), owner);
        clock.deadlines.insert(token, at);
        token
    }

    fn cancel(&self, token: TimerToken) {
        let mut clock = self.lock();
        if let Some(at) = clock.deadlines.remove(&token) {
            clock.queue.remove(&(at, token));
        }
    }
}

enum TimerCommand {
    Schedule {
        token: TimerToken,
        at: DateTime<Utc>,
        owner: InstanceId,
    },
    Cancel(TimerToken),
}

/// Wall-clock scheduler backed by a dedicated thread.
///
/// The callback runs on the timer thread and must not block; the runtime uses
/// it only to enqueue a message for the owning worker.
pub struct ThreadScheduler {
    next_token: AtomicU64,
    command_tx: Mutex<Option<Sender<TimerCommand>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("next_token", &self.next_token.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ThreadScheduler {
    /// Spawns the timer thread.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::WorkerSpawn` if the thread cannot be started.
    pub fn new<F>(on_fire: F) -> CepResult<Self>
    where
        F: Fn(FiredTimer) + Send + 'static,
    {
        let (command_tx, command_rx) = unbounded::<TimerCommand>();
        let name = "kyrocep-timer".to_string();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&command_rx, &on_fire))
            .map_err(|e| ExecutionError::WorkerSpawn {
                name,
                message: e.to_string(),
            })?;

        Ok(Self {
            next_token: AtomicU64::new(1),
            command_tx: Mutex::new(Some(command_tx)),
            join: Mutex::new(Some(join)),
        })
    }

    fn send(&self, command: TimerCommand) {
        let guard = self.command_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            if tx.send(command).is_err() {
                warn!("timer thread is gone; command dropped");
            }
        }
    }

    /// Stops the timer thread. Pending timers never fire. Idempotent.
    pub fn shutdown(&self) {
        // Dropping the sender disconnects the loop.
        drop(self.command_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule_at(&self, at: DateTime<Utc>, owner: InstanceId) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.send(TimerCommand::Schedule { token, at, owner });
        token
    }

    fn cancel(&self, token: TimerToken) {
        self.send(TimerCommand::Cancel(token));
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(command_rx: &crossbeam_channel::Receiver<TimerCommand>, on_fire: &dyn Fn(FiredTimer)) {
    let mut queue: BTreeMap<(DateTime<Utc>, TimerToken), InstanceId> = BTreeMap::new();
    let mut deadlines: HashMap<TimerToken, DateTime<Utc>> = HashMap::new();

    loop {
        let now = Utc::now();
        loop {
            let Some((at, token)) = queue.keys().next().copied() else {
                break;
            };
            if at > now {
                break;
            }
            if let Some(owner) = queue.remove(&(at, token)) {
                deadlines.remove(&token);
                on_fire(FiredTimer { token, owner, at });
            }
        }

        let command = match queue.keys().next() {
            Some(&(at, _)) => {
                let wait = (at - now).to_std().unwrap_or_default();
                match command_rx.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match command_rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            TimerCommand::Schedule { token, at, owner } => {
                queue.insert((at, token), owner);
                deadlines.insert(token, at);
            }
            TimerCommand::Cancel(token) => {
                if let Some(at) = deadlines.remove(&token) {
                    queue.remove(&(at, token));
                }
            }
        }
    }

    debug!(pending = queue.len(), "timer thread exiting");
}
