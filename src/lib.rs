//! # KyroCEP - Incremental Event-Pattern Matching
//!
//! KyroCEP evaluates declarative event patterns against a live, unbounded
//! stream of events. A pattern combines filters with sequence (`->`),
//! conjunction (`and`), disjunction (`or`), negation guards (`not`), bounded
//! repetition (`[n]`, `[min:max]`), early-terminating `until` and re-arming
//! `every`. Repeat bounds may be literals or expressions read when the repeat
//! is armed. Each pattern instance keeps a tree of partial matches that fork and
//! join as events arrive and emits completed matches with their tag bindings.
//!
//! ## Core Concepts
//!
//! - **PatternNode**: the pattern tree handed over by an expression compiler
//! - **CompiledPattern**: a validated, immutable tree shared by all instances
//! - **PatternInstance**: one live evaluation, fed with `deliver`/`deliver_timer`
//! - **TagBindings**: tag to event (or, under a repeat, to an ordered array)
//! - **PatternRuntime**: sharded worker threads hosting many instances
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kyrocep::{Event, ManualScheduler, PatternInstance, PatternNode};
//!
//! // a=A until D
//! let pattern = PatternNode::tagged("a", "A")
//!     .until(PatternNode::filter("D"))
//!     .compile()?;
//!
//! let mut instance = PatternInstance::new(pattern, Arc::new(ManualScheduler::default()));
//! instance.start();
//! instance.deliver(&Event::new("A").with("id", "A1").into_ref())?;
//! instance.deliver(&Event::new("A").with("id", "A2").into_ref())?;
//! let matches = instance.deliver(&Event::new("D").into_ref())?;
//!
//! assert_eq!(matches.len(), 1);
//! assert_eq!(matches[0].bindings.array("a").map(<[_]>::len), Some(2));
//! # Ok::<(), kyrocep::CepError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod bindings;
pub mod error;
pub mod event;
pub mod predicate;
pub mod value;

// Patterns and evaluation
mod eval;
pub mod instance;
pub mod pattern;
pub mod schedule;

// Hosting
pub mod runtime;

// Re-export primary types at crate root for convenience
pub use bindings::{Binding, TagBindings};
pub use error::{CepError, CepResult, ExecutionError, PredicateError, ValidationError};
pub use event::{Event, EventId, EventRef};
pub use instance::{InstanceId, MatchResult, PatternInstance};
pub use pattern::{Bound, CompiledPattern, FilterSpec, PatternNode, RepeatBounds, Variable};
pub use predicate::{FilterPredicate, PropertyEquals, PropertyEqualsTag, PropertyMatches};
pub use runtime::{InstanceRegistration, MatchStream, PatternRuntime, PredicateErrorPolicy, RuntimeConfig};
pub use schedule::{FiredTimer, ManualScheduler, Scheduler, ThreadScheduler, TimerToken};
pub use value::{Value, ValueKind};
