//! Pattern node descriptors.
//!
//! A `PatternNode` tree is what the external expression compiler hands to the
//! engine. It is validated and flattened into a [`CompiledPattern`] which is
//! immutable and shared by every instance of the same statement.
//!
//! ```
//! use kyrocep::pattern::{PatternNode, RepeatBounds};
//!
//! // [2:] b=B until e=E
//! let node = PatternNode::repeat(RepeatBounds::at_least(2), PatternNode::tagged("b", "B"))
//!     .until(PatternNode::tagged("e", "E"));
//! assert_eq!(node.to_string(), "[2:] b=B until e=E");
//! assert!(node.compile().is_ok());
//! ```

mod bounds;
mod validation;

use std::fmt;
use std::sync::Arc;

use chrono::Duration;

use crate::predicate::FilterPredicate;

pub use bounds::{Bound, RepeatBounds, Variable};
pub use validation::CompiledPattern;
pub(crate) use bounds::CompiledBounds;
pub(crate) use validation::{NodeId, NodeKind, RepeatSpec};

/// A filter leaf: event type, optional tag, optional predicate.
#[derive(Clone)]
pub struct FilterSpec {
    /// Event type the filter accepts.
    pub event_type: String,
    /// Tag bound to the matching event.
    pub tag: Option<String>,
    /// Compiled predicate; `None` accepts every event of the type.
    pub predicate: Option<Arc<dyn FilterPredicate>>,
    /// Tags the predicate reads, in addition to those it reports itself.
    pub references: Vec<String>,
}

impl FilterSpec {
    /// Creates an untagged filter accepting every event of `event_type`.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            tag: None,
            predicate: None,
            references: Vec::new(),
        }
    }

    /// Binds matching events to `tag`.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn predicate(mut self, predicate: impl FilterPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Declares a tag read by an opaque predicate.
    #[must_use]
    pub fn referencing(mut self, tag: impl Into<String>) -> Self {
        self.references.push(tag.into());
        self
    }

    /// All tags read by this filter.
    #[must_use]
    pub fn referenced_tags(&self) -> Vec<String> {
        let mut tags = self.references.clone();
        if let Some(p) = &self.predicate {
            for t in p.referenced_tags() {
                if !tags.contains(&t) {
                    tags.push(t);
                }
            }
        }
        tags
    }
}

impl fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSpec")
            .field("event_type", &self.event_type)
            .field("tag", &self.tag)
            .field("predicate", &self.predicate.as_ref().and_then(|p| p.describe()))
            .field("references", &self.references)
            .finish()
    }
}

impl From<FilterSpec> for PatternNode {
    fn from(spec: FilterSpec) -> Self {
        Self::Filter(spec)
    }
}

/// A node of an uncompiled pattern tree.
#[derive(Debug, Clone)]
pub enum PatternNode {
    /// Matches one event against a type and predicate.
    Filter(FilterSpec),
    /// `timer:interval(d)`: completes once `d` has elapsed since it was armed.
    Timer {
        /// Delay from arming to completion.
        interval: Duration,
    },
    /// `A -> B -> ...`
    Sequence(Vec<PatternNode>),
    /// `A and B and ...`
    And(Vec<PatternNode>),
    /// `A or B or ...`
    Or(Vec<PatternNode>),
    /// `not X`
    Not(Box<PatternNode>),
    /// `[bounds] X until U`
    Repeat {
        /// The repeated sub-expression.
        child: Box<PatternNode>,
        /// Iteration bounds.
        bounds: RepeatBounds,
        /// Expression that ends the repetition early.
        until: Option<Box<PatternNode>>,
    },
    /// `every X`
    Every(Box<PatternNode>),
}

impl PatternNode {
    /// `Type`
    #[must_use]
    pub fn filter(event_type: impl Into<String>) -> Self {
        Self::Filter(FilterSpec::new(event_type))
    }

    /// `tag=Type`
    #[must_use]
    pub fn tagged(tag: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self::Filter(FilterSpec::new(event_type).tag(tag))
    }

    /// `timer:interval(d)`
    #[must_use]
    pub const fn timer(interval: Duration) -> Self {
        Self::Timer { interval }
    }

    /// `a -> b -> ...`
    #[must_use]
    pub fn seq(children: impl IntoIterator<Item = Self>) -> Self {
        Self::Sequence(children.into_iter().collect())
    }

    /// `a and b and ...`
    #[must_use]
    pub fn and(children: impl IntoIterator<Item = Self>) -> Self {
        Self::And(children.into_iter().collect())
    }

    /// `a or b or ...`
    #[must_use]
    pub fn or(children: impl IntoIterator<Item = Self>) -> Self {
        Self::Or(children.into_iter().collect())
    }

    /// `not x`
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Self) -> Self {
        Self::Not(Box::new(child))
    }

    /// `every x`
    #[must_use]
    pub fn every(child: Self) -> Self {
        Self::Every(Box::new(child))
    }

    /// `[bounds] x`
    #[must_use]
    pub fn repeat(bounds: RepeatBounds, child: Self) -> Self {
        Self::Repeat {
            child: Box::new(child),
            bounds,
            until: None,
        }
    }

    /// `[n] x`
    #[must_use]
    pub fn times(n: i64, child: Self) -> Self {
        Self::repeat(RepeatBounds::times(n), child)
    }

    /// Attaches an until clause.
    ///
    /// On a repeat without one the clause is attached to it (`[2:] b=B until e=E`);
    /// anything else is wrapped in a plain until (`(every d=D) until b=B`).
    #[must_use]
    pub fn until(self, until: Self) -> Self {
        match self {
            Self::Repeat {
                child,
                bounds,
                until: None,
            } => Self::Repeat {
                child,
                bounds,
                until: Some(Box::new(until)),
            },
            other => Self::Repeat {
                child: Box::new(other),
                bounds: RepeatBounds::unbounded(),
                until: Some(Box::new(until)),
            },
        }
    }

    /// Validates and compiles the tree.
    ///
    /// # Errors
    ///
    /// Returns `CepError::Pattern` carrying the offending expression text.
    pub fn compile(&self) -> crate::error::CepResult<Arc<CompiledPattern>> {
        CompiledPattern::compile(self)
    }

    /// Whether the node renders without parentheses as an operand.
    fn is_atomic(&self) -> bool {
        match self {
            Self::Filter(_) | Self::Timer { .. } | Self::Not(_) | Self::Every(_) => true,
            Self::Repeat { until, .. } => until.is_none(),
            Self::Sequence(_) | Self::And(_) | Self::Or(_) => false,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_atomic() {
            write!(f, "{self}")
        } else {
            write!(f, "({self})")
        }
    }

    fn fmt_joined(f: &mut fmt::Formatter<'_>, children: &[Self], sep: &str) -> fmt::Result {
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                write!(f, "{sep}")?;
            }
            child.fmt_operand(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for PatternNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter(spec) => {
                if let Some(tag) = &spec.tag {
                    write!(f, "{tag}=")?;
                }
                write!(f, "{}", spec.event_type)?;
                if let Some(text) = spec.predicate.as_ref().and_then(|p| p.describe()) {
                    write!(f, "({text})")?;
                }
                Ok(())
            }
            Self::Timer { interval } => {
                let millis = interval.num_milliseconds();
                if millis % 1000 == 0 {
                    write!(f, "timer:interval({} sec)", millis / 1000)
                } else {
                    write!(f, "timer:interval({millis} msec)")
                }
            }
            Self::Sequence(children) => Self::fmt_joined(f, children, " -> "),
            Self::And(children) => Self::fmt_joined(f, children, " and "),
            Self::Or(children) => Self::fmt_joined(f, children, " or "),
            Self::Not(child) => {
                write!(f, "not ")?;
                child.fmt_operand(f)
            }
            Self::Every(child) => {
                write!(f, "every ")?;
                child.fmt_operand(f)
            }
            Self::Repeat { child, bounds, until } => {
                if !bounds.is_unbounded() {
                    write!(f, "{bounds} ")?;
                }
                child.fmt_operand(f)?;
                if let Some(u) = until {
                    write!(f, " until ")?;
                    u.fmt_operand(f)?;
                }
                Ok(())
            }
        }
    }
}
