//! Tag binding maps.
//!
//! Every partial match carries a `TagBindings` map from tag name to either a
//! single bound event or, for tags under a repeat, the ordered events bound by
//! successive iterations. Maps are shared between branches and copied only when
//! a branch writes to a map that another branch still holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::EventRef;

/// The value bound to a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "events", rename_all = "snake_case")]
pub enum Binding {
    /// A tag bound once.
    Single(EventRef),
    /// A tag under a repeat; one entry per iteration that bound it.
    Array(Vec<EventRef>),
}

impl Binding {
    /// Returns the single event, if this is a single binding.
    #[must_use]
    pub const fn as_single(&self) -> Option<&EventRef> {
        match self {
            Self::Single(ev) => Some(ev),
            Self::Array(_) => None,
        }
    }

    /// Returns the array entries, if this is an array binding.
    #[must_use]
    pub fn as_array(&self) -> Option<&[EventRef]> {
        match self {
            Self::Array(evs) => Some(evs),
            Self::Single(_) => None,
        }
    }

    /// Appends the events of this binding to `out` in order.
    pub(crate) fn extend_into(&self, out: &mut Vec<EventRef>) {
        match self {
            Self::Single(ev) => out.push(EventRef::clone(ev)),
            Self::Array(evs) => out.extend(evs.iter().cloned()),
        }
    }
}

/// Tag name to binding map for one partial or completed match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagBindings {
    entries: Arc<BTreeMap<String, Binding>>,
}

impl TagBindings {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a tag.
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&Binding> {
        self.entries.get(tag)
    }

    /// Returns the single event bound to `tag`.
    #[must_use]
    pub fn event(&self, tag: &str) -> Option<&EventRef> {
        self.get(tag).and_then(Binding::as_single)
    }

    /// Returns the array bound to a repeated `tag`.
    #[must_use]
    pub fn array(&self, tag: &str) -> Option<&[EventRef]> {
        self.get(tag).and_then(Binding::as_array)
    }

    /// Reads slot `index` of a repeated tag.
    ///
    /// Slots past the last bound iteration are unset and read as `None`, as does
    /// a repeated tag that never bound anything.
    #[must_use]
    pub fn indexed(&self, tag: &str, index: usize) -> Option<&EventRef> {
        self.array(tag).and_then(|evs| evs.get(index))
    }

    /// Returns true if `tag` is bound.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Iterates tags in name order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates bindings in tag-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of bound tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no tag is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if both maps share the same underlying storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    /// Returns a copy with `tag` bound to `event`.
    #[must_use]
    pub(crate) fn with_event(&self, tag: &str, event: EventRef) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.entries).insert(tag.to_string(), Binding::Single(event));
        next
    }

    /// Returns a copy with `tag` bound to an array of events.
    #[must_use]
    pub(crate) fn with_array(&self, tag: &str, events: Vec<EventRef>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.entries).insert(tag.to_string(), Binding::Array(events));
        next
    }

    /// Returns the union of both maps; entries of `other` win on conflict.
    #[must_use]
    pub(crate) fn merged(&self, other: &Self) -> Self {
        if other.is_empty() || self.shares_storage_with(other) {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut next = self.clone();
        let entries = Arc::make_mut(&mut next.entries);
        for (tag, binding) in other.entries.iter() {
            entries.insert(tag.clone(), binding.clone());
        }
        next
    }
}
