//! Event occurrences fed into pattern instances.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// Unique identifier for an event occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A discrete event occurrence: a type name plus a flat property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Event type name (e.g. `"A"`, `"OrderPlaced"`).
    pub event_type: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event properties.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Shared handle to an immutable event.
///
/// Bindings hold events by reference; two bindings refer to the same occurrence
/// exactly when [`Arc::ptr_eq`] holds.
pub type EventRef = Arc<Event>;

impl Event {
    /// Creates an event of the given type stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Reads a property.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Freezes the event into a shareable handle.
    #[must_use]
    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_properties() {
        let ev = Event::new("A").with("id", "A1").with("qty", 3);
        assert_eq!(ev.event_type, "A");
        assert_eq!(ev.get("id"), Some(&Value::String("A1".to_string())));
        assert_eq!(ev.get("qty").and_then(Value::as_int), Some(3));
        assert!(ev.get("missing").is_none());
    }

    #[test]
    fn test_event_ids_unique() {
        assert_ne!(Event::new("A").id, Event::new("A").id);
    }

    #[test]
    fn test_event_ref_identity() {
        let a = Event::new("A").into_ref();
        let b = Arc::clone(&a);
        let c = Event::new("A").into_ref();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_event_serialization() {
        let ev = Event::new("B").with("id", "B1");
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
