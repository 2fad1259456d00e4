//! Leaf predicates for filter nodes.
//!
//! Predicates are compiled by an external expression compiler; the engine only
//! needs the [`FilterPredicate`] contract. A predicate sees the candidate event
//! and the bindings accumulated by the partial match that armed the filter, so
//! later filters can refer to events bound by earlier ones.

use std::fmt;

use regex::Regex;

use crate::bindings::TagBindings;
use crate::error::PredicateError;
use crate::event::Event;
use crate::value::Value;

/// A compiled filter predicate.
pub trait FilterPredicate: Send + Sync {
    /// Evaluates the predicate. Errors are not swallowed by the engine.
    fn evaluate(&self, event: &Event, bindings: &TagBindings) -> Result<bool, PredicateError>;

    /// Expression text used when rendering the pattern, e.g. `id='A2'`.
    fn describe(&self) -> Option<String> {
        None
    }

    /// Tags this predicate reads from the partial match.
    fn referenced_tags(&self) -> Vec<String> {
        Vec::new()
    }
}

impl<F> FilterPredicate for F
where
    F: Fn(&Event, &TagBindings) -> Result<bool, PredicateError> + Send + Sync,
{
    fn evaluate(&self, event: &Event, bindings: &TagBindings) -> Result<bool, PredicateError> {
        self(event, bindings)
    }
}

/// `property = literal`.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEquals {
    property: String,
    value: Value,
}

impl PropertyEquals {
    /// Creates the predicate.
    #[must_use]
    pub fn new(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
        }
    }
}

impl FilterPredicate for PropertyEquals {
    fn evaluate(&self, event: &Event, _bindings: &TagBindings) -> Result<bool, PredicateError> {
        Ok(event
            .get(&self.property)
            .is_some_and(|v| v.loosely_equals(&self.value)))
    }

    fn describe(&self) -> Option<String> {
        Some(format!("{}={}", self.property, self.value))
    }
}

/// `property regexp 'pattern'` on string properties.
///
/// A missing property does not match; a non-string property is an error.
#[derive(Debug, Clone)]
pub struct PropertyMatches {
    property: String,
    regex: Regex,
}

impl PropertyMatches {
    /// Compiles the predicate.
    pub fn new(property: impl Into<String>, pattern: &str) -> Result<Self, PredicateError> {
        let regex = Regex::new(pattern)
            .map_err(|e| PredicateError::new(format!("invalid regex '{pattern}': {e}")))?;
        Ok(Self {
            property: property.into(),
            regex,
        })
    }
}

impl FilterPredicate for PropertyMatches {
    fn evaluate(&self, event: &Event, _bindings: &TagBindings) -> Result<bool, PredicateError> {
        match event.get(&self.property) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::String(s)) => Ok(self.regex.is_match(s)),
            Some(other) => Err(PredicateError::new(format!(
                "property '{}' is {}, expected string",
                self.property,
                other.type_name()
            ))),
        }
    }

    fn describe(&self) -> Option<String> {
        Some(format!("{} regexp '{}'", self.property, self.regex.as_str()))
    }
}

/// `property = tag.property` or `property = tag[index].property`.
///
/// Compares against an event bound earlier in the same match. An unbound tag or
/// an unset array slot compares as null and never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEqualsTag {
    property: String,
    tag: String,
    index: Option<usize>,
    tag_property: String,
}

impl PropertyEqualsTag {
    /// Compares with a single-bound tag.
    #[must_use]
    pub fn new(property: impl Into<String>, tag: impl Into<String>, tag_property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            tag: tag.into(),
            index: None,
            tag_property: tag_property.into(),
        }
    }

    /// Compares with slot `index` of a repeated tag.
    #[must_use]
    pub fn indexed(
        property: impl Into<String>,
        tag: impl Into<String>,
        index: usize,
        tag_property: impl Into<String>,
    ) -> Self {
        Self {
            property: property.into(),
            tag: tag.into(),
            index: Some(index),
            tag_property: tag_property.into(),
        }
    }
}

impl FilterPredicate for PropertyEqualsTag {
    fn evaluate(&self, event: &Event, bindings: &TagBindings) -> Result<bool, PredicateError> {
        let bound = match self.index {
            None => bindings.event(&self.tag),
            Some(i) => bindings.indexed(&self.tag, i),
        };
        let Some(other) = bound.and_then(|ev| ev.get(&self.tag_property)) else {
            return Ok(false);
        };
        Ok(event
            .get(&self.property)
            .is_some_and(|v| !v.is_null() && v.loosely_equals(other)))
    }

    fn describe(&self) -> Option<String> {
        Some(match self.index {
            None => format!("{}={}.{}", self.property, self.tag, self.tag_property),
            Some(i) => format!("{}={}[{i}].{}", self.property, self.tag, self.tag_property),
        })
    }

    fn referenced_tags(&self) -> Vec<String> {
        vec![self.tag.clone()]
    }
}

impl fmt::Debug for dyn FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => write!(f, "FilterPredicate({text})"),
            None => write!(f, "FilterPredicate(<opaque>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_equals() {
        let p = PropertyEquals::new("id", "A2");
        let empty = TagBindings::new();
        assert!(p.evaluate(&Event::new("A").with("id", "A2"), &empty).unwrap());
        assert!(!p.evaluate(&Event::new("A").with("id", "A1"), &empty).unwrap());
        assert!(!p.evaluate(&Event::new("A"), &empty).unwrap());
        assert_eq!(p.describe().as_deref(), Some("id='A2'"));
    }

    #[test]
    fn test_property_matches() {
        let p = PropertyMatches::new("name", "^A[0-9]+$").unwrap();
        let empty = TagBindings::new();
        assert!(p.evaluate(&Event::new("S").with("name", "A17"), &empty).unwrap());
        assert!(!p.evaluate(&Event::new("S").with("name", "B1"), &empty).unwrap());
        assert!(!p.evaluate(&Event::new("S"), &empty).unwrap());

        let err = p.evaluate(&Event::new("S").with("name", 5), &empty).unwrap_err();
        assert!(err.message.contains("expected string"));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(PropertyMatches::new("name", "(").is_err());
    }

    #[test]
    fn test_property_equals_tag() {
        let a = Event::new("A").with("id", "A1").into_ref();
        let bindings = TagBindings::new().with_event("a", a);
        let p = PropertyEqualsTag::new("id", "a", "id");

        assert!(p.evaluate(&Event::new("B").with("id", "A1"), &bindings).unwrap());
        assert!(!p.evaluate(&Event::new("B").with("id", "A2"), &bindings).unwrap());
        assert!(!p.evaluate(&Event::new("B").with("id", "A1"), &TagBindings::new()).unwrap());
        assert_eq!(p.referenced_tags(), vec!["a".to_string()]);
    }

    #[test]
    fn test_property_equals_tag_unset_slot() {
        let a1 = Event::new("A").with("id", "A1").into_ref();
        let bindings = TagBindings::new().with_array("a", vec![a1]);
        let first = PropertyEqualsTag::indexed("s", "a", 0, "id");
        let third = PropertyEqualsTag::indexed("s", "a", 2, "id");
        let ev = Event::new("S").with("s", "A1");

        assert!(first.evaluate(&ev, &bindings).unwrap());
        assert!(!third.evaluate(&ev, &bindings).unwrap());
        assert_eq!(third.describe().as_deref(), Some("s=a[2].id"));
    }

    #[test]
    fn test_closure_predicate() {
        let p = |ev: &Event, _: &TagBindings| -> Result<bool, PredicateError> {
            Ok(ev.get("qty").and_then(Value::as_int).is_some_and(|q| q > 10))
        };
        let empty = TagBindings::new();
        assert!(p.evaluate(&Event::new("O").with("qty", 11), &empty).unwrap());
        assert!(!p.evaluate(&Event::new("O").with("qty", 1), &empty).unwrap());
        assert!(FilterPredicate::describe(&p).is_none());
    }
}
