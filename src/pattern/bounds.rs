//! Repeat bounds.
//!
//! A bound side is a literal count or an expression read when the repeat is
//! armed: a property of an event bound to an earlier tag, or a host variable.
//! Literal bounds are checked once, at compile time. Expression bounds are
//! type-checked at compile time and checked against the same range rules each
//! time a repeat is armed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::bindings::TagBindings;
use crate::error::ValidationError;
use crate::value::{Value, ValueKind};

/// A named, typed value set by the host and read by patterns.
///
/// Clones share the same cell, so a pattern compiled with a variable sees
/// every later `set`.
///
/// ```
/// use kyrocep::{ValueKind, Variable};
///
/// let lower = Variable::new("lower", ValueKind::Int);
/// lower.set(2).unwrap();
/// assert_eq!(lower.get().as_int(), Some(2));
/// assert!(lower.set("two").is_err());
/// ```
#[derive(Clone)]
pub struct Variable {
    name: Arc<str>,
    kind: ValueKind,
    value: Arc<RwLock<Value>>,
}

impl Variable {
    /// Declares an unset variable of type `kind`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: Arc::from(name.into()),
            kind,
            value: Arc::new(RwLock::new(Value::Null)),
        }
    }

    /// The variable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared type.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// The current value; `Value::Null` while unset.
    #[must_use]
    pub fn get(&self) -> Value {
        self.value.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the value. `Value::Null` unsets it.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::VariableTypeMismatch` if the value does not fit
    /// the declared type. Integers are accepted by float variables.
    pub fn set(&self, value: impl Into<Value>) -> Result<(), ValidationError> {
        let value = value.into();
        if let Some(actual) = value.kind() {
            let widened = self.kind == ValueKind::Float && actual == ValueKind::Int;
            if actual != self.kind && !widened {
                return Err(ValidationError::VariableTypeMismatch {
                    name: self.name.to_string(),
                    expected: self.kind.name(),
                    actual: actual.name(),
                });
            }
        }
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.get())
            .finish()
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// One side of a repeat bound.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    /// A literal count.
    Literal(i64),
    /// `tag.property` of the event bound to an earlier tag.
    Property {
        /// Tag bound before the repeat is armed.
        tag: String,
        /// Property read from the tagged event.
        property: String,
        /// Declared type of the property.
        kind: ValueKind,
    },
    /// A host variable.
    Variable(Variable),
}

impl Bound {
    /// `tag.property`, declared with type `kind`.
    #[must_use]
    pub fn property(tag: impl Into<String>, property: impl Into<String>, kind: ValueKind) -> Self {
        Self::Property {
            tag: tag.into(),
            property: property.into(),
            kind,
        }
    }

    const fn literal(&self) -> Option<i64> {
        match self {
            Self::Literal(n) => Some(*n),
            _ => None,
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            Self::Literal(_) => ValueKind::Int,
            Self::Property { kind, .. } => *kind,
            Self::Variable(variable) => variable.kind(),
        }
    }

    /// Reads the bound for a repeat armed with `bindings`. `None` is unset.
    #[allow(clippy::cast_possible_truncation)]
    fn evaluate(&self, bindings: &TagBindings) -> Result<Option<i64>, ValidationError> {
        let value = match self {
            Self::Literal(n) => return Ok(Some(*n)),
            Self::Property { tag, property, .. } => bindings
                .event(tag)
                .and_then(|event| event.get(property))
                .cloned()
                .unwrap_or(Value::Null),
            Self::Variable(variable) => variable.get(),
        };
        match value {
            Value::Null => Ok(None),
            Value::Int(n) => Ok(Some(n)),
            Value::Float(x) => Ok(Some(x.trunc() as i64)),
            _ => Err(ValidationError::NonNumericBound),
        }
    }
}

impl From<i64> for Bound {
    fn from(n: i64) -> Self {
        Self::Literal(n)
    }
}

impl From<Variable> for Bound {
    fn from(variable: Variable) -> Self {
        Self::Variable(variable)
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(n) => write!(f, "{n}"),
            Self::Property { tag, property, .. } => write!(f, "{tag}.{property}"),
            Self::Variable(variable) => write!(f, "{}", variable.name()),
        }
    }
}

/// Repeat bounds as written by the user.
///
/// Literals are signed so that out-of-range input from the compiler reaches
/// validation instead of being lost in a conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum RepeatBounds {
    /// `[n]`
    Exact(Bound),
    /// `[lower:upper]`, either side optional.
    Range {
        /// Minimum number of iterations; zero when absent.
        lower: Option<Bound>,
        /// Maximum number of iterations; unbounded when absent.
        upper: Option<Bound>,
    },
}

impl RepeatBounds {
    /// `[n]` with a literal count.
    #[must_use]
    pub const fn times(n: i64) -> Self {
        Self::Exact(Bound::Literal(n))
    }

    /// `[bound]` with any bound expression.
    #[must_use]
    pub fn exact(bound: impl Into<Bound>) -> Self {
        Self::Exact(bound.into())
    }

    /// `[lower:upper]` with any bound expressions.
    #[must_use]
    pub const fn range(lower: Option<Bound>, upper: Option<Bound>) -> Self {
        Self::Range { lower, upper }
    }

    /// `[lower:upper]`
    #[must_use]
    pub const fn between(lower: i64, upper: i64) -> Self {
        Self::range(Some(Bound::Literal(lower)), Some(Bound::Literal(upper)))
    }

    /// `[lower:]`
    #[must_use]
    pub const fn at_least(lower: i64) -> Self {
        Self::range(Some(Bound::Literal(lower)), None)
    }

    /// `[:upper]`
    #[must_use]
    pub const fn at_most(upper: i64) -> Self {
        Self::range(None, Some(Bound::Literal(upper)))
    }

    /// No bounds at all: plain `X until U`.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self::range(None, None)
    }

    pub(super) const fn is_unbounded(&self) -> bool {
        matches!(self, Self::Range { lower: None, upper: None })
    }
}

impl fmt::Display for RepeatBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "[{n}]"),
            Self::Range { lower, upper } => {
                write!(f, "[")?;
                if let Some(l) = lower {
                    write!(f, "{l}")?;
                }
                write!(f, ":")?;
                if let Some(u) = upper {
                    write!(f, "{u}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Checked repeat bounds.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledBounds {
    /// All sides were literals.
    Fixed { min: u32, max: Option<u32> },
    /// At least one side is read when the repeat is armed.
    Deferred {
        exact: bool,
        lower: Option<Bound>,
        upper: Option<Bound>,
    },
}

impl CompiledBounds {
    /// Checks `bounds` for a repeat armed after the tags in `available`.
    ///
    /// An exact count (`[n]`, or a literal `[n:n]`) needs no until clause; any
    /// other range does.
    pub(crate) fn compile(
        bounds: &RepeatBounds,
        has_until: bool,
        available: &BTreeSet<String>,
    ) -> Result<Self, ValidationError> {
        let (exact, lower, upper) = match bounds {
            RepeatBounds::Exact(n) => (true, Some(n), None),
            RepeatBounds::Range { lower, upper } => (false, lower.as_ref(), upper.as_ref()),
        };

        for bound in lower.iter().chain(upper.iter()) {
            if !bound.kind().is_numeric() {
                return Err(ValidationError::NonNumericBound);
            }
            if let Bound::Property { tag, .. } = bound {
                if !available.contains(tag) {
                    return Err(ValidationError::UnboundBoundTag { tag: tag.clone() });
                }
            }
        }

        let lower_literal = lower.and_then(Bound::literal);
        let upper_literal = upper.and_then(Bound::literal);
        let deferred = lower.is_some_and(|b| b.literal().is_none()) || upper.is_some_and(|b| b.literal().is_none());

        let fixed = if deferred {
            if lower_literal.is_some_and(|l| l < 0) || upper_literal.is_some_and(|u| u <= 0) {
                return Err(ValidationError::NonPositiveBound);
            }
            None
        } else {
            Some(normalize(exact, lower_literal, upper_literal)?)
        };

        let single_count = exact || matches!((lower_literal, upper_literal), (Some(l), Some(u)) if l == u);
        if !single_count && !has_until {
            return Err(ValidationError::RangeWithoutUntil);
        }

        Ok(match fixed {
            Some((min, max)) => Self::Fixed { min, max },
            None => Self::Deferred {
                exact,
                lower: lower.cloned(),
                upper: upper.cloned(),
            },
        })
    }

    /// Evaluates the bounds for a repeat armed with `bindings`.
    ///
    /// # Errors
    ///
    /// The same range errors compile time reports for literals, or
    /// `NonNumericBound` when an expression yields a non-numeric value.
    pub(crate) fn resolve(&self, bindings: &TagBindings) -> Result<(u32, Option<u32>), ValidationError> {
        match self {
            Self::Fixed { min, max } => Ok((*min, *max)),
            Self::Deferred { exact, lower, upper } => {
                let lower = lower.as_ref().map(|b| b.evaluate(bindings)).transpose()?.flatten();
                let upper = upper.as_ref().map(|b| b.evaluate(bindings)).transpose()?.flatten();
                normalize(*exact, lower, upper)
            }
        }
    }
}

/// Normalizes bound values to `(min, max)`.
///
/// A range may start at zero, but no bound may be negative and an upper or
/// exact bound must be positive. For an exact count the value is in `lower`.
fn normalize(exact: bool, lower: Option<i64>, upper: Option<i64>) -> Result<(u32, Option<u32>), ValidationError> {
    if exact {
        let n = lower.map_or(Err(ValidationError::NonPositiveBound), positive)?;
        return Ok((n, Some(n)));
    }
    if lower.is_some_and(|l| l < 0) {
        return Err(ValidationError::NonPositiveBound);
    }
    let max = upper.map(positive).transpose()?;
    if let (Some(l), Some(u)) = (lower, upper) {
        if l > u {
            return Err(ValidationError::InvertedBounds { lower: l, upper: u });
        }
    }
    let min = lower
        .map(|l| u32::try_from(l).map_err(|_| ValidationError::NonPositiveBound))
        .transpose()?
        .unwrap_or(0);
    Ok((min, max))
}

fn positive(value: i64) -> Result<u32, ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NonPositiveBound);
    }
    u32::try_from(value).map_err(|_| ValidationError::NonPositiveBound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_literal_bounds_are_fixed() {
        let compiled = CompiledBounds::compile(&RepeatBounds::between(2, 2), false, &tags(&[])).unwrap();
        assert_eq!(compiled, CompiledBounds::Fixed { min: 2, max: Some(2) });
        assert_eq!(compiled.resolve(&TagBindings::new()), Ok((2, Some(2))));
    }

    #[test]
    fn test_property_bound_resolves_from_bindings() {
        let bounds = RepeatBounds::exact(Bound::property("s0", "id", ValueKind::Int));
        assert_eq!(bounds.to_string(), "[s0.id]");
        let compiled = CompiledBounds::compile(&bounds, false, &tags(&["s0"])).unwrap();

        let bindings = TagBindings::new().with_event("s0", Event::new("S0").with("id", 3).into_ref());
        assert_eq!(compiled.resolve(&bindings), Ok((3, Some(3))));

        let bindings = TagBindings::new().with_event("s0", Event::new("S0").with("id", 0).into_ref());
        assert_eq!(compiled.resolve(&bindings), Err(ValidationError::NonPositiveBound));

        let bindings = TagBindings::new().with_event("s0", Event::new("S0").with("id", "x").into_ref());
        assert_eq!(compiled.resolve(&bindings), Err(ValidationError::NonNumericBound));
    }

    #[test]
    fn test_non_numeric_bound_rejected() {
        let bounds = RepeatBounds::range(None, Some(Bound::property("a", "name", ValueKind::String)));
        let err = CompiledBounds::compile(&bounds, true, &tags(&["a"])).unwrap_err();
        assert_eq!(err, ValidationError::NonNumericBound);

        let text = Variable::new("label", ValueKind::String);
        let err = CompiledBounds::compile(&RepeatBounds::exact(text), false, &tags(&[])).unwrap_err();
        assert_eq!(err, ValidationError::NonNumericBound);
    }

    #[test]
    fn test_property_bound_needs_earlier_tag() {
        let bounds = RepeatBounds::exact(Bound::property("s0", "id", ValueKind::Int));
        let err = CompiledBounds::compile(&bounds, false, &tags(&[])).unwrap_err();
        assert_eq!(err, ValidationError::UnboundBoundTag { tag: "s0".to_string() });
    }

    #[test]
    fn test_variable_bounds_follow_current_value() {
        let lower = Variable::new("lower", ValueKind::Int);
        let upper = Variable::new("upper", ValueKind::Int);
        let bounds = RepeatBounds::range(Some(lower.clone().into()), Some(upper.clone().into()));
        assert_eq!(bounds.to_string(), "[lower:upper]");
        assert_eq!(
            CompiledBounds::compile(&bounds, false, &tags(&[])),
            Err(ValidationError::RangeWithoutUntil)
        );

        let compiled = CompiledBounds::compile(&bounds, true, &tags(&[])).unwrap();
        lower.set(2).unwrap();
        upper.set(3).unwrap();
        assert_eq!(compiled.resolve(&TagBindings::new()), Ok((2, Some(3))));

        lower.set(Value::Null).unwrap();
        assert_eq!(compiled.resolve(&TagBindings::new()), Ok((0, Some(3))));

        lower.set(5).unwrap();
        assert_eq!(
            compiled.resolve(&TagBindings::new()),
            Err(ValidationError::InvertedBounds { lower: 5, upper: 3 })
        );
    }

    #[test]
    fn test_deferred_bounds_still_check_literal_side() {
        let upper = Variable::new("upper", ValueKind::Int);
        let bounds = RepeatBounds::range(Some(Bound::Literal(-1)), Some(upper.into()));
        assert_eq!(
            CompiledBounds::compile(&bounds, true, &tags(&[])),
            Err(ValidationError::NonPositiveBound)
        );
    }

    #[test]
    fn test_variable_type_checked_on_set() {
        let count = Variable::new("count", ValueKind::Float);
        count.set(2).unwrap();
        count.set(2.5).unwrap();
        let err = count.set(true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Variable 'count' of type float cannot be assigned a value of type bool"
        );
        assert_eq!(count.get(), Value::Float(2.5));
    }
}
