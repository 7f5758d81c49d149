//! Binding environments.
//!
//! A [`Frame`] maps symbolic [`Var`]s to concrete values. Frames are immutable
//! from the outside: every extension hands back a new frame and leaves the
//! original untouched. Internally the map sits behind an `Arc`, so cloning a
//! frame to seed a copy is cheap and the map is only duplicated on first write.
//!
//! # Example
//!
//! ```rust
//! use synapse_sync::frame::{var, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::new().with(var("user"), json!("U1"));
//!
//! // Unifying against an equal value keeps the frame
//! assert!(frame.unify(&var("user"), &json!("U1")).is_some());
//!
//! // A conflicting value discards it
//! assert!(frame.unify(&var("user"), &json!("U2")).is_none());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A symbolic variable, scoped to one evaluation of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Var(String);

impl Var {
    /// Create a variable with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The variable's name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// Shorthand for [`Var::new`].
pub fn var(name: impl Into<String>) -> Var {
    Var::new(name)
}

/// Shorthand for a literal [`Term`].
pub fn lit(value: impl Into<Value>) -> Term {
    Term::Lit(value.into())
}

/// One slot of a template: either a variable or a literal constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Binds on first encounter, must be equal on every later one
    Var(Var),

    /// Must equal the concrete value exactly
    Lit(Value),
}

impl Term {
    /// The variable in this slot, if any
    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Term::Var(v) => Some(v),
            Term::Lit(_) => None,
        }
    }
}

impl From<Var> for Term {
    fn from(v: Var) -> Self {
        Term::Var(v)
    }
}

impl From<&Var> for Term {
    fn from(v: &Var) -> Self {
        Term::Var(v.clone())
    }
}

/// An immutable map from variables to concrete values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    bindings: Arc<BTreeMap<Var, Value>>,
}

impl Frame {
    /// An empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable's binding
    pub fn get(&self, var: &Var) -> Option<&Value> {
        self.bindings.get(var)
    }

    /// Whether the variable is bound in this frame
    pub fn is_bound(&self, var: &Var) -> bool {
        self.bindings.contains_key(var)
    }

    /// Number of bound variables
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no variable is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate bound variables in name order
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.bindings.keys()
    }

    /// Iterate bindings in variable-name order
    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Value)> {
        self.bindings.iter()
    }

    /// A copy of this frame with `var` bound to `value`, overwriting any
    /// existing binding.
    pub fn with(&self, var: Var, value: Value) -> Frame {
        let mut next = self.clone();
        Arc::make_mut(&mut next.bindings).insert(var, value);
        next
    }

    /// Unify `var` with `value`.
    ///
    /// Returns a frame with the binding added when `var` is unbound, the same
    /// frame when it is already bound to an equal value, and `None` on conflict.
    pub fn unify(&self, var: &Var, value: &Value) -> Option<Frame> {
        let mut next = self.clone();
        next.unify_mut(var, value).then_some(next)
    }

    /// Resolve a term against this frame. Unbound variables resolve to `None`.
    pub fn resolve(&self, term: &Term) -> Option<Value> {
        match term {
            Term::Lit(v) => Some(v.clone()),
            Term::Var(v) => self.get(v).cloned(),
        }
    }

    /// In-place unification used while building a fresh frame during matching.
    pub(crate) fn unify_mut(&mut self, var: &Var, value: &Value) -> bool {
        match self.bindings.get(var) {
            Some(existing) => existing == value,
            None => {
                Arc::make_mut(&mut self.bindings).insert(var.clone(), value.clone());
                true
            }
        }
    }
}

impl Serialize for Frame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bindings.serialize(serializer)
    }
}

impl FromIterator<(Var, Value)> for Frame {
    fn from_iter<I: IntoIterator<Item = (Var, Value)>>(iter: I) -> Self {
        Self {
            bindings: Arc::new(iter.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_leaves_original_untouched() {
        let base = Frame::new().with(var("a"), json!(1));
        let next = base.with(var("b"), json!(2));

        assert_eq!(base.len(), 1);
        assert!(!base.is_bound(&var("b")));
        assert_eq!(next.get(&var("a")), Some(&json!(1)));
        assert_eq!(next.get(&var("b")), Some(&json!(2)));
    }

    #[test]
    fn test_unify_binds_unbound() {
        let frame = Frame::new().unify(&var("x"), &json!("v")).unwrap();
        assert_eq!(frame.get(&var("x")), Some(&json!("v")));
    }

    #[test]
    fn test_unify_equal_and_conflicting() {
        let frame = Frame::new().with(var("x"), json!({"k": [1, 2]}));

        let same = frame.unify(&var("x"), &json!({"k": [1, 2]})).unwrap();
        assert_eq!(same, frame);

        assert!(frame.unify(&var("x"), &json!({"k": [2, 1]})).is_none());
    }

    #[test]
    fn test_resolve() {
        let frame = Frame::new().with(var("user"), json!("U1"));
        assert_eq!(frame.resolve(&var("user").into()), Some(json!("U1")));
        assert_eq!(frame.resolve(&lit("const")), Some(json!("const")));
        assert_eq!(frame.resolve(&var("missing").into()), None);
    }

    #[test]
    fn test_serialize_as_map() {
        let frame: Frame = [(var("b"), json!(2)), (var("a"), json!(1))]
            .into_iter()
            .collect();
        let json_str = serde_json::to_string(&frame).unwrap();
        assert_eq!(json_str, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_display_var() {
        assert_eq!(var("user").to_string(), "?user");
    }
}
