//! Pattern matching and unification.
//!
//! An [`ActionPattern`] describes the records a rule reacts to: a component,
//! an action name, and partial input/output [`Template`]s whose slots are
//! literals (must be equal) or variables (bind once, must agree afterwards).
//!
//! # Matching
//!
//! ```text
//! pattern  Auth.verify  input {token: ?t}        output {user: ?u}
//! record   Auth.verify  input {token: "T1", ..}  output {user: "U1"}
//!          ─────────────────────────────────────────────────────────
//! frame    {?t: "T1", ?u: "U1"}
//! ```
//!
//! Fields the template does not mention are ignored. A template field missing
//! from the record is a no-match.
//!
//! # Joins
//!
//! A rule with several trigger patterns needs one record per pattern, all
//! agreeing on shared variables. [`join`] seeds the search with the newest
//! record and scans earlier records of the same flow for the rest.

use crate::action::{ActionRecord, Fields};
use crate::frame::{Frame, Term, Var};
use serde_json::Value;

/// A partial field map whose values are terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    entries: Vec<(String, Term)>,
}

impl Template {
    /// An empty template (matches anything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field slot
    pub fn field(mut self, name: impl Into<String>, term: impl Into<Term>) -> Self {
        self.entries.push((name.into(), term.into()));
        self
    }

    /// The `(field, term)` slots in declaration order
    pub fn entries(&self) -> &[(String, Term)] {
        &self.entries
    }

    /// Field names mentioned by this template
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Variables mentioned by this template
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.entries.iter().filter_map(|(_, term)| term.as_var())
    }

    /// Whether the template has no slots
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unify this template against concrete fields, extending `frame`.
    pub fn unify(&self, frame: &Frame, fields: &Fields) -> Option<Frame> {
        let mut next = frame.clone();
        for (name, term) in &self.entries {
            let value = fields.get(name)?;
            if !unify_term(&mut next, term, value) {
                return None;
            }
        }
        Some(next)
    }

    /// Resolve every slot to a concrete value. `None` if a variable is unbound.
    pub fn resolve(&self, frame: &Frame) -> Option<Fields> {
        self.entries
            .iter()
            .map(|(name, term)| frame.resolve(term).map(|v| (name.clone(), v)))
            .collect()
    }

    /// Variables this template needs that `frame` does not bind
    pub fn unbound_vars(&self, frame: &Frame) -> Vec<Var> {
        self.vars()
            .filter(|v| !frame.is_bound(v))
            .cloned()
            .collect()
    }
}

fn unify_term(frame: &mut Frame, term: &Term, value: &Value) -> bool {
    match term {
        Term::Lit(expected) => expected == value,
        Term::Var(v) => frame.unify_mut(v, value),
    }
}

/// Matches completed actions of one component action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPattern {
    /// Component name
    pub component: String,

    /// Action name
    pub action: String,

    /// Partial input template
    pub input: Template,

    /// Partial output template
    pub output: Template,

    /// Variable bound to the whole output map, if any
    pub output_var: Option<Var>,
}

impl ActionPattern {
    /// A pattern matching every completion of `component.action`
    pub fn new(component: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            action: action.into(),
            input: Template::new(),
            output: Template::new(),
            output_var: None,
        }
    }

    /// Constrain an input field
    pub fn input(mut self, field: impl Into<String>, term: impl Into<Term>) -> Self {
        self.input = self.input.field(field, term);
        self
    }

    /// Constrain an output field
    pub fn output(mut self, field: impl Into<String>, term: impl Into<Term>) -> Self {
        self.output = self.output.field(field, term);
        self
    }

    /// Bind the complete output map to `var`, so refinement stages can inspect
    /// which shape the output took.
    pub fn bind_output(mut self, var: Var) -> Self {
        self.output_var = Some(var);
        self
    }

    /// Whether this pattern can ever reference records of `component.action`
    pub fn targets(&self, component: &str, action: &str) -> bool {
        self.component == component && self.action == action
    }

    /// Every variable this pattern can bind
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.input
            .vars()
            .chain(self.output.vars())
            .chain(self.output_var.iter())
    }

    /// Match `record` against this pattern, extending `frame`.
    pub fn matches(&self, frame: &Frame, record: &ActionRecord) -> Option<Frame> {
        if !self.targets(&record.component, &record.action) {
            return None;
        }
        let frame = self.input.unify(frame, &record.input)?;
        let mut frame = self.output.unify(&frame, &record.output)?;
        if let Some(v) = &self.output_var {
            if !frame.unify_mut(v, &Value::Object(record.output.clone())) {
                return None;
            }
        }
        Some(frame)
    }

    /// `Component.action`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.component, self.action)
    }
}

/// Match a single pattern against a single record from an empty frame.
pub fn match_record(pattern: &ActionPattern, record: &ActionRecord) -> Option<Frame> {
    pattern.matches(&Frame::new(), record)
}

/// An action a rule issues once its frame is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    /// Component name
    pub component: String,

    /// Action name
    pub action: String,

    /// Input template, resolved against the frame at dispatch time
    pub input: Template,
}

impl ActionInvocation {
    /// Invoke `component.action` with an empty input
    pub fn new(component: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            action: action.into(),
            input: Template::new(),
        }
    }

    /// Set an input field
    pub fn input(mut self, field: impl Into<String>, term: impl Into<Term>) -> Self {
        self.input = self.input.field(field, term);
        self
    }

    /// Concrete input for `frame`, or `None` when a variable is unbound.
    pub fn resolve(&self, frame: &Frame) -> Option<Fields> {
        self.input.resolve(frame)
    }

    /// `Component.action`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.component, self.action)
    }
}

/// Find every consistent assignment of records to `patterns` that uses `record`.
///
/// `record` is tried at each pattern position it matches; the remaining
/// positions are filled from `history`, restricted to records older than
/// `record` so each combination is produced exactly once across a flow.
/// No record fills two positions of the same assignment.
pub fn join(patterns: &[ActionPattern], record: &ActionRecord, history: &[ActionRecord]) -> Vec<Frame> {
    let earlier: Vec<&ActionRecord> = history.iter().filter(|r| r.seq < record.seq).collect();
    let mut frames = Vec::new();

    for (seed, pattern) in patterns.iter().enumerate() {
        let Some(frame) = match_record(pattern, record) else {
            continue;
        };
        let rest: Vec<&ActionPattern> = patterns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != seed)
            .map(|(_, p)| p)
            .collect();
        let mut used = vec![false; earlier.len()];
        extend_join(&rest, &earlier, &mut used, frame, &mut frames);
    }

    frames
}

fn extend_join(
    patterns: &[&ActionPattern],
    history: &[&ActionRecord],
    used: &mut [bool],
    frame: Frame,
    out: &mut Vec<Frame>,
) {
    let Some((pattern, rest)) = patterns.split_first() else {
        out.push(frame);
        return;
    };

    for (i, candidate) in history.iter().enumerate() {
        if used[i] {
            continue;
        }
        if let Some(next) = pattern.matches(&frame, candidate) {
            used[i] = true;
            extend_join(rest, history, used, next, out);
            used[i] = false;
        }
    }
}
