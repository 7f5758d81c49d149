//! Synchronization rules.
//!
//! A [`SyncRule`] is a named `when / where / then` triple:
//!
//! ```text
//! when   Auth.verify {token: ?t} => {user: ?u}        trigger patterns
//! where  filter / map / query / absent stages          refinement pipeline
//! then   Store.create {owner: ?u}                     consequence invocations
//! ```
//!
//! Rules are built once at startup and checked against the component
//! signatures before the engine accepts them. Anything a rule names that
//! cannot exist is a [`RegistrationError`].
//!
//! # Example
//!
//! ```rust
//! use synapse_sync::frame::var;
//! use synapse_sync::pattern::{ActionInvocation, ActionPattern};
//! use synapse_sync::rule::SyncRule;
//!
//! let rule = SyncRule::builder("CreateOnVerify")
//!     .when(ActionPattern::new("Auth", "verify").output("user", var("u")))
//!     .then(ActionInvocation::new("Store", "create").input("owner", var("u")))
//!     .build();
//!
//! assert_eq!(rule.name, "CreateOnVerify");
//! ```

use crate::action::ERROR_FIELD;
use crate::adapter::QuerySource;
use crate::component::{ActionSignature, ComponentRegistry, ComponentSignature, QuerySignature};
use crate::frame::{Frame, Var};
use crate::pattern::{ActionInvocation, ActionPattern, Template};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Pure per-frame predicate used by `filter` stages.
pub type Predicate = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Pure per-frame transform used by `map` stages; returns bindings to set.
pub type Transform = Arc<dyn Fn(&Frame) -> Vec<(Var, Value)> + Send + Sync>;

/// Rule definitions that can never work.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// A rule with no trigger pattern can never fire
    #[error("rule '{rule}' has no trigger pattern")]
    NoTrigger { rule: String },

    /// Two rules share a name
    #[error("duplicate rule name '{0}'")]
    DuplicateRule(String),

    /// Component is not registered
    #[error("rule '{rule}' references unknown component '{component}'")]
    UnknownComponent { rule: String, component: String },

    /// Component does not declare the action
    #[error("rule '{rule}' references unknown action '{component}.{action}'")]
    UnknownAction {
        rule: String,
        component: String,
        action: String,
    },

    /// Component does not declare the query
    #[error("rule '{rule}' references unknown query '{component}.{query}'")]
    UnknownQuery {
        rule: String,
        component: String,
        query: String,
    },

    /// Template names a field the signature does not have
    #[error("rule '{rule}' uses unknown field '{field}' in {target}")]
    UnknownField {
        rule: String,
        target: String,
        field: String,
    },

    /// Output template mixes fields of different output shapes
    #[error("rule '{rule}' expects output fields {fields:?} of {target}, which no single output shape carries")]
    ImpossibleOutput {
        rule: String,
        target: String,
        fields: Vec<String>,
    },

    /// Invocation leaves out a required input field
    #[error("rule '{rule}' omits required field '{field}' in {target}")]
    MissingField {
        rule: String,
        target: String,
        field: String,
    },
}

/// One refinement stage.
#[derive(Clone)]
pub enum Stage {
    /// Keep frames satisfying the predicate
    Filter(Predicate),

    /// Add or overwrite bindings; `binds` lists the variables it may set
    Map {
        /// Variables the transform may bind
        binds: Vec<Var>,
        /// The transform
        transform: Transform,
    },

    /// Expand frames through a lookup, unifying rows against `output`
    Query {
        /// Row source
        source: QuerySource,
        /// Input resolved per frame
        input: Template,
        /// Template each row is unified against
        output: Template,
    },

    /// Keep frames for which the lookup finds nothing
    Absent {
        /// Row source
        source: QuerySource,
        /// Input resolved per frame
        input: Template,
    },
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Filter(_) => write!(f, "filter"),
            Stage::Map { binds, .. } => write!(f, "map -> {binds:?}"),
            Stage::Query {
                source,
                input,
                output,
            } => write!(f, "query {source:?} {input:?} -> {output:?}"),
            Stage::Absent { source, input } => write!(f, "absent {source:?} {input:?}"),
        }
    }
}

impl Stage {
    /// Variables this stage can introduce into a frame
    pub fn binds(&self) -> Vec<&Var> {
        match self {
            Stage::Filter(_) | Stage::Absent { .. } => Vec::new(),
            Stage::Map { binds, .. } => binds.iter().collect(),
            Stage::Query { output, .. } => output.vars().collect(),
        }
    }
}

/// A named trigger / refine / consequence triple.
#[derive(Debug, Clone)]
pub struct SyncRule {
    /// Unique rule name
    pub name: String,

    /// Patterns that must all be matched, one record each
    pub trigger: Vec<ActionPattern>,

    /// Refinement stages, run in order
    pub refine: Vec<Stage>,

    /// Invocations issued for every surviving frame
    pub consequence: Vec<ActionInvocation>,
}

impl SyncRule {
    /// Start building a rule
    pub fn builder(name: impl Into<String>) -> SyncRuleBuilder {
        SyncRuleBuilder {
            rule: SyncRule {
                name: name.into(),
                trigger: Vec::new(),
                refine: Vec::new(),
                consequence: Vec::new(),
            },
        }
    }

    /// Whether any trigger pattern can reference `component.action`
    pub fn triggered_by(&self, component: &str, action: &str) -> bool {
        self.trigger.iter().any(|p| p.targets(component, action))
    }

    /// Every variable the trigger and refinement stages can bind
    pub fn bindable_vars(&self) -> BTreeSet<&Var> {
        self.trigger
            .iter()
            .flat_map(|p| p.vars())
            .chain(self.refine.iter().flat_map(|s| s.binds()))
            .collect()
    }

    /// Consequence variables that nothing in the rule can bind.
    ///
    /// Invocations using them are skipped for every frame.
    pub fn unbindable_vars(&self) -> Vec<&Var> {
        let bindable = self.bindable_vars();
        let mut missing: Vec<&Var> = self
            .consequence
            .iter()
            .flat_map(|inv| inv.input.vars())
            .filter(|v| !bindable.contains(v))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Check every name the rule uses against the registered components.
    pub fn validate(&self, registry: &ComponentRegistry) -> Result<(), RegistrationError> {
        if self.trigger.is_empty() {
            return Err(RegistrationError::NoTrigger {
                rule: self.name.clone(),
            });
        }

        for pattern in &self.trigger {
            let action = self.action_signature(registry, &pattern.component, &pattern.action)?;
            let target = format!("trigger {}", pattern.qualified_name());
            self.check_known_fields(&target, &pattern.input, &action.input)?;
            self.check_output_shape(&target, &pattern.output, action)?;
        }

        for stage in &self.refine {
            match stage {
                Stage::Query {
                    source,
                    input,
                    output,
                } => self.check_source(registry, source, input, Some(output))?,
                Stage::Absent { source, input } => self.check_source(registry, source, input, None)?,
                Stage::Filter(_) | Stage::Map { .. } => {}
            }
        }

        for invocation in &self.consequence {
            let action =
                self.action_signature(registry, &invocation.component, &invocation.action)?;
            let target = format!("consequence {}", invocation.qualified_name());
            self.check_known_fields(&target, &invocation.input, &action.input)?;
            self.check_required_fields(&target, &invocation.input, &action.input)?;
        }

        Ok(())
    }

    fn component_signature<'a>(
        &self,
        registry: &'a ComponentRegistry,
        component: &str,
    ) -> Result<&'a ComponentSignature, RegistrationError> {
        registry
            .signature(component)
            .ok_or_else(|| RegistrationError::UnknownComponent {
                rule: self.name.clone(),
                component: component.to_string(),
            })
    }

    fn action_signature<'a>(
        &self,
        registry: &'a ComponentRegistry,
        component: &str,
        action: &str,
    ) -> Result<&'a ActionSignature, RegistrationError> {
        self.component_signature(registry, component)?
            .find_action(action)
            .ok_or_else(|| RegistrationError::UnknownAction {
                rule: self.name.clone(),
                component: component.to_string(),
                action: action.to_string(),
            })
    }

    fn check_source(
        &self,
        registry: &ComponentRegistry,
        source: &QuerySource,
        input: &Template,
        output: Option<&Template>,
    ) -> Result<(), RegistrationError> {
        match source {
            QuerySource::Query { component, query } => {
                let signature = self
                    .component_signature(registry, component)?
                    .find_query(query)
                    .ok_or_else(|| RegistrationError::UnknownQuery {
                        rule: self.name.clone(),
                        component: component.clone(),
                        query: query.clone(),
                    })?;
                let target = format!("query {component}.{query}");
                self.check_known_fields(&target, input, &signature.input)?;
                self.check_required_fields(&target, input, &signature.input)?;
                if let Some(output) = output {
                    self.check_row_shape(&target, output, signature)?;
                }
            }
            QuerySource::Action { component, action } => {
                let signature = self.action_signature(registry, component, action)?;
                let target = format!("lookup {component}.{action}");
                self.check_known_fields(&target, input, &signature.input)?;
                self.check_required_fields(&target, input, &signature.input)?;
                if let Some(output) = output {
                    self.check_output_shape(&target, output, signature)?;
                }
            }
            QuerySource::Adapter(_) => {}
        }
        Ok(())
    }

    fn check_known_fields(
        &self,
        target: &str,
        template: &Template,
        declared: &[String],
    ) -> Result<(), RegistrationError> {
        match template
            .field_names()
            .find(|field| !declared.iter().any(|d| d == field))
        {
            Some(field) => Err(RegistrationError::UnknownField {
                rule: self.name.clone(),
                target: target.to_string(),
                field: field.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn check_required_fields(
        &self,
        target: &str,
        template: &Template,
        declared: &[String],
    ) -> Result<(), RegistrationError> {
        match declared
            .iter()
            .find(|d| !template.field_names().any(|f| f == d.as_str()))
        {
            Some(field) => Err(RegistrationError::MissingField {
                rule: self.name.clone(),
                target: target.to_string(),
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_row_shape(
        &self,
        target: &str,
        template: &Template,
        signature: &QuerySignature,
    ) -> Result<(), RegistrationError> {
        let fields: Vec<&str> = template.field_names().collect();
        if signature.fits_row(&fields) {
            return Ok(());
        }

        if let Some(field) = fields
            .iter()
            .copied()
            .find(|f| *f != ERROR_FIELD && !signature.output.iter().any(|o| o == f))
        {
            return Err(RegistrationError::UnknownField {
                rule: self.name.clone(),
                target: target.to_string(),
                field: field.to_string(),
            });
        }
        Err(RegistrationError::ImpossibleOutput {
            rule: self.name.clone(),
            target: target.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        })
    }

    fn check_output_shape(
        &self,
        target: &str,
        template: &Template,
        signature: &ActionSignature,
    ) -> Result<(), RegistrationError> {
        let fields: Vec<&str> = template.field_names().collect();
        if signature.fits_one_shape(&fields) {
            return Ok(());
        }

        // Distinguish a misspelled field from a mix of shapes
        if let Some(field) = fields
            .iter()
            .copied()
            .find(|f| !signature.outputs.iter().flatten().any(|s| s == f))
        {
            return Err(RegistrationError::UnknownField {
                rule: self.name.clone(),
                target: target.to_string(),
                field: field.to_string(),
            });
        }
        Err(RegistrationError::ImpossibleOutput {
            rule: self.name.clone(),
            target: target.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        })
    }
}

/// Builder for [`SyncRule`].
pub struct SyncRuleBuilder {
    rule: SyncRule,
}

impl SyncRuleBuilder {
    /// Add a trigger pattern
    pub fn when(mut self, pattern: ActionPattern) -> Self {
        self.rule.trigger.push(pattern);
        self
    }

    /// Add a `filter` stage
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        self.rule.refine.push(Stage::Filter(Arc::new(predicate)));
        self
    }

    /// Add a `map` stage that may bind the listed variables
    pub fn map<F>(mut self, binds: impl IntoIterator<Item = Var>, transform: F) -> Self
    where
        F: Fn(&Frame) -> Vec<(Var, Value)> + Send + Sync + 'static,
    {
        self.rule.refine.push(Stage::Map {
            binds: binds.into_iter().collect(),
            transform: Arc::new(transform),
        });
        self
    }

    /// Add a `query` stage
    pub fn query(mut self, source: QuerySource, input: Template, output: Template) -> Self {
        self.rule.refine.push(Stage::Query {
            source,
            input,
            output,
        });
        self
    }

    /// Add an `absent` stage
    pub fn absent(mut self, source: QuerySource, input: Template) -> Self {
        self.rule.refine.push(Stage::Absent { source, input });
        self
    }

    /// Add a consequence invocation
    pub fn then(mut self, invocation: ActionInvocation) -> Self {
        self.rule.consequence.push(invocation);
        self
    }

    /// Finish the rule
    pub fn build(self) -> SyncRule {
        self.rule
    }
}

/// Predicate: the variable is bound to an object carrying `field`.
///
/// Pairs with [`ActionPattern::bind_output`] to branch on output shape.
pub fn has_field(var: Var, field: &'static str) -> impl Fn(&Frame) -> bool + Send + Sync + 'static {
    move |frame| {
        frame
            .get(&var)
            .and_then(Value::as_object)
            .is_some_and(|obj| obj.contains_key(field))
    }
}

/// Predicate: the variable is bound to an object lacking `field`.
pub fn lacks_field(var: Var, field: &'static str) -> impl Fn(&Frame) -> bool + Send + Sync + 'static {
    let has = has_field(var, field);
    move |frame| !has(frame)
}
