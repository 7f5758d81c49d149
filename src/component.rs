//! Component contract.
//!
//! Components are the independent modules the engine coordinates. The engine
//! never looks inside one: it only invokes named actions and queries and
//! records what came back. Each component publishes a [`ComponentSignature`]
//! so rules can be checked against real field names once, at startup.
//!
//! ## Implementing a component
//!
//! ```rust,ignore
//! use synapse_sync::component::*;
//! use synapse_sync::action::{fields, Fields};
//! use async_trait::async_trait;
//! use serde_json::json;
//!
//! struct Auth;
//!
//! #[async_trait]
//! impl Component for Auth {
//!     fn name(&self) -> &str {
//!         "Auth"
//!     }
//!
//!     fn signature(&self) -> ComponentSignature {
//!         ComponentSignature::new()
//!             .action(ActionSignature::new("verify", ["token"]).shape(["user"]).error_shape())
//!     }
//!
//!     async fn perform(&self, action: &str, input: &Fields) -> Result<Fields, ComponentError> {
//!         match action {
//!             "verify" => Ok(fields(json!({"user": "U1"}))),
//!             _ => Err(ComponentError::UnknownAction(action.to_string())),
//!         }
//!     }
//! }
//! ```

use crate::action::{Fields, ERROR_FIELD};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failures a component reports instead of an output.
///
/// The engine turns these into error-shaped outputs; they never escape it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComponentError {
    /// Action name not implemented by the component
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Query name not implemented by the component
    #[error("unknown query: {0}")]
    UnknownQuery(String),

    /// Input did not carry a field the action needs
    #[error("missing input field: {0}")]
    MissingInput(String),

    /// Generic failure inside the component
    #[error("{0}")]
    Failed(String),
}

/// Input and output contract of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSignature {
    /// Action name
    pub name: String,

    /// Input field names
    pub input: Vec<String>,

    /// Output shapes; an output carries exactly the fields of one shape
    pub outputs: Vec<Vec<String>>,
}

impl ActionSignature {
    /// An action taking the given input fields, with no output shapes yet
    pub fn new<I, S>(name: impl Into<String>, input: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            input: input.into_iter().map(Into::into).collect(),
            outputs: Vec::new(),
        }
    }

    /// Add an output shape
    pub fn shape<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.push(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Add the standard `{error}` output shape
    pub fn error_shape(self) -> Self {
        self.shape([ERROR_FIELD])
    }

    /// Whether all `fields` fit inside a single output shape
    pub fn fits_one_shape(&self, fields: &[&str]) -> bool {
        fields.is_empty()
            || self
                .outputs
                .iter()
                .any(|shape| fields.iter().all(|f| shape.iter().any(|s| s == f)))
    }
}

/// Input and row contract of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySignature {
    /// Query name
    pub name: String,

    /// Input field names
    pub input: Vec<String>,

    /// Fields present on every result row
    pub output: Vec<String>,
}

impl QuerySignature {
    /// A query from `input` fields to rows carrying `output` fields
    pub fn new<I, O, S, T>(name: impl Into<String>, input: I, output: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            input: input.into_iter().map(Into::into).collect(),
            output: output.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `fields` fit a result row, or the `{error}` row a failed
    /// lookup produces
    pub fn fits_row(&self, fields: &[&str]) -> bool {
        fields.iter().all(|f| self.output.iter().any(|o| o == f))
            || fields.iter().all(|f| *f == ERROR_FIELD)
    }
}

/// Every action and query a component exposes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentSignature {
    /// Actions, in declaration order
    pub actions: Vec<ActionSignature>,

    /// Queries, in declaration order
    pub queries: Vec<QuerySignature>,
}

impl ComponentSignature {
    /// An empty signature
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an action
    pub fn action(mut self, action: ActionSignature) -> Self {
        self.actions.push(action);
        self
    }

    /// Declare a query
    pub fn query(mut self, query: QuerySignature) -> Self {
        self.queries.push(query);
        self
    }

    /// Look up an action by name
    pub fn find_action(&self, name: &str) -> Option<&ActionSignature> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Look up a query by name
    pub fn find_query(&self, name: &str) -> Option<&QuerySignature> {
        self.queries.iter().find(|q| q.name == name)
    }
}

/// An independently implemented module exposing named actions and queries.
///
/// Outputs are tagged by shape (which fields are present). Returning `Err`
/// is reserved for "could not produce an output at all"; the engine records
/// it as an `{error}` output.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique component name (e.g. "Auth", "Requesting")
    fn name(&self) -> &str;

    /// Actions and queries this component exposes
    fn signature(&self) -> ComponentSignature;

    /// Perform a named action.
    async fn perform(&self, action: &str, input: &Fields) -> Result<Fields, ComponentError>;

    /// Run a named query, returning zero or more rows.
    async fn query(&self, query: &str, _input: &Fields) -> Result<Vec<Fields>, ComponentError> {
        Err(ComponentError::UnknownQuery(query.to_string()))
    }
}

/// Registry of components by name, with their signatures cached at insert.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: HashMap<String, (Arc<dyn Component>, ComponentSignature)>,
}

impl ComponentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, replacing any component with the same name
    pub fn register(&mut self, component: Arc<dyn Component>) {
        let signature = component.signature();
        self.components
            .insert(component.name().to_string(), (component, signature));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, component: Arc<dyn Component>) -> Self {
        self.register(component);
        self
    }

    /// Get a component by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.get(name).map(|(c, _)| c.clone())
    }

    /// Get a component's signature by name
    pub fn signature(&self, name: &str) -> Option<&ComponentSignature> {
        self.components.get(name).map(|(_, s)| s)
    }

    /// List all registered component names
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.components.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered components
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether no component is registered
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
