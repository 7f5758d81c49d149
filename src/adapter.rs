//! Query adapters.
//!
//! A `query` refinement stage hands each frame's resolved input to a
//! [`QueryAdapter`] and gets back zero or more rows. Rules name their source
//! with a [`QuerySource`]; component-backed sources are checked and resolved
//! against the [`ComponentRegistry`] when the engine is built.
//!
//! ```text
//! QuerySource::query("Store", "byOwner")    -> ComponentQuery   (rows as returned)
//! QuerySource::action("Auth", "verify")     -> ComponentAction  (one row: the output)
//! QuerySource::adapter(Arc::new(FnAdapter)) -> used as is       (pure computation)
//! ```

use crate::action::Fields;
use crate::component::{Component, ComponentError, ComponentRegistry};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// How calls through an adapter show up in the action record feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// A component action; the record output is the single row
    Action,

    /// A component query; the record output is `{"rows": [...]}`
    Query,
}

/// The component operation behind an adapter, for the record feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTarget {
    /// Component name
    pub component: String,

    /// Action or query name
    pub name: String,

    /// Record shape
    pub kind: FeedKind,
}

/// An external asynchronous lookup used by `query` stages.
///
/// Implementations must be safe to call once per frame with no ordering
/// between frames: the engine may run a batch concurrently.
#[async_trait]
pub trait QueryAdapter: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> String;

    /// Look up rows for one resolved input.
    ///
    /// `Ok(vec![])` means "not found". `Err` means the adapter could not
    /// answer and becomes a single `{error}` row.
    async fn call(&self, input: &Fields) -> Result<Vec<Fields>, ComponentError>;

    /// Component operation to record in the action feed, if any
    fn feed_target(&self) -> Option<FeedTarget> {
        None
    }
}

/// A named query of a registered component.
pub struct ComponentQuery {
    component: Arc<dyn Component>,
    query: String,
}

impl ComponentQuery {
    /// Wrap `component`'s query `query`
    pub fn new(component: Arc<dyn Component>, query: impl Into<String>) -> Self {
        Self {
            component,
            query: query.into(),
        }
    }
}

#[async_trait]
impl QueryAdapter for ComponentQuery {
    fn name(&self) -> String {
        format!("{}.{}", self.component.name(), self.query)
    }

    async fn call(&self, input: &Fields) -> Result<Vec<Fields>, ComponentError> {
        self.component.query(&self.query, input).await
    }

    fn feed_target(&self) -> Option<FeedTarget> {
        Some(FeedTarget {
            component: self.component.name().to_string(),
            name: self.query.clone(),
            kind: FeedKind::Query,
        })
    }
}

/// A component action used as a lookup: its output is the only row.
pub struct ComponentAction {
    component: Arc<dyn Component>,
    action: String,
}

impl ComponentAction {
    /// Wrap `component`'s action `action`
    pub fn new(component: Arc<dyn Component>, action: impl Into<String>) -> Self {
        Self {
            component,
            action: action.into(),
        }
    }
}

#[async_trait]
impl QueryAdapter for ComponentAction {
    fn name(&self) -> String {
        format!("{}.{}", self.component.name(), self.action)
    }

    async fn call(&self, input: &Fields) -> Result<Vec<Fields>, ComponentError> {
        self.component
            .perform(&self.action, input)
            .await
            .map(|row| vec![row])
    }

    fn feed_target(&self) -> Option<FeedTarget> {
        Some(FeedTarget {
            component: self.component.name().to_string(),
            name: self.action.clone(),
            kind: FeedKind::Action,
        })
    }
}

/// A pure computation wrapped as an adapter.
pub struct FnAdapter<F> {
    name: String,
    f: F,
}

impl<F> FnAdapter<F>
where
    F: Fn(&Fields) -> Result<Vec<Fields>, ComponentError> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> QueryAdapter for FnAdapter<F>
where
    F: Fn(&Fields) -> Result<Vec<Fields>, ComponentError> + Send + Sync,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn call(&self, input: &Fields) -> Result<Vec<Fields>, ComponentError> {
        (self.f)(input)
    }
}

/// Where a `query` stage gets its rows.
#[derive(Clone)]
pub enum QuerySource {
    /// A named query of a registered component
    Query {
        /// Component name
        component: String,
        /// Query name
        query: String,
    },

    /// A registered component's action, used as a single-row lookup
    Action {
        /// Component name
        component: String,
        /// Action name
        action: String,
    },

    /// Any other adapter
    Adapter(Arc<dyn QueryAdapter>),
}

impl QuerySource {
    /// A component query
    pub fn query(component: impl Into<String>, query: impl Into<String>) -> Self {
        QuerySource::Query {
            component: component.into(),
            query: query.into(),
        }
    }

    /// A component action used as a lookup
    pub fn action(component: impl Into<String>, action: impl Into<String>) -> Self {
        QuerySource::Action {
            component: component.into(),
            action: action.into(),
        }
    }

    /// A free-standing adapter
    pub fn adapter(adapter: Arc<dyn QueryAdapter>) -> Self {
        QuerySource::Adapter(adapter)
    }

    /// Resolve to a callable adapter. `None` if the component is not registered.
    ///
    /// Only the component's existence is checked here; operation and field
    /// names are checked by rule validation.
    pub fn resolve(&self, registry: &ComponentRegistry) -> Option<Arc<dyn QueryAdapter>> {
        match self {
            QuerySource::Query { component, query } => registry
                .get(component)
                .map(|c| Arc::new(ComponentQuery::new(c, query.clone())) as Arc<dyn QueryAdapter>),
            QuerySource::Action { component, action } => registry
                .get(component)
                .map(|c| Arc::new(ComponentAction::new(c, action.clone())) as Arc<dyn QueryAdapter>),
            QuerySource::Adapter(adapter) => Some(adapter.clone()),
        }
    }
}

impl fmt::Debug for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuerySource::Query { component, query } => write!(f, "query {component}.{query}"),
            QuerySource::Action { component, action } => write!(f, "action {component}.{action}"),
            QuerySource::Adapter(adapter) => write!(f, "adapter {}", adapter.name()),
        }
    }
}
