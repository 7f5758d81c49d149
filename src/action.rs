//! Action records.
//!
//! An [`ActionRecord`] is the immutable fact that a component finished one
//! action or query. Records are the only thing rules observe: the engine
//! appends one for every invocation it performs and feeds it back to the
//! matcher.
//!
//! # Output shapes
//!
//! Outputs are tagged by which fields are present, never by failing:
//!
//! ```text
//! success | {"user": "U1"}
//! error   | {"error": "expired"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field map used for action inputs and outputs.
pub type Fields = Map<String, Value>;

/// Field whose presence marks an output as error-shaped.
pub const ERROR_FIELD: &str = "error";

/// Identity of one cascade, shared by every record it produces.
pub type FlowId = Uuid;

/// An immutable, timestamped fact: one completed action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    /// Position in the engine's append-only log
    pub seq: u64,

    /// Cascade this record belongs to
    pub flow: FlowId,

    /// Record whose rule dispatch caused this one (`None` for the root)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,

    /// Distance from the root record of the flow
    pub depth: u32,

    /// Component that performed the action
    pub component: String,

    /// Action (or query) name
    pub action: String,

    /// Input the action was invoked with
    pub input: Fields,

    /// Output the action produced
    pub output: Fields,

    /// When the action completed
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    /// Whether the output is error-shaped
    pub fn is_error(&self) -> bool {
        self.output.contains_key(ERROR_FIELD)
    }

    /// The error message of an error-shaped output
    pub fn error_message(&self) -> Option<&str> {
        self.output.get(ERROR_FIELD).and_then(Value::as_str)
    }

    /// `Component.action`, used in log lines
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.component, self.action)
    }
}

/// Build an error-shaped output from a message.
pub fn error_output(message: impl Into<String>) -> Fields {
    let mut fields = Fields::new();
    fields.insert(ERROR_FIELD.to_string(), Value::String(message.into()));
    fields
}

/// Convert a JSON object literal into [`Fields`].
///
/// Non-object values produce an empty map.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}
