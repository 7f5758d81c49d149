//! In-memory components and a small notes application used by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use synapse_sync::action::{error_output, fields, Fields};
use synapse_sync::adapter::QuerySource;
use synapse_sync::component::{
    ActionSignature, Component, ComponentError, ComponentRegistry, ComponentSignature,
    QuerySignature,
};
use synapse_sync::frame::{lit, var, Frame};
use synapse_sync::pattern::{ActionInvocation, ActionPattern, Template};
use synapse_sync::rule::{has_field, SyncRule};

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn required<'a>(input: &'a Fields, field: &str) -> Result<&'a Value, ComponentError> {
    input
        .get(field)
        .ok_or_else(|| ComponentError::MissingInput(field.to_string()))
}

/// Token verification.
pub struct Auth;

#[async_trait]
impl Component for Auth {
    fn name(&self) -> &str {
        "Auth"
    }

    fn signature(&self) -> ComponentSignature {
        ComponentSignature::new()
            .action(ActionSignature::new("verify", ["token"]).shape(["user"]).error_shape())
    }

    async fn perform(&self, action: &str, input: &Fields) -> Result<Fields, ComponentError> {
        if action != "verify" {
            return Err(ComponentError::UnknownAction(action.to_string()));
        }
        let output = match required(input, "token")?.as_str() {
            Some("T1") => fields(json!({"user": "U1"})),
            Some("T2") => fields(json!({"user": "U2"})),
            Some("expired") => error_output("expired"),
            _ => error_output("invalid token"),
        };
        Ok(output)
    }
}

/// Note storage.
#[derive(Default)]
pub struct Store {
    next_id: AtomicU64,
    notes: Mutex<Vec<Fields>>,
}

impl Store {
    pub fn seed(&self, owner: &str, id: &str, title: &str) {
        self.notes
            .lock()
            .unwrap()
            .push(fields(json!({"id": id, "owner": owner, "title": title})));
    }

    pub fn notes(&self) -> Vec<Fields> {
        self.notes.lock().unwrap().clone()
    }

    fn find(&self, user: &Value, id: &Value) -> Vec<Fields> {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.get("owner") == Some(user) && n.get("id") == Some(id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Component for Store {
    fn name(&self) -> &str {
        "Store"
    }

    fn signature(&self) -> ComponentSignature {
        ComponentSignature::new()
            .action(
                ActionSignature::new("create", ["owner", "title"])
                    .shape(["id"])
                    .error_shape(),
            )
            .action(
                ActionSignature::new("get", ["user", "id"])
                    .shape(["id", "title"])
                    .error_shape(),
            )
            .action(ActionSignature::new("touch", ["id"]).shape(["id"]))
            .query(QuerySignature::new("find", ["user", "id"], ["id", "owner", "title"]))
            .query(QuerySignature::new("list", ["user"], ["id", "owner", "title"]))
    }

    async fn perform(&self, action: &str, input: &Fields) -> Result<Fields, ComponentError> {
        match action {
            "create" => {
                let owner = required(input, "owner")?.clone();
                let title = required(input, "title")?.as_str().unwrap_or_default().to_string();
                if title.is_empty() {
                    return Err(ComponentError::Failed("title must not be empty".to_string()));
                }
                let id = format!("N{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                self.notes
                    .lock()
                    .unwrap()
                    .push(fields(json!({"id": id, "owner": owner, "title": title})));
                Ok(fields(json!({"id": id})))
            }
            "get" => {
                let rows = self.find(required(input, "user")?, required(input, "id")?);
                Ok(match rows.first() {
                    Some(note) => fields(json!({"id": note["id"], "title": note["title"]})),
                    None => error_output("note not found"),
                })
            }
            "touch" => Ok(fields(json!({"id": required(input, "id")?}))),
            other => Err(ComponentError::UnknownAction(other.to_string())),
        }
    }

    async fn query(&self, query: &str, input: &Fields) -> Result<Vec<Fields>, ComponentError> {
        match query {
            "find" => {
                let user = required(input, "user")?;
                if user == "broken" {
                    return Err(ComponentError::Failed("store offline".to_string()));
                }
                Ok(self.find(user, required(input, "id")?))
            }
            "list" => {
                let user = required(input, "user")?;
                Ok(self
                    .notes()
                    .into_iter()
                    .filter(|n| n.get("owner") == Some(user))
                    .collect())
            }
            other => Err(ComponentError::UnknownQuery(other.to_string())),
        }
    }
}

/// The request/response boundary.
#[derive(Default)]
pub struct Requesting {
    next_id: AtomicU64,
    responses: Mutex<Vec<Fields>>,
}

impl Requesting {
    pub fn responses(&self) -> Vec<Fields> {
        self.responses.lock().unwrap().clone()
    }
}

#[async_trait]
impl Component for Requesting {
    fn name(&self) -> &str {
        "Requesting"
    }

    fn signature(&self) -> ComponentSignature {
        ComponentSignature::new()
            .action(
                ActionSignature::new("request", ["path", "token", "title", "user", "id"])
                    .shape(["request"]),
            )
            .action(ActionSignature::new("respond", ["request", "body"]).shape(["ok"]))
    }

    async fn perform(&self, action: &str, input: &Fields) -> Result<Fields, ComponentError> {
        match action {
            "request" => {
                let id = format!("R{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                Ok(fields(json!({"request": id})))
            }
            "respond" => {
                self.responses.lock().unwrap().push(input.clone());
                Ok(fields(json!({"ok": true})))
            }
            other => Err(ComponentError::UnknownAction(other.to_string())),
        }
    }
}

/// Handles on the fake components, kept for assertions.
pub struct Fakes {
    pub auth: Arc<Auth>,
    pub store: Arc<Store>,
    pub requesting: Arc<Requesting>,
}

impl Fakes {
    pub fn new() -> Self {
        init_tracing();
        Self {
            auth: Arc::new(Auth),
            store: Arc::new(Store::default()),
            requesting: Arc::new(Requesting::default()),
        }
    }

    pub fn registry(&self) -> ComponentRegistry {
        ComponentRegistry::new()
            .with(self.auth.clone())
            .with(self.store.clone())
            .with(self.requesting.clone())
    }
}

pub fn create_request() -> ActionPattern {
    ActionPattern::new("Requesting", "request")
        .input("path", lit("/notes/create"))
        .input("token", var("t"))
        .input("title", var("title"))
        .output("request", var("r"))
}

pub fn get_request() -> ActionPattern {
    ActionPattern::new("Requesting", "request")
        .input("path", lit("/notes/get"))
        .input("user", var("u"))
        .input("id", var("id"))
        .output("request", var("r"))
}

pub fn respond() -> ActionInvocation {
    ActionInvocation::new("Requesting", "respond")
        .input("request", var("r"))
        .input("body", var("body"))
}

fn bound(frame: &Frame, name: &str) -> Value {
    frame.get(&var(name)).cloned().unwrap_or(Value::Null)
}

/// `body = {key: ?var}`
fn body(key: &'static str, from: &'static str) -> impl Fn(&Frame) -> Vec<(synapse_sync::Var, Value)> + Send + Sync {
    move |frame| vec![(var("body"), json!({ key: bound(frame, from) }))]
}

/// Create / fetch notes behind a token check.
pub fn note_rules() -> Vec<SyncRule> {
    vec![
        SyncRule::builder("AuthenticateCreate")
            .when(create_request())
            .then(ActionInvocation::new("Auth", "verify").input("token", var("t")))
            .build(),
        SyncRule::builder("CreateWhenAuthenticated")
            .when(create_request())
            .when(
                ActionPattern::new("Auth", "verify")
                    .input("token", var("t"))
                    .bind_output(var("verified")),
            )
            .filter(has_field(var("verified"), "user"))
            .map([var("u")], |frame| {
                let user = frame
                    .get(&var("verified"))
                    .and_then(|v| v.get("user"))
                    .cloned()
                    .unwrap_or(Value::Null);
                vec![(var("u"), user)]
            })
            .then(
                ActionInvocation::new("Store", "create")
                    .input("owner", var("u"))
                    .input("title", var("title")),
            )
            .build(),
        SyncRule::builder("RejectUnauthenticated")
            .when(create_request())
            .when(
                ActionPattern::new("Auth", "verify")
                    .input("token", var("t"))
                    .output("error", var("e")),
            )
            .map([var("body")], body("error", "e"))
            .then(respond())
            .build(),
        SyncRule::builder("RespondCreated")
            .when(create_request())
            .when(
                ActionPattern::new("Store", "create")
                    .input("title", var("title"))
                    .output("id", var("id")),
            )
            .map([var("body")], body("id", "id"))
            .then(respond())
            .build(),
        SyncRule::builder("RespondCreateFailed")
            .when(create_request())
            .when(
                ActionPattern::new("Store", "create")
                    .input("title", var("title"))
                    .output("error", var("e")),
            )
            .map([var("body")], body("error", "e"))
            .then(respond())
            .build(),
        SyncRule::builder("FetchNote")
            .when(get_request())
            .query(
                QuerySource::query("Store", "find"),
                Template::new().field("user", var("u")).field("id", var("id")),
                Template::new().field("title", var("title")),
            )
            .map([var("body")], body("title", "title"))
            .then(respond())
            .build(),
        SyncRule::builder("NoteNotFound")
            .when(get_request())
            .query(
                QuerySource::action("Store", "get"),
                Template::new().field("user", var("u")).field("id", var("id")),
                Template::new().field("error", var("e")),
            )
            .map([var("body")], body("error", "e"))
            .then(respond())
            .build(),
    ]
}
