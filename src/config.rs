//! Configuration for the synchronization engine.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! max_cascade_depth = 32
//! query_concurrency = 8
//! retain_history = false
//!
//! [boundary]
//! component = "Requesting"
//! request_action = "request"
//! terminal_actions = ["respond"]
//! identity_field = "${SYNC_IDENTITY_FIELD}"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: DispatchConfig,

    #[serde(default)]
    pub boundary: BoundaryConfig,
}

/// Dispatch loop settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Deepest cascade allowed before a branch is aborted
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: u32,

    /// Adapter calls in flight per `query` stage
    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,

    /// Keep a flow's records in the log after it settles
    #[serde(default)]
    pub retain_history: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_cascade_depth: default_max_cascade_depth(),
            query_concurrency: default_query_concurrency(),
            retain_history: false,
        }
    }
}

fn default_max_cascade_depth() -> u32 {
    64
}

fn default_query_concurrency() -> usize {
    16
}

/// The request/response boundary component
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BoundaryConfig {
    #[serde(default = "default_boundary_component")]
    pub component: String,

    /// Action that opens a request
    #[serde(default = "default_request_action")]
    pub request_action: String,

    /// Actions that answer a request
    #[serde(default = "default_terminal_actions")]
    pub terminal_actions: Vec<String>,

    /// Field carrying the request identity, in the request output and the
    /// terminal action input
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            component: default_boundary_component(),
            request_action: default_request_action(),
            terminal_actions: default_terminal_actions(),
            identity_field: default_identity_field(),
        }
    }
}

fn default_boundary_component() -> String {
    "Requesting".to_string()
}

fn default_request_action() -> String {
    "request".to_string()
}

fn default_terminal_actions() -> Vec<String> {
    vec!["respond".to_string()]
}

fn default_identity_field() -> String {
    "request".to_string()
}

impl BoundaryConfig {
    /// Whether `component.action` answers a request
    pub fn is_terminal(&self, component: &str, action: &str) -> bool {
        self.component == component && self.terminal_actions.iter().any(|a| a == action)
    }

    /// Whether `component.action` opens a request
    pub fn is_request(&self, component: &str, action: &str) -> bool {
        self.component == component && self.request_action == action
    }
}

impl EngineConfig {
    /// Load configuration from the default path or SYNC_ENGINE_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("SYNC_ENGINE_CONFIG").unwrap_or_else(|_| "config/sync.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!(
            max_cascade_depth = config.engine.max_cascade_depth,
            query_concurrency = config.engine.query_concurrency,
            boundary = %config.boundary.component,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: EngineConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Builder-style override of the cascade depth limit
    pub fn with_max_cascade_depth(mut self, depth: u32) -> Self {
        self.engine.max_cascade_depth = depth;
        self
    }

    /// Builder-style override of history retention
    pub fn with_retain_history(mut self, retain: bool) -> Self {
        self.engine.retain_history = retain;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_cascade_depth == 0 {
            return Err(ConfigError::ValidationError(
                "max_cascade_depth must be greater than zero".to_string(),
            ));
        }

        if self.engine.query_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "query_concurrency must be greater than zero".to_string(),
            ));
        }

        if self.boundary.component.is_empty() {
            return Err(ConfigError::ValidationError(
                "boundary component must not be empty".to_string(),
            ));
        }

        if self.boundary.terminal_actions.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Boundary '{}' must declare at least one terminal action",
                self.boundary.component
            )));
        }

        if self.boundary.identity_field.contains("${") {
            return Err(ConfigError::ValidationError(format!(
                "Boundary identity field '{}' contains an unsubstituted environment variable",
                self.boundary.identity_field
            )));
        }

        Ok(())
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
