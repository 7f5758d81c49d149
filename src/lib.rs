//! # Synapse Sync
//!
//! A declarative synchronization engine. Independent components perform
//! named actions; rules react to completed actions, refine the match through
//! filters and asynchronous lookups, and dispatch further actions. No
//! component ever calls another directly.
//!
//! ## Architecture
//!
//! ```text
//! Submission -> Engine -> ActionLog -> rule index -> when/where/then -> Component
//!                  ^                                                        |
//!                  +------------------- new action record ------------------+
//! ```
//!
//! ## Modules
//!
//! - [`frame`]: variables, terms and immutable binding frames
//! - [`action`]: action records and field maps
//! - [`pattern`]: templates, trigger patterns, invocations and the multi-pattern join
//! - [`frameset`]: the filter / map / query / absent frame algebra
//! - [`component`]: the component contract and registry
//! - [`adapter`]: query adapters feeding `query` stages
//! - [`rule`]: sync rules, their builder and registration checks
//! - [`log`]: the append-only action record log
//! - [`engine`]: the dispatch engine and flow reports
//! - [`feed`]: the channel-fed serve loop
//! - [`config`]: TOML configuration
//! - [`shutdown`]: graceful shutdown

pub mod action;
pub mod adapter;
pub mod component;
pub mod config;
pub mod engine;
pub mod feed;
pub mod frame;
pub mod frameset;
pub mod log;
pub mod pattern;
pub mod rule;
pub mod shutdown;

// Re-export commonly used types at crate root
pub use action::{ActionRecord, Fields, FlowId};
pub use adapter::{QueryAdapter, QuerySource};
pub use component::{Component, ComponentError, ComponentRegistry, ComponentSignature};
pub use config::EngineConfig;
pub use engine::{Defect, Engine, EngineError, FlowReport};
pub use feed::{ActionFeed, Submission};
pub use frame::{lit, var, Frame, Term, Var};
pub use pattern::{ActionInvocation, ActionPattern, Template};
pub use rule::{RegistrationError, SyncRule};
