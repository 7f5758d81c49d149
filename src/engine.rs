//! Dispatch Engine - the control loop.
//!
//! The [`Engine`] owns the rule registry, the component registry and the
//! action record log. Every new record is matched against the rules indexed
//! under its `component.action`; surviving frames turn into consequence
//! invocations, whose completions become new records, until nothing matches.
//!
//! # Cascade
//!
//! ```text
//! invoke(Requesting.request)
//!     │
//!     ▼
//! ┌──────────────────────── queue ────────────────────────┐
//! │ record ─► when (join) ─► where (stages) ─► then        │
//! │                                              │         │
//! │          new records (depth + 1) ◄─ perform ─┘         │
//! └────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! FlowReport { records, terminal responses, defects }
//! ```
//!
//! Rules triggered by the same record are evaluated concurrently, and the
//! invocations they produce are performed concurrently. Records are appended
//! and enqueued in rule-registration order, then frame order.
//!
//! # Faults
//!
//! Component failures are outputs, not errors. The engine only reports its
//! own faults, as [`Defect`]s in the [`FlowReport`] plus an `error!` line:
//!
//! - a branch deeper than `max_cascade_depth` is cut off, component lookups included;
//! - a second terminal response for one request identity is flagged;
//! - a request that settles with no terminal response is flagged.

use crate::action::{error_output, ActionRecord, Fields, FlowId};
use crate::adapter::{FeedKind, FeedTarget, QueryAdapter};
use crate::component::{ComponentError, ComponentRegistry};
use crate::config::{BoundaryConfig, ConfigError, EngineConfig};
use crate::frameset::FrameSet;
use crate::log::{ActionLog, NewRecord};
use crate::pattern::{join, Template};
use crate::rule::{Predicate, RegistrationError, Stage, SyncRule, Transform};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors surfaced to whoever drives the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A rule failed validation; the engine refuses to start
    #[error("configuration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Engine configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Submitted action names an unregistered component
    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    /// Submitted action is not in the component's signature
    #[error("unknown action '{component}.{action}'")]
    UnknownAction { component: String, action: String },

    /// The action feed is closed
    #[error("action feed closed")]
    FeedClosed,
}

/// An engine-internal fault observed while running a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Defect {
    /// An invocation (or recorded lookup) would have exceeded the depth limit
    DepthExceeded {
        rule: String,
        invocation: String,
        depth: u32,
    },

    /// A request identity received more than one terminal response
    DuplicateTerminalResponse { rule: String, identity: Value },

    /// A request settled without any terminal response
    NoTerminalResponse { identity: Value },
}

/// Everything one cascade produced.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    /// Flow identity
    pub flow: FlowId,

    /// Records in append order, root first
    pub records: Vec<ActionRecord>,

    /// Engine faults seen during the flow
    pub defects: Vec<Defect>,

    /// Deepest record depth reached
    pub max_depth: u32,

    terminal_seqs: Vec<u64>,
}

impl FlowReport {
    fn new(flow: FlowId) -> Self {
        Self {
            flow,
            records: Vec::new(),
            defects: Vec::new(),
            max_depth: 0,
            terminal_seqs: Vec::new(),
        }
    }

    fn push(&mut self, record: ActionRecord) {
        self.max_depth = self.max_depth.max(record.depth);
        self.records.push(record);
    }

    /// The record that started the flow
    pub fn root(&self) -> Option<&ActionRecord> {
        self.records.first()
    }

    /// Records of `component.action`, in append order
    pub fn records_of(&self, component: &str, action: &str) -> Vec<&ActionRecord> {
        self.records
            .iter()
            .filter(|r| r.component == component && r.action == action)
            .collect()
    }

    /// Number of records of `component.action`
    pub fn count(&self, component: &str, action: &str) -> usize {
        self.records_of(component, action).len()
    }

    /// Terminal responses issued at the boundary
    pub fn terminal_responses(&self) -> Vec<&ActionRecord> {
        self.records
            .iter()
            .filter(|r| self.terminal_seqs.contains(&r.seq))
            .collect()
    }

    /// Whether the flow finished without engine faults
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    /// Whether any branch was cut off by the depth limit
    pub fn depth_exceeded(&self) -> bool {
        self.defects
            .iter()
            .any(|d| matches!(d, Defect::DepthExceeded { .. }))
    }
}

enum CompiledStage {
    Filter(Predicate),
    Map(Transform),
    Query {
        adapter: Arc<dyn QueryAdapter>,
        input: Template,
        output: Template,
    },
    Absent {
        adapter: Arc<dyn QueryAdapter>,
        input: Template,
    },
}

impl CompiledStage {
    /// Component operation a lookup stage performs, if any
    fn feed_target(&self) -> Option<FeedTarget> {
        match self {
            Self::Query { adapter, .. } | Self::Absent { adapter, .. } => adapter.feed_target(),
            Self::Filter(_) | Self::Map(_) => None,
        }
    }
}

struct CompiledRule {
    rule: SyncRule,
    stages: Vec<CompiledStage>,
}

/// A resolved consequence invocation.
struct Dispatch {
    rule: String,
    component: String,
    action: String,
    input: Fields,
}

/// A component lookup made by a `query` stage, to be recorded.
struct Observation {
    rule: String,
    target: FeedTarget,
    input: Fields,
    rows: Vec<Fields>,
}

impl Observation {
    fn output(&self) -> Fields {
        match self.target.kind {
            FeedKind::Action => self.rows.first().cloned().unwrap_or_default(),
            FeedKind::Query => {
                let mut out = Fields::new();
                out.insert("rows".to_string(), json!(self.rows));
                out
            }
        }
    }
}

#[derive(Default)]
struct Evaluation {
    dispatches: Vec<Dispatch>,
    observed: Vec<Observation>,
    /// `(rule, lookup)` pairs cut off by the depth limit
    exceeded: Vec<(String, String)>,
}

/// Drops a flow's records from the log when the flow ends, including when
/// its future is aborted mid-cascade.
struct FlowGuard<'a> {
    log: &'a ActionLog,
    flow: FlowId,
    retain: bool,
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        if !self.retain {
            let discarded = self.log.discard_flow(self.flow);
            debug!(flow = %self.flow, discarded, "Flow records discarded");
        }
    }
}

/// Wraps a stage's adapter so component lookups land in the record feed.
struct Tapped<'a> {
    rule: &'a str,
    inner: &'a dyn QueryAdapter,
    target: Option<FeedTarget>,
    sink: &'a Mutex<Vec<Observation>>,
}

#[async_trait]
impl<'a> QueryAdapter for Tapped<'a> {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn call(&self, input: &Fields) -> Result<Vec<Fields>, ComponentError> {
        let result = self.inner.call(input).await;
        if let Some(target) = &self.target {
            let rows = match &result {
                Ok(rows) => rows.clone(),
                Err(e) => vec![error_output(e.to_string())],
            };
            self.sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Observation {
                    rule: self.rule.to_string(),
                    target: target.clone(),
                    input: input.clone(),
                    rows,
                });
        }
        result
    }
}

/// Tracks boundary requests and their terminal responses within one flow.
#[derive(Default)]
struct TerminalTracker {
    requests: Vec<Value>,
    answered: Vec<Value>,
}

impl TerminalTracker {
    fn observe(
        &mut self,
        boundary: &BoundaryConfig,
        record: &ActionRecord,
        rule: &str,
        report: &mut FlowReport,
    ) {
        let identity_of = |fields: &Fields| fields.get(&boundary.identity_field).cloned();

        if boundary.is_request(&record.component, &record.action) {
            if let Some(identity) = identity_of(&record.output).or_else(|| identity_of(&record.input)) {
                self.requests.push(identity);
            }
        }

        if boundary.is_terminal(&record.component, &record.action) {
            report.terminal_seqs.push(record.seq);
            let identity = identity_of(&record.input).unwrap_or(Value::Null);
            if self.answered.contains(&identity) {
                error!(
                    flow = %record.flow,
                    rule = %rule,
                    identity = %identity,
                    seq = record.seq,
                    "Second terminal response for one request; rule guards are not mutually exclusive"
                );
                report.defects.push(Defect::DuplicateTerminalResponse {
                    rule: rule.to_string(),
                    identity,
                });
            } else {
                self.answered.push(identity);
            }
        }
    }

    fn finish(self, flow: FlowId, report: &mut FlowReport) {
        for identity in self.requests {
            if !self.answered.contains(&identity) {
                warn!(
                    flow = %flow,
                    identity = %identity,
                    "Request settled without a terminal response"
                );
                report.defects.push(Defect::NoTerminalResponse { identity });
            }
        }
    }
}

/// The synchronization engine.
///
/// Built once from an immutable rule list; shared behind `Arc` to run flows
/// concurrently.
pub struct Engine {
    config: EngineConfig,
    components: ComponentRegistry,
    rules: Vec<CompiledRule>,
    index: HashMap<(String, String), Vec<usize>>,
    log: ActionLog,
}

impl Engine {
    /// Validate `rules` against `components` and build the engine.
    ///
    /// Fails on the first configuration error.
    pub fn new(
        config: EngineConfig,
        components: ComponentRegistry,
        rules: Vec<SyncRule>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let mut names = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        let mut index: HashMap<(String, String), Vec<usize>> = HashMap::new();

        for rule in rules {
            if !names.insert(rule.name.clone()) {
                error!(rule = %rule.name, "Duplicate rule name");
                return Err(RegistrationError::DuplicateRule(rule.name).into());
            }

            if let Err(e) = rule.validate(&components) {
                error!(rule = %rule.name, error = %e, "Rule failed validation");
                return Err(e.into());
            }

            let unbindable = rule.unbindable_vars();
            if !unbindable.is_empty() {
                warn!(
                    rule = %rule.name,
                    vars = ?unbindable,
                    "Consequence uses variables nothing in the rule binds; those invocations will be skipped"
                );
            }

            let stages = compile_stages(&rule, &components)?;

            let mut keys: Vec<(String, String)> = rule
                .trigger
                .iter()
                .map(|p| (p.component.clone(), p.action.clone()))
                .collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                index.entry(key).or_default().push(compiled.len());
            }

            debug!(
                rule = %rule.name,
                triggers = rule.trigger.len(),
                stages = rule.refine.len(),
                consequences = rule.consequence.len(),
                "Registered rule"
            );
            compiled.push(CompiledRule { rule, stages });
        }

        info!(
            rules = compiled.len(),
            components = components.len(),
            max_cascade_depth = config.engine.max_cascade_depth,
            "Engine ready"
        );

        Ok(Self {
            config,
            components,
            rules: compiled,
            index,
            log: ActionLog::new(),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered components
    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    /// The shared action record log
    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Registered rule names, in registration order
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.name.as_str()).collect()
    }

    /// Perform `component.action` and run the cascade it triggers.
    pub async fn invoke(
        &self,
        component: &str,
        action: &str,
        input: Fields,
    ) -> Result<FlowReport, EngineError> {
        self.check_action(component, action)?;
        let output = self.perform(component, action, &input).await;
        Ok(self.start_flow(component, action, input, output).await)
    }

    /// Feed an action that already completed outside the engine and run the
    /// cascade it triggers.
    pub async fn observe(
        &self,
        component: &str,
        action: &str,
        input: Fields,
        output: Fields,
    ) -> Result<FlowReport, EngineError> {
        self.check_action(component, action)?;
        Ok(self.start_flow(component, action, input, output).await)
    }

    fn check_action(&self, component: &str, action: &str) -> Result<(), EngineError> {
        let signature = self
            .components
            .signature(component)
            .ok_or_else(|| EngineError::UnknownComponent(component.to_string()))?;
        if signature.find_action(action).is_none() {
            return Err(EngineError::UnknownAction {
                component: component.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }

    async fn start_flow(
        &self,
        component: &str,
        action: &str,
        input: Fields,
        output: Fields,
    ) -> FlowReport {
        let flow = Uuid::new_v4();
        let _guard = FlowGuard {
            log: &self.log,
            flow,
            retain: self.config.engine.retain_history,
        };

        let root = self.log.append(NewRecord {
            flow,
            parent: None,
            depth: 0,
            component: component.to_string(),
            action: action.to_string(),
            input,
            output,
        });
        self.run_flow(root).await
    }

    /// Drain the work queue for one flow.
    async fn run_flow(&self, root: ActionRecord) -> FlowReport {
        let flow = root.flow;
        let max_depth = self.config.engine.max_cascade_depth;
        let boundary = &self.config.boundary;

        info!(flow = %flow, root = %root.qualified_name(), "Flow started");

        let mut report = FlowReport::new(flow);
        let mut terminals = TerminalTracker::default();
        terminals.observe(boundary, &root, "<external>", &mut report);
        report.push(root.clone());

        let mut queue = VecDeque::from([root]);

        while let Some(record) = queue.pop_front() {
            let Some(candidates) = self
                .index
                .get(&(record.component.clone(), record.action.clone()))
            else {
                continue;
            };

            let depth = record.depth + 1;
            let history = self.log.history(flow);
            let evaluations = join_all(
                candidates
                    .iter()
                    .map(|&i| self.evaluate(&self.rules[i], &record, &history, depth)),
            )
            .await;

            let mut dispatches = Vec::new();

            for evaluation in evaluations {
                for (rule, lookup) in &evaluation.exceeded {
                    self.depth_exceeded(&mut report, rule, lookup, depth);
                }
                for observation in evaluation.observed {
                    let output = observation.output();
                    let child = self.log.append(NewRecord {
                        flow,
                        parent: Some(record.seq),
                        depth,
                        component: observation.target.component.clone(),
                        action: observation.target.name.clone(),
                        input: observation.input,
                        output,
                    });
                    terminals.observe(boundary, &child, &observation.rule, &mut report);
                    report.push(child.clone());
                    queue.push_back(child);
                }
                dispatches.extend(evaluation.dispatches);
            }

            if dispatches.is_empty() {
                continue;
            }

            if depth > max_depth {
                for dispatch in &dispatches {
                    let invocation = format!("{}.{}", dispatch.component, dispatch.action);
                    self.depth_exceeded(&mut report, &dispatch.rule, &invocation, depth);
                }
                continue;
            }

            let outputs = join_all(
                dispatches
                    .iter()
                    .map(|d| self.perform(&d.component, &d.action, &d.input)),
            )
            .await;

            for (dispatch, output) in dispatches.into_iter().zip(outputs) {
                let Dispatch {
                    rule,
                    component,
                    action,
                    input,
                } = dispatch;

                let child = self.log.append(NewRecord {
                    flow,
                    parent: Some(record.seq),
                    depth,
                    component,
                    action,
                    input,
                    output,
                });
                debug!(
                    flow = %flow,
                    rule = %rule,
                    seq = child.seq,
                    parent = record.seq,
                    depth,
                    action = %child.qualified_name(),
                    error = child.is_error(),
                    "Dispatched"
                );
                terminals.observe(boundary, &child, &rule, &mut report);
                report.push(child.clone());
                queue.push_back(child);
            }
        }

        terminals.finish(flow, &mut report);

        info!(
            flow = %flow,
            records = report.records.len(),
            max_depth = report.max_depth,
            defects = report.defects.len(),
            "Flow settled"
        );

        report
    }

    fn depth_exceeded(&self, report: &mut FlowReport, rule: &str, invocation: &str, depth: u32) {
        error!(
            flow = %report.flow,
            rule = %rule,
            invocation = %invocation,
            depth,
            max_cascade_depth = self.config.engine.max_cascade_depth,
            "Cascade depth exceeded, aborting branch; check for a cyclic rule chain"
        );
        report.defects.push(Defect::DepthExceeded {
            rule: rule.to_string(),
            invocation: invocation.to_string(),
            depth,
        });
    }

    /// Run one rule against one record: join, refine, resolve consequences.
    async fn evaluate(
        &self,
        compiled: &CompiledRule,
        record: &ActionRecord,
        history: &[ActionRecord],
        depth: u32,
    ) -> Evaluation {
        let rule = &compiled.rule;
        let frames = join(&rule.trigger, record, history);
        if frames.is_empty() {
            return Evaluation::default();
        }

        debug!(
            rule = %rule.name,
            seq = record.seq,
            frames = frames.len(),
            "Rule matched"
        );

        let sink = Mutex::new(Vec::new());
        let concurrency = self.config.engine.query_concurrency;
        let mut set = FrameSet::from(frames);

        for (position, stage) in compiled.stages.iter().enumerate() {
            if depth > self.config.engine.max_cascade_depth {
                if let Some(target) = stage.feed_target() {
                    return Evaluation {
                        exceeded: vec![(
                            rule.name.clone(),
                            format!("{}.{}", target.component, target.name),
                        )],
                        ..Evaluation::default()
                    };
                }
            }

            set = match stage {
                CompiledStage::Filter(predicate) => set.filter(|f| predicate(f)),
                CompiledStage::Map(transform) => set.map(|f| transform(f)),
                CompiledStage::Query {
                    adapter,
                    input,
                    output,
                } => {
                    let tapped = tap(&rule.name, adapter.as_ref(), &sink);
                    set.query(&tapped, input, output, concurrency).await
                }
                CompiledStage::Absent { adapter, input } => {
                    let tapped = tap(&rule.name, adapter.as_ref(), &sink);
                    set.absent(&tapped, input, concurrency).await
                }
            };

            if set.is_empty() {
                debug!(
                    rule = %rule.name,
                    stage = ?rule.refine[position],
                    "Refinement left no frames"
                );
                break;
            }
        }

        let mut dispatches = Vec::new();
        for frame in set.iter() {
            for invocation in &rule.consequence {
                match invocation.resolve(frame) {
                    Some(input) => dispatches.push(Dispatch {
                        rule: rule.name.clone(),
                        component: invocation.component.clone(),
                        action: invocation.action.clone(),
                        input,
                    }),
                    None => debug!(
                        rule = %rule.name,
                        invocation = %invocation.qualified_name(),
                        unbound = ?invocation.input.unbound_vars(frame),
                        "Skipping invocation with unbound variables"
                    ),
                }
            }
        }

        Evaluation {
            dispatches,
            observed: sink.into_inner().unwrap_or_else(PoisonError::into_inner),
            exceeded: Vec::new(),
        }
    }

    /// Perform an action, turning failures into an error-shaped output.
    async fn perform(&self, component: &str, action: &str, input: &Fields) -> Fields {
        let Some(target) = self.components.get(component) else {
            return error_output(format!("unknown component: {component}"));
        };

        match target.perform(action, input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    component = %component,
                    action = %action,
                    error = %e,
                    "Action failed"
                );
                error_output(e.to_string())
            }
        }
    }
}

fn tap<'a>(rule: &'a str, adapter: &'a dyn QueryAdapter, sink: &'a Mutex<Vec<Observation>>) -> Tapped<'a> {
    Tapped {
        rule,
        inner: adapter,
        target: adapter.feed_target(),
        sink,
    }
}

fn compile_stages(
    rule: &SyncRule,
    components: &ComponentRegistry,
) -> Result<Vec<CompiledStage>, EngineError> {
    let resolve = |source: &crate::adapter::QuerySource| {
        source.resolve(components).ok_or_else(|| {
            EngineError::Registration(RegistrationError::UnknownComponent {
                rule: rule.name.clone(),
                component: format!("{source:?}"),
            })
        })
    };

    rule.refine
        .iter()
        .map(|stage| -> Result<CompiledStage, EngineError> {
            Ok(match stage {
                Stage::Filter(predicate) => CompiledStage::Filter(predicate.clone()),
                Stage::Map { transform, .. } => CompiledStage::Map(transform.clone()),
                Stage::Query {
                    source,
                    input,
                    output,
                } => CompiledStage::Query {
                    adapter: resolve(source)?,
                    input: input.clone(),
                    output: output.clone(),
                },
                Stage::Absent { source, input } => CompiledStage::Absent {
                    adapter: resolve(source)?,
                    input: input.clone(),
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::fields;
    use chrono::Utc;

    fn record(seq: u64, action: &str, input: Value, output: Value) -> ActionRecord {
        ActionRecord {
            seq,
            flow: Uuid::nil(),
            parent: None,
            depth: 0,
            component: "Requesting".to_string(),
            action: action.to_string(),
            input: fields(input),
            output: fields(output),
            timestamp: Utc::now(),
        }
    }

    fn observation(kind: FeedKind, rows: Vec<Fields>) -> Observation {
        Observation {
            rule: "R".to_string(),
            target: FeedTarget {
                component: "Store".to_string(),
                name: "find".to_string(),
                kind,
            },
            input: Fields::new(),
            rows,
        }
    }

    #[test]
    fn test_observation_output_shapes() {
        let row = fields(json!({"id": "a"}));

        let query = observation(FeedKind::Query, vec![row.clone()]);
        assert_eq!(query.output(), fields(json!({"rows": [{"id": "a"}]})));

        let action = observation(FeedKind::Action, vec![row.clone()]);
        assert_eq!(action.output(), row);

        let empty = observation(FeedKind::Action, vec![]);
        assert!(empty.output().is_empty());
    }

    #[test]
    fn test_terminal_tracker() {
        let boundary = BoundaryConfig::default();
        let mut report = FlowReport::new(Uuid::nil());
        let mut tracker = TerminalTracker::default();

        let request = record(1, "request", json!({}), json!({"request": "R1"}));
        let first = record(2, "respond", json!({"request": "R1", "body": 1}), json!({"ok": true}));
        let second = record(3, "respond", json!({"request": "R1", "body": 2}), json!({"ok": true}));

        tracker.observe(&boundary, &request, "<external>", &mut report);
        tracker.observe(&boundary, &first, "A", &mut report);
        assert!(report.defects.is_empty());

        tracker.observe(&boundary, &second, "B", &mut report);
        tracker.finish(Uuid::nil(), &mut report);

        assert_eq!(report.terminal_seqs, vec![2, 3]);
        assert_eq!(
            report.defects,
            vec![Defect::DuplicateTerminalResponse {
                rule: "B".to_string(),
                identity: json!("R1"),
            }]
        );
    }

    #[test]
    fn test_unanswered_request() {
        let boundary = BoundaryConfig::default();
        let mut report = FlowReport::new(Uuid::nil());
        let mut tracker = TerminalTracker::default();

        let request = record(1, "request", json!({}), json!({"request": "R9"}));
        tracker.observe(&boundary, &request, "<external>", &mut report);
        tracker.finish(Uuid::nil(), &mut report);

        assert_eq!(
            report.defects,
            vec![Defect::NoTerminalResponse {
                identity: json!("R9")
            }]
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn test_defect_serializes_with_kind() {
        let defect = Defect::DepthExceeded {
            rule: "Loop".to_string(),
            invocation: "Store.create".to_string(),
            depth: 65,
        };
        assert_eq!(
            serde_json::to_value(&defect).unwrap(),
            json!({"kind": "depth_exceeded", "rule": "Loop", "invocation": "Store.create", "depth": 65})
        );
    }
}
