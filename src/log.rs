//! Append-only action record log.
//!
//! The log is the only state rules share. Records are grouped by flow so a
//! join only scans the cascade it belongs to, and a finished flow can be
//! dropped in one step. Sequence numbers are global and strictly increasing.

use crate::action::{ActionRecord, Fields, FlowId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A record about to be appended.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Cascade the record belongs to
    pub flow: FlowId,

    /// Causing record, if any
    pub parent: Option<u64>,

    /// Cascade depth
    pub depth: u32,

    /// Component name
    pub component: String,

    /// Action or query name
    pub action: String,

    /// Input fields
    pub input: Fields,

    /// Output fields
    pub output: Fields,
}

/// In-memory, append-only store of action records.
pub struct ActionLog {
    next_seq: AtomicU64,
    flows: Mutex<HashMap<FlowId, Vec<ActionRecord>>>,
}

impl ActionLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(1),
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record, stamping its sequence number and timestamp.
    pub fn append(&self, new: NewRecord) -> ActionRecord {
        let mut flows = self.lock();
        // Allocated under the lock so a flow's records stay in seq order
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = ActionRecord {
            seq,
            flow: new.flow,
            parent: new.parent,
            depth: new.depth,
            component: new.component,
            action: new.action,
            input: new.input,
            output: new.output,
            timestamp: Utc::now(),
        };
        flows.entry(record.flow).or_default().push(record.clone());
        record
    }

    /// Snapshot of a flow's records, oldest first
    pub fn history(&self, flow: FlowId) -> Vec<ActionRecord> {
        self.lock().get(&flow).cloned().unwrap_or_default()
    }

    /// Drop a finished flow. Returns how many records were discarded.
    pub fn discard_flow(&self, flow: FlowId) -> usize {
        self.lock().remove(&flow).map_or(0, |records| records.len())
    }

    /// Flows currently holding records
    pub fn flows(&self) -> Vec<FlowId> {
        self.lock().keys().copied().collect()
    }

    /// Total records held across all flows
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Whether the log holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FlowId, Vec<ActionRecord>>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::fields;
    use serde_json::json;
    use uuid::Uuid;

    fn new_record(flow: FlowId, action: &str) -> NewRecord {
        NewRecord {
            flow,
            parent: None,
            depth: 0,
            component: "Test".to_string(),
            action: action.to_string(),
            input: Fields::new(),
            output: fields(json!({"ok": true})),
        }
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let log = ActionLog::new();
        let flow = Uuid::new_v4();

        let a = log.append(new_record(flow, "a"));
        let b = log.append(new_record(flow, "b"));

        assert!(b.seq > a.seq);
        let history = log.history(flow);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "a");
        assert_eq!(history[1].action, "b");
    }

    #[test]
    fn test_flows_are_isolated() {
        let log = ActionLog::new();
        let one = Uuid::new_v4();
        let two = Uuid::new_v4();

        log.append(new_record(one, "a"));
        log.append(new_record(two, "b"));
        log.append(new_record(two, "c"));

        assert_eq!(log.history(one).len(), 1);
        assert_eq!(log.history(two).len(), 2);
        assert_eq!(log.len(), 3);
        assert_eq!(log.flows().len(), 2);
    }

    #[test]
    fn test_discard_flow() {
        let log = ActionLog::new();
        let flow = Uuid::new_v4();
        log.append(new_record(flow, "a"));

        assert_eq!(log.discard_flow(flow), 1);
        assert!(log.is_empty());
        assert!(log.history(flow).is_empty());
        assert_eq!(log.discard_flow(flow), 0);
    }
}
