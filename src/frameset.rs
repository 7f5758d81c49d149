//! Frame set algebra.
//!
//! A [`FrameSet`] is an ordered multiset of frames moving through a rule's
//! refinement pipeline. Every operation consumes the set and returns a new
//! one; the frames themselves are never modified.
//!
//! ```text
//! filter(p)              keep frames where p holds                 (sync)
//! map(f)                 add/overwrite bindings per frame          (sync)
//! query(a, in, out)      0..n rows per frame, each unified → frame (async)
//! absent(a, in)          keep frames for which a finds nothing     (async)
//! ```
//!
//! `query` is also the guard mechanism: a frame whose lookup returns no rows
//! contributes nothing downstream.

use crate::action::{error_output, Fields};
use crate::adapter::QueryAdapter;
use crate::frame::{Frame, Var};
use crate::pattern::Template;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// An ordered multiset of frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSet {
    frames: Vec<Frame>,
}

impl FrameSet {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding one frame
    pub fn single(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    /// Number of frames (duplicates included)
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the set has no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterate frames in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Take the frames out
    pub fn into_vec(self) -> Vec<Frame> {
        self.frames
    }

    /// Union of the variables bound by any frame
    pub fn domain(&self) -> BTreeSet<Var> {
        self.frames
            .iter()
            .flat_map(|f| f.vars().cloned())
            .collect()
    }

    /// Keep frames satisfying `predicate`, preserving order.
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&Frame) -> bool,
    {
        Self {
            frames: self.frames.into_iter().filter(|f| predicate(f)).collect(),
        }
    }

    /// Add or overwrite bindings on every frame.
    ///
    /// `transform` returns the bindings to set; it cannot remove any.
    pub fn map<F>(self, transform: F) -> Self
    where
        F: Fn(&Frame) -> Vec<(Var, Value)>,
    {
        Self {
            frames: self
                .frames
                .into_iter()
                .map(|f| {
                    transform(&f)
                        .into_iter()
                        .fold(f, |acc, (var, value)| acc.with(var, value))
                })
                .collect(),
        }
    }

    /// Expand every frame through an external lookup.
    ///
    /// For each frame, `input` is resolved to concrete fields and passed to
    /// `adapter`. Each returned row is unified against `output` and merged
    /// into a copy of the frame. Rows that fail to unify are dropped, and a
    /// frame with no surviving rows drops out. Frames whose `input` cannot be
    /// resolved are dropped too.
    ///
    /// At most `concurrency` adapter calls run at once. Output order follows
    /// input order regardless of completion order.
    pub async fn query(
        self,
        adapter: &dyn QueryAdapter,
        input: &Template,
        output: &Template,
        concurrency: usize,
    ) -> Self {
        let expanded: Vec<Vec<Frame>> = stream::iter(self.frames)
            .map(|frame| async move {
                let Some(resolved) = resolve_input(adapter, input, &frame) else {
                    return Vec::new();
                };
                let rows = lookup(adapter, &resolved).await;
                rows.iter()
                    .filter_map(|row| output.unify(&frame, row))
                    .collect::<Vec<_>>()
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        Self {
            frames: expanded.into_iter().flatten().collect(),
        }
    }

    /// Keep only frames for which `adapter` returns no rows.
    ///
    /// An adapter failure counts as a row: the frame is dropped.
    pub async fn absent(self, adapter: &dyn QueryAdapter, input: &Template, concurrency: usize) -> Self {
        let kept: Vec<Option<Frame>> = stream::iter(self.frames)
            .map(|frame| async move {
                let resolved = resolve_input(adapter, input, &frame)?;
                let rows = lookup(adapter, &resolved).await;
                rows.is_empty().then_some(frame)
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        Self {
            frames: kept.into_iter().flatten().collect(),
        }
    }
}

impl From<Vec<Frame>> for FrameSet {
    fn from(frames: Vec<Frame>) -> Self {
        Self { frames }
    }
}

impl FromIterator<Frame> for FrameSet {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FrameSet {
    type Item = Frame;
    type IntoIter = std::vec::IntoIter<Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

fn resolve_input(adapter: &dyn QueryAdapter, input: &Template, frame: &Frame) -> Option<Fields> {
    let resolved = input.resolve(frame);
    if resolved.is_none() {
        debug!(
            adapter = %adapter.name(),
            unbound = ?input.unbound_vars(frame),
            "Query input has unbound variables, dropping frame"
        );
    }
    resolved
}

/// Call the adapter, turning a failure into one error-shaped row.
async fn lookup(adapter: &dyn QueryAdapter, input: &Fields) -> Vec<Fields> {
    match adapter.call(input).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(adapter = %adapter.name(), error = %e, "Query adapter failed");
            vec![error_output(e.to_string())]
        }
    }
}
