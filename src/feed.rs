//! Action feed service.
//!
//! An [`ActionFeed`] is the submitting half of an mpsc channel. The engine
//! consumes the other half in [`Engine::serve`], running every submitted
//! flow on its own task until the feed closes or shutdown is triggered.
//!
//! ```rust,ignore
//! let (feed, receiver) = ActionFeed::channel(64);
//! let serve = tokio::spawn(engine.clone().serve(receiver, shutdown.clone()));
//!
//! let report = feed
//!     .submit_and_wait(Submission::invoke("Requesting", "request", input))
//!     .await?;
//! ```

use crate::action::Fields;
use crate::engine::{Engine, EngineError, FlowReport};
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One unit of work for the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Perform the action, then cascade
    Invoke {
        component: String,
        action: String,
        input: Fields,
    },

    /// Record an already-completed action, then cascade
    Observe {
        component: String,
        action: String,
        input: Fields,
        output: Fields,
    },
}

impl Submission {
    /// Perform `component.action` with `input`
    pub fn invoke(component: impl Into<String>, action: impl Into<String>, input: Fields) -> Self {
        Self::Invoke {
            component: component.into(),
            action: action.into(),
            input,
        }
    }

    /// Record `component.action` as completed with `output`
    pub fn observe(
        component: impl Into<String>,
        action: impl Into<String>,
        input: Fields,
        output: Fields,
    ) -> Self {
        Self::Observe {
            component: component.into(),
            action: action.into(),
            input,
            output,
        }
    }

    /// `Component.action`
    pub fn qualified_name(&self) -> String {
        match self {
            Self::Invoke {
                component, action, ..
            }
            | Self::Observe {
                component, action, ..
            } => format!("{component}.{action}"),
        }
    }
}

/// A submission plus where to send its report.
pub struct Envelope {
    submission: Submission,
    reply: Option<oneshot::Sender<Result<FlowReport, EngineError>>>,
}

/// Submitting half of the feed. Cheap to clone.
#[derive(Clone)]
pub struct ActionFeed {
    sender: mpsc::Sender<Envelope>,
}

impl ActionFeed {
    /// Create a feed with room for `capacity` queued submissions.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a submission without waiting for its flow.
    pub async fn submit(&self, submission: Submission) -> Result<(), EngineError> {
        self.sender
            .send(Envelope {
                submission,
                reply: None,
            })
            .await
            .map_err(|_| EngineError::FeedClosed)
    }

    /// Queue a submission and wait for its flow report.
    pub async fn submit_and_wait(&self, submission: Submission) -> Result<FlowReport, EngineError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope {
                submission,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::FeedClosed)?;

        response.await.map_err(|_| EngineError::FeedClosed)?
    }
}

impl Engine {
    /// Serve submissions from `receiver` until it closes or `shutdown` fires.
    ///
    /// Each submission runs as its own flow on a separate task. On exit,
    /// in-flight flows get the shutdown timeout to settle; the rest are
    /// aborted, and their records leave the log before this returns.
    pub async fn serve(self: Arc<Self>, mut receiver: mpsc::Receiver<Envelope>, shutdown: ShutdownSignal) {
        let mut flows = JoinSet::new();
        let mut accepted: u64 = 0;

        info!("Action feed service started");

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    info!("Shutdown signal received, no longer accepting submissions");
                    break;
                }
                envelope = receiver.recv() => {
                    let Some(Envelope { submission, reply }) = envelope else {
                        info!("Action feed closed");
                        break;
                    };

                    accepted += 1;
                    debug!(submission = %submission.qualified_name(), "Accepted submission");

                    let engine = Arc::clone(&self);
                    flows.spawn(async move {
                        let result = engine.run_submission(submission).await;
                        if let Err(e) = &result {
                            warn!(error = %e, "Submission rejected");
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    });
                }
                Some(joined) = flows.join_next(), if !flows.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Flow task failed");
                    }
                }
            }
        }

        let in_flight = flows.len();
        if in_flight > 0 {
            info!(in_flight, timeout_secs = shutdown.timeout().as_secs(), "Waiting for in-flight flows");
            let drained = tokio::time::timeout(shutdown.timeout(), async {
                while let Some(joined) = flows.join_next().await {
                    if let Err(e) = joined {
                        error!(error = %e, "Flow task failed");
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!(remaining = flows.len(), "Shutdown timeout reached, aborting flows");
                // Aborted flows drop their records from the log as they unwind
                flows.shutdown().await;
            }
        }

        info!(accepted, "Action feed service stopped");
    }

    async fn run_submission(&self, submission: Submission) -> Result<FlowReport, EngineError> {
        match submission {
            Submission::Invoke {
                component,
                action,
                input,
            } => self.invoke(&component, &action, input).await,
            Submission::Observe {
                component,
                action,
                input,
                output,
            } => self.observe(&component, &action, input, output).await,
        }
    }
}
