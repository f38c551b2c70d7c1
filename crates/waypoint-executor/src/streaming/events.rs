//! Progress events broadcast to subscribers.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use waypoint_core::types::TaskId;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    /// The task started running.
    Started {
        /// Steps in the plan.
        total_steps: usize,
    },

    /// Steps completed so far.
    Progress {
        /// Completed steps.
        step: usize,
        /// Steps in the current plan.
        total_steps: usize,
        /// Percentage, 0 to 100.
        percent: u8,
        /// Status message.
        message: String,
    },

    /// A named point in the task's life (attempt started, correction applied).
    Milestone {
        /// Milestone name.
        name: String,
        /// Milestone data.
        data: serde_json::Value,
    },

    /// A partial result.
    Result {
        /// Result data.
        data: serde_json::Value,
    },

    /// The task completed.
    Completed {
        /// Final result.
        result: serde_json::Value,
        /// Time since start.
        duration_ms: u64,
    },

    /// The task failed.
    Failed {
        /// Error message.
        error: String,
        /// Time since start.
        duration_ms: u64,
    },

    /// The task was cancelled.
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl ProgressKind {
    /// Whether this event ends the task.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// Event type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Milestone { .. } => "milestone",
            Self::Result { .. } => "result",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// An event with its task and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Event id.
    pub id: String,
    /// Task the event belongs to.
    pub task_id: TaskId,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub event: ProgressKind,
}

impl ProgressEvent {
    /// Create an event stamped now.
    #[must_use]
    pub fn new(task_id: TaskId, event: ProgressKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Turn a broadcast receiver into a stream.
///
/// Lagging subscribers skip the events they missed; the stream ends when
/// the sender is dropped.
pub fn into_stream(
    receiver: broadcast::Receiver<ProgressEvent>,
) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
