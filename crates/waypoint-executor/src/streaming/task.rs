//! One streaming task and its state machine.
//!
//! `pending -> running -> {completed | failed | cancelled}`. Terminal states
//! are final: the first terminal transition wins and later ones are no-ops.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use waypoint_core::history::HistoryKind;
use waypoint_core::types::TaskId;

use super::StreamingError;
use super::events::{ProgressEvent, ProgressKind, into_stream};
use crate::cancel::CancellationToken;
use crate::context::RuntimeContext;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not started.
    Pending,
    /// Running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Status.
    pub status: TaskStatus,
    /// Last reported percentage.
    pub progress: u8,
    /// Last reported completed-step count.
    pub current_step: usize,
    /// Steps in the current plan.
    pub total_steps: usize,
    /// Last status message.
    pub message: String,
    /// Buffered partial results, oldest first.
    pub results: Vec<serde_json::Value>,
    /// Final result on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<serde_json::Value>,
    /// Error on failure, reason on cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the task started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time from start to the terminal transition (or now).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    total_steps: usize,
    current_step: usize,
    progress: u8,
    message: String,
    results: VecDeque<serde_json::Value>,
    final_result: Option<serde_json::Value>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished: Option<Instant>,
    last_progress_emit: Option<Instant>,
}

impl TaskState {
    fn elapsed(&self) -> Option<Duration> {
        self.started
            .map(|s| self.finished.unwrap_or_else(Instant::now).duration_since(s))
    }
}

/// Settings applied to a task at creation.
#[derive(Debug, Clone, Copy)]
pub struct TaskSettings {
    /// Minimum interval between progress emissions.
    pub throttle: Duration,
    /// Partial results kept.
    pub result_buffer_size: usize,
    /// Broadcast capacity.
    pub event_capacity: usize,
}

/// A cancellable unit of work with a progress event stream.
pub struct StreamingTask {
    id: TaskId,
    settings: TaskSettings,
    state: Mutex<TaskState>,
    token: CancellationToken,
    events: broadcast::Sender<ProgressEvent>,
    forward: Option<broadcast::Sender<ProgressEvent>>,
    runtime: Option<Arc<RuntimeContext>>,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl StreamingTask {
    /// Create a pending task.
    #[must_use]
    pub fn new(id: TaskId, settings: TaskSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            id,
            settings,
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                total_steps: 0,
                current_step: 0,
                progress: 0,
                message: String::new(),
                results: VecDeque::with_capacity(settings.result_buffer_size),
                final_result: None,
                error: None,
                started_at: None,
                started: None,
                finished: None,
                last_progress_emit: None,
            }),
            token: CancellationToken::new(),
            events,
            forward: None,
            runtime: None,
        }
    }

    /// Also send events to a manager-wide channel.
    #[must_use]
    pub fn with_forward(mut self, forward: broadcast::Sender<ProgressEvent>) -> Self {
        self.forward = Some(forward);
        self
    }

    /// Record lifecycle events in the runtime's history.
    #[must_use]
    pub fn with_history(mut self, runtime: Arc<RuntimeContext>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Task id.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.id
    }

    /// The task's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Current status.
    #[must_use]
    pub fn current_status(&self) -> TaskStatus {
        self.lock().status
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, kind: ProgressKind) {
        let record = !matches!(kind, ProgressKind::Progress { .. } | ProgressKind::Result { .. });
        let event = ProgressEvent::new(self.id.clone(), kind);

        if record {
            if let Some(runtime) = &self.runtime {
                match serde_json::to_value(&event) {
                    Ok(payload) => runtime.record(&self.id, HistoryKind::Streaming, payload),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize progress event"),
                }
            }
        }

        if let Some(forward) = &self.forward {
            let _ = forward.send(event.clone());
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Move from pending to running.
    ///
    /// # Errors
    ///
    /// Returns error if the task is not pending.
    pub fn start(&self, total_steps: usize) -> Result<(), StreamingError> {
        {
            let mut state = self.lock();
            if state.status != TaskStatus::Pending {
                return Err(StreamingError::InvalidTransition {
                    task_id: self.id.clone(),
                    from: state.status,
                    action: "start",
                });
            }
            state.status = TaskStatus::Running;
            state.total_steps = total_steps;
            state.started_at = Some(Utc::now());
            state.started = Some(Instant::now());
        }
        tracing::info!(task_id = %self.id, total_steps, "Task started");
        self.emit(ProgressKind::Started { total_steps });
        Ok(())
    }

    /// Change the step count (a correction may grow or shrink the plan).
    pub fn set_total_steps(&self, total_steps: usize) {
        let mut state = self.lock();
        state.total_steps = total_steps;
        state.current_step = state.current_step.min(total_steps);
    }

    /// Report `step` completed steps.
    ///
    /// Emissions are throttled; a throttled update still changes the state.
    /// Returns whether an event was emitted.
    ///
    /// # Errors
    ///
    /// Returns error if the task was cancelled or is not running.
    pub fn update_progress(&self, step: usize, message: impl Into<String>) -> Result<bool, StreamingError> {
        if let Some(reason) = self.token.reason() {
            return Err(StreamingError::Cancelled {
                task_id: self.id.clone(),
                reason: reason.to_string(),
            });
        }

        let kind = {
            let mut state = self.lock();
            if state.status != TaskStatus::Running {
                return Err(StreamingError::InvalidTransition {
                    task_id: self.id.clone(),
                    from: state.status,
                    action: "update progress",
                });
            }

            let total = state.total_steps;
            let step = if total > 0 { step.min(total) } else { step };
            let percent = if total == 0 {
                0
            } else {
                u8::try_from(step * 100 / total).unwrap_or(100)
            };
            state.current_step = step;
            state.progress = percent;
            state.message = message.into();

            let now = Instant::now();
            let due = state
                .last_progress_emit
                .is_none_or(|last| now.duration_since(last) >= self.settings.throttle);
            if !due {
                return Ok(false);
            }
            state.last_progress_emit = Some(now);

            ProgressKind::Progress {
                step,
                total_steps: total,
                percent,
                message: state.message.clone(),
            }
        };

        self.emit(kind);
        Ok(true)
    }

    /// Append a partial result, dropping the oldest beyond capacity.
    ///
    /// # Errors
    ///
    /// Returns error if the task is not running.
    pub fn add_result(&self, data: serde_json::Value) -> Result<(), StreamingError> {
        {
            let mut state = self.lock();
            if state.status != TaskStatus::Running {
                return Err(StreamingError::InvalidTransition {
                    task_id: self.id.clone(),
                    from: state.status,
                    action: "add result",
                });
            }
            if self.settings.result_buffer_size == 0 {
                state.results.clear();
            } else {
                while state.results.len() >= self.settings.result_buffer_size {
                    state.results.pop_front();
                }
                state.results.push_back(data.clone());
            }
        }
        self.emit(ProgressKind::Result { data });
        Ok(())
    }

    /// Emit a named milestone. Ignored once the task is terminal.
    pub fn milestone(&self, name: impl Into<String>, data: serde_json::Value) {
        if self.current_status().is_terminal() {
            return;
        }
        self.emit(ProgressKind::Milestone {
            name: name.into(),
            data,
        });
    }

    /// Finish successfully. Returns `false` if the task already ended or was
    /// cancelled.
    pub fn complete(&self, result: serde_json::Value) -> bool {
        let duration = {
            let mut state = self.lock();
            if state.status.is_terminal() || self.token.is_cancelled() {
                return false;
            }
            state.status = TaskStatus::Completed;
            state.finished = Some(Instant::now());
            state.final_result = Some(result.clone());
            state.elapsed().map_or(0, duration_ms)
        };
        tracing::info!(task_id = %self.id, duration_ms = duration, "Task completed");
        self.emit(ProgressKind::Completed {
            result,
            duration_ms: duration,
        });
        true
    }

    /// Finish with an error. Returns `false` if the task already ended.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        let duration = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Failed;
            state.finished = Some(Instant::now());
            state.error = Some(error.clone());
            state.elapsed().map_or(0, duration_ms)
        };
        tracing::warn!(task_id = %self.id, duration_ms = duration, error = %error, "Task failed");
        self.emit(ProgressKind::Failed {
            error,
            duration_ms: duration,
        });
        true
    }

    /// Cancel the task and flip its token.
    ///
    /// Only the first call has any effect; it returns `true`.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Cancelled;
            state.finished = Some(Instant::now());
            state.error = Some(reason.clone());
        }
        self.token.cancel(reason.clone());
        tracing::info!(task_id = %self.id, reason = %reason, "Task cancelled");
        self.emit(ProgressKind::Cancelled { reason });
        true
    }

    /// Current state of the task.
    #[must_use]
    pub fn status(&self) -> TaskSnapshot {
        let state = self.lock();
        TaskSnapshot {
            id: self.id.clone(),
            status: state.status,
            progress: state.progress,
            current_step: state.current_step,
            total_steps: state.total_steps,
            message: state.message.clone(),
            results: state.results.iter().cloned().collect(),
            final_result: state.final_result.clone(),
            error: state.error.clone(),
            started_at: state.started_at,
            duration_ms: state.elapsed().map(duration_ms),
        }
    }

    /// Subscribe to this task's events from now on.
    #[must_use]
    pub fn subscribe(&self) -> impl Stream<Item = ProgressEvent> + Send + use<> {
        into_stream(self.events.subscribe())
    }

    /// Raw broadcast receiver for this task's events.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for StreamingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTask")
            .field("id", &self.id)
            .field("status", &self.current_status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(throttle_ms: u64, buffer: usize) -> StreamingTask {
        StreamingTask::new(
            TaskId::new("t1"),
            TaskSettings {
                throttle: Duration::from_millis(throttle_ms),
                result_buffer_size: buffer,
                event_capacity: 64,
            },
        )
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let task = task(0, 10);
        let mut rx = task.receiver();

        task.start(4).unwrap();
        assert!(task.update_progress(2, "half").unwrap());
        task.add_result(json!({"step": 1})).unwrap();
        assert!(task.complete(json!("done")));

        let snapshot = task.status();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.progress, 50);
        assert_eq!(snapshot.final_result, Some(json!("done")));
        assert_eq!(drain(&mut rx), vec!["started", "progress", "result", "completed"]);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let task = task(0, 10);
        task.start(1).unwrap();
        assert!(matches!(
            task.start(1),
            Err(StreamingError::InvalidTransition { from: TaskStatus::Running, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_throttled() {
        let task = task(100, 10);
        let mut rx = task.receiver();
        task.start(10).unwrap();

        assert!(task.update_progress(1, "a").unwrap());
        assert!(!task.update_progress(2, "b").unwrap());
        assert_eq!(task.status().progress, 20);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(task.update_progress(3, "c").unwrap());
        assert_eq!(drain(&mut rx), vec!["started", "progress", "progress"]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let task = task(0, 10);
        let mut rx = task.receiver();
        task.start(5).unwrap();

        assert!(task.cancel("user"));
        assert!(!task.cancel("again"));
        assert!(!task.complete(json!(null)));
        assert!(!task.fail("late"));

        assert!(task.cancellation().is_cancelled());
        assert_eq!(task.status().status, TaskStatus::Cancelled);
        assert_eq!(task.status().error.as_deref(), Some("user"));
        assert_eq!(drain(&mut rx), vec!["started", "cancelled"]);
    }

    #[tokio::test]
    async fn test_progress_after_cancel_errors() {
        let task = task(0, 10);
        task.start(5).unwrap();
        task.update_progress(2, "two").unwrap();
        task.cancel("stop");

        assert!(matches!(
            task.update_progress(3, "three"),
            Err(StreamingError::Cancelled { .. })
        ));
        assert_eq!(task.status().progress, 40);
    }

    #[tokio::test]
    async fn test_result_ring_buffer() {
        let task = task(0, 2);
        task.start(3).unwrap();
        for i in 0..3 {
            task.add_result(json!(i)).unwrap();
        }
        assert_eq!(task.status().results, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_fail_records_duration() {
        let task = task(0, 2);
        task.start(1).unwrap();
        assert!(task.fail("boom"));
        let snapshot = task.status();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.duration_ms.is_some());
        assert!(!task.cancel("too late"));
    }
}
