//! Streaming progress and cancellation.
//!
//! [`StreamingManager`] owns the tasks of one runtime, caps how many run at
//! once, and runs plans through the self-correction controller under a
//! wall-clock timeout while forwarding progress to subscribers.

mod events;
mod task;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::Stream;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use waypoint_core::config::StreamingConfig;
use waypoint_core::types::{ExecutionResult, Plan, Step, TaskId};
use waypoint_core::validation::{PlanValidationError, validate_plan};

use crate::context::RuntimeContext;
use crate::correction::{
    Correction, CorrectionObserver, CorrectionOptions, CorrectionReport, CorrectionStatus,
    SelfCorrectionController,
};

pub use events::{ProgressEvent, ProgressKind, into_stream};
pub use task::{StreamingTask, TaskSettings, TaskSnapshot, TaskStatus};

/// Streaming errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamingError {
    /// Too many tasks are pending or running.
    #[error("Too many concurrent tasks (max {max})")]
    CapacityExceeded {
        /// Configured cap.
        max: usize,
    },

    /// No task with this id.
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// A task with this id already exists.
    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    /// The task is not in a state that allows the action.
    #[error("Cannot {action} task {task_id} while {from}")]
    InvalidTransition {
        /// Task id.
        task_id: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Attempted action.
        action: &'static str,
    },

    /// The task was cancelled.
    #[error("Task {task_id} was cancelled: {reason}")]
    Cancelled {
        /// Task id.
        task_id: TaskId,
        /// Cancellation reason.
        reason: String,
    },

    /// The plan was rejected before dispatch.
    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanValidationError),
}

/// Owns the streaming tasks of one runtime.
pub struct StreamingManager {
    runtime: Arc<RuntimeContext>,
    config: StreamingConfig,
    tasks: RwLock<HashMap<TaskId, Arc<StreamingTask>>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl StreamingManager {
    /// Create a manager using the runtime's streaming config.
    #[must_use]
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        let config = runtime.config().streaming.clone();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            runtime,
            config,
            tasks: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn settings(&self) -> TaskSettings {
        TaskSettings {
            throttle: Duration::from_millis(self.config.throttle_ms),
            result_buffer_size: self.config.result_buffer_size,
            event_capacity: self.config.event_capacity,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, Arc<StreamingTask>>> {
        match self.tasks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Arc<StreamingTask>>> {
        match self.tasks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a pending task, with a fresh id when `id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the concurrency cap is reached or the id is taken.
    pub fn create_task(&self, id: Option<TaskId>) -> Result<Arc<StreamingTask>, StreamingError> {
        let mut tasks = self.write();

        let active = tasks
            .values()
            .filter(|t| !t.current_status().is_terminal())
            .count();
        if active >= self.config.max_concurrent_tasks {
            tracing::warn!(active, max = self.config.max_concurrent_tasks, "Task rejected");
            return Err(StreamingError::CapacityExceeded {
                max: self.config.max_concurrent_tasks,
            });
        }

        let id = id.unwrap_or_else(|| TaskId::new(uuid::Uuid::new_v4().to_string()));
        if tasks.contains_key(&id) {
            return Err(StreamingError::DuplicateTask(id));
        }

        let task = Arc::new(
            StreamingTask::new(id.clone(), self.settings())
                .with_forward(self.events.clone())
                .with_history(Arc::clone(&self.runtime)),
        );
        tasks.insert(id.clone(), Arc::clone(&task));
        tracing::debug!(task_id = %id, "Task created");
        Ok(task)
    }

    /// Look up a task.
    #[must_use]
    pub fn get_task(&self, id: &TaskId) -> Option<Arc<StreamingTask>> {
        self.read().get(id).cloned()
    }

    /// Cancel a task. Returns `false` if it had already ended.
    ///
    /// # Errors
    ///
    /// Returns error if the task does not exist.
    pub fn cancel(&self, id: &TaskId, reason: impl Into<String>) -> Result<bool, StreamingError> {
        let task = self
            .get_task(id)
            .ok_or_else(|| StreamingError::NotFound(id.clone()))?;
        Ok(task.cancel(reason))
    }

    /// Forget a task, cancelling it first if it is still live.
    pub fn cleanup_task(&self, id: &TaskId) -> bool {
        let Some(task) = self.write().remove(id) else {
            return false;
        };
        task.cancel("Task cleaned up");
        true
    }

    /// Snapshots of every known task.
    #[must_use]
    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self.read().values().map(|t| t.status()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Tasks pending or running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.read()
            .values()
            .filter(|t| !t.current_status().is_terminal())
            .count()
    }

    /// Events of every task from now on.
    #[must_use]
    pub fn subscribe(&self) -> impl Stream<Item = ProgressEvent> + Send + use<> {
        into_stream(self.events.subscribe())
    }

    /// Validate `plan`, create a task for it and run it in the background.
    ///
    /// The task completes, fails or is cancelled according to the
    /// controller's report. If it is still running when the task timeout
    /// elapses it is failed and its token cancelled; the controller then
    /// winds down at its next suspension point.
    ///
    /// # Errors
    ///
    /// Returns error if the plan is invalid or the task cannot be created.
    pub fn run_plan(
        &self,
        plan: Plan,
        options: CorrectionOptions,
    ) -> Result<(Arc<StreamingTask>, JoinHandle<CorrectionReport>), StreamingError> {
        validate_plan(&plan)?;
        let task = self.create_task(options.task_id.clone())?;
        let options = options.for_task(task.id().clone());
        let controller = SelfCorrectionController::new(Arc::clone(&self.runtime));
        let task_timeout = Duration::from_millis(self.config.task_timeout_ms);

        let handle = tokio::spawn({
            let task = Arc::clone(&task);
            async move { drive(task, controller, plan, options, task_timeout).await }
        });

        Ok((task, handle))
    }
}

async fn drive(
    task: Arc<StreamingTask>,
    controller: SelfCorrectionController,
    plan: Plan,
    options: CorrectionOptions,
    task_timeout: Duration,
) -> CorrectionReport {
    let token = task.cancellation();
    if let Err(e) = task.start(plan.len()) {
        tracing::warn!(task_id = %task.id(), error = %e, "Task could not start");
    }

    let observer = TaskObserver {
        task: Arc::clone(&task),
    };
    let run = controller.execute_with_correction(plan, &token, &options, &observer);
    tokio::pin!(run);

    let within_deadline = tokio::time::timeout(task_timeout, &mut run).await;
    let report = match within_deadline {
        Ok(report) => report,
        Err(_) => {
            let message = format!("Task timed out after {}ms", task_timeout.as_millis());
            task.fail(message.clone());
            token.cancel(message);
            run.await
        }
    };

    match report.status {
        CorrectionStatus::Succeeded => {
            let values: Vec<serde_json::Value> = report.values().into_iter().cloned().collect();
            task.complete(json!({
                "attempts": report.attempts,
                "corrections": report.corrections.len(),
                "results": values,
            }));
        }
        CorrectionStatus::Failed => {
            task.fail(report.error.clone().unwrap_or_else(|| "Plan failed".to_string()));
        }
        CorrectionStatus::Cancelled => {
            task.cancel(report.error.clone().unwrap_or_else(|| "Cancelled".to_string()));
        }
    }

    report
}

/// Forwards controller progress into a streaming task.
struct TaskObserver {
    task: Arc<StreamingTask>,
}

impl CorrectionObserver for TaskObserver {
    fn on_attempt_started(&self, attempt: u32, plan: &Plan) {
        self.task.set_total_steps(plan.len());
        if attempt > 1 {
            self.task.milestone(
                "attempt_started",
                json!({"attempt": attempt, "steps": plan.len()}),
            );
            let _ = self.task.update_progress(0, format!("Attempt {attempt}"));
        }
    }

    fn on_step_started(&self, _attempt: u32, index: usize, step: &Step) {
        tracing::debug!(task_id = %self.task.id(), step = index, tool = %step.tool, "Step started");
    }

    fn on_step_finished(&self, attempt: u32, result: &ExecutionResult) {
        if let Some(value) = &result.value {
            let _ = self.task.add_result(json!({
                "attempt": attempt,
                "step": result.step_index,
                "tool": result.tool,
                "value": value,
            }));
        }
        let message = if result.success {
            format!("Step {} ({}) done", result.step_index + 1, result.tool)
        } else {
            format!("Step {} ({}) failed", result.step_index + 1, result.tool)
        };
        // Errors here mean the task was cancelled; nothing more to report.
        let _ = self.task.update_progress(result.step_index + 1, message);
    }

    fn on_correction(&self, correction: &Correction) {
        self.task.milestone(
            "correction",
            json!({
                "attempt": correction.attempt,
                "pattern": correction.diagnosis.pattern,
                "strategy": correction.strategy,
                "changes": correction.changes,
            }),
        );
    }
}
