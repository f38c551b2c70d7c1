//! # Waypoint Executor
//!
//! Runs agent plans step by step and keeps them on track.
//!
//! This crate provides:
//! - A sandboxed step executor (timeouts, retries, file snapshots and rollback)
//! - Checkpoint validation of step results against capability contracts
//! - A self-correction loop that diagnoses failures and rewrites the plan
//! - Streaming progress events and cooperative cancellation
//!
//! ```no_run
//! use waypoint_core::types::{Plan, Step};
//! use waypoint_executor::prelude::*;
//!
//! # async fn run() {
//! let runtime = RuntimeContext::builder().build();
//! let manager = std::sync::Arc::new(StreamingManager::new(runtime));
//!
//! let plan = Plan::new(vec![Step::new("echo", serde_json::json!({"message": "hi"}))]);
//! let (task, handle) = manager.run_plan(plan, CorrectionOptions::default()).unwrap();
//! let report = handle.await.unwrap();
//! println!("{} after {} attempt(s)", task.status().status, report.attempts);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod capability;
pub mod checkpoint;
pub mod context;
pub mod correction;
pub mod executor;
pub mod llm;
pub mod process;
pub mod streaming;
pub mod template;

pub use cancel::CancellationToken;
pub use capability::{Capability, CapabilityContext, CapabilityError, CapabilityRegistry};
pub use checkpoint::{
    CheckpointOptions, CheckpointValidator, Recommendation, RuleResult, ValidationOutcome,
};
pub use context::{RuntimeContext, RuntimeContextBuilder};
pub use correction::{
    Correction, CorrectionObserver, CorrectionOptions, CorrectionReport, CorrectionStatus,
    NoopObserver, SelfCorrectionController,
};
pub use executor::{StepError, StepExecutor, StepFault, StepOutcome, StepSuccess};
pub use llm::LlmClient;
pub use streaming::{
    ProgressEvent, ProgressKind, StreamingError, StreamingManager, StreamingTask, TaskSnapshot,
    TaskStatus,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::capability::{Capability, CapabilityContext, CapabilityError};
    pub use crate::context::RuntimeContext;
    pub use crate::correction::{CorrectionOptions, CorrectionReport, CorrectionStatus};
    pub use crate::streaming::{ProgressEvent, ProgressKind, StreamingManager, TaskStatus};
}
