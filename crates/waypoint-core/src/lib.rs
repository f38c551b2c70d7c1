//! # Waypoint Core
//!
//! Core types, configuration, and storage for Waypoint.
//!
//! This crate provides:
//! - The plan data model (plans, steps, execution results)
//! - Configuration loading and validation (JSON5 format)
//! - Append-only execution history (sled)
//! - Plan input validation
//! - API key handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod history;
pub mod secrets;
pub mod types;
pub mod validation;

pub use config::{Config, ConfigError, LogFormat};
pub use history::{HistoryError, HistoryEvent, HistoryKind, HistorySink, HistoryStore};
pub use secrets::{ApiKey, scrub_secrets};
pub use types::{ExecutionResult, Plan, PlanExecutionReport, Step, TaskId, TokenUsage};
pub use validation::{PlanValidationError, validate_plan};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::history::{HistoryEvent, HistoryKind, HistorySink};
    pub use crate::types::*;
    pub use crate::validation::validate_plan;
}
