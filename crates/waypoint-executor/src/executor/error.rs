//! Step failure taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::capability::CapabilityError;

/// Why a step failed.
///
/// Cancellation is not a fault; it is reported as
/// [`StepOutcome::Cancelled`](super::StepOutcome::Cancelled).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepFault {
    /// The capability did not finish before its deadline.
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// A network or resource-busy failure that was retried until the budget ran out.
    #[error("{message}")]
    Transient {
        /// Last error message.
        message: String,
        /// Last error code, if any.
        code: Option<String>,
    },

    /// The capability returned a result its structural validator rejected.
    #[error("Result validation failed: {0}")]
    Validation(String),

    /// Any other capability error; not retried at the step level.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl StepFault {
    /// Machine-readable error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } => Some("ETIMEDOUT"),
            Self::Transient { code, .. } => code.as_deref(),
            Self::Validation(_) => None,
            Self::Capability(e) => e.code(),
        }
    }

    /// Whether the fault is a deadline overrun.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Final error of a step after local retries and rollback.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{tool} failed after {attempts} attempt(s): {fault}")]
pub struct StepError {
    /// Capability that failed.
    pub tool: String,
    /// Invocations made.
    pub attempts: u32,
    /// Underlying fault.
    pub fault: StepFault,
    /// Wall time from dispatch until the step was given up.
    pub duration: Duration,
}
