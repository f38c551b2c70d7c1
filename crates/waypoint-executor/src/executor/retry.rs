//! Retry classification and backoff.

use std::time::Duration;

use crate::capability::CapabilityError;

/// Error codes that mark a failure as transient.
const RETRYABLE_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "EPIPE",
    "ENOTFOUND",
    "EAI_AGAIN",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "EBUSY",
    "EAGAIN",
    "EMFILE",
];

/// Lowercase message fragments that mark a failure as transient.
const RETRYABLE_MESSAGES: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "socket hang up",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "resource busy",
    "too many requests",
    "rate limit",
    "503",
    "502",
];

/// Whether a capability error is worth retrying.
#[must_use]
pub fn is_retryable(error: &CapabilityError) -> bool {
    match error {
        CapabilityError::NotFound(_) | CapabilityError::InvalidParams(_) => false,
        CapabilityError::Failed { message, code } => {
            if code
                .as_deref()
                .is_some_and(|c| RETRYABLE_CODES.contains(&c))
            {
                return true;
            }
            let message = message.to_lowercase();
            RETRYABLE_MESSAGES.iter().any(|m| message.contains(m))
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base × 2^(attempt−1)`.
#[must_use]
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1_u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}
