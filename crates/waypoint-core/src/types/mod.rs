//! Core plan types used throughout Waypoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a streaming task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new task ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One capability invocation with parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Capability identifier.
    pub tool: String,

    /// Capability parameters (a JSON object).
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,

    /// Human-readable title.
    #[serde(default)]
    pub title: String,

    /// Per-step timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Per-step retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Annotations added by corrections (e.g. `regenerate`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Step {
    /// Create a new step.
    #[must_use]
    pub fn new(tool: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            params,
            title: String::new(),
            timeout_ms: None,
            retries: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the timeout override.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the retry override.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Title for display, falling back to the capability id.
    #[must_use]
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.tool
        } else {
            &self.title
        }
    }

    /// Get a string parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(serde_json::Value::as_str)
    }

    /// Whether a boolean metadata flag is set.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Ordered sequence of steps.
///
/// A plan is never edited once dispatched; corrections build a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// Create a plan from steps.
    #[must_use]
    pub const fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// The steps in order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Get a step by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Consume the plan, returning its steps.
    #[must_use]
    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

impl From<Vec<Step>> for Plan {
    fn from(steps: Vec<Step>) -> Self {
        Self::new(steps)
    }
}

/// Outcome of one step within one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Index of the step in the attempt's plan.
    pub step_index: usize,
    /// Capability that ran.
    pub tool: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Result value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent on the step.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Create a successful result.
    #[must_use]
    pub fn succeeded(
        step_index: usize,
        tool: impl Into<String>,
        value: serde_json::Value,
        duration: Duration,
    ) -> Self {
        Self {
            step_index,
            tool: tool.into(),
            success: true,
            value: Some(value),
            error: None,
            duration,
        }
    }

    /// Create a failed result.
    #[must_use]
    pub fn failed(
        step_index: usize,
        tool: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            step_index,
            tool: tool.into(),
            success: false,
            value: None,
            error: Some(error.into()),
            duration,
        }
    }
}

/// All results of one whole-plan attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecutionReport {
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Number of steps executed.
    pub total_steps: usize,
    /// Number of successful steps.
    pub success_count: usize,
    /// Results of the failed steps.
    pub failed_steps: Vec<ExecutionResult>,
    /// Every result, in step order.
    pub results: Vec<ExecutionResult>,
}

impl PlanExecutionReport {
    /// Build a report from the results of one attempt.
    #[must_use]
    pub fn from_results(attempt: u32, results: Vec<ExecutionResult>) -> Self {
        let failed_steps: Vec<ExecutionResult> =
            results.iter().filter(|r| !r.success).cloned().collect();
        Self {
            attempt,
            total_steps: results.len(),
            success_count: results.len() - failed_steps.len(),
            failed_steps,
            results,
        }
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed_steps.len()
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed_steps.is_empty()
    }

    /// Indices of the failed steps.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed_steps.iter().map(|r| r.step_index).collect()
    }

    /// Concatenated error text of the failed steps.
    #[must_use]
    pub fn error_summary(&self) -> String {
        self.failed_steps
            .iter()
            .map(|r| {
                format!(
                    "[step {} {}] {}",
                    r.step_index,
                    r.tool,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input/prompt tokens.
    pub input_tokens: u64,
    /// Output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Get total tokens used.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Serialize a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_counts_add_up() {
        let results = vec![
            ExecutionResult::succeeded(0, "echo", serde_json::json!({}), Duration::ZERO),
            ExecutionResult::failed(1, "shell", "boom", Duration::ZERO),
            ExecutionResult::succeeded(2, "echo", serde_json::json!({}), Duration::ZERO),
        ];
        let report = PlanExecutionReport::from_results(1, results);

        assert_eq!(report.total_steps, 3);
        assert_eq!(report.success_count + report.failed_count(), report.total_steps);
        assert_eq!(report.failed_indices(), vec![1]);
        assert_eq!(report.error_summary(), "[step 1 shell] boom");
    }

    #[test]
    fn test_step_deserializes_with_defaults() {
        let step: Step = serde_json::from_str(r#"{"tool": "echo"}"#).unwrap();
        assert_eq!(step.display_title(), "echo");
        assert!(step.params.is_object());
        assert_eq!(step.timeout_ms, None);
    }

    #[test]
    fn test_duration_serialized_as_millis() {
        let result =
            ExecutionResult::failed(0, "shell", "boom", Duration::from_millis(1500));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["stepIndex"], 0);
    }
}
