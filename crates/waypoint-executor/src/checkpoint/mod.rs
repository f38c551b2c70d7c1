//! Checkpoint validation of step results.
//!
//! Five rules run on each result before the controller advances:
//!
//! | Rule | Critical (non-strict) |
//! |------|-----------------------|
//! | `completeness` | yes |
//! | `required_outputs` / `optional_outputs` | yes / no |
//! | `dependencies` (next step's placeholders) | no |
//! | `types` | no |
//! | `quality` (LLM score, opt-in) | yes |
//!
//! Strict mode makes every rule critical. Validation never fails; a broken
//! LLM reply or history write degrades to a passing rule or a log line.

mod contract;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_core::config::CheckpointConfig;
use waypoint_core::history::HistoryKind;
use waypoint_core::types::{Plan, TaskId};

use crate::context::RuntimeContext;
use crate::llm::{prompt, truncate_for_prompt};
use crate::template;

pub use contract::{CapabilityContract, ContractRegistry, FieldSpec, ValueType};

const QUALITY_SYSTEM_PROMPT: &str = "You review the output of one step of an automated plan. \
Rate how well the output fulfils the step on a scale from 0 to 1. \
Reply with JSON only: {\"score\": <number>, \"reason\": \"<short reason>\"}.";

/// What the controller should do with a validated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Every rule passed.
    Continue,
    /// A critical rule failed.
    Retry,
    /// Only non-critical rules failed.
    ContinueWithWarning,
}

/// Result of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    /// Rule name.
    pub rule: String,
    /// Whether the rule passed.
    pub passed: bool,
    /// Whether a failure of this rule blocks the step.
    pub critical: bool,
    /// Human-readable detail.
    pub message: String,
}

impl RuleResult {
    fn new(rule: &str, passed: bool, critical: bool, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            passed,
            critical,
            message: message.into(),
        }
    }
}

/// Outcome of validating one step's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    /// Index of the validated step.
    pub step_index: usize,
    /// Whether the step may be accepted.
    pub passed: bool,
    /// Per-rule results, in evaluation order.
    pub rules: Vec<RuleResult>,
    /// Suggested next action.
    pub recommendation: Recommendation,
}

impl ValidationOutcome {
    fn aggregate(step_index: usize, rules: Vec<RuleResult>, strict: bool) -> Self {
        let critical_failed = rules.iter().any(|r| !r.passed && r.critical);
        let any_failed = rules.iter().any(|r| !r.passed);

        let passed = if strict { !any_failed } else { !critical_failed };
        let recommendation = if critical_failed {
            Recommendation::Retry
        } else if any_failed {
            Recommendation::ContinueWithWarning
        } else {
            Recommendation::Continue
        };

        Self {
            step_index,
            passed,
            rules,
            recommendation,
        }
    }

    /// Messages of the failed rules.
    #[must_use]
    pub fn failures(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.message.as_str())
            .collect()
    }
}

/// Per-call validation options.
#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    /// Every rule is critical.
    pub strict: bool,
    /// Allow LLM quality scoring.
    pub quality_check: bool,
    /// Minimum acceptable quality score.
    pub quality_threshold: f64,
    /// Task to record the outcome under.
    pub task_id: Option<TaskId>,
}

impl CheckpointOptions {
    /// Attach the task id used for history.
    #[must_use]
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self::from(&CheckpointConfig::default())
    }
}

impl From<&CheckpointConfig> for CheckpointOptions {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            strict: config.strict,
            quality_check: config.quality_check,
            quality_threshold: config.quality_threshold,
            task_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QualityReply {
    score: f64,
    #[serde(default)]
    reason: Option<String>,
}

/// Validates step results against capability contracts.
#[derive(Clone)]
pub struct CheckpointValidator {
    runtime: Arc<RuntimeContext>,
}

impl CheckpointValidator {
    /// Create a validator.
    #[must_use]
    pub const fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }

    /// Validate the result of step `step_index` of `plan`.
    pub async fn validate_checkpoint(
        &self,
        step_index: usize,
        result: Option<&serde_json::Value>,
        plan: &Plan,
        options: &CheckpointOptions,
    ) -> ValidationOutcome {
        let Some(step) = plan.get(step_index) else {
            let rule = RuleResult::new(
                "completeness",
                false,
                true,
                format!("Step {step_index} is not part of the plan"),
            );
            return ValidationOutcome::aggregate(step_index, vec![rule], options.strict);
        };

        let contract = self.runtime.contracts().get(&step.tool);
        let critical = |base: bool| base || options.strict;
        let mut rules = Vec::with_capacity(6);

        rules.push(check_completeness(result, critical(true)));

        let value = result.unwrap_or(&serde_json::Value::Null);
        if let Some(contract) = contract {
            rules.extend(check_outputs(contract, value, &critical));
        }

        if let Some(next) = plan.get(step_index + 1) {
            rules.push(check_dependencies(&next.params, value, critical(false)));
        }

        if let Some(contract) = contract {
            rules.push(check_types(contract, value, critical(false)));
        }

        let quality_wanted = step
            .metadata
            .get("qualityCheck")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or_else(|| contract.is_some_and(|c| c.quality_check));
        if options.quality_check && quality_wanted && result.is_some() {
            if let Some(rule) = self.check_quality(step, value, options, critical(true)).await {
                rules.push(rule);
            }
        }

        let outcome = ValidationOutcome::aggregate(step_index, rules, options.strict);
        tracing::debug!(
            tool = %step.tool,
            step = step_index,
            passed = outcome.passed,
            recommendation = ?outcome.recommendation,
            "Checkpoint validated"
        );

        if let Some(task_id) = &options.task_id {
            match serde_json::to_value(&outcome) {
                Ok(payload) => self.runtime.record(task_id, HistoryKind::Validation, payload),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize validation outcome"),
            }
        }

        outcome
    }

    /// Score the result with the LLM; `None` when no LLM is configured.
    async fn check_quality(
        &self,
        step: &waypoint_core::types::Step,
        value: &serde_json::Value,
        options: &CheckpointOptions,
        critical: bool,
    ) -> Option<RuleResult> {
        let llm = self.runtime.llm()?;

        let user = format!(
            "Step: {}\nCapability: {}\nParameters: {}\nOutput:\n{}",
            step.display_title(),
            step.tool,
            truncate_for_prompt(&step.params.to_string(), 2_000),
            truncate_for_prompt(&value.to_string(), 6_000),
        );
        let reply: Option<QualityReply> = llm
            .complete_json(prompt(QUALITY_SYSTEM_PROMPT, user), Some(0.0))
            .await;

        let rule = match reply.filter(|r| (0.0..=1.0).contains(&r.score)) {
            Some(reply) if reply.score >= options.quality_threshold => RuleResult::new(
                "quality",
                true,
                critical,
                format!("Quality score {:.2}", reply.score),
            ),
            Some(reply) => RuleResult::new(
                "quality",
                false,
                critical,
                format!(
                    "Quality score {:.2} below {:.2}: {}",
                    reply.score,
                    options.quality_threshold,
                    reply.reason.as_deref().unwrap_or("no reason given")
                ),
            ),
            None => RuleResult::new(
                "quality",
                true,
                critical,
                "Quality check unavailable, skipped",
            ),
        };
        Some(rule)
    }
}

fn check_completeness(result: Option<&serde_json::Value>, critical: bool) -> RuleResult {
    match result {
        None | Some(serde_json::Value::Null) => {
            RuleResult::new("completeness", false, critical, "Step produced no result")
        }
        Some(value)
            if value.get("success").and_then(serde_json::Value::as_bool) == Some(false) =>
        {
            RuleResult::new(
                "completeness",
                false,
                critical,
                "Step result reports success=false",
            )
        }
        Some(_) => RuleResult::new("completeness", true, critical, "Result present"),
    }
}

fn check_outputs(
    contract: &CapabilityContract,
    value: &serde_json::Value,
    critical: &impl Fn(bool) -> bool,
) -> Vec<RuleResult> {
    let absent = |required: bool| -> Vec<&str> {
        contract
            .fields
            .iter()
            .filter(|f| f.required == required && value.get(&f.name).is_none())
            .map(|f| f.name.as_str())
            .collect()
    };

    let mut rules = Vec::with_capacity(2);
    for (rule, required) in [("required_outputs", true), ("optional_outputs", false)] {
        if !contract.fields.iter().any(|f| f.required == required) {
            continue;
        }
        let missing = absent(required);
        let message = if missing.is_empty() {
            "All expected outputs present".to_string()
        } else {
            format!("Missing expected outputs: {}", missing.join(", "))
        };
        rules.push(RuleResult::new(rule, missing.is_empty(), critical(required), message));
    }
    rules
}

fn check_dependencies(
    next_params: &serde_json::Value,
    value: &serde_json::Value,
    critical: bool,
) -> RuleResult {
    let unresolved: Vec<String> = template::placeholders(next_params)
        .into_iter()
        .filter(|path| template::lookup(value, path).is_none())
        .collect();

    if unresolved.is_empty() {
        RuleResult::new("dependencies", true, critical, "Next step inputs available")
    } else {
        RuleResult::new(
            "dependencies",
            false,
            critical,
            format!("Next step needs missing fields: {}", unresolved.join(", ")),
        )
    }
}

fn check_types(
    contract: &CapabilityContract,
    value: &serde_json::Value,
    critical: bool,
) -> RuleResult {
    let mismatched: Vec<String> = contract
        .fields
        .iter()
        .filter_map(|f| {
            let ty = f.value_type?;
            let actual = value.get(&f.name)?;
            (!ty.matches(actual)).then(|| format!("{} (expected {})", f.name, ty.as_str()))
        })
        .collect();

    if mismatched.is_empty() {
        RuleResult::new("types", true, critical, "Output types match")
    } else {
        RuleResult::new(
            "types",
            false,
            critical,
            format!("Unexpected output types: {}", mismatched.join(", ")),
        )
    }
}
