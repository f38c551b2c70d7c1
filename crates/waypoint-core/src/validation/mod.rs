//! Plan input validation.
//!
//! Plans arrive from an external producer; reject malformed ones before any
//! step is dispatched.

use thiserror::Error;

use crate::types::{Plan, Step};

/// Size limits for plan input.
pub mod limits {
    /// Maximum capability id length.
    pub const MAX_TOOL_ID_LENGTH: usize = 64;

    /// Maximum serialized params size per step (1MB).
    pub const MAX_PARAMS_SIZE: usize = 1024 * 1024;

    /// Maximum JSON nesting depth of params.
    pub const MAX_JSON_DEPTH: usize = 32;

    /// Maximum number of steps in a plan.
    pub const MAX_STEPS: usize = 256;
}

/// Plan validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanValidationError {
    /// Plan has no steps.
    #[error("Plan has no steps")]
    Empty,

    /// Plan has too many steps.
    #[error("Plan has {actual} steps (max {max})")]
    TooManySteps {
        /// Maximum allowed.
        max: usize,
        /// Actual count.
        actual: usize,
    },

    /// Capability id is malformed.
    #[error("Step {index}: invalid capability id '{tool}'")]
    InvalidTool {
        /// Step index.
        index: usize,
        /// Offending id.
        tool: String,
    },

    /// Params are not a JSON object.
    #[error("Step {index}: params must be an object")]
    ParamsNotObject {
        /// Step index.
        index: usize,
    },

    /// Params exceed the size limit.
    #[error("Step {index}: params exceed {max} bytes")]
    ParamsTooLarge {
        /// Step index.
        index: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Params nest too deeply.
    #[error("Step {index}: params nest deeper than {max} levels")]
    ParamsTooDeep {
        /// Step index.
        index: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Zero timeout override.
    #[error("Step {index}: timeout cannot be 0")]
    ZeroTimeout {
        /// Step index.
        index: usize,
    },
}

/// Validate a plan before dispatch.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanValidationError> {
    if plan.is_empty() {
        return Err(PlanValidationError::Empty);
    }
    if plan.len() > limits::MAX_STEPS {
        return Err(PlanValidationError::TooManySteps {
            max: limits::MAX_STEPS,
            actual: plan.len(),
        });
    }

    for (index, step) in plan.steps().iter().enumerate() {
        validate_step(index, step)?;
    }
    Ok(())
}

fn validate_step(index: usize, step: &Step) -> Result<(), PlanValidationError> {
    if !is_valid_tool_id(&step.tool) {
        return Err(PlanValidationError::InvalidTool {
            index,
            tool: step.tool.clone(),
        });
    }

    if !step.params.is_object() {
        return Err(PlanValidationError::ParamsNotObject { index });
    }

    let size = serde_json::to_vec(&step.params).map_or(usize::MAX, |v| v.len());
    if size > limits::MAX_PARAMS_SIZE {
        return Err(PlanValidationError::ParamsTooLarge {
            index,
            max: limits::MAX_PARAMS_SIZE,
        });
    }

    if json_depth(&step.params) > limits::MAX_JSON_DEPTH {
        return Err(PlanValidationError::ParamsTooDeep {
            index,
            max: limits::MAX_JSON_DEPTH,
        });
    }

    if step.timeout_ms == Some(0) {
        return Err(PlanValidationError::ZeroTimeout { index });
    }

    Ok(())
}

/// Whether a capability id is well formed.
#[must_use]
pub fn is_valid_tool_id(tool: &str) -> bool {
    !tool.is_empty()
        && tool.len() <= limits::MAX_TOOL_ID_LENGTH
        && tool
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_plan() {
        let plan = Plan::new(vec![
            Step::new("echo", json!({"text": "hi"})),
            Step::new("file_writer", json!({"path": "/tmp/a", "content": "x"})),
        ]);
        assert_eq!(validate_plan(&plan), Ok(()));
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert_eq!(validate_plan(&Plan::default()), Err(PlanValidationError::Empty));
    }

    #[test]
    fn test_invalid_tool_id() {
        let plan = Plan::new(vec![Step::new("Run Shell", json!({}))]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanValidationError::InvalidTool { index: 0, .. })
        ));
    }

    #[test]
    fn test_params_must_be_object() {
        let plan = Plan::new(vec![Step::new("echo", json!("text"))]);
        assert_eq!(
            validate_plan(&plan),
            Err(PlanValidationError::ParamsNotObject { index: 0 })
        );
    }

    #[test]
    fn test_deep_params_rejected() {
        let mut value = json!(1);
        for _ in 0..40 {
            value = json!({ "n": value });
        }
        let plan = Plan::new(vec![Step::new("echo", value)]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanValidationError::ParamsTooDeep { .. })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let plan = Plan::new(vec![Step::new("echo", json!({})).with_timeout_ms(0)]);
        assert_eq!(
            validate_plan(&plan),
            Err(PlanValidationError::ZeroTimeout { index: 0 })
        );
    }
}
