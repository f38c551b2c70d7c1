//! Plan-mutation strategies.
//!
//! Each strategy is a pure function from the failed plan to a new plan plus
//! a description of the changes. A strategy returns `None` when it does not
//! apply (e.g. no package name in the error), and the controller falls back
//! to LLM regeneration.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use waypoint_core::config::ExecutorConfig;
use waypoint_core::types::{Plan, PlanExecutionReport, Step};

/// Insert a dependency install before the failed step.
pub const ADD_DEPENDENCY: &str = "add_dependency";
/// Clear params and mark the step for regeneration.
pub const REGENERATE_PARAMS: &str = "regenerate_params";
/// Double the failed step's timeout.
pub const INCREASE_TIMEOUT: &str = "increase_timeout";
/// Insert a step creating the missing file.
pub const CREATE_FILE: &str = "create_file";
/// Add retries and a longer backoff.
pub const RETRY_WITH_BACKOFF: &str = "retry_with_backoff";
/// Halve the batch size parameter.
pub const REDUCE_BATCH_SIZE: &str = "reduce_batch_size";
/// Mark the step's code for regeneration.
pub const REGENERATE_CODE: &str = "regenerate_code";
/// Retry, regenerating the whole plan when possible.
pub const RETRY: &str = "retry";

/// Inputs a strategy works from.
pub struct StrategyInput<'a> {
    /// Plan of the failed attempt.
    pub plan: &'a Plan,
    /// Results of the failed attempt.
    pub report: &'a PlanExecutionReport,
    /// Executor defaults for steps without overrides.
    pub executor: &'a ExecutorConfig,
}

/// A mutated plan and what changed.
pub type Mutation = (Plan, Vec<String>);

type StrategyFn = fn(&StrategyInput<'_>) -> Option<Mutation>;

const STRATEGIES: &[(&str, StrategyFn)] = &[
    (ADD_DEPENDENCY, add_dependency),
    (REGENERATE_PARAMS, regenerate_params),
    (INCREASE_TIMEOUT, increase_timeout),
    (CREATE_FILE, create_file),
    (RETRY_WITH_BACKOFF, retry_with_backoff),
    (REDUCE_BATCH_SIZE, reduce_batch_size),
    (REGENERATE_CODE, regenerate_code),
];

/// Apply the strategy named `strategy`, if it is known and applicable.
#[must_use]
pub fn apply(strategy: &str, input: &StrategyInput<'_>) -> Option<Mutation> {
    STRATEGIES
        .iter()
        .find(|(name, _)| *name == strategy)
        .and_then(|(_, f)| f(input))
}

static NPM_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)cannot find (?:module|package) ['"]?([@A-Za-z0-9_][A-Za-z0-9_@./-]*)"#)
        .unwrap_or_else(|e| unreachable!("npm module pattern is valid: {e}"))
});

static PY_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)no module named ['"]?([A-Za-z0-9_][A-Za-z0-9_.-]*)"#)
        .unwrap_or_else(|e| unreachable!("python module pattern is valid: {e}"))
});

static QUOTED_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"]((?:/|\./|\.\./|~/)[^'"]+)['"]"#)
        .unwrap_or_else(|e| unreachable!("quoted path pattern is valid: {e}"))
});

/// Package name and manager named by a missing-dependency error.
#[must_use]
pub fn extract_package(error_text: &str) -> Option<(String, &'static str)> {
    if let Some(caps) = NPM_MODULE.captures(error_text) {
        let module = caps[1].trim_end_matches(['.', '\'', '"']);
        if module.starts_with('.') || module.starts_with('/') {
            return None;
        }
        let mut parts = module.split('/');
        let package = match (parts.next(), parts.next()) {
            (Some(scope), Some(name)) if scope.starts_with('@') => format!("{scope}/{name}"),
            (Some(name), _) => name.to_string(),
            (None, _) => return None,
        };
        return Some((package, "npm"));
    }

    PY_MODULE.captures(error_text).and_then(|caps| {
        caps[1]
            .split('.')
            .next()
            .filter(|s| !s.is_empty())
            .map(|root| (root.to_string(), "pip"))
    })
}

fn failed_errors<'a>(report: &'a PlanExecutionReport) -> impl Iterator<Item = (usize, &'a str)> {
    report
        .failed_steps
        .iter()
        .map(|r| (r.step_index, r.error.as_deref().unwrap_or_default()))
}

/// Rewrite every failed step with `f`, keeping the rest.
fn rewrite_failed(
    input: &StrategyInput<'_>,
    mut f: impl FnMut(&mut Step) -> Option<String>,
) -> Option<Mutation> {
    let failed = input.report.failed_indices();
    let mut changes = Vec::new();
    let steps = input
        .plan
        .steps()
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut step = step.clone();
            if failed.contains(&i) {
                if let Some(change) = f(&mut step) {
                    changes.push(format!("Step {i} ({}): {change}", step.tool));
                }
            }
            step
        })
        .collect();

    (!changes.is_empty()).then(|| (Plan::new(steps), changes))
}

/// Insert `(index, step)` pairs, keeping the original order of the plan.
fn insert_before(plan: &Plan, mut inserts: Vec<(usize, Step)>) -> Plan {
    inserts.sort_by_key(|(i, _)| *i);
    let mut pending = inserts.into_iter().peekable();
    let mut steps = Vec::with_capacity(plan.len() + 1);
    for (i, step) in plan.steps().iter().enumerate() {
        while let Some((_, new)) = pending.next_if(|(at, _)| *at == i) {
            steps.push(new);
        }
        steps.push(step.clone());
    }
    steps.extend(pending.map(|(_, s)| s));
    Plan::new(steps)
}

fn add_dependency(input: &StrategyInput<'_>) -> Option<Mutation> {
    let mut inserts: Vec<(usize, Step)> = Vec::new();
    let mut changes = Vec::new();

    for (index, error) in failed_errors(input.report) {
        let Some((package, manager)) = extract_package(error) else {
            continue;
        };
        if inserts
            .iter()
            .any(|(_, s)| s.param_str("package") == Some(package.as_str()))
        {
            continue;
        }
        changes.push(format!(
            "Install missing {manager} package '{package}' before step {index}"
        ));
        inserts.push((
            index,
            Step::new(
                "install_dependency",
                json!({"package": package, "manager": manager}),
            )
            .with_title(format!("Install {package}")),
        ));
    }

    (!inserts.is_empty()).then(|| (insert_before(input.plan, inserts), changes))
}

fn regenerate_params(input: &StrategyInput<'_>) -> Option<Mutation> {
    rewrite_failed(input, |step| {
        step.params = json!({});
        step.metadata.insert("regenerate".into(), json!(true));
        Some("cleared params for regeneration".to_string())
    })
}

fn increase_timeout(input: &StrategyInput<'_>) -> Option<Mutation> {
    let default = input.executor.timeout_ms;
    rewrite_failed(input, |step| {
        let old = step.timeout_ms.unwrap_or(default);
        let new = old.saturating_mul(2);
        step.timeout_ms = Some(new);
        Some(format!("timeout {old}ms -> {new}ms"))
    })
}

fn create_file(input: &StrategyInput<'_>) -> Option<Mutation> {
    let mut inserts: Vec<(usize, Step)> = Vec::new();
    let mut changes = Vec::new();

    for (index, error) in failed_errors(input.report) {
        let Some(path) = QUOTED_PATH.captures(error).map(|c| c[1].to_string()) else {
            continue;
        };
        if inserts.iter().any(|(_, s)| s.param_str("path") == Some(path.as_str())) {
            continue;
        }
        changes.push(format!("Create missing file '{path}' before step {index}"));
        inserts.push((
            index,
            Step::new("file_writer", json!({"path": path, "content": ""}))
                .with_title(format!("Create {path}")),
        ));
    }

    (!inserts.is_empty()).then(|| (insert_before(input.plan, inserts), changes))
}

fn retry_with_backoff(input: &StrategyInput<'_>) -> Option<Mutation> {
    let executor = input.executor;
    rewrite_failed(input, |step| {
        let retries = step.retries.unwrap_or(executor.max_retries).saturating_add(2);
        let delay = step
            .metadata
            .get("retryDelayMs")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(executor.retry_delay_ms)
            .saturating_mul(2);
        step.retries = Some(retries);
        step.metadata.insert("retryDelayMs".into(), json!(delay));
        Some(format!("retries -> {retries}, backoff base -> {delay}ms"))
    })
}

fn reduce_batch_size(input: &StrategyInput<'_>) -> Option<Mutation> {
    rewrite_failed(input, |step| {
        let key = ["batch_size", "batchSize"]
            .into_iter()
            .find(|k| step.params.get(*k).and_then(serde_json::Value::as_u64).is_some())?;
        let old = step.params[key].as_u64()?;
        let new = (old / 2).max(1);
        step.params[key] = json!(new);
        Some(format!("{key} {old} -> {new}"))
    })
}

fn regenerate_code(input: &StrategyInput<'_>) -> Option<Mutation> {
    rewrite_failed(input, |step| {
        step.metadata.insert("regenerate_code".into(), json!(true));
        Some("marked code for regeneration".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use waypoint_core::types::ExecutionResult;

    fn attempt_report(failures: &[(usize, &str, &str)], total: usize) -> PlanExecutionReport {
        let results = (0..total)
            .map(|i| match failures.iter().find(|(idx, _, _)| *idx == i) {
                Some((_, tool, error)) => ExecutionResult::failed(i, *tool, *error, Duration::ZERO),
                None => ExecutionResult::succeeded(i, "echo", json!({}), Duration::ZERO),
            })
            .collect();
        PlanExecutionReport::from_results(1, results)
    }

    fn tools(plan: &Plan) -> Vec<&str> {
        plan.steps().iter().map(|s| s.tool.as_str()).collect()
    }

    #[test]
    fn test_extract_package() {
        assert_eq!(extract_package("Cannot find module xyz"), Some(("xyz".into(), "npm")));
        assert_eq!(
            extract_package("Error: Cannot find module 'lodash/fp'"),
            Some(("lodash".into(), "npm"))
        );
        assert_eq!(
            extract_package("Cannot find module '@scope/pkg/dist/x.js'"),
            Some(("@scope/pkg".into(), "npm"))
        );
        assert_eq!(
            extract_package("ModuleNotFoundError: No module named 'yaml.loader'"),
            Some(("yaml".into(), "pip"))
        );
        assert_eq!(extract_package("Cannot find module './local'"), None);
        assert_eq!(extract_package("all good"), None);
    }

    #[test]
    fn test_add_dependency_inserts_before_failed_step() {
        let plan = Plan::new(vec![
            Step::new("echo", json!({})),
            Step::new("file_writer", json!({"path": "/tmp/a"})),
        ]);
        let report = attempt_report(&[(1, "file_writer", "Cannot find module 'xyz'")], 2);
        let input = StrategyInput { plan: &plan, report: &report, executor: &ExecutorConfig::default() };

        let (new_plan, changes) = apply(ADD_DEPENDENCY, &input).unwrap();

        assert_eq!(tools(&new_plan), vec!["echo", "install_dependency", "file_writer"]);
        assert_eq!(new_plan.get(1).unwrap().params["package"], "xyz");
        assert_eq!(changes.len(), 1);
        // Original untouched.
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_add_dependency_without_package_does_not_apply() {
        let plan = Plan::new(vec![Step::new("shell", json!({}))]);
        let report = attempt_report(&[(0, "shell", "Cannot find module './x'")], 1);
        let input = StrategyInput { plan: &plan, report: &report, executor: &ExecutorConfig::default() };
        assert!(apply(ADD_DEPENDENCY, &input).is_none());
    }

    #[test]
    fn test_increase_timeout_doubles() {
        let plan = Plan::new(vec![
            Step::new("a", json!({})),
            Step::new("b", json!({})).with_timeout_ms(500),
        ]);
        let report = attempt_report(&[(0, "a", "Timed out"), (1, "b", "Timed out")], 2);
        let config = ExecutorConfig { timeout_ms: 1_000, ..ExecutorConfig::default() };
        let input = StrategyInput { plan: &plan, report: &report, executor: &config };

        let (new_plan, changes) = apply(INCREASE_TIMEOUT, &input).unwrap();
        assert_eq!(new_plan.get(0).unwrap().timeout_ms, Some(2_000));
        assert_eq!(new_plan.get(1).unwrap().timeout_ms, Some(1_000));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_regenerate_params_clears_and_marks() {
        let plan = Plan::new(vec![Step::new("chart", json!({"width": -1}))]);
        let report = attempt_report(&[(0, "chart", "Invalid parameter: width")], 1);
        let input = StrategyInput { plan: &plan, report: &report, executor: &ExecutorConfig::default() };

        let (new_plan, _) = apply(REGENERATE_PARAMS, &input).unwrap();
        let step = new_plan.get(0).unwrap();
        assert_eq!(step.params, json!({}));
        assert!(step.flag("regenerate"));
    }

    #[test]
    fn test_create_file_inserts_writer() {
        let plan = Plan::new(vec![Step::new("read", json!({}))]);
        let report = attempt_report(
            &[(0, "read", "ENOENT: no such file or directory, open '/data/in.csv'")],
            1,
        );
        let input = StrategyInput { plan: &plan, report: &report, executor: &ExecutorConfig::default() };

        let (new_plan, _) = apply(CREATE_FILE, &input).unwrap();
        assert_eq!(tools(&new_plan), vec!["file_writer", "read"]);
        assert_eq!(new_plan.get(0).unwrap().params["path"], "/data/in.csv");
    }

    #[test]
    fn test_retry_with_backoff_metadata() {
        let plan = Plan::new(vec![Step::new("fetch", json!({}))]);
        let report = attempt_report(&[(0, "fetch", "ECONNRESET")], 1);
        let config = ExecutorConfig { max_retries: 1, retry_delay_ms: 100, ..ExecutorConfig::default() };
        let input = StrategyInput { plan: &plan, report: &report, executor: &config };

        let (new_plan, _) = apply(RETRY_WITH_BACKOFF, &input).unwrap();
        let step = new_plan.get(0).unwrap();
        assert_eq!(step.retries, Some(3));
        assert_eq!(step.metadata["retryDelayMs"], 200);
    }

    #[test]
    fn test_reduce_batch_size() {
        let plan = Plan::new(vec![
            Step::new("embed", json!({"batchSize": 64})),
            Step::new("embed", json!({"batch_size": 1})),
        ]);
        let report = attempt_report(&[(0, "embed", "out of memory"), (1, "embed", "out of memory")], 2);
        let input = StrategyInput { plan: &plan, report: &report, executor: &ExecutorConfig::default() };

        let (new_plan, _) = apply(REDUCE_BATCH_SIZE, &input).unwrap();
        assert_eq!(new_plan.get(0).unwrap().params["batchSize"], 32);
        assert_eq!(new_plan.get(1).unwrap().params["batch_size"], 1);

        let plain = Plan::new(vec![Step::new("embed", json!({}))]);
        let report = attempt_report(&[(0, "embed", "out of memory")], 1);
        let input = StrategyInput { plan: &plain, report: &report, executor: &ExecutorConfig::default() };
        assert!(apply(REDUCE_BATCH_SIZE, &input).is_none());
    }

    #[test]
    fn test_unknown_strategy() {
        let plan = Plan::new(vec![Step::new("a", json!({}))]);
        let report = attempt_report(&[(0, "a", "x")], 1);
        let input = StrategyInput { plan: &plan, report: &report, executor: &ExecutorConfig::default() };
        assert!(apply(RETRY, &input).is_none());
        assert!(apply("teleport", &input).is_none());
    }
}
