mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use waypoint_core::types::{Plan, Step};
use waypoint_executor::capability::{CapabilityContext, CapabilityRegistry};
use waypoint_executor::correction::{
    CorrectionOptions, CorrectionSource, CorrectionStatus, NoopObserver, SelfCorrectionController,
};
use waypoint_executor::executor::{StepExecutor, StepFault};
use waypoint_executor::CancellationToken;

use common::{Installer, NeedsPackage, Sleeper, SlowWriter, runtime, test_config};

fn registry_with_missing_package(
    name: &'static str,
    output: serde_json::Value,
) -> (CapabilityRegistry, Arc<std::sync::Mutex<Vec<String>>>) {
    let installed = Arc::new(AtomicBool::new(false));
    let packages = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut registry = CapabilityRegistry::with_builtins();
    registry.register(Arc::new(NeedsPackage {
        name,
        module: "xyz",
        output,
        installed: Arc::clone(&installed),
    }));
    registry.register(Arc::new(Installer {
        installed,
        packages: Arc::clone(&packages),
    }));
    (registry, packages)
}

#[tokio::test]
async fn missing_dependency_is_installed_on_the_next_attempt() {
    let (registry, packages) =
        registry_with_missing_package("file_writer", json!({"path": "out.txt", "bytes": 2}));

    let config = test_config();
    let controller = SelfCorrectionController::new(runtime(registry, config.clone()));
    let plan = Plan::new(vec![Step::new(
        "file_writer",
        json!({"path": "out.txt", "content": "hi"}),
    )]);
    let options = CorrectionOptions {
        max_retries: 2,
        ..CorrectionOptions::from_config(&config)
    };

    let report = controller
        .execute_with_correction(plan, &CancellationToken::new(), &options, &NoopObserver)
        .await;

    assert_eq!(report.status, CorrectionStatus::Succeeded);
    assert!(report.success);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.corrections.len(), 1);

    let correction = &report.corrections[0];
    assert_eq!(correction.diagnosis.pattern, "missing_dependency");
    assert_eq!(correction.strategy, "add_dependency");
    assert_eq!(correction.source, CorrectionSource::Strategy);
    assert_eq!(correction.new_plan.len(), 2);

    let tools: Vec<&str> = report.final_plan.steps().iter().map(|s| s.tool.as_str()).collect();
    assert_eq!(tools, vec!["install_dependency", "file_writer"]);
    assert_eq!(*packages.lock().unwrap(), vec!["xyz".to_string()]);

    let last = report.result.as_ref().unwrap();
    assert_eq!(last.total_steps, 2);
    assert_eq!(last.success_count, 2);
}

#[tokio::test]
async fn install_step_lands_before_the_failed_index() {
    let (registry, _) = registry_with_missing_package("run_script", json!({"stdout": "ok"}));

    let config = test_config();
    let controller = SelfCorrectionController::new(runtime(registry, config.clone()));
    let plan = Plan::new(vec![
        Step::new("echo", json!({"message": "prepare"})),
        Step::new("run_script", json!({"script": "index.js"})),
        Step::new("echo", json!({"message": "report"})),
    ]);

    let report = controller
        .execute_with_correction(
            plan,
            &CancellationToken::new(),
            &CorrectionOptions::from_config(&config),
            &NoopObserver,
        )
        .await;

    assert!(report.success);
    // The first attempt ran every step despite the failure in the middle.
    assert_eq!(report.reports[0].total_steps, 3);
    assert_eq!(report.reports[0].failed_indices(), vec![1]);

    let tools: Vec<&str> = report.final_plan.steps().iter().map(|s| s.tool.as_str()).collect();
    assert_eq!(tools, vec!["echo", "install_dependency", "run_script", "echo"]);
}

#[tokio::test(start_paused = true)]
async fn persistent_timeout_exhausts_attempts() {
    let mut registry = CapabilityRegistry::with_builtins();
    registry.register(Arc::new(Sleeper::new("hang", Duration::from_secs(3600))));

    let config = test_config();
    let controller = SelfCorrectionController::new(runtime(registry, config.clone()));

    let mut step_b = Step::new("hang", json!({})).with_title("stepB");
    step_b.timeout_ms = Some(100);
    let plan = Plan::new(vec![Step::new("echo", json!({"message": "stepA"})), step_b]);

    let options = CorrectionOptions {
        max_retries: 3,
        ..CorrectionOptions::from_config(&config)
    };
    let report = controller
        .execute_with_correction(plan, &CancellationToken::new(), &options, &NoopObserver)
        .await;

    assert_eq!(report.status, CorrectionStatus::Failed);
    assert!(!report.success);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.reports.len(), 3);
    for attempt in &report.reports {
        assert_eq!(attempt.failed_indices(), vec![1]);
        assert_eq!(attempt.success_count, 1);
    }

    // Two corrections, each doubling the deadline.
    assert_eq!(report.corrections.len(), 2);
    assert!(report.corrections.iter().all(|c| c.strategy == "increase_timeout"));
    assert_eq!(report.final_plan.steps()[1].timeout_ms, Some(400));
    assert!(report.error.as_deref().unwrap_or_default().contains("3 attempt(s)"));
}

#[tokio::test]
async fn timed_out_write_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("report.md");
    std::fs::write(&target, "original").unwrap();

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(SlowWriter));

    let mut config = test_config();
    config.executor.snapshot_dir = Some(dir.path().to_path_buf());
    let executor = StepExecutor::new(runtime(registry, config.clone()));

    let mut step = Step::new("slow_writer", json!({"path": target}));
    step.timeout_ms = Some(50);

    let err = executor
        .execute_safely(&step, &CapabilityContext::default(), &config.executor)
        .await
        .unwrap_err();

    assert!(matches!(err.fault, StepFault::Timeout { timeout_ms: 50 }));
    assert_eq!(err.attempts, 1);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "original");

    // Only the target remains; the backup was consumed by the rollback.
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[tokio::test]
async fn cancelled_token_stops_before_the_first_step() {
    let sleeper = Sleeper::new("work", Duration::from_millis(1));
    let calls = Arc::clone(&sleeper.calls);
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(sleeper));

    let config = test_config();
    let controller = SelfCorrectionController::new(runtime(registry, config.clone()));
    let token = CancellationToken::new();
    token.cancel("user");

    let report = controller
        .execute_with_correction(
            Plan::new(vec![Step::new("work", json!({}))]),
            &token,
            &CorrectionOptions::from_config(&config),
            &NoopObserver,
        )
        .await;

    assert_eq!(report.status, CorrectionStatus::Cancelled);
    assert_eq!(report.error.as_deref(), Some("user"));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_the_last_step_is_not_reported_as_success() {
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Sleeper::new("work", Duration::from_millis(100))));

    let config = test_config();
    let controller = SelfCorrectionController::new(runtime(registry, config.clone()));
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel("user");
    });

    let report = controller
        .execute_with_correction(
            Plan::new(vec![Step::new("work", json!({}))]),
            &token,
            &CorrectionOptions::from_config(&config),
            &NoopObserver,
        )
        .await;

    assert_eq!(report.status, CorrectionStatus::Cancelled);
    assert!(!report.success);
    assert_eq!(report.error.as_deref(), Some("user"));
}
