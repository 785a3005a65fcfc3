//! Failure propagation, stopping, cancellation and graph errors

use kiln_config::BuildConfig;
use kiln_core::{rules, CancellationSource, CollectingSink, EventBus, Statistic};
use kiln_task::testing::{Script, ScriptedExecutor};
use kiln_task::{ExitStatus, GraphError, Scheduler, SkipReason, Task, TaskGraph, TaskResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn task(name: &str) -> Task {
    Task::builder("run", "/w")
        .name(name)
        .command([name])
        .build()
        .unwrap()
}

fn config(continue_after_errors: bool) -> BuildConfig {
    BuildConfig::builder()
        .parallelism(2)
        .continue_after_errors(continue_after_errors)
        .build()
        .unwrap()
}

#[tokio::test]
async fn continue_after_errors_runs_independent_work() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("broken", Script::new().exit_code(1).output("broken: error"));

    let mut graph = TaskGraph::new();
    let broken = graph.add_task(task("broken")).unwrap();
    let after = graph.add_task(task("after")).unwrap();
    graph.add_edge(after, broken).unwrap();
    graph.add_task(task("independent")).unwrap();

    let sink = Arc::new(CollectingSink::new());
    let result = Scheduler::new(config(true), executor.clone())
        .with_events(Arc::new(EventBus::with_sink(sink.clone())))
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    assert!(!result.success());
    assert_eq!(
        result.result("run broken"),
        Some(&TaskResult::Executed(ExitStatus::Exited(1)))
    );
    assert_eq!(
        result.result("run after"),
        Some(&TaskResult::Skipped(SkipReason::DependencyFailed {
            dependency: "run broken".into()
        }))
    );
    assert!(matches!(result.result("run independent"), Some(r) if r.is_success()));
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.skipped, 1);
    assert_eq!(result.statistics.get(Statistic::TasksFailed), 1);

    assert!(result.errors.iter().any(|e| e.rule == rules::TASK_FAILED));
    let output = sink.with_rule(rules::TASK_OUTPUT);
    assert!(output.iter().any(|e| e.message.contains("broken: error")));
}

#[tokio::test]
async fn first_failure_stops_the_build() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("broken", Script::new().exit_code(2));
    executor.script("slow", Script::new().delay(Duration::from_secs(30)));

    let mut graph = TaskGraph::new();
    graph.add_task(task("broken")).unwrap();
    let slow = graph.add_task(task("slow")).unwrap();
    let later = graph.add_task(task("later")).unwrap();
    graph.add_edge(later, slow).unwrap();

    let started = Instant::now();
    let result = Scheduler::new(config(false), executor.clone())
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!result.cancelled_by_user);
    assert_eq!(result.result("run slow"), Some(&TaskResult::Cancelled));
    assert_eq!(
        result.result("run later"),
        Some(&TaskResult::Skipped(SkipReason::BuildStopped))
    );
    assert_eq!(executor.count(), 2);
}

#[tokio::test]
async fn user_cancellation_interrupts_running_tasks() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("long", Script::new().delay(Duration::from_secs(30)));

    let mut graph = TaskGraph::new();
    let long = graph.add_task(task("long")).unwrap();
    let next = graph.add_task(task("next")).unwrap();
    graph.add_edge(next, long).unwrap();

    let (source, signal) = CancellationSource::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.cancel();
    });

    let result = Scheduler::new(config(true), executor.clone())
        .with_cancellation(signal)
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    assert!(result.cancelled_by_user);
    assert!(!result.success());
    assert_eq!(result.result("run long"), Some(&TaskResult::Cancelled));
    assert_eq!(
        result.result("run next"),
        Some(&TaskResult::Skipped(SkipReason::BuildStopped))
    );
}

#[tokio::test]
async fn missing_declared_output_fails_the_task() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("gen", Script::new().without_outputs());

    let mut graph = TaskGraph::new();
    graph
        .add_task(
            Task::builder("gen", dir.path())
                .command(["gen"])
                .output("gen.h")
                .build()
                .unwrap(),
        )
        .unwrap();

    let result = Scheduler::new(config(false), executor)
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    match result.result("gen gen.h") {
        Some(TaskResult::Failed(reason)) => assert!(reason.contains("gen.h"), "{reason}"),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn failed_tasks_rerun_on_the_next_build() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("cc", Script::new().exit_code(1));

    let build = |executor: Arc<ScriptedExecutor>, history: Arc<kiln_task::SignatureHistory>| {
        let mut graph = TaskGraph::new();
        graph
            .add_task(
                Task::builder("cc", dir.path())
                    .command(["cc"])
                    .output("a.o")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let scheduler = Scheduler::new(config(false), executor).with_history(history);
        async move { scheduler.run(graph.freeze().unwrap()).await.unwrap() }
    };

    let history = Arc::new(kiln_task::SignatureHistory::in_memory());
    let failed = build(executor.clone(), Arc::clone(&history)).await;
    assert!(!failed.success());
    assert!(history.is_empty());

    executor.script("cc", Script::new());
    let fixed = build(executor.clone(), Arc::clone(&history)).await;
    assert!(fixed.success());
    assert_eq!(executor.count(), 2);
    assert_eq!(history.len(), 1);
}

#[test]
fn cycles_are_rejected_with_their_members() {
    let mut graph = TaskGraph::new();
    let a = graph.add_task(task("a")).unwrap();
    let b = graph.add_task(task("b")).unwrap();
    let c = graph.add_task(task("c")).unwrap();
    graph.add_edge(a, b).unwrap();
    graph.add_edge(b, c).unwrap();
    graph.add_edge(c, a).unwrap();

    let error = graph.freeze().unwrap_err();
    assert!(matches!(error, GraphError::Cycle { .. }));
    let members = error.cycle_members().unwrap();
    for label in ["run a", "run b", "run c"] {
        assert!(members.iter().any(|m| m == label), "{label} missing from {members:?}");
    }
    assert!(error.to_string().contains("->"));
}
