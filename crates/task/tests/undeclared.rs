//! Undeclared dependency detection during real builds

use kiln_config::{BuildConfig, DependencySeverity};
use kiln_core::{rules, CollectingSink, EventBus, Severity, Statistic};
use kiln_task::testing::{Script, ScriptedExecutor};
use kiln_task::{FrozenGraph, Scheduler, Task, TaskGraph, TaskResult};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// `gen` produces gen.h; `user` reads it without depending on `gen`
fn racy_graph(dir: &Path, executor: &ScriptedExecutor) -> FrozenGraph {
    executor.script("gen", Script::new());
    executor.script("user", Script::new().reads(dir.join("gen.h")).reads(dir.join("user.c")));

    let mut graph = TaskGraph::new();
    graph
        .add_task(Task::builder("gen", dir).command(["gen"]).output("gen.h").build().unwrap())
        .unwrap();
    graph
        .add_task(
            Task::builder("cc", dir)
                .command(["user"])
                .input("user.c")
                .output("user.o")
                .build()
                .unwrap(),
        )
        .unwrap();
    graph.freeze().unwrap()
}

async fn build(dir: &Path, severity: DependencySeverity, exempt: Option<&Path>) -> (kiln_task::BuildResult, Arc<CollectingSink>) {
    std::fs::write(dir.join("user.c"), "#include \"gen.h\"\n").unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let graph = racy_graph(dir, &executor);

    let mut config = BuildConfig::builder()
        .parallelism(1)
        .continue_after_errors(true)
        .dependency_severity(severity);
    if let Some(exempt) = exempt {
        config = config.exempt_path(exempt);
    }

    let sink = Arc::new(CollectingSink::new());
    let result = Scheduler::new(config.build().unwrap(), executor)
        .with_events(Arc::new(EventBus::with_sink(sink.clone())))
        .with_base_dir(dir)
        .run(graph)
        .await
        .unwrap();
    (result, sink)
}

#[tokio::test]
async fn severity_error_fails_the_reader_and_names_both_tasks() {
    let dir = TempDir::new().unwrap();
    let (result, sink) = build(dir.path(), DependencySeverity::Error, None).await;

    assert!(!result.success());
    match result.result("cc user.o") {
        Some(TaskResult::Failed(reason)) => {
            assert!(reason.contains("cc user.o"), "{reason}");
            assert!(reason.contains("gen gen.h"), "{reason}");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(matches!(result.result("gen gen.h"), Some(r) if r.is_success()));

    let violations = sink.with_rule(rules::DEPS_UNDECLARED);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Error);
    assert_eq!(violations[0].task.as_deref(), Some("cc user.o"));
    assert_eq!(result.statistics.get(Statistic::DependencyViolations), 1);
}

#[tokio::test]
async fn severity_warn_reports_without_failing() {
    let dir = TempDir::new().unwrap();
    let (result, sink) = build(dir.path(), DependencySeverity::Warn, None).await;

    assert!(result.success(), "{}", result.summary);
    let violations = sink.with_rule(rules::DEPS_UNDECLARED);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Warning);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn ignore_and_exempt_paths_stay_quiet() {
    let dir = TempDir::new().unwrap();
    let (ignored, sink) = build(dir.path(), DependencySeverity::Ignore, None).await;
    assert!(ignored.success());
    assert!(sink.with_rule(rules::DEPS_UNDECLARED).is_empty());

    let other = TempDir::new().unwrap();
    let (exempt, sink) = build(other.path(), DependencySeverity::Error, Some(other.path())).await;
    assert!(exempt.success());
    assert!(sink.with_rule(rules::DEPS_UNDECLARED).is_empty());
}

#[tokio::test]
async fn undeclared_outputs_are_warnings() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("gen", Script::new().writes(dir.path().join("stray.tmp"), "x"));

    let mut graph = TaskGraph::new();
    graph
        .add_task(Task::builder("gen", dir.path()).command(["gen"]).output("gen.h").build().unwrap())
        .unwrap();

    let sink = Arc::new(CollectingSink::new());
    let config = BuildConfig::builder()
        .dependency_severity(DependencySeverity::Error)
        .build()
        .unwrap();
    let result = Scheduler::new(config, executor)
        .with_events(Arc::new(EventBus::with_sink(sink.clone())))
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    assert!(result.success());
    let stray = sink.with_rule(rules::DEPS_UNDECLARED_OUTPUT);
    assert_eq!(stray.len(), 1);
    assert_eq!(stray[0].severity, Severity::Warning);
    assert!(stray[0].message.contains("stray.tmp"));
}

#[tokio::test]
async fn reader_of_an_undeclared_write_fails_under_severity_error() {
    let dir = TempDir::new().unwrap();
    let extra = dir.path().join("extra.h");
    std::fs::write(dir.path().join("user.c"), "#include \"extra.h\"\n").unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("gen", Script::new().writes(&extra, "#define EXTRA 1\n"));
    executor.script("user", Script::new().reads(&extra).reads(dir.path().join("user.c")));

    // the reader waits on a gate that has nothing to do with gen
    let mut graph = TaskGraph::new();
    graph
        .add_task(Task::builder("gen", dir.path()).command(["gen"]).output("gen.h").build().unwrap())
        .unwrap();
    let stage = graph.add_task(Task::gate("stage", dir.path())).unwrap();
    let user = graph
        .add_task(
            Task::builder("cc", dir.path())
                .command(["user"])
                .input("user.c")
                .output("user.o")
                .build()
                .unwrap(),
        )
        .unwrap();
    graph.add_edge(user, stage).unwrap();

    let sink = Arc::new(CollectingSink::new());
    let config = BuildConfig::builder()
        .parallelism(1)
        .continue_after_errors(true)
        .dependency_severity(DependencySeverity::Error)
        .build()
        .unwrap();
    let result = Scheduler::new(config, executor)
        .with_events(Arc::new(EventBus::with_sink(sink.clone())))
        .with_base_dir(dir.path())
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    assert!(!result.success());
    assert!(matches!(result.result("gen gen.h"), Some(r) if r.is_success()));
    assert!(matches!(result.result("cc user.o"), Some(TaskResult::Failed(_))));

    let stray = sink.with_rule(rules::DEPS_UNDECLARED_OUTPUT);
    assert_eq!(stray.len(), 1);
    assert!(stray[0].message.contains("extra.h"));

    let violations = sink.with_rule(rules::DEPS_UNDECLARED);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Error);
    let message = &violations[0].message;
    assert!(message.contains("cc user.o"), "{message}");
    assert!(message.contains("gen gen.h"), "{message}");
    assert!(message.contains("extra.h"), "{message}");
}

#[tokio::test]
async fn up_to_date_reader_is_checked_after_its_edge_is_removed() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("user.c"), "#include \"gen.h\"\n").unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("gen", Script::new());
    executor.script("user", Script::new().reads(dir.path().join("gen.h")).reads(dir.path().join("user.c")));
    let history = Arc::new(kiln_task::SignatureHistory::in_memory());

    let graph = |ordered: bool| {
        let mut graph = TaskGraph::new();
        let gen = graph
            .add_task(Task::builder("gen", dir.path()).command(["gen"]).output("gen.h").build().unwrap())
            .unwrap();
        let user = graph
            .add_task(
                Task::builder("cc", dir.path())
                    .command(["user"])
                    .input("user.c")
                    .output("user.o")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        if ordered {
            graph.add_edge(user, gen).unwrap();
        }
        graph.freeze().unwrap()
    };
    let scheduler = |sink: Arc<CollectingSink>| {
        let config = BuildConfig::builder()
            .parallelism(1)
            .continue_after_errors(true)
            .dependency_severity(DependencySeverity::Error)
            .build()
            .unwrap();
        Scheduler::new(config, executor.clone())
            .with_history(Arc::clone(&history))
            .with_events(Arc::new(EventBus::with_sink(sink)))
            .with_base_dir(dir.path())
    };

    let first = scheduler(Arc::new(CollectingSink::new())).run(graph(true)).await.unwrap();
    assert!(first.success(), "{}", first.summary);
    assert_eq!(executor.count(), 2);

    let sink = Arc::new(CollectingSink::new());
    let second = scheduler(sink.clone()).run(graph(false)).await.unwrap();
    assert_eq!(executor.count(), 2, "nothing reran");
    assert_eq!(second.result("gen gen.h"), Some(&TaskResult::UpToDate));
    assert!(matches!(second.result("cc user.o"), Some(TaskResult::Failed(_))));

    let violations = sink.with_rule(rules::DEPS_UNDECLARED);
    assert_eq!(violations.len(), 1);
    assert!(violations[0].message.contains("gen gen.h"));
}
