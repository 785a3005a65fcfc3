//! Tasks that add work to the running build

use kiln_config::BuildConfig;
use kiln_core::{rules, CollectingSink, EventBus, Statistic};
use kiln_task::testing::{Script, ScriptedExecutor};
use kiln_task::{DescriptionExpander, Scheduler, Task, TaskGraph, TaskResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const FRAGMENT: &str = r#"{ "tasks": [
    { "rule": "cc", "command": ["cc", "b.c"], "inputs": ["b.c"], "outputs": ["b.o"] }
] }"#;

fn generator(dir: &Path) -> Task {
    Task::builder("gen", dir)
        .command(["gen"])
        .output("more.json")
        .expander(Arc::new(DescriptionExpander))
        .build()
        .unwrap()
}

fn archive(dir: &Path) -> Task {
    Task::builder("ar", dir)
        .command(["ar"])
        .input("b.o")
        .output("lib.a")
        .build()
        .unwrap()
}

#[tokio::test]
async fn spliced_tasks_run_before_waiting_consumers() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("gen", Script::new().writes(dir.path().join("more.json"), FRAGMENT));

    let mut graph = TaskGraph::new();
    let gen = graph.add_task(generator(dir.path())).unwrap();
    let ar = graph.add_task(archive(dir.path())).unwrap();
    graph.add_edge(ar, gen).unwrap();

    let sink = Arc::new(CollectingSink::new());
    let result = Scheduler::new(BuildConfig::default(), executor.clone())
        .with_events(Arc::new(EventBus::with_sink(sink.clone())))
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    assert!(result.success(), "{:?}", result.results);
    assert_eq!(result.summary.total, 3);
    assert_eq!(
        executor.executed(),
        vec!["gen".to_string(), "cc b.c".to_string(), "ar".to_string()]
    );
    assert!(matches!(result.result("cc b.o"), Some(TaskResult::Executed(_))));
    assert_eq!(result.statistics.get(Statistic::GraphSplices), 1);
    assert_eq!(sink.with_rule(rules::GRAPH_SPLICE).len(), 1);
}

#[tokio::test]
async fn splicing_under_a_started_consumer_fails_the_generator() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script(
        "gen",
        Script::new()
            .delay(Duration::from_millis(50))
            .writes(dir.path().join("more.json"), FRAGMENT),
    );

    let mut graph = TaskGraph::new();
    graph.add_task(generator(dir.path())).unwrap();
    graph.add_task(archive(dir.path())).unwrap();

    let config = BuildConfig::builder()
        .parallelism(2)
        .continue_after_errors(true)
        .build()
        .unwrap();
    let result = Scheduler::new(config, executor)
        .run(graph.freeze().unwrap())
        .await
        .unwrap();

    match result.result("gen more.json") {
        Some(TaskResult::Failed(reason)) => assert!(reason.contains("ar lib.a"), "{reason}"),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(result.result("cc b.o").is_none());
}
