//! Incremental builds with real processes: null builds, rebuilds after
//! edits, discovered dependencies and cache restores.

#![cfg(unix)]

use kiln_cache::{CacheBackend, LocalCas};
use kiln_config::{BuildConfig, EvictionKind};
use kiln_core::Statistic;
use kiln_task::{
    BuildResult, DependencyInfo, FrozenGraph, Scheduler, SignatureHistory, SystemProcessExecutor, Task, TaskGraph,
    TaskResult,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sh(rule: &str, dir: &Path, script: &str, inputs: &[&str], output: &str) -> Task {
    Task::builder(rule, dir)
        .command(["/bin/sh", "-c", script])
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .inputs(inputs.iter().copied())
        .output(output)
        .build()
        .unwrap()
}

fn compile_link(dir: &Path) -> FrozenGraph {
    let mut graph = TaskGraph::new();
    graph
        .add_task(sh("cc", dir, "cat a.c > a.o", &["a.c"], "a.o"))
        .unwrap();
    graph
        .add_task(sh("link", dir, "cat a.o > app", &["a.o"], "app"))
        .unwrap();
    graph.freeze().unwrap()
}

struct Workspace {
    dir: TempDir,
    history: Arc<SignatureHistory>,
    cache: Option<Arc<dyn CacheBackend>>,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "int main() { return 0; }\n").unwrap();
        Self {
            dir,
            history: Arc::new(SignatureHistory::in_memory()),
            cache: None,
        }
    }

    fn with_cache(mut self) -> Self {
        let cas = LocalCas::open(self.dir.path().join(".cache"), EvictionKind::Lru).unwrap();
        self.cache = Some(Arc::new(cas));
        self
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn scheduler(&self) -> Scheduler {
        let config = BuildConfig::builder().parallelism(2).build().unwrap();
        let executor = Arc::new(SystemProcessExecutor::new(Duration::from_millis(200)));
        let mut scheduler = Scheduler::new(config, executor)
            .with_history(Arc::clone(&self.history))
            .with_base_dir(self.path());
        if let Some(cache) = &self.cache {
            scheduler = scheduler.with_cache(Arc::clone(cache));
        }
        scheduler
    }

    async fn build(&self) -> BuildResult {
        self.scheduler().run(compile_link(self.path())).await.unwrap()
    }
}

#[tokio::test]
async fn compile_link_runs_then_null_builds_then_rebuilds_after_an_edit() {
    let ws = Workspace::new();

    let first = ws.build().await;
    assert!(first.success(), "{:?}", first.results);
    assert_eq!(first.summary.executed, 2);
    assert_eq!(first.statistics.get(Statistic::ProcessesSpawned), 2);
    assert_eq!(
        std::fs::read_to_string(ws.path().join("app")).unwrap(),
        "int main() { return 0; }\n"
    );

    let second = ws.build().await;
    assert!(second.success());
    assert_eq!(second.summary.up_to_date, 2);
    assert_eq!(second.statistics.get(Statistic::ProcessesSpawned), 0);

    std::fs::write(ws.path().join("a.c"), "int main() { return 42; }\n").unwrap();
    let third = ws.build().await;
    assert!(third.success());
    assert_eq!(third.result("cc a.o"), Some(&TaskResult::Executed(kiln_task::ExitStatus::Exited(0))));
    assert_eq!(third.result("link app"), Some(&TaskResult::Executed(kiln_task::ExitStatus::Exited(0))));
    assert_eq!(
        std::fs::read_to_string(ws.path().join("app")).unwrap(),
        "int main() { return 42; }\n"
    );
}

#[tokio::test]
async fn rewriting_an_input_with_the_same_bytes_is_up_to_date() {
    let ws = Workspace::new();
    assert!(ws.build().await.success());

    std::thread::sleep(Duration::from_millis(20));
    std::fs::write(ws.path().join("a.c"), "int main() { return 0; }\n").unwrap();

    let again = ws.build().await;
    assert_eq!(again.summary.up_to_date, 2);
    assert_eq!(again.statistics.get(Statistic::ProcessesSpawned), 0);
}

#[tokio::test]
async fn deleted_output_is_rebuilt() {
    let ws = Workspace::new();
    assert!(ws.build().await.success());

    std::fs::remove_file(ws.path().join("app")).unwrap();
    let again = ws.build().await;
    assert_eq!(again.result("cc a.o"), Some(&TaskResult::UpToDate));
    assert!(matches!(again.result("link app"), Some(TaskResult::Executed(_))));
    assert!(ws.path().join("app").exists());
}

#[tokio::test]
async fn cache_restores_outputs_after_a_clean() {
    let ws = Workspace::new().with_cache();
    let first = ws.build().await;
    assert!(first.success());
    assert_eq!(first.statistics.get(Statistic::CacheStores), 2);

    std::fs::remove_file(ws.path().join("a.o")).unwrap();
    std::fs::remove_file(ws.path().join("app")).unwrap();
    let fresh = Workspace {
        dir: ws.dir,
        history: Arc::new(SignatureHistory::in_memory()),
        cache: ws.cache,
    };

    let restored = fresh.build().await;
    assert!(restored.success(), "{:?}", restored.results);
    assert_eq!(restored.summary.cache_hits, 2);
    assert_eq!(restored.statistics.get(Statistic::ProcessesSpawned), 0);
    assert_eq!(
        std::fs::read_to_string(fresh.path().join("app")).unwrap(),
        "int main() { return 0; }\n"
    );

    let null = fresh.build().await;
    assert_eq!(null.summary.up_to_date, 2);
}

#[tokio::test]
async fn discovered_headers_trigger_rebuilds() {
    let ws = Workspace::new();
    std::fs::write(ws.path().join("a.h"), "#define X 1\n").unwrap();

    let compile = Task::builder("cc", ws.path())
        .command(["/bin/sh", "-c", "cat a.c a.h > a.o && printf 'a.o: a.c a.h\\n' > a.d"])
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .input("a.c")
        .output("a.o")
        .dependency_info(DependencyInfo::Makefile("a.d".into()))
        .build()
        .unwrap();
    let graph = || {
        let mut graph = TaskGraph::new();
        graph.add_task(compile.clone()).unwrap();
        graph.freeze().unwrap()
    };

    assert!(ws.scheduler().run(graph()).await.unwrap().success());
    let record = ws.history.get(compile.identity()).unwrap();
    assert_eq!(record.discovered_inputs, vec![ws.path().join("a.c"), ws.path().join("a.h")]);

    assert_eq!(
        ws.scheduler().run(graph()).await.unwrap().result("cc a.o"),
        Some(&TaskResult::UpToDate)
    );

    std::fs::write(ws.path().join("a.h"), "#define X 22\n").unwrap();
    let rebuilt = ws.scheduler().run(graph()).await.unwrap();
    assert!(matches!(rebuilt.result("cc a.o"), Some(TaskResult::Executed(_))));
    assert!(std::fs::read_to_string(ws.path().join("a.o"))
        .unwrap()
        .contains("X 22"));
}

#[tokio::test]
async fn history_survives_a_restart() {
    let ws = Workspace::new();
    let state = ws.path().join(".kiln").join("signatures.json");

    let ws = Workspace {
        history: Arc::new(SignatureHistory::load(&state)),
        ..ws
    };
    assert!(ws.build().await.success());
    assert!(state.exists());

    let ws = Workspace {
        history: Arc::new(SignatureHistory::load(&state)),
        ..ws
    };
    assert_eq!(ws.history.len(), 2);
    assert_eq!(ws.build().await.summary.up_to_date, 2);
}
