//! Executes a frozen task graph.
//!
//! A single coordinator owns the per-node state and admits ready tasks into
//! a `JoinSet` of at most `parallelism` workers. Workers evaluate one task
//! each (up-to-date check, cache, execution) and hand the result back; only
//! the coordinator changes node state, publishes start/finish events and
//! splices expanded work into the graph.

mod worker;

use crate::graph::{FrozenGraph, Node, NodeId};
use crate::history::SignatureHistory;
use crate::process::{ProcessExecutor, SystemProcessExecutor};
use crate::result::{BuildResult, BuildSummary, SkipReason, TaskResult};
use crate::signature::SignatureEngine;
use crate::validator::DependencyValidator;
use futures::FutureExt;
use indexmap::IndexMap;
use kiln_cache::CacheBackend;
use kiln_config::{BuildConfig, ValidationTiming};
use kiln_core::{
    rules, BuildEvent, BuildStatistics, CancellationSignal, CancellationSource, EventBus, Result, Severity,
    Statistic, SIGNATURE_HISTORY_FILE,
};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

pub(crate) use worker::WorkerContext;

/// Publishes events and keeps the error-severity ones for the build result
pub(crate) struct Reporter {
    bus: Arc<EventBus>,
    errors: Mutex<Vec<BuildEvent>>,
}

impl Reporter {
    fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn publish(&self, event: BuildEvent) -> u64 {
        let kept = (event.severity == Severity::Error).then(|| event.clone());
        let sequence = self.bus.publish(event);
        if let Some(mut kept) = kept {
            kept.sequence = sequence;
            self.errors.lock().push(kept);
        }
        sequence
    }

    fn take_errors(&self) -> Vec<BuildEvent> {
        std::mem::take(&mut *self.errors.lock())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done(TaskResult),
}

impl NodeState {
    fn is_started(&self) -> bool {
        !matches!(self, NodeState::Pending)
    }
}

/// Runs builds. Cheap to construct; one instance can run several builds in
/// sequence.
pub struct Scheduler {
    config: Arc<BuildConfig>,
    executor: Arc<dyn ProcessExecutor>,
    cache: Option<Arc<dyn CacheBackend>>,
    history: Arc<SignatureHistory>,
    events: Arc<EventBus>,
    cancel: CancellationSignal,
    base_dir: PathBuf,
}

impl Scheduler {
    pub fn new(config: BuildConfig, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
            cache: None,
            history: Arc::new(SignatureHistory::in_memory()),
            events: Arc::new(EventBus::new()),
            cancel: CancellationSignal::never(),
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Scheduler for a workspace rooted at `base`: real processes, the
    /// configured cache backend and the persisted signature history
    pub fn open(config: BuildConfig, base: &Path) -> Result<Self> {
        let executor = Arc::new(SystemProcessExecutor::new(config.termination_grace()));
        let cache = if config.cache.enabled {
            Some(kiln_cache::open_backend(&config, base)?)
        } else {
            None
        };
        let history = SignatureHistory::load(config.state_root(base).join(SIGNATURE_HISTORY_FILE));

        let mut scheduler = Self::new(config, executor)
            .with_history(Arc::new(history))
            .with_base_dir(base);
        scheduler.cache = cache;
        Ok(scheduler)
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_history(mut self, history: Arc<SignatureHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Directory relative exempt paths resolve against
    pub fn with_base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_dir = base.into();
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<SignatureHistory> {
        &self.history
    }

    /// Run `graph` to completion or cancellation
    pub async fn run(&self, graph: FrozenGraph) -> Result<BuildResult> {
        let started = Instant::now();
        let span = kiln_utils::logging::build_span(graph.len());

        let (stop, stop_signal) = CancellationSource::new();
        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            executor: Arc::clone(&self.executor),
            cache: self.cache.clone(),
            cache_enabled: AtomicBool::new(self.config.cache.enabled && self.cache.is_some()),
            history: Arc::clone(&self.history),
            engine: SignatureEngine::new(self.config.signature_mode, self.config.path_remapper()),
            validator: DependencyValidator::from_settings(&self.config.dependency_validation, &self.base_dir),
            graph: RwLock::new(graph),
            stats: BuildStatistics::new(),
            reporter: Reporter::new(Arc::clone(&self.events)),
            cancel: stop_signal,
        });

        async {
            self.prepare_cache(&ctx).await;
            let total = ctx.graph.read().len();
            ctx.reporter.publish(
                BuildEvent::note(rules::BUILD_STARTED, format!("building {total} nodes"))
                    .with_field("nodes", total)
                    .with_field("parallelism", self.config.parallelism),
            );

            let (states, cancelled_by_user) = self.coordinate(&ctx, &stop).await;

            self.finish_cache(&ctx).await;
            if let Err(e) = ctx.history.flush() {
                ctx.reporter
                    .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("failed to save signature history: {e}")));
            }

            let mut result = self.collect(&ctx, states, cancelled_by_user, started);
            ctx.reporter.publish(
                BuildEvent::new(
                    rules::BUILD_FINISHED,
                    if result.success() { Severity::Note } else { Severity::Error },
                    result.summary.to_string(),
                )
                .with_field("duration_ms", result.duration.as_millis()),
            );
            info!(summary = %result.summary, "build finished");
            result.errors = ctx.reporter.take_errors();
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Admission loop. Returns the final node states and whether the user
    /// cancelled.
    async fn coordinate(&self, ctx: &Arc<WorkerContext>, stop: &CancellationSource) -> (Vec<NodeState>, bool) {
        let mut states = vec![NodeState::Pending; ctx.graph.read().len()];
        let mut workers: JoinSet<(NodeId, TaskResult)> = JoinSet::new();
        let mut user_cancel = self.cancel.clone();
        let mut stopping = false;
        let mut cancelled_by_user = false;

        loop {
            if !cancelled_by_user && user_cancel.is_cancelled() {
                cancelled_by_user = true;
                stopping = true;
                stop.cancel();
            }
            if !stopping {
                self.admit(ctx, &mut states, &mut workers);
            }
            if workers.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((node, result))) => {
                        let result = self.expand(ctx, node, result, &mut states);
                        let failed = result.is_failure();
                        self.finish(ctx, node, result, &mut states);
                        if failed && !self.config.continue_after_errors && !stopping {
                            info!("stopping build after first failure");
                            stopping = true;
                            stop.cancel();
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "task worker did not complete"),
                    None => break,
                },
                _ = user_cancel.cancelled(), if !cancelled_by_user => {
                    info!("build cancelled");
                    cancelled_by_user = true;
                    stopping = true;
                    stop.cancel();
                }
            }
        }

        let nodes: Vec<NodeId> = ctx.graph.read().node_ids().collect();
        for node in nodes {
            let leftover = match states[node.index()] {
                NodeState::Pending => TaskResult::Skipped(SkipReason::BuildStopped),
                NodeState::Running => TaskResult::Cancelled,
                NodeState::Done(_) => continue,
            };
            self.finish(ctx, node, leftover, &mut states);
        }
        (states, cancelled_by_user)
    }

    /// Resolve whatever can be resolved without running anything, then start
    /// ready tasks while worker slots are free. Repeats until nothing changes.
    fn admit(&self, ctx: &Arc<WorkerContext>, states: &mut Vec<NodeState>, workers: &mut JoinSet<(NodeId, TaskResult)>) {
        loop {
            let mut changed = false;
            let nodes: Vec<NodeId> = ctx.graph.read().node_ids().collect();
            for node in nodes {
                if states[node.index()] != NodeState::Pending {
                    continue;
                }

                let (dependencies, work) = {
                    let graph = ctx.graph.read();
                    let work = match graph.node(node) {
                        Some(Node::Task(task)) if !task.is_gate() => Some(Arc::clone(task)),
                        _ => None,
                    };
                    (graph.dependencies(node), work)
                };

                let mut ready = true;
                let mut failed_dependency = None;
                for dependency in dependencies {
                    match &states[dependency.index()] {
                        NodeState::Done(result) if result.is_success() => {}
                        NodeState::Done(_) => {
                            failed_dependency = Some(dependency);
                            break;
                        }
                        _ => ready = false,
                    }
                }

                if let Some(dependency) = failed_dependency {
                    let dependency = ctx.graph.read().label(dependency).to_string();
                    self.finish(
                        ctx,
                        node,
                        TaskResult::Skipped(SkipReason::DependencyFailed { dependency }),
                        states,
                    );
                    changed = true;
                    continue;
                }
                if !ready {
                    continue;
                }

                match work {
                    None => {
                        let result = self.expand(ctx, node, TaskResult::UpToDate, states);
                        self.finish(ctx, node, result, states);
                        changed = true;
                    }
                    Some(task) if workers.len() < self.config.parallelism => {
                        states[node.index()] = NodeState::Running;
                        ctx.reporter.publish(
                            BuildEvent::note(rules::TASK_STARTED, task.description())
                                .for_task(task.identity().as_str()),
                        );
                        let span = kiln_utils::logging::task_span(task.identity().as_str());
                        let worker_ctx = Arc::clone(ctx);
                        workers.spawn(
                            async move {
                                let result = AssertUnwindSafe(worker::run_task(worker_ctx, node, task))
                                    .catch_unwind()
                                    .await
                                    .unwrap_or_else(|_| TaskResult::Failed("task worker panicked".to_string()));
                                (node, result)
                            }
                            .instrument(span),
                        );
                    }
                    Some(_) => {}
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Apply the node's expander after a successful result. Splice errors
    /// fail the node.
    fn expand(&self, ctx: &WorkerContext, node: NodeId, result: TaskResult, states: &mut Vec<NodeState>) -> TaskResult {
        if !result.is_success() {
            return result;
        }
        let Some(task) = ctx.graph.read().task(node).cloned() else {
            return result;
        };
        let Some(expander) = task.expander() else {
            return result;
        };

        let splice = match expander.expand(&task) {
            Ok(splice) if splice.is_empty() => return result,
            Ok(splice) => splice,
            Err(e) => return TaskResult::Failed(format!("expansion failed: {e}")),
        };
        let new_tasks = splice.tasks.len();

        let spliced = {
            let mut graph = ctx.graph.write();
            graph.splice(splice, node, |n| {
                // the origin itself is about to finish
                n == node || states.get(n.index()).is_some_and(NodeState::is_started)
            })
        };
        match spliced {
            Ok(added) => {
                let len = ctx.graph.read().len();
                states.resize(len, NodeState::Pending);
                ctx.stats.increment(Statistic::GraphSplices);
                debug!(added = added.len(), "spliced expanded tasks");
                ctx.reporter.publish(
                    BuildEvent::note(rules::GRAPH_SPLICE, format!("added {new_tasks} tasks"))
                        .for_task(task.identity().as_str())
                        .with_field("tasks", new_tasks),
                );
                result
            }
            Err(e) => TaskResult::Failed(format!("cannot splice expanded tasks: {e}")),
        }
    }

    /// Record a terminal result, update counters and publish the matching
    /// events
    fn finish(&self, ctx: &WorkerContext, node: NodeId, result: TaskResult, states: &mut [NodeState]) {
        let (label, counted) = {
            let graph = ctx.graph.read();
            let counted = graph.task(node).is_some_and(|t| !t.is_gate());
            (graph.label(node).to_string(), counted)
        };

        if counted {
            let statistic = match &result {
                TaskResult::UpToDate => Statistic::TasksUpToDate,
                TaskResult::CacheHit => Statistic::TasksCacheHit,
                TaskResult::Executed(status) if status.is_success() => Statistic::TasksExecuted,
                TaskResult::Executed(_) | TaskResult::Failed(_) => Statistic::TasksFailed,
                TaskResult::Skipped(_) => Statistic::TasksSkipped,
                TaskResult::Cancelled => Statistic::TasksCancelled,
            };
            ctx.stats.increment(statistic);

            let detail = match &result {
                TaskResult::UpToDate => Some(BuildEvent::note(rules::TASK_UP_TO_DATE, "up to date")),
                TaskResult::Skipped(_) => Some(BuildEvent::note(rules::TASK_SKIPPED, result.to_string())),
                TaskResult::Cancelled => Some(BuildEvent::warning(rules::TASK_CANCELLED, "cancelled")),
                r if r.is_failure() => Some(BuildEvent::error(rules::TASK_FAILED, format!("{label}: {r}"))),
                _ => None,
            };
            if let Some(event) = detail {
                ctx.reporter.publish(event.for_task(label.as_str()));
            }
            if states[node.index()] == NodeState::Running {
                ctx.reporter.publish(
                    BuildEvent::note(rules::TASK_FINISHED, result.to_string())
                        .for_task(label.as_str())
                        .with_field("success", result.is_success()),
                );
            }
        }
        states[node.index()] = NodeState::Done(result);
    }

    fn collect(&self, ctx: &WorkerContext, states: Vec<NodeState>, cancelled_by_user: bool, started: Instant) -> BuildResult {
        let graph = ctx.graph.read();
        let mut results = IndexMap::with_capacity(states.len());
        let mut summary = BuildSummary::default();
        for (node, state) in graph.node_ids().zip(states) {
            let result = match state {
                NodeState::Done(result) => result,
                NodeState::Pending => TaskResult::Skipped(SkipReason::BuildStopped),
                NodeState::Running => TaskResult::Cancelled,
            };
            if graph.task(node).is_some_and(|t| !t.is_gate()) {
                summary.count(&result);
            }
            results.insert(graph.label(node).to_string(), result);
        }

        BuildResult {
            results,
            summary,
            statistics: ctx.stats.snapshot(),
            errors: Vec::new(),
            duration: started.elapsed(),
            cancelled_by_user,
        }
    }

    async fn prepare_cache(&self, ctx: &WorkerContext) {
        let Some(cache) = ctx.active_cache() else {
            return;
        };
        if matches!(
            self.config.cache.validation,
            ValidationTiming::PreBuild | ValidationTiming::PreAndPostBuild
        ) {
            validate_cache(ctx, cache.as_ref()).await;
        }
        if let Err(e) = cache.begin_epoch().await {
            ctx.reporter
                .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("cannot start cache epoch: {e}")));
        }
    }

    async fn finish_cache(&self, ctx: &WorkerContext) {
        let Some(cache) = ctx.cache.clone() else {
            return;
        };
        if !self.config.cache.enabled {
            return;
        }
        if self.config.cache.validation == ValidationTiming::PreAndPostBuild {
            validate_cache(ctx, cache.as_ref()).await;
        }
        if let Some(limit) = self.config.cache.size_limit {
            match cache.prune(limit).await {
                Ok(report) => {
                    ctx.reporter.publish(
                        BuildEvent::note(
                            rules::CACHE_PRUNE,
                            format!(
                                "evicted {} entries, reclaimed {}, cache now {}",
                                report.evicted.len(),
                                report.reclaimed_bytes,
                                report.final_size
                            ),
                        )
                        .with_field("evicted", report.evicted.len())
                        .with_field("skipped_pinned", report.skipped_pinned)
                        .with_field("final_size", report.final_size.bytes()),
                    );
                }
                Err(e) => {
                    ctx.reporter
                        .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("cache prune failed: {e}")));
                }
            }
        }
        if let Err(e) = cache.end_epoch().await {
            ctx.reporter
                .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("cannot end cache epoch: {e}")));
        }
        if let Err(e) = cache.flush().await {
            ctx.reporter
                .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("cannot flush cache: {e}")));
        }
    }
}

async fn validate_cache(ctx: &WorkerContext, cache: &dyn CacheBackend) {
    let report = match cache.validate().await {
        Ok(report) => report,
        Err(e) => {
            ctx.reporter
                .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("cache validation failed: {e}")));
            return;
        }
    };

    if report.skipped {
        ctx.reporter.publish(BuildEvent::note(
            rules::CACHE_VALIDATE_SKIPPED,
            "validation skipped: store unchanged since last check",
        ));
        return;
    }
    if report.is_healthy() {
        ctx.reporter.publish(
            BuildEvent::note(rules::CACHE_VALIDATE, "cache store is consistent")
                .with_field("entries", report.checked_entries)
                .with_field("blobs", report.checked_blobs),
        );
        return;
    }

    ctx.reporter.publish(
        BuildEvent::warning(rules::CACHE_VALIDATE, "cache store is inconsistent; recovering")
            .with_field("missing_blobs", report.missing_blobs.len())
            .with_field("corrupt_blobs", report.corrupt_blobs.len())
            .with_field("unreadable_entries", report.unreadable_entries.len()),
    );
    match cache.recover().await {
        Ok(recovery) => {
            ctx.reporter.publish(
                BuildEvent::note(
                    rules::CACHE_RECOVER,
                    format!(
                        "recovered {} entries, dropped {}",
                        recovery.recovered_entries,
                        recovery.dropped_entries.len()
                    ),
                )
                .with_field("recovered", recovery.recovered_entries)
                .with_field("dropped", recovery.dropped_entries.len()),
            );
        }
        Err(e) => {
            ctx.reporter
                .publish(BuildEvent::warning(rules::CACHE_ERROR, format!("cache recovery failed: {e}")));
        }
    }
}
