//! Evaluation of a single task: up-to-date check, cache, execution

use super::Reporter;
use crate::definition::Task;
use crate::graph::{FrozenGraph, NodeId};
use crate::history::{SignatureHistory, SignatureRecord};
use crate::process::{ProcessExecutor, ProcessRequest};
use crate::result::TaskResult;
use crate::signature::SignatureEngine;
use crate::validator::DependencyValidator;
use kiln_cache::{
    bounded_lookup, CacheBackend, CacheEntry, CacheKey, EntryDraft, EntryMetadata, LookupResolution, MissReason,
    OutputSource, StoreOutcome,
};
use kiln_config::{BuildConfig, DependencySeverity};
use kiln_core::{rules, BuildEvent, BuildStatistics, CancellationSignal, Error, Result, Severity, Statistic};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// State shared by every worker of one build
pub(crate) struct WorkerContext {
    pub config: Arc<BuildConfig>,
    pub executor: Arc<dyn ProcessExecutor>,
    pub cache: Option<Arc<dyn CacheBackend>>,
    /// Cleared for the rest of the build after a key collision
    pub cache_enabled: AtomicBool,
    pub history: Arc<SignatureHistory>,
    pub engine: SignatureEngine,
    pub validator: DependencyValidator,
    pub graph: RwLock<FrozenGraph>,
    pub stats: BuildStatistics,
    pub reporter: Reporter,
    pub cancel: CancellationSignal,
}

impl WorkerContext {
    pub(crate) fn active_cache(&self) -> Option<Arc<dyn CacheBackend>> {
        if self.cache_enabled.load(Ordering::Acquire) {
            self.cache.clone()
        } else {
            None
        }
    }

    fn cache_for(&self, task: &Task) -> Option<Arc<dyn CacheBackend>> {
        if self.config.cache_allowed_for(task.rule())
            && task.allows_caching()
            && !task.declared_outputs().is_empty()
        {
            self.active_cache()
        } else {
            None
        }
    }

    fn emit(&self, event: BuildEvent) {
        self.reporter.publish(event);
    }
}

enum Consult {
    Hit { key: CacheKey, discovered: Vec<PathBuf> },
    Miss,
    Cancelled,
}

/// Evaluate one task. Errors become [`TaskResult::Failed`] and forget the
/// task's history so nothing it left behind is trusted.
pub(crate) async fn run_task(ctx: Arc<WorkerContext>, node: NodeId, task: Arc<Task>) -> TaskResult {
    match evaluate(&ctx, node, &task).await {
        Ok(result) => {
            if !result.is_success() {
                ctx.history.remove(task.identity());
            }
            result
        }
        Err(e) => {
            ctx.history.remove(task.identity());
            TaskResult::Failed(e.to_string())
        }
    }
}

async fn evaluate(ctx: &WorkerContext, node: NodeId, task: &Task) -> Result<TaskResult> {
    let identity = task.identity();
    let previous = ctx.history.get(identity);

    if let Some(record) = &previous {
        if task.outputs_exist() {
            let cheap = ctx.engine.cheap_signature(task, &record.discovered_inputs)?;
            ctx.stats.increment(Statistic::SignaturesComputed);
            if cheap == record.cheap {
                debug!("cheap signature unchanged");
                if let Some(failure) = validate_dependencies(ctx, node, &record.discovered_inputs, &[]) {
                    return Ok(TaskResult::Failed(failure));
                }
                pin(ctx, record.cache_key.as_ref()).await;
                return Ok(TaskResult::UpToDate);
            }

            let signature = ctx.engine.full_signature(task, &record.discovered_inputs)?;
            ctx.stats.increment(Statistic::SignaturesComputed);
            if signature == record.signature {
                debug!("inputs touched but unchanged");
                if let Some(failure) = validate_dependencies(ctx, node, &record.discovered_inputs, &[]) {
                    return Ok(TaskResult::Failed(failure));
                }
                ctx.history.record(
                    identity.clone(),
                    SignatureRecord {
                        cheap,
                        ..record.clone()
                    },
                );
                pin(ctx, record.cache_key.as_ref()).await;
                return Ok(TaskResult::UpToDate);
            }
        }
    }

    let cache = ctx.cache_for(task);
    let base_key = match &cache {
        Some(_) => Some(ctx.engine.base_key(task)?),
        None => None,
    };

    if let (Some(cache), Some(base)) = (&cache, &base_key) {
        match consult_cache(ctx, cache.as_ref(), task, base, previous.as_ref()).await? {
            Consult::Hit { key, discovered } => {
                // the graph may have lost an edge since the entry was stored
                if let Some(failure) = validate_dependencies(ctx, node, &discovered, &[]) {
                    return Ok(TaskResult::Failed(failure));
                }
                record_success(ctx, task, discovered, Some(key))?;
                pin(ctx, Some(&key)).await;
                return Ok(TaskResult::CacheHit);
            }
            Consult::Cancelled => return Ok(TaskResult::Cancelled),
            Consult::Miss => {}
        }
    }

    execute(ctx, node, task, base_key).await
}

async fn execute(ctx: &WorkerContext, node: NodeId, task: &Task, base_key: Option<CacheKey>) -> Result<TaskResult> {
    // A build interrupted from here on must rerun the task.
    ctx.history.remove(task.identity());

    for output in task.declared_outputs() {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::file_system(parent, "create output directory", e))?;
        }
    }

    let request = ProcessRequest::for_task(task, ctx.config.process_timeout());
    ctx.stats.increment(Statistic::ProcessesSpawned);
    let outcome = ctx.executor.execute(request, ctx.cancel.clone()).await?;
    let diagnostics = outcome.output.text();
    if !diagnostics.is_empty() {
        ctx.emit(BuildEvent::note(rules::TASK_OUTPUT, diagnostics.clone()).for_task(task.identity().as_str()));
    }

    if outcome.status.is_cancellation() {
        return Ok(TaskResult::Cancelled);
    }
    if !outcome.status.is_success() {
        return Ok(TaskResult::Executed(outcome.status));
    }

    if let Some(failure) = validate_dependencies(
        ctx,
        node,
        &outcome.discovered_inputs,
        &outcome.discovered_outputs,
    ) {
        return Ok(TaskResult::Failed(failure));
    }
    if let Some(missing) = task.declared_outputs().iter().find(|p| !p.exists()) {
        return Ok(TaskResult::Failed(format!(
            "declared output '{}' was not created",
            missing.display()
        )));
    }

    let mut cache_key = None;
    if let (Some(base), Some(cache)) = (base_key, ctx.cache_for(task)) {
        match store_outputs(ctx, cache.as_ref(), task, &base, &outcome.discovered_inputs, diagnostics).await? {
            Stored::Key(key) => cache_key = Some(key),
            Stored::Collision(message) => return Ok(TaskResult::Failed(message)),
            Stored::Skipped => {}
        }
    }

    record_success(ctx, task, outcome.discovered_inputs, cache_key)?;
    Ok(TaskResult::Executed(outcome.status))
}

fn record_success(
    ctx: &WorkerContext,
    task: &Task,
    discovered: Vec<PathBuf>,
    cache_key: Option<CacheKey>,
) -> Result<()> {
    let signature = ctx.engine.full_signature(task, &discovered)?;
    let cheap = ctx.engine.cheap_signature(task, &discovered)?;
    ctx.stats.add(Statistic::SignaturesComputed, 2);
    ctx.history.record(
        task.identity().clone(),
        SignatureRecord {
            cheap,
            signature,
            discovered_inputs: discovered,
            cache_key,
        },
    );
    Ok(())
}

/// Report violations; returns the failure message when the policy makes
/// them fatal. Tasks that did not run pass their recorded reads and no
/// writes.
fn validate_dependencies(
    ctx: &WorkerContext,
    node: NodeId,
    inputs: &[PathBuf],
    outputs: &[PathBuf],
) -> Option<String> {
    let violations = {
        let graph = ctx.graph.read();
        ctx.validator.check(&graph, node, inputs, outputs)
    };

    let mut failure = None;
    for violation in violations {
        ctx.stats.increment(Statistic::DependencyViolations);
        let fatal = ctx.validator.severity() == DependencySeverity::Error && violation.is_ordering_race();
        let severity = if fatal { Severity::Error } else { Severity::Warning };
        ctx.emit(BuildEvent::new(violation.rule(), severity, violation.to_string()).for_task(violation.task()));
        if fatal && failure.is_none() {
            failure = Some(violation.to_string());
        }
    }
    failure
}

async fn consult_cache(
    ctx: &WorkerContext,
    cache: &dyn CacheBackend,
    task: &Task,
    base: &CacheKey,
    previous: Option<&SignatureRecord>,
) -> Result<Consult> {
    let timeout = ctx.config.lookup_timeout();
    let mut candidates: Vec<Vec<PathBuf>> = Vec::new();
    if let Some(record) = previous {
        candidates.push(record.discovered_inputs.clone());
    }

    match tokio::time::timeout(timeout, cache.dependency_sets(base)).await {
        Ok(Ok(sets)) => {
            for set in sets {
                let set: Vec<PathBuf> = set.iter().map(|p| ctx.engine.unmap(p)).collect();
                if !candidates.contains(&set) {
                    candidates.push(set);
                }
            }
        }
        Ok(Err(e)) => {
            ctx.stats.increment(Statistic::CacheErrors);
            ctx.emit(
                BuildEvent::warning(rules::CACHE_ERROR, format!("cannot read dependency sets: {e}"))
                    .for_task(task.identity().as_str()),
            );
        }
        Err(_) => {
            ctx.stats.increment(Statistic::CacheLookupTimeouts);
            ctx.emit(
                BuildEvent::warning(rules::CACHE_MISS, "dependency set lookup timed out")
                    .for_task(task.identity().as_str()),
            );
            ctx.stats.increment(Statistic::CacheMisses);
            return Ok(Consult::Miss);
        }
    }
    if candidates.is_empty() {
        candidates.push(Vec::new());
    }

    let mut cancel = ctx.cancel.clone();
    for discovered in candidates {
        let key = ctx.engine.cache_key(base, &discovered)?;
        ctx.stats.increment(Statistic::CacheLookups);

        let resolution = tokio::select! {
            resolution = bounded_lookup(cache, key, timeout) => resolution,
            _ = cancel.cancelled() => return Ok(Consult::Cancelled),
        };

        match resolution {
            LookupResolution::Hit { key, entry, elapsed } => match materialize(ctx, cache, task, &entry).await {
                Ok(()) => {
                    ctx.stats.increment(Statistic::CacheHits);
                    ctx.emit(
                        BuildEvent::note(rules::CACHE_HIT, format!("restored from cache entry {}", key.short()))
                            .for_task(task.identity().as_str())
                            .with_field("key", key)
                            .with_field("lookup_ms", elapsed.as_millis()),
                    );
                    if !entry.metadata.diagnostics.is_empty() {
                        ctx.emit(
                            BuildEvent::note(rules::TASK_OUTPUT, entry.metadata.diagnostics.clone())
                                .for_task(task.identity().as_str())
                                .with_field("replayed", true),
                        );
                    }
                    return Ok(Consult::Hit { key, discovered });
                }
                Err(reason) => {
                    ctx.emit(
                        BuildEvent::warning(rules::CACHE_MISS, MissReason::Unusable(reason).to_string())
                            .for_task(task.identity().as_str())
                            .with_field("key", key),
                    );
                }
            },
            LookupResolution::Miss {
                reason: MissReason::NotFound,
                ..
            } => {}
            LookupResolution::Miss { key, reason, .. } => {
                let statistic = match reason {
                    MissReason::TimedOut(_) => Statistic::CacheLookupTimeouts,
                    _ => Statistic::CacheErrors,
                };
                ctx.stats.increment(statistic);
                ctx.emit(
                    BuildEvent::warning(rules::CACHE_MISS, reason.to_string())
                        .for_task(task.identity().as_str())
                        .with_field("key", key),
                );
                break;
            }
        }
    }

    ctx.stats.increment(Statistic::CacheMisses);
    ctx.emit(BuildEvent::note(rules::CACHE_MISS, "no usable cache entry").for_task(task.identity().as_str()));
    Ok(Consult::Miss)
}

/// Place a hit's outputs at the task's declared paths. The entry must
/// cover exactly the declared outputs.
async fn materialize(
    ctx: &WorkerContext,
    cache: &dyn CacheBackend,
    task: &Task,
    entry: &CacheEntry,
) -> std::result::Result<(), String> {
    let declared: HashMap<String, &PathBuf> = task
        .declared_outputs()
        .iter()
        .map(|p| (ctx.engine.remap(p), p))
        .collect();
    if entry.outputs.len() != declared.len() {
        return Err(format!(
            "entry has {} outputs, task declares {}",
            entry.outputs.len(),
            declared.len()
        ));
    }

    let mut destinations = Vec::with_capacity(entry.outputs.len());
    for output in &entry.outputs {
        let destination = declared
            .get(&output.path)
            .ok_or_else(|| format!("entry output '{}' is not declared by the task", output.path))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        destinations.push((*destination).clone());
    }

    cache
        .materialize(entry, &destinations, ctx.config.cache.materialize)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

enum Stored {
    Key(CacheKey),
    Collision(String),
    Skipped,
}

async fn store_outputs(
    ctx: &WorkerContext,
    cache: &dyn CacheBackend,
    task: &Task,
    base: &CacheKey,
    discovered: &[PathBuf],
    diagnostics: String,
) -> Result<Stored> {
    let key = ctx.engine.cache_key(base, discovered)?;
    let remapped: Vec<String> = discovered.iter().map(|p| ctx.engine.remap(p)).collect();
    let bytes: u64 = task
        .declared_outputs()
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    let draft = EntryDraft {
        outputs: task
            .declared_outputs()
            .iter()
            .map(|p| OutputSource {
                local_path: p.clone(),
                logical_path: ctx.engine.remap(p),
            })
            .collect(),
        metadata: EntryMetadata {
            rule: task.rule().to_string(),
            task: task.identity().to_string(),
            diagnostics,
            discovered_inputs: remapped.clone(),
            base_key: Some(*base),
        },
    };

    match cache.store(&key, draft).await {
        Ok(outcome) => {
            if outcome == StoreOutcome::Stored {
                ctx.stats.increment(Statistic::CacheStores);
                ctx.stats.add(Statistic::CacheStoredBytes, bytes);
                ctx.emit(
                    BuildEvent::note(rules::CACHE_STORE, format!("stored outputs under {}", key.short()))
                        .for_task(task.identity().as_str())
                        .with_field("key", key)
                        .with_field("bytes", bytes),
                );
            }
            if let Err(e) = cache.record_dependency_set(base, remapped).await {
                warn!(error = %e, "cannot record dependency set");
            }
            pin(ctx, Some(&key)).await;
            Ok(Stored::Key(key))
        }
        Err(e) if e.is_fatal() => {
            ctx.cache_enabled.store(false, Ordering::Release);
            ctx.stats.increment(Statistic::CacheErrors);
            let message = format!("cache key collision: {e}; cache disabled for the rest of the build");
            ctx.emit(
                BuildEvent::error(rules::CACHE_COLLISION, message.clone())
                    .for_task(task.identity().as_str())
                    .with_field("key", key),
            );
            Ok(Stored::Collision(message))
        }
        Err(e) => {
            ctx.stats.increment(Statistic::CacheErrors);
            ctx.emit(
                BuildEvent::warning(rules::CACHE_ERROR, format!("cannot store outputs: {e}"))
                    .for_task(task.identity().as_str()),
            );
            Ok(Stored::Skipped)
        }
    }
}

async fn pin(ctx: &WorkerContext, key: Option<&CacheKey>) {
    let (Some(key), Some(cache)) = (key, ctx.active_cache()) else {
        return;
    };
    if let Err(e) = cache.pin(key).await {
        debug!(error = %e, "cannot pin cache entry");
    }
}
