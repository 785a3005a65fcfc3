//! Cross-checks discovered dependencies against the graph.
//!
//! A task that reads a path produced by another task it is not ordered
//! after has an undeclared dependency: the build only worked because of the
//! schedule it happened to get.

use crate::graph::{FrozenGraph, NodeId};
use kiln_config::{DependencySeverity, DependencyValidationSettings};
use kiln_core::rules;
use kiln_utils::is_within;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `consumer` read `path`, produced by `producer`, without an edge
    UndeclaredDependency {
        consumer: String,
        producer: String,
        path: PathBuf,
    },
    /// `task` wrote `path` without declaring it
    UndeclaredOutput { task: String, path: PathBuf },
}

impl Violation {
    pub fn rule(&self) -> &'static str {
        match self {
            Violation::UndeclaredDependency { .. } => rules::DEPS_UNDECLARED,
            Violation::UndeclaredOutput { .. } => rules::DEPS_UNDECLARED_OUTPUT,
        }
    }

    /// Undeclared outputs are reported but never fail a task on their own;
    /// the race only exists once something reads the path.
    pub fn is_ordering_race(&self) -> bool {
        matches!(self, Violation::UndeclaredDependency { .. })
    }

    /// Task the violation should be reported against
    pub fn task(&self) -> &str {
        match self {
            Violation::UndeclaredDependency { consumer, .. } => consumer,
            Violation::UndeclaredOutput { task, .. } => task,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UndeclaredDependency {
                consumer,
                producer,
                path,
            } => write!(
                f,
                "undeclared dependency: '{consumer}' reads '{}' produced by '{producer}' but does not depend on it",
                path.display()
            ),
            Violation::UndeclaredOutput { task, path } => {
                write!(f, "'{task}' wrote undeclared output '{}'", path.display())
            }
        }
    }
}

/// Per-build validator state. Discovered writes are remembered so a later
/// reader of an undeclared output is still caught.
#[derive(Debug)]
pub struct DependencyValidator {
    severity: DependencySeverity,
    exempt: Vec<PathBuf>,
    observed_writes: Mutex<HashMap<PathBuf, NodeId>>,
    observed_reads: Mutex<HashMap<PathBuf, Vec<NodeId>>>,
}

impl DependencyValidator {
    pub fn new(severity: DependencySeverity, exempt: Vec<PathBuf>) -> Self {
        Self {
            severity,
            exempt,
            observed_writes: Mutex::new(HashMap::new()),
            observed_reads: Mutex::new(HashMap::new()),
        }
    }

    /// Validator for `settings`; relative exempt paths resolve against `base`
    pub fn from_settings(settings: &DependencyValidationSettings, base: &Path) -> Self {
        let exempt = settings
            .exempt_paths
            .iter()
            .map(|p| kiln_utils::absolutize(base, p))
            .collect();
        Self::new(settings.severity, exempt)
    }

    pub fn severity(&self) -> DependencySeverity {
        self.severity
    }

    pub fn is_exempt(&self, path: &Path) -> bool {
        self.exempt.iter().any(|root| is_within(path, root))
    }

    /// Check one finished task's discovered reads and writes
    pub fn check(
        &self,
        graph: &FrozenGraph,
        task: NodeId,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
    ) -> Vec<Violation> {
        if self.severity == DependencySeverity::Ignore {
            return Vec::new();
        }

        let mut violations = Vec::new();
        let consumer = graph.label(task).to_string();

        {
            let writes = self.observed_writes.lock();
            let mut reads = self.observed_reads.lock();
            for input in inputs.iter().filter(|p| !self.is_exempt(p)) {
                reads.entry(input.clone()).or_default().push(task);
                let producer = graph
                    .producer_of(input)
                    .or_else(|| writes.get(input).copied());
                if let Some(producer) = producer {
                    if producer != task && !graph.depends_on(task, producer) {
                        violations.push(Violation::UndeclaredDependency {
                            consumer: consumer.clone(),
                            producer: graph.label(producer).to_string(),
                            path: input.clone(),
                        });
                    }
                }
            }
        }

        let mut writes = self.observed_writes.lock();
        let reads = self.observed_reads.lock();
        for output in outputs.iter().filter(|p| !self.is_exempt(p)) {
            if graph.producer_of(output) == Some(task) {
                continue;
            }
            violations.push(Violation::UndeclaredOutput {
                task: consumer.clone(),
                path: output.clone(),
            });
            writes.entry(output.clone()).or_insert(task);

            for &reader in reads.get(output).into_iter().flatten() {
                if reader != task && !graph.depends_on(reader, task) {
                    violations.push(Violation::UndeclaredDependency {
                        consumer: graph.label(reader).to_string(),
                        producer: consumer.clone(),
                        path: output.clone(),
                    });
                }
            }
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Task;
    use crate::graph::TaskGraph;

    fn task(name: &str, inputs: &[&str], outputs: &[&str]) -> Task {
        Task::builder("t", "/w")
            .name(name)
            .command(["run", name])
            .inputs(inputs.iter().copied())
            .outputs(outputs.iter().copied())
            .build()
            .unwrap()
    }

    fn graph() -> (FrozenGraph, NodeId, NodeId, NodeId) {
        let mut graph = TaskGraph::new();
        let gen = graph.add_task(task("gen", &[], &["gen.h"])).unwrap();
        let ordered = graph.add_task(task("ordered", &["gen.h"], &["a.o"])).unwrap();
        let racy = graph.add_task(task("racy", &["b.c"], &["b.o"])).unwrap();
        (graph.freeze().unwrap(), gen, ordered, racy)
    }

    #[test]
    fn ordered_reads_are_fine() {
        let (graph, _, ordered, _) = graph();
        let validator = DependencyValidator::new(DependencySeverity::Error, vec![]);
        assert!(validator
            .check(&graph, ordered, &[PathBuf::from("/w/gen.h")], &[])
            .is_empty());
    }

    #[test]
    fn reading_an_unordered_producer_is_reported() {
        let (graph, _, _, racy) = graph();
        let validator = DependencyValidator::new(DependencySeverity::Warn, vec![]);
        let violations = validator.check(&graph, racy, &[PathBuf::from("/w/gen.h")], &[]);
        assert_eq!(
            violations,
            vec![Violation::UndeclaredDependency {
                consumer: "t racy".into(),
                producer: "t gen".into(),
                path: PathBuf::from("/w/gen.h"),
            }]
        );
        assert!(violations[0].to_string().contains("'t racy'"));
        assert!(violations[0].to_string().contains("'t gen'"));
    }

    #[test]
    fn undeclared_writes_are_tracked_for_later_readers() {
        let (graph, gen, _, racy) = graph();
        let validator = DependencyValidator::new(DependencySeverity::Error, vec![]);

        let written = validator.check(&graph, gen, &[], &[PathBuf::from("/w/extra.h")]);
        assert_eq!(written.len(), 1);
        assert!(!written[0].is_ordering_race());

        let read = validator.check(&graph, racy, &[PathBuf::from("/w/extra.h")], &[]);
        assert_eq!(read.len(), 1);
        assert!(read[0].is_ordering_race());
    }

    #[test]
    fn earlier_reads_are_reported_when_the_write_shows_up() {
        let (graph, gen, _, racy) = graph();
        let validator = DependencyValidator::new(DependencySeverity::Warn, vec![]);

        assert!(validator
            .check(&graph, racy, &[PathBuf::from("/w/late.h")], &[])
            .is_empty());
        let violations = validator.check(&graph, gen, &[], &[PathBuf::from("/w/late.h")]);
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::UndeclaredDependency { consumer, .. } if consumer == "t racy"
        )));
    }

    #[test]
    fn exempt_subtrees_and_ignore_policy_report_nothing() {
        let (graph, _, _, racy) = graph();
        let exempt = DependencyValidator::new(DependencySeverity::Error, vec![PathBuf::from("/w")]);
        assert!(exempt
            .check(&graph, racy, &[PathBuf::from("/w/gen.h")], &[])
            .is_empty());

        let ignore = DependencyValidator::new(DependencySeverity::Ignore, vec![]);
        assert!(ignore
            .check(&graph, racy, &[PathBuf::from("/w/gen.h")], &[])
            .is_empty());
    }
}
