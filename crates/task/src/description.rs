//! JSON build descriptions.
//!
//! ```json
//! {
//!   "tasks": [
//!     { "rule": "cc", "command": ["cc", "-c", "a.c", "-o", "a.o", "-MD"],
//!       "inputs": ["a.c"], "outputs": ["a.o"],
//!       "dependency_info": { "makefile": "a.d" } },
//!     { "rule": "link", "command": ["cc", "a.o", "-o", "app"],
//!       "inputs": ["a.o"], "outputs": ["app"] },
//!     { "gate": true, "name": "tests", "after": ["link app"] }
//!   ]
//! }
//! ```
//!
//! Relative `cwd` values resolve against the description's directory;
//! inputs and outputs resolve against the task's `cwd`. Entries in `after`
//! and `blocks` name a task by identity (`"<rule> <primary>"`), by `name`,
//! or by one of its output paths.

use crate::definition::{DependencyInfo, GraphSplice, Task, TaskExpander, TaskIdentity};
use crate::graph::{NodeId, TaskGraph};
use kiln_core::{Error, Result};
use kiln_utils::absolutize;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Description {
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskSpec {
    #[serde(default = "default_rule")]
    rule: String,
    name: Option<String>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    description: Option<String>,
    #[serde(default)]
    inputs: Vec<PathBuf>,
    #[serde(default)]
    outputs: Vec<PathBuf>,
    #[serde(default)]
    gate: bool,
    #[serde(default = "default_cacheable")]
    cacheable: bool,
    dependency_info: Option<DependencyInfo>,
    #[serde(default)]
    after: Vec<String>,
    #[serde(default)]
    blocks: Vec<String>,
    #[serde(default)]
    expands: bool,
    timeout_ms: Option<u64>,
}

fn default_rule() -> String {
    "command".to_string()
}

fn default_cacheable() -> bool {
    true
}

impl TaskSpec {
    fn working_directory(&self, base: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) => absolutize(base, cwd),
            None => base.to_path_buf(),
        }
    }

    fn to_task(&self, base: &Path) -> Result<Task> {
        let cwd = self.working_directory(base);

        if self.gate {
            let name = self
                .name
                .as_deref()
                .ok_or_else(|| Error::invalid_description("a gate needs a name"))?;
            if !self.command.is_empty() || !self.outputs.is_empty() || self.expands {
                return Err(Error::invalid_description(format!(
                    "gate '{name}' cannot have a command, outputs or expansion"
                )));
            }
            return Ok(Task::gate(name, cwd));
        }

        let mut builder = Task::builder(self.rule.as_str(), cwd)
            .command(self.command.iter().cloned())
            .inputs(&self.inputs)
            .outputs(&self.outputs)
            .cacheable(self.cacheable);
        if let Some(name) = &self.name {
            builder = builder.name(name.as_str());
        }
        if let Some(description) = &self.description {
            builder = builder.description(description.as_str());
        }
        for (key, value) in &self.env {
            builder = builder.env(key.as_str(), value.as_str());
        }
        if let Some(info) = &self.dependency_info {
            builder = builder.dependency_info(info.clone());
        }
        if let Some(ms) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if self.expands {
            if self.outputs.is_empty() {
                return Err(Error::invalid_description(format!(
                    "expanding task '{}' must declare its fragment as an output",
                    self.name.as_deref().unwrap_or(&self.rule)
                )));
            }
            builder = builder.expander(Arc::new(DescriptionExpander));
        }
        builder.build()
    }
}

/// Lookup of the names a description may use to refer to a task
#[derive(Default)]
struct References {
    by_identity: HashMap<String, TaskIdentity>,
    by_name: HashMap<String, TaskIdentity>,
    by_output: HashMap<PathBuf, TaskIdentity>,
}

impl References {
    fn add(&mut self, spec: &TaskSpec, task: &Task) {
        let identity = task.identity().clone();
        self.by_identity
            .insert(identity.as_str().to_string(), identity.clone());
        if let Some(name) = &spec.name {
            self.by_name.insert(name.clone(), identity.clone());
        }
        for output in task.declared_outputs() {
            self.by_output.insert(output.clone(), identity.clone());
        }
    }

    fn resolve(&self, reference: &str, cwd: &Path) -> Option<TaskIdentity> {
        self.by_identity
            .get(reference)
            .or_else(|| self.by_name.get(reference))
            .or_else(|| self.by_output.get(&absolutize(cwd, Path::new(reference))))
            .cloned()
    }
}

/// Tasks plus `(dependent, dependency)` identity pairs
fn parse(text: &str, base: &Path) -> Result<(Vec<Task>, Vec<(TaskIdentity, TaskIdentity)>)> {
    let description: Description =
        serde_json::from_str(text).map_err(|e| Error::json("invalid build description", e))?;

    let mut tasks = Vec::with_capacity(description.tasks.len());
    let mut references = References::default();
    for spec in &description.tasks {
        let task = spec.to_task(base)?;
        references.add(spec, &task);
        tasks.push(task);
    }

    let mut edges = Vec::new();
    for (spec, task) in description.tasks.iter().zip(&tasks) {
        let cwd = spec.working_directory(base);
        for reference in &spec.after {
            let dependency = references.resolve(reference, &cwd).unwrap_or_else(|| TaskIdentity::from_label(reference));
            edges.push((task.identity().clone(), dependency));
        }
        for reference in &spec.blocks {
            let dependent = references.resolve(reference, &cwd).unwrap_or_else(|| TaskIdentity::from_label(reference));
            edges.push((dependent, task.identity().clone()));
        }
    }

    Ok((tasks, edges))
}

/// Build a graph from description text. Relative paths resolve against
/// `base`.
pub fn parse_description(text: &str, base: &Path) -> Result<TaskGraph> {
    let (tasks, edges) = parse(text, base)?;

    let mut graph = TaskGraph::new();
    let mut nodes: HashMap<TaskIdentity, NodeId> = HashMap::with_capacity(tasks.len());
    for task in tasks {
        let identity = task.identity().clone();
        let node = graph.add_task(task)?;
        nodes.insert(identity, node);
    }

    for (dependent, dependency) in edges {
        let lookup = |identity: &TaskIdentity| {
            nodes
                .get(identity)
                .copied()
                .ok_or_else(|| Error::invalid_description(format!("unknown task '{identity}'")))
        };
        graph.add_edge(lookup(&dependent)?, lookup(&dependency)?)?;
    }

    debug!(tasks = graph.len(), "parsed build description");
    Ok(graph)
}

/// Read and parse a description file; relative paths resolve against the
/// file's directory
pub fn load_description(path: &Path) -> Result<TaskGraph> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::file_system(path, "read build description", e))?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base = absolutize(&std::env::current_dir().unwrap_or_default(), &base);
    parse_description(&text, &base)
}

/// Splices the description fragment a task wrote to its first output.
///
/// References the fragment cannot resolve itself are taken as identities
/// of tasks already in the graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptionExpander;

impl TaskExpander for DescriptionExpander {
    fn expand(&self, task: &Task) -> Result<GraphSplice> {
        let fragment = task.declared_outputs().first().ok_or_else(|| {
            Error::invalid_description(format!("'{}' has no fragment output to expand", task.identity()))
        })?;
        let text = std::fs::read_to_string(fragment)
            .map_err(|e| Error::file_system(fragment, "read description fragment", e))?;
        let (tasks, edges) = parse(&text, task.working_directory())?;
        Ok(GraphSplice { tasks, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const COMPILE_LINK: &str = r#"{
        "tasks": [
            { "rule": "cc", "command": ["cc", "-c", "a.c"], "inputs": ["a.c"], "outputs": ["a.o"],
              "dependency_info": { "makefile": "a.d" } },
            { "rule": "link", "command": ["cc", "a.o", "-o", "app"], "inputs": ["a.o"], "outputs": ["app"],
              "env": { "LANG": "C" }, "timeout_ms": 5000 },
            { "name": "lint", "command": ["lint", "a.c"], "inputs": ["a.c"], "after": ["a.o"] },
            { "gate": true, "name": "done", "after": ["link app", "lint"] }
        ]
    }"#;

    #[test]
    fn tasks_and_edges_are_loaded() {
        let graph = parse_description(COMPILE_LINK, Path::new("/src")).unwrap().freeze().unwrap();
        assert_eq!(graph.len(), 4);

        let cc = graph.find(&TaskIdentity::new("cc", "a.o")).unwrap();
        let link = graph.find(&TaskIdentity::new("link", "app")).unwrap();
        let lint = graph.find(&TaskIdentity::new("command", "lint")).unwrap();
        let gate = graph.find(&TaskIdentity::new("gate", "done")).unwrap();

        assert!(graph.depends_on(link, cc));
        assert!(graph.depends_on(lint, cc));
        assert!(graph.depends_on(gate, link));
        assert!(graph.depends_on(gate, lint));

        let cc_task = graph.task(cc).unwrap();
        assert_eq!(cc_task.declared_inputs(), &[PathBuf::from("/src/a.c")]);
        assert_eq!(
            cc_task.dependency_info(),
            Some(&DependencyInfo::Makefile(PathBuf::from("/src/a.d")))
        );
        let link_task = graph.task(link).unwrap();
        assert_eq!(link_task.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(link_task.environment().get("LANG").map(String::as_str), Some("C"));
        assert!(graph.task(gate).unwrap().is_gate());
    }

    #[test]
    fn blocks_orders_the_named_task_after_this_one() {
        let text = r#"{ "tasks": [
            { "gate": true, "name": "setup", "blocks": ["cc a.o"] },
            { "rule": "cc", "command": ["cc"], "outputs": ["a.o"] }
        ] }"#;
        let graph = parse_description(text, Path::new("/w")).unwrap().freeze().unwrap();
        let setup = graph.find(&TaskIdentity::new("gate", "setup")).unwrap();
        let cc = graph.find(&TaskIdentity::new("cc", "a.o")).unwrap();
        assert!(graph.depends_on(cc, setup));
    }

    #[test]
    fn unknown_references_and_fields_are_rejected() {
        let unknown = r#"{ "tasks": [ { "name": "a", "command": ["true"], "after": ["missing"] } ] }"#;
        assert!(parse_description(unknown, Path::new("/w")).is_err());

        let typo = r#"{ "tasks": [ { "name": "a", "comand": ["true"] } ] }"#;
        assert!(parse_description(typo, Path::new("/w")).is_err());

        let gate_with_command = r#"{ "tasks": [ { "gate": true, "name": "g", "command": ["true"] } ] }"#;
        assert!(parse_description(gate_with_command, Path::new("/w")).is_err());
    }

    #[test]
    fn cycles_are_reported_at_freeze() {
        let text = r#"{ "tasks": [
            { "name": "a", "command": ["a"], "after": ["b"] },
            { "name": "b", "command": ["b"], "after": ["a"] }
        ] }"#;
        let error = parse_description(text, Path::new("/w")).unwrap().freeze().unwrap_err();
        let members = error.cycle_members().unwrap();
        assert!(members.contains(&"command a".to_string()));
        assert!(members.contains(&"command b".to_string()));
    }

    #[test]
    fn fragments_become_splices() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("more.json"),
            r#"{ "tasks": [
                { "rule": "cc", "command": ["cc", "-c", "b.c"], "inputs": ["b.c"], "outputs": ["b.o"] },
                { "rule": "ar", "command": ["ar", "lib.a", "b.o"], "inputs": ["b.o"], "outputs": ["lib.a"],
                  "after": ["gen more.json"] }
            ] }"#,
        )
        .unwrap();

        let generator = Task::builder("gen", dir.path())
            .command(["gen"])
            .output("more.json")
            .expander(Arc::new(DescriptionExpander))
            .build()
            .unwrap();
        let splice = generator.expander().unwrap().expand(&generator).unwrap();

        assert_eq!(splice.tasks.len(), 2);
        assert_eq!(splice.tasks[0].declared_outputs(), &[dir.path().join("b.o")]);
        assert_eq!(
            splice.edges,
            vec![(TaskIdentity::new("ar", "lib.a"), TaskIdentity::new("gen", "more.json"))]
        );
    }

    #[test]
    fn load_resolves_against_the_file_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("build.json");
        std::fs::write(
            &path,
            r#"{ "tasks": [ { "rule": "cp", "cwd": "sub", "command": ["cp", "a", "b"], "inputs": ["a"], "outputs": ["b"] } ] }"#,
        )
        .unwrap();

        let graph = load_description(&path).unwrap().freeze().unwrap();
        let node = graph.find(&TaskIdentity::new("cp", "b")).unwrap();
        let task = graph.task(node).unwrap();
        assert_eq!(task.working_directory(), dir.path().join("sub"));
        assert_eq!(task.declared_outputs(), &[dir.path().join("sub/b")]);
    }
}
