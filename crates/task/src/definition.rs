//! Task definitions.
//!
//! A [`Task`] is immutable once built. Relative paths are resolved against
//! the task's working directory at construction so the rest of the engine
//! only ever sees absolute, lexically normalized paths.

use kiln_core::{Error, Result};
use kiln_utils::absolutize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Stable identity of a task across builds: its rule type plus its primary
/// output (or an explicit name for tasks without outputs).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIdentity(String);

impl TaskIdentity {
    pub fn new(rule: &str, primary: &str) -> Self {
        Self(format!("{rule} {primary}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity from its rendered form, `"<rule> <primary>"`
    pub(crate) fn from_label(label: &str) -> Self {
        Self(label.to_string())
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskIdentity({})", self.0)
    }
}

/// How a process reports the dependencies it discovered while running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyInfo {
    /// Make-style depfile (`target: dep dep \`)
    Makefile(PathBuf),
    /// JSON trace file `{ "reads": [..], "writes": [..] }`
    Trace(PathBuf),
}

impl DependencyInfo {
    pub fn path(&self) -> &Path {
        match self {
            DependencyInfo::Makefile(path) | DependencyInfo::Trace(path) => path,
        }
    }
}

/// Produces new graph work once a task has completed successfully.
pub trait TaskExpander: Send + Sync + fmt::Debug {
    fn expand(&self, task: &Task) -> Result<GraphSplice>;
}

/// Work to splice into a running build.
///
/// Every new task runs after the task that produced the splice. `edges` are
/// `(dependent, dependency)` pairs naming new or existing tasks.
#[derive(Debug, Clone, Default)]
pub struct GraphSplice {
    pub tasks: Vec<Task>,
    pub edges: Vec<(TaskIdentity, TaskIdentity)>,
}

impl GraphSplice {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.edges.is_empty()
    }
}

#[derive(Clone)]
pub struct Task {
    identity: TaskIdentity,
    rule: String,
    command_line: Vec<String>,
    environment: BTreeMap<String, String>,
    working_directory: PathBuf,
    description: String,
    declared_inputs: Vec<PathBuf>,
    declared_outputs: Vec<PathBuf>,
    is_gate: bool,
    allows_caching: bool,
    dependency_info: Option<DependencyInfo>,
    timeout: Option<Duration>,
    expander: Option<Arc<dyn TaskExpander>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("identity", &self.identity)
            .field("command_line", &self.command_line)
            .field("declared_inputs", &self.declared_inputs)
            .field("declared_outputs", &self.declared_outputs)
            .field("is_gate", &self.is_gate)
            .field("expands", &self.expander.is_some())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn builder(rule: impl Into<String>, working_directory: impl Into<PathBuf>) -> TaskBuilder {
        TaskBuilder::new(rule, working_directory)
    }

    /// A gate: no command, no signature, no cache behaviour. It only orders
    /// the tasks around it.
    pub fn gate(name: &str, working_directory: impl Into<PathBuf>) -> Self {
        let working_directory = working_directory.into();
        Self {
            identity: TaskIdentity::new("gate", name),
            rule: "gate".to_string(),
            command_line: Vec::new(),
            environment: BTreeMap::new(),
            working_directory,
            description: format!("gate {name}"),
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            is_gate: true,
            allows_caching: false,
            dependency_info: None,
            timeout: None,
            expander: None,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn declared_inputs(&self) -> &[PathBuf] {
        &self.declared_inputs
    }

    pub fn declared_outputs(&self) -> &[PathBuf] {
        &self.declared_outputs
    }

    pub fn is_gate(&self) -> bool {
        self.is_gate
    }

    pub fn allows_caching(&self) -> bool {
        self.allows_caching
    }

    pub fn dependency_info(&self) -> Option<&DependencyInfo> {
        self.dependency_info.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn expander(&self) -> Option<&Arc<dyn TaskExpander>> {
        self.expander.as_ref()
    }

    /// Whether every declared output currently exists
    pub fn outputs_exist(&self) -> bool {
        self.declared_outputs.iter().all(|p| p.exists())
    }
}

pub struct TaskBuilder {
    rule: String,
    name: Option<String>,
    command_line: Vec<String>,
    environment: BTreeMap<String, String>,
    working_directory: PathBuf,
    description: Option<String>,
    declared_inputs: Vec<PathBuf>,
    declared_outputs: Vec<PathBuf>,
    primary_output: Option<String>,
    allows_caching: bool,
    dependency_info: Option<DependencyInfo>,
    timeout: Option<Duration>,
    expander: Option<Arc<dyn TaskExpander>>,
}

impl TaskBuilder {
    pub fn new(rule: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            rule: rule.into(),
            name: None,
            command_line: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: working_directory.into(),
            description: None,
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            primary_output: None,
            allows_caching: true,
            dependency_info: None,
            timeout: None,
            expander: None,
        }
    }

    /// Identity key for tasks without outputs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_line = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(normalize_env_key(key.into()), value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.declared_inputs
            .push(absolutize(&self.working_directory, path.as_ref()));
        self
    }

    pub fn inputs<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths.into_iter().fold(self, |builder, p| builder.input(p))
    }

    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if self.primary_output.is_none() {
            self.primary_output = Some(path.to_string_lossy().into_owned());
        }
        self.declared_outputs
            .push(absolutize(&self.working_directory, path));
        self
    }

    pub fn outputs<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths.into_iter().fold(self, |builder, p| builder.output(p))
    }

    pub fn cacheable(mut self, allows_caching: bool) -> Self {
        self.allows_caching = allows_caching;
        self
    }

    pub fn dependency_info(mut self, info: DependencyInfo) -> Self {
        let resolved = match info {
            DependencyInfo::Makefile(p) => {
                DependencyInfo::Makefile(absolutize(&self.working_directory, &p))
            }
            DependencyInfo::Trace(p) => DependencyInfo::Trace(absolutize(&self.working_directory, &p)),
        };
        self.dependency_info = Some(resolved);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expander(mut self, expander: Arc<dyn TaskExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn build(self) -> Result<Task> {
        let key = self
            .name
            .clone()
            .or_else(|| self.primary_output.clone())
            .ok_or_else(|| {
                Error::invalid_description(format!(
                    "{} task needs a name or at least one output",
                    self.rule
                ))
            })?;
        if self.command_line.is_empty() {
            return Err(Error::invalid_description(format!(
                "task '{}' has an empty command line",
                TaskIdentity::new(&self.rule, &key)
            )));
        }
        let identity = TaskIdentity::new(&self.rule, &key);
        let description = self
            .description
            .unwrap_or_else(|| format!("{} {}", self.rule, key));

        Ok(Task {
            identity,
            rule: self.rule,
            command_line: self.command_line,
            environment: self.environment,
            working_directory: self.working_directory,
            description,
            declared_inputs: self.declared_inputs,
            declared_outputs: self.declared_outputs,
            is_gate: false,
            allows_caching: self.allows_caching,
            dependency_info: self.dependency_info,
            timeout: self.timeout,
            expander: self.expander,
        })
    }
}

#[cfg(windows)]
fn normalize_env_key(key: String) -> String {
    key.to_uppercase()
}

#[cfg(not(windows))]
fn normalize_env_key(key: String) -> String {
    key
}
