//! Petgraph-backed task graph.
//!
//! An edge `A → B` means A depends on B: B must complete before A starts.
//! Edges come from explicit dependencies, from matching a task's declared
//! inputs against other tasks' declared outputs, and from gate ordering.
//!
//! [`TaskGraph`] is the mutable construction phase. [`TaskGraph::freeze`]
//! derives producer edges, rejects cycles and yields a [`FrozenGraph`] whose
//! only mutation is an all-or-nothing [`FrozenGraph::splice`].

use crate::definition::{GraphSplice, Task, TaskIdentity};
use crate::errors::GraphError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Result<T> = std::result::Result<T, GraphError>;

/// Stable handle to a graph vertex. Nodes are never removed, so a handle
/// stays valid for the life of the graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(NodeIndex);

impl NodeId {
    pub fn index(self) -> usize {
        self.0.index()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0.index())
    }
}

/// A graph vertex
#[derive(Debug, Clone)]
pub enum Node {
    Task(Arc<Task>),
    /// Pure ordering marker with no work attached
    Virtual(String),
}

impl Node {
    pub fn label(&self) -> &str {
        match self {
            Node::Task(task) => task.identity().as_str(),
            Node::Virtual(name) => name,
        }
    }

    pub fn task(&self) -> Option<&Arc<Task>> {
        match self {
            Node::Task(task) => Some(task),
            Node::Virtual(_) => None,
        }
    }
}

/// Why an edge exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Explicit,
    /// Consumer of a path depends on its producer
    Producer,
    Gate,
    /// Added by a dynamic splice
    Splice,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    graph: DiGraph<Node, EdgeKind>,
    by_identity: HashMap<TaskIdentity, NodeIndex>,
}

impl Inner {
    fn insert_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.by_identity.contains_key(task.identity()) {
            return Err(GraphError::DuplicateTask(task.identity().clone()));
        }
        let identity = task.identity().clone();
        let index = self.graph.add_node(Node::Task(Arc::new(task)));
        self.by_identity.insert(identity, index);
        Ok(index)
    }

    fn check(&self, id: NodeId) -> Result<NodeIndex> {
        if id.0.index() < self.graph.node_count() {
            Ok(id.0)
        } else {
            Err(GraphError::UnknownNode(id.0.index()))
        }
    }

    fn connect(&mut self, dependent: NodeIndex, dependency: NodeIndex, kind: EdgeKind) {
        if dependent != dependency && self.graph.find_edge(dependent, dependency).is_none() {
            self.graph.add_edge(dependent, dependency, kind);
        }
    }

    /// Map every declared output to its producing node
    fn producers(&self) -> Result<HashMap<PathBuf, NodeIndex>> {
        let mut producers: HashMap<PathBuf, NodeIndex> = HashMap::new();
        for index in self.graph.node_indices() {
            let Some(task) = self.graph[index].task() else {
                continue;
            };
            for output in task.declared_outputs() {
                if let Some(&existing) = producers.get(output) {
                    return Err(GraphError::DuplicateProducer {
                        path: output.clone(),
                        first: self.graph[existing].label().to_string(),
                        second: self.graph[index].label().to_string(),
                    });
                }
                producers.insert(output.clone(), index);
            }
        }
        Ok(producers)
    }

    fn link_consumers(&mut self, producers: &HashMap<PathBuf, NodeIndex>, kind: EdgeKind) {
        let mut edges = Vec::new();
        for index in self.graph.node_indices() {
            let Some(task) = self.graph[index].task() else {
                continue;
            };
            for input in task.declared_inputs() {
                if let Some(&producer) = producers.get(input) {
                    edges.push((index, producer));
                }
            }
        }
        for (consumer, producer) in edges {
            self.connect(consumer, producer, kind);
        }
    }

    /// Depth-first search for a cycle, returning its labels with the first
    /// node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> =
                vec![(root, self.graph.neighbors(root).collect())];
            marks[root.index()] = Mark::OnStack;

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            stack.push((next, self.graph.neighbors(next).collect()));
                        }
                        Mark::OnStack => {
                            let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                            let mut path: Vec<String> = stack[start..]
                                .iter()
                                .map(|(n, _)| self.graph[*n].label().to_string())
                                .collect();
                            path.push(self.graph[next].label().to_string());
                            return Some(path);
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        None
    }
}

/// Graph under construction
#[derive(Debug, Default)]
pub struct TaskGraph {
    inner: Inner,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> Result<NodeId> {
        self.inner.insert_task(task).map(NodeId)
    }

    pub fn add_virtual(&mut self, name: impl Into<String>) -> NodeId {
        NodeId(self.inner.graph.add_node(Node::Virtual(name.into())))
    }

    /// `dependent` runs after `dependency`
    pub fn add_edge(&mut self, dependent: NodeId, dependency: NodeId) -> Result<()> {
        let a = self.inner.check(dependent)?;
        let b = self.inner.check(dependency)?;
        self.inner.connect(a, b, EdgeKind::Explicit);
        Ok(())
    }

    /// Order `gate` after every node in `before` and every node in `after`
    /// after `gate`.
    pub fn add_gate_ordering(&mut self, before: &[NodeId], gate: NodeId, after: &[NodeId]) -> Result<()> {
        let gate = self.inner.check(gate)?;
        for &b in before {
            let b = self.inner.check(b)?;
            self.inner.connect(gate, b, EdgeKind::Gate);
        }
        for &a in after {
            let a = self.inner.check(a)?;
            self.inner.connect(a, gate, EdgeKind::Gate);
        }
        Ok(())
    }

    pub fn find(&self, identity: &TaskIdentity) -> Option<NodeId> {
        self.inner.by_identity.get(identity).copied().map(NodeId)
    }

    pub fn len(&self) -> usize {
        self.inner.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derive producer edges and check the graph is acyclic
    pub fn freeze(self) -> Result<FrozenGraph> {
        let mut inner = self.inner;
        let producers = inner.producers()?;
        inner.link_consumers(&producers, EdgeKind::Producer);
        if let Some(path) = inner.find_cycle() {
            return Err(GraphError::Cycle { path });
        }
        Ok(FrozenGraph { inner, producers })
    }
}

/// Acyclic graph being executed
#[derive(Debug, Clone)]
pub struct FrozenGraph {
    inner: Inner,
    producers: HashMap<PathBuf, NodeIndex>,
}

impl FrozenGraph {
    pub fn len(&self) -> usize {
        self.inner.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inner.graph.node_indices().map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.inner.graph.node_weight(id.0)
    }

    pub fn task(&self, id: NodeId) -> Option<&Arc<Task>> {
        self.node(id).and_then(Node::task)
    }

    pub fn label(&self, id: NodeId) -> &str {
        self.node(id).map(Node::label).unwrap_or("<unknown>")
    }

    pub fn find(&self, identity: &TaskIdentity) -> Option<NodeId> {
        self.inner.by_identity.get(identity).copied().map(NodeId)
    }

    /// Direct dependencies of `id`
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .edges_directed(id.0, Direction::Outgoing)
            .map(|e| NodeId(e.target()))
            .collect()
    }

    /// Nodes that directly depend on `id`
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .edges_directed(id.0, Direction::Incoming)
            .map(|e| NodeId(e.source()))
            .collect()
    }

    pub fn producer_of(&self, path: &Path) -> Option<NodeId> {
        self.producers.get(path).copied().map(NodeId)
    }

    /// Whether `dependent` transitively depends on `dependency`
    pub fn depends_on(&self, dependent: NodeId, dependency: NodeId) -> bool {
        dependent != dependency
            && petgraph::algo::has_path_connecting(&self.inner.graph, dependent.0, dependency.0, None)
    }

    /// Splice dynamically discovered work into the graph.
    ///
    /// New tasks are ordered after `origin`. Existing tasks that consume a
    /// path produced by a new task gain an edge to it, which is an error if
    /// `has_started` reports they are running or finished. Explicit edges
    /// follow the same rule for every existing dependent. On any error the
    /// graph is left untouched.
    pub fn splice(
        &mut self,
        splice: GraphSplice,
        origin: NodeId,
        has_started: impl Fn(NodeId) -> bool,
    ) -> Result<Vec<NodeId>> {
        let origin = self.inner.check(origin)?;
        let mut staged = self.clone();
        let existing = staged.inner.graph.node_count();

        let mut added = Vec::with_capacity(splice.tasks.len());
        for task in splice.tasks {
            let index = staged.inner.insert_task(task)?;
            staged.inner.connect(index, origin, EdgeKind::Splice);
            added.push(index);
        }

        let mut new_outputs = HashSet::new();
        for &index in &added {
            let Some(task) = staged.inner.graph[index].task().cloned() else {
                continue;
            };
            for output in task.declared_outputs() {
                if let Some(&first) = staged.producers.get(output) {
                    return Err(GraphError::DuplicateProducer {
                        path: output.clone(),
                        first: staged.inner.graph[first].label().to_string(),
                        second: task.identity().to_string(),
                    });
                }
                staged.producers.insert(output.clone(), index);
                new_outputs.insert(output.clone());
            }
        }

        // All new outputs are registered first: a new task may consume the
        // output of one added later in the same splice.
        for &index in &added {
            let Some(task) = staged.inner.graph[index].task().cloned() else {
                continue;
            };
            for input in task.declared_inputs() {
                if let Some(&producer) = staged.producers.get(input) {
                    staged.inner.connect(index, producer, EdgeKind::Splice);
                }
            }
        }

        for index in staged.inner.graph.node_indices().take(existing) {
            let Some(task) = staged.inner.graph[index].task().cloned() else {
                continue;
            };
            for input in task.declared_inputs() {
                if !new_outputs.contains(input) {
                    continue;
                }
                let producer = staged.producers[input];
                if has_started(NodeId(index)) {
                    return Err(GraphError::StartedDependent {
                        existing: task.identity().to_string(),
                        new: staged.inner.graph[producer].label().to_string(),
                    });
                }
                staged.inner.connect(index, producer, EdgeKind::Splice);
            }
        }

        for (dependent, dependency) in &splice.edges {
            let a = staged
                .inner
                .by_identity
                .get(dependent)
                .copied()
                .ok_or_else(|| GraphError::UnknownTask(dependent.to_string()))?;
            let b = staged
                .inner
                .by_identity
                .get(dependency)
                .copied()
                .ok_or_else(|| GraphError::UnknownTask(dependency.to_string()))?;
            // a started task may not gain a dependency, old or new
            if a.index() < existing && has_started(NodeId(a)) {
                return Err(GraphError::StartedDependent {
                    existing: dependent.to_string(),
                    new: dependency.to_string(),
                });
            }
            staged.inner.connect(a, b, EdgeKind::Splice);
        }

        if let Some(path) = staged.inner.find_cycle() {
            return Err(GraphError::Cycle { path });
        }

        *self = staged;
        Ok(added.into_iter().map(NodeId).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, inputs: &[&str], outputs: &[&str]) -> Task {
        Task::builder("t", "/w")
            .name(name)
            .command(["run", name])
            .inputs(inputs.iter().copied())
            .outputs(outputs.iter().copied())
            .build()
            .unwrap()
    }

    #[test]
    fn producer_edges_are_derived_on_freeze() {
        let mut graph = TaskGraph::new();
        let compile = graph.add_task(task("compile", &["a.c"], &["a.o"])).unwrap();
        let link = graph.add_task(task("link", &["a.o"], &["app"])).unwrap();
        let frozen = graph.freeze().unwrap();

        assert_eq!(frozen.dependencies(link), vec![compile]);
        assert_eq!(frozen.dependents(compile), vec![link]);
        assert_eq!(frozen.producer_of(Path::new("/w/a.o")), Some(compile));
        assert!(frozen.depends_on(link, compile));
        assert!(!frozen.depends_on(compile, link));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a", &[], &[])).unwrap();
        assert!(matches!(
            graph.add_task(task("a", &[], &[])),
            Err(GraphError::DuplicateTask(_))
        ));
    }

    #[test]
    fn two_producers_of_one_path_are_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("first", &[], &["out"])).unwrap();
        graph.add_task(task("second", &[], &["out"])).unwrap();
        let err = graph.freeze().unwrap_err();
        assert!(matches!(err, GraphError::DuplicateProducer { .. }));
        assert!(err.to_string().contains("t first"));
        assert!(err.to_string().contains("t second"));
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a", &["b.out"], &["a.out"])).unwrap();
        graph.add_task(task("b", &["a.out"], &["b.out"])).unwrap();
        let err = graph.freeze().unwrap_err();

        let members = err.cycle_members().expect("cycle").to_vec();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&"t a".to_string()));
        assert!(members.contains(&"t b".to_string()));
        let text = err.to_string();
        assert!(text.starts_with("dependency cycle: "));
        assert_eq!(text.matches(" -> ").count(), 2);
    }

    #[test]
    fn longer_cycle_through_explicit_edges() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(task("a", &[], &[])).unwrap();
        let b = graph.add_task(task("b", &[], &[])).unwrap();
        let c = graph.add_task(task("c", &[], &[])).unwrap();
        let d = graph.add_task(task("d", &[], &[])).unwrap();
        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();
        graph.add_edge(c, a).unwrap();
        graph.add_edge(d, a).unwrap();
        let err = graph.freeze().unwrap_err();
        let members = err.cycle_members().unwrap();
        assert_eq!(members.len(), 3);
        assert!(!members.contains(&"t d".to_string()));
    }

    #[test]
    fn gate_orders_both_sides() {
        let mut graph = TaskGraph::new();
        let headers = graph.add_task(task("headers", &[], &["h"])).unwrap();
        let gate = graph.add_task(Task::gate("g", "/w")).unwrap();
        let compile = graph.add_task(task("compile", &[], &["o"])).unwrap();
        graph.add_gate_ordering(&[headers], gate, &[compile]).unwrap();
        let frozen = graph.freeze().unwrap();
        assert!(frozen.depends_on(compile, headers));
    }

    #[test]
    fn virtual_nodes_participate_in_ordering() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(task("a", &[], &[])).unwrap();
        let marker = graph.add_virtual("phase-1");
        let b = graph.add_task(task("b", &[], &[])).unwrap();
        graph.add_edge(marker, a).unwrap();
        graph.add_edge(b, marker).unwrap();
        let frozen = graph.freeze().unwrap();
        assert_eq!(frozen.label(marker), "phase-1");
        assert!(frozen.task(marker).is_none());
        assert!(frozen.depends_on(b, a));
    }

    #[test]
    fn splice_adds_tasks_after_origin_and_links_pending_consumers() {
        let mut graph = TaskGraph::new();
        let gen = graph.add_task(task("gen", &[], &["list"])).unwrap();
        let package = graph.add_task(task("package", &["/w/extra.o"], &["pkg"])).unwrap();
        let mut frozen = graph.freeze().unwrap();

        let splice = GraphSplice {
            tasks: vec![task("extra", &[], &["extra.o"])],
            edges: vec![],
        };
        let added = frozen.splice(splice, gen, |n| n == gen).unwrap();
        assert_eq!(added.len(), 1);
        assert!(frozen.depends_on(added[0], gen));
        assert!(frozen.depends_on(package, added[0]));
        assert_eq!(frozen.producer_of(Path::new("/w/extra.o")), Some(added[0]));
    }

    #[test]
    fn splice_rejects_started_consumer_and_leaves_graph_unchanged() {
        let mut graph = TaskGraph::new();
        let gen = graph.add_task(task("gen", &[], &["list"])).unwrap();
        let package = graph.add_task(task("package", &["/w/extra.o"], &["pkg"])).unwrap();
        let mut frozen = graph.freeze().unwrap();

        let splice = GraphSplice {
            tasks: vec![task("extra", &[], &["extra.o"])],
            edges: vec![],
        };
        let err = frozen
            .splice(splice, gen, |n| n == gen || n == package)
            .unwrap_err();
        assert!(matches!(err, GraphError::StartedDependent { .. }));
        assert_eq!(frozen.len(), 2);
        assert!(frozen.producer_of(Path::new("/w/extra.o")).is_none());
    }

    #[test]
    fn splice_rejects_edge_from_finished_task_to_pending_one() {
        let mut graph = TaskGraph::new();
        let done = graph.add_task(task("done", &[], &["done.o"])).unwrap();
        let gen = graph.add_task(task("gen", &[], &["list"])).unwrap();
        let pending = graph.add_task(task("pending", &[], &["pending.o"])).unwrap();
        let mut frozen = graph.freeze().unwrap();

        let splice = GraphSplice {
            tasks: vec![],
            edges: vec![(TaskIdentity::new("t", "done"), TaskIdentity::new("t", "pending"))],
        };
        let err = frozen
            .splice(splice, gen, |n| n == done || n == gen)
            .unwrap_err();
        assert!(matches!(err, GraphError::StartedDependent { .. }));
        assert!(!frozen.depends_on(done, pending));
        assert_eq!(frozen.len(), 3);
    }

    #[test]
    fn splice_accepts_edges_between_pending_tasks() {
        let mut graph = TaskGraph::new();
        let gen = graph.add_task(task("gen", &[], &["list"])).unwrap();
        let first = graph.add_task(task("first", &[], &["first.o"])).unwrap();
        let second = graph.add_task(task("second", &[], &["second.o"])).unwrap();
        let mut frozen = graph.freeze().unwrap();

        let splice = GraphSplice {
            tasks: vec![],
            edges: vec![(TaskIdentity::new("t", "second"), TaskIdentity::new("t", "first"))],
        };
        frozen.splice(splice, gen, |n| n == gen).unwrap();
        assert!(frozen.depends_on(second, first));
    }

    #[test]
    fn splice_rejects_cycles() {
        let mut graph = TaskGraph::new();
        let gen = graph.add_task(task("gen", &[], &["list"])).unwrap();
        let mut frozen = graph.freeze().unwrap();

        let new = task("new", &[], &[]);
        let splice = GraphSplice {
            edges: vec![(TaskIdentity::new("t", "gen"), new.identity().clone())],
            tasks: vec![new],
        };
        // gen is running, so it may not wait for the new task
        assert!(frozen.splice(splice.clone(), gen, |n| n == gen).is_err());
        // even if it had not started, the edge would close a cycle
        let err = frozen.splice(splice, gen, |_| false).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert_eq!(frozen.len(), 1);
    }
}
