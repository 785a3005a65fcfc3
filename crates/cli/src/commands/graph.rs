use clap::{Subcommand, ValueEnum};
use kiln_task::{load_description, FrozenGraph, Node};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum GraphFormat {
    #[default]
    Text,
    Dot,
    Json,
}

#[derive(Subcommand)]
pub enum GraphCommands {
    /// Load a description and report cycles or conflicting producers
    Check {
        #[arg(default_value = "build.json")]
        description: PathBuf,
    },
    /// Print the task graph
    Show {
        #[arg(default_value = "build.json")]
        description: PathBuf,

        #[arg(long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },
}

impl GraphCommands {
    pub fn execute(self, directory: &Path) -> eyre::Result<ExitCode> {
        match self {
            GraphCommands::Check { description } => {
                let graph = load_description(&super::resolve(directory, &description))?;
                match graph.freeze() {
                    Ok(graph) => {
                        println!("ok: {} nodes", graph.len());
                        Ok(ExitCode::SUCCESS)
                    }
                    Err(e) => {
                        eprintln!("error: {e}");
                        Ok(ExitCode::FAILURE)
                    }
                }
            }
            GraphCommands::Show { description, format } => {
                let graph = load_description(&super::resolve(directory, &description))?.freeze()?;
                let rendered = match format {
                    GraphFormat::Text => text(&graph),
                    GraphFormat::Dot => dot(&graph),
                    GraphFormat::Json => serde_json::to_string_pretty(&json(&graph))?,
                };
                println!("{rendered}");
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

fn dependency_labels(graph: &FrozenGraph, node: kiln_task::NodeId) -> Vec<String> {
    let mut labels: Vec<String> = graph
        .dependencies(node)
        .into_iter()
        .map(|d| graph.label(d).to_string())
        .collect();
    labels.sort();
    labels
}

fn text(graph: &FrozenGraph) -> String {
    let mut out = String::new();
    for node in graph.node_ids() {
        let kind = match graph.node(node) {
            Some(Node::Task(task)) if task.is_gate() => "gate",
            Some(Node::Task(_)) => "task",
            _ => "virtual",
        };
        let _ = writeln!(out, "{kind} {}", graph.label(node));
        for dependency in dependency_labels(graph, node) {
            let _ = writeln!(out, "  after {dependency}");
        }
    }
    out
}

fn dot(graph: &FrozenGraph) -> String {
    let mut out = String::from("digraph build {\n  rankdir=LR;\n  node [shape=box];\n");
    for node in graph.node_ids() {
        let shape = match graph.node(node) {
            Some(Node::Task(task)) if !task.is_gate() => "box",
            _ => "diamond",
        };
        let _ = writeln!(
            out,
            "  n{} [label=\"{}\", shape={shape}];",
            node.index(),
            graph.label(node).replace('"', "\\\"")
        );
        for dependency in graph.dependencies(node) {
            let _ = writeln!(out, "  n{} -> n{};", dependency.index(), node.index());
        }
    }
    out.push('}');
    out
}

fn json(graph: &FrozenGraph) -> serde_json::Value {
    let nodes: Vec<serde_json::Value> = graph
        .node_ids()
        .map(|node| {
            serde_json::json!({
                "label": graph.label(node),
                "after": dependency_labels(graph, node),
            })
        })
        .collect();
    serde_json::json!({ "nodes": nodes })
}
