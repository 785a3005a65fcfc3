//! Task model, graph and scheduler for kiln
//!
//! This crate turns a build description into a [`TaskGraph`], decides which
//! tasks are out of date via the [`SignatureEngine`] and runs the rest on a
//! bounded worker pool, consulting the build cache on the way.

pub mod definition;
pub mod depinfo;
pub mod description;
pub mod errors;
pub mod graph;
pub mod history;
pub mod process;
pub mod result;
pub mod scheduler;
pub mod signature;
pub mod testing;
pub mod validator;

pub use definition::{DependencyInfo, GraphSplice, Task, TaskBuilder, TaskExpander, TaskIdentity};
pub use depinfo::{parse_makefile_deps, read_dependency_info, DiscoveredDependencies};
pub use description::{load_description, parse_description, DescriptionExpander};
pub use errors::{GraphError, SignatureError};
pub use graph::{EdgeKind, FrozenGraph, Node, NodeId, TaskGraph};
pub use history::{SignatureHistory, SignatureRecord};
pub use process::{
    CapturedOutput, ExitStatus, ProcessExecutor, ProcessOutcome, ProcessRequest, SystemProcessExecutor,
};
pub use result::{BuildResult, BuildSummary, SkipReason, TaskResult};
pub use scheduler::Scheduler;
pub use signature::{resolve_inputs, InputStamp, SignatureEngine};
pub use validator::{DependencyValidator, Violation};
