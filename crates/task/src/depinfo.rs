//! Reading dependencies reported by a finished process

use crate::definition::DependencyInfo;
use kiln_core::{Error, Result};
use kiln_utils::absolutize;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Paths a process reported reading and writing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredDependencies {
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TraceFile {
    #[serde(default)]
    reads: Vec<PathBuf>,
    #[serde(default)]
    writes: Vec<PathBuf>,
}

/// Load the dependency report named by `info`. Relative paths resolve
/// against `working_directory`. The report must exist.
pub fn read_dependency_info(info: &DependencyInfo, working_directory: &Path) -> Result<DiscoveredDependencies> {
    let path = info.path();
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::file_system(path, "read dependency info", e))?;

    let (inputs, outputs) = match info {
        DependencyInfo::Makefile(_) => (parse_makefile_deps(&text), Vec::new()),
        DependencyInfo::Trace(_) => {
            let trace: TraceFile = serde_json::from_str(&text)
                .map_err(|e| Error::json(format!("parse trace file {}", path.display()), e))?;
            (trace.reads, trace.writes)
        }
    };

    Ok(DiscoveredDependencies {
        inputs: resolve_all(inputs, working_directory),
        outputs: resolve_all(outputs, working_directory),
    })
}

fn resolve_all(paths: Vec<PathBuf>, base: &Path) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .map(|p| absolutize(base, &p))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Prerequisites listed in a make-style depfile, in order, without
/// duplicates. Targets are dropped.
pub fn parse_makefile_deps(text: &str) -> Vec<PathBuf> {
    let joined = text.replace("\\\r\n", " ").replace("\\\n", " ");
    let mut deps: Vec<PathBuf> = Vec::new();

    for line in joined.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(prerequisites) = split_rule(line) else {
            continue;
        };
        for word in split_words(prerequisites) {
            let path = PathBuf::from(word);
            if !deps.contains(&path) {
                deps.push(path);
            }
        }
    }
    deps
}

/// Text after the rule's `:` separator. A colon followed by a path
/// separator (`C:\`, `C:/`) is part of a path, not the separator.
fn split_rule(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b':' => {
                let next = bytes.get(i + 1).copied();
                if matches!(next, Some(b'\\') | Some(b'/')) && i == 1 {
                    i += 1;
                    continue;
                }
                return Some(&line[i + 1..]);
            }
            _ => i += 1,
        }
    }
    None
}

fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some(' ') | Some('#')) => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '$' if chars.peek() == Some(&'$') => {
                chars.next();
                current.push('$');
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
