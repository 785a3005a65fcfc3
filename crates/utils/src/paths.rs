//! Path helpers: lexical normalization and prefix remapping

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Normalize `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `path` against `base` (if relative) and normalize it
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_lexically(path)
    } else {
        normalize_lexically(&base.join(path))
    }
}

/// Whether `path` equals `root` or lies below it
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// One `from → to` prefix rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRule {
    pub from: PathBuf,
    pub to: String,
}

/// Rewrites host-specific path prefixes into stable tokens.
///
/// Used when deriving cache keys so that the same build checked out at two
/// different locations produces identical keys. Rules are applied
/// longest-prefix first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRemapper {
    rules: Vec<PrefixRule>,
}

impl PathRemapper {
    pub fn new(mut rules: Vec<PrefixRule>) -> Self {
        rules.retain(|r| !r.from.as_os_str().is_empty());
        rules.sort_by(|a, b| {
            b.from
                .as_os_str()
                .len()
                .cmp(&a.from.as_os_str().len())
                .then_with(|| a.from.cmp(&b.from))
        });
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[PrefixRule] {
        &self.rules
    }

    /// Remap a path. Paths matching no rule are returned unchanged.
    pub fn remap_path(&self, path: &Path) -> String {
        for rule in &self.rules {
            if let Ok(rest) = path.strip_prefix(&rule.from) {
                if rest.as_os_str().is_empty() {
                    return rule.to.clone();
                }
                return format!("{}/{}", rule.to, rest.to_string_lossy());
            }
        }
        path.to_string_lossy().into_owned()
    }

    /// Remap every occurrence of a prefix inside free text such as a
    /// command-line argument (`-I/src/include`).
    pub fn remap_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            let from = rule.from.to_string_lossy();
            if out.contains(&*from) {
                out = out.replace(&*from, &rule.to);
            }
        }
        out
    }

    /// Map a remapped path back to this host
    pub fn unmap(&self, remapped: &str) -> PathBuf {
        for rule in &self.rules {
            if remapped == rule.to {
                return rule.from.clone();
            }
            if let Some(rest) = remapped.strip_prefix(&format!("{}/", rule.to)) {
                return rule.from.join(rest);
            }
        }
        PathBuf::from(remapped)
    }
}
