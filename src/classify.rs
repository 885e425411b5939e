//! Missing-dependency detection in verification output.
//!
//! Each line is checked against an ordered list of rules; a rule pairs a
//! dependency kind with an extractor. New signatures are new rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// What sort of thing the sandbox image is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DependencyKind {
    /// A shell command.
    Command,
    /// A Python module.
    InterpreterModule,
    /// A Node package.
    Package,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::InterpreterModule => write!(f, "interpreter-module"),
            Self::Package => write!(f, "package"),
        }
    }
}

/// A dependency the verification run could not find.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct MissingDependency {
    pub kind: DependencyKind,
    pub name: String,
}

impl MissingDependency {
    pub fn new(kind: DependencyKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.name)
    }
}

/// One detection rule.
struct Rule {
    kind: DependencyKind,
    extract: fn(&str) -> Option<String>,
}

static PY_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"No module named '([^']+)'").expect("valid regex"));

static NODE_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cannot find module '([^']+)'").expect("valid regex"));

/// Evaluated in order against every line.
const RULES: &[Rule] = &[
    Rule {
        kind: DependencyKind::Command,
        extract: command_not_found,
    },
    Rule {
        kind: DependencyKind::InterpreterModule,
        extract: python_module,
    },
    Rule {
        kind: DependencyKind::Package,
        extract: node_package,
    },
];

/// Scans `text` line by line, in first-seen order. Duplicates are kept.
pub(crate) fn classify(text: &str) -> Vec<MissingDependency> {
    text.lines()
        .flat_map(|line| {
            RULES.iter().filter_map(move |rule| {
                (rule.extract)(line).map(|name| MissingDependency::new(rule.kind, name))
            })
        })
        .collect()
}

/// `bash: line 3: foo: command not found` → `foo`
fn command_not_found(line: &str) -> Option<String> {
    if !line.contains("command not found") {
        return None;
    }
    let parts: Vec<&str> = line.split(':').collect();
    let name = parts.len().checked_sub(2).map(|i| parts[i].trim())?;
    (!name.is_empty() && !name.starts_with('/')).then(|| name.to_string())
}

fn python_module(line: &str) -> Option<String> {
    PY_MODULE.captures(line).map(|c| c[1].to_string())
}

/// Relative and absolute module paths are the project's own files.
fn node_package(line: &str) -> Option<String> {
    let caps = NODE_MODULE.captures(line)?;
    let name = &caps[1];
    (!name.starts_with('/') && !name.starts_with('.')).then(|| name.to_string())
}
