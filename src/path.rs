//! Dotted key expressions over a scope's value tree.
//!
//! An expression such as `nested.nested1.value` addresses a value by walking
//! object keys. Only objects are containers: arrays and scalars are leaves,
//! and numeric-looking steps are plain map keys, never array indices.

use crate::error::ContextError;
use serde_json::{Map, Value};

/// The content of one scope: top-level key names to arbitrary JSON values,
/// in first-write order.
pub type ValueTree = Map<String, Value>;

const STEP_SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    steps: Vec<String>,
}

impl PathExpr {
    pub fn parse(expr: &str) -> Result<Self, ContextError> {
        let invalid = |reason| ContextError::InvalidExpression {
            expr: expr.to_string(),
            reason,
        };
        if expr.is_empty() {
            return Err(invalid("empty expression"));
        }
        let mut steps = Vec::new();
        for step in expr.split(STEP_SEPARATOR) {
            if step.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if step.contains(['[', ']']) {
                return Err(invalid("bracketed segments are not supported"));
            }
            if step.contains(['{', '}', '"', '\'']) {
                return Err(invalid("segment contains a reserved character"));
            }
            if step.chars().any(char::is_control) {
                return Err(invalid("segment contains a control character"));
            }
            steps.push(step.to_string());
        }
        Ok(Self {
            raw: expr.to_string(),
            steps,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// The top-level key this expression lives under.
    pub fn head(&self) -> &str {
        &self.steps[0]
    }

    /// Steps below the top-level key; empty for a top-level expression.
    pub fn tail(&self) -> &[String] {
        &self.steps[1..]
    }

    pub fn get<'a>(&self, tree: &'a ValueTree) -> Option<&'a Value> {
        get_steps(tree, &self.steps)
    }

    pub fn set(&self, tree: &mut ValueTree, value: Value) {
        set_steps(tree, &self.steps, value);
    }

    pub fn delete(&self, tree: &mut ValueTree) {
        delete_steps(tree, &self.steps);
    }
}

impl std::fmt::Display for PathExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parses a batch of expressions in order; the first malformed one fails the
/// whole batch.
pub fn parse_all<S: AsRef<str>>(exprs: &[S]) -> Result<Vec<PathExpr>, ContextError> {
    exprs.iter().map(|e| PathExpr::parse(e.as_ref())).collect()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub(crate) fn get_steps<'a>(tree: &'a ValueTree, steps: &[String]) -> Option<&'a Value> {
    let (last, parents) = steps.split_last()?;
    let mut node = tree;
    for step in parents {
        match node.get(step.as_str()) {
            Some(Value::Object(map)) => node = map,
            _ => return None,
        }
    }
    node.get(last.as_str())
}

pub(crate) fn set_steps(tree: &mut ValueTree, steps: &[String], value: Value) {
    let Some((last, parents)) = steps.split_last() else {
        return;
    };
    let mut node = tree;
    for step in parents {
        let slot = node.entry(step.as_str()).or_insert_with(empty_object);
        if !slot.is_object() {
            *slot = empty_object();
        }
        let Value::Object(map) = slot else {
            return;
        };
        node = map;
    }
    node.insert(last.clone(), value);
}

pub(crate) fn delete_steps(tree: &mut ValueTree, steps: &[String]) {
    let Some((last, parents)) = steps.split_last() else {
        return;
    };
    let mut node = tree;
    for step in parents {
        match node.get_mut(step.as_str()) {
            Some(Value::Object(map)) => node = map,
            _ => return,
        }
    }
    node.shift_remove(last.as_str());
}
