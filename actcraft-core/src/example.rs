//! Scored examples used for compiling and evaluating programs

use crate::action::{Action, ActionKind};
use crate::error::{self, Error, Result};
use crate::event::Event;
use crate::task::TaskDescriptor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a correct next action looks like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Expectation {
    /// This exact action (thought text ignored)
    Action(Action),
    /// Any action of this kind
    Kind(ActionKind),
    /// A shell command containing this substring
    CommandContains(String),
    /// Any terminal action
    Terminal,
}

impl Expectation {
    pub fn is_satisfied_by(&self, action: &Action) -> bool {
        match self {
            Expectation::Action(expected) => {
                expected.clone().with_thought("") == action.clone().with_thought("")
            }
            Expectation::Kind(kind) => action.kind() == *kind,
            Expectation::CommandContains(needle) => {
                matches!(action, Action::Run { command, .. } if command.contains(needle.as_str()))
            }
            Expectation::Terminal => action.is_terminal(),
        }
    }
}

/// One labeled benchmark case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredExample {
    pub id: String,
    pub task: TaskDescriptor,
    #[serde(default)]
    pub history: Vec<Event>,
    pub expected: Expectation,
    /// Quality label of the expected action, if graded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl ScoredExample {
    pub fn new(id: impl Into<String>, task: TaskDescriptor, expected: Expectation) -> Self {
        Self {
            id: id.into(),
            task,
            history: Vec::new(),
            expected,
            score: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Event>) -> Self {
        self.history = history;
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// The expected action, when the label is an exact one
    pub fn demo_action(&self) -> Option<&Action> {
        match &self.expected {
            Expectation::Action(action) => Some(action),
            _ => None,
        }
    }
}

/// Load examples from a JSON array or a JSON Lines file
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<ScoredExample>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::from(e).with_context("path", path.display().to_string()))?;

    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).map_err(|e| {
            error::serialization_error(format!("invalid example array: {}", e))
                .with_context("path", path.display().to_string())
                .set_source(e)
        });
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                error::serialization_error(format!("invalid example on line {}: {}", i + 1, e))
                    .with_context("path", path.display().to_string())
                    .set_source(e)
            })
        })
        .collect()
}
