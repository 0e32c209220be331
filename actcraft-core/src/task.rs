//! Task descriptors

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the agent is asked to accomplish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default)]
    pub id: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// A fresh task with no id, as issued at the start of a session
    pub fn start(instruction: impl Into<String>) -> Self {
        Self::new("", instruction)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Structural check; a blank instruction is rejected
    pub fn validate(&self) -> Result<()> {
        if self.instruction.trim().is_empty() {
            return Err(error::task_invalid("task instruction is blank")
                .with_context("task_id", self.id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_validate() {
        assert!(TaskDescriptor::start("fix the failing test").validate().is_ok());

        let err = TaskDescriptor::new("t-1", "   ").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskInvalid);
        assert_eq!(err.context_value("task_id"), Some("t-1"));
    }

    #[test]
    fn test_deserialize_minimal() {
        let task: TaskDescriptor = serde_json::from_str(r#"{"instruction": "list files"}"#).unwrap();
        assert_eq!(task.id, "");
        assert!(task.metadata.is_empty());
    }
}
