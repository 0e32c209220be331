//! The actcraft error value

use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// Error returned by every fallible actcraft operation.
///
/// The status starts from the kind's default and only moves towards
/// "give up" (`temporary` → `persistent`). Context pairs are appended as
/// the error travels up, so the first pair was added closest to the cause.
///
/// ```rust
/// use actcraft_error::{Error, ErrorKind};
///
/// let err = Error::new(ErrorKind::RateLimited, "provider returned 429")
///     .with_operation("provider::complete")
///     .with_context("model", "gpt-4o");
///
/// assert!(err.is_retryable());
/// assert_eq!(err.context_value("model"), Some("gpt-4o"));
/// ```
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind.is_retryable() {
            ErrorStatus::Temporary
        } else {
            ErrorStatus::Permanent
        };

        Self {
            kind,
            message: message.into(),
            status,
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Innermost-last operation name, empty when none was recorded
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// First context value recorded under `key`
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The wrapped cause, when it is itself an actcraft error
    pub fn source_error(&self) -> Option<&Error> {
        self.source.as_ref().and_then(|s| s.downcast_ref::<Error>())
    }

    pub fn temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Record the failing operation. An earlier one is kept as `called`.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Attach the underlying cause; an error carries at most one.
    pub fn set_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "source error already set");
        self.source = Some(source.into());
        self
    }

    /// Retries were spent; stop treating this as transient
    pub fn persist(mut self) -> Self {
        self.status = self.status.persist();
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

/// `operation: message (Kind, status; key=value, ...)`
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.operation.is_empty() {
            write!(f, "{}: ", self.operation)?;
        }
        write!(f, "{} ({}, {}", self.message, self.kind, self.status)?;
        for (i, (key, value)) in self.context.iter().enumerate() {
            let sep = if i == 0 { "; " } else { ", " };
            write!(f, "{}{}={}", sep, key, value)?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Error");
        out.field("kind", &self.kind)
            .field("status", &self.status)
            .field("operation", &self.operation)
            .field("message", &self.message);
        if !self.context.is_empty() {
            out.field("context", &self.context);
        }
        if let Some(source) = &self.source {
            out.field("source", source);
        }
        out.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string())
            .with_operation("io")
            .set_source(err)
    }
}

impl Error {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn task_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskInvalid, message)
    }

    /// Keeps the first 120 characters of the offending completion as `raw`
    pub fn action_parse(message: impl Into<String>, raw: &str) -> Self {
        let preview: String = raw.chars().take(120).collect();
        Self::new(ErrorKind::ActionParseFailed, message).with_context("raw", preview)
    }

    pub fn agent_step(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AgentStepFailed, message)
    }

    pub fn optimization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OptimizationFailed, message)
    }

    pub fn cancelled(operation: &'static str) -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by caller").with_operation(operation)
    }

    pub fn empty_examples() -> Self {
        Self::new(ErrorKind::EmptyExamples, "example set is empty")
    }
}
