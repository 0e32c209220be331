//! Error kinds for actcraft operations

use std::fmt;

/// The kind of error that occurred.
///
/// This enum categorizes errors to help users write clear error handling logic.
/// The agent loop matches on ErrorKind to decide between local retry,
/// backoff, and surfacing the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// Invalid configuration or parameters
    ConfigInvalid,

    /// Invalid argument passed to function
    InvalidArgument,

    // =========================================================================
    // Task / action errors
    // =========================================================================
    /// Task descriptor is malformed (e.g. blank instruction)
    TaskInvalid,

    /// Completion text could not be mapped to a well-formed action
    ActionParseFailed,

    // =========================================================================
    // Language-model provider errors
    // =========================================================================
    /// Provider call failed (API error, empty response)
    ProviderFailed,

    /// Provider call timed out
    ProviderTimeout,

    /// Provider not available
    ProviderUnavailable,

    /// Rate limit exceeded
    RateLimited,

    /// Credentials rejected by the provider
    AuthenticationFailed,

    // =========================================================================
    // Agent loop errors
    // =========================================================================
    /// A step failed after exhausting its retries
    AgentStepFailed,

    /// The agent already emitted a terminal action
    AgentTerminated,

    /// The step was cancelled by the caller
    Cancelled,

    // =========================================================================
    // Program / optimization errors
    // =========================================================================
    /// Compilation was given no examples
    EmptyExamples,

    /// Compilation could not produce a program
    CompileFailed,

    /// Optimization run failed; serving program unchanged
    OptimizationFailed,

    // =========================================================================
    // Storage errors
    // =========================================================================
    /// Serialization/deserialization failed
    SerializationFailed,

    /// Persisted artifact was written with an unknown format version
    VersionMismatch,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    /// Network error
    NetworkFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::InvalidArgument => "InvalidArgument",

            // Task / action
            ErrorKind::TaskInvalid => "TaskInvalid",
            ErrorKind::ActionParseFailed => "ActionParseFailed",

            // Provider
            ErrorKind::ProviderFailed => "ProviderFailed",
            ErrorKind::ProviderTimeout => "ProviderTimeout",
            ErrorKind::ProviderUnavailable => "ProviderUnavailable",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::AuthenticationFailed => "AuthenticationFailed",

            // Agent
            ErrorKind::AgentStepFailed => "AgentStepFailed",
            ErrorKind::AgentTerminated => "AgentTerminated",
            ErrorKind::Cancelled => "Cancelled",

            // Program / optimization
            ErrorKind::EmptyExamples => "EmptyExamples",
            ErrorKind::CompileFailed => "CompileFailed",
            ErrorKind::OptimizationFailed => "OptimizationFailed",

            // Storage
            ErrorKind::SerializationFailed => "SerializationFailed",
            ErrorKind::VersionMismatch => "VersionMismatch",

            // IO
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::NetworkFailed => "NetworkFailed",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ActionParseFailed
                | ErrorKind::ProviderFailed
                | ErrorKind::ProviderTimeout
                | ErrorKind::ProviderUnavailable
                | ErrorKind::RateLimited
                | ErrorKind::NetworkFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
