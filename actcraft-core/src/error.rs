//! Core error helpers
//!
//! Re-exports actcraft-error and provides domain-specific constructors.

pub use actcraft_error::{Error, ErrorKind, ErrorStatus, Result};

use crate::provider::ProviderError;

// =============================================================================
// Core-specific error constructors
// =============================================================================

/// Create an ActionParseFailed error
pub fn action_parse(message: impl Into<String>, raw: &str) -> Error {
    Error::action_parse(message, raw)
}

/// Create a TaskInvalid error
pub fn task_invalid(message: impl Into<String>) -> Error {
    Error::task_invalid(message)
}

/// Create a CompileFailed error
pub fn compile_failed(program: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::CompileFailed, reason).with_context("program", program)
}

/// Create an OptimizationFailed error
pub fn optimization_failed(reason: impl Into<String>) -> Error {
    Error::optimization(reason)
}

/// Create an InvalidArgument error
pub fn invalid_argument(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidArgument, message)
}

/// Create a ConfigInvalid error
pub fn config_invalid(field: &'static str, message: impl Into<String>) -> Error {
    Error::config_invalid(message).with_context("field", field)
}

/// Create an IoFailed error
pub fn io_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::IoFailed, message)
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SerializationFailed, message)
}

/// Create a VersionMismatch error
pub fn version_mismatch(found: u32, expected: u32) -> Error {
    Error::new(
        ErrorKind::VersionMismatch,
        format!("artifact format {} is not supported (expected {})", found, expected),
    )
    .with_context("found", found.to_string())
    .with_context("expected", expected.to_string())
}

/// Map a language-model boundary failure onto the unified error type.
///
/// The provider's own error is kept as the source.
pub fn provider_error(err: ProviderError) -> Error {
    let kind = match &err {
        ProviderError::Network(_) => ErrorKind::NetworkFailed,
        ProviderError::Timeout => ErrorKind::ProviderTimeout,
        ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
        ProviderError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
        ProviderError::Unavailable(_) => ErrorKind::ProviderUnavailable,
        ProviderError::InvalidRequest(_) => ErrorKind::InvalidArgument,
        ProviderError::Api { .. } | ProviderError::Parse(_) | ProviderError::Other(_) => {
            ErrorKind::ProviderFailed
        }
    };

    let mut error = Error::new(kind, err.to_string());
    error = if err.is_retryable() {
        error.temporary()
    } else {
        error.permanent()
    };
    if let ProviderError::RateLimited { retry_after: Some(secs) } = &err {
        error = error.with_context("retry_after_secs", secs.to_string());
    }
    error.with_operation("provider::complete").set_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_mapping() {
        let err = provider_error(ProviderError::RateLimited { retry_after: Some(7) });
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.is_retryable());
        assert_eq!(err.context_value("retry_after_secs"), Some("7"));

        let err = provider_error(ProviderError::AuthenticationFailed);
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(!err.is_retryable());

        let err = provider_error(ProviderError::Api { status: 400, message: "bad".into() });
        assert_eq!(err.kind(), ErrorKind::ProviderFailed);
        assert!(!err.is_retryable());

        let err = provider_error(ProviderError::Api { status: 503, message: "busy".into() });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_version_mismatch() {
        let err = version_mismatch(9, 1);
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert_eq!(err.context_value("found"), Some("9"));
    }
}
