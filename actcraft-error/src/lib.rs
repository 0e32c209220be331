//! # actcraft-error
//!
//! Unified error handling for actcraft, modelled on OpenDAL's error practices.
//!
//! ## Design Philosophy
//!
//! - **ErrorKind**: Know what error occurred (e.g., ActionParseFailed, RateLimited)
//! - **ErrorStatus**: Decide how to handle it (Permanent, Temporary, Persistent)
//! - **Error Context**: Assist in locating the cause with rich context
//! - **Error Source**: Wrap underlying errors without leaking raw types
//!
//! ## Usage
//!
//! ```rust
//! use actcraft_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::ActionParseFailed, "no action found in completion")
//!         .with_operation("program::run")
//!         .with_context("program", "default-v1")
//!         .with_context("attempt", "2"))
//! }
//! ```
//!
//! ## Principles
//!
//! - All functions return `Result<T, actcraft_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - Same error handled once, subsequent ops only append context
//! - Don't abuse `From<OtherError>` to prevent raw error leakage

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using the actcraft Error
pub type Result<T> = std::result::Result<T, Error>;
