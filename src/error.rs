//! Error types for the core.

use std::io;
use thiserror::Error;

/// Boxed error for adapter seams (request builders, encryption).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced to the caller by core configuration and registration.
///
/// Everything else degrades silently: dropped writes, corrupt batches and
/// upload failures are reported through telemetry only, so the SDK never
/// breaks the host application.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A feature with the same name is already registered.
    #[error("feature \"{name}\" is already registered")]
    ConfigConflict { name: &'static str },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The core was torn down; no further operations are accepted.
    #[error("core has been torn down")]
    ShutDown,
}

/// Failure reported by an [`HttpClient`](crate::http::HttpClient) transport.
///
/// Both variants classify as retryable: the batch is kept on disk and the
/// upload delay backs off.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(#[source] BoxError),
}
