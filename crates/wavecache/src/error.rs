//! Render error types

use thiserror::Error;

/// Errors that can surface from a render request.
///
/// Degenerate input (empty channels, zero width) is guarded inside the
/// decimation engine and produces minimal output rather than an error, and
/// worker-pool oversubscription queues rather than failing, so the only
/// failures a caller sees come from the worker reply path.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A worker reply does not structurally match a render envelope
    #[error("worker reply does not match render data shape: {0}")]
    Shape(String),

    /// The worker or its channel failed before delivering a reply
    #[error("worker transport failed: {0}")]
    Transport(String),
}

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;
