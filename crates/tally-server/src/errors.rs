//! Server error types.

use thiserror::Error;

/// Errors raised while starting or running the HTTP listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not bind to the configured address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The accept loop terminated with an I/O error.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}
