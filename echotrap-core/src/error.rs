//! Error taxonomy shared by every echotrap subsystem.
//!
//! Component-internal failures map onto one of these kinds and bubble up to
//! the surface handler, which renders them as the stable `{"error": msg}`
//! JSON shape. The DNS authority swallows `StoreWrite` on its logging path;
//! the fan-out session converts any downstream error into cleanup.

use thiserror::Error;

/// Main error type for capture-plane operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Token missing, invalid or expired, or the subdomain claim is malformed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Request body or query failed schema or grammar validation.
    #[error("{0}")]
    Validation(String),

    /// Subdomain, file, capture or share lookup came up empty.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Backing store unavailable on a read path.
    #[error("store read failed: {0}")]
    StoreRead(String),

    /// Backing store unavailable on a write path.
    #[error("store write failed: {0}")]
    StoreWrite(String),

    /// Malformed framing on a WebSocket session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A bounded read was truncated. Non-fatal for capture logging.
    #[error("read truncated: {0}")]
    Timeout(String),

    /// A bug. Propagates to the top-level handler.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Result type alias for capture-plane operations.
pub type Result<T> = std::result::Result<T, Error>;
