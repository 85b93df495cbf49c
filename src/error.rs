//! Shared error taxonomy.
//!
//! These kinds mirror the error taxonomy in the router design: transient
//! and permanent transport errors, subprocess failure, hardware removal,
//! and configuration error. Errors never cross a process boundary as
//! errors — callers at the HTTP edge log the typed error and translate it
//! into a state transition or a dropped event.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("permanent transport error: {0}")]
    PermanentTransport(String),

    #[error("subprocess failure: {0}")]
    Subprocess(String),

    #[error("hardware removed: {0}")]
    HardwareRemoved(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
