//! Defines the primary error type for the engine.

use thiserror::Error;

/// The error kinds the engine produces.
///
/// `Parse` is constructed but deliberately never returned from a public
/// contract — it is logged and discarded at the point it occurs. `Permission`
/// and `Fatal` are collected per-room during a sync pass rather than
/// propagated immediately; see [`crate::core::protected_rooms::SyncError`].
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("{0}")]
    Fatal(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("refused a self-banning operation: {0}")]
    SelfProtect(String),

    #[error("a refresh of this policy list is already in progress")]
    RefreshInProgress,

    #[error("no such watched list: {0}")]
    UnknownList(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Transport(format!("malformed JSON payload: {e}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}
