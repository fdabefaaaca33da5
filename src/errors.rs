//! Typed error taxonomy for the bridge.
//!
//! Startup errors abort with an operator-facing message; runtime errors
//! inside the message pipeline are contained and collapse into user-visible
//! reply strings (see `MessageRouter`). Admin command handlers keep the
//! precise variants (`NotFound`, `Ambiguous`, `BadArgs`) so the admin sees
//! real diagnostics.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration file not found: {path}")]
    ConfigMissing { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Sandbox image build failed: {0}")]
    ImageBuildFailed(String),

    #[error("Container operation failed: {0}")]
    ContainerOperationFailed(String),

    #[error("Claude execution timed out after {seconds}s")]
    ExecTimeout { seconds: u64 },

    #[error("Claude execution failed: {0}")]
    ExecFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("{0}")]
    RateLimited(String),

    #[error("Insufficient permission")]
    PermissionDenied,

    #[error("Message contains a blocked operation")]
    SecurityBlocked,

    #[error("No friend matches \"{0}\" (they need to send a message first)")]
    NotFound(String),

    #[error("Ambiguous name \"{query}\": {count} matches, please be more specific")]
    Ambiguous { query: String, count: usize },

    #[error("{0}")]
    BadArgs(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
