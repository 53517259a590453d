//! Error types for the call core.

use thiserror::Error;

/// Error taxonomy for a voice call.
///
/// `PermissionDenied` and `SessionOpenFailure` are fatal to call start;
/// `SessionRuntime` is fatal to the current call. A graceful remote close is
/// not an error and never appears here.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    #[error("failed to open session: {0}")]
    SessionOpenFailure(String),

    #[error("session transport error: {0}")]
    SessionRuntime(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("timed out waiting for session setup")]
    Timeout,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CallError>;
