//! Error types for the supervisor and the worker.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::codec::CodecError;

/// Errors surfaced to the host application by the supervisor.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("WebRTC worker is not running")]
    NotRunning,

    #[error("Failed to launch WebRTC worker: {0}")]
    Launch(String),

    #[error("WebRTC worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("WebRTC worker failed to start: {0}")]
    StartupFailed(String),

    #[error("Timed out after {timeout:?} waiting for {command} response")]
    CommandTimeout {
        command: &'static str,
        timeout: Duration,
    },

    #[error("{0}")]
    Worker(String),

    #[error("WebRTC service was stopped")]
    Stopped,

    #[error("WebRTC worker channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame from WebRTC worker: {0}")]
    Codec(#[from] CodecError),
}

/// Command-level failures inside the worker. The `Display` text is what the
/// supervisor receives in an `error` message.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker not initialized")]
    NotInitialized,

    #[error("TELNYX_API_KEY is not configured")]
    MissingApiKey,

    #[error("Call {0} not found")]
    CallNotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Failures talking to the telephony provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Telnyx API error: {status} {body}")]
    Http { status: u16, body: String },

    #[error("Telnyx request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid Telnyx response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
