//! Error types for the voice chat client

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Read failed: {0}")]
    Read(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Socket closed")]
    SocketClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Cannot resolve address: {0}")]
    AddressResolution(String),
}

/// Rendezvous service errors
#[derive(Error, Debug)]
pub enum RendezvousError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(u32),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Errors that abort a session before its components start
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Join rejected by server: {0}")]
    JoinRejected(String),

    #[error("Join cancelled")]
    JoinCancelled,

    #[error("No join acknowledgement after {0} attempts")]
    JoinAttemptsExhausted(u32),

    #[error("Clock synchronization failed: {0}")]
    ClockSync(String),

    #[error("Own entry missing from channel roster")]
    NotInRoster,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
