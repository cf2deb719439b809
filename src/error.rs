//! Error types for the audio engine

use serde::Serialize;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to open {locator}: {reason}")]
    Open { locator: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Device error: {0}")]
    Device(#[from] AudioError),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an open-time error for `locator`
    pub fn open(locator: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Open {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    /// Category reported to control API callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Open { .. } => ErrorKind::Open,
            Error::Network(_) => ErrorKind::Network,
            Error::Device(_) => ErrorKind::Device,
            Error::Stream(_) => ErrorKind::Stream,
            Error::Config(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Coarse error category shared by results and stream events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    Open,
    Network,
    Device,
    Stream,
    Internal,
}

impl ErrorKind {
    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Open => "OPEN_ERROR",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Device => "DEVICE_ERROR",
            ErrorKind::Stream => "STREAM_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Output stalled for {0} ms")]
    OutputStalled(u64),
}

/// Decoder errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unrecognized container: {0}")]
    Probe(String),

    #[error("No decodable audio track")]
    NoTrack,

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Corrupted stream: {0}")]
    Corrupted(String),

    #[error("Read failed: {0}")]
    Io(String),

    #[error("Seek failed: {0}")]
    Seek(String),
}

/// Network source errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Timeout")]
    Timeout,

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if let Some(status) = err.status() {
            NetworkError::Status(status.as_u16())
        } else if err.is_connect() || err.is_request() {
            NetworkError::ConnectionFailed(err.to_string())
        } else {
            NetworkError::Client(err.to_string())
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
