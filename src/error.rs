//! Error types for the Tor launcher.
//!
//! [`TorLauncherError`] covers configuration, control-port and process
//! failures. [`HandshakeError`] describes why the handshake files written by
//! the daemon could not be used yet; it is always recoverable.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for all launcher and control operations.
#[derive(Error, Debug)]
pub enum TorLauncherError {
    /// I/O error occurred during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection to the control port failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication with the daemon failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command was rejected by the daemon.
    #[error("Command rejected (code {code}): {message}")]
    CommandRejected {
        /// The status code returned by the daemon.
        code: u16,
        /// The human-readable error message.
        message: String,
    },

    /// Protocol error - unexpected response format.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Parsing error when interpreting a reply.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Missing or invalid launch configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The connection was closed before the reply arrived.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The operation was abandoned because the client or supervisor was stopped.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handshake files were not usable.
    #[error("Handshake not ready: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, TorLauncherError>;

/// Why a handshake file could not be turned into a credential.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The file does not exist yet.
    #[error("{} does not exist", path.display())]
    Missing {
        /// Path that was probed.
        path: PathBuf,
    },

    /// The path exists but is not a regular file.
    #[error("{} is not a regular file", path.display())]
    NotAFile {
        /// Path that was probed.
        path: PathBuf,
    },

    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Unreadable {
        /// Path that was probed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The cookie file does not hold exactly 32 bytes.
    #[error("cookie has invalid length {0} (expected 32)")]
    CookieLength(u64),

    /// The port file does not match `PORT=<host>:<port>`.
    #[error("malformed port file: {0}")]
    Malformed(String),

    /// The port file names a host that is not a loopback address.
    #[error("control port host {0} is not a loopback address")]
    NotLoopback(String),

    /// The port number parsed but is outside 1-65535.
    #[error("control port {0} is out of range")]
    PortOutOfRange(u32),

    /// The port number does not fit the integer parse.
    #[error("control port overflows")]
    PortOverflow,

    /// The port line has no terminating newline.
    #[error("port file is truncated")]
    Truncated,

    /// The file predates the current daemon launch.
    #[error("{} predates the current launch", path.display())]
    Stale {
        /// Path that was probed.
        path: PathBuf,
    },
}

impl HandshakeError {
    /// Port value a caller holding `previous` should keep after a failed
    /// port extraction.
    ///
    /// An overflowing number always reports `Some(65536)`. A truncated line
    /// reports `Some(0)` when no port was known yet. Every other failure
    /// leaves `previous` untouched.
    pub fn reported_port(&self, previous: Option<u32>) -> Option<u32> {
        match self {
            HandshakeError::PortOverflow => Some(65536),
            HandshakeError::Truncated => previous.or(Some(0)),
            _ => previous,
        }
    }
}

/// Reply status codes the launcher distinguishes; everything else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 250 - OK
    Ok = 250,
    /// 251 - Operation was unnecessary
    OperationUnnecessary = 251,
    /// 510 - Unrecognized command
    UnrecognizedCommand = 510,
    /// 514 - Authentication required
    AuthenticationRequired = 514,
    /// 515 - Bad authentication
    BadAuthentication = 515,
    /// 552 - Unrecognized entity
    UnrecognizedEntity = 552,
    /// 650 - Asynchronous event notification
    AsyncEvent = 650,
    /// Unknown status code
    Unknown = 0,
}

impl StatusCode {
    /// Parse a status code from a u16 value.
    pub fn from_u16(code: u16) -> Self {
        match code {
            250 => StatusCode::Ok,
            251 => StatusCode::OperationUnnecessary,
            510 => StatusCode::UnrecognizedCommand,
            514 => StatusCode::AuthenticationRequired,
            515 => StatusCode::BadAuthentication,
            552 => StatusCode::UnrecognizedEntity,
            650 => StatusCode::AsyncEvent,
            _ => StatusCode::Unknown,
        }
    }

    /// Check if this status code indicates success.
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::OperationUnnecessary)
    }

    /// Get the numeric value of this status code.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}
