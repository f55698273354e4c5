//! # Scan Error Handling
//!
//! Errors are split by how far they are allowed to travel:
//!
//! - [`ScanError`] is the only error a caller ever sees. It covers invalid
//!   configuration, the scan-level connection check, cancellation and
//!   internal worker failures.
//! - [`AttemptError`] describes why a single request/response exchange
//!   produced nothing usable. It is consumed by the orchestrator (traced and
//!   retried) and never escapes a scan.
//! - [`FrameError`] is the framing/PDU failure reported by the codec inside
//!   [`ParseResult::Error`](crate::codec::ParseResult::Error).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use voltage_modbus_scan::{ScanError, ScanRequest, Scanner};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let request = ScanRequest::tcp("192.168.1.50", 502).with_units(1, 10);
//! match Scanner::new(request)?.scan().await {
//!     Ok(report) => println!("found {} device(s)", report.count),
//!     Err(ScanError::ConnectionFailed { cause, .. }) => println!("gateway unreachable: {}", cause),
//!     Err(error) => println!("scan failed: {}", error),
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::Framing;
use crate::utils::format::format_duration;

/// Result type alias for scan operations
pub type ScanResult<T> = Result<T, ScanError>;

/// Caller-visible scan errors
///
/// Per-unit failures are handled inside the scan; a unit that never answers
/// is simply absent from the report.
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    /// The scan request failed validation or could not be loaded
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No connection could be opened before scanning started
    ///
    /// Checked once, eagerly, before any unit is attempted. Connection churn
    /// during the scan is retried per unit instead.
    #[error("Connection Failed: {cause} ({detail})")]
    ConnectionFailed { cause: ConnectFailure, detail: String },

    /// The scan was aborted by its caller or by its overall deadline
    #[error("Scan cancelled: {reason}")]
    Cancelled { reason: String },

    /// I/O errors outside of a unit exchange (configuration files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Internal errors (worker panics, closed channels)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScanError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a scan-level connection failure
    pub fn connection_failed<S: Into<String>>(cause: ConnectFailure, detail: S) -> Self {
        Self::ConnectionFailed { cause, detail: detail.into() }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self::Cancelled { reason: reason.into() }
    }

    /// Create the cancellation raised when the overall scan deadline passes
    pub fn deadline_exceeded(limit: Duration) -> Self {
        Self::cancelled(format!("scan deadline of {} exceeded", format_duration(limit)))
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if running the same scan again might succeed
    ///
    /// Connection failures and cancellations depend on the environment;
    /// configuration errors will fail identically every time.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Cancelled { .. } | Self::Io { .. })
    }
}

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        Self::Io { message: err.to_string() }
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ScanError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

/// Specific cause of a failed connection attempt
///
/// Surfaced in trace lines so a user can tell a dead gateway from a typo in
/// the host name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    /// No answer to the connection attempt within the per-attempt timeout
    Timeout,
    /// The remote end actively refused the connection
    Refused,
    /// The host name did not resolve
    NameResolution,
    /// No route to the host or network
    NoRoute,
    /// Serial port could not be opened, or any other OS error
    Other(String),
}

impl ConnectFailure {
    /// Classify an OS error raised by `connect`
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => Self::NoRoute,
            _ => Self::Other(err.to_string()),
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::Refused => write!(f, "Connection Refused"),
            Self::NameResolution => write!(f, "Name Resolution Failed"),
            Self::NoRoute => write!(f, "No Route to Host"),
            Self::Other(message) => write!(f, "{}", message),
        }
    }
}

/// Why a single exchange with one unit produced nothing usable
///
/// Every variant is inconclusive: the orchestrator traces it and spends the
/// next attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// Opening the connection failed
    #[error("Connect - {cause}")]
    Connect { cause: ConnectFailure },

    /// The response did not arrive within the remaining time budget
    #[error("Timeout")]
    Timeout { after: Duration },

    /// The peer closed the connection mid-exchange
    #[error("Connection closed")]
    Closed,

    /// Socket or serial I/O failure
    #[error("I/O - {message}")]
    Io { message: String },

    /// Serial read returned less than a minimal RTU frame
    #[error("No data ({received} bytes)")]
    NoData { received: usize },

    /// The response arrived but could not be decoded
    #[error("{0}")]
    Frame(#[from] FrameError),
}

impl AttemptError {
    /// Create a new I/O attempt error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a timeout error
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Check if the link is unusable after this error
    ///
    /// Decode failures leave the connection in place; every other variant
    /// means the socket or port must be discarded or reset.
    pub fn is_transport_error(&self) -> bool {
        !matches!(self, Self::Frame(_))
    }
}

impl From<io::Error> for AttemptError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout { after: Duration::ZERO },
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::io(err.to_string()),
        }
    }
}

/// Framing and PDU decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest valid frame for this framing
    #[error("Response too short ({framing})")]
    TooShort { framing: Framing, len: usize },

    /// RTU checksum mismatch
    #[error("CRC Error")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The response came from a different unit
    #[error("Unit ID mismatch (Expected {expected}, got {actual})")]
    UnitIdMismatch { expected: u8, actual: u8 },

    /// No PDU after the addressing fields
    #[error("Empty PDU")]
    EmptyPdu,

    /// Function code present but no byte count
    #[error("PDU too short")]
    PduTooShort,

    /// Byte count field disagrees with the payload length
    #[error("Byte count mismatch (Expected {expected}, got {actual})")]
    ByteCountMismatch { expected: usize, actual: usize },
}

impl FrameError {
    /// Short machine-readable kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TooShort { .. } => "too-short",
            Self::CrcMismatch { .. } => "crc-mismatch",
            Self::UnitIdMismatch { .. } => "unit-id-mismatch",
            Self::EmptyPdu => "empty-pdu",
            Self::PduTooShort => "pdu-too-short",
            Self::ByteCountMismatch { .. } => "byte-count-mismatch",
        }
    }
}
