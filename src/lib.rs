//! # Voltage Modbus Scan - Modbus Unit Discovery
//!
//! Finds which unit ids answer on a Modbus RTU bus or behind a Modbus TCP
//! gateway. Requests are framed in-crate (no Modbus client library), every
//! exchange runs under a per-attempt timeout, failed units are retried a
//! bounded number of times, and TCP scans can probe several units at once.
//!
//! ## Features
//!
//! - **Three encapsulations**: Modbus TCP (MBAP), RTU over serial, RTU tunnelled over TCP
//! - **Bounded scans**: deadline-aware reads, retry limit, optional overall scan deadline
//! - **Concurrency**: up to N units in flight over TCP, results always ordered by unit id
//! - **Live output**: trace lines and found devices streamed over channels while scanning
//! - **Cancellation**: abort with a `CancellationToken`; sockets and ports are closed before return
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_modbus_scan::{ScanRequest, ScanResult, Scanner};
//!
//! #[tokio::main]
//! async fn main() -> ScanResult<()> {
//!     let request = ScanRequest::tcp("192.168.1.50", 502)
//!         .with_units(1, 32)
//!         .with_timeout(Duration::from_millis(500))
//!         .with_retries(1);
//!
//!     let report = Scanner::new(request)?.scan().await?;
//!     for device in &report.found_devices {
//!         match device.value {
//!             Some(value) => println!("unit {}: {}", device.unit_id, value),
//!             None => println!("unit {}: {}", device.unit_id, device.error.as_deref().unwrap_or("")),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Scanner                    │
//! │  strategy · retries · cancellation      │
//! └─────────────────────────────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  TCP sessions   │    │  Serial session │
//! │  (async I/O)    │    │  (blocking)     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────────────────────────────┐
//! │     Codec (MBAP / RTU) · CRC16          │
//! └─────────────────────────────────────────┘
//!          │
//! ┌─────────────────────────────────────────┐
//! │     Classifier → FoundDevice            │
//! └─────────────────────────────────────────┘
//! ```

/// Scan, attempt and framing error types
pub mod error;

/// Modbus protocol constants and shared types
pub mod protocol;

/// CRC-16/MODBUS
pub mod crc;

/// Request and response ADU framing
pub mod codec;

/// Scan request configuration
pub mod config;

/// Response classification
pub mod classify;

/// TCP transport sessions
pub mod transport;

/// Serial RTU transport
pub mod serial;

/// Scan orchestration
pub mod scanner;

/// Modbus gateway simulator
pub mod simulator;

/// Trace log and result channel
pub mod trace;

/// Formatting and validation helpers
pub mod utils;

// Re-export main types for convenience
pub use classify::{classify, Classification, FoundDevice, ScanOutcome};
pub use codec::{build_request, parse_response, ParseResult};
pub use config::{ScanRequest, TransportConfig, DEFAULT_TIMEOUT};
pub use error::{AttemptError, ConnectFailure, FrameError, ScanError, ScanResult};
pub use protocol::{Framing, ModbusAddress, RegisterKind, UnitId};
pub use scanner::{PortHandoff, ScanReport, Scanner, Strategy};
pub use simulator::{GatewaySimulator, UnitProfile};
pub use transport::{TransportSession, TransportStats};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Scan v{} - Modbus TCP/RTU unit discovery", VERSION)
}

/// Validate `request` and run one scan with no live channels
pub async fn scan(request: ScanRequest) -> ScanResult<ScanReport> {
    Scanner::new(request)?.scan().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info() {
        let info = info();
        assert!(info.contains("Voltage Modbus Scan"));
        assert!(info.contains(VERSION));
    }

    #[test]
    fn test_requests_start_with_default_timeout() {
        assert_eq!(DEFAULT_TIMEOUT, std::time::Duration::from_secs(3));
        assert_eq!(ScanRequest::tcp("gw", DEFAULT_TCP_PORT).timeout, DEFAULT_TIMEOUT);
        assert_eq!(ScanRequest::serial("/dev/ttyUSB0", 9600).timeout, DEFAULT_TIMEOUT);
    }
}
