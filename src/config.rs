//! # Scan Configuration
//!
//! A [`ScanRequest`] is built once per scan, validated, and then shared
//! read-only by every strategy. It can be assembled in code with the builder
//! methods or loaded from YAML/JSON:
//!
//! ```yaml
//! transport:
//!   type: tcp
//!   host: 192.168.1.50
//!   port: 502
//!   rtu_over_tcp: false
//! start_unit: 1
//! end_unit: 32
//! register: 0
//! register_kind: holding
//! timeout: 0.5
//! retries: 1
//! concurrency: 8
//! ```
//!
//! Durations are written in seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};
use crate::protocol::{Framing, ModbusAddress, RegisterKind, UnitId, MAX_UNIT_ID, MIN_UNIT_ID};
use crate::utils::validation;
use crate::DEFAULT_TCP_PORT;

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default serial baud rate
pub const DEFAULT_BAUDRATE: u32 = 9600;

/// Default serial data bits
pub const DEFAULT_BYTESIZE: u8 = 8;

/// Default serial parity
pub const DEFAULT_PARITY: char = 'N';

/// Default serial stop bits
pub const DEFAULT_STOPBITS: u8 = 1;

/// Where and how to reach the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Modbus TCP gateway, optionally tunnelling RTU frames
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default)]
        rtu_over_tcp: bool,
    },
    /// RTU over a local serial port
    Serial {
        port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        #[serde(default = "default_parity")]
        parity: char,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
        #[serde(default = "default_bytesize")]
        bytesize: u8,
    },
}

impl TransportConfig {
    /// Wire encapsulation implied by this transport
    pub fn framing(&self) -> Framing {
        match self {
            TransportConfig::Tcp { rtu_over_tcp: false, .. } => Framing::Mbap,
            TransportConfig::Tcp { rtu_over_tcp: true, .. } | TransportConfig::Serial { .. } => Framing::Rtu,
        }
    }

    /// Check if this is a serial transport
    pub fn is_serial(&self) -> bool {
        matches!(self, TransportConfig::Serial { .. })
    }

    /// Short description for trace lines
    pub fn describe(&self) -> String {
        match self {
            TransportConfig::Tcp { host, port, rtu_over_tcp } => {
                let mode = if *rtu_over_tcp { "RTU over TCP" } else { "Modbus TCP" };
                format!("{}:{} ({})", host, port, mode)
            }
            TransportConfig::Serial { port, baudrate, parity, stopbits, bytesize } => {
                format!("{} {} {}{}{}", port, baudrate, bytesize, parity, stopbits)
            }
        }
    }
}

/// Immutable description of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub transport: TransportConfig,
    #[serde(default = "default_start_unit")]
    pub start_unit: UnitId,
    #[serde(default = "default_end_unit")]
    pub end_unit: UnitId,
    #[serde(default)]
    pub register: ModbusAddress,
    #[serde(default)]
    pub register_kind: RegisterKind,
    /// Per-attempt timeout
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    /// Extra attempts after the first one
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Units probed in parallel; TCP only
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Hard limit on the whole scan
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub scan_deadline: Option<Duration>,
}

impl ScanRequest {
    /// Scan over Modbus TCP with defaults for everything else
    pub fn tcp<S: Into<String>>(host: S, port: u16) -> Self {
        Self::with_transport(TransportConfig::Tcp { host: host.into(), port, rtu_over_tcp: false })
    }

    /// Scan over RTU-over-TCP
    pub fn rtu_over_tcp<S: Into<String>>(host: S, port: u16) -> Self {
        Self::with_transport(TransportConfig::Tcp { host: host.into(), port, rtu_over_tcp: true })
    }

    /// Scan a serial port at `baudrate`, 8N1
    pub fn serial<S: Into<String>>(port: S, baudrate: u32) -> Self {
        Self::with_transport(TransportConfig::Serial {
            port: port.into(),
            baudrate,
            parity: DEFAULT_PARITY,
            stopbits: DEFAULT_STOPBITS,
            bytesize: DEFAULT_BYTESIZE,
        })
    }

    /// Scan with an explicit transport and default parameters
    pub fn with_transport(transport: TransportConfig) -> Self {
        Self {
            transport,
            start_unit: default_start_unit(),
            end_unit: default_end_unit(),
            register: 0,
            register_kind: RegisterKind::default(),
            timeout: DEFAULT_TIMEOUT,
            retries: default_retries(),
            concurrency: default_concurrency(),
            scan_deadline: None,
        }
    }

    pub fn with_units(mut self, start_unit: UnitId, end_unit: UnitId) -> Self {
        self.start_unit = start_unit;
        self.end_unit = end_unit;
        self
    }

    pub fn with_register(mut self, register: ModbusAddress, kind: RegisterKind) -> Self {
        self.register = register;
        self.register_kind = kind;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_scan_deadline(mut self, deadline: Duration) -> Self {
        self.scan_deadline = Some(deadline);
        self
    }

    /// Total attempts per unit
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Unit ids in scan order
    pub fn units(&self) -> std::ops::RangeInclusive<UnitId> {
        self.start_unit..=self.end_unit
    }

    /// Number of unit ids in the range
    pub fn unit_count(&self) -> usize {
        self.units().count()
    }

    /// Wire encapsulation for this scan
    pub fn framing(&self) -> Framing {
        self.transport.framing()
    }

    /// Check every field against protocol and transport limits
    pub fn validate(&self) -> ScanResult<()> {
        validation::validate_unit_id(self.start_unit)?;
        validation::validate_unit_id(self.end_unit)?;
        if self.start_unit > self.end_unit {
            return Err(ScanError::configuration(format!(
                "Invalid unit range: {}-{} (start must not exceed end)",
                self.start_unit, self.end_unit
            )));
        }
        if self.timeout.is_zero() {
            return Err(ScanError::configuration("Timeout must be greater than zero"));
        }
        if self.concurrency == 0 {
            return Err(ScanError::configuration("Concurrency must be at least 1"));
        }
        if matches!(self.scan_deadline, Some(deadline) if deadline.is_zero()) {
            return Err(ScanError::configuration("Scan deadline must be greater than zero"));
        }

        match &self.transport {
            TransportConfig::Tcp { host, port, .. } => {
                if host.trim().is_empty() {
                    return Err(ScanError::configuration("TCP host must not be empty"));
                }
                if *port == 0 {
                    return Err(ScanError::configuration("TCP port must not be 0"));
                }
            }
            TransportConfig::Serial { port, baudrate, parity, stopbits, bytesize } => {
                if port.trim().is_empty() {
                    return Err(ScanError::configuration("Serial port must not be empty"));
                }
                if *baudrate == 0 {
                    return Err(ScanError::configuration("Baud rate must not be 0"));
                }
                if !matches!(parity.to_ascii_uppercase(), 'N' | 'E' | 'O') {
                    return Err(ScanError::configuration(format!(
                        "Unsupported parity '{}' (expected N, E or O)",
                        parity
                    )));
                }
                if !matches!(stopbits, 1 | 2) {
                    return Err(ScanError::configuration(format!("Unsupported stop bits: {}", stopbits)));
                }
                if !(5..=8).contains(bytesize) {
                    return Err(ScanError::configuration(format!("Unsupported byte size: {}", bytesize)));
                }
            }
        }
        Ok(())
    }

    /// Parse and validate a YAML scan description
    pub fn from_yaml_str(source: &str) -> ScanResult<Self> {
        let request: Self = serde_yaml::from_str(source)?;
        request.validate()?;
        Ok(request)
    }

    /// Parse and validate a JSON scan description
    pub fn from_json_str(source: &str) -> ScanResult<Self> {
        let request: Self = serde_json::from_str(source)?;
        request.validate()?;
        Ok(request)
    }

    /// Load a scan description, choosing the format by file extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&source),
            other => Err(ScanError::configuration(format!(
                "Unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_parity() -> char {
    DEFAULT_PARITY
}

fn default_stopbits() -> u8 {
    DEFAULT_STOPBITS
}

fn default_bytesize() -> u8 {
    DEFAULT_BYTESIZE
}

fn default_start_unit() -> UnitId {
    MIN_UNIT_ID
}

fn default_end_unit() -> UnitId {
    MAX_UNIT_ID
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_retries() -> u32 {
    1
}

fn default_concurrency() -> usize {
    1
}

/// Durations as floating point seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
