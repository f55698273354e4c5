/// Modbus protocol definitions shared by the codec and the scanner
///
/// Only the two read functions used for discovery are modelled; the scanner
/// never writes to a device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit/slave identifier (1-247)
pub type UnitId = u8;

/// Lowest addressable unit id
pub const MIN_UNIT_ID: UnitId = 1;

/// Highest addressable unit id
pub const MAX_UNIT_ID: UnitId = 247;

/// Function code bit set on exception responses
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Register table probed during a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers, read with function 0x03
    #[default]
    Holding,
    /// Input registers, read with function 0x04
    Input,
}

impl RegisterKind {
    /// Function code used to read this register table
    pub fn function_code(self) -> u8 {
        match self {
            RegisterKind::Holding => 0x03,
            RegisterKind::Input => 0x04,
        }
    }

    /// Convert from a read function code
    pub fn from_function_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(RegisterKind::Holding),
            0x04 => Some(RegisterKind::Input),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::Holding => "Read Holding Registers",
            RegisterKind::Input => "Read Input Registers",
        };
        write!(f, "{} (0x{:02X})", name, self.function_code())
    }
}

/// ADU encapsulation on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// MBAP header, Modbus TCP
    Mbap,
    /// Unit id + PDU + CRC16, on serial lines or tunnelled over TCP
    Rtu,
}

impl Framing {
    /// Smallest response this framing can carry
    pub fn min_response_len(self) -> usize {
        match self {
            Framing::Mbap => MBAP_HEADER_LEN,
            Framing::Rtu => 4,
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Mbap => write!(f, "MBAP"),
            Framing::Rtu => write!(f, "RTU"),
        }
    }
}

/// MBAP header including the unit id byte
pub const MBAP_HEADER_LEN: usize = 7;

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Short name as printed by most Modbus tools
    pub fn name(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Slave Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Slave Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
            ModbusException::GatewayPathUnavailable => "Gateway Path Unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => "Gateway Target Device Failed to Respond",
        }
    }
}

/// Human-readable name for any exception code, known or not
pub fn exception_name(code: u8) -> &'static str {
    ModbusException::from_u8(code).map_or("Unknown Exception", ModbusException::name)
}
