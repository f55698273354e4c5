/// Result classification
///
/// Decides whether a parsed response proves a device is present. Register
/// data and exception responses are both conclusive: a unit that answers
/// with an exception understood the request. Framing failures are
/// inconclusive and cost the unit one attempt.

use serde::Serialize;

use crate::codec::ParseResult;
use crate::error::FrameError;
use crate::protocol::{exception_name, ModbusAddress, UnitId};
use crate::utils::format::register_hex;

/// Conclusive outcome for one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The unit returned at least one register; the first is kept
    Found { value: u16, hex: String },
    /// The unit answered a read with zero registers
    FoundEmpty,
    /// The unit answered with a Modbus exception
    FoundException { code: u8 },
}

impl ScanOutcome {
    /// Text used in trace lines
    pub fn describe(&self) -> String {
        match self {
            ScanOutcome::Found { value, hex } => format!("Value {} ({})", value, hex),
            ScanOutcome::FoundEmpty => "Empty Response".to_string(),
            ScanOutcome::FoundException { code } => exception_text(*code),
        }
    }
}

fn exception_text(code: u8) -> String {
    format!("Exception Code {} ({})", code, exception_name(code))
}

/// Verdict for a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Stop probing this unit
    Conclusive(ScanOutcome),
    /// Retry if attempts remain
    Inconclusive(FrameError),
}

/// Map a parsed response to a verdict
pub fn classify(parsed: ParseResult) -> Classification {
    match parsed {
        ParseResult::Registers(values) => match values.first() {
            Some(&value) => Classification::Conclusive(ScanOutcome::Found { value, hex: register_hex(value) }),
            None => Classification::Conclusive(ScanOutcome::FoundEmpty),
        },
        ParseResult::Exception(code) => Classification::Conclusive(ScanOutcome::FoundException { code }),
        ParseResult::Error(err) => Classification::Inconclusive(err),
    }
}

/// Report record for a unit that answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundDevice {
    pub unit_id: UnitId,
    pub register: ModbusAddress,
    pub value: Option<u16>,
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_code: Option<u8>,
    /// Response ADU as lowercase hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl FoundDevice {
    pub fn new(unit_id: UnitId, register: ModbusAddress, outcome: &ScanOutcome, raw: &[u8]) -> Self {
        let (value, hex_value, error, exception_code) = match outcome {
            ScanOutcome::Found { value, hex } => (Some(*value), Some(hex.clone()), None, None),
            ScanOutcome::FoundEmpty => (None, None, Some("Empty Response".to_string()), None),
            ScanOutcome::FoundException { code } => (None, None, Some(exception_text(*code)), Some(*code)),
        };
        Self {
            unit_id,
            register,
            value,
            hex: hex_value,
            error,
            exception_code,
            raw: (!raw.is_empty()).then(|| hex::encode(raw)),
        }
    }

    /// Check if the unit answered with a Modbus exception
    pub fn is_exception(&self) -> bool {
        self.exception_code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_are_found() {
        assert_eq!(
            classify(ParseResult::Registers(vec![1234, 5])),
            Classification::Conclusive(ScanOutcome::Found { value: 1234, hex: "0x04D2".into() })
        );
    }

    #[test]
    fn test_empty_registers_are_still_conclusive() {
        assert_eq!(classify(ParseResult::Registers(vec![])), Classification::Conclusive(ScanOutcome::FoundEmpty));
    }

    #[test]
    fn test_exception_is_conclusive() {
        assert_eq!(
            classify(ParseResult::Exception(0x0B)),
            Classification::Conclusive(ScanOutcome::FoundException { code: 0x0B })
        );
    }

    #[test]
    fn test_frame_errors_are_inconclusive() {
        assert_eq!(
            classify(ParseResult::Error(FrameError::EmptyPdu)),
            Classification::Inconclusive(FrameError::EmptyPdu)
        );
    }

    #[test]
    fn test_found_device_records() {
        let found = FoundDevice::new(1, 0, &ScanOutcome::Found { value: 1111, hex: "0x0457".into() }, &[0x01, 0x03]);
        assert_eq!(found.value, Some(1111));
        assert_eq!(found.hex.as_deref(), Some("0x0457"));
        assert_eq!(found.raw.as_deref(), Some("0103"));
        assert!(!found.is_exception());

        let exception = FoundDevice::new(2, 0, &ScanOutcome::FoundException { code: 2 }, &[]);
        assert_eq!(exception.value, None);
        assert_eq!(exception.error.as_deref(), Some("Exception Code 2 (Illegal Data Address)"));
        assert!(exception.is_exception());
        assert_eq!(exception.raw, None);

        let json = serde_json::to_value(&exception).unwrap();
        assert_eq!(json["value"], serde_json::Value::Null);
        assert_eq!(json["exception_code"], 2);
        assert!(json.get("raw").is_none());

        let empty = FoundDevice::new(4, 10, &ScanOutcome::FoundEmpty, &[]);
        assert_eq!(empty.error.as_deref(), Some("Empty Response"));
    }
}
