//! # Frame Codec
//!
//! Builds and parses Modbus ADUs without a client library. Modbus TCP and
//! RTU share the same PDU and differ only in encapsulation:
//!
//! ```text
//! MBAP: [tx id:u16][proto=0:u16][length:u16][unit][ PDU ]
//! RTU:  [unit][ PDU ][crc:u16 little-endian]
//! ```
//!
//! All multi-byte fields are big-endian except the RTU checksum.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::{crc16_modbus, crc16_modbus_bytes};
use crate::error::FrameError;
use crate::protocol::{Framing, ModbusAddress, UnitId, EXCEPTION_FLAG, MBAP_HEADER_LEN};

/// Decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Register values from a read response
    Registers(Vec<u16>),
    /// Exception code from a response with the high function bit set
    Exception(u8),
    /// The response could not be decoded
    Error(FrameError),
}

/// Build a read request ADU
///
/// `transaction_id` is only encoded for MBAP framing.
pub fn build_request(
    framing: Framing,
    unit_id: UnitId,
    function_code: u8,
    start_address: ModbusAddress,
    count: u16,
    transaction_id: u16,
) -> Bytes {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(function_code);
    pdu.put_u16(start_address);
    pdu.put_u16(count);
    encapsulate(framing, unit_id, &pdu, transaction_id)
}

/// Build a register read response ADU
pub fn build_register_response(
    framing: Framing,
    unit_id: UnitId,
    function_code: u8,
    values: &[u16],
    transaction_id: u16,
) -> Bytes {
    let mut pdu = BytesMut::with_capacity(2 + values.len() * 2);
    pdu.put_u8(function_code);
    pdu.put_u8((values.len() * 2) as u8);
    for &value in values {
        pdu.put_u16(value);
    }
    encapsulate(framing, unit_id, &pdu, transaction_id)
}

/// Build an exception response ADU for a request with `function_code`
pub fn build_exception_response(
    framing: Framing,
    unit_id: UnitId,
    function_code: u8,
    exception_code: u8,
    transaction_id: u16,
) -> Bytes {
    let pdu = [function_code | EXCEPTION_FLAG, exception_code];
    encapsulate(framing, unit_id, &pdu, transaction_id)
}

fn encapsulate(framing: Framing, unit_id: UnitId, pdu: &[u8], transaction_id: u16) -> Bytes {
    match framing {
        Framing::Mbap => {
            let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
            frame.put_u16(transaction_id);
            frame.put_u16(0); // protocol id
            frame.put_u16((1 + pdu.len()) as u16); // unit id + PDU
            frame.put_u8(unit_id);
            frame.put_slice(pdu);
            frame.freeze()
        }
        Framing::Rtu => {
            let mut frame = BytesMut::with_capacity(1 + pdu.len() + 2);
            frame.put_u8(unit_id);
            frame.put_slice(pdu);
            let crc = crc16_modbus_bytes(&frame);
            frame.put_slice(&crc);
            frame.freeze()
        }
    }
}

/// Parse a response ADU addressed to `expected_unit`
pub fn parse_response(framing: Framing, raw: &[u8], expected_unit: UnitId) -> ParseResult {
    match split_pdu(framing, raw, expected_unit) {
        Ok(pdu) => decode_pdu(pdu),
        Err(err) => ParseResult::Error(err),
    }
}

/// Strip the encapsulation and check addressing
fn split_pdu(framing: Framing, raw: &[u8], expected_unit: UnitId) -> Result<&[u8], FrameError> {
    if raw.len() < framing.min_response_len() {
        return Err(FrameError::TooShort { framing, len: raw.len() });
    }

    let (unit_id, pdu) = match framing {
        Framing::Mbap => (raw[6], &raw[MBAP_HEADER_LEN..]),
        Framing::Rtu => {
            let (payload, crc) = raw.split_at(raw.len() - 2);
            let actual = u16::from_le_bytes([crc[0], crc[1]]);
            let expected = crc16_modbus(payload);
            if actual != expected {
                return Err(FrameError::CrcMismatch { expected, actual });
            }
            (payload[0], &payload[1..])
        }
    };

    if unit_id != expected_unit {
        return Err(FrameError::UnitIdMismatch { expected: expected_unit, actual: unit_id });
    }
    Ok(pdu)
}

fn decode_pdu(pdu: &[u8]) -> ParseResult {
    let Some(&function_code) = pdu.first() else {
        return ParseResult::Error(FrameError::EmptyPdu);
    };

    if function_code >= EXCEPTION_FLAG {
        return ParseResult::Exception(pdu.get(1).copied().unwrap_or(0));
    }

    if pdu.len() < 2 {
        return ParseResult::Error(FrameError::PduTooShort);
    }

    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if data.len() != byte_count {
        return ParseResult::Error(FrameError::ByteCountMismatch {
            expected: byte_count,
            actual: data.len(),
        });
    }

    // an odd trailing byte cannot form a register and is ignored
    let registers = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    ParseResult::Registers(registers)
}

/// Bytes left to read after `[unit][function]` of an RTU response
///
/// Exception: code + CRC. Success for a single register: byte count, two
/// data bytes and CRC.
pub fn expected_rtu_remainder(function_code: u8) -> usize {
    if function_code >= EXCEPTION_FLAG {
        3
    } else {
        5
    }
}
