/// CRC-16/MODBUS checksum used by RTU framing
///
/// Seed 0xFFFF, reflected polynomial 0xA001. The checksum is appended to a
/// frame low byte first, unlike every other multi-byte Modbus field.

use ::crc::{Crc, CRC_16_MODBUS};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC of `data`
pub fn crc16_modbus(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Compute the Modbus CRC of `data` in wire order (low byte first)
pub fn crc16_modbus_bytes(data: &[u8]) -> [u8; 2] {
    crc16_modbus(data).to_le_bytes()
}

/// Check a frame whose last two bytes are its CRC
pub fn verify_trailing_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (payload, received) = frame.split_at(frame.len() - 2);
    crc16_modbus_bytes(payload) == [received[0], received[1]]
}
