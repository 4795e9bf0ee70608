//! CRC16-CCITT for the BR Code trailer (tag 63).
//!
//! Polynomial 0x1021, initial value 0xFFFF, no final XOR. The checksum
//! is computed over the whole payload including the literal `6304`
//! length header of the CRC tag itself.

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Checks a full payload whose last 4 characters are the hex checksum.
/// BR Code payloads are ASCII; anything else can never verify and is
/// rejected before any byte-offset slicing.
pub fn verify_trailer(payload: &str) -> bool {
    if payload.len() < 8 || !payload.is_ascii() {
        return false;
    }
    let (body, trailer) = payload.split_at(payload.len() - 4);
    match u16::from_str_radix(trailer, 16) {
        Ok(expected) => crc16_ccitt(body.as_bytes()) == expected,
        Err(_) => false,
    }
}
