//! CRC-16 as used by the drive firmware to fingerprint drivecode.
//!
//! This is the reflected 0xA001 polynomial with an initial value of 0xffff,
//! processed a byte at a time.  It is not the same as the CRC-CCITT used
//! elsewhere in Commodore land, and every checksum in the signature tables
//! was computed with it.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

/// Initial value of a running checksum.
pub const CRC_INIT: u16 = 0xffff;

/// Fold one byte into a running checksum.
#[must_use]
pub const fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    crc ^= byte as u16;
    let mut ii = 0;
    while ii < 8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ 0xa001;
        } else {
            crc >>= 1;
        }
        ii += 1;
    }
    crc
}

/// Fold a slice into a running checksum.
#[must_use]
pub fn crc16_slice(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |crc, &b| crc16_update(crc, b))
}

/// Checksum of a slice from the initial value.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    crc16_slice(CRC_INIT, data)
}
