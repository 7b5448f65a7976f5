//! Per-production hacks, keyed by checksum.
//!
//! Some productions need the drive to slow down between blocks of a
//! particular file, usually because the host is busy decrunching and the
//! loader can't say so.  The file is identified by the checksum of the file
//! loaded before it, which is known before the transfer starts.
//!
//! The same "scan a static table for a checksum" pattern is used by the
//! detection tables, so the scan itself lives here too.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

/// A block delay for the file following the one with checksum `crc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Quirk {
    pub crc: u16,
    pub delay_ms: u8,
}

impl Quirk {
    pub const fn new(crc: u16, delay_ms: u8) -> Self {
        Self { crc, delay_ms }
    }
}

/// Krill's loader.  Applied in 20ms steps.
pub static KRILL_QUIRKS: &[Quirk] = &[
    Quirk::new(0x1ba6, 20),  // coma light 13, "SAMPLE"
    Quirk::new(0xe5ac, 80),  // coma light 13, "PICDAT"
    Quirk::new(0xfe43, 80),  // protogeo 100%, 13th file
    Quirk::new(0x7f19, 120), // pearls for pigs, "03"
    Quirk::new(0x8e1e, 20),  // cause of death, "PLOTBALL"
];

/// Bitfire.
pub static BITFIRE_QUIRKS: &[Quirk] = &[
    Quirk::new(0x3393, 40), // stacked, file $0a
    Quirk::new(0x2b90, 60), // beats, file $0f
];

/// Spindle 3.x.  Applied per unit.
pub static SPINDLE_QUIRKS: &[Quirk] = &[
    Quirk::new(0xebd1, 40), // mojo, 26th job on side 4
];

/// BoozeLoader.
pub static BOOZE_QUIRKS: &[Quirk] = &[
    Quirk::new(0x3562, 120), // the elder scrollers, file $19
    Quirk::new(0x19b2, 120), // uncensored, disk 2 file $10
    Quirk::new(0xd41b, 240), // smart girls hate booze
    Quirk::new(0xe529, 240), // andropolis
];

/// Find the first entry of `table` whose key is `crc`.  A key of 0 ends the
/// table early, and never matches.
pub fn scan<T>(table: &[T], crc: u16, key: impl Fn(&T) -> u16) -> Option<&T> {
    table
        .iter()
        .take_while(|entry| key(entry) != 0)
        .find(|entry| key(entry) == crc)
}

/// Find the quirk for the file after the one with checksum `crc`.
pub fn get_file_quirks(table: &[Quirk], crc: u16) -> Option<&Quirk> {
    scan(table, crc, |q| q.crc)
}

/// The block delay in milliseconds for the file after the one with
/// checksum `crc`, 0 if none.
pub fn block_delay(table: &[Quirk], crc: u16) -> u8 {
    match get_file_quirks(table, crc) {
        Some(quirk) => {
            debug!("Block delay {}ms after file {:04x}", quirk.delay_ms, crc);
            quirk.delay_ms
        }
        None => 0,
    }
}
