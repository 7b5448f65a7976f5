//! Disk addressing shared by the loaders.
//!
//! None of the fastloaders use the DOS view of a disk (files, BAM, block
//! allocation).  Instead they address sectors directly, using:
//! - [`interleave`] - cursors that step through a track with a fixed
//!   interleave, the way the loaders' own drivecode lays out files.
//! - [`dir`] - the loaders' private directory layouts, and a plain 1541
//!   directory search for loaders that find files by name.
//! - [`chain`] - track/sector link helpers.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod chain;
pub mod dir;
pub mod interleave;

pub use chain::{ChainLink, ChainReader, link};
pub use dir::{BundleEntry, DirEntry, DirFile, DirLayout, DirSearch};
pub use interleave::{InterleaveCursor, ZonedCursor};

use crate::constants::DIR_TRACK;

/// A sector address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrackSector {
    pub track: u8,
    pub sector: u8,
}

impl TrackSector {
    pub const fn new(track: u8, sector: u8) -> Self {
        Self { track, sector }
    }
}

/// Number of sectors on a track of a 1541 disk.  Tracks beyond 35 (40
/// track images) carry on with the outermost zone.
pub const fn sectors_per_track(track: u8) -> u8 {
    if track < 18 {
        21
    } else if track < 25 {
        19
    } else if track < 31 {
        18
    } else {
        17
    }
}

/// The track after `track`, skipping the directory track.
pub const fn next_track(track: u8) -> u8 {
    let next = track.wrapping_add(1);
    if next == DIR_TRACK { next + 1 } else { next }
}
