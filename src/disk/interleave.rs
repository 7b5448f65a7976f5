//! Interleave cursors.
//!
//! Loaders that lay files out themselves write consecutive blocks a fixed
//! number of sectors apart, so the drive doesn't have to wait a whole
//! revolution between blocks.  Two schemes exist:
//! - [`InterleaveCursor`] steps by the interleave and wraps back to the next
//!   unused start sector.  Once every start sector has been used the track is
//!   done.
//! - [`ZonedCursor`] keeps a bitmap of used sectors and skips over them, and
//!   has a different interleave per speed zone.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{TrackSector, next_track};
use crate::constants::SECTOR_SIZE;

/// Cursor over a file laid out with a fixed interleave, plus a byte offset
/// into the current sector for layouts where files share sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterleaveCursor {
    pub track: u8,
    pub sector: u8,
    pub offset: u8,
    pub interleave: u8,
    /// Use an interleave of 3 instead of the standard one above track 17.
    pub zoned: bool,
}

impl InterleaveCursor {
    /// Standard interleave of the chained layouts.
    pub const STD_INTERLEAVE: u8 = 4;

    /// Interleave used above track 17 by zoned layouts.
    pub const OUTER_INTERLEAVE: u8 = 3;

    pub const fn new(track: u8, sector: u8, interleave: u8) -> Self {
        Self {
            track,
            sector,
            offset: 0,
            interleave,
            zoned: false,
        }
    }

    /// Switch to zoned interleave, and apply it to the current track.
    pub fn zoned(mut self) -> Self {
        self.zoned = true;
        self.apply_zone();
        self
    }

    pub const fn position(&self) -> TrackSector {
        TrackSector::new(self.track, self.sector)
    }

    fn apply_zone(&mut self) {
        if self.zoned {
            self.interleave = if self.track > 17 {
                Self::OUTER_INTERLEAVE
            } else {
                Self::STD_INTERLEAVE
            };
        }
    }

    /// Step to the next sector of the file.  `sectors` gives the number of
    /// sectors on a track.
    pub fn advance(&mut self, sectors: impl Fn(u8) -> u8) {
        let il = self.interleave.max(1);
        self.sector = self.sector.wrapping_add(il);
        if self.sector >= sectors(self.track) {
            self.sector %= il;
            self.sector += 1;
            if self.sector == il {
                // Every start sector used, track done
                self.sector = 0;
                self.track = next_track(self.track);
                self.apply_zone();
            }
        }
    }

    /// Move forward by `count` bytes, starting at the current offset.
    pub fn skip_bytes(&mut self, count: u32, sectors: impl Fn(u8) -> u8) {
        let mut pos = count + u32::from(self.offset);
        while pos >= SECTOR_SIZE as u32 {
            self.advance(&sectors);
            pos -= SECTOR_SIZE as u32;
        }
        self.offset = pos as u8;
    }
}

/// Cursor which walks every sector of a track exactly once, using a per
/// speed zone interleave, and then moves on to the next track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ZonedCursor {
    pub track: u8,
    pub sector: u8,
    num_sectors: u8,
    remaining: u8,
    current_il: u8,
    interleave: [u8; 4],
    used: u32,
    /// Shift the start sector back on each new track, rather than carrying
    /// on from the last one.
    pub skew: bool,
    /// Start each new track at sector 0.
    pub reset_sector: bool,
}

impl ZonedCursor {
    /// Amount the start sector moves back by on each new track with skew.
    const SKEW: u8 = 2;

    pub fn new(interleave: [u8; 4]) -> Self {
        let mut cursor = Self {
            track: 1,
            sector: 0,
            num_sectors: 0,
            remaining: 0,
            current_il: 0,
            interleave,
            used: 0,
            skew: false,
            reset_sector: false,
        };
        cursor.track_changed();
        cursor
    }

    pub fn set_interleave(&mut self, interleave: [u8; 4]) {
        self.interleave = interleave;
        self.track_changed();
    }

    pub const fn position(&self) -> TrackSector {
        TrackSector::new(self.track, self.sector)
    }

    /// Sectors not yet visited on the current track.
    pub const fn remaining(&self) -> u8 {
        self.remaining
    }

    /// Jump to a new position, starting the track afresh.
    pub fn seek(&mut self, track: u8, sector: u8) {
        self.track = track;
        self.sector = sector;
        self.track_changed();
    }

    /// Reload the zone parameters for the current track, and forget which
    /// sectors were used.
    pub fn track_changed(&mut self) {
        let (num, zone) = match self.track {
            0..18 => (21, 0),
            18..25 => (19, 1),
            25..31 => (18, 2),
            _ => (17, 3),
        };
        self.num_sectors = num;
        self.current_il = self.interleave[zone];
        self.remaining = num;
        self.used = 0;
    }

    fn is_used(&self, sector: u8) -> bool {
        self.used & (1 << (sector & 0x1f)) != 0
    }

    fn advance_sector(&mut self, step: u8) {
        self.sector = self.sector.wrapping_add(step);
        if self.sector >= self.num_sectors {
            self.sector -= self.num_sectors;
            // Tracks 1 to 17 wrap one sector short
            if self.track < 18 && self.sector > 0 {
                self.sector -= 1;
            }
        }
    }

    /// Mark the current sector used and find the next unused one on this
    /// track.  Returns the number of sectors left on the track.  Once that
    /// reaches 0 the caller should call [`ZonedCursor::next_track`].
    pub fn iterate(&mut self) -> u8 {
        self.used |= 1 << (self.sector & 0x1f);
        self.remaining = self.remaining.saturating_sub(1);

        if self.remaining > 0 || !self.skew {
            self.advance_sector(self.current_il);
        }

        if self.remaining > 0 {
            while self.is_used(self.sector) {
                self.advance_sector(1);
            }
        }

        self.remaining
    }

    /// Move on to the next track, skipping the directory track, after the
    /// current track has been used up.
    pub fn next_track(&mut self) {
        loop {
            self.track = self.track.wrapping_add(1);
            if self.track != crate::constants::DIR_TRACK {
                break;
            }
            self.sector = self.sector.wrapping_add(2);
        }
        self.track_changed();

        if self.skew {
            self.sector = self.sector.wrapping_sub(Self::SKEW);
            if self.track == 19 {
                self.sector = self.sector.wrapping_sub(8);
            }
            if self.sector & 0x80 != 0 {
                self.sector = self.sector.wrapping_add(self.num_sectors);
            }
        } else if self.reset_sector {
            self.sector = 0;
        }
    }

    /// Move on by one sector, changing track if needed.
    pub fn step(&mut self) {
        if self.iterate() == 0 {
            self.next_track();
        }
    }
}
