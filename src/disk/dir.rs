//! Directory layouts.
//!
//! Loaders that find files by index keep their own directory sectors, in a
//! handful of incompatible layouts described by [`DirLayout`].  Loaders that
//! find files by name use the standard 1541 directory, searched with
//! [`DirSearch`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::chain::{ChainLink, link};
use super::interleave::InterleaveCursor;
use super::TrackSector;
use crate::constants::{CBM_NAME_LENGTH, DIR_ENTRY_SIZE, NAME_PAD, SECTOR_SIZE};
use crate::driver::{MediaError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

/// A file as described by an indexed directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DirEntry {
    /// The entry says where the file starts.
    Located {
        start: TrackSector,
        address: u16,
        length: u16,
    },
    /// The file starts where the previous one ended.
    Chained { address: u16, length: u16 },
}

impl DirEntry {
    /// Load address.
    pub const fn address(&self) -> u16 {
        match self {
            DirEntry::Located { address, .. } | DirEntry::Chained { address, .. } => *address,
        }
    }

    /// Length of the file in bytes.  Directories store one less than this.
    pub const fn bytes(&self) -> u32 {
        match self {
            DirEntry::Located { length, .. } | DirEntry::Chained { length, .. } => {
                *length as u32 + 1
            }
        }
    }
}

/// Layout of an indexed directory sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DirLayout {
    /// 6 byte records of track, sector, address and length.
    Located,
    /// 4 byte records of address and length, with the start of the first
    /// file in the last 4 bytes of the sector.
    Chained,
    /// As [`DirLayout::Chained`], but with the start of the first file in
    /// the first 4 bytes, and the records after it.
    ChainedHeader,
    /// The start of the first file in the first 4 bytes, followed by four
    /// columns of address low, address high, length low and length high.
    Columns,
}

impl DirLayout {
    const COLUMN_STRIDE: usize = 0x3f;

    /// Number of files described by one directory sector.
    pub const fn entries_per_sector(&self) -> u8 {
        match self {
            DirLayout::Located => 42,
            _ => 63,
        }
    }

    /// Decode entry `index` of a directory sector.
    pub fn entry(&self, dir: &Sector, index: u8) -> DirEntry {
        let i = usize::from(index);
        let word = |offset: usize| u16::from_le_bytes([dir[offset], dir[offset + 1]]);
        match self {
            DirLayout::Located => {
                let base = i * 6;
                DirEntry::Located {
                    start: TrackSector::new(dir[base], dir[base + 1]),
                    address: word(base + 2),
                    length: word(base + 4),
                }
            }
            DirLayout::Chained => DirEntry::Chained {
                address: word(i * 4),
                length: word(i * 4 + 2),
            },
            DirLayout::ChainedHeader => DirEntry::Chained {
                address: word((i + 1) * 4),
                length: word((i + 1) * 4 + 2),
            },
            DirLayout::Columns => {
                let col = |c: usize| dir[4 + c * Self::COLUMN_STRIDE + i];
                DirEntry::Chained {
                    address: u16::from_le_bytes([col(0), col(1)]),
                    length: u16::from_le_bytes([col(2), col(3)]),
                }
            }
        }
    }

    /// Offset of the track, sector count and byte offset of the first file
    /// of a chained layout.
    const fn header_offset(&self) -> usize {
        match self {
            DirLayout::Located | DirLayout::Chained => 0xfc,
            DirLayout::ChainedHeader | DirLayout::Columns => 0x00,
        }
    }

    /// Find where file `index` of a chained directory sector starts.
    ///
    /// The sector header gives the track of the first file, how many
    /// sectors into the track it starts, and its byte offset.  From there
    /// the lengths of the preceding files are added up.
    pub fn locate(
        &self,
        dir: &Sector,
        index: u8,
        zoned: bool,
        sectors: impl Fn(u8) -> u8,
    ) -> InterleaveCursor {
        let base = self.header_offset();
        let mut cursor = InterleaveCursor::new(dir[base], 0, InterleaveCursor::STD_INTERLEAVE);
        if zoned {
            cursor = cursor.zoned();
        }
        for _ in 0..dir[base + 1] {
            cursor.advance(&sectors);
        }
        cursor.offset = dir[base + 2];

        for prior in 0..index {
            cursor.skip_bytes(self.entry(dir, prior).bytes(), &sectors);
        }

        cursor
    }
}

/// A bundle entry from an indexed bundle directory: where the bundle
/// starts, and where its last block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BundleEntry {
    pub start: TrackSector,
    /// Sectors remaining on the start track when the bundle starts.
    pub sectors_left: u8,
    /// Byte pointer of the bundle's last block.
    pub last_byte: u8,
}

impl BundleEntry {
    /// Number of bundles described by one directory sector.
    pub const PER_SECTOR: u8 = 64;

    /// Decode the entry for `bundle` from an (already decoded) directory
    /// sector.
    pub fn parse(dir: &Sector, bundle: u8) -> Self {
        let base = usize::from(bundle % Self::PER_SECTOR) * 4;
        Self {
            start: TrackSector::new(dir[base], dir[base + 1]),
            sectors_left: dir[base + 2],
            last_byte: dir[base + 3],
        }
    }
}

/// A file found in a 1541 directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DirFile {
    pub name: [u8; CBM_NAME_LENGTH],
    pub file_type: u8,
    pub start: TrackSector,
    pub blocks: u16,
}

impl DirFile {
    fn parse(entry: &[u8]) -> Self {
        let mut name = [NAME_PAD; CBM_NAME_LENGTH];
        name.copy_from_slice(&entry[5..5 + CBM_NAME_LENGTH]);
        Self {
            name,
            file_type: entry[2],
            start: TrackSector::new(entry[3], entry[4]),
            blocks: u16::from_le_bytes([entry[30], entry[31]]),
        }
    }

    /// Length of the name without padding.
    pub fn name_len(&self) -> usize {
        self.name
            .iter()
            .position(|&b| b == NAME_PAD || b == 0)
            .unwrap_or(CBM_NAME_LENGTH)
    }

    /// Entries with a file type of 0 but a start track are hidden files.
    pub fn is_hidden(&self) -> bool {
        self.file_type == 0
    }
}

/// Match a file name against a pattern.  `*` matches the rest of the name,
/// `?` any single character.  The pattern ends at its first 0 byte.
pub fn name_matches(pattern: &[u8], file: &DirFile) -> bool {
    let name = &file.name[..file.name_len()];
    let pattern_len = pattern.iter().position(|&b| b == 0).unwrap_or(pattern.len());

    for (i, &p) in pattern[..pattern_len].iter().enumerate() {
        match p {
            b'*' => return true,
            _ if i >= name.len() => return false,
            b'?' => (),
            _ if p != name[i] => return false,
            _ => (),
        }
    }

    pattern_len == name.len()
}

/// Position in a search of a 1541 directory.
///
/// The search continues from where the last match was found, so a `*`
/// pattern walks through the files one by one.  Hidden files (type 0 with a
/// valid start track) are included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DirSearch {
    start: TrackSector,
    current: Option<TrackSector>,
    entry: u8,
    hops: u16,
}

impl DirSearch {
    const ENTRIES: u8 = (SECTOR_SIZE / DIR_ENTRY_SIZE) as u8;

    // More directory sectors than any image has means a looped chain.
    const MAX_HOPS: u16 = 256;

    /// Start a search at the given first directory sector.
    pub const fn new(start: TrackSector) -> Self {
        Self {
            start,
            current: Some(start),
            entry: 0,
            hops: 0,
        }
    }

    /// First directory sector of this search.
    pub const fn start(&self) -> TrackSector {
        self.start
    }

    /// Restart at the first directory entry.
    pub fn rewind(&mut self) {
        *self = Self::new(self.start);
    }

    /// Find the next file matching `pattern`.  `buf` is scratch space.
    pub async fn next_match<D: SectorIo>(
        &mut self,
        disk: &mut D,
        buf: &mut Sector,
        part: u8,
        pattern: &[u8],
    ) -> Result<Option<DirFile>, MediaError> {
        while let Some(ts) = self.current {
            disk.read_sector(buf, part, ts.track, ts.sector).await?;

            while self.entry < Self::ENTRIES {
                let base = usize::from(self.entry) * DIR_ENTRY_SIZE;
                self.entry += 1;

                let entry = &buf[base..base + DIR_ENTRY_SIZE];
                if entry[2] == 0 && entry[3] == 0 {
                    // Unused slot
                    continue;
                }

                let file = DirFile::parse(entry);
                if name_matches(pattern, &file) {
                    return Ok(Some(file));
                }
            }

            self.entry = 0;
            self.hops += 1;
            self.current = match link(buf) {
                ChainLink::Next(next) if self.hops < Self::MAX_HOPS => Some(next),
                ChainLink::Next(_) => {
                    warn!("Directory chain loops");
                    None
                }
                ChainLink::Last(_) => None,
            };
        }

        Ok(None)
    }
}
