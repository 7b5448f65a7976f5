//! Track/sector chains.
//!
//! Bytes 0 and 1 of a chained sector hold the track and sector of the next
//! sector.  A track of 0 marks the last sector, and byte 1 is then the index
//! of the last used byte.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::TrackSector;
use crate::driver::{MediaError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

/// Where a chain goes after a sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChainLink {
    /// More sectors follow
    Next(TrackSector),
    /// This is the last sector, with data up to and including this index
    Last(u8),
}

impl ChainLink {
    /// Index of the last data byte in the sector this link was read from.
    pub const fn last_used(self) -> u8 {
        match self {
            ChainLink::Next(_) => 0xff,
            ChainLink::Last(last) => last,
        }
    }

    /// Number of data bytes after the link.
    pub const fn data_len(self) -> usize {
        (self.last_used() as usize).saturating_sub(1)
    }

    pub const fn is_last(self) -> bool {
        matches!(self, ChainLink::Last(_))
    }

    /// Write this link into the first two bytes of a sector.
    pub fn store(self, sector: &mut Sector) {
        match self {
            ChainLink::Next(ts) => {
                sector[0] = ts.track;
                sector[1] = ts.sector;
            }
            ChainLink::Last(last) => {
                sector[0] = 0;
                sector[1] = last;
            }
        }
    }
}

/// Read the link of a chained sector.
pub fn link(sector: &Sector) -> ChainLink {
    if sector[0] == 0 {
        ChainLink::Last(sector[1])
    } else {
        ChainLink::Next(TrackSector::new(sector[0], sector[1]))
    }
}

/// Reads a file a sector at a time by following its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChainReader {
    next: Option<TrackSector>,
    blocks: u16,
}

impl ChainReader {
    // More blocks than any image has means a looped chain.
    const MAX_BLOCKS: u16 = 0x0c80;

    pub const fn new(start: TrackSector) -> Self {
        Self {
            next: Some(start),
            blocks: 0,
        }
    }

    /// Blocks read so far.
    pub const fn blocks(&self) -> u16 {
        self.blocks
    }

    /// Where the next block comes from, `None` once the last one has been
    /// read.
    pub const fn next_sector(&self) -> Option<TrackSector> {
        self.next
    }

    /// Read the next block into `buf`, returning its link, or `None` if the
    /// whole file has been read.
    pub async fn next<D: SectorIo>(
        &mut self,
        disk: &mut D,
        buf: &mut Sector,
        part: u8,
    ) -> Result<Option<ChainLink>, MediaError> {
        let Some(ts) = self.next else {
            return Ok(None);
        };
        if self.blocks >= Self::MAX_BLOCKS {
            warn!("File chain loops at {}/{}", ts.track, ts.sector);
            return Err(MediaError::IllegalTrackSector);
        }

        disk.read_sector(buf, part, ts.track, ts.sector).await?;
        self.blocks += 1;

        let link = link(buf);
        self.next = match link {
            ChainLink::Next(next) => Some(next),
            ChainLink::Last(_) => None,
        };
        Ok(Some(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links() {
        let mut sector = [0u8; 256];
        sector[0] = 17;
        sector[1] = 4;
        assert_eq!(link(&sector), ChainLink::Next(TrackSector::new(17, 4)));
        assert_eq!(link(&sector).last_used(), 0xff);

        ChainLink::Last(0x42).store(&mut sector);
        assert_eq!(link(&sector), ChainLink::Last(0x42));
        assert!(link(&sector).is_last());
        assert_eq!(link(&sector).last_used(), 0x42);
        assert_eq!(link(&sector).data_len(), 0x41);
        assert_eq!(ChainLink::Last(0).data_len(), 0);
        assert_eq!(ChainLink::Next(TrackSector::new(1, 0)).data_len(), 254);
    }

    #[test]
    fn reader_follows_the_chain() {
        use crate::test::disk::MemDisk;
        use embassy_futures::block_on;

        let mut disk = MemDisk::new();
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let start = disk.add_chain(&data);

        let mut reader = ChainReader::new(start);
        let mut buf = [0u8; 256];
        let mut out = Vec::new();
        while let Some(link) = block_on(reader.next(&mut disk, &mut buf, 0)).unwrap() {
            out.extend_from_slice(&buf[2..2 + link.data_len()]);
        }
        assert_eq!(out, data);
        assert_eq!(reader.blocks(), 2);
        assert_eq!(reader.next_sector(), None);
    }

    #[test]
    fn reader_stops_on_a_loop() {
        use crate::test::disk::MemDisk;
        use embassy_futures::block_on;

        let mut disk = MemDisk::new();
        let sector = disk.sector_mut(5, 3);
        sector[0] = 5;
        sector[1] = 3;

        let mut reader = ChainReader::new(TrackSector::new(5, 3));
        let mut buf = [0u8; 256];
        let result = loop {
            match block_on(reader.next(&mut disk, &mut buf, 0)) {
                Ok(Some(_)) => (),
                other => break other,
            }
        };
        assert_eq!(result, Err(MediaError::IllegalTrackSector));
    }
}
