//! In-memory disk images.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::constants::{CBM_NAME_LENGTH, DIR_ENTRY_SIZE, DIR_TRACK, MAX_TRACK, NAME_PAD};
use crate::disk::{TrackSector, sectors_per_track};
use crate::driver::{Channels, MediaError, Sector, SectorIo};

/// A list of disk images, one of which is inserted.  Shared between a
/// [`MemDisk`] and the signals that swap it.
#[derive(Clone, Default)]
pub struct SwapList {
    current: Rc<Cell<usize>>,
    count: Rc<Cell<usize>>,
    changed: Rc<Cell<bool>>,
}

impl SwapList {
    pub fn current(&self) -> usize {
        self.current.get()
    }

    /// Insert image `index`, and flag the change.
    pub fn insert(&self, index: usize) {
        self.current.set(index % self.count.get().max(1));
        self.changed.set(true);
    }

    pub fn next(&self) {
        self.insert(self.current() + 1);
    }

    pub fn take_changed(&self) -> bool {
        self.changed.replace(false)
    }
}

/// A stack of 40 track 1541 images held in memory, with a log of every
/// sector access.
pub struct MemDisk {
    images: Vec<Vec<u8>>,
    swap: SwapList,
    next_free: TrackSector,
    pub write_protected: bool,
    /// Fail reads of this sector.
    pub bad_sector: Option<TrackSector>,
    pub reads: Rc<RefCell<Vec<TrackSector>>>,
    pub writes: Rc<RefCell<Vec<TrackSector>>>,
    /// Whether the image counts as a D41 that can be extended.
    pub d41: bool,
    /// Track count after the last extension.
    pub extended_to: Option<u8>,
    /// Sectors marked good in the error information.
    pub marked_ok: Vec<TrackSector>,
    /// Files open for reading, by channel.
    pub open: HashMap<u8, TrackSector>,
    /// Direct access buffers, by channel.
    pub buffers: HashMap<u8, Vec<u8>>,
    /// Files open for writing, by channel.
    writing: HashMap<u8, usize>,
    /// Every file written, in the order they were created, with name and
    /// contents.
    pub written: Vec<(Vec<u8>, Vec<u8>)>,
    /// Files closed so far.
    pub closed: Vec<u8>,
}

fn offset(track: u8, sector: u8) -> Option<usize> {
    if track == 0 || track > MAX_TRACK || sector >= sectors_per_track(track) {
        return None;
    }
    let before: usize = (1..track).map(|t| usize::from(sectors_per_track(t))).sum();
    Some((before + usize::from(sector)) * 256)
}

fn blank_image() -> Vec<u8> {
    let total: usize = (1..=MAX_TRACK).map(|t| usize::from(sectors_per_track(t))).sum();
    let mut image = vec![0u8; total * 256];
    // BAM pointing at the first directory sector, which is empty
    let bam = offset(DIR_TRACK, 0).unwrap_or_default();
    image[bam] = DIR_TRACK;
    image[bam + 1] = 1;
    let dir = offset(DIR_TRACK, 1).unwrap_or_default();
    image[dir + 1] = 0xff;
    image
}

impl Default for MemDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDisk {
    /// One blank, formatted image.
    pub fn new() -> Self {
        Self::with_images(1)
    }

    /// `count` blank images, the first one inserted.
    pub fn with_images(count: usize) -> Self {
        let swap = SwapList::default();
        swap.count.set(count);
        Self {
            images: (0..count).map(|_| blank_image()).collect(),
            swap,
            next_free: TrackSector::new(1, 0),
            write_protected: false,
            bad_sector: None,
            reads: Rc::default(),
            writes: Rc::default(),
            d41: false,
            extended_to: None,
            marked_ok: Vec::new(),
            open: HashMap::new(),
            buffers: HashMap::new(),
            writing: HashMap::new(),
            written: Vec::new(),
            closed: Vec::new(),
        }
    }

    /// Open a file for writing on `channel`, as a host would with OPEN.
    pub fn open_for_write(&mut self, channel: u8, name: &[u8]) {
        self.written.push((name.to_vec(), Vec::new()));
        self.writing.insert(channel, self.written.len() - 1);
    }

    /// Contents written to the file called `name`, the latest if there
    /// were several.
    pub fn written_file(&self, name: &[u8]) -> Option<&[u8]> {
        self.written
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    pub fn swap_list(&self) -> SwapList {
        self.swap.clone()
    }

    /// Select the image that the build helpers write to, without flagging a
    /// disk change.
    pub fn edit(&mut self, index: usize) -> &mut Self {
        self.swap.current.set(index);
        self
    }

    pub fn sector(&self, track: u8, sector: u8) -> &Sector {
        let start = offset(track, sector).unwrap_or_else(|| panic!("no sector {track}/{sector}"));
        let image = &self.images[self.swap.current()];
        image[start..start + 256].try_into().unwrap()
    }

    pub fn sector_mut(&mut self, track: u8, sector: u8) -> &mut Sector {
        let start = offset(track, sector).unwrap_or_else(|| panic!("no sector {track}/{sector}"));
        let image = &mut self.images[self.swap.current()];
        (&mut image[start..start + 256]).try_into().unwrap()
    }

    /// Number of reads of a sector so far.
    pub fn read_count(&self) -> usize {
        self.reads.borrow().len()
    }

    fn alloc(&mut self) -> TrackSector {
        let ts = self.next_free;
        let mut next = TrackSector::new(ts.track, ts.sector + 1);
        if next.sector >= sectors_per_track(next.track) {
            next = TrackSector::new(crate::disk::next_track(next.track), 0);
        }
        self.next_free = next;
        ts
    }

    /// Write `data` as a chain of sectors, returning the first one.
    pub fn add_chain(&mut self, data: &[u8]) -> TrackSector {
        let blocks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(254).collect()
        };
        let locations: Vec<TrackSector> = blocks.iter().map(|_| self.alloc()).collect();
        for (i, block) in blocks.iter().enumerate() {
            let ts = locations[i];
            let sector = self.sector_mut(ts.track, ts.sector);
            sector.fill(0);
            match locations.get(i + 1) {
                Some(next) => {
                    sector[0] = next.track;
                    sector[1] = next.sector;
                }
                None => {
                    sector[0] = 0;
                    sector[1] = (block.len() + 1) as u8;
                }
            }
            sector[2..2 + block.len()].copy_from_slice(block);
        }
        locations[0]
    }

    fn add_entry(&mut self, name: &[u8], file_type: u8, start: TrackSector, blocks: u16) {
        let mut dir = TrackSector::new(DIR_TRACK, 1);
        loop {
            let sector = self.sector(dir.track, dir.sector);
            let free = (0..8).find(|i| {
                let base = i * DIR_ENTRY_SIZE;
                sector[base + 2] == 0 && sector[base + 3] == 0
            });
            if let Some(i) = free {
                let sector = self.sector_mut(dir.track, dir.sector);
                let base = i * DIR_ENTRY_SIZE;
                sector[base + 2] = file_type;
                sector[base + 3] = start.track;
                sector[base + 4] = start.sector;
                let name_field = &mut sector[base + 5..base + 5 + CBM_NAME_LENGTH];
                name_field.fill(NAME_PAD);
                name_field[..name.len()].copy_from_slice(name);
                sector[base + 30..base + 32].copy_from_slice(&blocks.to_le_bytes());
                return;
            }
            if sector[0] == 0 {
                // Directory full, extend the chain
                let next = TrackSector::new(DIR_TRACK, dir.sector + 3);
                let current = self.sector_mut(dir.track, dir.sector);
                current[0] = next.track;
                current[1] = next.sector;
                let new = self.sector_mut(next.track, next.sector);
                new.fill(0);
                new[1] = 0xff;
            }
            let sector = self.sector(dir.track, dir.sector);
            dir = TrackSector::new(sector[0], sector[1]);
        }
    }

    /// Add a PRG file.
    pub fn add_file(&mut self, name: &[u8], data: &[u8]) -> TrackSector {
        let start = self.add_chain(data);
        let blocks = data.len().div_ceil(254).max(1) as u16;
        self.add_entry(name, 0x82, start, blocks);
        start
    }

    /// Add a SEQ file.
    pub fn add_seq_file(&mut self, name: &[u8], data: &[u8]) -> TrackSector {
        let start = self.add_chain(data);
        let blocks = data.len().div_ceil(254).max(1) as u16;
        self.add_entry(name, 0x81, start, blocks);
        start
    }

    /// Add a file with type 0, which only shows up when hidden files are
    /// included.
    pub fn add_hidden_file(&mut self, name: &[u8], data: &[u8]) -> TrackSector {
        let start = self.add_chain(data);
        let blocks = data.len().div_ceil(254).max(1) as u16;
        self.add_entry(name, 0, start, blocks);
        start
    }

    /// Read back a chain of sectors.
    pub fn read_chain(&self, start: TrackSector) -> Vec<u8> {
        let mut out = Vec::new();
        let mut ts = start;
        loop {
            let sector = self.sector(ts.track, ts.sector);
            if sector[0] == 0 {
                out.extend_from_slice(&sector[2..=usize::from(sector[1]).max(1)]);
                return out;
            }
            out.extend_from_slice(&sector[2..]);
            ts = TrackSector::new(sector[0], sector[1]);
        }
    }
}

impl SectorIo for MemDisk {
    async fn read_sector(
        &mut self,
        buf: &mut Sector,
        _part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), MediaError> {
        let ts = TrackSector::new(track, sector);
        if self.bad_sector == Some(ts) {
            return Err(MediaError::Read);
        }
        let start = offset(track, sector).ok_or(MediaError::IllegalTrackSector)?;
        let image = &self.images[self.swap.current()];
        buf.copy_from_slice(&image[start..start + 256]);
        self.reads.borrow_mut().push(ts);
        Ok(())
    }

    async fn write_sector(
        &mut self,
        buf: &Sector,
        _part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), MediaError> {
        if self.write_protected {
            return Err(MediaError::WriteProtected);
        }
        let start = offset(track, sector).ok_or(MediaError::IllegalTrackSector)?;
        let image = &mut self.images[self.swap.current()];
        image[start..start + 256].copy_from_slice(buf);
        self.writes.borrow_mut().push(TrackSector::new(track, sector));
        Ok(())
    }

    fn is_d41(&self, _part: u8) -> bool {
        self.d41
    }

    async fn extend_image(&mut self, _part: u8, tracks: u8) -> Result<(), MediaError> {
        if !self.d41 {
            return Err(MediaError::IllegalTrackSector);
        }
        self.extended_to = Some(tracks);
        Ok(())
    }

    async fn mark_sector_ok(&mut self, _part: u8, track: u8, sector: u8) -> Result<(), MediaError> {
        self.marked_ok.push(TrackSector::new(track, sector));
        Ok(())
    }
}

impl Channels for MemDisk {
    fn open_file(&self, channel: u8) -> Option<TrackSector> {
        self.open.get(&channel).copied()
    }

    fn is_writable(&self, channel: u8) -> bool {
        self.writing.contains_key(&channel)
    }

    fn channel_buffer(&self, channel: u8) -> Option<&[u8]> {
        self.buffers.get(&channel).map(Vec::as_slice)
    }

    async fn create(&mut self, _part: u8, channel: u8, name: &[u8]) -> Result<(), MediaError> {
        if self.write_protected {
            return Err(MediaError::WriteProtected);
        }
        self.open_for_write(channel, name);
        Ok(())
    }

    async fn append(&mut self, channel: u8, data: &[u8]) -> Result<(), MediaError> {
        let index = *self.writing.get(&channel).ok_or(MediaError::NotReady)?;
        self.written[index].1.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self, channel: u8) -> Result<(), MediaError> {
        self.writing.remove(&channel);
        self.open.remove(&channel);
        self.closed.push(channel);
        Ok(())
    }
}

#[test]
fn chains_round_trip() {
    let mut disk = MemDisk::new();
    let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    let start = disk.add_file(b"TEST", &data);
    assert_eq!(start, TrackSector::new(1, 0));
    assert_eq!(disk.read_chain(start), data);
    assert_eq!(disk.sector(18, 1)[2], 0x82);
}
