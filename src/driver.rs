//! This file defines the interfaces between the fastloader engine and the
//! rest of the drive firmware, and the errors that flow across them.
//!
//! The engine never touches the filesystem, the buttons or the command
//! channel directly.  Instead the firmware provides implementations of
//! [`SectorIo`], [`Channels`] and [`DriveSignals`], and hands over the raw
//! [`Command`] buffer for every M-W and M-E.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use crate::constants::{SECTOR_SIZE, STD_TRACKS};
use crate::disk::{TrackSector, sectors_per_track};
use crate::util::crc::{CRC_INIT, crc16};
use crate::util::time::Timeout;

/// Errors reported by the disk image layer.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaError {
    /// No image mounted, or the card was removed
    NotReady,
    /// Track or sector outside the image
    IllegalTrackSector,
    /// Underlying read failed
    Read,
    /// Underlying write failed
    Write,
    /// Image is read only
    WriteProtected,
}

/// Defines errors for fastloader sessions.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoaderError {
    /// Host did not produce the expected edge within the expected time
    Timeout,
    /// Sector I/O failure
    Media(MediaError),
    /// Unexpected line pattern, usually because the host was reset
    HostReset,
    /// User requested an abort with a long key press
    Abort,
    /// No free sector buffer
    NoBuffer,
    /// The host asked for something the loader can't do
    Protocol,
}

impl From<Timeout> for LoaderError {
    fn from(_: Timeout) -> Self {
        LoaderError::Timeout
    }
}

impl From<MediaError> for LoaderError {
    fn from(e: MediaError) -> Self {
        LoaderError::Media(e)
    }
}

/// One 256 byte disk sector.
pub type Sector = [u8; SECTOR_SIZE];

/// Access to the mounted disk image.
///
/// Partitions are numbered the same way the command parser numbers them, and
/// the fastloaders simply pass through whatever partition the session was
/// started on.
#[allow(async_fn_in_trait)]
pub trait SectorIo {
    /// Read one sector into `buf`.
    async fn read_sector(
        &mut self,
        buf: &mut Sector,
        part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), MediaError>;

    /// Write one sector from `buf`.
    async fn write_sector(
        &mut self,
        buf: &Sector,
        part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), MediaError>;

    /// Number of sectors on a track.  The default is the 1541 layout, with
    /// the second side of a D71 folded onto the first.
    fn sectors_per_track(&self, _part: u8, track: u8) -> u8 {
        if track > STD_TRACKS && track <= 2 * STD_TRACKS && self.double_sided() {
            sectors_per_track(track - STD_TRACKS)
        } else {
            sectors_per_track(track)
        }
    }

    /// Whether the image is double sided (D71).
    fn double_sided(&self) -> bool {
        false
    }

    /// Whether the image on `part` is a plain 1541 image, which can be
    /// extended.
    fn is_d41(&self, _part: u8) -> bool {
        !self.double_sided()
    }

    /// Grow a 1541 image to `tracks` tracks.  Images that can't grow refuse.
    async fn extend_image(&mut self, _part: u8, _tracks: u8) -> Result<(), MediaError> {
        Err(MediaError::IllegalTrackSector)
    }

    /// Record a sector as good in the image's error information, if it has
    /// any.
    async fn mark_sector_ok(&mut self, _part: u8, _track: u8, _sector: u8) -> Result<(), MediaError> {
        Ok(())
    }
}

/// Files and buffers the host set up through the standard protocol before
/// it started a loader, and files a loader creates.
///
/// Loaders that take over an open file find where it starts here, and
/// follow its chain through [`SectorIo`] themselves.  Writing needs the
/// filesystem to allocate sectors, so that goes through the firmware.  The
/// defaults describe a drive with nothing open that can't write files.
#[allow(async_fn_in_trait)]
pub trait Channels {
    /// First sector of the file open for reading on `channel`.
    fn open_file(&self, _channel: u8) -> Option<TrackSector> {
        None
    }

    /// Whether a file is open for writing on `channel`.
    fn is_writable(&self, _channel: u8) -> bool {
        false
    }

    /// Contents of the direct access buffer on `channel`, up to the buffer
    /// pointer.
    fn channel_buffer(&self, _channel: u8) -> Option<&[u8]> {
        None
    }

    /// Open `name` for writing on `channel`, replacing any file with that
    /// name.
    async fn create(&mut self, _part: u8, _channel: u8, _name: &[u8]) -> Result<(), MediaError> {
        Err(MediaError::NotReady)
    }

    /// Add `data` to the end of the file being written on `channel`.
    async fn append(&mut self, _channel: u8, _data: &[u8]) -> Result<(), MediaError> {
        Err(MediaError::NotReady)
    }

    /// Close whatever is open on `channel`.
    async fn close(&mut self, _channel: u8) -> Result<(), MediaError> {
        Ok(())
    }
}

/// Buttons the user can press while a loader is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Key {
    /// Next disk image in the swap list
    Next,
    /// Previous disk image in the swap list
    Prev,
    /// First disk image in the swap list
    Home,
    /// Long press - leave the fastloader
    Sleep,
}

/// Signals from the rest of the firmware.
pub trait DriveSignals {
    /// Returns true, once, after the mounted image has changed.
    fn take_dir_changed(&mut self) -> bool;

    /// Returns the oldest unhandled key press.
    fn take_key(&mut self) -> Option<Key>;

    /// Ask the firmware to swap the disk image.  The firmware raises the
    /// directory changed signal once the swap is done.
    fn change_disk(&mut self, key: Key);
}

/// A command from the generic command parser, as it arrived on the command
/// channel.  For example `M-E` followed by a little endian address.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    bytes: &'a [u8],
    part: u8,
}

impl<'a> Command<'a> {
    /// Wrap a command buffer received on the given partition.
    pub fn new(bytes: &'a [u8], part: u8) -> Self {
        Self { bytes, part }
    }

    /// The command bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Length of the command.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Byte at `index`, or 0 beyond the end of the command.  The command
    /// buffer is zero filled beyond the received length.
    pub fn byte(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// The partition the command was received on.
    pub fn part(&self) -> u8 {
        self.part
    }

    /// Memory address of an M-R, M-W or M-E command.
    pub fn address(&self) -> u16 {
        u16::from_le_bytes([self.byte(3), self.byte(4)])
    }

    /// Checksum of the command from `start`, leaving out the last
    /// `skip_end` bytes.
    pub fn crc(&self, start: usize, skip_end: usize) -> u16 {
        let end = self.bytes.len().saturating_sub(skip_end);
        self.bytes.get(start..end).map_or(CRC_INIT, crc16)
    }

    /// Whether `magic` appears at `offset`.
    pub fn has_magic(&self, offset: usize, magic: &[u8]) -> bool {
        self.bytes
            .get(offset..offset + magic.len())
            .is_some_and(|b| b == magic)
    }
}
