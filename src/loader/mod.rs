//! Fastloader sessions.
//!
//! A session starts once the dispatcher has matched an M-E command to a
//! loader, and runs until the host is done with the loader, the host is
//! reset, or the user aborts.  Each loader family has its own module with a
//! `run` function driving the session, built on the shared [`Session`]
//! plumbing here.
//!
//! Sessions are `async`.  Waits for the host to make its next request, or
//! for the user to change disks, can last forever, so they yield to the
//! executor.  Byte and block transfers don't, they spin on the bus.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod ar6;
pub mod bitfire;
pub mod booze;
pub mod burst;
pub mod dreamload;
pub mod epyxcart;
pub mod fc3;
pub mod geos;
pub mod gijoe;
pub mod hypraload;
pub mod krill;
pub mod mmzak;
pub mod n0sdos;
pub mod nippon;
pub mod samsjourney;
pub mod sparkle;
pub mod spindle;
pub mod turbodisk;
pub mod ultraboot;
pub mod uload3;

use embassy_futures::yield_now;
use portable_atomic::{AtomicU8, Ordering};

use crate::buffers::{Buffer, BufferPool};
use crate::bus::BusLines;
use crate::constants::{DIR_START_SECTOR, DIR_TRACK, FILE_TYPE_MASK, FILE_TYPE_PRG};
use crate::disk::{ChainLink, ChainReader, DirFile, DirSearch, TrackSector};
use crate::driver::{Channels, DriveSignals, Key, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::RxTx;
use crate::util::crc::CRC_INIT;

/// Every supported loader and version.
///
/// Versions of a family are in release order, so `variant >= KrillR184`
/// means "Krill r184 or later".  Comparisons across families are
/// meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LoaderVariant {
    #[default]
    None,
    KrillR58Pre,
    KrillR58,
    KrillR146,
    KrillR159,
    KrillR164,
    KrillR184,
    KrillR186,
    KrillR192,
    KrillSleep,
    SpindleSleep,
    BitfireSleep,
    Bitfire01,
    Bitfire03,
    Bitfire04,
    Bitfire06,
    Bitfire07Pre,
    Bitfire07Dbg,
    Bitfire07,
    Bitfire10,
    Bitfire11,
    Bitfire12Pr1,
    Bitfire12Pr2,
    Bitfire12Pr3,
    Sparkle10,
    Sparkle15,
    Sparkle20,
    Sparkle21,
    Spindle21,
    Spindle22,
    Spindle23,
    Spindle3,
    Booze,
    Ultraboot,
    Hypraload,
    Dreamload,
    DreamloadOld,
    Turbodisk,
    Fc3Load,
    Fc3Save,
    Fc3Freezed,
    Fc3OldFreezed,
    ULoad3,
    ELoad1,
    GiJoe,
    EpyxCart,
    GeosStage1C64,
    GeosStage1C128,
    GeosStage23D1541,
    GeosStage23D1571,
    GeosStage23D1581,
    WheelsStage1C64,
    WheelsStage1C128,
    WheelsStage2,
    Wheels44Stage2,
    Wheels44Stage2D1581,
    Nippon,
    Ar6D1581Load,
    Ar6D1581Save,
    Mmzak,
    N0sdosFileread,
    SamsJourney,
    Burst,
}

impl LoaderVariant {
    const ALL: [LoaderVariant; 63] = [
        Self::None,
        Self::KrillR58Pre,
        Self::KrillR58,
        Self::KrillR146,
        Self::KrillR159,
        Self::KrillR164,
        Self::KrillR184,
        Self::KrillR186,
        Self::KrillR192,
        Self::KrillSleep,
        Self::SpindleSleep,
        Self::BitfireSleep,
        Self::Bitfire01,
        Self::Bitfire03,
        Self::Bitfire04,
        Self::Bitfire06,
        Self::Bitfire07Pre,
        Self::Bitfire07Dbg,
        Self::Bitfire07,
        Self::Bitfire10,
        Self::Bitfire11,
        Self::Bitfire12Pr1,
        Self::Bitfire12Pr2,
        Self::Bitfire12Pr3,
        Self::Sparkle10,
        Self::Sparkle15,
        Self::Sparkle20,
        Self::Sparkle21,
        Self::Spindle21,
        Self::Spindle22,
        Self::Spindle23,
        Self::Spindle3,
        Self::Booze,
        Self::Ultraboot,
        Self::Hypraload,
        Self::Dreamload,
        Self::DreamloadOld,
        Self::Turbodisk,
        Self::Fc3Load,
        Self::Fc3Save,
        Self::Fc3Freezed,
        Self::Fc3OldFreezed,
        Self::ULoad3,
        Self::ELoad1,
        Self::GiJoe,
        Self::EpyxCart,
        Self::GeosStage1C64,
        Self::GeosStage1C128,
        Self::GeosStage23D1541,
        Self::GeosStage23D1571,
        Self::GeosStage23D1581,
        Self::WheelsStage1C64,
        Self::WheelsStage1C128,
        Self::WheelsStage2,
        Self::Wheels44Stage2,
        Self::Wheels44Stage2D1581,
        Self::Nippon,
        Self::Ar6D1581Load,
        Self::Ar6D1581Save,
        Self::Mmzak,
        Self::N0sdosFileread,
        Self::SamsJourney,
        Self::Burst,
    ];

    /// Inverse of `as u8`.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn is_krill(self) -> bool {
        (Self::KrillR58Pre..=Self::KrillR192).contains(&self)
    }

    pub fn is_bitfire(self) -> bool {
        (Self::Bitfire01..=Self::Bitfire12Pr3).contains(&self)
    }

    pub fn is_sparkle(self) -> bool {
        (Self::Sparkle10..=Self::Sparkle21).contains(&self)
    }

    pub fn is_spindle(self) -> bool {
        (Self::Spindle21..=Self::Spindle3).contains(&self)
    }

    /// GEOS and Wheels, which share their disk driver protocol.
    pub fn is_geos(self) -> bool {
        (Self::GeosStage1C64..=Self::Wheels44Stage2D1581).contains(&self)
    }

    pub fn is_fc3(self) -> bool {
        (Self::Fc3Load..=Self::Fc3OldFreezed).contains(&self)
    }
}

/// Records which loader, if any, is running.  Other parts of the firmware
/// use it to keep off the bus while a session is active.
pub struct ActiveLoader(AtomicU8);

/// The firmware wide active loader marker.
pub static ACTIVE_LOADER: ActiveLoader = ActiveLoader::new();

impl Default for ActiveLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveLoader {
    pub const fn new() -> Self {
        Self(AtomicU8::new(LoaderVariant::None as u8))
    }

    /// The running loader, [`LoaderVariant::None`] if there isn't one.
    pub fn get(&self) -> LoaderVariant {
        LoaderVariant::from_u8(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.get() != LoaderVariant::None
    }

    fn set(&self, variant: LoaderVariant) {
        self.0.store(variant as u8, Ordering::Release);
    }

    /// Mark `variant` as running until the guard is dropped.
    pub fn enter(&self, variant: LoaderVariant) -> ActiveGuard<'_> {
        self.set(variant);
        ActiveGuard(self)
    }
}

/// Clears the [`ActiveLoader`] marker when dropped.
pub struct ActiveGuard<'a>(&'a ActiveLoader);

impl ActiveGuard<'_> {
    pub fn set(&self, variant: LoaderVariant) {
        self.0.set(variant);
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.set(LoaderVariant::None);
    }
}

/// Everything a running loader works with.
///
/// Dropping the session releases CLOCK and DATA and then clears the active
/// loader marker.  That happens however the session ends, including when the
/// future running it is dropped part way through.
pub struct Session<'a, B: BusLines, D, S> {
    pub bus: &'a mut B,
    pub disk: &'a mut D,
    pub signals: &'a mut S,
    pub pool: &'a BufferPool,
    /// Partition the loader was started on.
    pub part: u8,
    pub variant: LoaderVariant,
    pub rxtx: RxTx,
    /// Checksum of the last file or job transferred, which keys the quirks
    /// for the next one.
    pub file_crc: u16,
    marker: Option<ActiveGuard<'a>>,
}

impl<'a, B, D, S> Session<'a, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    pub fn new(
        bus: &'a mut B,
        disk: &'a mut D,
        signals: &'a mut S,
        pool: &'a BufferPool,
        part: u8,
        variant: LoaderVariant,
        rxtx: RxTx,
    ) -> Self {
        Self {
            bus,
            disk,
            signals,
            pool,
            part,
            variant,
            rxtx,
            file_crc: CRC_INIT,
            marker: None,
        }
    }

    /// Publish this session in `marker` for as long as the session lives.
    pub fn mark_active(&mut self, marker: &'a ActiveLoader) {
        self.marker = Some(marker.enter(self.variant));
    }

    /// Record the loader version once the session has worked it out.
    pub fn set_variant(&mut self, variant: LoaderVariant) {
        debug!("Loader variant {}", variant);
        self.variant = variant;
        if let Some(marker) = &self.marker {
            marker.set(variant);
        }
    }

    /// Handle key presses.  Disk change keys are passed on to the firmware,
    /// a long press ends the session.
    pub fn check_keys(&mut self) -> Result<(), LoaderError> {
        match self.signals.take_key() {
            Some(Key::Sleep) => {
                info!("Loader aborted by user");
                Err(LoaderError::Abort)
            }
            Some(key) => {
                debug!("Disk change key {}", key);
                self.signals.change_disk(key);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Allocate a general purpose buffer.
    pub fn alloc(&self) -> Result<Buffer<'a>, LoaderError> {
        let pool = self.pool;
        pool.alloc().ok_or_else(|| {
            warn!("No free buffer");
            LoaderError::NoBuffer
        })
    }

    /// Allocate the system buffer.
    pub fn alloc_system(&self) -> Result<Buffer<'a>, LoaderError> {
        let pool = self.pool;
        pool.alloc_system().ok_or_else(|| {
            warn!("System buffer busy");
            LoaderError::NoBuffer
        })
    }

    pub async fn read(&mut self, buf: &mut Sector, track: u8, sector: u8) -> Result<(), LoaderError> {
        trace!("Read {}/{}", track, sector);
        self.disk
            .read_sector(buf, self.part, track, sector)
            .await
            .inspect_err(|e| warn!("Read {}/{} failed: {}", track, sector, e))?;
        Ok(())
    }

    pub async fn write(&mut self, buf: &Sector, track: u8, sector: u8) -> Result<(), LoaderError> {
        trace!("Write {}/{}", track, sector);
        self.disk
            .write_sector(buf, self.part, track, sector)
            .await
            .inspect_err(|e| warn!("Write {}/{} failed: {}", track, sector, e))?;
        Ok(())
    }

    /// Read the next block of `file` into `buf`.  `None` once the whole
    /// file has been read.
    pub async fn next_block(
        &mut self,
        file: &mut ChainReader,
        buf: &mut Sector,
    ) -> Result<Option<ChainLink>, LoaderError> {
        let next = file.next_sector();
        file.next(&mut *self.disk, buf, self.part).await.map_err(|e| {
            if let Some(ts) = next {
                warn!("Read {}/{} failed: {}", ts.track, ts.sector, e);
            }
            LoaderError::Media(e)
        })
    }

    /// Find the first file in the directory matching `pattern`, optionally
    /// only PRG files.  `buf` is scratch space.
    pub async fn find_file(
        &mut self,
        buf: &mut Sector,
        pattern: &[u8],
        prg_only: bool,
    ) -> Result<Option<DirFile>, LoaderError> {
        let mut search = DirSearch::new(TrackSector::new(DIR_TRACK, DIR_START_SECTOR));
        while let Some(file) = search
            .next_match(&mut *self.disk, buf, self.part, pattern)
            .await?
        {
            if file.is_hidden() || (prg_only && file.file_type & FILE_TYPE_MASK != FILE_TYPE_PRG) {
                continue;
            }
            return Ok(Some(file));
        }
        debug!("No file matches");
        Ok(None)
    }

    /// Sectors on `track` of the mounted image.
    pub fn sectors(&self, track: u8) -> u8 {
        self.disk.sectors_per_track(self.part, track)
    }

    /// Sector count lookup for the interleave cursors.
    pub fn geometry(&self) -> impl Fn(u8) -> u8 + '_ {
        |track| self.disk.sectors_per_track(self.part, track)
    }

    /// Wait for the host to make a request, with `ready` reporting when it
    /// has.  Keys are handled while waiting.
    pub async fn wait_request(&mut self, mut ready: impl FnMut(&mut B) -> bool) -> Result<(), LoaderError> {
        loop {
            if ready(&mut *self.bus) {
                return Ok(());
            }
            self.check_keys()?;
            yield_now().await;
        }
    }

    /// Wait until the disk has been changed.  `reset` reports a host reset,
    /// which ends the wait with [`LoaderError::HostReset`].
    pub async fn wait_disk_change(&mut self, mut reset: impl FnMut(&mut B) -> bool) -> Result<(), LoaderError> {
        debug!("Waiting for disk change");
        loop {
            if self.signals.take_dir_changed() {
                return Ok(());
            }
            if reset(&mut *self.bus) {
                return Err(LoaderError::HostReset);
            }
            self.check_keys()?;
            yield_now().await;
        }
    }
}

impl<B, D, S> Session<'_, B, D, S>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    /// The file the host opened for reading on `channel` before starting
    /// the loader.
    pub fn open_channel(&self, channel: u8) -> Option<ChainReader> {
        let file = self.disk.open_file(channel).map(ChainReader::new);
        if file.is_none() {
            warn!("Nothing open on channel {}", channel);
        }
        file
    }

    /// Replace or create `name` and open it for writing on `channel`.
    pub async fn create_file(&mut self, channel: u8, name: &[u8]) -> Result<(), LoaderError> {
        debug!("Create file on channel {}", channel);
        self.disk
            .create(self.part, channel, name)
            .await
            .inspect_err(|e| warn!("Create failed: {}", e))?;
        Ok(())
    }

    /// Add `data` to the file being written on `channel`.
    pub async fn append(&mut self, channel: u8, data: &[u8]) -> Result<(), LoaderError> {
        self.disk
            .append(channel, data)
            .await
            .inspect_err(|e| warn!("Append failed: {}", e))?;
        Ok(())
    }

    pub async fn close(&mut self, channel: u8) -> Result<(), LoaderError> {
        self.disk.close(channel).await?;
        Ok(())
    }
}

impl<B: BusLines, D, S> Drop for Session<'_, B, D, S> {
    fn drop(&mut self) {
        self.bus.release();
    }
}

/// Log how a session ended.
pub fn log_exit(variant: LoaderVariant, result: &Result<(), LoaderError>) {
    match result {
        Ok(()) => info!("Loader {} done", variant),
        Err(LoaderError::HostReset) => info!("Loader {} ended by host", variant),
        Err(e) => info!("Loader {} exited: {}", variant, e),
    }
}
