//! test_fastloader
//!
//! Tests the fastloader engine on real hardware, by serving a Bitfire 1.1
//! session from a generated pattern disk.  Start a Bitfire 1.1 loader on the
//! host with its drivecode already resident (for example after a reset of
//! the host only) and load files 0 to 7.  Each file is 0x2000 bytes long and
//! loads to 0x2000 * (file + 1).  Byte n of the file at sector t/s is
//! t ^ s ^ n, where n is the byte's offset within that sector.
//!
//! Progress and session results are logged over RTT.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![no_std]
#![no_main]

use {defmt_rtt as _, panic_probe as _};
use defmt::{info, warn};
use embassy_executor::Spawner;
use embassy_rp::gpio::Flex;
use embassy_time::Timer;
use pico_fastloader::constants::DIR_TRACK;
use pico_fastloader::infra::gpio::{PinBus, config};
use pico_fastloader::infra::ui::UI;
use pico_fastloader::loader::{Session, bitfire, log_exit};
use pico_fastloader::protocol::RxTx;
use pico_fastloader::util::built::log_fw_info;
use pico_fastloader::{
    ACTIVE_LOADER, BufferPool, LoaderVariant, MediaError, Sector, SectorIo,
};

/// Bitfire 1.1 directory sector.
const DIR_SECTOR: u8 = 18;

/// Number of files in the directory.
const FILES: u16 = 8;
const FILE_LEN: u16 = 0x2000;

/// Header layout used by Bitfire 1.0 and 1.1.
const BITFIRE_HEADER: u8 = 6;

/// Pause between sessions, to give the host time to restart.
const RESTART_DELAY_MS: u64 = 1000;

static POOL: BufferPool = BufferPool::new();

/// A read only disk whose contents are generated on demand.
struct PatternDisk;

impl SectorIo for PatternDisk {
    async fn read_sector(
        &mut self,
        buf: &mut Sector,
        _part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), MediaError> {
        if track == 0 || track > 35 || sector >= self.sectors_per_track(0, track) {
            return Err(MediaError::IllegalTrackSector);
        }

        if track == DIR_TRACK && sector == DIR_SECTOR {
            buf.fill(0);
            for file in 0..FILES {
                let entry = usize::from(file) * 4;
                let address = FILE_LEN * (file + 1);
                buf[entry..entry + 2].copy_from_slice(&address.to_le_bytes());
                buf[entry + 2..entry + 4].copy_from_slice(&(FILE_LEN - 1).to_le_bytes());
            }
            // First file starts at the beginning of 1/0
            buf[0xfc..0xff].copy_from_slice(&[1, 0, 0]);
        } else {
            for (offset, byte) in buf.iter_mut().enumerate() {
                *byte = track ^ sector ^ offset as u8;
            }
        }
        Ok(())
    }

    async fn write_sector(
        &mut self,
        _buf: &Sector,
        _part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), MediaError> {
        warn!("Write to {}/{} refused", track, sector);
        Err(MediaError::WriteProtected)
    }
}

/// There's only one image, so disk changes complete immediately.
#[embassy_executor::task]
async fn disk_change_task() -> ! {
    loop {
        let key = UI.disk_change_request().await;
        info!("Disk change requested: {}", key);
        UI.image_changed();
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) -> ! {
    log_fw_info(env!("CARGO_BIN_NAME"));

    let p = embassy_rp::init(Default::default());
    let pins = config::standard_v0_1();
    info!("Bus pins: {}", pins);
    let mut bus = PinBus::from_flex(
        Flex::new(p.PIN_19),
        Flex::new(p.PIN_11),
        Flex::new(p.PIN_20),
        Flex::new(p.PIN_13),
        Flex::new(p.PIN_17),
    );

    if spawner.spawn(disk_change_task()).is_err() {
        warn!("Failed to spawn disk change task");
    }

    let mut disk = PatternDisk;
    loop {
        UI.clear();
        let mut signals = UI.signals();
        let mut session = Session::new(
            &mut bus,
            &mut disk,
            &mut signals,
            &POOL,
            0,
            LoaderVariant::Bitfire11,
            RxTx::BitfireClock,
        );
        session.mark_active(&ACTIVE_LOADER);
        info!("Serving Bitfire 1.1");

        let result = bitfire::run(&mut session, BITFIRE_HEADER).await;
        drop(session);
        log_exit(LoaderVariant::Bitfire11, &result);

        Timer::after_millis(RESTART_DELAY_MS).await;
    }
}
