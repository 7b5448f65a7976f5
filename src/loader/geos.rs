//! GEOS and Wheels.
//!
//! Booting takes several stages.  Stage 1 sends the next stage of the
//! operating system from a chain of sectors, and later stages run a job
//! loop the disk driver uses for every sector it needs.  Every byte is a
//! timed transfer, with the timing depending on the host's clock speed and
//! the drive being emulated, which the dispatcher has already worked out.
//!
//! GEOS stage 1 scrambles what it sends with a table from its own
//! drivecode, which the dispatcher captures while the drivecode is being
//! uploaded.
//!
//! The job loop takes a job number, then its arguments:
//!
//! | Job | Arguments                | Reply                            |
//! |-----|--------------------------|----------------------------------|
//! | 0   |                          | none, the loader ends            |
//! | 1   | track, sector            | status, then the 256 bytes if OK |
//! | 2   | track, sector, 256 bytes | status                           |

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{LoaderVariant, Session};
use crate::bus::BusLines;
use crate::constants::SECTOR_SIZE;
use crate::disk::{ChainReader, TrackSector};
use crate::driver::{DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::TimedRxTx;
use crate::util::time::fl::TIMED_BYTE_TIMEOUT_MS;

/// Where the GEOS boot disk keeps the next stage.
const STAGE2_START: TrackSector = TrackSector::new(19, 13);

/// Length of the scrambling table in the stage 1 drivecode.
pub const TABLE_LEN: usize = 256;

/// Where the table starts in each version's stage 1 drivecode.
pub const TABLE_ADDRESS_C64: u16 = 0x042a;
pub const TABLE_ADDRESS_C128: u16 = 0x044f;

const JOB_EXIT: u8 = 0;
const JOB_READ: u8 = 1;
const JOB_WRITE: u8 = 2;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 0xff;

/// Wheels stage 1 asks for files by their first track, ending with 0.
const NO_MORE_FILES: u8 = 0;

/// The host takes as long as it likes between jobs.
const JOB_TIMEOUT_MS: u32 = 0;

struct Link<'s, 'a, B: BusLines, D, S> {
    session: &'s mut Session<'a, B, D, S>,
    rxtx: TimedRxTx,
}

impl<B, D, S> Link<'_, '_, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    fn get(&mut self, timeout_ms: u32) -> Result<u8, LoaderError> {
        let get = self.rxtx.get.ok_or(LoaderError::Protocol)?;
        get.receive(self.session.bus, timeout_ms)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LoaderError> {
        self.rxtx.send.send_all(self.session.bus, bytes, TIMED_BYTE_TIMEOUT_MS)
    }

    /// Send a chain of sectors as counted blocks, each byte combined with
    /// the same position of `table` if there is one.  A count of 0 ends it.
    async fn send_chain(&mut self, start: TrackSector, table: Option<&[u8; TABLE_LEN]>) -> Result<(), LoaderError> {
        let mut buf = self.session.alloc()?;
        let mut reader = ChainReader::new(start);
        while let Some(block) = self.session.next_block(&mut reader, &mut buf).await? {
            let end = usize::from(block.last_used());
            self.send(&[(end - 1) as u8])?;
            for index in 2..=end {
                let key = table.map_or(0, |table| table[index]);
                self.send(&[buf[index] ^ key])?;
            }
            if block.is_last() {
                break;
            }
        }
        self.send(&[0])
    }
}

fn link<'s, 'a, B, D, S>(session: &'s mut Session<'a, B, D, S>) -> Result<Link<'s, 'a, B, D, S>, LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let rxtx = session.rxtx.timed().ok_or_else(|| {
        warn!("No transfer timing for {}", session.variant);
        LoaderError::Protocol
    })?;
    Ok(Link { session, rxtx })
}

/// Run GEOS stage 1, sending the next stage scrambled with `table`.
pub async fn run_stage1<B, D, S>(
    session: &mut Session<'_, B, D, S>,
    table: &[u8; TABLE_LEN],
) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    debug!("GEOS stage 1 from {}/{}", STAGE2_START.track, STAGE2_START.sector);
    let mut link = link(session)?;
    link.send_chain(STAGE2_START, Some(table)).await
}

/// Run Wheels stage 1, which asks for files by their start track and
/// sector.
pub async fn run_wheels_stage1<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let mut link = link(session)?;
    loop {
        let track = link.get(JOB_TIMEOUT_MS)?;
        if track == NO_MORE_FILES {
            return Ok(());
        }
        let sector = link.get(TIMED_BYTE_TIMEOUT_MS)?;
        debug!("Wheels stage 1 file at {}/{}", track, sector);
        link.send_chain(TrackSector::new(track, sector), None).await?;
    }
}

/// Run the job loop of the later GEOS stages and Wheels stage 2.
pub async fn run_jobs<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let mut link = link(session)?;
    let mut buf = link.session.alloc_system()?;

    loop {
        let job = link.get(JOB_TIMEOUT_MS)?;
        match job {
            JOB_EXIT => return Ok(()),
            JOB_READ => {
                let track = link.get(TIMED_BYTE_TIMEOUT_MS)?;
                let sector = link.get(TIMED_BYTE_TIMEOUT_MS)?;
                match link.session.read(&mut buf, track, sector).await {
                    Ok(()) => {
                        link.send(&[STATUS_OK])?;
                        link.send(&buf[..])?;
                    }
                    Err(_) => link.send(&[STATUS_ERROR])?,
                }
            }
            JOB_WRITE => {
                let track = link.get(TIMED_BYTE_TIMEOUT_MS)?;
                let sector = link.get(TIMED_BYTE_TIMEOUT_MS)?;
                for index in 0..SECTOR_SIZE {
                    buf[index] = link.get(TIMED_BYTE_TIMEOUT_MS)?;
                }
                let status = match link.session.write(&buf, track, sector).await {
                    Ok(()) => STATUS_OK,
                    Err(_) => STATUS_ERROR,
                };
                link.send(&[status])?;
            }
            _ => {
                warn!("{} unknown job {:02x}", link.session.variant, job);
                return Err(LoaderError::Protocol);
            }
        }
    }
}

/// Where the scrambling table of a GEOS stage 1 variant is captured from.
pub fn table_address(variant: LoaderVariant) -> Option<u16> {
    match variant {
        LoaderVariant::GeosStage1C64 => Some(TABLE_ADDRESS_C64),
        LoaderVariant::GeosStage1C128 => Some(TABLE_ADDRESS_C128),
        _ => None,
    }
}
