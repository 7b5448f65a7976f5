//! Dreamload.
//!
//! After the M-E the host sends the final drivecode, 1024 bytes, which we
//! only use to tell the old and new protocols apart.  Then it makes jobs:
//! a track and sector, sent clocked by CLOCK (new) or ATN (old), with the
//! first edge of the track byte also signalling that a job is coming.
//!
//! Track 0 is special: sector 0 ends the loader, sector 1 asks for the
//! first directory sector, and anything else is ignored.  Blocks go back as
//! a status byte, the 256 sector bytes and an XOR checksum, two bits at a
//! time clocked by ATN.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{LoaderVariant, Session};
use crate::bus::{BusLines, Line};
use crate::constants::{DIR_START_SECTOR, DIR_TRACK};
use crate::driver::{DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_read_after_edge, clocked_read_byte, clocked_write_byte, wait_atn_high};
use crate::util::time::fl::{ATN_TIMEOUT_MS, BIT_TIMEOUT_MS, DREAMLOAD_DIR_DELAY_MS};
use crate::util::time::yield_ms;

/// Length of the final drivecode.
const DRIVECODE_LEN: usize = 4 * 256;

/// XOR of the drivecode bytes of the versions using the old protocol.
const OLD_DRIVECODE: [u8; 2] = [0xac, 0xdc];

const STATUS_OK: u8 = 0;

/// A job, once the track byte's first edge has been seen.
fn read_job<B: BusLines>(bus: &mut B, clock: Line) -> Result<(u8, u8), LoaderError> {
    bus.critical(|bus| {
        let track = clocked_read_after_edge(bus, clock, Line::Data, BIT_TIMEOUT_MS)?;
        let sector = clocked_read_byte(bus, clock, Line::Data, BIT_TIMEOUT_MS)?;
        Ok((track, sector))
    })
}

fn send_block<B: BusLines>(bus: &mut B, block: &Sector) -> Result<(), LoaderError> {
    let checksum = block.iter().fold(0, |sum, &b| sum ^ b);
    bus.critical(|bus| {
        clocked_write_byte(bus, STATUS_OK, None, ATN_TIMEOUT_MS)?;
        for &byte in block {
            clocked_write_byte(bus, byte, None, ATN_TIMEOUT_MS)?;
        }
        clocked_write_byte(bus, checksum, None, ATN_TIMEOUT_MS)?;
        wait_atn_high(bus);
        bus.release();
        Ok(())
    })
}

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    session.bus.release();
    session.wait_request(|bus| bus.clock()).await?;

    let kind = session.bus.critical(|bus| {
        (0..DRIVECODE_LEN).try_fold(0u8, |kind, _| {
            clocked_read_byte(bus, Line::Clock, Line::Data, BIT_TIMEOUT_MS).map(|b| kind ^ b)
        })
    })?;
    if OLD_DRIVECODE.contains(&kind) {
        session.set_variant(LoaderVariant::DreamloadOld);
    }
    let clock = match session.variant {
        LoaderVariant::DreamloadOld => Line::Atn,
        _ => Line::Clock,
    };

    let mut buf = session.alloc_system()?;
    loop {
        session.wait_request(|bus| !bus.line(clock)).await?;
        let (track, sector) = read_job(session.bus, clock)?;
        trace!("Dreamload job {}/{}", track, sector);

        match (track, sector) {
            (0, 0) => return Ok(()),
            (0, 1) => {
                // Slow down, so a disk swap has a better chance
                yield_ms!(DREAMLOAD_DIR_DELAY_MS);
                session.read(&mut buf, DIR_TRACK, DIR_START_SECTOR).await?;
                send_block(session.bus, &buf)?;
            }
            (0, _) => (),
            _ => {
                session.read(&mut buf, track, sector).await?;
                send_block(session.bus, &buf)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use crate::protocol::RxTx;
    use crate::test::disk::MemDisk;
    use crate::test::signals::ScriptedSignals;
    use crate::test::sim::{Host, SimBus};
    use embassy_futures::block_on;

    async fn host_job(host: &Host, clock: Line, track: u8, sector: u8) {
        host.clone().send_clocked(track, clock, Line::Data).await;
        host.clone().send_clocked(sector, clock, Line::Data).await;
    }

    async fn host_block(host: &Host) -> Vec<u8> {
        // ATN is pulled before each byte, as in the 1541 drivecode
        let mut out = Vec::new();
        for _ in 0..258 {
            host.set_atn(false);
            out.push(host.receive_atn_pairs().await);
        }
        out
    }

    async fn host(host: Host, drivecode_xor: u8, clock: Line, jobs: Vec<(u8, u8)>) -> Vec<Vec<u8>> {
        // Start once the drive is looking at the bus
        host.until(|w| w.reads > 0).await;
        for i in 0..DRIVECODE_LEN {
            let byte = if i == 0 { drivecode_xor } else { 0 };
            host.clone().send_clocked(byte, Line::Clock, Line::Data).await;
        }
        let mut blocks = Vec::new();
        for (track, sector) in jobs {
            host_job(&host, clock, track, sector).await;
            if track != 0 || sector == 1 {
                blocks.push(host_block(&host).await);
            }
        }
        blocks
    }

    fn run_with(disk: &mut MemDisk, bus: &mut SimBus) -> (Result<(), LoaderError>, LoaderVariant) {
        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(bus, disk, &mut signals, &pool, 0, LoaderVariant::Dreamload, RxTx::None);
        let result = block_on(run(&mut session));
        (result, session.variant)
    }

    #[test]
    fn jobs_clocked_by_clock() {
        let mut disk = MemDisk::new();
        disk.sector_mut(5, 3).copy_from_slice(&[0x5a; 256]);
        disk.sector_mut(5, 3)[7] = 0x01;

        let (mut bus, h) = SimBus::new();
        let jobs = vec![(5, 3), (0, 2), (0, 0)];
        let result = h.spawn_with_result(host(h.clone(), 0x00, Line::Clock, jobs));
        let (outcome, variant) = run_with(&mut disk, &mut bus);
        bus.finish();

        assert_eq!(outcome, Ok(()));
        assert_eq!(variant, LoaderVariant::Dreamload);
        let blocks = result.take().unwrap();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block[0], STATUS_OK);
        assert_eq!(&block[1..257], disk.sector(5, 3));
        // 255 copies of 0x5a and a 0x01
        assert_eq!(block[257], 0x5b);
        assert!(bus.drive_idle());
    }

    #[test]
    fn old_drivecode_uses_atn_for_jobs() {
        let mut disk = MemDisk::new();
        let (mut bus, h) = SimBus::new();
        let jobs = vec![(0, 1), (0, 0)];
        let result = h.spawn_with_result(host(h.clone(), 0xac, Line::Atn, jobs));
        let (outcome, variant) = run_with(&mut disk, &mut bus);
        bus.finish();

        assert_eq!(outcome, Ok(()));
        assert_eq!(variant, LoaderVariant::DreamloadOld);
        let blocks = result.take().unwrap();
        assert_eq!(&blocks[0][1..257], disk.sector(DIR_TRACK, DIR_START_SECTOR));
    }
}
