//! Nippon.
//!
//! A plain sector loader.  The host sends a track and sector clocked by
//! ATN, and gets the 256 bytes back two bits at a time, also clocked by
//! ATN.  Track 0 ends the loader.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::Session;
use crate::bus::{BusLines, Line};
use crate::driver::{DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_read_after_edge, clocked_read_byte, clocked_write_byte, wait_atn_high};
use crate::util::time::fl::{ATN_TIMEOUT_MS, BIT_TIMEOUT_MS};

const END_TRACK: u8 = 0;

fn read_job<B: BusLines>(bus: &mut B) -> Result<(u8, u8), LoaderError> {
    bus.critical(|bus| {
        let track = clocked_read_after_edge(bus, Line::Atn, Line::Data, BIT_TIMEOUT_MS)?;
        let sector = clocked_read_byte(bus, Line::Atn, Line::Data, BIT_TIMEOUT_MS)?;
        Ok((track, sector))
    })
}

fn send_block<B: BusLines>(bus: &mut B, block: &Sector) -> Result<(), LoaderError> {
    bus.critical(|bus| {
        for &byte in block {
            clocked_write_byte(bus, byte, None, ATN_TIMEOUT_MS)?;
        }
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
    let mut buf = session.alloc_system()?;

    loop {
        session.wait_request(|bus| !bus.atn()).await?;
        let (track, sector) = read_job(session.bus)?;
        if track == END_TRACK {
            return Ok(());
        }
        trace!("Nippon {}/{}", track, sector);
        session.read(&mut buf, track, sector).await?;
        send_block(session.bus, &buf)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use crate::disk::TrackSector;
    use crate::loader::LoaderVariant;
    use crate::protocol::RxTx;
    use crate::test::disk::MemDisk;
    use crate::test::signals::ScriptedSignals;
    use crate::test::sim::{Host, SimBus};
    use embassy_futures::block_on;

    async fn host_job(host: &Host, track: u8, sector: u8) {
        host.clone().send_clocked(track, Line::Atn, Line::Data).await;
        host.clone().send_clocked(sector, Line::Atn, Line::Data).await;
    }

    async fn host_block(host: &Host) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..256 {
            out.push(host.receive_atn_pairs().await);
        }
        out
    }

    fn run_with(disk: &mut MemDisk, bus: &mut SimBus) -> Result<(), LoaderError> {
        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(bus, disk, &mut signals, &pool, 0, LoaderVariant::Nippon, RxTx::None);
        block_on(run(&mut session))
    }

    #[test]
    fn sectors_until_track_zero() {
        let mut disk = MemDisk::new();
        let first: Vec<u8> = (0..=255u8).collect();
        disk.sector_mut(17, 3).copy_from_slice(&first);
        disk.sector_mut(20, 0).copy_from_slice(&[0x20; 256]);

        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        let result = host.spawn_with_result(async move {
            h.until(|w| w.reads > 0).await;
            host_job(&h, 17, 3).await;
            let a = host_block(&h).await;
            host_job(&h, 20, 0).await;
            let b = host_block(&h).await;
            host_job(&h, 0, 0).await;
            (a, b)
        });
        assert_eq!(run_with(&mut disk, &mut bus), Ok(()));
        bus.finish();

        let (a, b) = result.take().unwrap();
        assert_eq!(a, first);
        assert!(b.iter().all(|&byte| byte == 0x20));
        assert_eq!(
            *disk.reads.borrow(),
            vec![TrackSector::new(17, 3), TrackSector::new(20, 0)]
        );
    }

    #[test]
    fn read_error_ends_the_loader() {
        let mut disk = MemDisk::new();
        disk.bad_sector = Some(TrackSector::new(9, 9));
        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        host.spawn(async move {
            h.until(|w| w.reads > 0).await;
            host_job(&h, 9, 9).await;
        });
        assert!(matches!(run_with(&mut disk, &mut bus), Err(LoaderError::Media(_))));
    }
}
