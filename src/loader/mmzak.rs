//! MMZAK.
//!
//! A sector loader with the same CLOCK clocked bit transfer as GI Joe, in
//! both directions.  Each job starts with a command byte:
//!
//! | Command | Arguments                | Reply                     |
//! |---------|--------------------------|---------------------------|
//! | 1       | track, sector            | status, then 256 bytes if OK |
//! | 2       | track, sector, 256 bytes | status                    |
//! | 3       |                          | none, the loader ends     |
//!
//! Pulling ATN while we wait for a command also ends the loader.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{Session, gijoe};
use crate::bus::BusLines;
use crate::driver::{DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

const CMD_READ: u8 = 1;
const CMD_WRITE: u8 = 2;
const CMD_EXIT: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

fn send_all<B: BusLines>(bus: &mut B, bytes: &[u8]) -> Result<(), LoaderError> {
    bytes.iter().try_for_each(|&byte| gijoe::send_byte(bus, byte))
}

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let mut buf = session.alloc_system()?;

    loop {
        session.bus.release();
        session
            .wait_request(|bus| !bus.clock() || !bus.atn())
            .await?;
        if !session.bus.atn() {
            debug!("MMZAK ended by ATN");
            return Ok(());
        }

        let command = gijoe::read_after_edge(session.bus)?;
        match command {
            CMD_READ => {
                let track = gijoe::read_byte(session.bus)?;
                let sector = gijoe::read_byte(session.bus)?;
                match session.read(&mut buf, track, sector).await {
                    Ok(()) => {
                        gijoe::send_byte(session.bus, STATUS_OK)?;
                        send_all(session.bus, &buf[..])?;
                    }
                    Err(_) => gijoe::send_byte(session.bus, STATUS_ERROR)?,
                }
            }
            CMD_WRITE => {
                let track = gijoe::read_byte(session.bus)?;
                let sector = gijoe::read_byte(session.bus)?;
                for byte in buf.iter_mut() {
                    *byte = gijoe::read_byte(session.bus)?;
                }
                let status = match session.write(&buf, track, sector).await {
                    Ok(()) => STATUS_OK,
                    Err(_) => STATUS_ERROR,
                };
                gijoe::send_byte(session.bus, status)?;
            }
            CMD_EXIT => return Ok(()),
            _ => {
                warn!("MMZAK unknown command {:02x}", command);
                return Err(LoaderError::Protocol);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use crate::bus::Line;
    use crate::disk::TrackSector;
    use crate::loader::LoaderVariant;
    use crate::protocol::RxTx;
    use crate::test::disk::MemDisk;
    use crate::test::signals::ScriptedSignals;
    use crate::test::sim::{Host, SimBus};
    use embassy_futures::block_on;

    async fn host_send(host: &Host, bytes: &[u8]) {
        for &byte in bytes {
            host.clone().send_clocked(byte, Line::Clock, Line::Data).await;
        }
    }

    async fn host_receive(host: &Host, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..count {
            out.push(host.clone().receive_clocked(Line::Clock, Line::Data).await);
        }
        out
    }

    fn run_with(disk: &mut MemDisk, bus: &mut SimBus) -> Result<(), LoaderError> {
        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(bus, disk, &mut signals, &pool, 0, LoaderVariant::Mmzak, RxTx::None);
        block_on(run(&mut session))
    }

    #[test]
    fn reads_and_writes_until_exit() {
        let mut disk = MemDisk::new();
        disk.sector_mut(18, 1).copy_from_slice(&[0x18; 256]);
        let block: Vec<u8> = (0..=255u8).rev().collect();

        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        let data = block.clone();
        let result = host.spawn_with_result(async move {
            h.until(|w| w.reads > 0).await;
            host_send(&h, &[CMD_READ, 18, 1]).await;
            let read = host_receive(&h, 257).await;
            host_send(&h, &[CMD_WRITE, 30, 2]).await;
            host_send(&h, &data).await;
            let written = host_receive(&h, 1).await;
            host_send(&h, &[CMD_EXIT]).await;
            (read, written)
        });
        assert_eq!(run_with(&mut disk, &mut bus), Ok(()));
        bus.finish();

        let (read, written) = result.take().unwrap();
        assert_eq!(read[0], STATUS_OK);
        assert!(read[1..].iter().all(|&b| b == 0x18));
        assert_eq!(written, vec![STATUS_OK]);
        assert_eq!(&disk.sector(30, 2)[..], &block[..]);
    }

    #[test]
    fn failed_read_sends_only_the_status() {
        let mut disk = MemDisk::new();
        disk.bad_sector = Some(TrackSector::new(2, 2));
        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        let result = host.spawn_with_result(async move {
            h.until(|w| w.reads > 0).await;
            host_send(&h, &[CMD_READ, 2, 2]).await;
            let status = host_receive(&h, 1).await;
            h.set_atn(false);
            status
        });
        assert_eq!(run_with(&mut disk, &mut bus), Ok(()));
        bus.finish();
        assert_eq!(result.take(), Some(vec![STATUS_ERROR]));
    }

    #[test]
    fn unknown_command() {
        let mut disk = MemDisk::new();
        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        host.spawn(async move {
            h.until(|w| w.reads > 0).await;
            host_send(&h, &[0x42]).await;
        });
        assert_eq!(run_with(&mut disk, &mut bus), Err(LoaderError::Protocol));
    }
}
