//! Final Cartridge III and EXOS.
//!
//! All of these take over a file the host opened through the standard
//! protocol: channel 0 for loading, channel 1 for saving.
//!
//! Loading sends each sector as 65 blocks of four bytes, placed at fixed
//! times after a CLOCK/DATA handshake.  The first block carries a sector
//! counter and the number of bytes in the last sector (0 for a full one).
//! The freezer's loader handshakes before every block, the others just
//! leave a gap.  The old freezer loader is simpler still, and sends the
//! file's bytes one at a time with a timed sender.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

use super::Session;
use crate::bus::{BusLines, BusState};
use crate::disk::ChainLink;
use crate::driver::{Channels, DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::timed::at;
use crate::protocol::{TimedLink, TimedPairs};
use crate::util::time::fl::{
    BIT_TIMEOUT_MS, FC3_BLOCK_GAP_US, FC3_SAVE_DELAY_MS, FC3_UNLISTEN_TIMEOUT_MS, FRAME_DELAY_MS,
    TIMED_BYTE_TIMEOUT_MS,
};
use crate::util::time::{Deadline, block_until, block_us, poll_until, yield_ms};

const LOAD_CHANNEL: u8 = 0;
const SAVE_CHANNEL: u8 = 1;

/// Four byte blocks per sector, after the first.
const BLOCKS: usize = 64;

/// Spacing of the bytes in a block, in units of 100ns.
const BYTE_SPACING: u16 = 500;

/// First byte of a sector's first block, which the host ignores.
const SECTOR_MARKER: u8 = 0x07;

/// Size byte of a saved chunk that is followed by more.
const FULL_CHUNK: u8 = 0;

/// Host to drive bytes when saving.
const SAVE_LINK: TimedLink = TimedLink::data_release(TimedPairs::FC3_GET, (true, true));

/// Send a four byte block, timed from `reference`, then let go of the bus.
fn send_block<B: BusLines>(bus: &mut B, reference: Instant, block: &[u8]) {
    for (index, &byte) in block.iter().enumerate() {
        let start = at(reference, index as u16 * BYTE_SPACING);
        TimedPairs::FC3_BLOCK.send(bus, start, byte);
    }
    block_until(at(reference, block.len() as u16 * BYTE_SPACING));
    bus.release();
}

/// We pull CLOCK, the host answers on DATA, we release CLOCK, and the host
/// releasing DATA is the reference for the next block.
fn handshake<B: BusLines>(bus: &mut B) -> Result<Instant, LoaderError> {
    let deadline = Deadline::from_ms(BIT_TIMEOUT_MS);
    bus.set_clock(false);
    wait(bus, deadline, |s| !s.contains(BusState::DATA))?;
    bus.set_clock(true);
    wait(bus, deadline, |s| s.contains(BusState::DATA))?;
    Ok(Instant::now())
}

fn wait<B: BusLines>(bus: &mut B, deadline: Deadline, done: impl Fn(BusState) -> bool) -> Result<(), LoaderError> {
    loop {
        let state = bus.read();
        if !state.contains(BusState::ATN) {
            return Err(LoaderError::HostReset);
        }
        if done(state) {
            return Ok(());
        }
        if deadline.expired() {
            return Err(LoaderError::Timeout);
        }
    }
}

/// Send one sector, after the handshake at `reference`.  `header` is the
/// first block, the 64 that follow come from `data`, which is the sector
/// from byte 3 on.
fn send_sector<B: BusLines>(
    bus: &mut B,
    reference: Instant,
    header: &[u8; 4],
    data: &[u8],
    freezed: bool,
) -> Result<(), LoaderError> {
    let gap = Duration::from_micros(FC3_BLOCK_GAP_US);
    bus.critical(|bus| {
        let start = if freezed { reference } else { reference + gap };
        send_block(bus, start, header);

        for block in data.chunks(4).take(BLOCKS) {
            if !bus.atn() {
                return Err(LoaderError::HostReset);
            }
            let start = if freezed {
                handshake(bus)?
            } else {
                Instant::now() + gap
            };
            send_block(bus, start, block);
        }
        Ok(())
    })
}

/// Load the file open on channel 0.  `freezed` selects the freezer's
/// loader, which handshakes every block.
pub async fn load<B, D, S>(session: &mut Session<'_, B, D, S>, freezed: bool) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    let Some(mut file) = session.open_channel(LOAD_CHANNEL) else {
        // Tell the host by pulling both lines
        session.bus.set_lines(false, false);
        return Ok(());
    };
    let mut buf = session.alloc()?;

    // Give the host time to blank the screen
    yield_ms!(FRAME_DELAY_MS);

    let mut block = match session.next_block(&mut file, &mut buf).await {
        Ok(Some(block)) => block,
        Ok(None) => return Ok(()),
        Err(e) => {
            session.bus.set_lines(false, false);
            return Err(e);
        }
    };
    let mut counter = 0u8;
    // The last block runs 3 bytes past the sector
    let mut padded = [0u8; 4 * BLOCKS];

    loop {
        // Wait for the host to be ready for the sector
        session.bus.set_clock(false);
        session
            .wait_request(|bus| {
                let state = bus.read();
                !state.contains(BusState::DATA) || !state.contains(BusState::ATN)
            })
            .await?;
        let reference = handshake(session.bus)?;

        let last_used = if block.is_last() { block.last_used() } else { 0 };
        let header = [SECTOR_MARKER, counter, last_used, buf[2]];
        counter = counter.wrapping_add(1);
        padded[..253].copy_from_slice(&buf[3..]);
        trace!("FC3 sector {}", counter);
        send_sector(session.bus, reference, &header, &padded, freezed)?;

        if block.is_last() {
            // DATA low tells the host this was the last sector
            session.bus.set_data(false);
            return Ok(());
        }

        block = match session.next_block(&mut file, &mut buf).await {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(()),
            Err(e) => {
                session.bus.set_lines(false, false);
                return Err(e);
            }
        };
    }
}

/// Receive a file into the one open for writing on channel 1.  Each chunk
/// starts with a size byte: 0 for 254 bytes with more to come, otherwise
/// one more than the number of bytes in the final chunk.
pub async fn save<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    if !session.disk.is_writable(SAVE_CHANNEL) {
        warn!("Nothing open for writing on channel {}", SAVE_CHANNEL);
        return Ok(());
    }

    // The host pulls DATA before it is ready
    yield_ms!(FC3_SAVE_DELAY_MS);

    let mut chunk = [0u8; 254];
    let result = loop {
        // Ready for the size byte
        session.bus.set_lines(false, true);
        if let Err(e) = session
            .wait_request(|bus| {
                let state = bus.read();
                !state.contains(BusState::DATA) || !state.contains(BusState::ATN)
            })
            .await
        {
            break Err(e);
        }
        let size = match SAVE_LINK.receive(session.bus, TIMED_BYTE_TIMEOUT_MS) {
            Ok(size) => size,
            Err(e) => break Err(e),
        };

        let (len, last) = match size {
            FULL_CHUNK => (254, false),
            size => (usize::from(size) - 1, true),
        };
        let received = chunk[..len]
            .iter_mut()
            .try_for_each(|byte| SAVE_LINK.receive(session.bus, TIMED_BYTE_TIMEOUT_MS).map(|b| *byte = b));
        if let Err(e) = received {
            break Err(e);
        }

        // Disk errors are ignored, as the cartridge would
        let _ = session.append(SAVE_CHANNEL, &chunk[..len]).await;
        if last {
            break Ok(());
        }
    };

    session.close(SAVE_CHANNEL).await?;
    result
}

/// The old freezer's loader: the file on channel 0, a byte at a time.
pub async fn load_old_freezer<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    let link = session.rxtx.timed().ok_or(LoaderError::Protocol)?.send;

    // Busy, until the host has finished its UNLISTEN
    let bus = &mut *session.bus;
    bus.set_lines(true, false);
    block_us!(1);
    if poll_until(|| bus.clock(), Deadline::from_ms(FC3_UNLISTEN_TIMEOUT_MS)).is_err() {
        debug!("No UNLISTEN");
    }

    let Some(mut file) = session.open_channel(LOAD_CHANNEL) else {
        return Ok(());
    };
    let mut buf = session.alloc()?;
    session.bus.release();

    while let Some(block) = session.next_block(&mut file, &mut buf).await? {
        send_bytes(session.bus, &link, &buf, &block)?;
        if block.is_last() {
            break;
        }
    }
    Ok(())
}

fn send_bytes<B: BusLines>(
    bus: &mut B,
    link: &TimedLink,
    buf: &Sector,
    block: &ChainLink,
) -> Result<(), LoaderError> {
    link.send_all(bus, &buf[2..=usize::from(block.last_used())], TIMED_BYTE_TIMEOUT_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use crate::loader::LoaderVariant;
    use crate::protocol::RxTx;
    use crate::test::disk::MemDisk;
    use crate::test::signals::ScriptedSignals;
    use crate::test::sim::{Host, SimBus};
    use embassy_futures::block_on;

    async fn host_handshake(host: &Host) {
        host.until(|w| !w.drive_clock).await;
        host.set_data(false);
        host.until(|w| w.drive_clock).await;
        host.set_data(true);
    }

    async fn host_block(host: &Host) -> [u8; 4] {
        let mut block = [0u8; 4];
        for byte in &mut block {
            let mut raw = 0;
            for index in 0..4 {
                host.next_write().await;
                let wire = host_wire(host);
                raw |= TimedPairs::FC3_BLOCK.bits(wire, index);
            }
            *byte = raw ^ TimedPairs::FC3_BLOCK.eor;
        }
        // Release
        host.next_write().await;
        block
    }

    fn host_wire(host: &Host) -> BusState {
        let mut state = BusState::empty();
        state.set(BusState::CLOCK, host.drive_line(crate::bus::Line::Clock));
        state.set(BusState::DATA, host.drive_line(crate::bus::Line::Data));
        state
    }

    /// Receive a whole file, returning it and the sector counters.
    async fn host_load(host: Host, freezed: bool) -> (Vec<u8>, Vec<u8>) {
        let mut file = Vec::new();
        let mut counters = Vec::new();
        loop {
            host_handshake(&host).await;
            let header = host_block(&host).await;
            counters.push(header[1]);
            let mut sector = vec![header[3]];
            for _ in 0..BLOCKS {
                if freezed {
                    host_handshake(&host).await;
                }
                sector.extend(host_block(&host).await);
            }
            match header[2] {
                0 => file.extend(&sector[..254]),
                last_used => {
                    file.extend(&sector[..usize::from(last_used) - 1]);
                    host.until(|w| !w.drive_data).await;
                    return (file, counters);
                }
            }
        }
    }

    fn run_load(disk: &mut MemDisk, bus: &mut SimBus, freezed: bool) -> Result<(), LoaderError> {
        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let variant = if freezed { LoaderVariant::Fc3Freezed } else { LoaderVariant::Fc3Load };
        let mut session = Session::new(bus, disk, &mut signals, &pool, 0, variant, RxTx::None);
        block_on(load(&mut session, freezed))
    }

    fn game() -> Vec<u8> {
        (0..600u32).map(|i| (i * 13 + 5) as u8).collect()
    }

    #[test]
    fn load_sends_sectors_in_blocks() {
        let mut disk = MemDisk::new();
        let data = game();
        let start = disk.add_file(b"GAME", &data);
        disk.open.insert(LOAD_CHANNEL, start);

        let (mut bus, host) = SimBus::new();
        let result = host.spawn_with_result(host_load(host.clone(), false));
        assert_eq!(run_load(&mut disk, &mut bus, false), Ok(()));
        bus.finish();

        let (file, counters) = result.take().unwrap();
        assert_eq!(file, data);
        assert_eq!(counters, vec![0, 1, 2]);
    }

    #[test]
    fn freezed_load_handshakes_every_block() {
        let mut disk = MemDisk::new();
        let data = game();
        let start = disk.add_file(b"GAME", &data);
        disk.open.insert(LOAD_CHANNEL, start);

        let (mut bus, host) = SimBus::new();
        let result = host.spawn_with_result(host_load(host.clone(), true));
        assert_eq!(run_load(&mut disk, &mut bus, true), Ok(()));
        bus.finish();
        assert_eq!(result.take().unwrap().0, data);
    }

    #[test]
    fn nothing_open_pulls_both_lines() {
        let mut disk = MemDisk::new();
        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        let seen = host.spawn_with_result(async move {
            h.until(|w| !w.drive_clock && !w.drive_data).await;
        });
        assert_eq!(run_load(&mut disk, &mut bus, false), Ok(()));
        bus.finish();
        assert!(seen.take().is_some());
    }

    #[test]
    fn save_appends_chunks() {
        let mut disk = MemDisk::new();
        disk.open_for_write(SAVE_CHANNEL, b"SAVED");
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        let payload = data.clone();
        host.spawn(async move {
            let (first, rest) = payload.split_at(254);
            h.send_timed(SAVE_LINK, FULL_CHUNK).await;
            for &byte in first {
                h.send_timed(SAVE_LINK, byte).await;
            }
            h.send_timed(SAVE_LINK, rest.len() as u8 + 1).await;
            for &byte in rest {
                h.send_timed(SAVE_LINK, byte).await;
            }
        });

        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(&mut bus, &mut disk, &mut signals, &pool, 0, LoaderVariant::Fc3Save, RxTx::None);
        assert_eq!(block_on(save(&mut session)), Ok(()));
        drop(session);
        bus.finish();

        assert_eq!(disk.written_file(b"SAVED"), Some(&data[..]));
        assert_eq!(disk.closed, vec![SAVE_CHANNEL]);
    }

    #[test]
    fn save_needs_a_writable_file() {
        let mut disk = MemDisk::new();
        let (mut bus, _host) = SimBus::new();
        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(&mut bus, &mut disk, &mut signals, &pool, 0, LoaderVariant::Fc3Save, RxTx::None);
        assert_eq!(block_on(save(&mut session)), Ok(()));
        drop(session);
        assert!(disk.closed.is_empty());
    }

    #[test]
    fn old_freezer_sends_bytes() {
        let mut disk = MemDisk::new();
        let data: Vec<u8> = (0..260u32).map(|i| (i ^ 0x55) as u8).collect();
        let start = disk.add_file(b"GAME", &data);
        disk.open.insert(LOAD_CHANNEL, start);

        let link = RxTx::Fc3OldFreezeNtsc.timed().unwrap().send;
        let (mut bus, host) = SimBus::new();
        let h = host.clone();
        let len = data.len();
        let result = host.spawn_with_result(async move {
            let mut out = Vec::new();
            for _ in 0..len {
                out.push(h.receive_timed(link).await);
            }
            out
        });

        let pool = BufferPool::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(
            &mut bus,
            &mut disk,
            &mut signals,
            &pool,
            0,
            LoaderVariant::Fc3OldFreezed,
            RxTx::Fc3OldFreezeNtsc,
        );
        assert_eq!(block_on(load_old_freezer(&mut session)), Ok(()));
        drop(session);
        bus.finish();
        assert_eq!(result.take(), Some(data));
    }
}
