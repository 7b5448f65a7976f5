//! Bitfire.
//!
//! Files are addressed by index in Bitfire's own directory, which lives on
//! track 18 counting down from sector 18.  Each block goes out with a small
//! header whose layout changed with nearly every release, followed by the
//! payload in reverse order, two bits per ATN edge.
//!
//! Commands arrive one bit per clock edge.  The line pairs and the polarity
//! come from the detected [`RxTx`](crate::protocol::RxTx).

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_futures::yield_now;
use embassy_time::{Duration, Instant};
use heapless::Vec;

use super::{LoaderVariant, Session};
use crate::buffers::Buffer;
use crate::bus::{BusLines, BusState, Line};
use crate::disk::{DirEntry, DirLayout, InterleaveCursor};
use crate::driver::{DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{LinePair, Receiver, clocked_write_byte, wait_atn_high, wait_atn_low};
use crate::quirks::{BITFIRE_QUIRKS, block_delay};
use crate::util::crc::{CRC_INIT, crc16_update};
use crate::util::time::fl::{
    ATN_TIMEOUT_MS, BIT_TIMEOUT_MS, BITFIRE_EOB_US, BITFIRE_FILE_DELAY_MS, BITFIRE_LOCK_TIMEOUT_MS,
};
use crate::util::time::{Deadline, block_us, poll_until, yield_ms};

/// First directory sector.  Further sectors count down from here.
const DIR_SECTOR: u8 = 18;
const DIR_TRACK: u8 = 18;

/// Highest file index plus one.
const MAX_FILES: u8 = 126;

/// Load the file after the last one loaded.
const LOAD_NEXT: u8 = 0xef;

/// Custom drivecode upload, which isn't supported.
const UPLOAD_CMD: u8 = 0x80;

/// Leave the loader.  Commands from 0xf0 up to this are disk changes.
const RESET_CMD: u8 = 0xff;
const TURN_DISK_CMD: u8 = 0xf0;

/// Fields of a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Field {
    /// Always 0
    Zero,
    /// File load address, first block only
    LoadLo,
    LoadHi,
    /// Block load address
    BlockLo,
    BlockHi,
    /// Block index within the file
    Index,
    /// High byte of the end of contiguous data.  Blocks go out in order, so
    /// this is the block's own high byte.
    Barrier,
    /// Barrier delta, shifted left by 2
    BarrierDelta,
    /// Block status
    Status,
    /// Block length, always last
    Length,
    /// File number, first block only (debug builds)
    FileNum,
}

use Field::*;

/// Header layouts, selected by the dispatcher parameter.
const HEADERS: [&[Field]; 7] = [
    &[LoadHi, LoadLo, Index, Length],                           // 0.1
    &[Zero, LoadHi, LoadLo, BlockHi, Length],                   // 0.2/0.3
    &[BarrierDelta, LoadHi, LoadLo, BlockHi, Length],           // 0.4/0.5
    &[BarrierDelta, LoadLo, LoadHi, BlockHi, Length],           // 0.6 and 0.7 pre-releases
    &[BarrierDelta, FileNum, LoadLo, LoadHi, BlockHi, Length],  // 0.7 pre-release debug
    &[BarrierDelta, LoadLo, LoadHi, Barrier, BlockHi, Length],  // 0.7
    &[Status, Barrier, BlockHi, BlockLo, Length],               // 1.x
];

const MAX_HEADER_LEN: usize = 6;

/// Build the header for block `index` of a file.
fn build_header(
    layout: &[Field],
    index: u8,
    address: u16,
    length: u16,
    file: u8,
) -> Vec<u8, MAX_HEADER_LEN> {
    let mut header = Vec::new();
    let [lo, hi] = address.to_le_bytes();
    for field in layout {
        let byte = match field {
            Zero => Some(0),
            LoadLo if index > 0 => None,
            LoadLo | BlockLo => Some(lo),
            LoadHi if index > 0 => None,
            LoadHi | BlockHi | Barrier => Some(hi),
            Index => Some(index),
            BarrierDelta => Some(match index {
                0 => 0xff << 2,
                // Makes up for the first block always being 0xff
                1 => 0x02 << 2,
                _ => 0x01 << 2,
            }),
            Status => Some(if index > 0 { 0x80 } else { 0x00 }),
            Length => Some(length as u8),
            FileNum if index == 0 => Some(file),
            FileNum => None,
        };
        if let Some(byte) = byte {
            // Layouts are never longer than the header
            let _ = header.push(byte);
        }
    }
    header
}

/// Directory layout used by a Bitfire release.
fn dir_layout(variant: LoaderVariant) -> DirLayout {
    match variant {
        LoaderVariant::Bitfire10 | LoaderVariant::Bitfire11 => DirLayout::Chained,
        LoaderVariant::Bitfire12Pr1 => DirLayout::ChainedHeader,
        LoaderVariant::Bitfire12Pr2 | LoaderVariant::Bitfire12Pr3 => DirLayout::Columns,
        _ => DirLayout::Located,
    }
}

/// Why a byte receive stopped short.
enum BitAbort {
    /// ATN went low, the host wants the bus for something else
    AtnLow,
    Timeout,
}

/// Receive the 8 bits of a byte.  A bit is valid once `clock` reaches the
/// level for that bit, low for the first one, then alternating.  Data is
/// LSB first, a high line being a 1.
fn receive_bits<B: BusLines>(bus: &mut B, clock: Line, data: Line) -> Result<u8, BitAbort> {
    let mut byte = 0u8;

    for bit in (1..=8u8).rev() {
        let want_high = bit & 1 != 0;
        let deadline = Deadline::from_ms(BIT_TIMEOUT_MS);
        loop {
            let state = bus.read();
            if state.contains(clock.mask()) == want_high {
                break;
            }
            if !state.contains(BusState::ATN) {
                return Err(BitAbort::AtnLow);
            }
            if deadline.expired() {
                return Err(BitAbort::Timeout);
            }
        }

        block_us!(1);
        if bus.line(data) {
            byte |= 0x80;
        }
        if bit > 1 {
            byte >>= 1;
        }
    }

    Ok(byte)
}

struct Bitfire<'s, 'a, B: BusLines, D, S> {
    s: &'s mut Session<'a, B, D, S>,
    dir: Buffer<'a>,
    dir_sector: u8,
    next_file: u8,
    cursor: InterleaveCursor,
    header: &'static [Field],
    layout: DirLayout,
}

impl<B, D, S> Bitfire<'_, '_, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    /// Wait for ATN to come back after the host locked the bus.  Returns
    /// true if the lock lasted long enough to count as a reset of the
    /// host side, which means waiting for a new request.
    async fn bus_locked(&mut self) -> bool {
        let start = Instant::now();
        while !self.s.bus.atn() {
            yield_now().await;
        }
        start.elapsed() >= Duration::from_millis(u64::from(BITFIRE_LOCK_TIMEOUT_MS))
    }

    /// Receive a byte.  Waiting for the host to start is not timed, but each
    /// bit is.
    async fn get_byte(&mut self, receiver: Receiver) -> Result<u8, LoaderError> {
        let clock = receiver.lines.clock();
        let data = receiver.lines.data();
        let mut wait_request = true;

        loop {
            if wait_request {
                let idle = clock.mask() | BusState::ATN;
                self.s
                    .wait_request(|bus| !bus.read().contains(idle))
                    .await?;
                wait_request = false;
            }

            if !self.s.bus.atn() {
                wait_request = self.bus_locked().await;
                continue;
            }

            match self.s.bus.critical(|bus| receive_bits(bus, clock, data)) {
                Ok(byte) => return Ok(if receiver.inverted { !byte } else { byte }),
                Err(BitAbort::Timeout) => return Err(LoaderError::Timeout),
                // Handled by the ATN check
                Err(BitAbort::AtnLow) => (),
            }
        }
    }

    /// Receive the drivecode, which we don't need, until the host stops
    /// sending it.
    async fn load_drivecode(&mut self) -> Result<(), LoaderError> {
        let end_of_byte = if self.s.variant < LoaderVariant::Bitfire06 {
            Line::Atn
        } else {
            Line::Data
        };
        let receiver = Receiver::new(LinePair::DataClock, false);

        self.s.bus.set_lines(false, false);
        wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;
        self.s.bus.release();

        let mut count = 0u32;
        loop {
            match self.get_byte(receiver).await {
                Ok(_) => count += 1,
                Err(LoaderError::Timeout) => break,
                Err(e) => return Err(e),
            }

            // The host pulls the end of byte line after every byte but the
            // last
            let gap = Deadline::after(Duration::from_micros(BITFIRE_EOB_US));
            if poll_until(|| !self.s.bus.line(end_of_byte), gap).is_err() {
                break;
            }
        }
        debug!("Bitfire drivecode: {} bytes", count);

        self.s.bus.set_data(false);
        Ok(())
    }

    async fn load_dir(&mut self, index: u8) -> Result<(), LoaderError> {
        let sector = DIR_SECTOR - index;
        self.s.read(&mut self.dir, DIR_TRACK, sector).await?;
        self.dir_sector = index;
        // Reading the directory is what counts as noticing a disk change
        let _ = self.s.signals.take_dir_changed();
        Ok(())
    }

    /// Make sure the directory sector holding `file` is loaded, and return
    /// the file's index within it.
    async fn update_dir(&mut self, file: u8) -> Result<u8, LoaderError> {
        let per_sector = self.layout.entries_per_sector();
        let sector = file / per_sector;
        if sector != self.dir_sector {
            self.load_dir(sector).await?;
        }
        Ok(file % per_sector)
    }

    async fn load_file(&mut self, file: u8) -> Result<(), LoaderError> {
        let file = if file == LOAD_NEXT { self.next_file } else { file };
        if file >= MAX_FILES {
            warn!("Bitfire file {} out of range", file);
            return Err(LoaderError::Protocol);
        }

        let delay = block_delay(BITFIRE_QUIRKS, self.s.file_crc);
        self.s.file_crc = CRC_INIT;

        let index = self.update_dir(file).await?;
        let entry = self.layout.entry(&self.dir, index);
        let mut address = entry.address();
        let mut remaining = entry.bytes();
        match entry {
            DirEntry::Located { start, .. } => {
                self.cursor = InterleaveCursor::new(
                    start.track,
                    start.sector,
                    InterleaveCursor::STD_INTERLEAVE,
                );
            }
            DirEntry::Chained { .. } => {
                if self.s.variant >= LoaderVariant::Bitfire12Pr1 {
                    address = address.wrapping_add(0x100);
                }
                // Sequential loads carry on from where the last file ended
                if file != self.next_file || self.next_file == 0 {
                    let zoned = self.s.variant == LoaderVariant::Bitfire12Pr3;
                    self.cursor = self.layout.locate(&self.dir, index, zoned, self.s.geometry());
                }
            }
        }
        debug!(
            "Bitfire file {} at {}/{}+{} to {:04x}, {} bytes",
            file, self.cursor.track, self.cursor.sector, self.cursor.offset, address, remaining
        );

        let mut buf = self.s.alloc()?;
        yield_ms!(BITFIRE_FILE_DELAY_MS);

        let mut index = 0u8;
        loop {
            self.s.read(&mut buf, self.cursor.track, self.cursor.sector).await?;
            if delay > 0 {
                yield_ms!(u64::from(delay));
            }

            let offset = u32::from(self.cursor.offset);
            let length = if offset + remaining > 0x100 {
                0x100 - offset
            } else {
                remaining
            };
            let header = build_header(self.header, index, address, length as u16, file);

            let first = usize::from(self.cursor.offset);
            let payload = &buf[first..first + length as usize];
            let variant = self.s.variant;
            let mut crc = self.s.file_crc;
            self.s.bus.critical(|bus| {
                bus.set_clock(false);

                if variant == LoaderVariant::Bitfire01 {
                    // 0.1 pulses ATN instead of taking a shifted first byte
                    wait_atn_low(bus, ATN_TIMEOUT_MS)?;
                    wait_atn_high(bus);
                }

                for &byte in &header {
                    clocked_write_byte(bus, byte, None, ATN_TIMEOUT_MS)?;
                }
                for &byte in payload.iter().rev() {
                    clocked_write_byte(bus, byte, None, ATN_TIMEOUT_MS)?;
                    crc = crc16_update(crc, byte);
                }

                // The last pair hasn't been picked up yet
                wait_atn_high(bus);
                bus.set_clock(true);
                bus.set_data(false);
                Ok::<(), LoaderError>(())
            })?;
            self.s.file_crc = crc;

            self.cursor.offset = (offset + length) as u8;
            if self.cursor.offset == 0 {
                self.cursor.advance(self.s.geometry());
            }

            remaining -= length;
            if remaining == 0 {
                break;
            }
            address = address.wrapping_add(length as u16);
            index = index.wrapping_add(1);
        }

        self.next_file = file + 1;
        Ok(())
    }

    /// Wait until the disk with id `id` is inserted.
    async fn turn_disk(&mut self, id: u8) -> Result<(), LoaderError> {
        let offset = if self.s.variant >= LoaderVariant::Bitfire12Pr1 {
            0x03
        } else {
            0xff
        };

        loop {
            self.load_dir(0).await?;
            if self.dir[offset] == id {
                break;
            }
            info!("Bitfire wants disk {:02x}", id);
            self.s.wait_disk_change(|bus| !bus.atn()).await?;
        }

        self.next_file = 0;
        Ok(())
    }

    /// Older releases expect ATN pulses to confirm a disk change.
    async fn ack_disk_change(&mut self) -> Result<(), LoaderError> {
        self.s.bus.set_clock(false);
        self.s.wait_request(|bus| !bus.atn()).await?;
        self.s.wait_request(|bus| bus.atn()).await?;
        if self.s.variant == LoaderVariant::Bitfire03 {
            wait_atn_low(self.s.bus, 10)?;
            wait_atn_high(self.s.bus);
        }
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), LoaderError> {
        let receiver = self.s.rxtx.receiver().ok_or(LoaderError::Protocol)?;

        self.load_dir(0).await?;
        self.load_drivecode().await?;

        // 0.7 and later still hold ATN here
        wait_atn_high(self.s.bus);

        loop {
            self.s.bus.release();
            block_us!(2);

            let cmd = self.get_byte(receiver).await?;
            self.s.bus.set_data(false);
            trace!("Bitfire command {:02x}", cmd);

            match cmd {
                UPLOAD_CMD => {
                    warn!("Bitfire drivecode upload not supported");
                    return Ok(());
                }
                RESET_CMD => return Ok(()),
                TURN_DISK_CMD.. => {
                    self.turn_disk(cmd).await?;
                    if self.s.variant <= LoaderVariant::Bitfire03 {
                        self.ack_disk_change().await?;
                    }
                }
                file => self.load_file(file).await?,
            }
        }
    }
}

/// Run a Bitfire session.  `header` selects the block header layout.
pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>, header: u8) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let header = HEADERS
        .get(usize::from(header))
        .copied()
        .ok_or(LoaderError::Protocol)?;
    let dir = session.alloc_system()?;
    let layout = dir_layout(session.variant);

    let mut bitfire = Bitfire {
        s: session,
        dir,
        dir_sector: 0,
        next_file: 0,
        cursor: InterleaveCursor::new(0, 0, InterleaveCursor::STD_INTERLEAVE),
        header,
        layout,
    };
    bitfire.serve().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_block_headers() {
        let h = build_header(HEADERS[6], 0, 0x0801, 0xfe, 3);
        assert_eq!(h.as_slice(), &[0x00, 0x08, 0x08, 0x01, 0xfe]);
        let h = build_header(HEADERS[5], 0, 0x0801, 0x10, 3);
        assert_eq!(h.as_slice(), &[0xfc, 0x01, 0x08, 0x08, 0x08, 0x10]);
        let h = build_header(HEADERS[4], 0, 0x2000, 0x00, 7);
        assert_eq!(h.as_slice(), &[0xfc, 7, 0x00, 0x20, 0x20, 0x00]);
        let h = build_header(HEADERS[0], 0, 0xc000, 0x40, 0);
        assert_eq!(h.as_slice(), &[0xc0, 0x00, 0x00, 0x40]);
    }

    #[test]
    fn later_block_headers_drop_load_address() {
        let h = build_header(HEADERS[5], 1, 0x0900, 0x80, 3);
        assert_eq!(h.as_slice(), &[0x08, 0x09, 0x09, 0x80]);
        let h = build_header(HEADERS[4], 2, 0x0a00, 0x80, 3);
        assert_eq!(h.as_slice(), &[0x04, 0x0a, 0x80]);
        let h = build_header(HEADERS[1], 1, 0x0900, 0x01, 0);
        assert_eq!(h.as_slice(), &[0x00, 0x09, 0x01]);
        let h = build_header(HEADERS[6], 1, 0x0900, 0x00, 0);
        assert_eq!(h.as_slice(), &[0x80, 0x09, 0x09, 0x00, 0x00]);
    }

    #[test]
    fn headers_fit() {
        for layout in HEADERS {
            assert!(layout.len() <= MAX_HEADER_LEN);
            assert_eq!(layout.last(), Some(&Length));
        }
    }

    #[test]
    fn layouts_by_release() {
        assert_eq!(dir_layout(LoaderVariant::Bitfire07), DirLayout::Located);
        assert_eq!(dir_layout(LoaderVariant::Bitfire11), DirLayout::Chained);
        assert_eq!(dir_layout(LoaderVariant::Bitfire12Pr1), DirLayout::ChainedHeader);
        assert_eq!(dir_layout(LoaderVariant::Bitfire12Pr3), DirLayout::Columns);
    }

    #[test]
    fn receive_bits_lsb_first() {
        use crate::test::sim::SimBus;
        for byte in [0x00u8, 0xff, 0x35, 0x80] {
            let (mut bus, host) = SimBus::new();
            // send_clocked puts inverted data on the line
            host.spawn(host.clone().send_clocked(!byte, Line::Clock, Line::Data));
            let got = receive_bits(&mut bus, Line::Clock, Line::Data).ok();
            assert_eq!(got, Some(byte));
        }
    }

    #[test]
    fn receive_bits_stops_on_atn() {
        use crate::test::sim::SimBus;
        let (mut bus, host) = SimBus::new();
        host.set_atn(false);
        assert!(matches!(
            receive_bits(&mut bus, Line::Clock, Line::Data),
            Err(BitAbort::AtnLow)
        ));
    }
}
