//! Sam's Journey.
//!
//! The game's files are named with two hex digits.  The host sends a
//! command byte, an argument length and the arguments, a bit at a time with
//! a two line handshake, and we answer with blocks sent two bits at a time
//! clocked by ATN.  Each block is a length, a marker and up to 254 bytes.
//!
//! | Command | Arguments       | Action                                  |
//! |---------|-----------------|-----------------------------------------|
//! | 1       |                 | List the PRG files                      |
//! | 2       | name            | Read a file                             |
//! | 3       | name            | Write a file                            |
//! | 0x82    | track, sector   | Read the file named after the track/sector |
//! | 0x83    | track, sector   | Write the file named after the track/sector |

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::Session;
use crate::bus::{BusLines, BusState};
use crate::constants::{DIR_START_SECTOR, DIR_TRACK, FILE_TYPE_MASK, FILE_TYPE_PRG};
use crate::disk::{ChainReader, DirSearch, TrackSector};
use crate::driver::{Channels, DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_write_byte, wait_atn_high};
use crate::util::time::fl::{ATN_TIMEOUT_MS, BIT_TIMEOUT_MS, SAMSJOURNEY_START_DELAY_MS};
use crate::util::time::{Deadline, block_us, yield_ms};

const CMD_DIRECTORY: u8 = 1;
const CMD_READ: u8 = 2;
const CMD_WRITE: u8 = 3;
const CMD_READ_TS: u8 = 0x82;
const CMD_WRITE_TS: u8 = 0x83;

/// Arguments beyond this are received but dropped.
const MAX_ARGS: usize = 4;

/// Block markers.
const MORE: u8 = 0;
const LAST: u8 = 1;
const ERROR: u8 = 0xff;

/// Name of the file that can't exist, used for bad track/sector arguments.
const NO_NAME: u8 = 0xff;

const WRITE_CHANNEL: u8 = 1;

/// Bit order of the bytes we send, after inverting them.
const SEND_ORDER: [u8; 8] = [0x80, 0x20, 0x40, 0x10, 0x08, 0x02, 0x04, 0x01];

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn hex_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// The number a file name stands for, 0xff if it isn't two hex digits.
fn name_number(name: &[u8]) -> u8 {
    match (hex_digit(name[0]), hex_digit(name[1])) {
        (Some(high), Some(low)) => high << 4 | low,
        _ => NO_NAME,
    }
}

fn file_name(number: u8) -> [u8; 2] {
    [HEX[usize::from(number >> 4)], HEX[usize::from(number & 0x0f)]]
}

/// Files 0x00 to 0xff map onto tracks 1 to 16, sectors 0 to 15.
fn ts_name(track: u8, sector: u8) -> u8 {
    if track == 0 || track > 16 || sector > 15 {
        return NO_NAME;
    }
    (track - 1) << 4 | sector
}

/// Wait for the lines to satisfy `done`, failing if the host pulls ATN.
fn wait_lines<B: BusLines>(
    bus: &mut B,
    deadline: Deadline,
    done: impl Fn(BusState) -> bool,
) -> Result<BusState, LoaderError> {
    loop {
        let state = bus.read();
        if !state.contains(BusState::ATN) {
            return Err(LoaderError::HostReset);
        }
        if done(state) {
            return Ok(state);
        }
        if deadline.expired() {
            return Err(LoaderError::Timeout);
        }
    }
}

const BOTH: BusState = BusState::CLOCK.union(BusState::DATA);

struct Journey<'s, 'a, B: BusLines, D, S> {
    session: &'s mut Session<'a, B, D, S>,
    buf: &'s mut Sector,
}

impl<B, D, S> Journey<'_, '_, B, D, S>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    /// Receive a byte.  For each bit the host pulls DATA for a 1 or CLOCK
    /// for a 0, we acknowledge on the other line, and the host lets go.
    async fn get_byte(&mut self) -> Result<u8, LoaderError> {
        let mut byte = 0u8;
        for bit in 0..8 {
            self.session.bus.set_lines(true, true);
            block_us!(2);

            if bit == 0 {
                // The host may take a while to make its next request
                self.session
                    .wait_request(|bus| {
                        let state = bus.read();
                        !state.contains(BusState::ATN) || !state.contains(BOTH)
                    })
                    .await?;
            }
            let bus = &mut *self.session.bus;
            let state = wait_lines(bus, Deadline::from_ms(BIT_TIMEOUT_MS), |s| !s.contains(BOTH))?;

            byte >>= 1;
            if state.contains(BusState::DATA) {
                bus.set_data(false);
            } else {
                byte |= 0x80;
                bus.set_clock(false);
            }
            block_us!(2);

            wait_lines(bus, Deadline::from_ms(BIT_TIMEOUT_MS), |s| s.intersects(BOTH))?;
        }
        Ok(byte)
    }

    /// Send a block.  The host pulls ATN when it is ready, we pull both
    /// lines in reply, and the bytes follow.
    async fn send_block(&mut self, marker: u8, data: &[u8]) -> Result<(), LoaderError> {
        self.session.bus.set_lines(true, true);
        self.session.wait_request(|bus| !bus.atn()).await?;

        // Data blocks are at most 254 bytes
        let len = (data.len() + 2) as u8;
        self.session.bus.critical(|bus| {
            bus.set_lines(false, false);
            for &byte in [len, marker].iter().chain(data) {
                clocked_write_byte(bus, !byte, Some(&SEND_ORDER), ATN_TIMEOUT_MS)?;
            }
            wait_atn_high(bus);
            bus.set_lines(false, false);
            Ok(())
        })
    }

    async fn send_error(&mut self) -> Result<(), LoaderError> {
        self.send_block(ERROR, &[]).await
    }

    async fn directory(&mut self) -> Result<(), LoaderError> {
        let mut search = DirSearch::new(TrackSector::new(DIR_TRACK, DIR_START_SECTOR));
        let mut entry: Option<[u8; 3]> = None;
        loop {
            let found = search
                .next_match(&mut *self.session.disk, self.buf, self.session.part, b"*")
                .await;
            let file = match found {
                Ok(Some(file)) => file,
                Ok(None) => break,
                Err(e) => {
                    warn!("Directory read failed: {}", e);
                    return self.send_error().await;
                }
            };
            if file.file_type & FILE_TYPE_MASK != FILE_TYPE_PRG {
                continue;
            }

            // Held back a step, so the last one goes with the last marker
            if let Some(previous) = entry {
                self.send_block(MORE, &previous).await?;
            }
            let number = name_number(&file.name);
            entry = Some([number, (number >> 4).wrapping_add(1), number & 0x0f]);
        }
        self.send_block(LAST, &entry.unwrap_or([0xff, 0, 0])).await
    }

    async fn find(&mut self, number: u8) -> Result<Option<ChainReader>, LoaderError> {
        let name = file_name(number);
        let file = self.session.find_file(self.buf, &name, false).await?;
        Ok(file.map(|f| ChainReader::new(f.start)))
    }

    async fn read_file(&mut self, number: u8) -> Result<(), LoaderError> {
        debug!("Sam's Journey read {:02x}", number);
        let mut file = match self.find(number).await {
            Ok(Some(file)) => file,
            Ok(None) | Err(LoaderError::Media(_)) => return self.send_error().await,
            Err(e) => return Err(e),
        };

        loop {
            let block = match self.session.next_block(&mut file, self.buf).await {
                Ok(Some(block)) => block,
                Ok(None) => return Ok(()),
                Err(_) => return self.send_error().await,
            };
            let marker = if block.is_last() { LAST } else { MORE };
            let data = &self.buf[2..2 + block.data_len()];
            let mut copy = [0u8; 254];
            copy[..data.len()].copy_from_slice(data);
            self.send_block(marker, &copy[..data.len()]).await?;
            if block.is_last() {
                return Ok(());
            }
        }
    }

    /// Receive a file, as length prefixed chunks ending with an empty one.
    /// Returns false if the host gave up part way.
    async fn write_file(&mut self, number: u8) -> Result<bool, LoaderError> {
        debug!("Sam's Journey write {:02x}", number);
        let name = file_name(number);
        if self.session.create_file(WRITE_CHANNEL, &name).await.is_err() {
            self.send_error().await?;
            return Ok(true);
        }
        self.send_block(MORE, &[]).await?;

        let mut complete = false;
        loop {
            let len = match self.get_byte().await {
                Ok(len) => len,
                Err(LoaderError::HostReset) => break,
                Err(e) => return Err(e),
            };
            if len == 0 {
                complete = true;
                break;
            }
            let mut chunk = [0u8; 255];
            for byte in chunk.iter_mut().take(usize::from(len)) {
                *byte = self.get_byte().await?;
            }
            // The host doesn't hear about disk errors
            let _ = self.session.append(WRITE_CHANNEL, &chunk[..usize::from(len)]).await;
        }

        self.session.close(WRITE_CHANNEL).await?;
        Ok(complete)
    }

    async fn serve(&mut self) -> Result<(), LoaderError> {
        loop {
            let command = match self.get_byte().await {
                Ok(command) => command,
                // ATN ends the loader
                Err(LoaderError::HostReset) => return Ok(()),
                Err(e) => return Err(e),
            };
            let len = self.get_byte().await?;
            let mut args = [0u8; MAX_ARGS];
            for i in 0..usize::from(len) {
                let byte = self.get_byte().await?;
                if let Some(arg) = args.get_mut(i) {
                    *arg = byte;
                }
            }
            trace!("Sam's Journey command {:02x}", command);

            let carry_on = match command {
                CMD_DIRECTORY => self.directory().await.map(|_| true),
                CMD_READ => self.read_file(args[0]).await.map(|_| true),
                CMD_WRITE => self.write_file(args[0]).await,
                CMD_READ_TS => self.read_file(ts_name(args[0], args[1])).await.map(|_| true),
                CMD_WRITE_TS => self.write_file(ts_name(args[0], args[1])).await,
                _ => self.send_error().await.map(|_| true),
            }?;
            if !carry_on {
                return Ok(());
            }
        }
    }
}

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    let mut buf = session.alloc()?;
    yield_ms!(SAMSJOURNEY_START_DELAY_MS);
    Journey {
        session,
        buf: &mut buf,
    }
    .serve()
    .await
}
