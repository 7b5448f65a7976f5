//! ULoad Model 3, and ELoad 1 which shares its byte transfers.
//!
//! Both are driven by command bytes from the host, sent with timed pairs
//! after a DATA handshake.  Pulling ATN instead of sending a command ends
//! the loader.
//!
//! ULoad 3 works on sectors:
//!
//! | Command | Arguments     | Reply                            |
//! |---------|---------------|----------------------------------|
//! | 1       | track, sector | status, then the 256 bytes if OK |
//! | 2       | track, sector, 256 bytes | status                |
//!
//! ELoad 1 works on files, named by a zero terminated string:
//!
//! | Command | Arguments | Reply                                       |
//! |---------|-----------|---------------------------------------------|
//! | 1       | name      | the file as counted blocks, a 0 count ends  |
//! | 2       | name      | 0 if the file exists                        |

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use heapless::Vec;

use super::Session;
use crate::bus::BusLines;
use crate::constants::SECTOR_SIZE;
use crate::disk::ChainReader;
use crate::driver::{DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{TimedLink, TimedPairs};

const GET: TimedLink = TimedLink::data_release(TimedPairs::ULOAD3_GET, (true, true));
const SEND: TimedLink = TimedLink::data_release(TimedPairs::ULOAD3_SEND, (true, true));

const CMD_READ: u8 = 1;
const CMD_WRITE: u8 = 2;

const CMD_LOAD: u8 = 1;
const CMD_CHECK: u8 = 2;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 0xff;

/// Longest file name ELoad can ask for.
const MAX_NAME: usize = 16;

/// The host can take as long as it likes between commands.
const COMMAND_TIMEOUT_MS: u32 = 0;

/// Within a command bytes follow each other quickly.
const BYTE_TIMEOUT_MS: u32 = 1000;

/// Wait for the next command, `None` once the host has pulled ATN.
fn get_command<B: BusLines>(bus: &mut B) -> Result<Option<u8>, LoaderError> {
    match GET.receive(bus, COMMAND_TIMEOUT_MS) {
        Ok(command) => Ok(Some(command)),
        Err(LoaderError::HostReset) => Ok(None),
        Err(e) => Err(e),
    }
}

fn get<B: BusLines>(bus: &mut B) -> Result<u8, LoaderError> {
    GET.receive(bus, BYTE_TIMEOUT_MS)
}

fn send<B: BusLines>(bus: &mut B, bytes: &[u8]) -> Result<(), LoaderError> {
    SEND.send_all(bus, bytes, BYTE_TIMEOUT_MS)
}

fn status<T>(result: &Result<T, LoaderError>) -> u8 {
    match result {
        Ok(_) => STATUS_OK,
        Err(_) => STATUS_ERROR,
    }
}

/// Run ULoad Model 3.
pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let mut buf = session.alloc_system()?;

    loop {
        session.bus.release();
        let Some(command) = get_command(session.bus)? else {
            return Ok(());
        };
        match command {
            CMD_READ => {
                let track = get(session.bus)?;
                let sector = get(session.bus)?;
                let result = session.read(&mut buf, track, sector).await;
                send(session.bus, &[status(&result)])?;
                if result.is_ok() {
                    send(session.bus, &buf[..])?;
                }
            }
            CMD_WRITE => {
                let track = get(session.bus)?;
                let sector = get(session.bus)?;
                for index in 0..SECTOR_SIZE {
                    buf[index] = get(session.bus)?;
                }
                let result = session.write(&buf, track, sector).await;
                send(session.bus, &[status(&result)])?;
            }
            _ => debug!("ULoad 3 unknown command {:02x}", command),
        }
        session.check_keys()?;
    }
}

/// Receive a zero terminated file name.  Characters beyond the longest name
/// are dropped.
fn get_name<B: BusLines>(bus: &mut B) -> Result<Vec<u8, MAX_NAME>, LoaderError> {
    let mut name = Vec::new();
    loop {
        match get(bus)? {
            0 => return Ok(name),
            ch => {
                let _ = name.push(ch);
            }
        }
    }
}

/// Run ELoad 1.
pub async fn run_eload<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let mut buf = session.alloc()?;

    loop {
        session.bus.release();
        let Some(command) = get_command(session.bus)? else {
            return Ok(());
        };
        if command != CMD_LOAD && command != CMD_CHECK {
            debug!("ELoad unknown command {:02x}", command);
            continue;
        }

        let name = get_name(session.bus)?;
        let file = session.find_file(&mut buf, &name, false).await.ok().flatten();
        let Some(file) = file else {
            send(session.bus, &[STATUS_ERROR])?;
            continue;
        };
        if command == CMD_CHECK {
            send(session.bus, &[STATUS_OK])?;
            continue;
        }

        debug!("ELoad file from {}/{}", file.start.track, file.start.sector);
        let mut reader = ChainReader::new(file.start);
        loop {
            match session.next_block(&mut reader, &mut buf).await {
                Ok(Some(block)) => {
                    let data = &buf[2..=usize::from(block.last_used())];
                    send(session.bus, &[data.len() as u8])?;
                    send(session.bus, data)?;
                }
                Ok(None) => {
                    send(session.bus, &[0])?;
                    break;
                }
                Err(_) => {
                    send(session.bus, &[STATUS_ERROR])?;
                    break;
                }
            }
        }
    }
}
