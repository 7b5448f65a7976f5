//! GI Joe, and the loaders derived from it.
//!
//! The host clocks every bit with CLOCK, both edges carrying one, in each
//! direction.  It asks for a file by name, up to 16 characters ending with
//! a 0, and the file comes back as a plain byte stream in which 0xac is
//! an escape: a doubled 0xac is the byte itself, 0xac 0xff ends the file
//! and 0xac 0xf7 reports an error.
//!
//! Once the drivecode is running the host can ask for any number of files,
//! until it pulls ATN between them.  ATN isn't a reliable abort in the
//! middle of a transfer, so there only the keys end the loader.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use heapless::Vec;

use super::Session;
use crate::bus::{BusLines, Line};
use crate::disk::ChainReader;
use crate::driver::{DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_read_after_edge, clocked_read_byte, clocked_send_byte};
use crate::util::time::fl::{ATN_TIMEOUT_MS, BIT_TIMEOUT_MS, GIJOE_SETTLE_MS};
use crate::util::time::yield_ms;

const ESCAPE: u8 = 0xac;
const END: u8 = 0xff;
const ERROR: u8 = 0xf7;
const NOT_FOUND: [u8; 4] = [0xfe, 0xfe, ESCAPE, ERROR];

pub const MAX_NAME: usize = 16;

/// Receive a byte whose first CLOCK edge has already been seen.
pub fn read_after_edge<B: BusLines>(bus: &mut B) -> Result<u8, LoaderError> {
    Ok(bus.critical(|bus| clocked_read_after_edge(bus, Line::Clock, Line::Data, BIT_TIMEOUT_MS))?)
}

/// Receive a byte, waiting for its first edge.
pub fn read_byte<B: BusLines>(bus: &mut B) -> Result<u8, LoaderError> {
    Ok(bus.critical(|bus| clocked_read_byte(bus, Line::Clock, Line::Data, ATN_TIMEOUT_MS))?)
}

pub fn send_byte<B: BusLines>(bus: &mut B, byte: u8) -> Result<(), LoaderError> {
    Ok(bus.critical(|bus| clocked_send_byte(bus, byte, Line::Clock, Line::Data, ATN_TIMEOUT_MS))?)
}

fn send_escaped<B: BusLines>(bus: &mut B, data: &[u8]) -> Result<(), LoaderError> {
    for &byte in data {
        send_byte(bus, byte)?;
        if byte == ESCAPE {
            send_byte(bus, ESCAPE)?;
        }
    }
    Ok(())
}

/// Wait for the host to start sending a name, and receive it.
pub async fn get_name<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<Vec<u8, MAX_NAME>, LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    session
        .wait_request(|bus| !bus.clock() || !bus.atn())
        .await?;
    if !session.bus.atn() {
        return Err(LoaderError::HostReset);
    }

    // Characters past the longest name are dropped
    let mut name = Vec::new();
    let mut ch = read_after_edge(session.bus)?;
    while ch != 0 {
        let _ = name.push(ch);
        ch = read_byte(session.bus)?;
    }
    Ok(name)
}

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    session.bus.release();
    yield_ms!(GIJOE_SETTLE_MS);
    session
        .wait_request(|bus| bus.clock() && bus.data())
        .await?;

    let mut buf = session.alloc()?;
    loop {
        session.bus.release();
        let name = get_name(session).await?;
        let file = session.find_file(&mut buf, &name, false).await.ok().flatten();
        let Some(file) = file else {
            debug!("GI Joe file not found");
            for byte in NOT_FOUND {
                send_byte(session.bus, byte)?;
            }
            continue;
        };

        debug!("GI Joe file from {}/{}", file.start.track, file.start.sector);
        let mut reader = ChainReader::new(file.start);
        loop {
            match session.next_block(&mut reader, &mut buf).await {
                Ok(Some(block)) => {
                    send_escaped(session.bus, &buf[2..=usize::from(block.last_used())])?;
                    if block.is_last() {
                        send_byte(session.bus, ESCAPE)?;
                        send_byte(session.bus, END)?;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    send_byte(session.bus, ESCAPE)?;
                    send_byte(session.bus, ERROR)?;
                    break;
                }
            }
        }
    }
}
