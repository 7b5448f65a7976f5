//! Turbodisk.
//!
//! The file name travels in the M-E command itself, after its length at
//! offset 9.  We look the file up and send it a sector at a time with timed
//! pairs, holding CLOCK between bytes while we're busy.  Each sector starts
//! with a status: 1 if more follow, 0 for the last one, 0xff if the file
//! couldn't be read.  The first sector carries the load address separately,
//! and the last one its length.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::Session;
use crate::bus::BusLines;
use crate::disk::ChainReader;
use crate::driver::{Command, DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{TimedLink, TimedPairs};
use crate::util::time::fl::TIMED_BYTE_TIMEOUT_MS;

const NAME_LEN: usize = 9;
const NAME: usize = 10;

const STATUS_LAST: u8 = 0;
const STATUS_MORE: u8 = 1;
const STATUS_ERROR: u8 = 0xff;

const LINK: TimedLink = TimedLink::data_release(TimedPairs::TURBODISK, (false, true));

fn send<B: BusLines>(bus: &mut B, bytes: &[u8]) -> Result<(), LoaderError> {
    LINK.send_all(bus, bytes, TIMED_BYTE_TIMEOUT_MS)
}

/// The file name in the command, if it fits.
fn file_name<'c>(command: &Command<'c>) -> Option<&'c [u8]> {
    let len = usize::from(command.byte(NAME_LEN));
    command.bytes().get(NAME..NAME + len)
}

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>, command: &Command<'_>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    session.bus.set_clock(false);
    let mut buf = session.alloc()?;

    let file = match file_name(command) {
        Some(name) => session.find_file(&mut buf, name, false).await?,
        None => None,
    };
    let Some(file) = file else {
        debug!("Turbodisk file not found");
        return send(session.bus, &[STATUS_ERROR]);
    };

    let mut reader = ChainReader::new(file.start);
    let mut first = true;
    loop {
        let block = match session.next_block(&mut reader, &mut buf).await {
            Ok(Some(block)) => block,
            Ok(None) => break,
            Err(e) => {
                send(session.bus, &[STATUS_ERROR])?;
                return Err(e);
            }
        };

        let status = if block.is_last() { STATUS_LAST } else { STATUS_MORE };
        send(session.bus, &[status])?;

        let mut start = 2;
        if first {
            send(session.bus, &buf[2..4])?;
            start = 4;
        }
        let end = usize::from(block.last_used()) + 1;
        if block.is_last() {
            send(session.bus, &[end.saturating_sub(start) as u8])?;
        }
        send(session.bus, &buf[start..end.max(start)])?;

        if block.is_last() {
            break;
        }
        first = false;
    }

    session.bus.release();
    Ok(())
}
