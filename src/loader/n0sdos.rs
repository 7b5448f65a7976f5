//! N0SDOS.
//!
//! File names come in the GI Joe way, clocked by CLOCK and ending with a 0.
//! The file goes back with timed pairs, each sector as a count of data
//! bytes followed by the bytes, and a count of 0 after the last one.  A
//! file that can't be found or read gets a count of 0xff instead.  ATN
//! between files ends the loader.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{Session, gijoe};
use crate::bus::BusLines;
use crate::disk::ChainReader;
use crate::driver::{DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{TimedLink, TimedPairs};
use crate::util::time::fl::TIMED_BYTE_TIMEOUT_MS;

const LINK: TimedLink = TimedLink::data_release(TimedPairs::N0SDOS_SEND, (true, true));

const END: u8 = 0;
const FAILED: u8 = 0xff;

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let mut buf = session.alloc()?;

    loop {
        session.bus.release();
        let name = match gijoe::get_name(session).await {
            Ok(name) => name,
            Err(LoaderError::HostReset) => return Ok(()),
            Err(e) => return Err(e),
        };

        let file = session.find_file(&mut buf, &name, false).await.ok().flatten();
        let Some(file) = file else {
            debug!("N0SDOS file not found");
            LINK.send(session.bus, FAILED, TIMED_BYTE_TIMEOUT_MS)?;
            continue;
        };

        let mut reader = ChainReader::new(file.start);
        loop {
            match session.next_block(&mut reader, &mut buf).await {
                Ok(Some(block)) => {
                    let data = &buf[2..=usize::from(block.last_used())];
                    LINK.send(session.bus, data.len() as u8, TIMED_BYTE_TIMEOUT_MS)?;
                    LINK.send_all(session.bus, data, TIMED_BYTE_TIMEOUT_MS)?;
                }
                Ok(None) => {
                    LINK.send(session.bus, END, TIMED_BYTE_TIMEOUT_MS)?;
                    break;
                }
                Err(_) => {
                    LINK.send(session.bus, FAILED, TIMED_BYTE_TIMEOUT_MS)?;
                    break;
                }
            }
        }
    }
}
