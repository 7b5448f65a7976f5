//! The Epyx FastLoad cartridge.
//!
//! The cartridge uploads a small first stage, which pulls in a second stage
//! of 256 bytes with the same bit transfer as GI Joe.  Only one second
//! stage is known, so it's recognised by the XOR of its bytes.  It then
//! loads the file the host opened on channel 0, each sector as a count and
//! that many bytes, with a count of 0 after the last one.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{Session, gijoe};
use crate::bus::BusLines;
use crate::driver::{Channels, DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{TimedLink, TimedPairs};
use crate::util::time::fl::TIMED_BYTE_TIMEOUT_MS;

const STAGE2_LEN: usize = 256;
const STAGE2_XOR: u8 = 0x91;

const FILE_CHANNEL: u8 = 0;

const LINK: TimedLink = TimedLink::data_release(TimedPairs::EPYXCART, (true, true));

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    // We hold DATA until the host pulls CLOCK, then wait for it to let go
    session.bus.set_lines(true, false);
    session.wait_request(|bus| !bus.clock()).await?;
    session.bus.set_data(true);
    session.wait_request(|bus| bus.clock()).await?;

    let mut checksum = 0u8;
    for _ in 0..STAGE2_LEN {
        checksum ^= gijoe::read_byte(session.bus)?;
    }
    if checksum != STAGE2_XOR {
        warn!("Unknown Epyx stage 2, checksum {:02x}", checksum);
        return Err(LoaderError::Protocol);
    }

    let Some(mut file) = session.open_channel(FILE_CHANNEL) else {
        session.bus.release();
        return Ok(());
    };
    let mut buf = session.alloc()?;

    while let Some(block) = session.next_block(&mut file, &mut buf).await? {
        let data = &buf[2..=usize::from(block.last_used())];
        trace!("Epyx block of {} bytes", data.len());
        LINK.send(session.bus, data.len() as u8, TIMED_BYTE_TIMEOUT_MS)?;
        LINK.send_all(session.bus, data, TIMED_BYTE_TIMEOUT_MS)?;
        if block.is_last() {
            break;
        }
    }
    LINK.send(session.bus, 0, TIMED_BYTE_TIMEOUT_MS)
}
