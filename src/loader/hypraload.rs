//! Hypra-Load, versions 1.0 and 2.1.
//!
//! The host opens the file through the standard protocol, then starts the
//! loader, which takes over the file on channel 0.  Each sector goes out as
//! a status byte, a flag saying whether more sectors follow, the index of
//! the last used byte, and all 254 data bytes.  A status of 0xff ends the
//! transfer with an error.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::Session;
use crate::bus::BusLines;
use crate::driver::{Channels, DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::TimedLink;
use crate::util::time::fl::{FRAME_DELAY_MS, TIMED_BYTE_TIMEOUT_MS};
use crate::util::time::yield_ms;

const STATUS_OK: u8 = 0x55;
const STATUS_ERROR: u8 = 0xff;

const FILE_CHANNEL: u8 = 0;

fn send<B: BusLines>(bus: &mut B, link: &TimedLink, bytes: &[u8]) -> Result<(), LoaderError> {
    link.send_all(bus, bytes, TIMED_BYTE_TIMEOUT_MS)
}

pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    let link = session.rxtx.timed().ok_or(LoaderError::Protocol)?.send;
    let file = session.open_channel(FILE_CHANNEL);
    let mut buf = session.alloc()?;

    yield_ms!(FRAME_DELAY_MS);

    let Some(mut file) = file else {
        return send(session.bus, &link, &[STATUS_ERROR]);
    };

    loop {
        let block = match session.next_block(&mut file, &mut buf).await {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(()),
            Err(e) => {
                send(session.bus, &link, &[STATUS_ERROR])?;
                return Err(e);
            }
        };

        trace!("Hypra-Load block {}", file.blocks());
        let header = [STATUS_OK, u8::from(!block.is_last()), block.last_used()];
        send(session.bus, &link, &header)?;
        send(session.bus, &link, &buf[2..])?;

        if block.is_last() {
            return Ok(());
        }
    }
}
