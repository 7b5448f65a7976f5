//! Action Replay 6 on a 1581.
//!
//! The cartridge loads the file opened on channel 0 and saves to the file
//! opened on channel 1, both a sector at a time with timed pairs.  Every
//! sector travels with its two link bytes, so the host and drive both know
//! from the first two bytes how much of it follows: 254 bytes, or for the
//! last sector (track 0) the bytes up to and including the second link
//! byte.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::Session;
use crate::bus::BusLines;
use crate::driver::{Channels, DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{TimedLink, TimedPairs};
use crate::util::time::fl::TIMED_BYTE_TIMEOUT_MS;

const LOAD_CHANNEL: u8 = 0;
const SAVE_CHANNEL: u8 = 1;

const SEND: TimedLink = TimedLink::data_release(TimedPairs::AR6_1581_SEND, (true, true));
const GET: TimedLink = TimedLink::data_release(TimedPairs::AR6_1581_GET, (true, true));

/// How many data bytes follow a pair of link bytes.
fn data_len(link: [u8; 2]) -> usize {
    match link {
        [0, last] => usize::from(last.max(1)) - 1,
        _ => 254,
    }
}

pub async fn load<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    let Some(mut file) = session.open_channel(LOAD_CHANNEL) else {
        session.bus.release();
        return Ok(());
    };
    let mut buf = session.alloc()?;

    while let Some(block) = session.next_block(&mut file, &mut buf).await? {
        let len = data_len([buf[0], buf[1]]);
        SEND.send_all(session.bus, &buf[..2 + len], TIMED_BYTE_TIMEOUT_MS)?;
        if block.is_last() {
            break;
        }
        session.check_keys()?;
    }
    session.bus.release();
    Ok(())
}

pub async fn save<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo + Channels,
    S: DriveSignals,
{
    if !session.disk.is_writable(SAVE_CHANNEL) {
        warn!("Nothing open for writing on channel {}", SAVE_CHANNEL);
        session.bus.release();
        return Ok(());
    }
    let mut buf = session.alloc()?;

    let result = loop {
        let mut link = [0u8; 2];
        for byte in link.iter_mut() {
            *byte = GET.receive(session.bus, TIMED_BYTE_TIMEOUT_MS)?;
        }
        let len = data_len(link);
        for byte in buf[..len].iter_mut() {
            *byte = GET.receive(session.bus, TIMED_BYTE_TIMEOUT_MS)?;
        }
        trace!("AR6 saved {} bytes", len);

        if let Err(e) = session.append(SAVE_CHANNEL, &buf[..len]).await {
            break Err(e);
        }
        if link[0] == 0 {
            break Ok(());
        }
    };

    session.close(SAVE_CHANNEL).await?;
    session.bus.release();
    result
}
