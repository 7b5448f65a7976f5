//! The burst fastload command of the 1571 and 1581, `U0` followed by a
//! command byte and a file name.
//!
//! Unlike the other loaders this isn't drivecode.  The host sends the
//! command on the command channel, and the file comes back over the fast
//! serial line, a byte each time the host toggles CLOCK.  Each sector is
//! preceded by a status byte, and the last sector also by its length.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::Session;
use crate::bus::{BusState, FastSerial};
use crate::disk::{ChainReader, DirFile};
use crate::driver::{Command, DriveSignals, LoaderError, MediaError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

const STATUS_OK: u8 = 0x00;
const STATUS_READ_ERROR: u8 = 0x02;
const STATUS_FILE_NOT_FOUND: u8 = 0x02;
const STATUS_NOT_READY: u8 = 0x0f;
const STATUS_EOI: u8 = 0x1f;

/// Offset of the file name in the command.
const NAME_OFFSET: usize = 3;

/// Bit of the command byte that allows any file type, rather than just
/// PRG files.
const ANY_TYPE: u8 = 0x80;

/// Burst state that outlives a single command.
#[derive(Debug, Default)]
pub struct BurstState {
    /// The last file loaded, which a name of `*` loads again.
    previous: Option<DirFile>,
}

impl BurstState {
    pub const fn new() -> Self {
        Self { previous: None }
    }

    /// Forget the last file, for example after a disk change.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// The job status a burst host understands for a disk error.
fn status(error: LoaderError) -> u8 {
    match error {
        LoaderError::Media(MediaError::Read | MediaError::IllegalTrackSector) => STATUS_READ_ERROR,
        _ => STATUS_NOT_READY,
    }
}

/// The file name in a command, without any drive or partition prefix.
fn file_name<'c>(command: &Command<'c>) -> &'c [u8] {
    let name = command.bytes().get(NAME_OFFSET..).unwrap_or_default();
    match name.iter().position(|&b| b == b':') {
        Some(colon) => &name[colon + 1..],
        None => name,
    }
}

/// Sends bytes as the host toggles CLOCK.
struct Sender {
    /// CLOCK level the host moves away from to ask for the next byte.
    clock: bool,
}

impl Sender {
    async fn send<B, D, S>(&mut self, session: &mut Session<'_, B, D, S>, byte: u8) -> Result<(), LoaderError>
    where
        B: FastSerial,
        D: SectorIo,
        S: DriveSignals,
    {
        let clock = self.clock;
        session
            .wait_request(|bus| {
                let state = bus.read();
                state.contains(BusState::CLOCK) != clock || !state.contains(BusState::ATN)
            })
            .await?;
        if !session.bus.atn() {
            return Err(LoaderError::HostReset);
        }
        session.bus.send_fast(byte);
        self.clock = !clock;
        Ok(())
    }
}

/// Run a burst fastload command.
pub async fn fastload<B, D, S>(
    session: &mut Session<'_, B, D, S>,
    state: &mut BurstState,
    command: &Command<'_>,
) -> Result<(), LoaderError>
where
    B: FastSerial,
    D: SectorIo,
    S: DriveSignals,
{
    let mut sender = Sender { clock: true };
    let mut buf = session.alloc()?;

    let name = file_name(command);
    let file = match (name, state.previous) {
        ([b'*', ..], Some(previous)) => previous,
        _ => {
            let prg_only = command.byte(2) & ANY_TYPE == 0;
            match session.find_file(&mut buf, name, prg_only).await {
                Ok(Some(file)) => {
                    state.previous = Some(file);
                    file
                }
                Ok(None) | Err(_) => return sender.send(session, STATUS_FILE_NOT_FOUND).await,
            }
        }
    };
    debug!("Burst load from {}/{}", file.start.track, file.start.sector);

    let mut reader = ChainReader::new(file.start);
    let mut first = true;
    loop {
        let block = match session.next_block(&mut reader, &mut buf).await {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(()),
            Err(e) => return sender.send(session, status(e)).await,
        };

        if block.is_last() {
            sender.send(session, STATUS_EOI).await?;
            let skip = if first { 3 } else { 1 };
            sender.send(session, block.last_used().wrapping_sub(skip)).await?;
        } else {
            sender.send(session, STATUS_OK).await?;
        }

        for index in 2..=usize::from(block.last_used()) {
            sender.send(session, buf[index]).await?;
        }

        if block.is_last() {
            return Ok(());
        }
        first = false;
    }
}
