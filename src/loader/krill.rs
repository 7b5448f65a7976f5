//! Krill's loader.
//!
//! Files are found by name in the normal 1541 directory, or on early
//! releases by track and sector.  The host asks for a file by pulling its
//! request line, sends the name one bit per clock edge, and then collects
//! the file block by block, two bits per ATN edge.  Each block carries a
//! two byte header whose meaning changed between releases.
//!
//! Most parameters (directory track, how much of the name is significant)
//! are patched into the drivecode by the host, so we checksum the start of
//! the drivecode to find out where to look for them.  From r192 they are
//! sent in the M-E command instead.
//!
//! r186 can also upload custom drivecode.  We only know the save plugin
//! used by a single production, and fake everything else the plugin needs.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Instant;

use super::{LoaderVariant, Session};
use crate::buffers::Buffer;
use crate::bus::{BusLines, BusState, Line};
use crate::constants::{CBM_NAME_LENGTH, DIR_START_SECTOR, DIR_TRACK, MAX_TRACK};
use crate::disk::{ChainLink, DirFile, DirSearch, TrackSector, link};
use crate::driver::{Command, DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::timed::at;
use crate::protocol::{
    LinePair, RxTx, Sender, TimedPairs, clocked_read_byte, clocked_write_byte, wait_atn_high,
    wait_atn_low,
};
use crate::quirks::{KRILL_QUIRKS, block_delay, scan};
use crate::util::crc::{CRC_INIT, crc16_update};
use crate::util::time::fl::{ATN_TIMEOUT_MS, BIT_TIMEOUT_MS, KRILL_BLOCK_DELAY_STEP_MS};
use crate::util::time::{Deadline, Timeout, block_until, block_us, poll_until, yield_ms};

/// Magic string of r192 and later, at offset 5 of the M-E command.
pub const MAGIC: &[u8] = b"KRILL";
const MAGIC_OFFSET: usize = 5;

/// Offsets of the loader parameters in the r192 ID string.
const ID_DIR_TRACK: usize = 16;
const ID_NAME_LENGTH: usize = 17;
const MIN_ID_LENGTH: usize = 19;

/// Number of drivecode bytes covered by the variant checksum.  Smaller than
/// every parameter offset in [`DRIVECODE_VARIANTS`].
const DRIVECODE_CRC_LEN: usize = 0xf0;

/// Name buffer size.  r192 may send a couple of bytes more than a name,
/// which means custom drivecode is coming instead.
const NAME_BUF_LEN: usize = CBM_NAME_LENGTH + 2;

/// Status sent instead of a block header when the file can't be loaded.
const STATUS_ERROR: u8 = 0xff;

/// Bit order used by the releases before r58, in transfer order.
const R58PRE_ORDER: [u8; 8] = [0x80, 0x20, 0x40, 0x10, 0x08, 0x02, 0x04, 0x01];

/// Where a drivecode release keeps its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct DrivecodeVariant {
    crc: u16,
    name_length_offset: usize,
    dir_track_offset: usize,
}

impl DrivecodeVariant {
    const fn new(crc: u16, name_length_offset: usize, dir_track_offset: usize) -> Self {
        Self {
            crc,
            name_length_offset,
            dir_track_offset,
        }
    }

    /// Bytes that need to be seen to pick up every parameter.
    fn len(&self) -> usize {
        (self.dir_track_offset + 2).max(self.name_length_offset)
    }
}

/// Releases with parameters at non-default places.  Checksums are of the
/// first [`DRIVECODE_CRC_LEN`] bytes of the drivecode.
static DRIVECODE_VARIANTS: &[DrivecodeVariant] = &[
    DrivecodeVariant::new(0x4a88, 0x216, 0x3a1), // r186
    DrivecodeVariant::new(0x8ad2, 0x215, 0x384), // r184
    DrivecodeVariant::new(0xf4a2, 0x435, 0x1c5), // r164
    DrivecodeVariant::new(0x8d19, 0x435, 0x1c5), // r164
    DrivecodeVariant::new(0xec9c, 0x435, 0x1c5), // r164
    DrivecodeVariant::new(0x0519, 0x3b4, 0x3da), // r146
    DrivecodeVariant::new(0x214c, 0x3a5, 0x3c8), // r146
    DrivecodeVariant::new(0x3154, 0x3a8, 0x3e6), // r146
    DrivecodeVariant::new(0x3e7a, 0x3c4, 0x3f9), // r146
    DrivecodeVariant::new(0x4c28, 0x3a3, 0x3c9), // r146
    DrivecodeVariant::new(0xcba6, 0x3b2, 0x3d8), // r146
    DrivecodeVariant::new(0xea6c, 0x3a4, 0x3ca), // r146
    DrivecodeVariant::new(0x49e4, 0x318, 0x342), // r58
];

/// Custom drivecode stages we know how to fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum CustomCode {
    /// Stage 0, which loads the next stage
    ReadLength,
    /// Backs up drive memory before the plugin overwrites it
    MemBackup,
    /// Writes a file over an existing one
    SavePlugin,
}

struct CustomCodeHandler {
    crc: u16,
    code: CustomCode,
    /// Bytes at the end of the stage left for the handler to read
    params: u16,
}

/// Length of stage 0, and of the part of each stage that is checksummed.
const CC_STAGE0_LEN: u16 = 0x29;
const CC_CRC_LEN: u16 = CC_STAGE0_LEN - 2;

static CUSTOM_CODE: &[CustomCodeHandler] = &[
    CustomCodeHandler { crc: 0xf923, code: CustomCode::ReadLength, params: 0x02 },
    CustomCodeHandler { crc: 0xab48, code: CustomCode::MemBackup, params: 0x07 },
    CustomCodeHandler { crc: 0x5e85, code: CustomCode::SavePlugin, params: 0x11 },
];

/// Loader parameters sent in the M-E command by r192 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IdString {
    pub dir_track: u8,
    pub name_length: u8,
}

/// The r192 ID string, if `command` carries one.
pub fn id_string(command: &Command) -> Option<IdString> {
    if command.len() < MIN_ID_LENGTH || !command.has_magic(MAGIC_OFFSET, MAGIC) {
        return None;
    }
    Some(IdString {
        dir_track: command.byte(ID_DIR_TRACK),
        name_length: command.byte(ID_NAME_LENGTH),
    })
}

/// Whether the command carries the r192 magic string.
pub fn has_magic(command: &Command) -> bool {
    command.has_magic(MAGIC_OFFSET, MAGIC)
}

/// The different ways the loaders ask whether the drive is a 1541.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriveCheck {
    /// r146, already identified by the upload checksum
    Uploaded,
    /// r186 and earlier, identified by the command checksum
    Command,
    /// r192 and later, identified by the magic string
    Magic,
}

/// Whether `command` is one of Krill's drive checks.
pub fn drive_check(command: &Command, check: DriveCheck) -> bool {
    match check {
        DriveCheck::Uploaded => true,
        // r159 sends a shorter one
        DriveCheck::Command => {
            matches!(command.len(), 0x1a | 0x17)
                && matches!(command.crc(5, 0), 0xca5b | 0xf35b)
        }
        DriveCheck::Magic => has_magic(command),
    }
}

/// Status byte after the last block, or for "next file" past the end of
/// the directory.
fn end_status(variant: LoaderVariant) -> u8 {
    if variant > LoaderVariant::KrillR146 { 0x00 } else { 0xfe }
}

/// Header of block `block` of a file, given the block's chain link.
fn block_header(variant: LoaderVariant, block: u8, link: ChainLink) -> [u8; 2] {
    let last = link.is_last();
    let used = link.last_used();
    let eoi = u8::from(last);
    match variant {
        LoaderVariant::KrillR58Pre | LoaderVariant::KrillR58 | LoaderVariant::KrillR146 => {
            [block, used.wrapping_sub(2)]
        }
        LoaderVariant::KrillR159 | LoaderVariant::KrillR164 => [
            0x82 - eoi,
            if last { (!used).wrapping_add(2) } else { block.wrapping_add(2) },
        ],
        LoaderVariant::KrillR184 => [
            2 | eoi,
            if last { (!used).wrapping_add(1) } else { block.wrapping_add(2) },
        ],
        _ => [
            if last { (!used).wrapping_add(1) } else { block.wrapping_add(1) },
            2 | eoi,
        ],
    }
}

/// Maximum name length patched into the drivecode, decoded for `variant`.
fn decode_name_length(variant: LoaderVariant, raw: u8) -> u8 {
    match variant {
        LoaderVariant::KrillR58Pre => 2,
        LoaderVariant::KrillR146 => raw.wrapping_add(1) & 0x7f,
        LoaderVariant::KrillR164 => raw.wrapping_neg(),
        _ => raw,
    }
}

/// Send one bit per CLOCK edge on DATA, MSB first, a 1 being a low line.
/// Used for status bytes and the fake memory backup of the save plugin.
fn send_byte_1bit<B: BusLines>(bus: &mut B, byte: u8) -> Result<(), LoaderError> {
    let mut byte = byte;
    for bit in (1..=8u8).rev() {
        bus.set_data(byte & 0x80 == 0);
        byte <<= 1;

        let want_high = bit & 1 != 0;
        let deadline = Deadline::from_ms(BIT_TIMEOUT_MS);
        loop {
            let state = bus.read();
            if state.contains(BusState::CLOCK) == want_high {
                break;
            }
            if state.contains(BusState::ATN) {
                return Err(LoaderError::HostReset);
            }
            if deadline.expired() {
                return Err(LoaderError::Timeout);
            }
        }
    }
    Ok(())
}

/// r146 "resend" sender.  The byte goes out at fixed times after ATN is
/// released, and again every time the host fails to pull ATN in time.
fn send_resend<B: BusLines>(bus: &mut B, byte: u8) {
    loop {
        wait_atn_high(bus);
        let reference = Instant::now();

        TimedPairs::KRILL_RESEND.send(bus, reference, byte);
        block_until(at(reference, 420));
        bus.set_clock(true);

        block_until(at(reference, 500));
        if !bus.atn() {
            break;
        }

        // Tell the host the byte is coming again
        bus.set_clock(false);
    }
}

/// Send a byte of a block.  On return the last bits may not have been
/// picked up yet.
fn send_byte<B: BusLines>(bus: &mut B, sender: Sender, byte: u8) -> Result<(), Timeout> {
    match sender {
        Sender::Atn { shuffled: false } => clocked_write_byte(bus, byte, None, ATN_TIMEOUT_MS),
        Sender::Atn { shuffled: true } => {
            clocked_write_byte(bus, !byte, Some(&R58PRE_ORDER), ATN_TIMEOUT_MS)
        }
        Sender::Resend => {
            send_resend(bus, byte);
            Ok(())
        }
        Sender::None => Err(Timeout),
    }
}

/// A file being sent, with the sector currently in the buffer.
/// Block count reported before a save.  The drivecode counts blocks in a
/// byte, so sizes wrap and 0 stands for 256.
fn save_block_count(file: &DirFile) -> u8 {
    file.blocks as u8
}

struct OpenFile<'a> {
    buf: Buffer<'a>,
    link: ChainLink,
}

/// What happened to a block.
enum BlockOutcome {
    Sent(Result<(), Timeout>),
    /// The host only wanted to know whether the file exists
    ExistsChecked,
}

struct Krill<'s, 'a, B: BusLines, D, S> {
    s: &'s mut Session<'a, B, D, S>,
    receiver: LinePair,
    search: DirSearch,
    /// Directory track, 255 for the default
    dir_track: u8,
    /// Sector holding the directory link, 0 for the default
    bam_sector: u8,
    /// How much of a name has to match
    name_length: u8,
    file_count: u8,
    /// Files are requested by track and sector
    ts_load: bool,
    dir_changed: bool,
    /// Bytes of drive memory the host thinks we backed up
    backup_len: u16,
    name: [u8; NAME_BUF_LEN],
}

impl<'a, B, D, S> Krill<'_, 'a, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    fn get_byte(&mut self) -> Result<u8, Timeout> {
        let clock = self.receiver.clock();
        let data = self.receiver.data();
        self.s
            .bus
            .critical(|bus| clocked_read_byte(bus, clock, data, BIT_TIMEOUT_MS))
    }

    /// Receive a byte, 0 if the host stopped sending.
    fn get_byte_or_zero(&mut self) -> u8 {
        self.get_byte().unwrap_or(0)
    }

    /// Receive the drivecode, picking the loader parameters out of it.
    async fn load_drivecode(&mut self) -> Result<(), LoaderError> {
        let variant = self.s.variant;
        let ready = if variant >= LoaderVariant::KrillR184 {
            BusState::ATN
        } else {
            BusState::DATA
        };

        self.s.bus.set_clock(false);
        self.s
            .wait_request(|bus| !bus.read().contains(ready))
            .await?;
        self.s.bus.release();
        block_us!(2);

        let mut crc = CRC_INIT;
        let mut len = DRIVECODE_CRC_LEN + 1;
        let mut detected: Option<&DrivecodeVariant> = None;
        let mut previous = 0u8;

        for i in 0usize.. {
            let Ok(byte) = self.get_byte() else {
                self.s.bus.set_clock(false);
                if variant < LoaderVariant::KrillR184 {
                    self.s.bus.set_data(false);
                }
                if detected.is_none() {
                    warn!("Unknown Krill drivecode, CRC {:04x} loader {}", crc, variant);
                }
                debug!("Krill drivecode: {} bytes", i);
                break;
            };

            // The rest is ignored, with the busy line set
            if i > len {
                continue;
            }

            if i == len {
                if variant >= LoaderVariant::KrillR184 {
                    self.s.bus.set_clock(false);
                } else if variant == LoaderVariant::KrillR164 {
                    self.s.bus.set_data(false);
                }
            }

            if let Some(params) = detected {
                if i == params.dir_track_offset {
                    self.dir_track = byte;
                } else if i == params.name_length_offset {
                    let length = decode_name_length(variant, byte);
                    if length > 0 && length < self.name_length {
                        self.name_length = length;
                    }
                } else if byte < 13
                    && previous == 0xa0
                    && variant <= LoaderVariant::KrillR146
                    && i == params.dir_track_offset + 2
                {
                    // Custom first directory sector
                    self.bam_sector = byte;
                }
                previous = byte;
                continue;
            }

            if i < DRIVECODE_CRC_LEN {
                crc = crc16_update(crc, byte);
                continue;
            }

            if let Some(found) = scan(DRIVECODE_VARIANTS, crc, |v| v.crc) {
                debug!("Krill drivecode {:04x}", crc);
                len = len.max(found.len());
                detected = Some(found);
            }
        }

        debug!(
            "Krill dir track {} name length {} bam sector {}",
            self.dir_track, self.name_length, self.bam_sector
        );
        wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;
        Ok(())
    }

    /// Picks up disk changes as well as a pending forced update.
    fn take_dir_changed(&mut self) -> bool {
        if self.s.signals.take_dir_changed() {
            self.dir_changed = true;
        }
        self.dir_changed
    }

    /// Find the start of the directory after a disk change.
    async fn update_path(&mut self) {
        let mut start = TrackSector::new(DIR_TRACK, DIR_START_SECTOR);

        if (1..=MAX_TRACK).contains(&self.dir_track) {
            start.track = self.dir_track;
            if self.bam_sector != 0 {
                if let Ok(mut buf) = self.s.alloc() {
                    let read = self.s.read(&mut buf, self.dir_track, self.bam_sector).await;
                    if read.is_ok() && buf[0] == self.dir_track {
                        start.sector = buf[1];
                    }
                }
            }
        }

        debug!("Krill directory at {}/{}", start.track, start.sector);
        self.search = DirSearch::new(start);
        self.dir_changed = false;
    }

    /// Find the file named in the name buffer.  `*` carries on from the
    /// last file found.
    async fn find_file(&mut self, buf: &mut Buffer<'a>) -> Result<Option<DirFile>, LoaderError> {
        if self.name[0] != b'*' {
            if self.take_dir_changed() {
                self.update_path().await;
            }
            self.search.rewind();
        }

        let part = self.s.part;
        let found = self
            .search
            .next_match(&mut *self.s.disk, buf, part, &self.name)
            .await?;
        Ok(found)
    }

    /// Whether the name buffer holds a plausible track and sector.
    fn valid_ts(&self) -> bool {
        self.s.variant <= LoaderVariant::KrillR146
            && self.name[1] <= 20
            && (1..=41).contains(&self.name[0])
    }

    /// Receive a file name, or track and sector, into the name buffer.
    /// Returns the number of bytes received.  More than a name's worth
    /// means custom drivecode.
    fn read_filename(&mut self) -> usize {
        let variant = self.s.variant;
        let max_len = if variant >= LoaderVariant::KrillR192 {
            NAME_BUF_LEN
        } else {
            usize::from(self.name_length).min(NAME_BUF_LEN)
        };

        self.name.fill(0);
        self.s.bus.release();

        let mut count = 0;
        while count < max_len {
            let byte = self.get_byte_or_zero();
            self.name[count] = byte;
            if byte == 0 {
                break;
            }
            // Single character names below 42 look like a track too, but no
            // production has one
            if count == 1 && (self.ts_load || (self.file_count == 0 && self.valid_ts())) {
                break;
            }
            count += 1;
        }

        if variant != LoaderVariant::KrillR164 {
            self.s.bus.set_clock(false);
        }
        self.s.bus.set_data(false);

        let significant = usize::from(self.name_length);
        if count == 0 {
            self.name[0] = b'*';
            self.name[1] = 0;
        } else if significant < CBM_NAME_LENGTH {
            self.name[significant] = b'*';
            self.name[significant + 1] = 0;
        }

        trace!("Krill request {=[u8]:a}", &self.name[..]);
        count
    }

    /// Open the requested file and read its first sector.
    async fn open_file(&mut self) -> Option<OpenFile<'a>> {
        let mut buf = self.s.alloc().ok()?;

        let found = if self.ts_load {
            None
        } else {
            self.find_file(&mut buf).await.ok().flatten()
        };

        let start = match found {
            Some(file) => file.start,
            None => {
                if !self.ts_load {
                    if self.file_count > 0 || !self.valid_ts() {
                        debug!("Krill file not found");
                        return None;
                    }
                    debug!("Krill switching to track/sector requests");
                    self.ts_load = true;
                }
                TrackSector::new(self.name[0], self.name[1])
            }
        };

        self.s.read(&mut buf, start.track, start.sector).await.ok()?;
        self.file_count = self.file_count.wrapping_add(1);
        Some(OpenFile {
            link: link(&buf),
            buf,
        })
    }

    async fn send_file(&mut self) -> Result<(), LoaderError> {
        let variant = self.s.variant;
        let sender = self.s.rxtx.sender();
        let delay = u64::from(block_delay(KRILL_QUIRKS, self.s.file_crc));

        let mut file = self.open_file().await;
        let mut status = STATUS_ERROR;
        // Running off the end of the directory isn't an error
        if file.is_none() && !self.take_dir_changed() && self.name[0] == b'*' {
            status = end_status(variant);
        }

        self.s.file_crc = CRC_INIT;
        let mut block = 0u8;

        loop {
            let present = file.is_some();
            let header = match &file {
                Some(f) => block_header(variant, block, f.link),
                None => [status, 0],
            };
            let payload: &[u8] = match &file {
                Some(f) => f.buf.get(2..=usize::from(f.link.last_used())).unwrap_or(&[]),
                None => &[],
            };

            let mut crc = self.s.file_crc;
            let outcome = self.s.bus.critical(|bus| {
                // Ready
                bus.set_data(variant == LoaderVariant::KrillR164);
                bus.set_clock(variant != LoaderVariant::KrillR164);

                if variant <= LoaderVariant::KrillR146 {
                    let _ = wait_atn_low(bus, 0);
                }

                if variant >= LoaderVariant::KrillR192 {
                    // The host pulls CLOCK to ask if the file exists
                    let _ = poll_until(|| bus.atn() || !bus.clock(), Deadline::never());
                    if !bus.clock() {
                        wait_atn_high(bus);
                        bus.set_data(present);
                        return BlockOutcome::ExistsChecked;
                    }
                }

                let mut result = send_byte(bus, sender, header[0]);
                if present && result.is_ok() {
                    result = send_byte(bus, sender, header[1]);
                    for &byte in payload {
                        if result.is_err() {
                            break;
                        }
                        result = send_byte(bus, sender, byte);
                        crc = crc16_update(crc, byte);
                    }
                }

                // The last pair hasn't been picked up yet
                wait_atn_high(bus);

                // Busy
                bus.set_clock(present && variant == LoaderVariant::KrillR164);
                bus.set_data(present && variant != LoaderVariant::KrillR164);
                BlockOutcome::Sent(result)
            });
            self.s.file_crc = crc;

            match outcome {
                BlockOutcome::Sent(result) => {
                    result?;
                    if present && delay > 0 {
                        let steps = delay.div_ceil(KRILL_BLOCK_DELAY_STEP_MS);
                        yield_ms!(steps * KRILL_BLOCK_DELAY_STEP_MS);
                    }
                }
                BlockOutcome::ExistsChecked => {
                    debug!("Krill file exists: {}", present);
                    file = None;
                }
            }

            if file.is_none() && variant == LoaderVariant::KrillR58Pre {
                let _ = wait_atn_low(self.s.bus, 0);
            }

            if (variant > LoaderVariant::KrillR146 || file.is_none())
                && wait_atn_low(self.s.bus, ATN_TIMEOUT_MS).is_err()
            {
                return Ok(());
            }

            let Some(mut current) = file.take() else {
                return Ok(());
            };

            match current.link {
                ChainLink::Next(next) => {
                    if self.s.read(&mut current.buf, next.track, next.sector).await.is_ok() {
                        current.link = link(&current.buf);
                        block = block.wrapping_add(1);
                        file = Some(current);
                        continue;
                    }
                    status = STATUS_ERROR;
                }
                ChainLink::Last(_) => status = end_status(variant),
            }
        }
    }

    /// Custom drivecode stage 0: the length of the next stage, which the
    /// host sends negated.
    fn cc_read_length(&mut self) -> u16 {
        let mut word = 0u16;
        for _ in 0..2 {
            word = word >> 8 | u16::from(self.get_byte_or_zero()) << 8;
            if self.s.bus.atn() {
                return 0;
            }
        }
        word.wrapping_neg()
    }

    /// Pretend to back up drive memory.  The host gets 0xff bytes until it
    /// stops asking, and the count is remembered for the restore.
    fn cc_mem_backup(&mut self) -> u16 {
        for _ in 0..5 {
            self.get_byte_or_zero();
            if self.s.bus.atn() {
                return 0;
            }
        }

        let len = self.cc_read_length();
        if len == 0 {
            return 0;
        }

        let _ = poll_until(
            || {
                let state = self.s.bus.read();
                state.contains(BusState::DATA | BusState::CLOCK) || state.contains(BusState::ATN)
            },
            Deadline::never(),
        );
        if self.s.bus.atn() {
            return 0;
        }

        self.backup_len = 0;
        // 0xff keeps DATA low, so the host's timeout ends the backup
        while self.s.bus.critical(|bus| send_byte_1bit(bus, 0xff)).is_ok() {
            self.backup_len = self.backup_len.wrapping_add(1);
        }
        if self.s.bus.atn() {
            return 0;
        }
        debug!("Krill memory backup of {} bytes", self.backup_len);

        self.s.bus.set_lines(false, false);
        block_us!(20);
        len
    }

    /// The save plugin: receive a name, then the file.
    async fn cc_save_plugin(&mut self) -> u16 {
        self.name.fill(0);
        for i in 0..=CBM_NAME_LENGTH {
            self.name[i] = self.get_byte_or_zero();
            if self.s.bus.atn() {
                return 0;
            }
        }

        let _ = poll_until(|| self.s.bus.clock() || self.s.bus.atn(), Deadline::never());
        if self.s.bus.atn() {
            return 0;
        }

        self.s.bus.set_lines(false, false);
        if self.save_file().await.is_err() {
            return 0;
        }

        self.s.bus.release();
        block_us!(2);

        // Pretend to restore drive memory
        for _ in 0..self.backup_len {
            self.get_byte_or_zero();
            if self.s.bus.atn() {
                break;
            }
        }
        0
    }

    /// Overwrite the file named in the name buffer with data from the host.
    /// The new data goes into the sectors of the existing file, so the file
    /// can't grow.
    async fn save_file(&mut self) -> Result<(), LoaderError> {
        let mut buf = self.s.alloc().ok();
        let mut status = 0xfe;
        let mut ts = TrackSector::default();

        if let Some(buf) = buf.as_mut() {
            match self.find_file(buf).await.ok().flatten() {
                Some(file) => {
                    ts = file.start;
                    status = save_block_count(&file);
                    if self.s.read(buf, ts.track, ts.sector).await.is_err() {
                        status = 0xfe;
                    }
                }
                None => status = STATUS_ERROR,
            }
        }
        debug!("Krill save, status {:02x}", status);

        self.s.bus.set_clock(true);
        block_us!(2);
        self.s.bus.critical(|bus| send_byte_1bit(bus, status))?;

        let Some(mut buf) = buf.filter(|_| status < 0xfe) else {
            return Err(LoaderError::Protocol);
        };

        let mut remaining = status;
        loop {
            self.s.bus.release();
            block_us!(2);

            let count = self.get_byte()?;
            if self.s.bus.atn() {
                return Err(LoaderError::HostReset);
            }
            let end = (2 + usize::from(count)).min(buf.len());
            for index in 2..2 + usize::from(count) {
                let byte = self.get_byte_or_zero();
                if self.s.bus.atn() {
                    return Err(LoaderError::HostReset);
                }
                if let Some(slot) = buf.get_mut(index) {
                    *slot = byte;
                }
            }

            self.s.bus.set_lines(false, false);

            remaining = remaining.wrapping_sub(1);
            if remaining == 0 {
                ChainLink::Last((end - 1) as u8).store(&mut buf);
                buf[end..].fill(0);
                self.s.write(&buf, ts.track, ts.sector).await?;
                return Ok(());
            }

            let ChainLink::Next(next) = link(&buf) else {
                warn!("Krill save runs past the end of the file");
                return Err(LoaderError::Protocol);
            };
            self.s.write(&buf, ts.track, ts.sector).await?;
            self.s.read(&mut buf, next.track, next.sector).await?;
            ts = next;
        }
    }

    /// Unknown custom drivecode on r192 and later.  Assume it's a save
    /// plugin, and go through the motions.
    async fn cc_fallback(&mut self) -> Result<(), LoaderError> {
        // Plugin loader code
        self.s.bus.set_clock(false);
        while self.get_byte().is_ok() {}

        self.s.bus.set_clock(true);
        self.s.bus.set_data(false);
        let _ = poll_until(|| !self.s.bus.clock(), Deadline::never());

        // Memory backup
        while self.s.bus.critical(|bus| send_byte_1bit(bus, 0xff)).is_ok() {}
        self.s.bus.release();

        // Plugin code and file name.  The name is in the last bytes, so keep
        // those in a ring.
        let ring_len = usize::from(self.name_length).min(CBM_NAME_LENGTH) + 1;
        let mut ring = [0u8; CBM_NAME_LENGTH + 1];
        let mut oldest = 0;
        while let Ok(byte) = self.get_byte() {
            ring[oldest] = byte;
            oldest = (oldest + 1) % ring_len;
        }

        self.s.bus.set_data(false);
        let _ = poll_until(|| !self.s.bus.clock() || self.s.bus.atn(), Deadline::never());
        self.s.bus.set_clock(false);
        self.s.bus.set_data(true);
        let _ = poll_until(|| self.s.bus.data() || self.s.bus.atn(), Deadline::never());
        if self.s.bus.atn() {
            return Err(LoaderError::HostReset);
        }

        self.name.fill(0);
        let mut len = 0;
        for offset in 0..ring_len {
            let byte = ring[(oldest + offset) % ring_len];
            if byte == 0 {
                break;
            }
            self.name[len] = byte;
            len += 1;
        }
        if usize::from(self.name_length) < CBM_NAME_LENGTH {
            self.name[len] = b'*';
        }

        self.save_file().await?;

        // Memory restore.  The busy line goes on after the first byte, so
        // the host's timeout ends it.
        self.s.bus.release();
        loop {
            let done = self.get_byte().is_err();
            self.s.bus.set_clock(false);
            if done {
                break;
            }
        }
        self.s.bus.set_data(false);
        Ok(())
    }

    /// Receive custom drivecode stage by stage, faking what each stage does.
    async fn custom_code(&mut self) -> Result<(), LoaderError> {
        self.s.bus.set_data(false);
        let _ = poll_until(|| self.s.bus.clock() || self.s.bus.atn(), Deadline::never());
        if self.s.bus.atn() {
            return Err(LoaderError::HostReset);
        }

        let mut len = CC_STAGE0_LEN;
        while len != 0 {
            let mut crc = CRC_INIT;
            let mut code = None;

            self.s.bus.release();
            block_us!(2);

            let mut index = 0;
            while index < len {
                let byte = self.get_byte_or_zero();
                if self.s.bus.atn() {
                    return Err(LoaderError::HostReset);
                }

                if index < CC_CRC_LEN {
                    crc = crc16_update(crc, byte);
                }

                if index == CC_CRC_LEN - 1 {
                    let Some(handler) = scan(CUSTOM_CODE, crc, |h| h.crc) else {
                        warn!("Unhandled custom drivecode, CRC {:04x}", crc);
                        return self.cc_fallback().await;
                    };
                    debug!("Krill custom drivecode {}", handler.code);
                    // Stop early so the handler can read its parameters
                    len = len
                        .checked_sub(handler.params)
                        .filter(|&len| len >= index)
                        .ok_or(LoaderError::Protocol)?;
                    code = Some(handler.code);
                }
                index += 1;
            }

            len = match code {
                Some(CustomCode::ReadLength) => self.cc_read_length(),
                Some(CustomCode::MemBackup) => self.cc_mem_backup(),
                Some(CustomCode::SavePlugin) => self.cc_save_plugin().await,
                None => return Err(LoaderError::Protocol),
            };
        }
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), LoaderError> {
        let variant = self.s.variant;
        if self.s.rxtx.sender() == Sender::None {
            return Err(LoaderError::Protocol);
        }

        self.load_drivecode().await?;

        // r164 receives drivecode on DATA but requests on ATN
        if variant == LoaderVariant::KrillR164 {
            self.receiver = LinePair::ClockAtn;
        }

        self.file_count = 0;
        self.dir_changed = true;

        let request = if variant == LoaderVariant::KrillR159 || variant >= LoaderVariant::KrillR184 {
            Line::Data
        } else {
            Line::Atn
        };

        while !self.s.bus.atn() {
            self.s.bus.set_clock(variant == LoaderVariant::KrillR164);
            self.s.bus.set_data(variant != LoaderVariant::KrillR164);

            self.s.wait_request(|bus| bus.line(request)).await?;

            block_us!(10);
            if self.s.bus.read().contains(BusState::DATA | BusState::ATN) {
                debug!("Krill host released the bus");
                return Ok(());
            }

            if variant >= LoaderVariant::KrillR184 {
                self.s.bus.set_clock(true);
                block_us!(2);
            }

            if variant < LoaderVariant::KrillR186 || self.s.bus.clock() {
                if self.read_filename() <= CBM_NAME_LENGTH {
                    self.send_file().await?;
                } else {
                    // Custom drivecode.  The host may already be making its
                    // next request.
                    self.cc_fallback().await?;
                    continue;
                }
            } else {
                self.custom_code().await?;
            }

            self.s.wait_request(|bus| !bus.line(request)).await?;
        }

        Ok(())
    }
}

/// Run a Krill session.  `id` is the ID string of r192 and later, earlier
/// releases take their parameters from the drivecode.
pub async fn run<B, D, S>(
    session: &mut Session<'_, B, D, S>,
    id: Option<IdString>,
) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let (dir_track, name_length) = match id {
        Some(id) => {
            session.set_variant(LoaderVariant::KrillR192);
            session.rxtx = RxTx::KrillClock;
            (id.dir_track, id.name_length.min(CBM_NAME_LENGTH as u8))
        }
        None if session.variant == LoaderVariant::KrillR58Pre => (0xff, 2),
        None => (0xff, CBM_NAME_LENGTH as u8),
    };
    let receiver = session
        .rxtx
        .receiver()
        .map_or(LinePair::ClockData, |r| r.lines);

    let mut krill = Krill {
        s: session,
        receiver,
        search: DirSearch::new(TrackSector::new(DIR_TRACK, DIR_START_SECTOR)),
        dir_track,
        bam_sector: 0,
        name_length,
        file_count: 0,
        ts_load: false,
        dir_changed: true,
        backup_len: 0,
        name: [0; NAME_BUF_LEN],
    };
    krill.serve().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::sim::{Host, SimBus};

    #[test]
    fn headers_by_release() {
        let next = ChainLink::Next(TrackSector::new(1, 1));
        let last = ChainLink::Last(0x41);

        assert_eq!(block_header(LoaderVariant::KrillR146, 3, next), [3, 0xfd]);
        assert_eq!(block_header(LoaderVariant::KrillR146, 4, last), [4, 0x3f]);

        assert_eq!(block_header(LoaderVariant::KrillR164, 3, next), [0x82, 5]);
        assert_eq!(block_header(LoaderVariant::KrillR164, 4, last), [0x81, 0xc0]);

        assert_eq!(block_header(LoaderVariant::KrillR184, 3, next), [2, 5]);
        assert_eq!(block_header(LoaderVariant::KrillR184, 4, last), [3, 0xbf]);

        assert_eq!(block_header(LoaderVariant::KrillR186, 3, next), [4, 2]);
        assert_eq!(block_header(LoaderVariant::KrillR192, 4, last), [0xbf, 3]);
    }

    #[test]
    fn save_counts_wrap_at_a_byte() {
        let mut file = DirFile {
            name: [crate::constants::NAME_PAD; CBM_NAME_LENGTH],
            file_type: 0x82,
            start: TrackSector::new(17, 0),
            blocks: 2,
        };
        assert_eq!(save_block_count(&file), 2);
        file.blocks = 300;
        assert_eq!(save_block_count(&file), 44);
        file.blocks = 256;
        assert_eq!(save_block_count(&file), 0);
    }

    #[test]
    fn end_of_file_status() {
        assert_eq!(end_status(LoaderVariant::KrillR58), 0xfe);
        assert_eq!(end_status(LoaderVariant::KrillR146), 0xfe);
        assert_eq!(end_status(LoaderVariant::KrillR159), 0x00);
    }

    #[test]
    fn name_lengths() {
        assert_eq!(decode_name_length(LoaderVariant::KrillR146, 0x0f), 16);
        assert_eq!(decode_name_length(LoaderVariant::KrillR146, 0xff), 0);
        assert_eq!(decode_name_length(LoaderVariant::KrillR164, 0xf0), 16);
        assert_eq!(decode_name_length(LoaderVariant::KrillR184, 8), 8);
        assert_eq!(decode_name_length(LoaderVariant::KrillR58Pre, 8), 2);
    }

    #[test]
    fn drivecode_variants_cover_their_parameters() {
        for variant in DRIVECODE_VARIANTS {
            assert!(variant.dir_track_offset > DRIVECODE_CRC_LEN);
            assert!(variant.name_length_offset > DRIVECODE_CRC_LEN);
            assert!(variant.len() >= variant.dir_track_offset + 2);
        }
        let r184 = scan(DRIVECODE_VARIANTS, 0x8ad2, |v| v.crc).unwrap();
        assert_eq!(r184.dir_track_offset, 0x384);
    }

    #[test]
    fn id_strings() {
        let mut bytes = *b"M-E\x00\x02KRILL..........";
        bytes[ID_DIR_TRACK] = 18;
        bytes[ID_NAME_LENGTH] = 8;
        let id = id_string(&Command::new(&bytes, 0));
        assert_eq!(id, Some(IdString { dir_track: 18, name_length: 8 }));

        // Too short
        assert_eq!(id_string(&Command::new(&bytes[..18], 0)), None);
        bytes[6] = b'X';
        assert_eq!(id_string(&Command::new(&bytes, 0)), None);
    }

    #[test]
    fn drive_checks() {
        use crate::test::forge::{filler, forge};
        use crate::util::crc::crc16;

        let mut bytes = filler(0x1a, 9);
        forge(&mut bytes, 10, 0xca5b, |b| crc16(&b[5..]));
        assert!(drive_check(&Command::new(&bytes, 0), DriveCheck::Command));
        bytes[20] ^= 1;
        assert!(!drive_check(&Command::new(&bytes, 0), DriveCheck::Command));

        let mut short = filler(0x17, 2);
        forge(&mut short, 7, 0xf35b, |b| crc16(&b[5..]));
        assert!(drive_check(&Command::new(&short, 0), DriveCheck::Command));

        let magic = b"M-E\x00\x02KRILL";
        assert!(drive_check(&Command::new(magic, 0), DriveCheck::Magic));
        assert!(drive_check(&Command::new(b"M-E", 0), DriveCheck::Uploaded));
    }

    // Host side of the 1 bit sender: toggles CLOCK, samples DATA before each
    // edge.
    async fn host_receive_1bit(host: Host) -> u8 {
        let mut byte = 0u8;
        for bit in (1..=8u8).rev() {
            host.idle(2).await;
            byte = byte << 1 | u8::from(!host.data());
            // Odd bits are acknowledged by releasing CLOCK
            host.set_clock(bit & 1 != 0);
        }
        byte
    }

    #[test]
    fn one_bit_sender_msb_first() {
        for byte in [0x00u8, 0xff, 0x81, 0x5a] {
            let (mut bus, host) = SimBus::new();
            host.set_atn(false);
            let result = host.spawn_with_result(host_receive_1bit(host.clone()));
            send_byte_1bit(&mut bus, byte).unwrap();
            bus.finish();
            assert_eq!(result.take(), Some(byte));
        }
    }

    #[test]
    fn one_bit_sender_stops_when_atn_released() {
        let (mut bus, _host) = SimBus::new();
        assert_eq!(send_byte_1bit(&mut bus, 0x12), Err(LoaderError::HostReset));
    }

    // Collects the pairs of each resend attempt, acknowledging attempt
    // `ack`.
    async fn host_resend(host: Host, ack: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            let mut byte = 0u8;
            for index in 0..4 {
                host.next_write().await;
                let t = TimedPairs::KRILL_RESEND;
                byte |= u8::from(host.drive_line(Line::Clock)) << t.clock_bits[index];
                byte |= u8::from(host.drive_line(Line::Data)) << t.data_bits[index];
            }
            bytes.push(byte);
            // CLOCK released after the last pair
            host.next_write().await;
            if bytes.len() == ack {
                host.set_atn(false);
                return bytes;
            }
            // CLOCK pulled for the resend
            host.next_write().await;
        }
    }

    #[test]
    fn resend_until_acknowledged() {
        let (mut bus, host) = SimBus::new();
        let result = host.spawn_with_result(host_resend(host.clone(), 2));
        send_resend(&mut bus, 0xa7);
        bus.finish();
        assert_eq!(result.take(), Some(vec![0xa7, 0xa7]));
        assert!(!bus.wire().atn());
    }
}
