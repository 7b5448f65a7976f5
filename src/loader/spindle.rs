//! Spindle 2.x and 3.x.
//!
//! The host asks for sectors with a 3 byte command: a few flag bits and a
//! bitmap of the sectors wanted on the current track.  A command is made
//! active by the sector data that came before it, so the host never sends
//! one itself.  Track 18 holds the init sector (side id and first command),
//! and on 3.x the flip sector and the async job table.
//!
//! 2.x sends whole sectors with a checksum, resending until the host
//! acknowledges.  3.x sends units of at most 255 bytes, and sectors may
//! carry a continuation record holding the next command and units that are
//! postponed until the end of the command.
//!
//! Each byte goes out two bits per ATN edge, inverted and shuffled.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{LoaderVariant, Session};
use crate::buffers::Buffer;
use crate::bus::{BusLines, BusState};
use crate::constants::STD_TRACKS;
use crate::driver::{Command, DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_write_byte, wait_atn_high, wait_atn_low};
use crate::quirks::{SPINDLE_QUIRKS, block_delay};
use crate::util::crc::{CRC_INIT, crc16, crc16_update};
use crate::util::time::fl::ATN_TIMEOUT_MS;
use crate::util::time::{Deadline, Timeout, block_us, poll_until, yield_ms};

const INIT_TRACK: u8 = 18;
/// Side id and first command.
const INIT_SECTOR: u8 = 17;
/// 3.x: next side id and the retry unit.
const FLIP_SECTOR: u8 = 5;
/// 3.x: track/sector table for async jobs.
const ASYNC_SECTOR: u8 = 6;

/// Bitmap bits available in a command.
const MAX_SECTORS: u8 = 21;

const CMD_LEN: usize = 3;
const SIDE_ID_LEN: usize = 3;

/// 3.x: room for postponed units.
const PP_LEN: usize = 0x60 - 3;

/// Length of the 2.x init sector hash, which leaves out the side ids and the
/// first command.
const V2_HASH_LEN: usize = 0xf7;

/// 2.x command flags.
const CMD2_EOF1: u8 = 1 << 6;
const CMD2_NEXTTRACK: u8 = 1 << 5;
/// Same bit as [`CMD2_NEXTTRACK`], when no sectors are requested.
const CMD2_RESET: u8 = 1 << 5;

/// 3.x command flags.
const CMD3_NEWJOB: u8 = 1 << 7;
const CMD3_NEXTTRACK: u8 = 1 << 6;
const CMD3_ONDEMAND: u8 = 1 << 5;

/// 3.x sector flags.
const FLAG_FULLSECT: u8 = 1 << 7;
const FLAG_CONTREC: u8 = 1 << 6;

/// How long the host has to acknowledge a 2.x block before it is resent.
const V2_ACK_TIMEOUT_MS: u32 = 10;

/// How long the host has to acknowledge EOF1 on 2.2 and later.
const V2_EOF1_TIMEOUT_MS: u32 = 2000;

/// Bit shuffle, 57460213.
const ENCODING_V2: [u8; 8] = [1 << 3, 1 << 1, 1 << 2, 1 << 0, 1 << 6, 1 << 4, 1 << 7, 1 << 5];

/// Bit shuffle, 76540213.
const ENCODING_V3: [u8; 8] = [1 << 3, 1 << 1, 1 << 2, 1 << 0, 1 << 4, 1 << 5, 1 << 6, 1 << 7];

/// Identify the Spindle drivecode from its M-E command.
///
/// All 2.x releases but one share their drivecode, and return
/// `Some(LoaderVariant::None)`.  The session works out the version from the
/// init sector on the disk.
pub fn detect(command: &Command) -> Option<LoaderVariant> {
    if command.len() != 0x17 && command.len() != 0x29 {
        return None;
    }

    match command.crc(5, 2) {
        0x6027 => Some(LoaderVariant::Spindle3),
        0xe438 => Some(LoaderVariant::None),
        // 2.3 with custom drivecode support, from ES1RA and Amanita 80%
        0x2c76 => Some(LoaderVariant::Spindle23),
        _ => None,
    }
}

/// The 2.x version from a hash of the init sector.
fn dot_version(init: &Sector) -> Option<LoaderVariant> {
    match crc16(&init[..V2_HASH_LEN]) {
        0x889e => Some(LoaderVariant::Spindle21),
        0xd126 => Some(LoaderVariant::Spindle22),
        0x7ee2 => Some(LoaderVariant::Spindle23),
        _ => None,
    }
}

fn sector_bit(sector: u8) -> (usize, u8) {
    let bit = sector + 3;
    (usize::from(bit >> 3), 0x80 >> (bit & 7))
}

/// A command asking for `sector` only, with no flags.
fn request(sector: u8) -> [u8; CMD_LEN] {
    let mut cmd = [0; CMD_LEN];
    let (index, mask) = sector_bit(sector);
    cmd[index] |= mask;
    cmd
}

/// A command for an async job, from its entries in the job table.  The
/// table comes from the disk, so anything outside the bitmap or the image is
/// refused.
fn job_request(track: u8, sector: u8) -> Result<[u8; CMD_LEN], LoaderError> {
    if sector >= MAX_SECTORS || track == 0 || track > STD_TRACKS {
        warn!("Spindle job for {}/{}", track, sector);
        return Err(LoaderError::Protocol);
    }
    Ok(request(sector))
}

/// The first sector from `sector` on that `cmd` asks for.
fn next_sector(cmd: &[u8; CMD_LEN], sector: u8) -> Option<u8> {
    (sector..MAX_SECTORS).find(|&s| {
        let (index, mask) = sector_bit(s);
        cmd[index] & mask != 0
    })
}

/// The track after `track`, skipping the init track.
fn advance(track: u8) -> u8 {
    let next = track.wrapping_add(1);
    if next == INIT_TRACK { next + 1 } else { next }
}

/// Send a 2.x block: the sector, then its checksum.  Returns the checksum
/// if the host acknowledged the block, `None` if it has to be resent.
fn transmit_v2<B: BusLines>(bus: &mut B, sector: &Sector) -> Result<Option<u8>, Timeout> {
    let sum = bus.critical(|bus| {
        let mut sum = 0u8;
        for &byte in sector.iter() {
            sum ^= byte;
            clocked_write_byte(bus, !byte, Some(&ENCODING_V2), ATN_TIMEOUT_MS)?;
        }
        clocked_write_byte(bus, !sum, Some(&ENCODING_V2), ATN_TIMEOUT_MS)?;
        Ok::<_, Timeout>(sum)
    })?;

    // The last pair hasn't been picked up yet
    wait_atn_high(bus);
    bus.set_lines(true, true);

    let ack = poll_until(
        || bus.read().intersects(BusState::CLOCK | BusState::DATA),
        Deadline::from_ms(V2_ACK_TIMEOUT_MS),
    );
    Ok(ack.ok().map(|()| sum))
}

/// Receive a 3.x async job number, 7 bits MSB first, with ATN as the clock
/// and the bits on CLOCK.
fn receive_job<B: BusLines>(bus: &mut B) -> Result<u8, Timeout> {
    bus.critical(|bus| {
        let mut job = 0u8;
        for _ in 0..7 {
            bus.set_data(true);
            wait_atn_high(bus);
            block_us!(2);
            job = job << 1 | u8::from(!bus.clock());
            bus.set_data(false);
            wait_atn_low(bus, ATN_TIMEOUT_MS)?;
        }
        Ok(job)
    })
}

struct Spindle<'s, 'a, B: BusLines, D, S> {
    s: &'s mut Session<'a, B, D, S>,
    buf: Buffer<'a>,
    track: u8,
    cmd: [u8; CMD_LEN],
    next_cmd: [u8; CMD_LEN],
    next_id: [u8; SIDE_ID_LEN],
    /// 3.x postponed units, stored like units in a sector: each length
    /// byte above its data, the first at the top, a zero length below the
    /// last.
    pp_units: [u8; PP_LEN],
    /// Delay between 3.x units, in ms.
    block_delay: u8,
    /// 3.x checksum of the current job's units, which keys the quirks.
    job_crc: u16,
    /// The init sector of the first disk has been seen.
    init_done: bool,
}

impl<B, D, S> Spindle<'_, '_, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    fn variant(&self) -> LoaderVariant {
        self.s.variant
    }

    /// Send the current 2.x sector until the host acknowledges it, then
    /// pick up the next command if the checksum says there is one.
    async fn send_block_v2(&mut self) -> Result<(), LoaderError> {
        let v21 = self.variant() == LoaderVariant::Spindle21;
        let sum = loop {
            self.s.bus.set_lines(v21, !v21);

            // The host can take as long as it likes
            self.s.wait_request(|bus| !bus.atn()).await?;

            if let Some(sum) = transmit_v2(self.s.bus, &self.buf)? {
                break sum;
            }
            trace!("Spindle block not acknowledged, resending");
        };

        if sum & 0x80 != 0 {
            self.next_cmd = [sum, self.buf[0], self.buf[0] ^ self.buf[1]];
        }
        Ok(())
    }

    /// The host raises EOF1 by pulling CLOCK or DATA (which depends on the
    /// version) once it has everything it wants.  We answer with EOF2 and
    /// wait for it to be acknowledged with an ATN pulse.
    async fn eof_handshake_v2(&mut self) -> Result<(), LoaderError> {
        let both = BusState::CLOCK | BusState::DATA;
        if self.s.bus.read().contains(both) {
            return Ok(());
        }

        self.s.bus.set_lines(false, false);
        self.s.wait_request(|bus| !bus.atn()).await?;
        // Some productions ask for a disk change before acknowledging
        self.s.wait_request(|bus| bus.atn()).await?;
        self.s.bus.set_lines(true, true);

        // 2.1 releases both lines after acknowledging, so a reset can't be
        // told apart
        let variant = self.variant();
        if variant != LoaderVariant::None && variant != LoaderVariant::Spindle21 {
            block_us!(2);
            if self.s.bus.data() {
                return Err(LoaderError::HostReset);
            }
        }
        Ok(())
    }

    /// Handle the 2.x init sector, in the buffer.  Returns false if this
    /// is a different disk to the one the host wants.
    fn init_sector_v2(&mut self) -> Result<bool, LoaderError> {
        if self.init_done {
            if self.next_id[..] != self.buf[0xf7..0xf7 + SIDE_ID_LEN] {
                return Ok(false);
            }

            // Make the host's flip call return.  2.1 waits for a second ATN
            // pulse at this point, but EOF1 on the first command works too.
            self.buf[0xfd] |= CMD2_EOF1;
        } else {
            if self.variant() == LoaderVariant::None {
                let Some(variant) = dot_version(&self.buf) else {
                    info!("Unknown Spindle 2.x version");
                    return Err(LoaderError::Protocol);
                };
                self.s.set_variant(variant);
            }

            // All but 2.1 start with EOF1 on the first disk
            if self.variant() != LoaderVariant::Spindle21 {
                self.buf[0xfd] |= CMD2_EOF1;
            }
            self.init_done = true;
        }

        let reversed_id = self.variant() >= LoaderVariant::Spindle23;
        for ii in 0..CMD_LEN {
            self.next_cmd[ii] = self.buf[0xfd + ii];
            self.next_id[ii] = if reversed_id {
                self.buf[0xfc - ii]
            } else {
                self.buf[0xfa + ii]
            };
        }
        self.track = 1;
        Ok(true)
    }

    async fn serve_v2(&mut self) -> Result<(), LoaderError> {
        loop {
            let mut sector = 0;
            while let Some(found) = next_sector(&self.cmd, sector) {
                sector = found;

                let _ = self.s.signals.take_dir_changed();
                self.s.read(&mut self.buf, self.track, sector).await?;

                self.eof_handshake_v2().await?;

                if self.track == INIT_TRACK {
                    if sector != INIT_SECTOR {
                        return Err(LoaderError::Protocol);
                    }
                    if !self.init_sector_v2()? {
                        info!("Spindle waiting for the other side");
                        self.s.wait_disk_change(|bus| !bus.atn()).await?;
                        continue;
                    }
                    // Nothing to send for the init sector
                    break;
                }

                self.send_block_v2().await?;
                sector += 1;
            }

            let [flags, bitmap1, bitmap2] = self.next_cmd;
            if flags & 0x1f == 0 && bitmap1 == 0 && bitmap2 == 0 {
                if flags & CMD2_RESET != 0 {
                    debug!("Spindle reset");
                    self.s.bus.set_lines(false, false);
                    let _ = wait_atn_low(self.s.bus, ATN_TIMEOUT_MS);
                    return Ok(());
                }

                // Flip: load the init sector of the next side
                self.track = INIT_TRACK;
                self.next_cmd = request(INIT_SECTOR);
                self.next_cmd[0] |= CMD2_EOF1;
            }

            if self.next_cmd[0] & CMD2_NEXTTRACK != 0 {
                self.track = advance(self.track);
            }

            if self.next_cmd[0] & CMD2_EOF1 != 0 {
                if self.variant() == LoaderVariant::Spindle21 {
                    self.s.bus.set_clock(false);
                } else {
                    self.s.bus.set_data(false);
                    wait_atn_low(self.s.bus, V2_EOF1_TIMEOUT_MS)?;
                }
            }

            self.cmd = self.next_cmd;
        }
    }

    /// Take the next command and the postponed units from a 3.x
    /// continuation record.  Returns the offset of the length byte of the
    /// first regular unit, which is 0 if there are none.
    fn copy_cr(&mut self) -> u8 {
        let mut pos = 0xff - 2;
        self.next_cmd
            .copy_from_slice(&self.buf[usize::from(pos)..usize::from(pos) + CMD_LEN]);
        pos -= 1;

        let mut dest = PP_LEN - 1;
        loop {
            let len = usize::from(self.buf[usize::from(pos)]);
            if len == 0 || len > 4 || len >= dest {
                break;
            }
            for _ in 0..=len {
                self.pp_units[dest] = self.buf[usize::from(pos)];
                dest -= 1;
                pos -= 1;
            }
        }

        if dest == PP_LEN - 1 {
            // A dummy unit, so there's always something to send at the end
            self.pp_units[dest] = 3;
            dest -= 4;
        }
        self.pp_units[dest] = 0;

        pos
    }

    /// Send 3.x units, starting with the length byte at `pos`, either from
    /// the sector buffer or the postponed units.  A `pos` of 0 sends the
    /// whole sector but the flags as a single unit.  Returns early, without
    /// an error, if the host interrupts with an async request.
    async fn send_units(&mut self, mut pos: u8, postponed: bool) -> Result<(), LoaderError> {
        let mut unit_len = if pos != 0 {
            self.unit_byte(postponed, pos)
        } else {
            0xff
        };

        while unit_len > 0 {
            if pos > 0 && unit_len >= pos {
                warn!("Spindle unit length {} at {}", unit_len, pos);
                return Err(LoaderError::Protocol);
            }
            pos = pos.wrapping_sub(unit_len);

            if postponed {
                self.s.wait_request(|bus| !bus.clock()).await?;
            }

            self.s.bus.set_data(true);
            wait_atn_high(self.s.bus);
            block_us!(2);
            if self.s.bus.data() {
                // Async request, or reset
                return Ok(());
            }

            // Chain heads, and hosts that have released CLOCK, get the
            // status on CLOCK
            let chain = (postponed && unit_len == 2) || self.s.bus.clock();
            let new_job = self.next_cmd[0] & CMD3_NEWJOB != 0;
            let data: &[u8] = if postponed { &self.pp_units } else { &self.buf[..] };
            let mut crc = self.job_crc;

            unit_len = self.s.bus.critical(|bus| {
                clocked_write_byte(bus, unit_len, None, ATN_TIMEOUT_MS)?;
                for index in (0..unit_len).rev() {
                    let byte = data[usize::from(pos) + usize::from(index)];
                    crc = crc16_update(crc, byte);
                    clocked_write_byte(bus, byte ^ 0x7f, Some(&ENCODING_V3), ATN_TIMEOUT_MS)?;
                }

                wait_atn_high(bus);

                let next_len = if pos > 1 {
                    pos -= 1;
                    data[usize::from(pos)]
                } else {
                    0
                };

                bus.set_clock(!chain);
                // DATA says more to come, unless that was the job's last unit
                bus.set_data(next_len == 0 && postponed && new_job);
                Ok::<_, Timeout>(next_len)
            })?;
            self.job_crc = crc;

            wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;
            self.s.bus.set_lines(true, false);

            if self.block_delay > 0 {
                yield_ms!(u64::from(self.block_delay));
            }
        }
        Ok(())
    }

    fn unit_byte(&self, postponed: bool, pos: u8) -> u8 {
        if postponed {
            self.pp_units[usize::from(pos)]
        } else {
            self.buf[usize::from(pos)]
        }
    }

    /// Handle a 3.x sector on the init track.  Returns true if the sector's
    /// units should be sent, false if the command has been replaced and
    /// should be restarted.
    async fn init_track_v3(&mut self) -> Result<bool, LoaderError> {
        self.job_crc = CRC_INIT;

        match self.buf[0] & 0x1f {
            INIT_SECTOR => {
                let mut side_id = [0u8; SIDE_ID_LEN];
                side_id.copy_from_slice(&self.buf[0xf9..0xf9 + SIDE_ID_LEN]);
                if self.init_done {
                    if self.next_id != side_id {
                        info!("Spindle waiting for the other side");
                        let _ = self.s.signals.take_dir_changed();
                        self.s.wait_disk_change(|bus| bus.atn()).await?;
                        return Ok(false);
                    }
                    self.buf[0xfd] |= CMD3_NEWJOB;
                } else {
                    // An async request for the first job checks against this
                    self.next_id = side_id;
                    self.init_done = true;
                }
                self.track = 1;
            }

            FLIP_SECTOR => {
                // The retry unit has to be sent even if this isn't a flip,
                // so the host's loader call returns.  Waiting for the other
                // side happens in the init sector.
                self.next_id.copy_from_slice(&self.buf[1..1 + SIDE_ID_LEN]);
                self.buf[0] = self.buf[0x0e];
                self.buf.copy_within(4..14, 0xff - 9);
            }

            ASYNC_SECTOR => {
                wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;
                let job = receive_job(self.s.bus)?;
                debug!("Spindle async job {}", job);

                // The table only has room for 64 jobs
                if job > 0x40 {
                    return Err(LoaderError::Protocol);
                }
                // Stored as half tracks
                let track = self.buf[usize::from(0x80 - job)] >> 1;
                self.cmd = job_request(track, self.buf[usize::from(0x40 - job)])?;
                self.track = track;
                self.cmd[0] |= CMD3_ONDEMAND;
                return Ok(false);
            }

            sector => {
                warn!("Spindle unexpected sector {}", sector);
                return Err(LoaderError::Protocol);
            }
        }
        Ok(true)
    }

    async fn serve_v3(&mut self) -> Result<(), LoaderError> {
        self.s.bus.set_data(false);
        wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;

        'command: loop {
            let mut sector = 0;
            while let Some(found) = next_sector(&self.cmd, sector) {
                sector = found;
                self.s.read(&mut self.buf, self.track, sector).await?;

                if self.track == INIT_TRACK {
                    if !self.init_track_v3().await? {
                        continue 'command;
                    }
                } else if self.cmd[0] & CMD3_ONDEMAND != 0 {
                    // First sector of an async job: skip its units
                    self.buf[0xff - 3] = 0;
                    self.buf[0xff - 2] &= !CMD3_NEWJOB;
                    self.job_crc = CRC_INIT;
                }

                let unit_start = match self.buf[0] & (FLAG_FULLSECT | FLAG_CONTREC) {
                    FLAG_FULLSECT => 0,
                    FLAG_CONTREC => self.copy_cr(),
                    _ => 0xff,
                };
                self.send_units(unit_start, false).await?;

                if self.s.bus.data() {
                    if self.s.bus.clock() {
                        return Err(LoaderError::HostReset);
                    }
                    // Async request: drop this command, and read the job
                    // table
                    self.s.bus.set_data(false);
                    self.track = INIT_TRACK;
                    self.cmd = request(ASYNC_SECTOR);
                    continue 'command;
                }

                sector += 1;
            }

            // There is always at least the dummy unit
            self.send_units((PP_LEN - 1) as u8, true).await?;

            match self.next_cmd[0] & (CMD3_NEXTTRACK | CMD3_ONDEMAND) {
                0 => {}
                CMD3_NEXTTRACK => self.track = advance(self.track),
                CMD3_ONDEMAND => self.track = INIT_TRACK,
                flags => {
                    warn!("Spindle command flags {:02x}", flags);
                    return Err(LoaderError::Protocol);
                }
            }

            if self.next_cmd[0] & CMD3_NEWJOB != 0 {
                self.block_delay = block_delay(SPINDLE_QUIRKS, self.job_crc);
                self.job_crc = CRC_INIT;
            }

            self.cmd = self.next_cmd;
        }
    }
}

/// Run a Spindle session.  The session's variant is [`LoaderVariant::None`]
/// for 2.x drivecode that hasn't been narrowed down yet, and is left that
/// way if the disk isn't from a known release.
pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    let buf = session.alloc_system()?;
    let mut spindle = Spindle {
        s: session,
        buf,
        track: INIT_TRACK,
        cmd: request(INIT_SECTOR),
        next_cmd: [0; CMD_LEN],
        next_id: [0; SIDE_ID_LEN],
        pp_units: [0; PP_LEN],
        block_delay: 0,
        job_crc: CRC_INIT,
        init_done: false,
    };
    if spindle.variant() == LoaderVariant::Spindle3 {
        spindle.serve_v3().await
    } else {
        spindle.serve_v2().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use crate::test::disk::MemDisk;
    use crate::test::forge::{filler, forge};
    use crate::test::signals::ScriptedSignals;
    use crate::protocol::RxTx;
    use crate::test::sim::{Host, SimBus};

    #[test]
    fn sector_bitmaps() {
        assert_eq!(request(0), [0x10, 0, 0]);
        assert_eq!(request(INIT_SECTOR), [0, 0, 0x08]);
        assert_eq!(request(20), [0, 0, 0x01]);

        let cmd = [0x05, 0x80, 0x01];
        assert_eq!(next_sector(&cmd, 0), Some(2));
        assert_eq!(next_sector(&cmd, 3), Some(4));
        assert_eq!(next_sector(&cmd, 5), Some(5));
        assert_eq!(next_sector(&cmd, 6), Some(20));
        assert_eq!(next_sector(&cmd, 21), None);
        assert_eq!(next_sector(&[0xe0, 0, 0], 0), None);
    }

    #[test]
    fn async_jobs_stay_on_the_disk() {
        assert_eq!(job_request(17, 20), Ok(request(20)));
        assert_eq!(job_request(35, 0), Ok(request(0)));
        // Past the end of the bitmap
        assert_eq!(job_request(18, 21), Err(LoaderError::Protocol));
        assert_eq!(job_request(18, 30), Err(LoaderError::Protocol));
        assert_eq!(job_request(18, 0xff), Err(LoaderError::Protocol));
        // Off the disk
        assert_eq!(job_request(0, 1), Err(LoaderError::Protocol));
        assert_eq!(job_request(36, 1), Err(LoaderError::Protocol));
    }

    #[test]
    fn skips_init_track() {
        assert_eq!(advance(1), 2);
        assert_eq!(advance(17), 19);
    }

    #[test]
    fn command_signatures() {
        let cases = [
            (0x29, 0x6027, Some(LoaderVariant::Spindle3)),
            (0x17, 0xe438, Some(LoaderVariant::None)),
            (0x29, 0x2c76, Some(LoaderVariant::Spindle23)),
            (0x18, 0x6027, None),
        ];
        for (len, sig, expected) in cases {
            let mut bytes = filler(len, 4);
            forge(&mut bytes, 9, sig, |b| crc16(&b[5..b.len() - 2]));
            assert_eq!(detect(&Command::new(&bytes, 0)), expected);
        }
    }

    #[test]
    fn v2_versions() {
        for (sig, variant) in [
            (0x889e, LoaderVariant::Spindle21),
            (0xd126, LoaderVariant::Spindle22),
            (0x7ee2, LoaderVariant::Spindle23),
        ] {
            let mut init = [0u8; 256];
            init.copy_from_slice(&filler(256, 7));
            forge(&mut init, 0x20, sig, |b| crc16(&b[..V2_HASH_LEN]));
            assert_eq!(dot_version(&init), Some(variant));

            // Side ids and the first command don't count
            init[0xf8] ^= 0xff;
            init[0xfe] ^= 0xff;
            assert_eq!(dot_version(&init), Some(variant));
        }
        assert_eq!(dot_version(&[0; 256]), None);
    }

    fn with_spindle(test: impl FnOnce(&mut Spindle<'_, '_, SimBus, MemDisk, ScriptedSignals>, &Host)) {
        let (mut bus, host) = SimBus::new();
        let pool = BufferPool::new();
        let mut disk = MemDisk::new();
        let mut signals = ScriptedSignals::new();
        let mut session = Session::new(
            &mut bus,
            &mut disk,
            &mut signals,
            &pool,
            0,
            LoaderVariant::Spindle3,
            RxTx::None,
        );
        let mut spindle = Spindle {
            buf: session.alloc_system().unwrap(),
            s: &mut session,
            track: INIT_TRACK,
            cmd: request(INIT_SECTOR),
            next_cmd: [0; CMD_LEN],
            next_id: [0; SIDE_ID_LEN],
            pp_units: [0; PP_LEN],
            block_delay: 0,
            job_crc: CRC_INIT,
            init_done: false,
        };
        test(&mut spindle, &host);
    }

    #[test]
    fn continuation_record_with_postponed_unit() {
        with_spindle(|spindle, _| {
            spindle.buf.fill(0);
            spindle.buf[0xfd..].copy_from_slice(&[0xc0, 0x12, 0x34]);
            // One postponed unit of 2 bytes
            spindle.buf[0xfc] = 2;
            spindle.buf[0xfa..0xfc].copy_from_slice(&[0xaa, 0xbb]);
            // Regular units start here
            spindle.buf[0xf9] = 0x10;

            assert_eq!(spindle.copy_cr(), 0xf9);
            assert_eq!(spindle.next_cmd, [0xc0, 0x12, 0x34]);
            assert_eq!(spindle.pp_units[PP_LEN - 3..], [0xaa, 0xbb, 2]);
            assert_eq!(spindle.pp_units[PP_LEN - 4], 0);
        });
    }

    #[test]
    fn continuation_record_without_postponed_units() {
        with_spindle(|spindle, _| {
            spindle.buf.fill(0);
            spindle.buf[0xfd..].copy_from_slice(&[0x40, 0x00, 0x01]);
            assert_eq!(spindle.copy_cr(), 0xfc);
            assert_eq!(spindle.pp_units[PP_LEN - 1], 3);
            assert_eq!(spindle.pp_units[PP_LEN - 5], 0);
        });
    }

    async fn host_send_job(host: Host, job: u8) {
        host.set_atn(false);
        for bit in (0..7).rev() {
            host.until(|w| w.drive_data).await;
            host.set_clock(job & (1 << bit) == 0);
            host.set_atn(true);
            host.until(|w| !w.drive_data).await;
            host.set_atn(false);
        }
        host.set_clock(true);
    }

    #[test]
    fn async_job_numbers() {
        for job in [0u8, 1, 0x3f, 0x55] {
            let (mut bus, host) = SimBus::new();
            host.spawn(host_send_job(host.clone(), job));
            assert_eq!(receive_job(&mut bus), Ok(job));
        }
    }

    // Host side of a 2.x block: 257 shuffled and inverted bytes.
    async fn host_receive_v2(host: Host) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..257 {
            let mut wire = 0u8;
            for pair in 0..4 {
                let writes = host.writes();
                host.set_atn(pair % 2 == 0);
                host.until(move |w| w.writes > writes).await;
                wire |= (u8::from(host.clock()) | u8::from(host.data()) << 1) << (pair * 2);
            }
            let mut byte = 0u8;
            for (bit, mask) in ENCODING_V2.iter().enumerate() {
                if wire & (1 << bit) != 0 {
                    byte |= mask;
                }
            }
            out.push(!byte);
        }
        host.set_atn(true);
        out
    }

    #[test]
    fn v2_block_with_checksum() {
        let mut sector = [0u8; 256];
        sector.copy_from_slice(&filler(256, 3));
        let sum = sector.iter().fold(0u8, |sum, b| sum ^ b);

        let (mut bus, host) = SimBus::new();
        host.set_atn(false);
        let result = host.spawn_with_result(host_receive_v2(host.clone()));
        assert_eq!(transmit_v2(&mut bus, &sector), Ok(Some(sum)));
        bus.finish();

        let received = result.take().unwrap();
        assert_eq!(received[..256], sector[..]);
        assert_eq!(received[256], sum);
    }

    #[test]
    fn v2_block_resent_without_ack() {
        let sector = [0u8; 256];
        let (mut bus, host) = SimBus::new();
        host.set_atn(false);
        let h = host.clone();
        host.spawn(async move {
            host_receive_v2(h.clone()).await;
            // Hold both lines, so no acknowledge
            h.set_clock(false);
            h.set_data(false);
        });
        assert_eq!(transmit_v2(&mut bus, &sector), Ok(None));
    }
}
