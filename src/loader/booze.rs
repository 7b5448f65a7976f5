//! BoozeLoader.
//!
//! Most disks have a directory sector on track 18 listing the start track
//! and sector of each file, and the host asks for files by index.  Disks
//! without one are loaded by track and sector, with the host checking the
//! disk id first.  Files are sent a whole sector at a time, link bytes
//! included, and the host follows the chain itself.
//!
//! Requests arrive one bit per ATN edge, with the data on CLOCK.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Duration;

use super::Session;
use crate::buffers::Buffer;
use crate::bus::BusLines;
use crate::disk::TrackSector;
use crate::driver::{Command, DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_write_byte, wait_atn_high, wait_atn_low};
use crate::quirks::{BOOZE_QUIRKS, block_delay};
use crate::util::crc::{CRC_INIT, crc16_update};
use crate::util::time::fl::{ATN_TIMEOUT_MS, BOOZE_BYTE_TIMEOUT_MS, BOOZE_FILE_DELAY_MS};
use crate::util::time::{Deadline, Timeout, block_us, poll_until, yield_ms};

const BOOT_TRACK: u8 = 18;
const BOOT_SECTOR: u8 = 0;

/// Offset of the disk id in the boot sector.
const DISK_ID_OFFSET: u8 = 0xff;

/// Directory sectors seen in the wild, in the order they are tried.
const DIR_SECTORS: [u8; 3] = [9, 12, 6];

/// Highest track a directory entry may point to.
const MAX_ENTRY_TRACK: u8 = 42;

/// Lock the bus, directory protocol only.
const LOCK_CMD: u8 = 0xff;

/// ATN phase length limit while watching for the bus unlock pattern.
const LOCK_PHASE_US: u64 = 30;

/// Length of the unlock acknowledge.
const LOCK_ACK_US: u64 = 18;

/// Length and checksum of the M-E commands that install the loader.
static COMMAND_SIGNATURES: &[(usize, u16)] = &[
    (0x29, 0xe711),
    (0x29, 0xab17),
    (0x27, 0xf674),
    (0x26, 0xf700),
];

/// Whether `command` installs BoozeLoader.  The checksum leaves out the
/// address and the last two bytes.
pub fn detect(command: &Command) -> bool {
    let crc = command.crc(5, 2);
    COMMAND_SIGNATURES
        .iter()
        .any(|&(len, sig)| command.len() == len && crc == sig)
}

fn valid_ts(track: u8, sector: u8, sectors: &impl Fn(u8) -> u8) -> bool {
    track > 0 && track <= MAX_ENTRY_TRACK && sector < sectors(track)
}

/// Whether `dir` is a directory sector: at least one valid track/sector
/// pair, then nothing but zeros.
fn looks_like_dir(dir: &Sector, sectors: impl Fn(u8) -> u8) -> bool {
    for (index, pair) in dir.chunks_exact(2).enumerate() {
        if pair[0] == 0 {
            return index > 0 && dir[index * 2 + 1..].iter().all(|&b| b == 0);
        }
        if !valid_ts(pair[0], pair[1], &sectors) {
            return false;
        }
    }
    true
}

/// Send bytes `first` up to the end of the data in `sector`, two bits per
/// ATN edge.  `crc` covers the payload, not the link bytes.
fn send_block<B: BusLines>(
    bus: &mut B,
    sector: &Sector,
    first: u8,
    mut crc: Option<&mut u16>,
) -> Result<(), Timeout> {
    // Host ready
    wait_atn_low(bus, ATN_TIMEOUT_MS)?;

    let last = if sector[0] != 0 { 0xff } else { sector[1] };
    bus.critical(|bus| {
        bus.set_data(true);

        let mut index = first;
        loop {
            let byte = sector[usize::from(index)];
            clocked_write_byte(bus, byte, None, BOOZE_BYTE_TIMEOUT_MS)?;
            if index > 1 {
                if let Some(crc) = crc.as_mut() {
                    **crc = crc16_update(**crc, byte);
                }
            }
            if index == last {
                break;
            }
            index = index.wrapping_add(1);
        }

        // The last pair hasn't been picked up yet
        wait_atn_high(bus);
        bus.set_clock(true);
        bus.set_data(false);
        Ok(())
    })
}

struct Booze<'s, 'a, B: BusLines, D, S> {
    s: &'s mut Session<'a, B, D, S>,
    dir: Buffer<'a>,
    buf: Buffer<'a>,
    /// 0 for track/sector requests
    dir_sector: u8,
}

impl<B, D, S> Booze<'_, '_, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    /// Receive a byte, one bit per ATN high phase.  Returns with DATA
    /// pulled.
    fn get_byte(&mut self) -> Result<u8, Timeout> {
        let mut byte = 0u8;
        for _ in 0..8 {
            self.s.bus.set_data(true);
            byte = self.s.bus.critical(|bus| {
                wait_atn_high(bus);
                block_us!(2);
                let bit = if bus.clock() { 0 } else { 0x80 };
                bus.set_data(false);
                byte >> 1 | bit
            });
            wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;
        }
        Ok(byte)
    }

    /// Look for a directory sector on the boot track.  Leaves
    /// `dir_sector` at 0 if there isn't one.
    async fn find_dir(&mut self) -> Result<(), LoaderError> {
        self.dir_sector = 0;
        for sector in DIR_SECTORS {
            self.s.read(&mut self.dir, BOOT_TRACK, sector).await?;

            // Andropolis has a valid looking sector 6 it doesn't use
            if sector == 6 && self.dir[0] != 1 {
                break;
            }

            if looks_like_dir(&self.dir, self.s.geometry()) {
                debug!("Booze directory in sector {}", sector);
                self.dir_sector = sector;
                return Ok(());
            }
        }
        debug!("Booze track/sector requests");
        Ok(())
    }

    /// Wait until the disk with `disk_id` is inserted, and load its
    /// directory.
    async fn load_dir(&mut self, disk_id: u8) -> Result<(), LoaderError> {
        loop {
            let _ = self.s.signals.take_dir_changed();
            self.s.read(&mut self.dir, BOOT_TRACK, BOOT_SECTOR).await?;
            if self.dir[usize::from(DISK_ID_OFFSET)] == disk_id {
                break;
            }
            info!("Booze wants disk {}", disk_id);
            self.s.wait_disk_change(|bus| bus.atn()).await?;
        }

        self.s.read(&mut self.dir, BOOT_TRACK, self.dir_sector).await?;

        // Acknowledge
        self.s.bus.set_data(true);
        wait_atn_high(self.s.bus);
        self.s.bus.set_data(false);
        Ok(())
    }

    async fn send_file(&mut self, start: TrackSector) -> Result<(), LoaderError> {
        let delay = block_delay(BOOZE_QUIRKS, self.s.file_crc);
        debug!("Booze file at {}/{}", start.track, start.sector);

        yield_ms!(BOOZE_FILE_DELAY_MS);
        self.s.file_crc = CRC_INIT;

        let mut next = start;
        while next.track != 0 {
            if delay > 0 {
                yield_ms!(u64::from(delay));
            }

            self.s.read(&mut self.buf, next.track, next.sector).await?;
            let mut crc = self.s.file_crc;
            send_block(self.s.bus, &self.buf, 0, Some(&mut crc))?;
            self.s.file_crc = crc;

            next = TrackSector::new(self.buf[0], self.buf[1]);
        }
        Ok(())
    }

    /// The host locks the bus while it uses it for something else, and
    /// unlocks it with a low/high/low/high pattern on ATN.  Each phase is
    /// about 18us, and we acknowledge by pulling DATA for the same time.
    async fn bus_locked(&mut self) -> Result<(), LoaderError> {
        debug!("Booze bus locked");
        self.s.bus.set_data(true);

        loop {
            // The lock can last a long time, so the first phase yields
            self.s.wait_request(|bus| !bus.atn()).await?;

            let mut phase = 1u8;
            loop {
                let want_high = phase & 1 == 1;
                let deadline = Deadline::after(Duration::from_micros(LOCK_PHASE_US));
                if poll_until(|| self.s.bus.atn() == want_high, deadline).is_err() {
                    break;
                }
                phase += 1;
            }

            if phase == 4 {
                break;
            }
        }

        self.s.bus.critical(|bus| {
            bus.set_data(false);
            block_us!(LOCK_ACK_US);
            bus.set_data(true);
        });
        debug!("Booze bus unlocked");
        Ok(())
    }

    /// Track/sector protocol.  A request of 0 asks for the disk id, and the
    /// host answers with 0 if it wants a different disk.
    async fn ts_request(&mut self, mut track: u8) -> Result<TrackSector, LoaderError> {
        while track == 0 {
            let _ = self.s.signals.take_dir_changed();

            self.s.read(&mut self.buf, BOOT_TRACK, BOOT_SECTOR).await?;
            send_block(self.s.bus, &self.buf, DISK_ID_OFFSET, None)?;

            // Some productions wait for a key press here
            self.s.wait_request(|bus| !bus.atn()).await?;

            track = self.get_byte()?;
            if track != 0 {
                break;
            }

            info!("Booze wants another disk");
            self.s.wait_disk_change(|bus| bus.atn()).await?;
        }

        let sector = self.get_byte()?;
        Ok(TrackSector::new(track, sector))
    }

    async fn serve(&mut self) -> Result<(), LoaderError> {
        self.find_dir().await?;

        loop {
            self.s.bus.set_data(true);
            self.s.wait_request(|bus| !bus.atn()).await?;

            let cmd = self.get_byte()?;
            if self.s.bus.atn() {
                return Err(LoaderError::HostReset);
            }
            trace!("Booze command {:02x}", cmd);

            let start = if self.dir_sector != 0 {
                match cmd {
                    LOCK_CMD => {
                        self.bus_locked().await?;
                        continue;
                    }
                    0x80.. => {
                        self.load_dir(cmd & 0x7f).await?;
                        continue;
                    }
                    file => {
                        let entry = usize::from(file) << 1;
                        TrackSector::new(self.dir[entry], self.dir[entry + 1])
                    }
                }
            } else {
                self.ts_request(cmd).await?
            };

            if start.track == 0 {
                return Ok(());
            }
            self.send_file(start).await?;
        }
    }
}

/// Run a BoozeLoader session.
pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    // Busy
    session.bus.set_data(false);

    let dir = session.alloc_system()?;
    let buf = session.alloc()?;
    let mut booze = Booze {
        s: session,
        dir,
        buf,
        dir_sector: 0,
    };
    booze.serve().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::sectors_per_track;
    use crate::test::forge::{filler, forge};
    use crate::test::sim::{Host, SimBus};
    use crate::util::crc::crc16;

    #[test]
    fn command_signatures() {
        for &(len, sig) in COMMAND_SIGNATURES {
            let mut bytes = filler(len, 1);
            forge(&mut bytes, 8, sig, |b| crc16(&b[5..b.len() - 2]));
            assert!(detect(&Command::new(&bytes, 0)));

            // The last two bytes aren't checked
            bytes[len - 1] ^= 0xff;
            assert!(detect(&Command::new(&bytes, 0)));

            bytes[12] ^= 0x01;
            assert!(!detect(&Command::new(&bytes, 0)));
        }
    }

    #[test]
    fn wrong_length_is_not_booze() {
        let mut bytes = filler(0x28, 1);
        forge(&mut bytes, 8, 0xf674, |b| crc16(&b[5..b.len() - 2]));
        assert!(!detect(&Command::new(&bytes, 0)));
    }

    #[test]
    fn directory_sectors() {
        let mut dir = [0u8; 256];
        dir[..6].copy_from_slice(&[1, 0, 17, 20, 35, 16]);
        assert!(looks_like_dir(&dir, sectors_per_track));

        // Sector 20 doesn't exist on track 20
        dir[2..4].copy_from_slice(&[20, 20]);
        assert!(!looks_like_dir(&dir, sectors_per_track));

        // Junk after the padding starts
        dir[2..4].copy_from_slice(&[0, 0]);
        dir[100] = 7;
        assert!(!looks_like_dir(&dir, sectors_per_track));

        // No entries at all
        assert!(!looks_like_dir(&[0u8; 256], sectors_per_track));
    }

    async fn host_send(host: Host, byte: u8) {
        for bit in 0..8 {
            host.until(|w| w.drive_data).await;
            host.set_clock(byte & (1 << bit) == 0);
            host.set_atn(true);
            host.until(|w| !w.drive_data).await;
            host.set_atn(false);
        }
        host.set_clock(true);
    }

    #[test]
    fn receives_bits_on_atn() {
        use crate::buffers::BufferPool;
        use crate::loader::LoaderVariant;
        use crate::protocol::RxTx;
        use crate::test::disk::MemDisk;
        use crate::test::signals::ScriptedSignals;

        for byte in [0x00u8, 0xff, 0x12, 0xc5] {
            let (mut bus, host) = SimBus::new();
            host.set_atn(false);
            host.spawn(host_send(host.clone(), byte));

            let pool = BufferPool::new();
            let mut disk = MemDisk::new();
            let mut signals = ScriptedSignals::new();
            let mut session = Session::new(
                &mut bus,
                &mut disk,
                &mut signals,
                &pool,
                0,
                LoaderVariant::Booze,
                RxTx::None,
            );
            let mut booze = Booze {
                dir: session.alloc_system().unwrap(),
                buf: session.alloc().unwrap(),
                s: &mut session,
                dir_sector: 0,
            };
            assert_eq!(booze.get_byte(), Ok(byte));
            // Returns busy
            assert!(!booze.s.bus.wire().drive_data);
        }
    }

    // Host side of send_block, collecting `count` bytes.
    async fn host_collect(host: Host, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        host.set_atn(false);
        // Drive releases DATA once it has seen ATN
        host.next_write().await;
        for _ in 0..count {
            let mut byte = 0u8;
            for pair in 0..4 {
                let writes = host.writes();
                host.set_atn(pair % 2 == 0);
                host.until(move |w| w.writes > writes).await;
                byte |= (u8::from(host.clock()) | u8::from(host.data()) << 1) << (pair * 2);
            }
            out.push(byte);
        }
        host.set_atn(true);
        out
    }

    #[test]
    fn last_block_stops_at_last_used_byte() {
        let mut sector = [0u8; 256];
        sector[0] = 0;
        sector[1] = 4;
        sector[2..5].copy_from_slice(&[0xaa, 0x55, 0x0f]);

        let (mut bus, host) = SimBus::new();
        let result = host.spawn_with_result(host_collect(host.clone(), 5));
        let mut crc = CRC_INIT;
        send_block(&mut bus, &sector, 0, Some(&mut crc)).unwrap();
        bus.finish();

        assert_eq!(result.take(), Some(vec![0, 4, 0xaa, 0x55, 0x0f]));
        assert_eq!(crc, crc16(&[0xaa, 0x55, 0x0f]));
        // Busy
        assert!(!bus.wire().drive_data);
    }
}
