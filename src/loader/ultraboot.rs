//! Ultraboot and Ultraboot Menue.
//!
//! Ultraboot puts its payload on the extra tracks of an extended image,
//! packing the tracks from 36 on more densely than the image format does.
//! The loader in sector 36/0 records the density as a speed zone, and the
//! payload is a chain of sectors linked through their last two bytes.
//!
//! There are no requests.  Once the host is ready every sector of the chain
//! is sent, a byte at a time, with fixed timing from a start pulse on DATA.
//!
//! Ultraboot Maker writes such disks.  It formats each extra track with
//! drivecode left in the channel 2 buffer, then writes the sectors one at a
//! time with a second M-E.  Neither needs the bus, only the image.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

use super::Session;
use crate::bus::{BusLines, BusState};
use crate::disk::TrackSector;
use crate::constants::SECTOR_SIZE;
use crate::driver::{Channels, Command, DriveSignals, LoaderError, MediaError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::TimedPairs;
use crate::protocol::timed::at;
use crate::util::crc::{CRC_INIT, crc16_update};
use crate::util::time::block_until;
use crate::util::time::fl::ULTRABOOT_START_DELAY_MS;
use crate::util::time::yield_ms;

/// M-E address of both loaders.
const EXEC_ADDRESS: u16 = 0x0205;

/// Command offsets of the start track and sector, which vary between
/// disks.
const START_TRACK: usize = 6;
const START_SECTOR: usize = 11;

const ULTRABOOT_CRC: u16 = 0xd75a;
const MENUE_CRC: u16 = 0x3e82;

/// M-E addresses of Ultraboot Maker's format and write code.
pub const FORMAT_ADDRESS: u16 = 0x0417;
pub const WRITE_ADDRESS: u16 = 0x0424;

/// Channel whose buffer holds the format code, and later the sector data.
const MAKER_CHANNEL: u8 = 2;

/// Checksum of the format code, leaving out its last two bytes.
const FORMAT_CRC: u16 = 0x60db;

/// Command offsets of the track and sector to format or write.
const MAKER_TRACK: usize = 5;
const MAKER_SECTOR: usize = 6;

/// Image size once formatting reaches the extra tracks.
const EXTENDED_TRACKS: u8 = 40;
const DENSE_TRACKS: u8 = 42;

/// Where the loader sector is, and so the first track of the dense area.
const LOADER_TRACK: u8 = 36;
const LOADER_SECTOR: u8 = 0;

/// Speed zone in the loader sector, in bits 5 and 6.
const SPEED_ZONE_OFFSET: usize = 207;

/// Highest track of an extended image.
const MAX_TRACK: u8 = 40;

/// Sectors per track of the image from track 36 on.
const IMAGE_SECTORS: u16 = 17;

/// Sectors per track Ultraboot packs in, by speed zone.
const ZONE_SECTORS: [u16; 4] = [17, 18, 19, 21];

/// Offsets of the link to the next sector.
const LINK_SECTOR: usize = 254;
const LINK_TRACK: usize = 255;

/// Bus timings, in units of 100ns after the reference.
const START_PULSE_END: u16 = 150;
const DATA_RELEASE: u16 = 510;
const ACK_SAMPLE: u16 = 560;

/// Where the chain starts, and the speed zone to begin with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Start {
    pub track: u8,
    pub sector: u8,
    pub speed_zone: u8,
}

/// Identify Ultraboot from its M-E command.  The checksum skips the start
/// track and sector.
pub fn detect(command: &Command) -> Option<Start> {
    if command.address() != EXEC_ADDRESS {
        return None;
    }

    let crc = (5..command.len())
        .filter(|&i| i != START_TRACK && i != START_SECTOR)
        .fold(CRC_INIT, |crc, i| crc16_update(crc, command.byte(i)));

    match crc {
        // The speed zone comes from the loader sector, which isn't mapped
        ULTRABOOT_CRC => Some(Start {
            track: LOADER_TRACK,
            sector: LOADER_SECTOR,
            speed_zone: 0,
        }),
        MENUE_CRC => Some(Start {
            track: command.byte(START_TRACK),
            sector: command.byte(START_SECTOR),
            speed_zone: 0,
        }),
        _ => None,
    }
}

/// Map an Ultraboot track and sector onto the image.
pub fn map_sector(speed_zone: u8, track: u8, sector: u8) -> TrackSector {
    if speed_zone == 0 || track < LOADER_TRACK {
        return TrackSector::new(track, sector);
    }

    let per_track = ZONE_SECTORS[usize::from(speed_zone & 3)];
    let index = per_track * u16::from(track - LOADER_TRACK) + u16::from(sector);
    // Both fit, as index is below 5 * 21
    TrackSector::new(
        LOADER_TRACK + (index / IMAGE_SECTORS) as u8,
        (index % IMAGE_SECTORS) as u8,
    )
}

/// A track for Ultraboot Maker to format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Format {
    pub track: u8,
    pub speed_zone: u8,
}

impl Format {
    /// Whether the track is in the dense area, whose sectors get marked and
    /// whose later writes are mapped through the speed zone.
    pub fn is_dense(&self) -> bool {
        (LOADER_TRACK..=MAX_TRACK).contains(&self.track)
    }
}

/// Identify Ultraboot Maker's format code, which is in the channel 2
/// buffer rather than the command.  Its second last byte is the speed zone.
pub fn detect_format<D: Channels>(disk: &D, command: &Command) -> Option<Format> {
    if command.address() != FORMAT_ADDRESS {
        return None;
    }

    let code = disk.channel_buffer(MAKER_CHANNEL)?;
    let (body, settings) = code.split_at(code.len().checked_sub(2)?);
    let crc = body.iter().fold(CRC_INIT, |crc, &b| crc16_update(crc, b));
    if crc != FORMAT_CRC || settings[0] & !0x60 != 0 {
        return None;
    }

    Some(Format {
        track: command.byte(MAKER_TRACK),
        speed_zone: settings[0] >> 5,
    })
}

/// Format one track for Ultraboot Maker.  Tracks below the dense area are
/// left alone.  On reaching track 36 the image is extended, and every
/// sector the track maps onto is marked good.
pub async fn format<D: SectorIo>(disk: &mut D, part: u8, format: Format) -> Result<(), MediaError> {
    if !disk.is_d41(part) {
        warn!("Ultraboot Maker needs a D41 image");
        return Err(MediaError::NotReady);
    }
    if format.track > MAX_TRACK {
        return Err(MediaError::IllegalTrackSector);
    }
    if format.track < LOADER_TRACK {
        return Ok(());
    }

    if format.track == LOADER_TRACK {
        let tracks = if format.speed_zone > 0 {
            DENSE_TRACKS
        } else {
            EXTENDED_TRACKS
        };
        disk.extend_image(part, tracks).await?;
    }

    let zone = format.speed_zone;
    let first = map_sector(zone, format.track, 0);
    let last_sector = ZONE_SECTORS[usize::from(zone & 3)] as u8 - 1;
    let mut ts = map_sector(zone, format.track, last_sector);
    debug!(
        "Ultraboot format track {}, sectors {}/{} to {}/{}",
        format.track, first.track, first.sector, ts.track, ts.sector
    );

    loop {
        disk.mark_sector_ok(part, ts.track, ts.sector).await?;
        if ts == first {
            return Ok(());
        }
        ts = match ts.sector {
            0 => TrackSector::new(ts.track - 1, IMAGE_SECTORS as u8 - 1),
            sector => TrackSector::new(ts.track, sector - 1),
        };
    }
}

/// Write the channel 2 buffer to the sector in the command, mapped through
/// the speed zone of the last format.
pub async fn write<D: SectorIo + Channels>(
    disk: &mut D,
    part: u8,
    speed_zone: u8,
    command: &Command<'_>,
) -> Result<(), MediaError> {
    let track = command.byte(MAKER_TRACK);
    let sector = command.byte(MAKER_SECTOR);
    if track > MAX_TRACK {
        return Err(MediaError::IllegalTrackSector);
    }
    let ts = map_sector(speed_zone, track, sector);

    let Some(data) = disk.channel_buffer(MAKER_CHANNEL) else {
        return Ok(());
    };
    let mut block: Sector = [0; SECTOR_SIZE];
    let len = data.len().min(SECTOR_SIZE);
    block[..len].copy_from_slice(&data[..len]);

    trace!("Ultraboot write {}/{} to {}/{}", track, sector, ts.track, ts.sector);
    disk.write_sector(&block, part, ts.track, ts.sector).await
}

/// Send a byte.  The host releases DATA when it is ready, we answer with a
/// start pulse on DATA, then four bit pairs, and the host pulls DATA to
/// acknowledge.
fn send_byte<B: BusLines>(bus: &mut B, byte: u8) -> Result<(), LoaderError> {
    bus.critical(|bus| {
        loop {
            let state = bus.read();
            if state.contains(BusState::DATA) {
                break;
            }
            if !state.contains(BusState::ATN) {
                return Err(LoaderError::HostReset);
            }
        }

        let reference = Instant::now() + Duration::from_micros(1);
        block_until(reference);
        bus.set_data(false);
        block_until(at(reference, START_PULSE_END));
        bus.set_data(true);

        TimedPairs::ULTRABOOT.send(bus, reference, byte);

        block_until(at(reference, DATA_RELEASE));
        bus.set_data(true);

        block_until(at(reference, ACK_SAMPLE));
        if bus.data() {
            return Err(LoaderError::Timeout);
        }
        Ok(())
    })
}

fn send_block<B: BusLines>(bus: &mut B, block: &Sector) -> Result<(), LoaderError> {
    block.iter().try_for_each(|&byte| send_byte(bus, byte))
}

/// Run an Ultraboot session, from `start`.
pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>, start: Start) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    session.bus.set_lines(false, true);
    let mut buf = session.alloc()?;

    session
        .wait_request(|bus| {
            let state = bus.read();
            state.contains(BusState::DATA) || !state.contains(BusState::ATN)
        })
        .await?;
    if !session.bus.atn() {
        return Err(LoaderError::HostReset);
    }

    // Give the host a frame to turn its screen off
    yield_ms!(ULTRABOOT_START_DELAY_MS);

    let mut speed_zone = start.speed_zone;
    let mut track = start.track;
    let mut sector = start.sector;
    while track > 0 && track <= MAX_TRACK {
        let ts = map_sector(speed_zone, track, sector);
        session.read(&mut buf, ts.track, ts.sector).await?;

        if ts == TrackSector::new(LOADER_TRACK, LOADER_SECTOR) {
            // The loader itself isn't sent, only its settings are needed
            let zone = buf[SPEED_ZONE_OFFSET];
            if zone & !0x60 != 0 {
                warn!("Ultraboot speed zone {:02x}", zone);
                return Err(LoaderError::Protocol);
            }
            speed_zone = zone >> 5;
            debug!("Ultraboot speed zone {}", speed_zone);
        } else {
            trace!("Ultraboot block {}/{}", ts.track, ts.sector);
            send_block(session.bus, &buf)?;
        }

        sector = buf[LINK_SECTOR];
        track = buf[LINK_TRACK];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Line;
    use crate::test::forge::{filler, forge};
    use crate::test::disk::MemDisk;
    use crate::test::sim::{Host, SimBus};
    use embassy_futures::block_on;

    fn skipping_crc(bytes: &[u8]) -> u16 {
        (5..bytes.len())
            .filter(|&i| i != START_TRACK && i != START_SECTOR)
            .fold(CRC_INIT, |crc, i| crc16_update(crc, bytes[i]))
    }

    fn command(sig: u16) -> Vec<u8> {
        let mut bytes = filler(24, 2);
        bytes[..5].copy_from_slice(b"M-E\x05\x02");
        forge(&mut bytes, 7, sig, skipping_crc);
        bytes
    }

    #[test]
    fn ultraboot_starts_at_the_loader() {
        let mut bytes = command(ULTRABOOT_CRC);
        let start = detect(&Command::new(&bytes, 0));
        assert_eq!(start, Some(Start { track: 36, sector: 0, speed_zone: 0 }));

        // Start bytes aren't checked
        bytes[START_TRACK] = 1;
        bytes[START_SECTOR] = 2;
        assert!(detect(&Command::new(&bytes, 0)).is_some());

        bytes[12] ^= 0x40;
        assert!(detect(&Command::new(&bytes, 0)).is_none());
    }

    #[test]
    fn menue_start_from_command() {
        let mut bytes = command(MENUE_CRC);
        bytes[START_TRACK] = 38;
        bytes[START_SECTOR] = 4;
        let start = detect(&Command::new(&bytes, 0));
        assert_eq!(start, Some(Start { track: 38, sector: 4, speed_zone: 0 }));

        // Wrong address
        bytes[3] = 0x06;
        assert!(detect(&Command::new(&bytes, 0)).is_none());
    }

    #[test]
    fn sector_mapping() {
        assert_eq!(map_sector(0, 37, 5), TrackSector::new(37, 5));
        assert_eq!(map_sector(3, 20, 5), TrackSector::new(20, 5));
        assert_eq!(map_sector(3, 36, 0), TrackSector::new(36, 0));
        // 21 sectors per track packed into 17
        assert_eq!(map_sector(3, 37, 5), TrackSector::new(37, 9));
        assert_eq!(map_sector(3, 36, 20), TrackSector::new(37, 3));
        assert_eq!(map_sector(1, 38, 17), TrackSector::new(39, 2));
    }

    // Host side: release DATA, decode the pairs after the start pulse, then
    // acknowledge until the drive has looked.
    async fn host_receive(host: Host, count: usize) -> Vec<u8> {
        let t = TimedPairs::ULTRABOOT;
        let mut out = Vec::new();
        let mut acked_at = None;
        for _ in 0..count {
            if let Some(reads) = acked_at {
                // Hold the acknowledge until the drive has sampled it
                host.until(move |w| w.reads > reads).await;
            }
            host.set_data(true);
            host.until(|w| !w.drive_data).await;
            host.until(|w| w.drive_data).await;

            let mut byte = 0u8;
            for index in 0..4 {
                host.next_write().await;
                byte |= u8::from(!host.drive_line(Line::Clock)) << t.clock_bits[index];
                byte |= u8::from(!host.drive_line(Line::Data)) << t.data_bits[index];
            }
            out.push(byte);

            // DATA released at the end of the byte
            host.next_write().await;
            host.set_data(false);
            acked_at = Some(host.reads());
        }
        out
    }

    fn format_code(zone: u8) -> Vec<u8> {
        let mut code = filler(40, 9);
        forge(&mut code, 10, FORMAT_CRC, |b| {
            b[..b.len() - 2].iter().fold(CRC_INIT, |crc, &x| crc16_update(crc, x))
        });
        let len = code.len();
        code[len - 2] = zone << 5;
        code[len - 1] = ZONE_SECTORS[usize::from(zone)] as u8;
        code
    }

    fn maker_command(address: u16, track: u8, sector: u8) -> Vec<u8> {
        let [lo, hi] = address.to_le_bytes();
        vec![b'M', b'-', b'E', lo, hi, track, sector]
    }

    #[test]
    fn format_code_comes_from_channel_two() {
        let mut disk = MemDisk::new();
        let bytes = maker_command(FORMAT_ADDRESS, 36, 0);
        let command = Command::new(&bytes, 0);
        assert_eq!(detect_format(&disk, &command), None);

        disk.buffers.insert(MAKER_CHANNEL, format_code(3));
        assert_eq!(detect_format(&disk, &command), Some(Format { track: 36, speed_zone: 3 }));

        // Only bits 5 and 6 may be set in the speed zone
        let code = disk.buffers.get_mut(&MAKER_CHANNEL).unwrap();
        let len = code.len();
        code[len - 2] |= 0x01;
        assert_eq!(detect_format(&disk, &command), None);
    }

    #[test]
    fn formatting_track_36_extends_the_image() {
        let mut disk = MemDisk::new();
        disk.d41 = true;
        let fmt = Format { track: 36, speed_zone: 3 };
        assert_eq!(block_on(format(&mut disk, 0, fmt)), Ok(()));
        assert_eq!(disk.extended_to, Some(DENSE_TRACKS));
        assert_eq!(disk.marked_ok.len(), 21);
        assert_eq!(disk.marked_ok.first(), Some(&TrackSector::new(37, 3)));
        assert_eq!(disk.marked_ok.last(), Some(&TrackSector::new(36, 0)));
    }

    #[test]
    fn later_tracks_mark_their_mapped_sectors() {
        let mut disk = MemDisk::new();
        disk.d41 = true;
        let fmt = Format { track: 37, speed_zone: 3 };
        assert_eq!(block_on(format(&mut disk, 0, fmt)), Ok(()));
        assert_eq!(disk.extended_to, None);
        assert_eq!(disk.marked_ok.len(), 21);
        assert_eq!(disk.marked_ok.first(), Some(&TrackSector::new(38, 7)));
        assert_eq!(disk.marked_ok.last(), Some(&TrackSector::new(37, 4)));

        // Zone 0 tracks only extend to 40
        let mut disk = MemDisk::new();
        disk.d41 = true;
        let fmt = Format { track: 36, speed_zone: 0 };
        assert_eq!(block_on(format(&mut disk, 0, fmt)), Ok(()));
        assert_eq!(disk.extended_to, Some(EXTENDED_TRACKS));
        assert_eq!(disk.marked_ok.len(), 17);
    }

    #[test]
    fn format_checks_the_image_and_track() {
        let mut disk = MemDisk::new();
        let fmt = Format { track: 36, speed_zone: 1 };
        assert_eq!(block_on(format(&mut disk, 0, fmt)), Err(MediaError::NotReady));

        disk.d41 = true;
        let fmt = Format { track: 41, speed_zone: 1 };
        assert_eq!(block_on(format(&mut disk, 0, fmt)), Err(MediaError::IllegalTrackSector));

        // Normal tracks need nothing
        let fmt = Format { track: 20, speed_zone: 1 };
        assert_eq!(block_on(format(&mut disk, 0, fmt)), Ok(()));
        assert!(disk.marked_ok.is_empty());
    }

    #[test]
    fn write_maps_through_the_speed_zone() {
        let mut disk = MemDisk::new();
        disk.buffers.insert(MAKER_CHANNEL, vec![0x42; 100]);
        let bytes = maker_command(WRITE_ADDRESS, 37, 5);
        assert_eq!(block_on(write(&mut disk, 0, 3, &Command::new(&bytes, 0))), Ok(()));

        let written = disk.sector(37, 9);
        assert!(written[..100].iter().all(|&b| b == 0x42));
        assert!(written[100..].iter().all(|&b| b == 0));

        let bytes = maker_command(WRITE_ADDRESS, 41, 0);
        assert_eq!(
            block_on(write(&mut disk, 0, 3, &Command::new(&bytes, 0))),
            Err(MediaError::IllegalTrackSector)
        );

        // Nothing to write without the buffer
        disk.buffers.clear();
        let bytes = maker_command(WRITE_ADDRESS, 37, 6);
        assert_eq!(block_on(write(&mut disk, 0, 3, &Command::new(&bytes, 0))), Ok(()));
        assert_eq!(disk.writes.borrow().len(), 1);
    }

    #[test]
    fn timed_bytes() {
        let (mut bus, host) = SimBus::new();
        let result = host.spawn_with_result(host_receive(host.clone(), 3));
        for byte in [0x00u8, 0xa5, 0xff] {
            send_byte(&mut bus, byte).unwrap();
        }
        bus.finish();
        assert_eq!(result.take(), Some(vec![0x00, 0xa5, 0xff]));
    }

    #[test]
    fn unacknowledged_byte() {
        let (mut bus, _host) = SimBus::new();
        assert_eq!(send_byte(&mut bus, 0x12), Err(LoaderError::Timeout));
    }

    #[test]
    fn reset_while_waiting() {
        let (mut bus, host) = SimBus::new();
        host.set_data(false);
        host.set_atn(false);
        assert_eq!(send_byte(&mut bus, 0x12), Err(LoaderError::HostReset));
    }
}
