//! Sparkle.
//!
//! Sparkle streams "bundles" of blocks laid out with a per speed zone
//! interleave.  The host asks for the next bundle by pulling ATN, and can
//! ask for a specific bundle (2.x), flip the disk, or write back a
//! highscore file through the saver bundle.
//!
//! The loader version isn't known when the session starts.  It is worked
//! out from the BAM sector of the first disk, which also holds the
//! interleave and disk ids.  2.x releases encode the directory and the
//! bundle lengths, with one of several byte encodings.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{LoaderVariant, Session};
use crate::buffers::Buffer;
use crate::bus::{BusLines, Line};
use crate::disk::{BundleEntry, ZonedCursor};
use crate::driver::{Command, DriveSignals, LoaderError, Sector, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::protocol::{clocked_read_byte, clocked_write_byte, wait_atn_high, wait_atn_low};
use crate::util::time::block_us;
use crate::util::time::fl::{ATN_TIMEOUT_MS, BIT_TIMEOUT_MS};

const INIT_TRACK: u8 = 18;
const BAM_SECTOR: u8 = 0;
const DIR_START: u8 = 17;

/// Bundle holding the saver code.  Requesting it starts save mode.
const SAVER_BUNDLE: u8 = 0x7e;
/// Bundle the saver writes to.
const SAVE_FILE: u8 = 0x7f;
/// Not sent by the host, marks a sequential request.
const SEQ_BUNDLE: u8 = 0x80;
const RESET_BUNDLE: u8 = 0xff;

/// 1.x: number of bundles left on the disk, in the BAM sector.
const BUNDLE_COUNT: usize = 0xfe;

/// Signatures of the loader's M-E command: (length, checksum from offset 5).
const SIGNATURES: [(usize, u16); 3] = [
    (0x22, 0x1874), // 2.x
    (0x28, 0x36fe), // 1.5
    (0x23, 0x656f), // 1.0
];

/// Whether an M-E command starts Sparkle.
pub fn detect(command: &Command) -> bool {
    let crc = command.crc(5, 0);
    SIGNATURES
        .iter()
        .any(|&(len, sig)| command.len() == len && crc == sig)
}

/// Per disk parameters in the BAM sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Param {
    DiskId,
    NextId,
    Saver,
    Interleave0,
    /// Last three bytes of the production id, stored reversed
    ProdId = 7,
}

const PROD_ID_LEN: usize = 3;

/// Offsets of each [`Param`] in the BAM, per version.  Interleaves for zones
/// 1 to 3 follow zone 0.  0 means the version doesn't have the parameter.
const PARAM_OFFSETS: [[u8; 8]; 4] = [
    // DiskId NextId Saver IL0   IL1   IL2   IL3   ProdId
    [0xff, 0xfd, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], // 1.0
    [0xff, 0xfd, 0x00, 0xf8, 0xfa, 0xfb, 0xfc, 0x00], // 1.5
    [0xff, 0xfe, 0xf4, 0xf9, 0xfb, 0xfc, 0xfd, 0xf1], // 2.0
    [0xff, 0xfb, 0xf9, 0xfa, 0xfc, 0xfd, 0xfe, 0xf6], // 2.1
];

/// Productions that need special treatment.
const PID_MEDIAN: [u8; PROD_ID_LEN] = [0xbd, 0xe2, 0x0a];
const PID_MEDIAN_FINAL: [u8; PROD_ID_LEN] = [0xbd, 0x8c, 0xd3];
const PID_PROPAGANDA_30: [u8; PROD_ID_LEN] = [0x92, 0xd2, 0x6f];

/// Interleave of 1.0, which can't be configured.
const FIXED_INTERLEAVE: [u8; 4] = [4, 3, 3, 3];

/// Byte encodings of 2.x disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Encoding {
    /// 1.x
    Plain,
    V20,
    V21,
    /// Only used by "Padawan's Awakening"
    V21Ff,
}

fn decode_low(v: u8) -> u8 {
    match v & 0x09 {
        0x00 | 0x09 => v ^ 0x0f,
        _ => v ^ 0x06,
    }
}

fn decode_high(v: u8) -> u8 {
    match v & 0x90 {
        0x00 | 0x90 => v ^ 0xf0,
        _ => v ^ 0x60,
    }
}

impl Encoding {
    fn decode(self, v: u8) -> u8 {
        match self {
            Encoding::Plain => v,
            Encoding::V20 => decode_high(decode_low(v)),
            Encoding::V21 => decode_low(v) ^ 0x70,
            Encoding::V21Ff => decode_low(v) ^ 0xf0,
        }
    }
}

/// Layout of encoded 2.x directory sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum BlockLayout {
    /// Byte order unchanged, used by early 2.0 pre-releases
    Plain,
    /// Bytes 1 to 0x7f swapped with 0xff down to 0x81
    Reversed,
}

fn decode_block(data: &mut Sector, layout: BlockLayout, encoding: Encoding) {
    match layout {
        BlockLayout::Plain => data.iter_mut().for_each(|b| *b = encoding.decode(*b)),
        BlockLayout::Reversed => {
            for i in 0..=0x80 {
                let j = (0x100 - i) & 0xff;
                let tmp = encoding.decode(data[i]);
                data[i] = encoding.decode(data[j]);
                data[j] = tmp;
            }
        }
    }
}

/// Work out the version and encoding from the BAM of the first disk.
fn identify(bam: &Sector) -> Option<(LoaderVariant, Encoding)> {
    match bam[0xf9] & 0xc0 {
        0x00 => {
            // 1.x stores the zone 0 interleave both ways round, or 0 for 1.0
            let il = bam[0xf8];
            if il == bam[0xf9].wrapping_neg() {
                if il != 0 {
                    Some((LoaderVariant::Sparkle15, Encoding::Plain))
                } else {
                    Some((LoaderVariant::Sparkle10, Encoding::Plain))
                }
            } else if bam[0xfe] & 0xc0 == 0xc0 {
                // We don't expect a side id of 0x10 or more
                Some((LoaderVariant::Sparkle20, Encoding::V20))
            } else {
                Some((LoaderVariant::Sparkle20, Encoding::V21Ff))
            }
        }
        0x80 => Some((LoaderVariant::Sparkle20, Encoding::V21)),
        0x40 => Some((LoaderVariant::Sparkle21, Encoding::V21)),
        _ => None,
    }
}

/// What the main loop does next.
enum Next {
    Request,
    Flip,
}

struct Sparkle<'s, 'a, B: BusLines, D, S> {
    s: &'s mut Session<'a, B, D, S>,
    /// BAM or directory sector, depending on the version
    dir: Buffer<'a>,
    cursor: ZonedCursor,
    encoding: Encoding,
    layout: Option<BlockLayout>,
    /// Blocks left in the current bundle
    bundle_len: u8,
    prod_id: [u8; PROD_ID_LEN],
    /// Disk id the next flip expects
    next_id: u8,
    has_saver: bool,
    current_dir: Option<u8>,
    save_active: bool,
    /// Bundle numbers are sent inverted ("Memento Mori", "reMETA")
    bundle_inverted: bool,
}

impl<B, D, S> Sparkle<'_, '_, B, D, S>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    fn version(&self) -> usize {
        usize::from((self.s.variant as u8).saturating_sub(LoaderVariant::Sparkle10 as u8))
    }

    fn offset(&self, param: Param, index: usize) -> u8 {
        PARAM_OFFSETS[self.version()][param as usize + index]
    }

    /// A BAM parameter, still encoded.  0 if this version doesn't have it.
    fn param(&self, param: Param, index: usize) -> u8 {
        match self.offset(param, index) {
            0 => 0,
            offset => self.dir[usize::from(offset)],
        }
    }

    fn prod_id_at(&self, offset: u8) -> [u8; PROD_ID_LEN] {
        let start = usize::from(offset);
        let mut id = [0; PROD_ID_LEN];
        id.copy_from_slice(&self.dir[start..start + PROD_ID_LEN]);
        id
    }

    /// Read the BAM and set up the disk parameters.  The first time round
    /// any disk is accepted, and the version is worked out from it.  After
    /// that we wait for the disk with the expected ids.
    async fn init_disk(&mut self) -> Result<(), LoaderError> {
        loop {
            self.s.read(&mut self.dir, INIT_TRACK, BAM_SECTOR).await?;
            let _ = self.s.signals.take_dir_changed();

            if self.s.variant == LoaderVariant::None {
                let (variant, encoding) = identify(&self.dir).ok_or_else(|| {
                    warn!("Sparkle version not recognised");
                    LoaderError::Protocol
                })?;
                self.s.set_variant(variant);
                self.encoding = encoding;

                let pid = self.offset(Param::ProdId, 0);
                if pid != 0 {
                    self.prod_id = self.prod_id_at(pid);
                    self.cursor.skew =
                        self.prod_id == PID_MEDIAN || self.prod_id == PID_MEDIAN_FINAL;
                    self.cursor.reset_sector =
                        !self.cursor.skew && self.prod_id == PID_PROPAGANDA_30;
                }
                break;
            }

            let disk_id = self.encoding.decode(self.param(Param::DiskId, 0));
            if self.next_id == disk_id {
                let pid = self.offset(Param::ProdId, 0);
                if pid == 0 || self.prod_id_at(pid) == self.prod_id {
                    break;
                }
            }

            info!("Sparkle wants disk {:02x}", self.next_id);
            self.s.wait_disk_change(|bus| bus.atn()).await?;
        }

        if self.s.variant == LoaderVariant::Sparkle10 {
            self.cursor.set_interleave(FIXED_INTERLEAVE);
        } else {
            // Stored as 2s complement
            let mut il = [0u8; 4];
            for (zone, value) in il.iter_mut().enumerate() {
                *value = self
                    .encoding
                    .decode(self.param(Param::Interleave0, zone))
                    .wrapping_neg();
            }
            self.cursor.set_interleave(il);
        }

        self.next_id = self.encoding.decode(self.param(Param::NextId, 0));
        self.has_saver = self.encoding.decode(self.param(Param::Saver, 0)) == 2;

        if self.s.variant >= LoaderVariant::Sparkle20 {
            self.current_dir = None;
            self.load_dir(0).await
        } else {
            // 1.x has no directory and always starts at 1/0
            self.cursor.seek(1, 0);
            Ok(())
        }
    }

    /// Make sure directory sector `index` is loaded and decoded.
    async fn load_dir(&mut self, index: u8) -> Result<(), LoaderError> {
        if index > 1 {
            return Err(LoaderError::Protocol);
        }
        if self.current_dir == Some(index) {
            return Ok(());
        }

        self.s.read(&mut self.dir, INIT_TRACK, DIR_START + index).await?;
        self.current_dir = Some(index);

        if self.encoding == Encoding::Plain {
            return Ok(());
        }

        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                // The first entry should start at sector 0 with 21 sectors
                // left on the track
                let layout = if self.encoding.decode(self.dir[1]) == 0
                    && self.encoding.decode(self.dir[2]) == 21
                {
                    self.bundle_inverted = true;
                    BlockLayout::Plain
                } else {
                    BlockLayout::Reversed
                };
                debug!("Sparkle directory layout {}", layout);
                self.layout = Some(layout);
                layout
            }
        };
        decode_block(&mut self.dir, layout, self.encoding);
        Ok(())
    }

    /// Position the cursor on the first block of `bundle`.
    async fn find_dir_entry(&mut self, bundle: u8) -> Result<BundleEntry, LoaderError> {
        self.load_dir(bundle / BundleEntry::PER_SECTOR).await?;
        let entry = BundleEntry::parse(&self.dir, bundle);
        self.cursor.seek(entry.start.track, entry.start.sector);
        while self.cursor.remaining() > entry.sectors_left {
            self.cursor.iterate();
        }
        Ok(entry)
    }

    /// Receive one saver block and write it to the next sector.
    async fn handle_save(&mut self) -> Result<(), LoaderError> {
        if self.cursor.remaining() == 0 {
            warn!("Sparkle saver out of space");
            return Err(LoaderError::Protocol);
        }

        let mut buf = self.s.alloc()?;
        self.s.bus.set_data(false);

        // Sent in reverse, starting at offset 0
        self.s.bus.critical(|bus| {
            for i in core::iter::once(0).chain((1..=0xff).rev()) {
                buf[i] = clocked_read_byte(bus, Line::Clock, Line::Atn, BIT_TIMEOUT_MS)?;
            }
            bus.set_data(true);
            Ok::<(), LoaderError>(())
        })?;

        let pos = self.cursor.position();
        self.s.write(&buf, pos.track, pos.sector).await?;

        // The saver only uses the last track
        self.cursor.iterate();
        Ok(())
    }

    async fn send_bundle(&mut self, bundle: u8) -> Result<(), LoaderError> {
        let v10 = self.s.variant == LoaderVariant::Sparkle10;
        let mut entry = None;

        if bundle != SEQ_BUNDLE {
            if self.s.variant >= LoaderVariant::Sparkle20 {
                entry = Some(self.find_dir_entry(bundle).await?);
            }
            // The first block says how long the bundle is
            self.bundle_len = 1;
        }

        let mut buf = self.s.alloc()?;
        let mut end_of_bundle = false;

        while !end_of_bundle {
            let pos = self.cursor.position();
            self.s.read(&mut buf, pos.track, pos.sector).await?;

            self.bundle_len = self.bundle_len.wrapping_sub(1);
            if !v10 {
                if self.bundle_len == 0 {
                    end_of_bundle = true;
                    self.bundle_len = self.encoding.decode(buf[1]);
                    buf[1] = 0;

                    if let (true, Some(entry)) = (bundle & 0x7f != 0, entry) {
                        // First block of a random bundle
                        buf[0x00] = 0;
                        buf[0xff] = self.encoding.decode(entry.last_byte);
                    }
                }
            } else {
                match self.bundle_len {
                    0 => self.bundle_len = buf[0xff],
                    1 => end_of_bundle = true,
                    _ => (),
                }
            }

            wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;

            if !v10 {
                self.s.bus.set_data(true);
                self.s.wait_request(|bus| bus.data()).await?;
                block_us!(2);
                if self.s.bus.atn() {
                    return Err(LoaderError::HostReset);
                }
            }

            let block: &Sector = &buf;
            self.s.bus.critical(|bus| {
                bus.set_clock(false);
                bus.set_data(true);
                wait_atn_high(bus);

                for &byte in block {
                    clocked_write_byte(bus, byte, None, ATN_TIMEOUT_MS)?;
                }

                // The last pair hasn't been picked up yet
                wait_atn_high(bus);
                Ok::<(), LoaderError>(())
            })?;

            self.s.bus.set_clock(true);
            self.s.bus.set_data(!v10);

            self.cursor.step();
        }

        drop(buf);

        // 1.0 ("OMG Got Balls!") takes a long time here
        self.s.wait_request(|bus| !bus.atn()).await
    }

    async fn serve(&mut self) -> Result<(), LoaderError> {
        self.init_disk().await?;
        info!("Sparkle {} started", self.s.variant);
        let mut bundle = 0u8;

        self.s.bus.set_data(false);

        loop {
            wait_atn_low(self.s.bus, ATN_TIMEOUT_MS)?;

            let mut next = Next::Request;
            if self.s.variant != LoaderVariant::Sparkle10 {
                self.s.bus.set_data(true);

                // Wait for the host to be ready to receive
                self.s.wait_request(|bus| bus.data() || bus.atn()).await?;
                if !self.s.bus.data() {
                    return Err(LoaderError::HostReset);
                }

                if self.s.variant >= LoaderVariant::Sparkle20 {
                    block_us!(2);

                    if !self.s.bus.clock() {
                        // Host still holds CLOCK, so it wants a specific bundle
                        self.s.bus.set_clock(true);
                        self.s.bus.set_data(false);
                        bundle = clocked_read_byte(self.s.bus, Line::Clock, Line::Atn, BIT_TIMEOUT_MS)?;
                        self.s.bus.set_data(true);

                        if self.bundle_inverted {
                            bundle = !bundle;
                        }
                        trace!("Sparkle bundle {:02x}", bundle);

                        if bundle & 0x80 != 0 {
                            if bundle == RESET_BUNDLE {
                                return Ok(());
                            }
                            self.next_id = bundle & 0x7f;
                            next = Next::Flip;
                        }
                    }
                }
            }

            if let Next::Request = next {
                if self.save_active {
                    if bundle != 0 {
                        // Only a flag here, more blocks to come
                        self.handle_save().await?;
                    } else {
                        // The host follows up with a regular request
                        self.save_active = false;
                    }
                } else if self.bundle_len == 0 && bundle == SEQ_BUNDLE {
                    // End of this disk
                    if self.next_id & 0x80 != 0 {
                        return Ok(());
                    }
                    next = Next::Flip;
                } else {
                    self.send_bundle(bundle).await?;

                    if self.s.variant < LoaderVariant::Sparkle20 {
                        // 1.x counts down bundles in the BAM instead
                        self.dir[BUNDLE_COUNT] = self.dir[BUNDLE_COUNT].wrapping_sub(1);
                        if self.dir[BUNDLE_COUNT] == 0 {
                            if self.next_id == 0 {
                                return Ok(());
                            }
                            next = Next::Flip;
                        }
                    }

                    if let Next::Request = next {
                        if bundle == SAVER_BUNDLE && self.has_saver {
                            self.find_dir_entry(SAVE_FILE).await?;
                            debug!("Sparkle saver active");
                            self.save_active = true;
                        }
                        bundle = SEQ_BUNDLE;
                    }
                }
            }

            if let Next::Flip = next {
                self.init_disk().await?;
                bundle = 0;
            }
        }
    }
}

/// Run a Sparkle session.  The session's variant is filled in once the
/// first disk has been looked at.
pub async fn run<B, D, S>(session: &mut Session<'_, B, D, S>) -> Result<(), LoaderError>
where
    B: BusLines,
    D: SectorIo,
    S: DriveSignals,
{
    // Holds the BAM on 1.x, which has no directory
    let dir = session.alloc_system()?;

    let mut sparkle = Sparkle {
        s: session,
        dir,
        cursor: ZonedCursor::new(FIXED_INTERLEAVE),
        encoding: Encoding::Plain,
        layout: None,
        bundle_len: 0,
        prod_id: [0; PROD_ID_LEN],
        next_id: 0,
        has_saver: false,
        current_dir: None,
        save_active: false,
        bundle_inverted: false,
    };
    sparkle.serve().await
}
