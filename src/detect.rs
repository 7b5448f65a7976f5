//! Fastloader detection and dispatch.
//!
//! Loaders install themselves with one or more M-W commands, uploading
//! their drivecode, followed by an M-E to start it.  We don't run the
//! drivecode.  Instead:
//!
//! - every byte uploaded with M-W is added to a checksum, and if the
//!   checksum matches a known upload the loader variant and its byte
//!   transfer strategy are noted;
//! - on M-E, the handler for the noted variant and the execute address is
//!   looked up and run.  If there isn't one, handlers that identify the
//!   loader from the M-E command itself are tried.
//!
//! Handlers can decline, in which case the search carries on.
//!
//! The variant noted by an M-W only applies to the next M-E.  A variant that
//! is still set after an M-E (a drive check that isn't followed by more
//! uploads, or an Ultraboot Maker format) applies to the M-E after that.
//!
//! A few loaders need part of their upload, not just its checksum.  GEOS
//! stage 1 carries the table it scrambles the next stage with, so that is
//! captured from the M-W data as it goes past, across as many M-Ws as it
//! takes.
//!
//! Burst fastload isn't drivecode at all, and comes in as a `U0` command
//! through [`Dispatcher::burst_fastload`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use crate::buffers::BufferPool;
use crate::bus::{BusLines, FastSerial};
use crate::constants::{
    CUSTOM_MAGIC_ADDRESS, CUSTOM_MAGIC_VALUE, DEVICE_ADDRESS_MW, IGNORED_MW_ADDRESSES,
};
use crate::driver::{Channels, Command, DriveSignals, LoaderError, SectorIo};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};
use crate::loader::burst::{self, BurstState};
use crate::loader::geos::{self, TABLE_LEN};
use crate::loader::krill::{self, DriveCheck};
use crate::loader::{
    ACTIVE_LOADER, ActiveLoader, LoaderVariant, Session, ar6, bitfire, booze, dreamload,
    epyxcart, fc3, gijoe, hypraload, log_exit, mmzak, n0sdos, nippon, samsjourney, sparkle,
    spindle, turbodisk, ultraboot, uload3,
};
use crate::protocol::RxTx;
use crate::util::crc::{CRC_INIT, crc16_update};

/// A known drivecode upload.
#[derive(Debug, Clone, Copy)]
struct Upload {
    crc: u16,
    variant: LoaderVariant,
    rxtx: RxTx,
}

const fn upload(crc: u16, variant: LoaderVariant, rxtx: RxTx) -> Upload {
    Upload { crc, variant, rxtx }
}

/// Checksums of the first M-W chunk, except where noted.
static UPLOADS: &[Upload] = {
    use LoaderVariant as V;
    &[
        upload(0x9c9f, V::Turbodisk, RxTx::None),
        upload(0xdab0, V::Fc3Load, RxTx::None),
        upload(0x973b, V::Fc3Load, RxTx::None),
        upload(0x7e38, V::Fc3Load, RxTx::None), // EXOS v3
        upload(0x1b30, V::Fc3Save, RxTx::None), // early, more C64 code follows
        upload(0x8b0e, V::Fc3Save, RxTx::None),
        upload(0x9930, V::Fc3Freezed, RxTx::None),
        upload(0x0281, V::Fc3OldFreezed, RxTx::Fc3OldFreezePal),
        upload(0xc196, V::Fc3OldFreezed, RxTx::Fc3OldFreezeNtsc),
        upload(0x2e69, V::Dreamload, RxTx::None),
        upload(0xdd81, V::ULoad3, RxTx::None),
        upload(0x393e, V::ELoad1, RxTx::None),
        upload(0x5a01, V::EpyxCart, RxTx::None),
        upload(0xb979, V::GeosStage1C64, RxTx::GeosOneMhz),
        upload(0x2469, V::GeosStage1C128, RxTx::GeosOneMhz),
        upload(0x4d79, V::GeosStage23D1541, RxTx::GeosOneMhz), // 64 stage 2
        upload(0xb2bc, V::GeosStage23D1541, RxTx::GeosOneMhz), // 128 stage 2
        upload(0xb272, V::GeosStage23D1541, RxTx::GeosOneMhz), // Configure
        upload(0xdaed, V::GeosStage23D1571, RxTx::GeosTwoMhz),
        upload(0x3f8d, V::GeosStage23D1581, RxTx::GeosTwoMhz), // Configure 2.0
        upload(0xc947, V::GeosStage23D1581, RxTx::Geos1581V21), // Configure 2.1
        upload(0xf140, V::WheelsStage1C64, RxTx::WheelsOneMhz),
        upload(0x737e, V::WheelsStage1C128, RxTx::WheelsOneMhz),
        upload(0x755a, V::WheelsStage2, RxTx::WheelsOneMhz), // 64 on a 1541
        upload(0x2920, V::WheelsStage2, RxTx::WheelsOneMhz), // 128 on a 1541
        upload(0x18e9, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x9804, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x48f5, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x1356, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0xe885, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x4eca, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0xdbf6, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0xe4ab, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x6de5, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x30ff, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x46e7, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0x2253, V::WheelsStage2, RxTx::WheelsTwoMhz),
        upload(0xc26a, V::Wheels44Stage2, RxTx::Wheels44D1541),
        upload(0x550c, V::Wheels44Stage2, RxTx::Wheels44D1541),
        upload(0x825b, V::Wheels44Stage2D1581, RxTx::Wheels44D1581),
        upload(0x245b, V::Wheels44Stage2D1581, RxTx::Wheels44D1581),
        upload(0x7021, V::Wheels44Stage2D1581, RxTx::Wheels44D1581),
        upload(0xd537, V::Wheels44Stage2D1581, RxTx::Wheels44D1581),
        upload(0xf635, V::Wheels44Stage2D1581, RxTx::Wheels44D1581),
        upload(0x43c1, V::Nippon, RxTx::None),
        upload(0x4870, V::Ar6D1581Load, RxTx::None),
        upload(0x2925, V::Ar6D1581Save, RxTx::None),
        upload(0x12a6, V::Mmzak, RxTx::None),
        upload(0x0c92, V::GiJoe, RxTx::None), // cut down, from a crack
        upload(0x327d, V::N0sdosFileread, RxTx::None),
        upload(0x6af4, V::SamsJourney, RxTx::None),
        upload(0xd2f2, V::Hypraload, RxTx::Hypraload10),
        upload(0x5983, V::Hypraload, RxTx::Hypraload21),
        upload(0x8667, V::KrillR146, RxTx::None), // r146 drive check
        upload(0xe300, V::KrillR186, RxTx::KrillClock), // second chunk
        upload(0x19a4, V::KrillR184, RxTx::KrillClock), // second chunk
        upload(0x741d, V::KrillR184, RxTx::KrillClock),
        upload(0xf7e4, V::KrillR184, RxTx::KrillClock),
        upload(0x1eec, V::KrillR164, RxTx::KrillClock),
        upload(0x4393, V::KrillR164, RxTx::KrillClock),
        upload(0x6c47, V::KrillR164, RxTx::KrillClock),
        upload(0xd9f1, V::KrillR164, RxTx::KrillClock),
        upload(0xa905, V::KrillR159, RxTx::KrillClock),
        upload(0xe7f6, V::KrillR159, RxTx::KrillClock),
        upload(0x2028, V::KrillR146, RxTx::KrillData),
        upload(0x2c29, V::KrillR146, RxTx::KrillData),
        upload(0x4eb4, V::KrillR146, RxTx::KrillData),
        upload(0x5668, V::KrillR146, RxTx::KrillData), // second chunk
        upload(0x6a90, V::KrillR146, RxTx::KrillData),
        upload(0x74aa, V::KrillR146, RxTx::KrillData),
        upload(0x7c5e, V::KrillR146, RxTx::KrillData),
        upload(0x7e28, V::KrillR146, RxTx::KrillData), // second chunk
        upload(0xa1e7, V::KrillR146, RxTx::KrillData),
        upload(0xa350, V::KrillR146, RxTx::KrillData),
        upload(0xb0e4, V::KrillR146, RxTx::KrillData),
        upload(0xb340, V::KrillR146, RxTx::KrillData),
        upload(0xc1dc, V::KrillR146, RxTx::KrillData),
        upload(0xeb28, V::KrillR146, RxTx::KrillData),
        upload(0xf5a8, V::KrillR146, RxTx::KrillData),
        upload(0xfc9a, V::KrillR146, RxTx::KrillData),
        upload(0x03a5, V::KrillR146, RxTx::KrillResend),
        upload(0xba1f, V::KrillR146, RxTx::KrillResend),
        upload(0xca68, V::KrillR146, RxTx::KrillResend),
        upload(0x2fca, V::KrillR58, RxTx::KrillData),
        upload(0xb4ce, V::KrillR58, RxTx::KrillData), // second chunk
        upload(0xe530, V::KrillR58, RxTx::KrillData),
        upload(0xf7aa, V::KrillR58Pre, RxTx::Krill58Pre),
        upload(0x379d, V::KrillR58Pre, RxTx::Krill58Pre),
        // ATN responders.  Releases without the ID string identify the
        // drive their own way, and always see a 1541.
        upload(0x607d, V::KrillSleep, RxTx::None), // r186 and later
        upload(0x40c3, V::KrillSleep, RxTx::None), // r184
        upload(0x5088, V::KrillSleep, RxTx::None), // r164
        upload(0x1fdc, V::SpindleSleep, RxTx::None),
        upload(0x955d, V::BitfireSleep, RxTx::None),
        upload(0x0c48, V::Booze, RxTx::None),
        upload(0x5f66, V::Booze, RxTx::None),
        upload(0x7cd6, V::Bitfire01, RxTx::BitfireClock),
        upload(0xf1ec, V::Bitfire01, RxTx::BitfireClock),
        upload(0x2b10, V::Bitfire03, RxTx::BitfireClock),
        upload(0xb0f4, V::Bitfire04, RxTx::BitfireClock),
        upload(0xaf44, V::Bitfire06, RxTx::BitfireInvertedClock),
        upload(0x1f43, V::Bitfire07Pre, RxTx::BitfireInvertedData),
        upload(0xb2dd, V::Bitfire07Pre, RxTx::BitfireInvertedData),
        upload(0x809f, V::Bitfire07Dbg, RxTx::BitfireInvertedData),
        upload(0x3046, V::Bitfire07, RxTx::BitfireInvertedData),
        upload(0xb8e6, V::Bitfire07, RxTx::BitfireInvertedData),
        upload(0xc83a, V::Bitfire10, RxTx::BitfireInvertedClock),
        upload(0x0453, V::Bitfire11, RxTx::BitfireClock),
        upload(0x7c59, V::Bitfire11, RxTx::BitfireClock),
        upload(0xa45a, V::Bitfire11, RxTx::BitfireClock),
        upload(0x1c3d, V::Bitfire11, RxTx::BitfireClock),
        upload(0x8d3a, V::Bitfire12Pr1, RxTx::BitfireData),
        upload(0x4521, V::Bitfire12Pr2, RxTx::BitfireData),
        upload(0xc33e, V::Bitfire12Pr3, RxTx::BitfireData),
    ]
};

/// The checksum GI Joe's upload reaches on its final RTS.  The same code
/// is uploaded in many different ways, so the checksum of the whole upload
/// varies.
const GIJOE_CRC: u16 = 0x38a2;
const RTS: u8 = 0x60;

/// What runs for an M-E.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Turbodisk,
    /// The freezer's loader handshakes every block.
    Fc3Load { freezed: bool },
    Fc3Save,
    Fc3OldFreeze,
    Dreamload,
    ULoad3,
    ELoad1,
    GiJoe,
    EpyxCart,
    GeosStage1,
    WheelsStage1,
    /// The job loop of the later GEOS stages and Wheels stage 2.
    GeosJobs,
    Nippon,
    Ar6Load,
    Ar6Save,
    Mmzak,
    N0sdos,
    SamsJourney,
    Hypraload,
    Ultraboot,
    UltrabootFormat,
    UltrabootWrite,
    /// Krill's ATN responder.  r192 and later are recognised by the magic
    /// string rather than the upload.
    KrillSleep { check_magic: bool },
    BusSleep,
    KrillDriveCheck(DriveCheck),
    Krill,
    Booze,
    Spindle,
    /// With the block header layout.
    Bitfire(u8),
    Sparkle,
}

#[derive(Debug, Clone, Copy)]
struct HandlerEntry {
    address: u16,
    variant: LoaderVariant,
    handler: Handler,
}

const fn handler(address: u16, variant: LoaderVariant, handler: Handler) -> HandlerEntry {
    HandlerEntry {
        address,
        variant,
        handler,
    }
}

/// Handlers, searched in order.  Entries for [`LoaderVariant::None`] are
/// the catch-alls, which identify the loader from the M-E command.
static HANDLERS: &[HandlerEntry] = {
    use Handler as H;
    use LoaderVariant as V;
    &[
        handler(0x0303, V::Turbodisk, H::Turbodisk),
        handler(0x059a, V::Fc3Load, H::Fc3Load { freezed: false }),
        handler(0x0400, V::Fc3Load, H::Fc3Load { freezed: false }), // EXOS
        handler(0x059c, V::Fc3Save, H::Fc3Save),
        handler(0x059a, V::Fc3Save, H::Fc3Save),
        handler(0x0403, V::Fc3Freezed, H::Fc3Load { freezed: true }),
        handler(0x057f, V::Fc3OldFreezed, H::Fc3OldFreeze),
        handler(0x0700, V::Dreamload, H::Dreamload),
        handler(0x0336, V::ULoad3, H::ULoad3),
        handler(0x0300, V::ELoad1, H::ELoad1),
        handler(0x0500, V::GiJoe, H::GiJoe),
        handler(0x01a9, V::EpyxCart, H::EpyxCart),
        handler(0x0457, V::GeosStage1C64, H::GeosStage1),
        handler(0x0470, V::GeosStage1C128, H::GeosStage1),
        handler(0x03e2, V::GeosStage23D1541, H::GeosJobs),
        handler(0x03dc, V::GeosStage23D1541, H::GeosJobs),
        handler(0x03ff, V::GeosStage23D1571, H::GeosJobs),
        handler(0x040f, V::GeosStage23D1581, H::GeosJobs),
        handler(0x0400, V::WheelsStage1C64, H::WheelsStage1),
        handler(0x0400, V::WheelsStage1C128, H::WheelsStage1),
        handler(0x0300, V::WheelsStage2, H::GeosJobs),
        handler(0x0400, V::Wheels44Stage2, H::GeosJobs),
        handler(0x0300, V::Wheels44Stage2D1581, H::GeosJobs),
        handler(0x0500, V::Wheels44Stage2D1581, H::GeosJobs),
        handler(0x0300, V::Nippon, H::Nippon),
        handler(0x0500, V::Ar6D1581Load, H::Ar6Load),
        handler(0x05f4, V::Ar6D1581Save, H::Ar6Save),
        handler(0x0500, V::Mmzak, H::Mmzak),
        handler(0x041b, V::N0sdosFileread, H::N0sdos),
        handler(0x0400, V::SamsJourney, H::SamsJourney),
        handler(0x0205, V::None, H::Ultraboot),
        handler(ultraboot::FORMAT_ADDRESS, V::None, H::UltrabootFormat),
        handler(ultraboot::WRITE_ADDRESS, V::Ultraboot, H::UltrabootWrite),
        handler(0x0401, V::Hypraload, H::Hypraload),
        handler(0x048b, V::Hypraload, H::Hypraload),
        handler(0x0205, V::KrillSleep, H::KrillSleep { check_magic: false }), // before r192
        handler(0x020b, V::None, H::KrillSleep { check_magic: true }),
        handler(0x0403, V::SpindleSleep, H::BusSleep),
        handler(0x0205, V::BitfireSleep, H::BusSleep),
        handler(0x0205, V::None, H::KrillDriveCheck(DriveCheck::Command)), // before r192
        handler(0x020a, V::None, H::KrillDriveCheck(DriveCheck::Magic)),
        handler(0x0300, V::KrillR146, H::KrillDriveCheck(DriveCheck::Uploaded)),
        handler(0x0209, V::None, H::Krill), // r192 and later
        handler(0x0770, V::KrillR186, H::Krill),
        handler(0x0758, V::KrillR184, H::Krill),
        handler(0x0770, V::KrillR184, H::Krill),
        handler(0x07a8, V::KrillR184, H::Krill),
        handler(0x06d8, V::KrillR164, H::Krill),
        handler(0x077e, V::KrillR164, H::Krill),
        handler(0x07aa, V::KrillR164, H::Krill),
        handler(0x07ac, V::KrillR164, H::Krill),
        handler(0x07a5, V::KrillR159, H::Krill),
        handler(0x07b1, V::KrillR159, H::Krill),
        handler(0x056f, V::KrillR146, H::Krill),
        handler(0x0570, V::KrillR146, H::Krill),
        handler(0x0577, V::KrillR146, H::Krill),
        handler(0x05e9, V::KrillR146, H::Krill),
        handler(0x05ea, V::KrillR146, H::Krill),
        handler(0x05ec, V::KrillR146, H::Krill),
        handler(0x05ee, V::KrillR146, H::Krill),
        handler(0x05ef, V::KrillR146, H::Krill),
        handler(0x05fc, V::KrillR146, H::Krill),
        handler(0x05fe, V::KrillR146, H::Krill),
        handler(0x0610, V::KrillR146, H::Krill),
        handler(0x066e, V::KrillR146, H::Krill),
        handler(0x06a4, V::KrillR146, H::Krill),
        handler(0x06b6, V::KrillR146, H::Krill),
        handler(0x05fc, V::KrillR58, H::Krill),
        handler(0x05fe, V::KrillR58, H::Krill),
        handler(0x05ff, V::KrillR58, H::Krill),
        handler(0x0626, V::KrillR58, H::Krill),
        handler(0x0668, V::KrillR58, H::Krill),
        handler(0x05da, V::KrillR58Pre, H::Krill),
        handler(0x05f1, V::KrillR58Pre, H::Krill),
        handler(0x05f4, V::KrillR58Pre, H::Krill),
        handler(0x0600, V::KrillR58Pre, H::Krill),
        handler(0x0373, V::Booze, H::Booze),
        handler(0x04b8, V::Booze, H::Booze),
        handler(0x020b, V::None, H::Booze),
        handler(0x020d, V::None, H::Booze),
        handler(0x020f, V::None, H::Booze),
        handler(0x0211, V::None, H::Booze),
        handler(0x0205, V::None, H::Spindle),
        handler(0x0700, V::Bitfire01, H::Bitfire(0)),
        handler(0x0700, V::Bitfire03, H::Bitfire(1)),
        handler(0x0700, V::Bitfire04, H::Bitfire(2)),
        handler(0x0700, V::Bitfire06, H::Bitfire(3)),
        handler(0x0700, V::Bitfire07Pre, H::Bitfire(3)),
        handler(0x0700, V::Bitfire07Dbg, H::Bitfire(4)),
        handler(0x0700, V::Bitfire07, H::Bitfire(5)),
        handler(0x0700, V::Bitfire10, H::Bitfire(6)),
        handler(0x0700, V::Bitfire11, H::Bitfire(6)),
        handler(0x0700, V::Bitfire12Pr1, H::Bitfire(6)),
        handler(0x0700, V::Bitfire12Pr2, H::Bitfire(6)),
        handler(0x0700, V::Bitfire12Pr3, H::Bitfire(6)),
        handler(0x0205, V::None, H::Sparkle),
    ]
};

/// Result of an M-W, for the generic command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    /// Drivecode, identified as the variant if it is one we know.
    Uploaded(LoaderVariant),
    /// Change of device address.
    DeviceAddress(u8),
    /// Nothing to do.
    Ignored,
}

/// Result of an M-E, for the generic command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DispatchOutcome {
    /// A handler ran.
    Handled,
    /// No handler for the drivecode, with the checksum of its upload.  The
    /// caller reports this on the error channel.
    UnknownDrivecode(u16),
    /// The host has installed an ATN responder, so the drive should stay
    /// off the bus until reset.
    BusSleep,
    /// The next M-R of `address` should return `value`.
    CustomMagic { address: u16, value: [u8; 2] },
}

/// Whether a handler accepted an M-E.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Detection {
    Accepted(DispatchOutcome),
    /// Not this loader, try the next handler.
    Declined,
}

/// The drive resources a loader session works with.
pub struct DriveContext<'a, B, D, S> {
    pub bus: &'a mut B,
    pub disk: &'a mut D,
    pub signals: &'a mut S,
    pub pool: &'a BufferPool,
}

/// Part of an upload kept back for the loader that uploaded it.
struct Capture {
    /// Drive address of the next byte wanted.
    address: u16,
    remaining: usize,
    len: usize,
    data: [u8; TABLE_LEN],
}

impl Capture {
    const fn new() -> Self {
        Self {
            address: 0,
            remaining: 0,
            len: 0,
            data: [0; TABLE_LEN],
        }
    }

    fn start(&mut self, address: u16) {
        trace!("Capturing upload from {:04x}", address);
        self.address = address;
        self.remaining = TABLE_LEN;
        self.len = 0;
    }

    fn is_active(&self) -> bool {
        self.remaining > 0
    }

    /// Take what we want from `data`, written to `address`.
    fn take(&mut self, address: u16, data: &[u8]) {
        let offset = usize::from(self.address.wrapping_sub(address));
        if offset >= data.len() {
            return;
        }
        let count = self.remaining.min(data.len() - offset);
        self.data[self.len..self.len + count].copy_from_slice(&data[offset..offset + count]);
        self.len += count;
        self.remaining -= count;
        self.address = self.address.wrapping_add(count as u16);
    }

    /// The captured bytes, once there are all of them.
    fn complete(&self) -> Option<&[u8; TABLE_LEN]> {
        (self.len == TABLE_LEN).then_some(&self.data)
    }
}

/// Tracks uploads between M-E commands, and dispatches M-E commands to
/// loader sessions.
pub struct Dispatcher {
    datacrc: u16,
    pending: LoaderVariant,
    previous: LoaderVariant,
    /// Set by a handler for the M-E after the one it ran for.
    carry: LoaderVariant,
    rxtx: RxTx,
    capture: Capture,
    /// Speed zone of Ultraboot Maker's last format, for its writes.
    speed_zone: u8,
    burst: BurstState,
    marker: &'static ActiveLoader,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self::with_marker(&ACTIVE_LOADER)
    }

    /// A dispatcher that publishes running sessions in `marker` rather than
    /// [`ACTIVE_LOADER`].
    pub const fn with_marker(marker: &'static ActiveLoader) -> Self {
        Self {
            datacrc: CRC_INIT,
            pending: LoaderVariant::None,
            previous: LoaderVariant::None,
            carry: LoaderVariant::None,
            rxtx: RxTx::None,
            capture: Capture::new(),
            speed_zone: 0,
            burst: BurstState::new(),
            marker,
        }
    }

    /// Checksum of the drivecode uploaded since the last M-E.
    pub fn datacrc(&self) -> u16 {
        self.datacrc
    }

    /// Variant identified by the uploads since the last M-E.
    pub fn pending(&self) -> LoaderVariant {
        self.pending
    }

    /// Variant left over from the last M-E.
    pub fn previous(&self) -> LoaderVariant {
        self.previous
    }

    /// Forget state that belongs to the disk, after a disk change.
    pub fn disk_changed(&mut self) {
        self.burst.reset();
    }

    /// Handle an M-W.  `command` is the whole command: "M-W", the address,
    /// the length, then the data.
    pub fn memory_write(&mut self, command: &Command) -> WriteOutcome {
        if command.len() < 6 {
            return WriteOutcome::Ignored;
        }

        let address = command.address();
        if address == DEVICE_ADDRESS_MW {
            return WriteOutcome::DeviceAddress(command.byte(6) & 0x1f);
        }
        if IGNORED_MW_ADDRESSES.contains(&address) {
            return WriteOutcome::Ignored;
        }

        self.previous = LoaderVariant::None;

        let len = usize::from(command.byte(5));
        for i in 6..6 + len {
            let byte = command.byte(i);
            self.datacrc = crc16_update(self.datacrc, byte);
            if self.datacrc == GIJOE_CRC && byte == RTS {
                self.pending = LoaderVariant::GiJoe;
            }
        }

        let upload = UPLOADS.iter().find(|u| u.crc == self.datacrc);
        match upload {
            Some(upload) => {
                debug!("Upload matches {}", upload.variant);
                self.pending = upload.variant;
                if upload.rxtx != RxTx::None {
                    self.rxtx = upload.rxtx;
                }
            }
            None => trace!("M-W {:04x}, CRC {:04x}", address, self.datacrc),
        }

        let data = command.bytes().get(6..).unwrap_or_default();
        let data = &data[..len.min(data.len())];
        if self.capture.is_active() {
            self.capture.take(address, data);
        } else if let Some(start) = upload.and_then(|u| geos::table_address(u.variant)) {
            self.capture.start(start);
            self.capture.take(address, data);
        }

        WriteOutcome::Uploaded(self.pending)
    }

    /// Handle an M-E, running the loader session if there is one.  Returns
    /// once the session has ended.
    pub async fn memory_execute<B, D, S>(
        &mut self,
        command: &Command<'_>,
        ctx: &mut DriveContext<'_, B, D, S>,
    ) -> DispatchOutcome
    where
        B: BusLines,
        D: SectorIo + Channels,
        S: DriveSignals,
    {
        let address = command.address();
        let mut variant = match self.pending {
            LoaderVariant::None => self.previous,
            pending => pending,
        };
        if variant == LoaderVariant::None {
            debug!("M-E {:04x}, CRC {:04x}", address, self.datacrc);
        }

        let outcome = 'search: loop {
            for entry in HANDLERS
                .iter()
                .filter(|e| e.variant == variant && e.address == address)
            {
                if let Detection::Accepted(outcome) =
                    self.run_handler(entry.handler, variant, command, ctx).await
                {
                    break 'search outcome;
                }
            }

            if variant == LoaderVariant::None {
                info!("Unknown drivecode, CRC {:04x}", self.datacrc);
                break DispatchOutcome::UnknownDrivecode(self.datacrc);
            }
            // Try the catch-alls
            variant = LoaderVariant::None;
        };

        self.datacrc = CRC_INIT;
        let carry = core::mem::take(&mut self.carry);
        self.previous = match outcome {
            // Drive checks come before the loader proper
            DispatchOutcome::CustomMagic { .. } => variant,
            _ => carry,
        };
        self.pending = LoaderVariant::None;

        outcome
    }

    /// Handle a burst fastload command.  Returns once the file has been
    /// sent, or the host has given up on it.
    pub async fn burst_fastload<B, D, S>(
        &mut self,
        command: &Command<'_>,
        ctx: &mut DriveContext<'_, B, D, S>,
    ) where
        B: FastSerial,
        D: SectorIo,
        S: DriveSignals,
    {
        let mut session = Session::new(
            &mut *ctx.bus,
            &mut *ctx.disk,
            &mut *ctx.signals,
            ctx.pool,
            command.part(),
            LoaderVariant::Burst,
            RxTx::None,
        );
        session.mark_active(self.marker);
        let result = burst::fastload(&mut session, &mut self.burst, command).await;
        log_exit(LoaderVariant::Burst, &result);
    }

    async fn run_handler<B, D, S>(
        &mut self,
        handler: Handler,
        variant: LoaderVariant,
        command: &Command<'_>,
        ctx: &mut DriveContext<'_, B, D, S>,
    ) -> Detection
    where
        B: BusLines,
        D: SectorIo + Channels,
        S: DriveSignals,
    {
        match handler {
            Handler::KrillSleep { check_magic } => {
                if check_magic && !krill::has_magic(command) {
                    return Detection::Declined;
                }
                info!("Bus sleep");
                Detection::Accepted(DispatchOutcome::BusSleep)
            }
            Handler::BusSleep => {
                info!("Bus sleep");
                Detection::Accepted(DispatchOutcome::BusSleep)
            }
            Handler::KrillDriveCheck(check) => {
                if !krill::drive_check(command, check) {
                    return Detection::Declined;
                }
                debug!("Krill drive check");
                Detection::Accepted(DispatchOutcome::CustomMagic {
                    address: CUSTOM_MAGIC_ADDRESS,
                    value: CUSTOM_MAGIC_VALUE,
                })
            }
            Handler::UltrabootFormat => {
                let Some(format) = ultraboot::detect_format(&*ctx.disk, command) else {
                    return Detection::Declined;
                };
                let result = ultraboot::format(&mut *ctx.disk, command.part(), format).await;
                // Writes to the formatted track follow as another M-E
                if result.is_ok() && format.is_dense() {
                    self.speed_zone = format.speed_zone;
                    self.carry = LoaderVariant::Ultraboot;
                }
                log_exit(LoaderVariant::Ultraboot, &result.map_err(LoaderError::from));
                Detection::Accepted(DispatchOutcome::Handled)
            }
            Handler::UltrabootWrite => {
                let result = ultraboot::write(&mut *ctx.disk, command.part(), self.speed_zone, command).await;
                log_exit(LoaderVariant::Ultraboot, &result.map_err(LoaderError::from));
                Detection::Accepted(DispatchOutcome::Handled)
            }
            _ => self.run_session(handler, variant, command, ctx).await,
        }
    }

    async fn run_session<B, D, S>(
        &self,
        handler: Handler,
        variant: LoaderVariant,
        command: &Command<'_>,
        ctx: &mut DriveContext<'_, B, D, S>,
    ) -> Detection
    where
        B: BusLines,
        D: SectorIo + Channels,
        S: DriveSignals,
    {
        // Catch-alls identify the loader before anything touches the bus
        let mut start = None;
        let mut krill_id = None;
        let variant = match handler {
            Handler::Ultraboot => match ultraboot::detect(command) {
                Some(s) => {
                    start = Some(s);
                    LoaderVariant::Ultraboot
                }
                None => return Detection::Declined,
            },
            Handler::Krill if variant == LoaderVariant::None => match krill::id_string(command) {
                Some(id) => {
                    krill_id = Some(id);
                    LoaderVariant::KrillR192
                }
                None => return Detection::Declined,
            },
            Handler::Booze if variant == LoaderVariant::None => {
                if !booze::detect(command) {
                    return Detection::Declined;
                }
                LoaderVariant::Booze
            }
            Handler::Spindle => match spindle::detect(command) {
                Some(v) => v,
                None => return Detection::Declined,
            },
            Handler::Sparkle if !sparkle::detect(command) => return Detection::Declined,
            _ => variant,
        };

        let mut session = Session::new(
            &mut *ctx.bus,
            &mut *ctx.disk,
            &mut *ctx.signals,
            ctx.pool,
            command.part(),
            variant,
            self.rxtx,
        );
        session.mark_active(self.marker);

        let result = match (handler, start) {
            (Handler::Ultraboot, Some(start)) => ultraboot::run(&mut session, start).await,
            (Handler::Krill, _) => krill::run(&mut session, krill_id).await,
            (Handler::Booze, _) => booze::run(&mut session).await,
            (Handler::Spindle, _) => spindle::run(&mut session).await,
            (Handler::Bitfire(header), _) => bitfire::run(&mut session, header).await,
            (Handler::Sparkle, _) => sparkle::run(&mut session).await,
            (Handler::Turbodisk, _) => turbodisk::run(&mut session, command).await,
            (Handler::Fc3Load { freezed }, _) => fc3::load(&mut session, freezed).await,
            (Handler::Fc3Save, _) => fc3::save(&mut session).await,
            (Handler::Fc3OldFreeze, _) => fc3::load_old_freezer(&mut session).await,
            (Handler::Dreamload, _) => dreamload::run(&mut session).await,
            (Handler::ULoad3, _) => uload3::run(&mut session).await,
            (Handler::ELoad1, _) => uload3::run_eload(&mut session).await,
            (Handler::GiJoe, _) => gijoe::run(&mut session).await,
            (Handler::EpyxCart, _) => epyxcart::run(&mut session).await,
            (Handler::GeosStage1, _) => match self.capture.complete() {
                Some(table) => geos::run_stage1(&mut session, table).await,
                None => {
                    warn!("GEOS stage 1 table wasn't uploaded");
                    Err(LoaderError::Protocol)
                }
            },
            (Handler::WheelsStage1, _) => geos::run_wheels_stage1(&mut session).await,
            (Handler::GeosJobs, _) => geos::run_jobs(&mut session).await,
            (Handler::Nippon, _) => nippon::run(&mut session).await,
            (Handler::Ar6Load, _) => ar6::load(&mut session).await,
            (Handler::Ar6Save, _) => ar6::save(&mut session).await,
            (Handler::Mmzak, _) => mmzak::run(&mut session).await,
            (Handler::N0sdos, _) => n0sdos::run(&mut session).await,
            (Handler::SamsJourney, _) => samsjourney::run(&mut session).await,
            (Handler::Hypraload, _) => hypraload::run(&mut session).await,
            _ => Ok(()),
        };
        log_exit(session.variant, &result);

        // 2.x Spindle only knows whether it's really Spindle once it has
        // seen the disk
        if handler == Handler::Spindle && session.variant == LoaderVariant::None {
            return Detection::Declined;
        }
        Detection::Accepted(DispatchOutcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_checksums_are_unique() {
        for (ii, a) in UPLOADS.iter().enumerate() {
            for b in &UPLOADS[ii + 1..] {
                assert_ne!(a.crc, b.crc);
            }
        }
    }

    #[test]
    fn every_uploaded_variant_has_a_handler() {
        for upload in UPLOADS {
            assert!(
                HANDLERS.iter().any(|h| h.variant == upload.variant),
                "no handler for {:?}",
                upload.variant
            );
        }
    }

    #[test]
    fn catch_alls_in_search_order() {
        let at_0205: Vec<Handler> = HANDLERS
            .iter()
            .filter(|h| h.address == 0x0205 && h.variant == LoaderVariant::None)
            .map(|h| h.handler)
            .collect();
        assert_eq!(
            at_0205,
            [
                Handler::Ultraboot,
                Handler::KrillDriveCheck(DriveCheck::Command),
                Handler::Spindle,
                Handler::Sparkle,
            ]
        );
    }

    fn memory_write(address: u16, data: &[u8]) -> Vec<u8> {
        let mut bytes = b"M-W".to_vec();
        bytes.extend_from_slice(&address.to_le_bytes());
        bytes.push(data.len() as u8);
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn uploads_accumulate() {
        let mut dispatcher = Dispatcher::new();
        let first = memory_write(0x0300, &[1, 2, 3]);
        let second = memory_write(0x0303, &[4, 5]);
        assert_eq!(
            dispatcher.memory_write(&Command::new(&first, 0)),
            WriteOutcome::Uploaded(LoaderVariant::None)
        );
        dispatcher.memory_write(&Command::new(&second, 0));
        assert_eq!(dispatcher.datacrc(), crate::util::crc::crc16(&[1, 2, 3, 4, 5]));
    }

    #[test]
    fn special_addresses_are_not_uploads() {
        let mut dispatcher = Dispatcher::new();
        let device = memory_write(DEVICE_ADDRESS_MW, &[0x29]);
        assert_eq!(
            dispatcher.memory_write(&Command::new(&device, 0)),
            WriteOutcome::DeviceAddress(9)
        );
        let via = memory_write(0x1c06, &[0x20]);
        assert_eq!(dispatcher.memory_write(&Command::new(&via, 0)), WriteOutcome::Ignored);
        assert_eq!(dispatcher.memory_write(&Command::new(b"M-W\x00", 0)), WriteOutcome::Ignored);
        assert_eq!(dispatcher.datacrc(), CRC_INIT);
    }

    #[test]
    fn known_upload_sets_pending_and_strategy() {
        use crate::test::forge::{filler, forge};
        use crate::util::crc::crc16;

        let mut data = filler(32, 5);
        forge(&mut data, 4, 0xc83a, crc16);
        let bytes = memory_write(0x0500, &data);

        let mut dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.memory_write(&Command::new(&bytes, 0)),
            WriteOutcome::Uploaded(LoaderVariant::Bitfire10)
        );
        assert_eq!(dispatcher.pending(), LoaderVariant::Bitfire10);
        assert_eq!(dispatcher.rxtx, RxTx::BitfireInvertedClock);
    }

    #[test]
    fn every_upload_is_recognised() {
        use crate::test::forge::{filler, forge};
        use crate::util::crc::crc16;

        for upload in UPLOADS {
            let mut data = filler(40, 2);
            forge(&mut data, 20, upload.crc, crc16);
            let bytes = memory_write(0x0300, &data);
            let mut dispatcher = Dispatcher::new();
            assert_eq!(
                dispatcher.memory_write(&Command::new(&bytes, 0)),
                WriteOutcome::Uploaded(upload.variant),
                "CRC {:04x}",
                upload.crc
            );
            if upload.rxtx != RxTx::None {
                assert_eq!(dispatcher.rxtx, upload.rxtx);
            }
        }
    }

    #[test]
    fn gijoe_is_recognised_by_its_final_rts() {
        use crate::test::forge::{filler, forge};
        use crate::util::crc::crc16;

        let mut data = filler(30, 8);
        *data.last_mut().unwrap() = RTS;
        forge(&mut data, 10, GIJOE_CRC, crc16);

        // More code after it doesn't matter
        let mut dispatcher = Dispatcher::new();
        dispatcher.memory_write(&Command::new(&memory_write(0x0500, &data), 0));
        dispatcher.memory_write(&Command::new(&memory_write(0x051e, &[1, 2, 3]), 0));
        assert_eq!(dispatcher.pending(), LoaderVariant::GiJoe);

        // The same checksum without the RTS isn't GI Joe
        *data.last_mut().unwrap() = 0x61;
        forge(&mut data, 10, GIJOE_CRC, crc16);
        let mut dispatcher = Dispatcher::new();
        dispatcher.memory_write(&Command::new(&memory_write(0x0500, &data), 0));
        assert_eq!(dispatcher.pending(), LoaderVariant::None);
    }

    #[test]
    fn geos_table_is_captured_across_writes() {
        use crate::test::forge::{filler, forge};
        use crate::util::crc::crc16;

        // Drivecode from 0x0400, uploaded 32 bytes at a time
        let mut image = filler(0x160, 6);
        forge(&mut image[..32], 4, 0xb979, crc16);

        let mut dispatcher = Dispatcher::new();
        for (ii, chunk) in image.chunks(32).enumerate() {
            let address = 0x0400 + 32 * ii as u16;
            dispatcher.memory_write(&Command::new(&memory_write(address, chunk), 0));
            if ii == 0 {
                assert_eq!(dispatcher.pending(), LoaderVariant::GeosStage1C64);
                assert!(dispatcher.capture.complete().is_none());
            }
        }

        let start = usize::from(geos::TABLE_ADDRESS_C64 - 0x0400);
        let table = dispatcher.capture.complete().expect("table captured");
        assert_eq!(&table[..], &image[start..start + TABLE_LEN]);
        assert_eq!(dispatcher.rxtx, RxTx::GeosOneMhz);
    }

    #[test]
    fn capture_needs_the_whole_table() {
        let mut capture = Capture::new();
        capture.start(0x044f);
        capture.take(0x0400, &[0x11; 0x60]);
        assert_eq!(capture.len, 0x11);
        assert!(capture.complete().is_none());
        // A write that ends before the wanted address
        capture.take(0x0300, &[0x22; 0x20]);
        assert_eq!(capture.len, 0x11);
        capture.take(0x0460, &[0x33; 0x100]);
        let table = capture.complete().expect("complete");
        assert_eq!(table[0x10], 0x11);
        assert_eq!(table[0x11], 0x33);
        assert!(!capture.is_active());
    }
}
