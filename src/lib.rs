//! pico-fastloader
//!
//! This implements the drive side of the Commodore fastloaders used by
//! demos and games: Krill, Bitfire, Sparkle, Spindle, Booze and Ultraboot.
//! It is designed to sit inside SD card based drive emulator firmware,
//! below the generic command layer and above the disk image layer.
//!
//! Loaders install themselves by uploading drivecode with M-W commands and
//! starting it with M-E.  Pass those commands to a [`Dispatcher`], which
//! identifies the loader and runs a session speaking its protocol on the
//! serial bus until the host is finished with it.
//!
//! The crate is hardware independent.  The firmware provides:
//! - the serial bus, through [`BusLines`] ([`infra::gpio::PinBus`] on GPIO
//!   pins);
//! - the mounted disk image, through [`SectorIo`];
//! - key presses and disk changes, through [`DriveSignals`]
//!   ([`infra::ui::UI`]).

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![cfg_attr(not(test), no_std)]

// Provide some feature guidance when compiling for hardware.
#[cfg(all(feature = "rp", not(any(feature = "pico", feature = "pico2"))))]
compile_error!("Either 'pico' or 'pico2' feature must be enabled for hardware builds");
#[cfg(all(feature = "pico", feature = "pico2"))]
compile_error!("Features 'pico' and 'pico2' cannot be enabled simultaneously");

// Declare all of this library's modules.
mod fmt;

pub mod buffers;
pub mod bus;
pub mod constants;
pub mod detect;
pub mod disk;
pub mod driver;
pub mod infra;
pub mod loader;
pub mod protocol;
pub mod quirks;
pub mod util;

#[cfg(test)]
mod test;

pub use buffers::{Buffer, BufferPool};
pub use bus::{BusLines, BusState, FastSerial, Line};
pub use detect::{Detection, DispatchOutcome, Dispatcher, DriveContext, WriteOutcome};
pub use driver::{Channels, Command, DriveSignals, Key, LoaderError, MediaError, Sector, SectorIo};
pub use loader::{ACTIVE_LOADER, ActiveLoader, LoaderVariant};

// Extra binary information that picotool can read.
#[cfg(feature = "rp")]
#[unsafe(link_section = ".bi_entries")]
#[used]
pub static PICOTOOL_ENTRIES: [embassy_rp::binary_info::EntryAddr; 4] = [
    embassy_rp::binary_info::rp_program_name!(c"pico-fastloader by piers.rocks"),
    embassy_rp::binary_info::rp_program_description!(
        c"Commodore drive fastloader engine: Krill, Bitfire, Sparkle, Spindle, Booze and Ultraboot."
    ),
    embassy_rp::binary_info::rp_cargo_version!(),
    embassy_rp::binary_info::rp_program_build_attribute!(),
];

// A note about Statics
//
// The engine itself holds no mutable state in statics.  Sessions borrow
// everything they use from the caller.  The exceptions are the active
// loader marker, which other tasks read to keep off the bus, and the UI
// plumbing, which is written by other tasks.  Both are safe to share
// between cores: the marker is atomic, and the UI uses
// CriticalSectionRawMutex based embassy-sync primitives.
