//! This file implements custom timing functions and macros used by the
//! fastloaders.
//!
//! Fastloader protocols come in two flavours of waiting:
//! - Bit level waits, which must react within a few microseconds.  These
//!   spin on the bus lines until a [`Deadline`] passes, and never yield.
//! - Request level waits (host idle, disk change), which may last forever.
//!   These yield to the executor between polls so that the rest of the
//!   firmware keeps running.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

/// Returned when a bus wait did not see the expected edge in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout;

/// Function to block until a specific instant.  This is similar to the
/// embassy-time::Delay::block_for function.
///
/// We always inline it to reduce function call/return overhead, as this is
/// typically used in timing critical functions
#[allow(clippy::inline_always)]
#[inline(always)]
pub fn block_until(expires: Instant) {
    while Instant::now() < expires {}
}

/// Function to block for a specific Duration.  This is similar to the
/// embassy-time::Delay::block_for function.
#[allow(clippy::inline_always)]
#[inline(always)]
pub fn block_for(duration: Duration) {
    block_until(Instant::now() + duration);
}

/// An absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Expires `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    /// Never expires.
    pub const fn never() -> Self {
        Self(None)
    }

    /// Builds a deadline from a millisecond bound as the loaders specify
    /// them.  0 waits forever, anything else is counted in whole 10ms steps,
    /// so 15ms gives 20ms and 5ms gives 10ms.
    pub fn from_ms(ms: u32) -> Self {
        if ms == 0 {
            Self::never()
        } else {
            let steps = u64::from(ms.div_ceil(TIMEOUT_STEP_MS));
            Self::after(Duration::from_millis(steps * u64::from(TIMEOUT_STEP_MS)))
        }
    }

    /// Whether the deadline has passed.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn expired(&self) -> bool {
        match self.0 {
            Some(expires) => Instant::now() >= expires,
            None => false,
        }
    }

    /// The instant the deadline expires, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }
}

/// Granularity of the millisecond timeouts used by the loaders.
pub const TIMEOUT_STEP_MS: u32 = 10;

/// Spins until `done` returns true, or the deadline passes.
///
/// The predicate is checked once more after expiry, so a line that changes
/// just as the deadline passes is still seen.
#[allow(clippy::inline_always)]
#[inline(always)]
pub fn poll_until(mut done: impl FnMut() -> bool, deadline: Deadline) -> Result<(), Timeout> {
    loop {
        if done() {
            return Ok(());
        }
        if deadline.expired() {
            return if done() { Ok(()) } else { Err(Timeout) };
        }
    }
}

/// Block for a specific number of microseconds.
macro_rules! block_us {
    ($us:expr) => {
        crate::util::time::block_for(embassy_time::Duration::from_micros($us))
    };
}
pub(crate) use block_us;

/// Macro to briefly delay in order to let the bus lines settle.
macro_rules! iec_delay {
    () => {
        crate::util::time::block_us!(2)
    };
}
pub(crate) use iec_delay;

/// Macro which yields to the scheduler for at least the specified time.  As
/// embassy will only come back to us after whatever has been scheduled has
/// paused, it could be longer than specified.  If you need a more accurate
/// pause, considering using block_us! instead.
macro_rules! yield_ms {
    ($ms:expr) => {
        embassy_time::Timer::after_millis($ms).await
    };
}
pub(crate) use yield_ms;

pub mod fl {
    //! Fastloader timeouts, in milliseconds unless stated otherwise.

    /// Per edge timeout for the one bit receivers.
    pub const BIT_TIMEOUT_MS: u32 = 90;

    /// Timeout for ATN handshakes during a byte transfer.
    pub const ATN_TIMEOUT_MS: u32 = 1000;

    /// Bitfire bus lock: how long ATN may stay low before we assume the host
    /// was reset.
    pub const BITFIRE_LOCK_TIMEOUT_MS: u32 = 2500;

    /// Booze per-byte timeout while sending a block.
    pub const BOOZE_BYTE_TIMEOUT_MS: u32 = 4000;

    /// Bitfire end of drivecode gap, in microseconds.
    pub const BITFIRE_EOB_US: u64 = 150;

    /// Bitfire delay before the first block of each file.
    pub const BITFIRE_FILE_DELAY_MS: u64 = 30;

    /// Booze delay before the first block of each file.
    pub const BOOZE_FILE_DELAY_MS: u64 = 60;

    /// Step size for Krill block delays.
    pub const KRILL_BLOCK_DELAY_STEP_MS: u64 = 20;

    /// Ultraboot delay after the host signals it is ready.
    pub const ULTRABOOT_START_DELAY_MS: u64 = 20;

    /// One frame, so the host has its screen off before the first byte.
    /// Used by Hypra-Load and Final Cartridge III.
    pub const FRAME_DELAY_MS: u64 = 20;

    /// Dreamload holds back the first directory sector, to give disk swaps
    /// a chance.
    pub const DREAMLOAD_DIR_DELAY_MS: u64 = 1000;

    /// Final Cartridge III save: time for the host to pull DATA.
    pub const FC3_SAVE_DELAY_MS: u64 = 5;

    /// Final Cartridge III gap between four byte blocks, in microseconds.
    pub const FC3_BLOCK_GAP_US: u64 = 190;

    /// Final Cartridge III old freezer: how long the host may take over its
    /// UNLISTEN.
    pub const FC3_UNLISTEN_TIMEOUT_MS: u32 = 100;

    /// GI Joe settle time before looking at the bus.
    pub const GIJOE_SETTLE_MS: u64 = 10;

    /// Sam's Journey delay after the command that started it.
    pub const SAMSJOURNEY_START_DELAY_MS: u64 = 1;

    /// Timeout for the host to start a timed byte, once a transfer is
    /// under way.
    pub const TIMED_BYTE_TIMEOUT_MS: u32 = 1000;
}
