//! This file implements [`BusLines`] on GPIO pins.
//!
//! Each bus line the drive can pull has a pair of pins, one input and one
//! output.  The output drives an inverting open collector buffer, so the
//! output pin is set high to pull the line low, and low to release it.  The
//! input pin sees the line itself.  ATN is input only.
//!
//! The source code serves as the master list of pin assignments for the
//! hardware.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::convert::Infallible;

use embedded_hal::digital::{InputPin, OutputPin};

use crate::bus::{BusLines, BusState};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

/// GPIO configurations for different boards
pub mod config {
    use super::BusPinConfig;

    /// Configuration for the v0.1 board
    pub fn standard_v0_1() -> BusPinConfig {
        BusPinConfig {
            clock_in: 19,
            clock_out: 11,
            data_in: 20,
            data_out: 13,
            atn_in: 17,
        }
    }
}

/// Serial bus pin configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusPinConfig {
    pub clock_in: u8,
    pub clock_out: u8,
    pub data_in: u8,
    pub data_out: u8,
    pub atn_in: u8,
}

impl IntoIterator for BusPinConfig {
    type Item = u8;
    type IntoIter = core::array::IntoIter<u8, 5>;

    fn into_iter(self) -> Self::IntoIter {
        [
            self.clock_in,
            self.clock_out,
            self.data_in,
            self.data_out,
            self.atn_in,
        ]
        .into_iter()
    }
}

// GPIO access can't fail on this hardware
fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// The drive side of the serial bus on GPIO pins.
pub struct PinBus<I, O> {
    clock_in: I,
    clock_out: O,
    data_in: I,
    data_out: O,
    atn_in: I,
}

impl<I, O> PinBus<I, O>
where
    I: InputPin<Error = Infallible>,
    O: OutputPin<Error = Infallible>,
{
    /// Create the bus, releasing CLOCK and DATA.  Pins must already be set
    /// up as inputs and outputs.
    pub fn new(clock_in: I, mut clock_out: O, data_in: I, mut data_out: O, atn_in: I) -> Self {
        infallible(clock_out.set_low());
        infallible(data_out.set_low());
        Self {
            clock_in,
            clock_out,
            data_in,
            data_out,
            atn_in,
        }
    }

    /// Get the pins back, for example to hand the bus to the generic
    /// protocol layer when a session ends.
    pub fn into_pins(self) -> (I, O, I, O, I) {
        (
            self.clock_in,
            self.clock_out,
            self.data_in,
            self.data_out,
            self.atn_in,
        )
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn drive(pin: &mut O, high: bool) {
        // Inverted output
        if high {
            infallible(pin.set_low());
        } else {
            infallible(pin.set_high());
        }
    }
}

impl<I, O> BusLines for PinBus<I, O>
where
    I: InputPin<Error = Infallible>,
    O: OutputPin<Error = Infallible>,
{
    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn read(&mut self) -> BusState {
        let mut state = BusState::empty();
        state.set(BusState::CLOCK, infallible(self.clock_in.is_high()));
        state.set(BusState::DATA, infallible(self.data_in.is_high()));
        state.set(BusState::ATN, infallible(self.atn_in.is_high()));
        state
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn set_clock(&mut self, high: bool) {
        Self::drive(&mut self.clock_out, high);
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn set_data(&mut self, high: bool) {
        Self::drive(&mut self.data_out, high);
    }

    #[cfg(feature = "rp")]
    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        cortex_m::interrupt::free(|_| f(self))
    }
}

#[cfg(feature = "rp")]
mod rp {
    use embassy_rp::gpio::{Flex, Pull};

    use super::PinBus;

    impl PinBus<Flex<'static>, Flex<'static>> {
        /// Create the bus from flexible pins, setting their direction.
        pub fn from_flex(
            mut clock_in: Flex<'static>,
            mut clock_out: Flex<'static>,
            mut data_in: Flex<'static>,
            mut data_out: Flex<'static>,
            mut atn_in: Flex<'static>,
        ) -> Self {
            // The level shifter has pull-ups on its outputs
            for pin in [&mut clock_in, &mut data_in, &mut atn_in] {
                pin.set_as_input();
                pin.set_pull(Pull::None);
            }
            for pin in [&mut clock_out, &mut data_out] {
                pin.set_low();
                pin.set_as_output();
            }
            Self::new(clock_in, clock_out, data_in, data_out, atn_in)
        }
    }
}
