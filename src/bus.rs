//! This file defines the drive's view of the serial bus.
//!
//! The bus is open collector.  Each line is high (released) unless at least
//! one device pulls it low.  Throughout this crate a line level of `true`
//! means high/released and `false` means low/pulled, matching what the host
//! sees when it reads the line.  The drive can pull CLOCK and DATA, but only
//! ever reads ATN.
//!
//! Implementations only move the lines.  They never change pin direction or
//! anything else about the hardware, that is set up once by the firmware.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use bitflags::bitflags;

bitflags! {
    /// Snapshot of the three bus lines.  A set bit means the line is high.
    ///
    /// We use the same bit values as the IEC masks used by the rest of the
    /// firmware to reduce the possibility of bugs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusState: u8 {
        const DATA = 0x01;
        const CLOCK = 0x02;
        const ATN = 0x04;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BusState {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BusState({=u8:#x})", self.bits());
    }
}

/// A single bus line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Line {
    Atn,
    Clock,
    Data,
}

impl Line {
    /// The mask of this line in a [`BusState`].
    pub const fn mask(self) -> BusState {
        match self {
            Line::Atn => BusState::ATN,
            Line::Clock => BusState::CLOCK,
            Line::Data => BusState::DATA,
        }
    }
}

/// The drive side of the serial bus.
pub trait BusLines {
    /// Read all three lines at once.
    fn read(&mut self) -> BusState;

    /// Release (true) or pull (false) CLOCK.
    fn set_clock(&mut self, high: bool);

    /// Release (true) or pull (false) DATA.
    fn set_data(&mut self, high: bool);

    /// Set CLOCK and DATA together.  Implementations that can write both in
    /// one go should override this, the timed senders rely on both lines
    /// changing at the same moment.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn set_lines(&mut self, clock: bool, data: bool) {
        self.set_clock(clock);
        self.set_data(data);
    }

    /// Runs `f` with interrupts masked, for one byte or one block.  The
    /// default implementation simply runs `f`.
    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized,
    {
        f(self)
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn atn(&mut self) -> bool {
        self.read().contains(BusState::ATN)
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn clock(&mut self) -> bool {
        self.read().contains(BusState::CLOCK)
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn data(&mut self) -> bool {
        self.read().contains(BusState::DATA)
    }

    /// Level of an arbitrary line.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn line(&mut self, line: Line) -> bool {
        self.read().contains(line.mask())
    }

    /// Drive an arbitrary line.  The drive cannot drive ATN, so that is
    /// ignored.
    fn set_line(&mut self, line: Line, high: bool) {
        match line {
            Line::Clock => self.set_clock(high),
            Line::Data => self.set_data(high),
            Line::Atn => (),
        }
    }

    /// Release CLOCK and DATA, leaving the bus idle from our side.
    fn release(&mut self) {
        self.set_lines(true, true);
    }
}

/// The fast serial output of 1571 and 1581 drives, used by the burst
/// commands.  Bytes go out MSB first on DATA, clocked by SRQ, and need no
/// reply from the host.  Only buses with an SRQ line implement this.
pub trait FastSerial: BusLines {
    fn send_fast(&mut self, byte: u8);
}
