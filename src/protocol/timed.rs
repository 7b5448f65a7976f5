//! Timed two bit transfers.
//!
//! Here the host only provides a single reference edge, and then samples
//! CLOCK and DATA at fixed points afterwards.  We place four bit pairs on
//! the lines at fixed offsets from that edge.  Receiving works the same way
//! round, with the host placing the pairs and us sampling them.  This only
//! works if nothing interrupts us, so [`TimedPairs`] must be used inside
//! [`BusLines::critical`].  [`TimedLink`] takes care of that, and of the
//! handshake that produces the reference edge.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

use crate::bus::{BusLines, BusState};
use crate::driver::LoaderError;
use crate::util::time::{Deadline, block_until};

/// Timing and bit layout of a two bit transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedPairs {
    /// When each pair goes onto the bus, in units of 100ns after the
    /// reference edge.
    pub pair_times: [u16; 4],
    /// Which bit of the (eor'd) byte goes onto CLOCK for each pair.
    pub clock_bits: [u8; 4],
    /// Which bit of the (eor'd) byte goes onto DATA for each pair.
    pub data_bits: [u8; 4],
    /// Applied to the byte before sending.
    pub eor: u8,
}

impl TimedPairs {
    /// Ultraboot timing.
    pub const ULTRABOOT: TimedPairs = TimedPairs {
        pair_times: [190, 270, 350, 430],
        clock_bits: [7, 6, 3, 2],
        data_bits: [5, 4, 1, 0],
        eor: 0xff,
    };

    /// Krill r146 "resend" timing.
    pub const KRILL_RESEND: TimedPairs = TimedPairs {
        pair_times: [100, 180, 260, 340],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0x00,
    };

    /// Hypra-Load, both versions.
    pub const HYPRALOAD: TimedPairs = TimedPairs {
        pair_times: [300, 550, 800, 1050],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Turbodisk.
    pub const TURBODISK: TimedPairs = TimedPairs {
        pair_times: [310, 600, 890, 1180],
        clock_bits: [7, 5, 3, 1],
        data_bits: [6, 4, 2, 0],
        eor: 0x00,
    };

    /// ULoad Model 3 and ELoad, host to drive.
    pub const ULOAD3_GET: TimedPairs = TimedPairs {
        pair_times: [140, 220, 300, 380],
        clock_bits: [7, 6, 3, 2],
        data_bits: [5, 4, 1, 0],
        eor: 0xff,
    };

    /// ULoad Model 3 and ELoad, drive to host.
    pub const ULOAD3_SEND: TimedPairs = TimedPairs {
        pair_times: [140, 220, 300, 380],
        clock_bits: [0, 1, 4, 5],
        data_bits: [2, 3, 6, 7],
        eor: 0xff,
    };

    /// Final Cartridge III save, host to drive.
    pub const FC3_GET: TimedPairs = TimedPairs {
        pair_times: [170, 300, 430, 560],
        clock_bits: [7, 6, 5, 4],
        data_bits: [3, 2, 1, 0],
        eor: 0xff,
    };

    /// Final Cartridge III, one byte of a four byte load block.
    pub const FC3_BLOCK: TimedPairs = TimedPairs {
        pair_times: [120, 220, 320, 420],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Final Cartridge III old freezer, PAL hosts.
    pub const FC3_OLDFREEZE_PAL: TimedPairs = TimedPairs {
        pair_times: [140, 240, 340, 440],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Final Cartridge III old freezer, NTSC hosts, which run slightly
    /// faster.
    pub const FC3_OLDFREEZE_NTSC: TimedPairs = TimedPairs {
        pair_times: [135, 230, 325, 420],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// GEOS at 1MHz, host to drive.
    pub const GEOS_1MHZ_GET: TimedPairs = TimedPairs {
        pair_times: [150, 290, 395, 505],
        clock_bits: [4, 6, 3, 2],
        data_bits: [5, 7, 1, 0],
        eor: 0xff,
    };

    /// GEOS at 1MHz, drive to host.
    pub const GEOS_1MHZ_SEND: TimedPairs = TimedPairs {
        pair_times: [180, 280, 390, 510],
        clock_bits: [3, 2, 4, 6],
        data_bits: [1, 0, 5, 7],
        eor: 0x0f,
    };

    /// GEOS at 2MHz, host to drive.
    pub const GEOS_2MHZ_GET: TimedPairs = TimedPairs {
        pair_times: [150, 245, 340, 435],
        clock_bits: [4, 6, 3, 2],
        data_bits: [5, 7, 1, 0],
        eor: 0xff,
    };

    /// GEOS at 2MHz, drive to host.
    pub const GEOS_2MHZ_SEND: TimedPairs = TimedPairs {
        pair_times: [90, 170, 250, 330],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0x00,
    };

    /// GEOS 1581 Configure 2.1 and the faster Wheels drivers, drive to host.
    pub const GEOS_1581_21_SEND: TimedPairs = TimedPairs {
        pair_times: [70, 140, 240, 330],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Wheels at 1MHz, host to drive.
    pub const WHEELS_1MHZ_GET: TimedPairs = TimedPairs {
        pair_times: [160, 300, 405, 515],
        clock_bits: [4, 6, 3, 2],
        data_bits: [5, 7, 1, 0],
        eor: 0xff,
    };

    /// Wheels at 1MHz, drive to host.
    pub const WHEELS_1MHZ_SEND: TimedPairs = TimedPairs {
        pair_times: [160, 260, 370, 480],
        clock_bits: [3, 2, 4, 6],
        data_bits: [1, 0, 5, 7],
        eor: 0x0f,
    };

    /// Wheels 4.4 at 1MHz, host to drive.
    pub const WHEELS44_1MHZ_GET: TimedPairs = TimedPairs {
        pair_times: [170, 310, 420, 530],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Wheels 4.4 at 2MHz, host to drive.
    pub const WHEELS44_2MHZ_GET: TimedPairs = TimedPairs {
        pair_times: [110, 190, 270, 350],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Wheels 4.4 at 2MHz, drive to host.
    pub const WHEELS44_2MHZ_SEND: TimedPairs = TimedPairs {
        pair_times: [80, 160, 240, 320],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// Epyx FastLoad cartridge, drive to host.
    pub const EPYXCART: TimedPairs = TimedPairs {
        pair_times: [100, 200, 300, 400],
        clock_bits: [7, 5, 3, 1],
        data_bits: [6, 4, 2, 0],
        eor: 0xff,
    };

    /// Action Replay 6 on a 1581, drive to host.
    pub const AR6_1581_SEND: TimedPairs = TimedPairs {
        pair_times: [50, 130, 210, 290],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0x00,
    };

    /// Action Replay 6 on a 1581, host to drive.
    pub const AR6_1581_GET: TimedPairs = TimedPairs {
        pair_times: [60, 140, 220, 300],
        clock_bits: [7, 5, 3, 1],
        data_bits: [6, 4, 2, 0],
        eor: 0x00,
    };

    /// N0SDOS, drive to host.
    pub const N0SDOS_SEND: TimedPairs = TimedPairs {
        pair_times: [100, 190, 280, 370],
        clock_bits: [0, 2, 4, 6],
        data_bits: [1, 3, 5, 7],
        eor: 0xff,
    };

    /// The line levels for pair `index` of `byte`.
    pub fn pair(&self, byte: u8, index: usize) -> (bool, bool) {
        let byte = byte ^ self.eor;
        (
            byte & (1 << self.clock_bits[index]) != 0,
            byte & (1 << self.data_bits[index]) != 0,
        )
    }

    /// The bits of a byte carried by pair `index`, from the line levels.
    /// The inverse of [`pair`](Self::pair), before the eor.
    pub fn bits(&self, state: BusState, index: usize) -> u8 {
        u8::from(state.contains(BusState::CLOCK)) << self.clock_bits[index]
            | u8::from(state.contains(BusState::DATA)) << self.data_bits[index]
    }

    /// Send `byte`, relative to the `reference` edge.
    pub fn send<B: BusLines>(&self, bus: &mut B, reference: Instant, byte: u8) {
        for index in 0..4 {
            block_until(at(reference, self.pair_times[index]));
            let (clock, data) = self.pair(byte, index);
            bus.set_lines(clock, data);
        }
    }

    /// Receive a byte, sampling relative to the `reference` edge.
    pub fn receive<B: BusLines>(&self, bus: &mut B, reference: Instant) -> u8 {
        let mut byte = 0;
        for index in 0..4 {
            block_until(at(reference, self.pair_times[index]));
            byte |= self.bits(bus.read(), index);
        }
        byte ^ self.eor
    }
}

/// How long the last pair stays on the bus, in units of 100ns.
const HOLD: u16 = 250;

/// How the host starts a timed byte, giving us the reference edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Start {
    /// The host pulls DATA, we release CLOCK, and the host releasing DATA
    /// is the reference.
    DataRelease,
    /// The host pulls ATN, we release DATA, and the host releasing ATN is
    /// the reference.
    AtnRelease,
}

/// A complete timed byte transfer: the handshake, the bit pairs, and the
/// line levels we leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedLink {
    pub pairs: TimedPairs,
    pub start: Start,
    /// When we set the exit levels, in units of 100ns after the reference.
    pub exit_time: u16,
    /// CLOCK and DATA after the byte.
    pub exit: (bool, bool),
    /// Whether the host pulling ATN while we wait for it ends the transfer.
    pub atn_abort: bool,
}

impl TimedLink {
    /// Sending, with a [`Start::DataRelease`] handshake.
    pub const fn data_release(pairs: TimedPairs, exit: (bool, bool)) -> Self {
        Self {
            pairs,
            start: Start::DataRelease,
            exit_time: pairs.pair_times[3] + HOLD,
            exit,
            atn_abort: true,
        }
    }

    /// Sending, with a [`Start::AtnRelease`] handshake.
    pub const fn atn_release(pairs: TimedPairs, exit: (bool, bool)) -> Self {
        Self {
            pairs,
            start: Start::AtnRelease,
            exit_time: pairs.pair_times[3] + HOLD,
            exit,
            atn_abort: false,
        }
    }

    /// The same transfer, except that ATN is part of the handshake and
    /// doesn't abort it.
    pub const fn ignoring_atn(mut self) -> Self {
        self.atn_abort = false;
        self
    }

    /// Wait until `done` is true of the bus, or ATN is pulled if that aborts
    /// the transfer.
    fn wait<B: BusLines>(
        &self,
        bus: &mut B,
        deadline: Deadline,
        done: impl Fn(BusState) -> bool,
    ) -> Result<(), LoaderError> {
        loop {
            let state = bus.read();
            if done(state) {
                return Ok(());
            }
            if self.atn_abort && !state.contains(BusState::ATN) {
                return Err(LoaderError::HostReset);
            }
            if deadline.expired() {
                return Err(LoaderError::Timeout);
            }
        }
    }

    /// Wait for the host's reference edge, returning when it happened.
    fn handshake<B: BusLines>(&self, bus: &mut B, deadline: Deadline) -> Result<Instant, LoaderError> {
        match self.start {
            Start::DataRelease => {
                self.wait(bus, deadline, |s| !s.contains(BusState::DATA))?;
                bus.set_clock(true);
                self.wait(bus, deadline, |s| s.contains(BusState::DATA))?;
            }
            Start::AtnRelease => {
                let link = self.ignoring_atn();
                link.wait(bus, deadline, |s| !s.contains(BusState::ATN))?;
                bus.set_data(true);
                link.wait(bus, deadline, |s| s.contains(BusState::ATN))?;
            }
        }
        Ok(Instant::now())
    }

    /// Send `byte`.  `timeout_ms` limits the wait for the host, 0 waits
    /// forever.
    pub fn send<B: BusLines>(&self, bus: &mut B, byte: u8, timeout_ms: u32) -> Result<(), LoaderError> {
        let deadline = Deadline::from_ms(timeout_ms);
        bus.critical(|bus| {
            let reference = self.handshake(bus, deadline)?;
            self.pairs.send(bus, reference, byte);
            block_until(at(reference, self.exit_time));
            bus.set_lines(self.exit.0, self.exit.1);
            Ok(())
        })
    }

    /// Send each of `bytes` in turn.
    pub fn send_all<B: BusLines>(&self, bus: &mut B, bytes: &[u8], timeout_ms: u32) -> Result<(), LoaderError> {
        bytes.iter().try_for_each(|&byte| self.send(bus, byte, timeout_ms))
    }

    /// Receive a byte.  We pull CLOCK to say we're ready, and release DATA
    /// so the host can use it.
    pub fn receive<B: BusLines>(&self, bus: &mut B, timeout_ms: u32) -> Result<u8, LoaderError> {
        let deadline = Deadline::from_ms(timeout_ms);
        bus.critical(|bus| {
            bus.set_lines(false, true);
            let reference = self.handshake(bus, deadline)?;
            let byte = self.pairs.receive(bus, reference);
            block_until(at(reference, self.exit_time));
            bus.set_lines(self.exit.0, self.exit.1);
            Ok(byte)
        })
    }
}

/// The instant `time` (in units of 100ns) after `reference`.
pub fn at(reference: Instant, time: u16) -> Instant {
    reference + Duration::from_nanos(u64::from(time) * 100)
}
