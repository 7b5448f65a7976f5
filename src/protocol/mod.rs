//! Byte level building blocks shared by the fastloaders.
//!
//! - [`clocked`] - transfers where the host clocks every bit.
//! - [`timed`] - transfers where we place bits at fixed times after a single
//!   host edge.
//!
//! Which lines a loader uses, and with what polarity, differs between
//! loaders and even between versions of the same loader.  Detection picks
//! one of the [`RxTx`] strategies, and the loader asks it for the
//! [`Receiver`] and [`Sender`] to use.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod clocked;
pub mod timed;

pub use clocked::{
    clocked_read_after_edge, clocked_read_byte, clocked_send_byte, clocked_write_byte, wait_atn_high,
    wait_atn_low,
};
pub use timed::{Start, TimedLink, TimedPairs};

use crate::bus::Line;

/// A pair of lines used to receive bytes: the first is the clock, the
/// second carries the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinePair {
    ClockData,
    DataClock,
    ClockAtn,
    AtnClock,
}

impl LinePair {
    pub const fn clock(self) -> Line {
        match self {
            LinePair::ClockData | LinePair::ClockAtn => Line::Clock,
            LinePair::DataClock => Line::Data,
            LinePair::AtnClock => Line::Atn,
        }
    }

    pub const fn data(self) -> Line {
        match self {
            LinePair::ClockData => Line::Data,
            LinePair::DataClock | LinePair::AtnClock => Line::Clock,
            LinePair::ClockAtn => Line::Atn,
        }
    }
}

/// How to receive a byte.  The bit level algorithm belongs to the loader,
/// this only says which lines it runs on and whether the data is inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Receiver {
    pub lines: LinePair,
    pub inverted: bool,
}

impl Receiver {
    pub const fn new(lines: LinePair, inverted: bool) -> Self {
        Self { lines, inverted }
    }
}

/// How to send a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sender {
    /// Loader doesn't send bytes through the shared strategy
    None,
    /// Two bits at a time, clocked by ATN.  With `shuffled`, the byte is
    /// inverted and sent in the early Krill bit order.
    Atn { shuffled: bool },
    /// Two bits at a time at fixed times after an ATN edge, repeated until
    /// the host acknowledges.
    Resend,
}

/// Receive/send strategies selected at detection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxTx {
    None,
    Krill58Pre,
    KrillData,
    KrillClock,
    KrillResend,
    BitfireData,
    BitfireInvertedData,
    BitfireClock,
    BitfireInvertedClock,
    GeosOneMhz,
    GeosTwoMhz,
    Geos1581V21,
    WheelsOneMhz,
    WheelsTwoMhz,
    Wheels44D1541,
    Wheels44D1581,
    Fc3OldFreezePal,
    Fc3OldFreezeNtsc,
    Hypraload10,
    Hypraload21,
}

/// Timed byte transfers in each direction.  Not every loader receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedRxTx {
    pub get: Option<TimedLink>,
    pub send: TimedLink,
}

const fn both(get: TimedPairs, send: TimedPairs) -> TimedRxTx {
    TimedRxTx {
        get: Some(TimedLink::data_release(get, (true, true))),
        send: TimedLink::data_release(send, (true, true)),
    }
}

const fn send_only(send: TimedLink) -> TimedRxTx {
    TimedRxTx { get: None, send }
}

impl RxTx {
    /// The byte receiver, if this strategy has one.
    pub const fn receiver(self) -> Option<Receiver> {
        match self {
            RxTx::None => None,
            RxTx::Krill58Pre | RxTx::KrillData | RxTx::KrillResend => {
                Some(Receiver::new(LinePair::ClockData, true))
            }
            RxTx::KrillClock => Some(Receiver::new(LinePair::DataClock, true)),
            RxTx::BitfireData => Some(Receiver::new(LinePair::ClockData, false)),
            RxTx::BitfireInvertedData => Some(Receiver::new(LinePair::ClockData, true)),
            RxTx::BitfireClock => Some(Receiver::new(LinePair::DataClock, false)),
            RxTx::BitfireInvertedClock => Some(Receiver::new(LinePair::DataClock, true)),
            _ => None,
        }
    }

    /// The byte sender.
    pub const fn sender(self) -> Sender {
        match self {
            RxTx::Krill58Pre => Sender::Atn { shuffled: true },
            RxTx::KrillData | RxTx::KrillClock => Sender::Atn { shuffled: false },
            RxTx::KrillResend => Sender::Resend,
            _ => Sender::None,
        }
    }

    /// The timed transfers, for the loaders that place bits at fixed times.
    pub const fn timed(self) -> Option<TimedRxTx> {
        use TimedPairs as T;
        Some(match self {
            RxTx::GeosOneMhz => both(T::GEOS_1MHZ_GET, T::GEOS_1MHZ_SEND),
            RxTx::GeosTwoMhz | RxTx::WheelsTwoMhz => both(T::GEOS_2MHZ_GET, T::GEOS_2MHZ_SEND),
            RxTx::Geos1581V21 => both(T::GEOS_2MHZ_GET, T::GEOS_1581_21_SEND),
            RxTx::WheelsOneMhz => both(T::WHEELS_1MHZ_GET, T::WHEELS_1MHZ_SEND),
            RxTx::Wheels44D1541 => both(T::WHEELS44_1MHZ_GET, T::WHEELS_1MHZ_SEND),
            RxTx::Wheels44D1581 => both(T::WHEELS44_2MHZ_GET, T::WHEELS44_2MHZ_SEND),
            RxTx::Fc3OldFreezePal => {
                send_only(TimedLink::data_release(T::FC3_OLDFREEZE_PAL, (true, true)))
            }
            RxTx::Fc3OldFreezeNtsc => {
                send_only(TimedLink::data_release(T::FC3_OLDFREEZE_NTSC, (true, true)))
            }
            // 1.0 is started by ATN, and holds DATA after the byte
            RxTx::Hypraload10 => send_only(TimedLink::atn_release(T::HYPRALOAD, (true, false))),
            // 2.1 holds CLOCK instead
            RxTx::Hypraload21 => send_only(TimedLink::data_release(T::HYPRALOAD, (false, true))),
            _ => return None,
        })
    }
}
