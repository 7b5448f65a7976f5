//! Clocked byte transfers, where one line is the clock and the other line,
//! or pair of lines, carries the data.  The clock is always driven by the
//! host, so none of these need precise timing on our side, only a quick
//! reaction to each edge.
//!
//! All functions here block, and should be called inside
//! [`BusLines::critical`] when the host's timing is tight.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use crate::bus::{BusLines, Line};
use crate::util::time::{Deadline, Timeout, iec_delay, poll_until};

/// Wait for the host to pull ATN low.  `timeout_ms` of 0 waits forever.
pub fn wait_atn_low<B: BusLines>(bus: &mut B, timeout_ms: u32) -> Result<(), Timeout> {
    poll_until(|| !bus.atn(), Deadline::from_ms(timeout_ms))
}

/// Wait for the host to release ATN.  No timeout, the host always releases
/// ATN promptly once it has pulled it.
pub fn wait_atn_high<B: BusLines>(bus: &mut B) {
    let _ = poll_until(|| bus.atn(), Deadline::never());
}

/// Write a byte, LSB first, two bits at a time on CLOCK and DATA, with ATN
/// as the clock.
///
/// The first and third bit pairs go out once ATN is high, the second and
/// fourth once ATN is low.  Only the falling ATN edge is subject to
/// `timeout_ms` (0 waits forever).  On return the final pair is on the bus
/// but hasn't been acknowledged yet, so the caller should wait for ATN to be
/// released before changing the lines.
///
/// `encoding`, if provided, shuffles the bits: output bit `n` of the byte
/// (counting in transfer order, CLOCK before DATA) is set if the byte has
/// any of the bits in `encoding[n]` set.
pub fn clocked_write_byte<B: BusLines>(
    bus: &mut B,
    byte: u8,
    encoding: Option<&[u8; 8]>,
    timeout_ms: u32,
) -> Result<(), Timeout> {
    let mut remaining = byte;

    for ii in (0..8).step_by(2) {
        let (clock, data) = match encoding {
            Some(table) => (byte & table[ii] != 0, byte & table[ii + 1] != 0),
            None => {
                let pair = (remaining & 0x01 != 0, remaining & 0x02 != 0);
                remaining >>= 2;
                pair
            }
        };

        if ii & 2 != 0 {
            wait_atn_low(bus, timeout_ms)?;
        } else {
            wait_atn_high(bus);
        }

        bus.set_lines(clock, data);
    }

    Ok(())
}

/// Read a byte from `data`, sampled after each edge of `clock`.
///
/// Both clock edges carry a bit, LSB first, and the bits are inverted (a low
/// line is a 1).  The transfer starts with the next transition of `clock`,
/// so the caller must make sure the line is in its idle state first.
/// `timeout_ms`, if not 0, applies to each edge separately.
pub fn clocked_read_byte<B: BusLines>(
    bus: &mut B,
    clock: Line,
    data: Line,
    timeout_ms: u32,
) -> Result<u8, Timeout> {
    read_bits(bus, clock, data, timeout_ms, false)
}

/// As [`clocked_read_byte`], for a caller that has already seen the first
/// edge of `clock`, typically while waiting for the host without blocking.
pub fn clocked_read_after_edge<B: BusLines>(
    bus: &mut B,
    clock: Line,
    data: Line,
    timeout_ms: u32,
) -> Result<u8, Timeout> {
    read_bits(bus, clock, data, timeout_ms, true)
}

/// Write a byte on `data`, one bit after each edge of `clock`, LSB first
/// and inverted, the mirror image of [`clocked_read_byte`].  `clock` idles
/// high, so the first bit follows a falling edge, and the host samples each
/// bit before making the next edge.  `timeout_ms`, if not 0, applies to
/// each edge separately.
pub fn clocked_send_byte<B: BusLines>(
    bus: &mut B,
    byte: u8,
    clock: Line,
    data: Line,
    timeout_ms: u32,
) -> Result<(), Timeout> {
    for bit in 0..8 {
        let level = bit % 2 == 1;
        poll_until(|| bus.line(clock) == level, Deadline::from_ms(timeout_ms))?;
        bus.set_line(data, byte & (1 << bit) == 0);
    }
    Ok(())
}

fn read_bits<B: BusLines>(
    bus: &mut B,
    clock: Line,
    data: Line,
    timeout_ms: u32,
    seen_first: bool,
) -> Result<u8, Timeout> {
    let mut level = bus.line(clock);
    if seen_first {
        level = !level;
    }
    let mut byte = 0u8;

    for _ in 0..8 {
        poll_until(|| bus.line(clock) != level, Deadline::from_ms(timeout_ms))?;

        // Let the data line settle before sampling.
        iec_delay!();
        let state = bus.read();
        level = state.contains(clock.mask());

        byte >>= 1;
        if !state.contains(data.mask()) {
            byte |= 0x80;
        }
    }

    Ok(byte)
}
