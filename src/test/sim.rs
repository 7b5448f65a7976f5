//! Simulated bus with a scripted host.
//!
//! The host is written as ordinary `async` code, using [`Host`].  It is not
//! run by an executor.  Instead [`SimBus`] polls every host task each time
//! the drive side touches the bus: after applying a write, and before
//! answering a read.  From the drive's point of view the host reacts
//! instantly to every change, and a host waiting on the drive costs nothing
//! until the drive next looks at the bus.
//!
//! Time is real time, from the embassy-time std driver, so drive side
//! timeouts behave as they do on hardware.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::cell::RefCell;
use core::future::{Future, poll_fn};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::rc::Rc;

use crate::bus::{BusLines, BusState, FastSerial, Line};
use crate::protocol::timed::{Start, TimedLink};

/// Line levels driven by each side, plus counters the host can wait on.
#[derive(Debug, Clone)]
pub struct Wire {
    pub host_atn: bool,
    pub host_clock: bool,
    pub host_data: bool,
    pub drive_clock: bool,
    pub drive_data: bool,
    /// Number of drive side writes so far.  `set_lines` counts once.
    pub writes: u32,
    /// Number of drive side reads so far.
    pub reads: u64,
    /// Bytes sent on the fast serial line.
    pub fast: Vec<u8>,
}

impl Wire {
    fn new() -> Self {
        Self {
            host_atn: true,
            host_clock: true,
            host_data: true,
            drive_clock: true,
            drive_data: true,
            writes: 0,
            reads: 0,
            fast: Vec::new(),
        }
    }

    pub fn atn(&self) -> bool {
        self.host_atn
    }

    pub fn clock(&self) -> bool {
        self.host_clock && self.drive_clock
    }

    pub fn data(&self) -> bool {
        self.host_data && self.drive_data
    }

    pub fn state(&self) -> BusState {
        let mut state = BusState::empty();
        state.set(BusState::ATN, self.atn());
        state.set(BusState::CLOCK, self.clock());
        state.set(BusState::DATA, self.data());
        state
    }
}

type Task = Pin<Box<dyn Future<Output = ()>>>;

struct Shared {
    wire: RefCell<Wire>,
    tasks: RefCell<Vec<Task>>,
}

/// The host side of a [`SimBus`].  Cheap to clone into host tasks.
#[derive(Clone)]
pub struct Host {
    shared: Rc<Shared>,
}

/// The drive side of the simulated bus.
pub struct SimBus {
    shared: Rc<Shared>,
}

/// Result of a host task started with [`Host::spawn_with_result`].
pub struct Outcome<T>(Rc<RefCell<Option<T>>>);

impl<T> Outcome<T> {
    pub fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }
}

impl SimBus {
    pub fn new() -> (SimBus, Host) {
        let shared = Rc::new(Shared {
            wire: RefCell::new(Wire::new()),
            tasks: RefCell::new(Vec::new()),
        });
        (
            SimBus {
                shared: shared.clone(),
            },
            Host { shared },
        )
    }

    fn run_host(&self) {
        run_tasks(&self.shared);
    }

    /// Keep polling the host until all of its tasks are done, or give up.
    pub fn finish(&mut self) {
        for _ in 0..100_000 {
            if self.shared.tasks.borrow().is_empty() {
                return;
            }
            self.run_host();
        }
    }

    /// Snapshot of the wire.
    pub fn wire(&self) -> Wire {
        self.shared.wire.borrow().clone()
    }

    /// Whether the drive has released both of its lines.
    pub fn drive_idle(&self) -> bool {
        let wire = self.shared.wire.borrow();
        wire.drive_clock && wire.drive_data
    }
}

fn run_tasks(shared: &Rc<Shared>) {
    let mut tasks = core::mem::take(&mut *shared.tasks.borrow_mut());
    let mut cx = Context::from_waker(Waker::noop());
    tasks.retain_mut(|task| task.as_mut().poll(&mut cx).is_pending());
    // Keep tasks spawned while polling.
    let mut current = shared.tasks.borrow_mut();
    tasks.append(&mut current);
    *current = tasks;
}

impl BusLines for SimBus {
    fn read(&mut self) -> BusState {
        self.run_host();
        let mut wire = self.shared.wire.borrow_mut();
        wire.reads += 1;
        wire.state()
    }

    fn set_clock(&mut self, high: bool) {
        {
            let mut wire = self.shared.wire.borrow_mut();
            wire.drive_clock = high;
            wire.writes += 1;
        }
        self.run_host();
    }

    fn set_data(&mut self, high: bool) {
        {
            let mut wire = self.shared.wire.borrow_mut();
            wire.drive_data = high;
            wire.writes += 1;
        }
        self.run_host();
    }

    fn set_lines(&mut self, clock: bool, data: bool) {
        {
            let mut wire = self.shared.wire.borrow_mut();
            wire.drive_clock = clock;
            wire.drive_data = data;
            wire.writes += 1;
        }
        self.run_host();
    }
}

impl FastSerial for SimBus {
    fn send_fast(&mut self, byte: u8) {
        self.shared.wire.borrow_mut().fast.push(byte);
        self.run_host();
    }
}

impl Host {
    /// Start a host task.
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        self.shared.tasks.borrow_mut().push(Box::pin(task));
    }

    /// Start a host task whose result the test wants to see.
    pub fn spawn_with_result<T: 'static>(
        &self,
        task: impl Future<Output = T> + 'static,
    ) -> Outcome<T> {
        let slot = Rc::new(RefCell::new(None));
        let result = slot.clone();
        self.spawn(async move {
            let value = task.await;
            *result.borrow_mut() = Some(value);
        });
        Outcome(slot)
    }

    pub fn set_atn(&self, high: bool) {
        self.shared.wire.borrow_mut().host_atn = high;
    }

    pub fn set_clock(&self, high: bool) {
        self.shared.wire.borrow_mut().host_clock = high;
    }

    pub fn set_data(&self, high: bool) {
        self.shared.wire.borrow_mut().host_data = high;
    }

    /// Drive a line from the host side.
    pub fn set_line(&self, line: Line, high: bool) {
        match line {
            Line::Atn => self.set_atn(high),
            Line::Clock => self.set_clock(high),
            Line::Data => self.set_data(high),
        }
    }

    pub fn atn(&self) -> bool {
        self.shared.wire.borrow().atn()
    }

    pub fn clock(&self) -> bool {
        self.shared.wire.borrow().clock()
    }

    pub fn data(&self) -> bool {
        self.shared.wire.borrow().data()
    }

    /// Level of a line as the host sees it.
    pub fn line(&self, line: Line) -> bool {
        match line {
            Line::Atn => self.atn(),
            Line::Clock => self.clock(),
            Line::Data => self.data(),
        }
    }

    /// Level the drive is driving a line to.
    pub fn drive_line(&self, line: Line) -> bool {
        let wire = self.shared.wire.borrow();
        match line {
            Line::Atn => true,
            Line::Clock => wire.drive_clock,
            Line::Data => wire.drive_data,
        }
    }

    pub fn writes(&self) -> u32 {
        self.shared.wire.borrow().writes
    }

    pub fn reads(&self) -> u64 {
        self.shared.wire.borrow().reads
    }

    /// Number of bytes received on the fast serial line so far.
    pub fn fast_count(&self) -> usize {
        self.shared.wire.borrow().fast.len()
    }

    /// Everything received on the fast serial line.
    pub fn fast_bytes(&self) -> Vec<u8> {
        self.shared.wire.borrow().fast.clone()
    }

    /// Wait until `done` is true of the wire.
    pub fn until<'a>(&'a self, done: impl Fn(&Wire) -> bool + 'a) -> impl Future<Output = ()> + 'a {
        poll_fn(move |_| {
            if done(&self.shared.wire.borrow()) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Wait until the drive has made at least one more write.
    pub async fn next_write(&self) {
        let writes = self.writes();
        self.until(move |w| w.writes > writes).await;
    }

    /// Let the drive touch the bus `polls` more times.
    pub async fn idle(&self, polls: u32) {
        let mut remaining = polls;
        poll_fn(move |_| {
            if remaining == 0 {
                Poll::Ready(())
            } else {
                remaining -= 1;
                Poll::Pending
            }
        })
        .await;
    }

    /// Give the drive the reference edge for a timed byte.  Returns once the
    /// edge is on the bus.
    async fn timed_start(&self, link: &TimedLink) {
        let writes = self.writes();
        match link.start {
            Start::DataRelease => {
                self.set_data(false);
                self.until(move |w| w.writes > writes && w.drive_clock).await;
                self.set_data(true);
            }
            Start::AtnRelease => {
                self.set_atn(false);
                self.until(move |w| w.writes > writes && w.drive_data).await;
                self.set_atn(true);
            }
        }
    }

    /// Host side of [`TimedLink::send`].
    pub async fn receive_timed(&self, link: TimedLink) -> u8 {
        self.timed_start(&link).await;
        let mut raw = 0u8;
        for index in 0..4 {
            self.next_write().await;
            let wire = self.shared.wire.borrow().clone();
            let mut state = BusState::empty();
            state.set(BusState::CLOCK, wire.drive_clock);
            state.set(BusState::DATA, wire.drive_data);
            raw |= link.pairs.bits(state, index);
        }
        // Exit levels
        self.next_write().await;
        raw ^ link.pairs.eor
    }

    /// Host side of [`TimedLink::receive`].
    pub async fn send_timed(&self, link: TimedLink, byte: u8) {
        self.until(|w| !w.drive_clock).await;
        self.timed_start(&link).await;
        let mut reads = self.reads();
        for index in 0..4 {
            self.until(move |w| w.reads > reads).await;
            let (clock, data) = link.pairs.pair(byte, index);
            self.set_clock(clock);
            self.set_data(data);
            reads = self.reads();
        }
        self.next_write().await;
        self.set_clock(true);
        self.set_data(true);
    }

    /// Host side of [`clocked_write_byte`](crate::protocol::clocked_write_byte):
    /// clock four pairs with ATN and return them as sent, CLOCK in the
    /// lower bit of each pair.  Ends with ATN released.
    pub async fn receive_atn_pairs(&self) -> u8 {
        let mut out = 0u8;
        for ii in 0..4 {
            if ii == 0 {
                // ATN may already be high, and the first pair out before
                // we get here.  Either way the drive looks at ATN once and
                // writes once before it waits for ATN to go low.
                self.set_atn(true);
                self.idle(3).await;
            } else {
                let writes = self.writes();
                self.set_atn(ii % 2 == 0);
                self.until(move |w| w.writes > writes).await;
                self.idle(2).await;
            }
            let clock = self.clock();
            let data = self.data();
            out |= (u8::from(clock) | (u8::from(data) << 1)) << (ii * 2);
        }
        self.set_atn(true);
        out
    }

    /// Send a byte one bit per edge of `clock`, LSB first, with inverted
    /// data on `data`.  Both lines start and end released.
    pub async fn send_clocked(self, byte: u8, clock: Line, data: Line) {
        let mut level = self.line(clock);
        for bit in 0..8 {
            self.set_line(data, byte & (1 << bit) == 0);
            self.idle(1).await;
            level = !level;
            self.set_line(clock, level);
            // Time for a drive that only just saw the edge to sample it
            self.idle(8).await;
        }
        self.set_line(data, true);
        self.set_line(clock, true);
    }

    /// Host side of [`clocked_send_byte`](crate::protocol::clocked_send_byte):
    /// make an edge on `clock` for each bit and read the drive's `data`
    /// once it has answered.
    pub async fn receive_clocked(self, clock: Line, data: Line) -> u8 {
        let mut level = true;
        let mut byte = 0u8;
        for bit in 0..8 {
            let writes = self.writes();
            level = !level;
            self.set_line(clock, level);
            self.until(move |w| w.writes > writes).await;
            if !self.drive_line(data) {
                byte |= 1 << bit;
            }
        }
        self.set_line(clock, true);
        byte
    }
}

/// Undo the bit shuffle of an encoded
/// [`clocked_write_byte`](crate::protocol::clocked_write_byte).
pub fn unshuffle(raw: u8, table: &[u8; 8]) -> u8 {
    table
        .iter()
        .enumerate()
        .filter(|(bit, _)| raw & (1 << bit) != 0)
        .fold(0, |byte, (_, mask)| byte | mask)
}
