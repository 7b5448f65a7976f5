//! Sector buffer pool.
//!
//! The pool holds a fixed number of 256 byte buffers plus one reserved
//! system buffer, which the loaders use to cache a directory or BAM sector
//! for the lifetime of a session.  Buffers are handed out as [`Buffer`]
//! guards, and go back to the pool when the guard is dropped, so every exit
//! path out of a session releases what it allocated.
//!
//! The pool is normally a static, shared with the generic command layer:
//!
//! ```ignore
//! static BUFFERS: BufferPool = BufferPool::new();
//! ```

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use portable_atomic::{AtomicBool, Ordering};

use crate::constants::{NUM_BUFFERS, SECTOR_SIZE};
use crate::driver::Sector;
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

// Index of the system buffer in the slot arrays.
const SYSTEM_SLOT: usize = NUM_BUFFERS;

/// A fixed pool of sector buffers.
pub struct BufferPool {
    data: [UnsafeCell<Sector>; NUM_BUFFERS + 1],
    used: [AtomicBool; NUM_BUFFERS + 1],
}

// Access to each buffer's data is exclusive to the single Buffer guard that
// won the compare_exchange on its used flag.
unsafe impl Sync for BufferPool {}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: UnsafeCell<Sector> = UnsafeCell::new([0; SECTOR_SIZE]);
    #[allow(clippy::declare_interior_mutable_const)]
    const FREE: AtomicBool = AtomicBool::new(false);

    /// Create a pool with every buffer free.
    pub const fn new() -> Self {
        Self {
            data: [Self::EMPTY; NUM_BUFFERS + 1],
            used: [Self::FREE; NUM_BUFFERS + 1],
        }
    }

    /// Allocate a general purpose buffer, zero filled.
    pub fn alloc(&self) -> Option<Buffer<'_>> {
        (0..NUM_BUFFERS).find_map(|slot| self.claim(slot))
    }

    /// Allocate the reserved system buffer, zero filled.
    pub fn alloc_system(&self) -> Option<Buffer<'_>> {
        self.claim(SYSTEM_SLOT)
    }

    /// Number of buffers, including the system buffer, currently allocated.
    pub fn in_use(&self) -> usize {
        self.used
            .iter()
            .filter(|used| used.load(Ordering::Acquire))
            .count()
    }

    fn claim(&self, slot: usize) -> Option<Buffer<'_>> {
        if self.used[slot]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        trace!("Allocated buffer {}", slot);
        let mut buffer = Buffer { pool: self, slot };
        buffer.fill(0);
        Some(buffer)
    }

    fn release(&self, slot: usize) {
        trace!("Released buffer {}", slot);
        self.used[slot].store(false, Ordering::Release);
    }
}

/// An allocated sector buffer.  Released when dropped.
pub struct Buffer<'a> {
    pool: &'a BufferPool,
    slot: usize,
}

impl Buffer<'_> {
    /// Whether this is the reserved system buffer.
    pub fn is_system(&self) -> bool {
        self.slot == SYSTEM_SLOT
    }
}

impl Deref for Buffer<'_> {
    type Target = Sector;

    fn deref(&self) -> &Sector {
        // The used flag for this slot is owned by this guard.
        unsafe { &*self.pool.data[self.slot].get() }
    }
}

impl DerefMut for Buffer<'_> {
    fn deref_mut(&mut self) -> &mut Sector {
        // The used flag for this slot is owned by this guard.
        unsafe { &mut *self.pool.data[self.slot].get() }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_refills() {
        let pool = BufferPool::new();
        let mut held = Vec::new();
        for _ in 0..NUM_BUFFERS {
            held.push(pool.alloc().unwrap());
        }
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), NUM_BUFFERS);

        // The system buffer is not part of the general pool
        let system = pool.alloc_system().unwrap();
        assert!(system.is_system());
        assert!(pool.alloc_system().is_none());

        drop(held.pop());
        assert!(pool.alloc().is_some());
        drop(held);
        drop(system);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn buffers_come_back_zeroed() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.alloc().unwrap();
            buf[10] = 0x55;
        }
        let buf = pool.alloc().unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
