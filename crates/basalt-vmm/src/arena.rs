//! Host memory arena backing guest RAM and ancillary allocations.
//!
//! [`HostArena`] reserves one contiguous anonymous mapping up front and
//! hands out bump allocations from it.  There is no per-allocation
//! free: the whole region is released at once when the arena is
//! dropped, or recycled with [`HostArena::reset`].  Linear allocation
//! gives bounded latency and keeps everything the guest touches in one
//! physically contiguous host range.
//!
//! The entire region is filled with [`POISON_BYTE`] at creation and on
//! reset, so a read of memory that was never written shows an
//! unmistakable `0xAA` pattern instead of stale host data.

use std::io;
use std::ptr;
use std::slice;

use log::debug;
use thiserror::Error;

/// Fill byte for freshly mapped and reset arena memory.
pub const POISON_BYTE: u8 = 0xAA;

/// Errors that can occur while backing an arena with host memory.
#[derive(Error, Debug)]
pub enum ArenaError {
    /// The OS could not provide the requested mapping.
    #[error("failed to reserve {capacity} bytes of host memory: {source}")]
    ResourceExhausted {
        /// Requested arena capacity in bytes.
        capacity: usize,
        /// The underlying `mmap` error.
        source: io::Error,
    },
}

/// A fixed-capacity linear allocator over one anonymous mapping.
///
/// The arena owns its mapping.  Allocations are raw views into the
/// region and remain valid until the arena is reset or dropped; callers
/// must not hold them past either point.  The base address is stable
/// for the arena's whole lifetime, so moving the `HostArena` value
/// itself does not invalidate outstanding views.
pub struct HostArena {
    /// Base of the mapping, page-aligned by the OS.
    base: *mut u8,
    /// Total bytes reserved at creation.  Immutable afterwards.
    capacity: usize,
    /// High-water mark of bump allocation.
    size: usize,
}

// Safety: the arena exclusively owns its anonymous mapping.
unsafe impl Send for HostArena {}

impl HostArena {
    /// Reserve `capacity` bytes of read-write anonymous memory and
    /// poison them.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::ResourceExhausted`] when the OS cannot
    /// back the region.
    pub fn new(capacity: usize) -> Result<Self, ArenaError> {
        assert!(capacity > 0, "arena capacity must be non-zero");

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ArenaError::ResourceExhausted {
                capacity,
                source: io::Error::last_os_error(),
            });
        }

        let base = base.cast::<u8>();
        unsafe { ptr::write_bytes(base, POISON_BYTE, capacity) };

        debug!(target: "arena", "mapped {capacity} byte arena at {base:p}");
        Ok(Self {
            base,
            capacity,
            size: 0,
        })
    }

    /// Claim `len` fresh bytes from the arena.
    ///
    /// No alignment is guaranteed beyond that of the mapping itself;
    /// callers needing alignment pad `len` themselves.  Exhausting the
    /// arena is a configuration error, not a guest-recoverable fault,
    /// and aborts the process.
    pub fn allocate(&mut self, len: usize) -> *mut u8 {
        let end = self
            .size
            .checked_add(len)
            .expect("arena allocation size overflow — this is a bug");
        assert!(
            end <= self.capacity,
            "arena exhausted: {} + {} exceeds capacity {}",
            self.size,
            len,
            self.capacity,
        );

        let view = unsafe { self.base.add(self.size) };
        self.size = end;
        view
    }

    /// Discard every allocation and repoison the whole region.
    pub fn reset(&mut self) {
        self.size = 0;
        unsafe { ptr::write_bytes(self.base, POISON_BYTE, self.capacity) };
    }

    /// Bytes claimed so far.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total bytes reserved at creation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available for allocation.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.size
    }

    /// View the entire backing region.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base, self.capacity) }
    }
}

impl Drop for HostArena {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.cast::<libc::c_void>(), self.capacity) };
        assert_eq!(rc, 0, "failed to unmap arena memory — this is a bug");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_arena_is_empty_and_poisoned() {
        let arena = HostArena::new(4096).unwrap();
        assert_eq!(arena.size(), 0);
        assert_eq!(arena.capacity(), 4096);
        assert!(arena.as_slice().iter().all(|&b| b == POISON_BYTE));
    }

    #[test]
    fn allocate_bumps_size_exactly() {
        let mut arena = HostArena::new(4096).unwrap();
        arena.allocate(100);
        assert_eq!(arena.size(), 100);
        arena.allocate(28);
        assert_eq!(arena.size(), 128);
        assert_eq!(arena.remaining(), 4096 - 128);
    }

    #[test]
    fn consecutive_allocations_are_disjoint_and_contiguous() {
        let mut arena = HostArena::new(4096).unwrap();
        let a = arena.allocate(64);
        let b = arena.allocate(32);
        assert_eq!(unsafe { a.add(64) }, b);
    }

    #[test]
    fn reset_repoisons_every_byte() {
        let mut arena = HostArena::new(1024).unwrap();
        let view = arena.allocate(256);
        unsafe { ptr::write_bytes(view, 0x5B, 256) };
        assert!(arena.as_slice()[..256].iter().all(|&b| b == 0x5B));

        arena.reset();
        assert_eq!(arena.size(), 0);
        assert!(arena.as_slice().iter().all(|&b| b == POISON_BYTE));
    }

    #[test]
    #[should_panic(expected = "arena exhausted")]
    fn allocating_past_capacity_is_fatal() {
        let mut arena = HostArena::new(64).unwrap();
        arena.allocate(65);
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn zero_capacity_is_rejected() {
        let _ = HostArena::new(0);
    }
}
