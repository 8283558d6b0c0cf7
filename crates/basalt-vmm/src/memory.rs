//! Guest physical RAM descriptor and typed accessors.
//!
//! [`GuestMemory`] describes one contiguous block of guest physical
//! RAM starting at guest physical address 0.  It is a *view*, not an
//! owner: the backing bytes belong to the [`HostArena`] it was carved
//! from, and the descriptor is only valid while that arena lives.
//! The VM container owns both and keeps their lifetimes in lock-step.
//!
//! Every access goes through one of eight typed accessors
//! (`read`/`write` × u8/u16/u32/u64).  Each checks that the whole
//! access range lies inside RAM and, for multi-byte widths, that the
//! address is naturally aligned.  A failed check returns an
//! [`AccessFault`] and leaves guest state untouched; the caller decides
//! whether that becomes a Data Abort.
//!
//! # Endianness
//!
//! The guest is little-endian ([`GUEST_LITTLE_ENDIAN`]).  Multi-byte
//! accessors convert between the guest byte order and the host's
//! native order in one place per width, which compiles to nothing on a
//! little-endian host and to a byte swap on a big-endian one.
//!
//! # Interior mutability
//!
//! Writes go through a raw pointer into the mapped region, so the
//! write accessors take `&self`.  The descriptor fields themselves
//! (`base`, `size`) never change after creation.

use std::ptr;

use log::info;
use thiserror::Error;

use crate::arena::HostArena;

/// The emulated machine is little-endian.  Fixed at compile time.
pub const GUEST_LITTLE_ENDIAN: bool = true;

/// Faults a guest physical access can raise.
///
/// Both are recoverable from the core's point of view: the operation
/// did not happen, nothing was mutated, and the caller chooses the
/// architectural exception to inject.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// Part of the access range `[gpa, gpa + width)` falls outside RAM.
    #[error("guest access at {gpa:#x} falls outside RAM")]
    Boundary {
        /// Guest physical address of the access.
        gpa: u64,
    },

    /// A multi-byte access whose address is not a multiple of its width.
    #[error("{width}-byte guest access at {gpa:#x} is unaligned")]
    Unaligned {
        /// Guest physical address of the access.
        gpa: u64,
        /// Access width in bytes.
        width: u32,
    },
}

/// Non-owning descriptor for the guest's physical RAM block.
pub struct GuestMemory {
    /// Host address backing guest physical address 0.
    base: *mut u8,
    /// RAM size in bytes.
    size: u64,
}

// Safety: the descriptor points into an arena mapping that the owning
// VM keeps alive for at least as long as the descriptor; accesses are
// bounds-checked against `size`.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Dedicate the arena's entire remaining capacity to guest RAM.
    ///
    /// The arena must be reserved for this purpose; after this call it
    /// has no capacity left for anything else.
    pub fn from_arena(arena: &mut HostArena) -> Self {
        let size = arena.remaining();
        assert!(size > 0, "arena has no capacity left for guest RAM");
        let base = arena.allocate(size);

        info!(
            target: "memory",
            "guest RAM: {} bytes ({} MiB) at host {:p}",
            size,
            size / (1024 * 1024),
            base,
        );
        Self {
            base,
            size: size as u64,
        }
    }

    /// RAM size in bytes.  Guest physical addresses `[0, size)` are RAM.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check boundary first, then natural alignment, like the hardware
    /// would report them.
    #[inline]
    fn check(&self, gpa: u64, width: u64) -> Result<(), AccessFault> {
        match gpa.checked_add(width) {
            Some(end) if end <= self.size => {}
            _ => return Err(AccessFault::Boundary { gpa }),
        }
        if width > 1 && gpa & (width - 1) != 0 {
            return Err(AccessFault::Unaligned {
                gpa,
                width: width as u32,
            });
        }
        Ok(())
    }

    /// Host virtual address backing `gpa`.  Caller must have validated
    /// the range via [`check`](Self::check).
    #[inline]
    fn hva(&self, gpa: u64) -> *mut u8 {
        unsafe { self.base.add(gpa as usize) }
    }

    /// Read one byte.  Byte accesses never fault on alignment.
    #[inline]
    pub fn read_u8(&self, gpa: u64) -> Result<u8, AccessFault> {
        self.check(gpa, 1)?;
        Ok(unsafe { *self.hva(gpa) })
    }

    /// Read a 16-bit value in guest byte order.
    #[inline]
    pub fn read_u16(&self, gpa: u64) -> Result<u16, AccessFault> {
        self.check(gpa, 2)?;
        let mut bytes = [0u8; 2];
        unsafe { ptr::copy_nonoverlapping(self.hva(gpa), bytes.as_mut_ptr(), 2) };
        Ok(u16::from_le_bytes(bytes))
    }

    /// Read a 32-bit value in guest byte order.
    #[inline]
    pub fn read_u32(&self, gpa: u64) -> Result<u32, AccessFault> {
        self.check(gpa, 4)?;
        let mut bytes = [0u8; 4];
        unsafe { ptr::copy_nonoverlapping(self.hva(gpa), bytes.as_mut_ptr(), 4) };
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a 64-bit value in guest byte order.
    #[inline]
    pub fn read_u64(&self, gpa: u64) -> Result<u64, AccessFault> {
        self.check(gpa, 8)?;
        let mut bytes = [0u8; 8];
        unsafe { ptr::copy_nonoverlapping(self.hva(gpa), bytes.as_mut_ptr(), 8) };
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write one byte.  Byte accesses never fault on alignment.
    #[inline]
    pub fn write_u8(&self, gpa: u64, value: u8) -> Result<(), AccessFault> {
        self.check(gpa, 1)?;
        unsafe { *self.hva(gpa) = value };
        Ok(())
    }

    /// Write a 16-bit value in guest byte order.
    #[inline]
    pub fn write_u16(&self, gpa: u64, value: u16) -> Result<(), AccessFault> {
        self.check(gpa, 2)?;
        let bytes = value.to_le_bytes();
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.hva(gpa), 2) };
        Ok(())
    }

    /// Write a 32-bit value in guest byte order.
    #[inline]
    pub fn write_u32(&self, gpa: u64, value: u32) -> Result<(), AccessFault> {
        self.check(gpa, 4)?;
        let bytes = value.to_le_bytes();
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.hva(gpa), 4) };
        Ok(())
    }

    /// Write a 64-bit value in guest byte order.
    #[inline]
    pub fn write_u64(&self, gpa: u64, value: u64) -> Result<(), AccessFault> {
        self.check(gpa, 8)?;
        let bytes = value.to_le_bytes();
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.hva(gpa), 8) };
        Ok(())
    }
}
