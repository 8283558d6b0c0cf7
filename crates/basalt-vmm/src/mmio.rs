//! MMIO dispatch registry.
//!
//! Guest physical accesses that fall outside RAM are routed to device
//! handlers through [`MmioRegistry`].  The registry keeps two parallel
//! sequences (a structure-of-arrays layout for cache-friendly scans):
//! the address ranges, sorted by base and pairwise disjoint, and the
//! handler pair for each range.  Dispatch is a binary search over the
//! sorted ranges, so the per-access cost is O(log R) with R in the
//! tens.
//!
//! # Lookup
//!
//! The search finds the first range whose base strictly exceeds the
//! probe address; the only possible hit is the range immediately
//! before it:
//!
//! ```text
//! Ranges:   [-- R1 --)     [---- R2 ----)      [--- R3 ---)
//! Space:    0x1000 0x1010   0x4000     0x4080   0x9000  0x9010
//!
//! Probe 0x4020: first base > 0x4020 is R3, candidate is R2,
//! 0x4000 <= 0x4020 < 0x4080, hit.
//! ```
//!
//! [`MmioError::NotHandled`] (no range covers the address) is routing
//! information: the caller should treat the access as RAM or fault.
//! [`MmioError::AccessDenied`] means a device owns the address but
//! does not serve that direction.

use thiserror::Error;

use crate::vm::Vm;

/// Hard cap on registered MMIO regions, fixed at boot time.
pub const MAX_MMIO_REGIONS: usize = 20;

/// Half-open guest physical address interval `[gpa_base, gpa_end)`.
///
/// The exclusive end keeps range and adjacency arithmetic simple:
/// two ranges touch without overlapping when one's end equals the
/// other's base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRange {
    /// First guest physical address in the region (inclusive).
    pub gpa_base: u64,
    /// One past the last guest physical address (exclusive).
    pub gpa_end: u64,
}

impl MmioRange {
    /// Build a range.  An empty or inverted interval is a programming
    /// error.
    pub fn new(gpa_base: u64, gpa_end: u64) -> Self {
        assert!(
            gpa_base < gpa_end,
            "MMIO range [{gpa_base:#x}, {gpa_end:#x}) is empty or inverted",
        );
        Self { gpa_base, gpa_end }
    }

    /// Whether `gpa` falls inside the interval.
    #[inline]
    pub fn contains(&self, gpa: u64) -> bool {
        self.gpa_base <= gpa && gpa < self.gpa_end
    }
}

/// Error returned by a device handler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The device does not implement accesses of this width.
    #[error("unsupported {0}-byte access width")]
    Width(usize),
}

/// An MMIO access callback.
///
/// For reads the handler fills `buf`; for writes `buf` holds the bytes
/// the guest stored, in guest byte order.  Width and endianness
/// semantics beyond the byte transport are the device's business.
/// Handlers must not re-enter MMIO dispatch while their own access is
/// pending.
pub type MmioHandlerFn = fn(vm: &mut Vm, gpa: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

/// Read/write callbacks for one region.
///
/// A missing callback denies that direction of access.  At least one
/// of the two must be present at registration.
#[derive(Debug, Clone, Copy)]
pub struct MmioHandler {
    /// Called for guest reads inside the region, if reads are allowed.
    pub read: Option<MmioHandlerFn>,
    /// Called for guest writes inside the region, if writes are allowed.
    pub write: Option<MmioHandlerFn>,
}

/// Errors from registration and dispatch.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioError {
    /// The new range intersects an already-registered region.
    #[error("MMIO range [{gpa_base:#x}, {gpa_end:#x}) overlaps an existing region")]
    AddressOverlap {
        /// Base of the rejected range.
        gpa_base: u64,
        /// End of the rejected range.
        gpa_end: u64,
    },

    /// No region covers the address; the caller should try RAM.
    #[error("no MMIO region covers {gpa:#x}")]
    NotHandled {
        /// The probed guest physical address.
        gpa: u64,
    },

    /// A region covers the address but has no handler for this
    /// direction.
    #[error("MMIO region covering {gpa:#x} denies this direction of access")]
    AccessDenied {
        /// The probed guest physical address.
        gpa: u64,
    },

    /// The device handler itself failed.
    #[error("device fault: {0}")]
    Device(#[from] DeviceError),
}

/// Sorted, disjoint GPA → handler map.
#[derive(Default)]
pub struct MmioRegistry {
    /// Sorted by `gpa_base`, pairwise disjoint.  Parallel to `handlers`.
    ranges: Vec<MmioRange>,
    /// Handler pair for `ranges[i]`.
    handlers: Vec<MmioHandler>,
}

impl MmioRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a region, preserving sort order and disjointness.
    ///
    /// Overlap is detected against the would-be predecessor and
    /// successor of the insertion point.  Registering a handler with
    /// neither callback, or exceeding [`MAX_MMIO_REGIONS`], is a
    /// programming error.
    ///
    /// # Errors
    ///
    /// Returns [`MmioError::AddressOverlap`] when the range intersects
    /// an existing region.
    pub fn register(&mut self, range: MmioRange, handler: MmioHandler) -> Result<(), MmioError> {
        assert!(
            handler.read.is_some() || handler.write.is_some(),
            "an MMIO handler must serve at least one direction",
        );
        assert!(
            self.ranges.len() < MAX_MMIO_REGIONS,
            "MMIO region limit ({MAX_MMIO_REGIONS}) exceeded",
        );

        let i = self.ranges.partition_point(|r| r.gpa_base < range.gpa_base);

        // Predecessor may run into us, we may run into the successor.
        if i > 0 && range.gpa_base < self.ranges[i - 1].gpa_end {
            return Err(MmioError::AddressOverlap {
                gpa_base: range.gpa_base,
                gpa_end: range.gpa_end,
            });
        }
        if i < self.ranges.len() && self.ranges[i].gpa_base < range.gpa_end {
            return Err(MmioError::AddressOverlap {
                gpa_base: range.gpa_base,
                gpa_end: range.gpa_end,
            });
        }

        self.ranges.insert(i, range);
        self.handlers.insert(i, handler);
        Ok(())
    }

    /// Binary-search for the region containing `gpa`.
    pub fn lookup(&self, gpa: u64) -> Option<usize> {
        // First range whose base strictly exceeds the probe; the only
        // candidate is its predecessor.
        let i = self.ranges.partition_point(|r| r.gpa_base <= gpa);
        if i == 0 {
            return None;
        }
        self.ranges[i - 1].contains(gpa).then_some(i - 1)
    }

    /// The registered ranges, sorted by base.
    pub fn ranges(&self) -> &[MmioRange] {
        &self.ranges
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no region has been registered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub(crate) fn handler(&self, idx: usize) -> MmioHandler {
        self.handlers[idx]
    }
}

/// Route a guest physical read to the owning device.
///
/// The handler is copied out of the registry before it runs, so it may
/// freely mutate the VM (its own device state, guest RAM) without
/// aliasing the registry.
///
/// # Errors
///
/// [`MmioError::NotHandled`] when no region covers `gpa`,
/// [`MmioError::AccessDenied`] when the region is write-only, or the
/// device's own error.
pub fn dispatch_read(vm: &mut Vm, gpa: u64, buf: &mut [u8]) -> Result<(), MmioError> {
    assert!(!buf.is_empty(), "MMIO access length must be non-zero");

    let Some(idx) = vm.mmio.lookup(gpa) else {
        return Err(MmioError::NotHandled { gpa });
    };
    match vm.mmio.handler(idx).read {
        Some(read) => {
            read(vm, gpa, buf)?;
            Ok(())
        }
        None => Err(MmioError::AccessDenied { gpa }),
    }
}

/// Route a guest physical write to the owning device.
///
/// See [`dispatch_read`]; `buf` carries the bytes the guest stored.
pub fn dispatch_write(vm: &mut Vm, gpa: u64, buf: &mut [u8]) -> Result<(), MmioError> {
    assert!(!buf.is_empty(), "MMIO access length must be non-zero");

    let Some(idx) = vm.mmio.lookup(gpa) else {
        return Err(MmioError::NotHandled { gpa });
    };
    match vm.mmio.handler(idx).write {
        Some(write) => {
            write(vm, gpa, buf)?;
            Ok(())
        }
        None => Err(MmioError::AccessDenied { gpa }),
    }
}
