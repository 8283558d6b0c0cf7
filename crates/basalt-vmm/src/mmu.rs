//! Stage-1 MMU: guest-virtual to guest-physical translation.
//!
//! [`translate`] performs the multi-level page-table walk an AArch64
//! core would do in hardware, driven entirely by the vCPU's system
//! registers:
//!
//! 1. `SCTLR_EL1.M` clear means translation is identity (the reset
//!    state).
//! 2. VA bit 63 selects the lower half (TTBR0, sized by `TCR.T0SZ`)
//!    or the upper half (TTBR1, sized by `TCR.T1SZ`); the unused top
//!    bits must be canonical for that half.
//! 3. `TCR.TG0`/`TCR.TG1` select the granule.  The two fields use
//!    different encodings.
//! 4. Descriptors are loaded from guest RAM level by level until a
//!    page descriptor yields the output address.
//!
//! Each 8-byte descriptor is decoded into a tagged [`Descriptor`]
//! before interpretation, so the walker is an exhaustive match rather
//! than a chain of bit tests.  Block descriptors (large mappings at
//! L1/L2) are a known feature gap and surface as
//! [`FaultReason::Unsupported`].

use log::trace;
use thiserror::Error;

use crate::memory::{AccessFault, GuestMemory};
use crate::vcpu::Vcpu;

/// 4 KiB translation granule.
pub const GRANULE_4K: u64 = 1 << 12;

/// 16 KiB translation granule.
pub const GRANULE_16K: u64 = 1 << 14;

/// 64 KiB translation granule.
pub const GRANULE_64K: u64 = 1 << 16;

/// log2 of the descriptor size (8 bytes per page-table entry).
const DESC_SHIFT: u32 = 3;

/// The last level of any walk.
const FINAL_LEVEL: u32 = 3;

/// Why a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// The unused top bits of the VA are not a valid tag for the
    /// selected half of the address space.
    NonCanonical,
    /// A reserved TG0/TG1 granule encoding.
    ReservedConfig,
    /// A descriptor load at a misaligned table address.
    UnalignedTable,
    /// An invalid or reserved descriptor, a descriptor load outside
    /// RAM, or a walk that ended without a page descriptor.
    InvalidDescriptor,
    /// A block descriptor.  Large mappings are not implemented yet;
    /// this fault is not guest-recoverable.
    Unsupported,
}

/// A failed stage-1 translation.
///
/// Carries the faulting virtual address and a coarse reason.  The
/// caller owns the architectural encoding: it knows the access kind
/// and current PC, and builds the ESR/FAR for the exception unit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stage-1 translation fault at {gva:#x} ({reason:?})")]
pub struct MmuFault {
    /// The virtual address that failed to translate.
    pub gva: u64,
    /// Coarse classification of the failure.
    pub reason: FaultReason,
}

impl MmuFault {
    /// Whether the guest can recover by fixing its page tables.
    /// `Unsupported` is an emulator feature gap, not a guest error.
    pub fn is_guest_recoverable(&self) -> bool {
        self.reason != FaultReason::Unsupported
    }
}

/// One 8-byte page-table entry, discriminated by its low two bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Descriptor {
    /// Bits 0b00, or the reserved 0b10 pattern: no mapping.
    Invalid,
    /// Bits 0b01: a large contiguous mapping terminating the walk.
    Block(u64),
    /// Bits 0b11 at a non-final level: base of the next table.
    Table(u64),
    /// Bits 0b11 at the final level: the mapped page.
    Page(u64),
}

impl Descriptor {
    fn decode(raw: u64, last_level: bool) -> Self {
        match raw & 0b11 {
            0b01 => Descriptor::Block(raw),
            0b11 if last_level => Descriptor::Page(raw),
            0b11 => Descriptor::Table(raw),
            _ => Descriptor::Invalid,
        }
    }
}

/// Translation granule selected by TCR_EL1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granule {
    K4,
    K16,
    K64,
}

impl Granule {
    /// Decode TCR_EL1.TG0 (bits [15:14]).
    fn from_tg0(bits: u64) -> Option<Self> {
        match bits {
            0b00 => Some(Granule::K4),
            0b01 => Some(Granule::K64),
            0b10 => Some(Granule::K16),
            _ => None,
        }
    }

    /// Decode TCR_EL1.TG1 (bits [31:30]).  The encoding differs from
    /// TG0; don't get caught out.
    fn from_tg1(bits: u64) -> Option<Self> {
        match bits {
            0b01 => Some(Granule::K16),
            0b10 => Some(Granule::K4),
            0b11 => Some(Granule::K64),
            _ => None,
        }
    }

    fn size(self) -> u64 {
        match self {
            Granule::K4 => GRANULE_4K,
            Granule::K16 => GRANULE_16K,
            Granule::K64 => GRANULE_64K,
        }
    }

    /// Bits needed to address every byte in one granule, i.e.
    /// log2 of the granule size.
    fn offset_bits(self) -> u32 {
        self.size().trailing_zeros()
    }

    /// Bits of VA consumed by one table level.  A table fills exactly
    /// one granule with 8-byte entries, so this is
    /// log2(granule / 8).
    fn index_bits(self) -> u32 {
        self.offset_bits() - DESC_SHIFT
    }
}

/// Mask covering the bits above a `va_size`-bit address space.
#[inline]
fn top_bits_mask(va_size: u32) -> u64 {
    if va_size >= 64 {
        0
    } else {
        !0u64 << va_size
    }
}

/// Translate a guest-virtual address to a guest-physical address.
///
/// With the MMU disabled this is the identity.  Otherwise the walk
/// reads descriptors from `memory` in strict level order and either
/// produces the output address or a single [`MmuFault`]; guest state
/// is never modified.
pub fn translate(vcpu: &Vcpu, memory: &GuestMemory, gva: u64) -> Result<u64, MmuFault> {
    if !vcpu.mmu_enabled() {
        return Ok(gva);
    }

    // T0SZ (bits [5:0]) and T1SZ (bits [21:16]) are 6-bit fields
    // giving the number of unused top VA bits for each half.
    let t0sz = (vcpu.tcr_el1 & 0x3F) as u32;
    let t1sz = ((vcpu.tcr_el1 >> 16) & 0x3F) as u32;

    // VA bit 63 picks the half.  For any canonical address the top
    // TxSZ bits are a sign extension of bit (63 - TxSZ), so bit 63
    // equals them all; the full tag check below catches addresses
    // that merely pretend.
    let upper_half = gva >> 63 != 0;

    let (va_size, table_root, granule) = if upper_half {
        let va_size = 64 - t1sz;
        let mask = top_bits_mask(va_size);
        if gva & mask != vcpu.ttbr1_el1 & mask {
            return Err(MmuFault {
                gva,
                reason: FaultReason::NonCanonical,
            });
        }
        let granule =
            Granule::from_tg1((vcpu.tcr_el1 >> 30) & 0b11).ok_or(MmuFault {
                gva,
                reason: FaultReason::ReservedConfig,
            })?;
        (va_size, vcpu.ttbr1_el1, granule)
    } else {
        let va_size = 64 - t0sz;
        let mask = top_bits_mask(va_size);
        if gva & mask != 0 {
            return Err(MmuFault {
                gva,
                reason: FaultReason::NonCanonical,
            });
        }
        let granule =
            Granule::from_tg0((vcpu.tcr_el1 >> 14) & 0b11).ok_or(MmuFault {
                gva,
                reason: FaultReason::ReservedConfig,
            })?;
        (va_size, vcpu.ttbr0_el1, granule)
    };

    let offset_bits = granule.offset_bits();
    let index_bits = granule.index_bits();

    // Per-level VA shifts: each level up consumes index_bits more.
    let l3_shift = offset_bits;
    let l2_shift = l3_shift + index_bits;
    let l1_shift = l2_shift + index_bits;
    let l0_shift = l1_shift + index_bits;

    // Starting level: the highest table needed to cover va_size bits.
    // 16 KiB and 64 KiB granules have no level 0.
    let start_level = match granule {
        Granule::K4 => {
            if va_size > l0_shift {
                0
            } else if va_size > l1_shift {
                1
            } else {
                2
            }
        }
        Granule::K16 | Granule::K64 => {
            if va_size > l1_shift {
                1
            } else {
                2
            }
        }
    };

    let index_mask = (1u64 << index_bits) - 1;
    let offset_mask = (1u64 << offset_bits) - 1;

    let mut table_base = table_root;
    for level in start_level..=FINAL_LEVEL {
        let shift = match level {
            0 => l0_shift,
            1 => l1_shift,
            2 => l2_shift,
            3 => l3_shift,
            _ => unreachable!("walk level out of range"),
        };
        let index = (gva >> shift) & index_mask;

        let desc_gpa = match table_base.checked_add(index << DESC_SHIFT) {
            Some(addr) => addr,
            None => {
                return Err(MmuFault {
                    gva,
                    reason: FaultReason::InvalidDescriptor,
                })
            }
        };

        let raw = memory.read_u64(desc_gpa).map_err(|fault| MmuFault {
            gva,
            reason: match fault {
                AccessFault::Unaligned { .. } => FaultReason::UnalignedTable,
                AccessFault::Boundary { .. } => FaultReason::InvalidDescriptor,
            },
        })?;

        trace!(
            target: "mmu",
            "walk L{level}: index={index} desc_gpa={desc_gpa:#x} desc={raw:#018x}",
        );

        match Descriptor::decode(raw, level == FINAL_LEVEL) {
            Descriptor::Invalid => {
                return Err(MmuFault {
                    gva,
                    reason: FaultReason::InvalidDescriptor,
                })
            }
            Descriptor::Page(desc) => {
                // Output address: the descriptor's page base with the
                // in-page offset from the VA.
                return Ok((desc & !offset_mask) | (gva & offset_mask));
            }
            Descriptor::Table(desc) => {
                table_base = desc & !offset_mask;
            }
            Descriptor::Block(_) => {
                return Err(MmuFault {
                    gva,
                    reason: FaultReason::Unsupported,
                })
            }
        }
    }

    Err(MmuFault {
        gva,
        reason: FaultReason::InvalidDescriptor,
    })
}
