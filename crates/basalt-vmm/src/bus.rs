//! The guest access façade.
//!
//! Every memory or device access an instruction makes goes through
//! exactly one path: translate the virtual address, then classify the
//! physical address as RAM or MMIO and perform the access.
//!
//! ```text
//! gva ── mmu::translate ──> gpa ──┬── [0, ram) ──> GuestMemory
//!                                 └── otherwise ──> MmioRegistry
//! ```
//!
//! All failures surface as one [`AccessError`].  The façade does not
//! inject exceptions itself: only the caller knows the current PC and
//! whether the access was a load, store, or fetch, so it picks the
//! exception class and calls the exception unit.

use thiserror::Error;

use crate::exception::take_synchronous_exception;
use crate::memory::AccessFault;
use crate::mmio::{self, DeviceError, MmioError};
use crate::mmu::{self, MmuFault};
use crate::vcpu::EC_DATA_ABORT;
use crate::vm::Vm;

// ─── Data Abort syndrome encoding ────────────────────────────────────
//
// DFSC (Data Fault Status Code) values for ISS bits [5:0], used when
// reporting an access failure to the guest as a Data Abort.

/// DFSC: translation fault, level 0.  Used when no stage-1 mapping or
/// backing exists at all.
pub const DFSC_TRANSLATION_FAULT_L0: u32 = 0b000100;

/// DFSC: alignment fault.
pub const DFSC_ALIGNMENT_FAULT: u32 = 0b100001;

/// DFSC: permission fault, level 3.
pub const DFSC_PERMISSION_FAULT_L3: u32 = 0b001111;

/// DFSC: synchronous external abort.  Used when a device handler
/// fails the access itself.
pub const DFSC_SYNC_EXTERNAL_ABORT: u32 = 0b010000;

/// ISS.WnR (bit 6): the abort was caused by a write, not a read.
pub const ISS_WNR: u32 = 1 << 6;

/// Any failure of a guest access through the façade.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// Stage-1 translation failed.
    #[error(transparent)]
    Mmu(#[from] MmuFault),

    /// The access hit RAM but was out of bounds or misaligned.
    #[error(transparent)]
    Ram(#[from] AccessFault),

    /// The physical address is neither RAM nor a registered device.
    #[error("no RAM or device backs guest physical address {gpa:#x}")]
    Translation {
        /// The orphaned guest physical address.
        gpa: u64,
    },

    /// A device owns the address but denies this direction of access.
    #[error("device at {gpa:#x} denies the access")]
    Permission {
        /// The guest physical address of the denied access.
        gpa: u64,
    },

    /// The device handler itself failed.
    #[error("device fault: {0}")]
    Device(#[from] DeviceError),
}

impl AccessError {
    /// The ISS encoding for reporting this failure as a Data Abort.
    ///
    /// The access kind is not recoverable from the error itself, so
    /// the caller supplies `is_write` for the WnR bit.
    pub fn data_abort_iss(&self, is_write: bool) -> u32 {
        let dfsc = match self {
            AccessError::Ram(AccessFault::Unaligned { .. }) => DFSC_ALIGNMENT_FAULT,
            AccessError::Ram(AccessFault::Boundary { .. }) => DFSC_TRANSLATION_FAULT_L0,
            AccessError::Mmu(_) => DFSC_TRANSLATION_FAULT_L0,
            AccessError::Translation { .. } => DFSC_TRANSLATION_FAULT_L0,
            AccessError::Permission { .. } => DFSC_PERMISSION_FAULT_L3,
            AccessError::Device(_) => DFSC_SYNC_EXTERNAL_ABORT,
        };
        if is_write {
            dfsc | ISS_WNR
        } else {
            dfsc
        }
    }

    /// Whether the guest can recover by fixing its own state.  A walk
    /// that hit a block descriptor is an emulator feature gap and must
    /// not be fed back to the guest as an ordinary abort.
    pub fn is_guest_recoverable(&self) -> bool {
        match self {
            AccessError::Mmu(fault) => fault.is_guest_recoverable(),
            _ => true,
        }
    }
}

fn from_dispatch(err: MmioError) -> AccessError {
    match err {
        MmioError::NotHandled { gpa } => AccessError::Translation { gpa },
        MmioError::AccessDenied { gpa } => AccessError::Permission { gpa },
        MmioError::Device(err) => AccessError::Device(err),
        MmioError::AddressOverlap { .. } => {
            unreachable!("dispatch cannot report registration errors")
        }
    }
}

impl Vm {
    /// Read one byte at a guest virtual address.
    pub fn read_u8(&mut self, gva: u64) -> Result<u8, AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.read_u8(gpa)?);
        }
        Ok(self.mmio_read::<1>(gpa)?[0])
    }

    /// Read a 16-bit value at a guest virtual address.
    pub fn read_u16(&mut self, gva: u64) -> Result<u16, AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.read_u16(gpa)?);
        }
        Ok(u16::from_le_bytes(self.mmio_read::<2>(gpa)?))
    }

    /// Read a 32-bit value at a guest virtual address.
    pub fn read_u32(&mut self, gva: u64) -> Result<u32, AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.read_u32(gpa)?);
        }
        Ok(u32::from_le_bytes(self.mmio_read::<4>(gpa)?))
    }

    /// Read a 64-bit value at a guest virtual address.
    pub fn read_u64(&mut self, gva: u64) -> Result<u64, AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.read_u64(gpa)?);
        }
        Ok(u64::from_le_bytes(self.mmio_read::<8>(gpa)?))
    }

    /// Write one byte at a guest virtual address.
    pub fn write_u8(&mut self, gva: u64, value: u8) -> Result<(), AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.write_u8(gpa, value)?);
        }
        self.mmio_write(gpa, &mut [value])
    }

    /// Write a 16-bit value at a guest virtual address.
    pub fn write_u16(&mut self, gva: u64, value: u16) -> Result<(), AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.write_u16(gpa, value)?);
        }
        self.mmio_write(gpa, &mut value.to_le_bytes())
    }

    /// Write a 32-bit value at a guest virtual address.
    pub fn write_u32(&mut self, gva: u64, value: u32) -> Result<(), AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.write_u32(gpa, value)?);
        }
        self.mmio_write(gpa, &mut value.to_le_bytes())
    }

    /// Write a 64-bit value at a guest virtual address.
    pub fn write_u64(&mut self, gva: u64, value: u64) -> Result<(), AccessError> {
        let gpa = mmu::translate(&self.vcpu, &self.memory, gva)?;
        if gpa < self.memory.size() {
            return Ok(self.memory.write_u64(gpa, value)?);
        }
        self.mmio_write(gpa, &mut value.to_le_bytes())
    }

    /// Report a failed access to the guest as a Data Abort.
    ///
    /// Builds the ISS from the error and enters EL1 with FAR set to
    /// the faulting virtual address.  Feeding an unrecoverable fault
    /// (a block-descriptor walk) back to the guest is a programming
    /// error.
    pub fn take_data_abort(&mut self, err: &AccessError, gva: u64, is_write: bool) {
        assert!(
            err.is_guest_recoverable(),
            "unrecoverable fault must not be injected into the guest: {err}",
        );
        let iss = err.data_abort_iss(is_write);
        take_synchronous_exception(&mut self.vcpu, EC_DATA_ABORT, iss, gva);
    }

    /// Device read of `N` bytes, in guest byte order.
    fn mmio_read<const N: usize>(&mut self, gpa: u64) -> Result<[u8; N], AccessError> {
        let mut buf = [0u8; N];
        mmio::dispatch_read(self, gpa, &mut buf).map_err(from_dispatch)?;
        Ok(buf)
    }

    /// Device write of the bytes the guest stored, in guest byte order.
    fn mmio_write(&mut self, gpa: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        mmio::dispatch_write(self, gpa, buf).map_err(from_dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::{MmioHandler, MmioRange};
    use crate::mmu::FaultReason;
    use crate::vcpu::SCTLR_M;
    use crate::vm::{TargetType, VmConfig};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// RAM covers [0, 0x1000); everything above is device space.
    fn vm() -> Vm {
        Vm::probe(TargetType::Switch1, VmConfig { ram_size: 0x1000 }).unwrap()
    }

    // ─── RAM path ────────────────────────────────────────────────────

    #[test]
    fn ram_round_trip_through_the_facade() {
        let mut vm = vm();
        vm.write_u32(0x100, 0xDEAD_BEEF).unwrap();
        assert_eq!(vm.read_u32(0x100).unwrap(), 0xDEAD_BEEF);
        vm.write_u64(0x108, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(vm.read_u64(0x108).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn ram_faults_propagate() {
        let mut vm = vm();
        assert_eq!(
            vm.write_u32(0x102, 0),
            Err(AccessError::Ram(AccessFault::Unaligned {
                gpa: 0x102,
                width: 4
            }))
        );
    }

    // ─── MMIO path ───────────────────────────────────────────────────

    static LAST_GPA: AtomicU64 = AtomicU64::new(0);
    static LAST_VALUE: AtomicU64 = AtomicU64::new(0);

    fn recording_write(
        _vm: &mut Vm,
        gpa: u64,
        buf: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mut raw = [0u8; 8];
        raw[..buf.len()].copy_from_slice(buf);
        LAST_GPA.store(gpa, Ordering::SeqCst);
        LAST_VALUE.store(u64::from_le_bytes(raw), Ordering::SeqCst);
        Ok(())
    }

    fn constant_read(_vm: &mut Vm, _gpa: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        buf.copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes()[..buf.len()]);
        Ok(())
    }

    #[test]
    fn device_write_reaches_the_handler_not_ram() {
        let mut vm = vm();
        vm.mmio
            .register(
                MmioRange::new(0x9000, 0x9010),
                MmioHandler {
                    read: None,
                    write: Some(recording_write),
                },
            )
            .unwrap();

        vm.write_u32(0x9004, 0xCAFE).unwrap();
        assert_eq!(LAST_GPA.load(Ordering::SeqCst), 0x9004);
        assert_eq!(LAST_VALUE.load(Ordering::SeqCst), 0xCAFE);
    }

    #[test]
    fn device_read_returns_the_handler_bytes() {
        let mut vm = vm();
        vm.mmio
            .register(
                MmioRange::new(0xA000, 0xA010),
                MmioHandler {
                    read: Some(constant_read),
                    write: None,
                },
            )
            .unwrap();

        assert_eq!(vm.read_u32(0xA000).unwrap(), 0x5566_7788);
        assert_eq!(vm.read_u16(0xA000).unwrap(), 0x7788);
    }

    #[test]
    fn unbacked_address_is_a_translation_fault() {
        let mut vm = vm();
        assert_eq!(
            vm.write_u32(0x2000, 0),
            Err(AccessError::Translation { gpa: 0x2000 })
        );
        assert_eq!(
            vm.read_u8(0x2000),
            Err(AccessError::Translation { gpa: 0x2000 })
        );
    }

    #[test]
    fn denied_direction_is_a_permission_fault() {
        let mut vm = vm();
        vm.mmio
            .register(
                MmioRange::new(0xB000, 0xB010),
                MmioHandler {
                    read: Some(constant_read),
                    write: None,
                },
            )
            .unwrap();

        assert_eq!(
            vm.write_u16(0xB000, 1),
            Err(AccessError::Permission { gpa: 0xB000 })
        );
    }

    // ─── Translated path ─────────────────────────────────────────────

    #[test]
    fn translated_write_lands_at_the_mapped_page() {
        // 64 KiB of RAM so page tables and the target page fit.
        let mut vm = Vm::probe(TargetType::Switch1, VmConfig { ram_size: 0x10000 }).unwrap();

        // Map VA 0x40_0000 onto the RAM page at 0x5000.
        vm.memory.write_u64(0x1000, 0x2000 | 0b11).unwrap();
        vm.memory.write_u64(0x2000, 0x3000 | 0b11).unwrap();
        vm.memory.write_u64(0x3000 + 2 * 8, 0x4000 | 0b11).unwrap();
        vm.memory.write_u64(0x4000, 0x5000 | 0b11).unwrap();

        vm.vcpu.tcr_el1 = 16; // T0SZ = 16, TG0 = 4 KiB
        vm.vcpu.ttbr0_el1 = 0x1000;
        vm.vcpu.sctlr_el1 |= SCTLR_M;

        vm.write_u32(0x40_0010, 0xFEED_F00D).unwrap();
        assert_eq!(vm.memory.read_u32(0x5010).unwrap(), 0xFEED_F00D);
        assert_eq!(vm.read_u32(0x40_0010).unwrap(), 0xFEED_F00D);
    }

    // ─── Data Abort routing ──────────────────────────────────────────

    #[test]
    fn alignment_faults_become_alignment_aborts() {
        let err = AccessError::Ram(AccessFault::Unaligned {
            gpa: 0x102,
            width: 4,
        });
        assert_eq!(err.data_abort_iss(false), DFSC_ALIGNMENT_FAULT);
        assert_eq!(err.data_abort_iss(true), DFSC_ALIGNMENT_FAULT | ISS_WNR);
    }

    #[test]
    fn unbacked_addresses_become_translation_aborts() {
        let err = AccessError::Translation { gpa: 0x2000 };
        assert_eq!(err.data_abort_iss(false), DFSC_TRANSLATION_FAULT_L0);
    }

    #[test]
    fn denied_device_access_becomes_a_permission_abort() {
        let err = AccessError::Permission { gpa: 0xB000 };
        assert_eq!(
            err.data_abort_iss(true),
            DFSC_PERMISSION_FAULT_L3 | ISS_WNR
        );
    }

    #[test]
    fn take_data_abort_enters_el1_with_syndrome() {
        let mut vm = vm();
        vm.vcpu.pc = 0x1000;

        let err = vm.write_u32(0x2000, 0).unwrap_err();
        vm.take_data_abort(&err, 0x2000, true);

        assert_eq!(vm.vcpu.elr_el1, 0x1000);
        assert_eq!(vm.vcpu.far_el1, 0x2000);
        let expected_iss = u64::from(DFSC_TRANSLATION_FAULT_L0 | ISS_WNR);
        assert_eq!(
            vm.vcpu.esr_el1,
            (u64::from(crate::vcpu::EC_DATA_ABORT) << 26) | (1 << 25) | expected_iss
        );
    }

    #[test]
    #[should_panic(expected = "unrecoverable fault")]
    fn block_descriptor_faults_must_not_reach_the_guest() {
        let mut vm = vm();
        let err = AccessError::Mmu(crate::mmu::MmuFault {
            gva: 0x40_0000,
            reason: FaultReason::Unsupported,
        });
        vm.take_data_abort(&err, 0x40_0000, false);
    }

    #[test]
    fn translation_faults_surface_through_the_facade() {
        let mut vm = vm();
        vm.vcpu.tcr_el1 = 16;
        vm.vcpu.ttbr0_el1 = 0x800; // L0 table full of poison: invalid
        vm.vcpu.sctlr_el1 |= SCTLR_M;

        match vm.read_u32(0x40_0000) {
            Err(AccessError::Mmu(fault)) => {
                assert_eq!(fault.reason, FaultReason::InvalidDescriptor)
            }
            other => panic!("expected an MMU fault, got {other:?}"),
        }
    }
}
