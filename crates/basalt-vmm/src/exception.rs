//! Synchronous exception entry to EL1.
//!
//! [`take_synchronous_exception`] performs the state transition the
//! hardware does when a synchronous exception targets EL1: it saves
//! the return state, populates the syndrome registers, and moves the
//! core into EL1h with asynchronous exceptions masked.  The whole
//! update is a plain sequence of register stores on one vCPU, so no
//! caller can observe a partial transition.

use log::debug;

use crate::vcpu::{
    Vcpu, EC_DATA_ABORT, EC_DATA_ABORT_LOWER_EL, PSTATE_A, PSTATE_EL1H, PSTATE_F, PSTATE_I,
    PSTATE_MODE_MASK, PSTATE_NZCV_MASK,
};

/// Bit position of the exception class in ESR_EL1.
const ESR_EC_SHIFT: u32 = 26;

/// ESR_EL1.IL, the instruction-length bit.  Always set: every AArch64
/// instruction is 32 bits.
const ESR_IL: u64 = 1 << 25;

/// Take a synchronous exception into EL1.
///
/// `exception_class` is the 6-bit EC for ESR_EL1 and `iss` the 25-bit
/// instruction-specific syndrome; values outside those ranges are
/// programming errors.  `faulting_address` is written to FAR_EL1 only
/// for Data Aborts; pass 0 for other classes.
///
/// The program counter is deliberately left unchanged: branching to
/// `VBAR_EL1` plus the vector offset only makes sense once the
/// instruction decoder can execute the handler, so the redirect is
/// deferred until then.
pub fn take_synchronous_exception(
    vcpu: &mut Vcpu,
    exception_class: u8,
    iss: u32,
    faulting_address: u64,
) {
    assert_eq!(
        exception_class & !0x3F,
        0,
        "exception class is a 6-bit field"
    );
    assert_eq!(iss & !0x01FF_FFFF, 0, "ISS is a 25-bit field");

    // Return state: the faulting instruction's address and a full
    // PSTATE snapshot for ERET.
    vcpu.elr_el1 = vcpu.pc;
    vcpu.spsr_el1 = u64::from(vcpu.pstate);

    vcpu.esr_el1 = (u64::from(exception_class) << ESR_EC_SHIFT) | ESR_IL | u64::from(iss);

    if exception_class == EC_DATA_ABORT || exception_class == EC_DATA_ABORT_LOWER_EL {
        vcpu.far_el1 = faulting_address;
    }

    // Known-safe state for the handler: condition flags cleared and
    // IRQ/FIQ/SError masked so a lesser event cannot preempt it.
    vcpu.pstate &= !PSTATE_NZCV_MASK;
    vcpu.pstate |= PSTATE_I | PSTATE_F | PSTATE_A;

    // EL1h: EL1 using SP_EL1.
    vcpu.pstate = (vcpu.pstate & !PSTATE_MODE_MASK) | PSTATE_EL1H;

    debug!(
        target: "exception",
        "synchronous exception: ec={exception_class:#04x} iss={iss:#x} elr={:#x} far={:#x}",
        vcpu.elr_el1,
        vcpu.far_el1,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcpu::{PSTATE_EL0T, PSTATE_EL1T};

    fn faulted_vcpu() -> Vcpu {
        let mut vcpu = Vcpu::new();
        vcpu.pc = 0x1000;
        vcpu.pstate = 0x6000_0000; // Z and C set, EL0t
        take_synchronous_exception(&mut vcpu, EC_DATA_ABORT, 0x7, 0x4000);
        vcpu
    }

    #[test]
    fn return_state_is_captured() {
        let vcpu = faulted_vcpu();
        assert_eq!(vcpu.elr_el1, 0x1000);
        assert_eq!(vcpu.spsr_el1, 0x6000_0000);
    }

    #[test]
    fn syndrome_encodes_class_length_and_iss() {
        let vcpu = faulted_vcpu();
        assert_eq!(vcpu.esr_el1, (0b100101 << 26) | (1 << 25) | 0x7);
    }

    #[test]
    fn data_abort_records_the_fault_address() {
        let vcpu = faulted_vcpu();
        assert_eq!(vcpu.far_el1, 0x4000);
    }

    #[test]
    fn lower_el_data_abort_also_records_the_fault_address() {
        let mut vcpu = Vcpu::new();
        take_synchronous_exception(&mut vcpu, EC_DATA_ABORT_LOWER_EL, 0, 0xABCD);
        assert_eq!(vcpu.far_el1, 0xABCD);
    }

    #[test]
    fn non_abort_classes_leave_far_untouched() {
        let mut vcpu = Vcpu::new();
        vcpu.far_el1 = 0x1234_5678;
        // EC 0b010101: SVC from AArch64.
        take_synchronous_exception(&mut vcpu, 0b010101, 0, 0xFFFF);
        assert_eq!(vcpu.far_el1, 0x1234_5678);
    }

    #[test]
    fn flags_are_cleared_and_interrupts_masked() {
        let vcpu = faulted_vcpu();
        assert_eq!(vcpu.pstate & PSTATE_NZCV_MASK, 0);
        assert_ne!(vcpu.pstate & PSTATE_F, 0);
        assert_ne!(vcpu.pstate & PSTATE_I, 0);
        assert_ne!(vcpu.pstate & PSTATE_A, 0);
    }

    #[test]
    fn core_enters_el1h() {
        let vcpu = faulted_vcpu();
        assert_eq!(vcpu.mode(), PSTATE_EL1H);
    }

    #[test]
    fn mode_is_replaced_not_merged() {
        let mut vcpu = Vcpu::new();
        vcpu.pstate = PSTATE_EL1T;
        take_synchronous_exception(&mut vcpu, EC_DATA_ABORT, 0, 0);
        assert_eq!(vcpu.mode(), PSTATE_EL1H);

        let mut vcpu = Vcpu::new();
        vcpu.pstate = PSTATE_EL0T;
        take_synchronous_exception(&mut vcpu, EC_DATA_ABORT, 0, 0);
        assert_eq!(vcpu.mode(), PSTATE_EL1H);
    }

    #[test]
    fn pc_is_not_redirected_yet() {
        let mut vcpu = Vcpu::new();
        vcpu.pc = 0x8000;
        vcpu.vbar_el1 = 0xFFFF_0000;
        take_synchronous_exception(&mut vcpu, EC_DATA_ABORT, 0, 0);
        assert_eq!(vcpu.pc, 0x8000);
    }

    #[test]
    #[should_panic(expected = "6-bit field")]
    fn oversized_exception_class_is_fatal() {
        let mut vcpu = Vcpu::new();
        take_synchronous_exception(&mut vcpu, 0x40, 0, 0);
    }

    #[test]
    #[should_panic(expected = "25-bit field")]
    fn oversized_iss_is_fatal() {
        let mut vcpu = Vcpu::new();
        take_synchronous_exception(&mut vcpu, EC_DATA_ABORT, 1 << 25, 0);
    }
}
