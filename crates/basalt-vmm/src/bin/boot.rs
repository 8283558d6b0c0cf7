//! Bring up a Switch 1 machine and exercise the execution core.
//!
//! Usage: cargo run --bin boot

use basalt_vmm::exception::take_synchronous_exception;
use basalt_vmm::logging;
use basalt_vmm::targets::switch1::UART_A_BASE;
use basalt_vmm::vcpu::{EC_DATA_ABORT, SCTLR_M};
use basalt_vmm::vm::{TargetType, Vm, VmConfig};

fn main() {
    logging::init();

    let config = VmConfig::default();
    log::info!(
        "creating Switch 1 VM with {} MiB of guest RAM",
        config.ram_size / (1024 * 1024)
    );
    let mut vm = Vm::probe(TargetType::Switch1, config).expect("failed to probe VM");

    // Flat-mapped RAM smoke test (the MMU is disabled at reset).
    vm.write_u64(0x1_0000, 0xDEAD_BEEF_CAFE_F00D)
        .expect("RAM write failed");
    let value = vm.read_u64(0x1_0000).expect("RAM read failed");
    log::info!("RAM round-trip at 0x10000: {value:#x}");

    // Early boot output through the UART device.
    for &byte in b"basalt boot\n" {
        vm.write_u8(UART_A_BASE, byte).expect("UART write failed");
    }

    // Build a minimal 4 KiB-granule table chain mapping VA 0x40_0000
    // onto the RAM page at 0x8000, then switch the MMU on.
    vm.memory.write_u64(0x5000, 0x6000 | 0b11).unwrap();
    vm.memory.write_u64(0x6000, 0x7000 | 0b11).unwrap();
    vm.memory.write_u64(0x7000 + 2 * 8, 0x4000 | 0b11).unwrap();
    vm.memory.write_u64(0x4000, 0x8000 | 0b11).unwrap();
    vm.vcpu.tcr_el1 = 16; // T0SZ = 16 (48-bit VAs), TG0 = 4 KiB
    vm.vcpu.ttbr0_el1 = 0x5000;
    vm.vcpu.sctlr_el1 |= SCTLR_M;

    vm.write_u32(0x40_0010, 0xFEED_F00D)
        .expect("translated write failed");
    log::info!(
        "translated write: VA 0x400010 landed at PA 0x8010 = {:#x}",
        vm.memory.read_u32(0x8010).expect("PA readback failed")
    );

    // Fault path: touch an address no RAM or device backs and take the
    // resulting Data Abort into EL1.
    vm.vcpu.sctlr_el1 &= !SCTLR_M;
    vm.vcpu.pc = 0x4000_0000;
    let bad_gva = 0xF000_0000u64;
    match vm.read_u32(bad_gva) {
        Ok(_) => unreachable!("access to unbacked memory must fault"),
        Err(err) => {
            log::warn!("guest access faulted: {err}");
            take_synchronous_exception(&mut vm.vcpu, EC_DATA_ABORT, 0x7, bad_gva);
            log::info!(
                "exception taken: esr={:#x} elr={:#x} far={:#x} pstate={:#x}",
                vm.vcpu.esr_el1,
                vm.vcpu.elr_el1,
                vm.vcpu.far_el1,
                vm.vcpu.pstate,
            );
        }
    }

    log::info!("boot smoke test complete");
}
