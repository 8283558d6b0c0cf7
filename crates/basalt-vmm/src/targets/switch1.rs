//! Switch 1 machine bootstrap.
//!
//! Registers the hardware the first-generation machine exposes to the
//! core.  Today that is a single UART register window used for early
//! boot output; the rest of the memory map lands here as the machine
//! bring-up progresses.

use log::{info, trace};

use crate::mmio::{DeviceError, MmioHandler, MmioRange};
use crate::vm::{MachineOps, Vm, VmError};

/// Base of the UART-A register window.
pub const UART_A_BASE: u64 = 0x7000_6000;

/// Size of one UART register window in bytes.
pub const UART_A_SIZE: u64 = 0x40;

/// Transmit holding register offset (write).
const UART_THR: u64 = 0x00;

/// Line status register offset (read).
const UART_LSR: u64 = 0x14;

/// LSR: transmit holding register empty.
const UART_LSR_THRE: u8 = 1 << 5;

/// LSR: transmitter shift register empty.
const UART_LSR_TMTY: u8 = 1 << 6;

/// Operations table for the Switch 1 target.
pub static SWITCH1_OPS: MachineOps = MachineOps {
    init: s1_init,
    destroy: s1_destroy,
};

fn s1_init(vm: &mut Vm) -> Result<(), VmError> {
    info!(target: "switch1", "initializing Switch 1 virtual machine");

    vm.mmio.register(
        MmioRange::new(UART_A_BASE, UART_A_BASE + UART_A_SIZE),
        MmioHandler {
            read: Some(uart_read),
            write: Some(uart_write),
        },
    )?;

    Ok(())
}

fn s1_destroy(_vm: &mut Vm) {
    info!(target: "switch1", "tearing down Switch 1 virtual machine");
}

/// Guest reads of the UART window.  Only the line status register has
/// anything to say: the emulated transmitter is always ready.
fn uart_read(_vm: &mut Vm, gpa: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
    buf.fill(0);
    if gpa - UART_A_BASE == UART_LSR {
        buf[0] = UART_LSR_THRE | UART_LSR_TMTY;
    }
    Ok(())
}

/// Guest writes to the UART window.  Bytes stored to the transmit
/// holding register are forwarded to the log; writes to the other
/// registers (line control, baud divisor) are accepted and ignored.
fn uart_write(_vm: &mut Vm, gpa: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
    if gpa - UART_A_BASE == UART_THR {
        for &byte in buf.iter() {
            let shown = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            trace!(target: "switch1", "uart tx: {byte:#04x} '{shown}'");
        }
    }
    Ok(())
}
