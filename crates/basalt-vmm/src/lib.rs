//! Basalt VMM — the AArch64 execution core of the Basalt emulator.
//!
//! This crate implements the guest-visible machine: architectural vCPU
//! state, guest physical RAM, the stage-1 MMU, synchronous exception
//! entry, and MMIO dispatch.  Everything else (ROM loading, the
//! instruction decoder, GPU, UI) lives outside and talks to the core
//! through [`vm::Vm`] and the access façade in [`bus`].
//!
//! # Architecture
//!
//! - [`arena`] — host linear allocator backing guest RAM
//! - [`memory`] — guest physical RAM descriptor with typed accessors
//! - [`mmio`] — sorted GPA → device-handler dispatch registry
//! - [`vcpu`] — AArch64 register file and system registers
//! - [`mmu`] — stage-1 GVA → GPA page-table walker
//! - [`exception`] — synchronous exception entry to EL1
//! - [`vm`] — VM container and machine-operations table
//! - [`bus`] — single entry point for every guest access
//! - [`targets`] — machine-specific bootstrap (Switch 1)
//! - [`logging`] — module-tagged log line format

pub mod arena;
pub mod bus;
pub mod exception;
pub mod logging;
pub mod memory;
pub mod mmio;
pub mod mmu;
pub mod targets;
pub mod vcpu;
pub mod vm;
