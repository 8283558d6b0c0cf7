//! The VM container.
//!
//! [`Vm`] owns everything one guest machine needs: the arena backing
//! guest RAM, the [`GuestMemory`] descriptor over it, one vCPU, and
//! the MMIO registry.  Machine-specific behaviour is injected through
//! a [`MachineOps`] table selected by [`Vm::probe`], so the generic
//! core never needs to know which hardware it is pretending to be.
//!
//! Construction order matters: the arena is mapped first, RAM is
//! carved from it, then the target's `init` runs to register MMIO
//! devices and load firmware.  `destroy` runs on drop.

use log::info;
use thiserror::Error;

use crate::arena::{ArenaError, HostArena};
use crate::memory::GuestMemory;
use crate::mmio::{MmioError, MmioRegistry};
use crate::targets;
use crate::vcpu::Vcpu;

/// Default guest RAM size (128 MiB).
pub const DEFAULT_GUEST_RAM_SIZE: usize = 128 * 1024 * 1024;

/// Configuration for creating a [`Vm`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Guest RAM size in bytes.
    pub ram_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            ram_size: DEFAULT_GUEST_RAM_SIZE,
        }
    }
}

/// Errors that can occur while bringing a VM up.
#[derive(Error, Debug)]
pub enum VmError {
    /// The host could not back guest RAM.
    #[error("failed to back guest RAM: {0}")]
    Arena(#[from] ArenaError),

    /// The target's device registrations conflicted.
    #[error("MMIO registration failed: {0}")]
    Mmio(#[from] MmioError),
}

/// Supported machine targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    /// The first-generation Switch machine.
    Switch1,
    /// Reserved; probing it aborts.
    Switch2,
}

/// Machine-specific operations, one static table per target.
///
/// `init` runs once from [`Vm::probe`] and is responsible for the
/// guest memory map, firmware, and MMIO device registration.
/// `destroy` runs on VM teardown.
pub struct MachineOps {
    /// Initialize the target machine's state.
    pub init: fn(&mut Vm) -> Result<(), VmError>,
    /// Release target resources on shutdown.
    pub destroy: fn(&mut Vm),
}

/// A single virtual machine instance.
pub struct Vm {
    /// Architectural state of the emulated core.
    pub vcpu: Vcpu,
    /// Guest physical RAM, starting at guest physical address 0.
    pub memory: GuestMemory,
    /// GPA ranges owned by devices rather than RAM.
    pub mmio: MmioRegistry,
    /// Owns the bytes `memory` describes.  Declared after `memory` but
    /// only released when the whole `Vm` drops, so the descriptor can
    /// never outlive its backing.
    arena: HostArena,
    /// Target-specific operations attached by `probe`.
    ops: &'static MachineOps,
}

impl Vm {
    /// Create a VM for the requested machine target.
    ///
    /// Attaches the target's operations table and runs its `init`.
    /// Probing an unsupported target is fatal: there is no machine to
    /// fall back to.
    ///
    /// # Errors
    ///
    /// Returns [`VmError`] when RAM cannot be backed or the target's
    /// device registrations fail.
    pub fn probe(target: TargetType, config: VmConfig) -> Result<Self, VmError> {
        let ops: &'static MachineOps = match target {
            TargetType::Switch1 => &targets::switch1::SWITCH1_OPS,
            TargetType::Switch2 => panic!("only the Switch 1 target is supported"),
        };

        let mut arena = HostArena::new(config.ram_size)?;
        let memory = GuestMemory::from_arena(&mut arena);

        let mut vm = Self {
            vcpu: Vcpu::new(),
            memory,
            mmio: MmioRegistry::new(),
            arena,
            ops,
        };
        let init = vm.ops.init;
        init(&mut vm)?;

        info!(
            target: "vm",
            "VM ready: {} bytes of guest RAM, {} MMIO region(s)",
            vm.memory.size(),
            vm.mmio.len(),
        );
        Ok(vm)
    }

    /// The arena backing guest RAM.
    pub fn arena(&self) -> &HostArena {
        &self.arena
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let destroy = self.ops.destroy;
        destroy(self);
    }
}
