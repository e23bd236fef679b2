//! The CPU Container: a CPU package groups one or more cores that share a
//! single address space, cache-coherence domain, and IVT. The machine owns one
//! container per configured CPU.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use duckyvm_cache::Coherence;
use duckyvm_error::Result;
use duckyvm_memory::MemoryController;
use duckyvm_types::PhysAddr;

use crate::core::{CpuCore, CpuCoreConfig, VirtualInterruptTable};
use crate::mmu::Mmu;

pub struct CpuContainer {
    pub id: usize,
    cores: Vec<CpuCore>,
}

impl CpuContainer {
    /// Build a container of `core_count` cores sharing one `MemoryController`,
    /// one coherence domain, and one virtual interrupt table.
    pub fn new(
        id: usize,
        core_count: usize,
        mem: Rc<RefCell<MemoryController>>,
        pt_address: PhysAddr,
        paging_enabled: bool,
        virtual_interrupts: VirtualInterruptTable,
        config: CpuCoreConfig,
    ) -> CpuContainer {
        let coherence = Rc::new(Coherence::new());
        let mut cores = Vec::with_capacity(core_count);
        for core_id in 0..core_count {
            let mmu = Mmu::new(mem.clone(), pt_address, paging_enabled);
            let core = CpuCore::new(
                core_id,
                id,
                mmu,
                coherence.clone(),
                virtual_interrupts.clone(),
                config.clone(),
            );
            cores.push(core);
        }
        CpuContainer { id, cores }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn core(&self, idx: usize) -> &CpuCore {
        &self.cores[idx]
    }

    pub fn core_mut(&mut self, idx: usize) -> &mut CpuCore {
        &mut self.cores[idx]
    }

    pub fn cores(&self) -> &[CpuCore] {
        &self.cores
    }

    /// Boot every core at the same entry point, each with its own stack
    /// starting `stack_stride` bytes below the previous one.
    pub fn boot_all(&mut self, ip: u32, sp: u32, stack_stride: u32) {
        for (i, core) in self.cores.iter_mut().enumerate() {
            core.boot(ip, sp.wrapping_sub(stack_stride * i as u32));
        }
    }

    /// Run one fetch/execute step on every core that is currently runnable.
    /// Returns the exit code of any core that halted abnormally this tick.
    pub fn step_all(&mut self) -> Vec<(usize, Result<()>)> {
        let mut faults = Vec::new();
        for core in self.cores.iter_mut() {
            if !core.runnable() {
                continue;
            }
            if let Err(e) = core.step() {
                faults.push((core.id, Err(e)));
            }
        }
        faults
    }

    pub fn any_alive(&self) -> bool {
        self.cores.iter().any(|c| c.is_alive())
    }

    pub fn deliver_hardware_irq(&mut self, core_idx: usize, index: u32) -> Result<()> {
        self.cores[core_idx].deliver_hardware_irq(index)
    }
}

/// Per-container virtual interrupt tables are shared with every core; the
/// machine builds one of these before constructing any container.
pub fn new_virtual_interrupt_table() -> VirtualInterruptTable {
    Rc::new(RefCell::new(HashMap::new()))
}
