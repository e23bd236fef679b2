//! Composition root: wires memory, CPU containers, the port/IRQ tables, and
//! the reactor into one runnable machine, grounded in `ducky.machine.Machine`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use duckyvm_cpu::container::CpuContainer;
use duckyvm_cpu::core::{CpuCoreConfig, VirtualInterruptTable};
use duckyvm_error::Result;
use duckyvm_memory::MemoryController;
use duckyvm_reactor::{Reactor, Task, TaskId};
use duckyvm_types::PhysAddr;

use crate::config::Config;
use crate::irq::IrqSourceTable;
use crate::ports::PortTable;

/// Wraps one core so the reactor can poll it as a [`Task`]. Fatal errors are
/// already handled inside `CpuCore::step` (exit code 1, core halted); this
/// task only needs to stop reporting itself runnable once that happens.
struct CoreTask {
    container: Rc<RefCell<CpuContainer>>,
    core_idx: usize,
}

impl Task for CoreTask {
    fn runnable(&mut self) -> bool {
        self.container.borrow().core(self.core_idx).runnable()
    }

    fn run(&mut self) {
        let _ = self.container.borrow_mut().core_mut(self.core_idx).step();
    }
}

/// Drains queued hardware IRQs into core 0 of CPU 0, serialized between core
/// `step`s as required by the single-threaded cooperative scheduling model.
struct IrqRouterTask {
    container: Rc<RefCell<CpuContainer>>,
    queue: Rc<RefCell<VecDeque<u32>>>,
}

impl Task for IrqRouterTask {
    fn runnable(&mut self) -> bool {
        true
    }

    fn run(&mut self) {
        while let Some(index) = self.queue.borrow_mut().pop_front() {
            if let Err(e) = self.container.borrow_mut().deliver_hardware_irq(0, index) {
                log::error!(target: "duckyvm::machine", "irq {} delivery failed: {}", index, e);
            }
        }
    }
}

pub struct Machine {
    pub config: Config,
    mem: Rc<RefCell<MemoryController>>,
    containers: Vec<Rc<RefCell<CpuContainer>>>,
    reactor: Reactor,
    task_ids: Vec<TaskId>,
    ports: PortTable,
    irq_sources: IrqSourceTable,
    irq_queue: Rc<RefCell<VecDeque<u32>>>,
    virtual_interrupts: VirtualInterruptTable,
}

impl Machine {
    /// Build a machine from `config`, allocating `memory_segments` worth of
    /// physical memory up front and constructing one [`CpuContainer`] per
    /// configured CPU, each with `config.machine.cores` cores.
    pub fn new(config: Config, memory_segments: u32, irq_line_count: usize) -> Machine {
        let mem = Rc::new(RefCell::new(MemoryController::new(
            memory_segments,
            config.memory.force_aligned_access,
        )));
        let virtual_interrupts: VirtualInterruptTable = Rc::new(RefCell::new(std::collections::HashMap::new()));
        let core_config = CpuCoreConfig {
            ivt_address: PhysAddr(config.cpu.ivt_address),
            inst_cache_size: config.cpu.inst_cache,
            data_cache_size: config.cpu.data_cache_size,
            check_frames: config.cpu.check_frames,
            math_coprocessor: config.cpu.math_coprocessor,
            control_coprocessor: config.cpu.control_coprocessor,
        };

        let mut reactor = Reactor::new();
        let mut task_ids = Vec::new();
        let mut containers = Vec::with_capacity(config.machine.cpus);

        for cpu_id in 0..config.machine.cpus {
            let container = Rc::new(RefCell::new(CpuContainer::new(
                cpu_id,
                config.machine.cores,
                mem.clone(),
                PhysAddr(config.cpu.pt_address),
                true,
                virtual_interrupts.clone(),
                core_config.clone(),
            )));
            for core_idx in 0..config.machine.cores {
                let id = reactor.add_task(Box::new(CoreTask { container: container.clone(), core_idx }));
                task_ids.push(id);
            }
            containers.push(container);
        }

        let irq_queue = Rc::new(RefCell::new(VecDeque::new()));
        if let Some(first) = containers.first() {
            let id = reactor.add_task(Box::new(IrqRouterTask {
                container: first.clone(),
                queue: irq_queue.clone(),
            }));
            task_ids.push(id);
        }

        Machine {
            config,
            mem,
            containers,
            reactor,
            task_ids,
            ports: PortTable::new(),
            irq_sources: IrqSourceTable::new(irq_line_count),
            irq_queue,
            virtual_interrupts,
        }
    }

    pub fn memory(&self) -> &Rc<RefCell<MemoryController>> {
        &self.mem
    }

    pub fn ports(&mut self) -> &mut PortTable {
        &mut self.ports
    }

    pub fn irq_sources(&mut self) -> &mut IrqSourceTable {
        &mut self.irq_sources
    }

    pub fn virtual_interrupts(&self) -> &VirtualInterruptTable {
        &self.virtual_interrupts
    }

    /// Boot every core of every CPU at the same entry point, one stack per
    /// core spaced `stack_stride` bytes apart.
    pub fn boot(&mut self, ip: u32, sp: u32, stack_stride: u32) {
        for container in self.containers.iter() {
            container.borrow_mut().boot_all(ip, sp, stack_stride);
        }
        self.irq_sources.boot_all();
    }

    pub fn raise_irq(&self, index: u32) {
        self.irq_queue.borrow_mut().push_back(index);
    }

    pub fn any_alive(&self) -> bool {
        self.containers.iter().any(|c| c.borrow().any_alive())
    }

    /// Run until no core in any container is alive, mirroring the teacher's
    /// `CheckLivingCoresTask`: the liveness check lives in this outer loop
    /// rather than as a reactor task, since removing every other task from
    /// inside a task currently being polled by the reactor would need the
    /// reactor to hand out `&mut self` to itself mid-iteration.
    pub fn run(&mut self) {
        while self.any_alive() && self.reactor.run_once() {}
        self.halt();
    }

    pub fn halt(&mut self) {
        for id in self.task_ids.drain(..) {
            self.reactor.remove_task(id);
        }
        self.irq_sources.halt_all();
    }

    pub fn exit_codes(&self) -> Vec<Option<u8>> {
        let mut codes = Vec::new();
        for container in self.containers.iter() {
            for core in container.borrow().cores() {
                codes.push(core.exit_code());
            }
        }
        codes
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        self.mem.borrow().read_u32(PhysAddr(addr), true)
    }

    pub fn write_u32(&self, addr: u32, value: u32) -> Result<()> {
        self.mem.borrow_mut().write_u32(PhysAddr(addr), value, true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_config() -> Config {
        Config::from_toml_str("").unwrap()
    }

    #[test]
    fn builds_single_cpu_single_core_machine() {
        let machine = Machine::new(boot_config(), 4, 8);
        assert_eq!(machine.containers.len(), 1);
        assert_eq!(machine.containers[0].borrow().core_count(), 1);
    }

    #[test]
    fn halted_core_stops_the_run_loop() {
        let mut machine = Machine::new(boot_config(), 4, 8);
        machine.mem.borrow_mut().alloc_segment().unwrap();
        // Directly halt the core rather than running it down, just to
        // exercise the liveness check in isolation.
        machine.containers[0].borrow_mut().core_mut(0).halt(0);
        machine.run();
        assert!(!machine.any_alive());
    }

    #[test]
    fn booted_core_runs_a_halt_instruction_to_completion() {
        let mut machine = Machine::new(boot_config(), 4, 8);
        machine.mem.borrow_mut().alloc_segment().unwrap();
        // opcode 1 (HLT) in the low 6 bits, exit code 7 in bits [6:14).
        let hlt_with_code_7 = 1u32 | (7u32 << 6);
        machine.write_u32(0, hlt_with_code_7).unwrap();
        machine.boot(0, 0x1000, 0x100);
        machine.run();
        assert!(!machine.any_alive());
        assert_eq!(machine.exit_codes(), vec![Some(7)]);
    }
}
