//! Integration tests exercising more than one core at a time: cache
//! coherence between peers and IRQ delivery through a shared IVT.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use duckyvm_cache::Coherence;
use duckyvm_cpu::container::{new_virtual_interrupt_table, CpuContainer};
use duckyvm_cpu::core::{CpuCoreConfig, VirtualInterruptTable};
use duckyvm_cpu::isa::Instruction;
use duckyvm_cpu::mmu::Mmu;
use duckyvm_cpu::CpuCore;
use duckyvm_memory::MemoryController;
use duckyvm_types::PhysAddr;

fn config() -> CpuCoreConfig {
    CpuCoreConfig {
        ivt_address: PhysAddr(0),
        inst_cache_size: 16,
        data_cache_size: 16,
        check_frames: true,
        math_coprocessor: false,
        control_coprocessor: false,
    }
}

fn two_cores_sharing_memory() -> (CpuCore, CpuCore) {
    let mem = Rc::new(RefCell::new(MemoryController::new(4, false)));
    mem.borrow_mut().alloc_segment().unwrap();
    let coherence = Rc::new(Coherence::new());
    let vit: VirtualInterruptTable = Rc::new(RefCell::new(HashMap::new()));

    let mmu0 = Mmu::new(mem.clone(), PhysAddr(0), false);
    let mut core0 = CpuCore::new(0, 0, mmu0, coherence.clone(), vit.clone(), config());
    core0.boot(0x1000, 0x2000);

    let mmu1 = Mmu::new(mem, PhysAddr(0), false);
    let mut core1 = CpuCore::new(1, 0, mmu1, coherence, vit, config());
    core1.boot(0x1000, 0x2800);

    (core0, core1)
}

#[test]
fn writes_from_one_core_are_visible_to_a_peer_after_a_load() {
    let (mut core0, mut core1) = two_cores_sharing_memory();

    // core1 reads address A first, pulling it into its own cache.
    core1.set_reg(1, 0x3000);
    core1.execute(Instruction::Lw { rd: 0, rs: 1, imm: 0 }).unwrap();
    assert_eq!(core1.reg(0), 0);

    // core0 writes a new value to the same address.
    core0.set_reg(1, 0x3000);
    core0.set_reg(2, 0x1234_5678);
    core0.execute(Instruction::Stw { rs: 1, rt: 2, imm: 0 }).unwrap();

    // core1's next load must observe core0's write, not its stale cached copy.
    core1.execute(Instruction::Lw { rd: 0, rs: 1, imm: 0 }).unwrap();
    assert_eq!(core1.reg(0), 0x1234_5678);
}

#[test]
fn cas_contention_between_two_cores_is_serialized_by_coherence() {
    let (mut core0, mut core1) = two_cores_sharing_memory();

    core0.set_reg(1, 0x4000);
    core0.set_reg(2, 0);
    core0.execute(Instruction::Stw { rs: 1, rt: 2, imm: 0 }).unwrap();

    core0.set_reg(1, 0x4000);
    core0.set_reg(2, 0);
    core0.set_reg(3, 1);
    core0.execute(Instruction::Cas { rd: 1, rs: 2, rt: 3 }).unwrap();
    assert!(core0.flags().equal());

    core1.set_reg(1, 0x4000);
    core1.set_reg(2, 0);
    core1.set_reg(3, 2);
    core1.execute(Instruction::Cas { rd: 1, rs: 2, rt: 3 }).unwrap();
    assert!(!core1.flags().equal());
    assert_eq!(core1.reg(2), 1);
}

#[test]
fn hardware_irq_delivered_to_one_core_leaves_its_peer_untouched() {
    let mem = Rc::new(RefCell::new(MemoryController::new(4, false)));
    mem.borrow_mut().alloc_segment().unwrap();
    let vit = new_virtual_interrupt_table();

    // IVT entry for interrupt 2: ip = 0x5000, sp = 0x9000, at ivt_address + 2*8.
    mem.borrow_mut().write_u32(PhysAddr(16), 0x5000, true, true).unwrap();
    mem.borrow_mut().write_u32(PhysAddr(20), 0x9000, true, true).unwrap();

    let mut container = CpuContainer::new(0, 2, mem, PhysAddr(0), false, vit, config());
    container.boot_all(0x1000, 0x2000, 0x800);

    let peer_ip_before = container.core(1).ip();

    container.deliver_hardware_irq(0, 2).unwrap();

    let core0 = container.core(0);
    assert_eq!(core0.ip(), 0x5000);
    assert!(core0.flags().privileged());
    assert!(!core0.flags().hwint_allowed());

    let core1 = container.core(1);
    assert_eq!(core1.ip(), peer_ip_before);
    assert!(core1.flags().privileged());
    assert!(core1.flags().hwint_allowed());
}
