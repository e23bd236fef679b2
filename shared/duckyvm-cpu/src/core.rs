use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use duckyvm_cache::{Coherence, DataCache, InstructionCache};
use duckyvm_error::{Result, VmError};
use duckyvm_types::{Flags, PhysAddr, REG_FP, REG_SP};

use crate::isa::{self, Cond, Instruction};
use crate::mmu::{CoreMemBackend, Mmu};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreState {
    Halted,
    Running,
    Suspended,
    Idle,
}

/// A host routine invoked synchronously for a virtual interrupt, bypassing the
/// IVT and the stack/flags machinery real interrupt entry uses.
pub trait VirtualInterruptHandler {
    fn call(&self, core: &mut CpuCore) -> Result<()>;
}

pub type VirtualInterruptTable = Rc<RefCell<HashMap<u32, Box<dyn VirtualInterruptHandler>>>>;

/// Saved (fp, ip) pair kept only when `check-frames` is enabled, so
/// `destroy_frame` can verify the stack unwound the way it was built.
#[derive(Debug, Copy, Clone)]
struct StackFrame {
    fp: u32,
    sp_at_entry: u32,
}

#[derive(Debug, Clone)]
pub struct CpuCoreConfig {
    pub ivt_address: PhysAddr,
    pub inst_cache_size: usize,
    pub data_cache_size: usize,
    pub check_frames: bool,
    pub math_coprocessor: bool,
    pub control_coprocessor: bool,
}

pub struct CpuCore {
    pub id: usize,
    pub cpu_id: usize,
    regs: [u32; 32],
    ip: u32,
    flags: Flags,
    cnt: u64,
    state: CoreState,
    exit_code: Option<u8>,
    mmu: Mmu,
    data_cache: Rc<RefCell<DataCache>>,
    coherence: Rc<Coherence>,
    inst_cache: InstructionCache<Instruction>,
    ivt_address: PhysAddr,
    virtual_interrupts: VirtualInterruptTable,
    frames: Vec<StackFrame>,
    check_frames: bool,
    math_coprocessor: bool,
    control_coprocessor: bool,
    isa_stack: Vec<(bool, bool)>,
}

impl CpuCore {
    pub fn new(
        id: usize,
        cpu_id: usize,
        mmu: Mmu,
        coherence: Rc<Coherence>,
        virtual_interrupts: VirtualInterruptTable,
        config: CpuCoreConfig,
    ) -> CpuCore {
        let data_cache = Rc::new(RefCell::new(DataCache::new(id, config.data_cache_size)));
        coherence.register(&data_cache);
        CpuCore {
            id,
            cpu_id,
            regs: [0; 32],
            ip: 0,
            flags: Flags::new(),
            cnt: 0,
            state: CoreState::Halted,
            exit_code: None,
            mmu,
            data_cache,
            coherence,
            inst_cache: InstructionCache::new(config.inst_cache_size),
            ivt_address: config.ivt_address,
            virtual_interrupts,
            frames: Vec::new(),
            check_frames: config.check_frames,
            math_coprocessor: config.math_coprocessor,
            control_coprocessor: config.control_coprocessor,
            isa_stack: Vec::new(),
        }
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state != CoreState::Halted
    }

    pub fn runnable(&self) -> bool {
        self.state == CoreState::Running
    }

    pub fn exit_code(&self) -> Option<u8> {
        self.exit_code
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn reg(&self, idx: usize) -> u32 {
        self.regs[idx]
    }

    pub fn set_reg(&mut self, idx: usize, value: u32) {
        self.regs[idx] = value;
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    fn sp(&self) -> u32 {
        self.regs[REG_SP]
    }
    fn set_sp(&mut self, v: u32) {
        self.regs[REG_SP] = v;
    }
    fn fp(&self) -> u32 {
        self.regs[REG_FP]
    }
    fn set_fp(&mut self, v: u32) {
        self.regs[REG_FP] = v;
    }

    /// Reset a core to its boot state: privileged, hardware interrupts
    /// allowed, running from `ip` with `sp` in the stack-pointer register.
    pub fn boot(&mut self, ip: u32, sp: u32) {
        self.ip = ip;
        self.set_sp(sp);
        self.flags = Flags::new();
        self.flags.set_privileged(true);
        self.flags.set_hwint_allowed(true);
        self.state = CoreState::Running;
        self.cnt = 0;
        self.exit_code = None;
    }

    pub fn suspend(&mut self) {
        if self.state == CoreState::Running || self.state == CoreState::Idle {
            self.state = CoreState::Suspended;
        }
    }

    pub fn wake_up(&mut self) {
        if self.state == CoreState::Suspended {
            self.state = CoreState::Running;
        }
    }

    pub fn halt(&mut self, code: u8) {
        self.state = CoreState::Halted;
        self.exit_code = Some(code);
        self.mmu.halt();
    }

    pub fn reset(&mut self) {
        self.inst_cache.reset();
        self.mmu.reset();
    }

    fn backend(&self) -> CoreMemBackend<'_> {
        CoreMemBackend {
            mmu: &self.mmu,
            privileged: self.flags.privileged(),
        }
    }

    fn require_privileged(&self) -> Result<()> {
        if self.flags.privileged() {
            Ok(())
        } else {
            Err(VmError::access_violation("privileged instruction in unprivileged mode"))
        }
    }

    fn fetch(&mut self, ip: u32) -> Result<Instruction> {
        if let Some(inst) = self.inst_cache.get(ip) {
            return Ok(inst);
        }
        let word = self
            .mmu
            .fetch_u32(PhysAddr(ip), self.flags.privileged())
            .map_err(|e| e.with_ip(ip))?;
        let inst = isa::decode(word, self.math_coprocessor, self.control_coprocessor)
            .map_err(|e| e.with_ip(ip))?;
        self.inst_cache.insert(ip, inst);
        Ok(inst)
    }

    /// Fetch, advance `ip`, execute, and bump `cnt`. A fault halts the core with
    /// exit code 1 and is returned so the caller (the reactor task wrapping this
    /// core) can log it.
    pub fn step(&mut self) -> Result<()> {
        if self.state != CoreState::Running {
            return Ok(());
        }
        let ip = self.ip;
        let result = self.step_inner(ip);
        if let Err(ref e) = result {
            log::error!(target: "duckyvm::cpu", "#{}:#{} fatal: {}", self.cpu_id, self.id, e);
            self.exit_code = Some(1);
            self.state = CoreState::Halted;
        }
        result
    }

    fn step_inner(&mut self, ip: u32) -> Result<()> {
        let inst = self.fetch(ip)?;
        self.ip = ip.wrapping_add(4);
        self.execute(inst).map_err(|e| e.with_ip(ip))?;
        self.cnt += 1;
        Ok(())
    }

    // -- stack / frame primitives -------------------------------------------------

    fn raw_push(&mut self, value: u32) -> Result<()> {
        let sp = self.sp().wrapping_sub(4);
        self.set_sp(sp);
        let mut backend = self.backend();
        self.data_cache
            .borrow_mut()
            .write_u32(&mut backend, &self.coherence, sp, value)
    }

    fn raw_pop(&mut self) -> Result<u32> {
        let sp = self.sp();
        let mut backend = self.backend();
        let value = self
            .data_cache
            .borrow_mut()
            .read_u32(&mut backend, &self.coherence, sp)?;
        self.set_sp(sp.wrapping_add(4));
        Ok(value)
    }

    fn create_frame(&mut self) -> Result<()> {
        let sp_at_entry = self.sp();
        self.raw_push(self.ip)?;
        self.raw_push(self.fp())?;
        self.set_fp(self.sp());
        if self.check_frames {
            self.frames.push(StackFrame { fp: self.fp(), sp_at_entry });
        }
        Ok(())
    }

    fn destroy_frame(&mut self) -> Result<()> {
        if self.check_frames {
            if let Some(frame) = self.frames.pop() {
                if frame.fp != self.fp() {
                    return Err(VmError::access_violation("leaving frame with wrong sp"));
                }
            }
        }
        let saved_fp = self.raw_pop()?;
        let ret_ip = self.raw_pop()?;
        self.set_fp(saved_fp);
        self.ip = ret_ip;
        Ok(())
    }

    // -- interrupts ----------------------------------------------------------

    fn ivt_entry(&self, index: u32) -> Result<(u32, u32)> {
        let addr = self.ivt_address.offset(index * 8);
        let ip = self.mmu.read_u32(addr, true)?;
        let sp = self.mmu.read_u32(addr.offset(4), true)?;
        Ok((ip, sp))
    }

    /// Hardware or non-virtual software interrupt entry: §4.7's five-step
    /// procedure.
    pub fn enter_interrupt(&mut self, index: u32, hardware: bool) -> Result<()> {
        let (vec_ip, vec_sp) = self
            .ivt_entry(index)
            .map_err(|_| VmError::invalid_resource(format!("ivt index {} out of range", index)))?;

        let old_sp = self.sp();
        self.set_sp(vec_sp);
        self.raw_push(old_sp)?;
        self.raw_push(self.flags.bits() as u32)?;
        self.create_frame()?;

        self.flags.set_privileged(true);
        self.ip = vec_ip;
        self.isa_stack.push((self.math_coprocessor, self.control_coprocessor));

        if hardware {
            self.flags.set_hwint_allowed(false);
            if self.state == CoreState::Idle {
                self.state = CoreState::Running;
            }
        }
        Ok(())
    }

    fn exit_interrupt(&mut self) -> Result<()> {
        self.require_privileged()?;
        self.destroy_frame()?;
        let flags = self.raw_pop()?;
        self.flags = Flags::from_bits(flags as u8);
        let old_sp = self.raw_pop()?;
        self.set_sp(old_sp);
        if let Some((math, control)) = self.isa_stack.pop() {
            self.math_coprocessor = math;
            self.control_coprocessor = control;
        }
        Ok(())
    }

    /// Entry point used by the machine's IRQ router.
    pub fn deliver_hardware_irq(&mut self, index: u32) -> Result<()> {
        self.enter_interrupt(index, true)
    }

    fn software_interrupt(&mut self, index: u32) -> Result<()> {
        let table = self.virtual_interrupts.clone();
        let has_handler = table.borrow().contains_key(&index);
        if has_handler {
            let borrowed = table.borrow();
            let handler = borrowed.get(&index).expect("checked above");
            return handler.call(self);
        }
        self.enter_interrupt(index, false)
    }

    // -- execute --------------------------------------------------------------

    fn eval_cond(&self, cond: Cond) -> bool {
        let f = self.flags;
        match cond {
            Cond::Always => true,
            Cond::Equal => f.equal(),
            Cond::NotEqual => !f.equal(),
            Cond::Zero => f.zero(),
            Cond::NotZero => !f.zero(),
            Cond::Sign => f.sign(),
            Cond::NotSign => !f.sign(),
            Cond::Overflow => f.overflow(),
            Cond::NotOverflow => !f.overflow(),
            Cond::Greater => !f.sign() && !f.equal(),
            Cond::GreaterOrEqual => !f.sign() || f.equal(),
            Cond::LessOrEqual => f.sign() || f.equal(),
        }
    }

    fn alu_add(&mut self, rd: usize, b: u32) {
        let a = self.regs[rd];
        let wide = a as u64 + b as u64;
        let result = wide as u32;
        self.regs[rd] = result;
        self.flags.set_zero(result == 0);
        self.flags.set_overflow(wide > u32::MAX as u64);
        self.flags.set_sign(result & 0x8000_0000 != 0);
    }

    fn alu_sub(&mut self, rd: usize, b: u32) {
        let neg_b = (!b).wrapping_add(1);
        self.alu_add(rd, neg_b);
    }

    /// Floor division (round toward negative infinity), matching the host VM's
    /// `//` rather than Rust's truncating `/`.
    fn checked_signed_div(a: i32, b: i32) -> Result<i32> {
        if b == 0 {
            return Err(VmError::division_by_zero());
        }
        if a == i32::MIN && b == -1 {
            return Err(VmError::arithmetic_overflow());
        }
        let q = a.wrapping_div(b);
        let r = a.wrapping_rem(b);
        Ok(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
    }

    /// Remainder with the divisor's sign (Python-style `%`), not the dividend's.
    fn checked_signed_rem(a: i32, b: i32) -> Result<i32> {
        if b == 0 {
            return Err(VmError::division_by_zero());
        }
        if a == i32::MIN && b == -1 {
            return Err(VmError::arithmetic_overflow());
        }
        let r = a.wrapping_rem(b);
        Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
    }

    /// Execute one already-decoded instruction against this core's state.
    /// Exposed publicly (alongside `step`, which fetches through the MMU and
    /// instruction cache first) so tooling and tests can drive a core
    /// directly without staging a fetchable binary image.
    pub fn execute(&mut self, inst: Instruction) -> Result<()> {
        match inst {
            Instruction::Nop => {}

            Instruction::Hlt { code } => {
                self.require_privileged()?;
                self.halt(code as u8);
            }

            Instruction::Idle => {
                if self.state == CoreState::Running {
                    self.state = CoreState::Idle;
                }
            }

            Instruction::Int { index } => self.software_interrupt(index)?,
            Instruction::RetInt => self.exit_interrupt()?,

            Instruction::Cli => {
                self.require_privileged()?;
                self.flags.set_hwint_allowed(false);
            }
            Instruction::Sti => {
                self.require_privileged()?;
                self.flags.set_hwint_allowed(true);
            }
            Instruction::Rst => {
                self.require_privileged()?;
                self.reset();
            }
            Instruction::Lpm { rd } => {
                self.require_privileged()?;
                self.regs[rd] = self.mmu_pt_address().0;
            }

            Instruction::Mov { rd, rs } => self.regs[rd] = self.regs[rs],
            Instruction::Li { rd, imm } => self.regs[rd] = imm as u32,
            Instruction::Liu { rd, imm } => self.regs[rd] = imm,
            Instruction::La { rd, imm } => self.regs[rd] = self.ip.wrapping_add(imm as u32),
            Instruction::Swp { rd, rs } => self.regs.swap(rd, rs),

            Instruction::Add { rd, rs } => self.alu_add(rd, self.regs[rs]),
            Instruction::AddImm { rd, imm } => self.alu_add(rd, imm as u32),
            Instruction::Sub { rd, rs } => self.alu_sub(rd, self.regs[rs]),
            Instruction::SubImm { rd, imm } => self.alu_sub(rd, imm as u32),
            Instruction::Mul { rd, rs } => {
                let wide = self.regs[rd] as u64 * self.regs[rs] as u64;
                let result = wide as u32;
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_overflow(wide > u32::MAX as u64);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }
            Instruction::Div { rd, rs } => {
                let result = Self::checked_signed_div(self.regs[rd] as i32, self.regs[rs] as i32)?;
                self.regs[rd] = result as u32;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result < 0);
            }
            Instruction::Udiv { rd, rs } => {
                let b = self.regs[rs];
                if b == 0 {
                    return Err(VmError::division_by_zero());
                }
                let result = self.regs[rd] / b;
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(false);
            }
            Instruction::Mod { rd, rs } => {
                let result = Self::checked_signed_rem(self.regs[rd] as i32, self.regs[rs] as i32)?;
                self.regs[rd] = result as u32;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result < 0);
            }
            Instruction::Inc { rd } => self.alu_add(rd, 1),
            Instruction::Dec { rd } => self.alu_sub(rd, 1),

            Instruction::And { rd, rs } => {
                let result = self.regs[rd] & self.regs[rs];
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }
            Instruction::Or { rd, rs } => {
                let result = self.regs[rd] | self.regs[rs];
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }
            Instruction::Xor { rd, rs } => {
                let result = self.regs[rd] ^ self.regs[rs];
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }
            Instruction::Not { rd } => {
                let result = !self.regs[rd];
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }
            Instruction::Shiftl { rd, rs } => {
                let result = self.regs[rd].wrapping_shl(self.regs[rs]);
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }
            Instruction::Shiftr { rd, rs } => {
                let result = self.regs[rd].wrapping_shr(self.regs[rs]);
                self.regs[rd] = result;
                self.flags.set_zero(result == 0);
                self.flags.set_sign(result & 0x8000_0000 != 0);
            }

            Instruction::Cmp { rd, rs } => {
                let a = self.regs[rd] as i32;
                let b = self.regs[rs] as i32;
                self.flags.set_equal(a == b);
                self.flags.set_zero(a == b);
                self.flags.set_sign(a < b);
                self.flags.set_overflow(false);
            }
            Instruction::Cmpu { rd, rs } => {
                let a = self.regs[rd];
                let b = self.regs[rs];
                self.flags.set_equal(a == b);
                self.flags.set_zero(a == b);
                self.flags.set_sign(a < b);
                self.flags.set_overflow(false);
            }
            Instruction::Setcc { rd, cond } => {
                self.regs[rd] = self.eval_cond(cond) as u32;
            }

            Instruction::Branch { cond, imm } => {
                if self.eval_cond(cond) {
                    self.ip = self.ip.wrapping_add((imm * 4) as u32);
                }
            }
            Instruction::BranchReg { cond, rs } => {
                if self.eval_cond(cond) {
                    self.ip = self.regs[rs];
                }
            }
            Instruction::Call { imm } => {
                let target = self.ip.wrapping_add((imm * 4) as u32);
                self.create_frame()?;
                self.ip = target;
            }
            Instruction::CallReg { rs } => {
                let target = self.regs[rs];
                self.create_frame()?;
                self.ip = target;
            }
            Instruction::Ret => self.destroy_frame()?,

            Instruction::Lw { rd, rs, imm } => {
                let addr = self.regs[rs].wrapping_add(imm as u32);
                let mut backend = self.backend();
                let value = self
                    .data_cache
                    .borrow_mut()
                    .read_u32(&mut backend, &self.coherence, addr)?;
                self.regs[rd] = value;
            }
            Instruction::Ls { rd, rs, imm } => {
                let addr = self.regs[rs].wrapping_add(imm as u32);
                let mut backend = self.backend();
                let value = self
                    .data_cache
                    .borrow_mut()
                    .read_u16(&mut backend, &self.coherence, addr)?;
                self.regs[rd] = isa::encoding::sign_extend(value as u32, 16) as u32;
            }
            Instruction::Lb { rd, rs, imm } => {
                let addr = self.regs[rs].wrapping_add(imm as u32);
                let mut backend = self.backend();
                let value = self
                    .data_cache
                    .borrow_mut()
                    .read_u8(&mut backend, &self.coherence, addr)?;
                self.regs[rd] = isa::encoding::sign_extend(value as u32, 8) as u32;
            }
            Instruction::Stw { rs, rt, imm } => {
                let addr = self.regs[rs].wrapping_add(imm as u32);
                let value = self.regs[rt];
                let mut backend = self.backend();
                self.data_cache
                    .borrow_mut()
                    .write_u32(&mut backend, &self.coherence, addr, value)?;
            }
            Instruction::Sts { rs, rt, imm } => {
                let addr = self.regs[rs].wrapping_add(imm as u32);
                let value = self.regs[rt] as u16;
                let mut backend = self.backend();
                self.data_cache
                    .borrow_mut()
                    .write_u16(&mut backend, &self.coherence, addr, value)?;
            }
            Instruction::Stb { rs, rt, imm } => {
                let addr = self.regs[rs].wrapping_add(imm as u32);
                let value = self.regs[rt] as u8;
                let mut backend = self.backend();
                self.data_cache
                    .borrow_mut()
                    .write_u8(&mut backend, &self.coherence, addr, value)?;
            }
            Instruction::Cas { rd, rs, rt } => {
                let addr = self.regs[rd];
                let expected = self.regs[rs];
                let new_value = self.regs[rt];
                let current = {
                    let mut backend = self.backend();
                    let mut cache = self.data_cache.borrow_mut();
                    let current = cache.read_u32(&mut backend, &self.coherence, addr)?;
                    if current == expected {
                        cache.write_u32(&mut backend, &self.coherence, addr, new_value)?;
                    }
                    current
                };
                if current == expected {
                    self.flags.set_equal(true);
                } else {
                    self.regs[rs] = current;
                    self.flags.set_equal(false);
                }
            }

            Instruction::Fadd { rd, rs } => self.float_op(rd, rs, |a, b| a + b),
            Instruction::Fsub { rd, rs } => self.float_op(rd, rs, |a, b| a - b),
            Instruction::Fmul { rd, rs } => self.float_op(rd, rs, |a, b| a * b),
            Instruction::Fdiv { rd, rs } => {
                let b = f32::from_bits(self.regs[rs]);
                if b == 0.0 {
                    return Err(VmError::division_by_zero());
                }
                self.float_op(rd, rs, |a, _| a / b);
            }
        }
        Ok(())
    }

    fn float_op(&mut self, rd: usize, rs: usize, f: impl Fn(f32, f32) -> f32) {
        let a = f32::from_bits(self.regs[rd]);
        let b = f32::from_bits(self.regs[rs]);
        self.regs[rd] = f(a, b).to_bits();
    }

    fn mmu_pt_address(&self) -> PhysAddr {
        self.mmu.pt_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckyvm_cache::Coherence;
    use duckyvm_memory::MemoryController;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn make_core(paging: bool) -> (CpuCore, StdRc<StdRefCell<MemoryController>>) {
        let mem = StdRc::new(StdRefCell::new(MemoryController::new(4, false)));
        mem.borrow_mut().alloc_segment().unwrap();
        let mmu = Mmu::new(mem.clone(), PhysAddr(0), paging);
        let coherence = StdRc::new(Coherence::new());
        let vit: VirtualInterruptTable = StdRc::new(StdRefCell::new(HashMap::new()));
        let config = CpuCoreConfig {
            ivt_address: PhysAddr(0),
            inst_cache_size: 16,
            data_cache_size: 16,
            check_frames: true,
            math_coprocessor: true,
            control_coprocessor: true,
        };
        let mut core = CpuCore::new(0, 0, mmu, coherence, vit, config);
        core.boot(0x1000, 0x2000);
        core.flags.set_privileged(true);
        (core, mem)
    }

    #[test]
    fn add_wraps_and_sets_overflow() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, 0xFFFF_FFFE);
        core.set_reg(1, 4);
        core.execute(Instruction::Add { rd: 0, rs: 1 }).unwrap();
        assert_eq!(core.reg(0), 2);
        assert!(core.flags.overflow());
        assert!(!core.flags.zero());
        assert!(!core.flags.sign());
    }

    #[test]
    fn cmp_is_signed() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, 10);
        core.set_reg(1, 20);
        core.execute(Instruction::Cmp { rd: 0, rs: 1 }).unwrap();
        assert!(!core.flags.equal());
        assert!(core.flags.sign());
        assert_eq!(core.reg(0), 10);
        assert_eq!(core.reg(1), 20);
    }

    #[test]
    fn branch_taken_scales_and_sign_extends_immediate() {
        let (mut core, _mem) = make_core(false);
        core.ip = 0x1000;
        core.flags.set_equal(true);
        core.execute(Instruction::Branch { cond: Cond::Equal, imm: 0x10 }).unwrap();
        assert_eq!(core.ip, 0x1040);
    }

    #[test]
    fn call_then_ret_round_trips_ip_and_sp() {
        let (mut core, _mem) = make_core(false);
        core.ip = 0x104;
        let sp_before = core.sp();
        core.execute(Instruction::Call { imm: (0x2000 - 0x104) / 4 }).unwrap();
        assert_eq!(core.ip, 0x2000);
        core.execute(Instruction::Ret).unwrap();
        assert_eq!(core.ip, 0x104);
        assert_eq!(core.sp(), sp_before);
    }

    #[test]
    fn cas_success_updates_memory_and_equal_flag() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(1, 0x3000);
        core.set_reg(2, 0xAA);
        core.set_reg(3, 0xBB);
        let mut backend = core.backend();
        core.data_cache
            .borrow_mut()
            .write_u32(&mut backend, &core.coherence, 0x3000, 0xAA)
            .unwrap();
        core.execute(Instruction::Cas { rd: 1, rs: 2, rt: 3 }).unwrap();
        assert!(core.flags.equal());
        let mut backend = core.backend();
        let v = core
            .data_cache
            .borrow_mut()
            .read_u32(&mut backend, &core.coherence, 0x3000)
            .unwrap();
        assert_eq!(v, 0xBB);
    }

    #[test]
    fn cas_failure_reports_current_value() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(1, 0x3000);
        core.set_reg(2, 0xAB);
        core.set_reg(3, 0xBB);
        let mut backend = core.backend();
        core.data_cache
            .borrow_mut()
            .write_u32(&mut backend, &core.coherence, 0x3000, 0xAA)
            .unwrap();
        core.execute(Instruction::Cas { rd: 1, rs: 2, rt: 3 }).unwrap();
        assert!(!core.flags.equal());
        assert_eq!(core.reg(2), 0xAA);
    }

    #[test]
    fn unprivileged_hlt_is_access_violation() {
        let (mut core, _mem) = make_core(false);
        core.flags.set_privileged(false);
        let result = core.execute(Instruction::Hlt { code: 0 });
        assert!(result.is_err());
        assert!(core.is_alive());
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, 10);
        core.set_reg(1, 0);
        assert!(core.execute(Instruction::Div { rd: 0, rs: 1 }).is_err());
    }

    #[test]
    fn int_min_div_neg_one_is_arithmetic_overflow_not_panic() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, i32::MIN as u32);
        core.set_reg(1, (-1i32) as u32);
        let err = core.execute(Instruction::Div { rd: 0, rs: 1 }).unwrap_err();
        assert_eq!(err.kind, duckyvm_error::ErrorKind::ArithmeticOverflow);
    }

    #[test]
    fn div_rounds_toward_negative_infinity_on_mixed_signs() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, (-10i32) as u32);
        core.set_reg(1, 3);
        core.execute(Instruction::Div { rd: 0, rs: 1 }).unwrap();
        assert_eq!(core.reg(0) as i32, -4);
    }

    #[test]
    fn mod_takes_the_sign_of_the_divisor() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, (-10i32) as u32);
        core.set_reg(1, 3);
        core.execute(Instruction::Mod { rd: 0, rs: 1 }).unwrap();
        assert_eq!(core.reg(0) as i32, 2);
    }

    #[test]
    fn shift_count_of_32_does_not_panic() {
        let (mut core, _mem) = make_core(false);
        core.set_reg(0, 1);
        core.set_reg(1, 32);
        core.execute(Instruction::Shiftl { rd: 0, rs: 1 }).unwrap();
    }
}
