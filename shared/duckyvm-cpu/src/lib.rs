//! Everything that runs on a single CPU: instruction decoding, the per-core
//! MMU, the core state machine and its instruction executor, and the
//! container that groups cores under one shared address space.

pub mod container;
pub mod core;
pub mod isa;
pub mod mmu;

pub use container::CpuContainer;
pub use crate::core::{
    CoreState, CpuCore, CpuCoreConfig, VirtualInterruptHandler, VirtualInterruptTable,
};
pub use isa::{Cond, Instruction};
pub use mmu::{CoreMemBackend, Mmu};
