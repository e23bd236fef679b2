//! The instruction cache, data cache, and the coherence controller that keeps
//! per-core data caches consistent with each other.

mod data_cache;
mod inst_cache;

pub use data_cache::{Coherence, DataCache, WordBackend};
pub use inst_cache::InstructionCache;
