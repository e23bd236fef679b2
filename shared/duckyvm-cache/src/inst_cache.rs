use std::num::NonZeroUsize;

use lru::LruCache;

/// An LRU of decoded instructions keyed by fetch address. `T` is whatever
/// `duckyvm-cpu` decodes an instruction word into (opcode plus operand views and a
/// handler reference); this crate doesn't need to know its shape.
///
/// Entries are pure functions of the memory they were decoded from: there is no
/// write-back, and eviction never touches memory. The cache is only invalidated by
/// an explicit `reset`, mirroring the fact that nothing else in the machine marks
/// executable pages as stale.
pub struct InstructionCache<T> {
    entries: LruCache<u32, T>,
}

impl<T: Clone> InstructionCache<T> {
    pub fn new(capacity: usize) -> InstructionCache<T> {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        InstructionCache {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, addr: u32) -> Option<T> {
        self.entries.get(&addr).cloned()
    }

    pub fn insert(&mut self, addr: u32, decoded: T) {
        self.entries.put(addr, decoded);
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert() {
        let mut c: InstructionCache<u32> = InstructionCache::new(2);
        c.insert(0x1000, 42);
        assert_eq!(c.get(0x1000), Some(42));
    }

    #[test]
    fn reset_drops_everything() {
        let mut c: InstructionCache<u32> = InstructionCache::new(2);
        c.insert(0x1000, 42);
        c.reset();
        assert_eq!(c.get(0x1000), None);
    }

    #[test]
    fn lru_eviction_drops_oldest() {
        let mut c: InstructionCache<u32> = InstructionCache::new(1);
        c.insert(0x1000, 1);
        c.insert(0x2000, 2);
        assert_eq!(c.get(0x1000), None);
        assert_eq!(c.get(0x2000), Some(2));
    }
}
