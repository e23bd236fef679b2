use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::rc::{Rc, Weak};

use lru::LruCache;

use duckyvm_error::Result;

/// The memory a data cache writes through to on miss and on eviction. Implemented
/// by `duckyvm-cpu`'s MMU, which resolves this to the owning core's physical
/// memory with permissions already settled.
pub trait WordBackend {
    fn read_u32_raw(&mut self, addr: u32) -> Result<u32>;
    fn write_u32_raw(&mut self, addr: u32, value: u32) -> Result<()>;
    /// Whether the page containing `addr` permits data caching at all (the PTE's
    /// `cache` bit).
    fn is_cacheable(&mut self, addr: u32) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
struct Line {
    dirty: bool,
    value: u32,
}

fn aligned(addr: u32) -> u32 {
    addr & !0x3
}

/// One core's word-granular write-back cache.
pub struct DataCache {
    id: usize,
    lines: LruCache<u32, Line>,
}

impl DataCache {
    pub fn new(id: usize, capacity: usize) -> DataCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        DataCache {
            id,
            lines: LruCache::new(capacity),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn read_word(&mut self, backend: &mut dyn WordBackend, coherence: &Coherence, addr: u32) -> Result<u32> {
        let key = aligned(addr);
        if let Some(line) = self.lines.get(&key) {
            return Ok(line.value);
        }
        coherence.flush_entry(key, Some(self.id), backend);
        let value = backend.read_u32_raw(key)?;
        if let Some((evicted_addr, evicted)) = self.insert_evicting(key, Line { dirty: false, value }) {
            if evicted.dirty {
                backend.write_u32_raw(evicted_addr, evicted.value)?;
            }
        }
        Ok(value)
    }

    fn write_word(
        &mut self,
        backend: &mut dyn WordBackend,
        coherence: &Coherence,
        addr: u32,
        value: u32,
    ) -> Result<()> {
        let key = aligned(addr);
        if let Some((evicted_addr, evicted)) = self.insert_evicting(key, Line { dirty: true, value }) {
            if evicted.dirty {
                backend.write_u32_raw(evicted_addr, evicted.value)?;
            }
        }
        coherence.release_entry(key, Some(self.id), backend);
        Ok(())
    }

    fn insert_evicting(&mut self, key: u32, line: Line) -> Option<(u32, Line)> {
        let evicted = if self.lines.len() == self.lines.cap().get() && !self.lines.contains(&key) {
            self.lines.pop_lru()
        } else {
            None
        };
        self.lines.put(key, line);
        evicted
    }

    pub fn read_u8(&mut self, backend: &mut dyn WordBackend, coherence: &Coherence, addr: u32) -> Result<u8> {
        if !backend.is_cacheable(addr)? {
            return Ok(backend.read_u32_raw(aligned(addr))?.to_le_bytes()[(addr & 3) as usize]);
        }
        let word = self.read_word(backend, coherence, addr)?;
        Ok(word.to_le_bytes()[(addr & 3) as usize])
    }

    pub fn read_u16(&mut self, backend: &mut dyn WordBackend, coherence: &Coherence, addr: u32) -> Result<u16> {
        let lo = self.read_u8(backend, coherence, addr)? as u16;
        let hi = self.read_u8(backend, coherence, addr + 1)? as u16;
        Ok(lo | (hi << 8))
    }

    pub fn read_u32(&mut self, backend: &mut dyn WordBackend, coherence: &Coherence, addr: u32) -> Result<u32> {
        if !backend.is_cacheable(addr)? {
            return backend.read_u32_raw(addr);
        }
        self.read_word(backend, coherence, addr)
    }

    pub fn write_u8(
        &mut self,
        backend: &mut dyn WordBackend,
        coherence: &Coherence,
        addr: u32,
        value: u8,
    ) -> Result<()> {
        if !backend.is_cacheable(addr)? {
            let key = aligned(addr);
            let mut bytes = backend.read_u32_raw(key)?.to_le_bytes();
            bytes[(addr & 3) as usize] = value;
            return backend.write_u32_raw(key, u32::from_le_bytes(bytes));
        }
        let word = self.read_word(backend, coherence, addr)?;
        let mut bytes = word.to_le_bytes();
        bytes[(addr & 3) as usize] = value;
        self.write_word(backend, coherence, addr, u32::from_le_bytes(bytes))
    }

    pub fn write_u16(
        &mut self,
        backend: &mut dyn WordBackend,
        coherence: &Coherence,
        addr: u32,
        value: u16,
    ) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(backend, coherence, addr, lo)?;
        self.write_u8(backend, coherence, addr + 1, hi)
    }

    pub fn write_u32(
        &mut self,
        backend: &mut dyn WordBackend,
        coherence: &Coherence,
        addr: u32,
        value: u32,
    ) -> Result<()> {
        if !backend.is_cacheable(addr)? {
            return backend.write_u32_raw(addr, value);
        }
        self.write_word(backend, coherence, addr, value)
    }

    /// Drop (and optionally write back) the line containing `addr`, if present.
    pub fn release_entry_local(&mut self, backend: &mut dyn WordBackend, addr: u32, writeback: bool) -> Result<()> {
        let key = aligned(addr);
        if let Some(line) = self.lines.pop(&key) {
            if writeback && line.dirty {
                backend.write_u32_raw(key, line.value)?;
            }
        }
        Ok(())
    }

    pub fn release_page_local(&mut self, backend: &mut dyn WordBackend, page_addr: u32, page_size: u32, writeback: bool) -> Result<()> {
        self.release_area_local(backend, page_addr, page_size, writeback)
    }

    pub fn release_area_local(
        &mut self,
        backend: &mut dyn WordBackend,
        addr: u32,
        size: u32,
        writeback: bool,
    ) -> Result<()> {
        let start = aligned(addr);
        let end = addr.saturating_add(size);
        let keys: Vec<u32> = self
            .lines
            .iter()
            .map(|(k, _)| *k)
            .filter(|&k| k >= start && k < end)
            .collect();
        for k in keys {
            self.release_entry_local(backend, k, writeback)?;
        }
        Ok(())
    }

    pub fn release_all_local(&mut self, backend: &mut dyn WordBackend, writeback: bool) -> Result<()> {
        let keys: Vec<u32> = self.lines.iter().map(|(k, _)| *k).collect();
        for k in keys {
            self.release_entry_local(backend, k, writeback)?;
        }
        Ok(())
    }

    /// Write back every dirty line without dropping them (used by `flush`).
    fn flush_entry_local(&mut self, backend: &mut dyn WordBackend, addr: u32) -> Result<()> {
        let key = aligned(addr);
        if let Some(line) = self.lines.get_mut(&key) {
            if line.dirty {
                backend.write_u32_raw(key, line.value)?;
                line.dirty = false;
            }
        }
        Ok(())
    }
}

/// Broadcasts invalidate/flush operations to every peer cache except the caller.
///
/// Registration uses `Weak` handles: the coherence controller does not keep a
/// core's cache alive past the core's own lifetime.
#[derive(Default)]
pub struct Coherence {
    peers: RefCell<Vec<Weak<RefCell<DataCache>>>>,
}

impl Coherence {
    pub fn new() -> Coherence {
        Coherence {
            peers: RefCell::new(Vec::new()),
        }
    }

    pub fn register(&self, cache: &Rc<RefCell<DataCache>>) {
        self.peers.borrow_mut().push(Rc::downgrade(cache));
    }

    fn for_each_peer(&self, caller: Option<usize>, mut f: impl FnMut(&mut DataCache)) {
        self.peers.borrow_mut().retain(|weak| weak.strong_count() > 0);
        for weak in self.peers.borrow().iter() {
            if let Some(peer) = weak.upgrade() {
                if Some(peer.borrow().id()) == caller {
                    continue;
                }
                f(&mut peer.borrow_mut());
            }
        }
    }

    /// Write back any peer-owned dirty copy of `addr`, keeping it cached and clean.
    pub fn flush_entry(&self, addr: u32, caller: Option<usize>, backend: &mut dyn WordBackend) {
        self.for_each_peer(caller, |peer| {
            let _ = peer.flush_entry_local(backend, addr);
        });
    }

    /// Drop any peer-owned copy of `addr`. Writes back first unless `caller` is
    /// `Some` (the caller now owns the line and will supersede it).
    pub fn release_entry(&self, addr: u32, caller: Option<usize>, backend: &mut dyn WordBackend) {
        let writeback = caller.is_none();
        self.for_each_peer(caller, |peer| {
            let _ = peer.release_entry_local(backend, addr, writeback);
        });
    }

    pub fn release_page(&self, page_addr: u32, page_size: u32, caller: Option<usize>, backend: &mut dyn WordBackend) {
        let writeback = caller.is_none();
        self.for_each_peer(caller, |peer| {
            let _ = peer.release_page_local(backend, page_addr, page_size, writeback);
        });
    }

    pub fn release_area(&self, addr: u32, size: u32, caller: Option<usize>, backend: &mut dyn WordBackend) {
        let writeback = caller.is_none();
        self.for_each_peer(caller, |peer| {
            let _ = peer.release_area_local(backend, addr, size, writeback);
        });
    }

    pub fn release_all(&self, caller: Option<usize>, backend: &mut dyn WordBackend) {
        let writeback = caller.is_none();
        self.for_each_peer(caller, |peer| {
            let _ = peer.release_all_local(backend, writeback);
        });
    }
}
