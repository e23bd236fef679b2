use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use duckyvm_cache::WordBackend;
use duckyvm_error::Result;
use duckyvm_memory::{Access, MemoryController};
use duckyvm_types::{PhysAddr, PteFlags};

/// Per-core translation and permission enforcement.
///
/// When paging is disabled, or the core is privileged, every check is bypassed and
/// the underlying page's own flags are trusted as-is (see `duckyvm-memory`'s Page
/// for that independent check). Otherwise the PTE for the target page is consulted,
/// cached by page index until an explicit `release_ptes`.
pub struct Mmu {
    mem: Rc<RefCell<MemoryController>>,
    pt_address: PhysAddr,
    paging_enabled: bool,
    pte_cache: RefCell<HashMap<u32, PteFlags>>,
}

impl Mmu {
    pub fn new(mem: Rc<RefCell<MemoryController>>, pt_address: PhysAddr, paging_enabled: bool) -> Mmu {
        Mmu {
            mem,
            pt_address,
            paging_enabled,
            pte_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn pt_address(&self) -> PhysAddr {
        self.pt_address
    }

    pub fn reset(&self) {
        self.pte_cache.borrow_mut().clear();
    }

    pub fn release_ptes(&self) {
        self.reset();
    }

    /// Lifecycle hook matching the core's own `halt`; the MMU holds no resource
    /// that needs releasing beyond the PTE cache, which `reset` already clears.
    pub fn halt(&self) {
        self.reset();
    }

    /// Read the PTE covering `addr`, consulting the per-MMU cache first.
    pub fn get_pte(&self, addr: PhysAddr) -> Result<PteFlags> {
        self.get_pte_cached(addr.page_index())
    }

    fn get_pte_cached(&self, page_index: u32) -> Result<PteFlags> {
        if let Some(pte) = self.pte_cache.borrow().get(&page_index) {
            return Ok(*pte);
        }
        let pte = duckyvm_memory::read_pte(&self.mem.borrow(), self.pt_address, page_index)?;
        self.pte_cache.borrow_mut().insert(page_index, pte);
        Ok(pte)
    }

    /// Returns the `privileged` value the Memory Controller should be called with:
    /// true whenever the PTE-level check is bypassed or already satisfied, so the
    /// page's own flag check (see `duckyvm-memory::Page`) is never re-applied on
    /// this path.
    fn check(&self, addr: PhysAddr, privileged: bool, access: Access) -> Result<bool> {
        if privileged || !self.paging_enabled {
            return Ok(true);
        }
        let pte = self.get_pte_cached(addr.page_index())?;
        let allowed = match access {
            Access::Read => pte.read(),
            Access::Write => pte.write(),
            Access::Execute => pte.execute(),
        };
        if !allowed {
            return Err(duckyvm_error::VmError::access_violation(format!(
                "pte denies {:?} at {:#x}",
                access, addr.0
            )));
        }
        Ok(true)
    }

    pub fn is_cacheable(&self, addr: PhysAddr) -> Result<bool> {
        if !self.paging_enabled {
            return Ok(true);
        }
        Ok(self.get_pte_cached(addr.page_index())?.cacheable())
    }

    pub fn fetch_u32(&self, addr: PhysAddr, privileged: bool) -> Result<u32> {
        let eff = self.check(addr, privileged, Access::Execute)?;
        self.mem.borrow().read_u32(addr, eff)
    }

    pub fn read_u8(&self, addr: PhysAddr, privileged: bool) -> Result<u8> {
        let eff = self.check(addr, privileged, Access::Read)?;
        self.mem.borrow().read_u8(addr, eff)
    }

    pub fn read_u16(&self, addr: PhysAddr, privileged: bool) -> Result<u16> {
        let eff = self.check(addr, privileged, Access::Read)?;
        self.mem.borrow().read_u16(addr, eff)
    }

    pub fn read_u32(&self, addr: PhysAddr, privileged: bool) -> Result<u32> {
        let eff = self.check(addr, privileged, Access::Read)?;
        self.mem.borrow().read_u32(addr, eff)
    }

    pub fn write_u8(&self, addr: PhysAddr, value: u8, privileged: bool) -> Result<()> {
        let eff = self.check(addr, privileged, Access::Write)?;
        self.mem.borrow_mut().write_u8(addr, value, eff, true)
    }

    pub fn write_u16(&self, addr: PhysAddr, value: u16, privileged: bool) -> Result<()> {
        let eff = self.check(addr, privileged, Access::Write)?;
        self.mem.borrow_mut().write_u16(addr, value, eff, true)
    }

    pub fn write_u32(&self, addr: PhysAddr, value: u32, privileged: bool) -> Result<()> {
        let eff = self.check(addr, privileged, Access::Write)?;
        self.mem.borrow_mut().write_u32(addr, value, eff, true)
    }
}

/// Adapts an [`Mmu`] plus the calling core's current privilege level to the
/// [`WordBackend`] trait the data cache writes through to.
pub struct CoreMemBackend<'a> {
    pub mmu: &'a Mmu,
    pub privileged: bool,
}

impl WordBackend for CoreMemBackend<'_> {
    fn read_u32_raw(&mut self, addr: u32) -> Result<u32> {
        self.mmu.read_u32(PhysAddr(addr), self.privileged)
    }

    fn write_u32_raw(&mut self, addr: u32, value: u32) -> Result<()> {
        self.mmu.write_u32(PhysAddr(addr), value, self.privileged)
    }

    fn is_cacheable(&mut self, addr: u32) -> Result<bool> {
        self.mmu.is_cacheable(PhysAddr(addr))
    }
}
