use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use duckyvm_error::{Result, VmError};
use duckyvm_rangeset::{InclusiveRange, RangeSet};
use duckyvm_types::{PageFlags, PhysAddr, PAGE_SIZE, SEGMENT_PAGES};

use crate::page::{Access, Page};

struct MmapArea {
    first_page: u32,
    page_count: u32,
}

/// Owns every physical page in the machine and is the only component that touches
/// raw bytes. CPU cores never call this directly; they go through their MMU
/// (`duckyvm-cpu`), which resolves permissions from the paged PTE table before
/// delegating here.
pub struct MemoryController {
    total_pages: u32,
    pages: Vec<Option<Page>>,
    free_pages: RangeSet,
    mmap_areas: Vec<MmapArea>,
    force_aligned_access: bool,
}

impl MemoryController {
    pub fn new(total_segments: u32, force_aligned_access: bool) -> MemoryController {
        let total_pages = total_segments * SEGMENT_PAGES;
        let mut free_pages = RangeSet::new();
        if total_pages > 0 {
            free_pages.insert(InclusiveRange::new(0, (total_pages - 1) as u64));
        }
        MemoryController {
            total_pages,
            pages: (0..total_pages).map(|_| None).collect(),
            free_pages,
            mmap_areas: Vec::new(),
            force_aligned_access,
        }
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Allocate an entire free segment, anonymous and zero-filled.
    pub fn alloc_segment(&mut self) -> Result<u32> {
        let start = self
            .free_pages
            .allocate(SEGMENT_PAGES as u64, SEGMENT_PAGES as u64)
            .map_err(|_| VmError::invalid_resource("no free segment"))?;
        for idx in start as u32..start as u32 + SEGMENT_PAGES {
            self.pages[idx as usize] = Some(Page::anonymous(PageFlags::new()));
        }
        Ok(start as u32 / SEGMENT_PAGES)
    }

    /// Allocate a single anonymous page, optionally confined to segment `seg`.
    pub fn alloc_page(&mut self, seg: Option<u32>) -> Result<u32> {
        self.alloc_pages(seg, 1)
    }

    /// Allocate `n` contiguous anonymous pages.
    pub fn alloc_pages(&mut self, seg: Option<u32>, n: u32) -> Result<u32> {
        let idx = if let Some(seg) = seg {
            let first = seg as u64 * SEGMENT_PAGES as u64;
            let last = first + SEGMENT_PAGES as u64 - 1;
            self.free_pages
                .allocate_specific(InclusiveRange::new(first, first + n as u64 - 1))
                .map(|_| first)
                .or_else(|_| self.alloc_within(first, last, n))
                .map_err(|_| VmError::invalid_resource("segment exhausted"))?
        } else {
            self.free_pages
                .allocate(n as u64, 1)
                .map_err(|_| VmError::invalid_resource("out of physical pages"))?
        };
        for i in 0..n {
            self.pages[idx as usize + i as usize] = Some(Page::anonymous(PageFlags::new()));
        }
        Ok(idx as u32)
    }

    fn alloc_within(&mut self, first: u64, last: u64, n: u32) -> std::result::Result<u64, ()> {
        for start in first..=last.saturating_sub(n as u64 - 1) {
            if self
                .free_pages
                .allocate_specific(InclusiveRange::new(start, start + n as u64 - 1))
                .is_ok()
            {
                return Ok(start);
            }
        }
        Err(())
    }

    /// Claim a caller-chosen page index (used to place the IVT, PT, and binaries at
    /// fixed addresses).
    pub fn alloc_specific(&mut self, idx: u32) -> Result<()> {
        self.free_pages
            .allocate_specific(InclusiveRange::new(idx as u64, idx as u64))
            .map_err(|_| VmError::invalid_resource(format!("page {} already allocated", idx)))?;
        self.pages[idx as usize] = Some(Page::anonymous(PageFlags::new()));
        Ok(())
    }

    pub fn free_page(&mut self, idx: u32) -> Result<()> {
        if self.pages[idx as usize].take().is_none() {
            return Err(VmError::invalid_resource(format!("page {} not allocated", idx)));
        }
        self.free_pages
            .insert(InclusiveRange::new(idx as u64, idx as u64));
        Ok(())
    }

    pub fn get_page(&self, idx: u32) -> Option<&Page> {
        self.pages.get(idx as usize)?.as_ref()
    }

    pub fn get_page_mut(&mut self, idx: u32) -> Option<&mut Page> {
        self.pages.get_mut(idx as usize)?.as_mut()
    }

    /// Map part of a file into a run of physical pages starting at `addr`.
    pub fn mmap_area(
        &mut self,
        path: &str,
        addr: PhysAddr,
        size: u32,
        offset: u64,
        access: &str,
        shared: bool,
    ) -> Result<()> {
        if !addr.is_page_aligned() {
            return Err(VmError::access_violation("mmap address not page aligned"));
        }
        let page_count = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let first_page = addr.page_index();
        self.free_pages
            .allocate_specific(InclusiveRange::new(
                first_page as u64,
                first_page as u64 + page_count as u64 - 1,
            ))
            .map_err(|_| VmError::access_violation("mmap region overlaps existing mapping"))?;

        let mut file = File::open(path)
            .map_err(|e| VmError::invalid_resource(format!("cannot open {}: {}", path, e)))?;
        let flags = PageFlags::from_access_str(access);
        for i in 0..page_count {
            let file_offset = offset + (i as u64) * PAGE_SIZE as u64;
            let mut buf = vec![0u8; PAGE_SIZE as usize];
            file.seek(SeekFrom::Start(file_offset))
                .map_err(|e| VmError::invalid_resource(e.to_string()))?;
            let _ = file.read(&mut buf);
            let page = Page::file_mapped(flags, buf, path.to_string(), file_offset, shared);
            self.pages[(first_page + i) as usize] = Some(page);
        }
        self.mmap_areas.push(MmapArea { first_page, page_count });
        Ok(())
    }

    pub fn unmmap_area(&mut self, addr: PhysAddr) -> Result<()> {
        let first_page = addr.page_index();
        let pos = self
            .mmap_areas
            .iter()
            .position(|a| a.first_page == first_page)
            .ok_or_else(|| VmError::invalid_resource("no mmap area at that address"))?;
        let area = self.mmap_areas.remove(pos);
        for i in 0..area.page_count {
            self.pages[(first_page + i) as usize] = None;
        }
        self.free_pages.insert(InclusiveRange::new(
            first_page as u64,
            first_page as u64 + area.page_count as u64 - 1,
        ));
        Ok(())
    }

    fn check_alignment(&self, addr: PhysAddr, width: u32) -> Result<()> {
        if self.force_aligned_access && width > 1 && addr.0 % width != 0 {
            return Err(VmError::access_violation(format!(
                "unaligned {}-byte access at {:#x}",
                width, addr.0
            )));
        }
        Ok(())
    }

    fn page_for(&self, addr: PhysAddr) -> Result<&Page> {
        self.get_page(addr.page_index())
            .ok_or_else(|| VmError::access_violation(format!("page {} not allocated", addr.page_index())))
    }

    fn page_for_mut(&mut self, addr: PhysAddr) -> Result<&mut Page> {
        let idx = addr.page_index();
        self.pages
            .get_mut(idx as usize)
            .and_then(|p| p.as_mut())
            .ok_or_else(|| VmError::access_violation(format!("page {} not allocated", idx)))
    }

    pub fn read_u8(&self, addr: PhysAddr, privileged: bool) -> Result<u8> {
        self.page_for(addr)?.read_u8(addr.page_offset(), privileged)
    }

    pub fn write_u8(&mut self, addr: PhysAddr, value: u8, privileged: bool, dirty: bool) -> Result<()> {
        let offset = addr.page_offset();
        self.page_for_mut(addr)?.write_u8(offset, value, privileged, dirty)
    }

    pub fn read_u16(&self, addr: PhysAddr, privileged: bool) -> Result<u16> {
        self.check_alignment(addr, 2)?;
        let lo = self.read_u8(addr, privileged)? as u16;
        let hi = self.read_u8(addr.offset(1), privileged)? as u16;
        Ok(lo | (hi << 8))
    }

    pub fn write_u16(&mut self, addr: PhysAddr, value: u16, privileged: bool, dirty: bool) -> Result<()> {
        self.check_alignment(addr, 2)?;
        self.write_u8(addr, (value & 0xff) as u8, privileged, dirty)?;
        self.write_u8(addr.offset(1), (value >> 8) as u8, privileged, dirty)
    }

    pub fn read_u32(&self, addr: PhysAddr, privileged: bool) -> Result<u32> {
        self.check_alignment(addr, 4)?;
        let mut v = 0u32;
        for i in 0..4u32 {
            v |= (self.read_u8(addr.offset(i), privileged)? as u32) << (8 * i);
        }
        Ok(v)
    }

    pub fn write_u32(&mut self, addr: PhysAddr, value: u32, privileged: bool, dirty: bool) -> Result<()> {
        self.check_alignment(addr, 4)?;
        for i in 0..4u32 {
            self.write_u8(addr.offset(i), (value >> (8 * i)) as u8, privileged, dirty)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_segment_gives_zero_filled_pages() {
        let mut mc = MemoryController::new(1, false);
        let seg = mc.alloc_segment().unwrap();
        assert_eq!(seg, 0);
        assert!(mc.get_page(0).is_some());
        assert!(mc.get_page(SEGMENT_PAGES - 1).is_some());
    }

    #[test]
    fn round_trip_u32_through_privileged_writes() {
        let mut mc = MemoryController::new(1, false);
        mc.alloc_segment().unwrap();
        let addr = PhysAddr(8);
        mc.write_u32(addr, 0xdeadbeef, true, false).unwrap();
        assert_eq!(mc.read_u32(addr, true).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn forced_alignment_rejects_misaligned_word_access() {
        let mut mc = MemoryController::new(1, true);
        mc.alloc_segment().unwrap();
        assert!(mc.read_u32(PhysAddr(3), true).is_err());
    }

    #[test]
    fn unallocated_page_access_is_access_violation() {
        let mc = MemoryController::new(1, false);
        assert!(mc.read_u8(PhysAddr(0), true).is_err());
    }

    #[test]
    fn free_then_reallocate_page() {
        let mut mc = MemoryController::new(1, false);
        mc.alloc_specific(5).unwrap();
        mc.free_page(5).unwrap();
        assert!(mc.get_page(5).is_none());
        mc.alloc_specific(5).unwrap();
        assert!(mc.get_page(5).is_some());
    }
}
