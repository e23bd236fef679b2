use duckyvm_error::Result;
use duckyvm_types::{PhysAddr, PteFlags};

use crate::controller::MemoryController;

/// Read the page table entry for physical page `page_index`, stored as one byte at
/// `pt_address + page_index`. PT access is always privileged: the table is system
/// state, never touched directly by unprivileged code.
pub fn read_pte(mem: &MemoryController, pt_address: PhysAddr, page_index: u32) -> Result<PteFlags> {
    let byte = mem.read_u8(pt_address.offset(page_index), true)?;
    Ok(PteFlags::from_byte(byte))
}

pub fn write_pte(
    mem: &mut MemoryController,
    pt_address: PhysAddr,
    page_index: u32,
    pte: PteFlags,
) -> Result<()> {
    mem.write_u8(pt_address.offset(page_index), pte.to_byte(), true, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_pte() {
        let mut mem = MemoryController::new(1, false);
        mem.alloc_segment().unwrap();
        let pt_address = PhysAddr(0);
        let mut pte = PteFlags::default();
        pte.set_read(true);
        pte.set_execute(true);
        write_pte(&mut mem, pt_address, 3, pte).unwrap();
        let read_back = read_pte(&mem, pt_address, 3).unwrap();
        assert!(read_back.read());
        assert!(read_back.execute());
        assert!(!read_back.write());
    }
}
