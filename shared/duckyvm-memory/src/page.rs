use duckyvm_error::{Result, VmError};
use duckyvm_types::{PageFlags, PAGE_SIZE};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

#[derive(Debug)]
enum Backing {
    Anonymous(Vec<u8>),
    FileMapped {
        data: Vec<u8>,
        path: String,
        file_offset: u64,
        shared: bool,
    },
}

/// One physical page of backing storage plus the flags the Memory Controller's own
/// direct callers are checked against (independent of the MMU's PTE check, see
/// `duckyvm-cpu`'s MMU for the path CPU cores take).
#[derive(Debug)]
pub struct Page {
    pub flags: PageFlags,
    backing: Backing,
}

impl Page {
    pub fn anonymous(flags: PageFlags) -> Page {
        Page {
            flags,
            backing: Backing::Anonymous(vec![0u8; PAGE_SIZE as usize]),
        }
    }

    pub fn file_mapped(flags: PageFlags, data: Vec<u8>, path: String, file_offset: u64, shared: bool) -> Page {
        assert_eq!(data.len(), PAGE_SIZE as usize);
        Page {
            flags,
            backing: Backing::FileMapped {
                data,
                path,
                file_offset,
                shared,
            },
        }
    }

    pub fn is_file_mapped(&self) -> bool {
        matches!(self.backing, Backing::FileMapped { .. })
    }

    pub fn file_mapping(&self) -> Option<(&str, u64, bool)> {
        match &self.backing {
            Backing::FileMapped { path, file_offset, shared, .. } => {
                Some((path.as_str(), *file_offset, *shared))
            }
            Backing::Anonymous(_) => None,
        }
    }

    fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Anonymous(d) => d,
            Backing::FileMapped { data, .. } => data,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Anonymous(d) => d,
            Backing::FileMapped { data, .. } => data,
        }
    }

    /// Check this page's own {R,W,X} flags. Skipped entirely when `privileged` is
    /// true -- see the Memory Controller's module docs for when callers pass true.
    pub fn check_access(&self, privileged: bool, access: Access) -> Result<()> {
        if privileged {
            return Ok(());
        }
        let allowed = match access {
            Access::Read => self.flags.read(),
            Access::Write => self.flags.write(),
            Access::Execute => self.flags.execute(),
        };
        if allowed {
            Ok(())
        } else {
            Err(VmError::access_violation(format!(
                "page does not permit {:?}",
                access
            )))
        }
    }

    pub fn read_u8(&self, offset: u32, privileged: bool) -> Result<u8> {
        self.check_access(privileged, Access::Read)?;
        Ok(self.data()[offset as usize])
    }

    pub fn write_u8(&mut self, offset: u32, value: u8, privileged: bool, dirty: bool) -> Result<()> {
        self.check_access(privileged, Access::Write)?;
        self.data_mut()[offset as usize] = value;
        if dirty {
            self.flags.set_dirty(true);
        }
        Ok(())
    }

    /// Raw read bypassing permission checks entirely, used by the data cache to
    /// write back evicted lines and by mmap setup to seed file contents.
    pub fn raw_read_u8(&self, offset: u32) -> u8 {
        self.data()[offset as usize]
    }

    pub fn raw_write_u8(&mut self, offset: u32, value: u8) {
        self.data_mut()[offset as usize] = value;
    }

    pub fn clear(&mut self) {
        let stack = self.flags.stack();
        for b in self.data_mut().iter_mut() {
            *b = 0;
        }
        self.flags.reset();
        self.flags.set_stack(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_bypasses_flag_check() {
        let page = Page::anonymous(PageFlags::new());
        assert!(page.read_u8(0, true).is_ok());
        assert!(page.read_u8(0, false).is_err());
    }

    #[test]
    fn write_sets_dirty_only_when_asked() {
        let mut flags = PageFlags::new();
        flags.set_write(true);
        let mut page = Page::anonymous(flags);
        page.write_u8(0, 7, false, false).unwrap();
        assert!(!page.flags.dirty());
        page.write_u8(1, 8, false, true).unwrap();
        assert!(page.flags.dirty());
    }

    #[test]
    fn clear_zeroes_data_and_preserves_stack_marker() {
        let mut flags = PageFlags::new();
        flags.set_write(true);
        flags.set_stack(true);
        let mut page = Page::anonymous(flags);
        page.write_u8(3, 0xab, true, false).unwrap();
        page.clear();
        assert_eq!(page.raw_read_u8(3), 0);
        assert!(page.flags.stack());
        assert!(!page.flags.write());
    }
}
