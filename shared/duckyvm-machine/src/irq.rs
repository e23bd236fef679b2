//! IRQ source registration: one slot per configured IRQ line, mirroring
//! `ducky.machine.Machine.register_irq_source`.

use duckyvm_error::{Result, VmError};

/// A device capable of raising a hardware interrupt. Concrete device models
/// are out of scope; only the lifecycle contract the IRQ router needs is
/// defined here.
pub trait IrqSource {
    fn boot(&mut self) {}
    fn run(&mut self) {}
    fn halt(&mut self) {}
}

pub struct IrqSourceTable {
    slots: Vec<Option<Box<dyn IrqSource>>>,
}

impl IrqSourceTable {
    pub fn new(line_count: usize) -> IrqSourceTable {
        let mut slots = Vec::with_capacity(line_count);
        slots.resize_with(line_count, || None);
        IrqSourceTable { slots }
    }

    /// Register at `index` if given, else (with `reassign`) the first free
    /// slot; `InvalidResource` if the index is taken and `reassign` is false,
    /// or if no free slot exists.
    pub fn register_irq_source(
        &mut self,
        index: Option<usize>,
        reassign: bool,
        source: Box<dyn IrqSource>,
    ) -> Result<usize> {
        match index {
            Some(idx) => {
                if idx >= self.slots.len() {
                    return Err(VmError::invalid_resource(format!("no such irq line {}", idx)));
                }
                if self.slots[idx].is_some() {
                    if !reassign {
                        return Err(VmError::invalid_resource(format!("irq line {} already taken", idx)));
                    }
                    return self.first_free().map(|free| {
                        self.slots[free] = Some(source);
                        free
                    });
                }
                self.slots[idx] = Some(source);
                Ok(idx)
            }
            None => {
                let free = self.first_free()?;
                self.slots[free] = Some(source);
                Ok(free)
            }
        }
    }

    fn first_free(&self) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| VmError::invalid_resource("no free irq line"))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Box<dyn IrqSource>> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn boot_all(&mut self) {
        for s in self.slots.iter_mut().flatten() {
            s.boot();
        }
    }

    pub fn halt_all(&mut self) {
        for s in self.slots.iter_mut().flatten() {
            s.halt();
        }
    }
}
