//! The 16-bit I/O port space. Concrete device models are out of scope; this
//! defines only the contract a `Port` backend must satisfy and the table that
//! maps port numbers to one.

use std::collections::HashMap;

use duckyvm_error::{Result, VmError};

/// One memory-mapped-I/O-style device endpoint. `is_protected` ports refuse
/// unprivileged access with an access violation, matching a protected page.
pub trait Port {
    fn read_u8(&mut self, port: u16) -> Result<u8>;
    fn read_u16(&mut self, port: u16) -> Result<u16>;
    fn read_u32(&mut self, port: u16) -> Result<u32>;
    fn write_u8(&mut self, port: u16, value: u8) -> Result<()>;
    fn write_u16(&mut self, port: u16, value: u16) -> Result<()>;
    fn write_u32(&mut self, port: u16, value: u32) -> Result<()>;
    fn is_protected(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct PortTable {
    ports: HashMap<u16, Box<dyn Port>>,
}

impl PortTable {
    pub fn new() -> PortTable {
        PortTable { ports: HashMap::new() }
    }

    pub fn register_port(&mut self, port: u16, device: Box<dyn Port>) -> Result<()> {
        if self.ports.contains_key(&port) {
            return Err(VmError::invalid_resource(format!("port {:#x} already registered", port)));
        }
        self.ports.insert(port, device);
        Ok(())
    }

    pub fn unregister_port(&mut self, port: u16) {
        self.ports.remove(&port);
    }

    fn get(&mut self, port: u16, privileged: bool) -> Result<&mut Box<dyn Port>> {
        let dev = self
            .ports
            .get_mut(&port)
            .ok_or_else(|| VmError::invalid_resource(format!("unmapped port {:#x}", port)))?;
        if dev.is_protected() && !privileged {
            return Err(VmError::access_violation(format!(
                "unprivileged access to protected port {:#x}",
                port
            )));
        }
        Ok(dev)
    }

    pub fn read_u8(&mut self, port: u16, privileged: bool) -> Result<u8> {
        self.get(port, privileged)?.read_u8(port)
    }

    pub fn read_u16(&mut self, port: u16, privileged: bool) -> Result<u16> {
        self.get(port, privileged)?.read_u16(port)
    }

    pub fn read_u32(&mut self, port: u16, privileged: bool) -> Result<u32> {
        self.get(port, privileged)?.read_u32(port)
    }

    pub fn write_u8(&mut self, port: u16, value: u8, privileged: bool) -> Result<()> {
        self.get(port, privileged)?.write_u8(port, value)
    }

    pub fn write_u16(&mut self, port: u16, value: u16, privileged: bool) -> Result<()> {
        self.get(port, privileged)?.write_u16(port, value)
    }

    pub fn write_u32(&mut self, port: u16, value: u32, privileged: bool) -> Result<()> {
        self.get(port, privileged)?.write_u32(port, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(u32);
    impl Port for Echo {
        fn read_u8(&mut self, _port: u16) -> Result<u8> {
            Ok(self.0 as u8)
        }
        fn read_u16(&mut self, _port: u16) -> Result<u16> {
            Ok(self.0 as u16)
        }
        fn read_u32(&mut self, _port: u16) -> Result<u32> {
            Ok(self.0)
        }
        fn write_u8(&mut self, _port: u16, value: u8) -> Result<()> {
            self.0 = value as u32;
            Ok(())
        }
        fn write_u16(&mut self, _port: u16, value: u16) -> Result<()> {
            self.0 = value as u32;
            Ok(())
        }
        fn write_u32(&mut self, _port: u16, value: u32) -> Result<()> {
            self.0 = value;
            Ok(())
        }
        fn is_protected(&self) -> bool {
            true
        }
    }

    #[test]
    fn duplicate_registration_is_invalid_resource() {
        let mut table = PortTable::new();
        table.register_port(0x10, Box::new(Echo(0))).unwrap();
        assert!(table.register_port(0x10, Box::new(Echo(0))).is_err());
    }

    #[test]
    fn unmapped_port_is_invalid_resource() {
        let mut table = PortTable::new();
        assert!(table.read_u8(0x99, true).is_err());
    }

    #[test]
    fn unprivileged_access_to_protected_port_is_access_violation() {
        let mut table = PortTable::new();
        table.register_port(0x10, Box::new(Echo(7))).unwrap();
        assert!(table.read_u8(0x10, false).is_err());
        assert_eq!(table.read_u8(0x10, true).unwrap(), 7);
    }
}
