//! Machine composition: configuration, the port/IRQ tables, and the `Machine`
//! struct that owns every CPU container and drives the reactor.

pub mod config;
pub mod irq;
pub mod machine;
pub mod ports;

pub use config::Config;
pub use irq::{IrqSource, IrqSourceTable};
pub use machine::Machine;
pub use ports::{Port, PortTable};
