//! Entry point: load a `Config` from a TOML file, optionally load a flat
//! binary image into memory, boot every core, and run the reactor to
//! completion. Flag parsing and sub-commands are explicitly out of scope; the
//! first two positional arguments are a config path and an optional image
//! path.

use std::env;
use std::fs;

use anyhow::{Context, Result};
use duckyvm_machine::{Config, Machine};

const DEFAULT_MEMORY_SEGMENTS: u32 = 4;
const DEFAULT_IRQ_LINES: usize = 16;
const DEFAULT_STACK_STRIDE: u32 = 0x1000;

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
            Config::from_toml_str(&text).with_context(|| format!("parsing config {}", path))
        }
        None => Ok(Config::default()),
    }
}

fn load_image(machine: &Machine, path: &str, load_at: u32) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("reading image {}", path))?;
    for (i, byte) in bytes.iter().enumerate() {
        let addr = load_at.wrapping_add(i as u32);
        machine
            .memory()
            .borrow_mut()
            .write_u8(duckyvm_types::PhysAddr(addr), *byte, true, false)
            .with_context(|| format!("loading image byte at {:#x}", addr))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let config_path = args.next();
    let image_path = args.next();

    let config = load_config(config_path.as_deref())?;
    let mut machine = Machine::new(config, DEFAULT_MEMORY_SEGMENTS, DEFAULT_IRQ_LINES);
    machine.memory().borrow_mut().alloc_segment()?;

    let entry_point = 0u32;
    if let Some(path) = image_path {
        load_image(&machine, &path, entry_point)?;
    }

    let stack_top = machine.memory().borrow().total_pages() * duckyvm_types::PAGE_SIZE;
    machine.boot(entry_point, stack_top, DEFAULT_STACK_STRIDE);
    machine.run();

    for (i, code) in machine.exit_codes().into_iter().enumerate() {
        log::info!(target: "duckyvm", "core {} exit code: {:?}", i, code);
    }

    Ok(())
}
