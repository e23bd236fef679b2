//! The `[memory]`/`[cpu]`/`[machine]` sections the core consumes, loaded from
//! a TOML file the way the teacher's binary loads its own run configuration.

use serde::Deserialize;

fn default_ivt_address() -> u32 {
    0x0000_0000
}

fn default_pt_address() -> u32 {
    0x0000_0100
}

fn default_inst_cache() -> usize {
    256
}

fn default_data_cache_size() -> usize {
    512
}

fn default_true() -> bool {
    true
}

fn default_cpus() -> usize {
    1
}

fn default_cores() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(rename = "force-aligned-access", default)]
    pub force_aligned_access: bool,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig { force_aligned_access: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuConfig {
    #[serde(rename = "ivt-address", default = "default_ivt_address")]
    pub ivt_address: u32,
    #[serde(rename = "pt-address", default = "default_pt_address")]
    pub pt_address: u32,
    #[serde(rename = "inst-cache", default = "default_inst_cache")]
    pub inst_cache: usize,
    #[serde(rename = "data-cache-enabled", default = "default_true")]
    pub data_cache_enabled: bool,
    #[serde(rename = "data-cache-size", default = "default_data_cache_size")]
    pub data_cache_size: usize,
    #[serde(rename = "data-cache-line", default)]
    pub data_cache_line: Option<usize>,
    #[serde(rename = "data-cache-assoc", default)]
    pub data_cache_assoc: Option<usize>,
    #[serde(rename = "math-coprocessor", default)]
    pub math_coprocessor: bool,
    #[serde(rename = "control-coprocessor", default)]
    pub control_coprocessor: bool,
    #[serde(rename = "check-frames", default)]
    pub check_frames: bool,
}

impl Default for CpuConfig {
    fn default() -> CpuConfig {
        CpuConfig {
            ivt_address: default_ivt_address(),
            pt_address: default_pt_address(),
            inst_cache: default_inst_cache(),
            data_cache_enabled: true,
            data_cache_size: default_data_cache_size(),
            data_cache_line: None,
            data_cache_assoc: None,
            math_coprocessor: false,
            control_coprocessor: false,
            check_frames: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_cpus")]
    pub cpus: usize,
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(rename = "interrupt-routines", default)]
    pub interrupt_routines: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig { cpus: default_cpus(), cores: default_cores(), interrupt_routines: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub machine: MachineConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_all_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.cpu.pt_address, 0x100);
        assert_eq!(cfg.cpu.ivt_address, 0);
        assert_eq!(cfg.machine.cpus, 1);
        assert_eq!(cfg.machine.cores, 1);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let toml = r#"
            [machine]
            cpus = 2
            cores = 4

            [cpu]
            pt-address = 0x2000
            math-coprocessor = true
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.machine.cpus, 2);
        assert_eq!(cfg.machine.cores, 4);
        assert_eq!(cfg.cpu.pt_address, 0x2000);
        assert!(cfg.cpu.math_coprocessor);
    }
}
