use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Supported guest architectures. QEMU flags and BIOS requirements differ
/// per architecture (see [`crate::core::invocation`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn qemu_binary(self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
        }
    }
}

/// Static input describing one VM, loaded from the instance-spec JSON file
/// named as the CLI's positional argument.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    pub arch: Arch,
    pub image: String,
    pub label: String,
    #[serde(rename = "timeout-seconds")]
    pub timeout_seconds: u64,
    #[serde(rename = "cpu-cores")]
    pub cpu_cores: u32,
    pub ram: u32,
    #[serde(rename = "root-disk")]
    pub root_disk: String,
}

impl InstanceSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        let spec: InstanceSpec =
            serde_json::from_str(&contents).map_err(|source| Error::ParseConfig {
                path: path.to_path_buf(),
                source,
            })?;

        spec.validate(path)?;
        Ok(spec)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "`label` must not be empty".to_string(),
            });
        }
        if self.timeout_seconds == 0 {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "`timeout-seconds` must be greater than zero".to_string(),
            });
        }
        if self.cpu_cores == 0 {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "`cpu-cores` must be greater than zero".to_string(),
            });
        }
        if self.ram == 0 {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "`ram` must be greater than zero".to_string(),
            });
        }
        if self.root_disk.trim().is_empty() {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "`root-disk` must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
