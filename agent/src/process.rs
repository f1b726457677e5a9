//! Target process metadata
//!
//! Facts about the instrumented process that are discovered elsewhere and
//! handed to the probes read-only: module versions, the allocation region
//! reserved for the programs, the calling convention and function offsets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

/// How the target passes function arguments
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    /// Arguments in registers (Go >= 1.17)
    #[default]
    Registers,
    /// Arguments on the stack
    Stack,
}

/// Memory region reserved in the target for the kernel programs
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationDetails {
    /// First usable address
    pub start_addr: u64,
    /// One past the last usable address
    pub end_addr: u64,
    /// Number of CPUs the region is divided between
    pub num_cpu: u64,
}

/// Offsets of one function inside the target executable
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FuncOffsets {
    /// Fully-qualified symbol name
    pub name: String,
    /// File offset of the function entry
    pub offset: u64,
    /// File offsets of every return instruction
    #[serde(default)]
    pub return_offsets: Vec<u64>,
}

/// Everything known about the instrumented process
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TargetDetails {
    /// Process ID of the target
    pub pid: i32,
    /// Path of the target executable
    pub exe_path: PathBuf,
    /// Resolved module versions, keyed by module path ("std" for the runtime)
    #[serde(default)]
    pub libraries: HashMap<String, String>,
    /// Allocation region, absent when it could not be set up for the target
    #[serde(default)]
    pub allocation_details: Option<AllocationDetails>,
    /// Argument passing convention
    #[serde(default)]
    pub abi: CallingConvention,
    /// Offsets of the functions that may be instrumented
    #[serde(default)]
    pub functions: Vec<FuncOffsets>,
}

impl TargetDetails {
    /// Load target details from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open target details: {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse target details: {:?}", path))
    }

    /// Whether arguments are passed in registers
    pub fn is_registers_abi(&self) -> bool {
        self.abi == CallingConvention::Registers
    }

    /// Version of the module at `mod_path`, if the target loaded it
    pub fn library_version(&self, mod_path: &str) -> Option<&str> {
        self.libraries.get(mod_path).map(String::as_str)
    }

    fn function(&self, name: &str) -> Option<&FuncOffsets> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Entry offset of function `name`
    pub fn function_offset(&self, name: &str) -> Option<u64> {
        self.function(name).map(|f| f.offset)
    }

    /// Return instruction offsets of function `name`
    pub fn function_return_offsets(&self, name: &str) -> Option<&[u64]> {
        self.function(name).map(|f| f.return_offsets.as_slice())
    }
}

/// Handle on the executable probes get attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub path: PathBuf,
}

impl Executable {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}
