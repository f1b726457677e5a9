//! Program specifications and object loading
//!
//! A [`CollectionSpec`] is the not-yet-loaded kernel program: its bytecode
//! plus the read-only globals that get patched in before the verifier sees
//! it. [`load_collection`] turns a spec into a live [`Bpf`] object.

use crate::inject::Value;
use anyhow::{Context, Result};
use aya::{Bpf, BpfLoader};
use log::{debug, info};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Bytecode and globals of a kernel program, before loading
#[derive(Debug, Clone, Default)]
pub struct CollectionSpec {
    /// ELF object produced by the kernel-side build
    pub bytecode: Vec<u8>,
    /// Read-only globals to write before loading, by symbol name
    pub globals: BTreeMap<String, Value>,
}

impl CollectionSpec {
    pub fn new(bytecode: Vec<u8>) -> Self {
        Self {
            bytecode,
            globals: BTreeMap::new(),
        }
    }

    /// Read the program object from `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytecode = std::fs::read(path)
            .with_context(|| format!("Failed to read eBPF object file: {:?}", path))?;
        Ok(Self::new(bytecode))
    }

    /// Set global `name`, returning the previous value if any
    pub fn set_global(&mut self, name: &str, value: Value) -> Option<Value> {
        self.globals.insert(name.to_string(), value)
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }
}

/// Options applied when loading a [`CollectionSpec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOptions {
    /// Directory on the bpf filesystem pinned maps are scoped to
    pub pin_path: PathBuf,
}

/// Load `spec` into the kernel
///
/// Every global must exist in the object. Maps declared as pinned are pinned
/// below `opts.pin_path`, which is created if missing.
pub fn load_collection(spec: &CollectionSpec, opts: &CollectionOptions) -> Result<Bpf> {
    std::fs::create_dir_all(&opts.pin_path)
        .with_context(|| format!("Failed to create pin path: {:?}", opts.pin_path))?;

    let encoded: Vec<(&str, Vec<u8>)> = spec
        .globals
        .iter()
        .map(|(name, value)| (name.as_str(), value.to_le_bytes()))
        .collect();

    let mut loader = BpfLoader::new();
    loader.map_pin_path(&opts.pin_path);
    for (name, bytes) in &encoded {
        debug!("Setting global {} ({} bytes)", name, bytes.len());
        loader.set_global(*name, bytes.as_slice(), true);
    }

    let ebpf = loader
        .load(&spec.bytecode)
        .context("Failed to load eBPF program")?;

    info!(
        "eBPF object loaded ({} globals, maps pinned under {:?})",
        encoded.len(),
        opts.pin_path
    );

    Ok(ebpf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_global_replaces() {
        let mut spec = CollectionSpec::new(Vec::new());

        assert!(spec.set_global("total_cpus", Value::U64(4)).is_none());
        assert_eq!(spec.set_global("total_cpus", Value::U64(8)), Some(Value::U64(4)));
        assert_eq!(spec.global("total_cpus"), Some(&Value::U64(8)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = CollectionSpec::from_file("/nonexistent/probe.bpf.o").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read eBPF object file"));
    }
}
