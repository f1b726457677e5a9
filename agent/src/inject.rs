//! Constant injection
//!
//! Resolved constants arrive here as [`InjectOption`]s and are written into
//! a [`CollectionSpec`] as globals before the program is loaded.

use crate::{
    bpf::CollectionSpec,
    process::AllocationDetails,
    structfield::{self, Id},
};
use log::trace;
use probe_common::constants::{
    GLOBAL_END_ADDR, GLOBAL_IS_REGISTERS_ABI, GLOBAL_START_ADDR, GLOBAL_TOTAL_CPUS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value that can be written into a program global
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U32(u32),
    U64(u64),
    I64(i64),
}

impl Value {
    /// Little-endian encoding, sized to the kernel-side type
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Value::Bool(b) => vec![b as u8],
            Value::U8(v) => vec![v],
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
        }
    }
}

/// A resolved constant waiting to be written into a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOption {
    /// Byte offset of `id` at module `version`, written to `key`
    Offset {
        key: String,
        id: Id,
        version: String,
    },
    /// The target's allocation region
    AllocationDetails(AllocationDetails),
    /// Whether the target passes arguments in registers
    RegistersAbi(bool),
    /// An arbitrary global
    KeyValue { key: String, value: Value },
}

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("unknown offset for {id} at version {version}")]
    UnknownOffset { id: Id, version: String },
    #[error("constant {0} injected more than once")]
    Duplicate(String),
}

/// Write every option of `opts` into `spec`
///
/// Struct field offsets are looked up in `index`. Stops at the first
/// failure; `spec` may then hold some of the globals.
pub fn constants(
    spec: &mut CollectionSpec,
    index: &structfield::Index,
    opts: Vec<InjectOption>,
) -> Result<(), InjectError> {
    for opt in opts {
        match opt {
            InjectOption::Offset { key, id, version } => {
                let offset = index
                    .get(&id, &version)
                    .ok_or(InjectError::UnknownOffset { id, version })?;
                set(spec, &key, Value::U64(offset))?;
            }
            InjectOption::AllocationDetails(details) => {
                set(spec, GLOBAL_START_ADDR, Value::U64(details.start_addr))?;
                set(spec, GLOBAL_END_ADDR, Value::U64(details.end_addr))?;
                set(spec, GLOBAL_TOTAL_CPUS, Value::U64(details.num_cpu))?;
            }
            InjectOption::RegistersAbi(registers) => {
                set(spec, GLOBAL_IS_REGISTERS_ABI, Value::Bool(registers))?;
            }
            InjectOption::KeyValue { key, value } => set(spec, &key, value)?,
        }
    }
    Ok(())
}

fn set(spec: &mut CollectionSpec, key: &str, value: Value) -> Result<(), InjectError> {
    trace!("Injecting {} = {:?}", key, value);
    match spec.set_global(key, value) {
        Some(_) => Err(InjectError::Duplicate(key.to_string())),
        None => Ok(()),
    }
}
