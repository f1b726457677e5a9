//! Constants injected into probe programs
//!
//! A [`Const`] describes a value the kernel program needs but that depends
//! on the target: where a struct field lives, which calling convention is in
//! use, and so on. Each one is resolved against [`TargetDetails`] when the
//! probe is loaded.

use crate::{
    error::Errors,
    inject::{InjectOption, Value},
    process::TargetDetails,
    structfield::Id,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstError {
    #[error("unknown module version: {0}")]
    UnknownModuleVersion(String),
    #[error("no allocation details")]
    NoAllocationDetails,
}

/// A constant that needs to be injected into an eBPF program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Const {
    /// Byte offset of a struct field, written to `key`. The offset is looked
    /// up for the version of the owning module the target loaded.
    StructField { key: String, id: Id },
    /// The allocation region reserved in the target
    Allocation,
    /// Whether the target passes arguments in registers
    RegistersAbi,
    /// A generic key-value pair.
    ///
    /// Prefer the other variants where they apply; they carry
    /// version-specific resolution.
    KeyVal { key: String, value: Value },
}

impl Const {
    pub fn struct_field(key: &str, id: Id) -> Self {
        Const::StructField {
            key: key.to_string(),
            id,
        }
    }

    pub fn key_val(key: &str, value: Value) -> Self {
        Const::KeyVal {
            key: key.to_string(),
            value,
        }
    }

    /// Resolve against `td`
    pub fn inject_option(&self, td: &TargetDetails) -> Result<InjectOption, ConstError> {
        match self {
            Const::StructField { key, id } => {
                let version = td
                    .library_version(&id.mod_path)
                    .ok_or_else(|| ConstError::UnknownModuleVersion(id.mod_path.clone()))?;
                Ok(InjectOption::Offset {
                    key: key.clone(),
                    id: id.clone(),
                    version: version.to_string(),
                })
            }
            Const::Allocation => td
                .allocation_details
                .map(InjectOption::AllocationDetails)
                .ok_or(ConstError::NoAllocationDetails),
            Const::RegistersAbi => Ok(InjectOption::RegistersAbi(td.is_registers_abi())),
            Const::KeyVal { key, value } => Ok(InjectOption::KeyValue {
                key: key.clone(),
                value: *value,
            }),
        }
    }
}

/// Outcome of resolving a [`ConstSet`]
#[derive(Debug, Default)]
pub struct Resolution {
    /// Options of every constant that resolved, in declaration order
    pub options: Vec<InjectOption>,
    /// Every failure, in declaration order
    pub errors: Vec<ConstError>,
}

impl Resolution {
    /// The options, or all the failures if there was any
    pub fn into_result(self) -> Result<Vec<InjectOption>, Errors<ConstError>> {
        match Errors::join(self.errors) {
            Some(errors) => Err(errors),
            None => Ok(self.options),
        }
    }
}

/// Ordered constants of one probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstSet(Vec<Const>);

impl ConstSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, c: Const) {
        self.0.push(c);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Const> {
        self.0.iter()
    }

    /// Resolve every constant; a failure does not stop the others
    pub fn resolve(&self, td: &TargetDetails) -> Resolution {
        let mut res = Resolution::default();
        for c in &self.0 {
            match c.inject_option(td) {
                Ok(opt) => res.options.push(opt),
                Err(e) => res.errors.push(e),
            }
        }
        res
    }
}

impl From<Vec<Const>> for ConstSet {
    fn from(consts: Vec<Const>) -> Self {
        Self(consts)
    }
}

impl FromIterator<Const> for ConstSet {
    fn from_iter<I: IntoIterator<Item = Const>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{AllocationDetails, CallingConvention};

    fn request_method() -> Id {
        Id::new("std", "net/http", "Request", "Method")
    }

    fn grpc_method() -> Id {
        Id::new("google.golang.org/grpc", "google.golang.org/grpc", "ClientConn", "target")
    }

    fn details() -> TargetDetails {
        let mut td = TargetDetails {
            pid: 7,
            abi: CallingConvention::Stack,
            ..Default::default()
        };
        td.libraries.insert("std".to_string(), "1.21.4".to_string());
        td
    }

    #[test]
    fn test_struct_field_known_module() {
        let opt = Const::struct_field("method_ptr_pos", request_method())
            .inject_option(&details())
            .unwrap();

        assert_eq!(
            opt,
            InjectOption::Offset {
                key: "method_ptr_pos".to_string(),
                id: request_method(),
                version: "1.21.4".to_string(),
            }
        );
    }

    #[test]
    fn test_struct_field_unknown_module() {
        let err = Const::struct_field("target_pos", grpc_method())
            .inject_option(&details())
            .unwrap_err();

        assert_eq!(
            err,
            ConstError::UnknownModuleVersion("google.golang.org/grpc".to_string())
        );
        assert_eq!(err.to_string(), "unknown module version: google.golang.org/grpc");
    }

    #[test]
    fn test_allocation() {
        let mut td = details();
        assert_eq!(
            Const::Allocation.inject_option(&td),
            Err(ConstError::NoAllocationDetails)
        );

        let alloc = AllocationDetails {
            start_addr: 0x7f00_0000,
            end_addr: 0x7f10_0000,
            num_cpu: 2,
        };
        td.allocation_details = Some(alloc);
        assert_eq!(
            Const::Allocation.inject_option(&td),
            Ok(InjectOption::AllocationDetails(alloc))
        );
    }

    #[test]
    fn test_registers_abi_follows_target() {
        let mut td = details();
        assert_eq!(
            Const::RegistersAbi.inject_option(&td),
            Ok(InjectOption::RegistersAbi(false))
        );

        td.abi = CallingConvention::Registers;
        assert_eq!(
            Const::RegistersAbi.inject_option(&td),
            Ok(InjectOption::RegistersAbi(true))
        );
    }

    #[test]
    fn test_key_val_verbatim() {
        let opt = Const::key_val("debug_level", Value::U8(3))
            .inject_option(&TargetDetails::default())
            .unwrap();

        assert_eq!(
            opt,
            InjectOption::KeyValue {
                key: "debug_level".to_string(),
                value: Value::U8(3),
            }
        );
    }

    #[test]
    fn test_resolve_collects_every_failure() {
        let set: ConstSet = vec![
            Const::struct_field("target_pos", grpc_method()),
            Const::RegistersAbi,
            Const::Allocation,
            Const::struct_field("method_ptr_pos", request_method()),
            Const::key_val("k", Value::Bool(true)),
        ]
        .into();

        let res = set.resolve(&details());

        assert_eq!(res.options.len(), 3);
        assert_eq!(
            res.errors,
            vec![
                ConstError::UnknownModuleVersion("google.golang.org/grpc".to_string()),
                ConstError::NoAllocationDetails,
            ]
        );

        let errs = res.into_result().unwrap_err();
        assert_eq!(
            errs.to_string(),
            "unknown module version: google.golang.org/grpc\nno allocation details"
        );
    }

    #[test]
    fn test_resolve_all_ok() {
        let set: ConstSet = [Const::RegistersAbi, Const::key_val("k", Value::U64(1))]
            .into_iter()
            .collect();

        let opts = set.resolve(&details()).into_result().unwrap();
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0], InjectOption::RegistersAbi(false));
    }

    #[test]
    fn test_resolve_does_not_touch_target() {
        let td = details();
        let before = format!("{:?}", td);

        let _ = ConstSet::from(vec![Const::Allocation, Const::RegistersAbi]).resolve(&td);

        assert_eq!(format!("{:?}", td), before);
    }
}
