//! Struct field identifiers and the offset index
//!
//! The kernel programs read Go structures by byte offset. Those offsets move
//! between module versions, so each field is named by an [`Id`] and its
//! offset is looked up per version in an [`Index`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, fs::File, io::BufReader, path::Path};

/// Identifies one field of one struct of one module
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Id {
    /// Module path owning the struct ("std" for the standard library)
    pub mod_path: String,
    /// Package path of the struct
    pub pkg_path: String,
    /// Struct name
    pub struct_name: String,
    /// Field name
    pub field: String,
}

impl Id {
    pub fn new(mod_path: &str, pkg_path: &str, struct_name: &str, field: &str) -> Self {
        Self {
            mod_path: mod_path.to_string(),
            pkg_path: pkg_path.to_string(),
            struct_name: struct_name.to_string(),
            field: field.to_string(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.pkg_path, self.struct_name, self.field)
    }
}

/// Offset of a field, valid for a set of versions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VersionedOffset {
    pub versions: Vec<String>,
    pub offset: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Entry {
    id: Id,
    offsets: Vec<VersionedOffset>,
}

/// Known field offsets across module versions
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(transparent)]
pub struct Index {
    entries: Vec<Entry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an index from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open offsets: {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse offsets: {:?}", path))
    }

    /// Record `offset` for `id` at `version`
    pub fn put(&mut self, id: Id, version: &str, offset: u64) {
        let entry = match self.entries.iter_mut().position(|e| e.id == id) {
            Some(i) => &mut self.entries[i],
            None => {
                self.entries.push(Entry {
                    id,
                    offsets: Vec::new(),
                });
                let last = self.entries.len() - 1;
                &mut self.entries[last]
            }
        };

        for o in entry.offsets.iter_mut() {
            o.versions.retain(|v| v != version);
        }
        entry.offsets.retain(|o| !o.versions.is_empty());

        match entry.offsets.iter_mut().find(|o| o.offset == offset) {
            Some(o) => o.versions.push(version.to_string()),
            None => entry.offsets.push(VersionedOffset {
                versions: vec![version.to_string()],
                offset,
            }),
        }
    }

    /// Offset of `id` at `version`
    pub fn get(&self, id: &Id, version: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| &e.id == id)?
            .offsets
            .iter()
            .find(|o| o.versions.iter().any(|v| v == version))
            .map(|o| o.offset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
