//! Pin paths on the bpf filesystem
//!
//! Maps are pinned below a directory named after the target process so they
//! are shared by every probe of that target and go away with it.

use crate::process::TargetDetails;
use log::debug;
use std::{
    io,
    path::{Path, PathBuf},
};

/// Mount point of the bpf filesystem
pub const BPF_FS_ROOT: &str = "/sys/fs/bpf";

/// Directory maps of the target are pinned below
pub fn path_for_target(td: &TargetDetails) -> PathBuf {
    path_for_pid(Path::new(BPF_FS_ROOT), td.pid)
}

fn path_for_pid(root: &Path, pid: i32) -> PathBuf {
    root.join(pid.to_string())
}

/// Remove the pin directory of the target, if present
pub fn cleanup(td: &TargetDetails) -> io::Result<()> {
    remove_pins(&path_for_target(td))
}

fn remove_pins(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed pinned maps under {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
