//! Kernel handles and uprobe attachment
//!
//! Everything a probe acquires from the kernel is tracked as a [`Closer`]
//! so it can be released on shutdown.

use crate::process::{Executable, TargetDetails};
use anyhow::{anyhow, Context, Result};
use aya::{
    programs::{links::Link, ProgramError, UProbe},
    Bpf,
};
use log::{debug, warn};

/// A resource that must be released explicitly
pub trait Closer: Send {
    /// Release the resource. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// A uprobe attached to the target; detached on [`Closer::close`]
pub struct UprobeLink {
    name: String,
    link: Option<aya::programs::uprobe::UProbeLink>,
}

impl Closer for UprobeLink {
    fn close(&mut self) -> Result<()> {
        if let Some(link) = self.link.take() {
            debug!("Detaching uprobe {}", self.name);
            link.detach()
                .with_context(|| format!("Failed to detach uprobe {}", self.name))?;
        }
        Ok(())
    }
}

/// Attach program `prog_name` at file `offset` of `exec`, for the target
/// process only
///
/// The program is loaded on first use; later attachments of the same
/// program reuse it.
pub fn attach_uprobe(
    ebpf: &mut Bpf,
    prog_name: &str,
    exec: &Executable,
    td: &TargetDetails,
    offset: u64,
) -> Result<UprobeLink> {
    let program: &mut UProbe = ebpf
        .program_mut(prog_name)
        .with_context(|| format!("{} program not found in eBPF object", prog_name))?
        .try_into()
        .with_context(|| format!("Failed to get {} as UProbe", prog_name))?;

    match program.load() {
        Ok(()) => Ok(()),
        Err(ProgramError::AlreadyLoaded) => Ok(()),
        Err(e) => Err(e),
    }
    .with_context(|| format!("Failed to load {}", prog_name))?;

    let link_id = program
        .attach(None, offset, &exec.path, Some(td.pid))
        .with_context(|| format!("Failed to attach {} at {:#x}", prog_name, offset))?;
    let link = program
        .take_link(link_id)
        .with_context(|| format!("Failed to take link of {}", prog_name))?;

    debug!("  ✓ Attached {} to {:?}+{:#x}", prog_name, exec.path, offset);

    Ok(UprobeLink {
        name: format!("{}@{:#x}", prog_name, offset),
        link: Some(link),
    })
}

/// Attach `prog_name` at the entry of `symbol`
pub fn attach_entry(
    ebpf: &mut Bpf,
    prog_name: &str,
    symbol: &str,
    exec: &Executable,
    td: &TargetDetails,
) -> Result<Box<dyn Closer>> {
    let offset = td
        .function_offset(symbol)
        .ok_or_else(|| anyhow!("no offset known for {}", symbol))?;
    Ok(Box::new(attach_uprobe(ebpf, prog_name, exec, td, offset)?))
}

/// Attach `prog_name` at every return instruction of `symbol`
///
/// Return probes are emulated this way because the Go runtime moves stacks,
/// which breaks uretprobes.
pub fn attach_returns(
    ebpf: &mut Bpf,
    prog_name: &str,
    symbol: &str,
    exec: &Executable,
    td: &TargetDetails,
) -> Result<Vec<Box<dyn Closer>>> {
    let offsets = td
        .function_return_offsets(symbol)
        .ok_or_else(|| anyhow!("no return offsets known for {}", symbol))?;
    if offsets.is_empty() {
        warn!("{} has no return instructions, its spans will never end", symbol);
    }

    let mut links: Vec<Box<dyn Closer>> = Vec::with_capacity(offsets.len());
    for offset in offsets {
        links.push(Box::new(attach_uprobe(ebpf, prog_name, exec, td, *offset)?));
    }
    Ok(links)
}
