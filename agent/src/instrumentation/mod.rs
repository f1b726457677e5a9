//! Concrete instrumentations
//!
//! Each submodule builds a [`Base`](crate::probe::Base) probe for one Go
//! package. They share [`AyaObjects`] as their kernel object bundle.

pub mod nethttp_server;

use crate::{
    bpf::{self, CollectionOptions, CollectionSpec},
    probe::ObjectBundle,
    reader::{PerfReader, RecordReader},
};
use anyhow::{Context, Result};
use aya::Bpf;
use aya_log::BpfLogger;
use log::{debug, warn, Log, Metadata, Record};
use probe_common::EVENTS_MAP;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Forwards kernel log lines to the process logger while open
///
/// The forwarding tasks cannot be stopped from outside, so closing the
/// gate is what silences them once the objects are released.
#[derive(Clone)]
struct LogGate {
    open: Arc<AtomicBool>,
}

impl LogGate {
    fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    fn shut(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Log for LogGate {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.open.load(Ordering::Acquire) && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            log::logger().log(record);
        }
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

/// Programs and maps of a loaded object file
#[derive(Default)]
pub struct AyaObjects {
    bpf: Option<Bpf>,
    logger: Option<(BpfLogger, LogGate)>,
}

impl AyaObjects {
    /// The loaded object
    pub fn bpf_mut(&mut self) -> Result<&mut Bpf> {
        self.bpf.as_mut().context("eBPF objects not loaded")
    }

    /// Open a reader over the perf event array the programs write to
    pub fn events_reader(&mut self) -> Result<Arc<dyn RecordReader>> {
        let map = self
            .bpf_mut()?
            .take_map(EVENTS_MAP)
            .with_context(|| format!("{} map not found", EVENTS_MAP))?;
        Ok(Arc::new(PerfReader::from_map(map)?))
    }
}

impl ObjectBundle for AyaObjects {
    const CLOSEABLE: bool = true;

    fn load(&mut self, spec: CollectionSpec, opts: &CollectionOptions) -> Result<()> {
        let mut bpf = bpf::load_collection(&spec, opts)?;

        let gate = LogGate::new();
        match BpfLogger::init_with_logger(&mut bpf, gate.clone()) {
            Ok(logger) => self.logger = Some((logger, gate)),
            Err(e) => warn!("failed to initialize eBPF logger: {}", e),
        }

        self.bpf = Some(bpf);
        Ok(())
    }

    /// Stop forwarding kernel logs, unload programs and unmap maps. Pinned
    /// maps stay until the pin directory is removed.
    fn close(&mut self) -> Result<()> {
        if let Some((_logger, gate)) = self.logger.take() {
            gate.shut();
            debug!("eBPF log forwarding stopped");
        }
        if self.bpf.take().is_some() {
            debug!("eBPF objects unloaded");
        }
        Ok(())
    }
}
