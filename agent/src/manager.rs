//! Probe manager
//!
//! Loads, runs and closes a set of probes against one target process. A
//! probe that fails to load is closed and skipped so the others still run.

use crate::{
    event::Event,
    probe::Probe,
    process::{Executable, TargetDetails},
};
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Runs probes and fans their events into one channel
pub struct Manager {
    probes: Vec<Arc<dyn Probe>>,
    loaded: Vec<Arc<dyn Probe>>,
    tasks: Vec<JoinHandle<()>>,
    // Set by close: run tasks stop even when parked on a full channel
    stopping: watch::Sender<bool>,
}

impl Default for Manager {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            loaded: Vec::new(),
            tasks: Vec::new(),
            stopping: watch::channel(false).0,
        }
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a probe to be loaded by [`load`](Self::load)
    pub fn register(&mut self, probe: Arc<dyn Probe>) {
        debug!(
            "Registered probe for {} ({})",
            probe.library_name(),
            probe.func_names().join(", ")
        );
        self.probes.push(probe);
    }

    /// Probes that loaded successfully
    pub fn loaded(&self) -> &[Arc<dyn Probe>] {
        &self.loaded
    }

    /// Load every registered probe into the target
    ///
    /// # Arguments
    ///
    /// * `exec` - Executable the uprobes attach to
    /// * `td` - Details of the target process
    ///
    /// # Returns
    ///
    /// Number of probes loaded. Fails only if none of them loaded.
    pub fn load(&mut self, exec: &Executable, td: &TargetDetails) -> Result<usize> {
        for probe in self.probes.drain(..) {
            match probe.load(exec, td) {
                Ok(()) => {
                    info!("  ✓ Loaded probe for {}", probe.library_name());
                    self.loaded.push(probe);
                }
                Err(e) => {
                    warn!("Skipping probe for {}: {:#}", probe.library_name(), e);
                    probe.close();
                }
            }
        }

        if self.loaded.is_empty() {
            bail!("No probe could be loaded into process {}", td.pid);
        }
        Ok(self.loaded.len())
    }

    /// Spawn one task per loaded probe, each sending to `dest`
    ///
    /// The receiving end sees the channel close once every probe has been
    /// closed and its task has finished.
    pub fn run(&mut self, dest: mpsc::Sender<Event>) {
        info!("Running {} probe(s)", self.loaded.len());
        for probe in &self.loaded {
            let probe = Arc::clone(probe);
            let dest = dest.clone();
            let mut stopping = self.stopping.subscribe();
            self.tasks.push(tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = probe.run(dest) => {
                        debug!("Probe for {} stopped", probe.library_name());
                    }
                    _ = stopped(&mut stopping) => {
                        debug!(
                            "Probe for {} stopped with an event still pending",
                            probe.library_name()
                        );
                    }
                }
            }));
        }
    }

    /// Close every loaded probe and wait for their tasks to finish
    ///
    /// Does not depend on the receiver being drained: a task still blocked
    /// sending into a full channel is cancelled and its pending event is
    /// dropped. Events already queued stay readable.
    pub async fn close(&mut self) {
        for probe in self.loaded.drain(..) {
            probe.close();
        }
        self.stopping.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Probe task failed: {}", e);
            }
        }
    }
}

/// Resolves once close has been requested. A dropped manager never
/// requests it.
async fn stopped(stopping: &mut watch::Receiver<bool>) {
    let requested = stopping.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}
