//! Ring-buffer readers
//!
//! A [`RecordReader`] hands out the raw records the kernel programs emit.
//! Reads block until a record arrives or the reader is closed; a closed
//! reader answers every read with [`ReadError::Closed`], which is how event
//! loops learn it is time to stop.

use crate::link::Closer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aya::{
    maps::{
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer, PerfBufferError},
        Map, MapData,
    },
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};

/// Number of records buffered between the per-CPU tasks and the reader
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Buffers drained per wakeup of a per-CPU task
const READ_BUFFERS: usize = 16;

/// Size (in pages) of each per-CPU perf buffer
const PER_CPU_BUFFER_PAGES: usize = 8;

/// Consecutive transient read failures tolerated before a CPU is given up
const MAX_READ_RETRIES: u32 = 8;

const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// One read from the ring buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// CPU the record was produced on
    pub cpu: u32,
    /// Payload as written by the kernel program
    pub raw_sample: Bytes,
    /// Samples the kernel dropped because the buffer was full. Nonzero
    /// records carry no payload.
    pub lost_samples: u64,
}

impl Record {
    pub fn sample(cpu: u32, raw_sample: Bytes) -> Self {
        Self {
            cpu,
            raw_sample,
            lost_samples: 0,
        }
    }

    pub fn lost(cpu: u32, lost_samples: u64) -> Self {
        Self {
            cpu,
            raw_sample: Bytes::new(),
            lost_samples,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReadError {
    /// The reader was closed; no further records will be returned
    #[error("perf reader closed")]
    Closed,
    #[error("failed to read perf buffer: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait RecordReader: Send + Sync {
    /// Wait for the next record
    async fn read(&self) -> Result<Record, ReadError>;

    /// Close the reader, waking any pending [`read`](Self::read)
    fn close(&self) -> Result<()>;
}

type RecordSender = mpsc::Sender<Result<Record, ReadError>>;

/// Reader fed through a channel, normally by one task per CPU draining a
/// perf event array
pub struct PerfReader {
    records: AsyncMutex<mpsc::Receiver<Result<Record, ReadError>>>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PerfReader {
    /// Create a reader fed by the returned sender
    pub fn channel(capacity: usize) -> (RecordSender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        let reader = Self {
            records: AsyncMutex::new(rx),
            closed,
            tasks: Mutex::new(Vec::new()),
        };
        (tx, reader)
    }

    /// Read from the perf event array `map`
    ///
    /// Spawns a task per online CPU, so this must be called from within a
    /// tokio runtime.
    pub fn from_map(map: Map) -> Result<Self> {
        let mut perf_array = AsyncPerfEventArray::try_from(map)
            .context("Failed to create AsyncPerfEventArray from events map")?;
        let (tx, reader) = Self::channel(DEFAULT_QUEUE_CAPACITY);

        let cpus = online_cpus().context("Failed to list online CPUs")?;
        debug!("Spawning perf readers for {} CPUs", cpus.len());

        for cpu_id in cpus {
            let buf = match perf_array.open(cpu_id, Some(PER_CPU_BUFFER_PAGES)) {
                Ok(buf) => buf,
                Err(e) => {
                    reader.close()?;
                    return Err(e)
                        .with_context(|| format!("Failed to open perf buffer for CPU {}", cpu_id));
                }
            };
            reader
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tokio::spawn(drain_cpu(cpu_id, buf, tx.clone())));
        }

        Ok(reader)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Result of one wakeup of a per-CPU buffer
struct Batch {
    /// Buffers filled with a sample
    read: usize,
    /// Samples the kernel dropped
    lost: usize,
}

/// Per-CPU source of raw samples
#[async_trait]
trait CpuBuffer: Send {
    async fn read_batch(&mut self, buffers: &mut [BytesMut]) -> io::Result<Batch>;
}

#[async_trait]
impl CpuBuffer for AsyncPerfEventArrayBuffer<MapData> {
    async fn read_batch(&mut self, buffers: &mut [BytesMut]) -> io::Result<Batch> {
        match self.read_events(buffers).await {
            Ok(events) => Ok(Batch {
                read: events.read,
                lost: events.lost,
            }),
            Err(PerfBufferError::IOError(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

/// Errors worth retrying: the next wakeup is expected to succeed
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Forward the records of one CPU until the reader goes away or the buffer
/// fails for good. A failure is reported to the reader once, then the task
/// stops.
async fn drain_cpu<B: CpuBuffer>(cpu_id: u32, mut buf: B, tx: RecordSender) {
    trace!("task for cpu {} awaiting events", cpu_id);

    let mut buffers = (0..READ_BUFFERS)
        .map(|_| BytesMut::with_capacity(4096))
        .collect::<Vec<_>>();
    let mut retries = 0;

    loop {
        let batch = match buf.read_batch(&mut buffers).await {
            Ok(batch) => {
                retries = 0;
                batch
            }
            Err(e) if is_transient(&e) && retries < MAX_READ_RETRIES => {
                retries += 1;
                trace!("cpu {}: retrying perf read: {}", cpu_id, e);
                tokio::time::sleep(READ_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                warn!("cpu {}: perf buffer unreadable, no more records from it: {}", cpu_id, e);
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        if batch.lost > 0 && tx.send(Ok(Record::lost(cpu_id, batch.lost as u64))).await.is_err() {
            return;
        }

        for raw in buffers.iter().take(batch.read) {
            let record = Record::sample(cpu_id, Bytes::copy_from_slice(raw));
            if tx.send(Ok(record)).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl RecordReader for PerfReader {
    async fn read(&self) -> Result<Record, ReadError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ReadError::Closed);
        }

        let mut records = self.records.lock().await;
        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => Err(ReadError::Closed),
            record = records.recv() => record.unwrap_or(Err(ReadError::Closed)),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        debug!("perf reader closed");
        Ok(())
    }
}

/// Registers a shared reader as a closeable resource
pub(crate) struct ReaderCloser(pub(crate) Arc<dyn RecordReader>);

impl Closer for ReaderCloser {
    fn close(&mut self) -> Result<()> {
        self.0.close()
    }
}
