//! Event exporters
//!
//! Writes the events produced by the probes out of the agent, one JSON
//! document per event.

use crate::event::Event;
use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    str::FromStr,
};

/// Trait for event exporters
pub trait EventExporter: Send {
    /// Export one event
    ///
    /// # Arguments
    ///
    /// * `event` - Event produced by a probe
    fn export(&mut self, event: &Event) -> Result<()>;

    /// Write out anything buffered
    fn flush(&mut self) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One compact JSON document per line
    Json,
    /// Pretty-printed JSON documents
    Pretty,
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => Ok(ExportFormat::Json),
            "pretty" => Ok(ExportFormat::Pretty),
            _ => bail!("Unsupported format: {}. Use json or pretty", s),
        }
    }
}

#[derive(Serialize)]
struct Exported<'a> {
    exported_at: String,
    #[serde(flatten)]
    event: &'a Event,
}

/// JSON exporter
pub struct JsonExporter {
    writer: Box<dyn Write + Send>,
    pretty: bool,
    exported: u64,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `writer` - Destination of the documents
    /// * `format` - Compact or pretty-printed output
    pub fn new(writer: Box<dyn Write + Send>, format: ExportFormat) -> Self {
        Self {
            writer,
            pretty: format == ExportFormat::Pretty,
            exported: 0,
        }
    }

    /// Export to a newly created file at `path`
    pub fn to_file(path: &Path, format: ExportFormat) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file: {:?}", path))?;
        Ok(Self::new(Box::new(BufWriter::new(file)), format))
    }

    pub fn stdout(format: ExportFormat) -> Self {
        Self::new(Box::new(io::stdout()), format)
    }

    /// Number of events exported so far
    pub fn exported(&self) -> u64 {
        self.exported
    }
}

impl EventExporter for JsonExporter {
    fn export(&mut self, event: &Event) -> Result<()> {
        let doc = Exported {
            exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event,
        };
        let json = if self.pretty {
            serde_json::to_string_pretty(&doc)?
        } else {
            serde_json::to_string(&doc)?
        };

        writeln!(self.writer, "{}", json).context("Failed to write event")?;
        self.exported += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush exported events")
    }
}
