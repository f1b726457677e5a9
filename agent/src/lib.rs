//! Auto-instrumentation agent library
//!
//! Control plane of the agent: resolves target-specific constants, loads the
//! uprobe programs, reads their records and turns them into telemetry events.

pub mod bpf;
pub mod bpffs;
pub mod error;
pub mod event;
pub mod exporter;
pub mod inject;
pub mod instrumentation;
pub mod link;
pub mod manager;
pub mod probe;
pub mod process;
pub mod reader;
pub mod structfield;

pub use event::{Event, KeyValue, SpanContext, SpanKind};
pub use exporter::{EventExporter, ExportFormat, JsonExporter};
pub use manager::Manager;
pub use probe::{Base, Const, ConstSet, ObjectBundle, Probe, RawEvent};
pub use process::{Executable, TargetDetails};
