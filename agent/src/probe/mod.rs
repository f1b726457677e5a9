//! Probe lifecycle
//!
//! A [`Probe`] instruments one package of the target: it loads kernel
//! programs tailored to the target, attaches them as uprobes, turns the
//! records they emit into [`Event`]s and releases everything on close.
//!
//! [`Base`] implements that lifecycle once. Instrumentations only supply the
//! parts that differ: the program bytes, the constants, what to attach where,
//! how to read records and how to turn a record into an event.

pub mod consts;
pub mod record;

pub use consts::{Const, ConstError, ConstSet, Resolution};
pub use record::{c_string, DecodeError, LeReader, RawEvent};

use crate::{
    bpf::{CollectionOptions, CollectionSpec},
    bpffs,
    event::Event,
    inject,
    link::Closer,
    process::{Executable, TargetDetails},
    reader::{ReadError, ReaderCloser, Record, RecordReader},
    structfield,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;

#[async_trait]
pub trait Probe: Send + Sync {
    /// Package this probe instruments
    fn library_name(&self) -> &str;

    /// Symbols this probe attaches to, sorted
    fn func_names(&self) -> Vec<String>;

    /// Load the kernel programs, attach them to the target and open the
    /// record reader
    ///
    /// On failure everything acquired so far stays registered; call
    /// [`close`](Self::close) to release it.
    fn load(&self, exec: &Executable, td: &TargetDetails) -> Result<()>;

    /// Forward an event to `dest` for every record read, until the probe is
    /// closed
    ///
    /// A full `dest` blocks the loop until the receiver catches up.
    async fn run(&self, dest: mpsc::Sender<Event>);

    /// Release everything acquired by [`load`](Self::load). Failures are
    /// logged, never returned.
    fn close(&self);
}

/// The kernel objects of a probe: programs and maps
pub trait ObjectBundle: Default + Send + 'static {
    /// Whether the bundle holds kernel resources of its own that
    /// [`close`](Self::close) must release
    const CLOSEABLE: bool = false;

    /// Load the programs and maps of `spec` into the kernel
    fn load(&mut self, spec: CollectionSpec, opts: &CollectionOptions) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Attaches the programs for one symbol, returning the links created
pub type UprobeFn<B> =
    Box<dyn Fn(&str, &Executable, &TargetDetails, &mut B) -> Result<Vec<Box<dyn Closer>>> + Send + Sync>;

/// Produces a fresh program spec
pub type SpecFn = Box<dyn Fn() -> Result<CollectionSpec> + Send + Sync>;

/// Opens the record reader over a loaded bundle
pub type ReaderFn<B> = Box<dyn Fn(&mut B) -> Result<Arc<dyn RecordReader>> + Send + Sync>;

/// Converts a decoded record to an event
pub type ProcessFn<E> = Box<dyn Fn(E) -> Event + Send + Sync>;

/// Something [`Base::close`] must release
enum Resource {
    /// The loaded bundle itself
    Objects,
    Handle(Box<dyn Closer>),
}

struct State<B> {
    obj: Option<B>,
    reader: Option<Arc<dyn RecordReader>>,
    /// In acquisition order
    closers: Vec<Resource>,
}

impl<B> Default for State<B> {
    fn default() -> Self {
        Self {
            obj: None,
            reader: None,
            closers: Vec::new(),
        }
    }
}

/// Generic probe over bundle type `B` and record type `E`
pub struct Base<B, E> {
    name: String,
    instrumented_pkg: String,
    consts: ConstSet,
    uprobes: BTreeMap<String, UprobeFn<B>>,
    offsets: Arc<structfield::Index>,
    spec_fn: SpecFn,
    reader_fn: ReaderFn<B>,
    process_fn: ProcessFn<E>,
    state: Mutex<State<B>>,
}

impl<B: ObjectBundle, E: RawEvent> Base<B, E> {
    pub fn new<S, R, P>(
        name: &str,
        instrumented_pkg: &str,
        spec_fn: S,
        reader_fn: R,
        process_fn: P,
    ) -> Self
    where
        S: Fn() -> Result<CollectionSpec> + Send + Sync + 'static,
        R: Fn(&mut B) -> Result<Arc<dyn RecordReader>> + Send + Sync + 'static,
        P: Fn(E) -> Event + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            instrumented_pkg: instrumented_pkg.to_string(),
            consts: ConstSet::new(),
            uprobes: BTreeMap::new(),
            offsets: Arc::new(structfield::Index::new()),
            spec_fn: Box::new(spec_fn),
            reader_fn: Box::new(reader_fn),
            process_fn: Box::new(process_fn),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_const(mut self, c: Const) -> Self {
        self.consts.push(c);
        self
    }

    pub fn with_consts<I: IntoIterator<Item = Const>>(mut self, consts: I) -> Self {
        for c in consts {
            self.consts.push(c);
        }
        self
    }

    /// Attach with `f` at `symbol`. A later registration for the same symbol
    /// replaces the earlier one.
    pub fn with_uprobe<F>(mut self, symbol: &str, f: F) -> Self
    where
        F: Fn(&str, &Executable, &TargetDetails, &mut B) -> Result<Vec<Box<dyn Closer>>>
            + Send
            + Sync
            + 'static,
    {
        self.uprobes.insert(symbol.to_string(), Box::new(f));
        self
    }

    /// Struct field offsets used to resolve [`Const::StructField`]
    pub fn with_offsets(mut self, offsets: Arc<structfield::Index>) -> Self {
        self.offsets = offsets;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, State<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve every constant and write them into `spec`
    fn inject_consts(&self, td: &TargetDetails, spec: &mut CollectionSpec) -> Result<()> {
        let opts = self
            .consts
            .resolve(td)
            .into_result()
            .with_context(|| format!("{}: failed to resolve constants", self.name))?;
        inject::constants(spec, &self.offsets, opts)
            .with_context(|| format!("{}: failed to inject constants", self.name))
    }

    /// Load the bundle and attach every uprobe, registering each resource as
    /// soon as it is acquired
    fn build_obj(
        &self,
        state: &mut State<B>,
        exec: &Executable,
        td: &TargetDetails,
        spec: CollectionSpec,
    ) -> Result<()> {
        let State { obj, closers, .. } = state;
        let obj = obj.insert(B::default());
        if B::CLOSEABLE {
            closers.push(Resource::Objects);
        }

        let opts = CollectionOptions {
            pin_path: bpffs::path_for_target(td),
        };
        obj.load(spec, &opts)
            .with_context(|| format!("{}: failed to load eBPF objects", self.name))?;

        for (symbol, attach) in &self.uprobes {
            let links = attach(symbol.as_str(), exec, td, &mut *obj)
                .with_context(|| format!("{}: failed to attach uprobe to {}", self.name, symbol))?;
            closers.extend(links.into_iter().map(Resource::Handle));
        }
        Ok(())
    }

    fn active_reader(&self) -> Option<Arc<dyn RecordReader>> {
        self.lock_state().reader.clone()
    }

    fn process_record(&self, record: &Record) -> Result<Event, DecodeError> {
        let raw = E::decode(&record.raw_sample)?;
        Ok((self.process_fn)(raw))
    }
}

#[async_trait]
impl<B: ObjectBundle, E: RawEvent> Probe for Base<B, E> {
    fn library_name(&self) -> &str {
        &self.instrumented_pkg
    }

    fn func_names(&self) -> Vec<String> {
        self.uprobes.keys().cloned().collect()
    }

    fn load(&self, exec: &Executable, td: &TargetDetails) -> Result<()> {
        let mut spec = (self.spec_fn)()
            .with_context(|| format!("{}: failed to build program spec", self.name))?;
        self.inject_consts(td, &mut spec)?;

        let mut state = self.lock_state();
        if state.obj.is_some() {
            bail!("{}: already loaded", self.name);
        }
        self.build_obj(&mut state, exec, td, spec)?;

        let State { obj, reader, closers } = &mut *state;
        let Some(obj) = obj.as_mut() else {
            bail!("{}: eBPF objects missing after load", self.name);
        };
        let opened = (self.reader_fn)(obj)
            .with_context(|| format!("{}: failed to open perf reader", self.name))?;
        closers.push(Resource::Handle(Box::new(ReaderCloser(Arc::clone(&opened)))));
        *reader = Some(opened);

        info!("{}: loaded and attached {} uprobe(s)", self.name, self.uprobes.len());
        Ok(())
    }

    async fn run(&self, dest: mpsc::Sender<Event>) {
        let Some(reader) = self.active_reader() else {
            error!("{}: run called before a successful load", self.name);
            return;
        };

        loop {
            let record = match reader.read().await {
                Ok(record) => record,
                Err(ReadError::Closed) => return,
                Err(e) => {
                    error!("{}: error reading from perf reader: {}", self.name, e);
                    continue;
                }
            };

            if record.lost_samples != 0 {
                info!(
                    "{}: perf event ring buffer full, dropped: {}",
                    self.name, record.lost_samples
                );
                continue;
            }

            let event = match self.process_record(&record) {
                Ok(event) => event,
                Err(e) => {
                    error!("{}: failed to process perf record: {}", self.name, e);
                    continue;
                }
            };

            if dest.send(event).await.is_err() {
                debug!("{}: event receiver gone, dropping event", self.name);
            }
        }
    }

    fn close(&self) {
        let mut state = self.lock_state();
        let mut errors = Vec::new();

        for resource in std::mem::take(&mut state.closers) {
            let res = match resource {
                Resource::Objects => match state.obj.as_mut() {
                    Some(obj) => obj.close(),
                    None => Ok(()),
                },
                Resource::Handle(mut handle) => handle.close(),
            };
            if let Err(e) = res {
                errors.push(e);
            }
        }
        state.obj = None;
        state.reader = None;

        match crate::error::Errors::join(errors) {
            Some(errs) => error!("failed to cleanup, probe {}: {}", self.name, errs),
            None => debug!("{}: closed", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{KeyValue, SpanKind},
        inject::Value,
        reader::PerfReader,
        structfield::Id,
    };
    use anyhow::anyhow;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[derive(Default)]
    struct FakeObjects {
        loaded: bool,
        globals: Vec<String>,
        pin_path: std::path::PathBuf,
        log: Option<Log>,
        fail_close: bool,
    }

    impl ObjectBundle for FakeObjects {
        const CLOSEABLE: bool = true;

        fn load(&mut self, spec: CollectionSpec, opts: &CollectionOptions) -> Result<()> {
            if spec.bytecode == b"bad" {
                bail!("verifier rejected program");
            }
            self.globals = spec.globals.keys().cloned().collect();
            self.pin_path = opts.pin_path.clone();
            self.loaded = true;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            if let Some(log) = &self.log {
                log.lock().unwrap().push("objects".to_string());
            }
            if self.fail_close {
                bail!("objects busy");
            }
            Ok(())
        }
    }

    struct FakeLink {
        name: String,
        log: Log,
        fail: bool,
    }

    impl FakeLink {
        fn boxed(name: &str, log: &Log, fail: bool) -> Box<dyn Closer> {
            Box::new(Self {
                name: name.to_string(),
                log: Arc::clone(log),
                fail,
            })
        }
    }

    impl Closer for FakeLink {
        fn close(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                bail!("{} refused to detach", self.name);
            }
            Ok(())
        }
    }

    /// Two u64s: start then end
    #[derive(Debug)]
    struct Pair {
        start: u64,
        end: u64,
    }

    impl RawEvent for Pair {
        const SIZE: usize = 16;

        fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
            let mut r = LeReader::new(raw, Self::SIZE)?;
            Ok(Pair {
                start: r.u64(),
                end: r.u64(),
            })
        }
    }

    fn encode(start: u64, end: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(Pair::SIZE);
        buf.put_u64_le(start);
        buf.put_u64_le(end);
        buf.freeze()
    }

    fn pair_event(p: Pair) -> Event {
        Event {
            library: "example.com/lib".to_string(),
            name: format!("op-{}", p.start),
            attributes: vec![KeyValue::new("end", p.end as i64)],
            kind: SpanKind::Internal,
            start_time: p.start as i64,
            end_time: p.end as i64,
            span_context: None,
            parent_span_context: None,
        }
    }

    fn details() -> TargetDetails {
        let mut td = TargetDetails {
            pid: 4242,
            ..Default::default()
        };
        td.libraries
            .insert("example.com/lib".to_string(), "v1.2.0".to_string());
        td
    }

    fn exec() -> Executable {
        Executable::new("/usr/bin/app")
    }

    struct Harness {
        probe: Arc<Base<FakeObjects, Pair>>,
        records: mpsc::Sender<Result<Record, ReadError>>,
        reader: Arc<PerfReader>,
        log: Log,
    }

    /// Probe with links "a" and "b" registered on symbols "pkg.A" and "pkg.B"
    fn harness(bytecode: &'static [u8]) -> Harness {
        let (records, reader) = PerfReader::channel(16);
        let reader = Arc::new(reader);
        let log: Log = Arc::default();

        let probe = Base::new(
            "test_probe",
            "example.com/lib",
            move || Ok(CollectionSpec::new(bytecode.to_vec())),
            {
                let reader = Arc::clone(&reader);
                move |_obj: &mut FakeObjects| Ok(Arc::clone(&reader) as Arc<dyn RecordReader>)
            },
            pair_event,
        )
        .with_const(Const::key_val("debug", Value::Bool(false)))
        .with_uprobe("pkg.A", {
            let log = Arc::clone(&log);
            move |_, _, _, obj: &mut FakeObjects| {
                obj.log = Some(Arc::clone(&log));
                Ok(vec![FakeLink::boxed("a", &log, false)])
            }
        })
        .with_uprobe("pkg.B", {
            let log = Arc::clone(&log);
            move |_, _, _, _: &mut FakeObjects| Ok(vec![FakeLink::boxed("b", &log, false)])
        });

        Harness {
            probe: Arc::new(probe),
            records,
            reader,
            log,
        }
    }

    #[test]
    fn test_identity() {
        let h = harness(b"prog");
        let unordered = Base::<FakeObjects, Pair>::new(
            "other",
            "example.com/lib",
            || Ok(CollectionSpec::new(Vec::new())),
            |_: &mut FakeObjects| Err(anyhow!("no reader")),
            pair_event,
        )
        .with_uprobe("z.Last", |_, _, _, _: &mut FakeObjects| Ok(Vec::new()))
        .with_uprobe("a.First", |_, _, _, _: &mut FakeObjects| Ok(Vec::new()))
        .with_uprobe("m.Middle", |_, _, _, _: &mut FakeObjects| Ok(Vec::new()));

        assert_eq!(h.probe.library_name(), "example.com/lib");
        assert_eq!(h.probe.func_names(), vec!["pkg.A", "pkg.B"]);
        assert_eq!(unordered.func_names(), vec!["a.First", "m.Middle", "z.Last"]);
    }

    #[test]
    fn test_load_registers_resources_in_order() {
        let h = harness(b"prog");

        h.probe.load(&exec(), &details()).unwrap();
        {
            let state = h.probe.lock_state();
            let obj = state.obj.as_ref().unwrap();
            assert!(obj.loaded);
            assert_eq!(obj.globals, vec!["debug"]);
            assert_eq!(obj.pin_path, std::path::PathBuf::from("/sys/fs/bpf/4242"));
            // objects, two links, reader
            assert_eq!(state.closers.len(), 4);
            assert!(matches!(state.closers[0], Resource::Objects));
            assert!(state.reader.is_some());
        }

        h.probe.close();
        assert_eq!(entries(&h.log), vec!["objects", "a", "b"]);
        assert!(h.reader.is_closed());
        assert!(h.probe.lock_state().closers.is_empty());
    }

    #[test]
    fn test_load_twice_rejected() {
        let h = harness(b"prog");
        h.probe.load(&exec(), &details()).unwrap();

        let err = h.probe.load(&exec(), &details()).unwrap_err();
        assert!(err.to_string().contains("already loaded"));

        // Reload is allowed once closed
        h.probe.close();
        h.probe.load(&exec(), &details()).unwrap();
        h.probe.close();
    }

    #[test]
    fn test_const_failure_acquires_nothing() {
        let probe = Base::<FakeObjects, Pair>::new(
            "needs_offsets",
            "example.com/lib",
            || Ok(CollectionSpec::new(b"prog".to_vec())),
            |_: &mut FakeObjects| Err(anyhow!("unreachable")),
            pair_event,
        )
        .with_const(Const::struct_field(
            "ptr_pos",
            Id::new("example.com/other", "example.com/other", "T", "f"),
        ))
        .with_const(Const::Allocation);

        let err = probe.load(&exec(), &details()).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("unknown module version: example.com/other"));
        assert!(msg.contains("no allocation details"));

        let state = probe.lock_state();
        assert!(state.obj.is_none());
        assert!(state.closers.is_empty());
        drop(state);
        probe.close();
    }

    #[test]
    fn test_missing_offset_fails_injection() {
        let probe = Base::<FakeObjects, Pair>::new(
            "offsets",
            "example.com/lib",
            || Ok(CollectionSpec::new(b"prog".to_vec())),
            |_: &mut FakeObjects| Err(anyhow!("unreachable")),
            pair_event,
        )
        .with_const(Const::struct_field(
            "f_pos",
            Id::new("example.com/lib", "example.com/lib", "T", "f"),
        ));

        let err = probe.load(&exec(), &details()).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to inject constants"));

        let mut index = structfield::Index::new();
        index.put(
            Id::new("example.com/lib", "example.com/lib", "T", "f"),
            "v1.2.0",
            24,
        );
        let probe = probe.with_offsets(Arc::new(index));
        assert!(format!("{:#}", probe.load(&exec(), &details()).unwrap_err())
            .contains("failed to open perf reader"));
        probe.close();
    }

    #[test]
    fn test_bundle_load_failure_keeps_bundle_registered() {
        let h = harness(b"bad");

        let err = h.probe.load(&exec(), &details()).unwrap_err();
        assert!(format!("{:#}", err).contains("verifier rejected program"));
        {
            let state = h.probe.lock_state();
            assert_eq!(state.closers.len(), 1);
            assert!(state.reader.is_none());
        }

        h.probe.close();
        assert!(h.probe.lock_state().obj.is_none());
    }

    #[test]
    fn test_attach_failure_releases_earlier_links_on_close() {
        let log: Log = Arc::default();
        let probe = Base::<FakeObjects, Pair>::new(
            "attach",
            "example.com/lib",
            || Ok(CollectionSpec::new(b"prog".to_vec())),
            |_: &mut FakeObjects| Err(anyhow!("unreachable")),
            pair_event,
        )
        .with_uprobe("pkg.A", {
            let log = Arc::clone(&log);
            move |_, _, _, obj: &mut FakeObjects| {
                obj.log = Some(Arc::clone(&log));
                Ok(vec![FakeLink::boxed("a", &log, false)])
            }
        })
        .with_uprobe("pkg.B", |_, _, _, _: &mut FakeObjects| {
            Err(anyhow!("symbol not found"))
        });

        let err = probe.load(&exec(), &details()).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to attach uprobe to pkg.B"));
        assert!(entries(&log).is_empty());

        probe.close();
        assert_eq!(entries(&log), vec!["objects", "a"]);
    }

    #[test]
    fn test_close_attempts_every_release() {
        let log: Log = Arc::default();
        let probe = Base::<FakeObjects, Pair>::new(
            "failing_close",
            "example.com/lib",
            || Ok(CollectionSpec::new(b"prog".to_vec())),
            |_: &mut FakeObjects| Err(anyhow!("no reader")),
            pair_event,
        )
        .with_uprobe("pkg.A", {
            let log = Arc::clone(&log);
            move |_, _, _, obj: &mut FakeObjects| {
                obj.log = Some(Arc::clone(&log));
                obj.fail_close = true;
                Ok(vec![
                    FakeLink::boxed("a1", &log, true),
                    FakeLink::boxed("a2", &log, false),
                ])
            }
        });

        assert!(probe.load(&exec(), &details()).is_err());
        probe.close();
        assert_eq!(entries(&log), vec!["objects", "a1", "a2"]);

        // Nothing left to release
        probe.close();
        assert_eq!(entries(&log).len(), 3);
    }

    #[test]
    fn test_close_without_load() {
        let h = harness(b"prog");
        h.probe.close();
        h.probe.close();
        assert!(entries(&h.log).is_empty());
    }

    #[tokio::test]
    async fn test_run_before_load_returns() {
        let h = harness(b"prog");
        let (tx, mut rx) = mpsc::channel(1);

        tokio::time::timeout(Duration::from_secs(1), h.probe.run(tx))
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_skips_bad_records() {
        let h = harness(b"prog");
        h.probe.load(&exec(), &details()).unwrap();

        h.records.send(Ok(Record::lost(0, 12))).await.unwrap();
        h.records
            .send(Ok(Record::sample(0, Bytes::from_static(&[1, 2, 3]))))
            .await
            .unwrap();
        h.records
            .send(Err(std::io::Error::other("poll failed").into()))
            .await
            .unwrap();
        // Trailing bytes are ignored
        let mut long = BytesMut::from(&encode(10, 25)[..]);
        long.put_u32_le(0xdead);
        h.records
            .send(Ok(Record::sample(1, long.freeze())))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let run = tokio::spawn({
            let probe = Arc::clone(&h.probe);
            async move { probe.run(tx).await }
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "op-10");
        assert_eq!(event.duration_ns(), 15);

        h.probe.close();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_survives_dropped_receiver() {
        let h = harness(b"prog");
        h.probe.load(&exec(), &details()).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let run = tokio::spawn({
            let probe = Arc::clone(&h.probe);
            async move { probe.run(tx).await }
        });

        h.records.send(Ok(Record::sample(0, encode(1, 2)))).await.unwrap();
        h.records.send(Ok(Record::sample(0, encode(3, 4)))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());

        h.probe.close();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_backpressure_keeps_order() {
        let h = harness(b"prog");
        h.probe.load(&exec(), &details()).unwrap();

        for start in [1, 2, 3] {
            h.records
                .send(Ok(Record::sample(0, encode(start, start + 10))))
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(1);
        let run = tokio::spawn({
            let probe = Arc::clone(&h.probe);
            async move { probe.run(tx).await }
        });

        // Run blocks on the full channel instead of dropping events
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());

        let mut starts = Vec::new();
        for _ in 0..3 {
            starts.push(rx.recv().await.unwrap().start_time);
        }
        assert_eq!(starts, vec![1, 2, 3]);

        h.probe.close();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end() {
        // One symbol whose attachment yields one handle, one KeyVal const
        let (records, reader) = PerfReader::channel(4);
        let reader = Arc::new(reader);
        let log: Log = Arc::default();
        let attached = Arc::new(Mutex::new(Vec::new()));

        let probe = Arc::new(
            Base::new(
                "single_probe",
                "example.com/lib",
                || Ok(CollectionSpec::new(b"prog".to_vec())),
                {
                    let reader = Arc::clone(&reader);
                    move |_obj: &mut FakeObjects| Ok(Arc::clone(&reader) as Arc<dyn RecordReader>)
                },
                pair_event,
            )
            .with_const(Const::key_val("debug", Value::Bool(true)))
            .with_uprobe("pkg.Serve", {
                let log = Arc::clone(&log);
                let attached = Arc::clone(&attached);
                move |symbol, _, _, obj: &mut FakeObjects| {
                    attached.lock().unwrap().push(symbol.to_string());
                    obj.log = Some(Arc::clone(&log));
                    Ok(vec![FakeLink::boxed("serve", &log, false)])
                }
            }),
        );
        assert_eq!(probe.func_names(), vec!["pkg.Serve"]);

        probe.load(&exec(), &details()).unwrap();
        assert_eq!(*attached.lock().unwrap(), vec!["pkg.Serve"]);

        records.send(Ok(Record::sample(0, encode(1, 2)))).await.unwrap();
        records.send(Ok(Record::lost(0, 5))).await.unwrap();
        records.send(Ok(Record::sample(1, encode(3, 4)))).await.unwrap();

        let (tx, mut rx) = mpsc::channel(3);
        let run = tokio::spawn({
            let probe = Arc::clone(&probe);
            async move { probe.run(tx).await }
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.start_time, first.end_time), (1, 2));
        assert_eq!((second.start_time, second.end_time), (3, 4));
        assert_eq!(second.attribute("end"), Some(&crate::event::Value::I64(4)));

        probe.close();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run did not return after close")
            .unwrap();

        // Exactly two events, then the channel closes
        assert!(rx.recv().await.is_none());
        assert_eq!(entries(&log), vec!["objects", "serve"]);
        assert!(reader.is_closed());
    }
}
