//! Server side of `net/http`
//!
//! Spans every call of `serverHandler.ServeHTTP`: the entry program records
//! the start time and request pointer, the return programs read the request
//! and response fields and emit an [`HttpServerEvent`].

use super::AyaObjects;
use crate::{
    bpf::CollectionSpec,
    event::{Event, KeyValue, SpanContext, SpanKind},
    link::{self, Closer},
    probe::{c_string, Base, Const, DecodeError, LeReader, RawEvent},
    process::{Executable, TargetDetails},
    structfield::{Id, Index},
};
use anyhow::Result;
use probe_common::{
    HttpServerEvent, RawSpanContext, HOST_MAX_LEN, METHOD_MAX_LEN, NETHTTP_SERVER_ENTRY_PROG,
    NETHTTP_SERVER_RETURN_PROG, PATH_MAX_LEN, PROTO_MAX_LEN, REMOTE_ADDR_MAX_LEN, SPAN_ID_SIZE,
    TRACE_ID_SIZE,
};
use std::{path::PathBuf, sync::Arc};

/// Name of the probe
pub const PROBE_NAME: &str = "net/http/server";

/// Package the probe instruments
pub const PKG_NAME: &str = "net/http";

/// Function the probe attaches to
pub const SYMBOL: &str = "net/http.serverHandler.ServeHTTP";

pub type ServerProbe = Base<AyaObjects, HttpServerEvent>;

/// Build the probe, loading programs from `ebpf_object`
pub fn new(ebpf_object: PathBuf, offsets: Arc<Index>) -> ServerProbe {
    Base::new(
        PROBE_NAME,
        PKG_NAME,
        move || CollectionSpec::from_file(&ebpf_object),
        AyaObjects::events_reader,
        convert_event,
    )
    .with_consts(consts())
    .with_offsets(offsets)
    .with_uprobe(SYMBOL, attach)
}

fn std_field(pkg: &str, struct_name: &str, field: &str) -> Id {
    Id::new("std", pkg, struct_name, field)
}

fn consts() -> Vec<Const> {
    vec![
        Const::RegistersAbi,
        Const::Allocation,
        Const::struct_field("method_ptr_pos", std_field("net/http", "Request", "Method")),
        Const::struct_field("url_ptr_pos", std_field("net/http", "Request", "URL")),
        Const::struct_field("path_ptr_pos", std_field("net/url", "URL", "Path")),
        Const::struct_field("remoteaddr_ptr_pos", std_field("net/http", "Request", "RemoteAddr")),
        Const::struct_field("headers_ptr_pos", std_field("net/http", "Request", "Header")),
        Const::struct_field("host_ptr_pos", std_field("net/http", "Request", "Host")),
        Const::struct_field("proto_ptr_pos", std_field("net/http", "Request", "Proto")),
        Const::struct_field("req_ptr_pos", std_field("net/http", "response", "req")),
        Const::struct_field("status_ptr_pos", std_field("net/http", "response", "status")),
        Const::struct_field("buckets_ptr_pos", std_field("runtime", "hmap", "buckets")),
    ]
}

fn attach(
    symbol: &str,
    exec: &Executable,
    td: &TargetDetails,
    obj: &mut AyaObjects,
) -> Result<Vec<Box<dyn Closer>>> {
    let bpf = obj.bpf_mut()?;
    let mut links = vec![link::attach_entry(bpf, NETHTTP_SERVER_ENTRY_PROG, symbol, exec, td)?];
    links.extend(link::attach_returns(bpf, NETHTTP_SERVER_RETURN_PROG, symbol, exec, td)?);
    Ok(links)
}

fn read_span_context(r: &mut LeReader<'_>) -> RawSpanContext {
    RawSpanContext {
        trace_id: r.bytes::<TRACE_ID_SIZE>(),
        span_id: r.bytes::<SPAN_ID_SIZE>(),
    }
}

impl RawEvent for HttpServerEvent {
    const SIZE: usize = HttpServerEvent::SIZE;

    fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = LeReader::new(raw, <Self as RawEvent>::SIZE)?;
        Ok(HttpServerEvent {
            start_time: r.u64(),
            end_time: r.u64(),
            span_context: read_span_context(&mut r),
            parent_span_context: read_span_context(&mut r),
            status_code: r.u64(),
            method: r.bytes::<METHOD_MAX_LEN>(),
            path: r.bytes::<PATH_MAX_LEN>(),
            remote_addr: r.bytes::<REMOTE_ADDR_MAX_LEN>(),
            host: r.bytes::<HOST_MAX_LEN>(),
            proto: r.bytes::<PROTO_MAX_LEN>(),
        })
    }
}

/// Split `host:port`, unwrapping bracketed IPv6 hosts. The port is `None`
/// when absent or not a number.
fn split_host_port(addr: &str) -> (&str, Option<i64>) {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(']') => {
            match port.parse::<u16>() {
                Ok(port) => (host, Some(i64::from(port))),
                Err(_) => (addr, None),
            }
        }
        _ => (addr, None),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    (host, port)
}

/// Turn a decoded record into a server span
pub fn convert_event(e: HttpServerEvent) -> Event {
    let method = c_string(&e.method);
    let path = c_string(&e.path);
    let remote_addr = c_string(&e.remote_addr);
    let host = c_string(&e.host);
    let proto = c_string(&e.proto);

    let mut attributes = vec![
        KeyValue::new("http.request.method", method.as_str()),
        KeyValue::new("url.path", path),
        KeyValue::new("http.response.status_code", e.status_code as i64),
    ];

    if !remote_addr.is_empty() {
        let (peer, port) = split_host_port(&remote_addr);
        attributes.push(KeyValue::new("network.peer.address", peer));
        if let Some(port) = port {
            attributes.push(KeyValue::new("network.peer.port", port));
        }
    }

    if !host.is_empty() {
        let (server, port) = split_host_port(&host);
        attributes.push(KeyValue::new("server.address", server));
        if let Some(port) = port {
            attributes.push(KeyValue::new("server.port", port));
        }
    }

    if let Some(version) = proto.strip_prefix("HTTP/") {
        attributes.push(KeyValue::new("network.protocol.version", version));
    }

    Event {
        library: PKG_NAME.to_string(),
        name: method,
        attributes,
        kind: SpanKind::Server,
        start_time: e.start_time as i64,
        end_time: e.end_time as i64,
        span_context: SpanContext::from_raw(&e.span_context),
        parent_span_context: SpanContext::from_raw(&e.parent_span_context),
    }
}
