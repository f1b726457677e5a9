//! Raw records written by the uprobe programs
//!
//! These structures must be repr(C) and match the kernel side byte for
//! byte. Every multi-byte field is little-endian.

use crate::constants::*;

/// Span identity as written by the kernel programs
///
/// An all-zero value means "no span".
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawSpanContext {
    /// Trace identifier
    pub trace_id: [u8; TRACE_ID_SIZE],
    /// Span identifier
    pub span_id: [u8; SPAN_ID_SIZE],
}

impl RawSpanContext {
    /// Size of the encoded span context in bytes
    pub const SIZE: usize = TRACE_ID_SIZE + SPAN_ID_SIZE;

    /// Whether neither identifier has been set
    pub fn is_empty(&self) -> bool {
        self.trace_id.iter().all(|b| *b == 0) && self.span_id.iter().all(|b| *b == 0)
    }
}

/// One served HTTP request, emitted by the return probe of
/// `net/http.serverHandler.ServeHTTP`
///
/// String fields are NUL-padded.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HttpServerEvent {
    /// Monotonic time the handler was entered (nanoseconds since boot)
    pub start_time: u64,
    /// Monotonic time the handler returned (nanoseconds since boot)
    pub end_time: u64,
    /// Span created for this request
    pub span_context: RawSpanContext,
    /// Span propagated by the caller, if any
    pub parent_span_context: RawSpanContext,
    /// Response status code
    pub status_code: u64,
    /// Request method
    pub method: [u8; METHOD_MAX_LEN],
    /// Request URL path
    pub path: [u8; PATH_MAX_LEN],
    /// Peer address in host:port form
    pub remote_addr: [u8; REMOTE_ADDR_MAX_LEN],
    /// Host header
    pub host: [u8; HOST_MAX_LEN],
    /// Protocol, e.g. "HTTP/1.1"
    pub proto: [u8; PROTO_MAX_LEN],
}

impl HttpServerEvent {
    /// Size of the encoded record in bytes
    pub const SIZE: usize = 8
        + 8
        + RawSpanContext::SIZE
        + RawSpanContext::SIZE
        + 8
        + METHOD_MAX_LEN
        + PATH_MAX_LEN
        + REMOTE_ADDR_MAX_LEN
        + HOST_MAX_LEN
        + PROTO_MAX_LEN;
}

// Compile-time layout checks
// These will fail to compile if the kernel and userspace layouts drift
const _: () = {
    assert!(core::mem::size_of::<RawSpanContext>() == RawSpanContext::SIZE);
    assert!(core::mem::size_of::<HttpServerEvent>() == HttpServerEvent::SIZE);
    assert!(HttpServerEvent::SIZE == 408);
};
