//! Shared constants for the uprobe programs
//!
//! These constants are used by both kernel and userspace programs
//! to keep record layouts and object names in agreement.

// ============================================================================
// Record Field Sizes
// ============================================================================

/// Size of a W3C trace id in bytes
pub const TRACE_ID_SIZE: usize = 16;

/// Size of a W3C span id in bytes
pub const SPAN_ID_SIZE: usize = 8;

/// Longest HTTP method captured (OPTIONS plus terminator)
pub const METHOD_MAX_LEN: usize = 8;

/// Longest request path captured
pub const PATH_MAX_LEN: usize = 128;

/// Longest remote address captured (ipv6 + ':' + port + terminator)
pub const REMOTE_ADDR_MAX_LEN: usize = 64;

/// Longest Host header captured
pub const HOST_MAX_LEN: usize = 128;

/// Longest protocol string captured ("HTTP/1.1" plus terminator)
pub const PROTO_MAX_LEN: usize = 8;

// ============================================================================
// Object Names
// ============================================================================

/// Perf event array the programs write their records into
pub const EVENTS_MAP: &str = "events";

/// Entry program of the net/http server instrumentation
pub const NETHTTP_SERVER_ENTRY_PROG: &str = "uprobe_serverHandler_ServeHTTP";

/// Return program of the net/http server instrumentation, attached at every
/// return instruction of the instrumented function
pub const NETHTTP_SERVER_RETURN_PROG: &str = "uprobe_serverHandler_ServeHTTP_Returns";

// ============================================================================
// Injected Globals
// ============================================================================

/// Whether the target passes arguments in registers
pub const GLOBAL_IS_REGISTERS_ABI: &str = "is_registers_abi";

/// Start of the memory region the programs may allocate from
pub const GLOBAL_START_ADDR: &str = "start_addr";

/// End of the memory region the programs may allocate from
pub const GLOBAL_END_ADDR: &str = "end_addr";

/// Number of CPUs the allocation region is split across
pub const GLOBAL_TOTAL_CPUS: &str = "total_cpus";
