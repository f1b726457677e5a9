//! Shared record layouts for the auto-instrumentation uprobes
//!
//! This crate provides the raw data structures and constants shared
//! between the kernel programs and the userspace agent.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{HttpServerEvent, RawSpanContext};
