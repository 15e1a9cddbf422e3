//! Core process and thread types shared across the crate.

mod process;

pub use process::{ProcessId, ProcessState, ThreadId, STILL_ACTIVE};
