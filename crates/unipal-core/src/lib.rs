//! # unipal-core
//!
//! Windows-style process lifecycle primitives on top of POSIX, for hosting
//! a runtime that speaks `CreateProcess`/`TerminateProcess`/`ExitProcess`.
//!
//! This crate provides the process-control layer, including:
//! - Process launch with suspended start and stdio redirection
//! - Idempotent exit-status queries with Windows exit-code semantics
//! - Single-owner process termination
//! - A crash dump pipeline around an external dump utility
//! - The debugger startup handshake (pipes, semaphore fallback)
//! - A process-wide memory fence (`FlushProcessWriteBuffers`)
//!
//! ## Platform Support
//!
//! - **Linux**: primary target (`membarrier`, `/proc`-based start times)
//! - **macOS**: Mach register probing for the fence; semaphore name limits
//!
//! ## Why unsafe code is needed
//!
//! The fork→exec window, signal delivery, raw descriptor plumbing and the
//! memory fence all require direct system calls that Rust cannot make safe
//! by itself: they manipulate whole-process state (memory protection,
//! signal masks, the process image) out from under the runtime. Each call
//! site is wrapped in a safe API that documents and upholds the relevant
//! contract, most importantly the no-locks/no-allocation discipline of the
//! post-fork child.

#![allow(unsafe_code)] // Required for fork/exec, signals and mprotect

pub mod context;
pub mod dump;
pub mod error;
pub mod fence;
pub mod handshake;
pub mod launch;
pub mod registry;
pub mod status;
pub mod terminate;
pub mod types;

pub use context::{process_context, ProcessContext};
pub use dump::{DumpConfig, DumpType};
// Re-export commonly used types
pub use error::{PalError, PalResult};
pub use launch::{create_process, LaunchRequest, LaunchResult};
pub use registry::ProcessHandle;
pub use status::{get_exit_code, get_process_status};
pub use terminate::{exit_process, terminate_process};
pub use types::{ProcessId, ProcessState, ThreadId, STILL_ACTIVE};
