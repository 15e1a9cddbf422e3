//! # Error Types
//!
//! General error handling for the PAL process layer.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

/// Main error type for PAL process operations
///
/// This enum represents all the ways a process-layer operation can fail.
/// The variants deliberately mirror the small set of Windows error codes
/// the managed runtime above us understands; everything the OS reports is
/// mapped onto the smallest faithful member of this set.
///
/// ## Error Categories
///
/// 1. **Validation errors**: InvalidParameter (rejected before any OS resource is touched)
/// 2. **Lookup errors**: FileNotFound, InvalidHandle
/// 3. **Permission errors**: AccessDenied
/// 4. **Resource errors**: NotEnoughMemory
/// 5. **OS-call failures**: Internal (fork/exec/wait failures with details), Io
#[derive(Error, Debug)]
pub enum PalError
{
    /// A launch request carried an unsupported flag, a disallowed non-empty
    /// field, or a malformed value
    ///
    /// This is always detected before `fork()` is attempted, so no process
    /// is ever created for a request that reports this error.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The resolved executable does not exist, or exists but is not an
    /// executable regular file
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The target path is a directory, or the OS refused a signal with
    /// `EPERM`
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// An OS resource allocation (pipe, record registration) failed
    #[error("Not enough memory: {0}")]
    NotEnoughMemory(String),

    /// A process handle does not refer to a live, known process
    ///
    /// Reported when a signal send fails with `ESRCH`, or when a handle
    /// holds no process id at all.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// An OS call failed in a way that has no more specific mapping
    ///
    /// The string carries the failing call and its errno. `fork()` failures
    /// surface here.
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error (for file operations, etc.)
    ///
    /// This is a standard Rust `std::io::Error` converted to our error type.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, PalError>`
///
/// ```rust
/// use unipal_core::error::PalResult;
/// fn foo() -> PalResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type PalResult<T> = std::result::Result<T, PalError>;

impl PalError
{
    /// Build an [`PalError::Internal`] from a failing libc call name and the
    /// current `errno`.
    pub(crate) fn from_os(call: &str) -> Self
    {
        PalError::Internal(format!("{call} failed: {}", std::io::Error::last_os_error()))
    }
}
