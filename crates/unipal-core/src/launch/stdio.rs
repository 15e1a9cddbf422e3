//! # Standard Handle Preparation
//!
//! Validates and un-blocks inheritable standard-stream descriptors before
//! `fork()`.
//!
//! A descriptor handed to the launcher must be marked inheritable, and must
//! have its close-on-exec bit cleared so it survives the `exec` in the
//! child. Clearing the bit mutates parent-process state, so any failure
//! part-way through (and the successful case, once the fork has happened)
//! must put the bit back on every descriptor already touched.

use std::os::fd::RawFd;

use crate::error::{PalError, PalResult};

/// An inheritable file descriptor offered for standard-stream redirection.
///
/// The `inheritable` flag models the object-manager attribute the managed
/// runtime sets on handles it intends to pass to children; the preparer
/// rejects descriptors without it.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle
{
    fd: RawFd,
    inheritable: bool,
}

impl FileHandle
{
    /// Wrap a descriptor that may be inherited by a launched child.
    #[must_use]
    pub fn inheritable(fd: RawFd) -> Self
    {
        FileHandle { fd, inheritable: true }
    }

    /// Wrap a descriptor that must not be inherited.
    ///
    /// Passing one of these to the launcher is an error; the constructor
    /// exists so callers can model both kinds of handle uniformly.
    #[must_use]
    pub fn private(fd: RawFd) -> Self
    {
        FileHandle { fd, inheritable: false }
    }

    #[must_use]
    pub fn raw(&self) -> RawFd
    {
        self.fd
    }
}

/// The three standard-stream redirections of a launch request.
///
/// All three must be supplied together, mirroring the all-or-nothing
/// `STARTF_USESTDHANDLES` contract.
#[derive(Debug, Clone, Copy)]
pub struct StdioRedirect
{
    pub stdin: FileHandle,
    pub stdout: FileHandle,
    pub stderr: FileHandle,
}

/// Stdio descriptors with close-on-exec cleared, ready for the child.
///
/// Dropping this restores the close-on-exec bit on every descriptor it
/// cleared, which covers both the failure paths before `fork()` and the
/// parent side afterwards.
pub(crate) struct PreparedStdio
{
    fds: [RawFd; 3],
    cleared: Vec<RawFd>,
}

impl PreparedStdio
{
    /// Validate the three handles and clear their close-on-exec bits.
    ///
    /// ## Errors
    ///
    /// - `InvalidHandle` if a handle is not marked inheritable
    /// - `InvalidHandle` if the `fcntl` clearing close-on-exec fails
    pub(crate) fn prepare(redirect: &StdioRedirect) -> PalResult<Self>
    {
        let mut prepared = PreparedStdio {
            fds: [redirect.stdin.raw(), redirect.stdout.raw(), redirect.stderr.raw()],
            cleared: Vec::with_capacity(3),
        };

        for (handle, stream) in [
            (redirect.stdin, "stdin"),
            (redirect.stdout, "stdout"),
            (redirect.stderr, "stderr"),
        ] {
            if !handle.inheritable {
                tracing::error!(stream, fd = handle.fd, "non-inheritable handle passed to launcher");
                return Err(PalError::InvalidHandle(format!(
                    "{stream} handle (fd {}) is not inheritable",
                    handle.fd
                )));
            }

            // Clear close-on-exec so the descriptor survives exec in the child.
            let result = unsafe { libc::fcntl(handle.fd, libc::F_SETFD, 0) };
            if result == -1 {
                let err = std::io::Error::last_os_error();
                tracing::error!(stream, fd = handle.fd, %err, "unable to clear close-on-exec");
                return Err(PalError::InvalidHandle(format!(
                    "unable to clear close-on-exec on {stream} (fd {}): {err}",
                    handle.fd
                )));
            }
            prepared.cleared.push(handle.fd);
        }

        Ok(prepared)
    }

    /// The raw descriptors in (stdin, stdout, stderr) order.
    pub(crate) fn fds(&self) -> [RawFd; 3]
    {
        self.fds
    }
}

impl Drop for PreparedStdio
{
    fn drop(&mut self)
    {
        // Restore close-on-exec on everything we touched. Best effort; the
        // descriptors still belong to the caller.
        for fd in self.cleared.drain(..) {
            let result = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            if result == -1 {
                tracing::warn!(
                    fd,
                    err = %std::io::Error::last_os_error(),
                    "couldn't restore close-on-exec flag"
                );
            }
        }
    }
}
