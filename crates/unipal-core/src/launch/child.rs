//! # Post-Fork Child Path
//!
//! The restricted execution mode between `fork()` and `exec()`.
//!
//! From the moment the child begins running until it reaches `execve`, it
//! shares the parent's memory image but owns none of the parent's threads.
//! Any lock that happened to be held by a sibling thread at the fork
//! instant is held forever in the child, so this code path must not take
//! locks, must not allocate or free heap memory, and must not run any
//! diagnostics that do either. Everything it needs is prepared by the
//! parent before `fork()`; on any failure it dies via `_exit`, never via
//! the runtime teardown path.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::raw::{c_char, c_void};

use crate::context::process_context;

/// The single byte that releases a suspended-start child.
///
/// Anything else arriving on the wake pipe, including end-of-file from a
/// parent that died before resuming, is fatal to the child.
pub(crate) const WAKE_BYTE: u8 = 0x2A;

/// Exit status the child reports when the pre-exec sequence fails.
const CHILD_FAILURE: libc::c_int = libc::EXIT_FAILURE;

/// Everything the child needs, materialized before `fork()`.
///
/// The `*_ptrs` vectors are null-terminated views into the owned
/// `CString`s; keeping both here pins the backing storage for the whole
/// fork→exec window without any allocation in the child.
pub(crate) struct ChildLaunch
{
    pub exe: CString,
    #[allow(dead_code)] // owns the storage behind argv_ptrs
    pub argv: Vec<CString>,
    pub argv_ptrs: Vec<*const c_char>,
    #[allow(dead_code)] // owns the storage behind envp_ptrs
    pub envp: Option<Vec<CString>>,
    pub envp_ptrs: Option<Vec<*const c_char>>,
    pub cwd: Option<CString>,
    pub stdio: Option<[RawFd; 3]>,
    /// (read end for the child, write end owned by the parent)
    pub wake_pipe: Option<(RawFd, RawFd)>,
}

fn errno() -> i32
{
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Run the child side of the fork. Never returns.
///
/// ## Safety
///
/// Must be called exactly once, in the child, immediately after a `fork()`
/// whose setup populated `launch`. Calling it in a process with live
/// sibling threads violates the lock-free contract described in the module
/// docs.
pub(crate) unsafe fn execute(launch: &ChildLaunch) -> !
{
    // The runtime is uninitialized in this process now; a plain atomic
    // store is the only bookkeeping the child is allowed.
    process_context().reset_after_fork();

    // Clear the inherited signal mask.
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) != 0 {
        libc::_exit(CHILD_FAILURE);
    }

    if let Some((read_fd, write_fd)) = launch.wake_pipe {
        // The write end belongs to the resumer.
        libc::close(write_fd);

        let mut resume_code: u8 = 0;
        loop {
            let n = libc::read(read_fd, std::ptr::addr_of_mut!(resume_code).cast::<c_void>(), 1);
            if n == 1 {
                break;
            }
            if n == -1 && errno() == libc::EINTR {
                continue;
            }
            // read returning 0 means the other end was closed, e.g. because
            // the parent died before resuming us.
            libc::_exit(CHILD_FAILURE);
        }

        if resume_code != WAKE_BYTE {
            libc::_exit(CHILD_FAILURE);
        }

        libc::close(read_fd);
    }

    if let Some(cwd) = &launch.cwd {
        // Failure to switch directory is tolerated, as it is on the
        // original CreateProcess path.
        let _ = libc::chdir(cwd.as_ptr());
    }

    if let Some(fds) = launch.stdio {
        // dup2 closes the destination atomically before duplicating.
        for (source, target) in fds.iter().zip([libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]) {
            if libc::dup2(*source, target) == -1 {
                libc::_exit(CHILD_FAILURE);
            }
        }
        // The originals are no longer needed. A source that is itself a
        // standard descriptor has already been replaced or reused above
        // and must not be closed.
        for source in fds {
            if source > libc::STDERR_FILENO {
                libc::close(source);
            }
        }
    }

    match &launch.envp_ptrs {
        Some(envp) => {
            libc::execve(launch.exe.as_ptr(), launch.argv_ptrs.as_ptr(), envp.as_ptr());
        }
        None => {
            libc::execv(launch.exe.as_ptr(), launch.argv_ptrs.as_ptr());
        }
    }

    // exec only returns on failure.
    libc::_exit(CHILD_FAILURE)
}
