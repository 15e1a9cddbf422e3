//! # Process Status Cache
//!
//! Converts `waitpid`/`kill`-probe results into a cached, idempotent
//! (state, exit-code) pair.
//!
//! `waitpid` only works once per child (the kernel discards the status
//! after reaping), so the first successful observation is cached on the
//! process record and every later query is answered from the cache. A
//! status can also be asked for from a thread (or process) that is not the
//! target's parent; there `waitpid` structurally fails with `ECHILD` and
//! we fall back to probing liveness with signal 0.

use tracing::{error, trace, warn};

use crate::error::{PalError, PalResult};
use crate::registry::ProcessHandle;
use crate::types::{ProcessState, STILL_ACTIVE};

/// Exit code substituted when a process terminated but its real code is
/// unknowable (reaped elsewhere, or stopped without exiting).
const UNKNOWN_FAILURE_EXIT_CODE: u32 = libc::EXIT_FAILURE as u32;

fn errno() -> i32
{
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Query the (state, exit code) of a tracked process.
///
/// Once this has reported [`ProcessState::Done`] for a handle, every later
/// call returns the identical pair without reissuing the OS wait, even if
/// the underlying process has since been reaped by something else.
///
/// ## Exit-code derivation
///
/// - normal exit with code `N` → `N` (low 8 bits, all `waitpid` exposes)
/// - killed by signal `S` → `128 + S`
/// - terminated some other way → a fixed failure code
///
/// ## Non-child processes
///
/// When `waitpid` reports `ECHILD`, liveness is probed with `kill(pid, 0)`.
/// A dead non-child is reported as done with exit code 0: an
/// approximation, not a guarantee, since its true exit code is not
/// observable from here.
///
/// ## Errors
///
/// `InvalidHandle` if the handle carries no pid.
pub fn get_process_status(handle: &ProcessHandle) -> PalResult<(ProcessState, u32)>
{
    let record = handle.record();
    let pid = record.pid();
    if pid.raw() == 0 {
        return Err(PalError::InvalidHandle("process handle has no pid".into()));
    }

    let (state, code) = record.cached_status();
    if state == ProcessState::Done {
        trace!(%pid, code, "status served from cache");
        return Ok((state, code));
    }

    let mut status: libc::c_int = 0;
    let (state, code) = loop {
        let waited = unsafe { libc::waitpid(pid.as_pid_t(), &mut status, libc::WNOHANG) };

        if waited == pid.as_pid_t() {
            break (ProcessState::Done, derive_exit_code(status));
        }

        if waited == 0 {
            // Still running.
            break (ProcessState::Running, 0);
        }

        debug_assert_eq!(waited, -1);
        match errno() {
            libc::EINTR => {
                trace!(%pid, "waitpid interrupted; retrying");
            }
            libc::ECHILD => {
                // Not our child; probe liveness instead.
                break probe_non_child(pid.as_pid_t());
            }
            unexpected => {
                // Never fabricate a completion from an unknown failure.
                error!(%pid, errno = unexpected, "waitpid failed unexpectedly; treating process as running");
                break (ProcessState::Running, 0);
            }
        }
    };

    if state == ProcessState::Done {
        record.cache_done(code);
        // Re-read so concurrent queries all converge on one answer.
        return Ok(record.cached_status());
    }

    Ok((state, code))
}

/// Exit-code view of [`get_process_status`], with the Windows sentinel for
/// running processes.
pub fn get_exit_code(handle: &ProcessHandle) -> PalResult<u32>
{
    let (state, code) = get_process_status(handle)?;
    Ok(match state {
        ProcessState::Done => code,
        ProcessState::Running => STILL_ACTIVE,
    })
}

fn derive_exit_code(status: libc::c_int) -> u32
{
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status) as u32
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status) as u32
    } else {
        warn!(status, "process terminated without exiting; faking exit code");
        UNKNOWN_FAILURE_EXIT_CODE
    }
}

/// `ECHILD` fallback: decide liveness with a no-op signal.
fn probe_non_child(pid: libc::pid_t) -> (ProcessState, u32)
{
    if unsafe { libc::kill(pid, 0) } == 0 {
        return (ProcessState::Running, 0);
    }

    match errno() {
        libc::ESRCH => {
            // Gone, and it wasn't our child, so the exit code is lost.
            // Assume 0; this is an approximation (see module docs).
            warn!(pid, "non-child process already exited; assuming exit code 0");
            (ProcessState::Done, 0)
        }
        unexpected => {
            error!(pid, errno = unexpected, "kill(pid, 0) probe failed");
            (ProcessState::Done, UNKNOWN_FAILURE_EXIT_CODE)
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn exit_code_derivation()
    {
        // Normal exit: status layout is (code << 8).
        assert_eq!(derive_exit_code(7 << 8), 7);
        assert_eq!(derive_exit_code(0), 0);
        // Signaled: low 7 bits carry the signal.
        assert_eq!(derive_exit_code(libc::SIGKILL), 128 + 9);
        assert_eq!(derive_exit_code(libc::SIGTERM), 128 + 15);
    }
}
