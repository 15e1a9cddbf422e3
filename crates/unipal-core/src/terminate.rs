//! # Termination Controller
//!
//! Single-writer state machine for `ExitProcess` / `TerminateProcess`.
//!
//! The process is either in its normal state or terminating, and the
//! transition happens exactly once: the first thread to compare-and-swap
//! its id into the [`TERMINATOR`] token owns the whole shutdown. Every
//! other thread that reaches a termination entry point afterwards is
//! parked forever: it must never return, because the owner is unwinding
//! the process underneath it. There is deliberately no mutex here; a
//! losing thread is not supposed to ever proceed, which a mutex cannot
//! express.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::context::process_context;
use crate::dump;
use crate::error::{PalError, PalResult};
use crate::registry::ProcessHandle;
use crate::types::ThreadId;

/// Identity of the thread that first initiated termination; zero while the
/// process is in its normal state. Written exactly once, via CAS.
static TERMINATOR: AtomicU64 = AtomicU64::new(0);

/// Outcome of trying to claim the termination token.
enum Claim
{
    /// This thread just became the owner.
    Owner,
    /// This thread already owned the token (re-entrant termination, e.g.
    /// from a static-destruction path).
    Reentered,
}

/// Park the calling thread permanently.
///
/// Used for threads that lose a termination or crash-dump ownership race;
/// the process is going away, so they must simply never run again.
pub(crate) fn park_forever() -> !
{
    loop {
        unsafe {
            libc::poll(std::ptr::null_mut(), 0, -1);
        }
    }
}

/// Claim the termination token, parking losers forever.
fn claim_termination() -> Claim
{
    let me = ThreadId::current().raw();
    let previous = TERMINATOR.compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst);

    match previous {
        Ok(_) => Claim::Owner,
        Err(owner) if owner == me => Claim::Reentered,
        Err(owner) => {
            warn!(owner, "termination already started from another thread; blocking");
            park_forever()
        }
    }
}

/// Terminate the current process the `ExitProcess` way.
///
/// The owning thread runs the registered shutdown callback, releases the
/// runtime, and exits with the low 8 bits of `code`. A thread re-entering
/// its own termination proceeds straight to the exit primitive when the
/// runtime is no longer initialized. Threads that lose the ownership race
/// never return.
pub fn exit_process(code: u32) -> !
{
    match claim_termination() {
        Claim::Reentered => {
            // Re-entrant call; either finish the job or just leave.
            if process_context().is_initialized() {
                warn!("thread re-entered exit_process");
                end_process(code, false)
            }
            unsafe { libc::exit(code as libc::c_int) }
        }
        Claim::Owner => end_process(code, false),
    }
}

/// Terminate a process the `TerminateProcess` way.
///
/// For a handle denoting another OS process this sends `SIGKILL` and
/// returns; local shutdown does not run. For the current process it
/// performs the same ownership race as [`exit_process`] but skips the
/// shutdown callback, and dies by an abort signal instead of `exit` so
/// the termination is observable as a fault for dump/reporting purposes.
/// In that case this function never returns.
///
/// ## Errors
///
/// - `InvalidHandle`: the handle has no pid, or the target no longer
///   exists (`ESRCH`)
/// - `AccessDenied`: the OS refused the signal (`EPERM`)
/// - `Internal`: any other `kill` failure
pub fn terminate_process(handle: &ProcessHandle, code: u32) -> PalResult<()>
{
    let pid = handle.pid();
    if pid.raw() == 0 {
        return Err(PalError::InvalidHandle("process handle has no pid".into()));
    }

    if pid != process_context().current_pid() {
        if code != 0 {
            warn!(%pid, code, "exit code ignored for external process");
        }

        if unsafe { libc::kill(pid.as_pid_t(), libc::SIGKILL) } == 0 {
            return Ok(());
        }

        return Err(match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => PalError::InvalidHandle(format!("no process with pid {pid}")),
            Some(libc::EPERM) => PalError::AccessDenied(format!("not permitted to kill pid {pid}")),
            _ => PalError::from_os("kill"),
        });
    }

    // Terminating ourselves.
    match claim_termination() {
        Claim::Owner | Claim::Reentered => end_process(code, true),
    }
}

/// Shared tail of both termination entry points. Only ever runs on the
/// thread owning [`TERMINATOR`].
fn end_process(code: u32, terminate_unconditionally: bool) -> !
{
    if terminate_unconditionally {
        if code != 0 {
            warn!(code, "exit code ignored for terminate");
        }
    } else if code & 0xff != code {
        // exit() only surfaces the low 8 bits to waiters.
        warn!(
            code,
            truncated = code & 0xff,
            "exit only supports the lower 8 bits of an exit code"
        );
    }

    let ctx = process_context();
    if terminate_unconditionally {
        // Unconditional terminate skips the shutdown callback; the abort
        // path below still runs the process shutdown notification once.
        let sig = if code == 128 + libc::SIGTERM as u32 {
            libc::SIGTERM
        } else {
            libc::SIGABRT
        };
        dump::abort_process(sig)
    }

    ctx.notify_shutdown();
    if ctx.is_initialized() {
        ctx.mark_shutdown();
    }

    unsafe { libc::exit((code & 0xff) as libc::c_int) }
}

#[cfg(test)]
mod tests
{
    use std::os::unix::process::ExitStatusExt;

    use super::*;
    use crate::types::ProcessId;

    #[test]
    fn terminate_nonexistent_pid_is_invalid_handle()
    {
        // Max pid space on Linux is < 2^22 by default; this pid can't exist.
        let handle = process_context()
            .registry()
            .open_by_pid(ProcessId(0x3FFF_FFFE))
            .unwrap();
        assert!(matches!(
            terminate_process(&handle, 0),
            Err(PalError::InvalidHandle(_))
        ));
    }

    /// Reap a forked test child, retrying EINTR.
    fn wait_status(pid: libc::pid_t) -> libc::c_int
    {
        let mut status: libc::c_int = 0;
        loop {
            let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
            if waited == pid {
                return status;
            }
            assert_eq!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::EINTR),
                "waitpid failed"
            );
        }
    }

    #[test]
    fn exit_process_masks_the_exit_code()
    {
        // The shutdown body runs in a forked copy so the harness survives.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            exit_process(0x107)
        }

        let status = wait_status(pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0x07);
    }

    #[test]
    fn self_terminate_dies_by_abort_signal()
    {
        // Take the handle before forking; the child must not touch the
        // registry lock, which a sibling test thread may hold at the fork
        // instant.
        let own = process_context().registry().current_process();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            let _ = terminate_process(&own, 0);
            // Self-terminate never returns; exiting cleanly here would
            // mean the unconditional path was not taken.
            unsafe { libc::_exit(0) }
        }

        let status = wait_status(pid);
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGABRT);
    }

    #[test]
    fn terminate_external_process_kills_it()
    {
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let handle = process_context()
            .registry()
            .open_by_pid(ProcessId(child.id()))
            .unwrap();

        terminate_process(&handle, 0).expect("kill should succeed");

        let status = child.wait().expect("wait");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
