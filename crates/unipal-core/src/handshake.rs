//! # Debugger Startup Handshake
//!
//! Lets a debugger that launched (or pre-registered interest in) this
//! process hold it at startup until the debugger is ready.
//!
//! Two transports, tried in order:
//!
//! 1. **FIFO pipes**: the debugger pre-creates
//!    `<tmp>/unipal-debug-pipe-<pid>-<key>-st` and `...-co`; we write a
//!    "started" byte to `st` and block reading a "continue" byte from `co`.
//! 2. **Named semaphores**: the debugger pre-creates
//!    `/unist<pid:08x><key:016x>` and `/unico...`; we post the startup
//!    semaphore and wait on the continue one.
//!
//! Pids recycle, so both rendezvous names embed a disambiguation key: the
//! OS-reported start time of the process. A debugger that recorded the key
//! for a dead pid will never collide with an unrelated process that later
//! received the same pid.
//!
//! Absence of the rendezvous objects is the common case (nobody is
//! debugging us) and is reported as "not launched by a debugger", never as
//! an error.

use std::ffi::CString;

use tracing::{debug, error, trace, warn};

use crate::context::process_context;
use crate::types::ProcessId;

const PIPE_NAME_PREFIX: &str = "unipal-debug-pipe";
const SEMAPHORE_NAME_PREFIX: &str = "/uni";
const STARTUP_SUFFIX: &str = "st";
const CONTINUE_SUFFIX: &str = "co";

/// POSIX named-semaphore name cap, matching what `sem_open` accepts on
/// each platform (`NAME_MAX - 4` on Linux).
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEM_NAME_MAX: usize = 31;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEM_NAME_MAX: usize = 255 - 4;

/// Delay between retries while a FIFO exists but has no reader yet.
const PIPE_OPEN_RETRY_DELAY_MS: i64 = 500;

/// Single-byte events carried over the startup/continue pipes.
const EVENT_STARTED: u8 = 1;
const EVENT_CONTINUE: u8 = 2;

/// Pipe-transport outcome; `Disabled` falls through to the semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeHandshake
{
    /// The debugger did not set up pipes; try the semaphore transport.
    Disabled,
    /// Pipes were present but the exchange failed.
    Failed,
    Succeeded,
}

fn errno() -> i32
{
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Perform the startup handshake if a debugger is waiting for this process.
///
/// Blocks until the debugger signals continue. Returns `true` when the
/// process was launched/registered for debugging and the handshake
/// completed, `false` when no debugger is waiting or the exchange failed;
/// startup proceeds either way.
pub fn notify_runtime_started() -> bool
{
    let pid = process_context().current_pid();
    let key = disambiguation_key(pid);

    match notify_using_pipes(pid, key) {
        PipeHandshake::Succeeded => {
            debug!("pipe handshake succeeded");
            true
        }
        PipeHandshake::Failed => {
            warn!("pipe handshake failed");
            false
        }
        PipeHandshake::Disabled => {
            trace!("no startup pipes; trying semaphores");
            notify_using_semaphores(pid, key)
        }
    }
}

fn pipe_name(pid: ProcessId, key: u64, suffix: &str) -> Option<CString>
{
    let path = std::env::temp_dir().join(format!("{PIPE_NAME_PREFIX}-{pid}-{key}-{suffix}"));
    CString::new(path.into_os_string().into_encoded_bytes()).ok()
}

/// `open` with retry semantics for FIFO rendezvous.
///
/// Opening the write side of a FIFO whose reader has not arrived yet fails
/// with `ENXIO` under `O_NONBLOCK`; that case is retried on a fixed delay.
/// On success the descriptor is switched back to blocking mode.
fn open_pipe(name: &CString, flags: libc::c_int) -> Option<libc::c_int>
{
    let fd = loop {
        let fd = unsafe { libc::open(name.as_ptr(), flags | libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if fd != -1 {
            break fd;
        }
        match errno() {
            libc::ENXIO if flags == libc::O_WRONLY => {
                let delay = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: PIPE_OPEN_RETRY_DELAY_MS * 1_000_000,
                };
                unsafe { libc::nanosleep(&delay, std::ptr::null_mut()) };
            }
            libc::EINTR => {}
            _ => return None,
        }
    };

    // Back to blocking for the actual exchange.
    let status_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if status_flags == -1
        || unsafe { libc::fcntl(fd, libc::F_SETFL, status_flags & !libc::O_NONBLOCK) } == -1
    {
        close_pipe(fd);
        return None;
    }

    Some(fd)
}

fn close_pipe(fd: libc::c_int)
{
    while unsafe { libc::close(fd) } < 0 && errno() == libc::EINTR {}
}

fn write_event(fd: libc::c_int, event: u8) -> bool
{
    loop {
        let n = unsafe { libc::write(fd, std::ptr::addr_of!(event).cast(), 1) };
        if n == 1 {
            return true;
        }
        if n == -1 && errno() != libc::EINTR {
            return false;
        }
    }
}

fn read_event(fd: libc::c_int) -> Option<u8>
{
    let mut event: u8 = 0;
    loop {
        let n = unsafe { libc::read(fd, std::ptr::addr_of_mut!(event).cast(), 1) };
        if n == 1 {
            return Some(event);
        }
        if n == -1 && errno() == libc::EINTR {
            continue;
        }
        return None;
    }
}

fn notify_using_pipes(pid: ProcessId, key: u64) -> PipeHandshake
{
    let absent = |err: i32| err == libc::ENOENT || err == libc::EACCES;

    let Some(continue_name) = pipe_name(pid, key, CONTINUE_SUFFIX) else {
        return PipeHandshake::Failed;
    };
    trace!(name = ?continue_name, "opening continue pipe");
    let Some(continue_fd) = open_pipe(&continue_name, libc::O_RDONLY) else {
        return if absent(errno()) {
            PipeHandshake::Disabled
        } else {
            error!(name = ?continue_name, errno = errno(), "opening continue pipe failed");
            PipeHandshake::Failed
        };
    };

    let startup_fd = pipe_name(pid, key, STARTUP_SUFFIX).and_then(|name| {
        trace!(name = ?name, "opening startup pipe");
        open_pipe(&name, libc::O_WRONLY)
    });
    let Some(startup_fd) = startup_fd else {
        let result = if absent(errno()) {
            PipeHandshake::Disabled
        } else {
            error!(errno = errno(), "opening startup pipe failed");
            PipeHandshake::Failed
        };
        close_pipe(continue_fd);
        return result;
    };

    let result = if !write_event(startup_fd, EVENT_STARTED) {
        error!(errno = errno(), "writing started event failed");
        PipeHandshake::Failed
    } else {
        trace!("waiting on continue event");
        match read_event(continue_fd) {
            Some(EVENT_CONTINUE) => PipeHandshake::Succeeded,
            other => {
                error!(?other, "invalid continue event");
                PipeHandshake::Failed
            }
        }
    };

    close_pipe(startup_fd);
    close_pipe(continue_fd);
    result
}

/// Build a named-semaphore rendezvous name.
///
/// Name overflow would make the two sides rendezvous on different
/// (truncated) names, so it degrades to "not launched" instead.
fn semaphore_name(pid: ProcessId, key: u64, suffix: &str) -> Option<CString>
{
    let name = format!("{SEMAPHORE_NAME_PREFIX}{suffix}{:08x}{key:016x}", pid.raw());
    if name.len() > SEM_NAME_MAX {
        warn!(%name, "semaphore name exceeds the platform limit");
        return None;
    }
    CString::new(name).ok()
}

fn notify_using_semaphores(pid: ProcessId, key: u64) -> bool
{
    let Some(startup_name) = semaphore_name(pid, key, STARTUP_SUFFIX) else {
        return false;
    };
    let Some(continue_name) = semaphore_name(pid, key, CONTINUE_SUFFIX) else {
        return false;
    };
    trace!(startup = ?startup_name, cont = ?continue_name, "opening startup semaphores");

    // The debugger creates both semaphores before we start; absence of the
    // startup one means nobody is waiting for us.
    let startup_sem = unsafe { libc::sem_open(startup_name.as_ptr(), 0) };
    if startup_sem == libc::SEM_FAILED {
        trace!(errno = errno(), "startup semaphore absent; not launched by a debugger");
        return false;
    }

    let continue_sem = unsafe { libc::sem_open(continue_name.as_ptr(), 0) };
    if continue_sem == libc::SEM_FAILED {
        error!(errno = errno(), "continue semaphore missing while startup exists");
        unsafe { libc::sem_close(startup_sem) };
        return false;
    }

    let launched = 'exchange: {
        if unsafe { libc::sem_post(startup_sem) } != 0 {
            error!(errno = errno(), "sem_post on the startup semaphore failed");
            break 'exchange false;
        }

        loop {
            if unsafe { libc::sem_wait(continue_sem) } == 0 {
                break 'exchange true;
            }
            if errno() == libc::EINTR {
                trace!("sem_wait interrupted; re-waiting");
                continue;
            }
            error!(errno = errno(), "sem_wait on the continue semaphore failed");
            break 'exchange false;
        }
    };

    unsafe {
        libc::sem_close(startup_sem);
        libc::sem_close(continue_sem);
    }
    launched
}

/// Stable per-incarnation key telling two processes with a recycled pid
/// apart.
///
/// On Linux this is the `starttime` field of `/proc/<pid>/stat`, in clock
/// ticks since boot. Both sides of the handshake must compute the same
/// value, so any failure yields the agreed-upon fallback of 0 rather than
/// an error.
#[must_use]
pub fn disambiguation_key(pid: ProcessId) -> u64
{
    #[cfg(target_os = "linux")]
    {
        match linux_start_time(pid) {
            Some(key) => key,
            None => {
                warn!(%pid, "could not read process start time; using key 0");
                0
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        0
    }
}

#[cfg(target_os = "linux")]
fn linux_start_time(pid: ProcessId) -> Option<u64>
{
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces and parentheses; everything after
    // the last ')' is well-formed space-separated fields, starting with
    // field 3 (state). starttime is field 22.
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn semaphore_names_are_fixed_width_and_fit()
    {
        let name = semaphore_name(ProcessId(0x1234), 0xdead_beef, STARTUP_SUFFIX).unwrap();
        let name = name.to_str().unwrap();
        assert_eq!(name, "/unist0000123400000000deadbeef");
        // Must fit even the tightest platform cap (31 on apple).
        assert!(name.len() <= 31);
        assert_eq!(
            semaphore_name(ProcessId(0x1234), 0xdead_beef, CONTINUE_SUFFIX)
                .unwrap()
                .to_str()
                .unwrap(),
            "/unico0000123400000000deadbeef"
        );
    }

    #[test]
    fn pipe_names_embed_pid_key_and_role()
    {
        let name = pipe_name(ProcessId(77), 99, STARTUP_SUFFIX).unwrap();
        let name = name.to_str().unwrap();
        assert!(name.ends_with("unipal-debug-pipe-77-99-st"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_start_time_is_nonzero()
    {
        let key = disambiguation_key(ProcessId(std::process::id()));
        assert_ne!(key, 0);
    }

    #[test]
    fn missing_key_source_degrades_to_zero()
    {
        // No pid this large exists, so the key source is unreadable.
        assert_eq!(disambiguation_key(ProcessId(0x3FFF_FFFD)), 0);
    }

    #[test]
    fn handshake_without_debugger_reports_not_launched()
    {
        // No rendezvous objects exist for this pid, so both transports
        // report absence without blocking.
        assert!(!notify_runtime_started());
    }
}
