//! Process and thread identifier types.

use std::fmt;

/// Process identifier (PID)
///
/// A PID is a unique number assigned to each running process by the
/// operating system. On Unix-like systems PIDs are 32-bit integers; we keep
/// the unsigned view the managed runtime expects.
///
/// ## Why wrap it in a struct?
///
/// Using a newtype pattern (`struct ProcessId(u32)`) instead of a raw `u32`
/// provides:
/// - **Type safety**: Prevents accidentally passing a random number where a PID is expected
/// - **Self-documenting code**: Makes it clear what the value represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// Get the raw `u32` value.
    #[must_use]
    pub fn raw(self) -> u32
    {
        self.0
    }

    /// The raw value as the libc `pid_t` the OS calls expect.
    #[must_use]
    pub fn as_pid_t(self) -> libc::pid_t
    {
        self.0 as libc::pid_t
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// Identifies an OS thread of the runtime process. The representation is
/// platform-specific:
///
/// - **Linux**: kernel thread id (TID) from `gettid()`
/// - **macOS and other Unix**: the `pthread_t` value
///
/// We store it as a `u64` to provide a platform-agnostic interface. The
/// value is never zero for a live thread, which lets the termination and
/// crash-dump ownership tokens use zero as their "unclaimed" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier.
    #[must_use]
    pub fn raw(self) -> u64
    {
        self.0
    }

    /// Identifier of the calling OS thread.
    #[must_use]
    pub fn current() -> Self
    {
        #[cfg(target_os = "linux")]
        {
            ThreadId(unsafe { libc::gettid() } as u64)
        }

        #[cfg(not(target_os = "linux"))]
        {
            ThreadId(unsafe { libc::pthread_self() } as u64)
        }
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a tracked process
///
/// The only transition is `Running` → `Done`, performed under the record's
/// write lock when the status cache first observes termination. There is no
/// way back: once a record is `Done`, its exit code is served from the cache
/// and the OS wait call is never reissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState
{
    /// Process has been forked and has not been observed to terminate
    Running,
    /// Process terminated; the exit code on the record is final
    Done,
}

/// Exit-code sentinel reported for a process that is still running
///
/// Mirrors the Windows `STILL_ACTIVE` constant (259). A process that
/// legitimately exits with code 259 is indistinguishable from a running
/// one through the exit-code query alone; callers that care should consult
/// the state instead.
pub const STILL_ACTIVE: u32 = 259;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn process_id_roundtrip()
    {
        let pid = ProcessId::from(4242);
        assert_eq!(pid.raw(), 4242);
        assert_eq!(u32::from(pid), 4242);
        assert_eq!(pid.as_pid_t(), 4242);
    }

    #[test]
    fn current_thread_id_is_nonzero()
    {
        assert_ne!(ThreadId::current().raw(), 0);
    }

    #[test]
    fn current_thread_id_is_stable()
    {
        assert_eq!(ThreadId::current(), ThreadId::current());
    }
}
