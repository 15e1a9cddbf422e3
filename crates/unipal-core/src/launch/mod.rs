//! # Process Launcher
//!
//! Windows-style `CreateProcess` on top of POSIX `fork`/`exec`.
//!
//! The launcher validates the whole request before touching any OS
//! resource, prepares every allocation the child will need while still in
//! the parent, and keeps the fork→exec window down to raw libc calls (see
//! [`child`] for the contract). A process launched with the
//! start-suspended flag blocks inside the child on a one-shot pipe until
//! [`ThreadHandle::resume`] delivers the wake byte.
//!
//! ## Failure behavior
//!
//! Every failure path releases everything acquired so far (close-on-exec
//! bits cleared during stdio preparation are restored, pipe descriptors are
//! closed) and returns an error with no process created. Once `fork()`
//! succeeds the launch cannot fail from the parent's perspective; exec
//! failures are fatal to the child only and surface later as an exit
//! status query.

mod child;
mod stdio;

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::raw::c_char;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tracing::{debug, info};

pub use stdio::{FileHandle, StdioRedirect};

use crate::context::process_context;
use crate::error::{PalError, PalResult};
use crate::registry::ProcessHandle;
use crate::types::ProcessId;

/// Launch the process's initial thread suspended; it will not run user
/// code until [`ThreadHandle::resume`] is called.
pub const CREATE_SUSPENDED: u32 = 0x0000_0004;

/// Accepted for compatibility; console allocation has no POSIX
/// equivalent, so the flag is validated and then ignored.
pub const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

const ALLOWED_FLAGS: u32 = CREATE_SUSPENDED | CREATE_NEW_CONSOLE;

/// A fully-specified launch request.
///
/// `argv[0]` is the executable path; command-line tokenization and PATH
/// resolution are the caller's business. The environment block, when
/// present, is a sequence of `KEY=VALUE` strings; an empty string
/// terminates it early, matching the null-delimited block it models.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest
{
    /// Application path override. Must be `None` in the current
    /// deployment; the field exists because the wire contract carries it.
    pub application_name: Option<String>,
    /// Program plus arguments; must be non-empty.
    pub argv: Vec<String>,
    /// Bitwise OR of `CREATE_*` flags.
    pub creation_flags: u32,
    /// Optional environment block (`KEY=VALUE` entries).
    pub environment: Option<Vec<String>>,
    /// Optional working directory for the child.
    pub current_directory: Option<PathBuf>,
    /// Optional standard-stream redirection.
    pub stdio: Option<StdioRedirect>,
}

impl LaunchRequest
{
    /// Request to launch `argv` with default settings.
    #[must_use]
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LaunchRequest {
            argv: argv.into_iter().map(Into::into).collect(),
            ..LaunchRequest::default()
        }
    }
}

/// Pseudo-handle for the initial "thread" of a launched process.
///
/// POSIX has no separately addressable initial thread, so this handle's
/// only real capability is releasing a suspended start. For processes
/// launched without `CREATE_SUSPENDED`, `resume` is a no-op.
#[derive(Debug)]
pub struct ThreadHandle
{
    resume_fd: Option<RawFd>,
}

impl ThreadHandle
{
    fn not_suspended() -> Self
    {
        ThreadHandle { resume_fd: None }
    }

    fn suspended(write_fd: RawFd) -> Self
    {
        ThreadHandle {
            resume_fd: Some(write_fd),
        }
    }

    /// Whether the child is still waiting on the wake pipe.
    #[must_use]
    pub fn is_suspended(&self) -> bool
    {
        self.resume_fd.is_some()
    }

    /// Deliver the wake byte to a suspended child.
    ///
    /// Idempotent: resuming a process that was not launched suspended, or
    /// that has already been resumed, does nothing.
    ///
    /// ## Errors
    ///
    /// `Internal` if the pipe write fails for any reason other than
    /// `EINTR` (retried).
    pub fn resume(&mut self) -> PalResult<()>
    {
        let Some(fd) = self.resume_fd.take() else {
            return Ok(());
        };

        let code = child::WAKE_BYTE;
        loop {
            let n = unsafe { libc::write(fd, std::ptr::addr_of!(code).cast(), 1) };
            if n == 1 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            unsafe { libc::close(fd) };
            return Err(PalError::Internal(format!("resume pipe write failed: {err}")));
        }

        unsafe { libc::close(fd) };
        debug!("suspended process resumed");
        Ok(())
    }
}

impl Drop for ThreadHandle
{
    fn drop(&mut self)
    {
        // Dropping an unresumed handle closes the pipe, which the child
        // treats as fatal. That is the documented way to discard a
        // suspended launch.
        if let Some(fd) = self.resume_fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

/// Everything a successful launch hands back.
#[derive(Debug)]
pub struct LaunchResult
{
    /// Handle over the new process record.
    pub process: ProcessHandle,
    /// Pseudo-handle for the initial thread (resume capability).
    pub thread: ThreadHandle,
    /// The OS pid of the child.
    pub pid: ProcessId,
}

/// Classification outcome for the executable path.
enum FileKind
{
    Executable,
    Missing,
    Directory,
}

fn classify_executable(path: &str) -> FileKind
{
    let Ok(metadata) = std::fs::metadata(path) else {
        return FileKind::Missing;
    };
    if metadata.is_dir() {
        return FileKind::Directory;
    }
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return FileKind::Missing;
    }
    FileKind::Executable
}

fn to_cstring(value: &str, what: &str) -> PalResult<CString>
{
    CString::new(value).map_err(|_| PalError::InvalidParameter(format!("{what} contains an interior nul byte")))
}

/// Convert the environment block into C strings, stopping at the first
/// empty entry (the block terminator).
fn build_environment(block: &[String]) -> PalResult<Vec<CString>>
{
    let mut entries = Vec::with_capacity(block.len());
    for entry in block {
        if entry.is_empty() {
            break;
        }
        entries.push(to_cstring(entry, "environment entry")?);
    }
    Ok(entries)
}

fn null_terminated_ptrs(strings: &[CString]) -> Vec<*const c_char>
{
    let mut ptrs: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Launch a new process.
///
/// Implements the Windows `CreateProcess` contract over `fork`/`exec`:
/// validation first, resource preparation second, `fork()` last. See the
/// module docs for the failure behavior and [`child`] for what the child
/// is allowed to do before `exec`.
///
/// ## Errors
///
/// - `InvalidParameter`: unsupported creation flags, a non-empty
///   application-name override, or an empty/malformed argv
/// - `InvalidHandle`: a stdio handle is not inheritable or cannot be
///   prepared
/// - `FileNotFound`: the executable is missing or not executable
/// - `AccessDenied`: the executable path is a directory
/// - `NotEnoughMemory`: the suspended-start pipe could not be created
/// - `Internal`: `fork()` itself failed
pub fn create_process(request: &LaunchRequest) -> PalResult<LaunchResult>
{
    info!(argv = ?request.argv, flags = request.creation_flags, "launching process");

    // -- Validation: reject before any OS resource is touched. --

    if let Some(name) = &request.application_name {
        return Err(PalError::InvalidParameter(format!(
            "application name override must be empty, got {name:?}"
        )));
    }

    if request.creation_flags & !ALLOWED_FLAGS != 0 {
        return Err(PalError::InvalidParameter(format!(
            "unsupported creation flags {:#x}",
            request.creation_flags & !ALLOWED_FLAGS
        )));
    }

    let Some(program) = request.argv.first() else {
        return Err(PalError::InvalidParameter("argv must not be empty".into()));
    };
    if program.is_empty() {
        return Err(PalError::InvalidParameter("argv[0] must not be empty".into()));
    }

    // -- Stdio preparation (restores close-on-exec on every exit path). --

    let prepared_stdio = match &request.stdio {
        Some(redirect) => Some(stdio::PreparedStdio::prepare(redirect)?),
        None => None,
    };

    // -- Executable classification. --

    match classify_executable(program) {
        FileKind::Executable => {}
        FileKind::Missing => {
            return Err(PalError::FileNotFound(program.clone()));
        }
        FileKind::Directory => {
            return Err(PalError::AccessDenied(format!("{program} is a directory")));
        }
    }

    // -- Materialize everything the child needs; no allocation after fork. --

    let exe = to_cstring(program, "program path")?;
    let argv: Vec<CString> = request
        .argv
        .iter()
        .map(|arg| to_cstring(arg, "argument"))
        .collect::<PalResult<_>>()?;
    let argv_ptrs = null_terminated_ptrs(&argv);

    let envp = match &request.environment {
        Some(block) => Some(build_environment(block)?),
        None => None,
    };
    let envp_ptrs = envp.as_deref().map(null_terminated_ptrs);

    let cwd = match &request.current_directory {
        Some(dir) => Some(to_cstring(&dir.to_string_lossy(), "working directory")?),
        None => None,
    };

    let record = process_context().registry().allocate();

    // -- Suspended-start pipe. --

    let wake_pipe = if request.creation_flags & CREATE_SUSPENDED != 0 {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(PalError::NotEnoughMemory(format!(
                "wake pipe creation failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // Keep both ends out of any concurrently exec'd child; this child
        // reads its end before exec, so close-on-exec is harmless to it.
        for fd in fds {
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        Some((fds[0], fds[1]))
    } else {
        None
    };

    let launch = child::ChildLaunch {
        exe,
        argv,
        argv_ptrs,
        envp,
        envp_ptrs,
        cwd,
        stdio: prepared_stdio.as_ref().map(stdio::PreparedStdio::fds),
        wake_pipe,
    };

    // -- Fork. --

    let pid = unsafe { libc::fork() };

    if pid == -1 {
        let err = PalError::from_os("fork");
        if let Some((read_fd, write_fd)) = wake_pipe {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
        }
        return Err(err);
    }

    if pid == 0 {
        // Child: restricted execution mode, never returns.
        unsafe { child::execute(&launch) }
    }

    // -- Parent. --

    if let Some((read_fd, _)) = wake_pipe {
        unsafe { libc::close(read_fd) };
    }

    let pid = ProcessId(pid as u32);
    record.record().set_pid(pid);
    process_context().registry().adopt(&record);

    // Stdio references are released here, after the record bookkeeping, so
    // no record lock is held while we touch the handles again.
    drop(prepared_stdio);

    let thread = match wake_pipe {
        Some((_, write_fd)) => ThreadHandle::suspended(write_fd),
        None => ThreadHandle::not_suspended(),
    };

    info!(%pid, "process launched");

    Ok(LaunchResult {
        process: record,
        thread,
        pid,
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn rejects_unknown_flags()
    {
        let mut request = LaunchRequest::new(["/bin/true"]);
        request.creation_flags = 0x4000;
        assert!(matches!(
            create_process(&request),
            Err(PalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn rejects_application_name_override()
    {
        let mut request = LaunchRequest::new(["/bin/true"]);
        request.application_name = Some("/bin/true".into());
        assert!(matches!(
            create_process(&request),
            Err(PalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn rejects_empty_argv()
    {
        let request = LaunchRequest::default();
        assert!(matches!(
            create_process(&request),
            Err(PalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn environment_block_stops_at_terminator()
    {
        let block = vec!["A=1".to_string(), String::new(), "B=2".to_string()];
        let converted = build_environment(&block).unwrap();
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].to_bytes(), b"A=1");
    }

    #[test]
    fn wrong_wake_byte_is_fatal_to_the_child()
    {
        let mut request = LaunchRequest::new(["/bin/true"]);
        request.creation_flags = CREATE_SUSPENDED;
        let launched = create_process(&request).expect("launch");

        // Bypass resume() and deliver a byte that is not the wake value;
        // the child must die with a failure status instead of executing.
        let fd = launched.thread.resume_fd.expect("suspended launch has a resume pipe");
        let bogus: u8 = 0x00;
        assert_eq!(unsafe { libc::write(fd, std::ptr::addr_of!(bogus).cast(), 1) }, 1);

        let pid = launched.pid.as_pid_t();
        let mut status: libc::c_int = 0;
        loop {
            let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
            if waited == pid {
                break;
            }
            assert_eq!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::EINTR),
                "waitpid failed"
            );
        }
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), libc::EXIT_FAILURE);
    }

    #[test]
    fn classify_missing_and_directory()
    {
        assert!(matches!(
            classify_executable("/definitely/not/here"),
            FileKind::Missing
        ));
        assert!(matches!(classify_executable("/tmp"), FileKind::Directory));
    }
}
