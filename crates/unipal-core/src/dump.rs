//! # Crash Dump Pipeline
//!
//! Builds the dump-utility command line once at startup, then forks/execs
//! (or invokes an embedded callback) to produce a crash dump of this
//! process.
//!
//! Everything allocation-heavy happens in [`abort_initialize`], ahead of
//! time: at actual crash time the common case only clones a prepared
//! argument vector. Dump generation is serialized across threads with the
//! same compare-and-swap ownership token the termination controller uses:
//! the first crashing thread generates the dump, any other thread that
//! faults meanwhile parks forever, and a thread that faults *while already
//! generating its own dump* gets an immediate failure instead of infinite
//! recursion.

use std::ffi::CString;
use std::fmt::Write as _;
use std::os::raw::c_char;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info};

use crate::context::process_context;
use crate::terminate::park_forever;
use crate::types::ThreadId;

/// Name of the external dump-generation utility, expected to live in the
/// configured runtime directory.
const DUMP_GENERATOR_NAME: &str = "createdump";

/// Kind of dump to request from the utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpType
{
    /// Stacks and essential metadata only
    Normal,
    /// Normal plus the GC heap
    WithHeap,
    /// Smallest dump suitable for automated triage
    Triage,
    /// Everything
    Full,
}

impl DumpType
{
    fn flag(self) -> &'static str
    {
        match self {
            DumpType::Normal => "--normal",
            DumpType::WithHeap => "--withheap",
            DumpType::Triage => "--triage",
            DumpType::Full => "--full",
        }
    }
}

impl FromStr for DumpType
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "1" | "normal" => Ok(DumpType::Normal),
            "2" | "withheap" | "with-heap" => Ok(DumpType::WithHeap),
            "3" | "triage" => Ok(DumpType::Triage),
            "4" | "full" => Ok(DumpType::Full),
            _ => Err(format!("Unknown dump type: {s}. Use normal, withheap, triage or full")),
        }
    }
}

/// Process-wide dump configuration, read once at startup.
///
/// The environment variables mirror the knobs the managed runtime exposes:
/// `UNIPAL_ENABLE_DUMP`, `UNIPAL_DUMP_NAME`, `UNIPAL_DUMP_TYPE`,
/// `UNIPAL_DUMP_LOG_TO_FILE`, `UNIPAL_DUMP_DIAG`, `UNIPAL_DUMP_VERBOSE`,
/// `UNIPAL_CRASH_REPORT`, `UNIPAL_CRASH_REPORT_ONLY`,
/// `UNIPAL_RUNTIME_DIR`, `UNIPAL_SINGLE_FILE`.
#[derive(Debug, Clone, Default)]
pub struct DumpConfig
{
    /// Master switch; when false, [`abort_initialize`] installs nothing and
    /// crashes abort without a dump.
    pub enabled: bool,
    /// Value for `--name`
    pub name: Option<String>,
    /// Dump kind; `None` lets the utility pick its own default
    pub dump_type: Option<DumpType>,
    /// Value for `--logtofile`
    pub log_to_file: Option<String>,
    /// `--diag`
    pub diag: bool,
    /// `--verbose`
    pub verbose: bool,
    /// `--crashreport`
    pub crash_report: bool,
    /// `--crashreportonly`
    pub crash_report_only: bool,
    /// Directory containing the dump utility; defaults to the directory of
    /// the current executable
    pub runtime_dir: Option<PathBuf>,
    /// `--singlefile`: the runtime is statically linked into the host
    pub single_file: bool,
}

fn env_flag(name: &str) -> bool
{
    std::env::var(name).is_ok_and(|v| v == "1")
}

impl DumpConfig
{
    /// Read the configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self
    {
        DumpConfig {
            enabled: env_flag("UNIPAL_ENABLE_DUMP"),
            name: std::env::var("UNIPAL_DUMP_NAME").ok(),
            dump_type: std::env::var("UNIPAL_DUMP_TYPE")
                .ok()
                .and_then(|v| DumpType::from_str(&v).ok()),
            log_to_file: std::env::var("UNIPAL_DUMP_LOG_TO_FILE").ok(),
            diag: env_flag("UNIPAL_DUMP_DIAG"),
            verbose: env_flag("UNIPAL_DUMP_VERBOSE"),
            crash_report: env_flag("UNIPAL_CRASH_REPORT"),
            crash_report_only: env_flag("UNIPAL_CRASH_REPORT_ONLY"),
            runtime_dir: std::env::var("UNIPAL_RUNTIME_DIR").ok().map(PathBuf::from),
            single_file: env_flag("UNIPAL_SINGLE_FILE"),
        }
    }
}

/// Immutable dump-utility argument vector: utility path, flags, target pid
/// last. Computed once; per-event arguments are spliced in before the pid.
#[derive(Debug, Clone)]
pub struct DumpCommandTemplate
{
    argv: Vec<CString>,
}

impl DumpCommandTemplate
{
    /// Build the command line for `config`, targeting `pid`.
    ///
    /// Pure: no side effects, so it can be unit tested and safely run at
    /// startup.
    pub fn build(config: &DumpConfig, pid: u32) -> Option<Self>
    {
        let runtime_dir = match &config.runtime_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_exe().ok()?.parent()?.to_path_buf(),
        };
        let program = runtime_dir.join(DUMP_GENERATOR_NAME);

        let mut argv: Vec<String> = vec![program.to_string_lossy().into_owned()];

        if let Some(name) = &config.name {
            argv.push("--name".into());
            argv.push(name.clone());
        }

        if let Some(dump_type) = config.dump_type {
            argv.push(dump_type.flag().into());
        }

        if config.diag {
            argv.push("--diag".into());
        }
        if config.verbose {
            argv.push("--verbose".into());
        }
        if config.crash_report {
            argv.push("--crashreport".into());
        }
        if config.crash_report_only {
            argv.push("--crashreportonly".into());
        }
        if config.single_file {
            argv.push("--singlefile".into());
        }

        if let Some(log_file) = &config.log_to_file {
            argv.push("--logtofile".into());
            argv.push(log_file.clone());
        }

        argv.push(pid.to_string());

        let argv = argv.into_iter().map(|arg| CString::new(arg).ok()).collect::<Option<_>>()?;
        Some(DumpCommandTemplate { argv })
    }

    /// The argument vector, utility path first, pid last.
    #[must_use]
    pub fn argv(&self) -> &[CString]
    {
        &self.argv
    }

    /// Clone the template with event-specific arguments spliced in before
    /// the trailing pid.
    fn with_event(&self, signal: i32, event: Option<&CrashEvent>) -> Vec<CString>
    {
        let mut argv = self.argv.clone();
        let pid = argv.pop().expect("template always ends with the pid");

        let mut push = |flag: &str, value: String| {
            argv.push(CString::new(flag).expect("static flag"));
            argv.push(CString::new(value).expect("formatted integer"));
        };

        push("--signal", signal.to_string());
        // This runs on the crashing thread by construction.
        push("--crashthread", ThreadId::current().raw().to_string());

        if let Some(event) = event {
            push("--code", event.code.to_string());
            push("--errno", event.errno.to_string());
            push("--address", event.address.to_string());
        }

        argv.push(pid);
        argv
    }
}

/// Fault details captured by a signal handler, for the dump command line.
#[derive(Debug, Clone, Copy)]
pub struct CrashEvent
{
    /// `siginfo_t.si_code`
    pub code: i32,
    /// `siginfo_t.si_errno`
    pub errno: i32,
    /// Faulting address, when the signal carries one
    pub address: u64,
}

/// Statically-linked dump generator, for single-binary deployments where
/// there is no external `createdump` to exec. Runs in the forked child.
pub type CreateDumpCallback = fn(argv: &[CString]) -> i32;

static DUMP_TEMPLATE: OnceCell<DumpCommandTemplate> = OnceCell::new();
static CREATEDUMP_CALLBACK: OnceCell<CreateDumpCallback> = OnceCell::new();

/// Identity of the thread currently producing a crash dump; zero when none
/// is. Claimed by CAS, never released; one dump per process lifetime.
static CRASH_GUARD: AtomicU64 = AtomicU64::new(0);

/// Prepare the dump pipeline from `config`.
///
/// Must run during startup, before any fault can happen: it performs all
/// the allocation so the crash path doesn't have to. A disabled config is
/// not an error; it simply leaves the pipeline uninstalled.
///
/// Returns `false` only when dumps are enabled but the command line could
/// not be built.
pub fn abort_initialize(config: &DumpConfig) -> bool
{
    if !config.enabled {
        debug!("crash dumps disabled by configuration");
        return true;
    }

    let pid = process_context().current_pid().raw();
    match DumpCommandTemplate::build(config, pid) {
        Some(template) => {
            info!(argv = ?template.argv, "crash dump pipeline armed");
            let _ = DUMP_TEMPLATE.set(template);
            true
        }
        None => {
            error!("failed to build crash dump command line");
            false
        }
    }
}

/// Install the statically-linked dump generator.
///
/// Only the first registration wins.
pub fn set_createdump_callback(callback: CreateDumpCallback)
{
    let _ = CREATEDUMP_CALLBACK.set(callback);
}

fn errno() -> i32
{
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn write_error(buffer: Option<&mut [u8]>, message: &str)
{
    if let Some(buffer) = buffer {
        let n = buffer.len().saturating_sub(1).min(message.len());
        buffer[..n].copy_from_slice(&message.as_bytes()[..n]);
        if n < buffer.len() {
            buffer[n] = 0;
        }
    }
}

/// Run the dump utility (or embedded callback) over this process.
///
/// With `serialize`, the crash guard token is claimed first: a thread
/// re-entering its own dump generation fails immediately, and any other
/// thread finding the guard held parks forever.
///
/// The child's stderr is redirected into `error_buffer` when one is
/// supplied, capped at the buffer size. Success means the child exited
/// with status 0.
pub fn create_crash_dump(argv: &[CString], mut error_buffer: Option<&mut [u8]>, serialize: bool) -> bool
{
    debug_assert!(!argv.is_empty());

    if serialize {
        let me = ThreadId::current().raw();
        match CRASH_GUARD.compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(owner) if owner == me => {
                // Fault during our own dump generation; bail out rather
                // than recurse.
                return false;
            }
            Err(_) => {
                // The first thread generates the crash info; everyone else
                // is done running.
                park_forever()
            }
        }
    }

    // Pointer vector prepared before fork; the child must not allocate.
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let mut pipe_fds = [0; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } == -1 {
        let mut message = String::new();
        let _ = write!(message, "Problem launching createdump: pipe() FAILED errno {}", errno());
        error!("{message}");
        write_error(error_buffer, &message);
        return false;
    }
    let [read_fd, write_fd] = pipe_fds;

    let childpid = unsafe { libc::fork() };

    if childpid == -1 {
        let mut message = String::new();
        let _ = write!(message, "Problem launching createdump: fork() FAILED errno {}", errno());
        error!("{message}");
        write_error(error_buffer, &message);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return false;
    }

    if childpid == 0 {
        // Child. Raw calls only; see the launcher's post-fork contract.
        unsafe {
            libc::close(read_fd);
            if error_buffer.is_some() {
                libc::dup2(write_fd, libc::STDERR_FILENO);
            }
        }

        if let Some(callback) = CREATEDUMP_CALLBACK.get() {
            // Single-binary deployment: run the generator in-process and
            // leave before any runtime machinery can wake up.
            let result = callback(argv);
            unsafe { libc::exit(result) }
        }

        unsafe {
            libc::execv(argv_ptrs[0], argv_ptrs.as_ptr());
            // exec only returns on failure; stderr reaches the parent's
            // drain loop below when capture was requested.
            libc::_exit(-1)
        }
    }

    // Parent.
    #[cfg(target_os = "linux")]
    unsafe {
        // Give the child permission to use /proc/<pid>/mem and ptrace.
        // Ignore failures: some distros don't support the option and
        // createdump works there anyway.
        if libc::prctl(libc::PR_SET_PTRACER, childpid as libc::c_ulong, 0, 0, 0) == -1 {
            tracing::warn!(errno = errno(), "prctl(PR_SET_PTRACER) failed");
        }
    }

    unsafe { libc::close(write_fd) };

    if let Some(buffer) = error_buffer.as_deref_mut() {
        let mut total = 0usize;
        loop {
            let room = buffer.len().saturating_sub(total + 1);
            if room == 0 {
                break;
            }
            let n = unsafe { libc::read(read_fd, buffer[total..].as_mut_ptr().cast(), room) };
            if n > 0 {
                total += n as usize;
            } else if n == -1 && errno() == libc::EINTR {
                continue;
            } else {
                break;
            }
        }
        if let Some(slot) = buffer.get_mut(total) {
            *slot = 0;
        }
        if total > 0 {
            let captured = String::from_utf8_lossy(&buffer[..total]);
            error!(%captured, "createdump reported errors");
        }
    }
    unsafe { libc::close(read_fd) };

    let mut status: libc::c_int = 0;
    loop {
        let waited = unsafe { libc::waitpid(childpid, &mut status, 0) };
        if waited == childpid {
            break;
        }
        if waited == -1 && errno() == libc::EINTR {
            continue;
        }
        error!(childpid, errno = errno(), "problem waiting for createdump");
        return false;
    }

    let succeeded = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
    if succeeded {
        info!("crash dump generation finished");
    } else {
        error!(status, "createdump failed");
    }
    succeeded
}

/// Generate a crash dump for `signal` if the pipeline is armed.
///
/// Callable from the unhandled-fault path; the common case performs no
/// allocation beyond cloning the prepared argument vector.
pub fn create_crash_dump_if_enabled(signal: i32, event: Option<&CrashEvent>, serialize: bool)
{
    let Some(template) = DUMP_TEMPLATE.get() else {
        return;
    };

    let argv = if signal != 0 {
        template.with_event(signal, event)
    } else {
        template.argv.clone()
    };

    create_crash_dump(&argv, None, serialize);
}

/// Generate a dump on demand, outside any crash.
///
/// Builds a one-off command line from `config` (ignoring the armed
/// template and its enabled flag) and runs it without serialization,
/// capturing the utility's stderr into `error_buffer`.
pub fn generate_core_dump(config: &DumpConfig, error_buffer: Option<&mut [u8]>) -> bool
{
    let pid = process_context().current_pid().raw();
    let Some(template) = DumpCommandTemplate::build(config, pid) else {
        error!("failed to build on-demand dump command line");
        return false;
    };
    create_crash_dump(template.argv(), error_buffer, false)
}

/// Abort the process after running shutdown cleanup and the dump pipeline.
///
/// This is the terminal path for `TerminateProcess(self)` and for fatal
/// invariant violations; it should be called instead of `abort()` directly
/// so a dump and the shutdown notification still happen.
pub fn abort_process(signal: i32) -> !
{
    process_context().notify_shutdown();

    create_crash_dump_if_enabled(signal, None, true);

    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn cstr_args(template: &DumpCommandTemplate) -> Vec<String>
    {
        template
            .argv()
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    fn base_config() -> DumpConfig
    {
        DumpConfig {
            enabled: true,
            runtime_dir: Some(PathBuf::from("/opt/runtime")),
            ..DumpConfig::default()
        }
    }

    #[test]
    fn template_minimal()
    {
        let template = DumpCommandTemplate::build(&base_config(), 1234).unwrap();
        assert_eq!(cstr_args(&template), vec!["/opt/runtime/createdump", "1234"]);
    }

    #[test]
    fn template_full_flags()
    {
        let config = DumpConfig {
            name: Some("core.dmp".into()),
            dump_type: Some(DumpType::WithHeap),
            log_to_file: Some("/tmp/dump.log".into()),
            diag: true,
            verbose: true,
            crash_report: true,
            crash_report_only: true,
            single_file: true,
            ..base_config()
        };
        let template = DumpCommandTemplate::build(&config, 42).unwrap();
        assert_eq!(
            cstr_args(&template),
            vec![
                "/opt/runtime/createdump",
                "--name",
                "core.dmp",
                "--withheap",
                "--diag",
                "--verbose",
                "--crashreport",
                "--crashreportonly",
                "--singlefile",
                "--logtofile",
                "/tmp/dump.log",
                "42",
            ]
        );
    }

    #[test]
    fn event_args_spliced_before_pid()
    {
        let template = DumpCommandTemplate::build(&base_config(), 99).unwrap();
        let event = CrashEvent {
            code: 1,
            errno: 0,
            address: 0xdead,
        };
        let argv: Vec<String> = template
            .with_event(libc::SIGSEGV, Some(&event))
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();

        assert_eq!(argv.last().unwrap(), "99");
        let signal_at = argv.iter().position(|a| a == "--signal").unwrap();
        assert_eq!(argv[signal_at + 1], libc::SIGSEGV.to_string());
        assert!(argv.contains(&"--crashthread".to_string()));
        assert_eq!(argv[argv.iter().position(|a| a == "--address").unwrap() + 1], 0xdeadu64.to_string());
    }

    #[test]
    fn dump_type_parsing()
    {
        assert_eq!(DumpType::from_str("2").unwrap(), DumpType::WithHeap);
        assert_eq!(DumpType::from_str("full").unwrap(), DumpType::Full);
        assert_eq!(DumpType::from_str("with-heap").unwrap(), DumpType::WithHeap);
        assert!(DumpType::from_str("gigantic").is_err());
    }

    #[test]
    fn write_error_caps_at_buffer()
    {
        let mut buffer = [0xffu8; 8];
        write_error(Some(&mut buffer), "0123456789");
        assert_eq!(&buffer[..7], b"0123456");
        assert_eq!(buffer[7], 0);
    }
}
