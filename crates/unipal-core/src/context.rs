//! # Process Context
//!
//! The process-wide mutable state of the PAL: our own pid, the list of
//! runtime threads, the registered shutdown callback, and the
//! "runtime initialized" flag the termination path consults.
//!
//! All of this lives in one explicit context object constructed lazily on
//! first use and reached through [`process_context`], rather than as
//! free-floating globals. The thread list and callback slot are protected
//! by ordinary mutexes; the initialization count is an atomic because the
//! post-fork child path must reset it without taking any lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::registry::ProcessRegistry;
use crate::types::{ProcessId, ThreadId};

/// Callback invoked while the process shuts down through `exit_process`
/// or aborts through the crash-dump pipeline. Used by the debugger layer
/// to tear down its transport.
pub type ShutdownCallback = fn();

/// A runtime thread known to the PAL.
///
/// Entries are added when a thread announces itself via
/// [`ProcessContext::register_thread`] and removed on thread exit. The
/// list is iterated for diagnostics only; it makes no liveness guarantees
/// about threads that never registered.
#[derive(Debug, Clone)]
pub struct ThreadRecord
{
    /// OS identifier of the thread
    pub id: ThreadId,
    /// Optional human-readable name for diagnostics output
    pub name: Option<String>,
}

/// Process-wide context object.
///
/// Constructed once, lives for the whole process. See the module docs for
/// the locking story.
pub struct ProcessContext
{
    pid: ProcessId,
    registry: ProcessRegistry,
    threads: Mutex<Vec<ThreadRecord>>,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,
    init_count: AtomicU32,
}

static CONTEXT: Lazy<ProcessContext> = Lazy::new(|| ProcessContext {
    pid: ProcessId(std::process::id()),
    registry: ProcessRegistry::new(),
    threads: Mutex::new(Vec::new()),
    shutdown_callback: Mutex::new(None),
    init_count: AtomicU32::new(0),
});

/// Access the process-wide context.
pub fn process_context() -> &'static ProcessContext
{
    &CONTEXT
}

impl ProcessContext
{
    /// The pid of the current process, as cached at context construction.
    #[must_use]
    pub fn current_pid(&self) -> ProcessId
    {
        self.pid
    }

    /// The process registry owning all per-process records.
    #[must_use]
    pub fn registry(&self) -> &ProcessRegistry
    {
        &self.registry
    }

    /// Mark one more subsystem of the runtime as initialized.
    ///
    /// The termination controller treats the runtime as "initialized" while
    /// this count is nonzero, and runs the full shutdown sequence instead of
    /// a bare `exit` on re-entrant termination.
    pub fn mark_initialized(&self)
    {
        self.init_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo one [`ProcessContext::mark_initialized`].
    pub fn mark_shutdown(&self)
    {
        let previous = self.init_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "unbalanced mark_shutdown");
    }

    /// Whether any runtime subsystem is currently initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool
    {
        self.init_count.load(Ordering::SeqCst) > 0
    }

    /// Reset the initialization count to zero.
    ///
    /// ## Safety contract (not enforced by the compiler)
    ///
    /// Must only be called by the forked child between `fork()` and `exec()`.
    /// The child shares the parent's memory image but none of its threads,
    /// so it must not take the context locks; a single relaxed atomic store
    /// is the only mutation it is allowed.
    pub(crate) fn reset_after_fork(&self)
    {
        self.init_count.store(0, Ordering::Relaxed);
    }

    /// Register the calling thread in the process thread list.
    pub fn register_thread(&self, name: Option<String>)
    {
        let record = ThreadRecord {
            id: ThreadId::current(),
            name,
        };
        tracing::trace!(thread = %record.id, "registering runtime thread");
        self.threads.lock().expect("thread list poisoned").push(record);
    }

    /// Remove the calling thread from the process thread list.
    ///
    /// A thread that never registered is ignored.
    pub fn unregister_thread(&self)
    {
        let id = ThreadId::current();
        let mut threads = self.threads.lock().expect("thread list poisoned");
        if let Some(position) = threads.iter().position(|t| t.id == id) {
            threads.swap_remove(position);
        }
    }

    /// Number of registered runtime threads.
    #[must_use]
    pub fn thread_count(&self) -> usize
    {
        self.threads.lock().expect("thread list poisoned").len()
    }

    /// Snapshot of the registered threads, for diagnostics.
    #[must_use]
    pub fn thread_snapshot(&self) -> Vec<ThreadRecord>
    {
        self.threads.lock().expect("thread list poisoned").clone()
    }

    /// Install the shutdown callback, replacing any previous one.
    ///
    /// NOTE: only one callback can be set at a time.
    pub fn set_shutdown_callback(&self, callback: ShutdownCallback)
    {
        *self.shutdown_callback.lock().expect("callback slot poisoned") = Some(callback);
    }

    /// Run and clear the shutdown callback, if one was registered.
    ///
    /// Taking the callback out of the slot before invoking it guarantees it
    /// runs at most once even if termination and abort race into this path.
    pub(crate) fn notify_shutdown(&self)
    {
        let callback = self.shutdown_callback.lock().expect("callback slot poisoned").take();
        if let Some(callback) = callback {
            tracing::debug!("running process shutdown callback");
            callback();
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn pid_matches_os()
    {
        assert_eq!(process_context().current_pid().raw(), std::process::id());
    }

    #[test]
    fn thread_register_unregister()
    {
        let ctx = process_context();
        let before = ctx.thread_count();
        ctx.register_thread(Some("test-worker".into()));
        assert_eq!(ctx.thread_count(), before + 1);
        let snapshot = ctx.thread_snapshot();
        assert!(snapshot.iter().any(|t| t.name.as_deref() == Some("test-worker")));
        ctx.unregister_thread();
        assert_eq!(ctx.thread_count(), before);
    }

    #[test]
    fn init_count_balance()
    {
        let ctx = process_context();
        ctx.mark_initialized();
        assert!(ctx.is_initialized());
        ctx.mark_shutdown();
    }
}
