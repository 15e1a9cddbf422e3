//! # Process Registry
//!
//! Per-process records behind a reference-counted handle abstraction.
//!
//! A [`ProcessRecord`] holds the pid plus the cached (state, exit code)
//! pair; a [`ProcessHandle`] is a cloneable capability over one record.
//! Handles are released independently by their holders, and dropping the
//! last handle does not affect the OS process itself: the PAL tracks
//! processes, it does not own them.
//!
//! ## Locking
//!
//! Record fields are only ever read or written under the record's own
//! `RwLock`; the registry map has its own mutex. Code that holds a record
//! lock must not call back into anything that references handles (the
//! launcher releases stdio references only after dropping the record lock
//! for exactly this reason).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::{PalError, PalResult};
use crate::types::{ProcessId, ProcessState};

#[derive(Debug)]
struct RecordData
{
    pid: ProcessId,
    state: ProcessState,
    exit_code: u32,
}

/// Record of a single tracked process.
///
/// The `Running` → `Done` transition is one-way; see
/// [`ProcessRecord::cache_done`].
#[derive(Debug)]
pub struct ProcessRecord
{
    data: RwLock<RecordData>,
}

impl ProcessRecord
{
    fn new(pid: ProcessId) -> Self
    {
        ProcessRecord {
            data: RwLock::new(RecordData {
                pid,
                state: ProcessState::Running,
                exit_code: 0,
            }),
        }
    }

    /// The OS pid of this record. Zero until the launcher stores the
    /// forked pid.
    pub(crate) fn pid(&self) -> ProcessId
    {
        self.data.read().expect("process record poisoned").pid
    }

    /// Store the pid of a freshly forked child. Launcher-only.
    pub(crate) fn set_pid(&self, pid: ProcessId)
    {
        self.data.write().expect("process record poisoned").pid = pid;
    }

    /// Current cached (state, exit code) pair.
    pub(crate) fn cached_status(&self) -> (ProcessState, u32)
    {
        let data = self.data.read().expect("process record poisoned");
        (data.state, data.exit_code)
    }

    /// Transition to `Done` and cache the exit code.
    ///
    /// Idempotent in the direction that matters: once `Done`, later calls
    /// keep the first exit code, so a second status query can never observe
    /// a different answer.
    pub(crate) fn cache_done(&self, exit_code: u32)
    {
        let mut data = self.data.write().expect("process record poisoned");
        if data.state == ProcessState::Done {
            return;
        }
        data.state = ProcessState::Done;
        data.exit_code = exit_code;
    }
}

/// Reference-counted capability over a [`ProcessRecord`].
///
/// Cheap to clone; all clones observe the same cached status.
#[derive(Debug, Clone)]
pub struct ProcessHandle(Arc<ProcessRecord>);

impl ProcessHandle
{
    /// The OS process id this handle refers to.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.0.pid()
    }

    pub(crate) fn record(&self) -> &ProcessRecord
    {
        &self.0
    }
}

/// Owner of all process records, keyed by pid.
///
/// The map holds weak references: a record lives exactly as long as some
/// handle to it does, and `open_by_pid` for a pid whose record has expired
/// starts over with a fresh `Running` record.
pub struct ProcessRegistry
{
    records: Mutex<HashMap<u32, Weak<ProcessRecord>>>,
}

impl ProcessRegistry
{
    pub(crate) fn new() -> Self
    {
        ProcessRegistry {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a record for a process that is about to be forked.
    ///
    /// The record starts with pid 0; the launcher stores the real pid under
    /// the record lock after `fork()` succeeds and then registers it via
    /// [`ProcessRegistry::adopt`].
    pub(crate) fn allocate(&self) -> ProcessHandle
    {
        ProcessHandle(Arc::new(ProcessRecord::new(ProcessId(0))))
    }

    /// Publish a launched record under its (now known) pid.
    pub(crate) fn adopt(&self, handle: &ProcessHandle)
    {
        let pid = handle.pid();
        let mut records = self.records.lock().expect("registry poisoned");
        Self::sweep(&mut records);
        records.insert(pid.raw(), Arc::downgrade(&handle.0));
    }

    /// Drop map entries whose record no longer has any handle alive.
    ///
    /// Called on every insert; without it the map would grow by one dead
    /// weak entry per launch for the life of the process.
    fn sweep(records: &mut HashMap<u32, Weak<ProcessRecord>>)
    {
        records.retain(|_, record| record.strong_count() > 0);
    }

    /// Obtain a handle for an arbitrary pid ("open process by id").
    ///
    /// Returns the existing record when one is still alive so that status
    /// caching is shared between all holders; otherwise creates a fresh
    /// `Running` record. A pid of zero is rejected.
    pub fn open_by_pid(&self, pid: ProcessId) -> PalResult<ProcessHandle>
    {
        if pid.raw() == 0 {
            return Err(PalError::InvalidParameter("pid 0 cannot be opened".into()));
        }

        let mut records = self.records.lock().expect("registry poisoned");
        if let Some(existing) = records.get(&pid.raw()).and_then(Weak::upgrade) {
            return Ok(ProcessHandle(existing));
        }

        let record = Arc::new(ProcessRecord::new(pid));
        Self::sweep(&mut records);
        records.insert(pid.raw(), Arc::downgrade(&record));
        Ok(ProcessHandle(record))
    }

    /// Pseudo-handle for the current process.
    ///
    /// Passing it to `terminate_process` expresses "terminate myself";
    /// status queries against it behave like any other non-child probe.
    pub fn current_process(&self) -> ProcessHandle
    {
        self.open_by_pid(ProcessId(std::process::id()))
            .expect("current pid is never zero")
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn open_by_pid_shares_records()
    {
        let registry = ProcessRegistry::new();
        let a = registry.open_by_pid(ProcessId(77001)).unwrap();
        let b = registry.open_by_pid(ProcessId(77001)).unwrap();
        a.record().cache_done(5);
        assert_eq!(b.record().cached_status(), (ProcessState::Done, 5));
    }

    #[test]
    fn open_pid_zero_rejected()
    {
        let registry = ProcessRegistry::new();
        assert!(matches!(
            registry.open_by_pid(ProcessId(0)),
            Err(PalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn done_transition_is_one_way()
    {
        let registry = ProcessRegistry::new();
        let handle = registry.open_by_pid(ProcessId(77002)).unwrap();
        handle.record().cache_done(3);
        handle.record().cache_done(9);
        assert_eq!(handle.record().cached_status(), (ProcessState::Done, 3));
    }

    #[test]
    fn dead_entries_are_swept_on_insert()
    {
        let registry = ProcessRegistry::new();
        {
            let _short_lived = registry.open_by_pid(ProcessId(77010)).unwrap();
        }
        // The dropped record's entry goes away with the next insert.
        let _live = registry.open_by_pid(ProcessId(77011)).unwrap();
        let records = registry.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&77011));
    }

    #[test]
    fn expired_records_are_replaced()
    {
        let registry = ProcessRegistry::new();
        {
            let handle = registry.open_by_pid(ProcessId(77003)).unwrap();
            handle.record().cache_done(1);
        }
        // All strong references dropped; a new open starts clean.
        let fresh = registry.open_by_pid(ProcessId(77003)).unwrap();
        assert_eq!(fresh.record().cached_status(), (ProcessState::Running, 0));
    }
}
