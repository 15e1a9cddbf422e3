//! # Process-Wide Memory Fence
//!
//! `FlushProcessWriteBuffers`: force every thread in the process through a
//! full memory barrier, so a cross-modifying writer can know all readers
//! see its stores.
//!
//! Three strategies, probed once at initialization:
//!
//! 1. `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED)` on Linux 4.14+, the
//!    cheap path; intent must be registered up front.
//! 2. A locked helper page whose protection is toggled
//!    `PROT_READ|PROT_WRITE` → `PROT_NONE`. The protection change makes
//!    the kernel IPI every processor to shoot down TLBs, which also drains
//!    their store buffers. The page is dirtied between the two `mprotect`
//!    calls so the kernel cannot skip the global flush.
//! 3. On macOS, asking Mach for every thread's register pointer values,
//!    which forces each thread through a barrier as a side effect.
//!
//! Flushing is a correctness primitive for callers: any strategy failure
//! mid-flush is unrecoverable and aborts the process through the crash
//! dump pipeline.

use once_cell::sync::OnceCell;
use tracing::{debug, error};

use crate::dump;
use crate::error::PalResult;

enum FenceStrategy
{
    #[cfg(target_os = "linux")]
    MemBarrier,
    #[cfg(not(target_os = "macos"))]
    HelperPage(HelperPage),
    #[cfg(target_os = "macos")]
    RegisterProbe,
}

#[cfg(not(target_os = "macos"))]
struct HelperPage
{
    page: *mut libc::c_int,
    page_size: usize,
    /// Serializes the protection toggle; concurrent flushes would race the
    /// two `mprotect` calls against each other.
    mutex: std::sync::Mutex<()>,
}

// The raw page pointer is only dereferenced under `mutex`, and the mapping
// lives for the whole process.
#[cfg(not(target_os = "macos"))]
unsafe impl Send for HelperPage {}
#[cfg(not(target_os = "macos"))]
unsafe impl Sync for HelperPage {}

static FENCE: OnceCell<FenceStrategy> = OnceCell::new();

fn fatal(what: &str) -> !
{
    error!("{what}");
    dump::abort_process(libc::SIGABRT)
}

#[cfg(target_os = "linux")]
fn membarrier(cmd: libc::c_int) -> libc::c_int
{
    unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0, 0) as libc::c_int }
}

#[cfg(target_os = "linux")]
fn try_membarrier() -> Option<FenceStrategy>
{
    let mask = membarrier(libc::MEMBARRIER_CMD_QUERY);
    if mask < 0 || mask & libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED == 0 {
        return None;
    }
    // Registration is what lets later expedited barriers target us.
    if membarrier(libc::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED) != 0 {
        return None;
    }
    debug!("process memory fence using membarrier");
    Some(FenceStrategy::MemBarrier)
}

#[cfg(not(target_os = "macos"))]
fn pick_fallback() -> PalResult<FenceStrategy>
{
    use crate::error::PalError;

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let page = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            page_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if page == libc::MAP_FAILED {
        return Err(PalError::from_os("mmap"));
    }

    // The page must stay resident across the two mprotect calls in the
    // flush; an unmapped page would not generate the IPI.
    if unsafe { libc::mlock(page, page_size) } != 0 {
        let err = PalError::from_os("mlock");
        unsafe { libc::munmap(page, page_size) };
        return Err(err);
    }

    debug!(page_size, "process memory fence using a protection-toggled helper page");
    Ok(FenceStrategy::HelperPage(HelperPage {
        page: page.cast(),
        page_size,
        mutex: std::sync::Mutex::new(()),
    }))
}

#[cfg(target_os = "macos")]
fn pick_fallback() -> PalResult<FenceStrategy>
{
    debug!("process memory fence using thread register probing");
    Ok(FenceStrategy::RegisterProbe)
}

fn pick_strategy() -> PalResult<FenceStrategy>
{
    #[cfg(target_os = "linux")]
    if let Some(strategy) = try_membarrier() {
        return Ok(strategy);
    }

    pick_fallback()
}

/// Probe and set up the flush strategy. Call once during startup, before
/// the first [`flush_process_write_buffers`].
///
/// Calling again after a success is a no-op.
///
/// ## Errors
///
/// `Internal` when no kernel barrier facility is available and the fallback
/// helper page cannot be mapped and locked.
pub fn initialize_flush_process_write_buffers() -> PalResult<()>
{
    if FENCE.get().is_some() {
        return Ok(());
    }
    let strategy = pick_strategy()?;
    let _ = FENCE.set(strategy);
    Ok(())
}

/// Force every thread in the process through a full memory barrier.
///
/// Aborts the process if the fence cannot be guaranteed; callers rely on
/// it for correctness and must never proceed on a silent failure.
pub fn flush_process_write_buffers()
{
    let Some(strategy) = FENCE.get() else {
        fatal("memory fence used before initialization")
    };

    match strategy {
        #[cfg(target_os = "linux")]
        FenceStrategy::MemBarrier => {
            if membarrier(libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED) != 0 {
                fatal("membarrier(PRIVATE_EXPEDITED) failed")
            }
        }

        #[cfg(not(target_os = "macos"))]
        FenceStrategy::HelperPage(helper) => flush_with_helper_page(helper),

        #[cfg(target_os = "macos")]
        FenceStrategy::RegisterProbe => flush_with_register_probe(),
    }
}

#[cfg(not(target_os = "macos"))]
fn flush_with_helper_page(helper: &HelperPage)
{
    use std::sync::atomic::{AtomicI32, Ordering};

    let guard = helper.mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if unsafe { libc::mprotect(helper.page.cast(), helper.page_size, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
        fatal("failed to make the fence helper page writable")
    }

    // Dirty the page so the kernel cannot elide the TLB shootdown on the
    // transition to PROT_NONE.
    unsafe { &*helper.page.cast::<AtomicI32>() }.fetch_add(1, Ordering::SeqCst);

    if unsafe { libc::mprotect(helper.page.cast(), helper.page_size, libc::PROT_NONE) } != 0 {
        fatal("failed to revoke access to the fence helper page")
    }

    drop(guard);
}

#[cfg(target_os = "macos")]
fn flush_with_register_probe()
{
    use mach2::kern_return::{KERN_INSUFFICIENT_BUFFER_SIZE, KERN_SUCCESS};
    use mach2::mach_port::mach_port_deallocate;
    use mach2::message::mach_msg_type_number_t;
    use mach2::port::mach_port_t;
    use mach2::task::task_threads;
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_deallocate;
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    extern "C" {
        fn thread_get_register_pointer_values(
            thread: mach_port_t,
            sp: *mut libc::uintptr_t,
            length: *mut libc::size_t,
            values: *mut libc::uintptr_t,
        ) -> mach2::kern_return::kern_return_t;
    }

    unsafe {
        let mut threads: *mut mach_port_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        if task_threads(mach_task_self(), &mut threads, &mut count) != KERN_SUCCESS {
            fatal("task_threads failed")
        }

        for i in 0..count as usize {
            let thread = *threads.add(i);

            // The probe itself is the barrier; the values are discarded. A
            // thread that exited between task_threads and here is fine to
            // skip, but a too-small buffer means no barrier happened.
            let mut sp: libc::uintptr_t = 0;
            let mut registers: libc::size_t = 128;
            let mut values = [0 as libc::uintptr_t; 128];
            let ret = thread_get_register_pointer_values(thread, &mut sp, &mut registers, values.as_mut_ptr());
            if ret == KERN_INSUFFICIENT_BUFFER_SIZE {
                fatal("thread_get_register_pointer_values buffer too small")
            }

            if mach_port_deallocate(mach_task_self(), thread) != KERN_SUCCESS {
                fatal("mach_port_deallocate failed")
            }
        }

        let bytes = count as mach_vm_size_t * std::mem::size_of::<mach_port_t>() as mach_vm_size_t;
        if mach_vm_deallocate(mach_task_self(), threads as mach_vm_address_t, bytes) != KERN_SUCCESS {
            fatal("mach_vm_deallocate failed")
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn initialize_then_flush()
    {
        initialize_flush_process_write_buffers().expect("fence init");
        // Twice: the second flush exercises the already-registered path.
        flush_process_write_buffers();
        flush_process_write_buffers();
    }

    #[test]
    fn initialization_is_idempotent()
    {
        initialize_flush_process_write_buffers().expect("first init");
        initialize_flush_process_write_buffers().expect("second init");
    }
}
