//! Narrow trait boundary between the scheduler/bio logic and the actual
//! hypervisor, CPU architecture, and block backend underneath it.
//!
//! Everything in [`crate::sched`] and [`crate::bio`] is written against
//! these traits instead of directly against a hypercall ABI or a real
//! register-context switch, so it can be exercised on the host under
//! `#[cfg(test)]` with the deterministic implementations in [`sim`].

use crate::errno::Errno;
use alloc::vec::Vec;

#[cfg(test)]
pub mod sim;

/// Monotonic/wall time in nanoseconds, matching the hypervisor's `s_time_t`.
pub type STime = i64;

/// Default stack size for threads that don't supply their own stack.
pub const STACK_SIZE: usize = 64 * 1024;

/// `STACK_SIZE` expressed as a page-allocator order (`4096 << order`
/// bytes), for the common page-sized stack allocation fast path.
pub const STACK_SIZE_PAGE_ORDER: u32 = 4;

/// The handful of hypervisor services the scheduler needs: a clock, an
/// IRQ mask, a way to block the whole vCPU until the next timeout or event,
/// page allocation for thread stacks, byte-granular allocation for smaller
/// records, and a shutdown hook.
pub trait Hypervisor {
    /// Current time, as the hypervisor sees it.
    fn now(&self) -> STime;

    /// Disable event delivery, returning whether it was already disabled.
    fn irq_save(&self) -> bool;

    /// Restore the previous IRQ-mask state returned by `irq_save`.
    fn irq_restore(&self, prev_masked: bool);

    /// Block the virtual CPU until `deadline` or the next event, whichever
    /// comes first.
    fn block_domain(&self, deadline: STime);

    /// Run any event-channel callbacks that arrived while blocked.
    fn force_evtchn_callback(&self);

    /// Allocate `1 << order` pages. This is the fast path for the common
    /// page-sized case (thread stacks); it deliberately bypasses whatever
    /// general-purpose allocator backs [`Self::memalloc`], the same way a
    /// real port avoids malloc-header overhead for page-sized requests.
    fn alloc_pages(&self, order: u32) -> Option<*mut u8>;

    /// Free pages returned by `alloc_pages`.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc_pages(order)` on this same
    /// hypervisor and not freed already.
    unsafe fn free_pages(&self, ptr: *mut u8, order: u32);

    /// Byte-granular allocation at `align`, for records too small to
    /// justify a whole page (backs an embedder's global allocator; this
    /// crate's own `Box`/`Vec` usage already assumes one is installed).
    fn memalloc(&self, len: usize, align: usize) -> Option<*mut u8>;

    /// Free memory returned by `memalloc`.
    ///
    /// # Safety
    /// `ptr`, `len`, `align` must match a prior `memalloc` call on this
    /// same hypervisor, not freed already.
    unsafe fn memfree(&self, ptr: *mut u8, len: usize, align: usize);

    /// Write raw bytes to the guest's console.
    fn console_print(&self, bytes: &[u8]);

    /// Tear the guest down. May or may not return control; callers must
    /// not assume it does.
    fn host_exit(&self, code: i32) -> !;
}

/// Arch-specific thread context: creating one and switching between two.
///
/// `Context` is deliberately opaque to everything above this trait. The
/// only operations the scheduler performs on it are "make a fresh one that
/// will start running `entry(arg)`" and "suspend here, resume there".
pub trait ArchThread {
    type Context;

    /// Build a context that begins executing `entry(arg)` the first time
    /// it is switched to, running on `stack`.
    fn create(entry: fn(usize), arg: usize, stack: &mut [u8]) -> Self::Context;

    /// A context representing the thread that is already running (used
    /// once, to bootstrap the thread that calls [`crate::Scheduler::new`]).
    fn bootstrap() -> Self::Context;

    /// Suspend the caller (represented by `prev`) and resume `next`.
    /// Returns only once something switches back to `prev`.
    fn switch(prev: &mut Self::Context, next: &mut Self::Context);
}

/// Higher-layer runtime facade consumed by the scheduler/clock adapter and
/// the bio pump: a surrounding runtime's own mutex/condvar primitives, plus
/// a pair of hooks for temporarily releasing whatever lock *that* runtime
/// holds around the caller while this crate blocks it.
///
/// Nothing inside this crate's own scheduler needs these to protect its own
/// state (the run/exited/join-wait sets are already serialized by the IRQ
/// mask; see [`crate::sched`]'s module docs) — this trait exists purely so
/// a thread that entered this crate while holding a *bigger* lock one layer
/// up doesn't starve everyone else sharing it while it sleeps or waits.
pub trait SyncFacade {
    type Mutex;
    type Condvar;

    fn mutex_init(&self) -> Self::Mutex;
    fn mutex_enter(&self, m: &Self::Mutex);
    /// Enter without the usual higher-layer wrapping (used from contexts
    /// that already hold an equivalent lock, e.g. inside a callback).
    fn mutex_enter_nowrap(&self, m: &Self::Mutex);
    fn mutex_exit(&self, m: &Self::Mutex);

    fn condvar_init(&self) -> Self::Condvar;
    /// Wait on `cv`, with `m` held and released/reacquired around the
    /// wait, without the usual higher-layer wrapping.
    fn condvar_wait_nowrap(&self, cv: &Self::Condvar, m: &Self::Mutex);
    fn condvar_signal(&self, cv: &Self::Condvar);

    /// Release any higher-layer scheduler lock the calling thread holds,
    /// so other threads sharing it may run while this one blocks.
    fn hyp_unschedule(&self);
    /// Reacquire whatever `hyp_unschedule` released.
    fn hyp_schedule(&self);
    /// Register the calling thread as capable of running foreign
    /// (backend-invoked) callbacks.
    fn hyp_lwproc_newlwp(&self, arg: i32);
}

/// Static facts about a block device, filled in at open time.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub sectors: u64,
    pub sector_size: u32,
    pub writable: bool,
}

impl DeviceInfo {
    pub const fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }
}

/// Asynchronous block backend: submit reads/writes tagged with a caller
/// token, and later drain whichever of them have completed.
///
/// This takes the place of mini-os's `blkfront` device plus its aiocb
/// bookkeeping; by returning `(token, result)` pairs from `poll` instead of
/// invoking a raw C callback pointer, the completion dispatch in
/// [`crate::bio`] stays in safe Rust.
pub trait BlockBackend {
    type Device;

    /// Attach to a backend device named by a backend-specific path
    /// (e.g. a xenstore vbd path).
    fn init(&mut self, path: &str) -> Result<(Self::Device, DeviceInfo), Errno>;

    /// Detach; no more completions for `dev` will be produced afterwards.
    fn shutdown(&mut self, dev: Self::Device);

    /// Submit an asynchronous read, tagged `token`. `buf` must stay valid
    /// and exclusively borrowed until a matching completion is observed.
    fn submit_read(&mut self, dev: &mut Self::Device, token: u64, buf: *mut u8, len: usize, offset: i64);

    /// Submit an asynchronous write, tagged `token`.
    fn submit_write(&mut self, dev: &mut Self::Device, token: u64, buf: *const u8, len: usize, offset: i64);

    /// Drain whatever requests against `dev` have completed since the last
    /// call, each as `(token, result)` where `result` is the byte count
    /// transferred or the error the backend reported.
    fn poll(&mut self, dev: &mut Self::Device) -> Vec<(u64, Result<usize, Errno>)>;

    /// Register the pump thread's interest in `dev`'s completion event
    /// (mirrors `blkfront_queue`, §6): a real port wires this into the
    /// hypervisor's event-channel wait so the next `block_domain` wakes
    /// promptly on a hardware completion rather than only on the next
    /// scheduler timeout poll. Called once per slot, right before the pump
    /// goes back to `schedule()` empty-handed. Backends with nothing to
    /// register against (a synchronous/simulated one) may no-op.
    fn register_wait(&mut self, dev: &mut Self::Device);
}
