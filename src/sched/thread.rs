//! The thread record and its lifecycle flags.

use alloc::string::String;
use bitflags::bitflags;
use core::cell::Cell;

/// Stable handle into a [`super::Scheduler`]'s thread table. Indices are
/// reused once a thread is reaped, so a `ThreadId` is only meaningful while
/// the thread it names is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

bitflags! {
    /// Mirrors mini-os's `THREAD_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// In the run set and eligible for selection.
        const RUNNABLE  = 0b0000_0001;
        /// `exit()` must block until a joiner collects the exit code.
        const MUST_JOIN = 0b0000_0010;
        /// Set by `exit()` once it has reached its join gate.
        const JOINED    = 0b0000_0100;
        /// Stack memory is caller-owned; don't free it on reap.
        const EXT_STACK = 0b0000_1000;
        /// Most recent wakeup was due to a timed sleep expiring, not an
        /// explicit `wake()`.
        const TIMED_OUT = 0b0001_0000;
    }
}

/// Where a thread's stack memory came from.
pub enum StackStorage {
    /// Allocated via [`crate::hal::Hypervisor::alloc_pages`] by
    /// [`super::Scheduler::create`]; freed through
    /// [`crate::hal::Hypervisor::free_pages`] on reap.
    Owned { ptr: *mut u8, order: u32 },
    /// Supplied by the caller; never freed by this crate.
    External,
}

/// A single kernel thread.
pub struct Thread<C> {
    pub(crate) id: ThreadId,
    pub name: String,
    pub(crate) stack: StackStorage,
    pub(crate) ctx: C,
    pub(crate) flags: ThreadFlags,
    /// Absolute deadline in nanoseconds, or 0 if not sleeping on a timeout.
    pub wakeup_time: i64,
    /// Opaque value handed to the scheduler-switch hook and available to
    /// the thread's own entry function.
    pub cookie: usize,
    /// Opaque per-thread payload for whatever owns the lwp/process concept
    /// above this layer; this crate never interprets it.
    pub lwp: usize,
    /// Per-thread errno cell (`rumpuser_seterrno`/`-geterrno`'s backing
    /// store).
    pub threrrno: Cell<i32>,
}

impl<C> Thread<C> {
    pub(crate) fn new(id: ThreadId, name: String, stack: StackStorage, ctx: C, cookie: usize) -> Self {
        Self {
            id,
            name,
            stack,
            ctx,
            flags: ThreadFlags::empty(),
            wakeup_time: 0,
            cookie,
            lwp: 0,
            threrrno: Cell::new(0),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_runnable(&self) -> bool {
        self.flags.contains(ThreadFlags::RUNNABLE)
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }
}
