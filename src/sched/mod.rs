//! Non-preemptive, single-vCPU, round-robin kernel-thread scheduler.
//!
//! Threads only ever switch at an explicit call to [`Scheduler::schedule`];
//! there is no timer tick and no second CPU. The scheduler owns three
//! disjoint sets of thread handles — the run set, the exited set, and the
//! join-wait set — and the only mutual-exclusion primitive it needs is the
//! IRQ mask exposed by [`crate::hal::Hypervisor`].
//!
//! A `Scheduler` is an ordinary owned value (returned behind a `Box` so its
//! address is stable, since thread bodies reach it through a raw pointer
//! captured at creation time — see [`Scheduler::init_sched`]). Nothing here
//! is a global static; an embedder that wants one can wrap a `Box<Scheduler<..>>`
//! in its own `spin::Mutex` the way the rest of its kernel already does.

mod thread;

pub use thread::{StackStorage, Thread, ThreadFlags, ThreadId};

use crate::hal::{ArchThread, Hypervisor, STime};
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;
use log::{debug, error, trace};

/// Default stack size for threads that don't supply their own stack.
pub const STACK_SIZE: usize = crate::hal::STACK_SIZE;

/// `schedule()`'s fallback poll interval when nothing is sleeping sooner.
const MAX_BLOCK_NS: i64 = 10_000_000_000;

type SchedHook = fn(usize, usize);

/// Owns every thread this scheduler knows about and the three sets
/// (run / exited / join-wait) that classify them.
pub struct Scheduler<H: Hypervisor, A: ArchThread> {
    hv: H,
    slots: Vec<Option<Thread<A::Context>>>,
    /// The run set (R), in round-robin order.
    run_queue: Vec<ThreadId>,
    /// The exited set (E), most recently exited first.
    exited: Vec<ThreadId>,
    /// The join-wait set (J): `(waiter, wanted)` pairs.
    join_wait: Vec<(ThreadId, ThreadId)>,
    current: ThreadId,
    hook: Option<SchedHook>,
    idle: Option<ThreadId>,
    threads_started: bool,
    /// Set while the scheduler hook or a bio completion callback is
    /// running. `schedule()` refuses to run while this is set (§3: "no
    /// scheduling decision may be made recursively").
    in_callback: bool,
    _arch: PhantomData<A>,
}

impl<H: Hypervisor, A: ArchThread> Scheduler<H, A> {
    /// Build a scheduler whose current thread is the one calling this
    /// function (the bootstrap thread), named `bootstrap_name`.
    ///
    /// The returned value must not move after [`Self::create`] or
    /// [`Self::init_sched`] is called on it: thread entry functions are
    /// hooked up with a raw pointer into `*self` captured at that point.
    pub fn new(hv: H, bootstrap_name: &str) -> Box<Self> {
        let mut bootstrap = Thread::new(
            ThreadId(0),
            bootstrap_name.to_string(),
            StackStorage::External,
            A::bootstrap(),
            0,
        );
        bootstrap.flags.insert(ThreadFlags::RUNNABLE);
        Box::new(Self {
            hv,
            slots: vec![Some(bootstrap)],
            run_queue: vec![ThreadId(0)],
            exited: Vec::new(),
            join_wait: Vec::new(),
            current: ThreadId(0),
            hook: None,
            idle: None,
            threads_started: false,
            in_callback: false,
            _arch: PhantomData,
        })
    }

    /// The hypervisor facade this scheduler was built with.
    pub fn hypervisor(&self) -> &H {
        &self.hv
    }

    /// The currently running thread.
    pub fn current_id(&self) -> ThreadId {
        self.current
    }

    pub fn thread(&self, id: ThreadId) -> &Thread<A::Context> {
        self.thread_ref(id)
    }

    /// Stash `errno` in the *current* thread's per-thread errno cell,
    /// standing in for `rumpuser_seterrno`'s thread-local passthrough.
    pub fn seterrno(&self, errno: crate::errno::Errno) {
        self.thread_ref(self.current).threrrno.set(errno.code());
    }

    /// Read back the current thread's most recently stashed errno (`0` if
    /// none has been set since the thread started).
    pub fn geterrno(&self) -> i32 {
        self.thread_ref(self.current).threrrno.get()
    }

    /// Whether a scheduler hook or bio completion callback is currently
    /// executing.
    pub fn in_callback(&self) -> bool {
        self.in_callback
    }

    /// Run `f` with the in-callback flag set, for callers outside this
    /// module that invoke a caller-supplied callback (the bio pump's
    /// completion dispatch) at a point where `schedule()` must not run.
    ///
    /// # Panics
    /// If already inside a callback context (callbacks must not nest).
    pub fn run_callback<R>(&mut self, f: impl FnOnce() -> R) -> R {
        assert!(!self.in_callback, "run_callback() called from within a callback context");
        self.in_callback = true;
        let result = f();
        self.in_callback = false;
        result
    }

    fn thread_ref(&self, id: ThreadId) -> &Thread<A::Context> {
        self.slots[id.0].as_ref().expect("dangling ThreadId")
    }

    fn thread_mut(&mut self, id: ThreadId) -> &mut Thread<A::Context> {
        self.slots[id.0].as_mut().expect("dangling ThreadId")
    }

    fn alloc_slot(&mut self, th: Thread<A::Context>) -> ThreadId {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(th);
            ThreadId(idx)
        } else {
            self.slots.push(Some(th));
            ThreadId(self.slots.len() - 1)
        }
    }

    /// Create a new thread running `entry(arg)`, inserted into the run set.
    ///
    /// `stack` is either caller-supplied memory (the `EXT_STACK` case) or,
    /// if `None`, a freshly allocated [`STACK_SIZE`]-byte stack owned by
    /// this thread and freed when it is reaped. If `joinable`, `exit()`
    /// will block until [`Self::join`] collects it.
    pub fn create(
        &mut self,
        name: &str,
        cookie: usize,
        entry: fn(usize),
        arg: usize,
        stack: Option<&mut [u8]>,
        joinable: bool,
    ) -> ThreadId {
        let (storage, ctx) = match stack {
            Some(mem) => {
                let ctx = A::create(entry, arg, mem);
                (StackStorage::External, ctx)
            }
            None => {
                let order = crate::hal::STACK_SIZE_PAGE_ORDER;
                let ptr = self
                    .hv
                    .alloc_pages(order)
                    .expect("thread stack page allocation failed");
                let stack_mem = unsafe { core::slice::from_raw_parts_mut(ptr, STACK_SIZE) };
                let ctx = A::create(entry, arg, stack_mem);
                (StackStorage::Owned { ptr, order }, ctx)
            }
        };
        let mut th = Thread::new(ThreadId(0), name.to_string(), storage, ctx, cookie);
        if matches!(th.stack, StackStorage::External) {
            th.flags.insert(ThreadFlags::EXT_STACK);
        }
        if joinable {
            th.flags.insert(ThreadFlags::MUST_JOIN);
        }
        th.flags.insert(ThreadFlags::RUNNABLE);
        let id = self.alloc_slot(th);
        self.thread_mut(id).id = id;
        let masked = self.hv.irq_save();
        self.run_queue.push(id);
        self.hv.irq_restore(masked);
        debug!("create_thread {id:?} name={name} joinable={joinable}");
        id
    }

    /// Register the function called with `(prev.cookie, next.cookie)`
    /// immediately before every real thread switch.
    pub fn set_sched_hook(&mut self, hook: SchedHook) {
        self.hook = Some(hook);
    }

    /// Attach a cookie to the bootstrap thread (the one that called
    /// [`Self::new`]), returning its id.
    pub fn init_mainlwp(&mut self, cookie: usize) -> ThreadId {
        let cur = self.current;
        self.thread_mut(cur).cookie = cookie;
        cur
    }

    /// Create the idle thread: a thread that blocks and immediately
    /// reschedules forever, selected only when nothing else is runnable.
    pub fn init_sched(&mut self) -> ThreadId {
        let self_ptr = self as *mut Self as usize;
        let id = self.create("idle", 0, idle_entry::<H, A>, self_ptr, None, false);
        self.idle = Some(id);
        id
    }

    /// Whether the idle thread has run at least once.
    pub fn threads_started(&self) -> bool {
        self.threads_started
    }

    /// Mark a thread not runnable, with no pending timeout.
    pub fn block(&mut self, t: ThreadId) {
        let th = self.thread_mut(t);
        th.wakeup_time = 0;
        th.flags.remove(ThreadFlags::RUNNABLE);
    }

    /// Mark a thread runnable, clearing any pending timeout.
    pub fn wake(&mut self, t: ThreadId) {
        let th = self.thread_mut(t);
        th.wakeup_time = 0;
        th.flags.insert(ThreadFlags::RUNNABLE);
    }

    fn dosleep(&mut self, wakeup_time: STime) -> bool {
        let cur = self.current;
        {
            let th = self.thread_mut(cur);
            th.wakeup_time = wakeup_time;
            th.flags.remove(ThreadFlags::TIMED_OUT);
            th.flags.remove(ThreadFlags::RUNNABLE);
        }
        self.schedule();
        let th = self.thread_mut(cur);
        let timed_out = th.flags.contains(ThreadFlags::TIMED_OUT);
        th.flags.remove(ThreadFlags::TIMED_OUT);
        timed_out
    }

    /// Sleep for `ms` milliseconds, or until explicitly woken. Returns
    /// whether the sleep ran to completion (timed out) rather than being
    /// cut short by [`Self::wake`].
    pub fn msleep(&mut self, ms: u32) -> bool {
        let now = self.hv.now();
        self.dosleep(now + ms as i64 * 1_000_000)
    }

    /// Sleep until absolute deadline `ms` milliseconds since the epoch the
    /// hypervisor's clock counts from.
    pub fn absmsleep(&mut self, ms: u32) -> bool {
        self.dosleep(ms as i64 * 1_000_000)
    }

    /// Sleep until an absolute deadline in nanoseconds. The primitive the
    /// clock-sleep adapter in [`crate::clock`] is built on.
    pub fn sleep_until_ns(&mut self, deadline_ns: STime) -> bool {
        self.dosleep(deadline_ns)
    }

    fn ctx_ptrs(&mut self, a: ThreadId, b: ThreadId) -> (*mut A::Context, *mut A::Context) {
        debug_assert_ne!(a, b);
        let pa = self.slots[a.0].as_mut().expect("dangling ThreadId") as *mut Thread<A::Context>;
        let pb = self.slots[b.0].as_mut().expect("dangling ThreadId") as *mut Thread<A::Context>;
        unsafe { (&mut (*pa).ctx as *mut _, &mut (*pb).ctx as *mut _) }
    }

    fn reap_exited(&mut self, prev: ThreadId) {
        let mut i = 0;
        while i < self.exited.len() {
            let tid = self.exited[i];
            if tid != prev {
                self.exited.remove(i);
                let th = self.slots[tid.0].take().expect("dangling ThreadId in exited set");
                if let StackStorage::Owned { ptr, order } = th.stack {
                    unsafe { self.hv.free_pages(ptr, order) };
                }
            } else {
                i += 1;
            }
        }
    }

    /// Run one pass of the selection algorithm: wake any threads whose
    /// timeout has expired, pick the next runnable thread in round-robin
    /// order (rotating it to the tail), and switch to it. Blocks the
    /// virtual CPU via the hypervisor if nothing is runnable yet.
    ///
    /// # Panics
    /// If called from within a scheduler hook or bio completion callback
    /// (§3: "no scheduling decision may be made recursively"), or if IRQs
    /// are already masked on entry.
    pub fn schedule(&mut self) {
        assert!(!self.in_callback, "schedule() called from within a callback context");
        let prev_masked = self.hv.irq_save();
        assert!(!prev_masked, "schedule() called with events already masked");
        let prev = self.current;
        let next;
        loop {
            let now = self.hv.now();
            let mut min_wakeup = now + MAX_BLOCK_NS;
            let mut chosen = None;
            let mut i = 0;
            while i < self.run_queue.len() {
                let tid = self.run_queue[i];
                let (runnable, wakeup_time) = {
                    let th = self.thread_ref(tid);
                    (th.is_runnable(), th.wakeup_time)
                };
                if !runnable && wakeup_time != 0 {
                    if wakeup_time <= now {
                        let th = self.thread_mut(tid);
                        th.flags.insert(ThreadFlags::TIMED_OUT);
                        th.wakeup_time = 0;
                        th.flags.insert(ThreadFlags::RUNNABLE);
                    } else if wakeup_time < min_wakeup {
                        min_wakeup = wakeup_time;
                    }
                }
                if self.thread_ref(tid).is_runnable() {
                    chosen = Some(i);
                    break;
                }
                i += 1;
            }
            if let Some(idx) = chosen {
                let tid = self.run_queue.remove(idx);
                self.run_queue.push(tid);
                next = tid;
                break;
            }
            self.hv.block_domain(min_wakeup);
            self.hv.force_evtchn_callback();
        }
        self.hv.irq_restore(prev_masked);

        if prev != next {
            if let Some(hook) = self.hook {
                let pc = self.thread_ref(prev).cookie;
                let nc = self.thread_ref(next).cookie;
                self.run_callback(|| hook(pc, nc));
            }
            self.current = next;
            let (prev_ctx, next_ctx) = self.ctx_ptrs(prev, next);
            unsafe { A::switch(&mut *prev_ctx, &mut *next_ctx) };
        }

        self.reap_exited(prev);
    }

    /// Exit the current thread. If it was created joinable, blocks until a
    /// matching [`Self::join`] call collects it. Never returns.
    pub fn exit(&mut self) -> ! {
        loop {
            let cur = self.current;
            if !self.thread_ref(cur).flags.contains(ThreadFlags::MUST_JOIN) {
                break;
            }
            self.thread_mut(cur).flags.insert(ThreadFlags::JOINED);
            if let Some(&(waiter, _)) = self.join_wait.iter().find(|&&(_, wanted)| wanted == cur) {
                self.wake(waiter);
            }
            self.block(cur);
            self.schedule();
        }
        let cur = self.current;
        self.run_queue.retain(|&id| id != cur);
        self.thread_mut(cur).flags.remove(ThreadFlags::RUNNABLE);
        self.exited.insert(0, cur);
        loop {
            self.schedule();
            error!("schedule() returned inside exit(); retrying");
        }
    }

    /// Block until `target` has exited, then allow it to be reaped.
    ///
    /// # Panics
    /// If `target` was not created with `joinable = true`.
    pub fn join(&mut self, target: ThreadId) {
        assert!(
            self.thread_ref(target).flags.contains(ThreadFlags::MUST_JOIN),
            "join() called on a non-joinable thread"
        );
        loop {
            if self.thread_ref(target).flags.contains(ThreadFlags::JOINED) {
                break;
            }
            let me = self.current;
            self.join_wait.push((me, target));
            self.block(me);
            self.schedule();
            self.join_wait.retain(|&(w, wanted)| !(w == me && wanted == target));
        }
        debug_assert!(self.thread_ref(target).flags.contains(ThreadFlags::JOINED));
        self.thread_mut(target).flags.remove(ThreadFlags::MUST_JOIN);
        self.wake(target);
    }
}

fn idle_entry<H: Hypervisor, A: ArchThread>(arg: usize) {
    let sched: &mut Scheduler<H, A> = unsafe { &mut *(arg as *mut _) };
    sched.threads_started = true;
    trace!("idle thread running");
    loop {
        let me = sched.current;
        sched.block(me);
        sched.schedule();
    }
}
