//! Deterministic, host-only implementations of the [`super`] traits.
//!
//! These never talk to real hardware: [`SimHypervisor`]'s clock only moves
//! when a test tells it to (or when the scheduler blocks the domain waiting
//! for a timeout), [`SimArch`] represents each kernel thread as a real OS
//! thread handed a baton so that only one ever runs at a time, and
//! [`SimBlockBackend`] completes every submitted request synchronously.
//! This is test-only scaffolding, not a second production backend.

use super::{ArchThread, BlockBackend, DeviceInfo, Hypervisor, STime, SyncFacade};
use crate::errno::Errno;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{Condvar, Mutex};

/// Simulated hypervisor: a clock that only advances explicitly or when the
/// scheduler blocks the domain, plus an in-memory console.
pub struct SimHypervisor {
    inner: Mutex<SimHvInner>,
}

struct SimHvInner {
    now_ns: STime,
    irq_masked: bool,
    console: Vec<u8>,
}

impl SimHypervisor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimHvInner {
                now_ns: 0,
                irq_masked: false,
                console: Vec::new(),
            }),
        }
    }

    /// Move the simulated clock forward.
    pub fn advance(&self, ns: STime) {
        self.inner.lock().unwrap().now_ns += ns;
    }

    /// Everything written via `console_print` so far.
    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap().console).into_owned()
    }
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for SimHypervisor {
    fn now(&self) -> STime {
        self.inner.lock().unwrap().now_ns
    }

    fn irq_save(&self) -> bool {
        let mut g = self.inner.lock().unwrap();
        core::mem::replace(&mut g.irq_masked, true)
    }

    fn irq_restore(&self, prev_masked: bool) {
        self.inner.lock().unwrap().irq_masked = prev_masked;
    }

    fn block_domain(&self, deadline: STime) {
        // Nothing real to wait on: just jump the clock to the deadline so
        // the scheduler's retry loop finds a timed-out thread next pass.
        let mut g = self.inner.lock().unwrap();
        if g.now_ns < deadline {
            g.now_ns = deadline;
        }
    }

    fn force_evtchn_callback(&self) {}

    fn alloc_pages(&self, order: u32) -> Option<*mut u8> {
        let len = 4096usize << order;
        let layout = core::alloc::Layout::from_size_align(len, 4096).ok()?;
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() { None } else { Some(ptr) }
    }

    unsafe fn free_pages(&self, ptr: *mut u8, order: u32) {
        let len = 4096usize << order;
        let layout = core::alloc::Layout::from_size_align(len, 4096).unwrap();
        unsafe { alloc::alloc::dealloc(ptr, layout) };
    }

    fn memalloc(&self, len: usize, align: usize) -> Option<*mut u8> {
        let layout = core::alloc::Layout::from_size_align(len, align).ok()?;
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() { None } else { Some(ptr) }
    }

    unsafe fn memfree(&self, ptr: *mut u8, len: usize, align: usize) {
        let layout = core::alloc::Layout::from_size_align(len, align).unwrap();
        unsafe { alloc::alloc::dealloc(ptr, layout) };
    }

    fn console_print(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().console.extend_from_slice(bytes);
    }

    fn host_exit(&self, code: i32) -> ! {
        panic!("host_exit({code}) called under simulation");
    }
}

/// One-shot hand-off primitive: exactly one side is ever runnable, and
/// `give`/`wait_for_turn` form a rendezvous so a stray OS-level spurious
/// wakeup can never let two simulated kernel threads run concurrently.
struct Baton {
    runnable: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn new(initially_runnable: bool) -> Self {
        Self {
            runnable: Mutex::new(initially_runnable),
            cv: Condvar::new(),
        }
    }

    fn give(&self) {
        let mut g = self.runnable.lock().unwrap();
        *g = true;
        self.cv.notify_one();
    }

    fn wait_for_turn(&self) {
        let mut g = self.runnable.lock().unwrap();
        while !*g {
            g = self.cv.wait(g).unwrap();
        }
        *g = false;
    }
}

/// Each simulated kernel thread's context: just the baton used to resume it.
pub struct SimContext {
    baton: Arc<Baton>,
}

/// `ArchThread` backed by real OS threads instead of a register-level
/// context switch. Only one simulated kernel thread is ever runnable at a
/// time, so this is safe despite every "thread" sharing the same
/// `Scheduler` through a raw pointer (see [`crate::sched`]'s thread-entry
/// convention).
pub struct SimArch;

impl ArchThread for SimArch {
    type Context = SimContext;

    fn create(entry: fn(usize), arg: usize, _stack: &mut [u8]) -> Self::Context {
        let baton = Arc::new(Baton::new(false));
        let baton_for_thread = baton.clone();
        std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                baton_for_thread.wait_for_turn();
                entry(arg);
                // entry() is expected never to return (it ends in
                // Scheduler::exit()'s infinite schedule() loop); if it
                // somehow does, just stop accepting turns.
                loop {
                    baton_for_thread.wait_for_turn();
                }
            })
            .expect("spawn simulated kernel thread");
        SimContext { baton }
    }

    fn bootstrap() -> Self::Context {
        SimContext {
            baton: Arc::new(Baton::new(true)),
        }
    }

    fn switch(prev: &mut Self::Context, next: &mut Self::Context) {
        next.baton.give();
        prev.baton.wait_for_turn();
    }
}

/// Simulated block device handle.
pub struct SimDevice {
    id: usize,
}

/// Block backend that completes every submitted request immediately
/// (visible on the *next* `poll` call), optionally forced to fail.
pub struct SimBlockBackend {
    next_id: usize,
    pending: Mutex<BTreeMap<usize, Vec<(u64, Result<usize, Errno>)>>>,
    pub force_errors: bool,
    pub force_readonly: bool,
    pub init_calls: usize,
    pub shutdown_calls: usize,
}

impl SimBlockBackend {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: Mutex::new(BTreeMap::new()),
            force_errors: false,
            force_readonly: false,
            init_calls: 0,
            shutdown_calls: 0,
        }
    }
}

impl Default for SimBlockBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-reentrant lock behind [`SimSyncFacade::Mutex`]. A thin wrapper
/// instead of a bare `std::sync::Mutex` since the facade's `enter`/`exit`
/// pair has no guard value to carry between the two calls.
pub struct SimMutex(Mutex<bool>);

impl SimMutex {
    fn lock(&self) {
        // Never actually contended under the baton model (only one
        // simulated kernel thread ever runs at a time), so a spin here
        // never needs to wait for long.
        loop {
            let mut g = self.0.lock().unwrap();
            if !*g {
                *g = true;
                return;
            }
            drop(g);
            std::thread::yield_now();
        }
    }

    fn unlock(&self) {
        *self.0.lock().unwrap() = false;
    }
}

/// Condvar behind [`SimSyncFacade::Condvar`], self-contained so
/// `condvar_wait_nowrap` doesn't need a guard tied to the paired
/// [`SimMutex`]'s internal lock.
pub struct SimCondvar {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl SimCondvar {
    fn wait(&self) {
        let mut g = self.woken.lock().unwrap();
        while !*g {
            g = self.cv.wait(g).unwrap();
        }
        *g = false;
    }

    fn signal(&self) {
        *self.woken.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

/// Test-only [`SyncFacade`]: simple `std`-backed mutex/condvar for the
/// associated types, and no-op `hyp_schedule`/`hyp_unschedule`/
/// `hyp_lwproc_newlwp` since nothing in the test harness ever plays the
/// role of the bigger lock these are meant to release around the caller.
pub struct SimSyncFacade;

impl SimSyncFacade {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimSyncFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncFacade for SimSyncFacade {
    type Mutex = SimMutex;
    type Condvar = SimCondvar;

    fn mutex_init(&self) -> Self::Mutex {
        SimMutex(Mutex::new(false))
    }

    fn mutex_enter(&self, m: &Self::Mutex) {
        m.lock();
    }

    fn mutex_enter_nowrap(&self, m: &Self::Mutex) {
        m.lock();
    }

    fn mutex_exit(&self, m: &Self::Mutex) {
        m.unlock();
    }

    fn condvar_init(&self) -> Self::Condvar {
        SimCondvar {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn condvar_wait_nowrap(&self, cv: &Self::Condvar, m: &Self::Mutex) {
        m.unlock();
        cv.wait();
        m.lock();
    }

    fn condvar_signal(&self, cv: &Self::Condvar) {
        cv.signal();
    }

    fn hyp_unschedule(&self) {}

    fn hyp_schedule(&self) {}

    fn hyp_lwproc_newlwp(&self, _arg: i32) {}
}

impl BlockBackend for SimBlockBackend {
    type Device = SimDevice;

    fn init(&mut self, _path: &str) -> Result<(SimDevice, DeviceInfo), Errno> {
        self.init_calls += 1;
        let id = self.next_id;
        self.next_id += 1;
        Ok((
            SimDevice { id },
            DeviceInfo {
                sectors: 2048,
                sector_size: 512,
                writable: !self.force_readonly,
            },
        ))
    }

    fn shutdown(&mut self, _dev: SimDevice) {
        self.shutdown_calls += 1;
    }

    fn submit_read(&mut self, dev: &mut SimDevice, token: u64, buf: *mut u8, len: usize, _offset: i64) {
        if self.force_errors {
            self.pending
                .lock()
                .unwrap()
                .entry(dev.id)
                .or_default()
                .push((token, Err(Errno::EIO)));
            return;
        }
        unsafe { core::ptr::write_bytes(buf, 0, len) };
        self.pending
            .lock()
            .unwrap()
            .entry(dev.id)
            .or_default()
            .push((token, Ok(len)));
    }

    fn submit_write(&mut self, dev: &mut SimDevice, token: u64, _buf: *const u8, len: usize, _offset: i64) {
        let result = if self.force_errors { Err(Errno::EIO) } else { Ok(len) };
        self.pending
            .lock()
            .unwrap()
            .entry(dev.id)
            .or_default()
            .push((token, result));
    }

    fn poll(&mut self, dev: &mut SimDevice) -> Vec<(u64, Result<usize, Errno>)> {
        self.pending.lock().unwrap().remove(&dev.id).unwrap_or_default()
    }

    fn register_wait(&mut self, _dev: &mut SimDevice) {
        // Every submission here completes synchronously (visible on the
        // very next poll), so there is no wait object to register against.
    }
}
