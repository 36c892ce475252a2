//! Block I/O submission and completion pump.
//!
//! Application threads submit reads/writes through [`BioPump::bio`]; a
//! dedicated pump thread (spawned lazily on the first submission) drains
//! backend completions and dispatches the caller's callback. This mirrors
//! mini-os's `blkfront`/aiocb plumbing, but completions are correlated by a
//! plain `u64` token instead of a raw callback pointer threaded through the
//! backend, so the dispatch path here never needs `unsafe`.

use crate::errno::Errno;
use crate::hal::{ArchThread, BlockBackend, DeviceInfo, Hypervisor, SyncFacade};
use crate::sched::Scheduler;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::marker::PhantomData;
use log::debug;

/// Number of logical block-device slots.
pub const NBLKDEV: usize = 10;
/// File-descriptor base: slot `n` is exposed as `BLKFDOFF + n`.
pub const BLKFDOFF: i32 = 64;

bitflags! {
    /// Mirrors the `O_RDONLY`/`O_WRONLY`/`O_RDWR` plus a block-I/O marker
    /// bit that `open` requires to be set (there is no other file kind at
    /// this layer to default to).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const RDONLY = 0b0001;
        const WRONLY = 0b0010;
        const RDWR   = 0b0011;
        const BIO    = 0b0100;
    }
}

/// The only file type this layer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Blk,
}

/// Read or write, as passed to [`BioPump::bio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
}

/// `(arg, nbytes, errno)`, invoked exactly once per accepted submission.
/// `errno` is `0` on success; `nbytes` is `0` whenever `errno != 0`.
pub type BiodoneFn = fn(usize, usize, i32);

struct BioRequest {
    done: BiodoneFn,
    arg: usize,
    slot: usize,
}

struct BlockDevSlot<D> {
    dev: Option<D>,
    info: Option<DeviceInfo>,
    openers: u32,
    outstanding: u32,
}

impl<D> BlockDevSlot<D> {
    fn empty() -> Self {
        Self {
            dev: None,
            info: None,
            openers: 0,
            outstanding: 0,
        }
    }
}

/// Owns the per-slot device table, the outstanding-request counters, and the
/// lazily spawned pump thread.
///
/// Like [`Scheduler`], this must not move after the first [`Self::bio`] call
/// spawns the pump thread: that thread reaches back into `*self` through a
/// raw pointer captured at spawn time.
pub struct BioPump<H: Hypervisor, A: ArchThread, B: BlockBackend, S: SyncFacade> {
    slots: Vec<BlockDevSlot<B::Device>>,
    outstanding_total: u32,
    pending: BTreeMap<u64, BioRequest>,
    next_token: u64,
    pump_thread: Option<crate::sched::ThreadId>,
    backend: B,
    sync: S,
    _marker: PhantomData<(H, A)>,
}

impl<H: Hypervisor, A: ArchThread, B: BlockBackend, S: SyncFacade> BioPump<H, A, B, S> {
    pub fn new(backend: B, sync: S) -> Box<Self> {
        Box::new(Self {
            slots: (0..NBLKDEV).map(|_| BlockDevSlot::empty()).collect(),
            outstanding_total: 0,
            pending: BTreeMap::new(),
            next_token: 0,
            pump_thread: None,
            backend,
            sync,
            _marker: PhantomData,
        })
    }

    /// The number of requests submitted but not yet completed, across every
    /// slot. Exposed mainly for tests asserting the invariant in §8 of the
    /// design ledger (`outstanding_total == sum(per_slot)`).
    pub fn outstanding_total(&self) -> u32 {
        self.outstanding_total
    }

    /// Open (or ref-bump) the device named `blk<n>`.
    ///
    /// `mode` must carry [`OpenMode::BIO`]; `name` must be exactly `blk`
    /// followed by a single digit in `0..NBLKDEV`. Requesting write access
    /// against a device that only opened read-only fails with
    /// [`Errno::EROFS`] and leaves the slot's state unchanged.
    pub fn open(&mut self, name: &str, mode: OpenMode) -> Result<i32, Errno> {
        if !mode.contains(OpenMode::BIO) {
            return Err(Errno::ENXIO);
        }
        let n = parse_blk_name(name).ok_or(Errno::ENXIO)?;
        let wants_write = mode.intersects(OpenMode::WRONLY);

        if self.slots[n].dev.is_some() {
            let writable = self.slots[n].info.map(|i| i.writable).unwrap_or(false);
            if wants_write && !writable {
                return Err(Errno::EROFS);
            }
            self.slots[n].openers += 1;
            return Ok(BLKFDOFF + n as i32);
        }

        let path = format!("device/vbd/{}", 768 + (n << 6));
        let (dev, info) = self.backend.init(&path)?;
        if wants_write && !info.writable {
            self.backend.shutdown(dev);
            return Err(Errno::EROFS);
        }
        self.slots[n].dev = Some(dev);
        self.slots[n].info = Some(info);
        self.slots[n].openers = 1;
        debug!("bio open {name} -> fd={}", BLKFDOFF + n as i32);
        Ok(BLKFDOFF + n as i32)
    }

    /// Drop a reference to `fd`; releases the backend device once the
    /// refcount reaches zero.
    pub fn close(&mut self, fd: i32) -> Result<(), Errno> {
        let n = fd_to_slot(fd)?;
        if self.slots[n].dev.is_none() {
            return Err(Errno::EBADF);
        }
        self.slots[n].openers = self.slots[n].openers.saturating_sub(1);
        if self.slots[n].openers == 0 {
            if let Some(dev) = self.slots[n].dev.take() {
                self.slots[n].info = None;
                self.backend.shutdown(dev);
                debug!("bio close fd={fd}: backend shut down");
            }
        }
        Ok(())
    }

    /// `(size_bytes, FileType::Blk)` for `blk<n>`, without leaving it open.
    pub fn fileinfo(&mut self, name: &str) -> Result<(u64, FileType), Errno> {
        let fd = self.open(name, OpenMode::RDONLY | OpenMode::BIO)?;
        let n = fd_to_slot(fd)?;
        let size = self.slots[n].info.map(|i| i.size_bytes()).unwrap_or(0);
        self.close(fd)?;
        Ok((size, FileType::Blk))
    }

    /// Submit a single asynchronous read or write against `fd`.
    ///
    /// `buf` must stay valid and exclusively borrowed until `done` is
    /// invoked. Spawns the pump thread on the very first call.
    pub fn bio(
        &mut self,
        sched: &mut Scheduler<H, A>,
        fd: i32,
        op: BioOp,
        buf: *mut u8,
        len: usize,
        off: i64,
        done: BiodoneFn,
        arg: usize,
    ) -> Result<(), Errno> {
        let slot_idx = fd_to_slot(fd)?;
        if self.slots[slot_idx].dev.is_none() {
            return Err(Errno::EBADF);
        }

        if self.pump_thread.is_none() {
            // The pump thread runs backend-invoked completion dispatch, so
            // it needs to be registered with the higher-layer runtime the
            // same way a foreign callback thread would be.
            self.sync.hyp_lwproc_newlwp(0);
            let args = Box::new(PumpArgs::<H, A, B, S> {
                pump: self as *mut Self,
                sched: sched as *mut Scheduler<H, A>,
            });
            let args_ptr = Box::into_raw(args) as usize;
            let id = sched.create("bio-pump", 0, pump_entry::<H, A, B, S>, args_ptr, None, false);
            self.pump_thread = Some(id);
            debug!("spawned bio pump thread {id:?}");
        }

        let token = self.next_token;
        self.next_token += 1;
        self.pending.insert(token, BioRequest { done, arg, slot: slot_idx });

        {
            let dev = self.slots[slot_idx].dev.as_mut().expect("checked above");
            match op {
                BioOp::Read => self.backend.submit_read(dev, token, buf, len, off),
                BioOp::Write => self.backend.submit_write(dev, token, buf as *const u8, len, off),
            }
        }
        self.slots[slot_idx].outstanding += 1;
        self.outstanding_total += 1;
        trace_submission(fd, op, token);
        Ok(())
    }

    fn dispatch(&mut self, sched: &mut Scheduler<H, A>, slot_idx: usize, token: u64, result: Result<usize, Errno>) {
        if let Some(req) = self.pending.remove(&token) {
            let (len, errno) = match result {
                Ok(n) => (n, 0),
                Err(e) => (0, e.code()),
            };
            // Run with schedule() disarmed: biodone must not make a
            // scheduling decision recursively (§3).
            sched.run_callback(|| (req.done)(req.arg, len, errno));
            self.slots[slot_idx].outstanding = self.slots[slot_idx].outstanding.saturating_sub(1);
            self.outstanding_total = self.outstanding_total.saturating_sub(1);
        }
    }

    /// The pump thread's body: wait while nothing is outstanding, then poll
    /// every slot with outstanding requests until at least one completes,
    /// dispatching as it goes. Never returns.
    fn run(&mut self, sched: &mut Scheduler<H, A>) -> ! {
        loop {
            while self.outstanding_total == 0 {
                self.sync.hyp_unschedule();
                let me = sched.current_id();
                sched.block(me);
                sched.schedule();
                self.sync.hyp_schedule();
            }
            loop {
                // Masked for the whole drain-and-dispatch pass (per §9:
                // biodone runs with the event mask on, bio_mtx not held),
                // restored before any call back into schedule() — schedule()
                // itself refuses to run with events already masked.
                let masked = sched.hypervisor().irq_save();
                let mut completions: Vec<(usize, u64, Result<usize, Errno>)> = Vec::new();
                for i in 0..self.slots.len() {
                    if self.slots[i].outstanding == 0 {
                        continue;
                    }
                    let Some(dev) = self.slots[i].dev.as_mut() else {
                        continue;
                    };
                    for (token, result) in self.backend.poll(dev) {
                        completions.push((i, token, result));
                    }
                }
                if completions.is_empty() {
                    for slot in self.slots.iter_mut() {
                        if slot.outstanding == 0 {
                            continue;
                        }
                        if let Some(dev) = slot.dev.as_mut() {
                            self.backend.register_wait(dev);
                        }
                    }
                    sched.hypervisor().irq_restore(masked);
                    sched.schedule();
                    continue;
                }
                for (slot_idx, token, result) in completions {
                    self.dispatch(sched, slot_idx, token, result);
                }
                sched.hypervisor().irq_restore(masked);
                break;
            }
        }
    }
}

fn trace_submission(fd: i32, op: BioOp, token: u64) {
    log::trace!("bio submit fd={fd} op={op:?} token={token}");
}

struct PumpArgs<H: Hypervisor, A: ArchThread, B: BlockBackend, S: SyncFacade> {
    pump: *mut BioPump<H, A, B, S>,
    sched: *mut Scheduler<H, A>,
}

fn pump_entry<H: Hypervisor, A: ArchThread, B: BlockBackend, S: SyncFacade>(arg: usize) {
    let args = unsafe { Box::from_raw(arg as *mut PumpArgs<H, A, B, S>) };
    let pump: &mut BioPump<H, A, B, S> = unsafe { &mut *args.pump };
    let sched: &mut Scheduler<H, A> = unsafe { &mut *args.sched };
    pump.run(sched);
}

fn fd_to_slot(fd: i32) -> Result<usize, Errno> {
    let idx = fd - BLKFDOFF;
    if idx < 0 || idx as usize >= NBLKDEV {
        return Err(Errno::EBADF);
    }
    Ok(idx as usize)
}

fn parse_blk_name(name: &str) -> Option<usize> {
    let digit = name.strip_prefix("blk")?;
    if digit.len() != 1 {
        return None;
    }
    let n = digit.chars().next()?.to_digit(10)? as usize;
    if n < NBLKDEV { Some(n) } else { None }
}
