//! Cooperative round-robin kernel-thread scheduler and block I/O completion
//! pump for a paravirtualized guest.
//!
//! This crate models the part of a rump-kernel hypercall layer that runs
//! entirely on one virtual CPU: a non-preemptive scheduler that only ever
//! switches threads at an explicit `schedule()` call, and a block I/O pump
//! that turns a paravirtualized disk backend's asynchronous completions into
//! ordinary callback dispatch. Everything that touches real hardware or a
//! real hypervisor sits behind the traits in [`hal`], so the scheduling and
//! pump logic itself is plain, host-testable safe Rust.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bio;
pub mod clock;
pub mod errno;
pub mod hal;
pub mod logger;
pub mod params;
pub mod rand;
pub mod sched;

pub use errno::Errno;
pub use sched::{Scheduler, Thread, ThreadFlags, ThreadId};

/// Terminal shutdown hook. Flushes nothing, never returns.
///
/// Mirrors `rumpuser_exit`: the embedder's [`hal::Hypervisor::host_exit`] is
/// responsible for actually tearing the guest down (hypercall, reset, etc).
/// If it ever returns anyway, spin rather than fall off the end of the
/// function.
pub fn do_exit<H: hal::Hypervisor>(hv: &H, code: i32) -> ! {
    log::error!("do_exit({code})");
    hv.host_exit(code);
    #[allow(unreachable_code)]
    loop {
        core::hint::spin_loop();
    }
}
