//! `clock_sleep`-style adapter over [`crate::Scheduler`]'s sleep primitives.
//!
//! Higher layers think in terms of `(seconds, nanoseconds)` pairs and a
//! relative/absolute distinction rather than the scheduler's own absolute
//! nanosecond deadlines; this module is the narrow translation between the
//! two, matching `rumpuser_clock_sleep`'s `RUMPUSER_CLOCK_{RELWALL,ABSMONO}`
//! split.

use crate::hal::{ArchThread, Hypervisor, SyncFacade};
use crate::sched::Scheduler;

/// Which clock a [`clock_sleep`] call is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// Sleep for `sec` seconds plus `nsec` nanoseconds from now.
    RelWall,
    /// Sleep until `sec` seconds plus `nsec` nanoseconds since the
    /// hypervisor's own epoch.
    AbsMono,
}

/// Put the calling thread to sleep per `kind`, returning whether the sleep
/// ran to completion (as opposed to being cut short by an explicit
/// [`Scheduler::wake`]).
///
/// Both variants first release any higher-layer scheduler lock the caller
/// holds via `sync`'s `hyp_unschedule`/`hyp_schedule` pair, so other threads
/// sharing that lock may run while this one sleeps, then bottom out in
/// [`Scheduler::schedule`] for the actual wait.
pub fn clock_sleep<H: Hypervisor, A: ArchThread, S: SyncFacade>(
    sched: &mut Scheduler<H, A>,
    sync: &S,
    kind: ClockKind,
    sec: u64,
    nsec: u32,
) -> bool {
    sync.hyp_unschedule();
    let timed_out = match kind {
        ClockKind::RelWall => {
            let ms = sec.saturating_mul(1000).saturating_add((nsec / 1_000_000) as u64);
            sched.msleep(ms.min(u32::MAX as u64) as u32)
        }
        ClockKind::AbsMono => {
            let deadline = (sec as i64).saturating_mul(1_000_000_000).saturating_add(nsec as i64);
            sched.sleep_until_ns(deadline)
        }
    };
    sync.hyp_schedule();
    timed_out
}
