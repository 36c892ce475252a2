//! Pseudo-random byte source, standing in for `rumpuser_getrandom`.
//!
//! True to the original's own comment ("not very random"), this is not a
//! CSPRNG: there is no entropy device reachable through [`crate::hal`], so
//! the stream is just an xorshift64 state seeded from
//! [`crate::hal::Hypervisor::now`] and stepped once per output byte.

use crate::errno::Errno;
use crate::hal::Hypervisor;

/// Fill `buf` with pseudo-random bytes, seeded from `hv`'s clock.
///
/// Always fills the whole buffer and returns `buf.len()`; mirrors
/// `rumpuser_getrandom`'s `(buf, buflen, flags, retp)` shape minus `flags`,
/// which the original accepts and never reads.
pub fn getrandom<H: Hypervisor>(hv: &H, buf: &mut [u8]) -> Result<usize, Errno> {
    if buf.is_empty() {
        return Ok(0);
    }
    let mut state = seed(hv.now());
    for byte in buf.iter_mut() {
        state = xorshift64(state);
        *byte = (state & 0xff) as u8;
    }
    Ok(buf.len())
}

/// Fold the clock reading into a nonzero xorshift64 seed (an all-zero state
/// never advances).
fn seed(now_ns: i64) -> u64 {
    let n = now_ns as u64;
    if n == 0 { 0x9e3779b97f4a7c15 } else { n }
}

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimHypervisor;

    #[test]
    fn empty_buffer_touches_nothing() {
        let hv = SimHypervisor::new();
        let mut buf: [u8; 0] = [];
        assert_eq!(getrandom(&hv, &mut buf), Ok(0));
    }

    #[test]
    fn fills_whole_buffer() {
        let hv = SimHypervisor::new();
        hv.advance(1);
        let mut buf = [0u8; 32];
        assert_eq!(getrandom(&hv, &mut buf), Ok(32));
        assert!(buf.iter().any(|&b| b != 0), "xorshift stream should not be all zero");
    }

    #[test]
    fn same_clock_reading_reproduces_the_same_stream() {
        let hv1 = SimHypervisor::new();
        hv1.advance(42);
        let hv2 = SimHypervisor::new();
        hv2.advance(42);
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        getrandom(&hv1, &mut a).unwrap();
        getrandom(&hv2, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_clock_readings_diverge() {
        let hv1 = SimHypervisor::new();
        hv1.advance(1);
        let hv2 = SimHypervisor::new();
        hv2.advance(2);
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        getrandom(&hv1, &mut a).unwrap();
        getrandom(&hv2, &mut b).unwrap();
        assert_ne!(a, b);
    }
}
