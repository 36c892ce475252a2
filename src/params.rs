//! Fixed configuration table, standing in for `rumpuser_getparam`'s
//! environment lookups (`RUMP_NCPU`, `RUMP_HOSTNAME`, `RUMP_VERBOSE`,
//! `RUMP_MEMLIMIT`, ...). A paravirtualized guest has no argv/envp to parse
//! at this layer, so the values are compiled in rather than read from a
//! process environment.

use crate::errno::Errno;

/// `(name, value)` pairs this guest understands.
pub const PARAMS: &[(&str, &str)] = &[
    ("RUMP_NCPU", "1"),
    ("RUMP_HOSTNAME", "rump4xen"),
    ("RUMP_VERBOSE", "1"),
    ("RUMP_MEMLIMIT", "8m"),
];

/// Look up a parameter by name.
///
/// Returns [`Errno::ENOENT`] for anything not in [`PARAMS`].
pub fn getparam(name: &str) -> Result<&'static str, Errno> {
    PARAMS
        .iter()
        .find(|(k, _)| *k == name)
        .map(|(_, v)| *v)
        .ok_or(Errno::ENOENT)
}

/// Copy a parameter's value, NUL-terminated, into `buf`.
///
/// Returns the number of value bytes written (excluding the NUL). Mirrors
/// the `rumpuser_getparam(name, buf, buflen)` boundary: [`Errno::E2BIG`] if
/// `buf` can't hold the value plus its terminator.
pub fn getparam_into(name: &str, buf: &mut [u8]) -> Result<usize, Errno> {
    let value = getparam(name)?;
    let bytes = value.as_bytes();
    if buf.len() < bytes.len() + 1 {
        return Err(Errno::E2BIG);
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[bytes.len()] = 0;
    Ok(bytes.len())
}
