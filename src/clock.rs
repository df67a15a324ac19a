//! Clock sources
//!
//! Thin wrappers over `clock_gettime(2)`. The timer wheel works in wall-clock
//! milliseconds (see [now_ms](fn.now_ms.html)); the monotonic variants exist
//! for measuring intervals.

fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(clock, &mut ts) };
    ts
}

#[inline(always)]
pub fn time() -> f64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

#[inline(always)]
pub fn time64() -> u64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

#[inline(always)]
pub fn monotonic64() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall-clock milliseconds since the epoch. Timer deadlines are expressed in
/// this unit.
#[inline(always)]
pub fn now_ms() -> u64 {
    time64() / 1_000_000
}
