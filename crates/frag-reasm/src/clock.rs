//! Tick source for entry timestamps and timeout budgets.
//!
//! One tick is one nanosecond. On Linux, ticks come from `CLOCK_MONOTONIC_RAW`
//! (immune to NTP slew). On other platforms, an `Instant`-based fallback is used.
//! Ticks only ever feed age comparisons; they carry no wall-clock meaning.

use std::time::Duration;

pub const TICKS_PER_MS: u64 = 1_000_000;

/// Current monotonic tick count.
#[inline(always)]
pub fn now_ticks() -> u64 {
    ticks_from_duration(monotonic())
}

#[cfg(target_os = "linux")]
#[inline(always)]
fn monotonic() -> Duration {
    // clock_gettime only writes into the zeroed timespec.
    let ts = unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        ts
    };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(not(target_os = "linux"))]
fn monotonic() -> Duration {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

pub fn ticks_from_millis(ms: u64) -> u64 {
    ms.saturating_mul(TICKS_PER_MS)
}

pub fn ticks_from_duration(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ticks_monotonic() {
        let a = now_ticks();
        let b = now_ticks();
        assert!(b >= a);
    }

    #[test]
    fn test_now_ticks_counts_nanoseconds() {
        let a = now_ticks();
        std::thread::sleep(Duration::from_millis(2));
        let b = now_ticks();
        assert!(b - a >= ticks_from_millis(2));
        assert!(b - a < ticks_from_millis(2_000));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(ticks_from_millis(3), 3_000_000);
        assert_eq!(ticks_from_millis(u64::MAX), u64::MAX);
        assert_eq!(ticks_from_duration(Duration::from_micros(7)), 7_000);
    }
}
