use nix::time::{clock_gettime, ClockId};

/// Nanoseconds on CLOCK_MONOTONIC, the clock behind `bpf_ktime_get_ns`.
pub fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(e) => {
            log::warn!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
