// Counter arithmetic: wraparound deltas, scaling and derived events

/// Counter width assumed when an event's width is unknown
pub const DEFAULT_COUNTER_WIDTH: u32 = 24;

/// Number of distinct values a counter of `width` bits can hold
pub fn counter_max(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        1u64 << width
    }
}

/// Bits a counter of `width` bits can set
fn counter_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        counter_max(width) - 1
    }
}

/// Change between two readings of a counter that wraps at `width` bits
///
/// At most one wrap between the readings is assumed. Readings are masked to
/// the counter width first, so sums that left the range cannot underflow.
pub fn get_delta(old: u64, new: u64, width: u32) -> u64 {
    if width >= 64 {
        return new.wrapping_sub(old);
    }

    let mask = counter_mask(width);
    let (old, new) = (old & mask, new & mask);
    if new >= old {
        new - old
    } else {
        (counter_max(width) - old) + new
    }
}

/// Convert a raw count to bytes, sharing traffic across SNC clusters
pub fn scale(raw: u64, scale_factor: u32, snc_num: u32) -> u64 {
    raw.wrapping_mul(scale_factor as u64) / snc_num.max(1) as u64
}

/// Sum of per-context readings, kept inside the counter range
pub fn accumulate(sum: u64, value: u64, width: u32) -> u64 {
    sum.wrapping_add(value) & counter_mask(width)
}

/// A 32-bit counter moved backwards: a wrap the delta cannot be trusted for
pub fn overflowed(width: u32, old: u64, new: u64) -> bool {
    width == 32 && new < old
}

/// Raw remote traffic: total minus local, wrapping like the counters do
pub fn remote_value(total: u64, local: u64, width: u32) -> u64 {
    total.wrapping_sub(local) & counter_mask(width)
}

pub fn remote_delta(total_delta: u64, local_delta: u64) -> u64 {
    total_delta.saturating_sub(local_delta)
}

pub fn ipc(retired_delta: u64, unhalted_delta: u64) -> f64 {
    if unhalted_delta == 0 {
        return 0.0;
    }
    retired_delta as f64 / unhalted_delta as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_without_wrap() {
        assert_eq!(get_delta(100, 150, 24), 50);
        assert_eq!(get_delta(7, 7, 24), 0);
    }

    #[test]
    fn test_delta_single_wrap() {
        assert_eq!(get_delta(16_777_200, 50, 24), 66);
        assert_eq!(get_delta(u32::MAX as u64, 9, 32), 10);
        assert_eq!(get_delta(u64::MAX, 4, 64), 5);
    }

    #[test]
    fn test_delta_of_out_of_range_readings() {
        let max = counter_max(48);
        assert_eq!(get_delta(max + 30, 25, 48), max - 5);
        assert_eq!(get_delta(max + 10, max + 20, 48), 10);
    }

    #[test]
    fn test_scale_divides_by_clusters() {
        assert_eq!(scale(10, 65536, 1), 655_360);
        assert_eq!(scale(10, 65536, 4), 163_840);
        assert_eq!(scale(10, 65536, 0), 655_360);
    }

    #[test]
    fn test_accumulate_wraps_at_width() {
        let max = counter_max(24);
        assert_eq!(accumulate(max - 10, 4, 24), max - 6);
        assert_eq!(accumulate(max - 10, 15, 24), 5);
    }

    #[test]
    fn test_overflow_only_for_32bit_counters() {
        assert!(overflowed(32, 100, 99));
        assert!(!overflowed(32, 99, 100));
        assert!(!overflowed(24, 100, 99));
    }

    #[test]
    fn test_remote_bandwidth() {
        assert_eq!(remote_value(500, 200, 24), 300);
        assert_eq!(remote_value(10, 20, 24), counter_max(24) - 10);
        assert_eq!(remote_delta(640, 128), 512);
        assert_eq!(remote_delta(128, 640), 0);
    }

    #[test]
    fn test_ipc() {
        assert_eq!(ipc(3000, 2000), 1.5);
        assert_eq!(ipc(3000, 0), 0.0);
    }
}
