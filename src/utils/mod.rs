mod users;

pub(crate) use self::users::{Counted, UserRef};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a table mutex. A panic while holding it never leaves a table in a
/// state that later callers cannot use, so poisoning is ignored.
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Round `n` up to a multiple of the power of two `align`.
#[inline]
pub(crate) const fn align_up(n: u32, align: u32) -> u32 {
    (n + align - 1) & !(align - 1)
}

/// Round `n` up to a power of two. Zero stays zero.
#[inline]
pub(crate) const fn pow2_roundup(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        n.next_power_of_two()
    }
}

/// Round `n` up to a power of two, `None` if that exceeds `u32`. Zero stays
/// zero.
#[inline]
pub(crate) const fn checked_pow2_roundup(n: u32) -> Option<u32> {
    if n == 0 {
        Some(0)
    } else {
        n.checked_next_power_of_two()
    }
}

/// Floor base-2 logarithm. `n` must be non-zero.
#[inline]
pub(crate) const fn ilog2(n: u32) -> u32 {
    31 - n.leading_zeros()
}

/// Order queue memory writes before a doorbell update.
#[inline(always)]
pub(crate) fn wmb() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
}

#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arith() {
        assert_eq!(align_up(68, 16), 80);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(pow2_roundup(0), 0);
        assert_eq!(pow2_roundup(200), 256);
        assert_eq!(pow2_roundup(256), 256);
        assert_eq!(checked_pow2_roundup(0), Some(0));
        assert_eq!(checked_pow2_roundup(1 << 31), Some(1 << 31));
        assert_eq!(checked_pow2_roundup((1 << 31) + 1), None);
        assert_eq!(ilog2(1), 0);
        assert_eq!(ilog2(4096), 12);
        assert_eq!(ilog2(4097), 12);
    }
}
