//! Wraparound-safe frame counter comparison

/// Returns true if `a` is ahead of `b` on the circular 32-bit frame space.
///
/// Frame counters wrap after 2^32 frames and UDP may deliver a wrapped
/// counter before its predecessor, so plain `>` is never correct here.
/// When `a` and `b` are exactly 2^31 apart the answer is an unspecified tie;
/// callers must not depend on its direction.
#[inline]
pub fn is_greater(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) > u32::MAX / 2
}
