/// Round up `n` to the nearest multiple of `to`. Returns `None` on overflow.
pub fn round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to != 0);
    n.checked_add(to - 1).map(|n| to * (n / to))
}

/// Round down `n` to the nearest multiple of `to`
pub fn round_down(n: usize, to: usize) -> usize {
    debug_assert!(to != 0);
    to * (n / to)
}

/// `1 - part / whole`, or exactly `0.0` when `whole` is zero. `part` must not
/// exceed `whole`.
pub fn complement_ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    debug_assert!(part <= whole);
    1.0 - part as f64 / whole as f64
}
