//! Arithmetic on the circular keyspace `[0.0, 1.0)`.

/// Returns true if `location` is a valid normalized location.
///
/// `1.0` is accepted and treated as equivalent to `0.0`.
pub fn is_valid(location: f64) -> bool {
    (0.0..=1.0).contains(&location)
}

/// Reduces `x` modulo `1.0` into `[0.0, 1.0)`.
pub fn normalize(x: f64) -> f64 {
    let reduced = x - x.floor();

    // A tiny negative `x` rounds up to exactly 1.0.
    if reduced >= 1.0 {
        return 0.0;
    }
    reduced
}

/// Returns the signed shortest distance to move from `from` to `to` along the circle.
///
/// The result `diff` satisfies `normalize(from + diff) == normalize(to)` (up to rounding) and
/// `-0.5 < diff <= 0.5`. When both arcs are exactly `0.5` long, the increasing direction is
/// chosen.
pub fn change(from: f64, to: f64) -> f64 {
    let diff = normalize(to) - normalize(from);
    if diff > 0.5 {
        diff - 1.0
    } else if diff <= -0.5 {
        diff + 1.0
    } else {
        diff
    }
}

/// Returns the length of the shorter arc between `a` and `b`.
pub fn distance(a: f64, b: f64) -> f64 {
    change(a, b).abs()
}
