//! Random spread added to polling intervals.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::time::Duration;

/// Uniform random delay in `[0, interval * percent / 100)`
///
/// Zero when the range is empty.
pub fn jitter<R: Rng + ?Sized>(interval: Duration, percent: u32, rng: &mut R) -> Duration {
    let max_nanos = interval.as_nanos() * u128::from(percent) / 100;
    let max_nanos = u64::try_from(max_nanos).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(Uniform::new(0, max_nanos).sample(rng))
}
