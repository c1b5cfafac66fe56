//! Injectable randomness for load balancing and probabilistic throttling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform random numbers. Implementations live behind a mutex.
pub trait RandomSource: Send {
    /// Uniform integer in `[0, bound)`; returns 0 when `bound` is 0.
    fn below(&mut self, bound: u64) -> u64;

    /// Uniform float in `[0, 1)`.
    fn unit(&mut self) -> f64;
}

/// `StdRng` backed source, seeded from the OS or explicitly.
pub struct SeededRandom(StdRng);

impl SeededRandom {
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    #[must_use]
    pub fn from_os() -> Self {
        Self(StdRng::from_os_rng())
    }
}

impl Default for SeededRandom {
    fn default() -> Self {
        Self::from_os()
    }
}

impl RandomSource for SeededRandom {
    fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.0.random_range(0..bound)
    }

    fn unit(&mut self) -> f64 {
        self.0.random::<f64>()
    }
}

/// Always returns the same draw. Handy for making throttling decisions
/// deterministic: `unit = 0.0` drops whenever the drop ratio is positive.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    pub unit: f64,
    pub below: u64,
}

impl RandomSource for FixedRandom {
    fn below(&mut self, bound: u64) -> u64 {
        self.below.min(bound.saturating_sub(1))
    }

    fn unit(&mut self) -> f64 {
        self.unit
    }
}

pub(crate) type SharedRandom = parking_lot::Mutex<Box<dyn RandomSource>>;

pub(crate) fn shared(source: impl RandomSource + 'static) -> SharedRandom {
    parking_lot::Mutex::new(Box::new(source))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn seeded_draws_stay_in_range() {
        let mut rng = SeededRandom::from_seed(7);
        for _ in 0..1000 {
            assert!(rng.below(10) < 10);
            let u = rng.unit();
            assert!((0.0..1.0).contains(&u));
        }
        assert_eq!(rng.below(0), 0);
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = SeededRandom::from_seed(42);
        let mut b = SeededRandom::from_seed(42);
        let xs: Vec<u64> = (0..16).map(|_| a.below(1000)).collect();
        let ys: Vec<u64> = (0..16).map(|_| b.below(1000)).collect();
        assert_eq!(xs, ys);
    }
}
