use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use rand::Rng as _;

use crate::Error;

/// A validated sample rate in the range (0, 1].
///
/// All sample rates pass through [`SampleRate::new`], so an out-of-range rate is rejected once, before anything is
/// encoded or sent.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct SampleRate(f64);

impl SampleRate {
    /// A sample rate of one, meaning every update is sent.
    pub const ONE: SampleRate = SampleRate(1.0);

    /// Creates a new `SampleRate`.
    ///
    /// # Errors
    ///
    /// If `rate` is not in the range (0, 1], `Error::SamplingRate` is returned.
    pub fn new(rate: f64) -> Result<Self, Error> {
        if rate > 0.0 && rate <= 1.0 {
            Ok(SampleRate(rate))
        } else {
            Err(Error::SamplingRate(rate))
        }
    }

    /// Returns the rate as a float.
    pub fn get(self) -> f64 {
        self.0
    }

    /// Returns `true` if this rate is one.
    pub fn is_unsampled(self) -> bool {
        self.0 >= 1.0
    }

    /// Returns `true` if a uniform `sample` in [0, 1) falls under this rate.
    pub fn admits(self, sample: f64) -> bool {
        sample < self.0
    }
}

/// A source of uniform random samples in the range [0, 1).
///
/// Used to decide whether probabilistic counter updates are sent. Any `Fn() -> f64` closure that is `Send + Sync` can
/// be used as a source.
pub trait SampleSource: Send + Sync {
    /// Draws the next sample.
    fn sample(&self) -> f64;
}

impl<F> SampleSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn sample(&self) -> f64 {
        self()
    }
}

/// Draws samples from the thread-local random number generator.
///
/// This is the default source.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngSource;

impl SampleSource for ThreadRngSource {
    fn sample(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Replays a fixed sequence of samples, starting over once it reaches the end.
///
/// Primarily useful for making probabilistic counting deterministic in tests.
pub struct Sequence {
    values: Vec<f64>,
    next: AtomicUsize,
}

impl Sequence {
    /// Creates a new `Sequence` over `values`.
    ///
    /// # Panics
    ///
    /// Panics if `values` is empty.
    pub fn new<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let values: Vec<f64> = values.into_iter().collect();
        assert!(!values.is_empty(), "sample sequence must not be empty");
        Self { values, next: AtomicUsize::new(0) }
    }
}

impl SampleSource for Sequence {
    fn sample(&self) -> f64 {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.values[idx % self.values.len()]
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence").field("values", &self.values).finish_non_exhaustive()
    }
}
