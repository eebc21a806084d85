//! Deterministic sample generation.
//!
//! PCG streams partitioned from one master seed, so a batch of samples is
//! bitwise identical across runs and independent of how the batch is split
//! between workers.

use rand::prelude::*;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use super::Sample;

/// Stream offset multiplier (golden ratio), keeps partition seeds apart.
const STREAM_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Marginal law of one random input component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SampleDistribution {
    /// Uniform on `[low, high)`.
    Uniform {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
    },
    /// Gaussian with the given mean and standard deviation.
    Normal {
        /// Mean.
        mean: f64,
        /// Standard deviation.
        std: f64,
    },
}

impl Default for SampleDistribution {
    fn default() -> Self {
        Self::Normal {
            mean: 0.0,
            std: 1.0,
        }
    }
}

/// Reproducible random number generator for sample draws.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRng {
    master_seed: u64,
    stream: u64,
    rng: Pcg64,
}

impl SampleRng {
    /// Create a generator from a master seed.
    #[must_use]
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            stream: 0,
            rng: Pcg64::seed_from_u64(master_seed),
        }
    }

    /// Master seed.
    #[must_use]
    pub const fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Next unused stream index.
    #[must_use]
    pub const fn stream(&self) -> u64 {
        self.stream
    }

    /// Split off `n` independent generators.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mlmc_wrapper::engine::rng::SampleRng;
    ///
    /// let mut rng = SampleRng::new(42);
    /// let streams = rng.partition(4);
    /// assert_eq!(streams.len(), 4);
    /// assert_eq!(rng.stream(), 4);
    /// ```
    #[must_use]
    pub fn partition(&mut self, n: usize) -> Vec<Self> {
        let partitions = (0..n)
            .map(|i| {
                let stream = self.stream + i as u64;
                let seed = self
                    .master_seed
                    .wrapping_add(stream.wrapping_mul(STREAM_STRIDE));
                Self {
                    master_seed: self.master_seed,
                    stream,
                    rng: Pcg64::seed_from_u64(seed),
                }
            })
            .collect();

        self.stream += n as u64;
        partitions
    }

    /// Uniform f64 in `[0, 1)`.
    pub fn gen_f64(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Standard normal via Box-Muller.
    pub fn gen_standard_normal(&mut self) -> f64 {
        let u1 = self.gen_f64().max(f64::EPSILON);
        let u2 = self.gen_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Draw one component from `dist`.
    pub fn draw_component(&mut self, dist: &SampleDistribution) -> f64 {
        match *dist {
            SampleDistribution::Uniform { low, high } => low + (high - low) * self.gen_f64(),
            SampleDistribution::Normal { mean, std } => mean + std * self.gen_standard_normal(),
        }
    }

    /// Draw one sample with one component per distribution.
    pub fn draw(&mut self, distributions: &[SampleDistribution]) -> Sample {
        Sample::new(distributions.iter().map(|d| self.draw_component(d)).collect())
    }

    /// Draw `n` samples.
    pub fn draw_n(&mut self, n: usize, distributions: &[SampleDistribution]) -> Vec<Sample> {
        (0..n).map(|_| self.draw(distributions)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reproducibility() {
        let dists = [SampleDistribution::default(); 3];
        let a = SampleRng::new(42).draw_n(10, &dists);
        let b = SampleRng::new(42).draw_n(10, &dists);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seeds() {
        let dists = [SampleDistribution::default()];
        let a = SampleRng::new(42).draw_n(10, &dists);
        let b = SampleRng::new(43).draw_n(10, &dists);
        assert_ne!(a, b);
    }

    #[test]
    fn test_partition_independence() {
        let mut rng = SampleRng::new(7);
        let mut parts = rng.partition(3);
        let seqs: Vec<Vec<f64>> = parts
            .iter_mut()
            .map(|p| (0..8).map(|_| p.gen_f64()).collect())
            .collect();
        assert_ne!(seqs[0], seqs[1]);
        assert_ne!(seqs[1], seqs[2]);
        assert_eq!(rng.stream(), 3);
        assert_eq!(rng.master_seed(), 7);
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rng = SampleRng::new(1);
        let dist = SampleDistribution::Uniform {
            low: -2.0,
            high: 3.0,
        };
        for _ in 0..1000 {
            let v = rng.draw_component(&dist);
            assert!((-2.0..3.0).contains(&v), "value {v} out of range");
        }
    }

    #[test]
    fn test_normal_moments() {
        let mut rng = SampleRng::new(42);
        let dist = SampleDistribution::Normal {
            mean: 5.0,
            std: 2.0,
        };
        let n = 20_000;
        let xs: Vec<f64> = (0..n).map(|_| rng.draw_component(&dist)).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - 5.0).abs() < 0.1, "mean {mean}");
        assert!((var - 4.0).abs() < 0.3, "variance {var}");
    }

    #[test]
    fn test_distribution_yaml() {
        let yaml = "type: uniform\nlow: 0.0\nhigh: 2.0\n";
        let dist: SampleDistribution = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(dist, SampleDistribution::Uniform { low: 0.0, high: 2.0 });
    }

    proptest! {
        /// Standard normal draws stay finite for any seed.
        #[test]
        fn prop_normal_finite(seed in 0u64..u64::MAX) {
            let mut rng = SampleRng::new(seed);
            for _ in 0..100 {
                prop_assert!(rng.gen_standard_normal().is_finite());
            }
        }

        /// Sample length follows the distribution list.
        #[test]
        fn prop_sample_len(seed in 0u64..1000, n in 0usize..16) {
            let dists = vec![SampleDistribution::default(); n];
            let sample = SampleRng::new(seed).draw(&dists);
            prop_assert_eq!(sample.len(), n);
        }
    }
}
