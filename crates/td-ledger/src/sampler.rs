//! Parameter samplers.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

use td_types::{Distribution, ParamValue};

/// Picks a value for a parameter the first time a trial suggests it.
pub trait Sampler: Send + Sync + fmt::Debug {
    fn sample(&self, name: &str, distribution: &Distribution) -> ParamValue;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Independent uniform sampling across each distribution.
pub struct RandomSampler {
    rng: Mutex<StdRng>,
    seed: Option<u64>,
}

impl RandomSampler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
            seed: None,
        }
    }

    /// Reproducible sampler; two samplers with the same seed produce the same
    /// sequence of values.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            seed: Some(seed),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RandomSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomSampler")
            .field("seed", &self.seed)
            .finish()
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, _name: &str, distribution: &Distribution) -> ParamValue {
        let mut rng = self.rng.lock();
        match distribution {
            Distribution::Float { low, high } => ParamValue::Float(rng.random_range(*low..=*high)),
            Distribution::LogFloat { low, high } => {
                let log_low = low.ln();
                let log_high = high.ln();
                let log_val: f64 = rng.random_range(log_low..=log_high);
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            Distribution::Int { low, high } => ParamValue::Int(rng.random_range(*low..=*high)),
            Distribution::Categorical { choices } => {
                let idx = rng.random_range(0..choices.len());
                ParamValue::Json(choices[idx].clone())
            }
        }
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_sampler_respects_bounds() {
        let sampler = RandomSampler::new();
        let dists = [
            Distribution::Float { low: 0.5, high: 1.0 },
            Distribution::LogFloat { low: 1e-5, high: 1e-1 },
            Distribution::Int { low: 5, high: 15 },
            Distribution::Categorical {
                choices: vec![serde_json::json!("adam"), serde_json::json!("sgd")],
            },
        ];

        for _ in 0..200 {
            for dist in &dists {
                let value = sampler.sample("p", dist);
                assert!(dist.contains(&value), "{value} outside {dist}");
            }
        }
    }

    #[test]
    fn seeded_samplers_repeat() {
        let dist = Distribution::Float { low: 0.0, high: 1.0 };
        let a = RandomSampler::seeded(42);
        let b = RandomSampler::seeded(42);
        let xs: Vec<_> = (0..5).map(|_| a.sample("x", &dist)).collect();
        let ys: Vec<_> = (0..5).map(|_| b.sample("x", &dist)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn single_point_distributions() {
        let sampler = RandomSampler::seeded(7);
        assert_eq!(
            sampler.sample("n", &Distribution::Int { low: 3, high: 3 }),
            ParamValue::Int(3)
        );
        assert_eq!(
            sampler.sample("f", &Distribution::Float { low: 0.25, high: 0.25 }),
            ParamValue::Float(0.25)
        );
        assert_eq!(sampler.name(), "random");
    }
}
