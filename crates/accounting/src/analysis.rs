//! Training-level accountants built on the PLD accountant.

use std::collections::BTreeMap;

use dpsgd_core::{DpError, Result};

use crate::accountants::AccountantConfig;
use crate::params::PrivacySpec;

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Privacy accounting for a whole training run.
pub trait DpTrainingAccountant {
    /// Epsilon of `spec.num_updates` noisy updates at `spec.target_delta`.
    fn compute_epsilon(&self, noise_multiplier: f64, spec: &PrivacySpec) -> Result<f64>;
}

/// DP-SGD accountant: one subsampled Gaussian per update, with the sampling
/// ratio following the batch-size schedule.
#[derive(Clone, Debug, Default)]
pub struct DpsgdTrainingAccountant {
    config: AccountantConfig,
}

impl DpsgdTrainingAccountant {
    /// Create an accountant with an explicit PLD configuration.
    pub fn new(config: AccountantConfig) -> Self {
        Self { config }
    }

    /// PLD configuration used for every computation.
    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }
}

impl DpTrainingAccountant for DpsgdTrainingAccountant {
    fn compute_epsilon(&self, noise_multiplier: f64, spec: &PrivacySpec) -> Result<f64> {
        spec.validate()?;
        let mut accountant = self.config.create_accountant()?;
        let n = spec.num_samples as f64;
        for (duration, batch_size) in spec.batch_sizes.segments(spec.num_updates) {
            accountant.steps(noise_multiplier, batch_size as f64 / n, duration)?;
        }
        accountant.epsilon(spec.target_delta)
    }
}

/// Epsilons precomputed on a grid of update counts.
///
/// Lookups round the update count up to the next grid point, so cached
/// values over-approximate the exact epsilon.
#[derive(Clone, Debug)]
pub struct CachedExperimentAccountant<A: DpTrainingAccountant> {
    accountant: A,
    noise_multiplier: f64,
    spec: PrivacySpec,
    num_cached_points: u64,
    cache: BTreeMap<u64, f64>,
}

impl<A: DpTrainingAccountant> CachedExperimentAccountant<A> {
    /// Cache `num_cached_points` evenly spaced update counts up to `spec.num_updates`.
    pub fn new(
        accountant: A,
        noise_multiplier: f64,
        spec: PrivacySpec,
        num_cached_points: u64,
    ) -> Result<Self> {
        spec.validate()?;
        if num_cached_points == 0 {
            return Err(DpError::invalid("num_cached_points must be at least 1"));
        }
        Ok(Self {
            accountant,
            noise_multiplier,
            spec,
            num_cached_points,
            cache: BTreeMap::new(),
        })
    }

    /// Largest update count the cache covers.
    pub fn max_num_updates(&self) -> u64 {
        self.spec.num_updates
    }

    /// Epsilon after `num_updates`, exact or from the over-approximating cache.
    pub fn compute_epsilon(&mut self, num_updates: u64, allow_approximate: bool) -> Result<f64> {
        if num_updates == 0 {
            return Ok(0.0);
        }
        let max = self.spec.num_updates;
        if num_updates > max {
            return Err(DpError::invalid(format!(
                "{num_updates} updates exceed the {max} covered by the cache"
            )));
        }
        let point = if allow_approximate {
            let idx = ceil_div(self.num_cached_points * num_updates, max);
            ceil_div(max * idx, self.num_cached_points)
        } else {
            num_updates
        };
        if let Some(eps) = self.cache.get(&point) {
            return Ok(*eps);
        }
        let spec = self.spec.clone().with_num_updates(point);
        let eps = self.accountant.compute_epsilon(self.noise_multiplier, &spec)?;
        if allow_approximate {
            self.cache.insert(point, eps);
        }
        Ok(eps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Schedule;
    use crate::pld::compute_epsilon;

    fn accountant() -> DpsgdTrainingAccountant {
        DpsgdTrainingAccountant::new(AccountantConfig::new(1e-3))
    }

    #[test]
    fn constant_schedule_matches_compute_epsilon() {
        let spec = PrivacySpec::new(1.0, 1e-5, 200, 10_000, 100).unwrap();
        let eps = accountant().compute_epsilon(1.0, &spec).unwrap();
        let direct = compute_epsilon(1.0, 0.01, 200, 1e-5, 1e-3).unwrap();
        assert!((eps - direct).abs() < 1e-9, "{eps} vs {direct}");
    }

    #[test]
    fn larger_later_batches_cost_more() {
        let base = PrivacySpec::new(1.0, 1e-5, 200, 10_000, 100).unwrap();
        let growing = base
            .clone()
            .with_batch_sizes(Schedule::timed(vec![(0, 100), (100, 400)]))
            .unwrap();
        let acc = accountant();
        let constant = acc.compute_epsilon(1.0, &base).unwrap();
        assert!(acc.compute_epsilon(1.0, &growing).unwrap() > constant);
    }

    #[test]
    fn cache_over_approximates() {
        let spec = PrivacySpec::new(1.0, 1e-5, 100, 10_000, 100).unwrap();
        let mut cached = CachedExperimentAccountant::new(accountant(), 1.0, spec, 4).unwrap();
        let exact = cached.compute_epsilon(30, false).unwrap();
        let approx = cached.compute_epsilon(30, true).unwrap();
        assert!(approx >= exact);
        assert_eq!(cached.compute_epsilon(50, true).unwrap(), approx);
        assert_eq!(cached.compute_epsilon(0, true).unwrap(), 0.0);
        assert!(cached.compute_epsilon(101, true).is_err());
    }
}
