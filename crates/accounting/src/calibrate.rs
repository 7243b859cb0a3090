//! Calibration of DP-SGD hyper-parameters against a privacy target.
//!
//! Every search relies on epsilon being monotone in the searched quantity:
//! non-increasing in the noise multiplier, non-decreasing in the number of
//! updates and in the batch size.

use dpsgd_core::{DpError, Result};
use serde::{Deserialize, Serialize};

use crate::accountants::AccountantConfig;
use crate::analysis::{DpTrainingAccountant, DpsgdTrainingAccountant};
use crate::params::{PrivacySpec, Schedule};

/// Largest number of updates `calibrate_num_updates` will consider.
const MAX_CALIBRATED_UPDATES: u64 = u32::MAX as u64;

/// Search parameters for noise calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// First noise multiplier probed.
    pub initial_noise: f64,
    /// Lower end of the search range.
    pub min_noise: f64,
    /// Upper end of the search range.
    pub max_noise: f64,
    /// Bisection stops once `hi - lo <= rel_tol * hi`.
    pub rel_tol: f64,
    /// Maximum number of bisection probes.
    pub max_iters: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            initial_noise: 1.0,
            min_noise: 1e-2,
            max_noise: 1e3,
            rel_tol: 1e-3,
            max_iters: 64,
        }
    }
}

impl CalibrationConfig {
    /// Set the search range.
    pub fn with_range(mut self, min_noise: f64, max_noise: f64) -> Self {
        self.min_noise = min_noise;
        self.max_noise = max_noise;
        self
    }

    /// Set the relative tolerance.
    pub fn with_rel_tol(mut self, rel_tol: f64) -> Self {
        self.rel_tol = rel_tol;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_noise.is_finite() && self.min_noise > 0.0) {
            return Err(DpError::invalid(format!(
                "min_noise must be finite and positive, got {}",
                self.min_noise
            )));
        }
        if !(self.max_noise.is_finite() && self.max_noise >= self.min_noise) {
            return Err(DpError::invalid(format!(
                "max_noise must be finite and at least min_noise, got {}",
                self.max_noise
            )));
        }
        if !(self.initial_noise.is_finite() && self.initial_noise > 0.0) {
            return Err(DpError::invalid(format!(
                "initial_noise must be finite and positive, got {}",
                self.initial_noise
            )));
        }
        if !(self.rel_tol > 0.0 && self.rel_tol < 1.0) {
            return Err(DpError::invalid(format!(
                "rel_tol must be in (0, 1), got {}",
                self.rel_tol
            )));
        }
        if self.max_iters == 0 {
            return Err(DpError::invalid("max_iters must be at least 1"));
        }
        Ok(())
    }
}

/// Epsilon of one probe; a distribution too large to represent counts as infeasible.
fn probe_epsilon<A: DpTrainingAccountant + ?Sized>(
    accountant: &A,
    noise_multiplier: f64,
    spec: &PrivacySpec,
) -> Result<f64> {
    let eps = match accountant.compute_epsilon(noise_multiplier, spec) {
        Ok(eps) => eps,
        Err(DpError::NumericOverflow { msg }) => {
            tracing::debug!(noise_multiplier, %msg, "probe overflowed; treating as infeasible");
            f64::INFINITY
        }
        Err(e) => return Err(e),
    };
    tracing::debug!(
        noise_multiplier,
        num_updates = spec.num_updates,
        epsilon = eps,
        "calibration probe"
    );
    Ok(eps)
}

/// Smallest noise multiplier (within `config.rel_tol`) meeting `spec.target_epsilon`.
///
/// The returned multiplier always satisfies the target. Fails with
/// [`DpError::CalibrationFailed`] when even `config.max_noise` does not.
pub fn calibrate_noise_multiplier<A: DpTrainingAccountant + ?Sized>(
    accountant: &A,
    spec: &PrivacySpec,
    config: &CalibrationConfig,
) -> Result<f64> {
    spec.validate()?;
    config.validate()?;
    let target = spec.target_epsilon;
    let satisfies =
        |nm: f64| -> Result<bool> { Ok(probe_epsilon(accountant, nm, spec)? <= target) };

    let start = config.initial_noise.clamp(config.min_noise, config.max_noise);
    let (mut lo, mut hi);
    if satisfies(start)? {
        hi = start;
        loop {
            if hi <= config.min_noise {
                return Ok(config.min_noise);
            }
            let candidate = (0.5 * hi).max(config.min_noise);
            if satisfies(candidate)? {
                hi = candidate;
            } else {
                lo = candidate;
                break;
            }
        }
    } else {
        lo = start;
        loop {
            if lo >= config.max_noise {
                return Err(DpError::calibration(format!(
                    "no noise multiplier up to {} reaches epsilon {target} at delta {} \
                     ({} updates, {} samples)",
                    config.max_noise, spec.target_delta, spec.num_updates, spec.num_samples
                )));
            }
            let candidate = (2.0 * lo).min(config.max_noise);
            if satisfies(candidate)? {
                hi = candidate;
                break;
            }
            lo = candidate;
        }
    }

    let mut iters = 0;
    while hi - lo > config.rel_tol * hi && iters < config.max_iters {
        let mid = 0.5 * (lo + hi);
        if satisfies(mid)? {
            hi = mid;
        } else {
            lo = mid;
        }
        iters += 1;
    }
    tracing::debug!(noise_multiplier = hi, iters, "calibrated noise multiplier");
    Ok(hi)
}

/// Largest number of updates whose epsilon stays within `spec.target_epsilon`.
pub fn calibrate_num_updates<A: DpTrainingAccountant + ?Sized>(
    accountant: &A,
    noise_multiplier: f64,
    spec: &PrivacySpec,
) -> Result<u64> {
    spec.validate()?;
    let target = spec.target_epsilon;
    let satisfies = |num_updates: u64| -> Result<bool> {
        let probe = spec.clone().with_num_updates(num_updates);
        Ok(probe_epsilon(accountant, noise_multiplier, &probe)? <= target)
    };

    if !satisfies(1)? {
        return Err(DpError::calibration(format!(
            "a single update already exceeds epsilon {target} \
             with noise multiplier {noise_multiplier}"
        )));
    }
    let mut lo = 1;
    let mut hi = spec.num_updates.clamp(2, MAX_CALIBRATED_UPDATES);
    while satisfies(hi)? {
        lo = hi;
        if hi >= MAX_CALIBRATED_UPDATES {
            return Ok(hi);
        }
        hi = hi.saturating_mul(2).min(MAX_CALIBRATED_UPDATES);
    }
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if satisfies(mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Largest constant batch size whose epsilon stays within `spec.target_epsilon`.
pub fn calibrate_batch_size<A: DpTrainingAccountant + ?Sized>(
    accountant: &A,
    noise_multiplier: f64,
    spec: &PrivacySpec,
) -> Result<usize> {
    spec.validate()?;
    let target = spec.target_epsilon;
    let n = spec.num_samples;
    let satisfies = |batch_size: usize| -> Result<bool> {
        let probe = spec
            .clone()
            .with_batch_sizes(Schedule::constant(batch_size))?;
        Ok(probe_epsilon(accountant, noise_multiplier, &probe)? <= target)
    };

    if !satisfies(1)? {
        return Err(DpError::calibration(format!(
            "batch size 1 already exceeds epsilon {target} with noise multiplier {noise_multiplier}"
        )));
    }
    let mut lo = 1;
    let mut hi = 2.min(n);
    loop {
        if hi == lo {
            return Ok(lo);
        }
        if !satisfies(hi)? {
            break;
        }
        lo = hi;
        hi = hi.saturating_mul(2).min(n);
    }
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if satisfies(mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Noise calibration for DP-SGD with the PLD accountant.
#[derive(Clone, Debug, Default)]
pub struct NoiseCalibrator {
    accountant: DpsgdTrainingAccountant,
    config: CalibrationConfig,
}

impl NoiseCalibrator {
    /// Create a calibrator.
    pub fn new(accountant_config: AccountantConfig, config: CalibrationConfig) -> Self {
        Self {
            accountant: DpsgdTrainingAccountant::new(accountant_config),
            config,
        }
    }

    /// Accountant used for every probe.
    pub fn accountant(&self) -> &DpsgdTrainingAccountant {
        &self.accountant
    }

    /// Search parameters.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Smallest noise multiplier meeting `(target_epsilon, target_delta)`.
    pub fn calibrate(
        &self,
        target_epsilon: f64,
        target_delta: f64,
        batch_sizes: Schedule<usize>,
        num_samples: usize,
        num_steps: u64,
    ) -> Result<f64> {
        let spec = PrivacySpec::new(target_epsilon, target_delta, num_steps, num_samples, 1)?
            .with_batch_sizes(batch_sizes)?;
        calibrate_noise_multiplier(&self.accountant, &spec, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pld::{compute_epsilon, DEFAULT_VALUE_DISCRETIZATION_INTERVAL};
    use proptest::prelude::*;

    fn accountant() -> DpsgdTrainingAccountant {
        DpsgdTrainingAccountant::new(AccountantConfig::new(1e-3))
    }

    #[test]
    fn calibrated_noise_meets_target_tightly() {
        let spec = PrivacySpec::new(2.0, 1e-5, 100, 10_000, 100).unwrap();
        let config = CalibrationConfig::default();
        let nm = calibrate_noise_multiplier(&accountant(), &spec, &config).unwrap();
        let eps = accountant().compute_epsilon(nm, &spec).unwrap();
        assert!(eps <= 2.0, "eps {eps} at nm {nm}");
        let smaller = nm * (1.0 - 5.0 * config.rel_tol);
        assert!(accountant().compute_epsilon(smaller, &spec).unwrap() > 2.0);
    }

    #[test]
    fn scenario_mnist_sized_run_meets_target() {
        let calibrator = NoiseCalibrator::default();
        let d = calibrator.accountant().config().value_discretization_interval;
        assert_eq!(d, DEFAULT_VALUE_DISCRETIZATION_INTERVAL);
        let nm = calibrator
            .calibrate(1.0, 1e-5, Schedule::constant(256), 60_000, 5_000)
            .unwrap();
        let eps = compute_epsilon(nm, 256.0 / 60_000.0, 5_000, 1e-5, d).unwrap();
        assert!(eps <= 1.0, "eps {eps} at nm {nm}");
        assert!(nm > 0.5 && nm < 2.0, "nm {nm}");
        let smaller = nm * (1.0 - 5.0 * calibrator.config().rel_tol);
        assert!(compute_epsilon(smaller, 256.0 / 60_000.0, 5_000, 1e-5, d).unwrap() > 1.0);
    }

    #[test]
    fn infeasible_target_fails() {
        let spec = PrivacySpec::new(1e-3, 1e-5, 1_000, 100, 100).unwrap();
        let err = calibrate_noise_multiplier(&accountant(), &spec, &CalibrationConfig::default())
            .unwrap_err();
        assert!(matches!(err, DpError::CalibrationFailed { .. }));
    }

    #[test]
    fn loose_target_returns_lower_bound() {
        let spec = PrivacySpec::new(1e4, 0.5, 1, 1_000_000, 1).unwrap();
        let config = CalibrationConfig::default().with_range(0.5, 10.0);
        let nm = calibrate_noise_multiplier(&accountant(), &spec, &config).unwrap();
        assert_eq!(nm, 0.5);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let calibrator = NoiseCalibrator::default();
        let err = calibrator
            .calibrate(0.0, 1e-5, Schedule::constant(10), 100, 10)
            .unwrap_err();
        assert!(matches!(err, DpError::InvalidConfig { .. }));
        let err = calibrator
            .calibrate(1.0, 1.5, Schedule::constant(10), 100, 10)
            .unwrap_err();
        assert!(matches!(err, DpError::InvalidConfig { .. }));
        let spec = PrivacySpec::new(1.0, 1e-5, 10, 100, 10).unwrap();
        let bad = CalibrationConfig::default().with_rel_tol(0.0);
        assert!(calibrate_noise_multiplier(&accountant(), &spec, &bad).is_err());
    }

    #[test]
    fn num_updates_is_the_largest_feasible() {
        let spec = PrivacySpec::new(1.0, 1e-5, 50, 10_000, 100).unwrap();
        let acc = accountant();
        let t = calibrate_num_updates(&acc, 1.0, &spec).unwrap();
        let at = |n| acc.compute_epsilon(1.0, &spec.clone().with_num_updates(n)).unwrap();
        assert!(at(t) <= 1.0);
        assert!(at(t + 1) > 1.0);
    }

    #[test]
    fn num_updates_fails_when_one_step_is_too_much() {
        let spec = PrivacySpec::new(0.01, 1e-5, 10, 100, 100).unwrap();
        let err = calibrate_num_updates(&accountant(), 0.5, &spec).unwrap_err();
        assert!(matches!(err, DpError::CalibrationFailed { .. }));
    }

    #[test]
    fn batch_size_is_the_largest_feasible() {
        let spec = PrivacySpec::new(1.0, 1e-5, 100, 10_000, 100).unwrap();
        let acc = accountant();
        let b = calibrate_batch_size(&acc, 1.0, &spec).unwrap();
        let at = |bs| {
            let s = spec.clone().with_batch_sizes(Schedule::constant(bs)).unwrap();
            acc.compute_epsilon(1.0, &s).unwrap()
        };
        assert!(b >= 1 && b < 10_000);
        assert!(at(b) <= 1.0);
        assert!(at(b + 1) > 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]

        #[test]
        fn calibration_always_meets_target(
            target in 0.5f64..8.0,
            steps in 1u64..200,
            batch in 10usize..500,
        ) {
            let spec = PrivacySpec::new(target, 1e-5, steps, 10_000, batch).unwrap();
            let acc = accountant();
            let config = CalibrationConfig::default();
            let nm = calibrate_noise_multiplier(&acc, &spec, &config).unwrap();
            prop_assert!(acc.compute_epsilon(nm, &spec).unwrap() <= target);
        }
    }
}
