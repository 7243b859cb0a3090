//! Serializable configuration for a DP-SGD training run.

use serde::{Deserialize, Serialize};

use dpsgd_accounting::{
    make_batch_size_schedule, validate_delta, AccountantConfig, BatchingScaleSchedule,
    CalibrationConfig, PrivacySpec, Sampler,
};
use dpsgd_core::{ClippingConfig, DpError, PerExampleMethod, Result};

use crate::plan::DpsgdPlan;
use crate::training::VirtualBatching;

/// Everything needed to calibrate and run DP-SGD.
///
/// `batch_size` is the number of examples per noisy update. When
/// `physical_batch_size` is set, each update accumulates
/// `batch_size / physical_batch_size` micro-batches before noise is added.
///
/// With `rescale_to_unit_norm`, clipped gradients are divided by
/// `clipping_norm`, which changes the gradient scale by `1 / clipping_norm`;
/// learning rates are not adjusted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpsgdConfig {
    /// Target epsilon for the whole run.
    pub target_epsilon: f64,
    /// Target delta for the whole run.
    pub target_delta: f64,
    /// Per-example L2 clipping norm.
    pub clipping_norm: f64,
    /// Divide clipped gradients by the clipping norm.
    pub rescale_to_unit_norm: bool,
    /// How per-example gradients are evaluated.
    pub per_example_method: PerExampleMethod,
    /// Examples per noisy update, before any scale schedule.
    pub batch_size: usize,
    /// Number of noisy updates.
    pub num_steps: u64,
    /// Dataset size.
    pub num_samples: usize,
    /// Width of a privacy-loss bin in the accountant.
    pub discretization: f64,
    /// How batches are drawn.
    pub sampler: Sampler,
    /// Fixed noise multiplier; calibrated from the target when absent.
    pub noise_multiplier: Option<f64>,
    /// Seed of the per-step key stream.
    pub noise_seed: u64,
    /// Examples evaluated per micro-batch.
    pub physical_batch_size: Option<usize>,
    /// Batch-size multipliers keyed by the update from which they apply.
    pub batch_size_scale_schedule: BatchingScaleSchedule,
    /// Search parameters for noise calibration.
    pub calibration: CalibrationConfig,
}

impl Default for DpsgdConfig {
    fn default() -> Self {
        Self {
            target_epsilon: 1.0,
            target_delta: 1e-5,
            clipping_norm: 1.0,
            rescale_to_unit_norm: false,
            per_example_method: PerExampleMethod::default(),
            batch_size: 256,
            num_steps: 1_000,
            num_samples: 60_000,
            discretization: dpsgd_accounting::pld::DEFAULT_VALUE_DISCRETIZATION_INTERVAL,
            sampler: Sampler::default(),
            noise_multiplier: None,
            noise_seed: 0,
            physical_batch_size: None,
            batch_size_scale_schedule: BatchingScaleSchedule::new(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl DpsgdConfig {
    /// Parse and validate a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DpError::invalid(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DpError::invalid(format!("config is not serializable: {e}")))
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        if !self.target_epsilon.is_finite() || self.target_epsilon <= 0.0 {
            return Err(DpError::invalid(format!(
                "target_epsilon must be finite and positive, got {}",
                self.target_epsilon
            )));
        }
        validate_delta(self.target_delta)?;
        self.clipping_config()?;
        if self.batch_size == 0 {
            return Err(DpError::invalid("batch_size must be positive"));
        }
        if self.num_steps == 0 {
            return Err(DpError::invalid("num_steps must be at least 1"));
        }
        if self.num_samples == 0 {
            return Err(DpError::invalid("num_samples must be positive"));
        }
        self.accountant_config().validate()?;
        if let Some(nm) = self.noise_multiplier {
            if !nm.is_finite() || nm < 0.0 {
                return Err(DpError::invalid(format!(
                    "noise_multiplier must be finite and non-negative, got {nm}"
                )));
            }
        } else {
            self.calibration.validate()?;
        }
        self.virtual_batching()?;
        self.privacy_spec()?;
        Ok(())
    }

    /// Clipping parameters.
    pub fn clipping_config(&self) -> Result<ClippingConfig> {
        Ok(ClippingConfig::new(self.clipping_norm)?
            .with_rescale_to_unit_norm(self.rescale_to_unit_norm)
            .with_method(self.per_example_method))
    }

    /// PLD accountant parameters.
    pub fn accountant_config(&self) -> AccountantConfig {
        AccountantConfig::new(self.discretization).with_sampler(self.sampler)
    }

    /// Micro-batch layout of each update.
    pub fn virtual_batching(&self) -> Result<VirtualBatching> {
        VirtualBatching::new(
            self.batch_size,
            self.physical_batch_size.unwrap_or(self.batch_size),
            self.batch_size_scale_schedule.clone(),
        )
    }

    /// Privacy target with the batch-size schedule of the run.
    pub fn privacy_spec(&self) -> Result<PrivacySpec> {
        PrivacySpec::new(
            self.target_epsilon,
            self.target_delta,
            self.num_steps,
            self.num_samples,
            self.batch_size,
        )?
        .with_batch_sizes(make_batch_size_schedule(
            self.batch_size,
            &self.batch_size_scale_schedule,
        ))
    }

    /// Calibrate (unless a noise multiplier is fixed) and assemble the plan.
    pub fn build(&self) -> Result<DpsgdPlan> {
        DpsgdPlan::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DpsgdConfig::default().validate().unwrap();
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = DpsgdConfig::from_json(
            r#"{
                "target_epsilon": 2.0,
                "batch_size": 64,
                "physical_batch_size": 16,
                "per_example_method": "sequential",
                "sampler": "fixed",
                "batch_size_scale_schedule": {"100": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(config.target_epsilon, 2.0);
        assert_eq!(config.target_delta, 1e-5);
        assert_eq!(config.per_example_method, PerExampleMethod::Sequential);
        assert_eq!(config.sampler, Sampler::Fixed);
        assert_eq!(config.batch_size_scale_schedule.get(&100), Some(&2));
        let back = DpsgdConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = DpsgdConfig::from_json("{ target_epsilon: }").unwrap_err();
        assert!(matches!(err, DpError::InvalidConfig { .. }));
        let err = DpsgdConfig::from_json(r#"{"batch_size": "many"}"#).unwrap_err();
        assert!(matches!(err, DpError::InvalidConfig { .. }));
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let cases: [fn(&mut DpsgdConfig); 9] = [
            |c| c.clipping_norm = -1.0,
            |c| c.target_delta = 1.5,
            |c| c.target_epsilon = 0.0,
            |c| c.batch_size = 0,
            |c| c.num_steps = 0,
            |c| c.discretization = 0.0,
            |c| {
                c.batch_size = 100;
                c.num_samples = 10;
            },
            |c| c.noise_multiplier = Some(-0.5),
            |c| c.physical_batch_size = Some(100),
        ];
        for mutate in cases {
            let mut config = DpsgdConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(DpError::InvalidConfig { .. })),
                "{config:?}"
            );
        }
    }
}
