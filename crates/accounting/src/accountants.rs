//! Accountant configuration.

use dpsgd_core::{DpError, Result};
use serde::{Deserialize, Serialize};

use crate::params::Sampler;
use crate::pld::{
    PldAccountant, DEFAULT_LOG_MASS_TRUNCATION_BOUND, DEFAULT_TAIL_MASS_TRUNCATION,
    DEFAULT_VALUE_DISCRETIZATION_INTERVAL,
};

/// Parameters of the PLD accountant for the subsampled Gaussian mechanism.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountantConfig {
    /// How batches are sampled.
    pub sampler: Sampler,
    /// Width of a privacy-loss bin. Finer is tighter but slower.
    pub value_discretization_interval: f64,
    /// Mass dropped (pessimistically) from the tails after each composition.
    pub tail_mass_truncation: f64,
    /// Log of the mass left outside the support of a single-step distribution.
    pub log_mass_truncation_bound: f64,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            sampler: Sampler::Poisson,
            value_discretization_interval: DEFAULT_VALUE_DISCRETIZATION_INTERVAL,
            tail_mass_truncation: DEFAULT_TAIL_MASS_TRUNCATION,
            log_mass_truncation_bound: DEFAULT_LOG_MASS_TRUNCATION_BOUND,
        }
    }
}

impl AccountantConfig {
    /// Default config with an explicit discretization interval.
    pub fn new(value_discretization_interval: f64) -> Self {
        Self {
            value_discretization_interval,
            ..Self::default()
        }
    }

    /// Set the sampling scheme.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Set the tail mass truncation.
    pub fn with_tail_mass_truncation(mut self, tail_mass_truncation: f64) -> Self {
        self.tail_mass_truncation = tail_mass_truncation;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        let d = self.value_discretization_interval;
        if !d.is_finite() || d <= 0.0 {
            return Err(DpError::invalid(format!(
                "discretization must be finite and positive, got {d}"
            )));
        }
        let t = self.tail_mass_truncation;
        if !t.is_finite() || !(0.0..1e-3).contains(&t) {
            return Err(DpError::invalid(format!(
                "tail_mass_truncation must be in [0, 1e-3), got {t}"
            )));
        }
        let b = self.log_mass_truncation_bound;
        if !b.is_finite() || b >= 0.0 {
            return Err(DpError::invalid(format!(
                "log_mass_truncation_bound must be negative, got {b}"
            )));
        }
        Ok(())
    }

    /// A fresh accountant with this configuration.
    pub fn create_accountant(&self) -> Result<PldAccountant> {
        PldAccountant::new(*self)
    }
}
