//! Calibrated DP-SGD training.
//!
//! [`DpsgdConfig`] describes a run; [`DpsgdConfig::build`] calibrates the
//! noise multiplier against the `(epsilon, delta)` target and returns a
//! [`DpsgdPlan`], which produces one noisy gradient per update.
//! [`DpsgdTrainer`] drives a plan over micro-batches supplied by the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod plan;
pub mod training;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dpsgd_accounting as accounting;
pub use dpsgd_core as core;
pub use dpsgd_prng as prng;

pub use accounting::{
    calibrate_batch_size, calibrate_noise_multiplier, calibrate_num_updates, compute_epsilon,
    AccountantConfig, BatchingScaleSchedule, CalibrationConfig, DpTrainingAccountant,
    DpsgdTrainingAccountant, NoiseCalibrator, PldAccountant, PrivacySpec, Sampler, Schedule,
};
pub use config::DpsgdConfig;
pub use plan::DpsgdPlan;
pub use prng::PrngKey;
pub use training::{DpsgdTrainer, GradientAccumulator, TrainingSummary, VirtualBatching};

/// Common imports for DP-SGD training.
pub mod prelude {
    pub use crate::config::DpsgdConfig;
    pub use crate::plan::DpsgdPlan;
    pub use crate::training::{
        DpsgdTrainer, GradientAccumulator, TrainingSummary, VirtualBatching,
    };
    pub use dpsgd_accounting::prelude::*;
    pub use dpsgd_core::prelude::*;
}
