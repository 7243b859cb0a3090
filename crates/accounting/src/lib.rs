//! Privacy accounting and noise calibration for DP-SGD.
//!
//! The accountant tracks the privacy loss distribution (PLD) of the
//! Poisson-subsampled Gaussian mechanism under composition; the calibrators
//! invert it to find noise multipliers, step counts and batch sizes meeting
//! an `(epsilon, delta)` target.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountants;
pub mod analysis;
pub mod calibrate;
pub mod params;
pub mod pld;

pub use accountants::AccountantConfig;
pub use analysis::{CachedExperimentAccountant, DpTrainingAccountant, DpsgdTrainingAccountant};
pub use calibrate::{
    calibrate_batch_size, calibrate_noise_multiplier, calibrate_num_updates, CalibrationConfig,
    NoiseCalibrator,
};
pub use params::{
    make_batch_size_schedule, validate_delta, BatchingScaleSchedule, PrivacySpec, Sampler,
    Schedule,
};
pub use pld::{compute_epsilon, PldAccountant, MAX_PMF_BINS};

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        calibrate_batch_size, calibrate_noise_multiplier, calibrate_num_updates, compute_epsilon,
        AccountantConfig, CachedExperimentAccountant, CalibrationConfig, DpTrainingAccountant,
        DpsgdTrainingAccountant, NoiseCalibrator, PldAccountant, PrivacySpec, Sampler, Schedule,
    };
}
