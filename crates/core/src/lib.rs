//! Core DP-SGD primitives.
//!
//! This crate provides the per-step machinery of differentially private
//! training: gradient trees, batches, the per-example loss interface,
//! per-example clipping, Gaussian noise and the gradient computer that
//! composes them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod clipping;
pub mod error;
pub mod gradients;
pub mod loss;
pub mod noise;
pub mod pytree;
pub mod tensor;

pub use batch::{Batch, Example};
pub use clipping::{
    clip_scale, clip_tree, clipped_mean_gradient, ClipReport, ClippedGradients, ClippingConfig,
    PerExampleMethod, CLIPPED_FRACTION_METRIC, GRAD_NORM_METRIC,
};
pub use error::{DpError, Result};
pub use gradients::{DpsgdGradientComputer, StepOutput};
pub use loss::{LossOutput, Metrics, NetworkState, PerExampleLoss};
pub use noise::{
    add_gaussian_noise, add_gaussian_noise_tree, GaussianNoiseInjector, NoiseMechanism,
    NoiseState,
};
pub use pytree::{
    check_same_shape, global_l2_norm, scale, tree_add, zeros_like, GradientTree, PyTree, TreeSpec,
};
pub use tensor::{l2_norm, stack_leading, Scalar, Tensor};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        clip_tree, clipped_mean_gradient, global_l2_norm, Batch, ClippedGradients,
        ClippingConfig, DpError, DpsgdGradientComputer, Example, GaussianNoiseInjector,
        GradientTree, LossOutput, Metrics, NetworkState, NoiseMechanism, NoiseState,
        PerExampleLoss, PerExampleMethod, PyTree, Result, StepOutput, Tensor,
    };
    pub use dpsgd_prng::PrngKey;
}
