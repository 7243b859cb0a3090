//! Gaussian noise for privatizing clipped gradients.

use dpsgd_prng::PrngKey;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{DpError, Result};
use crate::pytree::PyTree;
use crate::tensor::Tensor;

/// Add N(0, sigma^2) noise to every entry of a tensor in-place.
///
/// A zero `sigma` leaves the tensor untouched.
pub fn add_gaussian_noise<R: Rng>(tensor: &mut Tensor, sigma: f64, rng: &mut R) -> Result<()> {
    if sigma == 0.0 || tensor.is_empty() {
        return Ok(());
    }
    let dist = Normal::new(0.0, sigma)
        .map_err(|e| DpError::invalid(format!("invalid noise stddev {sigma}: {e}")))?;
    tensor.mapv_inplace(|x| x + dist.sample(rng));
    Ok(())
}

/// Add i.i.d. Gaussian noise across every leaf of a tree.
pub fn add_gaussian_noise_tree<R: Rng, T: PyTree>(tree: &T, sigma: f64, rng: &mut R) -> Result<T> {
    let (leaves, spec) = tree.flatten();
    let noisy = leaves
        .into_iter()
        .map(|mut leaf| add_gaussian_noise(&mut leaf, sigma, rng).map(|()| leaf))
        .collect::<Result<Vec<_>>>()?;
    T::unflatten(&spec, noisy)
}

/// State threaded through a noise mechanism between steps.
///
/// The Gaussian mechanism is stateless; the value exists so that stateful
/// mechanisms (correlated noise, for instance) fit the same interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoiseState;

/// Privatizes an aggregated gradient.
pub trait NoiseMechanism<T: PyTree> {
    /// State carried across steps.
    type State;

    /// Initial state for a fresh run.
    fn init_state(&self) -> Self::State;

    /// Add noise for a mean over `effective_batch_size` examples.
    ///
    /// Returns the noisy tree, the per-coordinate noise stddev and the new
    /// state. `key` must never be reused for another call.
    fn add_noise(
        &self,
        grads: &T,
        key: PrngKey,
        effective_batch_size: f64,
        state: Self::State,
    ) -> Result<(T, f64, Self::State)>;
}

/// Gaussian noise calibrated to the clipping norm and batch size.
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianNoiseInjector {
    noise_multiplier: f64,
    clipping_norm: f64,
    rescale_to_unit_norm: bool,
}

impl GaussianNoiseInjector {
    /// Create an injector; `noise_multiplier` must be finite and non-negative.
    pub fn new(
        noise_multiplier: f64,
        clipping_norm: f64,
        rescale_to_unit_norm: bool,
    ) -> Result<Self> {
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid(format!(
                "noise_multiplier must be finite and non-negative, got {noise_multiplier}"
            )));
        }
        if !clipping_norm.is_finite() || clipping_norm <= 0.0 {
            return Err(DpError::invalid(format!(
                "clipping_norm must be finite and positive, got {clipping_norm}"
            )));
        }
        if noise_multiplier == 0.0 {
            tracing::warn!("noise_multiplier is 0; gradients will not be privatized");
        }
        Ok(Self {
            noise_multiplier,
            clipping_norm,
            rescale_to_unit_norm,
        })
    }

    /// Noise multiplier (stddev relative to sensitivity).
    pub fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }

    /// Per-coordinate stddev for a mean over `effective_batch_size` examples.
    pub fn stddev(&self, effective_batch_size: f64) -> Result<f64> {
        if !effective_batch_size.is_finite() || effective_batch_size <= 0.0 {
            return Err(DpError::invalid(format!(
                "effective_batch_size must be finite and positive, got {effective_batch_size}"
            )));
        }
        let sensitivity = if self.rescale_to_unit_norm {
            1.0
        } else {
            self.clipping_norm
        };
        Ok(self.noise_multiplier * sensitivity / effective_batch_size)
    }
}

impl<T: PyTree> NoiseMechanism<T> for GaussianNoiseInjector {
    type State = NoiseState;

    fn init_state(&self) -> Self::State {
        NoiseState
    }

    fn add_noise(
        &self,
        grads: &T,
        key: PrngKey,
        effective_batch_size: f64,
        state: Self::State,
    ) -> Result<(T, f64, Self::State)> {
        let stddev = self.stddev(effective_batch_size)?;
        let mut rng = key.to_rng();
        let noisy = add_gaussian_noise_tree(grads, stddev, &mut rng)?;
        Ok((noisy, stddev, state))
    }
}
