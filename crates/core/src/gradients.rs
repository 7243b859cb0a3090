//! The DP-SGD gradient computer: per-example clipping followed by Gaussian noise.

use dpsgd_prng::PrngKey;

use crate::batch::Batch;
use crate::clipping::{clipped_mean_gradient, ClippedGradients, ClippingConfig};
use crate::error::Result;
use crate::loss::{Metrics, NetworkState, PerExampleLoss};
use crate::noise::{GaussianNoiseInjector, NoiseMechanism, NoiseState};
use crate::pytree::PyTree;

/// Output of one privatized gradient step.
#[derive(Clone, Debug)]
pub struct StepOutput<P> {
    /// Mean loss over the batch.
    pub loss: f64,
    /// Clipped, averaged and noised gradient.
    pub grad: P,
    /// Network state averaged over examples.
    pub network_state: NetworkState,
    /// Auxiliary metrics from the clipper.
    pub metrics: Metrics,
    /// Per-coordinate stddev of the noise that was added.
    pub noise_stddev: f64,
    /// Noise state to pass to the next step.
    pub noise_state: NoiseState,
}

/// Computes privatized gradients for DP-SGD.
#[derive(Clone, Debug)]
pub struct DpsgdGradientComputer {
    clipping: ClippingConfig,
    injector: GaussianNoiseInjector,
}

impl DpsgdGradientComputer {
    /// Create a computer from a clipping config and a noise multiplier.
    pub fn new(clipping: ClippingConfig, noise_multiplier: f64) -> Result<Self> {
        let injector = GaussianNoiseInjector::new(
            noise_multiplier,
            clipping.clipping_norm(),
            clipping.rescale_to_unit_norm(),
        )?;
        Ok(Self { clipping, injector })
    }

    /// Clipping parameters.
    pub fn clipping_config(&self) -> &ClippingConfig {
        &self.clipping
    }

    /// Noise multiplier used for every step.
    pub fn noise_multiplier(&self) -> f64 {
        self.injector.noise_multiplier()
    }

    /// Noise stddev for a mean over `effective_batch_size` examples.
    pub fn noise_stddev(&self, effective_batch_size: f64) -> Result<f64> {
        self.injector.stddev(effective_batch_size)
    }

    /// Initial noise state.
    pub fn init_noise_state(&self) -> NoiseState {
        NoiseState
    }

    /// Mean loss and mean clipped gradient, without noise.
    pub fn loss_and_clipped_gradients<P, L>(
        &self,
        loss_fn: &L,
        params: &P,
        network_state: &NetworkState,
        batch: &Batch,
        key: PrngKey,
    ) -> Result<ClippedGradients<P>>
    where
        P: PyTree + Send + Sync,
        L: PerExampleLoss<P> + ?Sized,
    {
        clipped_mean_gradient(loss_fn, params, network_state, batch, key, &self.clipping)
    }

    /// Add noise to an already clipped mean gradient.
    pub fn add_noise_to_grads<P: PyTree>(
        &self,
        grads: &P,
        key: PrngKey,
        effective_batch_size: f64,
        state: NoiseState,
    ) -> Result<(P, f64, NoiseState)> {
        self.injector.add_noise(grads, key, effective_batch_size, state)
    }

    /// One full step: clip per example, average, add noise.
    ///
    /// `key` is split into independent keys for per-example randomness and
    /// for noise. Calling this twice with the same key reuses noise and voids
    /// the privacy guarantee.
    pub fn step<P, L>(
        &self,
        loss_fn: &L,
        params: &P,
        network_state: &NetworkState,
        batch: &Batch,
        key: PrngKey,
        noise_state: NoiseState,
    ) -> Result<StepOutput<P>>
    where
        P: PyTree + Send + Sync,
        L: PerExampleLoss<P> + ?Sized,
    {
        let (example_key, noise_key) = key.split2();
        let clipped =
            self.loss_and_clipped_gradients(loss_fn, params, network_state, batch, example_key)?;
        let (grad, noise_stddev, noise_state) = self.add_noise_to_grads(
            &clipped.grad,
            noise_key,
            clipped.batch_size as f64,
            noise_state,
        )?;
        Ok(StepOutput {
            loss: clipped.loss,
            grad,
            network_state: clipped.network_state,
            metrics: clipped.metrics,
            noise_stddev,
            noise_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Example;
    use crate::error::DpError;
    use crate::loss::LossOutput;
    use crate::pytree::GradientTree;
    use ndarray::{array, Array1, Array2};

    fn params() -> GradientTree {
        let mut p = GradientTree::new();
        p.insert("w".to_string(), Array1::zeros(3).into_dyn());
        p
    }

    fn identity_grad(
        _p: &GradientTree,
        s: &NetworkState,
        _k: PrngKey,
        ex: &Example,
    ) -> Result<LossOutput<GradientTree>> {
        let mut grad = GradientTree::new();
        grad.insert("w".to_string(), ex.require("x")?.clone());
        Ok(LossOutput {
            loss: 1.0,
            grad,
            network_state: s.clone(),
            metrics: Metrics::default(),
        })
    }

    fn batch(n: usize) -> Batch {
        let x = Array2::from_shape_fn((n, 3), |(i, j)| (i + j) as f64 * 0.1);
        Batch::from_fields([("x", x.into_dyn())]).unwrap()
    }

    #[test]
    fn zero_noise_step_equals_clipped_mean() {
        let computer = DpsgdGradientComputer::new(ClippingConfig::new(0.5).unwrap(), 0.0).unwrap();
        let key = PrngKey::new(3);
        let out = computer
            .step(&identity_grad, &params(), &NetworkState::new(), &batch(6), key, NoiseState)
            .unwrap();
        let clipped = computer
            .loss_and_clipped_gradients(
                &identity_grad,
                &params(),
                &NetworkState::new(),
                &batch(6),
                key,
            )
            .unwrap();
        assert_eq!(out.grad, clipped.grad);
        assert_eq!(out.noise_stddev, 0.0);
        assert_eq!(out.loss, 1.0);
    }

    #[test]
    fn step_is_deterministic_in_key() {
        let computer = DpsgdGradientComputer::new(ClippingConfig::new(1.0).unwrap(), 1.1).unwrap();
        let run = |seed| {
            computer
                .step(
                    &identity_grad,
                    &params(),
                    &NetworkState::new(),
                    &batch(4),
                    PrngKey::new(seed),
                    NoiseState,
                )
                .unwrap()
        };
        assert_eq!(run(5).grad, run(5).grad);
        assert_ne!(run(5).grad, run(6).grad);
        assert!((run(5).noise_stddev - 1.1 / 4.0).abs() < 1e-15);
    }

    #[test]
    fn noise_uses_batch_size_as_denominator() {
        let computer = DpsgdGradientComputer::new(
            ClippingConfig::new(2.0).unwrap().with_rescale_to_unit_norm(true),
            3.0,
        )
        .unwrap();
        let out = computer
            .step(
                &identity_grad,
                &params(),
                &NetworkState::new(),
                &batch(12),
                PrngKey::new(0),
                NoiseState,
            )
            .unwrap();
        assert!((out.noise_stddev - 3.0 / 12.0).abs() < 1e-15);
        assert_eq!(computer.noise_stddev(12.0).unwrap(), out.noise_stddev);
    }

    #[test]
    fn construction_validates_noise_multiplier() {
        let err = DpsgdGradientComputer::new(ClippingConfig::new(1.0).unwrap(), -1.0).unwrap_err();
        assert!(matches!(err, DpError::InvalidConfig { .. }));
    }

    #[test]
    fn add_noise_to_grads_preserves_structure() {
        let computer = DpsgdGradientComputer::new(ClippingConfig::new(1.0).unwrap(), 1.0).unwrap();
        let mut grads = GradientTree::new();
        grads.insert("a".to_string(), array![[1.0, 2.0]].into_dyn());
        grads.insert("b".to_string(), array![3.0].into_dyn());
        let (noisy, _, _) = computer
            .add_noise_to_grads(&grads, PrngKey::new(1), 10.0, computer.init_noise_state())
            .unwrap();
        assert_eq!(noisy["a"].shape(), &[1, 2]);
        assert_eq!(noisy["b"].shape(), &[1]);
    }
}
