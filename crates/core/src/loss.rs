//! Interface to the model: a per-example loss that also returns its gradient.

use std::collections::BTreeMap;

use dpsgd_prng::PrngKey;

use crate::batch::Example;
use crate::error::Result;
use crate::tensor::Tensor;

/// Mutable non-trainable model state (batch-norm statistics and the like).
pub type NetworkState = BTreeMap<String, Tensor>;

/// Auxiliary values reported by the loss for one example.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metrics {
    /// Scalar metrics; averaged across the batch.
    pub scalars: BTreeMap<String, f64>,
    /// Array metrics; stacked across the batch along a new leading axis.
    pub per_example: BTreeMap<String, Tensor>,
}

impl Metrics {
    /// Record a scalar metric.
    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    /// Record an array metric.
    pub fn with_array(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.per_example.insert(name.into(), value);
        self
    }
}

/// What the loss returns for a single example.
#[derive(Clone, Debug)]
pub struct LossOutput<P> {
    /// Scalar loss value.
    pub loss: f64,
    /// Gradient of `loss` with respect to the parameters.
    pub grad: P,
    /// Updated network state.
    pub network_state: NetworkState,
    /// Auxiliary metrics.
    pub metrics: Metrics,
}

/// A loss evaluated on one example at a time.
///
/// `key` is the per-example randomness (dropout masks and similar); the same
/// key is passed for the same example index regardless of clipping strategy.
pub trait PerExampleLoss<P>: Sync {
    /// Loss and parameter gradient for a single example.
    fn loss_and_grad(
        &self,
        params: &P,
        network_state: &NetworkState,
        key: PrngKey,
        example: &Example,
    ) -> Result<LossOutput<P>>;
}

impl<P, F> PerExampleLoss<P> for F
where
    F: Fn(&P, &NetworkState, PrngKey, &Example) -> Result<LossOutput<P>> + Sync,
{
    fn loss_and_grad(
        &self,
        params: &P,
        network_state: &NetworkState,
        key: PrngKey,
        example: &Example,
    ) -> Result<LossOutput<P>> {
        self(params, network_state, key, example)
    }
}
