//! Per-example gradient clipping for bounded sensitivity.
//!
//! Every example's gradient is computed on its own, rescaled so its global L2
//! norm is at most the clipping norm, and averaged. The parallel and the
//! sequential strategy evaluate examples differently but reduce the results in
//! the same index order, so they produce bit-identical means.

use std::collections::BTreeMap;

use dpsgd_prng::PrngKey;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::error::{DpError, Result};
use crate::loss::{LossOutput, Metrics, NetworkState, PerExampleLoss};
use crate::pytree::{check_same_shape, global_l2_norm, scale, zeros_like, PyTree, TreeSpec};
use crate::tensor::{stack_leading, Tensor};

/// Per-example metric holding each example's pre-clipping gradient norm.
pub const GRAD_NORM_METRIC: &str = "grad_norm";

/// Scalar metric holding the fraction of examples whose gradient was scaled down.
pub const CLIPPED_FRACTION_METRIC: &str = "clipped_fraction";

/// How per-example gradients are evaluated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerExampleMethod {
    /// Evaluate all examples concurrently on the rayon pool.
    #[default]
    Parallel,
    /// Evaluate one example at a time, keeping a running sum.
    Sequential,
}

/// Validated clipping parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ClippingConfig {
    clipping_norm: f64,
    rescale_to_unit_norm: bool,
    per_example_method: PerExampleMethod,
}

impl ClippingConfig {
    /// Create a config; `clipping_norm` must be finite and positive.
    pub fn new(clipping_norm: f64) -> Result<Self> {
        if !clipping_norm.is_finite() || clipping_norm <= 0.0 {
            return Err(DpError::invalid(format!(
                "clipping_norm must be finite and positive, got {clipping_norm}"
            )));
        }
        Ok(Self {
            clipping_norm,
            rescale_to_unit_norm: false,
            per_example_method: PerExampleMethod::default(),
        })
    }

    /// Divide clipped gradients by the clipping norm.
    pub fn with_rescale_to_unit_norm(mut self, rescale: bool) -> Self {
        self.rescale_to_unit_norm = rescale;
        self
    }

    /// Select the per-example strategy.
    pub fn with_method(mut self, method: PerExampleMethod) -> Self {
        self.per_example_method = method;
        self
    }

    /// Maximum L2 norm of a clipped per-example gradient.
    pub fn clipping_norm(&self) -> f64 {
        self.clipping_norm
    }

    /// Whether clipped gradients are divided by the clipping norm.
    pub fn rescale_to_unit_norm(&self) -> bool {
        self.rescale_to_unit_norm
    }

    /// Per-example strategy.
    pub fn per_example_method(&self) -> PerExampleMethod {
        self.per_example_method
    }

    /// Bound on one example's contribution to the summed gradient.
    pub fn sensitivity(&self) -> f64 {
        if self.rescale_to_unit_norm {
            1.0
        } else {
            self.clipping_norm
        }
    }
}

/// Result of clipping one gradient tree.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipReport {
    /// Global L2 norm before clipping.
    pub original_norm: f64,
    /// Whether the gradient was scaled down.
    pub clipped: bool,
    /// Factor applied to the gradient, including unit-norm rescaling.
    pub scale: f64,
}

impl ClipReport {
    /// Whether the gradient was non-finite and replaced by zeros.
    pub fn zeroed(&self) -> bool {
        !self.original_norm.is_finite()
    }
}

/// `min(1, clipping_norm / norm)`; 1 for a zero norm and 0 for a non-finite one.
pub fn clip_scale(norm: f64, clipping_norm: f64) -> f64 {
    if !norm.is_finite() {
        0.0
    } else if norm == 0.0 {
        1.0
    } else {
        (clipping_norm / norm).min(1.0)
    }
}

/// Clip a tree to the configured global L2 norm.
pub fn clip_tree<T: PyTree>(tree: &T, config: &ClippingConfig) -> (T, ClipReport) {
    let norm = global_l2_norm(tree);
    let clip = clip_scale(norm, config.clipping_norm);
    let mut factor = clip;
    if config.rescale_to_unit_norm {
        factor /= config.clipping_norm;
    }

    let clipped = if factor == 0.0 {
        zeros_like(tree)
    } else {
        scale(tree, factor)
    };
    let report = ClipReport {
        original_norm: norm,
        clipped: clip < 1.0,
        scale: factor,
    };
    (clipped, report)
}

/// Mean clipped gradient and auxiliary outputs for one batch.
#[derive(Clone, Debug)]
pub struct ClippedGradients<P> {
    /// Mean loss over the batch.
    pub loss: f64,
    /// Mean of the clipped per-example gradients.
    pub grad: P,
    /// Network state averaged over examples.
    pub network_state: NetworkState,
    /// Averaged scalar metrics and stacked per-example metrics.
    pub metrics: Metrics,
    /// Pre-clipping gradient norm of each example.
    pub norms: Vec<f64>,
    /// Number of examples the mean is taken over.
    pub batch_size: usize,
}

impl<P> ClippedGradients<P> {
    /// Fraction of examples whose gradient was scaled down.
    pub fn clipped_fraction(&self) -> f64 {
        self.metrics
            .scalars
            .get(CLIPPED_FRACTION_METRIC)
            .copied()
            .unwrap_or(0.0)
    }
}

struct Contribution<P> {
    output: LossOutput<P>,
    report: ClipReport,
}

fn contribution<P, L>(
    loss_fn: &L,
    params: &P,
    network_state: &NetworkState,
    batch: &Batch,
    key: PrngKey,
    config: &ClippingConfig,
    index: usize,
) -> Result<Contribution<P>>
where
    P: PyTree,
    L: PerExampleLoss<P> + ?Sized,
{
    let example = batch.example(index)?;
    let example_key = key.fold_in(index as u64);
    let mut output = loss_fn.loss_and_grad(params, network_state, example_key, &example)?;
    check_same_shape(params, &output.grad, "per-example gradient")?;
    let (clipped, report) = clip_tree(&output.grad, config);
    output.grad = clipped;
    Ok(Contribution { output, report })
}

/// Running sums over clipped per-example outputs, consumed in index order.
struct Accumulator {
    spec: TreeSpec,
    grad_sum: Vec<Tensor>,
    loss_sum: f64,
    state_sum: Option<NetworkState>,
    scalar_sums: BTreeMap<String, f64>,
    per_example: BTreeMap<String, Vec<Tensor>>,
    norms: Vec<f64>,
    clipped: usize,
    zeroed: usize,
}

impl Accumulator {
    fn new<P: PyTree>(params: &P, capacity: usize) -> Self {
        let zeros = zeros_like(params);
        let (grad_sum, spec) = zeros.flatten();
        Self {
            spec,
            grad_sum,
            loss_sum: 0.0,
            state_sum: None,
            scalar_sums: BTreeMap::new(),
            per_example: BTreeMap::new(),
            norms: Vec::with_capacity(capacity),
            clipped: 0,
            zeroed: 0,
        }
    }

    fn push<P: PyTree>(&mut self, contribution: Contribution<P>) -> Result<()> {
        let Contribution { output, report } = contribution;
        let first = self.norms.is_empty();

        for (sum, leaf) in self.grad_sum.iter_mut().zip(output.grad.leaf_refs()) {
            *sum += leaf;
        }
        self.loss_sum += output.loss;

        match self.state_sum.as_mut() {
            None => self.state_sum = Some(output.network_state),
            Some(sum) => {
                check_same_shape(sum, &output.network_state, "network state")?;
                for (acc, leaf) in sum.values_mut().zip(output.network_state.values()) {
                    *acc += leaf;
                }
            }
        }

        if !first && !same_keys(&self.scalar_sums, &output.metrics.scalars) {
            return Err(DpError::shape("examples report different scalar metrics"));
        }
        for (name, value) in output.metrics.scalars {
            *self.scalar_sums.entry(name).or_insert(0.0) += value;
        }
        if !first && !same_keys(&self.per_example, &output.metrics.per_example) {
            return Err(DpError::shape("examples report different per-example metrics"));
        }
        for (name, value) in output.metrics.per_example {
            self.per_example.entry(name).or_default().push(value);
        }

        if report.zeroed() {
            self.zeroed += 1;
        } else if report.clipped {
            self.clipped += 1;
        }
        self.norms.push(report.original_norm);
        Ok(())
    }

    fn finish<P: PyTree>(self) -> Result<ClippedGradients<P>> {
        let count = self.norms.len();
        if count == 0 {
            return Err(DpError::invalid("cannot average an empty batch"));
        }
        let inv = 1.0 / count as f64;

        let mean_leaves = self.grad_sum.into_iter().map(|t| t * inv).collect();
        let grad = P::unflatten(&self.spec, mean_leaves)?;

        let network_state = self
            .state_sum
            .map(|state| {
                state
                    .into_iter()
                    .map(|(k, v)| (k, v * inv))
                    .collect::<NetworkState>()
            })
            .unwrap_or_default();

        if self.per_example.contains_key(GRAD_NORM_METRIC)
            || self.scalar_sums.contains_key(CLIPPED_FRACTION_METRIC)
        {
            return Err(DpError::shape(format!(
                "loss metrics may not use the reserved names `{GRAD_NORM_METRIC}` \
                 and `{CLIPPED_FRACTION_METRIC}`"
            )));
        }

        let mut metrics = Metrics::default();
        for (name, sum) in self.scalar_sums {
            metrics.scalars.insert(name, sum * inv);
        }
        for (name, values) in self.per_example {
            metrics.per_example.insert(name, stack_leading(&values)?);
        }
        metrics.per_example.insert(
            GRAD_NORM_METRIC.to_string(),
            Tensor::from_shape_vec(ndarray::IxDyn(&[count]), self.norms.clone())
                .map_err(|e| DpError::shape(e.to_string()))?,
        );
        metrics
            .scalars
            .insert(CLIPPED_FRACTION_METRIC.to_string(), self.clipped as f64 * inv);

        if self.zeroed > 0 {
            tracing::warn!(
                zeroed = self.zeroed,
                batch_size = count,
                "non-finite per-example gradients replaced by zeros"
            );
        }
        tracing::debug!(
            batch_size = count,
            clipped = self.clipped,
            "clipped per-example gradients"
        );

        Ok(ClippedGradients {
            loss: self.loss_sum * inv,
            grad,
            network_state,
            metrics,
            norms: self.norms,
            batch_size: count,
        })
    }
}

fn same_keys<V, W>(a: &BTreeMap<String, V>, b: &BTreeMap<String, W>) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}

/// Mean clipped gradient of `loss_fn` over `batch`.
///
/// Example `i` receives randomness `key.fold_in(i)` under both strategies.
/// Per-example gradients whose structure or leaf shapes differ from `params`
/// fail with [`DpError::ShapeMismatch`], as do loss metrics named
/// [`GRAD_NORM_METRIC`] or [`CLIPPED_FRACTION_METRIC`]. Gradients with a
/// non-finite norm contribute zeros.
pub fn clipped_mean_gradient<P, L>(
    loss_fn: &L,
    params: &P,
    network_state: &NetworkState,
    batch: &Batch,
    key: PrngKey,
    config: &ClippingConfig,
) -> Result<ClippedGradients<P>>
where
    P: PyTree + Send + Sync,
    L: PerExampleLoss<P> + ?Sized,
{
    let n = batch.len();
    let mut acc = Accumulator::new(params, n);
    match config.per_example_method {
        PerExampleMethod::Parallel => {
            let contributions = (0..n)
                .into_par_iter()
                .map(|i| contribution(loss_fn, params, network_state, batch, key, config, i))
                .collect::<Result<Vec<_>>>()?;
            for c in contributions {
                acc.push(c)?;
            }
        }
        PerExampleMethod::Sequential => {
            for i in 0..n {
                let c = contribution(loss_fn, params, network_state, batch, key, config, i)?;
                acc.push(c)?;
            }
        }
    }
    acc.finish()
}
