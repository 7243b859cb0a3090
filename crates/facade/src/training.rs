//! Virtual batching, gradient accumulation and the DP-SGD training driver.

use std::collections::BTreeMap;

use ndarray::{concatenate, Axis};

use dpsgd_accounting::{make_batch_size_schedule, BatchingScaleSchedule, Schedule};
use dpsgd_core::{
    scale, tree_add, Batch, ClippedGradients, DpError, Metrics, NetworkState, PerExampleLoss,
    PyTree, Result, StepOutput, Tensor,
};

use crate::plan::DpsgdPlan;

/// Split of each noisy update into equally sized micro-batches.
///
/// `update` arguments count noisy updates; `physical_steps` arguments count
/// micro-batches.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualBatching {
    batch_size_init: usize,
    batch_size_per_step: usize,
    scale_schedule: BatchingScaleSchedule,
    batch_sizes: Schedule<usize>,
}

impl VirtualBatching {
    /// Every scheduled batch size must be a multiple of `batch_size_per_step`.
    pub fn new(
        batch_size_init: usize,
        batch_size_per_step: usize,
        scale_schedule: BatchingScaleSchedule,
    ) -> Result<Self> {
        if batch_size_init == 0 || batch_size_per_step == 0 {
            return Err(DpError::invalid(format!(
                "batch sizes must be positive, got {batch_size_init} and {batch_size_per_step}"
            )));
        }
        if let Some((step, scale)) = scale_schedule.iter().find(|(_, s)| **s == 0) {
            return Err(DpError::invalid(format!(
                "batch size scale at update {step} must be positive, got {scale}"
            )));
        }
        let batch_sizes = make_batch_size_schedule(batch_size_init, &scale_schedule);
        for (step, size) in batch_sizes.normalize(u64::MAX) {
            if size % batch_size_per_step != 0 {
                return Err(DpError::invalid(format!(
                    "batch size {size} at update {step} is not divisible by the \
                     per-step batch size {batch_size_per_step}"
                )));
            }
        }
        Ok(Self {
            batch_size_init,
            batch_size_per_step,
            scale_schedule,
            batch_sizes,
        })
    }

    /// Batch size before any scaling.
    pub fn batch_size_init(&self) -> usize {
        self.batch_size_init
    }

    /// Examples per micro-batch.
    pub fn batch_size_per_step(&self) -> usize {
        self.batch_size_per_step
    }

    /// Examples contributing to `update`.
    pub fn batch_size(&self, update: u64) -> usize {
        self.batch_sizes.value_at(update).unwrap_or(self.batch_size_init)
    }

    /// Micro-batches accumulated before `update` is applied.
    pub fn apply_update_every(&self, update: u64) -> usize {
        self.batch_size(update) / self.batch_size_per_step
    }

    /// Examples seen after `physical_steps` micro-batches.
    pub fn data_seen(&self, physical_steps: u64) -> u64 {
        physical_steps.saturating_mul(self.batch_size_per_step as u64)
    }

    /// Scale schedule the batch sizes were built from.
    pub fn scale_schedule(&self) -> &BatchingScaleSchedule {
        &self.scale_schedule
    }

    /// Batch size per update, for accounting.
    pub fn batch_size_schedule(&self) -> Schedule<usize> {
        self.batch_sizes.clone()
    }
}

/// Running sum of clipped micro-batch results, weighted by example count.
#[derive(Clone, Debug)]
pub struct GradientAccumulator<P> {
    grad_sum: Option<P>,
    state_sum: Option<NetworkState>,
    loss_sum: f64,
    scalar_sums: BTreeMap<String, f64>,
    per_example: BTreeMap<String, Vec<Tensor>>,
    norms: Vec<f64>,
    examples: usize,
}

impl<P> Default for GradientAccumulator<P> {
    fn default() -> Self {
        Self {
            grad_sum: None,
            state_sum: None,
            loss_sum: 0.0,
            scalar_sums: BTreeMap::new(),
            per_example: BTreeMap::new(),
            norms: Vec::new(),
            examples: 0,
        }
    }
}

impl<P: PyTree> GradientAccumulator<P> {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Examples accumulated so far.
    pub fn examples(&self) -> usize {
        self.examples
    }

    /// Whether nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.examples == 0
    }

    /// Add one micro-batch.
    ///
    /// Every micro-batch must report the same metric names.
    pub fn add(&mut self, clipped: ClippedGradients<P>) -> Result<()> {
        if !self.is_empty()
            && !(same_keys(&self.scalar_sums, &clipped.metrics.scalars)
                && same_keys(&self.per_example, &clipped.metrics.per_example))
        {
            return Err(DpError::shape("micro-batches report different metrics"));
        }
        let weight = clipped.batch_size as f64;
        let grad = scale(&clipped.grad, weight);
        self.grad_sum = Some(match self.grad_sum.take() {
            Some(sum) => tree_add(&sum, &grad)?,
            None => grad,
        });
        let state = scale(&clipped.network_state, weight);
        self.state_sum = Some(match self.state_sum.take() {
            Some(sum) => tree_add(&sum, &state)?,
            None => state,
        });
        self.loss_sum += clipped.loss * weight;
        for (name, value) in clipped.metrics.scalars {
            *self.scalar_sums.entry(name).or_insert(0.0) += value * weight;
        }
        for (name, value) in clipped.metrics.per_example {
            self.per_example.entry(name).or_default().push(value);
        }
        self.norms.extend(clipped.norms);
        self.examples += clipped.batch_size;
        Ok(())
    }

    /// Mean over every accumulated example.
    pub fn finish(self) -> Result<ClippedGradients<P>> {
        let (Some(grad_sum), Some(state_sum)) = (self.grad_sum, self.state_sum) else {
            return Err(DpError::invalid("no micro-batches were accumulated"));
        };
        let inv = 1.0 / self.examples as f64;
        let mut metrics = Metrics::default();
        for (name, sum) in self.scalar_sums {
            metrics.scalars.insert(name, sum * inv);
        }
        for (name, parts) in self.per_example {
            let views: Vec<_> = parts.iter().map(|t| t.view()).collect();
            let joined = concatenate(Axis(0), &views)
                .map_err(|e| DpError::shape(format!("metric {name}: {e}")))?;
            metrics.per_example.insert(name, joined);
        }
        Ok(ClippedGradients {
            loss: self.loss_sum * inv,
            grad: scale(&grad_sum, inv),
            network_state: scale(&state_sum, inv),
            metrics,
            norms: self.norms,
            batch_size: self.examples,
        })
    }
}

fn same_keys<V, W>(a: &BTreeMap<String, V>, b: &BTreeMap<String, W>) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}

/// Summary of a finished training run.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSummary {
    /// Noisy updates applied.
    pub updates: u64,
    /// Examples evaluated.
    pub examples_seen: u64,
    /// Loss of the last update.
    pub final_loss: f64,
    /// Epsilon spent by the run at the plan's delta.
    pub epsilon: f64,
}

/// Drives a [`DpsgdPlan`] for its configured number of updates.
#[derive(Clone, Debug)]
pub struct DpsgdTrainer<'a> {
    plan: &'a DpsgdPlan,
    log_every: u64,
}

impl<'a> DpsgdTrainer<'a> {
    /// Trainer logging progress every 100 updates.
    pub fn new(plan: &'a DpsgdPlan) -> Self {
        Self {
            plan,
            log_every: 100,
        }
    }

    /// Log progress every `log_every` updates; 0 disables progress logs.
    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every;
        self
    }

    /// Run training.
    ///
    /// `next_batch(physical_step, size)` supplies each micro-batch and
    /// `apply_update(params, output)` applies a noisy gradient to a copy of
    /// the parameters, which replaces them only if it returns `Ok`. On error
    /// parameters and network state hold the values of the last completed
    /// update.
    pub fn run<P, L, D, U>(
        &self,
        loss_fn: &L,
        params: &mut P,
        network_state: &mut NetworkState,
        mut next_batch: D,
        mut apply_update: U,
    ) -> Result<TrainingSummary>
    where
        P: PyTree + Clone + Send + Sync,
        L: PerExampleLoss<P> + ?Sized,
        D: FnMut(u64, usize) -> Result<Batch>,
        U: FnMut(&mut P, &StepOutput<P>) -> Result<()>,
    {
        let batching = self.plan.virtual_batching();
        let num_updates = self.plan.config().num_steps;
        let mut ledger = self.plan.cached_accountant(20)?;
        let mut physical_step = 0u64;
        let mut examples_seen = 0u64;
        let mut final_loss = f64::NAN;

        for update in 0..num_updates {
            let per_step = batching.batch_size_per_step();
            let mut micro_batches = Vec::with_capacity(batching.apply_update_every(update));
            for _ in 0..batching.apply_update_every(update) {
                micro_batches.push(next_batch(physical_step, per_step)?);
                physical_step += 1;
            }
            let output = self.plan.accumulated_step(
                loss_fn,
                params,
                network_state,
                &micro_batches,
                update,
            )?;
            let mut updated = params.clone();
            apply_update(&mut updated, &output)?;
            *params = updated;

            examples_seen += micro_batches.iter().map(|b| b.len() as u64).sum::<u64>();
            final_loss = output.loss;
            *network_state = output.network_state;

            let done = update + 1;
            if self.log_every > 0 && (done % self.log_every == 0 || done == num_updates) {
                let epsilon = ledger.compute_epsilon(done, true)?;
                tracing::info!(
                    update = done,
                    loss = output.loss,
                    clipped_fraction = output
                        .metrics
                        .scalars
                        .get(dpsgd_core::CLIPPED_FRACTION_METRIC)
                        .copied()
                        .unwrap_or(0.0),
                    epsilon,
                    "training progress"
                );
            }
        }

        Ok(TrainingSummary {
            updates: num_updates,
            examples_seen,
            final_loss,
            epsilon: self.plan.epsilon(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsgd_core::{clipped_mean_gradient, ClippingConfig, Example, GradientTree, LossOutput};
    use dpsgd_prng::PrngKey;
    use ndarray::{Array1, Array2};

    fn schedule(points: &[(u64, u64)]) -> BatchingScaleSchedule {
        points.iter().copied().collect()
    }

    #[test]
    fn virtual_batching_follows_scale_schedule() {
        let vb = VirtualBatching::new(64, 16, schedule(&[(10, 2), (20, 3)])).unwrap();
        assert_eq!(vb.batch_size(0), 64);
        assert_eq!(vb.batch_size(9), 64);
        assert_eq!(vb.batch_size(10), 128);
        assert_eq!(vb.batch_size(25), 384);
        assert_eq!(vb.apply_update_every(0), 4);
        assert_eq!(vb.apply_update_every(20), 24);
        assert_eq!(vb.data_seen(7), 112);
        assert_eq!(vb.batch_size_schedule().value_at(15), Some(128));
        assert_eq!(vb.batch_size_init(), 64);
        assert_eq!(vb.batch_size_per_step(), 16);
        assert_eq!(vb.scale_schedule(), &schedule(&[(10, 2), (20, 3)]));
    }

    proptest::proptest! {
        #[test]
        fn micro_batches_cover_each_update(
            per_step in 1usize..64,
            multiple in 1usize..16,
            threshold in 1u64..100,
            factor in 1u64..5,
            update in 0u64..200,
        ) {
            let scales = schedule(&[(threshold, factor)]);
            let vb = VirtualBatching::new(per_step * multiple, per_step, scales).unwrap();
            let size = vb.batch_size(update);
            proptest::prop_assert_eq!(vb.apply_update_every(update) * per_step, size);
            let scale = if update >= threshold { factor as usize } else { 1 };
            proptest::prop_assert_eq!(size, scale * per_step * multiple);
        }
    }

    #[test]
    fn indivisible_batch_sizes_are_rejected() {
        assert!(VirtualBatching::new(60, 16, BatchingScaleSchedule::new()).is_err());
        assert!(VirtualBatching::new(64, 48, schedule(&[(5, 3)])).is_err());
        assert!(VirtualBatching::new(64, 16, schedule(&[(5, 0)])).is_err());
        assert!(VirtualBatching::new(64, 0, BatchingScaleSchedule::new()).is_err());
    }

    fn grad_is_input(
        _p: &GradientTree,
        s: &NetworkState,
        _k: PrngKey,
        ex: &Example,
    ) -> Result<LossOutput<GradientTree>> {
        let x = ex.require("x")?;
        let mut grad = GradientTree::new();
        grad.insert("w".to_string(), x.clone());
        Ok(LossOutput {
            loss: x.sum(),
            grad,
            network_state: s.clone(),
            metrics: Metrics::default().with_scalar("seen", 1.0),
        })
    }

    #[test]
    fn accumulation_matches_single_batch_mean() {
        let x = Array2::from_shape_fn((12, 2), |(i, j)| (i as f64 - 5.0) * 0.3 + j as f64);
        let batch = Batch::from_fields([("x", x.into_dyn())]).unwrap();
        let mut params = GradientTree::new();
        params.insert("w".to_string(), Array1::zeros(2).into_dyn());
        let config = ClippingConfig::new(1.0).unwrap();
        let state = NetworkState::new();
        let key = PrngKey::new(0);

        let whole =
            clipped_mean_gradient(&grad_is_input, &params, &state, &batch, key, &config).unwrap();
        let mut acc = GradientAccumulator::new();
        for (i, part) in batch.chunks(4).unwrap().into_iter().enumerate() {
            let clipped = clipped_mean_gradient(
                &grad_is_input,
                &params,
                &state,
                &part,
                key.fold_in(i as u64),
                &config,
            )
            .unwrap();
            acc.add(clipped).unwrap();
        }
        assert_eq!(acc.examples(), 12);
        let merged = acc.finish().unwrap();
        assert_eq!(merged.batch_size, 12);
        assert_eq!(merged.norms, whole.norms);
        assert!((merged.loss - whole.loss).abs() < 1e-12);
        let diff = &merged.grad["w"] - &whole.grad["w"];
        assert!(diff.iter().all(|d| d.abs() < 1e-12));
        assert_eq!(merged.metrics.scalars["seen"], 1.0);
        assert_eq!(
            merged.metrics.per_example[dpsgd_core::GRAD_NORM_METRIC].len(),
            12
        );
    }

    #[test]
    fn micro_batches_with_different_metrics_are_rejected() {
        let x = Array2::from_shape_fn((4, 2), |(i, j)| i as f64 + j as f64);
        let batch = Batch::from_fields([("x", x.into_dyn())]).unwrap();
        let mut params = GradientTree::new();
        params.insert("w".to_string(), Array1::zeros(2).into_dyn());
        let config = ClippingConfig::new(1.0).unwrap();
        let clipped = clipped_mean_gradient(
            &grad_is_input,
            &params,
            &NetworkState::new(),
            &batch,
            PrngKey::new(1),
            &config,
        )
        .unwrap();
        let mut missing = clipped.clone();
        missing.metrics.per_example.remove(dpsgd_core::GRAD_NORM_METRIC);

        let mut acc = GradientAccumulator::new();
        acc.add(clipped).unwrap();
        let err = acc.add(missing).unwrap_err();
        assert!(matches!(err, DpError::ShapeMismatch { .. }));
        assert_eq!(acc.examples(), 4);
        assert_eq!(acc.finish().unwrap().norms.len(), 4);
    }

    #[test]
    fn empty_accumulator_cannot_finish() {
        let acc = GradientAccumulator::<GradientTree>::new();
        assert!(acc.is_empty());
        assert!(matches!(acc.finish(), Err(DpError::InvalidConfig { .. })));
    }
}
