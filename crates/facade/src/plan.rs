//! A calibrated DP-SGD execution plan.

use dpsgd_accounting::{
    calibrate_noise_multiplier, CachedExperimentAccountant, DpTrainingAccountant,
    DpsgdTrainingAccountant, PrivacySpec,
};
use dpsgd_core::{
    Batch, DpError, DpsgdGradientComputer, NetworkState, NoiseState, PerExampleLoss, PyTree,
    Result, StepOutput,
};
use dpsgd_prng::PrngKey;

use crate::config::DpsgdConfig;
use crate::training::{GradientAccumulator, VirtualBatching};

/// Noise multiplier, gradient computer and key stream for one training run.
#[derive(Clone, Debug)]
pub struct DpsgdPlan {
    config: DpsgdConfig,
    spec: PrivacySpec,
    accountant: DpsgdTrainingAccountant,
    noise_multiplier: f64,
    epsilon: f64,
    computer: DpsgdGradientComputer,
    virtual_batching: VirtualBatching,
    base_key: PrngKey,
}

impl DpsgdPlan {
    /// Validate `config`, calibrate the noise multiplier unless one is fixed,
    /// and account for the whole run.
    pub fn new(config: &DpsgdConfig) -> Result<Self> {
        config.validate()?;
        let spec = config.privacy_spec()?;
        let accountant = DpsgdTrainingAccountant::new(config.accountant_config());
        let noise_multiplier = match config.noise_multiplier {
            Some(nm) => nm,
            None => calibrate_noise_multiplier(&accountant, &spec, &config.calibration)?,
        };
        let epsilon = accountant.compute_epsilon(noise_multiplier, &spec)?;
        if epsilon > config.target_epsilon {
            tracing::warn!(
                noise_multiplier,
                epsilon,
                target_epsilon = config.target_epsilon,
                "fixed noise multiplier exceeds the privacy target"
            );
        }
        let computer = DpsgdGradientComputer::new(config.clipping_config()?, noise_multiplier)?;
        let virtual_batching = config.virtual_batching()?;
        tracing::info!(
            noise_multiplier,
            epsilon,
            delta = config.target_delta,
            num_steps = config.num_steps,
            batch_size = config.batch_size,
            num_samples = config.num_samples,
            "built DP-SGD plan"
        );
        Ok(Self {
            config: config.clone(),
            spec,
            accountant,
            noise_multiplier,
            epsilon,
            computer,
            virtual_batching,
            base_key: PrngKey::new(config.noise_seed),
        })
    }

    /// Configuration the plan was built from.
    pub fn config(&self) -> &DpsgdConfig {
        &self.config
    }

    /// Calibrated or fixed noise multiplier.
    pub fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }

    /// Epsilon of the full run at the configured delta.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Gradient computer shared by every update.
    pub fn computer(&self) -> &DpsgdGradientComputer {
        &self.computer
    }

    /// Micro-batch layout.
    pub fn virtual_batching(&self) -> &VirtualBatching {
        &self.virtual_batching
    }

    /// Key for update `update`. Each index must be used for one update only.
    pub fn key_for_step(&self, update: u64) -> PrngKey {
        self.base_key.for_step(update)
    }

    /// Exact epsilon after the first `num_updates` updates.
    pub fn epsilon_spent(&self, num_updates: u64) -> Result<f64> {
        if num_updates == 0 {
            return Ok(0.0);
        }
        let spec = self.spec.clone().with_num_updates(num_updates);
        self.accountant.compute_epsilon(self.noise_multiplier, &spec)
    }

    /// Cached, over-approximating epsilon lookups for progress reporting.
    pub fn cached_accountant(
        &self,
        num_cached_points: u64,
    ) -> Result<CachedExperimentAccountant<DpsgdTrainingAccountant>> {
        CachedExperimentAccountant::new(
            self.accountant.clone(),
            self.noise_multiplier,
            self.spec.clone(),
            num_cached_points,
        )
    }

    /// Noisy gradient for update `update` from a single batch.
    pub fn step<P, L>(
        &self,
        loss_fn: &L,
        params: &P,
        network_state: &NetworkState,
        batch: &Batch,
        update: u64,
    ) -> Result<StepOutput<P>>
    where
        P: PyTree + Send + Sync,
        L: PerExampleLoss<P> + ?Sized,
    {
        self.computer.step(
            loss_fn,
            params,
            network_state,
            batch,
            self.key_for_step(update),
            NoiseState,
        )
    }

    /// Noisy gradient for update `update` accumulated over micro-batches.
    ///
    /// Noise is added once, scaled to the total number of examples.
    pub fn accumulated_step<P, L>(
        &self,
        loss_fn: &L,
        params: &P,
        network_state: &NetworkState,
        micro_batches: &[Batch],
        update: u64,
    ) -> Result<StepOutput<P>>
    where
        P: PyTree + Send + Sync,
        L: PerExampleLoss<P> + ?Sized,
    {
        if micro_batches.is_empty() {
            return Err(DpError::invalid(format!(
                "update {update} has no micro-batches"
            )));
        }
        let (example_key, noise_key) = self.key_for_step(update).split2();
        let mut accumulator = GradientAccumulator::new();
        for (i, batch) in micro_batches.iter().enumerate() {
            let clipped = self.computer.loss_and_clipped_gradients(
                loss_fn,
                params,
                network_state,
                batch,
                example_key.fold_in(i as u64),
            )?;
            accumulator.add(clipped)?;
        }
        let clipped = accumulator.finish()?;
        let (grad, noise_stddev, noise_state) = self.computer.add_noise_to_grads(
            &clipped.grad,
            noise_key,
            clipped.batch_size as f64,
            NoiseState,
        )?;
        tracing::debug!(
            update,
            micro_batches = micro_batches.len(),
            examples = clipped.batch_size,
            noise_stddev,
            "accumulated update"
        );
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
