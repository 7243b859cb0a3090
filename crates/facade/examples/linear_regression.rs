//! Fit `y = w * x + b` on synthetic data with calibrated DP-SGD.
//!
//! Data follow `y = 2x + 1 + N(0, 0.1^2)` with `x ~ U[0, 10)`. After 100
//! epochs at `(1, 1e-5)`-DP the learned parameters should be within about
//! 0.3 of the true ones.

use dpsgd::core::{
    Batch, DpError, Example, GradientTree, LossOutput, Metrics, NetworkState, Result, StepOutput,
    Tensor,
};
use dpsgd::{DpsgdConfig, DpsgdTrainer, PrngKey};
use ndarray::{arr0, Array1};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;

const TRUE_W: f64 = 2.0;
const TRUE_B: f64 = 1.0;
const NUM_SAMPLES: usize = 10_000;
const BATCH_SIZE: usize = 256;
const NUM_EPOCHS: u64 = 100;
const LEARNING_RATE: f64 = 1e-3;

fn load_data() -> (Array1<f64>, Array1<f64>) {
    let mut rng = PrngKey::new(3).to_rng();
    let x = Array1::from_shape_fn(NUM_SAMPLES, |_| rng.gen_range(0.0..10.0));
    let y = x.mapv(|x| {
        let noise: f64 = rng.sample(StandardNormal);
        TRUE_W * x + TRUE_B + 0.1 * noise
    });
    (x, y)
}

fn init_params() -> GradientTree {
    let mut rng = PrngKey::new(12).to_rng();
    let mut params = GradientTree::new();
    for name in ["w", "b"] {
        let v: f64 = rng.sample(StandardNormal);
        params.insert(name.to_string(), arr0(v).into_dyn());
    }
    params
}

fn scalar(t: &Tensor, what: &str) -> Result<f64> {
    t.iter()
        .next()
        .copied()
        .ok_or_else(|| DpError::shape(format!("{what} is empty")))
}

fn squared_error(
    params: &GradientTree,
    network_state: &NetworkState,
    _key: PrngKey,
    example: &Example,
) -> Result<LossOutput<GradientTree>> {
    let param = |name: &str| {
        params
            .get(name)
            .ok_or_else(|| DpError::shape(format!("missing parameter {name}")))
            .and_then(|t| scalar(t, name))
    };
    let (w, b) = (param("w")?, param("b")?);
    let x = scalar(example.require("x")?, "x")?;
    let y = scalar(example.require("y")?, "y")?;
    let residual = w * x + b - y;

    let mut grad = GradientTree::new();
    grad.insert("w".to_string(), arr0(2.0 * residual * x).into_dyn());
    grad.insert("b".to_string(), arr0(2.0 * residual).into_dyn());
    Ok(LossOutput {
        loss: residual * residual,
        grad,
        network_state: network_state.clone(),
        metrics: Metrics::default(),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let (x, y) = load_data();
    let batches_per_epoch = (NUM_SAMPLES / BATCH_SIZE) as u64;
    let config = DpsgdConfig {
        target_epsilon: 1.0,
        target_delta: 1e-5,
        clipping_norm: 1.0,
        rescale_to_unit_norm: true,
        batch_size: BATCH_SIZE,
        num_steps: NUM_EPOCHS * batches_per_epoch,
        num_samples: NUM_SAMPLES,
        noise_seed: 42,
        ..DpsgdConfig::default()
    };
    let plan = config.build()?;
    println!("Noise multiplier {:.4}", plan.noise_multiplier());

    let mut params = init_params();
    let mut network_state = NetworkState::new();
    let mut shuffle_rng = PrngKey::new(7).to_rng();
    let mut order: Vec<usize> = (0..NUM_SAMPLES).collect();

    let next_batch = |step: u64, size: usize| -> Result<Batch> {
        let slot = (step % batches_per_epoch) as usize;
        if slot == 0 {
            order.shuffle(&mut shuffle_rng);
        }
        let idx = &order[slot * size..(slot + 1) * size];
        let bx = Array1::from_iter(idx.iter().map(|&i| x[i]));
        let by = Array1::from_iter(idx.iter().map(|&i| y[i]));
        Batch::from_fields([("x", bx.into_dyn()), ("y", by.into_dyn())])
    };
    let apply_update = |params: &mut GradientTree, out: &StepOutput<GradientTree>| -> Result<()> {
        for (name, p) in params.iter_mut() {
            let g = out
                .grad
                .get(name)
                .ok_or_else(|| DpError::shape(format!("no gradient for {name}")))?;
            p.scaled_add(-LEARNING_RATE, g);
        }
        Ok(())
    };

    let summary = DpsgdTrainer::new(&plan)
        .with_log_every(20 * batches_per_epoch)
        .run(&squared_error, &mut params, &mut network_state, next_batch, apply_update)?;

    let learned = |name: &str| {
        params
            .get(name)
            .and_then(|t| t.iter().next().copied())
            .unwrap_or(f64::NAN)
    };
    println!("Training complete after {} updates", summary.updates);
    println!("Final loss {:.4}, epsilon {:.3}", summary.final_loss, summary.epsilon);
    println!("Learned parameters: w={:.4}, b={:.4}", learned("w"), learned("b"));
    println!("True parameters:    w={TRUE_W:.4}, b={TRUE_B:.4}");
    Ok(())
}
