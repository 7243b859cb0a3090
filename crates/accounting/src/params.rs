//! Privacy targets, sampling schemes and batch-size schedules.

use std::collections::BTreeMap;

use dpsgd_core::{DpError, Result};
use serde::{Deserialize, Serialize};

/// How batches are drawn from the dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    /// Each example is included independently with probability `q`.
    #[default]
    Poisson,
    /// Fixed-size batches drawn without replacement.
    Fixed,
}

/// A piecewise-constant schedule keyed by update step.
#[derive(Clone, Debug, PartialEq)]
pub enum Schedule<T> {
    /// A constant value across all steps.
    Constant(T),
    /// A sequence of `(step, value)` change points.
    Timed(Vec<(u64, T)>),
}

impl<T: Clone> Schedule<T> {
    /// Construct a constant schedule.
    pub fn constant(value: T) -> Self {
        Self::Constant(value)
    }

    /// Construct a timed schedule.
    pub fn timed(points: Vec<(u64, T)>) -> Self {
        Self::Timed(points)
    }

    /// Value in effect at `step`.
    pub fn value_at(&self, step: u64) -> Option<T> {
        self.normalize(step).last().map(|(_, v)| v.clone())
    }

    /// Sorted change points up to `max_step`, always starting at step 0.
    pub fn normalize(&self, max_step: u64) -> Vec<(u64, T)> {
        let mut points: Vec<(u64, T)> = match self {
            Schedule::Constant(v) => vec![(0, v.clone())],
            Schedule::Timed(v) => v.clone(),
        };
        points.sort_by_key(|(t, _)| *t);
        if points.is_empty() {
            return points;
        }

        // Step 0 takes the earliest value when the schedule starts later.
        if points[0].0 != 0 {
            let first_val = points[0].1.clone();
            points.insert(0, (0, first_val));
        }
        points.retain(|(t, _)| *t <= max_step);

        // Later duplicates of a step win.
        let mut deduped: Vec<(u64, T)> = Vec::with_capacity(points.len());
        for (step, value) in points {
            match deduped.last_mut() {
                Some((prev_step, prev_value)) if *prev_step == step => *prev_value = value,
                _ => deduped.push((step, value)),
            }
        }
        deduped
    }

    /// Split `num_steps` updates into `(duration, value)` segments.
    pub fn segments(&self, num_steps: u64) -> Vec<(u64, T)> {
        if num_steps == 0 {
            return Vec::new();
        }
        let points = self.normalize(num_steps.saturating_sub(1));
        let mut out = Vec::with_capacity(points.len());
        for (i, (start, value)) in points.iter().enumerate() {
            let end = points.get(i + 1).map_or(num_steps, |(next, _)| *next);
            if end > *start {
                out.push((end - *start, value.clone()));
            }
        }
        out
    }
}

/// Batch-size multipliers keyed by the step from which they apply.
pub type BatchingScaleSchedule = BTreeMap<u64, u64>;

/// Expand a base batch size and its scale schedule into absolute batch sizes.
///
/// Each scale multiplies the batch size in effect before it.
pub fn make_batch_size_schedule(
    base_batch_size: usize,
    scale_schedule: &BatchingScaleSchedule,
) -> Schedule<usize> {
    if scale_schedule.is_empty() {
        return Schedule::constant(base_batch_size);
    }
    let mut size = base_batch_size;
    let mut points: Vec<(u64, usize)> = Vec::with_capacity(scale_schedule.len() + 1);
    points.push((0, size));
    for (threshold, scale) in scale_schedule {
        size = size.saturating_mul(*scale as usize);
        points.push((*threshold, size));
    }
    Schedule::Timed(points)
}

/// A privacy target together with the training shape it applies to.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivacySpec {
    /// Target epsilon.
    pub target_epsilon: f64,
    /// Target delta.
    pub target_delta: f64,
    /// Number of noisy updates.
    pub num_updates: u64,
    /// Dataset size.
    pub num_samples: usize,
    /// Expected batch size per update.
    pub batch_sizes: Schedule<usize>,
}

impl PrivacySpec {
    /// Constant batch size spec.
    pub fn new(
        target_epsilon: f64,
        target_delta: f64,
        num_updates: u64,
        num_samples: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let spec = Self {
            target_epsilon,
            target_delta,
            num_updates,
            num_samples,
            batch_sizes: Schedule::constant(batch_size),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Replace the batch-size schedule.
    pub fn with_batch_sizes(mut self, batch_sizes: Schedule<usize>) -> Result<Self> {
        self.batch_sizes = batch_sizes;
        self.validate()?;
        Ok(self)
    }

    /// Same spec with a different number of updates.
    pub fn with_num_updates(mut self, num_updates: u64) -> Self {
        self.num_updates = num_updates;
        self
    }

    /// Sampling ratio of the first segment.
    pub fn sampling_ratio(&self) -> f64 {
        let bs = self.batch_sizes.value_at(0).unwrap_or(0);
        bs as f64 / self.num_samples as f64
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        if !self.target_epsilon.is_finite() || self.target_epsilon <= 0.0 {
            return Err(DpError::invalid(format!(
                "target_epsilon must be finite and positive, got {}",
                self.target_epsilon
            )));
        }
        validate_delta(self.target_delta)?;
        if self.num_updates == 0 {
            return Err(DpError::invalid("num_updates must be at least 1"));
        }
        if self.num_samples == 0 {
            return Err(DpError::invalid("num_samples must be positive"));
        }
        let points = self.batch_sizes.normalize(u64::MAX);
        if points.is_empty() {
            return Err(DpError::invalid("batch size schedule must not be empty"));
        }
        for (step, bs) in points {
            if bs == 0 || bs > self.num_samples {
                return Err(DpError::invalid(format!(
                    "batch size {bs} at step {step} must be in (0, {}]",
                    self.num_samples
                )));
            }
        }
        Ok(())
    }
}

/// Check that `delta` lies in the open interval (0, 1).
pub fn validate_delta(delta: f64) -> Result<()> {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return Err(DpError::invalid(format!(
            "target_delta must be in (0, 1), got {delta}"
        )));
    }
    Ok(())
}
