//! Privacy loss distribution (PLD) accounting for the subsampled Gaussian.
//!
//! A PLD is a histogram of the privacy loss random variable on the grid
//! `k * discretization`, plus a point mass at `+inf`. A single step is
//! discretized by connecting the dots of its `delta(eps)` curve on the grid.
//! That never lowers delta and, unlike rounding each loss up to the grid,
//! adds no half-bin bias per composed step. Every other approximation (truncating
//! supports, aliasing in the FFT) moves mass toward higher loss or onto
//! `+inf`, so epsilons read from a PLD are upper bounds on the true ones.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use statrs::distribution::{ContinuousCDF, Normal};

use dpsgd_core::{DpError, Result};

use crate::accountants::AccountantConfig;
use crate::params::{validate_delta, Sampler};

/// Default width of a privacy-loss bin.
pub const DEFAULT_VALUE_DISCRETIZATION_INTERVAL: f64 = 1e-4;
/// Default log of the mass left outside a single-step support.
pub const DEFAULT_LOG_MASS_TRUNCATION_BOUND: f64 = -50.0;
/// Default mass truncated from the tails of a composition.
pub const DEFAULT_TAIL_MASS_TRUNCATION: f64 = 1e-15;
/// Largest histogram the accountant will materialize.
pub const MAX_PMF_BINS: usize = 1 << 23;

/// Exponents (base 10) of the Chernoff orders used to bound a composition.
const CHERNOFF_LOG10_ORDER_MIN: f64 = -7.0;
const CHERNOFF_LOG10_ORDER_MAX: f64 = 1.0;
const CHERNOFF_ORDER_COUNT: usize = 33;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Adjacency {
    Remove,
    Add,
}

/// The two measures whose log density ratio is the privacy loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Measure {
    Upper,
    Lower,
}

/// Privacy loss of the Poisson-subsampled Gaussian with sensitivity 1.
///
/// Remove: `mu_upper = (1-q) N(0, s^2) + q N(-1, s^2)`, `mu_lower = N(0, s^2)`.
/// Add: `mu_upper = N(0, s^2)`, `mu_lower = (1-q) N(0, s^2) + q N(1, s^2)`.
/// The loss `ln(mu_upper(x) / mu_lower(x))` is decreasing in `x` in both cases.
#[derive(Clone, Debug)]
struct SubsampledGaussianLoss {
    sigma: f64,
    q: f64,
    adjacency: Adjacency,
    std_normal: Normal,
}

impl SubsampledGaussianLoss {
    fn new(sigma: f64, q: f64, adjacency: Adjacency) -> Result<Self> {
        let std_normal = Normal::new(0.0, 1.0).map_err(|e| DpError::invalid(e.to_string()))?;
        Ok(Self {
            sigma,
            q,
            adjacency,
            std_normal,
        })
    }

    fn remove_loss(&self, x: f64) -> f64 {
        let l0 = (-0.5 - x) / (self.sigma * self.sigma);
        if self.q >= 1.0 {
            return l0;
        }
        if l0 > 0.0 {
            l0 + (self.q + (1.0 - self.q) * (-l0).exp()).ln()
        } else {
            (self.q * l0.exp_m1()).ln_1p()
        }
    }

    fn remove_inverse(&self, loss: f64) -> f64 {
        let var = self.sigma * self.sigma;
        if self.q >= 1.0 {
            return -0.5 - loss * var;
        }
        // The loss never drops to ln(1 - q); only x = +inf attains it.
        if loss <= (-self.q).ln_1p() {
            return f64::INFINITY;
        }
        let l0 = if loss > 0.0 {
            loss + (-(1.0 - self.q) * (-loss).exp()).ln_1p() - self.q.ln()
        } else {
            (loss.exp_m1() / self.q).ln_1p()
        };
        -0.5 - l0 * var
    }

    fn loss(&self, x: f64) -> f64 {
        match self.adjacency {
            Adjacency::Remove => self.remove_loss(x),
            Adjacency::Add => -self.remove_loss(-x),
        }
    }

    /// Smallest `x` with `loss(x) <= loss`; may be infinite.
    fn inverse_loss(&self, loss: f64) -> f64 {
        match self.adjacency {
            Adjacency::Remove => self.remove_inverse(loss),
            Adjacency::Add => -self.remove_inverse(-loss),
        }
    }

    /// Mean of the shifted mixture component of `measure`, if it has one.
    fn mixture_mean(&self, measure: Measure) -> Option<f64> {
        match (self.adjacency, measure) {
            (Adjacency::Remove, Measure::Upper) => Some(-1.0),
            (Adjacency::Add, Measure::Lower) => Some(1.0),
            _ => None,
        }
    }

    /// `P[X <= x]` under `measure`.
    fn cdf(&self, x: f64, measure: Measure) -> f64 {
        let phi = |t: f64| self.std_normal.cdf(t / self.sigma);
        match self.mixture_mean(measure) {
            Some(mean) => (1.0 - self.q) * phi(x) + self.q * phi(x - mean),
            None => phi(x),
        }
    }

    /// `P[X > x]` under `measure`.
    fn sf(&self, x: f64, measure: Measure) -> f64 {
        let phi_bar = |t: f64| self.std_normal.cdf(-t / self.sigma);
        match self.mixture_mean(measure) {
            Some(mean) => (1.0 - self.q) * phi_bar(x) + self.q * phi_bar(x - mean),
            None => phi_bar(x),
        }
    }

    /// Mass of `[a, b]`, computed on whichever side avoids cancellation.
    fn mass_between(&self, a: f64, b: f64, measure: Measure) -> f64 {
        let mass = if a >= 0.0 {
            self.sf(a, measure) - self.sf(b, measure)
        } else {
            self.cdf(b, measure) - self.cdf(a, measure)
        };
        mass.max(0.0)
    }

    /// Interval of `x` holding all but `exp(log_mass_truncation_bound)` of the mass.
    fn x_truncation(&self, log_mass_truncation_bound: f64) -> (f64, f64) {
        let tail = 0.5 * log_mass_truncation_bound.exp();
        let z = self.std_normal.inverse_cdf(tail);
        let lower = match self.adjacency {
            Adjacency::Remove => z * self.sigma - 1.0,
            Adjacency::Add => z * self.sigma,
        };
        (lower, -z * self.sigma)
    }
}

/// Histogram of privacy losses: `probs[i]` sits at loss `(lower_index + i) * discretization`.
#[derive(Clone, Debug, PartialEq)]
struct PldPmf {
    discretization: f64,
    lower_index: i64,
    probs: Vec<f64>,
    infinity_mass: f64,
}

impl PldPmf {
    fn identity(discretization: f64) -> Self {
        Self {
            discretization,
            lower_index: 0,
            probs: vec![1.0],
            infinity_mass: 0.0,
        }
    }

    /// Connect-the-dots discretization of a single mechanism invocation.
    ///
    /// The `mu_upper` mass of losses in `(k d, (k+1) d]` is split between
    /// the grid points `k d` and `(k+1) d` so that both its mass and its
    /// `mu_lower` mass (`E[e^{-L}]`) are kept. The resulting `delta(eps)`
    /// equals the mechanism's on the grid and is above it in between.
    /// Mass beyond the lower `x` truncation (the highest losses) goes to
    /// `+inf`; mass beyond the upper `x` truncation goes to the lowest point.
    fn from_privacy_loss(
        mpl: &SubsampledGaussianLoss,
        discretization: f64,
        log_mass_truncation_bound: f64,
    ) -> Result<Self> {
        let (x_lo, x_hi) = mpl.x_truncation(log_mass_truncation_bound);
        let loss_hi = mpl.loss(x_lo);
        let loss_lo = mpl.loss(x_hi);
        let span = (loss_hi - loss_lo) / discretization;
        if !span.is_finite() || span + 3.0 > MAX_PMF_BINS as f64 {
            return Err(DpError::overflow(format!(
                "single-step loss range [{loss_lo:.3}, {loss_hi:.3}] needs {span:.3e} bins of \
                 width {discretization:e} (noise_multiplier={}, q={}); limit is {MAX_PMF_BINS}",
                mpl.sigma, mpl.q
            )));
        }

        let k_min = (loss_lo / discretization).floor() as i64;
        let k_max = ((loss_hi / discretization).ceil() as i64).max(k_min + 1);
        let boundary = |j: i64| mpl.inverse_loss(j as f64 * discretization).clamp(x_lo, x_hi);
        // 1 - e^{-d}
        let gap = -(-discretization).exp_m1();

        let mut probs = vec![0.0; (k_max - k_min + 1) as usize];
        let mut upper = boundary(k_min);
        for (i, k) in (k_min..k_max).enumerate() {
            let lower = boundary(k + 1);
            let mass = mpl.mass_between(lower, upper, Measure::Upper);
            let lower_mass = mpl.mass_between(lower, upper, Measure::Lower);
            upper = lower;
            if mass <= 0.0 {
                continue;
            }
            // e^{k d} times the mu_lower mass, in log space to avoid overflow.
            let scaled_lower = if lower_mass > 0.0 {
                (k as f64 * discretization + lower_mass.ln()).exp()
            } else {
                0.0
            };
            let to_upper = ((mass - scaled_lower) / gap).clamp(0.0, mass);
            probs[i] += mass - to_upper;
            probs[i + 1] += to_upper;
        }
        probs[0] += mpl.sf(x_hi, Measure::Upper);

        Ok(Self {
            discretization,
            lower_index: k_min,
            probs,
            infinity_mass: mpl.cdf(x_lo, Measure::Upper),
        }
        .trimmed())
    }

    fn len(&self) -> usize {
        self.probs.len()
    }

    fn loss_at(&self, idx: usize) -> f64 {
        (self.lower_index + idx as i64) as f64 * self.discretization
    }

    /// Drop zero bins at either end.
    fn trimmed(mut self) -> Self {
        let first = self.probs.iter().position(|&p| p > 0.0);
        let last = self.probs.iter().rposition(|&p| p > 0.0);
        match (first, last) {
            (Some(first), Some(last)) => {
                self.probs.truncate(last + 1);
                self.probs.drain(..first);
                self.lower_index += first as i64;
            }
            _ => {
                self.probs = vec![0.0];
                self.lower_index = 0;
            }
        }
        self
    }

    /// Drop up to `tail_mass_truncation / 2` from each end of the histogram.
    ///
    /// The low-loss tail is folded into the first kept bin and the high-loss
    /// tail is moved to `+inf`.
    fn truncate_tails(self, tail_mass_truncation: f64) -> Self {
        if tail_mass_truncation <= 0.0 || self.probs.len() <= 1 {
            return self;
        }
        let half = 0.5 * tail_mass_truncation;
        let n = self.probs.len();

        let mut left = 0;
        let mut left_mass = 0.0;
        while left + 1 < n && left_mass + self.probs[left] <= half {
            left_mass += self.probs[left];
            left += 1;
        }
        let mut right = n;
        let mut right_mass = 0.0;
        while right - 1 > left && right_mass + self.probs[right - 1] <= half {
            right_mass += self.probs[right - 1];
            right -= 1;
        }

        let mut probs = self.probs[left..right].to_vec();
        probs[0] += left_mass;
        Self {
            discretization: self.discretization,
            lower_index: self.lower_index + left as i64,
            probs,
            infinity_mass: (self.infinity_mass + right_mass).min(1.0),
        }
    }

    fn compose(&self, other: &Self, tail_mass_truncation: f64) -> Result<Self> {
        convolve_powers(&[(self, 1), (other, 1)], tail_mass_truncation)
    }

    fn self_compose(&self, num_times: u64, tail_mass_truncation: f64) -> Result<Self> {
        if num_times == 1 {
            return Ok(self.clone());
        }
        convolve_powers(&[(self, num_times)], tail_mass_truncation)
    }

    /// `delta(eps) = m_inf + sum_{L > eps} p_L (1 - e^{eps - L})`.
    fn delta_for_epsilon(&self, epsilon: f64) -> f64 {
        let mut delta = self.infinity_mass;
        for (i, &p) in self.probs.iter().enumerate() {
            let loss = self.loss_at(i);
            if loss > epsilon {
                delta += -(epsilon - loss).exp_m1() * p;
            }
        }
        delta.clamp(0.0, 1.0)
    }

    /// Smallest `eps >= 0` with `delta_for_epsilon(eps) <= delta`.
    fn epsilon_for_delta(&self, delta: f64) -> f64 {
        if self.infinity_mass > delta {
            return f64::INFINITY;
        }
        // Between consecutive losses, delta(eps) = upper - e^eps * lower.
        let mut upper = self.infinity_mass;
        let mut lower = 0.0;
        let mut bins = (0..self.len()).rev().filter(|&i| self.probs[i] > 0.0).peekable();
        while let Some(i) = bins.next() {
            let loss = self.loss_at(i);
            upper += self.probs[i];
            lower += self.probs[i] * (-loss).exp();
            let next_loss = bins.peek().map_or(f64::NEG_INFINITY, |&j| self.loss_at(j));
            let delta_at_next = upper - next_loss.exp() * lower;
            if delta_at_next > delta {
                return ((upper - delta) / lower).ln().max(0.0);
            }
            // delta(0) <= delta(next_loss) <= delta.
            if next_loss <= 0.0 {
                return 0.0;
            }
        }
        0.0
    }
}

/// `ln sum_j p_j e^{order * j}` over the bins of `pmf`.
fn log_mgf(log_probs: &[(usize, f64)], order: f64) -> f64 {
    let max = log_probs
        .iter()
        .map(|&(j, lp)| lp + order * j as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = log_probs
        .iter()
        .map(|&(j, lp)| (lp + order * j as f64 - max).exp())
        .sum();
    max + sum.ln()
}

/// Offsets `[lo, hi]` holding the sum of bin offsets except for at most
/// `tail_mass_truncation` mass, by Chernoff bounds; also returns the bound on
/// the excluded mass.
fn chernoff_range(
    parts: &[(&PldPmf, u64)],
    max_offset: u64,
    tail_mass_truncation: f64,
) -> (u64, u64, f64) {
    if tail_mass_truncation <= 0.0 || max_offset == 0 {
        return (0, max_offset, 0.0);
    }
    let log_half = (0.5 * tail_mass_truncation).ln();
    let log_probs: Vec<(Vec<(usize, f64)>, f64)> = parts
        .iter()
        .map(|(pmf, times)| {
            let lp = pmf
                .probs
                .iter()
                .enumerate()
                .filter(|(_, &p)| p > 0.0)
                .map(|(j, &p)| (j, p.ln()))
                .collect();
            (lp, *times as f64)
        })
        .collect();
    let cumulant = |order: f64| -> f64 {
        log_probs
            .iter()
            .map(|(lp, times)| times * log_mgf(lp, order))
            .sum()
    };

    let mut hi = max_offset as f64;
    let mut lo = 0.0_f64;
    let step = (CHERNOFF_LOG10_ORDER_MAX - CHERNOFF_LOG10_ORDER_MIN)
        / (CHERNOFF_ORDER_COUNT - 1) as f64;
    for i in 0..CHERNOFF_ORDER_COUNT {
        let order = 10f64.powf(CHERNOFF_LOG10_ORDER_MIN + step * i as f64);
        let upper = (cumulant(order) - log_half) / order;
        if upper.is_finite() {
            hi = hi.min(upper.ceil());
        }
        let lower = (log_half - cumulant(-order)) / order;
        if lower.is_finite() {
            lo = lo.max(lower.floor());
        }
    }
    let hi = hi.clamp(0.0, max_offset as f64) as u64;
    let lo = lo.max(0.0) as u64;
    if lo > hi {
        return (0, max_offset, 0.0);
    }
    let mut excluded = 0.0;
    if hi < max_offset {
        excluded += 0.5 * tail_mass_truncation;
    }
    if lo > 0 {
        excluded += 0.5 * tail_mass_truncation;
    }
    (lo, hi, excluded)
}

/// Distribution of the sum of `times` independent draws from each `pmf`.
///
/// The transformed histograms are raised to their powers by repeated squaring
/// and multiplied, over a support chosen by [`chernoff_range`]. Mass outside
/// that support is charged to `+inf`.
fn convolve_powers(parts: &[(&PldPmf, u64)], tail_mass_truncation: f64) -> Result<PldPmf> {
    let discretization = parts
        .first()
        .map(|(pmf, _)| pmf.discretization)
        .ok_or_else(|| DpError::invalid("nothing to compose"))?;
    let parts: Vec<(&PldPmf, u64)> = parts.iter().copied().filter(|(_, t)| *t > 0).collect();
    if parts.is_empty() {
        return Ok(PldPmf::identity(discretization));
    }

    let mut lower_index: i128 = 0;
    let mut max_offset: u128 = 0;
    let mut log_finite = 0.0;
    for (pmf, times) in &parts {
        if (pmf.discretization - discretization).abs() > 1e-12 * discretization {
            return Err(DpError::invalid(format!(
                "cannot compose PLDs with discretizations {} and {discretization}",
                pmf.discretization
            )));
        }
        if *times > u32::MAX as u64 {
            return Err(DpError::invalid(format!(
                "cannot compose {times} steps; at most {} supported",
                u32::MAX
            )));
        }
        lower_index += pmf.lower_index as i128 * *times as i128;
        max_offset += (pmf.len() as u128 - 1) * *times as u128;
        log_finite += *times as f64 * (-pmf.infinity_mass).ln_1p();
    }
    let finite_mass = log_finite.exp();
    if finite_mass <= 0.0 || parts.iter().all(|(pmf, _)| pmf.probs.iter().all(|&p| p <= 0.0)) {
        return Ok(PldPmf {
            discretization,
            lower_index: 0,
            probs: vec![0.0],
            infinity_mass: 1.0,
        });
    }
    let max_offset = u64::try_from(max_offset)
        .map_err(|_| DpError::overflow("composed support exceeds the addressable range"))?;

    let (lo, hi, excluded) = chernoff_range(&parts, max_offset, tail_mass_truncation);
    let size = ((hi - lo) as usize)
        .checked_add(1)
        .map(usize::next_power_of_two)
        .unwrap_or(usize::MAX);
    if size > MAX_PMF_BINS {
        return Err(DpError::overflow(format!(
            "composed distribution needs {} bins; limit is {MAX_PMF_BINS}",
            hi - lo + 1
        )));
    }

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(size);
    let ifft = planner.plan_fft_inverse(size);
    let mut acc = vec![Complex::new(1.0, 0.0); size];
    for (pmf, times) in &parts {
        let mut buf = vec![Complex::new(0.0, 0.0); size];
        for (j, &p) in pmf.probs.iter().enumerate() {
            buf[j % size].re += p;
        }
        fft.process(&mut buf);
        let exp = *times as u32;
        for (a, b) in acc.iter_mut().zip(&buf) {
            *a *= b.powu(exp);
        }
    }
    ifft.process(&mut acc);

    let scale = 1.0 / size as f64;
    let size_u64 = size as u64;
    let probs: Vec<f64> = (0..size_u64)
        .map(|i| {
            let residue = ((lo + i) % size_u64) as usize;
            (acc[residue].re * scale).max(0.0)
        })
        .collect();

    let lower_index = i64::try_from(lower_index + lo as i128)
        .map_err(|_| DpError::overflow("composed loss index out of range"))?;
    let infinity_mass = (1.0 - finite_mass + excluded).min(1.0);
    tracing::trace!(bins = size, lower_index, infinity_mass, "convolved PLD");

    Ok(PldPmf {
        discretization,
        lower_index,
        probs,
        infinity_mass,
    }
    .truncate_tails(tail_mass_truncation)
    .trimmed())
}

/// Remove and add PLDs of one mechanism; epsilons are the max of the two.
#[derive(Clone, Debug)]
struct PrivacyLossDistribution {
    remove: PldPmf,
    add: Option<PldPmf>,
}

impl PrivacyLossDistribution {
    fn identity(discretization: f64) -> Self {
        Self {
            remove: PldPmf::identity(discretization),
            add: None,
        }
    }

    fn from_subsampled_gaussian(sigma: f64, q: f64, config: &AccountantConfig) -> Result<Self> {
        let make = |adjacency| {
            let mpl = SubsampledGaussianLoss::new(sigma, q, adjacency)?;
            PldPmf::from_privacy_loss(
                &mpl,
                config.value_discretization_interval,
                config.log_mass_truncation_bound,
            )
        };
        let remove = make(Adjacency::Remove)?;
        // Without subsampling both directions have the same distribution.
        let add = if q >= 1.0 {
            None
        } else {
            Some(make(Adjacency::Add)?)
        };
        Ok(Self { remove, add })
    }

    fn bins(&self) -> usize {
        self.remove.len() + self.add.as_ref().map_or(0, PldPmf::len)
    }

    fn compose(&self, other: &Self, tail_mass_truncation: f64) -> Result<Self> {
        let remove = self.remove.compose(&other.remove, tail_mass_truncation)?;
        let add = match (&self.add, &other.add) {
            (None, None) => None,
            (a, b) => {
                let a = a.as_ref().unwrap_or(&self.remove);
                let b = b.as_ref().unwrap_or(&other.remove);
                Some(a.compose(b, tail_mass_truncation)?)
            }
        };
        Ok(Self { remove, add })
    }

    fn self_compose(&self, num_times: u64, tail_mass_truncation: f64) -> Result<Self> {
        let remove = self.remove.self_compose(num_times, tail_mass_truncation)?;
        let add = self
            .add
            .as_ref()
            .map(|pmf| pmf.self_compose(num_times, tail_mass_truncation))
            .transpose()?;
        Ok(Self { remove, add })
    }

    fn epsilon_for_delta(&self, delta: f64) -> f64 {
        let eps = self.remove.epsilon_for_delta(delta);
        match &self.add {
            Some(add) => eps.max(add.epsilon_for_delta(delta)),
            None => eps,
        }
    }

    fn delta_for_epsilon(&self, epsilon: f64) -> f64 {
        let delta = self.remove.delta_for_epsilon(epsilon);
        match &self.add {
            Some(add) => delta.max(add.delta_for_epsilon(epsilon)),
            None => delta,
        }
    }
}

fn validate_event(noise_multiplier: f64, sampling_ratio: f64) -> Result<()> {
    if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
        return Err(DpError::invalid(format!(
            "noise_multiplier must be finite and non-negative, got {noise_multiplier}"
        )));
    }
    if !sampling_ratio.is_finite() || sampling_ratio <= 0.0 || sampling_ratio > 1.0 {
        return Err(DpError::invalid(format!(
            "sampling_ratio must be in (0, 1], got {sampling_ratio}"
        )));
    }
    Ok(())
}

/// Stateful PLD accountant composing subsampled Gaussian steps.
#[derive(Clone, Debug)]
pub struct PldAccountant {
    config: AccountantConfig,
    pld: PrivacyLossDistribution,
    composed_steps: u64,
    contains_non_private_step: bool,
}

impl PldAccountant {
    /// Create an empty accountant.
    pub fn new(config: AccountantConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pld: PrivacyLossDistribution::identity(config.value_discretization_interval),
            composed_steps: 0,
            contains_non_private_step: false,
        })
    }

    /// Accountant configuration.
    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }

    /// Number of steps recorded so far.
    pub fn composed_steps(&self) -> u64 {
        self.composed_steps
    }

    /// Record one step with sampling ratio `q`.
    pub fn step(&mut self, noise_multiplier: f64, sampling_ratio: f64) -> Result<()> {
        self.steps(noise_multiplier, sampling_ratio, 1)
    }

    /// Record `count` identical steps.
    ///
    /// With [`Sampler::Fixed`] each step is accounted as Poisson sampling with
    /// sensitivity 2, i.e. half the noise multiplier.
    pub fn steps(&mut self, noise_multiplier: f64, sampling_ratio: f64, count: u64) -> Result<()> {
        validate_event(noise_multiplier, sampling_ratio)?;
        if count == 0 {
            return Ok(());
        }
        if noise_multiplier == 0.0 {
            if !self.contains_non_private_step {
                tracing::warn!("noise_multiplier 0 recorded; epsilon is unbounded");
            }
            self.contains_non_private_step = true;
        }
        if self.contains_non_private_step {
            self.composed_steps += count;
            return Ok(());
        }

        let sigma = match self.config.sampler {
            Sampler::Poisson => noise_multiplier,
            Sampler::Fixed => noise_multiplier / 2.0,
        };
        let tail = self.config.tail_mass_truncation;
        let event = PrivacyLossDistribution::from_subsampled_gaussian(
            sigma,
            sampling_ratio,
            &self.config,
        )?;
        let composed = event.self_compose(count, tail)?;
        self.pld = if self.composed_steps == 0 {
            composed
        } else {
            self.pld.compose(&composed, tail)?
        };
        self.composed_steps += count;
        tracing::debug!(
            noise_multiplier,
            sampling_ratio,
            count,
            total_steps = self.composed_steps,
            bins = self.pld.bins(),
            "composed subsampled gaussian steps"
        );
        Ok(())
    }

    /// Smallest epsilon such that the recorded steps are `(epsilon, delta)`-DP.
    pub fn epsilon(&self, delta: f64) -> Result<f64> {
        validate_delta(delta)?;
        if self.contains_non_private_step {
            return Ok(f64::INFINITY);
        }
        Ok(self.pld.epsilon_for_delta(delta))
    }

    /// Delta at which the recorded steps are `(epsilon, delta)`-DP.
    pub fn delta(&self, epsilon: f64) -> Result<f64> {
        if epsilon.is_nan() || epsilon < 0.0 {
            return Err(DpError::invalid(format!(
                "epsilon must be non-negative, got {epsilon}"
            )));
        }
        if self.contains_non_private_step {
            return Ok(1.0);
        }
        Ok(self.pld.delta_for_epsilon(epsilon))
    }

    /// Forget every recorded step.
    pub fn reset(&mut self) {
        self.pld = PrivacyLossDistribution::identity(self.config.value_discretization_interval);
        self.composed_steps = 0;
        self.contains_non_private_step = false;
    }
}

/// Epsilon of `num_steps` Poisson-subsampled Gaussian steps at `target_delta`.
///
/// Both the remove and the add neighbouring relation are analysed and the
/// larger epsilon is returned. A zero noise multiplier yields `+inf`.
/// `discretization` is the width of the loss grid. Each step's delta is
/// exact at grid points and an upper bound between them.
pub fn compute_epsilon(
    noise_multiplier: f64,
    sampling_ratio: f64,
    num_steps: u64,
    target_delta: f64,
    discretization: f64,
) -> Result<f64> {
    if num_steps == 0 {
        return Err(DpError::invalid("num_steps must be at least 1"));
    }
    validate_delta(target_delta)?;
    let mut accountant = PldAccountant::new(AccountantConfig::new(discretization))?;
    accountant.steps(noise_multiplier, sampling_ratio, num_steps)?;
    accountant.epsilon(target_delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn std_normal() -> Normal {
        Normal::new(0.0, 1.0).unwrap()
    }

    /// Bisection for the smallest eps in [0, 50] with `delta_of(eps) <= delta`.
    fn solve_epsilon(delta_of: impl Fn(f64) -> f64, delta: f64) -> f64 {
        if delta_of(0.0) <= delta {
            return 0.0;
        }
        let (mut lo, mut hi) = (0.0, 50.0);
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if delta_of(mid) <= delta {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        hi
    }

    #[test]
    fn single_gaussian_matches_closed_form() {
        let n = std_normal();
        for &sigma in &[0.8, 1.0, 2.5] {
            let delta = 1e-5;
            let exact = solve_epsilon(
                |eps| {
                    n.cdf(-eps * sigma + 0.5 / sigma)
                        - eps.exp() * n.cdf(-eps * sigma - 0.5 / sigma)
                },
                delta,
            );
            let eps = compute_epsilon(sigma, 1.0, 1, delta, 1e-4).unwrap();
            assert!(eps >= exact - 1e-9, "sigma {sigma}: {eps} < {exact}");
            assert!(eps - exact < 1e-3, "sigma {sigma}: {eps} vs {exact}");
        }
    }

    #[test]
    fn discretized_delta_is_exact_on_the_grid_and_above_it_between() {
        let n = std_normal();
        let sigma = 1.0_f64;
        let exact = |eps: f64| {
            n.cdf(-eps * sigma + 0.5 / sigma) - eps.exp() * n.cdf(-eps * sigma - 0.5 / sigma)
        };
        let d = 0.05;
        let mpl = SubsampledGaussianLoss::new(sigma, 1.0, Adjacency::Remove).unwrap();
        let pmf = PldPmf::from_privacy_loss(&mpl, d, DEFAULT_LOG_MASS_TRUNCATION_BOUND).unwrap();
        for k in 0..60 {
            let eps = k as f64 * d;
            let on_grid = pmf.delta_for_epsilon(eps);
            assert!((on_grid - exact(eps)).abs() < 1e-10, "eps {eps}: {on_grid} vs {}", exact(eps));
            let mid = eps + 0.5 * d;
            assert!(pmf.delta_for_epsilon(mid) >= exact(mid) - 1e-12, "eps {mid}");
        }
    }

    #[test]
    fn composed_epsilon_is_stable_under_grid_refinement() {
        let (nm, q, steps, delta) = (1.640625, 256.0 / 60_000.0, 5_000, 1e-5);
        let fine = compute_epsilon(nm, q, steps, delta, 1e-4).unwrap();
        let coarse = compute_epsilon(nm, q, steps, delta, 1e-3).unwrap();
        assert!(fine <= 1.0, "{fine}");
        assert!((coarse - fine).abs() < 0.02 * fine, "{coarse} vs {fine}");
    }

    #[test]
    fn single_subsampled_step_matches_numerical_integration() {
        let (sigma, q, delta) = (1.0_f64, 0.1_f64, 1e-5);
        let h = 1e-4;
        let norm = 1.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt());
        let pdf = |x: f64, mu: f64| norm * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp();
        let xs: Vec<f64> = (0..=240_000).map(|i| -12.0 + i as f64 * h).collect();
        // (mu_upper, mu_lower) densities for both neighbouring relations.
        let remove: Vec<(f64, f64)> = xs
            .iter()
            .map(|&x| ((1.0 - q) * pdf(x, 0.0) + q * pdf(x, -1.0), pdf(x, 0.0)))
            .collect();
        let add: Vec<(f64, f64)> = xs
            .iter()
            .map(|&x| (pdf(x, 0.0), (1.0 - q) * pdf(x, 0.0) + q * pdf(x, 1.0)))
            .collect();
        let hockey_stick = |dens: &[(f64, f64)], eps: f64| -> f64 {
            let e = eps.exp();
            dens.iter().map(|&(u, l)| (u - e * l).max(0.0)).sum::<f64>() * h
        };
        let exact = solve_epsilon(
            |eps| hockey_stick(&remove, eps).max(hockey_stick(&add, eps)),
            delta,
        );

        let eps = compute_epsilon(sigma, q, 1, delta, 1e-4).unwrap();
        assert!(eps >= exact - 1e-5, "{eps} < {exact}");
        assert!(eps - exact < 2e-3, "{eps} vs {exact}");
    }

    #[test]
    fn steps_matches_repeated_single_steps() {
        let config = AccountantConfig::new(1e-3);
        let mut batched = PldAccountant::new(config).unwrap();
        let mut one_by_one = PldAccountant::new(config).unwrap();
        batched.steps(1.2, 0.2, 4).unwrap();
        for _ in 0..4 {
            one_by_one.step(1.2, 0.2).unwrap();
        }
        assert_eq!(batched.composed_steps(), 4);
        let a = batched.epsilon(1e-6).unwrap();
        let b = one_by_one.epsilon(1e-6).unwrap();
        assert!((a - b).abs() / b < 0.01, "{a} vs {b}");
    }

    #[test]
    fn composition_conserves_mass() {
        let config = AccountantConfig::new(1e-3);
        let pld = PrivacyLossDistribution::from_subsampled_gaussian(1.0, 0.05, &config).unwrap();
        let composed = pld.self_compose(500, config.tail_mass_truncation).unwrap();
        for pmf in [&composed.remove, composed.add.as_ref().unwrap()] {
            let total: f64 = pmf.probs.iter().sum::<f64>() + pmf.infinity_mass;
            assert!((total - 1.0).abs() < 1e-9, "total mass {total}");
        }
    }

    #[test]
    fn more_steps_cost_more_privacy() {
        let e1 = compute_epsilon(1.0, 0.01, 100, 1e-5, 1e-3).unwrap();
        let e2 = compute_epsilon(1.0, 0.01, 1000, 1e-5, 1e-3).unwrap();
        assert!(e2 > e1);
    }

    #[test]
    fn zero_noise_is_not_private() {
        assert_eq!(
            compute_epsilon(0.0, 0.01, 10, 1e-5, 1e-4).unwrap(),
            f64::INFINITY
        );
        let mut acc = PldAccountant::new(AccountantConfig::default()).unwrap();
        acc.step(0.0, 0.5).unwrap();
        assert_eq!(acc.delta(3.0).unwrap(), 1.0);
        acc.reset();
        assert_eq!(acc.composed_steps(), 0);
        assert_eq!(acc.epsilon(1e-5).unwrap(), 0.0);
    }

    #[test]
    fn fixed_sampling_is_more_expensive_than_poisson() {
        let mut poisson = AccountantConfig::new(1e-3).create_accountant().unwrap();
        let mut fixed = AccountantConfig::new(1e-3)
            .with_sampler(Sampler::Fixed)
            .create_accountant()
            .unwrap();
        poisson.steps(2.0, 0.01, 100).unwrap();
        fixed.steps(2.0, 0.01, 100).unwrap();
        assert!(fixed.epsilon(1e-5).unwrap() > poisson.epsilon(1e-5).unwrap());
    }

    #[test]
    fn too_fine_discretization_overflows() {
        let err = compute_epsilon(1.0, 1.0, 1, 1e-5, 1e-9).unwrap_err();
        assert!(matches!(err, DpError::NumericOverflow { .. }));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let bad = [
            compute_epsilon(1.0, 0.0, 10, 1e-5, 1e-4),
            compute_epsilon(1.0, 1.5, 10, 1e-5, 1e-4),
            compute_epsilon(1.0, 0.1, 0, 1e-5, 1e-4),
            compute_epsilon(1.0, 0.1, 10, 1.5, 1e-4),
            compute_epsilon(1.0, 0.1, 10, 0.0, 1e-4),
            compute_epsilon(1.0, 0.1, 10, 1e-5, 0.0),
            compute_epsilon(-1.0, 0.1, 10, 1e-5, 1e-4),
        ];
        for res in bad {
            assert!(matches!(res, Err(DpError::InvalidConfig { .. })), "{res:?}");
        }
    }

    #[test]
    fn epsilon_and_delta_are_consistent_on_small_histogram() {
        let pmf = PldPmf {
            discretization: 1.0,
            lower_index: 0,
            probs: vec![0.5, 0.3, 0.2],
            infinity_mass: 0.0,
        };
        let delta = pmf.delta_for_epsilon(0.5);
        let expected = 0.3 * (1.0 - (-0.5f64).exp()) + 0.2 * (1.0 - (-1.5f64).exp());
        assert!((delta - expected).abs() < 1e-15);
        let eps = pmf.epsilon_for_delta(delta);
        assert!((eps - 0.5).abs() < 1e-12, "{eps}");
        assert_eq!(pmf.epsilon_for_delta(1.0), 0.0);
        assert_eq!(pmf.delta_for_epsilon(2.0), 0.0);
    }

    #[test]
    fn infinity_mass_above_delta_gives_infinite_epsilon() {
        let pmf = PldPmf {
            discretization: 0.1,
            lower_index: -3,
            probs: vec![0.9],
            infinity_mass: 0.1,
        };
        assert_eq!(pmf.epsilon_for_delta(0.05), f64::INFINITY);
        assert!(pmf.epsilon_for_delta(0.2).is_finite());
    }

    #[test]
    fn truncation_moves_tails_pessimistically() {
        let pmf = PldPmf {
            discretization: 0.5,
            lower_index: -2,
            probs: vec![1e-17, 0.5, 0.5 - 2e-17, 1e-17],
            infinity_mass: 0.0,
        };
        let t = pmf.truncate_tails(1e-15);
        assert_eq!(t.lower_index, -1);
        assert_eq!(t.probs.len(), 2);
        assert!((t.probs[0] - (0.5 + 1e-17)).abs() < 1e-18);
        assert!((t.infinity_mass - 1e-17).abs() < 1e-30);
    }

    #[test]
    fn remove_inverse_is_infinite_below_its_range() {
        let mpl = SubsampledGaussianLoss::new(1.0, 0.3, Adjacency::Remove).unwrap();
        assert_eq!(mpl.inverse_loss((0.7f64).ln() - 1e-3), f64::INFINITY);
        for x in [-3.0, -0.2, 0.0, 1.5, 4.0] {
            let back = mpl.inverse_loss(mpl.loss(x));
            assert!((back - x).abs() < 1e-7, "{x} -> {back}");
        }
        let add = SubsampledGaussianLoss::new(1.0, 0.3, Adjacency::Add).unwrap();
        assert_eq!(add.inverse_loss(-(0.7f64).ln() + 1e-3), f64::NEG_INFINITY);
        for x in [-4.0, -1.0, 0.3, 2.0] {
            assert!((add.inverse_loss(add.loss(x)) - x).abs() < 1e-7);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]

        #[test]
        fn epsilon_is_non_increasing_in_noise(
            nm in 0.7f64..3.0,
            bump in 0.05f64..1.0,
            q in 0.005f64..0.2,
            steps in 1u64..50,
        ) {
            let low = compute_epsilon(nm, q, steps, 1e-5, 1e-3).unwrap();
            let high = compute_epsilon(nm + bump, q, steps, 1e-5, 1e-3).unwrap();
            prop_assert!(
                high <= low + 1e-5,
                "eps({}) = {} > eps({}) = {}",
                nm + bump,
                high,
                nm,
                low
            );
        }
    }
}
