//! Predefined noise schedules and the pure coefficient helpers derived from them.
//!
//! A schedule is tabulated once for `T` steps as `gamma[i] = -log(alpha²_i / sigma²_i)`,
//! i.e. the negative log signal-to-noise ratio. Everything else (`alpha`, `sigma`, `SNR`,
//! the `t|s` transition) is a pure function of gamma values.
//!
//! Conventions:
//! - `t ∈ [0, 1]` is a normalized timestep; lookup uses `round(t·T)`.
//! - `gamma` is increasing in `t`: `t = 0` is (almost) clean data, `t = 1` (almost) pure noise.

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};

/// Which predefined `alpha²` curve to tabulate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScheduleKind {
    /// `alpha²(t) = (1 - t^power)²`, with clipped step ratios and a precision floor.
    Polynomial { power: f32 },
    /// Cosine schedule (offset `0.008`, betas clipped to `0.999`).
    Cosine { raise_to_power: f32 },
}

impl Default for ScheduleKind {
    fn default() -> Self {
        Self::Polynomial { power: 2.0 }
    }
}

/// Tabulated gamma values for `t_int = 0..=T`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    timesteps: usize,
    gamma: Vec<f32>,
}

impl NoiseSchedule {
    /// Tabulate `kind` for `timesteps` steps.
    ///
    /// `precision` only applies to polynomial schedules: `alpha² ← (1 - 2s)·alpha² + s`, which
    /// bounds gamma on both ends. Smaller values push `gamma(1)` towards `+∞`.
    pub fn new(kind: ScheduleKind, timesteps: usize, precision: f32) -> Result<Self> {
        if timesteps == 0 {
            return Err(Error::Domain("timesteps must be >= 1"));
        }
        let alphas2 = match kind {
            ScheduleKind::Polynomial { power } => {
                if !(power > 0.0) || !power.is_finite() {
                    return Err(Error::Domain("polynomial power must be positive and finite"));
                }
                if !(precision > 0.0) || !(precision < 0.5) {
                    return Err(Error::Domain("precision must be in (0, 0.5)"));
                }
                polynomial_alphas2(timesteps, power as f64, precision as f64)
            }
            ScheduleKind::Cosine { raise_to_power } => {
                if !(raise_to_power > 0.0) || !raise_to_power.is_finite() {
                    return Err(Error::Domain("raise_to_power must be positive and finite"));
                }
                cosine_alphas2(timesteps, 0.008, raise_to_power as f64)
            }
        };

        let gamma = alphas2
            .iter()
            .map(|&a2| {
                let s2 = 1.0 - a2;
                -(a2.ln() - s2.ln()) as f32
            })
            .collect::<Vec<_>>();
        if gamma.iter().any(|g| !g.is_finite()) {
            return Err(Error::Domain("schedule produced non-finite gamma values"));
        }
        Ok(Self { timesteps, gamma })
    }

    /// Number of diffusion steps `T`.
    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    /// `gamma` at a normalized timestep. Values outside `[0, 1]` are clamped.
    pub fn gamma_at(&self, t: f32) -> f32 {
        let idx = (t * self.timesteps as f32).round();
        let idx = idx.clamp(0.0, self.timesteps as f32) as usize;
        self.gamma[idx]
    }

    /// One gamma value per example.
    pub fn gamma(&self, t: &ArrayView1<f32>) -> Array1<f32> {
        t.mapv(|ti| self.gamma_at(ti))
    }

    /// The raw table, `T + 1` entries.
    pub fn table(&self) -> &[f32] {
        &self.gamma
    }
}

fn polynomial_alphas2(timesteps: usize, power: f64, s: f64) -> Vec<f64> {
    let t = timesteps as f64;
    let raw: Vec<f64> = (0..=timesteps)
        .map(|i| (1.0 - (i as f64 / t).powf(power)).powi(2))
        .collect();
    let clipped = clip_noise_schedule(&raw, 0.001);
    let precision = 1.0 - 2.0 * s;
    clipped.into_iter().map(|a2| precision * a2 + s).collect()
}

/// Re-multiply the schedule from clipped step ratios `alpha²_i / alpha²_{i-1} ∈ [clip, 1]`.
///
/// This keeps the per-step transition away from degenerate zero-signal steps at `t → 1`.
fn clip_noise_schedule(alphas2: &[f64], clip_value: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(alphas2.len());
    let mut prev = 1.0f64;
    let mut acc = 1.0f64;
    for &a2 in alphas2 {
        let step = (a2 / prev).clamp(clip_value, 1.0);
        acc *= step;
        out.push(acc);
        prev = a2;
    }
    out
}

fn cosine_alphas2(timesteps: usize, s: f64, raise_to_power: f64) -> Vec<f64> {
    let steps = timesteps + 2;
    let cum: Vec<f64> = (0..steps)
        .map(|i| {
            // linspace(0, steps, steps) / steps
            let x = i as f64 / (steps - 1) as f64;
            let c = ((x + s) / (1.0 + s) * core::f64::consts::FRAC_PI_2).cos();
            c * c
        })
        .collect();
    let c0 = cum[0];
    let mut out = Vec::with_capacity(timesteps + 1);
    let mut acc = 1.0f64;
    for i in 1..steps {
        let beta = (1.0 - (cum[i] / c0) / (cum[i - 1] / c0)).clamp(0.0, 0.999);
        acc *= 1.0 - beta;
        out.push(acc.powf(raise_to_power));
    }
    out
}

/// Numerically stable `log(1 + exp(x))`.
#[inline]
pub fn softplus(x: f32) -> f32 {
    let x = x as f64;
    (x.max(0.0) + (-x.abs()).exp().ln_1p()) as f32
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    let x = x as f64;
    let s = if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    };
    s as f32
}

/// `log(sigmoid(x)) = -softplus(-x)`.
#[inline]
pub fn log_sigmoid(x: f32) -> f32 {
    -softplus(-x)
}

/// `alpha(gamma) = sqrt(sigmoid(-gamma))`.
#[inline]
pub fn alpha(gamma: f32) -> f32 {
    sigmoid(-gamma).sqrt()
}

/// `sigma(gamma) = sqrt(sigmoid(gamma))`.
#[inline]
pub fn sigma(gamma: f32) -> f32 {
    sigmoid(gamma).sqrt()
}

/// `SNR(gamma) = exp(-gamma)`.
#[inline]
pub fn snr(gamma: f32) -> f32 {
    (-gamma).exp()
}

/// Coefficients of `q(z_t | z_s) = N(alpha_{t|s} z_s, sigma²_{t|s})`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionCoefficients {
    pub sigma2_t_given_s: f32,
    pub sigma_t_given_s: f32,
    pub alpha_t_given_s: f32,
}

/// Transition coefficients for `s < t`.
///
/// `sigma²_{t|s} = -expm1(softplus(gamma_s) - softplus(gamma_t))`, never as a difference of
/// exponentials; `alpha_{t|s}` from log-sigmoid differences.
pub fn sigma_and_alpha_t_given_s(gamma_t: f32, gamma_s: f32) -> TransitionCoefficients {
    let sp_s = softplus(gamma_s) as f64;
    let sp_t = softplus(gamma_t) as f64;
    let sigma2 = -(sp_s - sp_t).exp_m1();

    let log_alpha2_t = log_sigmoid(-gamma_t) as f64;
    let log_alpha2_s = log_sigmoid(-gamma_s) as f64;
    let alpha = (0.5 * (log_alpha2_t - log_alpha2_s)).exp();

    TransitionCoefficients {
        sigma2_t_given_s: sigma2 as f32,
        sigma_t_given_s: sigma2.max(0.0).sqrt() as f32,
        alpha_t_given_s: alpha as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn polynomial_gamma_is_increasing_and_finite() {
        let sched = NoiseSchedule::new(ScheduleKind::default(), 1000, 1e-5).unwrap();
        let g = sched.table();
        assert_eq!(g.len(), 1001);
        for w in g.windows(2) {
            assert!(w[1] >= w[0], "gamma must be non-decreasing: {} -> {}", w[0], w[1]);
        }
        assert!(g[0] < -5.0, "t=0 should be nearly noiseless, gamma_0={}", g[0]);
        assert!(g[1000] > 5.0, "t=1 should be nearly pure noise, gamma_1={}", g[1000]);
    }

    #[test]
    fn cosine_gamma_is_increasing() {
        let sched =
            NoiseSchedule::new(ScheduleKind::Cosine { raise_to_power: 1.0 }, 500, 1e-5).unwrap();
        for w in sched.table().windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn gamma_lookup_rounds_to_nearest_step() {
        let sched = NoiseSchedule::new(ScheduleKind::default(), 10, 1e-5).unwrap();
        assert_eq!(sched.gamma_at(0.31), sched.table()[3]);
        assert_eq!(sched.gamma_at(-0.1), sched.table()[0]);
        assert_eq!(sched.gamma_at(1.0), sched.table()[10]);
    }

    #[test]
    fn smaller_precision_pushes_terminal_gamma_up() {
        let a = NoiseSchedule::new(ScheduleKind::default(), 100, 1e-3).unwrap();
        let b = NoiseSchedule::new(ScheduleKind::default(), 100, 1e-8).unwrap();
        assert!(b.gamma_at(1.0) > a.gamma_at(1.0) + 5.0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(NoiseSchedule::new(ScheduleKind::default(), 0, 1e-5).is_err());
        assert!(NoiseSchedule::new(ScheduleKind::default(), 10, 0.0).is_err());
        assert!(NoiseSchedule::new(ScheduleKind::Polynomial { power: -1.0 }, 10, 1e-5).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_alpha_sigma_are_on_the_unit_circle(gamma in -30.0f32..30.0) {
            let a = alpha(gamma);
            let s = sigma(gamma);
            prop_assert!((a * a + s * s - 1.0).abs() <= 1e-5);
        }

        #[test]
        fn prop_transition_composes_marginals(gs in -10.0f32..10.0, dg in 1e-3f32..10.0) {
            // alpha_t = alpha_{t|s} alpha_s and sigma_t² = alpha_{t|s}² sigma_s² + sigma²_{t|s}.
            let gt = gs + dg;
            let c = sigma_and_alpha_t_given_s(gt, gs);
            let at = alpha(gt);
            let st2 = sigma(gt).powi(2);
            prop_assert!((c.alpha_t_given_s * alpha(gs) - at).abs() <= 1e-4);
            let recomposed = c.alpha_t_given_s.powi(2) * sigma(gs).powi(2) + c.sigma2_t_given_s;
            prop_assert!((recomposed - st2).abs() <= 1e-4);
            prop_assert!(c.sigma2_t_given_s >= 0.0);
        }
    }
}
