//! Loss terms of one diffusion forward pass and their assembly into a training objective.

use ndarray::{Array1, Array2};

/// How the per-example terms are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LossType {
    /// Variational lower bound (negative log-likelihood estimate).
    Vlb,
    /// Unweighted denoising surrogate normalized by coordinate count.
    #[default]
    L2,
}

/// All per-example terms of the likelihood decomposition.
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Change-of-variables correction of the coordinate normalization.
    pub delta_log_px: Array1<f32>,
    /// `Σ ||ε - ε̂||²` over each example's ligand nodes; zero where `t = 0`.
    pub error_t: Array1<f32>,
    /// `1 - exp(γ_t - γ_s)`.
    pub snr_weight: Array1<f32>,
    pub loss_0_x: Array1<f32>,
    pub loss_0_h: Array1<f32>,
    pub neg_log_constants: Array1<f32>,
    pub kl_prior: Array1<f32>,
    /// `log p(n_lig | n_pocket)`, zero while the size prior is disabled.
    pub log_pn: Array1<f32>,
    /// Sampled integer timestep per example.
    pub t_int: Vec<usize>,
    /// Ligand node counts.
    pub size: Vec<usize>,
    /// Reconstructed ligand `[x̂ | h]`, `n_lig × (3 + atom_nf)`.
    pub xh_lig_hat: Array2<f32>,
}

/// Batch-averaged magnitudes of the network output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub eps_hat_lig_x: f32,
    pub eps_hat_lig_h: f32,
}

impl LossTerms {
    pub fn num_examples(&self) -> usize {
        self.error_t.len()
    }

    /// Per-example objective.
    ///
    /// `Vlb`: `-T/2·w·error_t + loss_0_x + loss_0_h + neg_log_constants + kl_prior
    /// - delta_log_px - log_pn`. `L2`: `0.5·error_t/(3n) + loss_0_x/(3n) + loss_0_h + kl_prior`.
    pub fn objective(&self, loss_type: LossType, timesteps: usize) -> Array1<f32> {
        match loss_type {
            LossType::Vlb => {
                let t = timesteps as f32;
                let mut out = &self.snr_weight * &self.error_t * (-0.5 * t);
                out += &self.loss_0_x;
                out += &self.loss_0_h;
                out += &self.neg_log_constants;
                out += &self.kl_prior;
                out -= &self.delta_log_px;
                out -= &self.log_pn;
                out
            }
            LossType::L2 => {
                let denom: Array1<f32> = self
                    .size
                    .iter()
                    .map(|&n| (crate::graph::N_DIMS * n.max(1)) as f32)
                    .collect();
                0.5 * &self.error_t / &denom + &self.loss_0_x / &denom + &self.loss_0_h + &self.kl_prior
            }
        }
    }

    /// Batch mean of [`Self::objective`].
    pub fn mean_objective(&self, loss_type: LossType, timesteps: usize) -> f32 {
        self.objective(loss_type, timesteps).mean().unwrap_or(0.0)
    }
}

/// KL divergence between isotropic Gaussians `N(μ, q²·I_d)` and `N(0, p²·I_d)`.
///
/// `mu_norm2` is `||μ||²` summed over the `d` dimensions.
pub fn gaussian_kl(mu_norm2: f32, q_sigma: f32, p_sigma: f32, d: f32) -> f32 {
    let (mu_norm2, q, p, d) = (mu_norm2 as f64, q_sigma as f64, p_sigma as f64, d as f64);
    (d * (p / q).ln() + 0.5 * (d * q * q + mu_norm2) / (p * p) - 0.5 * d) as f32
}
