//! Pocket-conditioned diffusion over ligand coordinates.
//!
//! The forward process noises ligand positions only: `z_t = alpha_t·x + sigma_t·eps`, with the
//! categorical channel carried along unchanged. Positions are kept in the frame chosen by the
//! [`CoMPolicy`]; the pocket moves with every re-projection so the relative geometry is exact.
//!
//! All methods here work on *normalized* batches except [`ConditionalDiffusion::forward`],
//! which normalizes its inputs, and [`ConditionalDiffusion::sample_p_xh_given_z0`], which
//! returns unnormalized data.

use crate::categorical::{argmax_one_hot, discretized_log_likelihood};
use crate::com::{CoMPolicy, SubspaceCoMPolicy};
use crate::dynamics::{Dynamics, TimeInput};
use crate::graph::{
    concat_columns, gather, sum_squares_per_example, GraphBatch, N_DIMS,
};
use crate::guidance::{EnergyGuider, SizeDistribution};
use crate::loss::{gaussian_kl, Diagnostics, LossTerms};
use crate::normalize::{Normalizer, NormalizerConfig};
use crate::schedule::{alpha, sigma, sigma_and_alpha_t_given_s, snr, NoiseSchedule, ScheduleKind};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand_distr::{Distribution, StandardNormal};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiffusionConfig {
    /// Number of diffusion steps `T`.
    pub timesteps: usize,
    pub schedule: ScheduleKind,
    /// Floor of the polynomial schedule.
    pub precision: f32,
    pub atom_nf: usize,
    pub residue_nf: usize,
    pub normalizer: NormalizerConfig,
    /// Include `log p(n_lig | n_pocket)` in the loss terms. Needs a [`SizeDistribution`].
    pub size_prior: bool,
    /// Diffuse pocket features too. Not supported by the conditional model.
    pub denoise_pocket_features: bool,
    /// Residual center drift tolerated after sampling before a correction pass.
    pub drift_tolerance: f32,
}

impl DiffusionConfig {
    pub fn new(atom_nf: usize, residue_nf: usize) -> Self {
        Self {
            timesteps: 1000,
            schedule: ScheduleKind::default(),
            precision: 1e-5,
            atom_nf,
            residue_nf,
            normalizer: NormalizerConfig::default(),
            size_prior: false,
            denoise_pocket_features: false,
            drift_tolerance: 5e-2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timesteps == 0 {
            return Err(Error::Domain("timesteps must be >= 1"));
        }
        if self.atom_nf == 0 || self.residue_nf == 0 {
            return Err(Error::Domain("atom_nf and residue_nf must be >= 1"));
        }
        if !(self.drift_tolerance > 0.0) || !self.drift_tolerance.is_finite() {
            return Err(Error::Domain("drift_tolerance must be positive and finite"));
        }
        self.normalizer.validate()
    }
}

/// Whether the zero-step likelihood is folded into the sampled timestep (training) or
/// evaluated with a dedicated pass at `t = 0` (evaluation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Result of [`ConditionalDiffusion::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub terms: LossTerms,
    pub info: Diagnostics,
}

/// `q(z_t | x)` draw: noised ligand, the pocket in the same frame, and the noise target.
#[derive(Debug, Clone)]
pub struct NoisedState {
    pub ligand: GraphBatch,
    pub pocket: GraphBatch,
    /// Drawn coordinate noise, `n_lig × 3`.
    pub eps: Array2<f32>,
}

/// Output of the terminal decoding step, unnormalized.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    pub ligand_x: Array2<f32>,
    /// Hard one-hot ligand features.
    pub ligand_h: Array2<f32>,
    pub pocket_x: Array2<f32>,
    pub pocket_h: Array2<f32>,
}

/// Standard normal draws of the given shape.
pub fn sample_gaussian<R: rand::Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || StandardNormal.sample(rng))
}

/// Multiply row `i` of `x` by `per_node[i]`.
fn scale_rows(x: &ArrayView2<f32>, per_node: &Array1<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for (mut row, &s) in out.axis_iter_mut(Axis(0)).zip(per_node) {
        row *= s;
    }
    out
}

/// Diffusion over ligand coordinates conditioned on a fixed pocket.
pub struct ConditionalDiffusion<D, P = SubspaceCoMPolicy> {
    cfg: DiffusionConfig,
    schedule: NoiseSchedule,
    normalizer: Normalizer,
    dynamics: D,
    policy: P,
    energy_guider: Option<Box<dyn EnergyGuider>>,
    size_distribution: Option<Box<dyn SizeDistribution>>,
}

impl<D: Dynamics, P: CoMPolicy> ConditionalDiffusion<D, P> {
    pub fn new(cfg: DiffusionConfig, dynamics: D, policy: P) -> Result<Self> {
        cfg.validate()?;
        if dynamics.updates_pocket_coords() {
            return Err(Error::NotSupported(
                "conditional diffusion requires frozen pocket coordinates",
            ));
        }
        if cfg.denoise_pocket_features {
            return Err(Error::NotSupported("pocket feature denoising"));
        }
        let schedule = NoiseSchedule::new(cfg.schedule, cfg.timesteps, cfg.precision)?;
        let normalizer = Normalizer::new(cfg.normalizer)?;
        Ok(Self {
            cfg,
            schedule,
            normalizer,
            dynamics,
            policy,
            energy_guider: None,
            size_distribution: None,
        })
    }

    pub fn with_energy_guider(mut self, guider: impl EnergyGuider + 'static) -> Self {
        self.energy_guider = Some(Box::new(guider));
        self
    }

    pub fn with_size_distribution(mut self, dist: impl SizeDistribution + 'static) -> Self {
        self.size_distribution = Some(Box::new(dist));
        self
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.cfg
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn dynamics(&self) -> &D {
        &self.dynamics
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn timesteps(&self) -> usize {
        self.cfg.timesteps
    }

    pub fn has_energy_guider(&self) -> bool {
        self.energy_guider.is_some()
    }

    fn check_system(&self, ligand: &GraphBatch, pocket: &GraphBatch) -> Result<()> {
        if ligand.nf() != self.cfg.atom_nf {
            return Err(Error::Shape("ligand feature width does not match atom_nf"));
        }
        if pocket.nf() != self.cfg.residue_nf {
            return Err(Error::Shape("pocket feature width does not match residue_nf"));
        }
        if ligand.num_examples() != pocket.num_examples() {
            return Err(Error::Shape("ligand and pocket must have the same number of examples"));
        }
        Ok(())
    }

    fn check_per_example(&self, values: &ArrayView1<f32>, ligand: &GraphBatch) -> Result<()> {
        if values.len() != ligand.num_examples() {
            return Err(Error::Shape("expected one value per example"));
        }
        Ok(())
    }

    /// Re-project ligand positions (and shift the pocket along) into the policy's frame.
    fn project(&self, ligand_x: &mut Array2<f32>, pocket_x: &mut Array2<f32>, ligand: &GraphBatch, pocket: &GraphBatch) {
        self.policy.remove_mean(
            ligand_x,
            pocket_x,
            &ligand.batch,
            &pocket.batch,
            ligand.num_examples(),
        );
    }

    /// Draw `z_t ~ q(z_t | x)` for per-example `gamma_t`.
    pub fn noised_representation<R: rand::Rng + ?Sized>(
        &self,
        ligand: &GraphBatch,
        pocket: &GraphBatch,
        gamma_t: &ArrayView1<f32>,
        rng: &mut R,
    ) -> Result<NoisedState> {
        self.check_per_example(gamma_t, ligand)?;
        let alpha_t = gather(&gamma_t.mapv(alpha).view(), &ligand.batch);
        let sigma_t = gather(&gamma_t.mapv(sigma).view(), &ligand.batch);

        let eps = sample_gaussian(ligand.num_nodes(), N_DIMS, rng);
        let mut z_x = scale_rows(&ligand.x.view(), &alpha_t) + scale_rows(&eps.view(), &sigma_t);
        let mut pocket_x = pocket.x.clone();
        self.project(&mut z_x, &mut pocket_x, ligand, pocket);
        self.policy
            .assert_mean_zero(&z_x.view(), &ligand.batch, ligand.num_examples())?;

        Ok(NoisedState {
            ligand: ligand.with_positions(z_x)?,
            pocket: pocket.with_positions(pocket_x)?,
            eps,
        })
    }

    /// `KL(q(z_T | x) || N(0, I))` per example, coordinate and feature parts summed.
    pub fn kl_prior(&self, ligand: &GraphBatch) -> Array1<f32> {
        let gamma_1 = self.schedule.gamma_at(1.0);
        let (alpha_1, sigma_1) = (alpha(gamma_1), sigma(gamma_1));
        let b = ligand.num_examples();

        let mu_x = ligand.x.mapv(|v| v * alpha_1);
        let mu_h = ligand.one_hot.mapv(|v| v * alpha_1);
        let mu_x2 = sum_squares_per_example(&mu_x.view(), &ligand.batch, b);
        let mu_h2 = sum_squares_per_example(&mu_h.view(), &ligand.batch, b);

        ligand
            .size
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let d_x = self.policy.subspace_dimensionality(n) as f32;
                let d_h = (n * self.cfg.atom_nf) as f32;
                gaussian_kl(mu_x2[i], sigma_1, 1.0, d_x) + gaussian_kl(mu_h2[i], sigma_1, 1.0, d_h)
            })
            .collect()
    }

    /// Normalizing constants of `log p(x | z_0)`, depending on node counts only.
    pub fn log_constants_p_x_given_z0(&self, size: &[usize]) -> Array1<f32> {
        let log_sigma_x = 0.5 * self.schedule.gamma_at(0.0) as f64;
        let half_log_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
        size.iter()
            .map(|&n| {
                let dof = self.policy.subspace_dimensionality(n) as f64;
                (dof * (-log_sigma_x - half_log_2pi)) as f32
            })
            .collect()
    }

    /// Log-density change of the coordinate rescaling.
    pub fn delta_log_px(&self, size: &[usize]) -> Array1<f32> {
        let log_scale = (self.normalizer.x_scale() as f64).ln();
        size.iter()
            .map(|&n| (-(self.policy.subspace_dimensionality(n) as f64) * log_scale) as f32)
            .collect()
    }

    /// `(log p(x | z_0), log p(h | z_0))` per example, without the constants.
    ///
    /// `ligand` and `z_0` are normalized; the categorical term is evaluated on the integer
    /// scale with `sigma_0·h_scale`.
    pub fn log_pxh_given_z0_without_constants(
        &self,
        ligand: &GraphBatch,
        z_0: &GraphBatch,
        eps: &ArrayView2<f32>,
        eps_hat: &ArrayView2<f32>,
        gamma_0: &ArrayView1<f32>,
    ) -> Result<(Array1<f32>, Array1<f32>)> {
        if eps.dim() != eps_hat.dim() {
            return Err(Error::Shape("predicted and target noise differ in shape"));
        }
        self.check_per_example(gamma_0, ligand)?;
        let b = ligand.num_examples();

        let diff = eps - eps_hat;
        let log_p_x = sum_squares_per_example(&diff.view(), &ligand.batch, b).mapv(|v| -0.5 * v);

        let (h_scale, h_bias) = (self.normalizer.h_scale(), self.normalizer.h_bias());
        let sigma_0_cat = gather(&gamma_0.mapv(|g| sigma(g) * h_scale).view(), &ligand.batch);
        let target = ligand.one_hot.mapv(|v| v * h_scale + h_bias);
        let estimate = z_0.one_hot.mapv(|v| v * h_scale + h_bias);
        let sigma_col = sigma_0_cat.insert_axis(Axis(1));
        let log_p_h =
            discretized_log_likelihood(&estimate.view(), &target.view(), &sigma_col.view(), &ligand.batch, b)?;

        Ok((log_p_x, log_p_h))
    }

    /// `x̂ = z_t/alpha_t − eps·sigma_t/alpha_t` for per-example `gamma`.
    pub fn compute_x_pred(
        &self,
        z_x: &ArrayView2<f32>,
        eps: &ArrayView2<f32>,
        gamma: &ArrayView1<f32>,
        batch: &[usize],
    ) -> Result<Array2<f32>> {
        if z_x.dim() != eps.dim() {
            return Err(Error::Shape("predicted noise must match the ligand positions"));
        }
        let inv_alpha = gather(&gamma.mapv(|g| 1.0 / alpha(g)).view(), batch);
        let ratio = gather(&gamma.mapv(|g| sigma(g) / alpha(g)).view(), batch);
        Ok(scale_rows(z_x, &inv_alpha) - scale_rows(eps, &ratio))
    }

    /// Reconstructed `[x̂ | h]` from a noised ligand and a noise estimate.
    pub fn xh_given_zt_and_epsilon(
        &self,
        z_t: &GraphBatch,
        eps: &ArrayView2<f32>,
        gamma_t: &ArrayView1<f32>,
    ) -> Result<Array2<f32>> {
        self.check_per_example(gamma_t, z_t)?;
        let x = self.compute_x_pred(&z_t.x.view(), eps, gamma_t, &z_t.batch)?;
        Ok(concat_columns(&x.view(), &z_t.one_hot.view()))
    }

    /// `mu + sigma·eps`, projected into the policy's frame together with the pocket.
    ///
    /// Fixed-noise sampling is not implemented and fails.
    pub fn sample_normal_zero_com<R: rand::Rng + ?Sized>(
        &self,
        mu_x: &ArrayView2<f32>,
        ligand: &GraphBatch,
        pocket: &GraphBatch,
        sigma: &ArrayView1<f32>,
        fix_noise: bool,
        rng: &mut R,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        if fix_noise {
            return Err(Error::NotSupported("fixed-noise sampling"));
        }
        if mu_x.dim() != ligand.x.dim() {
            return Err(Error::Shape("mean must have the shape of the ligand positions"));
        }
        self.check_per_example(sigma, ligand)?;
        let eps = sample_gaussian(ligand.num_nodes(), N_DIMS, rng);
        let per_node = gather(sigma, &ligand.batch);
        let mut x = mu_x.to_owned() + scale_rows(&eps.view(), &per_node);
        let mut pocket_x = pocket.x.clone();
        self.project(&mut x, &mut pocket_x, ligand, pocket);
        Ok((x, pocket_x))
    }

    /// One forward transition `z_t ~ q(z_t | z_s)`.
    pub fn sample_p_zt_given_zs<R: rand::Rng + ?Sized>(
        &self,
        z_s: &GraphBatch,
        pocket: &GraphBatch,
        gamma_t: &ArrayView1<f32>,
        gamma_s: &ArrayView1<f32>,
        rng: &mut R,
    ) -> Result<(GraphBatch, GraphBatch)> {
        self.check_per_example(gamma_t, z_s)?;
        self.check_per_example(gamma_s, z_s)?;
        let coeffs: Vec<_> = gamma_t
            .iter()
            .zip(gamma_s)
            .map(|(&gt, &gs)| sigma_and_alpha_t_given_s(gt, gs))
            .collect();
        let alpha_ts: Array1<f32> = coeffs.iter().map(|c| c.alpha_t_given_s).collect();
        let sigma_ts: Array1<f32> = coeffs.iter().map(|c| c.sigma_t_given_s).collect();

        let mu = scale_rows(&z_s.x.view(), &gather(&alpha_ts.view(), &z_s.batch));
        let (x, pocket_x) = self.sample_normal_zero_com(&mu.view(), z_s, pocket, &sigma_ts.view(), false, rng)?;
        Ok((z_s.with_positions(x)?, pocket.with_positions(pocket_x)?))
    }

    /// Query the energy guider with the current noisy state.
    fn energy_gradient(&self, z: &GraphBatch, pocket: &GraphBatch) -> Result<Array2<f32>> {
        let guider = self
            .energy_guider
            .as_ref()
            .ok_or(Error::NotSupported("guidance requested without an energy guider"))?;
        let grad = guider.energy_gradient(&z.xh().view(), &pocket.xh().view(), &z.batch, &pocket.batch)?;
        if grad.dim() != z.x.dim() {
            return Err(Error::Shape("energy gradient must have the shape of the ligand positions"));
        }
        Ok(grad)
    }

    /// One reverse step `z_s ~ p(z_s | z_t)`.
    ///
    /// `guidance` is the gradient scale when this step should be guided. The categorical
    /// channel is carried over unchanged.
    pub fn sample_p_zs_given_zt<R: rand::Rng + ?Sized>(
        &self,
        s: &ArrayView1<f32>,
        t: &ArrayView1<f32>,
        z_t: &GraphBatch,
        pocket: &GraphBatch,
        guidance: Option<f32>,
        rng: &mut R,
    ) -> Result<(GraphBatch, GraphBatch)> {
        self.check_per_example(s, z_t)?;
        self.check_per_example(t, z_t)?;
        let gamma_s = self.schedule.gamma(s);
        let gamma_t = self.schedule.gamma(t);

        let n = z_t.num_examples();
        let mut mean_coef = Array1::<f32>::zeros(n);
        let mut eps_coef = Array1::<f32>::zeros(n);
        let mut step_sigma = Array1::<f32>::zeros(n);
        for b in 0..n {
            let c = sigma_and_alpha_t_given_s(gamma_t[b], gamma_s[b]);
            let (sigma_s, sigma_t) = (sigma(gamma_s[b]), sigma(gamma_t[b]));
            mean_coef[b] = 1.0 / c.alpha_t_given_s;
            eps_coef[b] = c.sigma2_t_given_s / (c.alpha_t_given_s * sigma_t);
            step_sigma[b] = c.sigma_t_given_s * sigma_s / sigma_t;
        }

        let eps_hat = self.dynamics.predict(z_t, pocket, TimeInput::PerExample(t.view()))?;
        if eps_hat.dim() != z_t.x.dim() {
            return Err(Error::Shape("predicted noise must match the ligand positions"));
        }

        let mut mu = scale_rows(&z_t.x.view(), &gather(&mean_coef.view(), &z_t.batch))
            - scale_rows(&eps_hat.view(), &gather(&eps_coef.view(), &z_t.batch));

        if let Some(scale) = guidance {
            let grad = self.energy_gradient(z_t, pocket)?;
            let per_node = gather(&step_sigma.mapv(|v| v * scale).view(), &z_t.batch);
            mu -= &scale_rows(&grad.view(), &per_node);
        }

        let (x, pocket_x) = self.sample_normal_zero_com(&mu.view(), z_t, pocket, &step_sigma.view(), false, rng)?;
        self.policy.assert_mean_zero(&x.view(), &z_t.batch, n)?;
        Ok((z_t.with_positions(x)?, pocket.with_positions(pocket_x)?))
    }

    /// Terminal decoding `x ~ p(x | z_0)`, unnormalized, with hard one-hot ligand features.
    pub fn sample_p_xh_given_z0<R: rand::Rng + ?Sized>(
        &self,
        z_0: &GraphBatch,
        pocket: &GraphBatch,
        guidance: Option<f32>,
        rng: &mut R,
    ) -> Result<DecodedSample> {
        let n = z_0.num_examples();
        let gamma_0 = Array1::from_elem(n, self.schedule.gamma_at(0.0));
        // sigma_0 / alpha_0
        let sigma_x = gamma_0.mapv(|g| snr(-0.5 * g));
        let t_zeros = Array1::<f32>::zeros(n);

        let eps_hat = self.dynamics.predict(z_0, pocket, TimeInput::PerExample(t_zeros.view()))?;
        let mut mu = self.compute_x_pred(&z_0.x.view(), &eps_hat.view(), &gamma_0.view(), &z_0.batch)?;

        if let Some(scale) = guidance {
            let grad = self.energy_gradient(z_0, pocket)?;
            let per_node = gather(&sigma_x.mapv(|v| v * scale).view(), &z_0.batch);
            mu -= &scale_rows(&grad.view(), &per_node);
        }

        let (x, pocket_x) = self.sample_normal_zero_com(&mu.view(), z_0, pocket, &sigma_x.view(), false, rng)?;
        let (ligand_x, ligand_h) = self.normalizer.unnormalize(&x.view(), &z_0.one_hot.view());
        let (pocket_x, pocket_h) = self.normalizer.unnormalize(&pocket_x.view(), &pocket.one_hot.view());
        Ok(DecodedSample {
            ligand_x,
            ligand_h: argmax_one_hot(&ligand_h.view()),
            pocket_x,
            pocket_h,
        })
    }

    /// `log p(n_lig | n_pocket)` from the configured size distribution.
    pub fn log_pn(&self, n_ligand: &[usize], n_pocket: &[usize]) -> Result<Array1<f32>> {
        let dist = self
            .size_distribution
            .as_ref()
            .ok_or(Error::NotSupported("size prior enabled without a size distribution"))?;
        let out = dist.log_prob_n1_given_n2(n_ligand, n_pocket)?;
        if out.len() != n_ligand.len() {
            return Err(Error::Shape("size distribution must return one value per example"));
        }
        Ok(out)
    }

    /// Unconditional sampling has no pocket to condition on.
    pub fn sample(&self) -> Result<()> {
        Err(Error::NotSupported("conditional model cannot sample without a pocket"))
    }

    /// Joint position/feature noise is not drawn by this model; see
    /// [`Self::sample_normal_zero_com`].
    pub fn sample_combined_position_feature_noise(&self) -> Result<()> {
        Err(Error::NotSupported("combined position and feature noise"))
    }

    /// Loss terms for one batch.
    ///
    /// `ligand` and `pocket` are raw (unnormalized) batches. One integer timestep per example
    /// is drawn from `0..=T` in [`Mode::Train`] and from `1..=T` in [`Mode::Eval`], where the
    /// zero-step likelihood gets its own pass at `t = 0`.
    pub fn forward<R: rand::Rng + ?Sized>(
        &self,
        ligand: &GraphBatch,
        pocket: &GraphBatch,
        mode: Mode,
        rng: &mut R,
    ) -> Result<ForwardOutput> {
        self.check_system(ligand, pocket)?;
        let b = ligand.num_examples();
        let big_t = self.cfg.timesteps;

        let mut lig_x = ligand.x.clone();
        let mut pocket_x = pocket.x.clone();
        self.policy
            .center_on_pocket(&mut lig_x, &mut pocket_x, &ligand.batch, &pocket.batch, b);
        let (ligand, pocket) = self
            .normalizer
            .normalize(&ligand.with_positions(lig_x)?, &pocket.with_positions(pocket_x)?);

        let delta_log_px = self.delta_log_px(&ligand.size);

        let lowest = match mode {
            Mode::Train => 0,
            Mode::Eval => 1,
        };
        let t_int: Vec<usize> = (0..b).map(|_| rng.random_range(lowest..=big_t)).collect();
        tracing::debug!(?t_int, "sampled diffusion timesteps");
        let t: Array1<f32> = t_int.iter().map(|&ti| ti as f32 / big_t as f32).collect();
        // At t = 0 the regression term is masked out, so s is clamped rather than wrapped.
        let s: Array1<f32> = t_int
            .iter()
            .map(|&ti| ti.saturating_sub(1) as f32 / big_t as f32)
            .collect();
        let gamma_t = self.schedule.gamma(&t.view());
        let gamma_s = self.schedule.gamma(&s.view());

        let mut x0 = ligand.x.clone();
        let mut p0 = pocket.x.clone();
        self.project(&mut x0, &mut p0, &ligand, &pocket);
        let ligand = ligand.with_positions(x0)?;
        let pocket = pocket.with_positions(p0)?;

        let noised = self.noised_representation(&ligand, &pocket, &gamma_t.view(), rng)?;
        let (eps_hat, h_hat) =
            self.dynamics
                .predict_with_features(&noised.ligand, &noised.pocket, TimeInput::PerExample(t.view()))?;
        if eps_hat.dim() != noised.eps.dim() {
            return Err(Error::Shape("predicted and target noise differ in shape"));
        }

        let x_hat = self.compute_x_pred(&noised.ligand.x.view(), &eps_hat.view(), &gamma_t.view(), &ligand.batch)?;
        let xh_lig_hat = concat_columns(&x_hat.view(), &ligand.one_hot.view());

        let diff = &noised.eps - &eps_hat;
        let mut error_t = sum_squares_per_example(&diff.view(), &ligand.batch, b);
        let snr_weight: Array1<f32> = gamma_t
            .iter()
            .zip(&gamma_s)
            .map(|(&gt, &gs)| 1.0 - snr(gs - gt))
            .collect();
        let neg_log_constants = -self.log_constants_p_x_given_z0(&ligand.size);
        let kl_prior = self.kl_prior(&ligand);

        let (loss_0_x, loss_0_h) = match mode {
            Mode::Train => {
                let (log_p_x, log_p_h) = self.log_pxh_given_z0_without_constants(
                    &ligand,
                    &noised.ligand,
                    &noised.eps.view(),
                    &eps_hat.view(),
                    &gamma_t.view(),
                )?;
                let is_zero: Array1<f32> = t_int.iter().map(|&ti| if ti == 0 { 1.0 } else { 0.0 }).collect();
                error_t *= &is_zero.mapv(|z| 1.0 - z);
                (-log_p_x * &is_zero, -log_p_h * &is_zero)
            }
            Mode::Eval => {
                let gamma_0 = Array1::from_elem(b, self.schedule.gamma_at(0.0));
                let t_zeros = Array1::<f32>::zeros(b);
                let noised_0 = self.noised_representation(&ligand, &pocket, &gamma_0.view(), rng)?;
                let eps_hat_0 = self.dynamics.predict(
                    &noised_0.ligand,
                    &noised_0.pocket,
                    TimeInput::PerExample(t_zeros.view()),
                )?;
                let (log_p_x, log_p_h) = self.log_pxh_given_z0_without_constants(
                    &ligand,
                    &noised_0.ligand,
                    &noised_0.eps.view(),
                    &eps_hat_0.view(),
                    &gamma_0.view(),
                )?;
                (-log_p_x, -log_p_h)
            }
        };

        let log_pn = if self.cfg.size_prior {
            self.log_pn(&ligand.size, &pocket.size)?
        } else {
            Array1::zeros(b)
        };

        let info = Diagnostics {
            eps_hat_lig_x: mean_abs_per_example(&eps_hat.view(), &ligand.batch, b),
            eps_hat_lig_h: h_hat
                .as_ref()
                .map_or(0.0, |h| mean_abs_per_example(&h.view(), &ligand.batch, b)),
        };

        Ok(ForwardOutput {
            terms: LossTerms {
                delta_log_px,
                error_t,
                snr_weight,
                loss_0_x,
                loss_0_h,
                neg_log_constants,
                kl_prior,
                log_pn,
                t_int,
                size: ligand.size.clone(),
                xh_lig_hat,
            },
            info,
        })
    }
}

/// Mean over examples of the per-example mean of `|v|` (row-averaged first).
fn mean_abs_per_example(values: &ArrayView2<f32>, batch: &[usize], num_examples: usize) -> f32 {
    if values.ncols() == 0 || num_examples == 0 {
        return 0.0;
    }
    let per_row = values.map_axis(Axis(1), |r| r.iter().map(|v| v.abs()).sum::<f32>() / r.len() as f32);
    let mut sums = vec![0.0f64; num_examples];
    let mut counts = vec![0usize; num_examples];
    for (i, &bi) in batch.iter().enumerate() {
        sums[bi] += per_row[i] as f64;
        counts[bi] += 1;
    }
    let total: f64 = sums
        .iter()
        .zip(&counts)
        .map(|(s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
        .sum();
    (total / num_examples as f64) as f32
}
