//! Reverse-chain sampling of ligands inside a fixed pocket.
//!
//! The chain runs `T → T-1 → … → 1` with [`ConditionalDiffusion::sample_p_zs_given_zt`] and
//! decodes `1 → 0` with [`ConditionalDiffusion::sample_p_xh_given_z0`]. Steps are strictly
//! sequential; only the batch dimension is processed together.

use crate::com::{max_center_drift, CoMPolicy};
use crate::diffusion::ConditionalDiffusion;
use crate::dynamics::Dynamics;
use crate::graph::{concat_columns, gather_rows, scatter_mean, GraphBatch, N_DIMS};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SamplingConfig {
    /// Number of retained states; must divide the number of steps.
    pub return_frames: usize,
    /// Number of reverse steps. `None` uses the model's `T`.
    pub timesteps: Option<usize>,
    /// Query the energy guider during reverse steps.
    pub guided: bool,
    pub gradient_scale: f32,
    /// Steps to take unguided before guidance kicks in.
    pub guidance_starts_at: usize,
    /// Reuse one noise draw across the batch. Not implemented; requesting it fails.
    pub fix_noise: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            return_frames: 1,
            timesteps: None,
            guided: false,
            gradient_scale: 1.0,
            guidance_starts_at: 0,
            fix_noise: false,
        }
    }
}

impl SamplingConfig {
    /// Check against the resolved number of steps.
    pub fn validate(&self, timesteps: usize) -> Result<()> {
        if timesteps == 0 {
            return Err(Error::Domain("timesteps must be >= 1"));
        }
        if self.return_frames == 0 || self.return_frames > timesteps {
            return Err(Error::Domain("return_frames must be in 1..=timesteps"));
        }
        if timesteps % self.return_frames != 0 {
            return Err(Error::Domain("return_frames must divide timesteps"));
        }
        if !self.gradient_scale.is_finite() {
            return Err(Error::Domain("gradient_scale must be finite"));
        }
        Ok(())
    }
}

/// Sampled trajectories, unnormalized `[x | h]` per frame.
#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// From the noisiest retained state to the final sample (last element).
    pub ligand_frames: Vec<Array2<f32>>,
    pub pocket_frames: Vec<Array2<f32>>,
    pub ligand_batch: Vec<usize>,
    pub pocket_batch: Vec<usize>,
}

impl SampleOutput {
    /// The fully denoised ligand.
    pub fn final_ligand(&self) -> Option<&Array2<f32>> {
        self.ligand_frames.last()
    }

    pub fn final_pocket(&self) -> Option<&Array2<f32>> {
        self.pocket_frames.last()
    }
}

/// Re-center the ligand (pocket along) if its per-example sum drifted beyond `tolerance`.
///
/// Only policies that keep the ligand at zero mean are corrected. Returns whether a
/// correction was applied.
pub fn correct_com_drift<P: CoMPolicy + ?Sized>(
    policy: &P,
    ligand_x: &mut Array2<f32>,
    pocket_x: &mut Array2<f32>,
    ligand_batch: &[usize],
    pocket_batch: &[usize],
    num_examples: usize,
    tolerance: f32,
) -> bool {
    if !policy.enforces_zero_mean() {
        return false;
    }
    let drift = max_center_drift(&ligand_x.view(), ligand_batch, num_examples);
    if drift <= tolerance {
        return false;
    }
    tracing::warn!(drift, tolerance, "center-of-mass drift after sampling, projecting positions");
    policy.remove_mean(ligand_x, pocket_x, ligand_batch, pocket_batch, num_examples);
    true
}

impl<D: Dynamics, P: CoMPolicy> ConditionalDiffusion<D, P> {
    /// Generate ligands with the given composition inside each pocket.
    ///
    /// `pocket` is unnormalized; `ligand_one_hot` fixes the atom types and `ligand_batch`
    /// assigns ligand nodes to pockets. Positions start as unit Gaussian noise around each
    /// pocket's center.
    pub fn sample_given_pocket<R: rand::Rng + ?Sized>(
        &self,
        pocket: &GraphBatch,
        ligand_one_hot: &ArrayView2<f32>,
        ligand_batch: &[usize],
        cfg: &SamplingConfig,
        rng: &mut R,
    ) -> Result<SampleOutput> {
        if cfg.fix_noise {
            return Err(Error::NotSupported("fixed-noise sampling"));
        }
        if cfg.guided && !self.has_energy_guider() {
            return Err(Error::NotSupported("guidance requested without an energy guider"));
        }
        let timesteps = cfg.timesteps.unwrap_or(self.timesteps());
        cfg.validate(timesteps)?;
        if pocket.nf() != self.config().residue_nf {
            return Err(Error::Shape("pocket feature width does not match residue_nf"));
        }
        if ligand_one_hot.ncols() != self.config().atom_nf {
            return Err(Error::Shape("ligand feature width does not match atom_nf"));
        }

        let b = pocket.num_examples();
        let n_lig = ligand_one_hot.nrows();
        let ligand = GraphBatch::new(
            Array2::zeros((n_lig, N_DIMS)),
            ligand_one_hot.to_owned(),
            ligand_batch.to_vec(),
            b,
        )?;

        let mut lig_x = ligand.x.clone();
        let mut pocket_x = pocket.x.clone();
        self.policy()
            .center_on_pocket(&mut lig_x, &mut pocket_x, &ligand.batch, &pocket.batch, b);
        let (ligand, pocket) = self
            .normalizer()
            .normalize(&ligand.with_positions(lig_x)?, &pocket.with_positions(pocket_x)?);

        let center = scatter_mean(&pocket.x.view(), &pocket.batch, b);
        let mu = gather_rows(&center.view(), &ligand.batch);
        let ones = Array1::<f32>::ones(b);
        let (z_x, pocket_x) = self.sample_normal_zero_com(&mu.view(), &ligand, &pocket, &ones.view(), false, rng)?;
        let mut z = ligand.with_positions(z_x)?;
        let mut pocket = pocket.with_positions(pocket_x)?;
        self.policy().assert_mean_zero(&z.x.view(), &z.batch, b)?;

        let rf = cfg.return_frames;
        let mut ligand_frames = vec![Array2::<f32>::zeros((n_lig, N_DIMS + ligand.nf())); rf];
        let mut pocket_frames = vec![Array2::<f32>::zeros((pocket.num_nodes(), N_DIMS + pocket.nf())); rf];

        let guidance_at = |t_int: usize| {
            let steps_taken = timesteps - t_int;
            (cfg.guided && steps_taken >= cfg.guidance_starts_at).then_some(cfg.gradient_scale)
        };

        for s in (0..timesteps).rev() {
            let s_arr = Array1::from_elem(b, s as f32 / timesteps as f32);
            let t_arr = Array1::from_elem(b, (s + 1) as f32 / timesteps as f32);
            tracing::trace!(step = s + 1, timesteps, "reverse diffusion step");
            let (z_next, pocket_next) =
                self.sample_p_zs_given_zt(&s_arr.view(), &t_arr.view(), &z, &pocket, guidance_at(s + 1), rng)?;
            z = z_next;
            pocket = pocket_next;

            if (s * rf) % timesteps == 0 {
                let idx = rf - 1 - s * rf / timesteps;
                ligand_frames[idx] = self.unnormalized_xh(&z);
                pocket_frames[idx] = self.unnormalized_xh(&pocket);
            }
        }

        let decoded = self.sample_p_xh_given_z0(&z, &pocket, guidance_at(0), rng)?;
        let (mut ligand_x, mut pocket_x) = (decoded.ligand_x, decoded.pocket_x);
        self.policy().assert_mean_zero(&ligand_x.view(), &z.batch, b)?;

        if rf == 1 {
            correct_com_drift(
                self.policy(),
                &mut ligand_x,
                &mut pocket_x,
                &z.batch,
                &pocket.batch,
                b,
                self.config().drift_tolerance,
            );
        }

        ligand_frames[rf - 1] = concat_columns(&ligand_x.view(), &decoded.ligand_h.view());
        pocket_frames[rf - 1] = concat_columns(&pocket_x.view(), &decoded.pocket_h.view());
        tracing::debug!(examples = b, timesteps, frames = rf, "sampling finished");

        Ok(SampleOutput {
            ligand_frames,
            pocket_frames,
            ligand_batch: z.batch,
            pocket_batch: pocket.batch,
        })
    }

    fn unnormalized_xh(&self, g: &GraphBatch) -> Array2<f32> {
        let (x, h) = self.normalizer().unnormalize(&g.x.view(), &g.one_hot.view());
        concat_columns(&x.view(), &h.view())
    }
}
