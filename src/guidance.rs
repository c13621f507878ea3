//! Interfaces of injected collaborators.
//!
//! Implementations live outside this crate. Their errors are passed through unchanged; wrap
//! foreign errors with [`crate::Error::External`].

use crate::Result;
use ndarray::{Array1, Array2, ArrayView2};

/// Gradient of an external energy model with respect to ligand coordinates.
///
/// Queried synchronously inside guided reverse steps with the same noisy state the dynamics
/// network sees. The returned array must have the shape of the ligand positions (`n_lig × 3`).
pub trait EnergyGuider {
    fn energy_gradient(
        &self,
        ligand_xh: &ArrayView2<f32>,
        pocket_xh: &ArrayView2<f32>,
        ligand_batch: &[usize],
        pocket_batch: &[usize],
    ) -> Result<Array2<f32>>;
}

/// Prior over ligand size given pocket size.
pub trait SizeDistribution {
    /// `log p(n_lig | n_pocket)`, one value per example.
    fn log_prob_n1_given_n2(&self, n_ligand: &[usize], n_pocket: &[usize]) -> Result<Array1<f32>>;
}
