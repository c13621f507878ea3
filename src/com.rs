//! Center-of-mass policies.
//!
//! Positions are only defined up to a global translation. The diffusion process removes that
//! freedom in one of two ways:
//!
//! - [`SubspaceCoMPolicy`]: every example's *ligand* center of mass is held at zero. The pocket
//!   is shifted by the same offset, so relative geometry is untouched. Likelihoods live on the
//!   `(n - 1)·3`-dimensional zero-mean subspace.
//! - [`IdentityCoMPolicy`]: no projection. Inputs are centered once on the pocket center of
//!   mass ([`CoMPolicy::center_on_pocket`]) and the dynamics network's equivariance does the
//!   rest. Likelihoods use the full `n·3` dimensions.

use crate::graph::{gather_rows, scatter_mean, scatter_sum, N_DIMS};
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2, Axis};

/// Relative tolerance of [`CoMPolicy::assert_mean_zero`].
pub const MEAN_ZERO_REL_TOL: f32 = 1e-2;

pub trait CoMPolicy: std::fmt::Debug {
    /// Remove the per-example ligand mean from ligand and pocket positions.
    fn remove_mean(
        &self,
        ligand_x: &mut Array2<f32>,
        pocket_x: &mut Array2<f32>,
        ligand_batch: &[usize],
        pocket_batch: &[usize],
        num_examples: usize,
    );

    /// Fail with [`Error::MeanNotZero`] if the invariant this policy maintains is violated.
    fn assert_mean_zero(&self, x: &ArrayView2<f32>, batch: &[usize], num_examples: usize)
        -> Result<()>;

    /// Degrees of freedom of `n_nodes` positions under this policy.
    fn subspace_dimensionality(&self, n_nodes: usize) -> usize;

    /// One-off centering applied before any diffusion call.
    fn center_on_pocket(
        &self,
        ligand_x: &mut Array2<f32>,
        pocket_x: &mut Array2<f32>,
        ligand_batch: &[usize],
        pocket_batch: &[usize],
        num_examples: usize,
    );

    /// Whether ligand positions are kept at zero mean (drift checks only make sense then).
    fn enforces_zero_mean(&self) -> bool;
}

/// Zero-mean subspace on the ligand; the pocket follows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubspaceCoMPolicy;

impl CoMPolicy for SubspaceCoMPolicy {
    fn remove_mean(
        &self,
        ligand_x: &mut Array2<f32>,
        pocket_x: &mut Array2<f32>,
        ligand_batch: &[usize],
        pocket_batch: &[usize],
        num_examples: usize,
    ) {
        let mean = scatter_mean(&ligand_x.view(), ligand_batch, num_examples);
        *ligand_x -= &gather_rows(&mean.view(), ligand_batch);
        *pocket_x -= &gather_rows(&mean.view(), pocket_batch);
    }

    fn assert_mean_zero(
        &self,
        x: &ArrayView2<f32>,
        batch: &[usize],
        num_examples: usize,
    ) -> Result<()> {
        assert_mean_zero(x, batch, num_examples)
    }

    fn subspace_dimensionality(&self, n_nodes: usize) -> usize {
        n_nodes.saturating_sub(1) * N_DIMS
    }

    fn center_on_pocket(
        &self,
        _ligand_x: &mut Array2<f32>,
        _pocket_x: &mut Array2<f32>,
        _ligand_batch: &[usize],
        _pocket_batch: &[usize],
        _num_examples: usize,
    ) {
    }

    fn enforces_zero_mean(&self) -> bool {
        true
    }
}

/// No projection; translation invariance comes from pocket centering plus equivariance.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCoMPolicy;

impl CoMPolicy for IdentityCoMPolicy {
    fn remove_mean(
        &self,
        _ligand_x: &mut Array2<f32>,
        _pocket_x: &mut Array2<f32>,
        _ligand_batch: &[usize],
        _pocket_batch: &[usize],
        _num_examples: usize,
    ) {
    }

    fn assert_mean_zero(
        &self,
        _x: &ArrayView2<f32>,
        _batch: &[usize],
        _num_examples: usize,
    ) -> Result<()> {
        Ok(())
    }

    fn subspace_dimensionality(&self, n_nodes: usize) -> usize {
        n_nodes * N_DIMS
    }

    fn center_on_pocket(
        &self,
        ligand_x: &mut Array2<f32>,
        pocket_x: &mut Array2<f32>,
        ligand_batch: &[usize],
        pocket_batch: &[usize],
        num_examples: usize,
    ) {
        let com = scatter_mean(&pocket_x.view(), pocket_batch, num_examples);
        *ligand_x -= &gather_rows(&com.view(), ligand_batch);
        *pocket_x -= &gather_rows(&com.view(), pocket_batch);
    }

    fn enforces_zero_mean(&self) -> bool {
        false
    }
}

/// Per-example check `|Σ x| / (max |x| + 1e-10) < 1e-2`.
pub fn assert_mean_zero(x: &ArrayView2<f32>, batch: &[usize], num_examples: usize) -> Result<()> {
    let sums = scatter_sum(x, batch, num_examples);
    let mut largest = vec![0.0f32; num_examples];
    for (i, &b) in batch.iter().enumerate() {
        for &v in x.row(i) {
            largest[b] = largest[b].max(v.abs());
        }
    }
    for (b, row) in sums.axis_iter(Axis(0)).enumerate() {
        let err = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let rel_error = err / (largest[b] + 1e-10);
        if !(rel_error < MEAN_ZERO_REL_TOL) {
            return Err(Error::MeanNotZero {
                example: b,
                rel_error,
            });
        }
    }
    Ok(())
}

/// Largest absolute coordinate of any per-example position sum.
pub fn max_center_drift(x: &ArrayView2<f32>, batch: &[usize], num_examples: usize) -> f32 {
    scatter_sum(x, batch, num_examples)
        .iter()
        .fold(0.0f32, |m, v| m.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::batch_index_from_sizes;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn random_positions(n: usize, seed: u64, offset: f32) -> Array2<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((n, 3), |_| {
            let z: f32 = StandardNormal.sample(&mut rng);
            z + offset
        })
    }

    #[test]
    fn subspace_policy_preserves_ligand_pocket_offsets() {
        let lig_batch = batch_index_from_sizes(&[3, 2]);
        let pocket_batch = batch_index_from_sizes(&[4, 4]);
        let mut lig = random_positions(5, 1, 7.0);
        let mut pocket = random_positions(8, 2, -3.0);
        let before = &lig.row(0).to_owned() - &pocket.row(0);

        SubspaceCoMPolicy.remove_mean(&mut lig, &mut pocket, &lig_batch, &pocket_batch, 2);

        SubspaceCoMPolicy
            .assert_mean_zero(&lig.view(), &lig_batch, 2)
            .unwrap();
        let after = &lig.row(0).to_owned() - &pocket.row(0);
        for k in 0..3 {
            assert!((before[k] - after[k]).abs() < 1e-4);
        }
    }

    #[test]
    fn single_node_example_is_exactly_zero() {
        let mut lig = random_positions(1, 3, 2.5);
        let mut pocket = random_positions(2, 4, 0.0);
        SubspaceCoMPolicy.remove_mean(&mut lig, &mut pocket, &[0], &[0, 0], 1);
        assert!(lig.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn identity_policy_centers_on_pocket_only_when_asked() {
        let lig_batch = vec![0, 0];
        let pocket_batch = vec![0, 0, 0];
        let mut lig = random_positions(2, 5, 4.0);
        let mut pocket = random_positions(3, 6, 4.0);
        let lig0 = lig.clone();

        IdentityCoMPolicy.remove_mean(&mut lig, &mut pocket, &lig_batch, &pocket_batch, 1);
        assert_eq!(lig, lig0);

        IdentityCoMPolicy.center_on_pocket(&mut lig, &mut pocket, &lig_batch, &pocket_batch, 1);
        assert!(max_center_drift(&pocket.view(), &pocket_batch, 1) < 1e-4);
        assert_eq!(IdentityCoMPolicy.subspace_dimensionality(4), 12);
        assert_eq!(SubspaceCoMPolicy.subspace_dimensionality(4), 9);
    }

    #[test]
    fn off_center_positions_fail_the_assertion() {
        let x = random_positions(4, 7, 5.0);
        let err = assert_mean_zero(&x.view(), &[0, 0, 0, 0], 1).unwrap_err();
        assert!(matches!(err, Error::MeanNotZero { example: 0, .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_remove_mean_zeroes_every_example(
            sizes in prop::collection::vec(1usize..8, 1..5),
            seed in any::<u64>(),
            offset in -50.0f32..50.0,
        ) {
            let lig_batch = batch_index_from_sizes(&sizes);
            let pocket_batch = batch_index_from_sizes(&vec![3; sizes.len()]);
            let mut lig = random_positions(lig_batch.len(), seed, offset);
            let mut pocket = random_positions(pocket_batch.len(), seed ^ 1, 0.0);
            SubspaceCoMPolicy.remove_mean(&mut lig, &mut pocket, &lig_batch, &pocket_batch, sizes.len());
            prop_assert!(max_center_drift(&lig.view(), &lig_batch, sizes.len()) <= 1e-3);
        }
    }
}
