//! Fixed affine normalization of coordinates and categorical features.
//!
//! `x ← x / x_scale`, `h ← (h - h_bias) / h_scale`. The scales enter the likelihood:
//! `x_scale` through the change-of-variables term `delta_log_px`, `h_scale`/`h_bias` through
//! the zero-step categorical likelihood, which is evaluated on the integer (unnormalized) scale.

use crate::graph::GraphBatch;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NormalizerConfig {
    pub x_scale: f32,
    pub h_scale: f32,
    pub h_bias: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            x_scale: 1.0,
            h_scale: 4.0,
            h_bias: 0.0,
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.x_scale > 0.0) || !self.x_scale.is_finite() {
            return Err(Error::Domain("x_scale must be positive and finite"));
        }
        if !(self.h_scale > 0.0) || !self.h_scale.is_finite() {
            return Err(Error::Domain("h_scale must be positive and finite"));
        }
        if !self.h_bias.is_finite() {
            return Err(Error::Domain("h_bias must be finite"));
        }
        Ok(())
    }
}

/// Affine normalizer; `unnormalize` is the exact inverse of `normalize`.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    cfg: NormalizerConfig,
}

impl Normalizer {
    pub fn new(cfg: NormalizerConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.cfg
    }

    pub fn x_scale(&self) -> f32 {
        self.cfg.x_scale
    }

    pub fn h_scale(&self) -> f32 {
        self.cfg.h_scale
    }

    pub fn h_bias(&self) -> f32 {
        self.cfg.h_bias
    }

    pub fn normalize_x(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.mapv(|v| v / self.cfg.x_scale)
    }

    pub fn normalize_h(&self, h: &ArrayView2<f32>) -> Array2<f32> {
        h.mapv(|v| (v - self.cfg.h_bias) / self.cfg.h_scale)
    }

    /// Normalize both sides of the conditional system.
    pub fn normalize(&self, ligand: &GraphBatch, pocket: &GraphBatch) -> (GraphBatch, GraphBatch) {
        (self.normalize_batch(ligand), self.normalize_batch(pocket))
    }

    pub fn normalize_batch(&self, g: &GraphBatch) -> GraphBatch {
        GraphBatch {
            x: self.normalize_x(&g.x.view()),
            one_hot: self.normalize_h(&g.one_hot.view()),
            batch: g.batch.clone(),
            size: g.size.clone(),
        }
    }

    /// Inverse of [`Self::normalize_x`] / [`Self::normalize_h`].
    pub fn unnormalize(&self, x: &ArrayView2<f32>, h: &ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        (
            x.mapv(|v| v * self.cfg.x_scale),
            h.mapv(|v| v * self.cfg.h_scale + self.cfg.h_bias),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_nonpositive_scales() {
        let cfg = NormalizerConfig {
            x_scale: 0.0,
            ..NormalizerConfig::default()
        };
        assert!(Normalizer::new(cfg).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_unnormalize_inverts_normalize(
            x_scale in 0.1f32..10.0,
            h_scale in 0.1f32..10.0,
            h_bias in -2.0f32..2.0,
            vals in prop::collection::vec(-20.0f32..20.0, 12),
        ) {
            let n = Normalizer::new(NormalizerConfig { x_scale, h_scale, h_bias }).unwrap();
            let x = Array2::from_shape_vec((4, 3), vals.clone()).unwrap();
            let h = Array2::from_shape_vec((3, 4), vals).unwrap();
            let (x2, h2) = n.unnormalize(&n.normalize_x(&x.view()).view(), &n.normalize_h(&h.view()).view());
            for (a, b) in x.iter().zip(x2.iter()) {
                prop_assert!((a - b).abs() <= 1e-4 * (1.0 + a.abs()));
            }
            for (a, b) in h.iter().zip(h2.iter()) {
                prop_assert!((a - b).abs() <= 1e-4 * (1.0 + a.abs()));
            }
        }
    }
}
