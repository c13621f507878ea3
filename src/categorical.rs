//! Categorical node features: one-hot checks, hard decoding and the discretized likelihood.
//!
//! Public invariant: validation never normalizes. Functions that change values say so in
//! their name (`argmax_one_hot`).

use crate::graph::sum_except_batch;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Additive guard inside the log of the discretized likelihood.
///
/// When the two CDF evaluations are numerically equal the bucket mass is exactly zero; the
/// guard caps the log-probability at `ln(1e-10)` instead of `-inf`.
pub const LOG_PROB_EPS: f64 = 1e-10;

/// Check that every row of `h` is a one-hot vector (entries in {0, 1} within `tol`, sum 1).
pub fn validate_one_hot(h: &ArrayView2<f32>, tol: f32) -> Result<()> {
    if h.ncols() == 0 {
        return Err(Error::Domain("one-hot rows must be non-empty"));
    }
    if !(tol >= 0.0) || !tol.is_finite() {
        return Err(Error::Domain("tol must be finite and >= 0"));
    }
    for row in h.rows() {
        if row.iter().any(|&v| !v.is_finite()) {
            return Err(Error::Domain("one-hot row contains non-finite values"));
        }
        if row.iter().any(|&v| v.abs() > tol && (v - 1.0).abs() > tol) {
            return Err(Error::Domain("one-hot entries must be 0 or 1"));
        }
        if (row.sum() - 1.0).abs() > tol {
            return Err(Error::Domain("one-hot row does not sum to 1"));
        }
    }
    Ok(())
}

/// Hard decoding: each row becomes the one-hot vector of its largest entry (first on ties).
pub fn argmax_one_hot(h: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(h.dim());
    for (i, row) in h.rows().into_iter().enumerate() {
        let mut best = 0usize;
        for (k, &v) in row.iter().enumerate() {
            if v > row[best] {
                best = k;
            }
        }
        if h.ncols() > 0 {
            out[[i, best]] = 1.0;
        }
    }
    out
}

/// `Φ(x)` of the standard normal, via `erf`.
pub fn cdf_standard_gaussian(x: f64) -> f64 {
    0.5 * (1.0 + statrs::function::erf::erf(x / std::f64::consts::SQRT_2))
}

/// Row-wise `log Σ exp`.
pub fn log_sum_exp_rows(values: &ArrayView2<f64>) -> Array1<f64> {
    values.map_axis(Axis(1), |row| {
        let m = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !m.is_finite() {
            return m;
        }
        m + row.iter().map(|v| (v - m).exp()).sum::<f64>().ln()
    })
}

/// `log p(h | z_0)` per example.
///
/// Each category owns the unit interval around its integer code. With `estimate` the
/// unnormalized feature channel of `z_0` and `sigma` the noise level on that scale, the
/// unnormalized mass of category `c` is `Φ((ĥ_c - 1 + ½)/σ) - Φ((ĥ_c - 1 - ½)/σ)`; masses are
/// normalized over categories with log-sum-exp and the log-probability of the true category
/// (`target`, unnormalized one-hot) is summed per example.
pub fn discretized_log_likelihood(
    estimate: &ArrayView2<f32>,
    target: &ArrayView2<f32>,
    sigma: &ArrayView2<f32>,
    batch: &[usize],
    num_examples: usize,
) -> Result<Array1<f32>> {
    if estimate.dim() != target.dim() {
        return Err(Error::Shape("estimate and target must have the same shape"));
    }
    if sigma.nrows() != estimate.nrows() || sigma.ncols() != 1 {
        return Err(Error::Shape("sigma must be one value per node"));
    }
    if batch.len() != estimate.nrows() {
        return Err(Error::Shape("batch must have one entry per node"));
    }

    let mut log_mass = Array2::<f64>::zeros(estimate.dim());
    for ((i, k), v) in log_mass.indexed_iter_mut() {
        let centered = estimate[[i, k]] as f64 - 1.0;
        let s = sigma[[i, 0]] as f64;
        let mass = cdf_standard_gaussian((centered + 0.5) / s) - cdf_standard_gaussian((centered - 0.5) / s);
        *v = (mass + LOG_PROB_EPS).ln();
    }
    let log_z = log_sum_exp_rows(&log_mass.view());

    let per_node: Array1<f32> = log_mass
        .rows()
        .into_iter()
        .zip(target.rows())
        .zip(log_z.iter())
        .map(|((lp, w), z)| {
            lp.iter()
                .zip(w.iter())
                .map(|(&l, &w)| (l - z) * w as f64)
                .sum::<f64>() as f32
        })
        .collect();
    Ok(sum_except_batch(&per_node.view(), batch, num_examples))
}
