//! Flattened graph batches and reductions keyed by batch index.
//!
//! Node arrays of several examples are concatenated along the row axis. The batch index
//! (`batch[i]` = example of node `i`) is the only record of example boundaries: every
//! per-example reduction in this crate goes through the helpers below, never through
//! implicit row ordering.

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Spatial dimensionality of node positions.
pub const N_DIMS: usize = 3;

/// One side of the conditional system (ligand atoms or pocket residues).
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// Node positions, `n × 3`.
    pub x: Array2<f32>,
    /// Categorical node features (one-hot, possibly normalized), `n × nf`.
    pub one_hot: Array2<f32>,
    /// Example index of every node, length `n`.
    pub batch: Vec<usize>,
    /// Node count per example, length `B`.
    pub size: Vec<usize>,
}

impl GraphBatch {
    /// Build a batch from explicit batch indices.
    ///
    /// `num_examples` must cover every index in `batch`; examples with zero nodes are
    /// rejected because their center of mass is undefined.
    pub fn new(
        x: Array2<f32>,
        one_hot: Array2<f32>,
        batch: Vec<usize>,
        num_examples: usize,
    ) -> Result<Self> {
        if x.ncols() != N_DIMS {
            return Err(Error::Shape("positions must have 3 columns"));
        }
        if one_hot.nrows() != x.nrows() || batch.len() != x.nrows() {
            return Err(Error::Shape("x, one_hot and batch must have the same length"));
        }
        if batch.iter().any(|&b| b >= num_examples) {
            return Err(Error::Domain("batch index out of range"));
        }
        let mut size = vec![0usize; num_examples];
        for &b in &batch {
            size[b] += 1;
        }
        if size.iter().any(|&s| s == 0) {
            return Err(Error::Domain("every example needs at least one node"));
        }
        Ok(Self {
            x,
            one_hot,
            batch,
            size,
        })
    }

    /// Build a batch whose nodes are laid out contiguously, example by example.
    pub fn from_sizes(x: Array2<f32>, one_hot: Array2<f32>, sizes: &[usize]) -> Result<Self> {
        let batch = batch_index_from_sizes(sizes);
        if batch.len() != x.nrows() {
            return Err(Error::Shape("sum of sizes must match the number of nodes"));
        }
        Self::new(x, one_hot, batch, sizes.len())
    }

    pub fn num_nodes(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_examples(&self) -> usize {
        self.size.len()
    }

    /// Width of the categorical feature channel.
    pub fn nf(&self) -> usize {
        self.one_hot.ncols()
    }

    /// Same nodes and features, new positions.
    pub fn with_positions(&self, x: Array2<f32>) -> Result<Self> {
        if x.dim() != self.x.dim() {
            return Err(Error::Shape("replacement positions must keep the node layout"));
        }
        Ok(Self {
            x,
            one_hot: self.one_hot.clone(),
            batch: self.batch.clone(),
            size: self.size.clone(),
        })
    }

    /// `[x | one_hot]` as a single `n × (3 + nf)` matrix.
    pub fn xh(&self) -> Array2<f32> {
        concat_columns(&self.x.view(), &self.one_hot.view())
    }
}

/// Contiguous batch index for examples of the given sizes: `[2, 1] -> [0, 0, 1]`.
pub fn batch_index_from_sizes(sizes: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(sizes.iter().sum());
    for (b, &n) in sizes.iter().enumerate() {
        out.extend(std::iter::repeat(b).take(n));
    }
    out
}

/// Per-example row sums: `out[b] = Σ_{i: batch[i] = b} values[i]`.
pub fn scatter_sum(values: &ArrayView2<f32>, batch: &[usize], num_examples: usize) -> Array2<f32> {
    debug_assert_eq!(values.nrows(), batch.len());
    let d = values.ncols();
    let mut acc = Array2::<f64>::zeros((num_examples, d));
    for (i, &b) in batch.iter().enumerate() {
        for k in 0..d {
            acc[[b, k]] += values[[i, k]] as f64;
        }
    }
    acc.mapv(|v| v as f32)
}

/// Per-example row means. Examples without nodes get a zero row.
pub fn scatter_mean(
    values: &ArrayView2<f32>,
    batch: &[usize],
    num_examples: usize,
) -> Array2<f32> {
    let mut sums = scatter_sum(values, batch, num_examples);
    let counts = counts_per_example(batch, num_examples);
    for (b, mut row) in sums.axis_iter_mut(Axis(0)).enumerate() {
        if counts[b] > 0 {
            row /= counts[b] as f32;
        }
    }
    sums
}

/// Reduce per-node scalars to per-example sums.
pub fn sum_except_batch(
    values: &ArrayView1<f32>,
    batch: &[usize],
    num_examples: usize,
) -> Array1<f32> {
    debug_assert_eq!(values.len(), batch.len());
    let mut acc = vec![0.0f64; num_examples];
    for (i, &b) in batch.iter().enumerate() {
        acc[b] += values[i] as f64;
    }
    acc.into_iter().map(|v| v as f32).collect()
}

/// Squared row norms, summed per example: `Σ_{i ∈ b} ||values_i||²`.
pub fn sum_squares_per_example(
    values: &ArrayView2<f32>,
    batch: &[usize],
    num_examples: usize,
) -> Array1<f32> {
    let per_node = values.map_axis(Axis(1), |row| row.iter().map(|v| v * v).sum::<f32>());
    sum_except_batch(&per_node.view(), batch, num_examples)
}

pub fn counts_per_example(batch: &[usize], num_examples: usize) -> Vec<usize> {
    let mut counts = vec![0usize; num_examples];
    for &b in batch {
        counts[b] += 1;
    }
    counts
}

/// Rank of each node within its example, in order of appearance.
pub fn node_ranks(batch: &[usize], num_examples: usize) -> Vec<usize> {
    let mut seen = vec![0usize; num_examples];
    batch
        .iter()
        .map(|&b| {
            let r = seen[b];
            seen[b] += 1;
            r
        })
        .collect()
}

/// Broadcast a per-example row matrix back to nodes: `out[i] = per_example[batch[i]]`.
pub fn gather_rows(per_example: &ArrayView2<f32>, batch: &[usize]) -> Array2<f32> {
    per_example.select(Axis(0), batch)
}

/// Broadcast a per-example scalar back to nodes.
pub fn gather(per_example: &ArrayView1<f32>, batch: &[usize]) -> Array1<f32> {
    batch.iter().map(|&b| per_example[b]).collect()
}

pub fn concat_columns(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    debug_assert_eq!(a.nrows(), b.nrows());
    let mut out = Array2::<f32>::zeros((a.nrows(), a.ncols() + b.ncols()));
    out.slice_mut(ndarray::s![.., ..a.ncols()]).assign(a);
    out.slice_mut(ndarray::s![.., a.ncols()..]).assign(b);
    out
}

pub fn concat_rows(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    debug_assert_eq!(a.ncols(), b.ncols());
    let mut out = Array2::<f32>::zeros((a.nrows() + b.nrows(), a.ncols()));
    out.slice_mut(ndarray::s![..a.nrows(), ..]).assign(a);
    out.slice_mut(ndarray::s![a.nrows().., ..]).assign(b);
    out
}
