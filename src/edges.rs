//! Edge construction over the combined `[ligand; pocket]` node set.
//!
//! Edges never cross example boundaries. Self pairs are included (their displacement is zero
//! and contributes nothing to coordinate updates). Edges are emitted in row-major order.

use crate::graph::N_DIMS;
use crate::nn::PositionalEncoding;
use ndarray::{Array1, Array2, ArrayView2};

/// Directed edge list; messages flow from `col` into `row`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Edges {
    pub row: Vec<usize>,
    pub col: Vec<usize>,
}

impl Edges {
    pub fn len(&self) -> usize {
        self.row.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row.is_empty()
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.row.iter().zip(&self.col).any(|(&r, &c)| r == i && c == j)
    }

    fn push(&mut self, i: usize, j: usize) {
        self.row.push(i);
        self.col.push(j);
    }
}

/// How the combined graph is wired within each example.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeMode {
    #[default]
    FullyConnected,
    /// Drop pocket–pocket edges longer than the cutoff.
    PocketCutoff(f32),
}

impl EdgeMode {
    /// Edges over `[ligand; pocket]`.
    pub fn build(self, ligand_batch: &[usize], pocket_batch: &[usize], pocket_x: &ArrayView2<f32>) -> Edges {
        match self {
            EdgeMode::FullyConnected => {
                let batch: Vec<usize> = ligand_batch.iter().chain(pocket_batch).copied().collect();
                fully_connected(&batch)
            }
            EdgeMode::PocketCutoff(cutoff) => pocket_cutoff(ligand_batch, pocket_batch, pocket_x, cutoff),
        }
    }
}

/// Node lists per example, in index order.
fn members(batch: &[usize]) -> Vec<Vec<usize>> {
    let n_examples = batch.iter().max().map_or(0, |&m| m + 1);
    let mut out = vec![Vec::new(); n_examples];
    for (i, &b) in batch.iter().enumerate() {
        out[b].push(i);
    }
    out
}

/// All ordered pairs `(i, j)` with `batch[i] == batch[j]`.
pub fn fully_connected(batch: &[usize]) -> Edges {
    let groups = members(batch);
    let mut edges = Edges::default();
    for (i, &b) in batch.iter().enumerate() {
        for &j in &groups[b] {
            edges.push(i, j);
        }
    }
    edges
}

/// Fully connected within each example, except pocket–pocket pairs farther apart than `cutoff`.
///
/// Node `i < n_lig` is ligand node `i`; node `n_lig + k` is pocket node `k`. Ligand–ligand and
/// ligand–pocket edges are kept regardless of distance.
pub fn pocket_cutoff(
    ligand_batch: &[usize],
    pocket_batch: &[usize],
    pocket_x: &ArrayView2<f32>,
    cutoff: f32,
) -> Edges {
    let n_lig = ligand_batch.len();
    let batch: Vec<usize> = ligand_batch.iter().chain(pocket_batch).copied().collect();
    let groups = members(&batch);
    let cutoff2 = cutoff * cutoff;
    let mut edges = Edges::default();
    for (i, &b) in batch.iter().enumerate() {
        for &j in &groups[b] {
            if i >= n_lig && j >= n_lig {
                let (pi, pj) = (i - n_lig, j - n_lig);
                let mut d2 = 0.0f32;
                for c in 0..N_DIMS {
                    let v = pocket_x[[pi, c]] - pocket_x[[pj, c]];
                    d2 += v * v;
                }
                if d2 > cutoff2 {
                    continue;
                }
            }
            edges.push(i, j);
        }
    }
    edges
}

/// Edge attributes: positional encoding of the signed index offset `i - j` on ligand–ligand
/// edges, zero rows elsewhere.
pub fn ligand_offset_attributes(edges: &Edges, n_lig: usize, encoding: &PositionalEncoding) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((edges.len(), encoding.dim()));
    let lig_edges: Vec<usize> = (0..edges.len())
        .filter(|&k| edges.row[k] < n_lig && edges.col[k] < n_lig)
        .collect();
    let offsets: Array1<f32> = lig_edges
        .iter()
        .map(|&k| edges.row[k] as f32 - edges.col[k] as f32)
        .collect();
    let enc = encoding.forward(&offsets.view());
    for (r, &k) in lig_edges.iter().enumerate() {
        out.row_mut(k).assign(&enc.row(r));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn fully_connected_respects_examples() {
        let e = fully_connected(&[0, 1, 0]);
        assert_eq!(e.len(), 5);
        assert!(e.contains(0, 2) && e.contains(2, 0) && e.contains(1, 1));
        assert!(!e.contains(0, 1) && !e.contains(1, 2));
    }

    #[test]
    fn cutoff_prunes_only_distant_pocket_pairs() {
        let lig_batch = vec![0, 0];
        let pocket_batch = vec![0, 0, 0];
        let pocket_x = array![[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [100.0, 0.0, 0.0]];
        let e = pocket_cutoff(&lig_batch, &pocket_batch, &pocket_x.view(), 5.0);
        // pocket nodes are 2, 3, 4
        assert!(e.contains(2, 3) && e.contains(3, 2));
        assert!(!e.contains(2, 4) && !e.contains(4, 3));
        assert!(e.contains(4, 4));
        // ligand edges survive any distance
        for i in 0..2 {
            for j in 0..5 {
                assert!(e.contains(i, j) && e.contains(j, i));
            }
        }
    }

    #[test]
    fn edge_mode_dispatches() {
        let pocket_x = array![[0.0f32, 0.0, 0.0], [50.0, 0.0, 0.0]];
        let full = EdgeMode::FullyConnected.build(&[0], &[0, 0], &pocket_x.view());
        assert_eq!(full.len(), 9);
        let cut = EdgeMode::PocketCutoff(10.0).build(&[0], &[0, 0], &pocket_x.view());
        assert_eq!(cut.len(), 7);
        assert!(!cut.contains(1, 2));
    }

    #[test]
    fn offset_attributes_only_on_ligand_pairs() {
        let e = fully_connected(&[0, 0, 0]);
        let pe = PositionalEncoding::new(4, 1.0 / 9.0, 1.0);
        let attr = ligand_offset_attributes(&e, 2, &pe);
        assert_eq!(attr.dim(), (9, 4));
        // (0, 2) involves node 2 which is not a ligand node
        let k = (0..e.len()).find(|&k| e.row[k] == 0 && e.col[k] == 2).unwrap();
        assert!(attr.row(k).iter().all(|&v| v == 0.0));
        // (1, 0) has offset 1 -> sin(1) in the first channel
        let k = (0..e.len()).find(|&k| e.row[k] == 1 && e.col[k] == 0).unwrap();
        assert!((attr[[k, 0]] - 1.0f32.sin()).abs() < 1e-6);
    }
}
