//! E(n)-equivariant message passing over flattened node sets.
//!
//! Node features `h` are invariant; positions `x` are updated only by sums of relative
//! displacements `x_i - x_j` weighted by invariant per-edge scalars, so rotating or translating
//! the input rotates or translates the output and leaves `h` unchanged.
//!
//! Edges are directed `(row, col)` pairs; messages are aggregated at `row`.

use crate::edges::Edges;
use crate::graph::concat_columns;
use crate::nn::{gather, segment_sum, Activation, Linear, Mlp, SinusoidalDistanceEmbedding};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// How messages are reduced at the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Aggregation {
    /// Sum, divided by a constant `normalization_factor`.
    #[default]
    Sum,
    /// Mean over incoming edges.
    Mean,
}

/// Shared hyperparameters of the message-passing stack.
#[derive(Debug, Clone, Copy)]
pub struct MessagePassing {
    pub aggregation: Aggregation,
    pub normalization_factor: f32,
    pub act: Activation,
}

impl MessagePassing {
    fn aggregate(&self, values: &ArrayView2<f32>, row: &[usize], num_nodes: usize) -> Array2<f32> {
        let mut agg = segment_sum(values, row, num_nodes);
        match self.aggregation {
            Aggregation::Sum => agg /= self.normalization_factor,
            Aggregation::Mean => {
                let mut counts = vec![0usize; num_nodes];
                for &r in row {
                    counts[r] += 1;
                }
                for (i, mut r) in agg.axis_iter_mut(Axis(0)).enumerate() {
                    r /= counts[i].max(1) as f32;
                }
            }
        }
        agg
    }
}

/// `radial_ij = |x_i - x_j|²` and the normalized displacement
/// `(x_i - x_j) / (sqrt(radial + 1e-8) + norm_constant)`.
pub fn coord2diff(x: &ArrayView2<f32>, edges: &Edges, norm_constant: f32) -> (Array2<f32>, Array2<f32>) {
    let e = edges.len();
    let d = x.ncols();
    let mut radial = Array2::<f32>::zeros((e, 1));
    let mut diff = Array2::<f32>::zeros((e, d));
    for k in 0..e {
        let (i, j) = (edges.row[k], edges.col[k]);
        let mut r = 0.0f32;
        for c in 0..d {
            let v = x[[i, c]] - x[[j, c]];
            diff[[k, c]] = v;
            r += v * v;
        }
        radial[[k, 0]] = r;
        let norm = (r + 1e-8).sqrt() + norm_constant;
        for c in 0..d {
            diff[[k, c]] /= norm;
        }
    }
    (radial, diff)
}

/// Edge input `[h_row, h_col, edge_attr]`.
fn edge_input(h: &ArrayView2<f32>, edges: &Edges, edge_attr: Option<&ArrayView2<f32>>) -> Array2<f32> {
    let pair = concat_columns(&gather(h, &edges.row).view(), &gather(h, &edges.col).view());
    match edge_attr {
        Some(a) if a.ncols() > 0 => concat_columns(&pair.view(), a),
        _ => pair,
    }
}

/// Graph convolutional layer: invariant message passing with a residual node update.
#[derive(Debug, Clone)]
pub struct Gcl {
    pub edge_mlp: Mlp,
    pub node_mlp: Mlp,
    /// Sigmoid gate on messages.
    pub attention: Option<Linear>,
    pub mp: MessagePassing,
}

impl Gcl {
    pub fn new<R: rand::Rng + ?Sized>(
        hidden_nf: usize,
        edges_in_d: usize,
        attention: bool,
        mp: MessagePassing,
        rng: &mut R,
    ) -> Self {
        let edge_mlp = Mlp::new(&[2 * hidden_nf + edges_in_d, hidden_nf, hidden_nf], mp.act, true, rng);
        let node_mlp = Mlp::new(&[2 * hidden_nf, hidden_nf, hidden_nf], mp.act, false, rng);
        let attention = attention.then(|| Linear::new(hidden_nf, 1, true, rng));
        Self {
            edge_mlp,
            node_mlp,
            attention,
            mp,
        }
    }

    pub fn forward(&self, h: &ArrayView2<f32>, edges: &Edges, edge_attr: Option<&ArrayView2<f32>>) -> Array2<f32> {
        let mut mij = self.edge_mlp.forward(&edge_input(h, edges, edge_attr).view());
        if let Some(att) = &self.attention {
            let gate = Activation::Sigmoid.forward(att.forward(&mij.view()));
            mij *= &gate;
        }
        let agg = self.mp.aggregate(&mij.view(), &edges.row, h.nrows());
        let update = self.node_mlp.forward(&concat_columns(h, &agg.view()).view());
        &h.to_owned() + &update
    }
}

/// Coordinate update `x_i ← x_i + agg_j (x_i - x_j)·phi(h_i, h_j, e_ij)`.
#[derive(Debug, Clone)]
pub struct EquivariantUpdate {
    pub coord_mlp: Mlp,
    pub tanh: bool,
    pub coords_range: f32,
    pub mp: MessagePassing,
}

impl EquivariantUpdate {
    pub fn new<R: rand::Rng + ?Sized>(
        hidden_nf: usize,
        edges_in_d: usize,
        tanh: bool,
        coords_range: f32,
        mp: MessagePassing,
        rng: &mut R,
    ) -> Self {
        let layers = vec![
            Linear::new(2 * hidden_nf + edges_in_d, hidden_nf, true, rng),
            Linear::new(hidden_nf, hidden_nf, true, rng),
            Linear::xavier(hidden_nf, 1, 0.001, false, rng),
        ];
        // Activation after the two hidden layers only.
        let coord_mlp = Mlp::from_layers(layers, mp.act, false);
        Self {
            coord_mlp,
            tanh,
            coords_range,
            mp,
        }
    }

    /// `update_mask[i] = false` freezes node `i`.
    pub fn forward(
        &self,
        h: &ArrayView2<f32>,
        x: &ArrayView2<f32>,
        edges: &Edges,
        coord_diff: &ArrayView2<f32>,
        edge_attr: Option<&ArrayView2<f32>>,
        update_mask: Option<&[bool]>,
    ) -> Array2<f32> {
        let phi = self.coord_mlp.forward(&edge_input(h, edges, edge_attr).view());
        let mut trans = coord_diff.to_owned();
        for (k, mut row) in trans.axis_iter_mut(Axis(0)).enumerate() {
            let w = if self.tanh {
                phi[[k, 0]].tanh() * self.coords_range
            } else {
                phi[[k, 0]]
            };
            row *= w;
        }
        let mut agg = self.mp.aggregate(&trans.view(), &edges.row, x.nrows());
        if let Some(mask) = update_mask {
            for (i, mut r) in agg.axis_iter_mut(Axis(0)).enumerate() {
                if !mask[i] {
                    r.fill(0.0);
                }
            }
        }
        &x.to_owned() + &agg
    }
}

/// `inv_sublayers` invariant GCLs followed by one coordinate update.
#[derive(Debug, Clone)]
pub struct EquivariantBlock {
    pub gcls: Vec<Gcl>,
    pub update: EquivariantUpdate,
    pub norm_constant: f32,
    pub sin_embedding: Option<SinusoidalDistanceEmbedding>,
}

impl EquivariantBlock {
    pub fn forward(
        &self,
        h: &ArrayView2<f32>,
        x: &ArrayView2<f32>,
        edges: &Edges,
        edge_attr: &ArrayView2<f32>,
        update_mask: Option<&[bool]>,
    ) -> (Array2<f32>, Array2<f32>) {
        let (radial, coord_diff) = coord2diff(x, edges, self.norm_constant);
        let radial = match &self.sin_embedding {
            Some(emb) => emb.forward(&radial.view()),
            None => radial,
        };
        let attr = concat_columns(&radial.view(), edge_attr);

        let mut h = h.to_owned();
        for gcl in &self.gcls {
            h = gcl.forward(&h.view(), edges, Some(&attr.view()));
        }
        let x = self
            .update
            .forward(&h.view(), x, edges, &coord_diff.view(), Some(&attr.view()), update_mask);
        (h, x)
    }
}

/// Hyperparameters of [`Egnn`] / [`Gnn`].
#[derive(Debug, Clone, Copy)]
pub struct EgnnParams {
    pub in_node_nf: usize,
    pub in_edge_nf: usize,
    pub hidden_nf: usize,
    pub out_node_nf: usize,
    pub n_layers: usize,
    pub inv_sublayers: usize,
    pub attention: bool,
    pub tanh: bool,
    pub coords_range: f32,
    pub norm_constant: f32,
    pub sin_embedding: bool,
    pub mp: MessagePassing,
}

/// Equivariant graph network: embedding, `n_layers` equivariant blocks, output embedding.
#[derive(Debug, Clone)]
pub struct Egnn {
    pub embedding: Linear,
    pub embedding_out: Linear,
    pub blocks: Vec<EquivariantBlock>,
    pub sin_embedding: Option<SinusoidalDistanceEmbedding>,
}

impl Egnn {
    pub fn new<R: rand::Rng + ?Sized>(p: &EgnnParams, rng: &mut R) -> Self {
        let sin_embedding = p.sin_embedding.then(SinusoidalDistanceEmbedding::default);
        let dist_nf = sin_embedding.as_ref().map_or(1, SinusoidalDistanceEmbedding::dim);
        // [current radial, initial radial, extra attributes]
        let edge_feat_nf = 2 * dist_nf + p.in_edge_nf;
        let coords_range = p.coords_range / p.n_layers.max(1) as f32;

        let embedding = Linear::new(p.in_node_nf, p.hidden_nf, true, rng);
        let blocks = (0..p.n_layers)
            .map(|_| EquivariantBlock {
                gcls: (0..p.inv_sublayers)
                    .map(|_| Gcl::new(p.hidden_nf, edge_feat_nf, p.attention, p.mp, rng))
                    .collect(),
                update: EquivariantUpdate::new(p.hidden_nf, edge_feat_nf, p.tanh, coords_range, p.mp, rng),
                norm_constant: p.norm_constant,
                sin_embedding: sin_embedding.clone(),
            })
            .collect();
        let embedding_out = Linear::new(p.hidden_nf, p.out_node_nf, true, rng);
        Self {
            embedding,
            embedding_out,
            blocks,
            sin_embedding,
        }
    }

    /// Returns updated `(h, x)`; `edge_attr` may have zero columns.
    pub fn forward(
        &self,
        h: &ArrayView2<f32>,
        x: &ArrayView2<f32>,
        edges: &Edges,
        edge_attr: &ArrayView2<f32>,
        update_mask: Option<&[bool]>,
    ) -> (Array2<f32>, Array2<f32>) {
        let (radial, _) = coord2diff(x, edges, 1.0);
        let radial = match &self.sin_embedding {
            Some(emb) => emb.forward(&radial.view()),
            None => radial,
        };
        let attr = concat_columns(&radial.view(), edge_attr);

        let mut h = self.embedding.forward(h);
        let mut x = x.to_owned();
        for block in &self.blocks {
            let (h_next, x_next) = block.forward(&h.view(), &x.view(), edges, &attr.view(), update_mask);
            h = h_next;
            x = x_next;
        }
        (self.embedding_out.forward(&h.view()), x)
    }
}

/// Plain (non-equivariant) message-passing baseline; positions are ordinary input features.
#[derive(Debug, Clone)]
pub struct Gnn {
    pub embedding: Linear,
    pub embedding_out: Linear,
    pub gcls: Vec<Gcl>,
}

impl Gnn {
    pub fn new<R: rand::Rng + ?Sized>(p: &EgnnParams, rng: &mut R) -> Self {
        let embedding = Linear::new(p.in_node_nf, p.hidden_nf, true, rng);
        let gcls = (0..p.n_layers)
            .map(|_| Gcl::new(p.hidden_nf, p.in_edge_nf, p.attention, p.mp, rng))
            .collect();
        let embedding_out = Linear::new(p.hidden_nf, p.out_node_nf, true, rng);
        Self {
            embedding,
            embedding_out,
            gcls,
        }
    }

    pub fn forward(&self, h: &ArrayView2<f32>, edges: &Edges, edge_attr: &ArrayView2<f32>) -> Array2<f32> {
        let mut h = self.embedding.forward(h);
        for gcl in &self.gcls {
            h = gcl.forward(&h.view(), edges, Some(edge_attr));
        }
        self.embedding_out.forward(&h.view())
    }
}

/// Per-node boolean mask: `true` for the first `n_free` nodes, `false` after.
pub fn prefix_mask(n_free: usize, n_total: usize) -> Vec<bool> {
    (0..n_total).map(|i| i < n_free).collect()
}

/// Node features are concatenated `[features, time]`; remove the trailing time column.
pub fn drop_last_column(h: Array2<f32>) -> Array2<f32> {
    let n = h.ncols();
    if n == 0 {
        return h;
    }
    h.slice(ndarray::s![.., ..n - 1]).to_owned()
}

/// Column of `value` repeated `n` times.
pub fn constant_column(n: usize, value: f32) -> Array2<f32> {
    Array2::from_elem((n, 1), value)
}

/// Column built from per-node values.
pub fn column(values: &Array1<f32>) -> Array2<f32> {
    values.view().insert_axis(Axis(1)).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edges::fully_connected;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn params(in_node_nf: usize) -> EgnnParams {
        EgnnParams {
            in_node_nf,
            in_edge_nf: 0,
            hidden_nf: 8,
            out_node_nf: in_node_nf,
            n_layers: 2,
            inv_sublayers: 1,
            attention: true,
            tanh: true,
            coords_range: 15.0,
            norm_constant: 1.0,
            sin_embedding: false,
            mp: MessagePassing {
                aggregation: Aggregation::Sum,
                normalization_factor: 10.0,
                act: Activation::Silu,
            },
        }
    }

    #[test]
    fn coord2diff_is_zero_on_self_edges() {
        let x = ndarray::array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]];
        let edges = fully_connected(&[0, 0]);
        let (radial, diff) = coord2diff(&x.view(), &edges, 0.0);
        assert_eq!(radial[[0, 0]], 0.0);
        assert!((radial[[1, 0]] - 14.0).abs() < 1e-5);
        let norm: f32 = diff.row(1).iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn frozen_nodes_do_not_move() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let egnn = Egnn::new(&params(4), &mut rng);
        let h = Array2::from_shape_fn((5, 4), |(i, j)| ((i + j) % 3) as f32);
        let x = Array2::from_shape_fn((5, 3), |(i, j)| (i as f32) * 0.7 - (j as f32) * 0.3);
        let edges = fully_connected(&[0; 5]);
        let mask = prefix_mask(2, 5);
        let empty = Array2::<f32>::zeros((edges.len(), 0));
        let (h_out, x_out) = egnn.forward(&h.view(), &x.view(), &edges, &empty.view(), Some(&mask));
        assert_eq!(h_out.dim(), (5, 4));
        for i in 2..5 {
            assert_eq!(x_out.row(i), x.row(i));
        }
    }

    #[test]
    fn mean_aggregation_divides_by_in_degree() {
        let mp = MessagePassing {
            aggregation: Aggregation::Mean,
            normalization_factor: 1.0,
            act: Activation::Silu,
        };
        let v = ndarray::array![[2.0f32], [4.0], [6.0]];
        let agg = mp.aggregate(&v.view(), &[0, 0, 1], 3);
        assert_eq!(agg[[0, 0]], 3.0);
        assert_eq!(agg[[1, 0]], 6.0);
        assert_eq!(agg[[2, 0]], 0.0);
    }

    #[test]
    fn gnn_output_width_matches_params() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut p = params(6);
        p.out_node_nf = 9;
        let gnn = Gnn::new(&p, &mut rng);
        let h = Array2::from_elem((3, 6), 0.5f32);
        let edges = fully_connected(&[0, 0, 1]);
        let empty = Array2::<f32>::zeros((edges.len(), 0));
        assert_eq!(gnn.forward(&h.view(), &edges, &empty.view()).dim(), (3, 9));
    }
}
