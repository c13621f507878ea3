//! Noise-prediction networks over the joint ligand–pocket graph.
//!
//! The diffusion process only needs [`Dynamics::predict`]: given the noisy ligand, the
//! (fixed) pocket and the timestep, return one 3-vector per ligand node. [`EquivariantDynamics`]
//! is the reference implementation; tests and external models can provide their own.

use crate::edges::{ligand_offset_attributes, EdgeMode, Edges};
use crate::egnn::{
    column, constant_column, drop_last_column, prefix_mask, Aggregation, Egnn, EgnnParams, Gnn,
    MessagePassing,
};
use crate::graph::{
    concat_columns, concat_rows, gather, gather_rows, node_ranks, scatter_mean, GraphBatch, N_DIMS,
};
use crate::nn::{Activation, Mlp, PositionalEncoding};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView1};

/// Timestep fed to the network: one value for the whole batch, or one per example.
#[derive(Debug, Clone, Copy)]
pub enum TimeInput<'a> {
    Scalar(f32),
    PerExample(ArrayView1<'a, f32>),
}

/// Anything that predicts ligand coordinate noise.
pub trait Dynamics {
    /// Predicted noise, `n_lig × 3`.
    fn predict(&self, ligand: &GraphBatch, pocket: &GraphBatch, t: TimeInput<'_>) -> Result<Array2<f32>>;

    /// Noise plus the decoded ligand feature channel, for networks that produce one.
    fn predict_with_features(
        &self,
        ligand: &GraphBatch,
        pocket: &GraphBatch,
        t: TimeInput<'_>,
    ) -> Result<(Array2<f32>, Option<Array2<f32>>)> {
        Ok((self.predict(ligand, pocket, t)?, None))
    }

    /// Whether pocket positions move during message passing.
    fn updates_pocket_coords(&self) -> bool {
        false
    }
}

/// Which message-passing network sits between the encoders and decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DynamicsKind {
    /// Equivariant network; velocity is the coordinate displacement.
    #[default]
    Egnn,
    /// Plain GNN over `[x, h]`; velocity is read from the first three output channels.
    Gnn,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DynamicsConfig {
    pub kind: DynamicsKind,
    /// Ligand categorical width.
    pub atom_nf: usize,
    /// Pocket categorical width.
    pub residue_nf: usize,
    /// Shared embedding width of ligand and pocket nodes.
    pub joint_nf: usize,
    pub hidden_nf: usize,
    pub n_layers: usize,
    /// Invariant sublayers per equivariant block.
    pub inv_sublayers: usize,
    pub attention: bool,
    pub tanh: bool,
    pub coords_range: f32,
    pub norm_constant: f32,
    /// Sinusoidal embedding of interatomic distances.
    pub sin_embedding: bool,
    /// Rank-keyed positional encoding of ligand nodes (and index offsets on ligand edges).
    pub positional_encoding: bool,
    pub positional_encoding_freq: f32,
    pub normalization_factor: f32,
    pub aggregation: Aggregation,
    pub act: Activation,
    pub condition_time: bool,
    pub update_pocket_coords: bool,
    pub edges: EdgeMode,
    /// Add the decoded ligand feature channel to the coordinate noise estimate.
    ///
    /// The decoded features are invariant, so enabling this gives up exact rotation
    /// equivariance of the prediction.
    pub use_nodes_noise_prediction: bool,
}

impl DynamicsConfig {
    /// Reference hyperparameters for the given feature widths.
    pub fn new(atom_nf: usize, residue_nf: usize) -> Self {
        Self {
            kind: DynamicsKind::Egnn,
            atom_nf,
            residue_nf,
            joint_nf: 16,
            hidden_nf: 64,
            n_layers: 4,
            inv_sublayers: 2,
            attention: false,
            tanh: false,
            coords_range: 15.0,
            norm_constant: 0.0,
            sin_embedding: false,
            positional_encoding: false,
            positional_encoding_freq: 1.0 / 9.0,
            normalization_factor: 100.0,
            aggregation: Aggregation::Sum,
            act: Activation::Silu,
            condition_time: true,
            update_pocket_coords: false,
            edges: EdgeMode::FullyConnected,
            use_nodes_noise_prediction: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.atom_nf == 0 || self.residue_nf == 0 {
            return Err(Error::Domain("atom_nf and residue_nf must be >= 1"));
        }
        if self.joint_nf == 0 || self.hidden_nf == 0 || self.n_layers == 0 {
            return Err(Error::Domain("joint_nf, hidden_nf and n_layers must be >= 1"));
        }
        if self.kind == DynamicsKind::Egnn && self.inv_sublayers == 0 {
            return Err(Error::Domain("inv_sublayers must be >= 1"));
        }
        if !(self.normalization_factor > 0.0) || !self.normalization_factor.is_finite() {
            return Err(Error::Domain("normalization_factor must be positive and finite"));
        }
        if !self.coords_range.is_finite() || !self.norm_constant.is_finite() {
            return Err(Error::Domain("coords_range and norm_constant must be finite"));
        }
        if let EdgeMode::PocketCutoff(c) = self.edges {
            if !(c > 0.0) || !c.is_finite() {
                return Err(Error::Domain("pocket cutoff must be positive and finite"));
            }
        }
        if self.positional_encoding && (self.joint_nf < 2 || self.joint_nf % 2 != 0) {
            return Err(Error::Domain("positional encoding needs an even joint_nf"));
        }
        Ok(())
    }
}

/// Everything the network computes in one pass.
#[derive(Debug, Clone)]
pub struct DynamicsOutput {
    /// Ligand coordinate noise estimate, `n_lig × 3`.
    pub ligand_noise: Array2<f32>,
    /// Decoded ligand feature-channel estimate, `n_lig × 3`.
    pub ligand_h: Array2<f32>,
    /// Decoded pocket features, `n_pocket × residue_nf`.
    pub pocket_h: Array2<f32>,
    /// Displacement field over all nodes, `(n_lig + n_pocket) × 3`.
    pub velocity: Array2<f32>,
}

#[derive(Debug, Clone)]
enum Network {
    Egnn(Egnn),
    Gnn(Gnn),
}

/// Encoder → message passing → decoder noise predictor.
#[derive(Debug, Clone)]
pub struct EquivariantDynamics {
    cfg: DynamicsConfig,
    pub atom_encoder: Mlp,
    pub residue_encoder: Mlp,
    pub atom_decoder: Mlp,
    pub residue_decoder: Mlp,
    network: Network,
    encoding: Option<PositionalEncoding>,
}

impl EquivariantDynamics {
    pub fn new<R: rand::Rng + ?Sized>(cfg: DynamicsConfig, rng: &mut R) -> Result<Self> {
        cfg.validate()?;
        let act = cfg.act;
        let (a, r, j) = (cfg.atom_nf, cfg.residue_nf, cfg.joint_nf);

        let atom_encoder = Mlp::new(&[a, 2 * a, j], act, false, rng);
        let residue_encoder = Mlp::new(&[r, 2 * r, j], act, false, rng);
        let atom_decoder = Mlp::new(&[j, 2 * a, a, N_DIMS], act, false, rng);
        let residue_decoder = Mlp::new(&[j, 2 * r, r], act, false, rng);

        let node_nf = if cfg.condition_time {
            j + 1
        } else {
            tracing::warn!("dynamics network is not conditioned on time");
            j
        };
        let encoding = cfg
            .positional_encoding
            .then(|| PositionalEncoding::new(j, cfg.positional_encoding_freq, 1.0 / core::f32::consts::PI));
        let in_edge_nf = encoding.as_ref().map_or(0, PositionalEncoding::dim);

        let mut params = EgnnParams {
            in_node_nf: node_nf,
            in_edge_nf,
            hidden_nf: cfg.hidden_nf,
            out_node_nf: node_nf,
            n_layers: cfg.n_layers,
            inv_sublayers: cfg.inv_sublayers,
            attention: cfg.attention,
            tanh: cfg.tanh,
            coords_range: cfg.coords_range,
            norm_constant: cfg.norm_constant,
            sin_embedding: cfg.sin_embedding,
            mp: MessagePassing {
                aggregation: cfg.aggregation,
                normalization_factor: cfg.normalization_factor,
                act,
            },
        };
        let network = match cfg.kind {
            DynamicsKind::Egnn => Network::Egnn(Egnn::new(&params, rng)),
            DynamicsKind::Gnn => {
                params.in_node_nf = node_nf + N_DIMS;
                params.out_node_nf = node_nf + N_DIMS;
                Network::Gnn(Gnn::new(&params, rng))
            }
        };

        Ok(Self {
            cfg,
            atom_encoder,
            residue_encoder,
            atom_decoder,
            residue_decoder,
            network,
            encoding,
        })
    }

    pub fn config(&self) -> &DynamicsConfig {
        &self.cfg
    }

    /// Edges of the combined `[ligand; pocket]` graph under the configured edge mode.
    pub fn edges(&self, ligand: &GraphBatch, pocket: &GraphBatch) -> Edges {
        self.cfg.edges.build(&ligand.batch, &pocket.batch, &pocket.x.view())
    }

    pub fn forward(&self, ligand: &GraphBatch, pocket: &GraphBatch, t: TimeInput<'_>) -> Result<DynamicsOutput> {
        if ligand.nf() != self.cfg.atom_nf || pocket.nf() != self.cfg.residue_nf {
            return Err(Error::Shape("feature widths do not match the dynamics config"));
        }
        let num_examples = ligand.num_examples();
        if pocket.num_examples() != num_examples {
            return Err(Error::Shape("ligand and pocket must have the same number of examples"));
        }
        if let TimeInput::PerExample(tv) = t {
            if tv.len() != num_examples {
                return Err(Error::Shape("per-example t must have one entry per example"));
            }
        }
        let n_lig = ligand.num_nodes();
        let n = n_lig + pocket.num_nodes();

        let mut h_atoms = self.atom_encoder.forward(&ligand.one_hot.view());
        let h_residues = self.residue_encoder.forward(&pocket.one_hot.view());
        if let Some(pe) = &self.encoding {
            let ranks: Array1<f32> = node_ranks(&ligand.batch, num_examples)
                .into_iter()
                .map(|r| r as f32)
                .collect();
            h_atoms += &pe.forward(&ranks.view());
        }

        let x = concat_rows(&ligand.x.view(), &pocket.x.view());
        let mut h = concat_rows(&h_atoms.view(), &h_residues.view());
        let batch: Vec<usize> = ligand.batch.iter().chain(&pocket.batch).copied().collect();

        if self.cfg.condition_time {
            let h_time = match t {
                TimeInput::Scalar(v) => constant_column(n, v),
                TimeInput::PerExample(tv) => column(&gather(&tv, &batch)),
            };
            h = concat_columns(&h.view(), &h_time.view());
        }

        let edges = self.edges(ligand, pocket);
        let edge_attr = match &self.encoding {
            Some(pe) => ligand_offset_attributes(&edges, n_lig, pe),
            None => Array2::zeros((edges.len(), 0)),
        };

        let (mut vel, h_final) = match &self.network {
            Network::Egnn(egnn) => {
                let mask = (!self.cfg.update_pocket_coords).then(|| prefix_mask(n_lig, n));
                let (h_final, x_final) =
                    egnn.forward(&h.view(), &x.view(), &edges, &edge_attr.view(), mask.as_deref());
                (x_final - &x, h_final)
            }
            Network::Gnn(gnn) => {
                let xh = concat_columns(&x.view(), &h.view());
                let out = gnn.forward(&xh.view(), &edges, &edge_attr.view());
                (
                    out.slice(s![.., ..N_DIMS]).to_owned(),
                    out.slice(s![.., N_DIMS..]).to_owned(),
                )
            }
        };

        let h_final = if self.cfg.condition_time {
            drop_last_column(h_final)
        } else {
            h_final
        };
        let ligand_h = self.atom_decoder.forward(&h_final.slice(s![..n_lig, ..]));
        let pocket_h = self.residue_decoder.forward(&h_final.slice(s![n_lig.., ..]));

        if vel.iter().any(|v| !v.is_finite()) {
            tracing::warn!(nodes = n, "non-finite dynamics output, resetting velocity to zero");
            vel.fill(0.0);
        }

        if self.cfg.update_pocket_coords {
            // The whole displacement field must stay translation invariant.
            let mean = scatter_mean(&vel.view(), &batch, num_examples);
            vel -= &gather_rows(&mean.view(), &batch);
        }

        let mut ligand_noise = vel.slice(s![..n_lig, ..]).to_owned();
        if self.cfg.use_nodes_noise_prediction {
            ligand_noise += &ligand_h;
        }

        Ok(DynamicsOutput {
            ligand_noise,
            ligand_h,
            pocket_h,
            velocity: vel,
        })
    }
}

impl Dynamics for EquivariantDynamics {
    fn predict(&self, ligand: &GraphBatch, pocket: &GraphBatch, t: TimeInput<'_>) -> Result<Array2<f32>> {
        Ok(self.forward(ligand, pocket, t)?.ligand_noise)
    }

    fn predict_with_features(
        &self,
        ligand: &GraphBatch,
        pocket: &GraphBatch,
        t: TimeInput<'_>,
    ) -> Result<(Array2<f32>, Option<Array2<f32>>)> {
        let out = self.forward(ligand, pocket, t)?;
        Ok((out.ligand_noise, Some(out.ligand_h)))
    }

    fn updates_pocket_coords(&self) -> bool {
        self.cfg.update_pocket_coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tracing_test::traced_test;

    fn small_config() -> DynamicsConfig {
        DynamicsConfig {
            hidden_nf: 16,
            n_layers: 2,
            inv_sublayers: 1,
            ..DynamicsConfig::new(4, 5)
        }
    }

    fn toy_system() -> (GraphBatch, GraphBatch) {
        let lig_x = Array2::from_shape_fn((5, 3), |(i, k)| ((i * 3 + k) as f32 * 0.37).sin());
        let lig_h = Array2::from_shape_fn((5, 4), |(i, k)| if i % 4 == k { 1.0 } else { 0.0 });
        let ligand = GraphBatch::from_sizes(lig_x, lig_h, &[3, 2]).unwrap();
        let pocket_x = Array2::from_shape_fn((6, 3), |(i, k)| ((i * 5 + k) as f32 * 0.21).cos() * 3.0);
        let pocket_h = Array2::from_shape_fn((6, 5), |(i, k)| if i % 5 == k { 1.0 } else { 0.0 });
        let pocket = GraphBatch::from_sizes(pocket_x, pocket_h, &[4, 2]).unwrap();
        (ligand, pocket)
    }

    #[test]
    fn predicts_one_vector_per_ligand_node() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dynamics = EquivariantDynamics::new(small_config(), &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let out = dynamics.forward(&ligand, &pocket, TimeInput::Scalar(0.3)).unwrap();
        assert_eq!(out.ligand_noise.dim(), (5, 3));
        assert_eq!(out.pocket_h.dim(), (6, 5));
        assert_eq!(out.velocity.dim(), (11, 3));
        assert!(out.ligand_noise.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn positional_encoding_rejects_odd_joint_width() {
        let odd = DynamicsConfig {
            joint_nf: 15,
            positional_encoding: true,
            ..small_config()
        };
        assert!(matches!(odd.validate(), Err(Error::Domain(_))));
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        assert!(EquivariantDynamics::new(odd, &mut rng).is_err());

        let even = DynamicsConfig {
            joint_nf: 14,
            positional_encoding: true,
            ..small_config()
        };
        let dynamics = EquivariantDynamics::new(even, &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let out = dynamics.forward(&ligand, &pocket, TimeInput::Scalar(0.4)).unwrap();
        assert!(out.ligand_noise.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn frozen_pocket_has_zero_velocity() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let dynamics = EquivariantDynamics::new(small_config(), &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let out = dynamics.forward(&ligand, &pocket, TimeInput::Scalar(0.5)).unwrap();
        assert!(out.velocity.slice(s![5.., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn scalar_and_broadcast_time_agree() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let dynamics = EquivariantDynamics::new(small_config(), &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let t = array![0.25f32, 0.25];
        let a = dynamics.predict(&ligand, &pocket, TimeInput::Scalar(0.25)).unwrap();
        let b = dynamics.predict(&ligand, &pocket, TimeInput::PerExample(t.view())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn updating_pocket_keeps_velocity_mean_free() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let cfg = DynamicsConfig {
            update_pocket_coords: true,
            ..small_config()
        };
        let dynamics = EquivariantDynamics::new(cfg, &mut rng).unwrap();
        assert!(dynamics.updates_pocket_coords());
        let (ligand, pocket) = toy_system();
        let out = dynamics.forward(&ligand, &pocket, TimeInput::Scalar(0.5)).unwrap();
        let batch: Vec<usize> = ligand.batch.iter().chain(&pocket.batch).copied().collect();
        let mean = scatter_mean(&out.velocity.view(), &batch, 2);
        assert!(mean.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn gnn_and_encoding_variants_run() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let cfg = DynamicsConfig {
            kind: DynamicsKind::Gnn,
            positional_encoding: true,
            sin_embedding: true,
            attention: true,
            edges: EdgeMode::PocketCutoff(2.0),
            ..small_config()
        };
        let dynamics = EquivariantDynamics::new(cfg, &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let out = dynamics.predict(&ligand, &pocket, TimeInput::Scalar(0.9)).unwrap();
        assert_eq!(out.dim(), (5, 3));

        let cfg = DynamicsConfig {
            positional_encoding: true,
            sin_embedding: true,
            tanh: true,
            use_nodes_noise_prediction: true,
            ..small_config()
        };
        let dynamics = EquivariantDynamics::new(cfg, &mut rng).unwrap();
        let out = dynamics.forward(&ligand, &pocket, TimeInput::Scalar(0.9)).unwrap();
        let vel_lig = out.velocity.slice(s![..5, ..]).to_owned();
        assert_eq!(out.ligand_noise, &vel_lig + &out.ligand_h);
    }

    #[test]
    fn rejects_mismatched_feature_widths() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let dynamics = EquivariantDynamics::new(DynamicsConfig::new(3, 5), &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let err = dynamics.predict(&ligand, &pocket, TimeInput::Scalar(0.0)).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[traced_test]
    #[test]
    fn non_finite_velocity_is_reset_with_a_warning() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let dynamics = EquivariantDynamics::new(small_config(), &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        let mut x = ligand.x.clone();
        x[[0, 0]] = f32::NAN;
        let ligand = ligand.with_positions(x).unwrap();
        let out = dynamics.forward(&ligand, &pocket, TimeInput::Scalar(0.5)).unwrap();
        assert!(out.velocity.iter().all(|&v| v == 0.0));
        assert!(out.ligand_noise.iter().all(|&v| v == 0.0));
        assert!(logs_contain("non-finite dynamics output"));
    }

    #[traced_test]
    #[test]
    fn time_free_network_warns_at_construction() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let cfg = DynamicsConfig {
            condition_time: false,
            ..small_config()
        };
        let dynamics = EquivariantDynamics::new(cfg, &mut rng).unwrap();
        let (ligand, pocket) = toy_system();
        assert_eq!(dynamics.predict(&ligand, &pocket, TimeInput::Scalar(0.1)).unwrap().dim(), (5, 3));
        assert!(logs_contain("not conditioned on time"));
    }
}
