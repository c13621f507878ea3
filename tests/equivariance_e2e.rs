use ndarray::{array, Array2};
use pocketdiff::diffusion::sample_gaussian;
use pocketdiff::edges::EdgeMode;
use pocketdiff::graph::GraphBatch;
use pocketdiff::{Dynamics, DynamicsConfig, EquivariantDynamics, Result, TimeInput};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const ATOM_NF: usize = 4;
const RESIDUE_NF: usize = 6;

/// Rotation by angle `theta` about the (normalized) axis `(1, 2, 2) / 3`.
fn rotation(theta: f32) -> Array2<f32> {
    let (x, y, z) = (1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0);
    let (c, s) = (theta.cos(), theta.sin());
    let t = 1.0 - c;
    array![
        [t * x * x + c, t * x * y - s * z, t * x * z + s * y],
        [t * x * y + s * z, t * y * y + c, t * y * z - s * x],
        [t * x * z - s * y, t * y * z + s * x, t * z * z + c],
    ]
}

/// Rows transformed as `x ↦ R·x + shift`.
fn rigid(x: &Array2<f32>, r: &Array2<f32>, shift: [f32; 3]) -> Array2<f32> {
    let mut out = x.dot(&r.t());
    for mut row in out.rows_mut() {
        for k in 0..3 {
            row[k] += shift[k];
        }
    }
    out
}

fn one_hot(n: usize, nf: usize) -> Array2<f32> {
    Array2::from_shape_fn((n, nf), |(i, k)| if (i * 5) % nf == k { 1.0 } else { 0.0 })
}

fn complex(seed: u64) -> Result<(GraphBatch, GraphBatch)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let ligand = GraphBatch::from_sizes(sample_gaussian(9, 3, &mut rng), one_hot(9, ATOM_NF), &[4, 5])?;
    let pocket = GraphBatch::from_sizes(sample_gaussian(14, 3, &mut rng) * 2.0, one_hot(14, RESIDUE_NF), &[6, 8])?;
    Ok((ligand, pocket))
}

fn max_abs(a: &Array2<f32>) -> f32 {
    a.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

fn assert_close(a: &Array2<f32>, b: &Array2<f32>, tol: f32) {
    assert_eq!(a.dim(), b.dim());
    let scale = max_abs(b);
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol * scale + 1e-5, "{x} vs {y} (scale {scale})");
    }
}

fn check_equivariance(cfg: DynamicsConfig, seed: u64) -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let dynamics = EquivariantDynamics::new(cfg, &mut rng)?;
    let (ligand, pocket) = complex(seed + 1)?;
    let r = rotation(0.7);
    let shift = [3.0, -1.5, 0.25];
    let moved_ligand = ligand.with_positions(rigid(&ligand.x, &r, shift))?;
    let moved_pocket = pocket.with_positions(rigid(&pocket.x, &r, shift))?;
    let t = array![0.3f32, 0.8];

    let base = dynamics.forward(&ligand, &pocket, TimeInput::PerExample(t.view()))?;
    assert!(max_abs(&base.ligand_noise) > 1e-5, "coordinate updates vanished");
    let moved = dynamics.forward(&moved_ligand, &moved_pocket, TimeInput::PerExample(t.view()))?;

    // Noise rotates with the input and ignores the translation.
    assert_close(&moved.ligand_noise, &base.ligand_noise.dot(&r.t()), 1e-3);
    // Decoded features are invariant.
    assert_close(&moved.ligand_h, &base.ligand_h, 1e-3);
    assert_close(&moved.pocket_h, &base.pocket_h, 1e-3);

    let predicted = dynamics.predict(&moved_ligand, &moved_pocket, TimeInput::PerExample(t.view()))?;
    assert_eq!(predicted, moved.ligand_noise);
    Ok(())
}

/// The reference configuration is rotation equivariant and translation invariant.
#[test]
fn default_network_is_se3_equivariant() -> Result<()> {
    let cfg = DynamicsConfig {
        hidden_nf: 16,
        n_layers: 2,
        normalization_factor: 1.0,
        ..DynamicsConfig::new(ATOM_NF, RESIDUE_NF)
    };
    check_equivariance(cfg, 10)
}

/// Attention, tanh-bounded updates, distance embeddings and positional encodings are all
/// built from invariants, so equivariance survives them.
#[test]
fn fully_featured_network_is_se3_equivariant() -> Result<()> {
    let cfg = DynamicsConfig {
        hidden_nf: 16,
        n_layers: 2,
        normalization_factor: 1.0,
        inv_sublayers: 2,
        attention: true,
        tanh: true,
        sin_embedding: true,
        positional_encoding: true,
        norm_constant: 1.0,
        ..DynamicsConfig::new(ATOM_NF, RESIDUE_NF)
    };
    check_equivariance(cfg, 20)
}

/// Distance-based pocket edges are unchanged by rigid motions.
#[test]
fn pocket_cutoff_edges_keep_equivariance() -> Result<()> {
    let cfg = DynamicsConfig {
        hidden_nf: 16,
        n_layers: 2,
        normalization_factor: 1.0,
        edges: EdgeMode::PocketCutoff(2.5),
        ..DynamicsConfig::new(ATOM_NF, RESIDUE_NF)
    };
    check_equivariance(cfg, 30)
}

/// Mixing decoded features into the noise estimate breaks rotation equivariance.
#[test]
fn node_noise_prediction_is_not_equivariant() -> Result<()> {
    let cfg = DynamicsConfig {
        hidden_nf: 16,
        n_layers: 2,
        normalization_factor: 1.0,
        use_nodes_noise_prediction: true,
        ..DynamicsConfig::new(ATOM_NF, RESIDUE_NF)
    };
    let mut rng = ChaCha8Rng::seed_from_u64(40);
    let dynamics = EquivariantDynamics::new(cfg, &mut rng)?;
    let (ligand, pocket) = complex(41)?;
    let r = rotation(1.3);
    let moved_ligand = ligand.with_positions(rigid(&ligand.x, &r, [0.0; 3]))?;
    let moved_pocket = pocket.with_positions(rigid(&pocket.x, &r, [0.0; 3]))?;

    let base = dynamics.predict(&ligand, &pocket, TimeInput::Scalar(0.5))?;
    let moved = dynamics.predict(&moved_ligand, &moved_pocket, TimeInput::Scalar(0.5))?;
    let expected = base.dot(&r.t());
    let max_gap = moved
        .iter()
        .zip(expected.iter())
        .fold(0.0f32, |m, (a, b)| m.max((a - b).abs()));
    assert!(max_gap > 1e-4);
    Ok(())
}
