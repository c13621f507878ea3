//! Dense building blocks for the dynamics network.
//!
//! Row-major batches throughout: inputs are `rows × in`, weights are `in × out`.
//! Parameters are plain public arrays so trained values can be loaded from outside.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Elementwise nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Activation {
    #[default]
    Silu,
    Sigmoid,
    Tanh,
    Relu,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Silu => x / (1.0 + (-x).exp()),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }

    pub fn forward(self, x: Array2<f32>) -> Array2<f32> {
        x.mapv_into(|v| self.apply(v))
    }
}

/// Affine map `y = x W + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weights, `in × out`.
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    /// Uniform `±1/sqrt(in)` initialization for weights and bias.
    pub fn new<R: rand::Rng + ?Sized>(d_in: usize, d_out: usize, bias: bool, rng: &mut R) -> Self {
        let bound = 1.0 / (d_in.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((d_in, d_out), |_| uniform(bound, rng));
        let bias = bias.then(|| Array1::from_shape_fn(d_out, |_| uniform(bound, rng)));
        Self { weight, bias }
    }

    /// Xavier-uniform weights scaled by `gain`; zero bias.
    pub fn xavier<R: rand::Rng + ?Sized>(
        d_in: usize,
        d_out: usize,
        gain: f32,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let bound = gain * (6.0 / (d_in + d_out).max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((d_in, d_out), |_| uniform(bound, rng));
        let bias = bias.then(|| Array1::zeros(d_out));
        Self { weight, bias }
    }

    pub fn d_in(&self) -> usize {
        self.weight.nrows()
    }

    pub fn d_out(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(x.ncols(), self.d_in());
        let mut y = x.dot(&self.weight);
        if let Some(b) = &self.bias {
            y += b;
        }
        y
    }
}

#[inline]
fn uniform<R: rand::Rng + ?Sized>(bound: f32, rng: &mut R) -> f32 {
    let u: f32 = rng.random();
    (2.0 * u - 1.0) * bound
}

/// Linear layers with an activation between consecutive layers.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub layers: Vec<Linear>,
    pub act: Activation,
    /// Also apply `act` after the last layer.
    pub act_last: bool,
}

impl Mlp {
    /// `dims = [in, hidden.., out]`, biases everywhere, default initialization.
    pub fn new<R: rand::Rng + ?Sized>(
        dims: &[usize],
        act: Activation,
        act_last: bool,
        rng: &mut R,
    ) -> Self {
        debug_assert!(dims.len() >= 2);
        let layers = dims
            .windows(2)
            .map(|w| Linear::new(w[0], w[1], true, rng))
            .collect();
        Self {
            layers,
            act,
            act_last,
        }
    }

    pub fn from_layers(layers: Vec<Linear>, act: Activation, act_last: bool) -> Self {
        Self {
            layers,
            act,
            act_last,
        }
    }

    pub fn d_in(&self) -> usize {
        self.layers.first().map_or(0, Linear::d_in)
    }

    pub fn d_out(&self) -> usize {
        self.layers.last().map_or(0, Linear::d_out)
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let n = self.layers.len();
        let mut h = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h.view());
            if i + 1 < n || self.act_last {
                h = self.act.forward(h);
            }
        }
        h
    }
}

/// Sinusoidal features of an interatomic distance, computed from the squared distance.
///
/// Frequencies `2π·div^k / max_res` for `k = 0..⌊log_div(max_res/min_res)⌋`; output is
/// `[sin(d·f), cos(d·f)]` with `d = sqrt(d² + 1e-8)`.
#[derive(Debug, Clone)]
pub struct SinusoidalDistanceEmbedding {
    frequencies: Vec<f32>,
}

impl Default for SinusoidalDistanceEmbedding {
    fn default() -> Self {
        Self::new(15.0, 15.0 / 2000.0, 4.0)
    }
}

impl SinusoidalDistanceEmbedding {
    pub fn new(max_res: f32, min_res: f32, div_factor: f32) -> Self {
        let n = ((max_res / min_res).ln() / div_factor.ln()) as usize + 1;
        let frequencies = (0..n)
            .map(|k| 2.0 * core::f32::consts::PI * div_factor.powi(k as i32) / max_res)
            .collect();
        Self { frequencies }
    }

    pub fn dim(&self) -> usize {
        2 * self.frequencies.len()
    }

    /// `squared_distances` is `E × 1`.
    pub fn forward(&self, squared_distances: &ArrayView2<f32>) -> Array2<f32> {
        let nf = self.frequencies.len();
        let mut out = Array2::<f32>::zeros((squared_distances.nrows(), 2 * nf));
        for (e, d2) in squared_distances.column(0).iter().enumerate() {
            let d = (d2 + 1e-8).sqrt();
            for (k, f) in self.frequencies.iter().enumerate() {
                out[[e, k]] = (d * f).sin();
                out[[e, nf + k]] = (d * f).cos();
            }
        }
        out
    }
}

/// Sinusoidal encoding of scalar positions (node ranks, index offsets).
///
/// Frequencies are `base^(k / (w/2 - 1))` for `k = 0..w/2`; inputs are divided by
/// `granularity` first. Output width is `2·⌊w/2⌋`.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    frequencies: Vec<f32>,
    granularity: f32,
}

impl PositionalEncoding {
    pub fn new(width: usize, base_freq: f32, granularity: f32) -> Self {
        let half = width / 2;
        let frequencies = (0..half)
            .map(|k| {
                let e = if half > 1 {
                    k as f32 / (half - 1) as f32
                } else {
                    0.0
                };
                base_freq.powf(e)
            })
            .collect();
        Self {
            frequencies,
            granularity,
        }
    }

    pub fn dim(&self) -> usize {
        2 * self.frequencies.len()
    }

    pub fn forward(&self, positions: &ArrayView1<f32>) -> Array2<f32> {
        let half = self.frequencies.len();
        let mut out = Array2::<f32>::zeros((positions.len(), 2 * half));
        for (i, &p) in positions.iter().enumerate() {
            let p = p / self.granularity;
            for (k, f) in self.frequencies.iter().enumerate() {
                out[[i, k]] = (p * f).sin();
                out[[i, half + k]] = (p * f).cos();
            }
        }
        out
    }
}

/// Gather rows `idx` of `x` into a new matrix.
pub fn gather(x: &ArrayView2<f32>, idx: &[usize]) -> Array2<f32> {
    x.select(Axis(0), idx)
}

/// Sum rows of `values` into `num_segments` buckets keyed by `segment`.
pub fn segment_sum(values: &ArrayView2<f32>, segment: &[usize], num_segments: usize) -> Array2<f32> {
    debug_assert_eq!(values.nrows(), segment.len());
    let mut out = Array2::<f32>::zeros((num_segments, values.ncols()));
    for (e, &s) in segment.iter().enumerate() {
        let mut row = out.row_mut(s);
        row += &values.row(e);
    }
    out
}
