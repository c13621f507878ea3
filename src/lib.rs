//! # pocketdiff
//!
//! Pocket-conditioned, E(3)-equivariant diffusion over ligand coordinates.
//!
//! This crate is intentionally small:
//!
//! - it implements the **diffusion process** (noise schedule, forward noising, the likelihood
//!   decomposition used as a training loss, reverse transitions) and the **sampling loop**,
//! - it ships a reference **equivariant dynamics network** over the joint ligand–pocket graph,
//! - it does not load datasets, step optimizers or write molecules (that belongs to tooling).
//!
//! ## Public invariants (must not change)
//!
//! - **Randomness is explicit**: every stochastic operation takes `rng: &mut R`.
//! - **Batch boundaries live in the batch index**: node arrays of several examples are
//!   flattened; per-example reductions always go through `batch`, never row order.
//! - **Zero-mean frame is asserted**: under [`com::SubspaceCoMPolicy`] every operation that
//!   introduces positions re-projects and checks them ([`Error::MeanNotZero`] otherwise).
//! - **The pocket is frozen**: a dynamics network that moves pocket nodes is rejected at
//!   construction.
//! - **Unsupported paths fail loudly** with [`Error::NotSupported`] (fixed-noise sampling,
//!   pocket feature denoising, sampling without a pocket, guidance without a guider).
//!
//! ## Numerical faults
//!
//! Non-finite network output is replaced by zeros and residual center drift after sampling is
//! projected away. Both are reported with `tracing::warn!`, not as errors. The crate never
//! installs a subscriber.
//!
//! ## References (conceptual anchors)
//!
//! - Hoogeboom et al., *Equivariant Diffusion for Molecule Generation in 3D* (ICML 2022):
//!   schedule, zero-mean subspace, likelihood terms.
//! - Schneuing et al., *Structure-based Drug Design with Equivariant Diffusion Models* (2022):
//!   pocket conditioning with frozen context.
//! - Satorras et al., *E(n) Equivariant Graph Neural Networks* (ICML 2021).
//!
//! ## Module map
//!
//! - `graph`: flattened graph batches and batch-index reductions
//! - `schedule`: noise schedules and coefficient helpers
//! - `com`: center-of-mass policies
//! - `normalize`: affine coordinate/feature normalization
//! - `categorical`: one-hot helpers and the discretized zero-step likelihood
//! - `nn`, `egnn`, `edges`, `dynamics`: the noise-prediction network
//! - `guidance`: interfaces of injected collaborators (energy guider, size prior)
//! - `loss`: loss terms and objective assembly
//! - `diffusion`: forward process, loss terms and reverse transitions
//! - `sampling`: the reverse chain

pub mod categorical;
pub mod com;
pub mod diffusion;
pub mod dynamics;
pub mod edges;
pub mod egnn;
pub mod graph;
pub mod guidance;
pub mod loss;
pub mod nn;
pub mod normalize;
pub mod sampling;
pub mod schedule;

pub use com::{CoMPolicy, IdentityCoMPolicy, SubspaceCoMPolicy};
pub use diffusion::{ConditionalDiffusion, DiffusionConfig, ForwardOutput, Mode};
pub use dynamics::{Dynamics, DynamicsConfig, DynamicsKind, EquivariantDynamics, TimeInput};
pub use graph::GraphBatch;
pub use guidance::{EnergyGuider, SizeDistribution};
pub use loss::{LossTerms, LossType};
pub use sampling::{SampleOutput, SamplingConfig};
pub use schedule::{NoiseSchedule, ScheduleKind};

/// pocketdiff error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("positions of example {example} are not centered (relative error {rel_error:.3e})")]
    MeanNotZero { example: usize, rel_error: f32 },
    /// Failure inside an injected collaborator, passed through unchanged.
    #[error(transparent)]
    External(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;
