//! Collection of all error types.
//!
//! All errors derive [`thiserror::Error`], making them composable when allowed
//! and compatible with application code using [`anyhow`][anyhow].
//!
//! Every error here is fatal to the run that produced it: nothing inside the
//! evolution loop retries.
//!
//! [anyhow]: https://crates.io/crates/anyhow

use ndarray as nd;
use thiserror::Error;
use crate::kernel::KernelPhase;

/// Returned when an array handed to the core does not have the shape of the
/// tile it is meant to cover.
#[derive(Debug, Error)]
#[error("encountered array with incompatible shape; expected {0:?}, got {1:?}")]
pub struct ShapeError(pub (usize, usize), pub (usize, usize));

impl ShapeError {
    pub(crate) fn check<S, A>(
        expected: (usize, usize),
        a: &nd::ArrayBase<S, nd::Ix2>,
    ) -> Result<(), Self>
    where S: nd::Data<Elem = A>
    {
        let got = a.dim();
        (got == expected).then_some(()).ok_or(Self(expected, got))
    }
}

/// Returned from [`LatticeDescriptor::new`][crate::lattice::LatticeDescriptor::new]
/// when a global lattice cannot be split over the requested process grid.
#[derive(Debug, Error)]
pub enum DecompositionError {
    /// Returned when asked to decompose over zero processes.
    #[error("process count must be greater than 0")]
    NoProcesses,

    /// Returned when an explicit process grid does not multiply out to the
    /// process count.
    #[error("process grid {0}x{1} does not match process count {2}")]
    BadProcessGrid(usize, usize, usize),

    /// Returned when the rank is not part of the process group.
    #[error("rank {0} is out of range for {1} processes")]
    BadRank(usize, usize),

    /// Returned when a global extent is zero or odd.
    #[error("global lattice extent along {axis} must be even and nonzero; got {extent}")]
    OddExtent { axis: char, extent: usize },

    /// Returned when a halo width needed on an axis is zero or odd.
    #[error("halo width along {axis} must be even and nonzero; got {width}")]
    BadHalo { axis: char, width: usize },

    /// Returned when the smallest tile along an axis would own fewer cells
    /// than the halo width, or none at all.
    ///
    /// The bound is the halo width rather than twice it: a neighbor's halo
    /// only has to be served from one tile's owned cells, so a tile may own
    /// exactly `halo` cells (the 4×4 two-tile split with halo 2 does).
    #[error("tile {coord} along {axis} owns {owned} cells, fewer than halo width {halo}")]
    TileTooSmall { axis: char, coord: usize, owned: usize, halo: usize },
}

/// Returned when a solver or kernel configuration is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when a non-positive or non-finite time step is encountered.
    #[error("time step must be positive and finite; got {0}")]
    BadTimeStep(f64),

    /// Returned when a non-positive mass is encountered.
    #[error("particle mass must be positive; got {0}")]
    BadMass(f64),

    /// Returned when a block is not even or does not exceed twice the halo.
    #[error("block {axis} extent {block} must be even and greater than twice the halo ({halo})")]
    BadBlock { axis: char, block: usize, halo: usize },

    /// Returned when the halo is narrower than the reach of one step.
    #[error("halo width {halo} is narrower than the reach of one step ({reach})")]
    NarrowHalo { halo: usize, reach: usize },

    /// Returned when a backend is asked to evolve a Hamiltonian term it does
    /// not implement.
    #[error("backend '{backend}' does not support {feature}")]
    Unsupported { backend: String, feature: String },

    /// Returned when a backend name cannot be parsed.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// Returned when the number of states, potentials and Hamiltonian
    /// components disagree.
    #[error("component count mismatch: {0}")]
    Components(String),

    /// [`DecompositionError`]
    #[error("decomposition error: {0}")]
    Decomposition(#[from] DecompositionError),

    /// [`ShapeError`]
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    /// Returned when a configuration file cannot be read.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when a configuration document cannot be parsed.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Returned when an environment override holds an unparseable value.
    #[error("bad value '{1}' for environment variable {0}")]
    BadEnv(&'static str, String),
}

impl ConfigError {
    pub(crate) fn check_time_step(delta_t: f64) -> Result<(), Self> {
        (delta_t > 0.0 && delta_t.is_finite()).then_some(())
            .ok_or(Self::BadTimeStep(delta_t))
    }

    pub(crate) fn check_mass(mass: f64) -> Result<(), Self> {
        (mass > 0.0).then_some(()).ok_or(Self::BadMass(mass))
    }
}

/// Returned when a point-to-point transfer or collective fails.
///
/// A stalled exchange means at least one rank has stopped participating, so
/// the whole process group is expected to abort.
#[derive(Debug, Error)]
pub enum CommError {
    /// Returned when a posted receive does not complete in time.
    #[error("timed out waiting for message from rank {peer} with tag {tag}")]
    Timeout { peer: usize, tag: u32 },

    /// Returned when a peer has hung up.
    #[error("rank {0} disconnected")]
    Disconnected(usize),

    /// Returned when a message does not carry the expected number of values.
    #[error("message from rank {peer} with tag {tag} has {got} values; expected {expected}")]
    SizeMismatch { peer: usize, tag: u32, expected: usize, got: usize },

    /// Returned when addressing a rank outside the group.
    #[error("rank {0} is out of range for a group of {1}")]
    BadPeer(usize, usize),
}

/// Returned from evolution kernels.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Returned when a protocol call is made from the wrong phase.
    #[error("cannot call {call} while kernel is {phase:?}")]
    OutOfOrder { call: &'static str, phase: KernelPhase },

    /// Returned when renormalization meets a zero or non-finite norm.
    #[error("degenerate squared norm {0} during renormalization")]
    DegenerateNorm(f64),

    /// Returned when a sample window does not lie within the tile.
    #[error("sample window {x}+{width} x {y}+{height} exceeds tile {tile_width}x{tile_height}")]
    BadWindow {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        tile_width: usize,
        tile_height: usize,
    },

    /// Returned when selecting a component the kernel does not hold.
    #[error("component {0} out of range for {1} component(s)")]
    BadComponent(usize, usize),

    /// Returned when the device execution stream has gone away.
    #[error("device stream stopped")]
    StreamClosed,

    /// [`ConfigError`]
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// [`ShapeError`]
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    /// [`CommError`]
    #[error("communication error: {0}")]
    Comm(#[from] CommError),
}

impl KernelError {
    pub(crate) fn check_norm(norm2: f64) -> Result<(), Self> {
        (norm2 > 0.0 && norm2.is_finite()).then_some(())
            .ok_or(Self::DegenerateNorm(norm2))
    }
}

/// Returned from [`Solver`][crate::solver::Solver] operations.
#[derive(Debug, Error)]
pub enum SolverError {
    /// [`ConfigError`]
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// [`KernelError`]
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// [`CommError`]
    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    /// [`ShapeError`]
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
}

impl From<DecompositionError> for SolverError {
    fn from(err: DecompositionError) -> Self { Self::Config(err.into()) }
}
