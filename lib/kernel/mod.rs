//! Evolution kernels: the per-tile engines that advance a wave function by
//! one Trotter step at a time.
//!
//! Every kernel follows the same call protocol per step and component:
//! ```text
//! run_kernel_on_halo -> start_halo_exchange -> run_kernel -> finish_halo_exchange
//! ```
//! followed, once all components are done, by `wait_for_completion`. The halo
//! pass computes the blocks whose results neighbors need, the exchange ships
//! them while the interior pass runs, and finishing the exchange makes the new
//! generation current. Calls made out of order fail with
//! [`KernelError::OutOfOrder`].
//!
//! Four backends are provided, all writing into a double buffer so that every
//! block reads only the previous generation:
//! - [`Scalar`][Backend::Scalar]: reference double-precision kernel; the only
//!   one supporting the rotating frame and two-component states.
//! - [`Vectorized`][Backend::Vectorized]: single-precision SIMD kernel working
//!   on the four-sublattice layout.
//! - [`Device`][Backend::Device]: every block runs on an asynchronous
//!   execution stream.
//! - [`Hybrid`][Backend::Hybrid]: halo blocks run on the host thread pool,
//!   interior blocks on the stream.

use std::{ fmt, str::FromStr, sync::Arc };
use ndarray as nd;
use num_complex::Complex64 as C64;
use serde::{ Deserialize, Serialize };
use crate::{
    comm::Communicator,
    error::{ ConfigError, KernelError },
    hamiltonian::PotentialOperator,
    lattice::LatticeDescriptor,
};

pub mod blocks;
pub mod cpu;
pub mod device;
pub mod field;
pub mod halo;
pub mod simd;
pub mod stencil;

use blocks::{ BlockShape, Rect };
use field::Field;
use stencil::StepParams;

pub type KResult<T> = Result<T, KernelError>;

/// Position of a kernel within the per-step call protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelPhase {
    /// Between steps.
    Idle,
    /// Halo blocks of the active component have been computed.
    HaloComputed,
    /// The first exchange wave is in flight.
    Exchanging,
    /// Interior blocks have been computed or launched.
    InteriorComputed,
    /// The active component has finished its step.
    Exchanged,
}

/// One call of the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Halo,
    StartExchange,
    Interior,
    FinishExchange,
    Complete,
    /// Any call that must happen between component steps.
    Between(&'static str),
}

impl Call {
    fn name(self) -> &'static str {
        match self {
            Self::Halo => "run_kernel_on_halo",
            Self::StartExchange => "start_halo_exchange",
            Self::Interior => "run_kernel",
            Self::FinishExchange => "finish_halo_exchange",
            Self::Complete => "wait_for_completion",
            Self::Between(name) => name,
        }
    }
}

/// Tracks the protocol phase and rejects calls made from the wrong one.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Protocol {
    phase: KernelPhase,
}

impl Default for Protocol {
    fn default() -> Self { Self { phase: KernelPhase::Idle } }
}

impl Protocol {
    pub(crate) fn phase(&self) -> KernelPhase { self.phase }

    /// Fail unless `call` may be made now.
    pub(crate) fn check(&self, call: Call) -> KResult<()> {
        use KernelPhase::*;
        let ok = match call {
            Call::Halo | Call::Complete | Call::Between(_)
                => matches!(self.phase, Idle | Exchanged),
            Call::StartExchange => self.phase == HaloComputed,
            Call::Interior => self.phase == Exchanging,
            Call::FinishExchange => self.phase == InteriorComputed,
        };
        ok.then_some(())
            .ok_or(KernelError::OutOfOrder { call: call.name(), phase: self.phase })
    }

    /// Record that `call` has completed.
    pub(crate) fn advance(&mut self, call: Call) {
        use KernelPhase::*;
        self.phase = match call {
            Call::Halo => HaloComputed,
            Call::StartExchange => Exchanging,
            Call::Interior => InteriorComputed,
            Call::FinishExchange => Exchanged,
            Call::Complete => Idle,
            Call::Between(_) => self.phase,
        };
    }
}

/// Per-tile evolution engine.
///
/// Kernels own their tile's wave function(s) from construction until they are
/// dropped; read results back with [`get_sample`][Self::get_sample].
pub trait EvolutionKernel: Send {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    /// Current protocol phase.
    fn phase(&self) -> KernelPhase;

    /// Number of components held.
    fn components(&self) -> usize { 1 }

    /// `true` if the kernel steps the caller's state storage directly, so
    /// that no copy back through [`get_sample`][Self::get_sample] is needed.
    fn runs_in_place(&self) -> bool { false }

    /// Select which component the next protocol round steps.
    fn activate(&mut self, component: usize) -> KResult<()> {
        (component < self.components()).then_some(())
            .ok_or(KernelError::BadComponent(component, self.components()))
    }

    /// Compute the blocks whose results neighbors need.
    fn run_kernel_on_halo(&mut self) -> KResult<()>;

    /// Post the first exchange wave.
    fn start_halo_exchange(&mut self) -> KResult<()>;

    /// Compute (or launch) the remaining blocks.
    fn run_kernel(&mut self) -> KResult<()>;

    /// Finish the exchange and make the new generation current.
    fn finish_halo_exchange(&mut self) -> KResult<()>;

    /// Close the step; in imaginary time this renormalizes.
    fn wait_for_completion(&mut self) -> KResult<()>;

    /// Copy of a window of the current generation of one component.
    fn get_sample(&self, component: usize, window: Rect)
        -> KResult<(nd::Array2<f64>, nd::Array2<f64>)>;

    /// Squared norm over owned cells of all components, times the cell area;
    /// summed over every rank if `global`.
    fn squared_norm(&self, global: bool) -> KResult<f64>;

    /// Rescale all components jointly to unit norm.
    ///
    /// Kernels without multi-component support normalize inside
    /// [`wait_for_completion`][Self::wait_for_completion] and do nothing here.
    fn normalization(&mut self) -> KResult<()> { Ok(()) }

    /// Apply the Rabi coupling for `fraction` of a step of length `delta_t`.
    ///
    /// A no-op for single-component kernels.
    fn rabi_coupling(&mut self, _fraction: f64, _delta_t: f64) -> KResult<()> { Ok(()) }

    /// Replace the exponentiated potential of one component.
    fn update_potential(&mut self, component: usize, operator: PotentialOperator)
        -> KResult<()>;
}

/// Available kernel backends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    #[serde(alias = "cpu")]
    Scalar,
    #[serde(alias = "simd", alias = "sse")]
    Vectorized,
    #[serde(alias = "gpu")]
    Device,
    Hybrid,
}

impl Backend {
    pub const ALL: [Self; 4] = [Self::Scalar, Self::Vectorized, Self::Device, Self::Hybrid];

    pub fn supports(self, feature: Feature) -> bool {
        match feature {
            Feature::RotatingFrame | Feature::TwoComponent => self == Self::Scalar,
        }
    }

    /// Fail on the first of `features` this backend lacks.
    pub fn check(self, features: &[Feature]) -> Result<(), ConfigError> {
        match features.iter().find(|f| !self.supports(**f)) {
            Some(f) => Err(ConfigError::Unsupported {
                backend: self.to_string(),
                feature: f.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scalar => "scalar",
            Self::Vectorized => "vectorized",
            Self::Device => "device",
            Self::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" | "cpu" => Ok(Self::Scalar),
            "vectorized" | "simd" | "sse" => Ok(Self::Vectorized),
            "device" | "gpu" => Ok(Self::Device),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

/// Hamiltonian terms not every backend implements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Feature {
    RotatingFrame,
    TwoComponent,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RotatingFrame => f.write_str("rotating-frame evolution"),
            Self::TwoComponent => f.write_str("two-component states"),
        }
    }
}

/// Everything needed to build a kernel for one tile.
pub struct KernelSetup {
    pub lattice: LatticeDescriptor,
    pub comm: Arc<dyn Communicator>,
    /// One field per component, tile-shaped.
    pub fields: Vec<Field>,
    /// One exponentiated potential per component, tile-shaped.
    pub operators: Vec<PotentialOperator>,
    /// One set of step parameters per component.
    pub params: Vec<StepParams>,
    /// Rabi coupling between the two components.
    pub rabi: C64,
    /// Physical coordinates of the rotation centre.
    pub rot_center: (f64, f64),
    pub imag_time: bool,
    pub blocks: BlockShape,
}

impl KernelSetup {
    /// Features the setup asks of a backend.
    pub fn features(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        if self.params.iter().any(|p| p.rotation.is_some()) {
            features.push(Feature::RotatingFrame);
        }
        if self.fields.len() > 1 { features.push(Feature::TwoComponent); }
        features
    }

    // shared shape and count checks
    fn validate(&self) -> Result<(), ConfigError> {
        let n = self.fields.len();
        if n == 0 || n > 2 || self.operators.len() != n || self.params.len() != n {
            return Err(ConfigError::Components(format!(
                "{} fields, {} operators, {} parameter sets",
                n, self.operators.len(), self.params.len(),
            )));
        }
        let shape = self.lattice.shape();
        for (f, op) in self.fields.iter().zip(&self.operators) {
            crate::error::ShapeError::check(shape, &f.real)?;
            crate::error::ShapeError::check(shape, &f.imag)?;
            crate::error::ShapeError::check(shape, &op.real)?;
            crate::error::ShapeError::check(shape, &op.imag)?;
        }
        Ok(())
    }
}

/// Build the kernel of `backend`, rejecting setups it cannot evolve.
///
/// The new kernel holds valid halos: construction runs one full exchange.
pub fn make_kernel(backend: Backend, setup: KernelSetup)
    -> KResult<Box<dyn EvolutionKernel>>
{
    backend.check(&setup.features())?;
    setup.validate()?;
    tracing::debug!(
        %backend,
        rank = setup.lattice.rank,
        tile = ?setup.lattice.shape(),
        imag_time = setup.imag_time,
        "building kernel",
    );
    let kernel: Box<dyn EvolutionKernel> = match backend {
        Backend::Scalar => Box::new(cpu::CpuKernel::new(setup)?),
        Backend::Vectorized => Box::new(simd::SimdKernel::new(setup)?),
        Backend::Device => Box::new(device::DeviceKernel::new(setup, false)?),
        Backend::Hybrid => Box::new(device::DeviceKernel::new(setup, true)?),
    };
    Ok(kernel)
}
