//! Distributed split-operator evolution of two-dimensional wave functions.
//!
//! A global lattice is cut into tiles, one per rank of a process group, and
//! every tile is advanced by second-order Trotter-Suzuki steps in real or
//! imaginary time. The kinetic part of each step is a sequence of two-site
//! rotations over alternating row and column pairs, so every step only needs
//! a few sites from neighboring tiles; those arrive through a halo exchange
//! that overlaps with computation of the tile interior.
//!
//! Supported Hamiltonians (ħ = 1):
//! - one component with mass, external potential (static or time-dependent)
//!   and contact self-interaction;
//! - an optional rotating frame, `-Ω L_z`;
//! - two components with inter-species density coupling and a complex Rabi
//!   coupling.
//!
//! Evolution is driven by a per-rank [`Solver`][solver::Solver], which builds
//! an [`EvolutionKernel`][kernel::EvolutionKernel] for the configured
//! [`Backend`][kernel::Backend] and reads back energies and norms through
//! cached global reductions. Ranks talk through a
//! [`Communicator`][comm::Communicator]; [`ThreadComm`][comm::ThreadComm]
//! runs a whole group inside one process.
//!
//! ```
//! use std::sync::Arc;
//! use num_complex::Complex64 as C64;
//! use trotter::{
//!     comm::ThreadComm,
//!     config::SolverConfig,
//!     hamiltonian::{ Hamiltonian, Potential },
//!     lattice::Grid,
//!     observables::Which,
//!     solver::Solver,
//!     state::State,
//! };
//!
//! let config = SolverConfig::new(Grid::square(32, 10.0), 1e-3).with_blocks(16, 16);
//! let energies = ThreadComm::run(4, |comm| {
//!     let lattice = config.lattice(&*comm, false).unwrap();
//!     let psi = State::from_fn(&lattice, |x, y| {
//!         C64::new((-(x * x + y * y) / 2.0).exp(), 0.0)
//!     });
//!     let h = Hamiltonian::new(1.0, 0.0, Potential::from_fn(|x, y| (x * x + y * y) / 2.0));
//!     let mut solver = Solver::new(comm, h, vec![psi], config.clone()).unwrap();
//!     solver.evolve(20, false).unwrap();
//!     solver.total_energy().unwrap()
//! });
//! // every rank sees the same reduced value
//! assert!(energies.iter().all(|e| *e == energies[0]));
//! assert!((energies[0] - 1.0).abs() < 1e-2);
//! ```
//!
//! See [`docs`] for the theory behind the step.

pub mod buffer;
pub mod comm;
pub mod config;
pub mod error;
pub mod hamiltonian;
pub mod kernel;
pub mod lattice;
pub mod observables;
pub mod solver;
pub mod state;
pub mod sublattice;

pub mod docs;

pub type Arr2<S> = ndarray::ArrayBase<S, ndarray::Ix2>;
