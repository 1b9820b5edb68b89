//! Time evolution of one or two wave functions under a [`Hamiltonian`].
//!
//! A [`Solver`] lives on every rank of a process group and owns that rank's
//! tile. Kernels are built lazily on the first call to
//! [`evolve`][Solver::evolve] and dropped whenever a reconfiguration
//! invalidates them; the solver's own copies of the states are brought up to
//! date after every call, so they are always safe to read.
//!
//! Observables are normalized expectation values. Each one costs one global
//! reduction the first time it is read after an evolution and nothing after
//! that; since reductions are collective, every rank must read the same
//! observables in the same order.

use std::sync::Arc;
use ndarray as nd;
use tracing::{ debug, info, trace, warn };
use crate::{
    comm::Communicator,
    config::SolverConfig,
    error::{ ConfigError, KernelError, ShapeError, SolverError },
    hamiltonian::{ Hamiltonian, KineticCoefficients, PotentialOperator, RotationCoefficients },
    kernel::{
        Backend,
        EvolutionKernel,
        Feature,
        KernelSetup,
        blocks::Rect,
        field::Field,
        halo::HaloExchange,
        make_kernel,
        stencil::StepParams,
    },
    lattice::LatticeDescriptor,
    observables::{ self, EnergyCache, Observable, Which },
    state::State,
};

pub type SResult<T> = Result<T, SolverError>;

/// Per-rank driver of the evolution.
pub struct Solver {
    lattice: LatticeDescriptor,
    comm: Arc<dyn Communicator>,
    hamiltonian: Hamiltonian,
    states: Vec<State>,
    config: SolverConfig,
    // potential values at `time`, one per component
    potentials: Vec<nd::Array2<f64>>,
    kernel: Option<Box<dyn EvolutionKernel>>,
    kernel_imag_time: bool,
    time: f64,
    cache: EnergyCache,
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("rank", &self.lattice.rank)
            .field("tile", &self.lattice.shape())
            .field("components", &self.states.len())
            .field("backend", &self.config.backend)
            .field("kernel", &self.kernel_name())
            .field("time", &self.time)
            .finish()
    }
}

impl Solver {
    /// Set up a solver for the tile of `comm`'s rank.
    ///
    /// `states` holds one state per Hamiltonian component, each shaped like the
    /// tile returned by [`SolverConfig::lattice`]. Their halos are filled in
    /// here, so only owned sites need meaningful values. Every rank of the
    /// group must call this together.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use num_complex::Complex64 as C64;
    /// use trotter::{
    ///     comm::ThreadComm,
    ///     config::SolverConfig,
    ///     hamiltonian::{ Hamiltonian, Potential },
    ///     lattice::Grid,
    ///     observables::Which,
    ///     solver::Solver,
    ///     state::State,
    /// };
    ///
    /// let comm = Arc::new(ThreadComm::solo());
    /// let config = SolverConfig::new(Grid::square(32, 8.0), 1e-3).with_blocks(16, 16);
    /// let lattice = config.lattice(&*comm, false).unwrap();
    /// let psi = State::from_fn(&lattice, |x, y| C64::new((-(x * x + y * y) / 2.0).exp(), 0.0));
    /// let h = Hamiltonian::new(1.0, 0.0, Potential::from_fn(|x, y| (x * x + y * y) / 2.0));
    /// let mut solver = Solver::new(comm, h, vec![psi], config).unwrap();
    /// solver.evolve(10, true).unwrap();
    /// assert!((solver.squared_norm(Which::Total).unwrap() - 1.0).abs() < 1e-9);
    /// ```
    pub fn new(
        comm: Arc<dyn Communicator>,
        hamiltonian: Hamiltonian,
        mut states: Vec<State>,
        config: SolverConfig,
    ) -> SResult<Self>
    {
        hamiltonian.validate()?;
        let rotating = hamiltonian.is_rotating();
        config.validate(rotating)?;
        config.backend.check(&features(&hamiltonian))?;
        if states.len() != hamiltonian.components.len() {
            return Err(ConfigError::Components(format!(
                "{} state(s) for {} Hamiltonian component(s)",
                states.len(), hamiltonian.components.len(),
            )).into());
        }
        let lattice = config.lattice(&*comm, rotating)?;
        let mut halo = HaloExchange::new(&lattice, Arc::clone(&comm));
        for state in states.iter_mut() {
            ShapeError::check(lattice.shape(), &state.field.real)?;
            halo.exchange(&mut state.field)?;
        }
        let potentials = hamiltonian.components.iter()
            .map(|c| c.potential.sample(&lattice, 0.0))
            .collect::<Result<Vec<_>, _>>()?;
        for c in hamiltonian.components.iter() {
            let theta = config.delta_t / (4.0 * c.mass * lattice.delta_x * lattice.delta_y);
            if theta > 1.0 {
                warn!(theta, "kinetic angle per link exceeds one; the time step is likely too large");
            }
        }
        info!(
            rank = lattice.rank,
            procs = lattice.procs,
            tile = ?lattice.shape(),
            backend = %config.backend,
            components = states.len(),
            rotating,
            "solver ready",
        );
        Ok(Self {
            lattice,
            comm,
            hamiltonian,
            states,
            config,
            potentials,
            kernel: None,
            kernel_imag_time: false,
            time: 0.0,
            cache: EnergyCache::default(),
        })
    }

    /// Advance by `iterations` steps of the configured time step, in imaginary
    /// time if `imag_time`.
    ///
    /// Imaginary-time evolution leaves the states jointly normalized and does
    /// not advance [`time`][Self::time].
    pub fn evolve(&mut self, iterations: usize, imag_time: bool) -> SResult<()> {
        debug!(rank = self.lattice.rank, iterations, imag_time, t = self.time, "evolve");
        if self.kernel.is_some() && self.kernel_imag_time != imag_time {
            self.kernel = None;
        }
        let mut kernel = match self.kernel.take() {
            Some(kernel) => kernel,
            None => self.build_kernel(imag_time)?,
        };
        self.kernel_imag_time = imag_time;
        // a failed step leaves the kernel mid-protocol, so it is dropped and
        // the states keep their last synced values
        self.run_steps(&mut *kernel, iterations, imag_time)?;
        if !kernel.runs_in_place() {
            self.sync_states(&*kernel)?;
        }
        self.kernel = Some(kernel);
        for (c, comp) in self.hamiltonian.components.iter().enumerate() {
            if !comp.potential.is_static() {
                self.potentials[c] = comp.potential.sample(&self.lattice, self.time)?;
            }
        }
        self.cache.invalidate();
        Ok(())
    }

    fn run_steps(
        &mut self,
        kernel: &mut dyn EvolutionKernel,
        iterations: usize,
        imag_time: bool,
    ) -> SResult<()>
    {
        let delta_t = self.config.delta_t;
        let two = self.states.len() == 2;
        for step in 0..iterations {
            for (c, comp) in self.hamiltonian.components.iter().enumerate() {
                if comp.potential.is_static() { continue; }
                let values = comp.potential.sample(&self.lattice, self.time)?;
                kernel.update_potential(
                    c, PotentialOperator::from_values(&values, delta_t, imag_time))?;
            }
            if two {
                kernel.rabi_coupling(0.5, delta_t)?;
                for c in 0..2 {
                    kernel.activate(c)?;
                    protocol_round(kernel)?;
                }
                kernel.rabi_coupling(0.5, delta_t)?;
            } else {
                protocol_round(kernel)?;
            }
            kernel.wait_for_completion()?;
            if !imag_time { self.time += delta_t; }
            trace!(rank = self.lattice.rank, step, t = self.time, "step done");
        }
        Ok(())
    }

    fn sync_states(&mut self, kernel: &dyn EvolutionKernel) -> SResult<()> {
        let whole = Rect::new(0, 0, self.lattice.dim_x, self.lattice.dim_y);
        for (c, state) in self.states.iter_mut().enumerate() {
            let (real, imag) = kernel.get_sample(c, whole)?;
            state.field = Field::new(real, imag)?;
        }
        Ok(())
    }

    fn build_kernel(&self, imag_time: bool) -> SResult<Box<dyn EvolutionKernel>> {
        let h = &self.hamiltonian;
        let lat = &self.lattice;
        let delta_t = self.config.delta_t;
        let two = self.states.len() == 2;
        let rotation = h.is_rotating().then(|| {
            RotationCoefficients::new(h.angular_velocity, delta_t, lat.delta_x, lat.delta_y)
        });
        let params: Vec<StepParams> = h.components.iter()
            .map(|c| StepParams {
                kinetic: KineticCoefficients::new(
                    delta_t, c.mass, lat.delta_x, lat.delta_y, imag_time),
                imag_time,
                g_self: c.coupling * delta_t,
                g_cross: if two { h.coupling_ab * delta_t } else { 0.0 },
                rotation,
            })
            .collect();
        let operators: Vec<PotentialOperator> = self.potentials.iter()
            .map(|v| PotentialOperator::from_values(v, delta_t, imag_time))
            .collect();
        let setup = KernelSetup {
            lattice: lat.clone(),
            comm: Arc::clone(&self.comm),
            fields: self.states.iter().map(|s| s.field.clone()).collect(),
            operators,
            params,
            rabi: h.rabi,
            rot_center: h.rot_center,
            imag_time,
            blocks: self.config.block_shape(h.is_rotating()),
        };
        Ok(make_kernel(self.config.backend, setup)?)
    }

    /// Change the time step; the kernel is rebuilt on the next evolution.
    pub fn set_delta_t(&mut self, delta_t: f64) -> SResult<()> {
        ConfigError::check_time_step(delta_t)?;
        self.config.delta_t = delta_t;
        self.kernel = None;
        Ok(())
    }

    /// Switch backends; the kernel is rebuilt on the next evolution.
    pub fn set_backend(&mut self, backend: Backend) -> SResult<()> {
        backend.check(&features(&self.hamiltonian))?;
        self.config.backend = backend;
        self.kernel = None;
        Ok(())
    }

    pub fn states(&self) -> &[State] { &self.states }

    pub fn state(&self, component: usize) -> Option<&State> { self.states.get(component) }

    pub fn lattice(&self) -> &LatticeDescriptor { &self.lattice }

    pub fn config(&self) -> &SolverConfig { &self.config }

    pub fn hamiltonian(&self) -> &Hamiltonian { &self.hamiltonian }

    /// Elapsed real time.
    pub fn time(&self) -> f64 { self.time }

    /// Name of the live kernel, if one has been built.
    pub fn kernel_name(&self) -> Option<&'static str> {
        self.kernel.as_ref().map(|k| k.name())
    }

    /// Number of global reductions spent on observables so far.
    pub fn reductions(&self) -> usize { self.cache.reductions() }

    fn check_which(&self, which: Which) -> SResult<()> {
        let n = self.states.len();
        match which {
            Which::Second if n < 2 => Err(KernelError::BadComponent(1, n).into()),
            _ => Ok(()),
        }
    }

    // cached or freshly reduced per-component values
    fn observable(&mut self, obs: Observable) -> SResult<[f64; 2]> {
        if let Some(values) = self.cache.get(obs) { return Ok(values); }
        let local = self.local_values(obs);
        Ok(self.cache.reduce(&*self.comm, obs, local)?)
    }

    fn local_values(&self, obs: Observable) -> [f64; 2] {
        let lat = &self.lattice;
        let h = &self.hamiltonian;
        let per_component = |f: &dyn Fn(usize, &Field) -> f64| {
            let mut out = [0.0; 2];
            self.states.iter().enumerate()
                .for_each(|(c, s)| { out[c] = f(c, &s.field); });
            out
        };
        match obs {
            Observable::Norm => per_component(&|_, f| observables::norm(lat, f)),
            Observable::Kinetic => per_component(&|c, f| {
                observables::kinetic(lat, f, h.components[c].mass)
            }),
            Observable::Potential => per_component(&|c, f| {
                observables::potential(lat, f, &self.potentials[c])
            }),
            Observable::Rotational => per_component(&|_, f| {
                observables::rotational(lat, f, h.angular_velocity, h.rot_center)
            }),
            Observable::IntraSpecies => per_component(&|c, f| {
                observables::intra_species(lat, f, h.components[c].coupling)
            }),
            Observable::InterSpecies | Observable::Rabi => match self.states.as_slice() {
                [a, b] if obs == Observable::InterSpecies =>
                    [observables::inter_species(lat, &a.field, &b.field, h.coupling_ab), 0.0],
                [a, b] => [observables::rabi(lat, &a.field, &b.field, h.rabi), 0.0],
                _ => [0.0; 2],
            },
        }
    }

    // expectation value of `obs` divided by the matching norm
    fn normalized(&mut self, obs: Observable, which: Which) -> SResult<f64> {
        self.check_which(which)?;
        let values = self.observable(obs)?;
        let norms = self.observable(Observable::Norm)?;
        Ok(match which {
            Which::First => values[0] / norms[0],
            Which::Second => values[1] / norms[1],
            Which::Total => (values[0] + values[1]) / (norms[0] + norms[1]),
        })
    }

    /// Σ|ψ|² ΔxΔy over the whole lattice.
    pub fn squared_norm(&mut self, which: Which) -> SResult<f64> {
        self.check_which(which)?;
        let norms = self.observable(Observable::Norm)?;
        Ok(match which {
            Which::First => norms[0],
            Which::Second => norms[1],
            Which::Total => norms[0] + norms[1],
        })
    }

    pub fn kinetic_energy(&mut self, which: Which) -> SResult<f64> {
        self.normalized(Observable::Kinetic, which)
    }

    pub fn potential_energy(&mut self, which: Which) -> SResult<f64> {
        self.normalized(Observable::Potential, which)
    }

    /// Zero outside a rotating frame.
    pub fn rotational_energy(&mut self, which: Which) -> SResult<f64> {
        if !self.hamiltonian.is_rotating() {
            self.check_which(which)?;
            return Ok(0.0);
        }
        self.normalized(Observable::Rotational, which)
    }

    pub fn intra_species_energy(&mut self, which: Which) -> SResult<f64> {
        self.normalized(Observable::IntraSpecies, which)
    }

    /// Density coupling between the two components; zero for one.
    pub fn inter_species_energy(&mut self) -> SResult<f64> {
        if self.states.len() < 2 { return Ok(0.0); }
        self.normalized(Observable::InterSpecies, Which::Total)
    }

    /// Rabi coupling between the two components; zero for one.
    pub fn rabi_energy(&mut self) -> SResult<f64> {
        if self.states.len() < 2 { return Ok(0.0); }
        self.normalized(Observable::Rabi, Which::Total)
    }

    /// Sum of every energy term over all components.
    pub fn total_energy(&mut self) -> SResult<f64> {
        Ok(
            self.kinetic_energy(Which::Total)?
            + self.potential_energy(Which::Total)?
            + self.rotational_energy(Which::Total)?
            + self.intra_species_energy(Which::Total)?
            + self.inter_species_energy()?
            + self.rabi_energy()?
        )
    }
}

fn features(h: &Hamiltonian) -> Vec<Feature> {
    let mut features = Vec::new();
    if h.is_rotating() { features.push(Feature::RotatingFrame); }
    if h.is_two_component() { features.push(Feature::TwoComponent); }
    features
}

// one pass of the per-component call sequence
fn protocol_round(kernel: &mut dyn EvolutionKernel) -> SResult<()> {
    kernel.run_kernel_on_halo()?;
    kernel.start_halo_exchange()?;
    kernel.run_kernel()?;
    kernel.finish_halo_exchange()?;
    Ok(())
}
