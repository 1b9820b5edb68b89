use std::sync::Arc;
use approx::assert_abs_diff_eq;
use ndarray as nd;
use num_complex::Complex64 as C64;
use trotter::{
    comm::{ Communicator, ThreadComm },
    config::SolverConfig,
    error::{ ConfigError, KernelError, SolverError },
    hamiltonian::{ Component, Hamiltonian, KineticCoefficients, Potential, PotentialOperator },
    kernel::{
        Backend,
        KernelPhase,
        KernelSetup,
        blocks::{ BlockShape, Rect },
        field::Field,
        make_kernel,
        stencil::StepParams,
    },
    lattice::{ Grid, LatticeDescriptor },
    observables::Which,
    solver::Solver,
    state::State,
};

fn packet(lattice: &LatticeDescriptor) -> State {
    State::from_fn(lattice, |x, y| {
        C64::from_polar((-(x * x + y * y) / 2.0).exp(), 0.7 * x + 0.3 * y)
    })
}

fn harmonic() -> Potential { Potential::from_fn(|x, y| 0.5 * (x * x + y * y)) }

#[test]
fn imaginary_time_keeps_unit_norm_on_every_rank() {
    let config = SolverConfig::new(Grid::square(32, 10.0).periodic(true, true), 1e-2)
        .with_blocks(16, 16);
    let norms = ThreadComm::run(4, |comm| {
        let lattice = config.lattice(&*comm, false).unwrap();
        let h = Hamiltonian::new(1.0, 5.0, harmonic());
        let mut solver = Solver::new(comm, h, vec![packet(&lattice)], config.clone()).unwrap();
        let mut norms = Vec::new();
        for _ in 0..5 {
            solver.evolve(3, true).unwrap();
            norms.push(solver.squared_norm(Which::Total).unwrap());
        }
        norms
    });
    for n in norms.iter().flatten() {
        assert_abs_diff_eq!(*n, 1.0, epsilon = 1e-10);
    }
}

#[test]
fn real_time_conserves_norm_and_energy() {
    let config = SolverConfig::new(Grid::square(48, 12.0), 1e-3).with_blocks(32, 32);
    let results = ThreadComm::run(2, |comm| {
        let lattice = config.lattice(&*comm, false).unwrap();
        let h = Hamiltonian::new(1.0, 1.0, harmonic());
        let mut solver = Solver::new(comm, h, vec![packet(&lattice)], config.clone()).unwrap();
        let n0 = solver.squared_norm(Which::Total).unwrap();
        let e0 = solver.total_energy().unwrap();
        solver.evolve(100, false).unwrap();
        let n1 = solver.squared_norm(Which::Total).unwrap();
        let e1 = solver.total_energy().unwrap();
        (n0, n1, e0, e1, solver.time())
    });
    for (n0, n1, e0, e1, t) in results {
        assert_abs_diff_eq!(n1, n0, epsilon = 1e-10);
        assert_abs_diff_eq!(e1, e0, epsilon = 1e-2 * e0.abs());
        assert_abs_diff_eq!(t, 0.1, epsilon = 1e-12);
    }
}

// one step forward, then one with inverted coefficients
#[test]
fn inverse_coefficients_undo_a_step() {
    let grid = Grid::square(16, 4.0).periodic(true, false);
    let config = SolverConfig::new(grid, 0.05).with_blocks(8, 8).with_halo(2);
    ThreadComm::run(2, |comm| {
        let lattice = config.lattice(&*comm, false).unwrap();
        let shape = lattice.shape();
        let start = packet(&lattice);
        let params = StepParams {
            kinetic: KineticCoefficients::new(0.05, 1.0, lattice.delta_x, lattice.delta_y, false),
            imag_time: false,
            g_self: 0.0,
            g_cross: 0.0,
            rotation: None,
        };
        let potential = grid_potential(&lattice);
        let forward = PotentialOperator::from_values(&potential, 0.05, false);
        let backward = PotentialOperator::from_values(&potential, -0.05, false);
        let comm: Arc<dyn Communicator> = comm;
        let setup = |field: Field, op: PotentialOperator, p: StepParams| KernelSetup {
            lattice: lattice.clone(),
            comm: Arc::clone(&comm),
            fields: vec![field],
            operators: vec![op],
            params: vec![p],
            rabi: C64::new(0.0, 0.0),
            rot_center: (0.0, 0.0),
            imag_time: false,
            blocks: BlockShape { width: 8, height: 8, margin_x: 2, margin_y: 2 },
        };
        let whole = Rect::new(0, 0, shape.1, shape.0);
        let step = |field: Field, op: PotentialOperator, p: StepParams| -> Field {
            let mut kernel = make_kernel(Backend::Scalar, setup(field, op, p)).unwrap();
            kernel.run_kernel_on_halo().unwrap();
            kernel.start_halo_exchange().unwrap();
            kernel.run_kernel().unwrap();
            kernel.finish_halo_exchange().unwrap();
            kernel.wait_for_completion().unwrap();
            let (re, im) = kernel.get_sample(0, whole).unwrap();
            Field::new(re, im).unwrap()
        };
        let start_field = Field::new(start.real().clone(), start.imag().clone()).unwrap();
        let there = step(start_field, forward, params);
        let back = step(there, backward, params.inverse());
        let (r0, i0) = start.owned(&lattice);
        let sl = nd::s![lattice.inner_rows(), lattice.inner_cols()];
        for (a, b) in back.real.slice(sl).iter().zip(r0.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        for (a, b) in back.imag.slice(sl).iter().zip(i0.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    });
}

fn grid_potential(lattice: &LatticeDescriptor) -> nd::Array2<f64> {
    harmonic().sample(lattice, 0.0).unwrap()
}

#[test]
fn rabi_coupling_transfers_population() {
    // uniform components on a fully periodic lattice feel no kinetic mixing
    let length = 4.0;
    let grid = Grid::square(16, length).periodic(true, true);
    let config = SolverConfig::new(grid, 1e-3).with_blocks(16, 16);
    let omega: f64 = 2.0;
    let steps = 400;
    let results = ThreadComm::run(2, |comm| {
        let lattice = config.lattice(&*comm, false).unwrap();
        let a = State::from_fn(&lattice, |_, _| C64::new(1.0 / length, 0.0));
        let b = State::new(&lattice);
        let h = Hamiltonian::two_component(
            Component::new(1.0, 0.0, Potential::zero()),
            Component::new(1.0, 0.0, Potential::zero()),
            0.0,
            C64::new(omega, 0.0),
        );
        let mut solver = Solver::new(comm, h, vec![a, b], config.clone()).unwrap();
        solver.evolve(steps, false).unwrap();
        (
            solver.squared_norm(Which::First).unwrap(),
            solver.squared_norm(Which::Second).unwrap(),
            solver.rabi_energy().unwrap(),
        )
    });
    let t = steps as f64 * 1e-3;
    for (n0, n1, _) in results.iter() {
        assert_abs_diff_eq!(*n0, (omega * t).cos().powi(2), epsilon = 1e-9);
        assert_abs_diff_eq!(*n1, (omega * t).sin().powi(2), epsilon = 1e-9);
    }
    // the components stay a quarter period out of phase, so the coupling
    // energy stays zero
    assert_abs_diff_eq!(results[0].2, 0.0, epsilon = 1e-9);
}

#[test]
fn protocol_calls_must_come_in_order() {
    let comm: Arc<dyn Communicator> = Arc::new(ThreadComm::solo());
    let config = SolverConfig::new(Grid::square(16, 4.0), 1e-3).with_blocks(8, 8).with_halo(2);
    let lattice = config.lattice(&*comm, false).unwrap();
    let shape = lattice.shape();
    for backend in Backend::ALL {
        let setup = KernelSetup {
            lattice: lattice.clone(),
            comm: Arc::clone(&comm),
            fields: vec![Field::zeros(shape)],
            operators: vec![PotentialOperator::identity(shape)],
            params: vec![StepParams::kinetic(KineticCoefficients::identity())],
            rabi: C64::new(0.0, 0.0),
            rot_center: (0.0, 0.0),
            imag_time: false,
            blocks: config.block_shape(false),
        };
        let mut kernel = make_kernel(backend, setup).unwrap();
        assert_eq!(kernel.phase(), KernelPhase::Idle);
        assert!(matches!(kernel.run_kernel(), Err(KernelError::OutOfOrder { .. })));
        kernel.run_kernel_on_halo().unwrap();
        assert!(matches!(kernel.wait_for_completion(), Err(KernelError::OutOfOrder { .. })));
        assert!(matches!(
            kernel.finish_halo_exchange(),
            Err(KernelError::OutOfOrder { call: "finish_halo_exchange", .. }),
        ));
        kernel.start_halo_exchange().unwrap();
        kernel.run_kernel().unwrap();
        kernel.finish_halo_exchange().unwrap();
        assert_eq!(kernel.phase(), KernelPhase::Exchanged);
        kernel.wait_for_completion().unwrap();
        assert_eq!(kernel.phase(), KernelPhase::Idle);
        assert!(matches!(
            kernel.get_sample(0, Rect::new(10, 0, 8, 8)),
            Err(KernelError::BadWindow { .. }),
        ));
        assert!(matches!(kernel.get_sample(1, Rect::new(0, 0, 4, 4)), Err(KernelError::BadComponent(1, 1))));
    }
}

#[test]
fn unsupported_terms_are_rejected_up_front() {
    let comm: Arc<dyn Communicator> = Arc::new(ThreadComm::solo());
    let config = SolverConfig::new(Grid::square(32, 8.0), 1e-3).with_blocks(32, 32);
    let lattice = config.lattice(&*comm, true).unwrap();
    let two = Hamiltonian::two_component(
        Component::new(1.0, 0.0, harmonic()),
        Component::new(1.0, 0.0, harmonic()),
        0.0,
        C64::new(0.1, 0.0),
    );
    let rotating = Hamiltonian::new(1.0, 0.0, harmonic()).rotating(0.5, (0.0, 0.0));
    for backend in [Backend::Vectorized, Backend::Device, Backend::Hybrid] {
        let err = Solver::new(
            Arc::clone(&comm), two.clone(),
            vec![packet(&lattice), packet(&lattice)],
            config.clone().with_backend(backend),
        );
        assert!(matches!(err, Err(SolverError::Config(ConfigError::Unsupported { .. }))));
        let err = Solver::new(
            Arc::clone(&comm), rotating.clone(), vec![packet(&lattice)],
            config.clone().with_backend(backend),
        );
        assert!(matches!(err, Err(SolverError::Config(ConfigError::Unsupported { .. }))));
    }
    let mut solver = Solver::new(Arc::clone(&comm), rotating, vec![packet(&lattice)], config.clone())
        .unwrap();
    assert!(matches!(
        solver.set_backend(Backend::Device),
        Err(SolverError::Config(ConfigError::Unsupported { .. })),
    ));
    // too narrow a halo for the rotating frame
    let err = Solver::new(
        comm, Hamiltonian::new(1.0, 0.0, harmonic()).rotating(0.5, (0.0, 0.0)),
        vec![packet(&lattice)], config.with_halo(4),
    );
    assert!(matches!(err, Err(SolverError::Config(ConfigError::NarrowHalo { .. }))));
}

#[test]
fn energies_are_reduced_lazily_and_agree_across_ranks() {
    let config = SolverConfig::new(Grid::square(32, 10.0), 1e-3).with_blocks(16, 16);
    let results = ThreadComm::run(4, |comm| {
        let lattice = config.lattice(&*comm, false).unwrap();
        let h = Hamiltonian::new(1.0, 1.0, harmonic());
        let mut solver = Solver::new(comm, h, vec![packet(&lattice)], config.clone()).unwrap();
        let mut counts = vec![solver.reductions()];
        let e = solver.total_energy().unwrap();
        counts.push(solver.reductions());
        solver.potential_energy(Which::First).unwrap();
        solver.squared_norm(Which::Total).unwrap();
        counts.push(solver.reductions());
        solver.evolve(1, false).unwrap();
        counts.push(solver.reductions());
        solver.potential_energy(Which::Total).unwrap();
        counts.push(solver.reductions());
        (e, counts)
    });
    for (e, counts) in results.iter() {
        assert_eq!(*e, results[0].0);
        assert_eq!(counts, &vec![0, 4, 4, 4, 6]);
    }
}
