use std::{ env, sync::Arc };
use num_complex::Complex64 as C64;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trotter::{
    comm::{ Communicator, ThreadComm },
    config::SolverConfig,
    hamiltonian::{ Hamiltonian, Potential },
    kernel::Backend,
    lattice::Grid,
    observables::Which,
    solver::Solver,
    state::State,
};

const RANKS: usize = 2;
const OMEGA: f64 = 0.8; // frame angular velocity
const COUPLING: f64 = 500.0;

#[derive(Copy, Clone, Debug, Default)]
struct Energies {
    total: f64,
    kinetic: f64,
    potential: f64,
    rotational: f64,
    interaction: f64,
}

fn run(comm: Arc<ThreadComm>, config: &SolverConfig) -> anyhow::Result<Vec<Energies>> {
    let lattice = config.lattice(&*comm, true)?;
    // slightly off-centre blob with a phase winding to break the symmetry
    let psi = State::from_fn(&lattice, |x, y| {
        let r2 = (x - 0.3).powi(2) + (y + 0.2).powi(2);
        C64::from_polar((-r2 / 8.0).exp(), y.atan2(x))
    });
    let h = Hamiltonian::new(1.0, COUPLING, Potential::from_fn(|x, y| 0.5 * (x * x + y * y)))
        .rotating(OMEGA, (0.0, 0.0));
    let mut solver = Solver::new(comm.clone(), h, vec![psi], config.clone())?;
    let mut history = Vec::new();
    for round in 0..20 {
        solver.evolve(250, true)?;
        let e = Energies {
            total: solver.total_energy()?,
            kinetic: solver.kinetic_energy(Which::Total)?,
            potential: solver.potential_energy(Which::Total)?,
            rotational: solver.rotational_energy(Which::Total)?,
            interaction: solver.intra_species_energy(Which::Total)?,
        };
        if comm.rank() == 0 {
            info!(round, total = e.total, rotational = e.rotational, "imaginary-time round");
        }
        history.push(e);
    }
    Ok(history)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // an optional YAML file replaces the built-in configuration
    let config = match env::args().nth(1) {
        Some(path) => SolverConfig::load(path)?,
        None => {
            let mut config = SolverConfig::new(Grid::square(128, 24.0), 5e-3)
                .with_backend(Backend::Scalar)
                .with_blocks(64, 64);
            config.apply_env_overrides()?;
            config
        },
    };
    let group = ThreadComm::group(RANKS).into_iter()
        .map(|comm| comm.with_timeout(config.exchange_timeout()))
        .collect();
    let results = ThreadComm::run_group(group, |comm| run(comm, &config));
    let mut results = results.into_iter().collect::<anyhow::Result<Vec<_>>>()?;
    let history = results.swap_remove(0);

    println!(
        "{:>6} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "round", "total", "kinetic", "potential", "rotational", "interaction",
    );
    for (k, e) in history.iter().enumerate() {
        println!(
            "{:6} {:12.6} {:12.6} {:12.6} {:12.6} {:12.6}",
            k, e.total, e.kinetic, e.potential, e.rotational, e.interaction,
        );
    }
    Ok(())
}
