use std::sync::Arc;
use anyhow::Context;
use num_complex::Complex64 as C64;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trotter::{
    comm::{ Communicator, ThreadComm },
    config::SolverConfig,
    hamiltonian::{ Hamiltonian, Potential },
    lattice::Grid,
    observables::Which,
    solver::Solver,
    state::State,
};

const RANKS: usize = 4;
const OFFSET: f64 = 1.5; // trap displacement after cooling
const PERIOD: f64 = 2.0 * std::f64::consts::PI;

fn run(comm: Arc<ThreadComm>, config: &SolverConfig) -> anyhow::Result<Vec<(f64, f64, f64)>> {
    let lattice = config.lattice(&*comm, false)?;
    let psi = State::from_fn(&lattice, |x, y| C64::new((-(x * x + y * y)).exp(), 0.0));

    // cool into the ground state of the centred trap
    let trap = Hamiltonian::new(1.0, 0.0, Potential::from_fn(|x, y| 0.5 * (x * x + y * y)));
    let mut solver = Solver::new(comm.clone(), trap, vec![psi], config.clone())?;
    solver.evolve(2000, true)?;
    let e0 = solver.total_energy()?;
    if comm.rank() == 0 {
        info!(e0, "ground state ready");
    }

    // release it into a displaced trap and follow the energy over one period
    let shifted = Hamiltonian::new(
        1.0, 0.0, Potential::from_fn(|x, y| 0.5 * ((x - OFFSET).powi(2) + y * y)));
    let ground = solver.state(0).context("missing ground state")?.clone();
    let mut solver = Solver::new(comm, shifted, vec![ground], config.clone())?;
    let chunk = 100;
    let chunks = (PERIOD / config.delta_t / chunk as f64).ceil() as usize;
    let mut trace = Vec::with_capacity(chunks + 1);
    trace.push((solver.time(), solver.total_energy()?, solver.squared_norm(Which::Total)?));
    for _ in 0..chunks {
        solver.evolve(chunk, false)?;
        trace.push((solver.time(), solver.total_energy()?, solver.squared_norm(Which::Total)?));
    }
    Ok(trace)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = SolverConfig::new(Grid::square(128, 16.0), 1e-3).with_blocks(64, 64);
    config.apply_env_overrides()?;
    let group = ThreadComm::group(RANKS).into_iter()
        .map(|comm| comm.with_timeout(config.exchange_timeout()))
        .collect();
    let results = ThreadComm::run_group(group, |comm| run(comm, &config));
    let mut results = results.into_iter().collect::<anyhow::Result<Vec<_>>>()?;
    let trace = results.swap_remove(0);

    // a displaced ground state gains OFFSET² / 2 of potential energy
    println!("{:>10} {:>14} {:>14}", "t", "energy", "norm");
    for (t, e, n) in trace.iter() {
        println!("{:10.4} {:14.8} {:14.10}", t, e, n);
    }
    Ok(())
}
