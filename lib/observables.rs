//! Energy and norm observables.
//!
//! Every observable is a sum over owned sites, so each rank computes a local
//! partial sum and one all-reduce completes it. Derivatives use the tile's
//! halo; past a closed global edge the field is taken to be zero.
//!
//! The [`EnergyCache`] memoizes reduced values until the next evolution.
//! Reductions are collective: all ranks must request the same observables in
//! the same order.

use std::collections::HashMap;
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    comm::{ CResult, Communicator },
    kernel::field::Field,
    lattice::LatticeDescriptor,
};

/// Quantities the cache can hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Observable {
    Norm,
    Kinetic,
    Potential,
    Rotational,
    IntraSpecies,
    InterSpecies,
    Rabi,
}

/// Which component an observable is read for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Which {
    First,
    Second,
    /// Both components together.
    #[default]
    Total,
}

/// Globally reduced observables, one entry per component.
#[derive(Clone, Debug, Default)]
pub struct EnergyCache {
    values: HashMap<Observable, [f64; 2]>,
    reductions: usize,
}

impl EnergyCache {
    /// Forget every value; the next read of each observable reduces again.
    pub fn invalidate(&mut self) { self.values.clear(); }

    /// `true` if nothing has been read since the last invalidation.
    pub fn is_stale(&self) -> bool { self.values.is_empty() }

    pub fn get(&self, obs: Observable) -> Option<[f64; 2]> {
        self.values.get(&obs).copied()
    }

    /// Number of global reductions performed so far.
    pub fn reductions(&self) -> usize { self.reductions }

    /// Reduce `local` over all ranks and remember the result.
    pub fn reduce(&mut self, comm: &dyn Communicator, obs: Observable, mut local: [f64; 2])
        -> CResult<[f64; 2]>
    {
        comm.allreduce_sum(&mut local)?;
        self.reductions += 1;
        self.values.insert(obs, local);
        Ok(local)
    }
}

// value at tile-local (i + di, j + dj), zero beyond the tile
fn at(a: &nd::Array2<f64>, i: usize, j: usize, di: isize, dj: isize) -> f64 {
    let (h, w) = a.dim();
    let (ii, jj) = (i as isize + di, j as isize + dj);
    if ii < 0 || jj < 0 || ii >= h as isize || jj >= w as isize {
        0.0
    } else {
        a[[ii as usize, jj as usize]]
    }
}

// sum `f(i, j)` over owned sites, times the cell area
fn owned_sum<F>(lat: &LatticeDescriptor, mut f: F) -> f64
where F: FnMut(usize, usize) -> f64
{
    let mut acc = 0.0;
    for i in lat.inner_rows() {
        for j in lat.inner_cols() {
            acc += f(i, j);
        }
    }
    acc * lat.cell_area()
}

/// Σ|ψ|² ΔxΔy.
pub fn norm(lat: &LatticeDescriptor, f: &Field) -> f64 {
    f.norm_sum(lat.inner_rows(), lat.inner_cols()) * lat.cell_area()
}

/// ⟨ψ| -∇²/2m |ψ⟩ with the five-point Laplacian.
pub fn kinetic(lat: &LatticeDescriptor, f: &Field, mass: f64) -> f64 {
    let (dx2, dy2) = (lat.delta_x.powi(2), lat.delta_y.powi(2));
    let lap = |a: &nd::Array2<f64>, i: usize, j: usize| {
        let c = a[[i, j]];
        (at(a, i, j, 0, 1) + at(a, i, j, 0, -1) - 2.0 * c) / dx2
            + (at(a, i, j, 1, 0) + at(a, i, j, -1, 0) - 2.0 * c) / dy2
    };
    let sum = owned_sum(lat, |i, j| {
        f.real[[i, j]] * lap(&f.real, i, j) + f.imag[[i, j]] * lap(&f.imag, i, j)
    });
    -sum / (2.0 * mass)
}

/// ⟨ψ| V |ψ⟩ for tile-shaped potential values.
pub fn potential(lat: &LatticeDescriptor, f: &Field, v: &nd::Array2<f64>) -> f64 {
    owned_sum(lat, |i, j| {
        v[[i, j]] * (f.real[[i, j]].powi(2) + f.imag[[i, j]].powi(2))
    })
}

/// -Ω⟨ψ| L_z |ψ⟩ with `L_z = -i(x ∂_y - y ∂_x)` about `center`, by central
/// differences.
pub fn rotational(lat: &LatticeDescriptor, f: &Field, omega: f64, center: (f64, f64)) -> f64 {
    let (cx, cy) = center;
    let d = |a: &nd::Array2<f64>, i: usize, j: usize| {
        let x = lat.x_coord(j) - cx;
        let y = lat.y_coord(i) - cy;
        let dy = (at(a, i, j, 1, 0) - at(a, i, j, -1, 0)) / (2.0 * lat.delta_y);
        let dx = (at(a, i, j, 0, 1) - at(a, i, j, 0, -1)) / (2.0 * lat.delta_x);
        x * dy - y * dx
    };
    let lz = owned_sum(lat, |i, j| {
        f.real[[i, j]] * d(&f.imag, i, j) - f.imag[[i, j]] * d(&f.real, i, j)
    });
    -omega * lz
}

/// ½g Σ|ψ|⁴ ΔxΔy.
pub fn intra_species(lat: &LatticeDescriptor, f: &Field, coupling: f64) -> f64 {
    let sum = owned_sum(lat, |i, j| {
        (f.real[[i, j]].powi(2) + f.imag[[i, j]].powi(2)).powi(2)
    });
    0.5 * coupling * sum
}

/// g_ab Σ|ψ_a|²|ψ_b|² ΔxΔy.
pub fn inter_species(lat: &LatticeDescriptor, a: &Field, b: &Field, coupling: f64) -> f64 {
    let sum = owned_sum(lat, |i, j| {
        (a.real[[i, j]].powi(2) + a.imag[[i, j]].powi(2))
            * (b.real[[i, j]].powi(2) + b.imag[[i, j]].powi(2))
    });
    coupling * sum
}

/// 2 Re(Ω ψ_a* ψ_b) summed over owned sites.
pub fn rabi(lat: &LatticeDescriptor, a: &Field, b: &Field, omega: C64) -> f64 {
    owned_sum(lat, |i, j| {
        let pa = C64::new(a.real[[i, j]], a.imag[[i, j]]);
        let pb = C64::new(b.real[[i, j]], b.imag[[i, j]]);
        2.0 * (omega * pa.conj() * pb).re
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{ comm::ThreadComm, lattice::Grid };

    fn plane_wave(lat: &LatticeDescriptor, k: f64) -> Field {
        let phase = nd::Array2::from_shape_fn(lat.shape(), |(_, j)| k * lat.x_coord(j));
        Field { real: phase.mapv(f64::cos), imag: phase.mapv(f64::sin) }
    }

    #[test]
    fn plane_wave_kinetic_energy_matches_dispersion() {
        // periodic box of length 2π with 32 points, k = 2
        let grid = Grid::square(32, std::f64::consts::TAU).periodic(true, true);
        let lat = LatticeDescriptor::new(&grid, 2, 0, 1, None).unwrap();
        let psi = plane_wave(&lat, 2.0);
        let n = norm(&lat, &psi);
        assert_abs_diff_eq!(n, grid.length_x * grid.length_y, epsilon = 1e-9);
        // discrete dispersion 2(1 - cos kΔx)/Δx² over 2m
        let dx = lat.delta_x;
        let expected = (1.0 - (2.0 * dx).cos()) / dx.powi(2);
        assert_abs_diff_eq!(kinetic(&lat, &psi, 1.0) / n, expected, epsilon = 1e-9);
        assert_abs_diff_eq!(intra_species(&lat, &psi, 2.0) / n, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn rabi_energy_of_in_phase_components() {
        let lat = LatticeDescriptor::new(&Grid::square(4, 2.0), 2, 0, 1, None).unwrap();
        let ones = Field { real: nd::Array2::ones((4, 4)), imag: nd::Array2::zeros((4, 4)) };
        // 16 sites of area 0.25
        assert_abs_diff_eq!(rabi(&lat, &ones, &ones, C64::new(0.5, 0.0)), 4.0);
        assert_abs_diff_eq!(rabi(&lat, &ones, &ones, C64::new(0.0, 0.5)), 0.0);
        assert_abs_diff_eq!(inter_species(&lat, &ones, &ones, 3.0), 12.0);
    }

    #[test]
    fn cache_reduces_once_per_observable() {
        let mut cache = EnergyCache::default();
        let comm = ThreadComm::solo();
        assert!(cache.is_stale());
        let v = cache.reduce(&comm, Observable::Norm, [1.0, 2.0]).unwrap();
        assert_eq!(v, [1.0, 2.0]);
        assert_eq!(cache.get(Observable::Norm), Some([1.0, 2.0]));
        assert_eq!(cache.get(Observable::Kinetic), None);
        assert_eq!(cache.reductions(), 1);
        cache.invalidate();
        assert!(cache.get(Observable::Norm).is_none());
        assert_eq!(cache.reductions(), 1);
    }
}
