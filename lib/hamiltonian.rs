//! Hamiltonian terms and the step coefficients derived from them.
//!
//! The Hamiltonian of each component is
//! ```text
//! H = -∇²/2m + V(x, y, t) + g|ψ|² - Ω L_z
//! ```
//! with, for two components, an extra density coupling `g_ab |ψ_a|²|ψ_b|²`
//! and a Rabi term coupling `ψ_a` and `ψ_b` with strength `Ω_R + iΩ_I`.
//! Units are such that ħ = 1.

use std::{ fmt, sync::Arc };
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    error::{ ConfigError, ShapeError },
    lattice::LatticeDescriptor,
};

/// Diagonal (`a`) and off-diagonal (`b`) entries of the two-site kinetic
/// propagator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KineticCoefficients {
    pub a: f64,
    pub b: f64,
}

impl KineticCoefficients {
    /// Coefficients for one link traversed twice per step.
    ///
    /// In real time `(a, b) = (cos θ, sin θ)`, in imaginary time
    /// `(cosh θ, sinh θ)`, with `θ = Δt / (4 m Δx Δy)`.
    pub fn new(delta_t: f64, mass: f64, delta_x: f64, delta_y: f64, imag_time: bool)
        -> Self
    {
        let theta = delta_t / (4.0 * mass * delta_x * delta_y);
        if imag_time {
            Self { a: theta.cosh(), b: theta.sinh() }
        } else {
            let (b, a) = theta.sin_cos();
            Self { a, b }
        }
    }

    /// Coefficients that leave every pair untouched.
    pub fn identity() -> Self { Self { a: 1.0, b: 0.0 } }

    /// Coefficients of the inverse real-time rotation.
    pub fn conjugate(self) -> Self { Self { a: self.a, b: -self.b } }
}

/// Angle per unit distance of the angular-momentum link rotations.
///
/// The link between sites `(x, y)` and `(x, y + Δy)` turns by
/// `alpha_y * x`; the link between `(x, y)` and `(x + Δx, y)` by
/// `alpha_x * y`, positions measured from the rotation centre.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RotationCoefficients {
    pub alpha_x: f64,
    pub alpha_y: f64,
}

impl RotationCoefficients {
    /// Coefficients for angular velocity `omega`; each link set is applied
    /// once on either side of the local step, so each carries half of `Δt`.
    pub fn new(omega: f64, delta_t: f64, delta_x: f64, delta_y: f64) -> Self {
        let tau = 0.5 * delta_t;
        Self {
            alpha_x: -omega * tau / (2.0 * delta_x),
            alpha_y: omega * tau / (2.0 * delta_y),
        }
    }

    pub fn reversed(self) -> Self {
        Self { alpha_x: -self.alpha_x, alpha_y: -self.alpha_y }
    }
}

type StaticFn = dyn Fn(f64, f64) -> f64 + Send + Sync;
type EvolvingFn = dyn Fn(f64, f64, f64) -> f64 + Send + Sync;

#[derive(Clone)]
enum Source {
    Matrix(nd::Array2<f64>),
    Static(Arc<StaticFn>),
    Evolving(Arc<EvolvingFn>),
}

/// External potential acting on one component.
#[derive(Clone)]
pub struct Potential {
    source: Source,
}

impl fmt::Debug for Potential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.source {
            Source::Matrix(m) => format!("Matrix{:?}", m.dim()),
            Source::Static(_) => "Static".to_string(),
            Source::Evolving(_) => "Evolving".to_string(),
        };
        write!(f, "Potential({kind})")
    }
}

impl Default for Potential {
    fn default() -> Self { Self::zero() }
}

impl Potential {
    /// No potential.
    pub fn zero() -> Self { Self::from_fn(|_, _| 0.0) }

    /// Time-independent potential `V(x, y)`.
    pub fn from_fn<F>(f: F) -> Self
    where F: Fn(f64, f64) -> f64 + Send + Sync + 'static
    {
        Self { source: Source::Static(Arc::new(f)) }
    }

    /// Time-dependent potential `V(x, y, t)`, re-sampled every step.
    pub fn from_time_fn<F>(f: F) -> Self
    where F: Fn(f64, f64, f64) -> f64 + Send + Sync + 'static
    {
        Self { source: Source::Evolving(Arc::new(f)) }
    }

    /// Potential given directly on a tile, halo included.
    pub fn from_matrix(values: nd::Array2<f64>) -> Self {
        Self { source: Source::Matrix(values) }
    }

    pub fn is_static(&self) -> bool {
        !matches!(self.source, Source::Evolving(_))
    }

    /// Values over the tile of `lattice` at time `t`.
    pub fn sample(&self, lattice: &LatticeDescriptor, t: f64)
        -> Result<nd::Array2<f64>, ShapeError>
    {
        let shape = lattice.shape();
        match &self.source {
            Source::Matrix(m) => {
                ShapeError::check(shape, m)?;
                Ok(m.clone())
            },
            Source::Static(f) => Ok(nd::Array2::from_shape_fn(shape, |(i, j)| {
                f(lattice.x_coord(j), lattice.y_coord(i))
            })),
            Source::Evolving(f) => Ok(nd::Array2::from_shape_fn(shape, |(i, j)| {
                f(lattice.x_coord(j), lattice.y_coord(i), t)
            })),
        }
    }
}

/// Tile-shaped `exp(-i Δt V)` (or `exp(-Δt V)` in imaginary time).
#[derive(Clone, Debug, PartialEq)]
pub struct PotentialOperator {
    pub real: nd::Array2<f64>,
    pub imag: nd::Array2<f64>,
}

impl PotentialOperator {
    pub fn identity(shape: (usize, usize)) -> Self {
        Self { real: nd::Array2::ones(shape), imag: nd::Array2::zeros(shape) }
    }

    /// Exponentiate sampled potential values over one step.
    pub fn from_values(values: &nd::Array2<f64>, delta_t: f64, imag_time: bool)
        -> Self
    {
        if imag_time {
            Self {
                real: values.mapv(|v| (-delta_t * v).exp()),
                imag: nd::Array2::zeros(values.dim()),
            }
        } else {
            Self {
                real: values.mapv(|v| (-delta_t * v).cos()),
                imag: values.mapv(|v| (-delta_t * v).sin()),
            }
        }
    }

    pub fn dim(&self) -> (usize, usize) { self.real.dim() }
}

/// One species of the Hamiltonian.
#[derive(Clone, Debug)]
pub struct Component {
    pub mass: f64,
    /// Contact self-interaction strength `g`.
    pub coupling: f64,
    pub potential: Potential,
}

impl Component {
    pub fn new(mass: f64, coupling: f64, potential: Potential) -> Self {
        Self { mass, coupling, potential }
    }
}

/// Hamiltonian of one or two coupled components.
#[derive(Clone, Debug)]
pub struct Hamiltonian {
    pub components: Vec<Component>,
    /// Inter-species interaction strength.
    pub coupling_ab: f64,
    /// Rabi coupling `Ω_R + iΩ_I`.
    pub rabi: C64,
    /// Angular velocity of the rotating frame.
    pub angular_velocity: f64,
    /// Rotation centre in physical coordinates.
    pub rot_center: (f64, f64),
}

impl Hamiltonian {
    /// Single component of mass `mass` with self-interaction `coupling`.
    pub fn new(mass: f64, coupling: f64, potential: Potential) -> Self {
        Self {
            components: vec![Component::new(mass, coupling, potential)],
            coupling_ab: 0.0,
            rabi: C64::new(0.0, 0.0),
            angular_velocity: 0.0,
            rot_center: (0.0, 0.0),
        }
    }

    /// Two components coupled by density interaction and Rabi driving.
    pub fn two_component(a: Component, b: Component, coupling_ab: f64, rabi: C64)
        -> Self
    {
        Self {
            components: vec![a, b],
            coupling_ab,
            rabi,
            angular_velocity: 0.0,
            rot_center: (0.0, 0.0),
        }
    }

    /// Evolve in a frame rotating at `omega` about `center`.
    pub fn rotating(mut self, omega: f64, center: (f64, f64)) -> Self {
        self.angular_velocity = omega;
        self.rot_center = center;
        self
    }

    pub fn is_rotating(&self) -> bool { self.angular_velocity != 0.0 }

    pub fn is_two_component(&self) -> bool { self.components.len() == 2 }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=2).contains(&self.components.len()) {
            return Err(ConfigError::Components(
                format!("expected 1 or 2 components, got {}", self.components.len())));
        }
        self.components.iter()
            .try_for_each(|c| ConfigError::check_mass(c.mass))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::lattice::Grid;

    #[test]
    fn coefficients_follow_time_direction() {
        let k = KineticCoefficients::new(0.04, 1.0, 0.1, 0.1, false);
        assert_abs_diff_eq!(k.a * k.a + k.b * k.b, 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(k.b, 1.0f64.sin(), epsilon = 1e-15);
        let k = KineticCoefficients::new(0.04, 1.0, 0.1, 0.1, true);
        assert_abs_diff_eq!(k.a * k.a - k.b * k.b, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn operator_is_unit_modulus_in_real_time() {
        let v = nd::Array2::from_shape_fn((3, 3), |(i, j)| (i * j) as f64);
        let op = PotentialOperator::from_values(&v, 0.1, false);
        nd::Zip::from(&op.real).and(&op.imag)
            .for_each(|r, i| assert_abs_diff_eq!(r * r + i * i, 1.0, epsilon = 1e-14));
        let op = PotentialOperator::from_values(&v, 0.1, true);
        assert_abs_diff_eq!(op.real[[2, 2]], (-0.4f64).exp(), epsilon = 1e-15);
    }

    #[test]
    fn potentials_sample_tile_coordinates() {
        let lat = LatticeDescriptor::new(&Grid::square(4, 4.0), 2, 0, 1, None).unwrap();
        let v = Potential::from_fn(|x, y| x + 10.0 * y).sample(&lat, 0.0).unwrap();
        assert_eq!(v[[0, 0]], -1.5 - 15.0);
        assert_eq!(v[[3, 2]], 0.5 + 15.0);
        let p = Potential::from_time_fn(|_, _, t| t);
        assert!(!p.is_static());
        assert_eq!(p.sample(&lat, 2.5).unwrap()[[1, 1]], 2.5);
        assert!(Potential::from_matrix(nd::Array2::zeros((2, 2))).sample(&lat, 0.0).is_err());
    }
}
