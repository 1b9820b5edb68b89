//! Wave functions as handed to and read back from a solver.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    error::ShapeError,
    kernel::field::Field,
    lattice::LatticeDescriptor,
};

/// One component's wave function over a rank's tile, halo included.
///
/// Halo values need not be filled in: kernels exchange halos before their
/// first step.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub(crate) field: Field,
}

impl State {
    /// Zero everywhere.
    pub fn new(lattice: &LatticeDescriptor) -> Self {
        Self { field: Field::zeros(lattice.shape()) }
    }

    /// Sample `f(x, y)` at the physical coordinates of every tile site.
    ///
    /// ```
    /// use num_complex::Complex64 as C64;
    /// use trotter::{ lattice::{ Grid, LatticeDescriptor }, state::State };
    ///
    /// let lattice = LatticeDescriptor::new(&Grid::square(8, 4.0), 4, 0, 1, None).unwrap();
    /// let psi = State::from_fn(&lattice, |x, y| C64::new((-x * x - y * y).exp(), 0.0));
    /// assert_eq!(psi.real().dim(), (8, 8));
    /// ```
    pub fn from_fn<F>(lattice: &LatticeDescriptor, f: F) -> Self
    where F: Fn(f64, f64) -> C64
    {
        let values = nd::Array2::from_shape_fn(lattice.shape(), |(i, j)| {
            f(lattice.x_coord(j), lattice.y_coord(i))
        });
        Self {
            field: Field {
                real: values.mapv(|z| z.re),
                imag: values.mapv(|z| z.im),
            },
        }
    }

    /// Take tile-shaped real and imaginary parts.
    pub fn from_arrays(
        lattice: &LatticeDescriptor,
        real: nd::Array2<f64>,
        imag: nd::Array2<f64>,
    ) -> Result<Self, ShapeError>
    {
        ShapeError::check(lattice.shape(), &real)?;
        Ok(Self { field: Field::new(real, imag)? })
    }

    pub fn real(&self) -> &nd::Array2<f64> { &self.field.real }

    pub fn imag(&self) -> &nd::Array2<f64> { &self.field.imag }

    /// `|ψ|²` over the whole tile.
    pub fn density(&self) -> nd::Array2<f64> {
        nd::Zip::from(&self.field.real).and(&self.field.imag)
            .map_collect(|r, i| r * r + i * i)
    }

    /// Real and imaginary parts over the owned sites only.
    pub fn owned(&self, lattice: &LatticeDescriptor)
        -> (nd::ArrayView2<'_, f64>, nd::ArrayView2<'_, f64>)
    {
        let sl = nd::s![lattice.inner_rows(), lattice.inner_cols()];
        (self.field.real.slice(sl), self.field.imag.slice(sl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::Grid;

    #[test]
    fn closures_are_sampled_on_wrapped_coordinates() {
        let grid = Grid::square(8, 8.0).periodic(true, false);
        let lat = LatticeDescriptor::new(&grid, 2, 0, 1, None).unwrap();
        let psi = State::from_fn(&lat, |x, y| C64::new(x, y));
        // left halo column mirrors the last owned column
        assert_eq!(psi.real().column(0), psi.real().column(8));
        assert_eq!(psi.imag()[[0, 0]], lat.y_coord(0));
        let (re, _) = psi.owned(&lat);
        assert_eq!(re.dim(), (8, 8));
        assert_eq!(re[[0, 0]], -3.5);
    }

    #[test]
    fn arrays_must_match_tile() {
        let lat = LatticeDescriptor::new(&Grid::square(4, 1.0), 2, 0, 1, None).unwrap();
        assert!(State::from_arrays(&lat, nd::Array2::ones((4, 4)), nd::Array2::zeros((4, 4))).is_ok());
        assert!(State::from_arrays(&lat, nd::Array2::ones((4, 4)), nd::Array2::zeros((4, 2))).is_err());
        assert!(State::from_arrays(&lat, nd::Array2::ones((2, 4)), nd::Array2::zeros((2, 4))).is_err());
    }
}
