//! Parity decomposition of a lattice into four quarter-resolution
//! sub-lattices.
//!
//! Site `(x, y)` lives in the sub-lattice selected by the parities of its
//! row and column, at coarse position `(x / 2, y / 2)`. Every nearest-neighbor
//! pair of the full lattice then joins two different sub-lattices at the same
//! (or an adjacent) coarse position, so a sweep over all pairs along one axis
//! is a handful of straight row operations with no branching on parity.

use ndarray::{ self as nd, s };
use num_traits::{ AsPrimitive, Zero };
use crate::Arr2;

/// Parity class of a lattice site as (row parity, column parity).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Parity {
    EvenEven,
    EvenOdd,
    OddEven,
    OddOdd,
}

impl Parity {
    pub const ALL: [Self; 4]
        = [Self::EvenEven, Self::EvenOdd, Self::OddEven, Self::OddOdd];

    /// Position of this class in [`Parity::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::EvenEven => 0,
            Self::EvenOdd => 1,
            Self::OddEven => 2,
            Self::OddOdd => 3,
        }
    }

    /// Row and column offsets `(dy, dx)` of this class within a 2×2 cell.
    pub fn offsets(self) -> (usize, usize) {
        let k = self.index();
        (k / 2, k % 2)
    }

    pub fn of(x: usize, y: usize) -> Self {
        Self::ALL[2 * (y % 2) + x % 2]
    }
}

/// Map a full-resolution site to its sub-lattice and coarse coordinates.
pub fn to_coarse(x: usize, y: usize) -> (Parity, usize, usize) {
    (Parity::of(x, y), x / 2, y / 2)
}

// strided view selecting one parity class
fn class_slice(parity: Parity) -> nd::SliceInfo<[nd::SliceInfoElem; 2], nd::Ix2, nd::Ix2> {
    let (dy, dx) = parity.offsets();
    s![dy as isize..;2, dx as isize..;2]
}

/// Four sub-lattice planes indexed as [`Parity::ALL`].
#[derive(Clone, Debug, PartialEq)]
pub struct Quadrants<T> {
    pub planes: [nd::Array2<T>; 4],
}

impl<T> Quadrants<T>
where T: Copy + Zero + 'static
{
    /// Zero planes for a full-resolution shape `(rows, cols)`.
    ///
    /// *Panics if either extent is odd*.
    pub fn zeros(shape: (usize, usize)) -> Self {
        assert!(shape.0 % 2 == 0 && shape.1 % 2 == 0, "sub-lattice split needs even extents");
        let coarse = (shape.0 / 2, shape.1 / 2);
        Self { planes: std::array::from_fn(|_| nd::Array2::zeros(coarse)) }
    }

    /// Split a full-resolution array, converting elements on the way.
    ///
    /// *Panics if either extent of `full` is odd*.
    pub fn split<S, A>(full: &Arr2<S>) -> Self
    where
        S: nd::Data<Elem = A>,
        A: AsPrimitive<T>,
    {
        let mut q = Self::zeros(full.dim());
        Parity::ALL.into_iter()
            .for_each(|p| {
                nd::Zip::from(&mut q.planes[p.index()])
                    .and(full.slice(class_slice(p)))
                    .for_each(|c, f| { *c = f.as_(); });
            });
        q
    }

    /// Full-resolution shape.
    pub fn full_dim(&self) -> (usize, usize) {
        let (h, w) = self.planes[0].dim();
        (2 * h, 2 * w)
    }

    /// Reassemble the full-resolution array, converting elements on the way.
    pub fn merge<U>(&self) -> nd::Array2<U>
    where
        T: AsPrimitive<U>,
        U: Copy + Zero + 'static,
    {
        let mut full = nd::Array2::zeros(self.full_dim());
        Parity::ALL.into_iter()
            .for_each(|p| {
                nd::Zip::from(full.slice_mut(class_slice(p)))
                    .and(&self.planes[p.index()])
                    .for_each(|f, c| { *f = c.as_(); });
            });
        full
    }

    /// Element at full-resolution site `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> T {
        let (p, cx, cy) = to_coarse(x, y);
        self.planes[p.index()][[cy, cx]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_transform_is_a_bijection() {
        for y in 0..6 {
            for x in 0..8 {
                let (p, cx, cy) = to_coarse(x, y);
                let (dy, dx) = p.offsets();
                assert_eq!((2 * cx + dx, 2 * cy + dy), (x, y));
            }
        }
        assert_eq!(to_coarse(5, 2), (Parity::EvenOdd, 2, 1));
        assert_eq!(to_coarse(4, 3), (Parity::OddEven, 2, 1));
    }

    #[test]
    fn split_places_sites_by_parity() {
        let full = nd::Array2::from_shape_fn((4, 6), |(i, j)| (10 * i + j) as f64);
        let q: Quadrants<f32> = Quadrants::split(&full);
        assert_eq!(q.planes[0].dim(), (2, 3));
        // r01 holds even rows, odd columns
        assert_eq!(q.planes[1][[1, 2]], 25.0);
        // r10 holds odd rows, even columns
        assert_eq!(q.planes[2][[0, 1]], 12.0);
        assert_eq!(q.get(5, 3), 35.0);
        let back: nd::Array2<f64> = q.merge();
        assert_eq!(back, full);
    }
}
