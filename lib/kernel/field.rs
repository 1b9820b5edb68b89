//! Full-resolution, double-precision wave-function storage.

use std::ops::Range;
use ndarray as nd;
use crate::{
    error::{ KernelError, ShapeError },
    kernel::blocks::{ BlockTask, Rect },
};

/// Real and imaginary planes of one component over a tile, halo included.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub real: nd::Array2<f64>,
    pub imag: nd::Array2<f64>,
}

impl Field {
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self { real: nd::Array2::zeros(shape), imag: nd::Array2::zeros(shape) }
    }

    /// Pair up two planes of equal shape.
    pub fn new(real: nd::Array2<f64>, imag: nd::Array2<f64>) -> Result<Self, ShapeError> {
        ShapeError::check(real.dim(), &imag)?;
        Ok(Self { real, imag })
    }

    /// Shape as `(rows, columns)`.
    pub fn dim(&self) -> (usize, usize) { self.real.dim() }

    /// Owned copy of the sites under `rect`.
    pub fn block(&self, rect: &Rect) -> Field {
        Self {
            real: self.real.slice(rect.slice()).to_owned(),
            imag: self.imag.slice(rect.slice()).to_owned(),
        }
    }

    /// Copy the written core of a stepped block back into the tile.
    pub fn write_core(&mut self, block: &Field, task: &BlockTask) {
        let core = task.write.relative_to(&task.read);
        self.real.slice_mut(task.write.slice()).assign(&block.real.slice(core.slice()));
        self.imag.slice_mut(task.write.slice()).assign(&block.imag.slice(core.slice()));
    }

    /// Σ|ψ|² over a region, without the cell area.
    pub fn norm_sum(&self, rows: Range<usize>, cols: Range<usize>) -> f64 {
        let sl = nd::s![rows, cols];
        nd::Zip::from(self.real.slice(sl)).and(self.imag.slice(sl))
            .fold(0.0, |acc, r, i| acc + r * r + i * i)
    }

    pub fn scale(&mut self, factor: f64) {
        self.real.mapv_inplace(|x| x * factor);
        self.imag.mapv_inplace(|x| x * factor);
    }

    /// Copy out a window, failing if it leaves the tile.
    pub fn sample(&self, window: &Rect) -> Result<(nd::Array2<f64>, nd::Array2<f64>), KernelError> {
        check_window(window, self.dim())?;
        Ok((
            self.real.slice(window.slice()).to_owned(),
            self.imag.slice(window.slice()).to_owned(),
        ))
    }
}

/// Fail unless `window` lies inside a tile of shape `(rows, columns)`.
pub fn check_window(window: &Rect, dim: (usize, usize)) -> Result<(), KernelError> {
    let (tile_height, tile_width) = dim;
    let fits = window.x + window.width <= tile_width
        && window.y + window.height <= tile_height;
    fits.then_some(())
        .ok_or(KernelError::BadWindow {
            x: window.x,
            y: window.y,
            width: window.width,
            height: window.height,
            tile_width,
            tile_height,
        })
}
