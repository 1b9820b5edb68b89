//! Domain decomposition of a global lattice over a 2D grid of ranks.
//!
//! Each rank owns one rectangular tile of the global lattice, padded with a
//! halo on every edge that borders another tile or wraps around a periodic
//! axis. Index bounds are kept in global lattice coordinates; inside a
//! periodic halo these may be negative or run past the global extent.

use std::ops::Range;
use serde::{ Deserialize, Serialize };
use crate::error::DecompositionError;

pub type LResult<T> = Result<T, DecompositionError>;

/// Global lattice geometry.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grid {
    /// Number of lattice points along x.
    pub dim_x: usize,
    /// Number of lattice points along y.
    pub dim_y: usize,
    /// Physical length along x.
    pub length_x: f64,
    /// Physical length along y.
    pub length_y: f64,
    pub periodic_x: bool,
    pub periodic_y: bool,
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            dim_x: 100,
            dim_y: 100,
            length_x: 20.0,
            length_y: 20.0,
            periodic_x: false,
            periodic_y: false,
        }
    }
}

impl Grid {
    /// Square lattice of `dim × dim` points over a `length × length` box.
    pub fn square(dim: usize, length: f64) -> Self {
        Self { dim_x: dim, dim_y: dim, length_x: length, length_y: length, ..Self::default() }
    }

    /// Set periodicity along both axes.
    pub fn periodic(mut self, x: bool, y: bool) -> Self {
        self.periodic_x = x;
        self.periodic_y = y;
        self
    }
}

/// One of the four axis-aligned neighbor directions.
///
/// `Up` points toward smaller y indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// Ranks of the four axis neighbors; `None` marks a closed global edge.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Neighbors {
    pub up: Option<usize>,
    pub down: Option<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Neighbors {
    pub fn get(&self, dir: Direction) -> Option<usize> {
        match dir {
            Direction::Up => self.up,
            Direction::Down => self.down,
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }
}

/// Extent of a tile along one axis, in global index coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AxisSpan {
    pub start: isize,
    pub end: isize,
    pub inner_start: isize,
    pub inner_end: isize,
}

impl AxisSpan {
    /// Tile extent, halo included.
    pub fn len(&self) -> usize { (self.end - self.start) as usize }

    /// Owned extent.
    pub fn owned(&self) -> usize { (self.inner_end - self.inner_start) as usize }

    /// Owned range in tile-local indices.
    pub fn inner_local(&self) -> Range<usize> {
        (self.inner_start - self.start) as usize
            ..(self.inner_end - self.start) as usize
    }
}

/// Factor `procs` into the most nearly square `[x, y]` process grid, with the
/// larger factor on y.
pub fn dims_create(procs: usize) -> [usize; 2] {
    let mut x = 1;
    let mut d = 1;
    while d * d <= procs {
        if procs % d == 0 { x = d; }
        d += 1;
    }
    [x, procs / x.max(1)]
}

// split one axis for the tile at `coord` out of `dims`; returns the span and
// the halo width actually in use on this axis
fn split_axis(
    axis: char,
    coord: usize,
    dims: usize,
    length: usize,
    halo: usize,
    periodic: bool,
) -> LResult<(AxisSpan, usize)>
{
    if length == 0 || length % 2 != 0 {
        return Err(DecompositionError::OddExtent { axis, extent: length });
    }
    let needs_halo = periodic || dims > 1;
    let halo = if needs_halo { halo } else { 0 };
    if needs_halo && (halo == 0 || halo % 2 != 0) {
        return Err(DecompositionError::BadHalo { axis, width: halo });
    }
    // tiles own whole pairs of sites so every tile starts on an even global
    // index and the pair pattern lines up across tiles; the first `rem` tiles
    // take one extra pair
    let pairs = length / 2;
    let (base, rem) = (pairs / dims, pairs % dims);
    // the last tile is the smallest one; checking it on every rank makes the
    // whole group fail together
    let smallest = 2 * base;
    if smallest == 0 || smallest < halo {
        return Err(DecompositionError::TileTooSmall {
            axis, coord: dims - 1, owned: smallest, halo });
    }
    let inner_start = 2 * (coord * base + coord.min(rem));
    let inner_end = inner_start + 2 * (base + usize::from(coord < rem));
    let has_lo = periodic || coord > 0;
    let has_hi = periodic || coord + 1 < dims;
    let span = AxisSpan {
        start: inner_start as isize - if has_lo { halo as isize } else { 0 },
        end: inner_end as isize + if has_hi { halo as isize } else { 0 },
        inner_start: inner_start as isize,
        inner_end: inner_end as isize,
    };
    Ok((span, halo))
}

// cell-centred physical coordinate of global index `g`
fn axis_coord(g: isize, n: usize, delta: f64, length: f64) -> f64 {
    let g = g.rem_euclid(n as isize);
    (g as f64 + 0.5) * delta - 0.5 * length
}

/// Geometry of one rank's tile.
///
/// Constructed once per rank; immutable afterward.
#[derive(Clone, Debug, PartialEq)]
pub struct LatticeDescriptor {
    /// Tile width, halo included.
    pub dim_x: usize,
    /// Tile height, halo included.
    pub dim_y: usize,
    pub global_dim_x: usize,
    pub global_dim_y: usize,
    pub length_x: f64,
    pub length_y: f64,
    pub delta_x: f64,
    pub delta_y: f64,
    /// Halo width along x; zero if the axis is closed and undivided.
    pub halo_x: usize,
    /// Halo width along y; zero if the axis is closed and undivided.
    pub halo_y: usize,
    /// Periodicity as `[x, y]`.
    pub periods: [bool; 2],
    pub span_x: AxisSpan,
    pub span_y: AxisSpan,
    pub rank: usize,
    pub procs: usize,
    /// Process grid as `[x, y]`.
    pub proc_dims: [usize; 2],
    /// Position of this rank in the process grid as `[x, y]`.
    pub proc_coords: [usize; 2],
    pub neighbors: Neighbors,
}

impl LatticeDescriptor {
    /// Decompose `grid` over `procs` ranks and describe the tile of `rank`.
    ///
    /// Ranks are laid out row-major over the process grid, which defaults to
    /// [`dims_create`]. `halo` is applied to every edge that needs one.
    pub fn new(
        grid: &Grid,
        halo: usize,
        rank: usize,
        procs: usize,
        proc_grid: Option<[usize; 2]>,
    ) -> LResult<Self>
    {
        if procs == 0 { return Err(DecompositionError::NoProcesses); }
        if rank >= procs { return Err(DecompositionError::BadRank(rank, procs)); }
        let proc_dims = proc_grid.unwrap_or_else(|| dims_create(procs));
        if proc_dims[0] * proc_dims[1] != procs {
            return Err(
                DecompositionError::BadProcessGrid(proc_dims[0], proc_dims[1], procs));
        }
        let proc_coords = [rank % proc_dims[0], rank / proc_dims[0]];
        let (span_x, halo_x) = split_axis(
            'x', proc_coords[0], proc_dims[0], grid.dim_x, halo, grid.periodic_x)?;
        let (span_y, halo_y) = split_axis(
            'y', proc_coords[1], proc_dims[1], grid.dim_y, halo, grid.periodic_y)?;

        let rank_of = |cx: usize, cy: usize| cy * proc_dims[0] + cx;
        let step = |c: usize, n: usize, up: bool, periodic: bool| -> Option<usize> {
            match (up, c) {
                (false, 0) => periodic.then_some(n - 1),
                (false, c) => Some(c - 1),
                (true, c) if c + 1 == n => periodic.then_some(0),
                (true, c) => Some(c + 1),
            }
        };
        let [cx, cy] = proc_coords;
        let [nx, ny] = proc_dims;
        let neighbors = Neighbors {
            up: step(cy, ny, false, grid.periodic_y).map(|y| rank_of(cx, y)),
            down: step(cy, ny, true, grid.periodic_y).map(|y| rank_of(cx, y)),
            left: step(cx, nx, false, grid.periodic_x).map(|x| rank_of(x, cy)),
            right: step(cx, nx, true, grid.periodic_x).map(|x| rank_of(x, cy)),
        };

        Ok(Self {
            dim_x: span_x.len(),
            dim_y: span_y.len(),
            global_dim_x: grid.dim_x,
            global_dim_y: grid.dim_y,
            length_x: grid.length_x,
            length_y: grid.length_y,
            delta_x: grid.length_x / grid.dim_x as f64,
            delta_y: grid.length_y / grid.dim_y as f64,
            halo_x,
            halo_y,
            periods: [grid.periodic_x, grid.periodic_y],
            span_x,
            span_y,
            rank,
            procs,
            proc_dims,
            proc_coords,
            neighbors,
        })
    }

    /// Tile shape as `(rows, columns)`, matching [`ndarray`] indexing.
    pub fn shape(&self) -> (usize, usize) { (self.dim_y, self.dim_x) }

    /// Owned columns in tile-local indices.
    pub fn inner_cols(&self) -> Range<usize> { self.span_x.inner_local() }

    /// Owned rows in tile-local indices.
    pub fn inner_rows(&self) -> Range<usize> { self.span_y.inner_local() }

    /// Physical x coordinate of tile-local column `j`.
    pub fn x_coord(&self, j: usize) -> f64 {
        axis_coord(
            self.span_x.start + j as isize,
            self.global_dim_x,
            self.delta_x,
            self.length_x,
        )
    }

    /// Physical y coordinate of tile-local row `i`.
    pub fn y_coord(&self, i: usize) -> f64 {
        axis_coord(
            self.span_y.start + i as isize,
            self.global_dim_y,
            self.delta_y,
            self.length_y,
        )
    }

    /// Area of one lattice cell.
    pub fn cell_area(&self) -> f64 { self.delta_x * self.delta_y }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_are_nearly_square() {
        assert_eq!(dims_create(1), [1, 1]);
        assert_eq!(dims_create(2), [1, 2]);
        assert_eq!(dims_create(4), [2, 2]);
        assert_eq!(dims_create(6), [2, 3]);
        assert_eq!(dims_create(8), [2, 4]);
        assert_eq!(dims_create(7), [1, 7]);
    }

    #[test]
    fn closed_single_tile_has_no_halo() {
        let lat = LatticeDescriptor::new(&Grid::square(16, 4.0), 4, 0, 1, None)
            .unwrap();
        assert_eq!((lat.halo_x, lat.halo_y), (0, 0));
        assert_eq!(lat.shape(), (16, 16));
        assert_eq!(lat.inner_cols(), 0..16);
        assert_eq!(lat.neighbors, Neighbors::default());
    }

    #[test]
    fn periodic_single_tile_wraps_onto_itself() {
        let grid = Grid::square(16, 4.0).periodic(true, false);
        let lat = LatticeDescriptor::new(&grid, 4, 0, 1, None).unwrap();
        assert_eq!(lat.shape(), (16, 24));
        assert_eq!(lat.span_x.start, -4);
        assert_eq!(lat.inner_cols(), 4..20);
        assert_eq!(lat.neighbors.left, Some(0));
        assert_eq!(lat.neighbors.right, Some(0));
        assert_eq!(lat.neighbors.up, None);
        // halo columns sample the wrapped coordinates
        assert_eq!(lat.x_coord(0), lat.x_coord(16));
    }

    #[test]
    fn four_ranks_split_evenly() {
        let grid = Grid::square(32, 8.0);
        let tiles: Vec<_> = (0..4)
            .map(|r| LatticeDescriptor::new(&grid, 4, r, 4, None).unwrap())
            .collect();
        assert_eq!(tiles[0].proc_dims, [2, 2]);
        assert_eq!(tiles[0].span_x, AxisSpan { start: 0, end: 20, inner_start: 0, inner_end: 16 });
        assert_eq!(tiles[3].span_x, AxisSpan { start: 12, end: 32, inner_start: 16, inner_end: 32 });
        assert_eq!(tiles[0].neighbors.right, Some(1));
        assert_eq!(tiles[0].neighbors.down, Some(2));
        assert_eq!(tiles[3].neighbors.up, Some(1));
        assert_eq!(tiles[3].neighbors.left, Some(2));
        assert_eq!(tiles[3].neighbors.right, None);
        let owned: usize = tiles.iter()
            .map(|t| t.span_x.owned() * t.span_y.owned())
            .sum();
        assert_eq!(owned, 32 * 32);
    }

    #[test]
    fn uneven_extents_split_by_pairs() {
        for (dim, halo, expected) in [
            (12, 2, [4, 4, 2, 2]),
            (20, 4, [6, 6, 4, 4]),
            (36, 8, [10, 10, 8, 8]),
            (84, 8, [22, 22, 20, 20]),
        ] {
            let grid = Grid::square(dim, 4.0);
            let spans: Vec<_> = (0..4)
                .map(|r| LatticeDescriptor::new(&grid, halo, r, 4, Some([4, 1])).unwrap().span_x)
                .collect();
            let owned: Vec<_> = spans.iter().map(|s| s.owned()).collect();
            assert_eq!(owned, expected, "dim {dim}");
            assert_eq!(spans[0].inner_start, 0);
            for pair in spans.windows(2) {
                assert_eq!(pair[0].inner_end, pair[1].inner_start);
                assert_eq!(pair[1].inner_start % 2, 0);
            }
            assert_eq!(spans[3].inner_end, dim as isize);
        }
    }

    #[test]
    fn every_rank_rejects_a_too_fine_split() {
        // 8 × 2 owned columns against a halo of 4
        let grid = Grid::square(16, 4.0);
        for rank in 0..8 {
            assert!(matches!(
                LatticeDescriptor::new(&grid, 4, rank, 8, Some([8, 1])),
                Err(DecompositionError::TileTooSmall { axis: 'x', coord: 7, owned: 2, halo: 4 }),
            ));
        }
    }

    #[test]
    fn rejects_bad_decompositions() {
        let grid = Grid::square(16, 4.0);
        assert!(matches!(
            LatticeDescriptor::new(&grid, 4, 0, 6, Some([4, 2])),
            Err(DecompositionError::BadProcessGrid(4, 2, 6)),
        ));
        assert!(matches!(
            LatticeDescriptor::new(&grid, 4, 0, 8, Some([8, 1])),
            Err(DecompositionError::TileTooSmall { axis: 'x', owned: 2, halo: 4, .. }),
        ));
        assert!(matches!(
            LatticeDescriptor::new(&grid, 3, 0, 2, None),
            Err(DecompositionError::BadHalo { axis: 'y', width: 3 }),
        ));
        assert!(matches!(
            LatticeDescriptor::new(&Grid::square(15, 4.0), 2, 0, 1, None),
            Err(DecompositionError::OddExtent { axis: 'x', extent: 15 }),
        ));
        assert!(matches!(
            LatticeDescriptor::new(&grid, 4, 0, 0, None),
            Err(DecompositionError::NoProcesses),
        ));
    }
}
