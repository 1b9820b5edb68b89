//! Two-wave exchange of tile halos between neighboring ranks.
//!
//! The first wave trades column bands over the owned rows with the left and
//! right neighbors; the second trades full-width row bands with the up and
//! down neighbors. Because the row bands include the column halos filled by
//! the first wave, corner halos arrive from diagonal neighbors without any
//! diagonal messages. Edges without a neighbor exchange nothing.

use std::sync::Arc;
use tracing::trace;
use crate::{
    comm::{ CResult, Communicator },
    error::CommError,
    kernel::{ blocks::Rect, field::Field },
    lattice::{ Direction, LatticeDescriptor, Neighbors },
};

/// Storage whose planes can be packed into and unpacked from messages.
pub trait HaloPlanes {
    /// Number of independently exchanged planes.
    fn plane_count(&self) -> usize;

    /// Values of one plane under a full-resolution rectangle, row-major.
    fn pack(&self, plane: usize, rect: &Rect) -> Vec<f64>;

    /// Number of values [`pack`][Self::pack] produces for `rect`.
    fn packed_len(&self, rect: &Rect) -> usize;

    /// Overwrite one plane under `rect` with packed values.
    ///
    /// `data` must hold exactly [`packed_len`][Self::packed_len] values.
    fn unpack(&mut self, plane: usize, rect: &Rect, data: &[f64]);
}

impl HaloPlanes for Field {
    fn plane_count(&self) -> usize { 2 }

    fn pack(&self, plane: usize, rect: &Rect) -> Vec<f64> {
        let src = if plane == 0 { &self.real } else { &self.imag };
        src.slice(rect.slice()).iter().copied().collect()
    }

    fn packed_len(&self, rect: &Rect) -> usize { rect.width * rect.height }

    fn unpack(&mut self, plane: usize, rect: &Rect, data: &[f64]) {
        let dst = if plane == 0 { &mut self.real } else { &mut self.imag };
        dst.slice_mut(rect.slice()).iter_mut()
            .zip(data)
            .for_each(|(d, s)| { *d = *s; });
    }
}

/// Which band set a wave trades.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wave {
    /// Column bands with the left and right neighbors.
    Columns,
    /// Full-width row bands with the up and down neighbors.
    Rows,
}

// tag of a message travelling in direction `dir`
fn tag(dir: Direction, plane: usize) -> u32 {
    let d = match dir {
        Direction::Up => 0,
        Direction::Down => 1,
        Direction::Left => 2,
        Direction::Right => 3,
    };
    d * 64 + plane as u32
}

#[derive(Clone, Debug)]
struct Posted {
    source: usize,
    tag: u32,
    plane: usize,
    rect: Rect,
}

/// Halo exchange state for one tile.
///
/// Sends go out as soon as a wave is posted; receives complete when the wave
/// is finished. At most one wave is in flight at a time.
pub struct HaloExchange {
    comm: Arc<dyn Communicator>,
    neighbors: Neighbors,
    tile_width: usize,
    inner_x: (usize, usize),
    inner_y: (usize, usize),
    halo_x: usize,
    halo_y: usize,
    posted: Vec<Posted>,
}

impl std::fmt::Debug for HaloExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaloExchange")
            .field("rank", &self.comm.rank())
            .field("neighbors", &self.neighbors)
            .field("in_flight", &self.posted.len())
            .finish()
    }
}

impl HaloExchange {
    pub fn new(lattice: &LatticeDescriptor, comm: Arc<dyn Communicator>) -> Self {
        let cols = lattice.inner_cols();
        let rows = lattice.inner_rows();
        Self {
            comm,
            neighbors: lattice.neighbors,
            tile_width: lattice.dim_x,
            inner_x: (cols.start, cols.end),
            inner_y: (rows.start, rows.end),
            halo_x: lattice.halo_x,
            halo_y: lattice.halo_y,
            posted: Vec::new(),
        }
    }

    pub fn in_flight(&self) -> bool { !self.posted.is_empty() }

    // (neighbor, rect received into, rect sent, direction of travel of the
    // outgoing message) for each side of a wave
    fn bands(&self, wave: Wave) -> Vec<(usize, Rect, Rect, Direction)> {
        let mut out = Vec::with_capacity(2);
        match wave {
            Wave::Columns => {
                let (y0, y1) = self.inner_y;
                let (x0, x1) = self.inner_x;
                let hx = self.halo_x;
                if let Some(left) = self.neighbors.left {
                    out.push((
                        left,
                        Rect::new(x0 - hx, y0, hx, y1 - y0),
                        Rect::new(x0, y0, hx, y1 - y0),
                        Direction::Left,
                    ));
                }
                if let Some(right) = self.neighbors.right {
                    out.push((
                        right,
                        Rect::new(x1, y0, hx, y1 - y0),
                        Rect::new(x1 - hx, y0, hx, y1 - y0),
                        Direction::Right,
                    ));
                }
            },
            Wave::Rows => {
                let (y0, y1) = self.inner_y;
                let w = self.tile_width;
                let hy = self.halo_y;
                if let Some(up) = self.neighbors.up {
                    out.push((
                        up,
                        Rect::new(0, y0 - hy, w, hy),
                        Rect::new(0, y0, w, hy),
                        Direction::Up,
                    ));
                }
                if let Some(down) = self.neighbors.down {
                    out.push((
                        down,
                        Rect::new(0, y1, w, hy),
                        Rect::new(0, y1 - hy, w, hy),
                        Direction::Down,
                    ));
                }
            },
        }
        out
    }

    /// Send the bands of one wave out of `field` and remember the matching
    /// receives.
    pub fn post<F: HaloPlanes>(&mut self, wave: Wave, field: &F) -> CResult<()> {
        debug_assert!(self.posted.is_empty(), "halo wave already in flight");
        for (peer, recv_rect, send_rect, dir) in self.bands(wave) {
            for plane in 0..field.plane_count() {
                self.comm.send(peer, tag(dir, plane), field.pack(plane, &send_rect))?;
                self.posted.push(Posted {
                    source: peer,
                    // the neighbor's message towards us travels the other way
                    tag: tag(dir.opposite(), plane),
                    plane,
                    rect: recv_rect,
                });
            }
        }
        trace!(rank = self.comm.rank(), ?wave, posted = self.posted.len(), "halo wave posted");
        Ok(())
    }

    /// Wait for every posted receive and write it into `field`.
    pub fn complete<F: HaloPlanes>(&mut self, field: &mut F) -> CResult<()> {
        for Posted { source, tag, plane, rect } in self.posted.drain(..) {
            let data = self.comm.recv(source, tag)?;
            let expected = field.packed_len(&rect);
            if data.len() != expected {
                return Err(CommError::SizeMismatch {
                    peer: source, tag, expected, got: data.len() });
            }
            field.unpack(plane, &rect, &data);
        }
        Ok(())
    }

    /// Run both waves to completion on `field`.
    pub fn exchange<F: HaloPlanes>(&mut self, field: &mut F) -> CResult<()> {
        self.post(Wave::Columns, field)?;
        self.complete(field)?;
        self.post(Wave::Rows, field)?;
        self.complete(field)
    }
}
