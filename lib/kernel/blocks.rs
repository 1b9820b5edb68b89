//! Cache blocking of a tile into overlapping blocks.
//!
//! Blocks overlap their neighbors by a margin at least as wide as the reach of
//! one step, read their whole footprint, and write back only their core. The
//! halo pass covers the first and last row-bands plus, in every band in
//! between, both side blocks and any block writing a column that the first
//! exchange wave sends; the interior pass covers everything else. Together
//! the two passes write every site of the tile exactly once.

use std::ops::Range;
use ndarray::{ self as nd, s };

/// Axis-aligned rectangle in tile-local coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    pub fn cols(&self) -> Range<usize> { self.x..self.x + self.width }

    pub fn rows(&self) -> Range<usize> { self.y..self.y + self.height }

    pub fn is_empty(&self) -> bool { self.width == 0 || self.height == 0 }

    /// Slice selecting this rectangle from a row-major 2D array.
    pub fn slice(&self) -> nd::SliceInfo<[nd::SliceInfoElem; 2], nd::Ix2, nd::Ix2> {
        s![self.rows(), self.cols()]
    }

    /// This rectangle relative to the origin of `outer`.
    pub fn relative_to(&self, outer: &Rect) -> Rect {
        Rect::new(self.x - outer.x, self.y - outer.y, self.width, self.height)
    }

    /// Same rectangle at half resolution.
    pub fn coarse(&self) -> Rect {
        Rect::new(self.x / 2, self.y / 2, self.width / 2, self.height / 2)
    }
}

/// One block: the footprint read from the current generation and the part of
/// it written into the next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockTask {
    pub read: Rect,
    pub write: Rect,
}

/// Block extents and overlap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockShape {
    pub width: usize,
    pub height: usize,
    /// Overlap between neighboring blocks along x.
    pub margin_x: usize,
    /// Overlap between neighboring blocks along y.
    pub margin_y: usize,
}

/// Division of one tile into halo-pass and interior-pass blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockPlan {
    pub shape: BlockShape,
    pub tile_width: usize,
    pub tile_height: usize,
}

impl BlockPlan {
    pub fn new(shape: BlockShape, tile_width: usize, tile_height: usize) -> Self {
        Self { shape, tile_width, tile_height }
    }

    // whether a block writes any column that wave 1 sends before the interior
    // pass runs; such blocks belong to the halo pass
    fn feeds_columns(&self, write: &Rect) -> bool {
        let w = self.tile_width;
        let m = self.shape.margin_x;
        let cols = write.cols();
        let hits = |band: Range<usize>| cols.start < band.end && band.start < cols.end;
        hits(m..2 * m) || hits(w.saturating_sub(2 * m)..w.saturating_sub(m))
    }

    // blocks of one row band; `write_offset` and `write_height` select the
    // rows kept from the band. Edge bands go wholly to the halo pass; in the
    // others the side blocks and any block feeding wave 1 do.
    fn band(
        &self,
        read_y: usize,
        read_height: usize,
        write_offset: usize,
        write_height: usize,
        edge: bool,
        halo_pass: bool,
        out: &mut Vec<BlockTask>,
    ) {
        let w = self.tile_width;
        let bw = self.shape.width;
        let m = self.shape.margin_x;
        let task = |x: usize, width: usize, write_x: usize, write_width: usize| {
            BlockTask {
                read: Rect::new(x, read_y, width, read_height),
                write: Rect::new(
                    write_x, read_y + write_offset, write_width, write_height),
            }
        };
        let mut keep = |t: BlockTask, side: bool| {
            let in_halo = edge || side || self.feeds_columns(&t.write);
            if in_halo == halo_pass { out.push(t); }
        };
        if w <= bw {
            keep(task(0, w, 0, w), true);
            return;
        }
        let step = bw - 2 * m;
        keep(task(0, bw, 0, bw - m), true);
        let mut start = step;
        while start < w - bw {
            keep(task(start, bw, start + m, step), false);
            start += step;
        }
        keep(task(start, w - start, start + m, w - start - m), true);
    }

    /// Blocks of the halo pass.
    ///
    /// Their writes cover the column bands wave 1 sends, so the exchange can
    /// start before the interior pass.
    pub fn halo_tasks(&self) -> Vec<BlockTask> {
        self.tasks(true)
    }

    /// Blocks of the interior pass.
    pub fn interior_tasks(&self) -> Vec<BlockTask> {
        self.tasks(false)
    }

    fn tasks(&self, halo_pass: bool) -> Vec<BlockTask> {
        let h = self.tile_height;
        let bh = self.shape.height;
        let m = self.shape.margin_y;
        let mut out = Vec::new();
        if h <= bh {
            self.band(0, h, 0, h, true, halo_pass, &mut out);
            return out;
        }
        let step = bh - 2 * m;
        self.band(0, bh, 0, bh - m, true, halo_pass, &mut out);
        let mut start = step;
        while start < h - bh {
            self.band(start, bh, m, step, false, halo_pass, &mut out);
            start += step;
        }
        self.band(start, h - start, m, h - start - m, true, halo_pass, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(width: usize, height: usize, margin: usize) -> BlockShape {
        BlockShape { width, height, margin_x: margin, margin_y: margin }
    }

    // every site written exactly once, each write inside its read footprint
    // and at least a margin away from any footprint edge that is not a tile
    // edge
    fn check_cover(plan: &BlockPlan) {
        let mut hits = nd::Array2::<u32>::zeros((plan.tile_height, plan.tile_width));
        let tasks = plan.halo_tasks().into_iter().chain(plan.interior_tasks());
        for t in tasks {
            let (r, w) = (t.read, t.write);
            assert!(r.width <= plan.shape.width && r.height <= plan.shape.height);
            let m = plan.shape.margin_x;
            if r.x > 0 { assert!(w.x >= r.x + m, "{t:?}"); }
            if r.x + r.width < plan.tile_width {
                assert!(w.x + w.width + m <= r.x + r.width, "{t:?}");
            }
            if r.y > 0 { assert!(w.y >= r.y + m, "{t:?}"); }
            if r.y + r.height < plan.tile_height {
                assert!(w.y + w.height + m <= r.y + r.height, "{t:?}");
            }
            hits.slice_mut(w.slice()).mapv_inplace(|k| k + 1);
        }
        assert!(hits.iter().all(|&k| k == 1), "{hits:?}");
    }

    #[test]
    fn single_block_tile_has_no_interior_pass() {
        let plan = BlockPlan::new(shape(128, 128, 4), 40, 24);
        assert_eq!(
            plan.halo_tasks(),
            vec![BlockTask { read: Rect::new(0, 0, 40, 24), write: Rect::new(0, 0, 40, 24) }],
        );
        assert!(plan.interior_tasks().is_empty());
    }

    #[test]
    fn blocks_cover_tile_once() {
        for (tw, th) in [(40, 40), (34, 58), (36, 36), (64, 20), (20, 64), (28, 28)] {
            check_cover(&BlockPlan::new(shape(16, 16, 4), tw, th));
            check_cover(&BlockPlan::new(shape(20, 12, 2), tw, th));
        }
    }

    #[test]
    fn halo_pass_writes_every_sent_column() {
        // 50 = 2 mod 16 puts the last side block past the right send band
        for (tw, th) in [(50, 58), (54, 54), (38, 70), (66, 40), (82, 82)] {
            let plan = BlockPlan::new(shape(32, 32, 8), tw, th);
            check_cover(&plan);
            let mut written = nd::Array2::<bool>::from_elem((th, tw), false);
            for t in plan.halo_tasks() {
                written.slice_mut(t.write.slice()).fill(true);
            }
            for cols in [8..16, tw - 16..tw - 8] {
                assert!(
                    written.slice(s![.., cols.clone()]).iter().all(|&b| b),
                    "tile {tw}×{th}, columns {cols:?}",
                );
            }
        }
    }

    #[test]
    fn exact_multiples_leave_no_gap() {
        // tile - block is a whole number of strides
        check_cover(&BlockPlan::new(shape(16, 16, 4), 24, 24));
        check_cover(&BlockPlan::new(shape(16, 16, 4), 32, 32));
        let plan = BlockPlan::new(shape(16, 16, 4), 48, 48);
        assert!(!plan.interior_tasks().is_empty());
        check_cover(&plan);
    }
}
