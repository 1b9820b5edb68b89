//! Single-precision SIMD kernel on the four-sublattice layout.
//!
//! Each tile is stored as four quarter-resolution planes per part (see
//! [`sublattice`][crate::sublattice]), so every kinetic sweep becomes a set of
//! row operations between two planes, vectorized with [`pulp`]. Lanes left
//! over at the end of a row go through the same pair operations one at a time
//! and give bit-identical results.

use std::{ ops::Range, sync::Arc };
use ndarray as nd;
use pulp::{ Arch, Simd, WithSimd };
use tracing::debug;
use crate::{
    buffer::DoubleBuffer,
    comm::Communicator,
    error::{ ConfigError, KernelError, ShapeError },
    hamiltonian::PotentialOperator,
    kernel::{
        Call,
        EvolutionKernel,
        KResult,
        KernelPhase,
        KernelSetup,
        Protocol,
        blocks::{ BlockPlan, BlockTask, Rect },
        field::{ Field, check_window },
        halo::{ HaloExchange, HaloPlanes, Wave },
        stencil::{ StepParams, mix_pair, rotate_pair },
    },
    lattice::LatticeDescriptor,
    sublattice::Quadrants,
};

/// Real and imaginary parts as single-precision sub-lattice planes.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadField {
    pub real: Quadrants<f32>,
    pub imag: Quadrants<f32>,
}

impl QuadField {
    pub fn from_field(field: &Field) -> Self {
        Self { real: Quadrants::split(&field.real), imag: Quadrants::split(&field.imag) }
    }

    pub fn from_operator(op: &PotentialOperator) -> Self {
        Self { real: Quadrants::split(&op.real), imag: Quadrants::split(&op.imag) }
    }

    fn plane(&self, plane: usize) -> &nd::Array2<f32> {
        if plane < 4 { &self.real.planes[plane] } else { &self.imag.planes[plane - 4] }
    }

    fn plane_mut(&mut self, plane: usize) -> &mut nd::Array2<f32> {
        if plane < 4 { &mut self.real.planes[plane] } else { &mut self.imag.planes[plane - 4] }
    }

    // flat copies of the coarse planes under a full-resolution rectangle
    fn block(&self, rect: &Rect) -> QuadBlock {
        let c = rect.coarse();
        let take = |p: &nd::Array2<f32>| -> Vec<f32> {
            p.slice(c.slice()).iter().copied().collect()
        };
        QuadBlock {
            width: c.width,
            height: c.height,
            re: std::array::from_fn(|q| take(&self.real.planes[q])),
            im: std::array::from_fn(|q| take(&self.imag.planes[q])),
        }
    }

    fn write_core(&mut self, block: &QuadBlock, task: &BlockTask) {
        let core = task.write.relative_to(&task.read).coarse();
        let dst = task.write.coarse();
        let planes = block.re.iter().chain(&block.im);
        for (k, src) in planes.enumerate() {
            self.plane_mut(k).slice_mut(dst.slice())
                .indexed_iter_mut()
                .for_each(|((i, j), v)| {
                    *v = src[(core.y + i) * block.width + core.x + j];
                });
        }
    }

    // Σ|ψ|² over an even-aligned region
    fn norm_sum(&self, rows: Range<usize>, cols: Range<usize>) -> f64 {
        let c = Rect::new(cols.start, rows.start, cols.len(), rows.len()).coarse();
        (0..8).map(|k| {
            self.plane(k).slice(c.slice()).iter()
                .map(|&x| (x as f64) * (x as f64))
                .sum::<f64>()
        })
        .sum()
    }

    fn scale(&mut self, factor: f32) {
        (0..8).for_each(|k| self.plane_mut(k).mapv_inplace(|x| x * factor));
    }

    fn sample(&self, window: &Rect) -> KResult<(nd::Array2<f64>, nd::Array2<f64>)> {
        check_window(window, self.real.full_dim())?;
        if window.x == 0 && window.y == 0
            && (window.height, window.width) == self.real.full_dim()
        {
            return Ok((self.real.merge(), self.imag.merge()));
        }
        let pick = |q: &Quadrants<f32>| {
            nd::Array2::from_shape_fn((window.height, window.width), |(i, j)| {
                q.get(window.x + j, window.y + i) as f64
            })
        };
        Ok((pick(&self.real), pick(&self.imag)))
    }
}

impl HaloPlanes for QuadField {
    fn plane_count(&self) -> usize { 8 }

    fn pack(&self, plane: usize, rect: &Rect) -> Vec<f64> {
        self.plane(plane).slice(rect.coarse().slice()).iter()
            .map(|&x| x as f64)
            .collect()
    }

    fn packed_len(&self, rect: &Rect) -> usize { rect.width * rect.height / 4 }

    fn unpack(&mut self, plane: usize, rect: &Rect, data: &[f64]) {
        self.plane_mut(plane).slice_mut(rect.coarse().slice()).iter_mut()
            .zip(data)
            .for_each(|(d, s)| { *d = *s as f32; });
    }
}

/// Row-major copy of the eight coarse planes of one block.
#[derive(Clone, Debug, PartialEq)]
struct QuadBlock {
    width: usize,
    height: usize,
    re: [Vec<f32>; 4],
    im: [Vec<f32>; 4],
}

/// Single-precision step parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
struct QuadParams {
    a: f32,
    b: f32,
    g_self: f32,
    imag_time: bool,
}

impl From<&StepParams> for QuadParams {
    fn from(p: &StepParams) -> Self {
        Self {
            a: p.kinetic.a as f32,
            b: p.kinetic.b as f32,
            g_self: p.g_self as f32,
            imag_time: p.imag_time,
        }
    }
}

#[inline(always)]
fn rotate_lanes<S: Simd>(
    simd: S,
    k: &QuadParams,
    r1: &mut [f32],
    i1: &mut [f32],
    r2: &mut [f32],
    i2: &mut [f32],
) {
    let (r1h, r1t) = S::f32s_as_mut_simd(r1);
    let (i1h, i1t) = S::f32s_as_mut_simd(i1);
    let (r2h, r2t) = S::f32s_as_mut_simd(r2);
    let (i2h, i2t) = S::f32s_as_mut_simd(i2);
    let a = simd.f32s_splat(k.a);
    let b = simd.f32s_splat(k.b);
    let heads = r1h.iter_mut().zip(i1h.iter_mut()).zip(r2h.iter_mut()).zip(i2h.iter_mut());
    if k.imag_time {
        for (((x1, y1), x2), y2) in heads {
            let (p1, q1, p2, q2) = (*x1, *y1, *x2, *y2);
            *x1 = simd.f32s_add(simd.f32s_mul(a, p1), simd.f32s_mul(b, p2));
            *y1 = simd.f32s_add(simd.f32s_mul(a, q1), simd.f32s_mul(b, q2));
            *x2 = simd.f32s_add(simd.f32s_mul(a, p2), simd.f32s_mul(b, p1));
            *y2 = simd.f32s_add(simd.f32s_mul(a, q2), simd.f32s_mul(b, q1));
        }
    } else {
        for (((x1, y1), x2), y2) in heads {
            let (p1, q1, p2, q2) = (*x1, *y1, *x2, *y2);
            *x1 = simd.f32s_sub(simd.f32s_mul(a, p1), simd.f32s_mul(b, q2));
            *y1 = simd.f32s_add(simd.f32s_mul(a, q1), simd.f32s_mul(b, p2));
            *x2 = simd.f32s_sub(simd.f32s_mul(a, p2), simd.f32s_mul(b, q1));
            *y2 = simd.f32s_add(simd.f32s_mul(a, q2), simd.f32s_mul(b, p1));
        }
    }
    let op = if k.imag_time { mix_pair::<f32> } else { rotate_pair::<f32> };
    r1t.iter_mut().zip(i1t.iter_mut()).zip(r2t.iter_mut()).zip(i2t.iter_mut())
        .for_each(|(((x1, y1), x2), y2)| op(k.a, k.b, x1, y1, x2, y2));
}

// pair row i of plane 1 with row i + offset of plane 2
#[allow(clippy::too_many_arguments)]
#[inline(always)]
fn shift_y<S: Simd>(
    simd: S,
    k: &QuadParams,
    offset: usize,
    (w, h): (usize, usize),
    r1: &mut [f32],
    i1: &mut [f32],
    r2: &mut [f32],
    i2: &mut [f32],
) {
    for i in 0..h.saturating_sub(offset) {
        let a = i * w..(i + 1) * w;
        let b = (i + offset) * w..(i + offset + 1) * w;
        rotate_lanes(simd, k, &mut r1[a.clone()], &mut i1[a], &mut r2[b.clone()], &mut i2[b]);
    }
}

// pair column j of plane 1 with column j + offset of plane 2, row by row
#[allow(clippy::too_many_arguments)]
#[inline(always)]
fn shift_x<S: Simd>(
    simd: S,
    k: &QuadParams,
    offset: usize,
    (w, h): (usize, usize),
    r1: &mut [f32],
    i1: &mut [f32],
    r2: &mut [f32],
    i2: &mut [f32],
) {
    if w <= offset { return; }
    for i in 0..h {
        let a = i * w..(i + 1) * w - offset;
        let b = i * w + offset..(i + 1) * w;
        rotate_lanes(simd, k, &mut r1[a.clone()], &mut i1[a], &mut r2[b.clone()], &mut i2[b]);
    }
}

#[derive(Copy, Clone, Debug)]
enum Sweep { V0, H0, V1, H1 }

// one kinetic half-step; planes are ordered as `Parity::ALL`
fn kinetic_half<S: Simd>(simd: S, k: &QuadParams, block: &mut QuadBlock, reverse: bool) {
    let dim = (block.width, block.height);
    let [r00, r01, r10, r11] = &mut block.re;
    let [i00, i01, i10, i11] = &mut block.im;
    let mut order = [Sweep::V0, Sweep::H0, Sweep::V1, Sweep::H1];
    if reverse { order.reverse(); }
    for sweep in order {
        match sweep {
            Sweep::V0 => {
                shift_y(simd, k, 0, dim, r00, i00, r10, i10);
                shift_y(simd, k, 0, dim, r01, i01, r11, i11);
            },
            Sweep::H0 => {
                shift_x(simd, k, 0, dim, r00, i00, r01, i01);
                shift_x(simd, k, 0, dim, r10, i10, r11, i11);
            },
            Sweep::V1 => {
                shift_y(simd, k, 1, dim, r10, i10, r00, i00);
                shift_y(simd, k, 1, dim, r11, i11, r01, i01);
            },
            Sweep::H1 => {
                shift_x(simd, k, 1, dim, r01, i01, r00, i00);
                shift_x(simd, k, 1, dim, r11, i11, r10, i10);
            },
        }
    }
}

fn local_quad(k: &QuadParams, block: &mut QuadBlock, pot: &QuadBlock) {
    let planes = block.re.iter_mut().zip(block.im.iter_mut())
        .zip(pot.re.iter().zip(&pot.im));
    for ((re, im), (pre, pim)) in planes {
        let sites = re.iter_mut().zip(im.iter_mut()).zip(pre.iter().zip(pim));
        for ((r, i), (pr, pi)) in sites {
            let (x, y) = (*r, *i);
            let (mut nr, mut ni) = (pr * x - pi * y, pr * y + pi * x);
            let phi = k.g_self * (x * x + y * y);
            if phi != 0.0 {
                if k.imag_time {
                    let f = (-phi).exp();
                    nr *= f;
                    ni *= f;
                } else {
                    let (s, c) = (-phi).sin_cos();
                    (nr, ni) = (c * nr - s * ni, c * ni + s * nr);
                }
            }
            *r = nr;
            *i = ni;
        }
    }
}

struct QuadStep<'a> {
    block: &'a mut QuadBlock,
    pot: &'a QuadBlock,
    params: &'a QuadParams,
}

impl WithSimd for QuadStep<'_> {
    type Output = ();

    #[inline(always)]
    fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
        let QuadStep { block, pot, params } = self;
        kinetic_half(simd, params, block, false);
        local_quad(params, block, pot);
        kinetic_half(simd, params, block, true);
    }
}

fn step_quad(params: &QuadParams, block: &mut QuadBlock, pot: &QuadBlock) {
    Arch::new().dispatch(QuadStep { block, pot, params });
}

/// Single-component, single-precision SIMD kernel.
pub struct SimdKernel {
    lattice: LatticeDescriptor,
    comm: Arc<dyn Communicator>,
    halo_tasks: Vec<BlockTask>,
    interior_tasks: Vec<BlockTask>,
    state: DoubleBuffer<QuadField>,
    operator: QuadField,
    params: QuadParams,
    imag_time: bool,
    halo: HaloExchange,
    protocol: Protocol,
}

impl SimdKernel {
    /// Convert the setup's only field to the sub-lattice layout and prime its
    /// halos.
    pub fn new(setup: KernelSetup) -> KResult<Self> {
        let KernelSetup { lattice, comm, fields, operators, params, imag_time, blocks, .. }
            = setup;
        let (Some(field), Some(op), Some(p)) = (fields.first(), operators.first(), params.first())
        else {
            return Err(ConfigError::Components("no component to evolve".into()).into());
        };
        let plan = BlockPlan::new(blocks, lattice.dim_x, lattice.dim_y);
        let mut state = QuadField::from_field(field);
        let mut halo = HaloExchange::new(&lattice, comm.clone());
        halo.exchange(&mut state)?;
        debug!(rank = lattice.rank, tile = ?lattice.shape(), "vectorized kernel ready");
        Ok(Self {
            halo_tasks: plan.halo_tasks(),
            interior_tasks: plan.interior_tasks(),
            operator: QuadField::from_operator(op),
            params: p.into(),
            state: DoubleBuffer::new(state),
            lattice,
            comm,
            imag_time,
            halo,
            protocol: Protocol::default(),
        })
    }

    fn run_tasks(&mut self, interior: bool) {
        let count = if interior { self.interior_tasks.len() } else { self.halo_tasks.len() };
        for k in 0..count {
            let task = if interior { self.interior_tasks[k] } else { self.halo_tasks[k] };
            let mut block = self.state.current().block(&task.read);
            let pot = self.operator.block(&task.read);
            step_quad(&self.params, &mut block, &pot);
            self.state.next_mut().write_core(&block, &task);
        }
    }
}

impl EvolutionKernel for SimdKernel {
    fn name(&self) -> &'static str { "Vectorized" }

    fn phase(&self) -> KernelPhase { self.protocol.phase() }

    fn run_kernel_on_halo(&mut self) -> KResult<()> {
        self.protocol.check(Call::Halo)?;
        self.run_tasks(false);
        self.protocol.advance(Call::Halo);
        Ok(())
    }

    fn start_halo_exchange(&mut self) -> KResult<()> {
        self.protocol.check(Call::StartExchange)?;
        self.halo.post(Wave::Columns, self.state.next())?;
        self.protocol.advance(Call::StartExchange);
        Ok(())
    }

    fn run_kernel(&mut self) -> KResult<()> {
        self.protocol.check(Call::Interior)?;
        self.run_tasks(true);
        self.protocol.advance(Call::Interior);
        Ok(())
    }

    fn finish_halo_exchange(&mut self) -> KResult<()> {
        self.protocol.check(Call::FinishExchange)?;
        self.halo.complete(self.state.next_mut())?;
        self.state.swap();
        self.halo.post(Wave::Rows, self.state.current())?;
        self.halo.complete(self.state.current_mut())?;
        self.protocol.advance(Call::FinishExchange);
        Ok(())
    }

    fn wait_for_completion(&mut self) -> KResult<()> {
        self.protocol.check(Call::Complete)?;
        if self.imag_time {
            let norm2 = self.squared_norm(true)?;
            KernelError::check_norm(norm2)?;
            self.state.current_mut().scale(norm2.sqrt().recip() as f32);
        }
        self.protocol.advance(Call::Complete);
        Ok(())
    }

    fn get_sample(&self, component: usize, window: Rect)
        -> KResult<(nd::Array2<f64>, nd::Array2<f64>)>
    {
        if component != 0 { return Err(KernelError::BadComponent(component, 1)); }
        self.state.current().sample(&window)
    }

    fn squared_norm(&self, global: bool) -> KResult<f64> {
        let local = self.state.current()
            .norm_sum(self.lattice.inner_rows(), self.lattice.inner_cols())
            * self.lattice.cell_area();
        if !global { return Ok(local); }
        let mut buf = [local];
        self.comm.allreduce_sum(&mut buf)?;
        Ok(buf[0])
    }

    fn update_potential(&mut self, component: usize, operator: PotentialOperator)
        -> KResult<()>
    {
        if component != 0 { return Err(KernelError::BadComponent(component, 1)); }
        let shape = self.lattice.shape();
        ShapeError::check(shape, &operator.real)?;
        ShapeError::check(shape, &operator.imag)?;
        self.operator = QuadField::from_operator(&operator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{
        hamiltonian::KineticCoefficients,
        kernel::stencil::{ LocalTerms, full_step },
    };

    fn wave(n: usize, seed: f32) -> Vec<f32> {
        (0..n).map(|k| ((k as f32 + seed) * 0.731).sin()).collect()
    }

    struct Lanes<'a> {
        k: &'a QuadParams,
        rows: [&'a mut [f32]; 4],
    }

    impl WithSimd for Lanes<'_> {
        type Output = ();

        fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
            let [r1, i1, r2, i2] = self.rows;
            rotate_lanes(simd, self.k, r1, i1, r2, i2);
        }
    }

    #[test]
    fn vector_lanes_match_scalar_pairs() {
        // 130 lanes leave a remainder for every vector width
        for imag_time in [false, true] {
            let k = QuadParams { a: 0.83, b: 0.41, g_self: 0.0, imag_time };
            let mut vec: [Vec<f32>; 4] = std::array::from_fn(|p| wave(130, p as f32 * 10.0));
            let mut sca = vec.clone();
            let [r1, i1, r2, i2] = &mut vec;
            let rows = [r1.as_mut_slice(), i1.as_mut_slice(), r2.as_mut_slice(), i2.as_mut_slice()];
            Arch::new().dispatch(Lanes { k: &k, rows });
            let op = if imag_time { mix_pair::<f32> } else { rotate_pair::<f32> };
            let [r1, i1, r2, i2] = &mut sca;
            for j in 0..130 {
                op(k.a, k.b, &mut r1[j], &mut i1[j], &mut r2[j], &mut i2[j]);
            }
            assert_eq!(vec, sca);
        }
    }

    #[test]
    fn quad_step_matches_full_resolution_step() {
        let (h, w) = (12, 18);
        let real = nd::Array2::from_shape_fn((h, w), |(i, j)| ((i * 3 + j) as f64 * 0.29).sin());
        let imag = nd::Array2::from_shape_fn((h, w), |(i, j)| ((i + j * 5) as f64 * 0.17).cos());
        let op = PotentialOperator::from_values(
            &nd::Array2::from_shape_fn((h, w), |(i, j)| 0.1 * (i as f64 - j as f64)),
            0.01,
            false,
        );
        let mut params = StepParams::kinetic(
            KineticCoefficients::new(0.01, 1.0, 0.1, 0.1, false));
        params.g_self = 0.02;

        let mut full = Field::new(real, imag).unwrap();
        let mut quad = QuadField::from_field(&full);
        let all = Rect::new(0, 0, w, h);
        let task = BlockTask { read: all, write: all };
        let mut block = quad.block(&all);
        step_quad(&(&params).into(), &mut block, &QuadField::from_operator(&op).block(&all));
        quad.write_core(&block, &task);

        let terms = LocalTerms {
            pot_real: op.real.view(),
            pot_imag: op.imag.view(),
            other: None,
            xs: None,
            ys: None,
        };
        full_step(&params, &terms, &mut full.real, &mut full.imag);
        let (re, im) = quad.sample(&all).unwrap();
        assert_abs_diff_eq!(re, full.real, epsilon = 1e-5);
        assert_abs_diff_eq!(im, full.imag, epsilon = 1e-5);
    }

    #[test]
    fn quad_halo_planes_pack_coarse_bands() {
        let field = Field::new(
            nd::Array2::from_shape_fn((4, 6), |(i, j)| (10 * i + j) as f64),
            nd::Array2::zeros((4, 6)),
        ).unwrap();
        let quad = QuadField::from_field(&field);
        let band = Rect::new(2, 0, 2, 4);
        assert_eq!(quad.packed_len(&band), 2);
        // even rows, odd columns
        assert_eq!(quad.pack(1, &band), vec![3.0, 23.0]);
        let mut other = QuadField::from_field(&Field::zeros((4, 6)));
        other.unpack(1, &band, &[3.0, 23.0]);
        assert_eq!(other.real.get(3, 2), 23.0);
    }
}
