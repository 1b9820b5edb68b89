//! Full-resolution Trotter step on a block of the lattice.
//!
//! One step is the symmetric sweep sequence
//! ```text
//! v0 h0 v1 h1 [R] L [R'] h1 v1 h0 v0
//! ```
//! where `v`/`h` rotate pairs of vertically/horizontally adjacent sites whose
//! first member sits at an even (`0`) or odd (`1`) index, `L` is the local
//! potential and interaction phase, and `R`/`R'` are the angular-momentum link
//! rotations of the rotating frame. Each sweep touches disjoint pairs only, so
//! the result does not depend on the order in which pairs are visited.
//!
//! A block has no neighbors: pairs that would reach outside it are skipped,
//! which spoils the outermost couple of sites per edge. Blocks therefore
//! overlap, and only their cores are kept.

use ndarray::{ self as nd, Axis, Slice };
use num_traits::Float;
use crate::{
    Arr2,
    hamiltonian::{ KineticCoefficients, PotentialOperator, RotationCoefficients },
    kernel::{ blocks::BlockTask, field::Field },
};

/// Everything one component's step needs besides the field itself.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StepParams {
    pub kinetic: KineticCoefficients,
    pub imag_time: bool,
    /// Self-interaction strength times the time step.
    pub g_self: f64,
    /// Inter-species interaction strength times the time step.
    pub g_cross: f64,
    pub rotation: Option<RotationCoefficients>,
}

impl StepParams {
    /// Pure kinetic step with the given coefficients in real time.
    pub fn kinetic(kinetic: KineticCoefficients) -> Self {
        Self { kinetic, imag_time: false, g_self: 0.0, g_cross: 0.0, rotation: None }
    }

    /// Parameters undoing one real-time step taken with `self`.
    pub fn inverse(&self) -> Self {
        Self {
            kinetic: self.kinetic.conjugate(),
            g_self: -self.g_self,
            g_cross: -self.g_cross,
            rotation: self.rotation.map(|rot| rot.reversed()),
            ..*self
        }
    }
}

/// Block-shaped inputs of the local part of the step.
#[derive(Clone, Debug)]
pub struct LocalTerms<'a> {
    /// Exponentiated potential operator, real part.
    pub pot_real: nd::ArrayView2<'a, f64>,
    /// Exponentiated potential operator, imaginary part.
    pub pot_imag: nd::ArrayView2<'a, f64>,
    /// The other component of a two-component state, as (real, imag).
    pub other: Option<(nd::ArrayView2<'a, f64>, nd::ArrayView2<'a, f64>)>,
    /// Physical x of each block column relative to the rotation centre.
    pub xs: Option<nd::ArrayView1<'a, f64>>,
    /// Physical y of each block row relative to the rotation centre.
    pub ys: Option<nd::ArrayView1<'a, f64>>,
}

/// Tile-shaped inputs shared by every block of one component's step.
#[derive(Copy, Clone, Debug)]
pub struct TileTerms<'a> {
    pub operator: &'a PotentialOperator,
    /// Current generation of the other component, if any.
    pub other: Option<&'a Field>,
    /// Column x and row y positions relative to the rotation centre.
    pub positions: Option<(&'a nd::Array1<f64>, &'a nd::Array1<f64>)>,
}

/// Unitary two-site rotation of a real-time kinetic link.
#[inline(always)]
pub fn rotate_pair<T: Float>(a: T, b: T, r1: &mut T, i1: &mut T, r2: &mut T, i2: &mut T) {
    let (x1, y1, x2, y2) = (*r1, *i1, *r2, *i2);
    *r1 = a * x1 - b * y2;
    *i1 = a * y1 + b * x2;
    *r2 = a * x2 - b * y1;
    *i2 = a * y2 + b * x1;
}

/// Hyperbolic two-site mixing of an imaginary-time kinetic link.
#[inline(always)]
pub fn mix_pair<T: Float>(a: T, b: T, r1: &mut T, i1: &mut T, r2: &mut T, i2: &mut T) {
    let (x1, y1, x2, y2) = (*r1, *i1, *r2, *i2);
    *r1 = a * x1 + b * x2;
    *i1 = a * y1 + b * y2;
    *r2 = a * x2 + b * x1;
    *i2 = a * y2 + b * y1;
}

// angular-momentum link: a real rotation in real time, a complex hyperbolic
// one in imaginary time
#[inline(always)]
fn angular_pair(
    theta: f64,
    imag_time: bool,
    r1: &mut f64,
    i1: &mut f64,
    r2: &mut f64,
    i2: &mut f64,
) {
    let (x1, y1, x2, y2) = (*r1, *i1, *r2, *i2);
    if imag_time {
        let (c, s) = (theta.cosh(), theta.sinh());
        *r1 = c * x1 + s * y2;
        *i1 = c * y1 - s * x2;
        *r2 = c * x2 - s * y1;
        *i2 = c * y2 + s * x1;
    } else {
        let (s, c) = theta.sin_cos();
        *r1 = c * x1 + s * x2;
        *i1 = c * y1 + s * y2;
        *r2 = c * x2 - s * x1;
        *i2 = c * y2 - s * y1;
    }
}

/// Apply one kinetic sweep: rotate every pair of sites adjacent along `axis`
/// whose first member has index `offset` modulo 2.
pub fn sweep<S>(
    axis: Axis,
    offset: usize,
    kinetic: KineticCoefficients,
    imag_time: bool,
    real: &mut Arr2<S>,
    imag: &mut Arr2<S>,
)
where S: nd::DataMut<Elem = f64>
{
    let KineticCoefficients { a, b } = kinetic;
    let op = if imag_time { mix_pair::<f64> } else { rotate_pair::<f64> };
    let mut real = real.slice_axis_mut(axis, Slice::from(offset..));
    let mut imag = imag.slice_axis_mut(axis, Slice::from(offset..));
    real.axis_chunks_iter_mut(axis, 2)
        .zip(imag.axis_chunks_iter_mut(axis, 2))
        .filter(|(rc, _)| rc.len_of(axis) == 2)
        .for_each(|(rc, ic)| {
            let (r1, r2) = rc.split_at(axis, 1);
            let (i1, i2) = ic.split_at(axis, 1);
            nd::Zip::from(r1).and(i1).and(r2).and(i2)
                .for_each(|r1, i1, r2, i2| op(a, b, r1, i1, r2, i2));
        });
}

// angular-momentum sweep over links along `axis`; `alpha` times the position
// along the other axis gives each link its angle
fn angular_sweep<S>(
    axis: Axis,
    offset: usize,
    alpha: f64,
    positions: nd::ArrayView1<f64>,
    imag_time: bool,
    real: &mut Arr2<S>,
    imag: &mut Arr2<S>,
)
where S: nd::DataMut<Elem = f64>
{
    let thetas = positions.mapv(|p| alpha * p);
    let mut real = real.slice_axis_mut(axis, Slice::from(offset..));
    let mut imag = imag.slice_axis_mut(axis, Slice::from(offset..));
    real.axis_chunks_iter_mut(axis, 2)
        .zip(imag.axis_chunks_iter_mut(axis, 2))
        .filter(|(rc, _)| rc.len_of(axis) == 2)
        .for_each(|(rc, ic)| {
            let (r1, r2) = rc.split_at(axis, 1);
            let (i1, i2) = ic.split_at(axis, 1);
            nd::Zip::from(r1.index_axis_move(axis, 0))
                .and(i1.index_axis_move(axis, 0))
                .and(r2.index_axis_move(axis, 0))
                .and(i2.index_axis_move(axis, 0))
                .and(&thetas)
                .for_each(|r1, i1, r2, i2, th| {
                    angular_pair(*th, imag_time, r1, i1, r2, i2)
                });
        });
}

#[inline(always)]
fn local_point(
    r: &mut f64,
    i: &mut f64,
    pr: f64,
    pi: f64,
    phi: f64,
    imag_time: bool,
) {
    let (x, y) = (*r, *i);
    let (mut nr, mut ni) = (pr * x - pi * y, pr * y + pi * x);
    if phi != 0.0 {
        if imag_time {
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

/// Multiply by the potential operator and the interaction phase.
pub fn local_step<S>(
    params: &StepParams,
    terms: &LocalTerms,
    real: &mut Arr2<S>,
    imag: &mut Arr2<S>,
)
where S: nd::DataMut<Elem = f64>
{
    let StepParams { imag_time, g_self, g_cross, .. } = *params;
    let zip = nd::Zip::from(real).and(imag)
        .and(&terms.pot_real).and(&terms.pot_imag);
    match terms.other {
        Some((or, oi)) if g_cross != 0.0 => {
            zip.and(&or).and(&oi)
                .for_each(|r, i, pr, pi, or, oi| {
                    let phi = g_self * (*r * *r + *i * *i)
                        + g_cross * (or * or + oi * oi);
                    local_point(r, i, *pr, *pi, phi, imag_time);
                });
        },
        _ => {
            zip.for_each(|r, i, pr, pi| {
                let phi = g_self * (*r * *r + *i * *i);
                local_point(r, i, *pr, *pi, phi, imag_time);
            });
        },
    }
}

// the four angular sweeps of half a rotating-frame step, in order
fn angular_half<S>(
    params: &StepParams,
    rot: &RotationCoefficients,
    terms: &LocalTerms,
    reverse: bool,
    real: &mut Arr2<S>,
    imag: &mut Arr2<S>,
)
where S: nd::DataMut<Elem = f64>
{
    let (Some(xs), Some(ys)) = (&terms.xs, &terms.ys) else { return; };
    let mut order = [
        (Axis(0), 0, rot.alpha_y, xs),
        (Axis(0), 1, rot.alpha_y, xs),
        (Axis(1), 0, rot.alpha_x, ys),
        (Axis(1), 1, rot.alpha_x, ys),
    ];
    if reverse { order.reverse(); }
    order.into_iter()
        .for_each(|(axis, offset, alpha, pos)| {
            angular_sweep(axis, offset, alpha, pos.view(), params.imag_time, real, imag);
        });
}

/// Apply one full Trotter step to a block in place.
///
/// `terms` must have the same shape as the block.
pub fn full_step<S>(
    params: &StepParams,
    terms: &LocalTerms,
    real: &mut Arr2<S>,
    imag: &mut Arr2<S>,
)
where S: nd::DataMut<Elem = f64>
{
    let StepParams { kinetic, imag_time, .. } = *params;
    let (v, h) = (Axis(0), Axis(1));
    sweep(v, 0, kinetic, imag_time, real, imag);
    sweep(h, 0, kinetic, imag_time, real, imag);
    sweep(v, 1, kinetic, imag_time, real, imag);
    sweep(h, 1, kinetic, imag_time, real, imag);
    if let Some(rot) = &params.rotation {
        angular_half(params, rot, terms, false, real, imag);
    }
    local_step(params, terms, real, imag);
    if let Some(rot) = &params.rotation {
        angular_half(params, rot, terms, true, real, imag);
    }
    sweep(h, 1, kinetic, imag_time, real, imag);
    sweep(v, 1, kinetic, imag_time, real, imag);
    sweep(h, 0, kinetic, imag_time, real, imag);
    sweep(v, 0, kinetic, imag_time, real, imag);
}

/// Step the read footprint of `task` out of `current`.
///
/// Only the write region of the returned block is valid.
pub fn step_block(
    params: &StepParams,
    tile: &TileTerms,
    current: &Field,
    task: &BlockTask,
) -> Field
{
    let r = &task.read;
    let mut block = current.block(r);
    let terms = LocalTerms {
        pot_real: tile.operator.real.slice(r.slice()),
        pot_imag: tile.operator.imag.slice(r.slice()),
        other: tile.other.map(|f| (f.real.slice(r.slice()), f.imag.slice(r.slice()))),
        xs: tile.positions.map(|(xs, _)| xs.slice(nd::s![r.cols()])),
        ys: tile.positions.map(|(_, ys)| ys.slice(nd::s![r.rows()])),
    };
    full_step(params, &terms, &mut block.real, &mut block.imag);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn seed(h: usize, w: usize) -> (nd::Array2<f64>, nd::Array2<f64>) {
        let re = nd::Array2::from_shape_fn((h, w), |(i, j)| {
            ((i * 7 + j * 3) as f64 * 0.37).sin() + 0.2
        });
        let im = nd::Array2::from_shape_fn((h, w), |(i, j)| {
            ((i * 5 + j * 11) as f64 * 0.19).cos() - 0.1
        });
        (re, im)
    }

    fn free(shape: (usize, usize)) -> (nd::Array2<f64>, nd::Array2<f64>) {
        (nd::Array2::ones(shape), nd::Array2::zeros(shape))
    }

    #[test]
    fn sweep_pairs_rows_from_offset() {
        let k = KineticCoefficients { a: 0.0, b: 1.0 };
        let mut re = nd::Array2::from_shape_fn((3, 2), |(i, _)| i as f64 + 1.0);
        let mut im = nd::Array2::zeros((3, 2));
        sweep(Axis(0), 1, k, true, &mut re, &mut im);
        // rows 1 and 2 swap, row 0 has no partner
        assert_eq!(re.column(0).to_vec(), vec![1.0, 3.0, 2.0]);
    }

    #[test]
    fn step_is_undone_by_its_inverse() {
        let (mut re, mut im) = seed(10, 12);
        let (re0, im0) = (re.clone(), im.clone());
        let (pr, pi) = (
            nd::Array2::from_shape_fn((10, 12), |(i, j)| (0.01 * (i + j) as f64).cos()),
            nd::Array2::from_shape_fn((10, 12), |(i, j)| -(0.01 * (i + j) as f64).sin()),
        );
        let (pr_inv, pi_inv) = (pr.clone(), pi.mapv(|x| -x));
        let xs = nd::Array1::linspace(-1.0, 1.0, 12);
        let ys = nd::Array1::linspace(-0.8, 0.8, 10);
        let params = StepParams {
            kinetic: KineticCoefficients::new(0.01, 1.0, 0.2, 0.2, false),
            imag_time: false,
            g_self: 0.05,
            g_cross: 0.0,
            rotation: Some(RotationCoefficients::new(0.7, 0.01, 0.2, 0.2)),
        };
        let terms = LocalTerms {
            pot_real: pr.view(),
            pot_imag: pi.view(),
            other: None,
            xs: Some(xs.view()),
            ys: Some(ys.view()),
        };
        full_step(&params, &terms, &mut re, &mut im);
        let inv_terms = LocalTerms { pot_real: pr_inv.view(), pot_imag: pi_inv.view(), ..terms };
        full_step(&params.inverse(), &inv_terms, &mut re, &mut im);
        assert_abs_diff_eq!(re, re0, epsilon = 1e-12);
        assert_abs_diff_eq!(im, im0, epsilon = 1e-12);
    }

    #[test]
    fn real_time_step_preserves_norm() {
        let (mut re, mut im) = seed(16, 16);
        let norm0: f64 = re.iter().chain(&im).map(|x| x * x).sum();
        let (pr, pi) = free((16, 16));
        let terms = LocalTerms {
            pot_real: pr.view(),
            pot_imag: pi.view(),
            other: None,
            xs: None,
            ys: None,
        };
        let mut params = StepParams::kinetic(
            KineticCoefficients::new(0.05, 1.0, 0.1, 0.1, false));
        params.g_self = 0.3;
        for _ in 0..20 {
            full_step(&params, &terms, &mut re, &mut im);
        }
        let norm: f64 = re.iter().chain(&im).map(|x| x * x).sum();
        assert_abs_diff_eq!(norm, norm0, epsilon = 1e-10);
    }

    #[test]
    fn identity_coefficients_leave_field_alone() {
        let (mut re, mut im) = seed(6, 8);
        let (re0, im0) = (re.clone(), im.clone());
        let (pr, pi) = free((6, 8));
        let terms = LocalTerms {
            pot_real: pr.view(),
            pot_imag: pi.view(),
            other: None,
            xs: None,
            ys: None,
        };
        full_step(
            &StepParams::kinetic(KineticCoefficients::identity()),
            &terms,
            &mut re,
            &mut im,
        );
        assert_eq!(re, re0);
        assert_eq!(im, im0);
    }
}
