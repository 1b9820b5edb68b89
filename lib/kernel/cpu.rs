//! Reference double-precision kernel.
//!
//! Holds one or two components, each in its own double buffer, and is the only
//! backend that evolves the rotating frame and Rabi-coupled two-component
//! states.

use std::sync::Arc;
use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::debug;
use crate::{
    buffer::DoubleBuffer,
    comm::Communicator,
    error::{ KernelError, ShapeError },
    hamiltonian::PotentialOperator,
    kernel::{
        Call,
        EvolutionKernel,
        KResult,
        KernelPhase,
        KernelSetup,
        Protocol,
        blocks::{ BlockPlan, BlockTask, Rect },
        field::Field,
        halo::{ HaloExchange, Wave },
        stencil::{ StepParams, TileTerms, step_block },
    },
    lattice::LatticeDescriptor,
};

/// Single-threaded double-precision kernel.
pub struct CpuKernel {
    lattice: LatticeDescriptor,
    comm: Arc<dyn Communicator>,
    halo_tasks: Vec<BlockTask>,
    interior_tasks: Vec<BlockTask>,
    states: Vec<DoubleBuffer<Field>>,
    operators: Vec<PotentialOperator>,
    params: Vec<StepParams>,
    rabi: C64,
    positions: Option<(nd::Array1<f64>, nd::Array1<f64>)>,
    imag_time: bool,
    halo: HaloExchange,
    protocol: Protocol,
    active: usize,
}

impl CpuKernel {
    /// Take ownership of the setup's fields and prime their halos.
    pub fn new(setup: KernelSetup) -> KResult<Self> {
        let KernelSetup {
            lattice, comm, fields, operators, params, rabi, rot_center, imag_time, blocks,
        } = setup;
        let plan = BlockPlan::new(blocks, lattice.dim_x, lattice.dim_y);
        let positions = params.iter().any(|p| p.rotation.is_some())
            .then(|| {
                let (cx, cy) = rot_center;
                (
                    nd::Array1::from_shape_fn(lattice.dim_x, |j| lattice.x_coord(j) - cx),
                    nd::Array1::from_shape_fn(lattice.dim_y, |i| lattice.y_coord(i) - cy),
                )
            });
        let mut halo = HaloExchange::new(&lattice, comm.clone());
        let mut states = Vec::with_capacity(fields.len());
        for mut field in fields.into_iter() {
            halo.exchange(&mut field)?;
            states.push(DoubleBuffer::new(field));
        }
        debug!(
            rank = lattice.rank,
            components = states.len(),
            rotating = positions.is_some(),
            "scalar kernel ready",
        );
        Ok(Self {
            halo_tasks: plan.halo_tasks(),
            interior_tasks: plan.interior_tasks(),
            lattice,
            comm,
            states,
            operators,
            params,
            rabi,
            positions,
            imag_time,
            halo,
            protocol: Protocol::default(),
            active: 0,
        })
    }

    // step one block of the active component from the current generation
    fn step(&self, task: &BlockTask) -> Field {
        let c = self.active;
        let tile = TileTerms {
            operator: &self.operators[c],
            other: (self.states.len() == 2).then(|| self.states[1 - c].current()),
            positions: self.positions.as_ref().map(|(xs, ys)| (xs, ys)),
        };
        step_block(&self.params[c], &tile, self.states[c].current(), task)
    }

    fn run_tasks(&mut self, interior: bool) {
        let count = if interior { self.interior_tasks.len() } else { self.halo_tasks.len() };
        for k in 0..count {
            let task = if interior { self.interior_tasks[k] } else { self.halo_tasks[k] };
            let block = self.step(&task);
            self.states[self.active].next_mut().write_core(&block, &task);
        }
    }

    fn check_component(&self, component: usize) -> KResult<()> {
        (component < self.states.len()).then_some(())
            .ok_or(KernelError::BadComponent(component, self.states.len()))
    }

    fn renormalize(&mut self) -> KResult<()> {
        let norm2 = self.squared_norm(true)?;
        KernelError::check_norm(norm2)?;
        let factor = norm2.sqrt().recip();
        self.states.iter_mut().for_each(|s| s.current_mut().scale(factor));
        Ok(())
    }
}

impl EvolutionKernel for CpuKernel {
    fn name(&self) -> &'static str { "Scalar" }

    fn phase(&self) -> KernelPhase { self.protocol.phase() }

    fn components(&self) -> usize { self.states.len() }

    fn activate(&mut self, component: usize) -> KResult<()> {
        self.protocol.check(Call::Between("activate"))?;
        self.check_component(component)?;
        self.active = component;
        Ok(())
    }

    fn run_kernel_on_halo(&mut self) -> KResult<()> {
        self.protocol.check(Call::Halo)?;
        self.run_tasks(false);
        self.protocol.advance(Call::Halo);
        Ok(())
    }

    fn start_halo_exchange(&mut self) -> KResult<()> {
        self.protocol.check(Call::StartExchange)?;
        self.halo.post(Wave::Columns, self.states[self.active].next())?;
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
        let buf = &mut self.states[self.active];
        self.halo.complete(buf.next_mut())?;
        buf.swap();
        self.halo.post(Wave::Rows, buf.current())?;
        self.halo.complete(buf.current_mut())?;
        self.protocol.advance(Call::FinishExchange);
        Ok(())
    }

    fn wait_for_completion(&mut self) -> KResult<()> {
        self.protocol.check(Call::Complete)?;
        if self.imag_time { self.renormalize()?; }
        self.protocol.advance(Call::Complete);
        self.active = 0;
        Ok(())
    }

    fn get_sample(&self, component: usize, window: Rect)
        -> KResult<(nd::Array2<f64>, nd::Array2<f64>)>
    {
        self.check_component(component)?;
        self.states[component].current().sample(&window)
    }

    fn squared_norm(&self, global: bool) -> KResult<f64> {
        let (rows, cols) = (self.lattice.inner_rows(), self.lattice.inner_cols());
        let local: f64 = self.states.iter()
            .map(|s| s.current().norm_sum(rows.clone(), cols.clone()))
            .sum::<f64>() * self.lattice.cell_area();
        if !global { return Ok(local); }
        let mut buf = [local];
        self.comm.allreduce_sum(&mut buf)?;
        Ok(buf[0])
    }

    fn normalization(&mut self) -> KResult<()> {
        self.protocol.check(Call::Between("normalization"))?;
        self.renormalize()
    }

    fn rabi_coupling(&mut self, fraction: f64, delta_t: f64) -> KResult<()> {
        self.protocol.check(Call::Between("rabi_coupling"))?;
        let omega = self.rabi.norm();
        let [a, b] = self.states.as_mut_slice() else { return Ok(()); };
        if omega == 0.0 { return Ok(()); }
        let phase = self.rabi / omega;
        let t = omega * fraction * delta_t;
        // exp(-i t H_R) or exp(-t H_R), with H_R = [[0, Ω], [Ω*, 0]] / |Ω|
        let (c, k) = if self.imag_time {
            (t.cosh(), C64::new(-t.sinh(), 0.0))
        } else {
            (t.cos(), C64::new(0.0, -t.sin()))
        };
        let (ka, kb) = (k * phase, k * phase.conj());
        let (a, b) = (a.current_mut(), b.current_mut());
        nd::Zip::from(&mut a.real).and(&mut a.imag).and(&mut b.real).and(&mut b.imag)
            .for_each(|ar, ai, br, bi| {
                let pa = C64::new(*ar, *ai);
                let pb = C64::new(*br, *bi);
                let na = c * pa + ka * pb;
                let nb = c * pb + kb * pa;
                (*ar, *ai) = (na.re, na.im);
                (*br, *bi) = (nb.re, nb.im);
            });
        Ok(())
    }

    fn update_potential(&mut self, component: usize, operator: PotentialOperator)
        -> KResult<()>
    {
        self.check_component(component)?;
        let shape = self.lattice.shape();
        ShapeError::check(shape, &operator.real)?;
        ShapeError::check(shape, &operator.imag)?;
        self.operators[component] = operator;
        Ok(())
    }
}
