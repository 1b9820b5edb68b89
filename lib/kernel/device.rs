//! Kernels driving an asynchronous execution stream.
//!
//! A [`DeviceStream`] is an in-order command queue served by a dedicated
//! worker thread: launches return immediately and their results are collected
//! later, so the host can post and complete halo exchanges while the stream
//! computes. The stream reads an immutable snapshot of the current generation
//! and hands back stepped blocks, which the host writes into the next one.
//!
//! The [`Device`][crate::kernel::Backend::Device] flavor runs every block on
//! the stream. The [`Hybrid`][crate::kernel::Backend::Hybrid] flavor computes
//! the halo blocks on the host thread pool with [`rayon`] and leaves only the
//! interior to the stream.

use std::{
    sync::{ Arc, mpsc },
    thread,
};
use ndarray as nd;
use rayon::prelude::*;
use tracing::{ debug, trace };
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
        field::Field,
        halo::{ HaloExchange, Wave },
        stencil::{ StepParams, TileTerms, step_block },
    },
    lattice::LatticeDescriptor,
};

enum Command {
    Step {
        current: Arc<Field>,
        operator: Arc<PotentialOperator>,
        params: StepParams,
        tasks: Arc<Vec<BlockTask>>,
        reply: mpsc::Sender<Vec<Field>>,
    },
}

/// In-order execution stream backed by a worker thread.
#[derive(Debug)]
pub struct DeviceStream {
    tx: Option<mpsc::Sender<Command>>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Handle to the results of one launch.
#[derive(Debug)]
pub struct Launch {
    rx: mpsc::Receiver<Vec<Field>>,
}

impl Launch {
    /// Block until the launch has finished.
    pub fn wait(self) -> KResult<Vec<Field>> {
        self.rx.recv().map_err(|_| KernelError::StreamClosed)
    }
}

impl DeviceStream {
    pub fn spawn(label: &str) -> KResult<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                for cmd in rx {
                    match cmd {
                        Command::Step { current, operator, params, tasks, reply } => {
                            let tile = TileTerms {
                                operator: &operator,
                                other: None,
                                positions: None,
                            };
                            let blocks: Vec<Field> = tasks.iter()
                                .map(|t| step_block(&params, &tile, &current, t))
                                .collect();
                            // release the snapshot before the host can see the
                            // results
                            drop(current);
                            reply.send(blocks).ok();
                        },
                    }
                }
            })
            .map_err(|_| KernelError::StreamClosed)?;
        Ok(Self { tx: Some(tx), worker: Some(worker) })
    }

    /// Queue one step of `tasks` over a snapshot of `current`.
    pub fn launch(
        &self,
        current: Arc<Field>,
        operator: Arc<PotentialOperator>,
        params: StepParams,
        tasks: Arc<Vec<BlockTask>>,
    ) -> KResult<Launch>
    {
        let (reply, rx) = mpsc::channel();
        self.tx.as_ref()
            .ok_or(KernelError::StreamClosed)?
            .send(Command::Step { current, operator, params, tasks, reply })
            .map_err(|_| KernelError::StreamClosed)?;
        Ok(Launch { rx })
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

/// Single-component kernel offloading blocks to a [`DeviceStream`].
pub struct DeviceKernel {
    lattice: LatticeDescriptor,
    comm: Arc<dyn Communicator>,
    hybrid: bool,
    halo_tasks: Arc<Vec<BlockTask>>,
    interior_tasks: Arc<Vec<BlockTask>>,
    state: DoubleBuffer<Arc<Field>>,
    operator: Arc<PotentialOperator>,
    params: StepParams,
    imag_time: bool,
    halo: HaloExchange,
    stream: DeviceStream,
    pending: Option<Launch>,
    protocol: Protocol,
}

impl DeviceKernel {
    /// Build a kernel running halo blocks on the host pool if `hybrid`, or on
    /// the stream otherwise.
    pub fn new(setup: KernelSetup, hybrid: bool) -> KResult<Self> {
        let KernelSetup { lattice, comm, fields, operators, params, imag_time, blocks, .. }
            = setup;
        let (Some(mut field), Some(op), Some(p)) = (
            fields.into_iter().next(),
            operators.into_iter().next(),
            params.first().copied(),
        ) else {
            return Err(ConfigError::Components("no component to evolve".into()).into());
        };
        let plan = BlockPlan::new(blocks, lattice.dim_x, lattice.dim_y);
        let mut halo = HaloExchange::new(&lattice, comm.clone());
        halo.exchange(&mut field)?;
        let stream = DeviceStream::spawn(&format!("device-stream-{}", lattice.rank))?;
        debug!(rank = lattice.rank, hybrid, tile = ?lattice.shape(), "device kernel ready");
        Ok(Self {
            halo_tasks: Arc::new(plan.halo_tasks()),
            interior_tasks: Arc::new(plan.interior_tasks()),
            state: DoubleBuffer::new(Arc::new(field)),
            operator: Arc::new(op),
            params: p,
            lattice,
            comm,
            hybrid,
            imag_time,
            halo,
            stream,
            pending: None,
            protocol: Protocol::default(),
        })
    }

    fn launch(&self, tasks: &Arc<Vec<BlockTask>>) -> KResult<Launch> {
        self.stream.launch(
            Arc::clone(self.state.current()),
            Arc::clone(&self.operator),
            self.params,
            Arc::clone(tasks),
        )
    }

    // the next generation is only shared right after construction; the first
    // write detaches it
    fn write_blocks(&mut self, tasks: &[BlockTask], blocks: Vec<Field>) {
        let next = Arc::make_mut(self.state.next_mut());
        tasks.iter().zip(&blocks).for_each(|(t, b)| next.write_core(b, t));
    }
}

impl EvolutionKernel for DeviceKernel {
    fn name(&self) -> &'static str { if self.hybrid { "Hybrid" } else { "Device" } }

    fn phase(&self) -> KernelPhase { self.protocol.phase() }

    fn run_kernel_on_halo(&mut self) -> KResult<()> {
        self.protocol.check(Call::Halo)?;
        let tasks = Arc::clone(&self.halo_tasks);
        let blocks: Vec<Field> = if self.hybrid {
            let params = self.params;
            let tile = TileTerms { operator: &self.operator, other: None, positions: None };
            let current: &Field = self.state.current();
            tasks.par_iter()
                .map(|t| step_block(&params, &tile, current, t))
                .collect()
        } else {
            self.launch(&tasks)?.wait()?
        };
        self.write_blocks(&tasks, blocks);
        self.protocol.advance(Call::Halo);
        Ok(())
    }

    fn start_halo_exchange(&mut self) -> KResult<()> {
        self.protocol.check(Call::StartExchange)?;
        self.halo.post(Wave::Columns, &**self.state.next())?;
        self.protocol.advance(Call::StartExchange);
        Ok(())
    }

    fn run_kernel(&mut self) -> KResult<()> {
        self.protocol.check(Call::Interior)?;
        let tasks = Arc::clone(&self.interior_tasks);
        self.pending = Some(self.launch(&tasks)?);
        trace!(rank = self.lattice.rank, blocks = tasks.len(), "interior launched");
        self.protocol.advance(Call::Interior);
        Ok(())
    }

    fn finish_halo_exchange(&mut self) -> KResult<()> {
        self.protocol.check(Call::FinishExchange)?;
        self.halo.complete(Arc::make_mut(self.state.next_mut()))?;
        if let Some(launch) = self.pending.take() {
            let blocks = launch.wait()?;
            let tasks = Arc::clone(&self.interior_tasks);
            self.write_blocks(&tasks, blocks);
        }
        self.state.swap();
        self.halo.post(Wave::Rows, &**self.state.current())?;
        self.halo.complete(Arc::make_mut(self.state.current_mut()))?;
        self.protocol.advance(Call::FinishExchange);
        Ok(())
    }

    fn wait_for_completion(&mut self) -> KResult<()> {
        self.protocol.check(Call::Complete)?;
        if self.imag_time {
            let norm2 = self.squared_norm(true)?;
            KernelError::check_norm(norm2)?;
            Arc::make_mut(self.state.current_mut()).scale(norm2.sqrt().recip());
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
        self.operator = Arc::new(operator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamiltonian::KineticCoefficients;

    #[test]
    fn stream_steps_blocks_in_order() {
        let field = Arc::new(Field::new(
            nd::Array2::from_shape_fn((8, 8), |(i, j)| ((i + 2 * j) as f64).sin()),
            nd::Array2::zeros((8, 8)),
        ).unwrap());
        let op = Arc::new(PotentialOperator::identity((8, 8)));
        let params = StepParams::kinetic(KineticCoefficients::new(0.1, 1.0, 0.5, 0.5, false));
        let whole = Rect::new(0, 0, 8, 8);
        let tasks = Arc::new(vec![
            BlockTask { read: whole, write: Rect::new(0, 0, 8, 4) },
            BlockTask { read: whole, write: Rect::new(0, 4, 8, 4) },
        ]);
        let stream = DeviceStream::spawn("test-stream").unwrap();
        let first = stream.launch(field.clone(), op.clone(), params, tasks.clone()).unwrap();
        let second = stream.launch(field.clone(), op.clone(), params, tasks).unwrap();
        let a = first.wait().unwrap();
        let b = second.wait().unwrap();
        let tile = TileTerms { operator: &op, other: None, positions: None };
        let expected = step_block(&params, &tile, &field, &BlockTask { read: whole, write: whole });
        assert_eq!(a.len(), 2);
        assert_eq!(a[0], expected);
        assert_eq!(a, b);
        // the stream has let go of every snapshot
        assert_eq!(Arc::strong_count(&field), 1);
    }
}
