//! Process-group communication between tiles.
//!
//! Tiles never share memory: halos move through tagged point-to-point
//! messages, and observables through sum reductions. [`Communicator`] is the
//! seam; [`ThreadComm`] runs every rank as a thread of the current process
//! connected by channels, which also covers the single-rank case.

use std::{
    collections::{ HashMap, VecDeque },
    sync::{
        Arc,
        Barrier,
        Mutex,
        PoisonError,
        mpsc::{ self, Receiver, RecvTimeoutError, Sender },
    },
    thread,
    time::{ Duration, Instant },
};
use tracing::{ debug, trace };
use crate::error::CommError;

pub type CResult<T> = Result<T, CommError>;

/// Tag reserved for reductions.
const REDUCE_TAG: u32 = u32::MAX;

/// Default time a receive may wait before the exchange is declared stalled.
pub const DEF_TIMEOUT: Duration = Duration::from_secs(60);

/// A group of cooperating ranks.
///
/// Messages between a given pair of ranks with the same tag are delivered in
/// the order they were sent.
pub trait Communicator: Send + Sync {
    /// Rank of this participant.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn size(&self) -> usize;

    /// Post a message for `dest`. Never blocks.
    fn send(&self, dest: usize, tag: u32, data: Vec<f64>) -> CResult<()>;

    /// Block until the next message from `source` carrying `tag` arrives.
    fn recv(&self, source: usize, tag: u32) -> CResult<Vec<f64>>;

    /// Element-wise sum of `buf` over all ranks, left in `buf` on every rank.
    ///
    /// Contributions are added in rank order, so every rank sees bitwise the
    /// same result.
    fn allreduce_sum(&self, buf: &mut [f64]) -> CResult<()>;

    /// Block until every rank has arrived.
    fn barrier(&self);
}

#[derive(Debug)]
struct Envelope {
    source: usize,
    tag: u32,
    data: Vec<f64>,
}

/// Channel-connected ranks living in one process.
pub struct ThreadComm {
    rank: usize,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Mutex<Receiver<Envelope>>,
    // messages that arrived ahead of the receive they match
    stash: Mutex<HashMap<(usize, u32), VecDeque<Vec<f64>>>>,
    barrier: Arc<Barrier>,
    timeout: Duration,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.outboxes.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ThreadComm {
    /// Create the communicators for a group of `size` ranks, in rank order.
    ///
    /// *Panics if `size` is zero*.
    pub fn group(size: usize) -> Vec<Self> {
        assert!(size > 0, "a process group needs at least one rank");
        let (outboxes, inboxes): (Vec<_>, Vec<_>)
            = (0..size).map(|_| mpsc::channel()).unzip();
        let barrier = Arc::new(Barrier::new(size));
        inboxes.into_iter().enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                outboxes: outboxes.clone(),
                inbox: Mutex::new(inbox),
                stash: Mutex::new(HashMap::new()),
                barrier: Arc::clone(&barrier),
                timeout: DEF_TIMEOUT,
            })
            .collect()
    }

    /// A group of one.
    pub fn solo() -> Self {
        Self::group(1).remove(0)
    }

    /// Set how long a receive may wait before reporting a stalled exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `f` once per rank of a new group of `size`, each on its own
    /// thread, and collect the results in rank order.
    ///
    /// A panic on any rank is propagated once all ranks have finished.
    ///
    /// ```
    /// use trotter::comm::{ Communicator, ThreadComm };
    ///
    /// let sums = ThreadComm::run(3, |comm| {
    ///     let mut x = [comm.rank() as f64 + 1.0];
    ///     comm.allreduce_sum(&mut x).unwrap();
    ///     x[0]
    /// });
    /// assert_eq!(sums, vec![6.0, 6.0, 6.0]);
    /// ```
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Arc<ThreadComm>) -> T + Sync,
    {
        Self::run_group(Self::group(size), f)
    }

    /// Like [`run`][Self::run], over an existing group.
    pub fn run_group<T, F>(group: Vec<Self>, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Arc<ThreadComm>) -> T + Sync,
    {
        debug!(ranks = group.len(), "spawning rank threads");
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = group.into_iter()
                .map(|comm| s.spawn(move || f(Arc::new(comm))))
                .collect();
            let results: Vec<_> = handles.into_iter()
                .map(|h| h.join())
                .collect();
            results.into_iter()
                .map(|res| res.unwrap_or_else(|err| std::panic::resume_unwind(err)))
                .collect()
        })
    }

    fn check_peer(&self, peer: usize) -> CResult<()> {
        let n = self.outboxes.len();
        (peer < n).then_some(()).ok_or(CommError::BadPeer(peer, n))
    }

    fn take_stashed(&self, source: usize, tag: u32) -> Option<Vec<f64>> {
        let mut stash = self.stash.lock().unwrap_or_else(PoisonError::into_inner);
        stash.get_mut(&(source, tag)).and_then(VecDeque::pop_front)
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize { self.rank }

    fn size(&self) -> usize { self.outboxes.len() }

    fn send(&self, dest: usize, tag: u32, data: Vec<f64>) -> CResult<()> {
        self.check_peer(dest)?;
        trace!(from = self.rank, to = dest, tag, len = data.len(), "send");
        self.outboxes[dest]
            .send(Envelope { source: self.rank, tag, data })
            .map_err(|_| CommError::Disconnected(dest))
    }

    fn recv(&self, source: usize, tag: u32) -> CResult<Vec<f64>> {
        self.check_peer(source)?;
        if let Some(data) = self.take_stashed(source, tag) {
            return Ok(data);
        }
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match inbox.recv_timeout(remaining) {
                Ok(env) if env.source == source && env.tag == tag => {
                    return Ok(env.data);
                },
                Ok(env) => {
                    self.stash.lock().unwrap_or_else(PoisonError::into_inner)
                        .entry((env.source, env.tag))
                        .or_default()
                        .push_back(env.data);
                },
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CommError::Timeout { peer: source, tag });
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected(source));
                },
            }
        }
    }

    fn allreduce_sum(&self, buf: &mut [f64]) -> CResult<()> {
        let size = self.size();
        if size == 1 { return Ok(()); }
        let mine = buf.to_vec();
        for peer in (0..size).filter(|&r| r != self.rank) {
            self.send(peer, REDUCE_TAG, mine.clone())?;
        }
        let mut acc = vec![0.0; buf.len()];
        for peer in 0..size {
            let part = if peer == self.rank {
                mine.clone()
            } else {
                self.recv(peer, REDUCE_TAG)?
            };
            if part.len() != acc.len() {
                return Err(CommError::SizeMismatch {
                    peer,
                    tag: REDUCE_TAG,
                    expected: acc.len(),
                    got: part.len(),
                });
            }
            acc.iter_mut().zip(part).for_each(|(a, p)| { *a += p; });
        }
        buf.copy_from_slice(&acc);
        Ok(())
    }

    fn barrier(&self) { self.barrier.wait(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_on_source_and_tag() {
        let got = ThreadComm::run(2, |comm| {
            let other = 1 - comm.rank();
            // send in one tag order, receive in the other
            comm.send(other, 1, vec![comm.rank() as f64, 1.0]).unwrap();
            comm.send(other, 2, vec![comm.rank() as f64, 2.0]).unwrap();
            let b = comm.recv(other, 2).unwrap();
            let a = comm.recv(other, 1).unwrap();
            (a, b)
        });
        assert_eq!(got[0], (vec![1.0, 1.0], vec![1.0, 2.0]));
        assert_eq!(got[1], (vec![0.0, 1.0], vec![0.0, 2.0]));
    }

    #[test]
    fn self_messages_are_delivered() {
        let comm = ThreadComm::solo();
        comm.send(0, 7, vec![3.0]).unwrap();
        assert_eq!(comm.recv(0, 7).unwrap(), vec![3.0]);
    }

    #[test]
    fn allreduce_agrees_on_every_rank() {
        let sums = ThreadComm::run(4, |comm| {
            let r = comm.rank() as f64;
            let mut buf = [0.1 * r, r * r];
            comm.allreduce_sum(&mut buf).unwrap();
            comm.barrier();
            buf
        });
        assert!(sums.iter().all(|s| s == &sums[0]));
        assert_eq!(sums[0][1], 14.0);
    }

    #[test]
    fn stalled_receive_times_out() {
        let comm = ThreadComm::solo().with_timeout(Duration::from_millis(20));
        assert!(matches!(
            comm.recv(0, 3),
            Err(CommError::Timeout { peer: 0, tag: 3 }),
        ));
        assert!(matches!(comm.send(4, 0, vec![]), Err(CommError::BadPeer(4, 1))));
    }
}
