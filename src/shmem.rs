//! Shared-memory transport
//!
//! [`LocalCluster`] runs every rank of a job as a thread of one
//! process. All communication goes through a hub owned by the cluster:
//! collectives rendezvous in a generation-stamped cell where the last
//! arriving rank publishes the full set of contributions, and
//! point-to-point messages land in per-destination FIFO queues matched
//! on `(source, tag)`.
//!
//! This transport exists for shared-memory jobs and for the test suite,
//! which uses it to exercise real multi-rank behaviour inside a single
//! test process. It is not optimised; per the overall design,
//! shared-memory operation is acceptable but not a performance target.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use crate::datatype::{Datum, ReduceOp, SlotData};
use crate::spike::Spike;
use crate::transport::{self, tags, Communicator, RecvRequest};
use crate::{Count, Rank, Tag};

/// One rank's deposit into the collective cell.
#[derive(Debug)]
struct Contribution {
    data: SlotData,
    /// Per-destination counts, present only for varying all-to-all.
    counts: Option<Vec<Count>>,
    /// Per-destination displacements, present only for varying
    /// all-to-all.
    displs: Option<Vec<Count>>,
}

#[derive(Debug, Default)]
struct CollCell {
    arrived: usize,
    generation: u64,
    inputs: Vec<Option<Contribution>>,
    published: Option<Arc<Vec<Contribution>>>,
}

#[derive(Debug)]
struct PeerQueue {
    q: Mutex<VecDeque<Envelope>>,
    cv: Condvar,
}

#[derive(Debug)]
struct Envelope {
    src: Rank,
    tag: Tag,
    data: Payload,
}

#[derive(Debug)]
enum Payload {
    Dbl(Vec<f64>),
    Spike(Spike),
}

#[derive(Debug)]
struct Hub {
    size: usize,
    epoch: Instant,
    coll: Mutex<CollCell>,
    coll_cv: Condvar,
    queues: Vec<PeerQueue>,
}

impl Hub {
    fn new(size: usize) -> Hub {
        Hub {
            size,
            epoch: Instant::now(),
            coll: Mutex::new(CollCell {
                inputs: (0..size).map(|_| None).collect(),
                ..CollCell::default()
            }),
            coll_cv: Condvar::new(),
            queues: (0..size)
                .map(|_| PeerQueue {
                    q: Mutex::new(VecDeque::new()),
                    cv: Condvar::new(),
                })
                .collect(),
        }
    }

    /// Deposit one rank's contribution and return the full set once
    /// every rank has arrived.
    ///
    /// Publication cannot be overwritten before every waiter has read
    /// it: the next round can only complete after all ranks deposited
    /// again, and a rank deposits only after leaving the current round.
    fn collect(&self, rank: usize, c: Contribution) -> Arc<Vec<Contribution>> {
        let mut cell = self.coll.lock().expect("peer rank died in a collective");
        let gen = cell.generation;
        debug_assert!(cell.inputs[rank].is_none(), "collective re-entered");
        cell.inputs[rank] = Some(c);
        cell.arrived += 1;
        if cell.arrived == self.size {
            let inputs: Vec<Contribution> = cell
                .inputs
                .iter_mut()
                .map(|slot| slot.take().expect("missing contribution"))
                .collect();
            let published = Arc::new(inputs);
            cell.published = Some(Arc::clone(&published));
            cell.arrived = 0;
            cell.generation += 1;
            self.coll_cv.notify_all();
            published
        } else {
            while cell.generation == gen {
                cell = self
                    .coll_cv
                    .wait(cell)
                    .expect("peer rank died in a collective");
            }
            Arc::clone(cell.published.as_ref().expect("collective not published"))
        }
    }

    fn push(&self, dest: usize, env: Envelope) {
        let peer = &self.queues[dest];
        peer.q
            .lock()
            .expect("peer rank died holding its receive queue")
            .push_back(env);
        peer.cv.notify_all();
    }
}

/// Runs a job of `n` ranks as threads over a shared hub.
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster;

impl LocalCluster {
    /// Spawn `size` rank threads, each running `f` with its own
    /// communicator, and collect their results in rank order.
    ///
    /// Panics if any rank panics; a hung rank hangs the job, matching
    /// the no-timeout model of the underlying design.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(ThreadComm) -> T + Send + Sync,
        T: Send,
    {
        assert!(size > 0, "a cluster needs at least one rank");
        let hub = Arc::new(Hub::new(size));
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(size);
            for rank in 0..size {
                let comm = ThreadComm {
                    rank,
                    hub: Arc::clone(&hub),
                };
                let f = &f;
                handles.push(s.spawn(move || f(comm)));
            }
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }
}

/// The per-rank endpoint of a [`LocalCluster`].
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    hub: Arc<Hub>,
}

impl ThreadComm {
    fn deposit<T: Datum>(&self, data: Vec<T>) -> Arc<Vec<Contribution>> {
        self.hub.collect(
            self.rank,
            Contribution {
                data: T::wrap(data),
                counts: None,
                displs: None,
            },
        )
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> Rank {
        self.rank as Rank
    }

    fn size(&self) -> Rank {
        self.hub.size as Rank
    }

    fn barrier(&self) {
        let _ = self.deposit::<i32>(Vec::new());
    }

    fn wtime(&self) -> f64 {
        self.hub.epoch.elapsed().as_secs_f64()
    }

    fn all_reduce_dbl(&self, x: f64, op: ReduceOp) -> f64 {
        let inputs = self.deposit(vec![x]);
        inputs
            .iter()
            .map(|c| transport::slot_slice::<f64>(&c.data)[0])
            .reduce(|a, b| op.fold_dbl(a, b))
            .expect("empty cluster")
    }

    fn all_reduce_int(&self, x: i32, op: ReduceOp) -> i32 {
        let inputs = self.deposit(vec![x]);
        inputs
            .iter()
            .map(|c| transport::slot_slice::<i32>(&c.data)[0])
            .reduce(|a, b| op.fold_int(a, b))
            .expect("empty cluster")
    }

    fn all_gather_into<T: Datum>(&self, send: &[T], recv: &mut [T]) {
        let n = send.len();
        debug_assert_eq!(recv.len(), n * self.hub.size);
        let inputs = self.deposit(send.to_vec());
        for (i, c) in inputs.iter().enumerate() {
            let part = transport::slot_slice::<T>(&c.data);
            debug_assert_eq!(part.len(), n, "unequal all-gather contribution");
            recv[i * n..(i + 1) * n].copy_from_slice(part);
        }
    }

    fn all_gather_varcount_into<T: Datum>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[Count],
        displs: &[Count],
    ) {
        let inputs = self.deposit(send.to_vec());
        for (i, c) in inputs.iter().enumerate() {
            let part = transport::slot_slice::<T>(&c.data);
            let cnt = counts[i] as usize;
            debug_assert_eq!(part.len(), cnt, "count disagrees with contribution");
            let d = displs[i] as usize;
            recv[d..d + cnt].copy_from_slice(part);
        }
    }

    fn all_to_all_into<T: Datum>(&self, send: &[T], recv: &mut [T]) {
        let size = self.hub.size;
        let chunk = send.len() / size;
        let inputs = self.deposit(send.to_vec());
        for (j, c) in inputs.iter().enumerate() {
            let theirs = transport::slot_slice::<T>(&c.data);
            let from = &theirs[self.rank * chunk..(self.rank + 1) * chunk];
            recv[j * chunk..(j + 1) * chunk].copy_from_slice(from);
        }
    }

    fn all_to_all_varcount_into<T: Datum>(
        &self,
        send: &[T],
        scounts: &[Count],
        sdispls: &[Count],
        recv: &mut [T],
        rcounts: &[Count],
        rdispls: &[Count],
    ) {
        let inputs = self.hub.collect(
            self.rank,
            Contribution {
                data: T::wrap(send.to_vec()),
                counts: Some(scounts.to_vec()),
                displs: Some(sdispls.to_vec()),
            },
        );
        for (j, c) in inputs.iter().enumerate() {
            let theirs = transport::slot_slice::<T>(&c.data);
            let their_counts = c.counts.as_ref().expect("varcount deposit lacks counts");
            let their_displs = c.displs.as_ref().expect("varcount deposit lacks displs");
            let cnt = their_counts[self.rank] as usize;
            debug_assert_eq!(cnt, rcounts[j] as usize, "send/recv count mismatch");
            let sd = their_displs[self.rank] as usize;
            let rd = rdispls[j] as usize;
            recv[rd..rd + cnt].copy_from_slice(&theirs[sd..sd + cnt]);
        }
    }

    fn broadcast_into<T: Datum>(&self, buf: &mut [T], root: Rank) {
        let mine = if self.rank == root as usize {
            buf.to_vec()
        } else {
            Vec::new()
        };
        let inputs = self.deposit(mine);
        let part = transport::slot_slice::<T>(&inputs[root as usize].data);
        buf.copy_from_slice(part);
    }

    fn send_doubles(&self, buf: &[f64], dest: Rank, tag: Tag) {
        self.hub.push(
            dest as usize,
            Envelope {
                src: self.rank as Rank,
                tag,
                data: Payload::Dbl(buf.to_vec()),
            },
        );
    }

    fn post_recv_doubles(&self, count: usize, src: Rank, tag: Tag) -> RecvRequest {
        // Messages are buffered at the destination regardless of posted
        // receives, so posting is pure bookkeeping; matching happens in
        // wait_into and is FIFO per (source, tag).
        RecvRequest { src, tag, count }
    }

    fn wait_into(&self, req: RecvRequest, buf: &mut [f64]) {
        debug_assert_eq!(buf.len(), req.count);
        let peer = &self.hub.queues[self.rank];
        let mut q = peer.q.lock().expect("peer rank died holding a queue");
        loop {
            let pos = q.iter().position(|e| {
                e.src == req.src && e.tag == req.tag && matches!(e.data, Payload::Dbl(_))
            });
            if let Some(pos) = pos {
                match q.remove(pos).expect("matched position vanished").data {
                    Payload::Dbl(data) => {
                        assert_eq!(data.len(), req.count, "message length mismatch");
                        buf.copy_from_slice(&data);
                    }
                    Payload::Spike(_) => unreachable!(),
                }
                return;
            }
            q = peer.cv.wait(q).expect("peer rank died holding a queue");
        }
    }

    fn multisend(&self, spk: Spike, targets: &[Rank]) {
        for &t in targets {
            debug_assert_ne!(t as usize, self.rank, "multisend cannot target self");
            self.hub.push(
                t as usize,
                Envelope {
                    src: self.rank as Rank,
                    tag: tags::SPIKE,
                    data: Payload::Spike(spk),
                },
            );
        }
    }

    fn try_recv_spike(&self) -> Option<Spike> {
        let peer = &self.hub.queues[self.rank];
        let mut q = peer.q.lock().expect("peer rank died holding a queue");
        let pos = q.iter().position(|e| e.tag == tags::SPIKE)?;
        match q.remove(pos).expect("matched position vanished").data {
            Payload::Spike(s) => Some(s),
            Payload::Dbl(_) => unreachable!(),
        }
    }
}
