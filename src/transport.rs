//! Point-to-point and collective communication
//!
//! The [`Communicator`] trait is the only surface through which the
//! spike exchangers and the multi-split solver talk to other ranks. It
//! is deliberately small: the collective subset covers barrier,
//! all-reduce, all-gather(v), all-to-all(v) and broadcast; the
//! point-to-point subset covers a blocking send (returning after local
//! buffering), a posted non-blocking receive completed by `wait_into`,
//! a probe-style `try_recv_spike` used by the conservation loop, and a
//! `multisend` fan-out used by the sender-initiated spike path.
//!
//! Collectives must be entered by every rank of the communicator, in
//! the same order. On a size-1 communicator every collective
//! short-circuits to a local copy.
//!
//! Failure model: any non-success condition inside an implementation is
//! fatal and surfaces as an opaque fault; partial-failure recovery is
//! not attempted.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Instant;

use crate::datatype::{Datum, ReduceOp, SlotData};
use crate::spike::Spike;
use crate::{Count, Rank, Tag};

/// Message classes multiplexed on one communicator.
///
/// Distinct tags per class keep out-of-order completions across classes
/// from cross-matching; within a (peer, tag) pair delivery is FIFO.
pub mod tags {
    use crate::Tag;

    /// Long backbone end to short backbone host, and the result back.
    pub const LONG_SHORT: Tag = 1;
    /// Long backbone end to long backbone end.
    pub const LONG_LONG: Tag = 2;
    /// Partial-tree contributions to the reduced-tree host.
    pub const SUBTREE_REDUCED: Tag = 3;
    /// Solved reduced-tree rows back to the subtrees.
    pub const REDUCED_RESULT: Tag = 4;
    /// Multicast spike records.
    pub const SPIKE: Tag = 5;
}

/// A posted receive that must be completed with
/// [`Communicator::wait_into`].
#[must_use = "a posted receive must be completed with wait_into"]
#[derive(Debug, Clone, Copy)]
pub struct RecvRequest {
    /// Rank the message is expected from.
    pub src: Rank,
    /// Message class.
    pub tag: Tag,
    /// Number of doubles expected.
    pub count: usize,
}

/// Communication operations shared by every transport implementation.
pub trait Communicator {
    /// Rank of the calling process in this communicator.
    fn rank(&self) -> Rank;

    /// Number of processes in this communicator.
    fn size(&self) -> Rank;

    /// Block until every rank has entered the barrier.
    fn barrier(&self);

    /// Monotonic seconds since an arbitrary time in the past. Used only
    /// for telemetry.
    fn wtime(&self) -> f64;

    /// Global reduction of a single double on all ranks.
    fn all_reduce_dbl(&self, x: f64, op: ReduceOp) -> f64;

    /// Global reduction of a single integer on all ranks.
    fn all_reduce_int(&self, x: i32, op: ReduceOp) -> i32;

    /// Concatenate equal-count contributions from all ranks, in rank
    /// order, on every rank. `recv.len()` must be
    /// `send.len() * size()`.
    fn all_gather_into<T: Datum>(&self, send: &[T], recv: &mut [T]);

    /// Concatenate varying-count contributions from all ranks. Rank
    /// `i`'s contribution lands at `recv[displs[i]..][..counts[i]]`.
    fn all_gather_varcount_into<T: Datum>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[Count],
        displs: &[Count],
    );

    /// Exchange equal-size blocks between all pairs of ranks. Block `j`
    /// of `send` goes to rank `j`; block `j` of `recv` came from rank
    /// `j`.
    fn all_to_all_into<T: Datum>(&self, send: &[T], recv: &mut [T]);

    /// Exchange varying-size blocks between all pairs of ranks.
    #[allow(clippy::too_many_arguments)]
    fn all_to_all_varcount_into<T: Datum>(
        &self,
        send: &[T],
        scounts: &[Count],
        sdispls: &[Count],
        recv: &mut [T],
        rcounts: &[Count],
        rdispls: &[Count],
    );

    /// Replicate `buf` from `root` onto every rank.
    fn broadcast_into<T: Datum>(&self, buf: &mut [T], root: Rank);

    /// Send doubles to `dest`. Blocking with respect to the runtime but
    /// returns after local buffering.
    fn send_doubles(&self, buf: &[f64], dest: Rank, tag: Tag);

    /// Post a non-blocking receive of `count` doubles from `src`.
    fn post_recv_doubles(&self, count: usize, src: Rank, tag: Tag) -> RecvRequest;

    /// Complete a posted receive, filling `buf`. `buf.len()` must equal
    /// the posted count.
    fn wait_into(&self, req: RecvRequest, buf: &mut [f64]);

    /// Fan a spike record out to each listed rank. Never targets the
    /// calling rank.
    fn multisend(&self, spk: Spike, targets: &[Rank]);

    /// Non-blocking any-source receive of one multicast spike record.
    /// The transport-advance primitive of the conservation loop.
    fn try_recv_spike(&self) -> Option<Spike>;
}

/// The size-1 communicator.
///
/// Collectives degenerate to local copies, point-to-point to an
/// in-process queue. A job of one rank runs the full runtime unchanged
/// through this type.
#[derive(Debug)]
pub struct SelfComm {
    epoch: Instant,
    dbl_queue: RefCell<VecDeque<(Tag, Vec<f64>)>>,
    spike_queue: RefCell<VecDeque<Spike>>,
}

impl SelfComm {
    /// A fresh single-rank communicator.
    pub fn new() -> SelfComm {
        SelfComm {
            epoch: Instant::now(),
            dbl_queue: RefCell::new(VecDeque::new()),
            spike_queue: RefCell::new(VecDeque::new()),
        }
    }
}

impl Default for SelfComm {
    fn default() -> Self {
        SelfComm::new()
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> Rank {
        1
    }

    fn barrier(&self) {}

    fn wtime(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn all_reduce_dbl(&self, x: f64, _op: ReduceOp) -> f64 {
        x
    }

    fn all_reduce_int(&self, x: i32, _op: ReduceOp) -> i32 {
        x
    }

    fn all_gather_into<T: Datum>(&self, send: &[T], recv: &mut [T]) {
        recv[..send.len()].copy_from_slice(send);
    }

    fn all_gather_varcount_into<T: Datum>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[Count],
        displs: &[Count],
    ) {
        debug_assert_eq!(counts[0] as usize, send.len());
        let d = displs[0] as usize;
        recv[d..d + send.len()].copy_from_slice(send);
    }

    fn all_to_all_into<T: Datum>(&self, send: &[T], recv: &mut [T]) {
        recv[..send.len()].copy_from_slice(send);
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
        debug_assert_eq!(scounts[0], rcounts[0]);
        let sd = sdispls[0] as usize;
        let rd = rdispls[0] as usize;
        let n = scounts[0] as usize;
        recv[rd..rd + n].copy_from_slice(&send[sd..sd + n]);
    }

    fn broadcast_into<T: Datum>(&self, _buf: &mut [T], _root: Rank) {}

    fn send_doubles(&self, buf: &[f64], dest: Rank, tag: Tag) {
        assert_eq!(dest, 0, "size-1 communicator has no peer {dest}");
        self.dbl_queue.borrow_mut().push_back((tag, buf.to_vec()));
    }

    fn post_recv_doubles(&self, count: usize, src: Rank, tag: Tag) -> RecvRequest {
        assert_eq!(src, 0, "size-1 communicator has no peer {src}");
        RecvRequest { src, tag, count }
    }

    fn wait_into(&self, req: RecvRequest, buf: &mut [f64]) {
        let mut q = self.dbl_queue.borrow_mut();
        let pos = q
            .iter()
            .position(|(tag, _)| *tag == req.tag)
            .expect("self receive would deadlock: no matching message queued");
        let (_, data) = q.remove(pos).unwrap();
        assert_eq!(data.len(), req.count);
        buf.copy_from_slice(&data);
    }

    fn multisend(&self, _spk: Spike, targets: &[Rank]) {
        assert!(targets.is_empty(), "size-1 communicator has no peers");
    }

    fn try_recv_spike(&self) -> Option<Spike> {
        self.spike_queue.borrow_mut().pop_front()
    }
}

/// Prefix-sum a count vector into displacements; returns the total.
///
/// The ubiquitous companion of every varying-count collective.
pub fn displacements(counts: &[Count], displs: &mut Vec<Count>) -> usize {
    displs.clear();
    let mut acc: Count = 0;
    for &c in counts {
        displs.push(acc);
        acc += c;
    }
    acc as usize
}

/// Slice one rank's contribution out of a deposited collective slot.
pub(crate) fn slot_slice<T: Datum>(slot: &SlotData) -> &[T] {
    T::slice(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_comm_collectives_copy() {
        let c = SelfComm::new();
        let mut out = [0i32; 3];
        c.all_gather_into(&[1, 2, 3], &mut out);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(c.all_reduce_dbl(2.5, ReduceOp::Min), 2.5);
        let mut v = [0.5f64];
        c.broadcast_into(&mut v, 0);
        assert_eq!(v, [0.5]);
    }

    #[test]
    fn self_comm_send_recv_matches_tags() {
        let c = SelfComm::new();
        c.send_doubles(&[1.0, 2.0], 0, tags::LONG_LONG);
        c.send_doubles(&[9.0], 0, tags::LONG_SHORT);
        let r = c.post_recv_doubles(1, 0, tags::LONG_SHORT);
        let mut buf = [0.0];
        c.wait_into(r, &mut buf);
        assert_eq!(buf, [9.0]);
    }

    #[test]
    fn displacement_scan() {
        let mut d = Vec::new();
        let total = displacements(&[2, 0, 3], &mut d);
        assert_eq!(total, 5);
        assert_eq!(d, vec![0, 2, 2]);
    }
}
