//! Spike records and presynaptic bookkeeping
//!
//! A spike is a `(gid, spiketime)` pair. The `gid` is a process-global
//! identifier of the source; every rank owning a subscription to that
//! `gid` must see the pair before its local clock passes
//! `spiketime + min_delay`.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::{Gid, Rank};

/// A point event on the wire: 4-byte source id plus 8-byte event time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Spike {
    /// Process-global source identifier. The sign bit is borrowed
    /// during multicast to address the odd-subinterval receive buffer.
    pub gid: Gid,
    /// Time the source crossed threshold.
    pub spiketime: f64,
}

impl Spike {
    /// Encode the target subinterval into the gid. Buffer 1 is
    /// addressed by complementing the gid; buffer 0 leaves it alone.
    pub fn coded(gid: Gid, spiketime: f64, next_buf: usize) -> Spike {
        let gid = if next_buf == 1 { !gid } else { gid };
        Spike { gid, spiketime }
    }

    /// Recover the subinterval index and the true gid at ingress.
    pub fn decoded(&self) -> (usize, Gid) {
        if self.gid < 0 {
            (1, !self.gid)
        } else {
            (0, self.gid)
        }
    }
}

/// A locally owned event source.
#[derive(Debug, Clone, Default)]
pub struct PreSyn {
    /// Global identifier of this source.
    pub gid: Gid,
    /// Marked for spike output by `outputcell`.
    pub output: bool,
    /// Short per-rank encoding used by the compressed codec.
    pub localgid: Option<u32>,
    /// Ranks that subscribe to this source, ascending, excluding self.
    pub targets: SmallVec<[Rank; 4]>,
    /// The owning rank also subscribes; deliver locally on send.
    pub send2self: bool,
}

/// A locally owned subscription to a remote (or local) source.
#[derive(Debug, Clone, Copy)]
pub struct InputTarget {
    /// The gid this subscription listens to.
    pub gid: Gid,
    /// Resolved owner of the gid; -1 until the planner has run.
    pub src_rank: Rank,
    /// Opaque handler understood by the environment's event queue.
    pub sink: usize,
}

/// Process-local gid resolution tables.
///
/// `out` holds the sources generated here, `input` the subscriptions.
/// A gid may appear in both when a rank listens to its own cell.
#[derive(Debug, Default)]
pub struct GidTables {
    /// gid to locally owned source.
    pub out: HashMap<Gid, PreSyn>,
    /// gid to local subscription.
    pub input: HashMap<Gid, InputTarget>,
    /// Declared gid ownership, from `set_gid2node`.
    pub owner: HashMap<Gid, Rank>,
}

impl GidTables {
    /// Sorted list of output gids, the canonical localgid order.
    pub fn output_gids(&self) -> Vec<Gid> {
        let mut gids: Vec<Gid> = self
            .out
            .values()
            .filter(|ps| ps.output)
            .map(|ps| ps.gid)
            .collect();
        gids.sort_unstable();
        gids
    }

    /// Assign localgids in sorted-gid order. Returns the count.
    pub fn assign_localgids(&mut self) -> usize {
        let gids = self.output_gids();
        for (i, gid) in gids.iter().enumerate() {
            if let Some(ps) = self.out.get_mut(gid) {
                ps.localgid = Some(i as u32);
            }
        }
        gids.len()
    }
}

/// The environment's event queue.
///
/// `enqueue` must be re-entrant with respect to the local step advance;
/// the runtime calls it while draining receive buffers at interval
/// boundaries.
pub trait EventSink {
    /// Enqueue an incoming spike for the given subscription handler.
    fn enqueue(&mut self, target: usize, spiketime: f64);
}

/// Records deliveries; the sink used throughout the test suite.
#[derive(Debug, Default)]
pub struct VecSink {
    /// Everything enqueued so far, in delivery order.
    pub delivered: Vec<(usize, f64)>,
}

impl EventSink for VecSink {
    fn enqueue(&mut self, target: usize, spiketime: f64) {
        self.delivered.push((target, spiketime));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subinterval_coding_round_trips() {
        let s = Spike::coded(42, 1.5, 1);
        assert!(s.gid < 0);
        assert_eq!(s.decoded(), (1, 42));
        let s = Spike::coded(42, 1.5, 0);
        assert_eq!(s.decoded(), (0, 42));
    }

    #[test]
    fn localgid_order_is_sorted() {
        let mut t = GidTables::default();
        for gid in [7, 3, 11] {
            t.out.insert(
                gid,
                PreSyn {
                    gid,
                    output: true,
                    ..PreSyn::default()
                },
            );
        }
        assert_eq!(t.assign_localgids(), 3);
        assert_eq!(t.out[&3].localgid, Some(0));
        assert_eq!(t.out[&7].localgid, Some(1));
        assert_eq!(t.out[&11].localgid, Some(2));
    }
}
