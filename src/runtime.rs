//! The parallel runtime context
//!
//! [`ParContext`] is the explicitly constructed value every directive
//! and control operation goes through; there is no process-global
//! state. A typical lifecycle:
//!
//! 1. declare gid ownership, sources and subscriptions;
//! 2. declare `multisplit` directives against the installed topology;
//! 3. `setup_transfer` (spike connectivity) and `multisplit_setup`
//!    (solver plan), both collective;
//! 4. `set_maxstep`, then `psolve` to the stop time, with the
//!    environment's integration callback emitting spikes through
//!    `post_spike` and the solver invoked once per step.
//!
//! Directives are idempotent records; nothing talks to other ranks
//! until one of the setup operations runs.

use log::debug;

use crate::cell::{BackboneStyle, Layout, MsList, Nodes};
use crate::datatype::{Datum, ReduceOp};
use crate::dma::DmaExchanger;
use crate::error::{Error, Result};
use crate::exchange::SpikeExchanger;
use crate::msolve::MsSolver;
use crate::plan;
use crate::spike::{EventSink, GidTables, InputTarget, PreSyn};
use crate::transport::Communicator;
use crate::{Gid, Rank, Sid};

/// Reserved sid namespace for [`ParContext::splitcell_connect`] pairs.
const SPLITCELL_SID_BASE: Sid = 1 << 30;

/// Which spike transport drives the min-delay exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMethod {
    /// Collective all-gather exchange.
    Collective,
    /// Sender-initiated multicast with a conservation check; the field
    /// is the number of subintervals per min-delay interval (1 or 2).
    Multisend(usize),
}

#[derive(Debug)]
enum SpikeMode {
    Collective(SpikeExchanger),
    Dma(DmaExchanger),
}

/// The multi-split side of the runtime: topology, directives, layout
/// and solver.
#[derive(Debug, Default)]
pub struct MsNet {
    /// Node storage, permuted into solver order by `multisplit_setup`.
    pub nodes: Nodes,
    /// Recorded split directives.
    pub ms: MsList,
    /// The active layout, if setup has run.
    pub layout: Option<Layout>,
    /// The active exchange plan, if setup has run.
    pub solver: Option<MsSolver>,
}

/// Per-rank runtime context.
#[derive(Debug)]
pub struct ParContext<C: Communicator> {
    comm: C,
    /// gid resolution tables.
    pub tables: GidTables,
    /// The multi-split state, once a topology is installed.
    pub net: MsNet,
    threshold: f64,
    dt: f64,
    maxstep: f64,
    t: f64,
    t_exchange: f64,
    mode: SpikeMode,
    compress: Option<(usize, bool)>,
    spikebuf: usize,
    method: ExchangeMethod,
}

impl<C: Communicator> ParContext<C> {
    /// A fresh context over the given communicator.
    pub fn new(comm: C) -> ParContext<C> {
        ParContext {
            comm,
            tables: GidTables::default(),
            net: MsNet::default(),
            threshold: -20.0,
            dt: 0.025,
            maxstep: 0.5,
            t: 0.0,
            t_exchange: 0.0,
            mode: SpikeMode::Collective(SpikeExchanger::new()),
            compress: None,
            spikebuf: 0,
            method: ExchangeMethod::Collective,
        }
    }

    /// This process's rank.
    pub fn id(&self) -> Rank {
        self.comm.rank()
    }

    /// Number of ranks in the job.
    pub fn nhost(&self) -> Rank {
        self.comm.size()
    }

    /// The underlying communicator.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Current simulated time.
    pub fn t(&self) -> f64 {
        self.t
    }

    // ---- configuration directives -------------------------------------

    /// Declare that `gid` is owned by `rank`.
    pub fn set_gid2node(&mut self, gid: Gid, rank: Rank) {
        self.tables.owner.insert(gid, rank);
        if rank == self.comm.rank() {
            self.tables.out.entry(gid).or_insert_with(|| PreSyn {
                gid,
                ..PreSyn::default()
            });
        }
    }

    /// Associate an output source with `gid` on this rank.
    pub fn cell(&mut self, gid: Gid) -> Result<()> {
        match self.tables.owner.get(&gid) {
            Some(&r) if r == self.comm.rank() => {
                self.tables.out.entry(gid).or_insert_with(|| PreSyn {
                    gid,
                    ..PreSyn::default()
                });
                Ok(())
            }
            Some(&r) => Err(Error::config(format!(
                "cell({gid}) on rank {} but the gid is owned by rank {r}",
                self.comm.rank()
            ))),
            None => Err(Error::config(format!("cell({gid}) before set_gid2node"))),
        }
    }

    /// Mark `gid` for spike output.
    pub fn outputcell(&mut self, gid: Gid) {
        let entry = self.tables.out.entry(gid).or_insert_with(|| PreSyn {
            gid,
            ..PreSyn::default()
        });
        entry.output = true;
    }

    /// Subscribe this rank to `gid`, delivering into the environment's
    /// handler `sink`.
    pub fn gid_connect(&mut self, gid: Gid, sink: usize) {
        self.tables.input.insert(
            gid,
            InputTarget {
                gid,
                src_rank: -1,
                sink,
            },
        );
    }

    /// Crossing threshold for spike detection.
    pub fn threshold(&mut self, value: f64) -> f64 {
        self.threshold = value;
        self.threshold
    }

    /// Fixed integration step, the unit of compressed delta times.
    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    /// Enable compressed spike exchange and/or pick the exchange
    /// method. `nspike` is the fixed-slot entry count (0 leaves the
    /// wire format uncompressed).
    pub fn spike_compress(&mut self, nspike: i32, gid_compress: bool, method: ExchangeMethod) {
        self.compress = if nspike > 0 {
            Some((nspike as usize, gid_compress))
        } else {
            None
        };
        self.method = method;
    }

    /// Carry the first `k` records of every rank inline in the fixed
    /// all-gather of the uncompressed collective exchange.
    pub fn set_spikebuf_size(&mut self, k: usize) {
        self.spikebuf = k;
    }

    // ---- spike transfer setup and operation ---------------------------

    /// Run the connectivity planner and instantiate the configured
    /// exchanger. Collective.
    pub fn setup_transfer(&mut self, sink_check: bool) -> Result<()> {
        let max_ntarget = plan::setup_connectivity(&self.comm, &mut self.tables)?;
        if sink_check {
            for inp in self.tables.input.values() {
                if inp.src_rank < 0 {
                    return Err(Error::config(format!(
                        "subscription to gid {} has no output anywhere",
                        inp.gid
                    )));
                }
            }
        }
        self.mode = match self.method {
            ExchangeMethod::Collective => {
                let mut ex = SpikeExchanger::new();
                ex.set_spikebuf_size(self.spikebuf);
                if let Some((nspike, gid_compress)) = self.compress {
                    ex.enable_compress(&self.comm, &mut self.tables, nspike, gid_compress, self.dt)?;
                }
                SpikeMode::Collective(ex)
            }
            ExchangeMethod::Multisend(n_interval) => {
                let mut ex = DmaExchanger::new(n_interval);
                ex.init();
                SpikeMode::Dma(ex)
            }
        };
        debug!("spike transfer ready, widest fan-out {max_ntarget}");
        Ok(())
    }

    /// Emit a locally generated spike. In multisend mode the record
    /// leaves immediately; in collective mode it waits for the next
    /// interval boundary.
    pub fn post_spike(&mut self, gid: Gid, t: f64, sink: &mut dyn EventSink) -> Result<()> {
        match &mut self.mode {
            SpikeMode::Collective(ex) => {
                ex.record(gid, t);
                Ok(())
            }
            SpikeMode::Dma(ex) => {
                let ps = self
                    .tables
                    .out
                    .get(&gid)
                    .ok_or_else(|| Error::config(format!("spike from unknown gid {gid}")))?;
                ex.send(&self.comm, ps, t, &self.tables, sink);
                Ok(())
            }
        }
    }

    /// Run the end-of-interval exchange and enqueue everything received.
    pub fn spike_exchange(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        match &mut self.mode {
            SpikeMode::Collective(ex) => {
                ex.exchange(&self.comm, &self.tables, sink, self.t_exchange)?;
            }
            SpikeMode::Dma(ex) => {
                ex.receive(&self.comm, &self.tables, sink)?;
            }
        }
        self.t_exchange = self.t;
        Ok(())
    }

    /// Spikes sent and received so far (collective mode telemetry).
    pub fn spike_counts(&self) -> (u64, u64) {
        match &self.mode {
            SpikeMode::Collective(ex) => (ex.nsend, ex.nrecv),
            SpikeMode::Dma(_) => (0, 0),
        }
    }

    /// The conservation histogram (multisend mode telemetry).
    pub fn conservation_histogram(&self) -> Option<&[u64]> {
        match &self.mode {
            SpikeMode::Dma(ex) => Some(&ex.cons_hist),
            SpikeMode::Collective(_) => None,
        }
    }

    // ---- control -------------------------------------------------------

    /// Commit the minimum-delay interval: the global minimum of every
    /// rank's bound. Collective.
    pub fn set_maxstep(&mut self, local: f64) -> f64 {
        self.maxstep = self.comm.all_reduce_dbl(local, ReduceOp::Min);
        self.maxstep
    }

    /// Integrate to `tstop`. The callback advances local state to the
    /// given boundary time, emitting spikes through
    /// [`ParContext::post_spike`]; the runtime exchanges at every
    /// subinterval boundary.
    pub fn psolve(
        &mut self,
        tstop: f64,
        sink: &mut dyn EventSink,
        advance: &mut dyn FnMut(&mut ParContext<C>, f64, &mut dyn EventSink) -> Result<()>,
    ) -> Result<()> {
        let stride = match &self.mode {
            SpikeMode::Dma(ex) => self.maxstep / ex.n_interval() as f64,
            SpikeMode::Collective(_) => self.maxstep,
        };
        while self.t < tstop - 1e-12 {
            let tnext = (self.t + stride).min(tstop);
            advance(self, tnext, sink)?;
            self.t = tnext;
            self.spike_exchange(sink)?;
        }
        Ok(())
    }

    // ---- exposed collectives -------------------------------------------

    /// Barrier across all ranks.
    pub fn barrier(&self) {
        self.comm.barrier();
    }

    /// Global reduction of one double.
    pub fn allreduce(&self, x: f64, op: ReduceOp) -> f64 {
        self.comm.all_reduce_dbl(x, op)
    }

    /// Gather one value from every rank, in rank order.
    pub fn allgather<T: Datum>(&self, x: T, out: &mut [T]) {
        self.comm.all_gather_into(&[x], out);
    }

    /// Exchange equal blocks between all pairs of ranks.
    pub fn alltoall<T: Datum>(&self, send: &[T], out: &mut [T]) {
        self.comm.all_to_all_into(send, out);
    }

    /// Replicate from `root` to every rank.
    pub fn broadcast<T: Datum>(&self, buf: &mut [T], root: Rank) {
        self.comm.broadcast_into(buf, root);
    }

    /// Monotonic seconds, for telemetry.
    pub fn wtime(&self) -> f64 {
        self.comm.wtime()
    }

    // ---- multi-split ---------------------------------------------------

    /// Install the cell topology this rank integrates.
    pub fn install_topology(&mut self, nodes: Nodes) {
        self.net = MsNet {
            nodes,
            ..MsNet::default()
        };
    }

    /// Declare that `node` participates in split `sid` with the given
    /// backbone style.
    pub fn multisplit(&mut self, node: usize, sid: Sid, style: BackboneStyle) -> Result<()> {
        if sid < 0 {
            return Err(Error::config("sids must be non-negative"));
        }
        self.net.ms.add(&self.net.nodes, node, sid, style)
    }

    /// Two-rank split of the cell rooted at node 0: both ranks call
    /// this with the peer's rank and the shared split point becomes a
    /// reserved sid derived from the pair.
    pub fn splitcell_connect(&mut self, peer: Rank) -> Result<()> {
        let me = self.comm.rank();
        if peer == me || peer < 0 || peer >= self.comm.size() {
            return Err(Error::config(format!("splitcell peer {peer} out of range")));
        }
        let (lo, hi) = if me < peer { (me, peer) } else { (peer, me) };
        let sid = SPLITCELL_SID_BASE + lo * self.comm.size() + hi;
        self.net
            .ms
            .add(&self.net.nodes, 0, sid, BackboneStyle::Long)
    }

    /// Build the node ordering and the exchange plan. Collective, and
    /// idempotent: rebuilding from identical directives yields the
    /// identical plan.
    pub fn multisplit_setup(&mut self) -> Result<()> {
        if let Some(layout) = self.net.layout.take() {
            layout.restore_classical(&mut self.net.nodes, &mut self.net.ms);
        }
        self.net.solver = None;
        let layout = Layout::build(&mut self.net.nodes, &mut self.net.ms)?;
        let solver = MsSolver::setup(&self.comm, &self.net.nodes, &layout, &mut self.net.ms)?;
        self.net.layout = Some(layout);
        self.net.solver = Some(solver);
        Ok(())
    }

    /// One distributed factorisation and back-substitution over the
    /// installed topology.
    pub fn multisplit_solve(&mut self) -> Result<()> {
        let layout = self
            .net
            .layout
            .as_mut()
            .ok_or_else(|| Error::config("multisplit_solve before multisplit_setup"))?;
        let solver = self
            .net
            .solver
            .as_mut()
            .ok_or_else(|| Error::config("multisplit_solve before multisplit_setup"))?;
        solver.solve(&self.comm, &mut self.net.nodes, layout)
    }

    /// Settle zero-capacitance sid voltages; see [`MsSolver::nocap_v`].
    pub fn multisplit_nocap_v(&mut self) -> Result<()> {
        let layout = self
            .net
            .layout
            .as_mut()
            .ok_or_else(|| Error::config("nocap_v before multisplit_setup"))?;
        let solver = self
            .net
            .solver
            .as_mut()
            .ok_or_else(|| Error::config("nocap_v before multisplit_setup"))?;
        solver.nocap_v(&self.comm, &mut self.net.nodes, layout)
    }

    /// Fold the deferred zero-capacitance corrections back in.
    pub fn multisplit_adjust_rhs(&mut self) {
        if let Some(solver) = &self.net.solver {
            solver.adjust_rhs(&mut self.net.nodes);
        }
    }

    /// Tear down all multi-split state, restoring classical node order.
    /// Directives are dropped with it.
    pub fn multisplit_clear(&mut self) {
        if let Some(layout) = self.net.layout.take() {
            layout.restore_classical(&mut self.net.nodes, &mut self.net.ms);
        }
        self.net.solver = None;
        self.net.ms = MsList::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spike::VecSink;
    use crate::transport::SelfComm;

    #[test]
    fn single_rank_psolve_delivers_self_spikes() {
        let mut pc = ParContext::new(SelfComm::new());
        pc.set_gid2node(1, 0);
        pc.cell(1).unwrap();
        pc.outputcell(1);
        pc.gid_connect(1, 77);
        pc.setup_transfer(true).unwrap();
        pc.set_maxstep(0.5);

        let mut sink = VecSink::default();
        pc.psolve(1.0, &mut sink, &mut |pc, tnext, sink| {
            // One spike per interval, just before the boundary.
            pc.post_spike(1, tnext - 0.1, sink)
        })
        .unwrap();
        assert_eq!(sink.delivered.len(), 2);
        assert!(sink.delivered.iter().all(|&(h, _)| h == 77));
        let (nsend, nrecv) = pc.spike_counts();
        assert_eq!(nsend, 2);
        assert_eq!(nrecv, 2);
    }

    #[test]
    fn cell_requires_ownership() {
        let mut pc = ParContext::new(SelfComm::new());
        assert!(pc.cell(5).is_err());
        pc.set_gid2node(5, 0);
        assert!(pc.cell(5).is_ok());
    }

    #[test]
    fn setup_transfer_flags_orphan_subscriptions() {
        let mut pc = ParContext::new(SelfComm::new());
        pc.gid_connect(9, 0);
        assert!(pc.setup_transfer(true).is_err());
        assert!(pc.setup_transfer(false).is_ok());
    }
}
