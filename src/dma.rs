//! Sender-initiated spike exchange
//!
//! Overall strategy: when a cell spikes, the owning rank immediately
//! multicasts the `(gid, spiketime)` record to every rank holding a
//! subscriber, instead of waiting for a global all-gather. Received
//! records are parked in a receive buffer until the end of the
//! computation subinterval, then enqueued into the priority queue after
//! checking that the number of spikes received globally equals the
//! number sent.
//!
//! To halve the number of conservation checks, the minimum-delay
//! interval is split into two equal subintervals with one receive
//! buffer each. A spike generated in an even subinterval does not enter
//! the conservation check until the end of the next even subinterval;
//! during transmission its gid is complemented to address the odd
//! buffer, and the bit is restored at ingress.

use log::trace;

use crate::datatype::ReduceOp;
use crate::error::Result;
use crate::spike::{EventSink, GidTables, PreSyn, Spike};
use crate::transport::Communicator;
use crate::Gid;

/// Extra conservation iterations tracked individually; anything beyond
/// lands in the last histogram bucket.
pub const MAXNCONS: usize = 10;

/// A growable spike vector owned by one subinterval.
///
/// Single-writer: `busy` guards against re-entry between the producer
/// (incoming records) and the consumer (the enqueue drain). Either side
/// finding `busy` set is a violated invariant and aborts.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    buf: Vec<Spike>,
    busy: bool,
    /// Spikes peers were asked to deliver into this buffer.
    pub nsend: i32,
    /// Spikes that actually arrived.
    pub nrecv: i32,
    /// High-water mark, for instrumentation.
    pub maxcount: usize,
}

impl ReceiveBuffer {
    /// Reset counters and drop parked records.
    pub fn init(&mut self) {
        assert!(!self.busy, "receive buffer re-entered");
        self.buf.clear();
        self.nsend = 0;
        self.nrecv = 0;
    }

    /// Park one incoming record.
    pub fn incoming(&mut self, gid: Gid, spiketime: f64) {
        assert!(!self.busy, "receive buffer re-entered");
        self.busy = true;
        self.buf.push(Spike { gid, spiketime });
        if self.buf.len() > self.maxcount {
            self.maxcount = self.buf.len();
        }
        self.nrecv += 1;
        self.busy = false;
    }

    /// Drain every parked record into the local queue and reset the
    /// conservation counters.
    pub fn enqueue(&mut self, tables: &GidTables, sink: &mut dyn EventSink) {
        assert!(!self.busy, "receive buffer re-entered");
        self.busy = true;
        for spk in &self.buf {
            let inp = tables
                .input
                .get(&spk.gid)
                .expect("received a spike with no local subscriber");
            sink.enqueue(inp.sink, spk.spiketime);
        }
        self.buf.clear();
        self.nrecv = 0;
        self.nsend = 0;
        self.busy = false;
    }

    /// Records currently parked.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no records are parked.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Multicast spike exchanger with dual receive buffers.
#[derive(Debug)]
pub struct DmaExchanger {
    rbuf: [ReceiveBuffer; 2],
    n_interval: usize,
    current: usize,
    next: usize,
    /// Total extra conservation iterations beyond the first check.
    pub n_xtra_cons_checks: u64,
    /// Histogram of extra iterations per receive, capped at
    /// [`MAXNCONS`].
    pub cons_hist: [u64; MAXNCONS + 1],
}

impl DmaExchanger {
    /// `n_interval` is 1 for one buffer per min-delay interval, 2 for
    /// the dual-subinterval scheme.
    pub fn new(n_interval: usize) -> DmaExchanger {
        assert!(n_interval == 1 || n_interval == 2);
        DmaExchanger {
            rbuf: [ReceiveBuffer::default(), ReceiveBuffer::default()],
            n_interval,
            current: 0,
            next: n_interval - 1,
            n_xtra_cons_checks: 0,
            cons_hist: [0; MAXNCONS + 1],
        }
    }

    /// Reset buffers and instrumentation at simulation start.
    pub fn init(&mut self) {
        for rb in &mut self.rbuf {
            rb.init();
        }
        self.current = 0;
        self.next = self.n_interval - 1;
        self.n_xtra_cons_checks = 0;
        self.cons_hist = [0; MAXNCONS + 1];
    }

    /// Number of subintervals per min-delay interval.
    pub fn n_interval(&self) -> usize {
        self.n_interval
    }

    /// Multicast one spike to the pre-computed target ranks of its
    /// source, and deliver locally when the source also subscribes to
    /// itself.
    pub fn send<C: Communicator>(
        &mut self,
        comm: &C,
        ps: &PreSyn,
        t: f64,
        tables: &GidTables,
        sink: &mut dyn EventSink,
    ) {
        if !ps.targets.is_empty() {
            self.rbuf[self.next].nsend += ps.targets.len() as i32;
            let spk = Spike::coded(ps.gid, t, if self.n_interval == 2 { self.next } else { 0 });
            comm.multisend(spk, &ps.targets);
        }
        // A multicast never targets its own rank.
        if ps.send2self {
            let inp = tables
                .input
                .get(&ps.gid)
                .expect("send2self without a local subscriber");
            sink.enqueue(inp.sink, t);
        }
    }

    /// Drain every record the transport has already delivered into the
    /// subinterval buffers. Returns how many arrived.
    fn advance<C: Communicator>(&mut self, comm: &C) -> usize {
        let mut n = 0;
        while let Some(spk) = comm.try_recv_spike() {
            let (ibuf, gid) = spk.decoded();
            self.rbuf[ibuf].incoming(gid, spk.spiketime);
            n += 1;
        }
        n
    }

    /// End-of-subinterval processing: spin the conservation loop until
    /// the globally summed send/receive imbalance of the current buffer
    /// reaches zero, then enqueue the buffered records and rotate
    /// buffers.
    pub fn receive<C: Communicator>(
        &mut self,
        comm: &C,
        tables: &GidTables,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        self.advance(comm);
        let mut ncons = 0usize;
        loop {
            let rb = &self.rbuf[self.current];
            if comm.all_reduce_int(rb.nsend - rb.nrecv, ReduceOp::Sum) == 0 {
                break;
            }
            self.advance(comm);
            ncons += 1;
        }
        if ncons > 0 {
            trace!("conservation needed {ncons} extra iterations");
        }
        self.n_xtra_cons_checks += ncons as u64;
        self.cons_hist[ncons.min(MAXNCONS)] += 1;

        self.rbuf[self.current].enqueue(tables, sink);
        if self.n_interval == 2 {
            self.current = self.next;
            self.next = (self.next + 1) & 1;
        }
        Ok(())
    }

    /// The current buffer's conservation counters, for tests and
    /// telemetry.
    pub fn counters(&self) -> (i32, i32) {
        (self.rbuf[self.current].nsend, self.rbuf[self.current].nrecv)
    }
}
