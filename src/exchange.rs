//! Collective spike exchange
//!
//! The default exchange strategy: at every minimum-delay boundary all
//! ranks gather the count of spikes generated everywhere, size their
//! receive vectors, and gather the records themselves. Each record is
//! then dispatched to the local subscription table.
//!
//! Two refinements cut the cost when counts are small:
//!
//! - With a non-zero inline buffer size, the first `k` records of every
//!   rank travel inside a fixed-size all-gather and only ranks with
//!   more than `k` spikes participate in the varying-count overflow.
//! - With compression enabled, records shrink to a delta-time byte and
//!   a short local gid (see [`crate::codec`]), again with a fixed slot
//!   and a varying-count overflow.

use log::{debug, trace};

use crate::codec::{localgid_width, Codec};
use crate::datatype::ReduceOp;
use crate::error::Result;
use crate::spike::{EventSink, GidTables, Spike};
use crate::transport::{displacements, Communicator};
use crate::{Count, Gid};

/// State of the compressed exchange path.
#[derive(Debug)]
struct CompressExchange {
    codec: Codec,
    spfixout: Vec<u8>,
    spfixin: Vec<u8>,
    spfixin_ovfl: Vec<u8>,
    byteovfl: Vec<Count>,
    ovfl_displs: Vec<Count>,
    /// Per source rank, localgid to gid. Empty when gid compression is
    /// off and the raw gid travels instead.
    localmaps: Vec<Vec<Gid>>,
}

/// All-gather based spike exchanger.
#[derive(Debug, Default)]
pub struct SpikeExchanger {
    spikeout: Vec<Spike>,
    spikein: Vec<Spike>,
    nin: Vec<Count>,
    displs: Vec<Count>,
    /// Records carried inline in the fixed all-gather; 0 disables the
    /// small-buffer path.
    spikebuf_size: usize,
    compress: Option<CompressExchange>,
    /// Spikes emitted locally since the start of the run.
    pub nsend: u64,
    /// Records delivered to local subscribers since the start of the
    /// run.
    pub nrecv: u64,
}

impl SpikeExchanger {
    /// A plain exchanger with no inline buffer and no compression.
    pub fn new() -> SpikeExchanger {
        SpikeExchanger::default()
    }

    /// Carry the first `k` records of every rank inline in a fixed
    /// all-gather.
    pub fn set_spikebuf_size(&mut self, k: usize) {
        self.spikebuf_size = k;
    }

    /// Switch to the compressed wire format.
    ///
    /// `slot_nspike` entries per rank travel in the fixed slot.
    /// Collective: agrees the localgid width on every rank and builds
    /// the per-source-rank gid side tables.
    pub fn enable_compress<C: Communicator>(
        &mut self,
        comm: &C,
        tables: &mut GidTables,
        slot_nspike: usize,
        gid_compress: bool,
        dt: f64,
    ) -> Result<()> {
        let nout = tables.assign_localgids();
        let maxout = comm.all_reduce_int(nout as i32, ReduceOp::Max) as usize;
        let localgid_size = if gid_compress { localgid_width(maxout) } else { 4 };
        let codec = Codec {
            slot_nspike,
            localgid_size,
            gid_compress,
            dt,
        };
        let np = comm.size() as usize;

        // Side tables resolving a short code back to the gid: gather
        // every rank's output gids in localgid order.
        let localmaps = if gid_compress {
            let gids = tables.output_gids();
            let mut counts = vec![0 as Count; np];
            comm.all_gather_into(&[nout as Count], &mut counts);
            let mut displs = Vec::new();
            let total = displacements(&counts, &mut displs);
            let mut all = vec![0 as Gid; total];
            comm.all_gather_varcount_into(&gids, &mut all, &counts, &displs);
            (0..np)
                .map(|i| {
                    let d = displs[i] as usize;
                    all[d..d + counts[i] as usize].to_vec()
                })
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            "compressed spike exchange: slot={} entries, localgid {} byte(s), gid_compress={}",
            slot_nspike, localgid_size, gid_compress
        );
        self.compress = Some(CompressExchange {
            codec,
            spfixout: Vec::new(),
            spfixin: Vec::new(),
            spfixin_ovfl: Vec::new(),
            byteovfl: vec![0; np],
            ovfl_displs: vec![0; np],
            localmaps,
        });
        Ok(())
    }

    /// Record a locally generated spike for the next exchange.
    pub fn record(&mut self, gid: Gid, spiketime: f64) {
        self.spikeout.push(Spike { gid, spiketime });
        self.nsend += 1;
    }

    /// Spikes buffered for the next exchange.
    pub fn pending(&self) -> usize {
        self.spikeout.len()
    }

    /// Exchange all buffered spikes with every rank and dispatch the
    /// incoming records to local subscribers. `t_prev` is the time of
    /// the previous exchange, the reference for compressed delta times.
    /// Returns the global record count seen this interval.
    pub fn exchange<C: Communicator>(
        &mut self,
        comm: &C,
        tables: &GidTables,
        sink: &mut dyn EventSink,
        t_prev: f64,
    ) -> Result<usize> {
        let n = if self.compress.is_some() {
            self.exchange_compressed(comm, tables, sink, t_prev)?
        } else if self.spikebuf_size > 0 {
            self.exchange_inline(comm, tables, sink)?
        } else {
            self.exchange_plain(comm, tables, sink)?
        };
        self.spikeout.clear();
        Ok(n)
    }

    fn dispatch(
        tables: &GidTables,
        sink: &mut dyn EventSink,
        nrecv: &mut u64,
        gid: Gid,
        t: f64,
    ) {
        if let Some(inp) = tables.input.get(&gid) {
            sink.enqueue(inp.sink, t);
            *nrecv += 1;
        }
    }

    fn exchange_plain<C: Communicator>(
        &mut self,
        comm: &C,
        tables: &GidTables,
        sink: &mut dyn EventSink,
    ) -> Result<usize> {
        let np = comm.size() as usize;
        self.nin.resize(np, 0);
        let nout = self.spikeout.len() as Count;
        comm.all_gather_into(&[nout], &mut self.nin);
        let n = displacements(&self.nin, &mut self.displs);
        if n > 0 {
            if self.spikein.len() < n {
                self.spikein.resize(n + 10, Spike::default());
                trace!("spikein grown to {}", self.spikein.len());
            }
            comm.all_gather_varcount_into(
                &self.spikeout,
                &mut self.spikein[..],
                &self.nin,
                &self.displs,
            );
            for i in 0..n {
                let spk = self.spikein[i];
                Self::dispatch(tables, sink, &mut self.nrecv, spk.gid, spk.spiketime);
            }
        }
        Ok(n)
    }

    fn exchange_inline<C: Communicator>(
        &mut self,
        comm: &C,
        tables: &GidTables,
        sink: &mut dyn EventSink,
    ) -> Result<usize> {
        let np = comm.size() as usize;
        let k = self.spikebuf_size;
        self.nin.resize(np, 0);

        // Fixed part: count plus the first k records of every rank.
        let mut counts = vec![0 as Count; np];
        comm.all_gather_into(&[self.spikeout.len() as Count], &mut counts);
        let mut inline = self.spikeout.clone();
        inline.resize(k, Spike::default());
        let mut inline_in = vec![Spike::default(); k * np];
        comm.all_gather_into(&inline[..k], &mut inline_in);

        // Only counts above k enter the overflow gather.
        let mut ntot = 0usize;
        let mut novfl = 0;
        for i in 0..np {
            let n = counts[i] as usize;
            ntot += n;
            self.nin[i] = n.saturating_sub(k) as Count;
            novfl += self.nin[i];
        }
        let _ = displacements(&self.nin, &mut self.displs);
        if novfl > 0 {
            let need = novfl as usize;
            if self.spikein.len() < need {
                self.spikein.resize(need + 10, Spike::default());
            }
            let own_ovfl = &self.spikeout[self.spikeout.len().min(k)..];
            comm.all_gather_varcount_into(
                own_ovfl,
                &mut self.spikein[..],
                &self.nin,
                &self.displs,
            );
        }
        for i in 0..np {
            let n = counts[i] as usize;
            for j in 0..n.min(k) {
                let spk = inline_in[i * k + j];
                Self::dispatch(tables, sink, &mut self.nrecv, spk.gid, spk.spiketime);
            }
            let d = self.displs[i] as usize;
            for j in 0..n.saturating_sub(k) {
                let spk = self.spikein[d + j];
                Self::dispatch(tables, sink, &mut self.nrecv, spk.gid, spk.spiketime);
            }
        }
        Ok(ntot)
    }

    fn exchange_compressed<C: Communicator>(
        &mut self,
        comm: &C,
        tables: &GidTables,
        sink: &mut dyn EventSink,
        t_prev: f64,
    ) -> Result<usize> {
        let np = comm.size() as usize;
        let cx = self.compress.as_mut().expect("compressed path not enabled");
        let slot = cx.codec.slot_bytes();

        let mut packet = Vec::new();
        cx.codec.encode(&self.spikeout, t_prev, &mut packet, |gid| {
            tables
                .out
                .get(&gid)
                .and_then(|ps| ps.localgid)
                .expect("spike from a gid with no localgid")
        })?;

        cx.spfixin.resize(slot * np, 0);
        comm.all_gather_into(&packet[..slot], &mut cx.spfixin);

        // Scan the headers for overflow and total counts.
        let mut ntot = 0usize;
        let mut novfl = 0usize;
        let mut bstot: Count = 0;
        for i in 0..np {
            cx.ovfl_displs[i] = bstot;
            let n = cx.codec.packet_count(&cx.spfixin[i * slot..]);
            ntot += n;
            let bs = cx.codec.overflow_bytes(n) as Count;
            cx.byteovfl[i] = bs;
            bstot += bs;
            novfl += n.saturating_sub(cx.codec.slot_nspike);
        }
        if novfl > 0 {
            let need = bstot as usize;
            if cx.spfixin_ovfl.len() < need {
                cx.spfixin_ovfl
                    .resize(need + 10 * cx.codec.entry_bytes(), 0);
            }
            // The send packet is one buffer; its overflow is contiguous
            // with the fixed part. The receive overflow is a separate
            // buffer because it resizes during a run.
            let own_tail = &packet[slot.min(packet.len())..];
            comm.all_gather_varcount_into(
                own_tail,
                &mut cx.spfixin_ovfl[..],
                &cx.byteovfl,
                &cx.ovfl_displs,
            );
            trace!("compressed exchange overflowed {novfl} records");
        }

        let mut nrecv = self.nrecv;
        for i in 0..np {
            let sl = &cx.spfixin[i * slot..(i + 1) * slot];
            let d = cx.ovfl_displs[i] as usize;
            let ovfl = &cx.spfixin_ovfl[d..d + cx.byteovfl[i] as usize];
            cx.codec.decode(sl, ovfl, t_prev, |code, t| {
                let gid = if cx.codec.gid_compress {
                    cx.localmaps[i][code as usize]
                } else {
                    code as Gid
                };
                Self::dispatch(tables, sink, &mut nrecv, gid, t);
            });
        }
        self.nrecv = nrecv;
        Ok(ntot)
    }
}
