//! Multi-split exchange orchestration
//!
//! [`MsSolver::setup`] turns the all-gathered sid declarations of every
//! rank into a communication plan, and [`MsSolver::solve`] runs one
//! distributed factorisation over it.
//!
//! Exchange strategy, per step: post every receive, send all the long
//! backbone information, then handle the reduced trees and short
//! backbones the moment their inputs arrive, send their results, and
//! finally fold everything received back into the long ends. Transfer
//! descriptors are built in the order long-short, long-reduced,
//! long-long, reduced-long, short-long so the two wait barriers split
//! the list in two.
//!
//! Descriptors carry an explicit add-or-replace policy. Result-bearing
//! messages (a solved short backbone or reduced tree) replace the
//! receiving equation with `1 * v = rhs` and retire the stale fill
//! entries of the affected rows; plain matrix contributions accumulate.
//!
//! Area handling: couplings are stored area-normalised per node, so
//! anything sent toward a short backbone or reduced-tree host is scaled
//! by `0.01 * area` of the sending node, a receiving short backbone
//! scales by `100 / area`, and results need no scaling at all.

use smallvec::SmallVec;

use log::debug;

use crate::backbone::{
    bksub_backbone, bksub_short_backbone_part1, bksub_subtrees, triang_backbone,
    triang_subtree2backbone,
};
use crate::cell::{BackboneStyle, Layout, MsList, Nodes};
use crate::datatype::ReduceOp;
use crate::error::{Error, Result};
use crate::rtree::{ReducedTree, RtArenas, RtArenasMut, RtDst, RtSrc, NOCAP_V_SENTINEL};
use crate::transport::{displacements, tags, Communicator, RecvRequest};
use crate::{Count, Rank, Sid, Tag};

/// What to do with a descriptor's received values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvRole {
    /// Sum into the local `D` and `RHS`.
    AddMatrix,
    /// Replace the local equation with the solved result.
    ReplaceResult,
    /// Consumed by the reduced-tree receive map; nothing applied here.
    ReducedInput,
}

/// A stable handle into one of the two fill arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillSlot {
    S1A(usize),
    S1B(usize),
}

fn fill_value(layout: &Layout, slot: FillSlot) -> f64 {
    match slot {
        FillSlot::S1A(i) => layout.sid1a[i],
        FillSlot::S1B(i) => layout.sid1b[i],
    }
}

/// Per-peer transfer descriptor. Written once at setup, read-only
/// during steps apart from the pending receive handle.
#[derive(Debug)]
struct TransferInfo {
    host: Rank,
    tag: Tag,
    recv_role: RecvRole,
    /// Range into the shared node-index buffer.
    nodes: std::ops::Range<usize>,
    /// Off-diagonal fills sent after the node pairs.
    offdiag: Vec<FillSlot>,
    /// Node owning each off-diagonal fill, for area scaling.
    offdiag_nodes: Vec<usize>,
    /// Doubles in this message: two per node plus the off-diagonals.
    size: usize,
    /// Displacement into the shared send and receive buffers.
    displ: usize,
    /// Reduced-tree host this descriptor talks to, or -1.
    rthost: Rank,
    pending: Option<RecvRequest>,
}

/// A buffer slot pair needing area scaling.
#[derive(Debug, Clone, Copy)]
struct AreaSlot {
    buf: usize,
    node: usize,
}

/// Non-zero-area contributions leaving this rank for a remote
/// reduced-tree host; scaled inside the send buffer.
#[derive(Debug)]
struct Area2Buf {
    node: usize,
    ibuf: SmallVec<[usize; 3]>,
    adjust_rhs: f64,
}

/// In-place slot of a non-zero-area contribution feeding a local
/// reduced tree.
#[derive(Debug, Clone, Copy)]
enum InplaceSlot {
    D(usize),
    Rhs(usize),
    Fill(FillSlot),
}

/// Non-zero-area contributions feeding a reduced tree on this rank;
/// scaled in place before the gather.
#[derive(Debug)]
struct Area2Rt {
    node: usize,
    slots: SmallVec<[InplaceSlot; 3]>,
    adjust_rhs: f64,
}

/// The distributed multi-split solver of this rank.
#[derive(Debug, Default)]
pub struct MsSolver {
    msti: Vec<TransferInfo>,
    /// First descriptor of the reduced-to-long group.
    ihost_reduced_long: usize,
    /// First descriptor of the short-to-long group.
    ihost_short_long: usize,
    nodeindex: Vec<usize>,
    send_area: Vec<AreaSlot>,
    recv_area_short: Vec<AreaSlot>,
    recv_area_long: Vec<AreaSlot>,
    area2buf: Vec<Area2Buf>,
    area2rt: Vec<Area2Rt>,
    rtrees: Vec<ReducedTree>,
    /// Fill pairs of locally hosted reduced backbones, retired after
    /// each local scatter.
    local_replaced: Vec<(usize, usize)>,
    trecv: Vec<f64>,
    tsend: Vec<f64>,
    /// Seconds spent waiting inside the exchange.
    pub splitcell_wait: f64,
    /// Seconds spent in reduced-tree and short-backbone computation.
    pub rtcomp_time: f64,
}

fn reduced_mark(m: usize, sid: Sid, allsid: &[Sid], allbbr: &[i32], mark: &mut [isize]) {
    for i in 0..allsid.len() {
        if mark[i] == -1 && allsid[i] == sid {
            mark[i] = m as isize;
            if allbbr[i] > 2 {
                reduced_mark(m, allbbr[i] - 3, allsid, allbbr, mark);
            }
        }
    }
}

impl MsSolver {
    /// Build the communication plan from every rank's sid declarations.
    /// Collective; every rank of the communicator must enter, with or
    /// without local splits. Elects reduced-tree hosts and records them
    /// in `ms`.
    pub fn setup<C: Communicator>(
        comm: &C,
        nodes: &Nodes,
        layout: &Layout,
        ms: &mut MsList,
    ) -> Result<MsSolver> {
        let np = comm.size() as usize;
        let me = comm.rank();

        // The local sid entries: one per sid node, pieces contiguous,
        // declaration order. The backbone relation encodes the style
        // and, for an exact two-sid piece, the partner sid as
        // 3 + other_sid.
        let mut sid_l: Vec<Sid> = Vec::new();
        let mut inode: Vec<usize> = Vec::new();
        let mut bbr: Vec<i32> = Vec::new();
        let mut vec2ms: Vec<usize> = Vec::new();
        let mut entry_of_ms: Vec<usize> = Vec::new();
        let mut nwc = 0usize;
        for (mi, rec) in ms.list.iter().enumerate() {
            entry_of_ms.push(sid_l.len());
            let style = match rec.style {
                BackboneStyle::Long => 0,
                BackboneStyle::Short => 1,
                BackboneStyle::Reduced => 2,
            };
            sid_l.push(rec.sid[0]);
            inode.push(rec.nd[0].expect("directive without a node"));
            bbr.push(style);
            vec2ms.push(mi);
            if let Some(nd1) = rec.nd[1] {
                sid_l.push(rec.sid[1]);
                inode.push(nd1);
                bbr.push(style);
                vec2ms.push(mi);
                let k = sid_l.len();
                if rec.style == BackboneStyle::Reduced {
                    bbr[k - 2] += 1 + rec.sid[1];
                    bbr[k - 1] += 1 + rec.sid[0];
                }
            }
            if rec.style == BackboneStyle::Reduced {
                nwc += 1;
            }
        }
        let n = sid_l.len();
        if np == 1 && n == 0 {
            return Ok(MsSolver::default());
        }

        // Every rank's entries, concatenated in rank order.
        let mut nn = vec![0 as Count; np];
        comm.all_gather_into(&[n as Count], &mut nn);
        let mut displ: Vec<Count> = Vec::new();
        let nt = displacements(&nn, &mut displ);
        let mut allsid = vec![0 as Sid; nt];
        let mut allbbr = vec![0i32; nt];
        comm.all_gather_varcount_into(&sid_l, &mut allsid, &nn, &displ);
        comm.all_gather_varcount_into(&bbr, &mut allbbr, &nn, &displ);
        // One-past-the-end bound so displ[i]..displ[i + 1] works for
        // the last rank too.
        displ.push(nt as Count);
        if n == 0 {
            return Ok(MsSolver::default());
        }
        let own0 = displ[me as usize] as usize;

        // mark[i] is the local entry a global entry will talk to, or -1
        // for no communication. For exact-style cells the semantics
        // widen: every entry of a whole cell points at the principal
        // local entry of that cell.
        let mut mark = vec![-1isize; nt];
        let mut connects2short = vec![false; n];
        for i in 0..nt {
            for j in 0..n {
                if allsid[i] == sid_l[j] {
                    if (bbr[j] >= 2) != (allbbr[i] >= 2) {
                        return Err(Error::config(format!(
                            "backbone style for sid {} inconsistent between ranks",
                            sid_l[j]
                        )));
                    }
                    if allbbr[i] < 2 {
                        mark[i] = j as isize;
                        if allbbr[i] == 1 {
                            connects2short[j] = true;
                        }
                    }
                }
            }
        }
        for m in mark.iter_mut().skip(own0).take(n) {
            *m = -1;
        }
        // A long sid coupled to a short backbone elsewhere gets its
        // answer from the short host; drop the redundant long-long
        // traffic, carefully keeping short-long itself.
        for i in 0..nt {
            if mark[i] >= 0
                && connects2short[mark[i] as usize]
                && allbbr[i] == 0
                && bbr[mark[i] as usize] == 0
            {
                mark[i] = -1;
            }
        }
        for i in 0..nt {
            if mark[i] >= 0 && bbr[mark[i] as usize] == 1 && allbbr[i] == 1 {
                return Err(Error::config(
                    "a short to short backbone connection between ranks",
                ));
            }
        }
        for j in 0..n {
            if bbr[j] >= 2 {
                reduced_mark(j, sid_l[j], &allsid, &allbbr, &mut mark);
            }
        }

        // Reduced-tree host election: the first rank owning a two-sid
        // piece of the cell, else the first rank owning any piece.
        let mut rthost: Vec<Rank> = vec![-1; n];
        let mut rt_of: Vec<isize> = vec![-1; n];
        if nwc > 0 {
            for mi in 0..ms.list.len() {
                if ms.list[mi].style != BackboneStyle::Reduced {
                    continue;
                }
                let j = sid_l
                    .iter()
                    .position(|&s| s == ms.list[mi].sid[0])
                    .expect("own sid vanished");
                let mut elected: Rank = -1;
                let mut fallback: Rank = -1;
                'hosts: for ih in 0..np {
                    for i in displ[ih] as usize..displ[ih + 1] as usize {
                        if mark[i] == j as isize {
                            if allbbr[i] > 2 {
                                elected = ih as Rank;
                                break 'hosts;
                            }
                            if allbbr[i] == 2 && fallback == -1 {
                                fallback = ih as Rank;
                            }
                        }
                    }
                }
                let host = if elected != -1 { elected } else { fallback };
                ms.list[mi].rthost = host;
                // Only the principal sid carries the host; the count
                // below depends on it.
                rthost[j] = host;
            }
        }

        // Instantiate the reduced trees hosted here, one per principal
        // entry, rows keyed by sid in discovery order then renumbered
        // into tree order.
        let mut rtrees: Vec<ReducedTree> = Vec::new();
        for j in 0..n {
            if rthost[j] != me {
                continue;
            }
            let mut s2rt = std::collections::HashMap::new();
            let mut edges: Vec<(Sid, Sid)> = Vec::new();
            for k in 0..nt {
                if mark[k] == j as isize && allbbr[k] >= 2 {
                    let next = s2rt.len();
                    s2rt.entry(allsid[k]).or_insert(next);
                    if allbbr[k] > 2 && allsid[k] < allbbr[k] - 3 {
                        edges.push((allsid[k], allbbr[k] - 3));
                    }
                }
            }
            let mut rt = ReducedTree::new(s2rt)?;
            rt.reorder(&edges)?;
            rt_of[j] = rtrees.len() as isize;
            rtrees.push(rt);
        }

        // Non-principal pieces follow their mark to the elected host.
        for (mi, &e0) in entry_of_ms.iter().enumerate() {
            if ms.list[mi].style != BackboneStyle::Reduced {
                continue;
            }
            let jj = mark[own0 + e0];
            if jj >= 0 {
                let jj = jj as usize;
                ms.list[mi].rthost = rthost[jj];
                rthost[e0] = rthost[jj];
                rt_of[e0] = rt_of[jj];
            }
        }

        // Non-zero-area nodes coupled to a reduced tree: scale in place
        // when the tree is local, in the send buffer otherwise.
        let mut area2rt: Vec<Area2Rt> = Vec::new();
        let mut area2buf: Vec<Area2Buf> = Vec::new();
        {
            let mut i = 0usize;
            while i < n {
                if rthost[i] < 0 {
                    i += 1;
                    continue;
                }
                let two = bbr[i] > 2;
                let nd_count = if two { 2 } else { 1 };
                for j in 0..nd_count {
                    let node = inode[i + j];
                    if !nodes.has_area(node) {
                        continue;
                    }
                    if rthost[i] == me {
                        let mut slots: SmallVec<[InplaceSlot; 3]> = SmallVec::new();
                        slots.push(InplaceSlot::D(node));
                        slots.push(InplaceSlot::Rhs(node));
                        if two {
                            let bi = ms.list[vec2ms[i]]
                                .back_index
                                .expect("reduced backbone without back index");
                            slots.push(InplaceSlot::Fill(if j == 0 {
                                FillSlot::S1A(layout.back_a_index[bi])
                            } else {
                                FillSlot::S1B(layout.back_b_index[bi])
                            }));
                        }
                        area2rt.push(Area2Rt {
                            node,
                            slots,
                            adjust_rhs: 0.0,
                        });
                    } else {
                        area2buf.push(Area2Buf {
                            node,
                            ibuf: SmallVec::new(),
                            adjust_rhs: 0.0,
                        });
                    }
                }
                i += nd_count;
            }
        }

        // The five descriptor passes. Within each pass peers come in
        // ascending rank order; message layout is (D, RHS) pairs in
        // node order followed by any off-diagonal fills.
        let mut msti: Vec<TransferInfo> = Vec::new();
        let mut nodeindex: Vec<usize> = Vec::new();
        let mut send_area: Vec<AreaSlot> = Vec::new();
        let mut recv_area_short: Vec<AreaSlot> = Vec::new();
        let mut recv_area_long: Vec<AreaSlot> = Vec::new();
        let mut mdisp = 0usize;

        // Pass 1: local long ends coupled to remote short backbones.
        for i in 0..np {
            let k0 = nodeindex.len();
            for j in displ[i] as usize..displ[i + 1] as usize {
                if mark[j] >= 0 && bbr[mark[j] as usize] == 0 && allbbr[j] == 1 {
                    let node = inode[mark[j] as usize];
                    if nodes.has_area(node) {
                        send_area.push(AreaSlot {
                            buf: mdisp + 2 * (nodeindex.len() - k0),
                            node,
                        });
                    }
                    nodeindex.push(node);
                }
            }
            let b = nodeindex.len() - k0;
            if b > 0 {
                msti.push(TransferInfo {
                    host: i as Rank,
                    tag: tags::LONG_SHORT,
                    recv_role: RecvRole::ReplaceResult,
                    nodes: k0..nodeindex.len(),
                    offdiag: Vec::new(),
                    offdiag_nodes: Vec::new(),
                    size: 2 * b,
                    displ: mdisp,
                    rthost: -1,
                    pending: None,
                });
                mdisp += 2 * b;
            }
        }

        // Pass 2: this rank's pieces toward their remote reduced-tree
        // hosts, one descriptor per distinct host.
        let mut tmphost: Vec<Rank> = Vec::new();
        for j in own0..own0 + n {
            let j1 = mark[j];
            if j1 >= 0 && bbr[j1 as usize] >= 2 {
                let rth = rthost[j1 as usize];
                if rth != me && rth >= 0 && !tmphost.contains(&rth) {
                    tmphost.push(rth);
                }
            }
        }
        for &rth in &tmphost {
            let k0 = nodeindex.len();
            let mut offdiag: Vec<FillSlot> = Vec::new();
            let mut offdiag_nodes: Vec<usize> = Vec::new();
            let mut jj = 0usize;
            while jj < n {
                let j1 = mark[own0 + jj];
                if j1 >= 0 && bbr[j1 as usize] >= 2 && rthost[j1 as usize] == rth {
                    nodeindex.push(inode[jj]);
                    if bbr[jj] > 2 {
                        let bi = ms.list[vec2ms[jj]]
                            .back_index
                            .expect("reduced backbone without back index");
                        offdiag.push(FillSlot::S1A(layout.back_a_index[bi]));
                        offdiag.push(FillSlot::S1B(layout.back_b_index[bi]));
                        offdiag_nodes.push(inode[jj]);
                        offdiag_nodes.push(inode[jj + 1]);
                        jj += 1;
                        nodeindex.push(inode[jj]);
                    }
                }
                jj += 1;
            }
            let b = nodeindex.len() - k0;
            let br = offdiag.len();
            if b + br > 0 {
                msti.push(TransferInfo {
                    host: rth,
                    tag: tags::SUBTREE_REDUCED,
                    recv_role: RecvRole::ReplaceResult,
                    nodes: k0..nodeindex.len(),
                    offdiag,
                    offdiag_nodes,
                    size: 2 * b + br,
                    displ: mdisp,
                    rthost: rth,
                    pending: None,
                });
                mdisp += 2 * b + br;
            }
        }

        // Pass 3: long to long.
        for i in 0..np {
            let k0 = nodeindex.len();
            for j in displ[i] as usize..displ[i + 1] as usize {
                if mark[j] >= 0 && bbr[mark[j] as usize] == 0 && allbbr[j] == 0 {
                    let node = inode[mark[j] as usize];
                    if nodes.has_area(node) {
                        let buf = mdisp + 2 * (nodeindex.len() - k0);
                        send_area.push(AreaSlot { buf, node });
                        recv_area_long.push(AreaSlot { buf, node });
                    }
                    nodeindex.push(node);
                }
            }
            let b = nodeindex.len() - k0;
            if b > 0 {
                msti.push(TransferInfo {
                    host: i as Rank,
                    tag: tags::LONG_LONG,
                    recv_role: RecvRole::AddMatrix,
                    nodes: k0..nodeindex.len(),
                    offdiag: Vec::new(),
                    offdiag_nodes: Vec::new(),
                    size: 2 * b,
                    displ: mdisp,
                    rthost: -1,
                    pending: None,
                });
                mdisp += 2 * b;
            }
        }
        let ihost_reduced_long = msti.len();

        // Pass 4: remote pieces feeding reduced trees hosted here. The
        // receive map points straight into the buffer; the send map
        // fills the result slots sent back.
        for i in 0..np {
            if i as Rank == me {
                continue;
            }
            let range = displ[i] as usize..displ[i + 1] as usize;
            let mut b = 0usize;
            for j in range.clone() {
                let j1 = mark[j];
                if j1 >= 0 && allbbr[j] >= 2 && rthost[j1 as usize] == me {
                    let rt = &mut rtrees[rt_of[j1 as usize] as usize];
                    let ib = mdisp + 2 * b;
                    // Exchange order within a pair is d then rhs.
                    rt.fill_rhs(allsid[j], RtSrc::Recv(ib + 1));
                    rt.fill_d(allsid[j], RtSrc::Recv(ib));
                    rt.fill_smap(allsid[j], RtDst::Send(ib + 1), RtDst::Send(ib));
                    b += 1;
                }
            }
            let mut br = 0usize;
            let mut j = range.start;
            while j < range.end {
                let j1 = mark[j];
                if j1 >= 0 && allbbr[j] >= 2 && rthost[j1 as usize] == me && allbbr[j] > 2 {
                    let rt = &mut rtrees[rt_of[j1 as usize] as usize];
                    let ib = mdisp + 2 * b + br;
                    rt.fill_offdiag(allsid[j + 1], allsid[j], RtSrc::Recv(ib))?;
                    rt.fill_offdiag(allsid[j], allsid[j + 1], RtSrc::Recv(ib + 1))?;
                    br += 2;
                    j += 1;
                }
                j += 1;
            }
            if b + br > 0 {
                msti.push(TransferInfo {
                    host: i as Rank,
                    tag: tags::SUBTREE_REDUCED,
                    recv_role: RecvRole::ReducedInput,
                    nodes: nodeindex.len()..nodeindex.len(),
                    offdiag: Vec::new(),
                    offdiag_nodes: Vec::new(),
                    size: 2 * b + br,
                    displ: mdisp,
                    rthost: me,
                    pending: None,
                });
                mdisp += 2 * b + br;
            }
        }

        // Pass 5: local short backbones coupled to remote long ends.
        let ihost_short_long = msti.len();
        for i in 0..np {
            let k0 = nodeindex.len();
            for j in displ[i] as usize..displ[i + 1] as usize {
                if mark[j] >= 0 && bbr[mark[j] as usize] == 1 && allbbr[j] == 0 {
                    let node = inode[mark[j] as usize];
                    if nodes.has_area(node) {
                        recv_area_short.push(AreaSlot {
                            buf: mdisp + 2 * (nodeindex.len() - k0),
                            node,
                        });
                    }
                    nodeindex.push(node);
                }
            }
            let b = nodeindex.len() - k0;
            if b > 0 {
                msti.push(TransferInfo {
                    host: i as Rank,
                    tag: tags::LONG_SHORT,
                    recv_role: RecvRole::AddMatrix,
                    nodes: k0..nodeindex.len(),
                    offdiag: Vec::new(),
                    offdiag_nodes: Vec::new(),
                    size: 2 * b,
                    displ: mdisp,
                    rthost: -1,
                    pending: None,
                });
                mdisp += 2 * b;
            }
        }

        // Local pieces whose reduced tree lives here go straight into
        // the maps, no messages involved.
        let mut local_replaced: Vec<(usize, usize)> = Vec::new();
        for (mi, &e0) in entry_of_ms.iter().enumerate() {
            let rec = &ms.list[mi];
            if rec.style != BackboneStyle::Reduced || rec.rthost != me {
                continue;
            }
            let rt = &mut rtrees[rt_of[e0] as usize];
            let j0 = rec.nd[0].unwrap();
            rt.fill_rhs(rec.sid[0], RtSrc::NodeRhs(j0));
            rt.fill_d(rec.sid[0], RtSrc::NodeD(j0));
            rt.fill_smap(rec.sid[0], RtDst::NodeRhs(j0), RtDst::NodeD(j0));
            if let Some(j1) = rec.nd[1] {
                rt.fill_rhs(rec.sid[1], RtSrc::NodeRhs(j1));
                rt.fill_d(rec.sid[1], RtSrc::NodeD(j1));
                rt.fill_smap(rec.sid[1], RtDst::NodeRhs(j1), RtDst::NodeD(j1));
                let bi = rec.back_index.expect("reduced backbone without back index");
                let (ia, ib) = (layout.back_a_index[bi], layout.back_b_index[bi]);
                rt.fill_offdiag(rec.sid[1], rec.sid[0], RtSrc::S1A(ia))?;
                rt.fill_offdiag(rec.sid[0], rec.sid[1], RtSrc::S1B(ib))?;
                local_replaced.push((ia, ib));
            }
        }

        // Remote reduced contributions with non-zero area: locate their
        // slots inside the pass-2 messages.
        for mt in &msti {
            if mt.tag != tags::SUBTREE_REDUCED || mt.rthost == me {
                continue;
            }
            let nnode = mt.nodes.len();
            for (jj, &node) in nodeindex[mt.nodes.clone()].iter().enumerate() {
                if !nodes.has_area(node) {
                    continue;
                }
                let ab = area2buf
                    .iter_mut()
                    .find(|ab| ab.node == node)
                    .expect("area node missing from the reduced send list");
                ab.ibuf.push(mt.displ + 2 * jj);
                ab.ibuf.push(mt.displ + 2 * jj + 1);
                if let Some(ioff) = mt.offdiag_nodes.iter().position(|&x| x == node) {
                    ab.ibuf.push(mt.displ + 2 * nnode + ioff);
                }
            }
        }

        debug!(
            "multisplit exchange plan: {} descriptors ({} before results), {} reduced trees, {} buffer doubles",
            msti.len(),
            ihost_reduced_long,
            rtrees.len(),
            mdisp
        );
        Ok(MsSolver {
            msti,
            ihost_reduced_long,
            ihost_short_long,
            nodeindex,
            send_area,
            recv_area_short,
            recv_area_long,
            area2buf,
            area2rt,
            rtrees,
            local_replaced,
            trecv: vec![0.0; mdisp],
            tsend: vec![0.0; mdisp],
            splitcell_wait: 0.0,
            rtcomp_time: 0.0,
        })
    }

    /// Number of reduced trees hosted on this rank.
    pub fn nrtree(&self) -> usize {
        self.rtrees.len()
    }

    /// Ranks of the reduced trees hosted here.
    pub fn rtree_ranks(&self) -> Vec<usize> {
        self.rtrees.iter().map(|rt| rt.n).collect()
    }

    /// Replace a solved row's equation and retire its stale fills.
    fn replace_row(nodes: &mut Nodes, layout: &mut Layout, k: usize, d: f64, rhs: f64) {
        nodes.d[k] = d;
        nodes.rhs[k] = rhs;
        if layout.is_sid0(k) {
            layout.sid1a[k - layout.backbone_begin] = 0.0;
        }
        if layout.is_sid1(k) {
            layout.sid1b[k - layout.backbone_begin] = 0.0;
        }
    }

    /// One full matrix exchange: groups 1-3 out, reduced trees and
    /// short backbones solved in the middle, results back, everything
    /// folded into the long ends.
    pub fn exchange<C: Communicator>(
        &mut self,
        comm: &C,
        nodes: &mut Nodes,
        layout: &mut Layout,
    ) -> Result<()> {
        let wt = comm.wtime();
        let me = comm.rank();

        // Post every receive up front.
        for mt in &mut self.msti {
            let mut tag = mt.tag;
            if tag == tags::SUBTREE_REDUCED && me != mt.rthost {
                tag = tags::REDUCED_RESULT;
            }
            mt.pending = Some(comm.post_recv_doubles(mt.size, mt.host, tag));
        }

        // Marshal and send the long backbone information (groups 1-3).
        for mt in &self.msti[..self.ihost_reduced_long] {
            let mut j = mt.displ;
            for &k in &self.nodeindex[mt.nodes.clone()] {
                self.tsend[j] = nodes.d[k];
                self.tsend[j + 1] = nodes.rhs[k];
                j += 2;
            }
            for &slot in &mt.offdiag {
                self.tsend[j] = fill_value(layout, slot);
                j += 1;
            }
        }
        for s in &self.send_area {
            let afac = 0.01 * nodes.area[s.node];
            self.tsend[s.buf] *= afac;
            self.tsend[s.buf + 1] *= afac;
        }
        for ab in &self.area2buf {
            let afac = 0.01 * nodes.area[ab.node];
            for &ib in &ab.ibuf {
                self.tsend[ib] *= afac;
            }
        }
        for mt in &self.msti[..self.ihost_reduced_long] {
            comm.send_doubles(&self.tsend[mt.displ..mt.displ + mt.size], mt.host, mt.tag);
        }

        // Wait for what the reduced trees and short backbones need.
        for mt in &mut self.msti[self.ihost_reduced_long..] {
            let req = mt.pending.take().expect("receive not posted");
            comm.wait_into(req, &mut self.trecv[mt.displ..mt.displ + mt.size]);
        }

        let rt0 = comm.wtime();
        for s in &self.recv_area_short {
            let afac = 100.0 / nodes.area[s.node];
            self.trecv[s.buf] *= afac;
            self.trecv[s.buf + 1] *= afac;
        }
        // Local reduced contributions of non-zero-area nodes scale in
        // place; the scatter overwrites them afterwards.
        for ar in &self.area2rt {
            let afac = 0.01 * nodes.area[ar.node];
            for slot in &ar.slots {
                match *slot {
                    InplaceSlot::D(i) => nodes.d[i] *= afac,
                    InplaceSlot::Rhs(i) => nodes.rhs[i] *= afac,
                    InplaceSlot::Fill(FillSlot::S1A(i)) => layout.sid1a[i] *= afac,
                    InplaceSlot::Fill(FillSlot::S1B(i)) => layout.sid1b[i] *= afac,
                }
            }
        }

        // Solve every reduced tree hosted here.
        for rt in &mut self.rtrees {
            rt.gather(RtArenas {
                recv: &self.trecv,
                d: &nodes.d,
                rhs: &nodes.rhs,
                s1a: &layout.sid1a,
                s1b: &layout.sid1b,
            });
            rt.eliminate()?;
            rt.scatter(&mut RtArenasMut {
                send: &mut self.tsend,
                d: &mut nodes.d,
                rhs: &mut nodes.rhs,
            });
        }
        // Rows just replaced in place carry dead fills now.
        for &(ia, ib) in &self.local_replaced {
            layout.sid1a[ia] = 0.0;
            layout.sid1b[ib] = 0.0;
        }

        // Fold the long contributions into the short backbones and
        // solve their end pairs.
        for mt in &self.msti[self.ihost_short_long..] {
            let mut j = mt.displ;
            for &k in &self.nodeindex[mt.nodes.clone()] {
                nodes.d[k] += self.trecv[j];
                nodes.rhs[k] += self.trecv[j + 1];
                j += 2;
            }
        }
        bksub_short_backbone_part1(nodes, layout)?;
        self.rtcomp_time += comm.wtime() - rt0;

        // Marshal the short results; the reduced results are already in
        // place from the scatter. Results travel as 1 * v = rhs.
        for mt in &self.msti[self.ihost_short_long..] {
            let mut j = mt.displ;
            for &k in &self.nodeindex[mt.nodes.clone()] {
                self.tsend[j] = 1.0;
                self.tsend[j + 1] = nodes.rhs[k];
                j += 2;
            }
        }
        for mt in &self.msti[self.ihost_reduced_long..] {
            let mut tag = mt.tag;
            if tag == tags::SUBTREE_REDUCED {
                tag = tags::REDUCED_RESULT;
            }
            comm.send_doubles(&self.tsend[mt.displ..mt.displ + mt.size], mt.host, tag);
        }

        // Wait for everything the long ends are owed.
        for mt in &mut self.msti[..self.ihost_reduced_long] {
            let req = mt.pending.take().expect("receive not posted");
            comm.wait_into(req, &mut self.trecv[mt.displ..mt.displ + mt.size]);
        }
        for s in &self.recv_area_long {
            let afac = 100.0 / nodes.area[s.node];
            self.trecv[s.buf] *= afac;
            self.trecv[s.buf + 1] *= afac;
        }
        for mi in 0..self.ihost_reduced_long {
            let mt = &self.msti[mi];
            let mut j = mt.displ;
            match mt.recv_role {
                RecvRole::AddMatrix => {
                    for &k in &self.nodeindex[mt.nodes.clone()] {
                        nodes.d[k] += self.trecv[j];
                        nodes.rhs[k] += self.trecv[j + 1];
                        j += 2;
                    }
                }
                RecvRole::ReplaceResult => {
                    for &k in &self.nodeindex[mt.nodes.clone()] {
                        Self::replace_row(nodes, layout, k, self.trecv[j], self.trecv[j + 1]);
                        j += 2;
                    }
                }
                RecvRole::ReducedInput => unreachable!("reduced input before the result barrier"),
            }
        }

        self.splitcell_wait += comm.wtime() - wt;
        Ok(())
    }

    /// One full distributed factorisation and back-substitution.
    pub fn solve<C: Communicator>(
        &mut self,
        comm: &C,
        nodes: &mut Nodes,
        layout: &mut Layout,
    ) -> Result<()> {
        triang_subtree2backbone(nodes, layout)?;
        triang_backbone(nodes, layout)?;
        self.exchange(comm, nodes, layout)?;
        bksub_backbone(nodes, layout)?;
        bksub_subtrees(nodes, layout)?;
        Ok(())
    }

    /// The zero-capacitance exchange: same message pattern, no area
    /// scaling, every received value replaces the local one, and the
    /// reduced trees average instead of eliminating.
    fn exchange_nocap<C: Communicator>(
        &mut self,
        comm: &C,
        nodes: &mut Nodes,
        layout: &mut Layout,
    ) -> Result<()> {
        let wt = comm.wtime();
        let me = comm.rank();
        for mt in &mut self.msti {
            let mut tag = mt.tag;
            if tag == tags::SUBTREE_REDUCED && me != mt.rthost {
                tag = tags::REDUCED_RESULT;
            }
            mt.pending = Some(comm.post_recv_doubles(mt.size, mt.host, tag));
        }
        for mt in &self.msti[..self.ihost_reduced_long] {
            let mut j = mt.displ;
            for &k in &self.nodeindex[mt.nodes.clone()] {
                self.tsend[j] = nodes.d[k];
                self.tsend[j + 1] = nodes.rhs[k];
                j += 2;
            }
            for &slot in &mt.offdiag {
                self.tsend[j] = fill_value(layout, slot);
                j += 1;
            }
        }
        for mt in &self.msti[..self.ihost_reduced_long] {
            comm.send_doubles(&self.tsend[mt.displ..mt.displ + mt.size], mt.host, mt.tag);
        }
        for mt in &mut self.msti[self.ihost_reduced_long..] {
            let req = mt.pending.take().expect("receive not posted");
            comm.wait_into(req, &mut self.trecv[mt.displ..mt.displ + mt.size]);
        }

        let rt0 = comm.wtime();
        for rt in &mut self.rtrees {
            rt.gather_nocap(RtArenas {
                recv: &self.trecv,
                d: &nodes.d,
                rhs: &nodes.rhs,
                s1a: &layout.sid1a,
                s1b: &layout.sid1b,
            });
            rt.scatter_nocap(&mut RtArenasMut {
                send: &mut self.tsend,
                d: &mut nodes.d,
                rhs: &mut nodes.rhs,
            });
        }
        for mt in &self.msti[self.ihost_short_long..] {
            let mut j = mt.displ;
            for &k in &self.nodeindex[mt.nodes.clone()] {
                nodes.d[k] = self.trecv[j];
                nodes.rhs[k] = self.trecv[j + 1];
                j += 2;
            }
        }
        self.rtcomp_time += comm.wtime() - rt0;

        for mt in &self.msti[self.ihost_reduced_long..] {
            let mut tag = mt.tag;
            if tag == tags::SUBTREE_REDUCED {
                tag = tags::REDUCED_RESULT;
            }
            comm.send_doubles(&self.tsend[mt.displ..mt.displ + mt.size], mt.host, tag);
        }
        for mt in &mut self.msti[..self.ihost_reduced_long] {
            let req = mt.pending.take().expect("receive not posted");
            comm.wait_into(req, &mut self.trecv[mt.displ..mt.displ + mt.size]);
        }
        for mt in &self.msti[..self.ihost_reduced_long] {
            let mut j = mt.displ;
            for &k in &self.nodeindex[mt.nodes.clone()] {
                nodes.d[k] = self.trecv[j];
                nodes.rhs[k] = self.trecv[j + 1];
                j += 2;
            }
        }
        self.splitcell_wait += comm.wtime() - wt;
        Ok(())
    }

    /// Settle the voltages of sids whose nodes have no capacitance.
    ///
    /// Typically every node sharing a sid has zero area and the common
    /// voltage is just `sum RHS / sum D`. A non-zero-area node already
    /// knows its voltage; it is announced through the sentinel
    /// diagonal, passed through to the zero-area nodes, and the summed
    /// right-hand side of the others is kept for
    /// [`MsSolver::adjust_rhs`] to fold back after the caller has
    /// recomputed its own.
    pub fn nocap_v<C: Communicator>(
        &mut self,
        comm: &C,
        nodes: &mut Nodes,
        layout: &mut Layout,
    ) -> Result<()> {
        for ab in &self.area2buf {
            nodes.d[ab.node] = NOCAP_V_SENTINEL;
            nodes.rhs[ab.node] = nodes.v[ab.node] * NOCAP_V_SENTINEL;
        }
        for ar in &self.area2rt {
            nodes.d[ar.node] = NOCAP_V_SENTINEL;
            nodes.rhs[ar.node] = nodes.v[ar.node] * NOCAP_V_SENTINEL;
        }
        self.exchange_nocap(comm, nodes, layout)?;
        // Zero-area rows now hold 1 * v; non-zero-area rows hold the
        // sums of their zero-area partners.
        for ab in &mut self.area2buf {
            let j = ab.node;
            let afac = 100.0 / nodes.area[j];
            ab.adjust_rhs = (nodes.rhs[j] - nodes.d[j] * nodes.v[j]) * afac;
        }
        for ar in &mut self.area2rt {
            let j = ar.node;
            let afac = 100.0 / nodes.area[j];
            ar.adjust_rhs = (nodes.rhs[j] - nodes.d[j] * nodes.v[j]) * afac;
        }
        Ok(())
    }

    /// Fold the deferred zero-capacitance corrections into the freshly
    /// assembled right-hand side.
    pub fn adjust_rhs(&self, nodes: &mut Nodes) {
        for ab in &self.area2buf {
            nodes.rhs[ab.node] += ab.adjust_rhs;
        }
        for ar in &self.area2rt {
            nodes.rhs[ar.node] += ar.adjust_rhs;
        }
    }

    /// Agree on the smallest step bound across ranks; used to commit
    /// the exchange interval.
    pub fn min_interval<C: Communicator>(comm: &C, local: f64) -> f64 {
        comm.all_reduce_dbl(local, ReduceOp::Min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::serial_solve;
    use crate::cell::test_cable;
    use crate::transport::SelfComm;

    fn assemble(nodes: &mut Nodes) {
        for i in 0..nodes.len() {
            nodes.d[i] = 3.0 + 0.5 * i as f64;
            nodes.rhs[i] = 1.0 + 0.25 * i as f64;
            if nodes.parent[i].is_some() {
                nodes.a[i] = -1.0;
                nodes.b[i] = -1.0;
            }
        }
    }

    #[test]
    fn empty_setup_is_a_no_op() {
        let comm = SelfComm::new();
        let nodes = test_cable(3);
        let layout = Layout::default();
        let mut ms = MsList::default();
        let solver = MsSolver::setup(&comm, &nodes, &layout, &mut ms).unwrap();
        assert_eq!(solver.nrtree(), 0);
        assert!(solver.msti.is_empty());
    }

    #[test]
    fn single_rank_short_backbone_matches_serial() {
        // A short backbone whose sids both live here exercises the
        // mid-exchange 2x2 without any messages.
        let comm = SelfComm::new();
        let mut nodes = test_cable(6);
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 1, BackboneStyle::Short).unwrap();
        ms.add(&nodes, 5, 2, BackboneStyle::Short).unwrap();
        let mut layout = Layout::build(&mut nodes, &mut ms).unwrap();
        let mut solver = MsSolver::setup(&comm, &nodes, &layout, &mut ms).unwrap();

        assemble(&mut nodes);
        let mut reference = nodes.clone();
        serial_solve(&mut reference).unwrap();

        solver.solve(&comm, &mut nodes, &mut layout).unwrap();
        for i in 0..nodes.len() {
            let err = (nodes.rhs[i] - reference.rhs[i]).abs()
                / reference.rhs[i].abs().max(1e-300);
            assert!(err < 1e-10, "node {i}");
        }
    }

    #[test]
    fn nocap_passes_known_voltage_to_zero_area_partners() {
        // Two pieces of one cell share a sid on this rank; the first
        // piece's sid node has area, so its voltage is already known
        // and must replace the zero-area partner's equation, while the
        // partner's sums come back for the rhs adjustment.
        let comm = SelfComm::new();
        let parents = vec![None, None, Some(0), Some(1)];
        let mut area = vec![0.0; 4];
        area[0] = 200.0;
        let mut nodes = Nodes::new(parents, area).unwrap();
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 5, BackboneStyle::Reduced).unwrap();
        ms.add(&nodes, 1, 5, BackboneStyle::Reduced).unwrap();
        let mut layout = Layout::build(&mut nodes, &mut ms).unwrap();
        let mut solver = MsSolver::setup(&comm, &nodes, &layout, &mut ms).unwrap();
        assert_eq!(solver.nrtree(), 1);

        nodes.v[0] = -60.0;
        nodes.d[1] = 2.0;
        nodes.rhs[1] = 10.0;
        solver.nocap_v(&comm, &mut nodes, &mut layout).unwrap();

        // The zero-area partner now reads 1 * v = rhs.
        assert_eq!(nodes.rhs[1], -60.0);
        assert_eq!(nodes.d[1], 1.0);
        // The known-voltage node holds its partners' sums.
        assert_eq!(nodes.rhs[0], 10.0);
        assert_eq!(nodes.d[0], 2.0);
        // Deferred correction: (sum rhs - sum d * v) * 100 / area.
        nodes.rhs[0] = 7.0;
        solver.adjust_rhs(&mut nodes);
        assert_eq!(nodes.rhs[0], 7.0 + (10.0 - 2.0 * (-60.0)) * 0.5);
    }

    #[test]
    fn single_rank_reduced_tree_matches_serial() {
        // Both sids local and the reduced tree hosted here: gather,
        // eliminate and scatter all happen in place.
        let comm = SelfComm::new();
        let mut nodes = test_cable(6);
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 1, BackboneStyle::Reduced).unwrap();
        ms.add(&nodes, 5, 2, BackboneStyle::Reduced).unwrap();
        let mut layout = Layout::build(&mut nodes, &mut ms).unwrap();
        let mut solver = MsSolver::setup(&comm, &nodes, &layout, &mut ms).unwrap();
        assert_eq!(solver.nrtree(), 1);
        assert_eq!(ms.list[0].rthost, 0);

        assemble(&mut nodes);
        let mut reference = nodes.clone();
        serial_solve(&mut reference).unwrap();

        solver.solve(&comm, &mut nodes, &mut layout).unwrap();
        for i in 0..nodes.len() {
            let err = (nodes.rhs[i] - reference.rhs[i]).abs()
                / reference.rhs[i].abs().max(1e-300);
            assert!(err < 1e-10, "node {i}");
        }
    }
}
