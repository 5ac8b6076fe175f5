//! Reduced tree matrices
//!
//! When every backbone of a cell uses the exact style, numerical
//! stability stops being a concern: a dense tree matrix whose rank is
//! the number of distinct sids on the whole cell is assembled on one
//! designated rank each step, from the `D`, `RHS` and off-diagonal fill
//! contributions of every partial-tree piece, solved by ordinary tree
//! elimination, and the per-sid voltages are scattered back.
//!
//! The receive map addresses its sources and the send map its
//! destinations through `(arena, index)` slots into the named arenas
//! (node `D`/`RHS`, the `S1A`/`S1B` fill columns, the transfer
//! buffers), so rebuilding the topology invalidates nothing. Multiple
//! map entries addressing the same matrix element sum.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::Sid;

/// Root marker in the parent-row vector.
pub const NO_PARENT: usize = usize::MAX;

/// Sentinel diagonal announcing a known voltage in the
/// zero-capacitance path: `D = NOCAP_V_SENTINEL`, `RHS = v * NOCAP_V_SENTINEL`.
pub const NOCAP_V_SENTINEL: f64 = 1e50;

/// Source of one receive-map contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtSrc {
    /// Slot in the transfer receive buffer.
    Recv(usize),
    /// Diagonal of a local node.
    NodeD(usize),
    /// Right-hand side of a local node.
    NodeRhs(usize),
    /// Entry of the `S1A` fill arena.
    S1A(usize),
    /// Entry of the `S1B` fill arena.
    S1B(usize),
}

/// Destination of one send-map result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtDst {
    /// Slot in the transfer send buffer.
    Send(usize),
    /// Diagonal of a local node.
    NodeD(usize),
    /// Right-hand side of a local node.
    NodeRhs(usize),
}

/// Borrowed arenas the receive map reads from.
#[derive(Debug, Clone, Copy)]
pub struct RtArenas<'a> {
    /// The transfer receive buffer.
    pub recv: &'a [f64],
    /// Node diagonals.
    pub d: &'a [f64],
    /// Node right-hand sides.
    pub rhs: &'a [f64],
    /// The sid1 fill column.
    pub s1a: &'a [f64],
    /// The sid0 fill column.
    pub s1b: &'a [f64],
}

impl RtArenas<'_> {
    fn get(&self, src: RtSrc) -> f64 {
        match src {
            RtSrc::Recv(i) => self.recv[i],
            RtSrc::NodeD(i) => self.d[i],
            RtSrc::NodeRhs(i) => self.rhs[i],
            RtSrc::S1A(i) => self.s1a[i],
            RtSrc::S1B(i) => self.s1b[i],
        }
    }
}

/// Borrowed arenas the send map writes into.
#[derive(Debug)]
pub struct RtArenasMut<'a> {
    /// The transfer send buffer.
    pub send: &'a mut [f64],
    /// Node diagonals.
    pub d: &'a mut [f64],
    /// Node right-hand sides.
    pub rhs: &'a mut [f64],
}

impl RtArenasMut<'_> {
    fn set(&mut self, dst: RtDst, val: f64) {
        match dst {
            RtDst::Send(i) => self.send[i] = val,
            RtDst::NodeD(i) => self.d[i] = val,
            RtDst::NodeRhs(i) => self.rhs[i] = val,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RMapEntry {
    /// Flat index into the rhs|d|a|b quadrants.
    row: usize,
    src: RtSrc,
    /// Send-map cursor at fill time; pairs a node's contributions with
    /// its result slot in the zero-capacitance path.
    smap_at_fill: usize,
}

#[derive(Debug, Clone, Copy)]
struct SMapEntry {
    /// Row in the rhs quadrant.
    row: usize,
    rhs: RtDst,
    d: RtDst,
}

/// The dense tree matrix of one whole split cell.
#[derive(Debug)]
pub struct ReducedTree {
    /// Rank of the matrix: distinct sids on the cell.
    pub n: usize,
    /// Parent row of each row; [`NO_PARENT`] at the root.
    pub ip: Vec<usize>,
    /// rhs, d, a, b quadrants, each `n` long.
    m: Vec<f64>,
    rmap: Vec<RMapEntry>,
    smap: Vec<SMapEntry>,
    s2rt: HashMap<Sid, usize>,
    // Zero-capacitance scratch.
    nzindex: Vec<isize>,
    vsum: Vec<f64>,
}

impl ReducedTree {
    /// A reduced tree over the given sids, in discovery order; call
    /// [`ReducedTree::reorder`] before filling the maps.
    pub fn new(s2rt: HashMap<Sid, usize>) -> Result<ReducedTree> {
        let n = s2rt.len();
        if n == 0 {
            return Err(Error::invariant("reduced tree with no sids"));
        }
        Ok(ReducedTree {
            n,
            ip: vec![NO_PARENT; n],
            m: vec![0.0; 4 * n],
            rmap: Vec::new(),
            smap: Vec::new(),
            s2rt,
            nzindex: vec![-1; n],
            vsum: vec![0.0; n],
        })
    }

    /// Row index of a sid.
    pub fn row(&self, sid: Sid) -> Option<usize> {
        self.s2rt.get(&sid).copied()
    }

    /// Renumber the rows into tree order, `ip[i] < i` with row 0 the
    /// root, from the cell's sid edge list. A tree of `n` rows must
    /// come with exactly `n - 1` edges.
    ///
    /// Any node adjacent to an already-numbered node is promoted until
    /// all are numbered; quadratic in the worst case, which is fine for
    /// the handful of sids a cell carries.
    pub fn reorder(&mut self, edges: &[(Sid, Sid)]) -> Result<()> {
        if self.n == 1 {
            self.ip[0] = NO_PARENT;
            return Ok(());
        }
        if edges.len() != self.n - 1 {
            return Err(Error::invariant(format!(
                "reduced tree of rank {} with {} edges",
                self.n,
                edges.len()
            )));
        }
        let mut e1: Vec<isize> = Vec::with_capacity(edges.len());
        let mut e2: Vec<isize> = Vec::with_capacity(edges.len());
        let mut sid_of = vec![0 as Sid; self.n];
        for &(sa, sb) in edges {
            let ra = self.row(sa).ok_or_else(|| {
                Error::invariant(format!("edge sid {sa} unknown to the reduced tree"))
            })?;
            let rb = self.row(sb).ok_or_else(|| {
                Error::invariant(format!("edge sid {sb} unknown to the reduced tree"))
            })?;
            sid_of[ra] = sa;
            sid_of[rb] = sb;
            e1.push(ra as isize);
            e2.push(rb as isize);
        }
        // The single sid of a rank-1 tree never reaches here; make sure
        // isolated rows cannot hide behind a wrong edge list.
        let mut order = vec![-1isize; self.n];
        self.ip[0] = NO_PARENT;
        order[0] = 0;
        let mut ordered = 1usize;
        while ordered < self.n {
            let before = ordered;
            for k in 0..e1.len() {
                if e1[k] < 0 {
                    continue;
                }
                let (ra, rb) = (e1[k] as usize, e2[k] as usize);
                if order[ra] >= 0 {
                    if order[rb] >= 0 {
                        return Err(Error::invariant("cycle in reduced tree edges"));
                    }
                    self.ip[ordered] = order[ra] as usize;
                    order[rb] = ordered as isize;
                    ordered += 1;
                    e1[k] = -1;
                    e2[k] = -1;
                } else if order[rb] >= 0 {
                    self.ip[ordered] = order[rb] as usize;
                    order[ra] = ordered as isize;
                    ordered += 1;
                    e1[k] = -1;
                    e2[k] = -1;
                }
            }
            if ordered == before {
                return Err(Error::invariant(
                    "reduced tree reorder made no progress; edges do not form a tree",
                ));
            }
        }
        // Re-key the sid table to the new rows.
        for (row, &sid) in sid_of.iter().enumerate() {
            if let Some(new) = order.get(row).copied() {
                self.s2rt.insert(sid, new as usize);
            }
        }
        Ok(())
    }

    /// Map a right-hand-side contribution for `sid`.
    pub fn fill_rhs(&mut self, sid: Sid, src: RtSrc) {
        let i = self.s2rt[&sid];
        self.push_rmap(i, src);
    }

    /// Map a diagonal contribution for `sid`.
    pub fn fill_d(&mut self, sid: Sid, src: RtSrc) {
        let i = self.s2rt[&sid];
        self.push_rmap(i + self.n, src);
    }

    /// Map an off-diagonal contribution coupling `row_sid` to
    /// `col_sid`; lands in the `a` or `b` quadrant depending on which
    /// row is the tree child.
    pub fn fill_offdiag(&mut self, row_sid: Sid, col_sid: Sid, src: RtSrc) -> Result<()> {
        let i = self.s2rt[&row_sid];
        let j = self.s2rt[&col_sid];
        let row = if self.ip[i] == j {
            i + 2 * self.n
        } else if self.ip[j] == i {
            j + 3 * self.n
        } else {
            return Err(Error::invariant(format!(
                "sids {row_sid} and {col_sid} are not adjacent in the reduced tree"
            )));
        };
        self.push_rmap(row, src);
        Ok(())
    }

    fn push_rmap(&mut self, row: usize, src: RtSrc) {
        self.rmap.push(RMapEntry {
            row,
            src,
            smap_at_fill: self.smap.len(),
        });
    }

    /// Map where the solved `RHS` and `D` of `sid` go.
    pub fn fill_smap(&mut self, sid: Sid, rhs: RtDst, d: RtDst) {
        let row = self.s2rt[&sid];
        self.smap.push(SMapEntry { row, rhs, d });
    }

    /// Sum every mapped source into the matrix.
    pub fn gather(&mut self, arenas: RtArenas<'_>) {
        self.m.iter_mut().for_each(|x| *x = 0.0);
        for e in &self.rmap {
            self.m[e.row] += arenas.get(e.src);
        }
    }

    /// Write each sid's result through the send map. The receiving
    /// equation is replaced outright, so the diagonal travels as 1.
    pub fn scatter(&self, out: &mut RtArenasMut<'_>) {
        for e in &self.smap {
            out.set(e.rhs, self.m[e.row]);
            out.set(e.d, 1.0);
        }
    }

    /// Tree elimination and back-substitution over the gathered matrix.
    pub fn eliminate(&mut self) -> Result<()> {
        let n = self.n;
        let (rhs, rest) = self.m.split_at_mut(n);
        let (d, rest) = rest.split_at_mut(n);
        let (a, b) = rest.split_at_mut(n);
        for i in (1..n).rev() {
            if d[i] == 0.0 {
                return Err(Error::singular(format!("reduced tree row {i}")));
            }
            let p = a[i] / d[i];
            let ip = self.ip[i];
            d[ip] -= p * b[i];
            rhs[ip] -= p * rhs[i];
        }
        if d[0] == 0.0 {
            return Err(Error::singular("reduced tree root".to_string()));
        }
        rhs[0] /= d[0];
        for i in 1..n {
            rhs[i] -= b[i] * rhs[self.ip[i]];
            rhs[i] /= d[i];
        }
        Ok(())
    }

    /// Gather, eliminate, back-substitute and scatter in one call, for
    /// callers whose arenas do not alias.
    pub fn solve(&mut self, arenas: RtArenas<'_>, out: &mut RtArenasMut<'_>) -> Result<()> {
        self.gather(arenas);
        self.eliminate()?;
        self.scatter(out);
        Ok(())
    }

    /// The zero-capacitance path.
    ///
    /// Contributions from zero-area nodes arrive as plain `(rhs, d)`;
    /// a non-zero-area node announces its already-known voltage with
    /// the [`NOCAP_V_SENTINEL`] diagonal. Per row: with no non-zero-area
    /// node the answer is `sum rhs / sum d`, delivered as the sums with
    /// the receiver dividing; with one, the zero-area nodes receive
    /// `(v, 1)` and the non-zero-area node receives the sums so the
    /// caller can adjust its right-hand side.
    pub fn gather_nocap(&mut self, arenas: RtArenas<'_>) {
        let n = self.n;
        for i in 0..n {
            self.m[i] = 0.0;
            self.m[i + n] = 0.0;
            self.nzindex[i] = -1;
        }
        // The receive map interleaves (rhs, d) pairs; off-diagonal
        // pairs land past the first quadrant and are ignored here.
        let mut k = 0;
        while k + 1 < self.rmap.len() {
            let (er, ed) = (self.rmap[k], self.rmap[k + 1]);
            k += 2;
            if er.row >= n {
                continue;
            }
            let j = er.row;
            let dval = arenas.get(ed.src);
            if dval == NOCAP_V_SENTINEL {
                self.vsum[j] = arenas.get(er.src) / NOCAP_V_SENTINEL;
                self.nzindex[j] = er.smap_at_fill as isize;
            } else {
                self.m[j] += arenas.get(er.src);
                self.m[j + n] += dval;
            }
        }
    }

    /// Distribute the zero-capacitance answers through the send map.
    pub fn scatter_nocap(&self, out: &mut RtArenasMut<'_>) {
        let n = self.n;
        for (si, e) in self.smap.iter().enumerate() {
            let j = e.row;
            if self.nzindex[j] == -1 || si as isize == self.nzindex[j] {
                out.set(e.rhs, self.m[j]);
                out.set(e.d, self.m[j + n]);
            } else {
                out.set(e.rhs, self.vsum[j]);
                out.set(e.d, 1.0);
            }
        }
    }

    /// [`ReducedTree::gather_nocap`] and [`ReducedTree::scatter_nocap`]
    /// in one call, for callers whose arenas do not alias.
    pub fn nocap(&mut self, arenas: RtArenas<'_>, out: &mut RtArenasMut<'_>) {
        self.gather_nocap(arenas);
        self.scatter_nocap(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree3() -> ReducedTree {
        // sids 10, 20, 30 in a chain 10 - 20 - 30.
        let mut s2rt = HashMap::new();
        s2rt.insert(10, 0);
        s2rt.insert(20, 1);
        s2rt.insert(30, 2);
        let mut rt = ReducedTree::new(s2rt).unwrap();
        rt.reorder(&[(20, 10), (30, 20)]).unwrap();
        rt
    }

    #[test]
    fn reorder_produces_tree_order() {
        let rt = tree3();
        assert_eq!(rt.ip[0], NO_PARENT);
        for i in 1..rt.n {
            assert!(rt.ip[i] < i);
        }
    }

    #[test]
    fn reorder_rejects_disconnected_edges() {
        let mut s2rt = HashMap::new();
        for (i, sid) in [1, 2, 3, 4].iter().enumerate() {
            s2rt.insert(*sid, i);
        }
        let mut rt = ReducedTree::new(s2rt).unwrap();
        // 3-4 never touches the component containing the root.
        let err = rt.reorder(&[(1, 2), (3, 4), (3, 4)]).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn chain_solve_matches_dense_elimination() {
        let mut rt = tree3();
        // Assemble  [ 2 -1  0 ] x = [1]
        //           [-1  2 -1 ]     [2]
        //           [ 0 -1  2 ]     [3]
        // through the receive map, summing split contributions.
        let recv = vec![
            2.0, 1.0, // d, rhs row of sid 10
            1.0, 1.0, // split d and rhs contributions for sid 20
            1.0, 1.0, 2.0, 3.0, // rest of sid 20, then sid 30
            -1.0, -1.0, -1.0, -1.0, // couplings
        ];
        rt.fill_rhs(10, RtSrc::Recv(1));
        rt.fill_d(10, RtSrc::Recv(0));
        rt.fill_smap(10, RtDst::Send(0), RtDst::Send(1));
        rt.fill_rhs(20, RtSrc::Recv(3));
        rt.fill_d(20, RtSrc::Recv(2));
        rt.fill_rhs(20, RtSrc::Recv(5));
        rt.fill_d(20, RtSrc::Recv(4));
        rt.fill_smap(20, RtDst::Send(2), RtDst::Send(3));
        rt.fill_rhs(30, RtSrc::Recv(7));
        rt.fill_d(30, RtSrc::Recv(6));
        rt.fill_smap(30, RtDst::Send(4), RtDst::Send(5));
        rt.fill_offdiag(20, 10, RtSrc::Recv(8)).unwrap();
        rt.fill_offdiag(10, 20, RtSrc::Recv(9)).unwrap();
        rt.fill_offdiag(30, 20, RtSrc::Recv(10)).unwrap();
        rt.fill_offdiag(20, 30, RtSrc::Recv(11)).unwrap();

        let mut send = vec![0.0; 6];
        let mut d = vec![];
        let mut rhs = vec![];
        let mut out = RtArenasMut {
            send: &mut send,
            d: &mut d,
            rhs: &mut rhs,
        };
        rt.solve(
            RtArenas {
                recv: &recv,
                d: &[],
                rhs: &[],
                s1a: &[],
                s1b: &[],
            },
            &mut out,
        )
        .unwrap();
        // Exact solution of the dense system: x = [2.5, 4, 3.5].
        assert!((send[0] - 2.5).abs() < 1e-12);
        assert!((send[2] - 4.0).abs() < 1e-12);
        assert!((send[4] - 3.5).abs() < 1e-12);
        // Diagonals travel as 1 so the receiver replaces its equation.
        assert_eq!(send[1], 1.0);
    }

    #[test]
    fn nocap_averages_and_passes_known_voltage_through() {
        let mut s2rt = HashMap::new();
        s2rt.insert(5, 0);
        let mut rt = ReducedTree::new(s2rt).unwrap();
        rt.reorder(&[]).unwrap();
        // Two zero-area contributions and one known-voltage node.
        let recv = vec![
            3.0, 6.0, // d=3, rhs=6 from one zero-area piece
            1.0, 2.0, // d=1, rhs=2 from another
            NOCAP_V_SENTINEL,
            0.75 * NOCAP_V_SENTINEL, // v = 0.75 announced
        ];
        rt.fill_rhs(5, RtSrc::Recv(1));
        rt.fill_d(5, RtSrc::Recv(0));
        rt.fill_smap(5, RtDst::Send(0), RtDst::Send(1));
        rt.fill_rhs(5, RtSrc::Recv(3));
        rt.fill_d(5, RtSrc::Recv(2));
        rt.fill_smap(5, RtDst::Send(2), RtDst::Send(3));
        rt.fill_rhs(5, RtSrc::Recv(5));
        rt.fill_d(5, RtSrc::Recv(4));
        rt.fill_smap(5, RtDst::Send(4), RtDst::Send(5));

        let mut send = vec![0.0; 6];
        let mut out = RtArenasMut {
            send: &mut send,
            d: &mut [],
            rhs: &mut [],
        };
        rt.nocap(
            RtArenas {
                recv: &recv,
                d: &[],
                rhs: &[],
                s1a: &[],
                s1b: &[],
            },
            &mut out,
        );
        // Zero-area slots get the known voltage with a unit diagonal.
        assert_eq!(send[0], 0.75);
        assert_eq!(send[1], 1.0);
        assert_eq!(send[2], 0.75);
        // The non-zero-area node gets the sums for its rhs adjustment.
        assert_eq!(send[4], 8.0);
        assert_eq!(send[5], 4.0);
    }
}
