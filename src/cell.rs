//! Cell topology and multi-split node ordering
//!
//! Any number of nodes may carry the same `sid`, generally on different
//! ranks. A node cannot have more than one `sid`, and a tree cannot
//! have more than two `sid` nodes.
//!
//! The node vector is reordered at setup so the distributed elimination
//! can address whole index ranges instead of chasing the tree:
//!
//! 1. all roots of cells with zero or one `sid` (no backbone involved),
//! 2. all `sid0` nodes of two-sid cells, short-style backbones first,
//! 3. the interior backbone nodes,
//! 4. all `sid1` nodes, again short first,
//! 5. all remaining subtree nodes.
//!
//! Six fence indices delimit the groups. After the reorder every
//! non-root node has `parent(i) < i`.
//!
//! Re-rooting: the first `sid` of a cell becomes the root with respect
//! to the solver parent vector. When it is not the classical root, the
//! parent chain from the `sid` back to the classical root is reversed
//! in place, so a split point in the middle of a section can anchor a
//! piece. The classical parent vector is left intact; mechanisms keep
//! writing their couplings through [`Nodes::classical_a`] and
//! [`Nodes::classical_b`], which resolve the flipped edges.

use std::collections::HashMap;

use log::debug;

use crate::error::{Error, Result};
use crate::{Rank, Sid};

/// How a two-sid backbone is eliminated and exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneStyle {
    /// Filled-column N-matrix elimination; stable for electrically long
    /// segments.
    Long,
    /// Compressed to a 2x2 at the ends and solved analytically before
    /// the result exchange; stable for electrically short segments.
    Short,
    /// Exact: all sids of the whole cell gathered into a dense reduced
    /// tree on a designated rank.
    Reduced,
}

/// One row of the tridiagonal Hines matrix per compartment, plus the
/// tree structure.
#[derive(Debug, Clone, Default)]
pub struct Nodes {
    /// Off-diagonal toward the solver parent.
    pub a: Vec<f64>,
    /// Off-diagonal toward the child.
    pub b: Vec<f64>,
    /// Diagonal.
    pub d: Vec<f64>,
    /// Right-hand side.
    pub rhs: Vec<f64>,
    /// Membrane potential, needed by the zero-capacitance path.
    pub v: Vec<f64>,
    /// Segment area; zero for point nodes exempt from area scaling.
    pub area: Vec<f64>,
    /// Solver parent, re-rooted and permuted by the layout build.
    pub parent: Vec<Option<usize>>,
    /// The classical tree, invariant under re-rooting.
    pub classical_parent: Vec<Option<usize>>,
    /// Number of classical roots; they occupy the lowest indices.
    pub rootnode_count: usize,
}

/// Where a classical coupling coefficient lives after re-rooting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingSlot {
    /// The `a` entry of the given node.
    A(usize),
    /// The `b` entry of the given node.
    B(usize),
}

impl Nodes {
    /// Build node storage from a classical parent forest. Roots must
    /// occupy the lowest indices and every parent index must be smaller
    /// than its child.
    pub fn new(classical_parent: Vec<Option<usize>>, area: Vec<f64>) -> Result<Nodes> {
        let n = classical_parent.len();
        if area.len() != n {
            return Err(Error::config("area and parent vectors differ in length"));
        }
        let rootnode_count = classical_parent.iter().take_while(|p| p.is_none()).count();
        for (i, p) in classical_parent.iter().enumerate() {
            match p {
                None if i >= rootnode_count => {
                    return Err(Error::config(format!("root {i} after the first non-root")));
                }
                Some(p) if *p >= i => {
                    return Err(Error::config(format!("parent {p} not before node {i}")));
                }
                _ => {}
            }
        }
        Ok(Nodes {
            a: vec![0.0; n],
            b: vec![0.0; n],
            d: vec![0.0; n],
            rhs: vec![0.0; n],
            v: vec![0.0; n],
            area,
            parent: classical_parent.clone(),
            classical_parent,
            rootnode_count,
        })
    }

    /// Number of compartments.
    pub fn len(&self) -> usize {
        self.d.len()
    }

    /// Whether the matrix is empty.
    pub fn is_empty(&self) -> bool {
        self.d.is_empty()
    }

    /// Non-zero-area nodes take part in area scaling during transfer.
    pub fn has_area(&self, i: usize) -> bool {
        self.area[i] > 0.0
    }

    /// The classical root above `i`.
    pub fn classical_root(&self, mut i: usize) -> usize {
        while let Some(p) = self.classical_parent[i] {
            i = p;
        }
        i
    }

    /// Slot holding the classical `a` coupling of node `i`, or `None`
    /// for a classical root.
    pub fn classical_a(&self, i: usize) -> Option<CouplingSlot> {
        let pnd = self.classical_parent[i]?;
        if self.parent[i] == Some(pnd) {
            Some(CouplingSlot::A(i))
        } else if self.parent[pnd] == Some(i) {
            Some(CouplingSlot::B(pnd))
        } else {
            unreachable!("classical edge lost by reordering")
        }
    }

    /// Slot holding the classical `b` coupling of node `i`, or `None`
    /// for a classical root.
    pub fn classical_b(&self, i: usize) -> Option<CouplingSlot> {
        let pnd = self.classical_parent[i]?;
        if self.parent[i] == Some(pnd) {
            Some(CouplingSlot::B(i))
        } else if self.parent[pnd] == Some(i) {
            Some(CouplingSlot::A(pnd))
        } else {
            unreachable!("classical edge lost by reordering")
        }
    }

    /// Mutable access to a coupling slot.
    pub fn coupling_mut(&mut self, slot: CouplingSlot) -> &mut f64 {
        match slot {
            CouplingSlot::A(i) => &mut self.a[i],
            CouplingSlot::B(i) => &mut self.b[i],
        }
    }
}

/// One `multisplit(x, sid, style)` directive pair recorded against a
/// cell.
#[derive(Debug, Clone)]
pub struct MultiSplit {
    /// The one or two split nodes, in declaration order.
    pub nd: [Option<usize>; 2],
    /// Their sids; `sid[1]` is meaningless while `nd[1]` is `None`.
    pub sid: [Sid; 2],
    /// Elimination style of the backbone between the two sids.
    pub style: BackboneStyle,
    /// Rank that solves this cell's reduced tree; -1 until elected.
    pub rthost: Rank,
    /// Index into the reduced-tree backbone tables, set by the layout
    /// build for style 2 backbones.
    pub back_index: Option<usize>,
}

/// The recorded directives of this rank, in declaration order.
#[derive(Debug, Default)]
pub struct MsList {
    /// Directive records, one per cell with at least one split.
    pub list: Vec<MultiSplit>,
    /// Classical root node to index in `list`.
    root_index: HashMap<usize, usize>,
}

impl MsList {
    /// Record a split directive for the cell containing `node`.
    pub fn add(
        &mut self,
        nodes: &Nodes,
        node: usize,
        sid: Sid,
        style: BackboneStyle,
    ) -> Result<()> {
        let root = nodes.classical_root(node);
        if let Some(&i) = self.root_index.get(&root) {
            let ms = &mut self.list[i];
            match style {
                BackboneStyle::Reduced => {
                    if ms.style != BackboneStyle::Reduced {
                        return Err(Error::config(
                            "earlier split for this cell did not use the reduced-tree style",
                        ));
                    }
                }
                BackboneStyle::Short => ms.style = BackboneStyle::Short,
                BackboneStyle::Long => {}
            }
            if ms.nd[0] == Some(node) {
                return Err(Error::config(format!(
                    "two sids at the same point on the tree rooted at {root}"
                )));
            }
            if sid == ms.sid[0] {
                return Err(Error::config(format!(
                    "two sid = {sid} on the tree rooted at {root}"
                )));
            }
            ms.nd[1] = Some(node);
            ms.sid[1] = sid;
        } else {
            self.root_index.insert(root, self.list.len());
            self.list.push(MultiSplit {
                nd: [Some(node), None],
                sid: [sid, -1],
                style,
                rthost: -1,
                back_index: None,
            });
        }
        Ok(())
    }

    /// Whether any directive has been recorded.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn by_root(&self, root: usize) -> Option<usize> {
        self.root_index.get(&root).copied()
    }
}

/// The reordered node numbering and the backbone fill arenas.
#[derive(Debug, Default)]
pub struct Layout {
    /// First `sid0` node; short backbones start here.
    pub backbone_begin: usize,
    /// First long-style `sid0` node.
    pub backbone_long_begin: usize,
    /// First interior backbone node.
    pub backbone_interior_begin: usize,
    /// First `sid1` node; short backbones first.
    pub backbone_sid1_begin: usize,
    /// First long-style `sid1` node.
    pub backbone_long_sid1_begin: usize,
    /// One past the last backbone node.
    pub backbone_end: usize,
    /// Fill in the `sid1` column during forward elimination, indexed by
    /// `node - backbone_begin`.
    pub sid1a: Vec<f64>,
    /// Fill in the `sid0` column, same indexing.
    pub sid1b: Vec<f64>,
    /// Interior node to the `sid0` row of its backbone.
    pub sid0i: Vec<Option<usize>>,
    /// Per reduced-tree backbone: its `sid0`.
    pub backsid: Vec<Sid>,
    /// Per reduced-tree backbone: arena index of the `sid0` row fill.
    pub back_a_index: Vec<usize>,
    /// Per reduced-tree backbone: arena index of the `sid1` row fill.
    pub back_b_index: Vec<usize>,
    /// New index to classical index, for restoring classical order.
    pub perm: Vec<usize>,
}

impl Layout {
    /// Backbone node count, the length of the fill arenas.
    pub fn nback(&self) -> usize {
        self.backbone_end - self.backbone_begin
    }

    /// Whether `i` is a `sid0` row.
    pub fn is_sid0(&self, i: usize) -> bool {
        i >= self.backbone_begin && i < self.backbone_interior_begin
    }

    /// Whether `i` is a `sid1` row.
    pub fn is_sid1(&self, i: usize) -> bool {
        i >= self.backbone_sid1_begin && i < self.backbone_end
    }

    /// Undo the reorder, returning the matrix to classical order with
    /// classical parents. Directive node indices revert with it.
    pub fn restore_classical(&self, nodes: &mut Nodes, ms: &mut MsList) {
        let n = nodes.len();
        debug_assert_eq!(self.perm.len(), n);
        let mut restore = |arr: &mut Vec<f64>| {
            let mut old = vec![0.0; n];
            for (newi, &oldi) in self.perm.iter().enumerate() {
                old[oldi] = arr[newi];
            }
            *arr = old;
        };
        restore(&mut nodes.a);
        restore(&mut nodes.b);
        restore(&mut nodes.d);
        restore(&mut nodes.rhs);
        restore(&mut nodes.v);
        restore(&mut nodes.area);
        let mut cp = vec![None; n];
        for (newi, &oldi) in self.perm.iter().enumerate() {
            cp[oldi] = nodes.classical_parent[newi].map(|x| self.perm[x]);
        }
        nodes.classical_parent = cp;
        nodes.parent = nodes.classical_parent.clone();
        for msrec in &mut ms.list {
            for nd in msrec.nd.iter_mut().flatten() {
                *nd = self.perm[*nd];
            }
            msrec.back_index = None;
        }
    }

    /// Reorder the node vector for the backbone solver.
    ///
    /// `nodes` must be in classical order (as produced by
    /// [`Nodes::new`] or [`Layout::restore_classical`]). Directive node
    /// indices in `ms` are rewritten to the new numbering.
    pub fn build(nodes: &mut Nodes, ms: &mut MsList) -> Result<Layout> {
        let n = nodes.len();
        let r = nodes.rootnode_count;

        // Styles with a single recorded sid degrade to long; a short
        // backbone needs both ends.
        for rec in &mut ms.list {
            if rec.style == BackboneStyle::Short && rec.nd[1].is_none() {
                rec.style = BackboneStyle::Long;
            }
        }

        let mut backbone_begin = r;
        let mut backbone_long_begin = r;
        let mut nbackrt = 0usize;
        for rec in &ms.list {
            if rec.nd[1].is_some() {
                backbone_begin -= 1;
                if rec.style != BackboneStyle::Short {
                    backbone_long_begin -= 1;
                }
                if rec.style == BackboneStyle::Reduced {
                    nbackrt += 1;
                }
            }
        }
        let backbone_interior_begin = r;

        // Re-root each split cell so sid0 is the root with respect to
        // the solver parent vector, reversing the chain back to the
        // classical root where needed.
        for i in 0..r {
            if let Some(msi) = ms.by_root(i) {
                let nd0 = ms.list[msi].nd[0].expect("directive without a first node");
                if nd0 == i {
                    nodes.parent[i] = None;
                } else {
                    let mut cur = nd0;
                    let mut prev: Option<usize> = None;
                    while cur > i {
                        let up = nodes.parent[cur].expect("chain left the tree");
                        nodes.parent[cur] = prev;
                        prev = Some(cur);
                        cur = up;
                    }
                    nodes.parent[cur] = prev;
                }
            }
        }

        // First placement pass: plain roots and sid0 nodes, counting
        // the backbone interior as we go.
        let mut new_nodes = vec![usize::MAX; n];
        let mut new_parent_old: Vec<Option<usize>> = vec![None; n];
        let mut backbone_end = r;
        let mut i1 = 0usize;
        let mut ibs = backbone_begin;
        let mut ibl = backbone_long_begin;
        for i in 0..r {
            match ms.by_root(i) {
                Some(msi) if ms.list[msi].nd[1].is_some() => {
                    let rec = &ms.list[msi];
                    let short = rec.style == BackboneStyle::Short;
                    let ib = if short { &mut ibs } else { &mut ibl };
                    new_nodes[*ib] = rec.nd[0].unwrap();
                    *ib += 1;
                    let i0 = rec.nd[0].unwrap();
                    let mut i2 = rec.nd[1].unwrap();
                    while i0 != i2 {
                        i2 = nodes.parent[i2].expect("sid1 not under sid0 after re-rooting");
                        backbone_end += 1;
                    }
                }
                Some(msi) => {
                    new_nodes[i1] = ms.list[msi].nd[0].unwrap();
                    i1 += 1;
                }
                None => {
                    new_nodes[i1] = i;
                    i1 += 1;
                }
            }
        }
        debug_assert_eq!(i1, backbone_begin);
        let backbone_sid1_begin = backbone_end - (backbone_interior_begin - backbone_begin);
        let backbone_long_sid1_begin =
            backbone_sid1_begin + (backbone_long_begin - backbone_begin);

        let nback = backbone_end - backbone_begin;
        let sid1a = vec![0.0; nback];
        let sid1b = vec![0.0; nback];
        let mut sid0i: Vec<Option<usize>> = vec![None; nback];
        let mut backsid = vec![0 as Sid; nbackrt];
        let mut back_a_index = vec![0usize; nbackrt];
        let mut back_b_index = vec![0usize; nbackrt];

        // Second placement pass: sid1 nodes in the same order as their
        // sid0 partners, interior nodes walked from sid1 toward the
        // root, filling descending from backbone_sid1_begin.
        let mut iss0 = backbone_begin;
        let mut iss1 = backbone_sid1_begin;
        let mut isl0 = backbone_long_begin;
        let mut isl1 = backbone_long_sid1_begin;
        let mut ib = backbone_sid1_begin;
        let mut ibrt = 0usize;
        for i in 0..r {
            let Some(msi) = ms.by_root(i) else { continue };
            let Some(nd1) = ms.list[msi].nd[1] else {
                continue;
            };
            let rec = &mut ms.list[msi];
            let short = rec.style == BackboneStyle::Short;
            let (is0, is1) = if short {
                iss0 += 1;
                iss1 += 1;
                (iss0 - 1, iss1 - 1)
            } else {
                isl0 += 1;
                isl1 += 1;
                (isl0 - 1, isl1 - 1)
            };
            let i0 = rec.nd[0].unwrap();
            new_nodes[is1] = nd1;
            new_parent_old[is1] = nodes.parent[nd1];
            let mut cur = nodes.parent[nd1].expect("sid1 is a root");
            while i0 != cur {
                ib -= 1;
                new_nodes[ib] = cur;
                new_parent_old[ib] = nodes.parent[cur];
                sid0i[ib - backbone_begin] = Some(is0);
                cur = nodes.parent[cur].expect("backbone walk left the tree");
            }
            if rec.style == BackboneStyle::Reduced {
                backsid[ibrt] = rec.sid[0];
                rec.back_index = Some(ibrt);
                back_a_index[ibrt] = is0 - backbone_begin;
                back_b_index[ibrt] = is1 - backbone_begin;
                ibrt += 1;
            }
        }

        // Relocate the remaining nodes. Most are already in tree order,
        // but re-rooting may have produced chains whose parent index
        // exceeds the node index; each unnumbered chain is placed so
        // ancestors come first.
        let mut eqn_index = vec![-1isize; n];
        for (newi, &oldi) in new_nodes.iter().enumerate().take(backbone_end) {
            eqn_index[oldi] = newi as isize;
        }
        let mut j = backbone_end;
        for i in 0..n {
            let mut k0 = 0usize;
            let mut k1 = i;
            while eqn_index[k1] < 0 {
                k0 += 1;
                match nodes.parent[k1] {
                    None => break,
                    Some(p) => k1 = p,
                }
            }
            if k0 == 0 {
                continue;
            }
            k1 = i;
            j += k0;
            let mut kpos = (j - 1) as isize;
            while eqn_index[k1] < 0 {
                new_nodes[kpos as usize] = k1;
                new_parent_old[kpos as usize] = nodes.parent[k1];
                eqn_index[k1] = kpos;
                kpos -= 1;
                match nodes.parent[k1] {
                    None => break,
                    Some(p) => k1 = p,
                }
            }
        }
        if j != n {
            return Err(Error::invariant(format!(
                "node relocation placed {j} of {n} nodes"
            )));
        }

        // Apply the permutation to the per-node arrays and rebuild the
        // parent vectors in the new numbering.
        let apply = |arr: &Vec<f64>| -> Vec<f64> {
            new_nodes.iter().map(|&oldi| arr[oldi]).collect()
        };
        nodes.a = apply(&nodes.a);
        nodes.b = apply(&nodes.b);
        nodes.d = apply(&nodes.d);
        nodes.rhs = apply(&nodes.rhs);
        nodes.v = apply(&nodes.v);
        nodes.area = apply(&nodes.area);
        let remap = |p: Option<usize>| p.map(|old| eqn_index[old] as usize);
        nodes.parent = new_parent_old.iter().map(|&p| remap(p)).collect();
        nodes.classical_parent = new_nodes
            .iter()
            .map(|&oldi| remap(nodes.classical_parent[oldi]))
            .collect();
        for rec in &mut ms.list {
            for nd in rec.nd.iter_mut().flatten() {
                *nd = eqn_index[*nd] as usize;
            }
        }

        for (i, p) in nodes.parent.iter().enumerate() {
            if let Some(p) = p {
                if *p >= i {
                    return Err(Error::invariant(format!(
                        "parent {p} not before node {i} after reorder"
                    )));
                }
            }
        }

        debug!(
            "multisplit layout: fences {} {} {} {} {} {}, {} reduced backbones",
            backbone_begin,
            backbone_long_begin,
            backbone_interior_begin,
            backbone_sid1_begin,
            backbone_long_sid1_begin,
            backbone_end,
            nbackrt
        );
        Ok(Layout {
            backbone_begin,
            backbone_long_begin,
            backbone_interior_begin,
            backbone_sid1_begin,
            backbone_long_sid1_begin,
            backbone_end,
            sid1a,
            sid1b,
            sid0i,
            backsid,
            back_a_index,
            back_b_index,
            perm: new_nodes,
        })
    }
}

/// A single unbranched cable of `n` zero-area nodes rooted at 0.
#[cfg(test)]
pub(crate) fn test_cable(n: usize) -> Nodes {
    let parents: Vec<Option<usize>> = (0..n).map(|i| i.checked_sub(1)).collect();
    Nodes::new(parents, vec![0.0; n]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cable(n: usize) -> Nodes {
        test_cable(n)
    }

    #[test]
    fn rejects_misordered_parents() {
        assert!(Nodes::new(vec![Some(1), None], vec![0.0; 2]).is_err());
    }

    #[test]
    fn rerooting_reverses_the_chain() {
        // Classical root 0, sid0 placed at node 3 of a 6-node cable.
        let mut nodes = cable(6);
        let mut ms = MsList::default();
        ms.add(&nodes, 3, 7, BackboneStyle::Long).unwrap();
        let layout = Layout::build(&mut nodes, &mut ms).unwrap();

        // The sid node is now a root and every parent precedes its
        // child.
        let nd0 = ms.list[0].nd[0].unwrap();
        assert!(nodes.parent[nd0].is_none());
        for (i, p) in nodes.parent.iter().enumerate() {
            if let Some(p) = p {
                assert!(*p < i);
            }
        }
        // No second sid, so no backbone range.
        assert_eq!(layout.nback(), 0);
        // The chain 3 -> 2 -> 1 -> 0 reversed: classical root 0 is now
        // a leaf of the re-rooted tree.
        let old_root_new = layout.perm.iter().position(|&o| o == 0).unwrap();
        assert!(nodes.parent[old_root_new].is_some());
    }

    #[test]
    fn two_sid_cable_has_full_backbone() {
        // sid0 at the classical root, sid1 at the far end: the whole
        // cable is backbone.
        let mut nodes = cable(4);
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 1, BackboneStyle::Long).unwrap();
        ms.add(&nodes, 3, 2, BackboneStyle::Long).unwrap();
        let layout = Layout::build(&mut nodes, &mut ms).unwrap();
        assert_eq!(layout.backbone_begin, 0);
        assert_eq!(layout.backbone_interior_begin, 1);
        assert_eq!(layout.backbone_sid1_begin, 3);
        assert_eq!(layout.backbone_end, 4);
        assert_eq!(layout.nback(), 4);
        // Interior nodes know their sid0 row.
        for i in layout.backbone_interior_begin..layout.backbone_sid1_begin {
            assert_eq!(layout.sid0i[i - layout.backbone_begin], Some(0));
        }
    }

    #[test]
    fn fences_are_monotone() {
        let mut nodes = cable(8);
        let mut ms = MsList::default();
        ms.add(&nodes, 2, 1, BackboneStyle::Long).unwrap();
        ms.add(&nodes, 6, 2, BackboneStyle::Long).unwrap();
        let l = Layout::build(&mut nodes, &mut ms).unwrap();
        assert!(l.backbone_begin <= l.backbone_long_begin);
        assert!(l.backbone_long_begin <= l.backbone_interior_begin);
        assert!(l.backbone_interior_begin <= l.backbone_sid1_begin);
        assert!(l.backbone_sid1_begin <= l.backbone_long_sid1_begin);
        assert!(l.backbone_long_sid1_begin <= l.backbone_end);
        assert!(l.backbone_end <= nodes.len());
    }

    #[test]
    fn classical_couplings_follow_reversed_edges() {
        // After re-rooting at node 2, the classical edge 1 -> 2 runs the
        // other way in solver order; the classical slots must land on
        // the flipped node.
        let mut nodes = cable(4);
        let mut ms = MsList::default();
        ms.add(&nodes, 2, 6, BackboneStyle::Long).unwrap();
        let layout = Layout::build(&mut nodes, &mut ms).unwrap();
        let new_of = |old: usize| layout.perm.iter().position(|&o| o == old).unwrap();

        // Node 3 kept its orientation: classical a is its own a slot.
        let n3 = new_of(3);
        assert_eq!(nodes.classical_a(n3), Some(CouplingSlot::A(n3)));
        // The classical root has no classical couplings.
        let (n0, n1) = (new_of(0), new_of(1));
        assert_eq!(nodes.classical_a(n0), None);
        // Node 1's classical parent 0 is now its solver child: the
        // classical couplings live in the flipped node's slots.
        assert_eq!(nodes.classical_a(n1), Some(CouplingSlot::B(n0)));
        assert_eq!(nodes.classical_b(n1), Some(CouplingSlot::A(n0)));
        // Writing through the slot touches the right coefficient.
        let slot = nodes.classical_a(n1).unwrap();
        *nodes.coupling_mut(slot) = -2.5;
        assert_eq!(nodes.b[n0], -2.5);
    }

    #[test]
    fn duplicate_sid_is_a_config_error() {
        let nodes = cable(4);
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 5, BackboneStyle::Long).unwrap();
        assert!(ms.add(&nodes, 3, 5, BackboneStyle::Long).is_err());
    }

    #[test]
    fn restore_classical_round_trips() {
        let mut nodes = cable(6);
        for i in 0..6 {
            nodes.d[i] = i as f64 + 1.0;
        }
        let reference = nodes.clone();
        let mut ms = MsList::default();
        ms.add(&nodes, 4, 3, BackboneStyle::Long).unwrap();
        let layout = Layout::build(&mut nodes, &mut ms).unwrap();
        layout.restore_classical(&mut nodes, &mut ms);
        assert_eq!(nodes.d, reference.d);
        assert_eq!(nodes.parent, reference.parent);
        assert_eq!(nodes.classical_parent, reference.classical_parent);
        assert_eq!(ms.list[0].nd[0], Some(4));
    }
}
