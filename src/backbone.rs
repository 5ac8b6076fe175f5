//! Backbone elimination
//!
//! Gaussian elimination for the chain of nodes between the two sids of
//! a split cell. Two strategies trade operation count against
//! numerical stability:
//!
//! For long backbones, triangularisation begins adjacent to the sid1
//! end and fills in a single column (`S1A`), then runs back from the
//! root end filling a second column (`S1B`). The matrix ends up shaped
//! like an N: a diagonal plus the two filled columns. After the end
//! equations are exchanged, the 2x2 formed by the two sid rows is
//! solved and the column values give every interior voltage.
//!
//! For short (tightly coupled) backbones the same N-shape is built, but
//! the 2x2 is solved in the middle of the exchange, on the short host,
//! from the exact long-end equations it has just received; only the
//! solved result travels back. A short backbone must therefore never
//! couple to another short backbone across ranks.

use crate::cell::{Layout, Nodes};
use crate::error::{Error, Result};

fn pivot(d: f64, at: &str, i: usize) -> Result<f64> {
    if d == 0.0 {
        Err(Error::singular(format!("zero pivot at {at} node {i}")))
    } else {
        Ok(d)
    }
}

/// Triangularise every subtree into the backbone, leaving a
/// tridiagonal system on the backbone nodes themselves.
pub fn triang_subtree2backbone(nodes: &mut Nodes, layout: &Layout) -> Result<()> {
    for i in (layout.backbone_end..nodes.len()).rev() {
        let ip = nodes.parent[i].expect("subtree node without parent");
        let p = nodes.a[i] / pivot(nodes.d[i], "subtree", i)?;
        nodes.d[ip] -= p * nodes.b[i];
        nodes.rhs[ip] -= p * nodes.rhs[i];
    }
    Ok(())
}

/// Eliminate the backbone interior, filling the `S1A` and `S1B`
/// columns. The backbone starts tridiagonal and ends in the form of an
/// N.
pub fn triang_backbone(nodes: &mut Nodes, layout: &mut Layout) -> Result<()> {
    let begin = layout.backbone_begin;

    // Forward pass, pivots walking from sid1 toward the root: kills the
    // `a` entries, fills the sid1 column.
    for i in layout.backbone_sid1_begin..layout.backbone_end {
        let j = nodes.parent[i].expect("sid1 without parent") - begin;
        layout.sid1a[j] = nodes.a[i];
    }
    for i in (layout.backbone_interior_begin..layout.backbone_sid1_begin).rev() {
        let ip = nodes.parent[i].expect("interior without parent");
        let j = i - begin;
        let jp = ip - begin;
        let p = nodes.a[i] / pivot(nodes.d[i], "backbone", i)?;
        nodes.d[ip] -= p * nodes.b[i];
        nodes.rhs[ip] -= p * nodes.rhs[i];
        layout.sid1a[jp] = -p * layout.sid1a[j];
    }

    // Reverse pass, pivots walking from the root toward sid1: kills the
    // `b` entries, fills the sid0 column and touches up `S1A`.
    for i in layout.backbone_interior_begin..layout.backbone_sid1_begin {
        let ip = nodes.parent[i].expect("interior without parent");
        let j = i - begin;
        if ip < layout.backbone_interior_begin {
            layout.sid1b[j] = nodes.b[i];
            continue;
        }
        let jp = ip - begin;
        let p = nodes.b[i] / pivot(nodes.d[ip], "backbone", ip)?;
        nodes.rhs[i] -= p * nodes.rhs[ip];
        layout.sid1a[j] -= p * layout.sid1a[jp];
        layout.sid1b[j] = -p * layout.sid1b[jp];
    }
    // Same again over the sid1 range, where the fill lands on the
    // diagonal instead of S1A.
    for i in layout.backbone_sid1_begin..layout.backbone_end {
        let ip = nodes.parent[i].expect("sid1 without parent");
        let j = i - begin;
        if ip < layout.backbone_interior_begin {
            layout.sid1b[j] = nodes.b[i];
            continue;
        }
        let jp = ip - begin;
        let p = nodes.b[i] / pivot(nodes.d[ip], "backbone", ip)?;
        nodes.rhs[i] -= p * nodes.rhs[ip];
        nodes.d[i] -= p * layout.sid1a[jp];
        layout.sid1b[j] = -p * layout.sid1b[jp];
    }
    Ok(())
}

/// Solve the 2x2 systems formed by the sid0 and sid1 rows of the given
/// range and divide both right-hand sides through.
fn solve_end_pairs(
    nodes: &mut Nodes,
    layout: &Layout,
    sid0_range: std::ops::Range<usize>,
    mut j: usize,
) -> Result<()> {
    let begin = layout.backbone_begin;
    for i in sid0_range {
        let a = layout.sid1a[i - begin];
        let b = layout.sid1b[j - begin];
        let p = b / pivot(nodes.d[i], "sid0 row", i)?;
        nodes.d[j] -= p * a;
        nodes.rhs[j] -= p * nodes.rhs[i];
        nodes.rhs[j] /= pivot(nodes.d[j], "sid1 row", j)?;
        nodes.rhs[i] -= a * nodes.rhs[j];
        nodes.rhs[i] /= nodes.d[i];
        j += 1;
    }
    Ok(())
}

/// Back-substitute the long backbones once the sid equations hold their
/// exchanged values: solve each end 2x2, then sweep the two fill
/// columns to recover the interior.
pub fn bksub_backbone(nodes: &mut Nodes, layout: &Layout) -> Result<()> {
    let begin = layout.backbone_begin;
    solve_end_pairs(
        nodes,
        layout,
        layout.backbone_long_begin..layout.backbone_interior_begin,
        layout.backbone_long_sid1_begin,
    )?;

    // The sid values now give the column contributions. S1A sweep runs
    // per cell from each sid1 toward the root.
    for i in layout.backbone_sid1_begin..layout.backbone_end {
        let vsid1 = nodes.rhs[i];
        let mut j = nodes.parent[i];
        while let Some(k) = j {
            if k < layout.backbone_interior_begin {
                break;
            }
            nodes.rhs[k] -= layout.sid1a[k - begin] * vsid1;
            j = nodes.parent[k];
        }
    }
    // The S1B sweep uses the stored sid0 row of each interior node.
    for i in layout.backbone_interior_begin..layout.backbone_sid1_begin {
        let j = i - begin;
        let s0 = layout.sid0i[j].expect("interior node without sid0 back-index");
        nodes.rhs[i] -= layout.sid1b[j] * nodes.rhs[s0];
        nodes.rhs[i] /= pivot(nodes.d[i], "interior", i)?;
    }
    Ok(())
}

/// The short-backbone 2x2, run in the middle of the exchange once the
/// long-end equations have arrived. The result replaces the remote
/// equations outright, so nothing more is owed to this range in
/// [`bksub_backbone`].
pub fn bksub_short_backbone_part1(nodes: &mut Nodes, layout: &Layout) -> Result<()> {
    solve_end_pairs(
        nodes,
        layout,
        layout.backbone_begin..layout.backbone_long_begin,
        layout.backbone_sid1_begin,
    )
}

/// Back-substitute everything outside the backbones: single-sid roots,
/// then all remaining subtree nodes.
pub fn bksub_subtrees(nodes: &mut Nodes, layout: &Layout) -> Result<()> {
    for i in 0..layout.backbone_begin {
        nodes.rhs[i] /= pivot(nodes.d[i], "root", i)?;
    }
    for i in layout.backbone_end..nodes.len() {
        let ip = nodes.parent[i].expect("subtree node without parent");
        nodes.rhs[i] -= nodes.b[i] * nodes.rhs[ip];
        nodes.rhs[i] /= pivot(nodes.d[i], "subtree", i)?;
    }
    Ok(())
}

/// Single-process Hines elimination over the whole node vector, the
/// reference the distributed solver must reproduce.
pub fn serial_solve(nodes: &mut Nodes) -> Result<()> {
    for i in (0..nodes.len()).rev() {
        let Some(ip) = nodes.parent[i] else { continue };
        let p = nodes.a[i] / pivot(nodes.d[i], "serial", i)?;
        nodes.d[ip] -= p * nodes.b[i];
        nodes.rhs[ip] -= p * nodes.rhs[i];
    }
    for i in 0..nodes.len() {
        match nodes.parent[i] {
            None => nodes.rhs[i] /= pivot(nodes.d[i], "serial root", i)?,
            Some(ip) => {
                nodes.rhs[i] -= nodes.b[i] * nodes.rhs[ip];
                nodes.rhs[i] /= pivot(nodes.d[i], "serial", i)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{test_cable, BackboneStyle, MsList};

    /// Deterministic diagonally dominant fill for a tree matrix.
    fn assemble(nodes: &mut Nodes) {
        for i in 0..nodes.len() {
            nodes.d[i] = 4.0 + 0.25 * i as f64;
            nodes.rhs[i] = 1.0 + 0.5 * i as f64;
            if nodes.parent[i].is_some() {
                nodes.a[i] = -1.0 - 0.01 * i as f64;
                nodes.b[i] = -1.0 + 0.02 * i as f64;
            }
        }
    }

    #[test]
    fn local_long_backbone_matches_serial() {
        // One rank holding both sids: the N-matrix pipeline with no
        // exchange must reproduce the plain Hines solve.
        let mut nodes = test_cable(7);
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 1, BackboneStyle::Long).unwrap();
        ms.add(&nodes, 6, 2, BackboneStyle::Long).unwrap();
        let mut layout = Layout::build(&mut nodes, &mut ms).unwrap();

        assemble(&mut nodes);
        let mut reference = nodes.clone();
        serial_solve(&mut reference).unwrap();

        triang_subtree2backbone(&mut nodes, &layout).unwrap();
        triang_backbone(&mut nodes, &mut layout).unwrap();
        bksub_backbone(&mut nodes, &layout).unwrap();
        bksub_subtrees(&mut nodes, &layout).unwrap();

        for i in 0..nodes.len() {
            let err = (nodes.rhs[i] - reference.rhs[i]).abs()
                / reference.rhs[i].abs().max(1e-300);
            assert!(err < 1e-10, "node {i}: {} vs {}", nodes.rhs[i], reference.rhs[i]);
        }
    }

    #[test]
    fn branched_cell_with_side_subtrees_matches_serial() {
        // A cable 0..=4 with a side branch hanging off node 2, sids at
        // the cable ends. The branch must triangulate into the backbone
        // and back-substitute out again.
        let parents = vec![None, Some(0), Some(1), Some(2), Some(3), Some(2), Some(5)];
        let mut nodes = Nodes::new(parents, vec![0.0; 7]).unwrap();
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 10, BackboneStyle::Long).unwrap();
        ms.add(&nodes, 4, 11, BackboneStyle::Long).unwrap();
        let mut layout = Layout::build(&mut nodes, &mut ms).unwrap();
        assert_eq!(layout.nback(), 5);

        assemble(&mut nodes);
        let mut reference = nodes.clone();
        serial_solve(&mut reference).unwrap();

        triang_subtree2backbone(&mut nodes, &layout).unwrap();
        triang_backbone(&mut nodes, &mut layout).unwrap();
        bksub_backbone(&mut nodes, &layout).unwrap();
        bksub_subtrees(&mut nodes, &layout).unwrap();

        for i in 0..nodes.len() {
            let err = (nodes.rhs[i] - reference.rhs[i]).abs()
                / reference.rhs[i].abs().max(1e-300);
            assert!(err < 1e-10, "node {i}");
        }
    }

    #[test]
    fn zero_pivot_is_singular() {
        let mut nodes = test_cable(3);
        let mut ms = MsList::default();
        ms.add(&nodes, 0, 1, BackboneStyle::Long).unwrap();
        let layout = Layout::build(&mut nodes, &mut ms).unwrap();
        // d left at zero everywhere.
        nodes.a[2] = -1.0;
        let err = triang_subtree2backbone(&mut nodes, &layout).unwrap_err();
        assert!(matches!(err, Error::Singular(_)));
    }
}
