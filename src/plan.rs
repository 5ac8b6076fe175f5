//! Connectivity planning
//!
//! Before the first exchange every rank must know, for each of its
//! output gids, the sorted set of ranks subscribing to it, and for each
//! of its input gids, the owning rank. Sending every rank's full input
//! table everywhere would dwarf the output tables, so the plan is built
//! source-centric in two phases:
//!
//! 1. the output gids of all ranks are all-gathered in chunks sized to
//!    bound peak memory, and every rank scans each chunk for gids it
//!    listens to, recording the source rank;
//! 2. an all-to-all tells each source rank how many of its gids each
//!    target wants, then an all-to-all of the gid lists lets the source
//!    build its per-gid target-rank arrays.
//!
//! Scratch vectors live only for the duration of planning. Target-rank
//! arrays come out in ascending rank order, which makes the plan
//! deterministic for a fixed set of directives.

use log::debug;

use crate::error::Result;
use crate::spike::GidTables;
use crate::transport::{displacements, Communicator};
use crate::{Count, Gid, Rank};

/// Smallest chunk the gid sweep will allocate; anything this size is
/// routinely allocated elsewhere already.
const MIN_CHUNK: usize = 10_000;

/// Resolve source ranks for every subscription and target-rank lists
/// for every output. Collective; every rank must participate.
///
/// Returns the largest target-rank list length on this rank.
pub fn setup_connectivity<C: Communicator>(comm: &C, tables: &mut GidTables) -> Result<usize> {
    determine_source_ranks(comm, tables);
    let max_ntarget = determine_target_ranks(comm, tables);
    debug!(
        "connectivity planned: {} outputs, {} inputs, widest fan-out {}",
        tables.out.len(),
        tables.input.len(),
        max_ntarget
    );
    Ok(max_ntarget)
}

/// Phase one: sweep all output gids past every rank in bounded chunks
/// and record the owner of each gid this rank listens to.
fn determine_source_ranks<C: Communicator>(comm: &C, tables: &mut GidTables) {
    let np = comm.size() as usize;

    // Some subscriptions may never find a source.
    for inp in tables.input.values_mut() {
        inp.src_rank = -1;
    }

    let gids = tables.output_gids();
    let mut host_ngid = vec![0 as Count; np];
    comm.all_gather_into(&[gids.len() as Count], &mut host_ngid);

    let total: usize = host_ngid.iter().map(|&n| n as usize).sum();
    let maxngid = host_ngid.iter().copied().max().unwrap_or(0) as usize;
    // Guarantee room for any single host, but never more than the job
    // holds in total.
    let bufsize = MIN_CHUNK.max(np).max(maxngid).min(total);
    if bufsize == 0 {
        return;
    }

    let mut counts = vec![0 as Count; np];
    let mut displs = vec![0 as Count; np + 1];
    let mut buf = vec![0 as Gid; bufsize];
    let mut hostbegin = 0usize;
    while hostbegin < np {
        let hostend = gather_gid_chunk(
            comm,
            hostbegin,
            &host_ngid,
            &gids,
            &mut counts,
            &mut displs,
            bufsize,
            &mut buf,
        );
        for ihost in hostbegin..hostend {
            for i in displs[ihost] as usize..displs[ihost + 1] as usize {
                if let Some(inp) = tables.input.get_mut(&buf[i]) {
                    inp.src_rank = ihost as Rank;
                }
            }
        }
        hostbegin = hostend;
    }
}

/// Gather the output gids of as many hosts as fit `bufsize`, starting
/// at `hostbegin`. Returns the first host not covered.
#[allow(clippy::too_many_arguments)]
fn gather_gid_chunk<C: Communicator>(
    comm: &C,
    hostbegin: usize,
    host_ngid: &[Count],
    own_gids: &[Gid],
    counts: &mut [Count],
    displs: &mut [Count],
    bufsize: usize,
    buf: &mut [Gid],
) -> usize {
    let np = host_ngid.len();
    let mut hostend = hostbegin;
    for i in 0..hostbegin {
        counts[i] = 0;
        displs[i] = 0;
    }
    displs[hostbegin] = 0;
    let mut i = hostbegin;
    while i < np {
        if (displs[i] + host_ngid[i]) as usize > bufsize {
            break;
        }
        counts[i] = host_ngid[i];
        displs[i + 1] = displs[i] + counts[i];
        hostend = i + 1;
        i += 1;
    }
    while i < np {
        counts[i] = 0;
        displs[i + 1] = displs[i];
        i += 1;
    }
    let me = comm.rank() as usize;
    let mine: &[Gid] = if me >= hostbegin && me < hostend {
        own_gids
    } else {
        &[]
    };
    comm.all_gather_varcount_into(mine, buf, counts, &displs[..np]);
    hostend
}

/// Phase two: ship the wanted-gid lists back to their owners and build
/// the per-output target-rank arrays.
fn determine_target_ranks<C: Communicator>(comm: &C, tables: &mut GidTables) -> usize {
    let np = comm.size() as usize;
    let me = comm.rank();

    // Wanted gids grouped by owning rank, ascending gid within a group
    // so the exchange is deterministic.
    let mut wanted: Vec<(Rank, Gid)> = tables
        .input
        .values()
        .filter(|inp| inp.src_rank >= 0)
        .map(|inp| (inp.src_rank, inp.gid))
        .collect();
    wanted.sort_unstable();

    let mut scounts = vec![0 as Count; np];
    for &(src, _) in &wanted {
        scounts[src as usize] += 1;
    }
    let mut sdispls = Vec::new();
    displacements(&scounts, &mut sdispls);
    let send: Vec<Gid> = wanted.iter().map(|&(_, gid)| gid).collect();

    // Each owner learns how many of its gids every rank wants, then
    // receives the lists themselves.
    let mut rcounts = vec![0 as Count; np];
    comm.all_to_all_into(&scounts, &mut rcounts);
    let mut rdispls = Vec::new();
    let total = displacements(&rcounts, &mut rdispls);
    let mut targid_on_src = vec![0 as Gid; total];
    comm.all_to_all_varcount_into(
        &send,
        &scounts,
        &sdispls,
        &mut targid_on_src,
        &rcounts,
        &rdispls,
    );

    for ps in tables.out.values_mut() {
        ps.targets.clear();
        ps.send2self = false;
    }
    let mut max_ntarget = 0usize;
    for i in 0..np {
        let d = rdispls[i] as usize;
        for j in 0..rcounts[i] as usize {
            let gid = targid_on_src[d + j];
            let ps = tables
                .out
                .get_mut(&gid)
                .expect("a rank wants a gid this rank does not output");
            if i as Rank == me {
                ps.send2self = true;
            } else {
                ps.targets.push(i as Rank);
            }
            if ps.targets.len() > max_ntarget {
                max_ntarget = ps.targets.len();
            }
        }
    }
    max_ntarget
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spike::{InputTarget, PreSyn};
    use crate::transport::SelfComm;

    #[test]
    fn single_rank_plan_resolves_self_delivery() {
        let comm = SelfComm::new();
        let mut tables = GidTables::default();
        tables.out.insert(
            1,
            PreSyn {
                gid: 1,
                output: true,
                ..PreSyn::default()
            },
        );
        tables.input.insert(
            1,
            InputTarget {
                gid: 1,
                src_rank: -1,
                sink: 0,
            },
        );
        setup_connectivity(&comm, &mut tables).unwrap();
        let ps = &tables.out[&1];
        assert!(ps.send2self);
        assert!(ps.targets.is_empty());
        assert_eq!(tables.input[&1].src_rank, 0);
    }
}
