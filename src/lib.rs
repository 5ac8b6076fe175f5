#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]

//! Parallel runtime for a neural conductance-network simulator
//!
//! Many processes cooperatively integrate a single network in lock-step.
//! Two subsystems make that possible and are implemented here:
//!
//! - **Spike exchange**: at every minimum-delay interval each rank
//!   delivers every locally generated `(gid, spiketime)` event to every
//!   rank that subscribes to that `gid`, either through a collective
//!   all-gather ([`exchange`]) or through sender-initiated multicast
//!   with a conservation check ([`dma`]). Event streams may be
//!   compressed to a delta-time byte plus a short local gid ([`codec`]).
//! - **Multi-split solver**: a branching cable equation is cut at shared
//!   split identifiers (`sid`) and distributed over ranks; each time
//!   step the pieces are triangularised into their backbones
//!   ([`backbone`]), backbone end equations are exchanged and, where a
//!   whole cell is involved, solved on a designated rank as a small
//!   dense tree matrix ([`rtree`]), then everything back-substitutes as
//!   if a single matrix had been factorised ([`msolve`]).
//!
//! Both subsystems sit on a small message-passing abstraction, the
//! [`transport::Communicator`] trait, whose operations deliberately
//! mirror the MPI subset an electrophysiology simulator actually needs:
//! barrier, all-reduce, all-gather(v), all-to-all(v), broadcast, and
//! tagged point-to-point with posted receives. [`shmem::LocalCluster`]
//! provides an in-process implementation that runs every rank as a
//! thread of one process, which is how the test suite exercises
//! multi-rank behaviour.
//!
//! # Usage
//!
//! ```no_run
//! use netsplit::shmem::LocalCluster;
//! use netsplit::runtime::ParContext;
//! use netsplit::traits::*;
//!
//! let results = LocalCluster::run(4, |comm| {
//!     let rank = comm.rank();
//!     let mut pc = ParContext::new(comm);
//!     pc.set_gid2node(rank, rank);
//!     pc.outputcell(rank);
//!     // ... declare subscriptions, commit, integrate ...
//!     rank
//! });
//! assert_eq!(results, vec![0, 1, 2, 3]);
//! ```

pub mod backbone;
pub mod cell;
pub mod codec;
pub mod datatype;
pub mod dma;
pub mod error;
pub mod exchange;
pub mod msolve;
pub mod plan;
pub mod rtree;
pub mod runtime;
pub mod shmem;
pub mod spike;
pub mod transport;

/// Re-exports all traits.
pub mod traits {
    pub use crate::datatype::Datum;
    pub use crate::spike::EventSink;
    pub use crate::transport::Communicator;
}

#[doc(inline)]
pub use error::{Error, Result};

/// Identifies a process within the job.
pub type Rank = i32;
/// Tags messages on the sender side so completions cannot cross-match.
pub type Tag = i32;
/// Encodes number of values in multi-value messages.
pub type Count = i32;
/// Process-global identifier of an event source.
pub type Gid = i32;
/// Process-global identifier of a split point.
pub type Sid = i32;
