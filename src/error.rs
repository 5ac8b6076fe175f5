//! Error handling
//!
//! Setup and per-step failures surface as one crate-wide [`Error`]
//! type. The transport layer itself follows the errors-are-fatal model
//! of the message-passing runtimes it abstracts: an irrecoverable
//! transport condition (a peer rank gone while holding shared state)
//! aborts the job rather than unwinding into the solver, and is only
//! represented here when it can be reported before the job dies.

use thiserror::Error;

/// Any error raised by the parallel runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Inconsistent or impossible configuration, detected during setup.
    ///
    /// Examples: two identical `sid`s on one tree, a short backbone
    /// connected to a short backbone on another rank, or a backbone
    /// style that differs between ranks for the same `sid`.
    #[error("configuration: {0}")]
    Config(String),

    /// A structural invariant did not hold.
    ///
    /// Examples: a receive buffer re-entered while busy, a parent index
    /// not smaller than its child after reordering, or a reduced tree
    /// whose edge set is not a tree.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A fixed-capacity buffer overflowed with no overflow path enabled.
    #[error("capacity overflow: {0}")]
    Capacity(String),

    /// A zero pivot during factorisation. The step is not retried.
    #[error("singular matrix: {0}")]
    Singular(String),

    /// A non-success result from the collective layer.
    #[error("transport fault: {0}")]
    Transport(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Error {
        Error::Config(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Error {
        Error::Invariant(msg.into())
    }

    pub(crate) fn capacity(msg: impl Into<String>) -> Error {
        Error::Capacity(msg.into())
    }

    pub(crate) fn singular(msg: impl Into<String>) -> Error {
        Error::Singular(msg.into())
    }
}
