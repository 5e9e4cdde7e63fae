//! Collective-communication seam.
//!
//! The engine consumes its backend through [`ProcessGroup`]: collectives
//! return awaitable [`Work`] handles and operate in place on the submitted
//! tensors. Real deployments wire in an NCCL/Gloo-style backend;
//! [`LocalProcessGroup`] provides an in-process rendezvous implementation
//! for multi-worker tests, and [`NoopProcessGroup`] a world-size-1 stub.

mod hook;
mod local;

pub use hook::{CommHook, GradBucket, HookFuture, HookPromise};
pub use local::{LocalProcessGroup, NoopProcessGroup};

use crate::error::Result;
use crate::tensor::{SparseTensor, Tensor};

/// Handle to an asynchronous collective operation.
///
/// `wait` blocks the calling thread until the collective completes and
/// surfaces any backend failure. Handles must remain valid when moved
/// across threads.
pub trait Work: Send {
    /// Block until the collective completes.
    fn wait(self: Box<Self>) -> Result<()>;
}

/// The collective-communication backend contract.
///
/// All operations are submitted per-rank and reduce or broadcast in place:
/// the submitted tensors are views into caller-owned storage and hold the
/// result once the returned [`Work`] completes. Dense `allreduce` sums
/// element-wise across ranks; `broadcast` distributes rank 0's data;
/// `allreduce_sparse` sums COO gradients (the result is coalesced).
pub trait ProcessGroup: Send + Sync {
    fn broadcast(&self, tensors: &[Tensor]) -> Result<Box<dyn Work>>;

    fn allreduce(&self, tensors: &[Tensor]) -> Result<Box<dyn Work>>;

    fn allreduce_sparse(&self, tensors: &[SparseTensor]) -> Result<Box<dyn Work>>;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// This process's rank.
    fn rank(&self) -> usize;
}
