//! # syncr
//!
//! **Bucketed gradient reduction engine for distributed data-parallel
//! training.**
//!
//! During each training step, every worker computes gradients for a shared
//! parameter set over its own input shard; syncr averages those gradients
//! across workers while overlapping collective communication with the
//! backward pass. Many small per-parameter gradients are coalesced into
//! few large flat buckets, buckets are dispatched to the backend the
//! moment their last gradient lands, and after the first iteration the
//! engine rebuckets itself around the observed gradient arrival order.
//!
//! ## Design
//!
//! ```text
//! autograd engine ──post-hooks──▶ Reducer ──allreduce──▶ ProcessGroup
//!      ▲                            │
//!      └───────queue_callback───────┘ (finalize after backward)
//! ```
//!
//! - **Collaborator seams**: the tensor frontend, autograd engine, and
//!   collective backend are consumed through thin contracts (`tensor`,
//!   `autograd`, `comm`), keeping the engine standalone.
//! - **Bucket views**: each parameter's gradient ends up aliasing a
//!   strided view into its bucket's flat buffer, so steady-state
//!   iterations copy nothing.
//! - **Deterministic dispatch**: buckets go out in strictly ascending
//!   index order, making the collective call sequence reproducible.

pub mod autograd;
pub mod comm;
pub mod error;
pub mod reducer;
pub mod tensor;

// Re-export the primary engine surface
pub use reducer::{
    compute_bucket_assignment_by_size, Reducer, ReducerOptions, DEFAULT_BUCKET_BYTES_CAP,
    DEFAULT_FIRST_BUCKET_BYTES,
};

// Re-export the collaborator contracts users wire up
pub use autograd::{DistAutogradContext, Engine, Node, Variable};
pub use comm::{
    CommHook, GradBucket, HookFuture, HookPromise, LocalProcessGroup, NoopProcessGroup,
    ProcessGroup, Work,
};
pub use error::{Error, Result};
pub use tensor::{DType, Device, Grad, SparseTensor, Tensor};
