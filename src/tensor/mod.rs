//! Minimal host-backed tensors for the reduction engine.
//!
//! The engine only needs a thin tensor contract (shared storage, strided
//! aliasing views, dtype/device tags), so it carries its own
//! implementation of exactly that contract instead of binding to a full
//! tensor frontend. This keeps syncr standalone and usable with any
//! frontend that can adapt to these types.

mod dense;
mod dtype;
pub mod layout;
mod sparse;

pub use dense::Tensor;
pub use dtype::{DType, Device, Element};
pub use sparse::SparseTensor;

/// A gradient value: dense strided tensor or sparse COO gradient.
///
/// An absent gradient ("undefined" in autograd terms) is `Option<Grad>`'s
/// `None`.
#[derive(Clone, Debug)]
pub enum Grad {
    Dense(Tensor),
    Sparse(SparseTensor),
}

impl Grad {
    pub fn dtype(&self) -> DType {
        match self {
            Grad::Dense(t) => t.dtype(),
            Grad::Sparse(s) => s.dtype(),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Grad::Dense(t) => t.device(),
            Grad::Sparse(s) => s.device(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Grad::Sparse(_))
    }
}

impl std::fmt::Debug for SparseTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseTensor")
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .field("dense_sizes", &self.dense_sizes())
            .field("nnz", &self.nnz())
            .finish()
    }
}
