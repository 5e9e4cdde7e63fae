//! Binding to the external autograd engine.
//!
//! The reduction engine never runs backward itself; it consumes three
//! narrow contracts from whatever autograd runtime hosts it: per-variable
//! gradient accumulator nodes that accept post-hooks, a graph of nodes
//! reachable through `next_edges` for unused-parameter discovery, and an
//! engine queue that runs callbacks on the main thread once backward
//! completes. This module is that contract, with stable `u64` node
//! identities standing in for raw function pointers.

mod context;

pub use context::{current_context, ContextGuard, DistAutogradContext};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::{Error, Result};
use crate::tensor::{DType, Device, Grad, Tensor};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

type PostHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// A function node in the autograd graph.
///
/// Leaf parameters own an accumulator node (no outgoing edges); interior
/// nodes point at their inputs' nodes through `next_edges`. Post-hooks run
/// after the node's gradient work; for accumulators, that is after the
/// gradient has been accumulated into the variable.
pub struct Node {
    id: u64,
    next_edges: Vec<Arc<Node>>,
    post_hooks: Mutex<Vec<(u64, PostHook)>>,
    next_hook_id: AtomicU64,
}

impl Node {
    pub fn new(next_edges: Vec<Arc<Node>>) -> Arc<Node> {
        Arc::new(Node {
            id: fresh_id(),
            next_edges,
            post_hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        })
    }

    /// Stable identity of this node, usable as a hash key.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn next_edges(&self) -> &[Arc<Node>] {
        &self.next_edges
    }

    /// Register a hook to run after this node executes; returns a handle
    /// for [`del_post_hook`](Self::del_post_hook).
    pub fn add_post_hook(&self, hook: PostHook) -> u64 {
        let key = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.post_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, hook));
        key
    }

    /// Remove a previously registered hook. Returns whether it existed.
    pub fn del_post_hook(&self, key: u64) -> bool {
        let mut hooks = self
            .post_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|(k, _)| *k != key);
        hooks.len() != before
    }

    /// Run all post-hooks in registration order, as the engine does after
    /// executing the node. The first failing hook aborts the rest.
    pub fn fire_post_hooks(&self) -> Result<()> {
        let hooks = self
            .post_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, hook) in hooks.iter() {
            hook()?;
        }
        Ok(())
    }
}

struct VariableInner {
    id: u64,
    data: Tensor,
    requires_grad: bool,
    grad: Mutex<Option<Grad>>,
    accumulator: OnceLock<Arc<Node>>,
    grad_fn: Option<Arc<Node>>,
}

/// An externally owned parameter or forward output.
///
/// Cloning is cheap and aliases the same variable. Leaf parameters have no
/// `grad_fn` and lazily materialize a gradient accumulator node; forward
/// outputs carry the `grad_fn` that roots the backward graph.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

impl Variable {
    /// A leaf parameter that requires gradients.
    pub fn parameter(data: Tensor) -> Variable {
        Variable {
            inner: Arc::new(VariableInner {
                id: fresh_id(),
                data,
                requires_grad: true,
                grad: Mutex::new(None),
                accumulator: OnceLock::new(),
                grad_fn: None,
            }),
        }
    }

    /// A non-leaf value produced by the forward pass, rooted at `grad_fn`.
    pub fn with_grad_fn(data: Tensor, grad_fn: Arc<Node>) -> Variable {
        Variable {
            inner: Arc::new(VariableInner {
                id: fresh_id(),
                data,
                requires_grad: true,
                grad: Mutex::new(None),
                accumulator: OnceLock::new(),
                grad_fn: Some(grad_fn),
            }),
        }
    }

    /// A leaf that does not require gradients (rejected by the Reducer).
    pub fn frozen(data: Tensor) -> Variable {
        Variable {
            inner: Arc::new(VariableInner {
                id: fresh_id(),
                data,
                requires_grad: false,
                grad: Mutex::new(None),
                accumulator: OnceLock::new(),
                grad_fn: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn data(&self) -> &Tensor {
        &self.inner.data
    }

    pub fn sizes(&self) -> &[usize] {
        self.inner.data.sizes()
    }

    pub fn strides(&self) -> &[usize] {
        self.inner.data.strides()
    }

    pub fn dtype(&self) -> DType {
        self.inner.data.dtype()
    }

    pub fn device(&self) -> Device {
        self.inner.data.device()
    }

    pub fn numel(&self) -> usize {
        self.inner.data.numel()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    pub fn grad_fn(&self) -> Option<&Arc<Node>> {
        self.inner.grad_fn.as_ref()
    }

    /// The gradient accumulation node for this leaf, created on first use.
    pub fn grad_accumulator(&self) -> Arc<Node> {
        Arc::clone(self.inner.accumulator.get_or_init(|| Node::new(Vec::new())))
    }

    /// Snapshot of the gradient slot.
    pub fn grad(&self) -> Option<Grad> {
        self.inner
            .grad
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overwrite the gradient slot.
    pub fn set_grad(&self, grad: Option<Grad>) {
        *self
            .inner
            .grad
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = grad;
    }

    /// Accumulate a newly computed gradient the way the engine's
    /// accumulator node does: stash on first arrival, add in place after
    /// (which preserves any aliasing of the existing gradient).
    pub fn accumulate_grad(&self, grad: Grad) -> Result<()> {
        let mut slot = self
            .inner
            .grad
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match (slot.take(), grad) {
            (None, new) => {
                *slot = Some(new);
                Ok(())
            }
            (Some(Grad::Dense(existing)), Grad::Dense(new)) => {
                existing.add_assign_from(&new)?;
                *slot = Some(Grad::Dense(existing));
                Ok(())
            }
            (Some(Grad::Sparse(existing)), Grad::Sparse(new)) => {
                let mut indices = existing.indices();
                indices.extend(new.indices());
                let a = existing.values();
                let b = new.values();
                let mut sizes = a.sizes().to_vec();
                sizes[0] += b.sizes()[0];
                let merged = Tensor::zeros(&sizes, a.dtype(), a.device());
                merged.narrow(0, 0, a.sizes()[0])?.copy_from(&a)?;
                if b.sizes()[0] > 0 {
                    merged.narrow(0, a.sizes()[0], b.sizes()[0])?.copy_from(&b)?;
                }
                existing.replace_data(indices, merged)?;
                *slot = Some(Grad::Sparse(existing));
                Ok(())
            }
            (Some(existing), new) => {
                let reason = format!(
                    "cannot accumulate {} gradient onto {} gradient",
                    if new.is_sparse() { "sparse" } else { "dense" },
                    if existing.is_sparse() { "sparse" } else { "dense" },
                );
                *slot = Some(existing);
                Err(Error::GradientMismatch { reason })
            }
        }
    }

    /// Direct access to the gradient slot, for the engine's gradient
    /// mutation seam.
    pub(crate) fn with_grad_slot<R>(&self, f: impl FnOnce(&mut Option<Grad>) -> R) -> R {
        let mut slot = self
            .inner
            .grad
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut slot)
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.inner.id)
            .field("data", &self.inner.data)
            .field("requires_grad", &self.inner.requires_grad)
            .finish()
    }
}

type EngineCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// The engine-side callback queue.
///
/// The autograd engine runs queued callbacks on the main thread once the
/// backward pass has finished; the harness that drives backward calls
/// [`flush_callbacks`](Self::flush_callbacks) at that point.
#[derive(Default)]
pub struct Engine {
    callbacks: Mutex<Vec<EngineCallback>>,
}

impl Engine {
    pub fn new() -> Arc<Engine> {
        Arc::new(Engine::default())
    }

    /// Queue a callback to run after backward completes.
    pub fn queue_callback(&self, f: impl FnOnce() -> Result<()> + Send + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// Run all queued callbacks in order. Every callback runs even if an
    /// earlier one fails; the first error is returned.
    pub fn flush_callbacks(&self) -> Result<()> {
        let drained: Vec<EngineCallback> = {
            let mut cbs = self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cbs.drain(..).collect()
        };
        let mut first_err = None;
        for cb in drained {
            if let Err(e) = cb() {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
