//! Distributed-autograd context routing.
//!
//! Under a distributed (RPC-driven) backward pass, gradients are not
//! written to the variables' own grad slots but staged in a per-context
//! gradient map. The active context travels in a thread-local slot, set
//! around the backward pass by whoever drives it; the engine's post-hooks
//! capture it for later gradient mutation dispatch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::Variable;
use crate::tensor::Grad;

/// Per-backward-pass gradient staging area for distributed autograd.
#[derive(Default)]
pub struct DistAutogradContext {
    grads: Mutex<HashMap<u64, Grad>>,
}

impl DistAutogradContext {
    pub fn new() -> Arc<DistAutogradContext> {
        Arc::new(DistAutogradContext::default())
    }

    /// Run a gradient mutation against this context's map instead of the
    /// variable's own grad slot.
    pub fn run_grad_callback_for_variable<R>(
        &self,
        variable: &Variable,
        cb: impl FnOnce(&mut Option<Grad>) -> R,
    ) -> R {
        let mut grads = self.grads.lock().unwrap_or_else(PoisonError::into_inner);
        let mut slot = grads.remove(&variable.id());
        let out = cb(&mut slot);
        if let Some(grad) = slot {
            grads.insert(variable.id(), grad);
        }
        out
    }

    /// The gradient staged for `variable`, if any.
    pub fn grad(&self, variable: &Variable) -> Option<Grad> {
        self.grads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&variable.id())
            .cloned()
    }

    /// Install this context as the thread's current one until the guard
    /// drops.
    pub fn enter(self: &Arc<Self>) -> ContextGuard {
        let prev = CURRENT.with(|c| c.replace(Some(Arc::clone(self))));
        ContextGuard { prev }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<DistAutogradContext>>> = const { RefCell::new(None) };
}

/// The calling thread's active distributed-autograd context, if any.
pub fn current_context() -> Option<Arc<DistAutogradContext>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Restores the previous thread-local context on drop.
pub struct ContextGuard {
    prev: Option<Arc<DistAutogradContext>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| c.replace(prev));
    }
}
