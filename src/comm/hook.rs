//! User-overridable communication for ready buckets.
//!
//! A registered [`CommHook`] replaces the default allreduce-then-average
//! step: each ready bucket's contents are handed to the hook, which returns
//! a future of the reduced result. Gradient compression and gossip-style
//! algorithms plug in here.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::tensor::Grad;

/// The contents of one ready bucket, one entry per model replica.
///
/// Dense buckets carry their flat contents tensor; a sparse-expecting
/// bucket carries the sparse gradient itself.
pub struct GradBucket {
    grads: Vec<Grad>,
}

impl GradBucket {
    pub fn new(grads: Vec<Grad>) -> GradBucket {
        GradBucket { grads }
    }

    pub fn grads(&self) -> &[Grad] {
        &self.grads
    }

    pub fn into_grads(self) -> Vec<Grad> {
        self.grads
    }
}

/// User-supplied replacement for the default allreduce/average step.
///
/// When a hook is registered the engine performs **no** world-size
/// division anywhere: not while copying gradients into bucket views, and
/// not on the in-place path once gradients alias their views. The future a
/// hook returns must therefore resolve to fully reduced (typically
/// already-averaged) tensors, one per replica; later iterations write
/// gradients straight through the bucket views rebuilt around that result.
///
/// Hooks are only supported for single-replica-per-process configurations
/// and can be registered once.
pub trait CommHook: Send {
    /// Launch communication for one ready bucket.
    fn run_hook(&mut self, bucket: GradBucket) -> HookFuture;
}

enum FutureState {
    Pending,
    Ready(Result<Vec<Grad>>),
    Taken,
}

struct FutureInner {
    state: Mutex<FutureState>,
    cv: Condvar,
}

/// A blocking future resolving to a reduced bucket, fulfilled through its
/// paired [`HookPromise`].
pub struct HookFuture {
    inner: Arc<FutureInner>,
}

/// Write side of a [`HookFuture`].
pub struct HookPromise {
    inner: Arc<FutureInner>,
}

impl HookFuture {
    /// An already-resolved future, for hooks that compute synchronously.
    pub fn ready(result: Result<Vec<Grad>>) -> HookFuture {
        HookFuture {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState::Ready(result)),
                cv: Condvar::new(),
            }),
        }
    }

    /// A promise/future pair; the promise side may be fulfilled from any
    /// thread.
    pub fn pair() -> (HookPromise, HookFuture) {
        let inner = Arc::new(FutureInner {
            state: Mutex::new(FutureState::Pending),
            cv: Condvar::new(),
        });
        (
            HookPromise {
                inner: Arc::clone(&inner),
            },
            HookFuture { inner },
        )
    }

    /// Block until the hook resolves and take its result.
    pub fn wait(self) -> Result<Vec<Grad>> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            match std::mem::replace(&mut *state, FutureState::Taken) {
                FutureState::Ready(result) => return result,
                FutureState::Taken => {
                    return Err(Error::CommunicationFailed {
                        op: "comm hook",
                        reason: "hook future waited on twice".to_string(),
                    })
                }
                FutureState::Pending => {
                    *state = FutureState::Pending;
                    state = self
                        .inner
                        .cv
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

impl HookPromise {
    /// Resolve the paired future.
    pub fn fulfill(self, result: Result<Vec<Grad>>) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *state = FutureState::Ready(result);
        self.inner.cv.notify_all();
    }
}
