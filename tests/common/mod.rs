//! Multi-worker test harness.
//!
//! Runs one simulated worker per thread, each with its own replica,
//! Reducer, and engine, all connected through an in-process
//! `LocalProcessGroup`. The harness plays the autograd engine's part:
//! accumulate a gradient, fire the accumulator's post-hooks, and flush the
//! engine's callback queue once "backward" is done.

use std::sync::Arc;

use syncr::{Engine, Grad, LocalProcessGroup, Tensor, Variable};

/// Run `worker` once per rank on its own thread and collect the results.
///
/// Panics (failing the test) if any worker panics.
pub fn spawn_workers<R, F>(world: usize, worker: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(usize, LocalProcessGroup) -> R + Send + Sync + 'static,
{
    let worker = Arc::new(worker);
    let handles: Vec<_> = LocalProcessGroup::group(world)
        .into_iter()
        .enumerate()
        .map(|(rank, pg)| {
            let worker = Arc::clone(&worker);
            std::thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || worker(rank, pg))
                .expect("spawn worker thread")
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect()
}

/// Simulate one backward pass: gradients arrive in `ready` order, each
/// firing its variable's post-hooks, then the engine's queued callbacks
/// (the Reducer's finalize) run.
pub fn run_backward(engine: &Engine, ready: &[(Variable, Grad)]) -> syncr::Result<()> {
    for (variable, grad) in ready {
        variable.accumulate_grad(grad.clone())?;
        variable.grad_accumulator().fire_post_hooks()?;
    }
    engine.flush_callbacks()
}

/// Zero every dense gradient in place, optimizer-style, preserving the
/// bucket-view aliasing.
pub fn zero_grads(params: &[Variable]) {
    for p in params {
        if let Some(Grad::Dense(g)) = p.grad() {
            g.zero_();
        }
    }
}

pub fn grad_f32(vals: &[f32], sizes: &[usize]) -> Grad {
    Grad::Dense(Tensor::from_slice(vals, sizes, syncr::Device::Cpu))
}

pub fn dense_grad_values(variable: &Variable) -> Vec<f32> {
    match variable.grad().expect("gradient should be defined") {
        Grad::Dense(g) => g.to_vec::<f32>().expect("f32 gradient"),
        Grad::Sparse(_) => panic!("expected a dense gradient"),
    }
}
