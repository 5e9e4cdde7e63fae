//! Communication-hook override and backend-failure behavior.

mod common;

use std::sync::Arc;

use common::{dense_grad_values, grad_f32, run_backward, spawn_workers, zero_grads};
use syncr::{
    CommHook, DType, Device, Engine, Error, Grad, GradBucket, HookFuture, LocalProcessGroup,
    ProcessGroup, Reducer, ReducerOptions, SparseTensor, Tensor, Variable, Work,
};

/// A hook that performs the default reduction by hand: allreduce the flat
/// bucket, then average. The engine performs no division when a hook is
/// registered, so the hook owns it end to end.
struct AveragingHook {
    pg: Arc<LocalProcessGroup>,
}

impl CommHook for AveragingHook {
    fn run_hook(&mut self, bucket: GradBucket) -> HookFuture {
        let grads = bucket.into_grads();
        let result = (|| {
            let mut tensors = Vec::new();
            for g in &grads {
                match g {
                    Grad::Dense(t) => tensors.push(t.clone()),
                    Grad::Sparse(_) => {
                        return Err(Error::GradientMismatch {
                            reason: "this hook only handles dense buckets".to_string(),
                        })
                    }
                }
            }
            self.pg.allreduce(&tensors)?.wait()?;
            for t in &tensors {
                t.div_scalar_(self.pg.size() as f64)?;
            }
            Ok(grads)
        })();
        HookFuture::ready(result)
    }
}

#[test]
fn test_averaging_hook_matches_default_reduction() {
    let results = spawn_workers(2, |rank, pg| {
        let pg = Arc::new(pg);
        let params = vec![Variable::parameter(Tensor::zeros(
            &[2],
            DType::F32,
            Device::Cpu,
        ))];
        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            vec![vec![0]],
            Arc::clone(&pg) as Arc<dyn ProcessGroup>,
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default(),
        )
        .unwrap();
        reducer
            .register_comm_hook(Box::new(AveragingHook { pg: Arc::clone(&pg) }))
            .unwrap();

        // Two iterations: the first copies into the bucket view, the
        // second goes through the aliased in-place path. Neither may be
        // divided by the engine.
        let mut out = Vec::new();
        for step in 0..2 {
            if step > 0 {
                reducer.prepare_forward().unwrap();
                zero_grads(&params);
            }
            reducer.prepare_for_backward(&[]).unwrap();
            let g = grad_f32(&[(rank as f32 + 1.0) * 2.0, 0.0], &[2]);
            run_backward(&engine, &[(params[0].clone(), g)]).unwrap();
            out.push(dense_grad_values(&params[0]));
        }
        out
    });

    // (2 + 4) / 2 = 3 on both workers, on both iterations.
    for out in results {
        assert_eq!(out, vec![vec![3.0, 0.0], vec![3.0, 0.0]]);
    }
}

/// A hook resolving from another thread through the promise side.
struct DeferredHook;

impl CommHook for DeferredHook {
    fn run_hook(&mut self, bucket: GradBucket) -> HookFuture {
        let (promise, future) = HookFuture::pair();
        std::thread::spawn(move || {
            promise.fulfill(Ok(bucket.into_grads()));
        });
        future
    }
}

#[test]
fn test_deferred_hook_future() {
    let params = vec![Variable::parameter(Tensor::zeros(
        &[2],
        DType::F32,
        Device::Cpu,
    ))];
    let engine = Engine::new();
    let reducer = Reducer::new(
        vec![params.clone()],
        vec![vec![0]],
        Arc::new(syncr::NoopProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();
    reducer.register_comm_hook(Box::new(DeferredHook)).unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    run_backward(&engine, &[(params[0].clone(), grad_f32(&[5.0, 9.0], &[2]))]).unwrap();
    assert_eq!(dense_grad_values(&params[0]), vec![5.0, 9.0]);
}

struct ReadyWork;

impl Work for ReadyWork {
    fn wait(self: Box<Self>) -> syncr::Result<()> {
        Ok(())
    }
}

struct FailingWork;

impl Work for FailingWork {
    fn wait(self: Box<Self>) -> syncr::Result<()> {
        Err(Error::CommunicationFailed {
            op: "allreduce",
            reason: "injected backend failure".to_string(),
        })
    }
}

/// World-size-1 group whose dense allreduce fails at wait time.
struct FailingGroup;

impl ProcessGroup for FailingGroup {
    fn broadcast(&self, _tensors: &[Tensor]) -> syncr::Result<Box<dyn Work>> {
        Ok(Box::new(ReadyWork))
    }

    fn allreduce(&self, _tensors: &[Tensor]) -> syncr::Result<Box<dyn Work>> {
        Ok(Box::new(FailingWork))
    }

    fn allreduce_sparse(&self, _tensors: &[SparseTensor]) -> syncr::Result<Box<dyn Work>> {
        Ok(Box::new(ReadyWork))
    }

    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

#[test]
fn test_backend_failure_surfaces_and_state_recovers() {
    let params = vec![Variable::parameter(Tensor::zeros(
        &[2],
        DType::F32,
        Device::Cpu,
    ))];
    let engine = Engine::new();
    let reducer = Reducer::new(
        vec![params.clone()],
        vec![vec![0]],
        Arc::new(FailingGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    // The failure surfaces on the caller's thread, out of finalize.
    let err = run_backward(&engine, &[(params[0].clone(), grad_f32(&[1.0, 1.0], &[2]))])
        .unwrap_err();
    assert!(err.to_string().contains("injected backend failure"));

    // State was reset before the error propagated: the next step's
    // preflight passes.
    reducer.prepare_for_backward(&[]).unwrap();
    run_backward(&engine, &[(params[0].clone(), grad_f32(&[1.0, 1.0], &[2])) ]).unwrap_err();
    engine.flush_callbacks().unwrap();
}

#[test]
fn test_failing_hook_future_propagates() {
    struct FailingHook;
    impl CommHook for FailingHook {
        fn run_hook(&mut self, _bucket: GradBucket) -> HookFuture {
            HookFuture::ready(Err(Error::CommunicationFailed {
                op: "comm hook",
                reason: "compression blew up".to_string(),
            }))
        }
    }

    let params = vec![Variable::parameter(Tensor::zeros(
        &[2],
        DType::F32,
        Device::Cpu,
    ))];
    let engine = Engine::new();
    let reducer = Reducer::new(
        vec![params.clone()],
        vec![vec![0]],
        Arc::new(syncr::NoopProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();
    reducer.register_comm_hook(Box::new(FailingHook)).unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    let err = run_backward(&engine, &[(params[0].clone(), grad_f32(&[1.0, 1.0], &[2]))])
        .unwrap_err();
    assert!(err.to_string().contains("compression blew up"));
    // Clean preflight afterwards.
    reducer.prepare_for_backward(&[]).unwrap();
}
