//! End-to-end reduction scenarios over in-process worker groups.

mod common;

use std::sync::{Arc, Mutex};

use common::{dense_grad_values, grad_f32, run_backward, spawn_workers, zero_grads};
use syncr::{
    compute_bucket_assignment_by_size, DType, Device, Engine, Grad, LocalProcessGroup,
    ProcessGroup, Reducer, ReducerOptions, SparseTensor, Tensor, Variable,
};

fn params_of(shapes: &[&[usize]]) -> Vec<Variable> {
    shapes
        .iter()
        .map(|s| Variable::parameter(Tensor::zeros(s, DType::F32, Device::Cpu)))
        .collect()
}

#[test]
fn test_two_dense_params_average_across_two_workers() {
    let results = spawn_workers(2, |rank, pg| {
        let params = params_of(&[&[4], &[2, 2]]);
        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            vec![vec![0, 1]],
            Arc::new(pg),
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default(),
        )
        .unwrap();

        reducer.prepare_for_backward(&[]).unwrap();
        let (g0, g1) = if rank == 0 {
            (grad_f32(&[1.0; 4], &[4]), grad_f32(&[2.0; 4], &[2, 2]))
        } else {
            (grad_f32(&[3.0; 4], &[4]), grad_f32(&[4.0; 4], &[2, 2]))
        };
        run_backward(
            &engine,
            &[(params[0].clone(), g0), (params[1].clone(), g1)],
        )
        .unwrap();

        (dense_grad_values(&params[0]), dense_grad_values(&params[1]))
    });

    for (p0, p1) in results {
        assert_eq!(p0, vec![2.0, 2.0, 2.0, 2.0]);
        assert_eq!(p1, vec![3.0, 3.0, 3.0, 3.0]);
    }
}

#[test]
fn test_averaging_law_three_workers() {
    let results = spawn_workers(3, |rank, pg| {
        let params = params_of(&[&[2]]);
        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            vec![vec![0]],
            Arc::new(pg),
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default(),
        )
        .unwrap();

        reducer.prepare_for_backward(&[]).unwrap();
        let g = grad_f32(&[(rank + 1) as f32, 0.0], &[2]);
        run_backward(&engine, &[(params[0].clone(), g)]).unwrap();
        dense_grad_values(&params[0])
    });

    // (1 + 2 + 3) / 3 = 2
    for values in results {
        assert_eq!(values, vec![2.0, 0.0]);
    }
}

#[test]
fn test_initial_assignment_matches_planner() {
    // Six 10-element f32 tensors against a 40-byte first limit and an
    // 80-byte steady-state cap.
    let params = params_of(&[&[10][..]; 6]);
    let datas: Vec<Tensor> = params.iter().map(|p| p.data().clone()).collect();
    let assignment = compute_bucket_assignment_by_size(&datas, &[40, 80], &[], &[]).unwrap();
    assert_eq!(assignment, vec![vec![0], vec![1, 2], vec![3, 4], vec![5]]);

    let engine = Engine::new();
    let reducer = Reducer::new(
        vec![params],
        assignment.clone(),
        Arc::new(syncr::NoopProcessGroup),
        Vec::new(),
        engine,
        ReducerOptions::default(),
    )
    .unwrap();
    assert_eq!(reducer.bucket_indices().unwrap(), assignment);
}

#[test]
fn test_rebuild_syncs_rank_zero_order() {
    let results = spawn_workers(2, |rank, pg| {
        let params = params_of(&[&[1], &[1], &[1], &[1]]);
        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            vec![vec![0, 1, 2, 3]],
            Arc::new(pg),
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default(),
        )
        .unwrap();

        // Iteration 1: the two workers observe different ready orders.
        let order: Vec<usize> = if rank == 0 {
            vec![3, 0, 1, 2]
        } else {
            vec![0, 1, 2, 3]
        };
        reducer.prepare_for_backward(&[]).unwrap();
        let ready: Vec<(Variable, Grad)> = order
            .iter()
            .map(|&i| (params[i].clone(), grad_f32(&[1.0], &[1])))
            .collect();
        run_backward(&engine, &ready).unwrap();

        // Prior to iteration 2 the buckets are rebuilt and rank 0's
        // layout wins everywhere.
        reducer.prepare_forward().unwrap();
        let layout = reducer.bucket_indices().unwrap();

        // Iteration 2 still reduces correctly over the new buckets.
        zero_grads(&params);
        reducer.prepare_for_backward(&[]).unwrap();
        let ready: Vec<(Variable, Grad)> = (0..4)
            .map(|i| (params[i].clone(), grad_f32(&[(rank + 1) as f32], &[1])))
            .collect();
        run_backward(&engine, &ready).unwrap();
        let grads: Vec<Vec<f32>> = params.iter().map(dense_grad_values).collect();

        (layout, grads)
    });

    let (layout0, grads0) = &results[0];
    let (layout1, grads1) = &results[1];
    assert_eq!(layout0, &vec![vec![3, 0, 1, 2]]);
    assert_eq!(layout0, layout1);
    // (1 + 2) / 2 = 1.5 for every parameter on both workers.
    for grads in [grads0, grads1] {
        for g in grads {
            assert_eq!(g, &vec![1.5]);
        }
    }
}

#[test]
fn test_unused_parameter_untouched_on_all_workers() {
    let results = spawn_workers(2, |_rank, pg| {
        let params = params_of(&[&[1], &[1]]);
        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            vec![vec![0, 1]],
            Arc::new(pg),
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default().with_find_unused_parameters(true),
        )
        .unwrap();

        // Only P0 participates in the loss on either worker.
        let output = Variable::with_grad_fn(
            Tensor::zeros(&[1], DType::F32, Device::Cpu),
            syncr::Node::new(vec![params[0].grad_accumulator()]),
        );
        reducer.prepare_for_backward(&[output]).unwrap();
        run_backward(&engine, &[(params[0].clone(), grad_f32(&[1.0], &[1]))]).unwrap();

        (dense_grad_values(&params[0]), params[1].grad().is_none())
    });

    for (p0, p1_undefined) in results {
        assert_eq!(p0, vec![1.0]);
        assert!(p1_undefined);
    }
}

#[test]
fn test_locally_unused_but_globally_used_parameter() {
    let results = spawn_workers(2, |rank, pg| {
        let params = params_of(&[&[1], &[1]]);
        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            vec![vec![0, 1]],
            Arc::new(pg),
            Vec::new(),
            Arc::clone(&engine),
            ReducerOptions::default().with_find_unused_parameters(true),
        )
        .unwrap();

        // P1 participates only on worker 0.
        let mut edges = vec![params[0].grad_accumulator()];
        if rank == 0 {
            edges.push(params[1].grad_accumulator());
        }
        let output = Variable::with_grad_fn(
            Tensor::zeros(&[1], DType::F32, Device::Cpu),
            syncr::Node::new(edges),
        );
        reducer.prepare_for_backward(&[output]).unwrap();

        let mut ready = vec![(params[0].clone(), grad_f32(&[2.0], &[1]))];
        if rank == 0 {
            ready.push((params[1].clone(), grad_f32(&[4.0], &[1])));
        }
        run_backward(&engine, &ready).unwrap();

        (dense_grad_values(&params[0]), dense_grad_values(&params[1]))
    });

    for (p0, p1) in results {
        assert_eq!(p0, vec![2.0]);
        // Worker 0 contributed 4.0, worker 1 contributed nothing; the
        // average lands on both workers because P1 was used somewhere.
        assert_eq!(p1, vec![2.0]);
    }
}

#[test]
fn test_sparse_embedding_with_dense_params() {
    let results = spawn_workers(2, |rank, pg| {
        let embedding = Variable::parameter(Tensor::zeros(&[4, 2], DType::F32, Device::Cpu));
        let p1 = Variable::parameter(Tensor::zeros(&[2], DType::F32, Device::Cpu));
        let p2 = Variable::parameter(Tensor::zeros(&[2], DType::F32, Device::Cpu));
        let params = vec![embedding.clone(), p1.clone(), p2.clone()];
        let expect_sparse = vec![true, false, false];

        let datas: Vec<Tensor> = params.iter().map(|p| p.data().clone()).collect();
        let assignment =
            compute_bucket_assignment_by_size(&datas, &[1 << 20], &expect_sparse, &[]).unwrap();
        // The sparse-expecting embedding sits alone regardless of size.
        assert_eq!(assignment, vec![vec![0], vec![1, 2]]);

        let engine = Engine::new();
        let reducer = Reducer::new(
            vec![params.clone()],
            assignment,
            Arc::new(pg),
            vec![expect_sparse.clone()],
            Arc::clone(&engine),
            ReducerOptions::default(),
        )
        .unwrap();

        reducer.prepare_for_backward(&[]).unwrap();
        let base = (rank as f32) * 2.0;
        let sparse = SparseTensor::new(
            vec![1],
            Tensor::from_slice(&[1.0 + base, 1.0 + base], &[1, 2], Device::Cpu),
            &[4, 2],
        )
        .unwrap();
        // Dense buckets become ready before the sparse bucket; dispatch
        // still goes out in bucket-index order.
        run_backward(
            &engine,
            &[
                (p1.clone(), grad_f32(&[1.0 + base, 1.0 + base], &[2])),
                (p2.clone(), grad_f32(&[2.0 + base, 2.0 + base], &[2])),
                (embedding.clone(), Grad::Sparse(sparse)),
            ],
        )
        .unwrap();

        let embedding_dense = match embedding.grad().unwrap() {
            Grad::Sparse(s) => s.to_dense().unwrap().to_vec::<f32>().unwrap(),
            Grad::Dense(_) => panic!("expected sparse gradient"),
        };
        (
            embedding_dense,
            dense_grad_values(&p1),
            dense_grad_values(&p2),
        )
    });

    for (emb, p1, p2) in results {
        // Row 1 averages (1 + 3) / 2 = 2 on both workers.
        assert_eq!(emb, vec![0.0, 0.0, 2.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(p1, vec![2.0, 2.0]);
        assert_eq!(p2, vec![3.0, 3.0]);
    }
}

/// Process-group wrapper recording the composition of every collective.
struct RecordingGroup {
    inner: LocalProcessGroup,
    log: Arc<Mutex<Vec<String>>>,
}

impl ProcessGroup for RecordingGroup {
    fn broadcast(&self, tensors: &[Tensor]) -> syncr::Result<Box<dyn syncr::Work>> {
        self.record("broadcast", tensors);
        self.inner.broadcast(tensors)
    }

    fn allreduce(&self, tensors: &[Tensor]) -> syncr::Result<Box<dyn syncr::Work>> {
        self.record("allreduce", tensors);
        self.inner.allreduce(tensors)
    }

    fn allreduce_sparse(
        &self,
        tensors: &[SparseTensor],
    ) -> syncr::Result<Box<dyn syncr::Work>> {
        let entry = format!(
            "allreduce_sparse[{}]",
            tensors
                .iter()
                .map(|t| t.nnz().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        self.log.lock().unwrap().push(entry);
        self.inner.allreduce_sparse(tensors)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn rank(&self) -> usize {
        self.inner.rank()
    }
}

impl RecordingGroup {
    fn record(&self, op: &str, tensors: &[Tensor]) {
        let entry = format!(
            "{op}[{}]",
            tensors
                .iter()
                .map(|t| format!("{}x{}", t.dtype(), t.numel()))
                .collect::<Vec<_>>()
                .join(",")
        );
        self.log.lock().unwrap().push(entry);
    }
}

#[test]
fn test_collective_sequence_deterministic_across_runs() {
    let run_once = || {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker_log = Arc::clone(&log);
        spawn_workers(2, move |rank, pg| {
            let params = params_of(&[&[8], &[8], &[4]]);
            let engine = Engine::new();
            let group = RecordingGroup {
                inner: pg,
                log: if rank == 0 {
                    Arc::clone(&worker_log)
                } else {
                    Arc::new(Mutex::new(Vec::new()))
                },
            };
            let reducer = Reducer::new(
                vec![params.clone()],
                vec![vec![0, 1], vec![2]],
                Arc::new(group),
                Vec::new(),
                Arc::clone(&engine),
                ReducerOptions::default(),
            )
            .unwrap();

            reducer.prepare_for_backward(&[]).unwrap();
            run_backward(
                &engine,
                &[
                    (params[2].clone(), grad_f32(&[1.0; 4], &[4])),
                    (params[0].clone(), grad_f32(&[1.0; 8], &[8])),
                    (params[1].clone(), grad_f32(&[1.0; 8], &[8])),
                ],
            )
            .unwrap();
        });
        Arc::try_unwrap(log).unwrap().into_inner().unwrap()
    };

    let first = run_once();
    let second = run_once();
    assert_eq!(first, second);
    // One construction-time broadcast, then the buckets in index order
    // even though bucket 1's gradients arrived first.
    assert_eq!(
        first,
        vec![
            "broadcast[i64x6]".to_string(),
            "allreduce[f32x16]".to_string(),
            "allreduce[f32x4]".to_string(),
        ]
    );
}

#[test]
fn test_bucket_views_match_param_layouts() {
    // Invariant: for dense, non-overlapping params the grad settles on a
    // view with the param's exact sizes and strides.
    let params = params_of(&[&[2, 3], &[4]]);
    let engine = Engine::new();
    let reducer = Reducer::new(
        vec![params.clone()],
        vec![vec![0, 1]],
        Arc::new(syncr::NoopProcessGroup),
        Vec::new(),
        Arc::clone(&engine),
        ReducerOptions::default(),
    )
    .unwrap();

    reducer.prepare_for_backward(&[]).unwrap();
    run_backward(
        &engine,
        &[
            (params[0].clone(), grad_f32(&[1.0; 6], &[2, 3])),
            (params[1].clone(), grad_f32(&[1.0; 4], &[4])),
        ],
    )
    .unwrap();

    for p in &params {
        match p.grad().unwrap() {
            Grad::Dense(g) => {
                assert_eq!(g.sizes(), p.sizes());
                assert_eq!(g.strides(), p.strides());
            }
            Grad::Sparse(_) => panic!("expected dense"),
        }
    }
}
