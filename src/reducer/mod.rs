//! Gradient reduction engine for distributed data-parallel training.
//!
//! The [`Reducer`] sits between the autograd engine and the collective
//! backend. Per-parameter gradients arrive through post-hooks as backward
//! runs; each is copied (averaged) into its bucket view, and whenever a
//! bucket's last gradient lands and all lower-index buckets are already in
//! flight, the bucket's flat buffer is submitted to the backend. A
//! finalize callback queued on the autograd engine waits out the
//! collectives and leaves every gradient aliased to its bucket view.

mod assignment;
mod bucket;
mod rebuild;

pub use assignment::compute_bucket_assignment_by_size;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock, PoisonError, Weak};
use std::time::Instant;

use crate::autograd::{self, DistAutogradContext, Engine, Node, Variable};
use crate::comm::{CommHook, GradBucket, ProcessGroup, Work};
use crate::error::{Error, Result};
use crate::tensor::{DType, Device, Grad, Tensor};

use bucket::{
    initialize_bucket_views, initialize_buckets, run_grad_callback, Bucket, Contents,
    PendingReduction, VariableIndex, VariableLocator,
};

/// Default steady-state bucket size cap: 25 MiB.
pub const DEFAULT_BUCKET_BYTES_CAP: usize = 25 * 1024 * 1024;

/// Size limit of the first bucket: 1 MiB. Kept small so the first
/// collective fires early and overlaps with the rest of backward.
pub const DEFAULT_FIRST_BUCKET_BYTES: usize = 1024 * 1024;

/// Reducer configuration.
#[derive(Debug, Clone)]
pub struct ReducerOptions {
    /// Steady-state bucket size cap in bytes.
    pub bucket_bytes_cap: usize,
    /// Detect parameters that do not participate in producing the loss and
    /// resolve their global consensus each step.
    pub find_unused_parameters: bool,
}

impl Default for ReducerOptions {
    fn default() -> Self {
        Self {
            bucket_bytes_cap: DEFAULT_BUCKET_BYTES_CAP,
            find_unused_parameters: false,
        }
    }
}

impl ReducerOptions {
    pub fn with_bucket_bytes_cap(mut self, cap: usize) -> Self {
        self.bucket_bytes_cap = cap;
        self
    }

    pub fn with_find_unused_parameters(mut self, find: bool) -> Self {
        self.find_unused_parameters = find;
        self
    }
}

static GRAD_LAYOUT_WARN: Once = Once::new();

struct ReducerState {
    buckets: Vec<Bucket>,
    variable_locators: Vec<VariableLocator>,
    expect_autograd_hooks: bool,
    require_finalize: bool,
    /// Lowest bucket index whose collective has not been dispatched yet.
    next_bucket: usize,
    has_marked_unused_parameters: bool,
    unused_parameters: Vec<VariableIndex>,
    /// Host-side per-replica participation maps (length V, 0/1 entries).
    local_used_maps: Vec<Tensor>,
    /// Device-side copies reduced across workers for global consensus.
    local_used_maps_dev: Vec<Tensor>,
    local_used_work: Option<Box<dyn Work>>,
    local_used_maps_reduced: bool,
    backward_stats: Vec<Vec<u64>>,
    backward_stats_base: Option<Instant>,
    has_rebuilt_bucket: bool,
    rebuilt_params: Vec<Variable>,
    rebuilt_param_indices: Vec<usize>,
    comm_hook: Option<Box<dyn CommHook>>,
    rpc_context: Option<Arc<DistAutogradContext>>,
}

/// The gradient reduction engine. One instance per model-replica group,
/// alive for the whole training run.
pub struct Reducer {
    replicas: Vec<Vec<Variable>>,
    process_group: Arc<dyn ProcessGroup>,
    engine: Arc<Engine>,
    expect_sparse_gradients: Vec<Vec<bool>>,
    find_unused_parameters: bool,
    bucket_bytes_cap: usize,
    /// Accumulator node id to variable index, for autograd graph
    /// traversal during unused-parameter discovery.
    func: HashMap<u64, VariableIndex>,
    /// Strong references keeping the accumulator nodes (and thus their
    /// ids) alive.
    grad_accumulators: Vec<Vec<Arc<Node>>>,
    hooks: Mutex<Vec<(u64, Arc<Node>)>>,
    weak_self: OnceLock<Weak<Reducer>>,
    state: Mutex<ReducerState>,
}

impl Reducer {
    /// Construct the engine over `replicas` with an initial bucket
    /// assignment.
    ///
    /// Verifies that corresponding parameters agree across replicas within
    /// this process and, by broadcasting replica 0's layout metadata from
    /// rank 0, across processes. Registers a post-hook on every
    /// parameter's gradient accumulator; hooks are removed again when the
    /// Reducer is dropped.
    ///
    /// # Arguments
    ///
    /// * `replicas` - One parameter list per model replica hosted in this
    ///   process (usually one).
    /// * `bucket_indices` - Initial assignment, typically from
    ///   [`compute_bucket_assignment_by_size`].
    /// * `process_group` - The collective backend.
    /// * `expect_sparse_gradients` - Per-replica sparse flags; may be
    ///   empty (no sparse gradients expected).
    /// * `engine` - The autograd binding used to queue the finalize
    ///   callback.
    pub fn new(
        replicas: Vec<Vec<Variable>>,
        bucket_indices: Vec<Vec<usize>>,
        process_group: Arc<dyn ProcessGroup>,
        expect_sparse_gradients: Vec<Vec<bool>>,
        engine: Arc<Engine>,
        options: ReducerOptions,
    ) -> Result<Arc<Reducer>> {
        if replicas.is_empty() {
            return Err(Error::VerificationFailed {
                reason: "expected at least one model replica".to_string(),
            });
        }
        if replicas[0].is_empty() {
            return Err(Error::VerificationFailed {
                reason: "expected at least one parameter".to_string(),
            });
        }
        let expect_sparse_gradients = if expect_sparse_gradients.is_empty() {
            replicas
                .iter()
                .map(|r| vec![false; r.len()])
                .collect::<Vec<_>>()
        } else {
            if expect_sparse_gradients.len() != replicas.len() {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "expected sparse-gradient flags for {} replicas, got {}",
                        replicas.len(),
                        expect_sparse_gradients.len()
                    ),
                });
            }
            expect_sparse_gradients
        };

        verify_replicas_within_process(&replicas, &expect_sparse_gradients)?;
        verify_replica0_across_processes(&replicas, process_group.as_ref())?;

        let rpc_context = autograd::current_context();
        let (buckets, variable_locators) = initialize_buckets(
            &replicas,
            &expect_sparse_gradients,
            bucket_indices,
            &rpc_context,
            false,
        )?;

        // The accumulator node is lazily initialized once, so its presence
        // in a backward graph is evidence the parameter participated.
        let mut func = HashMap::new();
        let mut grad_accumulators = Vec::with_capacity(replicas.len());
        for (replica_index, replica) in replicas.iter().enumerate() {
            let mut accumulators = Vec::with_capacity(replica.len());
            for (variable_index, variable) in replica.iter().enumerate() {
                let accumulator = variable.grad_accumulator();
                func.insert(
                    accumulator.id(),
                    VariableIndex {
                        replica_index,
                        variable_index,
                    },
                );
                accumulators.push(accumulator);
            }
            grad_accumulators.push(accumulators);
        }

        let replica_count = replicas.len();
        let variable_count = replicas[0].len();
        let (local_used_maps, local_used_maps_dev) = if options.find_unused_parameters {
            let mut host = Vec::with_capacity(replica_count);
            let mut dev = Vec::with_capacity(replica_count);
            for replica in &replicas {
                host.push(Tensor::zeros(&[variable_count], DType::I32, Device::Cpu));
                // The consensus allreduce runs on the replica's device;
                // backends may not accept host tensors.
                dev.push(Tensor::zeros(
                    &[variable_count],
                    DType::I32,
                    replica[0].device(),
                ));
            }
            (host, dev)
        } else {
            (Vec::new(), Vec::new())
        };

        let reducer = Arc::new(Reducer {
            replicas,
            process_group,
            engine,
            expect_sparse_gradients,
            find_unused_parameters: options.find_unused_parameters,
            bucket_bytes_cap: options.bucket_bytes_cap,
            func,
            grad_accumulators,
            hooks: Mutex::new(Vec::new()),
            weak_self: OnceLock::new(),
            state: Mutex::new(ReducerState {
                buckets,
                variable_locators,
                expect_autograd_hooks: false,
                require_finalize: false,
                next_bucket: 0,
                has_marked_unused_parameters: false,
                unused_parameters: Vec::new(),
                local_used_maps,
                local_used_maps_dev,
                local_used_work: None,
                local_used_maps_reduced: false,
                backward_stats: vec![vec![0; variable_count]; replica_count],
                backward_stats_base: None,
                has_rebuilt_bucket: false,
                rebuilt_params: Vec::new(),
                rebuilt_param_indices: Vec::new(),
                comm_hook: None,
                rpc_context,
            }),
        });
        let _ = reducer.weak_self.set(Arc::downgrade(&reducer));
        reducer.register_hooks()?;
        Ok(reducer)
    }

    fn register_hooks(self: &Arc<Self>) -> Result<()> {
        let mut hooks = self
            .hooks
            .lock()
            .map_err(|_| Error::LockPoisoned("reducer hooks"))?;
        for (replica_index, accumulators) in self.grad_accumulators.iter().enumerate() {
            for (variable_index, accumulator) in accumulators.iter().enumerate() {
                let index = VariableIndex {
                    replica_index,
                    variable_index,
                };
                let weak = Arc::downgrade(self);
                let key = accumulator.add_post_hook(Box::new(move || match weak.upgrade() {
                    Some(reducer) => reducer.autograd_hook(index),
                    None => Ok(()),
                }));
                hooks.push((key, Arc::clone(accumulator)));
            }
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, ReducerState>> {
        self.state
            .lock()
            .map_err(|_| Error::LockPoisoned("reducer state"))
    }

    fn weak(&self) -> Weak<Reducer> {
        self.weak_self.get().cloned().unwrap_or_default()
    }

    /// Number of buckets in the current assignment.
    pub fn num_buckets(&self) -> Result<usize> {
        Ok(self.state()?.buckets.len())
    }

    /// The current bucket assignment: variable indices per bucket, in
    /// dispatch order.
    pub fn bucket_indices(&self) -> Result<Vec<Vec<usize>>> {
        Ok(self
            .state()?
            .buckets
            .iter()
            .map(|b| b.variable_indices.clone())
            .collect())
    }

    /// Per-replica, per-variable nanoseconds from step start to
    /// gradient-ready, for profiling.
    pub fn backward_stats(&self) -> Result<Vec<Vec<u64>>> {
        Ok(self.state()?.backward_stats.clone())
    }

    /// Register a communication hook. May be called once, and only for
    /// single-replica-per-process configurations.
    pub fn register_comm_hook(&self, hook: Box<dyn CommHook>) -> Result<()> {
        let mut st = self.state()?;
        if st.comm_hook.is_some() {
            return Err(Error::ProtocolViolation {
                reason: "a communication hook can only be registered once".to_string(),
            });
        }
        if self.replicas.len() != 1 {
            return Err(Error::ProtocolViolation {
                reason: "communication hooks do not support single-process multiple-device mode"
                    .to_string(),
            });
        }
        st.comm_hook = Some(hook);
        Ok(())
    }

    /// Call before every forward pass after the first backward has
    /// completed: applies the bucket rebuild learned from the observed
    /// gradient-ready order, if one is due.
    pub fn prepare_forward(&self) -> Result<()> {
        let mut st = self.state()?;
        self.rebuild_buckets(&mut st)
    }

    /// Call after every forward pass, before backward.
    ///
    /// Resets per-step accounting, arms the autograd hooks, and, when
    /// unused-parameter detection is on, walks the autograd graph from
    /// `outputs` to find parameters that will not receive gradients this
    /// step.
    ///
    /// # Errors
    ///
    /// Fails if the previous step never finalized, which usually means
    /// some parameters or forward outputs did not participate in the loss.
    pub fn prepare_for_backward(&self, outputs: &[Variable]) -> Result<()> {
        let mut st = self.state()?;

        if st.require_finalize {
            return Err(Error::ProtocolViolation {
                reason: "expected to have finished reduction in the prior iteration before \
                         starting a new one. This indicates some parameters received gradients \
                         without the step finalizing: enable unused-parameter detection, or make \
                         sure all forward outputs participate in computing the loss"
                    .to_string(),
            });
        }

        st.expect_autograd_hooks = true;
        st.next_bucket = 0;
        st.backward_stats_base = Some(Instant::now());
        for bucket in &mut st.buckets {
            for replica in &mut bucket.replicas {
                replica.pending = replica.variables.len();
            }
            bucket.pending = bucket.replicas.len();
            bucket.reduction = None;
        }

        st.has_marked_unused_parameters = false;
        st.unused_parameters.clear();

        // Without unused detection every hook fires, so there is nothing
        // to search the graph for.
        if !self.find_unused_parameters {
            return Ok(());
        }

        let mut seen: HashSet<u64> = HashSet::new();
        let mut queue: Vec<Arc<Node>> = Vec::new();
        for output in outputs {
            if let Some(grad_fn) = output.grad_fn() {
                if seen.insert(grad_fn.id()) {
                    queue.push(Arc::clone(grad_fn));
                }
            }
        }
        while let Some(node) = queue.pop() {
            for edge in node.next_edges() {
                if seen.insert(edge.id()) {
                    queue.push(Arc::clone(edge));
                }
            }
        }

        // Accumulators absent from the graph belong to parameters that
        // will not produce a gradient this step.
        st.unused_parameters = self
            .func
            .iter()
            .filter(|(id, _)| !seen.contains(id))
            .map(|(_, &index)| index)
            .collect();
        Ok(())
    }

    /// Post-accumulation hook body; runs on autograd worker threads.
    fn autograd_hook(&self, index: VariableIndex) -> Result<()> {
        let mut st = self.state()?;

        // Capture the calling thread's distributed-autograd context into
        // the shared slot for gradient mutation dispatch.
        st.rpc_context = autograd::current_context();

        if self.find_unused_parameters {
            // Idempotent write: during a no-sync session the same variable
            // may be set repeatedly, which is fine. Used once means used.
            st.local_used_maps[index.replica_index].set::<i32>(index.variable_index, 1)?;
        }

        // In a no-sync accumulation session hooks fire but nothing is
        // reduced.
        if !st.expect_autograd_hooks {
            return Ok(());
        }

        // First complete backward pass: record the true gradient arrival
        // order of replica 0, to recluster buckets before the next forward.
        if !st.has_rebuilt_bucket && !self.find_unused_parameters && index.replica_index == 0 {
            let variable = self.replicas[index.replica_index][index.variable_index].clone();
            st.rebuilt_params.push(variable);
            st.rebuilt_param_indices.push(index.variable_index);
        }

        // Parameters outside the output graph never get hooks; mark them
        // ready up front so their buckets can complete.
        if !st.has_marked_unused_parameters && self.find_unused_parameters {
            st.has_marked_unused_parameters = true;
            let unused = st.unused_parameters.clone();
            for unused_index in unused {
                self.mark_variable_ready(&mut st, unused_index)?;
            }
        }

        self.mark_variable_ready(&mut st, index)
    }

    fn mark_variable_ready(&self, st: &mut ReducerState, index: VariableIndex) -> Result<()> {
        let VariableIndex {
            replica_index,
            variable_index,
        } = index;
        if replica_index >= self.replicas.len() {
            return Err(Error::InvalidArgument {
                arg: "index",
                reason: format!("out of range replica index {replica_index}"),
            });
        }
        if variable_index >= st.variable_locators.len() {
            return Err(Error::InvalidArgument {
                arg: "index",
                reason: format!("out of range variable index {variable_index}"),
            });
        }

        if let Some(base) = st.backward_stats_base {
            st.backward_stats[replica_index][variable_index] = base.elapsed().as_nanos() as u64;
        }

        // Once anything is marked ready, a finalize call is owed before
        // the next step.
        st.require_finalize = true;

        let locator = st.variable_locators[variable_index];
        if st.buckets[locator.bucket_index].replicas[replica_index].pending == 0 {
            let common = "expected to mark a variable ready only once. This can be caused by \
                          (1) use of a module parameter outside the forward function, with the \
                          parameter shared across concurrent forward-backward passes, or (2) \
                          reused parameters across multiple reentrant backward passes, for \
                          example when the same model section is wrapped in checkpointing twice";
            let reason = if st.has_marked_unused_parameters {
                common.to_string()
            } else {
                format!(
                    "{common}, or (3) incorrect unused-parameter detection: a parameter absent \
                     from the forward output graph produced a gradient later in backward. If \
                     every parameter participates in backward, disable unused-parameter \
                     detection"
                )
            };
            return Err(Error::ProtocolViolation { reason });
        }

        if st.buckets[locator.bucket_index].expect_sparse_gradient {
            self.mark_variable_ready_sparse(st, index, locator)?;
        } else {
            self.mark_variable_ready_dense(st, index, locator)?;
        }

        let bucket = &mut st.buckets[locator.bucket_index];
        let replica = &mut bucket.replicas[replica_index];
        replica.pending -= 1;
        if replica.pending == 0 {
            bucket.pending -= 1;
            if bucket.pending == 0 {
                self.mark_bucket_ready(st, locator.bucket_index)?;
            }
        }

        // The final bucket just went out: start the used-map consensus and
        // queue the finalize callback onto the engine.
        if st.next_bucket == st.buckets.len() {
            if self.find_unused_parameters {
                for i in 0..st.local_used_maps.len() {
                    st.local_used_maps_dev[i].copy_from(&st.local_used_maps[i])?;
                }
                st.local_used_work = Some(self.process_group.allreduce(&st.local_used_maps_dev)?);
            }
            let weak = self.weak();
            self.engine.queue_callback(move || match weak.upgrade() {
                Some(reducer) => reducer.finalize_backward(),
                None => Ok(()),
            });
        }
        Ok(())
    }

    fn mark_variable_ready_dense(
        &self,
        st: &mut ReducerState,
        index: VariableIndex,
        locator: VariableLocator,
    ) -> Result<()> {
        let replica = &st.buckets[locator.bucket_index].replicas[index.replica_index];
        let variable = replica.variables[locator.intra_bucket_index].clone();
        let bucket_view = replica.bucket_views[locator.intra_bucket_index].clone();
        let rpc_context = st.rpc_context.clone();
        let world_size = self.process_group.size() as f64;
        let has_comm_hook = st.comm_hook.is_some();

        run_grad_callback(&rpc_context, &variable, |slot| -> Result<()> {
            match slot {
                Some(Grad::Dense(grad)) => {
                    if !grad.is_alias_of(&bucket_view) {
                        // First iteration, or the user reset the grad to
                        // None: copy into the view and retarget the grad so
                        // later iterations copy nothing.
                        if grad.dtype() != bucket_view.dtype() {
                            return Err(Error::DTypeMismatch {
                                expected: bucket_view.dtype(),
                                got: grad.dtype(),
                            });
                        }
                        if grad.device() != bucket_view.device() {
                            return Err(Error::GradientMismatch {
                                reason: format!(
                                    "gradient on {} but bucket on {}",
                                    grad.device(),
                                    bucket_view.device()
                                ),
                            });
                        }
                        if grad.numel() != bucket_view.numel() {
                            return Err(Error::GradientMismatch {
                                reason: format!(
                                    "gradient holds {} elements but its bucket view {}",
                                    grad.numel(),
                                    bucket_view.numel()
                                ),
                            });
                        }
                        if grad.strides() != bucket_view.strides() {
                            // Numerics stay correct (the copies transpose in
                            // and out of the view); only copy performance
                            // suffers.
                            GRAD_LAYOUT_WARN.call_once(|| {
                                tracing::warn!(
                                    grad_sizes = ?grad.sizes(),
                                    grad_strides = ?grad.strides(),
                                    view_sizes = ?bucket_view.sizes(),
                                    view_strides = ?bucket_view.strides(),
                                    "gradient strides do not match bucket view strides; the \
                                     gradient was not produced under the gradient layout \
                                     contract, or the parameter's layout changed after \
                                     construction"
                                );
                            });
                        }
                        if has_comm_hook {
                            // The hook owns averaging.
                            bucket_view.copy_from(grad)?;
                        } else {
                            // Divide while copying into the bucket view.
                            bucket_view.copy_scaled_from(grad, 1.0 / world_size)?;
                        }
                        *slot = Some(Grad::Dense(bucket_view.clone()));
                    } else if !has_comm_hook {
                        bucket_view.div_scalar_(world_size)?;
                    }
                    Ok(())
                }
                Some(Grad::Sparse(_)) => Err(Error::GradientMismatch {
                    reason: "expected a dense gradient for a variable in a dense bucket"
                        .to_string(),
                }),
                None => {
                    bucket_view.zero_();
                    Ok(())
                }
            }
        })
    }

    fn mark_variable_ready_sparse(
        &self,
        st: &mut ReducerState,
        index: VariableIndex,
        locator: VariableLocator,
    ) -> Result<()> {
        let replica = &st.buckets[locator.bucket_index].replicas[index.replica_index];
        let variable = replica.variables[locator.intra_bucket_index].clone();
        let rpc_context = st.rpc_context.clone();
        let world_size = self.process_group.size() as f64;
        let has_comm_hook = st.comm_hook.is_some();

        // Sparse gradients cannot be flattened into a shared buffer: the
        // bucket's contents become the gradient itself.
        let sparse = run_grad_callback(&rpc_context, &variable, |slot| match slot {
            Some(Grad::Sparse(grad)) => {
                if !has_comm_hook {
                    grad.div_scalar_(world_size)?;
                }
                Ok(grad.clone())
            }
            Some(Grad::Dense(_)) => Err(Error::GradientMismatch {
                reason: "expected variable to have a sparse gradient".to_string(),
            }),
            None => Err(Error::GradientMismatch {
                reason: "expected sparse gradient to be defined".to_string(),
            }),
        })?;
        st.buckets[locator.bucket_index].replicas[index.replica_index].contents =
            Some(Contents::Sparse(sparse));
        Ok(())
    }

    /// Dispatch every consecutive ready bucket starting at `next_bucket`.
    /// Buckets go out strictly in index order; one completing early waits
    /// for its turn.
    fn mark_bucket_ready(&self, st: &mut ReducerState, bucket_index: usize) -> Result<()> {
        if bucket_index > st.next_bucket {
            return Ok(());
        }

        let ReducerState {
            buckets,
            next_bucket,
            comm_hook,
            ..
        } = &mut *st;

        while *next_bucket < buckets.len() && buckets[*next_bucket].pending == 0 {
            let bucket = &mut buckets[*next_bucket];
            let reduction = if bucket.expect_sparse_gradient {
                let mut payload = Vec::with_capacity(bucket.replicas.len());
                for replica in &bucket.replicas {
                    match &replica.contents {
                        Some(Contents::Sparse(s)) => payload.push(s.clone()),
                        _ => {
                            return Err(Error::ProtocolViolation {
                                reason: format!(
                                    "bucket {} became ready without its sparse gradient",
                                    *next_bucket
                                ),
                            })
                        }
                    }
                }
                match comm_hook {
                    Some(hook) => PendingReduction::Hook(
                        hook.run_hook(GradBucket::new(payload.into_iter().map(Grad::Sparse).collect())),
                    ),
                    None => {
                        PendingReduction::Work(self.process_group.allreduce_sparse(&payload)?)
                    }
                }
            } else {
                let mut payload = Vec::with_capacity(bucket.replicas.len());
                for replica in &bucket.replicas {
                    match &replica.contents {
                        Some(Contents::Dense(t)) => payload.push(t.clone()),
                        _ => {
                            return Err(Error::ProtocolViolation {
                                reason: format!(
                                    "bucket {} became ready without its flat contents",
                                    *next_bucket
                                ),
                            })
                        }
                    }
                }
                match comm_hook {
                    Some(hook) => PendingReduction::Hook(
                        hook.run_hook(GradBucket::new(payload.into_iter().map(Grad::Dense).collect())),
                    ),
                    None => PendingReduction::Work(self.process_group.allreduce(&payload)?),
                }
            };
            tracing::debug!(bucket = *next_bucket, "dispatching bucket reduction");
            bucket.reduction = Some(reduction);
            *next_bucket += 1;
        }
        Ok(())
    }

    /// Wait out every outstanding collective, settle gradients, and close
    /// the step. Runs as the engine callback queued by the last bucket
    /// dispatch.
    fn finalize_backward(&self) -> Result<()> {
        let mut st = self.state()?;

        // Clear the step flags first: a backend failure below must leave
        // the next prepare_for_backward preflight clean.
        if !st.expect_autograd_hooks {
            return Err(Error::ProtocolViolation {
                reason: "finalize ran outside a reduction step".to_string(),
            });
        }
        st.expect_autograd_hooks = false;
        if !st.require_finalize {
            return Err(Error::ProtocolViolation {
                reason: "finalize ran but no variable was marked ready".to_string(),
            });
        }
        st.require_finalize = false;
        if st.next_bucket != st.buckets.len() {
            return Err(Error::ProtocolViolation {
                reason: format!(
                    "only {} of {} buckets were dispatched when backward finished",
                    st.next_bucket,
                    st.buckets.len()
                ),
            });
        }

        for bucket_index in 0..st.buckets.len() {
            let reduction = st.buckets[bucket_index].reduction.take().ok_or_else(|| {
                Error::ProtocolViolation {
                    reason: format!(
                        "bucket {bucket_index} has no outstanding reduction; its hooks were \
                         not properly installed"
                    ),
                }
            })?;
            match reduction {
                PendingReduction::Work(work) => work.wait()?,
                PendingReduction::Hook(future) => {
                    let results = future.wait()?;
                    let ReducerState {
                        buckets,
                        rpc_context,
                        ..
                    } = &mut *st;
                    let bucket = &mut buckets[bucket_index];
                    if results.len() != bucket.replicas.len() {
                        return Err(Error::GradientMismatch {
                            reason: format!(
                                "communication hook returned {} results for {} replicas",
                                results.len(),
                                bucket.replicas.len()
                            ),
                        });
                    }
                    let expect_sparse = bucket.expect_sparse_gradient;
                    for (replica, result) in bucket.replicas.iter_mut().zip(results) {
                        match (expect_sparse, result) {
                            (true, Grad::Sparse(reduced)) => match &replica.contents {
                                Some(Contents::Sparse(current)) => current.copy_from(&reduced)?,
                                _ => {
                                    return Err(Error::ProtocolViolation {
                                        reason: format!(
                                            "bucket {bucket_index} lost its sparse contents"
                                        ),
                                    })
                                }
                            },
                            (false, Grad::Dense(reduced)) => {
                                // Rebuild the views around the returned
                                // buffer; the grads are retargeted without
                                // copying since the buffer already holds
                                // the reduced values.
                                replica.bucket_views.clear();
                                initialize_bucket_views(replica, &reduced, false, rpc_context)?;
                                replica.contents = Some(Contents::Dense(reduced));
                            }
                            (true, Grad::Dense(_)) => {
                                return Err(Error::GradientMismatch {
                                    reason: "communication hook returned a dense result for a \
                                             sparse bucket"
                                        .to_string(),
                                })
                            }
                            (false, Grad::Sparse(_)) => {
                                return Err(Error::GradientMismatch {
                                    reason: "communication hook returned a sparse result for a \
                                             dense bucket"
                                        .to_string(),
                                })
                            }
                        }
                    }
                }
            }
            // Sparse buckets need no settling: the gradient and the
            // contents are the same storage, so the reduced values are
            // already in place.
            if !st.buckets[bucket_index].expect_sparse_gradient {
                self.finalize_bucket_dense(&mut st, bucket_index)?;
            }
        }

        if self.find_unused_parameters {
            for map in &st.local_used_maps {
                map.zero_();
            }
            // If every parameter was used we never waited on the consensus
            // reduction. Wait now so next step's host-to-device copies do
            // not race with it.
            if !st.local_used_maps_reduced {
                if let Some(work) = st.local_used_work.take() {
                    work.wait()?;
                }
            }
            st.local_used_work = None;
            st.local_used_maps_reduced = false;
        }
        Ok(())
    }

    fn finalize_bucket_dense(&self, st: &mut ReducerState, bucket_index: usize) -> Result<()> {
        let replica_count = st.buckets[bucket_index].replicas.len();
        for replica_index in 0..replica_count {
            let variable_count = st.buckets[bucket_index].replicas[replica_index]
                .variables
                .len();
            for intra_bucket_index in 0..variable_count {
                let replica = &st.buckets[bucket_index].replicas[replica_index];
                let variable = replica.variables[intra_bucket_index].clone();
                let bucket_view = replica.bucket_views[intra_bucket_index].clone();

                let mut global_unused = false;
                if self.find_unused_parameters {
                    let variable_index =
                        st.buckets[bucket_index].variable_indices[intra_bucket_index];
                    // Locally used implies globally used; only a locally
                    // unused variable forces us to wait for the consensus.
                    // Models that use every parameter never pay for the
                    // wait here.
                    global_unused =
                        st.local_used_maps[replica_index].get::<i32>(variable_index)? == 0;
                    if global_unused && !st.local_used_maps_reduced {
                        let work =
                            st.local_used_work
                                .take()
                                .ok_or_else(|| Error::ProtocolViolation {
                                    reason: "used-map consensus reduction was never started"
                                        .to_string(),
                                })?;
                        work.wait()?;
                        for i in 0..st.local_used_maps.len() {
                            st.local_used_maps[i].copy_from(&st.local_used_maps_dev[i])?;
                        }
                        global_unused =
                            st.local_used_maps[replica_index].get::<i32>(variable_index)? == 0;
                        st.local_used_maps_reduced = true;
                    }
                }

                let rpc_context = st.rpc_context.clone();
                run_grad_callback(&rpc_context, &variable, |slot| -> Result<()> {
                    // A globally unused parameter keeps its grad untouched.
                    if global_unused {
                        return Ok(());
                    }
                    match slot {
                        // Locally unused but globally used: hand out the
                        // reduced view.
                        None => {
                            *slot = Some(Grad::Dense(bucket_view.clone()));
                            Ok(())
                        }
                        Some(Grad::Dense(grad)) => {
                            if grad.is_alias_of(&bucket_view) {
                                Ok(())
                            } else {
                                Err(Error::ProtocolViolation {
                                    reason: "gradient should have been retargeted to its \
                                             bucket view during reduction"
                                        .to_string(),
                                })
                            }
                        }
                        Some(Grad::Sparse(_)) => Err(Error::GradientMismatch {
                            reason: "dense bucket settled onto a sparse gradient".to_string(),
                        }),
                    }
                })?;
            }
        }
        Ok(())
    }
}

impl Drop for Reducer {
    fn drop(&mut self) {
        // Deregister every post-hook so a re-created wrapper does not leave
        // stale hooks invoking a dead Reducer through the accumulators.
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, accumulator) in hooks.drain(..) {
            if !accumulator.del_post_hook(key) {
                tracing::warn!("removing a post-hook that was already removed");
            }
        }
    }
}

fn verify_replicas_within_process(
    replicas: &[Vec<Variable>],
    expect_sparse_gradients: &[Vec<bool>],
) -> Result<()> {
    for (replica_index, replica) in replicas.iter().enumerate() {
        if replica.len() != replicas[0].len() {
            return Err(Error::VerificationFailed {
                reason: "model replicas must have an equal number of parameters".to_string(),
            });
        }
        if expect_sparse_gradients[replica_index].len() != expect_sparse_gradients[0].len()
            || expect_sparse_gradients[replica_index].len() != replica.len()
        {
            return Err(Error::VerificationFailed {
                reason: "expected the number of sparse-gradient flags to match the parameter \
                         count on every replica"
                    .to_string(),
            });
        }
        for (variable_index, variable) in replica.iter().enumerate() {
            let reference = &replicas[0][variable_index];
            if !variable.requires_grad() {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "variable {variable_index} does not require gradients; all managed \
                         parameters must"
                    ),
                });
            }
            if variable.sizes() != reference.sizes() {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "variable {variable_index} has sizes {:?} on replica {replica_index} \
                         but {:?} on replica 0",
                        variable.sizes(),
                        reference.sizes()
                    ),
                });
            }
            if variable.strides() != reference.strides() {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "variable {variable_index} has strides {:?} on replica {replica_index} \
                         but {:?} on replica 0",
                        variable.strides(),
                        reference.strides()
                    ),
                });
            }
            if variable.dtype() != reference.dtype() {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "variable {variable_index} has dtype {} on replica {replica_index} but \
                         {} on replica 0",
                        variable.dtype(),
                        reference.dtype()
                    ),
                });
            }
            if expect_sparse_gradients[replica_index][variable_index]
                != expect_sparse_gradients[0][variable_index]
            {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "variable {variable_index} must either expect a sparse gradient on \
                         every replica or on none"
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Broadcast replica 0's `(sizes, strides)` metadata from rank 0 and
/// compare element by element; raises naming the first mismatching
/// parameter.
fn verify_replica0_across_processes(
    replicas: &[Vec<Variable>],
    process_group: &dyn ProcessGroup,
) -> Result<()> {
    let mut total = 0;
    for variable in &replicas[0] {
        total += 2 * variable.sizes().len();
    }
    let metadata = Tensor::zeros(&[total], DType::I64, Device::Cpu);
    let mut i = 0;
    for variable in &replicas[0] {
        for &size in variable.sizes() {
            metadata.set::<i64>(i, size as i64)?;
            i += 1;
        }
        for &stride in variable.strides() {
            metadata.set::<i64>(i, stride as i64)?;
            i += 1;
        }
    }

    let metadata_dev = metadata.to_device(replicas[0][0].device());
    process_group
        .broadcast(std::slice::from_ref(&metadata_dev))?
        .wait()?;

    let control = Tensor::zeros(&[total], DType::I64, Device::Cpu);
    control.copy_from(&metadata_dev)?;

    let mut i = 0;
    for (parameter, variable) in replicas[0].iter().enumerate() {
        for &size in variable.sizes() {
            if control.get::<i64>(i)? != size as i64 {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "replicas[0][{parameter}] in this process has sizes {:?}, which do not \
                         match the sizes of the same parameter in process 0",
                        variable.sizes()
                    ),
                });
            }
            i += 1;
        }
        for &stride in variable.strides() {
            if control.get::<i64>(i)? != stride as i64 {
                return Err(Error::VerificationFailed {
                    reason: format!(
                        "replicas[0][{parameter}] in this process has strides {:?}, which do \
                         not match the strides of the same parameter in process 0",
                        variable.strides()
                    ),
                });
            }
            i += 1;
        }
    }
    Ok(())
}
