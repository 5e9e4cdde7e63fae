//! In-process process groups for tests and single-worker runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{ProcessGroup, Work};
use crate::error::{Error, Result};
use crate::tensor::{SparseTensor, Tensor};

/// World-size-1 process group: every collective completes immediately.
///
/// The unit-test counterpart of a real backend, in the spirit of a no-op
/// communicator: reductions over one rank are identities, broadcasts have
/// no peers.
pub struct NoopProcessGroup;

struct CompletedWork;

impl Work for CompletedWork {
    fn wait(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl ProcessGroup for NoopProcessGroup {
    fn broadcast(&self, _tensors: &[Tensor]) -> Result<Box<dyn Work>> {
        Ok(Box::new(CompletedWork))
    }

    fn allreduce(&self, _tensors: &[Tensor]) -> Result<Box<dyn Work>> {
        Ok(Box::new(CompletedWork))
    }

    fn allreduce_sparse(&self, tensors: &[SparseTensor]) -> Result<Box<dyn Work>> {
        // A real backend hands back a coalesced result; match that.
        for t in tensors {
            t.coalesce_()?;
        }
        Ok(Box::new(CompletedWork))
    }

    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

enum Submission {
    Broadcast(Vec<Tensor>),
    Allreduce(Vec<Tensor>),
    AllreduceSparse(Vec<SparseTensor>),
}

impl Submission {
    fn kind(&self) -> &'static str {
        match self {
            Submission::Broadcast(_) => "broadcast",
            Submission::Allreduce(_) => "allreduce",
            Submission::AllreduceSparse(_) => "allreduce_sparse",
        }
    }

    fn len(&self) -> usize {
        match self {
            Submission::Broadcast(t) | Submission::Allreduce(t) => t.len(),
            Submission::AllreduceSparse(s) => s.len(),
        }
    }
}

struct PendingOp {
    entries: Vec<Option<Submission>>,
    arrived: usize,
    waited: usize,
    done: bool,
    error: Option<String>,
}

struct Shared {
    world: usize,
    ops: Mutex<HashMap<u64, PendingOp>>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingOp>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process rendezvous process group.
///
/// `LocalProcessGroup::group(w)` yields one handle per rank, all backed by
/// shared state. Each rank submits collectives in its own program order;
/// the n-th collective submitted on every rank forms one rendezvous, and
/// the last-arriving rank executes the reduction while the others' `wait`
/// calls block on a condition variable. This mirrors running one client
/// per rank inside a single test process.
pub struct LocalProcessGroup {
    shared: Arc<Shared>,
    rank: usize,
    seq: AtomicU64,
}

impl LocalProcessGroup {
    /// Create a connected group of `world` ranks.
    pub fn group(world: usize) -> Vec<LocalProcessGroup> {
        let shared = Arc::new(Shared {
            world,
            ops: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        });
        (0..world)
            .map(|rank| LocalProcessGroup {
                shared: Arc::clone(&shared),
                rank,
                seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn submit(&self, sub: Submission) -> Result<Box<dyn Work>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut ops = self.shared.lock();
        let world = self.shared.world;
        let op = ops.entry(seq).or_insert_with(|| PendingOp {
            entries: (0..world).map(|_| None).collect(),
            arrived: 0,
            waited: 0,
            done: false,
            error: None,
        });
        if op.entries[self.rank].is_some() {
            return Err(Error::CommunicationFailed {
                op: "collective",
                reason: format!("rank {} submitted op {seq} twice", self.rank),
            });
        }
        op.entries[self.rank] = Some(sub);
        op.arrived += 1;
        if op.arrived == world {
            let entries: Vec<Submission> = op.entries.iter_mut().filter_map(|e| e.take()).collect();
            op.error = if entries.len() == world {
                perform(entries).err().map(|e| e.to_string())
            } else {
                Some("rendezvous entry missing".to_string())
            };
            op.done = true;
            self.shared.cv.notify_all();
        }
        Ok(Box::new(LocalWork {
            shared: Arc::clone(&self.shared),
            seq,
        }))
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn broadcast(&self, tensors: &[Tensor]) -> Result<Box<dyn Work>> {
        self.submit(Submission::Broadcast(tensors.to_vec()))
    }

    fn allreduce(&self, tensors: &[Tensor]) -> Result<Box<dyn Work>> {
        self.submit(Submission::Allreduce(tensors.to_vec()))
    }

    fn allreduce_sparse(&self, tensors: &[SparseTensor]) -> Result<Box<dyn Work>> {
        self.submit(Submission::AllreduceSparse(tensors.to_vec()))
    }

    fn size(&self) -> usize {
        self.shared.world
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

struct LocalWork {
    shared: Arc<Shared>,
    seq: u64,
}

impl Work for LocalWork {
    fn wait(self: Box<Self>) -> Result<()> {
        let mut ops = self.shared.lock();
        loop {
            let done = ops.get(&self.seq).map(|op| op.done);
            match done {
                Some(true) => break,
                Some(false) => {
                    ops = self
                        .shared
                        .cv
                        .wait(ops)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => {
                    return Err(Error::CommunicationFailed {
                        op: "collective",
                        reason: format!("op {} waited on after completion", self.seq),
                    })
                }
            }
        }
        let world = self.shared.world;
        let error = {
            let op = ops.get_mut(&self.seq).ok_or(Error::CommunicationFailed {
                op: "collective",
                reason: "rendezvous entry vanished".to_string(),
            })?;
            op.waited += 1;
            let err = op.error.clone();
            if op.waited == world {
                ops.remove(&self.seq);
            }
            err
        };
        match error {
            Some(reason) => Err(Error::CommunicationFailed {
                op: "collective",
                reason,
            }),
            None => Ok(()),
        }
    }
}

fn perform(entries: Vec<Submission>) -> Result<()> {
    let kind = entries[0].kind();
    let count = entries[0].len();
    for e in &entries {
        if e.kind() != kind || e.len() != count {
            return Err(Error::CommunicationFailed {
                op: "collective",
                reason: format!(
                    "mismatched rendezvous: rank submitted {} of {} tensors, expected {} of {}",
                    e.kind(),
                    e.len(),
                    kind,
                    count
                ),
            });
        }
    }
    match &entries[0] {
        Submission::Broadcast(_) => {
            let lists: Vec<&Vec<Tensor>> = entries
                .iter()
                .map(|e| match e {
                    Submission::Broadcast(t) => t,
                    _ => unreachable!("kinds verified above"),
                })
                .collect();
            for i in 0..count {
                let root = &lists[0][i];
                for rank_tensors in lists.iter().skip(1) {
                    rank_tensors[i].copy_from(root)?;
                }
            }
            Ok(())
        }
        Submission::Allreduce(_) => {
            let lists: Vec<&Vec<Tensor>> = entries
                .iter()
                .map(|e| match e {
                    Submission::Allreduce(t) => t,
                    _ => unreachable!("kinds verified above"),
                })
                .collect();
            for i in 0..count {
                let first = &lists[0][i];
                let acc = Tensor::zeros(&[first.numel()], first.dtype(), first.device());
                for rank_tensors in &lists {
                    acc.add_assign_from(&rank_tensors[i])?;
                }
                for rank_tensors in &lists {
                    rank_tensors[i].copy_from(&acc)?;
                }
            }
            Ok(())
        }
        Submission::AllreduceSparse(_) => {
            let lists: Vec<&Vec<SparseTensor>> = entries
                .iter()
                .map(|e| match e {
                    Submission::AllreduceSparse(s) => s,
                    _ => unreachable!("kinds verified above"),
                })
                .collect();
            for i in 0..count {
                reduce_sparse(lists.iter().map(|l| &l[i]))?;
            }
            Ok(())
        }
    }
}

/// Concatenate every rank's COO entries, coalesce the sum, and hand each
/// rank its own copy of the result.
fn reduce_sparse<'a>(grads: impl Iterator<Item = &'a SparseTensor> + Clone) -> Result<()> {
    let first = grads.clone().next().ok_or(Error::CommunicationFailed {
        op: "allreduce_sparse",
        reason: "empty rendezvous".to_string(),
    })?;
    let dense_sizes = first.dense_sizes().to_vec();
    let row_sizes = &dense_sizes[1..];

    let mut all_indices: Vec<i64> = Vec::new();
    let mut all_values: Vec<Tensor> = Vec::new();
    for g in grads.clone() {
        if g.dense_sizes() != dense_sizes.as_slice() || g.dtype() != first.dtype() {
            return Err(Error::CommunicationFailed {
                op: "allreduce_sparse",
                reason: format!(
                    "sparse gradients disagree across ranks: {:?}/{} vs {:?}/{}",
                    g.dense_sizes(),
                    g.dtype(),
                    dense_sizes,
                    first.dtype()
                ),
            });
        }
        all_indices.extend(g.indices());
        all_values.push(g.values());
    }

    let total: usize = all_values.iter().map(|v| v.sizes()[0]).sum();
    let mut merged_sizes = vec![total];
    merged_sizes.extend_from_slice(row_sizes);
    let merged = Tensor::zeros(&merged_sizes, first.dtype(), first.device());
    let mut at = 0;
    for v in &all_values {
        let n = v.sizes()[0];
        if n > 0 {
            merged.narrow(0, at, n)?.copy_from(v)?;
        }
        at += n;
    }

    let combined = SparseTensor::new(all_indices, merged, &dense_sizes)?;
    combined.coalesce_()?;
    for g in grads {
        g.copy_from(&combined)?;
    }
    Ok(())
}
