//! Bucket store: flat contents buffers and per-parameter views.

use std::sync::Arc;

use crate::autograd::{DistAutogradContext, Variable};
use crate::comm::{HookFuture, Work};
use crate::error::{Error, Result};
use crate::tensor::{Grad, SparseTensor, Tensor};

/// Identifies one parameter: `(replica_index, variable_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VariableIndex {
    pub replica_index: usize,
    pub variable_index: usize,
}

/// Reverse index from a variable to its bucket slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VariableLocator {
    pub bucket_index: usize,
    pub intra_bucket_index: usize,
}

/// A bucket's reduction payload.
pub(crate) enum Contents {
    /// Flat buffer coalescing the replica's dense gradients.
    Dense(Tensor),
    /// The single sparse gradient itself; the bucket aliases it directly.
    Sparse(SparseTensor),
}

/// Outstanding communication for a dispatched bucket.
pub(crate) enum PendingReduction {
    Work(Box<dyn Work>),
    Hook(HookFuture),
}

/// Per-replica slice of a bucket.
pub(crate) struct BucketReplica {
    /// Variables in this bucket, in intra-bucket order.
    pub variables: Vec<Variable>,
    /// Element offset of each variable into the flat contents buffer.
    /// Empty for sparse-expecting buckets.
    pub offsets: Vec<usize>,
    /// Element count of each variable. Empty for sparse-expecting buckets.
    pub lengths: Vec<usize>,
    /// Strided views into the contents, one per variable. Empty for
    /// sparse-expecting buckets.
    pub bucket_views: Vec<Tensor>,
    pub contents: Option<Contents>,
    /// Variables in this replica still awaiting their gradient this step.
    pub pending: usize,
}

/// A coalescing unit: one flat buffer per replica, reduced in one
/// collective call.
pub(crate) struct Bucket {
    pub replicas: Vec<BucketReplica>,
    /// The variable index of each intra-bucket position.
    pub variable_indices: Vec<usize>,
    /// Single-variable bucket holding a sparse gradient.
    pub expect_sparse_gradient: bool,
    /// Replicas still awaiting completion this step.
    pub pending: usize,
    pub reduction: Option<PendingReduction>,
}

/// Run a gradient mutation through the engine's single seam: directly
/// against the variable's grad slot, or routed into the captured
/// distributed-autograd context when one is present.
pub(crate) fn run_grad_callback<R>(
    rpc_context: &Option<Arc<DistAutogradContext>>,
    variable: &Variable,
    cb: impl FnOnce(&mut Option<Grad>) -> R,
) -> R {
    match rpc_context {
        Some(ctx) => ctx.run_grad_callback_for_variable(variable, cb),
        None => variable.with_grad_slot(cb),
    }
}

/// Build buckets and the variable→bucket reverse index from an assignment.
///
/// Must not run while autograd hooks are armed: views and gradients are
/// retargeted here, and a concurrent copy-in would race. Gradients that
/// are already defined (a rebuild mid-training) are copied into their new
/// views and retargeted to alias them; undefined gradients are left
/// undefined so globally unused parameters stay untouched.
pub(crate) fn initialize_buckets(
    replicas: &[Vec<Variable>],
    expect_sparse_gradients: &[Vec<bool>],
    bucket_indices: Vec<Vec<usize>>,
    rpc_context: &Option<Arc<DistAutogradContext>>,
    hooks_armed: bool,
) -> Result<(Vec<Bucket>, Vec<VariableLocator>)> {
    if hooks_armed {
        return Err(Error::ProtocolViolation {
            reason: "buckets must not be initialized during autograd execution".to_string(),
        });
    }

    let variable_count = replicas[0].len();
    let mut locators: Vec<Option<VariableLocator>> = vec![None; variable_count];
    let mut buckets: Vec<Bucket> = Vec::with_capacity(bucket_indices.len());

    for (bucket_index, indices) in bucket_indices.into_iter().enumerate() {
        if indices.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "bucket_indices",
                reason: format!("bucket {bucket_index} is empty"),
            });
        }
        for &variable_index in &indices {
            if variable_index >= variable_count {
                return Err(Error::InvalidArgument {
                    arg: "bucket_indices",
                    reason: format!(
                        "variable index {variable_index} out of range for {variable_count} parameters"
                    ),
                });
            }
        }

        // A single-variable bucket inherits the variable's sparse
        // expectation; larger buckets must not contain any.
        let expect_sparse_gradient = if indices.len() == 1 {
            expect_sparse_gradients[0][indices[0]]
        } else {
            for &variable_index in &indices {
                if expect_sparse_gradients[0][variable_index] {
                    return Err(Error::InvalidArgument {
                        arg: "bucket_indices",
                        reason: format!(
                            "bucket {bucket_index} groups sparse-expecting variable \
                             {variable_index} with other variables"
                        ),
                    });
                }
            }
            false
        };

        let mut bucket_replicas = Vec::with_capacity(replicas.len());
        for replica_variables in replicas {
            let mut replica = BucketReplica {
                variables: Vec::with_capacity(indices.len()),
                offsets: Vec::new(),
                lengths: Vec::new(),
                bucket_views: Vec::new(),
                contents: None,
                pending: 0,
            };

            if expect_sparse_gradient {
                replica.variables = vec![replica_variables[indices[0]].clone()];
            } else {
                let mut offset = 0;
                for &variable_index in &indices {
                    let variable = &replica_variables[variable_index];
                    if let Some(first) = replica.variables.first() {
                        if variable.device() != first.device() {
                            return Err(Error::InvalidArgument {
                                arg: "bucket_indices",
                                reason: format!(
                                    "bucket {bucket_index} spans devices {} and {}",
                                    first.device(),
                                    variable.device()
                                ),
                            });
                        }
                        if variable.dtype() != first.dtype() {
                            return Err(Error::DTypeMismatch {
                                expected: first.dtype(),
                                got: variable.dtype(),
                            });
                        }
                    }
                    let length = variable.numel();
                    replica.variables.push(variable.clone());
                    replica.offsets.push(offset);
                    replica.lengths.push(length);
                    offset += length;
                }

                let first = &replica.variables[0];
                let contents = Tensor::zeros(&[offset], first.dtype(), first.device());
                initialize_bucket_views(&mut replica, &contents, true, rpc_context)?;
                replica.contents = Some(Contents::Dense(contents));
            }

            bucket_replicas.push(replica);
        }

        for (intra_bucket_index, &variable_index) in indices.iter().enumerate() {
            if locators[variable_index].is_some() {
                return Err(Error::InvalidArgument {
                    arg: "bucket_indices",
                    reason: format!("variable index {variable_index} appears in two buckets"),
                });
            }
            locators[variable_index] = Some(VariableLocator {
                bucket_index,
                intra_bucket_index,
            });
        }

        buckets.push(Bucket {
            replicas: bucket_replicas,
            variable_indices: indices,
            expect_sparse_gradient,
            pending: 0,
            reduction: None,
        });
    }

    let locators: Vec<VariableLocator> = locators
        .into_iter()
        .enumerate()
        .map(|(variable_index, loc)| {
            loc.ok_or_else(|| Error::InvalidArgument {
                arg: "bucket_indices",
                reason: format!("variable index {variable_index} is not covered by any bucket"),
            })
        })
        .collect::<Result<_>>()?;

    Ok((buckets, locators))
}

/// Create per-variable views into a contents buffer and re-anchor any
/// defined gradients onto them.
///
/// Each view's layout follows the gradient layout contract: a dense,
/// non-overlapping parameter gets a view with its exact sizes and strides
/// (anticipating the accumulator will stash gradients with that layout);
/// anything else gets a row-major-contiguous view.
///
/// `copy_to_bucket_view` distinguishes the two callers: bucket
/// (re)initialization copies existing gradient data into the fresh buffer,
/// while adoption of a communication hook's result buffer does not, since
/// that buffer already holds the reduced values.
pub(crate) fn initialize_bucket_views(
    replica: &mut BucketReplica,
    contents: &Tensor,
    copy_to_bucket_view: bool,
    rpc_context: &Option<Arc<DistAutogradContext>>,
) -> Result<()> {
    for i in 0..replica.variables.len() {
        let variable = replica.variables[i].clone();
        let offset = replica.offsets[i];
        let length = replica.lengths[i];
        let bucket_view = if variable.data().is_non_overlapping_and_dense() {
            contents.as_strided(variable.sizes(), variable.strides(), offset)?
        } else {
            contents.narrow(0, offset, length)?.view(variable.sizes())?
        };
        replica.bucket_views.push(bucket_view.clone());

        run_grad_callback(rpc_context, &variable, |slot| -> Result<()> {
            if let Some(Grad::Dense(grad)) = slot {
                if !grad.is_alias_of(&bucket_view) {
                    if copy_to_bucket_view {
                        bucket_view.copy_from(grad)?;
                    }
                    *slot = Some(Grad::Dense(bucket_view.clone()));
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}
