//! Size-bounded bucket assignment.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tensor::{DType, Device, Tensor};

/// Accumulator for one in-progress bucket.
#[derive(Default)]
struct BucketAccumulator {
    indices: Vec<usize>,
    size: usize,
    /// Cursor into the size-limit list, clamped at the last entry.
    limit_cursor: usize,
}

/// Group `tensors` into buckets of bounded byte size, one bucket never
/// spanning dtypes or devices.
///
/// Walks the tensors in order, accumulating per `(dtype, device)` key and
/// emitting a bucket whenever the accumulated byte size reaches the key's
/// current limit; each key then advances to the next entry of
/// `bucket_size_limits` (staying on the last one from then on). A small
/// first limit lets the first collective fire early in the backward pass.
/// Tensors whose `expect_sparse_gradient` flag is set get singleton
/// buckets immediately, since sparse gradients cannot be flattened into a
/// shared buffer.
///
/// # Arguments
///
/// * `tensors` - Parameter tensors, in index order or in observed
///   gradient-ready order.
/// * `bucket_size_limits` - Consecutive byte limits per key; typically
///   `[first_bucket_bytes, bucket_bytes_cap]`.
/// * `expect_sparse_gradient` - Per-variable sparse flags, indexed by the
///   variable's true index; may be empty.
/// * `tensor_indices` - The true variable index of each entry in
///   `tensors`. When empty, entry `i` has index `i` and the resulting
///   buckets are sorted by the smallest index they contain; when given
///   (gradient-ready order), emission order is preserved.
///
/// # Errors
///
/// Fails on an empty tensor list, an empty limit list, or length
/// mismatches between `tensors` and the flag/index lists.
pub fn compute_bucket_assignment_by_size(
    tensors: &[Tensor],
    bucket_size_limits: &[usize],
    expect_sparse_gradient: &[bool],
    tensor_indices: &[usize],
) -> Result<Vec<Vec<usize>>> {
    if tensors.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "tensors",
            reason: "expected at least one tensor to assign".to_string(),
        });
    }
    if bucket_size_limits.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "bucket_size_limits",
            reason: "expected at least one bucket size limit".to_string(),
        });
    }
    if !expect_sparse_gradient.is_empty() && expect_sparse_gradient.len() != tensors.len() {
        return Err(Error::InvalidArgument {
            arg: "expect_sparse_gradient",
            reason: format!(
                "expected {} entries, got {}",
                tensors.len(),
                expect_sparse_gradient.len()
            ),
        });
    }
    if !tensor_indices.is_empty() && tensor_indices.len() != tensors.len() {
        return Err(Error::InvalidArgument {
            arg: "tensor_indices",
            reason: format!(
                "expected {} entries, got {}",
                tensors.len(),
                tensor_indices.len()
            ),
        });
    }

    let mut result: Vec<Vec<usize>> = Vec::with_capacity(tensors.len());
    // Deterministic key order keeps residual emission reproducible.
    let mut buckets: BTreeMap<(DType, Device), BucketAccumulator> = BTreeMap::new();

    for (i, tensor) in tensors.iter().enumerate() {
        let tensor_index = if tensor_indices.is_empty() {
            i
        } else {
            tensor_indices[i]
        };

        // Sparse-expecting variables get their own bucket regardless of
        // size: their gradients cannot share a flat buffer.
        if !expect_sparse_gradient.is_empty() && expect_sparse_gradient[tensor_index] {
            result.push(vec![tensor_index]);
            continue;
        }

        let key = (tensor.dtype(), tensor.device());
        let bucket = buckets.entry(key).or_default();
        bucket.indices.push(tensor_index);
        bucket.size += tensor.numel() * tensor.element_size();

        let limit = bucket_size_limits[bucket.limit_cursor];
        if bucket.size >= limit {
            let next_cursor = (bucket.limit_cursor + 1).min(bucket_size_limits.len() - 1);
            result.push(std::mem::take(&mut bucket.indices));
            bucket.size = 0;
            bucket.limit_cursor = next_cursor;
        }
    }

    // Flush residual accumulators.
    for bucket in buckets.into_values() {
        if !bucket.indices.is_empty() {
            result.push(bucket.indices);
        }
    }

    // In index-is-position mode the walk order is the usage order, so sort
    // buckets by the smallest index they contain to make them ready in
    // consecutive order. In ready-order mode the emission order already is
    // the gradient arrival order.
    if tensor_indices.is_empty() {
        result.sort_by_key(|indices| indices.iter().copied().min().unwrap_or(usize::MAX));
    }

    Ok(result)
}
