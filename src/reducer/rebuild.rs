//! Adaptive bucket rebuilding from the observed gradient-ready order.

use super::{bucket::initialize_buckets, Reducer, ReducerState, DEFAULT_FIRST_BUCKET_BYTES};
use crate::autograd;
use crate::error::{Error, Result};
use crate::reducer::assignment::compute_bucket_assignment_by_size;
use crate::tensor::{DType, Device, Tensor};

impl Reducer {
    /// Recluster buckets around the gradient-ready order recorded during
    /// the first backward pass, then re-initialize the bucket store.
    ///
    /// No-op until a complete ready order has been recorded (and never
    /// again after one rebuild). The new assignment is synced from rank 0
    /// so every worker dispatches byte-identical buckets even if their
    /// locally observed orders differ.
    pub(super) fn rebuild_buckets(&self, st: &mut ReducerState) -> Result<()> {
        if st.rebuilt_params.is_empty() {
            return Ok(());
        }
        if st.rebuilt_params.len() != st.rebuilt_param_indices.len() {
            return Err(Error::VerificationFailed {
                reason: format!(
                    "recorded {} ready parameters but {} indices",
                    st.rebuilt_params.len(),
                    st.rebuilt_param_indices.len()
                ),
            });
        }
        if st.rebuilt_param_indices.len() != self.replicas[0].len() {
            return Err(Error::VerificationFailed {
                reason: format!(
                    "recorded gradient-ready order covers {} of {} parameters",
                    st.rebuilt_param_indices.len(),
                    self.replicas[0].len()
                ),
            });
        }

        let bucket_size_limits = [DEFAULT_FIRST_BUCKET_BYTES, self.bucket_bytes_cap];
        let tensors: Vec<Tensor> = st.rebuilt_params.iter().map(|v| v.data().clone()).collect();
        let rebuilt = compute_bucket_assignment_by_size(
            &tensors,
            &bucket_size_limits,
            &self.expect_sparse_gradients[0],
            &st.rebuilt_param_indices,
        )?;

        let synced = self.sync_bucket_indices(rebuilt)?;
        tracing::debug!(buckets = synced.len(), "rebuilt bucket assignment");

        st.has_rebuilt_bucket = true;
        st.rebuilt_params.clear();
        st.rebuilt_param_indices.clear();

        st.rpc_context = autograd::current_context();
        let (buckets, variable_locators) = initialize_buckets(
            &self.replicas,
            &self.expect_sparse_gradients,
            synced,
            &st.rpc_context,
            st.expect_autograd_hooks,
        )?;
        st.buckets = buckets;
        st.variable_locators = variable_locators;
        Ok(())
    }

    /// Broadcast a bucket assignment from rank 0 so that all workers agree
    /// on it byte for byte.
    ///
    /// Two flat integer tensors travel: `[indices..., num_buckets]` (its
    /// length is the parameter count plus one, identical on every rank
    /// even when bucket counts differ), then `[bucket_sizes...]` sized by
    /// the broadcast bucket count. Non-root ranks overwrite their local
    /// assignment with the reconstruction.
    pub(super) fn sync_bucket_indices(
        &self,
        bucket_indices: Vec<Vec<usize>>,
    ) -> Result<Vec<Vec<usize>>> {
        let num_buckets = bucket_indices.len();
        let bucket_sizes: Vec<usize> = bucket_indices.iter().map(|b| b.len()).collect();
        let total_size: usize = bucket_sizes.iter().sum();
        let device = self.replicas[0][0].device();

        // Group the indices and the bucket count into one tensor so a
        // single equal-length broadcast carries both.
        let indices_tensor = Tensor::zeros(&[total_size + 1], DType::I64, Device::Cpu);
        let mut at = 0;
        for bucket in &bucket_indices {
            for &index in bucket {
                indices_tensor.set::<i64>(at, index as i64)?;
                at += 1;
            }
        }
        indices_tensor.set::<i64>(at, num_buckets as i64)?;

        // Backends may only accept device tensors; round-trip through the
        // replica's device.
        let indices_dev = indices_tensor.to_device(device);
        self.process_group
            .broadcast(std::slice::from_ref(&indices_dev))?
            .wait()?;
        indices_tensor.copy_from(&indices_dev)?;

        let num_buckets = indices_tensor.get::<i64>(total_size)? as usize;

        // For non-root ranks the local bucket count may be smaller than
        // the broadcast one; clamp reads while sizing the second buffer.
        let bucket_sizes_tensor = Tensor::zeros(&[num_buckets], DType::I64, Device::Cpu);
        for i in 0..num_buckets {
            let clamped = i.min(bucket_sizes.len().saturating_sub(1));
            bucket_sizes_tensor.set::<i64>(i, bucket_sizes[clamped] as i64)?;
        }
        let bucket_sizes_dev = bucket_sizes_tensor.to_device(device);
        self.process_group
            .broadcast(std::slice::from_ref(&bucket_sizes_dev))?
            .wait()?;
        bucket_sizes_tensor.copy_from(&bucket_sizes_dev)?;

        // Reconstruct rank 0's assignment.
        let mut synced = Vec::with_capacity(num_buckets);
        let mut at = 0;
        for i in 0..num_buckets {
            let size = bucket_sizes_tensor.get::<i64>(i)? as usize;
            let mut bucket = Vec::with_capacity(size);
            for _ in 0..size {
                bucket.push(indices_tensor.get::<i64>(at)? as usize);
                at += 1;
            }
            synced.push(bucket);
        }
        Ok(synced)
    }
}
