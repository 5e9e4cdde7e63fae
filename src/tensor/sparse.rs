//! COO sparse gradients.
//!
//! An embedding-style gradient touches only a few rows of its parameter, so
//! it travels as `(indices, values)` pairs instead of a dense buffer. The
//! pair lives behind a shared handle: a sparse-expecting bucket's contents
//! *is* the gradient, and a backend that reduces it in place updates every
//! clone at once.

use std::sync::{Arc, PoisonError, RwLock};

use super::dense::Tensor;
use super::dtype::{DType, Device};
use crate::error::{Error, Result};

struct SparseData {
    /// Row indices into dimension 0 of the dense shape, one per value row.
    indices: Vec<i64>,
    /// Value rows, shape `[nnz, dense_sizes[1..]]`.
    values: Tensor,
}

/// A COO sparse gradient for a parameter of shape `dense_sizes`.
#[derive(Clone)]
pub struct SparseTensor {
    data: Arc<RwLock<SparseData>>,
    dtype: DType,
    device: Device,
    dense_sizes: Vec<usize>,
}

impl SparseTensor {
    /// Build a sparse gradient from row indices and a `[nnz, ...]` values
    /// tensor.
    ///
    /// # Errors
    ///
    /// Fails if the values tensor does not have one row per index, or if
    /// its row shape disagrees with `dense_sizes[1..]`.
    pub fn new(indices: Vec<i64>, values: Tensor, dense_sizes: &[usize]) -> Result<SparseTensor> {
        if dense_sizes.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "dense_sizes",
                reason: "sparse gradients require at least one dimension".to_string(),
            });
        }
        if values.sizes().first() != Some(&indices.len()) {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!(
                    "expected {} value rows, got sizes {:?}",
                    indices.len(),
                    values.sizes()
                ),
            });
        }
        if values.sizes()[1..] != dense_sizes[1..] {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!(
                    "value row shape {:?} does not match dense shape {:?}",
                    &values.sizes()[1..],
                    dense_sizes
                ),
            });
        }
        let dtype = values.dtype();
        let device = values.device();
        Ok(SparseTensor {
            data: Arc::new(RwLock::new(SparseData { indices, values })),
            dtype,
            device,
            dense_sizes: dense_sizes.to_vec(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn dense_sizes(&self) -> &[usize] {
        &self.dense_sizes
    }

    /// Number of stored rows.
    pub fn nnz(&self) -> usize {
        self.with(|d| d.indices.len())
    }

    /// Snapshot of the row indices.
    pub fn indices(&self) -> Vec<i64> {
        self.with(|d| d.indices.clone())
    }

    /// The current values tensor (aliases this gradient's storage until the
    /// next [`replace_data`](Self::replace_data)).
    pub fn values(&self) -> Tensor {
        self.with(|d| d.values.clone())
    }

    /// Whether two handles refer to the same sparse gradient.
    pub fn is_alias_of(&self, other: &SparseTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn with<R>(&self, f: impl FnOnce(&SparseData) -> R) -> R {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Number of elements in one value row.
    fn row_numel(&self) -> usize {
        self.dense_sizes[1..].iter().product()
    }

    /// Replace indices and values in place; visible through every clone.
    pub fn replace_data(&self, indices: Vec<i64>, values: Tensor) -> Result<()> {
        if values.dtype() != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: values.dtype(),
            });
        }
        if values.sizes().first() != Some(&indices.len())
            || values.sizes()[1..] != self.dense_sizes[1..]
        {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!(
                    "replacement shape {:?} does not fit {} rows of {:?}",
                    values.sizes(),
                    indices.len(),
                    self.dense_sizes
                ),
            });
        }
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.indices = indices;
        guard.values = values;
        Ok(())
    }

    /// Overwrite this gradient with the contents of another.
    pub fn copy_from(&self, other: &SparseTensor) -> Result<()> {
        let (indices, values) = other.with(|d| (d.indices.clone(), d.values.clone()));
        let fresh = Tensor::zeros(values.sizes(), values.dtype(), values.device());
        fresh.copy_from(&values)?;
        self.replace_data(indices, fresh)
    }

    /// Merge duplicate indices by summing their rows, leaving indices
    /// sorted.
    pub fn coalesce_(&self) -> Result<()> {
        let (indices, values) = self.with(|d| (d.indices.clone(), d.values.clone()));
        let row = self.row_numel();

        let mut order: Vec<usize> = (0..indices.len()).collect();
        order.sort_by_key(|&i| indices[i]);

        let mut out_indices: Vec<i64> = Vec::with_capacity(indices.len());
        let mut out_rows: Vec<Vec<f64>> = Vec::with_capacity(indices.len());
        for &i in &order {
            let src = values.narrow(0, i, 1)?;
            let src_vals: Vec<f64> = to_f64_row(&src)?;
            if out_indices.last() == Some(&indices[i]) {
                let last = out_rows
                    .last_mut()
                    .ok_or_else(|| Error::InvalidArgument {
                        arg: "values",
                        reason: "coalesce accumulator out of sync".to_string(),
                    })?;
                for (a, b) in last.iter_mut().zip(src_vals) {
                    *a += b;
                }
            } else {
                out_indices.push(indices[i]);
                out_rows.push(src_vals);
            }
        }

        let nnz = out_indices.len();
        let mut sizes = vec![nnz];
        sizes.extend_from_slice(&self.dense_sizes[1..]);
        let merged = Tensor::zeros(&sizes, self.dtype, self.device);
        for (r, vals) in out_rows.iter().enumerate() {
            let dst = merged.narrow(0, r, 1)?;
            write_f64_row(&dst, vals)?;
        }
        debug_assert_eq!(merged.numel(), nnz * row);
        self.replace_data(out_indices, merged)
    }

    /// Divide all values in place.
    pub fn div_scalar_(&self, divisor: f64) -> Result<()> {
        self.with(|d| d.values.clone()).div_scalar_(divisor)
    }

    /// Scatter-add into a dense tensor of the full parameter shape. Test
    /// and inspection helper.
    pub fn to_dense(&self) -> Result<Tensor> {
        let out = Tensor::zeros(&self.dense_sizes, self.dtype, self.device);
        let (indices, values) = self.with(|d| (d.indices.clone(), d.values.clone()));
        for (r, &idx) in indices.iter().enumerate() {
            if idx < 0 || idx as usize >= self.dense_sizes[0] {
                return Err(Error::InvalidArgument {
                    arg: "indices",
                    reason: format!("row index {idx} out of range for {:?}", self.dense_sizes),
                });
            }
            let dst = out.narrow(0, idx as usize, 1)?;
            dst.add_assign_from(&values.narrow(0, r, 1)?)?;
        }
        Ok(out)
    }
}

fn to_f64_row(row: &Tensor) -> Result<Vec<f64>> {
    // Rows are dense slices of a contiguous values tensor.
    let flat = row.view(&[row.numel()])?;
    let mut out = Vec::with_capacity(flat.numel());
    for i in 0..flat.numel() {
        out.push(match flat.dtype() {
            DType::F32 => flat.get::<f32>(i)? as f64,
            DType::F64 => flat.get::<f64>(i)?,
            DType::F16 => flat.get::<half::f16>(i)?.to_f64(),
            DType::BF16 => flat.get::<half::bf16>(i)?.to_f64(),
            DType::I32 => flat.get::<i32>(i)? as f64,
            DType::I64 => flat.get::<i64>(i)? as f64,
        });
    }
    Ok(out)
}

fn write_f64_row(row: &Tensor, vals: &[f64]) -> Result<()> {
    let flat = row.view(&[row.numel()])?;
    for (i, &v) in vals.iter().enumerate() {
        match flat.dtype() {
            DType::F32 => flat.set::<f32>(i, v as f32)?,
            DType::F64 => flat.set::<f64>(i, v)?,
            DType::F16 => flat.set::<half::f16>(i, half::f16::from_f64(v))?,
            DType::BF16 => flat.set::<half::bf16>(i, half::bf16::from_f64(v))?,
            DType::I32 => flat.set::<i32>(i, v as i32)?,
            DType::I64 => flat.set::<i64>(i, v as i64)?,
        }
    }
    Ok(())
}
