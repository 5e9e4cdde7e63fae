//! Host-backed strided tensors with shared storage.
//!
//! A [`Tensor`] is a strided view into reference-counted byte storage.
//! Cloning a tensor aliases its storage; `as_strided`/`narrow`/`view`
//! produce further aliasing views. This is the aliasing model the bucket
//! store relies on: a parameter's gradient can be retargeted to a view of
//! a flat bucket buffer, after which writes through either are visible to
//! both.

use std::sync::{Arc, PoisonError, RwLock};

use super::dtype::{DType, Device, Element};
use super::layout::{self, OffsetIter};
use crate::error::{Error, Result};

struct Storage {
    data: RwLock<Vec<u8>>,
    device: Device,
}

impl Storage {
    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// A strided view into shared host storage.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    dtype: DType,
    /// Element offset of this view into the storage.
    offset: usize,
    sizes: Vec<usize>,
    strides: Vec<usize>,
}

impl Tensor {
    /// Allocate a zero-initialized contiguous tensor.
    pub fn zeros(sizes: &[usize], dtype: DType, device: Device) -> Tensor {
        let n = layout::numel(sizes);
        Tensor {
            storage: Arc::new(Storage {
                data: RwLock::new(vec![0u8; n * dtype.size_in_bytes()]),
                device,
            }),
            dtype,
            offset: 0,
            sizes: sizes.to_vec(),
            strides: layout::contiguous_strides(sizes),
        }
    }

    /// Build a contiguous tensor from a slice of elements.
    ///
    /// Panics if `data.len()` does not match the product of `sizes`.
    pub fn from_slice<E: Element>(data: &[E], sizes: &[usize], device: Device) -> Tensor {
        assert_eq!(
            data.len(),
            layout::numel(sizes),
            "from_slice: data length does not match sizes"
        );
        let esize = E::DTYPE.size_in_bytes();
        let mut bytes = vec![0u8; data.len() * esize];
        for (i, &v) in data.iter().enumerate() {
            v.write(&mut bytes[i * esize..(i + 1) * esize]);
        }
        Tensor {
            storage: Arc::new(Storage {
                data: RwLock::new(bytes),
                device,
            }),
            dtype: E::DTYPE,
            offset: 0,
            sizes: sizes.to_vec(),
            strides: layout::contiguous_strides(sizes),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.storage.device
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn numel(&self) -> usize {
        layout::numel(&self.sizes)
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    /// Total bytes addressed by this view.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.element_size()
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == layout::contiguous_strides(&self.sizes)
    }

    /// Whether this view's layout is dense and non-overlapping (see
    /// [`layout::is_non_overlapping_and_dense`]).
    pub fn is_non_overlapping_and_dense(&self) -> bool {
        layout::is_non_overlapping_and_dense(&self.sizes, &self.strides)
    }

    /// Whether two tensors share the same underlying storage.
    pub fn is_alias_of(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    fn storage_numel(&self) -> usize {
        self.storage.with(|d| d.len()) / self.element_size()
    }

    /// View into the same storage with explicit sizes, strides and element
    /// offset.
    ///
    /// # Errors
    ///
    /// Fails if the view would reach past the end of the storage.
    pub fn as_strided(&self, sizes: &[usize], strides: &[usize], offset: usize) -> Result<Tensor> {
        if sizes.len() != strides.len() {
            return Err(Error::InvalidArgument {
                arg: "strides",
                reason: format!(
                    "rank mismatch: {} sizes vs {} strides",
                    sizes.len(),
                    strides.len()
                ),
            });
        }
        let reach = layout::max_reach(sizes, strides, offset);
        if reach > self.storage_numel() {
            return Err(Error::InvalidArgument {
                arg: "offset",
                reason: format!(
                    "view reaches element {reach} but storage holds {}",
                    self.storage_numel()
                ),
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            offset,
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
        })
    }

    /// Narrow dimension `dim` to `[start, start + length)`, returning a view.
    pub fn narrow(&self, dim: usize, start: usize, length: usize) -> Result<Tensor> {
        if dim >= self.sizes.len() {
            return Err(Error::InvalidArgument {
                arg: "dim",
                reason: format!("dimension {dim} out of range for rank {}", self.sizes.len()),
            });
        }
        if start + length > self.sizes[dim] {
            return Err(Error::InvalidArgument {
                arg: "length",
                reason: format!(
                    "narrow [{start}, {}) exceeds size {}",
                    start + length,
                    self.sizes[dim]
                ),
            });
        }
        let mut sizes = self.sizes.clone();
        sizes[dim] = length;
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            offset: self.offset + start * self.strides[dim],
            sizes,
            strides: self.strides.clone(),
        })
    }

    /// Reshape a contiguous view without copying.
    pub fn view(&self, sizes: &[usize]) -> Result<Tensor> {
        if !self.is_contiguous() {
            return Err(Error::InvalidArgument {
                arg: "self",
                reason: "view requires a contiguous tensor".to_string(),
            });
        }
        if layout::numel(sizes) != self.numel() {
            return Err(Error::InvalidArgument {
                arg: "sizes",
                reason: format!(
                    "cannot view {} elements as {sizes:?}",
                    self.numel()
                ),
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            offset: self.offset,
            sizes: sizes.to_vec(),
            strides: layout::contiguous_strides(sizes),
        })
    }

    /// Materialize a contiguous copy tagged with `device`. Storage stays
    /// host-backed; the tag participates in bucketing and verification.
    pub fn to_device(&self, device: Device) -> Tensor {
        let bytes = self.gather_bytes();
        Tensor {
            storage: Arc::new(Storage {
                data: RwLock::new(bytes),
                device,
            }),
            dtype: self.dtype,
            offset: 0,
            sizes: self.sizes.clone(),
            strides: layout::contiguous_strides(&self.sizes),
        }
    }

    /// Element bytes of this view in row-major logical order.
    fn gather_bytes(&self) -> Vec<u8> {
        let esize = self.element_size();
        let mut out = Vec::with_capacity(self.numel() * esize);
        self.storage.with(|data| {
            for off in OffsetIter::new(&self.sizes, &self.strides, self.offset) {
                out.extend_from_slice(&data[off * esize..(off + 1) * esize]);
            }
        });
        out
    }

    fn scatter_bytes(&self, bytes: &[u8]) {
        let esize = self.element_size();
        self.storage.with_mut(|data| {
            for (chunk, off) in bytes
                .chunks_exact(esize)
                .zip(OffsetIter::new(&self.sizes, &self.strides, self.offset))
            {
                data[off * esize..(off + 1) * esize].copy_from_slice(chunk);
            }
        });
    }

    /// Copy `src` into this view, element by element in logical order.
    ///
    /// Both tensors must share dtype and element count; layouts and devices
    /// may differ. Safe when source and destination alias the same storage:
    /// the source is fully read before the destination is written.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        self.check_compatible(src)?;
        let bytes = src.gather_bytes();
        self.scatter_bytes(&bytes);
        Ok(())
    }

    /// Copy `src` into this view, multiplying every element by `scale` on
    /// the way (the divide-while-copying used for gradient averaging).
    pub fn copy_scaled_from(&self, src: &Tensor, scale: f64) -> Result<()> {
        self.check_compatible(src)?;
        if !self.dtype.is_floating_point() {
            return Err(Error::InvalidArgument {
                arg: "self",
                reason: format!("scaled copy requires a float tensor, got {}", self.dtype),
            });
        }
        let values = src.read_f64_values();
        self.write_f64_values(values.into_iter().map(|v| v * scale));
        Ok(())
    }

    /// Divide every element in place.
    pub fn div_scalar_(&self, divisor: f64) -> Result<()> {
        if !self.dtype.is_floating_point() {
            return Err(Error::InvalidArgument {
                arg: "self",
                reason: format!("in-place divide requires a float tensor, got {}", self.dtype),
            });
        }
        let values = self.read_f64_values();
        self.write_f64_values(values.into_iter().map(|v| v / divisor));
        Ok(())
    }

    /// Zero every element of this view.
    pub fn zero_(&self) {
        let esize = self.element_size();
        self.storage.with_mut(|data| {
            for off in OffsetIter::new(&self.sizes, &self.strides, self.offset) {
                data[off * esize..(off + 1) * esize].fill(0);
            }
        });
    }

    /// Element-wise `self += src` with exact integer arithmetic, used by the
    /// in-process allreduce.
    pub fn add_assign_from(&self, src: &Tensor) -> Result<()> {
        self.check_compatible(src)?;
        match self.dtype {
            DType::F32 => self.add_assign_impl::<f32>(src),
            DType::F64 => self.add_assign_impl::<f64>(src),
            DType::F16 => self.add_assign_impl::<half::f16>(src),
            DType::BF16 => self.add_assign_impl::<half::bf16>(src),
            DType::I32 => self.add_assign_impl::<i32>(src),
            DType::I64 => self.add_assign_impl::<i64>(src),
        }
        Ok(())
    }

    fn add_assign_impl<E: Element>(&self, src: &Tensor) {
        let incoming: Vec<u8> = src.gather_bytes();
        let esize = self.element_size();
        self.storage.with_mut(|data| {
            for (chunk, off) in incoming
                .chunks_exact(esize)
                .zip(OffsetIter::new(&self.sizes, &self.strides, self.offset))
            {
                let slot = &mut data[off * esize..(off + 1) * esize];
                let sum = E::add(E::read(slot), E::read(chunk));
                sum.write(slot);
            }
        });
    }

    fn check_compatible(&self, src: &Tensor) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: src.dtype,
            });
        }
        if self.numel() != src.numel() {
            return Err(Error::GradientMismatch {
                reason: format!(
                    "element count mismatch: {} vs {}",
                    self.numel(),
                    src.numel()
                ),
            });
        }
        Ok(())
    }

    fn read_f64_values(&self) -> Vec<f64> {
        fn collect<E: Element>(t: &Tensor) -> Vec<f64> {
            let esize = t.element_size();
            let mut out = Vec::with_capacity(t.numel());
            t.storage.with(|data| {
                for off in OffsetIter::new(&t.sizes, &t.strides, t.offset) {
                    out.push(E::read(&data[off * esize..(off + 1) * esize]).to_f64());
                }
            });
            out
        }
        match self.dtype {
            DType::F32 => collect::<f32>(self),
            DType::F64 => collect::<f64>(self),
            DType::F16 => collect::<half::f16>(self),
            DType::BF16 => collect::<half::bf16>(self),
            DType::I32 => collect::<i32>(self),
            DType::I64 => collect::<i64>(self),
        }
    }

    fn write_f64_values(&self, values: impl Iterator<Item = f64>) {
        fn scatter<E: Element>(t: &Tensor, values: impl Iterator<Item = f64>) {
            let esize = t.element_size();
            t.storage.with_mut(|data| {
                for (v, off) in values.zip(OffsetIter::new(&t.sizes, &t.strides, t.offset)) {
                    E::from_f64(v).write(&mut data[off * esize..(off + 1) * esize]);
                }
            });
        }
        match self.dtype {
            DType::F32 => scatter::<f32>(self, values),
            DType::F64 => scatter::<f64>(self, values),
            DType::F16 => scatter::<half::f16>(self, values),
            DType::BF16 => scatter::<half::bf16>(self, values),
            DType::I32 => scatter::<i32>(self, values),
            DType::I64 => scatter::<i64>(self, values),
        }
    }

    /// All elements of this view in logical order.
    pub fn to_vec<E: Element>(&self) -> Result<Vec<E>> {
        if E::DTYPE != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: E::DTYPE,
            });
        }
        let esize = self.element_size();
        let mut out = Vec::with_capacity(self.numel());
        self.storage.with(|data| {
            for off in OffsetIter::new(&self.sizes, &self.strides, self.offset) {
                out.push(E::read(&data[off * esize..(off + 1) * esize]));
            }
        });
        Ok(out)
    }

    /// Read the element at logical flat index `index`.
    pub fn get<E: Element>(&self, index: usize) -> Result<E> {
        self.check_index::<E>(index)?;
        let off = layout::offset_of(&self.sizes, &self.strides, self.offset, index);
        let esize = self.element_size();
        Ok(self
            .storage
            .with(|data| E::read(&data[off * esize..(off + 1) * esize])))
    }

    /// Write the element at logical flat index `index`.
    pub fn set<E: Element>(&self, index: usize, value: E) -> Result<()> {
        self.check_index::<E>(index)?;
        let off = layout::offset_of(&self.sizes, &self.strides, self.offset, index);
        let esize = self.element_size();
        self.storage
            .with_mut(|data| value.write(&mut data[off * esize..(off + 1) * esize]));
        Ok(())
    }

    fn check_index<E: Element>(&self, index: usize) -> Result<()> {
        if E::DTYPE != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: E::DTYPE,
            });
        }
        if index >= self.numel() {
            return Err(Error::InvalidArgument {
                arg: "index",
                reason: format!("index {index} out of range for {} elements", self.numel()),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("device", &self.storage.device)
            .field("sizes", &self.sizes)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_roundtrip() {
        let t = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3], Device::Cpu);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(t.dtype(), DType::F32);
        assert!(t.is_contiguous());
    }

    #[test]
    fn test_clone_aliases() {
        let t = Tensor::from_slice(&[1.0f32, 2.0], &[2], Device::Cpu);
        let u = t.clone();
        u.set::<f32>(0, 9.0).unwrap();
        assert_eq!(t.get::<f32>(0).unwrap(), 9.0);
        assert!(t.is_alias_of(&u));
    }

    #[test]
    fn test_as_strided_view_writes_through() {
        let flat = Tensor::zeros(&[6], DType::F32, Device::Cpu);
        let view = flat.as_strided(&[2, 2], &[2, 1], 2).unwrap();
        view.copy_from(&Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], Device::Cpu))
            .unwrap();
        assert_eq!(
            flat.to_vec::<f32>().unwrap(),
            vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_as_strided_out_of_bounds() {
        let flat = Tensor::zeros(&[4], DType::F32, Device::Cpu);
        assert!(flat.as_strided(&[4], &[1], 1).is_err());
    }

    #[test]
    fn test_narrow_then_view() {
        let flat = Tensor::from_slice(&[0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0], &[6], Device::Cpu);
        let slice = flat.narrow(0, 2, 4).unwrap().view(&[2, 2]).unwrap();
        assert_eq!(slice.to_vec::<f32>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
        assert!(slice.is_alias_of(&flat));
    }

    #[test]
    fn test_copy_from_transposed_layout() {
        // Copy between differing layouts goes through logical order.
        let src = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], Device::Cpu);
        let dst_storage = Tensor::zeros(&[4], DType::F32, Device::Cpu);
        let dst = dst_storage.as_strided(&[2, 2], &[1, 2], 0).unwrap();
        dst.copy_from(&src).unwrap();
        // Column-major destination: element (i, j) lands at i + 2j.
        assert_eq!(dst_storage.to_vec::<f32>().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_copy_from_dtype_mismatch() {
        let a = Tensor::zeros(&[2], DType::F32, Device::Cpu);
        let b = Tensor::zeros(&[2], DType::F64, Device::Cpu);
        assert!(matches!(
            a.copy_from(&b),
            Err(crate::error::Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_copy_scaled_from() {
        let src = Tensor::from_slice(&[2.0f32, 4.0], &[2], Device::Cpu);
        let dst = Tensor::zeros(&[2], DType::F32, Device::Cpu);
        dst.copy_scaled_from(&src, 0.5).unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_div_scalar_in_place() {
        let t = Tensor::from_slice(&[2.0f32, 6.0], &[2], Device::Cpu);
        t.div_scalar_(2.0).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_div_scalar_rejects_integers() {
        let t = Tensor::zeros(&[2], DType::I32, Device::Cpu);
        assert!(t.div_scalar_(2.0).is_err());
    }

    #[test]
    fn test_zero_only_touches_view() {
        let flat = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[4], Device::Cpu);
        flat.narrow(0, 1, 2).unwrap().zero_();
        assert_eq!(flat.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn test_add_assign_from() {
        let a = Tensor::from_slice(&[1i64, 2, 3], &[3], Device::Cpu);
        let b = Tensor::from_slice(&[10i64, 20, 30], &[3], Device::Cpu);
        a.add_assign_from(&b).unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap(), vec![11, 22, 33]);
    }

    #[test]
    fn test_to_device_copies() {
        let t = Tensor::from_slice(&[1.0f32, 2.0], &[2], Device::Cpu);
        let d = t.to_device(Device::Accel(0));
        assert_eq!(d.device(), Device::Accel(0));
        assert!(!d.is_alias_of(&t));
        assert_eq!(d.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_f16_scaled_copy() {
        use half::f16;
        let src = Tensor::from_slice(&[f16::from_f64(4.0), f16::from_f64(8.0)], &[2], Device::Cpu);
        let dst = Tensor::zeros(&[2], DType::F16, Device::Cpu);
        dst.copy_scaled_from(&src, 0.25).unwrap();
        let out = dst.to_vec::<f16>().unwrap();
        assert_eq!(out[0].to_f64(), 1.0);
        assert_eq!(out[1].to_f64(), 2.0);
    }
}
