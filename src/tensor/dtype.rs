//! Element types and device placement tags.

use half::{bf16, f16};

/// Element types supported for bucket buffers and gradients.
///
/// syncr defines its own dtype enum so it remains a standalone library
/// usable with any tensor frontend. Discriminants are stable and `repr(u8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I32 = 4,
    I64 = 5,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::F16 | DType::BF16 => 2,
        }
    }

    /// Whether this is a floating-point type.
    pub const fn is_floating_point(self) -> bool {
        matches!(self, DType::F32 | DType::F64 | DType::F16 | DType::BF16)
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I32 => "i32",
            DType::I64 => "i64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical placement of a tensor.
///
/// The reference runtime keeps all storage in host memory; accelerator
/// devices are placement tags that participate in bucket keying and
/// cross-process verification, the same way a host-offload adapter treats
/// host pointers as device pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    /// Accelerator ordinal.
    Accel(u8),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accel(i) => write!(f, "accel:{i}"),
        }
    }
}

/// A Rust scalar type that can live in a [`crate::tensor::Tensor`].
///
/// `read`/`write` move raw little-endian element bytes; `to_f64`/`from_f64`
/// support scaled copies and in-place division on float buffers; `add` is
/// the exact element-wise sum used by the reference allreduce.
pub trait Element: Copy + Send + Sync + 'static {
    /// The dtype tag for this element type.
    const DTYPE: DType;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn add(a: Self, b: Self) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $from:expr, $to:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn read(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(buf)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }

            fn to_f64(self) -> f64 {
                $to(self)
            }

            fn from_f64(v: f64) -> Self {
                $from(v)
            }

            fn add(a: Self, b: Self) -> Self {
                a + b
            }
        }
    };
}

impl_element!(f32, DType::F32, |v: f64| v as f32, |s: f32| s as f64);
impl_element!(f64, DType::F64, |v: f64| v, |s: f64| s);
impl_element!(f16, DType::F16, f16::from_f64, |s: f16| s.to_f64());
impl_element!(bf16, DType::BF16, bf16::from_f64, |s: bf16| s.to_f64());
impl_element!(i32, DType::I32, |v: f64| v as i32, |s: i32| s as f64);
impl_element!(i64, DType::I64, |v: f64| v as i64, |s: i64| s as f64);
