use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{FuseError, FuseResult};

/// Opaque device address. Host-side backends hand out synthetic addresses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn offset(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Gather applied to one axis of a tensor through an `int32` index array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Take {
    pub index: DevicePtr,
    pub axis: usize,
}

/// How a store narrows float registers into the tensor's storage dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rounding {
    #[default]
    Off,
    Nearest,
    Stochastic { mantissa_bits: u32 },
}

/// Borrowed view of externally owned device memory.
///
/// `shape` is the logical shape seen by the expression (after any gather),
/// `strides` are element strides into the underlying storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTensor {
    ptr: DevicePtr,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<isize>,
    contiguous: bool,
    take: Option<Take>,
    rounding: Rounding,
}

pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![1isize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1].max(1) as isize;
    }
    strides
}

impl DeviceTensor {
    pub fn new(ptr: DevicePtr, dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let strides = contiguous_strides(&shape);
        Self {
            ptr,
            dtype,
            shape,
            strides,
            contiguous: true,
            take: None,
            rounding: Rounding::Off,
        }
    }

    pub fn with_strides(mut self, strides: impl Into<Vec<isize>>) -> Self {
        self.strides = strides.into();
        self.contiguous = self.strides == contiguous_strides(&self.shape);
        self
    }

    /// Swaps the two axes of a rank-2 view without moving data.
    pub fn transposed(mut self) -> Self {
        if self.shape.len() == 2 {
            self.shape.swap(0, 1);
            self.strides.swap(0, 1);
            self.contiguous = self.strides == contiguous_strides(&self.shape);
        }
        self
    }

    /// Gathers `len` entries along `axis` through the `int32` array at `index`.
    pub fn with_take(mut self, index: DevicePtr, axis: usize, len: usize) -> Self {
        if axis < self.shape.len() {
            self.shape[axis] = len;
        }
        self.take = Some(Take { index, axis });
        self
    }

    pub fn with_rounding(mut self, rounding: Rounding) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn take(&self) -> Option<Take> {
        self.take
    }

    pub fn rounding(&self) -> Rounding {
        self.rounding
    }

    /// Rejects views whose strides do not name every axis.
    pub fn check_layout(&self) -> FuseResult<()> {
        if self.strides.len() != self.shape.len() {
            return Err(FuseError::unsupported(format!(
                "{} strides for a rank-{} tensor",
                self.strides.len(),
                self.rank()
            )));
        }
        Ok(())
    }

    /// True for rank-2 views whose first axis moves faster than the second.
    pub fn is_transposed(&self) -> bool {
        matches!(self.strides.as_slice(), [rows, cols] if self.rank() == 2 && rows < cols)
    }

    /// True when the view carries an implicit broadcast (rank < 2 or a unit axis).
    pub fn is_broadcast(&self) -> bool {
        self.rank() < 2 || (self.rank() == 2 && (self.shape[0] == 1 || self.shape[1] == 1))
    }

    /// Rows/cols view. Rank-1 tensors become a single row, scalars a 1x1 view.
    pub fn view_2d(&self) -> Option<([usize; 2], [isize; 2])> {
        match (self.shape.as_slice(), self.strides.as_slice()) {
            ([], []) => Some(([1, 1], [1, 1])),
            (&[len], &[stride]) => Some(([1, len], [len as isize * stride, stride])),
            (&[rows, cols], &[row_strd, col_strd]) => Some(([rows, cols], [row_strd, col_strd])),
            _ => None,
        }
    }
}

/// Persistent per-thread generator state shared by every kernel that draws
/// random numbers or rounds stochastically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandState {
    ptr: DevicePtr,
}

impl RandState {
    /// Number of 32-bit words in the state pool; threads index it modulo this size.
    pub const POOL_WORDS: usize = 2048 * 32;

    pub fn from_ptr(ptr: DevicePtr) -> Self {
        Self { ptr }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Seed words for the pool. The low bit pattern keeps every word a valid
    /// Tausworthe state (the first component degenerates below 2).
    pub fn seed_words(seed: u64) -> Vec<u32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..Self::POOL_WORDS).map(|_| rng.gen::<u32>() | 0x80).collect()
    }

    /// Allocates and seeds a fresh pool on `device`.
    pub fn allocate<D: Device + ?Sized>(device: &D, seed: u64) -> FuseResult<Self> {
        let words = Self::seed_words(seed);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let ptr = device.alloc(bytes.len())?;
        device.upload(ptr, &bytes)?;
        Ok(Self { ptr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposed_view_is_flagged_and_not_contiguous() {
        let base = DeviceTensor::new(DevicePtr(64), DType::F32, vec![3, 4]);
        assert!(base.is_contiguous());
        assert!(!base.is_transposed());

        let t = base.transposed();
        assert_eq!(t.shape(), &[4, 3]);
        assert_eq!(t.strides(), &[1, 4]);
        assert!(t.is_transposed());
        assert!(!t.is_contiguous());
    }

    #[test]
    fn low_rank_views_become_rows() {
        let v = DeviceTensor::new(DevicePtr(64), DType::F16, vec![7]);
        assert_eq!(v.view_2d(), Some(([1, 7], [7, 1])));
        assert!(v.is_broadcast());

        let s = DeviceTensor::new(DevicePtr(64), DType::F32, Vec::<usize>::new());
        assert_eq!(s.view_2d(), Some(([1, 1], [1, 1])));
        assert_eq!(s.len(), 1);

        let cube = DeviceTensor::new(DevicePtr(64), DType::F32, vec![2, 3, 4]);
        assert_eq!(cube.view_2d(), None);
    }

    #[test]
    fn short_strides_are_rejected_without_panicking() {
        let t = DeviceTensor::new(DevicePtr(64), DType::F32, vec![3, 4]).with_strides(vec![4]);
        assert!(!t.is_contiguous());
        assert!(!t.is_transposed());
        assert_eq!(t.view_2d(), None);
        assert!(matches!(t.check_layout(), Err(FuseError::UnsupportedShape { .. })));
        let ok = DeviceTensor::new(DevicePtr(64), DType::F32, vec![3, 4]).with_strides(vec![1, 3]);
        assert!(ok.check_layout().is_ok());
    }

    #[test]
    fn seed_words_are_deterministic_and_non_degenerate() {
        let a = RandState::seed_words(7);
        let b = RandState::seed_words(7);
        assert_eq!(a.len(), RandState::POOL_WORDS);
        assert_eq!(a, b);
        assert!(a.iter().all(|w| *w >= 2));
        assert_ne!(a, RandState::seed_words(8));
    }
}
