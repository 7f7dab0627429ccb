//! Host-resident N-dimensional tensor with mixed dtype support.
//!
//! Provides the [`Tensor`] type fed to and returned from runners. Storage is
//! typed per [`DataType`]; a raw little-endian byte view is available for
//! device transfers, and [`Tensor::cast`] performs numeric conversion between
//! dtypes when an engine declares a different input type than the caller
//! supplied.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RunnerError;

/// Data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    BF16,
    I8,
    U8,
    I32,
    I64,
    Bool,
}

impl DataType {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 | DataType::Bool => 1,
            DataType::I64 => 8,
        }
    }

    /// Whether values of this type are integers usable as shape-tensor values.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::I8 | DataType::U8 | DataType::I32 | DataType::I64
        )
    }
}

/// Storage for tensor data, varying by dtype.
///
/// `Bool` is stored as one byte per element (0 or 1), matching the device
/// layout engines expect.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<u8>),
}

impl TensorStorage {
    fn dtype(&self) -> DataType {
        match self {
            TensorStorage::F32(_) => DataType::F32,
            TensorStorage::F16(_) => DataType::F16,
            TensorStorage::BF16(_) => DataType::BF16,
            TensorStorage::I8(_) => DataType::I8,
            TensorStorage::U8(_) => DataType::U8,
            TensorStorage::I32(_) => DataType::I32,
            TensorStorage::I64(_) => DataType::I64,
            TensorStorage::Bool(_) => DataType::Bool,
        }
    }

    fn len(&self) -> usize {
        match self {
            TensorStorage::F32(v) => v.len(),
            TensorStorage::F16(v) => v.len(),
            TensorStorage::BF16(v) => v.len(),
            TensorStorage::I8(v) => v.len(),
            TensorStorage::U8(v) => v.len(),
            TensorStorage::I32(v) => v.len(),
            TensorStorage::I64(v) => v.len(),
            TensorStorage::Bool(v) => v.len(),
        }
    }

    fn to_f64(&self) -> Vec<f64> {
        match self {
            TensorStorage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::F16(v) => v.iter().map(|x| x.to_f64()).collect(),
            TensorStorage::BF16(v) => v.iter().map(|x| x.to_f64()).collect(),
            TensorStorage::I8(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::U8(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::I32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::I64(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::Bool(v) => v.iter().map(|&x| if x != 0 { 1.0 } else { 0.0 }).collect(),
        }
    }

    fn from_f64(dtype: DataType, values: &[f64]) -> TensorStorage {
        // `as` saturates out-of-range floats and maps NaN to zero.
        match dtype {
            DataType::F32 => TensorStorage::F32(values.iter().map(|&x| x as f32).collect()),
            DataType::F16 => TensorStorage::F16(values.iter().map(|&x| f16::from_f64(x)).collect()),
            DataType::BF16 => {
                TensorStorage::BF16(values.iter().map(|&x| bf16::from_f64(x)).collect())
            }
            DataType::I8 => TensorStorage::I8(values.iter().map(|&x| x as i8).collect()),
            DataType::U8 => TensorStorage::U8(values.iter().map(|&x| x as u8).collect()),
            DataType::I32 => TensorStorage::I32(values.iter().map(|&x| x as i32).collect()),
            DataType::I64 => TensorStorage::I64(values.iter().map(|&x| x as i64).collect()),
            DataType::Bool => {
                TensorStorage::Bool(values.iter().map(|&x| (x != 0.0) as u8).collect())
            }
        }
    }
}

/// N-dimensional host tensor with dtype and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DataType,
    storage: TensorStorage,
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self::from_storage(shape, TensorStorage::F32(data))
    }

    /// Create a tensor of any dtype from shape and typed storage.
    ///
    /// # Panics
    /// Panics if the storage length does not match the product of `shape`.
    pub fn from_storage(shape: Vec<usize>, storage: TensorStorage) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            storage.len(),
            n_elements,
            "Data length {} does not match shape {:?} (expected {})",
            storage.len(),
            shape,
            n_elements
        );
        let dtype = storage.dtype();
        trace!(?dtype, ?shape, "Created tensor");
        Self {
            shape,
            dtype,
            storage,
        }
    }

    /// Create an I32 tensor.
    pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> Self {
        Self::from_storage(shape, TensorStorage::I32(data))
    }

    /// Create an I64 tensor.
    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Self {
        Self::from_storage(shape, TensorStorage::I64(data))
    }

    /// Create a zero-filled tensor of the given dtype.
    pub fn zeros(shape: &[usize], dtype: DataType) -> Self {
        let n_elements: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            dtype,
            storage: TensorStorage::from_f64(dtype, &vec![0.0; n_elements]),
        }
    }

    /// Build a tensor from raw little-endian element bytes.
    ///
    /// Used to materialise device outputs after a device-to-host copy.
    pub fn from_bytes(shape: &[usize], dtype: DataType, bytes: &[u8]) -> Result<Self, RunnerError> {
        let n_elements: usize = shape.iter().product();
        let expected = n_elements * dtype.size();
        if bytes.len() != expected {
            return Err(RunnerError::Device(format!(
                "byte length {} does not match shape {:?} of {:?} (expected {})",
                bytes.len(),
                shape,
                dtype,
                expected
            )));
        }
        let storage = match dtype {
            DataType::F32 => TensorStorage::F32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::F16 => TensorStorage::F16(bytemuck::pod_collect_to_vec(bytes)),
            DataType::BF16 => TensorStorage::BF16(bytemuck::pod_collect_to_vec(bytes)),
            DataType::I8 => TensorStorage::I8(bytemuck::pod_collect_to_vec(bytes)),
            DataType::U8 => TensorStorage::U8(bytes.to_vec()),
            DataType::I32 => TensorStorage::I32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::I64 => TensorStorage::I64(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Bool => TensorStorage::Bool(bytes.iter().map(|&b| (b != 0) as u8).collect()),
        };
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            storage,
        })
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the data type of the tensor.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Returns the storage of the tensor.
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Returns the total number of elements in the tensor.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the size of the tensor data in bytes.
    pub fn nbytes(&self) -> usize {
        self.n_elements() * self.dtype.size()
    }

    /// Raw little-endian view of the element data.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            TensorStorage::F32(v) => bytemuck::cast_slice(v),
            TensorStorage::F16(v) => bytemuck::cast_slice(v),
            TensorStorage::BF16(v) => bytemuck::cast_slice(v),
            TensorStorage::I8(v) => bytemuck::cast_slice(v),
            TensorStorage::U8(v) => v,
            TensorStorage::I32(v) => bytemuck::cast_slice(v),
            TensorStorage::I64(v) => bytemuck::cast_slice(v),
            TensorStorage::Bool(v) => v,
        }
    }

    /// Returns a reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Element values widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.storage.to_f64()
    }

    /// Integer element values, for shape tensors.
    ///
    /// Returns `None` if the dtype is not an integer type.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match &self.storage {
            TensorStorage::I8(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorStorage::U8(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorStorage::I32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorStorage::I64(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Convert element values to another dtype.
    ///
    /// This is a numeric conversion, not a reinterpretation of bytes. Casting
    /// to the tensor's own dtype returns a clone.
    pub fn cast(&self, dtype: DataType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        trace!(from = ?self.dtype, to = ?dtype, shape = ?self.shape, "Casting tensor");
        let storage = match (&self.storage, dtype) {
            // Integer widening stays exact beyond f64's 53-bit mantissa.
            (TensorStorage::I32(v), DataType::I64) => {
                TensorStorage::I64(v.iter().map(|&x| x as i64).collect())
            }
            _ => TensorStorage::from_f64(dtype, &self.storage.to_f64()),
        };
        Tensor {
            shape: self.shape.clone(),
            dtype,
            storage,
        }
    }

    /// Reshape the tensor to a new shape with the same number of elements.
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_n_elements: usize = new_shape.iter().product();
        assert_eq!(
            self.n_elements(),
            new_n_elements,
            "Cannot reshape tensor of {} elements to shape {:?} ({} elements)",
            self.n_elements(),
            new_shape,
            new_n_elements
        );
        Tensor {
            shape: new_shape.to_vec(),
            dtype: self.dtype,
            storage: self.storage.clone(),
        }
    }
}
