//! Host tensors for CPU/device data interchange, and device tensor handles.

use crate::device::{BufferId, MemPoolId};
use crate::error::{Result, RuntimeError};
use bytemuck::Pod;
use ember_core::DataType;
use half::{bf16, f16};
use std::sync::{Arc, RwLock};

/// Rust element types that map onto a `DataType`.
pub trait Element: Pod {
    const DTYPE: DataType;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const DTYPE: DataType = DataType::F16;

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    const DTYPE: DataType = DataType::BF16;

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

fn read_elements<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Decode raw element bytes of type `dtype` into f32 values.
pub fn decode_f32(bytes: &[u8], dtype: DataType) -> Vec<f32> {
    match dtype {
        DataType::F32 => read_elements::<f32>(bytes),
        DataType::F16 => read_elements::<f16>(bytes)
            .into_iter()
            .map(f16::to_f32)
            .collect(),
        DataType::BF16 => read_elements::<bf16>(bytes)
            .into_iter()
            .map(bf16::to_f32)
            .collect(),
    }
}

/// Encode f32 values as raw element bytes of type `dtype`, rounding to nearest.
pub fn encode_f32(values: &[f32], dtype: DataType) -> Vec<u8> {
    match dtype {
        DataType::F32 => bytemuck::cast_slice(values).to_vec(),
        DataType::F16 => {
            let converted: Vec<f16> = values.iter().copied().map(f16::from_f32).collect();
            bytemuck::cast_slice(&converted).to_vec()
        }
        DataType::BF16 => {
            let converted: Vec<bf16> = values.iter().copied().map(bf16::from_f32).collect();
            bytemuck::cast_slice(&converted).to_vec()
        }
    }
}

/// User-facing tensor living in host memory.
///
/// Used to move data onto a device (`Device::upload`) and back off it
/// (`Device::download`).
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DataType,
}

impl HostTensor {
    /// Create a tensor from a vector with a given shape.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` doesn't match the number of elements in `shape`.
    ///
    /// # Example
    /// ```
    /// # use ember_runtime::HostTensor;
    /// let tensor = HostTensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
    /// assert_eq!(tensor.len(), 4);
    /// ```
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_len
        );

        Self {
            data: bytemuck::cast_slice(&data).to_vec(),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        }
    }

    /// Create a tensor of `dtype` from f32 values, rounding as needed.
    pub fn from_f32(values: &[f32], shape: &[usize], dtype: DataType) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if values.len() != expected_len {
            return Err(RuntimeError::Tensor(format!(
                "Data length {} doesn't match shape {shape:?} (expected {expected_len})",
                values.len()
            )));
        }
        Ok(Self::from_raw(encode_f32(values, dtype), shape, dtype))
    }

    pub(crate) fn from_raw(data: Vec<u8>, shape: &[usize], dtype: DataType) -> Self {
        Self {
            data,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Convert tensor to a Vec of its native element type.
    ///
    /// # Errors
    /// Returns an error if `T` doesn't match the tensor's dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::DTypeMismatch {
                expected: self.dtype,
                actual: T::DTYPE,
            });
        }
        Ok(read_elements(&self.data))
    }

    /// Convert tensor values to f32 regardless of storage type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        decode_f32(&self.data, self.dtype)
    }

    /// Get raw bytes of the tensor data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the data type of the tensor.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Get the total number of elements in the tensor.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A device memory allocation.
///
/// The `id` is the buffer's device address: it never changes for the
/// lifetime of the allocation, which is what captured graphs rely on.
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    pool: Option<MemPoolId>,
    data: RwLock<Vec<u8>>,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, pool: Option<MemPoolId>, data: Vec<u8>) -> Self {
        Self {
            id,
            pool,
            data: RwLock::new(data),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Memory pool the buffer was allocated from while capturing, if any.
    pub fn pool(&self) -> Option<MemPoolId> {
        self.pool
    }

    pub(crate) fn read_bytes(&self) -> Result<Vec<u8>> {
        self.data
            .read()
            .map(|data| data.clone())
            .map_err(|_| RuntimeError::Execution(format!("buffer {} is poisoned", self.id)))
    }

    pub(crate) fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| RuntimeError::Execution(format!("buffer {} is poisoned", self.id)))?;
        if data.len() != bytes.len() {
            return Err(RuntimeError::Execution(format!(
                "write of {} bytes into buffer {} of {} bytes",
                bytes.len(),
                self.id,
                data.len()
            )));
        }
        data.copy_from_slice(bytes);
        Ok(())
    }
}

/// A tensor resident on a device.
///
/// `Tensor` is a handle: cloning it is cheap and the clone refers to the same
/// buffer (the same address). Use `DeviceCtx::clone_tensor` for a copy with
/// its own storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Arc<Buffer>,
    shape: Vec<usize>,
    dtype: DataType,
}

impl Tensor {
    pub(crate) fn new(buffer: Arc<Buffer>, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            buffer,
            shape,
            dtype,
        }
    }

    /// Device address of the underlying buffer.
    pub fn address(&self) -> BufferId {
        self.buffer.id()
    }

    /// Memory pool of the underlying buffer, if it was allocated during capture.
    pub fn pool(&self) -> Option<MemPoolId> {
        self.buffer.pool()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
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

    pub fn size_bytes(&self) -> usize {
        self.len() * self.dtype.size()
    }

    /// Whether both handles refer to the same device buffer.
    pub fn shares_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    pub(crate) fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub(crate) fn read_f32(&self) -> Result<Vec<f32>> {
        Ok(decode_f32(&self.buffer.read_bytes()?, self.dtype))
    }

    pub(crate) fn write_f32(&self, values: &[f32]) -> Result<()> {
        self.buffer.write_bytes(&encode_f32(values, self.dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tensor_from_vec() {
        let tensor = HostTensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]);

        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.dtype(), DataType::F32);
        assert_eq!(tensor.len(), 4);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_host_tensor_shape_mismatch() {
        HostTensor::from_vec(vec![1.0f32, 2.0, 3.0], &[2, 2]);
    }

    #[test]
    fn test_to_vec_checks_dtype() {
        let tensor = HostTensor::from_vec(vec![f16::from_f32(1.5)], &[1]);
        assert!(matches!(
            tensor.to_vec::<f32>(),
            Err(RuntimeError::DTypeMismatch { .. })
        ));
        assert_eq!(tensor.to_vec::<f16>().unwrap(), vec![f16::from_f32(1.5)]);
    }

    #[test]
    fn test_half_precision_rounding() {
        let values = [1.0f32, 0.1, -3.25];
        let f16_tensor = HostTensor::from_f32(&values, &[3], DataType::F16).unwrap();
        let bf16_tensor = HostTensor::from_f32(&values, &[3], DataType::BF16).unwrap();

        assert_eq!(f16_tensor.as_bytes().len(), 6);
        assert_eq!(f16_tensor.to_f32_vec()[0], 1.0);
        assert!((f16_tensor.to_f32_vec()[1] - 0.1).abs() < 1e-3);
        assert_eq!(bf16_tensor.to_f32_vec()[2], -3.25);
    }

    #[test]
    fn test_buffer_write_size_checked() {
        let buffer = Buffer::new(BufferId(1), None, vec![0; 8]);
        assert!(buffer.write_bytes(&[1; 8]).is_ok());
        assert!(buffer.write_bytes(&[1; 4]).is_err());
        assert_eq!(buffer.read_bytes().unwrap(), vec![1; 8]);
    }

    #[test]
    fn test_cloned_handle_aliases_buffer() {
        let buffer = Arc::new(Buffer::new(BufferId(7), None, vec![0; 8]));
        let a = Tensor::new(buffer, vec![2], DataType::F32);
        let b = a.clone();

        b.write_f32(&[3.0, 4.0]).unwrap();

        assert!(a.shares_buffer(&b));
        assert_eq!(a.address(), BufferId(7));
        assert_eq!(a.read_f32().unwrap(), vec![3.0, 4.0]);
    }
}
