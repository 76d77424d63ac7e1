//! Explicit execution context and tensor operations.
//!
//! There is no ambient "current stream": every operation is issued through a
//! `DeviceCtx` naming the device and the stream the work goes to. Model code
//! takes a context by value and passes it along.

use crate::device::{Device, StreamId};
use crate::error::{Result, RuntimeError};
use crate::kernel::{BinaryOp, Kernel, matmul_shape, transpose_shape};
use crate::tensor::{HostTensor, Tensor};
use ember_core::DataType;
use ember_core::broadcast::{broadcast_shape, normalize_axis};

/// A device and the stream to issue work on.
pub struct DeviceCtx<'a, D: Device> {
    pub device: &'a D,
    pub stream: StreamId,
}

impl<D: Device> Clone for DeviceCtx<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Device> Copy for DeviceCtx<'_, D> {}

impl<D: Device> std::fmt::Debug for DeviceCtx<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCtx")
            .field("device", &self.device.name())
            .field("stream", &self.stream)
            .finish()
    }
}

impl<'a, D: Device> DeviceCtx<'a, D> {
    pub fn new(device: &'a D, stream: StreamId) -> Self {
        Self { device, stream }
    }

    /// Context for the device's default stream.
    pub fn on_default_stream(device: &'a D) -> Self {
        Self::new(device, device.default_stream())
    }

    /// Same device, different stream.
    pub fn with_stream(&self, stream: StreamId) -> Self {
        Self::new(self.device, stream)
    }

    fn launch(&self, kernel: Kernel, inputs: &[&Tensor], output: &Tensor) -> Result<()> {
        let inputs: Vec<Tensor> = inputs.iter().map(|&t| t.clone()).collect();
        self.device.launch(self.stream, kernel, &inputs, output)
    }

    /// Allocate without initializing.
    pub fn empty(&self, shape: &[usize], dtype: DataType) -> Result<Tensor> {
        self.device.allocate(self.stream, shape, dtype)
    }

    pub fn empty_like(&self, x: &Tensor) -> Result<Tensor> {
        self.empty(x.shape(), x.dtype())
    }

    pub fn zeros(&self, shape: &[usize], dtype: DataType) -> Result<Tensor> {
        let out = self.empty(shape, dtype)?;
        self.launch(Kernel::Fill(0.0), &[], &out)?;
        Ok(out)
    }

    pub fn zeros_like(&self, x: &Tensor) -> Result<Tensor> {
        self.zeros(x.shape(), x.dtype())
    }

    pub fn upload(&self, host: &HostTensor) -> Result<Tensor> {
        self.device.upload(self.stream, host)
    }

    pub fn download(&self, x: &Tensor) -> Result<HostTensor> {
        self.device.download(x)
    }

    /// Copy `src` into `dst` in place. `dst` keeps its address.
    pub fn copy_(&self, dst: &Tensor, src: &Tensor) -> Result<()> {
        self.launch(Kernel::Copy, &[src], dst)
    }

    /// A copy of `x` in a new buffer.
    pub fn clone_tensor(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.empty_like(x)?;
        self.copy_(&out, x)?;
        Ok(out)
    }

    /// Swap two axes. Negative dims count from the end.
    pub fn transpose(&self, x: &Tensor, dim0: i64, dim1: i64) -> Result<Tensor> {
        let dim0 = normalize_axis(dim0, x.rank())?;
        let dim1 = normalize_axis(dim1, x.rank())?;
        let out = self.empty(&transpose_shape(x.shape(), dim0, dim1)?, x.dtype())?;
        self.launch(Kernel::Transpose { dim0, dim1 }, &[x], &out)?;
        Ok(out)
    }

    pub fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let out = self.empty(&matmul_shape(a.shape(), b.shape())?, a.dtype())?;
        self.launch(Kernel::MatMul, &[a, b], &out)?;
        Ok(out)
    }

    fn binary(&self, op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let out = self.empty(&broadcast_shape(a.shape(), b.shape())?, a.dtype())?;
        self.launch(Kernel::Binary(op), &[a, b], &out)?;
        Ok(out)
    }

    pub fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Div, a, b)
    }

    fn binary_scalar(&self, op: BinaryOp, x: &Tensor, scalar: f32) -> Result<Tensor> {
        let out = self.empty_like(x)?;
        self.launch(Kernel::BinaryScalar { op, scalar }, &[x], &out)?;
        Ok(out)
    }

    pub fn div_scalar(&self, x: &Tensor, divisor: f32) -> Result<Tensor> {
        self.binary_scalar(BinaryOp::Div, x, divisor)
    }

    pub fn mul_scalar(&self, x: &Tensor, factor: f32) -> Result<Tensor> {
        self.binary_scalar(BinaryOp::Mul, x, factor)
    }

    /// Softmax along `dim`; negative dims count from the end.
    pub fn softmax(&self, x: &Tensor, dim: i64) -> Result<Tensor> {
        let axis = normalize_axis(dim, x.rank())?;
        let out = self.empty_like(x)?;
        self.launch(Kernel::Softmax { axis }, &[x], &out)?;
        Ok(out)
    }

    /// Convert to `dtype`. Returns `x` itself if it already has that dtype.
    pub fn to_dtype(&self, x: &Tensor, dtype: DataType) -> Result<Tensor> {
        if x.dtype() == dtype {
            return Ok(x.clone());
        }
        let out = self.empty(x.shape(), dtype)?;
        self.launch(Kernel::Cast, &[x], &out)?;
        Ok(out)
    }

    pub fn float(&self, x: &Tensor) -> Result<Tensor> {
        self.to_dtype(x, DataType::F32)
    }

    pub fn type_as(&self, x: &Tensor, like: &Tensor) -> Result<Tensor> {
        self.to_dtype(x, like.dtype())
    }

    /// Scaled dot-product attention written into `out`, which is returned.
    ///
    /// `out` must have shape `[..., Lq, Dv]` and is typically `empty_like(q)`.
    #[allow(clippy::too_many_arguments)]
    pub fn fused_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        scale: f32,
        is_causal: bool,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let kernel = Kernel::FusedAttention {
            scale,
            is_causal,
            has_mask: mask.is_some(),
        };
        match mask {
            Some(mask) => self.launch(kernel, &[q, k, v, mask], out)?,
            None => self.launch(kernel, &[q, k, v], out)?,
        }
        Ok(out.clone())
    }

    /// Download a tensor and return its values as f32.
    pub fn to_f32_vec(&self, x: &Tensor) -> Result<Vec<f32>> {
        Ok(self.download(x)?.to_f32_vec())
    }

    /// Upload f32 values as a tensor of `dtype`.
    pub fn tensor_from_f32(
        &self,
        values: &[f32],
        shape: &[usize],
        dtype: DataType,
    ) -> Result<Tensor> {
        self.upload(&HostTensor::from_f32(values, shape, dtype)?)
    }
}

/// Reject `tensors` unless all have `dtype`.
pub fn expect_dtype(tensors: &[&Tensor], dtype: DataType) -> Result<()> {
    match tensors.iter().find(|t| t.dtype() != dtype) {
        Some(t) => Err(RuntimeError::DTypeMismatch {
            expected: dtype,
            actual: t.dtype(),
        }),
        None => Ok(()),
    }
}
