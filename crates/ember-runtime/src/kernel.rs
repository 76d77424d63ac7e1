//! Device kernels and their host reference implementations.
//!
//! All kernels read their inputs as f32, compute in f32 and round on store
//! into the output buffer's element type.

use crate::error::{Result, RuntimeError};
use crate::tensor::Tensor;
use ember_core::broadcast::{broadcast_index, broadcast_shape};

/// Elementwise binary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
        }
    }
}

/// A unit of device work.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// Set every element of the output to a value.
    Fill(f32),

    /// Copy one buffer into another of identical shape and dtype.
    Copy,

    /// Swap two axes.
    Transpose { dim0: usize, dim1: usize },

    /// Batched matrix product. The right operand may be rank 2, in which case
    /// it is shared across the batch.
    MatMul,

    /// Broadcasting elementwise arithmetic on two tensors.
    Binary(BinaryOp),

    /// Elementwise arithmetic with a scalar right operand.
    BinaryScalar { op: BinaryOp, scalar: f32 },

    /// Softmax along an axis.
    Softmax { axis: usize },

    /// Convert to the output's element type.
    Cast,

    /// Scaled dot-product attention: `softmax(q·kᵗ·scale + mask)·v`.
    ///
    /// Inputs are `(q, k, v)` plus the mask when `has_mask` is set. The mask
    /// must broadcast to `[..., Lq, Lk]`. With `is_causal`, key positions after
    /// the query position are excluded.
    FusedAttention {
        scale: f32,
        is_causal: bool,
        has_mask: bool,
    },
}

impl Kernel {
    /// Kernel name, used as the compilation cache key together with the dtype.
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Fill(_) => "fill",
            Kernel::Copy => "copy",
            Kernel::Transpose { .. } => "transpose",
            Kernel::MatMul => "matmul",
            Kernel::Binary(op) => op.name(),
            Kernel::BinaryScalar { op, .. } => match op {
                BinaryOp::Add => "add_scalar",
                BinaryOp::Sub => "sub_scalar",
                BinaryOp::Mul => "mul_scalar",
                BinaryOp::Div => "div_scalar",
            },
            Kernel::Softmax { .. } => "softmax",
            Kernel::Cast => "cast",
            Kernel::FusedAttention { .. } => "fused_attention",
        }
    }

    /// Number of input tensors the kernel reads.
    pub fn arity(&self) -> usize {
        match self {
            Kernel::Fill(_) => 0,
            Kernel::Copy
            | Kernel::Transpose { .. }
            | Kernel::BinaryScalar { .. }
            | Kernel::Softmax { .. }
            | Kernel::Cast => 1,
            Kernel::MatMul | Kernel::Binary(_) => 2,
            Kernel::FusedAttention { has_mask, .. } => {
                if *has_mask {
                    4
                } else {
                    3
                }
            }
        }
    }

    /// Run the kernel on the host.
    pub(crate) fn execute(&self, inputs: &[Tensor], output: &Tensor) -> Result<()> {
        if inputs.len() != self.arity() {
            return Err(RuntimeError::Execution(format!(
                "kernel '{}' takes {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }

        match self {
            Kernel::Fill(value) => output.write_f32(&vec![*value; output.len()]),
            Kernel::Copy => {
                let src = &inputs[0];
                check_output(output, src.shape())?;
                if src.dtype() != output.dtype() {
                    return Err(RuntimeError::DTypeMismatch {
                        expected: output.dtype(),
                        actual: src.dtype(),
                    });
                }
                output.buffer().write_bytes(&src.buffer().read_bytes()?)
            }
            Kernel::Transpose { dim0, dim1 } => {
                let src = &inputs[0];
                let out_shape = transpose_shape(src.shape(), *dim0, *dim1)?;
                check_output(output, &out_shape)?;
                let values = src.read_f32()?;
                output.write_f32(&transpose(&values, src.shape(), *dim0, *dim1))
            }
            Kernel::MatMul => {
                let (a, b) = (&inputs[0], &inputs[1]);
                check_output(output, &matmul_shape(a.shape(), b.shape())?)?;
                let result = matmul(&a.read_f32()?, a.shape(), &b.read_f32()?, b.shape());
                output.write_f32(&result)
            }
            Kernel::Binary(op) => {
                let (a, b) = (&inputs[0], &inputs[1]);
                let out_shape = broadcast_shape(a.shape(), b.shape())?;
                check_output(output, &out_shape)?;
                let (lhs, rhs) = (a.read_f32()?, b.read_f32()?);
                let result: Vec<f32> = (0..output.len())
                    .map(|i| {
                        op.apply(
                            lhs[broadcast_index(i, &out_shape, a.shape())],
                            rhs[broadcast_index(i, &out_shape, b.shape())],
                        )
                    })
                    .collect();
                output.write_f32(&result)
            }
            Kernel::BinaryScalar { op, scalar } => {
                let src = &inputs[0];
                check_output(output, src.shape())?;
                let result: Vec<f32> = src
                    .read_f32()?
                    .into_iter()
                    .map(|x| op.apply(x, *scalar))
                    .collect();
                output.write_f32(&result)
            }
            Kernel::Softmax { axis } => {
                let src = &inputs[0];
                if *axis >= src.rank() {
                    return Err(RuntimeError::Dimension(format!(
                        "softmax axis {axis} out of range for shape {:?}",
                        src.shape()
                    )));
                }
                check_output(output, src.shape())?;
                let mut values = src.read_f32()?;
                softmax(&mut values, src.shape(), *axis);
                output.write_f32(&values)
            }
            Kernel::Cast => {
                let src = &inputs[0];
                check_output(output, src.shape())?;
                output.write_f32(&src.read_f32()?)
            }
            Kernel::FusedAttention {
                scale, is_causal, ..
            } => fused_attention(inputs, output, *scale, *is_causal),
        }
    }
}

fn check_output(output: &Tensor, expected: &[usize]) -> Result<()> {
    if output.shape() != expected {
        return Err(RuntimeError::Dimension(format!(
            "output buffer has shape {:?}, expected {expected:?}",
            output.shape()
        )));
    }
    Ok(())
}

/// Shape of `x` with `dim0` and `dim1` swapped.
pub fn transpose_shape(shape: &[usize], dim0: usize, dim1: usize) -> Result<Vec<usize>> {
    if dim0 >= shape.len() || dim1 >= shape.len() {
        return Err(RuntimeError::Dimension(format!(
            "cannot transpose dims {dim0} and {dim1} of shape {shape:?}"
        )));
    }
    let mut out = shape.to_vec();
    out.swap(dim0, dim1);
    Ok(out)
}

/// Result shape of a batched matrix product.
pub fn matmul_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let (ra, rb) = (a.len(), b.len());
    if ra < 2 || rb < 2 {
        return Err(RuntimeError::Dimension(format!(
            "matmul needs rank >= 2 operands, got {a:?} and {b:?}"
        )));
    }
    if a[ra - 1] != b[rb - 2] {
        return Err(RuntimeError::Dimension(format!(
            "matmul inner dimensions differ: {a:?} x {b:?}"
        )));
    }
    if rb > 2 && a[..ra - 2] != b[..rb - 2] {
        return Err(RuntimeError::Dimension(format!(
            "matmul batch dimensions differ: {a:?} x {b:?}"
        )));
    }
    let mut out = a[..ra - 2].to_vec();
    out.push(a[ra - 2]);
    out.push(b[rb - 1]);
    Ok(out)
}

fn transpose(values: &[f32], shape: &[usize], dim0: usize, dim1: usize) -> Vec<f32> {
    let in_strides = ember_core::broadcast::strides(shape);
    let mut out_shape = shape.to_vec();
    out_shape.swap(dim0, dim1);

    let mut coords = vec![0usize; shape.len()];
    (0..values.len())
        .map(|flat| {
            let mut remaining = flat;
            for axis in (0..out_shape.len()).rev() {
                coords[axis] = remaining % out_shape[axis];
                remaining /= out_shape[axis];
            }
            coords.swap(dim0, dim1);
            let index: usize = coords.iter().zip(&in_strides).map(|(c, s)| c * s).sum();
            values[index]
        })
        .collect()
}

fn matmul(a: &[f32], a_shape: &[usize], b: &[f32], b_shape: &[usize]) -> Vec<f32> {
    let ra = a_shape.len();
    let (m, k) = (a_shape[ra - 2], a_shape[ra - 1]);
    let n = b_shape[b_shape.len() - 1];
    let batch: usize = a_shape[..ra - 2].iter().product();
    let b_stride = if b_shape.len() == 2 { 0 } else { k * n };

    let mut out = vec![0.0f32; batch * m * n];
    for bi in 0..batch {
        let a_base = bi * m * k;
        let b_base = bi * b_stride;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += a[a_base + i * k + p] * b[b_base + p * n + j];
                }
                out[(bi * m + i) * n + j] = acc;
            }
        }
    }
    out
}

fn softmax(values: &mut [f32], shape: &[usize], axis: usize) {
    let dim = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let outer: usize = shape[..axis].iter().product();

    for o in 0..outer {
        for i in 0..inner {
            let at = |d: usize| o * dim * inner + d * inner + i;
            let max = (0..dim)
                .map(|d| values[at(d)])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for d in 0..dim {
                let e = (values[at(d)] - max).exp();
                values[at(d)] = e;
                sum += e;
            }
            for d in 0..dim {
                values[at(d)] /= sum;
            }
        }
    }
}

fn fused_attention(inputs: &[Tensor], output: &Tensor, scale: f32, is_causal: bool) -> Result<()> {
    let (q, k, v) = (&inputs[0], &inputs[1], &inputs[2]);
    let rank = q.rank();
    if rank < 2 || k.rank() != rank || v.rank() != rank {
        return Err(RuntimeError::Dimension(format!(
            "attention needs q, k, v of equal rank >= 2, got {:?}, {:?}, {:?}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }
    let batch_dims = &q.shape()[..rank - 2];
    if &k.shape()[..rank - 2] != batch_dims || &v.shape()[..rank - 2] != batch_dims {
        return Err(RuntimeError::Dimension(format!(
            "attention batch dimensions differ: {:?}, {:?}, {:?}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }

    let (lq, d) = (q.shape()[rank - 2], q.shape()[rank - 1]);
    let (lk, dv) = (k.shape()[rank - 2], v.shape()[rank - 1]);
    if k.shape()[rank - 1] != d || v.shape()[rank - 2] != lk {
        return Err(RuntimeError::Dimension(format!(
            "attention operand mismatch: q {:?}, k {:?}, v {:?}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }

    let mut out_shape = batch_dims.to_vec();
    out_shape.extend([lq, dv]);
    check_output(output, &out_shape)?;

    let mut scores_shape = batch_dims.to_vec();
    scores_shape.extend([lq, lk]);
    let mask = match inputs.get(3) {
        Some(mask) => {
            if broadcast_shape(mask.shape(), &scores_shape)? != scores_shape {
                return Err(RuntimeError::Dimension(format!(
                    "attention mask {:?} does not broadcast to {scores_shape:?}",
                    mask.shape()
                )));
            }
            Some((mask.read_f32()?, mask.shape()))
        }
        None => None,
    };

    let (qv, kv, vv) = (q.read_f32()?, k.read_f32()?, v.read_f32()?);
    let batch: usize = batch_dims.iter().product();
    let mut out = vec![0.0f32; batch * lq * dv];
    let mut row = vec![0.0f32; lk];

    for b in 0..batch {
        for i in 0..lq {
            let q_row = &qv[(b * lq + i) * d..][..d];
            for (j, score) in row.iter_mut().enumerate() {
                if is_causal && j > i {
                    *score = f32::NEG_INFINITY;
                    continue;
                }
                let k_row = &kv[(b * lk + j) * d..][..d];
                let dot: f32 = q_row.iter().zip(k_row).map(|(x, y)| x * y).sum();
                *score = dot * scale;
                if let Some((values, shape)) = &mask {
                    let flat = (b * lq + i) * lk + j;
                    *score += values[broadcast_index(flat, &scores_shape, shape)];
                }
            }

            softmax(&mut row, &[lk], 0);

            let out_row = &mut out[(b * lq + i) * dv..][..dv];
            for (j, p) in row.iter().enumerate() {
                let v_row = &vv[(b * lk + j) * dv..][..dv];
                for (o, x) in out_row.iter_mut().zip(v_row) {
                    *o += p * x;
                }
            }
        }
    }

    output.write_f32(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferId;
    use crate::tensor::{Buffer, encode_f32};
    use ember_core::DataType;
    use std::sync::Arc;

    fn tensor(values: &[f32], shape: &[usize]) -> Tensor {
        let buffer = Buffer::new(BufferId(0), None, encode_f32(values, DataType::F32));
        Tensor::new(Arc::new(buffer), shape.to_vec(), DataType::F32)
    }

    fn empty(shape: &[usize], dtype: DataType) -> Tensor {
        let len: usize = shape.iter().product();
        let buffer = Buffer::new(BufferId(1), None, vec![0; len * dtype.size()]);
        Tensor::new(Arc::new(buffer), shape.to_vec(), dtype)
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-5, "index {i}: {a} vs {e}");
        }
    }

    #[test]
    fn test_transpose_last_two_dims() {
        let x = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 2, 3]);
        let out = empty(&[1, 3, 2], DataType::F32);
        Kernel::Transpose { dim0: 1, dim1: 2 }
            .execute(&[x], &out)
            .unwrap();
        assert_eq!(out.read_f32().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_batched_matmul_with_shared_rhs() {
        let a = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 2, 2]);
        let b = tensor(&[1.0, 0.0, 0.0, 2.0], &[2, 2]);
        let out = empty(&[2, 2, 2], DataType::F32);
        Kernel::MatMul.execute(&[a, b], &out).unwrap();
        assert_eq!(
            out.read_f32().unwrap(),
            vec![1.0, 4.0, 3.0, 8.0, 5.0, 12.0, 7.0, 16.0]
        );
    }

    #[test]
    fn test_matmul_shape_errors() {
        assert!(matmul_shape(&[2, 3], &[4, 5]).is_err());
        assert!(matmul_shape(&[2, 2, 3], &[3, 2, 3]).is_err());
        assert!(matmul_shape(&[3], &[3, 2]).is_err());
        assert_eq!(matmul_shape(&[4, 2, 3], &[3, 5]).unwrap(), vec![4, 2, 5]);
    }

    #[test]
    fn test_broadcast_binary() {
        let a = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = tensor(&[10.0, 20.0], &[2]);
        let out = empty(&[2, 2], DataType::F32);
        Kernel::Binary(BinaryOp::Add).execute(&[a, b], &out).unwrap();
        assert_eq!(out.read_f32().unwrap(), vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = tensor(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &[2, 3]);
        let out = empty(&[2, 3], DataType::F32);
        Kernel::Softmax { axis: 1 }.execute(&[x], &out).unwrap();
        let values = out.read_f32().unwrap();
        assert_close(&values[3..], &[1.0 / 3.0; 3]);
        assert!((values[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(values[2] > values[1] && values[1] > values[0]);
    }

    #[test]
    fn test_copy_checks_dtype() {
        let src = tensor(&[1.0, 2.0], &[2]);
        let dst = empty(&[2], DataType::F16);
        assert!(matches!(
            Kernel::Copy.execute(&[src], &dst),
            Err(RuntimeError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_copy_checks_shape() {
        let src = tensor(&[1.0, 2.0], &[2]);
        let dst = empty(&[1, 2], DataType::F32);
        assert!(matches!(
            Kernel::Copy.execute(&[src], &dst),
            Err(RuntimeError::Dimension(_))
        ));
    }

    #[test]
    fn test_cast_rounds_to_output_type() {
        let src = tensor(&[0.1, 1.0], &[2]);
        let dst = empty(&[2], DataType::F16);
        Kernel::Cast.execute(&[src], &dst).unwrap();
        let values = dst.read_f32().unwrap();
        assert_ne!(values[0], 0.1);
        assert!((values[0] - 0.1).abs() < 1e-3);
        assert_eq!(values[1], 1.0);
    }

    #[test]
    fn test_fused_attention_uniform_scores_average_values() {
        // q is zero, so every key gets the same score.
        let q = tensor(&[0.0, 0.0], &[1, 1, 2]);
        let k = tensor(&[1.0, 0.0, 0.0, 1.0], &[1, 2, 2]);
        let v = tensor(&[2.0, 4.0, 6.0, 8.0], &[1, 2, 2]);
        let out = empty(&[1, 1, 2], DataType::F32);
        Kernel::FusedAttention {
            scale: 1.0,
            is_causal: false,
            has_mask: false,
        }
        .execute(&[q, k, v], &out)
        .unwrap();
        assert_close(&out.read_f32().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn test_fused_attention_causal_first_row_sees_first_key() {
        let q = tensor(&[1.0, 1.0, 1.0, 1.0], &[2, 2]);
        let k = tensor(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let v = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let out = empty(&[2, 2], DataType::F32);
        Kernel::FusedAttention {
            scale: 0.5,
            is_causal: true,
            has_mask: false,
        }
        .execute(&[q, k, v], &out)
        .unwrap();
        let values = out.read_f32().unwrap();
        assert_close(&values[..2], &[1.0, 2.0]);
        // Equal scores on the second row: mean of both value rows.
        assert_close(&values[2..], &[2.0, 3.0]);
    }

    #[test]
    fn test_fused_attention_mask_broadcasts() {
        let q = tensor(&[0.0; 4], &[1, 2, 2]);
        let k = tensor(&[0.0; 4], &[1, 2, 2]);
        let v = tensor(&[1.0, 1.0, 3.0, 3.0], &[1, 2, 2]);
        // Mask out the second key for every query.
        let mask = tensor(&[0.0, f32::NEG_INFINITY], &[1, 1, 2]);
        let out = empty(&[1, 2, 2], DataType::F32);
        Kernel::FusedAttention {
            scale: 1.0,
            is_causal: false,
            has_mask: true,
        }
        .execute(&[q, k, v, mask], &out)
        .unwrap();
        assert_close(&out.read_f32().unwrap(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_arity_is_checked() {
        let x = tensor(&[1.0], &[1]);
        let out = empty(&[1], DataType::F32);
        assert!(Kernel::MatMul.execute(&[x], &out).is_err());
    }
}
