//! Operators: how each graph node type runs on a device.

use crate::context::{DeviceCtx, expect_dtype};
use crate::device::Device;
use crate::error::{Result, RuntimeError};
use crate::kernel::BinaryOp;
use crate::tensor::Tensor;
use ember_core::IrNode;
use ember_core::op::{self, attr};

/// Trait for executing one graph node type.
///
/// Operators compute output shapes from the concrete input tensors they are
/// handed and issue their work through the context.
///
/// # Example
///
/// ```ignore
/// struct DoubleOp;
///
/// impl<D: Device> Operator<D> for DoubleOp {
///     fn name(&self) -> &str {
///         "Double"
///     }
///
///     fn execute(&self, ctx: DeviceCtx<'_, D>, _node: &IrNode, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
///         Ok(vec![ctx.mul_scalar(&inputs[0], 2.0)?])
///     }
/// }
/// ```
pub trait Operator<D: Device>: Send + Sync {
    /// Operator type this implementation handles (e.g. "MatMul").
    fn name(&self) -> &str;

    /// Run the node on `inputs` and return its outputs, in order.
    fn execute(&self, ctx: DeviceCtx<'_, D>, node: &IrNode, inputs: &[Tensor])
    -> Result<Vec<Tensor>>;
}

fn expect_inputs<'t>(node: &IrNode, inputs: &'t [Tensor], count: usize) -> Result<&'t [Tensor]> {
    if inputs.len() != count {
        return Err(RuntimeError::Execution(format!(
            "{} node '{}' expects {count} inputs, got {}",
            node.op_type,
            node.name,
            inputs.len()
        )));
    }
    Ok(inputs)
}

/// Add, Sub, Mul and Div with broadcasting.
pub struct BinaryElementwiseOp {
    name: &'static str,
    op: BinaryOp,
}

impl BinaryElementwiseOp {
    pub fn add() -> Self {
        Self {
            name: op::ADD,
            op: BinaryOp::Add,
        }
    }

    pub fn sub() -> Self {
        Self {
            name: op::SUB,
            op: BinaryOp::Sub,
        }
    }

    pub fn mul() -> Self {
        Self {
            name: op::MUL,
            op: BinaryOp::Mul,
        }
    }

    pub fn div() -> Self {
        Self {
            name: op::DIV,
            op: BinaryOp::Div,
        }
    }
}

impl<D: Device> Operator<D> for BinaryElementwiseOp {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let inputs = expect_inputs(node, inputs, 2)?;
        let (a, b) = (&inputs[0], &inputs[1]);
        let out = match self.op {
            BinaryOp::Add => ctx.add(a, b)?,
            BinaryOp::Sub => ctx.sub(a, b)?,
            BinaryOp::Mul => ctx.mul(a, b)?,
            BinaryOp::Div => ctx.div(a, b)?,
        };
        Ok(vec![out])
    }
}

/// Swap two axes given by the `dim0`/`dim1` attributes.
pub struct TransposeOp;

impl<D: Device> Operator<D> for TransposeOp {
    fn name(&self) -> &str {
        op::TRANSPOSE
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let x = &expect_inputs(node, inputs, 1)?[0];
        let dim0 = node.int_attr(attr::DIM0)?;
        let dim1 = node.int_attr(attr::DIM1)?;
        Ok(vec![ctx.transpose(x, dim0, dim1)?])
    }
}

pub struct MatMulOp;

impl<D: Device> Operator<D> for MatMulOp {
    fn name(&self) -> &str {
        op::MATMUL
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let inputs = expect_inputs(node, inputs, 2)?;
        Ok(vec![ctx.matmul(&inputs[0], &inputs[1])?])
    }
}

pub struct SoftmaxOp;

impl<D: Device> Operator<D> for SoftmaxOp {
    fn name(&self) -> &str {
        op::SOFTMAX
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let x = &expect_inputs(node, inputs, 1)?[0];
        Ok(vec![ctx.softmax(x, node.int_attr(attr::AXIS)?)?])
    }
}

/// Convert to the dtype in the `to` attribute.
pub struct CastOp;

impl<D: Device> Operator<D> for CastOp {
    fn name(&self) -> &str {
        op::CAST
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let x = &expect_inputs(node, inputs, 1)?[0];
        Ok(vec![ctx.to_dtype(x, node.dtype_attr(attr::TO)?)?])
    }
}

/// Convert the first input to the dtype of the second.
pub struct TypeAsOp;

impl<D: Device> Operator<D> for TypeAsOp {
    fn name(&self) -> &str {
        op::TYPE_AS
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let inputs = expect_inputs(node, inputs, 2)?;
        Ok(vec![ctx.type_as(&inputs[0], &inputs[1])?])
    }
}

pub struct EmptyLikeOp;

impl<D: Device> Operator<D> for EmptyLikeOp {
    fn name(&self) -> &str {
        op::EMPTY_LIKE
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let x = &expect_inputs(node, inputs, 1)?[0];
        Ok(vec![ctx.empty_like(x)?])
    }
}

/// Fused attention node: inputs `(q, k, v, out[, mask])`, attributes `scale`
/// and `is_causal`. Writes into `out` and returns it.
pub struct FusedAttentionOp;

impl<D: Device> Operator<D> for FusedAttentionOp {
    fn name(&self) -> &str {
        op::FUSED_ATTENTION
    }

    fn execute(
        &self,
        ctx: DeviceCtx<'_, D>,
        node: &IrNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let (q, k, v, out, mask) = match inputs {
            [q, k, v, out] => (q, k, v, out, None),
            [q, k, v, out, mask] => (q, k, v, out, Some(mask)),
            _ => {
                return Err(RuntimeError::Execution(format!(
                    "{} node '{}' expects 4 or 5 inputs, got {}",
                    node.op_type,
                    node.name,
                    inputs.len()
                )));
            }
        };
        expect_dtype(&[k, v, out], q.dtype())?;

        let scale = node.float_attr(attr::SCALE)?;
        let is_causal = node.bool_attr(attr::IS_CAUSAL)?;
        Ok(vec![
            ctx.fused_attention(q, k, v, out, scale, is_causal, mask)?,
        ])
    }
}
