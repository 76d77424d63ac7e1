//! Tracing builder: write a graph as ordinary tensor code.
//!
//! Every method records one operator node and hands back the edge carrying its
//! result, so a model fragment reads like the eager code it stands for:
//!
//! ```
//! use ember_core::{DataType, GraphBuilder, TensorShape};
//!
//! # fn main() -> ember_core::Result<()> {
//! let mut b = GraphBuilder::new();
//! let q = b.input("q", DataType::F32, TensorShape::Unknown);
//! let k = b.input("k", DataType::F32, TensorShape::Unknown);
//! let kt = b.transpose(k, -1, -2)?;
//! let scores = b.matmul(q, kt)?;
//! let probs = b.softmax(scores, -1)?;
//! let graph = b.finish(&[probs])?;
//! assert_eq!(graph.node_count(), 3);
//! # Ok(())
//! # }
//! ```

use crate::ir::{IrEdge, IrEdgeId, IrGraph, IrNode};
use crate::op::{self, attr};
use crate::types::{AttrValue, DataType, TensorShape, TensorValue};
use crate::{Error, Result};

/// Records operator calls into an `IrGraph`.
pub struct GraphBuilder {
    graph: IrGraph,
}

impl GraphBuilder {
    /// Create a builder for an empty graph.
    pub fn new() -> Self {
        Self {
            graph: IrGraph::new(),
        }
    }

    /// Declare the next positional graph input.
    pub fn input(&mut self, name: &str, dtype: DataType, shape: TensorShape) -> IrEdgeId {
        let name = self.graph.unique_edge_name(name);
        let id = self.graph.add_edge(IrEdge::new(name, dtype, shape));
        self.graph.inputs.push(id);
        id
    }

    /// Declare a positional input with unknown shape and f32 dtype, as used
    /// by pattern templates.
    pub fn placeholder(&mut self, name: &str) -> IrEdgeId {
        self.input(name, DataType::F32, TensorShape::Unknown)
    }

    /// Record a rank-0 f32 constant.
    pub fn scalar(&mut self, value: f32) -> IrEdgeId {
        let name = self.graph.unique_edge_name("const");
        self.graph
            .add_edge(IrEdge::with_constant(name, TensorValue::scalar(value)))
    }

    /// `x.transpose(dim0, dim1)`; negative dims count from the end.
    pub fn transpose(&mut self, x: IrEdgeId, dim0: i64, dim1: i64) -> Result<IrEdgeId> {
        self.call(
            op::TRANSPOSE,
            &[x],
            vec![
                (attr::DIM0, AttrValue::Int(dim0)),
                (attr::DIM1, AttrValue::Int(dim1)),
            ],
        )
    }

    /// Batched matrix product.
    pub fn matmul(&mut self, a: IrEdgeId, b: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::MATMUL, &[a, b], Vec::new())
    }

    pub fn add(&mut self, a: IrEdgeId, b: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::ADD, &[a, b], Vec::new())
    }

    pub fn sub(&mut self, a: IrEdgeId, b: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::SUB, &[a, b], Vec::new())
    }

    pub fn mul(&mut self, a: IrEdgeId, b: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::MUL, &[a, b], Vec::new())
    }

    pub fn div(&mut self, a: IrEdgeId, b: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::DIV, &[a, b], Vec::new())
    }

    /// `x / divisor` with the divisor recorded as a constant edge.
    pub fn div_scalar(&mut self, x: IrEdgeId, divisor: f32) -> Result<IrEdgeId> {
        let divisor = self.scalar(divisor);
        self.div(x, divisor)
    }

    /// Softmax along `axis`.
    pub fn softmax(&mut self, x: IrEdgeId, axis: i64) -> Result<IrEdgeId> {
        self.call(op::SOFTMAX, &[x], vec![(attr::AXIS, AttrValue::Int(axis))])
    }

    /// Convert to `dtype`.
    pub fn cast(&mut self, x: IrEdgeId, dtype: DataType) -> Result<IrEdgeId> {
        self.call(op::CAST, &[x], vec![(attr::TO, AttrValue::DType(dtype))])
    }

    /// Upcast to f32.
    pub fn float(&mut self, x: IrEdgeId) -> Result<IrEdgeId> {
        self.cast(x, DataType::F32)
    }

    /// Convert `x` to whatever dtype `like` has at runtime.
    pub fn type_as(&mut self, x: IrEdgeId, like: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::TYPE_AS, &[x, like], Vec::new())
    }

    /// Uninitialized buffer with the shape and dtype of `x`.
    pub fn empty_like(&mut self, x: IrEdgeId) -> Result<IrEdgeId> {
        self.call(op::EMPTY_LIKE, &[x], Vec::new())
    }

    /// Record an arbitrary single-output operator.
    pub fn call(
        &mut self,
        op_type: &str,
        inputs: &[IrEdgeId],
        attributes: Vec<(&str, AttrValue)>,
    ) -> Result<IrEdgeId> {
        self.record(op_type, inputs, attributes, false)
    }

    /// Record a single-output operator that rewrites must treat as one unit.
    pub fn call_opaque(
        &mut self,
        op_type: &str,
        inputs: &[IrEdgeId],
        attributes: Vec<(&str, AttrValue)>,
    ) -> Result<IrEdgeId> {
        self.record(op_type, inputs, attributes, true)
    }

    fn record(
        &mut self,
        op_type: &str,
        inputs: &[IrEdgeId],
        attributes: Vec<(&str, AttrValue)>,
        opaque: bool,
    ) -> Result<IrEdgeId> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::InvalidGraph(format!("{op_type} needs at least one input")))?;
        let mut dtype = self.graph.edge(*first)?.dtype;

        let mut node = IrNode::new(op_type);
        for (key, value) in attributes {
            if key == attr::TO {
                if let Some(to) = value.as_dtype() {
                    dtype = to;
                }
            }
            node.set_attribute(key, value);
        }
        if op_type == op::TYPE_AS {
            if let Some(like) = inputs.get(1) {
                dtype = self.graph.edge(*like)?.dtype;
            }
        }

        node.name = self.graph.unique_node_name(&snake_case(op_type));
        let edge_name = self.graph.unique_edge_name(&node.name);
        let output = self
            .graph
            .add_edge(IrEdge::new(edge_name, dtype, TensorShape::Unknown));
        node.inputs = inputs.to_vec();
        node.add_output(output);
        node.opaque = opaque;
        self.graph.add_node(node)?;
        Ok(output)
    }

    /// Declare the graph outputs and return the recorded graph.
    pub fn finish(mut self, outputs: &[IrEdgeId]) -> Result<IrGraph> {
        for &output in outputs {
            self.graph.edge(output)?;
        }
        self.graph.outputs = outputs.to_vec();
        Ok(self.graph)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn snake_case(op_type: &str) -> String {
    let mut out = String::with_capacity(op_type.len() + 4);
    let mut prev_lower = false;
    for c in op_type.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}
