//! Graph executor.
//!
//! Evaluates an `IrGraph` node by node on a `DeviceCtx`, dispatching each node
//! to the operator registered for its type. Because all work goes through the
//! context, a graph run can itself be wrapped with `capture::wrap`.

use crate::context::DeviceCtx;
use crate::device::Device;
use crate::error::{Result, RuntimeError};
use crate::registry::OperatorRegistry;
use crate::tensor::Tensor;
use ember_core::{IrEdgeId, IrGraph};
use std::collections::HashMap;
use tracing::trace;

/// Executes graphs using an operator registry.
pub struct GraphExecutor<D: Device> {
    registry: OperatorRegistry<D>,
}

impl<D: Device> GraphExecutor<D> {
    pub fn new(registry: OperatorRegistry<D>) -> Self {
        Self { registry }
    }

    /// Executor over `OperatorRegistry::with_defaults()`.
    pub fn with_defaults() -> Self {
        Self::new(OperatorRegistry::with_defaults())
    }

    pub fn registry(&self) -> &OperatorRegistry<D> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut OperatorRegistry<D> {
        &mut self.registry
    }

    /// Run `graph` on positional `inputs` and return its outputs in order.
    ///
    /// Constant edges are uploaded the first time a node reads them.
    #[tracing::instrument(skip_all, fields(nodes = graph.node_count()))]
    pub fn run(
        &self,
        ctx: DeviceCtx<'_, D>,
        graph: &IrGraph,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        if inputs.len() != graph.inputs.len() {
            return Err(RuntimeError::ArgumentCountMismatch {
                expected: graph.inputs.len(),
                actual: inputs.len(),
            });
        }

        let mut values: HashMap<IrEdgeId, Tensor> = graph
            .inputs
            .iter()
            .copied()
            .zip(inputs.iter().cloned())
            .collect();

        for node_id in graph.topological_order() {
            let node = graph.node(node_id)?;
            let op = self.registry.get(&node.op_type).ok_or_else(|| {
                RuntimeError::UnsupportedOperator(format!(
                    "{} (node '{}')",
                    node.op_type, node.name
                ))
            })?;

            let mut op_inputs = Vec::with_capacity(node.inputs.len());
            for &edge in &node.inputs {
                op_inputs.push(fetch(ctx, graph, &mut values, edge)?);
            }

            trace!(node = %node.name, op = %node.op_type, "dispatch");
            let outputs = op.execute(ctx, node, &op_inputs)?;

            if outputs.len() != node.outputs.len() {
                return Err(RuntimeError::Execution(format!(
                    "Operation '{}' returned {} outputs but expected {}",
                    node.name,
                    outputs.len(),
                    node.outputs.len()
                )));
            }
            for (output, &edge) in outputs.into_iter().zip(&node.outputs) {
                values.insert(edge, output);
            }
        }

        graph
            .outputs
            .iter()
            .map(|&edge| fetch(ctx, graph, &mut values, edge))
            .collect()
    }
}

fn fetch<D: Device>(
    ctx: DeviceCtx<'_, D>,
    graph: &IrGraph,
    values: &mut HashMap<IrEdgeId, Tensor>,
    edge: IrEdgeId,
) -> Result<Tensor> {
    if let Some(tensor) = values.get(&edge) {
        return Ok(tensor.clone());
    }

    let info = graph.edge(edge)?;
    let Some(value) = info.constant_value() else {
        return Err(RuntimeError::Execution(format!(
            "Value '{}' is read before it is produced",
            info.name
        )));
    };
    let tensor = ctx.tensor_from_f32(&value.data, &value.shape, value.dtype)?;
    values.insert(edge, tensor.clone());
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDevice;
    use ember_core::{DataType, GraphBuilder, IrEdge, IrNode, TensorShape};

    #[test]
    fn test_runs_graph_with_constant() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DataType::F32, TensorShape::Static(vec![2]));
        let y = b.div_scalar(x, 4.0).unwrap();
        let graph = b.finish(&[y]).unwrap();

        let device = HostDevice::new();
        let ctx = DeviceCtx::on_default_stream(&device);
        let input = ctx.tensor_from_f32(&[2.0, 6.0], &[2], DataType::F32).unwrap();

        let outputs = GraphExecutor::with_defaults()
            .run(ctx, &graph, &[input])
            .unwrap();
        assert_eq!(ctx.to_f32_vec(&outputs[0]).unwrap(), vec![0.5, 1.5]);
    }

    #[test]
    fn test_unsupported_operator() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        let y = b.call("Gelu", &[x], Vec::new()).unwrap();
        let graph = b.finish(&[y]).unwrap();

        let device = HostDevice::new();
        let ctx = DeviceCtx::on_default_stream(&device);
        let input = ctx.zeros(&[1], DataType::F32).unwrap();

        let err = GraphExecutor::with_defaults()
            .run(ctx, &graph, &[input])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedOperator(_)));
    }

    #[test]
    fn test_input_count_checked() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        let y = b.softmax(x, -1).unwrap();
        let graph = b.finish(&[y]).unwrap();

        let device = HostDevice::new();
        let ctx = DeviceCtx::on_default_stream(&device);

        let err = GraphExecutor::with_defaults()
            .run(ctx, &graph, &[])
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ArgumentCountMismatch {
                expected: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn test_dangling_edge_reported() {
        let mut graph = IrGraph::new();
        let dangling = graph.add_edge(IrEdge::new("dangling", DataType::F32, TensorShape::Unknown));
        let out = graph.add_edge(IrEdge::new("out", DataType::F32, TensorShape::Unknown));
        let mut node = IrNode::new(ember_core::op::SOFTMAX).with_name("softmax");
        node.set_attribute("axis", ember_core::AttrValue::Int(0));
        node.add_input(dangling);
        node.add_output(out);
        graph.add_node(node).unwrap();
        graph.outputs = vec![out];

        let device = HostDevice::new();
        let err = GraphExecutor::with_defaults()
            .run(DeviceCtx::on_default_stream(&device), &graph, &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Execution(_)));
    }
}
