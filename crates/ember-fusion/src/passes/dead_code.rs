//! Dead code elimination.

use ember_core::{IrEdgeId, IrGraph, IrNodeId, Pass, Result, Stage};
use std::collections::HashSet;
use tracing::trace;

/// Pass that removes nodes none of whose outputs reach a graph output.
///
/// Graph inputs are never removed, even when nothing reads them: callers
/// pass arguments by position.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for DeadCodeEliminationPass {
    fn name(&self) -> &str {
        "dead_code_elimination"
    }

    fn stage(&self) -> Stage {
        Stage::Cleanup
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        let mut worklist: Vec<IrEdgeId> = graph.outputs.clone();
        let mut seen: HashSet<IrEdgeId> = HashSet::new();
        let mut live: HashSet<IrNodeId> = HashSet::new();

        while let Some(edge) = worklist.pop() {
            if !seen.insert(edge) {
                continue;
            }
            let Some(producer) = graph.tensor_producer(edge) else {
                continue;
            };
            if live.insert(producer) {
                worklist.extend(graph.node(producer)?.inputs.iter().copied());
            }
        }

        let dead: Vec<IrNodeId> = graph
            .topological_order()
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        for &id in &dead {
            let node = graph.remove_node(id)?;
            trace!(node = %node.name, op = %node.op_type, "removed dead node");
        }
        Ok(!dead.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{DataType, GraphBuilder, TensorShape};

    #[test]
    fn test_removes_unreachable_chain() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DataType::F32, TensorShape::Unknown);
        let unused = b.input("unused", DataType::F32, TensorShape::Unknown);
        let kept = b.softmax(x, -1).unwrap();
        let dropped = b.div_scalar(x, 2.0).unwrap();
        b.softmax(dropped, 0).unwrap();
        let mut graph = b.finish(&[kept]).unwrap();
        assert_eq!(graph.node_count(), 3);

        let pass = DeadCodeEliminationPass::new();
        assert!(pass.run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.inputs, vec![x, unused]);

        assert!(!pass.run(&mut graph).unwrap());
    }

    #[test]
    fn test_keeps_nodes_feeding_any_output() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DataType::F32, TensorShape::Unknown);
        let a = b.softmax(x, -1).unwrap();
        let c = b.add(a, x).unwrap();
        let mut graph = b.finish(&[a, c]).unwrap();

        assert!(!DeadCodeEliminationPass.run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 2);
    }
}
