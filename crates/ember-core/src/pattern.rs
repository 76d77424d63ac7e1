//! Exact sub-graph matching and substitution.
//!
//! A pattern is an ordinary `IrGraph` (usually traced with `GraphBuilder`)
//! whose inputs are placeholders and whose single output is the value being
//! replaced. Matching is purely structural: operator types, attributes, arity
//! and constant values must be identical. `x / 8.0` does not match
//! `x * 0.125`.
//!
//! Matching is anchored at the node producing the pattern output and walks
//! backwards through inputs by position. A candidate is rejected if:
//! - a placeholder would bind to two different values
//! - a graph node would stand in for two pattern nodes
//! - any matched node is opaque
//! - an intermediate value of the match is used outside of it, or is a graph
//!   output (removing it would break the other user)

use crate::ir::{IrEdge, IrEdgeId, IrGraph, IrNode, IrNodeId};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A template graph ready for matching.
#[derive(Debug, Clone)]
pub struct SubgraphPattern {
    template: IrGraph,
    anchor: IrNodeId,
    output: IrEdgeId,
}

/// One occurrence of a pattern inside a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphMatch {
    /// Matched graph nodes, in the template's topological order.
    pub nodes: Vec<IrNodeId>,

    /// Graph edge bound to each template input, by position.
    pub bindings: Vec<IrEdgeId>,

    /// Graph edge standing in for the template output.
    pub output: IrEdgeId,
}

impl SubgraphPattern {
    /// Validate a template and prepare it for matching.
    ///
    /// # Errors
    ///
    /// Returns an error unless the template has exactly one output, that
    /// output is produced by a node, and every template input is used.
    pub fn new(template: IrGraph) -> Result<Self> {
        let output = match template.outputs.as_slice() {
            [output] => *output,
            outputs => {
                return Err(Error::Pattern(format!(
                    "pattern must have exactly one output, got {}",
                    outputs.len()
                )));
            }
        };
        let anchor = template.tensor_producer(output).ok_or_else(|| {
            Error::Pattern("pattern output must be produced by an operator".to_string())
        })?;
        for &input in &template.inputs {
            if template.tensor_consumers(input).is_empty() {
                return Err(Error::Pattern(format!(
                    "pattern input '{}' is never used",
                    template.edge(input)?.name
                )));
            }
        }
        for (_, node) in template.nodes() {
            for &edge in &node.inputs {
                let is_leaf = template.inputs.contains(&edge) || template.edge(edge)?.is_constant();
                if !is_leaf && template.tensor_producer(edge).is_none() {
                    return Err(Error::Pattern(format!(
                        "pattern edge '{}' is neither an input, a constant nor produced by an operator",
                        template.edge(edge)?.name
                    )));
                }
            }
        }

        Ok(Self {
            template,
            anchor,
            output,
        })
    }

    /// The template graph.
    pub fn template(&self) -> &IrGraph {
        &self.template
    }

    /// Number of placeholder inputs.
    pub fn num_inputs(&self) -> usize {
        self.template.inputs.len()
    }

    /// Find all non-overlapping occurrences of the pattern in `graph`.
    ///
    /// Candidates are tried in the graph's topological order; the first match
    /// claiming a node wins.
    pub fn find_matches(&self, graph: &IrGraph) -> Result<Vec<SubgraphMatch>> {
        let anchor_op = &self.template.node(self.anchor)?.op_type;
        let mut taken: HashSet<IrNodeId> = HashSet::new();
        let mut matches = Vec::new();

        for candidate in graph.topological_order() {
            if taken.contains(&candidate) || &graph.node(candidate)?.op_type != anchor_op {
                continue;
            }
            let Some(found) = self.match_at(graph, candidate)? else {
                continue;
            };
            if found.nodes.iter().any(|node| taken.contains(node)) {
                continue;
            }
            taken.extend(found.nodes.iter().copied());
            matches.push(found);
        }

        Ok(matches)
    }

    /// Try to match the pattern with its output node mapped onto `candidate`.
    pub fn match_at(&self, graph: &IrGraph, candidate: IrNodeId) -> Result<Option<SubgraphMatch>> {
        let anchor = self.template.node(self.anchor)?;
        let position = anchor
            .outputs
            .iter()
            .position(|&edge| edge == self.output)
            .ok_or_else(|| Error::Pattern("pattern anchor lost its output".to_string()))?;
        let Some(&output) = graph.node(candidate)?.outputs.get(position) else {
            return Ok(None);
        };

        let mut state = MatchState::new(&self.template, graph);
        if !state.match_node(self.anchor, candidate)? {
            return Ok(None);
        }
        if !state.is_self_contained(candidate, output)? {
            return Ok(None);
        }

        let Some(bindings) = state.bindings.iter().copied().collect::<Option<Vec<_>>>() else {
            return Ok(None);
        };
        let nodes = self
            .template
            .topological_order()
            .into_iter()
            .filter_map(|node| state.node_map.get(&node).copied())
            .collect();

        Ok(Some(SubgraphMatch {
            nodes,
            bindings,
            output,
        }))
    }
}

struct MatchState<'a> {
    pattern: &'a IrGraph,
    graph: &'a IrGraph,
    node_map: HashMap<IrNodeId, IrNodeId>,
    claimed: HashSet<IrNodeId>,
    bindings: Vec<Option<IrEdgeId>>,
}

impl<'a> MatchState<'a> {
    fn new(pattern: &'a IrGraph, graph: &'a IrGraph) -> Self {
        Self {
            pattern,
            graph,
            node_map: HashMap::new(),
            claimed: HashSet::new(),
            bindings: vec![None; pattern.inputs.len()],
        }
    }

    fn match_node(&mut self, pattern_id: IrNodeId, graph_id: IrNodeId) -> Result<bool> {
        if let Some(&mapped) = self.node_map.get(&pattern_id) {
            return Ok(mapped == graph_id);
        }
        if self.claimed.contains(&graph_id) {
            return Ok(false);
        }

        let pattern_node = self.pattern.node(pattern_id)?;
        let graph_node = self.graph.node(graph_id)?;
        if !same_operator(pattern_node, graph_node) {
            return Ok(false);
        }

        self.node_map.insert(pattern_id, graph_id);
        self.claimed.insert(graph_id);

        for (&pattern_edge, &graph_edge) in pattern_node.inputs.iter().zip(&graph_node.inputs) {
            if !self.match_edge(pattern_edge, graph_edge)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn match_edge(&mut self, pattern_edge: IrEdgeId, graph_edge: IrEdgeId) -> Result<bool> {
        if let Some(slot) = self.pattern.inputs.iter().position(|&e| e == pattern_edge) {
            return Ok(match self.bindings[slot] {
                Some(bound) => bound == graph_edge,
                None => {
                    self.bindings[slot] = Some(graph_edge);
                    true
                }
            });
        }

        if let Some(expected) = self.pattern.edge(pattern_edge)?.constant_value() {
            return Ok(self
                .graph
                .edge(graph_edge)?
                .constant_value()
                .is_some_and(|actual| actual.bit_eq(expected)));
        }

        let pattern_producer = self.pattern.tensor_producer(pattern_edge).ok_or_else(|| {
            Error::Pattern(format!("pattern edge {pattern_edge:?} has no producer"))
        })?;
        let Some(graph_producer) = self.graph.tensor_producer(graph_edge) else {
            return Ok(false);
        };

        let pattern_slot = self
            .pattern
            .node(pattern_producer)?
            .outputs
            .iter()
            .position(|&e| e == pattern_edge);
        let graph_slot = self
            .graph
            .node(graph_producer)?
            .outputs
            .iter()
            .position(|&e| e == graph_edge);
        if pattern_slot != graph_slot {
            return Ok(false);
        }

        self.match_node(pattern_producer, graph_producer)
    }

    /// Everything the match computes, other than `output`, must stay inside it,
    /// and no bound operand may be computed by the match itself.
    fn is_self_contained(&self, anchor: IrNodeId, output: IrEdgeId) -> Result<bool> {
        for &graph_id in self.node_map.values() {
            for &edge in &self.graph.node(graph_id)?.outputs {
                if graph_id == anchor && edge == output {
                    continue;
                }
                if self.graph.is_output(edge) {
                    return Ok(false);
                }
                let escapes = self
                    .graph
                    .tensor_consumers(edge)
                    .iter()
                    .any(|consumer| !self.claimed.contains(consumer));
                if escapes {
                    return Ok(false);
                }
            }
        }

        let bound_inside = self
            .bindings
            .iter()
            .flatten()
            .filter_map(|&edge| self.graph.tensor_producer(edge))
            .any(|producer| self.claimed.contains(&producer));
        Ok(!bound_inside)
    }
}

fn same_operator(pattern: &IrNode, graph: &IrNode) -> bool {
    !graph.opaque
        && pattern.op_type == graph.op_type
        && pattern.attributes == graph.attributes
        && pattern.inputs.len() == graph.inputs.len()
        && pattern.outputs.len() == graph.outputs.len()
}

/// Replace every occurrence of `pattern` in `graph` with `replacement`.
///
/// `replacement` must take the same number of inputs as the pattern and have
/// one output produced by an operator. Each match is removed and the
/// replacement is spliced in with its inputs bound to the matched operands;
/// its final operator takes over the matched output edge, so downstream users
/// and graph outputs are left untouched.
///
/// Returns the matches that were replaced. No match is not an error.
pub fn replace_pattern(
    graph: &mut IrGraph,
    pattern: &SubgraphPattern,
    replacement: &IrGraph,
) -> Result<Vec<SubgraphMatch>> {
    if replacement.inputs.len() != pattern.num_inputs() {
        return Err(Error::Pattern(format!(
            "replacement takes {} inputs but pattern binds {}",
            replacement.inputs.len(),
            pattern.num_inputs()
        )));
    }
    let replacement_output = match replacement.outputs.as_slice() {
        [output] if replacement.tensor_producer(*output).is_some() => *output,
        _ => {
            return Err(Error::Pattern(
                "replacement must have exactly one output produced by an operator".to_string(),
            ));
        }
    };

    let matches = pattern.find_matches(graph)?;
    for found in &matches {
        debug!(
            nodes = found.nodes.len(),
            output = %graph.edge(found.output)?.name,
            "replacing matched sub-graph"
        );
        splice(graph, found, replacement, replacement_output)?;
    }
    Ok(matches)
}

fn splice(
    graph: &mut IrGraph,
    found: &SubgraphMatch,
    replacement: &IrGraph,
    replacement_output: IrEdgeId,
) -> Result<()> {
    for &node in &found.nodes {
        graph.remove_node(node)?;
    }

    let mut edge_map: HashMap<IrEdgeId, IrEdgeId> = replacement
        .inputs
        .iter()
        .copied()
        .zip(found.bindings.iter().copied())
        .collect();
    edge_map.insert(replacement_output, found.output);

    for template_id in replacement.topological_order() {
        let template = replacement.node(template_id)?;
        let mut node = IrNode::new(template.op_type.clone());
        node.name = graph.unique_node_name(&template.name);
        node.attributes = template.attributes.clone();
        node.opaque = template.opaque;

        for &edge in &template.inputs {
            let mapped = match edge_map.get(&edge) {
                Some(&mapped) => mapped,
                None => {
                    let source = replacement.edge(edge)?;
                    let Some(value) = source.constant_value() else {
                        return Err(Error::Pattern(format!(
                            "replacement edge '{}' is used before it is produced",
                            source.name
                        )));
                    };
                    let name = graph.unique_edge_name(&source.name);
                    let mapped = graph.add_edge(IrEdge::with_constant(name, value.clone()));
                    edge_map.insert(edge, mapped);
                    mapped
                }
            };
            node.add_input(mapped);
        }

        for &edge in &template.outputs {
            let mapped = match edge_map.get(&edge) {
                Some(&mapped) => mapped,
                None => {
                    let source = replacement.edge(edge)?;
                    let name = graph.unique_edge_name(&source.name);
                    let mapped =
                        graph.add_edge(IrEdge::new(name, source.dtype, source.shape.clone()));
                    edge_map.insert(edge, mapped);
                    mapped
                }
            };
            node.add_output(mapped);
        }

        graph.add_node(node)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::types::{DataType, TensorShape};

    /// `softmax(x, -1) + y`
    fn softmax_add_pattern() -> SubgraphPattern {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        let y = b.placeholder("y");
        let s = b.softmax(x, -1).unwrap();
        let out = b.add(s, y).unwrap();
        SubgraphPattern::new(b.finish(&[out]).unwrap()).unwrap()
    }

    fn fused_replacement() -> IrGraph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        let y = b.placeholder("y");
        let out = b.call_opaque("SoftmaxAdd", &[x, y], Vec::new()).unwrap();
        b.finish(&[out]).unwrap()
    }

    fn input(b: &mut GraphBuilder, name: &str) -> IrEdgeId {
        b.input(name, DataType::F32, TensorShape::Static(vec![4]))
    }

    #[test]
    fn test_pattern_requires_single_output() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        let a = b.softmax(x, -1).unwrap();
        let c = b.softmax(x, 0).unwrap();
        assert!(SubgraphPattern::new(b.finish(&[a, c]).unwrap()).is_err());
    }

    #[test]
    fn test_pattern_rejects_unused_input() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        b.placeholder("unused");
        let a = b.softmax(x, -1).unwrap();
        assert!(SubgraphPattern::new(b.finish(&[a]).unwrap()).is_err());
    }

    #[test]
    fn test_match_binds_inputs_by_position() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s = b.softmax(x, -1).unwrap();
        let out = b.add(s, y).unwrap();
        let graph = b.finish(&[out]).unwrap();

        let matches = softmax_add_pattern().find_matches(&graph).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].bindings, vec![x, y]);
        assert_eq!(matches[0].output, out);
        assert_eq!(matches[0].nodes.len(), 2);
    }

    #[test]
    fn test_attribute_mismatch_does_not_match() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s = b.softmax(x, 0).unwrap();
        let out = b.add(s, y).unwrap();
        let graph = b.finish(&[out]).unwrap();

        assert!(softmax_add_pattern().find_matches(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_operand_order_matters() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s = b.softmax(x, -1).unwrap();
        let out = b.add(y, s).unwrap();
        let graph = b.finish(&[out]).unwrap();

        assert!(softmax_add_pattern().find_matches(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_constant_values_must_be_identical() {
        let pattern = {
            let mut b = GraphBuilder::new();
            let x = b.placeholder("x");
            let out = b.div_scalar(x, 8.0).unwrap();
            SubgraphPattern::new(b.finish(&[out]).unwrap()).unwrap()
        };

        let graph_with = |divisor: f32| {
            let mut b = GraphBuilder::new();
            let x = input(&mut b, "x");
            let out = b.div_scalar(x, divisor).unwrap();
            b.finish(&[out]).unwrap()
        };

        assert_eq!(pattern.find_matches(&graph_with(8.0)).unwrap().len(), 1);
        assert!(pattern.find_matches(&graph_with(4.0)).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_placeholder_must_bind_same_value() {
        let pattern = {
            let mut b = GraphBuilder::new();
            let x = b.placeholder("x");
            let out = b.add(x, x).unwrap();
            SubgraphPattern::new(b.finish(&[out]).unwrap()).unwrap()
        };

        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let same = b.add(x, x).unwrap();
        let different = b.add(x, y).unwrap();
        let graph = b.finish(&[same, different]).unwrap();

        let matches = pattern.find_matches(&graph).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].output, same);
    }

    #[test]
    fn test_leaking_intermediate_blocks_match() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s = b.softmax(x, -1).unwrap();
        let out = b.add(s, y).unwrap();
        // Softmax result is also returned, so it cannot be fused away.
        let graph = b.finish(&[out, s]).unwrap();

        assert!(softmax_add_pattern().find_matches(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_opaque_nodes_are_never_matched() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s = b
            .call_opaque(
                crate::op::SOFTMAX,
                &[x],
                vec![(crate::op::attr::AXIS, crate::AttrValue::Int(-1))],
            )
            .unwrap();
        let out = b.add(s, y).unwrap();
        let graph = b.finish(&[out]).unwrap();

        assert!(softmax_add_pattern().find_matches(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_replace_pattern_keeps_output_edge() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s = b.softmax(x, -1).unwrap();
        let sum = b.add(s, y).unwrap();
        let out = b.transpose(sum, 0, 0).unwrap();
        let mut graph = b.finish(&[out]).unwrap();

        let replaced =
            replace_pattern(&mut graph, &softmax_add_pattern(), &fused_replacement()).unwrap();
        assert_eq!(replaced.len(), 1);

        assert_eq!(graph.node_count(), 2);
        let fused = graph.tensor_producer(sum).unwrap();
        let fused_node = graph.node(fused).unwrap();
        assert_eq!(fused_node.op_type, "SoftmaxAdd");
        assert!(fused_node.opaque);
        assert_eq!(fused_node.inputs, vec![x, y]);

        // The downstream transpose still reads the same edge and runs after.
        let transpose = graph.tensor_producer(out).unwrap();
        assert_eq!(graph.topological_order(), vec![fused, transpose]);
    }

    #[test]
    fn test_replace_pattern_without_match_is_noop() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let out = b.transpose(x, 0, 0).unwrap();
        let mut graph = b.finish(&[out]).unwrap();
        let before = graph.to_string();

        let replaced =
            replace_pattern(&mut graph, &softmax_add_pattern(), &fused_replacement()).unwrap();

        assert!(replaced.is_empty());
        assert_eq!(graph.to_string(), before);
    }

    #[test]
    fn test_replace_pattern_rejects_arity_mismatch() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x");
        let out = b.softmax(x, -1).unwrap();
        let replacement = b.finish(&[out]).unwrap();

        let mut graph = IrGraph::new();
        assert!(replace_pattern(&mut graph, &softmax_add_pattern(), &replacement).is_err());
    }

    #[test]
    fn test_replace_all_non_overlapping_matches() {
        let mut b = GraphBuilder::new();
        let x = input(&mut b, "x");
        let y = input(&mut b, "y");
        let s1 = b.softmax(x, -1).unwrap();
        let first = b.add(s1, y).unwrap();
        let s2 = b.softmax(first, -1).unwrap();
        let second = b.add(s2, y).unwrap();
        let mut graph = b.finish(&[second]).unwrap();

        let replaced =
            replace_pattern(&mut graph, &softmax_add_pattern(), &fused_replacement()).unwrap();

        assert_eq!(replaced.len(), 2);
        assert_eq!(graph.nodes_with_op("SoftmaxAdd").len(), 2);
        assert_eq!(graph.node_count(), 2);
        let second_node = graph.node(graph.tensor_producer(second).unwrap()).unwrap();
        assert_eq!(second_node.inputs, vec![first, y]);
    }
}
