//! Intermediate representation for model graphs.
//!
//! The IR is a directed graph where:
//! - **Nodes** (`IrNode`) are operators (e.g., MatMul, Softmax, FusedAttention)
//! - **Edges** (`IrEdge`) are tensor value flows between operators
//!
//! Edges live in a side-table and are addressed by `IrEdgeId`; petgraph edges
//! exist solely for topological ordering. Rewrites keep edge IDs stable so a
//! replacement can take over an existing value without touching its consumers.

use crate::types::{AttrValue, DataType, TensorShape, TensorValue};
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::Topo;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Type alias for IR node identifiers (backed by petgraph NodeIndex).
pub type IrNodeId = NodeIndex;

/// Unique identifier for an edge (tensor flow) in the IR graph.
///
/// This is an index into the graph's edge side-table and stays valid across
/// node insertion and removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrEdgeId(pub usize);

impl IrEdgeId {
    /// Create a new edge ID.
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

// ──────────────────────────────── IrGraph ────────────────────────────────

/// Intermediate representation graph.
///
/// Owned by the caller; passes mutate it in place.
#[derive(Clone)]
pub struct IrGraph {
    /// The graph structure (nodes only, no edge data).
    graph: StableGraph<IrNode, ()>,

    /// Edge metadata side-table.
    edges: Vec<IrEdge>,

    /// Lookup table: edge name -> edge ID.
    edge_by_name: HashMap<String, IrEdgeId>,

    /// Lookup table: edge ID -> producing node ID.
    edge_producer: HashMap<IrEdgeId, IrNodeId>,

    /// Lookup table: edge ID -> consuming node IDs.
    edge_consumers: HashMap<IrEdgeId, Vec<IrNodeId>>,

    /// Graph input edge IDs, in call order.
    pub inputs: Vec<IrEdgeId>,

    /// Graph output edge IDs, in return order.
    pub outputs: Vec<IrEdgeId>,
}

impl IrGraph {
    /// Create a new empty IR graph.
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            edges: Vec::new(),
            edge_by_name: HashMap::new(),
            edge_producer: HashMap::new(),
            edge_consumers: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    // ── Node access ──

    /// Get an immutable reference to a node.
    pub fn node(&self, id: IrNodeId) -> Result<&IrNode> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {id:?} not found")))
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: IrNodeId) -> Result<&mut IrNode> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {id:?} not found")))
    }

    /// Check whether a node is still present.
    pub fn contains_node(&self, id: IrNodeId) -> bool {
        self.graph.contains_node(id)
    }

    /// Iterate over all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = (IrNodeId, &IrNode)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|node| (id, node)))
    }

    /// All nodes with the given operator type, in topological order.
    pub fn nodes_with_op(&self, op_type: &str) -> Vec<IrNodeId> {
        self.topological_order()
            .into_iter()
            .filter(|&id| {
                self.graph
                    .node_weight(id)
                    .is_some_and(|node| node.op_type == op_type)
            })
            .collect()
    }

    // ── Edge (tensor) access ──

    /// Get an immutable reference to an edge.
    pub fn edge(&self, id: IrEdgeId) -> Result<&IrEdge> {
        self.edges
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Edge {id:?} not found")))
    }

    /// Get a mutable reference to an edge.
    pub fn edge_mut(&mut self, id: IrEdgeId) -> Result<&mut IrEdge> {
        self.edges
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Edge {id:?} not found")))
    }

    /// Look up an edge by name.
    pub fn edge_by_name(&self, name: &str) -> Option<IrEdgeId> {
        self.edge_by_name.get(name).copied()
    }

    /// Get the node that produces an edge, if any.
    pub fn tensor_producer(&self, id: IrEdgeId) -> Option<IrNodeId> {
        self.edge_producer.get(&id).copied()
    }

    /// Get the nodes that consume an edge.
    pub fn tensor_consumers(&self, id: IrEdgeId) -> Vec<IrNodeId> {
        self.edge_consumers.get(&id).cloned().unwrap_or_default()
    }

    /// Check if an edge is one of the graph outputs.
    pub fn is_output(&self, id: IrEdgeId) -> bool {
        self.outputs.contains(&id)
    }

    // ── Graph mutation ──

    /// Add a new node to the graph and return its ID.
    ///
    /// This also updates the producer/consumer lookup tables and adds petgraph
    /// edges for topological ordering, both from the producers of the node's
    /// inputs and to any existing consumers of its outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the node references an unknown edge or if one of
    /// its outputs already has a producer.
    pub fn add_node(&mut self, mut node: IrNode) -> Result<IrNodeId> {
        for &edge_id in node.inputs.iter().chain(&node.outputs) {
            self.edge(edge_id)?;
        }
        for &output_id in &node.outputs {
            if let Some(existing) = self.edge_producer.get(&output_id) {
                return Err(Error::InvalidGraph(format!(
                    "Edge '{}' is already produced by node {existing:?}",
                    self.edges[output_id.index()].name
                )));
            }
        }

        let inputs = node.inputs.clone();
        let outputs = node.outputs.clone();
        node.node_index = NodeIndex::end();
        let node_id = self.graph.add_node(node);
        self.graph[node_id].node_index = node_id;

        for output_id in outputs {
            self.edge_producer.insert(output_id, node_id);
            for consumer in self.tensor_consumers(output_id) {
                self.graph.add_edge(node_id, consumer, ());
            }
        }

        for input_id in inputs {
            self.edge_consumers.entry(input_id).or_default().push(node_id);
            if let Some(&producer_id) = self.edge_producer.get(&input_id) {
                self.graph.add_edge(producer_id, node_id, ());
            }
        }

        Ok(node_id)
    }

    /// Remove a node from the graph.
    ///
    /// This also removes the node from producer/consumer lookup tables. With
    /// `StableGraph`, other node indices remain valid. The node's output edges
    /// stay in the side-table without a producer.
    pub fn remove_node(&mut self, id: IrNodeId) -> Result<IrNode> {
        let node = self
            .graph
            .remove_node(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {id:?} not found")))?;

        for output_id in &node.outputs {
            if self.edge_producer.get(output_id) == Some(&id) {
                self.edge_producer.remove(output_id);
            }
        }

        for input_id in &node.inputs {
            if let Some(consumers) = self.edge_consumers.get_mut(input_id) {
                consumers.retain(|&c| c != id);
            }
        }

        Ok(node)
    }

    /// Add an edge (tensor) to the graph and return its ID.
    pub fn add_edge(&mut self, edge: IrEdge) -> IrEdgeId {
        let id = IrEdgeId::new(self.edges.len());
        self.edge_by_name.insert(edge.name.clone(), id);
        self.edges.push(edge);
        id
    }

    /// Return `base` if no edge uses that name yet, otherwise `base_N` for the
    /// smallest free `N`.
    pub fn unique_edge_name(&self, base: &str) -> String {
        unique_name(base, |candidate| self.edge_by_name.contains_key(candidate))
    }

    /// Return `base` if no node uses that name yet, otherwise `base_N`.
    pub fn unique_node_name(&self, base: &str) -> String {
        let taken: HashSet<&str> = self.nodes().map(|(_, node)| node.name.as_str()).collect();
        unique_name(base, |candidate| taken.contains(candidate))
    }

    // ── Graph queries ──

    /// Get the topological order of nodes in the graph.
    ///
    /// Returns nodes in an order such that all inputs to a node are produced
    /// before the node itself.
    pub fn topological_order(&self) -> Vec<IrNodeId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();

        while let Some(id) = topo.next(&self.graph) {
            if self.graph.node_weight(id).is_some() {
                order.push(id);
            }
        }

        order
    }

    /// Get the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of edges (tensors) ever added to the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Find a node by its name.
    ///
    /// # Errors
    ///
    /// Returns an error if no node with the given name exists.
    pub fn find_node_by_name(&self, name: &str) -> Result<IrNodeId> {
        self.nodes()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node '{name}' not found")))
    }

    fn edge_label(&self, id: IrEdgeId) -> String {
        match self.edges.get(id.index()) {
            Some(edge) => match edge.constant_value() {
                Some(value) => match value.as_scalar() {
                    Some(scalar) => format!("const({scalar:?})"),
                    None => format!("const{:?}", value.shape),
                },
                None => edge.name.clone(),
            },
            None => format!("<missing {}>", id.index()),
        }
    }
}

fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

impl Default for IrGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable textual dump: one line per node in topological order.
impl fmt::Display for IrGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |ids: &[IrEdgeId]| {
            ids.iter()
                .map(|&id| self.edge_label(id))
                .collect::<Vec<_>>()
                .join(", ")
        };

        writeln!(
            f,
            "graph({}) -> ({})",
            names(&self.inputs),
            names(&self.outputs)
        )?;
        for id in self.topological_order() {
            let node = &self.graph[id];
            write!(
                f,
                "  {} = {}({})",
                names(&node.outputs),
                node.op_type,
                names(&node.inputs)
            )?;
            if !node.attributes.is_empty() {
                let attrs = node
                    .attributes
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, " {{{attrs}}}")?;
            }
            if node.opaque {
                write!(f, " opaque")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for IrGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ──────────────────────────────── IrNode ─────────────────────────────────

/// A node in the IR graph: one operator reading and writing tensor edges.
#[derive(Debug, Clone)]
pub struct IrNode {
    /// Node name (unique when created through the builder or the rewriter).
    pub name: String,

    /// Operator type (e.g., "MatMul", "Softmax").
    pub op_type: String,

    /// Operator attributes (e.g., axis, scale, target dtype).
    pub attributes: BTreeMap<String, AttrValue>,

    /// Input edge IDs.
    pub inputs: Vec<IrEdgeId>,

    /// Output edge IDs.
    pub outputs: Vec<IrEdgeId>,

    /// Opaque nodes are single units for rewriting: the matcher never
    /// descends into or matches them.
    pub opaque: bool,

    /// The graph node index (for efficient graph traversal).
    pub node_index: IrNodeId,
}

impl IrNode {
    /// Create a new node with the given operator type.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            attributes: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            opaque: false,
            node_index: NodeIndex::end(),
        }
    }

    /// Builder-style name setter.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the node as opaque to rewriting.
    pub fn into_opaque(mut self) -> Self {
        self.opaque = true;
        self
    }

    /// Get the operator type.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Get input edge IDs.
    pub fn inputs(&self) -> &[IrEdgeId] {
        &self.inputs
    }

    /// Get output edge IDs.
    pub fn outputs(&self) -> &[IrEdgeId] {
        &self.outputs
    }

    /// Add an input edge.
    pub fn add_input(&mut self, edge_id: IrEdgeId) {
        self.inputs.push(edge_id);
    }

    /// Add an output edge.
    pub fn add_output(&mut self, edge_id: IrEdgeId) {
        self.outputs.push(edge_id);
    }

    /// Set an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttrValue) {
        self.attributes.insert(key.into(), value);
    }

    /// Get an attribute.
    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Get a required float attribute.
    pub fn float_attr(&self, key: &str) -> Result<f32> {
        self.required_attr(key, AttrValue::as_float, "float")
    }

    /// Get a required integer attribute.
    pub fn int_attr(&self, key: &str) -> Result<i64> {
        self.required_attr(key, AttrValue::as_int, "int")
    }

    /// Get a required boolean attribute.
    pub fn bool_attr(&self, key: &str) -> Result<bool> {
        self.required_attr(key, AttrValue::as_bool, "bool")
    }

    /// Get a required dtype attribute.
    pub fn dtype_attr(&self, key: &str) -> Result<DataType> {
        self.required_attr(key, AttrValue::as_dtype, "dtype")
    }

    fn required_attr<T>(
        &self,
        key: &str,
        extract: impl Fn(&AttrValue) -> Option<T>,
        kind: &str,
    ) -> Result<T> {
        let value = self.attributes.get(key).ok_or_else(|| {
            Error::Attribute(format!("{} node '{}' has no '{key}'", self.op_type, self.name))
        })?;
        extract(value).ok_or_else(|| {
            Error::Attribute(format!(
                "{} node '{}': '{key}' is not a {kind} ({value:?})",
                self.op_type, self.name
            ))
        })
    }
}

// ──────────────────────────────── EdgeData ───────────────────────────────

/// What build-time data an edge carries.
#[derive(Debug, Clone)]
pub enum EdgeData {
    /// No build-time data; value arrives at runtime (graph input or operator output).
    Runtime,

    /// Value fixed when the graph was built (e.g. a scalar divisor).
    Constant(TensorValue),
}

// ──────────────────────────────── IrEdge ─────────────────────────────────

/// An edge (tensor value flow) in the IR graph.
#[derive(Debug, Clone)]
pub struct IrEdge {
    /// Tensor name (unique within the graph).
    pub name: String,

    /// Data type.
    pub dtype: DataType,

    /// Shape, if recorded.
    pub shape: TensorShape,

    /// Build-time data carried by this edge.
    pub data: EdgeData,
}

impl IrEdge {
    /// Create a new runtime edge (no build-time data).
    pub fn new(name: impl Into<String>, dtype: DataType, shape: TensorShape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data: EdgeData::Runtime,
        }
    }

    /// Create a new edge with a known constant value.
    pub fn with_constant(name: impl Into<String>, value: TensorValue) -> Self {
        Self {
            name: name.into(),
            dtype: value.dtype,
            shape: TensorShape::Static(value.shape.clone()),
            data: EdgeData::Constant(value),
        }
    }

    /// Check if this edge holds a constant value.
    pub fn is_constant(&self) -> bool {
        matches!(self.data, EdgeData::Constant(_))
    }

    /// Get the constant value, if this edge holds one.
    pub fn constant_value(&self) -> Option<&TensorValue> {
        match &self.data {
            EdgeData::Constant(value) => Some(value),
            EdgeData::Runtime => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_edge(graph: &mut IrGraph, name: &str) -> IrEdgeId {
        graph.add_edge(IrEdge::new(
            name,
            DataType::F32,
            TensorShape::Static(vec![2]),
        ))
    }

    #[test]
    fn test_create_empty_graph() {
        let graph = IrGraph::new();
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_add_edge() {
        let mut graph = IrGraph::new();
        let edge_id = runtime_edge(&mut graph, "x");

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edge(edge_id).unwrap().name, "x");
        assert_eq!(graph.edge_by_name("x"), Some(edge_id));
    }

    #[test]
    fn test_add_node_registers_producer_and_consumer() {
        let mut graph = IrGraph::new();
        let input = runtime_edge(&mut graph, "input");
        let output = runtime_edge(&mut graph, "output");

        let mut node = IrNode::new("Softmax");
        node.add_input(input);
        node.add_output(output);
        let node_id = graph.add_node(node).unwrap();

        assert_eq!(graph.node(node_id).unwrap().node_index, node_id);
        assert_eq!(graph.tensor_producer(output), Some(node_id));
        assert_eq!(graph.tensor_consumers(input), vec![node_id]);
    }

    #[test]
    fn test_add_node_rejects_second_producer() {
        let mut graph = IrGraph::new();
        let input = runtime_edge(&mut graph, "input");
        let output = runtime_edge(&mut graph, "output");

        let mut first = IrNode::new("A");
        first.add_input(input);
        first.add_output(output);
        graph.add_node(first).unwrap();

        let mut second = IrNode::new("B");
        second.add_input(input);
        second.add_output(output);
        assert!(graph.add_node(second).is_err());
    }

    #[test]
    fn test_add_node_rejects_unknown_edge() {
        let mut graph = IrGraph::new();
        let mut node = IrNode::new("A");
        node.add_input(IrEdgeId::new(7));
        assert!(graph.add_node(node).is_err());
    }

    #[test]
    fn test_remove_node() {
        let mut graph = IrGraph::new();
        let input = runtime_edge(&mut graph, "input");
        let output = runtime_edge(&mut graph, "output");

        let mut node = IrNode::new("Add");
        node.add_input(input);
        node.add_output(output);
        let node_id = graph.add_node(node).unwrap();

        let removed = graph.remove_node(node_id).unwrap();

        assert_eq!(removed.op_type, "Add");
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.tensor_producer(output), None);
        assert!(graph.tensor_consumers(input).is_empty());
        assert!(graph.remove_node(node_id).is_err());
    }

    #[test]
    fn test_topological_order() {
        let mut graph = IrGraph::new();
        let t0 = runtime_edge(&mut graph, "t0");
        let t1 = runtime_edge(&mut graph, "t1");
        let t2 = runtime_edge(&mut graph, "t2");
        let t3 = runtime_edge(&mut graph, "t3");

        let mut node_a = IrNode::new("A");
        node_a.add_input(t0);
        node_a.add_output(t1);
        let id_a = graph.add_node(node_a).unwrap();

        let mut node_b = IrNode::new("B");
        node_b.add_input(t1);
        node_b.add_output(t2);
        let id_b = graph.add_node(node_b).unwrap();

        let mut node_c = IrNode::new("C");
        node_c.add_input(t2);
        node_c.add_output(t3);
        let id_c = graph.add_node(node_c).unwrap();

        assert_eq!(graph.topological_order(), vec![id_a, id_b, id_c]);
    }

    #[test]
    fn test_replacement_producer_orders_before_existing_consumer() {
        let mut graph = IrGraph::new();
        let t0 = runtime_edge(&mut graph, "t0");
        let t1 = runtime_edge(&mut graph, "t1");
        let t2 = runtime_edge(&mut graph, "t2");

        let mut consumer = IrNode::new("Consumer");
        consumer.add_input(t1);
        consumer.add_output(t2);
        let consumer_id = graph.add_node(consumer).unwrap();

        // Producer of t1 added after its consumer, as a rewrite does.
        let mut producer = IrNode::new("Producer");
        producer.add_input(t0);
        producer.add_output(t1);
        let producer_id = graph.add_node(producer).unwrap();

        assert_eq!(graph.topological_order(), vec![producer_id, consumer_id]);
    }

    #[test]
    fn test_stable_graph_indices() {
        let mut graph = IrGraph::new();
        let t0 = runtime_edge(&mut graph, "t0");
        let t1 = runtime_edge(&mut graph, "t1");
        let t2 = runtime_edge(&mut graph, "t2");

        let mut node_a = IrNode::new("A");
        node_a.add_input(t0);
        node_a.add_output(t1);
        let id_a = graph.add_node(node_a).unwrap();

        let mut node_b = IrNode::new("B");
        node_b.add_input(t1);
        node_b.add_output(t2);
        let id_b = graph.add_node(node_b).unwrap();

        let mut node_c = IrNode::new("C");
        node_c.add_input(t2);
        let id_c = graph.add_node(node_c).unwrap();

        graph.remove_node(id_b).unwrap();

        assert!(graph.node(id_a).is_ok());
        assert!(graph.node(id_c).is_ok());
        assert!(!graph.contains_node(id_b));
    }

    #[test]
    fn test_unique_names() {
        let mut graph = IrGraph::new();
        runtime_edge(&mut graph, "x");
        runtime_edge(&mut graph, "x_1");
        assert_eq!(graph.unique_edge_name("y"), "y");
        assert_eq!(graph.unique_edge_name("x"), "x_2");

        let mut node = IrNode::new("A").with_name("a");
        node.add_input(IrEdgeId::new(0));
        graph.add_node(node).unwrap();
        assert_eq!(graph.unique_node_name("a"), "a_1");
        assert_eq!(graph.unique_node_name("b"), "b");
    }

    #[test]
    fn test_required_attributes() {
        let mut node = IrNode::new("Softmax").with_name("softmax");
        node.set_attribute("axis", AttrValue::Int(-1));

        assert_eq!(node.int_attr("axis").unwrap(), -1);
        assert!(node.float_attr("axis").is_err());
        assert!(node.int_attr("missing").is_err());
    }
}
