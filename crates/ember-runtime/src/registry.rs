//! Operator registry for dynamic dispatch.

use crate::device::Device;
use crate::operator::{
    BinaryElementwiseOp, CastOp, EmptyLikeOp, FusedAttentionOp, MatMulOp, Operator, SoftmaxOp,
    TransposeOp, TypeAsOp,
};
use std::collections::HashMap;

/// Maps operator type names (e.g. "Add", "MatMul") to their implementations.
///
/// # Example
///
/// ```
/// use ember_runtime::{HostDevice, OperatorRegistry};
///
/// let registry = OperatorRegistry::<HostDevice>::with_defaults();
/// assert!(registry.contains("FusedAttention"));
/// ```
pub struct OperatorRegistry<D: Device> {
    operators: HashMap<String, Box<dyn Operator<D>>>,
}

impl<D: Device> OperatorRegistry<D> {
    /// Create a new empty operator registry.
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// A registry covering every operator type in `ember_core::op`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // Binary elementwise
        registry.register(BinaryElementwiseOp::add());
        registry.register(BinaryElementwiseOp::sub());
        registry.register(BinaryElementwiseOp::mul());
        registry.register(BinaryElementwiseOp::div());

        // Linear algebra and normalization
        registry.register(TransposeOp);
        registry.register(MatMulOp);
        registry.register(SoftmaxOp);

        // Type conversion
        registry.register(CastOp);
        registry.register(TypeAsOp);

        // Allocation and fused kernels
        registry.register(EmptyLikeOp);
        registry.register(FusedAttentionOp);

        registry
    }

    /// Register an operator under its own name, replacing any previous one.
    ///
    /// Returns `self` for method chaining.
    pub fn register<O>(&mut self, operator: O) -> &mut Self
    where
        O: Operator<D> + 'static,
    {
        let name = Operator::<D>::name(&operator).to_string();
        self.operators.insert(name, Box::new(operator));
        self
    }

    /// Look up an operator by name.
    pub fn get(&self, name: &str) -> Option<&dyn Operator<D>> {
        self.operators.get(name).map(|op| op.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Iterate over all registered operator names.
    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(|s| s.as_str())
    }
}

impl<D: Device> Default for OperatorRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}
