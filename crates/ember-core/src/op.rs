//! Operator type names understood by the builder, the matcher and the runtime.

pub const TRANSPOSE: &str = "Transpose";
pub const MATMUL: &str = "MatMul";
pub const ADD: &str = "Add";
pub const SUB: &str = "Sub";
pub const MUL: &str = "Mul";
pub const DIV: &str = "Div";
pub const SOFTMAX: &str = "Softmax";
pub const CAST: &str = "Cast";
pub const TYPE_AS: &str = "TypeAs";
pub const EMPTY_LIKE: &str = "EmptyLike";

/// Single-step scaled dot-product attention.
///
/// Inputs: `(q, k, v, output[, mask])`. Attributes: `scale` (float) and
/// `is_causal` (bool).
pub const FUSED_ATTENTION: &str = "FusedAttention";

/// Attribute keys.
pub mod attr {
    pub const DIM0: &str = "dim0";
    pub const DIM1: &str = "dim1";
    pub const AXIS: &str = "axis";
    pub const TO: &str = "to";
    pub const SCALE: &str = "scale";
    pub const IS_CAUSAL: &str = "is_causal";
}
