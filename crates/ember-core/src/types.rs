//! Core types for tensor shapes, element types, constants and attributes.

use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    /// Lowercase name (`f32`, `f16`, `bf16`).
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tensor shape as recorded on a graph edge.
///
/// Graphs traced from templates don't know their shapes; the runtime computes
/// concrete shapes from the tensors it is handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorShape {
    /// All dimensions are known.
    Static(Vec<usize>),

    /// Shape has not been recorded.
    Unknown,
}

impl TensorShape {
    /// Check if the shape is fully static.
    pub fn is_static(&self) -> bool {
        matches!(self, TensorShape::Static(_))
    }

    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            TensorShape::Static(dims) => Some(dims),
            TensorShape::Unknown => None,
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::Static(dims) => write!(f, "{dims:?}"),
            TensorShape::Unknown => f.write_str("[?]"),
        }
    }
}

/// A tensor value known when the graph is built (e.g. the `8.0` in `x / 8.0`).
///
/// Values are stored as f32 regardless of `dtype`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorValue {
    /// Create a new tensor value.
    pub fn new(data: Vec<f32>, shape: Vec<usize>, dtype: DataType) -> Self {
        Self { data, shape, dtype }
    }

    /// Create a rank-0 f32 value.
    pub fn scalar(value: f32) -> Self {
        Self::new(vec![value], Vec::new(), DataType::F32)
    }

    /// Get the scalar payload if this is a single-element value.
    pub fn as_scalar(&self) -> Option<f32> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Exact equality: same dtype, same shape, bit-identical elements.
    ///
    /// Used by pattern matching, where `8.0` only matches `8.0`.
    pub fn bit_eq(&self, other: &TensorValue) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Node attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Float(f32),
    Int(i64),
    Bool(bool),
    DType(DataType),
    String(String),
}

impl AttrValue {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<DataType> {
        match self {
            AttrValue::DType(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Float(v) => write!(f, "{v:?}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::DType(v) => write!(f, "{v}"),
            AttrValue::String(v) => write!(f, "{v:?}"),
        }
    }
}
