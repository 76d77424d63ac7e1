//! Core intermediate representation and graph utilities for ember.
//!
//! This crate provides the foundational abstractions the other ember crates
//! depend on:
//! - Graph-based IR (`IrGraph`, `IrNode`, `IrEdge`)
//! - A tracing builder for writing graphs as ordinary tensor code (`GraphBuilder`)
//! - The `Pass` trait and compilation `Stage`s
//! - Exact sub-graph matching and substitution (`pattern`)

pub mod broadcast;
pub mod builder;
pub mod ir;
pub mod op;
pub mod pass;
pub mod pattern;
pub mod types;

// Re-export commonly used types
pub use broadcast::broadcast_shape;
pub use builder::GraphBuilder;
pub use ir::{EdgeData, IrEdge, IrEdgeId, IrGraph, IrNode, IrNodeId};
pub use pass::{Pass, Stage};
pub use pattern::{SubgraphMatch, SubgraphPattern, replace_pattern};
pub use types::{AttrValue, DataType, TensorShape, TensorValue};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for ember-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}
