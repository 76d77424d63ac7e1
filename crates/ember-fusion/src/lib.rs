//! Attention fusion for ember graphs.
//!
//! Finds multi-operator spellings of scaled dot-product attention in an
//! `ember_core::IrGraph` and replaces each with a single opaque
//! `FusedAttention` node. The rewrite is in place and exact: only sub-graphs
//! that match a template operator for operator are touched.
//!
//! Entry points, from lowest to highest level:
//! - `fuse_attention_pattern_1` / `fuse_attention_pattern_2`: apply one
//!   pattern
//! - `AttentionFusionPass`, `DeadCodeEliminationPass`: `ember_core::Pass`
//!   implementations
//! - `FusionPipeline`: runs passes by stage and reports what changed

pub mod attention;
pub mod passes;
pub mod pipeline;

pub use attention::{
    AttentionPattern, MaskOperand, build_replacement, fuse_attention, fuse_attention_pattern_1,
    fuse_attention_pattern_2,
};
pub use passes::{AttentionFusionPass, DeadCodeEliminationPass};
pub use pipeline::{FusionOptions, FusionPipeline, PassRecord, PipelineReport, fuse_graph};

// Re-export commonly used types from ember-core
pub use ember_core::{IrGraph, Pass, Stage};
