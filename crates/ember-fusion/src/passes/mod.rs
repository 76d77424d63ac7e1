//! Graph passes run by the fusion pipeline.

mod attention_fusion;
mod dead_code;

pub use attention_fusion::AttentionFusionPass;
pub use dead_code::DeadCodeEliminationPass;
