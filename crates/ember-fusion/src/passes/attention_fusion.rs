//! Attention fusion pass.

use crate::attention::{AttentionPattern, fuse_attention};
use ember_core::{IrGraph, Pass, Result, Stage};
use tracing::debug;

/// Pass that replaces attention sub-graphs with fused attention nodes.
///
/// Patterns are applied one after another in the order given. A sub-graph
/// fused by an earlier pattern is opaque to later ones.
pub struct AttentionFusionPass {
    patterns: Vec<AttentionPattern>,
    is_causal: bool,
}

impl AttentionFusionPass {
    /// Apply every known pattern.
    pub fn new(is_causal: bool) -> Self {
        Self::with_patterns(AttentionPattern::ALL.to_vec(), is_causal)
    }

    pub fn with_patterns(patterns: Vec<AttentionPattern>, is_causal: bool) -> Self {
        Self {
            patterns,
            is_causal,
        }
    }

    pub fn patterns(&self) -> &[AttentionPattern] {
        &self.patterns
    }

    pub fn is_causal(&self) -> bool {
        self.is_causal
    }
}

impl Pass for AttentionFusionPass {
    fn name(&self) -> &str {
        "attention_fusion"
    }

    fn stage(&self) -> Stage {
        Stage::Fusion
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        let mut total = 0;
        for &pattern in &self.patterns {
            let fused = fuse_attention(graph, pattern, self.is_causal)?;
            if fused > 0 {
                debug!(%pattern, fused, "pattern applied");
            }
            total += fused;
        }
        Ok(total > 0)
    }
}
