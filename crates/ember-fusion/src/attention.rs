//! Scaled dot-product attention fusion.
//!
//! Traced models spell attention out as a chain of primitive operators. The
//! matcher is purely structural, so every spelling needs its own template:
//!
//! - [`AttentionPattern::ScaledMask`]:
//!   `matmul(softmax(matmul(q, kᵗ) / 8 + mask), v)`
//! - [`AttentionPattern::PositionBias`]:
//!   `matmul(type_as(softmax(float(matmul(q, kᵗ) + bias)), matmul(q, kᵗ) + bias), v)`
//!
//! Both are replaced by an output buffer shaped like `q` and one opaque
//! `FusedAttention` node writing into it.

use ember_core::op::{self, attr};
use ember_core::{AttrValue, GraphBuilder, IrGraph, Result, SubgraphPattern, replace_pattern};
use std::fmt;
use tracing::debug;

/// Divisor applied to the attention scores by the scaled-mask spelling.
const SCALED_MASK_DIVISOR: f32 = 8.0;

/// A known spelling of attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionPattern {
    /// Scores divided by 8, then an additive attention mask.
    ScaledMask,

    /// Unscaled scores plus a position bias, with the softmax computed in
    /// f32 and cast back to the scores' dtype.
    PositionBias,
}

/// Which tensor of the matched sub-graph the fused node receives as its mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskOperand {
    AttentionMask,
    PositionBias,
}

impl MaskOperand {
    pub fn name(self) -> &'static str {
        match self {
            MaskOperand::AttentionMask => "attention_mask",
            MaskOperand::PositionBias => "position_bias",
        }
    }
}

impl AttentionPattern {
    /// Every pattern, in the order the fusion pass tries them.
    pub const ALL: [AttentionPattern; 2] = [
        AttentionPattern::ScaledMask,
        AttentionPattern::PositionBias,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AttentionPattern::ScaledMask => "scaled_mask",
            AttentionPattern::PositionBias => "position_bias",
        }
    }

    /// Scale the fused node applies to `q·kᵗ`.
    pub fn scale(self) -> f32 {
        match self {
            AttentionPattern::ScaledMask => 1.0 / SCALED_MASK_DIVISOR,
            AttentionPattern::PositionBias => 1.0,
        }
    }

    pub fn mask_operand(self) -> MaskOperand {
        match self {
            AttentionPattern::ScaledMask => MaskOperand::AttentionMask,
            AttentionPattern::PositionBias => MaskOperand::PositionBias,
        }
    }

    /// The sub-graph to search for. Inputs are `(q, k, mask, v)`.
    pub fn pattern(self) -> Result<SubgraphPattern> {
        let mut b = GraphBuilder::new();
        let q = b.placeholder("query");
        let k = b.placeholder("key");
        let mask = b.placeholder(self.mask_operand().name());
        let v = b.placeholder("value");

        let output = match self {
            AttentionPattern::ScaledMask => {
                let kt = b.transpose(k, -1, -2)?;
                let scores = b.matmul(q, kt)?;
                let scaled = b.div_scalar(scores, SCALED_MASK_DIVISOR)?;
                let masked = b.add(scaled, mask)?;
                let probs = b.softmax(masked, -1)?;
                b.matmul(probs, v)?
            }
            AttentionPattern::PositionBias => {
                let kt = b.transpose(k, 3, 2)?;
                let scores = b.matmul(q, kt)?;
                let biased = b.add(scores, mask)?;
                let upcast = b.float(biased)?;
                let probs = b.softmax(upcast, -1)?;
                let probs = b.type_as(probs, biased)?;
                b.matmul(probs, v)?
            }
        };

        SubgraphPattern::new(b.finish(&[output])?)
    }

    /// The sub-graph substituted for each match, with the same inputs as
    /// [`AttentionPattern::pattern`].
    pub fn replacement(self, is_causal: bool) -> Result<IrGraph> {
        build_replacement(self.scale(), self.mask_operand(), is_causal)
    }
}

impl fmt::Display for AttentionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build `empty_like(q)` followed by an opaque `FusedAttention` node taking
/// `(q, k, v, output, mask)`. Inputs are `(q, k, mask, v)`.
pub fn build_replacement(
    scale: f32,
    mask_operand: MaskOperand,
    is_causal: bool,
) -> Result<IrGraph> {
    let mut b = GraphBuilder::new();
    let q = b.placeholder("query");
    let k = b.placeholder("key");
    let mask = b.placeholder(mask_operand.name());
    let v = b.placeholder("value");

    let output = b.empty_like(q)?;
    let attended = b.call_opaque(
        op::FUSED_ATTENTION,
        &[q, k, v, output, mask],
        vec![
            (attr::SCALE, AttrValue::Float(scale)),
            (attr::IS_CAUSAL, AttrValue::Bool(is_causal)),
        ],
    )?;
    b.finish(&[attended])
}

/// Replace every occurrence of `pattern` in `graph` with a fused attention
/// call. Returns the number of sub-graphs replaced; zero is not an error.
#[tracing::instrument(skip_all, fields(pattern = pattern.name(), is_causal = is_causal))]
pub fn fuse_attention(
    graph: &mut IrGraph,
    pattern: AttentionPattern,
    is_causal: bool,
) -> Result<usize> {
    let template = pattern.pattern()?;
    let replacement = pattern.replacement(is_causal)?;
    let replaced = replace_pattern(graph, &template, &replacement)?;
    debug!(count = replaced.len(), "fused attention sub-graphs");
    Ok(replaced.len())
}

/// Fuse `softmax(q·kᵗ / 8 + mask)·v` with scale 1/8.
pub fn fuse_attention_pattern_1(graph: &mut IrGraph, is_causal: bool) -> Result<usize> {
    fuse_attention(graph, AttentionPattern::ScaledMask, is_causal)
}

/// Fuse the f32-softmax position-bias spelling with scale 1.
pub fn fuse_attention_pattern_2(graph: &mut IrGraph, is_causal: bool) -> Result<usize> {
    fuse_attention(graph, AttentionPattern::PositionBias, is_causal)
}
