//! Common test utilities for fusion integration tests.

#![allow(dead_code)]

use ember_core::{DataType, GraphBuilder, IrEdgeId, IrGraph, TensorShape};
use ember_runtime::{DeviceCtx, GraphExecutor, HostDevice, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Install a fmt subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Values uniform in [-1, 1).
pub fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn random_tensor(
    ctx: DeviceCtx<'_, HostDevice>,
    rng: &mut StdRng,
    shape: &[usize],
    dtype: DataType,
) -> anyhow::Result<Tensor> {
    let values = random_values(rng, shape.iter().product());
    Ok(ctx.tensor_from_f32(&values, shape, dtype)?)
}

/// Declare `(q, k, mask, v)` graph inputs.
pub fn attention_inputs(b: &mut GraphBuilder, mask_name: &str, dtype: DataType) -> [IrEdgeId; 4] {
    [
        b.input("q", dtype, TensorShape::Unknown),
        b.input("k", dtype, TensorShape::Unknown),
        b.input(mask_name, dtype, TensorShape::Unknown),
        b.input("v", dtype, TensorShape::Unknown),
    ]
}

/// `softmax(q·kᵗ / 8 + mask)·v`
pub fn scaled_mask_block(
    b: &mut GraphBuilder,
    [q, k, mask, v]: [IrEdgeId; 4],
) -> anyhow::Result<IrEdgeId> {
    let kt = b.transpose(k, -1, -2)?;
    let scores = b.matmul(q, kt)?;
    let scaled = b.div_scalar(scores, 8.0)?;
    let masked = b.add(scaled, mask)?;
    let probs = b.softmax(masked, -1)?;
    Ok(b.matmul(probs, v)?)
}

/// `type_as(softmax(float(q·kᵗ + bias)), q·kᵗ + bias)·v`
pub fn position_bias_block(
    b: &mut GraphBuilder,
    [q, k, bias, v]: [IrEdgeId; 4],
) -> anyhow::Result<IrEdgeId> {
    let kt = b.transpose(k, 3, 2)?;
    let scores = b.matmul(q, kt)?;
    let biased = b.add(scores, bias)?;
    let upcast = b.float(biased)?;
    let probs = b.softmax(upcast, -1)?;
    let probs = b.type_as(probs, biased)?;
    Ok(b.matmul(probs, v)?)
}

pub fn scaled_mask_graph(dtype: DataType) -> anyhow::Result<IrGraph> {
    let mut b = GraphBuilder::new();
    let inputs = attention_inputs(&mut b, "attention_mask", dtype);
    let out = scaled_mask_block(&mut b, inputs)?;
    Ok(b.finish(&[out])?)
}

pub fn position_bias_graph(dtype: DataType) -> anyhow::Result<IrGraph> {
    let mut b = GraphBuilder::new();
    let inputs = attention_inputs(&mut b, "position_bias", dtype);
    let out = position_bias_block(&mut b, inputs)?;
    Ok(b.finish(&[out])?)
}

/// Evaluate `graph` eagerly and download every output.
pub fn evaluate(
    ctx: DeviceCtx<'_, HostDevice>,
    graph: &IrGraph,
    inputs: &[Tensor],
) -> anyhow::Result<Vec<Vec<f32>>> {
    let outputs = GraphExecutor::with_defaults().run(ctx, graph, inputs)?;
    outputs
        .iter()
        .map(|t| Ok(ctx.to_f32_vec(t)?))
        .collect()
}

pub fn assert_vec_approx_eq(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "mismatch at index {i}: {a} vs {e} (tolerance {tolerance})"
        );
    }
}
