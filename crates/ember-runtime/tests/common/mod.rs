//! Common test utilities for runtime integration tests.

#![allow(dead_code)]

use ember_core::DataType;
use ember_runtime::{Device, DeviceCtx, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Install a fmt subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Deterministic RNG for a test.
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Upload a tensor of uniform values in [-1, 1).
pub fn random_tensor<D: Device>(
    ctx: DeviceCtx<'_, D>,
    rng: &mut StdRng,
    shape: &[usize],
    dtype: DataType,
) -> anyhow::Result<Tensor> {
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Ok(ctx.tensor_from_f32(&values, shape, dtype)?)
}

/// Assert two float slices are equal within `tolerance`, reporting the first
/// mismatch.
pub fn assert_vec_approx_eq(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        actual.len(),
        expected.len()
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "mismatch at index {i}: {a} vs {e} (tolerance {tolerance})"
        );
    }
}
