//! Device runtime for ember.
//!
//! # Architecture
//!
//! - **Device boundary** (`Device`): memory, streams, kernel launches and
//!   graph capture/replay. `HostDevice` is an in-process implementation with
//!   the same capture rules as a GPU runtime.
//! - **Execution context** (`DeviceCtx`): a device plus an explicit stream;
//!   all tensor operations go through it.
//! - **Graph capture** (`capture::wrap`): records a model once and returns a
//!   `GraphRunner` that replays it against new inputs.
//! - **Graph execution** (`GraphExecutor`): evaluates an `ember_core::IrGraph`
//!   through an `OperatorRegistry`.
//!
//! # Example
//!
//! ```
//! use ember_core::{DataType, GraphBuilder, TensorShape};
//! use ember_runtime::{CaptureOptions, DeviceCtx, GraphExecutor, HostDevice, capture};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut b = GraphBuilder::new();
//!     let x = b.input("x", DataType::F32, TensorShape::Static(vec![4]));
//!     let y = b.softmax(x, -1)?;
//!     let graph = b.finish(&[y])?;
//!
//!     let device = HostDevice::new();
//!     let ctx = DeviceCtx::on_default_stream(&device);
//!     let executor = GraphExecutor::with_defaults();
//!
//!     let sample = ctx.tensor_from_f32(&[0.0; 4], &[4], DataType::F32)?;
//!     let runner = capture::wrap(
//!         ctx,
//!         |ctx, inputs| executor.run(ctx, &graph, inputs),
//!         &[sample],
//!         CaptureOptions::default().with_copy_outputs(true),
//!     )?;
//!
//!     let input = ctx.tensor_from_f32(&[1.0, 2.0, 3.0, 4.0], &[4], DataType::F32)?;
//!     let outputs = runner.run(ctx, &[input])?;
//!     let probs = ctx.to_f32_vec(&outputs[0])?;
//!     assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
//!     Ok(())
//! }
//! ```

pub mod capture;
mod context;
mod device;
mod error;
mod executor;
mod host;
mod kernel;
mod operator;
mod registry;
mod tensor;

// Public exports
pub use capture::{CaptureOptions, GraphRunner, ModelOutput, WARMUP_ROUNDS, wrap};
pub use context::{DeviceCtx, expect_dtype};
pub use device::{BufferId, Device, MemPoolId, StreamId};
pub use error::{Result, RuntimeError};
pub use executor::GraphExecutor;
pub use host::{DeviceStats, HostDevice, HostGraph};
pub use kernel::{BinaryOp, Kernel, matmul_shape, transpose_shape};
pub use operator::{
    BinaryElementwiseOp, CastOp, EmptyLikeOp, FusedAttentionOp, MatMulOp, Operator, SoftmaxOp,
    TransposeOp, TypeAsOp,
};
pub use registry::OperatorRegistry;
pub use tensor::{Element, HostTensor, Tensor, decode_f32, encode_f32};
