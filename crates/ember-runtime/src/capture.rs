//! Graph capture: record a model's device work once, replay it many times.
//!
//! A captured graph refers to buffer addresses, not to the tensors that
//! occupied them during capture. `wrap` therefore captures the model against
//! a set of static input buffers, and `GraphRunner::run` copies each call's
//! inputs into those same buffers before replaying.
//!
//! ```
//! use ember_runtime::{CaptureOptions, DeviceCtx, HostDevice, capture};
//! use ember_core::DataType;
//!
//! # fn main() -> ember_runtime::Result<()> {
//! let device = HostDevice::new();
//! let ctx = DeviceCtx::on_default_stream(&device);
//! let x = ctx.tensor_from_f32(&[1.0, 2.0], &[2], DataType::F32)?;
//!
//! let runner = capture::wrap(
//!     ctx,
//!     |ctx, inputs| ctx.mul_scalar(&inputs[0], 3.0),
//!     &[x],
//!     CaptureOptions::default(),
//! )?;
//!
//! let y = ctx.tensor_from_f32(&[5.0, 6.0], &[2], DataType::F32)?;
//! let out = runner.run(ctx, &[y])?;
//! assert_eq!(ctx.to_f32_vec(&out[0])?, vec![15.0, 18.0]);
//! # Ok(())
//! # }
//! ```

use crate::context::DeviceCtx;
use crate::device::{Device, MemPoolId};
use crate::error::{Result, RuntimeError};
use crate::tensor::Tensor;
use tracing::{debug, warn};

/// Model invocations before capture: the first flushes one-time setup work
/// (kernel compilation, first-call allocations), the second is a true warmup.
pub const WARMUP_ROUNDS: usize = 2;

/// Environment variable read by `CaptureOptions::from_env`.
pub const COPY_OUTPUTS_ENV: &str = "EMBER_GRAPH_COPY_OUTPUTS";

/// Options for `wrap`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Return fresh copies of the outputs from every replay instead of the
    /// static output buffers themselves.
    pub copy_outputs: bool,

    /// Memory pool for the capture. `None` asks the device for a new one.
    pub pool: Option<MemPoolId>,
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_copy_outputs(mut self, copy_outputs: bool) -> Self {
        self.copy_outputs = copy_outputs;
        self
    }

    /// Share `pool` with other captures.
    pub fn with_pool(mut self, pool: MemPoolId) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Defaults, with `copy_outputs` taken from `EMBER_GRAPH_COPY_OUTPUTS`
    /// when it is set to a recognizable boolean.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(value) = std::env::var(COPY_OUTPUTS_ENV) {
            match parse_flag(&value) {
                Some(flag) => options.copy_outputs = flag,
                None => warn!(%value, "ignoring unrecognized {COPY_OUTPUTS_ENV}"),
            }
        }
        options
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// What a model returns: one tensor or several.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Single(Tensor),
    Many(Vec<Tensor>),
}

impl ModelOutput {
    pub fn into_vec(self) -> Vec<Tensor> {
        match self {
            ModelOutput::Single(tensor) => vec![tensor],
            ModelOutput::Many(tensors) => tensors,
        }
    }
}

impl From<Tensor> for ModelOutput {
    fn from(tensor: Tensor) -> Self {
        ModelOutput::Single(tensor)
    }
}

impl From<Vec<Tensor>> for ModelOutput {
    fn from(tensors: Vec<Tensor>) -> Self {
        ModelOutput::Many(tensors)
    }
}

/// A captured model, replayable against new inputs.
///
/// Replays are not reentrant. Calls to `run` on runners that share static
/// buffers or a memory pool must be serialized by the caller.
pub struct GraphRunner<D: Device> {
    graph: D::Graph,
    static_inputs: Vec<Tensor>,
    static_outputs: Vec<Tensor>,
    copy_outputs: bool,
    pool: MemPoolId,
}

/// Capture `model` into a replayable graph.
///
/// The model is run [`WARMUP_ROUNDS`] times on `sample_inputs` on a side
/// stream, fenced off from other work, then once more under capture on
/// zero-filled static copies of the inputs. `ctx.stream` is the caller's
/// stream; the side stream is created here.
///
/// # Errors
///
/// Any error from the model or the device is returned unchanged. If the model
/// fails during capture, the capture is ended before returning.
#[tracing::instrument(skip_all, fields(device = ctx.device.name(), inputs = sample_inputs.len()))]
pub fn wrap<'a, D, F, O>(
    ctx: DeviceCtx<'a, D>,
    mut model: F,
    sample_inputs: &[Tensor],
    options: CaptureOptions,
) -> Result<GraphRunner<D>>
where
    D: Device,
    F: FnMut(DeviceCtx<'a, D>, &[Tensor]) -> Result<O>,
    O: Into<ModelOutput>,
{
    let device = ctx.device;

    let static_inputs = sample_inputs
        .iter()
        .map(|x| ctx.zeros_like(x))
        .collect::<Result<Vec<_>>>()?;

    device.synchronize()?;

    let side = device.create_stream()?;
    device.wait_stream(side, ctx.stream)?;
    let side_ctx = ctx.with_stream(side);
    for round in 0..WARMUP_ROUNDS {
        debug!(round, "warmup");
        model(side_ctx, sample_inputs)?;
    }

    device.stream_synchronize(side)?;
    device.wait_stream(ctx.stream, side)?;
    device.synchronize()?;

    let pool = options.pool.unwrap_or_else(|| device.graph_pool_handle());
    debug!(?side, ?pool, "capturing");
    device.begin_capture(side, pool)?;
    let captured = model(side_ctx, &static_inputs);
    let graph = device.end_capture(side);
    let static_outputs = captured?.into().into_vec();
    let graph = graph?;

    debug!(outputs = static_outputs.len(), "captured");
    Ok(GraphRunner {
        graph,
        static_inputs,
        static_outputs,
        copy_outputs: options.copy_outputs,
        pool,
    })
}

impl<D: Device> GraphRunner<D> {
    /// Copy `inputs` into the static input buffers and replay the graph on
    /// `ctx.stream`.
    ///
    /// With `copy_outputs` off, the returned tensors are the static output
    /// buffers and are overwritten by the next replay.
    ///
    /// # Errors
    ///
    /// `ArgumentCountMismatch` if `inputs.len()` differs from the number of
    /// captured inputs; nothing is copied or replayed in that case.
    pub fn run(&self, ctx: DeviceCtx<'_, D>, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if inputs.len() != self.static_inputs.len() {
            return Err(RuntimeError::ArgumentCountMismatch {
                expected: self.static_inputs.len(),
                actual: inputs.len(),
            });
        }

        for (dst, src) in self.static_inputs.iter().zip(inputs) {
            ctx.copy_(dst, src)?;
        }
        ctx.device.replay(&self.graph, ctx.stream)?;

        if self.copy_outputs {
            self.static_outputs
                .iter()
                .map(|x| ctx.clone_tensor(x))
                .collect()
        } else {
            Ok(self.static_outputs.clone())
        }
    }

    /// Buffers the graph reads its inputs from.
    pub fn static_inputs(&self) -> &[Tensor] {
        &self.static_inputs
    }

    /// Buffers the graph writes its outputs to.
    pub fn static_outputs(&self) -> &[Tensor] {
        &self.static_outputs
    }

    pub fn num_inputs(&self) -> usize {
        self.static_inputs.len()
    }

    pub fn copy_outputs(&self) -> bool {
        self.copy_outputs
    }

    /// Memory pool the graph was captured into.
    pub fn pool(&self) -> MemPoolId {
        self.pool
    }

    /// The captured device graph.
    pub fn graph(&self) -> &D::Graph {
        &self.graph
    }
}
