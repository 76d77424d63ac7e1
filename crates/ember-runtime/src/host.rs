//! In-process reference device.
//!
//! `HostDevice` keeps device memory in host RAM and runs kernels on the CPU,
//! but enforces the same rules a GPU runtime with graph capture does:
//!
//! - kernels are compiled lazily, once per `(kernel, dtype)`, on first launch,
//!   and compiling while a stream is capturing is an error
//! - host synchronization and downloads are errors while a capture is active
//! - while capturing, launches are recorded (with the buffers they touch)
//!   instead of executed, and replay re-runs them against those same buffers
//!
//! Streams execute in order as work is enqueued, so cross-stream waits are
//! satisfied trivially; they are still validated and counted.

use crate::device::{BufferId, Device, MemPoolId, StreamId};
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::tensor::{Buffer, HostTensor, Tensor};
use ember_core::DataType;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Counters for work the device has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Buffers allocated (including uploads).
    pub allocations: usize,

    /// Kernels executed eagerly.
    pub launches: usize,

    /// Kernels recorded into a capture.
    pub recorded: usize,

    /// Distinct `(kernel, dtype)` pairs compiled.
    pub compilations: usize,

    /// Full-device synchronizations.
    pub synchronizations: usize,

    /// Cross-stream waits.
    pub stream_waits: usize,

    /// Captures completed.
    pub captures: usize,

    /// Graph replays.
    pub replays: usize,
}

#[derive(Debug, Clone)]
struct Command {
    kernel: Kernel,
    inputs: Vec<Tensor>,
    output: Tensor,
}

impl Command {
    fn run(&self) -> Result<()> {
        self.kernel.execute(&self.inputs, &self.output)
    }
}

/// A graph recorded by `HostDevice`.
///
/// Holds the buffers it was recorded with, so they stay alive (and keep their
/// addresses) for as long as the graph does.
#[derive(Debug)]
pub struct HostGraph {
    pool: MemPoolId,
    commands: Vec<Command>,
}

impl HostGraph {
    /// Pool the graph's allocations were made from.
    pub fn pool(&self) -> MemPoolId {
        self.pool
    }

    /// Number of recorded kernel launches.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Names of the recorded kernels, in launch order.
    pub fn kernel_names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|c| c.kernel.name()).collect()
    }
}

struct ActiveCapture {
    stream: StreamId,
    pool: MemPoolId,
    commands: Vec<Command>,
    /// Set when an illegal operation happened during the capture.
    invalidated: Option<String>,
}

struct HostState {
    streams: BTreeSet<StreamId>,
    next_stream: u32,
    next_buffer: u64,
    next_pool: u64,
    compiled: HashSet<(&'static str, DataType)>,
    capture: Option<ActiveCapture>,
    stats: DeviceStats,
}

/// Reference `Device` backed by host memory.
pub struct HostDevice {
    state: Mutex<HostState>,
}

const DEFAULT_STREAM: StreamId = StreamId(0);

impl HostDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                streams: BTreeSet::from([DEFAULT_STREAM]),
                next_stream: 1,
                next_buffer: 0x1000,
                next_pool: 1,
                compiled: HashSet::new(),
                capture: None,
                stats: DeviceStats::default(),
            }),
        }
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> DeviceStats {
        match self.state() {
            Ok(state) => state.stats,
            Err(_) => DeviceStats::default(),
        }
    }

    /// Whether any stream is currently capturing.
    pub fn is_capturing(&self) -> bool {
        self.state().is_ok_and(|state| state.capture.is_some())
    }

    fn state(&self) -> Result<MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::Execution("host device state is poisoned".to_string()))
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostState {
    fn check_stream(&self, stream: StreamId) -> Result<()> {
        if self.streams.contains(&stream) {
            Ok(())
        } else {
            Err(RuntimeError::Execution(format!("unknown stream {stream:?}")))
        }
    }

    fn capturing_on(&self, stream: StreamId) -> bool {
        self.capture.as_ref().is_some_and(|c| c.stream == stream)
    }

    /// Reject an operation that cannot happen during capture, and poison the
    /// capture so it can't be turned into a graph.
    fn forbid_during_capture(&mut self, what: &str) -> Result<()> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(());
        };
        let message = format!("{what} is not permitted while stream {:?} is capturing", capture.stream);
        warn!(%message, "capture invalidated");
        capture.invalidated.get_or_insert_with(|| message.clone());
        Err(RuntimeError::Capture(message))
    }

    fn new_buffer(&mut self, stream: StreamId, bytes: Vec<u8>) -> Arc<Buffer> {
        let id = BufferId(self.next_buffer);
        // Keep addresses aligned and distinct.
        self.next_buffer += (bytes.len() as u64).max(1).next_multiple_of(256);
        let pool = self
            .capture
            .as_ref()
            .filter(|c| c.stream == stream)
            .map(|c| c.pool);
        self.stats.allocations += 1;
        Arc::new(Buffer::new(id, pool, bytes))
    }
}

impl Device for HostDevice {
    type Graph = HostGraph;

    fn name(&self) -> &str {
        "host"
    }

    fn default_stream(&self) -> StreamId {
        DEFAULT_STREAM
    }

    fn create_stream(&self) -> Result<StreamId> {
        let mut state = self.state()?;
        let stream = StreamId(state.next_stream);
        state.next_stream += 1;
        state.streams.insert(stream);
        debug!(?stream, "created stream");
        Ok(stream)
    }

    fn graph_pool_handle(&self) -> MemPoolId {
        match self.state() {
            Ok(mut state) => {
                let pool = MemPoolId(state.next_pool);
                state.next_pool += 1;
                pool
            }
            Err(_) => MemPoolId(0),
        }
    }

    fn allocate(&self, stream: StreamId, shape: &[usize], dtype: DataType) -> Result<Tensor> {
        let mut state = self.state()?;
        state.check_stream(stream)?;
        let len: usize = shape.iter().product();
        let bytes = len.checked_mul(dtype.size()).ok_or_else(|| {
            RuntimeError::Allocation(format!("{shape:?} x {dtype} overflows the address space"))
        })?;
        let buffer = state.new_buffer(stream, vec![0; bytes]);
        Ok(Tensor::new(buffer, shape.to_vec(), dtype))
    }

    fn upload(&self, stream: StreamId, host: &HostTensor) -> Result<Tensor> {
        let mut state = self.state()?;
        state.check_stream(stream)?;
        let buffer = state.new_buffer(stream, host.as_bytes().to_vec());
        Ok(Tensor::new(buffer, host.shape().to_vec(), host.dtype()))
    }

    fn download(&self, tensor: &Tensor) -> Result<HostTensor> {
        self.state()?.forbid_during_capture("download")?;
        Ok(HostTensor::from_raw(
            tensor.buffer().read_bytes()?,
            tensor.shape(),
            tensor.dtype(),
        ))
    }

    fn launch(
        &self,
        stream: StreamId,
        kernel: Kernel,
        inputs: &[Tensor],
        output: &Tensor,
    ) -> Result<()> {
        {
            let mut state = self.state()?;
            state.check_stream(stream)?;

            let key = (kernel.name(), output.dtype());
            if !state.compiled.contains(&key) {
                if state.capturing_on(stream) {
                    return state.forbid_during_capture(&format!(
                        "first launch (compilation) of kernel '{}' for {}",
                        key.0, key.1
                    ));
                }
                debug!(kernel = key.0, dtype = %key.1, "compiling kernel");
                state.compiled.insert(key);
                state.stats.compilations += 1;
            }

            if let Some(capture) = state.capture.as_mut().filter(|c| c.stream == stream) {
                capture.commands.push(Command {
                    kernel,
                    inputs: inputs.to_vec(),
                    output: output.clone(),
                });
                state.stats.recorded += 1;
                return Ok(());
            }
            state.stats.launches += 1;
        }

        kernel.execute(inputs, output)
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.state()?;
        state.forbid_during_capture("device synchronization")?;
        state.stats.synchronizations += 1;
        Ok(())
    }

    fn stream_synchronize(&self, stream: StreamId) -> Result<()> {
        let mut state = self.state()?;
        state.check_stream(stream)?;
        if state.capturing_on(stream) {
            return state.forbid_during_capture("stream synchronization");
        }
        Ok(())
    }

    fn wait_stream(&self, waiter: StreamId, waitee: StreamId) -> Result<()> {
        let mut state = self.state()?;
        state.check_stream(waiter)?;
        state.check_stream(waitee)?;
        state.stats.stream_waits += 1;
        Ok(())
    }

    fn begin_capture(&self, stream: StreamId, pool: MemPoolId) -> Result<()> {
        let mut state = self.state()?;
        state.check_stream(stream)?;
        if stream == DEFAULT_STREAM {
            return Err(RuntimeError::Capture(
                "cannot capture on the default stream".to_string(),
            ));
        }
        if let Some(active) = &state.capture {
            return Err(RuntimeError::Capture(format!(
                "stream {:?} is already capturing",
                active.stream
            )));
        }
        debug!(?stream, ?pool, "begin capture");
        state.capture = Some(ActiveCapture {
            stream,
            pool,
            commands: Vec::new(),
            invalidated: None,
        });
        Ok(())
    }

    fn end_capture(&self, stream: StreamId) -> Result<HostGraph> {
        let mut state = self.state()?;
        if !state.capturing_on(stream) {
            return Err(RuntimeError::Capture(format!(
                "stream {stream:?} is not capturing"
            )));
        }
        let Some(capture) = state.capture.take() else {
            return Err(RuntimeError::Capture(format!(
                "stream {stream:?} is not capturing"
            )));
        };
        if let Some(reason) = capture.invalidated {
            return Err(RuntimeError::Capture(format!(
                "capture was invalidated: {reason}"
            )));
        }
        state.stats.captures += 1;
        debug!(?stream, kernels = capture.commands.len(), "end capture");
        Ok(HostGraph {
            pool: capture.pool,
            commands: capture.commands,
        })
    }

    fn replay(&self, graph: &HostGraph, stream: StreamId) -> Result<()> {
        {
            let mut state = self.state()?;
            state.check_stream(stream)?;
            if state.capturing_on(stream) {
                return state.forbid_during_capture("graph replay");
            }
            state.stats.replays += 1;
        }
        for command in &graph.commands {
            command.run()?;
        }
        Ok(())
    }
}
