//! The tensor runtime boundary.
//!
//! Everything ember needs from a GPU runtime goes through the `Device` trait:
//! memory, streams, kernel launches and graph capture. All methods take
//! `&self`; implementations synchronize internally.

use crate::error::Result;
use crate::kernel::Kernel;
use crate::tensor::{HostTensor, Tensor};
use ember_core::DataType;
use std::fmt;

/// An ordered queue of device work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Device address of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Memory pool used by graph captures.
///
/// Several captures may share one pool. The handle is owned by the caller and
/// passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemPoolId(pub u64);

/// A tensor runtime.
pub trait Device: Send + Sync {
    /// A recorded, replayable sequence of device work.
    type Graph: Send + Sync;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// The stream work goes to when no other stream is chosen.
    fn default_stream(&self) -> StreamId;

    /// Create a new stream.
    fn create_stream(&self) -> Result<StreamId>;

    /// Create a fresh memory pool handle for graph captures.
    fn graph_pool_handle(&self) -> MemPoolId;

    /// Allocate an uninitialized tensor.
    ///
    /// Allocations made while `stream` is capturing come from the capture's pool.
    fn allocate(&self, stream: StreamId, shape: &[usize], dtype: DataType) -> Result<Tensor>;

    /// Copy host data into a new device tensor.
    fn upload(&self, stream: StreamId, host: &HostTensor) -> Result<Tensor>;

    /// Copy a device tensor back to host memory. Blocks until the data is ready.
    fn download(&self, tensor: &Tensor) -> Result<HostTensor>;

    /// Enqueue `kernel` on `stream`, reading `inputs` and writing `output`.
    fn launch(&self, stream: StreamId, kernel: Kernel, inputs: &[Tensor], output: &Tensor)
    -> Result<()>;

    /// Block the host until all work on all streams has completed.
    fn synchronize(&self) -> Result<()>;

    /// Block the host until all work on `stream` has completed.
    fn stream_synchronize(&self, stream: StreamId) -> Result<()>;

    /// Make future work on `waiter` run after work already enqueued on
    /// `waitee`. Does not block the host.
    fn wait_stream(&self, waiter: StreamId, waitee: StreamId) -> Result<()>;

    /// Start recording work launched on `stream` instead of executing it.
    fn begin_capture(&self, stream: StreamId, pool: MemPoolId) -> Result<()>;

    /// Stop recording on `stream` and return the recorded graph.
    fn end_capture(&self, stream: StreamId) -> Result<Self::Graph>;

    /// Re-issue the work recorded in `graph` on `stream`, against the same
    /// buffers it was recorded with.
    fn replay(&self, graph: &Self::Graph, stream: StreamId) -> Result<()>;
}
