//! Graph pass trait and stage definitions.

use crate::Result;
use crate::ir::IrGraph;

/// Stage a pass belongs to.
///
/// Passes are grouped into stages and run in a fixed order. Within each stage,
/// passes run in the order they were registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Sub-graph substitution (e.g. replacing a multi-operator attention
    /// computation with a single fused operator).
    Fusion,

    /// Tidy-up after rewriting (dead code elimination).
    Cleanup,
}

/// Trait for implementing graph passes.
///
/// A pass is an in-place graph transformation. `run()` returns `Ok(true)` if
/// the pass changed the graph and `Ok(false)` otherwise; a pass that finds
/// nothing to do is not an error.
///
/// # Example
///
/// ```ignore
/// struct NoOpPass;
///
/// impl Pass for NoOpPass {
///     fn name(&self) -> &str {
///         "noop"
///     }
///
///     fn stage(&self) -> Stage {
///         Stage::Cleanup
///     }
///
///     fn run(&self, graph: &mut IrGraph) -> Result<bool> {
///         Ok(false)
///     }
/// }
/// ```
pub trait Pass: Send + Sync {
    /// Get the pass name (used for logging and reporting).
    fn name(&self) -> &str;

    /// Get the stage this pass belongs to.
    fn stage(&self) -> Stage;

    /// Run the pass on the given graph.
    fn run(&self, graph: &mut IrGraph) -> Result<bool>;
}
