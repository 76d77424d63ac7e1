//! Fusion pipeline with pluggable passes.

use crate::attention::AttentionPattern;
use crate::passes::{AttentionFusionPass, DeadCodeEliminationPass};
use ember_core::{IrGraph, Pass, Result, Stage, op};

/// Options for the built-in passes.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOptions {
    /// Passed through to every fused attention node.
    pub is_causal: bool,

    /// Patterns to fuse, in order. Empty disables attention fusion.
    pub patterns: Vec<AttentionPattern>,

    /// Remove nodes that no longer reach a graph output.
    pub eliminate_dead_code: bool,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            is_causal: false,
            patterns: AttentionPattern::ALL.to_vec(),
            eliminate_dead_code: true,
        }
    }
}

impl FusionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<AttentionPattern>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_dead_code_elimination(mut self, enabled: bool) -> Self {
        self.eliminate_dead_code = enabled;
        self
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub name: String,
    pub stage: Stage,
    pub changed: bool,
}

/// What a pipeline run did to a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Passes in the order they ran.
    pub passes: Vec<PassRecord>,

    pub nodes_before: usize,
    pub nodes_after: usize,

    /// Fused attention nodes added by the run.
    pub fused_attention: usize,
}

impl PipelineReport {
    /// Whether any pass changed the graph.
    pub fn changed(&self) -> bool {
        self.passes.iter().any(|pass| pass.changed)
    }
}

/// Graph rewriting pipeline.
///
/// Passes run grouped by stage (Fusion, then Cleanup). Within a stage, passes
/// run in the order they were registered.
///
/// # Example
///
/// ```
/// use ember_core::{DataType, GraphBuilder, TensorShape};
/// use ember_fusion::{FusionOptions, FusionPipeline};
///
/// # fn main() -> ember_core::Result<()> {
/// let mut b = GraphBuilder::new();
/// let [q, k, mask, v] =
///     ["q", "k", "mask", "v"].map(|name| b.input(name, DataType::F32, TensorShape::Unknown));
/// let kt = b.transpose(k, -1, -2)?;
/// let scores = b.matmul(q, kt)?;
/// let scores = b.div_scalar(scores, 8.0)?;
/// let scores = b.add(scores, mask)?;
/// let probs = b.softmax(scores, -1)?;
/// let out = b.matmul(probs, v)?;
/// let mut graph = b.finish(&[out])?;
///
/// let report = FusionPipeline::new(FusionOptions::default()).run(&mut graph)?;
/// assert_eq!(report.fused_attention, 1);
/// assert_eq!(report.nodes_after, 2);
/// # Ok(())
/// # }
/// ```
pub struct FusionPipeline {
    /// All passes to run, ordered by (stage, registration order) at run time.
    passes: Vec<Box<dyn Pass>>,
}

impl FusionPipeline {
    /// Create a pipeline with the built-in passes selected by `options`:
    /// - `AttentionFusionPass` (Fusion stage) unless `patterns` is empty
    /// - `DeadCodeEliminationPass` (Cleanup stage) if `eliminate_dead_code`
    pub fn new(options: FusionOptions) -> Self {
        let mut pipeline = Self::empty();
        if !options.patterns.is_empty() {
            pipeline.add_pass(AttentionFusionPass::with_patterns(
                options.patterns,
                options.is_causal,
            ));
        }
        if options.eliminate_dead_code {
            pipeline.add_pass(DeadCodeEliminationPass::new());
        }
        pipeline
    }

    /// A pipeline with no passes.
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    /// Add a custom pass; it runs within its own stage after the passes
    /// already registered there.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Names of the registered passes, in the order they will run.
    pub fn pass_names(&self) -> Vec<&str> {
        let mut passes: Vec<&dyn Pass> = self.passes.iter().map(|p| p.as_ref()).collect();
        passes.sort_by_key(|p| p.stage());
        passes.into_iter().map(|p| p.name()).collect()
    }

    /// Run every pass on `graph` in place.
    ///
    /// # Errors
    ///
    /// Stops at the first failing pass. Passes that already ran keep their
    /// changes.
    #[tracing::instrument(skip_all, fields(nodes = graph.node_count(), passes = self.passes.len()))]
    pub fn run(&mut self, graph: &mut IrGraph) -> Result<PipelineReport> {
        let nodes_before = graph.node_count();
        let fused_before = graph.nodes_with_op(op::FUSED_ATTENTION).len();

        // Stable: registration order is kept within a stage.
        self.passes.sort_by_key(|p| p.stage());

        let mut records = Vec::with_capacity(self.passes.len());
        for pass in &self.passes {
            let _span =
                tracing::debug_span!("pass", name = pass.name(), stage = ?pass.stage()).entered();
            let changed = pass.run(graph)?;
            tracing::debug!(changed, nodes = graph.node_count(), "pass finished");
            records.push(PassRecord {
                name: pass.name().to_string(),
                stage: pass.stage(),
                changed,
            });
        }

        Ok(PipelineReport {
            passes: records,
            nodes_before,
            nodes_after: graph.node_count(),
            fused_attention: graph
                .nodes_with_op(op::FUSED_ATTENTION)
                .len()
                .saturating_sub(fused_before),
        })
    }
}

impl Default for FusionPipeline {
    fn default() -> Self {
        Self::new(FusionOptions::default())
    }
}

/// Run the default pipeline for `options` on `graph`.
pub fn fuse_graph(graph: &mut IrGraph, options: FusionOptions) -> Result<PipelineReport> {
    FusionPipeline::new(options).run(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingPass {
        name: &'static str,
        stage: Stage,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Pass for RecordingPass {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> Stage {
            self.stage
        }

        fn run(&self, _graph: &mut IrGraph) -> Result<bool> {
            self.log.lock().unwrap().push(self.name);
            Ok(false)
        }
    }

    #[test]
    fn test_builtin_passes() {
        let pipeline = FusionPipeline::default();
        assert_eq!(
            pipeline.pass_names(),
            vec!["attention_fusion", "dead_code_elimination"]
        );

        let bare = FusionPipeline::new(
            FusionOptions::new()
                .with_patterns(Vec::new())
                .with_dead_code_elimination(false),
        );
        assert!(bare.pass_names().is_empty());
    }

    #[test]
    fn test_passes_run_by_stage_then_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pass = |name, stage| RecordingPass {
            name,
            stage,
            log: Arc::clone(&log),
        };

        let mut pipeline = FusionPipeline::empty();
        pipeline
            .add_pass(pass("cleanup_a", Stage::Cleanup))
            .add_pass(pass("fusion_a", Stage::Fusion))
            .add_pass(pass("cleanup_b", Stage::Cleanup))
            .add_pass(pass("fusion_b", Stage::Fusion));

        let report = pipeline.run(&mut IrGraph::new()).unwrap();

        let order = vec!["fusion_a", "fusion_b", "cleanup_a", "cleanup_b"];
        assert_eq!(*log.lock().unwrap(), order);
        let names: Vec<&str> = report.passes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, order);
        assert!(!report.changed());
        assert_eq!(report.fused_attention, 0);
    }
}
