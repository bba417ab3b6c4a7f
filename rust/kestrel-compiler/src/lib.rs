//! Kestrel Compiler
//!
//! Middle-end passes over a [`kestrel_core::Program`]: tree cleanup to a fixed
//! point, attribute prediction, variable trace collection, storage and
//! lifetime finalization, and the ownership plan handed to code generation.

pub mod compiler;
pub mod diagnostics;

use compiler::attributes::{AttributePrediction, AttributeRegistry, RegistryError};
use compiler::finalize::LifetimeDecision;
use compiler::identifiers::OwnershipViolation;
use compiler::imports::ModuleFinder;
use compiler::knowledge::OptimizerKnowledge;
use compiler::ownership::ScopeOwnership;
use compiler::trace::TraceCollection;
use diagnostics::Diagnostic;
use kestrel_core::{IrError, NodeId, Program, SourceRef};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

pub use compiler::options::PipelineOptions;

#[derive(Debug, Error)]
pub enum CompileError {
    /// A pass met a state that its own invariants rule out. Always a compiler
    /// bug; carries the node and location being processed.
    #[error("internal compiler error at {location}: {message}")]
    Internal {
        message: String,
        node: Option<NodeId>,
        location: SourceRef,
    },
    #[error("IR error: {0}")]
    Ir(#[from] IrError),
    #[error("attribute registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("ownership ledger error: {0}")]
    Ownership(#[from] OwnershipViolation),
    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl CompileError {
    /// Internal error located at `node`.
    pub fn internal(program: &Program, node: NodeId, message: impl Into<String>) -> Self {
        CompileError::Internal {
            message: message.into(),
            node: Some(node),
            location: program.tree.source(node).clone(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal { .. })
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Everything code generation needs from the middle-end.
#[derive(Debug)]
pub struct AnalysisOutput {
    pub program: Program,
    pub is_main_module: bool,
    pub traces: TraceCollection,
    pub knowledge: OptimizerKnowledge,
    pub predictions: Vec<AttributePrediction>,
    pub lifetimes: Vec<LifetimeDecision>,
    pub ownership: BTreeMap<NodeId, ScopeOwnership>,
    pub diagnostics: Vec<Diagnostic>,
    /// Restarts spent by each cleanup run, in order.
    pub cleanup_restarts: Vec<usize>,
}

impl AnalysisOutput {
    /// Backend-facing summary: the option flags, every decision and the
    /// per-scope ownership plans.
    pub fn report_json(&self) -> serde_json::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "file": &*self.program.tree.source(self.program.tree.root()).file,
            "is_main_module": self.is_main_module,
            "cleanup_restarts": self.cleanup_restarts,
            "lifetimes": serde_json::to_value(&self.lifetimes)?,
            "predictions": serde_json::to_value(&self.predictions)?,
            "ownership": serde_json::to_value(self.ownership.values().collect::<Vec<_>>())?,
            "diagnostics": serde_json::to_value(&self.diagnostics)?,
        }))
    }
}

/// Run every middle-end pass over `program`, in pipeline order.
pub fn analyze(
    mut program: Program,
    registry: &AttributeRegistry,
    options: &PipelineOptions,
    finder: &dyn ModuleFinder,
) -> Result<AnalysisOutput, CompileError> {
    program.variables.reset_annotations();
    let mut cleanup_restarts = Vec::new();
    let mut diagnostics = Vec::new();

    let report = compiler::cleanup::cleanup(&mut program, options.max_restarts)?;
    cleanup_restarts.push(report.restarts);

    if options.follow_imports {
        diagnostics.extend(compiler::imports::check_imports(
            &program,
            finder,
            &options.expected_missing_modules,
        ));
    }

    let mut knowledge = OptimizerKnowledge::observe(&program);
    let predictions =
        compiler::attributes::predict_attributes(&mut program, registry, &mut knowledge)?;

    let report = compiler::cleanup::cleanup(&mut program, options.max_restarts)?;
    cleanup_restarts.push(report.restarts);

    let traces = compiler::trace::collect_program(&program)?;
    let lifetimes = compiler::finalize::finalize_lifetimes(&mut program, &traces)?;
    compiler::finalize::finalize_temp_variables(&mut program)?;

    let mut ownership = BTreeMap::new();
    for scope in program.tree.scopes() {
        ownership.insert(scope, compiler::ownership::resolve_scope(&program, scope)?);
    }

    debug!(
        "analysis finished: {} nodes, {} variables, {} traces, {} diagnostics",
        program.tree.len(),
        program.variables.len(),
        traces.len(),
        diagnostics.len()
    );

    Ok(AnalysisOutput {
        program,
        is_main_module: options.module_mode == compiler::options::ModuleMode::Main,
        traces,
        knowledge,
        predictions,
        lifetimes,
        ownership,
        diagnostics,
        cleanup_restarts,
    })
}
