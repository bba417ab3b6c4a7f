//! Statement cleanup: the structural rewrites every later pass relies on.
//!
//! - a statement sequence directly inside another sequence is spliced into it
//! - an expression statement whose expression is a constant becomes `pass`
//! - statements after a `return`, `raise`, `break` or `continue` in the same
//!   sequence are dropped
//!
//! Each rewrite restarts the walk; a converged tree has no nested sequences,
//! no constant expression statements, and no unreachable sequence tails.

use super::fixpoint::{run_to_fixpoint, FixpointReport, TreeVisitor, VisitOutcome};
use crate::CompileError;
use kestrel_core::{NodeId, NodeKind, Program};
use tracing::trace;

#[derive(Debug, Default)]
pub struct Cleanup {
    pub flattened: usize,
    pub constants_dropped: usize,
    pub dead_statements: usize,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TreeVisitor for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn visit(&mut self, program: &mut Program, node: NodeId) -> Result<VisitOutcome, CompileError> {
        match program.tree.kind(node) {
            NodeKind::StatementsSequence { statements } => {
                let statements = statements.clone();
                let parent_is_sequence = program
                    .tree
                    .parent(node)
                    .is_some_and(|p| matches!(program.tree.kind(p), NodeKind::StatementsSequence { .. }));
                if parent_is_sequence {
                    flatten_into_parent(program, node)?;
                    self.flattened += 1;
                    return Ok(VisitOutcome::Restart);
                }
                let dead_from = statements
                    .iter()
                    .position(|s| program.tree.tag(*s).aborts_control_flow())
                    .map(|i| i + 1)
                    .filter(|start| *start < statements.len());
                if let Some(start) = dead_from {
                    let dead = statements[start..].to_vec();
                    for statement in &dead {
                        program.tree.detach(*statement)?;
                    }
                    self.dead_statements += dead.len();
                    trace!("dropped {} unreachable statement(s) in {}", dead.len(), node);
                    return Ok(VisitOutcome::Restart);
                }
            }
            NodeKind::Expression { expression } => {
                let expression = *expression;
                if matches!(program.tree.kind(expression), NodeKind::Constant { .. }) {
                    let pass = program
                        .tree
                        .alloc(NodeKind::Pass, program.tree.source(node).clone());
                    program.tree.replace_with(node, pass)?;
                    self.constants_dropped += 1;
                    return Ok(VisitOutcome::Restart);
                }
            }
            _ => {}
        }
        Ok(VisitOutcome::Continue)
    }
}

/// Replace the sequence around `inner` by one whose statements have
/// `inner`'s statements spliced in at its position.
fn flatten_into_parent(program: &mut Program, inner: NodeId) -> Result<(), CompileError> {
    let Some(outer) = program.tree.parent(inner) else {
        return Err(CompileError::internal(program, inner, "nested sequence without a parent"));
    };
    let outer_statements = sequence_statements(program, outer)?;
    let inner_statements = sequence_statements(program, inner)?;

    let tree = &mut program.tree;
    for statement in outer_statements.iter().chain(inner_statements.iter()) {
        tree.detach(*statement)?;
    }
    let merged: Vec<NodeId> = outer_statements
        .iter()
        .flat_map(|s| {
            if *s == inner {
                inner_statements.clone()
            } else {
                vec![*s]
            }
        })
        .collect();
    let source = tree.source(outer).clone();
    let replacement = tree.alloc(NodeKind::StatementsSequence { statements: merged }, source);
    tree.replace_with(outer, replacement)?;
    Ok(())
}

fn sequence_statements(program: &Program, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
    match program.tree.kind(id) {
        NodeKind::StatementsSequence { statements } => Ok(statements.clone()),
        other => Err(CompileError::internal(
            program,
            id,
            format!("expected a statement sequence, found {}", other.tag().name()),
        )),
    }
}

/// Run the cleanup rewrites to a fixed point.
pub fn cleanup(program: &mut Program, max_restarts: usize) -> Result<FixpointReport, CompileError> {
    let mut visitor = Cleanup::new();
    let report = run_to_fixpoint(program, &mut visitor, max_restarts)?;
    trace!(
        "cleanup: {} flattened, {} constant statements dropped, {} dead statements",
        visitor.flattened,
        visitor.constants_dropped,
        visitor.dead_statements
    );
    Ok(report)
}
