//! Restartable tree walks.
//!
//! A rewriting visitor that changes the tree cannot trust the walk it is in:
//! the node list it iterates may name detached nodes or miss new ones. So a
//! visitor that mutates returns [`VisitOutcome::Restart`], the walk is
//! abandoned, and a fresh walk starts from the root. Walks repeat until one
//! completes without a restart, or the restart cap is hit.

use crate::CompileError;
use kestrel_core::{NodeId, Program};
use tracing::{debug, trace};

pub const DEFAULT_MAX_RESTARTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    Continue,
    /// The tree changed; abandon this walk and start over.
    Restart,
}

pub trait TreeVisitor {
    /// Name used in logs and in the non-convergence error.
    fn name(&self) -> &'static str;

    fn visit(&mut self, program: &mut Program, node: NodeId) -> Result<VisitOutcome, CompileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixpointReport {
    /// Walks abandoned because of a mutation.
    pub restarts: usize,
    /// Walks started, including the final clean one.
    pub walks: usize,
}

/// One pre-order walk. Nodes detached by an earlier visit in the same walk
/// cannot occur: any mutation ends the walk.
pub fn walk_once<V: TreeVisitor + ?Sized>(
    program: &mut Program,
    visitor: &mut V,
) -> Result<VisitOutcome, CompileError> {
    for node in program.tree.preorder() {
        if visitor.visit(program, node)? == VisitOutcome::Restart {
            return Ok(VisitOutcome::Restart);
        }
    }
    Ok(VisitOutcome::Continue)
}

/// Walk until a walk finishes without restarting.
///
/// Fails with an internal error once `max_restarts` walks have been
/// abandoned; a pass that keeps rewriting never converges.
pub fn run_to_fixpoint<V: TreeVisitor + ?Sized>(
    program: &mut Program,
    visitor: &mut V,
    max_restarts: usize,
) -> Result<FixpointReport, CompileError> {
    let mut report = FixpointReport::default();
    loop {
        report.walks += 1;
        match walk_once(program, visitor)? {
            VisitOutcome::Continue => {
                debug!(
                    "pass '{}' converged after {} restart(s)",
                    visitor.name(),
                    report.restarts
                );
                return Ok(report);
            }
            VisitOutcome::Restart => {
                report.restarts += 1;
                trace!("pass '{}' restarting (#{})", visitor.name(), report.restarts);
                if report.restarts >= max_restarts {
                    let root = program.tree.root();
                    return Err(CompileError::internal(
                        program,
                        root,
                        format!(
                            "pass '{}' did not converge after {} restarts",
                            visitor.name(),
                            report.restarts
                        ),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{NodeKind, ProgramBuilder};

    /// Replaces one `pass` statement by an expression statement per walk.
    struct ReplacePasses {
        budget: usize,
    }

    impl TreeVisitor for ReplacePasses {
        fn name(&self) -> &'static str {
            "replace-passes"
        }

        fn visit(&mut self, program: &mut Program, node: NodeId) -> Result<VisitOutcome, CompileError> {
            if !matches!(program.tree.kind(node), NodeKind::Pass) || self.budget == 0 {
                return Ok(VisitOutcome::Continue);
            }
            self.budget -= 1;
            let source = program.tree.source(node).clone();
            let value = program.tree.alloc(
                NodeKind::Constant {
                    value: kestrel_core::Constant::None,
                },
                source.clone(),
            );
            let stmt = program
                .tree
                .alloc(NodeKind::Expression { expression: value }, source);
            program.tree.replace_with(node, stmt)?;
            Ok(VisitOutcome::Restart)
        }
    }

    /// Asks for a restart on every visit of the root.
    struct NeverSettles;

    impl TreeVisitor for NeverSettles {
        fn name(&self) -> &'static str {
            "never-settles"
        }

        fn visit(&mut self, program: &mut Program, node: NodeId) -> Result<VisitOutcome, CompileError> {
            if node == program.tree.root() {
                Ok(VisitOutcome::Restart)
            } else {
                Ok(VisitOutcome::Continue)
            }
        }
    }

    fn three_passes() -> Program {
        let mut b = ProgramBuilder::new("m", "m.py");
        let stmts = vec![b.pass(), b.pass(), b.pass()];
        b.finish(stmts).unwrap()
    }

    #[test]
    fn restarts_once_per_mutation() {
        let mut program = three_passes();
        let mut visitor = ReplacePasses { budget: 10 };
        let report = run_to_fixpoint(&mut program, &mut visitor, 100).unwrap();
        assert_eq!(report.restarts, 3);
        assert_eq!(report.walks, 4);
        program.tree.verify().unwrap();
    }

    #[test]
    fn cap_turns_into_internal_error() {
        let mut program = three_passes();
        let err = run_to_fixpoint(&mut program, &mut NeverSettles, 5).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("never-settles"));
    }
}
