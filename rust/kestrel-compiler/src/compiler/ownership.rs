//! Ownership plan for code generation.
//!
//! Each expression is consumed by the slot it fills: stored into a variable
//! or a container (export), used as an operand for the duration of its
//! statement (temporary), or discarded (drop). The plan is then lowered per
//! statement through [`EmitContext`], which checks that every owned reference
//! produced in the scope is disposed of exactly once.

use super::identifiers::{
    ConsumedProxyIdentifier, EmitContext, Identifier, OwnershipOp, ValueHandle,
};
use crate::CompileError;
use kestrel_core::{NodeId, NodeKind, Program};
use serde::Serialize;
use std::collections::BTreeMap;
use strum_macros::Display;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum Consumption {
    /// The consumer takes over a reference.
    Export,
    /// Used while the statement runs; released at its end.
    Temporary,
    /// Evaluated for effect only.
    Drop,
    /// Stored without a reference: the target never releases it.
    Read,
}

/// How the parent of `expression` consumes it, if it is an expression slot.
pub fn consumption_for(program: &Program, expression: NodeId) -> Option<Consumption> {
    let parent = program.tree.parent(expression)?;
    let consumption = match program.tree.kind(parent) {
        NodeKind::AssignVariable { variable, .. } => {
            if program.variables.annotations(*variable).needs_free == Some(false) {
                Consumption::Read
            } else {
                Consumption::Export
            }
        }
        NodeKind::Return { .. } | NodeKind::Raise { .. } => Consumption::Export,
        NodeKind::MakeList { .. } | NodeKind::MakeTuple { .. } => Consumption::Export,
        NodeKind::Expression { .. } => Consumption::Drop,
        NodeKind::If { condition, .. } if *condition == expression => Consumption::Temporary,
        NodeKind::Call { .. }
        | NodeKind::AttributeLookup { .. }
        | NodeKind::SpecialAttributeLookup { .. }
        | NodeKind::BinaryOp { .. } => Consumption::Temporary,
        NodeKind::Contraction { iterated, .. } if *iterated == expression => Consumption::Temporary,
        _ => return None,
    };
    Some(consumption)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeOwnership {
    pub scope: NodeId,
    pub consumptions: BTreeMap<NodeId, Consumption>,
    pub ops: Vec<OwnershipOp>,
}

/// Plan and lower the expressions evaluated by `scope`.
pub fn resolve_scope(program: &Program, scope: NodeId) -> Result<ScopeOwnership, CompileError> {
    let consumptions: BTreeMap<NodeId, Consumption> = program
        .tree
        .scope_preorder(scope)
        .into_iter()
        .filter(|id| program.tree.tag(*id).is_expression())
        .filter_map(|id| consumption_for(program, id).map(|c| (id, c)))
        .collect();

    let mut lowering = Lowering {
        program,
        consumptions: &consumptions,
        ctx: EmitContext::new(),
    };
    if let Some(body) = program.tree.kind(scope).scope_body() {
        lowering.statement(body)?;
    }
    let Lowering { ctx, .. } = lowering;
    let obligations = ctx.obligations();
    let ops = ctx.finish()?;
    debug!(
        "ownership for {}: {} expression(s), {} owned reference(s)",
        program.describe(scope),
        consumptions.len(),
        obligations
    );
    Ok(ScopeOwnership {
        scope,
        consumptions,
        ops,
    })
}

struct Lowering<'a> {
    program: &'a Program,
    consumptions: &'a BTreeMap<NodeId, Consumption>,
    ctx: EmitContext,
}

impl Lowering<'_> {
    fn statement(&mut self, id: NodeId) -> Result<(), CompileError> {
        let program = self.program;
        match program.tree.kind(id) {
            NodeKind::StatementsSequence { statements } => {
                for statement in statements {
                    self.statement(*statement)?;
                }
            }
            NodeKind::AssignVariable { source: value, .. }
            | NodeKind::Expression { expression: value }
            | NodeKind::Return { expression: value }
            | NodeKind::Raise { exception: value } => self.guarded(*value)?,
            NodeKind::If {
                condition,
                yes_branch,
                no_branch,
            } => {
                self.guarded(*condition)?;
                for branch in yes_branch.iter().chain(no_branch) {
                    self.statement(*branch)?;
                }
            }
            NodeKind::Loop { body } => {
                if let Some(body) = body {
                    self.statement(*body)?;
                }
            }
            NodeKind::Try { tried, handler } => {
                self.statement(*tried)?;
                if let Some(handler) = handler {
                    self.statement(*handler)?;
                }
            }
            NodeKind::DelVariable { .. }
            | NodeKind::ReleaseVariable { .. }
            | NodeKind::Pass
            | NodeKind::Break
            | NodeKind::Continue => {}
            other => {
                return Err(CompileError::internal(
                    program,
                    id,
                    format!("expected a statement, found {}", other.tag().name()),
                ))
            }
        }
        Ok(())
    }

    /// Lower one statement-level expression inside its own guard scope.
    fn guarded(&mut self, expression: NodeId) -> Result<(), CompileError> {
        self.ctx.enter_guard_scope();
        self.consume(expression)?;
        self.ctx.exit_guard_scope()?;
        Ok(())
    }

    fn consume(&mut self, expression: NodeId) -> Result<String, CompileError> {
        let mut value = self.value(expression)?;
        self.apply(expression, &mut value)
    }

    fn apply(&mut self, expression: NodeId, handle: &mut dyn ValueHandle) -> Result<String, CompileError> {
        let Some(consumption) = self.consumptions.get(&expression) else {
            return Err(CompileError::internal(
                self.program,
                expression,
                "no consumption planned for expression",
            ));
        };
        let code = match consumption {
            Consumption::Export => handle.export(&mut self.ctx),
            Consumption::Temporary => handle.temporary(&mut self.ctx),
            Consumption::Drop => {
                handle.drop_value(&mut self.ctx);
                handle.code().to_string()
            }
            Consumption::Read => {
                self.ctx.read(handle.code());
                handle.code().to_string()
            }
        };
        Ok(code)
    }

    fn list(&mut self, elements: &[NodeId]) -> Result<String, CompileError> {
        let mut codes = Vec::with_capacity(elements.len());
        for element in elements {
            codes.push(self.consume(*element)?);
        }
        Ok(codes.join(", "))
    }

    /// Lower the operands of `expression` and name its value.
    fn value(&mut self, expression: NodeId) -> Result<Identifier, CompileError> {
        let program = self.program;
        let value = match program.tree.kind(expression) {
            NodeKind::VariableRef { variable } => {
                Identifier::borrowed(format!("var_{}", program.variables.name(*variable)))
            }
            NodeKind::Constant { value } => Identifier::borrowed(format!("const({})", value)),
            NodeKind::ImportModule { module } => {
                Identifier::owned(format!("import({})", module), &mut self.ctx)
            }
            NodeKind::Call { called, args } => {
                let callee = match program.tree.kind(*called) {
                    NodeKind::AttributeLookup { source, attribute } => {
                        self.method(*called, *source, attribute)?
                    }
                    _ => self.consume(*called)?,
                };
                let args = self.list(args)?;
                Identifier::owned(format!("call({}, [{}])", callee, args), &mut self.ctx)
            }
            NodeKind::AttributeLookup { source, attribute } => {
                let object = self.consume(*source)?;
                Identifier::owned(format!("getattr({}, {})", object, attribute), &mut self.ctx)
            }
            NodeKind::SpecialAttributeLookup { source, attribute } => {
                let object = self.consume(*source)?;
                Identifier::owned(format!("special({}, {})", object, attribute), &mut self.ctx)
            }
            NodeKind::BinaryOp { op, left, right } => {
                let left = self.consume(*left)?;
                let right = self.consume(*right)?;
                Identifier::owned(format!("binop({} {} {})", left, op, right), &mut self.ctx)
            }
            NodeKind::MakeList { elements } => {
                let elements = self.list(elements)?;
                Identifier::owned(format!("list([{}])", elements), &mut self.ctx)
            }
            NodeKind::MakeTuple { elements } => {
                let elements = self.list(elements)?;
                Identifier::owned(format!("tuple([{}])", elements), &mut self.ctx)
            }
            NodeKind::FunctionCreation { function } => {
                let name = scope_name(program, *function);
                Identifier::owned(format!("function({})", name), &mut self.ctx)
            }
            NodeKind::ClassCreation { class } => {
                let name = scope_name(program, *class);
                Identifier::owned(format!("class({})", name), &mut self.ctx)
            }
            NodeKind::Contraction { kind, iterated, .. } => {
                let iterated = self.consume(*iterated)?;
                Identifier::owned(format!("{}comp({})", kind, iterated), &mut self.ctx)
            }
            other => {
                return Err(CompileError::internal(
                    program,
                    expression,
                    format!("expected an expression, found {}", other.tag().name()),
                ))
            }
        };
        Ok(value)
    }

    /// `obj.name(...)`: the object is needed twice, for the lookup and as
    /// the bound argument, so it goes through a proxy and only the lookup
    /// consumes its reference.
    fn method(&mut self, lookup: NodeId, source: NodeId, attribute: &str) -> Result<String, CompileError> {
        let object = self.value(source)?;
        let mut proxy = ConsumedProxyIdentifier::new(object);
        let object_code = self.apply(source, &mut proxy)?;
        let self_code = proxy.temporary(&mut self.ctx);
        let mut bound = Identifier::owned(
            format!("getmethod({}, {}, self={})", object_code, attribute, self_code),
            &mut self.ctx,
        );
        self.apply(lookup, &mut bound)
    }
}

fn scope_name(program: &Program, scope: NodeId) -> String {
    match program.tree.kind(scope) {
        NodeKind::Function { name, .. } | NodeKind::Class { name, .. } => name.clone(),
        other => other.tag().name().to_string(),
    }
}
