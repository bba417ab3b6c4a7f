//! Construction API for the front-end.
//!
//! The parser drives a [`ProgramBuilder`]: it opens and closes scopes as it
//! meets functions, classes and comprehensions, asks for variables by name,
//! and allocates nodes bottom-up. Name resolution happens here, so closure
//! references are created while the scope stack is still known.

use crate::nodes::{BinaryOperator, Constant, ContractionKind, NodeId, NodeKind, NodeTag, VariableId};
use crate::source::SourceRef;
use crate::variables::VariableKind;
use crate::{IrError, Program};
use std::collections::BTreeSet;

pub struct ProgramBuilder {
    program: Program,
    scopes: Vec<NodeId>,
    source: SourceRef,
}

impl ProgramBuilder {
    pub fn new(module_name: &str, file: &str) -> Self {
        let program = Program::new(module_name, file);
        let root = program.tree.root();
        Self {
            program,
            scopes: vec![root],
            source: SourceRef::new(file, 1),
        }
    }

    /// Source line for the nodes allocated next.
    pub fn line(&mut self, line: usize) -> &mut Self {
        self.source = self.source.at_line(line);
        self
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn current_scope(&self) -> NodeId {
        self.scopes[self.scopes.len() - 1]
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.program.tree.alloc(kind, self.source.clone())
    }

    // ── Scopes ──────────────────────────────────────────────────

    pub fn enter_function(&mut self, name: &str) -> NodeId {
        let id = self.alloc(NodeKind::Function {
            name: name.to_string(),
            body: None,
            temp_variables: BTreeSet::new(),
        });
        self.scopes.push(id);
        id
    }

    pub fn enter_class(&mut self, name: &str) -> NodeId {
        let id = self.alloc(NodeKind::Class {
            name: name.to_string(),
            body: None,
            temp_variables: BTreeSet::new(),
        });
        self.scopes.push(id);
        id
    }

    /// Open a comprehension scope. `iterated` must have been built in the
    /// enclosing scope.
    pub fn enter_contraction(&mut self, kind: ContractionKind, iterated: NodeId) -> NodeId {
        let id = self.alloc(NodeKind::Contraction {
            kind,
            iterated,
            body: None,
            temp_variables: BTreeSet::new(),
        });
        self.scopes.push(id);
        id
    }

    /// Close the innermost scope with the given body and return its node.
    pub fn leave_scope(&mut self, body: Vec<NodeId>) -> Result<NodeId, IrError> {
        if self.scopes.len() <= 1 {
            return Err(IrError::UnbalancedScopes { open: 0 });
        }
        let scope = self.current_scope();
        let body = self.body_sequence(scope, body);
        self.program.tree.set_body(scope, body)?;
        self.scopes.pop();
        Ok(scope)
    }

    /// Attach the module body and hand the program over.
    pub fn finish(mut self, body: Vec<NodeId>) -> Result<Program, IrError> {
        if self.scopes.len() != 1 {
            return Err(IrError::UnbalancedScopes {
                open: self.scopes.len() - 1,
            });
        }
        let root = self.program.tree.root();
        let body = self.body_sequence(root, body);
        self.program.tree.set_body(root, body)?;
        Ok(self.program)
    }

    /// Scope bodies carry the location of the scope header.
    fn body_sequence(&mut self, scope: NodeId, statements: Vec<NodeId>) -> Option<NodeId> {
        if statements.is_empty() {
            return None;
        }
        let source = self.program.tree.source(scope).clone();
        Some(
            self.program
                .tree
                .alloc(NodeKind::StatementsSequence { statements }, source),
        )
    }

    // ── Variables ───────────────────────────────────────────────

    pub fn parameter(&mut self, name: &str) -> Result<VariableId, IrError> {
        let scope = self.current_scope();
        self.program
            .variables
            .create(scope, name, VariableKind::Parameter)
    }

    /// Destructuring parameter; its children become parameters of the same scope.
    pub fn nested_parameter(
        &mut self,
        name: &str,
        children: &[&str],
    ) -> Result<(VariableId, Vec<VariableId>), IrError> {
        let children = children
            .iter()
            .map(|child| self.parameter(child))
            .collect::<Result<Vec<_>, _>>()?;
        let scope = self.current_scope();
        let nested = self.program.variables.create(
            scope,
            name,
            VariableKind::NestedParameter {
                children: children.clone(),
            },
        )?;
        Ok((nested, children))
    }

    /// Assignment target `name` in the current scope. Module and class scopes
    /// get module and class variables.
    pub fn local(&mut self, name: &str) -> VariableId {
        let scope = self.current_scope();
        let kind = match self.program.tree.tag(scope) {
            NodeTag::Module => VariableKind::ModuleVar,
            NodeTag::Class => VariableKind::ClassVar,
            _ => VariableKind::Local,
        };
        self.program.variables.define(scope, name, kind)
    }

    pub fn loop_local(&mut self, name: &str) -> VariableId {
        let scope = self.current_scope();
        self.program
            .variables
            .define(scope, name, VariableKind::LocalLoop)
    }

    pub fn temp(&mut self, name: &str) -> VariableId {
        let scope = self.current_scope();
        self.program.variables.define(scope, name, VariableKind::Temp)
    }

    /// Resolve a read of `name`.
    ///
    /// Lookup order: the current scope, then enclosing function-like scopes
    /// (class bodies are invisible to nested code), then the module. A hit in
    /// an enclosing function creates one closure reference per scope crossed.
    /// Module-level names are globals and are returned as is.
    pub fn reference(&mut self, name: &str) -> VariableId {
        let current = self.current_scope();
        if let Some(found) = self.program.variables.lookup(current, name) {
            return found;
        }

        let depth = self.scopes.len() - 1;
        let mut hit = None;
        for level in (0..depth).rev() {
            let scope = self.scopes[level];
            match self.program.tree.tag(scope) {
                NodeTag::Class => continue,
                NodeTag::Module => break,
                _ => {}
            }
            if let Some(found) = self.program.variables.lookup(scope, name) {
                hit = Some((level, found));
                break;
            }
        }

        let Some((level, mut target)) = hit else {
            let root = self.program.tree.root();
            return self
                .program
                .variables
                .define(root, name, VariableKind::ModuleVar);
        };
        for inner in level + 1..=depth {
            let scope = self.scopes[inner];
            if inner != depth && self.program.tree.tag(scope) == NodeTag::Class {
                continue;
            }
            target = self
                .program
                .variables
                .define_closure_reference(scope, target);
        }
        target
    }

    // ── Statements ──────────────────────────────────────────────

    /// Sequence node for `statements`, or `None` when there are none.
    pub fn sequence(&mut self, statements: Vec<NodeId>) -> Option<NodeId> {
        if statements.is_empty() {
            None
        } else {
            Some(self.alloc(NodeKind::StatementsSequence { statements }))
        }
    }

    pub fn assign(&mut self, variable: VariableId, source: NodeId) -> NodeId {
        self.alloc(NodeKind::AssignVariable { variable, source })
    }

    pub fn del(&mut self, variable: VariableId) -> NodeId {
        self.alloc(NodeKind::DelVariable {
            variable,
            tolerant: false,
        })
    }

    pub fn del_tolerant(&mut self, variable: VariableId) -> NodeId {
        self.alloc(NodeKind::DelVariable {
            variable,
            tolerant: true,
        })
    }

    pub fn release(&mut self, variable: VariableId) -> NodeId {
        self.alloc(NodeKind::ReleaseVariable { variable })
    }

    pub fn expr_stmt(&mut self, expression: NodeId) -> NodeId {
        self.alloc(NodeKind::Expression { expression })
    }

    pub fn pass(&mut self) -> NodeId {
        self.alloc(NodeKind::Pass)
    }

    pub fn if_(&mut self, condition: NodeId, yes: Vec<NodeId>, no: Vec<NodeId>) -> NodeId {
        let yes_branch = self.sequence(yes);
        let no_branch = self.sequence(no);
        self.alloc(NodeKind::If {
            condition,
            yes_branch,
            no_branch,
        })
    }

    pub fn loop_(&mut self, body: Vec<NodeId>) -> NodeId {
        let body = self.sequence(body);
        self.alloc(NodeKind::Loop { body })
    }

    pub fn break_(&mut self) -> NodeId {
        self.alloc(NodeKind::Break)
    }

    pub fn continue_(&mut self) -> NodeId {
        self.alloc(NodeKind::Continue)
    }

    pub fn try_(&mut self, tried: Vec<NodeId>, handler: Vec<NodeId>) -> NodeId {
        let tried = match self.sequence(tried) {
            Some(seq) => seq,
            None => self.alloc(NodeKind::StatementsSequence {
                statements: Vec::new(),
            }),
        };
        let handler = self.sequence(handler);
        self.alloc(NodeKind::Try { tried, handler })
    }

    pub fn ret(&mut self, expression: NodeId) -> NodeId {
        self.alloc(NodeKind::Return { expression })
    }

    pub fn raise(&mut self, exception: NodeId) -> NodeId {
        self.alloc(NodeKind::Raise { exception })
    }

    // ── Expressions ─────────────────────────────────────────────

    pub fn var_ref(&mut self, variable: VariableId) -> NodeId {
        self.alloc(NodeKind::VariableRef { variable })
    }

    pub fn constant(&mut self, value: Constant) -> NodeId {
        self.alloc(NodeKind::Constant { value })
    }

    pub fn int(&mut self, value: i64) -> NodeId {
        self.constant(Constant::Int(value))
    }

    pub fn none(&mut self) -> NodeId {
        self.constant(Constant::None)
    }

    pub fn string(&mut self, value: &str) -> NodeId {
        self.constant(Constant::Str(value.to_string()))
    }

    pub fn call(&mut self, called: NodeId, args: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::Call { called, args })
    }

    pub fn attr(&mut self, source: NodeId, attribute: &str) -> NodeId {
        self.alloc(NodeKind::AttributeLookup {
            source,
            attribute: attribute.to_string(),
        })
    }

    pub fn special_attr(&mut self, source: NodeId, attribute: &str) -> NodeId {
        self.alloc(NodeKind::SpecialAttributeLookup {
            source,
            attribute: attribute.to_string(),
        })
    }

    pub fn binop(&mut self, op: BinaryOperator, left: NodeId, right: NodeId) -> NodeId {
        self.alloc(NodeKind::BinaryOp { op, left, right })
    }

    pub fn list(&mut self, elements: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::MakeList { elements })
    }

    pub fn tuple(&mut self, elements: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::MakeTuple { elements })
    }

    pub fn import(&mut self, module: &str) -> NodeId {
        self.alloc(NodeKind::ImportModule {
            module: module.to_string(),
        })
    }

    pub fn function_creation(&mut self, function: NodeId) -> NodeId {
        self.alloc(NodeKind::FunctionCreation { function })
    }

    pub fn class_creation(&mut self, class: NodeId) -> NodeId {
        self.alloc(NodeKind::ClassCreation { class })
    }
}
