//! Static type shapes known to the optimizer.
//!
//! Knowledge is conservative: a missing entry means "anything". Passes that
//! cannot predict an operation call [`OptimizerKnowledge::remove_knowledge`]
//! on its operand, since the operation may have changed it.

use kestrel_core::{Constant, NodeId, NodeKind, Program, VariableId};
use serde::Serialize;
use std::collections::HashMap;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum TypeShape {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Function,
    Class,
    Module,
}

impl TypeShape {
    pub fn of_constant(value: &Constant) -> Self {
        match value {
            Constant::None => TypeShape::NoneType,
            Constant::Bool(_) => TypeShape::Bool,
            Constant::Int(_) => TypeShape::Int,
            Constant::Float(_) => TypeShape::Float,
            Constant::Str(_) => TypeShape::Str,
            Constant::Bytes(_) => TypeShape::Bytes,
        }
    }

    /// Shape an expression has regardless of its operands' values.
    pub fn of_node(kind: &NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Constant { value } => Some(Self::of_constant(value)),
            NodeKind::MakeList { .. } => Some(TypeShape::List),
            NodeKind::MakeTuple { .. } => Some(TypeShape::Tuple),
            NodeKind::FunctionCreation { .. } => Some(TypeShape::Function),
            NodeKind::ClassCreation { .. } => Some(TypeShape::Class),
            NodeKind::ImportModule { .. } => Some(TypeShape::Module),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct OptimizerKnowledge {
    nodes: HashMap<NodeId, TypeShape>,
    variables: HashMap<VariableId, TypeShape>,
}

impl OptimizerKnowledge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gather shapes from the current tree.
    ///
    /// A scope-local variable gets a shape when every assignment to it
    /// anywhere in the program has a source of that same shape and no
    /// other scope can rebind it. References to it then share that shape.
    pub fn observe(program: &Program) -> Self {
        let mut knowledge = Self::new();
        let mut assigned: HashMap<VariableId, Option<TypeShape>> = HashMap::new();

        for id in program.tree.preorder() {
            let kind = program.tree.kind(id);
            if let Some(shape) = TypeShape::of_node(kind) {
                knowledge.nodes.insert(id, shape);
            }
            if let NodeKind::AssignVariable { variable, source } = kind {
                let shape = TypeShape::of_node(program.tree.kind(*source));
                assigned
                    .entry(*variable)
                    .and_modify(|known| {
                        if *known != shape {
                            *known = None;
                        }
                    })
                    .or_insert(shape);
            }
        }

        for (variable, shape) in assigned {
            let Some(shape) = shape else { continue };
            if program.variables.kind(variable).is_scope_local() && !program.is_shared(variable) {
                knowledge.variables.insert(variable, shape);
            }
        }

        for id in program.tree.preorder() {
            if let NodeKind::VariableRef { variable } = program.tree.kind(id) {
                if let Some(shape) = knowledge.variables.get(variable) {
                    knowledge.nodes.insert(id, *shape);
                }
            }
        }
        knowledge
    }

    pub fn node_shape(&self, id: NodeId) -> Option<TypeShape> {
        self.nodes.get(&id).copied()
    }

    pub fn variable_shape(&self, id: VariableId) -> Option<TypeShape> {
        self.variables.get(&id).copied()
    }

    pub fn record_node(&mut self, id: NodeId, shape: TypeShape) {
        self.nodes.insert(id, shape);
    }

    /// Forget everything known about the value `node` produces. For a
    /// variable reference that is the variable itself, along with every
    /// other reference to it.
    pub fn remove_knowledge(&mut self, program: &Program, node: NodeId) {
        self.nodes.remove(&node);
        if let NodeKind::VariableRef { variable } = program.tree.kind(node) {
            let variable = *variable;
            self.variables.remove(&variable);
            self.nodes.retain(|id, _| {
                !matches!(program.tree.kind(*id), NodeKind::VariableRef { variable: v } if *v == variable)
            });
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.variables.is_empty()
    }
}
