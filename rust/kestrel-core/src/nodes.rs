//! Node kinds of the Kestrel IR.
//!
//! The kind set is closed: every pass matches exhaustively over [`NodeKind`],
//! so adding a kind is a compile error everywhere it is not handled. Child
//! slots have fixed, meaningful names; [`NodeKind::children`] yields them in
//! evaluation order, which is the order generic walkers and the dump use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use strum_macros::{Display, EnumDiscriminants, EnumIter, IntoStaticStr};

/// Handle of a node in the [`Tree`](crate::tree::Tree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a variable in the [`VariableTable`](crate::variables::VariableTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub(crate) u32);

impl VariableId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Compile-time constant values. All of them are immortal at runtime, so a
/// reference to one never carries an ownership obligation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(n) => write!(f, "{}", n),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum BinaryOperator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "<")]
    Lt,
}

/// Comprehension flavours. All of them form a scope that is transparent for
/// closure sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ContractionKind {
    List,
    Set,
    Dict,
    Generator,
}

#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(
    name(NodeTag),
    derive(Hash, PartialOrd, Ord, EnumIter, IntoStaticStr, Serialize, Deserialize)
)]
pub enum NodeKind {
    // ── Scopes ──
    Module {
        name: String,
        body: Option<NodeId>,
        temp_variables: BTreeSet<VariableId>,
    },
    Function {
        name: String,
        body: Option<NodeId>,
        temp_variables: BTreeSet<VariableId>,
    },
    Class {
        name: String,
        body: Option<NodeId>,
        temp_variables: BTreeSet<VariableId>,
    },
    /// List/set/dict comprehension or generator expression. Evaluates to a
    /// value like any expression, but owns its own variables.
    Contraction {
        kind: ContractionKind,
        iterated: NodeId,
        body: Option<NodeId>,
        temp_variables: BTreeSet<VariableId>,
    },

    // ── Statements ──
    StatementsSequence {
        statements: Vec<NodeId>,
    },
    AssignVariable {
        variable: VariableId,
        source: NodeId,
    },
    DelVariable {
        variable: VariableId,
        tolerant: bool,
    },
    ReleaseVariable {
        variable: VariableId,
    },
    Expression {
        expression: NodeId,
    },
    Pass,
    If {
        condition: NodeId,
        yes_branch: Option<NodeId>,
        no_branch: Option<NodeId>,
    },
    /// Unconditional loop; left through `Break`, `Return` or `Raise` only.
    Loop {
        body: Option<NodeId>,
    },
    Break,
    Continue,
    Try {
        tried: NodeId,
        handler: Option<NodeId>,
    },
    Return {
        expression: NodeId,
    },
    Raise {
        exception: NodeId,
    },

    // ── Expressions ──
    VariableRef {
        variable: VariableId,
    },
    Constant {
        value: Constant,
    },
    Call {
        called: NodeId,
        args: Vec<NodeId>,
    },
    AttributeLookup {
        source: NodeId,
        attribute: String,
    },
    /// Lookup of an implementation-internal slot (`__enter__`, `__exit__`, ...).
    /// Never resolved statically.
    SpecialAttributeLookup {
        source: NodeId,
        attribute: String,
    },
    BinaryOp {
        op: BinaryOperator,
        left: NodeId,
        right: NodeId,
    },
    MakeList {
        elements: Vec<NodeId>,
    },
    MakeTuple {
        elements: Vec<NodeId>,
    },
    FunctionCreation {
        function: NodeId,
    },
    ClassCreation {
        class: NodeId,
    },
    ImportModule {
        module: String,
    },
}

impl NodeTag {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn is_scope(self) -> bool {
        matches!(
            self,
            NodeTag::Module | NodeTag::Function | NodeTag::Class | NodeTag::Contraction
        )
    }

    pub fn is_statement(self) -> bool {
        matches!(
            self,
            NodeTag::StatementsSequence
                | NodeTag::AssignVariable
                | NodeTag::DelVariable
                | NodeTag::ReleaseVariable
                | NodeTag::Expression
                | NodeTag::Pass
                | NodeTag::If
                | NodeTag::Loop
                | NodeTag::Break
                | NodeTag::Continue
                | NodeTag::Try
                | NodeTag::Return
                | NodeTag::Raise
        )
    }

    pub fn is_expression(self) -> bool {
        !self.is_statement() && !matches!(self, NodeTag::Module | NodeTag::Function | NodeTag::Class)
    }

    /// Statements after which control never falls through to the next one.
    pub fn aborts_control_flow(self) -> bool {
        matches!(
            self,
            NodeTag::Return | NodeTag::Raise | NodeTag::Break | NodeTag::Continue
        )
    }
}

/// A named child slot. `index` is set for list slots only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub name: &'static str,
    pub index: Option<usize>,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Result of removing a child from its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    Removed,
    /// The child sits in a slot that must always be filled.
    Required(&'static str),
    NotFound,
}

#[derive(Default)]
struct Slots(Vec<(Slot, NodeId)>);

impl Slots {
    fn one(mut self, name: &'static str, id: NodeId) -> Self {
        self.0.push((Slot { name, index: None }, id));
        self
    }

    fn opt(mut self, name: &'static str, id: Option<NodeId>) -> Self {
        if let Some(id) = id {
            self.0.push((Slot { name, index: None }, id));
        }
        self
    }

    fn list(mut self, name: &'static str, ids: &[NodeId]) -> Self {
        for (i, id) in ids.iter().enumerate() {
            self.0.push((Slot { name, index: Some(i) }, *id));
        }
        self
    }
}

impl NodeKind {
    pub fn tag(&self) -> NodeTag {
        NodeTag::from(self)
    }

    /// Child slots in evaluation order.
    pub fn children(&self) -> Vec<(Slot, NodeId)> {
        let slots = Slots::default();
        let slots = match self {
            NodeKind::Module { body, .. }
            | NodeKind::Function { body, .. }
            | NodeKind::Class { body, .. } => slots.opt("body", *body),
            NodeKind::Contraction { iterated, body, .. } => {
                slots.one("iterated", *iterated).opt("body", *body)
            }
            NodeKind::StatementsSequence { statements } => slots.list("statements", statements),
            NodeKind::AssignVariable { source, .. } => slots.one("source", *source),
            NodeKind::DelVariable { .. }
            | NodeKind::ReleaseVariable { .. }
            | NodeKind::Pass
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::VariableRef { .. }
            | NodeKind::Constant { .. }
            | NodeKind::ImportModule { .. } => slots,
            NodeKind::Expression { expression } | NodeKind::Return { expression } => {
                slots.one("expression", *expression)
            }
            NodeKind::If {
                condition,
                yes_branch,
                no_branch,
            } => slots
                .one("condition", *condition)
                .opt("yes_branch", *yes_branch)
                .opt("no_branch", *no_branch),
            NodeKind::Loop { body } => slots.opt("body", *body),
            NodeKind::Try { tried, handler } => slots.one("tried", *tried).opt("handler", *handler),
            NodeKind::Raise { exception } => slots.one("exception", *exception),
            NodeKind::Call { called, args } => slots.one("called", *called).list("args", args),
            NodeKind::AttributeLookup { source, .. }
            | NodeKind::SpecialAttributeLookup { source, .. } => slots.one("source", *source),
            NodeKind::BinaryOp { left, right, .. } => slots.one("left", *left).one("right", *right),
            NodeKind::MakeList { elements } | NodeKind::MakeTuple { elements } => {
                slots.list("elements", elements)
            }
            NodeKind::FunctionCreation { function } => slots.one("function", *function),
            NodeKind::ClassCreation { class } => slots.one("class", *class),
        };
        slots.0
    }

    fn child_refs_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            NodeKind::Module { body, .. }
            | NodeKind::Function { body, .. }
            | NodeKind::Class { body, .. }
            | NodeKind::Loop { body } => body.as_mut().into_iter().collect(),
            NodeKind::Contraction { iterated, body, .. } => {
                let mut refs = vec![iterated];
                refs.extend(body.as_mut());
                refs
            }
            NodeKind::StatementsSequence { statements: ids }
            | NodeKind::MakeList { elements: ids }
            | NodeKind::MakeTuple { elements: ids } => ids.iter_mut().collect(),
            NodeKind::AssignVariable { source: id, .. }
            | NodeKind::Expression { expression: id }
            | NodeKind::Return { expression: id }
            | NodeKind::Raise { exception: id }
            | NodeKind::AttributeLookup { source: id, .. }
            | NodeKind::SpecialAttributeLookup { source: id, .. }
            | NodeKind::FunctionCreation { function: id }
            | NodeKind::ClassCreation { class: id } => vec![id],
            NodeKind::DelVariable { .. }
            | NodeKind::ReleaseVariable { .. }
            | NodeKind::Pass
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::VariableRef { .. }
            | NodeKind::Constant { .. }
            | NodeKind::ImportModule { .. } => Vec::new(),
            NodeKind::If {
                condition,
                yes_branch,
                no_branch,
            } => {
                let mut refs = vec![condition];
                refs.extend(yes_branch.as_mut());
                refs.extend(no_branch.as_mut());
                refs
            }
            NodeKind::Try { tried, handler } => {
                let mut refs = vec![tried];
                refs.extend(handler.as_mut());
                refs
            }
            NodeKind::Call { called, args } => {
                let mut refs = vec![called];
                refs.extend(args.iter_mut());
                refs
            }
            NodeKind::BinaryOp { left, right, .. } => vec![left, right],
        }
    }

    /// Point the slot holding `old` at `new`. Returns false when `old` is not a child.
    pub(crate) fn replace_child(&mut self, old: NodeId, new: NodeId) -> bool {
        match self.child_refs_mut().into_iter().find(|r| **r == old) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_child(&mut self, child: NodeId) -> Removal {
        fn take(slot: &mut Option<NodeId>, child: NodeId) -> bool {
            if *slot == Some(child) {
                *slot = None;
                true
            } else {
                false
            }
        }
        fn retain(list: &mut Vec<NodeId>, child: NodeId) -> bool {
            let before = list.len();
            list.retain(|id| *id != child);
            list.len() != before
        }

        let removed = match self {
            NodeKind::Module { body, .. }
            | NodeKind::Function { body, .. }
            | NodeKind::Class { body, .. }
            | NodeKind::Loop { body }
            | NodeKind::Contraction { body, .. } => take(body, child),
            NodeKind::If {
                yes_branch,
                no_branch,
                ..
            } => take(yes_branch, child) || take(no_branch, child),
            NodeKind::Try { handler, .. } => take(handler, child),
            NodeKind::StatementsSequence { statements: ids }
            | NodeKind::MakeList { elements: ids }
            | NodeKind::MakeTuple { elements: ids }
            | NodeKind::Call { args: ids, .. } => retain(ids, child),
            _ => false,
        };
        if removed {
            return Removal::Removed;
        }
        match self.children().into_iter().find(|(_, id)| *id == child) {
            Some((slot, _)) => Removal::Required(slot.name),
            None => Removal::NotFound,
        }
    }

    /// Body of a scope node.
    pub fn scope_body(&self) -> Option<NodeId> {
        match self {
            NodeKind::Module { body, .. }
            | NodeKind::Function { body, .. }
            | NodeKind::Class { body, .. }
            | NodeKind::Contraction { body, .. } => *body,
            _ => None,
        }
    }

    pub(crate) fn scope_body_mut(&mut self) -> Option<&mut Option<NodeId>> {
        match self {
            NodeKind::Module { body, .. }
            | NodeKind::Function { body, .. }
            | NodeKind::Class { body, .. }
            | NodeKind::Contraction { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn temp_variables(&self) -> Option<&BTreeSet<VariableId>> {
        match self {
            NodeKind::Module { temp_variables, .. }
            | NodeKind::Function { temp_variables, .. }
            | NodeKind::Class { temp_variables, .. }
            | NodeKind::Contraction { temp_variables, .. } => Some(temp_variables),
            _ => None,
        }
    }

    pub(crate) fn temp_variables_mut(&mut self) -> Option<&mut BTreeSet<VariableId>> {
        match self {
            NodeKind::Module { temp_variables, .. }
            | NodeKind::Function { temp_variables, .. }
            | NodeKind::Class { temp_variables, .. }
            | NodeKind::Contraction { temp_variables, .. } => Some(temp_variables),
            _ => None,
        }
    }

    /// Variable touched directly by this node, if any.
    pub fn variable(&self) -> Option<VariableId> {
        match self {
            NodeKind::AssignVariable { variable, .. }
            | NodeKind::DelVariable { variable, .. }
            | NodeKind::ReleaseVariable { variable }
            | NodeKind::VariableRef { variable } => Some(*variable),
            _ => None,
        }
    }
}
