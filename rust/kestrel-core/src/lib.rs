//! Kestrel Core
//!
//! The in-memory program representation shared by every analysis pass: the
//! node arena, the variable table with closure-sharing facts, and the builder
//! the front-end uses to hand a parsed module over.

pub mod builder;
pub mod dump;
pub mod nodes;
pub mod source;
pub mod tree;
pub mod variables;

pub use builder::ProgramBuilder;
pub use nodes::{BinaryOperator, Constant, ContractionKind, NodeId, NodeKind, NodeTag, VariableId};
pub use source::SourceRef;
pub use tree::{Node, Tree};
pub use variables::{SharingCache, Variable, VariableAnnotations, VariableKind, VariableTable};

use thiserror::Error;

/// Misuse of the tree or variable table. Every variant is a bug in the pass
/// that triggered it, never a property of the user's program.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("the root module cannot be replaced")]
    ReplaceRoot,
    #[error("node {node} is already attached to a parent")]
    AlreadyAttached { node: NodeId },
    #[error("node {node} is not attached to a parent")]
    Detached { node: NodeId },
    #[error("node {node} is not a child of its recorded parent {parent}")]
    BrokenParentLink { node: NodeId, parent: NodeId },
    #[error("node {node} fills required slot '{slot}' and cannot be removed")]
    RequiredSlot { node: NodeId, slot: String },
    #[error("node {node} is a {tag:?}, not a scope")]
    NotAScope { node: NodeId, tag: NodeTag },
    #[error("scope {node} already has a body")]
    BodyAlreadySet { node: NodeId },
    #[error("closure reference '{name}' must be created from its target")]
    ClosureReferenceWithoutTarget { name: String },
    #[error("variable '{name}' is already defined in scope {owner}")]
    DuplicateVariable { name: String, owner: NodeId },
    #[error("release decision for variable '{name}' was already made")]
    NeedsFreeAlreadySet { name: String },
    #[error("scope stack is unbalanced: {open} scope(s) still open")]
    UnbalancedScopes { open: usize },
}

/// A module under compilation: its tree plus every variable its scopes own.
#[derive(Debug, Clone)]
pub struct Program {
    pub tree: Tree,
    pub variables: VariableTable,
}

impl Program {
    pub fn new(module_name: &str, file: &str) -> Self {
        Self {
            tree: Tree::new(module_name, SourceRef::new(file, 1)),
            variables: VariableTable::new(),
        }
    }

    /// Shorthand for the sharing fact, uncached.
    pub fn is_shared(&self, variable: VariableId) -> bool {
        self.variables.is_shared(&self.tree, variable)
    }
}
