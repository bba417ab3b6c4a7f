//! Arena-backed node tree.
//!
//! Parents own their children through the child handles stored in
//! [`NodeKind`]; the `parent` handle on each node is a plain back-link used for
//! traversal. Rewrites never free nodes: a replaced or detached subtree stays in
//! the arena, unreachable from the root.

use crate::nodes::{NodeId, NodeKind, NodeTag, Removal};
use crate::source::SourceRef;
use crate::IrError;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub source: SourceRef,
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    generation: u64,
}

impl Tree {
    /// Create a tree whose root is an empty module.
    pub fn new(module_name: &str, source: SourceRef) -> Self {
        let root = Node {
            kind: NodeKind::Module {
                name: module_name.to_string(),
                body: None,
                temp_variables: BTreeSet::new(),
            },
            parent: None,
            source,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
            generation: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Bumped on every structural mutation. Caches keyed on it are invalid
    /// as soon as it moves.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a detached node and adopt its children.
    ///
    /// Panics if a child is already attached somewhere: a node has exactly one
    /// parent, and handing one over twice is a bug in the calling pass.
    pub fn alloc(&mut self, kind: NodeKind, source: SourceRef) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for (slot, child) in kind.children() {
            let node = &self.nodes[child.index()];
            assert!(
                node.parent.is_none() && child != self.root,
                "node {} handed to slot '{}' of a new {} is already attached",
                child,
                slot,
                kind.tag().name()
            );
        }
        let children = kind.children();
        self.nodes.push(Node {
            kind,
            parent: None,
            source,
        });
        for (_, child) in children {
            self.nodes[child.index()].parent = Some(id);
        }
        self.generation += 1;
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn tag(&self, id: NodeId) -> NodeTag {
        self.nodes[id.index()].kind.tag()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    pub fn source(&self, id: NodeId) -> &SourceRef {
        &self.nodes[id.index()].source
    }

    /// Children in slot order.
    pub fn visitable_nodes(&self, id: NodeId) -> Vec<NodeId> {
        self.kind(id).children().into_iter().map(|(_, c)| c).collect()
    }

    /// True when `id` is reachable from the root through parent links.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == self.root {
                return true;
            }
            match self.parent(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Ancestor chain from the root down to `id`, both included.
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Nearest statement at or above `id`. A contraction is an expression of
    /// the enclosing statement; other scopes end the search.
    pub fn enclosing_statement(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            let tag = self.tag(node);
            if tag.is_statement() {
                return Some(node);
            }
            if tag.is_scope() && tag != NodeTag::Contraction {
                return None;
            }
            current = self.parent(node);
        }
        None
    }

    /// Scope whose code evaluates `id`. The `iterated` operand of a
    /// contraction is evaluated by the scope around the contraction.
    pub fn enclosing_scope(&self, id: NodeId) -> Option<NodeId> {
        let mut previous = id;
        let mut current = self.parent(id);
        while let Some(node) = current {
            match self.kind(node) {
                NodeKind::Contraction { iterated, .. } if *iterated == previous => {}
                kind if kind.tag().is_scope() => return Some(node),
                _ => {}
            }
            previous = node;
            current = self.parent(node);
        }
        None
    }

    /// Substitute the subtree at `old` by the detached subtree `new`.
    ///
    /// The parent slot and both parent links change in one step; `old` ends
    /// up detached.
    pub fn replace_with(&mut self, old: NodeId, new: NodeId) -> Result<(), IrError> {
        if old == self.root {
            return Err(IrError::ReplaceRoot);
        }
        if new == self.root || self.parent(new).is_some() {
            return Err(IrError::AlreadyAttached { node: new });
        }
        let parent = self.parent(old).ok_or(IrError::Detached { node: old })?;
        if !self.nodes[parent.index()].kind.replace_child(old, new) {
            return Err(IrError::BrokenParentLink { node: old, parent });
        }
        self.nodes[new.index()].parent = Some(parent);
        self.nodes[old.index()].parent = None;
        self.generation += 1;
        Ok(())
    }

    /// Remove `id` from an optional or list slot of its parent.
    pub fn detach(&mut self, id: NodeId) -> Result<(), IrError> {
        let parent = self.parent(id).ok_or(IrError::Detached { node: id })?;
        match self.nodes[parent.index()].kind.remove_child(id) {
            Removal::Removed => {}
            Removal::Required(slot) => {
                return Err(IrError::RequiredSlot {
                    node: id,
                    slot: slot.to_string(),
                })
            }
            Removal::NotFound => return Err(IrError::BrokenParentLink { node: id, parent }),
        }
        self.nodes[id.index()].parent = None;
        self.generation += 1;
        Ok(())
    }

    /// Attach the body of a scope node. A body can be set once.
    pub fn set_body(&mut self, scope: NodeId, body: Option<NodeId>) -> Result<(), IrError> {
        if let Some(body) = body {
            if body == self.root || self.parent(body).is_some() {
                return Err(IrError::AlreadyAttached { node: body });
            }
        }
        let tag = self.tag(scope);
        let slot = self.nodes[scope.index()]
            .kind
            .scope_body_mut()
            .ok_or(IrError::NotAScope { node: scope, tag })?;
        if slot.is_some() {
            return Err(IrError::BodyAlreadySet { node: scope });
        }
        *slot = body;
        if let Some(body) = body {
            self.nodes[body.index()].parent = Some(scope);
        }
        self.generation += 1;
        Ok(())
    }

    /// Attach the temp-variable set computed for a scope.
    pub fn set_temp_variables(
        &mut self,
        scope: NodeId,
        temps: BTreeSet<crate::nodes::VariableId>,
    ) -> Result<(), IrError> {
        let tag = self.tag(scope);
        let slot = self.nodes[scope.index()]
            .kind
            .temp_variables_mut()
            .ok_or(IrError::NotAScope { node: scope, tag })?;
        *slot = temps;
        Ok(())
    }

    /// Every node reachable from the root, in depth-first pre-order.
    pub fn preorder(&self) -> Vec<NodeId> {
        self.preorder_from(self.root)
    }

    pub fn preorder_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            let children = self.visitable_nodes(id);
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Nodes evaluated by the code of `scope` itself, in pre-order. Nested
    /// function and class bodies are not entered; of a nested contraction only
    /// the `iterated` operand belongs to `scope`.
    pub fn scope_preorder(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.kind(scope).scope_body().into_iter().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            let children = match self.kind(id) {
                NodeKind::FunctionCreation { .. } | NodeKind::ClassCreation { .. } => Vec::new(),
                NodeKind::Contraction { iterated, .. } => vec![*iterated],
                kind => kind.children().into_iter().map(|(_, c)| c).collect(),
            };
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// All attached scope nodes, outermost first.
    pub fn scopes(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|id| self.tag(*id).is_scope())
            .collect()
    }

    /// Check the parent links of every attached node.
    pub fn verify(&self) -> Result<(), IrError> {
        for id in self.preorder() {
            for child in self.visitable_nodes(id) {
                if self.parent(child) != Some(id) {
                    return Err(IrError::BrokenParentLink {
                        node: child,
                        parent: id,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Constant;

    fn constant(tree: &mut Tree, n: i64) -> NodeId {
        tree.alloc(
            NodeKind::Constant {
                value: Constant::Int(n),
            },
            SourceRef::dummy(),
        )
    }

    fn statement(tree: &mut Tree, n: i64) -> NodeId {
        let c = constant(tree, n);
        tree.alloc(NodeKind::Expression { expression: c }, SourceRef::dummy())
    }

    fn module_with(stmts: usize) -> (Tree, Vec<NodeId>) {
        let mut tree = Tree::new("m", SourceRef::dummy());
        let ids: Vec<NodeId> = (0..stmts).map(|i| statement(&mut tree, i as i64)).collect();
        let seq = tree.alloc(
            NodeKind::StatementsSequence {
                statements: ids.clone(),
            },
            SourceRef::dummy(),
        );
        tree.set_body(tree.root(), Some(seq)).unwrap();
        (tree, ids)
    }

    #[test]
    fn alloc_adopts_children() {
        let (tree, ids) = module_with(2);
        let seq = tree.kind(tree.root()).scope_body().unwrap();
        for id in &ids {
            assert_eq!(tree.parent(*id), Some(seq));
        }
        tree.verify().unwrap();
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn alloc_rejects_attached_child() {
        let (mut tree, ids) = module_with(1);
        tree.alloc(
            NodeKind::StatementsSequence {
                statements: vec![ids[0]],
            },
            SourceRef::dummy(),
        );
    }

    #[test]
    fn replace_relinks_both_sides() {
        let (mut tree, ids) = module_with(2);
        let seq = tree.parent(ids[0]).unwrap();
        let new = tree.alloc(NodeKind::Pass, SourceRef::dummy());
        let before = tree.generation();
        tree.replace_with(ids[0], new).unwrap();
        assert!(tree.generation() > before);
        assert_eq!(tree.parent(new), Some(seq));
        assert_eq!(tree.parent(ids[0]), None);
        assert!(!tree.is_attached(ids[0]));
        assert_eq!(tree.visitable_nodes(seq), vec![new, ids[1]]);
        tree.verify().unwrap();
    }

    #[test]
    fn replace_rejects_root_and_attached_nodes() {
        let (mut tree, ids) = module_with(2);
        let pass = tree.alloc(NodeKind::Pass, SourceRef::dummy());
        assert!(matches!(
            tree.replace_with(tree.root(), pass),
            Err(IrError::ReplaceRoot)
        ));
        assert!(matches!(
            tree.replace_with(ids[0], ids[1]),
            Err(IrError::AlreadyAttached { .. })
        ));
    }

    #[test]
    fn detach_from_list_and_required_slot() {
        let (mut tree, ids) = module_with(3);
        tree.detach(ids[1]).unwrap();
        let seq = tree.parent(ids[0]).unwrap();
        assert_eq!(tree.visitable_nodes(seq), vec![ids[0], ids[2]]);

        let expr = tree.visitable_nodes(ids[0])[0];
        assert!(matches!(
            tree.detach(expr),
            Err(IrError::RequiredSlot { .. })
        ));
    }

    #[test]
    fn paths_and_enclosing_statement() {
        let (tree, ids) = module_with(1);
        let expr = tree.visitable_nodes(ids[0])[0];
        let path = tree.path_to(expr);
        assert_eq!(path.first(), Some(&tree.root()));
        assert_eq!(path.last(), Some(&expr));
        assert_eq!(path.len(), 4);
        assert_eq!(tree.enclosing_statement(expr), Some(ids[0]));
        assert_eq!(tree.enclosing_scope(expr), Some(tree.root()));
    }

    #[test]
    fn body_can_only_be_set_once() {
        let (mut tree, _) = module_with(1);
        assert!(matches!(
            tree.set_body(tree.root(), None),
            Err(IrError::BodyAlreadySet { .. })
        ));
    }
}
