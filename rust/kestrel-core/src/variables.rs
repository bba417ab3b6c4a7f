//! Variables, closure references and the sharing analysis.
//!
//! A variable is identified by its owning scope node and its name. Uses of a
//! name from an inner function are not the variable itself but a
//! [`VariableKind::ClosureReference`] owned by the inner scope, which links
//! back to its target. Whether a variable must live in a heap cell is derived
//! from those links on demand (see [`VariableTable::is_shared`]).

use crate::nodes::{NodeId, NodeKind, VariableId};
use crate::tree::Tree;
use crate::IrError;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VariableKind {
    Parameter,
    /// Destructuring parameter such as `def f((a, b)):`; the children are
    /// ordinary parameters of the same scope.
    NestedParameter { children: Vec<VariableId> },
    Local,
    /// Loop control local. Same semantics as `Local`.
    LocalLoop,
    ClassVar,
    ModuleVar,
    /// Compiler-introduced temporary.
    Temp,
    /// Use-site alias of a variable owned by an enclosing scope. Has no
    /// storage of its own.
    ClosureReference { target: VariableId },
}

impl VariableKind {
    pub fn label(&self) -> &'static str {
        match self {
            VariableKind::Parameter => "parameter",
            VariableKind::NestedParameter { .. } => "nested parameter",
            VariableKind::Local => "local",
            VariableKind::LocalLoop => "loop local",
            VariableKind::ClassVar => "class variable",
            VariableKind::ModuleVar => "module variable",
            VariableKind::Temp => "temp",
            VariableKind::ClosureReference { .. } => "closure reference",
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(
            self,
            VariableKind::Parameter | VariableKind::NestedParameter { .. }
        )
    }

    /// Kinds whose storage placement is decided by the lifetime pass.
    pub fn is_scope_local(&self) -> bool {
        matches!(
            self,
            VariableKind::Local | VariableKind::LocalLoop | VariableKind::Temp
        )
    }
}

/// Codegen directives attached by the finalization passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariableAnnotations {
    /// Whether the variable may hold an owned reference that must be released.
    /// `None` when no assignment makes it determinable.
    pub needs_free: Option<bool>,
    /// Storage is created by the first assignment instead of at scope entry.
    pub late_declaration: bool,
    /// `del` statement ending a late-declared variable's storage.
    pub delete_scope: Option<NodeId>,
    /// First statement of the live range at declaration level.
    pub first_use: Option<NodeId>,
    /// Last statement of the live range at declaration level.
    pub last_use: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Variable {
    pub name: String,
    pub owner: NodeId,
    pub kind: VariableKind,
    /// Closure references pointing at this variable, in creation order.
    pub references: Vec<VariableId>,
    pub annotations: VariableAnnotations,
}

#[derive(Debug, Clone, Default)]
pub struct VariableTable {
    variables: Vec<Variable>,
    generation: u64,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped whenever a variable or closure reference is added.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Create a storage variable. Closure references go through
    /// [`VariableTable::create_closure_reference`].
    pub fn create(
        &mut self,
        owner: NodeId,
        name: &str,
        kind: VariableKind,
    ) -> Result<VariableId, IrError> {
        if matches!(kind, VariableKind::ClosureReference { .. }) {
            return Err(IrError::ClosureReferenceWithoutTarget {
                name: name.to_string(),
            });
        }
        if self.lookup(owner, name).is_some() {
            return Err(IrError::DuplicateVariable {
                name: name.to_string(),
                owner,
            });
        }
        Ok(self.push(owner, name.to_string(), kind))
    }

    /// Create a closure reference in `owner` for `target` and register it on
    /// the target's reference list.
    pub fn create_closure_reference(
        &mut self,
        owner: NodeId,
        target: VariableId,
    ) -> Result<VariableId, IrError> {
        let name = self.get(target).name.clone();
        if self.lookup(owner, &name).is_some() {
            return Err(IrError::DuplicateVariable { name, owner });
        }
        let reference = self.push(owner, name, VariableKind::ClosureReference { target });
        self.add_reference(target, reference);
        Ok(reference)
    }

    /// Existing variable of that name in `owner`, or a new one of `kind`.
    pub(crate) fn define(&mut self, owner: NodeId, name: &str, kind: VariableKind) -> VariableId {
        match self.lookup(owner, name) {
            Some(id) => id,
            None => self.push(owner, name.to_string(), kind),
        }
    }

    /// Existing variable of the target's name in `owner`, or a new closure
    /// reference to `target`.
    pub(crate) fn define_closure_reference(&mut self, owner: NodeId, target: VariableId) -> VariableId {
        let name = self.get(target).name.clone();
        if let Some(id) = self.lookup(owner, &name) {
            return id;
        }
        let reference = self.push(owner, name, VariableKind::ClosureReference { target });
        self.add_reference(target, reference);
        reference
    }

    fn push(&mut self, owner: NodeId, name: String, kind: VariableKind) -> VariableId {
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(Variable {
            name,
            owner,
            kind,
            references: Vec::new(),
            annotations: VariableAnnotations::default(),
        });
        self.generation += 1;
        id
    }

    fn add_reference(&mut self, target: VariableId, reference: VariableId) {
        self.variables[target.index()].references.push(reference);
    }

    pub fn get(&self, id: VariableId) -> &Variable {
        &self.variables[id.index()]
    }

    pub fn name(&self, id: VariableId) -> &str {
        &self.variables[id.index()].name
    }

    pub fn owner(&self, id: VariableId) -> NodeId {
        self.variables[id.index()].owner
    }

    pub fn kind(&self, id: VariableId) -> &VariableKind {
        &self.variables[id.index()].kind
    }

    pub fn iter(&self) -> impl Iterator<Item = (VariableId, &Variable)> {
        self.variables
            .iter()
            .enumerate()
            .map(|(i, v)| (VariableId(i as u32), v))
    }

    /// Variables owned by `owner`, in creation order.
    pub fn owned_by(&self, owner: NodeId) -> Vec<VariableId> {
        self.iter()
            .filter(|(_, v)| v.owner == owner)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn lookup(&self, owner: NodeId, name: &str) -> Option<VariableId> {
        self.iter()
            .find(|(_, v)| v.owner == owner && v.name == name)
            .map(|(id, _)| id)
    }

    /// Child variables of a nested parameter; empty for every other kind.
    pub fn nested_children(&self, id: VariableId) -> &[VariableId] {
        match &self.get(id).kind {
            VariableKind::NestedParameter { children } => children,
            _ => &[],
        }
    }

    /// Follow closure references to the variable that owns the storage.
    pub fn storage_of(&self, id: VariableId) -> VariableId {
        let mut current = id;
        while let VariableKind::ClosureReference { target } = self.get(current).kind {
            current = target;
        }
        current
    }

    // ── Annotations ─────────────────────────────────────────────

    pub fn annotations(&self, id: VariableId) -> &VariableAnnotations {
        &self.variables[id.index()].annotations
    }

    pub fn reset_annotations(&mut self) {
        for variable in &mut self.variables {
            variable.annotations = VariableAnnotations::default();
        }
    }

    /// Record the release decision. Deciding twice is a pass-ordering bug.
    pub fn set_needs_free(&mut self, id: VariableId, value: bool) -> Result<(), IrError> {
        let variable = &mut self.variables[id.index()];
        if variable.annotations.needs_free.is_some() {
            return Err(IrError::NeedsFreeAlreadySet {
                name: variable.name.clone(),
            });
        }
        variable.annotations.needs_free = Some(value);
        Ok(())
    }

    pub fn mark_late_declaration(&mut self, id: VariableId, delete_scope: Option<NodeId>) {
        let annotations = &mut self.variables[id.index()].annotations;
        annotations.late_declaration = true;
        annotations.delete_scope = delete_scope;
    }

    pub fn set_live_range(&mut self, id: VariableId, first: NodeId, last: NodeId) {
        let annotations = &mut self.variables[id.index()].annotations;
        annotations.first_use = Some(first);
        annotations.last_use = Some(last);
    }

    // ── Sharing ─────────────────────────────────────────────────

    /// True when some closure reference to `id`, followed transitively, is
    /// owned by code running in a different function than the variable's
    /// owner. Contractions run inside their enclosing function and are not
    /// a boundary.
    pub fn is_shared(&self, tree: &Tree, id: VariableId) -> bool {
        let home = entry_point(tree, self.owner(id));
        let mut pending: Vec<VariableId> = self.get(id).references.clone();
        let mut seen = HashSet::new();
        while let Some(reference) = pending.pop() {
            if !seen.insert(reference) {
                continue;
            }
            if entry_point(tree, self.owner(reference)) != home {
                return true;
            }
            pending.extend(self.get(reference).references.iter().copied());
        }
        false
    }
}

/// The function-like scope whose frame executes code of `scope`: contractions
/// are climbed out of, one boundary at a time.
pub fn entry_point(tree: &Tree, scope: NodeId) -> NodeId {
    let mut current = scope;
    while let NodeKind::Contraction { .. } = tree.kind(current) {
        match tree.enclosing_scope(current) {
            Some(outer) => current = outer,
            None => break,
        }
    }
    current
}

/// Memoized [`VariableTable::is_shared`] for one analysis run. Entries are
/// dropped as soon as the tree or the reference graph changes.
#[derive(Debug, Default)]
pub struct SharingCache {
    key: Option<(u64, u64)>,
    shared: HashMap<VariableId, bool>,
}

impl SharingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shared(&mut self, tree: &Tree, variables: &VariableTable, id: VariableId) -> bool {
        let key = (tree.generation(), variables.generation());
        if self.key != Some(key) {
            self.shared.clear();
            self.key = Some(key);
        }
        *self
            .shared
            .entry(id)
            .or_insert_with(|| variables.is_shared(tree, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceRef;
    use std::collections::BTreeSet;

    fn function(tree: &mut Tree, name: &str) -> NodeId {
        tree.alloc(
            NodeKind::Function {
                name: name.to_string(),
                body: None,
                temp_variables: BTreeSet::new(),
            },
            SourceRef::dummy(),
        )
    }

    #[test]
    fn closure_reference_registers_on_target() {
        let mut tree = Tree::new("m", SourceRef::dummy());
        let outer = function(&mut tree, "outer");
        let inner = function(&mut tree, "inner");
        let mut vars = VariableTable::new();
        let x = vars.create(outer, "x", VariableKind::Local).unwrap();
        let r = vars.create_closure_reference(inner, x).unwrap();
        assert_eq!(vars.get(x).references, vec![r]);
        assert_eq!(vars.name(r), "x");
        assert_eq!(vars.storage_of(r), x);
    }

    #[test]
    fn closure_kind_needs_a_target() {
        let tree = Tree::new("m", SourceRef::dummy());
        let mut vars = VariableTable::new();
        let err = vars
            .create(
                tree.root(),
                "x",
                VariableKind::ClosureReference {
                    target: VariableId(0),
                },
            )
            .unwrap_err();
        assert!(matches!(err, IrError::ClosureReferenceWithoutTarget { .. }));
    }

    #[test]
    fn duplicate_names_in_one_scope_are_rejected() {
        let tree = Tree::new("m", SourceRef::dummy());
        let mut vars = VariableTable::new();
        vars.create(tree.root(), "x", VariableKind::ModuleVar).unwrap();
        assert!(vars.create(tree.root(), "x", VariableKind::ModuleVar).is_err());
    }

    #[test]
    fn needs_free_is_decided_once() {
        let tree = Tree::new("m", SourceRef::dummy());
        let mut vars = VariableTable::new();
        let t = vars.create(tree.root(), "tmp", VariableKind::Temp).unwrap();
        vars.set_needs_free(t, true).unwrap();
        assert!(matches!(
            vars.set_needs_free(t, false),
            Err(IrError::NeedsFreeAlreadySet { .. })
        ));
        vars.reset_annotations();
        vars.set_needs_free(t, false).unwrap();
        assert_eq!(vars.annotations(t).needs_free, Some(false));
    }

    #[test]
    fn unreferenced_variable_is_not_shared() {
        let tree = Tree::new("m", SourceRef::dummy());
        let mut vars = VariableTable::new();
        let x = vars.create(tree.root(), "x", VariableKind::ModuleVar).unwrap();
        assert!(!vars.is_shared(&tree, x));
    }

    #[test]
    fn cache_invalidates_on_new_reference() {
        let mut tree = Tree::new("m", SourceRef::dummy());
        let outer = function(&mut tree, "outer");
        let inner = function(&mut tree, "inner");
        let mut vars = VariableTable::new();
        let x = vars.create(outer, "x", VariableKind::Local).unwrap();
        let mut cache = SharingCache::new();
        assert!(!cache.is_shared(&tree, &vars, x));
        vars.create_closure_reference(inner, x).unwrap();
        assert!(cache.is_shared(&tree, &vars, x));
    }
}
