//! Finalization: storage decisions made once the tree is stable.
//!
//! For every local and temp variable the lifetime pass folds the statements
//! touching it into a live range at declaration level, decides whether the
//! variable may own a reference (`needs_free`), and whether its storage can be
//! declared at its first assignment instead of at scope entry. The temp pass
//! then records on each scope node the temp variables it actually uses.

use super::trace::{TraceCollection, TraceKind};
use crate::CompileError;
use kestrel_core::variables::entry_point;
use kestrel_core::{NodeId, NodeKind, NodeTag, Program, SharingCache, Tree, VariableId, VariableKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Keep whichever diverging statement executes first.
    First,
    /// Keep whichever diverging statement executes last.
    Last,
}

/// Fold two root paths into the path of the statement that bounds both,
/// at the level of the statement list they share.
///
/// - If one path is a prefix of the other, the shorter one is kept.
/// - If they part below a statement sequence, the path of the earlier
///   (`First`) or later (`Last`) of the two diverging statements is kept,
///   cut just below the sequence.
/// - Otherwise the common prefix is kept, climbed to the nearest statement.
///
/// The result does not depend on the argument order.
pub fn select_statement(tree: &Tree, a: &[NodeId], b: &[NodeId], mode: SelectMode) -> Vec<NodeId> {
    let common = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    if common == a.len() || common == b.len() {
        let shorter = if a.len() <= b.len() { a } else { b };
        return climb_to_statement(tree, shorter);
    }
    if common == 0 {
        return climb_to_statement(tree, a);
    }

    let last = a[common - 1];
    if let NodeKind::StatementsSequence { statements } = tree.kind(last) {
        let position = |id: NodeId| statements.iter().position(|s| *s == id);
        let (pa, pb) = (position(a[common]), position(b[common]));
        let keep_a = match mode {
            SelectMode::First => pa <= pb,
            SelectMode::Last => pa >= pb,
        };
        let kept = if keep_a { a } else { b };
        return kept[..=common].to_vec();
    }
    climb_to_statement(tree, &a[..common])
}

/// Cut `path` after its deepest statement. A function, class or module scope
/// ends the climb; a contraction is part of the expression around it.
fn climb_to_statement(tree: &Tree, path: &[NodeId]) -> Vec<NodeId> {
    for end in (1..=path.len()).rev() {
        let tag = tree.tag(path[end - 1]);
        if tag.is_statement() || (tag.is_scope() && tag != NodeTag::Contraction) {
            return path[..end].to_vec();
        }
    }
    path.to_vec()
}

/// Decisions taken for one variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifetimeDecision {
    pub variable: VariableId,
    pub needs_free: Option<bool>,
    pub first_use: NodeId,
    pub last_use: NodeId,
    pub late_declaration: bool,
    pub delete_scope: Option<NodeId>,
}

/// Run the lifetime pass over every scope.
pub fn finalize_lifetimes(
    program: &mut Program,
    traces: &TraceCollection,
) -> Result<Vec<LifetimeDecision>, CompileError> {
    let mut sharing = SharingCache::new();
    let mut decisions = Vec::new();
    for scope in program.tree.scopes() {
        decisions.extend(finalize_scope_lifetimes(program, traces, scope, &mut sharing)?);
    }
    debug!(
        "lifetime pass: {} variable(s) placed, {} declared late",
        decisions.len(),
        decisions.iter().filter(|d| d.late_declaration).count()
    );
    Ok(decisions)
}

pub fn finalize_scope_lifetimes(
    program: &mut Program,
    traces: &TraceCollection,
    scope: NodeId,
    sharing: &mut SharingCache,
) -> Result<Vec<LifetimeDecision>, CompileError> {
    let mut decisions = Vec::new();
    for variable in program.variables.owned_by(scope) {
        if !program.variables.kind(variable).is_scope_local() {
            continue;
        }
        if let Some(decision) = finalize_variable(program, traces, variable, sharing)? {
            decisions.push(decision);
        }
    }
    Ok(decisions)
}

fn finalize_variable(
    program: &mut Program,
    traces: &TraceCollection,
    variable: VariableId,
    sharing: &mut SharingCache,
) -> Result<Option<LifetimeDecision>, CompileError> {
    let mut uses = Vec::new();
    let mut seen = HashSet::new();
    let mut fresh_assignments = Vec::new();
    for id in traces.traces_of(variable) {
        let trace = traces.get(*id);
        if trace.is_merge() {
            continue;
        }
        if let TraceKind::Assign { fresh, .. } = trace.kind {
            fresh_assignments.push(fresh);
        }
        for node in trace.touching_nodes() {
            if seen.insert(node) {
                uses.push(node);
            }
        }
    }

    // Comprehensions run in this frame; their reads count here.
    let aliases = frame_aliases(program, variable);
    for (alias, anchor) in &aliases {
        let touched = traces
            .traces_of(*alias)
            .iter()
            .map(|id| traces.get(*id))
            .any(|t| !t.is_merge() && t.touching_nodes().next().is_some());
        if touched && seen.insert(*anchor) {
            uses.push(*anchor);
        }
    }

    let name = program.variables.name(variable).to_string();
    let is_temp = *program.variables.kind(variable) == VariableKind::Temp;
    if fresh_assignments.is_empty() && is_temp && !uses.is_empty() {
        return Err(CompileError::internal(
            program,
            uses[0],
            format!("temp variable '{}' is used but never assigned", name),
        ));
    }
    let needs_free = if fresh_assignments.is_empty() {
        None
    } else {
        Some(fresh_assignments.iter().any(|fresh| *fresh))
    };
    if let Some(value) = needs_free {
        program.variables.set_needs_free(variable, value)?;
    }

    let Some((&first, rest)) = uses.split_first() else {
        trace!("variable '{}' is never touched", name);
        return Ok(None);
    };
    let tree = &program.tree;
    let start = tree.path_to(first);
    let mut earliest = climb_to_statement(tree, &start);
    let mut latest = earliest.clone();
    for node in rest {
        let path = tree.path_to(*node);
        earliest = select_statement(tree, &earliest, &path, SelectMode::First);
        latest = select_statement(tree, &latest, &path, SelectMode::Last);
    }
    let (Some(&first_use), Some(&last_use)) = (earliest.last(), latest.last()) else {
        return Err(CompileError::internal(program, first, "empty live range"));
    };
    program.variables.set_live_range(variable, first_use, last_use);

    let shared = sharing.is_shared(&program.tree, &program.variables, variable);
    let mut readers: HashSet<VariableId> = aliases.iter().map(|(alias, _)| *alias).collect();
    readers.insert(variable);
    let late_declaration = !shared && is_plain_assignment(&program.tree, first_use, variable, &readers);
    let mut delete_scope = None;
    if late_declaration {
        delete_scope = match program.tree.kind(last_use) {
            NodeKind::DelVariable { variable: deleted, .. } if *deleted == variable => Some(last_use),
            _ => None,
        };
        program.variables.mark_late_declaration(variable, delete_scope);
    }
    trace!(
        "variable '{}': range {}..{}, needs_free={:?}, late={}",
        name,
        first_use,
        last_use,
        needs_free,
        late_declaration
    );
    Ok(Some(LifetimeDecision {
        variable,
        needs_free,
        first_use,
        last_use,
        late_declaration,
        delete_scope,
    }))
}

/// An assignment to `variable` whose source reads none of `readers`.
fn is_plain_assignment(
    tree: &Tree,
    statement: NodeId,
    variable: VariableId,
    readers: &HashSet<VariableId>,
) -> bool {
    let NodeKind::AssignVariable { variable: target, source } = tree.kind(statement) else {
        return false;
    };
    *target == variable
        && !tree
            .preorder_from(*source)
            .into_iter()
            .any(|id| matches!(tree.kind(id), NodeKind::VariableRef { variable: v } if readers.contains(v)))
}

/// Closure references to `variable` owned by comprehensions running in the
/// variable's own frame, each with the outermost of those comprehensions.
/// Follows references transitively, like the sharing walk, but only through
/// comprehension scopes.
fn frame_aliases(program: &Program, variable: VariableId) -> Vec<(VariableId, NodeId)> {
    let tree = &program.tree;
    let owner = program.variables.owner(variable);
    let home = entry_point(tree, owner);
    let mut aliases = Vec::new();
    let mut pending = program.variables.get(variable).references.clone();
    let mut seen = HashSet::new();
    while let Some(reference) = pending.pop() {
        if !seen.insert(reference) {
            continue;
        }
        let scope = program.variables.owner(reference);
        if entry_point(tree, scope) != home {
            continue;
        }
        let mut anchor = scope;
        while let Some(outer) = tree.enclosing_scope(anchor) {
            if outer == owner {
                break;
            }
            anchor = outer;
        }
        aliases.push((reference, anchor));
        pending.extend(program.variables.get(reference).references.iter().copied());
    }
    aliases
}

// ── Temp variables ──────────────────────────────────────────────────

/// Record on every scope node the temp variables it owns and touches.
///
/// A temp counts for a scope when some node evaluated by that scope reads,
/// assigns, deletes or releases it. Temps created but never touched do not
/// appear.
pub fn finalize_temp_variables(
    program: &mut Program,
) -> Result<BTreeMap<NodeId, BTreeSet<VariableId>>, CompileError> {
    let mut collected = BTreeMap::new();
    let mut stack = Vec::new();
    let root = program.tree.root();
    collect_temps(program, root, &mut stack, &mut collected);
    if !stack.is_empty() {
        return Err(CompileError::internal(program, root, "temp scope stack left unbalanced"));
    }
    for (scope, temps) in &collected {
        program.tree.set_temp_variables(*scope, temps.clone())?;
    }
    debug!(
        "temp pass: {} temp(s) across {} scope(s)",
        collected.values().map(BTreeSet::len).sum::<usize>(),
        collected.len()
    );
    Ok(collected)
}

fn collect_temps(
    program: &Program,
    id: NodeId,
    stack: &mut Vec<(NodeId, BTreeSet<VariableId>)>,
    collected: &mut BTreeMap<NodeId, BTreeSet<VariableId>>,
) {
    let kind = program.tree.kind(id);
    // `iterated` is evaluated before the contraction's own scope exists.
    if let NodeKind::Contraction { iterated, .. } = kind {
        collect_temps(program, *iterated, stack, collected);
    }

    let is_scope = kind.tag().is_scope();
    if is_scope {
        stack.push((id, BTreeSet::new()));
    }
    if let (Some(variable), Some((scope, temps))) = (kind.variable(), stack.last_mut()) {
        if *program.variables.kind(variable) == VariableKind::Temp
            && program.variables.owner(variable) == *scope
        {
            temps.insert(variable);
        }
    }
    for (slot, child) in kind.children() {
        if is_scope && slot.name == "iterated" {
            continue;
        }
        collect_temps(program, child, stack, collected);
    }
    if is_scope {
        if let Some((scope, temps)) = stack.pop() {
            collected.insert(scope, temps);
        }
    }
}
