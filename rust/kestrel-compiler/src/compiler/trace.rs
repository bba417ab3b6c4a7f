//! Variable traces: which value of a variable each use can observe.
//!
//! Every scope is walked once in execution order while a map from variable
//! to its current trace is threaded through. An assignment or deletion starts
//! a new trace; where control flow joins, a merge trace names the traces that
//! can arrive there. Uses and releases are recorded on the trace current at
//! that point.
//!
//! Loops get their merge traces up front, for every variable written in the
//! body, and have them patched with the back-edge states once the body has
//! been walked. A `try` handler starts from the merge of the state before the
//! tried block and the state after each of its statements.
//!
//! Nested function and class bodies are separate scopes with their own walk.
//! The `iterated` operand of a contraction is evaluated by the surrounding
//! scope.

use crate::CompileError;
use kestrel_core::{NodeId, NodeKind, Program, VariableId, VariableKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TraceId(u32);

impl TraceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceKind {
    /// Parameter value bound on entry.
    Init,
    /// Scope-local variable before any assignment.
    Uninit,
    /// Value set outside this scope's view.
    Unknown,
    Assign {
        node: NodeId,
        source: NodeId,
        /// The assigned value may be a new reference the variable then owns.
        fresh: bool,
    },
    Deleted {
        node: NodeId,
    },
    Merge {
        previous: Vec<TraceId>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableTrace {
    pub variable: VariableId,
    pub scope: NodeId,
    pub kind: TraceKind,
    /// Reads of the variable while this trace was current.
    pub usages: Vec<NodeId>,
    /// `del` and release statements that ended this trace.
    pub releases: Vec<NodeId>,
    /// Reads and releases recorded on a merge trace this one flows into.
    pub merge_usages: Vec<NodeId>,
}

impl VariableTrace {
    pub fn is_merge(&self) -> bool {
        matches!(self.kind, TraceKind::Merge { .. })
    }

    pub fn is_assign(&self) -> bool {
        matches!(self.kind, TraceKind::Assign { .. })
    }

    /// Every node that touches the value of this trace, assignment included.
    pub fn touching_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        let assign = match self.kind {
            TraceKind::Assign { node, .. } | TraceKind::Deleted { node } => Some(node),
            _ => None,
        };
        assign
            .into_iter()
            .chain(self.usages.iter().copied())
            .chain(self.releases.iter().copied())
            .chain(self.merge_usages.iter().copied())
    }
}

/// All traces of a program.
#[derive(Debug, Default, Serialize)]
pub struct TraceCollection {
    traces: Vec<VariableTrace>,
    by_variable: BTreeMap<VariableId, Vec<TraceId>>,
}

impl TraceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn get(&self, id: TraceId) -> &VariableTrace {
        &self.traces[id.index()]
    }

    fn get_mut(&mut self, id: TraceId) -> &mut VariableTrace {
        &mut self.traces[id.index()]
    }

    /// Traces of `variable` in creation order.
    pub fn traces_of(&self, variable: VariableId) -> &[TraceId] {
        self.by_variable
            .get(&variable)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn variables(&self) -> impl Iterator<Item = VariableId> + '_ {
        self.by_variable.keys().copied()
    }

    fn push(&mut self, variable: VariableId, scope: NodeId, kind: TraceKind) -> TraceId {
        let id = TraceId(self.traces.len() as u32);
        self.traces.push(VariableTrace {
            variable,
            scope,
            kind,
            usages: Vec::new(),
            releases: Vec::new(),
            merge_usages: Vec::new(),
        });
        self.by_variable.entry(variable).or_default().push(id);
        id
    }

    /// Non-merge traces a merge can be reached from, or `id` itself when it
    /// is not a merge.
    pub fn reachable_non_merge(&self, id: TraceId) -> Vec<TraceId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            match &self.get(current).kind {
                TraceKind::Merge { previous } => pending.extend(previous.iter().rev().copied()),
                _ => out.push(current),
            }
        }
        out
    }
}

/// Whether the value of `source` may be a new reference. Constants are
/// immortal and never are.
pub fn may_provide_reference(source: &NodeKind) -> bool {
    !matches!(source, NodeKind::Constant { .. })
}

/// Collect traces for every scope of `program`.
pub fn collect_program(program: &Program) -> Result<TraceCollection, CompileError> {
    let mut traces = TraceCollection::new();
    for scope in program.tree.scopes() {
        collect_scope(program, scope, &mut traces)?;
    }
    Ok(traces)
}

type State = BTreeMap<VariableId, TraceId>;

#[derive(Debug, Default)]
struct LoopFrame {
    breaks: Vec<State>,
    continues: Vec<State>,
}

/// Collect the traces of one scope into `traces`.
pub fn collect_scope(
    program: &Program,
    scope: NodeId,
    traces: &mut TraceCollection,
) -> Result<(), CompileError> {
    let first = traces.len();
    let mut collector = ScopeCollector {
        program,
        scope,
        traces,
        loops: Vec::new(),
    };
    let entry = collector.entry_state();
    if let Some(body) = program.tree.kind(scope).scope_body() {
        collector.statement(body, entry)?;
    }
    collector.propagate_merge_usages(first);
    debug!(
        "collected {} trace(s) for {}",
        collector.traces.len() - first,
        program.describe(scope)
    );
    Ok(())
}

struct ScopeCollector<'a> {
    program: &'a Program,
    scope: NodeId,
    traces: &'a mut TraceCollection,
    loops: Vec<LoopFrame>,
}

impl ScopeCollector<'_> {
    fn internal(&self, node: NodeId, message: impl Into<String>) -> CompileError {
        CompileError::internal(self.program, node, message)
    }

    /// Start traces for every variable the scope owns or its code touches.
    fn entry_state(&mut self) -> State {
        let mut touched: BTreeSet<VariableId> =
            self.program.variables.owned_by(self.scope).into_iter().collect();
        for id in self.program.tree.scope_preorder(self.scope) {
            if let Some(variable) = self.program.tree.kind(id).variable() {
                touched.insert(variable);
            }
        }

        let mut state = State::new();
        for variable in touched {
            let owned = self.program.variables.owner(variable) == self.scope;
            let kind = match self.program.variables.kind(variable) {
                VariableKind::Parameter | VariableKind::NestedParameter { .. } if owned => {
                    TraceKind::Init
                }
                VariableKind::Local | VariableKind::LocalLoop | VariableKind::Temp if owned => {
                    TraceKind::Uninit
                }
                _ => TraceKind::Unknown,
            };
            let trace = self.traces.push(variable, self.scope, kind);
            state.insert(variable, trace);
        }
        state
    }

    fn new_trace(&mut self, variable: VariableId, kind: TraceKind) -> TraceId {
        self.traces.push(variable, self.scope, kind)
    }

    /// Trace of `variable` current at `node`. Every trace reachable there
    /// must be grounded in a non-merge trace.
    fn current(&self, state: &State, variable: VariableId, node: NodeId) -> Result<TraceId, CompileError> {
        let Some(trace) = state.get(&variable).copied() else {
            return Err(self.internal(
                node,
                format!(
                    "variable '{}' has no trace in {}",
                    self.program.variables.name(variable),
                    self.program.describe(self.scope)
                ),
            ));
        };
        if self.traces.reachable_non_merge(trace).is_empty() {
            return Err(self.internal(
                node,
                format!(
                    "use of '{}' sees only merge traces",
                    self.program.variables.name(variable)
                ),
            ));
        }
        Ok(trace)
    }

    fn merge(&mut self, states: Vec<State>) -> Option<State> {
        let mut states = states.into_iter();
        let mut merged = states.next()?;
        let rest: Vec<State> = states.collect();
        if rest.is_empty() {
            return Some(merged);
        }
        let variables: Vec<VariableId> = merged.keys().copied().collect();
        for variable in variables {
            let mut previous = vec![merged[&variable]];
            for state in &rest {
                if let Some(trace) = state.get(&variable) {
                    if !previous.contains(trace) {
                        previous.push(*trace);
                    }
                }
            }
            if previous.len() > 1 {
                let trace = self.new_trace(variable, TraceKind::Merge { previous });
                merged.insert(variable, trace);
            }
        }
        Some(merged)
    }

    /// Walk a statement; `None` means control does not fall through.
    fn statement(&mut self, id: NodeId, state: State) -> Result<Option<State>, CompileError> {
        let program = self.program;
        match program.tree.kind(id) {
            NodeKind::StatementsSequence { statements } => {
                let mut state = Some(state);
                for statement in statements {
                    let Some(current) = state else { break };
                    state = self.statement(*statement, current)?;
                }
                Ok(state)
            }
            NodeKind::AssignVariable { variable, source } => {
                self.expression(*source, &state)?;
                let fresh = may_provide_reference(program.tree.kind(*source));
                let trace = self.new_trace(
                    *variable,
                    TraceKind::Assign {
                        node: id,
                        source: *source,
                        fresh,
                    },
                );
                let mut state = state;
                state.insert(*variable, trace);
                Ok(Some(state))
            }
            NodeKind::DelVariable { variable, .. } | NodeKind::ReleaseVariable { variable } => {
                let previous = self.current(&state, *variable, id)?;
                self.traces.get_mut(previous).releases.push(id);
                let trace = self.new_trace(*variable, TraceKind::Deleted { node: id });
                let mut state = state;
                state.insert(*variable, trace);
                Ok(Some(state))
            }
            NodeKind::Expression { expression } => {
                self.expression(*expression, &state)?;
                Ok(Some(state))
            }
            NodeKind::Pass => Ok(Some(state)),
            NodeKind::If {
                condition,
                yes_branch,
                no_branch,
            } => {
                self.expression(*condition, &state)?;
                let yes = match yes_branch {
                    Some(branch) => self.statement(*branch, state.clone())?,
                    None => Some(state.clone()),
                };
                let no = match no_branch {
                    Some(branch) => self.statement(*branch, state)?,
                    None => Some(state),
                };
                Ok(self.merge(yes.into_iter().chain(no).collect()))
            }
            NodeKind::Loop { body } => self.loop_statement(*body, state),
            NodeKind::Break => {
                let frame = self
                    .loops
                    .last_mut()
                    .ok_or_else(|| CompileError::internal(program, id, "break outside a loop"))?;
                frame.breaks.push(state);
                Ok(None)
            }
            NodeKind::Continue => {
                let frame = self
                    .loops
                    .last_mut()
                    .ok_or_else(|| CompileError::internal(program, id, "continue outside a loop"))?;
                frame.continues.push(state);
                Ok(None)
            }
            NodeKind::Try { tried, handler } => {
                let before = state.clone();
                let mut handler_entry = vec![before];
                let after_tried = match program.tree.kind(*tried) {
                    NodeKind::StatementsSequence { statements } => {
                        let mut current = Some(state);
                        for statement in statements {
                            let Some(s) = current else { break };
                            current = self.statement(*statement, s)?;
                            if let Some(s) = &current {
                                handler_entry.push(s.clone());
                            }
                        }
                        current
                    }
                    _ => {
                        let after = self.statement(*tried, state)?;
                        handler_entry.extend(after.clone());
                        after
                    }
                };
                let after_handler = match handler {
                    Some(handler) => match self.merge(handler_entry) {
                        Some(entry) => self.statement(*handler, entry)?,
                        None => None,
                    },
                    None => None,
                };
                Ok(self.merge(after_tried.into_iter().chain(after_handler).collect()))
            }
            NodeKind::Return { expression } => {
                self.expression(*expression, &state)?;
                Ok(None)
            }
            NodeKind::Raise { exception } => {
                self.expression(*exception, &state)?;
                Ok(None)
            }
            other => Err(self.internal(
                id,
                format!("expected a statement, found {}", other.tag().name()),
            )),
        }
    }

    fn loop_statement(&mut self, body: Option<NodeId>, state: State) -> Result<Option<State>, CompileError> {
        let program = self.program;
        let written: BTreeSet<VariableId> = match body {
            Some(body) => program
                .tree
                .preorder_from(body)
                .into_iter()
                .filter_map(|id| match program.tree.kind(id) {
                    NodeKind::AssignVariable { variable, .. }
                    | NodeKind::DelVariable { variable, .. }
                    | NodeKind::ReleaseVariable { variable } => Some(*variable),
                    _ => None,
                })
                .filter(|v| state.contains_key(v))
                .collect(),
            None => BTreeSet::new(),
        };

        let mut state = state;
        let mut loop_merges = BTreeMap::new();
        for variable in written {
            let previous = state[&variable];
            let merge = self.new_trace(
                variable,
                TraceKind::Merge {
                    previous: vec![previous],
                },
            );
            state.insert(variable, merge);
            loop_merges.insert(variable, merge);
        }

        self.loops.push(LoopFrame::default());
        let end = match body {
            Some(body) => self.statement(body, state)?,
            None => Some(state),
        };
        let frame = self.loops.pop().unwrap_or_default();

        let back_edges: Vec<State> = frame.continues.into_iter().chain(end).collect();
        for (variable, merge) in loop_merges {
            for edge in &back_edges {
                let Some(trace) = edge.get(&variable).copied() else { continue };
                if trace == merge {
                    continue;
                }
                if let TraceKind::Merge { previous } = &mut self.traces.get_mut(merge).kind {
                    if !previous.contains(&trace) {
                        previous.push(trace);
                    }
                }
            }
        }
        Ok(self.merge(frame.breaks))
    }

    fn expression(&mut self, id: NodeId, state: &State) -> Result<(), CompileError> {
        let program = self.program;
        match program.tree.kind(id) {
            NodeKind::VariableRef { variable } => {
                let trace = self.current(state, *variable, id)?;
                self.traces.get_mut(trace).usages.push(id);
            }
            NodeKind::FunctionCreation { .. } | NodeKind::ClassCreation { .. } => {}
            NodeKind::Contraction { iterated, .. } => self.expression(*iterated, state)?,
            kind if kind.tag().is_expression() => {
                for (_, child) in kind.children() {
                    self.expression(child, state)?;
                }
            }
            other => {
                return Err(self.internal(
                    id,
                    format!("expected an expression, found {}", other.tag().name()),
                ))
            }
        }
        Ok(())
    }

    /// Copy the uses recorded on this scope's merge traces onto every
    /// non-merge trace they can observe.
    fn propagate_merge_usages(&mut self, first: usize) {
        for index in first..self.traces.len() {
            let id = TraceId(index as u32);
            let trace = self.traces.get(id);
            if !trace.is_merge() {
                continue;
            }
            let nodes: Vec<NodeId> = trace
                .usages
                .iter()
                .chain(trace.releases.iter())
                .copied()
                .collect();
            if nodes.is_empty() {
                continue;
            }
            for target in self.traces.reachable_non_merge(id) {
                let target = self.traces.get_mut(target);
                for node in &nodes {
                    if !target.merge_usages.contains(node) {
                        target.merge_usages.push(*node);
                    }
                }
            }
        }
    }
}
