//! Structural dumps of a program, for diagnostics and golden tests.

use crate::nodes::{NodeId, NodeKind, NodeTag};
use crate::Program;
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Serialize)]
pub struct DumpNode {
    pub id: NodeId,
    pub slot: Option<String>,
    pub tag: NodeTag,
    pub label: String,
    pub line: usize,
    pub children: Vec<DumpNode>,
}

impl Program {
    /// One-line description of a node, using variable names.
    pub fn describe(&self, id: NodeId) -> String {
        let kind = self.tree.kind(id);
        let tag = kind.tag().name();
        let var = |v| self.variables.name(v).to_string();
        let mut label = match kind {
            NodeKind::Module { name, .. }
            | NodeKind::Function { name, .. }
            | NodeKind::Class { name, .. } => format!("{} '{}'", tag, name),
            NodeKind::Contraction { kind, .. } => format!("{} {}", tag, kind),
            NodeKind::AssignVariable { variable, .. }
            | NodeKind::ReleaseVariable { variable }
            | NodeKind::VariableRef { variable } => format!("{} {}", tag, var(*variable)),
            NodeKind::DelVariable { variable, tolerant } => {
                if *tolerant {
                    format!("{} {} (tolerant)", tag, var(*variable))
                } else {
                    format!("{} {}", tag, var(*variable))
                }
            }
            NodeKind::Constant { value } => format!("{} {}", tag, value),
            NodeKind::AttributeLookup { attribute, .. }
            | NodeKind::SpecialAttributeLookup { attribute, .. } => {
                format!("{} .{}", tag, attribute)
            }
            NodeKind::BinaryOp { op, .. } => format!("{} {}", tag, op),
            NodeKind::ImportModule { module } => format!("{} {}", tag, module),
            _ => tag.to_string(),
        };
        if let Some(temps) = kind.temp_variables() {
            if !temps.is_empty() {
                let names: Vec<String> = temps.iter().map(|t| var(*t)).collect();
                let _ = write!(label, " temps=[{}]", names.join(", "));
            }
        }
        label
    }

    /// Indented text dump of the whole tree.
    pub fn dump(&self) -> String {
        self.dump_from(self.tree.root())
    }

    pub fn dump_from(&self, start: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, start, None, 0);
        out
    }

    fn dump_into(&self, out: &mut String, id: NodeId, slot: Option<String>, depth: usize) {
        let indent = "  ".repeat(depth);
        let prefix = slot.map(|s| format!("{}: ", s)).unwrap_or_default();
        let _ = writeln!(
            out,
            "{}{}{} @ {}",
            indent,
            prefix,
            self.describe(id),
            self.tree.source(id)
        );
        for (slot, child) in self.tree.kind(id).children() {
            self.dump_into(out, child, Some(slot.to_string()), depth + 1);
        }
    }

    pub fn dump_tree(&self, id: NodeId) -> DumpNode {
        self.dump_node(id, None)
    }

    fn dump_node(&self, id: NodeId, slot: Option<String>) -> DumpNode {
        DumpNode {
            id,
            slot,
            tag: self.tree.tag(id),
            label: self.describe(id),
            line: self.tree.source(id).line,
            children: self
                .tree
                .kind(id)
                .children()
                .into_iter()
                .map(|(slot, child)| self.dump_node(child, Some(slot.to_string())))
                .collect(),
        }
    }

    /// JSON form of [`Program::dump`], for external viewers.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.dump_tree(self.tree.root()))
    }
}
