//! Attribute prediction.
//!
//! An attribute lookup is predicted by the handler registered for the node
//! kind of its source expression. A handler may replace the lookup with a
//! computed node and may declare the lookup certain to succeed or certain to
//! raise. Lookups whose source kind has no handler are left alone, and what
//! the optimizer knew about the source is dropped, since a lookup can run
//! arbitrary code.

use super::knowledge::{OptimizerKnowledge, TypeShape};
use crate::CompileError;
use kestrel_core::{Constant, ContractionKind, NodeId, NodeKind, NodeTag, Program};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an attribute handler for {tag:?} nodes is already registered")]
    DuplicateHandler { tag: NodeTag },
    #[error("{tag:?} nodes cannot have attribute handlers")]
    NotAnExpression { tag: NodeTag },
}

/// The lookup a handler is asked about.
#[derive(Debug, Clone, Copy)]
pub struct AttributeQuery<'a> {
    pub lookup: NodeId,
    pub source: NodeId,
    pub attribute: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeOutcome {
    /// Detached node to put in place of the lookup.
    pub replacement: Option<NodeId>,
    pub definitely_safe: bool,
    pub definitely_raises: bool,
}

impl AttributeOutcome {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn raises() -> Self {
        Self {
            definitely_raises: true,
            ..Self::default()
        }
    }

    pub fn safe() -> Self {
        Self {
            definitely_safe: true,
            ..Self::default()
        }
    }

    pub fn replaced_by(node: NodeId) -> Self {
        Self {
            replacement: Some(node),
            definitely_safe: true,
            definitely_raises: false,
        }
    }
}

pub type AttributeHandler =
    fn(&mut Program, &OptimizerKnowledge, &AttributeQuery<'_>) -> AttributeOutcome;

/// Result of predicting one lookup.
#[derive(Debug, Clone, Serialize)]
pub struct AttributePrediction {
    pub lookup: NodeId,
    pub attribute: String,
    pub source_tag: NodeTag,
    /// False when no handler was consulted.
    pub handled: bool,
    pub replacement: Option<NodeId>,
    pub definitely_safe: bool,
    pub definitely_raises: bool,
}

#[derive(Debug, Default)]
pub struct AttributeRegistry {
    handlers: HashMap<NodeTag, AttributeHandler>,
}

impl AttributeRegistry {
    /// Registry without any handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers for constants, function and class
    /// creations, module imports and variables of known shape.
    pub fn with_builtin_handlers() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register_attribute_handler(NodeTag::Constant, constant_attribute)?;
        registry.register_attribute_handler(NodeTag::FunctionCreation, creation_attribute)?;
        registry.register_attribute_handler(NodeTag::ClassCreation, creation_attribute)?;
        registry.register_attribute_handler(NodeTag::ImportModule, module_attribute)?;
        registry.register_attribute_handler(NodeTag::VariableRef, variable_attribute)?;
        Ok(registry)
    }

    /// Install the handler for lookups on `tag` nodes. One handler per kind.
    pub fn register_attribute_handler(
        &mut self,
        tag: NodeTag,
        handler: AttributeHandler,
    ) -> Result<(), RegistryError> {
        if !tag.is_expression() {
            return Err(RegistryError::NotAnExpression { tag });
        }
        if self.handlers.contains_key(&tag) {
            return Err(RegistryError::DuplicateHandler { tag });
        }
        self.handlers.insert(tag, handler);
        Ok(())
    }

    pub fn has_handler(&self, tag: NodeTag) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Predict the lookup at `lookup`, applying the handler's replacement.
    pub fn compute_attribute(
        &self,
        program: &mut Program,
        knowledge: &mut OptimizerKnowledge,
        lookup: NodeId,
    ) -> Result<AttributePrediction, CompileError> {
        let (source, attribute, special) = match program.tree.kind(lookup) {
            NodeKind::AttributeLookup { source, attribute } => (*source, attribute.clone(), false),
            NodeKind::SpecialAttributeLookup { source, attribute } => {
                (*source, attribute.clone(), true)
            }
            other => {
                return Err(CompileError::internal(
                    program,
                    lookup,
                    format!("attribute prediction on a {} node", other.tag().name()),
                ))
            }
        };
        let source_tag = program.tree.tag(source);
        let unhandled = AttributePrediction {
            lookup,
            attribute: attribute.clone(),
            source_tag,
            handled: false,
            replacement: None,
            definitely_safe: false,
            definitely_raises: false,
        };

        // Implementation slots are never predicted.
        if special {
            knowledge.remove_knowledge(program, source);
            return Ok(unhandled);
        }
        let Some(handler) = self.handlers.get(&source_tag) else {
            knowledge.remove_knowledge(program, source);
            return Ok(unhandled);
        };

        let query = AttributeQuery {
            lookup,
            source,
            attribute: &attribute,
        };
        let outcome = handler(program, knowledge, &query);
        if outcome.definitely_safe && outcome.definitely_raises {
            return Err(CompileError::internal(
                program,
                lookup,
                format!("handler for .{} claims both success and failure", attribute),
            ));
        }
        if let Some(replacement) = outcome.replacement {
            program.tree.replace_with(lookup, replacement)?;
            if let Some(shape) = TypeShape::of_node(program.tree.kind(replacement)) {
                knowledge.record_node(replacement, shape);
            }
            trace!(
                "replaced lookup .{} at {} with {}",
                attribute,
                program.tree.source(replacement),
                program.describe(replacement)
            );
        }
        Ok(AttributePrediction {
            handled: true,
            replacement: outcome.replacement,
            definitely_safe: outcome.definitely_safe,
            definitely_raises: outcome.definitely_raises,
            ..unhandled
        })
    }
}

/// Predict every attached lookup, operands before the lookups using them, so
/// a chain like `(1).real.imag` folds completely in one run.
pub fn predict_attributes(
    program: &mut Program,
    registry: &AttributeRegistry,
    knowledge: &mut OptimizerKnowledge,
) -> Result<Vec<AttributePrediction>, CompileError> {
    let mut lookups: Vec<NodeId> = program
        .tree
        .preorder()
        .into_iter()
        .filter(|id| {
            matches!(
                program.tree.tag(*id),
                NodeTag::AttributeLookup | NodeTag::SpecialAttributeLookup
            )
        })
        .collect();
    lookups.reverse();

    let mut predictions = Vec::with_capacity(lookups.len());
    for lookup in lookups {
        predictions.push(registry.compute_attribute(program, knowledge, lookup)?);
    }
    debug!(
        "predicted {} attribute lookup(s), {} replaced",
        predictions.len(),
        predictions.iter().filter(|p| p.replacement.is_some()).count()
    );
    Ok(predictions)
}

// ── Built-in handlers ───────────────────────────────────────────────

/// Attributes every object, `None` included, is guaranteed to have.
const OBJECT_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__doc__",
    "__eq__",
    "__hash__",
    "__ne__",
    "__repr__",
    "__str__",
    "__bool__",
];

fn none_attribute(attribute: &str) -> AttributeOutcome {
    if OBJECT_ATTRIBUTES.contains(&attribute) {
        AttributeOutcome::safe()
    } else {
        AttributeOutcome::raises()
    }
}

/// Lookups on a variable whose every assignment has the same known shape.
fn variable_attribute(
    program: &mut Program,
    knowledge: &OptimizerKnowledge,
    query: &AttributeQuery<'_>,
) -> AttributeOutcome {
    let NodeKind::VariableRef { variable } = program.tree.kind(query.source) else {
        return AttributeOutcome::unknown();
    };
    match knowledge.variable_shape(*variable) {
        Some(TypeShape::NoneType) => none_attribute(query.attribute),
        _ => AttributeOutcome::unknown(),
    }
}

fn constant_attribute(
    program: &mut Program,
    _knowledge: &OptimizerKnowledge,
    query: &AttributeQuery<'_>,
) -> AttributeOutcome {
    let NodeKind::Constant { value } = program.tree.kind(query.source) else {
        return AttributeOutcome::unknown();
    };
    let folded = match (value, query.attribute) {
        (Constant::None, attribute) => return none_attribute(attribute),
        (Constant::Int(n), "real" | "numerator") => Constant::Int(*n),
        (Constant::Int(_), "imag") => Constant::Int(0),
        (Constant::Int(_), "denominator") => Constant::Int(1),
        (Constant::Bool(b), "real" | "numerator") => Constant::Int(i64::from(*b)),
        (Constant::Bool(_), "imag") => Constant::Int(0),
        (Constant::Bool(_), "denominator") => Constant::Int(1),
        (Constant::Float(x), "real") => Constant::Float(*x),
        (Constant::Float(_), "imag") => Constant::Float(0.0),
        _ => return AttributeOutcome::unknown(),
    };
    let source = program.tree.source(query.lookup).clone();
    let node = program.tree.alloc(NodeKind::Constant { value: folded }, source);
    AttributeOutcome::replaced_by(node)
}

fn creation_attribute(
    program: &mut Program,
    _knowledge: &OptimizerKnowledge,
    query: &AttributeQuery<'_>,
) -> AttributeOutcome {
    let scope = match program.tree.kind(query.source) {
        NodeKind::FunctionCreation { function } => *function,
        NodeKind::ClassCreation { class } => *class,
        _ => return AttributeOutcome::unknown(),
    };
    let value = match query.attribute {
        "__name__" => scope_name(program, scope),
        "__qualname__" => qualified_name(program, scope),
        _ => return AttributeOutcome::unknown(),
    };
    let Some(value) = value else {
        return AttributeOutcome::unknown();
    };
    let source = program.tree.source(query.lookup).clone();
    let node = program.tree.alloc(
        NodeKind::Constant {
            value: Constant::Str(value),
        },
        source,
    );
    AttributeOutcome::replaced_by(node)
}

fn module_attribute(
    program: &mut Program,
    _knowledge: &OptimizerKnowledge,
    query: &AttributeQuery<'_>,
) -> AttributeOutcome {
    let NodeKind::ImportModule { module } = program.tree.kind(query.source) else {
        return AttributeOutcome::unknown();
    };
    if query.attribute != "__name__" {
        return AttributeOutcome::unknown();
    }
    let value = Constant::Str(module.clone());
    let source = program.tree.source(query.lookup).clone();
    let node = program.tree.alloc(NodeKind::Constant { value }, source);
    AttributeOutcome::replaced_by(node)
}

fn scope_name(program: &Program, scope: NodeId) -> Option<String> {
    match program.tree.kind(scope) {
        NodeKind::Function { name, .. } | NodeKind::Class { name, .. } => Some(name.clone()),
        _ => None,
    }
}

/// Dotted name of a function or class: enclosing classes and comprehensions
/// contribute their name, enclosing functions their name plus `<locals>`.
fn qualified_name(program: &Program, scope: NodeId) -> Option<String> {
    let mut parts = vec![scope_name(program, scope)?];
    let mut current = program.tree.enclosing_scope(scope);
    while let Some(outer) = current {
        match program.tree.kind(outer) {
            NodeKind::Function { name, .. } => {
                parts.push("<locals>".to_string());
                parts.push(name.clone());
            }
            NodeKind::Class { name, .. } => parts.push(name.clone()),
            NodeKind::Contraction { kind, .. } => {
                parts.push(
                    match kind {
                        ContractionKind::List => "<listcomp>",
                        ContractionKind::Set => "<setcomp>",
                        ContractionKind::Dict => "<dictcomp>",
                        ContractionKind::Generator => "<genexpr>",
                    }
                    .to_string(),
                );
            }
            NodeKind::Module { .. } => break,
            _ => {}
        }
        current = program.tree.enclosing_scope(outer);
    }
    parts.reverse();
    Some(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{ProgramBuilder, VariableId};

    fn lookup_program(attribute: &str, value: Constant) -> (Program, NodeId, NodeId) {
        let mut b = ProgramBuilder::new("m", "m.py");
        let x = b.local("x");
        let c = b.constant(value);
        let lookup = b.attr(c, attribute);
        let assign = b.assign(x, lookup);
        let program = b.finish(vec![assign]).unwrap();
        (program, lookup, assign)
    }

    fn assigned_value(program: &Program, assign: NodeId) -> &NodeKind {
        let source = program.tree.visitable_nodes(assign)[0];
        program.tree.kind(source)
    }

    #[test]
    fn int_real_folds_to_constant() {
        let (mut program, lookup, assign) = lookup_program("real", Constant::Int(7));
        let registry = AttributeRegistry::with_builtin_handlers().unwrap();
        let mut knowledge = OptimizerKnowledge::observe(&program);
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, lookup)
            .unwrap();
        assert!(prediction.handled && prediction.definitely_safe);
        assert_eq!(
            assigned_value(&program, assign),
            &NodeKind::Constant {
                value: Constant::Int(7)
            }
        );
        assert!(!program.tree.is_attached(lookup));
    }

    #[test]
    fn missing_attribute_on_none_raises() {
        let (mut program, lookup, _) = lookup_program("append", Constant::None);
        let registry = AttributeRegistry::with_builtin_handlers().unwrap();
        let mut knowledge = OptimizerKnowledge::new();
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, lookup)
            .unwrap();
        assert!(prediction.definitely_raises);
        assert!(!prediction.definitely_safe);
        assert!(program.tree.is_attached(lookup));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = AttributeRegistry::with_builtin_handlers().unwrap();
        let err = registry
            .register_attribute_handler(NodeTag::Constant, constant_attribute)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler { tag: NodeTag::Constant });
        let err = registry
            .register_attribute_handler(NodeTag::Pass, constant_attribute)
            .unwrap_err();
        assert_eq!(err, RegistryError::NotAnExpression { tag: NodeTag::Pass });
    }

    #[test]
    fn qualname_walks_enclosing_scopes() {
        let mut b = ProgramBuilder::new("m", "m.py");
        b.enter_class("C");
        b.enter_function("method");
        b.enter_function("inner");
        let p = b.pass();
        let inner = b.leave_scope(vec![p]).unwrap();
        let make_inner = b.function_creation(inner);
        let q = b.attr(make_inner, "__qualname__");
        let ret = b.ret(q);
        let method = b.leave_scope(vec![ret]).unwrap();
        let make_method = b.function_creation(method);
        let slot = b.local("method");
        let def = b.assign(slot, make_method);
        let class = b.leave_scope(vec![def]).unwrap();
        let make_class = b.class_creation(class);
        let name = b.local("C");
        let def_class = b.assign(name, make_class);
        let mut program = b.finish(vec![def_class]).unwrap();

        let registry = AttributeRegistry::with_builtin_handlers().unwrap();
        let mut knowledge = OptimizerKnowledge::new();
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, q)
            .unwrap();
        let replacement = prediction.replacement.unwrap();
        assert_eq!(
            program.tree.kind(replacement),
            &NodeKind::Constant {
                value: Constant::Str("C.method.<locals>.inner".to_string())
            }
        );
    }

    #[test]
    fn qualname_names_comprehensions_without_locals() {
        // def f(items):
        //     return [(lambda: None).__qualname__ for _ in items]
        let mut b = ProgramBuilder::new("m", "m.py");
        b.enter_function("f");
        let items = b.parameter("items").unwrap();
        let iterated = b.var_ref(items);
        b.enter_contraction(ContractionKind::List, iterated);
        b.enter_function("<lambda>");
        let none = b.none();
        let body = b.ret(none);
        let lambda = b.leave_scope(vec![body]).unwrap();
        let make = b.function_creation(lambda);
        let q = b.attr(make, "__qualname__");
        let element = b.expr_stmt(q);
        let comp = b.leave_scope(vec![element]).unwrap();
        let ret = b.ret(comp);
        let f = b.leave_scope(vec![ret]).unwrap();
        let make_f = b.function_creation(f);
        let slot = b.local("f");
        let def = b.assign(slot, make_f);
        let mut program = b.finish(vec![def]).unwrap();

        let registry = AttributeRegistry::with_builtin_handlers().unwrap();
        let mut knowledge = OptimizerKnowledge::new();
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, q)
            .unwrap();
        let replacement = prediction.replacement.unwrap();
        assert_eq!(
            program.tree.kind(replacement),
            &NodeKind::Constant {
                value: Constant::Str("f.<locals>.<listcomp>.<lambda>".to_string())
            }
        );
    }

    /// def f():
    ///     x = None
    ///     x.<attribute>
    fn none_variable_lookup(attribute: &str) -> (Program, VariableId, NodeId) {
        let mut b = ProgramBuilder::new("m", "m.py");
        b.enter_function("f");
        let x = b.local("x");
        let none = b.none();
        let assign = b.assign(x, none);
        let r = b.var_ref(x);
        let lookup = b.attr(r, attribute);
        let stmt = b.expr_stmt(lookup);
        let f = b.leave_scope(vec![assign, stmt]).unwrap();
        let make = b.function_creation(f);
        let slot = b.local("f");
        let def = b.assign(slot, make);
        (b.finish(vec![def]).unwrap(), x, lookup)
    }

    #[test]
    fn unhandled_lookup_forgets_the_variable() {
        let (mut program, x, lookup) = none_variable_lookup("foo");
        let registry = AttributeRegistry::new();
        let mut knowledge = OptimizerKnowledge::observe(&program);
        assert_eq!(knowledge.variable_shape(x), Some(TypeShape::NoneType));

        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, lookup)
            .unwrap();
        assert!(!prediction.handled);
        assert_eq!(prediction.source_tag, NodeTag::VariableRef);
        assert_eq!(knowledge.variable_shape(x), None);
        assert!(program.tree.is_attached(lookup));
    }

    #[test]
    fn none_shaped_variable_predicts_like_none() {
        let registry = AttributeRegistry::with_builtin_handlers().unwrap();

        let (mut program, x, lookup) = none_variable_lookup("foo");
        let mut knowledge = OptimizerKnowledge::observe(&program);
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, lookup)
            .unwrap();
        assert!(prediction.handled && prediction.definitely_raises);
        assert!(program.tree.is_attached(lookup));
        assert_eq!(knowledge.variable_shape(x), Some(TypeShape::NoneType));

        let (mut program, _, lookup) = none_variable_lookup("__class__");
        let mut knowledge = OptimizerKnowledge::observe(&program);
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, lookup)
            .unwrap();
        assert!(prediction.handled && prediction.definitely_safe);

        // Without knowledge the variable could be anything.
        let (mut program, _, lookup) = none_variable_lookup("foo");
        let mut knowledge = OptimizerKnowledge::new();
        let prediction = registry
            .compute_attribute(&mut program, &mut knowledge, lookup)
            .unwrap();
        assert!(prediction.handled);
        assert!(!prediction.definitely_raises && !prediction.definitely_safe);
    }
}
