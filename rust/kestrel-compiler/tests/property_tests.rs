//! Randomised checks of the analysis invariants.
//!
//! Programs and call sequences come from a small deterministic LCG, so every
//! failure reproduces from its seed.

use kestrel_compiler::compiler::cleanup::cleanup;
use kestrel_compiler::compiler::finalize::{select_statement, SelectMode};
use kestrel_compiler::compiler::fixpoint::DEFAULT_MAX_RESTARTS;
use kestrel_compiler::compiler::identifiers::{
    ConsumedProxyIdentifier, EmitContext, Identifier, OwnershipOp, ValueHandle,
};
use kestrel_core::{
    ContractionKind, NodeId, NodeKind, NodeTag, Program, ProgramBuilder, Tree, VariableId,
    VariableKind,
};
use std::collections::BTreeSet;

/// Simple deterministic LCG pseudo-random number generator.
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        // LCG parameters from Numerical Recipes
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn below(&mut self, n: usize) -> usize {
        ((self.next() >> 33) as usize) % n
    }

    fn next_bool(&mut self) -> bool {
        (self.next() >> 40) & 1 == 1
    }

    fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.below(items.len())]
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}

const NAMES: [&str; 4] = ["a", "b", "c", "d"];

// ── Sharing ─────────────────────────────────────────────────────────

enum FrameKind {
    Module,
    Function,
    Contraction,
}

struct Frame {
    kind: FrameKind,
    statements: Vec<NodeId>,
}

/// Random nest of functions and comprehensions that define and read a few
/// names. Returns the program and every variable defined by assignment.
fn random_scopes(rng: &mut Rng) -> (Program, Vec<VariableId>) {
    let mut b = ProgramBuilder::new("m", "m.py");
    let mut frames = vec![Frame {
        kind: FrameKind::Module,
        statements: Vec::new(),
    }];
    let mut defined = Vec::new();
    let mut functions = 0;

    for _ in 0..40 {
        let depth = frames.len();
        match rng.below(5) {
            0 if depth < 6 => {
                functions += 1;
                b.enter_function(&format!("f{}", functions));
                frames.push(Frame {
                    kind: FrameKind::Function,
                    statements: Vec::new(),
                });
            }
            1 if depth < 6 && depth > 1 => {
                let iterated = b.none();
                b.enter_contraction(ContractionKind::Generator, iterated);
                frames.push(Frame {
                    kind: FrameKind::Contraction,
                    statements: Vec::new(),
                });
            }
            2 if depth > 1 => {
                let name = *rng.choose(&NAMES);
                let variable = b.local(name);
                let value = b.none();
                let assign = b.assign(variable, value);
                frames[depth - 1].statements.push(assign);
                defined.push(variable);
            }
            3 => {
                let name = *rng.choose(&NAMES);
                let variable = b.reference(name);
                let read = b.var_ref(variable);
                let stmt = b.expr_stmt(read);
                frames[depth - 1].statements.push(stmt);
            }
            4 if depth > 1 => close_frame(&mut b, &mut frames),
            _ => {}
        }
    }
    while frames.len() > 1 {
        close_frame(&mut b, &mut frames);
    }
    let Some(module) = frames.pop() else {
        unreachable!()
    };
    (b.finish(module.statements).unwrap(), defined)
}

fn close_frame(b: &mut ProgramBuilder, frames: &mut Vec<Frame>) {
    let Some(frame) = frames.pop() else { return };
    let mut body = frame.statements;
    if body.is_empty() {
        body.push(b.pass());
    }
    let scope = b.leave_scope(body).unwrap();
    let value = match frame.kind {
        FrameKind::Function => b.function_creation(scope),
        FrameKind::Contraction => scope,
        FrameKind::Module => unreachable!(),
    };
    let stmt = b.expr_stmt(value);
    if let Some(parent) = frames.last_mut() {
        parent.statements.push(stmt);
    }
}

/// Function frame running the code of `scope`, found by climbing parent
/// links out of comprehensions.
fn frame_of(tree: &Tree, scope: NodeId) -> NodeId {
    let mut current = scope;
    while tree.tag(current) == NodeTag::Contraction {
        let mut up = tree.parent(current).unwrap();
        while !tree.tag(up).is_scope() {
            up = tree.parent(up).unwrap();
        }
        current = up;
    }
    current
}

/// Closure references reaching `variable`, found by scanning the whole
/// table until nothing new turns up.
fn brute_force_shared(program: &Program, variable: VariableId) -> bool {
    let mut reached = BTreeSet::from([variable]);
    loop {
        let before = reached.len();
        for (id, v) in program.variables.iter() {
            if let VariableKind::ClosureReference { target } = v.kind {
                if reached.contains(&target) {
                    reached.insert(id);
                }
            }
        }
        if reached.len() == before {
            break;
        }
    }
    let home = frame_of(&program.tree, program.variables.owner(variable));
    reached
        .iter()
        .any(|r| frame_of(&program.tree, program.variables.owner(*r)) != home)
}

#[test]
fn sharing_matches_brute_force_search() {
    for seed in 0..200 {
        let mut rng = Rng::new(seed);
        let (program, defined) = random_scopes(&mut rng);
        for variable in defined {
            assert_eq!(
                program.is_shared(variable),
                brute_force_shared(&program, variable),
                "seed {} variable {}\n{}",
                seed,
                program.variables.name(variable),
                program.dump()
            );
        }
    }
}

#[test]
fn doubly_nested_comprehension_is_not_a_boundary() {
    // def f():
    //     x = None
    //     ((x for _ in None) for _ in None)
    let mut b = ProgramBuilder::new("m", "m.py");
    b.enter_function("f");
    let x = b.local("x");
    let none = b.none();
    let assign = b.assign(x, none);
    let outer_iter = b.none();
    b.enter_contraction(ContractionKind::Generator, outer_iter);
    let inner_iter = b.none();
    b.enter_contraction(ContractionKind::Generator, inner_iter);
    let xr = b.reference("x");
    let read = b.var_ref(xr);
    let element = b.expr_stmt(read);
    let inner = b.leave_scope(vec![element]).unwrap();
    let inner_stmt = b.expr_stmt(inner);
    let outer = b.leave_scope(vec![inner_stmt]).unwrap();
    let outer_stmt = b.expr_stmt(outer);
    let f = b.leave_scope(vec![assign, outer_stmt]).unwrap();
    let make = b.function_creation(f);
    let top = b.expr_stmt(make);
    let program = b.finish(vec![top]).unwrap();

    // One closure reference per comprehension crossed.
    assert_eq!(program.variables.get(x).references.len(), 1);
    assert!(!program.is_shared(x));
    assert!(!brute_force_shared(&program, x));
}

#[test]
fn function_inside_nested_comprehensions_shares() {
    // def f():
    //     x = None
    //     (((lambda: x) for _ in None) for _ in None)
    let mut b = ProgramBuilder::new("m", "m.py");
    b.enter_function("f");
    let x = b.local("x");
    let none = b.none();
    let assign = b.assign(x, none);
    let outer_iter = b.none();
    b.enter_contraction(ContractionKind::Generator, outer_iter);
    let inner_iter = b.none();
    b.enter_contraction(ContractionKind::Generator, inner_iter);
    b.enter_function("<lambda>");
    let xr = b.reference("x");
    let read = b.var_ref(xr);
    let ret = b.ret(read);
    let lambda = b.leave_scope(vec![ret]).unwrap();
    let make_lambda = b.function_creation(lambda);
    let element = b.expr_stmt(make_lambda);
    let inner = b.leave_scope(vec![element]).unwrap();
    let inner_stmt = b.expr_stmt(inner);
    let outer = b.leave_scope(vec![inner_stmt]).unwrap();
    let outer_stmt = b.expr_stmt(outer);
    let f = b.leave_scope(vec![assign, outer_stmt]).unwrap();
    let make = b.function_creation(f);
    let top = b.expr_stmt(make);
    let program = b.finish(vec![top]).unwrap();

    assert!(program.is_shared(x));
    assert!(brute_force_shared(&program, x));
}

// ── Statement selection ─────────────────────────────────────────────

/// Random nest of statements inside one function that assign and read `x`.
fn random_body(rng: &mut Rng, b: &mut ProgramBuilder, x: VariableId, depth: usize) -> Vec<NodeId> {
    let count = 1 + rng.below(4);
    let mut statements = Vec::with_capacity(count);
    for _ in 0..count {
        let statement = match rng.below(6) {
            0 => {
                let value = if rng.next_bool() {
                    b.int(1)
                } else {
                    let r = b.var_ref(x);
                    let one = b.int(1);
                    b.binop(kestrel_core::BinaryOperator::Add, r, one)
                };
                b.assign(x, value)
            }
            1 => {
                let left = b.var_ref(x);
                let right = b.var_ref(x);
                let list = b.list(vec![left, right]);
                b.expr_stmt(list)
            }
            2 if depth > 0 => {
                let condition = b.var_ref(x);
                let yes = random_body(rng, b, x, depth - 1);
                let no = if rng.next_bool() {
                    random_body(rng, b, x, depth - 1)
                } else {
                    Vec::new()
                };
                b.if_(condition, yes, no)
            }
            3 if depth > 0 => {
                let mut body = random_body(rng, b, x, depth - 1);
                body.push(b.break_());
                b.loop_(body)
            }
            4 if depth > 0 => {
                let tried = random_body(rng, b, x, depth - 1);
                let handler = random_body(rng, b, x, depth - 1);
                b.try_(tried, handler)
            }
            _ => b.pass(),
        };
        statements.push(statement);
    }
    statements
}

fn uses_of(program: &Program, x: VariableId) -> Vec<NodeId> {
    program
        .tree
        .preorder()
        .into_iter()
        .filter(|id| match program.tree.kind(*id) {
            NodeKind::VariableRef { variable } | NodeKind::AssignVariable { variable, .. } => {
                *variable == x
            }
            _ => false,
        })
        .collect()
}

fn fold(tree: &Tree, uses: &[NodeId], mode: SelectMode) -> Vec<NodeId> {
    let mut paths = uses.iter().map(|u| tree.path_to(*u));
    let first = paths.next().unwrap();
    let mut acc = select_statement(tree, &first, &first, mode);
    for path in paths {
        acc = select_statement(tree, &acc, &path, mode);
    }
    acc
}

#[test]
fn statement_fold_ignores_use_order() {
    for seed in 0..300 {
        let mut rng = Rng::new(seed);
        let mut b = ProgramBuilder::new("m", "m.py");
        b.enter_function("f");
        let x = b.local("x");
        let body = random_body(&mut rng, &mut b, x, 3);
        let f = b.leave_scope(body).unwrap();
        let make = b.function_creation(f);
        let top = b.expr_stmt(make);
        let program = b.finish(vec![top]).unwrap();

        let uses = uses_of(&program, x);
        if uses.is_empty() {
            continue;
        }
        let tree = &program.tree;
        for mode in [SelectMode::First, SelectMode::Last] {
            let expected = fold(tree, &uses, mode);
            assert!(tree.tag(*expected.last().unwrap()).is_statement());

            let mut reversed = uses.clone();
            reversed.reverse();
            assert_eq!(fold(tree, &reversed, mode), expected, "seed {} {:?}", seed, mode);

            let mut shuffled = uses.clone();
            rng.shuffle(&mut shuffled);
            assert_eq!(fold(tree, &shuffled, mode), expected, "seed {} {:?}", seed, mode);

            // Folding a result back in changes nothing.
            assert_eq!(select_statement(tree, &expected, &expected, mode), expected);
        }
    }
}

// ── Cleanup ─────────────────────────────────────────────────────────

/// Statements with nested sequences, constant statements and dead tails.
fn random_messy_body(rng: &mut Rng, b: &mut ProgramBuilder, depth: usize) -> Vec<NodeId> {
    let count = 1 + rng.below(4);
    let mut statements = Vec::with_capacity(count);
    for _ in 0..count {
        let statement = match rng.below(6) {
            0 if depth > 0 => {
                let inner = random_messy_body(rng, b, depth - 1);
                b.sequence(inner).unwrap()
            }
            1 => {
                let value = b.int(rng.below(10) as i64);
                b.expr_stmt(value)
            }
            2 => {
                let value = b.none();
                b.raise(value)
            }
            3 if depth > 0 => {
                let condition = b.none();
                let yes = random_messy_body(rng, b, depth - 1);
                b.if_(condition, yes, Vec::new())
            }
            4 => {
                let g = b.reference("g");
                let callee = b.var_ref(g);
                let call = b.call(callee, vec![]);
                b.expr_stmt(call)
            }
            _ => b.pass(),
        };
        statements.push(statement);
    }
    statements
}

#[test]
fn cleanup_is_idempotent() {
    for seed in 0..200 {
        let mut rng = Rng::new(seed);
        let mut b = ProgramBuilder::new("m", "m.py");
        let body = random_messy_body(&mut rng, &mut b, 3);
        let mut program = b.finish(body).unwrap();

        cleanup(&mut program, DEFAULT_MAX_RESTARTS).unwrap();
        let once = program.dump();
        let generation = program.tree.generation();
        let report = cleanup(&mut program, DEFAULT_MAX_RESTARTS).unwrap();
        assert_eq!(report.restarts, 0, "seed {}", seed);
        assert_eq!(program.dump(), once, "seed {}", seed);
        assert_eq!(program.tree.generation(), generation);
        program.tree.verify().unwrap();

        for id in program.tree.preorder() {
            match program.tree.kind(id) {
                NodeKind::StatementsSequence { statements } => {
                    for (i, s) in statements.iter().enumerate() {
                        assert_ne!(program.tree.tag(*s), NodeTag::StatementsSequence);
                        if program.tree.tag(*s).aborts_control_flow() {
                            assert_eq!(i + 1, statements.len(), "seed {}", seed);
                        }
                    }
                }
                NodeKind::Expression { expression } => {
                    assert_ne!(program.tree.tag(*expression), NodeTag::Constant);
                }
                _ => {}
            }
        }
    }
}

// ── Ownership ledger ────────────────────────────────────────────────

fn random_ops(rng: &mut Rng, handle: &mut dyn ValueHandle, ctx: &mut EmitContext) {
    for _ in 0..1 + rng.below(6) {
        match rng.below(3) {
            0 => {
                handle.export(ctx);
            }
            1 => {
                handle.temporary(ctx);
            }
            _ => handle.drop_value(ctx),
        }
    }
}

#[test]
fn claims_sum_to_the_initial_tag() {
    for seed in 0..500 {
        let mut rng = Rng::new(seed);
        let mut ctx = EmitContext::new();
        ctx.enter_guard_scope();
        let mut value = if rng.next_bool() {
            Identifier::owned("value", &mut ctx)
        } else {
            Identifier::borrowed("value")
        };
        let tag = value.ownership_tag();
        random_ops(&mut rng, &mut value, &mut ctx);
        ctx.exit_guard_scope().unwrap();
        assert_eq!(ctx.claims(), u32::from(tag), "seed {}", seed);
        assert_eq!(value.ownership_tag(), 0);
        ctx.finish().unwrap();
    }
}

#[test]
fn proxy_claims_only_on_first_consumption() {
    for seed in 0..500 {
        let mut rng = Rng::new(seed);
        let mut ctx = EmitContext::new();
        ctx.enter_guard_scope();
        let target = if rng.next_bool() {
            Identifier::owned("obj", &mut ctx)
        } else {
            Identifier::borrowed("obj")
        };
        let tag = target.ownership_tag();
        let mut proxy = ConsumedProxyIdentifier::new(target);

        proxy.temporary(&mut ctx);
        assert!(proxy.is_given());
        let ops_after_first = ctx.ops().len();
        random_ops(&mut rng, &mut proxy, &mut ctx);
        assert!(ctx.ops()[ops_after_first..]
            .iter()
            .all(|op| matches!(op, OwnershipOp::Read { .. })));

        ctx.exit_guard_scope().unwrap();
        assert_eq!(ctx.claims(), u32::from(tag), "seed {}", seed);
        ctx.finish().unwrap();
    }
}
