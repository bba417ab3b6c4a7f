//! Value handles for code generation and the ownership ledger behind them.
//!
//! An [`Identifier`] names a generated value. An owned one carries an
//! [`Obligation`]: a token that is not `Clone` and must be handed back to the
//! [`EmitContext`] exactly once, by exporting the reference, guarding it as a
//! temporary, or releasing it. Borrowed identifiers carry no token and never
//! touch the ledger's claim count.
//!
//! [`ConsumedProxyIdentifier`] wraps an identifier that several consumers
//! need: the first consumption does what the target would do, every later one
//! is a plain read.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// The duty to dispose of one owned reference.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an owned reference must be exported, guarded or released"]
pub struct Obligation {
    id: usize,
}

/// What the emitted code does with a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OwnershipOp {
    /// Hand an owned reference to the consumer.
    Export { code: String },
    /// Take a new reference to a borrowed value for the consumer.
    NewReference { code: String },
    /// Keep an owned reference alive until the guard scope ends.
    GuardTemporary { code: String },
    /// End of a guard scope: the guarded reference is released.
    ReleaseGuard { code: String },
    /// Release an owned reference right away.
    Release { code: String },
    /// Use without any reference count change.
    Read { code: String },
}

impl fmt::Display for OwnershipOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipOp::Export { code } => write!(f, "export {}", code),
            OwnershipOp::NewReference { code } => write!(f, "incref {}", code),
            OwnershipOp::GuardTemporary { code } => write!(f, "guard {}", code),
            OwnershipOp::ReleaseGuard { code } => write!(f, "release-guard {}", code),
            OwnershipOp::Release { code } => write!(f, "decref {}", code),
            OwnershipOp::Read { code } => write!(f, "read {}", code),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OwnershipViolation {
    #[error("{} owned reference(s) never disposed of: {}", .codes.len(), .codes.join(", "))]
    Leaked { codes: Vec<String> },
    #[error("owned reference '{code}' disposed of {claims} times")]
    Overclaimed { code: String, claims: u32 },
    #[error("{open} guard scope(s) still open")]
    OpenGuardScopes { open: usize },
    #[error("no guard scope to close")]
    NoGuardScope,
}

#[derive(Debug)]
struct Entry {
    code: String,
    claims: u32,
}

/// Ledger of obligations plus the ordered ownership operations.
///
/// There is always a base guard scope; [`EmitContext::finish`] closes it.
#[derive(Debug)]
pub struct EmitContext {
    entries: Vec<Entry>,
    guards: Vec<Vec<(Obligation, String)>>,
    ops: Vec<OwnershipOp>,
}

impl Default for EmitContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EmitContext {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            guards: vec![Vec::new()],
            ops: Vec::new(),
        }
    }

    fn open(&mut self, code: &str) -> Obligation {
        let id = self.entries.len();
        self.entries.push(Entry {
            code: code.to_string(),
            claims: 0,
        });
        Obligation { id }
    }

    fn claim(&mut self, obligation: Obligation) {
        let entry = &mut self.entries[obligation.id];
        entry.claims += 1;
        trace!("claimed '{}'", entry.code);
    }

    fn push(&mut self, op: OwnershipOp) {
        self.ops.push(op);
    }

    pub fn read(&mut self, code: &str) {
        self.push(OwnershipOp::Read {
            code: code.to_string(),
        });
    }

    fn guard(&mut self, obligation: Obligation, code: &str) {
        self.push(OwnershipOp::GuardTemporary {
            code: code.to_string(),
        });
        if let Some(scope) = self.guards.last_mut() {
            scope.push((obligation, code.to_string()));
        }
    }

    pub fn enter_guard_scope(&mut self) {
        self.guards.push(Vec::new());
    }

    /// Release the temporaries guarded since the matching
    /// [`EmitContext::enter_guard_scope`], most recent first.
    pub fn exit_guard_scope(&mut self) -> Result<(), OwnershipViolation> {
        if self.guards.len() <= 1 {
            return Err(OwnershipViolation::NoGuardScope);
        }
        self.close_top_scope();
        Ok(())
    }

    fn close_top_scope(&mut self) {
        let Some(scope) = self.guards.pop() else { return };
        for (obligation, code) in scope.into_iter().rev() {
            self.claim(obligation);
            self.push(OwnershipOp::ReleaseGuard { code });
        }
    }

    pub fn ops(&self) -> &[OwnershipOp] {
        &self.ops
    }

    /// Obligations discharged so far.
    pub fn claims(&self) -> u32 {
        self.entries.iter().map(|e| e.claims).sum()
    }

    /// Obligations created so far.
    pub fn obligations(&self) -> usize {
        self.entries.len()
    }

    /// Close the base scope and check that every obligation was discharged
    /// exactly once.
    pub fn finish(mut self) -> Result<Vec<OwnershipOp>, OwnershipViolation> {
        if self.guards.len() > 1 {
            return Err(OwnershipViolation::OpenGuardScopes {
                open: self.guards.len() - 1,
            });
        }
        self.close_top_scope();
        if let Some(entry) = self.entries.iter().find(|e| e.claims > 1) {
            return Err(OwnershipViolation::Overclaimed {
                code: entry.code.clone(),
                claims: entry.claims,
            });
        }
        let leaked: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.claims == 0)
            .map(|e| e.code.clone())
            .collect();
        if !leaked.is_empty() {
            return Err(OwnershipViolation::Leaked { codes: leaked });
        }
        Ok(self.ops)
    }
}

/// Operations every value handle supports.
pub trait ValueHandle {
    fn code(&self) -> &str;

    /// 1 while the handle still holds an undischarged obligation, else 0.
    fn ownership_tag(&self) -> u8;

    /// Give the consumer a reference it owns.
    fn export(&mut self, ctx: &mut EmitContext) -> String;

    /// Use the value within the current guard scope.
    fn temporary(&mut self, ctx: &mut EmitContext) -> String;

    /// Discard the value.
    fn drop_value(&mut self, ctx: &mut EmitContext);
}

#[derive(Debug)]
pub struct Identifier {
    code: String,
    obligation: Option<Obligation>,
}

impl Identifier {
    /// A new reference produced by the code in `code`.
    pub fn owned(code: impl Into<String>, ctx: &mut EmitContext) -> Self {
        let code = code.into();
        let obligation = Some(ctx.open(&code));
        Self { code, obligation }
    }

    /// A value kept alive by someone else: a variable, a constant.
    pub fn borrowed(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            obligation: None,
        }
    }
}

impl ValueHandle for Identifier {
    fn code(&self) -> &str {
        &self.code
    }

    fn ownership_tag(&self) -> u8 {
        u8::from(self.obligation.is_some())
    }

    fn export(&mut self, ctx: &mut EmitContext) -> String {
        match self.obligation.take() {
            Some(obligation) => {
                ctx.claim(obligation);
                ctx.push(OwnershipOp::Export {
                    code: self.code.clone(),
                });
            }
            None => ctx.push(OwnershipOp::NewReference {
                code: self.code.clone(),
            }),
        }
        self.code.clone()
    }

    fn temporary(&mut self, ctx: &mut EmitContext) -> String {
        match self.obligation.take() {
            Some(obligation) => ctx.guard(obligation, &self.code),
            None => ctx.read(&self.code),
        }
        self.code.clone()
    }

    fn drop_value(&mut self, ctx: &mut EmitContext) {
        match self.obligation.take() {
            Some(obligation) => {
                ctx.claim(obligation);
                ctx.push(OwnershipOp::Release {
                    code: self.code.clone(),
                });
            }
            None => ctx.read(&self.code),
        }
    }
}

/// Shares one identifier between several consumers; only the first one
/// inherits its ownership.
#[derive(Debug)]
pub struct ConsumedProxyIdentifier {
    target: Identifier,
    given: bool,
}

impl ConsumedProxyIdentifier {
    pub fn new(target: Identifier) -> Self {
        Self {
            target,
            given: false,
        }
    }

    pub fn is_given(&self) -> bool {
        self.given
    }
}

impl ValueHandle for ConsumedProxyIdentifier {
    fn code(&self) -> &str {
        self.target.code()
    }

    fn ownership_tag(&self) -> u8 {
        if self.given {
            0
        } else {
            self.target.ownership_tag()
        }
    }

    fn export(&mut self, ctx: &mut EmitContext) -> String {
        if self.given {
            ctx.read(self.target.code());
            return self.target.code().to_string();
        }
        self.given = true;
        self.target.export(ctx)
    }

    fn temporary(&mut self, ctx: &mut EmitContext) -> String {
        if self.given {
            ctx.read(self.target.code());
            return self.target.code().to_string();
        }
        self.given = true;
        self.target.temporary(ctx)
    }

    fn drop_value(&mut self, ctx: &mut EmitContext) {
        if self.given {
            return;
        }
        self.given = true;
        self.target.drop_value(ctx);
    }
}
