//! Import checking.
//!
//! Locating modules is the embedder's business; this pass only asks a
//! [`ModuleFinder`] about every import in the tree and warns about the ones
//! that cannot be found and are not expected to be missing.

use crate::diagnostics::Diagnostic;
use kestrel_core::{NodeKind, Program};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub trait ModuleFinder {
    /// True when `module` can be located.
    fn locate(&self, module: &str) -> bool;
}

/// Finder over a fixed set of known module names.
#[derive(Debug, Clone, Default)]
pub struct StaticModuleFinder {
    known: BTreeSet<String>,
}

impl StaticModuleFinder {
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: modules.into_iter().map(Into::into).collect(),
        }
    }
}

impl ModuleFinder for StaticModuleFinder {
    fn locate(&self, module: &str) -> bool {
        // A package makes its submodules findable.
        self.known.contains(module)
            || module
                .rsplit_once('.')
                .is_some_and(|(package, _)| self.locate(package))
    }
}

pub fn check_imports(
    program: &Program,
    finder: &dyn ModuleFinder,
    expected_missing: &BTreeSet<String>,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut reported = BTreeSet::new();
    for id in program.tree.preorder() {
        let NodeKind::ImportModule { module } = program.tree.kind(id) else {
            continue;
        };
        if finder.locate(module) || !reported.insert(module.clone()) {
            continue;
        }
        let location = program.tree.source(id).clone();
        if expected_missing.contains(module) {
            debug!("module '{}' is missing as expected ({})", module, location);
            continue;
        }
        warn!("cannot find module '{}' imported at {}", module, location);
        diagnostics.push(
            Diagnostic::warning(format!("cannot find module '{}'", module), location)
                .with_code("K0401")
                .with_suggestion("add it to `expected_missing_modules` if this is intended"),
        );
    }
    diagnostics
}
