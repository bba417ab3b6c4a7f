//! User-facing diagnostics produced while analysing a module.

use kestrel_core::SourceRef;
use serde::Serialize;
use std::fmt;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<String>,
    pub message: String,
    pub location: SourceRef,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>, location: SourceRef) -> Self {
        Self {
            severity: Severity::Warning,
            code: None,
            message: message.into(),
            location,
            suggestions: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}[{}]: {}", self.severity, code, self.message)?,
            None => write!(f, "{}: {}", self.severity, self.message)?,
        }
        write!(f, "\n  --> {}", self.location)?;
        for suggestion in &self.suggestions {
            write!(f, "\n  = help: {}", suggestion)?;
        }
        Ok(())
    }
}
