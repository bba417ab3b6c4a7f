use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Source location of a node in the original program file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// Path of the source file, shared between all nodes of one module
    pub file: Arc<str>,
    /// 1-based line number
    pub line: usize,
}

impl SourceRef {
    pub fn new(file: impl Into<Arc<str>>, line: usize) -> Self {
        Self { file: file.into(), line }
    }

    pub fn dummy() -> Self {
        Self { file: Arc::from("<internal>"), line: 0 }
    }

    /// Same file, different line. Cheap: the file name is shared.
    pub fn at_line(&self, line: usize) -> Self {
        Self { file: Arc::clone(&self.file), line }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
