//! Source locations attached to events.

use std::fmt;
use std::sync::Arc;

/// A position in a host source file.
///
/// Every hook firing carries the location of the expression that was
/// rewritten, so violations can point at the line that opened the file or
/// created the iterator rather than at engine internals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    file: Arc<str>,
    line: u32,
    column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<Arc<str>>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// The path of the source file, as the loader recorded it.
    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}
