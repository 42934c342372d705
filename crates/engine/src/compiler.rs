//! The seam between the engine and a scripting language.
//!
//! The engine never interprets source itself. A `SourceCompiler` turns
//! source text into a `CompiledFunction`, which the engine invokes with an
//! `ExecutionContext` every time the function has to run.

use std::rc::Rc;

use crate::cell::Value;
use crate::context::ExecutionContext;
use crate::function::FunctionKind;

/// A single compile problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based line, when the compiler knows it
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }

    pub fn at_line(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Everything a failed compile had to say.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a single unlocated diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self(vec![Diagnostic::new(message)])
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }
}

impl From<Vec<Diagnostic>> for Diagnostics {
    fn from(list: Vec<Diagnostic>) -> Self {
        Self(list)
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// A callable produced by a `SourceCompiler`.
///
/// `Err` carries a user-facing message for failures inside user code.
/// Trigger functions return `Value::Empty`.
pub trait CompiledFunction {
    fn invoke(&self, ctx: &ExecutionContext<'_>) -> Result<Value, String>;
}

pub trait SourceCompiler {
    fn compile(&self, kind: FunctionKind, source: &str) -> Result<Rc<dyn CompiledFunction>, Diagnostics>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_display() {
        let mut d = Diagnostics::new();
        assert!(d.is_empty());
        d.push(Diagnostic::at_line(3, "unexpected symbol"));
        d.push(Diagnostic::new("giving up"));
        assert_eq!(d.len(), 2);
        assert_eq!(d.to_string(), "line 3: unexpected symbol; giving up");
    }

    #[test]
    fn test_diagnostics_error() {
        assert_eq!(Diagnostics::error("boom").to_string(), "boom");
    }
}
