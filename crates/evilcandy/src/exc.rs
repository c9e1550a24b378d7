//! Error taxonomy surfaced to user code.
//!
//! A failing operator, builtin, or VM instruction produces a [`RunError`];
//! the `?` chain unwinds frames back to the driver, which prints the error
//! and exits non-zero. The constant folder is the only internal caller that
//! recovers (it discards folding-time errors, since the folded expression
//! might never execute).

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

/// Exception kinds, as distinct as user code can observe them.
///
/// Uses strum derives so the name used in messages, the reassembler, and
/// tests is always the variant name itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ExcType {
    /// Lexer and assembler failures: unterminated literals, malformed
    /// numbers, unexpected tokens.
    ParserError,
    /// Reassembler rejects of hand-written disassembly.
    SyntaxError,
    /// Operator or argument type mismatches.
    TypeError,
    /// Bad values: negative lengths, zero range step, division by zero.
    ValueError,
    /// Dict lookup of an absent key.
    KeyError,
    /// Attribute get/set of a missing attribute.
    AttributeError,
    /// Placeholder operations.
    NotImplementedError,
    /// Locked resources, recursion overflow, unresolved symbols, and other
    /// operational failures.
    RuntimeError,
    /// I/O failures and internal inconsistencies that are still reportable.
    SystemError,
}

/// A raised exception in flight.
///
/// Carries the exception type, a message, and whatever provenance was known
/// at the raise site. Provenance fields are filled in lazily as the error
/// propagates: the VM stamps the executing function's name and line, the
/// lexer stamps file/line/column plus a caret excerpt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    exc: ExcType,
    message: String,
    /// Source file, when known.
    file: Option<String>,
    /// 1-based source line, when known.
    line: Option<u32>,
    /// 1-based column, for parse errors.
    col: Option<u32>,
    /// Function name the error was raised in, when known.
    func: Option<String>,
    /// A copy of the offending source line with a caret marker underneath.
    excerpt: Option<String>,
}

/// Result type threaded through every fallible interpreter operation.
pub type RunResult<T> = Result<T, RunError>;

impl RunError {
    pub fn new(exc: ExcType, message: impl Into<String>) -> Self {
        Self {
            exc,
            message: message.into(),
            file: None,
            line: None,
            col: None,
            func: None,
            excerpt: None,
        }
    }

    pub fn parser(message: impl Into<String>) -> Self {
        Self::new(ExcType::ParserError, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ExcType::SyntaxError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    pub fn key_error(key: &str) -> Self {
        Self::new(ExcType::KeyError, format!("no such key: {key}"))
    }

    pub fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::new(
            ExcType::AttributeError,
            format!("{type_name} object has no attribute '{attr}'"),
        )
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ExcType::NotImplementedError, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ExcType::RuntimeError, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ExcType::SystemError, message)
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Stamps file/line provenance, keeping any already-recorded values.
    ///
    /// The first raise site wins: outer frames re-stamping during unwind
    /// must not overwrite the location where the error actually occurred.
    #[must_use]
    pub fn with_location(mut self, file: &str, line: u32) -> Self {
        if self.file.is_none() {
            self.file = Some(file.to_owned());
        }
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    /// Stamps a 1-based column, for parse errors.
    #[must_use]
    pub fn with_col(mut self, col: u32) -> Self {
        if self.col.is_none() {
            self.col = Some(col);
        }
        self
    }

    /// Stamps the enclosing function's name, if not already known.
    #[must_use]
    pub fn with_func(mut self, func: &str) -> Self {
        if self.func.is_none() {
            self.func = Some(func.to_owned());
        }
        self
    }

    /// Attaches a caret-marked copy of the offending source line.
    #[must_use]
    pub fn with_excerpt(mut self, source_line: &str, col: usize) -> Self {
        if self.excerpt.is_none() {
            let mut marker = String::with_capacity(col + 1);
            for _ in 1..col {
                marker.push(' ');
            }
            marker.push('^');
            self.excerpt = Some(format!("{source_line}\n{marker}"));
        }
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
            if let Some(line) = self.line {
                write!(f, "{line}:")?;
                if let Some(col) = self.col {
                    write!(f, "{col}:")?;
                }
            }
            write!(f, " ")?;
        }
        if let Some(func) = &self.func {
            write!(f, "in {func}: ")?;
        }
        write!(f, "{}: {}", self.exc, self.message)?;
        if let Some(excerpt) = &self.excerpt {
            write!(f, "\n{excerpt}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_full_provenance() {
        let err = RunError::parser("unexpected token ';'")
            .with_location("script.evc", 3)
            .with_col(7)
            .with_excerpt("let x ;", 7);
        let rendered = err.to_string();
        assert_eq!(
            rendered,
            "script.evc:3:7: ParserError: unexpected token ';'\nlet x ;\n      ^"
        );
    }

    #[test]
    fn first_location_wins() {
        let err = RunError::runtime("oops")
            .with_location("inner.evc", 2)
            .with_location("outer.evc", 9);
        assert_eq!(err.to_string(), "inner.evc:2: RuntimeError: oops");
    }

    #[test]
    fn exc_type_names_round_trip() {
        assert_eq!("TypeError".parse::<ExcType>().unwrap(), ExcType::TypeError);
        assert_eq!(ExcType::KeyError.to_string(), "KeyError");
    }
}
