//! Error types for parsing, loading and execution.
//!
//! [`ParseError`] is produced while parsing template source and carries a
//! source span for diagnostic formatting. [`EvalError`] is produced while
//! executing and can originate from the executor or from a registered
//! function, which reports through [`FuncError`]. Callers of the public API
//! only ever see [`Error`], which wraps both with the name of the template
//! involved.

use crate::ast::span::Span;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// ── Top-level errors ────────────────────────────────────────────────────

/// Every failure returned by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed template source.
    #[error("template: {name}:{line}:{column}: {source}")]
    Parse {
        name: String,
        line: usize,
        column: usize,
        #[source]
        source: ParseError,
    },

    /// A load call resolved to zero files.
    #[error("pgtmpl: {0}")]
    NoFiles(String),

    /// `parse_fs` was called without any pattern.
    #[error("pgtmpl: no patterns in call to parse_fs")]
    NoPatterns,

    /// A glob pattern could not be compiled.
    #[error("pgtmpl: bad pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A template file could not be read.
    #[error("pgtmpl: reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `execute_template` named a template absent from the namespace.
    #[error("pgtmpl: no template {name:?} associated with template {root:?}")]
    UnknownTemplate { name: String, root: String },

    /// The template has no parsed definition to duplicate.
    #[error("pgtmpl: {name:?} is an incomplete or empty template")]
    Clone { name: String },

    /// A registered `bind` transform failed for one value.
    #[error("{name:?}: {source}")]
    BindFunction {
        name: String,
        #[source]
        source: EvalError,
    },

    /// Any other failure while executing the template.
    #[error("{name:?}: {source}")]
    Execution {
        name: String,
        #[source]
        source: EvalError,
    },
}

impl Error {
    /// Build an [`Error::Parse`], resolving the span against `source`.
    pub(crate) fn parse(name: &str, source: &str, error: ParseError) -> Self {
        let (line, column) = error.span.line_col(source);
        Error::Parse {
            name: name.to_string(),
            line,
            column,
            source: error,
        }
    }

    /// Wrap an execution failure, routing bind transform failures to
    /// [`Error::BindFunction`].
    pub(crate) fn execution(name: &str, error: EvalError) -> Self {
        let name = name.to_string();
        match error.kind {
            EvalErrorKind::BindFunction => Error::BindFunction {
                name,
                source: error,
            },
            _ => Error::Execution {
                name,
                source: error,
            },
        }
    }

    /// The execution error kind, when this is an execution failure.
    pub fn eval_kind(&self) -> Option<EvalErrorKind> {
        match self {
            Error::BindFunction { source, .. } | Error::Execution { source, .. } => {
                Some(source.kind)
            }
            _ => None,
        }
    }
}

// ── Parse errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseError {
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
}

impl ParseError {
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Format the error with source context for display
    pub fn format_with_source(&self, source: &str, template_name: Option<&str>) -> String {
        let (line, col) = self.span.line_col(source);
        let source_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");

        let location = match template_name {
            Some(name) => format!(" --> {name}:{line}:{col}"),
            None => format!(" --> {line}:{col}"),
        };

        let width = self
            .span
            .end
            .saturating_sub(self.span.start)
            .clamp(1, source_line.len().saturating_sub(col - 1).max(1));
        let pointer = " ".repeat(col.saturating_sub(1)) + &"^".repeat(width);

        let mut output = format!(
            "Error: {}\n{location}\n  |\n{line:>3} | {source_line}\n    | {pointer}",
            self.message
        );

        if let Some(hint) = &self.hint {
            output.push_str(&format!("\n  = hint: {hint}"));
        }

        output
    }
}

// ── Execution errors ────────────────────────────────────────────────────

/// An error raised while executing a template.
///
/// Carries a structured [`EvalErrorKind`], a message, the span of the
/// action that failed and, once the error leaves the template it occurred
/// in, a location of the form `executing "name" at line:col`.
#[derive(Debug, Clone, Error)]
#[error("{}{message}", location_prefix(.location))]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub span: Option<Span>,
    pub location: Option<String>,
    pub message: String,
    /// The underlying error that caused this one, if any. Wrapped in `Arc`
    /// so that `EvalError` remains `Clone`.
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

fn location_prefix(location: &Option<String>) -> String {
    match location {
        Some(location) => format!("{location}: "),
        None => String::new(),
    }
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            span: None,
            location: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
        }
        self
    }

    /// Attach an underlying error cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Record where the error happened. The innermost location wins.
    pub(crate) fn locate(mut self, template: &str, source: &str) -> Self {
        if self.location.is_none() {
            self.location = Some(match self.span {
                Some(span) => {
                    let (line, col) = span.line_col(source);
                    format!("executing {template:?} at {line}:{col}")
                }
                None => format!("executing {template:?}"),
            });
        }
        self
    }

    // Convenience constructors for common error types

    pub fn undefined_variable(name: &str) -> Self {
        Self::new(
            EvalErrorKind::UndefinedVariable,
            format!("undefined variable: {name}"),
        )
    }

    pub fn undefined_function(name: &str) -> Self {
        Self::new(
            EvalErrorKind::UndefinedFunction,
            format!("function {name:?} not defined"),
        )
    }

    pub fn undefined_template(name: &str) -> Self {
        Self::new(
            EvalErrorKind::UndefinedTemplate,
            format!("no such template {name:?}"),
        )
    }

    pub fn missing_key(key: &str) -> Self {
        Self::new(
            EvalErrorKind::MissingKey,
            format!("map has no entry for key {key:?}"),
        )
    }

    pub fn type_error(expected: &str, got: &str) -> Self {
        Self::new(
            EvalErrorKind::TypeError,
            format!("expected {expected}, got {got}"),
        )
    }

    pub fn not_iterable(got: &str) -> Self {
        Self::new(
            EvalErrorKind::NotIterable,
            format!("range can't iterate over {got}"),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    UndefinedVariable,
    UndefinedFunction,
    UndefinedTemplate,
    /// A field chain named a key the map does not hold.
    MissingKey,
    TypeError,
    NotIterable,
    IndexOutOfRange,
    /// A function was called with the wrong number of arguments.
    WrongArgCount,
    /// A registered function other than `bind` returned an error.
    FuncCall,
    /// The registered `bind` transform returned an error.
    BindFunction,
    /// Nested `{{template}}` invocations exceeded the configured depth.
    RecursionLimit,
    /// The data passed to `execute` could not be converted to a value.
    InvalidData,
}

// ── Function errors ─────────────────────────────────────────────────────

/// Error returned by a registered template function.
#[derive(Debug, Clone, Error)]
pub enum FuncError {
    /// The function was called with an argument count it does not accept.
    #[error("wrong number of args: want {expected}, got {got}")]
    WrongArgCount { expected: String, got: usize },

    /// An argument had an unusable type.
    #[error("expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
    },

    #[error("{0}")]
    Failed(String),

    /// The registered `bind` transform failed. Produced by the binding
    /// interceptor only.
    #[error("{0}")]
    Bind(Box<FuncError>),
}

impl FuncError {
    pub fn arity(expected: usize, got: usize) -> Self {
        FuncError::WrongArgCount {
            expected: expected.to_string(),
            got,
        }
    }

    pub fn at_least(min: usize, got: usize) -> Self {
        FuncError::WrongArgCount {
            expected: format!("at least {min}"),
            got,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        FuncError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_formats_with_source() {
        let source = "SELECT {{bind .x\nFROM t";
        let err = ParseError::new(Span::new(7, 9), "unclosed action").with_hint("add }}");
        let out = err.format_with_source(source, Some("q"));
        assert!(out.contains(" --> q:1:8"));
        assert!(out.contains("  1 | SELECT {{bind .x"));
        assert!(out.contains("= hint: add }}"));
    }

    #[test]
    fn test_eval_error_location_prefix() {
        let err = EvalError::missing_key("id")
            .with_span(Span::new(4, 9))
            .locate("q", "ab\ncd{{.id}}");
        assert_eq!(
            err.to_string(),
            r#"executing "q" at 2:2: map has no entry for key "id""#
        );
    }

    #[test]
    fn test_innermost_location_wins() {
        let err = EvalError::undefined_template("x")
            .locate("inner", "")
            .locate("outer", "");
        assert_eq!(err.location.as_deref(), Some(r#"executing "inner""#));
    }

    #[test]
    fn test_bind_failures_route_to_bind_function() {
        let err = Error::execution("q", EvalError::new(EvalErrorKind::BindFunction, "bad"));
        assert!(matches!(err, Error::BindFunction { .. }));
        assert_eq!(err.eval_kind(), Some(EvalErrorKind::BindFunction));

        let err = Error::execution("q", EvalError::missing_key("x"));
        assert!(matches!(err, Error::Execution { .. }));
    }

    #[test]
    fn test_error_chaining() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = EvalError::new(EvalErrorKind::FuncCall, "lookup failed").with_source(io_err);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "gone");
    }
}
