//! The pipeline-wide error hierarchy.
//!
//! Each stage of the pipeline — lexing, parsing, compiling, and running —
//! has its own small error type. `run_source` (see [`crate::run_source`])
//! unifies them behind [`PipelineError`] so a caller gets one `Result` to
//! match on, while still being able to recover the stage that failed.

use std::fmt;
use thiserror::Error;

use crate::common::span::Span;

/// A lexical error: an unterminated string or an unrecognized character.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{span}: {message}")]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl LexError {
    pub fn new(message: impl Into<String>, span: Span) -> LexError {
        LexError { message: message.into(), span }
    }
}

/// A syntax error raised while building the AST.
///
/// The parser only ever surfaces the *first* syntax error it records (see
/// [`crate::compiler::parser::Parser`]'s synchronize-and-continue recovery),
/// so this carries a single message rather than a list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{span}: {message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> ParseError {
        ParseError { message: message.into(), span }
    }
}

/// A semantic error raised while generating bytecode: duplicate bindings,
/// undefined names, register/constant-pool overflow, and the like.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{span}: {message}")]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span) -> CompileError {
        CompileError { message: message.into(), span }
    }
}

/// One entry in a runtime stack trace: `[line L] in NAME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.name)
    }
}

/// An error raised by the VM while interpreting bytecode, together with the
/// call-frame trace active when it was raised (innermost frame first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> RuntimeError {
        RuntimeError { message: message.into(), trace }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "{}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// The top-level error type for [`crate::run_source`]: whichever pipeline
/// stage failed first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
