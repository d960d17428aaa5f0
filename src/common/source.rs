//! Represents a literal piece of source code, along with where it came from.
//!
//! A [`Source`] is held behind an [`Rc`] so that [`Span`](super::span::Span)s,
//! tokens, and AST nodes can all cheaply refer back to the file they were
//! read from without duplicating its contents.

use std::{fmt, fs, path::PathBuf, rc::Rc};

/// A named piece of source text.
///
/// `path` is purely informational — it's used in diagnostics — and is
/// `None` for source constructed directly from a string (e.g. in tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub contents: String,
    pub path: Option<PathBuf>,
}

impl Source {
    /// Reads a file from disk into a new [`Source`].
    pub fn path(path: impl Into<PathBuf>) -> std::io::Result<Rc<Source>> {
        let path = path.into();
        let contents = fs::read_to_string(&path)?;
        Ok(Rc::new(Source { contents, path: Some(path) }))
    }

    /// Wraps a literal string as an anonymous [`Source`], useful for tests
    /// and for embedding snippets.
    pub fn source(contents: impl Into<String>) -> Rc<Source> {
        Rc::new(Source { contents: contents.into(), path: None })
    }

    /// A short name for this source, used in error messages.
    pub fn name(&self) -> &str {
        match &self.path {
            Some(p) => p.to_str().unwrap_or("<source>"),
            None => "<source>",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
