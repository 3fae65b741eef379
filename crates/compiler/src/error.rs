//! Compilation errors and diagnostic rendering.
//!
//! Every pass reports failures through [`CompileError`]. An error either
//! points at a byte offset in the source buffer (scanner, parser and
//! semantic errors) or wraps a formatting failure from writing assembly
//! text. Rendering against the original source produces the
//! `file:line:` plus caret format printed on stderr.

use std::fmt;

/// Error type shared by all compilation passes.
#[derive(Debug)]
pub enum CompileError {
    /// An error at a position in the source buffer.
    Diag {
        /// Byte offset into the source the diagnostic points at.
        loc: usize,
        msg: String,
    },
    /// A formatting error while writing assembly into the output buffer.
    Format(fmt::Error),
}

impl CompileError {
    /// Create a diagnostic pointing at `loc` (a byte offset into the source).
    pub fn at(loc: usize, msg: impl Into<String>) -> Self {
        CompileError::Diag {
            loc,
            msg: msg.into(),
        }
    }

    /// Render the diagnostic against the source it was produced from:
    ///
    /// ```text
    /// foo.c:10: x = y + 1;
    ///               ^ <message>
    /// ```
    ///
    /// The caret is aligned under the offending position, indented past the
    /// `file:line:` prefix.
    pub fn render(&self, filename: &str, source: &str) -> String {
        match self {
            CompileError::Diag { loc, msg } => {
                let loc = (*loc).min(source.len());
                let line_start = source[..loc].rfind('\n').map_or(0, |i| i + 1);
                let line_end = source[loc..]
                    .find('\n')
                    .map_or(source.len(), |i| loc + i);
                let line_no = source[..loc].matches('\n').count() + 1;
                let prefix = format!("{}:{}: ", filename, line_no);
                let indent = prefix.len() + (loc - line_start);
                format!(
                    "{}{}\n{}^ {}\n",
                    prefix,
                    &source[line_start..line_end],
                    " ".repeat(indent),
                    msg
                )
            }
            CompileError::Format(e) => format!("{}: error writing assembly: {}\n", filename, e),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Diag { msg, .. } => write!(f, "{}", msg),
            CompileError::Format(e) => write!(f, "error writing assembly: {}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<fmt::Error> for CompileError {
    fn from(e: fmt::Error) -> Self {
        CompileError::Format(e)
    }
}
