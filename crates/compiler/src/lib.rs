//! chibicc compiler library
//!
//! Compiles a single C translation unit (a growing subset of C) to x86-64
//! System V assembly in AT&T syntax.
//!
//! The pipeline is three strict stages, each finishing before the next
//! starts:
//!
//! 1. [`lexer`] scans the source into a token stream,
//! 2. [`parser`] builds a typed AST with a lexical scope chain,
//! 3. [`codegen`] lowers the AST to assembly text with a stack-machine
//!    discipline.
//!
//! ```rust
//! let source = "int main() { return 42; }\n";
//! let asm = chibicc::compile(source, "answer.c").unwrap();
//! assert!(asm.contains("main:"));
//! ```

pub mod ast;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod types;

pub use ast::Program;
pub use codegen::CodeGen;
pub use error::CompileError;
pub use lexer::{Token, TokenKind, tokenize};
pub use parser::Parser;

use tracing::debug;

/// Compile one C translation unit to assembly text.
///
/// `input_path` shows up in the `.file` directive and is what the caller
/// should also pass to [`CompileError::render`] on failure.
pub fn compile(source: &str, input_path: &str) -> Result<String, CompileError> {
    let tokens = lexer::tokenize(source)?;
    debug!(tokens = tokens.len(), "scanned translation unit");

    let mut parser = Parser::new(source, &tokens);
    let program = parser.parse()?;
    debug!(globals = program.globals.len(), "parsed translation unit");

    let asm = CodeGen::new().with_file(input_path).generate(&program)?;
    debug!(bytes = asm.len(), "emitted assembly");
    Ok(asm)
}
