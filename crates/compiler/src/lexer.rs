//! Lexical scanner: source text to a flat token stream.
//!
//! Tokens do not own their lexemes; they carry a byte offset and length
//! into the source buffer, which later passes use both for diagnostics and
//! for lexeme comparison. The stream always ends in exactly one
//! end-of-input sentinel.
//!
//! Scanning runs in three steps: the main character loop, a keyword
//! reclassification pass over identifier tokens, and a single walk over the
//! source to stamp 1-based line numbers.

use crate::error::CompileError;
use crate::types::{Type, array_of, ty_char};
use std::rc::Rc;

/// Everything scanned as an identifier first and retagged afterwards.
const KEYWORDS: &[&str] = &[
    "return", "if", "else", "for", "while", "int", "char", "short", "long", "void", "sizeof",
    "struct", "union", "typedef",
];

/// Two-character punctuators, matched before single characters.
const TWO_CHAR_PUNCTS: &[&str] = &["==", "!=", "<=", ">=", "->"];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident,
    Punct,
    Keyword,
    /// String literal with its decoded bytes and `char[len + 1]` type.
    Str { bytes: Vec<u8>, ty: Rc<Type> },
    Num(i64),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the lexeme in the source buffer.
    pub loc: usize,
    /// Lexeme length in bytes.
    pub len: usize,
    /// 1-based source line.
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, loc: usize, len: usize) -> Token {
        Token {
            kind,
            loc,
            len,
            line: 0,
        }
    }

    /// The token's textual form, resolved against the source it was
    /// scanned from.
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.loc..self.loc + self.len]
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_cont(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

/// Punctuation bytes that can start a C punctuator. `@`, `$` and backtick
/// are punctuation to ASCII but not to C.
fn is_punct_byte(c: u8) -> bool {
    c.is_ascii_punctuation() && !matches!(c, b'@' | b'$' | b'`')
}

fn read_punct(rest: &str) -> usize {
    for punct in TWO_CHAR_PUNCTS {
        if rest.starts_with(punct) {
            return 2;
        }
    }
    if is_punct_byte(rest.as_bytes()[0]) {
        1
    } else {
        0
    }
}

fn from_hex(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => c - b'A' + 10,
    }
}

/// Decode one escape sequence. `pos` points just past the backslash.
/// Returns the decoded byte and the position after the sequence.
fn read_escaped_char(src: &str, mut pos: usize) -> Result<(u8, usize), CompileError> {
    let bytes = src.as_bytes();

    // Octal escapes take up to three digits.
    if matches!(bytes[pos], b'0'..=b'7') {
        let mut c = u32::from(bytes[pos] - b'0');
        pos += 1;
        for _ in 0..2 {
            if pos < bytes.len() && matches!(bytes[pos], b'0'..=b'7') {
                c = (c << 3) + u32::from(bytes[pos] - b'0');
                pos += 1;
            }
        }
        return Ok((c as u8, pos));
    }

    // Hex escapes take every hex digit that follows.
    if bytes[pos] == b'x' {
        pos += 1;
        if pos >= bytes.len() || !bytes[pos].is_ascii_hexdigit() {
            return Err(CompileError::at(pos, "invalid hex escape sequence"));
        }
        let mut c = 0u32;
        while pos < bytes.len() && bytes[pos].is_ascii_hexdigit() {
            c = (c << 4).wrapping_add(u32::from(from_hex(bytes[pos])));
            pos += 1;
        }
        return Ok((c as u8, pos));
    }

    let c = match bytes[pos] {
        b'a' => 0x07,
        b'b' => 0x08,
        b't' => b'\t',
        b'n' => b'\n',
        b'v' => 0x0b,
        b'f' => 0x0c,
        b'r' => b'\r',
        // [GNU] \e is a GNU extension for the ASCII escape character.
        b'e' => 27,
        other => other,
    };
    Ok((c, pos + 1))
}

/// Scan a string literal starting at the opening quote. Returns the token
/// and the position just past the closing quote.
fn read_string_literal(src: &str, start: usize) -> Result<(Token, usize), CompileError> {
    let bytes = src.as_bytes();

    // Find the closing quote first so decoding can run over a known range.
    let mut pos = start + 1;
    loop {
        if pos >= bytes.len() || bytes[pos] == b'\n' || bytes[pos] == 0 {
            return Err(CompileError::at(start, "unterminated string literal"));
        }
        if bytes[pos] == b'"' {
            break;
        }
        if bytes[pos] == b'\\' {
            pos += 1;
        }
        pos += 1;
    }
    let end = pos;

    let mut buf = Vec::new();
    let mut p = start + 1;
    while p < end {
        if bytes[p] == b'\\' {
            let (c, next) = read_escaped_char(src, p + 1)?;
            buf.push(c);
            p = next;
        } else {
            buf.push(bytes[p]);
            p += 1;
        }
    }

    let ty = array_of(ty_char(), buf.len() + 1);
    let token = Token::new(TokenKind::Str { bytes: buf, ty }, start, end + 1 - start);
    Ok((token, end + 1))
}

fn convert_keywords(src: &str, tokens: &mut [Token]) {
    for token in tokens {
        if token.kind == TokenKind::Ident && KEYWORDS.contains(&token.text(src)) {
            token.kind = TokenKind::Keyword;
        }
    }
}

/// Stamp each token with its 1-based line number in a single source walk.
fn assign_line_numbers(src: &str, tokens: &mut [Token]) {
    let bytes = src.as_bytes();
    let mut line = 1;
    let mut pos = 0;
    for token in tokens {
        while pos < token.loc {
            if bytes[pos] == b'\n' {
                line += 1;
            }
            pos += 1;
        }
        token.line = line;
    }
}

/// Tokenize a source buffer.
pub fn tokenize(src: &str) -> Result<Vec<Token>, CompileError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        // Line comment
        if src[pos..].starts_with("//") {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }

        // Block comment
        if src[pos..].starts_with("/*") {
            match src[pos + 2..].find("*/") {
                Some(i) => pos += 2 + i + 2,
                None => return Err(CompileError::at(pos, "block comment not closed")),
            }
            continue;
        }

        // Integer literal
        if c.is_ascii_digit() {
            let start = pos;
            let mut value: i64 = 0;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                value = value
                    .wrapping_mul(10)
                    .wrapping_add(i64::from(bytes[pos] - b'0'));
                pos += 1;
            }
            tokens.push(Token::new(TokenKind::Num(value), start, pos - start));
            continue;
        }

        // String literal
        if c == b'"' {
            let (token, next) = read_string_literal(src, pos)?;
            tokens.push(token);
            pos = next;
            continue;
        }

        // Identifier or keyword
        if is_ident_start(c) {
            let start = pos;
            while pos < bytes.len() && is_ident_cont(bytes[pos]) {
                pos += 1;
            }
            tokens.push(Token::new(TokenKind::Ident, start, pos - start));
            continue;
        }

        // Punctuator
        let punct_len = read_punct(&src[pos..]);
        if punct_len > 0 {
            tokens.push(Token::new(TokenKind::Punct, pos, punct_len));
            pos += punct_len;
            continue;
        }

        return Err(CompileError::at(pos, "cannot tokenize"));
    }

    tokens.push(Token::new(TokenKind::Eof, bytes.len(), 0));
    convert_keywords(src, &mut tokens);
    assign_line_numbers(src, &mut tokens);
    Ok(tokens)
}
