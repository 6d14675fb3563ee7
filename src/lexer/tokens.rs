//! Token definitions for the operation lexer

use crate::common::Span;
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A token with its kind, span, and text
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub text: String,
}

/// Token kinds recognized by the lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Logos, Serialize, Deserialize)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum TokenKind {
    // Values and names
    #[regex(r"%[a-zA-Z0-9_]+")]
    ValueRef,
    #[regex(r"![a-zA-Z_][a-zA-Z0-9_.]*")]
    DialectType,
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*")]
    Ident,

    // Shape prefix of a shaped type: `16x8x` in `vector<16x8xf16>`
    #[regex(r"[0-9]+x([0-9]+x)*")]
    Dims,
    #[token("*x")]
    UnrankedDims,

    // Literals
    #[regex(r"-?[0-9]+")]
    IntLit,
    #[regex(r"-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?")]
    FloatLit,

    // Punctuation
    #[token("=")]
    Eq,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("->")]
    Arrow,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,

    // Special
    Eof,
}

impl TokenKind {
    /// Check if this token is a literal
    pub fn is_literal(&self) -> bool {
        matches!(self, TokenKind::IntLit | TokenKind::FloatLit)
    }

    /// Get the string representation of the token
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::ValueRef => "value",
            TokenKind::DialectType => "dialect type",
            TokenKind::Ident => "identifier",
            TokenKind::Dims => "dimensions",
            TokenKind::UnrankedDims => "*x",
            TokenKind::IntLit => "integer",
            TokenKind::FloatLit => "float",
            TokenKind::Eq => "=",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Arrow => "->",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Eof => "end of file",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Token {
    /// Dimension list of a `Dims` token: `16x8x` -> `[16, 8]`
    pub fn dims(&self) -> Vec<usize> {
        self.text
            .split('x')
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect()
    }
}
