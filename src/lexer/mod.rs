//! Lexer for the textual operation format

mod tokens;

pub use tokens::{Token, TokenKind};

use crate::common::Span;
use crate::diagnostics::{ProgramError, SourceFile};
use logos::Logos;

/// Lex source text that has no file name
pub fn lex(source: &str) -> Result<Vec<Token>, ProgramError> {
    lex_file(&SourceFile::new("<input>", source))
}

/// Lex a source file into tokens, ending with `Eof`
pub fn lex_file(file: &SourceFile) -> Result<Vec<Token>, ProgramError> {
    let source = &*file.content;
    let mut tokens = Vec::new();
    let mut lexer = TokenKind::lexer(source);

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        match result {
            Ok(kind) => tokens.push(Token {
                kind,
                span: Span::from(range),
                text: lexer.slice().to_string(),
            }),
            Err(()) => {
                return Err(ProgramError::InvalidToken {
                    span: Span::from(range).into(),
                    src: file.to_named_source(),
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(source.len(), source.len()),
        text: String::new(),
    });

    tracing::trace!(count = tokens.len(), "lexed");
    Ok(tokens)
}
