//! Lexer tests

use nvgpu::lexer::{TokenKind, lex};

#[test]
fn test_lex_empty() {
    let tokens = lex("").unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, TokenKind::Eof);
}

#[test]
fn test_lex_whitespace_and_comments() {
    let tokens = lex("   \t\n  // nothing here\n").unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, TokenKind::Eof);
}

#[test]
fn test_lex_constant() {
    let tokens = lex("%c0 = arith.constant 0 : index").unwrap();
    let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::ValueRef,
            TokenKind::Eq,
            TokenKind::Ident,
            TokenKind::IntLit,
            TokenKind::Colon,
            TokenKind::Ident,
            TokenKind::Eof,
        ]
    );
    assert_eq!(tokens[0].text, "%c0");
    assert_eq!(tokens[2].text, "arith.constant");
}

#[test]
fn test_lex_shaped_type() {
    let tokens = lex("memref<16x8xf16, 3>").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::Ident);
    assert_eq!(tokens[1].kind, TokenKind::Lt);
    assert_eq!(tokens[2].kind, TokenKind::Dims);
    assert_eq!(tokens[2].dims(), vec![16, 8]);
    assert_eq!(tokens[3].kind, TokenKind::Ident);
    assert_eq!(tokens[3].text, "f16");
    assert_eq!(tokens[5].kind, TokenKind::IntLit);
}

#[test]
fn test_lex_unranked_memref() {
    let tokens = lex("memref<*xf32>").unwrap();
    assert_eq!(tokens[2].kind, TokenKind::UnrankedDims);
    assert_eq!(tokens[3].text, "f32");
}

#[test]
fn test_lex_dialect_type() {
    let tokens = lex("!nvgpu.mbarrier.group<memorySpace = 3>").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::DialectType);
    assert_eq!(tokens[0].text, "!nvgpu.mbarrier.group");
}

#[test]
fn test_lex_numbers() {
    let tokens = lex("-3 2.5 1.0e-3").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::IntLit);
    assert_eq!(tokens[0].text, "-3");
    assert_eq!(tokens[1].kind, TokenKind::FloatLit);
    assert_eq!(tokens[2].kind, TokenKind::FloatLit);
    assert_eq!(tokens[2].text, "1.0e-3");
}

#[test]
fn test_lex_attribute_dict() {
    let tokens = lex("{mmaShape = [16, 8, 16], tf32Enabled}").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::LBrace);
    assert_eq!(tokens[3].kind, TokenKind::LBracket);
    assert!(tokens.iter().any(|t| t.text == "tf32Enabled"));
    assert_eq!(tokens[tokens.len() - 2].kind, TokenKind::RBrace);
}

#[test]
fn test_lex_spans() {
    let tokens = lex("%a = gpu.thread_id x").unwrap();
    assert_eq!(tokens[0].span.start, 0);
    assert_eq!(tokens[0].span.end, 2);
    assert_eq!(tokens[2].span.start, 5);
}

#[test]
fn test_lex_invalid_token() {
    let err = lex("%a = arith.constant 1 @").unwrap_err();
    assert!(matches!(err, nvgpu::ProgramError::InvalidToken { .. }));
}
