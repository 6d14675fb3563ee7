//! Parser for the textual operation format
//!
//! A recursive descent parser over one generic grammar. Each operation is
//! first read into a `RawOp` (results, name, items, attributes, result
//! types); the builder then turns it into a typed `Op`.

mod builder;

use crate::common::Span;
use crate::diagnostics::{ProgramError, SourceFile};
use crate::ir::{
    ElemType, Interleave, L2Promo, MemRefType, MemorySpace, OobFill, Program, Swizzle,
    TensorMapType, Type, ValueId, VectorType,
};
use crate::lexer::{Token, TokenKind};
use builder::{AttrValue, RawItem, RawLiteral, RawOp};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

pub type ParseResult<T> = Result<T, ProgramError>;

/// Parse a token stream into a program
pub fn parse(tokens: &[Token], file: &SourceFile) -> ParseResult<Program> {
    if tokens.is_empty() {
        return Err(ProgramError::UnexpectedEof {
            span: Span::dummy().into(),
            src: file.to_named_source(),
        });
    }
    let mut parser = Parser::new(tokens, file);
    parser.parse_program()
}

/// Parse a standalone type, e.g. `memref<16x8xf16, 3>`
pub fn parse_type(tokens: &[Token], file: &SourceFile) -> ParseResult<Type> {
    if tokens.is_empty() {
        return Err(ProgramError::UnexpectedEof {
            span: Span::dummy().into(),
            src: file.to_named_source(),
        });
    }
    let mut parser = Parser::new(tokens, file);
    let (ty, _) = parser.parse_type()?;
    parser.expect(TokenKind::Eof)?;
    Ok(ty)
}

/// Parser state
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    file: &'a SourceFile,
    program: Program,
    /// Value name to id, with the defining span
    names: FxHashMap<String, (ValueId, Span)>,
}

/// Value parameter inside a dialect type's `<...>`
enum TypeParam {
    Int(i64),
    Keyword(String),
    Type(Type),
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], file: &'a SourceFile) -> Self {
        Self {
            tokens,
            pos: 0,
            file,
            program: Program::new(),
            names: FxHashMap::default(),
        }
    }

    fn current(&self) -> &'a Token {
        let tokens: &'a [Token] = self.tokens;
        &tokens[self.pos.min(tokens.len() - 1)]
    }

    fn peek(&self) -> TokenKind {
        self.current().kind
    }

    fn peek_n(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek() == kind
    }

    fn advance(&mut self) -> &'a Token {
        let tok = self.current();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<&'a Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(kind.as_str()))
        }
    }

    fn span(&self) -> Span {
        self.current().span
    }

    /// End of the last consumed token
    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.span.end)
            .unwrap_or(0)
    }

    fn unexpected(&self, expected: &str) -> ProgramError {
        let tok = self.current();
        if tok.kind == TokenKind::Eof {
            ProgramError::UnexpectedEof {
                span: tok.span.into(),
                src: self.file.to_named_source(),
            }
        } else {
            ProgramError::UnexpectedToken {
                expected: expected.to_string(),
                found: format!("`{}`", tok.text),
                span: tok.span.into(),
                src: self.file.to_named_source(),
            }
        }
    }

    fn invalid_type(&self, message: impl Into<String>, span: Span) -> ProgramError {
        ProgramError::InvalidType {
            message: message.into(),
            span: span.into(),
            src: self.file.to_named_source(),
        }
    }

    // ==================== PROGRAM ====================

    fn parse_program(&mut self) -> ParseResult<Program> {
        while !self.at(TokenKind::Eof) {
            let raw = self.parse_operation()?;
            self.define(raw)?;
        }
        tracing::debug!(ops = self.program.len(), "parsed program");
        Ok(std::mem::take(&mut self.program))
    }

    /// Build the typed operation and bind its results
    fn define(&mut self, raw: RawOp) -> ParseResult<()> {
        let results = raw.results.clone();
        let span = raw.span;
        let (op, result_type) =
            builder::build(raw, &self.program, &self.names, self.file)?;

        let mut ids = Vec::new();
        if let Some(ty) = result_type {
            for (name, name_span) in results {
                if let Some((_, first)) = self.names.get(&name) {
                    return Err(ProgramError::DuplicateDefinition {
                        name,
                        span: name_span.into(),
                        first_span: (*first).into(),
                        src: self.file.to_named_source(),
                    });
                }
                let id = self.program.add_value(name.clone(), ty.clone(), name_span);
                self.names.insert(name, (id, name_span));
                ids.push(id);
            }
        }
        self.program.push(op, ids, span);
        Ok(())
    }

    // ==================== OPERATIONS ====================

    fn parse_operation(&mut self) -> ParseResult<RawOp> {
        let start = self.span().start;

        let mut results = Vec::new();
        if self.at(TokenKind::ValueRef) {
            loop {
                let tok = self.expect(TokenKind::ValueRef)?;
                results.push((tok.text[1..].to_string(), tok.span));
                if self.at(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
            self.expect(TokenKind::Eq)?;
        }

        if !self.at(TokenKind::Ident) || !self.current().text.contains('.') {
            return Err(self.unexpected("operation name"));
        }
        let name_tok = self.advance();

        let mut items = Vec::new();
        if self.at_item_start() {
            items.push(self.parse_item()?);
            while self.at(TokenKind::Comma) {
                self.advance();
                items.push(self.parse_item()?);
            }
        }

        let attrs = if self.at(TokenKind::LBrace) {
            self.parse_attr_dict()?
        } else {
            IndexMap::new()
        };

        let mut types = Vec::new();
        if self.at(TokenKind::Colon) {
            self.advance();
            types.push(self.parse_type()?);
            while self.at(TokenKind::Comma) {
                self.advance();
                types.push(self.parse_type()?);
            }
        }

        Ok(RawOp {
            results,
            name: name_tok.text.clone(),
            name_span: name_tok.span,
            items,
            attrs,
            types,
            span: Span::new(start, self.prev_end()),
        })
    }

    /// Whether the next token begins an operand item of the current op
    fn at_item_start(&self) -> bool {
        match self.peek() {
            TokenKind::ValueRef => !matches!(self.peek_n(1), TokenKind::Eq | TokenKind::Comma)
                || self.peek_n(1) == TokenKind::Comma && !self.results_follow(),
            TokenKind::IntLit | TokenKind::FloatLit => true,
            TokenKind::Ident => !self.current().text.contains('.'),
            _ => false,
        }
    }

    /// `%a, %b = ...` starts a new operation; `%a, %b` inside an op does not
    fn results_follow(&self) -> bool {
        let mut n = 0;
        while self.peek_n(n) == TokenKind::ValueRef {
            match self.peek_n(n + 1) {
                TokenKind::Comma => n += 2,
                TokenKind::Eq => return true,
                _ => return false,
            }
        }
        false
    }

    fn parse_value_name(&mut self) -> ParseResult<(String, Span)> {
        let tok = self.expect(TokenKind::ValueRef)?;
        Ok((tok.text[1..].to_string(), tok.span))
    }

    /// `[` %v (`,` %v)* `]`
    fn parse_value_list(&mut self) -> ParseResult<Vec<(String, Span)>> {
        self.expect(TokenKind::LBracket)?;
        let mut values = Vec::new();
        if !self.at(TokenKind::RBracket) {
            values.push(self.parse_value_name()?);
            while self.at(TokenKind::Comma) {
                self.advance();
                values.push(self.parse_value_name()?);
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(values)
    }

    fn parse_item(&mut self) -> ParseResult<RawItem> {
        let start = self.span().start;
        match self.peek() {
            TokenKind::ValueRef => {
                let (name, name_span) = self.parse_value_name()?;
                let indices = if self.at(TokenKind::LBracket) {
                    self.parse_value_list()?
                } else {
                    Vec::new()
                };
                Ok(RawItem::Value {
                    name,
                    name_span,
                    indices,
                    span: Span::new(start, self.prev_end()),
                })
            }
            TokenKind::IntLit | TokenKind::FloatLit => {
                let literal = self.parse_number()?;
                Ok(RawItem::Literal(literal, Span::new(start, self.prev_end())))
            }
            TokenKind::Ident => {
                let tok = self.advance();
                match self.peek() {
                    TokenKind::Eq => {
                        self.advance();
                        let (name, name_span) = self.parse_value_name()?;
                        Ok(RawItem::Named {
                            key: tok.text.clone(),
                            name,
                            name_span,
                            span: Span::new(start, self.prev_end()),
                        })
                    }
                    TokenKind::LBracket => {
                        let values = self.parse_value_list()?;
                        Ok(RawItem::List {
                            key: tok.text.clone(),
                            values,
                            span: Span::new(start, self.prev_end()),
                        })
                    }
                    TokenKind::Lt if tok.text == "dense" => {
                        let literal = self.parse_dense()?;
                        Ok(RawItem::Literal(literal, Span::new(start, self.prev_end())))
                    }
                    _ => Ok(RawItem::Keyword(tok.text.clone(), tok.span)),
                }
            }
            _ => Err(self.unexpected("operand")),
        }
    }

    fn parse_number(&mut self) -> ParseResult<RawLiteral> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::IntLit => tok
                .text
                .parse()
                .map(RawLiteral::Int)
                .map_err(|_| self.invalid_type("integer literal out of range", tok.span)),
            TokenKind::FloatLit => tok
                .text
                .parse()
                .map(RawLiteral::Float)
                .map_err(|_| self.invalid_type("malformed float literal", tok.span)),
            _ => Err(ProgramError::UnexpectedToken {
                expected: "number".to_string(),
                found: format!("`{}`", tok.text),
                span: tok.span.into(),
                src: self.file.to_named_source(),
            }),
        }
    }

    fn parse_float_value(&mut self) -> ParseResult<f64> {
        match self.parse_number()? {
            RawLiteral::Int(v) => Ok(v as f64),
            RawLiteral::Float(v) => Ok(v),
            _ => Err(self.unexpected("number")),
        }
    }

    /// `dense<1.0>` or `dense<[1.0, 2.0]>`
    fn parse_dense(&mut self) -> ParseResult<RawLiteral> {
        self.expect(TokenKind::Lt)?;
        let mut values = Vec::new();
        if self.at(TokenKind::LBracket) {
            self.advance();
            if !self.at(TokenKind::RBracket) {
                values.push(self.parse_float_value()?);
                while self.at(TokenKind::Comma) {
                    self.advance();
                    values.push(self.parse_float_value()?);
                }
            }
            self.expect(TokenKind::RBracket)?;
        } else {
            values.push(self.parse_float_value()?);
        }
        self.expect(TokenKind::Gt)?;
        Ok(RawLiteral::Dense(values))
    }

    // ==================== ATTRIBUTES ====================

    fn parse_attr_dict(&mut self) -> ParseResult<IndexMap<String, (AttrValue, Span)>> {
        self.expect(TokenKind::LBrace)?;
        let mut attrs = IndexMap::new();
        if !self.at(TokenKind::RBrace) {
            loop {
                let start = self.span().start;
                let key = self.expect(TokenKind::Ident)?.text.clone();
                let value = if self.at(TokenKind::Eq) {
                    self.advance();
                    self.parse_attr_value()?
                } else {
                    AttrValue::Unit
                };
                attrs.insert(key, (value, Span::new(start, self.prev_end())));
                if self.at(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(attrs)
    }

    fn parse_attr_value(&mut self) -> ParseResult<AttrValue> {
        match self.peek() {
            TokenKind::IntLit | TokenKind::FloatLit => match self.parse_number()? {
                RawLiteral::Int(v) => Ok(AttrValue::Int(v)),
                RawLiteral::Float(v) => Ok(AttrValue::Float(v)),
                _ => Err(self.unexpected("attribute value")),
            },
            TokenKind::Ident => Ok(AttrValue::Keyword(self.advance().text.clone())),
            TokenKind::LBracket => {
                self.advance();
                let mut values = Vec::new();
                if !self.at(TokenKind::RBracket) {
                    loop {
                        let tok = self.expect(TokenKind::IntLit)?;
                        let v = tok.text.parse().map_err(|_| {
                            self.invalid_type("integer literal out of range", tok.span)
                        })?;
                        values.push(v);
                        if self.at(TokenKind::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(AttrValue::Array(values))
            }
            _ => Err(self.unexpected("attribute value")),
        }
    }

    // ==================== TYPES ====================

    fn parse_type(&mut self) -> ParseResult<(Type, Span)> {
        let start = self.span().start;
        let tok = self.current();
        let ty = match tok.kind {
            TokenKind::Ident if tok.text == "vector" => Type::Vector(self.parse_vector_type()?),
            TokenKind::Ident if tok.text == "memref" => Type::MemRef(self.parse_memref_type()?),
            TokenKind::Ident => {
                self.advance();
                let elem = ElemType::from_name(&tok.text).ok_or_else(|| {
                    self.invalid_type(format!("unknown type `{}`", tok.text), tok.span)
                })?;
                Type::Scalar(elem)
            }
            TokenKind::DialectType => self.parse_dialect_type()?,
            _ => return Err(self.unexpected("type")),
        };
        Ok((ty, Span::new(start, self.prev_end())))
    }

    fn parse_elem_type(&mut self) -> ParseResult<ElemType> {
        let tok = self.expect(TokenKind::Ident)?;
        ElemType::from_name(&tok.text).ok_or_else(|| {
            self.invalid_type(format!("unknown element type `{}`", tok.text), tok.span)
        })
    }

    /// `vector<4x2xf16>`
    fn parse_vector_type(&mut self) -> ParseResult<VectorType> {
        self.advance();
        self.expect(TokenKind::Lt)?;
        let dims = self.expect(TokenKind::Dims)?.dims();
        let elem = self.parse_elem_type()?;
        self.expect(TokenKind::Gt)?;
        Ok(VectorType::new(dims, elem))
    }

    /// `memref<16x8xf16, 3>`, `memref<*xf32>` or `memref<f32>`
    fn parse_memref_type(&mut self) -> ParseResult<MemRefType> {
        self.advance();
        self.expect(TokenKind::Lt)?;
        let shape = match self.peek() {
            TokenKind::Dims => Some(self.advance().dims()),
            TokenKind::UnrankedDims => {
                self.advance();
                None
            }
            _ => Some(Vec::new()),
        };
        let elem = self.parse_elem_type()?;
        let mut space = MemorySpace::Global;
        if self.at(TokenKind::Comma) {
            self.advance();
            let tok = self.expect(TokenKind::IntLit)?;
            space = tok
                .text
                .parse()
                .ok()
                .and_then(MemorySpace::from_address_space)
                .ok_or_else(|| {
                    self.invalid_type(format!("unknown address space {}", tok.text), tok.span)
                })?;
        }
        self.expect(TokenKind::Gt)?;
        Ok(MemRefType {
            shape,
            elem,
            space,
        })
    }

    fn parse_type_params(&mut self) -> ParseResult<Vec<(String, TypeParam, Span)>> {
        let mut params = Vec::new();
        if !self.at(TokenKind::Lt) {
            return Ok(params);
        }
        self.advance();
        loop {
            let start = self.span().start;
            let key = self.expect(TokenKind::Ident)?.text.clone();
            self.expect(TokenKind::Eq)?;
            let value = match self.peek() {
                TokenKind::IntLit => {
                    let tok = self.advance();
                    let v = tok.text.parse().map_err(|_| {
                        self.invalid_type("integer literal out of range", tok.span)
                    })?;
                    TypeParam::Int(v)
                }
                TokenKind::Ident
                    if matches!(self.current().text.as_str(), "memref" | "vector") =>
                {
                    TypeParam::Type(self.parse_type()?.0)
                }
                TokenKind::Ident => TypeParam::Keyword(self.advance().text.clone()),
                _ => return Err(self.unexpected("type parameter")),
            };
            params.push((key, value, Span::new(start, self.prev_end())));
            if self.at(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::Gt)?;
        Ok(params)
    }

    fn parse_dialect_type(&mut self) -> ParseResult<Type> {
        let tok = self.advance();
        let params = self.parse_type_params()?;

        let mut ints: FxHashMap<&str, i64> = FxHashMap::default();
        let mut keywords: FxHashMap<&str, (&str, Span)> = FxHashMap::default();
        let mut types: FxHashMap<&str, Type> = FxHashMap::default();
        for (key, value, span) in &params {
            match value {
                TypeParam::Int(v) => {
                    ints.insert(key.as_str(), *v);
                }
                TypeParam::Keyword(k) => {
                    keywords.insert(key.as_str(), (k.as_str(), *span));
                }
                TypeParam::Type(t) => {
                    types.insert(key.as_str(), t.clone());
                }
            }
        }

        match tok.text.as_str() {
            "!nvgpu.device.async.token" => Ok(Type::AsyncToken),
            "!nvgpu.mbarrier.token" => Ok(Type::MBarrierToken),
            "!nvgpu.mbarrier.group" => {
                let space = match ints.get("memorySpace") {
                    Some(n) => MemorySpace::from_address_space(*n as u64).ok_or_else(|| {
                        self.invalid_type(format!("unknown address space {}", n), tok.span)
                    })?,
                    None => MemorySpace::Shared,
                };
                let num_barriers = ints.get("num_barriers").copied().unwrap_or(1).max(0) as usize;
                Ok(Type::MBarrierGroup {
                    space,
                    num_barriers,
                })
            }
            "!nvgpu.tensormap.descriptor" => {
                let tensor = match types.remove("tensor") {
                    Some(Type::MemRef(m)) => m,
                    _ => {
                        return Err(
                            self.invalid_type("tensor-map descriptor needs `tensor = memref<..>`", tok.span)
                        );
                    }
                };
                let mut tm = TensorMapType::new(tensor);
                if let Some((k, span)) = keywords.get("swizzle") {
                    tm.swizzle = Swizzle::from_keyword(k)
                        .ok_or_else(|| self.invalid_type(format!("unknown swizzle `{}`", k), *span))?;
                }
                if let Some((k, span)) = keywords.get("l2promo") {
                    tm.l2promo = L2Promo::from_keyword(k)
                        .ok_or_else(|| self.invalid_type(format!("unknown l2promo `{}`", k), *span))?;
                }
                if let Some((k, span)) = keywords.get("oob") {
                    tm.oob = OobFill::from_keyword(k)
                        .ok_or_else(|| self.invalid_type(format!("unknown oob fill `{}`", k), *span))?;
                }
                if let Some((k, span)) = keywords.get("interleave") {
                    tm.interleave = Interleave::from_keyword(k).ok_or_else(|| {
                        self.invalid_type(format!("unknown interleave `{}`", k), *span)
                    })?;
                }
                Ok(Type::TensorMap(Box::new(tm)))
            }
            "!nvgpu.warpgroup.descriptor" => match types.remove("tensor") {
                Some(Type::MemRef(m)) => Ok(Type::WarpgroupDescriptor(m)),
                _ => Err(self.invalid_type(
                    "warp-group descriptor needs `tensor = memref<..>`",
                    tok.span,
                )),
            },
            "!nvgpu.warpgroup.accumulator" => match types.remove("fragmented") {
                Some(Type::Vector(v)) => Ok(Type::WarpgroupAccumulator(v)),
                _ => Err(self.invalid_type(
                    "warp-group accumulator needs `fragmented = vector<..>`",
                    tok.span,
                )),
            },
            other => Err(self.invalid_type(format!("unknown dialect type `{}`", other), tok.span)),
        }
    }
}
