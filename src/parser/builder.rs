//! Builds typed operations from the generic operation form

use super::ParseResult;
use crate::common::Span;
use crate::diagnostics::{ProgramError, SourceFile};
use crate::ir::{
    AllocInit, CmpPredicate, ConstValue, Dim, ElemType, Indexed, MmaShape, Op, Program,
    Rounding, Type, ValueId,
};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// Literal operand
#[derive(Debug, Clone, PartialEq)]
pub enum RawLiteral {
    Int(i64),
    Bool(bool),
    Float(f64),
    Dense(Vec<f64>),
}

/// One comma-separated operand item
#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    /// `%v` or `%v[%i, %j]`
    Value {
        name: String,
        name_span: Span,
        indices: Vec<(String, Span)>,
        span: Span,
    },
    /// `key = %v`
    Named {
        key: String,
        name: String,
        name_span: Span,
        span: Span,
    },
    /// `key[%a, %b]`
    List {
        key: String,
        values: Vec<(String, Span)>,
        span: Span,
    },
    Literal(RawLiteral, Span),
    Keyword(String, Span),
}

impl RawItem {
    fn span(&self) -> Span {
        match self {
            RawItem::Value { span, .. }
            | RawItem::Named { span, .. }
            | RawItem::List { span, .. }
            | RawItem::Literal(_, span)
            | RawItem::Keyword(_, span) => *span,
        }
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Unit,
    Int(i64),
    Float(f64),
    Keyword(String),
    Array(Vec<i64>),
}

/// Operation in generic form
#[derive(Debug, Clone)]
pub struct RawOp {
    pub results: Vec<(String, Span)>,
    pub name: String,
    pub name_span: Span,
    pub items: Vec<RawItem>,
    pub attrs: IndexMap<String, (AttrValue, Span)>,
    pub types: Vec<(Type, Span)>,
    pub span: Span,
}

struct OpBuilder<'a> {
    name: String,
    span: Span,
    program: &'a Program,
    names: &'a FxHashMap<String, (ValueId, Span)>,
    file: &'a SourceFile,
    positional: Vec<RawItem>,
    cursor: usize,
    named: IndexMap<String, RawItem>,
    attrs: IndexMap<String, (AttrValue, Span)>,
    types: Vec<(Type, Span)>,
}

impl<'a> OpBuilder<'a> {
    fn malformed(&self, message: impl Into<String>, span: Span) -> ProgramError {
        let message = message.into();
        ProgramError::MalformedOperation {
            op: self.name.clone(),
            message,
            span: span.into(),
            src: self.file.to_named_source(),
        }
    }

    fn resolve(&self, name: &str, span: Span) -> ParseResult<ValueId> {
        self.names
            .get(name)
            .map(|(id, _)| *id)
            .ok_or_else(|| ProgramError::UndefinedValue {
                name: name.to_string(),
                span: span.into(),
                src: self.file.to_named_source(),
            })
    }

    fn ty(&self, id: ValueId) -> &'a Type {
        self.program.value_type(id)
    }

    // === Positional items ===

    fn next_item(&mut self, what: &str) -> ParseResult<RawItem> {
        match self.positional.get(self.cursor) {
            Some(item) => {
                self.cursor += 1;
                Ok(item.clone())
            }
            None => Err(self.malformed(format!("missing {}", what), self.span)),
        }
    }

    fn has_next(&self) -> bool {
        self.cursor < self.positional.len()
    }

    fn indexed(&mut self, what: &str) -> ParseResult<Indexed> {
        match self.next_item(what)? {
            RawItem::Value {
                name,
                name_span,
                indices,
                ..
            } => {
                let base = self.resolve(&name, name_span)?;
                let indices = indices
                    .iter()
                    .map(|(n, s)| self.resolve(n, *s))
                    .collect::<ParseResult<Vec<_>>>()?;
                Ok(Indexed::new(base, indices))
            }
            other => Err(self.malformed(format!("expected {}", what), other.span())),
        }
    }

    fn value(&mut self, what: &str) -> ParseResult<ValueId> {
        let item = self.next_item(what)?;
        match &item {
            RawItem::Value {
                name,
                name_span,
                indices,
                ..
            } if indices.is_empty() => self.resolve(name, *name_span),
            other => Err(self.malformed(format!("expected {}", what), other.span())),
        }
    }

    fn rest_values(&mut self, what: &str) -> ParseResult<Vec<ValueId>> {
        let mut values = Vec::new();
        while self.has_next() {
            values.push(self.value(what)?);
        }
        Ok(values)
    }

    fn literal(&mut self, what: &str) -> ParseResult<(RawLiteral, Span)> {
        match self.next_item(what)? {
            RawItem::Literal(lit, span) => Ok((lit, span)),
            RawItem::Keyword(word, span) if word == "true" || word == "false" => {
                Ok((RawLiteral::Bool(word == "true"), span))
            }
            other => Err(self.malformed(format!("expected {}", what), other.span())),
        }
    }

    fn keyword(&mut self, what: &str) -> ParseResult<(String, Span)> {
        match self.next_item(what)? {
            RawItem::Keyword(word, span) => Ok((word, span)),
            other => Err(self.malformed(format!("expected {}", what), other.span())),
        }
    }

    // === Named items ===

    fn named_value(&mut self, key: &str) -> ParseResult<Option<ValueId>> {
        match self.named.shift_remove(key) {
            Some(RawItem::Named {
                name, name_span, ..
            }) => self.resolve(&name, name_span).map(Some),
            Some(other) => Err(self.malformed(
                format!("expected `{} = %value`", key),
                other.span(),
            )),
            None => Ok(None),
        }
    }

    fn named_list(&mut self, key: &str) -> ParseResult<Vec<ValueId>> {
        match self.named.shift_remove(key) {
            Some(RawItem::List { values, .. }) => values
                .iter()
                .map(|(n, s)| self.resolve(n, *s))
                .collect(),
            Some(other) => Err(self.malformed(
                format!("expected `{}[...]`", key),
                other.span(),
            )),
            None => Err(self.malformed(format!("missing `{}[...]`", key), self.span)),
        }
    }

    // === Attributes ===

    fn flag(&mut self, key: &str) -> ParseResult<bool> {
        match self.attrs.shift_remove(key) {
            None => Ok(false),
            Some((AttrValue::Unit, _)) => Ok(true),
            Some((AttrValue::Keyword(word), span)) => match word.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(self.malformed(format!("`{}` is a flag", key), span)),
            },
            Some((_, span)) => Err(self.malformed(format!("`{}` is a flag", key), span)),
        }
    }

    fn int_attr(&mut self, key: &str) -> ParseResult<Option<(i64, Span)>> {
        match self.attrs.shift_remove(key) {
            None => Ok(None),
            Some((AttrValue::Int(v), span)) => Ok(Some((v, span))),
            Some((_, span)) => Err(self.malformed(format!("`{}` must be an integer", key), span)),
        }
    }

    fn u32_attr(&mut self, key: &str) -> ParseResult<Option<u32>> {
        match self.int_attr(key)? {
            None => Ok(None),
            Some((v, span)) => u32::try_from(v)
                .map(Some)
                .map_err(|_| self.malformed(format!("`{}` must be non-negative", key), span)),
        }
    }

    fn keyword_attr(&mut self, key: &str) -> ParseResult<Option<(String, Span)>> {
        match self.attrs.shift_remove(key) {
            None => Ok(None),
            Some((AttrValue::Keyword(word), span)) => Ok(Some((word, span))),
            Some((_, span)) => Err(self.malformed(format!("`{}` must be a keyword", key), span)),
        }
    }

    fn mma_shape(&mut self) -> ParseResult<MmaShape> {
        match self.attrs.shift_remove("mmaShape") {
            Some((AttrValue::Array(dims), span)) => match dims.as_slice() {
                [m, n, k] if *m > 0 && *n > 0 && *k > 0 => {
                    Ok(MmaShape::new(*m as usize, *n as usize, *k as usize))
                }
                _ => Err(self.malformed("mmaShape must be [M, N, K]", span)),
            },
            Some((_, span)) => Err(self.malformed("mmaShape must be [M, N, K]", span)),
            None => Err(self.malformed("missing `mmaShape`", self.span)),
        }
    }

    // === Result type ===

    /// Declared result type, or `inferred` when the type clause is omitted
    fn result_type(&mut self, inferred: Option<Type>) -> ParseResult<Type> {
        match self.types.first() {
            Some((ty, _)) => Ok(ty.clone()),
            None => inferred.ok_or_else(|| self.malformed("result type required", self.span)),
        }
    }

    /// Reject anything the operation did not consume
    fn finish(&self) -> ParseResult<()> {
        if let Some(item) = self.positional.get(self.cursor) {
            return Err(self.malformed("unexpected operand", item.span()));
        }
        if let Some((key, item)) = self.named.first() {
            return Err(self.malformed(format!("unexpected operand `{}`", key), item.span()));
        }
        if let Some((key, (_, span))) = self.attrs.first() {
            return Err(self.malformed(format!("unexpected attribute `{}`", key), *span));
        }
        Ok(())
    }
}

/// Build the typed operation and its result type
pub fn build(
    raw: RawOp,
    program: &Program,
    names: &FxHashMap<String, (ValueId, Span)>,
    file: &SourceFile,
) -> ParseResult<(Op, Option<Type>)> {
    let mut positional = Vec::new();
    let mut named = IndexMap::new();
    for item in raw.items {
        match &item {
            RawItem::Named { key, .. } | RawItem::List { key, .. } => {
                let key = key.clone();
                let span = item.span();
                if named.insert(key.clone(), item).is_some() {
                    return Err(ProgramError::MalformedOperation {
                        op: raw.name.clone(),
                        message: format!("`{}` given twice", key),
                        span: span.into(),
                        src: file.to_named_source(),
                    });
                }
            }
            _ => positional.push(item),
        }
    }

    let mut b = OpBuilder {
        name: raw.name.clone(),
        span: raw.span,
        program,
        names,
        file,
        positional,
        cursor: 0,
        named,
        attrs: raw.attrs,
        types: raw.types,
    };

    let (op, inferred): (Op, Option<Type>) = match raw.name.as_str() {
        // === Support ===
        "arith.constant" => {
            let (lit, span) = b.literal("literal")?;
            let (value, inferred) = match lit {
                RawLiteral::Int(v) => (ConstValue::Int(v), Some(Type::index())),
                RawLiteral::Bool(v) => (ConstValue::Bool(v), Some(Type::bool())),
                RawLiteral::Float(v) => (ConstValue::Float(v), Some(Type::Scalar(ElemType::F32))),
                RawLiteral::Dense(values) => (ConstValue::Dense(values), None),
            };
            let value = match (&value, b.types.first()) {
                (ConstValue::Int(v), Some((Type::Scalar(ElemType::I1), _))) => {
                    if *v != 0 && *v != 1 {
                        return Err(b.malformed("i1 constants are 0 or 1", span));
                    }
                    ConstValue::Bool(*v == 1)
                }
                (ConstValue::Int(v), Some((Type::Scalar(e), _))) if e.is_float() => {
                    ConstValue::Float(*v as f64)
                }
                _ => value,
            };
            (Op::Constant { value }, inferred)
        }
        "arith.cmpi" => {
            let (word, span) = b.keyword("comparison predicate")?;
            let predicate = CmpPredicate::from_keyword(&word)
                .ok_or_else(|| b.malformed(format!("unknown predicate `{}`", word), span))?;
            let lhs = b.value("left operand")?;
            let rhs = b.value("right operand")?;
            (Op::CmpI { predicate, lhs, rhs }, Some(Type::bool()))
        }
        "gpu.thread_id" => {
            let (word, span) = b.keyword("dimension")?;
            let dim = Dim::from_keyword(&word)
                .ok_or_else(|| b.malformed(format!("unknown dimension `{}`", word), span))?;
            (Op::ThreadId { dim }, Some(Type::index()))
        }
        "gpu.barrier" => (Op::ThreadBarrier, None),
        "memref.alloc" => {
            let init = if b.flag("iota")? {
                AllocInit::Iota
            } else {
                match b.attrs.shift_remove("fill") {
                    None => AllocInit::Zero,
                    Some((AttrValue::Float(v), _)) => AllocInit::Fill(v),
                    Some((AttrValue::Int(v), _)) => AllocInit::Fill(v as f64),
                    Some((_, span)) => return Err(b.malformed("`fill` must be a number", span)),
                }
            };
            (Op::Alloc { init }, None)
        }
        "memref.cast" => {
            let source = b.value("source memref")?;
            (Op::Cast { source }, None)
        }
        "memref.load" => {
            let memref = b.indexed("memref")?;
            let inferred = b.ty(memref.base).as_memref().map(|m| Type::Scalar(m.elem));
            (Op::Load { memref }, inferred)
        }
        "memref.store" => {
            let value = b.value("value")?;
            let memref = b.indexed("memref")?;
            (Op::Store { value, memref }, None)
        }
        "vector.print" => {
            let value = b.value("value")?;
            (Op::Print { value }, None)
        }

        // === Async copy groups ===
        "nvgpu.device_async_copy" => {
            let src = b.indexed("source")?;
            let dst = b.indexed("destination")?;
            let (lit, span) = b.literal("element count")?;
            let dst_elements = match lit {
                RawLiteral::Int(n) if n > 0 => n as u64,
                _ => return Err(b.malformed("element count must be a positive integer", span)),
            };
            let src_elements = b.named_value("srcElements")?;
            let bypass_l1 = b.flag("bypassL1")?;
            (
                Op::DeviceAsyncCopy {
                    src,
                    dst,
                    dst_elements,
                    src_elements,
                    bypass_l1,
                },
                Some(Type::AsyncToken),
            )
        }
        "nvgpu.device_async_create_group" => {
            let tokens = b.rest_values("copy token")?;
            (Op::DeviceAsyncCreateGroup { tokens }, Some(Type::AsyncToken))
        }
        "nvgpu.device_async_wait" => {
            let token = b.value("group token")?;
            let num_groups = b.u32_attr("numGroups")?;
            (Op::DeviceAsyncWait { token, num_groups }, None)
        }

        // === MBarrier ===
        "nvgpu.mbarrier.create" => (Op::MBarrierCreate, None),
        "nvgpu.mbarrier.init" => {
            let barrier = b.indexed("barrier")?;
            let count = b.value("arrival count")?;
            let predicate = b.named_value("predicate")?;
            (
                Op::MBarrierInit {
                    barrier,
                    count,
                    predicate,
                },
                None,
            )
        }
        "nvgpu.mbarrier.arrive" => {
            let barrier = b.indexed("barrier")?;
            (Op::MBarrierArrive { barrier }, Some(Type::MBarrierToken))
        }
        "nvgpu.mbarrier.arrive.nocomplete" => {
            let barrier = b.indexed("barrier")?;
            let count = b.value("arrival count")?;
            (
                Op::MBarrierArriveNoComplete { barrier, count },
                Some(Type::MBarrierToken),
            )
        }
        "nvgpu.mbarrier.arrive.expect_tx" => {
            let barrier = b.indexed("barrier")?;
            let tx_count = b.value("transaction count")?;
            let predicate = b.named_value("predicate")?;
            (
                Op::MBarrierArriveExpectTx {
                    barrier,
                    tx_count,
                    predicate,
                },
                None,
            )
        }
        "nvgpu.mbarrier.test.wait" => {
            let barrier = b.indexed("barrier")?;
            let token = b.value("barrier token")?;
            (Op::MBarrierTestWait { barrier, token }, Some(Type::bool()))
        }
        "nvgpu.mbarrier.try_wait.parity" => {
            let barrier = b.indexed("barrier")?;
            let parity = b.value("parity")?;
            let ticks = b.value("tick budget")?;
            (
                Op::MBarrierTryWaitParity {
                    barrier,
                    parity,
                    ticks,
                },
                None,
            )
        }
        "nvgpu.mbarrier.inval" => {
            let barrier = b.indexed("barrier")?;
            (Op::MBarrierInval { barrier }, None)
        }

        // === Tensor-map descriptors ===
        "nvgpu.tma.create.descriptor" => {
            let source = b.value("source memref")?;
            let box_dims = b.named_list("box")?;
            (Op::TmaCreateDescriptor { source, box_dims }, None)
        }
        "nvgpu.tma.fence.descriptor" => {
            let descriptor = b.value("descriptor")?;
            (Op::TmaFenceDescriptor { descriptor }, None)
        }
        "nvgpu.tma.prefetch.descriptor" => {
            let descriptor = b.value("descriptor")?;
            let predicate = b.named_value("predicate")?;
            (
                Op::TmaPrefetchDescriptor {
                    descriptor,
                    predicate,
                },
                None,
            )
        }
        "nvgpu.tma.async.load" => {
            let descriptor = b.indexed("descriptor")?;
            let barrier = b.indexed("barrier")?;
            let dst = b.value("destination")?;
            let multicast_mask = b.named_value("multicast_mask")?;
            let predicate = b.named_value("predicate")?;
            (
                Op::TmaAsyncLoad {
                    descriptor,
                    barrier,
                    dst,
                    multicast_mask,
                    predicate,
                },
                None,
            )
        }
        "nvgpu.tma.async.store" => {
            let src = b.value("source")?;
            let descriptor = b.indexed("descriptor")?;
            let predicate = b.named_value("predicate")?;
            (
                Op::TmaAsyncStore {
                    src,
                    descriptor,
                    predicate,
                },
                None,
            )
        }

        // === Warp-group MMA ===
        "nvgpu.warpgroup.generate.descriptor" => {
            let tensor = b.value("tensor")?;
            let tensor_map = b.value("tensor map")?;
            let inferred = b
                .ty(tensor)
                .as_memref()
                .map(|m| Type::WarpgroupDescriptor(m.clone()));
            (
                Op::WarpgroupGenerateDescriptor { tensor, tensor_map },
                inferred,
            )
        }
        "nvgpu.warpgroup.mma.init.accumulator" => (Op::WarpgroupInitAccumulator, None),
        "nvgpu.warpgroup.mma" => {
            let descriptor_a = b.value("A descriptor")?;
            let descriptor_b = b.value("B descriptor")?;
            let accumulator = b.value("accumulator")?;
            let wait_group = b.u32_attr("waitGroup")?.unwrap_or(1);
            let transpose_a = b.flag("transposeA")?;
            let transpose_b = b.flag("transposeB")?;
            let inferred = Some(b.ty(accumulator).clone());
            (
                Op::WarpgroupMma {
                    descriptor_a,
                    descriptor_b,
                    accumulator,
                    wait_group,
                    transpose_a,
                    transpose_b,
                },
                inferred,
            )
        }
        "nvgpu.warpgroup.mma.store" => {
            let accumulator = b.value("accumulator")?;
            let dst = b.value("destination")?;
            (Op::WarpgroupMmaStore { accumulator, dst }, None)
        }

        // === Warp-level MMA ===
        "nvgpu.mma.sync" => {
            let a = b.value("A")?;
            let bv = b.value("B")?;
            let c = b.value("C")?;
            let shape = b.mma_shape()?;
            let tf32_enabled = b.flag("tf32Enabled")?;
            let inferred = Some(b.ty(c).clone());
            (
                Op::MmaSync {
                    a,
                    b: bv,
                    c,
                    shape,
                    tf32_enabled,
                },
                inferred,
            )
        }
        "nvgpu.mma.sp.sync" => {
            let a = b.value("A")?;
            let bv = b.value("B")?;
            let c = b.value("C")?;
            let metadata = b
                .named_value("metadata")?
                .ok_or_else(|| b.malformed("missing `metadata = %value`", b.span))?;
            let shape = b.mma_shape()?;
            let sparsity_selector = b.u32_attr("sparsitySelector")?.unwrap_or(0);
            let tf32_enabled = b.flag("tf32Enabled")?;
            let inferred = Some(b.ty(c).clone());
            (
                Op::MmaSparseSync {
                    a,
                    b: bv,
                    c,
                    metadata,
                    shape,
                    sparsity_selector,
                    tf32_enabled,
                },
                inferred,
            )
        }
        "nvgpu.rcp" => {
            let input = b.value("input")?;
            let rounding = match b.keyword_attr("rounding")? {
                None => Rounding::Approx,
                Some((word, span)) => Rounding::from_keyword(&word)
                    .ok_or_else(|| b.malformed(format!("unknown rounding `{}`", word), span))?,
            };
            let ftz = b.flag("ftz")?;
            let inferred = Some(b.ty(input).clone());
            (
                Op::Rcp {
                    input,
                    rounding,
                    ftz,
                },
                inferred,
            )
        }

        other => {
            return Err(ProgramError::UnknownOperation {
                name: other.to_string(),
                span: raw.name_span.into(),
                src: file.to_named_source(),
            });
        }
    };

    b.finish()?;

    let expected = op.num_results();
    if raw.results.len() != expected {
        return Err(b.malformed(
            format!(
                "defines {} result(s), {} named",
                expected,
                raw.results.len()
            ),
            raw.span,
        ));
    }
    if b.types.len() > expected {
        return Err(b.malformed(
            format!("{} result type(s) given for {} result(s)", b.types.len(), expected),
            b.types[expected].1,
        ));
    }

    let result_type = if expected == 0 {
        None
    } else {
        Some(b.result_type(inferred)?)
    };
    Ok((op, result_type))
}
