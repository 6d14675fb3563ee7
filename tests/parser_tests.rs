//! Parser tests

use nvgpu::ProgramError;
use nvgpu::ir::{
    AllocInit, ConstValue, ElemType, MemRefType, MemorySpace, MmaShape, Op, Program, Rounding,
    Type,
};
use pretty_assertions::assert_eq;

fn parse(source: &str) -> Program {
    nvgpu::parse(source).unwrap_or_else(|e| panic!("parse failed: {:?}", e))
}

fn parse_err(source: &str) -> ProgramError {
    let file = nvgpu::SourceFile::new("test.mlir", source);
    let tokens = nvgpu::lexer::lex_file(&file).unwrap();
    match nvgpu::parser::parse(&tokens, &file) {
        Ok(program) => panic!("expected a parse error, got {:?}", program),
        Err(e) => e,
    }
}

const KITCHEN_SINK: &str = r#"
// every operation family in one program
%c0 = arith.constant 0
%c8 = arith.constant 8
%c16 = arith.constant 16
%true = arith.constant true
%tid = gpu.thread_id x
%p = arith.cmpi eq, %tid, %c0
%g = memref.alloc {iota} : memref<16x16xf32>
%s = memref.alloc {fill = 1.5} : memref<8x16xf32, 3>
%u = memref.cast %g : memref<*xf32>
%x = memref.load %g[%c0, %c8]
memref.store %x, %s[%c0, %c0]
%t0 = nvgpu.device_async_copy %g[%c0, %c0], %s[%c0, %c0], 4, srcElements = %c8 {bypassL1}
%grp = nvgpu.device_async_create_group %t0
nvgpu.device_async_wait %grp {numGroups = 0}
%bar = nvgpu.mbarrier.create : !nvgpu.mbarrier.group<memorySpace = 3, num_barriers = 1>
nvgpu.mbarrier.init %bar[%c0], %c8, predicate = %p
gpu.barrier
nvgpu.mbarrier.arrive.expect_tx %bar[%c0], %c16, predicate = %p
%tok = nvgpu.mbarrier.arrive.nocomplete %bar[%c0], %c8
%tm = nvgpu.tma.create.descriptor %u, box[%c8, %c16] : !nvgpu.tensormap.descriptor<tensor = memref<8x16xf32, 3>, swizzle = none, l2promo = none, oob = zero, interleave = none>
nvgpu.tma.fence.descriptor %tm
nvgpu.tma.prefetch.descriptor %tm, predicate = %p
nvgpu.tma.async.load %tm[%c0, %c0], %bar[%c0], %s, multicast_mask = %c0, predicate = %p
nvgpu.mbarrier.try_wait.parity %bar[%c0], %true, %c16
nvgpu.tma.async.store %s, %tm[%c0, %c0]
%done = nvgpu.mbarrier.test.wait %bar[%c0], %tok
nvgpu.mbarrier.inval %bar[%c0]
%acc = nvgpu.warpgroup.mma.init.accumulator : !nvgpu.warpgroup.accumulator<fragmented = vector<8x16xf32>>
%da = nvgpu.warpgroup.generate.descriptor %s, %tm
%acc2 = nvgpu.warpgroup.mma %da, %da, %acc {waitGroup = 1, transposeB}
nvgpu.warpgroup.mma.store %acc2, %s
%a = arith.constant dense<1.0> : vector<4x2xf16>
%b = arith.constant dense<[1.0, 2.0, 3.0, 4.0]> : vector<2x2xf16>
%c = arith.constant dense<0.0> : vector<2x2xf32>
%d = nvgpu.mma.sync %a, %b, %c {mmaShape = [16, 8, 16]}
%meta = arith.constant dense<0> : vector<2xi16>
%e = nvgpu.mma.sp.sync %a, %b, %c, metadata = %meta {mmaShape = [16, 8, 32], sparsitySelector = 1}
%r = nvgpu.rcp %c {rounding = approx, ftz}
vector.print %r
"#;

// ==================== Support operations ====================

#[test]
fn test_parse_constants() {
    let p = parse(
        "%i = arith.constant 3\n\
         %f = arith.constant 2.5 : f16\n\
         %b = arith.constant 1 : i1\n\
         %h = arith.constant 4 : f32\n\
         %v = arith.constant dense<[1.0, 2.0]> : vector<2xf32>",
    );
    assert_eq!(p.len(), 5);
    assert_eq!(p.values[0].ty, Type::index());
    assert_eq!(p.values[1].ty, Type::Scalar(ElemType::F16));
    assert_eq!(
        p.operations[2].op,
        Op::Constant {
            value: ConstValue::Bool(true)
        }
    );
    assert_eq!(
        p.operations[3].op,
        Op::Constant {
            value: ConstValue::Float(4.0)
        }
    );
    assert_eq!(
        p.operations[4].op,
        Op::Constant {
            value: ConstValue::Dense(vec![1.0, 2.0])
        }
    );
}

#[test]
fn test_parse_alloc_initializers() {
    let p = parse(
        "%a = memref.alloc : memref<4xf32, 3>\n\
         %b = memref.alloc {fill = 2} : memref<4xf32>\n\
         %c = memref.alloc {iota} : memref<2x2xf16>",
    );
    assert_eq!(p.operations[0].op, Op::Alloc { init: AllocInit::Zero });
    assert_eq!(p.operations[1].op, Op::Alloc { init: AllocInit::Fill(2.0) });
    assert_eq!(p.operations[2].op, Op::Alloc { init: AllocInit::Iota });
    assert_eq!(
        p.values[0].ty,
        Type::MemRef(MemRefType::ranked(vec![4], ElemType::F32, MemorySpace::Shared))
    );
}

#[test]
fn test_parse_load_infers_element_type() {
    let p = parse(
        "%c0 = arith.constant 0\n\
         %m = memref.alloc : memref<4xbf16>\n\
         %x = memref.load %m[%c0]",
    );
    assert_eq!(p.values[2].ty, Type::Scalar(ElemType::BF16));
}

// ==================== Dialect operations ====================

#[test]
fn test_parse_async_copy() {
    let p = parse(KITCHEN_SINK);
    let copy = p
        .operations
        .iter()
        .find(|o| matches!(o.op, Op::DeviceAsyncCopy { .. }))
        .unwrap();
    match &copy.op {
        Op::DeviceAsyncCopy {
            src,
            dst,
            dst_elements,
            src_elements,
            bypass_l1,
        } => {
            assert_eq!(src.indices.len(), 2);
            assert_eq!(dst.indices.len(), 2);
            assert_eq!(*dst_elements, 4);
            assert!(src_elements.is_some());
            assert!(*bypass_l1);
        }
        _ => unreachable!(),
    }
    assert_eq!(p.value_type(copy.results[0]), &Type::AsyncToken);
}

#[test]
fn test_parse_tma_load_named_operands() {
    let p = parse(KITCHEN_SINK);
    let load = p
        .operations
        .iter()
        .find_map(|o| match &o.op {
            Op::TmaAsyncLoad {
                descriptor,
                multicast_mask,
                predicate,
                ..
            } => Some((descriptor.indices.len(), multicast_mask.is_some(), predicate.is_some())),
            _ => None,
        })
        .unwrap();
    assert_eq!(load, (2, true, true));
}

#[test]
fn test_parse_mma_attributes() {
    let p = parse(KITCHEN_SINK);
    let sparse = p
        .operations
        .iter()
        .find_map(|o| match &o.op {
            Op::MmaSparseSync {
                shape,
                sparsity_selector,
                tf32_enabled,
                ..
            } => Some((*shape, *sparsity_selector, *tf32_enabled)),
            _ => None,
        })
        .unwrap();
    assert_eq!(sparse, (MmaShape::new(16, 8, 32), 1, false));

    let rcp = p
        .operations
        .iter()
        .find_map(|o| match &o.op {
            Op::Rcp { rounding, ftz, .. } => Some((*rounding, *ftz)),
            _ => None,
        })
        .unwrap();
    assert_eq!(rcp, (Rounding::Approx, true));
}

#[test]
fn test_parse_warpgroup_defaults() {
    let p = parse(KITCHEN_SINK);
    let mma = p
        .operations
        .iter()
        .find_map(|o| match &o.op {
            Op::WarpgroupMma {
                wait_group,
                transpose_a,
                transpose_b,
                ..
            } => Some((*wait_group, *transpose_a, *transpose_b)),
            _ => None,
        })
        .unwrap();
    assert_eq!(mma, (1, false, true));
}

// ==================== Printer ====================

#[test]
fn test_print_reparse_round_trip() {
    let first = parse(KITCHEN_SINK);
    let text = first.to_string();
    let second = parse(&text);

    let ops = |p: &Program| p.operations.iter().map(|o| o.op.clone()).collect::<Vec<_>>();
    let values = |p: &Program| {
        p.values
            .iter()
            .map(|v| (v.name.clone(), v.ty.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(ops(&first), ops(&second));
    assert_eq!(values(&first), values(&second));
    assert_eq!(text, second.to_string());
}

#[test]
fn test_print_snapshot() {
    let p = parse(
        "%c0 = arith.constant 0\n\
         %c1 = arith.constant 1\n\
         %bar = nvgpu.mbarrier.create : !nvgpu.mbarrier.group<memorySpace = 3, num_barriers = 2>\n\
         nvgpu.mbarrier.init %bar[%c0], %c1\n\
         %tok = nvgpu.mbarrier.arrive %bar[%c0]\n\
         %done = nvgpu.mbarrier.test.wait %bar[%c0], %tok\n\
         vector.print %done",
    );
    insta::assert_snapshot!(p.to_string(), @r"
    %c0 = arith.constant 0 : index
    %c1 = arith.constant 1 : index
    %bar = nvgpu.mbarrier.create : !nvgpu.mbarrier.group<memorySpace = 3, num_barriers = 2>
    nvgpu.mbarrier.init %bar[%c0], %c1
    %tok = nvgpu.mbarrier.arrive %bar[%c0] : !nvgpu.mbarrier.token
    %done = nvgpu.mbarrier.test.wait %bar[%c0], %tok : i1
    vector.print %done
    ");
}

#[test]
fn test_json_preserves_structure() {
    let p = parse("%c0 = arith.constant 0\n%t = gpu.thread_id y");
    let json = serde_json::to_value(&p).unwrap();
    assert_eq!(json["operations"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(json["values"][1]["name"], "t");
    assert_eq!(json["operations"][1]["op"]["ThreadId"]["dim"], "Y");
}

// ==================== Errors ====================

#[test]
fn test_unknown_operation() {
    let err = parse_err("nvgpu.frobnicate");
    assert!(matches!(err, ProgramError::UnknownOperation { ref name, .. } if name == "nvgpu.frobnicate"));
}

#[test]
fn test_undefined_value() {
    let err = parse_err("vector.print %nope");
    assert!(matches!(err, ProgramError::UndefinedValue { ref name, .. } if name == "nope"));
}

#[test]
fn test_duplicate_definition() {
    let err = parse_err("%a = arith.constant 0\n%a = arith.constant 1");
    assert!(matches!(err, ProgramError::DuplicateDefinition { .. }));
}

#[test]
fn test_unexpected_attribute() {
    let err = parse_err("%a = memref.alloc {bogus} : memref<4xf32>");
    match err {
        ProgramError::MalformedOperation { op, message, .. } => {
            assert_eq!(op, "memref.alloc");
            assert!(message.contains("bogus"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_missing_result_type() {
    let err = parse_err("%a = memref.alloc");
    assert!(matches!(err, ProgramError::MalformedOperation { .. }));
}

#[test]
fn test_wrong_result_count() {
    let err = parse_err("%a = arith.constant 0\n%x = vector.print %a");
    assert!(matches!(err, ProgramError::MalformedOperation { .. }));
}

#[test]
fn test_invalid_address_space() {
    let err = parse_err("%a = memref.alloc : memref<4xf32, 7>");
    assert!(matches!(err, ProgramError::InvalidType { .. }));
}

#[test]
fn test_unexpected_eof() {
    let err = parse_err("%a = arith.constant 0 :");
    assert!(matches!(err, ProgramError::UnexpectedEof { .. }));
}

#[test]
fn test_sparse_requires_metadata() {
    let err = parse_err(
        "%a = arith.constant dense<1.0> : vector<4x2xf16>\n\
         %d = nvgpu.mma.sp.sync %a, %a, %a {mmaShape = [16, 8, 32]}",
    );
    assert!(matches!(err, ProgramError::MalformedOperation { .. }));
}
