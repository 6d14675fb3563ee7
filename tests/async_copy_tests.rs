//! Async copy tests

use nvgpu::ir::{AllocInit, ElemType, MemRefType, MemorySpace};
use nvgpu::sim::{AsyncCopyUnit, MemRef, SimError};
use nvgpu::{ProgramError, SimConfig};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn global(shape: &[usize], init: AllocInit) -> MemRef {
    MemRef::alloc(
        &MemRefType::ranked(shape.to_vec(), ElemType::F32, MemorySpace::Global),
        init,
    )
    .unwrap()
}

fn shared(shape: &[usize], init: AllocInit) -> MemRef {
    MemRef::alloc(
        &MemRefType::ranked(shape.to_vec(), ElemType::F32, MemorySpace::Shared),
        init,
    )
    .unwrap()
}

// ==================== Copy unit ====================

#[test]
fn test_short_source_zero_fills() {
    let src = global(&[8], AllocInit::Fill(3.0));
    let dst = shared(&[8], AllocInit::Fill(7.0));
    let mut unit = AsyncCopyUnit::new();

    let copy = unit.issue_copy(&src, &[0], &dst, &[2], 4, Some(1), true).unwrap();
    let group = unit.create_group(&[copy]).unwrap();
    unit.wait(group, None).unwrap();

    assert_eq!(dst.to_vec(), vec![7.0, 7.0, 3.0, 0.0, 0.0, 0.0, 7.0, 7.0]);
}

#[test]
fn test_source_captured_at_issue() {
    let src = global(&[4], AllocInit::Iota);
    let dst = shared(&[4], AllocInit::Zero);
    let mut unit = AsyncCopyUnit::new();

    let copy = unit.issue_copy(&src, &[0], &dst, &[0], 4, None, true).unwrap();
    src.store(&[0], 42.0).unwrap();
    let group = unit.create_group(&[copy]).unwrap();
    unit.wait(group, Some(0)).unwrap();

    assert_eq!(dst.to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_groups_retire_oldest_first() {
    let src = global(&[8], AllocInit::Iota);
    let dst = shared(&[8], AllocInit::Fill(-1.0));
    let mut unit = AsyncCopyUnit::new();

    let first = unit.issue_copy(&src, &[0], &dst, &[0], 4, None, false).unwrap();
    let g0 = unit.create_group(&[first]).unwrap();
    let second = unit.issue_copy(&src, &[4], &dst, &[4], 4, None, false).unwrap();
    let g1 = unit.create_group(&[second]).unwrap();
    assert_eq!(unit.outstanding_groups(), 2);

    // Leaves one group in flight
    let retired = unit.wait(g1, Some(1)).unwrap();
    assert_eq!(retired, 1);
    assert!(unit.is_complete(g0));
    assert!(!unit.is_complete(g1));
    assert_eq!(dst.load(&[3]).unwrap(), 3.0);
    assert_eq!(dst.load(&[4]).unwrap(), -1.0);

    assert!(unit.progress().unwrap());
    assert!(unit.is_complete(g1));
    assert_eq!(dst.load(&[7]).unwrap(), 7.0);
    assert!(!unit.progress().unwrap());
}

#[test]
fn test_wait_on_earlier_token_ignores_later_groups() {
    let src = global(&[8], AllocInit::Iota);
    let dst = shared(&[8], AllocInit::Zero);
    let mut unit = AsyncCopyUnit::new();

    let a = unit.issue_copy(&src, &[0], &dst, &[0], 4, None, false).unwrap();
    let g0 = unit.create_group(&[a]).unwrap();
    let b = unit.issue_copy(&src, &[4], &dst, &[4], 4, None, false).unwrap();
    let _g1 = unit.create_group(&[b]).unwrap();

    unit.wait(g0, None).unwrap();
    assert_eq!(unit.outstanding_groups(), 1);
}

#[test]
fn test_two_dimensional_offsets() {
    let src = global(&[4, 4], AllocInit::Iota);
    let dst = shared(&[2, 4], AllocInit::Zero);
    let mut unit = AsyncCopyUnit::new();

    let copy = unit.issue_copy(&src, &[2, 0], &dst, &[1, 0], 4, None, true).unwrap();
    let group = unit.create_group(&[copy]).unwrap();
    unit.wait(group, None).unwrap();

    assert_eq!(dst.to_vec(), vec![0.0, 0.0, 0.0, 0.0, 8.0, 9.0, 10.0, 11.0]);
}

#[test]
fn test_destination_span_out_of_bounds() {
    let src = global(&[8], AllocInit::Iota);
    let dst = shared(&[8], AllocInit::Zero);
    let mut unit = AsyncCopyUnit::new();

    let err = unit.issue_copy(&src, &[0], &dst, &[6], 4, None, false).unwrap_err();
    assert!(matches!(err, SimError::OutOfBounds { .. }));
}

#[test]
fn test_wait_on_foreign_token() {
    let src = global(&[8], AllocInit::Iota);
    let dst = shared(&[8], AllocInit::Zero);
    let mut other = AsyncCopyUnit::new();
    other.create_group(&[]).unwrap();
    let foreign = other.create_group(&[]).unwrap();

    let mut unit = AsyncCopyUnit::new();
    unit.issue_copy(&src, &[0], &dst, &[0], 4, None, false).unwrap();
    assert!(matches!(
        unit.wait(foreign, None),
        Err(SimError::Verify(_))
    ));
}

proptest! {
    #[test]
    fn test_wait_retires_oldest_groups_only(
        (groups, target, bound) in (1usize..8).prop_flat_map(|n| (Just(n), 0..n, 0u32..4))
    ) {
        let src = global(&[8], AllocInit::Iota);
        let dst = shared(&[8], AllocInit::Zero);
        let mut unit = AsyncCopyUnit::new();
        let tokens: Vec<_> = (0..groups)
            .map(|i| {
                let copy = unit.issue_copy(&src, &[i as i64], &dst, &[i as i64], 1, None, false).unwrap();
                unit.create_group(&[copy]).unwrap()
            })
            .collect();

        let retired = unit.wait(tokens[target], Some(bound)).unwrap();
        let expected = (target + 1).saturating_sub(bound as usize);
        prop_assert_eq!(retired, expected);
        for (i, token) in tokens.iter().enumerate() {
            prop_assert_eq!(unit.is_complete(*token), i < expected);
        }
        prop_assert_eq!(unit.outstanding_groups(), groups - expected);
    }
}

// ==================== Programs ====================

#[test]
fn test_each_thread_copies_its_row() {
    let exec = nvgpu::run(
        "%c0 = arith.constant 0\n\
         %tid = gpu.thread_id x\n\
         %src = memref.alloc {iota} : memref<4x4xf32>\n\
         %dst = memref.alloc : memref<4x4xf32, 3>\n\
         %t = nvgpu.device_async_copy %src[%tid, %c0], %dst[%tid, %c0], 4 {bypassL1}\n\
         %g = nvgpu.device_async_create_group %t\n\
         nvgpu.device_async_wait %g",
        SimConfig::new(4),
    )
    .unwrap();

    let expected: Vec<f64> = (0..16).map(f64::from).collect();
    assert_eq!(exec.buffers["dst"], expected);
    assert_eq!(exec.stats.copies_retired, 4);
    assert_eq!(exec.stats.groups_retired, 4);
}

#[test]
fn test_wait_leaves_newest_group_pending() {
    let exec = nvgpu::run(
        "%c0 = arith.constant 0\n\
         %c1 = arith.constant 1\n\
         %c4 = arith.constant 4\n\
         %c5 = arith.constant 5\n\
         %src = memref.alloc {iota} : memref<8xf32>\n\
         %dst = memref.alloc {fill = -1.0} : memref<8xf32, 3>\n\
         %t0 = nvgpu.device_async_copy %src[%c0], %dst[%c0], 4\n\
         %g0 = nvgpu.device_async_create_group %t0\n\
         %t1 = nvgpu.device_async_copy %src[%c4], %dst[%c4], 4\n\
         %g1 = nvgpu.device_async_create_group %t1\n\
         nvgpu.device_async_wait %g1 {numGroups = 1}\n\
         %x = memref.load %dst[%c1]\n\
         %y = memref.load %dst[%c5]\n\
         vector.print %x\n\
         vector.print %y",
        SimConfig::new(1),
    )
    .unwrap();

    assert_eq!(exec.output, vec!["1", "-1"]);
}

#[test]
fn test_src_elements_operand() {
    let exec = nvgpu::run(
        "%c0 = arith.constant 0\n\
         %c2 = arith.constant 2\n\
         %src = memref.alloc {fill = 5.0} : memref<8xf32>\n\
         %dst = memref.alloc {fill = 9.0} : memref<8xf32, 3>\n\
         %t = nvgpu.device_async_copy %src[%c0], %dst[%c0], 4, srcElements = %c2\n\
         %g = nvgpu.device_async_create_group %t\n\
         nvgpu.device_async_wait %g {numGroups = 0}",
        SimConfig::new(1),
    )
    .unwrap();

    assert_eq!(
        exec.buffers["dst"],
        vec![5.0, 5.0, 0.0, 0.0, 9.0, 9.0, 9.0, 9.0]
    );
}

#[test]
fn test_negative_src_elements_is_runtime_error() {
    // The count is only known once it is loaded
    let err = nvgpu::run(
        "%c0 = arith.constant 0\n\
         %n = memref.alloc {fill = -3} : memref<1xindex>\n\
         %count = memref.load %n[%c0]\n\
         %src = memref.alloc {fill = 5.0} : memref<8xf32>\n\
         %dst = memref.alloc {fill = 9.0} : memref<8xf32, 3>\n\
         %t = nvgpu.device_async_copy %src[%c0], %dst[%c0], 4, srcElements = %count",
        SimConfig::new(1),
    )
    .unwrap_err();

    match err.downcast_ref::<ProgramError>() {
        Some(ProgramError::Runtime { op, message, .. }) => {
            assert_eq!(op, "nvgpu.device_async_copy");
            assert!(message.contains("non-negative"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_out_of_bounds_copy_is_runtime_error() {
    let err = nvgpu::run(
        "%c0 = arith.constant 0\n\
         %c6 = arith.constant 6\n\
         %src = memref.alloc : memref<8xf32>\n\
         %dst = memref.alloc : memref<8xf32, 3>\n\
         %t = nvgpu.device_async_copy %src[%c0], %dst[%c6], 4",
        SimConfig::new(1),
    )
    .unwrap_err();

    match err.downcast_ref::<ProgramError>() {
        Some(ProgramError::Runtime { op, thread, .. }) => {
            assert_eq!(op, "nvgpu.device_async_copy");
            assert_eq!(*thread, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
}
