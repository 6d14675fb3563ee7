//! TMA tests

use nvgpu::SimConfig;
use nvgpu::ir::{AllocInit, ElemType, MemRefType, MemorySpace, OobFill, TensorMapType};
use nvgpu::sim::{Device, MBarrierGroup, MemRef, SimError, TensorMapDescriptor};
use pretty_assertions::assert_eq;

/// 4x8 iota region viewed as `memref<*xf32>`
fn source(device: &Device) -> MemRef {
    device
        .alloc(
            &MemRefType::ranked(vec![4, 8], ElemType::F32, MemorySpace::Global),
            AllocInit::Iota,
        )
        .unwrap()
        .cast(&MemRefType::unranked(ElemType::F32, MemorySpace::Global))
        .unwrap()
}

fn box_type() -> TensorMapType {
    TensorMapType::new(MemRefType::ranked(
        vec![2, 4],
        ElemType::F32,
        MemorySpace::Shared,
    ))
}

fn barrier(bytes: u32) -> MBarrierGroup {
    let group = MBarrierGroup::new(MemorySpace::Shared, 1).unwrap();
    group.init(0, 1, true).unwrap();
    group.arrive_expect_tx(0, bytes, true).unwrap();
    group
}

fn setup(device: &Device) -> (TensorMapDescriptor, MemRef, MemRef) {
    let src = source(device);
    let ty = box_type();
    let desc = device.tma().create_descriptor(&src, &[2, 4], &ty).unwrap();
    let dst = device.alloc(&ty.tensor, AllocInit::Zero).unwrap();
    (desc, src, dst)
}

// ==================== Loads ====================

#[test]
fn test_load_lands_on_progress() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, dst) = setup(&device);
    let bar = barrier(32);

    device
        .tma()
        .async_load(desc, &[1, 4], &bar, 0, &dst, None, true)
        .unwrap();
    assert_eq!(device.tma().inflight(), 1);
    assert_eq!(bar.phase(0).unwrap(), 0);

    assert_eq!(device.progress().unwrap(), 1);
    assert_eq!(
        dst.to_vec(),
        vec![12.0, 13.0, 14.0, 15.0, 20.0, 21.0, 22.0, 23.0]
    );
    assert_eq!(bar.phase(0).unwrap(), 1);
    assert_eq!(device.snapshot().tma_loads, 1);
}

#[test]
fn test_nan_fill_outside_source() {
    let device = Device::new(SimConfig::new(1));
    let src = source(&device);
    let mut ty = box_type();
    ty.oob = OobFill::Nan;
    let desc = device.tma().create_descriptor(&src, &[2, 4], &ty).unwrap();
    let dst = device.alloc(&ty.tensor, AllocInit::Zero).unwrap();
    let bar = barrier(32);

    device
        .tma()
        .async_load(desc, &[-1, 0], &bar, 0, &dst, None, true)
        .unwrap();
    device.progress().unwrap();

    let data = dst.to_vec();
    assert!(data[..4].iter().all(|v| v.is_nan()));
    assert_eq!(&data[4..], &[0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_false_predicate_issues_nothing() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, dst) = setup(&device);
    let bar = barrier(32);

    device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, None, false)
        .unwrap();
    assert_eq!(device.tma().inflight(), 0);
    assert_eq!(device.snapshot().tma_loads, 0);
}

#[test]
fn test_load_needs_initialized_barrier() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, dst) = setup(&device);
    let bar = MBarrierGroup::new(MemorySpace::Shared, 1).unwrap();

    let err = device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, None, true)
        .unwrap_err();
    assert_eq!(err, SimError::UninitializedBarrier(0));
}

#[test]
fn test_unknown_descriptor() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, _) = setup(&device);
    let other = Device::new(SimConfig::new(1));
    assert!(matches!(
        other.tma().fence(desc),
        Err(SimError::UnknownDescriptor(_))
    ));
}

// ==================== Multicast ====================

#[test]
fn test_multicast_to_local_and_remote_ctas() {
    let device = Device::new(SimConfig::new(1).with_cluster(4, 1));
    let (desc, _, dst) = setup(&device);
    let bar = barrier(32);

    device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, Some(0b1010), true)
        .unwrap();
    device.progress().unwrap();

    assert_eq!(&dst.to_vec()[..4], &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(device.snapshot().multicast_remote_writes, 1);
    assert_eq!(bar.phase(0).unwrap(), 1);
}

#[test]
fn test_multicast_skipping_local_cta() {
    let device = Device::new(SimConfig::new(1).with_cluster(4, 1));
    let (desc, _, dst) = setup(&device);
    let bar = barrier(32);

    device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, Some(0b0101), true)
        .unwrap();
    assert_eq!(device.tma().inflight(), 0);
    assert_eq!(dst.to_vec(), vec![0.0; 8]);
    assert_eq!(device.snapshot().multicast_remote_writes, 2);
}

#[test]
fn test_multicast_outside_cluster() {
    let device = Device::new(SimConfig::new(1).with_cluster(2, 0));
    let (desc, _, dst) = setup(&device);
    let bar = barrier(32);

    let err = device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, Some(0b100), true)
        .unwrap_err();
    assert!(matches!(err, SimError::InvalidValue(_)));
}

// ==================== Descriptor updates ====================

#[test]
fn test_replacement_needs_fence() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, dst) = setup(&device);
    let replacement = device
        .alloc(
            &MemRefType::ranked(vec![4, 8], ElemType::F32, MemorySpace::Global),
            AllocInit::Fill(5.0),
        )
        .unwrap();
    device.replace_descriptor_source(desc, &replacement).unwrap();

    // Stale encoding until the fence
    let bar = barrier(32);
    device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, None, true)
        .unwrap();
    device.progress().unwrap();
    assert_eq!(&dst.to_vec()[..4], &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(device.snapshot().hazards, 1);

    device.tma().fence(desc).unwrap();
    let bar = barrier(32);
    device
        .tma()
        .async_load(desc, &[0, 0], &bar, 0, &dst, None, true)
        .unwrap();
    device.progress().unwrap();
    assert_eq!(dst.to_vec(), vec![5.0; 8]);
    assert_eq!(device.snapshot().hazards, 1);
}

#[test]
fn test_replacement_must_match_rank() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, _) = setup(&device);
    let flat = device
        .alloc(
            &MemRefType::ranked(vec![32], ElemType::F32, MemorySpace::Global),
            AllocInit::Zero,
        )
        .unwrap();
    assert!(matches!(
        device.replace_descriptor_source(desc, &flat),
        Err(SimError::Verify(_))
    ));
}

#[test]
fn test_prefetch_cleared_by_fenced_replacement() {
    let device = Device::new(SimConfig::new(1));
    let (desc, src, _) = setup(&device);

    device.tma().prefetch(desc, false).unwrap();
    assert!(!device.tma().is_prefetched(desc).unwrap());
    device.tma().prefetch(desc, true).unwrap();
    assert!(device.tma().is_prefetched(desc).unwrap());

    device.replace_descriptor_source(desc, &src).unwrap();
    device.tma().fence(desc).unwrap();
    assert!(!device.tma().is_prefetched(desc).unwrap());
}

// ==================== Stores ====================

#[test]
fn test_store_writes_box() {
    let device = Device::new(SimConfig::new(1));
    let (desc, src, _) = setup(&device);
    let tile = device.alloc(&box_type().tensor, AllocInit::Iota).unwrap();

    device.tma().async_store(&tile, desc, &[1, 2], true).unwrap();
    let data = src.to_vec();
    assert_eq!(&data[10..14], &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(&data[18..22], &[4.0, 5.0, 6.0, 7.0]);
    assert_eq!(data[14], 14.0);
    assert_eq!(device.snapshot().tma_stores, 1);
}

#[test]
fn test_store_box_mismatch() {
    let device = Device::new(SimConfig::new(1));
    let (desc, _, _) = setup(&device);
    let tile = device
        .alloc(
            &MemRefType::ranked(vec![4, 4], ElemType::F32, MemorySpace::Shared),
            AllocInit::Zero,
        )
        .unwrap();
    assert!(matches!(
        device.tma().async_store(&tile, desc, &[0, 0], true),
        Err(SimError::Verify(_))
    ));
}

// ==================== Programs ====================

#[test]
fn test_leader_loads_for_the_block() {
    let exec = nvgpu::run(
        "%c0 = arith.constant 0\n\
         %c1 = arith.constant 1\n\
         %c2 = arith.constant 2\n\
         %c4 = arith.constant 4\n\
         %c32 = arith.constant 32\n\
         %false = arith.constant false\n\
         %tid = gpu.thread_id x\n\
         %leader = arith.cmpi eq, %tid, %c0\n\
         %g = memref.alloc {iota} : memref<4x8xf32>\n\
         %u = memref.cast %g : memref<*xf32>\n\
         %s = memref.alloc : memref<2x4xf32, 3>\n\
         %bar = nvgpu.mbarrier.create : !nvgpu.mbarrier.group<memorySpace = 3, num_barriers = 1>\n\
         %d = nvgpu.tma.create.descriptor %u, box[%c2, %c4] : !nvgpu.tensormap.descriptor<tensor = memref<2x4xf32, 3>>\n\
         nvgpu.mbarrier.init %bar[%c0], %c1, predicate = %leader\n\
         gpu.barrier\n\
         nvgpu.tma.prefetch.descriptor %d, predicate = %leader\n\
         nvgpu.mbarrier.arrive.expect_tx %bar[%c0], %c32, predicate = %leader\n\
         nvgpu.tma.async.load %d[%c1, %c4], %bar[%c0], %s, predicate = %leader\n\
         nvgpu.mbarrier.try_wait.parity %bar[%c0], %false, %c1\n\
         %x = memref.load %s[%c1, %c2]\n\
         vector.print %x",
        SimConfig::new(2),
    )
    .unwrap();

    assert_eq!(exec.output, vec!["22", "22"]);
    assert_eq!(exec.stats.tma_loads, 1);
    assert_eq!(exec.stats.phase_flips, 1);
}

#[test]
fn test_store_program() {
    let exec = nvgpu::run(
        "%c2 = arith.constant 2\n\
         %c4 = arith.constant 4\n\
         %g = memref.alloc : memref<4x8xf32>\n\
         %u = memref.cast %g : memref<*xf32>\n\
         %s = memref.alloc {fill = 7.0} : memref<2x4xf32, 3>\n\
         %d = nvgpu.tma.create.descriptor %u, box[%c2, %c4] : !nvgpu.tensormap.descriptor<tensor = memref<2x4xf32, 3>>\n\
         nvgpu.tma.fence.descriptor %d\n\
         nvgpu.tma.async.store %s, %d[%c2, %c4]",
        SimConfig::new(1),
    )
    .unwrap();

    let g = &exec.buffers["g"];
    assert_eq!(&g[20..24], &[7.0; 4]);
    assert_eq!(&g[28..32], &[7.0; 4]);
    assert_eq!(g.iter().filter(|v| **v == 7.0).count(), 8);
}
