//! Matrix multiply and reciprocal tests

use nvgpu::ir::{ElemType, MmaShape, Rounding};
use nvgpu::sim::{LaneFragments, MmaLayout, SimError, WarpExchange, rcp};
use nvgpu::{ProgramError, SimConfig};
use pretty_assertions::assert_eq;
use std::sync::atomic::AtomicBool;

const ROWS: usize = 16;
const COLS: usize = 8;

fn per_reg(layout: MmaLayout) -> usize {
    match layout {
        MmaLayout::Tf32M16N8K8 => 1,
        _ => 2,
    }
}

/// Split logical A (16xK), B (Kx8) and C (16x8) into lane fragments
fn scatter(layout: MmaLayout, a: &[f64], b: &[f64], c: &[f64]) -> Vec<LaneFragments> {
    let k = layout.k();
    let per_reg = per_reg(layout);
    let a_regs = ROWS * k / 32 / per_reg;
    let b_regs = k * COLS / 32 / per_reg;
    (0..32)
        .map(|lane| {
            let mut frag = LaneFragments::default();
            for reg in 0..a_regs {
                for elem in 0..per_reg {
                    let (r, p) = layout.a_position(lane, reg, elem);
                    frag.a.push(a[r * k + p]);
                }
            }
            for reg in 0..b_regs {
                for elem in 0..per_reg {
                    let (p, col) = layout.b_position(lane, reg, elem);
                    frag.b.push(b[p * COLS + col]);
                }
            }
            for i in 0..4 {
                let (r, col) = layout.c_position(lane, i / 2, i % 2);
                frag.c.push(c[r * COLS + col]);
            }
            frag
        })
        .collect()
}

/// Reassemble the 16x8 result from lane fragments
fn gather(layout: MmaLayout, lanes: &[Vec<f64>]) -> Vec<f64> {
    let mut d = vec![0.0; ROWS * COLS];
    for (lane, frag) in lanes.iter().enumerate() {
        for (i, v) in frag.iter().enumerate() {
            let (r, col) = layout.c_position(lane, i / 2, i % 2);
            d[r * COLS + col] = *v;
        }
    }
    d
}

fn reference(k: usize, a: &[f64], b: &[f64], c: &[f64]) -> Vec<f64> {
    (0..ROWS * COLS)
        .map(|idx| {
            let (r, col) = (idx / COLS, idx % COLS);
            c[idx] + (0..k).map(|p| a[r * k + p] * b[p * COLS + col]).sum::<f64>()
        })
        .collect()
}

fn operands(k: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let a = (0..ROWS * k).map(|i| ((i % 7) as f64) - 3.0).collect();
    let b = (0..k * COLS).map(|i| ((i % 5) as f64) * 0.5).collect();
    let c = (0..ROWS * COLS).map(|i| i as f64).collect();
    (a, b, c)
}

// ==================== Fragment layouts ====================

#[test]
fn test_layouts_multiply_logical_matrices() {
    for layout in [MmaLayout::F16M16N8K16, MmaLayout::F16M16N8K8] {
        let k = layout.k();
        let (a, b, c) = operands(k);
        let lanes = scatter(layout, &a, &b, &c);
        let d = gather(layout, &layout.execute(&lanes, ElemType::F32));
        assert_eq!(d, reference(k, &a, &b, &c), "{:?}", layout);
    }
}

#[test]
fn test_tf32_operands_are_rounded() {
    let layout = MmaLayout::Tf32M16N8K8;
    let fine = 1.0 + 2f64.powi(-12);
    let a = vec![fine; ROWS * 8];
    let b = vec![1.0; 8 * COLS];
    let c = vec![0.0; ROWS * COLS];

    let lanes = scatter(layout, &a, &b, &c);
    let d = gather(layout, &layout.execute(&lanes, ElemType::F32));
    assert!(d.iter().all(|v| *v == 8.0));
}

#[test]
fn test_layout_selection() {
    assert_eq!(
        MmaLayout::select(MmaShape::new(16, 8, 8), ElemType::TF32),
        Some(MmaLayout::Tf32M16N8K8)
    );
    assert_eq!(
        MmaLayout::select(MmaShape::new(16, 8, 8), ElemType::BF16),
        Some(MmaLayout::F16M16N8K8)
    );
    assert_eq!(MmaLayout::select(MmaShape::new(16, 8, 32), ElemType::I8), None);
}

// ==================== Warp exchange ====================

#[test]
fn test_warp_exchange_across_threads() {
    let layout = MmaLayout::F16M16N8K16;
    let (a, b, c) = operands(16);
    let lanes = scatter(layout, &a, &b, &c);
    let warp = WarpExchange::new(0, 32, 32);
    let abort = AtomicBool::new(false);

    let outputs: Vec<Vec<f64>> = std::thread::scope(|s| {
        let handles: Vec<_> = lanes
            .into_iter()
            .enumerate()
            .map(|(lane, frag)| {
                let warp = &warp;
                let abort = &abort;
                s.spawn(move || warp.mma_sync(lane, layout, frag, ElemType::F32, abort))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(gather(layout, &outputs), reference(16, &a, &b, &c));
}

#[test]
fn test_partial_warp_rejected() {
    let warp = WarpExchange::new(1, 16, 32);
    let err = warp
        .mma_sync(
            0,
            MmaLayout::F16M16N8K16,
            LaneFragments::default(),
            ElemType::F32,
            &AtomicBool::new(false),
        )
        .unwrap_err();
    assert_eq!(
        err,
        SimError::PartialWarp {
            warp: 1,
            lanes: 16,
            warp_size: 32
        }
    );
}

// ==================== Reciprocal ====================

#[test]
fn test_rcp_flushes_subnormal_results() {
    let plain = rcp(&[3.0e38], Rounding::Approx, false).unwrap();
    assert!(plain[0] > 0.0 && (plain[0] as f32).is_subnormal());
    let flushed = rcp(&[3.0e38, -3.0e38], Rounding::Approx, true).unwrap();
    assert_eq!(flushed[0], 0.0);
    assert!(flushed[1] == 0.0 && flushed[1].is_sign_negative());
}

#[test]
fn test_rcp_program() {
    let exec = nvgpu::run(
        "%v = arith.constant dense<[2.0, 4.0, 0.5, -8.0]> : vector<2x2xf32>\n\
         %r = nvgpu.rcp %v {rounding = approx, ftz}\n\
         vector.print %r",
        SimConfig::new(1),
    )
    .unwrap();
    assert_eq!(exec.output, vec!["( ( 0.5, 0.25 ), ( 2, -0.125 ) )"]);
}

// ==================== Programs ====================

const WGMMA: &str = "%c2 = arith.constant 2\n\
    %c8 = arith.constant 8\n\
    %g = memref.alloc : memref<8x8xf16>\n\
    %u = memref.cast %g : memref<*xf16>\n\
    %tma = nvgpu.tma.create.descriptor %u, box[%c2, %c8] : !nvgpu.tensormap.descriptor<tensor = memref<2x8xf16, 3>>\n\
    %tmb = nvgpu.tma.create.descriptor %u, box[%c8, %c8] : !nvgpu.tensormap.descriptor<tensor = memref<8x8xf16, 3>>\n\
    %a = memref.alloc {iota} : memref<2x8xf16, 3>\n\
    %b = memref.alloc {fill = 1.0} : memref<8x8xf16, 3>\n\
    %da = nvgpu.warpgroup.generate.descriptor %a, %tma\n\
    %db = nvgpu.warpgroup.generate.descriptor %b, %tmb\n\
    %acc = nvgpu.warpgroup.mma.init.accumulator : !nvgpu.warpgroup.accumulator<fragmented = vector<2x8xf32>>\n\
    %r1 = nvgpu.warpgroup.mma %da, %db, %acc {waitGroup = 1}\n\
    %r2 = nvgpu.warpgroup.mma %da, %db, %r1\n\
    %out = memref.alloc : memref<2x8xf32, 3>\n\
    nvgpu.warpgroup.mma.store %r2, %out";

#[test]
fn test_warpgroup_mma_program() {
    let exec = nvgpu::run(WGMMA, SimConfig::new(1)).unwrap();

    let mut expected = vec![56.0; 8];
    expected.extend([184.0; 8]);
    assert_eq!(exec.buffers["out"], expected);
    assert_eq!(exec.stats.wgmma_groups, 2);
}

#[test]
fn test_warpgroup_mma_per_thread() {
    let exec = nvgpu::run(WGMMA, SimConfig::new(4)).unwrap();
    assert_eq!(exec.stats.wgmma_groups, 8);
    assert_eq!(exec.buffers["out"][15], 184.0);
}

const MMA_SYNC: &str = "%a = arith.constant dense<1.0> : vector<4x2xf16>\n\
    %b = arith.constant dense<1.0> : vector<2x2xf16>\n\
    %c = arith.constant dense<1.0> : vector<2x2xf32>\n\
    %d = nvgpu.mma.sync %a, %b, %c {mmaShape = [16, 8, 16]}\n\
    vector.print %d";

#[test]
fn test_mma_sync_full_warp() {
    let exec = nvgpu::run(MMA_SYNC, SimConfig::new(32)).unwrap();
    assert_eq!(exec.output.len(), 32);
    assert!(
        exec.output
            .iter()
            .all(|line| line == "( ( 17, 17 ), ( 17, 17 ) )")
    );
}

#[test]
fn test_mma_sync_partial_warp() {
    let err = nvgpu::run(MMA_SYNC, SimConfig::new(16)).unwrap_err();
    match err.downcast_ref::<ProgramError>() {
        Some(ProgramError::Runtime { op, message, .. }) => {
            assert_eq!(op, "nvgpu.mma.sync");
            assert!(message.contains("16 of 32 lanes"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_sparse_mma_is_verify_only() {
    let source = "%a = arith.constant dense<1.0> : vector<4x2xf16>\n\
         %b = arith.constant dense<1.0> : vector<4x2xf16>\n\
         %c = arith.constant dense<0.0> : vector<2x2xf32>\n\
         %m = arith.constant dense<0> : vector<2xi16>\n\
         %d = nvgpu.mma.sp.sync %a, %b, %c, metadata = %m {mmaShape = [16, 8, 32], sparsitySelector = 0}";
    nvgpu::check(source).unwrap();

    let err = nvgpu::run(source, SimConfig::new(32)).unwrap_err();
    match err.downcast_ref::<ProgramError>() {
        Some(ProgramError::Runtime { op, message, .. }) => {
            assert_eq!(op, "nvgpu.mma.sp.sync");
            assert!(message.contains("not executed"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
}
