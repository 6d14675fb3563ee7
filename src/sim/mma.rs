//! Warp-level matrix multiply and reciprocal
//!
//! `mma.sync` is warp-collective: every lane contributes its fragments of
//! A, B and C and receives its fragment of D. The lanes of a warp meet in a
//! `WarpExchange`; the last lane to arrive assembles the logical matrices,
//! multiplies, and scatters the result back.
//!
//! Fragment ownership, with `g = lane / 4` and `t = lane % 4`:
//!
//! | layout         | A reg i, elem j              | B reg i, elem j     |
//! |----------------|------------------------------|---------------------|
//! | f16 m16n8k16   | (g + 8(i&1), 2t + j + 8(i>>1)) | (2t + j + 8i, g)  |
//! | f16 m16n8k8    | (g + 8i, 2t + j)             | (2t + j, g)         |
//! | tf32 m16n8k8   | (g + 8(i&1), t + 4(i>>1))    | (t + 4i, g)         |
//!
//! C and D: reg i, elem j at (g + 8i, 2t + j).

use super::memory::quantize;
use super::{SimError, SimResult, lock};
use crate::diagnostics::VerifyError;
use crate::ir::{ElemType, MmaShape, Rounding};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tracing::trace;

const ROWS: usize = 16;
const COLS: usize = 8;

/// Warp-level fragment layouts the simulator executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmaLayout {
    /// f16 / bf16, m16n8k16
    F16M16N8K16,
    /// f16 / bf16, m16n8k8
    F16M16N8K8,
    /// tf32 (or f32 with tf32Enabled), m16n8k8
    Tf32M16N8K8,
}

impl MmaLayout {
    pub fn select(shape: MmaShape, elem: ElemType) -> Option<Self> {
        match (shape.m, shape.n, shape.k, elem) {
            (16, 8, 16, ElemType::F16 | ElemType::BF16) => Some(MmaLayout::F16M16N8K16),
            (16, 8, 8, ElemType::F16 | ElemType::BF16) => Some(MmaLayout::F16M16N8K8),
            (16, 8, 8, ElemType::F32 | ElemType::TF32) => Some(MmaLayout::Tf32M16N8K8),
            _ => None,
        }
    }

    pub fn k(&self) -> usize {
        match self {
            MmaLayout::F16M16N8K16 => 16,
            MmaLayout::F16M16N8K8 | MmaLayout::Tf32M16N8K8 => 8,
        }
    }

    /// Elements per A/B register
    fn per_reg(&self) -> usize {
        match self {
            MmaLayout::Tf32M16N8K8 => 1,
            _ => 2,
        }
    }

    /// (row, k) of A element `elem` of register `reg` held by `lane`
    pub fn a_position(&self, lane: usize, reg: usize, elem: usize) -> (usize, usize) {
        let (g, t) = (lane >> 2, lane % 4);
        match self {
            MmaLayout::F16M16N8K16 => (g + 8 * (reg & 1), t * 2 + elem + 8 * (reg >> 1)),
            MmaLayout::F16M16N8K8 => (g + 8 * reg, t * 2 + elem),
            MmaLayout::Tf32M16N8K8 => (g + 8 * (reg & 1), t + 4 * (reg >> 1)),
        }
    }

    /// (k, col) of B element `elem` of register `reg` held by `lane`
    pub fn b_position(&self, lane: usize, reg: usize, elem: usize) -> (usize, usize) {
        let (g, t) = (lane >> 2, lane % 4);
        match self {
            MmaLayout::F16M16N8K16 => (t * 2 + elem + 8 * reg, g),
            MmaLayout::F16M16N8K8 => (t * 2 + elem, g),
            MmaLayout::Tf32M16N8K8 => (t + 4 * reg, g),
        }
    }

    /// (row, col) of accumulator element `elem` of register `reg` held by `lane`
    pub fn c_position(&self, lane: usize, reg: usize, elem: usize) -> (usize, usize) {
        let (g, t) = (lane >> 2, lane % 4);
        (g + 8 * reg, t * 2 + elem)
    }

    /// Multiply the fragments of a whole warp; returns each lane's D fragment
    pub fn execute(&self, lanes: &[LaneFragments], acc_elem: ElemType) -> Vec<Vec<f64>> {
        let k = self.k();
        let per_reg = self.per_reg();
        let operand = |v: f64| match self {
            MmaLayout::Tf32M16N8K8 => quantize(ElemType::TF32, v),
            _ => v,
        };

        let mut a = vec![0.0; ROWS * k];
        let mut b = vec![0.0; k * COLS];
        let mut c = vec![0.0; ROWS * COLS];
        for (lane, frag) in lanes.iter().enumerate() {
            for (i, v) in frag.a.iter().enumerate() {
                let (r, p) = self.a_position(lane, i / per_reg, i % per_reg);
                a[r * k + p] = operand(*v);
            }
            for (i, v) in frag.b.iter().enumerate() {
                let (p, col) = self.b_position(lane, i / per_reg, i % per_reg);
                b[p * COLS + col] = operand(*v);
            }
            for (i, v) in frag.c.iter().enumerate() {
                let (r, col) = self.c_position(lane, i / 2, i % 2);
                c[r * COLS + col] = *v;
            }
        }

        (0..lanes.len())
            .map(|lane| {
                (0..4)
                    .map(|i| {
                        let (r, col) = self.c_position(lane, i / 2, i % 2);
                        let dot: f64 = (0..k).map(|p| a[r * k + p] * b[p * COLS + col]).sum();
                        quantize(acc_elem, c[r * COLS + col] + dot)
                    })
                    .collect()
            })
            .collect()
    }
}

/// One lane's operands, flattened row-major from their fragment vectors
#[derive(Debug, Clone, Default)]
pub struct LaneFragments {
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub c: Vec<f64>,
}

#[derive(Debug, Default)]
struct ExchangeState {
    arrived: usize,
    generation: u64,
    inputs: Vec<LaneFragments>,
    outputs: Vec<Vec<f64>>,
}

/// Rendezvous point of the lanes of one warp
#[derive(Debug)]
pub struct WarpExchange {
    warp: usize,
    lanes: usize,
    warp_size: usize,
    state: Mutex<ExchangeState>,
    ready: Condvar,
}

impl WarpExchange {
    pub fn new(warp: usize, lanes: usize, warp_size: usize) -> Self {
        Self {
            warp,
            lanes,
            warp_size,
            state: Mutex::new(ExchangeState {
                inputs: vec![LaneFragments::default(); lanes],
                outputs: vec![Vec::new(); lanes],
                ..ExchangeState::default()
            }),
            ready: Condvar::new(),
        }
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Contribute `fragments` for `lane` and wait for the whole warp
    ///
    /// Gives up when `abort` is raised by a failing thread.
    pub fn mma_sync(
        &self,
        lane: usize,
        layout: MmaLayout,
        fragments: LaneFragments,
        acc_elem: ElemType,
        abort: &AtomicBool,
    ) -> SimResult<Vec<f64>> {
        if self.lanes != self.warp_size {
            return Err(SimError::PartialWarp {
                warp: self.warp,
                lanes: self.lanes,
                warp_size: self.warp_size,
            });
        }

        let mut state = lock(&self.state);
        state.inputs[lane] = fragments;
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == self.lanes {
            state.outputs = layout.execute(&state.inputs, acc_elem);
            state.arrived = 0;
            state.generation += 1;
            trace!(warp = self.warp, ?layout, "mma.sync");
            self.ready.notify_all();
        } else {
            while state.generation == generation {
                if abort.load(Ordering::Relaxed) {
                    return Err(SimError::Aborted);
                }
                state = self
                    .ready
                    .wait_timeout(state, Duration::from_millis(1))
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            }
        }
        Ok(std::mem::take(&mut state.outputs[lane]))
    }
}

/// Elementwise approximate reciprocal in f32
///
/// With `ftz`, subnormal inputs and results flush to signed zero.
pub fn rcp(input: &[f64], rounding: Rounding, ftz: bool) -> SimResult<Vec<f64>> {
    if rounding != Rounding::Approx {
        return Err(VerifyError::UnsupportedRoundingMode(rounding.to_string()).into());
    }
    let flush = |x: f32| {
        if ftz && x.is_subnormal() {
            0.0f32.copysign(x)
        } else {
            x
        }
    };
    Ok(input
        .iter()
        .map(|v| flush(1.0 / flush(*v as f32)) as f64)
        .collect())
}
