//! Warp-group matrix multiply
//!
//! Operands are read from shared memory through descriptors; the accumulator
//! is a value that every multiply consumes and replaces. Each thread computes
//! the whole logical product, which is what the fragments of a warp group
//! hold together. Multiplies are committed as groups to a per-thread
//! `GroupQueue` and waited down to `wait_group`, like copy groups.

use super::group::GroupQueue;
use super::memory::{MemRef, quantize};
use super::{SimResult, Stats};
use crate::ir::{MemRefType, MmaShape, TensorMapType, VectorType};
use crate::verify::rules;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

/// Operand matrix in shared memory
#[derive(Debug, Clone, PartialEq)]
pub struct WarpgroupMatrixDescriptor {
    tensor: MemRef,
}

impl WarpgroupMatrixDescriptor {
    pub fn generate(tensor: &MemRef, tensor_map: &TensorMapType) -> SimResult<Self> {
        rules::check_generate_descriptor(tensor.ty(), tensor_map)?;
        Ok(Self {
            tensor: tensor.clone(),
        })
    }

    pub fn ty(&self) -> &MemRefType {
        self.tensor.ty()
    }

    /// Row-major (rows, cols, data), transposed on request
    fn matrix(&self, transpose: bool) -> (usize, usize, Vec<f64>) {
        let (rows, cols) = match self.tensor.shape() {
            [rows, cols] => (*rows, *cols),
            _ => (0, 0),
        };
        let data = self.tensor.to_vec();
        if !transpose {
            return (rows, cols, data);
        }
        let mut t = vec![0.0; data.len()];
        for r in 0..rows {
            for c in 0..cols {
                t[c * rows + r] = data[r * cols + c];
            }
        }
        (cols, rows, t)
    }
}

/// Accumulator value: logical (M, N) matrix
#[derive(Debug, Clone, PartialEq)]
pub struct MmaAccumulator {
    ty: VectorType,
    data: Vec<f64>,
}

impl MmaAccumulator {
    /// Zero accumulator of type `ty`
    pub fn init(ty: &VectorType) -> SimResult<Self> {
        rules::check_accumulator(ty)?;
        Ok(Self {
            ty: ty.clone(),
            data: vec![0.0; ty.num_elements()],
        })
    }

    pub fn ty(&self) -> &VectorType {
        &self.ty
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let cols = *self.ty.shape.get(1)?;
        if col >= cols {
            return None;
        }
        self.data.get(row * cols + col).copied()
    }
}

/// Per-thread warp-group MMA queue
#[derive(Debug, Default)]
pub struct WarpgroupMmaUnit {
    queue: GroupQueue<MmaShape>,
    stats: Option<Arc<Stats>>,
}

impl WarpgroupMmaUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: Arc<Stats>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::default()
        }
    }

    /// D = A * B + C, then wait until at most `wait_group` groups are
    /// outstanding
    pub fn multiply_accumulate(
        &mut self,
        a: &WarpgroupMatrixDescriptor,
        b: &WarpgroupMatrixDescriptor,
        accumulator: MmaAccumulator,
        wait_group: u32,
        transpose_a: bool,
        transpose_b: bool,
    ) -> SimResult<MmaAccumulator> {
        let shape = rules::check_warpgroup_mma(
            a.ty(),
            b.ty(),
            &accumulator.ty,
            &accumulator.ty,
            transpose_a,
            transpose_b,
        )?;

        let (m, k, lhs) = a.matrix(transpose_a);
        let (_, n, rhs) = b.matrix(transpose_b);
        let elem = accumulator.ty.elem;
        let mut data = accumulator.data;
        for i in 0..m {
            for j in 0..n {
                let dot: f64 = (0..k).map(|p| lhs[i * k + p] * rhs[p * n + j]).sum();
                data[i * n + j] = quantize(elem, data[i * n + j] + dot);
            }
        }

        self.queue.push(shape);
        let token = self.queue.seal();
        let retired = self
            .queue
            .drain_to::<Infallible>(wait_group as usize, |_, _| Ok(()))
            .unwrap_or_else(|never| match never {});
        if let Some(stats) = &self.stats {
            Stats::bump(&stats.wgmma_groups, 1);
        }
        debug!(%token, %shape, wait_group, retired, "warpgroup mma");

        Ok(MmaAccumulator {
            ty: accumulator.ty,
            data,
        })
    }

    /// Wait for every outstanding multiply, then write the accumulator
    pub fn store(&mut self, accumulator: MmaAccumulator, dst: &MemRef) -> SimResult<()> {
        rules::check_warpgroup_store(&accumulator.ty, dst.ty())?;
        self.queue
            .drain_to::<Infallible>(0, |_, _| Ok(()))
            .unwrap_or_else(|never| match never {});
        dst.write_linear(0, &accumulator.data)?;
        debug!(elements = accumulator.data.len(), "warpgroup mma store");
        Ok(())
    }

    pub fn outstanding_groups(&self) -> usize {
        self.queue.outstanding()
    }
}
