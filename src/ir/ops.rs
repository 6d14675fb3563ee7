//! Operations
//!
//! One variant per operation. Positional operands, named optional operands
//! and attributes are kept as separate fields so that any serialization
//! preserves the same structure the textual format uses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SSA value identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A memref-like operand followed by bracketed indices: `%m[%i, %j]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexed {
    pub base: ValueId,
    pub indices: Vec<ValueId>,
}

impl Indexed {
    pub fn new(base: ValueId, indices: Vec<ValueId>) -> Self {
        Self { base, indices }
    }
}

/// Literal of `arith.constant`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Vector literal; a single element is a splat
    Dense(Vec<f64>),
}

/// Integer comparison predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl CmpPredicate {
    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "eq" => CmpPredicate::Eq,
            "ne" => CmpPredicate::Ne,
            "slt" | "ult" => CmpPredicate::Slt,
            "sle" | "ule" => CmpPredicate::Sle,
            "sgt" | "ugt" => CmpPredicate::Sgt,
            "sge" | "uge" => CmpPredicate::Sge,
            _ => return None,
        })
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            CmpPredicate::Eq => "eq",
            CmpPredicate::Ne => "ne",
            CmpPredicate::Slt => "slt",
            CmpPredicate::Sle => "sle",
            CmpPredicate::Sgt => "sgt",
            CmpPredicate::Sge => "sge",
        }
    }

    pub fn evaluate(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpPredicate::Eq => lhs == rhs,
            CmpPredicate::Ne => lhs != rhs,
            CmpPredicate::Slt => lhs < rhs,
            CmpPredicate::Sle => lhs <= rhs,
            CmpPredicate::Sgt => lhs > rhs,
            CmpPredicate::Sge => lhs >= rhs,
        }
    }
}

/// Thread-index dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    X,
    Y,
    Z,
}

impl Dim {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "x" => Some(Dim::X),
            "y" => Some(Dim::Y),
            "z" => Some(Dim::Z),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Dim::X => "x",
            Dim::Y => "y",
            Dim::Z => "z",
        }
    }
}

/// Initial contents of a fresh allocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AllocInit {
    Zero,
    Fill(f64),
    /// Element `i` holds `i`
    Iota,
}

/// Rounding mode of `nvgpu.rcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rounding {
    Approx,
    Rn,
    Rz,
    Rm,
    Rp,
}

impl Rounding {
    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "approx" => Rounding::Approx,
            "rn" => Rounding::Rn,
            "rz" => Rounding::Rz,
            "rm" => Rounding::Rm,
            "rp" => Rounding::Rp,
            _ => return None,
        })
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Rounding::Approx => "approx",
            Rounding::Rn => "rn",
            Rounding::Rz => "rz",
            Rounding::Rm => "rm",
            Rounding::Rp => "rp",
        }
    }
}

impl fmt::Display for Rounding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())
    }
}

/// (M, N, K) shape of a warp-level multiply-accumulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MmaShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl MmaShape {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

impl fmt::Display for MmaShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.m, self.n, self.k)
    }
}

/// Operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // === Support ===
    Constant {
        value: ConstValue,
    },
    CmpI {
        predicate: CmpPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },
    ThreadId {
        dim: Dim,
    },
    /// Block-wide execution barrier
    ThreadBarrier,
    Alloc {
        init: AllocInit,
    },
    Cast {
        source: ValueId,
    },
    Load {
        memref: Indexed,
    },
    Store {
        value: ValueId,
        memref: Indexed,
    },
    Print {
        value: ValueId,
    },

    // === Async copy groups ===
    DeviceAsyncCopy {
        src: Indexed,
        dst: Indexed,
        dst_elements: u64,
        src_elements: Option<ValueId>,
        bypass_l1: bool,
    },
    DeviceAsyncCreateGroup {
        tokens: Vec<ValueId>,
    },
    DeviceAsyncWait {
        token: ValueId,
        num_groups: Option<u32>,
    },

    // === MBarrier ===
    MBarrierCreate,
    MBarrierInit {
        barrier: Indexed,
        count: ValueId,
        predicate: Option<ValueId>,
    },
    MBarrierArrive {
        barrier: Indexed,
    },
    MBarrierArriveNoComplete {
        barrier: Indexed,
        count: ValueId,
    },
    MBarrierArriveExpectTx {
        barrier: Indexed,
        tx_count: ValueId,
        predicate: Option<ValueId>,
    },
    MBarrierTestWait {
        barrier: Indexed,
        token: ValueId,
    },
    MBarrierTryWaitParity {
        barrier: Indexed,
        parity: ValueId,
        ticks: ValueId,
    },
    MBarrierInval {
        barrier: Indexed,
    },

    // === Tensor-map descriptors ===
    TmaCreateDescriptor {
        source: ValueId,
        box_dims: Vec<ValueId>,
    },
    TmaFenceDescriptor {
        descriptor: ValueId,
    },
    TmaPrefetchDescriptor {
        descriptor: ValueId,
        predicate: Option<ValueId>,
    },
    TmaAsyncLoad {
        /// Descriptor with its coordinates
        descriptor: Indexed,
        barrier: Indexed,
        dst: ValueId,
        multicast_mask: Option<ValueId>,
        predicate: Option<ValueId>,
    },
    TmaAsyncStore {
        src: ValueId,
        descriptor: Indexed,
        predicate: Option<ValueId>,
    },

    // === Warp-group MMA ===
    WarpgroupGenerateDescriptor {
        tensor: ValueId,
        tensor_map: ValueId,
    },
    WarpgroupInitAccumulator,
    WarpgroupMma {
        descriptor_a: ValueId,
        descriptor_b: ValueId,
        accumulator: ValueId,
        wait_group: u32,
        transpose_a: bool,
        transpose_b: bool,
    },
    WarpgroupMmaStore {
        accumulator: ValueId,
        dst: ValueId,
    },

    // === Warp-level MMA ===
    MmaSync {
        a: ValueId,
        b: ValueId,
        c: ValueId,
        shape: MmaShape,
        tf32_enabled: bool,
    },
    MmaSparseSync {
        a: ValueId,
        b: ValueId,
        c: ValueId,
        metadata: ValueId,
        shape: MmaShape,
        sparsity_selector: u32,
        tf32_enabled: bool,
    },
    Rcp {
        input: ValueId,
        rounding: Rounding,
        ftz: bool,
    },
}

impl Op {
    /// Operation name as written in the textual format
    pub fn name(&self) -> &'static str {
        match self {
            Op::Constant { .. } => "arith.constant",
            Op::CmpI { .. } => "arith.cmpi",
            Op::ThreadId { .. } => "gpu.thread_id",
            Op::ThreadBarrier => "gpu.barrier",
            Op::Alloc { .. } => "memref.alloc",
            Op::Cast { .. } => "memref.cast",
            Op::Load { .. } => "memref.load",
            Op::Store { .. } => "memref.store",
            Op::Print { .. } => "vector.print",
            Op::DeviceAsyncCopy { .. } => "nvgpu.device_async_copy",
            Op::DeviceAsyncCreateGroup { .. } => "nvgpu.device_async_create_group",
            Op::DeviceAsyncWait { .. } => "nvgpu.device_async_wait",
            Op::MBarrierCreate => "nvgpu.mbarrier.create",
            Op::MBarrierInit { .. } => "nvgpu.mbarrier.init",
            Op::MBarrierArrive { .. } => "nvgpu.mbarrier.arrive",
            Op::MBarrierArriveNoComplete { .. } => "nvgpu.mbarrier.arrive.nocomplete",
            Op::MBarrierArriveExpectTx { .. } => "nvgpu.mbarrier.arrive.expect_tx",
            Op::MBarrierTestWait { .. } => "nvgpu.mbarrier.test.wait",
            Op::MBarrierTryWaitParity { .. } => "nvgpu.mbarrier.try_wait.parity",
            Op::MBarrierInval { .. } => "nvgpu.mbarrier.inval",
            Op::TmaCreateDescriptor { .. } => "nvgpu.tma.create.descriptor",
            Op::TmaFenceDescriptor { .. } => "nvgpu.tma.fence.descriptor",
            Op::TmaPrefetchDescriptor { .. } => "nvgpu.tma.prefetch.descriptor",
            Op::TmaAsyncLoad { .. } => "nvgpu.tma.async.load",
            Op::TmaAsyncStore { .. } => "nvgpu.tma.async.store",
            Op::WarpgroupGenerateDescriptor { .. } => "nvgpu.warpgroup.generate.descriptor",
            Op::WarpgroupInitAccumulator => "nvgpu.warpgroup.mma.init.accumulator",
            Op::WarpgroupMma { .. } => "nvgpu.warpgroup.mma",
            Op::WarpgroupMmaStore { .. } => "nvgpu.warpgroup.mma.store",
            Op::MmaSync { .. } => "nvgpu.mma.sync",
            Op::MmaSparseSync { .. } => "nvgpu.mma.sp.sync",
            Op::Rcp { .. } => "nvgpu.rcp",
        }
    }

    /// Number of results the operation defines
    pub fn num_results(&self) -> usize {
        match self {
            Op::Store { .. }
            | Op::Print { .. }
            | Op::ThreadBarrier
            | Op::DeviceAsyncWait { .. }
            | Op::MBarrierInit { .. }
            | Op::MBarrierArriveExpectTx { .. }
            | Op::MBarrierTryWaitParity { .. }
            | Op::MBarrierInval { .. }
            | Op::TmaFenceDescriptor { .. }
            | Op::TmaPrefetchDescriptor { .. }
            | Op::TmaAsyncLoad { .. }
            | Op::TmaAsyncStore { .. }
            | Op::WarpgroupMmaStore { .. } => 0,
            _ => 1,
        }
    }

    /// All SSA operands, in positional order
    pub fn operands(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        let indexed = |out: &mut Vec<ValueId>, i: &Indexed| {
            out.push(i.base);
            out.extend(i.indices.iter().copied());
        };
        match self {
            Op::Constant { .. }
            | Op::ThreadId { .. }
            | Op::ThreadBarrier
            | Op::Alloc { .. }
            | Op::MBarrierCreate
            | Op::WarpgroupInitAccumulator => {}
            Op::CmpI { lhs, rhs, .. } => out.extend([*lhs, *rhs]),
            Op::Cast { source } => out.push(*source),
            Op::Load { memref } => indexed(&mut out, memref),
            Op::Store { value, memref } => {
                out.push(*value);
                indexed(&mut out, memref);
            }
            Op::Print { value } => out.push(*value),
            Op::DeviceAsyncCopy {
                src,
                dst,
                src_elements,
                ..
            } => {
                indexed(&mut out, src);
                indexed(&mut out, dst);
                out.extend(*src_elements);
            }
            Op::DeviceAsyncCreateGroup { tokens } => out.extend(tokens.iter().copied()),
            Op::DeviceAsyncWait { token, .. } => out.push(*token),
            Op::MBarrierInit {
                barrier,
                count,
                predicate,
            } => {
                indexed(&mut out, barrier);
                out.push(*count);
                out.extend(*predicate);
            }
            Op::MBarrierArrive { barrier } | Op::MBarrierInval { barrier } => {
                indexed(&mut out, barrier)
            }
            Op::MBarrierArriveNoComplete { barrier, count } => {
                indexed(&mut out, barrier);
                out.push(*count);
            }
            Op::MBarrierArriveExpectTx {
                barrier,
                tx_count,
                predicate,
            } => {
                indexed(&mut out, barrier);
                out.push(*tx_count);
                out.extend(*predicate);
            }
            Op::MBarrierTestWait { barrier, token } => {
                indexed(&mut out, barrier);
                out.push(*token);
            }
            Op::MBarrierTryWaitParity {
                barrier,
                parity,
                ticks,
            } => {
                indexed(&mut out, barrier);
                out.extend([*parity, *ticks]);
            }
            Op::TmaCreateDescriptor { source, box_dims } => {
                out.push(*source);
                out.extend(box_dims.iter().copied());
            }
            Op::TmaFenceDescriptor { descriptor } => out.push(*descriptor),
            Op::TmaPrefetchDescriptor {
                descriptor,
                predicate,
            } => {
                out.push(*descriptor);
                out.extend(*predicate);
            }
            Op::TmaAsyncLoad {
                descriptor,
                barrier,
                dst,
                multicast_mask,
                predicate,
            } => {
                indexed(&mut out, descriptor);
                indexed(&mut out, barrier);
                out.push(*dst);
                out.extend(*multicast_mask);
                out.extend(*predicate);
            }
            Op::TmaAsyncStore {
                src,
                descriptor,
                predicate,
            } => {
                out.push(*src);
                indexed(&mut out, descriptor);
                out.extend(*predicate);
            }
            Op::WarpgroupGenerateDescriptor { tensor, tensor_map } => {
                out.extend([*tensor, *tensor_map])
            }
            Op::WarpgroupMma {
                descriptor_a,
                descriptor_b,
                accumulator,
                ..
            } => out.extend([*descriptor_a, *descriptor_b, *accumulator]),
            Op::WarpgroupMmaStore { accumulator, dst } => out.extend([*accumulator, *dst]),
            Op::MmaSync { a, b, c, .. } => out.extend([*a, *b, *c]),
            Op::MmaSparseSync {
                a, b, c, metadata, ..
            } => out.extend([*a, *b, *c, *metadata]),
            Op::Rcp { input, .. } => out.push(*input),
        }
        out
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
