//! IR types
//!
//! Captures what the verifier needs to know about operands:
//! - Element types and their bit widths
//! - Memory spaces (global, shared)
//! - Shaped types (vector, memref)
//! - Opaque dialect types (tokens, barrier groups, descriptors, accumulators)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    I1,
    I8,
    I16,
    I32,
    I64,
    Index,
    F8E4M3,
    F8E5M2,
    F16,
    BF16,
    TF32,
    F32,
    F64,
}

impl ElemType {
    pub fn bit_width(&self) -> u32 {
        match self {
            ElemType::I1 => 1,
            ElemType::I8 | ElemType::F8E4M3 | ElemType::F8E5M2 => 8,
            ElemType::I16 | ElemType::F16 | ElemType::BF16 => 16,
            ElemType::I32 | ElemType::TF32 | ElemType::F32 => 32,
            ElemType::I64 | ElemType::Index | ElemType::F64 => 64,
        }
    }

    /// Storage size of one element in bytes
    pub fn size_bytes(&self) -> u32 {
        self.bit_width().div_ceil(8)
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            ElemType::F8E4M3
                | ElemType::F8E5M2
                | ElemType::F16
                | ElemType::BF16
                | ElemType::TF32
                | ElemType::F32
                | ElemType::F64
        )
    }

    /// Check if this is an integer type (including `index`)
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "i1" => ElemType::I1,
            "i8" => ElemType::I8,
            "i16" => ElemType::I16,
            "i32" => ElemType::I32,
            "i64" => ElemType::I64,
            "index" => ElemType::Index,
            "f8E4M3FN" => ElemType::F8E4M3,
            "f8E5M2" => ElemType::F8E5M2,
            "f16" => ElemType::F16,
            "bf16" => ElemType::BF16,
            "tf32" => ElemType::TF32,
            "f32" => ElemType::F32,
            "f64" => ElemType::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElemType::I1 => "i1",
            ElemType::I8 => "i8",
            ElemType::I16 => "i16",
            ElemType::I32 => "i32",
            ElemType::I64 => "i64",
            ElemType::Index => "index",
            ElemType::F8E4M3 => "f8E4M3FN",
            ElemType::F8E5M2 => "f8E5M2",
            ElemType::F16 => "f16",
            ElemType::BF16 => "bf16",
            ElemType::TF32 => "tf32",
            ElemType::F32 => "f32",
            ElemType::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// Memory space of a memref
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    /// Global device memory (DRAM)
    Global,

    /// Shared memory (on-chip, per block)
    Shared,
}

impl MemorySpace {
    /// Map a numeric address space (NVVM numbering) to a memory space
    pub fn from_address_space(space: u64) -> Option<Self> {
        match space {
            0 | 1 => Some(MemorySpace::Global),
            3 => Some(MemorySpace::Shared),
            _ => None,
        }
    }

    pub fn address_space(&self) -> u64 {
        match self {
            MemorySpace::Global => 1,
            MemorySpace::Shared => 3,
        }
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Global => write!(f, "global"),
            MemorySpace::Shared => write!(f, "shared"),
        }
    }
}

/// Vector type: a fixed-shape register value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorType {
    pub shape: Vec<usize>,
    pub elem: ElemType,
}

impl VectorType {
    pub fn new(shape: Vec<usize>, elem: ElemType) -> Self {
        Self { shape, elem }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl fmt::Display for VectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vector<")?;
        for dim in &self.shape {
            write!(f, "{}x", dim)?;
        }
        write!(f, "{}>", self.elem)
    }
}

/// Memref type: a view of a memory region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemRefType {
    /// `None` for unranked memrefs (`memref<*xf32>`)
    pub shape: Option<Vec<usize>>,
    pub elem: ElemType,
    pub space: MemorySpace,
}

impl MemRefType {
    pub fn ranked(shape: Vec<usize>, elem: ElemType, space: MemorySpace) -> Self {
        Self {
            shape: Some(shape),
            elem,
            space,
        }
    }

    pub fn unranked(elem: ElemType, space: MemorySpace) -> Self {
        Self {
            shape: None,
            elem,
            space,
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(Vec::len)
    }

    pub fn num_elements(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.iter().product())
    }

    pub fn size_bytes(&self) -> Option<usize> {
        self.num_elements()
            .map(|n| n * self.elem.size_bytes() as usize)
    }
}

impl fmt::Display for MemRefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memref<")?;
        match &self.shape {
            Some(shape) => {
                for dim in shape {
                    write!(f, "{}x", dim)?;
                }
            }
            None => write!(f, "*x")?,
        }
        write!(f, "{}", self.elem)?;
        if self.space == MemorySpace::Shared {
            write!(f, ", {}", self.space.address_space())?;
        }
        write!(f, ">")
    }
}

/// Shared-memory swizzle mode of a tensor map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Swizzle {
    None,
    B32,
    B64,
    B128,
}

/// L2 promotion of a tensor map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L2Promo {
    None,
    B64,
    B128,
    B256,
}

/// Fill value for box elements that fall outside the source region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OobFill {
    Zero,
    Nan,
}

/// Interleave layout of a tensor map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interleave {
    None,
    B16,
    B32,
}

macro_rules! keyword_enum {
    ($ty:ident { $($variant:ident => $name:literal),* $(,)? }) => {
        impl $ty {
            pub fn from_keyword(word: &str) -> Option<Self> {
                match word {
                    $($name => Some($ty::$variant),)*
                    _ => None,
                }
            }

            pub fn keyword(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.keyword())
            }
        }
    };
}

keyword_enum!(Swizzle { None => "none", B32 => "swizzle_32b", B64 => "swizzle_64b", B128 => "swizzle_128b" });
keyword_enum!(L2Promo { None => "none", B64 => "l2promo_64b", B128 => "l2promo_128b", B256 => "l2promo_256b" });
keyword_enum!(OobFill { Zero => "zero", Nan => "nan" });
keyword_enum!(Interleave { None => "none", B16 => "interleave_16b", B32 => "interleave_32b" });

/// Tensor-map descriptor type: the box view plus its encoding options
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMapType {
    /// Shape and element type of one box, resident in shared memory
    pub tensor: MemRefType,
    pub swizzle: Swizzle,
    pub l2promo: L2Promo,
    pub oob: OobFill,
    pub interleave: Interleave,
}

impl TensorMapType {
    pub fn new(tensor: MemRefType) -> Self {
        Self {
            tensor,
            swizzle: Swizzle::None,
            l2promo: L2Promo::None,
            oob: OobFill::Zero,
            interleave: Interleave::None,
        }
    }

    /// Rank of the box, i.e. the number of coordinates a load or store takes
    pub fn rank(&self) -> usize {
        self.tensor.rank().unwrap_or(0)
    }
}

impl fmt::Display for TensorMapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "!nvgpu.tensormap.descriptor<tensor = {}, swizzle = {}, l2promo = {}, oob = {}, interleave = {}>",
            self.tensor, self.swizzle, self.l2promo, self.oob, self.interleave
        )
    }
}

/// IR type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Scalar(ElemType),
    Vector(VectorType),
    MemRef(MemRefType),

    /// Token of one issued async copy, or of a sealed copy group
    AsyncToken,

    /// Fixed-size collection of mbarriers in one memory region
    MBarrierGroup {
        space: MemorySpace,
        num_barriers: usize,
    },

    /// Token of one barrier arrival (names the phase arrived on)
    MBarrierToken,

    TensorMap(Box<TensorMapType>),

    /// Warp-group operand descriptor over a shared-memory tensor
    WarpgroupDescriptor(MemRefType),

    /// Fragmented accumulator with its logical (M, N) shape
    WarpgroupAccumulator(VectorType),
}

impl Type {
    pub fn index() -> Self {
        Type::Scalar(ElemType::Index)
    }

    pub fn bool() -> Self {
        Type::Scalar(ElemType::I1)
    }

    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&VectorType> {
        match self {
            Type::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor_map(&self) -> Option<&TensorMapType> {
        match self {
            Type::TensorMap(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_index_like(&self) -> bool {
        matches!(self, Type::Scalar(e) if e.is_integer() && *e != ElemType::I1)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Scalar(ElemType::I1))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(e) => write!(f, "{}", e),
            Type::Vector(v) => write!(f, "{}", v),
            Type::MemRef(m) => write!(f, "{}", m),
            Type::AsyncToken => write!(f, "!nvgpu.device.async.token"),
            Type::MBarrierGroup {
                space,
                num_barriers,
            } => write!(
                f,
                "!nvgpu.mbarrier.group<memorySpace = {}, num_barriers = {}>",
                space.address_space(),
                num_barriers
            ),
            Type::MBarrierToken => write!(f, "!nvgpu.mbarrier.token"),
            Type::TensorMap(t) => write!(f, "{}", t),
            Type::WarpgroupDescriptor(m) => {
                write!(f, "!nvgpu.warpgroup.descriptor<tensor = {}>", m)
            }
            Type::WarpgroupAccumulator(v) => {
                write!(f, "!nvgpu.warpgroup.accumulator<fragmented = {}>", v)
            }
        }
    }
}
