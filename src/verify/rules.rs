//! Verification rules
//!
//! Each rule is written against types only, so the program verifier and the
//! simulator API apply exactly the same contract.

use crate::diagnostics::VerifyError;
use crate::ir::{
    ElemType, MemRefType, MemorySpace, MmaShape, Rounding, Swizzle, TensorMapType, Type,
    VectorType,
};

pub type VerifyResult<T = ()> = Result<T, VerifyError>;

/// Threads per warp assumed by the fragment layout rules
pub const WARP_SIZE: usize = 32;

/// Largest tensor-map rank
pub const MAX_TMA_RANK: usize = 5;

/// Largest extent of one box dimension
pub const MAX_TMA_BOX_DIM: usize = 256;

/// Element types accepted as warp-group multiply operands
pub const WARPGROUP_OPERAND_TYPES: &[ElemType] = &[
    ElemType::F16,
    ElemType::BF16,
    ElemType::TF32,
    ElemType::F32,
    ElemType::F8E4M3,
    ElemType::F8E5M2,
    ElemType::I8,
];

// === Operand kinds ===

pub fn expect_index(ty: &Type, what: &str) -> VerifyResult {
    if ty.is_index_like() {
        Ok(())
    } else {
        Err(VerifyError::InvalidOperand(format!(
            "{} must be an integer or index, found {}",
            what, ty
        )))
    }
}

pub fn expect_bool(ty: &Type, what: &str) -> VerifyResult {
    if ty.is_bool() {
        Ok(())
    } else {
        Err(VerifyError::InvalidOperand(format!(
            "{} must be i1, found {}",
            what, ty
        )))
    }
}

pub fn expect_memref<'a>(ty: &'a Type, what: &str) -> VerifyResult<&'a MemRefType> {
    ty.as_memref().ok_or_else(|| {
        VerifyError::InvalidOperand(format!("{} must be a memref, found {}", what, ty))
    })
}

pub fn expect_vector<'a>(ty: &'a Type, what: &str) -> VerifyResult<&'a VectorType> {
    ty.as_vector().ok_or_else(|| {
        VerifyError::InvalidOperand(format!("{} must be a vector, found {}", what, ty))
    })
}

pub fn expect_tensor_map<'a>(ty: &'a Type, what: &str) -> VerifyResult<&'a TensorMapType> {
    ty.as_tensor_map().ok_or_else(|| {
        VerifyError::InvalidOperand(format!(
            "{} must be a tensor-map descriptor, found {}",
            what, ty
        ))
    })
}

/// Number of indices must equal the rank of a ranked memref
pub fn check_indices(memref: &MemRefType, indices: usize, what: &str) -> VerifyResult {
    match memref.rank() {
        Some(rank) if rank == indices => Ok(()),
        Some(rank) => Err(VerifyError::RankMismatch {
            what: what.to_string(),
            expected: rank,
            found: indices,
        }),
        None => Err(VerifyError::InvalidOperand(format!(
            "{} cannot be indexed: {} is unranked",
            what, memref
        ))),
    }
}

// === Async copy ===

/// Contract of one `device_async_copy`
pub fn check_async_copy(
    src: &MemRefType,
    src_indices: usize,
    dst: &MemRefType,
    dst_indices: usize,
    dst_elements: u64,
    src_elements: Option<u64>,
    bypass_l1: bool,
) -> VerifyResult {
    if src.space != MemorySpace::Global {
        return Err(VerifyError::InvalidAddressSpace(format!(
            "copy source must be in global memory, found {}",
            src
        )));
    }
    if dst.space != MemorySpace::Shared {
        return Err(VerifyError::InvalidAddressSpace(format!(
            "copy destination must be in shared memory, found {}",
            dst
        )));
    }
    if src.elem != dst.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "source element type {} differs from destination element type {}",
            src.elem, dst.elem
        )));
    }
    check_indices(src, src_indices, "copy source")?;
    check_indices(dst, dst_indices, "copy destination")?;

    let bytes = dst_elements
        .checked_mul(dst.elem.size_bytes() as u64)
        .filter(|bytes| matches!(bytes, 4 | 8 | 16))
        .ok_or_else(|| {
            VerifyError::InvalidAttribute(format!(
                "copy of {} x {} is not a 4, 8 or 16 byte transfer",
                dst_elements, dst.elem
            ))
        })?;
    if bypass_l1 && bytes != 16 {
        return Err(VerifyError::InvalidAttribute(format!(
            "bypassL1 requires a 16-byte transfer, found {} bytes",
            bytes
        )));
    }
    if let Some(n) = src_elements
        && n > dst_elements
    {
        return Err(VerifyError::ShapeMismatch(format!(
            "srcElements ({}) exceeds dstElements ({})",
            n, dst_elements
        )));
    }
    Ok(())
}

// === MBarrier ===

pub fn check_mbarrier_group(space: MemorySpace, num_barriers: usize) -> VerifyResult {
    if space != MemorySpace::Shared {
        return Err(VerifyError::InvalidAddressSpace(
            "mbarrier groups live in shared memory".to_string(),
        ));
    }
    if num_barriers == 0 {
        return Err(VerifyError::InvalidAttribute(
            "num_barriers must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// A barrier reference is a group plus exactly one barrier id
pub fn check_barrier_ref(group: &Type, indices: usize) -> VerifyResult {
    match group {
        Type::MBarrierGroup { .. } => {}
        other => {
            return Err(VerifyError::InvalidOperand(format!(
                "expected an mbarrier group, found {}",
                other
            )));
        }
    }
    if indices != 1 {
        return Err(VerifyError::RankMismatch {
            what: "mbarrier group".to_string(),
            expected: 1,
            found: indices,
        });
    }
    Ok(())
}

// === Tensor maps ===

/// Encoding constraints of a tensor-map descriptor type
pub fn check_tensor_map(tm: &TensorMapType) -> VerifyResult {
    let shape = tm.tensor.shape.as_ref().ok_or_else(|| {
        VerifyError::InvalidOperand("tensor-map box must be a ranked memref".to_string())
    })?;
    if shape.is_empty() || shape.len() > MAX_TMA_RANK {
        return Err(VerifyError::InvalidOperand(format!(
            "tensor-map rank must be between 1 and {}, found {}",
            MAX_TMA_RANK,
            shape.len()
        )));
    }
    if tm.tensor.space != MemorySpace::Shared {
        return Err(VerifyError::InvalidAddressSpace(format!(
            "tensor-map box must describe shared memory, found {}",
            tm.tensor
        )));
    }
    if let Some(dim) = shape.iter().find(|d| **d == 0 || **d > MAX_TMA_BOX_DIM) {
        return Err(VerifyError::ShapeMismatch(format!(
            "box dimension {} is outside 1..={}",
            dim, MAX_TMA_BOX_DIM
        )));
    }

    let inner = shape[shape.len() - 1];
    let inner_bytes = inner * tm.tensor.elem.size_bytes() as usize;
    if inner_bytes % 16 != 0 {
        return Err(VerifyError::ShapeMismatch(format!(
            "innermost box dimension spans {} bytes; it must be a multiple of 16",
            inner_bytes
        )));
    }
    let swizzle_bytes = match tm.swizzle {
        Swizzle::None => None,
        Swizzle::B32 => Some(32),
        Swizzle::B64 => Some(64),
        Swizzle::B128 => Some(128),
    };
    if let Some(limit) = swizzle_bytes
        && inner_bytes > limit
    {
        return Err(VerifyError::ShapeMismatch(format!(
            "innermost box dimension spans {} bytes, more than the {} swizzle span",
            inner_bytes, tm.swizzle
        )));
    }
    Ok(())
}

/// `tma.create.descriptor`: `box_values` holds the box operands known statically
pub fn check_create_descriptor(
    tm: &TensorMapType,
    source: &MemRefType,
    box_values: &[Option<i64>],
) -> VerifyResult {
    check_tensor_map(tm)?;
    if source.rank().is_some() {
        return Err(VerifyError::InvalidOperand(format!(
            "descriptor source must be an unranked memref, found {}",
            source
        )));
    }
    if source.space != MemorySpace::Global {
        return Err(VerifyError::InvalidAddressSpace(format!(
            "descriptor source must be in global memory, found {}",
            source
        )));
    }
    if source.elem != tm.tensor.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "source element type {} differs from descriptor element type {}",
            source.elem, tm.tensor.elem
        )));
    }
    if box_values.len() != tm.rank() {
        return Err(VerifyError::RankMismatch {
            what: "tensor-map box".to_string(),
            expected: tm.rank(),
            found: box_values.len(),
        });
    }
    let shape = tm.tensor.shape.as_deref().unwrap_or(&[]);
    for (axis, (value, dim)) in box_values.iter().zip(shape).enumerate() {
        if let Some(v) = value
            && *v != *dim as i64
        {
            return Err(VerifyError::ShapeMismatch(format!(
                "box dimension {} is {}, descriptor type says {}",
                axis, v, dim
            )));
        }
    }
    Ok(())
}

/// Shared-memory side of a TMA transfer must match the box
fn check_tma_box(tm: &TensorMapType, buffer: &MemRefType, what: &str) -> VerifyResult {
    if buffer.space != MemorySpace::Shared {
        return Err(VerifyError::InvalidAddressSpace(format!(
            "{} must be in shared memory, found {}",
            what, buffer
        )));
    }
    if buffer.elem != tm.tensor.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "{} element type {} differs from descriptor element type {}",
            what, buffer.elem, tm.tensor.elem
        )));
    }
    if buffer.shape != tm.tensor.shape {
        return Err(VerifyError::ShapeMismatch(format!(
            "{} {} does not match the descriptor box {}",
            what, buffer, tm.tensor
        )));
    }
    Ok(())
}

pub fn check_tma_load(tm: &TensorMapType, coordinates: usize, dst: &MemRefType) -> VerifyResult {
    if coordinates != tm.rank() {
        return Err(VerifyError::RankMismatch {
            what: "tensor-map coordinates".to_string(),
            expected: tm.rank(),
            found: coordinates,
        });
    }
    check_tma_box(tm, dst, "load destination")
}

pub fn check_tma_store(tm: &TensorMapType, coordinates: usize, src: &MemRefType) -> VerifyResult {
    if coordinates != tm.rank() {
        return Err(VerifyError::RankMismatch {
            what: "tensor-map coordinates".to_string(),
            expected: tm.rank(),
            found: coordinates,
        });
    }
    check_tma_box(tm, src, "store source")
}

// === Warp-group MMA ===

/// `warpgroup.generate.descriptor`
pub fn check_generate_descriptor(tensor: &MemRefType, tm: &TensorMapType) -> VerifyResult {
    if tensor.space != MemorySpace::Shared {
        return Err(VerifyError::InvalidAddressSpace(format!(
            "warp-group operands must reside in shared memory, found {}",
            tensor
        )));
    }
    if !WARPGROUP_OPERAND_TYPES.contains(&tensor.elem) {
        return Err(VerifyError::TypeMismatch(format!(
            "{} is not a warp-group multiply operand type",
            tensor.elem
        )));
    }
    if tensor.elem != tm.tensor.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "tensor element type {} differs from tensor-map element type {}",
            tensor.elem, tm.tensor.elem
        )));
    }
    match tensor.rank() {
        Some(2) => Ok(()),
        Some(rank) => Err(VerifyError::RankMismatch {
            what: "warp-group operand".to_string(),
            expected: 2,
            found: rank,
        }),
        None => Err(VerifyError::InvalidOperand(
            "warp-group operand must be ranked".to_string(),
        )),
    }
}

pub fn check_accumulator(acc: &VectorType) -> VerifyResult {
    if acc.rank() != 2 {
        return Err(VerifyError::RankMismatch {
            what: "accumulator".to_string(),
            expected: 2,
            found: acc.rank(),
        });
    }
    if !matches!(acc.elem, ElemType::F32 | ElemType::F16 | ElemType::I32) {
        return Err(VerifyError::TypeMismatch(format!(
            "accumulator element type must be f32, f16 or i32, found {}",
            acc.elem
        )));
    }
    Ok(())
}

fn matrix_dims(tensor: &MemRefType) -> VerifyResult<(usize, usize)> {
    match tensor.shape.as_deref() {
        Some([rows, cols]) => Ok((*rows, *cols)),
        _ => Err(VerifyError::RankMismatch {
            what: "warp-group operand".to_string(),
            expected: 2,
            found: tensor.rank().unwrap_or(0),
        }),
    }
}

/// (M,K) x (K,N) -> (M,N) after transposes; returns the multiply shape
pub fn check_warpgroup_mma(
    a: &MemRefType,
    b: &MemRefType,
    acc_in: &VectorType,
    acc_out: &VectorType,
    transpose_a: bool,
    transpose_b: bool,
) -> VerifyResult<MmaShape> {
    check_accumulator(acc_in)?;
    if a.elem != b.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "A element type {} differs from B element type {}",
            a.elem, b.elem
        )));
    }
    if acc_in != acc_out {
        return Err(VerifyError::ShapeMismatch(format!(
            "accumulator in {} and out {} differ",
            acc_in, acc_out
        )));
    }

    let (a0, a1) = matrix_dims(a)?;
    let (b0, b1) = matrix_dims(b)?;
    let (m, ka) = if transpose_a { (a1, a0) } else { (a0, a1) };
    let (kb, n) = if transpose_b { (b1, b0) } else { (b0, b1) };

    if ka != kb {
        return Err(VerifyError::ShapeMismatch(format!(
            "A is {}x{} and B is {}x{}; inner dimensions differ",
            m, ka, kb, n
        )));
    }
    if acc_in.shape != [m, n] {
        return Err(VerifyError::ShapeMismatch(format!(
            "accumulator {} does not match the {}x{} product",
            acc_in, m, n
        )));
    }
    Ok(MmaShape::new(m, n, ka))
}

pub fn check_warpgroup_store(acc: &VectorType, dst: &MemRefType) -> VerifyResult {
    if dst.shape.as_deref() != Some(acc.shape.as_slice()) {
        return Err(VerifyError::ShapeMismatch(format!(
            "cannot store {} into {}",
            acc, dst
        )));
    }
    if dst.elem != acc.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "accumulator element type {} differs from destination element type {}",
            acc.elem, dst.elem
        )));
    }
    Ok(())
}

// === Warp-level MMA ===

/// Per-thread fragment shapes of one warp-level multiply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentShapes {
    pub a: [usize; 2],
    pub b: [usize; 2],
    pub c: [usize; 2],
}

/// Expected per-thread fragment shapes for `shape` with operand type `elem`
///
/// The fundamental tile is 8x8 with a 128-bit K extent (4 for f64); each
/// thread holds 32 bits of A and B and two accumulator elements per tile.
pub fn mma_fragment_shapes(
    shape: MmaShape,
    elem: ElemType,
    sparse: bool,
) -> VerifyResult<FragmentShapes> {
    let (tile_k, per_reg) = match elem {
        ElemType::F64 => {
            if sparse {
                return Err(VerifyError::TypeMismatch(
                    "f64 is not supported for sparse multiply".to_string(),
                ));
            }
            (4, 1)
        }
        ElemType::F32 | ElemType::TF32 | ElemType::F16 | ElemType::BF16 | ElemType::I8 => {
            let bits = elem.bit_width() as usize;
            (128 / bits, 32 / bits)
        }
        other => {
            return Err(VerifyError::TypeMismatch(format!(
                "expected operand type i8, f16, bf16, tf32 or f64, found {}",
                other
            )));
        }
    };

    if shape.m % 8 != 0 || shape.n % 8 != 0 || shape.k % tile_k != 0 {
        return Err(VerifyError::ShapeMismatch(format!(
            "mmaShape {} is not a multiple of the 8x8x{} tile",
            shape, tile_k
        )));
    }
    let m_tiles = shape.m / 8;
    let n_tiles = shape.n / 8;
    let k_tiles = shape.k / tile_k;
    let tiles = |x: usize, y: usize| {
        x.checked_mul(y).ok_or_else(|| {
            VerifyError::ShapeMismatch(format!("mmaShape {} has too many tiles", shape))
        })
    };
    let a_tiles = tiles(m_tiles, k_tiles)?;
    let a_rows = if sparse { a_tiles / 2 } else { a_tiles };

    Ok(FragmentShapes {
        a: [a_rows, per_reg],
        b: [tiles(k_tiles, n_tiles)?, per_reg],
        c: [tiles(m_tiles, n_tiles)?, 2],
    })
}

fn expect_fragment(vector: &VectorType, expected: [usize; 2], what: &str) -> VerifyResult {
    if vector.shape != expected {
        return Err(VerifyError::ShapeMismatch(format!(
            "expected {} fragment vector<{}x{}x{}>, found {}",
            what, expected[0], expected[1], vector.elem, vector
        )));
    }
    Ok(())
}

/// `mma.sync` / `mma.sp.sync` operand and result consistency
pub fn check_mma_sync(
    a: &VectorType,
    b: &VectorType,
    c: &VectorType,
    result: &VectorType,
    shape: MmaShape,
    sparse: bool,
    tf32_enabled: bool,
) -> VerifyResult {
    if a.elem != b.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "A element type {} differs from B element type {}",
            a.elem, b.elem
        )));
    }
    if c != result {
        return Err(if c.elem != result.elem {
            VerifyError::TypeMismatch(format!("accumulator {} and result {} differ", c, result))
        } else {
            VerifyError::ShapeMismatch(format!("accumulator {} and result {} differ", c, result))
        });
    }
    if a.elem == ElemType::F32 && !tf32_enabled {
        return Err(VerifyError::InvalidAttribute(
            "f32 operands require tf32Enabled".to_string(),
        ));
    }

    let expected = mma_fragment_shapes(shape, a.elem, sparse)?;
    expect_fragment(a, expected.a, "A")?;
    expect_fragment(b, expected.b, "B")?;
    expect_fragment(c, expected.c, "C")
}

/// Sparse metadata: exactly two packed 16-bit lanes
pub fn check_sparse_metadata(metadata: &VectorType, selector: u32) -> VerifyResult {
    if metadata.num_elements() != 2 {
        return Err(VerifyError::MetadataShapeMismatch(metadata.to_string()));
    }
    if metadata.elem != ElemType::I16 {
        return Err(VerifyError::TypeMismatch(format!(
            "sparse metadata must hold i16 lanes, found {}",
            metadata.elem
        )));
    }
    if selector > 1 {
        return Err(VerifyError::InvalidAttribute(format!(
            "sparsitySelector must be 0 or 1, found {}",
            selector
        )));
    }
    Ok(())
}

pub fn check_rcp(input: &VectorType, result: &VectorType, rounding: Rounding) -> VerifyResult {
    if rounding != Rounding::Approx {
        return Err(VerifyError::UnsupportedRoundingMode(rounding.to_string()));
    }
    if input.elem != ElemType::F32 {
        return Err(VerifyError::TypeMismatch(format!(
            "rcp operates on f32 elements, found {}",
            input.elem
        )));
    }
    if input.shape != result.shape {
        return Err(VerifyError::ShapeMismatch(format!(
            "rcp input {} and result {} differ",
            input, result
        )));
    }
    if input.elem != result.elem {
        return Err(VerifyError::TypeMismatch(format!(
            "rcp input {} and result {} differ",
            input, result
        )));
    }
    Ok(())
}
