//! Simulated memory
//!
//! A `Buffer` is one allocation; a `MemRef` is a typed view of it. Casting
//! to an unranked memref keeps the buffer and its shape, so descriptors built
//! from the unranked view still know the global extents. Elements are held
//! as `f64` and rounded to the element type on every write.

use super::{SimError, SimResult, lock};
use crate::ir::{AllocInit, ElemType, MemRefType, MemorySpace};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Round `value` to what an element of type `elem` can hold
pub fn quantize(elem: ElemType, value: f64) -> f64 {
    match elem {
        ElemType::I1 => (value != 0.0) as i64 as f64,
        ElemType::I8 => (value as i64 as i8) as f64,
        ElemType::I16 => (value as i64 as i16) as f64,
        ElemType::I32 => (value as i64 as i32) as f64,
        ElemType::I64 | ElemType::Index => value.trunc(),
        ElemType::F64 => value,
        ElemType::F32 => value as f32 as f64,
        ElemType::TF32 | ElemType::F16 => round_mantissa(value, 10),
        ElemType::BF16 => round_mantissa(value, 7),
        ElemType::F8E4M3 => round_mantissa(value, 3),
        ElemType::F8E5M2 => round_mantissa(value, 2),
    }
}

/// Round an f32 to `bits` explicit mantissa bits, nearest-even
fn round_mantissa(value: f64, bits: u32) -> f64 {
    let x = value as f32;
    if !x.is_finite() {
        return x as f64;
    }
    let drop = 23 - bits;
    let raw = x.to_bits();
    let half = 1u32 << (drop - 1);
    let lsb = (raw >> drop) & 1;
    let rounded = raw.wrapping_add(half - 1 + lsb) & !((1u32 << drop) - 1);
    f32::from_bits(rounded) as f64
}

/// One allocation
#[derive(Debug)]
pub struct Buffer {
    space: MemorySpace,
    shape: Vec<usize>,
    elem: ElemType,
    data: Mutex<Vec<f64>>,
}

/// Typed view of a buffer
#[derive(Clone)]
pub struct MemRef {
    buffer: Arc<Buffer>,
    ty: MemRefType,
}

impl MemRef {
    /// Allocate a buffer for a ranked memref type
    pub fn alloc(ty: &MemRefType, init: AllocInit) -> SimResult<Self> {
        let shape = ty.shape.clone().ok_or_else(|| {
            SimError::InvalidValue(format!("cannot allocate unranked {}", ty))
        })?;
        let len: usize = shape.iter().product();
        let data = match init {
            AllocInit::Zero => vec![0.0; len],
            AllocInit::Fill(v) => vec![quantize(ty.elem, v); len],
            AllocInit::Iota => (0..len).map(|i| quantize(ty.elem, i as f64)).collect(),
        };
        Ok(Self {
            buffer: Arc::new(Buffer {
                space: ty.space,
                shape,
                elem: ty.elem,
                data: Mutex::new(data),
            }),
            ty: ty.clone(),
        })
    }

    /// Allocate and fill from `values`
    pub fn from_values(ty: &MemRefType, values: &[f64]) -> SimResult<Self> {
        let memref = Self::alloc(ty, AllocInit::Zero)?;
        memref.write_linear(0, values)?;
        Ok(memref)
    }

    pub fn ty(&self) -> &MemRefType {
        &self.ty
    }

    pub fn space(&self) -> MemorySpace {
        self.buffer.space
    }

    pub fn elem(&self) -> ElemType {
        self.buffer.elem
    }

    /// Shape of the underlying buffer (known even through an unranked view)
    pub fn shape(&self) -> &[usize] {
        &self.buffer.shape
    }

    pub fn len(&self) -> usize {
        self.buffer.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * self.buffer.elem.size_bytes() as usize
    }

    /// Reinterpret with another memref type over the same buffer
    pub fn cast(&self, ty: &MemRefType) -> SimResult<Self> {
        if let Some(shape) = &ty.shape
            && shape != &self.buffer.shape
        {
            return Err(SimError::InvalidValue(format!(
                "cannot view a {:?} buffer as {}",
                self.buffer.shape, ty
            )));
        }
        Ok(Self {
            buffer: Arc::clone(&self.buffer),
            ty: ty.clone(),
        })
    }

    /// Whether both views share a buffer
    pub fn same_buffer(&self, other: &MemRef) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Row-major linear offset of a multi-index
    pub fn offset(&self, index: &[i64]) -> SimResult<usize> {
        let shape = &self.buffer.shape;
        let out_of_bounds = || SimError::OutOfBounds {
            index: index.to_vec(),
            shape: shape.clone(),
        };
        if index.len() != shape.len() {
            return Err(out_of_bounds());
        }
        let mut offset = 0usize;
        for (i, dim) in index.iter().zip(shape) {
            if *i < 0 || *i as usize >= *dim {
                return Err(out_of_bounds());
            }
            offset = offset * dim + *i as usize;
        }
        Ok(offset)
    }

    pub fn load(&self, index: &[i64]) -> SimResult<f64> {
        let offset = self.offset(index)?;
        Ok(lock(&self.buffer.data)[offset])
    }

    pub fn store(&self, index: &[i64], value: f64) -> SimResult<()> {
        let offset = self.offset(index)?;
        lock(&self.buffer.data)[offset] = quantize(self.buffer.elem, value);
        Ok(())
    }

    /// Read `count` contiguous elements starting at a linear offset
    pub fn read_linear(&self, offset: usize, count: usize) -> SimResult<Vec<f64>> {
        let data = lock(&self.buffer.data);
        data.get(offset..offset + count)
            .map(<[f64]>::to_vec)
            .ok_or_else(|| SimError::OutOfBounds {
                index: vec![(offset + count) as i64],
                shape: vec![data.len()],
            })
    }

    /// Write contiguous elements starting at a linear offset
    pub fn write_linear(&self, offset: usize, values: &[f64]) -> SimResult<()> {
        let elem = self.buffer.elem;
        let mut data = lock(&self.buffer.data);
        let len = data.len();
        let slot = data
            .get_mut(offset..offset + values.len())
            .ok_or_else(|| SimError::OutOfBounds {
                index: vec![(offset + values.len()) as i64],
                shape: vec![len],
            })?;
        for (dst, v) in slot.iter_mut().zip(values) {
            *dst = quantize(elem, *v);
        }
        Ok(())
    }

    /// Snapshot of every element
    pub fn to_vec(&self) -> Vec<f64> {
        lock(&self.buffer.data).clone()
    }
}

impl fmt::Debug for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRef")
            .field("ty", &self.ty)
            .field("shape", &self.buffer.shape)
            .finish()
    }
}

impl PartialEq for MemRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_buffer(other) && self.ty == other.ty
    }
}

/// Iterate all multi-indices of `shape` in row-major order
pub fn indices(shape: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    let total: usize = shape.iter().product();
    (0..total).map(move |mut linear| {
        let mut index = vec![0; shape.len()];
        for (slot, dim) in index.iter_mut().zip(shape).rev() {
            *slot = linear % dim;
            linear /= dim;
        }
        index
    })
}
