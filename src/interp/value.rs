//! Runtime values for the interpreter

use crate::ir::{ElemType, VectorType};
use crate::sim::{
    CopyId, GroupToken, MBarrierGroup, MBarrierToken, MemRef, MmaAccumulator, TensorMapDescriptor,
    WarpgroupMatrixDescriptor,
};
use std::fmt;

/// Token produced by the async copy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncToken {
    /// One issued copy
    Copy(CopyId),
    /// A sealed group
    Group(GroupToken),
}

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer or index
    Int(i64),

    /// Boolean (i1)
    Bool(bool),

    /// Floating point scalar of any width
    Float(f64),

    /// Vector, elements row-major
    Vector { ty: VectorType, data: Vec<f64> },

    /// View of a simulated buffer
    MemRef(MemRef),

    AsyncToken(AsyncToken),

    /// Handle to a group of mbarriers
    Barriers(MBarrierGroup),

    BarrierToken(MBarrierToken),

    TensorMap(TensorMapDescriptor),

    WarpgroupDescriptor(WarpgroupMatrixDescriptor),

    Accumulator(MmaAccumulator),
}

impl Value {
    /// Scalar of element type `elem`
    pub fn scalar(elem: ElemType, v: f64) -> Self {
        match elem {
            ElemType::I1 => Value::Bool(v != 0.0),
            e if e.is_integer() => Value::Int(v as i64),
            _ => Value::Float(v),
        }
    }

    /// Get type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Bool(_) => "i1",
            Value::Float(_) => "float",
            Value::Vector { .. } => "vector",
            Value::MemRef(_) => "memref",
            Value::AsyncToken(_) => "async token",
            Value::Barriers(_) => "mbarrier group",
            Value::BarrierToken(_) => "mbarrier token",
            Value::TensorMap(_) => "tensor map",
            Value::WarpgroupDescriptor(_) => "warp-group descriptor",
            Value::Accumulator(_) => "warp-group accumulator",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric content of a scalar
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<(&VectorType, &[f64])> {
        match self {
            Value::Vector { ty, data } => Some((ty, data)),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&MemRef> {
        match self {
            Value::MemRef(m) => Some(m),
            _ => None,
        }
    }
}

/// Vector elements as `vector.print` writes them: `( 1, 2 )`, nested per rank
fn write_nested(f: &mut fmt::Formatter<'_>, shape: &[usize], data: &[f64]) -> fmt::Result {
    let Some((outer, inner)) = shape.split_first() else {
        return write_elem(f, data.first().copied().unwrap_or(0.0));
    };
    let stride: usize = inner.iter().product();
    write!(f, "( ")?;
    for i in 0..*outer {
        if i > 0 {
            write!(f, ", ")?;
        }
        if inner.is_empty() {
            write_elem(f, data[i])?;
        } else {
            write_nested(f, inner, &data[i * stride..(i + 1) * stride])?;
        }
    }
    write!(f, " )")
}

fn write_elem(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        write!(f, "nan")
    } else if v.is_infinite() {
        write!(f, "{}inf", if v < 0.0 { "-" } else { "" })
    } else {
        write!(f, "{}", v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", *b as u8),
            Value::Float(v) => write_elem(f, *v),
            Value::Vector { ty, data } => write_nested(f, &ty.shape, data),
            Value::MemRef(m) => write!(f, "{}", m.ty()),
            Value::AsyncToken(AsyncToken::Copy(id)) => write!(f, "{}", id),
            Value::AsyncToken(AsyncToken::Group(token)) => write!(f, "{}", token),
            Value::Barriers(group) => write!(f, "<{} mbarriers>", group.len()),
            Value::BarrierToken(token) => {
                write!(f, "<mbarrier {} phase {}>", token.barrier, token.phase)
            }
            Value::TensorMap(desc) => write!(f, "{}", desc),
            Value::WarpgroupDescriptor(desc) => write!(f, "<wgmma descriptor {}>", desc.ty()),
            Value::Accumulator(acc) => write_nested(f, &acc.ty().shape, acc.data()),
        }
    }
}
