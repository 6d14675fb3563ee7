//! NVGPU operation IR
//!
//! A program is a flat sequence of operations over SSA values. Every value
//! carries its type, its source name and the span that defined it. The same
//! sequence is executed by every simulated thread.

pub mod ops;
pub mod printer;
pub mod types;

pub use ops::*;
pub use types::*;

use crate::common::Span;
use serde::{Deserialize, Serialize};

/// Type and provenance of one SSA value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    /// Name without the leading `%`
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

/// One operation together with the values it defines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: Op,
    pub results: Vec<ValueId>,
    pub span: Span,
}

impl Operation {
    /// The single result, if the operation defines one
    pub fn result(&self) -> Option<ValueId> {
        self.results.first().copied()
    }
}

/// A parsed program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub operations: Vec<Operation>,
    pub values: Vec<ValueInfo>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new SSA value
    pub fn add_value(&mut self, name: impl Into<String>, ty: Type, span: Span) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo {
            name: name.into(),
            ty,
            span,
        });
        id
    }

    pub fn push(&mut self, op: Op, results: Vec<ValueId>, span: Span) {
        self.operations.push(Operation { op, results, span });
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.index()]
    }

    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id.index()].ty
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id.index()].name
    }

    /// Operation that defines `id`
    pub fn defining_op(&self, id: ValueId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.results.contains(&id))
    }

    /// Compile-time integer value of `id`, when it is an `arith.constant`
    pub fn constant_int(&self, id: ValueId) -> Option<i64> {
        match self.defining_op(id).map(|op| &op.op) {
            Some(Op::Constant {
                value: ConstValue::Int(v),
            }) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_values() {
        let mut program = Program::new();
        let c = program.add_value("c4", Type::index(), Span::new(0, 3));
        program.push(
            Op::Constant {
                value: ConstValue::Int(4),
            },
            vec![c],
            Span::new(0, 30),
        );

        assert_eq!(program.value_name(c), "c4");
        assert_eq!(program.value_type(c), &Type::index());
        assert_eq!(program.constant_int(c), Some(4));
        assert_eq!(program.len(), 1);
    }
}
