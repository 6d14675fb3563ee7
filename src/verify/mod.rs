//! Program verifier
//!
//! Runs the per-operation contract before anything executes. Checks that
//! need more than one operation (group membership, token provenance,
//! statically known barrier ids) are done here as well.

pub mod rules;

use crate::common::Span;
use crate::diagnostics::{Reporter, VerifyError};
use crate::ir::{ConstValue, ElemType, Indexed, MemRefType, Op, Operation, Program, Type, ValueId, VectorType};
use rules::VerifyResult;
use rustc_hash::FxHashMap;

/// Verify every operation, reporting each violation
pub fn verify_program(program: &Program, reporter: &mut Reporter) {
    let mut grouped: FxHashMap<ValueId, Span> = FxHashMap::default();

    for operation in &program.operations {
        let mut result = verify_operation(program, operation);

        if result.is_ok()
            && let Op::DeviceAsyncCreateGroup { tokens } = &operation.op
        {
            for token in tokens {
                if grouped.insert(*token, operation.span).is_some() {
                    result = Err(VerifyError::DoubleGroupMembership(format!(
                        "%{}",
                        program.value_name(*token)
                    )));
                    break;
                }
            }
        }

        if let Err(error) = result {
            tracing::debug!(op = operation.op.name(), %error, "verification failed");
            reporter.verify_error(operation.op.name(), error, operation.span);
        }
    }
}

struct Checker<'a> {
    program: &'a Program,
    operation: &'a Operation,
}

impl<'a> Checker<'a> {
    fn ty(&self, id: ValueId) -> &'a Type {
        self.program.value_type(id)
    }

    fn result(&self) -> VerifyResult<&'a Type> {
        self.operation
            .result()
            .map(|r| self.program.value_type(r))
            .ok_or_else(|| {
                VerifyError::InvalidOperand(format!(
                    "{} must define a result",
                    self.operation.op.name()
                ))
            })
    }

    fn expect_result(&self, expected: &Type) -> VerifyResult {
        let found = self.result()?;
        if found != expected {
            return Err(VerifyError::TypeMismatch(format!(
                "result must be {}, found {}",
                expected, found
            )));
        }
        Ok(())
    }

    fn index(&self, id: ValueId, what: &str) -> VerifyResult {
        rules::expect_index(self.ty(id), what)
    }

    /// Index operand that must not be a negative constant; returns the
    /// value when it is known statically
    fn count(&self, id: ValueId, what: &str) -> VerifyResult<Option<u64>> {
        self.index(id, what)?;
        match self.program.constant_int(id) {
            Some(n) => u64::try_from(n).map(Some).map_err(|_| {
                VerifyError::InvalidOperand(format!(
                    "{} %{} is {}; it must not be negative",
                    what,
                    self.program.value_name(id),
                    n
                ))
            }),
            None => Ok(None),
        }
    }

    fn indices(&self, ids: &[ValueId], what: &str) -> VerifyResult {
        ids.iter().try_for_each(|id| self.index(*id, what))
    }

    fn predicate(&self, id: Option<ValueId>) -> VerifyResult {
        match id {
            Some(id) => rules::expect_bool(self.ty(id), "predicate"),
            None => Ok(()),
        }
    }

    fn defined_by(&self, id: ValueId) -> Option<&'a Op> {
        self.program.defining_op(id).map(|op| &op.op)
    }

    /// Barrier reference checks, including a statically known id
    fn barrier(&self, barrier: &Indexed) -> VerifyResult {
        let group = self.ty(barrier.base);
        rules::check_barrier_ref(group, barrier.indices.len())?;
        self.indices(&barrier.indices, "barrier id")?;
        if let Type::MBarrierGroup { num_barriers, .. } = group
            && let Some(id) = self.program.constant_int(barrier.indices[0])
            && (id < 0 || id as usize >= *num_barriers)
        {
            return Err(VerifyError::InvalidOperand(format!(
                "barrier id {} is outside a group of {}",
                id, num_barriers
            )));
        }
        Ok(())
    }

    fn verify(&self) -> VerifyResult {
        match &self.operation.op {
            // === Support ===
            Op::Constant { value } => {
                let result = self.result()?;
                match (value, result) {
                    (ConstValue::Int(_), Type::Scalar(e)) if e.is_integer() => Ok(()),
                    (ConstValue::Float(_), Type::Scalar(e)) if e.is_float() => Ok(()),
                    (ConstValue::Bool(_), Type::Scalar(e)) if *e == ElemType::I1 => {
                        Ok(())
                    }
                    (ConstValue::Dense(values), Type::Vector(v)) => {
                        if values.len() == 1 || values.len() == v.num_elements() {
                            Ok(())
                        } else {
                            Err(VerifyError::ShapeMismatch(format!(
                                "{} elements given for {}",
                                values.len(),
                                v
                            )))
                        }
                    }
                    (_, other) => Err(VerifyError::TypeMismatch(format!(
                        "literal does not fit {}",
                        other
                    ))),
                }
            }
            Op::CmpI { lhs, rhs, .. } => {
                self.index(*lhs, "comparison operand")?;
                if self.ty(*lhs) != self.ty(*rhs) {
                    return Err(VerifyError::TypeMismatch(format!(
                        "cannot compare {} with {}",
                        self.ty(*lhs),
                        self.ty(*rhs)
                    )));
                }
                self.expect_result(&Type::bool())
            }
            Op::ThreadId { .. } => self.expect_result(&Type::index()),
            Op::ThreadBarrier => Ok(()),
            Op::Alloc { .. } => {
                let memref = rules::expect_memref(self.result()?, "allocation")?;
                if memref.rank().is_none() {
                    return Err(VerifyError::InvalidOperand(
                        "allocations must be ranked".to_string(),
                    ));
                }
                Ok(())
            }
            Op::Cast { source } => {
                let from = rules::expect_memref(self.ty(*source), "cast source")?;
                let to = rules::expect_memref(self.result()?, "cast result")?;
                if from.elem != to.elem {
                    return Err(VerifyError::TypeMismatch(format!(
                        "cannot cast {} to {}",
                        from, to
                    )));
                }
                if from.space != to.space {
                    return Err(VerifyError::InvalidAddressSpace(format!(
                        "cannot cast {} to {}",
                        from, to
                    )));
                }
                if from.shape.is_some() && to.shape.is_some() && from.shape != to.shape {
                    return Err(VerifyError::ShapeMismatch(format!(
                        "cannot cast {} to {}",
                        from, to
                    )));
                }
                Ok(())
            }
            Op::Load { memref } => {
                let m = rules::expect_memref(self.ty(memref.base), "load source")?;
                rules::check_indices(m, memref.indices.len(), "load")?;
                self.indices(&memref.indices, "load index")?;
                self.expect_result(&Type::Scalar(m.elem))
            }
            Op::Store { value, memref } => {
                let m = rules::expect_memref(self.ty(memref.base), "store destination")?;
                rules::check_indices(m, memref.indices.len(), "store")?;
                self.indices(&memref.indices, "store index")?;
                if self.ty(*value) != &Type::Scalar(m.elem) {
                    return Err(VerifyError::TypeMismatch(format!(
                        "cannot store {} into {}",
                        self.ty(*value),
                        m
                    )));
                }
                Ok(())
            }
            Op::Print { value } => match self.ty(*value) {
                Type::Scalar(_) | Type::Vector(_) => Ok(()),
                other => Err(VerifyError::InvalidOperand(format!(
                    "cannot print {}",
                    other
                ))),
            },

            // === Async copy groups ===
            Op::DeviceAsyncCopy {
                src,
                dst,
                dst_elements,
                src_elements,
                bypass_l1,
            } => {
                let src_ty = rules::expect_memref(self.ty(src.base), "copy source")?;
                let dst_ty = rules::expect_memref(self.ty(dst.base), "copy destination")?;
                self.indices(&src.indices, "copy index")?;
                self.indices(&dst.indices, "copy index")?;
                let static_src = match src_elements {
                    Some(id) => self.count(*id, "srcElements")?,
                    None => None,
                };
                rules::check_async_copy(
                    src_ty,
                    src.indices.len(),
                    dst_ty,
                    dst.indices.len(),
                    *dst_elements,
                    static_src,
                    *bypass_l1,
                )?;
                self.expect_result(&Type::AsyncToken)
            }
            Op::DeviceAsyncCreateGroup { tokens } => {
                for token in tokens {
                    if !matches!(self.defined_by(*token), Some(Op::DeviceAsyncCopy { .. })) {
                        return Err(VerifyError::InvalidOperand(format!(
                            "%{} is not the token of an async copy",
                            self.program.value_name(*token)
                        )));
                    }
                }
                self.expect_result(&Type::AsyncToken)
            }
            Op::DeviceAsyncWait { token, .. } => {
                if !matches!(
                    self.defined_by(*token),
                    Some(Op::DeviceAsyncCreateGroup { .. })
                ) {
                    return Err(VerifyError::InvalidOperand(format!(
                        "%{} is not the token of a copy group",
                        self.program.value_name(*token)
                    )));
                }
                Ok(())
            }

            // === MBarrier ===
            Op::MBarrierCreate => match self.result()? {
                Type::MBarrierGroup {
                    space,
                    num_barriers,
                } => rules::check_mbarrier_group(*space, *num_barriers),
                other => Err(VerifyError::TypeMismatch(format!(
                    "result must be an mbarrier group, found {}",
                    other
                ))),
            },
            Op::MBarrierInit {
                barrier,
                count,
                predicate,
            } => {
                self.barrier(barrier)?;
                self.index(*count, "arrival count")?;
                self.predicate(*predicate)
            }
            Op::MBarrierArrive { barrier } => {
                self.barrier(barrier)?;
                self.expect_result(&Type::MBarrierToken)
            }
            Op::MBarrierArriveNoComplete { barrier, count } => {
                self.barrier(barrier)?;
                self.index(*count, "arrival count")?;
                self.expect_result(&Type::MBarrierToken)
            }
            Op::MBarrierArriveExpectTx {
                barrier,
                tx_count,
                predicate,
            } => {
                self.barrier(barrier)?;
                self.index(*tx_count, "transaction count")?;
                self.predicate(*predicate)
            }
            Op::MBarrierTestWait { barrier, token } => {
                self.barrier(barrier)?;
                if self.ty(*token) != &Type::MBarrierToken {
                    return Err(VerifyError::InvalidOperand(format!(
                        "expected an mbarrier token, found {}",
                        self.ty(*token)
                    )));
                }
                self.expect_result(&Type::bool())
            }
            Op::MBarrierTryWaitParity {
                barrier,
                parity,
                ticks,
            } => {
                self.barrier(barrier)?;
                rules::expect_bool(self.ty(*parity), "parity")?;
                self.count(*ticks, "tick budget").map(|_| ())
            }
            Op::MBarrierInval { barrier } => self.barrier(barrier),

            // === Tensor-map descriptors ===
            Op::TmaCreateDescriptor { source, box_dims } => {
                let source_ty = rules::expect_memref(self.ty(*source), "descriptor source")?;
                let tm = rules::expect_tensor_map(self.result()?, "result")?;
                self.indices(box_dims, "box dimension")?;
                let values: Vec<Option<i64>> = box_dims
                    .iter()
                    .map(|d| self.program.constant_int(*d))
                    .collect();
                rules::check_create_descriptor(tm, source_ty, &values)
            }
            Op::TmaFenceDescriptor { descriptor } => {
                rules::expect_tensor_map(self.ty(*descriptor), "descriptor").map(|_| ())
            }
            Op::TmaPrefetchDescriptor {
                descriptor,
                predicate,
            } => {
                rules::expect_tensor_map(self.ty(*descriptor), "descriptor")?;
                self.predicate(*predicate)
            }
            Op::TmaAsyncLoad {
                descriptor,
                barrier,
                dst,
                multicast_mask,
                predicate,
            } => {
                let tm = rules::expect_tensor_map(self.ty(descriptor.base), "descriptor")?;
                let dst_ty = rules::expect_memref(self.ty(*dst), "load destination")?;
                self.indices(&descriptor.indices, "coordinate")?;
                rules::check_tma_load(tm, descriptor.indices.len(), dst_ty)?;
                self.barrier(barrier)?;
                if let Some(mask) = multicast_mask {
                    self.index(*mask, "multicast mask")?;
                }
                self.predicate(*predicate)
            }
            Op::TmaAsyncStore {
                src,
                descriptor,
                predicate,
            } => {
                let tm = rules::expect_tensor_map(self.ty(descriptor.base), "descriptor")?;
                let src_ty = rules::expect_memref(self.ty(*src), "store source")?;
                self.indices(&descriptor.indices, "coordinate")?;
                rules::check_tma_store(tm, descriptor.indices.len(), src_ty)?;
                self.predicate(*predicate)
            }

            // === Warp-group MMA ===
            Op::WarpgroupGenerateDescriptor { tensor, tensor_map } => {
                let tensor_ty = rules::expect_memref(self.ty(*tensor), "tensor")?;
                let tm = rules::expect_tensor_map(self.ty(*tensor_map), "tensor map")?;
                rules::check_generate_descriptor(tensor_ty, tm)?;
                self.expect_result(&Type::WarpgroupDescriptor(tensor_ty.clone()))
            }
            Op::WarpgroupInitAccumulator => match self.result()? {
                Type::WarpgroupAccumulator(v) => rules::check_accumulator(v),
                other => Err(VerifyError::TypeMismatch(format!(
                    "result must be a warp-group accumulator, found {}",
                    other
                ))),
            },
            Op::WarpgroupMma {
                descriptor_a,
                descriptor_b,
                accumulator,
                transpose_a,
                transpose_b,
                ..
            } => {
                let a = self.wgmma_descriptor(*descriptor_a, "A")?;
                let b = self.wgmma_descriptor(*descriptor_b, "B")?;
                let acc_in = self.accumulator(self.ty(*accumulator))?;
                let acc_out = self.accumulator(self.result()?)?;
                rules::check_warpgroup_mma(a, b, acc_in, acc_out, *transpose_a, *transpose_b)
                    .map(|_| ())
            }
            Op::WarpgroupMmaStore { accumulator, dst } => {
                let acc = self.accumulator(self.ty(*accumulator))?;
                let dst_ty = rules::expect_memref(self.ty(*dst), "store destination")?;
                rules::check_warpgroup_store(acc, dst_ty)
            }

            // === Warp-level MMA ===
            Op::MmaSync {
                a,
                b,
                c,
                shape,
                tf32_enabled,
            } => {
                let result = rules::expect_vector(self.result()?, "result")?;
                rules::check_mma_sync(
                    rules::expect_vector(self.ty(*a), "A")?,
                    rules::expect_vector(self.ty(*b), "B")?,
                    rules::expect_vector(self.ty(*c), "C")?,
                    result,
                    *shape,
                    false,
                    *tf32_enabled,
                )
            }
            Op::MmaSparseSync {
                a,
                b,
                c,
                metadata,
                shape,
                sparsity_selector,
                tf32_enabled,
            } => {
                let result = rules::expect_vector(self.result()?, "result")?;
                let meta = rules::expect_vector(self.ty(*metadata), "metadata")?;
                rules::check_sparse_metadata(meta, *sparsity_selector)?;
                rules::check_mma_sync(
                    rules::expect_vector(self.ty(*a), "A")?,
                    rules::expect_vector(self.ty(*b), "B")?,
                    rules::expect_vector(self.ty(*c), "C")?,
                    result,
                    *shape,
                    true,
                    *tf32_enabled,
                )
            }
            Op::Rcp {
                input, rounding, ..
            } => {
                let input_ty = rules::expect_vector(self.ty(*input), "input")?;
                let result = rules::expect_vector(self.result()?, "result")?;
                rules::check_rcp(input_ty, result, *rounding)
            }
        }
    }

    fn wgmma_descriptor(&self, id: ValueId, what: &str) -> VerifyResult<&'a MemRefType> {
        match self.ty(id) {
            Type::WarpgroupDescriptor(m) => Ok(m),
            other => Err(VerifyError::InvalidOperand(format!(
                "{} must be a warp-group descriptor, found {}",
                what, other
            ))),
        }
    }

    fn accumulator(&self, ty: &'a Type) -> VerifyResult<&'a VectorType> {
        match ty {
            Type::WarpgroupAccumulator(v) => Ok(v),
            other => Err(VerifyError::InvalidOperand(format!(
                "expected a warp-group accumulator, found {}",
                other
            ))),
        }
    }
}

/// Verify a single operation in the context of its program
pub fn verify_operation(program: &Program, operation: &Operation) -> VerifyResult {
    Checker { program, operation }.verify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SourceFile;
    use crate::ir::{AllocInit, MemorySpace, Rounding};

    #[test]
    fn test_double_group_membership() {
        let mut p = Program::new();
        let src_ty = Type::MemRef(MemRefType::ranked(vec![8], ElemType::F32, MemorySpace::Global));
        let dst_ty = Type::MemRef(MemRefType::ranked(vec![8], ElemType::F32, MemorySpace::Shared));
        let c0 = p.add_value("c0", Type::index(), Span::dummy());
        p.push(Op::Constant { value: ConstValue::Int(0) }, vec![c0], Span::dummy());
        let src = p.add_value("src", src_ty, Span::dummy());
        p.push(Op::Alloc { init: AllocInit::Zero }, vec![src], Span::dummy());
        let dst = p.add_value("dst", dst_ty, Span::dummy());
        p.push(Op::Alloc { init: AllocInit::Zero }, vec![dst], Span::dummy());
        let t = p.add_value("t", Type::AsyncToken, Span::dummy());
        p.push(
            Op::DeviceAsyncCopy {
                src: Indexed::new(src, vec![c0]),
                dst: Indexed::new(dst, vec![c0]),
                dst_elements: 4,
                src_elements: None,
                bypass_l1: false,
            },
            vec![t],
            Span::dummy(),
        );
        for name in ["g0", "g1"] {
            let g = p.add_value(name, Type::AsyncToken, Span::dummy());
            p.push(Op::DeviceAsyncCreateGroup { tokens: vec![t] }, vec![g], Span::new(1, 2));
        }

        let mut reporter = Reporter::new(SourceFile::new("t", ""));
        verify_program(&p, &mut reporter);
        let errors = crate::diagnostics::Errors::from_reporter(reporter);
        assert_eq!(errors.verify_kinds(), vec!["DoubleGroupMembership"]);
    }

    #[test]
    fn test_rcp_operation() {
        let mut p = Program::new();
        let v4 = Type::Vector(VectorType::new(vec![4], ElemType::F32));
        let v = p.add_value("v", v4.clone(), Span::dummy());
        p.push(Op::Constant { value: ConstValue::Dense(vec![2.0]) }, vec![v], Span::dummy());
        let r = p.add_value("r", v4, Span::dummy());
        p.push(
            Op::Rcp { input: v, rounding: Rounding::Rz, ftz: false },
            vec![r],
            Span::dummy(),
        );

        assert!(verify_operation(&p, &p.operations[0]).is_ok());
        assert_eq!(
            verify_operation(&p, &p.operations[1]),
            Err(VerifyError::UnsupportedRoundingMode("rz".into()))
        );
    }
}
