//! Program execution
//!
//! Every simulated thread runs the whole program on its own OS thread,
//! sharing one `Device`. Allocations, barrier groups and tensor maps are
//! block-wide: the first thread to reach the defining operation creates them
//! and the others pick up the same object. When a thread fails, the device
//! is aborted so the others stop at their next operation or wait.

use super::value::{AsyncToken, Value};
use crate::common::Span;
use crate::config::{ConfigError, SimConfig};
use crate::diagnostics::{ProgramError, SourceFile};
use crate::ir::{ConstValue, Dim, Indexed, Op, Operation, Program, Type, ValueId};
use crate::sim::{
    AsyncCopyUnit, Device, LaneFragments, MBarrierGroup, MemRef, MmaAccumulator, MmaLayout,
    SimError, SimResult, SiteObject, StatsSnapshot, WarpgroupMatrixDescriptor, WarpgroupMmaUnit,
    memory::quantize, rcp,
};
use crate::verify::rules;
use indexmap::IndexMap;
use std::thread;
use tracing::{debug, info};

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct Execution {
    /// `vector.print` lines, thread by thread
    pub output: Vec<String>,
    pub per_thread: Vec<Vec<String>>,
    pub stats: StatsSnapshot,
    /// Final contents of every allocation, by value name
    pub buffers: IndexMap<String, Vec<f64>>,
}

/// Failure of one thread
#[derive(Debug)]
struct Failure {
    thread: usize,
    op: Option<usize>,
    error: SimError,
}

/// The interpreter
pub struct Interpreter {
    config: SimConfig,
    output: Vec<String>,
}

impl Interpreter {
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            output: Vec::new(),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Get captured output
    pub fn get_output(&self) -> &[String] {
        &self.output
    }

    /// Clear captured output
    pub fn clear_output(&mut self) {
        self.output.clear();
    }

    /// Run a verified program on every thread of one block
    pub fn run(&mut self, program: &Program, source: &SourceFile) -> Result<Execution, ProgramError> {
        let device = Device::new(self.config.clone());
        info!(
            threads = self.config.threads,
            operations = program.len(),
            "run"
        );

        let results: Vec<Result<Vec<String>, Failure>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.config.threads)
                .map(|thread| {
                    let device = &device;
                    scope.spawn(move || {
                        let result = ThreadState::new(thread, program, device).run();
                        if result.is_err() {
                            device.abort();
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(thread, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        device.abort();
                        Err(Failure {
                            thread,
                            op: None,
                            error: SimError::InvalidValue("thread panicked".to_string()),
                        })
                    })
                })
                .collect()
        });

        let mut per_thread = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(lines) => per_thread.push(lines),
                Err(failure) => failures.push(failure),
            }
        }
        if let Some(failure) = failures
            .iter()
            .find(|f| f.error != SimError::Aborted)
            .or(failures.first())
        {
            return Err(runtime_error(program, source, failure));
        }

        let output: Vec<String> = per_thread.iter().flatten().cloned().collect();
        self.output.extend(output.iter().cloned());

        let mut buffers = IndexMap::new();
        for (site, operation) in program.operations.iter().enumerate() {
            if let (Op::Alloc { .. }, Some(result), Some(SiteObject::MemRef(memref))) =
                (&operation.op, operation.result(), device.site(site))
            {
                buffers.insert(program.value_name(result).to_string(), memref.to_vec());
            }
        }

        let stats = device.snapshot();
        debug!(?stats, "run complete");
        Ok(Execution {
            output,
            per_thread,
            stats,
            buffers,
        })
    }
}

fn runtime_error(program: &Program, source: &SourceFile, failure: &Failure) -> ProgramError {
    let (op, span) = match failure.op.and_then(|i| program.operations.get(i)) {
        Some(operation) => (operation.op.name().to_string(), operation.span),
        None => ("<thread>".to_string(), Span::dummy()),
    };
    ProgramError::Runtime {
        op,
        thread: failure.thread,
        message: failure.error.to_string(),
        span: span.into(),
        src: source.to_named_source(),
    }
}

/// Registers and per-thread hardware queues of one simulated thread
struct ThreadState<'a> {
    thread: usize,
    program: &'a Program,
    device: &'a Device,
    values: Vec<Option<Value>>,
    copies: AsyncCopyUnit,
    wgmma: WarpgroupMmaUnit,
    output: Vec<String>,
}

impl<'a> ThreadState<'a> {
    fn new(thread: usize, program: &'a Program, device: &'a Device) -> Self {
        let stats = device.stats().clone();
        Self {
            thread,
            program,
            device,
            values: vec![None; program.values.len()],
            copies: AsyncCopyUnit::with_stats(stats.clone()),
            wgmma: WarpgroupMmaUnit::with_stats(stats),
            output: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<String>, Failure> {
        for (site, operation) in self.program.operations.iter().enumerate() {
            let result = self
                .device
                .check_aborted()
                .and_then(|_| self.step(site, operation));
            if let Err(error) = result {
                return Err(Failure {
                    thread: self.thread,
                    op: Some(site),
                    error,
                });
            }
        }
        Ok(self.output)
    }

    // ==================== Operands ====================

    fn get(&self, id: ValueId) -> SimResult<&Value> {
        self.values
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                SimError::InvalidValue(format!(
                    "%{} used before it is defined",
                    self.program.value_name(id)
                ))
            })
    }

    fn mismatch(&self, id: ValueId, expected: &str) -> SimError {
        let found = self.get(id).map(Value::type_name).unwrap_or("nothing");
        SimError::InvalidValue(format!(
            "%{} holds {}, expected {}",
            self.program.value_name(id),
            found,
            expected
        ))
    }

    fn int(&self, id: ValueId) -> SimResult<i64> {
        self.get(id)?.as_int().ok_or_else(|| self.mismatch(id, "an integer"))
    }

    fn unsigned(&self, id: ValueId) -> SimResult<u32> {
        let n = self.int(id)?;
        u32::try_from(n).map_err(|_| {
            SimError::InvalidValue(format!(
                "%{} is {}, expected a 32-bit unsigned count",
                self.program.value_name(id),
                n
            ))
        })
    }

    fn count(&self, id: ValueId) -> SimResult<u64> {
        let n = self.int(id)?;
        u64::try_from(n).map_err(|_| {
            SimError::InvalidValue(format!(
                "%{} is {}, expected a non-negative count",
                self.program.value_name(id),
                n
            ))
        })
    }

    fn boolean(&self, id: ValueId) -> SimResult<bool> {
        self.get(id)?.as_bool().ok_or_else(|| self.mismatch(id, "an i1"))
    }

    /// Absent predicates are true
    fn predicate(&self, id: Option<ValueId>) -> SimResult<bool> {
        id.map_or(Ok(true), |id| self.boolean(id))
    }

    fn indices(&self, ids: &[ValueId]) -> SimResult<Vec<i64>> {
        ids.iter().map(|id| self.int(*id)).collect()
    }

    fn memref(&self, id: ValueId) -> SimResult<MemRef> {
        self.get(id)?
            .as_memref()
            .cloned()
            .ok_or_else(|| self.mismatch(id, "a memref"))
    }

    fn vector(&self, id: ValueId) -> SimResult<(crate::ir::VectorType, Vec<f64>)> {
        match self.get(id)? {
            Value::Vector { ty, data } => Ok((ty.clone(), data.clone())),
            _ => Err(self.mismatch(id, "a vector")),
        }
    }

    fn barrier(&self, barrier: &Indexed) -> SimResult<(MBarrierGroup, usize)> {
        let group = match self.get(barrier.base)? {
            Value::Barriers(group) => group.clone(),
            _ => return Err(self.mismatch(barrier.base, "an mbarrier group")),
        };
        let id = match barrier.indices.as_slice() {
            [index] => self.int(*index)?,
            _ => {
                return Err(SimError::InvalidValue(
                    "mbarrier references take one index".to_string(),
                ));
            }
        };
        let id = usize::try_from(id).map_err(|_| SimError::BarrierOutOfRange {
            index: usize::MAX,
            count: group.len(),
        })?;
        Ok((group, id))
    }

    fn tensor_map(&self, id: ValueId) -> SimResult<crate::sim::TensorMapDescriptor> {
        match self.get(id)? {
            Value::TensorMap(desc) => Ok(*desc),
            _ => Err(self.mismatch(id, "a tensor map")),
        }
    }

    fn accumulator(&self, id: ValueId) -> SimResult<MmaAccumulator> {
        match self.get(id)? {
            Value::Accumulator(acc) => Ok(acc.clone()),
            _ => Err(self.mismatch(id, "a warp-group accumulator")),
        }
    }

    fn wg_descriptor(&self, id: ValueId) -> SimResult<WarpgroupMatrixDescriptor> {
        match self.get(id)? {
            Value::WarpgroupDescriptor(desc) => Ok(desc.clone()),
            _ => Err(self.mismatch(id, "a warp-group descriptor")),
        }
    }

    fn result_type(&self, operation: &Operation) -> SimResult<&'a Type> {
        let program = self.program;
        operation
            .result()
            .map(|id| program.value_type(id))
            .ok_or_else(|| SimError::InvalidValue(format!("{} defines no result", operation.op)))
    }

    fn set(&mut self, operation: &Operation, value: Value) -> SimResult<()> {
        let id = operation
            .result()
            .ok_or_else(|| SimError::InvalidValue(format!("{} defines no result", operation.op)))?;
        self.values[id.index()] = Some(value);
        Ok(())
    }

    /// Let in-flight transfers land, unless the block is aborting
    fn progress(&self) -> SimResult<()> {
        self.device.check_aborted()?;
        self.device.progress().map(|_| ())
    }

    // ==================== Operations ====================

    fn step(&mut self, site: usize, operation: &Operation) -> SimResult<()> {
        match &operation.op {
            Op::Constant { value } => {
                let ty = self.result_type(operation)?;
                let value = match (value, ty) {
                    (ConstValue::Int(v), Type::Scalar(e)) => Value::scalar(*e, *v as f64),
                    (ConstValue::Float(v), Type::Scalar(e)) => Value::Float(quantize(*e, *v)),
                    (ConstValue::Bool(b), _) => Value::Bool(*b),
                    (ConstValue::Dense(values), Type::Vector(v)) => {
                        let data = match values.as_slice() {
                            [splat] => vec![quantize(v.elem, *splat); v.num_elements()],
                            _ => values.iter().map(|x| quantize(v.elem, *x)).collect(),
                        };
                        Value::Vector {
                            ty: v.clone(),
                            data,
                        }
                    }
                    (_, other) => {
                        return Err(SimError::InvalidValue(format!(
                            "constant does not fit {}",
                            other
                        )));
                    }
                };
                self.set(operation, value)
            }
            Op::CmpI { predicate, lhs, rhs } => {
                let result = predicate.evaluate(self.int(*lhs)?, self.int(*rhs)?);
                self.set(operation, Value::Bool(result))
            }
            Op::ThreadId { dim } => {
                let id = match dim {
                    Dim::X => self.thread as i64,
                    Dim::Y | Dim::Z => 0,
                };
                self.set(operation, Value::Int(id))
            }
            Op::ThreadBarrier => {
                self.progress()?;
                self.device.sync_threads()
            }
            Op::Alloc { init } => {
                let ty = rules::expect_memref(self.result_type(operation)?, "allocation")?;
                let device = self.device;
                let object = device
                    .site_object(site, || device.alloc(ty, *init).map(SiteObject::MemRef))?;
                match object {
                    SiteObject::MemRef(memref) => self.set(operation, Value::MemRef(memref)),
                    _ => Err(SimError::InvalidValue("allocation site reused".to_string())),
                }
            }
            Op::Cast { source } => {
                let ty = rules::expect_memref(self.result_type(operation)?, "cast result")?;
                let cast = self.memref(*source)?.cast(ty)?;
                self.set(operation, Value::MemRef(cast))
            }
            Op::Load { memref } => {
                let m = self.memref(memref.base)?;
                let v = m.load(&self.indices(&memref.indices)?)?;
                self.set(operation, Value::scalar(m.elem(), v))
            }
            Op::Store { value, memref } => {
                let v = self
                    .get(*value)?
                    .as_f64()
                    .ok_or_else(|| self.mismatch(*value, "a scalar"))?;
                let m = self.memref(memref.base)?;
                m.store(&self.indices(&memref.indices)?, v)
            }
            Op::Print { value } => {
                let line = self.get(*value)?.to_string();
                debug!(thread = self.thread, %line, "print");
                self.output.push(line);
                Ok(())
            }

            // ==================== Async copy groups ====================
            Op::DeviceAsyncCopy {
                src,
                dst,
                dst_elements,
                src_elements,
                bypass_l1,
            } => {
                let src_elements = match src_elements {
                    Some(id) => Some(self.count(*id)?),
                    None => None,
                };
                let id = self.copies.issue_copy(
                    &self.memref(src.base)?,
                    &self.indices(&src.indices)?,
                    &self.memref(dst.base)?,
                    &self.indices(&dst.indices)?,
                    *dst_elements,
                    src_elements,
                    *bypass_l1,
                )?;
                self.set(operation, Value::AsyncToken(AsyncToken::Copy(id)))
            }
            Op::DeviceAsyncCreateGroup { tokens } => {
                let ids = tokens
                    .iter()
                    .map(|t| match self.get(*t)? {
                        Value::AsyncToken(AsyncToken::Copy(id)) => Ok(*id),
                        _ => Err(self.mismatch(*t, "an async copy token")),
                    })
                    .collect::<SimResult<Vec<_>>>()?;
                let token = self.copies.create_group(&ids)?;
                self.set(operation, Value::AsyncToken(AsyncToken::Group(token)))
            }
            Op::DeviceAsyncWait { token, num_groups } => {
                let group = match self.get(*token)? {
                    Value::AsyncToken(AsyncToken::Group(group)) => *group,
                    _ => return Err(self.mismatch(*token, "a copy group token")),
                };
                self.copies.wait(group, *num_groups).map(|_| ())
            }

            // ==================== MBarrier ====================
            Op::MBarrierCreate => {
                let (space, count) = match self.result_type(operation)? {
                    Type::MBarrierGroup {
                        space,
                        num_barriers,
                    } => (*space, *num_barriers),
                    other => {
                        return Err(SimError::InvalidValue(format!(
                            "expected an mbarrier group type, found {}",
                            other
                        )));
                    }
                };
                let device = self.device;
                let object = device.site_object(site, || {
                    device
                        .create_mbarrier_group(space, count)
                        .map(SiteObject::Barriers)
                })?;
                match object {
                    SiteObject::Barriers(group) => self.set(operation, Value::Barriers(group)),
                    _ => Err(SimError::InvalidValue("mbarrier site reused".to_string())),
                }
            }
            Op::MBarrierInit {
                barrier,
                count,
                predicate,
            } => {
                let (group, id) = self.barrier(barrier)?;
                group.init(id, self.unsigned(*count)?, self.predicate(*predicate)?)
            }
            Op::MBarrierArrive { barrier } => {
                let (group, id) = self.barrier(barrier)?;
                let token = group.arrive(id)?;
                self.set(operation, Value::BarrierToken(token))
            }
            Op::MBarrierArriveNoComplete { barrier, count } => {
                let (group, id) = self.barrier(barrier)?;
                let token = group.arrive_no_complete(id, self.unsigned(*count)?)?;
                self.set(operation, Value::BarrierToken(token))
            }
            Op::MBarrierArriveExpectTx {
                barrier,
                tx_count,
                predicate,
            } => {
                let (group, id) = self.barrier(barrier)?;
                group
                    .arrive_expect_tx(id, self.unsigned(*tx_count)?, self.predicate(*predicate)?)
                    .map(|_| ())
            }
            Op::MBarrierTestWait { barrier, token } => {
                let (group, id) = self.barrier(barrier)?;
                let token = match self.get(*token)? {
                    Value::BarrierToken(token) => *token,
                    _ => return Err(self.mismatch(*token, "an mbarrier token")),
                };
                self.progress()?;
                let done = group.test_wait(id, token)?;
                self.set(operation, Value::Bool(done))
            }
            Op::MBarrierTryWaitParity {
                barrier,
                parity,
                ticks,
            } => {
                let (group, id) = self.barrier(barrier)?;
                let parity = self.boolean(*parity)?;
                let ticks = self.count(*ticks)?.max(1);
                let config = self.device.config();
                let polls = ticks.saturating_mul(config.try_wait_ticks);
                group.wait_parity(id, parity, polls, config.wait_watchdog_rounds, || {
                    self.progress()
                })
            }
            Op::MBarrierInval { barrier } => {
                let (group, id) = self.barrier(barrier)?;
                group.inval(id)
            }

            // ==================== Tensor-map descriptors ====================
            Op::TmaCreateDescriptor { source, box_dims } => {
                let ty = rules::expect_tensor_map(self.result_type(operation)?, "result")?;
                let source = self.memref(*source)?;
                let box_dims = self.indices(box_dims)?;
                let device = self.device;
                let object = device.site_object(site, || {
                    device
                        .tma()
                        .create_descriptor(&source, &box_dims, ty)
                        .map(SiteObject::TensorMap)
                })?;
                match object {
                    SiteObject::TensorMap(desc) => self.set(operation, Value::TensorMap(desc)),
                    _ => Err(SimError::InvalidValue("tensor-map site reused".to_string())),
                }
            }
            Op::TmaFenceDescriptor { descriptor } => {
                self.device.tma().fence(self.tensor_map(*descriptor)?)
            }
            Op::TmaPrefetchDescriptor {
                descriptor,
                predicate,
            } => self
                .device
                .tma()
                .prefetch(self.tensor_map(*descriptor)?, self.predicate(*predicate)?),
            Op::TmaAsyncLoad {
                descriptor,
                barrier,
                dst,
                multicast_mask,
                predicate,
            } => {
                let (group, id) = self.barrier(barrier)?;
                let mask = match multicast_mask {
                    Some(m) => {
                        let v = self.int(*m)?;
                        Some(u64::try_from(v).map_err(|_| {
                            SimError::InvalidValue(format!("negative multicast mask {}", v))
                        })?)
                    }
                    None => None,
                };
                self.device.tma().async_load(
                    self.tensor_map(descriptor.base)?,
                    &self.indices(&descriptor.indices)?,
                    &group,
                    id,
                    &self.memref(*dst)?,
                    mask,
                    self.predicate(*predicate)?,
                )
            }
            Op::TmaAsyncStore {
                src,
                descriptor,
                predicate,
            } => self.device.tma().async_store(
                &self.memref(*src)?,
                self.tensor_map(descriptor.base)?,
                &self.indices(&descriptor.indices)?,
                self.predicate(*predicate)?,
            ),

            // ==================== Warp-group MMA ====================
            Op::WarpgroupGenerateDescriptor { tensor, tensor_map } => {
                let tm = self
                    .device
                    .tma()
                    .descriptor_type(self.tensor_map(*tensor_map)?)?;
                let desc = WarpgroupMatrixDescriptor::generate(&self.memref(*tensor)?, &tm)?;
                self.set(operation, Value::WarpgroupDescriptor(desc))
            }
            Op::WarpgroupInitAccumulator => {
                let acc = match self.result_type(operation)? {
                    Type::WarpgroupAccumulator(v) => MmaAccumulator::init(v)?,
                    other => {
                        return Err(SimError::InvalidValue(format!(
                            "expected an accumulator type, found {}",
                            other
                        )));
                    }
                };
                self.set(operation, Value::Accumulator(acc))
            }
            Op::WarpgroupMma {
                descriptor_a,
                descriptor_b,
                accumulator,
                wait_group,
                transpose_a,
                transpose_b,
            } => {
                let a = self.wg_descriptor(*descriptor_a)?;
                let b = self.wg_descriptor(*descriptor_b)?;
                let acc = self.accumulator(*accumulator)?;
                let acc = self.wgmma.multiply_accumulate(
                    &a,
                    &b,
                    acc,
                    *wait_group,
                    *transpose_a,
                    *transpose_b,
                )?;
                self.set(operation, Value::Accumulator(acc))
            }
            Op::WarpgroupMmaStore { accumulator, dst } => {
                let acc = self.accumulator(*accumulator)?;
                let dst = self.memref(*dst)?;
                self.wgmma.store(acc, &dst)
            }

            // ==================== Warp-level MMA ====================
            Op::MmaSync {
                a,
                b,
                c,
                shape,
                tf32_enabled,
            } => {
                let (a_ty, a) = self.vector(*a)?;
                let (b_ty, b) = self.vector(*b)?;
                let (c_ty, c) = self.vector(*c)?;
                rules::check_mma_sync(&a_ty, &b_ty, &c_ty, &c_ty, *shape, false, *tf32_enabled)?;
                let layout = MmaLayout::select(*shape, a_ty.elem).ok_or_else(|| {
                    SimError::Unsupported(format!("nvgpu.mma.sync {} on {}", shape, a_ty.elem))
                })?;
                let (warp, lane) = self.device.warp_of(self.thread)?;
                let data = warp.mma_sync(
                    lane,
                    layout,
                    LaneFragments { a, b, c },
                    c_ty.elem,
                    self.device.abort_flag(),
                )?;
                self.set(operation, Value::Vector { ty: c_ty, data })
            }
            Op::MmaSparseSync {
                metadata,
                sparsity_selector,
                ..
            } => {
                let (meta_ty, _) = self.vector(*metadata)?;
                rules::check_sparse_metadata(&meta_ty, *sparsity_selector)?;
                Err(SimError::Unsupported("nvgpu.mma.sp.sync".to_string()))
            }
            Op::Rcp {
                input,
                rounding,
                ftz,
            } => {
                let (ty, data) = self.vector(*input)?;
                let data = rcp(&data, *rounding, *ftz)?;
                self.set(operation, Value::Vector { ty, data })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use crate::parser;

    fn run(source: &str, threads: usize) -> Result<Execution, ProgramError> {
        let file = SourceFile::new("test.mlir", source);
        let tokens = lexer::lex_file(&file)?;
        let program = parser::parse(&tokens, &file)?;
        Interpreter::new(SimConfig::new(threads))
            .unwrap()
            .run(&program, &file)
    }

    #[test]
    fn test_print_constant_vector() {
        let exec = run(
            "%v = arith.constant dense<[1.0, 2.0]> : vector<2xf32>\nvector.print %v",
            1,
        )
        .unwrap();
        assert_eq!(exec.output, vec!["( 1, 2 )"]);
    }

    #[test]
    fn test_thread_ids() {
        let exec = run("%t = gpu.thread_id x\nvector.print %t", 3).unwrap();
        assert_eq!(exec.output, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_runtime_error_names_thread() {
        let err = run(
            "%c0 = arith.constant 0\n\
             %b = nvgpu.mbarrier.create : !nvgpu.mbarrier.group<memorySpace = 3, num_barriers = 1>\n\
             %t = nvgpu.mbarrier.arrive %b[%c0]",
            1,
        )
        .unwrap_err();
        match err {
            ProgramError::Runtime { op, thread, .. } => {
                assert_eq!(op, "nvgpu.mbarrier.arrive");
                assert_eq!(thread, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
