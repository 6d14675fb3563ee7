//! Textual printer
//!
//! Output parses back into an equal program.

use super::ops::*;
use super::{Operation, Program};
use std::fmt::{self, Write};

/// Format a float so that it always lexes as a float literal
pub fn format_float(value: f64) -> String {
    let text = format!("{}", value);
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

struct OpWriter<'a> {
    program: &'a Program,
    items: Vec<String>,
    attrs: Vec<String>,
}

impl<'a> OpWriter<'a> {
    fn new(program: &'a Program) -> Self {
        Self {
            program,
            items: Vec::new(),
            attrs: Vec::new(),
        }
    }

    fn name(&self, id: ValueId) -> String {
        format!("%{}", self.program.value_name(id))
    }

    fn value(&mut self, id: ValueId) {
        let text = self.name(id);
        self.items.push(text);
    }

    fn indexed(&mut self, indexed: &Indexed) {
        let indices: Vec<String> = indexed.indices.iter().map(|i| self.name(*i)).collect();
        let text = format!("{}[{}]", self.name(indexed.base), indices.join(", "));
        self.items.push(text);
    }

    fn named(&mut self, key: &str, id: Option<ValueId>) {
        if let Some(id) = id {
            let text = format!("{} = {}", key, self.name(id));
            self.items.push(text);
        }
    }

    fn literal(&mut self, text: impl Into<String>) {
        self.items.push(text.into());
    }

    fn attr(&mut self, key: &str, value: impl fmt::Display) {
        self.attrs.push(format!("{} = {}", key, value));
    }

    fn flag(&mut self, key: &str, set: bool) {
        if set {
            self.attrs.push(key.to_string());
        }
    }
}

impl Program {
    /// Print one operation in the textual format
    pub fn print_operation(&self, operation: &Operation) -> String {
        let mut w = OpWriter::new(self);

        match &operation.op {
            Op::Constant { value } => match value {
                ConstValue::Int(v) => w.literal(v.to_string()),
                ConstValue::Float(v) => w.literal(format_float(*v)),
                ConstValue::Bool(b) => w.literal(b.to_string()),
                ConstValue::Dense(values) if values.len() == 1 => {
                    w.literal(format!("dense<{}>", format_float(values[0])))
                }
                ConstValue::Dense(values) => {
                    let parts: Vec<String> = values.iter().map(|v| format_float(*v)).collect();
                    w.literal(format!("dense<[{}]>", parts.join(", ")))
                }
            },
            Op::CmpI {
                predicate,
                lhs,
                rhs,
            } => {
                w.literal(predicate.keyword());
                w.value(*lhs);
                w.value(*rhs);
            }
            Op::ThreadId { dim } => w.literal(dim.keyword()),
            Op::Alloc { init } => match init {
                AllocInit::Zero => {}
                AllocInit::Fill(v) => w.attr("fill", format_float(*v)),
                AllocInit::Iota => w.flag("iota", true),
            },
            Op::Cast { source } => w.value(*source),
            Op::Load { memref } => w.indexed(memref),
            Op::Store { value, memref } => {
                w.value(*value);
                w.indexed(memref);
            }
            Op::Print { value } => w.value(*value),

            Op::DeviceAsyncCopy {
                src,
                dst,
                dst_elements,
                src_elements,
                bypass_l1,
            } => {
                w.indexed(src);
                w.indexed(dst);
                w.literal(dst_elements.to_string());
                w.named("srcElements", *src_elements);
                w.flag("bypassL1", *bypass_l1);
            }
            Op::DeviceAsyncCreateGroup { tokens } => {
                for token in tokens {
                    w.value(*token);
                }
            }
            Op::DeviceAsyncWait { token, num_groups } => {
                w.value(*token);
                if let Some(n) = num_groups {
                    w.attr("numGroups", n);
                }
            }

            Op::ThreadBarrier | Op::MBarrierCreate | Op::WarpgroupInitAccumulator => {}
            Op::MBarrierInit {
                barrier,
                count,
                predicate,
            } => {
                w.indexed(barrier);
                w.value(*count);
                w.named("predicate", *predicate);
            }
            Op::MBarrierArrive { barrier } | Op::MBarrierInval { barrier } => {
                w.indexed(barrier)
            }
            Op::MBarrierArriveNoComplete { barrier, count } => {
                w.indexed(barrier);
                w.value(*count);
            }
            Op::MBarrierArriveExpectTx {
                barrier,
                tx_count,
                predicate,
            } => {
                w.indexed(barrier);
                w.value(*tx_count);
                w.named("predicate", *predicate);
            }
            Op::MBarrierTestWait { barrier, token } => {
                w.indexed(barrier);
                w.value(*token);
            }
            Op::MBarrierTryWaitParity {
                barrier,
                parity,
                ticks,
            } => {
                w.indexed(barrier);
                w.value(*parity);
                w.value(*ticks);
            }

            Op::TmaCreateDescriptor { source, box_dims } => {
                w.value(*source);
                let dims: Vec<String> = box_dims.iter().map(|d| w.name(*d)).collect();
                w.literal(format!("box[{}]", dims.join(", ")));
            }
            Op::TmaFenceDescriptor { descriptor } => w.value(*descriptor),
            Op::TmaPrefetchDescriptor {
                descriptor,
                predicate,
            } => {
                w.value(*descriptor);
                w.named("predicate", *predicate);
            }
            Op::TmaAsyncLoad {
                descriptor,
                barrier,
                dst,
                multicast_mask,
                predicate,
            } => {
                w.indexed(descriptor);
                w.indexed(barrier);
                w.value(*dst);
                w.named("multicast_mask", *multicast_mask);
                w.named("predicate", *predicate);
            }
            Op::TmaAsyncStore {
                src,
                descriptor,
                predicate,
            } => {
                w.value(*src);
                w.indexed(descriptor);
                w.named("predicate", *predicate);
            }

            Op::WarpgroupGenerateDescriptor { tensor, tensor_map } => {
                w.value(*tensor);
                w.value(*tensor_map);
            }
            Op::WarpgroupMma {
                descriptor_a,
                descriptor_b,
                accumulator,
                wait_group,
                transpose_a,
                transpose_b,
            } => {
                w.value(*descriptor_a);
                w.value(*descriptor_b);
                w.value(*accumulator);
                w.attr("waitGroup", wait_group);
                w.flag("transposeA", *transpose_a);
                w.flag("transposeB", *transpose_b);
            }
            Op::WarpgroupMmaStore { accumulator, dst } => {
                w.value(*accumulator);
                w.value(*dst);
            }

            Op::MmaSync {
                a,
                b,
                c,
                shape,
                tf32_enabled,
            } => {
                w.value(*a);
                w.value(*b);
                w.value(*c);
                w.attr("mmaShape", shape);
                w.flag("tf32Enabled", *tf32_enabled);
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
                w.value(*a);
                w.value(*b);
                w.value(*c);
                w.named("metadata", Some(*metadata));
                w.attr("mmaShape", shape);
                w.attr("sparsitySelector", sparsity_selector);
                w.flag("tf32Enabled", *tf32_enabled);
            }
            Op::Rcp {
                input,
                rounding,
                ftz,
            } => {
                w.value(*input);
                w.attr("rounding", rounding);
                w.flag("ftz", *ftz);
            }
        }

        let mut out = String::new();
        if !operation.results.is_empty() {
            let names: Vec<String> = operation.results.iter().map(|r| w.name(*r)).collect();
            let _ = write!(out, "{} = ", names.join(", "));
        }
        out.push_str(operation.op.name());
        if !w.items.is_empty() {
            let _ = write!(out, " {}", w.items.join(", "));
        }
        if !w.attrs.is_empty() {
            let _ = write!(out, " {{{}}}", w.attrs.join(", "));
        }
        if !operation.results.is_empty() {
            let types: Vec<String> = operation
                .results
                .iter()
                .map(|r| self.value_type(*r).to_string())
                .collect();
            let _ = write!(out, " : {}", types.join(", "));
        }
        out
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for operation in &self.operations {
            writeln!(f, "{}", self.print_operation(operation))?;
        }
        Ok(())
    }
}
