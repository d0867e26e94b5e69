//! Lowering of staged expressions into a typed kernel plan.
//!
//! A [`KernelPlan`] is the single description of a fused kernel: the CUDA
//! renderer formats it into source text and host backends interpret it
//! directly, so both always agree on parameters and stage semantics.

mod helpers;
mod render;
mod writer;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

pub use render::render_fused;
pub(crate) use writer::SourceWriter;

use crate::device::KernelArg;
use crate::dtype::DType;
use crate::error::{FuseError, FuseResult};
use crate::ops::{Op, OpClass};
use crate::signature::{SigItem, Signature, TakeMode};
use crate::stages::{split_stages, Stage, StageKind};
use crate::tree::{ExprTree, NodeItem};

/// Positional kernel parameter, in launch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    RandState,
    Data { slot: usize, dtype: DType },
    RowStride { slot: usize },
    ColStride { slot: usize },
    TakeIndex { slot: usize },
    Const { slot: usize },
    /// Loop bound of a stage.
    LoopBound { stage: usize },
    /// Loop bound of a reduction that was merged into an earlier stage.
    Unused { index: usize },
    MantissaBits,
    OneHotIndex { id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Ptr,
    Int,
    Float,
}

impl Param {
    pub fn kind(&self) -> ParamKind {
        match self {
            Param::RandState | Param::Data { .. } | Param::TakeIndex { .. } => ParamKind::Ptr,
            Param::OneHotIndex { .. } => ParamKind::Ptr,
            Param::Const { .. } => ParamKind::Float,
            Param::RowStride { .. }
            | Param::ColStride { .. }
            | Param::LoopBound { .. }
            | Param::Unused { .. }
            | Param::MantissaBits => ParamKind::Int,
        }
    }
}

/// Checks launch arguments against a parameter list before anything is issued.
pub fn check_args(kinds: &[ParamKind], args: &[KernelArg]) -> FuseResult<()> {
    if kinds.len() != args.len() {
        return Err(FuseError::device(format!(
            "kernel expects {} arguments, got {}",
            kinds.len(),
            args.len()
        )));
    }
    for (index, (kind, arg)) in kinds.iter().zip(args).enumerate() {
        if *kind != arg.kind() {
            return Err(FuseError::device(format!(
                "kernel argument {index} should be {kind:?}, got {arg:?}"
            )));
        }
    }
    Ok(())
}

/// Operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Element loaded from the tensor in this slot for the current iteration.
    Tensor(usize),
    Const(usize),
    /// Float register named by the op that wrote it.
    Reg(u32),
    /// Integer register written by an arg-reduction.
    Index(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Unary { dst: u32, op: Op, src: Value },
    Binary { dst: u32, op: Op, lhs: Value, rhs: Value },
    Rand { dst: u32 },
    /// `1.0` where the index loaded for `id` hits the block (axis 0) or the loop counter (axis 1).
    OneHot { dst: u32, id: u32, axis: usize },
    Accumulate { reg: u32, op: Op, src: Value },
    Store { value: Value, stochastic: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorBinding {
    pub slot: usize,
    pub dtype: DType,
    pub take: TakeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneHotLoad {
    pub id: u32,
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceStep {
    pub op: Op,
    pub reg: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub index: usize,
    pub kind: StageKind,
    /// Input slots loaded once per iteration, in first-use order.
    pub loads: Vec<usize>,
    pub onehots: Vec<OneHotLoad>,
    pub body: Vec<Instr>,
    pub reduction: Option<ReduceStep>,
}

impl StagePlan {
    pub fn loops(&self) -> bool {
        matches!(self.kind, StageKind::Reduction | StageKind::EwOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelPlan {
    pub name: String,
    pub threads: u32,
    pub params: Vec<Param>,
    /// One binding per tensor slot; slot 0 is the output.
    pub tensors: Vec<TensorBinding>,
    pub stages: Vec<StagePlan>,
    pub stochastic: bool,
    pub uses_rand: bool,
}

impl KernelPlan {
    pub fn tensor(&self, slot: usize) -> Option<&TensorBinding> {
        self.tensors.iter().find(|t| t.slot == slot)
    }

    pub fn output(&self) -> Option<&TensorBinding> {
        self.tensor(0)
    }

    pub fn param_kinds(&self) -> Vec<ParamKind> {
        self.params.iter().map(Param::kind).collect()
    }

    pub fn terminal_kind(&self) -> Option<StageKind> {
        self.stages.last().map(|s| s.kind)
    }

    pub fn reduces(&self) -> bool {
        self.stages.iter().any(|s| s.reduction.is_some())
    }

    /// True when any stage reads an input as `f16` and needs the widening helper.
    pub(crate) fn loads_f16(&self) -> bool {
        self.stages.iter().any(|stage| {
            stage
                .loads
                .iter()
                .any(|slot| self.tensor(*slot).map(|t| t.dtype) == Some(DType::F16))
        })
    }
}

/// Store expressions and helpers for kernels that narrow outside a fused plan.
///
/// `store_sum` and `store_cmp` contain a `{v}` placeholder for the value.
pub(crate) struct AuxStores {
    pub(crate) helpers: String,
    pub(crate) store_sum: String,
    pub(crate) store_cmp: String,
}

pub(crate) fn aux_store_plan(dtype: DType, stochastic: bool) -> AuxStores {
    let mut set = helpers::HelperSet::default();
    if stochastic {
        set.require(helpers::URAND_GEN);
    }
    if dtype == DType::F16 {
        set.require(helpers::FP16_TO_FP32);
    }
    let mut store = |conv: Option<helpers::StoreConversion>| match conv {
        Some(conv) => {
            set.require(conv.helper);
            format!("{}({{v}}{})", conv.func, conv.rand_args)
        }
        None => "{v}".to_string(),
    };
    let store_sum = store(helpers::store_conversion(dtype, stochastic));
    let store_cmp = store(helpers::store_conversion(dtype, false));
    AuxStores {
        helpers: set.render(),
        store_sum,
        store_cmp,
    }
}

/// Builds, splits and lowers `signature` into a kernel plan.
pub fn plan_fused(signature: &Signature) -> FuseResult<KernelPlan> {
    let threads = signature
        .threads()
        .ok_or_else(|| FuseError::construction("signature has no assign"))?;
    let mut tree = ExprTree::build(signature)?;
    let stages = split_stages(&mut tree);

    let mut tensors: Vec<TensorBinding> = Vec::new();
    for item in signature.items() {
        if let SigItem::Tensor { slot, dtype, take } = *item {
            if !tensors.iter().any(|t| t.slot == slot) {
                tensors.push(TensorBinding { slot, dtype, take });
            }
        }
    }
    tensors.sort_by_key(|t| t.slot);

    let stochastic = signature.stochastic();
    let last = stages.len() - 1;
    let mut lowered = Vec::with_capacity(stages.len());
    for (index, stage) in stages.iter().enumerate() {
        lowered.push(lower_stage(index, stage, index == last, stochastic, threads)?);
    }

    let uses_rand = stochastic
        || lowered
            .iter()
            .any(|s| s.body.iter().any(|i| matches!(i, Instr::Rand { .. })));
    let params = build_params(signature, &lowered);

    Ok(KernelPlan {
        name: kernel_name(signature, &lowered),
        threads,
        params,
        tensors,
        stages: lowered,
        stochastic,
        uses_rand,
    })
}

fn lower_stage(
    index: usize,
    stage: &Stage,
    terminal: bool,
    stochastic: bool,
    threads: u32,
) -> FuseResult<StagePlan> {
    let malformed = || FuseError::construction(format!("stage {index} is malformed"));
    let mut plan = StagePlan {
        index,
        kind: stage.kind,
        loads: Vec::new(),
        onehots: Vec::new(),
        body: Vec::new(),
        reduction: None,
    };
    let mut stack: Vec<Value> = Vec::new();

    for (pos, item) in stage.items.iter().enumerate() {
        match *item {
            NodeItem::Sig(SigItem::Tensor { slot, .. }) => {
                if terminal && pos == 0 {
                    if slot != 0 {
                        return Err(malformed());
                    }
                    continue;
                }
                if !plan.loads.contains(&slot) {
                    plan.loads.push(slot);
                }
                stack.push(Value::Tensor(slot));
            }
            NodeItem::Sig(SigItem::Const { slot }) => stack.push(Value::Const(slot)),
            NodeItem::Staged { origin, op } => {
                stack.push(if op.is_arg_reduction() {
                    Value::Index(origin)
                } else {
                    Value::Reg(origin)
                });
            }
            NodeItem::Sig(SigItem::Assign { .. }) => {
                let value = stack.pop().ok_or_else(malformed)?;
                plan.body.push(Instr::Store { value, stochastic });
            }
            NodeItem::Sig(SigItem::OneHot { id, axis }) => {
                plan.onehots.push(OneHotLoad { id, axis });
                plan.body.push(Instr::OneHot { dst: id, id, axis });
                stack.push(Value::Reg(id));
            }
            NodeItem::Sig(SigItem::Op { op, id }) => match op.class() {
                OpClass::Reduction => {
                    if op.is_arg_reduction() && threads > 32 {
                        return Err(FuseError::construction(format!(
                            "{op} only supports single-warp reductions"
                        )));
                    }
                    let src = stack.pop().ok_or_else(malformed)?;
                    plan.body.push(Instr::Accumulate { reg: id, op, src });
                    plan.reduction = Some(ReduceStep { op, reg: id });
                }
                OpClass::Nullary => {
                    plan.body.push(Instr::Rand { dst: id });
                    stack.push(Value::Reg(id));
                }
                OpClass::Unary => {
                    let src = stack.pop().ok_or_else(malformed)?;
                    plan.body.push(Instr::Unary { dst: id, op, src });
                    stack.push(Value::Reg(id));
                }
                OpClass::Binary => {
                    let rhs = stack.pop().ok_or_else(malformed)?;
                    let lhs = stack.pop().ok_or_else(malformed)?;
                    plan.body.push(Instr::Binary { dst: id, op, lhs, rhs });
                    stack.push(Value::Reg(id));
                }
                OpClass::Assign => return Err(malformed()),
            },
        }
    }

    // a scalar stage leaves its result register on the stack
    let expected = usize::from(stage.kind == StageKind::Scalar);
    if stack.len() != expected {
        return Err(malformed());
    }
    if matches!(stage.kind, StageKind::Scalar | StageKind::RedOut) && !plan.loads.is_empty() {
        return Err(malformed());
    }
    Ok(plan)
}

/// Parameters in signature order. Every reduction keeps a loop-bound slot even
/// when its stage was merged away, so launch arguments never depend on dedup.
fn build_params(signature: &Signature, stages: &[StagePlan]) -> Vec<Param> {
    let reduction_stage: HashMap<u32, usize> = stages
        .iter()
        .filter_map(|s| s.reduction.map(|r| (r.reg, s.index)))
        .collect();
    let terminal = stages.len() - 1;

    let mut params = vec![Param::RandState];
    let mut seen: HashSet<usize> = HashSet::new();
    let mut unused = 0usize;
    for item in signature.items() {
        match *item {
            SigItem::Tensor { slot, dtype, take } => {
                if seen.insert(slot) {
                    params.push(Param::Data { slot, dtype });
                    params.push(Param::RowStride { slot });
                    params.push(Param::ColStride { slot });
                    if take != TakeMode::None {
                        params.push(Param::TakeIndex { slot });
                    }
                }
            }
            SigItem::Const { slot } => {
                if seen.insert(slot) {
                    params.push(Param::Const { slot });
                }
            }
            SigItem::Op { op, id } if op.is_reduction() => match reduction_stage.get(&id) {
                Some(&stage) => params.push(Param::LoopBound { stage }),
                None => {
                    unused += 1;
                    params.push(Param::Unused { index: unused });
                }
            },
            SigItem::Op { .. } => {}
            SigItem::OneHot { id, .. } => params.push(Param::OneHotIndex { id }),
            SigItem::Assign { stochastic, .. } => {
                params.push(Param::LoopBound { stage: terminal });
                if stochastic {
                    params.push(Param::MantissaBits);
                }
            }
        }
    }
    params
}

fn kernel_name(signature: &Signature, stages: &[StagePlan]) -> String {
    let mut parts = vec!["ew".to_string()];
    for stage in stages {
        for instr in &stage.body {
            let op = match instr {
                Instr::Unary { op, .. } | Instr::Binary { op, .. } => *op,
                Instr::Accumulate { op, .. } => *op,
                Instr::Rand { .. } => Op::Rand,
                Instr::OneHot { .. } => Op::OneHot,
                Instr::Store { .. } => continue,
            };
            if parts.len() < 6 {
                parts.push(op.name().to_string());
            }
        }
    }
    if parts.len() == 1 {
        parts.push("assign".to_string());
    }
    let mut hasher = DefaultHasher::new();
    signature.hash(&mut hasher);
    format!("{}_{:016x}", parts.join("_"), hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(slot: usize, dtype: DType) -> SigItem {
        SigItem::Tensor {
            slot,
            dtype,
            take: TakeMode::None,
        }
    }

    fn op(op: Op, id: u32) -> SigItem {
        SigItem::Op { op, id }
    }

    fn assign(id: u32, threads: u32) -> SigItem {
        SigItem::Assign {
            id,
            stochastic: false,
            threads,
        }
    }

    #[test]
    fn duplicate_reduction_keeps_an_unused_loop_bound() {
        // C = sum(A) + sum(A)
        let sig = Signature::new(vec![
            tensor(0, DType::F32),
            tensor(1, DType::F32),
            op(Op::Sum, 0),
            tensor(1, DType::F32),
            op(Op::Sum, 1),
            op(Op::Add, 2),
            assign(3, 32),
        ]);
        let plan = plan_fused(&sig).unwrap();
        assert_eq!(
            plan.params,
            vec![
                Param::RandState,
                Param::Data {
                    slot: 0,
                    dtype: DType::F32
                },
                Param::RowStride { slot: 0 },
                Param::ColStride { slot: 0 },
                Param::Data {
                    slot: 1,
                    dtype: DType::F32
                },
                Param::RowStride { slot: 1 },
                Param::ColStride { slot: 1 },
                Param::LoopBound { stage: 0 },
                Param::Unused { index: 1 },
                Param::LoopBound { stage: 2 },
            ]
        );
        let reductions = plan.stages.iter().filter(|s| s.reduction.is_some()).count();
        assert_eq!(reductions, 1);
        assert_eq!(
            plan.stages[1].body,
            vec![Instr::Binary {
                dst: 2,
                op: Op::Add,
                lhs: Value::Reg(0),
                rhs: Value::Reg(0)
            }]
        );
        assert_eq!(
            plan.stages[2].body,
            vec![Instr::Store {
                value: Value::Reg(2),
                stochastic: false
            }]
        );
    }

    #[test]
    fn binary_operands_pop_in_reverse() {
        // C = A / B
        let sig = Signature::new(vec![
            tensor(0, DType::F32),
            tensor(1, DType::F16),
            tensor(2, DType::F32),
            op(Op::Div, 0),
            assign(1, 32),
        ]);
        let plan = plan_fused(&sig).unwrap();
        let stage = &plan.stages[0];
        assert_eq!(stage.loads, vec![1, 2]);
        assert_eq!(
            stage.body[0],
            Instr::Binary {
                dst: 0,
                op: Op::Div,
                lhs: Value::Tensor(1),
                rhs: Value::Tensor(2)
            }
        );
        assert!(plan.loads_f16());
        assert!(!plan.uses_rand);
        assert!(plan.name.starts_with("ew_div_"));
    }

    #[test]
    fn arg_reductions_reject_block_reductions() {
        let sig = Signature::new(vec![
            tensor(0, DType::Si32),
            tensor(1, DType::F32),
            op(Op::ArgMax, 0),
            assign(1, 64),
        ]);
        assert!(matches!(
            plan_fused(&sig),
            Err(FuseError::Construction { .. })
        ));
    }

    #[test]
    fn arg_reduction_result_is_an_index_register() {
        let sig = Signature::new(vec![
            tensor(0, DType::Si32),
            tensor(1, DType::F32),
            op(Op::ArgMax, 0),
            assign(1, 32),
        ]);
        let plan = plan_fused(&sig).unwrap();
        assert_eq!(
            plan.stages[1].body,
            vec![Instr::Store {
                value: Value::Index(0),
                stochastic: false
            }]
        );
    }

    #[test]
    fn argument_kinds_are_checked() {
        let kinds = [ParamKind::Ptr, ParamKind::Int, ParamKind::Float];
        let good = [
            KernelArg::Ptr(crate::tensor::DevicePtr(8)),
            KernelArg::I32(3),
            KernelArg::F32(1.5),
        ];
        check_args(&kinds, &good).unwrap();
        let bad = [
            KernelArg::Ptr(crate::tensor::DevicePtr(8)),
            KernelArg::F32(3.0),
            KernelArg::F32(1.5),
        ];
        assert!(matches!(
            check_args(&kinds, &bad),
            Err(FuseError::Device { .. })
        ));
        assert!(check_args(&kinds, &good[..2]).is_err());
    }
}
