//! CUDA C formatter for [`KernelPlan`].

use super::helpers::{self, HelperSet};
use super::{Instr, KernelPlan, Param, SourceWriter, StagePlan, Value};
use crate::ops::Op;
use crate::signature::TakeMode;
use crate::stages::StageKind;

/// Renders the complete translation unit for a fused kernel.
pub fn render_fused(plan: &KernelPlan) -> String {
    let mut helpers = HelperSet::default();
    if plan.uses_rand {
        helpers.require(helpers::URAND_GEN);
    }
    if plan.loads_f16() {
        helpers.require(helpers::FP16_TO_FP32);
    }
    let has_rand_op = plan
        .stages
        .iter()
        .any(|s| s.body.iter().any(|i| matches!(i, Instr::Rand { .. })));
    if has_rand_op {
        helpers.require(helpers::FRAND);
    }
    if let Some(out) = plan.output() {
        if let Some(conv) = helpers::store_conversion(out.dtype, plan.stochastic) {
            helpers.require(conv.helper);
        }
    }

    let mut w = SourceWriter::default();
    w.line("#include <float.h>");
    w.blank();
    let common = helpers.render();
    if !common.is_empty() {
        w.raw(&common);
        w.blank();
    }
    w.line(format!("#define THREADS {}", plan.threads));
    w.blank();

    w.line(format!("extern \"C\" __global__ void {}(", plan.name));
    let params: Vec<String> = plan.params.iter().map(param_decl).collect();
    w.indented(|w| {
        for (i, decl) in params.iter().enumerate() {
            let sep = if i + 1 == params.len() { ")" } else { "," };
            w.line(format!("{decl}{sep}"));
        }
    });
    w.line("{");
    w.indented(|w| {
        w.line("const int tid = threadIdx.x;");
        w.line("const int bid = blockIdx.x;");
        w.blank();
        w.line("extern __shared__ float sPartials[];");
        w.blank();
        emit_inits(w, plan);
        for stage in &plan.stages {
            w.blank();
            emit_stage(w, plan, stage);
        }
        if plan.uses_rand {
            w.blank();
            w.line("*rand_state = lfsr0 ^ lfsr1 ^ lfsr2;");
        }
    });
    w.line("}");
    w.finish()
}

fn param_decl(param: &Param) -> String {
    match *param {
        Param::RandState => "unsigned* rand_state".to_string(),
        Param::Data { slot: 0, dtype } => format!("{}* a_out", dtype.c_type()),
        Param::Data { slot, dtype } => format!("const {}* a{slot}_in", dtype.c_type()),
        Param::RowStride { slot: 0 } => "int row_strd".to_string(),
        Param::RowStride { slot } => format!("int row_strd{slot}"),
        Param::ColStride { slot: 0 } => "int col_strd".to_string(),
        Param::ColStride { slot } => format!("int col_strd{slot}"),
        Param::TakeIndex { slot: 0 } => "const int* take_out".to_string(),
        Param::TakeIndex { slot } => format!("const int* take{slot}_in"),
        Param::Const { slot } => format!("float c{slot}"),
        Param::LoopBound { stage } => format!("int n{stage}"),
        Param::Unused { index } => format!("int unused{index}"),
        Param::MantissaBits => "int mantissa_bits".to_string(),
        Param::OneHotIndex { id } => format!("const int* onehot{id}_in"),
    }
}

fn emit_inits(w: &mut SourceWriter, plan: &KernelPlan) {
    if plan.uses_rand {
        w.line("unsigned lfsr0, lfsr1, lfsr2;");
        w.line("const unsigned idx = bid * THREADS + tid;");
        w.line("rand_state += idx % (2048 * 32);");
        w.line("lfsr0 = *rand_state;");
        w.line("asm volatile(\"mov.b32 %0, %%clock;\" : \"=r\"(lfsr1));");
        w.line("asm volatile(\"mov.b32 %0, %%globaltimer_lo;\" : \"=r\"(lfsr2));");
        w.line("asm(\"shf.r.clamp.b32 %0, %0, %0, %1;\" : \"+r\"(lfsr1) : \"r\"((lfsr1 & 31) ^ tid));");
        w.line("asm(\"shf.r.clamp.b32 %0, %0, %0, %1;\" : \"+r\"(lfsr2) : \"r\"((lfsr2 & 31) ^ tid));");
        w.line("lfsr1 ^= (idx << 3) ^ (idx << 7);");
        w.line("lfsr2 ^= (idx << 17) ^ (idx << 23);");
    }
    if plan.stochastic {
        w.line("const int i_rand_scale = (127 - 32 - mantissa_bits) << 23;");
        w.line("const float rand_scale = __int_as_float(i_rand_scale);");
        w.line("const unsigned rand_mask = 0xffffffffu << (23 - mantissa_bits);");
    }

    if let Some(out) = plan.output() {
        match out.take {
            TakeMode::None => {
                w.line("a_out += bid * row_strd + tid * col_strd;");
                w.line("const int out_inc = THREADS * col_strd;");
            }
            TakeMode::Block => {
                w.line("a_out += __ldg(take_out + bid) * row_strd + tid * col_strd;");
                w.line("const int out_inc = THREADS * col_strd;");
            }
            TakeMode::Loop => {
                w.line("a_out += bid * row_strd;");
                w.line("take_out += tid;");
            }
        }
    }

    for stage in &plan.stages {
        let s = stage.index;
        for &slot in &stage.loads {
            let Some(binding) = plan.tensor(slot) else {
                continue;
            };
            let ty = binding.dtype.c_type();
            match binding.take {
                TakeMode::None => {
                    w.line(format!(
                        "const {ty}* a{slot}_in{s} = a{slot}_in + bid * row_strd{slot} + tid * col_strd{slot};"
                    ));
                    w.line(format!("const int a{slot}_inc{s} = THREADS * col_strd{slot};"));
                }
                TakeMode::Block => {
                    w.line(format!(
                        "const {ty}* a{slot}_in{s} = a{slot}_in + __ldg(take{slot}_in + bid) * row_strd{slot} + tid * col_strd{slot};"
                    ));
                    w.line(format!("const int a{slot}_inc{s} = THREADS * col_strd{slot};"));
                }
                TakeMode::Loop => {
                    w.line(format!(
                        "const {ty}* a{slot}_in{s} = a{slot}_in + bid * row_strd{slot};"
                    ));
                    w.line(format!("const int* take{slot}_in{s} = take{slot}_in + tid;"));
                }
            }
        }
        for onehot in &stage.onehots {
            let id = onehot.id;
            if onehot.axis == 0 {
                w.line(format!("const int* onehot{id}_p = onehot{id}_in + tid;"));
            } else {
                w.line(format!("const int onehot{id} = __ldg(onehot{id}_in + bid);"));
            }
        }
        if let Some(red) = stage.reduction {
            let reg = red.reg;
            match red.op {
                Op::Sum => w.line(format!("float r{reg} = 0.0f;")),
                Op::Max => w.line(format!("float r{reg} = -FLT_MAX;")),
                Op::Min => w.line(format!("float r{reg} = FLT_MAX;")),
                Op::ArgMax => w.line(format!("int i{reg} = -1; float best{reg} = -FLT_MAX;")),
                Op::ArgMin => w.line(format!("int i{reg} = -1; float best{reg} = FLT_MAX;")),
                _ => {}
            }
        }
    }
}

fn emit_stage(w: &mut SourceWriter, plan: &KernelPlan, stage: &StagePlan) {
    let s = stage.index;
    match stage.kind {
        StageKind::Reduction | StageKind::EwOut => {
            let kind = if stage.kind == StageKind::Reduction {
                "reduction"
            } else {
                "elementwise output"
            };
            w.line(format!("// stage {s}: {kind}"));
            w.open(format!("for (int i = tid; i < n{s}; i += THREADS)"));
            emit_loads(w, plan, stage);
            for instr in &stage.body {
                emit_instr(w, plan, instr);
            }
            w.close();
            if let Some(red) = stage.reduction {
                if plan.threads > 32 {
                    emit_block_reduce(w, red.op, red.reg);
                } else {
                    emit_warp_reduce(w, red.op, red.reg);
                }
            }
        }
        StageKind::Scalar => {
            w.line(format!("// stage {s}: post-reduction scalar"));
            for instr in &stage.body {
                emit_instr(w, plan, instr);
            }
        }
        StageKind::RedOut => {
            w.line(format!("// stage {s}: reduction output"));
            w.open("if (tid == 0)");
            for instr in &stage.body {
                emit_instr(w, plan, instr);
            }
            w.close();
        }
    }
}

fn emit_loads(w: &mut SourceWriter, plan: &KernelPlan, stage: &StagePlan) {
    let s = stage.index;
    for &slot in &stage.loads {
        let Some(binding) = plan.tensor(slot) else {
            continue;
        };
        let cvt = binding.dtype.load_conversion();
        match binding.take {
            TakeMode::None | TakeMode::Block => {
                w.line(format!("float a{slot} = {cvt}(__ldg(a{slot}_in{s}));"));
                w.line(format!("a{slot}_in{s} += a{slot}_inc{s};"));
            }
            TakeMode::Loop => {
                w.line(format!(
                    "float a{slot} = {cvt}(__ldg(a{slot}_in{s} + __ldg(take{slot}_in{s}) * col_strd{slot}));"
                ));
                w.line(format!("take{slot}_in{s} += THREADS;"));
            }
        }
    }
    for onehot in &stage.onehots {
        if onehot.axis == 0 {
            let id = onehot.id;
            w.line(format!("const int onehot{id} = __ldg(onehot{id}_p);"));
            w.line(format!("onehot{id}_p += THREADS;"));
        }
    }
}

fn value(v: Value) -> String {
    match v {
        Value::Tensor(slot) => format!("a{slot}"),
        Value::Const(slot) => format!("c{slot}"),
        Value::Reg(id) => format!("r{id}"),
        Value::Index(id) => format!("i{id}"),
    }
}

fn unary_expr(op: Op, x: &str) -> String {
    match op {
        Op::Neg => format!("-{x}"),
        Op::Abs => format!("fabsf({x})"),
        Op::Sgn => format!("copysignf(1.0f, {x})"),
        Op::Sqrt => format!("sqrtf({x})"),
        Op::Sqr => format!("{x} * {x}"),
        Op::Exp => format!("expf({x})"),
        Op::Log => format!("logf({x})"),
        Op::Exp2 => format!("exp2f({x})"),
        Op::Log2 => format!("log2f({x})"),
        Op::Sig => format!("1.0f / (1.0f + expf(-{x}))"),
        Op::Sig2 => format!("1.0f / (1.0f + exp2f(-{x}))"),
        Op::Tanh => format!("tanhf({x})"),
        Op::Tanh2 => format!("(exp2f(2.0f * {x}) - 1.0f) / (exp2f(2.0f * {x}) + 1.0f)"),
        Op::Finite => format!("isfinite({x}) ? 1.0f : 0.0f"),
        _ => x.to_string(),
    }
}

fn binary_expr(op: Op, l: &str, r: &str) -> String {
    match op {
        Op::Add => format!("{l} + {r}"),
        Op::Sub => format!("{l} - {r}"),
        Op::Mul => format!("{l} * {r}"),
        Op::Div => format!("{l} / {r}"),
        Op::Eq => format!("{l} == {r}"),
        Op::Ne => format!("{l} != {r}"),
        Op::Lt => format!("{l} < {r}"),
        Op::Le => format!("{l} <= {r}"),
        Op::Gt => format!("{l} > {r}"),
        Op::Ge => format!("{l} >= {r}"),
        Op::Minimum => format!("fminf({l}, {r})"),
        Op::Maximum => format!("fmaxf({l}, {r})"),
        Op::Pow => format!("powf({l}, {r})"),
        _ => l.to_string(),
    }
}

fn emit_instr(w: &mut SourceWriter, plan: &KernelPlan, instr: &Instr) {
    match *instr {
        Instr::Unary { dst, op, src } => {
            w.line(format!("float r{dst} = {};", unary_expr(op, &value(src))));
        }
        Instr::Binary { dst, op, lhs, rhs } => {
            w.line(format!(
                "float r{dst} = {};",
                binary_expr(op, &value(lhs), &value(rhs))
            ));
        }
        Instr::Rand { dst } => w.line(format!("float r{dst} = frand(lfsr0, lfsr1, lfsr2);")),
        Instr::OneHot { dst, id, axis } => {
            let test = if axis == 0 { "bid" } else { "i" };
            w.line(format!("float r{dst} = onehot{id} == {test};"));
        }
        Instr::Accumulate { reg, op, src } => {
            let v = value(src);
            match op {
                Op::Sum => w.line(format!("r{reg} += {v};")),
                Op::Max => w.line(format!("r{reg} = fmaxf(r{reg}, {v});")),
                Op::Min => w.line(format!("r{reg} = fminf(r{reg}, {v});")),
                Op::ArgMax => w.line(format!(
                    "if (i{reg} < 0 || {v} > best{reg}) {{ best{reg} = {v}; i{reg} = i; }}"
                )),
                Op::ArgMin => w.line(format!(
                    "if (i{reg} < 0 || {v} < best{reg}) {{ best{reg} = {v}; i{reg} = i; }}"
                )),
                _ => {}
            }
        }
        Instr::Store { value: v, stochastic } => {
            let Some(out) = plan.output() else {
                return;
            };
            let src = value(v);
            let stored = match (v, helpers::store_conversion(out.dtype, stochastic)) {
                // indices go straight into integer outputs
                (Value::Index(_), _) if out.dtype.is_integer() => src,
                (_, Some(conv)) => {
                    w.line(format!(
                        "const {} out_val = {}({src}{});",
                        out.dtype.c_type(),
                        conv.func,
                        conv.rand_args
                    ));
                    "out_val".to_string()
                }
                (_, None) => src,
            };
            match out.take {
                TakeMode::None | TakeMode::Block => {
                    w.line(format!("*a_out = {stored};"));
                    w.line("a_out += out_inc;");
                }
                TakeMode::Loop => {
                    w.line(format!("*(a_out + __ldg(take_out) * col_strd) = {stored};"));
                    w.line("take_out += THREADS;");
                }
            }
        }
    }
}

fn shuffle_step(op: Op, reg: u32) -> Vec<String> {
    match op {
        Op::Sum => vec![format!("r{reg} += __shfl_xor_sync(0xffffffff, r{reg}, j);")],
        Op::Max => vec![format!(
            "r{reg} = fmaxf(r{reg}, __shfl_xor_sync(0xffffffff, r{reg}, j));"
        )],
        Op::Min => vec![format!(
            "r{reg} = fminf(r{reg}, __shfl_xor_sync(0xffffffff, r{reg}, j));"
        )],
        Op::ArgMax | Op::ArgMin => {
            let cmp = if op == Op::ArgMax { ">" } else { "<" };
            vec![
                format!("float best2 = __shfl_xor_sync(0xffffffff, best{reg}, j);"),
                format!("int arg2 = __shfl_xor_sync(0xffffffff, i{reg}, j);"),
                format!(
                    "if (arg2 >= 0 && (i{reg} < 0 || best2 {cmp} best{reg} || (best2 == best{reg} && arg2 < i{reg}))) {{ best{reg} = best2; i{reg} = arg2; }}"
                ),
            ]
        }
        _ => Vec::new(),
    }
}

fn emit_warp_reduce(w: &mut SourceWriter, op: Op, reg: u32) {
    w.line("#pragma unroll");
    w.open("for (int j = 16; j > 0; j >>= 1)");
    for line in shuffle_step(op, reg) {
        w.line(line);
    }
    w.close();
}

fn emit_block_reduce(w: &mut SourceWriter, op: Op, reg: u32) {
    let (share1, share2) = match op {
        Op::Max => (
            "sPartials[tid] = fmaxf(sPartials[tid], sPartials[tid + a]);".to_string(),
            format!("r{reg} = fmaxf(sPartials[tid], sPartials[tid + 32]);"),
        ),
        Op::Min => (
            "sPartials[tid] = fminf(sPartials[tid], sPartials[tid + a]);".to_string(),
            format!("r{reg} = fminf(sPartials[tid], sPartials[tid + 32]);"),
        ),
        _ => (
            "sPartials[tid] += sPartials[tid + a];".to_string(),
            format!("r{reg} = sPartials[tid] + sPartials[tid + 32];"),
        ),
    };
    w.line(format!("sPartials[tid] = r{reg};"));
    w.line("__syncthreads();");
    w.line("#pragma unroll");
    w.open("for (int a = THREADS >> 1; a > 32; a >>= 1)");
    w.line("if (tid < a)");
    w.indented(|w| w.line(&share1));
    w.line("__syncthreads();");
    w.close();
    w.open("if (tid < 32)");
    w.line(share2);
    emit_warp_reduce(w, op, reg);
    w.line(format!("sPartials[tid] = r{reg};"));
    w.close();
    w.line("__syncthreads();");
    w.line(format!("r{reg} = sPartials[0];"));
    // the next reduction stage reuses sPartials
    w.line("__syncthreads();");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::plan_fused;
    use crate::dtype::DType;
    use crate::signature::{SigItem, Signature};

    fn tensor(slot: usize, dtype: DType) -> SigItem {
        SigItem::Tensor {
            slot,
            dtype,
            take: TakeMode::None,
        }
    }

    fn sum_of(threads: u32) -> Signature {
        Signature::new(vec![
            tensor(0, DType::F32),
            tensor(1, DType::F32),
            SigItem::Op { op: Op::Sum, id: 0 },
            SigItem::Assign {
                id: 1,
                stochastic: false,
                threads,
            },
        ])
    }

    #[test]
    fn single_warp_reduction_uses_shuffles_only() {
        let plan = plan_fused(&sum_of(32)).unwrap();
        let src = render_fused(&plan);
        assert!(src.contains("#define THREADS 32"));
        assert!(src.contains("__shfl_xor_sync(0xffffffff, r0, j)"));
        assert!(!src.contains("__syncthreads"));
        assert!(src.contains("if (tid == 0)"));
        assert!(src.contains(&format!("extern \"C\" __global__ void {}(", plan.name)));
        assert!(!src.contains("urand_gen"));
    }

    #[test]
    fn wide_reduction_goes_through_shared_memory() {
        let plan = plan_fused(&sum_of(256)).unwrap();
        let src = render_fused(&plan);
        assert!(src.contains("sPartials[tid] = r0;"));
        assert!(src.contains("for (int a = THREADS >> 1; a > 32; a >>= 1)"));
        assert!(src.contains("r0 = sPartials[0];"));
        assert_eq!(src.matches("__syncthreads();").count(), 4);
    }

    #[test]
    fn half_inputs_and_stochastic_outputs_pull_in_helpers() {
        let sig = Signature::new(vec![
            tensor(0, DType::F16),
            tensor(1, DType::F16),
            SigItem::Op { op: Op::Exp, id: 0 },
            SigItem::Assign {
                id: 1,
                stochastic: true,
                threads: 32,
            },
        ]);
        let plan = plan_fused(&sig).unwrap();
        let src = render_fused(&plan);
        assert!(src.contains("float fp16_to_fp32(unsigned short val)"));
        assert!(src.contains("unsigned urand_gen("));
        assert!(src.contains("fp32_to_fp16_rand(r0, lfsr0, lfsr1, lfsr2, rand_scale, rand_mask)"));
        assert!(src.contains("int mantissa_bits)"));
        assert!(src.contains("*rand_state = lfsr0 ^ lfsr1 ^ lfsr2;"));
        assert!(!src.contains("float frand("));
    }

    #[test]
    fn gathers_index_through_the_take_array() {
        let sig = Signature::new(vec![
            tensor(0, DType::F32),
            SigItem::Tensor {
                slot: 1,
                dtype: DType::F32,
                take: TakeMode::Loop,
            },
            SigItem::Tensor {
                slot: 2,
                dtype: DType::F32,
                take: TakeMode::Block,
            },
            SigItem::Op { op: Op::Add, id: 0 },
            SigItem::Assign {
                id: 1,
                stochastic: false,
                threads: 32,
            },
        ]);
        let src = render_fused(&plan_fused(&sig).unwrap());
        assert!(src.contains("__ldg(a1_in0 + __ldg(take1_in0) * col_strd1)"));
        assert!(src.contains("a2_in + __ldg(take2_in + bid) * row_strd2"));
        assert!(src.contains("float r0 = a1 + a2;"));
    }
}
