//! Executes kernel programs block by block, thread by thread, on host memory.
//!
//! The interpreter follows the device execution model closely enough to be a
//! numeric reference: threads stride the loop axis, reductions combine
//! per-thread partials, scalar stages run on every thread and terminal
//! reductions store from thread 0 only.

use std::collections::HashMap;

use ewfuse::codegen::{Instr, KernelPlan, Param, StagePlan, Value};
use ewfuse::signature::TakeMode;
use ewfuse::stages::StageKind;
use ewfuse::{DType, DevicePtr, FuseError, FuseResult, KernelArg, LaunchConfig, Op, RandState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::memory::{element_address, Memory};
use crate::rounding::{narrow, narrow_index, Tausworthe};

/// Launch arguments resolved against a plan's parameter list.
#[derive(Default)]
struct Bindings {
    rand_state: DevicePtr,
    data: HashMap<usize, DevicePtr>,
    row: HashMap<usize, i64>,
    col: HashMap<usize, i64>,
    take: HashMap<usize, DevicePtr>,
    consts: HashMap<usize, f32>,
    bounds: HashMap<usize, i64>,
    onehot: HashMap<u32, DevicePtr>,
    mantissa_bits: u32,
}

fn bind(plan: &KernelPlan, args: &[KernelArg]) -> FuseResult<Bindings> {
    let mut b = Bindings::default();
    for (param, arg) in plan.params.iter().zip(args) {
        match (*param, *arg) {
            (Param::RandState, KernelArg::Ptr(p)) => b.rand_state = p,
            (Param::Data { slot, .. }, KernelArg::Ptr(p)) => {
                b.data.insert(slot, p);
            }
            (Param::RowStride { slot }, KernelArg::I32(v)) => {
                b.row.insert(slot, v as i64);
            }
            (Param::ColStride { slot }, KernelArg::I32(v)) => {
                b.col.insert(slot, v as i64);
            }
            (Param::TakeIndex { slot }, KernelArg::Ptr(p)) => {
                b.take.insert(slot, p);
            }
            (Param::Const { slot }, KernelArg::F32(v)) => {
                b.consts.insert(slot, v);
            }
            (Param::LoopBound { stage }, KernelArg::I32(v)) => {
                b.bounds.insert(stage, v as i64);
            }
            (Param::Unused { .. }, KernelArg::I32(_)) => {}
            (Param::MantissaBits, KernelArg::I32(v)) => b.mantissa_bits = v.clamp(0, 23) as u32,
            (Param::OneHotIndex { id }, KernelArg::Ptr(p)) => {
                b.onehot.insert(id, p);
            }
            (param, arg) => {
                return Err(FuseError::device(format!(
                    "argument {arg:?} does not fit parameter {param:?}"
                )))
            }
        }
    }
    Ok(b)
}

/// Per-thread registers.
#[derive(Default)]
struct Lane {
    regs: HashMap<u32, f32>,
    index: HashMap<u32, i32>,
    best: HashMap<u32, f32>,
    rng: Option<Tausworthe>,
}

impl Lane {
    fn value(&self, value: Value, loaded: &HashMap<usize, f32>, b: &Bindings) -> FuseResult<f32> {
        let missing = || FuseError::device(format!("value {value:?} read before it was written"));
        match value {
            Value::Tensor(slot) => loaded.get(&slot).copied().ok_or_else(missing),
            Value::Const(slot) => b.consts.get(&slot).copied().ok_or_else(missing),
            Value::Reg(id) => self.regs.get(&id).copied().ok_or_else(missing),
            Value::Index(id) => self.index.get(&id).map(|i| *i as f32).ok_or_else(missing),
        }
    }
}

/// Seeds the two per-launch generator components the device takes from clocks.
fn lane_generator(pool_word: u32, idx: u64, launch: u64) -> Tausworthe {
    let mut rng = StdRng::seed_from_u64(idx ^ (launch << 32));
    Tausworthe::new(pool_word, rng.gen::<u32>() | 0x80, rng.gen::<u32>() | 0x80)
}

struct FusedRun<'a> {
    plan: &'a KernelPlan,
    b: Bindings,
    mem: &'a mut Memory,
    threads: usize,
    launch: u64,
}

impl FusedRun<'_> {
    fn tensor_address(&self, slot: usize, bid: i64, i: i64) -> FuseResult<u64> {
        let binding = self
            .plan
            .tensor(slot)
            .ok_or_else(|| FuseError::device(format!("no tensor bound to slot {slot}")))?;
        let unbound = || FuseError::device(format!("slot {slot} has no pointer"));
        let base = *self.b.data.get(&slot).ok_or_else(unbound)?;
        let row = *self.b.row.get(&slot).ok_or_else(unbound)?;
        let col = *self.b.col.get(&slot).ok_or_else(unbound)?;
        let (r, c) = match binding.take {
            TakeMode::None => (bid, i),
            TakeMode::Block => {
                let take = *self.b.take.get(&slot).ok_or_else(unbound)?;
                let index = self.mem.read_i32(element_address(take, bid, DType::Si32)?)?;
                (index as i64, i)
            }
            TakeMode::Loop => {
                let take = *self.b.take.get(&slot).ok_or_else(unbound)?;
                let index = self.mem.read_i32(element_address(take, i, DType::Si32)?)?;
                (bid, index as i64)
            }
        };
        element_address(base, r * row + c * col, binding.dtype)
    }

    fn onehot_hit(&self, id: u32, axis: usize, bid: i64, i: i64) -> FuseResult<f32> {
        let idx = *self
            .b
            .onehot
            .get(&id)
            .ok_or_else(|| FuseError::device(format!("onehot {id} has no index array")))?;
        let hit = if axis == 0 {
            self.mem.read_i32(element_address(idx, i, DType::Si32)?)? as i64 == bid
        } else {
            self.mem.read_i32(element_address(idx, bid, DType::Si32)?)? as i64 == i
        };
        Ok(if hit { 1.0 } else { 0.0 })
    }

    fn run(&mut self, blocks: usize) -> FuseResult<()> {
        for bid in 0..blocks {
            let mut lanes: Vec<Lane> = (0..self.threads).map(|_| Lane::default()).collect();
            if self.plan.uses_rand {
                for (tid, lane) in lanes.iter_mut().enumerate() {
                    let idx = (bid * self.threads + tid) as u64;
                    let addr = self.pool_address(idx)?;
                    lane.rng = Some(lane_generator(self.mem.read_u32(addr)?, idx, self.launch));
                }
            }
            let plan = self.plan;
            for stage in &plan.stages {
                self.run_stage(stage, bid as i64, &mut lanes)?;
            }
            if self.plan.uses_rand {
                for (tid, lane) in lanes.iter().enumerate() {
                    if let Some(rng) = lane.rng {
                        let addr = self.pool_address((bid * self.threads + tid) as u64)?;
                        self.mem.write_u32(addr, rng.fold())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn pool_address(&self, idx: u64) -> FuseResult<u64> {
        let slot = idx % RandState::POOL_WORDS as u64;
        element_address(self.b.rand_state, slot as i64, DType::Ui32)
    }

    fn run_stage(&mut self, stage: &StagePlan, bid: i64, lanes: &mut [Lane]) -> FuseResult<()> {
        match stage.kind {
            StageKind::Reduction | StageKind::EwOut => {
                let n = *self.b.bounds.get(&stage.index).ok_or_else(|| {
                    FuseError::device(format!("stage {} has no loop bound", stage.index))
                })?;
                if let Some(red) = stage.reduction {
                    for lane in lanes.iter_mut() {
                        init_reduction(lane, red.op, red.reg);
                    }
                }
                let threads = lanes.len() as i64;
                for (tid, lane) in lanes.iter_mut().enumerate() {
                    let mut i = tid as i64;
                    while i < n {
                        let mut loaded = HashMap::with_capacity(stage.loads.len());
                        for &slot in &stage.loads {
                            let addr = self.tensor_address(slot, bid, i)?;
                            let dtype = self.plan.tensor(slot).map_or(DType::F32, |t| t.dtype);
                            loaded.insert(slot, self.mem.load(addr, dtype)?);
                        }
                        for instr in &stage.body {
                            self.exec(instr, lane, &loaded, bid, i)?;
                        }
                        i += threads;
                    }
                }
                if let Some(red) = stage.reduction {
                    combine(lanes, red.op, red.reg);
                }
            }
            StageKind::Scalar => {
                let loaded = HashMap::new();
                for lane in lanes.iter_mut() {
                    for instr in &stage.body {
                        self.exec(instr, lane, &loaded, bid, 0)?;
                    }
                }
            }
            StageKind::RedOut => {
                let loaded = HashMap::new();
                if let Some(lane) = lanes.first_mut() {
                    for instr in &stage.body {
                        self.exec(instr, lane, &loaded, bid, 0)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn exec(
        &mut self,
        instr: &Instr,
        lane: &mut Lane,
        loaded: &HashMap<usize, f32>,
        bid: i64,
        i: i64,
    ) -> FuseResult<()> {
        match *instr {
            Instr::Unary { dst, op, src } => {
                let v = lane.value(src, loaded, &self.b)?;
                lane.regs.insert(dst, op.apply(v, 0.0));
            }
            Instr::Binary { dst, op, lhs, rhs } => {
                let l = lane.value(lhs, loaded, &self.b)?;
                let r = lane.value(rhs, loaded, &self.b)?;
                lane.regs.insert(dst, op.apply(l, r));
            }
            Instr::Rand { dst } => {
                let rng = lane
                    .rng
                    .as_mut()
                    .ok_or_else(|| FuseError::device("rand without generator state"))?;
                let v = rng.next_f32();
                lane.regs.insert(dst, v);
            }
            Instr::OneHot { dst, id, axis } => {
                let v = self.onehot_hit(id, axis, bid, i)?;
                lane.regs.insert(dst, v);
            }
            Instr::Accumulate { reg, op, src } => {
                let v = lane.value(src, loaded, &self.b)?;
                accumulate(lane, op, reg, v, i as i32);
            }
            Instr::Store { value, stochastic } => {
                let out = self
                    .plan
                    .output()
                    .ok_or_else(|| FuseError::device("plan has no output"))?;
                let dtype = out.dtype;
                let bits = match value {
                    Value::Index(id) if dtype.is_integer() => {
                        let index = lane.index.get(&id).copied().ok_or_else(|| {
                            FuseError::device(format!("index register {id} unset"))
                        })?;
                        narrow_index(dtype, index)
                    }
                    _ => {
                        let v = lane.value(value, loaded, &self.b)?;
                        let bits = self.b.mantissa_bits;
                        match (stochastic, lane.rng.as_mut()) {
                            (true, Some(rng)) => narrow(dtype, v, Some((rng, bits))),
                            (true, None) => {
                                return Err(FuseError::device(
                                    "stochastic store without generator state",
                                ))
                            }
                            (false, _) => narrow(dtype, v, None),
                        }
                    }
                };
                let addr = self.tensor_address(0, bid, i)?;
                self.mem.store(addr, dtype, bits)?;
            }
        }
        Ok(())
    }
}

fn init_reduction(lane: &mut Lane, op: Op, reg: u32) {
    match op {
        Op::Sum => {
            lane.regs.insert(reg, 0.0);
        }
        Op::Max => {
            lane.regs.insert(reg, f32::MIN);
        }
        Op::Min => {
            lane.regs.insert(reg, f32::MAX);
        }
        Op::ArgMax | Op::ArgMin => {
            lane.index.insert(reg, -1);
            lane.best
                .insert(reg, if op == Op::ArgMax { f32::MIN } else { f32::MAX });
        }
        _ => {}
    }
}

fn accumulate(lane: &mut Lane, op: Op, reg: u32, v: f32, i: i32) {
    match op {
        Op::Sum => *lane.regs.entry(reg).or_insert(0.0) += v,
        Op::Max => {
            let r = lane.regs.entry(reg).or_insert(f32::MIN);
            *r = r.max(v);
        }
        Op::Min => {
            let r = lane.regs.entry(reg).or_insert(f32::MAX);
            *r = r.min(v);
        }
        Op::ArgMax | Op::ArgMin => {
            let index = lane.index.get(&reg).copied().unwrap_or(-1);
            let best = lane.best.get(&reg).copied().unwrap_or(0.0);
            let better = if op == Op::ArgMax { v > best } else { v < best };
            if index < 0 || better {
                lane.best.insert(reg, v);
                lane.index.insert(reg, i);
            }
        }
        _ => {}
    }
}

/// Cross-thread combine; every lane ends up holding the block result.
fn combine(lanes: &mut [Lane], op: Op, reg: u32) {
    match op {
        Op::ArgMax | Op::ArgMin => {
            let mut winner: Option<(i32, f32)> = None;
            for lane in lanes.iter() {
                let index = lane.index.get(&reg).copied().unwrap_or(-1);
                if index < 0 {
                    continue;
                }
                let best = lane.best.get(&reg).copied().unwrap_or(0.0);
                winner = match winner {
                    None => Some((index, best)),
                    Some((wi, wb)) => {
                        let better = if op == Op::ArgMax { best > wb } else { best < wb };
                        if better || (best == wb && index < wi) {
                            Some((index, best))
                        } else {
                            Some((wi, wb))
                        }
                    }
                };
            }
            let (index, best) = winner.unwrap_or((-1, 0.0));
            for lane in lanes.iter_mut() {
                lane.index.insert(reg, index);
                lane.best.insert(reg, best);
            }
        }
        _ => {
            let partials = lanes.iter().filter_map(|lane| lane.regs.get(&reg).copied());
            let total = match op {
                Op::Max => partials.fold(f32::MIN, f32::max),
                Op::Min => partials.fold(f32::MAX, f32::min),
                _ => partials.sum(),
            };
            for lane in lanes.iter_mut() {
                lane.regs.insert(reg, total);
            }
        }
    }
}

pub(crate) fn run_fused(
    mem: &mut Memory,
    plan: &KernelPlan,
    config: LaunchConfig,
    args: &[KernelArg],
    launch: u64,
) -> FuseResult<()> {
    let threads = config.block.0 as usize;
    if threads != plan.threads as usize {
        return Err(FuseError::device(format!(
            "{} compiled for {} threads, launched with {threads}",
            plan.name, plan.threads
        )));
    }
    let mut run = FusedRun {
        plan,
        b: bind(plan, args)?,
        mem,
        threads,
        launch,
    };
    run.run(config.grid.0 as usize)
}

pub(crate) fn run_transpose(mem: &mut Memory, dtype: DType, args: &[KernelArg]) -> FuseResult<()> {
    let [KernelArg::Ptr(out), KernelArg::Ptr(input), KernelArg::I32(rows), KernelArg::I32(cols)] =
        *args
    else {
        return Err(FuseError::device("transpose expects (out, in, rows, cols)"));
    };
    let size = dtype.size_in_bytes();
    let (rows, cols) = (rows.max(0) as i64, cols.max(0) as i64);
    for r in 0..rows {
        for c in 0..cols {
            let src = element_address(input, r * cols + c, dtype)?;
            let value = mem.read(src, size)?.to_vec();
            mem.write(element_address(out, c * rows + r, dtype)?, &value)?;
        }
    }
    Ok(())
}

/// Quotient through the kernel's multiply-shift, so bad magic numbers show up here too.
fn magic_div(n: i64, magic: i32, shift: i32) -> i64 {
    let product = u64::from(magic as u32) * n as u64;
    product.checked_shr(shift as u32).unwrap_or(0) as i64
}

pub(crate) fn run_dim_shuffle(
    mem: &mut Memory,
    dtype: DType,
    config: LaunchConfig,
    args: &[KernelArg],
) -> FuseResult<()> {
    let [KernelArg::Ptr(out), KernelArg::Ptr(input), KernelArg::I32(trsk), KernelArg::I32(rsk), KernelArg::I32(sk), KernelArg::I32(k_len), KernelArg::I32(trsc), KernelArg::I32(rsc), KernelArg::I32(sc), KernelArg::I32(c_len), KernelArg::I32(rs_len), KernelArg::I32(magic_rs), KernelArg::I32(shift_rs), KernelArg::I32(s_len), KernelArg::I32(magic_s), KernelArg::I32(shift_s)] =
        *args
    else {
        return Err(FuseError::device("dim_shuffle argument list mismatch"));
    };
    let size = dtype.size_in_bytes();
    let [trsk, rsk, sk, k_len, trsc, rsc, sc, c_len, rs_len, s_len] =
        [trsk, rsk, sk, k_len, trsc, rsc, sc, c_len, rs_len, s_len].map(i64::from);
    for trs in 0..i64::from(config.grid.2) {
        let t = magic_div(trs, magic_rs, shift_rs);
        let rs = trs - t * rs_len;
        let r = magic_div(rs, magic_s, shift_s);
        let s = rs - r * s_len;
        for c in 0..c_len {
            for k in 0..k_len {
                let src = c * trsk + t * rsk + r * sk + s * k_len + k;
                let dst = k * trsc + t * rsc + r * sc + s * c_len + c;
                let value = mem.read(element_address(input, src, dtype)?, size)?.to_vec();
                mem.write(element_address(out, dst, dtype)?, &value)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn run_compensated_sum(
    mem: &mut Memory,
    dtype: DType,
    stochastic: bool,
    config: LaunchConfig,
    args: &[KernelArg],
    launch: u64,
) -> FuseResult<()> {
    let [KernelArg::Ptr(rand_state), KernelArg::Ptr(sum), KernelArg::Ptr(cmp), KernelArg::Ptr(add), KernelArg::F32(cmp_scale), KernelArg::F32(add_scale), KernelArg::I32(row), KernelArg::I32(col), KernelArg::I32(n), KernelArg::I32(mantissa_bits)] =
        *args
    else {
        return Err(FuseError::device("compensated_sum argument list mismatch"));
    };
    let threads = config.block.0 as usize;
    let (row, col) = (row as i64, col as i64);
    let mantissa_bits = mantissa_bits.clamp(0, 23) as u32;
    for bid in 0..config.grid.0 as usize {
        for tid in 0..threads {
            let idx = (bid * threads + tid) as u64;
            let pool = element_address(
                rand_state,
                (idx % RandState::POOL_WORDS as u64) as i64,
                DType::Ui32,
            );
            let mut rng = if stochastic {
                let pool = pool?;
                Some((pool, lane_generator(mem.read_u32(pool)?, idx, launch)))
            } else {
                None
            };
            let mut i = tid as i64;
            while i < n as i64 {
                let offset = bid as i64 * row + i * col;
                let sum_addr = element_address(sum, offset, dtype)?;
                let cmp_addr = element_address(cmp, offset, dtype)?;
                let s = mem.load(sum_addr, dtype)?;
                let c = mem.load(cmp_addr, dtype)?;
                let a = mem.load(element_address(add, offset, dtype)?, dtype)?;
                let y = a * add_scale - c * cmp_scale;
                let t = s + y;
                let t_bits = match rng.as_mut() {
                    Some((_, gen)) => narrow(dtype, t, Some((gen, mantissa_bits))),
                    None => narrow(dtype, t, None),
                };
                mem.store(sum_addr, dtype, t_bits)?;
                let t_rounded = mem.load(sum_addr, dtype)?;
                mem.store(cmp_addr, dtype, narrow(dtype, (t_rounded - s) - y, None))?;
                i += threads as i64;
            }
            if let Some((pool, gen)) = rng {
                mem.write_u32(pool, gen.fold())?;
            }
        }
    }
    Ok(())
}
