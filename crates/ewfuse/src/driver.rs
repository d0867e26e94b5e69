//! Call driver: turns a postfix argument stream into a cached kernel launch.

use std::sync::Arc;

use crate::cache::{CacheStats, CachedKernel, KernelCache};
use crate::codegen::check_args;
use crate::device::{Device, KernelArg, LaunchConfig};
use crate::dtype::DType;
use crate::env::EngineConfig;
use crate::error::{FuseError, FuseResult};
use crate::expr::Arg;
use crate::kernels::{
    magic_division, KernelKey, COMPENSATED_SUM_THREADS, TRANSPOSE_BLOCK_ROWS, TRANSPOSE_TILE,
};
use crate::ops::{Op, OpClass};
use crate::signature::{SigItem, Signature, TakeMode};
use crate::tensor::{DevicePtr, DeviceTensor, RandState, Rounding};

/// Compiles, caches and launches fused kernels on one device.
pub struct Engine<D: Device> {
    device: Arc<D>,
    cache: Arc<KernelCache<D::Kernel>>,
    config: EngineConfig,
}

/// Operand patterns found by a single scan of the argument stream.
#[derive(Debug, Default)]
struct Classification {
    broadcast: bool,
    transpose: bool,
    take: bool,
    strided: bool,
    onehot: bool,
    reduction: bool,
    arg_reduction: bool,
    axis: Option<usize>,
    max_rank: usize,
}

impl Classification {
    fn scan(args: &[Arg<'_>]) -> FuseResult<Self> {
        let mut class = Classification::default();
        for arg in args {
            match arg {
                Arg::Tensor(t) => {
                    t.check_layout()?;
                    class.max_rank = class.max_rank.max(t.rank());
                    if t.is_broadcast() {
                        class.broadcast = true;
                    } else if t.is_transposed() {
                        class.transpose = true;
                    } else if t.take().is_some() {
                        class.take = true;
                    } else if !t.is_contiguous() {
                        class.strided = true;
                    }
                }
                Arg::Const(_) => {}
                Arg::Op(desc) if desc.op.is_reduction() => {
                    let axis = match desc.axis {
                        Some(axis @ (0 | 1)) => axis,
                        Some(axis) => {
                            return Err(FuseError::construction(format!(
                                "{} axis must be 0 or 1, got {axis}",
                                desc.op
                            )))
                        }
                        None => {
                            return Err(FuseError::construction(format!(
                                "{} requires an axis",
                                desc.op
                            )))
                        }
                    };
                    match class.axis {
                        Some(prev) if prev != axis => {
                            return Err(FuseError::shape(format!(
                                "reductions over axis {prev} and axis {axis} in one expression"
                            )))
                        }
                        _ => class.axis = Some(axis),
                    }
                    class.reduction = true;
                    class.arg_reduction |= desc.op.is_arg_reduction();
                }
                Arg::Op(desc) if desc.op == Op::OneHot => {
                    if !matches!(desc.axis, Some(0 | 1)) {
                        return Err(FuseError::construction("onehot requires axis 0 or 1"));
                    }
                    if desc.idx.is_none() {
                        return Err(FuseError::construction("onehot requires an index tensor"));
                    }
                    class.onehot = true;
                }
                Arg::Op(_) => {}
            }
        }
        Ok(class)
    }

    /// Whether the call needs real 2-D shapes instead of a flat decomposition.
    fn native(&self) -> bool {
        self.broadcast
            || self.onehot
            || self.reduction
            || self.transpose
            || self.take
            || self.strided
    }

    fn threads(&self, red_depth: usize, max_shape: [usize; 2]) -> u32 {
        if self.reduction && !self.arg_reduction {
            match red_depth {
                d if d >= 4096 => 1024,
                d if d >= 2048 => 512,
                d if d >= 1024 => 256,
                d if d >= 512 => 128,
                d if d >= 256 => 64,
                _ => 32,
            }
        } else if !self.reduction && !self.transpose && max_shape[1] >= 512 {
            256
        } else {
            32
        }
    }
}

/// Splits `size` elements into `[rows, cols]` with a column count the kernels
/// stride well over: a multiple of 32 up to 256 when possible.
pub fn fast_ew_dims(size: usize) -> [usize; 2] {
    let cols = (32..=256)
        .rev()
        .step_by(32)
        .find(|d| size % d == 0)
        .or_else(|| (1..=255).rev().find(|d| size % d == 0))
        .unwrap_or(1);
    [size / cols, cols]
}

fn broadcast_shapes(lhs: [usize; 2], rhs: [usize; 2]) -> FuseResult<[usize; 2]> {
    let mut shape = [0; 2];
    for axis in 0..2 {
        shape[axis] = match (lhs[axis], rhs[axis]) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(FuseError::shape(format!(
                    "cannot broadcast ({}, {}) against ({}, {})",
                    lhs[0], lhs[1], rhs[0], rhs[1]
                )))
            }
        };
    }
    Ok(shape)
}

fn int_arg<T>(value: T, what: &str) -> FuseResult<KernelArg>
where
    T: TryInto<i32> + Copy + std::fmt::Display,
{
    value
        .try_into()
        .map(KernelArg::I32)
        .map_err(|_| FuseError::unsupported(format!("{what} {value} does not fit in i32")))
}

fn grid_dim(value: usize) -> FuseResult<u32> {
    u32::try_from(value).map_err(|_| FuseError::unsupported(format!("grid of {value} blocks")))
}

fn take_mode(tensor: &DeviceTensor, axis: usize) -> FuseResult<TakeMode> {
    let Some(take) = tensor.take() else {
        return Ok(TakeMode::None);
    };
    // the gathered axis either picks the block's row or the loop element
    match (axis, take.axis) {
        (1, 0) | (0, 1) => Ok(TakeMode::Block),
        (1, 1) | (0, 0) => Ok(TakeMode::Loop),
        (_, other) => Err(FuseError::unsupported(format!(
            "take along axis {other} of a rank-{} tensor",
            tensor.rank()
        ))),
    }
}

/// Shape and launch strides of one operand. With `flat` every operand shares
/// the flat decomposition of the output.
fn layout(
    tensor: &DeviceTensor,
    flat: Option<[usize; 2]>,
    axis: usize,
) -> FuseResult<([usize; 2], [isize; 2])> {
    if let Some(shape) = flat {
        return Ok((shape, [shape[1] as isize, 1]));
    }
    let (shape, mut strides) = tensor.view_2d().ok_or_else(|| {
        FuseError::unsupported(format!("rank-{} tensor outside flat elementwise work", tensor.rank()))
    })?;
    if axis == 0 {
        strides.swap(0, 1);
    }
    if shape[0] == 1 {
        strides[1 - axis] = 0;
    }
    if shape[1] == 1 {
        strides[axis] = 0;
    }
    Ok((shape, strides))
}

#[derive(Debug, Clone, Copy)]
struct Operand {
    shape: [usize; 2],
    output: bool,
    /// One value per block: built only from constants, reductions and the output.
    scalar: bool,
    reduced: bool,
}

impl Operand {
    fn leaf(shape: [usize; 2], output: bool, scalar: bool) -> Self {
        Self {
            shape,
            output,
            scalar,
            reduced: false,
        }
    }
}

/// Launch-ready form of one expression.
struct Marshaled<'t> {
    out: &'t DeviceTensor,
    signature: Signature,
    args: Vec<KernelArg>,
    max_shape: [usize; 2],
    red_depth: usize,
}

fn marshal<'t>(
    rand_state: &RandState,
    args: &[Arg<'t>],
    class: &Classification,
    axis: usize,
) -> FuseResult<Marshaled<'t>> {
    let malformed = |what: &str| FuseError::construction(format!("malformed expression: {what}"));
    let out = match args.first() {
        Some(Arg::Tensor(t)) => *t,
        _ => return Err(malformed("the first token must be the output tensor")),
    };
    let flat = if class.native() {
        if class.max_rank > 2 {
            return Err(FuseError::unsupported(format!(
                "rank-{} tensors only support flat elementwise work",
                class.max_rank
            )));
        }
        None
    } else {
        Some(fast_ew_dims(out.len()))
    };

    let mut items: Vec<SigItem> = Vec::with_capacity(args.len());
    let mut kargs = vec![KernelArg::Ptr(rand_state.ptr())];
    let mut stack: Vec<Operand> = Vec::new();
    let mut tensors: Vec<(&DeviceTensor, usize)> = Vec::new();
    let mut consts: Vec<(u32, usize)> = Vec::new();
    let mut next_slot = 0usize;
    let mut next_id = 0u32;
    let mut red_depth = 0usize;
    let mut assigned: Option<(usize, [usize; 2])> = None;

    for (pos, arg) in args.iter().enumerate() {
        if assigned.is_some() {
            return Err(malformed("tokens after assign"));
        }
        match *arg {
            Arg::Tensor(t) => {
                if flat.is_some() && t.shape() != out.shape() {
                    return Err(FuseError::shape(format!(
                        "{:?} does not match output {:?}",
                        t.shape(),
                        out.shape()
                    )));
                }
                let take = take_mode(t, axis)?;
                // the output keeps slot 0; any later read of it gets its own slot
                let reused = if pos == 0 {
                    None
                } else {
                    tensors.iter().find(|(seen, _)| *seen == t).map(|&(_, s)| s)
                };
                let slot = match reused {
                    Some(slot) => slot,
                    None => {
                        let slot = next_slot;
                        next_slot += 1;
                        if pos != 0 {
                            tensors.push((t, slot));
                        }
                        let (_, strides) = layout(t, flat, axis)?;
                        kargs.push(KernelArg::Ptr(t.ptr()));
                        kargs.push(int_arg(strides[0], "row stride")?);
                        kargs.push(int_arg(strides[1], "column stride")?);
                        if let Some(gather) = t.take() {
                            kargs.push(KernelArg::Ptr(gather.index));
                        }
                        slot
                    }
                };
                let (shape, _) = layout(t, flat, axis)?;
                items.push(SigItem::Tensor {
                    slot,
                    dtype: t.dtype(),
                    take,
                });
                stack.push(Operand::leaf(shape, pos == 0, pos == 0));
            }
            Arg::Const(value) => {
                let bits = value.to_bits();
                let slot = match consts.iter().find(|(b, _)| *b == bits) {
                    Some(&(_, slot)) => slot,
                    None => {
                        let slot = next_slot;
                        next_slot += 1;
                        consts.push((bits, slot));
                        kargs.push(KernelArg::F32(value));
                        slot
                    }
                };
                items.push(SigItem::Const { slot });
                stack.push(Operand::leaf([1, 1], false, true));
            }
            Arg::Op(desc) => {
                let id = next_id;
                next_id += 1;
                let mut pop = || stack.pop().ok_or_else(|| malformed("operand stack underflow"));
                match desc.op.class() {
                    OpClass::Nullary => {
                        if desc.op == Op::OneHot {
                            let (Some(idx), Some(hot)) = (desc.idx, desc.axis) else {
                                return Err(malformed("onehot without index or axis"));
                            };
                            let hot_axis = if axis == 1 { hot } else { 1 - hot };
                            kargs.push(KernelArg::Ptr(idx.ptr()));
                            items.push(SigItem::OneHot { id, axis: hot_axis });
                        } else {
                            items.push(SigItem::Op { op: desc.op, id });
                        }
                        stack.push(Operand::leaf([1, 1], false, false));
                    }
                    OpClass::Unary => {
                        let operand = pop()?;
                        items.push(SigItem::Op { op: desc.op, id });
                        stack.push(Operand {
                            output: false,
                            ..operand
                        });
                    }
                    OpClass::Binary => {
                        let rhs = pop()?;
                        let lhs = pop()?;
                        items.push(SigItem::Op { op: desc.op, id });
                        stack.push(Operand {
                            shape: broadcast_shapes(lhs.shape, rhs.shape)?,
                            output: false,
                            scalar: lhs.scalar && rhs.scalar,
                            reduced: lhs.reduced || rhs.reduced,
                        });
                    }
                    OpClass::Reduction => {
                        let mut operand = pop()?;
                        kargs.push(int_arg(operand.shape[axis], "reduction depth")?);
                        red_depth = red_depth.max(operand.shape[axis]);
                        operand.shape[axis] = 1;
                        items.push(SigItem::Op { op: desc.op, id });
                        stack.push(Operand {
                            output: false,
                            scalar: true,
                            reduced: true,
                            ..operand
                        });
                    }
                    OpClass::Assign => {
                        let value = pop()?;
                        let target = pop()?;
                        if !target.output {
                            return Err(malformed("assign must write the output tensor"));
                        }
                        let shape = broadcast_shapes(target.shape, value.shape)?;
                        if shape != target.shape {
                            return Err(FuseError::shape(format!(
                                "output ({}, {}) would be broadcast to ({}, {})",
                                target.shape[0], target.shape[1], shape[0], shape[1]
                            )));
                        }
                        // a per-block scalar is stored once, so the output must be reduced too
                        if value.scalar && value.reduced && target.shape[axis] != 1 {
                            return Err(FuseError::shape(format!(
                                "reduced value stored into an output with extent {} along axis {axis}",
                                target.shape[axis]
                            )));
                        }
                        let stochastic = desc.round
                            && matches!(out.rounding(), Rounding::Stochastic { .. });
                        kargs.push(int_arg(shape[axis], "loop bound")?);
                        if let Rounding::Stochastic { mantissa_bits } = out.rounding() {
                            if stochastic {
                                let bits = mantissa_bits.clamp(1, out.dtype().max_mantissa_bits());
                                kargs.push(int_arg(bits, "mantissa bits")?);
                            }
                        }
                        assigned = Some((items.len(), shape));
                        items.push(SigItem::Assign {
                            id,
                            stochastic,
                            threads: 0,
                        });
                    }
                }
            }
        }
    }

    let Some((assign_pos, max_shape)) = assigned else {
        return Err(malformed("missing assign"));
    };
    if !stack.is_empty() {
        return Err(malformed("leftover operands"));
    }
    let threads = class.threads(red_depth, max_shape);
    if let Some(SigItem::Assign { threads: t, .. }) = items.get_mut(assign_pos) {
        *t = threads;
    }

    Ok(Marshaled {
        out,
        signature: Signature::new(items),
        args: kargs,
        max_shape,
        red_depth,
    })
}

impl<D: Device> Engine<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self::with_cache(device, Arc::new(KernelCache::new()))
    }

    /// Engine sharing an existing cache, e.g. with other engines on the same device.
    pub fn with_cache(device: Arc<D>, cache: Arc<KernelCache<D::Kernel>>) -> Self {
        Self {
            device,
            cache,
            config: EngineConfig::from_env(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn cache(&self) -> &Arc<KernelCache<D::Kernel>> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> FuseResult<CacheStats> {
        self.cache.stats()
    }

    fn kernel(&self, key: &KernelKey) -> FuseResult<Arc<CachedKernel<D::Kernel>>> {
        self.cache
            .get_or_build(key, self.config.dump_dir.as_deref(), |source| {
                self.device.compile(source)
            })
    }

    fn run(
        &self,
        cached: &CachedKernel<D::Kernel>,
        config: LaunchConfig,
        args: &[KernelArg],
    ) -> FuseResult<()> {
        check_args(&cached.source.param_kinds(), args)?;
        if config.is_empty() {
            log::debug!("skipping empty launch of {}", cached.source.symbol);
            return Ok(());
        }
        let repeat = self.config.bench_repeat;
        if repeat > 1 {
            let elapsed = self
                .device
                .time_launches(&cached.kernel, config, args, repeat)?;
            log::info!(
                "{}: {:.4} ms per launch over {repeat} launches (grid {:?}, block {:?})",
                cached.source.symbol,
                elapsed.as_secs_f64() * 1e3 / repeat as f64,
                config.grid,
                config.block
            );
            Ok(())
        } else {
            self.device.launch(&cached.kernel, config, args)
        }
    }

    /// Evaluates a postfix expression in one fused launch and returns the
    /// output tensor it wrote in place.
    ///
    /// ```text
    /// C = sum(A, axis 1) * 2  =>  [C, A, sum(1), 2.0, mul, assign]
    /// ```
    pub fn evaluate<'t>(
        &self,
        rand_state: &RandState,
        args: &[Arg<'t>],
    ) -> FuseResult<&'t DeviceTensor> {
        let class = Classification::scan(args)?;
        let axis = class.axis.unwrap_or(1);
        let call = marshal(rand_state, args, &class, axis)?;

        let key = KernelKey::Fused(call.signature);
        let cached = self.kernel(&key)?;

        let blocks = call.max_shape[1 - axis];
        let threads = key_threads(&key);
        let mut config = LaunchConfig::linear(grid_dim(blocks)?, threads);
        if class.reduction && threads > 32 {
            config = config.with_shared(4 * threads);
        }
        if call.max_shape[axis] == 0 {
            log::debug!("skipping {}: empty loop axis", cached.source.symbol);
            return Ok(call.out);
        }
        log::trace!(
            "launch {} grid={} threads={} depth={}",
            cached.source.symbol,
            blocks,
            threads,
            call.red_depth
        );
        self.run(&cached, config, &call.args)?;
        Ok(call.out)
    }

    /// Converts a contiguous run of `f32` values at `src` into `dest`'s dtype.
    pub fn convert_f32(&self, src: DevicePtr, dest: &DeviceTensor) -> FuseResult<()> {
        if !dest.is_contiguous() || dest.take().is_some() {
            return Err(FuseError::unsupported("convert_f32 needs a contiguous destination"));
        }
        let [rows, cols] = fast_ew_dims(dest.len());
        let signature = Signature::new(vec![
            SigItem::Tensor {
                slot: 0,
                dtype: dest.dtype(),
                take: TakeMode::None,
            },
            SigItem::Tensor {
                slot: 1,
                dtype: DType::F32,
                take: TakeMode::None,
            },
            SigItem::Assign {
                id: 0,
                stochastic: false,
                threads: 32,
            },
        ]);
        let cached = self.kernel(&KernelKey::Fused(signature))?;
        let args = [
            KernelArg::Ptr(DevicePtr::NULL),
            KernelArg::Ptr(dest.ptr()),
            int_arg(cols, "row stride")?,
            KernelArg::I32(1),
            KernelArg::Ptr(src),
            int_arg(cols, "row stride")?,
            KernelArg::I32(1),
            int_arg(cols, "loop bound")?,
        ];
        self.run(&cached, LaunchConfig::linear(grid_dim(rows)?, 32), &args)
    }

    /// Writes the transpose of the rank-2 `input` into `out`.
    pub fn transpose(&self, out: &DeviceTensor, input: &DeviceTensor) -> FuseResult<()> {
        for t in [out, input] {
            if t.rank() != 2 || !t.is_contiguous() || t.take().is_some() {
                return Err(FuseError::unsupported(
                    "transpose needs contiguous rank-2 tensors",
                ));
            }
        }
        if out.dtype() != input.dtype() {
            return Err(FuseError::construction(format!(
                "transpose from {} into {}",
                input.dtype(),
                out.dtype()
            )));
        }
        let (rows, cols) = (input.shape()[0], input.shape()[1]);
        if out.shape() != [cols, rows] {
            return Err(FuseError::shape(format!(
                "transpose of {:?} cannot be stored into {:?}",
                input.shape(),
                out.shape()
            )));
        }
        let cached = self.kernel(&KernelKey::Transpose(input.dtype()))?;
        let tile = TRANSPOSE_TILE as usize;
        let config = LaunchConfig {
            grid: (grid_dim(cols.div_ceil(tile))?, grid_dim(rows.div_ceil(tile))?, 1),
            block: (TRANSPOSE_TILE, TRANSPOSE_BLOCK_ROWS, 1),
            shared_mem_bytes: 0,
        };
        let args = [
            KernelArg::Ptr(out.ptr()),
            KernelArg::Ptr(input.ptr()),
            int_arg(rows, "rows")?,
            int_arg(cols, "columns")?,
        ];
        self.run(&cached, config, &args)
    }

    /// Swaps the outer and inner axes of a 5-D tensor: `out[k,t,r,s,c] = in[c,t,r,s,k]`.
    pub fn dim_shuffle(&self, out: &DeviceTensor, input: &DeviceTensor) -> FuseResult<()> {
        for t in [out, input] {
            if t.rank() != 5 || !t.is_contiguous() || t.take().is_some() {
                return Err(FuseError::unsupported(
                    "dim_shuffle needs contiguous rank-5 tensors",
                ));
            }
        }
        if out.dtype() != input.dtype() {
            return Err(FuseError::construction(format!(
                "dim_shuffle from {} into {}",
                input.dtype(),
                out.dtype()
            )));
        }
        let &[c, t, r, s, k] = input.shape() else {
            return Err(FuseError::unsupported("dim_shuffle needs rank-5 tensors"));
        };
        if out.shape() != [k, t, r, s, c] {
            return Err(FuseError::shape(format!(
                "dim_shuffle of {:?} cannot be stored into {:?}",
                input.shape(),
                out.shape()
            )));
        }
        let trs = t * r * s;
        if trs > u16::MAX as usize {
            return Err(FuseError::unsupported(format!(
                "dim_shuffle over {trs} outer positions exceeds the grid"
            )));
        }
        if trs == 0 || c == 0 || k == 0 {
            return Ok(());
        }
        let divide = |nmax: usize, d: usize| {
            let nmax = u32::try_from(nmax).ok();
            let d = u32::try_from(d).ok();
            nmax.zip(d)
                .and_then(|(nmax, d)| magic_division(nmax, d))
                .ok_or_else(|| FuseError::unsupported(format!("no magic divisor for {d:?}")))
        };
        let (magic_rs, shift_rs) = divide(trs - 1, r * s)?;
        let (magic_s, shift_s) = divide(r * s - 1, s)?;

        let cached = self.kernel(&KernelKey::DimShuffle(input.dtype()))?;
        let tile = TRANSPOSE_TILE as usize;
        let config = LaunchConfig {
            grid: (
                grid_dim(k.div_ceil(tile))?,
                grid_dim(c.div_ceil(tile))?,
                grid_dim(trs)?,
            ),
            block: (TRANSPOSE_TILE, TRANSPOSE_BLOCK_ROWS, 1),
            shared_mem_bytes: 0,
        };
        let args = [
            KernelArg::Ptr(out.ptr()),
            KernelArg::Ptr(input.ptr()),
            int_arg(trs * k, "input plane")?,
            int_arg(r * s * k, "input plane")?,
            int_arg(s * k, "input plane")?,
            int_arg(k, "K")?,
            int_arg(trs * c, "output plane")?,
            int_arg(r * s * c, "output plane")?,
            int_arg(s * c, "output plane")?,
            int_arg(c, "C")?,
            int_arg(r * s, "RS")?,
            KernelArg::I32(magic_rs as i32),
            int_arg(shift_rs, "shift")?,
            int_arg(s, "S")?,
            KernelArg::I32(magic_s as i32),
            int_arg(shift_s, "shift")?,
        ];
        self.run(&cached, config, &args)
    }

    /// One compensated accumulation step:
    /// `y = add*add_scale - cmp*cmp_scale; t = sum + y; cmp = (t - sum) - y; sum = t`.
    ///
    /// The new sum rounds stochastically when `sum` is configured for it; the
    /// compensation term always rounds to nearest.
    pub fn compensated_sum(
        &self,
        rand_state: &RandState,
        sum: &DeviceTensor,
        cmp: &DeviceTensor,
        add: &DeviceTensor,
        cmp_scale: f32,
        add_scale: f32,
    ) -> FuseResult<()> {
        for t in [cmp, add] {
            if t.dtype() != sum.dtype() || t.shape() != sum.shape() || t.strides() != sum.strides()
            {
                return Err(FuseError::shape(
                    "compensated_sum operands must share dtype and layout",
                ));
            }
        }
        if sum.take().is_some() || cmp.take().is_some() || add.take().is_some() {
            return Err(FuseError::unsupported("compensated_sum does not gather"));
        }
        let ([rows, cols], [row_strd, col_strd]) = sum.view_2d().ok_or_else(|| {
            FuseError::unsupported(format!("compensated_sum over a rank-{} tensor", sum.rank()))
        })?;
        let (stochastic, mantissa_bits) = match sum.rounding() {
            Rounding::Stochastic { mantissa_bits } => (
                true,
                mantissa_bits.clamp(1, sum.dtype().max_mantissa_bits()),
            ),
            _ => (false, 0),
        };
        let cached = self.kernel(&KernelKey::CompensatedSum {
            dtype: sum.dtype(),
            stochastic,
        })?;
        let args = [
            KernelArg::Ptr(rand_state.ptr()),
            KernelArg::Ptr(sum.ptr()),
            KernelArg::Ptr(cmp.ptr()),
            KernelArg::Ptr(add.ptr()),
            KernelArg::F32(cmp_scale),
            KernelArg::F32(add_scale),
            int_arg(row_strd, "row stride")?,
            int_arg(col_strd, "column stride")?,
            int_arg(cols, "loop bound")?,
            int_arg(mantissa_bits, "mantissa bits")?,
        ];
        let config = LaunchConfig::linear(grid_dim(rows)?, COMPENSATED_SUM_THREADS);
        if cols == 0 {
            return Ok(());
        }
        self.run(&cached, config, &args)
    }
}

fn key_threads(key: &KernelKey) -> u32 {
    match key {
        KernelKey::Fused(signature) => signature.threads().unwrap_or(32),
        KernelKey::Transpose(_) | KernelKey::DimShuffle(_) => {
            TRANSPOSE_TILE * TRANSPOSE_BLOCK_ROWS
        }
        KernelKey::CompensatedSum { .. } => COMPENSATED_SUM_THREADS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::OpDesc;

    fn tensor(addr: u64, shape: &[usize]) -> DeviceTensor {
        DeviceTensor::new(DevicePtr(addr), DType::F32, shape.to_vec())
    }

    fn rand_state() -> RandState {
        RandState::from_ptr(DevicePtr(0x10))
    }

    #[test]
    fn flat_decomposition_prefers_multiples_of_32() {
        assert_eq!(fast_ew_dims(1024), [4, 256]);
        assert_eq!(fast_ew_dims(96), [1, 96]);
        assert_eq!(fast_ew_dims(7 * 224), [7, 224]);
        assert_eq!(fast_ew_dims(997), [997, 1]);
        assert_eq!(fast_ew_dims(300), [2, 150]);
    }

    #[test]
    fn broadcasting_follows_unit_extents() {
        assert_eq!(broadcast_shapes([3, 1], [1, 4]).unwrap(), [3, 4]);
        assert_eq!(broadcast_shapes([3, 4], [3, 4]).unwrap(), [3, 4]);
        assert!(matches!(
            broadcast_shapes([3, 4], [3, 5]),
            Err(FuseError::ShapeCompatibility { .. })
        ));
    }

    #[test]
    fn differing_reduction_axes_are_rejected() {
        let a = tensor(0x100, &[4, 5]);
        let c = tensor(0x200, &[1, 1]);
        let args = [
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::reduce(Op::Sum, 0),
            Arg::reduce(Op::Max, 1),
            Arg::assign(),
        ];
        assert!(matches!(
            Classification::scan(&args),
            Err(FuseError::ShapeCompatibility { .. })
        ));
        let missing = [Arg::Tensor(&c), Arg::Tensor(&a), Arg::op(Op::Sum), Arg::assign()];
        assert!(matches!(
            Classification::scan(&missing),
            Err(FuseError::Construction { .. })
        ));
    }

    #[test]
    fn flat_work_shares_slots_and_marshals_in_signature_order() {
        let a = tensor(0x100, &[8, 64]);
        let c = tensor(0x200, &[8, 64]);
        // C = 2 * A * A + 2
        let args = [
            Arg::Tensor(&c),
            Arg::Const(2.0),
            Arg::Tensor(&a),
            Arg::op(Op::Mul),
            Arg::Tensor(&a),
            Arg::op(Op::Mul),
            Arg::Const(2.0),
            Arg::op(Op::Add),
            Arg::assign(),
        ];
        let class = Classification::scan(&args).unwrap();
        assert!(!class.native());
        let call = marshal(&rand_state(), &args, &class, 1).unwrap();
        assert_eq!(call.max_shape, [2, 256]);
        assert_eq!(
            call.args,
            vec![
                KernelArg::Ptr(DevicePtr(0x10)),
                KernelArg::Ptr(DevicePtr(0x200)),
                KernelArg::I32(256),
                KernelArg::I32(1),
                KernelArg::F32(2.0),
                KernelArg::Ptr(DevicePtr(0x100)),
                KernelArg::I32(256),
                KernelArg::I32(1),
                KernelArg::I32(256),
            ]
        );
        let slots: Vec<usize> = call
            .signature
            .items()
            .iter()
            .filter_map(|item| match item {
                SigItem::Tensor { slot, .. } | SigItem::Const { slot } => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 2, 1]);
        assert_eq!(call.signature.threads(), Some(32));
    }

    #[test]
    fn reductions_zero_broadcast_strides_and_pick_threads() {
        let a = tensor(0x100, &[4, 2048]);
        let c = tensor(0x200, &[4, 1]);
        let args = [
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::reduce(Op::Sum, 1),
            Arg::assign(),
        ];
        let class = Classification::scan(&args).unwrap();
        let call = marshal(&rand_state(), &args, &class, 1).unwrap();
        assert_eq!(call.red_depth, 2048);
        assert_eq!(call.signature.threads(), Some(512));
        // output column stride is zeroed because its second axis has extent 1
        assert_eq!(call.args[3], KernelArg::I32(0));
        assert_eq!(call.max_shape, [4, 1]);
    }

    #[test]
    fn axis_zero_reverses_strides() {
        let a = tensor(0x100, &[4, 5]);
        let c = tensor(0x200, &[1, 5]);
        let args = [
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::reduce(Op::Sum, 0),
            Arg::assign(),
        ];
        let class = Classification::scan(&args).unwrap();
        let call = marshal(&rand_state(), &args, &class, 0).unwrap();
        // input: row stride (across blocks) is the column stride, loop stride the row stride
        assert_eq!(&call.args[4..8], &[
            KernelArg::Ptr(DevicePtr(0x100)),
            KernelArg::I32(1),
            KernelArg::I32(5),
            KernelArg::I32(4),
        ]);
        assert_eq!(call.max_shape, [1, 5]);
    }

    #[test]
    fn broadcast_output_is_rejected() {
        let a = tensor(0x100, &[3, 4]);
        let c = tensor(0x200, &[3, 1]);
        let args = [
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::op(Op::Exp),
            Arg::assign(),
        ];
        let class = Classification::scan(&args).unwrap();
        assert!(matches!(
            marshal(&rand_state(), &args, &class, 1),
            Err(FuseError::ShapeCompatibility { .. })
        ));
    }

    #[test]
    fn stochastic_assign_clamps_mantissa_bits() {
        let a = tensor(0x100, &[2, 64]);
        let c = DeviceTensor::new(DevicePtr(0x200), DType::F16, vec![2, 64])
            .with_rounding(Rounding::Stochastic { mantissa_bits: 23 });
        let args = [Arg::Tensor(&c), Arg::Tensor(&a), Arg::assign_rounded()];
        let class = Classification::scan(&args).unwrap();
        let call = marshal(&rand_state(), &args, &class, 1).unwrap();
        assert!(call.signature.stochastic());
        assert_eq!(call.args.last(), Some(&KernelArg::I32(10)));

        let plain = [Arg::Tensor(&c), Arg::Tensor(&a), Arg::assign()];
        let call = marshal(&rand_state(), &plain, &class, 1).unwrap();
        assert!(!call.signature.stochastic());
    }

    #[test]
    fn onehot_axis_follows_the_loop_axis() {
        let idx = DeviceTensor::new(DevicePtr(0x300), DType::Si32, vec![6]);
        let c = tensor(0x200, &[10, 6]);
        let args = [
            Arg::Tensor(&c),
            Arg::onehot(&idx, 0),
            Arg::assign(),
        ];
        let class = Classification::scan(&args).unwrap();
        let call = marshal(&rand_state(), &args, &class, 1).unwrap();
        assert!(call
            .signature
            .items()
            .contains(&SigItem::OneHot { id: 0, axis: 0 }));
        assert!(call.args.contains(&KernelArg::Ptr(DevicePtr(0x300))));

        let no_idx = [
            Arg::Tensor(&c),
            Arg::Op(OpDesc::new(Op::OneHot).with_axis(0)),
            Arg::assign(),
        ];
        assert!(Classification::scan(&no_idx).is_err());
    }

    #[test]
    fn malformed_streams_are_construction_errors() {
        let a = tensor(0x100, &[3, 4]);
        let c = tensor(0x200, &[3, 4]);
        let cases: Vec<Vec<Arg<'_>>> = vec![
            vec![Arg::Tensor(&c), Arg::Tensor(&a)],
            vec![Arg::Tensor(&c), Arg::op(Op::Add), Arg::assign()],
            vec![Arg::Const(1.0), Arg::Tensor(&c), Arg::assign()],
            vec![Arg::Tensor(&c), Arg::Tensor(&a), Arg::Tensor(&a), Arg::assign()],
        ];
        for args in cases {
            let class = Classification::scan(&args).unwrap();
            assert!(
                matches!(
                    marshal(&rand_state(), &args, &class, 1),
                    Err(FuseError::Construction { .. })
                ),
                "{args:?}"
            );
        }
    }
}
