//! Kernel identities and their rendered sources.
//!
//! Besides fused expressions the engine carries fixed-function kernels: a
//! tiled 2-D transpose, a 5-D dim shuffle (`CTRSK -> KTRSC`) and a compensated
//! (Kahan) accumulation step.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codegen::{self, KernelPlan, ParamKind, SourceWriter};
use crate::dtype::DType;
use crate::error::FuseResult;
use crate::signature::Signature;

/// Edge of the square tile staged through shared memory by the transpose and
/// dim shuffle kernels.
pub const TRANSPOSE_TILE: u32 = 32;
/// Rows of the tile each transpose thread block covers per pass.
pub const TRANSPOSE_BLOCK_ROWS: u32 = 8;
/// Threads per block of the compensated sum kernel.
pub const COMPENSATED_SUM_THREADS: u32 = 32;

/// Cache key of a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKey {
    Fused(Signature),
    Transpose(DType),
    DimShuffle(DType),
    CompensatedSum { dtype: DType, stochastic: bool },
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelKey::Fused(signature) => write!(f, "fused[{signature}]"),
            KernelKey::Transpose(dtype) => write!(f, "transpose[{dtype}]"),
            KernelKey::DimShuffle(dtype) => write!(f, "dim_shuffle[{dtype}]"),
            KernelKey::CompensatedSum { dtype, stochastic } => {
                let mode = if *stochastic { "rand" } else { "nearest" };
                write!(f, "compensated_sum[{dtype},{mode}]")
            }
        }
    }
}

/// Device-independent description of what a kernel computes.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelProgram {
    Fused(KernelPlan),
    /// Args: `out, in, rows, cols` where `rows x cols` is the input shape.
    Transpose { dtype: DType },
    /// Args: `out, in, trsk, rsk, sk, k, trsc, rsc, sc, c, rs, magic_rs, shift_rs,
    /// s, magic_s, shift_s`. Grid z walks the flattened `t, r, s` coordinate.
    DimShuffle { dtype: DType },
    /// Args: `rand_state, sum, cmp, add, cmp_scale, add_scale, row_strd, col_strd, n, mantissa_bits`.
    CompensatedSum { dtype: DType, stochastic: bool },
}

impl KernelProgram {
    pub fn param_kinds(&self) -> Vec<ParamKind> {
        use ParamKind::{Float, Int, Ptr};
        match self {
            KernelProgram::Fused(plan) => plan.param_kinds(),
            KernelProgram::Transpose { .. } => vec![Ptr, Ptr, Int, Int],
            KernelProgram::DimShuffle { .. } => {
                let mut kinds = vec![Ptr, Ptr];
                kinds.extend([Int; 14]);
                kinds
            }
            KernelProgram::CompensatedSum { .. } => {
                vec![Ptr, Ptr, Ptr, Ptr, Float, Float, Int, Int, Int, Int]
            }
        }
    }
}

/// Rendered CUDA source plus the program it was rendered from.
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub symbol: String,
    pub source: String,
    pub program: Arc<KernelProgram>,
}

impl KernelSource {
    pub fn build(key: &KernelKey) -> FuseResult<Self> {
        match key {
            KernelKey::Fused(signature) => {
                let plan = codegen::plan_fused(signature)?;
                Ok(Self {
                    symbol: plan.name.clone(),
                    source: codegen::render_fused(&plan),
                    program: Arc::new(KernelProgram::Fused(plan)),
                })
            }
            KernelKey::Transpose(dtype) => {
                let symbol = format!("transpose_{}", dtype.tag());
                Ok(Self {
                    source: render_transpose(&symbol, *dtype),
                    symbol,
                    program: Arc::new(KernelProgram::Transpose { dtype: *dtype }),
                })
            }
            KernelKey::DimShuffle(dtype) => {
                let symbol = format!("dim_shuffle_{}", dtype.tag());
                Ok(Self {
                    source: render_dim_shuffle(&symbol, *dtype),
                    symbol,
                    program: Arc::new(KernelProgram::DimShuffle { dtype: *dtype }),
                })
            }
            KernelKey::CompensatedSum { dtype, stochastic } => {
                let mode = if *stochastic { "rand" } else { "nearest" };
                let symbol = format!("compensated_sum_{}_{mode}", dtype.tag());
                Ok(Self {
                    source: render_compensated_sum(&symbol, *dtype, *stochastic),
                    symbol,
                    program: Arc::new(KernelProgram::CompensatedSum {
                        dtype: *dtype,
                        stochastic: *stochastic,
                    }),
                })
            }
        }
    }

    pub fn param_kinds(&self) -> Vec<ParamKind> {
        self.program.param_kinds()
    }
}

fn render_transpose(symbol: &str, dtype: DType) -> String {
    let ty = dtype.c_type();
    let tile = TRANSPOSE_TILE;
    let rows = TRANSPOSE_BLOCK_ROWS;
    let mut w = SourceWriter::default();
    w.line(format!("#define TILE {tile}"));
    w.line(format!("#define BLOCK_ROWS {rows}"));
    w.blank();
    w.line(format!(
        "extern \"C\" __global__ void {symbol}({ty}* out, const {ty}* in, int rows, int cols)"
    ));
    w.open("");
    w.line(format!("__shared__ {ty} tile[TILE][TILE + 1];"));
    w.line("int x = blockIdx.x * TILE + threadIdx.x;");
    w.line("int y = blockIdx.y * TILE + threadIdx.y;");
    w.open("for (int j = 0; j < TILE; j += BLOCK_ROWS)");
    w.line("if (x < cols && y + j < rows)");
    w.indented(|w| w.line("tile[threadIdx.y + j][threadIdx.x] = in[(y + j) * cols + x];"));
    w.close();
    w.line("__syncthreads();");
    w.line("x = blockIdx.y * TILE + threadIdx.x;");
    w.line("y = blockIdx.x * TILE + threadIdx.y;");
    w.open("for (int j = 0; j < TILE; j += BLOCK_ROWS)");
    w.line("if (x < rows && y + j < cols)");
    w.indented(|w| w.line("out[(y + j) * rows + x] = tile[threadIdx.x][threadIdx.y + j];"));
    w.close();
    w.close();
    w.finish()
}

/// Multiplier and shift that turn `n / d` into `(n * magic) >> shift` for every
/// `n <= nmax`. `None` when `d` is zero or the multiplier overflows 32 bits.
pub fn magic_division(nmax: u32, d: u32) -> Option<(u32, u32)> {
    if d == 0 {
        return None;
    }
    let d = u128::from(d);
    let nmax = u128::from(nmax).max(d);
    let nc = (nmax + 1) / d * d - 1;
    let nbits = 128 - nmax.leading_zeros();
    for shift in 0..=2 * nbits {
        let pow = 1u128 << shift;
        let rem = (pow - 1) % d;
        if pow > nc * (d - 1 - rem) {
            let magic = (pow + d - 1 - rem) / d;
            return u32::try_from(magic).ok().map(|magic| (magic, shift));
        }
    }
    None
}

fn render_dim_shuffle(symbol: &str, dtype: DType) -> String {
    let ty = dtype.c_type();
    let mut w = SourceWriter::default();
    w.line(format!("#define TILE {TRANSPOSE_TILE}"));
    w.line(format!("#define BLOCK_ROWS {TRANSPOSE_BLOCK_ROWS}"));
    w.blank();
    w.line("__device__ __forceinline__ int magic_div(int n, int magic, int shift)");
    w.open("");
    w.line("return (int)(((unsigned long long)(unsigned)magic * (unsigned)n) >> shift);");
    w.close();
    w.blank();
    w.line(format!("extern \"C\" __global__ void {symbol}("));
    w.indented(|w| {
        w.line(format!("{ty}* out, const {ty}* in,"));
        w.line("int TRSK, int RSK, int SK, int K,");
        w.line("int TRSC, int RSC, int SC, int C,");
        w.line("int RS, int magic_RS, int shift_RS,");
        w.line("int S, int magic_S, int shift_S)");
    });
    w.open("");
    w.line(format!("__shared__ {ty} tile[TILE][TILE + 1];"));
    w.line("const int tx = threadIdx.x;");
    w.line("const int ty = threadIdx.y;");
    w.line("const int trs = blockIdx.z;");
    w.line("const int t = magic_div(trs, magic_RS, shift_RS);");
    w.line("const int rs = trs - t * RS;");
    w.line("const int r = magic_div(rs, magic_S, shift_S);");
    w.line("const int s = rs - r * S;");
    w.line("int k = blockIdx.x * TILE + tx;");
    w.line("int c = blockIdx.y * TILE + ty;");
    w.open("for (int j = 0; j < TILE; j += BLOCK_ROWS)");
    w.line("if (c + j < C && k < K)");
    w.indented(|w| {
        w.line("tile[ty + j][tx] = in[(c + j) * TRSK + t * RSK + r * SK + s * K + k];")
    });
    w.close();
    w.line("__syncthreads();");
    w.line("k = blockIdx.x * TILE + ty;");
    w.line("c = blockIdx.y * TILE + tx;");
    w.open("for (int i = 0; i < TILE; i += BLOCK_ROWS)");
    w.line("if (k + i < K && c < C)");
    w.indented(|w| {
        w.line("out[(k + i) * TRSC + t * RSC + r * SC + s * C + c] = tile[tx][ty + i];")
    });
    w.close();
    w.close();
    w.finish()
}

fn render_compensated_sum(symbol: &str, dtype: DType, stochastic: bool) -> String {
    let plan = codegen::aux_store_plan(dtype, stochastic);
    let ty = dtype.c_type();
    let cvt = dtype.load_conversion();
    let mut w = SourceWriter::default();
    w.line("#include <float.h>");
    w.blank();
    if !plan.helpers.is_empty() {
        w.raw(&plan.helpers);
        w.blank();
    }
    w.line(format!("#define THREADS {COMPENSATED_SUM_THREADS}"));
    w.blank();
    w.line(format!("extern \"C\" __global__ void {symbol}("));
    w.indented(|w| {
        w.line("unsigned* rand_state,");
        w.line(format!("{ty}* a_sum,"));
        w.line(format!("{ty}* a_cmp,"));
        w.line(format!("const {ty}* a_add,"));
        w.line("float cmp_scale,");
        w.line("float add_scale,");
        w.line("int row_strd,");
        w.line("int col_strd,");
        w.line("int n,");
        w.line("int mantissa_bits)");
    });
    w.open("");
    w.line("const int tid = threadIdx.x;");
    w.line("const int bid = blockIdx.x;");
    if stochastic {
        w.line("unsigned lfsr0, lfsr1, lfsr2;");
        w.line("const unsigned idx = bid * THREADS + tid;");
        w.line("rand_state += idx % (2048 * 32);");
        w.line("lfsr0 = *rand_state;");
        w.line("asm volatile(\"mov.b32 %0, %%clock;\" : \"=r\"(lfsr1));");
        w.line("asm volatile(\"mov.b32 %0, %%globaltimer_lo;\" : \"=r\"(lfsr2));");
        w.line("lfsr1 ^= (idx << 3) ^ (idx << 7);");
        w.line("lfsr2 ^= (idx << 17) ^ (idx << 23);");
        w.line("const float rand_scale = __int_as_float((127 - 32 - mantissa_bits) << 23);");
        w.line("const unsigned rand_mask = 0xffffffffu << (23 - mantissa_bits);");
    }
    w.line("const int offset = bid * row_strd + tid * col_strd;");
    w.line("const int inc = THREADS * col_strd;");
    w.line("a_sum += offset;");
    w.line("a_cmp += offset;");
    w.line("a_add += offset;");
    w.open("for (int i = tid; i < n; i += THREADS)");
    w.line(format!("float sum = {cvt}(*a_sum);"));
    w.line(format!("float cmp = {cvt}(*a_cmp);"));
    w.line(format!("float add = {cvt}(__ldg(a_add));"));
    w.line("float y = add * add_scale - cmp * cmp_scale;");
    w.line("float t = sum + y;");
    w.line(format!("const {ty} t_out = {};", plan.store_sum.replace("{v}", "t")));
    w.line("*a_sum = t_out;");
    w.line(format!(
        "*a_cmp = {};",
        plan.store_cmp
            .replace("{v}", &format!("({cvt}(t_out) - sum) - y"))
    ));
    w.line("a_sum += inc;");
    w.line("a_cmp += inc;");
    w.line("a_add += inc;");
    w.close();
    if stochastic {
        w.line("*rand_state = lfsr0 ^ lfsr1 ^ lfsr2;");
    }
    w.close();
    w.finish()
}
