//! Device helper functions emitted on demand ahead of a kernel body.

use crate::dtype::DType;

pub(crate) const FP16_TO_FP32: &str = r#"__device__ __forceinline__ float fp16_to_fp32(unsigned short val)
{
    float ret;
    asm("{\n\t"
        ".reg .f16 f16;\n\t"
        "mov.b16 f16, %1;\n\t"
        "cvt.f32.f16 %0, f16;\n\t"
        "}" : "=f"(ret) : "h"(val));
    return ret;
}
"#;

pub(crate) const URAND_GEN: &str = r#"__device__ __forceinline__ unsigned urand_gen(unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2)
{
    lfsr0 = ((lfsr0 & 0xfffffffe) << 12) ^ (((lfsr0 << 13) ^ lfsr0) >> 19);
    lfsr1 = ((lfsr1 & 0xfffffff8) <<  4) ^ (((lfsr1 << 2)  ^ lfsr1) >> 25);
    lfsr2 = ((lfsr2 & 0xfffffff0) << 11) ^ (((lfsr2 << 3)  ^ lfsr2) >> 11);
    return lfsr0 ^ lfsr1 ^ lfsr2;
}
"#;

pub(crate) const FRAND: &str = r#"__device__ __forceinline__ float frand(unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2)
{
    unsigned urand = urand_gen(lfsr0, lfsr1, lfsr2);
    float val;
    asm("cvt.rn.f32.u32 %0, %1;\n\t"
        "mul.f32 %0, %0, 0F2f800000;"
        : "=f"(val) : "r"(urand));
    return val;
}
"#;

const FP32_TO_FP32_RAND: &str = r#"__device__ __forceinline__ float fp32_to_fp32_rand(
    float val, unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2, float rand_scale, unsigned rand_mask)
{
    unsigned urand = urand_gen(lfsr0, lfsr1, lfsr2);
    float ret;
    asm("{\n\t"
        ".reg .f32 exponent, frand, result;\n\t"
        "and.b32 exponent, %1, 0xff800000;\n\t"
        "mul.f32 exponent, exponent, %2;\n\t"
        "cvt.rz.f32.u32 frand, %3;\n\t"
        "fma.rz.f32 result, exponent, frand, %1;\n\t"
        "and.b32 %0, result, %4;\n\t"
        "}" : "=f"(ret) : "f"(val), "f"(rand_scale), "r"(urand), "r"(rand_mask));
    return ret;
}
"#;

const FP32_TO_FP16_RAND: &str = r#"__device__ __forceinline__ unsigned short fp32_to_fp16_rand(
    float val, unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2, float rand_scale, unsigned rand_mask)
{
    unsigned urand = urand_gen(lfsr0, lfsr1, lfsr2);
    unsigned short half;
    asm("{\n\t"
        ".reg .f16 result16;\n\t"
        ".reg .f32 exponent, frand, result32;\n\t"
        "and.b32 exponent, %1, 0xff800000;\n\t"
        "mul.f32 exponent, exponent, %2;\n\t"
        "cvt.rz.f32.u32 frand, %3;\n\t"
        "fma.rz.f32 result32, exponent, frand, %1;\n\t"
        "and.b32 result32, result32, %4;\n\t"
        "cvt.rz.f16.f32 result16, result32;\n\t"
        "mov.b16 %0, result16;\n\t"
        "}" : "=h"(half) : "f"(val), "f"(rand_scale), "r"(urand), "r"(rand_mask));
    return half;
}
"#;

const FP32_TO_INT32_RAND: &str = r#"__device__ __forceinline__ int fp32_to_int32_rand(
    float val, unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2)
{
    unsigned urand = urand_gen(lfsr0, lfsr1, lfsr2);
    int ret;
    asm("{\n\t"
        ".reg .f32 frand, result32;\n\t"
        "cvt.rz.f32.u32 frand, %2;\n\t"
        "copysign.f32 frand, %1, frand;\n\t"
        "mul.rz.f32 frand, frand, 0F2f800000;\n\t"
        "add.rz.f32 result32, frand, %1;\n\t"
        "cvt.rzi.s32.f32 %0, result32;\n\t"
        "}" : "=r"(ret) : "f"(val), "r"(urand));
    return ret;
}
"#;

const FP32_TO_INT16_RAND: &str = r#"__device__ __forceinline__ short fp32_to_int16_rand(
    float val, unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2)
{
    unsigned urand = urand_gen(lfsr0, lfsr1, lfsr2);
    short ret;
    asm("{\n\t"
        ".reg .f32 frand, result32;\n\t"
        "cvt.rz.f32.u32 frand, %2;\n\t"
        "copysign.f32 frand, %1, frand;\n\t"
        "mul.rz.f32 frand, frand, 0F2f800000;\n\t"
        "add.rz.f32 result32, frand, %1;\n\t"
        "cvt.rzi.s16.f32 %0, result32;\n\t"
        "}" : "=h"(ret) : "f"(val), "r"(urand));
    return ret;
}
"#;

const FP32_TO_INT8_RAND: &str = r#"__device__ __forceinline__ signed char fp32_to_int8_rand(
    float val, unsigned& lfsr0, unsigned& lfsr1, unsigned& lfsr2)
{
    unsigned urand = urand_gen(lfsr0, lfsr1, lfsr2);
    int ret;
    asm("{\n\t"
        ".reg .f32 frand, result32;\n\t"
        "cvt.rz.f32.u32 frand, %2;\n\t"
        "copysign.f32 frand, %1, frand;\n\t"
        "mul.rz.f32 frand, frand, 0F2f800000;\n\t"
        "add.rz.f32 result32, frand, %1;\n\t"
        "cvt.rzi.s8.f32 %0, result32;\n\t"
        "}" : "=r"(ret) : "f"(val), "r"(urand));
    return (signed char)ret;
}
"#;

const FP32_TO_FP16: &str = r#"__device__ __forceinline__ unsigned short fp32_to_fp16(float val)
{
    unsigned short ret;
    asm("{\n\t"
        ".reg .f16 f16;\n\t"
        "cvt.rn.f16.f32 f16, %1;\n\t"
        "mov.b16 %0, f16;\n\t"
        "}" : "=h"(ret) : "f"(val));
    return ret;
}
"#;

const FP32_TO_INT32: &str = r#"__device__ __forceinline__ int fp32_to_int32(float val)
{
    int ret;
    asm("cvt.rni.s32.f32 %0, %1;" : "=r"(ret) : "f"(val));
    return ret;
}
"#;

const FP32_TO_UINT32: &str = r#"__device__ __forceinline__ unsigned fp32_to_uint32(float val)
{
    unsigned ret;
    asm("cvt.rni.u32.f32 %0, %1;" : "=r"(ret) : "f"(val));
    return ret;
}
"#;

const FP32_TO_INT16: &str = r#"__device__ __forceinline__ short fp32_to_int16(float val)
{
    short ret;
    asm("cvt.rni.s16.f32 %0, %1;" : "=h"(ret) : "f"(val));
    return ret;
}
"#;

const FP32_TO_UINT16: &str = r#"__device__ __forceinline__ unsigned short fp32_to_uint16(float val)
{
    unsigned short ret;
    asm("cvt.rni.u16.f32 %0, %1;" : "=h"(ret) : "f"(val));
    return ret;
}
"#;

const FP32_TO_INT8: &str = r#"__device__ __forceinline__ signed char fp32_to_int8(float val)
{
    int ret;
    asm("cvt.rni.s8.f32 %0, %1;" : "=r"(ret) : "f"(val));
    return (signed char)ret;
}
"#;

const FP32_TO_UINT8: &str = r#"__device__ __forceinline__ unsigned char fp32_to_uint8(float val)
{
    unsigned ret;
    asm("cvt.rni.u8.f32 %0, %1;" : "=r"(ret) : "f"(val));
    return (unsigned char)ret;
}
"#;

/// Narrowing conversion applied before a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreConversion {
    pub(crate) func: &'static str,
    pub(crate) helper: &'static str,
    /// Extra generator state arguments after the value.
    pub(crate) rand_args: &'static str,
}

/// Conversion for a store into `dtype`, or `None` for a plain f32 store.
///
/// Unsigned integers have no stochastic variant and always round to nearest.
pub(crate) fn store_conversion(dtype: DType, stochastic: bool) -> Option<StoreConversion> {
    const LFSR: &str = ", lfsr0, lfsr1, lfsr2";
    const LFSR_SCALED: &str = ", lfsr0, lfsr1, lfsr2, rand_scale, rand_mask";
    let conv = |func, helper, rand_args| StoreConversion {
        func,
        helper,
        rand_args,
    };
    match (dtype, stochastic) {
        (DType::F32, false) => None,
        (DType::F32, true) => Some(conv("fp32_to_fp32_rand", FP32_TO_FP32_RAND, LFSR_SCALED)),
        (DType::F16, false) => Some(conv("fp32_to_fp16", FP32_TO_FP16, "")),
        (DType::F16, true) => Some(conv("fp32_to_fp16_rand", FP32_TO_FP16_RAND, LFSR_SCALED)),
        (DType::Si32, false) => Some(conv("fp32_to_int32", FP32_TO_INT32, "")),
        (DType::Si32, true) => Some(conv("fp32_to_int32_rand", FP32_TO_INT32_RAND, LFSR)),
        (DType::Si16, false) => Some(conv("fp32_to_int16", FP32_TO_INT16, "")),
        (DType::Si16, true) => Some(conv("fp32_to_int16_rand", FP32_TO_INT16_RAND, LFSR)),
        (DType::Si8, false) => Some(conv("fp32_to_int8", FP32_TO_INT8, "")),
        (DType::Si8, true) => Some(conv("fp32_to_int8_rand", FP32_TO_INT8_RAND, LFSR)),
        (DType::Ui32, _) => Some(conv("fp32_to_uint32", FP32_TO_UINT32, "")),
        (DType::Ui16, _) => Some(conv("fp32_to_uint16", FP32_TO_UINT16, "")),
        (DType::Ui8, _) => Some(conv("fp32_to_uint8", FP32_TO_UINT8, "")),
    }
}

/// Tracks which helpers a kernel already pulled in.
#[derive(Default)]
pub(crate) struct HelperSet {
    emitted: Vec<&'static str>,
}

impl HelperSet {
    pub(crate) fn require(&mut self, helper: &'static str) {
        if !self.emitted.contains(&helper) {
            self.emitted.push(helper);
        }
    }

    pub(crate) fn render(&self) -> String {
        self.emitted.join("\n")
    }
}
