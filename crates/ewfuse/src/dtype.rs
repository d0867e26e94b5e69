use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage element types the fused kernels can load from and store to.
///
/// All arithmetic happens in 32-bit float registers; the dtype only decides how
/// values are widened on load and narrowed on store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    Si32,
    Ui32,
    Si16,
    Ui16,
    Si8,
    Ui8,
}

impl DType {
    pub const ALL: [DType; 8] = [
        DType::F32,
        DType::F16,
        DType::Si32,
        DType::Ui32,
        DType::Si16,
        DType::Ui16,
        DType::Si8,
        DType::Ui8,
    ];

    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::Si32 | DType::Ui32 => 4,
            DType::F16 | DType::Si16 | DType::Ui16 => 2,
            DType::Si8 | DType::Ui8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, DType::Ui32 | DType::Ui16 | DType::Ui8)
    }

    /// Short tag used in kernel names and cache file names (`f4`, `f2`, `i4`, ...).
    pub fn tag(self) -> &'static str {
        match self {
            DType::F32 => "f4",
            DType::F16 => "f2",
            DType::Si32 => "i4",
            DType::Ui32 => "u4",
            DType::Si16 => "i2",
            DType::Ui16 => "u2",
            DType::Si8 => "i1",
            DType::Ui8 => "u1",
        }
    }

    /// Device storage type; f16 is moved around as raw bits.
    pub fn c_type(self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F16 => "unsigned short",
            DType::Si32 => "int",
            DType::Ui32 => "unsigned int",
            DType::Si16 => "short",
            DType::Ui16 => "unsigned short",
            DType::Si8 => "signed char",
            DType::Ui8 => "unsigned char",
        }
    }

    /// Prefix applied to a raw load to widen it into a float register.
    pub(crate) fn load_conversion(self) -> &'static str {
        match self {
            DType::F32 => "",
            DType::F16 => "fp16_to_fp32",
            _ => "(float)",
        }
    }

    /// Largest mantissa width stochastic rounding may keep for this dtype.
    pub fn max_mantissa_bits(self) -> u32 {
        match self {
            DType::F16 => 10,
            _ => 15,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
