use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::ops::Op;

/// How a tensor's gather index is applied inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TakeMode {
    /// Plain strided access.
    None,
    /// The index picks the block's row: `base + take[bid] * row_strd`.
    Block,
    /// The index picks the element inside the loop: `base + take[i] * col_strd`.
    Loop,
}

/// One instance-independent token of a kernel signature.
///
/// Pointers, strides, constants and loop bounds never appear here; they are
/// passed as launch arguments so that structurally equal expressions share a
/// kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigItem {
    Tensor {
        slot: usize,
        dtype: DType,
        take: TakeMode,
    },
    Const {
        slot: usize,
    },
    Op {
        op: Op,
        id: u32,
    },
    OneHot {
        id: u32,
        axis: usize,
    },
    Assign {
        id: u32,
        stochastic: bool,
        threads: u32,
    },
}

impl SigItem {
    pub fn op(&self) -> Option<Op> {
        match self {
            SigItem::Op { op, .. } => Some(*op),
            SigItem::OneHot { .. } => Some(Op::OneHot),
            SigItem::Assign { .. } => Some(Op::Assign),
            SigItem::Tensor { .. } | SigItem::Const { .. } => None,
        }
    }

    pub fn op_id(&self) -> Option<u32> {
        match self {
            SigItem::Op { id, .. } | SigItem::OneHot { id, .. } | SigItem::Assign { id, .. } => {
                Some(*id)
            }
            SigItem::Tensor { .. } | SigItem::Const { .. } => None,
        }
    }
}

/// Postfix signature of a fused kernel; the kernel cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<SigItem>);

impl Signature {
    pub fn new(items: Vec<SigItem>) -> Self {
        Self(items)
    }

    pub fn items(&self) -> &[SigItem] {
        &self.0
    }

    /// Threads per block, carried by the terminal assign.
    pub fn threads(&self) -> Option<u32> {
        self.0.iter().rev().find_map(|item| match item {
            SigItem::Assign { threads, .. } => Some(*threads),
            _ => None,
        })
    }

    pub fn stochastic(&self) -> bool {
        self.0
            .iter()
            .any(|item| matches!(item, SigItem::Assign { stochastic: true, .. }))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for item in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match item {
                SigItem::Tensor { slot, dtype, take } => match take {
                    TakeMode::None => write!(f, "a{slot}:{dtype}")?,
                    TakeMode::Block => write!(f, "a{slot}:{dtype}[take_b]")?,
                    TakeMode::Loop => write!(f, "a{slot}:{dtype}[take_i]")?,
                },
                SigItem::Const { slot } => write!(f, "c{slot}")?,
                SigItem::Op { op, .. } => write!(f, "{op}")?,
                SigItem::OneHot { axis, .. } => write!(f, "onehot{axis}")?,
                SigItem::Assign {
                    stochastic,
                    threads,
                    ..
                } => {
                    let mode = if *stochastic { "rand" } else { "nearest" };
                    write!(f, "assign[{mode},{threads}]")?
                }
            }
        }
        Ok(())
    }
}
