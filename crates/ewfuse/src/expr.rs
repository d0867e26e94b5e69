//! Postfix tokens accepted by [`crate::Engine::evaluate`].
//!
//! `C = 2.5 * A * B + 1` reads as
//! `[C, 2.5, A, mul, B, mul, 1, add, assign]`: the first tensor is the output
//! and the stream always ends with `assign`.

use crate::error::FuseResult;
use crate::ops::Op;
use crate::tensor::DeviceTensor;

/// Operation token with the optional metadata some ops require.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpDesc<'a> {
    pub op: Op,
    /// Reduction axis, or the hot axis for `onehot`.
    pub axis: Option<usize>,
    /// Index tensor consumed by `onehot`.
    pub idx: Option<&'a DeviceTensor>,
    /// For `assign`: honour the output's stochastic rounding mode.
    pub round: bool,
}

impl<'a> OpDesc<'a> {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            axis: None,
            idx: None,
            round: false,
        }
    }

    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = Some(axis);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Tensor(&'a DeviceTensor),
    Const(f32),
    Op(OpDesc<'a>),
}

impl<'a> Arg<'a> {
    pub fn op(op: Op) -> Self {
        Arg::Op(OpDesc::new(op))
    }

    /// Parses an operation by name (`"add"`, `"sum"`, ...).
    pub fn named(name: &str) -> FuseResult<Self> {
        Ok(Arg::op(name.parse()?))
    }

    pub fn reduce(op: Op, axis: usize) -> Self {
        Arg::Op(OpDesc::new(op).with_axis(axis))
    }

    pub fn assign() -> Self {
        Arg::op(Op::Assign)
    }

    /// Terminal assign that applies the output's configured rounding.
    pub fn assign_rounded() -> Self {
        Arg::Op(OpDesc {
            round: true,
            ..OpDesc::new(Op::Assign)
        })
    }

    pub fn onehot(idx: &'a DeviceTensor, axis: usize) -> Self {
        Arg::Op(OpDesc {
            idx: Some(idx),
            ..OpDesc::new(Op::OneHot).with_axis(axis)
        })
    }
}

impl<'a> From<&'a DeviceTensor> for Arg<'a> {
    fn from(tensor: &'a DeviceTensor) -> Self {
        Arg::Tensor(tensor)
    }
}

impl From<f32> for Arg<'_> {
    fn from(value: f32) -> Self {
        Arg::Const(value)
    }
}

impl From<Op> for Arg<'_> {
    fn from(op: Op) -> Self {
        Arg::op(op)
    }
}
