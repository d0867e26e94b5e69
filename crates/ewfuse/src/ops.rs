use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FuseError;

/// Every operation a postfix expression may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minimum,
    Maximum,
    Pow,
    Finite,
    Neg,
    Abs,
    Sgn,
    Sqrt,
    Sqr,
    Exp,
    Log,
    Exp2,
    Log2,
    Sig,
    Sig2,
    Tanh,
    Tanh2,
    Rand,
    OneHot,
    Sum,
    Max,
    Min,
    ArgMax,
    ArgMin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Nullary,
    Unary,
    Binary,
    Reduction,
    Assign,
}

impl Op {
    pub const ALL: [Op; 35] = [
        Op::Assign,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Eq,
        Op::Ne,
        Op::Lt,
        Op::Le,
        Op::Gt,
        Op::Ge,
        Op::Minimum,
        Op::Maximum,
        Op::Pow,
        Op::Finite,
        Op::Neg,
        Op::Abs,
        Op::Sgn,
        Op::Sqrt,
        Op::Sqr,
        Op::Exp,
        Op::Log,
        Op::Exp2,
        Op::Log2,
        Op::Sig,
        Op::Sig2,
        Op::Tanh,
        Op::Tanh2,
        Op::Rand,
        Op::OneHot,
        Op::Sum,
        Op::Max,
        Op::Min,
        Op::ArgMax,
        Op::ArgMin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::Assign => "assign",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Lt => "lt",
            Op::Le => "le",
            Op::Gt => "gt",
            Op::Ge => "ge",
            Op::Minimum => "minimum",
            Op::Maximum => "maximum",
            Op::Pow => "pow",
            Op::Finite => "finite",
            Op::Neg => "neg",
            Op::Abs => "abs",
            Op::Sgn => "sgn",
            Op::Sqrt => "sqrt",
            Op::Sqr => "sqr",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Exp2 => "exp2",
            Op::Log2 => "log2",
            Op::Sig => "sig",
            Op::Sig2 => "sig2",
            Op::Tanh => "tanh",
            Op::Tanh2 => "tanh2",
            Op::Rand => "rand",
            Op::OneHot => "onehot",
            Op::Sum => "sum",
            Op::Max => "max",
            Op::Min => "min",
            Op::ArgMax => "argmax",
            Op::ArgMin => "argmin",
        }
    }

    pub fn class(self) -> OpClass {
        match self {
            Op::Assign => OpClass::Assign,
            Op::Rand | Op::OneHot => OpClass::Nullary,
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::Minimum
            | Op::Maximum
            | Op::Pow => OpClass::Binary,
            Op::Sum | Op::Max | Op::Min | Op::ArgMax | Op::ArgMin => OpClass::Reduction,
            _ => OpClass::Unary,
        }
    }

    /// Operands popped from the postfix stack.
    pub fn arity(self) -> usize {
        match self.class() {
            OpClass::Nullary => 0,
            OpClass::Unary | OpClass::Reduction => 1,
            OpClass::Binary | OpClass::Assign => 2,
        }
    }

    pub fn is_reduction(self) -> bool {
        self.class() == OpClass::Reduction
    }

    /// Reductions whose result is an index rather than a value.
    pub fn is_arg_reduction(self) -> bool {
        matches!(self, Op::ArgMax | Op::ArgMin)
    }

    /// Evaluates a unary or binary op the way the device templates do.
    ///
    /// Host backends use this to interpret kernel plans; `rhs` is ignored for
    /// unary ops.
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            Op::Add => lhs + rhs,
            Op::Sub => lhs - rhs,
            Op::Mul => lhs * rhs,
            Op::Div => lhs / rhs,
            Op::Eq => flag(lhs == rhs),
            Op::Ne => flag(lhs != rhs),
            Op::Lt => flag(lhs < rhs),
            Op::Le => flag(lhs <= rhs),
            Op::Gt => flag(lhs > rhs),
            Op::Ge => flag(lhs >= rhs),
            Op::Minimum => lhs.min(rhs),
            Op::Maximum => lhs.max(rhs),
            Op::Pow => lhs.powf(rhs),
            Op::Finite => flag(lhs.is_finite()),
            Op::Neg => -lhs,
            Op::Abs => lhs.abs(),
            Op::Sgn => 1.0f32.copysign(lhs),
            Op::Sqrt => lhs.sqrt(),
            Op::Sqr => lhs * lhs,
            Op::Exp => lhs.exp(),
            Op::Log => lhs.ln(),
            Op::Exp2 => lhs.exp2(),
            Op::Log2 => lhs.log2(),
            Op::Sig => 1.0 / (1.0 + (-lhs).exp()),
            Op::Sig2 => 1.0 / (1.0 + (-lhs).exp2()),
            Op::Tanh => lhs.tanh(),
            Op::Tanh2 => ((2.0 * lhs).exp2() - 1.0) / ((2.0 * lhs).exp2() + 1.0),
            Op::Assign
            | Op::Rand
            | Op::OneHot
            | Op::Sum
            | Op::Max
            | Op::Min
            | Op::ArgMax
            | Op::ArgMin => lhs,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Op {
    type Err = FuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Op::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or_else(|| FuseError::construction(format!("{s} is not a valid operation")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for op in Op::ALL {
            assert_eq!(op.name().parse::<Op>().unwrap(), op);
        }
    }

    #[test]
    fn unknown_name_is_a_construction_error() {
        let err = "softmax".parse::<Op>().unwrap_err();
        assert!(matches!(err, FuseError::Construction { .. }));
    }

    #[test]
    fn arities_follow_op_classes() {
        assert_eq!(Op::Rand.arity(), 0);
        assert_eq!(Op::OneHot.arity(), 0);
        assert_eq!(Op::Tanh.arity(), 1);
        assert_eq!(Op::ArgMin.arity(), 1);
        assert_eq!(Op::Pow.arity(), 2);
        assert_eq!(Op::Assign.arity(), 2);
        assert!(Op::ArgMax.is_arg_reduction());
        assert!(!Op::Max.is_arg_reduction());
    }

    #[test]
    fn host_semantics_match_device_templates() {
        assert_eq!(Op::Sgn.apply(-0.5, 0.0), -1.0);
        assert_eq!(Op::Lt.apply(1.0, 2.0), 1.0);
        assert_eq!(Op::Finite.apply(f32::INFINITY, 0.0), 0.0);
        assert!((Op::Tanh2.apply(0.5, 0.0) - (0.5f32 * std::f32::consts::LN_2).tanh()).abs() < 1e-6);
    }
}
