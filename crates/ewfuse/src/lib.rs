//! Compound elementwise kernel fusion.
//!
//! A whole expression such as `C = exp(A - max(A, 1)) * 2` is passed as a
//! postfix stream of [`Arg`]s. The engine splits it into stages (reductions,
//! scalar epilogues, the final store), generates a single device kernel for
//! it, caches the kernel by its instance-independent [`Signature`] and launches
//! it once per call.
//!
//! ```no_run
//! # fn demo<D: ewfuse::Device>(engine: &ewfuse::Engine<D>, rs: &ewfuse::RandState,
//! #         a: &ewfuse::DeviceTensor, c: &ewfuse::DeviceTensor) -> ewfuse::FuseResult<()> {
//! use ewfuse::{Arg, Op};
//! engine.evaluate(rs, &[
//!     Arg::Tensor(c),
//!     Arg::Tensor(a),
//!     Arg::Tensor(a),
//!     Arg::reduce(Op::Max, 1),
//!     Arg::op(Op::Sub),
//!     Arg::op(Op::Exp),
//!     Arg::assign(),
//! ])?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codegen;
pub mod device;
pub mod driver;
pub mod dtype;
pub mod env;
pub mod error;
pub mod expr;
pub mod kernels;
pub mod ops;
pub mod signature;
pub mod stages;
pub mod tensor;
pub mod tree;

pub use cache::{CacheStats, KernelCache};
pub use device::{Device, KernelArg, LaunchConfig};
pub use driver::Engine;
pub use dtype::DType;
pub use env::EngineConfig;
pub use error::{lock_named, FuseError, FuseResult};
pub use expr::{Arg, OpDesc};
pub use kernels::{KernelKey, KernelProgram, KernelSource};
pub use ops::Op;
pub use signature::{SigItem, Signature, TakeMode};
pub use tensor::{DevicePtr, DeviceTensor, RandState, Rounding, Take};
