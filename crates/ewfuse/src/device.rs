use std::time::{Duration, Instant};

use crate::codegen::ParamKind;
use crate::error::FuseResult;
use crate::kernels::KernelSource;
use crate::tensor::DevicePtr;

/// One positional kernel launch argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    I32(i32),
    F32(f32),
}

impl KernelArg {
    pub fn kind(&self) -> ParamKind {
        match self {
            KernelArg::Ptr(_) => ParamKind::Ptr,
            KernelArg::I32(_) => ParamKind::Int,
            KernelArg::F32(_) => ParamKind::Float,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    pub fn linear(blocks: u32, threads: u32) -> Self {
        Self {
            grid: (blocks, 1, 1),
            block: (threads, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    pub fn with_shared(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn is_empty(&self) -> bool {
        let (x, y, z) = self.grid;
        x == 0 || y == 0 || z == 0
    }
}

/// Execution target for fused kernels.
///
/// A device compiles [`KernelSource`]s into its own kernel handles, launches
/// them with positional arguments and owns the memory the tensors point into.
/// Launches are ordered: a launch observes the effects of every earlier one.
pub trait Device: Send + Sync {
    type Kernel: Send + Sync;

    /// Human-readable identifier (`"ref-cpu"`, `"cuda"`).
    fn name(&self) -> &str;

    fn compile(&self, source: &KernelSource) -> FuseResult<Self::Kernel>;

    fn launch(
        &self,
        kernel: &Self::Kernel,
        config: LaunchConfig,
        args: &[KernelArg],
    ) -> FuseResult<()>;

    /// Runs `repeat` back-to-back launches and returns their total duration.
    fn time_launches(
        &self,
        kernel: &Self::Kernel,
        config: LaunchConfig,
        args: &[KernelArg],
        repeat: usize,
    ) -> FuseResult<Duration> {
        let start = Instant::now();
        for _ in 0..repeat {
            self.launch(kernel, config, args)?;
        }
        self.synchronize()?;
        Ok(start.elapsed())
    }

    /// Blocks until every issued launch finished.
    fn synchronize(&self) -> FuseResult<()> {
        Ok(())
    }

    /// Allocates `bytes` of zeroed memory.
    fn alloc(&self, bytes: usize) -> FuseResult<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> FuseResult<()>;

    fn upload(&self, dst: DevicePtr, bytes: &[u8]) -> FuseResult<()>;

    fn download(&self, src: DevicePtr, len: usize) -> FuseResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_kinds_match_their_variant() {
        assert_eq!(KernelArg::Ptr(DevicePtr(16)).kind(), ParamKind::Ptr);
        assert_eq!(KernelArg::I32(-1).kind(), ParamKind::Int);
        assert_eq!(KernelArg::F32(0.5).kind(), ParamKind::Float);
    }

    #[test]
    fn zero_sized_grids_are_empty() {
        assert!(LaunchConfig::linear(0, 32).is_empty());
        assert!(!LaunchConfig::linear(4, 32).with_shared(128).is_empty());
    }
}
