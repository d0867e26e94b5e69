//! Host reference device for ewfuse.
//!
//! `HostDevice` keeps every allocation in process memory and interprets the
//! [`KernelProgram`] attached to each compiled source, so fused expressions can
//! be checked numerically without a GPU.

mod interpreter;
mod memory;
mod rounding;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ewfuse::codegen::check_args;
use ewfuse::{
    lock_named, Device, DevicePtr, FuseResult, KernelArg, KernelProgram, KernelSource,
    LaunchConfig,
};

use crate::memory::Memory;

/// Compiled handle: the symbol for diagnostics plus the program to interpret.
#[derive(Debug, Clone)]
pub struct HostKernel {
    pub symbol: String,
    program: Arc<KernelProgram>,
}

impl HostKernel {
    pub fn program(&self) -> &KernelProgram {
        &self.program
    }
}

#[derive(Default)]
pub struct HostDevice {
    memory: Mutex<Memory>,
    launches: AtomicU64,
    compiles: AtomicU64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of kernels compiled so far; the cache should keep this at one per structure.
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }
}

impl Device for HostDevice {
    type Kernel = HostKernel;

    fn name(&self) -> &str {
        "ref-cpu"
    }

    fn compile(&self, source: &KernelSource) -> FuseResult<Self::Kernel> {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "ref-cpu: accepted {} ({} source bytes)",
            source.symbol,
            source.source.len()
        );
        Ok(HostKernel {
            symbol: source.symbol.clone(),
            program: Arc::clone(&source.program),
        })
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        config: LaunchConfig,
        args: &[KernelArg],
    ) -> FuseResult<()> {
        check_args(&kernel.program.param_kinds(), args)?;
        let launch = self.launches.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "ref-cpu: launch {} grid={:?} block={:?}",
            kernel.symbol,
            config.grid,
            config.block
        );
        if config.is_empty() {
            return Ok(());
        }
        let mut memory = lock_named(&self.memory, "ref-cpu memory")?;
        match kernel.program.as_ref() {
            KernelProgram::Fused(plan) => {
                interpreter::run_fused(&mut memory, plan, config, args, launch)
            }
            KernelProgram::Transpose { dtype } => {
                interpreter::run_transpose(&mut memory, *dtype, args)
            }
            KernelProgram::DimShuffle { dtype } => {
                interpreter::run_dim_shuffle(&mut memory, *dtype, config, args)
            }
            KernelProgram::CompensatedSum { dtype, stochastic } => {
                interpreter::run_compensated_sum(
                    &mut memory,
                    *dtype,
                    *stochastic,
                    config,
                    args,
                    launch,
                )
            }
        }
    }

    fn alloc(&self, bytes: usize) -> FuseResult<DevicePtr> {
        Ok(lock_named(&self.memory, "ref-cpu memory")?.alloc(bytes))
    }

    fn free(&self, ptr: DevicePtr) -> FuseResult<()> {
        lock_named(&self.memory, "ref-cpu memory")?.free(ptr)
    }

    fn upload(&self, dst: DevicePtr, bytes: &[u8]) -> FuseResult<()> {
        lock_named(&self.memory, "ref-cpu memory")?.write(dst.0, bytes)
    }

    fn download(&self, src: DevicePtr, len: usize) -> FuseResult<Vec<u8>> {
        Ok(lock_named(&self.memory, "ref-cpu memory")?
            .read(src.0, len)?
            .to_vec())
    }
}
