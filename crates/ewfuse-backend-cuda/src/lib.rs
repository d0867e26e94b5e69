//! CUDA device for ewfuse.
//!
//! Kernel sources are compiled to PTX with `nvcc` (see [`NvccCompiler`]),
//! loaded through the driver API and launched on the default stream.
//!
//! Environment:
//! - `EWFUSE_NVCC`: compiler binary, defaults to `$CUDA_HOME/bin/nvcc` or `nvcc`
//! - `EWFUSE_CUDA_ARCH`: target architecture, defaults to the device's own (e.g. `sm_86`)
//! - `EWFUSE_CACHE_DIR`: PTX disk cache, defaults to `.cache/ewfuse-cuda`

pub mod compiler;
pub mod driver;

use std::sync::Arc;
use std::time::Duration;

use ewfuse::codegen::{check_args, ParamKind};
use ewfuse::{Device, DevicePtr, FuseResult, KernelArg, KernelSource, LaunchConfig};

pub use compiler::{CompiledKernel, NvccCompiler};
pub use driver::{CudaDriver, CudaFunction, KernelParams, LaunchLimits};

pub struct CudaKernel {
    pub symbol: String,
    function: CudaFunction,
    params: Vec<ParamKind>,
}

pub struct CudaDevice {
    driver: Arc<CudaDriver>,
    compiler: NvccCompiler,
}

impl CudaDevice {
    pub fn is_available() -> bool {
        driver::is_available()
    }

    pub fn new() -> FuseResult<Self> {
        let driver = driver::driver()?;
        let compiler = NvccCompiler::for_arch(driver.limits().arch());
        Ok(Self { driver, compiler })
    }

    pub fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }
}

impl Device for CudaDevice {
    type Kernel = CudaKernel;

    fn name(&self) -> &str {
        "cuda"
    }

    fn compile(&self, source: &KernelSource) -> FuseResult<Self::Kernel> {
        let compiled = self.compiler.compile(source)?;
        let function = self.driver.load_function(&compiled.ptx, &compiled.symbol)?;
        log::debug!(
            "cuda: loaded {} (fingerprint {:016x})",
            compiled.symbol,
            compiled.fingerprint
        );
        Ok(CudaKernel {
            symbol: source.symbol.clone(),
            function,
            params: source.param_kinds(),
        })
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        config: LaunchConfig,
        args: &[KernelArg],
    ) -> FuseResult<()> {
        check_args(&kernel.params, args)?;
        self.driver.launch(&kernel.function, config, args)
    }

    fn time_launches(
        &self,
        kernel: &Self::Kernel,
        config: LaunchConfig,
        args: &[KernelArg],
        repeat: usize,
    ) -> FuseResult<Duration> {
        self.driver.time(|| {
            for _ in 0..repeat {
                self.launch(kernel, config, args)?;
            }
            Ok(())
        })
    }

    fn synchronize(&self) -> FuseResult<()> {
        self.driver.synchronize()
    }

    fn alloc(&self, bytes: usize) -> FuseResult<DevicePtr> {
        self.driver.alloc_zeroed(bytes)
    }

    fn free(&self, ptr: DevicePtr) -> FuseResult<()> {
        self.driver.free(ptr)
    }

    fn upload(&self, dst: DevicePtr, bytes: &[u8]) -> FuseResult<()> {
        self.driver.upload(dst, bytes)
    }

    fn download(&self, src: DevicePtr, len: usize) -> FuseResult<Vec<u8>> {
        self.driver.download(src, len)
    }
}
