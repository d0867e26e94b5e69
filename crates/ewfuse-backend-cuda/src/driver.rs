//! Dynamically loaded CUDA driver API.
//!
//! Only the entry points the engine needs are resolved: one context on
//! device 0, linear memory, PTX modules, launches on the default stream and
//! event timing. Launch geometry is checked against the device limits before
//! the driver sees it so oversized grids surface as shape errors.

use std::ffi::{c_char, c_void, CString};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ewfuse::{DevicePtr, FuseError, FuseResult, KernelArg, LaunchConfig};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;
type CUevent = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;

const ATTR_MAX_THREADS_PER_BLOCK: i32 = 1;
const ATTR_MAX_BLOCK_DIM_X: i32 = 2;
const ATTR_MAX_GRID_DIM_X: i32 = 5;
const ATTR_MAX_SHARED_MEMORY_PER_BLOCK: i32 = 8;
const ATTR_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const ATTR_COMPUTE_CAPABILITY_MINOR: i32 = 76;

/// Declares the function table and resolves every symbol in one pass.
macro_rules! driver_api {
    ($($field:ident = $symbol:literal ($($ty:ty),*);)*) => {
        struct DriverFns {
            $($field: unsafe extern "C" fn($($ty),*) -> CUresult,)*
        }

        impl DriverFns {
            fn load(lib: &Library) -> FuseResult<Self> {
                Ok(Self {
                    $($field: load_symbol(lib, concat!($symbol, "\0").as_bytes())?,)*
                })
            }
        }
    };
}

driver_api! {
    init = "cuInit" (u32);
    device_get = "cuDeviceGet" (*mut CUdevice, i32);
    device_get_attribute = "cuDeviceGetAttribute" (*mut i32, i32, CUdevice);
    ctx_create = "cuCtxCreate_v2" (*mut CUcontext, u32, CUdevice);
    ctx_destroy = "cuCtxDestroy_v2" (CUcontext);
    ctx_set_current = "cuCtxSetCurrent" (CUcontext);
    ctx_synchronize = "cuCtxSynchronize" ();
    mem_alloc = "cuMemAlloc_v2" (*mut CUdeviceptr, usize);
    mem_free = "cuMemFree_v2" (CUdeviceptr);
    memcpy_htod = "cuMemcpyHtoD_v2" (CUdeviceptr, *const c_void, usize);
    memcpy_dtoh = "cuMemcpyDtoH_v2" (*mut c_void, CUdeviceptr, usize);
    memset_d8 = "cuMemsetD8_v2" (CUdeviceptr, u8, usize);
    module_load_data = "cuModuleLoadDataEx" (*mut CUmodule, *const c_void, u32, *mut u32, *mut *mut c_void);
    module_unload = "cuModuleUnload" (CUmodule);
    module_get_function = "cuModuleGetFunction" (*mut CUfunction, CUmodule, *const c_char);
    launch_kernel = "cuLaunchKernel" (CUfunction, u32, u32, u32, u32, u32, u32, u32, CUstream, *mut *mut c_void, *mut *mut c_void);
    event_create = "cuEventCreate" (*mut CUevent, u32);
    event_record = "cuEventRecord" (CUevent, CUstream);
    event_synchronize = "cuEventSynchronize" (CUevent);
    event_elapsed_time = "cuEventElapsedTime" (*mut f32, CUevent, CUevent);
    event_destroy = "cuEventDestroy_v2" (CUevent);
}

/// Launch geometry and code generation target of the active device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchLimits {
    pub max_threads_per_block: u32,
    pub max_block: [u32; 3],
    pub max_grid: [u32; 3],
    pub max_shared_bytes: u32,
    pub compute_capability: (u32, u32),
}

impl LaunchLimits {
    /// `nvcc` architecture matching the device, e.g. `sm_86`.
    pub fn arch(&self) -> String {
        let (major, minor) = self.compute_capability;
        format!("sm_{major}{minor}")
    }

    pub fn check(&self, symbol: &str, config: &LaunchConfig) -> FuseResult<()> {
        let grid = [config.grid.0, config.grid.1, config.grid.2];
        let block = [config.block.0, config.block.1, config.block.2];
        let threads: u64 = block.iter().map(|&b| u64::from(b)).product();
        if threads > u64::from(self.max_threads_per_block) {
            return Err(FuseError::unsupported(format!(
                "{symbol}: {threads} threads per block exceeds {}",
                self.max_threads_per_block
            )));
        }
        for (axis, name) in ["x", "y", "z"].iter().enumerate() {
            if block[axis] > self.max_block[axis] {
                return Err(FuseError::unsupported(format!(
                    "{symbol}: block.{name}={} exceeds {}",
                    block[axis], self.max_block[axis]
                )));
            }
            if grid[axis] > self.max_grid[axis] {
                return Err(FuseError::unsupported(format!(
                    "{symbol}: grid.{name}={} exceeds {}",
                    grid[axis], self.max_grid[axis]
                )));
            }
        }
        if config.shared_mem_bytes > self.max_shared_bytes {
            return Err(FuseError::unsupported(format!(
                "{symbol}: {} bytes of shared memory exceeds {}",
                config.shared_mem_bytes, self.max_shared_bytes
            )));
        }
        Ok(())
    }
}

/// Kernel arguments laid out for `cuLaunchKernel`: one little-endian 8-byte
/// slot per parameter, 4-byte values in the low half.
pub struct KernelParams {
    words: Vec<[u8; 8]>,
}

impl KernelParams {
    pub fn pack(args: &[KernelArg]) -> Self {
        let words = args
            .iter()
            .map(|arg| {
                let mut word = [0u8; 8];
                match *arg {
                    KernelArg::Ptr(ptr) => word = ptr.0.to_le_bytes(),
                    KernelArg::I32(v) => word[..4].copy_from_slice(&v.to_le_bytes()),
                    KernelArg::F32(v) => word[..4].copy_from_slice(&v.to_le_bytes()),
                }
                word
            })
            .collect();
        Self { words }
    }

    pub fn words(&self) -> &[[u8; 8]] {
        &self.words
    }

    /// Pointer table into the slots; valid while `self` is borrowed.
    fn pointers(&mut self) -> Vec<*mut c_void> {
        self.words
            .iter_mut()
            .map(|word| word.as_mut_ptr() as *mut c_void)
            .collect()
    }
}

pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Stored as usize so the driver is Send + Sync.
    ctx: usize,
    limits: LaunchLimits,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: the context is owned by this driver and destroyed once.
            let _ = unsafe { (self.fns.ctx_destroy)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

pub struct CudaModule {
    driver: Arc<CudaDriver>,
    module: usize,
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 {
            // SAFETY: the module belongs to this driver and is unloaded once.
            let _ = unsafe { (self.driver.fns.module_unload)(self.module as CUmodule) };
            self.module = 0;
        }
    }
}

/// Entry point of a loaded module; keeps the module alive.
#[derive(Clone)]
pub struct CudaFunction {
    _module: Arc<CudaModule>,
    func: usize,
    symbol: Arc<str>,
}

impl CudaFunction {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, initialized on first use.
pub fn driver() -> FuseResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| {
        CudaDriver::new()
            .map(Arc::new)
            .map_err(|err| err.to_string())
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(FuseError::device(format!("CUDA driver unavailable: {msg}"))),
    }
}

impl CudaDriver {
    fn new() -> FuseResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns::load(&lib)?;

        // SAFETY: out pointers are valid locals; the API is initialized before use.
        let (dev, ctx) = unsafe {
            check_cuda((fns.init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda((fns.device_get)(&mut dev, 0), "cuDeviceGet")?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda((fns.ctx_create)(&mut ctx, 0, dev), "cuCtxCreate_v2")?;
            (dev, ctx)
        };
        let mut driver = Self {
            _lib: lib,
            fns,
            ctx: ctx as usize,
            limits: LaunchLimits {
                max_threads_per_block: 0,
                max_block: [0; 3],
                max_grid: [0; 3],
                max_shared_bytes: 0,
                compute_capability: (0, 0),
            },
        };
        driver.limits = driver.query_limits(dev)?;
        log::debug!(
            "cuda: device 0 is {}, {} threads per block",
            driver.limits.arch(),
            driver.limits.max_threads_per_block
        );
        Ok(driver)
    }

    fn query_limits(&self, dev: CUdevice) -> FuseResult<LaunchLimits> {
        let attr = |attribute: i32| -> FuseResult<u32> {
            let mut value = 0i32;
            // SAFETY: `value` is a valid out pointer and `dev` came from cuDeviceGet.
            unsafe {
                check_cuda(
                    (self.fns.device_get_attribute)(&mut value, attribute, dev),
                    "cuDeviceGetAttribute",
                )?;
            }
            Ok(value.max(0) as u32)
        };
        let axes = |first: i32| -> FuseResult<[u32; 3]> {
            Ok([attr(first)?, attr(first + 1)?, attr(first + 2)?])
        };
        Ok(LaunchLimits {
            max_threads_per_block: attr(ATTR_MAX_THREADS_PER_BLOCK)?,
            max_block: axes(ATTR_MAX_BLOCK_DIM_X)?,
            max_grid: axes(ATTR_MAX_GRID_DIM_X)?,
            max_shared_bytes: attr(ATTR_MAX_SHARED_MEMORY_PER_BLOCK)?,
            compute_capability: (
                attr(ATTR_COMPUTE_CAPABILITY_MAJOR)?,
                attr(ATTR_COMPUTE_CAPABILITY_MINOR)?,
            ),
        })
    }

    pub fn limits(&self) -> &LaunchLimits {
        &self.limits
    }

    /// Allocates `bytes` of zeroed device memory.
    pub fn alloc_zeroed(&self, bytes: usize) -> FuseResult<DevicePtr> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer; the memset stays inside the allocation.
        unsafe {
            check_cuda((self.fns.mem_alloc)(&mut ptr, bytes.max(1)), "cuMemAlloc_v2")?;
            if bytes != 0 {
                check_cuda((self.fns.memset_d8)(ptr, 0, bytes), "cuMemsetD8_v2")?;
            }
        }
        Ok(DevicePtr(ptr))
    }

    pub fn free(&self, ptr: DevicePtr) -> FuseResult<()> {
        self.ensure_current()?;
        // SAFETY: the driver rejects pointers it did not hand out.
        unsafe { check_cuda((self.fns.mem_free)(ptr.0), "cuMemFree_v2") }
    }

    pub fn upload(&self, dst: DevicePtr, bytes: &[u8]) -> FuseResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the host slice is valid for `bytes.len()` reads.
        unsafe {
            check_cuda(
                (self.fns.memcpy_htod)(dst.0, bytes.as_ptr() as *const c_void, bytes.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn download(&self, src: DevicePtr, bytes: usize) -> FuseResult<Vec<u8>> {
        let mut out = vec![0u8; bytes];
        if bytes == 0 {
            return Ok(out);
        }
        self.ensure_current()?;
        // SAFETY: the host buffer is valid for `bytes` writes.
        unsafe {
            check_cuda(
                (self.fns.memcpy_dtoh)(out.as_mut_ptr() as *mut c_void, src.0, bytes),
                "cuMemcpyDtoH_v2",
            )?;
        }
        Ok(out)
    }

    /// Loads `ptx` and resolves `symbol` in it.
    pub fn load_function(self: &Arc<Self>, ptx: &str, symbol: &str) -> FuseResult<CudaFunction> {
        self.ensure_current()?;
        let c_ptx =
            CString::new(ptx).map_err(|_| FuseError::compilation("ptx contains a NUL byte"))?;
        let c_symbol = CString::new(symbol)
            .map_err(|_| FuseError::compilation("kernel symbol contains a NUL byte"))?;

        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: `c_ptx` is NUL-terminated and no JIT options are passed.
        unsafe {
            check_cuda(
                (self.fns.module_load_data)(
                    &mut module,
                    c_ptx.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        let module = Arc::new(CudaModule {
            driver: Arc::clone(self),
            module: module as usize,
        });

        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: the module is loaded and `c_symbol` is NUL-terminated.
        unsafe {
            check_cuda(
                (self.fns.module_get_function)(
                    &mut function,
                    module.module as CUmodule,
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(CudaFunction {
            _module: module,
            func: function as usize,
            symbol: Arc::from(symbol),
        })
    }

    /// Launches `function` on the default stream after checking the geometry.
    pub fn launch(
        &self,
        function: &CudaFunction,
        config: LaunchConfig,
        args: &[KernelArg],
    ) -> FuseResult<()> {
        self.limits.check(function.symbol(), &config)?;
        self.ensure_current()?;
        let mut params = KernelParams::pack(args);
        let mut pointers = params.pointers();
        let (grid, block) = (config.grid, config.block);
        // SAFETY: `pointers` points into `params`, which outlives the call, and
        // the argument count was validated against the kernel's parameter list.
        let code = unsafe {
            (self.fns.launch_kernel)(
                function.func as CUfunction,
                grid.0,
                grid.1,
                grid.2,
                block.0,
                block.1,
                block.2,
                config.shared_mem_bytes,
                std::ptr::null_mut(),
                pointers.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };
        check_cuda(code, function.symbol())
    }

    pub fn synchronize(&self) -> FuseResult<()> {
        self.ensure_current()?;
        // SAFETY: the context is current on this thread.
        unsafe { check_cuda((self.fns.ctx_synchronize)(), "cuCtxSynchronize") }
    }

    /// Device-side duration of `work`, measured between two events on the default stream.
    pub fn time<F>(&self, work: F) -> FuseResult<Duration>
    where
        F: FnOnce() -> FuseResult<()>,
    {
        self.ensure_current()?;
        let start = self.create_event()?;
        let end = match self.create_event() {
            Ok(end) => end,
            Err(err) => {
                self.destroy_event(start);
                return Err(err);
            }
        };
        let result = self.record_between(start, end, work);
        self.destroy_event(start);
        self.destroy_event(end);
        result
    }

    fn record_between<F>(&self, start: CUevent, end: CUevent, work: F) -> FuseResult<Duration>
    where
        F: FnOnce() -> FuseResult<()>,
    {
        let stream: CUstream = std::ptr::null_mut();
        // SAFETY: both events were created in the current context and outlive this call.
        unsafe {
            check_cuda((self.fns.event_record)(start, stream), "cuEventRecord")?;
            work()?;
            check_cuda((self.fns.event_record)(end, stream), "cuEventRecord")?;
            check_cuda((self.fns.event_synchronize)(end), "cuEventSynchronize")?;
            let mut ms = 0f32;
            check_cuda(
                (self.fns.event_elapsed_time)(&mut ms, start, end),
                "cuEventElapsedTime",
            )?;
            Ok(Duration::from_secs_f64(f64::from(ms.max(0.0)) / 1e3))
        }
    }

    fn create_event(&self) -> FuseResult<CUevent> {
        let mut event: CUevent = std::ptr::null_mut();
        // SAFETY: `event` is a valid out pointer.
        unsafe { check_cuda((self.fns.event_create)(&mut event, 0), "cuEventCreate")? };
        Ok(event)
    }

    fn destroy_event(&self, event: CUevent) {
        // SAFETY: the event came from `create_event` and is destroyed once.
        let _ = unsafe { (self.fns.event_destroy)(event) };
    }

    fn ensure_current(&self) -> FuseResult<()> {
        // SAFETY: the context lives until this driver is dropped.
        unsafe { check_cuda((self.fns.ctx_set_current)(self.ctx_ptr()), "cuCtxSetCurrent") }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

fn load_cuda_library() -> FuseResult<Library> {
    const CANDIDATES: [&str; 4] = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];
    for candidate in CANDIDATES {
        // SAFETY: probing only; no symbol is called here.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(FuseError::device(format!(
        "failed to load the CUDA driver library (tried {})",
        CANDIDATES.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> FuseResult<T> {
    // SAFETY: each table entry declares the driver API signature of its symbol.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        FuseError::device(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}

/// Names of the driver errors a fused launch typically runs into.
fn error_name(code: CUresult) -> Option<&'static str> {
    Some(match code {
        1 => "CUDA_ERROR_INVALID_VALUE",
        2 => "CUDA_ERROR_OUT_OF_MEMORY",
        3 => "CUDA_ERROR_NOT_INITIALIZED",
        100 => "CUDA_ERROR_NO_DEVICE",
        200 => "CUDA_ERROR_INVALID_IMAGE",
        218 => "CUDA_ERROR_INVALID_PTX",
        500 => "CUDA_ERROR_NOT_FOUND",
        700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
        701 => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        719 => "CUDA_ERROR_LAUNCH_FAILED",
        _ => return None,
    })
}

fn check_cuda(code: CUresult, op: &str) -> FuseResult<()> {
    if code == CUDA_SUCCESS {
        return Ok(());
    }
    let detail = match error_name(code) {
        Some(name) => format!("{name} ({code})"),
        None => format!("code {code}"),
    };
    Err(FuseError::device(format!("CUDA driver call {op} failed: {detail}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LaunchLimits {
        LaunchLimits {
            max_threads_per_block: 1024,
            max_block: [1024, 1024, 64],
            max_grid: [i32::MAX as u32, 65535, 65535],
            max_shared_bytes: 48 * 1024,
            compute_capability: (8, 6),
        }
    }

    #[test]
    fn parameters_are_packed_little_endian() {
        let params = KernelParams::pack(&[
            KernelArg::Ptr(DevicePtr(0x1122_3344_5566_7788)),
            KernelArg::I32(-2),
            KernelArg::F32(1.5),
        ]);
        let words = params.words();
        assert_eq!(u64::from_le_bytes(words[0]), 0x1122_3344_5566_7788);
        assert_eq!(i32::from_le_bytes([words[1][0], words[1][1], words[1][2], words[1][3]]), -2);
        assert_eq!(f32::from_le_bytes([words[2][0], words[2][1], words[2][2], words[2][3]]), 1.5);
        assert_eq!(&words[2][4..], &[0; 4]);
    }

    #[test]
    fn engine_launch_shapes_fit_common_limits() {
        let limits = limits();
        assert_eq!(limits.arch(), "sm_86");
        // deepest reduction block with its shared partials
        let reduce = LaunchConfig::linear(4096, 1024).with_shared(4 * 1024);
        assert!(limits.check("ew", &reduce).is_ok());
        // transpose and dim shuffle tiles
        let tiles = LaunchConfig {
            grid: (2, 2, 65535),
            block: (32, 8, 1),
            shared_mem_bytes: 0,
        };
        assert!(limits.check("dim_shuffle", &tiles).is_ok());
    }

    #[test]
    fn oversized_launches_are_rejected_by_name() {
        let limits = limits();
        let deep = LaunchConfig {
            grid: (1, 1, 70_000),
            block: (32, 8, 1),
            shared_mem_bytes: 0,
        };
        let err = limits.check("dim_shuffle_f4", &deep).unwrap_err();
        assert!(matches!(err, FuseError::UnsupportedShape { .. }));
        assert!(err.to_string().contains("dim_shuffle_f4: grid.z=70000"), "{err}");

        let wide = LaunchConfig::linear(1, 2048);
        assert!(limits.check("ew", &wide).is_err());
        let shared = LaunchConfig::linear(1, 1024).with_shared(64 * 1024);
        assert!(limits.check("ew", &shared).is_err());
    }

    #[test]
    fn driver_errors_carry_their_names() {
        let err = check_cuda(701, "ew_sum_add").unwrap_err();
        assert!(err.to_string().contains("CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES (701)"));
        assert!(check_cuda(999, "x").unwrap_err().to_string().contains("code 999"));
        assert!(check_cuda(CUDA_SUCCESS, "x").is_ok());
    }
}
