use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use ewfuse::{lock_named, FuseError, FuseResult, KernelSource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub fingerprint: u64,
    pub ptx: Arc<str>,
    pub symbol: Arc<str>,
}

/// Translates CUDA C sources to PTX with `nvcc`, memoized in memory and on disk.
pub struct NvccCompiler {
    default_arch: String,
    compiled: Mutex<HashMap<u64, Arc<CompiledKernel>>>,
    compile_gates: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl Default for NvccCompiler {
    fn default() -> Self {
        Self::for_arch("sm_80")
    }
}

impl NvccCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiler targeting `arch` unless `EWFUSE_CUDA_ARCH` overrides it.
    pub fn for_arch(arch: impl Into<String>) -> Self {
        Self {
            default_arch: arch.into(),
            compiled: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn arch(&self) -> String {
        env_value("EWFUSE_CUDA_ARCH").unwrap_or_else(|| self.default_arch.clone())
    }

    pub fn compile(&self, source: &KernelSource) -> FuseResult<Arc<CompiledKernel>> {
        let compiler = nvcc_binary();
        let arch = self.arch();
        let fingerprint = kernel_fingerprint(source, &arch, &compiler);

        if let Some(found) = self.lookup(fingerprint)? {
            return Ok(found);
        }

        let gate = {
            let mut guard = lock_named(&self.compile_gates, "nvcc compile gates")?;
            guard
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let gate_lock = lock_named(&gate, "nvcc compile gate")?;
        let built = self.compile_gated(source, fingerprint, &compiler, &arch);
        {
            let mut gates = lock_named(&self.compile_gates, "nvcc compile gates")?;
            if gates.get(&fingerprint).is_some_and(|g| Arc::ptr_eq(g, &gate)) {
                gates.remove(&fingerprint);
            }
        }
        drop(gate_lock);
        built
    }

    fn compile_gated(
        &self,
        source: &KernelSource,
        fingerprint: u64,
        compiler: &str,
        arch: &str,
    ) -> FuseResult<Arc<CompiledKernel>> {
        if let Some(found) = self.lookup(fingerprint)? {
            return Ok(found);
        }

        let cache_dir = cuda_cache_dir();
        std::fs::create_dir_all(&cache_dir)
            .map_err(|err| FuseError::compilation(format!("{}: {err}", cache_dir.display())))?;

        let source_path = cache_dir.join(format!("kernel_{fingerprint:016x}.cu"));
        let ptx_path = cache_dir.join(format!("kernel_{fingerprint:016x}_{arch}.ptx"));
        let meta_path = cache_dir.join(format!("kernel_{fingerprint:016x}_{arch}.meta.json"));

        if !ptx_path.exists() || !meta_path.exists() {
            log::debug!("nvcc: compiling {} for {arch}", source.symbol);
            write_file(&source_path, source.source.as_bytes())?;
            run_nvcc(compiler, arch, &source_path, &ptx_path)?;
            let meta = NvccMeta {
                kernel_symbol: source.symbol.clone(),
                arch: arch.to_string(),
            };
            let json = serde_json::to_vec_pretty(&meta)
                .map_err(|err| FuseError::compilation(err.to_string()))?;
            write_file(&meta_path, &json)?;
        } else {
            log::trace!("nvcc: disk hit for {}", source.symbol);
        }

        let ptx = read_file(&ptx_path)?;
        let meta = read_file(&meta_path)?;
        let parsed: NvccMeta =
            serde_json::from_str(&meta).map_err(|err| FuseError::compilation(err.to_string()))?;
        if parsed.kernel_symbol != source.symbol {
            return Err(FuseError::compilation(format!(
                "{} holds {}, expected {}",
                meta_path.display(),
                parsed.kernel_symbol,
                source.symbol
            )));
        }

        let compiled = Arc::new(CompiledKernel {
            fingerprint,
            ptx: Arc::from(ptx),
            symbol: Arc::from(parsed.kernel_symbol),
        });
        lock_named(&self.compiled, "nvcc kernel cache")?.insert(fingerprint, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn lookup(&self, fingerprint: u64) -> FuseResult<Option<Arc<CompiledKernel>>> {
        Ok(lock_named(&self.compiled, "nvcc kernel cache")?
            .get(&fingerprint)
            .cloned())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NvccMeta {
    kernel_symbol: String,
    arch: String,
}

fn write_file(path: &Path, bytes: &[u8]) -> FuseResult<()> {
    std::fs::write(path, bytes)
        .map_err(|err| FuseError::compilation(format!("{}: {err}", path.display())))
}

fn read_file(path: &Path) -> FuseResult<String> {
    std::fs::read_to_string(path)
        .map_err(|err| FuseError::compilation(format!("{}: {err}", path.display())))
}

fn run_nvcc(compiler: &str, arch: &str, source: &Path, ptx: &Path) -> FuseResult<()> {
    let output = Command::new(compiler)
        .arg("-ptx")
        .arg(format!("-arch={arch}"))
        .arg("--use_fast_math")
        .arg("-o")
        .arg(ptx)
        .arg(source)
        .output()
        .map_err(|err| FuseError::compilation(format!("failed to run {compiler}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(FuseError::compilation(format!(
            "nvcc failed on {} (status={}): stdout='{}' stderr='{}'",
            source.display(),
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }

    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn cuda_cache_dir() -> PathBuf {
    env_value("EWFUSE_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".cache/ewfuse-cuda"))
}

fn nvcc_binary() -> String {
    if let Some(value) = env_value("EWFUSE_NVCC") {
        return value;
    }
    if let Some(home) = env_value("CUDA_HOME") {
        let candidate = Path::new(&home).join("bin").join("nvcc");
        if candidate.exists() {
            return candidate.display().to_string();
        }
    }
    "nvcc".to_string()
}

fn kernel_fingerprint(source: &KernelSource, arch: &str, compiler: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.symbol.hash(&mut hasher);
    source.source.hash(&mut hasher);
    arch.hash(&mut hasher);
    compiler.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ewfuse::{DType, KernelKey};

    #[test]
    fn fingerprints_separate_architectures_and_kernels() {
        let shuffle = KernelSource::build(&KernelKey::DimShuffle(DType::F32)).unwrap();
        let transpose = KernelSource::build(&KernelKey::Transpose(DType::F32)).unwrap();
        let base = kernel_fingerprint(&shuffle, "sm_80", "nvcc");
        assert_eq!(base, kernel_fingerprint(&shuffle, "sm_80", "nvcc"));
        assert_ne!(base, kernel_fingerprint(&shuffle, "sm_86", "nvcc"));
        assert_ne!(base, kernel_fingerprint(&transpose, "sm_80", "nvcc"));
    }

    #[test]
    fn gates_are_dropped_after_a_failed_build() {
        let compiler = NvccCompiler::for_arch("sm_86");
        let source = KernelSource::build(&KernelKey::Transpose(DType::F16)).unwrap();
        std::env::set_var("EWFUSE_NVCC", "/nonexistent/ewfuse-nvcc");
        std::env::set_var("EWFUSE_CACHE_DIR", std::env::temp_dir().join("ewfuse-nvcc-gate-test"));
        let err = compiler.compile(&source).unwrap_err();
        assert!(matches!(err, FuseError::Compilation { .. }), "{err}");
        assert!(compiler.compile_gates.lock().unwrap().is_empty());
        assert!(compiler.compiled.lock().unwrap().is_empty());
    }
}
