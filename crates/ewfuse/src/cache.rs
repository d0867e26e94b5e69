use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{lock_named, FuseError, FuseResult};
use crate::kernels::{KernelKey, KernelSource};

/// A compiled kernel together with the source it came from.
pub struct CachedKernel<K> {
    pub source: KernelSource,
    pub kernel: K,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub builds: u64,
    pub entries: usize,
}

/// Process-wide map from [`KernelKey`] to compiled kernels.
///
/// Lookups never block on another key's compilation; concurrent requests for
/// the same missing key compile it exactly once. A key's gate lives only while
/// its build is in flight.
pub struct KernelCache<K> {
    compiled: Mutex<HashMap<KernelKey, Arc<CachedKernel<K>>>>,
    compile_gates: Mutex<HashMap<KernelKey, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    builds: AtomicU64,
}

impl<K> Default for KernelCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KernelCache<K> {
    pub fn new() -> Self {
        Self {
            compiled: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    fn lookup(&self, key: &KernelKey) -> FuseResult<Option<Arc<CachedKernel<K>>>> {
        let found = lock_named(&self.compiled, "kernel cache")?.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("kernel cache hit: {key}");
        }
        Ok(found)
    }

    /// Returns the kernel for `key`, rendering and compiling it through
    /// `compile` on a miss. Failed builds are not cached.
    pub fn get_or_build(
        &self,
        key: &KernelKey,
        dump_dir: Option<&Path>,
        compile: impl FnOnce(&KernelSource) -> FuseResult<K>,
    ) -> FuseResult<Arc<CachedKernel<K>>> {
        if let Some(found) = self.lookup(key)? {
            return Ok(found);
        }

        let gate = {
            let mut gates = lock_named(&self.compile_gates, "kernel compile gate map")?;
            gates
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let gate_lock = lock_named(&gate, "kernel compile gate")?;
        let built = self.build(key, dump_dir, compile);

        {
            let mut gates = lock_named(&self.compile_gates, "kernel compile gate map")?;
            if gates.get(key).is_some_and(|current| Arc::ptr_eq(current, &gate)) {
                gates.remove(key);
            }
        }
        drop(gate_lock);
        built
    }

    fn build(
        &self,
        key: &KernelKey,
        dump_dir: Option<&Path>,
        compile: impl FnOnce(&KernelSource) -> FuseResult<K>,
    ) -> FuseResult<Arc<CachedKernel<K>>> {
        if let Some(found) = self.lookup(key)? {
            return Ok(found);
        }

        let source = KernelSource::build(key)?;
        if let Some(dir) = dump_dir {
            dump_source(dir, &source)?;
        }
        log::debug!("building kernel {} for {key}", source.symbol);
        let kernel = compile(&source)?;
        self.builds.fetch_add(1, Ordering::Relaxed);

        let cached = Arc::new(CachedKernel { source, kernel });
        lock_named(&self.compiled, "kernel cache")?.insert(key.clone(), Arc::clone(&cached));
        Ok(cached)
    }

    pub fn stats(&self) -> FuseResult<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            entries: lock_named(&self.compiled, "kernel cache")?.len(),
        })
    }
}

fn dump_source(dir: &Path, source: &KernelSource) -> FuseResult<()> {
    let io = |err: std::io::Error| FuseError::device(format!("kernel dump failed: {err}"));
    std::fs::create_dir_all(dir).map_err(io)?;
    let path = dir.join(format!("{}.cu", source.symbol));
    std::fs::write(&path, &source.source).map_err(io)?;
    log::debug!("dumped kernel source to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn second_lookup_is_a_hit() {
        let cache: KernelCache<String> = KernelCache::new();
        let key = KernelKey::Transpose(DType::F32);
        let first = cache
            .get_or_build(&key, None, |src| Ok(src.symbol.clone()))
            .unwrap();
        let second = cache
            .get_or_build(&key, None, |_| panic!("must not rebuild"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            cache.stats().unwrap(),
            CacheStats {
                hits: 1,
                builds: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn failed_builds_are_retried() {
        let cache: KernelCache<()> = KernelCache::new();
        let key = KernelKey::Transpose(DType::F16);
        let err = cache
            .get_or_build(&key, None, |_| Err(FuseError::compilation("nvcc exploded")))
            .err();
        assert!(matches!(err, Some(FuseError::Compilation { .. })));
        cache.get_or_build(&key, None, |_| Ok(())).unwrap();
        assert_eq!(cache.stats().unwrap().builds, 1);
    }

    #[test]
    fn concurrent_misses_compile_once() {
        let cache: Arc<KernelCache<u32>> = Arc::new(KernelCache::new());
        let key = KernelKey::CompensatedSum {
            dtype: DType::F32,
            stochastic: false,
        };
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let key = key.clone();
                scope.spawn(move || {
                    cache.get_or_build(&key, None, |_| Ok(7)).unwrap();
                });
            }
        });
        let stats = cache.stats().unwrap();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.hits, 7);
        assert!(cache.compile_gates.lock().unwrap().is_empty());
    }

    #[test]
    fn gates_are_released_after_success_and_failure() {
        let cache: KernelCache<()> = KernelCache::new();
        for dtype in [DType::F32, DType::F16, DType::Ui8] {
            cache
                .get_or_build(&KernelKey::Transpose(dtype), None, |_| Ok(()))
                .unwrap();
        }
        let failing = KernelKey::CompensatedSum {
            dtype: DType::F16,
            stochastic: true,
        };
        assert!(cache
            .get_or_build(&failing, None, |_| Err(FuseError::compilation("bad")))
            .is_err());
        assert!(cache.compile_gates.lock().unwrap().is_empty());
        assert_eq!(cache.stats().unwrap().entries, 3);
    }
}
