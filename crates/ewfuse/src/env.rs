use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static EWFUSE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Engine knobs normally taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Launches per fused call; above one the call is timed and logged.
    pub bench_repeat: usize,
    /// Directory receiving every rendered kernel source.
    pub dump_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bench_repeat: 1,
            dump_dir: None,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn parse_repeat(value: &str) -> usize {
    value.parse::<usize>().map(|n| n.max(1)).unwrap_or_else(|_| {
        log::warn!("ignoring EWFUSE_BENCH={value}: expected a repeat count");
        1
    })
}

impl EngineConfig {
    /// Reads `EWFUSE_BENCH` and `EWFUSE_DUMP_KERNELS` once per process.
    pub fn from_env() -> Self {
        EWFUSE_CONFIG
            .get_or_init(|| Self {
                bench_repeat: non_empty("EWFUSE_BENCH").map_or(1, |v| parse_repeat(&v)),
                dump_dir: non_empty("EWFUSE_DUMP_KERNELS").map(PathBuf::from),
            })
            .clone()
    }

    pub fn with_bench_repeat(mut self, repeat: usize) -> Self {
        self.bench_repeat = repeat.max(1);
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_counts_are_clamped() {
        assert_eq!(parse_repeat("20"), 20);
        assert_eq!(parse_repeat("0"), 1);
        assert_eq!(parse_repeat("many"), 1);
        assert_eq!(EngineConfig::default().with_bench_repeat(0).bench_repeat, 1);
    }
}
