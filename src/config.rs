//! Run parameters. Every field has a default matching the classic experiment
//! (100 steps of 10 allocations in `[512, 1536)` bytes, releasing once the
//! live set exceeds 20 blocks), so an empty JSON object is a valid config.

use std::{
    error, fmt,
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Initial heap size assumed by the downstream analysis, also the default
/// capacity of the arena backend.
pub const DEFAULT_ARENA_CAPACITY: usize = 20 * 1024 * 1024;

/// How a degraded step (failed allocation, failed heap introspection) is
/// reported. Degradations are always counted in the run diagnostics; this
/// only picks the log level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationReporting {
    /// Log at `debug`
    Silent,
    /// Log at `warn`
    #[default]
    Warn,
}

/// Process-wide allocator tuning, applied once before the first step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorTuning {
    /// Keep every allocation in the contiguous heap instead of giving large
    /// requests their own mapping.
    pub disable_mmap: bool,
    /// Disable size-class caches (fastbins, low-fragmentation front ends)
    /// that would hide freed chunks from introspection.
    pub disable_fast_bins: bool,
}

impl Default for AllocatorTuning {
    fn default() -> Self {
        Self {
            disable_mmap: true,
            disable_fast_bins: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub csv: PathBuf,
    pub json: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv: PathBuf::from("heap_fragmentation_stats.csv"),
            json: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub step_count: usize,
    pub allocations_per_step: usize,
    pub min_size: usize,
    pub size_range: usize,
    /// A block is released in a step only while the live set is larger than
    /// this.
    pub free_threshold: usize,
    /// Seed for the workload RNG. `None` seeds from the wall clock; the seed
    /// actually used is recorded in the run report.
    pub seed: Option<u64>,
    pub degradation_reporting: DegradationReporting,
    pub tuning: AllocatorTuning,
    /// Only used by the arena backend
    pub arena_capacity: usize,
    pub output: OutputConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            step_count: 100,
            allocations_per_step: 10,
            min_size: 512,
            size_range: 1024,
            free_threshold: 20,
            seed: None,
            degradation_reporting: DegradationReporting::default(),
            tuning: AllocatorTuning::default(),
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            output: OutputConfig::default(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    SerdeJsonError(serde_json::Error),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "could not read config: {e}"),
            ConfigError::SerdeJsonError(e) => write!(f, "could not parse config: {e}"),
            ConfigError::Invalid(why) => write!(f, "invalid config: {why}"),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::SerdeJsonError(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl SimulationConfig {
    /// Read a config from a JSON file and validate it
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let file = File::open(path).map_err(ConfigError::IoError)?;
        let config: Self =
            serde_json::from_reader(BufReader::new(file)).map_err(ConfigError::SerdeJsonError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot describe a meaningful run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_count == 0 {
            return Err(ConfigError::Invalid("step_count must be positive"));
        }
        if self.size_range == 0 {
            return Err(ConfigError::Invalid("size_range must be positive"));
        }
        if self.min_size.checked_add(self.size_range).is_none() {
            return Err(ConfigError::Invalid("min_size + size_range overflows"));
        }
        if self.arena_capacity == 0 {
            return Err(ConfigError::Invalid("arena_capacity must be positive"));
        }
        Ok(())
    }

    /// Upper bound on the live set size over a whole run. Capped, since it
    /// only sizes an up-front reservation.
    pub fn live_set_bound(&self) -> usize {
        const CAP: usize = 1 << 20;
        self.step_count
            .saturating_mul(self.allocations_per_step)
            .min(CAP)
    }
}
