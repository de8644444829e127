use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, log, Level};

use crate::{
    alloc::HeapService,
    config::{ConfigError, DegradationReporting, SimulationConfig},
    inspect,
    series::{RunReport, StepDiagnostics, TimeSeries},
    workload::{LiveSet, WorkloadSimulator},
};

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as u64)
}

impl DegradationReporting {
    const fn level(self) -> Level {
        match self {
            DegradationReporting::Silent => Level::Debug,
            DegradationReporting::Warn => Level::Warn,
        }
    }
}

/// Run the whole experiment against `heap`: tune it once, then churn and
/// measure for `config.step_count` steps, then release whatever is still
/// live.
///
/// Nothing that goes wrong inside a step stops the run. Failed allocations
/// and failed heap walks are counted in [`RunReport::diagnostics`] and logged
/// at the level `config.degradation_reporting` asks for.
///
/// # Errors
/// - [`ConfigError::Invalid`] if `config` does not validate. The heap is not
///   touched.
pub fn run<S>(heap: &mut S, config: &SimulationConfig) -> Result<RunReport, ConfigError>
where
    S: HeapService,
{
    config.validate()?;

    let tuning = heap.tune(&config.tuning);
    info!("allocator tuning {tuning}");

    let seed = config.seed.unwrap_or_else(seed_from_clock);
    info!(
        "running {} steps of {} allocations in [{}, {}) bytes, seed {seed}",
        config.step_count,
        config.allocations_per_step,
        config.min_size,
        config.min_size + config.size_range
    );

    let mut workload = WorkloadSimulator::new(config, seed);
    let mut live = LiveSet::with_capacity(config.live_set_bound());
    let mut series = TimeSeries::with_capacity(config.step_count);
    let mut diagnostics = Vec::with_capacity(config.step_count);
    let level = config.degradation_reporting.level();

    for time_step in 0..config.step_count {
        let churn = workload.step(heap, &mut live);
        let measurement = inspect::measure(heap, &live, time_step);

        if churn.failed > 0 {
            log!(
                level,
                "step {time_step}: {} allocations ({} bytes) failed and were skipped",
                churn.failed,
                churn.failed_bytes
            );
        }
        if let Some(e) = &measurement.introspection_error {
            log!(level, "step {time_step}: free space reported as zero: {e}");
        }

        let stats = measurement.stats;
        debug!(
            "step {time_step}: live={} internal={}B external={:.4} free={}B biggest={}B",
            live.len(),
            stats.internal_fragmentation,
            stats.external_fragmentation_ratio,
            stats.total_free_on_heap,
            stats.biggest_free_block
        );

        series.push(stats);
        diagnostics.push(StepDiagnostics {
            allocation_failures: churn.failed,
            introspection_failed: measurement.introspection_error.is_some(),
            live_blocks: live.len(),
        });
    }

    debug!("releasing {} remaining blocks", live.len());
    live.release_all(heap);

    Ok(RunReport {
        series,
        diagnostics,
        seed,
        tuning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degradation_levels() {
        assert_eq!(DegradationReporting::Silent.level(), Level::Debug);
        assert_eq!(DegradationReporting::Warn.level(), Level::Warn);
    }

    #[test]
    fn clock_seed_is_not_constant_zero() {
        assert_ne!(seed_from_clock(), 0);
    }
}
