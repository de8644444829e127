use std::{env, process::ExitCode};

use heapfrag::{
    alloc::{HeapBackend, PlatformHeap},
    simulation, sink, SimulationConfig,
};
use log::{error, info};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args_os().nth(1) {
        Some(path) => SimulationConfig::from_file(&path),
        None => Ok(SimulationConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut heap = match PlatformHeap::open(&config) {
        Ok(heap) => heap,
        Err(e) => {
            error!("could not open the {} heap: {e}", PlatformHeap::NAME);
            return ExitCode::FAILURE;
        }
    };
    info!("measuring the {} heap", PlatformHeap::NAME);

    let report = match simulation::run(&mut heap, &config) {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let summary = report.summary();
    info!(
        "{} steps: internal fragmentation {} bytes at the end, {} at peak; peak external ratio {:.4}",
        summary.steps,
        summary.final_internal_fragmentation,
        summary.peak_internal_fragmentation,
        summary.peak_external_fragmentation_ratio
    );
    if summary.allocation_failures > 0 || summary.degraded_steps > 0 {
        info!(
            "{} allocations failed, {} steps had no free-space data",
            summary.allocation_failures, summary.degraded_steps
        );
    }

    let failures = sink::write_outputs(&report.series, &config.output);
    for (path, e) in &failures {
        error!("{}: {e}", path.display());
    }
    if failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
