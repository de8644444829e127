use serde::{Deserialize, Serialize};

use crate::{alloc::TuningOutcome, inspect::HeapStats};

/// One [`HeapStats`] per step, in step order. Append-only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSeries {
    steps: Vec<HeapStats>,
}

impl TimeSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            steps: Vec::with_capacity(capacity),
        }
    }

    /// Append the next step. `stats.time_step` must equal the current length.
    pub fn push(&mut self, stats: HeapStats) {
        debug_assert_eq!(stats.time_step, self.steps.len());
        self.steps.push(stats);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn as_slice(&self) -> &[HeapStats] {
        &self.steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeapStats> {
        self.steps.iter()
    }
}

impl<'a> IntoIterator for &'a TimeSeries {
    type Item = &'a HeapStats;
    type IntoIter = std::slice::Iter<'a, HeapStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// What went wrong in a step, if anything. Not part of the exported series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepDiagnostics {
    pub allocation_failures: usize,
    pub introspection_failed: bool,
    /// Size of the live set after the step's churn
    pub live_blocks: usize,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub series: TimeSeries,
    pub diagnostics: Vec<StepDiagnostics>,
    /// The seed the workload actually ran with
    pub seed: u64,
    pub tuning: TuningOutcome,
}

/// Headline numbers for a finished run
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub steps: usize,
    pub final_internal_fragmentation: usize,
    pub peak_internal_fragmentation: usize,
    pub peak_external_fragmentation_ratio: f64,
    pub allocation_failures: usize,
    pub degraded_steps: usize,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            steps: self.series.len(),
            final_internal_fragmentation: self
                .series
                .as_slice()
                .last()
                .map_or(0, |s| s.internal_fragmentation),
            ..Default::default()
        };
        for stats in &self.series {
            summary.peak_internal_fragmentation = summary
                .peak_internal_fragmentation
                .max(stats.internal_fragmentation);
            summary.peak_external_fragmentation_ratio = summary
                .peak_external_fragmentation_ratio
                .max(stats.external_fragmentation_ratio);
        }
        for step in &self.diagnostics {
            summary.allocation_failures += step.allocation_failures;
            summary.degraded_steps += usize::from(step.introspection_failed);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::FreeSpace;

    fn stats(time_step: usize, committed: usize, free: &[usize]) -> HeapStats {
        HeapStats::new(
            time_step,
            1000,
            committed,
            FreeSpace::from_sizes(free.iter().copied()),
        )
    }

    #[test]
    fn summary_tracks_peaks_and_failures() {
        let mut series = TimeSeries::default();
        series.push(stats(0, 1200, &[100, 100]));
        series.push(stats(1, 1500, &[300, 100]));
        series.push(stats(2, 1100, &[]));
        let report = RunReport {
            series,
            diagnostics: vec![
                StepDiagnostics::default(),
                StepDiagnostics {
                    allocation_failures: 2,
                    introspection_failed: false,
                    live_blocks: 0,
                },
                StepDiagnostics {
                    allocation_failures: 1,
                    introspection_failed: true,
                    live_blocks: 0,
                },
            ],
            seed: 0,
            tuning: TuningOutcome::Applied,
        };
        let summary = report.summary();
        assert_eq!(summary.steps, 3);
        assert_eq!(summary.final_internal_fragmentation, 100);
        assert_eq!(summary.peak_internal_fragmentation, 500);
        assert_eq!(summary.peak_external_fragmentation_ratio, 0.5);
        assert_eq!(summary.allocation_failures, 3);
        assert_eq!(summary.degraded_steps, 1);
    }

    #[test]
    fn series_serializes_as_plain_array() {
        let mut series = TimeSeries::default();
        series.push(stats(0, 1000, &[]));
        let json = serde_json::to_value(&series).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["time_step"], 0);
        assert_eq!(json[0]["external_fragmentation_ratio"], 0.0);
    }
}
