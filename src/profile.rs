//! Latency profiling over the [`InferenceRunner`] contract.
//!
//! The profiler drives a runner through warmup and measured iterations for
//! each requested batch size and summarizes per-call latency. It never looks
//! inside the runner, so any implementation of the contract can be compared.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::TensorView;
use crate::engine::TensorMetadata;
use crate::error::RunnerError;
use crate::runner::InferenceRunner;
use crate::tensor::Tensor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfilerConfig {
    /// Unmeasured calls per batch size. The first call of a shape pays for
    /// shape setup and graph capture.
    pub warmup: usize,
    pub iterations: usize,
    pub batch_sizes: Vec<usize>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            warmup: 10,
            iterations: 100,
            batch_sizes: vec![1],
        }
    }
}

impl ProfilerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| RunnerError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<(), RunnerError> {
        if self.iterations == 0 {
            return Err(RunnerError::Config("iterations must be at least 1".to_string()));
        }
        if self.batch_sizes.is_empty() || self.batch_sizes.contains(&0) {
            return Err(RunnerError::Config(
                "batch_sizes must be a non-empty list of positive sizes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Latency summary for one runner at one batch size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileReport {
    pub runner: String,
    pub batch_size: usize,
    pub warmup: usize,
    pub iterations: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Samples (batch rows) per second over the measured iterations.
    pub throughput: f64,
}

impl ProfileReport {
    fn from_latencies(
        runner: &str,
        batch_size: usize,
        warmup: usize,
        latencies: &[Duration],
    ) -> Self {
        let mut ms: Vec<f64> = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        ms.sort_by(f64::total_cmp);
        let total_ms: f64 = ms.iter().sum();
        let n = ms.len().max(1);
        let throughput = if total_ms > 0.0 {
            (batch_size * ms.len()) as f64 / (total_ms / 1000.0)
        } else {
            0.0
        };
        Self {
            runner: runner.to_string(),
            batch_size,
            warmup,
            iterations: ms.len(),
            avg_ms: total_ms / n as f64,
            min_ms: ms.first().copied().unwrap_or(0.0),
            max_ms: ms.last().copied().unwrap_or(0.0),
            p50_ms: percentile(&ms, 50.0),
            p90_ms: percentile(&ms, 90.0),
            p95_ms: percentile(&ms, 95.0),
            p99_ms: percentile(&ms, 99.0),
            throughput,
        }
    }
}

/// Nearest-rank percentile of ascending `sorted`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Zero-filled feeds for `metadata`: the leading dynamic dimension takes the
/// batch size, any other dynamic dimension is 1.
///
/// Shape-tensor inputs are zero-filled too, since their meaning is specific
/// to the engine. Profile such engines with [`Profiler::run_with`] and a feed
/// builder that supplies real shape values.
pub fn synthetic_feeds(
    metadata: &TensorMetadata,
    batch_size: usize,
) -> HashMap<String, TensorView> {
    metadata
        .iter()
        .map(|spec| {
            let shape: Vec<usize> = spec
                .shape
                .dims()
                .iter()
                .enumerate()
                .map(|(i, &d)| match d {
                    d if d >= 0 => d as usize,
                    _ if i == 0 => batch_size,
                    _ => 1,
                })
                .collect();
            (spec.name.clone(), Tensor::zeros(&shape, spec.dtype).into())
        })
        .collect()
}

pub struct Profiler {
    config: ProfilerConfig,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Profile `runner` with [`synthetic_feeds`].
    pub fn run(
        &self,
        runner: &mut dyn InferenceRunner,
    ) -> Result<Vec<ProfileReport>, RunnerError> {
        self.run_with(runner, synthetic_feeds)
    }

    /// Profile `runner`, building each batch size's feeds with `make_feeds`.
    ///
    /// The runner is activated if needed and left in the state it was found
    /// in.
    pub fn run_with<F>(
        &self,
        runner: &mut dyn InferenceRunner,
        make_feeds: F,
    ) -> Result<Vec<ProfileReport>, RunnerError>
    where
        F: Fn(&TensorMetadata, usize) -> HashMap<String, TensorView>,
    {
        self.config.validate()?;
        let activated = !runner.is_active();
        if activated {
            runner.activate()?;
        }
        let reports = self.measure(runner, &make_feeds);
        if activated {
            let released = runner.deactivate();
            // A measurement error takes precedence over a release error.
            let reports = reports?;
            released?;
            return Ok(reports);
        }
        reports
    }

    fn measure<F>(
        &self,
        runner: &mut dyn InferenceRunner,
        make_feeds: &F,
    ) -> Result<Vec<ProfileReport>, RunnerError>
    where
        F: Fn(&TensorMetadata, usize) -> HashMap<String, TensorView>,
    {
        let metadata = runner.input_metadata()?;
        let mut reports = Vec::with_capacity(self.config.batch_sizes.len());
        for &batch_size in &self.config.batch_sizes {
            let feeds = make_feeds(&metadata, batch_size);
            for _ in 0..self.config.warmup {
                runner.infer(&feeds, false)?;
            }
            let mut latencies = Vec::with_capacity(self.config.iterations);
            for _ in 0..self.config.iterations {
                let start = Instant::now();
                runner.infer(&feeds, false)?;
                latencies.push(start.elapsed());
            }
            let report = ProfileReport::from_latencies(
                runner.name(),
                batch_size,
                self.config.warmup,
                &latencies,
            );
            debug!(
                runner = %report.runner,
                batch_size,
                avg_ms = report.avg_ms,
                p99_ms = report.p99_ms,
                "Profiled batch size"
            );
            reports.push(report);
        }
        info!(runner = runner.name(), batches = reports.len(), "Profiling complete");
        Ok(reports)
    }
}
