//! The selection protocol.
//!
//! # Execution Harness
//!
//! [`profile_instances`] walks a [`Registry`] once, in order:
//!
//! 1. bind the candidate to the problem and buffers;
//! 2. ask it whether it supports the bound argument;
//! 3. if so, run it with timing and compute its throughput;
//! 4. keep it if it is *strictly* faster than the incumbent.
//!
//! The incumbent is a fold accumulator, so on an exact tie the earlier
//! candidate stays. Unsupported candidates (including ones that fail to
//! bind) are recorded and skipped. A candidate that fails after claiming
//! support aborts the whole run with [`TuneError::Execution`].
//!
//! [`run_best`] then binds the winner again and runs it once with timing
//! off: the production run. When nothing supports the problem the result
//! carries no winner and no production run happens; that is a normal
//! outcome, not an error.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use briny_tune::prelude::*;
//!
//! # fn main() -> Result<(), TuneError> {
//! let lengths = vec![2, 4, 8];
//! let problem = ProblemDescriptor::new(RawProblem {
//!     strides: packed_strides(&lengths),
//!     lengths: lengths.clone(),
//!     reduce_dims: vec![0, 1],
//!     invariant_dims: vec![2],
//!     param_lengths: vec![8],
//!     param_strides: vec![1],
//!     epsilon: 1e-5,
//! })?;
//!
//! let alloc = Arc::new(HostAllocator::new());
//! let x = DeviceMem::with_elements::<f32>(alloc.clone(), 64)?;
//! let params: Vec<DeviceMem> = (0..4)
//!     .map(|_| DeviceMem::with_elements::<f32>(alloc.clone(), 8))
//!     .collect::<Result<_, _>>()?;
//! let y = DeviceMem::with_elements::<f32>(alloc.clone(), 64)?;
//!
//! let inputs = [&x, &params[0], &params[1], &params[2], &params[3]];
//! let outputs = [&y];
//! let bindings = Bindings::new(&inputs, &outputs);
//!
//! let registry = Registry::<BatchNormInfer<f32, 3>>::instances();
//! let mut tuner = Tuner::new(registry, TuneConfig { cold_niters: 0, nrepeat: 1, ..TuneConfig::default() });
//! let result = tuner.tune(&problem, &bindings)?;
//! assert!(result.found());
//! # Ok(())
//! # }
//! ```

use crate::backend::Backend;
use crate::config::TuneConfig;
use crate::error::TuneError;
use crate::op::{Bindings, Candidate, DeviceOp};
use crate::problem::ProblemDescriptor;
use crate::registry::Registry;
use crate::report::{LogReporter, Reporter};
use crate::stream::StreamConfig;

/// What happened to one candidate during profiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstanceOutcome {
    /// Failed to bind, or declined the bound argument.
    Unsupported,
    Timed { ave_time_ms: f64, gb_per_sec: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceReport {
    pub index: usize,
    pub name: String,
    pub backend: Backend,
    pub outcome: InstanceOutcome,
}

/// The winning candidate of a profiling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BestInstance {
    pub index: usize,
    pub name: String,
    pub ave_time_ms: f64,
    pub gb_per_sec: f64,
}

/// Outcome of [`profile_instances`].
///
/// The winner is only reachable through [`best`](Self::best), so callers
/// have to handle the no-support case before reading it.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    best: Option<BestInstance>,
    reports: Vec<InstanceReport>,
}

impl SelectionResult {
    pub fn found(&self) -> bool {
        self.best.is_some()
    }

    pub fn best(&self) -> Option<&BestInstance> {
        self.best.as_ref()
    }

    pub fn best_index(&self) -> Option<usize> {
        self.best.as_ref().map(|b| b.index)
    }

    pub fn best_name(&self) -> Option<&str> {
        self.best.as_ref().map(|b| b.name.as_str())
    }

    /// One report per candidate, in registry order.
    pub fn reports(&self) -> &[InstanceReport] {
        &self.reports
    }

    pub fn supported_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, InstanceOutcome::Timed { .. }))
            .count()
    }
}

/// Throughput in GB/s for `num_bytes` moved in `ave_time_ms` milliseconds.
///
/// Bytes per millisecond divided by 1e6 is bytes per second divided by 1e9.
pub fn gb_per_sec(num_bytes: usize, ave_time_ms: f64) -> f64 {
    num_bytes as f64 / 1.0e6 / ave_time_ms
}

/// Benchmarks every supported candidate and selects the fastest.
///
/// # Errors
/// [`TuneError::Execution`] if a candidate that claimed support fails while
/// running, or reports a time that is not finite and positive. Bind failures and
/// unsupported arguments are recorded, never returned.
pub fn profile_instances<Op: DeviceOp>(
    registry: &Registry<Op>,
    problem: &ProblemDescriptor,
    bindings: &Bindings<'_>,
    stream: &StreamConfig,
    reporter: &mut dyn Reporter,
) -> Result<SelectionResult, TuneError> {
    reporter.on_start(&Op::signature(), registry.len());

    let timed = stream.timed();
    let num_bytes = bindings.total_bytes();
    let mut reports = Vec::with_capacity(registry.len());

    let best = registry.list_candidates().iter().enumerate().try_fold(
        None::<BestInstance>,
        |best, (index, candidate)| {
            let name = candidate.name();
            let outcome = profile_one(candidate.as_ref(), &name, problem, bindings, &timed, num_bytes)?;
            let report = InstanceReport {
                index,
                name,
                backend: candidate.backend(),
                outcome,
            };
            reporter.on_instance(&report);

            let best = match report.outcome {
                InstanceOutcome::Timed { ave_time_ms, gb_per_sec }
                    if best.as_ref().is_none_or(|b| ave_time_ms < b.ave_time_ms) =>
                {
                    Some(BestInstance {
                        index,
                        name: report.name.clone(),
                        ave_time_ms,
                        gb_per_sec,
                    })
                }
                _ => best,
            };
            reports.push(report);
            Ok::<_, TuneError>(best)
        },
    )?;

    let result = SelectionResult { best, reports };
    reporter.on_selection(&result);
    Ok(result)
}

fn profile_one<Op: DeviceOp>(
    candidate: &dyn Candidate<Op>,
    name: &str,
    problem: &ProblemDescriptor,
    bindings: &Bindings<'_>,
    stream: &StreamConfig,
    num_bytes: usize,
) -> Result<InstanceOutcome, TuneError> {
    let argument = match candidate.bind(problem, bindings) {
        Ok(argument) => argument,
        Err(e) => {
            log::debug!("{name} could not bind: {e}");
            return Ok(InstanceOutcome::Unsupported);
        }
    };
    if !candidate.supports(&argument) {
        return Ok(InstanceOutcome::Unsupported);
    }

    let ave_time_ms = execute(candidate, name, &argument, stream)?;
    if !ave_time_ms.is_finite() || ave_time_ms <= 0.0 {
        return Err(TuneError::execution(
            name,
            format!("reported an invalid time of {ave_time_ms} ms"),
        ));
    }

    Ok(InstanceOutcome::Timed {
        ave_time_ms,
        gb_per_sec: gb_per_sec(num_bytes, ave_time_ms),
    })
}

fn execute<Op: DeviceOp>(
    candidate: &dyn Candidate<Op>,
    name: &str,
    argument: &Op::Argument<'_>,
    stream: &StreamConfig,
) -> Result<f64, TuneError> {
    candidate.run(argument, stream).map_err(|e| match e {
        TuneError::Execution { .. } => e,
        other => TuneError::execution(name, other),
    })
}

/// Runs the winner of `selection` once more, untimed.
///
/// Returns `Ok(false)` without touching any candidate when `selection` has
/// no winner.
///
/// # Errors
/// [`TuneError::Execution`] if the winner can no longer be bound, no longer
/// supports the argument, or fails while running. There is no fallback to
/// the runner-up.
pub fn run_best<Op: DeviceOp>(
    registry: &Registry<Op>,
    selection: &SelectionResult,
    problem: &ProblemDescriptor,
    bindings: &Bindings<'_>,
    stream: &StreamConfig,
    reporter: &mut dyn Reporter,
) -> Result<bool, TuneError> {
    let Some(best) = selection.best() else {
        return Ok(false);
    };
    let candidate = registry.get(best.index).ok_or_else(|| {
        TuneError::execution(&best.name, format!("no instance at index {}", best.index))
    })?;

    let name = candidate.name();
    reporter.on_production_run(&name);

    let argument = candidate
        .bind(problem, bindings)
        .map_err(|e| TuneError::execution(&name, format!("re-bind failed: {e}")))?;
    if !candidate.supports(&argument) {
        return Err(TuneError::execution(
            &name,
            "no longer supports the argument it was selected for",
        ));
    }
    execute(candidate, &name, &argument, &stream.untimed())?;

    reporter.on_done();
    Ok(true)
}

/// Profiles `registry` and, when something is supported, runs the winner.
pub fn tune_and_run<Op: DeviceOp>(
    registry: &Registry<Op>,
    problem: &ProblemDescriptor,
    bindings: &Bindings<'_>,
    stream: &StreamConfig,
    reporter: &mut dyn Reporter,
) -> Result<SelectionResult, TuneError> {
    let selection = profile_instances(registry, problem, bindings, stream, reporter)?;
    run_best(registry, &selection, problem, bindings, stream, reporter)?;
    Ok(selection)
}

/// A registry, a configuration and a reporter bundled for repeated use.
pub struct Tuner<Op: DeviceOp, R: Reporter = LogReporter> {
    registry: Registry<Op>,
    config: TuneConfig,
    reporter: R,
}

impl<Op: DeviceOp> Tuner<Op> {
    /// A tuner logging through [`LogReporter`].
    ///
    /// If `config.backend` is set, candidates for other backends are dropped.
    pub fn new(registry: Registry<Op>, config: TuneConfig) -> Self {
        Self::with_reporter(registry, config, LogReporter)
    }
}

impl<Op: DeviceOp, R: Reporter> Tuner<Op, R> {
    pub fn with_reporter(mut registry: Registry<Op>, config: TuneConfig, reporter: R) -> Self {
        if let Some(backend) = config.backend {
            registry.retain_backend(backend);
        }
        Self {
            registry,
            config,
            reporter,
        }
    }

    pub fn registry(&self) -> &Registry<Op> {
        &self.registry
    }

    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Profiles the problem and performs the production run of the winner.
    pub fn tune(
        &mut self,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'_>,
    ) -> Result<SelectionResult, TuneError> {
        let stream = self.config.stream();
        tune_and_run(&self.registry, problem, bindings, &stream, &mut self.reporter)
    }

    /// Profiles the problem without the production run.
    pub fn profile(
        &mut self,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'_>,
    ) -> Result<SelectionResult, TuneError> {
        let stream = self.config.stream();
        profile_instances(&self.registry, problem, bindings, &stream, &mut self.reporter)
    }
}
