//! Reporting sinks.
//!
//! The harness narrates a run through a [`Reporter`]: one call per
//! candidate, one for the selection, one for the production run. Formatting
//! is entirely up to the sink. [`LogReporter`] writes the familiar profiler
//! lines through the `log` facade; [`NullReporter`] discards everything.

use crate::harness::{InstanceOutcome, InstanceReport, SelectionResult};
use crate::op::OpSignature;

/// Consumer of per-candidate and final results.
///
/// Every method has an empty default so sinks only implement what they use.
pub trait Reporter {
    fn on_start(&mut self, _signature: &OpSignature, _instances: usize) {}

    fn on_instance(&mut self, _report: &InstanceReport) {}

    fn on_selection(&mut self, _result: &SelectionResult) {}

    /// Called right before the untimed run of the winner.
    fn on_production_run(&mut self, _name: &str) {}

    fn on_done(&mut self) {}
}

impl<R: Reporter + ?Sized> Reporter for &mut R {
    fn on_start(&mut self, signature: &OpSignature, instances: usize) {
        (**self).on_start(signature, instances)
    }

    fn on_instance(&mut self, report: &InstanceReport) {
        (**self).on_instance(report)
    }

    fn on_selection(&mut self, result: &SelectionResult) {
        (**self).on_selection(result)
    }

    fn on_production_run(&mut self, name: &str) {
        (**self).on_production_run(name)
    }

    fn on_done(&mut self) {
        (**self).on_done()
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Writes each event as an `info` line (a `warn` when nothing is supported).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn on_start(&mut self, signature: &OpSignature, instances: usize) {
        log::info!("found {instances} instances of {signature}");
        log::info!("Run all instances and do timing");
    }

    fn on_instance(&mut self, report: &InstanceReport) {
        match report.outcome {
            InstanceOutcome::Timed {
                ave_time_ms,
                gb_per_sec,
            } => log::info!(
                "Perf: {ave_time_ms:>10.5} ms, {gb_per_sec:.3} GB/s, {}",
                report.name
            ),
            InstanceOutcome::Unsupported => {
                log::info!("{} does not support this problem", report.name)
            }
        }
    }

    fn on_selection(&mut self, result: &SelectionResult) {
        match result.best() {
            Some(best) => log::info!(
                "Best Perf: {:.5} ms, {:.3} GB/s, {}",
                best.ave_time_ms,
                best.gb_per_sec,
                best.name
            ),
            None => log::warn!(
                "no supported implementation among {} instances",
                result.reports().len()
            ),
        }
    }

    fn on_production_run(&mut self, name: &str) {
        log::info!("Run the best instance without timing: {name}");
    }

    fn on_done(&mut self) {
        log::info!("Done");
    }
}
