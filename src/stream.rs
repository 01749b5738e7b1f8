//! Stream configuration and the timing loop shared by every candidate.
//!
//! The harness hands a [`StreamConfig`] to each [`Candidate::run`]. When
//! `time_kernel` is set the run must be synchronous and report a mean
//! elapsed time; otherwise it launches once and reports `0.0`.
//! [`launch_and_time`] implements both modes so candidates only supply the
//! launch itself.
//!
//! [`Candidate::run`]: crate::op::Candidate::run

use std::time::Instant;

use crate::error::TuneError;

/// Warm-up launches before measurement starts.
pub const DEFAULT_COLD_NITERS: usize = 5;

/// Measured launches averaged into one timing.
pub const DEFAULT_NREPEAT: usize = 50;

/// Identity of the queue work is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// How a candidate should launch: which stream, and whether to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_id: Option<StreamId>,
    pub time_kernel: bool,
    pub cold_niters: usize,
    pub nrepeat: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_id: None,
            time_kernel: false,
            cold_niters: DEFAULT_COLD_NITERS,
            nrepeat: DEFAULT_NREPEAT,
        }
    }
}

impl StreamConfig {
    /// Same stream and iteration counts, with timing switched on.
    pub fn timed(self) -> Self {
        Self {
            time_kernel: true,
            ..self
        }
    }

    /// Same stream, with timing switched off.
    pub fn untimed(self) -> Self {
        Self {
            time_kernel: false,
            ..self
        }
    }
}

/// Launches work according to `stream` and returns the mean time in milliseconds.
///
/// Untimed: one launch, returns `0.0`. Timed: `cold_niters` warm-up
/// launches, then `nrepeat` (at least one) measured launches. `launch` must
/// not return before its work has completed when timing is requested.
///
/// # Errors
/// The first error returned by `launch` is propagated unchanged.
pub fn launch_and_time<F>(stream: &StreamConfig, mut launch: F) -> Result<f64, TuneError>
where
    F: FnMut() -> Result<(), TuneError>,
{
    if !stream.time_kernel {
        launch()?;
        return Ok(0.0);
    }

    for _ in 0..stream.cold_niters {
        launch()?;
    }

    let nrepeat = stream.nrepeat.max(1);
    let start = Instant::now();
    for _ in 0..nrepeat {
        launch()?;
    }
    let total_ms = start.elapsed().as_secs_f64() * 1.0e3;

    Ok(total_ms / nrepeat as f64)
}
