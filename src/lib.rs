//! briny_tune: an autotuning execution harness for interchangeable kernels.
//!
//! Given one operation (a fixed set of input and output element types, an
//! element-wise transform and a tensor rank) there are usually several
//! kernels that can compute it, each fast on some shapes and illegal on
//! others. This crate picks between them empirically.
//!
//! # Features
//!
//! - A type-keyed [`registry`] of candidate kernels with a uniform
//!   bind / supports / run contract ([`op::Candidate`]).
//! - Support negotiation, warmed-up timed runs and strict best-of-N
//!   selection where ties keep the earlier candidate ([`harness`]).
//! - An untimed production run of the winner.
//! - Scope-bound device buffers that are released on every exit path
//!   ([`memory`]).
//! - Aligned side-parameter strides with zero broadcast over reduced axes
//!   ([`problem`]).
//! - Batch-norm inference kernels for the CPU (`rayon`) and, with the
//!   `wgpu` feature, compute shaders ([`kernels`]).
//!
//! # Modules
//!
//! - [`problem`] — problem descriptors, validation and stride alignment.
//! - [`memory`] — device allocators and RAII buffers.
//! - [`op`] / [`registry`] — the candidate contract and candidate lists.
//! - [`stream`] — execution streams and kernel timing.
//! - [`harness`] — profiling, selection and the production run.
//! - [`report`] — reporting sinks.
//! - [`config`] — environment-driven configuration.
//!
//! # Example
//!
//! See [`harness`] for a full tuning run, or the `batchnorm_infer` demo.

pub mod approx;
pub mod backend;
pub mod config;
pub mod element;
pub mod error;
pub mod harness;
pub mod kernels;
pub mod memory;
pub mod op;
pub mod problem;
pub mod registry;
pub mod report;
pub mod stream;

/// Everything needed to describe a problem, bind buffers and tune.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::config::TuneConfig;
    pub use crate::element::Element;
    pub use crate::error::TuneError;
    pub use crate::harness::{
        BestInstance, InstanceOutcome, InstanceReport, SelectionResult, Tuner, gb_per_sec,
        profile_instances, run_best, tune_and_run,
    };
    pub use crate::kernels::{BatchNormInfer, NormalizeArgument};
    pub use crate::memory::{DeviceAllocator, DeviceMem, DevicePtr, HostAllocator};
    pub use crate::op::{Bindings, Candidate, DeviceOp, OpSignature};
    pub use crate::problem::{
        ProblemDescriptor, RawProblem, align_param_strides, packed_strides, required_elements,
    };
    pub use crate::registry::{InstanceFactory, Registry};
    pub use crate::report::{LogReporter, NullReporter, Reporter};
    pub use crate::stream::{StreamConfig, StreamId, launch_and_time};
}
