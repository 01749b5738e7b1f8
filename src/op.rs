//! The candidate contract.
//!
//! An operation family is a type implementing [`DeviceOp`]: a type-level
//! key (element types, element-wise transform, rank) plus the argument type
//! its candidates bind. Every concrete kernel for that family implements
//! [`Candidate<Op>`], so the harness can treat heterogeneous kernels
//! uniformly:
//!
//! 1. [`Candidate::bind`] turns a problem and its buffers into a fresh argument;
//! 2. [`Candidate::supports`] decides whether that argument is legal for the kernel;
//! 3. [`Candidate::run`] executes it, timed or not.

use core::fmt;

use crate::backend::Backend;
use crate::error::TuneError;
use crate::memory::DeviceMem;
use crate::problem::ProblemDescriptor;
use crate::stream::StreamConfig;

/// Runtime description of an operation family's type-level key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSignature {
    pub inputs: Vec<&'static str>,
    pub outputs: Vec<&'static str>,
    pub transform: &'static str,
    pub rank: usize,
}

impl fmt::Display for OpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceElementwise<({}), ({}), {}, {}>",
            self.inputs.join(", "),
            self.outputs.join(", "),
            self.transform,
            self.rank
        )
    }
}

/// A family of interchangeable kernels.
pub trait DeviceOp: 'static {
    /// What a candidate binds a problem and its buffers into.
    ///
    /// `'a` is the lifetime of the bound [`DeviceMem`]s: an argument can
    /// never outlive the buffers it addresses.
    type Argument<'a>;

    fn signature() -> OpSignature;
}

/// Device buffers participating in one operation, in kernel order.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    inputs: &'a [&'a DeviceMem],
    outputs: &'a [&'a DeviceMem],
}

impl<'a> Bindings<'a> {
    pub fn new(inputs: &'a [&'a DeviceMem], outputs: &'a [&'a DeviceMem]) -> Self {
        Self { inputs, outputs }
    }

    pub fn inputs(&self) -> &'a [&'a DeviceMem] {
        self.inputs
    }

    pub fn outputs(&self) -> &'a [&'a DeviceMem] {
        self.outputs
    }

    /// Bytes moved by one execution: every input and output region once.
    pub fn total_bytes(&self) -> usize {
        self.inputs
            .iter()
            .chain(self.outputs)
            .map(|mem| mem.size_bytes())
            .sum()
    }

    /// Whether any output region is also bound as an input or another output.
    pub fn has_aliased_output(&self) -> bool {
        self.outputs.iter().enumerate().any(|(i, out)| {
            let addr = out.device_buffer();
            self.inputs.iter().any(|mem| mem.device_buffer() == addr)
                || self.outputs[..i].iter().any(|mem| mem.device_buffer() == addr)
        })
    }
}

/// One concrete kernel for the operation family `Op`.
///
/// Candidates hold no per-problem state: every [`bind`](Candidate::bind)
/// produces an argument that borrows the buffers it was given.
pub trait Candidate<Op: DeviceOp>: Send + Sync {
    /// Stable, human-readable identifier of this kernel instance.
    fn name(&self) -> String;

    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    /// Builds an argument for `problem` over `bindings`.
    ///
    /// # Errors
    /// [`TuneError::Unsupported`] when no argument can be formed. The
    /// harness treats this the same as [`supports`](Candidate::supports)
    /// returning `false`.
    fn bind<'a>(
        &self,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'a>,
    ) -> Result<Op::Argument<'a>, TuneError>;

    /// Support negotiation: can this kernel legally process `argument`?
    fn supports(&self, argument: &Op::Argument<'_>) -> bool;

    /// Executes `argument` on `stream`.
    ///
    /// Returns the mean elapsed milliseconds when `stream.time_kernel` is
    /// set (and blocks until the work is done), `0.0` otherwise.
    fn run(&self, argument: &Op::Argument<'_>, stream: &StreamConfig) -> Result<f64, TuneError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::HostAllocator;

    #[test]
    fn signature_renders_type_key() {
        let sig = OpSignature {
            inputs: vec!["f32", "f32"],
            outputs: vec!["f32"],
            transform: "NormalizeInInfer",
            rank: 4,
        };
        assert_eq!(
            sig.to_string(),
            "DeviceElementwise<(f32, f32), (f32), NormalizeInInfer, 4>"
        );
    }

    #[test]
    fn bindings_sum_bytes_and_detect_aliasing() {
        let alloc = Arc::new(HostAllocator::new());
        let x = DeviceMem::new(alloc.clone(), 400).unwrap();
        let p = DeviceMem::new(alloc.clone(), 16).unwrap();
        let y = DeviceMem::new(alloc.clone(), 400).unwrap();

        let inputs = [&x, &p];
        let outputs = [&y];
        let bindings = Bindings::new(&inputs, &outputs);
        assert_eq!(bindings.total_bytes(), 816);
        assert!(!bindings.has_aliased_output());

        let in_place = [&x];
        let bindings = Bindings::new(&inputs, &in_place);
        assert!(bindings.has_aliased_output());
    }
}
