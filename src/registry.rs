//! Candidate registries.
//!
//! A [`Registry`] is the ordered, read-only list of candidates for one
//! [`DeviceOp`]. The op type is the lookup key, so a registry can only ever
//! hold candidates whose signature matches; asking for an op family the
//! crate has no kernels for does not compile. Order is fixed when the
//! registry is built and never changes afterwards, which keeps selection
//! reproducible.

use crate::backend::Backend;
use crate::op::{Candidate, DeviceOp};

/// Op families that ship a built-in list of kernels.
pub trait InstanceFactory: DeviceOp + Sized {
    /// All built-in candidates, in their canonical order.
    fn instances() -> Vec<Box<dyn Candidate<Self>>>;
}

/// Ordered candidates for the op family `Op`.
pub struct Registry<Op: DeviceOp> {
    candidates: Vec<Box<dyn Candidate<Op>>>,
}

impl<Op: InstanceFactory> Registry<Op> {
    /// The built-in candidates for `Op`.
    pub fn instances() -> Self {
        Self::from_candidates(Op::instances())
    }
}

impl<Op: DeviceOp> Registry<Op> {
    pub fn from_candidates(candidates: Vec<Box<dyn Candidate<Op>>>) -> Self {
        Self { candidates }
    }

    pub fn list_candidates(&self) -> &[Box<dyn Candidate<Op>>] {
        &self.candidates
    }

    pub fn get(&self, index: usize) -> Option<&dyn Candidate<Op>> {
        self.candidates.get(index).map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.name()).collect()
    }

    /// Drops every candidate not targeting `backend`, keeping relative order.
    pub fn retain_backend(&mut self, backend: Backend) {
        self.candidates.retain(|c| c.backend() == backend);
    }
}

impl<Op: DeviceOp> core::fmt::Debug for Registry<Op> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("signature", &Op::signature().to_string())
            .field("candidates", &self.names())
            .finish()
    }
}
