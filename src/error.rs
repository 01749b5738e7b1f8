//! Error taxonomy for the tuning harness.
//!
//! Only faults live here. A candidate declining a problem is an ordinary
//! outcome of support negotiation and never surfaces from
//! [`profile_instances`](crate::harness::profile_instances); likewise "no
//! candidate applies" is the `None` winner of a
//! [`SelectionResult`](crate::harness::SelectionResult), not an error.

/// Everything that can go wrong while describing, binding or running a problem.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TuneError {
    /// The allocator could not satisfy a request. Fatal, never retried.
    #[error("failed to allocate {requested} bytes: {reason}")]
    Allocation { requested: usize, reason: String },

    /// An invariant axis of the full tensor disagrees with the side-parameter shape.
    #[error("shape mismatch on axis {axis}: full tensor has extent {full}, parameter has {param}")]
    ShapeMismatch { axis: usize, full: usize, param: usize },

    /// The descriptor is malformed in some other way (axis sets, stride arrays, epsilon).
    #[error("invalid problem descriptor: {0}")]
    InvalidProblem(String),

    /// A candidate cannot build an argument for this problem.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A candidate accepted the problem and then failed while executing it.
    #[error("instance `{name}` failed during execution: {reason}")]
    Execution { name: String, reason: String },

    /// The GPU context or a GPU submission failed.
    #[error("GPU failure: {0}")]
    Gpu(String),
}

impl TuneError {
    pub(crate) fn allocation(requested: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            requested,
            reason: reason.into(),
        }
    }

    pub(crate) fn execution(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Execution {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for the errors the harness is allowed to absorb.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = TuneError::ShapeMismatch {
            axis: 3,
            full: 256,
            param: 128,
        };
        assert_eq!(
            err.to_string(),
            "shape mismatch on axis 3: full tensor has extent 256, parameter has 128"
        );

        let err = TuneError::execution("CpuNaiveNormalize", "device lost");
        assert!(err.to_string().contains("CpuNaiveNormalize"));
        assert!(!err.is_unsupported());
        assert!(TuneError::Unsupported("rank".into()).is_unsupported());
    }
}
