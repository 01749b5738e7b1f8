//! Problem descriptors and aligned side-parameter strides.
//!
//! # Problem Descriptor
//!
//! A problem is a full-rank tensor (`x`, and the output `y` with the same
//! layout) plus a set of side parameters that only vary over the
//! *invariant* axes, the axes the operation does not reduce over. For batch
//! norm in NHWC layout with `reduce_dims = [0, 1, 2]` the side parameters
//! are per-channel vectors of length `C`.
//!
//! Kernels want to address the side parameters with the same rank-length
//! index as `x`. [`align_param_strides`] re-projects the parameter strides
//! into a rank-length array with a zero stride in every reduced slot, so
//! moving along a reduced axis never moves within the parameter tensor.
//!
//! ```text
//! lengths        [16, 8, 128, 256]
//! invariant_dims             [3]
//! param_strides              [1]
//! aligned        [ 0, 0,   0,   1]
//! ```
//!
//! All validation happens in [`ProblemDescriptor::new`], before any
//! candidate is consulted.

use briny::prelude::*;

use crate::error::TuneError;

/// Unvalidated problem description, as a caller writes it down.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProblem {
    pub lengths: Vec<usize>,
    pub strides: Vec<usize>,
    pub reduce_dims: Vec<usize>,
    pub invariant_dims: Vec<usize>,
    pub param_lengths: Vec<usize>,
    pub param_strides: Vec<usize>,
    pub epsilon: f64,
}

impl RawProblem {
    fn structural_fault(&self) -> Option<String> {
        let rank = self.lengths.len();
        if self.strides.len() != rank {
            return Some(format!(
                "{} strides given for rank {rank}",
                self.strides.len()
            ));
        }
        if self.param_lengths.len() != self.invariant_dims.len()
            || self.param_strides.len() != self.invariant_dims.len()
        {
            return Some(format!(
                "parameter lengths/strides ({}/{}) must match the {} invariant axes",
                self.param_lengths.len(),
                self.param_strides.len(),
                self.invariant_dims.len()
            ));
        }

        let mut seen = vec![false; rank];
        for &axis in self.reduce_dims.iter().chain(&self.invariant_dims) {
            match seen.get_mut(axis) {
                None => return Some(format!("axis {axis} out of range for rank {rank}")),
                Some(true) => return Some(format!("axis {axis} listed more than once")),
                Some(slot) => *slot = true,
            }
        }
        if let Some(axis) = seen.iter().position(|covered| !covered) {
            return Some(format!("axis {axis} is neither reduced nor invariant"));
        }

        if self.lengths.iter().try_fold(1usize, |n, &len| n.checked_mul(len)).is_none() {
            return Some(format!("element count of {:?} overflows usize", self.lengths));
        }
        if required_elements(&self.lengths, &self.strides).is_none() {
            return Some(format!(
                "strides {:?} address more than usize::MAX elements",
                self.strides
            ));
        }

        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Some(format!("epsilon {} must be finite and non-negative", self.epsilon));
        }
        None
    }
}

/// Pass/fail form of the structural checks, for wrapping in [`TrustedData`].
///
/// [`ProblemDescriptor::new`] runs the same checks and keeps the reason.
impl Validate for RawProblem {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.structural_fault() {
            Some(_) => Err(ValidationError),
            None => Ok(()),
        }
    }
}

/// A validated problem with its aligned side-parameter strides.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemDescriptor {
    lengths: Vec<usize>,
    strides: Vec<usize>,
    reduce_dims: Vec<usize>,
    invariant_dims: Vec<usize>,
    param_lengths: Vec<usize>,
    param_strides: Vec<usize>,
    aligned_param_strides: Vec<usize>,
    epsilon: f64,
}

impl ProblemDescriptor {
    /// Validates `raw` and derives the aligned parameter strides.
    ///
    /// # Errors
    /// - [`TuneError::InvalidProblem`] if the axis sets do not partition
    ///   `[0, rank)`, the stride arrays disagree in length with their shapes,
    ///   or epsilon is negative or non-finite.
    /// - [`TuneError::ShapeMismatch`] if an invariant axis extent differs
    ///   from the parameter extent listed for it.
    pub fn new(raw: RawProblem) -> Result<Self, TuneError> {
        if let Some(fault) = raw.structural_fault() {
            log::debug!("rejecting problem descriptor: {fault}");
            return Err(TuneError::InvalidProblem(fault));
        }

        let aligned_param_strides = align_param_strides(
            &raw.lengths,
            &raw.invariant_dims,
            &raw.param_lengths,
            &raw.param_strides,
        )?;

        Ok(Self {
            lengths: raw.lengths,
            strides: raw.strides,
            reduce_dims: raw.reduce_dims,
            invariant_dims: raw.invariant_dims,
            param_lengths: raw.param_lengths,
            param_strides: raw.param_strides,
            aligned_param_strides,
            epsilon: raw.epsilon,
        })
    }

    pub fn rank(&self) -> usize {
        self.lengths.len()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Strides shared by the full input and the output.
    pub fn xy_strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn reduce_dims(&self) -> &[usize] {
        &self.reduce_dims
    }

    pub fn invariant_dims(&self) -> &[usize] {
        &self.invariant_dims
    }

    pub fn param_lengths(&self) -> &[usize] {
        &self.param_lengths
    }

    pub fn param_strides(&self) -> &[usize] {
        &self.param_strides
    }

    /// Rank-length strides for every side parameter, zero on reduced axes.
    pub fn aligned_param_strides(&self) -> &[usize] {
        &self.aligned_param_strides
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Logical element count of the full tensor.
    pub fn num_elements(&self) -> usize {
        self.lengths.iter().product()
    }

    /// Logical element count of one side parameter.
    pub fn num_param_elements(&self) -> usize {
        self.param_lengths.iter().product()
    }
}

/// Projects per-invariant-axis strides onto a rank-length stride array.
///
/// For the `i`-th entry `d` of `invariant_dims`, checks
/// `lengths[d] == param_lengths[i]` and writes `param_strides[i]` into slot
/// `d`. Every other slot stays zero, which broadcasts the parameter along
/// the reduced axes.
///
/// # Errors
/// [`TuneError::ShapeMismatch`] on the first disagreeing axis, and
/// [`TuneError::InvalidProblem`] if an axis is out of range or the
/// parameter arrays are shorter than `invariant_dims`.
///
/// # Example
/// ```rust
/// use briny_tune::problem::align_param_strides;
///
/// let aligned = align_param_strides(&[16, 8, 128, 256], &[3], &[256], &[1]).unwrap();
/// assert_eq!(aligned, vec![0, 0, 0, 1]);
/// ```
pub fn align_param_strides(
    lengths: &[usize],
    invariant_dims: &[usize],
    param_lengths: &[usize],
    param_strides: &[usize],
) -> Result<Vec<usize>, TuneError> {
    let mut aligned = vec![0; lengths.len()];

    for (i, &dim) in invariant_dims.iter().enumerate() {
        let (Some(&full), Some(&param), Some(&stride)) =
            (lengths.get(dim), param_lengths.get(i), param_strides.get(i))
        else {
            return Err(TuneError::InvalidProblem(format!(
                "invariant axis {dim} (position {i}) has no matching extent"
            )));
        };
        if full != param {
            return Err(TuneError::ShapeMismatch {
                axis: dim,
                full,
                param,
            });
        }
        aligned[dim] = stride;
    }

    Ok(aligned)
}

/// Row-major strides for a densely packed tensor of `lengths`.
pub fn packed_strides(lengths: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; lengths.len()];
    let mut acc = 1;
    for (stride, &len) in strides.iter_mut().zip(lengths).rev() {
        *stride = acc;
        acc *= len;
    }
    strides
}

/// Number of elements a buffer must hold to be addressed through `strides`.
///
/// Zero if any extent is zero, `None` if the count overflows `usize`.
pub fn required_elements(lengths: &[usize], strides: &[usize]) -> Option<usize> {
    if lengths.contains(&0) {
        return Some(0);
    }
    lengths
        .iter()
        .zip(strides)
        .try_fold(1usize, |span, (&len, &stride)| {
            (len - 1).checked_mul(stride)?.checked_add(span)
        })
}
