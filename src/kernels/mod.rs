//! # Batch-norm inference kernels
//!
//! The operation family shipped with the crate: five inputs, one output,
//! transformed element-wise by
//!
//! ```text
//! y = (x - mean) / sqrt(variance + epsilon) * scale + bias
//! ```
//!
//! `x` and `y` share the problem's full-rank strides. `mean`, `variance`,
//! `scale` and `bias` only vary over the invariant axes and are addressed
//! through the problem's aligned parameter strides.
//!
//! ## Submodules
//!
//! - [`cpu`] — a strided reference kernel and `rayon` tiled kernels.
//! - `wgpu` — compute-shader kernels (enabled with `--features wgpu`).
//!
//! ## Binding order
//!
//! Inputs are bound as `[x, mean, variance, scale, bias]`, outputs as `[y]`.

use core::marker::PhantomData;

use crate::element::Element;
use crate::error::TuneError;
use crate::memory::{DeviceMem, DevicePtr};
use crate::op::{Bindings, Candidate, DeviceOp, OpSignature};
use crate::problem::{ProblemDescriptor, required_elements};
use crate::registry::InstanceFactory;

pub mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Name of the element-wise transform in op signatures.
pub const NORMALIZE_IN_INFER: &str = "NormalizeInInfer";

/// Number of input buffers a batch-norm inference argument binds.
pub const NUM_INPUTS: usize = 5;

/// Batch-norm inference over rank-`RANK` tensors of `T`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchNormInfer<T, const RANK: usize>(PhantomData<fn() -> T>);

impl<T: Element, const RANK: usize> DeviceOp for BatchNormInfer<T, RANK> {
    type Argument<'a> = NormalizeArgument<'a, T>;

    fn signature() -> OpSignature {
        OpSignature {
            inputs: vec![T::NAME; NUM_INPUTS],
            outputs: vec![T::NAME],
            transform: NORMALIZE_IN_INFER,
            rank: RANK,
        }
    }
}

impl<T: Element, const RANK: usize> InstanceFactory for BatchNormInfer<T, RANK> {
    fn instances() -> Vec<Box<dyn Candidate<Self>>> {
        let mut instances: Vec<Box<dyn Candidate<Self>>> = vec![Box::new(cpu::NaiveNormalize)];
        instances.extend(cpu::TILE_CONFIGS.iter().map(|&(rows_per_task, vector)| {
            Box::new(cpu::TiledNormalize::new(rows_per_task, vector)) as Box<dyn Candidate<Self>>
        }));
        // shaders compute in f32 only
        #[cfg(feature = "wgpu")]
        if T::SHADER_NATIVE {
            instances.extend(wgpu::WORKGROUP_SIZES.iter().map(|&size| {
                Box::new(wgpu::WgpuNormalize::new(size)) as Box<dyn Candidate<Self>>
            }));
        }
        instances
    }
}

/// A batch-norm inference problem bound to concrete buffers.
///
/// The argument borrows every buffer it was bound to, so they cannot be
/// dropped while it is still usable:
///
/// ```rust,compile_fail
/// use std::sync::Arc;
/// use briny_tune::kernels::cpu::NaiveNormalize;
/// use briny_tune::prelude::*;
///
/// type Norm = BatchNormInfer<f32, 2>;
///
/// let problem = ProblemDescriptor::new(RawProblem {
///     lengths: vec![2, 8],
///     strides: vec![8, 1],
///     reduce_dims: vec![0],
///     invariant_dims: vec![1],
///     param_lengths: vec![8],
///     param_strides: vec![1],
///     epsilon: 1e-5,
/// })
/// .unwrap();
/// let alloc = Arc::new(HostAllocator::new());
///
/// let argument = {
///     let mems: Vec<DeviceMem> = [16, 8, 8, 8, 8, 16]
///         .iter()
///         .map(|&n| DeviceMem::with_elements::<f32>(alloc.clone(), n).unwrap())
///         .collect();
///     let inputs = [&mems[0], &mems[1], &mems[2], &mems[3], &mems[4]];
///     let outputs = [&mems[5]];
///     let bindings = Bindings::new(&inputs, &outputs);
///     Candidate::<Norm>::bind(&NaiveNormalize, &problem, &bindings).unwrap()
/// };
/// Candidate::<Norm>::run(&NaiveNormalize, &argument, &StreamConfig::default()).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct NormalizeArgument<'a, T> {
    lengths: Vec<usize>,
    xy_strides: Vec<usize>,
    param_strides: Vec<usize>,
    xy_span: usize,
    param_span: usize,
    x: DevicePtr,
    mean: DevicePtr,
    variance: DevicePtr,
    scale: DevicePtr,
    bias: DevicePtr,
    y: DevicePtr,
    epsilon: T,
    host_accessible: bool,
    buffers: PhantomData<&'a DeviceMem>,
}

/// Host slices over a bound argument's buffers.
pub(crate) struct HostViews<'a, T> {
    pub x: &'a [T],
    pub mean: &'a [T],
    pub variance: &'a [T],
    pub scale: &'a [T],
    pub bias: &'a [T],
    pub y: &'a mut [T],
}

impl<'a, T: Element> NormalizeArgument<'a, T> {
    /// Binds `problem` to `bindings` for a rank-`rank` kernel.
    ///
    /// # Errors
    /// [`TuneError::Unsupported`] when the rank differs, the buffer count is
    /// wrong, the output aliases another buffer, a buffer is too small or
    /// misaligned for `T`, or the addressed bytes overflow `usize`.
    pub fn bind(
        rank: usize,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'a>,
    ) -> Result<Self, TuneError> {
        if problem.rank() != rank {
            return Err(TuneError::Unsupported(format!(
                "rank {} problem for a rank {rank} kernel",
                problem.rank()
            )));
        }
        let (inputs, outputs) = (bindings.inputs(), bindings.outputs());
        let ([x, mean, variance, scale, bias], [y]) = (inputs, outputs) else {
            return Err(TuneError::Unsupported(format!(
                "expected {NUM_INPUTS} inputs and 1 output, got {} and {}",
                inputs.len(),
                outputs.len()
            )));
        };
        if bindings.has_aliased_output() {
            return Err(TuneError::Unsupported("output aliases another buffer".into()));
        }

        let overflow = || TuneError::Unsupported("addressed span overflows usize".into());
        let xy_span =
            required_elements(problem.lengths(), problem.xy_strides()).ok_or_else(overflow)?;
        let param_span = required_elements(problem.lengths(), problem.aligned_param_strides())
            .ok_or_else(overflow)?;
        let elem = size_of::<T>();
        // every span * elem below stays in range
        xy_span
            .max(param_span)
            .checked_mul(elem)
            .ok_or_else(overflow)?;
        let sized = [
            ("x", *x, xy_span),
            ("mean", *mean, param_span),
            ("variance", *variance, param_span),
            ("scale", *scale, param_span),
            ("bias", *bias, param_span),
            ("y", *y, xy_span),
        ];
        for (label, mem, span) in sized {
            if mem.size_bytes() < span * elem {
                return Err(TuneError::Unsupported(format!(
                    "{label} holds {} bytes, {} needed",
                    mem.size_bytes(),
                    span * elem
                )));
            }
            if mem.device_buffer().addr() % align_of::<T>() != 0 {
                return Err(TuneError::Unsupported(format!(
                    "{label} is not aligned for {}",
                    T::NAME
                )));
            }
        }

        Ok(Self {
            lengths: problem.lengths().to_vec(),
            xy_strides: problem.xy_strides().to_vec(),
            param_strides: problem.aligned_param_strides().to_vec(),
            xy_span,
            param_span,
            x: x.device_buffer(),
            mean: mean.device_buffer(),
            variance: variance.device_buffer(),
            scale: scale.device_buffer(),
            bias: bias.device_buffer(),
            y: y.device_buffer(),
            epsilon: T::from_f64(problem.epsilon()),
            host_accessible: sized.iter().all(|(_, mem, _)| mem.is_host_accessible()),
            buffers: PhantomData,
        })
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn xy_strides(&self) -> &[usize] {
        &self.xy_strides
    }

    /// Aligned strides shared by all four side parameters.
    pub fn param_strides(&self) -> &[usize] {
        &self.param_strides
    }

    pub fn num_elements(&self) -> usize {
        self.lengths.iter().product()
    }

    /// Elements addressable through the full-rank strides.
    pub fn xy_span(&self) -> usize {
        self.xy_span
    }

    /// Elements addressable through the aligned parameter strides.
    pub fn param_span(&self) -> usize {
        self.param_span
    }

    pub fn epsilon(&self) -> T {
        self.epsilon
    }

    pub fn is_host_accessible(&self) -> bool {
        self.host_accessible
    }

    /// Borrows the bound buffers as host slices.
    ///
    /// # Safety
    /// The argument must be host accessible, and no other view of the
    /// output may exist while the returned one does.
    pub(crate) unsafe fn host_views(&self) -> HostViews<'_, T> {
        let view = |ptr: DevicePtr, len: usize| unsafe {
            core::slice::from_raw_parts(ptr.as_ptr() as *const T, len)
        };
        HostViews {
            x: view(self.x, self.xy_span),
            mean: view(self.mean, self.param_span),
            variance: view(self.variance, self.param_span),
            scale: view(self.scale, self.param_span),
            bias: view(self.bias, self.param_span),
            y: unsafe { core::slice::from_raw_parts_mut(self.y.as_ptr() as *mut T, self.xy_span) },
        }
    }
}

/// The element-wise transform itself.
#[inline(always)]
pub fn normalize_one<T: Element>(x: T, mean: T, variance: T, scale: T, bias: T, epsilon: T) -> T {
    (x - mean) / (variance + epsilon).sqrt() * scale + bias
}
