//! CPU batch-norm inference kernels.
//!
//! - [`NaiveNormalize`] walks every index with an odometer over arbitrary
//!   strides. It supports any host-accessible problem and serves as the
//!   always-available fallback.
//! - [`TiledNormalize`] splits densely packed tensors into blocks of rows
//!   and processes each block on the `rayon` pool, in fixed-width vectors
//!   along the innermost axis. Each instance is one (rows per task, vector
//!   width) configuration; an instance declines problems whose innermost
//!   extent is not a multiple of its vector width.

use rayon::prelude::*;

use super::{BatchNormInfer, NormalizeArgument, normalize_one};
use crate::element::Element;
use crate::error::TuneError;
use crate::op::{Bindings, Candidate};
use crate::problem::{ProblemDescriptor, packed_strides};
use crate::stream::{StreamConfig, launch_and_time};

/// `(rows_per_task, vector)` pairs registered for [`TiledNormalize`], in order.
pub const TILE_CONFIGS: &[(usize, usize)] = &[(1, 1), (8, 4), (32, 8)];

/// Strided single-threaded kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveNormalize;

impl<T: Element, const RANK: usize> Candidate<BatchNormInfer<T, RANK>> for NaiveNormalize {
    fn name(&self) -> String {
        "CpuNaiveNormalize".to_string()
    }

    fn bind<'a>(
        &self,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'a>,
    ) -> Result<NormalizeArgument<'a, T>, TuneError> {
        NormalizeArgument::bind(RANK, problem, bindings)
    }

    fn supports(&self, argument: &NormalizeArgument<'_, T>) -> bool {
        argument.is_host_accessible()
    }

    fn run(&self, argument: &NormalizeArgument<'_, T>, stream: &StreamConfig) -> Result<f64, TuneError> {
        if !argument.is_host_accessible() {
            return Err(TuneError::Unsupported("buffers are not host accessible".into()));
        }
        // bound buffers outlive the argument and y is viewed only here
        let views = unsafe { argument.host_views() };
        let lengths = argument.lengths();
        let xy_strides = argument.xy_strides();
        let param_strides = argument.param_strides();
        let eps = argument.epsilon();

        launch_and_time(stream, || {
            for_each_offset(lengths, xy_strides, param_strides, |xy, p| {
                views.y[xy] = normalize_one(
                    views.x[xy],
                    views.mean[p],
                    views.variance[p],
                    views.scale[p],
                    views.bias[p],
                    eps,
                );
            });
            Ok(())
        })
    }
}

/// Calls `f(xy_offset, param_offset)` for every index in row-major order.
fn for_each_offset<F>(lengths: &[usize], xy_strides: &[usize], param_strides: &[usize], mut f: F)
where
    F: FnMut(usize, usize),
{
    let total: usize = lengths.iter().product();
    let rank = lengths.len();
    let mut index = vec![0usize; rank];
    let (mut xy, mut p) = (0usize, 0usize);

    for _ in 0..total {
        f(xy, p);
        for d in (0..rank).rev() {
            index[d] += 1;
            xy += xy_strides[d];
            p += param_strides[d];
            if index[d] < lengths[d] {
                break;
            }
            xy -= xy_strides[d] * lengths[d];
            p -= param_strides[d] * lengths[d];
            index[d] = 0;
        }
    }
}

/// Row-blocked, vectorised kernel for packed tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledNormalize {
    rows_per_task: usize,
    vector: usize,
}

impl TiledNormalize {
    pub fn new(rows_per_task: usize, vector: usize) -> Self {
        Self {
            rows_per_task: rows_per_task.max(1),
            vector: vector.max(1),
        }
    }

    pub fn rows_per_task(&self) -> usize {
        self.rows_per_task
    }

    pub fn vector(&self) -> usize {
        self.vector
    }
}

impl<T: Element, const RANK: usize> Candidate<BatchNormInfer<T, RANK>> for TiledNormalize {
    fn name(&self) -> String {
        format!(
            "CpuTiledNormalize<RowsPerTask_{}, VectorSize_{}>",
            self.rows_per_task, self.vector
        )
    }

    fn bind<'a>(
        &self,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'a>,
    ) -> Result<NormalizeArgument<'a, T>, TuneError> {
        NormalizeArgument::bind(RANK, problem, bindings)
    }

    fn supports(&self, argument: &NormalizeArgument<'_, T>) -> bool {
        let lengths = argument.lengths();
        let Some(&inner) = lengths.last() else {
            return false;
        };
        argument.is_host_accessible()
            && argument.num_elements() > 0
            && inner % self.vector == 0
            && argument.xy_strides() == packed_strides(lengths).as_slice()
    }

    fn run(&self, argument: &NormalizeArgument<'_, T>, stream: &StreamConfig) -> Result<f64, TuneError> {
        if !<Self as Candidate<BatchNormInfer<T, RANK>>>::supports(self, argument) {
            return Err(TuneError::Unsupported(format!(
                "{} cannot run this argument",
                <Self as Candidate<BatchNormInfer<T, RANK>>>::name(self)
            )));
        }
        // bound buffers outlive the argument and y is viewed only here
        let views = unsafe { argument.host_views() };
        let (x, mean, variance, scale, bias, y) = (
            views.x,
            views.mean,
            views.variance,
            views.scale,
            views.bias,
            views.y,
        );

        let lengths = argument.lengths();
        let rank = lengths.len();
        let inner = lengths[rank - 1];
        let param_strides = argument.param_strides();
        let (outer_lengths, outer_strides) = (&lengths[..rank - 1], &param_strides[..rank - 1]);
        let inner_stride = param_strides[rank - 1];
        let eps = argument.epsilon();
        let (rows_per_task, vector) = (self.rows_per_task, self.vector);
        let block = inner.saturating_mul(rows_per_task);

        launch_and_time(stream, || {
            y.par_chunks_mut(block)
                .zip(x.par_chunks(block))
                .enumerate()
                .for_each(|(task, (y_block, x_block))| {
                    let rows = y_block
                        .chunks_exact_mut(inner)
                        .zip(x_block.chunks_exact(inner));
                    for (r, (y_row, x_row)) in rows.enumerate() {
                        let base = row_offset(task * rows_per_task + r, outer_lengths, outer_strides);
                        let lanes = y_row
                            .chunks_exact_mut(vector)
                            .zip(x_row.chunks_exact(vector));
                        for (v, (y_vec, x_vec)) in lanes.enumerate() {
                            let col = v * vector;
                            for (lane, (out, &xv)) in y_vec.iter_mut().zip(x_vec).enumerate() {
                                let p = base + (col + lane) * inner_stride;
                                *out = normalize_one(xv, mean[p], variance[p], scale[p], bias[p], eps);
                            }
                        }
                    }
                });
            Ok(())
        })
    }
}

/// Offset of outer row `row` (row-major over `lengths`) under `strides`.
fn row_offset(row: usize, lengths: &[usize], strides: &[usize]) -> usize {
    let mut rem = row;
    let mut offset = 0;
    for (&len, &stride) in lengths.iter().zip(strides).rev() {
        offset += (rem % len) * stride;
        rem /= len;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odometer_visits_strided_offsets_in_order() {
        let mut seen = Vec::new();
        // 2x3 tensor stored transposed, params per column
        for_each_offset(&[2, 3], &[1, 2], &[0, 1], |xy, p| seen.push((xy, p)));
        assert_eq!(seen, vec![(0, 0), (2, 1), (4, 2), (1, 0), (3, 1), (5, 2)]);
    }

    #[test]
    fn odometer_handles_scalars_and_empty_tensors() {
        let mut calls = 0;
        for_each_offset(&[], &[], &[], |_, _| calls += 1);
        assert_eq!(calls, 1);
        for_each_offset(&[4, 0], &[0, 1], &[0, 1], |_, _| calls += 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn row_offsets_follow_aligned_strides() {
        // [N, C, W] with per-C parameters: rows enumerate (n, c)
        let lengths = [2, 3];
        let strides = [0, 1];
        let offsets: Vec<usize> = (0..6).map(|r| row_offset(r, &lengths, &strides)).collect();
        assert_eq!(offsets, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn tiled_names_encode_configuration() {
        let tiled = TiledNormalize::new(8, 4);
        let name = <TiledNormalize as Candidate<BatchNormInfer<f32, 4>>>::name(&tiled);
        assert_eq!(name, "CpuTiledNormalize<RowsPerTask_8, VectorSize_4>");
        assert_eq!((tiled.rows_per_task(), tiled.vector()), (8, 4));
        assert_eq!(TiledNormalize::new(0, 0), TiledNormalize::new(1, 1));
    }
}
